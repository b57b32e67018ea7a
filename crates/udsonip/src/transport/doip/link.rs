//! DoIP TCP link to a diagnostic gateway

use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use doip_definitions::payload::{
    ActivationCode, ActivationType, AliveCheckRequest, AliveCheckResponse, DiagnosticMessage,
    DoipPayload, RoutingActivationRequest,
};
use doip_sockets::tcp::TcpStream as DoIpTcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::address::LogicalAddress;
use crate::config::GatewayConfig;
use crate::transport::{IncomingFrame, LinkConnector, TransportError, TransportLink};

const CONNECT_ATTEMPTS: u32 = 3;
const CONNECT_BACKOFF: Duration = Duration::from_secs(1);
/// How long the pump holds the stream before letting a sender in
const PUMP_SLICE: Duration = Duration::from_millis(100);

type SharedStream = Arc<Mutex<Option<DoIpTcpStream>>>;

async fn next_payload(stream: &mut DoIpTcpStream) -> Result<Option<DoipPayload>, TransportError> {
    stream
        .read()
        .await
        .transpose()
        .map(|msg| msg.map(|m| m.payload))
        .map_err(|e| TransportError::ReceiveFailed(e.to_string()))
}

async fn write_payload(stream: &mut DoIpTcpStream, payload: DoipPayload) -> Result<(), TransportError> {
    stream
        .send(payload)
        .await
        .map_err(|e| TransportError::SendFailed(e.to_string()))
}

fn activation_request(config: &GatewayConfig) -> DoipPayload {
    let activation_type = if config.activation_type == 0x01 {
        ActivationType::WwhObd
    } else {
        ActivationType::Default
    };
    DoipPayload::RoutingActivationRequest(RoutingActivationRequest {
        source_address: config.source_address.to_be_bytes(),
        activation_type,
        buffer: [0; 4],
    })
}

fn check_activation(host: &str, reply: DoipPayload) -> Result<(), TransportError> {
    match reply {
        DoipPayload::RoutingActivationResponse(resp) => match resp.activation_code {
            ActivationCode::SuccessfullyActivated
            | ActivationCode::ActivatedConfirmationRequired => Ok(()),
            denied => Err(TransportError::connect(
                host,
                format!("routing activation denied: {:?}", denied),
            )),
        },
        DoipPayload::GenericNack(nack) => Err(TransportError::ProtocolError(format!(
            "routing activation rejected with {:?}",
            nack.nack_code
        ))),
        _ => Err(TransportError::ProtocolError(
            "expected routing activation response".to_string(),
        )),
    }
}

/// Moves diagnostic frames from the socket into the link's queue and
/// answers the gateway's alive checks
async fn pump_frames(
    stream: SharedStream,
    online: Arc<AtomicBool>,
    frames: mpsc::UnboundedSender<IncomingFrame>,
    tester: LogicalAddress,
) {
    loop {
        if !online.load(Ordering::SeqCst) {
            return;
        }

        let outcome = {
            let mut slot = stream.lock().await;
            let Some(conn) = slot.as_mut() else { return };
            match tokio::time::timeout(PUMP_SLICE, next_payload(conn)).await {
                Err(_) => Ok(true),
                Ok(Err(e)) => Err(e),
                Ok(Ok(None)) => Ok(false),
                Ok(Ok(Some(DoipPayload::DiagnosticMessage(msg)))) => {
                    let ecu = LogicalAddress::from_be_bytes(msg.source_address);
                    let _ = frames.send(IncomingFrame::new(ecu, msg.message.to_vec()));
                    Ok(true)
                }
                Ok(Ok(Some(DoipPayload::AliveCheckRequest(_)))) => {
                    let answer = DoipPayload::AliveCheckResponse(AliveCheckResponse {
                        source_address: tester.to_be_bytes(),
                    });
                    write_payload(conn, answer).await.map(|_| true)
                }
                Ok(Ok(Some(DoipPayload::DiagnosticMessageNack(nack)))) => {
                    warn!(code = ?nack.nack_code, "Gateway refused diagnostic message");
                    Ok(true)
                }
                Ok(Ok(Some(_))) => Ok(true),
            }
        };

        match outcome {
            Ok(true) => tokio::task::yield_now().await,
            Ok(false) => {
                warn!("Gateway closed the DoIP connection");
                online.store(false, Ordering::SeqCst);
                return;
            }
            Err(e) => {
                error!(%e, "DoIP link failed");
                online.store(false, Ordering::SeqCst);
                return;
            }
        }
    }
}

async fn send_alive_checks(stream: SharedStream, online: Arc<AtomicBool>, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.tick().await;
    while online.load(Ordering::SeqCst) {
        ticker.tick().await;
        let mut slot = stream.lock().await;
        if let Some(conn) = slot.as_mut() {
            if let Err(e) = write_payload(conn, DoipPayload::AliveCheckRequest(AliveCheckRequest {})).await {
                debug!(%e, "Alive check not sent");
            }
        }
    }
}

/// TCP data channel to one DoIP gateway
///
/// Diagnostic messages carry their target address, so one link serves
/// every ECU routed by the gateway.
pub struct DoIpLink {
    host: String,
    config: GatewayConfig,
    stream: SharedStream,
    online: Arc<AtomicBool>,
    frames_tx: mpsc::UnboundedSender<IncomingFrame>,
    frames_rx: Mutex<mpsc::UnboundedReceiver<IncomingFrame>>,
    workers: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl DoIpLink {
    /// Connect to the gateway at `host` and activate routing
    pub async fn connect(host: impl Into<String>, config: &GatewayConfig) -> Result<Self, TransportError> {
        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        let link = Self {
            host: host.into(),
            config: config.clone(),
            stream: Arc::new(Mutex::new(None)),
            online: Arc::new(AtomicBool::new(false)),
            frames_tx,
            frames_rx: Mutex::new(frames_rx),
            workers: parking_lot::Mutex::new(Vec::new()),
        };
        link.establish().await?;
        Ok(link)
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// Open the socket, retrying a few times before giving up
    async fn establish(&self) -> Result<(), TransportError> {
        let mut attempt = 1;
        loop {
            match self.open_once().await {
                Ok(()) => return Ok(()),
                Err(e) if attempt < CONNECT_ATTEMPTS => {
                    warn!(host = %self.host, attempt, %e, "DoIP connect failed, retrying");
                    attempt += 1;
                    tokio::time::sleep(CONNECT_BACKOFF).await;
                }
                Err(e) => {
                    error!(host = %self.host, attempts = attempt, %e, "Giving up on DoIP gateway");
                    return Err(e);
                }
            }
        }
    }

    async fn open_once(&self) -> Result<(), TransportError> {
        let addr = format!("{}:{}", self.host, self.config.port);
        let connect_timeout = Duration::from_millis(self.config.connect_timeout_ms);
        debug!(%addr, "Opening DoIP connection");

        let mut conn = tokio::time::timeout(connect_timeout, DoIpTcpStream::connect(&addr))
            .await
            .map_err(|_| TransportError::Timeout(connect_timeout))?
            .map_err(|e| TransportError::connect(addr.clone(), e))?;

        write_payload(&mut conn, activation_request(&self.config)).await?;
        let activation_timeout = Duration::from_millis(self.config.activation_timeout_ms);
        let reply = tokio::time::timeout(activation_timeout, next_payload(&mut conn))
            .await
            .map_err(|_| TransportError::Timeout(activation_timeout))??
            .ok_or(TransportError::ConnectionClosed)?;
        check_activation(&self.host, reply)?;

        *self.stream.lock().await = Some(conn);
        self.online.store(true, Ordering::SeqCst);
        self.spawn_workers();

        info!(%addr, source = %self.config.source_address, "DoIP routing active");
        Ok(())
    }

    fn spawn_workers(&self) {
        let mut workers = self.workers.lock();
        workers.push(tokio::spawn(pump_frames(
            self.stream.clone(),
            self.online.clone(),
            self.frames_tx.clone(),
            self.config.source_address,
        )));
        if self.config.keepalive_interval_secs > 0 {
            workers.push(tokio::spawn(send_alive_checks(
                self.stream.clone(),
                self.online.clone(),
                Duration::from_secs(self.config.keepalive_interval_secs),
            )));
        }
    }

    async fn shutdown(&self) {
        self.online.store(false, Ordering::SeqCst);
        for worker in self.workers.lock().drain(..) {
            worker.abort();
        }
        self.stream.lock().await.take();
    }
}

#[async_trait]
impl TransportLink for DoIpLink {
    async fn send(&self, target: LogicalAddress, payload: &[u8]) -> Result<(), TransportError> {
        if !self.online.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionClosed);
        }

        let message = DoipPayload::DiagnosticMessage(DiagnosticMessage {
            source_address: self.config.source_address.to_be_bytes(),
            target_address: target.to_be_bytes(),
            message: payload.to_vec().into(),
        });

        let mut slot = self.stream.lock().await;
        let conn = slot.as_mut().ok_or(TransportError::ConnectionClosed)?;
        write_payload(conn, message).await?;
        debug!(%target, len = payload.len(), "DoIP diagnostic message sent");
        Ok(())
    }

    async fn receive(&self, timeout: Duration) -> Result<IncomingFrame, TransportError> {
        let mut rx = self.frames_rx.lock().await;
        match tokio::time::timeout(timeout, rx.recv()).await {
            Ok(Some(frame)) => Ok(frame),
            Ok(None) => Err(TransportError::ConnectionClosed),
            Err(_) if self.online.load(Ordering::SeqCst) => Err(TransportError::Timeout(timeout)),
            Err(_) => Err(TransportError::ConnectionClosed),
        }
    }

    async fn is_connected(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    async fn reconnect(&self) -> Result<(), TransportError> {
        self.shutdown().await;
        self.establish().await
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.shutdown().await;
        info!(host = %self.host, "DoIP link closed");
        Ok(())
    }

    fn source_address(&self) -> LogicalAddress {
        self.config.source_address
    }
}

impl Drop for DoIpLink {
    fn drop(&mut self) {
        self.online.store(false, Ordering::SeqCst);
        for worker in self.workers.get_mut().drain(..) {
            worker.abort();
        }
    }
}

/// Opens [`DoIpLink`]s using a shared gateway configuration
#[derive(Debug, Clone)]
pub struct DoIpConnector {
    config: GatewayConfig,
}

impl DoIpConnector {
    pub fn new(config: GatewayConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl LinkConnector for DoIpConnector {
    async fn connect(&self, host: IpAddr) -> Result<Arc<dyn TransportLink>, TransportError> {
        let link = DoIpLink::connect(host.to_string(), &self.config).await?;
        Ok(Arc::new(link))
    }
}

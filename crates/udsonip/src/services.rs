//! UDS service helpers over a bridge or a peer scope

use std::time::Duration;

use async_trait::async_trait;

use crate::bridge::ConnectionBridge;
use crate::codec::{service_id, ServiceRequest, ServiceResponse};
use crate::error::{Result, UdsOnIpError};
use crate::registry::PeerScope;

/// Routine control sub-functions (0x31)
pub mod routine_control_type {
    pub const START: u8 = 0x01;
    pub const STOP: u8 = 0x02;
    pub const REQUEST_RESULTS: u8 = 0x03;
}

/// ReadDTCInformation report type used by [`DiagnosticServices::read_dtc_information`]
const REPORT_DTC_BY_STATUS_MASK: u8 = 0x02;

/// Anything that can carry one request to a bound peer
#[async_trait]
pub trait Requester: Send + Sync {
    async fn request(&self, request: &ServiceRequest, timeout: Duration) -> Result<ServiceResponse>;

    /// Reply timeout used by the [`DiagnosticServices`] helpers
    fn default_timeout(&self) -> Duration;
}

#[async_trait]
impl Requester for ConnectionBridge {
    async fn request(&self, request: &ServiceRequest, timeout: Duration) -> Result<ServiceResponse> {
        ConnectionBridge::request(self, request, timeout).await
    }

    fn default_timeout(&self) -> Duration {
        self.options().request_timeout
    }
}

#[async_trait]
impl<'a> Requester for PeerScope<'a> {
    async fn request(&self, request: &ServiceRequest, timeout: Duration) -> Result<ServiceResponse> {
        PeerScope::request(self, request, timeout).await
    }

    fn default_timeout(&self) -> Duration {
        self.bridge().options().request_timeout
    }
}

fn too_short(what: &str, response: &ServiceResponse) -> UdsOnIpError {
    UdsOnIpError::Malformed(format!(
        "{} response too short: {}",
        what,
        hex::encode(&response.data)
    ))
}

/// Security access levels map onto sub-functions 0x01..=0x7E
fn security_level(level: u8) -> Result<u8> {
    if (1..=0x3F).contains(&level) {
        Ok(level)
    } else {
        Err(UdsOnIpError::InvalidRequest(format!(
            "security access level {} outside 1..=63",
            level
        )))
    }
}

/// Common UDS services, available on every [`Requester`]
#[async_trait]
pub trait DiagnosticServices: Requester {
    async fn send(&self, service: u8, data: Vec<u8>) -> Result<ServiceResponse> {
        let request = ServiceRequest::new(service, data);
        self.request(&request, self.default_timeout()).await
    }

    /// Tester Present (0x3E); with `suppress_response` no reply is awaited
    async fn tester_present(&self, suppress_response: bool) -> Result<()> {
        if suppress_response {
            let request = ServiceRequest::new(service_id::TESTER_PRESENT, vec![0x80]).without_response();
            self.request(&request, self.default_timeout()).await?;
        } else {
            self.send(service_id::TESTER_PRESENT, vec![0x00]).await?;
        }
        Ok(())
    }

    /// Read Data By Identifier (0x22), returning the record without the DID echo
    async fn read_data_by_identifier(&self, did: u16) -> Result<Vec<u8>> {
        let response = self
            .send(service_id::READ_DATA_BY_ID, did.to_be_bytes().to_vec())
            .await?;

        // Response: 0x62 [DID_HI] [DID_LO] [DATA...]
        let [hi, lo, data @ ..] = response.data.as_slice() else {
            return Err(too_short("ReadDataByIdentifier", &response));
        };
        let echoed = u16::from_be_bytes([*hi, *lo]);
        if echoed != did {
            return Err(UdsOnIpError::Malformed(format!(
                "requested DID 0x{:04X}, response carries 0x{:04X}",
                did, echoed
            )));
        }
        Ok(data.to_vec())
    }

    /// Write Data By Identifier (0x2E)
    async fn write_data_by_identifier(&self, did: u16, data: &[u8]) -> Result<()> {
        let mut payload = did.to_be_bytes().to_vec();
        payload.extend_from_slice(data);
        self.send(service_id::WRITE_DATA_BY_ID, payload).await?;
        Ok(())
    }

    /// Diagnostic Session Control (0x10); returns the session parameter record
    async fn diagnostic_session_control(&self, session: u8) -> Result<Vec<u8>> {
        let response = self
            .send(service_id::DIAGNOSTIC_SESSION_CONTROL, vec![session])
            .await?;
        match response.data.split_first() {
            Some((_, params)) => Ok(params.to_vec()),
            None => Err(too_short("DiagnosticSessionControl", &response)),
        }
    }

    /// ECU Reset (0x11)
    async fn ecu_reset(&self, reset_type: u8) -> Result<()> {
        self.send(service_id::ECU_RESET, vec![reset_type]).await?;
        Ok(())
    }

    /// Clear Diagnostic Information (0x14); `group` is a 3-byte DTC group
    async fn clear_diagnostic_information(&self, group: u32) -> Result<()> {
        let [_, high, mid, low] = group.to_be_bytes();
        self.send(service_id::CLEAR_DIAGNOSTIC_INFO, vec![high, mid, low])
            .await?;
        Ok(())
    }

    /// Read DTC Information, report by status mask (0x19 0x02)
    ///
    /// Returns the raw record: availability mask followed by
    /// `[DTC_HI DTC_MID DTC_LO STATUS]` entries.
    async fn read_dtc_information(&self, status_mask: u8) -> Result<Vec<u8>> {
        let response = self
            .send(
                service_id::READ_DTC_INFO,
                vec![REPORT_DTC_BY_STATUS_MASK, status_mask],
            )
            .await?;
        match response.data.split_first() {
            Some((_, record)) => Ok(record.to_vec()),
            None => Err(too_short("ReadDTCInformation", &response)),
        }
    }

    /// Security Access, request seed (0x27, odd sub-function `level * 2 - 1`)
    ///
    /// `level` runs from 1 to 0x3F.
    async fn security_access_request_seed(&self, level: u8) -> Result<Vec<u8>> {
        let sub_function = security_level(level)? * 2 - 1;
        let response = self
            .send(service_id::SECURITY_ACCESS, vec![sub_function])
            .await?;

        // Response: 0x67 [sub_function] [seed...]
        match response.data.split_first() {
            Some((_, seed)) => Ok(seed.to_vec()),
            None => Err(too_short("SecurityAccess seed", &response)),
        }
    }

    /// Security Access, send key (0x27, even sub-function `level * 2`)
    async fn security_access_send_key(&self, level: u8, key: &[u8]) -> Result<()> {
        let mut payload = vec![security_level(level)? * 2];
        payload.extend_from_slice(key);
        self.send(service_id::SECURITY_ACCESS, payload).await?;
        Ok(())
    }

    /// Routine Control (0x31); returns the routine status record
    async fn routine_control(
        &self,
        control_type: u8,
        routine_id: u16,
        params: &[u8],
    ) -> Result<Vec<u8>> {
        let mut payload = vec![control_type];
        payload.extend_from_slice(&routine_id.to_be_bytes());
        payload.extend_from_slice(params);
        let response = self.send(service_id::ROUTINE_CONTROL, payload).await?;

        // Response: 0x71 [control_type] [RID_HI] [RID_LO] [status...]
        if response.data.len() < 3 {
            return Err(too_short("RoutineControl", &response));
        }
        Ok(response.data[3..].to_vec())
    }
}

impl<T: Requester + ?Sized> DiagnosticServices for T {}

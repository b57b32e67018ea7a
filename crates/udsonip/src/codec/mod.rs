//! UDS request/response codec
//!
//! The bridge never interprets diagnostic payloads itself; it hands them to a
//! [`ProtocolCodec`]. [`UdsCodec`] is the ISO 14229 implementation: positive
//! responses echo the request SID + 0x40, negative responses are
//! `0x7F <sid> <nrc>`, and NRC 0x78 means the ECU needs more time.

mod nrc;

use thiserror::Error;

pub use nrc::NegativeResponseCode;

/// Standard UDS service ID constants
pub mod service_id {
    pub const DIAGNOSTIC_SESSION_CONTROL: u8 = 0x10;
    pub const ECU_RESET: u8 = 0x11;
    pub const CLEAR_DIAGNOSTIC_INFO: u8 = 0x14;
    pub const READ_DTC_INFO: u8 = 0x19;
    pub const READ_DATA_BY_ID: u8 = 0x22;
    pub const SECURITY_ACCESS: u8 = 0x27;
    pub const WRITE_DATA_BY_ID: u8 = 0x2E;
    pub const ROUTINE_CONTROL: u8 = 0x31;
    pub const TESTER_PRESENT: u8 = 0x3E;
    pub const NEGATIVE_RESPONSE: u8 = 0x7F;
}

/// Offset added to the request SID in a positive response
pub const POSITIVE_RESPONSE_OFFSET: u8 = 0x40;

/// An outgoing diagnostic request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceRequest {
    pub service_id: u8,
    pub data: Vec<u8>,
    /// Suppress-positive-response requests get no reply
    pub expects_response: bool,
}

impl ServiceRequest {
    pub fn new(service_id: u8, data: impl Into<Vec<u8>>) -> Self {
        Self {
            service_id,
            data: data.into(),
            expects_response: true,
        }
    }

    /// Mark the request as fire-and-forget (e.g. tester present 0x3E 0x80)
    pub fn without_response(mut self) -> Self {
        self.expects_response = false;
        self
    }
}

/// A decoded positive response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceResponse {
    /// Service ID of the request this answers
    pub service_id: u8,
    /// Response bytes after the positive-response SID
    pub data: Vec<u8>,
}

/// Outcome of decoding one response frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    Positive(ServiceResponse),
    Negative {
        service_id: u8,
        nrc: NegativeResponseCode,
    },
    /// NRC 0x78, keep waiting for the final response
    Pending,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("{0}")]
    Malformed(String),

    #[error("unexpected response SID 0x{actual:02X} (expected 0x{expected:02X})")]
    Unexpected { expected: u8, actual: u8 },
}

/// Encodes requests into transport payloads and decodes replies
pub trait ProtocolCodec: Send + Sync {
    fn encode(&self, request: &ServiceRequest) -> Result<Vec<u8>, CodecError>;

    /// Decode `payload` as the reply to `request`
    fn decode(&self, request: &ServiceRequest, payload: &[u8]) -> Result<Decoded, CodecError>;
}

/// ISO 14229 UDS codec
#[derive(Debug, Clone, Copy, Default)]
pub struct UdsCodec;

impl ProtocolCodec for UdsCodec {
    fn encode(&self, request: &ServiceRequest) -> Result<Vec<u8>, CodecError> {
        if request.service_id == service_id::NEGATIVE_RESPONSE {
            return Err(CodecError::Malformed(
                "0x7F is not a request service ID".to_string(),
            ));
        }
        let mut payload = Vec::with_capacity(1 + request.data.len());
        payload.push(request.service_id);
        payload.extend_from_slice(&request.data);
        Ok(payload)
    }

    fn decode(&self, request: &ServiceRequest, payload: &[u8]) -> Result<Decoded, CodecError> {
        let (&sid, rest) = payload
            .split_first()
            .ok_or_else(|| CodecError::Malformed("empty response".to_string()))?;

        if sid == service_id::NEGATIVE_RESPONSE {
            let [service_id, code, ..] = rest else {
                return Err(CodecError::Malformed(
                    "negative response too short".to_string(),
                ));
            };
            if *service_id != request.service_id {
                return Err(CodecError::Unexpected {
                    expected: request.service_id,
                    actual: *service_id,
                });
            }
            let nrc = NegativeResponseCode::from(*code);
            if nrc == NegativeResponseCode::ResponsePending {
                return Ok(Decoded::Pending);
            }
            return Ok(Decoded::Negative {
                service_id: *service_id,
                nrc,
            });
        }

        let expected = request.service_id.wrapping_add(POSITIVE_RESPONSE_OFFSET);
        if sid != expected {
            return Err(CodecError::Unexpected {
                expected,
                actual: sid,
            });
        }

        Ok(Decoded::Positive(ServiceResponse {
            service_id: request.service_id,
            data: rest.to_vec(),
        }))
    }
}

//! Vehicle identification messages (ISO 13400-2 UDP)
//!
//! Header framing is done by the DoIP socket codec; this module maps the
//! identification payloads onto discovery types.

use doip_definitions::payload::{
    ActionCode, DoipPayload, SyncStatus, VehicleAnnouncementMessage,
    VehicleIdentificationRequest, VehicleIdentificationRequestEid,
    VehicleIdentificationRequestVin,
};
use thiserror::Error;

use crate::address::LogicalAddress;

/// Further action code asking the tester for routing activation
pub const ROUTING_ACTIVATION_REQUIRED: u8 = 0x10;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// A well-formed DoIP message of another type (e.g. our own probe)
    #[error("not a vehicle announcement")]
    NotAnnouncement,

    #[error("undecodable datagram: {0}")]
    Undecodable(String),
}

/// Which entities a probe asks to respond
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ProbeFilter {
    #[default]
    Any,
    Eid([u8; 6]),
    Vin([u8; 17]),
}

impl ProbeFilter {
    pub fn to_payload(&self) -> DoipPayload {
        match self {
            Self::Any => {
                DoipPayload::VehicleIdentificationRequest(VehicleIdentificationRequest {})
            }
            Self::Eid(eid) => {
                DoipPayload::VehicleIdentificationRequestEid(VehicleIdentificationRequestEid {
                    eid: *eid,
                })
            }
            Self::Vin(vin) => {
                DoipPayload::VehicleIdentificationRequestVin(VehicleIdentificationRequestVin {
                    vin: *vin,
                })
            }
        }
    }

    /// The filter a probe payload carries, `None` for other payloads
    pub fn from_payload(payload: &DoipPayload) -> Option<Self> {
        match payload {
            DoipPayload::VehicleIdentificationRequest(_) => Some(Self::Any),
            DoipPayload::VehicleIdentificationRequestEid(req) => Some(Self::Eid(req.eid)),
            DoipPayload::VehicleIdentificationRequestVin(req) => Some(Self::Vin(req.vin)),
            _ => None,
        }
    }
}

/// Body of a vehicle identification response / announcement
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Announcement {
    pub vin: [u8; 17],
    pub logical_address: LogicalAddress,
    pub eid: [u8; 6],
    pub gid: [u8; 6],
    pub further_action: u8,
    pub sync_status: Option<u8>,
}

impl Announcement {
    /// Identification responses and announcements share one payload type
    pub fn from_payload(payload: DoipPayload) -> Result<Self, FrameError> {
        match payload {
            DoipPayload::VehicleAnnouncementMessage(vam) => Ok(vam.into()),
            _ => Err(FrameError::NotAnnouncement),
        }
    }

    /// Only the codes defined by ISO 13400-2 survive; reserved values
    /// become "no further action" / "incomplete"
    pub fn to_payload(&self) -> DoipPayload {
        let further_action = if self.further_action == ROUTING_ACTIVATION_REQUIRED {
            ActionCode::RoutingActivationRequired
        } else {
            ActionCode::NoFurtherActionRequired
        };
        let vin_gid_sync = self.sync_status.map(|status| match status {
            0x00 => SyncStatus::VinGidSynchronized,
            _ => SyncStatus::Incomplete,
        });

        DoipPayload::VehicleAnnouncementMessage(VehicleAnnouncementMessage {
            vin: self.vin,
            logical_address: self.logical_address.to_be_bytes(),
            eid: self.eid,
            gid: self.gid,
            further_action,
            vin_gid_sync,
        })
    }
}

impl From<VehicleAnnouncementMessage> for Announcement {
    fn from(vam: VehicleAnnouncementMessage) -> Self {
        Self {
            vin: vam.vin,
            logical_address: LogicalAddress::from_be_bytes(vam.logical_address),
            eid: vam.eid,
            gid: vam.gid,
            further_action: vam.further_action as u8,
            sync_status: vam.vin_gid_sync.map(|status| status as u8),
        }
    }
}

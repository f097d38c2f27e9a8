use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ReferenceType {
    #[default]
    Call,
    Confbridge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Encapsulation {
    #[default]
    Rtp,
    Audiosocket,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Transport {
    #[default]
    Udp,
    Tcp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionType {
    #[default]
    Client,
    Server,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MediaDirection {
    #[default]
    Both,
    In,
    Out,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExternalMediaStatus {
    #[default]
    Running,
    Terminated,
}

/// RTP/media-only leg attached to a call or a confbridge
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ExternalMedia {
    pub id: Uuid,
    pub asterisk_id: String,
    pub channel_id: String,
    /// Bridge created for this leg; empty when it rides on a confbridge's bridge
    pub bridge_id: String,

    pub reference_type: ReferenceType,
    pub reference_id: Uuid,

    pub status: ExternalMediaStatus,

    /// Negotiated PBX side endpoint
    pub local_ip: String,
    pub local_port: u16,

    pub external_host: String,
    pub encapsulation: Encapsulation,
    pub transport: Transport,
    pub connection_type: ConnectionType,
    pub format: String,
    pub direction: MediaDirection,

    pub tm_create: Option<DateTime<Utc>>,
    pub tm_update: Option<DateTime<Utc>>,
    pub tm_delete: Option<DateTime<Utc>>,
}

impl ExternalMedia {
    pub fn is_running(&self) -> bool {
        self.status == ExternalMediaStatus::Running
    }
}

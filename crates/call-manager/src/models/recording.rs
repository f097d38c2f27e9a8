use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::ReferenceType;

/// `initiating → recording → stopping → ended`; a recording the PBX ends on
/// its own skips `stopping`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RecordingStatus {
    #[default]
    Initiating,
    Recording,
    Stopping,
    Ended,
}

/// One recording of a call's channel or a confbridge's bridge.
///
/// The PBX knows the recording by its name, which is the id rendered as a string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Recording {
    pub id: Uuid,
    pub customer_id: Uuid,
    pub activeflow_id: Option<Uuid>,

    pub reference_type: ReferenceType,
    pub reference_id: Uuid,

    pub status: RecordingStatus,
    pub format: String,

    pub asterisk_id: String,
    /// Recorded channel; empty for a confbridge recording
    pub channel_id: String,
    /// Recorded bridge; empty for a call recording
    pub bridge_id: String,

    pub end_of_silence: u64,
    pub end_of_key: String,
    pub duration: u64,

    pub tm_start: Option<DateTime<Utc>>,
    pub tm_end: Option<DateTime<Utc>>,

    pub tm_create: Option<DateTime<Utc>>,
    pub tm_update: Option<DateTime<Utc>>,
    pub tm_delete: Option<DateTime<Utc>>,
}

impl Recording {
    /// Name the PBX uses for this recording
    pub fn name(&self) -> String {
        self.id.to_string()
    }

    pub fn is_ended(&self) -> bool {
        self.status == RecordingStatus::Ended
    }

    /// Still owned by the PBX: not ended and no stop requested
    pub fn is_active(&self) -> bool {
        matches!(self.status, RecordingStatus::Initiating | RecordingStatus::Recording)
    }
}

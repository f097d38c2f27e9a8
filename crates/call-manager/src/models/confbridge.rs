use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConfbridgeType {
    /// Two-party connect; ends when fewer than two members remain
    Connect,
    #[default]
    Conference,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConfbridgeStatus {
    #[default]
    Progressing,
    Terminating,
    Terminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfbridgeFlag {
    NoAutoLeave,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConfbridgeReferenceType {
    #[default]
    Conference,
    Call,
}

/// Conference bridge joining the channels of several calls
///
/// Membership is only changed by the confbridge handler's join and kick paths.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Confbridge {
    pub id: Uuid,
    pub customer_id: Uuid,
    pub activeflow_id: Option<Uuid>,

    pub reference_type: ConfbridgeReferenceType,
    /// Owning conference (or call) id; one live confbridge per reference
    pub reference_id: Uuid,

    pub confbridge_type: ConfbridgeType,
    pub status: ConfbridgeStatus,
    /// PBX node hosting the bridge
    pub asterisk_id: String,
    pub bridge_id: String,
    pub flags: Vec<ConfbridgeFlag>,

    channel_call_ids: HashMap<String, Uuid>,

    pub recording_id: Option<Uuid>,
    pub recording_ids: Vec<Uuid>,
    pub external_media_id: Option<Uuid>,

    pub tm_create: Option<DateTime<Utc>>,
    pub tm_update: Option<DateTime<Utc>>,
    pub tm_delete: Option<DateTime<Utc>>,
}

impl Confbridge {
    pub fn new(
        id: Uuid,
        customer_id: Uuid,
        reference_type: ConfbridgeReferenceType,
        reference_id: Uuid,
        confbridge_type: ConfbridgeType,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            customer_id,
            reference_type,
            reference_id,
            confbridge_type,
            tm_create: Some(now),
            tm_update: Some(now),
            ..Default::default()
        }
    }

    pub fn is_live(&self) -> bool {
        self.status == ConfbridgeStatus::Progressing
    }

    pub fn has_flag(&self, flag: ConfbridgeFlag) -> bool {
        self.flags.contains(&flag)
    }

    /// Snapshot of channel id to call id membership
    pub fn members(&self) -> HashMap<String, Uuid> {
        self.channel_call_ids.clone()
    }

    pub fn member_count(&self) -> usize {
        self.channel_call_ids.len()
    }

    pub fn member_call_ids(&self) -> Vec<Uuid> {
        let mut ids: Vec<Uuid> = self.channel_call_ids.values().copied().collect();
        ids.sort();
        ids
    }

    pub fn contains_call(&self, call_id: Uuid) -> bool {
        self.channel_call_ids.values().any(|id| *id == call_id)
    }

    pub fn channel_of(&self, call_id: Uuid) -> Option<String> {
        self.channel_call_ids
            .iter()
            .find(|(_, id)| **id == call_id)
            .map(|(channel_id, _)| channel_id.clone())
    }

    pub(crate) fn add_member(&mut self, channel_id: impl Into<String>, call_id: Uuid) {
        self.channel_call_ids.insert(channel_id.into(), call_id);
    }

    pub(crate) fn remove_member(&mut self, call_id: Uuid) -> Option<String> {
        let channel_id = self.channel_of(call_id)?;
        self.channel_call_ids.remove(&channel_id);
        Some(channel_id)
    }
}

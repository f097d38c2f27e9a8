use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::address::Address;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum RingMethod {
    #[default]
    RingAll,
    /// One destination at a time, in order
    Linear,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum AnswerMethod {
    #[default]
    HangupOthers,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum GroupcallStatus {
    #[default]
    Progressing,
    Hangingup,
    Hangup,
}

/// Fan-out dial correlating sibling calls
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Groupcall {
    pub id: Uuid,
    pub customer_id: Uuid,
    pub flow_id: Uuid,
    pub master_call_id: Option<Uuid>,

    pub source: Address,
    pub destinations: Vec<Address>,

    pub ring_method: RingMethod,
    pub answer_method: AnswerMethod,
    pub status: GroupcallStatus,

    pub call_ids: Vec<Uuid>,
    /// Winner of the answer race; written once
    pub answer_call_id: Option<Uuid>,
    /// Member calls still alive
    pub call_count: usize,
    /// Destination index dialed last (linear ring)
    pub dial_index: usize,

    pub tm_create: Option<DateTime<Utc>>,
    pub tm_update: Option<DateTime<Utc>>,
    pub tm_delete: Option<DateTime<Utc>>,
}

impl Groupcall {
    pub fn is_hangup(&self) -> bool {
        self.status == GroupcallStatus::Hangup
    }

    pub fn has_next_destination(&self) -> bool {
        self.dial_index + 1 < self.destinations.len()
    }
}

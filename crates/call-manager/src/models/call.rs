//! Call record and its lifecycle tables

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::action::Action;
use super::address::Address;
use super::channel::{ChannelCause, ChannelState};

/// Call lifecycle status
///
/// `progressing` means the flow started executing before the channel was
/// answered. `terminating` and `canceling` mean a local hangup was requested
/// after or before answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    #[default]
    Dialing,
    Ringing,
    Progressing,
    Answered,
    Terminating,
    Canceling,
    Terminated,
}

impl CallStatus {
    /// Position on the forward path; local hangup states sit between answered and terminated
    fn rank(self) -> u8 {
        match self {
            CallStatus::Dialing => 0,
            CallStatus::Ringing => 1,
            CallStatus::Progressing => 2,
            CallStatus::Answered => 3,
            CallStatus::Terminating | CallStatus::Canceling => 4,
            CallStatus::Terminated => 5,
        }
    }

    pub fn is_terminal(self) -> bool {
        self == CallStatus::Terminated
    }

    /// Hangup has been requested or completed
    pub fn is_hanging_up(self) -> bool {
        matches!(self, CallStatus::Terminating | CallStatus::Canceling | CallStatus::Terminated)
    }

    pub fn is_answered(self) -> bool {
        self == CallStatus::Answered
    }

    /// Whether the state machine accepts a move from `self` to `next`
    pub fn can_transition_to(self, next: CallStatus) -> bool {
        if self == next || self.is_terminal() {
            return false;
        }
        match next {
            CallStatus::Terminated => true,
            CallStatus::Terminating | CallStatus::Canceling => !self.is_hanging_up(),
            _ => !self.is_hanging_up() && next.rank() > self.rank(),
        }
    }
}

/// Map a PBX channel state onto a call status
pub fn status_by_channel_state(state: ChannelState) -> CallStatus {
    match state {
        ChannelState::Ring | ChannelState::Ringing => CallStatus::Ringing,
        ChannelState::Up | ChannelState::Mute => CallStatus::Answered,
        ChannelState::Down
        | ChannelState::Rsrvd
        | ChannelState::OffHook
        | ChannelState::Dialing
        | ChannelState::Busy
        | ChannelState::DialingOffHook
        | ChannelState::PreRing
        | ChannelState::Unknown => CallStatus::Dialing,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CallDirection {
    #[default]
    Incoming,
    Outgoing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum CallType {
    #[default]
    Flow,
    Conference,
    SipService,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HangupBy {
    Remote,
    Local,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HangupReason {
    Normal,
    Failed,
    Busy,
    Canceled,
    Timeout,
    Noanswer,
    Dialout,
    LostRace,
}

/// Who ended the call, judged by the status the call had when its channel went away
pub fn hangup_by(status: CallStatus) -> HangupBy {
    match status {
        CallStatus::Terminating | CallStatus::Canceling => HangupBy::Local,
        _ => HangupBy::Remote,
    }
}

/// Why the call ended
pub fn hangup_reason(direction: CallDirection, status: CallStatus, cause: ChannelCause) -> HangupReason {
    let before_answer = matches!(
        status,
        CallStatus::Dialing | CallStatus::Ringing | CallStatus::Progressing
    );

    // a groupcall member we hung up because another member answered first
    if hangup_by(status) == HangupBy::Local && cause == ChannelCause::ANSWERED_ELSEWHERE {
        return HangupReason::LostRace;
    }
    if status == CallStatus::Canceling {
        return HangupReason::Canceled;
    }

    match direction {
        CallDirection::Outgoing if before_answer => match cause {
            ChannelCause::NO_ANSWER | ChannelCause::NO_USER_RESPONSE | ChannelCause::CALL_REJECTED => {
                HangupReason::Noanswer
            }
            ChannelCause::USER_BUSY => HangupReason::Busy,
            ChannelCause::NORMAL_CLEARING => HangupReason::Normal,
            ChannelCause::ANSWERED_ELSEWHERE => HangupReason::LostRace,
            ChannelCause::UNALLOCATED | ChannelCause::NO_ROUTE_DESTINATION => HangupReason::Dialout,
            _ => HangupReason::Failed,
        },
        CallDirection::Incoming if before_answer => match cause {
            ChannelCause::NO_ANSWER | ChannelCause::NO_USER_RESPONSE => HangupReason::Noanswer,
            ChannelCause::USER_BUSY => HangupReason::Busy,
            _ => HangupReason::Normal,
        },
        _ => HangupReason::Normal,
    }
}

/// Keys of the call's free-form data bag
pub const DATA_EARLY_EXECUTION: &str = "early_execution";
pub const DATA_EXECUTE_NEXT_MASTER_ON_HANGUP: &str = "execute_next_master_on_hangup";

/// The platform's logical call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Call {
    pub id: Uuid,
    pub customer_id: Uuid,

    pub channel_id: String,
    pub bridge_id: String,

    pub flow_id: Uuid,
    pub activeflow_id: Option<Uuid>,
    pub call_type: CallType,

    pub master_call_id: Option<Uuid>,
    pub chained_call_ids: Vec<Uuid>,
    pub recording_id: Option<Uuid>,
    pub recording_ids: Vec<Uuid>,
    pub external_media_id: Option<Uuid>,
    pub groupcall_id: Option<Uuid>,
    pub confbridge_id: Option<Uuid>,

    pub source: Address,
    pub destination: Address,

    pub status: CallStatus,
    pub data: HashMap<String, String>,

    /// Action currently in flight
    pub action: Option<Action>,
    /// Set while an ActionNext is choosing the next action
    pub action_next_hold: bool,

    pub direction: CallDirection,
    pub hangup_by: Option<HangupBy>,
    pub hangup_reason: Option<HangupReason>,

    pub tm_create: Option<DateTime<Utc>>,
    pub tm_update: Option<DateTime<Utc>>,
    pub tm_ringing: Option<DateTime<Utc>>,
    pub tm_progressing: Option<DateTime<Utc>>,
    pub tm_answer: Option<DateTime<Utc>>,
    pub tm_hangup: Option<DateTime<Utc>>,
    pub tm_delete: Option<DateTime<Utc>>,
}

impl Call {
    pub fn data_flag(&self, key: &str) -> bool {
        self.data.get(key).map(|v| v == "true").unwrap_or(false)
    }

    pub fn set_data_flag(&mut self, key: &str, value: bool) {
        if value {
            self.data.insert(key.to_string(), "true".to_string());
        } else {
            self.data.remove(key);
        }
    }

    pub fn is_early_execution(&self) -> bool {
        self.data_flag(DATA_EARLY_EXECUTION)
    }

    /// Apply a status change, stamping the matching timestamp. Returns false if the move is not allowed.
    pub fn apply_status(&mut self, next: CallStatus, now: DateTime<Utc>) -> bool {
        if !self.status.can_transition_to(next) {
            return false;
        }
        self.status = next;
        self.tm_update = Some(now);
        match next {
            CallStatus::Ringing => self.tm_ringing = Some(now),
            CallStatus::Progressing => self.tm_progressing = Some(now),
            CallStatus::Answered => self.tm_answer = Some(now),
            CallStatus::Terminated => self.tm_hangup = Some(now),
            _ => {}
        }
        true
    }

    pub fn current_action_id(&self) -> Option<Uuid> {
        self.action.as_ref().map(|a| a.id)
    }
}

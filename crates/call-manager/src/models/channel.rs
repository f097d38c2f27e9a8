use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Channel state as reported by the PBX
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ChannelState {
    Down,
    Rsrvd,
    OffHook,
    Dialing,
    Ring,
    Ringing,
    Up,
    Busy,
    #[serde(rename = "Dialing Offhook")]
    DialingOffHook,
    #[serde(rename = "Pre-ring")]
    PreRing,
    Mute,
    #[default]
    #[serde(other)]
    Unknown,
}

/// Q.850 hangup cause carried on a destroyed channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct ChannelCause(pub u16);

impl ChannelCause {
    pub const UNKNOWN: ChannelCause = ChannelCause(0);
    pub const UNALLOCATED: ChannelCause = ChannelCause(1);
    pub const NO_ROUTE_DESTINATION: ChannelCause = ChannelCause(3);
    pub const NORMAL_CLEARING: ChannelCause = ChannelCause(16);
    pub const USER_BUSY: ChannelCause = ChannelCause(17);
    pub const NO_USER_RESPONSE: ChannelCause = ChannelCause(18);
    pub const NO_ANSWER: ChannelCause = ChannelCause(19);
    pub const CALL_REJECTED: ChannelCause = ChannelCause(21);
    pub const ANSWERED_ELSEWHERE: ChannelCause = ChannelCause(26);
    pub const DESTINATION_OUT_OF_ORDER: ChannelCause = ChannelCause(27);
    pub const NORMAL_UNSPECIFIED: ChannelCause = ChannelCause(31);
    pub const CONGESTION: ChannelCause = ChannelCause(34);
    pub const INTERWORKING: ChannelCause = ChannelCause(127);
}

/// What a channel is used for, derived from its dialplan context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ChannelType {
    Call,
    ExternalMedia,
    Recording,
    #[default]
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ChannelDirection {
    Incoming,
    Outgoing,
    #[default]
    None,
}

pub const CONTEXT_CALL_IN: &str = "call-in";
pub const CONTEXT_CALL_OUT: &str = "call-out";
pub const CONTEXT_EXTERNAL_MEDIA: &str = "external-media";
pub const CONTEXT_RECORDING: &str = "recording";

/// Channel variable holding the owning customer of an inbound channel
pub const VAR_CUSTOMER_ID: &str = "VB-CUSTOMER_ID";
/// Channel variable holding the flow to run for an inbound channel
pub const VAR_FLOW_ID: &str = "VB-FLOW_ID";
/// Local RTP address of an external media channel
pub const VAR_UNICAST_LOCAL_ADDRESS: &str = "UNICASTRTP_LOCAL_ADDRESS";
/// Local RTP port of an external media channel
pub const VAR_UNICAST_LOCAL_PORT: &str = "UNICASTRTP_LOCAL_PORT";

/// One live leg on a PBX node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Channel {
    pub id: String,
    /// PBX node that owns this channel
    pub asterisk_id: String,
    pub name: String,
    pub tech: String,
    pub context: String,
    pub source_number: String,
    pub destination_number: String,
    pub state: ChannelState,
    pub data: HashMap<String, String>,
    pub stasis_name: String,
    pub bridge_id: String,
    pub playback_id: String,
    pub hangup_cause: ChannelCause,

    pub tm_create: Option<DateTime<Utc>>,
    pub tm_update: Option<DateTime<Utc>>,
    pub tm_ringing: Option<DateTime<Utc>>,
    pub tm_answer: Option<DateTime<Utc>>,
    pub tm_end: Option<DateTime<Utc>>,
    pub tm_delete: Option<DateTime<Utc>>,
}

impl Channel {
    pub fn new(id: impl Into<String>, asterisk_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            asterisk_id: asterisk_id.into(),
            ..Default::default()
        }
    }

    pub fn is_ended(&self) -> bool {
        self.tm_end.is_some()
    }

    pub fn channel_type(&self) -> ChannelType {
        match self.context.as_str() {
            CONTEXT_CALL_IN | CONTEXT_CALL_OUT => ChannelType::Call,
            c if c.ends_with(CONTEXT_EXTERNAL_MEDIA) => ChannelType::ExternalMedia,
            c if c.ends_with(CONTEXT_RECORDING) => ChannelType::Recording,
            _ => ChannelType::Unknown,
        }
    }

    pub fn direction(&self) -> ChannelDirection {
        match self.context.as_str() {
            CONTEXT_CALL_IN => ChannelDirection::Incoming,
            CONTEXT_CALL_OUT => ChannelDirection::Outgoing,
            _ => ChannelDirection::None,
        }
    }

    pub fn variable(&self, key: &str) -> Option<&str> {
        self.data.get(key).map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_type_from_context() {
        let mut channel = Channel::new("ch-1", "node-1");
        channel.context = "call-in".to_string();
        assert_eq!(channel.channel_type(), ChannelType::Call);
        assert_eq!(channel.direction(), ChannelDirection::Incoming);

        channel.context = "call-external-media".to_string();
        assert_eq!(channel.channel_type(), ChannelType::ExternalMedia);
        assert_eq!(channel.direction(), ChannelDirection::None);
    }

    #[test]
    fn test_state_serde_names() {
        let state: ChannelState = serde_json::from_str("\"Dialing Offhook\"").unwrap();
        assert_eq!(state, ChannelState::DialingOffHook);
        let state: ChannelState = serde_json::from_str("\"Something new\"").unwrap();
        assert_eq!(state, ChannelState::Unknown);
        assert_eq!(serde_json::to_string(&ChannelCause::NORMAL_CLEARING).unwrap(), "16");
    }
}

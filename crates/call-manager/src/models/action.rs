//! Flow actions and their typed options

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{CallManagerError, Result};

/// Id of the synthetic action that ends a flow
pub const ACTION_ID_FINISH: Uuid = Uuid::from_u128(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    Answer,
    Beep,
    Branch,
    ConfbridgeJoin,
    DigitsReceive,
    DigitsSend,
    Echo,
    ExternalMediaStart,
    ExternalMediaStop,
    Goto,
    Hangup,
    Play,
    RecordingStart,
    RecordingStop,
    Sleep,
    StreamEcho,
    Talk,
}

impl ActionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionType::Answer => "answer",
            ActionType::Beep => "beep",
            ActionType::Branch => "branch",
            ActionType::ConfbridgeJoin => "confbridge_join",
            ActionType::DigitsReceive => "digits_receive",
            ActionType::DigitsSend => "digits_send",
            ActionType::Echo => "echo",
            ActionType::ExternalMediaStart => "external_media_start",
            ActionType::ExternalMediaStop => "external_media_stop",
            ActionType::Goto => "goto",
            ActionType::Hangup => "hangup",
            ActionType::Play => "play",
            ActionType::RecordingStart => "recording_start",
            ActionType::RecordingStop => "recording_stop",
            ActionType::Sleep => "sleep",
            ActionType::StreamEcho => "stream_echo",
            ActionType::Talk => "talk",
        }
    }

    /// Action plays media on the call's channel and completes on PlaybackFinished
    pub fn is_playback(&self) -> bool {
        matches!(self, ActionType::Play | ActionType::Talk | ActionType::Beep)
    }
}

/// One step of a flow. Immutable once defined; only `tm_execute` is stamped on dispatch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub action_type: ActionType,
    #[serde(default)]
    pub option: serde_json::Value,
    #[serde(default)]
    pub tm_execute: Option<DateTime<Utc>>,
}

impl Action {
    pub fn new(action_type: ActionType, option: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            action_type,
            option,
            tm_execute: None,
        }
    }

    /// End-of-flow action
    pub fn finish() -> Self {
        Self {
            id: ACTION_ID_FINISH,
            action_type: ActionType::Hangup,
            option: serde_json::Value::Null,
            tm_execute: None,
        }
    }

    pub fn is_finish(&self) -> bool {
        self.id == ACTION_ID_FINISH
    }

    /// Decode the type specific option; a missing option decodes to the default
    pub fn option_as<T: DeserializeOwned + Default>(&self) -> Result<T> {
        if self.option.is_null() {
            return Ok(T::default());
        }
        serde_json::from_value(self.option.clone()).map_err(|e| {
            CallManagerError::invalid_input(format!(
                "invalid option for action {} ({}): {}",
                self.id,
                self.action_type.as_str(),
                e
            ))
        })
    }

    /// Same action and same dispatch instant
    pub fn same_dispatch(&self, other: &Action) -> bool {
        self.id == other.id && self.tm_execute == other.tm_execute
    }

    /// PBX playback id for this dispatch. A flow that loops back to the same
    /// action gets a fresh id on every pass.
    pub fn playback_id(&self) -> String {
        let dispatched = self.tm_execute.map_or(0, |tm| tm.timestamp_micros());
        format!("{}-{}", self.id, dispatched)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlayOption {
    pub stream_urls: Vec<String>,
    /// Upper bound on playback (milliseconds)
    pub duration: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TalkOption {
    pub text: String,
    pub gender: String,
    pub language: String,
    pub duration: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BeepOption {
    pub duration: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EchoOption {
    pub duration: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SleepOption {
    pub duration: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DigitsReceiveOption {
    pub duration: u64,
    /// Number of digits that completes the action
    pub length: usize,
    /// Any of these keys completes the action
    pub key: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DigitsSendOption {
    pub digits: String,
    pub duration: Option<u64>,
    pub interval: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfbridgeJoinOption {
    pub confbridge_id: Uuid,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordingStartOption {
    pub format: String,
    pub end_of_silence: u64,
    pub end_of_key: String,
    pub duration: u64,
    pub beep_start: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExternalMediaStartOption {
    pub external_host: String,
    pub encapsulation: String,
    pub transport: String,
    pub connection_type: String,
    pub format: String,
    pub direction: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HangupOption {
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GotoOption {
    pub target_id: Uuid,
    /// How many times the jump is taken before falling through
    pub loop_count: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BranchOption {
    pub variable: String,
    pub default_target_id: Option<Uuid>,
    pub target_ids: HashMap<String, Uuid>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_option_decoding() {
        let action = Action::new(ActionType::DigitsReceive, json!({"duration": 5000, "length": 3, "key": "#"}));
        let option: DigitsReceiveOption = action.option_as().unwrap();
        assert_eq!(option.length, 3);
        assert_eq!(option.key, "#");

        let action = Action::new(ActionType::Echo, serde_json::Value::Null);
        let option: EchoOption = action.option_as().unwrap();
        assert_eq!(option.duration, None);

        let action = Action::new(ActionType::Sleep, json!({"duration": "soon"}));
        assert!(action.option_as::<SleepOption>().is_err());
    }

    #[test]
    fn test_playback_id_follows_dispatch() {
        let mut action = Action::new(ActionType::Beep, serde_json::Value::Null);
        action.tm_execute = Some(Utc::now());
        let first = action.playback_id();
        assert!(first.starts_with(&action.id.to_string()));
        assert_eq!(action.playback_id(), first);

        action.tm_execute = action.tm_execute.map(|tm| tm + chrono::Duration::milliseconds(5));
        assert_ne!(action.playback_id(), first);
    }

    #[test]
    fn test_action_wire_format() {
        let action: Action = serde_json::from_value(json!({
            "id": "0b8ca0a8-4a26-11ee-9b5a-3f4f6e5b9b41",
            "type": "confbridge_join",
            "option": {"confbridge_id": "1d1e1a5c-4a26-11ee-8a6b-0f8d3c6c2a10"}
        }))
        .unwrap();
        assert_eq!(action.action_type, ActionType::ConfbridgeJoin);
        assert!(action.tm_execute.is_none());
        assert!(Action::finish().is_finish());
    }
}

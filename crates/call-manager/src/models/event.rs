//! PBX event envelope and typed events
//!
//! The PBX control protocol is parsed upstream; what arrives here is a tagged
//! envelope `{ type, asterisk_node_id, payload }`.

use std::collections::HashMap;
use std::fmt;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use super::channel::{Channel, ChannelCause, ChannelState};
use crate::error::Result;

/// Raw event as delivered by the PBX event stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    #[serde(rename = "type")]
    pub event_type: String,
    pub asterisk_node_id: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl EventEnvelope {
    pub fn new(event_type: EventType, node_id: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            event_type: event_type.as_str().to_string(),
            asterisk_node_id: node_id.into(),
            payload,
        }
    }
}

/// Closed set of event tags the dispatcher knows
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventType {
    ChannelCreated,
    ChannelDestroyed,
    ChannelStateChange,
    ChannelDtmfReceived,
    ChannelEnteredBridge,
    ChannelLeftBridge,
    ChannelVarset,
    BridgeCreated,
    BridgeDestroyed,
    PlaybackStarted,
    PlaybackFinished,
    RecordingStarted,
    RecordingFinished,
    StasisStart,
    StasisEnd,
    /// Tag this build does not handle
    Unknown(String),
}

impl EventType {
    pub const KNOWN: [EventType; 15] = [
        EventType::ChannelCreated,
        EventType::ChannelDestroyed,
        EventType::ChannelStateChange,
        EventType::ChannelDtmfReceived,
        EventType::ChannelEnteredBridge,
        EventType::ChannelLeftBridge,
        EventType::ChannelVarset,
        EventType::BridgeCreated,
        EventType::BridgeDestroyed,
        EventType::PlaybackStarted,
        EventType::PlaybackFinished,
        EventType::RecordingStarted,
        EventType::RecordingFinished,
        EventType::StasisStart,
        EventType::StasisEnd,
    ];

    pub fn from_tag(tag: &str) -> Self {
        match tag {
            "ChannelCreated" => EventType::ChannelCreated,
            "ChannelDestroyed" => EventType::ChannelDestroyed,
            "ChannelStateChange" => EventType::ChannelStateChange,
            "ChannelDtmfReceived" => EventType::ChannelDtmfReceived,
            "ChannelEnteredBridge" => EventType::ChannelEnteredBridge,
            "ChannelLeftBridge" => EventType::ChannelLeftBridge,
            "ChannelVarset" => EventType::ChannelVarset,
            "BridgeCreated" => EventType::BridgeCreated,
            "BridgeDestroyed" => EventType::BridgeDestroyed,
            "PlaybackStarted" => EventType::PlaybackStarted,
            "PlaybackFinished" => EventType::PlaybackFinished,
            "RecordingStarted" => EventType::RecordingStarted,
            "RecordingFinished" => EventType::RecordingFinished,
            "StasisStart" => EventType::StasisStart,
            "StasisEnd" => EventType::StasisEnd,
            other => EventType::Unknown(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            EventType::ChannelCreated => "ChannelCreated",
            EventType::ChannelDestroyed => "ChannelDestroyed",
            EventType::ChannelStateChange => "ChannelStateChange",
            EventType::ChannelDtmfReceived => "ChannelDtmfReceived",
            EventType::ChannelEnteredBridge => "ChannelEnteredBridge",
            EventType::ChannelLeftBridge => "ChannelLeftBridge",
            EventType::ChannelVarset => "ChannelVarset",
            EventType::BridgeCreated => "BridgeCreated",
            EventType::BridgeDestroyed => "BridgeDestroyed",
            EventType::PlaybackStarted => "PlaybackStarted",
            EventType::PlaybackFinished => "PlaybackFinished",
            EventType::RecordingStarted => "RecordingStarted",
            EventType::RecordingFinished => "RecordingFinished",
            EventType::StasisStart => "StasisStart",
            EventType::StasisEnd => "StasisEnd",
            EventType::Unknown(tag) => tag.as_str(),
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct CallerId {
    pub name: String,
    pub number: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct DialplanLocation {
    pub context: String,
    pub exten: String,
    pub priority: i64,
}

/// Channel as it appears inside event payloads
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ChannelSnapshot {
    pub id: String,
    pub name: String,
    pub state: ChannelState,
    pub caller: CallerId,
    pub connected: CallerId,
    pub dialplan: DialplanLocation,
    #[serde(rename = "channelvars")]
    pub variables: HashMap<String, String>,
}

impl ChannelSnapshot {
    /// Build the registry record for this snapshot on `node_id`
    pub fn to_channel(&self, node_id: &str) -> Channel {
        let now = Utc::now();
        Channel {
            id: self.id.clone(),
            asterisk_id: node_id.to_string(),
            name: self.name.clone(),
            tech: self.name.split('/').next().unwrap_or_default().to_lowercase(),
            context: self.dialplan.context.clone(),
            source_number: self.caller.number.clone(),
            destination_number: self.dialplan.exten.clone(),
            state: self.state,
            data: self.variables.clone(),
            tm_create: Some(now),
            tm_update: Some(now),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct BridgeSnapshot {
    pub id: String,
    pub technology: String,
    pub bridge_type: String,
    pub channels: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct PlaybackSnapshot {
    pub id: String,
    pub media_uri: String,
    pub target_uri: String,
    pub state: String,
}

impl PlaybackSnapshot {
    /// Channel the playback ran on, from a `channel:<id>` target
    pub fn target_channel_id(&self) -> Option<&str> {
        self.target_uri.strip_prefix("channel:")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct RecordingSnapshot {
    pub name: String,
    pub format: String,
    pub target_uri: String,
    pub state: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ChannelEvent {
    pub channel: ChannelSnapshot,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ChannelDestroyedEvent {
    pub channel: ChannelSnapshot,
    pub cause: ChannelCause,
    pub cause_txt: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct DtmfEvent {
    pub channel: ChannelSnapshot,
    pub digit: String,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct BridgeMemberEvent {
    pub channel: ChannelSnapshot,
    pub bridge: BridgeSnapshot,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct VarsetEvent {
    pub channel: Option<ChannelSnapshot>,
    pub variable: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct BridgeEvent {
    pub bridge: BridgeSnapshot,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct PlaybackEvent {
    pub playback: PlaybackSnapshot,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct RecordingEvent {
    pub recording: RecordingSnapshot,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct StasisStartEvent {
    pub channel: ChannelSnapshot,
    pub args: Vec<String>,
}

/// Decoded event
#[derive(Debug, Clone, PartialEq)]
pub enum PbxEvent {
    ChannelCreated(ChannelEvent),
    ChannelDestroyed(ChannelDestroyedEvent),
    ChannelStateChange(ChannelEvent),
    ChannelDtmfReceived(DtmfEvent),
    ChannelEnteredBridge(BridgeMemberEvent),
    ChannelLeftBridge(BridgeMemberEvent),
    ChannelVarset(VarsetEvent),
    BridgeCreated(BridgeEvent),
    BridgeDestroyed(BridgeEvent),
    PlaybackStarted(PlaybackEvent),
    PlaybackFinished(PlaybackEvent),
    RecordingStarted(RecordingEvent),
    RecordingFinished(RecordingEvent),
    StasisStart(StasisStartEvent),
    StasisEnd(ChannelEvent),
}

impl PbxEvent {
    /// Decode a payload for a known event type. `Ok(None)` for unknown types.
    pub fn decode(event_type: &EventType, payload: serde_json::Value) -> Result<Option<PbxEvent>> {
        use serde_json::from_value;

        let event = match event_type {
            EventType::ChannelCreated => PbxEvent::ChannelCreated(from_value(payload)?),
            EventType::ChannelDestroyed => PbxEvent::ChannelDestroyed(from_value(payload)?),
            EventType::ChannelStateChange => PbxEvent::ChannelStateChange(from_value(payload)?),
            EventType::ChannelDtmfReceived => PbxEvent::ChannelDtmfReceived(from_value(payload)?),
            EventType::ChannelEnteredBridge => PbxEvent::ChannelEnteredBridge(from_value(payload)?),
            EventType::ChannelLeftBridge => PbxEvent::ChannelLeftBridge(from_value(payload)?),
            EventType::ChannelVarset => PbxEvent::ChannelVarset(from_value(payload)?),
            EventType::BridgeCreated => PbxEvent::BridgeCreated(from_value(payload)?),
            EventType::BridgeDestroyed => PbxEvent::BridgeDestroyed(from_value(payload)?),
            EventType::PlaybackStarted => PbxEvent::PlaybackStarted(from_value(payload)?),
            EventType::PlaybackFinished => PbxEvent::PlaybackFinished(from_value(payload)?),
            EventType::RecordingStarted => PbxEvent::RecordingStarted(from_value(payload)?),
            EventType::RecordingFinished => PbxEvent::RecordingFinished(from_value(payload)?),
            EventType::StasisStart => PbxEvent::StasisStart(from_value(payload)?),
            EventType::StasisEnd => PbxEvent::StasisEnd(from_value(payload)?),
            EventType::Unknown(_) => return Ok(None),
        };
        Ok(Some(event))
    }

    pub fn event_type(&self) -> EventType {
        match self {
            PbxEvent::ChannelCreated(_) => EventType::ChannelCreated,
            PbxEvent::ChannelDestroyed(_) => EventType::ChannelDestroyed,
            PbxEvent::ChannelStateChange(_) => EventType::ChannelStateChange,
            PbxEvent::ChannelDtmfReceived(_) => EventType::ChannelDtmfReceived,
            PbxEvent::ChannelEnteredBridge(_) => EventType::ChannelEnteredBridge,
            PbxEvent::ChannelLeftBridge(_) => EventType::ChannelLeftBridge,
            PbxEvent::ChannelVarset(_) => EventType::ChannelVarset,
            PbxEvent::BridgeCreated(_) => EventType::BridgeCreated,
            PbxEvent::BridgeDestroyed(_) => EventType::BridgeDestroyed,
            PbxEvent::PlaybackStarted(_) => EventType::PlaybackStarted,
            PbxEvent::PlaybackFinished(_) => EventType::PlaybackFinished,
            PbxEvent::RecordingStarted(_) => EventType::RecordingStarted,
            PbxEvent::RecordingFinished(_) => EventType::RecordingFinished,
            PbxEvent::StasisStart(_) => EventType::StasisStart,
            PbxEvent::StasisEnd(_) => EventType::StasisEnd,
        }
    }
}

/// Envelope for a ChannelDestroyed the registry raises itself
pub fn synthetic_channel_destroyed(channel: &Channel, cause: ChannelCause) -> Result<EventEnvelope> {
    let payload = ChannelDestroyedEvent {
        channel: ChannelSnapshot {
            id: channel.id.clone(),
            name: channel.name.clone(),
            state: channel.state,
            dialplan: DialplanLocation {
                context: channel.context.clone(),
                ..Default::default()
            },
            ..Default::default()
        },
        cause,
        cause_txt: "health check exhausted".to_string(),
    };
    Ok(EventEnvelope::new(
        EventType::ChannelDestroyed,
        channel.asterisk_id.clone(),
        serde_json::to_value(payload)?,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_unknown_tag_round_trips_name() {
        let event_type = EventType::from_tag("ChannelHold");
        assert_eq!(event_type, EventType::Unknown("ChannelHold".to_string()));
        assert_eq!(event_type.as_str(), "ChannelHold");
        assert!(PbxEvent::decode(&event_type, json!({})).unwrap().is_none());
    }

    #[test]
    fn test_known_tags() {
        for event_type in EventType::KNOWN.iter() {
            assert_eq!(&EventType::from_tag(event_type.as_str()), event_type);
        }
    }

    #[test]
    fn test_decode_channel_destroyed() {
        let payload = json!({
            "channel": {
                "id": "1589522573.1",
                "name": "PJSIP/call-in-00000001",
                "state": "Up",
                "dialplan": {"context": "call-in", "exten": "1000", "priority": 1}
            },
            "cause": 16,
            "cause_txt": "Normal Clearing"
        });
        let event = PbxEvent::decode(&EventType::ChannelDestroyed, payload).unwrap().unwrap();
        match event {
            PbxEvent::ChannelDestroyed(ev) => {
                assert_eq!(ev.cause, ChannelCause::NORMAL_CLEARING);
                let channel = ev.channel.to_channel("node-1");
                assert_eq!(channel.asterisk_id, "node-1");
                assert_eq!(channel.tech, "pjsip");
                assert_eq!(channel.context, "call-in");
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_decode_malformed_payload() {
        let payload = json!({"channel": "not-an-object"});
        assert!(PbxEvent::decode(&EventType::ChannelCreated, payload).is_err());
    }

    #[test]
    fn test_playback_target() {
        let playback = PlaybackSnapshot {
            target_uri: "channel:abc".to_string(),
            ..Default::default()
        };
        assert_eq!(playback.target_channel_id(), Some("abc"));
    }
}

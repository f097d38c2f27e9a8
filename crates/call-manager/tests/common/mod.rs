//! Shared fakes for the call manager behaviour tests
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rvoip_call_manager::action::ActionEngine;
use rvoip_call_manager::call::{CallHandler, OutgoingCallRequest};
use rvoip_call_manager::channel::ChannelHandler;
use rvoip_call_manager::confbridge::ConfbridgeHandler;
use rvoip_call_manager::dispatcher::EventDispatcher;
use rvoip_call_manager::external_media::ExternalMediaHandler;
use rvoip_call_manager::flow::{MemoryFlowRepository, MemoryVariableStore};
use rvoip_call_manager::groupcall::GroupcallHandler;
use rvoip_call_manager::listen::ListenHandler;
use rvoip_call_manager::models::channel::{VAR_UNICAST_LOCAL_ADDRESS, VAR_UNICAST_LOCAL_PORT};
use rvoip_call_manager::models::{Action, Address, Call, Channel, ChannelCause, EventEnvelope, EventType};
use rvoip_call_manager::pbx::{ExternalMediaChannelRequest, OriginateRequest, PbxClient, RecordRequest};
use rvoip_call_manager::recording::RecordingHandler;
use rvoip_call_manager::store::MemoryDatabase;
use rvoip_call_manager::transport::{Command, Requester};
use rvoip_call_manager::{CallManagerConfig, CallManagerError, Result, ServiceContext};
use rvoip_infra_common::TaskManager;
use serde_json::{json, Value};
use uuid::Uuid;

pub const NODE: &str = "node-1";

/// One control command the PBX received
#[derive(Debug, Clone, PartialEq)]
pub enum PbxOp {
    ChannelCreate { channel_id: String, endpoint: String, app_args: String },
    ChannelGet { channel_id: String },
    Answer { channel_id: String },
    Ring { channel_id: String },
    Hangup { channel_id: String, cause: ChannelCause },
    Play { channel_id: String, playback_id: String, urls: Vec<String> },
    PlaybackStop { playback_id: String },
    DtmfSend { channel_id: String, digits: String },
    Continue { channel_id: String, context: String },
    Record { channel_id: String, name: String },
    RecordingStop { name: String },
    ExternalMediaCreate { channel_id: String, external_host: String },
    BridgeCreate { bridge_id: String },
    BridgeDelete { bridge_id: String },
    BridgeAdd { bridge_id: String, channel_id: String },
    BridgeRemove { bridge_id: String, channel_id: String },
    BridgeRecord { bridge_id: String },
}

/// PBX that records every command and fails on request
#[derive(Default)]
pub struct FakePbx {
    ops: Mutex<Vec<PbxOp>>,
    lookup_failures: AtomicUsize,
    fail_originate: AtomicBool,
    fail_hangup: AtomicBool,
    fail_record: AtomicBool,
}

impl FakePbx {
    pub fn ops(&self) -> Vec<PbxOp> {
        self.ops.lock().clone()
    }

    pub fn count(&self, f: impl Fn(&PbxOp) -> bool) -> usize {
        self.ops.lock().iter().filter(|op| f(op)).count()
    }

    pub fn hangups(&self) -> Vec<(String, ChannelCause)> {
        self.ops
            .lock()
            .iter()
            .filter_map(|op| match op {
                PbxOp::Hangup { channel_id, cause } => Some((channel_id.clone(), *cause)),
                _ => None,
            })
            .collect()
    }

    pub fn originated(&self) -> Vec<String> {
        self.ops
            .lock()
            .iter()
            .filter_map(|op| match op {
                PbxOp::ChannelCreate { channel_id, .. } => Some(channel_id.clone()),
                _ => None,
            })
            .collect()
    }

    /// Make the next `n` channel lookups fail
    pub fn fail_lookups(&self, n: usize) {
        self.lookup_failures.store(n, Ordering::SeqCst);
    }

    pub fn fail_originate(&self, fail: bool) {
        self.fail_originate.store(fail, Ordering::SeqCst);
    }

    pub fn fail_hangup(&self, fail: bool) {
        self.fail_hangup.store(fail, Ordering::SeqCst);
    }

    pub fn fail_record(&self, fail: bool) {
        self.fail_record.store(fail, Ordering::SeqCst);
    }

    fn record(&self, op: PbxOp) {
        self.ops.lock().push(op);
    }
}

#[async_trait]
impl PbxClient for FakePbx {
    async fn channel_create(&self, _node_id: &str, request: &OriginateRequest) -> Result<()> {
        self.record(PbxOp::ChannelCreate {
            channel_id: request.channel_id.clone(),
            endpoint: request.endpoint.clone(),
            app_args: request.app_args.clone(),
        });
        if self.fail_originate.load(Ordering::SeqCst) {
            return Err(CallManagerError::pbx("originate rejected"));
        }
        Ok(())
    }

    async fn channel_get(&self, node_id: &str, channel_id: &str) -> Result<Channel> {
        self.record(PbxOp::ChannelGet {
            channel_id: channel_id.to_string(),
        });
        let failing = self
            .lookup_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(CallManagerError::pbx("channel not found"));
        }
        Ok(Channel::new(channel_id, node_id))
    }

    async fn channel_answer(&self, _node_id: &str, channel_id: &str) -> Result<()> {
        self.record(PbxOp::Answer {
            channel_id: channel_id.to_string(),
        });
        Ok(())
    }

    async fn channel_ring(&self, _node_id: &str, channel_id: &str) -> Result<()> {
        self.record(PbxOp::Ring {
            channel_id: channel_id.to_string(),
        });
        Ok(())
    }

    async fn channel_hangup(&self, _node_id: &str, channel_id: &str, cause: ChannelCause) -> Result<()> {
        self.record(PbxOp::Hangup {
            channel_id: channel_id.to_string(),
            cause,
        });
        if self.fail_hangup.load(Ordering::SeqCst) {
            return Err(CallManagerError::pbx("hangup rejected"));
        }
        Ok(())
    }

    async fn channel_play(&self, _node_id: &str, channel_id: &str, playback_id: &str, media_urls: &[String]) -> Result<()> {
        self.record(PbxOp::Play {
            channel_id: channel_id.to_string(),
            playback_id: playback_id.to_string(),
            urls: media_urls.to_vec(),
        });
        Ok(())
    }

    async fn playback_stop(&self, _node_id: &str, playback_id: &str) -> Result<()> {
        self.record(PbxOp::PlaybackStop {
            playback_id: playback_id.to_string(),
        });
        Ok(())
    }

    async fn channel_dtmf_send(
        &self,
        _node_id: &str,
        channel_id: &str,
        digits: &str,
        _duration_ms: u64,
        _interval_ms: u64,
    ) -> Result<()> {
        self.record(PbxOp::DtmfSend {
            channel_id: channel_id.to_string(),
            digits: digits.to_string(),
        });
        Ok(())
    }

    async fn channel_continue(&self, _node_id: &str, channel_id: &str, context: &str, _exten: &str) -> Result<()> {
        self.record(PbxOp::Continue {
            channel_id: channel_id.to_string(),
            context: context.to_string(),
        });
        Ok(())
    }

    async fn channel_record(&self, _node_id: &str, channel_id: &str, request: &RecordRequest) -> Result<()> {
        self.record(PbxOp::Record {
            channel_id: channel_id.to_string(),
            name: request.name.clone(),
        });
        if self.fail_record.load(Ordering::SeqCst) {
            return Err(CallManagerError::pbx("record rejected"));
        }
        Ok(())
    }

    async fn recording_stop(&self, _node_id: &str, recording_name: &str) -> Result<()> {
        self.record(PbxOp::RecordingStop {
            name: recording_name.to_string(),
        });
        Ok(())
    }

    async fn external_media_create(&self, node_id: &str, request: &ExternalMediaChannelRequest) -> Result<Channel> {
        self.record(PbxOp::ExternalMediaCreate {
            channel_id: request.channel_id.clone(),
            external_host: request.external_host.clone(),
        });
        let mut channel = Channel::new(request.channel_id.clone(), node_id);
        channel
            .data
            .insert(VAR_UNICAST_LOCAL_ADDRESS.to_string(), "10.0.0.5".to_string());
        channel.data.insert(VAR_UNICAST_LOCAL_PORT.to_string(), "40000".to_string());
        Ok(channel)
    }

    async fn bridge_create(&self, _node_id: &str, bridge_id: &str, _bridge_type: &str, _name: &str) -> Result<()> {
        self.record(PbxOp::BridgeCreate {
            bridge_id: bridge_id.to_string(),
        });
        Ok(())
    }

    async fn bridge_delete(&self, _node_id: &str, bridge_id: &str) -> Result<()> {
        self.record(PbxOp::BridgeDelete {
            bridge_id: bridge_id.to_string(),
        });
        Ok(())
    }

    async fn bridge_add_channel(&self, _node_id: &str, bridge_id: &str, channel_id: &str) -> Result<()> {
        self.record(PbxOp::BridgeAdd {
            bridge_id: bridge_id.to_string(),
            channel_id: channel_id.to_string(),
        });
        Ok(())
    }

    async fn bridge_remove_channel(&self, _node_id: &str, bridge_id: &str, channel_id: &str) -> Result<()> {
        self.record(PbxOp::BridgeRemove {
            bridge_id: bridge_id.to_string(),
            channel_id: channel_id.to_string(),
        });
        Ok(())
    }

    async fn bridge_record(&self, _node_id: &str, bridge_id: &str, _request: &RecordRequest) -> Result<()> {
        self.record(PbxOp::BridgeRecord {
            bridge_id: bridge_id.to_string(),
        });
        Ok(())
    }
}

/// Requester that keeps everything it is asked to deliver
#[derive(Default)]
pub struct RecordingRequester {
    commands: Mutex<Vec<Command>>,
    delayed: Mutex<Vec<(Command, Duration)>>,
    events: Mutex<Vec<EventEnvelope>>,
}

impl RecordingRequester {
    pub fn commands(&self) -> Vec<Command> {
        self.commands.lock().clone()
    }

    pub fn delayed(&self) -> Vec<(Command, Duration)> {
        self.delayed.lock().clone()
    }

    pub fn events(&self) -> Vec<EventEnvelope> {
        self.events.lock().clone()
    }

    pub fn clear(&self) {
        self.commands.lock().clear();
        self.delayed.lock().clear();
        self.events.lock().clear();
    }

    pub fn channel_health_checks(&self) -> Vec<(String, u32)> {
        self.delayed
            .lock()
            .iter()
            .filter_map(|(command, _)| match command {
                Command::ChannelHealthCheck {
                    channel_id, retry_count, ..
                } => Some((channel_id.clone(), *retry_count)),
                _ => None,
            })
            .collect()
    }

    pub fn action_timeouts(&self) -> Vec<(Uuid, Action, Duration)> {
        self.delayed
            .lock()
            .iter()
            .filter_map(|(command, delay)| match command {
                Command::CallActionTimeout { call_id, action } => Some((*call_id, action.clone(), *delay)),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl Requester for RecordingRequester {
    async fn send_command(&self, command: Command) -> Result<()> {
        self.commands.lock().push(command);
        Ok(())
    }

    async fn send_delayed(&self, command: Command, delay: Duration) -> Result<()> {
        self.delayed.lock().push((command, delay));
        Ok(())
    }

    async fn publish_event(&self, event: EventEnvelope) -> Result<()> {
        self.events.lock().push(event);
        Ok(())
    }
}

/// Service context wired to the fakes
pub struct Harness {
    pub ctx: Arc<ServiceContext>,
    pub pbx: Arc<FakePbx>,
    pub requester: Arc<RecordingRequester>,
    pub flows: Arc<MemoryFlowRepository>,
    pub variables: Arc<MemoryVariableStore>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(CallManagerConfig::default())
    }

    pub fn with_config(mut config: CallManagerConfig) -> Self {
        config.general.default_node_id = NODE.to_string();
        let pbx = Arc::new(FakePbx::default());
        let requester = Arc::new(RecordingRequester::default());
        let flows = Arc::new(MemoryFlowRepository::new());
        let variables = Arc::new(MemoryVariableStore::new());
        let ctx = Arc::new(ServiceContext::new(
            config,
            Arc::new(MemoryDatabase::new()),
            pbx.clone(),
            requester.clone(),
            flows.clone(),
            variables.clone(),
            Arc::new(TaskManager::new("call-manager-test")),
        ));
        Self {
            ctx,
            pbx,
            requester,
            flows,
            variables,
        }
    }

    pub fn channels(&self) -> ChannelHandler {
        ChannelHandler::new(self.ctx.clone())
    }

    pub fn calls(&self) -> CallHandler {
        CallHandler::new(self.ctx.clone())
    }

    pub fn actions(&self) -> ActionEngine {
        ActionEngine::new(self.ctx.clone())
    }

    pub fn groupcalls(&self) -> GroupcallHandler {
        GroupcallHandler::new(self.ctx.clone())
    }

    pub fn confbridges(&self) -> ConfbridgeHandler {
        ConfbridgeHandler::new(self.ctx.clone())
    }

    pub fn external_medias(&self) -> ExternalMediaHandler {
        ExternalMediaHandler::new(self.ctx.clone())
    }

    pub fn recordings(&self) -> RecordingHandler {
        RecordingHandler::new(self.ctx.clone())
    }

    pub fn dispatcher(&self) -> EventDispatcher {
        EventDispatcher::new(self.ctx.clone())
    }

    pub fn listen(&self) -> ListenHandler {
        ListenHandler::new(self.ctx.clone())
    }

    /// Register a flow and return its id
    pub fn flow(&self, actions: Vec<Action>) -> Uuid {
        let flow_id = Uuid::new_v4();
        self.flows.insert(flow_id, actions);
        flow_id
    }

    pub async fn outgoing_call(&self, flow_id: Uuid) -> Call {
        self.calls()
            .create_call_outgoing(OutgoingCallRequest {
                customer_id: Uuid::new_v4(),
                flow_id,
                source: Address::tel("+15550001"),
                destination: Address::tel("+15550002"),
                ..Default::default()
            })
            .await
            .unwrap()
    }

    /// Outgoing call whose channel is registered and answered
    pub async fn answered_call(&self, flow_id: Uuid) -> Call {
        let call = self.outgoing_call(flow_id).await;
        self.dispatch(EventType::StasisStart, stasis_start(&call.channel_id, "call-out", &[]))
            .await;
        self.dispatch(EventType::ChannelStateChange, channel_payload(&call.channel_id, "Up", "call-out"))
            .await;
        self.calls().get(call.id).await.unwrap()
    }

    pub async fn dispatch(&self, event_type: EventType, payload: Value) {
        self.dispatcher()
            .dispatch(EventEnvelope::new(event_type, NODE, payload))
            .await
            .unwrap();
    }
}

pub fn channel_snapshot(id: &str, state: &str, context: &str) -> Value {
    channel_snapshot_with_vars(id, state, context, HashMap::new())
}

pub fn channel_snapshot_with_vars(id: &str, state: &str, context: &str, vars: HashMap<String, String>) -> Value {
    json!({
        "id": id,
        "name": format!("PJSIP/{}", id),
        "state": state,
        "caller": { "name": "", "number": "+15550001" },
        "dialplan": { "context": context, "exten": "+15550002", "priority": 1 },
        "channelvars": vars,
    })
}

pub fn channel_payload(id: &str, state: &str, context: &str) -> Value {
    json!({ "channel": channel_snapshot(id, state, context) })
}

pub fn stasis_start(id: &str, context: &str, vars: &[(&str, &str)]) -> Value {
    let vars = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
    json!({
        "channel": channel_snapshot_with_vars(id, "Ring", "", vars),
        "args": [format!("context={}", context)],
    })
}

pub fn channel_destroyed(id: &str, cause: ChannelCause) -> Value {
    json!({
        "channel": channel_snapshot(id, "Down", ""),
        "cause": cause.0,
        "cause_txt": "",
    })
}

pub fn bridge_member(channel_id: &str, bridge_id: &str) -> Value {
    json!({
        "channel": channel_snapshot(channel_id, "Up", ""),
        "bridge": { "id": bridge_id },
    })
}

pub fn playback(playback_id: &str, channel_id: &str) -> Value {
    json!({
        "playback": {
            "id": playback_id,
            "target_uri": format!("channel:{}", channel_id),
            "state": "done",
        }
    })
}

pub fn recording(name: &str, target_uri: &str, state: &str) -> Value {
    json!({
        "recording": {
            "name": name,
            "format": "wav",
            "target_uri": target_uri,
            "state": state,
        }
    })
}

pub fn dtmf(channel_id: &str, digit: &str) -> Value {
    json!({
        "channel": channel_snapshot(channel_id, "Up", ""),
        "digit": digit,
        "duration_ms": 100,
    })
}

//! Internal self-commands and the requester that delivers them
//!
//! Health checks, action timeouts and deferred flow steps are not timers
//! inside a handler. They are commands handed back to the transport, either
//! now or after a delay, and re-enter through [`crate::CallManager::run_command`]
//! like any other request. Staleness is judged when they arrive.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rvoip_infra_common::TaskManager;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{CallManagerError, Result};
use crate::models::{Action, EventEnvelope};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Command {
    ChannelHealthCheck {
        channel_id: String,
        retry_count: u32,
        retry_count_max: u32,
        delay_ms: u64,
    },
    CallHealthCheck {
        call_id: Uuid,
        retry_count: u32,
        delay_ms: u64,
    },
    CallActionTimeout {
        call_id: Uuid,
        action: Action,
    },
    /// Advance a call's flow. Queued when a chained call that drives its
    /// master hangs up, and sent by peer services.
    CallActionNext {
        call_id: Uuid,
        force: bool,
    },
    GroupcallDialNext {
        groupcall_id: Uuid,
    },
    /// Release a groupcall member. Only peer services send it; member calls
    /// of this service release themselves on hangup.
    GroupcallHangupCall {
        groupcall_id: Uuid,
        call_id: Uuid,
    },
}

impl Command {
    pub fn kind(&self) -> &'static str {
        match self {
            Command::ChannelHealthCheck { .. } => "channel_health_check",
            Command::CallHealthCheck { .. } => "call_health_check",
            Command::CallActionTimeout { .. } => "call_action_timeout",
            Command::CallActionNext { .. } => "call_action_next",
            Command::GroupcallDialNext { .. } => "groupcall_dial_next",
            Command::GroupcallHangupCall { .. } => "groupcall_hangup_call",
        }
    }
}

/// Work delivered back into the service
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Command(Command),
    Event(EventEnvelope),
}

/// Outbound side of the transport
#[async_trait]
pub trait Requester: Send + Sync {
    /// Deliver a command as soon as possible
    async fn send_command(&self, command: Command) -> Result<()>;

    /// Deliver a command after `delay`
    async fn send_delayed(&self, command: Command, delay: Duration) -> Result<()>;

    /// Inject an event as if the PBX had sent it
    async fn publish_event(&self, event: EventEnvelope) -> Result<()>;
}

/// In-process requester: an mpsc queue drained by the call manager, with delays
/// run as tracked tasks
pub struct LocalRequester {
    tx: mpsc::Sender<Inbound>,
    tasks: Arc<TaskManager>,
}

impl LocalRequester {
    pub fn new(tasks: Arc<TaskManager>, capacity: usize) -> (Self, mpsc::Receiver<Inbound>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx, tasks }, rx)
    }

    async fn deliver(&self, inbound: Inbound) -> Result<()> {
        self.tx
            .send(inbound)
            .await
            .map_err(|_| CallManagerError::internal("inbound queue closed"))
    }
}

#[async_trait]
impl Requester for LocalRequester {
    async fn send_command(&self, command: Command) -> Result<()> {
        debug!(command = command.kind(), "queueing command");
        self.deliver(Inbound::Command(command)).await
    }

    async fn send_delayed(&self, command: Command, delay: Duration) -> Result<()> {
        let tx = self.tx.clone();
        let kind = command.kind();
        debug!(command = kind, delay_ms = delay.as_millis() as u64, "scheduling delayed command");
        self.tasks.spawn_delayed(format!("delayed-{}", kind), delay, async move {
            if tx.send(Inbound::Command(command)).await.is_err() {
                warn!(command = kind, "inbound queue closed before delayed command fired");
            }
        })?;
        Ok(())
    }

    async fn publish_event(&self, event: EventEnvelope) -> Result<()> {
        debug!(event_type = %event.event_type, node = %event.asterisk_node_id, "publishing internal event");
        self.deliver(Inbound::Event(event)).await
    }
}

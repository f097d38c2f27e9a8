//! Call manager entry point
//!
//! [`CallManager`] wires the collaborators into a [`ServiceContext`] and
//! drains the inbound queue: PBX events go to the [`EventDispatcher`],
//! self-commands to [`CallManager::run_command`]. Each inbound item runs on
//! its own tracked task.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rvoip_infra_common::{setup_logging, LoggingConfig, TaskManager};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::action::ActionEngine;
use crate::call::CallHandler;
use crate::channel::ChannelHandler;
use crate::config::CallManagerConfig;
use crate::confbridge::ConfbridgeHandler;
use crate::context::ServiceContext;
use crate::dispatcher::EventDispatcher;
use crate::error::{CallManagerError, Result};
use crate::external_media::ExternalMediaHandler;
use crate::flow::{FlowRepository, MemoryFlowRepository, MemoryVariableStore, VariableStore};
use crate::groupcall::GroupcallHandler;
use crate::listen::{ListenHandler, Request, Response};
use crate::models::EventEnvelope;
use crate::monitoring::MetricsSnapshot;
use crate::pbx::PbxClient;
use crate::recording::RecordingHandler;
use crate::store::{Database, MemoryDatabase};
use crate::transport::{Command, Inbound, LocalRequester, Requester};

/// Install the global subscriber from the `logging` section
pub fn init_logging(config: &CallManagerConfig) -> Result<()> {
    let logging = LoggingConfig::from_settings(
        &config.logging.level,
        config.logging.json,
        config.general.service_name.clone(),
    )?;
    setup_logging(logging)?;
    Ok(())
}

pub struct CallManager {
    ctx: Arc<ServiceContext>,
    dispatcher: Arc<EventDispatcher>,
    listen: ListenHandler,
    inbound: Mutex<Option<mpsc::Receiver<Inbound>>>,
}

impl CallManager {
    pub fn builder() -> CallManagerBuilder {
        CallManagerBuilder::new()
    }

    fn from_context(ctx: Arc<ServiceContext>, inbound: Option<mpsc::Receiver<Inbound>>) -> Self {
        Self {
            dispatcher: Arc::new(EventDispatcher::new(ctx.clone())),
            listen: ListenHandler::new(ctx.clone()),
            ctx,
            inbound: Mutex::new(inbound),
        }
    }

    /// Start draining the local inbound queue.
    ///
    /// Only available with the bundled [`LocalRequester`]; an external
    /// transport feeds [`CallManager::dispatch_event`] and
    /// [`CallManager::run_command`] itself.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let Some(mut rx) = self.inbound.lock().take() else {
            return Err(CallManagerError::invalid_state(
                "inbound loop already started or transport is external",
            ));
        };

        let this = self.clone();
        let token = self.ctx.tasks.child_token();
        self.ctx.tasks.spawn_tracked("inbound-loop", async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    inbound = rx.recv() => match inbound {
                        Some(Inbound::Command(command)) => this.spawn_command(command),
                        Some(Inbound::Event(envelope)) => {
                            if let Err(e) = this.dispatcher.spawn_dispatch(envelope) {
                                warn!(error = %e, "could not schedule event");
                            }
                        }
                        None => break,
                    },
                }
            }
            debug!("inbound loop stopped");
        })?;

        self.spawn_lock_pruner()?;

        info!(service = %self.ctx.config.general.service_name, "call manager started");
        Ok(())
    }

    /// Periodically drop identity locks nobody holds
    fn spawn_lock_pruner(&self) -> Result<()> {
        let ctx = self.ctx.clone();
        let token = self.ctx.tasks.child_token();
        let period = self.ctx.config.workers.lock_prune_interval();
        self.ctx.tasks.spawn_tracked("lock-pruner", async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let pruned = ctx.locks.prune();
                        if pruned > 0 {
                            debug!(pruned, remaining = ctx.locks.len(), "idle identity locks dropped");
                        }
                    }
                }
            }
        })?;
        Ok(())
    }

    fn spawn_command(self: &Arc<Self>, command: Command) {
        let this = self.clone();
        let kind = command.kind();
        let spawned = self.ctx.tasks.spawn_tracked(format!("command-{}", kind), async move {
            if let Err(e) = this.run_command(command).await {
                warn!(command = kind, error = %e, "command failed");
            }
        });
        if let Err(e) = spawned {
            warn!(command = kind, error = %e, "could not schedule command");
        }
    }

    /// Advance a call's flow on a tracked task; failures are only logged
    pub fn spawn_action_next(&self, call_id: Uuid, force: bool) -> Result<()> {
        let actions = self.actions();
        self.ctx.tasks.spawn_tracked(format!("action-next-{}", call_id), async move {
            if let Err(e) = actions.action_next(call_id, force).await {
                warn!(call_id = %call_id, error = %e, "detached action next failed");
            }
        })?;
        Ok(())
    }

    /// Execute one internal self-command
    pub async fn run_command(&self, command: Command) -> Result<()> {
        self.ctx.metrics.record_command(command.kind());
        debug!(command = command.kind(), "running command");

        match command {
            Command::ChannelHealthCheck {
                channel_id,
                retry_count,
                retry_count_max,
                delay_ms,
            } => {
                self.channels()
                    .health_check(&channel_id, retry_count, retry_count_max, Duration::from_millis(delay_ms))
                    .await?;
            }
            Command::CallHealthCheck {
                call_id,
                retry_count,
                delay_ms,
            } => {
                self.calls()
                    .health_check(call_id, retry_count, Duration::from_millis(delay_ms))
                    .await?;
            }
            Command::CallActionTimeout { call_id, action } => {
                self.calls().action_timeout(call_id, &action).await?;
            }
            Command::CallActionNext { call_id, force } => {
                self.actions().action_next(call_id, force).await?;
            }
            Command::GroupcallDialNext { groupcall_id } => {
                self.groupcalls().dial_next_destination(groupcall_id).await?;
            }
            Command::GroupcallHangupCall { groupcall_id, call_id } => {
                self.groupcalls().hangup_call(groupcall_id, call_id).await?;
            }
        }
        Ok(())
    }

    pub async fn dispatch_event(&self, envelope: EventEnvelope) -> Result<()> {
        self.dispatcher.dispatch(envelope).await
    }

    pub async fn dispatch_raw(&self, bytes: &[u8]) -> Result<()> {
        self.dispatcher.dispatch_raw(bytes).await
    }

    pub async fn process_request(&self, request: Request) -> Response {
        self.listen.process_request(request).await
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.ctx.metrics.snapshot()
    }

    pub fn context(&self) -> &Arc<ServiceContext> {
        &self.ctx
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

    /// Cancel the inbound loop and every tracked task
    pub async fn shutdown(&self) {
        let stats = self.ctx.tasks.stats();
        info!(
            active_tasks = stats.active_tasks,
            spawned_total = stats.spawned_total,
            "call manager shutting down"
        );
        self.ctx.tasks.shutdown().await;
    }
}

/// Builder for [`CallManager`]
///
/// The PBX client is required. Everything else defaults to the bundled
/// in-memory implementations.
pub struct CallManagerBuilder {
    config: Option<CallManagerConfig>,
    db: Option<Arc<dyn Database>>,
    pbx: Option<Arc<dyn PbxClient>>,
    requester: Option<Arc<dyn Requester>>,
    flows: Option<Arc<dyn FlowRepository>>,
    variables: Option<Arc<dyn VariableStore>>,
}

impl CallManagerBuilder {
    pub fn new() -> Self {
        Self {
            config: None,
            db: None,
            pbx: None,
            requester: None,
            flows: None,
            variables: None,
        }
    }

    pub fn with_config(mut self, config: CallManagerConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn with_database(mut self, db: Arc<dyn Database>) -> Self {
        self.db = Some(db);
        self
    }

    pub fn with_pbx(mut self, pbx: Arc<dyn PbxClient>) -> Self {
        self.pbx = Some(pbx);
        self
    }

    /// Use an external transport instead of the in-process queue
    pub fn with_requester(mut self, requester: Arc<dyn Requester>) -> Self {
        self.requester = Some(requester);
        self
    }

    pub fn with_flow_repository(mut self, flows: Arc<dyn FlowRepository>) -> Self {
        self.flows = Some(flows);
        self
    }

    pub fn with_variable_store(mut self, variables: Arc<dyn VariableStore>) -> Self {
        self.variables = Some(variables);
        self
    }

    pub fn build(self) -> Result<Arc<CallManager>> {
        let config = self.config.unwrap_or_default();
        config.validate()?;

        let pbx = self
            .pbx
            .ok_or_else(|| CallManagerError::config("PBX client not provided"))?;

        let tasks = Arc::new(TaskManager::with_config(
            config.general.service_name.clone(),
            config.workers.max_tasks,
            config.workers.shutdown_timeout(),
        ));

        let (requester, inbound): (Arc<dyn Requester>, _) = match self.requester {
            Some(requester) => (requester, None),
            None => {
                let (requester, rx) = LocalRequester::new(tasks.clone(), config.workers.command_queue_size);
                (Arc::new(requester), Some(rx))
            }
        };

        let ctx = Arc::new(ServiceContext::new(
            config,
            self.db.unwrap_or_else(|| Arc::new(MemoryDatabase::new())),
            pbx,
            requester,
            self.flows.unwrap_or_else(|| Arc::new(MemoryFlowRepository::new())),
            self.variables.unwrap_or_else(|| Arc::new(MemoryVariableStore::new())),
            tasks,
        ));

        Ok(Arc::new(CallManager::from_context(ctx, inbound)))
    }
}

impl Default for CallManagerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

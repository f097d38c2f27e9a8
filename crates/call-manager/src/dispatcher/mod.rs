//! Event dispatcher
//!
//! Decodes PBX event envelopes and routes each one to the handler registered
//! for its type. Unknown types and undecodable payloads are counted and
//! dropped; handler failures are counted and returned to the caller. Events
//! are independent of each other and may be processed concurrently.

mod handlers;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, error, warn};

use crate::context::ServiceContext;
use crate::error::Result;
use crate::models::{EventEnvelope, EventType, PbxEvent};
use crate::monitoring::EventOutcome;

pub use handlers::{parse_stasis_args, EventHandler};
use handlers::*;

pub struct EventDispatcher {
    ctx: Arc<ServiceContext>,
    handlers: HashMap<EventType, Arc<dyn EventHandler>>,
}

impl EventDispatcher {
    pub fn new(ctx: Arc<ServiceContext>) -> Self {
        let bridge_member: Arc<dyn EventHandler> = Arc::new(BridgeMemberHandler { ctx: ctx.clone() });
        let bridge_lifecycle: Arc<dyn EventHandler> = Arc::new(BridgeLifecycleHandler { ctx: ctx.clone() });
        let playback: Arc<dyn EventHandler> = Arc::new(PlaybackHandler { ctx: ctx.clone() });
        let recording: Arc<dyn EventHandler> = Arc::new(RecordingEventHandler { ctx: ctx.clone() });

        let mut handlers: HashMap<EventType, Arc<dyn EventHandler>> = HashMap::new();
        handlers.insert(EventType::ChannelCreated, Arc::new(ChannelCreatedHandler { ctx: ctx.clone() }));
        handlers.insert(EventType::ChannelDestroyed, Arc::new(ChannelDestroyedHandler { ctx: ctx.clone() }));
        handlers.insert(
            EventType::ChannelStateChange,
            Arc::new(ChannelStateChangeHandler { ctx: ctx.clone() }),
        );
        handlers.insert(EventType::ChannelDtmfReceived, Arc::new(DtmfHandler { ctx: ctx.clone() }));
        handlers.insert(EventType::ChannelEnteredBridge, bridge_member.clone());
        handlers.insert(EventType::ChannelLeftBridge, bridge_member);
        handlers.insert(EventType::ChannelVarset, Arc::new(VarsetHandler { ctx: ctx.clone() }));
        handlers.insert(EventType::BridgeCreated, bridge_lifecycle.clone());
        handlers.insert(EventType::BridgeDestroyed, bridge_lifecycle);
        handlers.insert(EventType::PlaybackStarted, playback.clone());
        handlers.insert(EventType::PlaybackFinished, playback);
        handlers.insert(EventType::RecordingStarted, recording.clone());
        handlers.insert(EventType::RecordingFinished, recording);
        handlers.insert(EventType::StasisStart, Arc::new(StasisStartHandler { ctx: ctx.clone() }));
        handlers.insert(EventType::StasisEnd, Arc::new(StasisEndHandler { ctx: ctx.clone() }));

        Self { ctx, handlers }
    }

    pub fn handles(&self, event_type: &EventType) -> bool {
        self.handlers.contains_key(event_type)
    }

    /// Dispatch a serialized envelope. Bytes that are not an envelope are dropped.
    pub async fn dispatch_raw(&self, bytes: &[u8]) -> Result<()> {
        match serde_json::from_slice::<EventEnvelope>(bytes) {
            Ok(envelope) => self.dispatch(envelope).await,
            Err(e) => {
                warn!(error = %e, "dropping malformed event envelope");
                self.ctx
                    .metrics
                    .record_event("", "", EventOutcome::Malformed, Default::default());
                Ok(())
            }
        }
    }

    pub async fn dispatch(&self, envelope: EventEnvelope) -> Result<()> {
        let started = Instant::now();
        let node_id = envelope.asterisk_node_id.as_str();
        let event_type = EventType::from_tag(&envelope.event_type);
        let metrics = &self.ctx.metrics;

        let Some(handler) = self.handlers.get(&event_type) else {
            debug!(event_type = %event_type, node = node_id, "no handler for event type");
            metrics.record_event(node_id, event_type.as_str(), EventOutcome::Unhandled, started.elapsed());
            return Ok(());
        };

        let event = match PbxEvent::decode(&event_type, envelope.payload.clone()) {
            Ok(Some(event)) => event,
            Ok(None) => {
                metrics.record_event(node_id, event_type.as_str(), EventOutcome::Unhandled, started.elapsed());
                return Ok(());
            }
            Err(e) => {
                warn!(event_type = %event_type, node = node_id, error = %e, "dropping undecodable event");
                metrics.record_event(node_id, event_type.as_str(), EventOutcome::Malformed, started.elapsed());
                return Ok(());
            }
        };

        let terminal = matches!(event_type, EventType::ChannelDestroyed | EventType::BridgeDestroyed);
        let result = handler.handle(node_id, event).await;
        if terminal {
            // locks of identities that just ended
            self.ctx.locks.prune();
        }
        let outcome = match &result {
            Ok(()) => EventOutcome::Ok,
            Err(e) => {
                error!(event_type = %event_type, node = node_id, error = %e, "event handler failed");
                EventOutcome::Error
            }
        };
        metrics.record_event(node_id, event_type.as_str(), outcome, started.elapsed());
        result
    }

    /// Dispatch on a tracked task so independent events do not wait on each other
    pub fn spawn_dispatch(self: &Arc<Self>, envelope: EventEnvelope) -> Result<u64> {
        let this = self.clone();
        let name = format!("event-{}", envelope.event_type);
        let id = self.ctx.tasks.spawn_tracked(name, async move {
            let _ = this.dispatch(envelope).await;
        })?;
        Ok(id)
    }
}

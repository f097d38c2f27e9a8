//! One handler per PBX event class

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::debug;

use crate::call::CallHandler;
use crate::channel::ChannelHandler;
use crate::confbridge::ConfbridgeHandler;
use crate::context::ServiceContext;
use crate::error::{CallManagerError, Result};
use crate::external_media::ExternalMediaHandler;
use crate::models::{Channel, PbxEvent};
use crate::recording::RecordingHandler;

#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, node_id: &str, event: PbxEvent) -> Result<()>;
}

/// Registry updates for channels we never saw are not errors
fn tolerate_unknown(result: Result<Channel>) -> Result<Option<Channel>> {
    match result {
        Ok(channel) => Ok(Some(channel)),
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e),
    }
}

fn unexpected(handler: &str, event: &PbxEvent) -> CallManagerError {
    CallManagerError::internal(format!("{} cannot handle {}", handler, event.event_type()))
}

/// Split stasis arguments of the form `key=value,key=value`
pub fn parse_stasis_args(args: &[String]) -> HashMap<String, String> {
    args.iter()
        .flat_map(|arg| arg.split(','))
        .filter_map(|pair| pair.split_once('='))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect()
}

pub struct ChannelCreatedHandler {
    pub ctx: Arc<ServiceContext>,
}

#[async_trait]
impl EventHandler for ChannelCreatedHandler {
    async fn handle(&self, node_id: &str, event: PbxEvent) -> Result<()> {
        let PbxEvent::ChannelCreated(ev) = event else {
            return Err(unexpected("ChannelCreatedHandler", &event));
        };
        ChannelHandler::new(self.ctx.clone())
            .create(ev.channel.to_channel(node_id))
            .await?;
        Ok(())
    }
}

pub struct ChannelDestroyedHandler {
    pub ctx: Arc<ServiceContext>,
}

#[async_trait]
impl EventHandler for ChannelDestroyedHandler {
    async fn handle(&self, node_id: &str, event: PbxEvent) -> Result<()> {
        let PbxEvent::ChannelDestroyed(ev) = event else {
            return Err(unexpected("ChannelDestroyedHandler", &event));
        };
        let id = ev.channel.id.as_str();

        ChannelHandler::new(self.ctx.clone()).end_and_delete(id, ev.cause).await?;

        let channel = match self.ctx.db.channel_get(id).await? {
            Some(channel) => channel,
            None => {
                let mut channel = ev.channel.to_channel(node_id);
                channel.hangup_cause = ev.cause;
                channel.tm_end = Some(Utc::now());
                channel
            }
        };

        CallHandler::new(self.ctx.clone()).channel_destroyed(&channel).await?;
        ExternalMediaHandler::new(self.ctx.clone())
            .channel_destroyed(&channel)
            .await
    }
}

pub struct ChannelStateChangeHandler {
    pub ctx: Arc<ServiceContext>,
}

#[async_trait]
impl EventHandler for ChannelStateChangeHandler {
    async fn handle(&self, node_id: &str, event: PbxEvent) -> Result<()> {
        let PbxEvent::ChannelStateChange(ev) = event else {
            return Err(unexpected("ChannelStateChangeHandler", &event));
        };
        let updated = ChannelHandler::new(self.ctx.clone())
            .update_state(&ev.channel.id, ev.channel.state)
            .await;
        let channel = match tolerate_unknown(updated)? {
            Some(channel) => channel,
            None => ev.channel.to_channel(node_id),
        };
        CallHandler::new(self.ctx.clone()).update_status(&channel).await
    }
}

pub struct DtmfHandler {
    pub ctx: Arc<ServiceContext>,
}

#[async_trait]
impl EventHandler for DtmfHandler {
    async fn handle(&self, _node_id: &str, event: PbxEvent) -> Result<()> {
        let PbxEvent::ChannelDtmfReceived(ev) = event else {
            return Err(unexpected("DtmfHandler", &event));
        };
        CallHandler::new(self.ctx.clone())
            .digits_received(&ev.channel.id, &ev.digit)
            .await
    }
}

/// ChannelEnteredBridge and ChannelLeftBridge
pub struct BridgeMemberHandler {
    pub ctx: Arc<ServiceContext>,
}

#[async_trait]
impl EventHandler for BridgeMemberHandler {
    async fn handle(&self, _node_id: &str, event: PbxEvent) -> Result<()> {
        let channels = ChannelHandler::new(self.ctx.clone());
        let confbridges = ConfbridgeHandler::new(self.ctx.clone());
        match event {
            PbxEvent::ChannelEnteredBridge(ev) => {
                tolerate_unknown(channels.set_bridge_id(&ev.channel.id, &ev.bridge.id).await)?;
                confbridges.joined(&ev.channel.id, &ev.bridge.id).await
            }
            PbxEvent::ChannelLeftBridge(ev) => {
                tolerate_unknown(channels.set_bridge_id(&ev.channel.id, "").await)?;
                confbridges.left(&ev.channel.id, &ev.bridge.id).await
            }
            other => Err(unexpected("BridgeMemberHandler", &other)),
        }
    }
}

pub struct VarsetHandler {
    pub ctx: Arc<ServiceContext>,
}

#[async_trait]
impl EventHandler for VarsetHandler {
    async fn handle(&self, _node_id: &str, event: PbxEvent) -> Result<()> {
        let PbxEvent::ChannelVarset(ev) = event else {
            return Err(unexpected("VarsetHandler", &event));
        };
        let Some(channel) = ev.channel else {
            debug!(variable = %ev.variable, "global variable set");
            return Ok(());
        };
        tolerate_unknown(
            ChannelHandler::new(self.ctx.clone())
                .set_variable(&channel.id, &ev.variable, &ev.value)
                .await,
        )?;
        Ok(())
    }
}

/// BridgeCreated and BridgeDestroyed
pub struct BridgeLifecycleHandler {
    pub ctx: Arc<ServiceContext>,
}

#[async_trait]
impl EventHandler for BridgeLifecycleHandler {
    async fn handle(&self, node_id: &str, event: PbxEvent) -> Result<()> {
        match event {
            PbxEvent::BridgeCreated(ev) => {
                debug!(bridge_id = %ev.bridge.id, node = node_id, "bridge created");
                Ok(())
            }
            PbxEvent::BridgeDestroyed(ev) => {
                debug!(bridge_id = %ev.bridge.id, node = node_id, "bridge destroyed");
                ConfbridgeHandler::new(self.ctx.clone())
                    .bridge_destroyed(&ev.bridge.id)
                    .await
            }
            other => Err(unexpected("BridgeLifecycleHandler", &other)),
        }
    }
}

/// PlaybackStarted and PlaybackFinished
pub struct PlaybackHandler {
    pub ctx: Arc<ServiceContext>,
}

#[async_trait]
impl EventHandler for PlaybackHandler {
    async fn handle(&self, _node_id: &str, event: PbxEvent) -> Result<()> {
        let channels = ChannelHandler::new(self.ctx.clone());
        match event {
            PbxEvent::PlaybackStarted(ev) => {
                let Some(channel_id) = ev.playback.target_channel_id() else {
                    return Ok(());
                };
                tolerate_unknown(channels.set_playback_id(channel_id, &ev.playback.id).await)?;
                Ok(())
            }
            PbxEvent::PlaybackFinished(ev) => {
                let Some(channel_id) = ev.playback.target_channel_id() else {
                    return Ok(());
                };
                tolerate_unknown(channels.set_playback_id(channel_id, "").await)?;
                CallHandler::new(self.ctx.clone())
                    .playback_finished(channel_id, &ev.playback.id)
                    .await
            }
            other => Err(unexpected("PlaybackHandler", &other)),
        }
    }
}

/// RecordingStarted and RecordingFinished
pub struct RecordingEventHandler {
    pub ctx: Arc<ServiceContext>,
}

#[async_trait]
impl EventHandler for RecordingEventHandler {
    async fn handle(&self, node_id: &str, event: PbxEvent) -> Result<()> {
        let recordings = RecordingHandler::new(self.ctx.clone());
        match event {
            PbxEvent::RecordingStarted(ev) => {
                debug!(recording = %ev.recording.name, node = node_id, "recording started");
                recordings.started(&ev.recording.name).await
            }
            PbxEvent::RecordingFinished(ev) => {
                debug!(
                    recording = %ev.recording.name,
                    state = %ev.recording.state,
                    node = node_id,
                    "recording finished"
                );
                recordings.finished(&ev.recording.name).await
            }
            other => Err(unexpected("RecordingEventHandler", &other)),
        }
    }
}

pub struct StasisStartHandler {
    pub ctx: Arc<ServiceContext>,
}

#[async_trait]
impl EventHandler for StasisStartHandler {
    async fn handle(&self, node_id: &str, event: PbxEvent) -> Result<()> {
        let PbxEvent::StasisStart(ev) = event else {
            return Err(unexpected("StasisStartHandler", &event));
        };

        let mut snapshot = ev.channel.to_channel(node_id);
        if let Some(context) = parse_stasis_args(&ev.args).remove("context") {
            snapshot.context = context;
        }

        let channels = ChannelHandler::new(self.ctx.clone());
        channels.create(snapshot.clone()).await?;
        let channel = channels
            .set_stasis(&snapshot.id, &self.ctx.config.general.stasis_app)
            .await?;
        CallHandler::new(self.ctx.clone()).start(&channel).await
    }
}

pub struct StasisEndHandler {
    pub ctx: Arc<ServiceContext>,
}

#[async_trait]
impl EventHandler for StasisEndHandler {
    async fn handle(&self, _node_id: &str, event: PbxEvent) -> Result<()> {
        let PbxEvent::StasisEnd(ev) = event else {
            return Err(unexpected("StasisEndHandler", &event));
        };
        tolerate_unknown(ChannelHandler::new(self.ctx.clone()).set_stasis(&ev.channel.id, "").await)?;
        Ok(())
    }
}

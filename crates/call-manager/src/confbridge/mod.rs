//! Confbridge Manager
//!
//! A confbridge wraps one PBX mixing bridge and the calls whose channels sit
//! in it. Membership lives inside [`Confbridge`] and only `join`, `kick` and
//! the bridge-left event path change it.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::action::ActionEngine;
use crate::call::CallHandler;
use crate::context::ServiceContext;
use crate::error::{CallManagerError, Result};
use crate::external_media::{ExternalMediaHandler, ExternalMediaRequest};
use crate::models::{
    ActionType, ChannelState, Confbridge, ConfbridgeFlag, ConfbridgeJoinOption, ConfbridgeReferenceType,
    ConfbridgeStatus, ConfbridgeType, ExternalMedia, ReferenceType,
};
use crate::pbx::BRIDGE_TYPE_MIXING;
use crate::recording::{RecordingHandler, RecordingRequest};
use crate::store::ListFilter;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfbridgeRequest {
    pub customer_id: Uuid,
    pub activeflow_id: Option<Uuid>,
    pub reference_type: ConfbridgeReferenceType,
    pub reference_id: Uuid,
    pub confbridge_type: ConfbridgeType,
    pub flags: Vec<ConfbridgeFlag>,
}

#[derive(Clone)]
pub struct ConfbridgeHandler {
    ctx: Arc<ServiceContext>,
}

impl ConfbridgeHandler {
    pub fn new(ctx: Arc<ServiceContext>) -> Self {
        Self { ctx }
    }

    pub async fn get(&self, id: Uuid) -> Result<Confbridge> {
        self.ctx
            .db
            .confbridge_get(id)
            .await?
            .ok_or_else(|| CallManagerError::not_found(format!("confbridge {} not found", id)))
    }

    pub async fn list(&self, filter: &ListFilter) -> Result<Vec<Confbridge>> {
        self.ctx.db.confbridge_list(filter).await
    }

    /// Cloned view of channel id to call id membership
    pub async fn members(&self, id: Uuid) -> Result<HashMap<String, Uuid>> {
        Ok(self.get(id).await?.members())
    }

    pub(crate) async fn update<F>(&self, id: Uuid, f: F) -> Result<Confbridge>
    where
        F: FnOnce(&mut Confbridge) -> Result<()>,
    {
        let _guard = self.ctx.locks.confbridge(id).await;
        let mut confbridge = self.get(id).await?;
        f(&mut confbridge)?;
        confbridge.tm_update = Some(Utc::now());
        self.ctx.db.confbridge_save(&confbridge).await?;
        Ok(confbridge)
    }

    pub(crate) fn node_of(&self, confbridge: &Confbridge) -> String {
        if confbridge.asterisk_id.is_empty() {
            self.ctx.default_node_id().to_string()
        } else {
            confbridge.asterisk_id.clone()
        }
    }

    async fn live(&self, id: Uuid) -> Result<Confbridge> {
        let confbridge = self.get(id).await?;
        if !confbridge.is_live() {
            return Err(CallManagerError::invalid_state(format!("confbridge {} is {:?}", id, confbridge.status)));
        }
        Ok(confbridge)
    }

    /// Create the confbridge for a reference, or return the live one it already has
    pub async fn create(&self, request: ConfbridgeRequest) -> Result<Confbridge> {
        let _guard = self.ctx.locks.lock(format!("confbridge-reference:{}", request.reference_id)).await;
        if let Some(existing) = self.ctx.db.confbridge_get_live_by_reference(request.reference_id).await? {
            debug!(confbridge_id = %existing.id, reference_id = %request.reference_id, "confbridge already exists");
            return Ok(existing);
        }

        let id = Uuid::new_v4();
        let mut confbridge = Confbridge::new(
            id,
            request.customer_id,
            request.reference_type,
            request.reference_id,
            request.confbridge_type,
        );
        confbridge.activeflow_id = request.activeflow_id;
        confbridge.flags = request.flags;
        confbridge.asterisk_id = self.ctx.default_node_id().to_string();
        confbridge.bridge_id = Uuid::new_v4().to_string();

        let name = format!("reference_type=confbridge,reference_id={}", id);
        self.ctx
            .pbx
            .bridge_create(&confbridge.asterisk_id, &confbridge.bridge_id, BRIDGE_TYPE_MIXING, &name)
            .await?;
        self.ctx.db.confbridge_save(&confbridge).await?;

        info!(
            confbridge_id = %id,
            bridge_id = %confbridge.bridge_id,
            reference_id = %confbridge.reference_id,
            "confbridge created"
        );
        Ok(confbridge)
    }

    pub async fn join(&self, id: Uuid, call_id: Uuid) -> Result<Confbridge> {
        let confbridge = self.live(id).await?;
        if confbridge.contains_call(call_id) {
            debug!(confbridge_id = %id, call_id = %call_id, "call already joined");
            return Ok(confbridge);
        }

        let calls = CallHandler::new(self.ctx.clone());
        let call = calls.get(call_id).await?;
        if call.status.is_hanging_up() {
            return Err(CallManagerError::invalid_state(format!("call {} is hanging up", call_id)));
        }
        if call.channel_id.is_empty() {
            return Err(CallManagerError::invalid_state(format!("call {} has no channel", call_id)));
        }

        self.ctx
            .pbx
            .bridge_add_channel(&self.node_of(&confbridge), &confbridge.bridge_id, &call.channel_id)
            .await?;

        let channel_id = call.channel_id.clone();
        let confbridge = self
            .update(id, |confbridge| {
                confbridge.add_member(channel_id, call_id);
                Ok(())
            })
            .await?;
        calls
            .update(call_id, |call| {
                call.confbridge_id = Some(id);
                Ok(())
            })
            .await?;

        info!(confbridge_id = %id, call_id = %call_id, members = confbridge.member_count(), "call joined confbridge");
        Ok(confbridge)
    }

    /// Remove a call from the bridge. Kicking a non-member is a no-op.
    pub async fn kick(&self, id: Uuid, call_id: Uuid) -> Result<Confbridge> {
        let confbridge = self.get(id).await?;
        let Some(channel_id) = confbridge.channel_of(call_id) else {
            debug!(confbridge_id = %id, call_id = %call_id, "kick for non-member");
            return Ok(confbridge);
        };

        if let Err(e) = self
            .ctx
            .pbx
            .bridge_remove_channel(&self.node_of(&confbridge), &confbridge.bridge_id, &channel_id)
            .await
        {
            // the channel may already be gone
            warn!(confbridge_id = %id, channel_id = %channel_id, error = %e, "bridge remove failed");
        }

        let confbridge = self.remove_member(id, call_id).await?;
        info!(confbridge_id = %id, call_id = %call_id, members = confbridge.member_count(), "call kicked from confbridge");
        Ok(confbridge)
    }

    async fn remove_member(&self, id: Uuid, call_id: Uuid) -> Result<Confbridge> {
        let confbridge = self
            .update(id, |confbridge| {
                confbridge.remove_member(call_id);
                Ok(())
            })
            .await?;

        match CallHandler::new(self.ctx.clone())
            .update(call_id, |call| {
                if call.confbridge_id == Some(id) {
                    call.confbridge_id = None;
                }
                Ok(())
            })
            .await
        {
            Ok(_) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }
        Ok(confbridge)
    }

    /// A channel entered a bridge
    pub async fn joined(&self, channel_id: &str, bridge_id: &str) -> Result<()> {
        let Some(confbridge) = self.ctx.db.confbridge_get_by_bridge_id(bridge_id).await? else {
            return Ok(());
        };
        let node_id = self.node_of(&confbridge);

        match confbridge.confbridge_type {
            ConfbridgeType::Conference => {
                self.answer_if_needed(&node_id, channel_id).await?;
            }
            ConfbridgeType::Connect => {
                if confbridge.member_count() >= 2 {
                    for member_channel_id in confbridge.members().keys() {
                        self.answer_if_needed(&node_id, member_channel_id).await?;
                    }
                } else {
                    self.ctx.pbx.channel_ring(&node_id, channel_id).await?;
                }
            }
        }
        debug!(confbridge_id = %confbridge.id, channel_id, "channel entered confbridge");
        Ok(())
    }

    async fn answer_if_needed(&self, node_id: &str, channel_id: &str) -> Result<()> {
        let up = self
            .ctx
            .db
            .channel_get(channel_id)
            .await?
            .map_or(false, |channel| channel.state == ChannelState::Up);
        if !up {
            self.ctx.pbx.channel_answer(node_id, channel_id).await?;
        }
        Ok(())
    }

    /// A channel left a bridge
    pub async fn left(&self, channel_id: &str, bridge_id: &str) -> Result<()> {
        let Some(confbridge) = self.ctx.db.confbridge_get_by_bridge_id(bridge_id).await? else {
            return Ok(());
        };
        let Some(call) = self.ctx.db.call_get_by_channel_id(channel_id).await? else {
            debug!(confbridge_id = %confbridge.id, channel_id, "non-call channel left confbridge");
            return Ok(());
        };

        let confbridge = if confbridge.contains_call(call.id) {
            self.remove_member(confbridge.id, call.id).await?
        } else {
            confbridge
        };
        info!(confbridge_id = %confbridge.id, call_id = %call.id, members = confbridge.member_count(), "call left confbridge");

        if let Some(action) = call.action.as_ref() {
            let joined_here = action.action_type == ActionType::ConfbridgeJoin
                && action
                    .option_as::<ConfbridgeJoinOption>()
                    .map_or(false, |option| option.confbridge_id == confbridge.id);
            if joined_here && !call.status.is_hanging_up() {
                ActionEngine::new(self.ctx.clone())
                    .action_next_if_current(call.id, action)
                    .await?;
            }
        }

        if confbridge.confbridge_type == ConfbridgeType::Connect
            && !confbridge.has_flag(ConfbridgeFlag::NoAutoLeave)
            && confbridge.is_live()
            && confbridge.member_count() < 2
        {
            info!(confbridge_id = %confbridge.id, "connect confbridge down to one member, terminating");
            self.terminate(confbridge.id).await?;
        }
        Ok(())
    }

    /// The PBX bridge went away underneath a confbridge
    pub async fn bridge_destroyed(&self, bridge_id: &str) -> Result<()> {
        let Some(confbridge) = self.ctx.db.confbridge_get_by_bridge_id(bridge_id).await? else {
            return Ok(());
        };
        if confbridge.status == ConfbridgeStatus::Terminated {
            return Ok(());
        }
        warn!(confbridge_id = %confbridge.id, bridge_id, "bridge destroyed under live confbridge");
        self.update(confbridge.id, |confbridge| {
            confbridge.status = ConfbridgeStatus::Terminated;
            Ok(())
        })
        .await?;
        Ok(())
    }

    /// Kick every member, release attachments, then the bridge itself
    pub async fn terminate(&self, id: Uuid) -> Result<Confbridge> {
        let confbridge = self
            .update(id, |confbridge| {
                if confbridge.status == ConfbridgeStatus::Progressing {
                    confbridge.status = ConfbridgeStatus::Terminating;
                }
                Ok(())
            })
            .await?;
        if confbridge.status == ConfbridgeStatus::Terminated {
            debug!(confbridge_id = %id, "confbridge already terminated");
            return Ok(confbridge);
        }

        for call_id in confbridge.member_call_ids() {
            self.kick(id, call_id).await?;
        }

        let node_id = self.node_of(&confbridge);
        if let Some(recording_id) = confbridge.recording_id {
            if let Err(e) = RecordingHandler::new(self.ctx.clone()).stop(recording_id).await {
                warn!(confbridge_id = %id, recording_id = %recording_id, error = %e, "recording stop failed");
            }
        }
        if let Some(external_media_id) = confbridge.external_media_id {
            ExternalMediaHandler::new(self.ctx.clone()).stop(external_media_id).await?;
        }

        if let Err(e) = self.ctx.pbx.bridge_delete(&node_id, &confbridge.bridge_id).await {
            warn!(confbridge_id = %id, bridge_id = %confbridge.bridge_id, error = %e, "bridge delete failed");
        }

        self.update(id, |confbridge| {
            confbridge.status = ConfbridgeStatus::Terminated;
            confbridge.recording_id = None;
            Ok(())
        })
        .await?;
        self.ctx.db.confbridge_delete(id).await?;

        info!(confbridge_id = %id, "confbridge terminated");
        self.get(id).await
    }

    pub async fn delete(&self, id: Uuid) -> Result<Confbridge> {
        let confbridge = self.get(id).await?;
        if confbridge.status != ConfbridgeStatus::Terminated {
            return self.terminate(id).await;
        }
        self.ctx.db.confbridge_delete(id).await?;
        self.get(id).await
    }

    pub async fn recording_start(&self, id: Uuid) -> Result<Confbridge> {
        let request = RecordingRequest {
            reference_type: ReferenceType::Confbridge,
            reference_id: id,
            ..Default::default()
        };
        RecordingHandler::new(self.ctx.clone()).start(request).await?;
        self.get(id).await
    }

    pub async fn recording_stop(&self, id: Uuid) -> Result<Confbridge> {
        let confbridge = self.get(id).await?;
        let Some(recording_id) = confbridge.recording_id else {
            return Ok(confbridge);
        };

        RecordingHandler::new(self.ctx.clone()).stop(recording_id).await?;
        self.get(id).await
    }

    pub async fn external_media_start(&self, id: Uuid, request: ExternalMediaRequest) -> Result<ExternalMedia> {
        ExternalMediaHandler::new(self.ctx.clone())
            .start(ExternalMediaRequest {
                reference_type: ReferenceType::Confbridge,
                reference_id: id,
                ..request
            })
            .await
    }

    pub async fn external_media_stop(&self, id: Uuid) -> Result<Confbridge> {
        let confbridge = self.get(id).await?;
        if let Some(external_media_id) = confbridge.external_media_id {
            ExternalMediaHandler::new(self.ctx.clone()).stop(external_media_id).await?;
        }
        self.get(id).await
    }
}

//! Call State Machine
//!
//! A [`Call`] moves `dialing → ringing → progressing → answered →
//! terminated`, driven by PBX channel events and by commands. Status only
//! moves forward; see [`CallStatus::can_transition_to`]. The call handler also
//! owns chaining (calls bound to a master call), per-call recording and the
//! post-hangup cleanup that releases everything a call was attached to.

mod create;
mod events;
mod hangup;

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::action::ActionEngine;
use crate::context::ServiceContext;
use crate::error::{CallManagerError, Result};
use crate::groupcall::{AnswerOutcome, GroupcallHandler};
use crate::models::call::status_by_channel_state;
use crate::models::{Call, CallDirection, CallStatus, Channel, RecordingStartOption, ReferenceType};
use crate::recording::{RecordingHandler, RecordingRequest};
use crate::store::ListFilter;

pub use create::OutgoingCallRequest;

#[derive(Clone)]
pub struct CallHandler {
    ctx: Arc<ServiceContext>,
}

impl CallHandler {
    pub fn new(ctx: Arc<ServiceContext>) -> Self {
        Self { ctx }
    }

    pub async fn get(&self, id: Uuid) -> Result<Call> {
        self.ctx
            .db
            .call_get(id)
            .await?
            .ok_or_else(|| CallManagerError::not_found(format!("call {} not found", id)))
    }

    pub async fn list(&self, filter: &ListFilter) -> Result<Vec<Call>> {
        self.ctx.db.call_list(filter).await
    }

    /// Read-modify-write under the call's identity lock
    pub(crate) async fn update<F>(&self, id: Uuid, f: F) -> Result<Call>
    where
        F: FnOnce(&mut Call) -> Result<()>,
    {
        let _guard = self.ctx.locks.call(id).await;
        let mut call = self.get(id).await?;
        f(&mut call)?;
        call.tm_update = Some(Utc::now());
        self.ctx.db.call_save(&call).await?;
        Ok(call)
    }

    /// Apply a status move. Returns the previous status and the updated call,
    /// or `None` when the state machine rejects the move.
    pub(crate) async fn set_status(&self, id: Uuid, next: CallStatus) -> Result<Option<(CallStatus, Call)>> {
        let _guard = self.ctx.locks.call(id).await;
        let mut call = self.get(id).await?;
        let prev = call.status;
        if !call.apply_status(next, Utc::now()) {
            debug!(call_id = %id, from = ?prev, to = ?next, "status change ignored");
            return Ok(None);
        }
        self.ctx.db.call_save(&call).await?;
        info!(call_id = %id, from = ?prev, to = ?next, "call status changed");
        Ok(Some((prev, call)))
    }

    /// Follow a channel state change onto its call
    pub async fn update_status(&self, channel: &Channel) -> Result<()> {
        let Some(call) = self.ctx.db.call_get_by_channel_id(&channel.id).await? else {
            debug!(channel_id = %channel.id, "no call for channel");
            return Ok(());
        };

        let next = status_by_channel_state(channel.state);
        let Some((prev, call)) = self.set_status(call.id, next).await? else {
            return Ok(());
        };

        match next {
            CallStatus::Answered => {
                if let Some(groupcall_id) = call.groupcall_id {
                    let outcome = GroupcallHandler::new(self.ctx.clone())
                        .answer_call(groupcall_id, call.id)
                        .await?;
                    if outcome == AnswerOutcome::Lost {
                        return Ok(());
                    }
                }
                if prev != CallStatus::Progressing && call.action.is_none() {
                    ActionEngine::new(self.ctx.clone()).action_next(call.id, false).await?;
                }
            }
            CallStatus::Ringing if call.direction == CallDirection::Outgoing && call.is_early_execution() => {
                if self.set_status(call.id, CallStatus::Progressing).await?.is_some() {
                    ActionEngine::new(self.ctx.clone()).action_next(call.id, false).await?;
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// A channel entered the stasis application
    pub async fn start(&self, channel: &Channel) -> Result<()> {
        use crate::models::{ChannelDirection, ChannelType};

        match channel.channel_type() {
            ChannelType::ExternalMedia | ChannelType::Recording => {
                debug!(channel_id = %channel.id, context = %channel.context, "ignoring media channel");
                return Ok(());
            }
            _ => {}
        }

        if self.ctx.db.call_get_by_channel_id(&channel.id).await?.is_some() {
            return self.update_status(channel).await;
        }

        if channel.direction() != ChannelDirection::Incoming {
            debug!(channel_id = %channel.id, context = %channel.context, "no call bound to channel");
            return Ok(());
        }

        let Some(call) = self.create_call_incoming(channel).await? else {
            return Ok(());
        };
        if self.set_status(call.id, CallStatus::Progressing).await?.is_some() {
            ActionEngine::new(self.ctx.clone()).action_next(call.id, false).await?;
        }
        Ok(())
    }

    /// Soft delete a terminated call. A live call is hung up instead.
    pub async fn delete(&self, id: Uuid) -> Result<Call> {
        let call = self.get(id).await?;
        if !call.status.is_terminal() {
            self.hanging_up(id, crate::models::ChannelCause::NORMAL_CLEARING).await?;
            return Err(CallManagerError::invalid_state(format!(
                "call {} is not terminated yet; hangup requested",
                id
            )));
        }
        self.ctx.db.call_delete(id).await?;
        self.get(id).await
    }

    pub async fn chained_call_id_add(&self, id: Uuid, chained_call_id: Uuid) -> Result<Call> {
        if id == chained_call_id {
            return Err(CallManagerError::invalid_input("a call cannot be chained to itself"));
        }

        let call = self
            .update(id, |call| {
                if call.status.is_terminal() {
                    return Err(CallManagerError::invalid_state(format!("call {} is terminated", call.id)));
                }
                if !call.chained_call_ids.contains(&chained_call_id) {
                    call.chained_call_ids.push(chained_call_id);
                }
                Ok(())
            })
            .await?;

        match self
            .update(chained_call_id, |chained| {
                chained.master_call_id = Some(id);
                Ok(())
            })
            .await
        {
            Ok(_) => {}
            Err(e) if e.is_not_found() => debug!(call_id = %id, chained_call_id = %chained_call_id, "chained call unknown"),
            Err(e) => return Err(e),
        }

        Ok(call)
    }

    pub async fn chained_call_id_remove(&self, id: Uuid, chained_call_id: Uuid) -> Result<Call> {
        let call = self
            .update(id, |call| {
                call.chained_call_ids.retain(|c| *c != chained_call_id);
                Ok(())
            })
            .await?;

        match self
            .update(chained_call_id, |chained| {
                if chained.master_call_id == Some(id) {
                    chained.master_call_id = None;
                }
                Ok(())
            })
            .await
        {
            Ok(_) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }

        Ok(call)
    }

    pub async fn recording_start(&self, id: Uuid, option: &RecordingStartOption) -> Result<Call> {
        RecordingHandler::new(self.ctx.clone())
            .start(RecordingRequest::for_reference(ReferenceType::Call, id, option))
            .await?;
        self.get(id).await
    }

    pub async fn recording_stop(&self, id: Uuid) -> Result<Call> {
        let call = self.get(id).await?;
        let Some(recording_id) = call.recording_id else {
            return Ok(call);
        };

        match RecordingHandler::new(self.ctx.clone()).stop(recording_id).await {
            Ok(_) => {}
            Err(e) if e.is_not_found() => {
                warn!(call_id = %id, recording_id = %recording_id, "call points at an unknown recording");
                self.update(id, |call| {
                    call.recording_id = None;
                    Ok(())
                })
                .await?;
            }
            Err(e) => return Err(e),
        }
        self.get(id).await
    }
}

use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::CallHandler;
use crate::confbridge::ConfbridgeHandler;
use crate::error::Result;
use crate::external_media::ExternalMediaHandler;
use crate::groupcall::GroupcallHandler;
use crate::models::call::{hangup_by, hangup_reason, DATA_EXECUTE_NEXT_MASTER_ON_HANGUP};
use crate::models::{Call, CallStatus, Channel, ChannelCause};
use crate::transport::Command;

impl CallHandler {
    /// Ask the PBX to hang the call up and record who asked.
    ///
    /// The PBX is asked first; if it refuses, the call keeps its last known
    /// status. The terminal transition itself comes with the destroyed channel.
    pub async fn hanging_up(&self, id: Uuid, cause: ChannelCause) -> Result<Call> {
        let call = self.get(id).await?;
        if call.status.is_hanging_up() {
            debug!(call_id = %id, status = ?call.status, "call already hanging up");
            return Ok(call);
        }

        let node_id = self.ctx.channel_node(&call.channel_id).await?;
        self.ctx.pbx.channel_hangup(&node_id, &call.channel_id, cause).await?;

        let next = if call.status.is_answered() {
            CallStatus::Terminating
        } else {
            CallStatus::Canceling
        };
        self.set_status(id, next).await?;

        info!(call_id = %id, cause = cause.0, "call hangup requested");
        self.get(id).await
    }

    pub async fn hangup(&self, id: Uuid) -> Result<Call> {
        self.hanging_up(id, ChannelCause::NORMAL_CLEARING).await
    }

    /// Terminal transition for the call bound to a destroyed channel.
    ///
    /// Replays for an already terminated call change nothing.
    pub async fn channel_destroyed(&self, channel: &Channel) -> Result<Option<Call>> {
        let Some(found) = self.ctx.db.call_get_by_channel_id(&channel.id).await? else {
            debug!(channel_id = %channel.id, "destroyed channel has no call");
            return Ok(None);
        };

        let call = {
            let _guard = self.ctx.locks.call(found.id).await;
            let mut call = self.get(found.id).await?;
            if call.status.is_terminal() {
                debug!(call_id = %call.id, "call already terminated");
                return Ok(Some(call));
            }

            let status = call.status;
            call.hangup_by = Some(hangup_by(status));
            call.hangup_reason = Some(hangup_reason(call.direction, status, channel.hangup_cause));
            call.apply_status(CallStatus::Terminated, Utc::now());
            call.action_next_hold = false;
            self.ctx.db.call_save(&call).await?;
            call
        };

        info!(
            call_id = %call.id,
            channel_id = %channel.id,
            cause = channel.hangup_cause.0,
            hangup_by = ?call.hangup_by,
            hangup_reason = ?call.hangup_reason,
            "call terminated"
        );

        self.release_resources(&call).await;
        Ok(Some(call))
    }

    /// Detach a terminated call from everything it was part of. Each step is best effort.
    async fn release_resources(&self, call: &Call) {
        if let Some(groupcall_id) = call.groupcall_id {
            if let Err(e) = GroupcallHandler::new(self.ctx.clone())
                .hangup_call(groupcall_id, call.id)
                .await
            {
                warn!(call_id = %call.id, groupcall_id = %groupcall_id, error = %e, "groupcall update failed");
            }
        }

        if let Some(confbridge_id) = call.confbridge_id {
            if let Err(e) = ConfbridgeHandler::new(self.ctx.clone()).kick(confbridge_id, call.id).await {
                warn!(call_id = %call.id, confbridge_id = %confbridge_id, error = %e, "confbridge kick failed");
            }
        }

        if let Some(external_media_id) = call.external_media_id {
            if let Err(e) = ExternalMediaHandler::new(self.ctx.clone()).stop(external_media_id).await {
                warn!(call_id = %call.id, external_media_id = %external_media_id, error = %e, "external media stop failed");
            }
        }

        if call.recording_id.is_some() {
            if let Err(e) = self.recording_stop(call.id).await {
                warn!(call_id = %call.id, error = %e, "recording stop failed");
            }
        }

        if let Some(master_call_id) = call.master_call_id {
            if let Err(e) = self.chained_call_id_remove(master_call_id, call.id).await {
                debug!(call_id = %call.id, master_call_id = %master_call_id, error = %e, "could not unchain from master");
            }
        }

        for chained_call_id in &call.chained_call_ids {
            match self.hanging_up(*chained_call_id, ChannelCause::NORMAL_CLEARING).await {
                Ok(_) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => warn!(call_id = %call.id, chained_call_id = %chained_call_id, error = %e, "chained hangup failed"),
            }
        }

        if call.data_flag(DATA_EXECUTE_NEXT_MASTER_ON_HANGUP) {
            if let Some(master_call_id) = call.master_call_id {
                let command = Command::CallActionNext {
                    call_id: master_call_id,
                    force: false,
                };
                if let Err(e) = self.ctx.requester.send_command(command).await {
                    warn!(call_id = %call.id, master_call_id = %master_call_id, error = %e, "could not queue master action next");
                }
            }
        }
    }

    /// One round of the call-level health poll
    pub async fn health_check(&self, id: Uuid, retry_count: u32, delay: Duration) -> Result<()> {
        let call = self.get(id).await?;
        if call.status.is_terminal() {
            debug!(call_id = %id, "health check on terminated call ignored");
            return Ok(());
        }

        let retry_count = match self.ctx.db.channel_get(&call.channel_id).await? {
            Some(channel) if channel.is_ended() => {
                info!(call_id = %id, channel_id = %channel.id, "call channel already ended");
                self.channel_destroyed(&channel).await?;
                return Ok(());
            }
            Some(_) => 0,
            None => retry_count.saturating_add(1),
        };

        if retry_count >= self.ctx.config.call.health_check_retry_max {
            warn!(call_id = %id, channel_id = %call.channel_id, retry_count, "call channel missing, terminating call");
            self.ctx.metrics.record_health_check_exhausted();

            let mut channel = Channel::new(call.channel_id.clone(), self.ctx.default_node_id());
            channel.hangup_cause = ChannelCause::INTERWORKING;
            self.channel_destroyed(&channel).await?;
            return Ok(());
        }

        self.ctx
            .requester
            .send_delayed(
                Command::CallHealthCheck {
                    call_id: id,
                    retry_count,
                    delay_ms: delay.as_millis() as u64,
                },
                delay,
            )
            .await
    }
}

use std::collections::HashMap;

use tracing::debug;
use uuid::Uuid;

use super::CallHandler;
use crate::action::{digits_condition_met, ActionEngine};
use crate::error::{CallManagerError, Result};
use crate::flow::variables::VAR_CALL_DIGITS;
use crate::models::{Action, ActionType, DigitsReceiveOption};

impl CallHandler {
    /// Append a DTMF digit to the call's collected digits and complete a
    /// waiting `digits_receive` once its condition holds.
    pub async fn digits_received(&self, channel_id: &str, digit: &str) -> Result<()> {
        let Some(call) = self.ctx.db.call_get_by_channel_id(channel_id).await? else {
            debug!(channel_id, "digit for channel without call");
            return Ok(());
        };
        let Some(activeflow_id) = call.activeflow_id else {
            return Ok(());
        };

        let digits = {
            let _guard = self.ctx.locks.call(call.id).await;
            let variables = self.ctx.variables.variables(activeflow_id).await?;
            let mut digits = variables.get(VAR_CALL_DIGITS).cloned().unwrap_or_default();
            digits.push_str(digit);
            self.ctx
                .variables
                .set_variables(activeflow_id, HashMap::from([(VAR_CALL_DIGITS.to_string(), digits.clone())]))
                .await?;
            digits
        };
        debug!(call_id = %call.id, digits = %digits, "digit received");

        let Some(action) = call.action.as_ref() else {
            return Ok(());
        };
        if action.action_type != ActionType::DigitsReceive || call.action_next_hold {
            return Ok(());
        }

        let option: DigitsReceiveOption = action.option_as()?;
        if digits_condition_met(&digits, &option) {
            ActionEngine::new(self.ctx.clone())
                .action_next_if_current(call.id, action)
                .await?;
        }
        Ok(())
    }

    /// Digits collected on the call's flow so far
    pub async fn digits_get(&self, id: Uuid) -> Result<String> {
        let call = self.get(id).await?;
        let Some(activeflow_id) = call.activeflow_id else {
            return Ok(String::new());
        };
        let variables = self.ctx.variables.variables(activeflow_id).await?;
        Ok(variables.get(VAR_CALL_DIGITS).cloned().unwrap_or_default())
    }

    /// Play DTMF tones on the call's channel outside of any flow action
    pub async fn digits_send(
        &self,
        id: Uuid,
        digits: &str,
        duration_ms: Option<u64>,
        interval_ms: Option<u64>,
    ) -> Result<()> {
        if digits.is_empty() {
            return Err(CallManagerError::invalid_input("no digits to send"));
        }
        let call = self.get(id).await?;
        if call.status.is_hanging_up() {
            return Err(CallManagerError::invalid_state(format!("call {} is hanging up", id)));
        }

        let cfg = &self.ctx.config.call;
        let node_id = self.ctx.channel_node(&call.channel_id).await?;
        self.ctx
            .pbx
            .channel_dtmf_send(
                &node_id,
                &call.channel_id,
                digits,
                duration_ms.unwrap_or(cfg.default_digit_duration_ms),
                interval_ms.unwrap_or(cfg.default_digit_interval_ms),
            )
            .await?;
        debug!(call_id = %id, digits, "digits sent");
        Ok(())
    }

    /// A playback ended. Only the playback of the current action advances the flow.
    pub async fn playback_finished(&self, channel_id: &str, playback_id: &str) -> Result<()> {
        let Some(call) = self.ctx.db.call_get_by_channel_id(channel_id).await? else {
            return Ok(());
        };
        let Some(action) = call.action.as_ref() else {
            return Ok(());
        };
        if action.playback_id() != playback_id {
            debug!(call_id = %call.id, playback_id, "playback of a previous action finished");
            return Ok(());
        }

        ActionEngine::new(self.ctx.clone())
            .action_next_if_current(call.id, action)
            .await
    }

    /// Timer for a dispatched action fired
    pub async fn action_timeout(&self, id: Uuid, action: &Action) -> Result<()> {
        let call = self.get(id).await?;

        let current = call.action.as_ref().map_or(false, |a| a.same_dispatch(action));
        if !current || call.action_next_hold || call.status.is_hanging_up() {
            debug!(call_id = %id, action_id = %action.id, "stale action timeout");
            self.ctx.metrics.record_stale_timer();
            return Ok(());
        }

        if action.action_type.is_playback() {
            let node_id = self.ctx.channel_node(&call.channel_id).await?;
            if let Err(e) = self.ctx.pbx.playback_stop(&node_id, &action.playback_id()).await {
                debug!(call_id = %id, error = %e, "could not stop playback on timeout");
            }
        }

        ActionEngine::new(self.ctx.clone())
            .action_next_if_current(id, action)
            .await
    }
}

//! Action Execution Engine
//!
//! Walks a call's activeflow one action at a time. Choosing the next action
//! happens under the call's `action_next_hold`, so two concurrent
//! `action_next` requests never advance the same call twice. Actions that
//! finish synchronously (answer, goto, branch, ...) are advanced in a loop
//! rather than by recursion; actions that wait on the PBX schedule an
//! optional [`Command::CallActionTimeout`] and return.

pub mod executor;
pub mod timeout;

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::call::CallHandler;
use crate::confbridge::ConfbridgeHandler;
use crate::context::ServiceContext;
use crate::error::{CallManagerError, Result};
use crate::models::{Action, ActionType, Call, ChannelCause};
use crate::transport::Command;

pub use executor::{digits_condition_met, executor_for, ActionExecutor, ExecContext, ExecOutcome};

/// Synchronous steps taken by one `action_next` before the flow is declared runaway
pub const MAX_ADVANCE_STEPS: usize = 64;

#[derive(Clone)]
pub struct ActionEngine {
    ctx: Arc<ServiceContext>,
}

impl ActionEngine {
    pub fn new(ctx: Arc<ServiceContext>) -> Self {
        Self { ctx }
    }

    /// Advance the call's flow.
    ///
    /// Without `force` this is a no-op while another advance is choosing the
    /// next action. With `force` the current action is interrupted first.
    pub async fn action_next(&self, call_id: Uuid, force: bool) -> Result<()> {
        if force {
            self.clean_current_action(call_id).await?;
        }
        self.advance(call_id, force, None).await
    }

    /// Advance only if `action` is still the call's current dispatch.
    ///
    /// Used by completion events and timers so a late or duplicated trigger
    /// never skips the action that replaced the one it was meant for.
    pub async fn action_next_if_current(&self, call_id: Uuid, action: &Action) -> Result<()> {
        self.advance(call_id, false, Some(action.clone())).await
    }

    async fn advance(&self, call_id: Uuid, force: bool, expected: Option<Action>) -> Result<()> {
        let mut force = force;
        let mut expected = expected;
        for _ in 0..MAX_ADVANCE_STEPS {
            let Some((call, action)) = self.select_next(call_id, force, expected.as_ref()).await? else {
                return Ok(());
            };
            force = false;

            info!(
                call_id = %call_id,
                action_id = %action.id,
                action_type = action.action_type.as_str(),
                "executing action"
            );

            match self.execute(&call, &action).await {
                Ok(ExecOutcome::Advance) => {
                    self.ctx.metrics.record_action(action.action_type.as_str(), true);
                }
                Ok(ExecOutcome::Wait { timeout }) => {
                    self.ctx.metrics.record_action(action.action_type.as_str(), true);
                    if let Some(timeout) = timeout {
                        self.ctx
                            .requester
                            .send_delayed(Command::CallActionTimeout { call_id, action }, timeout)
                            .await?;
                    }
                    return Ok(());
                }
                Ok(ExecOutcome::Stop) => {
                    self.ctx.metrics.record_action(action.action_type.as_str(), true);
                    return Ok(());
                }
                Err(e) => {
                    warn!(
                        call_id = %call_id,
                        action_id = %action.id,
                        action_type = action.action_type.as_str(),
                        error = %e,
                        "action failed, skipping to the next one"
                    );
                    self.ctx.metrics.record_action(action.action_type.as_str(), false);
                }
            }
            expected = Some(action);
        }

        warn!(call_id = %call_id, steps = MAX_ADVANCE_STEPS, "flow did not settle, hanging up");
        CallHandler::new(self.ctx.clone())
            .hanging_up(call_id, ChannelCause::NORMAL_CLEARING)
            .await?;
        Ok(())
    }

    /// Choose and record the next action.
    ///
    /// `expected` is the action this loop dispatched last; if the call moved
    /// on in the meantime the loop stops instead of skipping someone else's action.
    async fn select_next(
        &self,
        call_id: Uuid,
        force: bool,
        expected: Option<&Action>,
    ) -> Result<Option<(Call, Action)>> {
        let call = {
            let _guard = self.ctx.locks.call(call_id).await;
            let mut call = self.load_call(call_id).await?;

            if call.status.is_hanging_up() {
                debug!(call_id = %call_id, status = ?call.status, "call is hanging up, not advancing");
                return Ok(None);
            }
            if let Some(expected) = expected {
                if !call.action.as_ref().map_or(false, |a| a.same_dispatch(expected)) {
                    debug!(call_id = %call_id, "flow advanced elsewhere");
                    return Ok(None);
                }
            }
            if call.action_next_hold && !force {
                debug!(call_id = %call_id, "action next already in progress");
                return Ok(None);
            }

            call.action_next_hold = true;
            call.tm_update = Some(Utc::now());
            self.ctx.db.call_save(&call).await?;
            call
        };

        let Some(activeflow_id) = call.activeflow_id else {
            info!(call_id = %call_id, "call has no activeflow, hanging up");
            self.release_hold(call_id).await?;
            CallHandler::new(self.ctx.clone())
                .hanging_up(call_id, ChannelCause::NORMAL_CLEARING)
                .await?;
            return Ok(None);
        };

        let next = match self.advance_activeflow(activeflow_id).await {
            Ok(next) => next,
            Err(e) => {
                self.release_hold(call_id).await?;
                return Err(e);
            }
        };

        let _guard = self.ctx.locks.call(call_id).await;
        let mut call = self.load_call(call_id).await?;
        call.action_next_hold = false;
        if call.status.is_hanging_up() {
            self.ctx.db.call_save(&call).await?;
            return Ok(None);
        }
        call.action = Some(next.clone());
        call.tm_update = Some(Utc::now());
        self.ctx.db.call_save(&call).await?;
        Ok(Some((call, next)))
    }

    async fn advance_activeflow(&self, activeflow_id: Uuid) -> Result<Action> {
        let _guard = self.ctx.locks.lock(format!("activeflow:{}", activeflow_id)).await;
        let mut activeflow = self
            .ctx
            .db
            .activeflow_get(activeflow_id)
            .await?
            .ok_or_else(|| CallManagerError::not_found(format!("activeflow {} not found", activeflow_id)))?;

        let mut next = activeflow.advance();
        next.tm_execute = Some(Utc::now());
        activeflow.current_action = Some(next.clone());
        self.ctx.db.activeflow_save(&activeflow).await?;
        Ok(next)
    }

    async fn release_hold(&self, call_id: Uuid) -> Result<()> {
        let _guard = self.ctx.locks.call(call_id).await;
        let mut call = self.load_call(call_id).await?;
        if call.action_next_hold {
            call.action_next_hold = false;
            self.ctx.db.call_save(&call).await?;
        }
        Ok(())
    }

    async fn load_call(&self, call_id: Uuid) -> Result<Call> {
        self.ctx
            .db
            .call_get(call_id)
            .await?
            .ok_or_else(|| CallManagerError::not_found(format!("call {} not found", call_id)))
    }

    async fn execute(&self, call: &Call, action: &Action) -> Result<ExecOutcome> {
        let node_id = self.ctx.channel_node(&call.channel_id).await?;
        let variables = match call.activeflow_id {
            Some(id) => self.ctx.variables.variables(id).await?,
            None => HashMap::new(),
        };
        let exec = ExecContext {
            ctx: &self.ctx,
            call,
            node_id,
            variables,
        };
        executor_for(action.action_type)?.execute(&exec, action).await
    }

    /// Interrupt whatever the current action is doing on the PBX and drop the hold
    async fn clean_current_action(&self, call_id: Uuid) -> Result<()> {
        let call = {
            let _guard = self.ctx.locks.call(call_id).await;
            let mut call = self.load_call(call_id).await?;
            if call.action_next_hold {
                call.action_next_hold = false;
                self.ctx.db.call_save(&call).await?;
            }
            call
        };

        let Some(action) = call.action.as_ref() else {
            return Ok(());
        };

        if action.action_type.is_playback() {
            let node_id = self.ctx.channel_node(&call.channel_id).await?;
            if let Err(e) = self.ctx.pbx.playback_stop(&node_id, &action.playback_id()).await {
                debug!(call_id = %call_id, error = %e, "could not stop playback");
            }
        } else if action.action_type == ActionType::ConfbridgeJoin {
            if let Some(confbridge_id) = call.confbridge_id {
                if let Err(e) = ConfbridgeHandler::new(self.ctx.clone()).kick(confbridge_id, call_id).await {
                    warn!(call_id = %call_id, confbridge_id = %confbridge_id, error = %e, "could not kick call");
                }
            }
        }
        Ok(())
    }
}

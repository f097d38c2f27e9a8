//! Groupcall Orchestrator
//!
//! Fans one dial request out to several member calls that share the
//! groupcall id. The first member to answer wins; the winner is written once
//! under the groupcall's identity lock and every other member is hung up
//! with `ANSWERED_ELSEWHERE`. Linear ring dials one destination at a time and
//! moves on only after the previous member is gone.

use std::sync::Arc;

use chrono::Utc;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::call::{CallHandler, OutgoingCallRequest};
use crate::context::ServiceContext;
use crate::error::{CallManagerError, Result};
use crate::models::{Address, AnswerMethod, ChannelCause, Groupcall, GroupcallStatus, RingMethod};
use crate::store::ListFilter;
use crate::transport::Command;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GroupcallRequest {
    pub id: Option<Uuid>,
    pub customer_id: Uuid,
    pub flow_id: Uuid,
    pub master_call_id: Option<Uuid>,
    pub source: Address,
    pub destinations: Vec<Address>,
    pub ring_method: RingMethod,
    pub answer_method: AnswerMethod,
}

/// Result of a member call's answer claim
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnswerOutcome {
    /// This call is the winner
    Won,
    /// This call already won earlier (replayed answer)
    AlreadyWinner,
    /// Another member won first; this call is being hung up
    Lost,
}

#[derive(Clone)]
pub struct GroupcallHandler {
    ctx: Arc<ServiceContext>,
}

impl GroupcallHandler {
    pub fn new(ctx: Arc<ServiceContext>) -> Self {
        Self { ctx }
    }

    pub async fn get(&self, id: Uuid) -> Result<Groupcall> {
        self.ctx
            .db
            .groupcall_get(id)
            .await?
            .ok_or_else(|| CallManagerError::not_found(format!("groupcall {} not found", id)))
    }

    pub async fn list(&self, filter: &ListFilter) -> Result<Vec<Groupcall>> {
        self.ctx.db.groupcall_list(filter).await
    }

    /// The groupcall, provided `call_id` is one of its members
    pub async fn member(&self, id: Uuid, call_id: Uuid) -> Result<Groupcall> {
        let groupcall = self.get(id).await?;
        if !groupcall.call_ids.contains(&call_id) {
            return Err(CallManagerError::invalid_input(format!(
                "call {} is not a member of groupcall {}",
                call_id, id
            )));
        }
        Ok(groupcall)
    }

    async fn update<F, T>(&self, id: Uuid, f: F) -> Result<(Groupcall, T)>
    where
        F: FnOnce(&mut Groupcall) -> Result<T>,
    {
        let _guard = self.ctx.locks.groupcall(id).await;
        let mut groupcall = self.get(id).await?;
        let out = f(&mut groupcall)?;
        groupcall.tm_update = Some(Utc::now());
        self.ctx.db.groupcall_save(&groupcall).await?;
        Ok((groupcall, out))
    }

    pub async fn start(&self, request: GroupcallRequest) -> Result<Groupcall> {
        if request.destinations.is_empty() {
            return Err(CallManagerError::invalid_input("groupcall without destinations"));
        }
        if request.destinations.iter().any(Address::is_empty) {
            return Err(CallManagerError::invalid_input("groupcall destination is empty"));
        }

        let id = request.id.unwrap_or_else(Uuid::new_v4);
        let dial_count = match request.ring_method {
            RingMethod::RingAll => request.destinations.len(),
            RingMethod::Linear => 1,
        };
        let call_ids: Vec<Uuid> = (0..dial_count).map(|_| Uuid::new_v4()).collect();

        let now = Utc::now();
        let groupcall = Groupcall {
            id,
            customer_id: request.customer_id,
            flow_id: request.flow_id,
            master_call_id: request.master_call_id,
            source: request.source,
            destinations: request.destinations,
            ring_method: request.ring_method,
            answer_method: request.answer_method,
            status: GroupcallStatus::Progressing,
            call_ids: call_ids.clone(),
            answer_call_id: None,
            call_count: call_ids.len(),
            dial_index: 0,
            tm_create: Some(now),
            tm_update: Some(now),
            tm_delete: None,
        };
        self.ctx.db.groupcall_save(&groupcall).await?;
        info!(
            groupcall_id = %id,
            ring_method = ?groupcall.ring_method,
            destinations = groupcall.destinations.len(),
            "groupcall started"
        );

        let dials = call_ids
            .iter()
            .zip(groupcall.destinations.iter())
            .map(|(call_id, destination)| self.dial_member(&groupcall, *call_id, destination.clone()));
        join_all(dials).await;

        self.get(id).await
    }

    async fn dial_member(&self, groupcall: &Groupcall, call_id: Uuid, destination: Address) {
        let request = OutgoingCallRequest {
            id: Some(call_id),
            customer_id: groupcall.customer_id,
            flow_id: groupcall.flow_id,
            source: groupcall.source.clone(),
            destination,
            groupcall_id: Some(groupcall.id),
            ..Default::default()
        };

        let Err(e) = CallHandler::new(self.ctx.clone()).create_call_outgoing(request).await else {
            return;
        };
        warn!(groupcall_id = %groupcall.id, call_id = %call_id, error = %e, "groupcall member dial failed");

        // a saved call is settled by its own health check; an unsaved one never will be
        match self.ctx.db.call_get(call_id).await {
            Ok(Some(_)) => {}
            _ => {
                if let Err(e) = self.hangup_call(groupcall.id, call_id).await {
                    warn!(groupcall_id = %groupcall.id, call_id = %call_id, error = %e, "could not release failed member");
                }
            }
        }
    }

    /// Claim the answer race for `call_id`
    pub async fn answer_call(&self, id: Uuid, call_id: Uuid) -> Result<AnswerOutcome> {
        let (groupcall, outcome) = self
            .update(id, |groupcall| {
                Ok(match groupcall.answer_call_id {
                    None => {
                        groupcall.answer_call_id = Some(call_id);
                        AnswerOutcome::Won
                    }
                    Some(winner) if winner == call_id => AnswerOutcome::AlreadyWinner,
                    Some(_) => AnswerOutcome::Lost,
                })
            })
            .await?;

        let calls = CallHandler::new(self.ctx.clone());
        match outcome {
            AnswerOutcome::Won => {
                self.ctx.metrics.record_race(true);
                info!(groupcall_id = %id, call_id = %call_id, "groupcall answered");

                match groupcall.answer_method {
                    AnswerMethod::HangupOthers => {
                        for other in groupcall.call_ids.iter().filter(|c| **c != call_id) {
                            if let Err(e) = calls.hanging_up(*other, ChannelCause::ANSWERED_ELSEWHERE).await {
                                debug!(groupcall_id = %id, call_id = %other, error = %e, "could not hang up losing member");
                            }
                        }
                    }
                }

                if let Some(master_call_id) = groupcall.master_call_id {
                    calls.chained_call_id_add(master_call_id, call_id).await?;
                }
            }
            AnswerOutcome::AlreadyWinner => {
                debug!(groupcall_id = %id, call_id = %call_id, "answer replayed for winner");
            }
            AnswerOutcome::Lost => {
                self.ctx.metrics.record_race(false);
                debug!(groupcall_id = %id, call_id = %call_id, "member lost the answer race");
                calls.hanging_up(call_id, ChannelCause::ANSWERED_ELSEWHERE).await?;
            }
        }
        Ok(outcome)
    }

    /// A member call is gone
    pub async fn hangup_call(&self, id: Uuid, call_id: Uuid) -> Result<Groupcall> {
        let master_live = match self.get(id).await?.master_call_id {
            Some(master_call_id) => self
                .ctx
                .db
                .call_get(master_call_id)
                .await?
                .map_or(false, |master| !master.status.is_hanging_up()),
            None => true,
        };

        let (groupcall, dial_next) = self
            .update(id, |groupcall| {
                groupcall.call_count = groupcall.call_count.saturating_sub(1);
                if groupcall.call_count > 0 {
                    return Ok(false);
                }

                let dial_next = groupcall.ring_method == RingMethod::Linear
                    && groupcall.answer_call_id.is_none()
                    && groupcall.status == GroupcallStatus::Progressing
                    && groupcall.has_next_destination()
                    && master_live;
                if !dial_next {
                    groupcall.status = GroupcallStatus::Hangup;
                }
                Ok(dial_next)
            })
            .await?;

        debug!(groupcall_id = %id, call_id = %call_id, remaining = groupcall.call_count, "groupcall member hung up");

        if dial_next {
            self.ctx
                .requester
                .send_delayed(
                    Command::GroupcallDialNext { groupcall_id: id },
                    self.ctx.config.groupcall.linear_dial_delay(),
                )
                .await?;
        } else if groupcall.is_hangup() {
            info!(groupcall_id = %id, answer_call_id = ?groupcall.answer_call_id, "groupcall finished");
        }
        Ok(groupcall)
    }

    /// Linear ring: dial the next destination
    pub async fn dial_next_destination(&self, id: Uuid) -> Result<Groupcall> {
        let (groupcall, next) = self
            .update(id, |groupcall| {
                if groupcall.status != GroupcallStatus::Progressing || groupcall.answer_call_id.is_some() {
                    return Ok(None);
                }
                if !groupcall.has_next_destination() {
                    groupcall.status = GroupcallStatus::Hangup;
                    return Ok(None);
                }
                groupcall.dial_index += 1;
                let call_id = Uuid::new_v4();
                groupcall.call_ids.push(call_id);
                groupcall.call_count += 1;
                Ok(Some((call_id, groupcall.destinations[groupcall.dial_index].clone())))
            })
            .await?;

        let Some((call_id, destination)) = next else {
            debug!(groupcall_id = %id, status = ?groupcall.status, "no destination dialed");
            return Ok(groupcall);
        };

        info!(groupcall_id = %id, call_id = %call_id, dial_index = groupcall.dial_index, "dialing next destination");
        self.dial_member(&groupcall, call_id, destination).await;
        self.get(id).await
    }

    /// Hang up every live member
    pub async fn hanging_up(&self, id: Uuid) -> Result<Groupcall> {
        let (groupcall, _) = self
            .update(id, |groupcall| {
                if groupcall.status != GroupcallStatus::Hangup {
                    groupcall.status = if groupcall.call_count == 0 {
                        GroupcallStatus::Hangup
                    } else {
                        GroupcallStatus::Hangingup
                    };
                }
                Ok(())
            })
            .await?;

        if groupcall.status == GroupcallStatus::Hangingup {
            let calls = CallHandler::new(self.ctx.clone());
            for call_id in &groupcall.call_ids {
                match calls.hangup(*call_id).await {
                    Ok(_) => {}
                    Err(e) if e.is_not_found() => {}
                    Err(e) => warn!(groupcall_id = %id, call_id = %call_id, error = %e, "member hangup failed"),
                }
            }
        }
        self.get(id).await
    }

    pub async fn delete(&self, id: Uuid) -> Result<Groupcall> {
        let groupcall = self.get(id).await?;
        if !groupcall.is_hangup() {
            return Err(CallManagerError::invalid_state(format!("groupcall {} is still active", id)));
        }
        self.ctx.db.groupcall_delete(id).await?;
        self.get(id).await
    }
}

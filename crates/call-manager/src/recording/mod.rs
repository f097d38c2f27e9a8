//! Recordings
//!
//! A [`Recording`] is started on a call's channel or a confbridge's bridge.
//! Its owner points at it through `recording_id` while it runs and keeps it in
//! `recording_ids` forever. The owner's pointer is released when the
//! recording is stopped here or when the PBX reports it finished on its own.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::call::CallHandler;
use crate::confbridge::ConfbridgeHandler;
use crate::context::ServiceContext;
use crate::error::{CallManagerError, Result};
use crate::models::{Recording, RecordingStartOption, RecordingStatus, ReferenceType};
use crate::pbx::RecordRequest;
use crate::store::ListFilter;

pub const DEFAULT_FORMAT: &str = "wav";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordingRequest {
    pub activeflow_id: Option<Uuid>,
    pub reference_type: ReferenceType,
    pub reference_id: Uuid,
    pub format: String,
    pub end_of_silence: u64,
    pub end_of_key: String,
    pub duration: u64,
    pub beep_start: bool,
}

impl RecordingRequest {
    pub fn for_reference(reference_type: ReferenceType, reference_id: Uuid, option: &RecordingStartOption) -> Self {
        Self {
            activeflow_id: None,
            reference_type,
            reference_id,
            format: option.format.clone(),
            end_of_silence: option.end_of_silence,
            end_of_key: option.end_of_key.clone(),
            duration: option.duration,
            beep_start: option.beep_start,
        }
    }
}

/// Where the recording runs on the PBX
enum Target {
    Channel(String),
    Bridge(String),
}

#[derive(Clone)]
pub struct RecordingHandler {
    ctx: Arc<ServiceContext>,
}

impl RecordingHandler {
    pub fn new(ctx: Arc<ServiceContext>) -> Self {
        Self { ctx }
    }

    pub async fn get(&self, id: Uuid) -> Result<Recording> {
        self.ctx
            .db
            .recording_get(id)
            .await?
            .ok_or_else(|| CallManagerError::not_found(format!("recording {} not found", id)))
    }

    pub async fn list(&self, filter: &ListFilter) -> Result<Vec<Recording>> {
        self.ctx.db.recording_list(filter).await
    }

    async fn update<F>(&self, id: Uuid, f: F) -> Result<Recording>
    where
        F: FnOnce(&mut Recording) -> Result<()>,
    {
        let _guard = self.ctx.locks.recording(id).await;
        let mut recording = self.get(id).await?;
        f(&mut recording)?;
        recording.tm_update = Some(Utc::now());
        self.ctx.db.recording_save(&recording).await?;
        Ok(recording)
    }

    /// Record the referenced call or confbridge.
    ///
    /// Fails with `InvalidState` when the reference is already recording or is
    /// on its way out. The reference is claimed before the PBX is asked, so
    /// of two concurrent starts only one reaches the PBX.
    pub async fn start(&self, request: RecordingRequest) -> Result<Recording> {
        let id = Uuid::new_v4();
        let now = Utc::now();
        let (customer_id, activeflow_id, node_id, target) = self.claim(&request, id).await?;

        let mut recording = Recording {
            id,
            customer_id,
            activeflow_id: request.activeflow_id.or(activeflow_id),
            reference_type: request.reference_type,
            reference_id: request.reference_id,
            status: RecordingStatus::Initiating,
            format: if request.format.is_empty() {
                DEFAULT_FORMAT.to_string()
            } else {
                request.format.clone()
            },
            asterisk_id: node_id.clone(),
            end_of_silence: request.end_of_silence,
            end_of_key: request.end_of_key.clone(),
            duration: request.duration,
            tm_create: Some(now),
            tm_update: Some(now),
            ..Default::default()
        };
        match &target {
            Target::Channel(channel_id) => recording.channel_id = channel_id.clone(),
            Target::Bridge(bridge_id) => recording.bridge_id = bridge_id.clone(),
        }
        if let Err(e) = self.ctx.db.recording_save(&recording).await {
            self.release(&recording, true).await;
            return Err(e);
        }

        let pbx_request = RecordRequest {
            name: recording.name(),
            format: recording.format.clone(),
            max_duration_secs: recording.duration,
            max_silence_secs: recording.end_of_silence,
            beep: request.beep_start,
            terminate_on: recording.end_of_key.clone(),
        };
        let sent = match &target {
            Target::Channel(channel_id) => self.ctx.pbx.channel_record(&node_id, channel_id, &pbx_request).await,
            Target::Bridge(bridge_id) => self.ctx.pbx.bridge_record(&node_id, bridge_id, &pbx_request).await,
        };
        if let Err(e) = sent {
            warn!(recording_id = %id, reference_id = %recording.reference_id, error = %e, "recording was refused");
            self.release(&recording, true).await;
            if let Err(e) = self.mark(id, RecordingStatus::Ended).await {
                debug!(recording_id = %id, error = %e, "could not end refused recording");
            }
            return Err(e);
        }

        info!(
            recording_id = %id,
            reference_type = ?recording.reference_type,
            reference_id = %recording.reference_id,
            "recording started"
        );
        Ok(recording)
    }

    /// Point the reference at the new recording and return where to record it
    async fn claim(&self, request: &RecordingRequest, id: Uuid) -> Result<(Uuid, Option<Uuid>, String, Target)> {
        match request.reference_type {
            ReferenceType::Call => {
                let calls = CallHandler::new(self.ctx.clone());
                let call = calls
                    .update(request.reference_id, |call| {
                        if call.status.is_hanging_up() {
                            return Err(CallManagerError::invalid_state(format!("call {} is hanging up", call.id)));
                        }
                        if call.recording_id.is_some() {
                            return Err(CallManagerError::invalid_state(format!(
                                "call {} is already recording",
                                call.id
                            )));
                        }
                        call.recording_id = Some(id);
                        call.recording_ids.push(id);
                        Ok(())
                    })
                    .await?;
                let node_id = match self.ctx.channel_node(&call.channel_id).await {
                    Ok(node_id) => node_id,
                    Err(e) => {
                        self.release_call(call.id, id, true).await;
                        return Err(e);
                    }
                };
                Ok((call.customer_id, call.activeflow_id, node_id, Target::Channel(call.channel_id)))
            }
            ReferenceType::Confbridge => {
                let confbridges = ConfbridgeHandler::new(self.ctx.clone());
                let confbridge = confbridges
                    .update(request.reference_id, |confbridge| {
                        if !confbridge.is_live() {
                            return Err(CallManagerError::invalid_state(format!(
                                "confbridge {} is not live",
                                confbridge.id
                            )));
                        }
                        if confbridge.recording_id.is_some() {
                            return Err(CallManagerError::invalid_state(format!(
                                "confbridge {} is already recording",
                                confbridge.id
                            )));
                        }
                        confbridge.recording_id = Some(id);
                        confbridge.recording_ids.push(id);
                        Ok(())
                    })
                    .await?;
                let node_id = confbridges.node_of(&confbridge);
                Ok((
                    confbridge.customer_id,
                    confbridge.activeflow_id,
                    node_id,
                    Target::Bridge(confbridge.bridge_id),
                ))
            }
        }
    }

    /// Clear the reference's pointer if it still names this recording.
    /// `forget` also drops it from the reference's history.
    async fn release(&self, recording: &Recording, forget: bool) {
        match recording.reference_type {
            ReferenceType::Call => self.release_call(recording.reference_id, recording.id, forget).await,
            ReferenceType::Confbridge => {
                let result = ConfbridgeHandler::new(self.ctx.clone())
                    .update(recording.reference_id, |confbridge| {
                        if confbridge.recording_id == Some(recording.id) {
                            confbridge.recording_id = None;
                        }
                        if forget {
                            confbridge.recording_ids.retain(|r| *r != recording.id);
                        }
                        Ok(())
                    })
                    .await;
                if let Err(e) = result {
                    debug!(recording_id = %recording.id, error = %e, "could not release confbridge recording");
                }
            }
        }
    }

    async fn release_call(&self, call_id: Uuid, recording_id: Uuid, forget: bool) {
        let result = CallHandler::new(self.ctx.clone())
            .update(call_id, |call| {
                if call.recording_id == Some(recording_id) {
                    call.recording_id = None;
                }
                if forget {
                    call.recording_ids.retain(|r| *r != recording_id);
                }
                Ok(())
            })
            .await;
        if let Err(e) = result {
            debug!(recording_id = %recording_id, error = %e, "could not release call recording");
        }
    }

    async fn mark(&self, id: Uuid, status: RecordingStatus) -> Result<Recording> {
        self.update(id, |recording| {
            recording.status = status;
            if status == RecordingStatus::Ended && recording.tm_end.is_none() {
                recording.tm_end = Some(Utc::now());
            }
            Ok(())
        })
        .await
    }

    /// Stop a running recording. Stopping a stopped recording returns it unchanged.
    pub async fn stop(&self, id: Uuid) -> Result<Recording> {
        let recording = self.get(id).await?;
        if !recording.is_active() {
            debug!(recording_id = %id, status = ?recording.status, "recording already stopped");
            return Ok(recording);
        }

        let status = match self.ctx.pbx.recording_stop(&recording.asterisk_id, &recording.name()).await {
            Ok(()) => RecordingStatus::Stopping,
            Err(e) => {
                // nothing left on the PBX to report the end
                warn!(recording_id = %id, error = %e, "could not stop recording");
                RecordingStatus::Ended
            }
        };
        let recording = self
            .update(id, |recording| {
                if recording.is_active() {
                    recording.status = status;
                    if status == RecordingStatus::Ended {
                        recording.tm_end = Some(Utc::now());
                    }
                }
                Ok(())
            })
            .await?;
        self.release(&recording, false).await;

        info!(recording_id = %id, status = ?recording.status, "recording stopped");
        Ok(recording)
    }

    /// Stop the recording if it still runs, then soft delete it
    pub async fn delete(&self, id: Uuid) -> Result<Recording> {
        self.stop(id).await?;
        self.ctx.db.recording_delete(id).await?;
        self.get(id).await
    }

    /// Our recording behind a PBX recording name, if any
    async fn by_name(&self, name: &str) -> Result<Option<Recording>> {
        let Ok(id) = Uuid::parse_str(name) else {
            debug!(recording = name, "recording name is not ours");
            return Ok(None);
        };
        self.ctx.db.recording_get(id).await
    }

    /// The PBX began writing the recording
    pub async fn started(&self, name: &str) -> Result<()> {
        let Some(recording) = self.by_name(name).await? else {
            return Ok(());
        };
        self.update(recording.id, |recording| {
            if recording.status == RecordingStatus::Initiating {
                recording.status = RecordingStatus::Recording;
                recording.tm_start = Some(Utc::now());
            }
            Ok(())
        })
        .await?;
        debug!(recording_id = %recording.id, "recording is running");
        Ok(())
    }

    /// The PBX finished the recording, because it was stopped or on its own
    /// (max duration, silence, terminate key). Replays change nothing.
    pub async fn finished(&self, name: &str) -> Result<()> {
        let Some(recording) = self.by_name(name).await? else {
            return Ok(());
        };
        if recording.is_ended() {
            debug!(recording_id = %recording.id, "recording already ended");
            return Ok(());
        }

        let recording = self.mark(recording.id, RecordingStatus::Ended).await?;
        self.release(&recording, false).await;
        info!(
            recording_id = %recording.id,
            reference_id = %recording.reference_id,
            "recording finished"
        );
        Ok(())
    }
}

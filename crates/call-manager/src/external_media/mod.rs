//! External Media Bridge
//!
//! Opens an RTP (or audiosocket) leg on the PBX and bridges it to a call or
//! a confbridge so audio can be tapped or injected from outside.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::call::CallHandler;
use crate::context::ServiceContext;
use crate::error::{CallManagerError, Result};
use crate::models::channel::{CONTEXT_EXTERNAL_MEDIA, VAR_UNICAST_LOCAL_ADDRESS, VAR_UNICAST_LOCAL_PORT};
use crate::models::{
    Channel, ChannelCause, ConnectionType, Encapsulation, ExternalMedia, ExternalMediaStatus, MediaDirection,
    ReferenceType, Transport,
};
use crate::pbx::{ExternalMediaChannelRequest, BRIDGE_TYPE_MIXING};
use crate::store::ListFilter;

const DEFAULT_FORMAT: &str = "ulaw";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExternalMediaRequest {
    pub id: Option<Uuid>,
    pub reference_type: ReferenceType,
    pub reference_id: Uuid,
    pub external_host: String,
    pub encapsulation: Encapsulation,
    pub transport: Transport,
    pub connection_type: ConnectionType,
    pub format: String,
    pub direction: MediaDirection,
}

/// serde name of a wire enum
fn wire_name<T: Serialize>(value: &T) -> String {
    serde_json::to_value(value)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_default()
}

/// Local RTP endpoint the PBX negotiated for an external media channel
pub fn local_endpoint(channel: &Channel) -> Option<(String, u16)> {
    let address = channel.variable(VAR_UNICAST_LOCAL_ADDRESS).filter(|a| !a.is_empty())?;
    let port = channel.variable(VAR_UNICAST_LOCAL_PORT)?.parse().ok()?;
    Some((address.to_string(), port))
}

#[derive(Clone)]
pub struct ExternalMediaHandler {
    ctx: Arc<ServiceContext>,
}

impl ExternalMediaHandler {
    pub fn new(ctx: Arc<ServiceContext>) -> Self {
        Self { ctx }
    }

    pub async fn get(&self, id: Uuid) -> Result<ExternalMedia> {
        self.ctx
            .db
            .external_media_get(id)
            .await?
            .ok_or_else(|| CallManagerError::not_found(format!("external media {} not found", id)))
    }

    pub async fn list(&self, filter: &ListFilter) -> Result<Vec<ExternalMedia>> {
        self.ctx.db.external_media_list(filter).await
    }

    async fn running(&self, id: Option<Uuid>) -> Result<bool> {
        let Some(id) = id else {
            return Ok(false);
        };
        Ok(self
            .ctx
            .db
            .external_media_get(id)
            .await?
            .map_or(false, |em| em.is_running()))
    }

    /// Open the media leg and bridge it to its reference
    pub async fn start(&self, request: ExternalMediaRequest) -> Result<ExternalMedia> {
        if request.external_host.is_empty() {
            return Err(CallManagerError::invalid_input("external host is empty"));
        }

        // the node and, for a call, the channel the media leg gets bridged to
        let (node_id, call_channel_id, confbridge_bridge_id) = match request.reference_type {
            ReferenceType::Call => {
                let call = CallHandler::new(self.ctx.clone()).get(request.reference_id).await?;
                if call.status.is_hanging_up() {
                    return Err(CallManagerError::invalid_state(format!("call {} is hanging up", call.id)));
                }
                if self.running(call.external_media_id).await? {
                    return Err(CallManagerError::invalid_state(format!(
                        "call {} already has external media",
                        call.id
                    )));
                }
                let node_id = self.ctx.channel_node(&call.channel_id).await?;
                (node_id, Some(call.channel_id), None)
            }
            ReferenceType::Confbridge => {
                let confbridge = self
                    .ctx
                    .db
                    .confbridge_get(request.reference_id)
                    .await?
                    .ok_or_else(|| {
                        CallManagerError::not_found(format!("confbridge {} not found", request.reference_id))
                    })?;
                if !confbridge.is_live() {
                    return Err(CallManagerError::invalid_state(format!(
                        "confbridge {} is not live",
                        confbridge.id
                    )));
                }
                if self.running(confbridge.external_media_id).await? {
                    return Err(CallManagerError::invalid_state(format!(
                        "confbridge {} already has external media",
                        confbridge.id
                    )));
                }
                let node_id = if confbridge.asterisk_id.is_empty() {
                    self.ctx.default_node_id().to_string()
                } else {
                    confbridge.asterisk_id.clone()
                };
                (node_id, None, Some(confbridge.bridge_id))
            }
        };

        let id = request.id.unwrap_or_else(Uuid::new_v4);
        let format = if request.format.is_empty() {
            DEFAULT_FORMAT.to_string()
        } else {
            request.format.clone()
        };
        let channel_request = ExternalMediaChannelRequest {
            channel_id: Uuid::new_v4().to_string(),
            app_args: format!(
                "context={},reference_type={},reference_id={},external_media_id={}",
                CONTEXT_EXTERNAL_MEDIA,
                wire_name(&request.reference_type),
                request.reference_id,
                id
            ),
            external_host: request.external_host.clone(),
            encapsulation: wire_name(&request.encapsulation),
            transport: wire_name(&request.transport),
            connection_type: wire_name(&request.connection_type),
            format: format.clone(),
            direction: wire_name(&request.direction),
        };
        let media_channel = self.ctx.pbx.external_media_create(&node_id, &channel_request).await?;

        let Some((local_ip, local_port)) = local_endpoint(&media_channel) else {
            self.hangup_quietly(&node_id, &media_channel.id).await;
            return Err(CallManagerError::pbx(format!(
                "external media channel {} has no local endpoint",
                media_channel.id
            )));
        };

        let bridge_id = match self
            .attach(&node_id, id, &media_channel.id, call_channel_id.as_deref(), confbridge_bridge_id.as_deref())
            .await
        {
            Ok(bridge_id) => bridge_id,
            Err(e) => {
                self.hangup_quietly(&node_id, &media_channel.id).await;
                return Err(e);
            }
        };

        let now = Utc::now();
        let external_media = ExternalMedia {
            id,
            asterisk_id: node_id,
            channel_id: media_channel.id,
            bridge_id,
            reference_type: request.reference_type,
            reference_id: request.reference_id,
            status: ExternalMediaStatus::Running,
            local_ip,
            local_port,
            external_host: request.external_host,
            encapsulation: request.encapsulation,
            transport: request.transport,
            connection_type: request.connection_type,
            format,
            direction: request.direction,
            tm_create: Some(now),
            tm_update: Some(now),
            tm_delete: None,
        };
        self.ctx.db.external_media_save(&external_media).await?;
        self.set_reference(&external_media, Some(id)).await?;

        info!(
            external_media_id = %id,
            reference_id = %external_media.reference_id,
            local = %format!("{}:{}", external_media.local_ip, external_media.local_port),
            "external media started"
        );
        Ok(external_media)
    }

    /// Bridge the media channel. Returns the dedicated bridge id, empty when
    /// the leg rides on a confbridge's bridge.
    async fn attach(
        &self,
        node_id: &str,
        id: Uuid,
        media_channel_id: &str,
        call_channel_id: Option<&str>,
        confbridge_bridge_id: Option<&str>,
    ) -> Result<String> {
        if let Some(bridge_id) = confbridge_bridge_id {
            self.ctx.pbx.bridge_add_channel(node_id, bridge_id, media_channel_id).await?;
            return Ok(String::new());
        }

        let bridge_id = Uuid::new_v4().to_string();
        let name = format!("reference_type=external_media,reference_id={}", id);
        self.ctx.pbx.bridge_create(node_id, &bridge_id, BRIDGE_TYPE_MIXING, &name).await?;
        if let Some(call_channel_id) = call_channel_id {
            self.ctx.pbx.bridge_add_channel(node_id, &bridge_id, call_channel_id).await?;
        }
        self.ctx.pbx.bridge_add_channel(node_id, &bridge_id, media_channel_id).await?;
        Ok(bridge_id)
    }

    async fn hangup_quietly(&self, node_id: &str, channel_id: &str) {
        if let Err(e) = self
            .ctx
            .pbx
            .channel_hangup(node_id, channel_id, ChannelCause::NORMAL_CLEARING)
            .await
        {
            debug!(channel_id, error = %e, "could not hang up external media channel");
        }
    }

    async fn set_reference(&self, external_media: &ExternalMedia, value: Option<Uuid>) -> Result<()> {
        let id = external_media.id;
        let result = match external_media.reference_type {
            ReferenceType::Call => CallHandler::new(self.ctx.clone())
                .update(external_media.reference_id, |call| {
                    if value.is_some() || call.external_media_id == Some(id) {
                        call.external_media_id = value;
                    }
                    Ok(())
                })
                .await
                .map(|_| ()),
            ReferenceType::Confbridge => {
                let _guard = self.ctx.locks.confbridge(external_media.reference_id).await;
                match self.ctx.db.confbridge_get(external_media.reference_id).await? {
                    Some(mut confbridge) => {
                        if value.is_some() || confbridge.external_media_id == Some(id) {
                            confbridge.external_media_id = value;
                            confbridge.tm_update = Some(Utc::now());
                            self.ctx.db.confbridge_save(&confbridge).await?;
                        }
                        Ok(())
                    }
                    None => Ok(()),
                }
            }
        };
        match result {
            Err(e) if e.is_not_found() => Ok(()),
            other => other,
        }
    }

    async fn mark_terminated(&self, id: Uuid) -> Result<Option<ExternalMedia>> {
        let _guard = self.ctx.locks.external_media(id).await;
        let mut external_media = self.get(id).await?;
        if !external_media.is_running() {
            return Ok(None);
        }
        external_media.status = ExternalMediaStatus::Terminated;
        external_media.tm_update = Some(Utc::now());
        self.ctx.db.external_media_save(&external_media).await?;
        Ok(Some(external_media))
    }

    /// Tear the media leg down. Stopping a stopped leg returns it unchanged.
    pub async fn stop(&self, id: Uuid) -> Result<ExternalMedia> {
        let Some(external_media) = self.mark_terminated(id).await? else {
            debug!(external_media_id = %id, "external media already stopped");
            return self.get(id).await;
        };

        self.hangup_quietly(&external_media.asterisk_id, &external_media.channel_id).await;
        self.release(&external_media).await?;

        info!(external_media_id = %id, "external media stopped");
        Ok(external_media)
    }

    /// The media channel disappeared on the PBX side
    pub async fn channel_destroyed(&self, channel: &Channel) -> Result<()> {
        let Some(external_media) = self.ctx.db.external_media_get_by_channel_id(&channel.id).await? else {
            return Ok(());
        };
        let Some(external_media) = self.mark_terminated(external_media.id).await? else {
            return Ok(());
        };

        self.release(&external_media).await?;
        info!(external_media_id = %external_media.id, channel_id = %channel.id, "external media channel ended");
        Ok(())
    }

    async fn release(&self, external_media: &ExternalMedia) -> Result<()> {
        if !external_media.bridge_id.is_empty() {
            if let Err(e) = self
                .ctx
                .pbx
                .bridge_delete(&external_media.asterisk_id, &external_media.bridge_id)
                .await
            {
                warn!(external_media_id = %external_media.id, error = %e, "bridge delete failed");
            }
        }
        self.set_reference(external_media, None).await
    }

    pub async fn delete(&self, id: Uuid) -> Result<ExternalMedia> {
        self.stop(id).await?;
        self.ctx.db.external_media_delete(id).await?;
        self.get(id).await
    }
}

//! Outbound control commands to the PBX
//!
//! The wire protocol lives outside this crate; implementations of
//! [`PbxClient`] translate these calls into the PBX's own requests.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::error::Result;
use crate::models::{Channel, ChannelCause};

/// Bridge mixing type used for confbridges and external media bridges
pub const BRIDGE_TYPE_MIXING: &str = "mixing";

/// Originate a new channel into the stasis application
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OriginateRequest {
    pub channel_id: String,
    pub endpoint: String,
    pub app_args: String,
    pub caller_id: String,
    pub variables: HashMap<String, String>,
}

/// Open an external media channel
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExternalMediaChannelRequest {
    pub channel_id: String,
    pub app_args: String,
    pub external_host: String,
    pub encapsulation: String,
    pub transport: String,
    pub connection_type: String,
    pub format: String,
    pub direction: String,
}

/// Record a channel or a bridge
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordRequest {
    pub name: String,
    pub format: String,
    pub max_duration_secs: u64,
    pub max_silence_secs: u64,
    pub beep: bool,
    pub terminate_on: String,
}

/// Control surface of the PBX
///
/// Every command is addressed to the node that owns the channel or bridge.
#[async_trait]
pub trait PbxClient: Send + Sync {
    async fn channel_create(&self, node_id: &str, request: &OriginateRequest) -> Result<()>;

    /// Look up a channel on the PBX; an error means it is gone
    async fn channel_get(&self, node_id: &str, channel_id: &str) -> Result<Channel>;

    async fn channel_answer(&self, node_id: &str, channel_id: &str) -> Result<()>;

    async fn channel_ring(&self, node_id: &str, channel_id: &str) -> Result<()>;

    async fn channel_hangup(&self, node_id: &str, channel_id: &str, cause: ChannelCause) -> Result<()>;

    async fn channel_play(&self, node_id: &str, channel_id: &str, playback_id: &str, media_urls: &[String]) -> Result<()>;

    async fn playback_stop(&self, node_id: &str, playback_id: &str) -> Result<()>;

    async fn channel_dtmf_send(
        &self,
        node_id: &str,
        channel_id: &str,
        digits: &str,
        duration_ms: u64,
        interval_ms: u64,
    ) -> Result<()>;

    /// Move the channel into a dialplan service context (echo, stream echo)
    async fn channel_continue(&self, node_id: &str, channel_id: &str, context: &str, exten: &str) -> Result<()>;

    async fn channel_record(&self, node_id: &str, channel_id: &str, request: &RecordRequest) -> Result<()>;

    async fn recording_stop(&self, node_id: &str, recording_name: &str) -> Result<()>;

    /// Returns the created channel, carrying the negotiated local endpoint in its variables
    async fn external_media_create(&self, node_id: &str, request: &ExternalMediaChannelRequest) -> Result<Channel>;

    async fn bridge_create(&self, node_id: &str, bridge_id: &str, bridge_type: &str, name: &str) -> Result<()>;

    async fn bridge_delete(&self, node_id: &str, bridge_id: &str) -> Result<()>;

    async fn bridge_add_channel(&self, node_id: &str, bridge_id: &str, channel_id: &str) -> Result<()>;

    async fn bridge_remove_channel(&self, node_id: &str, bridge_id: &str, channel_id: &str) -> Result<()>;

    async fn bridge_record(&self, node_id: &str, bridge_id: &str, request: &RecordRequest) -> Result<()>;
}

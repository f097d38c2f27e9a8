//! Shared service state handed to every handler

use std::sync::Arc;

use rvoip_infra_common::TaskManager;

use crate::config::CallManagerConfig;
use crate::error::Result;
use crate::flow::{FlowRepository, VariableStore};
use crate::monitoring::MetricsCollector;
use crate::pbx::PbxClient;
use crate::store::{Database, IdentityLocks};
use crate::transport::Requester;

/// Collaborators and shared state of one call manager instance
///
/// Handlers are thin views over an `Arc<ServiceContext>` and are built on
/// demand, so a handler calling into another component just constructs it.
pub struct ServiceContext {
    pub config: CallManagerConfig,
    pub db: Arc<dyn Database>,
    pub pbx: Arc<dyn PbxClient>,
    pub requester: Arc<dyn Requester>,
    pub flows: Arc<dyn FlowRepository>,
    pub variables: Arc<dyn VariableStore>,
    pub locks: IdentityLocks,
    pub metrics: MetricsCollector,
    pub tasks: Arc<TaskManager>,
}

impl ServiceContext {
    pub fn new(
        config: CallManagerConfig,
        db: Arc<dyn Database>,
        pbx: Arc<dyn PbxClient>,
        requester: Arc<dyn Requester>,
        flows: Arc<dyn FlowRepository>,
        variables: Arc<dyn VariableStore>,
        tasks: Arc<TaskManager>,
    ) -> Self {
        Self {
            config,
            db,
            pbx,
            requester,
            flows,
            variables,
            locks: IdentityLocks::new(),
            metrics: MetricsCollector::new(),
            tasks,
        }
    }

    pub fn default_node_id(&self) -> &str {
        &self.config.general.default_node_id
    }

    /// PBX node owning a channel, falling back to the default node for unknown channels
    pub async fn channel_node(&self, channel_id: &str) -> Result<String> {
        Ok(match self.db.channel_get(channel_id).await? {
            Some(channel) if !channel.asterisk_id.is_empty() => channel.asterisk_id,
            _ => self.default_node_id().to_string(),
        })
    }
}

//! Persistence port and per-identity serialization
//!
//! The persistence layer is an external collaborator: records are read and
//! saved whole by id, listed with a filter and soft deleted. Handlers do
//! read-modify-write under an [`IdentityLocks`] guard for the record's id.

pub mod locks;
pub mod memory;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::Result;
use crate::models::{Activeflow, Call, Channel, Confbridge, ExternalMedia, Groupcall, Recording};

pub use locks::IdentityLocks;
pub use memory::MemoryDatabase;

/// Filter for list queries
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ListFilter {
    pub customer_id: Option<Uuid>,
    pub include_deleted: bool,
    pub limit: Option<usize>,
}

impl ListFilter {
    pub fn customer(customer_id: Uuid) -> Self {
        Self {
            customer_id: Some(customer_id),
            ..Default::default()
        }
    }
}

/// Record storage used by every handler
#[async_trait]
pub trait Database: Send + Sync {
    async fn channel_get(&self, id: &str) -> Result<Option<Channel>>;
    async fn channel_save(&self, channel: &Channel) -> Result<()>;
    async fn channel_delete(&self, id: &str) -> Result<()>;

    async fn call_get(&self, id: Uuid) -> Result<Option<Call>>;
    async fn call_get_by_channel_id(&self, channel_id: &str) -> Result<Option<Call>>;
    async fn call_save(&self, call: &Call) -> Result<()>;
    async fn call_list(&self, filter: &ListFilter) -> Result<Vec<Call>>;
    async fn call_delete(&self, id: Uuid) -> Result<()>;

    async fn groupcall_get(&self, id: Uuid) -> Result<Option<Groupcall>>;
    async fn groupcall_save(&self, groupcall: &Groupcall) -> Result<()>;
    async fn groupcall_list(&self, filter: &ListFilter) -> Result<Vec<Groupcall>>;
    async fn groupcall_delete(&self, id: Uuid) -> Result<()>;

    async fn confbridge_get(&self, id: Uuid) -> Result<Option<Confbridge>>;
    async fn confbridge_get_by_bridge_id(&self, bridge_id: &str) -> Result<Option<Confbridge>>;
    /// Live (not terminated, not deleted) confbridge bound to a reference id
    async fn confbridge_get_live_by_reference(&self, reference_id: Uuid) -> Result<Option<Confbridge>>;
    async fn confbridge_save(&self, confbridge: &Confbridge) -> Result<()>;
    async fn confbridge_list(&self, filter: &ListFilter) -> Result<Vec<Confbridge>>;
    async fn confbridge_delete(&self, id: Uuid) -> Result<()>;

    async fn external_media_get(&self, id: Uuid) -> Result<Option<ExternalMedia>>;
    async fn external_media_get_by_channel_id(&self, channel_id: &str) -> Result<Option<ExternalMedia>>;
    async fn external_media_save(&self, external_media: &ExternalMedia) -> Result<()>;
    async fn external_media_list(&self, filter: &ListFilter) -> Result<Vec<ExternalMedia>>;
    async fn external_media_delete(&self, id: Uuid) -> Result<()>;

    async fn recording_get(&self, id: Uuid) -> Result<Option<Recording>>;
    async fn recording_save(&self, recording: &Recording) -> Result<()>;
    async fn recording_list(&self, filter: &ListFilter) -> Result<Vec<Recording>>;
    async fn recording_delete(&self, id: Uuid) -> Result<()>;

    async fn activeflow_get(&self, id: Uuid) -> Result<Option<Activeflow>>;
    async fn activeflow_save(&self, activeflow: &Activeflow) -> Result<()>;
}

//! Peer flow service: flow definitions and per-activeflow variables

pub mod variables;

use std::collections::HashMap;

use async_trait::async_trait;
use dashmap::DashMap;
use uuid::Uuid;

use crate::error::{CallManagerError, Result};
use crate::models::Action;

pub use variables::{substitute, substitute_json};

/// Resolves flow ids to their ordered action lists
#[async_trait]
pub trait FlowRepository: Send + Sync {
    async fn flow_actions(&self, flow_id: Uuid) -> Result<Vec<Action>>;
}

/// Variable store keyed by activeflow
#[async_trait]
pub trait VariableStore: Send + Sync {
    async fn variables(&self, activeflow_id: Uuid) -> Result<HashMap<String, String>>;

    /// Merge `values` into the activeflow's variables
    async fn set_variables(&self, activeflow_id: Uuid, values: HashMap<String, String>) -> Result<()>;
}

/// In-process flow definitions
#[derive(Default)]
pub struct MemoryFlowRepository {
    flows: DashMap<Uuid, Vec<Action>>,
}

impl MemoryFlowRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, flow_id: Uuid, actions: Vec<Action>) {
        self.flows.insert(flow_id, actions);
    }
}

#[async_trait]
impl FlowRepository for MemoryFlowRepository {
    async fn flow_actions(&self, flow_id: Uuid) -> Result<Vec<Action>> {
        self.flows
            .get(&flow_id)
            .map(|actions| actions.clone())
            .ok_or_else(|| CallManagerError::not_found(format!("flow {} not found", flow_id)))
    }
}

/// In-process variable store
#[derive(Default)]
pub struct MemoryVariableStore {
    variables: DashMap<Uuid, HashMap<String, String>>,
}

impl MemoryVariableStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl VariableStore for MemoryVariableStore {
    async fn variables(&self, activeflow_id: Uuid) -> Result<HashMap<String, String>> {
        Ok(self
            .variables
            .get(&activeflow_id)
            .map(|v| v.clone())
            .unwrap_or_default())
    }

    async fn set_variables(&self, activeflow_id: Uuid, values: HashMap<String, String>) -> Result<()> {
        self.variables.entry(activeflow_id).or_default().extend(values);
        Ok(())
    }
}

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use uuid::Uuid;

use super::{Database, ListFilter};
use crate::error::{CallManagerError, Result};
use crate::models::{Activeflow, Call, Channel, Confbridge, ExternalMedia, Groupcall, Recording};

/// In-process [`Database`] backed by `DashMap` tables
#[derive(Default)]
pub struct MemoryDatabase {
    channels: DashMap<String, Channel>,
    calls: DashMap<Uuid, Call>,
    call_by_channel: DashMap<String, Uuid>,
    groupcalls: DashMap<Uuid, Groupcall>,
    confbridges: DashMap<Uuid, Confbridge>,
    external_medias: DashMap<Uuid, ExternalMedia>,
    recordings: DashMap<Uuid, Recording>,
    activeflows: DashMap<Uuid, Activeflow>,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }
}

fn filtered<T: Clone>(
    table: &DashMap<Uuid, T>,
    filter: &ListFilter,
    meta: impl Fn(&T) -> (Uuid, Option<DateTime<Utc>>, Option<DateTime<Utc>>),
) -> Vec<T> {
    let mut rows: Vec<(Option<DateTime<Utc>>, T)> = table
        .iter()
        .filter_map(|entry| {
            let (customer_id, tm_create, tm_delete) = meta(entry.value());
            if !filter.include_deleted && tm_delete.is_some() {
                return None;
            }
            if filter.customer_id.map_or(false, |c| c != customer_id) {
                return None;
            }
            Some((tm_create, entry.value().clone()))
        })
        .collect();

    // newest first
    rows.sort_by(|a, b| b.0.cmp(&a.0));
    let limit = filter.limit.unwrap_or(usize::MAX);
    rows.into_iter().take(limit).map(|(_, row)| row).collect()
}

fn missing(kind: &str, id: impl std::fmt::Display) -> CallManagerError {
    CallManagerError::not_found(format!("{} {} not found", kind, id))
}

#[async_trait]
impl Database for MemoryDatabase {
    async fn channel_get(&self, id: &str) -> Result<Option<Channel>> {
        Ok(self.channels.get(id).map(|c| c.clone()))
    }

    async fn channel_save(&self, channel: &Channel) -> Result<()> {
        self.channels.insert(channel.id.clone(), channel.clone());
        Ok(())
    }

    async fn channel_delete(&self, id: &str) -> Result<()> {
        let mut channel = self.channels.get_mut(id).ok_or_else(|| missing("channel", id))?;
        if channel.tm_delete.is_none() {
            channel.tm_delete = Some(Utc::now());
        }
        Ok(())
    }

    async fn call_get(&self, id: Uuid) -> Result<Option<Call>> {
        Ok(self.calls.get(&id).map(|c| c.clone()))
    }

    async fn call_get_by_channel_id(&self, channel_id: &str) -> Result<Option<Call>> {
        let Some(call_id) = self.call_by_channel.get(channel_id).map(|id| *id) else {
            return Ok(None);
        };
        Ok(self.calls.get(&call_id).map(|c| c.clone()))
    }

    async fn call_save(&self, call: &Call) -> Result<()> {
        if !call.channel_id.is_empty() {
            self.call_by_channel.insert(call.channel_id.clone(), call.id);
        }
        self.calls.insert(call.id, call.clone());
        Ok(())
    }

    async fn call_list(&self, filter: &ListFilter) -> Result<Vec<Call>> {
        Ok(filtered(&self.calls, filter, |c| (c.customer_id, c.tm_create, c.tm_delete)))
    }

    async fn call_delete(&self, id: Uuid) -> Result<()> {
        let mut call = self.calls.get_mut(&id).ok_or_else(|| missing("call", id))?;
        if call.tm_delete.is_none() {
            call.tm_delete = Some(Utc::now());
        }
        Ok(())
    }

    async fn groupcall_get(&self, id: Uuid) -> Result<Option<Groupcall>> {
        Ok(self.groupcalls.get(&id).map(|g| g.clone()))
    }

    async fn groupcall_save(&self, groupcall: &Groupcall) -> Result<()> {
        self.groupcalls.insert(groupcall.id, groupcall.clone());
        Ok(())
    }

    async fn groupcall_list(&self, filter: &ListFilter) -> Result<Vec<Groupcall>> {
        Ok(filtered(&self.groupcalls, filter, |g| (g.customer_id, g.tm_create, g.tm_delete)))
    }

    async fn groupcall_delete(&self, id: Uuid) -> Result<()> {
        let mut groupcall = self.groupcalls.get_mut(&id).ok_or_else(|| missing("groupcall", id))?;
        if groupcall.tm_delete.is_none() {
            groupcall.tm_delete = Some(Utc::now());
        }
        Ok(())
    }

    async fn confbridge_get(&self, id: Uuid) -> Result<Option<Confbridge>> {
        Ok(self.confbridges.get(&id).map(|c| c.clone()))
    }

    async fn confbridge_get_by_bridge_id(&self, bridge_id: &str) -> Result<Option<Confbridge>> {
        Ok(self
            .confbridges
            .iter()
            .find(|c| c.bridge_id == bridge_id && c.tm_delete.is_none())
            .map(|c| c.clone()))
    }

    async fn confbridge_get_live_by_reference(&self, reference_id: Uuid) -> Result<Option<Confbridge>> {
        Ok(self
            .confbridges
            .iter()
            .find(|c| c.reference_id == reference_id && c.is_live() && c.tm_delete.is_none())
            .map(|c| c.clone()))
    }

    async fn confbridge_save(&self, confbridge: &Confbridge) -> Result<()> {
        self.confbridges.insert(confbridge.id, confbridge.clone());
        Ok(())
    }

    async fn confbridge_list(&self, filter: &ListFilter) -> Result<Vec<Confbridge>> {
        Ok(filtered(&self.confbridges, filter, |c| (c.customer_id, c.tm_create, c.tm_delete)))
    }

    async fn confbridge_delete(&self, id: Uuid) -> Result<()> {
        let mut confbridge = self.confbridges.get_mut(&id).ok_or_else(|| missing("confbridge", id))?;
        if confbridge.tm_delete.is_none() {
            confbridge.tm_delete = Some(Utc::now());
        }
        Ok(())
    }

    async fn external_media_get(&self, id: Uuid) -> Result<Option<ExternalMedia>> {
        Ok(self.external_medias.get(&id).map(|e| e.clone()))
    }

    async fn external_media_get_by_channel_id(&self, channel_id: &str) -> Result<Option<ExternalMedia>> {
        Ok(self
            .external_medias
            .iter()
            .find(|e| e.channel_id == channel_id)
            .map(|e| e.clone()))
    }

    async fn external_media_save(&self, external_media: &ExternalMedia) -> Result<()> {
        self.external_medias.insert(external_media.id, external_media.clone());
        Ok(())
    }

    async fn external_media_list(&self, filter: &ListFilter) -> Result<Vec<ExternalMedia>> {
        // external media rows carry no customer; filter by deletion only
        let unscoped = ListFilter {
            customer_id: None,
            ..filter.clone()
        };
        Ok(filtered(&self.external_medias, &unscoped, |e| (Uuid::nil(), e.tm_create, e.tm_delete)))
    }

    async fn external_media_delete(&self, id: Uuid) -> Result<()> {
        let mut external_media = self
            .external_medias
            .get_mut(&id)
            .ok_or_else(|| missing("external media", id))?;
        if external_media.tm_delete.is_none() {
            external_media.tm_delete = Some(Utc::now());
        }
        Ok(())
    }

    async fn recording_get(&self, id: Uuid) -> Result<Option<Recording>> {
        Ok(self.recordings.get(&id).map(|r| r.clone()))
    }

    async fn recording_save(&self, recording: &Recording) -> Result<()> {
        self.recordings.insert(recording.id, recording.clone());
        Ok(())
    }

    async fn recording_list(&self, filter: &ListFilter) -> Result<Vec<Recording>> {
        Ok(filtered(&self.recordings, filter, |r| (r.customer_id, r.tm_create, r.tm_delete)))
    }

    async fn recording_delete(&self, id: Uuid) -> Result<()> {
        let mut recording = self.recordings.get_mut(&id).ok_or_else(|| missing("recording", id))?;
        if recording.tm_delete.is_none() {
            recording.tm_delete = Some(Utc::now());
        }
        Ok(())
    }

    async fn activeflow_get(&self, id: Uuid) -> Result<Option<Activeflow>> {
        Ok(self.activeflows.get(&id).map(|a| a.clone()))
    }

    async fn activeflow_save(&self, activeflow: &Activeflow) -> Result<()> {
        self.activeflows.insert(activeflow.id, activeflow.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(customer_id: Uuid, channel_id: &str) -> Call {
        Call {
            id: Uuid::new_v4(),
            customer_id,
            channel_id: channel_id.to_string(),
            tm_create: Some(Utc::now()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_call_channel_index() {
        let db = MemoryDatabase::new();
        let c = call(Uuid::new_v4(), "ch-1");
        db.call_save(&c).await.unwrap();

        let found = db.call_get_by_channel_id("ch-1").await.unwrap().unwrap();
        assert_eq!(found.id, c.id);
        assert!(db.call_get_by_channel_id("ch-2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_soft_delete_hides_from_list() {
        let db = MemoryDatabase::new();
        let customer = Uuid::new_v4();
        let a = call(customer, "ch-a");
        let b = call(customer, "ch-b");
        let other = call(Uuid::new_v4(), "ch-c");
        for c in [&a, &b, &other] {
            db.call_save(c).await.unwrap();
        }

        db.call_delete(a.id).await.unwrap();
        let listed = db.call_list(&ListFilter::customer(customer)).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, b.id);

        // soft deleted rows stay readable by id
        assert!(db.call_get(a.id).await.unwrap().unwrap().tm_delete.is_some());

        let all = db
            .call_list(&ListFilter {
                include_deleted: true,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(all.len(), 3);
    }

    #[tokio::test]
    async fn test_delete_unknown_is_not_found() {
        let db = MemoryDatabase::new();
        let err = db.call_delete(Uuid::new_v4()).await.unwrap_err();
        assert!(err.is_not_found());
    }
}

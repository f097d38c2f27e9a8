//! Channel Registry & Health Monitor
//!
//! Sole writer of [`Channel`] records. Every channel the PBX reports is
//! mirrored here, and a self-rescheduling health check keeps probing the PBX
//! until the channel ends. A channel that stops answering lookups is declared
//! dead and a synthetic `ChannelDestroyed` is fed back through the transport,
//! so everything waiting on it gets the same teardown a real hangup would.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::context::ServiceContext;
use crate::error::{CallManagerError, Result};
use crate::models::{synthetic_channel_destroyed, Channel, ChannelCause, ChannelState};
use crate::transport::Command;

/// What a single health check decided
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthCheckOutcome {
    /// Channel already ended; nothing scheduled
    Skipped,
    /// Another check was scheduled with this retry count
    Rescheduled { retry_count: u32 },
    /// Retries exhausted; the channel was ended and a destroyed event published
    Destroyed,
}

/// Retry count after one lookup. A live channel resets the counter.
pub fn next_retry_count(alive: bool, retry_count: u32) -> u32 {
    if alive {
        0
    } else {
        retry_count.saturating_add(1)
    }
}

#[derive(Clone)]
pub struct ChannelHandler {
    ctx: Arc<ServiceContext>,
}

impl ChannelHandler {
    pub fn new(ctx: Arc<ServiceContext>) -> Self {
        Self { ctx }
    }

    pub async fn get(&self, id: &str) -> Result<Channel> {
        self.ctx
            .db
            .channel_get(id)
            .await?
            .ok_or_else(|| CallManagerError::not_found(format!("channel {} not found", id)))
    }

    /// Register a channel reported by the PBX.
    ///
    /// A replayed create refreshes the mirrored fields but never revives an
    /// ended channel, and only the first create starts the health check.
    pub async fn create(&self, channel: Channel) -> Result<Channel> {
        let _guard = self.ctx.locks.channel(&channel.id).await;

        if let Some(mut existing) = self.ctx.db.channel_get(&channel.id).await? {
            debug!(channel_id = %channel.id, "channel create replayed");
            if !existing.is_ended() {
                existing.name = channel.name;
                existing.tech = channel.tech;
                if !channel.context.is_empty() {
                    existing.context = channel.context;
                }
                existing.state = channel.state;
                existing.data.extend(channel.data);
                existing.tm_update = Some(Utc::now());
                self.ctx.db.channel_save(&existing).await?;
            }
            return Ok(existing);
        }

        let now = Utc::now();
        let mut channel = channel;
        channel.tm_create.get_or_insert(now);
        channel.tm_update = Some(now);
        self.ctx.db.channel_save(&channel).await?;

        info!(
            channel_id = %channel.id,
            node = %channel.asterisk_id,
            context = %channel.context,
            "channel created"
        );

        let cfg = &self.ctx.config.channel;
        self.ctx
            .requester
            .send_delayed(
                Command::ChannelHealthCheck {
                    channel_id: channel.id.clone(),
                    retry_count: 0,
                    retry_count_max: cfg.health_check_retry_max,
                    delay_ms: cfg.health_check_delay_ms,
                },
                cfg.health_check_delay(),
            )
            .await?;

        Ok(channel)
    }

    async fn update<F>(&self, id: &str, f: F) -> Result<Channel>
    where
        F: FnOnce(&mut Channel),
    {
        let _guard = self.ctx.locks.channel(id).await;
        let mut channel = self.get(id).await?;
        f(&mut channel);
        channel.tm_update = Some(Utc::now());
        self.ctx.db.channel_save(&channel).await?;
        Ok(channel)
    }

    pub async fn update_state(&self, id: &str, state: ChannelState) -> Result<Channel> {
        self.update(id, |channel| {
            let now = Utc::now();
            match state {
                ChannelState::Ring | ChannelState::Ringing if channel.tm_ringing.is_none() => {
                    channel.tm_ringing = Some(now);
                }
                ChannelState::Up if channel.tm_answer.is_none() => {
                    channel.tm_answer = Some(now);
                }
                _ => {}
            }
            channel.state = state;
        })
        .await
    }

    pub async fn set_variable(&self, id: &str, key: &str, value: &str) -> Result<Channel> {
        self.update(id, |channel| {
            channel.data.insert(key.to_string(), value.to_string());
        })
        .await
    }

    pub async fn set_bridge_id(&self, id: &str, bridge_id: &str) -> Result<Channel> {
        self.update(id, |channel| channel.bridge_id = bridge_id.to_string()).await
    }

    pub async fn set_playback_id(&self, id: &str, playback_id: &str) -> Result<Channel> {
        self.update(id, |channel| channel.playback_id = playback_id.to_string()).await
    }

    pub async fn set_stasis(&self, id: &str, stasis_name: &str) -> Result<Channel> {
        self.update(id, |channel| channel.stasis_name = stasis_name.to_string()).await
    }

    /// Mark the channel ended and soft delete it.
    ///
    /// Returns false when the channel is unknown or already ended.
    pub async fn end_and_delete(&self, id: &str, cause: ChannelCause) -> Result<bool> {
        let _guard = self.ctx.locks.channel(id).await;

        let Some(mut channel) = self.ctx.db.channel_get(id).await? else {
            debug!(channel_id = %id, "end for unknown channel");
            return Ok(false);
        };
        if channel.is_ended() {
            debug!(channel_id = %id, "channel already ended");
            return Ok(false);
        }

        let now = Utc::now();
        channel.hangup_cause = cause;
        channel.tm_end = Some(now);
        channel.tm_update = Some(now);
        self.ctx.db.channel_save(&channel).await?;
        self.ctx.db.channel_delete(id).await?;

        info!(channel_id = %id, cause = cause.0, "channel ended");
        Ok(true)
    }

    /// One round of the channel health poll
    pub async fn health_check(
        &self,
        id: &str,
        retry_count: u32,
        retry_count_max: u32,
        delay: Duration,
    ) -> Result<HealthCheckOutcome> {
        let channel = self.get(id).await?;
        if channel.is_ended() {
            debug!(channel_id = %id, "health check on ended channel ignored");
            return Ok(HealthCheckOutcome::Skipped);
        }

        let lookup = self.ctx.pbx.channel_get(&channel.asterisk_id, id).await;
        if let Err(e) = &lookup {
            debug!(channel_id = %id, retry_count, error = %e, "channel lookup failed");
        }
        let retry_count = next_retry_count(lookup.is_ok(), retry_count);

        if retry_count >= retry_count_max {
            warn!(channel_id = %id, retry_count, "channel health check exhausted, declaring channel dead");
            self.ctx.metrics.record_health_check_exhausted();

            if self.end_and_delete(id, ChannelCause::INTERWORKING).await? {
                let event = synthetic_channel_destroyed(&channel, ChannelCause::INTERWORKING)?;
                self.ctx.requester.publish_event(event).await?;
            }
            return Ok(HealthCheckOutcome::Destroyed);
        }

        self.ctx
            .requester
            .send_delayed(
                Command::ChannelHealthCheck {
                    channel_id: id.to_string(),
                    retry_count,
                    retry_count_max,
                    delay_ms: delay.as_millis() as u64,
                },
                delay,
            )
            .await?;

        Ok(HealthCheckOutcome::Rescheduled { retry_count })
    }
}

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CallManagerError, Result};

/// Environment variable prefix, e.g. `CALL_MANAGER__CHANNEL__HEALTH_CHECK_RETRY_MAX=3`
pub const ENV_PREFIX: &str = "CALL_MANAGER";

/// Call manager configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CallManagerConfig {
    /// General service settings
    pub general: GeneralConfig,

    /// Channel registry and health monitoring
    pub channel: ChannelConfig,

    /// Call state machine and action engine
    pub call: CallConfig,

    /// Groupcall orchestration
    pub groupcall: GroupcallConfig,

    /// Worker pool
    pub workers: WorkerConfig,

    /// Logging
    pub logging: LoggingSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GeneralConfig {
    /// Service name used in logs
    pub service_name: String,

    /// PBX node used when a command carries no node of its own
    pub default_node_id: String,

    /// Stasis application name channels are created into
    pub stasis_app: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ChannelConfig {
    /// Delay between channel health checks (milliseconds)
    pub health_check_delay_ms: u64,

    /// Consecutive failed health checks before a channel is declared dead
    pub health_check_retry_max: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CallConfig {
    /// Delay between call health checks (milliseconds)
    pub health_check_delay_ms: u64,

    /// Call health checks tolerated without a live channel
    pub health_check_retry_max: u32,

    /// Echo duration when the action gives none (milliseconds)
    pub default_echo_duration_ms: u64,

    /// Tone duration for digits_send when the action gives none (milliseconds)
    pub default_digit_duration_ms: u64,

    /// Gap between tones for digits_send when the action gives none (milliseconds)
    pub default_digit_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GroupcallConfig {
    /// Wait before dialing the next destination of a linear groupcall (milliseconds)
    pub linear_dial_delay_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WorkerConfig {
    /// Maximum concurrently tracked tasks
    pub max_tasks: usize,

    /// Grace period for tasks on shutdown (milliseconds)
    pub shutdown_timeout_ms: u64,

    /// Capacity of the internal command queue
    pub command_queue_size: usize,

    /// How often idle identity locks are dropped (milliseconds)
    pub lock_prune_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingSettings {
    pub level: String,
    pub json: bool,
}

impl Default for CallManagerConfig {
    fn default() -> Self {
        Self {
            general: GeneralConfig::default(),
            channel: ChannelConfig::default(),
            call: CallConfig::default(),
            groupcall: GroupcallConfig::default(),
            workers: WorkerConfig::default(),
            logging: LoggingSettings::default(),
        }
    }
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            service_name: "call-manager".to_string(),
            default_node_id: "pbx-0".to_string(),
            stasis_app: "voipbin".to_string(),
        }
    }
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            health_check_delay_ms: 10_000,
            health_check_retry_max: 2,
        }
    }
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            health_check_delay_ms: 10_000,
            health_check_retry_max: 2,
            default_echo_duration_ms: 180_000,
            default_digit_duration_ms: 100,
            default_digit_interval_ms: 500,
        }
    }
}

impl Default for GroupcallConfig {
    fn default() -> Self {
        Self {
            linear_dial_delay_ms: 1_000,
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_tasks: 10_000,
            shutdown_timeout_ms: 5_000,
            command_queue_size: 4_096,
            lock_prune_interval_ms: 60_000,
        }
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl ChannelConfig {
    pub fn health_check_delay(&self) -> Duration {
        Duration::from_millis(self.health_check_delay_ms)
    }
}

impl CallConfig {
    pub fn health_check_delay(&self) -> Duration {
        Duration::from_millis(self.health_check_delay_ms)
    }
}

impl GroupcallConfig {
    pub fn linear_dial_delay(&self) -> Duration {
        Duration::from_millis(self.linear_dial_delay_ms)
    }
}

impl WorkerConfig {
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    pub fn lock_prune_interval(&self) -> Duration {
        Duration::from_millis(self.lock_prune_interval_ms)
    }
}

impl CallManagerConfig {
    /// Load from defaults, an optional TOML file and `CALL_MANAGER__*` environment variables
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config = rvoip_infra_common::config::load_config(&Self::default(), path, ENV_PREFIX)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.channel.health_check_retry_max == 0 {
            return Err(CallManagerError::config("channel.health_check_retry_max must be at least 1"));
        }
        if self.call.health_check_retry_max == 0 {
            return Err(CallManagerError::config("call.health_check_retry_max must be at least 1"));
        }
        if self.channel.health_check_delay_ms == 0 || self.call.health_check_delay_ms == 0 {
            return Err(CallManagerError::config("health check delays must be non-zero"));
        }
        let workers = &self.workers;
        if workers.max_tasks == 0 || workers.command_queue_size == 0 || workers.lock_prune_interval_ms == 0 {
            return Err(CallManagerError::config("worker limits must be non-zero"));
        }
        Ok(())
    }
}

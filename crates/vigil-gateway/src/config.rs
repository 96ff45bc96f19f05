//! ---
//! vigil_section: "04-client-gateway"
//! vigil_subsection: "module"
//! vigil_type: "source"
//! vigil_scope: "code"
//! vigil_description: "Client messaging gateway over a publish/subscribe broker."
//! vigil_version: "v0.1.0"
//! vigil_owner: "tbd"
//! ---
use std::fs;
use std::path::Path;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds};
use tracing::debug;

use crate::error::{GatewayError, Result};

fn default_supervision_topic() -> String {
    "vigil.client.supervision".to_owned()
}

fn default_heartbeat_topic() -> String {
    "vigil.client.heartbeat".to_owned()
}

fn default_alarm_topic() -> String {
    "vigil.client.alarm".to_owned()
}

fn default_broadcast_topic() -> String {
    "vigil.client.broadcast".to_owned()
}

fn default_request_queue() -> String {
    "vigil.client.request".to_owned()
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_reply_ttl_factor() -> u32 {
    2
}

fn default_topic_message_ttl() -> Duration {
    Duration::from_secs(600)
}

fn default_base_delay() -> Duration {
    Duration::from_millis(500)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(5)
}

fn default_jitter() -> Duration {
    Duration::from_millis(100)
}

/// Settings for one gateway instance.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Topic carrying supervision event batches.
    #[serde(default = "default_supervision_topic")]
    pub supervision_topic: String,
    /// Topic carrying server heartbeats.
    #[serde(default = "default_heartbeat_topic")]
    pub heartbeat_topic: String,
    /// Topic carrying alarm updates.
    #[serde(default = "default_alarm_topic")]
    pub alarm_topic: String,
    /// Topic carrying administrative broadcasts.
    #[serde(default = "default_broadcast_topic")]
    pub broadcast_topic: String,
    /// Queue used by `send_default`.
    #[serde(default = "default_request_queue")]
    pub request_queue: String,
    /// Timeout used by `send_default`.
    #[serde(rename = "request_timeout_ms", default = "default_request_timeout")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub request_timeout: Duration,
    /// Request message lifetime as a multiple of the call timeout.
    #[serde(default = "default_reply_ttl_factor")]
    pub reply_ttl_factor: u32,
    /// Lifetime of messages published to topics.
    #[serde(rename = "topic_message_ttl_ms", default = "default_topic_message_ttl")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub topic_message_ttl: Duration,
    /// Reconnection backoff.
    #[serde(default)]
    pub reconnect: ReconnectConfig,
}

impl GatewayConfig {
    /// Read and validate a TOML file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        debug!(config_path = %path.display(), "loading gateway configuration");
        let contents = fs::read_to_string(path).map_err(|err| {
            GatewayError::Config(format!("unable to read {}: {err}", path.display()))
        })?;
        contents.parse()
    }

    /// Lifetime given to a request published with `timeout`.
    pub fn reply_ttl(&self, timeout: Duration) -> Duration {
        timeout.saturating_mul(self.reply_ttl_factor)
    }

    /// Validate structural invariants.
    pub fn validate(&self) -> Result<()> {
        for (field, value) in [
            ("supervision_topic", &self.supervision_topic),
            ("heartbeat_topic", &self.heartbeat_topic),
            ("alarm_topic", &self.alarm_topic),
            ("broadcast_topic", &self.broadcast_topic),
            ("request_queue", &self.request_queue),
        ] {
            if value.trim().is_empty() {
                return Err(GatewayError::Config(format!("{field} must not be empty")));
            }
        }
        if self.request_timeout.is_zero() {
            return Err(GatewayError::Config(
                "request_timeout_ms must be positive".into(),
            ));
        }
        if self.reply_ttl_factor < 1 {
            return Err(GatewayError::Config(
                "reply_ttl_factor must be at least 1".into(),
            ));
        }
        self.reconnect.validate()
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            supervision_topic: default_supervision_topic(),
            heartbeat_topic: default_heartbeat_topic(),
            alarm_topic: default_alarm_topic(),
            broadcast_topic: default_broadcast_topic(),
            request_queue: default_request_queue(),
            request_timeout: default_request_timeout(),
            reply_ttl_factor: default_reply_ttl_factor(),
            topic_message_ttl: default_topic_message_ttl(),
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl std::str::FromStr for GatewayConfig {
    type Err = GatewayError;

    fn from_str(content: &str) -> std::result::Result<Self, Self::Err> {
        let config: GatewayConfig = toml::from_str(content)
            .map_err(|err| GatewayError::Config(format!("failed to parse configuration: {err}")))?;
        config.validate()?;
        Ok(config)
    }
}

/// Exponential backoff applied between reconnection attempts.
#[serde_as]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconnectConfig {
    /// Delay before the second attempt; doubles afterwards.
    #[serde(rename = "base_delay_ms", default = "default_base_delay")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub base_delay: Duration,
    /// Upper bound on the doubled delay.
    #[serde(rename = "max_delay_ms", default = "default_max_delay")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub max_delay: Duration,
    /// Maximum random jitter added to each delay.
    #[serde(rename = "jitter_ms", default = "default_jitter")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub jitter: Duration,
}

impl ReconnectConfig {
    /// Delay after the given failed attempt (1-indexed), doubling up to
    /// `max_delay` with random jitter on top.
    pub fn backoff_delay<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let base = self
            .base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay);
        if self.jitter.is_zero() {
            base
        } else {
            let jitter_ms = rng.gen_range(0..=self.jitter.as_millis().max(1)) as u64;
            base + Duration::from_millis(jitter_ms)
        }
    }

    fn validate(&self) -> Result<()> {
        if self.max_delay < self.base_delay {
            return Err(GatewayError::Config(
                "reconnect.max_delay_ms must not be below base_delay_ms".into(),
            ));
        }
        Ok(())
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay: default_base_delay(),
            max_delay: default_max_delay(),
            jitter: default_jitter(),
        }
    }
}

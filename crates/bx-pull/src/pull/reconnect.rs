//! Reconnection policy and exponential backoff.

use std::fmt;
use std::time::Duration;

use bx_pull_proto::CloseCode;
use serde::{Deserialize, Serialize};

use crate::error::PullError;
use crate::settings::millis;

/// Configuration for reconnection behavior.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    /// Delay before the first backoff attempt.
    #[serde(rename = "base_delay_ms", with = "millis")]
    pub base_delay: Duration,
    /// Upper bound on backoff delays.
    #[serde(rename = "max_delay_ms", with = "millis")]
    pub max_delay: Duration,
    /// Consecutive attempts allowed before giving up.
    pub max_attempts: u32,
    /// Delay after the server replaces the channel.
    #[serde(rename = "channel_replaced_delay_ms", with = "millis")]
    pub channel_replaced_delay: Duration,
    /// Delay after the server expires the config.
    #[serde(rename = "config_expired_delay_ms", with = "millis")]
    pub config_expired_delay: Duration,
    /// Delay after the server announces a restart.
    #[serde(rename = "server_restarted_delay_ms", with = "millis")]
    pub server_restarted_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(60),
            max_attempts: 10,
            channel_replaced_delay: Duration::from_secs(1),
            config_expired_delay: Duration::from_secs(2),
            server_restarted_delay: Duration::from_secs(15),
        }
    }
}

impl ReconnectPolicy {
    /// Backoff delay when `attempts` reconnects have already been made:
    /// `min(base * 2^attempts, max)`.
    #[must_use]
    pub fn delay_for_attempt(&self, attempts: u32) -> Duration {
        let factor = 1u32.checked_shl(attempts).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Check if another attempt is allowed after `attempts`.
    #[must_use]
    pub const fn should_reconnect(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }

    /// Delay mandated for `reason`, or the backoff delay.
    #[must_use]
    pub fn delay_for(&self, reason: ReconnectReason, attempts: u32) -> Duration {
        match reason {
            ReconnectReason::ChannelReplaced => self.channel_replaced_delay,
            ReconnectReason::ConfigExpired => self.config_expired_delay,
            ReconnectReason::ServerRestarted => self.server_restarted_delay,
            ReconnectReason::Transient | ReconnectReason::Stuck => self.delay_for_attempt(attempts),
        }
    }

    pub(crate) fn validate(&self) -> Result<(), PullError> {
        if self.max_attempts == 0 {
            return Err(PullError::Config(
                "reconnect.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.base_delay > self.max_delay {
            return Err(PullError::Config(
                "reconnect.base_delay_ms cannot exceed reconnect.max_delay_ms".to_string(),
            ));
        }
        Ok(())
    }
}

/// Why a reconnect is being scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectReason {
    /// Socket error or unexpected close.
    Transient,
    /// No inbound traffic within the ping-wait window.
    Stuck,
    /// The server issued a new channel id.
    ChannelReplaced,
    /// The server expired the configuration.
    ConfigExpired,
    /// The server restarted.
    ServerRestarted,
}

impl ReconnectReason {
    /// Close code sent when this reason tears down a live socket.
    #[must_use]
    pub const fn close_code(self) -> CloseCode {
        match self {
            Self::Transient => CloseCode::ServerDie,
            Self::Stuck => CloseCode::Stuck,
            Self::ChannelReplaced => CloseCode::ConfigReplaced,
            Self::ConfigExpired => CloseCode::ConfigExpired,
            Self::ServerRestarted => CloseCode::ServerRestarted,
        }
    }
}

impl fmt::Display for ReconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Transient => "connection lost",
            Self::Stuck => "stuck",
            Self::ChannelReplaced => "channel replaced",
            Self::ConfigExpired => "config expired",
            Self::ServerRestarted => "server restarted",
        };
        f.write_str(text)
    }
}

/// Outcome of [`ReconnectState::plan`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectPlan {
    /// Reconnect after `delay`; this is attempt number `attempt`.
    Retry {
        /// One-based attempt number.
        attempt: u32,
        /// Delay before connecting.
        delay: Duration,
    },
    /// The attempt ceiling was reached.
    Exhausted {
        /// Attempts made.
        attempts: u32,
    },
}

/// Consecutive reconnect attempts since the last successful open.
#[derive(Debug, Clone, Default)]
pub struct ReconnectState {
    attempts: u32,
}

impl ReconnectState {
    /// Attempts made since the last successful open.
    #[must_use]
    pub const fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Forget previous attempts. Called on a successful open.
    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    /// Plan the next reconnect, counting it as an attempt.
    pub fn plan(&mut self, policy: &ReconnectPolicy, reason: ReconnectReason) -> ReconnectPlan {
        if !policy.should_reconnect(self.attempts) {
            return ReconnectPlan::Exhausted {
                attempts: self.attempts,
            };
        }
        let delay = policy.delay_for(reason, self.attempts);
        self.attempts += 1;
        ReconnectPlan::Retry {
            attempt: self.attempts,
            delay,
        }
    }
}

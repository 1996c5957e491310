//! Keepalive and stuck-connection detection.
//!
//! [`Liveness`] is owned by the connection loop for the lifetime of one
//! socket. Its two timers live inside it, so dropping it on close tears
//! both down.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::{interval_at, sleep_until, Instant, Interval, MissedTickBehavior};

use crate::error::PullError;
use crate::settings::millis;

/// Configuration for liveness supervision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LivenessConfig {
    /// Interval between keepalive pings.
    #[serde(rename = "keepalive_interval_ms", with = "millis")]
    pub keepalive_interval: Duration,
    /// Silence tolerated before the connection is declared stuck.
    #[serde(rename = "ping_wait_ms", with = "millis")]
    pub ping_wait: Duration,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            keepalive_interval: Duration::from_secs(25),
            ping_wait: Duration::from_secs(20),
        }
    }
}

impl LivenessConfig {
    pub(crate) fn validate(&self) -> Result<(), PullError> {
        if self.keepalive_interval.is_zero() || self.ping_wait.is_zero() {
            return Err(PullError::Config(
                "liveness intervals must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// What a liveness timer asks the connection to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LivenessTick {
    /// Send a keepalive ping.
    Keepalive,
    /// Nothing arrived within the ping-wait window.
    Stuck,
}

/// Keepalive interval plus ping-wait deadline for one open socket.
#[derive(Debug)]
pub struct Liveness {
    ping_wait: Duration,
    keepalive: Interval,
    deadline: Instant,
}

impl Liveness {
    /// Arm both timers. The first keepalive fires one interval from now.
    #[must_use]
    pub fn start(config: &LivenessConfig) -> Self {
        let now = Instant::now();
        let mut keepalive = interval_at(now + config.keepalive_interval, config.keepalive_interval);
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self {
            ping_wait: config.ping_wait,
            keepalive,
            deadline: now + config.ping_wait,
        }
    }

    /// Push the ping-wait deadline out. Call on every inbound frame.
    pub fn observe_inbound(&mut self) {
        self.deadline = Instant::now() + self.ping_wait;
    }

    /// Current ping-wait deadline.
    #[must_use]
    pub const fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Wait for the next timer. Cancel safe.
    pub async fn tick(&mut self) -> LivenessTick {
        let deadline = self.deadline;
        tokio::select! {
            biased;
            () = sleep_until(deadline) => LivenessTick::Stuck,
            _ = self.keepalive.tick() => LivenessTick::Keepalive,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_liveness_config_default() {
        let config = LivenessConfig::default();
        assert_eq!(config.keepalive_interval, Duration::from_secs(25));
        assert_eq!(config.ping_wait, Duration::from_secs(20));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_liveness_config_rejects_zero() {
        let config = LivenessConfig {
            ping_wait: Duration::ZERO,
            ..LivenessConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[tokio::test]
    async fn test_keepalive_fires_before_stuck() {
        let config = LivenessConfig {
            keepalive_interval: Duration::from_millis(10),
            ping_wait: Duration::from_secs(5),
        };
        let mut liveness = Liveness::start(&config);

        assert_eq!(liveness.tick().await, LivenessTick::Keepalive);
        assert_eq!(liveness.tick().await, LivenessTick::Keepalive);
    }

    #[tokio::test]
    async fn test_silence_is_stuck() {
        let config = LivenessConfig {
            keepalive_interval: Duration::from_secs(5),
            ping_wait: Duration::from_millis(20),
        };
        let mut liveness = Liveness::start(&config);

        let tick = tokio::time::timeout(Duration::from_secs(1), liveness.tick())
            .await
            .expect("liveness never ticked");
        assert_eq!(tick, LivenessTick::Stuck);
    }

    #[tokio::test]
    async fn test_inbound_traffic_defers_stuck() {
        let config = LivenessConfig {
            keepalive_interval: Duration::from_secs(5),
            ping_wait: Duration::from_millis(200),
        };
        let mut liveness = Liveness::start(&config);
        let first = liveness.deadline();

        tokio::time::sleep(Duration::from_millis(100)).await;
        liveness.observe_inbound();
        assert!(liveness.deadline() > first);

        // the first deadline passes without a stuck tick
        let early = tokio::time::timeout(Duration::from_millis(150), liveness.tick()).await;
        assert!(early.is_err());
    }
}

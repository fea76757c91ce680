// Copyright 2020 Joyent, Inc.

//! Queue tuning.
//!
//! All durations serialize as integer milliseconds, so a host can keep these
//! settings in a JSON document next to its other configuration:
//!
//! ```text
//! { "namespace": "octopus", "request_pickup_timeout": 30000 }
//! ```
//!
//! Missing fields take their defaults.

use std::time::Duration;

use serde_derive::{Deserialize, Serialize};

use crate::error::{ConfigError, QueueError};

pub const DEFAULT_NAMESPACE: &str = "halibut";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueSettings {
    /// Prefix applied to every key and channel.
    pub namespace: String,

    /// How long a request may sit in the queue before the sender gives up on
    /// it being collected.
    #[serde(with = "millis")]
    pub request_pickup_timeout: Duration,

    /// Added to the pickup timeout to form the TTL of queued state.
    #[serde(with = "millis")]
    pub request_ttl_margin: Duration,

    /// How long the sender keeps waiting for a response once the request has
    /// been collected.
    #[serde(with = "millis")]
    pub processing_timeout: Duration,

    #[serde(with = "millis")]
    pub response_ttl: Duration,

    #[serde(with = "millis")]
    pub heartbeat_interval: Duration,

    /// Silence after which the peer is declared possibly disconnected.
    #[serde(with = "millis")]
    pub heartbeat_timeout: Duration,

    #[serde(with = "millis")]
    pub poll_initial_delay: Duration,

    #[serde(with = "millis")]
    pub poll_step: Duration,

    #[serde(with = "millis")]
    pub poll_max_delay: Duration,

    #[serde(with = "millis")]
    pub store_retry_delay: Duration,

    /// Total time a single store operation may spend retrying.
    #[serde(with = "millis")]
    pub store_retry_budget: Duration,

    #[serde(with = "millis")]
    pub canary_ttl: Duration,

    #[serde(with = "millis")]
    pub canary_check_interval: Duration,

    /// How long a new request waits for the data loss sentinel.
    #[serde(with = "millis")]
    pub sentinel_ready_timeout: Duration,
}

impl Default for QueueSettings {
    fn default() -> Self {
        QueueSettings {
            namespace: String::from(DEFAULT_NAMESPACE),
            request_pickup_timeout: Duration::from_secs(120),
            request_ttl_margin: Duration::from_secs(60),
            processing_timeout: Duration::from_secs(600),
            response_ttl: Duration::from_secs(600),
            heartbeat_interval: Duration::from_secs(15),
            heartbeat_timeout: Duration::from_secs(60),
            poll_initial_delay: Duration::from_secs(15),
            poll_step: Duration::from_secs(15),
            poll_max_delay: Duration::from_secs(120),
            store_retry_delay: Duration::from_secs(1),
            store_retry_budget: Duration::from_secs(30),
            canary_ttl: Duration::from_secs(60 * 60),
            canary_check_interval: Duration::from_secs(60),
            sentinel_ready_timeout: Duration::from_secs(30),
        }
    }
}

impl QueueSettings {
    pub fn from_json(raw: &str) -> Result<QueueSettings, QueueError> {
        let settings: QueueSettings = serde_json::from_str(raw)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn with_namespace<S: Into<String>>(mut self, namespace: S) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn with_request_pickup_timeout(mut self, timeout: Duration) -> Self {
        self.request_pickup_timeout = timeout;
        self
    }

    pub fn with_processing_timeout(mut self, timeout: Duration) -> Self {
        self.processing_timeout = timeout;
        self
    }

    pub fn with_heartbeats(
        mut self,
        interval: Duration,
        timeout: Duration,
    ) -> Self {
        self.heartbeat_interval = interval;
        self.heartbeat_timeout = timeout;
        self
    }

    pub fn with_poll_backoff(
        mut self,
        initial: Duration,
        step: Duration,
        max: Duration,
    ) -> Self {
        self.poll_initial_delay = initial;
        self.poll_step = step;
        self.poll_max_delay = max;
        self
    }

    pub fn with_store_retry(mut self, delay: Duration, budget: Duration) -> Self {
        self.store_retry_delay = delay;
        self.store_retry_budget = budget;
        self
    }

    pub fn with_canary(mut self, ttl: Duration, check_interval: Duration) -> Self {
        self.canary_ttl = ttl;
        self.canary_check_interval = check_interval;
        self
    }

    pub fn with_sentinel_ready_timeout(mut self, timeout: Duration) -> Self {
        self.sentinel_ready_timeout = timeout;
        self
    }

    /// TTL for the request id list and request payloads.
    pub fn request_ttl(&self) -> Duration {
        self.request_pickup_timeout + self.request_ttl_margin
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.namespace.is_empty() {
            return Err(ConfigError::EmptyNamespace);
        }

        let non_zero = [
            ("request_pickup_timeout", self.request_pickup_timeout),
            ("processing_timeout", self.processing_timeout),
            ("response_ttl", self.response_ttl),
            ("heartbeat_interval", self.heartbeat_interval),
            ("poll_initial_delay", self.poll_initial_delay),
            ("store_retry_delay", self.store_retry_delay),
            ("canary_ttl", self.canary_ttl),
            ("canary_check_interval", self.canary_check_interval),
        ];
        for (name, value) in non_zero.iter() {
            if *value == Duration::from_secs(0) {
                return Err(ConfigError::ZeroDuration(*name));
            }
        }

        if self.heartbeat_timeout <= self.heartbeat_interval {
            return Err(ConfigError::HeartbeatWindow {
                interval: self.heartbeat_interval,
                timeout: self.heartbeat_timeout,
            });
        }

        if self.poll_max_delay < self.poll_initial_delay {
            return Err(ConfigError::PollBackoff {
                initial: self.poll_initial_delay,
                max: self.poll_max_delay,
            });
        }

        Ok(())
    }
}

mod millis {
    use std::convert::TryFrom;
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let ms = u64::try_from(value.as_millis()).unwrap_or(u64::MAX);
        serializer.serialize_u64(ms)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let settings = QueueSettings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.request_ttl(), Duration::from_secs(180));
    }

    #[test]
    fn partial_json_falls_back_to_defaults() {
        let raw = r#"{ "namespace": "octopus", "request_pickup_timeout": 1500 }"#;
        let settings = QueueSettings::from_json(raw).expect("valid settings");
        assert_eq!(settings.namespace, "octopus");
        assert_eq!(settings.request_pickup_timeout, Duration::from_millis(1500));
        assert_eq!(settings.heartbeat_timeout, Duration::from_secs(60));
    }

    #[test]
    fn heartbeat_timeout_must_exceed_interval() {
        let settings = QueueSettings::default()
            .with_heartbeats(Duration::from_secs(30), Duration::from_secs(30));
        assert_eq!(
            settings.validate(),
            Err(ConfigError::HeartbeatWindow {
                interval: Duration::from_secs(30),
                timeout: Duration::from_secs(30),
            })
        );
    }

    #[test]
    fn zero_durations_are_rejected() {
        let settings = QueueSettings::default()
            .with_request_pickup_timeout(Duration::from_secs(0));
        assert_eq!(
            settings.validate(),
            Err(ConfigError::ZeroDuration("request_pickup_timeout"))
        );
    }

    #[test]
    fn settings_round_trip_through_json() {
        let settings = QueueSettings::default()
            .with_namespace("octopus")
            .with_canary(Duration::from_secs(5), Duration::from_millis(250));
        let raw = serde_json::to_string(&settings).expect("serialize");
        assert_eq!(QueueSettings::from_json(&raw).expect("parse"), settings);
    }
}

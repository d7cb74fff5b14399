//! Relay configuration and change classification.
//!
//! A [`RelayConfig`] is an immutable snapshot. Reconfiguration compares the
//! active snapshot with a candidate via [`classify_change`]: `relay` and
//! `relay_timeout` describe a live OS resource and can only change by
//! replacing the transport, while `pool` belongs to the external worker pool
//! and can be swapped under a running transport.
//!
//! # Environment Variables
//!
//! | Variable | Default | Description |
//! |---|---|---|
//! | `RR_RELAY` | `pipes` | Relay DSN |
//! | `RR_RELAY_TIMEOUT` | 60 | Worker connect timeout (secs, fractional allowed) |
//! | `RR_POOL` | `{}` | Pool configuration (JSON) |

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::address::RelayAddress;
use crate::error::{RelayError, Result};

pub const RELAY_ENV: &str = "RR_RELAY";
pub const RELAY_TIMEOUT_ENV: &str = "RR_RELAY_TIMEOUT";
pub const POOL_ENV: &str = "RR_POOL";

pub const DEFAULT_RELAY: &str = "pipes";
pub const DEFAULT_RELAY_TIMEOUT: Duration = Duration::from_secs(60);

/// Worker pool tuning, owned and interpreted by the pool.
///
/// Carried verbatim and only ever compared for equality.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PoolConfig(serde_json::Value);

impl PoolConfig {
    pub fn new(value: serde_json::Value) -> Self {
        Self(value)
    }

    pub fn as_value(&self) -> &serde_json::Value {
        &self.0
    }

    pub fn into_value(self) -> serde_json::Value {
        self.0
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self(serde_json::Value::Object(serde_json::Map::new()))
    }
}

impl From<serde_json::Value> for PoolConfig {
    fn from(value: serde_json::Value) -> Self {
        Self(value)
    }
}

/// Relay configuration snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Connection method: `pipes`, `tcp://:6001`, `unix://rr.sock`.
    pub relay: String,

    /// How long the socket transport waits for a spawned worker to connect.
    #[serde(with = "duration_secs")]
    pub relay_timeout: Duration,

    pub pool: PoolConfig,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            relay: DEFAULT_RELAY.to_string(),
            relay_timeout: DEFAULT_RELAY_TIMEOUT,
            pool: PoolConfig::default(),
        }
    }
}

/// Outcome of comparing two configuration snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChangeKind {
    /// `relay` or `relay_timeout` changed: the transport must be rebuilt.
    TransportAffecting,
    /// Nothing or only `pool` changed: the running transport is kept.
    PoolOnly,
}

impl ChangeKind {
    pub fn requires_new_transport(&self) -> bool {
        matches!(self, Self::TransportAffecting)
    }
}

impl std::fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TransportAffecting => f.write_str("transport-affecting"),
            Self::PoolOnly => f.write_str("pool-only"),
        }
    }
}

/// Classify the change from `previous` to `candidate`.
pub fn classify_change(previous: &RelayConfig, candidate: &RelayConfig) -> ChangeKind {
    if previous.relay != candidate.relay || previous.relay_timeout != candidate.relay_timeout {
        ChangeKind::TransportAffecting
    } else {
        ChangeKind::PoolOnly
    }
}

impl RelayConfig {
    pub fn new(relay: impl Into<String>) -> Self {
        Self {
            relay: relay.into(),
            ..Self::default()
        }
    }

    pub fn with_relay_timeout(mut self, timeout: Duration) -> Self {
        self.relay_timeout = timeout;
        self
    }

    pub fn with_pool(mut self, pool: impl Into<PoolConfig>) -> Self {
        self.pool = pool.into();
        self
    }

    /// True if the transport must be replaced to move from `self` to `candidate`.
    pub fn differs(&self, candidate: &RelayConfig) -> bool {
        classify_change(self, candidate).requires_new_transport()
    }

    pub fn address(&self) -> Result<RelayAddress> {
        RelayAddress::parse(&self.relay)
    }

    /// Reject configurations that could never produce a working transport.
    pub fn validate(&self) -> Result<()> {
        let address = self.address()?;
        if !address.is_pipes() && self.relay_timeout.is_zero() {
            return Err(RelayError::Config(format!(
                "relay_timeout must be positive for socket relay {}",
                self.relay
            )));
        }
        Ok(())
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| RelayError::Config(format!("failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(relay) = lookup(RELAY_ENV) {
            config.relay = relay;
        }

        if let Some(raw) = lookup(RELAY_TIMEOUT_ENV) {
            config.relay_timeout = raw
                .trim()
                .parse::<f64>()
                .ok()
                .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
                .ok_or_else(|| {
                    RelayError::Config(format!("{RELAY_TIMEOUT_ENV}: invalid duration `{raw}`"))
                })?;
        }

        if let Some(raw) = lookup(POOL_ENV) {
            let value: serde_json::Value = serde_json::from_str(&raw)
                .map_err(|e| RelayError::Config(format!("{POOL_ENV}: {e}")))?;
            config.pool = PoolConfig::new(value);
        }

        config.validate()?;
        Ok(config)
    }
}

/// Durations as (fractional) seconds.
mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn tcp_config() -> RelayConfig {
        RelayConfig::new("tcp://:6001")
            .with_relay_timeout(Duration::from_secs(10))
            .with_pool(serde_json::json!({"num_workers": 4, "max_jobs": 0}))
    }

    #[test]
    fn pool_change_is_pool_only() {
        let a = tcp_config();
        let b = a
            .clone()
            .with_pool(serde_json::json!({"num_workers": 8, "max_jobs": 100}));
        assert_eq!(classify_change(&a, &b), ChangeKind::PoolOnly);
        assert!(!a.differs(&b));
    }

    #[test]
    fn relay_change_is_transport_affecting() {
        let a = tcp_config();
        let b = RelayConfig {
            relay: "unix://rr.sock".to_string(),
            ..a.clone()
        };
        assert_eq!(classify_change(&a, &b), ChangeKind::TransportAffecting);
        assert!(a.differs(&b));
    }

    #[test]
    fn timeout_change_is_transport_affecting() {
        let a = tcp_config();
        let b = a.clone().with_relay_timeout(Duration::from_secs(11));
        assert_eq!(classify_change(&a, &b), ChangeKind::TransportAffecting);
    }

    #[test]
    fn relay_and_pool_change_is_transport_affecting() {
        let a = tcp_config();
        let b = RelayConfig::new("pipes").with_pool(serde_json::json!({"num_workers": 1}));
        assert_eq!(classify_change(&a, &b), ChangeKind::TransportAffecting);
    }

    #[test]
    fn identical_configs_are_pool_only() {
        let a = tcp_config();
        assert_eq!(classify_change(&a, &a), ChangeKind::PoolOnly);
    }

    #[test]
    fn pipe_aliases_are_distinct_strings() {
        // Comparison is on the configured string, not the parsed transport.
        let a = RelayConfig::new("pipes");
        let b = RelayConfig::new("pipe");
        assert_eq!(classify_change(&a, &b), ChangeKind::TransportAffecting);
    }

    #[test]
    fn change_kind_display() {
        assert_eq!(ChangeKind::TransportAffecting.to_string(), "transport-affecting");
        assert_eq!(ChangeKind::PoolOnly.to_string(), "pool-only");
    }

    #[test]
    fn default_config_serializes() {
        let json = serde_json::to_string(&RelayConfig::default()).unwrap();
        insta::assert_snapshot!(json, @r#"{"relay":"pipes","relay_timeout":60.0,"pool":{}}"#);
    }

    #[test]
    fn json_accepts_integer_and_fractional_timeouts() {
        let config =
            RelayConfig::from_json_str(r#"{"relay": "tcp://:6001", "relay_timeout": 5}"#).unwrap();
        assert_eq!(config.relay_timeout, Duration::from_secs(5));
        assert_eq!(config.pool, PoolConfig::default());

        let config =
            RelayConfig::from_json_str(r#"{"relay": "tcp://:6001", "relay_timeout": 0.25}"#)
                .unwrap();
        assert_eq!(config.relay_timeout, Duration::from_millis(250));
    }

    #[test]
    fn json_keeps_pool_opaque() {
        let config = RelayConfig::from_json_str(
            r#"{"relay": "pipes", "pool": {"numWorkers": 2, "anything": [1, "two"]}}"#,
        )
        .unwrap();
        assert_eq!(
            config.pool.as_value(),
            &serde_json::json!({"numWorkers": 2, "anything": [1, "two"]})
        );
    }

    #[test]
    fn json_rejects_negative_timeout() {
        let err =
            RelayConfig::from_json_str(r#"{"relay": "pipes", "relay_timeout": -1}"#).unwrap_err();
        assert!(matches!(err, RelayError::Config(_)));
    }

    #[test]
    fn json_rejects_malformed_relay() {
        let err = RelayConfig::from_json_str(r#"{"relay": "garbage"}"#).unwrap_err();
        assert!(matches!(err, RelayError::InvalidDsn(_)));
    }

    #[test]
    fn zero_timeout_rejected_for_sockets_only() {
        let pipes = RelayConfig::new("pipes").with_relay_timeout(Duration::ZERO);
        assert!(pipes.validate().is_ok());

        let tcp = RelayConfig::new("tcp://:6001").with_relay_timeout(Duration::ZERO);
        assert!(matches!(tcp.validate(), Err(RelayError::Config(_))));
    }

    #[test]
    fn env_lookup_overrides_defaults() {
        let vars: HashMap<&str, &str> = HashMap::from([
            (RELAY_ENV, "tcp://127.0.0.1:6001"),
            (RELAY_TIMEOUT_ENV, "1.5"),
            (POOL_ENV, r#"{"num_workers": 3}"#),
        ]);
        let config = RelayConfig::from_lookup(|k| vars.get(k).map(|v| v.to_string())).unwrap();

        assert_eq!(config.relay, "tcp://127.0.0.1:6001");
        assert_eq!(config.relay_timeout, Duration::from_millis(1500));
        assert_eq!(config.pool.as_value(), &serde_json::json!({"num_workers": 3}));
    }

    #[test]
    fn env_lookup_without_vars_is_default() {
        let config = RelayConfig::from_lookup(|_| None).unwrap();
        assert_eq!(config, RelayConfig::default());
    }

    #[test]
    fn env_lookup_rejects_bad_timeout() {
        let err = RelayConfig::from_lookup(|k| {
            (k == RELAY_TIMEOUT_ENV).then(|| "soon".to_string())
        })
        .unwrap_err();
        insta::assert_snapshot!(
            err.to_string(),
            @"invalid relay configuration: RR_RELAY_TIMEOUT: invalid duration `soon`"
        );
    }
}

//! Configuration defaults and `GATE_*` environment overrides.
//!
//! Precedence is CLI flag > environment > built-in default. The binaries
//! resolve flags themselves; this module resolves the bottom two layers so
//! the precedence chain stays in one place and is testable without touching
//! the process environment.

use std::path::PathBuf;
use std::time::Duration;

/// Environment override for the broker state directory.
pub const ENV_STATE_DIR: &str = "GATE_STATE_DIR";
/// Environment override for the broker TCP host.
pub const ENV_BROKER_HOST: &str = "GATE_BROKER_HOST";
/// Environment override for the broker TCP port.
pub const ENV_BROKER_PORT: &str = "GATE_BROKER_PORT";
/// Environment override for the lease window.
pub const ENV_LEASE_MS: &str = "GATE_LEASE_MS";
/// Environment override for the absolute hold cap.
pub const ENV_MAX_HOLD_MS: &str = "GATE_MAX_HOLD_MS";
/// Environment override for the default acquire timeout.
pub const ENV_ACQUIRE_TIMEOUT_MS: &str = "GATE_ACQUIRE_TIMEOUT_MS";
/// Environment toggle selecting the legacy release-on-flush policy.
pub const ENV_RELEASE_ON_FLUSH: &str = "GATE_RELEASE_ON_FLUSH";

/// Default state directory.
pub const DEFAULT_STATE_DIR: &str = "/var/lib/gate";
/// Default broker host.
pub const DEFAULT_BROKER_HOST: &str = "127.0.0.1";
/// Default broker port.
pub const DEFAULT_BROKER_PORT: u16 = 8787;
/// Default lease window: a grant with no heartbeat for this long is reclaimed.
pub const DEFAULT_LEASE_MS: u64 = 30_000;
/// Default absolute hold cap (one hour), heartbeats notwithstanding.
pub const DEFAULT_MAX_HOLD_MS: u64 = 3_600_000;
/// Default acquire timeout. Waits are always finite.
pub const DEFAULT_ACQUIRE_TIMEOUT_MS: u64 = 30_000;
/// Default audit-log retention (7 days).
pub const DEFAULT_AUDIT_RETENTION_HOURS: u64 = 168;

/// Database filename under the state directory.
pub const DB_FILENAME: &str = "locks.db";

/// Broker runtime configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerConfig {
    /// Directory holding the durable store.
    pub state_dir: PathBuf,
    /// TCP listen host.
    pub host: String,
    /// TCP listen port.
    pub port: u16,
    /// Unix socket path; when set, preferred over TCP.
    pub socket: Option<PathBuf>,
    /// Lease window applied to grants without a per-request override.
    pub lease_ms: u64,
    /// Absolute hold cap applied to grants without a per-request override.
    pub max_hold_ms: u64,
    /// Acquire timeout applied when a client omits one.
    pub acquire_timeout_ms: u64,
    /// Sweep cadence; `None` derives `lease_ms / 4`.
    pub sweep_interval_ms: Option<u64>,
    /// How long audit rows are retained before the sweep prunes them.
    pub audit_retention_hours: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from(DEFAULT_STATE_DIR),
            host: DEFAULT_BROKER_HOST.to_string(),
            port: DEFAULT_BROKER_PORT,
            socket: None,
            lease_ms: DEFAULT_LEASE_MS,
            max_hold_ms: DEFAULT_MAX_HOLD_MS,
            acquire_timeout_ms: DEFAULT_ACQUIRE_TIMEOUT_MS,
            sweep_interval_ms: None,
            audit_retention_hours: DEFAULT_AUDIT_RETENTION_HOURS,
        }
    }
}

impl BrokerConfig {
    /// Build a config from the process environment.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from an arbitrary variable source. Unparseable values
    /// fall back to the default, matching how absent values behave.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let base = Self::default();
        Self {
            state_dir: lookup(ENV_STATE_DIR).map_or(base.state_dir, PathBuf::from),
            host: lookup(ENV_BROKER_HOST).unwrap_or(base.host),
            port: parse_or(lookup(ENV_BROKER_PORT), base.port),
            socket: None,
            lease_ms: parse_or(lookup(ENV_LEASE_MS), base.lease_ms),
            max_hold_ms: parse_or(lookup(ENV_MAX_HOLD_MS), base.max_hold_ms),
            acquire_timeout_ms: parse_or(
                lookup(ENV_ACQUIRE_TIMEOUT_MS),
                base.acquire_timeout_ms,
            ),
            sweep_interval_ms: None,
            audit_retention_hours: base.audit_retention_hours,
        }
    }

    /// Effective sweep cadence: configured value or `lease_ms / 4`, with a
    /// 250 ms floor so short test leases do not spin the sweep.
    #[must_use]
    pub fn sweep_interval(&self) -> Duration {
        let ms = self
            .sweep_interval_ms
            .unwrap_or_else(|| (self.lease_ms / 4).max(250));
        Duration::from_millis(ms.max(250))
    }

    /// Path of the SQLite database inside `state_dir`.
    #[must_use]
    pub fn db_path(&self) -> PathBuf {
        self.state_dir.join(DB_FILENAME)
    }
}

/// Heartbeat cadence for a lease window: `lease_ms / 3`, floored at 250 ms.
#[must_use]
pub fn heartbeat_interval(lease_ms: u64) -> Duration {
    Duration::from_millis((lease_ms / 3).max(250))
}

/// Whether the legacy release-on-flush policy is selected.
#[must_use]
pub fn release_on_flush_from_env() -> bool {
    release_on_flush_from(|key| std::env::var(key).ok())
}

/// [`release_on_flush_from_env`] with an injectable variable source.
pub fn release_on_flush_from<F>(lookup: F) -> bool
where
    F: Fn(&str) -> Option<String>,
{
    lookup(ENV_RELEASE_ON_FLUSH).as_deref() == Some("1")
}

fn parse_or<T: std::str::FromStr>(value: Option<String>, default: T) -> T {
    value
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars<'a>(pairs: &'a [(&'a str, &'a str)]) -> impl Fn(&str) -> Option<String> + 'a {
        move |key| {
            pairs
                .iter()
                .find(|(k, _)| *k == key)
                .map(|(_, v)| (*v).to_string())
        }
    }

    #[test]
    fn defaults_without_env() {
        let cfg = BrokerConfig::from_lookup(|_| None);
        assert_eq!(cfg, BrokerConfig::default());
        assert_eq!(cfg.db_path(), PathBuf::from("/var/lib/gate/locks.db"));
    }

    #[test]
    fn env_overrides_apply() {
        let cfg = BrokerConfig::from_lookup(vars(&[
            (ENV_STATE_DIR, "/tmp/gate-test"),
            (ENV_BROKER_PORT, "9900"),
            (ENV_LEASE_MS, "5000"),
        ]));
        assert_eq!(cfg.state_dir, PathBuf::from("/tmp/gate-test"));
        assert_eq!(cfg.port, 9900);
        assert_eq!(cfg.lease_ms, 5000);
        assert_eq!(cfg.max_hold_ms, DEFAULT_MAX_HOLD_MS);
    }

    #[test]
    fn garbage_env_values_fall_back() {
        let cfg = BrokerConfig::from_lookup(vars(&[(ENV_BROKER_PORT, "not-a-port")]));
        assert_eq!(cfg.port, DEFAULT_BROKER_PORT);
    }

    #[test]
    fn sweep_interval_derives_from_lease() {
        let cfg = BrokerConfig {
            lease_ms: 30_000,
            ..BrokerConfig::default()
        };
        assert_eq!(cfg.sweep_interval(), Duration::from_millis(7_500));

        let fast = BrokerConfig {
            lease_ms: 400,
            ..BrokerConfig::default()
        };
        assert_eq!(fast.sweep_interval(), Duration::from_millis(250));
    }

    #[test]
    fn release_on_flush_requires_exactly_one() {
        assert!(release_on_flush_from(vars(&[(ENV_RELEASE_ON_FLUSH, "1")])));
        assert!(!release_on_flush_from(vars(&[(ENV_RELEASE_ON_FLUSH, "0")])));
        assert!(!release_on_flush_from(vars(&[])));
    }

    #[test]
    fn heartbeat_cadence_is_a_third_of_the_lease() {
        assert_eq!(heartbeat_interval(30_000), Duration::from_millis(10_000));
        assert_eq!(heartbeat_interval(100), Duration::from_millis(250));
    }
}

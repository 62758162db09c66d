//! Typed engine configuration with env-var loading and validated defaults.
//!
//! Grounded on `original_source/backend/app/system/config.py`'s
//! typed-fallback-parse-from-env pattern: read a string, parse it, fall back
//! to the default on absence or a parse error rather than erroring out.

use std::env;

/// All engine-level configuration knobs from SPEC_FULL.md §6.2.
#[derive(Debug, Clone)]
pub struct GatekeeperConfig {
    pub total_capacity_units: i64,
    pub reserve_units: i64,
    pub headroom_pct: f64,
    pub lease_ttl_s: i64,
    pub heartbeat_grace_s: i64,
    pub failclosed_busy_default: u8,
    pub max_active_leases: Option<usize>,
    pub max_active_leases_per_owner: Option<usize>,
    pub expiry_tick_interval_ms: u64,
    pub history_retention_days: i64,
    pub request_lease_retry_after_ms: i64,
}

impl Default for GatekeeperConfig {
    fn default() -> Self {
        Self {
            total_capacity_units: 100,
            reserve_units: 5,
            headroom_pct: 0.0,
            lease_ttl_s: 60,
            heartbeat_grace_s: 0,
            failclosed_busy_default: 8,
            max_active_leases: None,
            max_active_leases_per_owner: None,
            expiry_tick_interval_ms: 2000,
            history_retention_days: 30,
            request_lease_retry_after_ms: 2000,
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    env::var(name).ok().and_then(|raw| raw.parse().ok()).unwrap_or(default)
}

fn env_optional_usize(name: &str) -> Option<usize> {
    env::var(name).ok().and_then(|raw| raw.parse().ok())
}

impl GatekeeperConfig {
    /// Load from environment, falling back to validated defaults for
    /// anything unset or unparseable. Never fails: a malformed env var is
    /// treated the same as an absent one.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            total_capacity_units: env_parse("GATEKEEPER_TOTAL_CAPACITY_UNITS", defaults.total_capacity_units),
            reserve_units: env_parse("GATEKEEPER_RESERVE_UNITS", defaults.reserve_units),
            headroom_pct: env_parse("GATEKEEPER_HEADROOM_PCT", defaults.headroom_pct),
            lease_ttl_s: env_parse("GATEKEEPER_LEASE_TTL_S", defaults.lease_ttl_s),
            heartbeat_grace_s: env_parse("GATEKEEPER_HEARTBEAT_GRACE_S", defaults.heartbeat_grace_s),
            failclosed_busy_default: env_parse(
                "GATEKEEPER_FAILCLOSED_BUSY_DEFAULT",
                defaults.failclosed_busy_default,
            )
            .min(10),
            max_active_leases: env_optional_usize("GATEKEEPER_MAX_ACTIVE_LEASES"),
            max_active_leases_per_owner: env_optional_usize("GATEKEEPER_MAX_ACTIVE_LEASES_PER_OWNER"),
            expiry_tick_interval_ms: env_parse("GATEKEEPER_EXPIRY_TICK_INTERVAL_MS", defaults.expiry_tick_interval_ms),
            history_retention_days: env_parse("GATEKEEPER_HISTORY_RETENTION_DAYS", defaults.history_retention_days),
            request_lease_retry_after_ms: env_parse(
                "GATEKEEPER_REQUEST_LEASE_RETRY_AFTER_MS",
                defaults.request_lease_retry_after_ms,
            ),
        }
    }

    pub fn builder() -> GatekeeperConfigBuilder {
        GatekeeperConfigBuilder { config: Self::default() }
    }
}

/// Builder for tests and demos that want to override a handful of fields
/// without writing out every field of the struct.
#[derive(Debug, Clone)]
pub struct GatekeeperConfigBuilder {
    config: GatekeeperConfig,
}

impl GatekeeperConfigBuilder {
    pub fn total_capacity_units(mut self, v: i64) -> Self {
        self.config.total_capacity_units = v;
        self
    }
    pub fn reserve_units(mut self, v: i64) -> Self {
        self.config.reserve_units = v;
        self
    }
    pub fn headroom_pct(mut self, v: f64) -> Self {
        self.config.headroom_pct = v;
        self
    }
    pub fn lease_ttl_s(mut self, v: i64) -> Self {
        self.config.lease_ttl_s = v;
        self
    }
    pub fn heartbeat_grace_s(mut self, v: i64) -> Self {
        self.config.heartbeat_grace_s = v;
        self
    }
    pub fn failclosed_busy_default(mut self, v: u8) -> Self {
        self.config.failclosed_busy_default = v.min(10);
        self
    }
    pub fn max_active_leases(mut self, v: Option<usize>) -> Self {
        self.config.max_active_leases = v;
        self
    }
    pub fn max_active_leases_per_owner(mut self, v: Option<usize>) -> Self {
        self.config.max_active_leases_per_owner = v;
        self
    }
    pub fn expiry_tick_interval_ms(mut self, v: u64) -> Self {
        self.config.expiry_tick_interval_ms = v;
        self
    }
    pub fn history_retention_days(mut self, v: i64) -> Self {
        self.config.history_retention_days = v;
        self
    }
    pub fn request_lease_retry_after_ms(mut self, v: i64) -> Self {
        self.config.request_lease_retry_after_ms = v;
        self
    }

    pub fn build(self) -> GatekeeperConfig {
        self.config
    }
}

//! Ambient configuration (SPEC_FULL §9): the handful of tunables spec §4.7
//! and §4.8 name as defaults rather than hard constants, loaded through
//! `r2e_core::config::R2eConfig` the same way any other `r2e` plugin's
//! config section is loaded.

use r2e_core::ConfigProperties;
use r2e_macros::ConfigProperties;

/// Session and transport tunables. Every field has the default spec.md
/// names explicitly, so an embedder that never touches configuration still
/// gets the documented behavior.
#[derive(ConfigProperties, Clone, Debug)]
#[config(prefix = "jetstream")]
pub struct JetstreamConfig {
    /// Seconds of inbound silence before a session expires (spec §4.7:
    /// "default ten minutes").
    #[config(default = 600)]
    pub inactivity_timeout_secs: i64,

    /// Keepalive ping base interval in seconds (spec §4.8: "default 10s").
    #[config(default = 10)]
    pub keepalive_interval_secs: i64,

    /// Keepalive jitter half-width in seconds (spec §4.8: "± 1s").
    #[config(default = 1)]
    pub keepalive_variance_secs: i64,

    /// Per-scope `changes` broadcast channel capacity.
    #[config(default = 256)]
    pub broadcast_capacity: i64,
}

impl JetstreamConfig {
    pub fn inactivity_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.inactivity_timeout_secs.max(0) as u64)
    }

    pub fn keepalive_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.keepalive_interval_secs.max(0) as u64)
    }

    pub fn keepalive_variance(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.keepalive_variance_secs.max(0) as u64)
    }
}

impl Default for JetstreamConfig {
    fn default() -> Self {
        Self {
            inactivity_timeout_secs: 600,
            keepalive_interval_secs: 10,
            keepalive_variance_secs: 1,
            broadcast_capacity: 256,
        }
    }
}

//! Process-wide tuning knobs, frozen at startup.
//!
//! Everything here is decided once while the process is configured and is
//! read-only afterwards: components hold an `Arc<Settings>` and never observe
//! a change. Per-pool and per-backend state that *does* change at runtime
//! lives behind the router's copy-on-write snapshot instead.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Immutable global configuration for the routing core.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Perturbation seed mixed into every hash. Drawn randomly once at
    /// startup and then frozen; it defeats deliberate collision pileups on
    /// the hash ring and is not a secret.
    pub hash_perturbation: u32,

    /// Size of the sequential id-slot table per backend.
    pub max_udp_outstanding: u16,

    /// Use the randomized sparse id map instead of the sequential table.
    pub randomize_ids_to_backend: bool,

    /// Pick the sending socket at random instead of round-robin.
    pub randomize_udp_sockets: bool,

    /// Bound on a backend's query share under `wrandom`/`whashed`,
    /// expressed as a multiple of the pool mean. Zero disables the bound.
    pub weighted_balancing_factor: f64,

    /// Same bound for `chashed`. Zero disables it.
    pub consistent_hash_balancing_factor: f64,

    /// When no server in a pool is up, `roundrobin` returns nothing if this
    /// is set and otherwise falls back to the full membership.
    pub roundrobin_fail_on_no_server: bool,

    /// Fallback deadline for in-flight UDP queries on backends that do not
    /// configure their own.
    #[serde(with = "humantime_serde")]
    pub udp_timeout: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            hash_perturbation: rand::random(),
            max_udp_outstanding: default_max_udp_outstanding(),
            randomize_ids_to_backend: false,
            randomize_udp_sockets: false,
            weighted_balancing_factor: 0.0,
            consistent_hash_balancing_factor: 0.0,
            roundrobin_fail_on_no_server: false,
            udp_timeout: default_udp_timeout(),
        }
    }
}

fn default_max_udp_outstanding() -> u16 {
    u16::MAX
}

fn default_udp_timeout() -> Duration {
    Duration::from_secs(2)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.max_udp_outstanding, u16::MAX);
        assert!(!settings.randomize_ids_to_backend);
        assert_eq!(settings.weighted_balancing_factor, 0.0);
        assert_eq!(settings.udp_timeout, Duration::from_secs(2));
    }

    #[test]
    fn test_deserialize() {
        let toml = r#"
            hash_perturbation = 305419896
            max_udp_outstanding = 4096
            weighted_balancing_factor = 1.5
            roundrobin_fail_on_no_server = true
            udp_timeout = "5s"
        "#;

        let settings: Settings = toml::from_str(toml).unwrap();
        assert_eq!(settings.hash_perturbation, 0x1234_5678);
        assert_eq!(settings.max_udp_outstanding, 4096);
        assert_eq!(settings.weighted_balancing_factor, 1.5);
        assert!(settings.roundrobin_fail_on_no_server);
        assert_eq!(settings.udp_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_perturbation_varies_between_constructions() {
        // Not a strong guarantee, but two fresh defaults colliding on a
        // random u32 would be a one-in-four-billion event.
        let a = Settings::default();
        let b = Settings::default();
        assert_ne!(a.hash_perturbation, b.hash_perturbation);
    }
}

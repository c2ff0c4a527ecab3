//! Error types for the routing core.

use thiserror::Error;

/// Errors that can occur while configuring or driving the routing core.
///
/// Configuration problems are surfaced at construction time and fail fast;
/// everything that happens after startup (transport failures, query expiry,
/// slot reuse) is recovered locally and only visible through counters and
/// `is_up()`.
#[derive(Debug, Error)]
pub enum Error {
    /// Backend weight below the allowed minimum.
    #[error("invalid backend weight {0}: must be at least 1")]
    InvalidWeight(u32),

    /// Backend socket count below the allowed minimum.
    #[error("invalid socket count {0}: must be at least 1")]
    InvalidSocketCount(usize),

    /// Source parameter could not be parsed as an address, interface or
    /// address@interface pair.
    #[error("invalid source '{0}': expected ADDR, ITF, @ITF or ADDR@ITF")]
    InvalidSource(String),

    /// Interface name not known to the operating system.
    #[error("'{0}' is not a valid interface name")]
    UnknownInterface(String),

    /// Availability selector not one of auto/lazy/up/down.
    #[error("unknown availability mode '{0}'")]
    UnknownAvailability(String),

    /// Policy selector does not name a built-in policy.
    #[error("unknown load-balancing policy '{0}'")]
    UnknownPolicy(String),

    /// Pool name not present in the router. Dispatching to a pool that was
    /// never created is a configuration bug, not a dispatch miss.
    #[error("pool '{0}' not found")]
    PoolNotFound(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for routing-core operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::InvalidWeight(0);
        assert_eq!(err.to_string(), "invalid backend weight 0: must be at least 1");

        let err = Error::PoolNotFound("auth".to_string());
        assert_eq!(err.to_string(), "pool 'auth' not found");

        let err = Error::UnknownPolicy("fastest".to_string());
        assert_eq!(err.to_string(), "unknown load-balancing policy 'fastest'");
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
    }
}

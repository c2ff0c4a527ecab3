//! Backend configuration types.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::ffi::CString;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

use crate::error::Error;

/// How a backend's liveness is decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Availability {
    /// Active health checks drive the up flag.
    #[default]
    Auto,
    /// Lazily sampled health checks drive the up flag.
    Lazy,
    /// Forced up, regardless of probing.
    Up,
    /// Forced down, regardless of probing.
    Down,
}

impl FromStr for Availability {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("auto") {
            Ok(Self::Auto)
        } else if s.eq_ignore_ascii_case("lazy") {
            Ok(Self::Lazy)
        } else if s.eq_ignore_ascii_case("up") {
            Ok(Self::Up)
        } else if s.eq_ignore_ascii_case("down") {
            Ok(Self::Down)
        } else {
            Err(Error::UnknownAvailability(s.to_string()))
        }
    }
}

/// Configuration for a single backend server.
///
/// Immutable once the backend is constructed; the only runtime mutations go
/// through `Backend::set_id` and `Backend::set_weight`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Display name.
    pub name: String,

    /// Address and port of the upstream server.
    pub remote: SocketAddr,

    /// Unique id; generated when absent. Seeds the hash vector.
    pub id: Option<Uuid>,

    /// Client-side bind address, if any.
    pub source_addr: Option<IpAddr>,

    /// Client-side bind interface name, if any.
    pub source_itf_name: Option<String>,

    /// OS index of `source_itf_name`, resolved at parse time.
    pub source_itf: Option<u32>,

    /// Position in the pool ordering; lower comes first.
    pub order: i32,

    /// Share in weighted policies and size of the hash vector.
    pub weight: u32,

    /// Number of parallel UDP sockets.
    pub number_of_sockets: usize,

    /// Deadline for in-flight UDP queries; falls back to the global setting
    /// when absent.
    #[serde(with = "humantime_serde::option")]
    pub udp_timeout: Option<Duration>,

    /// Cap on queries per second, disabled when absent.
    pub qps_limit: Option<u32>,

    /// UDP retries surfaced to the caller.
    pub retries: u32,

    /// TCP connect deadline surfaced to the caller.
    #[serde(with = "humantime_serde")]
    pub tcp_connect_timeout: Duration,

    /// TCP send deadline surfaced to the caller.
    #[serde(with = "humantime_serde")]
    pub tcp_send_timeout: Duration,

    /// TCP receive deadline surfaced to the caller.
    #[serde(with = "humantime_serde")]
    pub tcp_recv_timeout: Duration,

    /// DSCP marking for backend sockets.
    pub dscp: Option<u8>,

    /// Forward EDNS Client Subnet to this backend.
    pub use_ecs: bool,

    /// Disable the zero-scope ECS optimization for this backend.
    pub disable_zero_scope: bool,

    /// Only ever talk TCP to this backend.
    pub tcp_only: bool,

    /// Prepend a proxy-protocol header when forwarding.
    pub use_proxy_protocol: bool,

    /// Liveness mode.
    pub availability: Availability,

    /// Names of the pools this backend belongs to.
    pub pools: BTreeSet<String>,

    /// CPUs the worker thread may be pinned to; empty means unpinned.
    pub cpus: Vec<usize>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            remote: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 53),
            id: None,
            source_addr: None,
            source_itf_name: None,
            source_itf: None,
            order: 1,
            weight: 1,
            number_of_sockets: 1,
            udp_timeout: None,
            qps_limit: None,
            retries: default_retries(),
            tcp_connect_timeout: Duration::from_secs(5),
            tcp_send_timeout: Duration::from_secs(30),
            tcp_recv_timeout: Duration::from_secs(30),
            dscp: None,
            use_ecs: false,
            disable_zero_scope: false,
            tcp_only: false,
            use_proxy_protocol: false,
            availability: Availability::Auto,
            pools: BTreeSet::new(),
            cpus: Vec::new(),
        }
    }
}

fn default_retries() -> u32 {
    5
}

impl BackendConfig {
    /// Configuration pointing at `remote` with defaults everywhere else.
    #[must_use]
    pub fn new(remote: SocketAddr) -> Self {
        Self {
            remote,
            ..Self::default()
        }
    }

    /// Parse a source parameter into bind address and/or interface.
    ///
    /// Accepted forms:
    /// - `"192.0.2.1"` / `"2001:db8::1"` — bind address only
    /// - `"eth0"` / `"@eth0"` — interface only
    /// - `"192.0.2.1@eth0"` — both
    ///
    /// Interface names are resolved through the OS; an unknown name rejects
    /// the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownInterface`] when the interface does not
    /// resolve, or [`Error::InvalidSource`] when the address part of an
    /// `ADDR@ITF` pair does not parse.
    pub fn parse_source(&mut self, source: &str) -> Result<(), Error> {
        let at = source.find('@');

        if at.is_none() {
            if let Ok(addr) = source.parse::<IpAddr>() {
                self.source_addr = Some(addr);
                return Ok(());
            }
        }

        let itf_name = &source[at.map_or(0, |pos| pos + 1)..];
        let index = interface_index(itf_name);
        if index == 0 {
            return Err(Error::UnknownInterface(itf_name.to_string()));
        }

        match at {
            // "eth0" or "@eth0"
            None | Some(0) => {}
            // "192.0.2.1@eth0"
            Some(pos) => {
                let addr = source[..pos]
                    .parse::<IpAddr>()
                    .map_err(|_| Error::InvalidSource(source.to_string()))?;
                self.source_addr = Some(addr);
            }
        }

        self.source_itf_name = Some(itf_name.to_string());
        self.source_itf = Some(index);
        Ok(())
    }

    /// Deadline for in-flight UDP queries, in whole seconds, with the
    /// process-wide fallback applied.
    #[must_use]
    pub fn udp_timeout_secs(&self, fallback: Duration) -> u32 {
        let timeout = self.udp_timeout.unwrap_or(fallback);
        timeout.as_secs().min(u64::from(u32::MAX)) as u32
    }
}

/// Look up an interface index by name; 0 means unknown.
fn interface_index(name: &str) -> u32 {
    let Ok(cname) = CString::new(name) else {
        return 0;
    };
    // if_nametoindex only reads the passed name.
    unsafe { libc::if_nametoindex(cname.as_ptr()) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = BackendConfig::default();
        assert_eq!(config.order, 1);
        assert_eq!(config.weight, 1);
        assert_eq!(config.number_of_sockets, 1);
        assert_eq!(config.retries, 5);
        assert_eq!(config.availability, Availability::Auto);
        assert!(config.pools.is_empty());
    }

    #[test]
    fn test_availability_from_str() {
        assert_eq!("auto".parse::<Availability>().unwrap(), Availability::Auto);
        assert_eq!("LAZY".parse::<Availability>().unwrap(), Availability::Lazy);
        assert_eq!("Up".parse::<Availability>().unwrap(), Availability::Up);
        assert_eq!("down".parse::<Availability>().unwrap(), Availability::Down);
        assert!(matches!(
            "sometimes".parse::<Availability>(),
            Err(Error::UnknownAvailability(_))
        ));
    }

    #[test]
    fn test_parse_source_address() {
        let mut config = BackendConfig::default();
        config.parse_source("192.0.2.1").unwrap();
        assert_eq!(config.source_addr, Some("192.0.2.1".parse().unwrap()));
        assert!(config.source_itf_name.is_none());

        let mut config = BackendConfig::default();
        config.parse_source("2001:db8::1").unwrap();
        assert_eq!(config.source_addr, Some("2001:db8::1".parse().unwrap()));
    }

    #[test]
    fn test_parse_source_interface() {
        // The loopback interface exists everywhere we run tests.
        let mut config = BackendConfig::default();
        config.parse_source("lo").unwrap();
        assert_eq!(config.source_itf_name.as_deref(), Some("lo"));
        assert!(config.source_itf.unwrap() > 0);
        assert!(config.source_addr.is_none());

        let mut config = BackendConfig::default();
        config.parse_source("@lo").unwrap();
        assert_eq!(config.source_itf_name.as_deref(), Some("lo"));
    }

    #[test]
    fn test_parse_source_address_and_interface() {
        let mut config = BackendConfig::default();
        config.parse_source("127.0.0.1@lo").unwrap();
        assert_eq!(config.source_addr, Some("127.0.0.1".parse().unwrap()));
        assert_eq!(config.source_itf_name.as_deref(), Some("lo"));
    }

    #[test]
    fn test_parse_source_unknown_interface() {
        let mut config = BackendConfig::default();
        let result = config.parse_source("definitely-not-an-itf");
        assert!(matches!(result, Err(Error::UnknownInterface(_))));
    }

    #[test]
    fn test_parse_source_bad_address_part() {
        let mut config = BackendConfig::default();
        let result = config.parse_source("not-an-ip@lo");
        assert!(matches!(result, Err(Error::InvalidSource(_))));
    }

    #[test]
    fn test_udp_timeout_fallback() {
        let mut config = BackendConfig::default();
        assert_eq!(config.udp_timeout_secs(Duration::from_secs(2)), 2);

        config.udp_timeout = Some(Duration::from_secs(7));
        assert_eq!(config.udp_timeout_secs(Duration::from_secs(2)), 7);
    }

    #[test]
    fn test_deserialize() {
        let toml = r#"
            name = "ns1"
            remote = "192.0.2.1:53"
            order = 3
            weight = 10
            number_of_sockets = 4
            udp_timeout = "3s"
            qps_limit = 1000
            tcp_only = true
            availability = "up"
            pools = ["auth", "cache"]
        "#;

        let config: BackendConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.name, "ns1");
        assert_eq!(config.remote, "192.0.2.1:53".parse().unwrap());
        assert_eq!(config.order, 3);
        assert_eq!(config.weight, 10);
        assert_eq!(config.number_of_sockets, 4);
        assert_eq!(config.udp_timeout, Some(Duration::from_secs(3)));
        assert_eq!(config.qps_limit, Some(1000));
        assert!(config.tcp_only);
        assert_eq!(config.availability, Availability::Up);
        assert!(config.pools.contains("auth"));
    }
}

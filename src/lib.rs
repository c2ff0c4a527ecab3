//! # dnslb
//!
//! The request-routing core of a DNS load balancer: given an incoming
//! question and a named pool of backend servers, pick exactly one backend to
//! forward the query to, while tracking backend liveness, in-flight query
//! state and per-backend statistics.
//!
//! ## Features
//!
//! - **Backend lifecycle**: per-backend UDP socket set, connect/stop state
//!   machine, reconnect worker with back-off
//! - **Server pools**: ordered, weighted membership with derived
//!   consistency flags
//! - **Seven selection policies**: round-robin, least-outstanding,
//!   first-available, weighted-random, weighted-hashed, consistent-hashed
//!   and an ordered variant, all bounded by a configurable balancing factor
//! - **UDP id multiplexing**: at-most-once 16-bit id slots with
//!   expiry-driven reclamation
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────┐      ┌───────────────┐      ┌──────────┐
//! │     Router     │────▶│  ServerPool   │────▶│ Backend1 │
//! │                │      │               │      └──────────┘
//! │ pools by name, │      │ ordered vec + │      ┌──────────┐
//! │ query context  │      │ active policy │────▶│ Backend2 │
//! └────────────────┘      └───────────────┘      └──────────┘
//! ```
//!
//! The router hands the pool's ordered backend vector to the active policy,
//! which returns an index or nothing. The selected backend's id multiplexer
//! is then driven by the caller: allocate a slot before transmission,
//! reclaim it on response or let the expiry sweep reclaim it.
//!
//! ## Example
//!
//! ```
//! use std::sync::Arc;
//! use dnslb::{Availability, Backend, BackendConfig, Router, Settings};
//!
//! let settings = Arc::new(Settings::default());
//! let router = Router::new(Arc::clone(&settings));
//!
//! let config = BackendConfig {
//!     name: "ns1".to_string(),
//!     remote: "192.0.2.1:53".parse().unwrap(),
//!     availability: Availability::Up,
//!     ..BackendConfig::default()
//! };
//! let backend = Backend::new(config, Arc::clone(&settings), false).unwrap();
//! router.add_server_to_pool("auth", backend);
//!
//! let selected = router.select_server("www.example.com", 1, 1, "auth").unwrap();
//! assert!(selected.is_some());
//! ```

pub mod backend;
pub mod error;
pub mod hash;
pub mod policy;
pub mod pool;
pub mod query;
pub mod router;
pub mod settings;

pub use backend::{Availability, Backend, BackendConfig, BackendStats, QpsLimiter, TimeoutHandler};
pub use error::{Error, Result};
pub use policy::{Policy, PolicyKind};
pub use pool::{NumberedServer, ServerPool};
pub use query::{PendingQuery, QueryContext};
pub use router::Router;
pub use settings::Settings;

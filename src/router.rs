//! Router facade over named pools.
//!
//! The router is the only entry point the request I/O paths should call.
//! Pool membership is published as an immutable snapshot behind an atomic
//! pointer swap: the dispatch path loads the current snapshot without
//! locking, while mutations clone it, edit the clone and swap it in under a
//! serializing writer lock.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use arc_swap::ArcSwap;
use tracing::{debug, info};

use crate::backend::Backend;
use crate::error::{Error, Result};
use crate::policy::Policy;
use crate::pool::ServerPool;
use crate::query::QueryContext;
use crate::settings::Settings;

#[derive(Default, Clone)]
struct RouterState {
    pools: HashMap<String, ServerPool>,
}

/// Name-addressed pools and the dispatch entry point.
pub struct Router {
    settings: Arc<Settings>,
    state: ArcSwap<RouterState>,
    write_lock: Mutex<()>,
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("pools", &self.pool_names())
            .finish()
    }
}

impl Router {
    /// Create a router over the given frozen settings.
    #[must_use]
    pub fn new(settings: Arc<Settings>) -> Self {
        Self {
            settings,
            state: ArcSwap::from_pointee(RouterState::default()),
            write_lock: Mutex::new(()),
        }
    }

    /// The frozen process-wide settings.
    #[must_use]
    pub fn settings(&self) -> &Arc<Settings> {
        &self.settings
    }

    /// Clone-mutate-swap the published snapshot.
    fn update(&self, mutate: impl FnOnce(&mut RouterState)) {
        let _guard = self.write_lock.lock().expect("router write lock poisoned");
        let mut next = (**self.state.load()).clone();
        mutate(&mut next);
        self.state.store(Arc::new(next));
    }

    /// Make sure a pool with this name exists.
    pub fn create_pool_if_absent(&self, name: &str) {
        self.update(|state| {
            if !state.pools.contains_key(name) {
                info!(pool = %name, "Creating pool");
                state.pools.insert(name.to_string(), ServerPool::new());
            }
        });
    }

    /// Bind a policy instance to a pool, creating the pool if needed.
    pub fn set_pool_policy(&self, name: &str, policy: Arc<Policy>) {
        info!(pool = %name, policy = %policy.name(), "Setting pool policy");
        self.update(|state| {
            state
                .pools
                .entry(name.to_string())
                .or_default()
                .set_policy(policy);
        });
    }

    /// Bind a built-in policy to a pool by its canonical name.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownPolicy`] for names outside the built-in set.
    pub fn set_pool_policy_by_name(&self, pool: &str, policy: &str) -> Result<()> {
        let policy = Policy::by_name(policy)?;
        self.set_pool_policy(pool, policy);
        Ok(())
    }

    /// Add a backend to a pool, creating the pool if needed.
    pub fn add_server_to_pool(&self, name: &str, server: Arc<Backend>) {
        debug!(pool = %name, backend = %server.name_with_addr(), "Adding server to pool");
        self.update(|state| {
            state
                .pools
                .entry(name.to_string())
                .or_default()
                .add_server(server);
        });
    }

    /// Remove a backend from a pool. Returns whether it was a member.
    pub fn remove_server_from_pool(&self, name: &str, server: &Arc<Backend>) -> bool {
        let mut removed = false;
        self.update(|state| {
            if let Some(pool) = state.pools.get_mut(name) {
                removed = pool.remove_server(server);
            }
        });
        if removed {
            debug!(pool = %name, backend = %server.name_with_addr(), "Removed server from pool");
        }
        removed
    }

    /// Register a backend into every pool its configuration names.
    pub fn register_backend(&self, server: &Arc<Backend>) {
        for pool in server.config().pools.clone() {
            self.add_server_to_pool(&pool, Arc::clone(server));
        }
    }

    /// Snapshot of a pool by name.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PoolNotFound`] when the pool was never created.
    pub fn pool(&self, name: &str) -> Result<ServerPool> {
        self.state
            .load()
            .pools
            .get(name)
            .cloned()
            .ok_or_else(|| Error::PoolNotFound(name.to_string()))
    }

    /// Names of every known pool.
    #[must_use]
    pub fn pool_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.state.load().pools.keys().cloned().collect();
        names.sort();
        names
    }

    /// Select a backend for a question against a named pool.
    ///
    /// `Ok(None)` is a dispatch miss: the pool exists but its policy found
    /// no candidate, and the caller decides whether to drop, SERVFAIL or
    /// re-route.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PoolNotFound`] for a pool that was never created.
    pub fn select_server(
        &self,
        qname: &str,
        qtype: u16,
        qclass: u16,
        pool: &str,
    ) -> Result<Option<Arc<Backend>>> {
        let ctx = QueryContext::new(qname, qtype, qclass, &self.settings);
        self.select_server_with_context(&ctx, pool)
    }

    /// Select a backend for an already-built query context.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PoolNotFound`] for a pool that was never created.
    pub fn select_server_with_context(
        &self,
        ctx: &QueryContext,
        pool: &str,
    ) -> Result<Option<Arc<Backend>>> {
        let state = self.state.load();
        let members = state
            .pools
            .get(pool)
            .ok_or_else(|| Error::PoolNotFound(pool.to_string()))?;
        Ok(members.select(ctx, &self.settings))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Availability, BackendConfig};

    fn settings() -> Arc<Settings> {
        Arc::new(Settings {
            hash_perturbation: 0x1234_5678,
            max_udp_outstanding: 16,
            ..Settings::default()
        })
    }

    fn backend(name: &str) -> Arc<Backend> {
        Backend::new(
            BackendConfig {
                name: name.to_string(),
                availability: Availability::Up,
                ..BackendConfig::default()
            },
            settings(),
            false,
        )
        .unwrap()
    }

    #[test]
    fn test_create_pool_and_select() {
        let router = Router::new(settings());
        router.create_pool_if_absent("auth");
        router.add_server_to_pool("auth", backend("ns1"));

        let selected = router
            .select_server("www.example.com", 1, 1, "auth")
            .unwrap()
            .unwrap();
        assert_eq!(selected.name(), "ns1");
    }

    #[test]
    fn test_unknown_pool_is_an_error() {
        let router = Router::new(settings());
        let result = router.select_server("www.example.com", 1, 1, "missing");
        assert!(matches!(result, Err(Error::PoolNotFound(_))));
    }

    #[test]
    fn test_empty_pool_is_a_dispatch_miss() {
        let router = Router::new(settings());
        router.create_pool_if_absent("empty");

        let selected = router.select_server("www.example.com", 1, 1, "empty").unwrap();
        assert!(selected.is_none());
    }

    #[test]
    fn test_set_pool_policy_by_name() {
        let router = Router::new(settings());
        router.set_pool_policy_by_name("auth", "leastOutstanding").unwrap();
        assert_eq!(router.pool("auth").unwrap().policy().name(), "leastOutstanding");

        assert!(matches!(
            router.set_pool_policy_by_name("auth", "nope"),
            Err(Error::UnknownPolicy(_))
        ));
    }

    #[test]
    fn test_remove_server_from_pool() {
        let router = Router::new(settings());
        let ns1 = backend("ns1");
        router.add_server_to_pool("auth", Arc::clone(&ns1));

        assert!(router.remove_server_from_pool("auth", &ns1));
        assert!(!router.remove_server_from_pool("auth", &ns1));
        assert!(!router.remove_server_from_pool("missing", &ns1));
    }

    #[test]
    fn test_register_backend_joins_configured_pools() {
        let router = Router::new(settings());
        let config = BackendConfig {
            name: "ns1".to_string(),
            availability: Availability::Up,
            pools: ["auth", "cache"].into_iter().map(String::from).collect(),
            ..BackendConfig::default()
        };
        let server = Backend::new(config, settings(), false).unwrap();

        router.register_backend(&server);

        assert_eq!(router.pool_names(), vec!["auth", "cache"]);
        assert_eq!(router.pool("auth").unwrap().count_servers(false), 1);
        assert_eq!(router.pool("cache").unwrap().count_servers(false), 1);
    }

    #[test]
    fn test_snapshot_isolation() {
        let router = Router::new(settings());
        router.add_server_to_pool("auth", backend("ns1"));

        // A snapshot taken before a mutation keeps its view.
        let snapshot = router.pool("auth").unwrap();
        router.add_server_to_pool("auth", backend("ns2"));

        assert_eq!(snapshot.count_servers(false), 1);
        assert_eq!(router.pool("auth").unwrap().count_servers(false), 2);
    }

    #[test]
    fn test_selection_updates_no_counters() {
        let router = Router::new(settings());
        let ns1 = backend("ns1");
        router.add_server_to_pool("auth", Arc::clone(&ns1));

        router.select_server("www.example.com", 1, 1, "auth").unwrap();
        // Counter updates after selection are the caller's job.
        assert_eq!(ns1.stats().queries(), 0);
    }
}

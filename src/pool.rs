//! Named, ordered server pools.
//!
//! A pool owns an ordered, 1-numbered view of its backends plus the derived
//! consistency flags the ECS handling upstream cares about. Pools are cheap
//! to clone (backends are shared), which is what lets the router publish
//! them as copy-on-write snapshots.

use std::sync::Arc;

use tracing::debug;

use crate::backend::Backend;
use crate::policy::Policy;
use crate::query::QueryContext;
use crate::settings::Settings;

/// A pool member with its 1-based ordinal. Ordinals are reassigned on every
/// membership change and always form a contiguous `1..=n` sequence.
pub type NumberedServer = (u32, Arc<Backend>);

/// An ordered set of backends with a single active policy.
#[derive(Clone)]
pub struct ServerPool {
    servers: Vec<NumberedServer>,
    policy: Arc<Policy>,
    use_ecs: bool,
    zero_scope: bool,
    tcp_only: bool,
    is_consistent: bool,
}

impl std::fmt::Debug for ServerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerPool")
            .field("servers", &self.servers.len())
            .field("policy", &self.policy.name())
            .field("is_consistent", &self.is_consistent)
            .finish()
    }
}

impl Default for ServerPool {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerPool {
    /// Create an empty pool with the default round-robin policy.
    #[must_use]
    pub fn new() -> Self {
        Self {
            servers: Vec::new(),
            policy: Arc::new(Policy::builtin(crate::policy::PolicyKind::RoundRobin)),
            use_ecs: false,
            zero_scope: true,
            tcp_only: false,
            is_consistent: true,
        }
    }

    /// The ordered membership.
    #[must_use]
    pub fn servers(&self) -> &[NumberedServer] {
        &self.servers
    }

    /// The active policy.
    #[must_use]
    pub fn policy(&self) -> &Arc<Policy> {
        &self.policy
    }

    /// Replace the active policy.
    pub fn set_policy(&mut self, policy: Arc<Policy>) {
        self.policy = policy;
    }

    /// Append a backend, keeping the membership sorted by `order` (stable,
    /// so insertion order breaks ties) and the ordinals contiguous.
    pub fn add_server(&mut self, server: Arc<Backend>) {
        debug!(backend = %server.name_with_addr(), "Adding server to pool");
        let next = self.servers.len() as u32 + 1;
        self.servers.push((next, server));
        self.servers.sort_by_key(|(_, server)| server.order());
        for (index, entry) in self.servers.iter_mut().enumerate() {
            entry.0 = index as u32 + 1;
        }
        self.update_consistency();
    }

    /// Remove a backend by identity, renumbering its successors. Returns
    /// whether it was a member.
    pub fn remove_server(&mut self, server: &Arc<Backend>) -> bool {
        let before = self.servers.len();
        self.servers.retain(|(_, member)| !Arc::ptr_eq(member, server));
        let found = self.servers.len() != before;
        if found {
            debug!(backend = %server.name_with_addr(), "Removed server from pool");
            for (index, entry) in self.servers.iter_mut().enumerate() {
                entry.0 = index as u32 + 1;
            }
            // Removal cannot break an agreeing pool, but it can make a
            // disagreeing one agree again.
            if !self.is_consistent {
                self.update_consistency();
            }
        }
        found
    }

    /// Number of members, optionally only the live ones.
    #[must_use]
    pub fn count_servers(&self, up_only: bool) -> usize {
        self.servers
            .iter()
            .filter(|(_, server)| !up_only || server.is_up())
            .count()
    }

    /// Whether at least one member is up.
    #[must_use]
    pub fn has_at_least_one_server_available(&self) -> bool {
        self.servers.iter().any(|(_, server)| server.is_up())
    }

    /// Sum of the members' outstanding queries.
    #[must_use]
    pub fn pool_load(&self) -> u64 {
        self.servers
            .iter()
            .map(|(_, server)| server.stats().outstanding())
            .sum()
    }

    /// Run the active policy over the membership.
    #[must_use]
    pub fn select(&self, ctx: &QueryContext, settings: &Settings) -> Option<Arc<Backend>> {
        self.policy
            .select(&self.servers, ctx, settings)
            .and_then(|index| self.servers.get(index))
            .map(|(_, server)| Arc::clone(server))
    }

    /// Whether every member forwards ECS.
    #[must_use]
    pub fn use_ecs(&self) -> bool {
        self.use_ecs
    }

    /// Force the pool-level ECS flag.
    pub fn set_ecs(&mut self, use_ecs: bool) {
        self.use_ecs = use_ecs;
        self.update_consistency();
    }

    /// Whether the zero-scope optimization applies pool-wide.
    #[must_use]
    pub fn zero_scope(&self) -> bool {
        self.zero_scope
    }

    /// Force the pool-level zero-scope flag.
    pub fn set_zero_scope(&mut self, enabled: bool) {
        self.zero_scope = enabled;
        self.update_consistency();
    }

    /// Whether every member is TCP-only.
    #[must_use]
    pub fn tcp_only(&self) -> bool {
        self.tcp_only
    }

    /// Whether all members agree on ECS, zero-scope and TCP-only.
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        self.is_consistent
    }

    fn update_consistency(&mut self) {
        let mut consistent = true;
        let mut first = true;
        let mut use_ecs = false;
        let mut tcp_only = false;
        let mut zero_scope = true;

        for (_, server) in &self.servers {
            let config = server.config();
            if first {
                first = false;
                use_ecs = config.use_ecs;
                tcp_only = server.is_tcp_only();
                zero_scope = !config.disable_zero_scope;
                continue;
            }
            if consistent {
                if config.use_ecs != use_ecs {
                    consistent = false;
                }
                if !config.disable_zero_scope != zero_scope {
                    consistent = false;
                }
            }
            if server.is_tcp_only() != tcp_only {
                consistent = false;
                tcp_only = false;
            }
        }

        self.tcp_only = tcp_only;
        if consistent {
            // All members agree, adopt their settings for the pool itself.
            self.use_ecs = use_ecs;
            self.zero_scope = zero_scope;
        }
        self.is_consistent = consistent;
    }
}

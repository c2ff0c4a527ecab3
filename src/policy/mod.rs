//! Load-balancing policies.
//!
//! A policy is a pure selection function over the pool's ordered membership:
//! it receives the numbered server vector and the query context and returns
//! the index of the chosen member, or nothing. Policies never mutate backend
//! state; counter updates after a selection are the caller's job.
//!
//! The built-in policies are the closed set dispatched by
//! [`PolicyKind`]; host applications plug their own selection logic in
//! through [`Policy::external`] without touching the dispatch path.

pub mod builtin;

use std::sync::atomic::AtomicUsize;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::pool::NumberedServer;
use crate::query::QueryContext;
use crate::settings::Settings;

/// Signature of an externally supplied selection function.
pub type ExternalPolicyFn =
    Arc<dyn Fn(&[NumberedServer], &QueryContext) -> Option<usize> + Send + Sync>;

/// The selection algorithm behind a [`Policy`].
#[derive(Clone)]
pub enum PolicyKind {
    /// First up server respecting its QPS limit.
    FirstAvailable,
    /// Next up server in rotation.
    RoundRobin,
    /// Fewest in-flight queries, then lowest latency, then lowest order.
    LeastOutstanding,
    /// Weight-proportional random draw.
    WeightedRandom,
    /// Weight-proportional draw keyed by the query-name fingerprint.
    WeightedHashed,
    /// Consistent-hash ring walk keyed by the query-name fingerprint.
    ConsistentHashed,
    /// Weighted random within the lowest order group, skipping tagged
    /// servers.
    OrderedWrandUntag,
    /// Caller-supplied selection function.
    External(ExternalPolicyFn),
}

impl PolicyKind {
    fn default_name(&self) -> &'static str {
        match self {
            Self::FirstAvailable => "firstAvailable",
            Self::RoundRobin => "roundrobin",
            Self::LeastOutstanding => "leastOutstanding",
            Self::WeightedRandom => "wrandom",
            Self::WeightedHashed => "whashed",
            Self::ConsistentHashed => "chashed",
            Self::OrderedWrandUntag => "orderedWrandUntag",
            Self::External(_) => "external",
        }
    }
}

/// A named selection policy.
pub struct Policy {
    name: String,
    kind: PolicyKind,
    /// Rotation state shared by every pool holding this policy instance.
    round_robin_counter: AtomicUsize,
}

impl std::fmt::Debug for Policy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Policy").field("name", &self.name).finish()
    }
}

impl Policy {
    /// Create a built-in policy under its canonical name.
    #[must_use]
    pub fn builtin(kind: PolicyKind) -> Self {
        Self {
            name: kind.default_name().to_string(),
            kind,
            round_robin_counter: AtomicUsize::new(0),
        }
    }

    /// Wrap an external selection function under a caller-chosen name.
    pub fn external(
        name: impl Into<String>,
        select: impl Fn(&[NumberedServer], &QueryContext) -> Option<usize> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            kind: PolicyKind::External(Arc::new(select)),
            round_robin_counter: AtomicUsize::new(0),
        }
    }

    /// Look up a built-in policy by its canonical name.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownPolicy`] for anything else.
    pub fn by_name(name: &str) -> Result<Arc<Self>> {
        let kind = match name {
            "firstAvailable" => PolicyKind::FirstAvailable,
            "roundrobin" => PolicyKind::RoundRobin,
            "leastOutstanding" => PolicyKind::LeastOutstanding,
            "wrandom" => PolicyKind::WeightedRandom,
            "whashed" => PolicyKind::WeightedHashed,
            "chashed" => PolicyKind::ConsistentHashed,
            "orderedWrandUntag" => PolicyKind::OrderedWrandUntag,
            _ => return Err(Error::UnknownPolicy(name.to_string())),
        };
        Ok(Arc::new(Self::builtin(kind)))
    }

    /// The policy name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run the selection over `servers`, returning the index of the chosen
    /// member.
    #[must_use]
    pub fn select(
        &self,
        servers: &[NumberedServer],
        ctx: &QueryContext,
        settings: &Settings,
    ) -> Option<usize> {
        match &self.kind {
            PolicyKind::FirstAvailable => builtin::first_available(servers),
            PolicyKind::RoundRobin => {
                builtin::round_robin(servers, &self.round_robin_counter, settings)
            }
            PolicyKind::LeastOutstanding => builtin::least_outstanding(servers),
            PolicyKind::WeightedRandom => builtin::wrandom(servers, settings),
            PolicyKind::WeightedHashed => builtin::whashed(servers, ctx, settings),
            PolicyKind::ConsistentHashed => builtin::chashed(servers, ctx, settings),
            PolicyKind::OrderedWrandUntag => {
                builtin::ordered_wrand_untag(servers, ctx, settings)
            }
            // An external policy returning a bogus offset means no server.
            PolicyKind::External(select) => {
                select.as_ref()(servers, ctx).filter(|&index| index < servers.len())
            }
        }
    }
}

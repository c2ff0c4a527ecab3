//! The built-in selection functions.
//!
//! Each takes the pool's ordered `(ordinal, backend)` vector and returns the
//! index of the chosen member. Candidates must be up; the weighted policies
//! additionally reject members whose query share already exceeds the
//! configured balancing factor, so the ring and weight layout stay stable
//! across traffic.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use rand::Rng;

use crate::backend::{Backend, QpsLimiter};
use crate::pool::NumberedServer;
use crate::query::QueryContext;
use crate::settings::Settings;

/// First up server that respects its QPS limit, in pool order. When
/// nothing qualifies, degrade to `leastOutstanding`.
pub(crate) fn first_available(servers: &[NumberedServer]) -> Option<usize> {
    for (index, (_, server)) in servers.iter().enumerate() {
        if server.is_up() && server.qps_limiter().map_or(true, QpsLimiter::check_only) {
            return Some(index);
        }
    }
    least_outstanding(servers)
}

/// Server with the fewest in-flight queries; ties broken by lower latency,
/// then lower order.
pub(crate) fn least_outstanding(servers: &[NumberedServer]) -> Option<usize> {
    if servers.len() == 1 {
        return servers[0].1.is_up().then_some(0);
    }

    let mut best: Option<(usize, (u64, u64, i32))> = None;
    for (index, (_, server)) in servers.iter().enumerate() {
        if !server.is_up() {
            continue;
        }
        let key = (
            server.stats().outstanding(),
            server.relevant_latency_usec(),
            server.order(),
        );
        match &best {
            Some((_, best_key)) if key >= *best_key => {}
            _ => best = Some((index, key)),
        }
    }
    best.map(|(index, _)| index)
}

/// Next up server in rotation. When no server is up, either fail or fall
/// back to the full membership, per configuration.
pub(crate) fn round_robin(
    servers: &[NumberedServer],
    counter: &AtomicUsize,
    settings: &Settings,
) -> Option<usize> {
    if servers.is_empty() {
        return None;
    }

    let turn = counter.fetch_add(1, Ordering::Relaxed);
    let index = turn % servers.len();
    if servers[index].1.is_up() {
        return Some(index);
    }

    let candidates: Vec<usize> = servers
        .iter()
        .enumerate()
        .filter(|(_, (_, server))| server.is_up())
        .map(|(index, _)| index)
        .collect();

    if candidates.is_empty() {
        if settings.roundrobin_fail_on_no_server {
            return None;
        }
        return Some(index);
    }
    Some(candidates[turn % candidates.len()])
}

/// Per-unit-weight cap on assigned queries under a balancing factor;
/// `None` when the factor is disabled or nothing is up.
fn query_share_cap(servers: &[NumberedServer], factor: f64) -> Option<f64> {
    if factor <= 0.0 {
        return None;
    }
    // Start at one for the query being placed right now.
    let mut total_queries = 1.0;
    let mut total_weight = 0u64;
    for (_, server) in servers {
        if server.is_up() {
            total_queries += server.stats().queries() as f64;
            total_weight += u64::from(server.weight());
        }
    }
    (total_weight > 0).then(|| total_queries / total_weight as f64 * factor)
}

fn within_share(server: &Arc<Backend>, cap: Option<f64>) -> bool {
    cap.map_or(true, |cap| {
        server.stats().queries() as f64 <= cap * f64::from(server.weight())
    })
}

/// Map `value` into the cumulative weight ranges of the eligible servers.
fn weighted_pick(servers: &[NumberedServer], value: u32, cap: Option<f64>) -> Option<usize> {
    let mut cumulative: Vec<(u64, usize)> = Vec::with_capacity(servers.len());
    let mut sum = 0u64;
    for (index, (_, server)) in servers.iter().enumerate() {
        if server.is_up() && within_share(server, cap) {
            sum += u64::from(server.weight());
            cumulative.push((sum, index));
        }
    }
    if sum == 0 {
        return None;
    }

    let ticket = u64::from(value) % sum;
    cumulative
        .iter()
        .find(|(edge, _)| ticket < *edge)
        .map(|(_, index)| *index)
}

/// Weight-proportional random draw.
pub(crate) fn wrandom(servers: &[NumberedServer], settings: &Settings) -> Option<usize> {
    let cap = query_share_cap(servers, settings.weighted_balancing_factor);
    weighted_pick(servers, rand::rng().random(), cap)
}

/// Weight-proportional draw keyed by the query-name fingerprint, so equal
/// names land on equal servers while membership holds.
pub(crate) fn whashed(
    servers: &[NumberedServer],
    ctx: &QueryContext,
    settings: &Settings,
) -> Option<usize> {
    let cap = query_share_cap(servers, settings.weighted_balancing_factor);
    weighted_pick(servers, ctx.fingerprint, cap)
}

/// Consistent-hash ring walk: the owner of the smallest hash at or above
/// the fingerprint wins, wrapping to the globally smallest hash.
pub(crate) fn chashed(
    servers: &[NumberedServer],
    ctx: &QueryContext,
    settings: &Settings,
) -> Option<usize> {
    let cap = query_share_cap(servers, settings.consistent_hash_balancing_factor);
    let fingerprint = ctx.fingerprint;

    let mut selected_hash = u32::MAX;
    let mut ring_min = u32::MAX;
    let mut selected = None;
    let mut wrap = None;

    for (index, (_, server)) in servers.iter().enumerate() {
        if !server.is_up() || !within_share(server, cap) {
            continue;
        }
        if !server.hashes_computed() {
            server.hash();
        }
        server.with_hashes(|hashes| {
            if let Some(&lowest) = hashes.first() {
                if lowest < ring_min {
                    ring_min = lowest;
                    wrap = Some(index);
                }
            }
            let pos = hashes.partition_point(|&hash| hash < fingerprint);
            if pos < hashes.len() && hashes[pos] < selected_hash {
                selected_hash = hashes[pos];
                selected = Some(index);
            }
        });
    }

    selected.or(wrap)
}

/// Weighted random restricted to the lowest order group of up, untagged
/// servers.
pub(crate) fn ordered_wrand_untag(
    servers: &[NumberedServer],
    ctx: &QueryContext,
    settings: &Settings,
) -> Option<usize> {
    if servers.is_empty() {
        return None;
    }

    let mut candidates: Vec<NumberedServer> = Vec::with_capacity(servers.len());
    let mut positions: Vec<usize> = Vec::with_capacity(servers.len());
    let mut group_order = i32::MAX;

    for (index, (_, server)) in servers.iter().enumerate() {
        if !server.is_up() {
            continue;
        }
        if let Some(tags) = &ctx.tags {
            if tags.contains_key(&server.name_with_addr()) {
                continue;
            }
        }
        // Membership is sorted by order, so the first qualifying server
        // fixes the group and anything beyond it ends the scan.
        if positions.is_empty() {
            group_order = server.order();
        } else if server.order() > group_order {
            break;
        }
        candidates.push((positions.len() as u32 + 1, Arc::clone(server)));
        positions.push(index);
    }

    if positions.is_empty() {
        return None;
    }

    let cap = query_share_cap(&candidates, settings.weighted_balancing_factor);
    weighted_pick(&candidates, rand::rng().random(), cap).map(|chosen| positions[chosen])
}

//! Backend server state and lifecycle.
//!
//! A [`Backend`] owns everything tied to one upstream DNS server: the
//! connected UDP socket set, the in-flight query-id table, the hash vector
//! feeding the consistent-hash ring, monotonic counters, and the
//! connect/stop state machine. Selection policies only ever read from it;
//! counter updates after a selection are the caller's job.

pub mod config;
mod idstate;
pub mod limiter;
mod socket;
mod worker;

pub use config::{Availability, BackendConfig};
pub use limiter::QpsLimiter;

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::time::Duration;

use socket2::Socket;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::hash::burtle_ci;
use crate::query::PendingQuery;
use crate::settings::Settings;
use idstate::IdStateTable;

/// Callback invoked with the drained query whenever an in-flight UDP query
/// times out or its id slot is forcibly reused.
pub type TimeoutHandler = Box<dyn Fn(PendingQuery) + Send + Sync>;

/// Monotonic per-backend counters.
///
/// All counters are plain atomics updated with relaxed ordering; the only
/// exception is the TCP concurrency high-water mark, which uses an
/// acquire-release max update.
#[derive(Debug, Default)]
pub struct BackendStats {
    outstanding: AtomicU64,
    queries: AtomicU64,
    responses: AtomicU64,
    reuseds: AtomicU64,
    drops: AtomicU64,
    query_load: AtomicU64,
    tcp_current_connections: AtomicU64,
    tcp_max_concurrent_connections: AtomicU64,
    latency_usec: AtomicU64,
    latency_usec_tcp: AtomicU64,
}

impl BackendStats {
    /// Number of in-flight UDP queries.
    #[must_use]
    pub fn outstanding(&self) -> u64 {
        self.outstanding.load(Ordering::Relaxed)
    }

    /// Total queries dispatched to this backend.
    #[must_use]
    pub fn queries(&self) -> u64 {
        self.queries.load(Ordering::Relaxed)
    }

    /// Total responses observed from this backend.
    #[must_use]
    pub fn responses(&self) -> u64 {
        self.responses.load(Ordering::Relaxed)
    }

    /// Id slots reclaimed before a response arrived.
    #[must_use]
    pub fn reuseds(&self) -> u64 {
        self.reuseds.load(Ordering::Relaxed)
    }

    /// Queries dropped by the caller for this backend.
    #[must_use]
    pub fn drops(&self) -> u64 {
        self.drops.load(Ordering::Relaxed)
    }

    /// Last published query-load observation.
    #[must_use]
    pub fn query_load(&self) -> u64 {
        self.query_load.load(Ordering::Relaxed)
    }

    /// Currently open TCP connections.
    #[must_use]
    pub fn tcp_current_connections(&self) -> u64 {
        self.tcp_current_connections.load(Ordering::Relaxed)
    }

    /// High-water mark of concurrent TCP connections.
    #[must_use]
    pub fn tcp_max_concurrent_connections(&self) -> u64 {
        self.tcp_max_concurrent_connections.load(Ordering::Relaxed)
    }

    /// Smoothed UDP latency in microseconds.
    #[must_use]
    pub fn latency_usec(&self) -> u64 {
        self.latency_usec.load(Ordering::Relaxed)
    }

    /// Smoothed TCP latency in microseconds.
    #[must_use]
    pub fn latency_usec_tcp(&self) -> u64 {
        self.latency_usec_tcp.load(Ordering::Relaxed)
    }

    /// Record a dispatched query.
    pub fn record_query(&self) {
        self.queries.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an observed response.
    pub fn record_response(&self) {
        self.responses.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a dropped query.
    pub fn record_drop(&self) {
        self.drops.fetch_add(1, Ordering::Relaxed);
    }

    /// Publish a query-load observation.
    pub fn set_query_load(&self, load: u64) {
        self.query_load.store(load, Ordering::Relaxed);
    }

    /// Fold a UDP latency sample into the sliding average.
    pub fn record_latency_usec(&self, usec: u64) {
        let old = self.latency_usec.load(Ordering::Relaxed);
        let new = old.saturating_mul(127).saturating_add(usec) / 128;
        self.latency_usec.store(new, Ordering::Relaxed);
    }

    /// Fold a TCP latency sample into the sliding average.
    pub fn record_latency_usec_tcp(&self, usec: u64) {
        let old = self.latency_usec_tcp.load(Ordering::Relaxed);
        let new = old.saturating_mul(127).saturating_add(usec) / 128;
        self.latency_usec_tcp.store(new, Ordering::Relaxed);
    }
}

/// A single upstream DNS server and its per-endpoint state.
pub struct Backend {
    config: BackendConfig,
    settings: Arc<Settings>,
    id: RwLock<Uuid>,
    weight: AtomicU32,
    stats: BackendStats,
    up_status: AtomicBool,
    hashes: RwLock<Vec<u32>>,
    hashes_computed: AtomicBool,
    sockets: RwLock<Vec<Option<Arc<Socket>>>>,
    sockets_offset: AtomicU64,
    connected: AtomicBool,
    stopped: AtomicBool,
    connect_lock: Mutex<()>,
    connected_cond: Condvar,
    worker_started: AtomicBool,
    id_states: IdStateTable,
    limiter: Option<QpsLimiter>,
    timeout_handler: RwLock<Option<TimeoutHandler>>,
}

impl std::fmt::Debug for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backend")
            .field("name", &self.config.name)
            .field("remote", &self.config.remote)
            .field("weight", &self.weight())
            .field("connected", &self.is_connected())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

impl Backend {
    /// Construct a backend from its configuration.
    ///
    /// With `connect` set, the UDP socket set is connected synchronously;
    /// failures leave the backend disconnected rather than failing
    /// construction (the worker retries later).
    ///
    /// # Errors
    ///
    /// Rejects configurations with a weight or socket count below 1.
    pub fn new(
        config: BackendConfig,
        settings: Arc<Settings>,
        connect: bool,
    ) -> Result<Arc<Self>> {
        if config.weight < 1 {
            return Err(Error::InvalidWeight(config.weight));
        }
        if config.number_of_sockets < 1 {
            return Err(Error::InvalidSocketCount(config.number_of_sockets));
        }

        let limiter = config.qps_limit.map(|limit| QpsLimiter::new(limit, limit));
        let id = config.id.unwrap_or_else(Uuid::new_v4);
        let id_states = IdStateTable::new(
            settings.randomize_ids_to_backend,
            settings.max_udp_outstanding,
        );
        let weight = config.weight;
        let tcp_only = config.tcp_only;

        let backend = Arc::new(Self {
            config,
            settings,
            id: RwLock::new(id),
            weight: AtomicU32::new(weight),
            stats: BackendStats::default(),
            up_status: AtomicBool::new(false),
            hashes: RwLock::new(Vec::new()),
            hashes_computed: AtomicBool::new(false),
            sockets: RwLock::new(Vec::new()),
            sockets_offset: AtomicU64::new(0),
            connected: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            connect_lock: Mutex::new(()),
            connected_cond: Condvar::new(),
            worker_started: AtomicBool::new(false),
            id_states,
            limiter,
            timeout_handler: RwLock::new(None),
        });

        if connect && !tcp_only {
            Self::connect_udp_sockets(&backend);
        }

        Ok(backend)
    }

    /// The immutable configuration block.
    #[must_use]
    pub fn config(&self) -> &BackendConfig {
        &self.config
    }

    /// Display name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Display name with the remote address appended, the form used as the
    /// key in query skip-tags.
    #[must_use]
    pub fn name_with_addr(&self) -> String {
        if self.config.name.is_empty() {
            self.config.remote.to_string()
        } else {
            format!("{} ({})", self.config.name, self.config.remote)
        }
    }

    /// Current backend id.
    #[must_use]
    pub fn id(&self) -> Uuid {
        *self.id.read().expect("id lock poisoned")
    }

    /// Current weight.
    #[must_use]
    pub fn weight(&self) -> u32 {
        self.weight.load(Ordering::Relaxed)
    }

    /// Pool-ordering priority; lower comes first.
    #[must_use]
    pub fn order(&self) -> i32 {
        self.config.order
    }

    /// Per-backend counters.
    #[must_use]
    pub fn stats(&self) -> &BackendStats {
        &self.stats
    }

    /// The QPS limiter, when a rate cap is configured.
    #[must_use]
    pub fn qps_limiter(&self) -> Option<&QpsLimiter> {
        self.limiter.as_ref()
    }

    /// Whether this backend only speaks TCP.
    #[must_use]
    pub fn is_tcp_only(&self) -> bool {
        self.config.tcp_only
    }

    /// Liveness, combining forced availability with the externally probed
    /// up flag. A stopped backend is never up.
    #[must_use]
    pub fn is_up(&self) -> bool {
        if self.is_stopped() {
            return false;
        }
        match self.config.availability {
            Availability::Up => true,
            Availability::Down => false,
            Availability::Auto | Availability::Lazy => self.up_status.load(Ordering::Relaxed),
        }
    }

    /// Set the probed up flag. This is the hook the external health checker
    /// drives; it has no effect on forced `up`/`down` backends.
    pub fn set_up_status(&self, up: bool) {
        let previous = self.up_status.swap(up, Ordering::Relaxed);
        if previous != up {
            info!(backend = %self.name_with_addr(), up, "Backend status changed");
        }
    }

    /// Whether every socket is currently connected.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Whether the backend has been stopped. Terminal.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Latency relevant for ordering decisions: TCP latency for TCP-only
    /// backends, UDP latency otherwise.
    #[must_use]
    pub fn relevant_latency_usec(&self) -> u64 {
        if self.config.tcp_only {
            self.stats.latency_usec_tcp()
        } else {
            self.stats.latency_usec()
        }
    }

    /// Replace the backend id, recomputing the hash vector if it was
    /// already computed.
    pub fn set_id(&self, new_id: Uuid) {
        if self.is_stopped() {
            return;
        }
        *self.id.write().expect("id lock poisoned") = new_id;
        if self.hashes_computed.load(Ordering::Acquire) {
            self.hash();
        }
    }

    /// Update the weight, recomputing the hash vector if it was already
    /// computed. Values below 1 are ignored.
    pub fn set_weight(&self, new_weight: u32) {
        if new_weight < 1 {
            warn!(
                backend = %self.name_with_addr(),
                "Ignoring weight update below 1"
            );
            return;
        }
        if self.is_stopped() {
            return;
        }
        self.weight.store(new_weight, Ordering::Relaxed);
        if self.hashes_computed.load(Ordering::Acquire) {
            self.hash();
        }
    }

    /// Rebuild the hash vector: the sorted hashes of `"<id>-<k>"` for every
    /// `k` in `1..=weight`, under the process-wide perturbation.
    pub fn hash(&self) {
        let weight = self.weight();
        let id = self.id().to_string();
        debug!(backend = %self.name_with_addr(), weight, "Computing backend hashes");

        let mut hashes = self.hashes.write().expect("hashes lock poisoned");
        hashes.clear();
        hashes.reserve(weight as usize);
        for k in 1..=weight {
            let token = format!("{id}-{k}");
            hashes.push(burtle_ci(
                token.as_bytes(),
                self.settings.hash_perturbation,
            ));
        }
        hashes.sort_unstable();
        drop(hashes);

        self.hashes_computed.store(true, Ordering::Release);
    }

    /// Whether the hash vector has ever been computed.
    #[must_use]
    pub fn hashes_computed(&self) -> bool {
        self.hashes_computed.load(Ordering::Acquire)
    }

    /// Run `f` against the current hash vector under the shared lock.
    pub fn with_hashes<R>(&self, f: impl FnOnce(&[u32]) -> R) -> R {
        let hashes = self.hashes.read().expect("hashes lock poisoned");
        f(&hashes)
    }

    /// Copy of the current hash vector.
    #[must_use]
    pub fn hash_vector(&self) -> Vec<u32> {
        self.with_hashes(<[u32]>::to_vec)
    }

    /// Size the socket table and attempt the initial connect.
    pub fn connect_udp_sockets(this: &Arc<Self>) -> bool {
        {
            let mut sockets = this.sockets.write().expect("sockets lock poisoned");
            sockets.clear();
            sockets.resize_with(this.config.number_of_sockets, || None);
        }
        Self::reconnect(this, true)
    }

    /// Tear down and re-open every socket.
    ///
    /// Serialized on the connect lock with `try_lock`: a busy lock means
    /// another reconnect is already in flight and this call reports
    /// failure. All-or-nothing: a partial failure closes everything that
    /// was opened. On success after the initial attempt, the maintenance
    /// worker is started.
    pub fn reconnect(this: &Arc<Self>, initial_attempt: bool) -> bool {
        let Ok(_guard) = this.connect_lock.try_lock() else {
            // Already reconnecting elsewhere.
            return false;
        };
        if this.is_stopped() {
            return false;
        }
        if this.config.remote.ip().is_unspecified() {
            return true;
        }

        this.connected.store(false, Ordering::Release);
        let socket_count = this.config.number_of_sockets;

        {
            let mut sockets = this.sockets.write().expect("sockets lock poisoned");
            for slot in sockets.iter_mut() {
                if let Some(old) = slot.take() {
                    // shutdown() wakes any receiver still blocked on the fd.
                    let _ = old.shutdown(std::net::Shutdown::Both);
                }
            }
            sockets.resize_with(socket_count, || None);
        }

        let mut fresh: Vec<Option<Arc<Socket>>> = Vec::with_capacity(socket_count);
        let mut all_connected = true;
        for index in 0..socket_count {
            match socket::connect_udp(&this.config) {
                Ok(new_socket) => fresh.push(Some(Arc::new(new_socket))),
                Err(error) => {
                    warn!(
                        backend = %this.name_with_addr(),
                        socket = index,
                        %error,
                        "Failed to connect backend socket"
                    );
                    all_connected = false;
                    break;
                }
            }
        }

        if all_connected {
            *this.sockets.write().expect("sockets lock poisoned") = fresh;
            this.connected.store(true, Ordering::Release);
            this.connected_cond.notify_all();
            info!(
                backend = %this.name_with_addr(),
                sockets = socket_count,
                "Backend connected"
            );
            if !initial_attempt {
                Self::start(this);
            }
        }
        // On failure `fresh` is dropped here, closing anything half-opened.

        all_connected
    }

    /// Start the maintenance worker, once, for a connected backend.
    pub fn start(this: &Arc<Self>) {
        if this.is_stopped() || !this.is_connected() {
            return;
        }
        if this.worker_started.swap(true, Ordering::AcqRel) {
            return;
        }
        worker::spawn(Arc::clone(this));
    }

    /// Block until the socket set is connected, or the backend stops.
    pub fn wait_until_connected(&self) {
        if self.is_stopped() || self.is_connected() {
            return;
        }
        let mut guard = self.connect_lock.lock().expect("connect lock poisoned");
        while !self.is_connected() && !self.is_stopped() {
            let (reacquired, _) = self
                .connected_cond
                .wait_timeout(guard, Duration::from_millis(100))
                .expect("connect lock poisoned");
            guard = reacquired;
        }
    }

    /// Stop the backend: one-way latch, then `shutdown` on every open fd to
    /// unblock any receiver. Idempotent; sockets close at drop.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(backend = %self.name_with_addr(), "Stopping backend");

        let _guard = self.connect_lock.lock().expect("connect lock poisoned");
        let sockets = self.sockets.read().expect("sockets lock poisoned");
        for open in sockets.iter().flatten() {
            let _ = open.shutdown(std::net::Shutdown::Both);
        }
        drop(sockets);
        self.connected_cond.notify_all();
    }

    /// Pick one socket for sending: the only one when there is one, a
    /// round-robin or randomized choice otherwise.
    #[must_use]
    pub fn pick_socket_for_sending(&self) -> Option<Arc<Socket>> {
        use rand::Rng;

        let sockets = self.sockets.read().expect("sockets lock poisoned");
        match sockets.len() {
            0 => None,
            1 => sockets[0].clone(),
            count => {
                let index = if self.settings.randomize_udp_sockets {
                    rand::rng().random_range(0..count)
                } else {
                    (self.sockets_offset.fetch_add(1, Ordering::Relaxed) % count as u64) as usize
                };
                sockets[index].clone()
            }
        }
    }

    /// Wait up to `timeout` and return the sockets with readable data.
    /// With a single socket this returns immediately; the receiver blocks
    /// on the socket itself.
    #[must_use]
    pub fn pick_sockets_ready_for_receiving(&self, timeout: Duration) -> Vec<Arc<Socket>> {
        let sockets: Vec<Arc<Socket>> = self
            .sockets
            .read()
            .expect("sockets lock poisoned")
            .iter()
            .flatten()
            .cloned()
            .collect();
        if sockets.len() <= 1 {
            return sockets;
        }
        match socket::poll_readable(&sockets, timeout) {
            Ok(ready) => ready
                .into_iter()
                .map(|index| Arc::clone(&sockets[index]))
                .collect(),
            Err(error) => {
                warn!(backend = %self.name_with_addr(), %error, "Socket poll failed");
                Vec::new()
            }
        }
    }

    /// Install the handler invoked with drained queries on timeout or slot
    /// reuse.
    pub fn set_timeout_handler(&self, handler: impl Fn(PendingQuery) + Send + Sync + 'static) {
        *self
            .timeout_handler
            .write()
            .expect("timeout handler lock poisoned") = Some(Box::new(handler));
    }

    fn run_timeout_handler(&self, query: PendingQuery) {
        let handler = self
            .timeout_handler
            .read()
            .expect("timeout handler lock poisoned");
        if let Some(handler) = handler.as_ref() {
            handler(query);
        } else {
            debug!(
                backend = %self.name_with_addr(),
                qname = %query.qname,
                "Dropping timed-out query, no handler installed"
            );
        }
    }

    /// Allocate a 16-bit id slot for an outgoing query.
    ///
    /// Never fails: a collision evicts the previous occupant, which counts
    /// as a reuse and is surfaced through the timeout handler.
    pub fn save_state(&self, query: PendingQuery) -> u16 {
        let (id, evicted) = self.id_states.save(query);
        match evicted {
            Some(old) => {
                self.stats.reuseds.fetch_add(1, Ordering::Relaxed);
                self.run_timeout_handler(old);
            }
            None => {
                self.stats.outstanding.fetch_add(1, Ordering::Relaxed);
            }
        }
        id
    }

    /// Put a query back into a specific slot, for example after a failed
    /// send. A busy slot counts as a reuse and the query is surfaced
    /// through the timeout handler instead.
    pub fn restore_state(&self, id: u16, query: PendingQuery) {
        match self.id_states.restore(id, query) {
            Ok(()) => {
                self.stats.outstanding.fetch_add(1, Ordering::Relaxed);
            }
            Err(dropped) => {
                self.stats.reuseds.fetch_add(1, Ordering::Relaxed);
                self.run_timeout_handler(dropped);
            }
        }
    }

    /// Take the query stored under `id`, if any, releasing the slot.
    #[must_use]
    pub fn get_state(&self, id: u16) -> Option<PendingQuery> {
        let taken = self.id_states.take(id);
        if taken.is_some() {
            self.stats.outstanding.fetch_sub(1, Ordering::Relaxed);
        }
        taken
    }

    /// Age the id table by one tick and reclaim expired slots.
    ///
    /// Callers drive this from a periodic timer; the maintenance worker
    /// invokes it once per second. UDP only.
    pub fn handle_udp_timeouts(&self) {
        if self.is_stopped() || self.config.tcp_only {
            return;
        }
        if matches!(self.id_states, IdStateTable::Sequential(_)) && self.stats.outstanding() == 0 {
            return;
        }

        let timeout_ticks = self.config.udp_timeout_secs(self.settings.udp_timeout);
        let mut expired = Vec::new();
        self.id_states
            .sweep_expired(timeout_ticks, |query| expired.push(query));

        if expired.is_empty() {
            return;
        }
        debug!(
            backend = %self.name_with_addr(),
            count = expired.len(),
            "Reclaimed timed-out UDP queries"
        );
        for query in expired {
            self.stats.outstanding.fetch_sub(1, Ordering::Relaxed);
            self.stats.reuseds.fetch_add(1, Ordering::Relaxed);
            self.run_timeout_handler(query);
        }
    }

    /// Record a newly opened TCP connection, maintaining the concurrency
    /// high-water mark.
    pub fn inc_current_connections_count(&self) {
        let current = self
            .stats
            .tcp_current_connections
            .fetch_add(1, Ordering::Relaxed)
            + 1;
        self.stats
            .tcp_max_concurrent_connections
            .fetch_max(current, Ordering::AcqRel);
    }

    /// Record a closed TCP connection.
    pub fn dec_current_connections_count(&self) {
        self.stats
            .tcp_current_connections
            .fetch_sub(1, Ordering::Relaxed);
    }

    /// Hand a query off to a different protocol path.
    ///
    /// Cross-protocol offload is not wired up in this core; the query comes
    /// back untouched so call sites keep working when the hook grows an
    /// implementation.
    pub fn pass_cross_protocol_query(
        &self,
        query: PendingQuery,
    ) -> std::result::Result<(), PendingQuery> {
        Err(query)
    }
}

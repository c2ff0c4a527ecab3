//! Per-backend maintenance worker.
//!
//! One long-lived thread per connected backend: every tick it scans the id
//! table for expired in-flight queries, and while the backend is
//! disconnected it retries `reconnect` under exponential back-off. The
//! packet receive loop itself lives outside the core; it drains the sockets
//! surfaced by `Backend::pick_sockets_ready_for_receiving`.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{debug, warn};

use super::Backend;

/// Sweep cadence; also the upper bound on how long a tick blocks.
const TICK: Duration = Duration::from_secs(1);

/// Back-off schedule for reconnect attempts.
struct ReconnectBackoff {
    consecutive_failures: u32,
}

impl ReconnectBackoff {
    const MAX_DELAY_SECS: u64 = 60;

    fn new() -> Self {
        Self {
            consecutive_failures: 0,
        }
    }

    fn next(&mut self) -> Duration {
        let exp = self.consecutive_failures.min(6);
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        Duration::from_secs((1u64 << exp).min(Self::MAX_DELAY_SECS))
    }

    fn reset(&mut self) {
        self.consecutive_failures = 0;
    }
}

/// Spawn the maintenance worker for `backend`. The thread is detached; it
/// exits on its own once the backend is stopped.
pub(crate) fn spawn(backend: Arc<Backend>) {
    let result = thread::Builder::new()
        .name("dnslb-backend".to_string())
        .spawn(move || run(backend));
    if let Err(error) = result {
        warn!(%error, "Failed to spawn backend worker thread");
    }
}

fn run(backend: Arc<Backend>) {
    pin_to_cpus(&backend.config().cpus);

    let mut backoff = ReconnectBackoff::new();
    debug!(backend = %backend.name_with_addr(), "Maintenance worker started");

    while !backend.is_stopped() {
        if backend.is_connected() {
            backoff.reset();
            thread::sleep(TICK);
        } else {
            thread::sleep(backoff.next());
            if backend.is_stopped() {
                break;
            }
            if !Backend::reconnect(&backend, false) {
                warn!(
                    backend = %backend.name_with_addr(),
                    "Backend reconnect attempt failed"
                );
            }
        }

        backend.handle_udp_timeouts();
    }

    debug!(backend = %backend.name_with_addr(), "Maintenance worker stopped");
}

#[cfg(target_os = "linux")]
fn pin_to_cpus(cpus: &[usize]) {
    if cpus.is_empty() {
        return;
    }
    // sched_setaffinity(0) applies to the calling thread.
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        for &cpu in cpus {
            libc::CPU_SET(cpu, &mut set);
        }
        if libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set) != 0 {
            warn!(?cpus, "Failed to set worker CPU affinity");
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn pin_to_cpus(_cpus: &[usize]) {}

//! Backend-side UDP socket plumbing.
//!
//! Sockets are connected datagram sockets built through `socket2` so the
//! client side can be pinned to an interface and source address and marked
//! with a DSCP value before `connect()`. Readiness across a multi-socket set
//! goes through `poll(2)`.

use std::io;
use std::net::SocketAddr;
use std::os::fd::AsRawFd;
use std::sync::Arc;
use std::time::Duration;

use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tracing::{debug, warn};

use super::config::BackendConfig;

/// Open, configure and connect one UDP socket towards `config.remote`.
pub(crate) fn connect_udp(config: &BackendConfig) -> io::Result<Socket> {
    let domain = if config.remote.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;

    #[cfg(target_os = "linux")]
    if let Some(name) = &config.source_itf_name {
        // A failed device bind is logged but not fatal, the socket still
        // routes through the default interface.
        if let Err(error) = socket.bind_device(Some(name.as_bytes())) {
            warn!(
                backend = %config.remote,
                interface = %name,
                %error,
                "Failed to bind backend socket to interface"
            );
        }
    }

    if let Some(addr) = config.source_addr {
        socket.bind(&SockAddr::from(SocketAddr::new(addr, 0)))?;
    }

    if let Some(dscp) = config.dscp {
        if config.remote.is_ipv4() {
            if let Err(error) = socket.set_tos(u32::from(dscp) << 2) {
                warn!(backend = %config.remote, dscp, %error, "Failed to set DSCP");
            }
        }
    }

    socket.connect(&SockAddr::from(config.remote))?;
    debug!(backend = %config.remote, "Backend socket connected");
    Ok(socket)
}

/// Wait up to `timeout` for readability, returning the indexes of the
/// readable sockets.
pub(crate) fn poll_readable(
    sockets: &[Arc<Socket>],
    timeout: Duration,
) -> io::Result<Vec<usize>> {
    if sockets.is_empty() {
        return Ok(Vec::new());
    }

    let mut fds: Vec<libc::pollfd> = sockets
        .iter()
        .map(|socket| libc::pollfd {
            fd: socket.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        })
        .collect();

    let timeout_ms = timeout.as_millis().min(i32::MAX as u128) as libc::c_int;
    // poll only reads the descriptor list and fills in revents.
    let rc = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(fds
        .iter()
        .enumerate()
        .filter(|(_, fd)| fd.revents & libc::POLLIN != 0)
        .map(|(index, _)| index)
        .collect())
}

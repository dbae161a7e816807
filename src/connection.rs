//! Per-connection socket tuning used by `send` once a stream's duration is
//! known: extend the OS-level TCP keepalive so the kernel doesn't reap a
//! long-poll connection that's merely quiet between notifications.

use socket2::{SockRef, TcpKeepalive};
use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;

/// A cheap, cloneable handle onto one accepted connection's underlying
/// socket, captured by the host application before the stream is handed to
/// the HTTP server and threaded through to [`crate::session::PrepSession`]
/// via [`crate::session::RequestContext`] so `send` can tune it once
/// negotiation succeeds.
#[derive(Clone)]
pub struct ConnectionControl {
    socket: Arc<socket2::Socket>,
}

impl fmt::Debug for ConnectionControl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionControl").finish_non_exhaustive()
    }
}

impl ConnectionControl {
    /// Duplicates `stream`'s underlying file descriptor so it can outlive
    /// the borrow once the stream is moved into the HTTP server loop.
    pub fn capture(stream: &TcpStream) -> io::Result<Self> {
        let socket = SockRef::from(stream).try_clone()?;
        Ok(Self {
            socket: Arc::new(socket),
        })
    }

    /// Extends TCP keepalive to `duration + 1s`, matching a negotiated
    /// stream's lifetime. Tokio's runtime and hyper's connection loop don't
    /// impose an inactivity timer of their own on an open socket, so there
    /// is no separate "idle timeout" knob to turn off here the way there
    /// would be on a server runtime that ships one by default; keepalive is
    /// the only OS-level setting this connection needs adjusted.
    pub fn extend_for(&self, duration: Duration) {
        let keepalive = TcpKeepalive::new().with_time(duration + Duration::from_secs(1));
        if let Err(err) = self.socket.set_tcp_keepalive(&keepalive) {
            tracing::warn!(error = %err, "prep: failed to extend connection keepalive");
        }
    }
}

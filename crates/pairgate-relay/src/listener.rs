//! Listener: accepts connections on one port and pairs them with the sibling
//! listener's waiting channel
//!
//! Each listener keeps at most one pending channel, the most recent arrival
//! that has no peer yet. A newer unmatched arrival evicts it.

use crate::channel::{Channel, ChannelId, CloseMode};
use crate::error::GatewayError;
use crate::logger::{level, Logger};
use crate::relay::Relay;
use crate::state::RelayCore;
use std::collections::HashSet;
use std::future::Future;
use std::io;
use std::mem;
use std::net::SocketAddr;
use std::ops::ControlFlow;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio_util::sync::CancellationToken;

/// Backlog of each listen socket; only one unpaired arrival is retained anyway
const LISTEN_BACKLOG: u32 = 2;

const BIND_ATTEMPTS: u32 = 3;

/// Which of the gateway's two listeners
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    First,
    Second,
}

impl Side {
    /// The sibling listener's side
    pub fn peer(self) -> Side {
        match self {
            Side::First => Side::Second,
            Side::Second => Side::First,
        }
    }

    pub(crate) fn index(self) -> usize {
        match self {
            Side::First => 0,
            Side::Second => 1,
        }
    }
}

/// Point-in-time view of one listener
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerStatus {
    pub port: u16,
    pub open: bool,
    /// False once the accept loop stopped on a fatal error
    pub accepting: bool,
    pub active_channels: usize,
    /// The channel waiting for a partner, if any
    pub pending: Option<ChannelId>,
}

#[derive(Debug)]
pub(crate) struct ListenerState {
    pub(crate) port: u16,
    pub(crate) open: bool,
    pub(crate) accepting: bool,
    pub(crate) active: HashSet<ChannelId>,
    pub(crate) pending: Option<ChannelId>,
}

impl ListenerState {
    pub(crate) fn new(port: u16) -> Self {
        Self {
            port,
            open: false,
            accepting: false,
            active: HashSet::new(),
            pending: None,
        }
    }
}

impl RelayCore {
    pub(crate) fn open_listener(&mut self, side: Side, port: u16) {
        let listener = self.listener_mut(side);
        listener.port = port;
        listener.open = true;
        listener.accepting = true;
        self.log_listener(side, level::LISTENER, "TCP listener opened.");
    }

    /// Registers a newly accepted connection and pairs it with the sibling
    /// listener's pending channel when there is one.
    ///
    /// Returns `None` when the listener is already closed.
    pub(crate) fn accept(&mut self, side: Side, remote_addr: SocketAddr) -> Option<ChannelId> {
        if !self.listener(side).open {
            return None;
        }

        if let Some(stale) = self.listener_mut(side).pending.take() {
            self.log_listener(
                side,
                level::CONNECTION,
                "Closing pending previous incoming connection.",
            );
            self.close_channel(stale, CloseMode::Abort);
        }

        let id = self.allocate_channel_id();
        let mut channel = Channel::new(side, remote_addr);
        self.listener_mut(side).active.insert(id);

        match self.take_pending(side.peer()) {
            Some(partner) => {
                channel.peer = Some(partner);
                if let Some(partner) = self.channels.get_mut(&partner) {
                    partner.peer = Some(id);
                }
            }
            None => self.listener_mut(side).pending = Some(id),
        }

        self.channels.insert(id, channel);
        self.open_channel(id);
        Some(id)
    }

    fn take_pending(&mut self, side: Side) -> Option<ChannelId> {
        let listener = self.listener_mut(side);
        if !listener.open {
            return None;
        }
        listener.pending.take()
    }

    pub(crate) fn deregister(&mut self, side: Side, id: ChannelId) {
        let listener = self.listener_mut(side);
        listener.active.remove(&id);
        if listener.pending == Some(id) {
            listener.pending = None;
        }
    }

    /// Closes the listener and every channel it owns. Peers on the sibling
    /// listener go down with them.
    pub(crate) fn close_listener(&mut self, side: Side) {
        if !self.listener(side).open {
            return;
        }
        self.log_listener(side, level::LISTENER, "Closing TCP listener.");
        let listener = self.listener_mut(side);
        listener.open = false;
        listener.accepting = false;
        listener.pending = None;
        let active = mem::take(&mut listener.active);

        let mut ids: Vec<ChannelId> = active.into_iter().collect();
        ids.sort();
        for id in ids {
            self.close_channel(id, CloseMode::Abort);
        }
    }

    pub(crate) fn log_listener(&self, side: Side, lvl: u8, message: &str) {
        if self.logger.check_level(lvl) {
            self.logger.log(
                lvl,
                &format!("Listener {}: {}", self.listener(side).port, message),
            );
        }
    }

    pub(crate) fn log_listener_error(&self, side: Side, lvl: u8, message: &str, err: &io::Error) {
        if self.logger.check_level(lvl) {
            self.logger.log_error(
                lvl,
                &format!("Listener {}: {}", self.listener(side).port, message),
                err,
            );
        }
    }
}

/// Creates the listen socket, retrying while the port lingers in TIME_WAIT.
pub(crate) async fn bind_listener(
    addr: SocketAddr,
    logger: &dyn Logger,
) -> Result<TcpListener, GatewayError> {
    for attempt in 1..=BIND_ATTEMPTS {
        match listen(addr) {
            Ok(listener) => return Ok(listener),
            Err(e) if e.kind() == io::ErrorKind::AddrInUse && attempt < BIND_ATTEMPTS => {
                if logger.check_level(level::ABNORMAL) {
                    logger.log(
                        level::ABNORMAL,
                        &format!(
                            "Listener {}: Port is in use (attempt {}/{}), retrying in 1 second...",
                            addr.port(),
                            attempt,
                            BIND_ATTEMPTS
                        ),
                    );
                }
                tokio::time::sleep(tokio::time::Duration::from_secs(1)).await;
            }
            Err(e) => {
                return Err(GatewayError::BindError {
                    address: addr.ip().to_string(),
                    port: addr.port(),
                    reason: e.to_string(),
                });
            }
        }
    }

    Err(GatewayError::BindError {
        address: addr.ip().to_string(),
        port: addr.port(),
        reason: format!("Address in use after {} attempts", BIND_ATTEMPTS),
    })
}

fn listen(addr: SocketAddr) -> io::Result<TcpListener> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    #[cfg(unix)]
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    socket.listen(LISTEN_BACKLOG)
}

/// Source of accepted connections for one listener
pub(crate) trait Accept: Send {
    fn accept(&mut self) -> impl Future<Output = io::Result<(TcpStream, SocketAddr)>> + Send;
}

impl Accept for TcpListener {
    fn accept(&mut self) -> impl Future<Output = io::Result<(TcpStream, SocketAddr)>> + Send {
        TcpListener::accept(self)
    }
}

/// Accepts connections until `shutdown` fires or a non-transient accept
/// error occurs.
pub(crate) async fn accept_loop<A: Accept>(
    side: Side,
    mut listener: A,
    relay: Arc<Relay>,
    shutdown: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, remote_addr)) => relay.channel_accepted(side, stream, remote_addr),
            Err(e) => {
                if let ControlFlow::Break(()) = relay.accept_failed(side, &e) {
                    break;
                }
            }
        }
    }
}

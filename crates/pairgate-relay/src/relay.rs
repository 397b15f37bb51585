//! The gateway lock
//!
//! One mutex guards the relay state machine of a gateway together with the
//! socket task handles of its channels. Every accept, receive and send
//! completion of both listeners passes through it, so pairing, eviction and
//! cascade close are processed strictly one event at a time. Only non-blocking
//! queue operations happen while it is held.

use crate::channel::ChannelId;
use crate::error::is_transient_accept_error;
use crate::io::ChannelIo;
use crate::listener::{ListenerStatus, Side};
use crate::logger::{level, Logger};
use crate::state::{Action, RelayCore};
use bytes::Bytes;
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::ops::ControlFlow;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::net::TcpStream;

pub(crate) struct RelayState {
    pub(crate) core: RelayCore,
    io: HashMap<ChannelId, ChannelIo>,
}

impl RelayState {
    /// Hands every recorded action to the socket tasks.
    fn dispatch(&mut self) {
        for action in self.core.drain_actions() {
            match action {
                Action::Receive(id) => {
                    if let Some(io) = self.io.get(&id) {
                        io.receive();
                    }
                }
                Action::Send(id, data) => {
                    if let Some(io) = self.io.get(&id) {
                        io.send(data);
                    }
                }
                Action::Close(id, mode) => {
                    if let Some(io) = self.io.remove(&id) {
                        io.close(mode);
                    }
                }
            }
        }
    }
}

pub(crate) struct Relay {
    state: Mutex<RelayState>,
}

impl Relay {
    pub(crate) fn new(ports: [u16; 2], logger: Arc<dyn Logger>) -> Self {
        Self {
            state: Mutex::new(RelayState {
                core: RelayCore::new(ports, logger),
                io: HashMap::new(),
            }),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, RelayState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn open_listeners(&self, ports: [u16; 2]) {
        let mut state = self.lock();
        state.core.open_listener(Side::First, ports[0]);
        state.core.open_listener(Side::Second, ports[1]);
    }

    pub(crate) fn close_listeners(&self) {
        let mut state = self.lock();
        state.core.close_listener(Side::First);
        state.core.close_listener(Side::Second);
        state.dispatch();
    }

    pub(crate) fn channel_accepted(
        self: &Arc<Self>,
        side: Side,
        stream: TcpStream,
        remote_addr: SocketAddr,
    ) {
        let mut state = self.lock();
        if !state.core.listener(side).open {
            return;
        }
        state.core.log_listener(
            side,
            level::CONNECTION,
            &format!("Incoming TCP connection from {}.", remote_addr),
        );
        let Some(id) = state.core.accept(side, remote_addr) else {
            return;
        };
        let io = ChannelIo::spawn(id, stream, Arc::clone(self));
        state.io.insert(id, io);
        state.dispatch();
    }

    /// Handles a failed accept. Transient errors are retried silently; any
    /// other error stops that listener from accepting while its channels keep
    /// relaying.
    pub(crate) fn accept_failed(&self, side: Side, err: &io::Error) -> ControlFlow<()> {
        if is_transient_accept_error(err) {
            return ControlFlow::Continue(());
        }
        let mut state = self.lock();
        state
            .core
            .log_listener_error(side, level::FATAL, "Fatal error: ", err);
        state.core.listener_mut(side).accepting = false;
        ControlFlow::Break(())
    }

    pub(crate) fn receive_completed(&self, id: ChannelId, result: io::Result<Bytes>) {
        let mut state = self.lock();
        state.core.receive_completed(id, result);
        state.dispatch();
    }

    pub(crate) fn send_completed(&self, id: ChannelId, result: io::Result<()>) {
        let mut state = self.lock();
        state.core.send_completed(id, result);
        state.dispatch();
    }

    pub(crate) fn status(&self) -> [ListenerStatus; 2] {
        let state = self.lock();
        [
            state.core.status(Side::First),
            state.core.status(Side::Second),
        ]
    }
}

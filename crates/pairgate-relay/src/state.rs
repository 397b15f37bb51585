//! Gateway-wide relay state
//!
//! [`RelayCore`] holds both listeners and every live channel. It reacts to
//! accept, receive and send completions and records the socket operations it
//! wants performed as [`Action`]s. It never touches a socket itself, so the
//! whole pairing and relay logic runs as a sequential event processor under
//! the gateway lock.

use crate::channel::{Channel, ChannelId, CloseMode};
use crate::listener::{ListenerState, ListenerStatus, Side};
use crate::logger::Logger;
use bytes::Bytes;
use std::collections::HashMap;
use std::mem;
use std::sync::Arc;

/// Socket operation requested by the state machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Action {
    /// Read at most one receive chunk from the channel's socket
    Receive(ChannelId),
    /// Write the whole byte span to the channel's socket
    Send(ChannelId, Bytes),
    /// Release the channel's socket
    Close(ChannelId, CloseMode),
}

pub(crate) struct RelayCore {
    pub(crate) listeners: [ListenerState; 2],
    pub(crate) channels: HashMap<ChannelId, Channel>,
    pub(crate) logger: Arc<dyn Logger>,
    next_channel_id: u64,
    actions: Vec<Action>,
}

impl RelayCore {
    pub fn new(ports: [u16; 2], logger: Arc<dyn Logger>) -> Self {
        Self {
            listeners: [ListenerState::new(ports[0]), ListenerState::new(ports[1])],
            channels: HashMap::new(),
            logger,
            next_channel_id: 1,
            actions: Vec::new(),
        }
    }

    /// Takes the operations recorded since the last call, in issue order.
    pub fn drain_actions(&mut self) -> Vec<Action> {
        mem::take(&mut self.actions)
    }

    pub(crate) fn push_action(&mut self, action: Action) {
        self.actions.push(action);
    }

    pub(crate) fn allocate_channel_id(&mut self) -> ChannelId {
        let id = ChannelId(self.next_channel_id);
        self.next_channel_id += 1;
        id
    }

    pub(crate) fn listener(&self, side: Side) -> &ListenerState {
        &self.listeners[side.index()]
    }

    pub(crate) fn listener_mut(&mut self, side: Side) -> &mut ListenerState {
        &mut self.listeners[side.index()]
    }

    pub fn status(&self, side: Side) -> ListenerStatus {
        let listener = self.listener(side);
        ListenerStatus {
            port: listener.port,
            open: listener.open,
            accepting: listener.accepting,
            active_channels: listener.active.len(),
            pending: listener.pending,
        }
    }
}

#[cfg(test)]
impl RelayCore {
    /// Peer of `id`, if it has been paired.
    pub fn peer_of(&self, id: ChannelId) -> Option<ChannelId> {
        self.channels.get(&id).and_then(|c| c.peer)
    }

    pub fn is_channel_open(&self, id: ChannelId) -> bool {
        self.channels.get(&id).is_some_and(Channel::is_open)
    }

    /// Number of bytes waiting in the retention buffer of `id`.
    pub fn retained_len(&self, id: ChannelId) -> usize {
        self.channels.get(&id).map_or(0, |c| c.retention.len())
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }
}

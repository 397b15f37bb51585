//! Channel relay state machine
//!
//! A channel wraps one accepted socket. Once paired, bytes received on a
//! channel are written to its peer. While the peer is missing, not yet open,
//! or busy sending, received bytes wait in a small retention buffer.
//!
//! At most one receive and one send are in flight per channel. The
//! `receiving`/`sending` flags are set when the operation is requested and
//! cleared when its completion is processed.

use crate::error::DisconnectCause;
use crate::listener::Side;
use crate::logger::level;
use crate::state::{Action, RelayCore};
use bytes::{Bytes, BytesMut};
use std::fmt;
use std::io;
use std::net::SocketAddr;

/// Capacity of the per-channel retention buffer
pub const RETENTION_CAPACITY: usize = 0x1000;

/// Largest number of bytes a single receive may return
pub const RECEIVE_CHUNK_SIZE: usize = 0x2000;

/// Identifies a channel within one gateway
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(pub(crate) u64);

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// How a channel's socket is released
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseMode {
    /// Orderly shutdown before closing
    Graceful,
    /// Reset the connection without a shutdown handshake
    Abort,
}

/// Lifecycle of a registered channel. A closed channel is removed from the
/// relay state, so it has no state of its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ChannelState {
    Created,
    Open,
}

/// Result of appending a chunk to a [`RetentionBuffer`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Retained {
    Stored,
    /// The buffered bytes were dropped to make room. When `chunk_dropped` is
    /// set the new chunk did not fit on its own either and nothing is buffered.
    Overflow {
        discarded: usize,
        chunk_dropped: bool,
    },
}

/// Bounded FIFO of received-but-unforwarded bytes.
///
/// Overflow is lossy: old content is discarded rather than growing the buffer.
#[derive(Debug)]
pub(crate) struct RetentionBuffer {
    data: BytesMut,
    capacity: usize,
}

impl RetentionBuffer {
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        Self {
            data: BytesMut::new(),
            capacity,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.data.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub(crate) fn push(&mut self, chunk: &[u8]) -> Retained {
        if self.data.len() + chunk.len() <= self.capacity {
            self.data.extend_from_slice(chunk);
            return Retained::Stored;
        }

        let discarded = self.data.len();
        self.data.clear();
        let chunk_dropped = chunk.len() > self.capacity;
        if !chunk_dropped {
            self.data.extend_from_slice(chunk);
        }
        Retained::Overflow {
            discarded,
            chunk_dropped,
        }
    }

    /// Removes and returns the whole buffered content.
    pub(crate) fn take(&mut self) -> Bytes {
        self.data.split().freeze()
    }
}

/// One side of a relay pair
#[derive(Debug)]
pub(crate) struct Channel {
    pub(crate) side: Side,
    pub(crate) remote_addr: SocketAddr,
    pub(crate) signature: String,
    pub(crate) peer: Option<ChannelId>,
    pub(crate) retention: RetentionBuffer,
    pub(crate) receiving: bool,
    pub(crate) sending: bool,
    pub(crate) state: ChannelState,
}

impl Channel {
    pub(crate) fn new(side: Side, remote_addr: SocketAddr) -> Self {
        Self {
            side,
            remote_addr,
            signature: String::new(),
            peer: None,
            retention: RetentionBuffer::with_capacity(RETENTION_CAPACITY),
            receiving: false,
            sending: false,
            state: ChannelState::Created,
        }
    }

    pub(crate) fn is_open(&self) -> bool {
        self.state == ChannelState::Open
    }
}

impl RelayCore {
    /// Starts relaying on a freshly accepted channel.
    pub(crate) fn open_channel(&mut self, id: ChannelId) {
        let port = match self.channels.get(&id) {
            Some(channel) => self.listener(channel.side).port,
            None => return,
        };
        if let Some(channel) = self.channels.get_mut(&id) {
            channel.signature = format!("{}-{}", port, channel.remote_addr);
            channel.state = ChannelState::Open;
        }
        self.log_channel(id, level::CHANNEL, "Channel opened.");
        self.begin_receive(id);

        // The peer may have buffered data while waiting for us
        if let Some(peer) = self.open_peer(id) {
            if self.channels.get(&peer).is_some_and(|p| !p.retention.is_empty()) {
                self.flush_retained(peer);
            }
        }
    }

    /// Processes the completion of a receive on `id`.
    ///
    /// An empty chunk means the remote closed its side.
    pub fn receive_completed(&mut self, id: ChannelId, result: io::Result<Bytes>) {
        match self.channels.get_mut(&id) {
            Some(channel) if channel.is_open() => channel.receiving = false,
            _ => return,
        }

        let data = match result {
            Ok(data) => data,
            Err(err) => {
                self.disconnected(id, &err);
                return;
            }
        };

        if data.is_empty() {
            self.log_channel(id, level::CONNECTION, "Channel disconnected by remote.");
            self.close_channel(id, CloseMode::Graceful);
            return;
        }

        if self.logger.check_level(level::DATA) {
            self.log_channel(id, level::DATA, &format!("Received {} bytes.", data.len()));
        }

        let peer = match self.open_peer(id) {
            Some(peer) => peer,
            None => {
                // No one to deliver to yet: keep reading into the buffer
                self.retain(id, &data);
                self.begin_receive(id);
                return;
            }
        };

        if self.channels.get(&peer).is_some_and(|p| p.sending) {
            // Peer is still writing; its send completion restarts our receive
            self.retain(id, &data);
            return;
        }

        if self.channels.get(&id).is_some_and(|c| !c.retention.is_empty()) {
            self.retain(id, &data);
            self.flush_retained(id);
            return;
        }

        self.begin_send(peer, data);
    }

    /// Processes the completion of a send on `id`.
    pub fn send_completed(&mut self, id: ChannelId, result: io::Result<()>) {
        match self.channels.get_mut(&id) {
            Some(channel) if channel.is_open() => channel.sending = false,
            _ => return,
        }

        if let Err(err) = result {
            self.disconnected(id, &err);
            return;
        }

        let Some(peer) = self.open_peer(id) else {
            return;
        };

        let (peer_has_data, peer_receiving) = match self.channels.get(&peer) {
            Some(p) => (!p.retention.is_empty(), p.receiving),
            None => return,
        };
        if peer_has_data {
            self.flush_retained(peer);
        } else if !peer_receiving {
            self.begin_receive(peer);
        }
    }

    /// Closes `id` and, if still open, its peer.
    pub(crate) fn close_channel(&mut self, id: ChannelId, mode: CloseMode) {
        if !self.channels.contains_key(&id) {
            return;
        }
        self.log_channel(id, level::CHANNEL, "Closing channel.");

        let Some(channel) = self.channels.remove(&id) else {
            return;
        };
        self.deregister(channel.side, id);
        self.push_action(Action::Close(id, mode));

        if let Some(peer) = channel.peer {
            if self.channels.get(&peer).is_some_and(Channel::is_open) {
                self.close_channel(peer, mode);
            }
        }
    }

    fn disconnected(&mut self, id: ChannelId, err: &io::Error) {
        if !self.channels.get(&id).is_some_and(Channel::is_open) {
            return;
        }
        match DisconnectCause::classify(err) {
            DisconnectCause::Normal => self.log_channel(
                id,
                level::CONNECTION,
                &format!("Channel disconnected, error={:?}.", err.kind()),
            ),
            DisconnectCause::Abnormal => self.log_channel_error(
                id,
                level::ABNORMAL,
                &format!("Abnormal channel disconnection, error={:?}: ", err.kind()),
                err,
            ),
            DisconnectCause::Unclassified => self.log_channel_error(
                id,
                level::FATAL,
                "Fatal error during channel i/o: ",
                err,
            ),
        }
        self.close_channel(id, CloseMode::Graceful);
    }

    fn retain(&mut self, id: ChannelId, data: &[u8]) {
        if self.logger.check_level(level::DATA) {
            self.log_channel(id, level::DATA, &format!("Queueing {} bytes.", data.len()));
        }
        let Some(channel) = self.channels.get_mut(&id) else {
            return;
        };
        if let Retained::Overflow {
            discarded,
            chunk_dropped,
        } = channel.retention.push(data)
        {
            let message = if chunk_dropped {
                format!(
                    "RX queue overflow, dropped {} queued and {} received bytes.",
                    discarded,
                    data.len()
                )
            } else {
                format!("RX queue overflow, dropped {} queued bytes.", discarded)
            };
            self.log_channel(id, level::OVERFLOW, &message);
        }
    }

    /// Sends everything retained on `id` to its peer as one write.
    fn flush_retained(&mut self, id: ChannelId) {
        let (data, peer) = match self.channels.get_mut(&id) {
            Some(channel) => (channel.retention.take(), channel.peer),
            None => return,
        };
        match peer {
            Some(peer) if !data.is_empty() => self.begin_send(peer, data),
            // An oversized chunk emptied the buffer; nothing left to forward
            Some(_) => self.begin_receive(id),
            None => {}
        }
    }

    fn begin_receive(&mut self, id: ChannelId) {
        match self.channels.get_mut(&id) {
            Some(channel) if channel.is_open() && !channel.receiving => {
                channel.receiving = true;
            }
            _ => return,
        }
        self.push_action(Action::Receive(id));
    }

    fn begin_send(&mut self, id: ChannelId, data: Bytes) {
        match self.channels.get_mut(&id) {
            Some(channel) if channel.is_open() => {
                debug_assert!(!channel.sending, "send already in flight on {}", id);
                channel.sending = true;
            }
            _ => return,
        }
        if self.logger.check_level(level::DATA) {
            self.log_channel(id, level::DATA, &format!("Sending {} bytes.", data.len()));
        }
        self.push_action(Action::Send(id, data));
    }

    fn open_peer(&self, id: ChannelId) -> Option<ChannelId> {
        let peer = self.channels.get(&id)?.peer?;
        self.channels
            .get(&peer)
            .filter(|p| p.is_open())
            .map(|_| peer)
    }

    fn channel_prefix(&self, id: ChannelId) -> String {
        let Some(channel) = self.channels.get(&id) else {
            return format!("Channel {}: ", id);
        };
        let peer = channel
            .peer
            .and_then(|peer| self.channels.get(&peer))
            .map(|p| p.signature.as_str())
            .unwrap_or("none");
        format!("Channel {} (peer: {}): ", channel.signature, peer)
    }

    fn log_channel(&self, id: ChannelId, lvl: u8, message: &str) {
        if self.logger.check_level(lvl) {
            self.logger
                .log(lvl, &format!("{}{}", self.channel_prefix(id), message));
        }
    }

    fn log_channel_error(&self, id: ChannelId, lvl: u8, message: &str, err: &io::Error) {
        if self.logger.check_level(lvl) {
            self.logger
                .log_error(lvl, &format!("{}{}", self.channel_prefix(id), message), err);
        }
    }
}

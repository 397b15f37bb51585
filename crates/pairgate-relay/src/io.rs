//! Socket drivers for one channel
//!
//! The read half and the write half of an accepted socket are each owned by
//! a task. The tasks perform exactly the operations the relay state machine
//! asks for and report every completion back to it.

use crate::channel::{ChannelId, CloseMode, RECEIVE_CHUNK_SIZE};
use crate::relay::Relay;
use bytes::Bytes;
use socket2::SockRef;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tracing::trace;

/// Upper bound on flushing queued writes before the FIN of a graceful close
const GRACEFUL_CLOSE_TIMEOUT: Duration = Duration::from_secs(10);

/// Handles used to drive one channel's socket tasks
pub(crate) struct ChannelIo {
    receive_tx: mpsc::UnboundedSender<()>,
    send_tx: mpsc::UnboundedSender<Bytes>,
    close_tx: watch::Sender<Option<CloseMode>>,
}

impl ChannelIo {
    /// Splits `stream` and spawns its read and write tasks.
    pub(crate) fn spawn(id: ChannelId, stream: TcpStream, relay: Arc<Relay>) -> Self {
        let (reader, writer) = stream.into_split();
        let (receive_tx, receive_rx) = mpsc::unbounded_channel();
        let (send_tx, send_rx) = mpsc::unbounded_channel();
        let (close_tx, close_rx) = watch::channel(None);

        tokio::spawn(receive_task(
            id,
            reader,
            receive_rx,
            close_rx.clone(),
            relay.clone(),
        ));
        tokio::spawn(send_task(id, writer, send_rx, close_rx, relay));

        Self {
            receive_tx,
            send_tx,
            close_tx,
        }
    }

    pub(crate) fn receive(&self) {
        let _ = self.receive_tx.send(());
    }

    pub(crate) fn send(&self, data: Bytes) {
        let _ = self.send_tx.send(data);
    }

    pub(crate) fn close(self, mode: CloseMode) {
        let _ = self.close_tx.send(Some(mode));
    }
}

/// Resolves once the channel is closed. A dropped handle counts as a
/// graceful close.
async fn closed(close_rx: &mut watch::Receiver<Option<CloseMode>>) -> CloseMode {
    match close_rx.wait_for(Option::is_some).await {
        Ok(mode) => (*mode).unwrap_or(CloseMode::Graceful),
        Err(_) => CloseMode::Graceful,
    }
}

/// Mode of a close that has already been signalled, if any.
fn close_mode(close_rx: &watch::Receiver<Option<CloseMode>>) -> CloseMode {
    (*close_rx.borrow()).unwrap_or(CloseMode::Graceful)
}

async fn receive_task(
    id: ChannelId,
    mut reader: OwnedReadHalf,
    mut requests: mpsc::UnboundedReceiver<()>,
    mut close_rx: watch::Receiver<Option<CloseMode>>,
    relay: Arc<Relay>,
) {
    let mut buffer = vec![0u8; RECEIVE_CHUNK_SIZE];
    let mode = loop {
        tokio::select! {
            mode = closed(&mut close_rx) => break mode,
            request = requests.recv() => {
                if request.is_none() {
                    break close_mode(&close_rx);
                }
            }
        }

        let result = tokio::select! {
            mode = closed(&mut close_rx) => break mode,
            result = reader.read(&mut buffer) => result,
        };
        relay.receive_completed(id, result.map(|n| Bytes::copy_from_slice(&buffer[..n])));
    };

    if mode == CloseMode::Abort {
        reset_on_close(SockRef::from(reader.as_ref()));
    }
    trace!("Receive task for channel {} finished", id);
}

async fn send_task(
    id: ChannelId,
    mut writer: OwnedWriteHalf,
    mut requests: mpsc::UnboundedReceiver<Bytes>,
    mut close_rx: watch::Receiver<Option<CloseMode>>,
    relay: Arc<Relay>,
) {
    let mode = loop {
        // Writes issued before a close take priority over it
        let data = tokio::select! {
            biased;
            data = requests.recv() => match data {
                Some(data) => data,
                None => break close_mode(&close_rx),
            },
            mode = closed(&mut close_rx) => break mode,
        };

        // Only an abort cuts an in-flight write short
        let result = tokio::select! {
            biased;
            result = writer.write_all(&data) => result,
            _ = aborted(&mut close_rx) => break CloseMode::Abort,
        };
        relay.send_completed(id, result);
    };

    match mode {
        CloseMode::Graceful => {
            let drained = async {
                while let Ok(data) = requests.try_recv() {
                    writer.write_all(&data).await?;
                }
                writer.shutdown().await
            };
            if timeout(GRACEFUL_CLOSE_TIMEOUT, drained).await.is_err() {
                trace!("Graceful close of channel {} timed out", id);
            }
        }
        CloseMode::Abort => {
            reset_on_close(SockRef::from(writer.as_ref()));
            // Skip the FIN that dropping the write half would send
            writer.forget();
        }
    }
    trace!("Send task for channel {} finished", id);
}

/// Resolves once the channel is aborted. Never resolves for a graceful close.
async fn aborted(close_rx: &mut watch::Receiver<Option<CloseMode>>) {
    if close_rx
        .wait_for(|mode| *mode == Some(CloseMode::Abort))
        .await
        .is_err()
    {
        std::future::pending::<()>().await;
    }
}

/// Makes the final close of the socket send a reset instead of a FIN.
fn reset_on_close(socket: SockRef<'_>) {
    let _ = socket.set_linger(Some(Duration::ZERO));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logger::TracingLogger;
    use tokio::net::TcpListener;

    const WAIT: Duration = Duration::from_secs(5);

    /// Returns the accepted end and the connecting end of a loopback connection.
    async fn loopback() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap())
            .await
            .unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (server, client)
    }

    fn spawn_io(stream: TcpStream) -> ChannelIo {
        let relay = Arc::new(Relay::new([0, 0], Arc::new(TracingLogger::default())));
        ChannelIo::spawn(ChannelId(1), stream, relay)
    }

    #[tokio::test]
    async fn test_graceful_close_delivers_queued_sends() {
        let (server, mut client) = loopback().await;
        let io = spawn_io(server);

        io.send(Bytes::from_static(b"payload "));
        io.send(Bytes::from_static(b"and more"));
        io.close(CloseMode::Graceful);

        let mut received = Vec::new();
        timeout(WAIT, client.read_to_end(&mut received))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received, b"payload and more");
    }

    #[tokio::test]
    async fn test_graceful_close_finishes_write_in_flight() {
        let (server, mut client) = loopback().await;
        let io = spawn_io(server);

        // Far more than the socket buffers hold, so the write is still
        // pending when the close arrives
        let payload: Vec<u8> = (0..16 * 1024 * 1024).map(|i| (i % 253) as u8).collect();
        io.send(Bytes::from(payload.clone()));
        tokio::time::sleep(Duration::from_millis(50)).await;
        io.close(CloseMode::Graceful);

        let mut received = Vec::new();
        timeout(WAIT, client.read_to_end(&mut received))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received.len(), payload.len());
        assert!(received == payload);
    }

    #[tokio::test]
    async fn test_abort_resets_connection() {
        let (server, mut client) = loopback().await;
        let io = spawn_io(server);
        io.close(CloseMode::Abort);

        let mut buf = [0u8; 16];
        let result = timeout(WAIT, client.read(&mut buf)).await.unwrap();
        assert_eq!(
            result.map_err(|e| e.kind()).unwrap_err(),
            std::io::ErrorKind::ConnectionReset
        );
    }
}

//! Typed, framed peer connections.
//!
//! Each connection owns one reader task that decodes frames into
//! [`Message`]s and delivers `Result<Message, Error>` over a single
//! bounded channel: data and errors arrive in order on the same queue,
//! and a slow consumer exerts TCP backpressure instead of buffering
//! without bound. Writes are serialized by a per-connection mutex;
//! broadcasts mark any peer whose write fails.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::codec::frame::{self, MAX_FRAME};
use crate::message::Message;

pub mod udp;

/// Default bound on queued inbound messages per connection.
pub const INBOX_CAPACITY: usize = 32;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("frame: {0}")]
    Frame(#[from] frame::Error),
    #[error("codec: {0}")]
    Codec(#[from] crate::codec::Error),
    #[error("connection closed")]
    Closed,
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("read timed out")]
    Timeout,
}

type BoxedStream = Box<dyn AsyncRead + Send + Unpin>;
type BoxedSink = Box<dyn AsyncWrite + Send + Unpin>;

/// The write half of a connection; cheap to clone, writes are serialized.
#[derive(Clone)]
pub struct Sender {
    sink: Arc<Mutex<BoxedSink>>,
}

impl Sender {
    /// Sends one message, holding the write lock for the whole frame so
    /// concurrent sends never interleave.
    pub async fn send(&self, message: &Message) -> Result<(), Error> {
        let payload = message.encode_payload();
        let mut sink = self.sink.lock().await;
        frame::send_frame(&mut *sink, message.tag(), &payload, MAX_FRAME).await?;
        Ok(())
    }
}

/// A framed, typed peer connection.
pub struct Connection {
    pub sender: Sender,
    inbox: mpsc::Receiver<Result<Message, Error>>,
    reader: JoinHandle<()>,
}

impl Connection {
    /// Wraps a duplex byte stream, spawning the reader task.
    pub fn open<S>(stream: S, inbox_capacity: usize) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        Self::from_halves(Box::new(read_half), Box::new(write_half), inbox_capacity)
    }

    fn from_halves(
        mut stream: BoxedStream,
        sink: BoxedSink,
        inbox_capacity: usize,
    ) -> Self {
        let (inbox_tx, inbox_rx) = mpsc::channel(inbox_capacity);
        let reader = tokio::spawn(async move {
            loop {
                let result = read_message(&mut stream).await;
                let failed = result.is_err();
                if inbox_tx.send(result).await.is_err() {
                    // Receiver dropped; nothing left to deliver to.
                    break;
                }
                if failed {
                    break;
                }
            }
        });
        Self {
            sender: Sender {
                sink: Arc::new(Mutex::new(sink)),
            },
            inbox: inbox_rx,
            reader,
        }
    }

    /// Receives the next inbound message.
    pub async fn recv(&mut self) -> Result<Message, Error> {
        self.inbox.recv().await.unwrap_or(Err(Error::Closed))
    }

    /// Receives with a deadline.
    pub async fn recv_timeout(&mut self, timeout: Duration) -> Result<Message, Error> {
        match tokio::time::timeout(timeout, self.recv()).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout),
        }
    }

    /// Drains any already-queued messages, discarding them. Used at setup
    /// boundaries to flush stale frames from a previous epoch.
    pub fn drain(&mut self) {
        while self.inbox.try_recv().is_ok() {}
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

async fn read_message(stream: &mut BoxedStream) -> Result<Message, Error> {
    let (message_type, mut payload) = frame::recv_frame(stream, MAX_FRAME).await?;
    let message = Message::decode_payload(message_type, &mut payload)?;
    Ok(message)
}

/// Dials `addr`, retrying with a fixed delay.
pub async fn connect_with_retry(
    addr: &str,
    attempts: usize,
    delay: Duration,
) -> Result<TcpStream, Error> {
    let mut last = None;
    for attempt in 0..attempts {
        match TcpStream::connect(addr).await {
            Ok(stream) => {
                stream.set_nodelay(true).ok();
                return Ok(stream);
            }
            Err(e) => {
                debug!(addr, attempt, error = %e, "connect failed, retrying");
                last = Some(e);
                tokio::time::sleep(delay).await;
            }
        }
    }
    Err(Error::Io(last.unwrap_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::TimedOut, "no attempts made")
    })))
}

/// Binds a listener and spawns an accept loop that forwards new sockets.
pub async fn spawn_listener(
    port: &str,
    connections: mpsc::Sender<(TcpStream, std::net::SocketAddr)>,
) -> Result<(std::net::SocketAddr, JoinHandle<()>), Error> {
    let bind_addr = if port.starts_with(':') {
        format!("0.0.0.0{port}")
    } else {
        port.to_string()
    };
    let listener = TcpListener::bind(&bind_addr).await?;
    let local = listener.local_addr()?;
    let handle = tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    stream.set_nodelay(true).ok();
                    if connections.send((stream, peer)).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!(error = %e, "accept failed");
                }
            }
        }
    });
    Ok((local, handle))
}

/// Sends `message` to every peer concurrently, returning the indexes
/// whose write failed so the caller can mark them disconnected.
pub async fn broadcast(senders: &[Sender], message: &Message) -> Vec<usize> {
    let sends = senders.iter().map(|sender| sender.send(message));
    futures::future::join_all(sends)
        .await
        .into_iter()
        .enumerate()
        .filter_map(|(index, result)| match result {
            Ok(()) => None,
            Err(e) => {
                warn!(peer = index, error = %e, "broadcast write failed");
                Some(index)
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Downstream, Message};

    #[tokio::test]
    async fn test_connection_round_trip() {
        let (a, b) = tokio::io::duplex(4096);
        let conn_a = Connection::open(a, INBOX_CAPACITY);
        let mut conn_b = Connection::open(b, INBOX_CAPACITY);

        let message = Message::Downstream(Downstream {
            round: 1,
            ownership_id: 0,
            flag_resync: false,
            flag_open_closed: false,
            data: vec![9, 9, 9],
        });
        conn_a.sender.send(&message).await.unwrap();
        assert_eq!(conn_b.recv().await.unwrap(), message);
    }

    #[tokio::test]
    async fn test_recv_timeout() {
        let (a, b) = tokio::io::duplex(4096);
        let _conn_a = Connection::open(a, INBOX_CAPACITY);
        let mut conn_b = Connection::open(b, INBOX_CAPACITY);
        let result = conn_b.recv_timeout(Duration::from_millis(20)).await;
        assert!(matches!(result, Err(Error::Timeout)));
    }

    #[tokio::test]
    async fn test_peer_close_surfaces_error() {
        let (a, b) = tokio::io::duplex(4096);
        let conn_a = Connection::open(a, INBOX_CAPACITY);
        let mut conn_b = Connection::open(b, INBOX_CAPACITY);
        drop(conn_a);
        assert!(conn_b.recv().await.is_err());
    }

    #[tokio::test]
    async fn test_in_order_delivery() {
        let (a, b) = tokio::io::duplex(4096);
        let conn_a = Connection::open(a, INBOX_CAPACITY);
        let mut conn_b = Connection::open(b, INBOX_CAPACITY);
        for round in 0..10u32 {
            conn_a
                .sender
                .send(&Message::RateChange { round })
                .await
                .unwrap();
        }
        for round in 0..10u32 {
            assert_eq!(conn_b.recv().await.unwrap(), Message::RateChange { round });
        }
    }

    #[tokio::test]
    async fn test_drain_discards_queued() {
        let (a, b) = tokio::io::duplex(4096);
        let conn_a = Connection::open(a, INBOX_CAPACITY);
        let mut conn_b = Connection::open(b, INBOX_CAPACITY);
        conn_a
            .sender
            .send(&Message::RateChange { round: 1 })
            .await
            .unwrap();
        // Let the reader task deliver it.
        tokio::time::sleep(Duration::from_millis(20)).await;
        conn_b.drain();
        let result = conn_b.recv_timeout(Duration::from_millis(20)).await;
        assert!(matches!(result, Err(Error::Timeout)));
    }
}

//! Shared helpers for FluxShare integration tests.

use async_trait::async_trait;
use flux_core::TransferEvent;
use flux_files::{ChunkSource, MemorySource, SourceInfo};
use flux_signaling::{ClientMessage, RelayConfig, RelayHandle, RelayServer, ServerMessage};
use futures_util::{SinkExt, StreamExt};
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

/// Upper bound for any single wait in these tests.
pub const TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Relay on an ephemeral localhost port with default timings.
pub async fn start_relay() -> RelayHandle {
    start_relay_with(Duration::from_secs(30), Duration::from_secs(10)).await
}

/// Relay on an ephemeral localhost port with custom heartbeat timings.
pub async fn start_relay_with(heartbeat_timeout: Duration, sweep_interval: Duration) -> RelayHandle {
    let config = RelayConfig {
        bind_addr: "127.0.0.1:0".parse().unwrap(),
        heartbeat_timeout,
        sweep_interval,
    };
    RelayServer::bind(config).await.unwrap().spawn()
}

/// Deterministic test payload.
pub fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 % 253) as u8).collect()
}

/// Next item from `rx`, panicking after [`TEST_TIMEOUT`].
pub async fn recv_within<T>(rx: &mut UnboundedReceiver<T>) -> T {
    timeout(TEST_TIMEOUT, rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event channel closed")
}

/// Skip transfer events until a terminal one arrives.
pub async fn terminal_event(rx: &mut UnboundedReceiver<TransferEvent>) -> TransferEvent {
    loop {
        let event = recv_within(rx).await;
        if event.is_terminal() {
            return event;
        }
    }
}

/// Source that sleeps before every read, so a transfer stays in flight long
/// enough to interrupt.
pub struct SlowSource {
    inner: MemorySource,
    delay: Duration,
    disposed: Arc<AtomicBool>,
}

impl SlowSource {
    /// Wrap `len` bytes of [`payload`]. The flag flips on dispose.
    pub fn new(name: &str, len: usize, delay: Duration) -> (Self, Arc<AtomicBool>) {
        let disposed = Arc::new(AtomicBool::new(false));
        let source = Self {
            inner: MemorySource::new(name, payload(len)),
            delay,
            disposed: Arc::clone(&disposed),
        };
        (source, disposed)
    }
}

#[async_trait]
impl ChunkSource for SlowSource {
    fn info(&self) -> &SourceInfo {
        self.inner.info()
    }

    async fn read_chunk(&mut self, offset: u64, len: usize) -> io::Result<Vec<u8>> {
        tokio::time::sleep(self.delay).await;
        self.inner.read_chunk(offset, len).await
    }

    async fn dispose(&mut self) -> io::Result<()> {
        self.disposed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Hand-driven relay client speaking raw JSON frames.
pub struct RawClient {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl RawClient {
    /// Open a socket to `url`.
    pub async fn connect(url: &str) -> Self {
        let (ws, _) = timeout(TEST_TIMEOUT, connect_async(url))
            .await
            .expect("connect timed out")
            .expect("connect failed");
        Self { ws }
    }

    /// Open a socket and join `room` as `peer_id`.
    pub async fn join(url: &str, room: &str, peer_id: &str) -> Self {
        let mut client = Self::connect(url).await;
        client
            .send(&ClientMessage::Join {
                room: room.to_string(),
                peer_id: peer_id.to_string(),
                display_name: format!("{peer_id}-name"),
            })
            .await;
        client
    }

    /// Send a protocol message.
    pub async fn send(&mut self, message: &ClientMessage) {
        self.send_text(message.to_json().unwrap()).await;
    }

    /// Send an arbitrary text frame.
    pub async fn send_text(&mut self, text: String) {
        self.ws.send(Message::Text(text)).await.unwrap();
    }

    /// Send a binary frame.
    pub async fn send_binary(&mut self, data: Vec<u8>) {
        self.ws.send(Message::Binary(data)).await.unwrap();
    }

    /// Next relay message, or `None` if nothing arrives within `wait`.
    ///
    /// Panics if the socket closes.
    pub async fn next_within(&mut self, wait: Duration) -> Option<ServerMessage> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            match tokio::time::timeout_at(deadline, self.ws.next()).await {
                Err(_) => return None,
                Ok(Some(Ok(Message::Text(text)))) => {
                    return Some(serde_json::from_str(&text).expect("malformed relay frame"));
                }
                Ok(Some(Ok(Message::Close(_)))) | Ok(None) => panic!("relay closed the socket"),
                Ok(Some(Ok(_))) => continue,
                Ok(Some(Err(e))) => panic!("socket error: {e}"),
            }
        }
    }

    /// Next relay message.
    pub async fn next(&mut self) -> ServerMessage {
        self.next_within(TEST_TIMEOUT)
            .await
            .expect("timed out waiting for relay message")
    }

    /// Skip messages until `pick` returns something.
    pub async fn next_matching<T>(&mut self, mut pick: impl FnMut(ServerMessage) -> Option<T>) -> T {
        loop {
            if let Some(found) = pick(self.next().await) {
                return found;
            }
        }
    }

    /// Wait for the relay to close this socket, ignoring other frames.
    pub async fn expect_closed(&mut self) {
        let closed = timeout(TEST_TIMEOUT, async {
            loop {
                match self.ws.next().await {
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => return,
                    Some(Ok(_)) => continue,
                }
            }
        })
        .await;
        assert!(closed.is_ok(), "socket was not closed");
    }

    /// Close the socket.
    pub async fn close(mut self) {
        let _ = self.ws.close(None).await;
    }
}

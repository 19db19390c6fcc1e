//! Direct TCP transport with encrypted, length-prefixed framing.
//!
//! The offering peer listens; its listening addresses are published as
//! connectivity candidates. The answering peer dials the candidates, sends the
//! 16-byte handshake token in clear so the listener can route the socket to
//! the right pending offer, then both sides exchange an encrypted hello.
//!
//! # Framing Protocol
//!
//! ```text
//! +------------------+---------------------------------------------+
//! | Length (4 bytes) | ChaCha20-Poly1305( kind (1 byte) | payload ) |
//! +------------------+---------------------------------------------+
//! ```
//!
//! `kind` is 0 for text frames, 1 for binary frames and 2 for the handshake
//! hello.

use crate::secure::{KeyPair, RecvCipher, Role, SendCipher, SessionKeys, TAG_LEN};
use crate::stream::{self, Frame, StreamConfig, StreamIo};
use crate::transport::{
    PeerTransport, TransportConnection, TransportError, TransportEvent, TransportEventSender,
    TransportResult, TransportState,
};
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};

/// Maximum encrypted frame size (16 MiB plus framing overhead).
const MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024 + 1 + TAG_LEN as u32;

/// Time allowed for a dialled socket to present its token.
const ROUTE_TIMEOUT: Duration = Duration::from_secs(5);

/// Time allowed for the whole handshake once descriptions are exchanged.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Time allowed for a single dial attempt.
const DIAL_TIMEOUT: Duration = Duration::from_secs(3);

const TOKEN_LEN: usize = 16;
const KIND_TEXT: u8 = 0;
const KIND_BINARY: u8 = 1;
const KIND_HELLO: u8 = 2;
const HELLO: &[u8] = b"fluxshare-hello";

type Token = [u8; TOKEN_LEN];
type PendingSockets = Arc<DashMap<Token, oneshot::Sender<TcpStream>>>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
enum Description {
    #[serde(rename_all = "camelCase")]
    TcpOffer {
        token: String,
        public_key: String,
        label: String,
    },
    #[serde(rename_all = "camelCase")]
    TcpAnswer { token: String, public_key: String },
}

fn decode_fixed<const N: usize>(hex_str: &str, what: &str) -> TransportResult<[u8; N]> {
    let bytes = hex::decode(hex_str)
        .map_err(|e| TransportError::InvalidDescription(format!("{what}: {e}")))?;
    bytes
        .try_into()
        .map_err(|_| TransportError::InvalidDescription(format!("{what}: expected {N} bytes")))
}

/// TCP transport: listens for answerers and dials offerers.
///
/// # Examples
///
/// ```no_run
/// use flux_transport::tcp::TcpTransport;
/// use std::net::SocketAddr;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let addr: SocketAddr = "0.0.0.0:0".parse()?;
/// let transport = TcpTransport::bind(addr).await?;
/// println!("Direct transfers on {}", transport.local_addr());
/// # Ok(())
/// # }
/// ```
pub struct TcpTransport {
    local_addr: SocketAddr,
    advertised: Vec<SocketAddr>,
    pending: PendingSockets,
    stream_config: StreamConfig,
    accept_task: JoinHandle<()>,
}

impl TcpTransport {
    /// Bind a listener on `addr`.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::Io` if the listener cannot be created.
    pub async fn bind<A: Into<SocketAddr>>(addr: A) -> TransportResult<Self> {
        let listener = TcpListener::bind(addr.into()).await?;
        let local_addr = listener.local_addr()?;
        let pending: PendingSockets = Arc::new(DashMap::new());
        let accept_task = tokio::spawn(accept_loop(listener, Arc::clone(&pending)));

        let advertised = if local_addr.ip().is_unspecified() {
            vec![SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), local_addr.port())]
        } else {
            vec![local_addr]
        };
        info!("Direct TCP transport listening on {}", local_addr);

        Ok(Self {
            local_addr,
            advertised,
            pending,
            stream_config: StreamConfig::default(),
            accept_task,
        })
    }

    /// Replace the addresses published as candidates (e.g. LAN addresses when
    /// bound to a wildcard address).
    #[must_use]
    pub fn with_advertised_addrs(mut self, addrs: Vec<SocketAddr>) -> Self {
        if !addrs.is_empty() {
            self.advertised = addrs;
        }
        self
    }

    /// Use `config` for streams created by this transport.
    #[must_use]
    pub fn with_stream_config(mut self, config: StreamConfig) -> Self {
        self.stream_config = config;
        self
    }

    /// Bound listener address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Addresses published as candidates.
    pub fn advertised_addrs(&self) -> &[SocketAddr] {
        &self.advertised
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

async fn accept_loop(listener: TcpListener, pending: PendingSockets) {
    loop {
        match listener.accept().await {
            Ok((socket, peer)) => {
                trace!("Accepted TCP connection from {}", peer);
                tokio::spawn(route_socket(socket, peer, Arc::clone(&pending)));
            }
            Err(e) => {
                warn!("TCP accept failed: {}", e);
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

async fn route_socket(mut socket: TcpStream, peer: SocketAddr, pending: PendingSockets) {
    let mut token = [0u8; TOKEN_LEN];
    match timeout(ROUTE_TIMEOUT, socket.read_exact(&mut token)).await {
        Ok(Ok(_)) => {}
        _ => {
            debug!("Dropping {}: no handshake token", peer);
            return;
        }
    }
    match pending.remove(&token) {
        Some((_, tx)) => {
            let _ = tx.send(socket);
        }
        None => debug!("Dropping {}: unknown handshake token", peer),
    }
}

#[async_trait]
impl PeerTransport for TcpTransport {
    async fn create_connection(
        &self,
        peer_id: &str,
        events: TransportEventSender,
    ) -> TransportResult<Box<dyn TransportConnection>> {
        let (shutdown, _) = watch::channel(false);
        Ok(Box::new(TcpConnection {
            remote: peer_id.to_string(),
            events,
            pending: Arc::clone(&self.pending),
            advertised: self.advertised.clone(),
            stream_config: self.stream_config,
            label: "data".to_string(),
            role: None,
            keys: None,
            token: None,
            remote_public: None,
            socket_rx: None,
            dial_tx: None,
            pending_candidates: Vec::new(),
            shutdown,
            task: None,
        }))
    }
}

struct TcpConnection {
    remote: String,
    events: TransportEventSender,
    pending: PendingSockets,
    advertised: Vec<SocketAddr>,
    stream_config: StreamConfig,
    label: String,
    role: Option<Role>,
    keys: Option<KeyPair>,
    token: Option<Token>,
    remote_public: Option<[u8; 32]>,
    socket_rx: Option<oneshot::Receiver<TcpStream>>,
    dial_tx: Option<mpsc::UnboundedSender<SocketAddr>>,
    pending_candidates: Vec<String>,
    shutdown: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

/// Everything a connection task needs after the handshake descriptions are
/// exchanged.
struct Session {
    remote: String,
    label: String,
    keys: SessionKeys,
    stream_config: StreamConfig,
    events: Emitter,
}

/// Event sender that goes quiet once the connection is shut down locally.
#[derive(Clone)]
struct Emitter {
    events: TransportEventSender,
    shutdown: watch::Receiver<bool>,
}

impl Emitter {
    fn emit(&self, event: TransportEvent) {
        if !*self.shutdown.borrow() {
            let _ = self.events.send(event);
        }
    }

    async fn shutdown(&mut self) {
        let _ = self.shutdown.wait_for(|s| *s).await;
    }
}

impl TcpConnection {
    fn emitter(&self) -> Emitter {
        Emitter {
            events: self.events.clone(),
            shutdown: self.shutdown.subscribe(),
        }
    }

    fn emit(&self, event: TransportEvent) {
        self.emitter().emit(event);
    }

    fn dial(&mut self, candidate: &str) {
        let Some(tx) = &self.dial_tx else {
            self.pending_candidates.push(candidate.to_string());
            return;
        };
        match candidate.parse::<SocketAddr>() {
            Ok(addr) => {
                let _ = tx.send(addr);
            }
            Err(_) => debug!("Ignoring non-TCP candidate from {}: {}", self.remote, candidate),
        }
    }
}

#[async_trait]
impl TransportConnection for TcpConnection {
    fn create_data_stream(&mut self, label: &str) -> TransportResult<()> {
        self.label = label.to_string();
        Ok(())
    }

    async fn create_offer(&mut self) -> TransportResult<String> {
        let keys = KeyPair::generate();
        let token: Token = rand::random();
        let (tx, rx) = oneshot::channel();
        self.pending.insert(token, tx);

        let description = Description::TcpOffer {
            token: hex::encode(token),
            public_key: hex::encode(keys.public_bytes()),
            label: self.label.clone(),
        };
        self.role = Some(Role::Offerer);
        self.keys = Some(keys);
        self.token = Some(token);
        self.socket_rx = Some(rx);

        self.emit(TransportEvent::StateChanged(TransportState::Connecting));
        for addr in &self.advertised {
            self.emit(TransportEvent::LocalCandidate(addr.to_string()));
        }
        serde_json::to_string(&description).map_err(|e| TransportError::Other(e.to_string()))
    }

    async fn create_answer(&mut self) -> TransportResult<String> {
        let (Some(token), Some(remote_public)) = (self.token, self.remote_public) else {
            return Err(TransportError::NoRemoteDescription);
        };
        let keys = KeyPair::generate();
        let session_keys = keys.session(remote_public, &token, Role::Answerer)?;
        let description = Description::TcpAnswer {
            token: hex::encode(token),
            public_key: hex::encode(keys.public_bytes()),
        };

        let (dial_tx, dial_rx) = mpsc::unbounded_channel();
        self.dial_tx = Some(dial_tx);
        for candidate in std::mem::take(&mut self.pending_candidates) {
            self.dial(&candidate);
        }

        let session = Session {
            remote: self.remote.clone(),
            label: self.label.clone(),
            keys: session_keys,
            stream_config: self.stream_config,
            events: self.emitter(),
        };
        self.task = Some(tokio::spawn(answerer_task(session, token, dial_rx)));
        serde_json::to_string(&description).map_err(|e| TransportError::Other(e.to_string()))
    }

    async fn set_remote_description(&mut self, description: &str) -> TransportResult<()> {
        let parsed: Description = serde_json::from_str(description)
            .map_err(|e| TransportError::InvalidDescription(e.to_string()))?;
        match parsed {
            Description::TcpOffer {
                token,
                public_key,
                label,
            } => {
                self.token = Some(decode_fixed(&token, "token")?);
                self.remote_public = Some(decode_fixed(&public_key, "public key")?);
                self.label = label;
                self.role = Some(Role::Answerer);
                self.emit(TransportEvent::StateChanged(TransportState::Connecting));
            }
            Description::TcpAnswer { token, public_key } => {
                let token: Token = decode_fixed(&token, "token")?;
                if self.role != Some(Role::Offerer) || self.token != Some(token) {
                    return Err(TransportError::InvalidDescription(
                        "answer does not match the local offer".to_string(),
                    ));
                }
                let remote_public = decode_fixed(&public_key, "public key")?;
                let keys = self
                    .keys
                    .as_ref()
                    .ok_or(TransportError::NoRemoteDescription)?
                    .session(remote_public, &token, Role::Offerer)?;
                let socket_rx = self.socket_rx.take().ok_or_else(|| {
                    TransportError::InvalidDescription("answer already applied".to_string())
                })?;
                self.remote_public = Some(remote_public);

                let session = Session {
                    remote: self.remote.clone(),
                    label: self.label.clone(),
                    keys,
                    stream_config: self.stream_config,
                    events: self.emitter(),
                };
                self.task = Some(tokio::spawn(offerer_task(session, socket_rx)));
            }
        }
        Ok(())
    }

    async fn add_candidate(&mut self, candidate: &str) -> TransportResult<()> {
        match self.role {
            Some(Role::Offerer) => {
                trace!("Offerer ignores candidate from {}: {}", self.remote, candidate);
            }
            _ => self.dial(candidate),
        }
        Ok(())
    }

    async fn close(&mut self) {
        self.shutdown.send_replace(true);
        if let Some(token) = self.token.take() {
            self.pending.remove(&token);
        }
        self.dial_tx = None;
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn offerer_task(mut session: Session, socket_rx: oneshot::Receiver<TcpStream>) {
    let mut shutdown = session.events.clone();
    let result = tokio::select! {
        _ = shutdown.shutdown() => return,
        result = timeout(HANDSHAKE_TIMEOUT, async {
            let mut socket = socket_rx.await.map_err(|_| TransportError::Closed)?;
            let (kind, payload) = read_frame(&mut socket, session.keys.recv_half()).await?;
            if kind != KIND_HELLO || payload != HELLO {
                return Err(TransportError::Handshake("unexpected hello".to_string()));
            }
            write_frame(&mut socket, session.keys.send_half(), KIND_HELLO, HELLO).await?;
            Ok::<_, TransportError>(socket)
        }) => result,
    };
    match result {
        Ok(Ok(socket)) => run_session(session, socket).await,
        Ok(Err(e)) => {
            warn!("Handshake with {} failed: {}", session.remote, e);
            session.events.emit(TransportEvent::StateChanged(TransportState::Failed));
        }
        Err(_) => {
            warn!("Handshake with {} timed out", session.remote);
            session.events.emit(TransportEvent::StateChanged(TransportState::Failed));
        }
    }
}

async fn answerer_task(
    mut session: Session,
    token: Token,
    mut candidates: mpsc::UnboundedReceiver<SocketAddr>,
) {
    let mut shutdown = session.events.clone();
    let dial = async {
        while let Some(addr) = candidates.recv().await {
            match dial_candidate(addr, &token, &mut session.keys).await {
                Ok(socket) => return Ok(socket),
                Err(e) => debug!("Candidate {} for {} failed: {}", addr, session.remote, e),
            }
        }
        Err(TransportError::Closed)
    };
    let result = tokio::select! {
        _ = shutdown.shutdown() => return,
        result = timeout(HANDSHAKE_TIMEOUT, dial) => result,
    };
    match result {
        Ok(Ok(socket)) => run_session(session, socket).await,
        Ok(Err(e)) => {
            warn!("No usable candidate for {}: {}", session.remote, e);
            session.events.emit(TransportEvent::StateChanged(TransportState::Failed));
        }
        Err(_) => {
            warn!("Dialling {} timed out", session.remote);
            session.events.emit(TransportEvent::StateChanged(TransportState::Failed));
        }
    }
}

async fn dial_candidate(
    addr: SocketAddr,
    token: &Token,
    keys: &mut SessionKeys,
) -> TransportResult<TcpStream> {
    let mut socket = timeout(DIAL_TIMEOUT, TcpStream::connect(addr))
        .await
        .map_err(|_| TransportError::Handshake(format!("dial {addr} timed out")))??;
    socket.set_nodelay(true)?;
    socket.write_all(token).await?;
    write_frame(&mut socket, keys.send_half(), KIND_HELLO, HELLO).await?;
    let (kind, payload) = read_frame(&mut socket, keys.recv_half()).await?;
    if kind != KIND_HELLO || payload != HELLO {
        return Err(TransportError::Handshake("unexpected hello".to_string()));
    }
    Ok(socket)
}

async fn run_session(session: Session, socket: TcpStream) {
    let Session {
        remote,
        label,
        keys,
        stream_config,
        mut events,
    } = session;
    let (stream, io) = stream::channel(label, stream_config);
    events.emit(TransportEvent::StateChanged(TransportState::Connected));
    events.emit(TransportEvent::StreamOpened(stream));
    debug!("Direct stream to {} open", remote);

    let (send, recv) = keys.split();
    let outcome = pump_socket(socket, send, recv, io, &mut events).await;
    match outcome {
        SessionEnd::Shutdown => debug!("Direct stream to {} shut down", remote),
        SessionEnd::LocalClose => {
            debug!("Direct stream to {} closed locally", remote);
            events.emit(TransportEvent::StateChanged(TransportState::Closed));
        }
        SessionEnd::Lost(reason) => {
            info!("Direct stream to {} lost: {}", remote, reason);
            events.emit(TransportEvent::StateChanged(TransportState::Disconnected));
        }
    }
}

enum SessionEnd {
    Shutdown,
    LocalClose,
    Lost(String),
}

async fn pump_socket(
    socket: TcpStream,
    mut send: SendCipher,
    mut recv: RecvCipher,
    mut io: StreamIo,
    events: &mut Emitter,
) -> SessionEnd {
    let (mut rd, mut wr) = socket.into_split();
    let (in_tx, mut in_rx) = mpsc::unbounded_channel();
    let reader = tokio::spawn(async move {
        loop {
            let result = read_frame(&mut rd, &mut recv).await;
            let failed = result.is_err();
            if in_tx.send(result).is_err() || failed {
                break;
            }
        }
    });

    let end = loop {
        tokio::select! {
            _ = events.shutdown() => break SessionEnd::Shutdown,
            frame = io.next_outgoing() => match frame {
                Some(frame) => {
                    let len = frame.len();
                    let (kind, payload) = match frame {
                        Frame::Text(text) => (KIND_TEXT, text.into_bytes()),
                        Frame::Binary(data) => (KIND_BINARY, data),
                    };
                    if let Err(e) = write_frame(&mut wr, &mut send, kind, &payload).await {
                        break SessionEnd::Lost(e.to_string());
                    }
                    io.mark_sent(len);
                }
                None => {
                    let _ = wr.shutdown().await;
                    break SessionEnd::LocalClose;
                }
            },
            incoming = in_rx.recv() => match incoming {
                Some(Ok((KIND_TEXT, payload))) => match String::from_utf8(payload) {
                    Ok(text) => {
                        io.deliver(Frame::Text(text));
                    }
                    Err(_) => break SessionEnd::Lost("invalid UTF-8 text frame".to_string()),
                },
                Some(Ok((KIND_BINARY, payload))) => {
                    io.deliver(Frame::Binary(payload));
                }
                Some(Ok((kind, _))) => break SessionEnd::Lost(format!("unknown frame kind {kind}")),
                Some(Err(e)) => break SessionEnd::Lost(e.to_string()),
                None => break SessionEnd::Lost("reader stopped".to_string()),
            },
        }
    };
    reader.abort();
    io.close();
    end
}

async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    cipher: &mut SendCipher,
    kind: u8,
    payload: &[u8],
) -> TransportResult<()> {
    let mut plain = Vec::with_capacity(1 + payload.len());
    plain.push(kind);
    plain.extend_from_slice(payload);
    let sealed = cipher.seal(&plain)?;
    let len = u32::try_from(sealed.len())
        .ok()
        .filter(|len| *len <= MAX_FRAME_SIZE)
        .ok_or(TransportError::FrameTooLarge(sealed.len()))?;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(&sealed).await?;
    Ok(())
}

async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
    cipher: &mut RecvCipher,
) -> TransportResult<(u8, Vec<u8>)> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf);
    if len > MAX_FRAME_SIZE {
        return Err(TransportError::FrameTooLarge(len as usize));
    }
    let mut sealed = vec![0u8; len as usize];
    reader.read_exact(&mut sealed).await?;
    let mut plain = cipher.open(&sealed)?;
    if plain.is_empty() {
        return Err(TransportError::Handshake("empty frame".to_string()));
    }
    let kind = plain.remove(0);
    Ok((kind, plain))
}

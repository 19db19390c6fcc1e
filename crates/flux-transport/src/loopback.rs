//! In-process transport connecting peers that share a [`LoopbackHub`].
//!
//! Used to run several peers inside one process (tests, local demos). The
//! handshake is a real offer/answer exchange carried over signaling; the hub
//! only hands the answerer's stream half to the offerer.

use crate::stream::{self, DataStream, StreamCloser, StreamConfig, StreamIo};
use crate::transport::{
    PeerTransport, TransportConnection, TransportError, TransportEvent, TransportEventSender,
    TransportResult, TransportState,
};
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, trace};

/// Create two connected data streams.
///
/// Frames sent on one are delivered to the other. Closing either side closes
/// both.
pub fn stream_pair(label: &str, config: StreamConfig) -> (DataStream, DataStream) {
    let (a, io_a) = stream::channel(label, config);
    let (b, io_b) = stream::channel(label, config);
    tokio::spawn(pump_pair(io_a, io_b));
    (a, b)
}

async fn pump_pair(mut a: StreamIo, mut b: StreamIo) {
    loop {
        tokio::select! {
            frame = a.next_outgoing() => match frame {
                Some(frame) => {
                    let len = frame.len();
                    b.deliver(frame);
                    a.mark_sent(len);
                }
                None => break,
            },
            frame = b.next_outgoing() => match frame {
                Some(frame) => {
                    let len = frame.len();
                    a.deliver(frame);
                    b.mark_sent(len);
                }
                None => break,
            },
        }
    }
    trace!("Loopback stream {} closed", a.label());
    a.close();
    b.close();
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
enum Description {
    LoopbackOffer { token: String, from: String, label: String },
    LoopbackAnswer { token: String, from: String },
}

struct PendingOffer {
    offerer: String,
    stream: Option<DataStream>,
}

#[derive(Default)]
struct HubInner {
    pending: DashMap<String, PendingOffer>,
    connections: DashMap<(String, String), (u64, TransportEventSender)>,
    next_connection: AtomicU64,
    config: std::sync::OnceLock<StreamConfig>,
}

/// Meeting point for loopback peers. Cheap to clone.
#[derive(Clone, Default)]
pub struct LoopbackHub {
    inner: Arc<HubInner>,
}

impl LoopbackHub {
    /// Create an empty hub.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a hub whose streams use `config` watermarks.
    pub fn with_stream_config(config: StreamConfig) -> Self {
        let hub = Self::default();
        let _ = hub.inner.config.set(config);
        hub
    }

    /// Transport for the peer `local_id`.
    pub fn transport(&self, local_id: impl Into<String>) -> LoopbackTransport {
        LoopbackTransport {
            local_id: local_id.into(),
            hub: self.clone(),
        }
    }

    /// Report `state` on `local`'s live connection to `remote`, as if the
    /// underlying link changed. Returns `false` if no such connection exists.
    pub fn inject_state(&self, local: &str, remote: &str, state: TransportState) -> bool {
        self.inner
            .connections
            .get(&(local.to_string(), remote.to_string()))
            .is_some_and(|entry| entry.1.send(TransportEvent::StateChanged(state)).is_ok())
    }

    /// Number of live loopback connections.
    pub fn connection_count(&self) -> usize {
        self.inner.connections.len()
    }

    fn stream_config(&self) -> StreamConfig {
        self.inner.config.get().copied().unwrap_or_default()
    }
}

/// [`PeerTransport`] for one peer on a [`LoopbackHub`].
#[derive(Clone)]
pub struct LoopbackTransport {
    local_id: String,
    hub: LoopbackHub,
}

impl LoopbackTransport {
    /// Local peer ID.
    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    fn connection(&self, peer_id: &str, events: TransportEventSender) -> LoopbackConnection {
        let id = self.hub.inner.next_connection.fetch_add(1, Ordering::Relaxed);
        self.hub.inner.connections.insert(
            (self.local_id.clone(), peer_id.to_string()),
            (id, events.clone()),
        );
        LoopbackConnection {
            id,
            local: self.local_id.clone(),
            remote: peer_id.to_string(),
            hub: self.hub.clone(),
            events,
            label: None,
            offer_token: None,
            remote_offer: None,
            remote_set: false,
            pending_candidates: Vec::new(),
            applied_candidates: 0,
            closer: None,
            closed: false,
        }
    }
}

#[async_trait]
impl PeerTransport for LoopbackTransport {
    async fn create_connection(
        &self,
        peer_id: &str,
        events: TransportEventSender,
    ) -> TransportResult<Box<dyn TransportConnection>> {
        Ok(Box::new(self.connection(peer_id, events)))
    }
}

/// One loopback connection.
pub struct LoopbackConnection {
    id: u64,
    local: String,
    remote: String,
    hub: LoopbackHub,
    events: TransportEventSender,
    label: Option<String>,
    offer_token: Option<String>,
    remote_offer: Option<(String, String)>,
    remote_set: bool,
    pending_candidates: Vec<String>,
    applied_candidates: usize,
    closer: Option<StreamCloser>,
    closed: bool,
}

impl LoopbackConnection {
    fn emit(&self, event: TransportEvent) {
        if !self.closed {
            let _ = self.events.send(event);
        }
    }

    fn open(&mut self, stream: DataStream) {
        self.closer = Some(stream.closer());
        self.emit(TransportEvent::StateChanged(TransportState::Connected));
        self.emit(TransportEvent::StreamOpened(stream));
    }

    fn remote_description_applied(&mut self) {
        self.remote_set = true;
        let buffered = std::mem::take(&mut self.pending_candidates);
        if !buffered.is_empty() {
            debug!(
                "Applying {} buffered candidates from {}",
                buffered.len(),
                self.remote
            );
        }
        self.applied_candidates += buffered.len();
    }
}

#[async_trait]
impl TransportConnection for LoopbackConnection {
    fn create_data_stream(&mut self, label: &str) -> TransportResult<()> {
        self.label = Some(label.to_string());
        Ok(())
    }

    async fn create_offer(&mut self) -> TransportResult<String> {
        let token = hex::encode(rand::random::<[u8; 8]>());
        let label = self.label.clone().unwrap_or_else(|| "data".to_string());
        self.hub.inner.pending.insert(
            token.clone(),
            PendingOffer {
                offerer: self.local.clone(),
                stream: None,
            },
        );
        self.offer_token = Some(token.clone());
        self.emit(TransportEvent::StateChanged(TransportState::Connecting));
        self.emit(TransportEvent::LocalCandidate(format!("loopback {}", self.local)));

        let description = Description::LoopbackOffer {
            token,
            from: self.local.clone(),
            label,
        };
        serde_json::to_string(&description).map_err(|e| TransportError::Other(e.to_string()))
    }

    async fn create_answer(&mut self) -> TransportResult<String> {
        let (token, label) = self
            .remote_offer
            .clone()
            .ok_or(TransportError::NoRemoteDescription)?;
        let (mine, theirs) = stream_pair(&label, self.hub.stream_config());
        {
            let mut pending = self.hub.inner.pending.get_mut(&token).ok_or_else(|| {
                TransportError::InvalidDescription(format!("offer {token} is no longer pending"))
            })?;
            pending.stream = Some(theirs);
        }
        self.open(mine);

        let description = Description::LoopbackAnswer {
            token,
            from: self.local.clone(),
        };
        serde_json::to_string(&description).map_err(|e| TransportError::Other(e.to_string()))
    }

    async fn set_remote_description(&mut self, description: &str) -> TransportResult<()> {
        let parsed: Description = serde_json::from_str(description)
            .map_err(|e| TransportError::InvalidDescription(e.to_string()))?;
        match parsed {
            Description::LoopbackOffer { token, from, label } => {
                if from != self.remote {
                    return Err(TransportError::InvalidDescription(format!(
                        "offer from {from}, expected {}",
                        self.remote
                    )));
                }
                self.remote_offer = Some((token, label));
                self.emit(TransportEvent::StateChanged(TransportState::Connecting));
            }
            Description::LoopbackAnswer { token, from } => {
                if self.offer_token.as_deref() != Some(token.as_str()) {
                    return Err(TransportError::InvalidDescription(format!(
                        "answer for unknown offer {token}"
                    )));
                }
                let pending = self
                    .hub
                    .inner
                    .pending
                    .remove(&token)
                    .map(|(_, pending)| pending)
                    .filter(|pending| pending.offerer == self.local);
                let stream = pending.and_then(|p| p.stream).ok_or_else(|| {
                    TransportError::InvalidDescription(format!("no stream for answer from {from}"))
                })?;
                self.open(stream);
            }
        }
        self.remote_description_applied();
        Ok(())
    }

    async fn add_candidate(&mut self, candidate: &str) -> TransportResult<()> {
        if self.remote_set {
            trace!("Candidate from {}: {}", self.remote, candidate);
            self.applied_candidates += 1;
        } else {
            self.pending_candidates.push(candidate.to_string());
        }
        Ok(())
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Some(closer) = self.closer.take() {
            closer.close();
        }
        if let Some(token) = self.offer_token.take() {
            self.hub.inner.pending.remove(&token);
        }
        let key = (self.local.clone(), self.remote.clone());
        self.hub
            .inner
            .connections
            .remove_if(&key, |_, (id, _)| *id == self.id);
    }
}

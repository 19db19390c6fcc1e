//! Connection manager actor.

use super::{ConnectionConfig, ConnectionEvent, PeerSignal, SignalSender};
use flux_transport::{
    PeerTransport, TransportConnection, TransportError, TransportEvent, TransportState,
};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

enum Command {
    ConnectTo {
        peer_id: String,
    },
    Signal {
        from: String,
        data: Value,
    },
    Disconnect {
        peer_id: String,
        done: oneshot::Sender<()>,
    },
    State {
        peer_id: String,
        reply: oneshot::Sender<Option<TransportState>>,
    },
    Peers {
        reply: oneshot::Sender<Vec<String>>,
    },
    Dispose {
        done: oneshot::Sender<()>,
    },
}

enum Internal {
    Transport {
        peer_id: String,
        generation: u64,
        event: TransportEvent,
    },
    ReconnectDue {
        peer_id: String,
        generation: u64,
    },
}

struct PeerEntry {
    generation: u64,
    connection: Box<dyn TransportConnection>,
    state: TransportState,
    offering: bool,
    reconnect_attempts: u32,
    reconnect_timer: Option<JoinHandle<()>>,
    forwarder: JoinHandle<()>,
}

impl PeerEntry {
    fn negotiating_offer(&self) -> bool {
        self.offering && matches!(self.state, TransportState::New | TransportState::Connecting)
    }

    async fn teardown(mut self) {
        if let Some(timer) = self.reconnect_timer.take() {
            timer.abort();
        }
        self.connection.close().await;
        self.forwarder.abort();
    }
}

/// Owns one transport connection per remote peer.
///
/// Cheap to clone; all clones drive the same manager task. The task stops
/// and tears every connection down once the last handle is dropped.
///
/// Signals arriving from the relay must be fed in through
/// [`handle_signal`](Self::handle_signal); outgoing signals are sent through
/// the [`SignalSender`] given at construction.
#[derive(Clone)]
pub struct ConnectionManager {
    local_id: Arc<str>,
    commands: mpsc::UnboundedSender<Command>,
}

impl ConnectionManager {
    /// Start a manager for the local peer `local_id`.
    ///
    /// # Arguments
    ///
    /// * `local_id` - This peer's relay ID; also used to break offer collisions
    /// * `transport` - Factory for per-peer connections
    /// * `signals` - Outbound signaling channel
    /// * `config` - Reconnect policy and stream label
    pub fn new(
        local_id: impl Into<String>,
        transport: Arc<dyn PeerTransport>,
        signals: Arc<dyn SignalSender>,
        config: ConnectionConfig,
    ) -> (Self, mpsc::UnboundedReceiver<ConnectionEvent>) {
        let local_id: String = local_id.into();
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (events, event_rx) = mpsc::unbounded_channel();
        let (internal, internal_rx) = mpsc::unbounded_channel();

        let actor = ManagerActor {
            local_id: local_id.clone(),
            transport,
            signals,
            config,
            events,
            internal,
            peers: HashMap::new(),
            next_generation: 0,
        };
        tokio::spawn(actor.run(command_rx, internal_rx));

        (
            Self {
                local_id: local_id.into(),
                commands,
            },
            event_rx,
        )
    }

    /// Local peer ID.
    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    /// Start (or restart) negotiation with `peer_id` as the offering side.
    ///
    /// Returns immediately; the stream arrives as
    /// [`ConnectionEvent::DataChannel`].
    pub fn connect_to(&self, peer_id: &str) {
        self.send(Command::ConnectTo {
            peer_id: peer_id.to_string(),
        });
    }

    /// Feed a signal payload relayed from `from`.
    pub fn handle_signal(&self, from: &str, data: Value) {
        self.send(Command::Signal {
            from: from.to_string(),
            data,
        });
    }

    /// Tear down the connection to `peer_id` and cancel any pending
    /// reconnect.
    pub async fn disconnect(&self, peer_id: &str) {
        let (done, wait) = oneshot::channel();
        self.send(Command::Disconnect {
            peer_id: peer_id.to_string(),
            done,
        });
        let _ = wait.await;
    }

    /// Current state of the connection to `peer_id`, if one exists.
    pub async fn state(&self, peer_id: &str) -> Option<TransportState> {
        let (reply, wait) = oneshot::channel();
        self.send(Command::State {
            peer_id: peer_id.to_string(),
            reply,
        });
        wait.await.ok().flatten()
    }

    /// Peers with a connection entry.
    pub async fn peers(&self) -> Vec<String> {
        let (reply, wait) = oneshot::channel();
        self.send(Command::Peers { reply });
        wait.await.unwrap_or_default()
    }

    /// Tear down every connection.
    pub async fn dispose(&self) {
        let (done, wait) = oneshot::channel();
        self.send(Command::Dispose { done });
        let _ = wait.await;
    }

    fn send(&self, command: Command) {
        if self.commands.send(command).is_err() {
            warn!("Connection manager has stopped; command dropped");
        }
    }
}

struct ManagerActor {
    local_id: String,
    transport: Arc<dyn PeerTransport>,
    signals: Arc<dyn SignalSender>,
    config: ConnectionConfig,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    internal: mpsc::UnboundedSender<Internal>,
    peers: HashMap<String, PeerEntry>,
    next_generation: u64,
}

impl ManagerActor {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut internal: mpsc::UnboundedReceiver<Internal>,
    ) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                Some(message) = internal.recv() => self.handle_internal(message).await,
            }
        }
        self.dispose().await;
        debug!("Connection manager for {} stopped", self.local_id);
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::ConnectTo { peer_id } => {
                if let Some(entry) = self.peers.get(&peer_id)
                    && (entry.state == TransportState::Connected || entry.negotiating_offer())
                {
                    debug!(
                        "Already {} with {}; ignoring connect request",
                        entry.state, peer_id
                    );
                    return;
                }
                self.start_offer(peer_id, 0).await;
            }
            Command::Signal { from, data } => self.handle_signal(from, data).await,
            Command::Disconnect { peer_id, done } => {
                if let Some(entry) = self.peers.remove(&peer_id) {
                    info!("Disconnecting from {}", peer_id);
                    entry.teardown().await;
                    self.removed(peer_id);
                }
                let _ = done.send(());
            }
            Command::State { peer_id, reply } => {
                let _ = reply.send(self.peers.get(&peer_id).map(|entry| entry.state));
            }
            Command::Peers { reply } => {
                let _ = reply.send(self.peers.keys().cloned().collect());
            }
            Command::Dispose { done } => {
                self.dispose().await;
                let _ = done.send(());
            }
        }
    }

    async fn handle_internal(&mut self, message: Internal) {
        match message {
            Internal::Transport {
                peer_id,
                generation,
                event,
            } => {
                if self.peers.get(&peer_id).map(|entry| entry.generation) != Some(generation) {
                    trace!("Dropping event from superseded connection to {}", peer_id);
                    return;
                }
                match event {
                    TransportEvent::LocalCandidate(candidate) => {
                        self.signals
                            .send_signal(&peer_id, PeerSignal::Candidate { candidate }.to_value());
                    }
                    TransportEvent::StateChanged(state) => self.apply_state(&peer_id, state).await,
                    TransportEvent::StreamOpened(stream) => {
                        if let Some(entry) = self.peers.get_mut(&peer_id) {
                            entry.reconnect_attempts = 0;
                            if let Some(timer) = entry.reconnect_timer.take() {
                                timer.abort();
                            }
                        }
                        info!("Data stream '{}' to {} is open", stream.label(), peer_id);
                        self.emit(ConnectionEvent::DataChannel { peer_id, stream });
                    }
                }
            }
            Internal::ReconnectDue {
                peer_id,
                generation,
            } => {
                let Some(entry) = self.peers.get_mut(&peer_id) else {
                    return;
                };
                if entry.generation != generation {
                    return;
                }
                entry.reconnect_timer = None;
                if !matches!(
                    entry.state,
                    TransportState::Failed | TransportState::Disconnected
                ) {
                    debug!("Peer {} recovered ({}); reconnect skipped", peer_id, entry.state);
                    return;
                }
                let attempts = entry.reconnect_attempts;
                self.start_offer(peer_id, attempts).await;
            }
        }
    }

    async fn handle_signal(&mut self, from: String, data: Value) {
        let signal = match PeerSignal::from_value(data) {
            Ok(signal) => signal,
            Err(e) => {
                warn!("Ignoring signal from {}: {}", from, e);
                return;
            }
        };
        debug!("Received {} from {}", signal.kind(), from);

        match signal {
            PeerSignal::Offer { sdp } => self.accept_offer(from, sdp).await,
            PeerSignal::Answer { sdp } => {
                let Some(entry) = self.peers.get_mut(&from) else {
                    debug!("Answer from {} without a pending offer", from);
                    return;
                };
                if !entry.offering {
                    debug!("Unexpected answer from {}; not the offering side", from);
                    return;
                }
                if let Err(e) = entry.connection.set_remote_description(&sdp).await {
                    warn!("Applying answer from {} failed: {}", from, e);
                    self.apply_state(&from, TransportState::Failed).await;
                }
            }
            PeerSignal::Candidate { candidate } => {
                let Some(entry) = self.peers.get_mut(&from) else {
                    trace!("Candidate from {} without a connection", from);
                    return;
                };
                if let Err(e) = entry.connection.add_candidate(&candidate).await {
                    debug!("Candidate from {} rejected: {}", from, e);
                }
            }
        }
    }

    /// Replace any connection to `peer_id` with a fresh offering one.
    async fn start_offer(&mut self, peer_id: String, attempts: u32) {
        if let Some(old) = self.peers.remove(&peer_id) {
            old.teardown().await;
        }
        let mut entry = match self.create_entry(&peer_id, true, attempts).await {
            Ok(entry) => entry,
            Err(e) => {
                warn!("Creating connection to {} failed: {}", peer_id, e);
                self.emit(ConnectionEvent::StateChanged {
                    peer_id,
                    state: TransportState::Failed,
                });
                return;
            }
        };

        let label = self.config.stream_label.clone();
        let offer = async {
            entry.connection.create_data_stream(&label)?;
            entry.connection.create_offer().await
        }
        .await;

        match offer {
            Ok(sdp) => {
                debug!("Sending offer to {}", peer_id);
                self.signals
                    .send_signal(&peer_id, PeerSignal::Offer { sdp }.to_value());
                self.peers.insert(peer_id, entry);
            }
            Err(e) => {
                warn!("Creating offer for {} failed: {}", peer_id, e);
                self.peers.insert(peer_id.clone(), entry);
                self.apply_state(&peer_id, TransportState::Failed).await;
            }
        }
    }

    async fn accept_offer(&mut self, from: String, sdp: String) {
        if let Some(existing) = self.peers.get(&from)
            && existing.negotiating_offer()
            && self.local_id.as_str() > from.as_str()
        {
            debug!("Offer collision with {}; keeping the local offer", from);
            return;
        }

        let attempts = match self.peers.remove(&from) {
            Some(old) => {
                let attempts = old.reconnect_attempts;
                old.teardown().await;
                attempts
            }
            None => 0,
        };
        let mut entry = match self.create_entry(&from, false, attempts).await {
            Ok(entry) => entry,
            Err(e) => {
                warn!("Creating connection for offer from {} failed: {}", from, e);
                self.emit(ConnectionEvent::StateChanged {
                    peer_id: from,
                    state: TransportState::Failed,
                });
                return;
            }
        };

        let answer = async {
            entry.connection.set_remote_description(&sdp).await?;
            entry.connection.create_answer().await
        }
        .await;

        match answer {
            Ok(sdp) => {
                debug!("Sending answer to {}", from);
                self.signals
                    .send_signal(&from, PeerSignal::Answer { sdp }.to_value());
                self.peers.insert(from, entry);
            }
            Err(e) => {
                warn!("Answering offer from {} failed: {}", from, e);
                self.peers.insert(from.clone(), entry);
                self.apply_state(&from, TransportState::Failed).await;
            }
        }
    }

    async fn create_entry(
        &mut self,
        peer_id: &str,
        offering: bool,
        reconnect_attempts: u32,
    ) -> Result<PeerEntry, TransportError> {
        self.next_generation += 1;
        let generation = self.next_generation;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let connection = self.transport.create_connection(peer_id, tx).await?;

        let internal = self.internal.clone();
        let peer = peer_id.to_string();
        let forwarder = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let message = Internal::Transport {
                    peer_id: peer.clone(),
                    generation,
                    event,
                };
                if internal.send(message).is_err() {
                    break;
                }
            }
        });

        Ok(PeerEntry {
            generation,
            connection,
            state: TransportState::New,
            offering,
            reconnect_attempts,
            reconnect_timer: None,
            forwarder,
        })
    }

    async fn apply_state(&mut self, peer_id: &str, state: TransportState) {
        let Some(entry) = self.peers.get_mut(peer_id) else {
            return;
        };
        if entry.state == state {
            return;
        }
        entry.state = state;
        debug!("Connection to {} is {}", peer_id, state);
        self.emit(ConnectionEvent::StateChanged {
            peer_id: peer_id.to_string(),
            state,
        });

        match state {
            TransportState::Failed | TransportState::Disconnected => {
                self.schedule_reconnect(peer_id);
            }
            TransportState::Closed => {
                if let Some(entry) = self.peers.remove(peer_id) {
                    entry.teardown().await;
                }
                self.emit(ConnectionEvent::PeerRemoved {
                    peer_id: peer_id.to_string(),
                });
            }
            _ => {}
        }
    }

    fn schedule_reconnect(&mut self, peer_id: &str) {
        if !self.config.reconnect_enabled {
            return;
        }
        let max_attempts = self.config.max_reconnect_attempts;
        let delay = self.config.reconnect_delay;
        let Some(entry) = self.peers.get_mut(peer_id) else {
            return;
        };
        if entry.reconnect_timer.is_some() {
            return;
        }
        if entry.reconnect_attempts >= max_attempts {
            warn!(
                "Giving up on {} after {} reconnect attempts",
                peer_id, max_attempts
            );
            return;
        }

        entry.reconnect_attempts += 1;
        info!(
            "Reconnecting to {} in {:?} (attempt {}/{})",
            peer_id, delay, entry.reconnect_attempts, max_attempts
        );
        let internal = self.internal.clone();
        let generation = entry.generation;
        let peer = peer_id.to_string();
        entry.reconnect_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = internal.send(Internal::ReconnectDue {
                peer_id: peer,
                generation,
            });
        }));
    }

    async fn dispose(&mut self) {
        let peers: Vec<(String, PeerEntry)> = self.peers.drain().collect();
        for (peer_id, entry) in peers {
            entry.teardown().await;
            self.removed(peer_id);
        }
    }

    fn removed(&self, peer_id: String) {
        self.emit(ConnectionEvent::StateChanged {
            peer_id: peer_id.clone(),
            state: TransportState::Closed,
        });
        self.emit(ConnectionEvent::PeerRemoved { peer_id });
    }

    fn emit(&self, event: ConnectionEvent) {
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dashmap::DashMap;
    use flux_transport::{DataStream, Frame, LoopbackHub};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::time::timeout;

    const TEST_TIMEOUT: Duration = Duration::from_secs(5);

    /// In-process stand-in for the relay: routes signals straight into the
    /// target manager.
    #[derive(Clone, Default)]
    struct TestRelay {
        managers: Arc<DashMap<String, ConnectionManager>>,
        offers: Arc<AtomicUsize>,
    }

    struct RoutedSignals {
        from: String,
        relay: TestRelay,
    }

    impl SignalSender for RoutedSignals {
        fn send_signal(&self, to: &str, data: Value) {
            if data["type"] == "offer" {
                self.relay.offers.fetch_add(1, Ordering::SeqCst);
            }
            let target = self.relay.managers.get(to).map(|m| m.clone());
            if let Some(target) = target {
                target.handle_signal(&self.from, data);
            }
        }
    }

    fn fast_config() -> ConnectionConfig {
        ConnectionConfig {
            reconnect_delay: Duration::from_millis(30),
            ..ConnectionConfig::default()
        }
    }

    fn start(
        hub: &LoopbackHub,
        relay: &TestRelay,
        id: &str,
        register: bool,
    ) -> (ConnectionManager, mpsc::UnboundedReceiver<ConnectionEvent>) {
        let signals = Arc::new(RoutedSignals {
            from: id.to_string(),
            relay: relay.clone(),
        });
        let (manager, events) =
            ConnectionManager::new(id, Arc::new(hub.transport(id)), signals, fast_config());
        if register {
            relay.managers.insert(id.to_string(), manager.clone());
        }
        (manager, events)
    }

    async fn wait_for<F>(
        events: &mut mpsc::UnboundedReceiver<ConnectionEvent>,
        mut matches: F,
    ) -> ConnectionEvent
    where
        F: FnMut(&ConnectionEvent) -> bool,
    {
        timeout(TEST_TIMEOUT, async {
            loop {
                let event = events.recv().await.expect("manager stopped");
                if matches(&event) {
                    return event;
                }
            }
        })
        .await
        .expect("timed out waiting for connection event")
    }

    async fn wait_stream(events: &mut mpsc::UnboundedReceiver<ConnectionEvent>) -> DataStream {
        match wait_for(events, |e| matches!(e, ConnectionEvent::DataChannel { .. })).await {
            ConnectionEvent::DataChannel { stream, .. } => stream,
            _ => unreachable!(),
        }
    }

    async fn wait_state(
        events: &mut mpsc::UnboundedReceiver<ConnectionEvent>,
        wanted: TransportState,
    ) {
        wait_for(events, |e| {
            matches!(e, ConnectionEvent::StateChanged { state, .. } if *state == wanted)
        })
        .await;
    }

    #[tokio::test]
    async fn test_connect_opens_stream_on_both_sides() {
        let hub = LoopbackHub::new();
        let relay = TestRelay::default();
        let (a, mut a_events) = start(&hub, &relay, "alice", true);
        let (_b, mut b_events) = start(&hub, &relay, "bob", true);

        a.connect_to("bob");
        let a_stream = wait_stream(&mut a_events).await;
        let mut b_stream = wait_stream(&mut b_events).await;
        assert_eq!(a_stream.label(), "file-transfer");

        a_stream.send(Frame::Text("hello".into())).unwrap();
        let frame = timeout(TEST_TIMEOUT, b_stream.recv()).await.unwrap();
        assert_eq!(frame, Some(Frame::Text("hello".into())));
        assert_eq!(a.state("bob").await, Some(TransportState::Connected));
        assert_eq!(a.peers().await, vec!["bob".to_string()]);
    }

    #[tokio::test]
    async fn test_offer_collision_yields_single_stream() {
        let hub = LoopbackHub::new();
        let relay = TestRelay::default();
        let (a, mut a_events) = start(&hub, &relay, "alice", true);
        let (b, mut b_events) = start(&hub, &relay, "bob", true);

        a.connect_to("bob");
        b.connect_to("alice");

        let mut a_stream = wait_stream(&mut a_events).await;
        let b_stream = wait_stream(&mut b_events).await;
        b_stream.send(Frame::Binary(vec![1, 2, 3])).unwrap();
        let frame = timeout(TEST_TIMEOUT, a_stream.recv()).await.unwrap();
        assert_eq!(frame, Some(Frame::Binary(vec![1, 2, 3])));

        tokio::time::sleep(Duration::from_millis(100)).await;
        while let Ok(event) = a_events.try_recv() {
            assert!(!matches!(event, ConnectionEvent::DataChannel { .. }));
        }
    }

    #[tokio::test]
    async fn test_failure_triggers_reconnect() {
        let hub = LoopbackHub::new();
        let relay = TestRelay::default();
        let (a, mut a_events) = start(&hub, &relay, "alice", true);
        let (_b, mut b_events) = start(&hub, &relay, "bob", true);

        a.connect_to("bob");
        let mut first = wait_stream(&mut a_events).await;
        wait_stream(&mut b_events).await;

        assert!(hub.inject_state("alice", "bob", TransportState::Failed));
        wait_state(&mut a_events, TransportState::Failed).await;

        let second = wait_stream(&mut a_events).await;
        let mut b_second = wait_stream(&mut b_events).await;
        second.send(Frame::Text("again".into())).unwrap();
        let frame = timeout(TEST_TIMEOUT, b_second.recv()).await.unwrap();
        assert_eq!(frame, Some(Frame::Text("again".into())));

        // The superseded stream was torn down.
        assert_eq!(timeout(TEST_TIMEOUT, first.recv()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_reconnect_attempts_are_bounded() {
        let hub = LoopbackHub::new();
        let relay = TestRelay::default();
        // Nobody answers: offers go nowhere.
        let (a, mut a_events) = start(&hub, &relay, "alice", true);

        a.connect_to("bob");
        wait_state(&mut a_events, TransportState::Connecting).await;

        for attempt in 1..=4 {
            assert!(hub.inject_state("alice", "bob", TransportState::Failed));
            wait_state(&mut a_events, TransportState::Failed).await;
            if attempt <= 3 {
                wait_state(&mut a_events, TransportState::Connecting).await;
            }
        }

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(relay.offers.load(Ordering::SeqCst), 4);
        assert_eq!(a.state("bob").await, Some(TransportState::Failed));

        // A manual connect starts over.
        a.connect_to("bob");
        wait_state(&mut a_events, TransportState::Connecting).await;
        assert_eq!(relay.offers.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_disconnect_cancels_pending_reconnect() {
        let hub = LoopbackHub::new();
        let relay = TestRelay::default();
        let (a, mut a_events) = start(&hub, &relay, "alice", true);
        let (_b, mut b_events) = start(&hub, &relay, "bob", true);

        a.connect_to("bob");
        wait_stream(&mut a_events).await;
        wait_stream(&mut b_events).await;
        let offers = relay.offers.load(Ordering::SeqCst);

        hub.inject_state("alice", "bob", TransportState::Disconnected);
        wait_state(&mut a_events, TransportState::Disconnected).await;
        a.disconnect("bob").await;
        wait_for(&mut a_events, |e| matches!(e, ConnectionEvent::PeerRemoved { .. })).await;

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(relay.offers.load(Ordering::SeqCst), offers);
        assert_eq!(a.state("bob").await, None);
    }

    #[tokio::test]
    async fn test_closed_state_removes_peer_without_reconnect() {
        let hub = LoopbackHub::new();
        let relay = TestRelay::default();
        let (a, mut a_events) = start(&hub, &relay, "alice", true);
        let (_b, mut b_events) = start(&hub, &relay, "bob", true);

        a.connect_to("bob");
        wait_stream(&mut a_events).await;
        wait_stream(&mut b_events).await;
        let offers = relay.offers.load(Ordering::SeqCst);

        hub.inject_state("alice", "bob", TransportState::Closed);
        let event =
            wait_for(&mut a_events, |e| matches!(e, ConnectionEvent::PeerRemoved { .. })).await;
        assert_eq!(event.peer_id(), "bob");

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(relay.offers.load(Ordering::SeqCst), offers);
        assert!(a.peers().await.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_signal_ignored() {
        let hub = LoopbackHub::new();
        let relay = TestRelay::default();
        let (a, _events) = start(&hub, &relay, "alice", false);

        a.handle_signal("mallory", json!({"type": "bogus"}));
        a.handle_signal("mallory", json!({"type": "answer", "sdp": "x"}));
        assert!(a.peers().await.is_empty());
    }

    #[tokio::test]
    async fn test_dispose_removes_all_peers() {
        let hub = LoopbackHub::new();
        let relay = TestRelay::default();
        let (a, mut a_events) = start(&hub, &relay, "alice", true);
        let (_b, mut b_events) = start(&hub, &relay, "bob", true);
        let (_c, mut c_events) = start(&hub, &relay, "carol", true);

        a.connect_to("bob");
        a.connect_to("carol");
        wait_stream(&mut b_events).await;
        wait_stream(&mut c_events).await;

        a.dispose().await;
        assert!(a.peers().await.is_empty());
        let mut removed = Vec::new();
        while removed.len() < 2 {
            if let ConnectionEvent::PeerRemoved { peer_id } =
                wait_for(&mut a_events, |e| matches!(e, ConnectionEvent::PeerRemoved { .. }))
                    .await
            {
                removed.push(peer_id);
            }
        }
        removed.sort();
        assert_eq!(removed, vec!["bob".to_string(), "carol".to_string()]);
    }
}

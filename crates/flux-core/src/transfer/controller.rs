//! Per-peer transfer controller.
//!
//! The controller task is the only owner of a peer's sessions and the only
//! emitter of its events. An active send streams chunks from a child pump
//! task that reports progress back over a channel.

use super::events::{Direction, TransferContext, TransferEvent};
use super::manifest::Manifest;
use super::protocol::{CHUNK_HEADER_LEN, ControlMessage, decode_chunk, encode_chunk};
use super::TransferConfig;
use crate::error::TransferError;
use flux_files::{
    ArchiveUnpacker, Checkpoint, CheckpointStore, ChunkBitmap, ChunkSink, ChunkSource,
    DestinationRequest, SaveTarget, SavedArtifact,
};
use flux_transport::{DataStream, Frame, StreamReceiver, StreamSender};
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::mpsc::error::SendError;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

pub(crate) const CHANNEL_CLOSED: &str = "channel closed";
const SUPERSEDED: &str = "superseded by a new transfer";
const DECLINED_LOCALLY: &str = "declined by receiver";
const DECLINED_BY_RECEIVER: &str = "receiver declined the transfer";

/// Shared collaborators of every controller.
pub(crate) struct TransferEnv {
    pub(crate) config: TransferConfig,
    pub(crate) checkpoints: Arc<dyn CheckpointStore>,
    pub(crate) target: Arc<dyn SaveTarget>,
    pub(crate) unpacker: Option<Arc<dyn ArchiveUnpacker>>,
    pub(crate) events: mpsc::UnboundedSender<TransferEvent>,
}

enum Command {
    Send {
        source: Box<dyn ChunkSource>,
        chunk_size: u32,
        reply: oneshot::Sender<Result<String, TransferError>>,
    },
    Cancel {
        transfer_id: String,
        reason: Option<String>,
        reply: oneshot::Sender<bool>,
    },
    Shutdown {
        done: oneshot::Sender<()>,
    },
}

/// Cloneable command handle for one controller.
#[derive(Clone)]
pub(crate) struct ControllerClient {
    peer_id: String,
    commands: mpsc::UnboundedSender<Command>,
}

impl ControllerClient {
    pub(crate) async fn send_file(
        &self,
        source: Box<dyn ChunkSource>,
        chunk_size: u32,
    ) -> Result<String, TransferError> {
        let (reply, wait) = oneshot::channel();
        let command = Command::Send {
            source,
            chunk_size,
            reply,
        };
        if let Err(SendError(command)) = self.commands.send(command) {
            if let Command::Send { mut source, .. } = command {
                dispose_source(&mut source).await;
            }
            return Err(TransferError::ControllerStopped(self.peer_id.clone()));
        }
        wait.await
            .map_err(|_| TransferError::ControllerStopped(self.peer_id.clone()))?
    }

    pub(crate) async fn cancel(&self, transfer_id: &str, reason: Option<String>) -> bool {
        let (reply, wait) = oneshot::channel();
        let command = Command::Cancel {
            transfer_id: transfer_id.to_string(),
            reason,
            reply,
        };
        if self.commands.send(command).is_err() {
            return false;
        }
        wait.await.unwrap_or(false)
    }
}

/// Owned controller: command handle plus task.
pub(crate) struct ControllerHandle {
    client: ControllerClient,
    task: JoinHandle<()>,
}

impl ControllerHandle {
    pub(crate) fn client(&self) -> &ControllerClient {
        &self.client
    }

    /// Cancel both directions with the channel-closed reason and wait for
    /// the task to finish.
    pub(crate) async fn shutdown(self) {
        let (done, wait) = oneshot::channel();
        if self.client.commands.send(Command::Shutdown { done }).is_ok() {
            let _ = wait.await;
        }
        if let Err(e) = self.task.await {
            warn!("Transfer controller for {} panicked: {}", self.client.peer_id, e);
        }
    }
}

/// Start a controller bound to `stream`.
pub(crate) fn spawn_controller(
    peer_id: String,
    stream: DataStream,
    env: Arc<TransferEnv>,
) -> ControllerHandle {
    let (sender, receiver) = stream.split();
    let (commands, command_rx) = mpsc::unbounded_channel();
    let (reports, report_rx) = mpsc::unbounded_channel();

    let controller = PeerController {
        peer_id: peer_id.clone(),
        sender,
        env,
        reports,
        outgoing: None,
        incoming: None,
        next_session: 0,
    };
    let task = tokio::spawn(controller.run(receiver, command_rx, report_rx));

    ControllerHandle {
        client: ControllerClient { peer_id, commands },
        task,
    }
}

enum PumpReport {
    Progress {
        session: u64,
        chunk_index: u32,
        bytes_sent: u64,
    },
    Finished {
        session: u64,
    },
    Failed {
        session: u64,
        message: String,
    },
}

struct Pump {
    stop: watch::Sender<bool>,
    task: JoinHandle<Box<dyn ChunkSource>>,
}

struct SendSession {
    session: u64,
    context: TransferContext,
    source: Option<Box<dyn ChunkSource>>,
    next_chunk_index: u32,
    bytes_sent: u64,
    pump: Option<Pump>,
}

struct ReceiveSession {
    context: TransferContext,
    sink: Box<dyn ChunkSink>,
    received: ChunkBitmap,
    bytes_received: u64,
    since_checkpoint: u32,
}

impl ReceiveSession {
    fn checkpoint(&self) -> Checkpoint {
        let next = self.received.contiguous_prefix();
        Checkpoint::new(
            self.context.transfer_id.clone(),
            next,
            self.context.manifest.bytes_before(next),
        )
    }
}

struct PeerController {
    peer_id: String,
    sender: StreamSender,
    env: Arc<TransferEnv>,
    reports: mpsc::UnboundedSender<PumpReport>,
    outgoing: Option<SendSession>,
    incoming: Option<ReceiveSession>,
    next_session: u64,
}

impl PeerController {
    async fn run(
        mut self,
        mut receiver: StreamReceiver,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut reports: mpsc::UnboundedReceiver<PumpReport>,
    ) {
        debug!("Transfer controller for {} started", self.peer_id);
        loop {
            tokio::select! {
                biased;
                command = commands.recv() => match command {
                    Some(Command::Shutdown { done }) => {
                        self.close_all(CHANNEL_CLOSED).await;
                        let _ = done.send(());
                        break;
                    }
                    Some(command) => self.handle_command(command).await,
                    None => {
                        self.close_all(CHANNEL_CLOSED).await;
                        break;
                    }
                },
                Some(report) = reports.recv() => self.handle_report(report).await,
                frame = receiver.recv() => match frame {
                    Some(Frame::Text(text)) => self.handle_text(&text).await,
                    Some(Frame::Binary(data)) => self.handle_chunk(&data).await,
                    None => {
                        debug!("Data stream to {} closed", self.peer_id);
                        self.close_all(CHANNEL_CLOSED).await;
                        break;
                    }
                },
            }
        }
        debug!("Transfer controller for {} stopped", self.peer_id);
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Send {
                source,
                chunk_size,
                reply,
            } => {
                let result = self.start_send(source, chunk_size).await;
                let _ = reply.send(result);
            }
            Command::Cancel {
                transfer_id,
                reason,
                reply,
            } => {
                let cancelled = self.cancel_local(&transfer_id, reason).await;
                let _ = reply.send(cancelled);
            }
            Command::Shutdown { done } => {
                let _ = done.send(());
            }
        }
    }

    fn context(&self, direction: Direction, manifest: Manifest) -> TransferContext {
        TransferContext {
            peer_id: self.peer_id.clone(),
            direction,
            transfer_id: manifest.file_id.clone(),
            manifest,
            started_at: SystemTime::now(),
        }
    }

    fn emit(&self, event: TransferEvent) {
        let _ = self.env.events.send(event);
    }

    fn send_control(&self, message: &ControlMessage) {
        let sent = message
            .to_text()
            .and_then(|text| self.sender.send_text(text).map_err(TransferError::from));
        match sent {
            Ok(()) => trace!("Sent {} to {}", message.message_type(), self.peer_id),
            Err(e) => debug!(
                "Could not send {} to {}: {}",
                message.message_type(),
                self.peer_id,
                e
            ),
        }
    }

    // --- send path ---

    async fn start_send(
        &mut self,
        mut source: Box<dyn ChunkSource>,
        chunk_size: u32,
    ) -> Result<String, TransferError> {
        if self.outgoing.is_some() {
            dispose_source(&mut source).await;
            return Err(TransferError::SendInProgress(self.peer_id.clone()));
        }
        let manifest = match Manifest::for_source(source.info(), chunk_size) {
            Ok(manifest) => manifest,
            Err(e) => {
                dispose_source(&mut source).await;
                return Err(e);
            }
        };

        let meta = ControlMessage::Meta(manifest.clone()).to_text()?;
        if let Err(e) = self.sender.send_text(meta) {
            dispose_source(&mut source).await;
            return Err(e.into());
        }

        let context = self.context(Direction::Send, manifest);
        let transfer_id = context.transfer_id.clone();
        info!(
            "Offering {} ({} bytes, {} chunks) to {}",
            context.manifest.name, context.manifest.size, context.manifest.total_chunks, self.peer_id
        );
        self.next_session += 1;
        self.outgoing = Some(SendSession {
            session: self.next_session,
            context: context.clone(),
            source: Some(source),
            next_chunk_index: 0,
            bytes_sent: 0,
            pump: None,
        });
        self.emit(TransferEvent::Started(context));
        Ok(transfer_id)
    }

    fn outgoing_for(&mut self, id: &str) -> Option<&mut SendSession> {
        self.outgoing
            .as_mut()
            .filter(|send| send.context.transfer_id == id)
    }

    fn on_resume_req(&mut self, file_id: String, have_until_chunk: u32) {
        let peer_id = self.peer_id.clone();
        let Some(send) = self.outgoing_for(&file_id) else {
            debug!("Resume request from {} for unknown transfer {}", peer_id, file_id);
            return;
        };
        if send.pump.is_some() {
            debug!("Resume request for {} after streaming started; ignored", file_id);
            return;
        }
        let start = have_until_chunk.min(send.context.manifest.chunk_count());
        send.next_chunk_index = start;
        send.bytes_sent = send.context.manifest.bytes_before(start);
        info!("{} resumes {} from chunk {}", peer_id, file_id, start);
        self.send_control(&ControlMessage::ResumeOk {
            file_id,
            start_from: start,
        });
    }

    async fn on_ack(&mut self, id: String, ready: bool) {
        let low = self.env.config.low_watermark_chunks;
        let high = self.env.config.high_watermark_chunks;
        let Some(send) = self
            .outgoing
            .as_mut()
            .filter(|send| send.context.transfer_id == id)
        else {
            debug!("Ack from {} for unknown transfer {}", self.peer_id, id);
            return;
        };
        if send.pump.is_some() {
            debug!("Duplicate ack for {}", id);
            return;
        }

        if !ready {
            if let Some(session) = self.outgoing.take() {
                info!("{} declined {}", self.peer_id, id);
                let context = release_send(session).await;
                self.emit(TransferEvent::Error {
                    context,
                    message: DECLINED_BY_RECEIVER.to_string(),
                });
            }
            return;
        }

        let Some(source) = send.source.take() else {
            return;
        };
        let chunk_size = send.context.manifest.chunk_size;
        let job = PumpJob {
            session: send.session,
            manifest: send.context.manifest.clone(),
            start: send.next_chunk_index,
            low_watermark: chunk_size as usize * low,
            high_watermark: chunk_size as usize * high,
        };
        debug!(
            "Streaming {} to {} from chunk {}",
            id, self.peer_id, job.start
        );
        let (stop, stop_rx) = watch::channel(false);
        let task = tokio::spawn(pump(
            self.sender.clone(),
            source,
            job,
            stop_rx,
            self.reports.clone(),
        ));
        send.pump = Some(Pump { stop, task });
    }

    async fn handle_report(&mut self, report: PumpReport) {
        match report {
            PumpReport::Progress {
                session,
                chunk_index,
                bytes_sent,
            } => {
                let Some(send) = self.outgoing.as_mut().filter(|s| s.session == session) else {
                    return;
                };
                send.next_chunk_index = chunk_index + 1;
                send.bytes_sent = send.bytes_sent.max(bytes_sent);
                let event = TransferEvent::Progress {
                    context: send.context.clone(),
                    bytes_transferred: send.bytes_sent,
                    total_bytes: send.context.manifest.size,
                    chunk_index,
                };
                self.emit(event);
            }
            PumpReport::Finished { session } => {
                if !self.outgoing.as_ref().is_some_and(|s| s.session == session) {
                    return;
                }
                let Some(send) = self.outgoing.take() else {
                    return;
                };
                self.send_control(&ControlMessage::Eof {
                    id: send.context.transfer_id.clone(),
                });
                let context = release_send(send).await;
                info!("Sent {} to {}", context.manifest.name, self.peer_id);
                self.emit(TransferEvent::Completed {
                    context,
                    artifact: None,
                });
            }
            PumpReport::Failed { session, message } => {
                if !self.outgoing.as_ref().is_some_and(|s| s.session == session) {
                    return;
                }
                let Some(send) = self.outgoing.take() else {
                    return;
                };
                warn!(
                    "Sending {} to {} failed: {}",
                    send.context.transfer_id, self.peer_id, message
                );
                self.send_control(&ControlMessage::Cancel {
                    id: send.context.transfer_id.clone(),
                    reason: Some(message.clone()),
                });
                let context = release_send(send).await;
                self.emit(TransferEvent::Error { context, message });
            }
        }
    }

    // --- receive path ---

    async fn on_meta(&mut self, manifest: Manifest) {
        if let Some(previous) = self.incoming.take() {
            info!(
                "Manifest {} from {} supersedes {}",
                manifest.file_id, self.peer_id, previous.context.transfer_id
            );
            self.interrupt_receive(previous, SUPERSEDED).await;
        }

        let id = manifest.file_id.clone();
        let context = self.context(Direction::Receive, manifest);
        let manifest = &context.manifest;
        if let Err(e) = manifest.validate() {
            warn!("Rejecting manifest from {}: {}", self.peer_id, e);
            self.send_control(&ControlMessage::Ack { id, ready: false });
            self.emit(TransferEvent::Error {
                context,
                message: e.to_string(),
            });
            return;
        }

        let total = manifest.chunk_count();
        let checkpoint = match self.env.checkpoints.get(&id).await {
            Ok(checkpoint) => checkpoint,
            Err(e) => {
                warn!("Reading checkpoint for {} failed: {}", id, e);
                None
            }
        };
        let resume_from = checkpoint
            .filter(|cp| {
                cp.next_chunk_index > 0
                    && cp.next_chunk_index <= total
                    && cp.received_bytes == manifest.bytes_before(cp.next_chunk_index)
            })
            .map_or(0, |cp| cp.next_chunk_index);

        let request = DestinationRequest {
            file_id: id.clone(),
            suggested_name: manifest.name.clone(),
            size: manifest.size,
            mime: manifest.mime.clone(),
            is_archive: manifest.is_archive,
        };
        let mut sink = match self.env.target.choose_destination(&request).await {
            Ok(Some(sink)) => sink,
            Ok(None) => {
                info!("Declined {} from {}", manifest.name, self.peer_id);
                self.send_control(&ControlMessage::Ack { id, ready: false });
                self.emit(TransferEvent::Cancelled {
                    context,
                    reason: Some(DECLINED_LOCALLY.to_string()),
                });
                return;
            }
            Err(e) => {
                self.send_control(&ControlMessage::Ack { id, ready: false });
                self.emit(TransferEvent::Error {
                    context,
                    message: format!("choosing a destination failed: {e}"),
                });
                return;
            }
        };

        let resume_offset = manifest.bytes_before(resume_from);
        let start = match sink.prepare(resume_offset).await {
            Ok(usable) if usable == resume_offset => resume_from,
            Ok(_) => {
                debug!("Destination for {} could not keep prior bytes; restarting", id);
                0
            }
            Err(e) => {
                let _ = sink.abandon().await;
                self.send_control(&ControlMessage::Ack { id, ready: false });
                self.emit(TransferEvent::Error {
                    context,
                    message: format!("preparing the destination failed: {e}"),
                });
                return;
            }
        };

        let mut received = ChunkBitmap::new(total);
        received.fill_prefix(start);
        let bytes_received = manifest.bytes_before(start);
        info!(
            "Receiving {} ({} bytes) from {}",
            manifest.name, manifest.size, self.peer_id
        );
        self.incoming = Some(ReceiveSession {
            context: context.clone(),
            sink,
            received,
            bytes_received,
            since_checkpoint: 0,
        });
        self.emit(TransferEvent::Started(context));

        if start > 0 {
            info!("Resuming {} from chunk {}", id, start);
            self.send_control(&ControlMessage::ResumeReq {
                file_id: id.clone(),
                have_until_chunk: start,
            });
        }
        self.send_control(&ControlMessage::Ack { id, ready: true });
    }

    async fn handle_chunk(&mut self, frame: &[u8]) {
        let Some((index, payload)) = decode_chunk(frame) else {
            warn!("Malformed chunk frame from {} ({} bytes)", self.peer_id, frame.len());
            return;
        };
        let Some(recv) = self.incoming.as_mut() else {
            trace!("Chunk {} from {} outside a transfer; ignored", index, self.peer_id);
            return;
        };

        let manifest = &recv.context.manifest;
        if index >= recv.received.total() {
            debug!("Chunk {} out of range for {}", index, recv.context.transfer_id);
            return;
        }
        if recv.received.contains(index) {
            trace!("Duplicate chunk {} for {}", index, recv.context.transfer_id);
            return;
        }
        if payload.len() != manifest.chunk_len(index) {
            warn!(
                "Chunk {} for {} has {} bytes, expected {}",
                index,
                recv.context.transfer_id,
                payload.len(),
                manifest.chunk_len(index)
            );
            return;
        }

        let offset = manifest.chunk_offset(index);
        let size = manifest.size;
        if let Err(e) = recv.sink.write_at(offset, payload).await {
            if let Some(session) = self.incoming.take() {
                self.fail_receive(session, format!("writing chunk {index} failed: {e}"), true)
                    .await;
            }
            return;
        }
        recv.received.insert(index);
        recv.bytes_received = (recv.bytes_received + payload.len() as u64).min(size);
        recv.since_checkpoint += 1;

        let progress = TransferEvent::Progress {
            context: recv.context.clone(),
            bytes_transferred: recv.bytes_received,
            total_bytes: size,
            chunk_index: index,
        };
        let checkpoint = if recv.since_checkpoint >= self.env.config.checkpoint_interval.max(1) {
            recv.since_checkpoint = 0;
            Some(recv.checkpoint())
        } else {
            None
        };

        if let Some(checkpoint) = checkpoint {
            let saved = match recv.sink.flush().await {
                Ok(()) => self
                    .env
                    .checkpoints
                    .save(&checkpoint)
                    .await
                    .map_err(|e| format!("saving checkpoint failed: {e}")),
                Err(e) => Err(format!("flushing chunk {index} failed: {e}")),
            };
            if let Err(message) = saved {
                if let Some(session) = self.incoming.take() {
                    self.fail_receive(session, message, true).await;
                }
                return;
            }
        }
        self.emit(progress);
    }

    async fn on_eof(&mut self, id: String) {
        if !self
            .incoming
            .as_ref()
            .is_some_and(|recv| recv.context.transfer_id == id)
        {
            debug!("Eof from {} for unknown transfer {}", self.peer_id, id);
            return;
        }
        let Some(mut session) = self.incoming.take() else {
            return;
        };

        if let Some(missing) = session.received.first_missing() {
            self.fail_receive(session, format!("missing chunk at index {missing}"), false)
                .await;
            return;
        }

        let artifact = match session.sink.finalize().await {
            Ok(artifact) => artifact,
            Err(e) => {
                self.fail_receive(session, format!("finalizing the file failed: {e}"), false)
                    .await;
                return;
            }
        };
        if let Err(e) = self.env.checkpoints.clear(&id).await {
            warn!("Clearing checkpoint for {} failed: {}", id, e);
        }
        let artifact =
            unpack_archive(self.env.unpacker.clone(), &session.context.manifest, artifact).await;
        info!(
            "Received {} ({} bytes) from {}",
            session.context.manifest.name, session.context.manifest.size, self.peer_id
        );
        self.emit(TransferEvent::Completed {
            context: session.context,
            artifact: Some(artifact),
        });
    }

    /// Flush progress and stop without clearing the checkpoint.
    async fn interrupt_receive(&mut self, mut session: ReceiveSession, reason: &str) {
        release_sink(self.env.checkpoints.as_ref(), &mut session).await;
        self.emit(TransferEvent::Cancelled {
            context: session.context,
            reason: Some(reason.to_string()),
        });
    }

    async fn fail_receive(&mut self, mut session: ReceiveSession, message: String, notify: bool) {
        warn!(
            "Receiving {} from {} failed: {}",
            session.context.transfer_id, self.peer_id, message
        );
        release_sink(self.env.checkpoints.as_ref(), &mut session).await;
        if notify {
            self.send_control(&ControlMessage::Cancel {
                id: session.context.transfer_id.clone(),
                reason: Some(message.clone()),
            });
        }
        self.emit(TransferEvent::Error {
            context: session.context,
            message,
        });
    }

    async fn discard_receive(&mut self, mut session: ReceiveSession, reason: Option<String>) {
        if let Err(e) = session.sink.abandon().await {
            debug!("Abandoning sink for {} failed: {}", session.context.transfer_id, e);
        }
        if let Err(e) = self.env.checkpoints.clear(&session.context.transfer_id).await {
            warn!(
                "Clearing checkpoint for {} failed: {}",
                session.context.transfer_id, e
            );
        }
        self.emit(TransferEvent::Cancelled {
            context: session.context,
            reason,
        });
    }

    // --- cancellation ---

    async fn cancel_local(&mut self, id: &str, reason: Option<String>) -> bool {
        let mut cancelled = false;
        if self.outgoing.as_ref().is_some_and(|s| s.context.transfer_id == id)
            && let Some(send) = self.outgoing.take()
        {
            info!("Cancelling send of {} to {}", id, self.peer_id);
            // The pump is joined first so no chunk follows the cancel frame.
            let context = release_send(send).await;
            self.send_control(&ControlMessage::Cancel {
                id: id.to_string(),
                reason: reason.clone(),
            });
            self.emit(TransferEvent::Cancelled {
                context,
                reason: reason.clone(),
            });
            cancelled = true;
        }
        if self.incoming.as_ref().is_some_and(|r| r.context.transfer_id == id)
            && let Some(recv) = self.incoming.take()
        {
            info!("Cancelling receive of {} from {}", id, self.peer_id);
            self.send_control(&ControlMessage::Cancel {
                id: id.to_string(),
                reason: reason.clone(),
            });
            self.discard_receive(recv, reason).await;
            cancelled = true;
        }
        cancelled
    }

    async fn on_remote_cancel(&mut self, id: String, reason: Option<String>) {
        let mut matched = false;
        if self.outgoing.as_ref().is_some_and(|s| s.context.transfer_id == id)
            && let Some(send) = self.outgoing.take()
        {
            info!("{} cancelled {}", self.peer_id, id);
            let context = release_send(send).await;
            self.emit(TransferEvent::Cancelled {
                context,
                reason: reason.clone(),
            });
            matched = true;
        }
        if self.incoming.as_ref().is_some_and(|r| r.context.transfer_id == id)
            && let Some(recv) = self.incoming.take()
        {
            info!("{} cancelled {}", self.peer_id, id);
            self.discard_receive(recv, reason).await;
            matched = true;
        }
        if !matched {
            debug!("Cancel from {} for unknown transfer {}; ignored", self.peer_id, id);
        }
    }

    async fn close_all(&mut self, reason: &str) {
        if let Some(send) = self.outgoing.take() {
            let context = release_send(send).await;
            self.emit(TransferEvent::Cancelled {
                context,
                reason: Some(reason.to_string()),
            });
        }
        if let Some(recv) = self.incoming.take() {
            self.interrupt_receive(recv, reason).await;
        }
    }

    async fn handle_text(&mut self, text: &str) {
        let message = match ControlMessage::parse(text) {
            Ok(message) => message,
            Err(e) => {
                warn!("Ignoring control frame from {}: {}", self.peer_id, e);
                return;
            }
        };
        trace!("Received {} from {}", message.message_type(), self.peer_id);

        match message {
            ControlMessage::Meta(manifest) => self.on_meta(manifest).await,
            ControlMessage::Ack { id, ready } => self.on_ack(id, ready).await,
            ControlMessage::Eof { id } => self.on_eof(id).await,
            ControlMessage::Cancel { id, reason } => self.on_remote_cancel(id, reason).await,
            ControlMessage::ResumeReq {
                file_id,
                have_until_chunk,
            } => self.on_resume_req(file_id, have_until_chunk),
            ControlMessage::ResumeOk {
                file_id,
                start_from,
            } => self.on_resume_ok(file_id, start_from).await,
        }
    }

    /// A sender starting below our prefix only repeats chunks we drop as
    /// duplicates. Starting above it would leave a gap, so the receive fails
    /// at once instead of at `eof`.
    async fn on_resume_ok(&mut self, file_id: String, start_from: u32) {
        let Some(have) = self
            .incoming
            .as_ref()
            .filter(|r| r.context.transfer_id == file_id)
            .map(|r| r.received.contiguous_prefix())
        else {
            debug!("resume_ok from {} for unknown transfer {}", self.peer_id, file_id);
            return;
        };
        if start_from <= have {
            debug!("{} resumes {} at chunk {} (have {})", self.peer_id, file_id, start_from, have);
            return;
        }
        if let Some(session) = self.incoming.take() {
            self.fail_receive(
                session,
                format!("sender resumed at chunk {start_from} but only {have} were received"),
                true,
            )
            .await;
        }
    }
}

/// Abandon the sink of an interrupted receive, then persist its contiguous
/// prefix. The checkpoint is only advanced once the sink has written its
/// bytes out.
async fn release_sink(checkpoints: &dyn CheckpointStore, session: &mut ReceiveSession) {
    if let Err(e) = session.sink.abandon().await {
        warn!(
            "Abandoning sink for {} failed: {}; keeping the last checkpoint",
            session.context.transfer_id, e
        );
        return;
    }
    let checkpoint = session.checkpoint();
    if checkpoint.next_chunk_index == 0 {
        return;
    }
    if let Err(e) = checkpoints.save(&checkpoint).await {
        warn!("Saving checkpoint for {} failed: {}", checkpoint.file_id, e);
    }
}

/// Hand a received archive to the unpacker, keeping the archive file when
/// there is no unpacker or unpacking fails.
async fn unpack_archive(
    unpacker: Option<Arc<dyn ArchiveUnpacker>>,
    manifest: &Manifest,
    artifact: SavedArtifact,
) -> SavedArtifact {
    if !manifest.is_archive {
        return artifact;
    }
    let Some(unpacker) = unpacker else {
        return artifact;
    };
    let SavedArtifact::Path(path) = &artifact else {
        return artifact;
    };
    match unpacker
        .unpack(path, manifest.archive_root.as_deref())
        .await
    {
        Ok(dir) => {
            debug!("Unpacked {} into {}", path.display(), dir.display());
            SavedArtifact::Directory(dir)
        }
        Err(e) => {
            warn!(
                "Unpacking {} failed: {}; keeping the archive",
                path.display(),
                e
            );
            artifact
        }
    }
}

/// Stop the pump if one is running and dispose the source.
async fn release_send(mut session: SendSession) -> TransferContext {
    let source = match session.pump.take() {
        Some(pump) => {
            let _ = pump.stop.send(true);
            match pump.task.await {
                Ok(source) => Some(source),
                Err(e) => {
                    warn!("Chunk pump for {} panicked: {}", session.context.transfer_id, e);
                    None
                }
            }
        }
        None => session.source.take(),
    };
    if let Some(mut source) = source {
        dispose_source(&mut source).await;
    }
    session.context
}

async fn dispose_source(source: &mut Box<dyn ChunkSource>) {
    if let Err(e) = source.dispose().await {
        warn!("Disposing source {} failed: {}", source.info().name, e);
    }
}

struct PumpJob {
    session: u64,
    manifest: Manifest,
    start: u32,
    low_watermark: usize,
    high_watermark: usize,
}

/// Stream chunks `job.start..` in index order, pausing while the stream
/// buffers more than the high watermark. Returns the source for disposal.
async fn pump(
    sender: StreamSender,
    mut source: Box<dyn ChunkSource>,
    job: PumpJob,
    mut stop: watch::Receiver<bool>,
    reports: mpsc::UnboundedSender<PumpReport>,
) -> Box<dyn ChunkSource> {
    let PumpJob {
        session,
        manifest,
        start,
        low_watermark,
        high_watermark,
    } = job;
    let fail = |message: String| {
        let _ = reports.send(PumpReport::Failed { session, message });
    };

    let mut bytes_sent = manifest.bytes_before(start);
    for index in start..manifest.chunk_count() {
        if *stop.borrow() {
            return source;
        }

        let len = manifest.chunk_len(index);
        let read = tokio::select! {
            biased;
            _ = stop.changed() => return source,
            read = source.read_chunk(manifest.chunk_offset(index), len) => read,
        };
        let payload = match read {
            Ok(payload) if payload.len() == len => payload,
            Ok(payload) => {
                fail(format!(
                    "short read at chunk {index}: {} of {len} bytes",
                    payload.len()
                ));
                return source;
            }
            Err(e) => {
                fail(format!("reading chunk {index} failed: {e}"));
                return source;
            }
        };

        if sender.buffered_amount() + CHUNK_HEADER_LEN > high_watermark {
            trace!(
                "Backpressure at chunk {}: {} bytes buffered",
                index,
                sender.buffered_amount()
            );
            tokio::select! {
                drained = sender.wait_for_buffer_below(low_watermark) => {
                    if let Err(e) = drained {
                        fail(format!("stream closed while waiting to send: {e}"));
                        return source;
                    }
                }
                _ = stop.changed() => return source,
            }
        }

        if *stop.borrow() {
            return source;
        }
        if let Err(e) = sender.send_binary(encode_chunk(index, &payload)) {
            fail(format!("sending chunk {index} failed: {e}"));
            return source;
        }
        bytes_sent = (bytes_sent + len as u64).min(manifest.size);
        trace!("Sent chunk {} ({} bytes)", index, len);
        let _ = reports.send(PumpReport::Progress {
            session,
            chunk_index: index,
            bytes_sent,
        });
    }

    let _ = reports.send(PumpReport::Finished { session });
    source
}

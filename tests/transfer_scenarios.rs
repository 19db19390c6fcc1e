//! End-to-end transfer scenarios over in-process stream pairs, with real
//! files, directory targets and JSON checkpoints.

use async_trait::async_trait;
use flux_core::transfer::{decode_chunk, encode_chunk};
use flux_core::{ControlMessage, Manifest, TransferConfig, TransferEvent, TransferService};
use flux_files::{
    ArchiveUnpacker, CheckpointStore, DirectoryTarget, FileSource, JsonCheckpointStore,
    MemoryCheckpointStore, MemorySource, MemoryTarget, SavedArtifact, SourceInfo,
};
use flux_integration_tests::{SlowSource, TEST_TIMEOUT, payload, recv_within, terminal_event};
use flux_transport::{DataStream, Frame, StreamConfig, stream_pair};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::timeout;

const CHUNK: u32 = 1024;

fn config() -> TransferConfig {
    TransferConfig {
        chunk_size: CHUNK,
        ..TransferConfig::default()
    }
}

async fn frame(stream: &mut DataStream) -> Frame {
    timeout(TEST_TIMEOUT, stream.recv())
        .await
        .expect("timed out waiting for frame")
        .expect("stream closed")
}

async fn control(stream: &mut DataStream) -> ControlMessage {
    match frame(stream).await {
        Frame::Text(text) => ControlMessage::parse(&text).unwrap(),
        Frame::Binary(_) => panic!("expected a control frame"),
    }
}

fn send_control(stream: &DataStream, message: ControlMessage) {
    stream
        .send(Frame::Text(message.to_text().unwrap()))
        .unwrap();
}

async fn wait_for_progress(events: &mut UnboundedReceiver<TransferEvent>, count: usize) {
    let mut seen = 0;
    while seen < count {
        if let TransferEvent::Progress { .. } = recv_within(events).await {
            seen += 1;
        }
    }
}

// ---------------------------------------------------------------------------
// Scenario A: 5 KiB at 1 KiB chunks, file to file
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_scenario_a_file_to_directory() {
    let src_dir = tempfile::tempdir().unwrap();
    let dst_dir = tempfile::tempdir().unwrap();
    let data = payload(5 * 1024);
    let path = src_dir.path().join("five.bin");
    std::fs::write(&path, &data).unwrap();

    let (sender, mut sender_events) = TransferService::new(
        config(),
        Arc::new(MemoryCheckpointStore::new()),
        Arc::new(MemoryTarget::new()),
        None,
    );
    let checkpoints = Arc::new(MemoryCheckpointStore::new());
    let (receiver, mut receiver_events) = TransferService::new(
        config(),
        checkpoints.clone(),
        Arc::new(DirectoryTarget::new(dst_dir.path())),
        None,
    );
    let (a, b) = stream_pair("file-transfer", StreamConfig::default());
    sender.register_peer("receiver", a).await;
    receiver.register_peer("sender", b).await;

    let source = FileSource::open(&path).await.unwrap();
    let id = sender.send_file("receiver", Box::new(source)).await.unwrap();

    let mut indices = Vec::new();
    let saved = loop {
        match recv_within(&mut receiver_events).await {
            TransferEvent::Started(context) => {
                assert_eq!(context.manifest.total_chunks, 5);
                assert_eq!(context.manifest.size, 5120);
            }
            TransferEvent::Progress { chunk_index, .. } => indices.push(chunk_index),
            TransferEvent::Completed {
                artifact: Some(SavedArtifact::Path(saved)),
                ..
            } => break saved,
            other => panic!("unexpected {other:?}"),
        }
    };
    assert_eq!(indices, vec![0, 1, 2, 3, 4]);
    assert_eq!(saved, dst_dir.path().join("five.bin"));
    assert_eq!(std::fs::read(&saved).unwrap(), data);
    // Only the final file remains; the part file was renamed into place.
    assert_eq!(std::fs::read_dir(dst_dir.path()).unwrap().count(), 1);
    assert_eq!(checkpoints.get(&id).await.unwrap(), None);

    assert!(matches!(
        terminal_event(&mut sender_events).await,
        TransferEvent::Completed { artifact: None, .. }
    ));
}

// ---------------------------------------------------------------------------
// Scenario B: interrupted after three chunks, resumed by a fresh process
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_scenario_b_resume_from_disk() {
    let dst_dir = tempfile::tempdir().unwrap();
    let cp_dir = tempfile::tempdir().unwrap();
    let data = payload(5 * 1024);
    let info = SourceInfo::new("resume.bin", data.len() as u64).with_id("resume-file");
    let manifest = Manifest::for_source(&info, CHUNK).unwrap();

    {
        let store = JsonCheckpointStore::open(cp_dir.path()).await.unwrap();
        let (receiver, mut events) = TransferService::new(
            config(),
            Arc::new(store),
            Arc::new(DirectoryTarget::new(dst_dir.path())),
            None,
        );
        let (local, mut remote) = stream_pair("file-transfer", StreamConfig::default());
        receiver.register_peer("sender", local).await;

        send_control(&remote, ControlMessage::Meta(manifest.clone()));
        assert_eq!(
            control(&mut remote).await,
            ControlMessage::Ack {
                id: "resume-file".into(),
                ready: true
            }
        );
        for index in 0..3u32 {
            let start = index as usize * 1024;
            remote
                .send(Frame::Binary(encode_chunk(index, &data[start..start + 1024])))
                .unwrap();
        }
        wait_for_progress(&mut events, 3).await;
        remote.close();

        match terminal_event(&mut events).await {
            TransferEvent::Cancelled { reason, .. } => {
                assert_eq!(reason.as_deref(), Some("channel closed"));
            }
            other => panic!("unexpected {other:?}"),
        }
        receiver.shutdown().await;
    }

    // A new store over the same directory sees the persisted progress.
    let store = Arc::new(JsonCheckpointStore::open(cp_dir.path()).await.unwrap());
    let checkpoint = store.get("resume-file").await.unwrap().unwrap();
    assert_eq!(checkpoint.next_chunk_index, 3);
    assert_eq!(checkpoint.received_bytes, 3072);

    let (receiver, mut events) = TransferService::new(
        config(),
        store.clone(),
        Arc::new(DirectoryTarget::new(dst_dir.path())),
        None,
    );
    let (local, mut remote) = stream_pair("file-transfer", StreamConfig::default());
    receiver.register_peer("sender", local).await;

    send_control(&remote, ControlMessage::Meta(manifest));
    assert_eq!(
        control(&mut remote).await,
        ControlMessage::ResumeReq {
            file_id: "resume-file".into(),
            have_until_chunk: 3
        }
    );
    assert_eq!(
        control(&mut remote).await,
        ControlMessage::Ack {
            id: "resume-file".into(),
            ready: true
        }
    );
    send_control(
        &remote,
        ControlMessage::ResumeOk {
            file_id: "resume-file".into(),
            start_from: 3,
        },
    );
    remote
        .send(Frame::Binary(encode_chunk(3, &data[3072..4096])))
        .unwrap();
    remote
        .send(Frame::Binary(encode_chunk(4, &data[4096..])))
        .unwrap();
    send_control(
        &remote,
        ControlMessage::Eof {
            id: "resume-file".into(),
        },
    );

    let mut first_progress = None;
    let saved = loop {
        match recv_within(&mut events).await {
            TransferEvent::Progress {
                bytes_transferred,
                chunk_index,
                ..
            } => {
                first_progress.get_or_insert((chunk_index, bytes_transferred));
            }
            TransferEvent::Completed {
                artifact: Some(SavedArtifact::Path(saved)),
                ..
            } => break saved,
            TransferEvent::Started(_) => {}
            other => panic!("unexpected {other:?}"),
        }
    };
    assert_eq!(first_progress, Some((3, 4096)));
    assert_eq!(std::fs::read(saved).unwrap(), data);
    assert_eq!(store.get("resume-file").await.unwrap(), None);
}

#[tokio::test]
async fn test_resume_between_services() {
    let data = payload(8 * 1024 + 17);
    let target = Arc::new(MemoryTarget::new());
    let checkpoints = Arc::new(MemoryCheckpointStore::new());
    let (receiver, mut receiver_events) =
        TransferService::new(config(), checkpoints.clone(), target.clone(), None);
    let (sender, mut sender_events) = TransferService::new(
        config(),
        Arc::new(MemoryCheckpointStore::new()),
        Arc::new(MemoryTarget::new()),
        None,
    );

    // First attempt: interrupted by unbinding the sender's stream.
    let (a, b) = stream_pair("file-transfer", StreamConfig::default());
    sender.register_peer("receiver", a).await;
    receiver.register_peer("sender", b).await;
    let (slow, _) = SlowSource::new("big.bin", data.len(), Duration::from_millis(20));
    let id = sender.send_file("receiver", Box::new(slow)).await.unwrap();
    wait_for_progress(&mut receiver_events, 3).await;
    sender.unregister_peer("receiver").await;
    assert!(matches!(
        terminal_event(&mut receiver_events).await,
        TransferEvent::Cancelled { .. }
    ));
    assert!(matches!(
        terminal_event(&mut sender_events).await,
        TransferEvent::Cancelled { .. }
    ));
    let checkpoint = checkpoints.get(&id).await.unwrap().unwrap();
    assert!(checkpoint.next_chunk_index >= 3);

    // Second attempt over a new stream picks up from the checkpoint.
    let (a, b) = stream_pair("file-transfer", StreamConfig::default());
    sender.register_peer("receiver", a).await;
    receiver.register_peer("sender", b).await;
    let (slow, _) = SlowSource::new("big.bin", data.len(), Duration::ZERO);
    let resumed_id = sender.send_file("receiver", Box::new(slow)).await.unwrap();
    assert_eq!(resumed_id, id);

    let mut first_chunk = None;
    let received = loop {
        match recv_within(&mut receiver_events).await {
            TransferEvent::Progress { chunk_index, .. } => {
                first_chunk.get_or_insert(chunk_index);
            }
            TransferEvent::Completed {
                artifact: Some(SavedArtifact::Bytes { data, .. }),
                ..
            } => break data,
            TransferEvent::Started(_) => {}
            other => panic!("unexpected {other:?}"),
        }
    };
    assert_eq!(first_chunk, Some(checkpoint.next_chunk_index));
    assert_eq!(received, data);
}

// ---------------------------------------------------------------------------
// Scenario C: cancellation mid-transfer
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_scenario_c_cancel_reaches_receiver_once() {
    let checkpoints = Arc::new(MemoryCheckpointStore::new());
    let (receiver, mut receiver_events) = TransferService::new(
        config(),
        checkpoints.clone(),
        Arc::new(MemoryTarget::new()),
        None,
    );
    let (sender, mut sender_events) = TransferService::new(
        config(),
        Arc::new(MemoryCheckpointStore::new()),
        Arc::new(MemoryTarget::new()),
        None,
    );
    let (a, b) = stream_pair("file-transfer", StreamConfig::default());
    sender.register_peer("receiver", a).await;
    receiver.register_peer("sender", b).await;

    let (slow, disposed) = SlowSource::new("big.bin", 64 * 1024, Duration::from_millis(10));
    let id = sender.send_file("receiver", Box::new(slow)).await.unwrap();
    wait_for_progress(&mut receiver_events, 2).await;

    assert!(sender.cancel_transfer(&id, Some("changed my mind".into())).await);
    assert!(!sender.cancel_transfer(&id, None).await);

    match terminal_event(&mut receiver_events).await {
        TransferEvent::Cancelled { context, reason } => {
            assert_eq!(context.transfer_id, id);
            assert_eq!(reason.as_deref(), Some("changed my mind"));
        }
        other => panic!("unexpected {other:?}"),
    }
    assert!(matches!(
        terminal_event(&mut sender_events).await,
        TransferEvent::Cancelled { .. }
    ));
    assert!(disposed.load(Ordering::SeqCst));

    tokio::time::sleep(Duration::from_millis(200)).await;
    while let Ok(event) = receiver_events.try_recv() {
        assert!(!event.is_terminal(), "stray terminal event {event:?}");
    }
    while let Ok(event) = sender_events.try_recv() {
        assert!(!event.is_terminal(), "stray terminal event {event:?}");
    }
    assert_eq!(checkpoints.get(&id).await.unwrap(), None);
}

#[tokio::test]
async fn test_receiver_cancel_stops_sender() {
    let (receiver, mut receiver_events) = TransferService::new(
        config(),
        Arc::new(MemoryCheckpointStore::new()),
        Arc::new(MemoryTarget::new()),
        None,
    );
    let (sender, mut sender_events) = TransferService::new(
        config(),
        Arc::new(MemoryCheckpointStore::new()),
        Arc::new(MemoryTarget::new()),
        None,
    );
    let (a, b) = stream_pair("file-transfer", StreamConfig::default());
    sender.register_peer("receiver", a).await;
    receiver.register_peer("sender", b).await;

    let (slow, disposed) = SlowSource::new("big.bin", 64 * 1024, Duration::from_millis(10));
    let id = sender.send_file("receiver", Box::new(slow)).await.unwrap();
    wait_for_progress(&mut receiver_events, 2).await;

    assert!(receiver.cancel_transfer(&id, None).await);
    assert!(matches!(
        terminal_event(&mut receiver_events).await,
        TransferEvent::Cancelled { .. }
    ));
    assert!(matches!(
        terminal_event(&mut sender_events).await,
        TransferEvent::Cancelled { .. }
    ));
    assert!(disposed.load(Ordering::SeqCst));

    // The peer pair is free for the next transfer.
    let id = sender
        .send_file(
            "receiver",
            Box::new(MemorySource::new("next.txt", payload(3000))),
        )
        .await
        .unwrap();
    match terminal_event(&mut receiver_events).await {
        TransferEvent::Completed { context, .. } => assert_eq!(context.transfer_id, id),
        other => panic!("unexpected {other:?}"),
    }
}

// ---------------------------------------------------------------------------
// Wire order
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_chunks_in_increasing_order_then_eof() {
    let (sender, _events) = TransferService::new(
        config(),
        Arc::new(MemoryCheckpointStore::new()),
        Arc::new(MemoryTarget::new()),
        None,
    );
    let (local, mut remote) = stream_pair("file-transfer", StreamConfig::default());
    sender.register_peer("raw", local).await;

    let data = payload(40 * 1024 + 3);
    let id = sender
        .send_file("raw", Box::new(MemorySource::new("x", data.clone())))
        .await
        .unwrap();
    let ControlMessage::Meta(manifest) = control(&mut remote).await else {
        panic!("expected meta");
    };
    assert_eq!(manifest.total_chunks, 41);
    send_control(
        &remote,
        ControlMessage::Ack {
            id: id.clone(),
            ready: true,
        },
    );

    let mut expected = 0u32;
    let mut rebuilt = Vec::new();
    loop {
        match frame(&mut remote).await {
            Frame::Binary(bytes) => {
                let (index, chunk) = decode_chunk(&bytes).unwrap();
                assert_eq!(index, expected);
                expected += 1;
                rebuilt.extend_from_slice(chunk);
            }
            Frame::Text(text) => {
                assert_eq!(ControlMessage::parse(&text).unwrap(), ControlMessage::Eof { id });
                break;
            }
        }
    }
    assert_eq!(expected, 41);
    assert_eq!(rebuilt, data);
}

// ---------------------------------------------------------------------------
// Folder archives
// ---------------------------------------------------------------------------

/// Copies the archive into `<root>/contents.bin` next to it.
struct CopyUnpacker {
    fail: bool,
}

#[async_trait]
impl ArchiveUnpacker for CopyUnpacker {
    async fn unpack(&self, archive: &Path, root: Option<&str>) -> io::Result<PathBuf> {
        if self.fail {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "corrupt archive"));
        }
        let parent = archive.parent().unwrap_or(Path::new("."));
        let dir = parent.join(root.unwrap_or("unpacked"));
        tokio::fs::create_dir_all(&dir).await?;
        tokio::fs::copy(archive, dir.join("contents.bin")).await?;
        Ok(dir)
    }
}

async fn send_archive(fail: bool) -> (tempfile::TempDir, Vec<u8>, SavedArtifact) {
    let dst_dir = tempfile::tempdir().unwrap();
    let data = payload(6000);
    let (sender, _sender_events) = TransferService::new(
        config(),
        Arc::new(MemoryCheckpointStore::new()),
        Arc::new(MemoryTarget::new()),
        None,
    );
    let unpacker: Arc<dyn ArchiveUnpacker> = Arc::new(CopyUnpacker { fail });
    let (receiver, mut receiver_events) = TransferService::new(
        config(),
        Arc::new(MemoryCheckpointStore::new()),
        Arc::new(DirectoryTarget::new(dst_dir.path())),
        Some(unpacker),
    );
    let (a, b) = stream_pair("file-transfer", StreamConfig::default());
    sender.register_peer("receiver", a).await;
    receiver.register_peer("sender", b).await;

    let info = SourceInfo::new("holiday.zip", data.len() as u64).as_archive("holiday");
    let source = MemorySource::new("holiday.zip", data.clone()).with_info(info);
    sender.send_file("receiver", Box::new(source)).await.unwrap();

    let artifact = match terminal_event(&mut receiver_events).await {
        TransferEvent::Completed {
            context,
            artifact: Some(artifact),
        } => {
            assert!(context.manifest.is_archive);
            assert_eq!(context.manifest.archive_root.as_deref(), Some("holiday"));
            artifact
        }
        other => panic!("unexpected {other:?}"),
    };
    (dst_dir, data, artifact)
}

#[tokio::test]
async fn test_archive_is_unpacked() {
    let (dst_dir, data, artifact) = send_archive(false).await;
    let dir = dst_dir.path().join("holiday");
    assert_eq!(artifact, SavedArtifact::Directory(dir.clone()));
    assert_eq!(std::fs::read(dir.join("contents.bin")).unwrap(), data);
}

#[tokio::test]
async fn test_failed_unpack_keeps_archive() {
    let (dst_dir, data, artifact) = send_archive(true).await;
    let archive = dst_dir.path().join("holiday.zip");
    assert_eq!(artifact, SavedArtifact::Path(archive.clone()));
    assert_eq!(std::fs::read(archive).unwrap(), data);
}

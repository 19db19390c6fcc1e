//! Property-based tests for the transfer engine.

use flux_core::{TransferConfig, TransferEvent, TransferService};
use flux_files::{MemoryCheckpointStore, MemorySource, MemoryTarget, SavedArtifact};
use flux_integration_tests::{payload, recv_within};
use flux_transport::{StreamConfig, stream_pair};
use proptest::prelude::*;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;

struct Outcome {
    progress: Vec<u64>,
    terminal: TransferEvent,
}

async fn collect(events: &mut UnboundedReceiver<TransferEvent>, total: u64) -> Outcome {
    let mut progress = Vec::new();
    loop {
        match recv_within(events).await {
            TransferEvent::Progress {
                bytes_transferred,
                total_bytes,
                ..
            } => {
                assert_eq!(total_bytes, total);
                progress.push(bytes_transferred);
            }
            TransferEvent::Started(_) => {}
            terminal => return Outcome { progress, terminal },
        }
    }
}

fn run_transfer(size: usize, chunk_size: u32) -> (Vec<u8>, Outcome, Outcome) {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .unwrap();
    runtime.block_on(async move {
        let config = TransferConfig {
            chunk_size,
            ..TransferConfig::default()
        };
        let (sender, mut sender_events) = TransferService::new(
            config.clone(),
            Arc::new(MemoryCheckpointStore::new()),
            Arc::new(MemoryTarget::new()),
            None,
        );
        let (receiver, mut receiver_events) = TransferService::new(
            config,
            Arc::new(MemoryCheckpointStore::new()),
            Arc::new(MemoryTarget::new()),
            None,
        );
        let (a, b) = stream_pair("file-transfer", StreamConfig::default());
        sender.register_peer("receiver", a).await;
        receiver.register_peer("sender", b).await;

        let data = payload(size);
        sender
            .send_file("receiver", Box::new(MemorySource::new("prop.bin", data.clone())))
            .await
            .unwrap();

        let received = collect(&mut receiver_events, size as u64).await;
        let sent = collect(&mut sender_events, size as u64).await;
        sender.shutdown().await;
        receiver.shutdown().await;

        // Nothing follows the terminal event.
        while let Ok(event) = receiver_events.try_recv() {
            assert!(!event.is_terminal(), "second terminal event {event:?}");
        }
        (data, received, sent)
    })
}

fn check_progress(progress: &[u64], total: u64) {
    assert!(progress.windows(2).all(|w| w[0] < w[1]), "{progress:?}");
    assert!(progress.iter().all(|&p| p <= total));
    if total > 0 {
        assert_eq!(progress.last().copied(), Some(total));
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn prop_transfer_reassembles_exactly(size in 0usize..20_000, chunk_size in 1u32..4096) {
        let (data, received, sent) = run_transfer(size, chunk_size);

        check_progress(&received.progress, size as u64);
        check_progress(&sent.progress, size as u64);
        let expected_chunks = (size as u64).div_ceil(chunk_size as u64) as usize;
        prop_assert_eq!(received.progress.len(), expected_chunks);

        match received.terminal {
            TransferEvent::Completed {
                artifact: Some(SavedArtifact::Bytes { data: bytes, .. }),
                ..
            } => prop_assert_eq!(bytes, data),
            other => prop_assert!(false, "receiver ended with {:?}", other),
        }
        let sender_completed = matches!(sent.terminal, TransferEvent::Completed { artifact: None, .. });
        prop_assert!(sender_completed);
    }
}

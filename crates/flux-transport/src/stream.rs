//! Ordered message stream between two peers.
//!
//! A stream is created as two halves:
//!
//! - [`DataStream`], the user half: send text/binary frames, receive frames,
//!   observe the buffered (queued but not yet transmitted) byte count.
//! - [`StreamIo`], the transport half: pull outgoing frames, acknowledge them
//!   as transmitted, and deliver incoming frames.
//!
//! Backpressure follows the data-channel model: `send` never blocks, it only
//! grows the buffered amount. Callers that care wait for the buffered amount
//! to fall to a threshold before sending more.

use crate::transport::{TransportError, TransportResult};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::{Notify, mpsc, watch};

/// Default low watermark for direct pushes (1 MiB).
pub const DEFAULT_LOW_WATERMARK: usize = 1024 * 1024;

/// Default high watermark for direct pushes (8 MiB).
pub const DEFAULT_HIGH_WATERMARK: usize = 8 * 1024 * 1024;

/// One message on a data stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// UTF-8 control message
    Text(String),
    /// Raw bytes
    Binary(Vec<u8>),
}

impl Frame {
    /// Payload length in bytes, as counted toward the buffered amount.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Text(s) => s.len(),
            Self::Binary(b) => b.len(),
        }
    }

    /// Whether the payload is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Watermarks for [`StreamSender::send_with_backpressure`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamConfig {
    /// Resume pushing once buffered bytes fall to this level
    pub low_watermark: usize,
    /// Pause pushing while buffered bytes exceed this level
    pub high_watermark: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            low_watermark: DEFAULT_LOW_WATERMARK,
            high_watermark: DEFAULT_HIGH_WATERMARK,
        }
    }
}

struct Shared {
    label: String,
    buffered: AtomicUsize,
    low_threshold: AtomicUsize,
    drained: Notify,
    closed: watch::Sender<bool>,
}

impl Shared {
    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    fn close(&self) {
        self.closed.send_replace(true);
        self.drained.notify_waiters();
    }
}

async fn wait_closed(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|closed| *closed).await;
}

/// Create a connected pair of stream halves.
pub fn channel(label: impl Into<String>, config: StreamConfig) -> (DataStream, StreamIo) {
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let (in_tx, in_rx) = mpsc::unbounded_channel();
    let (closed, closed_rx) = watch::channel(false);
    let shared = Arc::new(Shared {
        label: label.into(),
        buffered: AtomicUsize::new(0),
        low_threshold: AtomicUsize::new(config.low_watermark),
        drained: Notify::new(),
        closed,
    });

    let stream = DataStream {
        sender: StreamSender {
            tx: out_tx,
            shared: Arc::clone(&shared),
            config,
        },
        receiver: StreamReceiver { rx: in_rx },
    };
    let io = StreamIo {
        outgoing: out_rx,
        incoming: Some(in_tx),
        shared,
        closed_rx,
    };
    (stream, io)
}

/// Sending handle of a data stream. Cheap to clone.
#[derive(Clone)]
pub struct StreamSender {
    tx: mpsc::UnboundedSender<Frame>,
    shared: Arc<Shared>,
    config: StreamConfig,
}

impl std::fmt::Debug for StreamSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamSender")
            .field("label", &self.shared.label)
            .field("buffered", &self.buffered_amount())
            .finish()
    }
}

impl StreamSender {
    /// Queue a frame for transmission.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::Closed` if the stream has been closed.
    pub fn send(&self, frame: Frame) -> TransportResult<()> {
        if self.shared.is_closed() {
            return Err(TransportError::Closed);
        }
        let len = frame.len();
        self.shared.buffered.fetch_add(len, Ordering::SeqCst);
        if self.tx.send(frame).is_err() {
            self.shared.buffered.fetch_sub(len, Ordering::SeqCst);
            return Err(TransportError::Closed);
        }
        Ok(())
    }

    /// Queue a text frame.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::Closed` if the stream has been closed.
    pub fn send_text(&self, text: impl Into<String>) -> TransportResult<()> {
        self.send(Frame::Text(text.into()))
    }

    /// Queue a binary frame.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::Closed` if the stream has been closed.
    pub fn send_binary(&self, data: Vec<u8>) -> TransportResult<()> {
        self.send(Frame::Binary(data))
    }

    /// Push a frame, first waiting for the buffer to drain to the low
    /// watermark if it is above the high watermark.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::Closed` if the stream closes while waiting.
    pub async fn send_with_backpressure(&self, frame: Frame) -> TransportResult<()> {
        if self.buffered_amount() > self.config.high_watermark {
            self.wait_for_buffer_below(self.config.low_watermark).await?;
        }
        self.send(frame)
    }

    /// Bytes queued but not yet handed to the network.
    #[must_use]
    pub fn buffered_amount(&self) -> usize {
        self.shared.buffered.load(Ordering::SeqCst)
    }

    /// Set the threshold used by [`Self::buffered_amount_low`].
    pub fn set_buffered_amount_low_threshold(&self, threshold: usize) {
        self.shared.low_threshold.store(threshold, Ordering::SeqCst);
    }

    /// Current low threshold.
    #[must_use]
    pub fn buffered_amount_low_threshold(&self) -> usize {
        self.shared.low_threshold.load(Ordering::SeqCst)
    }

    /// Resolve once the buffered amount is at or below the low threshold.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::Closed` if the stream closes first.
    pub async fn buffered_amount_low(&self) -> TransportResult<()> {
        self.wait_for_buffer_below(self.buffered_amount_low_threshold())
            .await
    }

    /// Resolve once the buffered amount is at or below `threshold`.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::Closed` if the stream closes first.
    pub async fn wait_for_buffer_below(&self, threshold: usize) -> TransportResult<()> {
        loop {
            let notified = self.shared.drained.notified();
            tokio::pin!(notified);
            // Register before checking so a drain between the check and the
            // await is not missed.
            notified.as_mut().enable();

            if self.shared.is_closed() {
                return Err(TransportError::Closed);
            }
            if self.buffered_amount() <= threshold {
                return Ok(());
            }
            notified.await;
        }
    }

    /// Whether the stream has been closed by either half.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Stream label.
    pub fn label(&self) -> &str {
        &self.shared.label
    }

    /// Close the stream. Frames already queued are still flushed.
    pub fn close(&self) {
        self.shared.close();
    }
}

/// Receiving half of a data stream.
#[derive(Debug)]
pub struct StreamReceiver {
    rx: mpsc::UnboundedReceiver<Frame>,
}

impl StreamReceiver {
    /// Next incoming frame, or `None` once the stream is closed.
    pub async fn recv(&mut self) -> Option<Frame> {
        self.rx.recv().await
    }
}

/// Handle that can close a stream without owning either half.
#[derive(Clone)]
pub struct StreamCloser {
    shared: Arc<Shared>,
}

impl StreamCloser {
    /// Close the stream.
    pub fn close(&self) {
        self.shared.close();
    }

    /// Whether the stream is closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }
}

/// User half of a data stream.
#[derive(Debug)]
pub struct DataStream {
    sender: StreamSender,
    receiver: StreamReceiver,
}

impl DataStream {
    /// Stream label.
    pub fn label(&self) -> &str {
        self.sender.label()
    }

    /// Clone of the sending handle.
    pub fn sender(&self) -> StreamSender {
        self.sender.clone()
    }

    /// Handle that closes this stream.
    pub fn closer(&self) -> StreamCloser {
        StreamCloser {
            shared: Arc::clone(&self.sender.shared),
        }
    }

    /// Split into sending and receiving halves.
    pub fn split(self) -> (StreamSender, StreamReceiver) {
        (self.sender, self.receiver)
    }

    /// Queue a frame.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::Closed` if the stream has been closed.
    pub fn send(&self, frame: Frame) -> TransportResult<()> {
        self.sender.send(frame)
    }

    /// Next incoming frame, or `None` once the stream is closed.
    pub async fn recv(&mut self) -> Option<Frame> {
        self.receiver.recv().await
    }

    /// Bytes queued but not yet transmitted.
    #[must_use]
    pub fn buffered_amount(&self) -> usize {
        self.sender.buffered_amount()
    }

    /// Close the stream.
    pub fn close(&self) {
        self.sender.close();
    }
}

/// Transport half of a data stream.
///
/// Dropping it closes the stream: senders fail, waiters wake, and the user
/// half's receiver ends after the frames already delivered.
pub struct StreamIo {
    outgoing: mpsc::UnboundedReceiver<Frame>,
    incoming: Option<mpsc::UnboundedSender<Frame>>,
    shared: Arc<Shared>,
    closed_rx: watch::Receiver<bool>,
}

impl StreamIo {
    /// Next frame to transmit.
    ///
    /// After the stream is closed, frames queued before the close are still
    /// returned; then `None`.
    pub async fn next_outgoing(&mut self) -> Option<Frame> {
        tokio::select! {
            biased;
            frame = self.outgoing.recv() => frame,
            _ = wait_closed(&mut self.closed_rx) => self.outgoing.try_recv().ok(),
        }
    }

    /// Acknowledge `len` bytes as handed to the network.
    pub fn mark_sent(&self, len: usize) {
        let _ = self
            .shared
            .buffered
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| {
                Some(v.saturating_sub(len))
            });
        self.shared.drained.notify_waiters();
    }

    /// Deliver an incoming frame to the user half.
    ///
    /// Returns `false` if the user half is gone or the stream is closed.
    pub fn deliver(&self, frame: Frame) -> bool {
        self.incoming
            .as_ref()
            .is_some_and(|tx| tx.send(frame).is_ok())
    }

    /// Resolve once either half closes the stream.
    pub async fn closed(&mut self) {
        wait_closed(&mut self.closed_rx).await;
    }

    /// Whether the stream is closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Stream label.
    pub fn label(&self) -> &str {
        &self.shared.label
    }

    /// Handle that closes this stream.
    pub fn closer(&self) -> StreamCloser {
        StreamCloser {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Close the stream and stop delivering incoming frames.
    pub fn close(&mut self) {
        self.shared.close();
        self.incoming = None;
    }
}

impl Drop for StreamIo {
    fn drop(&mut self) {
        self.shared.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[test]
    fn test_frame_len() {
        assert_eq!(Frame::Text("abc".into()).len(), 3);
        assert_eq!(Frame::Binary(vec![0; 10]).len(), 10);
        assert!(Frame::Binary(Vec::new()).is_empty());
    }

    #[tokio::test]
    async fn test_buffered_amount_tracks_queue() {
        let (stream, mut io) = channel("test", StreamConfig::default());
        stream.send(Frame::Binary(vec![0; 100])).unwrap();
        stream.send(Frame::Text("hello".into())).unwrap();
        assert_eq!(stream.buffered_amount(), 105);

        let frame = io.next_outgoing().await.unwrap();
        io.mark_sent(frame.len());
        assert_eq!(stream.buffered_amount(), 5);
    }

    #[tokio::test]
    async fn test_wait_for_buffer_below_wakes_on_drain() {
        let (stream, mut io) = channel("test", StreamConfig::default());
        let sender = stream.sender();
        sender.send(Frame::Binary(vec![0; 1000])).unwrap();

        let waiter = tokio::spawn({
            let sender = sender.clone();
            async move { sender.wait_for_buffer_below(0).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        let frame = io.next_outgoing().await.unwrap();
        io.mark_sent(frame.len());
        timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_buffered_amount_low_uses_threshold() {
        let (stream, _io) = channel("test", StreamConfig::default());
        let sender = stream.sender();
        sender.set_buffered_amount_low_threshold(500);
        assert_eq!(sender.buffered_amount_low_threshold(), 500);
        sender.send(Frame::Binary(vec![0; 400])).unwrap();
        timeout(Duration::from_secs(1), sender.buffered_amount_low())
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_waiter_fails_when_closed() {
        let (stream, io) = channel("test", StreamConfig::default());
        let sender = stream.sender();
        sender.send(Frame::Binary(vec![0; 10])).unwrap();
        let waiter = tokio::spawn(async move { sender.wait_for_buffer_below(0).await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        drop(io);
        let result = timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
        assert!(matches!(result, Err(TransportError::Closed)));
    }

    #[tokio::test]
    async fn test_send_after_close_fails() {
        let (stream, _io) = channel("test", StreamConfig::default());
        stream.close();
        assert!(matches!(
            stream.send(Frame::Text("x".into())),
            Err(TransportError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_close_flushes_queued_frames() {
        let (stream, mut io) = channel("test", StreamConfig::default());
        stream.send(Frame::Text("first".into())).unwrap();
        stream.send(Frame::Text("second".into())).unwrap();
        stream.close();

        assert_eq!(io.next_outgoing().await, Some(Frame::Text("first".into())));
        assert_eq!(io.next_outgoing().await, Some(Frame::Text("second".into())));
        assert_eq!(io.next_outgoing().await, None);
    }

    #[tokio::test]
    async fn test_deliver_and_receiver_end() {
        let (mut stream, mut io) = channel("test", StreamConfig::default());
        assert!(io.deliver(Frame::Binary(vec![1, 2, 3])));
        assert_eq!(stream.recv().await, Some(Frame::Binary(vec![1, 2, 3])));

        io.close();
        assert!(!io.deliver(Frame::Binary(vec![4])));
        assert_eq!(stream.recv().await, None);
    }

    #[tokio::test]
    async fn test_send_with_backpressure_blocks_above_high() {
        let config = StreamConfig {
            low_watermark: 10,
            high_watermark: 20,
        };
        let (stream, mut io) = channel("test", config);
        let sender = stream.sender();
        sender.send(Frame::Binary(vec![0; 25])).unwrap();

        let pending = tokio::spawn({
            let sender = sender.clone();
            async move { sender.send_with_backpressure(Frame::Binary(vec![0; 5])).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!pending.is_finished());
        assert_eq!(sender.buffered_amount(), 25);

        let frame = io.next_outgoing().await.unwrap();
        io.mark_sent(frame.len());
        timeout(Duration::from_secs(1), pending)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(sender.buffered_amount(), 5);
    }

    #[tokio::test]
    async fn test_closer_closes_stream() {
        let (stream, mut io) = channel("test", StreamConfig::default());
        let closer = stream.closer();
        assert!(!closer.is_closed());
        closer.close();
        assert!(stream.sender().is_closed());
        timeout(Duration::from_secs(1), io.closed()).await.unwrap();
    }

    mod props {
        use super::*;
        use proptest::prelude::*;
        use std::collections::VecDeque;

        proptest! {
            #[test]
            fn prop_buffered_amount_is_unsent_bytes(
                ops in prop::collection::vec(prop::option::of(0usize..5000), 1..80)
            ) {
                let runtime = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .unwrap();
                runtime.block_on(async {
                    let (stream, mut io) = channel("prop", StreamConfig::default());
                    let mut queued: VecDeque<usize> = VecDeque::new();

                    // `Some(len)` queues a frame, `None` transmits the oldest one.
                    for op in ops {
                        match op {
                            Some(len) => {
                                stream.send(Frame::Binary(vec![0; len])).unwrap();
                                queued.push_back(len);
                            }
                            None => {
                                if let Some(len) = queued.pop_front() {
                                    let frame = io.next_outgoing().await.unwrap();
                                    prop_assert_eq!(frame.len(), len);
                                    io.mark_sent(frame.len());
                                }
                            }
                        }
                        prop_assert_eq!(stream.buffered_amount(), queued.iter().sum::<usize>());
                    }
                    Ok(())
                })?;
            }
        }
    }
}


//! Per-subscriber filtered pipe from the live read firehose to a consumer
//! channel (§4.5). `StateManager` feeds every ingested [`ReadContext`] into
//! each registered stream's inbound channel; `ReadStream` filters by device
//! id (or forwards everything when the filter is empty) and relays to an
//! outbound channel the subscriber reads from.

use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
};

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::{device::DeviceId, metrics::stream as stream_metrics, reading::ReadContext, runtime::Runtime};

const STREAM_CHANNEL_CAPACITY: usize = 128;

static NEXT_STREAM_ID: AtomicU64 = AtomicU64::new(1);

/// One filtered subscription. Obtained via `DataPlane::stream`; the consumer
/// reads from [`ReadStream::recv`] and calls [`ReadStream::close`] (or drops
/// the handle, which closes it implicitly) when done.
pub struct ReadStream {
    id: u64,
    filter: HashSet<DeviceId>,
    inbound_tx: mpsc::Sender<ReadContext>,
    outbound_rx: Mutex<mpsc::Receiver<ReadContext>>,
    closed: Arc<AtomicBool>,
    stop_lock: Arc<Mutex<()>>,
}

impl ReadStream {
    /// Creates a stream and spawns its forwarding task on `rt`. The returned
    /// stream owns the consumer-facing outbound receiver; `inbound_sender`
    /// is what the broadcaster (the state manager) pushes live readings into.
    pub fn spawn<RT: Runtime>(rt: &RT, filter: HashSet<DeviceId>) -> Arc<Self> {
        let id = NEXT_STREAM_ID.fetch_add(1, Ordering::Relaxed);
        let (inbound_tx, inbound_rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        let (outbound_tx, outbound_rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);

        let stream = Arc::new(Self {
            id,
            filter,
            inbound_tx,
            outbound_rx: Mutex::new(outbound_rx),
            closed: Arc::new(AtomicBool::new(false)),
            stop_lock: Arc::new(Mutex::new(())),
        });

        stream_metrics::log_stream_opened();
        let listener = stream.clone();
        rt.spawn("read-stream-listen", async move {
            listener.listen(inbound_rx, outbound_tx).await;
        });

        stream
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Handle the broadcaster uses to push a live [`ReadContext`] at this
    /// stream. Backpressures the broadcaster if the subscriber is slow,
    /// exactly like every other bounded channel in this crate (§5).
    pub fn inbound_sender(&self) -> mpsc::Sender<ReadContext> {
        self.inbound_tx.clone()
    }

    /// Receives the next reading forwarded to this subscriber, or `None`
    /// once the stream is closed and drained.
    pub async fn recv(&self) -> Option<ReadContext> {
        self.outbound_rx.lock().recv().await
    }

    async fn listen(&self, mut inbound_rx: mpsc::Receiver<ReadContext>, outbound_tx: mpsc::Sender<ReadContext>) {
        while let Some(ctx) = inbound_rx.recv().await {
            if self.closed.load(Ordering::Acquire) {
                break;
            }
            if !self.filter.is_empty() && !self.filter.contains(&ctx.device_id) {
                stream_metrics::log_reading_filtered_out();
                continue;
            }
            // Guards the forward against a concurrent `close()` so we never
            // race a send against the outbound receiver being drained (§4.5).
            let send_permitted = {
                let _guard = self.stop_lock.lock();
                !self.closed.load(Ordering::Acquire)
            };
            if !send_permitted {
                break;
            }
            if outbound_tx.send(ctx).await.is_err() {
                break;
            }
            stream_metrics::log_reading_forwarded();
        }
    }

    /// Idempotently closes the stream: marks it closed so `listen` stops
    /// forwarding, then drains any readings already buffered in the outbound
    /// channel before the channel is finally dropped, so a consumer that
    /// calls `recv` immediately after `close` does not block on buffered
    /// data it will never ask for again (§4.5).
    pub fn close(&self) {
        let _guard = self.stop_lock.lock();
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        stream_metrics::log_stream_closed();
        let mut rx = self.outbound_rx.lock();
        rx.close();
        while rx.try_recv().is_ok() {}
    }
}

impl Drop for ReadStream {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{reading::Reading, reading::ReadingValue, runtime::TokioRuntime};

    fn ctx(device_id: &str) -> ReadContext {
        ReadContext::new(
            DeviceId::from(device_id),
            vec![Reading {
                device_id: DeviceId::from(device_id),
                kind: "test".into(),
                unit: None,
                value: ReadingValue::Int(1),
                timestamp: "2020-01-01T00:00:00Z".into(),
                output: None,
            }],
        )
    }

    #[tokio::test]
    async fn empty_filter_forwards_everything() {
        let rt = TokioRuntime::new();
        let stream = ReadStream::spawn(&rt, HashSet::new());
        stream.inbound_sender().send(ctx("dev-1")).await.unwrap();
        stream.inbound_sender().send(ctx("dev-2")).await.unwrap();

        let first = stream.recv().await.unwrap();
        let second = stream.recv().await.unwrap();
        assert_eq!(first.device_id, DeviceId::from("dev-1"));
        assert_eq!(second.device_id, DeviceId::from("dev-2"));
    }

    #[tokio::test]
    async fn nonempty_filter_drops_unmatched_devices() {
        let rt = TokioRuntime::new();
        let mut filter = HashSet::new();
        filter.insert(DeviceId::from("dev-1"));
        let stream = ReadStream::spawn(&rt, filter);

        stream.inbound_sender().send(ctx("dev-2")).await.unwrap();
        stream.inbound_sender().send(ctx("dev-1")).await.unwrap();

        let only = stream.recv().await.unwrap();
        assert_eq!(only.device_id, DeviceId::from("dev-1"));
    }

    #[tokio::test]
    async fn close_is_idempotent_and_stops_forwarding() {
        let rt = TokioRuntime::new();
        let stream = ReadStream::spawn(&rt, HashSet::new());
        stream.close();
        stream.close();
        assert!(stream.recv().await.is_none());
    }
}

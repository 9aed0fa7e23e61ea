//! Thread-safe current-reading store, bounded readings cache, transactions
//! cache, and lazy streaming to consumers (§4.3). Owns `readChan`'s consumer
//! side: the only place the current readings map is ever write-locked.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::Duration,
};

use parking_lot::RwLock;
use tokio::sync::{mpsc, Mutex as AsyncMutex};

use crate::{
    config::PluginSettings,
    device::{DeviceId, DeviceRegistry},
    health::{queue_health, HealthManager},
    metrics::{state as state_metrics, stream as stream_metrics},
    read_stream::ReadStream,
    reading::{ReadContext, Reading, WriteData},
    readings_cache::ReadingsCache,
    runtime::Runtime,
    time::parse_optional_rfc3339,
    transaction::Transaction,
    transactions_cache::TransactionsCache,
};

/// Constructed with plugin settings and a populated device registry; both are
/// required and this consumes an already-validated [`PluginSettings`] (§4.7).
pub struct StateManager<RT: Runtime> {
    rt: RT,
    registry: Arc<dyn DeviceRegistry>,
    current: RwLock<HashMap<DeviceId, Vec<Reading>>>,
    read_tx: mpsc::Sender<ReadContext>,
    read_rx: AsyncMutex<Option<mpsc::Receiver<ReadContext>>>,
    read_queue_capacity: usize,
    readings_cache: Option<Arc<ReadingsCache<RT>>>,
    transactions: Arc<TransactionsCache<RT>>,
    streams: RwLock<HashMap<u64, Arc<ReadStream>>>,
}

impl<RT: Runtime> StateManager<RT> {
    pub fn new(rt: RT, settings: &PluginSettings, registry: Arc<dyn DeviceRegistry>) -> Arc<Self> {
        let (read_tx, read_rx) = mpsc::channel(settings.read.queue_size);
        let readings_cache = settings
            .cache
            .enabled
            .then(|| ReadingsCache::new(rt.clone(), settings.cache.ttl));
        let transactions = TransactionsCache::new(rt.clone(), settings.transaction.ttl);

        Arc::new(Self {
            rt,
            registry,
            current: RwLock::new(HashMap::new()),
            read_tx,
            read_rx: AsyncMutex::new(Some(read_rx)),
            read_queue_capacity: settings.read.queue_size,
            readings_cache,
            transactions,
            streams: RwLock::new(HashMap::new()),
        })
    }

    /// Sender handle the scheduler's read/bulk-read/listen workers push
    /// completed batches into (§4.4.1, §4.4.3).
    pub fn read_sender(&self) -> mpsc::Sender<ReadContext> {
        self.read_tx.clone()
    }

    /// Launches the single consumer task that drains `readChan` forever,
    /// updating the current readings map under a write lock and then
    /// offering the batch to the readings cache and any active streams with
    /// no lock held (§4.3).
    pub async fn start(self: &Arc<Self>) {
        let mut guard = self.read_rx.lock().await;
        let Some(mut rx) = guard.take() else {
            tracing::warn!("StateManager::start called more than once; ignoring");
            return;
        };
        drop(guard);

        let this = self.clone();
        self.rt.spawn("state-manager-consume", async move {
            while let Some(ctx) = rx.recv().await {
                this.ingest(ctx).await;
            }
        });
    }

    async fn ingest(&self, ctx: ReadContext) {
        {
            let mut current = self.current.write();
            current.insert(ctx.device_id.clone(), ctx.readings.clone());
        }
        state_metrics::log_reading_ingested();
        state_metrics::set_current_readings_devices(self.current.read().len() as u64);

        if let Some(cache) = &self.readings_cache {
            cache.put(ctx.clone());
        }

        let senders: Vec<mpsc::Sender<ReadContext>> = self
            .streams
            .read()
            .values()
            .map(|s| s.inbound_sender())
            .collect();
        for sender in senders {
            // Best-effort fan-out: a non-blocking try_send means a slow
            // subscriber backpressures only itself, never the single
            // `readChan` consumer this runs inside of (§4.5, §9) — an
            // awaited send here would stall `ingest`, which would in turn
            // back up `readChan` for every device and handler.
            if let Err(mpsc::error::TrySendError::Full(_)) = sender.try_send(ctx.clone()) {
                stream_metrics::log_reading_dropped_full();
            }
        }
    }

    pub fn get_readings_for_device(&self, id: &DeviceId) -> Option<Vec<Reading>> {
        self.current.read().get(id).cloned()
    }

    pub fn get_readings(&self) -> HashMap<DeviceId, Vec<Reading>> {
        self.current.read().clone()
    }

    pub fn get_outputs_for_device(&self, id: &DeviceId) -> Vec<crate::reading::OutputDescriptor> {
        self.current
            .read()
            .get(id)
            .map(|readings| readings.iter().filter_map(|r| r.output.clone()).collect())
            .unwrap_or_default()
    }

    /// Parses `start`/`end` under RFC3339; on parse failure of either, closes
    /// `out` immediately and returns no data (§4.3, §7 BadTimestamp). When
    /// caching is enabled the dump is delegated to the readings cache;
    /// otherwise one `ReadContext` per device is synthesized by walking the
    /// current readings map.
    pub async fn get_cached_readings(&self, start: &str, end: &str, out: mpsc::Sender<ReadContext>) {
        let (start, end) = match (parse_optional_rfc3339(start), parse_optional_rfc3339(end)) {
            (Ok(start), Ok(end)) => (start, end),
            _ => {
                state_metrics::log_bad_timestamp();
                return;
            },
        };

        if let Some(cache) = &self.readings_cache {
            cache.dump(start, end, &out).await;
            return;
        }

        let snapshot: Vec<(DeviceId, Vec<Reading>)> = self
            .current
            .read()
            .iter()
            .map(|(id, readings)| (id.clone(), readings.clone()))
            .collect();
        for (device_id, readings) in snapshot {
            if self.registry.get(&device_id).is_none() {
                continue;
            }
            if out.send(ReadContext::new(device_id, readings)).await.is_err() {
                return;
            }
        }
    }

    pub fn new_transaction(
        &self,
        timeout: Duration,
        custom_id: Option<String>,
        context: WriteData,
    ) -> crate::error::Result<Arc<Transaction<RT>>> {
        let result = self.transactions.new_transaction(timeout, custom_id, context);
        if result.is_err() {
            state_metrics::log_duplicate_transaction();
        }
        result
    }

    pub fn get_transaction(&self, id: &str) -> Option<Arc<Transaction<RT>>> {
        self.transactions.get(id)
    }

    /// Opens a new filtered read stream and registers it for live fan-out
    /// from `ingest` (§4.5).
    pub fn open_stream(&self, filter: HashSet<DeviceId>) -> Arc<ReadStream> {
        let stream = ReadStream::spawn(&self.rt, filter);
        self.streams.write().insert(stream.id(), stream.clone());
        stream
    }

    /// Closes and unregisters a stream previously returned by `open_stream`.
    pub fn close_stream(&self, stream: &Arc<ReadStream>) {
        stream.close();
        self.streams.write().remove(&stream.id());
    }

    /// Registers the "read queue health" check against `health` (§4.3):
    /// FAILs when `readChan` occupancy exceeds 95%.
    pub fn register_health_check(self: &Arc<Self>, health: &dyn HealthManager) {
        let this = self.clone();
        health.register_periodic_check(
            "read queue health",
            Duration::from_secs(10),
            Arc::new(move || {
                let this = this.clone();
                Box::pin(async move {
                    let used = this.read_queue_capacity - this.read_tx.capacity();
                    state_metrics::set_read_queue_depth(used as u64, this.read_queue_capacity as u64);
                    queue_health(used, this.read_queue_capacity)
                })
            }),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::PluginSettings,
        device::InMemoryDeviceRegistry,
        reading::ReadingValue,
        runtime::TokioRuntime,
    };

    fn reading_ctx(device_id: &str, value: i64) -> ReadContext {
        ReadContext::new(
            DeviceId::from(device_id),
            vec![Reading {
                device_id: DeviceId::from(device_id),
                kind: "test".into(),
                unit: None,
                value: ReadingValue::Int(value),
                timestamp: "2020-01-01T00:00:00Z".into(),
                output: None,
            }],
        )
    }

    #[tokio::test]
    async fn ingest_updates_current_readings() {
        let rt = TokioRuntime::new();
        let registry: Arc<dyn DeviceRegistry> = Arc::new(InMemoryDeviceRegistry::default());
        let mut settings = PluginSettings::default();
        settings.cache.enabled = false;
        let sm = StateManager::new(rt, &settings, registry);
        sm.clone().start().await;

        sm.read_sender().send(reading_ctx("dev-1", 42)).await.unwrap();
        tokio::task::yield_now().await;
        // Give the spawned consumer a chance to run.
        for _ in 0..10 {
            if sm.get_readings_for_device(&DeviceId::from("dev-1")).is_some() {
                break;
            }
            tokio::task::yield_now().await;
        }

        let readings = sm.get_readings_for_device(&DeviceId::from("dev-1")).unwrap();
        assert_eq!(readings.len(), 1);
        assert_eq!(readings[0].value, ReadingValue::Int(42));
    }

    #[tokio::test]
    async fn ingest_never_blocks_on_a_stalled_stream_subscriber() {
        let rt = TokioRuntime::new();
        let registry: Arc<dyn DeviceRegistry> = Arc::new(InMemoryDeviceRegistry::default());
        let mut settings = PluginSettings::default();
        settings.cache.enabled = false;
        settings.read.queue_size = 16;
        let sm = StateManager::new(rt, &settings, registry);
        sm.clone().start().await;

        // Opened but never drained: both its inbound and outbound
        // 128-capacity channels fill up well before this loop is done.
        let stream = sm.open_stream(HashSet::new());

        let send_many = async {
            for i in 0..300 {
                sm.read_sender()
                    .send(reading_ctx(&format!("dev-{i}"), i as i64))
                    .await
                    .unwrap();
            }
        };
        tokio::time::timeout(Duration::from_secs(5), send_many)
            .await
            .expect("a stalled stream subscriber must not block the readChan consumer");

        drop(stream);
    }

    #[tokio::test]
    async fn bad_timestamp_closes_the_channel_with_no_data() {
        let rt = TokioRuntime::new();
        let registry: Arc<dyn DeviceRegistry> = Arc::new(InMemoryDeviceRegistry::default());
        let settings = PluginSettings::default();
        let sm = StateManager::new(rt, &settings, registry);

        let (tx, mut rx) = mpsc::channel(8);
        sm.get_cached_readings("foobar", "", tx).await;
        assert!(rx.recv().await.is_none());
    }
}

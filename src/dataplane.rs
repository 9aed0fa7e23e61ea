//! Façade aggregating the [`Scheduler`], the [`StateManager`], and the
//! embedder's [`DeviceRegistry`] behind the single entry point external RPC
//! handlers call through (§2, §4.4.4). `DataPlane` owns construction order
//! (state manager before scheduler, since the scheduler forwards into the
//! state manager's read channel) and is the only type embedders need to
//! hold onto.

use std::{collections::HashSet, sync::Arc};

use crate::{
    config::PluginSettings,
    device::{DeviceId, DeviceRegistry},
    error::{DataPlaneError, Result},
    health::HealthManager,
    read_stream::ReadStream,
    reading::{ReadContext, Reading, WriteData},
    runtime::Runtime,
    scheduler::{Scheduler, TransformFn, WriteTransactionReceipt},
    state_manager::StateManager,
    transaction::TransactionSnapshot,
};

pub struct DataPlane<RT: Runtime> {
    registry: Arc<dyn DeviceRegistry>,
    state_manager: Arc<StateManager<RT>>,
    scheduler: Arc<Scheduler<RT>>,
}

impl<RT: Runtime> DataPlane<RT> {
    /// Validates `settings`, then constructs the state manager and scheduler
    /// in dependency order (§9: scheduler references state manager
    /// references registry; never the reverse). Fails with
    /// [`DataPlaneError::InvalidSettings`] rather than panicking so an
    /// embedder wiring this up from user-supplied config can surface a
    /// clean error instead of aborting the process (§4.3, §4.7 expansion).
    pub fn new(rt: RT, settings: PluginSettings, registry: Arc<dyn DeviceRegistry>) -> Result<Self> {
        Self::with_transforms(rt, settings, registry, Vec::new())
    }

    pub fn with_transforms(
        rt: RT,
        settings: PluginSettings,
        registry: Arc<dyn DeviceRegistry>,
        transforms: Vec<Arc<TransformFn>>,
    ) -> Result<Self> {
        settings.validate()?;
        let state_manager = StateManager::new(rt.clone(), &settings, registry.clone());
        let scheduler = Scheduler::with_transforms(rt, settings, registry.clone(), state_manager.clone(), transforms);
        Ok(Self {
            registry,
            state_manager,
            scheduler,
        })
    }

    /// Starts the state manager's ingest consumer and the scheduler's read,
    /// write, and listen loops, then registers the two queue-depth health
    /// checks (§4.3, §4.4.4, §4.6).
    pub async fn start(&self, health: &dyn HealthManager) {
        self.state_manager.start().await;
        self.scheduler.start();
        self.state_manager.register_health_check(health);
        self.scheduler.register_health_check(health);
    }

    /// Signals every loop to stop at the top of its next iteration (§4.4.5).
    /// Must be called at most once; see [`Scheduler::stop`].
    pub fn stop(&self) {
        self.scheduler.stop();
    }

    pub fn registry(&self) -> &Arc<dyn DeviceRegistry> {
        &self.registry
    }

    /// Current readings for one device, or `None` if nothing has been read
    /// yet (§4.3 `GetReadingsForDevice`).
    pub fn read(&self, device_id: &DeviceId) -> Option<Vec<Reading>> {
        self.state_manager.get_readings_for_device(device_id)
    }

    /// Shallow copy of the entire current-readings map (§4.3 `GetReadings`).
    pub fn read_all(&self) -> std::collections::HashMap<DeviceId, Vec<Reading>> {
        self.state_manager.get_readings()
    }

    /// Output descriptors attached to a device's current readings (§4.3
    /// `GetOutputsForDevice`).
    pub fn outputs_for_device(&self, device_id: &DeviceId) -> Vec<crate::reading::OutputDescriptor> {
        self.state_manager.get_outputs_for_device(device_id)
    }

    /// Historical readings within `[start, end]` (either may be empty for
    /// unbounded), delivered over `out` which this call closes on every
    /// return path (§4.3 `GetCachedReadings`).
    pub async fn read_cached(&self, start: &str, end: &str, out: tokio::sync::mpsc::Sender<ReadContext>) {
        self.state_manager.get_cached_readings(start, end, out).await;
    }

    /// Enqueues one write per `WriteData` item and returns immediately with
    /// receipts (§4.4.4 `Write`).
    pub async fn write(&self, device_id: &DeviceId, items: Vec<WriteData>) -> Result<Vec<WriteTransactionReceipt>> {
        if items.is_empty() {
            return Err(DataPlaneError::NilData);
        }
        self.scheduler.write(device_id, items).await
    }

    /// As [`Self::write`], but waits for every transaction to reach a
    /// terminal state before returning (§4.4.4 `WriteAndWait`, S4-S6).
    pub async fn write_and_wait(
        &self,
        device_id: &DeviceId,
        items: Vec<WriteData>,
    ) -> Result<Vec<TransactionSnapshot>> {
        if items.is_empty() {
            return Err(DataPlaneError::NilData);
        }
        self.scheduler.write_and_wait(device_id, items).await
    }

    /// Looks up a transaction's latest snapshot without waiting.
    pub fn transaction(&self, id: &str) -> Option<TransactionSnapshot> {
        self.state_manager.get_transaction(id).map(|t| t.encode())
    }

    /// Opens a live, filtered read stream (§4.5). An empty `filter` forwards
    /// every device's readings; a non-empty one restricts to those ids.
    pub fn stream(&self, filter: HashSet<DeviceId>) -> Arc<ReadStream> {
        self.state_manager.open_stream(filter)
    }

    pub fn close_stream(&self, stream: &Arc<ReadStream>) {
        self.state_manager.close_stream(stream);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures::FutureExt;

    use super::*;
    use crate::{
        device::{Device, DeviceHandler, InMemoryDeviceRegistry},
        health::NoopHealthManager,
        reading::ReadingValue,
        runtime::TokioRuntime,
    };

    #[derive(Debug)]
    struct TestDevice {
        id: DeviceId,
        handler: Arc<DeviceHandler>,
    }

    impl Device for TestDevice {
        fn id(&self) -> &DeviceId {
            &self.id
        }

        fn handler(&self) -> &Arc<DeviceHandler> {
            &self.handler
        }

        fn write_timeout(&self) -> Duration {
            Duration::from_secs(1)
        }
    }

    #[tokio::test]
    async fn round_trip_reading_through_the_facade() {
        let rt = TokioRuntime::new();
        let handler = Arc::new(DeviceHandler::new("sensor").with_read(|device| {
            async move {
                Ok(vec![Reading {
                    device_id: device.id().clone(),
                    kind: "value".into(),
                    unit: None,
                    value: ReadingValue::Int(42),
                    timestamp: "2020-01-01T00:00:00Z".into(),
                    output: None,
                }])
            }
            .boxed()
        }));
        let device: Arc<dyn Device> = Arc::new(TestDevice {
            id: DeviceId::from("dev-1"),
            handler: handler.clone(),
        });
        let registry: Arc<dyn DeviceRegistry> = Arc::new(InMemoryDeviceRegistry::new(vec![device], vec![handler]));

        let mut settings = PluginSettings::default();
        settings.cache.enabled = true;
        settings.read.interval = Duration::from_millis(10);

        let plane = DataPlane::new(rt, settings, registry).unwrap();
        plane.start(&NoopHealthManager).await;

        let mut readings = None;
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            if let Some(r) = plane.read(&DeviceId::from("dev-1")) {
                readings = Some(r);
                break;
            }
        }
        let readings = readings.expect("expected a reading within the poll window");
        assert_eq!(readings[0].value, ReadingValue::Int(42));

        let (tx, mut rx) = tokio::sync::mpsc::channel(8);
        plane.read_cached("", "", tx).await;
        let mut saw_dev1 = false;
        while let Some(ctx) = rx.recv().await {
            saw_dev1 |= ctx.device_id == DeviceId::from("dev-1");
        }
        assert!(saw_dev1);
    }

    #[tokio::test]
    async fn write_requires_nonempty_items() {
        let rt = TokioRuntime::new();
        let registry: Arc<dyn DeviceRegistry> = Arc::new(InMemoryDeviceRegistry::default());
        let plane = DataPlane::new(rt, PluginSettings::default(), registry).unwrap();
        let err = plane.write(&DeviceId::from("dev-1"), vec![]).await.unwrap_err();
        assert!(matches!(err, DataPlaneError::NilData));
    }

    #[tokio::test]
    async fn construction_rejects_invalid_settings() {
        let rt = TokioRuntime::new();
        let registry: Arc<dyn DeviceRegistry> = Arc::new(InMemoryDeviceRegistry::default());
        let mut settings = PluginSettings::default();
        settings.read.queue_size = 0;
        assert!(DataPlane::new(rt, settings, registry).is_err());
    }
}

//! Owns the read, write, and listen loops: periodic concurrent reads
//! (per-device and bulk), write queue draining, and continuous listener
//! loops with restart (§4.4). Enforces `mode`, `interval`, `delay`, and the
//! rate limiter; races every write callback against its device's timeout
//! without cancelling it (§4.4.2, §9).

use std::{num::NonZeroU32, sync::Arc, time::Duration};

use governor::Quota;
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};

use crate::{
    config::{LimiterSettings, Mode, PluginSettings},
    device::{Device, DeviceHandler, DeviceRegistry},
    error::{DataPlaneError, Result},
    health::HealthManager,
    metrics::scheduler as scheduler_metrics,
    reading::{ReadContext, WriteContext, WriteData},
    runtime::{acquire_permit, new_rate_limiter, RateLimiter, Runtime, SpawnHandle, WithTimeout},
    state_manager::StateManager,
    transaction::TransactionSnapshot,
};

/// A reading transformation/scaling function (§1, out of scope: supplied by
/// the embedder). Applied in configured order; a failure drops the whole
/// batch rather than forwarding it partially transformed (§7 TransformError).
pub type TransformFn = dyn Fn(crate::reading::Reading) -> std::result::Result<crate::reading::Reading, String>
    + Send
    + Sync;

/// Returned from `Scheduler::write` for each queued item; carries just
/// enough for the caller to look the transaction back up.
#[derive(Clone, Debug)]
pub struct WriteTransactionReceipt {
    pub transaction_id: String,
}

pub struct Scheduler<RT: Runtime> {
    rt: RT,
    settings: PluginSettings,
    registry: Arc<dyn DeviceRegistry>,
    state_manager: Arc<StateManager<RT>>,
    transforms: Vec<Arc<TransformFn>>,
    serial_lock: Arc<AsyncMutex<()>>,
    limiter: Option<Arc<RateLimiter<RT>>>,
    write_tx: mpsc::Sender<WriteContext<RT>>,
    write_rx: AsyncMutex<Option<mpsc::Receiver<WriteContext<RT>>>>,
    write_queue_capacity: usize,
    stop_tx: watch::Sender<bool>,
    stop_rx: watch::Receiver<bool>,
    stopped: std::sync::atomic::AtomicBool,
}

fn build_limiter<RT: Runtime>(rt: RT, settings: &LimiterSettings) -> Option<Arc<RateLimiter<RT>>> {
    if !settings.is_enabled() {
        return None;
    }
    let rate = NonZeroU32::new(settings.rate.max(1)).expect("rate clamped to at least 1");
    let burst = NonZeroU32::new(settings.burst.max(1)).expect("burst clamped to at least 1");
    let quota = Quota::per_second(rate).allow_burst(burst);
    Some(Arc::new(new_rate_limiter(rt, quota)))
}

impl<RT: Runtime> Scheduler<RT> {
    pub fn new(
        rt: RT,
        settings: PluginSettings,
        registry: Arc<dyn DeviceRegistry>,
        state_manager: Arc<StateManager<RT>>,
    ) -> Arc<Self> {
        Self::with_transforms(rt, settings, registry, state_manager, Vec::new())
    }

    pub fn with_transforms(
        rt: RT,
        settings: PluginSettings,
        registry: Arc<dyn DeviceRegistry>,
        state_manager: Arc<StateManager<RT>>,
        transforms: Vec<Arc<TransformFn>>,
    ) -> Arc<Self> {
        let (write_tx, write_rx) = mpsc::channel(settings.write.queue_size);
        let limiter = build_limiter(rt.clone(), &settings.limiter);
        let (stop_tx, stop_rx) = watch::channel(false);

        Arc::new(Self {
            rt,
            write_queue_capacity: settings.write.queue_size,
            settings,
            registry,
            state_manager,
            transforms,
            serial_lock: Arc::new(AsyncMutex::new(())),
            limiter,
            write_tx,
            write_rx: AsyncMutex::new(Some(write_rx)),
            stop_tx,
            stop_rx,
            stopped: std::sync::atomic::AtomicBool::new(false),
        })
    }

    /// Launches the read, write, and listen loops as independent tasks.
    /// Each loop independently honors its own `disable` setting and bails
    /// out if no registered handler can serve it (§4.4.1-4.4.3).
    pub fn start(self: &Arc<Self>) {
        let read = self.clone();
        self.rt.spawn("scheduler-read-loop", async move { read.run_read_loop().await });
        let write = self.clone();
        self.rt.spawn("scheduler-write-loop", async move { write.run_write_loop().await });
        let listen = self.clone();
        self.rt.spawn("scheduler-listen-loop", async move { listen.run_listen_loop().await });
    }

    /// Closes the shared stop signal. Idempotency is the caller's
    /// responsibility: calling this twice is a fatal programming error
    /// (§4.4.5), mirroring a double-close of a Go channel.
    pub fn stop(&self) {
        if self.stopped.swap(true, std::sync::atomic::Ordering::AcqRel) {
            panic!("Scheduler::stop called more than once");
        }
        let _ = self.stop_tx.send(true);
    }

    fn is_stopped(&self) -> bool {
        *self.stop_rx.borrow()
    }

    async fn sleep_unless_stopped(&self, duration: Duration) -> bool {
        if duration.is_zero() {
            return !self.is_stopped();
        }
        let mut stop_rx = self.stop_rx.clone();
        tokio::select! {
            _ = self.rt.wait(duration) => {},
            _ = stop_rx.changed() => {},
        }
        !self.is_stopped()
    }

    fn apply_transforms(
        &self,
        readings: Vec<crate::reading::Reading>,
    ) -> std::result::Result<Vec<crate::reading::Reading>, String> {
        readings
            .into_iter()
            .map(|mut reading| {
                for transform in &self.transforms {
                    reading = transform(reading)?;
                }
                Ok(reading)
            })
            .collect()
    }

    // ---- read loop -----------------------------------------------------

    async fn run_read_loop(self: Arc<Self>) {
        if self.settings.read.disable {
            tracing::warn!("read loop disabled by settings");
            return;
        }
        let can_read = self
            .registry
            .handlers()
            .iter()
            .any(|h| h.can_read() || h.can_bulk_read());
        if !can_read {
            return;
        }

        loop {
            if self.is_stopped() {
                return;
            }

            let mut handles: Vec<Box<dyn SpawnHandle>> = Vec::new();
            let devices = self.registry.devices();
            let handlers = self.registry.handlers();
            scheduler_metrics::log_read_cycle(devices.len() as u64);
            scheduler_metrics::log_bulk_read_cycle(handlers.len() as u64);

            for device in devices {
                let this = self.clone();
                handles.push(self.rt.spawn("scheduler-read-device", async move { this.read_one(device).await }));
            }
            for handler in handlers {
                let this = self.clone();
                handles.push(self.rt.spawn("scheduler-bulk-read", async move { this.bulk_read(handler).await }));
            }
            for handle in handles {
                let _ = handle.join().await;
            }

            if !self.sleep_unless_stopped(self.settings.read.interval).await {
                return;
            }
        }
    }

    async fn read_one(&self, device: Arc<dyn Device>) {
        if let Some(limiter) = &self.limiter {
            acquire_permit(&self.rt, limiter).await;
        }
        // The handler-level bulk-read path covers this device instead.
        if device.is_bulk_readable() {
            return;
        }
        if !device.is_readable() {
            return;
        }

        let _serial_guard = self.acquire_serial_lock().await;

        let read_fn = match &device.handler().read {
            Some(f) => f.clone(),
            None => return,
        };
        match read_fn(device.clone()).await {
            Ok(readings) => self.forward_batch(device.id().clone(), readings).await,
            Err(e) if e.is_unsupported() => {
                scheduler_metrics::log_read_error(true);
            },
            Err(e) => {
                tracing::warn!(device_id = %device.id(), error = %e.message(), "device read failed");
                scheduler_metrics::log_read_error(false);
            },
        }

        if !self.settings.read.delay.is_zero() {
            self.rt.wait(self.settings.read.delay).await;
        }
    }

    async fn bulk_read(&self, handler: Arc<DeviceHandler>) {
        if let Some(limiter) = &self.limiter {
            acquire_permit(&self.rt, limiter).await;
        }
        if !handler.can_bulk_read() {
            return;
        }
        let devices = self.registry.devices_for_handler(&handler.name);
        if devices.is_empty() {
            return;
        }

        let _serial_guard = self.acquire_serial_lock().await;

        let bulk_fn = handler.bulk_read.clone().expect("can_bulk_read implies bulk_read is set");
        match bulk_fn(devices).await {
            Ok(contexts) => {
                for ctx in contexts {
                    self.forward_batch(ctx.device_id, ctx.readings).await;
                }
            },
            Err(e) if e.is_unsupported() => {
                scheduler_metrics::log_read_error(true);
            },
            Err(e) => {
                tracing::warn!(handler = %handler.name, error = %e.message(), "bulk read failed");
                scheduler_metrics::log_read_error(false);
            },
        }

        if !self.settings.read.delay.is_zero() {
            self.rt.wait(self.settings.read.delay).await;
        }
    }

    /// Forwards a transformed batch onto `readChan`, awaited inline so the
    /// caller (`read_one`/`bulk_read`) blocks on backpressure exactly like
    /// any other suspension point (§5 "Channel sends to `readChan`"). In
    /// `mode=serial` this runs while the caller still holds `serial_lock`,
    /// which is the point: a full `readChan` is supposed to pace serial-mode
    /// device I/O, not be dodged by detaching the send onto its own task.
    async fn forward_batch(&self, device_id: crate::device::DeviceId, readings: Vec<crate::reading::Reading>) {
        match self.apply_transforms(readings) {
            Ok(readings) if readings.is_empty() => {},
            Ok(readings) => {
                let ctx = ReadContext::new(device_id, readings);
                if self.state_manager.read_sender().send(ctx).await.is_err() {
                    tracing::warn!("read channel closed while forwarding a batch");
                }
            },
            Err(message) => {
                tracing::warn!(device_id = %device_id, error = %message, "dropping read batch: transform failed");
                scheduler_metrics::log_transform_dropped();
            },
        }
    }

    async fn acquire_serial_lock(&self) -> Option<tokio::sync::OwnedMutexGuard<()>> {
        if self.settings.mode == Mode::Serial {
            Some(self.serial_lock.clone().lock_owned().await)
        } else {
            None
        }
    }

    // ---- write loop ------------------------------------------------------

    async fn run_write_loop(self: Arc<Self>) {
        if self.settings.write.disable {
            return;
        }
        if !self.registry.handlers().iter().any(|h| h.can_write()) {
            return;
        }

        let mut write_rx = {
            let mut guard = self.write_rx.lock().await;
            guard.take().expect("write loop started more than once")
        };

        loop {
            if self.is_stopped() {
                return;
            }

            let mut batch = Vec::new();
            while batch.len() < self.settings.write.batch_size {
                match write_rx.try_recv() {
                    Ok(wc) => batch.push(wc),
                    Err(_) => break,
                }
            }

            if !batch.is_empty() {
                scheduler_metrics::log_write_batch(batch.len() as u64);
                let mut handles: Vec<Box<dyn SpawnHandle>> = Vec::new();
                for wc in batch {
                    let this = self.clone();
                    handles.push(self.rt.spawn("scheduler-write", async move { this.write_one(wc).await }));
                }
                for handle in handles {
                    let _ = handle.join().await;
                }
            }

            if !self.sleep_unless_stopped(self.settings.write.interval).await {
                return;
            }
        }
    }

    async fn write_one(&self, wc: WriteContext<RT>) {
        if let Some(limiter) = &self.limiter {
            acquire_permit(&self.rt, limiter).await;
        }

        let device = match self.registry.get(&wc.device_id) {
            Some(device) if device.is_writable() => device,
            Some(_) => {
                wc.transaction
                    .set_error(format!("device {} is not writable", wc.device_id));
                return;
            },
            None => {
                wc.transaction.set_error(format!("device {} not found", wc.device_id));
                return;
            },
        };

        let _serial_guard = self.acquire_serial_lock().await;

        wc.transaction.set_writing();
        let write_fn = device
            .handler()
            .write
            .clone()
            .expect("is_writable implies a write callback is set");
        let timeout = device.write_timeout();

        // The callback is spawned on its own task rather than raced
        // directly: if the timeout wins, only the waiter stops waiting —
        // the callback keeps running to completion in the background,
        // per the documented non-cancellation limitation (§4.4.2, §9).
        let (result_tx, result_rx) = tokio::sync::oneshot::channel();
        let data = wc.data.clone();
        self.rt.spawn("scheduler-write-callback", async move {
            let result = write_fn(device, data).await;
            let _ = result_tx.send(result);
        });

        let started = self.rt.monotonic_now();
        let outcome = self.rt.with_timeout(timeout, result_rx).await;
        let elapsed = self.rt.monotonic_now().saturating_duration_since(started);

        match outcome {
            Ok(Ok(Ok(()))) => {
                wc.transaction.set_done();
                scheduler_metrics::log_write_outcome("done", elapsed);
            },
            Ok(Ok(Err(e))) => {
                wc.transaction.set_error(e.message());
                scheduler_metrics::log_write_outcome("error", elapsed);
            },
            Ok(Err(_recv_error)) => {
                wc.transaction
                    .set_error("device write callback task was dropped before completing");
                scheduler_metrics::log_write_outcome("error", elapsed);
            },
            Err(_timeout_elapsed) => {
                wc.transaction.set_error("device write timed out");
                scheduler_metrics::log_write_outcome("timeout", elapsed);
            },
        }

        if !self.settings.write.delay.is_zero() {
            self.rt.wait(self.settings.write.delay).await;
        }
    }

    // ---- listen loop -------------------------------------------------------

    async fn run_listen_loop(self: Arc<Self>) {
        if self.settings.listen.disable {
            return;
        }
        for handler in self.registry.handlers() {
            if !handler.can_listen() {
                continue;
            }
            for device in self.registry.devices_for_handler(&handler.name) {
                let this = self.clone();
                let handler = handler.clone();
                self.rt
                    .spawn("scheduler-listen", async move { this.listen_device(handler, device).await });
            }
        }
    }

    async fn listen_device(&self, handler: Arc<DeviceHandler>, device: Arc<dyn Device>) {
        let listen_fn = handler.listen.clone().expect("can_listen implies listen is set");
        let mut restarts: u64 = 0;
        loop {
            if self.is_stopped() {
                return;
            }
            let sender = self.state_manager.read_sender();
            match listen_fn(device.clone(), sender).await {
                Ok(()) => return,
                Err(e) => {
                    restarts += 1;
                    tracing::warn!(
                        device_id = %device.id(),
                        handler = %handler.name,
                        restarts,
                        error = %e.message(),
                        "listener exited with an error; restarting immediately"
                    );
                    scheduler_metrics::log_listener_restart(&handler.name, device.id().as_str());
                },
            }
        }
    }

    // ---- public entry points (§4.4.4) --------------------------------------

    /// Mints a transaction per `WriteData`, enqueues it onto `writeChan`, and
    /// returns receipts without waiting for completion.
    pub async fn write(&self, device_id: &crate::device::DeviceId, items: Vec<WriteData>) -> Result<Vec<WriteTransactionReceipt>> {
        if items.is_empty() {
            return Err(DataPlaneError::NilData);
        }
        let device = self.registry.get(device_id).ok_or(DataPlaneError::NilDevice)?;
        if !device.is_writable() {
            return Err(DataPlaneError::DeviceNotWritable {
                device_id: device_id.to_string(),
            });
        }

        let mut receipts = Vec::with_capacity(items.len());
        for data in items {
            let custom_id = data.transaction_id.clone();
            let timeout = device.write_timeout();
            let txn = self.state_manager.new_transaction(timeout, custom_id, data.clone())?;
            txn.set_pending();
            let wc = WriteContext {
                transaction: txn.clone(),
                device_id: device_id.clone(),
                data,
            };
            self.write_tx.send(wc).await.map_err(|_| DataPlaneError::DeviceIo {
                device_id: device_id.to_string(),
                message: "write queue is closed".into(),
            })?;
            receipts.push(WriteTransactionReceipt {
                transaction_id: txn.id().to_string(),
            });
        }
        Ok(receipts)
    }

    /// As `write`, but waits for every minted transaction's completion
    /// signal before returning final status snapshots (§4.4.4, S4-S6).
    pub async fn write_and_wait(
        &self,
        device_id: &crate::device::DeviceId,
        items: Vec<WriteData>,
    ) -> Result<Vec<TransactionSnapshot>> {
        let receipts = self.write(device_id, items).await?;
        let mut out = Vec::with_capacity(receipts.len());
        for receipt in receipts {
            let txn = self
                .state_manager
                .get_transaction(&receipt.transaction_id)
                .expect("transaction must still be present immediately after being minted");
            let _ = txn.wait().await;
            out.push(txn.encode());
        }
        Ok(out)
    }

    /// Registers the "write queue health" check (§4.4.4): FAILs when
    /// `writeChan` occupancy exceeds 95%.
    pub fn register_health_check(self: &Arc<Self>, health: &dyn HealthManager) {
        let write_tx = self.write_tx.clone();
        let capacity = self.write_queue_capacity;
        health.register_periodic_check(
            "write queue health",
            Duration::from_secs(10),
            Arc::new(move || {
                let write_tx = write_tx.clone();
                Box::pin(async move {
                    let used = capacity - write_tx.capacity();
                    crate::health::queue_health(used, capacity)
                })
            }),
        );
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    use futures::FutureExt;

    use super::*;
    use crate::{
        config::PluginSettings,
        device::{DeviceId, DeviceHandler, HandlerError, InMemoryDeviceRegistry},
        reading::{Reading, ReadingValue},
        runtime::TokioRuntime,
    };

    struct TestDevice {
        id: DeviceId,
        handler: Arc<DeviceHandler>,
        timeout: Duration,
    }

    impl std::fmt::Debug for TestDevice {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("TestDevice").field("id", &self.id).finish()
        }
    }

    impl Device for TestDevice {
        fn id(&self) -> &DeviceId {
            &self.id
        }

        fn handler(&self) -> &Arc<DeviceHandler> {
            &self.handler
        }

        fn write_timeout(&self) -> Duration {
            self.timeout
        }
    }

    #[tokio::test]
    async fn write_and_wait_reaches_done_on_success() {
        let rt = TokioRuntime::new();
        let handler = Arc::new(DeviceHandler::new("test").with_write(|_device, _data| {
            async move { Ok(()) }.boxed()
        }));
        let device: Arc<dyn Device> = Arc::new(TestDevice {
            id: DeviceId::from("dev-1"),
            handler: handler.clone(),
            timeout: Duration::from_secs(60),
        });
        let registry: Arc<dyn DeviceRegistry> =
            Arc::new(InMemoryDeviceRegistry::new(vec![device], vec![handler]));
        let settings = PluginSettings::default();
        let sm = StateManager::new(rt.clone(), &settings, registry.clone());
        sm.clone().start().await;
        let scheduler = Scheduler::new(rt, settings, registry, sm);
        scheduler.start();

        let statuses = scheduler
            .write_and_wait(
                &DeviceId::from("dev-1"),
                vec![WriteData {
                    action: "on".into(),
                    data: vec![],
                    transaction_id: None,
                }],
            )
            .await
            .unwrap();

        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].status, crate::transaction::TransactionStatus::Done);
    }

    #[tokio::test]
    async fn write_and_wait_times_out_without_cancelling_the_callback() {
        let rt = TokioRuntime::new();
        let callback_finished = Arc::new(AtomicUsize::new(0));
        let callback_finished_inner = callback_finished.clone();
        let handler = Arc::new(DeviceHandler::new("slow").with_write(move |_device, _data| {
            let callback_finished = callback_finished_inner.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                callback_finished.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            .boxed()
        }));
        let device: Arc<dyn Device> = Arc::new(TestDevice {
            id: DeviceId::from("dev-1"),
            handler: handler.clone(),
            timeout: Duration::from_millis(5),
        });
        let registry: Arc<dyn DeviceRegistry> =
            Arc::new(InMemoryDeviceRegistry::new(vec![device], vec![handler]));
        let settings = PluginSettings::default();
        let sm = StateManager::new(rt.clone(), &settings, registry.clone());
        sm.clone().start().await;
        let scheduler = Scheduler::new(rt, settings, registry, sm);
        scheduler.start();

        let statuses = scheduler
            .write_and_wait(
                &DeviceId::from("dev-1"),
                vec![WriteData {
                    action: "on".into(),
                    data: vec![],
                    transaction_id: None,
                }],
            )
            .await
            .unwrap();

        assert_eq!(statuses[0].status, crate::transaction::TransactionStatus::Error);
        assert_eq!(statuses[0].message, "device write timed out");

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(callback_finished.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn write_rejects_unwritable_device() {
        let rt = TokioRuntime::new();
        let handler = Arc::new(DeviceHandler::new("read-only").with_read(|_device| {
            async move { Ok(vec![]) }.boxed()
        }));
        let device: Arc<dyn Device> = Arc::new(TestDevice {
            id: DeviceId::from("dev-1"),
            handler: handler.clone(),
            timeout: Duration::from_secs(1),
        });
        let registry: Arc<dyn DeviceRegistry> =
            Arc::new(InMemoryDeviceRegistry::new(vec![device], vec![handler]));
        let settings = PluginSettings::default();
        let sm = StateManager::new(rt.clone(), &settings, registry.clone());
        let scheduler = Scheduler::new(rt, settings, registry, sm);

        let err = scheduler
            .write(
                &DeviceId::from("dev-1"),
                vec![WriteData {
                    action: "on".into(),
                    data: vec![],
                    transaction_id: None,
                }],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DataPlaneError::DeviceNotWritable { .. }));
    }

    #[tokio::test]
    async fn read_one_blocks_on_a_full_read_channel_instead_of_detaching() {
        let rt = TokioRuntime::new();
        let handler = Arc::new(DeviceHandler::new("sensor").with_read(|device| {
            async move {
                Ok(vec![Reading {
                    device_id: device.id().clone(),
                    kind: "value".into(),
                    unit: None,
                    value: ReadingValue::Int(1),
                    timestamp: "2020-01-01T00:00:00Z".into(),
                    output: None,
                }])
            }
            .boxed()
        }));
        let device: Arc<dyn Device> = Arc::new(TestDevice {
            id: DeviceId::from("dev-1"),
            handler: handler.clone(),
            timeout: Duration::from_secs(1),
        });
        let registry: Arc<dyn DeviceRegistry> =
            Arc::new(InMemoryDeviceRegistry::new(vec![device.clone()], vec![handler]));
        let mut settings = PluginSettings::default();
        settings.read.queue_size = 1;
        let sm = StateManager::new(rt.clone(), &settings, registry.clone());
        // No `sm.start()`: nothing ever drains `readChan`, so the one slot
        // fills and stays full for the life of the test.
        let scheduler = Arc::new(Scheduler::new(rt, settings, registry, sm.clone()));

        sm.read_sender()
            .try_send(ReadContext::new(DeviceId::from("filler"), vec![]))
            .unwrap();

        let scheduler_for_task = scheduler.clone();
        let handle = tokio::spawn(async move { scheduler_for_task.read_one(device).await });

        // If `forward_batch` still detached the send onto its own task, this
        // would return well within the timeout regardless of the full
        // channel. Awaited inline, it has to stay pending.
        let outcome = tokio::time::timeout(Duration::from_millis(200), handle).await;
        assert!(
            outcome.is_err(),
            "read_one must block on a full readChan instead of detaching the send"
        );
    }

    #[allow(dead_code)]
    fn assert_unsupported_is_swallowed(_e: HandlerError) {}
}

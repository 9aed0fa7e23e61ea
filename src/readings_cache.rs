//! Time-bucketed bounded cache of historical read contexts (§3, §4.2).
//!
//! Buckets are keyed by the RFC3339Nano timestamp at which a [`ReadContext`]
//! was ingested. Multiple contexts that land in the same bucket (same
//! timestamp) are appended in insertion order; bucket enumeration order
//! itself is unspecified (§4.2, §9 open question).

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use moka::sync::Cache;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::{
    reading::ReadContext,
    runtime::Runtime,
    time::{now_rfc3339nano, parse_rfc3339},
};

type Bucket = Arc<Mutex<Vec<ReadContext>>>;

/// Enabled only when the plugin's `cache.enabled` setting is true (§4.2).
pub struct ReadingsCache<RT: Runtime> {
    rt: RT,
    cache: Cache<String, Bucket>,
}

impl<RT: Runtime> ReadingsCache<RT> {
    pub fn new(rt: RT, ttl: Duration) -> Arc<Self> {
        let cache = Cache::builder().time_to_live(ttl).build();
        let this = Arc::new(Self { rt, cache });

        let sweep_interval = ttl.saturating_mul(2).max(Duration::from_millis(1));
        let sweeper_rt = this.rt.clone();
        let sweeper_cache = this.cache.clone();
        this.rt.spawn("readings-cache-sweeper", async move {
            loop {
                sweeper_rt.wait(sweep_interval).await;
                // Moka already expires lazily on access; this just forces
                // buckets nobody has touched in a while to actually drop,
                // matching §4.2's documented sweeper cadence.
                sweeper_cache.run_pending_tasks();
            }
        });
        this
    }

    /// Appends `ctx` to the bucket for the current wall-clock timestamp,
    /// creating one with a fresh TTL if none exists yet (§4.2).
    pub fn put(&self, ctx: ReadContext) {
        let key = now_rfc3339nano(&self.rt);
        let bucket = self
            .cache
            .entry(key)
            .or_insert_with(|| Arc::new(Mutex::new(Vec::new())))
            .into_value();
        bucket.lock().push(ctx);
    }

    /// Sends every [`ReadContext`] whose bucket timestamp falls within
    /// `[start, end]` (either bound may be absent, meaning unbounded) to
    /// `out`. The caller owns `out` and is responsible for closing it
    /// (dropping the sender) once `dump` returns (§4.2, §4.3).
    pub async fn dump(
        &self,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
        out: &mpsc::Sender<ReadContext>,
    ) {
        for (key, bucket) in self.cache.iter() {
            let ts = match parse_rfc3339(&key) {
                Ok(ts) => ts,
                Err(_) => {
                    tracing::warn!(key = %key, "skipping readings cache bucket with unparseable timestamp");
                    continue;
                },
            };
            if let Some(start) = start {
                if ts < start {
                    continue;
                }
            }
            if let Some(end) = end {
                if ts > end {
                    continue;
                }
            }
            let items: Vec<ReadContext> = bucket.lock().clone();
            for item in items {
                if out.send(item).await.is_err() {
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{device::DeviceId, reading::Reading, runtime::TokioRuntime};

    fn reading_for(device_id: &str) -> ReadContext {
        ReadContext::new(
            DeviceId::from(device_id),
            vec![Reading {
                device_id: DeviceId::from(device_id),
                kind: "test".into(),
                unit: None,
                value: crate::reading::ReadingValue::Int(3),
                timestamp: "2019-03-22T09:48:00Z".into(),
                output: None,
            }],
        )
    }

    #[tokio::test]
    async fn put_then_dump_roundtrips() {
        let rt = TokioRuntime::new();
        let cache = ReadingsCache::new(rt, Duration::from_secs(60));
        cache.put(reading_for("dev-1"));

        let (tx, mut rx) = mpsc::channel(8);
        cache.dump(None, None, &tx).await;
        drop(tx);

        let mut out = Vec::new();
        while let Some(ctx) = rx.recv().await {
            out.push(ctx);
        }
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].device_id, DeviceId::from("dev-1"));
    }

    #[tokio::test]
    async fn dump_skips_unparseable_bucket_keys() {
        let rt = TokioRuntime::new();
        let cache = ReadingsCache::new(rt, Duration::from_secs(60));
        cache.cache.insert(
            "foobar".to_string(),
            Arc::new(Mutex::new(vec![reading_for("123")])),
        );
        cache.cache.insert(
            "2019-03-22T09:48:00Z".to_string(),
            Arc::new(Mutex::new(vec![reading_for("123")])),
        );

        let start = parse_rfc3339("2019-03-22T09:45:00Z").unwrap();
        let end = parse_rfc3339("2019-03-22T09:50:00Z").unwrap();
        let (tx, mut rx) = mpsc::channel(8);
        cache.dump(Some(start), Some(end), &tx).await;
        drop(tx);

        let mut count = 0;
        while rx.recv().await.is_some() {
            count += 1;
        }
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn window_filters_out_of_range_buckets() {
        let rt = TokioRuntime::new();
        let cache = ReadingsCache::new(rt, Duration::from_secs(60));
        for ts in ["2019-03-22T09:40:00Z", "2019-03-22T09:48:00Z", "2019-03-22T09:55:00Z"] {
            cache
                .cache
                .insert(ts.to_string(), Arc::new(Mutex::new(vec![reading_for("123")])));
        }

        let start = parse_rfc3339("2019-03-22T09:45:00Z").unwrap();
        let end = parse_rfc3339("2019-03-22T09:50:00Z").unwrap();
        let (tx, mut rx) = mpsc::channel(8);
        cache.dump(Some(start), Some(end), &tx).await;
        drop(tx);

        let mut count = 0;
        while rx.recv().await.is_some() {
            count += 1;
        }
        assert_eq!(count, 1);
    }
}

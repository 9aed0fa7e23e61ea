//! TTL-bounded store of in-flight and recently completed [`Transaction`]s
//! (§3, §4.3). Entries expire after `transaction.ttl` regardless of terminal
//! status; a background sweeper runs at 2×TTL (mirroring the readings
//! cache's sweeper cadence, §4.2).

use std::{sync::Arc, time::Duration};

use moka::sync::Cache;

use crate::{
    error::{DataPlaneError, Result},
    reading::WriteData,
    runtime::Runtime,
    transaction::Transaction,
};

pub struct TransactionsCache<RT: Runtime> {
    rt: RT,
    cache: Cache<String, Arc<Transaction<RT>>>,
}

impl<RT: Runtime> TransactionsCache<RT> {
    pub fn new(rt: RT, ttl: Duration) -> Arc<Self> {
        let cache = Cache::builder().time_to_live(ttl).build();
        let this = Arc::new(Self { rt, cache });

        let sweep_interval = ttl.saturating_mul(2).max(Duration::from_millis(1));
        let sweeper_rt = this.rt.clone();
        let sweeper_cache = this.cache.clone();
        this.rt.spawn("transactions-cache-sweeper", async move {
            loop {
                sweeper_rt.wait(sweep_interval).await;
                sweeper_cache.run_pending_tasks();
            }
        });
        this
    }

    /// Mints a new transaction with the given write `timeout`. If `custom_id`
    /// is supplied and already present in the cache, fails with
    /// [`DataPlaneError::DuplicateTransaction`] and leaves the existing entry
    /// untouched (§4.3, S6).
    pub fn new_transaction(
        &self,
        timeout: Duration,
        custom_id: Option<String>,
        context: WriteData,
    ) -> Result<Arc<Transaction<RT>>> {
        let id = custom_id.unwrap_or_else(|| self.rt.new_uuid_v4().to_string());
        let txn = Arc::new(Transaction::new(self.rt.clone(), id.clone(), timeout, context));
        let entry = self.cache.entry(id.clone()).or_insert_with(|| txn);
        if !entry.is_fresh() {
            return Err(DataPlaneError::DuplicateTransaction { id });
        }
        Ok(entry.into_value())
    }

    /// Looks up a transaction by id. Returns `None` if absent or expired.
    pub fn get(&self, id: &str) -> Option<Arc<Transaction<RT>>> {
        self.cache.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.cache.contains_key(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::TokioRuntime;

    fn write_data() -> WriteData {
        WriteData {
            action: "on".into(),
            data: vec![],
            transaction_id: None,
        }
    }

    #[tokio::test]
    async fn duplicate_custom_id_is_rejected_without_disturbing_the_first() {
        let rt = TokioRuntime::new();
        let cache = TransactionsCache::new(rt, Duration::from_secs(60));

        let first = cache
            .new_transaction(Duration::from_secs(1), Some("abc123".into()), write_data())
            .unwrap();
        first.set_pending();

        let second = cache.new_transaction(Duration::from_secs(1), Some("abc123".into()), write_data());
        assert!(second.is_err());

        let still_there = cache.get("abc123").unwrap();
        assert_eq!(still_there.status(), crate::transaction::TransactionStatus::Pending);
    }

    #[tokio::test]
    async fn auto_generated_ids_never_collide() {
        let rt = TokioRuntime::new();
        let cache = TransactionsCache::new(rt, Duration::from_secs(60));
        let a = cache.new_transaction(Duration::from_secs(1), None, write_data()).unwrap();
        let b = cache.new_transaction(Duration::from_secs(1), None, write_data()).unwrap();
        assert_ne!(a.id(), b.id());
    }

    #[tokio::test]
    async fn missing_id_returns_none() {
        let rt = TokioRuntime::new();
        let cache = TransactionsCache::new(rt, Duration::from_secs(60));
        assert!(cache.get("nope").is_none());
    }
}

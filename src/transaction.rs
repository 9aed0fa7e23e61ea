//! Write lifecycle object: `Pending -> Writing -> {Done, Error}`, with a
//! one-shot completion signal consumed by `WriteAndWait` (§4.1).

use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

use crate::{
    reading::WriteData,
    runtime::{Runtime, TimeoutElapsed, WithTimeout},
    time::now_rfc3339nano,
};

/// Transaction status. Monotonic except that `Error` is terminal from any
/// non-terminal state (§3). Represented as a tagged variant, not a string, so
/// invalid transitions are unrepresentable in the type (§9).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionStatus {
    Unknown,
    Pending,
    Writing,
    Done,
    Error,
}

impl TransactionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TransactionStatus::Done | TransactionStatus::Error)
    }
}

impl Default for TransactionStatus {
    fn default() -> Self {
        TransactionStatus::Unknown
    }
}

/// Serializable snapshot of a transaction, returned to external callers
/// (§6 "Transaction status snapshot").
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TransactionSnapshot {
    pub id: String,
    pub status: TransactionStatus,
    pub message: String,
    pub created: String,
    pub updated: String,
    pub timeout: Duration,
    pub context: WriteData,
}

struct Mutable {
    status: TransactionStatus,
    message: String,
    updated: String,
}

/// Tracks one queued write request through its lifecycle. Created by
/// `StateManager::new_transaction`; mutated only by the scheduler's write
/// worker for the corresponding `WriteContext`; read by external callers
/// through `DataPlane` and by `WriteAndWait`'s waiters.
pub struct Transaction<RT: Runtime> {
    rt: RT,
    id: String,
    created: String,
    timeout: Duration,
    deadline: tokio::time::Instant,
    context: WriteData,
    mutable: Mutex<Mutable>,
    done: Notify,
    closed: std::sync::atomic::AtomicBool,
}

impl<RT: Runtime> Transaction<RT> {
    pub fn new(rt: RT, id: String, timeout: Duration, context: WriteData) -> Self {
        let created = now_rfc3339nano(&rt);
        let deadline = rt.monotonic_now() + timeout;
        Self {
            id,
            created: created.clone(),
            timeout,
            deadline,
            context,
            mutable: Mutex::new(Mutable {
                status: TransactionStatus::Unknown,
                message: String::new(),
                updated: created,
            }),
            done: Notify::new(),
            closed: std::sync::atomic::AtomicBool::new(false),
            rt,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn status(&self) -> TransactionStatus {
        self.mutable.lock().status
    }

    pub fn context(&self) -> &WriteData {
        &self.context
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn set_status(&self, status: TransactionStatus, message: Option<String>) {
        let mut m = self.mutable.lock();
        if m.status.is_terminal() {
            // Status is monotonic except that `Error` is terminal from any
            // non-terminal state (§3); once Done or Error, further
            // transitions are dropped rather than silently corrupting a
            // snapshot a caller may already be holding.
            return;
        }
        m.status = status;
        if let Some(message) = message {
            m.message = message;
        }
        m.updated = now_rfc3339nano(&self.rt);
        drop(m);
        if status.is_terminal() {
            self.close();
        }
    }

    pub fn set_pending(&self) {
        self.set_status(TransactionStatus::Pending, None);
    }

    pub fn set_writing(&self) {
        self.set_status(TransactionStatus::Writing, None);
    }

    pub fn set_done(&self) {
        self.set_status(TransactionStatus::Done, None);
    }

    pub fn set_error(&self, message: impl Into<String>) {
        self.set_status(TransactionStatus::Error, Some(message.into()));
    }

    pub fn set_message(&self, message: impl Into<String>) {
        self.mutable.lock().message = message.into();
    }

    /// Closes `done`, idempotently: the guard ensures `Notify::notify_waiters`
    /// is never invoked twice for the same transaction (§3 invariant).
    fn close(&self) {
        if self
            .closed
            .compare_exchange(
                false,
                true,
                std::sync::atomic::Ordering::AcqRel,
                std::sync::atomic::Ordering::Acquire,
            )
            .is_ok()
        {
            self.done.notify_waiters();
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(std::sync::atomic::Ordering::Acquire)
    }

    /// Blocks until `done` closes or the transaction's absolute deadline
    /// (`created + timeout`) elapses, whichever comes first. On timeout the
    /// transaction itself is left untouched: per §4.1, only the scheduler's
    /// write worker is permitted to mutate status, so a waiter that observes
    /// a timeout here can only report it, not resolve it. In normal
    /// operation the write worker always closes `done` at-or-before this
    /// deadline, so the timeout branch only fires if a write sat unprocessed
    /// in the queue past its own timeout (a documented queue-backlog
    /// limitation, not a correctness bug).
    pub async fn wait(&self) -> Result<TransactionStatus, TimeoutElapsed> {
        let remaining = self.deadline.saturating_duration_since(self.rt.monotonic_now());
        let wait_for_done = async {
            loop {
                if self.is_closed() {
                    return;
                }
                let notified = self.done.notified();
                if self.is_closed() {
                    return;
                }
                notified.await;
            }
        };
        self.rt.with_timeout(remaining, wait_for_done).await?;
        Ok(self.status())
    }

    pub fn encode(&self) -> TransactionSnapshot {
        let m = self.mutable.lock();
        TransactionSnapshot {
            id: self.id.clone(),
            status: m.status,
            message: m.message.clone(),
            created: self.created.clone(),
            updated: m.updated.clone(),
            timeout: self.timeout,
            context: self.context.clone(),
        }
    }
}

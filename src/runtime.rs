//! Runtime trait abstracting over time, task spawning, and randomness.
//!
//! Every stateful component in this crate (`StateManager`, `Scheduler`,
//! `DataPlane`) is generic over `RT: Runtime` rather than reaching for
//! `tokio::time`/`std::time` directly. This keeps the engine's logic portable
//! between a real executor and a test harness that wants deterministic,
//! instantly-advanceable virtual time (via `tokio::time::pause`).

use std::{
    future::Future,
    ops::Add,
    pin::Pin,
    time::{Duration, SystemTime},
};

use async_trait::async_trait;
use futures::{
    future::{BoxFuture, FusedFuture},
    select_biased, FutureExt,
};
use governor::{middleware::NoOpMiddleware, nanos::Nanos, state::InMemoryState, state::NotKeyed, Quota};
use rand::{RngCore, SeedableRng};
use tokio::time::Instant;

/// Handle to a spawned task. Dropping it does not cancel the task; call
/// `shutdown` explicitly if early cancellation is needed.
pub trait SpawnHandle: Send {
    fn abort(&self);
    fn join(self: Box<Self>) -> BoxFuture<'static, Result<(), JoinError>>;
}

#[derive(thiserror::Error, Debug)]
pub enum JoinError {
    #[error("task was cancelled")]
    Cancelled,
    #[error("task panicked: {0}")]
    Panicked(String),
}

struct TokioSpawnHandle(tokio::task::JoinHandle<()>);

impl SpawnHandle for TokioSpawnHandle {
    fn abort(&self) {
        self.0.abort();
    }

    fn join(self: Box<Self>) -> BoxFuture<'static, Result<(), JoinError>> {
        async move {
            match self.0.await {
                Ok(()) => Ok(()),
                Err(e) if e.is_cancelled() => Err(JoinError::Cancelled),
                Err(e) => Err(JoinError::Panicked(e.to_string())),
            }
        }
        .boxed()
    }
}

/// Abstracts the OS-esque facilities the engine depends on: time, task
/// spawning, and randomness. Cloning a `Runtime` must be cheap (it's threaded
/// through every component by value).
#[async_trait]
pub trait Runtime: Clone + Send + Sync + 'static {
    /// Sleep for the given duration. Returns a fused future so it composes
    /// cleanly inside `select_biased!`.
    fn wait(&self, duration: Duration) -> Pin<Box<dyn FusedFuture<Output = ()> + Send>>;

    /// Spawn a future on the runtime's executor under a task name (used for
    /// diagnostics/metrics labeling).
    fn spawn(&self, name: &'static str, f: impl Future<Output = ()> + Send + 'static) -> Box<dyn SpawnHandle>;

    /// Wall-clock time. Virtualized under test via `tokio::time::pause`.
    fn system_time(&self) -> SystemTime;

    /// Monotonic clock, usable for measuring elapsed durations.
    fn monotonic_now(&self) -> Instant;

    /// Access the runtime's source of randomness.
    fn rng(&self) -> Box<dyn RngCore + Send>;

    fn with_rng<R>(&self, f: impl FnOnce(&mut dyn RngCore) -> R) -> R {
        let mut rng = self.rng();
        f(&mut *rng)
    }

    fn new_uuid_v4(&self) -> uuid::Uuid {
        let mut bytes = [0u8; 16];
        self.rng().fill_bytes(&mut bytes);
        uuid::Builder::from_random_bytes(bytes).into_uuid()
    }
}

/// Race `fut` against a sleep of `duration`; returns `Err(DeviceWriteTimeout)`
/// equivalent (via `Err(TimeoutElapsed)`) if the timer fires first. The racing
/// future is not cancelled on timeout — only the waiter stops waiting; this
/// mirrors the documented write-timeout limitation of the scheduler's write
/// worker (see DESIGN.md).
#[async_trait]
pub trait WithTimeout {
    async fn with_timeout<T: Send>(
        &self,
        duration: Duration,
        fut: impl Future<Output = T> + Send,
    ) -> Result<T, TimeoutElapsed>;
}

#[derive(thiserror::Error, Debug, Clone, Copy)]
#[error("operation timed out after {0:?}")]
pub struct TimeoutElapsed(pub Duration);

#[async_trait]
impl<RT: Runtime> WithTimeout for RT {
    async fn with_timeout<T: Send>(
        &self,
        duration: Duration,
        fut: impl Future<Output = T> + Send,
    ) -> Result<T, TimeoutElapsed> {
        select_biased! {
            result = fut.fuse() => Ok(result),
            _ = self.wait(duration) => Err(TimeoutElapsed(duration)),
        }
    }
}

/// Tokio-backed `Runtime`. Used both in production (real wall-clock sleeps)
/// and in tests run under `#[tokio::test(start_paused = true)]`, where
/// `tokio::time::sleep`/`Instant::now` are transparently virtualized and can
/// be advanced instantly with `tokio::time::advance`.
#[derive(Clone, Default)]
pub struct TokioRuntime {
    _private: (),
}

impl TokioRuntime {
    pub fn new() -> Self {
        Self { _private: () }
    }

    /// Builds a multi-threaded Tokio executor for embedding this crate in a
    /// standalone plugin process. Expected usage:
    ///
    /// ```no_run
    /// use device_dataplane::runtime::TokioRuntime;
    /// fn main() -> anyhow::Result<()> {
    ///     let tokio_rt = TokioRuntime::init_tokio()?;
    ///     tokio_rt.block_on(async {});
    ///     Ok(())
    /// }
    /// ```
    pub fn init_tokio() -> anyhow::Result<tokio::runtime::Runtime> {
        anyhow::ensure!(
            tokio::runtime::Handle::try_current().is_err(),
            "TokioRuntime::init_tokio must not be called from within an existing Tokio context"
        );
        Ok(tokio::runtime::Builder::new_multi_thread().enable_all().build()?)
    }
}

#[async_trait]
impl Runtime for TokioRuntime {
    fn wait(&self, duration: Duration) -> Pin<Box<dyn FusedFuture<Output = ()> + Send>> {
        Box::pin(tokio::time::sleep(duration).fuse())
    }

    fn spawn(&self, name: &'static str, f: impl Future<Output = ()> + Send + 'static) -> Box<dyn SpawnHandle> {
        let handle = tokio::spawn(async move {
            tracing::trace!(task = name, "spawned task starting");
            f.await;
            tracing::trace!(task = name, "spawned task finished");
        });
        Box::new(TokioSpawnHandle(handle))
    }

    fn system_time(&self) -> SystemTime {
        SystemTime::now()
    }

    fn monotonic_now(&self) -> Instant {
        Instant::now()
    }

    fn rng(&self) -> Box<dyn RngCore + Send> {
        Box::new(rand::rngs::StdRng::from_entropy())
    }
}

/// Adapts a [`Runtime`]'s monotonic clock to `governor`'s `Clock` trait so the
/// scheduler's rate limiter advances in lockstep with virtualized test time
/// instead of reaching for `std::time::Instant` on its own.
#[derive(Clone)]
pub struct RuntimeClock<RT: Runtime> {
    runtime: RT,
}

pub type RateLimiter<RT> = governor::RateLimiter<
    NotKeyed,
    InMemoryState,
    RuntimeClock<RT>,
    NoOpMiddleware<<RuntimeClock<RT> as governor::clock::Clock>::Instant>,
>;

/// Builds a direct (unkeyed) token-bucket rate limiter driven by `rt`'s clock.
pub fn new_rate_limiter<RT: Runtime>(rt: RT, quota: Quota) -> RateLimiter<RT> {
    governor::RateLimiter::direct_with_clock(quota, &RuntimeClock { runtime: rt })
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, PartialOrd, Ord, Hash)]
pub struct GovernorInstant(Instant);

impl<RT: Runtime> governor::clock::Clock for RuntimeClock<RT> {
    type Instant = GovernorInstant;

    fn now(&self) -> Self::Instant {
        GovernorInstant(self.runtime.monotonic_now())
    }
}

impl governor::clock::Reference for GovernorInstant {
    fn duration_since(&self, earlier: Self) -> Nanos {
        if earlier.0 < self.0 {
            (self.0 - earlier.0).into()
        } else {
            Nanos::from(Duration::ZERO)
        }
    }

    fn saturating_sub(&self, duration: Nanos) -> Self {
        self.0
            .checked_sub(duration.into())
            .map(GovernorInstant)
            .unwrap_or(*self)
    }
}

impl Add<Nanos> for GovernorInstant {
    type Output = GovernorInstant;

    fn add(self, rhs: Nanos) -> Self::Output {
        GovernorInstant(self.0 + Duration::from(rhs))
    }
}

impl<RT: Runtime> governor::clock::ReasonablyRealtime for RuntimeClock<RT> {}

/// Blocks until the rate limiter grants a permit, sleeping on `rt`'s
/// (possibly virtualized) clock between retries rather than governor's own
/// jitter/backoff loop.
pub async fn acquire_permit<RT: Runtime>(rt: &RT, limiter: &RateLimiter<RT>) {
    loop {
        match limiter.check() {
            Ok(()) => return,
            Err(not_until) => {
                let clock = RuntimeClock { runtime: rt.clone() };
                let wait = not_until.wait_time_from(governor::clock::Clock::now(&clock));
                rt.wait(wait).await;
            },
        }
    }
}

//! Inbound Worker Pool
//!
//! Bounded executor for inbound realtime frames. Admission follows the
//! classic executor contract:
//!
//! 1. fewer than `core_size` workers: start a worker for the job
//! 2. otherwise, queue has room: enqueue
//! 3. otherwise, fewer than `max_size` workers: start a worker for the job
//! 4. otherwise: reject with [`SaturationError`]
//!
//! Workers above `core_size` retire after `keep_alive` without work.
//!
//! A [`Sequencer`] runs its jobs on the pool one at a time in submission
//! order. Each realtime connection owns one, so frames from a single client
//! are handled in the order they arrived.

use futures_util::FutureExt;
use std::collections::VecDeque;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tokio::sync::Notify;
use tracing::{debug, error, info};

use crate::config::InboundPoolConfig;

/// A unit of inbound work.
pub type Job = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Rejection diagnostic.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error(
    "inbound pool saturated: activeCount={active_count}, poolSize={pool_size}, maxPoolSize={max_pool_size}, \
     queueSize={queue_size}, queueCapacity={queue_capacity}; suspected cause: slow frame handlers or a \
     message burst; remediation: raise INBOUND_MAX_POOL_SIZE or INBOUND_QUEUE_CAPACITY, or reduce per-frame work"
)]
pub struct SaturationError {
    /// Workers running a job.
    pub active_count: usize,
    /// Workers alive.
    pub pool_size: usize,
    /// Worker ceiling.
    pub max_pool_size: usize,
    /// Jobs waiting.
    pub queue_size: usize,
    /// Queue bound.
    pub queue_capacity: usize,
}

/// Point-in-time counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Workers running a job.
    pub active_count: usize,
    /// Workers alive.
    pub pool_size: usize,
    /// Jobs waiting.
    pub queue_size: usize,
    /// Jobs finished since start.
    pub completed: u64,
}

#[derive(Default)]
struct PoolState {
    queue: VecDeque<Job>,
    workers: usize,
    shutdown: bool,
}

struct Shared {
    config: InboundPoolConfig,
    state: Mutex<PoolState>,
    notify: Notify,
    active: AtomicUsize,
    completed: AtomicU64,
}

// jobs never run under these locks, so a poisoned guard is still consistent
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        lock(&self.state)
    }
}

/// Bounded pool for inbound frames.
#[derive(Clone)]
pub struct InboundPool {
    shared: Arc<Shared>,
}

impl InboundPool {
    /// Pool with the given bounds. Workers start lazily.
    pub fn new(config: InboundPoolConfig) -> Self {
        info!(
            "Inbound pool: core={}, max={}, queue={}, keepAlive={:?}",
            config.core_size, config.max_size, config.queue_capacity, config.keep_alive
        );
        Self {
            shared: Arc::new(Shared {
                config,
                state: Mutex::new(PoolState::default()),
                notify: Notify::new(),
                active: AtomicUsize::new(0),
                completed: AtomicU64::new(0),
            }),
        }
    }

    /// Submit a job or reject it.
    pub fn submit<F>(&self, job: F) -> Result<(), SaturationError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let job: Job = Box::pin(job);
        let config = &self.shared.config;
        let mut state = self.shared.lock();

        if !state.shutdown {
            if state.workers < config.core_size {
                state.workers += 1;
                self.spawn_worker(Some(job));
                return Ok(());
            }
            if state.queue.len() < config.queue_capacity {
                state.queue.push_back(job);
                drop(state);
                self.shared.notify.notify_one();
                return Ok(());
            }
            if state.workers < config.max_size {
                state.workers += 1;
                self.spawn_worker(Some(job));
                return Ok(());
            }
        }

        let err = SaturationError {
            active_count: self.shared.active.load(Ordering::Relaxed),
            pool_size: state.workers,
            max_pool_size: config.max_size,
            queue_size: state.queue.len(),
            queue_capacity: config.queue_capacity,
        };
        error!("{}", err);
        Err(err)
    }

    /// A new, idle [`Sequencer`] backed by this pool.
    pub fn sequencer(&self) -> Sequencer {
        Sequencer {
            pool: self.clone(),
            lane: Arc::new(Mutex::new(Lane::default())),
        }
    }

    /// Counters.
    pub fn stats(&self) -> PoolStats {
        let state = self.shared.lock();
        PoolStats {
            active_count: self.shared.active.load(Ordering::Relaxed),
            pool_size: state.workers,
            queue_size: state.queue.len(),
            completed: self.shared.completed.load(Ordering::Relaxed),
        }
    }

    /// Stop accepting jobs. Queued jobs still run, then workers exit.
    pub fn shutdown(&self) {
        self.shared.lock().shutdown = true;
        self.shared.notify.notify_waiters();
        info!("Inbound pool shutting down");
    }

    fn spawn_worker(&self, first: Option<Job>) {
        let shared = self.shared.clone();
        tokio::spawn(Self::worker(shared, first));
    }

    async fn worker(shared: Arc<Shared>, mut first: Option<Job>) {
        loop {
            let job = match first.take() {
                Some(job) => job,
                None => match Self::next_job(&shared).await {
                    Some(job) => job,
                    None => break,
                },
            };

            shared.active.fetch_add(1, Ordering::Relaxed);
            if AssertUnwindSafe(job).catch_unwind().await.is_err() {
                error!("Inbound job panicked");
            }
            shared.active.fetch_sub(1, Ordering::Relaxed);
            shared.completed.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Next queued job, or `None` when this worker should exit. The worker
    /// count is decremented before returning `None`.
    async fn next_job(shared: &Shared) -> Option<Job> {
        loop {
            let notified = shared.notify.notified();
            let surplus = {
                let mut state = shared.lock();
                if let Some(job) = state.queue.pop_front() {
                    return Some(job);
                }
                if state.shutdown {
                    state.workers -= 1;
                    return None;
                }
                state.workers > shared.config.core_size
            };

            if !surplus {
                notified.await;
                continue;
            }

            if tokio::time::timeout(shared.config.keep_alive, notified).await.is_err() {
                let mut state = shared.lock();
                if state.queue.is_empty() && state.workers > shared.config.core_size {
                    state.workers -= 1;
                    debug!("Idle inbound worker retired ({} left)", state.workers);
                    return None;
                }
            }
        }
    }
}

#[derive(Default)]
struct Lane {
    pending: VecDeque<Job>,
    draining: bool,
}

/// Ordered submission onto an [`InboundPool`].
///
/// At most one drain task per sequencer is in the pool at a time. The backlog
/// behind it is bounded by the pool's queue capacity (at least one).
#[derive(Clone)]
pub struct Sequencer {
    pool: InboundPool,
    lane: Arc<Mutex<Lane>>,
}

impl Sequencer {
    /// Queue `job` behind earlier jobs of this sequencer, or reject it.
    pub fn submit<F>(&self, job: F) -> Result<(), SaturationError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut lane = lock(&self.lane);
        if lane.draining {
            let capacity = self.pool.shared.config.queue_capacity.max(1);
            if lane.pending.len() >= capacity {
                let stats = self.pool.stats();
                let err = SaturationError {
                    active_count: stats.active_count,
                    pool_size: stats.pool_size,
                    max_pool_size: self.pool.shared.config.max_size,
                    queue_size: lane.pending.len(),
                    queue_capacity: capacity,
                };
                error!("Connection backlog full: {}", err);
                return Err(err);
            }
            lane.pending.push_back(Box::pin(job));
            return Ok(());
        }

        lane.pending.push_back(Box::pin(job));
        lane.draining = true;
        drop(lane);

        if let Err(err) = self.pool.submit(Self::drain(self.lane.clone())) {
            let mut lane = lock(&self.lane);
            lane.pending.clear();
            lane.draining = false;
            return Err(err);
        }
        Ok(())
    }

    async fn drain(lane: Arc<Mutex<Lane>>) {
        loop {
            let job = {
                let mut lane = lock(&lane);
                match lane.pending.pop_front() {
                    Some(job) => job,
                    None => {
                        lane.draining = false;
                        return;
                    }
                }
            };
            if AssertUnwindSafe(job).catch_unwind().await.is_err() {
                error!("Inbound job panicked");
            }
        }
    }
}

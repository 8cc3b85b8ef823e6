//! 🏊 The worker pool: a few workers, a queue, and a bouncer at the door.
//!
//! 🎬 *[a dispatcher approaches the pool with a sync job]*
//! *[the bouncer checks the list: max_threads running, max_queue waiting]*
//! *["sorry pal, we're full. try again next poll."]*
//!
//! The door policy is a reservation: [`WorkerPool::try_reserve`] hands out a [`PoolSlot`]
//! while `running + queued < max_threads + max_queue`, and only a slot can submit.
//! Reserving first means the dispatcher knows there's room before it claims a connector.
//!
//! Workers come and go: `min_threads` stay forever, more are spawned while there's queued
//! work and fewer than `max_threads` are alive, and extras leave after `idle_time_secs`
//! of boredom. A task that errors or panics is logged and forgotten, the worker lives on.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::Result;
use async_channel::{Receiver, Sender};
use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::workers::{PoolWorker, Worker};

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct PoolConfig {
    #[serde(default)]
    pub min_threads: usize,
    #[serde(default = "default_max_threads")]
    pub max_threads: usize,
    #[serde(default = "default_max_queue")]
    pub max_queue: usize,
    #[serde(default = "default_idle_time_secs")]
    pub idle_time_secs: u64,
}

fn default_max_threads() -> usize {
    5
}

fn default_max_queue() -> usize {
    100
}

fn default_idle_time_secs() -> u64 {
    5
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_threads: 0,
            max_threads: default_max_threads(),
            max_queue: default_max_queue(),
            idle_time_secs: default_idle_time_secs(),
        }
    }
}

impl PoolConfig {
    pub fn capacity(&self) -> usize {
        self.max_threads + self.max_queue
    }
}

/// 🚦 No room at the inn.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("🚦 Worker pool is saturated: {reserved} tasks running or queued, capacity is {capacity}")]
pub struct PoolSaturated {
    pub reserved: usize,
    pub capacity: usize,
}

/// 🎯 Something a pool worker can run. Runs once, consumes itself.
#[async_trait]
pub trait PoolTask: Send + 'static {
    /// for the logs
    fn describe(&self) -> String;
    async fn run(self) -> Result<()>;
}

pub(crate) struct PoolShared<T> {
    pub(crate) config: PoolConfig,
    pub(crate) tx: Sender<T>,
    pub(crate) rx: Receiver<T>,
    // queued + running
    pub(crate) reserved: AtomicUsize,
    pub(crate) live_workers: AtomicUsize,
    pub(crate) idle_workers: AtomicUsize,
}

impl<T> PoolShared<T> {
    /// An idle worker above the minimum may leave. Only one of them gets to decide at a time.
    pub(crate) fn try_retire(&self) -> bool {
        let min = self.config.min_threads;
        let retired = self
            .live_workers
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |live| (live > min).then(|| live - 1))
            .is_ok();
        if !retired {
            return false;
        }
        // a submit that saw a full pool before we left won't grow it, so somebody has to stay
        if !self.rx.is_empty() {
            let max = self.config.max_threads;
            let rejoined = self
                .live_workers
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |live| (live < max).then_some(live + 1))
                .is_ok();
            return !rejoined;
        }
        true
    }

    pub(crate) fn task_done(&self) {
        self.reserved.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct WorkerPool<T: PoolTask> {
    shared: Arc<PoolShared<T>>,
    handles: Arc<Mutex<Vec<JoinHandle<Result<()>>>>>,
}

impl<T: PoolTask> fmt::Debug for WorkerPool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPool")
            .field("config", &self.shared.config)
            .field("reserved", &self.reserved())
            .field("live_workers", &self.live_workers())
            .finish()
    }
}

impl<T: PoolTask> WorkerPool<T> {
    /// Must be called inside a tokio runtime when `min_threads > 0`.
    pub fn new(config: PoolConfig) -> Self {
        let (tx, rx) = async_channel::unbounded();
        let pool = Self {
            shared: Arc::new(PoolShared {
                config,
                tx,
                rx,
                reserved: AtomicUsize::new(0),
                live_workers: AtomicUsize::new(0),
                idle_workers: AtomicUsize::new(0),
            }),
            handles: Arc::new(Mutex::new(Vec::new())),
        };
        for _ in 0..pool.shared.config.min_threads {
            pool.shared.live_workers.fetch_add(1, Ordering::SeqCst);
            pool.spawn_worker();
        }
        pool
    }

    /// 🎟️ Ask for room before doing anything expensive.
    pub fn try_reserve(&self) -> Result<PoolSlot<T>, PoolSaturated> {
        let capacity = self.shared.config.capacity();
        self.shared
            .reserved
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |reserved| {
                (reserved < capacity).then_some(reserved + 1)
            })
            .map_err(|reserved| PoolSaturated { reserved, capacity })?;
        Ok(PoolSlot {
            pool: self.clone_handle(),
            used: false,
        })
    }

    pub fn reserved(&self) -> usize {
        self.shared.reserved.load(Ordering::SeqCst)
    }

    pub fn live_workers(&self) -> usize {
        self.shared.live_workers.load(Ordering::SeqCst)
    }

    /// 🛑 No new work. Wait up to `timeout` for the workers to drain the queue, then abort.
    pub async fn shutdown(&self, timeout: Duration) -> Result<()> {
        self.shared.tx.close();
        let handles: Vec<JoinHandle<Result<()>>> = {
            let mut handles = self.handles.lock().unwrap_or_else(PoisonError::into_inner);
            std::mem::take(&mut *handles)
        };
        let abort_handles: Vec<_> = handles.iter().map(JoinHandle::abort_handle).collect();
        debug!("🛑 Waiting up to {:?} for {} workers to finish", timeout, handles.len());

        if tokio::time::timeout(timeout, futures::future::join_all(handles)).await.is_err() {
            warn!(
                "⏰ Workers did not finish within {:?}, aborting {} of them",
                timeout,
                abort_handles.iter().filter(|handle| !handle.is_finished()).count()
            );
            for handle in abort_handles {
                handle.abort();
            }
        }
        Ok(())
    }

    fn clone_handle(&self) -> WorkerPool<T> {
        WorkerPool {
            shared: self.shared.clone(),
            handles: self.handles.clone(),
        }
    }

    // the caller has already counted this worker in `live_workers`
    fn spawn_worker(&self) {
        let handle = PoolWorker::new(self.shared.clone()).start();
        let mut handles = self.handles.lock().unwrap_or_else(PoisonError::into_inner);
        handles.retain(|handle| !handle.is_finished());
        handles.push(handle);
    }

    // grow when there's more queued work than idle workers to pick it up
    fn maybe_grow(&self) {
        let queued = self.shared.tx.len();
        let idle = self.shared.idle_workers.load(Ordering::SeqCst);
        if queued <= idle {
            return;
        }
        let max = self.shared.config.max_threads;
        let grown = self
            .shared
            .live_workers
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |live| (live < max).then_some(live + 1))
            .is_ok();
        if grown {
            self.spawn_worker();
        }
    }
}

/// 🎟️ A reserved place in the pool. Submit exactly once, or drop it to give the place back.
pub struct PoolSlot<T: PoolTask> {
    pool: WorkerPool<T>,
    used: bool,
}

impl<T: PoolTask> fmt::Debug for PoolSlot<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolSlot").field("used", &self.used).finish()
    }
}

impl<T: PoolTask> PoolSlot<T> {
    pub fn submit(mut self, task: T) -> Result<()> {
        let description = task.describe();
        if self.pool.shared.tx.try_send(task).is_err() {
            anyhow::bail!("💀 The worker pool is shutting down, '{}' was not submitted", description);
        }
        self.used = true;
        debug!("📬 Submitted {}", description);
        self.pool.maybe_grow();
        Ok(())
    }
}

impl<T: PoolTask> Drop for PoolSlot<T> {
    fn drop(&mut self) {
        if !self.used {
            self.pool.shared.task_done();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use tokio::sync::Notify;

    #[derive(Debug)]
    enum Probe {
        Count(Arc<AtomicUsize>),
        Block(Arc<Notify>, Arc<AtomicUsize>),
        Fail,
        Panic,
        Sleep(Duration, Arc<AtomicBool>),
    }

    #[async_trait]
    impl PoolTask for Probe {
        fn describe(&self) -> String {
            format!("{self:?}")
        }

        async fn run(self) -> Result<()> {
            match self {
                Probe::Count(counter) => {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
                Probe::Block(release, started) => {
                    started.fetch_add(1, Ordering::SeqCst);
                    release.notified().await;
                    Ok(())
                }
                Probe::Fail => anyhow::bail!("on purpose"),
                Probe::Panic => panic!("on purpose"),
                Probe::Sleep(duration, finished) => {
                    tokio::time::sleep(duration).await;
                    finished.store(true, Ordering::SeqCst);
                    Ok(())
                }
            }
        }
    }

    fn config(max_threads: usize, max_queue: usize) -> PoolConfig {
        PoolConfig {
            min_threads: 0,
            max_threads,
            max_queue,
            idle_time_secs: 1,
        }
    }

    async fn settle() {
        for _ in 0..50 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn the_one_where_the_bouncer_counts_running_and_queued() -> Result<()> {
        let pool = WorkerPool::new(config(1, 1));
        let release = Arc::new(Notify::new());
        let started = Arc::new(AtomicUsize::new(0));

        pool.try_reserve()?.submit(Probe::Block(release.clone(), started.clone()))?;
        pool.try_reserve()?.submit(Probe::Block(release.clone(), started.clone()))?;
        let err = pool.try_reserve().unwrap_err();
        assert_eq!(err, PoolSaturated { reserved: 2, capacity: 2 });

        settle().await;
        assert_eq!(started.load(Ordering::SeqCst), 1);
        assert_eq!(pool.live_workers(), 1);

        release.notify_one();
        settle().await;
        release.notify_one();
        settle().await;
        assert_eq!(started.load(Ordering::SeqCst), 2);
        assert_eq!(pool.reserved(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_an_unused_slot_gives_its_place_back() -> Result<()> {
        let pool: WorkerPool<Probe> = WorkerPool::new(config(1, 0));
        let slot = pool.try_reserve()?;
        assert!(pool.try_reserve().is_err());
        drop(slot);
        assert!(pool.try_reserve().is_ok());
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_failures_and_panics_stay_in_their_lane() -> Result<()> {
        let pool = WorkerPool::new(config(1, 10));
        let counter = Arc::new(AtomicUsize::new(0));

        pool.try_reserve()?.submit(Probe::Fail)?;
        pool.try_reserve()?.submit(Probe::Panic)?;
        pool.try_reserve()?.submit(Probe::Count(counter.clone()))?;
        settle().await;

        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(pool.reserved(), 0);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn the_one_where_idle_extras_go_home() -> Result<()> {
        let pool = WorkerPool::new(config(3, 10));
        let counter = Arc::new(AtomicUsize::new(0));
        pool.try_reserve()?.submit(Probe::Count(counter.clone()))?;
        settle().await;
        assert_eq!(pool.live_workers(), 1);

        tokio::time::sleep(Duration::from_secs(2)).await;
        settle().await;
        assert_eq!(pool.live_workers(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_the_last_worker_stays_for_a_task_that_slipped_in() -> Result<()> {
        let pool = WorkerPool::new(config(1, 10));
        let counter = Arc::new(AtomicUsize::new(0));
        // a worker that timed out and is about to leave still counts as live
        pool.shared.live_workers.store(1, Ordering::SeqCst);

        pool.try_reserve()?.submit(Probe::Count(counter.clone()))?;
        assert_eq!(pool.live_workers(), 1);

        assert!(!pool.shared.try_retire());
        assert_eq!(pool.live_workers(), 1);

        assert!(pool.shared.rx.try_recv().is_ok());
        assert!(pool.shared.try_retire());
        assert_eq!(pool.live_workers(), 0);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn the_one_where_shutdown_stops_waiting_eventually() -> Result<()> {
        let pool = WorkerPool::new(config(1, 1));
        let finished = Arc::new(AtomicBool::new(false));
        pool.try_reserve()?
            .submit(Probe::Sleep(Duration::from_secs(600), finished.clone()))?;
        settle().await;

        pool.shutdown(Duration::from_secs(1)).await?;
        assert!(!finished.load(Ordering::SeqCst));
        assert!(pool.try_reserve()?.submit(Probe::Fail).is_err());
        Ok(())
    }
}

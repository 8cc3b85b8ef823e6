//! 🧵 Workers: the ones who actually do the work while the Supervisor takes all the
//! credit in the sprint retro.
//!
//! A [`PoolWorker`] drains the pool's channel one task at a time. When the channel closes it
//! goes home. When it has been bored for `idle_time_secs` and the pool has more workers
//! than `min_threads`, it also goes home. 🦆

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use anyhow::Result;
use futures::FutureExt;
use tokio::task::JoinHandle;
use tracing::{debug, error, trace};

use super::worker_pool::{PoolShared, PoolTask};

/// 🏗️ A background worker, that does work. duh.
pub trait Worker {
    /// 🚀 Start the worker. Returns a JoinHandle because we trust but verify.
    fn start(self) -> JoinHandle<Result<()>>;
}

pub(crate) struct PoolWorker<T> {
    shared: Arc<PoolShared<T>>,
}

impl<T> PoolWorker<T> {
    pub(crate) fn new(shared: Arc<PoolShared<T>>) -> Self {
        Self { shared }
    }
}

enum Next<T> {
    Task(T),
    Bored,
    Closed,
}

impl<T: PoolTask> PoolWorker<T> {
    async fn next(&self) -> Next<T> {
        let idle_time = Duration::from_secs(self.shared.config.idle_time_secs);
        let above_minimum = self.shared.live_workers.load(Ordering::SeqCst) > self.shared.config.min_threads;

        self.shared.idle_workers.fetch_add(1, Ordering::SeqCst);
        let received = if above_minimum {
            tokio::time::timeout(idle_time, self.shared.rx.recv()).await.ok()
        } else {
            Some(self.shared.rx.recv().await)
        };
        self.shared.idle_workers.fetch_sub(1, Ordering::SeqCst);

        match received {
            Some(Ok(task)) => Next::Task(task),
            Some(Err(_)) => Next::Closed,
            None => Next::Bored,
        }
    }
}

impl<T: PoolTask> Worker for PoolWorker<T> {
    fn start(self) -> JoinHandle<Result<()>> {
        tokio::spawn(async move {
            trace!("🧵 Pool worker clocked in");
            loop {
                match self.next().await {
                    Next::Task(task) => {
                        let description = task.describe();
                        debug!("🏃 Running {}", description);
                        match AssertUnwindSafe(task.run()).catch_unwind().await {
                            Ok(Ok(())) => debug!("✅ {} is done", description),
                            Ok(Err(err)) => error!("💀 {} failed: {:#}", description, err),
                            Err(_) => error!("💥 {} panicked, the worker survived", description),
                        }
                        self.shared.task_done();
                    }
                    Next::Bored => {
                        if self.shared.try_retire() {
                            trace!("😴 Pool worker clocked out after idling");
                            return Ok(());
                        }
                    }
                    Next::Closed => {
                        self.shared.live_workers.fetch_sub(1, Ordering::SeqCst);
                        trace!("🏁 Pool channel closed, worker going home");
                        return Ok(());
                    }
                }
            }
        })
    }
}

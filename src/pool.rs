//! Fixed-size pool of long-lived browser instances
//!
//! The pool launches every instance up front and hands them out one at a
//! time. Idle instances sit in a channel, so `acquire` parks on the channel
//! instead of polling, and the `PooledWorker` guard pushes the instance back
//! when it is dropped, which makes release unconditional on every exit path.
//! No ordering is promised between concurrent waiters.

use crate::config::PoolConfig;
use crate::error::{Error, Result};
use crate::render::RenderPage;
use async_trait::async_trait;
use log::{debug, error, info};
use std::ops::Deref;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

/// Starts browser instances for the pool.
#[async_trait]
pub trait Launcher: Send + Sync + 'static {
    type Worker: Worker;

    /// Best-effort cleanup of instances left behind by a crashed run.
    async fn reap_strays(&self) {}

    /// Launch the instance with the given slot index.
    async fn launch(&self, index: usize) -> Result<Self::Worker>;
}

/// One live browser instance.
#[async_trait]
pub trait Worker: Send + Sync + 'static {
    /// Stable identity of the instance within its pool
    fn id(&self) -> usize;

    /// Open a fresh page scoped to this instance.
    async fn open_page(&self) -> Result<Box<dyn RenderPage>>;

    /// Terminate the instance. Must tolerate being called twice.
    async fn close(&self);
}

struct PoolState<W> {
    workers: Vec<Arc<W>>,
    idle_tx: mpsc::UnboundedSender<Arc<W>>,
    idle_rx: Arc<Mutex<mpsc::UnboundedReceiver<Arc<W>>>>,
    closed: CancellationToken,
}

/// Bounded pool of browser instances
pub struct WorkerPool<L: Launcher> {
    launcher: L,
    config: PoolConfig,
    // `None` until initialized and again after `close_all`
    state: Mutex<Option<PoolState<L::Worker>>>,
    in_use: Arc<AtomicUsize>,
}

impl<L: Launcher> WorkerPool<L> {
    pub fn new(launcher: L, config: PoolConfig) -> Self {
        Self {
            launcher,
            config,
            state: Mutex::new(None),
            in_use: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Configured number of instances
    pub fn size(&self) -> usize {
        self.config.size
    }

    /// Number of instances currently handed out
    pub fn in_use(&self) -> usize {
        self.in_use.load(Ordering::SeqCst)
    }

    pub async fn is_initialized(&self) -> bool {
        self.state.lock().await.is_some()
    }

    /// Launch every instance. Calling it again on a live pool is a no-op.
    ///
    /// If any launch fails, the instances already started are closed and the
    /// launch error is returned; the pool stays uninitialized.
    pub async fn initialize(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.is_none() {
            *state = Some(self.launch_all().await?);
        }
        Ok(())
    }

    async fn launch_all(&self) -> Result<PoolState<L::Worker>> {
        self.launcher.reap_strays().await;

        let mut workers: Vec<Arc<L::Worker>> = Vec::with_capacity(self.config.size);
        for index in 0..self.config.size {
            match self.launcher.launch(index).await {
                Ok(worker) => workers.push(Arc::new(worker)),
                Err(err) => {
                    error!("Failed to launch browser instance {}: {}", index, err);
                    for worker in &workers {
                        worker.close().await;
                    }
                    return Err(err);
                }
            }
        }

        let (idle_tx, idle_rx) = mpsc::unbounded_channel();
        for worker in &workers {
            let _ = idle_tx.send(Arc::clone(worker));
        }
        info!("Launched {} browser instances", workers.len());

        Ok(PoolState {
            workers,
            idle_tx,
            idle_rx: Arc::new(Mutex::new(idle_rx)),
            closed: CancellationToken::new(),
        })
    }

    /// Borrow an idle instance, initializing the pool first if needed.
    ///
    /// Waits without timeout until an instance is free. Fails with
    /// `Error::PoolClosed` if the pool is closed while waiting.
    pub async fn acquire(&self) -> Result<PooledWorker<L::Worker>> {
        let (idle_tx, idle_rx, closed) = {
            let mut guard = self.state.lock().await;
            if guard.is_none() {
                *guard = Some(self.launch_all().await?);
            }
            let Some(state) = guard.as_ref() else {
                return Err(Error::PoolClosed);
            };
            (
                state.idle_tx.clone(),
                Arc::clone(&state.idle_rx),
                state.closed.clone(),
            )
        };

        let worker = tokio::select! {
            worker = async { idle_rx.lock().await.recv().await } => {
                worker.ok_or(Error::PoolClosed)?
            }
            _ = closed.cancelled() => return Err(Error::PoolClosed),
        };

        self.in_use.fetch_add(1, Ordering::SeqCst);
        debug!("Acquired browser instance {}", worker.id());
        Ok(PooledWorker {
            worker,
            idle_tx,
            in_use: Arc::clone(&self.in_use),
        })
    }

    /// Hand an instance back. Equivalent to dropping the guard.
    pub fn release(&self, worker: PooledWorker<L::Worker>) {
        drop(worker);
    }

    /// Terminate every instance and reset the pool. Idempotent.
    pub async fn close_all(&self) {
        let state = self.state.lock().await.take();
        if let Some(state) = state {
            state.closed.cancel();
            for worker in &state.workers {
                worker.close().await;
            }
            info!("Closed {} browser instances", state.workers.len());
        }
    }
}

/// Exclusive borrow of one pooled instance; returns it to the pool on drop.
pub struct PooledWorker<W: Worker> {
    worker: Arc<W>,
    idle_tx: mpsc::UnboundedSender<Arc<W>>,
    in_use: Arc<AtomicUsize>,
}

impl<W: Worker> Deref for PooledWorker<W> {
    type Target = W;

    fn deref(&self) -> &W {
        &self.worker
    }
}

impl<W: Worker> Drop for PooledWorker<W> {
    fn drop(&mut self) {
        debug!("Released browser instance {}", self.worker.id());
        self.in_use.fetch_sub(1, Ordering::SeqCst);
        // The receiver is gone once the pool has been closed; the instance
        // is already terminated in that case.
        let _ = self.idle_tx.send(Arc::clone(&self.worker));
    }
}

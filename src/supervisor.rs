//! Process lifecycle: starts both loops and tears everything down in order
//!
//! Shutdown cancels the shared token, waits until both loops have returned
//! and only then closes the browser pool, so no render is cut off by a
//! browser disappearing underneath it.

use crate::pool::{Launcher, WorkerPool};
use crate::render_loop::RenderCursorLoop;
use crate::tx_status::TxStatusLoop;
use log::info;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Sleep for `duration`, returning early if `token` is cancelled.
pub(crate) async fn sleep_unless_cancelled(duration: Duration, token: &CancellationToken) {
    tokio::select! {
        _ = tokio::time::sleep(duration) => {}
        _ = token.cancelled() => {}
    }
}

pub struct Supervisor<L: Launcher> {
    pool: Arc<WorkerPool<L>>,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

impl<L: Launcher> Supervisor<L> {
    pub fn new(pool: Arc<WorkerPool<L>>) -> Self {
        Self {
            pool,
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
        }
    }

    /// Spawn both loops on the current runtime.
    pub fn start(&self, render_loop: Arc<RenderCursorLoop>, tx_loop: Arc<TxStatusLoop>) {
        let token = self.shutdown.clone();
        self.tasks.spawn(async move { render_loop.run(token).await });

        let token = self.shutdown.clone();
        self.tasks.spawn(async move { tx_loop.run(token).await });

        info!("Render and transaction status loops started");
    }

    /// Token that stops the loops when cancelled; hand it to signal handlers.
    pub fn stop_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// A stop was requested; the loops may still be finishing their pass.
    pub fn is_stopping(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Both loops have returned after `shutdown`.
    pub fn is_stopped(&self) -> bool {
        self.tasks.is_closed() && self.tasks.is_empty()
    }

    /// Stop the loops, wait for them, then close every browser instance.
    pub async fn shutdown(&self) {
        info!("Shutting down");
        self.shutdown.cancel();
        self.tasks.close();
        self.tasks.wait().await;
        self.pool.close_all().await;
        info!("Shutdown complete");
    }
}

//! Cursor-driven loop that keeps the render cache complete
//!
//! The cursor is never stored on its own: on start it is rebuilt as one past
//! the highest sequence number in the render cache, and it only advances
//! after a whole batch has been upserted. A crash mid-batch therefore
//! re-renders at most the unpersisted tail, and the upsert makes the repeat
//! harmless.

use crate::config::LoopConfig;
use crate::error::Result;
use crate::render::{Render, RENDER_CONTENT_TYPE};
use crate::store::{ContentStore, PendingInput, RenderedContentRecord};
use crate::supervisor::sleep_unless_cancelled;
use futures::future::join_all;
use log::{debug, info, warn};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// URL the browser loads to render `id`.
pub fn content_url(base: &str, id: &str) -> String {
    format!("{}/content/{}", base.trim_end_matches('/'), id)
}

pub struct RenderCursorLoop {
    store: Arc<dyn ContentStore>,
    renderer: Arc<dyn Render>,
    config: LoopConfig,
}

impl RenderCursorLoop {
    pub fn new(store: Arc<dyn ContentStore>, renderer: Arc<dyn Render>, config: LoopConfig) -> Self {
        Self {
            store,
            renderer,
            config,
        }
    }

    /// Resume point: one past the newest persisted render, or 0.
    pub async fn initial_cursor(&self) -> Result<i64> {
        Ok(self
            .store
            .max_rendered_sequence()
            .await?
            .map_or(0, |max| max + 1))
    }

    /// Render and persist one batch starting at `cursor`.
    ///
    /// Returns the next cursor, or `None` when nothing is waiting. Any failure
    /// leaves the cursor where it was.
    pub async fn run_once(&self, cursor: i64) -> Result<Option<i64>> {
        let batch = self
            .store
            .list_unrendered(self.config.batch_size, cursor)
            .await?;
        let Some(last) = batch.iter().map(|input| input.sequence_number).max() else {
            return Ok(None);
        };

        debug!("Rendering {} inputs from sequence {}", batch.len(), cursor);
        // Every render runs to completion so each one closes its own page,
        // even when a sibling has already failed the batch.
        let records = join_all(batch.iter().map(|input| self.render_input(input)))
            .await
            .into_iter()
            .collect::<Result<Vec<_>>>()?;
        self.store.upsert_rendered(&records).await?;

        for record in &records {
            info!(
                "Rendered {} (#{}) {} bytes {}",
                record.id,
                record.sequence_number,
                record.content.len(),
                record.render_status
            );
        }
        Ok(Some(last + 1))
    }

    async fn render_input(&self, input: &PendingInput) -> Result<RenderedContentRecord> {
        let url = content_url(&self.config.content_base_url, &input.id);
        let output = self.renderer.render(&url, self.config.full_page).await?;
        Ok(RenderedContentRecord {
            id: input.id.clone(),
            sequence_number: input.sequence_number,
            content: output.content,
            content_type: RENDER_CONTENT_TYPE.to_string(),
            render_status: output.status,
        })
    }

    /// Run until `shutdown` is cancelled; the token is checked between
    /// iterations and during sleeps, never inside a batch.
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut cursor = None;

        while !shutdown.is_cancelled() {
            match self.step(&mut cursor).await {
                Ok(true) => {}
                Ok(false) => sleep_unless_cancelled(self.config.idle_sleep, &shutdown).await,
                Err(err) => {
                    warn!(
                        "Render loop iteration at cursor {:?} failed: {}; retrying in {:?}",
                        cursor, err, self.config.error_backoff
                    );
                    sleep_unless_cancelled(self.config.error_backoff, &shutdown).await;
                }
            }
        }
        info!("Render loop stopped at cursor {:?}", cursor);
    }

    // Derives the cursor lazily so a store outage at startup is retried like
    // any other failed iteration.
    async fn step(&self, cursor: &mut Option<i64>) -> Result<bool> {
        let current = match *cursor {
            Some(current) => current,
            None => {
                let start = self.initial_cursor().await?;
                info!("Render loop starting at sequence {}", start);
                *cursor = Some(start);
                start
            }
        };

        match self.run_once(current).await? {
            Some(next) => {
                *cursor = Some(next);
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

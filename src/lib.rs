//! RFox Render Cache
//!
//! Keeps a persisted cache of stable raster renders for an append-only
//! sequence of HTML/SVG documents, and tracks the confirmation status of
//! broadcast boost and sweep transactions.
//!
//! # Components
//!
//! - **WorkerPool**: fixed set of long-lived headless browser instances
//!   handed out one at a time ([`pool`])
//! - **StableRenderer**: navigates, then captures until the document stops
//!   changing, and classifies documents that never settle ([`render`])
//! - **RenderCursorLoop**: renders new inputs in batches from a cursor
//!   rebuilt from the cache itself ([`render_loop`])
//! - **TxStatusLoop**: polls an external status source for pending
//!   transactions ([`tx_status`])
//! - **Supervisor**: runs both loops and shuts down in order ([`supervisor`])
//!
//! # Example
//!
//! ```no_run
//! use rendercache::cdp::ChromeLauncher;
//! use rendercache::{PoolConfig, RenderConfig, StableRenderer, WorkerPool};
//! use std::sync::Arc;
//!
//! # async fn demo() -> rendercache::Result<()> {
//! let config = RenderConfig::default();
//! let launcher = ChromeLauncher::new(config.viewport, config.navigation_timeout);
//! let pool = Arc::new(WorkerPool::new(launcher, PoolConfig::default().with_size(1)));
//! let renderer = StableRenderer::new(Arc::clone(&pool), config)?;
//!
//! let output = renderer.render_content("http://127.0.0.1:3000/content/abc", true).await?;
//! println!("{} ({} bytes)", output.status, output.content.len());
//! pool.close_all().await;
//! # Ok(())
//! # }
//! ```

pub mod compare;
pub mod config;
pub mod error;
pub mod pool;
pub mod render;
pub mod render_loop;
pub mod store;
pub mod supervisor;
pub mod tx_status;

#[cfg(feature = "cdp")]
pub mod cdp;

#[cfg(feature = "postgres")]
pub mod postgres;

#[cfg(test)]
mod testing;

pub use config::{Environment, LoopConfig, PoolConfig, RenderConfig, TxStatusConfig, Viewport};
pub use error::{CaptureError, Error, Result};
pub use pool::{Launcher, PooledWorker, Worker, WorkerPool};
pub use render::{Render, RenderOutput, RenderPage, RenderStatus, StableRenderer, RENDER_CONTENT_TYPE};
pub use render_loop::{content_url, RenderCursorLoop};
pub use store::{BroadcastStore, ContentStore, MemoryStore};
pub use supervisor::Supervisor;
pub use tx_status::{EsploraStatusSource, TxStatusLoop, TxStatusSource};

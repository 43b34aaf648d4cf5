//! Configuration for the pool, the renderer and both service loops
//!
//! Every struct has conservative defaults matching the production service;
//! tests shrink the intervals with the `with_*` setters.

use std::time::Duration;

/// Viewport dimensions used for captures and for the blank reference frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

impl Default for Viewport {
    fn default() -> Self {
        Self {
            width: 800,
            height: 600,
        }
    }
}

/// Deployment flavour; decides how many browser instances are launched
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum Environment {
    #[default]
    Development,
    Production,
}

impl Environment {
    pub fn default_pool_size(self) -> usize {
        match self {
            Environment::Development => 2,
            Environment::Production => num_cpus::get().max(4),
        }
    }
}

/// Worker pool configuration
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Number of browser instances kept alive
    pub size: usize,
    /// Viewport every instance is launched with
    pub viewport: Viewport,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self::for_environment(Environment::default())
    }
}

impl PoolConfig {
    pub fn for_environment(env: Environment) -> Self {
        Self {
            size: env.default_pool_size(),
            viewport: Viewport::default(),
        }
    }

    pub fn with_size(mut self, size: usize) -> Self {
        self.size = size.max(1);
        self
    }

    pub fn with_viewport(mut self, viewport: Viewport) -> Self {
        self.viewport = viewport;
        self
    }
}

/// Stabilization settings for a single render
#[derive(Debug, Clone)]
pub struct RenderConfig {
    /// Viewport of the blank reference frame
    pub viewport: Viewport,
    /// Upper bound on navigation
    pub navigation_timeout: Duration,
    /// Upper bound on a single screenshot
    pub screenshot_timeout: Duration,
    /// Sleep before each capture after the first
    pub capture_interval: Duration,
    /// Capture rounds after the first post-navigation frame
    pub max_extra_rounds: usize,
    /// Per-pixel YIQ tolerance (0.0 - 1.0)
    pub pixel_tolerance: f64,
    /// Percentage of differing pixels that separates "same" from "changed"
    pub similarity_threshold: f64,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            viewport: Viewport::default(),
            navigation_timeout: Duration::from_secs(10),
            screenshot_timeout: Duration::from_secs(10),
            capture_interval: Duration::from_millis(100),
            max_extra_rounds: 10,
            pixel_tolerance: 0.1,
            similarity_threshold: 1.0,
        }
    }
}

impl RenderConfig {
    pub fn with_viewport(mut self, viewport: Viewport) -> Self {
        self.viewport = viewport;
        self
    }

    pub fn with_navigation_timeout(mut self, timeout: Duration) -> Self {
        self.navigation_timeout = timeout;
        self
    }

    pub fn with_capture_interval(mut self, interval: Duration) -> Self {
        self.capture_interval = interval;
        self
    }

    pub fn with_similarity_threshold(mut self, percent: f64) -> Self {
        self.similarity_threshold = percent.clamp(0.0, 100.0);
        self
    }
}

/// RenderCursorLoop settings
#[derive(Debug, Clone)]
pub struct LoopConfig {
    /// Base URL of the content server; targets are `{base}/content/{id}`
    pub content_base_url: String,
    pub batch_size: usize,
    /// Sleep when there is nothing left to render
    pub idle_sleep: Duration,
    /// Sleep after a failed iteration
    pub error_backoff: Duration,
    /// Whether renders capture the whole document instead of the viewport
    pub full_page: bool,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            content_base_url: "http://127.0.0.1:3000".to_string(),
            batch_size: 5,
            idle_sleep: Duration::from_secs(1),
            error_backoff: Duration::from_secs(50),
            full_page: true,
        }
    }
}

impl LoopConfig {
    pub fn with_content_base_url(mut self, url: impl Into<String>) -> Self {
        self.content_base_url = url.into();
        self
    }

    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size.max(1);
        self
    }

    pub fn with_idle_sleep(mut self, sleep: Duration) -> Self {
        self.idle_sleep = sleep;
        self
    }

    pub fn with_error_backoff(mut self, backoff: Duration) -> Self {
        self.error_backoff = backoff;
        self
    }
}

/// TxStatusLoop settings
#[derive(Debug, Clone)]
pub struct TxStatusConfig {
    /// Sleep when no record is pending
    pub idle_sleep: Duration,
    /// Sleep after every processed pass
    pub pass_sleep: Duration,
    pub error_backoff: Duration,
    /// Minimum record age before `not_found` is trusted
    pub not_found_grace: chrono::Duration,
}

impl Default for TxStatusConfig {
    fn default() -> Self {
        Self {
            idle_sleep: Duration::from_secs(1),
            pass_sleep: Duration::from_secs(60),
            error_backoff: Duration::from_secs(60),
            not_found_grace: chrono::Duration::minutes(5),
        }
    }
}

impl TxStatusConfig {
    pub fn with_idle_sleep(mut self, sleep: Duration) -> Self {
        self.idle_sleep = sleep;
        self
    }

    pub fn with_pass_sleep(mut self, sleep: Duration) -> Self {
        self.pass_sleep = sleep;
        self
    }

    pub fn with_error_backoff(mut self, backoff: Duration) -> Self {
        self.error_backoff = backoff;
        self
    }
}

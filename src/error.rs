//! Error types for the render cache

use thiserror::Error;

/// Result type alias for render cache operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the render cache
#[derive(Error, Debug)]
pub enum Error {
    /// Failed to launch or configure a browser instance
    #[error("Worker initialization failed: {0}")]
    InitializationError(String),

    /// The worker pool was closed while a caller was waiting on it
    #[error("Worker pool is closed")]
    PoolClosed,

    /// A render failed in a way the retry table does not cover
    #[error("Rendering {url} failed: {source}")]
    RenderError {
        url: String,
        #[source]
        source: CaptureError,
    },

    /// Frame could not be decoded or encoded
    #[error("Image error: {0}")]
    ImageError(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    ConfigError(String),

    /// Network error talking to an external service
    #[error("Network error: {0}")]
    NetworkError(String),

    /// Persistence layer failure
    #[error("Store error: {0}")]
    Store(String),

    /// The transaction status source answered with something it cannot interpret
    #[error("Unexpected transaction status response: {0}")]
    TxStatus(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

/// Failures raised by a single navigation or screenshot against a page.
///
/// The first four variants are retryable and map onto the degraded
/// `*_TIMEOUT` render statuses; everything else is fatal for the render.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CaptureError {
    #[error("navigation timed out")]
    NavigationTimeout,

    #[error("page is too large to capture ({width}x{height})")]
    PageTooLarge { width: u32, height: u32 },

    #[error("capture target has zero width")]
    ZeroWidth,

    #[error("screenshot capture timed out")]
    ScreenshotTimeout,

    /// Load failure or a non-200 main document response
    #[error("navigation failed: {0}")]
    Navigation(String),

    #[error("browser error: {0}")]
    Browser(String),
}

impl CaptureError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CaptureError::NavigationTimeout
                | CaptureError::PageTooLarge { .. }
                | CaptureError::ZeroWidth
                | CaptureError::ScreenshotTimeout
        )
    }
}

impl From<image::ImageError> for Error {
    fn from(err: image::ImageError) -> Self {
        Error::ImageError(err.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Error::NetworkError(err.to_string())
    }
}

#[cfg(feature = "postgres")]
impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        Error::Store(err.to_string())
    }
}

#[cfg(feature = "cdp")]
impl From<anyhow::Error> for CaptureError {
    fn from(err: anyhow::Error) -> Self {
        CaptureError::Browser(err.to_string())
    }
}

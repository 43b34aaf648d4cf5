//! Stable rendering of documents that keep changing after first paint
//!
//! A document gives no signal that it has finished drawing, so the renderer
//! watches it instead: it navigates, then captures a frame every
//! `capture_interval` and compares it with the blank reference frame and with
//! the previous capture. The document counts as stable once it differs from
//! blank, matches its previous frame, and had no requests in flight for the
//! last two captures. Documents that never settle still produce an image,
//! tagged with why they were not judged stable.
//!
//! Navigation and capture failures arrive as typed [`CaptureError`]s. The
//! retryable ones re-run the whole render with a shared retry counter; once a
//! category's budget is spent the last captured frame is returned with the
//! matching `*_TIMEOUT` status.

use crate::compare::{blank_frame, decode_png, diff_percent, encode_png};
use crate::config::RenderConfig;
use crate::error::{CaptureError, Error, Result};
use crate::pool::{Launcher, Worker, WorkerPool};
use async_trait::async_trait;
use image::RgbaImage;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

/// Content type of every stored render
pub const RENDER_CONTENT_TYPE: &str = "image/png";

/// Outcome tag attached to every completed render
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RenderStatus {
    OkStable,
    OkUnstableNetwork,
    OkUnstableSimilarOriginal,
    OkUnstableDifferentRecent,
    OkUnstableUnknown,
    NavigationTimeout,
    SizeTimeout,
    WidthTimeout,
    ScreenshotTimeout,
}

impl RenderStatus {
    pub const ALL: [RenderStatus; 9] = [
        RenderStatus::OkStable,
        RenderStatus::OkUnstableNetwork,
        RenderStatus::OkUnstableSimilarOriginal,
        RenderStatus::OkUnstableDifferentRecent,
        RenderStatus::OkUnstableUnknown,
        RenderStatus::NavigationTimeout,
        RenderStatus::SizeTimeout,
        RenderStatus::WidthTimeout,
        RenderStatus::ScreenshotTimeout,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            RenderStatus::OkStable => "OK_STABLE",
            RenderStatus::OkUnstableNetwork => "OK_UNSTABLE_NETWORK",
            RenderStatus::OkUnstableSimilarOriginal => "OK_UNSTABLE_SIMILAR_ORIGINAL",
            RenderStatus::OkUnstableDifferentRecent => "OK_UNSTABLE_DIFFERENT_RECENT",
            RenderStatus::OkUnstableUnknown => "OK_UNSTABLE_UNKNOWN",
            RenderStatus::NavigationTimeout => "NAVIGATION_TIMEOUT",
            RenderStatus::SizeTimeout => "SIZE_TIMEOUT",
            RenderStatus::WidthTimeout => "WIDTH_TIMEOUT",
            RenderStatus::ScreenshotTimeout => "SCREENSHOT_TIMEOUT",
        }
    }
}

impl fmt::Display for RenderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RenderStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        RenderStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| Error::Other(format!("unknown render status: {}", s)))
    }
}

/// Image bytes plus the status they were produced with
#[derive(Debug, Clone)]
pub struct RenderOutput {
    pub content: Vec<u8>,
    pub status: RenderStatus,
}

/// A page opened on one browser instance.
#[async_trait]
pub trait RenderPage: Send {
    /// Load `url`; a non-200 main document is an error.
    async fn navigate(&mut self, url: &str) -> std::result::Result<(), CaptureError>;

    /// Capture a PNG of the viewport, or of the whole document when `full_page`.
    async fn screenshot(&mut self, full_page: bool) -> std::result::Result<Vec<u8>, CaptureError>;

    /// Requests started but not yet finished or failed.
    fn active_requests(&self) -> i64;

    async fn close(self: Box<Self>);
}

/// Anything that can turn a URL into a render; the cursor loop depends on this.
#[async_trait]
pub trait Render: Send + Sync {
    async fn render(&self, url: &str, full_page: bool) -> Result<RenderOutput>;
}

/// Retry behaviour for one retryable failure category
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    /// Retry with a viewport-only capture
    pub force_viewport: bool,
    /// Status returned once the budget is spent
    pub exhausted: RenderStatus,
}

impl RetryPolicy {
    /// `None` for failures that must not be retried.
    pub fn for_error(err: &CaptureError) -> Option<RetryPolicy> {
        let (max_retries, force_viewport, exhausted) = match err {
            CaptureError::NavigationTimeout => (3, false, RenderStatus::NavigationTimeout),
            CaptureError::PageTooLarge { .. } => (2, true, RenderStatus::SizeTimeout),
            CaptureError::ZeroWidth => (2, true, RenderStatus::WidthTimeout),
            CaptureError::ScreenshotTimeout => (2, true, RenderStatus::ScreenshotTimeout),
            CaptureError::Navigation(_) | CaptureError::Browser(_) => return None,
        };
        Some(RetryPolicy {
            max_retries,
            force_viewport,
            exhausted,
        })
    }
}

#[derive(Debug, Clone, Copy)]
struct RetryState {
    retry_count: u32,
    full_page: bool,
}

/// One captured frame
#[derive(Debug, Clone)]
pub struct Frame {
    pub png: Vec<u8>,
    pub image: RgbaImage,
    pub active_requests: i64,
}

/// Diff figures for the latest capture of an attempt
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Observation {
    /// Percent of pixels differing from the blank frame
    pub original_diff: f64,
    /// Percent of pixels differing from the previous capture
    pub recent_diff: f64,
    pub current_requests: i64,
    pub previous_requests: i64,
}

impl Observation {
    fn network_idle(&self) -> bool {
        self.current_requests <= 0 && self.previous_requests <= 0
    }

    /// The early-stop condition.
    pub fn is_stable(&self, threshold: f64) -> bool {
        self.original_diff > threshold && self.recent_diff < threshold && self.network_idle()
    }
}

/// Status for an attempt that ran out of capture rounds, in priority order.
pub fn classify(last: Option<&Observation>, threshold: f64) -> RenderStatus {
    match last {
        Some(obs) if !obs.network_idle() => RenderStatus::OkUnstableNetwork,
        Some(obs) if obs.original_diff <= threshold => RenderStatus::OkUnstableSimilarOriginal,
        Some(obs) if obs.recent_diff >= threshold => RenderStatus::OkUnstableDifferentRecent,
        _ => RenderStatus::OkUnstableUnknown,
    }
}

/// Frames of a single attempt: the blank reference plus the last two captures.
struct RenderAttempt {
    original: Arc<Frame>,
    previous: Option<Frame>,
    latest: Option<Frame>,
    tolerance: f64,
}

impl RenderAttempt {
    fn new(original: Arc<Frame>, tolerance: f64) -> Self {
        Self {
            original,
            previous: None,
            latest: None,
            tolerance,
        }
    }

    /// Record a capture. The first post-navigation capture yields no
    /// observation, so it can never end the attempt on its own.
    fn push(&mut self, frame: Frame) -> Option<Observation> {
        self.previous = self.latest.take();
        self.latest = Some(frame);
        let (previous, latest) = (self.previous.as_ref()?, self.latest.as_ref()?);

        Some(Observation {
            original_diff: diff_percent(&self.original.image, &latest.image, self.tolerance),
            recent_diff: diff_percent(&previous.image, &latest.image, self.tolerance),
            current_requests: latest.active_requests,
            previous_requests: previous.active_requests,
        })
    }
}

/// Renders documents through a shared worker pool until they look settled.
pub struct StableRenderer<L: Launcher> {
    pool: Arc<WorkerPool<L>>,
    config: RenderConfig,
    blank: Arc<Frame>,
}

impl<L: Launcher> StableRenderer<L> {
    pub fn new(pool: Arc<WorkerPool<L>>, config: RenderConfig) -> Result<Self> {
        let image = blank_frame(config.viewport.width, config.viewport.height);
        let blank = Frame {
            png: encode_png(&image)?,
            image,
            active_requests: 0,
        };
        Ok(Self {
            pool,
            config,
            blank: Arc::new(blank),
        })
    }

    pub fn pool(&self) -> &Arc<WorkerPool<L>> {
        &self.pool
    }

    /// Render `url` into a single representative image.
    ///
    /// Retryable failures are retried per [`RetryPolicy`]; unmatched failures
    /// are returned as [`Error::RenderError`].
    pub async fn render_content(&self, url: &str, full_page: bool) -> Result<RenderOutput> {
        let mut state = RetryState {
            retry_count: 0,
            full_page,
        };
        let mut best = Vec::new();

        loop {
            let err = match self.attempt(url, state.full_page, &mut best).await? {
                Ok(output) => return Ok(output),
                Err(err) => err,
            };

            let Some(policy) = RetryPolicy::for_error(&err) else {
                return Err(Error::RenderError {
                    url: url.to_string(),
                    source: err,
                });
            };

            if state.retry_count >= policy.max_retries {
                warn!(
                    "Giving up on {} after {} retries ({}), keeping {} bytes",
                    url,
                    state.retry_count,
                    err,
                    best.len()
                );
                return Ok(RenderOutput {
                    content: best,
                    status: policy.exhausted,
                });
            }

            state.retry_count += 1;
            if policy.force_viewport {
                state.full_page = false;
            }
            debug!(
                "Retrying {} ({}), attempt {} full_page={}",
                url, err, state.retry_count, state.full_page
            );
        }
    }

    /// One pass over a fresh page. The outer result carries pool failures,
    /// the inner one capture failures the retry table decides on.
    async fn attempt(
        &self,
        url: &str,
        full_page: bool,
        best: &mut Vec<u8>,
    ) -> Result<std::result::Result<RenderOutput, CaptureError>> {
        let worker = self.pool.acquire().await?;
        let mut page = worker.open_page().await?;
        let outcome = self.stabilize(page.as_mut(), url, full_page, best).await;
        page.close().await;
        drop(worker);
        Ok(outcome)
    }

    async fn stabilize(
        &self,
        page: &mut dyn RenderPage,
        url: &str,
        full_page: bool,
        best: &mut Vec<u8>,
    ) -> std::result::Result<RenderOutput, CaptureError> {
        let threshold = self.config.similarity_threshold;
        let mut attempt = RenderAttempt::new(Arc::clone(&self.blank), self.config.pixel_tolerance);

        with_deadline(
            self.config.navigation_timeout,
            CaptureError::NavigationTimeout,
            page.navigate(url),
        )
        .await?;

        let frame = self.capture(page, full_page).await?;
        best.clone_from(&frame.png);
        attempt.push(frame);

        let mut last = None;
        for round in 1..=self.config.max_extra_rounds {
            tokio::time::sleep(self.config.capture_interval).await;

            let frame = self.capture(page, full_page).await?;
            best.clone_from(&frame.png);
            let Some(obs) = attempt.push(frame) else {
                continue;
            };
            debug!(
                "{} round {}: original {:.3}% recent {:.3}% requests {}/{}",
                url,
                round,
                obs.original_diff,
                obs.recent_diff,
                obs.previous_requests,
                obs.current_requests
            );

            if obs.is_stable(threshold) {
                info!("{} stable after {} rounds", url, round);
                return Ok(RenderOutput {
                    content: best.clone(),
                    status: RenderStatus::OkStable,
                });
            }
            last = Some(obs);
        }

        let status = classify(last.as_ref(), threshold);
        info!("{} did not settle: {}", url, status);
        Ok(RenderOutput {
            content: best.clone(),
            status,
        })
    }

    async fn capture(
        &self,
        page: &mut dyn RenderPage,
        full_page: bool,
    ) -> std::result::Result<Frame, CaptureError> {
        let png = with_deadline(
            self.config.screenshot_timeout,
            CaptureError::ScreenshotTimeout,
            page.screenshot(full_page),
        )
        .await?;
        let active_requests = page.active_requests();
        let image = decode_png(&png)
            .map_err(|e| CaptureError::Browser(format!("undecodable screenshot: {}", e)))?;
        Ok(Frame {
            png,
            image,
            active_requests,
        })
    }
}

#[async_trait]
impl<L: Launcher> Render for StableRenderer<L> {
    async fn render(&self, url: &str, full_page: bool) -> Result<RenderOutput> {
        self.render_content(url, full_page).await
    }
}

async fn with_deadline<T, F>(
    limit: Duration,
    on_timeout: CaptureError,
    fut: F,
) -> std::result::Result<T, CaptureError>
where
    F: Future<Output = std::result::Result<T, CaptureError>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(res) => res,
        Err(_) => Err(on_timeout),
    }
}

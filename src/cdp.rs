//! Chrome DevTools Protocol backend for the worker pool
//!
//! Each worker owns one headless Chrome process launched through the
//! `headless_chrome` crate. That crate is synchronous, so every call into it
//! runs on tokio's blocking pool; deadlines are enforced by the renderer on
//! the async side, and the tab's own timeout is set slightly longer so the
//! async deadline always fires first.

use crate::config::Viewport;
use crate::error::{CaptureError, Error, Result};
use crate::pool::{Launcher, Worker};
use crate::render::RenderPage;
use async_trait::async_trait;
use headless_chrome::browser::tab::Tab;
use headless_chrome::protocol::cdp::types::Event;
use headless_chrome::protocol::cdp::{Network, Page};
use headless_chrome::{Browser, LaunchOptions};
use log::{debug, info, warn};
use std::collections::HashSet;
use std::ffi::OsStr;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

/// Extra switch on every launched process so strays can be found by name.
pub const WORKER_MARKER_SWITCH: &str = "--rendercache-worker";

/// Largest width or height a full-page capture may have
pub const MAX_CAPTURE_DIMENSION: u32 = 16384;

// Instances live for the whole process; only an explicit close ends them.
const IDLE_BROWSER_TIMEOUT: Duration = Duration::from_secs(365 * 24 * 60 * 60);
const TAB_TIMEOUT_SLACK: Duration = Duration::from_secs(5);

// Dialogs block the page until answered, so they are replaced before any
// document script runs.
const SUPPRESS_DIALOGS_SCRIPT: &str = r#"(function(){
    window.alert = function(){};
    window.confirm = function(){ return true; };
    window.prompt = function(){ return null; };
    window.print = function(){};
})();"#;

const DOCUMENT_SIZE_SCRIPT: &str = r#"JSON.stringify([
    Math.max(document.documentElement.scrollWidth, document.body ? document.body.scrollWidth : 0),
    Math.max(document.documentElement.scrollHeight, document.body ? document.body.scrollHeight : 0)
])"#;

/// Validate the dimensions of a full-page capture.
pub fn check_capture_size(width: u32, height: u32) -> std::result::Result<(u32, u32), CaptureError> {
    if width == 0 {
        return Err(CaptureError::ZeroWidth);
    }
    if width > MAX_CAPTURE_DIMENSION || height > MAX_CAPTURE_DIMENSION {
        return Err(CaptureError::PageTooLarge { width, height });
    }
    Ok((width, height))
}

/// Launches headless Chrome instances
pub struct ChromeLauncher {
    viewport: Viewport,
    navigation_timeout: Duration,
    reap_strays: bool,
}

impl ChromeLauncher {
    pub fn new(viewport: Viewport, navigation_timeout: Duration) -> Self {
        Self {
            viewport,
            navigation_timeout,
            reap_strays: true,
        }
    }

    /// Kill leftover marked processes before launching. On by default.
    pub fn with_stray_reaping(mut self, enabled: bool) -> Self {
        self.reap_strays = enabled;
        self
    }
}

fn launch_options(viewport: Viewport) -> Result<LaunchOptions<'static>> {
    LaunchOptions::default_builder()
        .headless(true)
        .sandbox(false)
        .window_size(Some((viewport.width, viewport.height)))
        .idle_browser_timeout(IDLE_BROWSER_TIMEOUT)
        .args(vec![
            OsStr::new(WORKER_MARKER_SWITCH),
            OsStr::new("--force-device-scale-factor=1"),
            OsStr::new("--hide-scrollbars"),
            OsStr::new("--mute-audio"),
            OsStr::new("--disable-gpu"),
            OsStr::new("--disable-dev-shm-usage"),
            OsStr::new("--disable-extensions"),
            OsStr::new("--disable-background-networking"),
            OsStr::new("--disable-sync"),
        ])
        .build()
        .map_err(|e| Error::InitializationError(format!("Failed to build launch options: {}", e)))
}

#[async_trait]
impl Launcher for ChromeLauncher {
    type Worker = ChromeWorker;

    async fn reap_strays(&self) {
        if !self.reap_strays {
            return;
        }
        let result = tokio::task::spawn_blocking(|| {
            std::process::Command::new("pkill")
                .args(["-f", WORKER_MARKER_SWITCH])
                .status()
        })
        .await;
        match result {
            // pkill exits with 1 when nothing matched
            Ok(Ok(status)) if status.success() => info!("Killed stray browser processes"),
            Ok(Ok(_)) => debug!("No stray browser processes"),
            Ok(Err(e)) => warn!("Could not run pkill: {}", e),
            Err(e) => warn!("Stray reaping task failed: {}", e),
        }
    }

    async fn launch(&self, index: usize) -> Result<ChromeWorker> {
        let viewport = self.viewport;
        let browser = tokio::task::spawn_blocking(move || {
            let options = launch_options(viewport)?;
            Browser::new(options)
                .map_err(|e| Error::InitializationError(format!("Failed to launch browser: {}", e)))
        })
        .await
        .map_err(|e| Error::InitializationError(format!("Browser launch task failed: {}", e)))??;

        debug!("Launched browser instance {}", index);
        Ok(ChromeWorker {
            id: index,
            browser: Mutex::new(Some(Arc::new(browser))),
            tab_timeout: self.navigation_timeout + TAB_TIMEOUT_SLACK,
        })
    }
}

/// One Chrome process
pub struct ChromeWorker {
    id: usize,
    browser: Mutex<Option<Arc<Browser>>>,
    tab_timeout: Duration,
}

impl ChromeWorker {
    fn browser(&self) -> Result<Arc<Browser>> {
        self.browser
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| Error::Other(format!("browser instance {} is closed", self.id)))
    }
}

#[async_trait]
impl Worker for ChromeWorker {
    fn id(&self) -> usize {
        self.id
    }

    async fn open_page(&self) -> Result<Box<dyn RenderPage>> {
        let browser = self.browser()?;
        let tab_timeout = self.tab_timeout;
        let page = tokio::task::spawn_blocking(move || ChromePage::open(&browser, tab_timeout))
            .await
            .map_err(|e| Error::Other(format!("Page setup task failed: {}", e)))??;
        Ok(Box::new(page))
    }

    async fn close(&self) {
        let browser = self.browser.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(browser) = browser {
            // Dropping the last handle kills the process, which may block.
            let _ = tokio::task::spawn_blocking(move || drop(browser)).await;
            debug!("Closed browser instance {}", self.id);
        }
    }
}

/// Network and response state collected from tab events
#[derive(Default)]
struct PageEvents {
    in_flight: HashSet<String>,
    target_url: Option<String>,
    target_status: Option<u32>,
}

/// A tab on a worker's browser
pub struct ChromePage {
    tab: Arc<Tab>,
    events: Arc<Mutex<PageEvents>>,
}

impl ChromePage {
    fn open(browser: &Browser, tab_timeout: Duration) -> Result<Self> {
        let tab = browser
            .new_tab()
            .map_err(|e| Error::Other(format!("Failed to create tab: {}", e)))?;
        tab.set_default_timeout(tab_timeout);

        tab.call_method(Page::AddScriptToEvaluateOnNewDocument {
            source: SUPPRESS_DIALOGS_SCRIPT.to_string(),
            world_name: None,
            include_command_line_api: None,
            run_immediately: None,
        })
        .map_err(|e| Error::Other(format!("Failed to install dialog handler: {}", e)))?;

        tab.call_method(Network::Enable {
            max_total_buffer_size: None,
            max_resource_buffer_size: None,
            max_post_data_size: None,
            report_direct_socket_traffic: None,
            enable_durable_messages: None,
        })
        .map_err(|e| Error::Other(format!("Failed to enable network events: {}", e)))?;

        let events = Arc::new(Mutex::new(PageEvents::default()));
        let listener_events = Arc::clone(&events);
        let weak_tab: Weak<Tab> = Arc::downgrade(&tab);
        tab.add_event_listener(Arc::new(move |event: &Event| {
            let mut state = listener_events.lock().unwrap_or_else(PoisonError::into_inner);
            match event {
                Event::NetworkRequestWillBeSent(e) => {
                    state.in_flight.insert(e.params.request_id.clone());
                }
                Event::NetworkLoadingFinished(e) => {
                    state.in_flight.remove(&e.params.request_id);
                }
                Event::NetworkLoadingFailed(e) => {
                    state.in_flight.remove(&e.params.request_id);
                }
                Event::NetworkResponseReceived(e) => {
                    if state.target_url.as_deref() == Some(e.params.response.url.as_str()) {
                        state.target_status = Some(e.params.response.status as u32);
                    }
                }
                Event::PageJavascriptDialogOpening(_) => {
                    // Answering from the event thread would deadlock it.
                    let weak_tab = weak_tab.clone();
                    std::thread::spawn(move || {
                        if let Some(tab) = weak_tab.upgrade() {
                            let _ = tab.call_method(Page::HandleJavaScriptDialog {
                                accept: true,
                                prompt_text: None,
                            });
                        }
                    });
                }
                _ => {}
            }
        }))
        .map_err(|e| Error::Other(format!("Failed to register event listener: {}", e)))?;

        Ok(Self { tab, events })
    }

    fn events(&self) -> std::sync::MutexGuard<'_, PageEvents> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn document_size(tab: &Tab) -> std::result::Result<(u32, u32), CaptureError> {
        let value = tab.evaluate(DOCUMENT_SIZE_SCRIPT, false)?.value;
        let size = value
            .as_ref()
            .and_then(serde_json::Value::as_str)
            .ok_or_else(|| CaptureError::Browser("document size unavailable".into()))?;
        let [width, height]: [f64; 2] = serde_json::from_str(size)
            .map_err(|e| CaptureError::Browser(format!("bad document size {}: {}", size, e)))?;
        Ok((width.ceil() as u32, height.ceil() as u32))
    }
}

fn joined<T>(
    result: std::result::Result<std::result::Result<T, CaptureError>, tokio::task::JoinError>,
) -> std::result::Result<T, CaptureError> {
    result.map_err(|e| CaptureError::Browser(format!("browser task failed: {}", e)))?
}

#[async_trait]
impl RenderPage for ChromePage {
    async fn navigate(&mut self, url: &str) -> std::result::Result<(), CaptureError> {
        {
            let mut events = self.events();
            events.target_url = Some(url.to_string());
            events.target_status = None;
        }

        let tab = Arc::clone(&self.tab);
        let target = url.to_string();
        joined(
            tokio::task::spawn_blocking(move || {
                tab.navigate_to(&target)
                    .map_err(|e| CaptureError::Navigation(e.to_string()))?;
                tab.wait_until_navigated()
                    .map_err(|e| CaptureError::Navigation(e.to_string()))?;
                Ok(())
            })
            .await,
        )?;

        match self.events().target_status {
            Some(200) | None => Ok(()),
            Some(status) => Err(CaptureError::Navigation(format!("{} returned status {}", url, status))),
        }
    }

    async fn screenshot(&mut self, full_page: bool) -> std::result::Result<Vec<u8>, CaptureError> {
        let tab = Arc::clone(&self.tab);
        joined(
            tokio::task::spawn_blocking(move || {
                let clip = if full_page {
                    let (width, height) = ChromePage::document_size(&tab)?;
                    let (width, height) = check_capture_size(width, height)?;
                    Some(Page::Viewport {
                        x: 0.0,
                        y: 0.0,
                        width: f64::from(width),
                        height: f64::from(height),
                        scale: 1.0,
                    })
                } else {
                    None
                };
                Ok(tab.capture_screenshot(Page::CaptureScreenshotFormatOption::Png, None, clip, true)?)
            })
            .await,
        )
    }

    fn active_requests(&self) -> i64 {
        self.events().in_flight.len() as i64
    }

    async fn close(self: Box<Self>) {
        let tab = self.tab;
        let result = tokio::task::spawn_blocking(move || tab.close(true)).await;
        match result {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => warn!("Failed to close tab: {}", e),
            Err(e) => warn!("Tab close task failed: {}", e),
        }
    }
}

//! Scripted stand-ins for browsers, renderers, stores and status sources

use crate::compare::encode_png;
use crate::config::Viewport;
use crate::error::{CaptureError, Error, Result};
use crate::pool::{Launcher, Worker};
use crate::render::{Render, RenderOutput, RenderPage, RenderStatus};
use crate::store::{ContentStore, MemoryStore, Network, PendingInput, RenderedContentRecord, TxStatus};
use crate::tx_status::TxStatusSource;
use async_trait::async_trait;
use image::{Rgba, RgbaImage};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// PNG of a single colour at the viewport size.
pub fn solid_png(view: Viewport, rgba: [u8; 4]) -> Vec<u8> {
    let image = RgbaImage::from_pixel(view.width, view.height, Rgba(rgba));
    encode_png(&image).unwrap()
}

/// One scripted screenshot result: PNG bytes plus in-flight request count.
#[derive(Debug, Clone)]
pub struct Shot(std::result::Result<(Vec<u8>, i64), CaptureError>);

impl Shot {
    pub fn ok(png: Vec<u8>, active_requests: i64) -> Self {
        Shot(Ok((png, active_requests)))
    }

    pub fn err(err: CaptureError) -> Self {
        Shot(Err(err))
    }
}

#[derive(Debug, Clone)]
enum Navigate {
    Ok,
    Err(CaptureError),
    Hang,
}

#[derive(Debug, Clone, Copy)]
enum Sequence {
    /// Stay on the last shot once the list runs out
    Hold,
    /// Start over from the first shot
    Cycle,
}

/// What every page opened on a fake worker does
#[derive(Debug, Clone)]
pub struct PageScript {
    shots: Vec<Shot>,
    sequence: Sequence,
    navigate: Navigate,
    full_page_err: Option<CaptureError>,
}

impl PageScript {
    pub fn repeating(shot: Shot) -> Self {
        Self::frames(vec![shot])
    }

    pub fn frames(shots: Vec<Shot>) -> Self {
        Self {
            shots,
            sequence: Sequence::Hold,
            navigate: Navigate::Ok,
            full_page_err: None,
        }
    }

    pub fn cycle(shots: Vec<Shot>) -> Self {
        Self {
            sequence: Sequence::Cycle,
            ..Self::frames(shots)
        }
    }

    pub fn navigate_err(mut self, err: CaptureError) -> Self {
        self.navigate = Navigate::Err(err);
        self
    }

    pub fn navigate_hang(mut self) -> Self {
        self.navigate = Navigate::Hang;
        self
    }

    /// Fail every full-page capture with `err`.
    pub fn full_page_err(mut self, err: CaptureError) -> Self {
        self.full_page_err = Some(err);
        self
    }

    fn shot(&self, n: usize) -> Shot {
        let index = match self.sequence {
            Sequence::Hold => n.min(self.shots.len() - 1),
            Sequence::Cycle => n % self.shots.len(),
        };
        self.shots[index].clone()
    }
}

/// Counters shared by a fake launcher and everything it creates
#[derive(Default)]
pub struct FakeStats {
    launched: AtomicUsize,
    reaped: AtomicUsize,
    closed: AtomicUsize,
    pages_opened: AtomicUsize,
    pages_closed: AtomicUsize,
    screenshots: Mutex<Vec<bool>>,
}

impl FakeStats {
    pub fn launched(&self) -> usize {
        self.launched.load(Ordering::SeqCst)
    }

    pub fn reaped(&self) -> usize {
        self.reaped.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn pages_opened(&self) -> usize {
        self.pages_opened.load(Ordering::SeqCst)
    }

    pub fn pages_closed(&self) -> usize {
        self.pages_closed.load(Ordering::SeqCst)
    }

    /// `full_page` flag of every screenshot request, in order
    pub fn screenshots(&self) -> Vec<bool> {
        self.screenshots.lock().unwrap().clone()
    }
}

type ScriptFn = dyn Fn(usize) -> PageScript + Send + Sync;

pub struct FakeLauncher {
    stats: Arc<FakeStats>,
    fail_at: Option<usize>,
    script: Arc<ScriptFn>,
}

impl FakeLauncher {
    pub fn new() -> Self {
        Self {
            stats: Arc::default(),
            fail_at: None,
            script: Arc::new(|_| PageScript::repeating(Shot::ok(solid_png(Viewport::default(), [0, 0, 0, 255]), 0))),
        }
    }

    /// Fail the launch of slot `index`.
    pub fn failing_at(mut self, index: usize) -> Self {
        self.fail_at = Some(index);
        self
    }

    /// Script for pages opened on a worker; receives the worker id.
    pub fn with_script(mut self, script: impl Fn(usize) -> PageScript + Send + Sync + 'static) -> Self {
        self.script = Arc::new(script);
        self
    }

    pub fn stats(&self) -> Arc<FakeStats> {
        Arc::clone(&self.stats)
    }
}

#[async_trait]
impl Launcher for FakeLauncher {
    type Worker = FakeWorker;

    async fn reap_strays(&self) {
        self.stats.reaped.fetch_add(1, Ordering::SeqCst);
    }

    async fn launch(&self, index: usize) -> Result<FakeWorker> {
        if self.fail_at == Some(index) {
            return Err(Error::InitializationError(format!("instance {} refused to start", index)));
        }
        self.stats.launched.fetch_add(1, Ordering::SeqCst);
        Ok(FakeWorker {
            id: index,
            busy: AtomicBool::new(false),
            stats: Arc::clone(&self.stats),
            script: Arc::clone(&self.script),
        })
    }
}

pub struct FakeWorker {
    id: usize,
    busy: AtomicBool,
    stats: Arc<FakeStats>,
    script: Arc<ScriptFn>,
}

impl FakeWorker {
    /// Returns false if the worker was already marked busy.
    pub fn mark_busy(&self) -> bool {
        !self.busy.swap(true, Ordering::SeqCst)
    }

    pub fn mark_idle(&self) {
        self.busy.store(false, Ordering::SeqCst);
    }
}

#[async_trait]
impl Worker for FakeWorker {
    fn id(&self) -> usize {
        self.id
    }

    async fn open_page(&self) -> Result<Box<dyn RenderPage>> {
        self.stats.pages_opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakePage {
            script: (self.script)(self.id),
            taken: 0,
            active_requests: 0,
            stats: Arc::clone(&self.stats),
        }))
    }

    async fn close(&self) {
        self.stats.closed.fetch_add(1, Ordering::SeqCst);
    }
}

struct FakePage {
    script: PageScript,
    taken: usize,
    active_requests: i64,
    stats: Arc<FakeStats>,
}

#[async_trait]
impl RenderPage for FakePage {
    async fn navigate(&mut self, _url: &str) -> std::result::Result<(), CaptureError> {
        match self.script.navigate.clone() {
            Navigate::Ok => Ok(()),
            Navigate::Err(err) => Err(err),
            Navigate::Hang => futures::future::pending().await,
        }
    }

    async fn screenshot(&mut self, full_page: bool) -> std::result::Result<Vec<u8>, CaptureError> {
        self.stats.screenshots.lock().unwrap().push(full_page);
        if full_page {
            if let Some(err) = &self.script.full_page_err {
                return Err(err.clone());
            }
        }
        let Shot(result) = self.script.shot(self.taken);
        self.taken += 1;
        let (png, active_requests) = result?;
        self.active_requests = active_requests;
        Ok(png)
    }

    fn active_requests(&self) -> i64 {
        self.active_requests
    }

    async fn close(self: Box<Self>) {
        self.stats.pages_closed.fetch_add(1, Ordering::SeqCst);
    }
}

/// Renderer that records URLs and answers with a fixed image
pub struct FakeRenderer {
    fail_on: Option<String>,
    urls: Mutex<Vec<String>>,
}

impl FakeRenderer {
    pub fn ok() -> Self {
        Self {
            fail_on: None,
            urls: Mutex::new(Vec::new()),
        }
    }

    /// Fail every URL ending in `/{id}`.
    pub fn failing_on(id: &str) -> Self {
        Self {
            fail_on: Some(format!("/{}", id)),
            ..Self::ok()
        }
    }

    pub fn urls(&self) -> Vec<String> {
        self.urls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Render for FakeRenderer {
    async fn render(&self, url: &str, _full_page: bool) -> Result<RenderOutput> {
        self.urls.lock().unwrap().push(url.to_string());
        if let Some(suffix) = &self.fail_on {
            if url.ends_with(suffix.as_str()) {
                return Err(Error::RenderError {
                    url: url.to_string(),
                    source: CaptureError::Browser("scripted failure".into()),
                });
            }
        }
        Ok(RenderOutput {
            content: vec![0x89, b'P', b'N', b'G'],
            status: RenderStatus::OkStable,
        })
    }
}

/// Content store whose first `failures` calls fail
pub struct FlakyStore {
    inner: Arc<MemoryStore>,
    failures: AtomicUsize,
}

impl FlakyStore {
    pub fn new(inner: Arc<MemoryStore>, failures: usize) -> Self {
        Self {
            inner,
            failures: AtomicUsize::new(failures),
        }
    }

    fn check(&self) -> Result<()> {
        let remaining = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        match remaining {
            Ok(_) => Err(Error::Store("connection reset".into())),
            Err(_) => Ok(()),
        }
    }
}

#[async_trait]
impl ContentStore for FlakyStore {
    async fn list_unrendered(&self, limit: usize, after_sequence: i64) -> Result<Vec<PendingInput>> {
        self.check()?;
        self.inner.list_unrendered(limit, after_sequence).await
    }

    async fn upsert_rendered(&self, records: &[RenderedContentRecord]) -> Result<()> {
        self.check()?;
        self.inner.upsert_rendered(records).await
    }

    async fn max_rendered_sequence(&self) -> Result<Option<i64>> {
        self.check()?;
        self.inner.max_rendered_sequence().await
    }
}

/// Status source answering from a fixed table; unknown txids are errors.
#[derive(Default)]
pub struct FakeStatusSource {
    answers: HashMap<String, TxStatus>,
    queried: Mutex<Vec<String>>,
}

impl FakeStatusSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, txid: &str, status: TxStatus) -> Self {
        self.answers.insert(txid.to_string(), status);
        self
    }

    pub fn queried(&self) -> Vec<String> {
        self.queried.lock().unwrap().clone()
    }
}

#[async_trait]
impl TxStatusSource for FakeStatusSource {
    async fn tx_status(&self, txid: &str, _network: Network) -> Result<TxStatus> {
        self.queried.lock().unwrap().push(txid.to_string());
        self.answers
            .get(txid)
            .copied()
            .ok_or_else(|| Error::TxStatus(format!("no scripted answer for {}", txid)))
    }
}

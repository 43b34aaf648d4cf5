//! Persistence seams consumed by the service loops
//!
//! The relational schema belongs to the web application; the loops only see
//! the two traits below. `MemoryStore` implements both and backs the tests
//! and local experiments.

use crate::error::{Error, Result};
use crate::render::RenderStatus;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};

/// An inscription-style content row waiting to be rendered
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingInput {
    pub id: String,
    pub sequence_number: i64,
    pub content_hash: String,
    pub content_type: String,
    pub is_recursive: bool,
}

/// Selection predicate for renderable content: HTML, or SVG that pulls in
/// other content recursively.
pub fn is_renderable(content_type: &str, is_recursive: bool) -> bool {
    content_type.starts_with("text/html") || (content_type.starts_with("image/svg") && is_recursive)
}

/// A persisted render
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderedContentRecord {
    pub id: String,
    pub sequence_number: i64,
    pub content: Vec<u8>,
    pub content_type: String,
    pub render_status: RenderStatus,
}

/// Bitcoin network a transaction was broadcast to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    Mainnet,
    Testnet,
    Signet,
    Regtest,
}

impl Network {
    pub fn as_str(self) -> &'static str {
        match self {
            Network::Mainnet => "mainnet",
            Network::Testnet => "testnet",
            Network::Signet => "signet",
            Network::Regtest => "regtest",
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Network {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "mainnet" | "bitcoin" => Ok(Network::Mainnet),
            "testnet" => Ok(Network::Testnet),
            "signet" => Ok(Network::Signet),
            "regtest" => Ok(Network::Regtest),
            other => Err(Error::Other(format!("unknown network: {}", other))),
        }
    }
}

/// Lifecycle of one broadcast transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxStatus {
    Pending,
    Confirmed,
    NotFound,
}

impl TxStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TxStatus::Pending => "pending",
            TxStatus::Confirmed => "confirmed",
            TxStatus::NotFound => "not_found",
        }
    }
}

impl fmt::Display for TxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TxStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(TxStatus::Pending),
            "confirmed" => Ok(TxStatus::Confirmed),
            "not_found" => Ok(TxStatus::NotFound),
            other => Err(Error::Other(format!("unknown tx status: {}", other))),
        }
    }
}

/// Commit/reveal transaction pair broadcast for a boost
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Boost {
    pub id: i64,
    pub network: Network,
    pub broadcast_status: String,
    pub commit_txid: String,
    pub commit_tx_status: TxStatus,
    pub reveal_txid: String,
    pub reveal_tx_status: TxStatus,
    pub created_at: DateTime<Utc>,
}

impl Boost {
    pub fn is_pending(&self) -> bool {
        self.commit_tx_status == TxStatus::Pending || self.reveal_tx_status == TxStatus::Pending
    }
}

/// Single sweep transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sweep {
    pub id: i64,
    pub network: Network,
    pub broadcast_status: String,
    pub txid: String,
    pub tx_status: TxStatus,
    pub created_at: DateTime<Utc>,
}

impl Sweep {
    pub fn is_pending(&self) -> bool {
        self.tx_status == TxStatus::Pending
    }
}

/// Leg status changes for a boost; `None` leaves the column untouched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BoostUpdate {
    pub commit_tx_status: Option<TxStatus>,
    pub reveal_tx_status: Option<TxStatus>,
}

impl BoostUpdate {
    pub fn is_empty(&self) -> bool {
        self.commit_tx_status.is_none() && self.reveal_tx_status.is_none()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepUpdate {
    pub tx_status: Option<TxStatus>,
}

/// Content and render cache access used by the render loop
#[async_trait]
pub trait ContentStore: Send + Sync {
    /// Renderable inputs with `sequence_number >= after_sequence`, ascending.
    async fn list_unrendered(&self, limit: usize, after_sequence: i64) -> Result<Vec<PendingInput>>;

    /// Insert or replace renders keyed by id.
    async fn upsert_rendered(&self, records: &[RenderedContentRecord]) -> Result<()>;

    /// Highest sequence number in the render cache.
    async fn max_rendered_sequence(&self) -> Result<Option<i64>>;
}

/// Broadcast record access used by the status loop
#[async_trait]
pub trait BroadcastStore: Send + Sync {
    async fn list_pending_boosts(&self) -> Result<Vec<Boost>>;
    async fn list_pending_sweeps(&self) -> Result<Vec<Sweep>>;
    async fn update_boost(&self, id: i64, update: BoostUpdate) -> Result<()>;
    async fn update_sweep(&self, id: i64, update: SweepUpdate) -> Result<()>;
}

/// Raw content row as the web application stores it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentRow {
    pub id: String,
    pub sequence_number: i64,
    pub content_hash: Option<String>,
    pub content_type: String,
    pub is_recursive: bool,
}

#[derive(Default)]
struct MemoryState {
    content: BTreeMap<i64, ContentRow>,
    rendered: BTreeMap<String, RenderedContentRecord>,
    boosts: BTreeMap<i64, Boost>,
    sweeps: BTreeMap<i64, Sweep>,
}

/// In-process implementation of both store traits
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryState>> {
        self.state
            .lock()
            .map_err(|_| Error::Store("memory store lock poisoned".into()))
    }

    pub fn insert_content(&self, row: ContentRow) -> Result<()> {
        self.lock()?.content.insert(row.sequence_number, row);
        Ok(())
    }

    pub fn rendered(&self, id: &str) -> Result<Option<RenderedContentRecord>> {
        Ok(self.lock()?.rendered.get(id).cloned())
    }

    pub fn rendered_count(&self) -> Result<usize> {
        Ok(self.lock()?.rendered.len())
    }

    pub fn insert_boost(&self, boost: Boost) -> Result<()> {
        self.lock()?.boosts.insert(boost.id, boost);
        Ok(())
    }

    pub fn boost(&self, id: i64) -> Result<Option<Boost>> {
        Ok(self.lock()?.boosts.get(&id).cloned())
    }

    pub fn insert_sweep(&self, sweep: Sweep) -> Result<()> {
        self.lock()?.sweeps.insert(sweep.id, sweep);
        Ok(())
    }

    pub fn sweep(&self, id: i64) -> Result<Option<Sweep>> {
        Ok(self.lock()?.sweeps.get(&id).cloned())
    }
}

#[async_trait]
impl ContentStore for MemoryStore {
    async fn list_unrendered(&self, limit: usize, after_sequence: i64) -> Result<Vec<PendingInput>> {
        let state = self.lock()?;
        let inputs = state
            .content
            .range(after_sequence..)
            .map(|(_, row)| row)
            .filter(|row| is_renderable(&row.content_type, row.is_recursive))
            .filter_map(|row| {
                let content_hash = row.content_hash.clone()?;
                Some(PendingInput {
                    id: row.id.clone(),
                    sequence_number: row.sequence_number,
                    content_hash,
                    content_type: row.content_type.clone(),
                    is_recursive: row.is_recursive,
                })
            })
            .take(limit)
            .collect();
        Ok(inputs)
    }

    async fn upsert_rendered(&self, records: &[RenderedContentRecord]) -> Result<()> {
        let mut state = self.lock()?;
        for record in records {
            state.rendered.insert(record.id.clone(), record.clone());
        }
        Ok(())
    }

    async fn max_rendered_sequence(&self) -> Result<Option<i64>> {
        Ok(self.lock()?.rendered.values().map(|r| r.sequence_number).max())
    }
}

#[async_trait]
impl BroadcastStore for MemoryStore {
    async fn list_pending_boosts(&self) -> Result<Vec<Boost>> {
        Ok(self.lock()?.boosts.values().filter(|b| b.is_pending()).cloned().collect())
    }

    async fn list_pending_sweeps(&self) -> Result<Vec<Sweep>> {
        Ok(self.lock()?.sweeps.values().filter(|s| s.is_pending()).cloned().collect())
    }

    async fn update_boost(&self, id: i64, update: BoostUpdate) -> Result<()> {
        let mut state = self.lock()?;
        let boost = state
            .boosts
            .get_mut(&id)
            .ok_or_else(|| Error::Store(format!("boost {} not found", id)))?;
        if let Some(status) = update.commit_tx_status {
            boost.commit_tx_status = status;
        }
        if let Some(status) = update.reveal_tx_status {
            boost.reveal_tx_status = status;
        }
        Ok(())
    }

    async fn update_sweep(&self, id: i64, update: SweepUpdate) -> Result<()> {
        let mut state = self.lock()?;
        let sweep = state
            .sweeps
            .get_mut(&id)
            .ok_or_else(|| Error::Store(format!("sweep {} not found", id)))?;
        if let Some(status) = update.tx_status {
            sweep.tx_status = status;
        }
        Ok(())
    }
}

//! Confirmation tracking for broadcast boost and sweep transactions
//!
//! Every pass loads the records with a `pending` leg, asks the status source
//! about each pending leg and writes back only real transitions:
//! `pending -> confirmed`, or `pending -> not_found` once the record is older
//! than the grace period. A leg that left `pending` is never queried again,
//! so `confirmed` is final.

use crate::config::TxStatusConfig;
use crate::error::{Error, Result};
use crate::store::{Boost, BoostUpdate, BroadcastStore, Network, Sweep, SweepUpdate, TxStatus};
use crate::supervisor::sleep_unless_cancelled;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// External view of a transaction's confirmation state
#[async_trait]
pub trait TxStatusSource: Send + Sync {
    /// Must fail on any response it cannot interpret.
    async fn tx_status(&self, txid: &str, network: Network) -> Result<TxStatus>;
}

/// Esplora-compatible HTTP status source (mempool.space, blockstream.info)
pub struct EsploraStatusSource {
    client: reqwest::Client,
    endpoints: HashMap<Network, String>,
}

impl EsploraStatusSource {
    pub fn new(endpoints: HashMap<Network, String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| Error::InitializationError(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self { client, endpoints })
    }

    /// Public mempool.space endpoints for the main networks.
    pub fn default_endpoints() -> HashMap<Network, String> {
        HashMap::from([
            (Network::Mainnet, "https://mempool.space/api".to_string()),
            (Network::Testnet, "https://mempool.space/testnet/api".to_string()),
            (Network::Signet, "https://mempool.space/signet/api".to_string()),
        ])
    }
}

/// Interpret the body of `GET /tx/:txid/status`.
pub fn parse_esplora_status(body: &serde_json::Value) -> Result<TxStatus> {
    match body.get("confirmed").and_then(serde_json::Value::as_bool) {
        Some(true) => Ok(TxStatus::Confirmed),
        Some(false) => Ok(TxStatus::Pending),
        None => Err(Error::TxStatus(body.to_string())),
    }
}

#[async_trait]
impl TxStatusSource for EsploraStatusSource {
    async fn tx_status(&self, txid: &str, network: Network) -> Result<TxStatus> {
        let base = self
            .endpoints
            .get(&network)
            .ok_or_else(|| Error::ConfigError(format!("no status endpoint for {}", network)))?;
        let url = format!("{}/tx/{}/status", base.trim_end_matches('/'), txid);

        let resp = self.client.get(&url).send().await?;
        let status = resp.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(TxStatus::NotFound);
        }
        if !status.is_success() {
            return Err(Error::TxStatus(format!("{} returned {}", url, status)));
        }

        let text = resp.text().await?;
        let body: serde_json::Value =
            serde_json::from_str(&text).map_err(|_| Error::TxStatus(format!("{} returned {:?}", url, text)))?;
        parse_esplora_status(&body)
    }
}

/// New status for a leg, or `None` when nothing should be written.
pub fn resolve_leg(
    current: TxStatus,
    observed: TxStatus,
    age: chrono::Duration,
    grace: chrono::Duration,
) -> Option<TxStatus> {
    if current != TxStatus::Pending {
        return None;
    }
    match observed {
        TxStatus::Confirmed => Some(TxStatus::Confirmed),
        TxStatus::NotFound if age > grace => Some(TxStatus::NotFound),
        _ => None,
    }
}

/// What one pass found
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassOutcome {
    /// Nothing was pending
    Idle,
    /// Pending records were checked; `updated` of them changed
    Processed { updated: usize },
}

pub struct TxStatusLoop {
    store: Arc<dyn BroadcastStore>,
    source: Arc<dyn TxStatusSource>,
    config: TxStatusConfig,
}

impl TxStatusLoop {
    pub fn new(store: Arc<dyn BroadcastStore>, source: Arc<dyn TxStatusSource>, config: TxStatusConfig) -> Self {
        Self { store, source, config }
    }

    /// Check every pending record once, boosts before sweeps.
    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<PassOutcome> {
        let boosts = self.store.list_pending_boosts().await?;
        let sweeps = self.store.list_pending_sweeps().await?;
        if boosts.is_empty() && sweeps.is_empty() {
            return Ok(PassOutcome::Idle);
        }
        debug!("Checking {} boosts and {} sweeps", boosts.len(), sweeps.len());

        let mut updated = 0;
        for boost in &boosts {
            if self.check_boost(boost, now).await? {
                updated += 1;
            }
        }
        for sweep in &sweeps {
            if self.check_sweep(sweep, now).await? {
                updated += 1;
            }
        }
        Ok(PassOutcome::Processed { updated })
    }

    async fn check_leg(
        &self,
        txid: &str,
        current: TxStatus,
        network: Network,
        age: chrono::Duration,
    ) -> Result<Option<TxStatus>> {
        if current != TxStatus::Pending {
            return Ok(None);
        }
        let observed = self.source.tx_status(txid, network).await?;
        Ok(resolve_leg(current, observed, age, self.config.not_found_grace))
    }

    async fn check_boost(&self, boost: &Boost, now: DateTime<Utc>) -> Result<bool> {
        let age = now - boost.created_at;
        let update = BoostUpdate {
            commit_tx_status: self
                .check_leg(&boost.commit_txid, boost.commit_tx_status, boost.network, age)
                .await?,
            reveal_tx_status: self
                .check_leg(&boost.reveal_txid, boost.reveal_tx_status, boost.network, age)
                .await?,
        };
        if update.is_empty() {
            return Ok(false);
        }

        self.store.update_boost(boost.id, update).await?;
        info!(
            "Boost {} on {}: commit {:?} reveal {:?}",
            boost.id, boost.network, update.commit_tx_status, update.reveal_tx_status
        );
        Ok(true)
    }

    async fn check_sweep(&self, sweep: &Sweep, now: DateTime<Utc>) -> Result<bool> {
        let age = now - sweep.created_at;
        let Some(status) = self
            .check_leg(&sweep.txid, sweep.tx_status, sweep.network, age)
            .await?
        else {
            return Ok(false);
        };

        self.store
            .update_sweep(sweep.id, SweepUpdate { tx_status: Some(status) })
            .await?;
        info!("Sweep {} on {}: {}", sweep.id, sweep.network, status);
        Ok(true)
    }

    /// Run until `shutdown` is cancelled.
    pub async fn run(&self, shutdown: CancellationToken) {
        while !shutdown.is_cancelled() {
            match self.run_once(Utc::now()).await {
                Ok(PassOutcome::Idle) => sleep_unless_cancelled(self.config.idle_sleep, &shutdown).await,
                Ok(PassOutcome::Processed { updated }) => {
                    debug!("Status pass updated {} records", updated);
                    sleep_unless_cancelled(self.config.pass_sleep, &shutdown).await;
                }
                Err(err) => {
                    warn!(
                        "Transaction status pass failed: {}; retrying in {:?}",
                        err, self.config.error_backoff
                    );
                    sleep_unless_cancelled(self.config.error_backoff, &shutdown).await;
                }
            }
        }
        info!("Transaction status loop stopped");
    }
}

//! PostgreSQL implementation of the content and broadcast stores
//!
//! The tables are owned by the web application; this module only reads
//! `content`, `boosts` and `sweeps`, upserts into `rendered_content` and
//! updates the status columns of pending broadcast records.

use crate::error::Result;
use crate::store::{
    Boost, BoostUpdate, BroadcastStore, ContentStore, PendingInput, RenderedContentRecord, Sweep, SweepUpdate,
    TxStatus,
};
use async_trait::async_trait;
use log::debug;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};

#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn boost_from_row(row: &PgRow) -> Result<Boost> {
    Ok(Boost {
        id: row.try_get("id")?,
        network: row.try_get::<String, _>("network")?.parse()?,
        broadcast_status: row.try_get("broadcast_status")?,
        commit_txid: row.try_get("commit_txid")?,
        commit_tx_status: row.try_get::<String, _>("commit_tx_status")?.parse()?,
        reveal_txid: row.try_get("reveal_txid")?,
        reveal_tx_status: row.try_get::<String, _>("reveal_tx_status")?.parse()?,
        created_at: row.try_get("created_at")?,
    })
}

fn sweep_from_row(row: &PgRow) -> Result<Sweep> {
    Ok(Sweep {
        id: row.try_get("id")?,
        network: row.try_get::<String, _>("network")?.parse()?,
        broadcast_status: row.try_get("broadcast_status")?,
        txid: row.try_get("txid")?,
        tx_status: row.try_get::<String, _>("tx_status")?.parse()?,
        created_at: row.try_get("created_at")?,
    })
}

#[async_trait]
impl ContentStore for PostgresStore {
    async fn list_unrendered(&self, limit: usize, after_sequence: i64) -> Result<Vec<PendingInput>> {
        let rows = sqlx::query(
            r#"
            SELECT id, sequence_number, content_hash, content_type, is_recursive
            FROM content
            WHERE sequence_number >= $1
              AND content_hash IS NOT NULL
              AND (content_type LIKE 'text/html%'
                   OR (content_type LIKE 'image/svg%' AND is_recursive))
            ORDER BY sequence_number
            LIMIT $2
            "#,
        )
        .bind(after_sequence)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(PendingInput {
                    id: row.try_get("id")?,
                    sequence_number: row.try_get("sequence_number")?,
                    content_hash: row.try_get("content_hash")?,
                    content_type: row.try_get("content_type")?,
                    is_recursive: row.try_get("is_recursive")?,
                })
            })
            .collect()
    }

    async fn upsert_rendered(&self, records: &[RenderedContentRecord]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }

        let mut query: QueryBuilder<Postgres> = QueryBuilder::new(
            "INSERT INTO rendered_content (id, sequence_number, content, content_type, render_status) ",
        );
        query.push_values(records, |mut b, record| {
            b.push_bind(&record.id)
                .push_bind(record.sequence_number)
                .push_bind(&record.content)
                .push_bind(&record.content_type)
                .push_bind(record.render_status.as_str());
        });
        query.push(
            " ON CONFLICT (id) DO UPDATE SET \
              sequence_number = EXCLUDED.sequence_number, \
              content = EXCLUDED.content, \
              content_type = EXCLUDED.content_type, \
              render_status = EXCLUDED.render_status",
        );
        query.build().execute(&self.pool).await?;

        debug!("Upserted {} rendered rows", records.len());
        Ok(())
    }

    async fn max_rendered_sequence(&self) -> Result<Option<i64>> {
        let max: Option<i64> = sqlx::query_scalar("SELECT MAX(sequence_number) FROM rendered_content")
            .fetch_one(&self.pool)
            .await?;
        Ok(max)
    }
}

#[async_trait]
impl BroadcastStore for PostgresStore {
    async fn list_pending_boosts(&self) -> Result<Vec<Boost>> {
        let rows = sqlx::query(
            r#"
            SELECT id, network, broadcast_status, commit_txid, commit_tx_status,
                   reveal_txid, reveal_tx_status, created_at
            FROM boosts
            WHERE commit_tx_status = $1 OR reveal_tx_status = $1
            ORDER BY id
            "#,
        )
        .bind(TxStatus::Pending.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(boost_from_row).collect()
    }

    async fn list_pending_sweeps(&self) -> Result<Vec<Sweep>> {
        let rows = sqlx::query(
            r#"
            SELECT id, network, broadcast_status, txid, tx_status, created_at
            FROM sweeps
            WHERE tx_status = $1
            ORDER BY id
            "#,
        )
        .bind(TxStatus::Pending.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(sweep_from_row).collect()
    }

    async fn update_boost(&self, id: i64, update: BoostUpdate) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE boosts
            SET commit_tx_status = COALESCE($2, commit_tx_status),
                reveal_tx_status = COALESCE($3, reveal_tx_status)
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(update.commit_tx_status.map(TxStatus::as_str))
        .bind(update.reveal_tx_status.map(TxStatus::as_str))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_sweep(&self, id: i64, update: SweepUpdate) -> Result<()> {
        sqlx::query("UPDATE sweeps SET tx_status = COALESCE($2, tx_status) WHERE id = $1")
            .bind(id)
            .bind(update.tx_status.map(TxStatus::as_str))
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

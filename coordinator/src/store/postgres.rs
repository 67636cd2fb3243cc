//! PostgreSQL store.

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::info;

use lra_common::{Lra, LraId, ParticipantId, ParticipantRecord, Result};

use super::{store_error, LraStore, StoredState};

const SCHEMA: &[&str] = &[
    r#"CREATE TABLE IF NOT EXISTS lra_records (
        id TEXT PRIMARY KEY,
        parent_id TEXT NULL,
        status TEXT NOT NULL,
        record TEXT NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )"#,
    r#"CREATE TABLE IF NOT EXISTS lra_participants (
        lra_id TEXT NOT NULL REFERENCES lra_records (id) ON DELETE CASCADE,
        participant_id UUID NOT NULL,
        record TEXT NOT NULL,
        PRIMARY KEY (lra_id, participant_id)
    )"#,
];

/// Store backed by PostgreSQL. Records are kept as JSON documents.
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Connect to the database.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .map_err(store_error)?;
        Ok(Self { pool })
    }

    /// Wrap an existing pool.
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create tables if they do not exist.
    pub async fn migrate(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(store_error)?;
        }
        info!("LRA store schema ready");
        Ok(())
    }
}

#[async_trait]
impl LraStore for PgStore {
    async fn save_lra(&self, lra: &Lra) -> Result<()> {
        let record = serde_json::to_string(lra).map_err(store_error)?;
        sqlx::query(
            "INSERT INTO lra_records (id, parent_id, status, record) VALUES ($1, $2, $3, $4)
             ON CONFLICT (id) DO UPDATE
             SET status = EXCLUDED.status, record = EXCLUDED.record, updated_at = now()",
        )
        .bind(lra.id.as_str())
        .bind(lra.parent_id.as_ref().map(|p| p.as_str()))
        .bind(lra.status.as_str())
        .bind(record)
        .execute(&self.pool)
        .await
        .map_err(store_error)?;
        Ok(())
    }

    async fn remove_lra(&self, lra_id: &LraId) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(store_error)?;
        sqlx::query("DELETE FROM lra_participants WHERE lra_id = $1")
            .bind(lra_id.as_str())
            .execute(&mut *tx)
            .await
            .map_err(store_error)?;
        sqlx::query("DELETE FROM lra_records WHERE id = $1")
            .bind(lra_id.as_str())
            .execute(&mut *tx)
            .await
            .map_err(store_error)?;
        tx.commit().await.map_err(store_error)
    }

    async fn save_participant(&self, participant: &ParticipantRecord) -> Result<()> {
        let record = serde_json::to_string(participant).map_err(store_error)?;
        sqlx::query(
            "INSERT INTO lra_participants (lra_id, participant_id, record) VALUES ($1, $2, $3)
             ON CONFLICT (lra_id, participant_id) DO UPDATE SET record = EXCLUDED.record",
        )
        .bind(participant.lra_id.as_str())
        .bind(*participant.id.as_uuid())
        .bind(record)
        .execute(&self.pool)
        .await
        .map_err(store_error)?;
        Ok(())
    }

    async fn remove_participant(&self, lra_id: &LraId, participant_id: &ParticipantId) -> Result<()> {
        sqlx::query("DELETE FROM lra_participants WHERE lra_id = $1 AND participant_id = $2")
            .bind(lra_id.as_str())
            .bind(*participant_id.as_uuid())
            .execute(&self.pool)
            .await
            .map_err(store_error)?;
        Ok(())
    }

    async fn load(&self) -> Result<StoredState> {
        let lras: Vec<String> = sqlx::query_scalar("SELECT record FROM lra_records")
            .fetch_all(&self.pool)
            .await
            .map_err(store_error)?;
        let participants: Vec<String> = sqlx::query_scalar("SELECT record FROM lra_participants")
            .fetch_all(&self.pool)
            .await
            .map_err(store_error)?;

        Ok(StoredState {
            lras: lras
                .iter()
                .map(|r| serde_json::from_str(r).map_err(store_error))
                .collect::<Result<_>>()?,
            participants: participants
                .iter()
                .map(|r| serde_json::from_str(r).map_err(store_error))
                .collect::<Result<_>>()?,
        })
    }
}

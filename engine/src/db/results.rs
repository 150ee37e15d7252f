/// Link result persistence
///
/// Payloads are stored exactly as handed over (base64-encoded JSON); this
/// repository does not decode them.
use anyhow::{Context, Result};
use sqlx::{Row, SqlitePool};

pub struct ResultRepository {
    pool: SqlitePool,
}

impl ResultRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Store the payload for a link, replacing any earlier one
    pub async fn save(&self, link_id: &str, payload: &str) -> Result<()> {
        let now = chrono::Utc::now().timestamp();

        sqlx::query(
            "INSERT INTO link_results (link_id, payload, created_at) VALUES (?, ?, ?) \
             ON CONFLICT(link_id) DO UPDATE SET payload = excluded.payload",
        )
        .bind(link_id)
        .bind(payload)
        .bind(now)
        .execute(&self.pool)
        .await
        .context("Failed to save link result")?;

        Ok(())
    }

    pub async fn get(&self, link_id: &str) -> Result<Option<String>> {
        let row = sqlx::query("SELECT payload FROM link_results WHERE link_id = ?")
            .bind(link_id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch link result")?;

        Ok(row.map(|r| r.get("payload")))
    }
}

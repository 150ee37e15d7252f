/// Persisted fact source operations
///
/// Each closed operation leaves behind one source document holding the facts
/// and relationships its links produced. Documents are stored as JSON next to
/// a few summary columns used for listing.
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};

use super::SourceDocument;

/// Listing row for a persisted source
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SourceSummary {
    pub id: String,
    pub name: String,
    pub operation_id: String,
    pub fact_count: i64,
    pub relationship_count: i64,
    pub created_at: i64,
}

pub struct SourceRepository {
    pool: SqlitePool,
}

impl SourceRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn save(&self, document: &SourceDocument) -> Result<()> {
        let body = serde_json::to_string(document).context("Failed to serialize source")?;

        sqlx::query(
            "INSERT INTO sources (id, name, operation_id, fact_count, relationship_count, document, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&document.id)
        .bind(&document.name)
        .bind(&document.operation_id)
        .bind(document.facts.len() as i64)
        .bind(document.relationships.len() as i64)
        .bind(body)
        .bind(document.created.timestamp())
        .execute(&self.pool)
        .await
        .context("Failed to save source")?;

        Ok(())
    }

    pub async fn get(&self, id: &str) -> Result<Option<SourceDocument>> {
        let row = sqlx::query("SELECT document FROM sources WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch source")?;

        row.map(|r| {
            let body: String = r.get("document");
            serde_json::from_str(&body).context("Failed to parse stored source")
        })
        .transpose()
    }

    /// Most recent sources first
    pub async fn list(&self, limit: i64) -> Result<Vec<SourceSummary>> {
        let rows = sqlx::query(
            "SELECT id, name, operation_id, fact_count, relationship_count, created_at \
             FROM sources ORDER BY created_at DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list sources")?;

        Ok(rows
            .into_iter()
            .map(|r| SourceSummary {
                id: r.get("id"),
                name: r.get("name"),
                operation_id: r.get("operation_id"),
                fact_count: r.get("fact_count"),
                relationship_count: r.get("relationship_count"),
                created_at: r.get("created_at"),
            })
            .collect())
    }
}

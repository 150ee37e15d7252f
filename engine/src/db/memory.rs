//! In-memory result store and source sink
//!
//! Used for dry runs (`--ephemeral`) and tests. Nothing survives the process.

use async_trait::async_trait;
use sdk::errors::EngineError;
use std::collections::HashMap;
use tokio::sync::RwLock;

use super::{ResultStore, SourceDocument, SourceSink};

#[derive(Debug, Default)]
pub struct MemoryStore {
    results: RwLock<HashMap<String, String>>,
    sources: RwLock<Vec<SourceDocument>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sources persisted so far, oldest first
    pub async fn sources(&self) -> Vec<SourceDocument> {
        self.sources.read().await.clone()
    }
}

#[async_trait]
impl ResultStore for MemoryStore {
    async fn save_result(&self, link_id: &str, payload: &str) -> Result<(), EngineError> {
        self.results
            .write()
            .await
            .insert(link_id.to_string(), payload.to_string());
        Ok(())
    }

    async fn read_result(&self, link_id: &str) -> Result<Option<String>, EngineError> {
        Ok(self.results.read().await.get(link_id).cloned())
    }
}

#[async_trait]
impl SourceSink for MemoryStore {
    async fn persist_source(&self, document: &SourceDocument) -> Result<(), EngineError> {
        self.sources.write().await.push(document.clone());
        Ok(())
    }
}

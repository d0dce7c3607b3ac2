//! Where swap records are kept between steps and across restarts.

use crate::{record::SwapRecord, SwapId};
use std::collections::HashMap;
use tokio::sync::RwLock;

#[async_trait::async_trait]
pub trait SwapRepository: Send + Sync + 'static {
    /// Inserts the record or replaces the stored one with the same id.
    async fn upsert(&self, record: &SwapRecord) -> anyhow::Result<()>;
    async fn get_by_id(&self, id: SwapId) -> anyhow::Result<Option<SwapRecord>>;
    /// All records not yet in a terminal phase.
    async fn list_active(&self) -> anyhow::Result<Vec<SwapRecord>>;
}

#[derive(Debug, Default)]
pub struct MemoryRepository {
    records: RwLock<HashMap<SwapId, SwapRecord>>,
}

#[async_trait::async_trait]
impl SwapRepository for MemoryRepository {
    async fn upsert(&self, record: &SwapRecord) -> anyhow::Result<()> {
        let _ = self.records.write().await.insert(record.id, record.clone());

        Ok(())
    }

    async fn get_by_id(&self, id: SwapId) -> anyhow::Result<Option<SwapRecord>> {
        Ok(self.records.read().await.get(&id).cloned())
    }

    async fn list_active(&self) -> anyhow::Result<Vec<SwapRecord>> {
        Ok(self
            .records
            .read()
            .await
            .values()
            .filter(|record| !record.is_terminal())
            .cloned()
            .collect())
    }
}

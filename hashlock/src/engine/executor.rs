use super::SwapEngine;
use crate::{
    poll::{cancellation, Canceller},
    record::{KeyPaths, SwapRecord},
    terms::SwapTerms,
    Role, SwapId,
};
use anyhow::Context;
use std::{collections::HashMap, sync::Arc};
use tokio::{sync::Mutex, task::JoinHandle};

/// Runs many swaps side by side, each in its own task.
#[derive(Debug, Clone)]
pub struct SwapExecutor {
    engine: SwapEngine,
    running: Arc<Mutex<HashMap<SwapId, Canceller>>>,
}

impl SwapExecutor {
    pub fn new(engine: SwapEngine) -> Self {
        SwapExecutor {
            engine,
            running: Arc::default(),
        }
    }

    /// Persists a freshly agreed swap and starts executing it.
    pub async fn start(
        &self,
        role: Role,
        terms: SwapTerms,
        key_paths: KeyPaths,
    ) -> anyhow::Result<JoinHandle<anyhow::Result<SwapRecord>>> {
        let record = SwapRecord::new(role, terms, key_paths);

        self.engine
            .repository
            .upsert(&record)
            .await
            .context("failed to persist new swap")?;

        Ok(self.execute(record).await)
    }

    pub async fn execute(&self, record: SwapRecord) -> JoinHandle<anyhow::Result<SwapRecord>> {
        let swap_id = record.id;
        let (canceller, token) = cancellation();
        let _ = self.running.lock().await.insert(swap_id, canceller);

        let engine = self.engine.clone();
        let running = self.running.clone();

        tokio::spawn(async move {
            let result = engine.run(record, token).await;
            let _ = running.lock().await.remove(&swap_id);

            match &result {
                Ok(record) => tracing::info!("swap {} finished as {}", swap_id, record.phase()),
                Err(e) => tracing::warn!("swap {} execution failed: {:#}", swap_id, e),
            }

            result
        })
    }

    /// Asks a running swap to stop. Only takes effect while the swap has not
    /// locked any funds.
    pub async fn cancel(&self, swap_id: SwapId) -> bool {
        match self.running.lock().await.get(&swap_id) {
            Some(canceller) => {
                canceller.cancel();
                true
            }
            None => false,
        }
    }

    /// Picks up every swap that did not reach a terminal phase, e.g. after a
    /// restart.
    pub async fn resume_active(&self) -> anyhow::Result<Vec<JoinHandle<anyhow::Result<SwapRecord>>>> {
        let records = self
            .engine
            .repository
            .list_active()
            .await
            .context("failed to load active swaps")?;

        let mut handles = Vec::with_capacity(records.len());
        for record in records {
            tracing::info!("resuming swap {} in phase {}", record.id, record.phase());
            handles.push(self.execute(record).await);
        }

        Ok(handles)
    }
}

use super::SagaInstance;
use archivum_catalog::Catalog;
use archivum_common::{Error, FileId, Result, SagaId};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::warn;

/// Durable saga progress, keyed by saga id
#[derive(Clone)]
pub struct SagaLog {
    catalog: Arc<Catalog>,
}

impl SagaLog {
    pub fn new(catalog: Arc<Catalog>) -> Self {
        Self { catalog }
    }

    pub fn save(&self, instance: &SagaInstance) -> Result<()> {
        let json = serde_json::to_vec(instance)?;
        self.catalog
            .put_saga(&instance.saga_id.to_string(), &json)?;
        Ok(())
    }

    pub fn load(&self, saga_id: SagaId) -> Result<SagaInstance> {
        let key = saga_id.to_string();
        let bytes = self
            .catalog
            .get_saga(&key)?
            .ok_or_else(|| Error::SagaNotFound(key))?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// All readable instances. Undecodable rows are logged and skipped.
    pub fn load_all(&self) -> Result<Vec<SagaInstance>> {
        let mut instances = Vec::new();
        for (key, bytes) in self.catalog.load_sagas()? {
            match serde_json::from_slice(&bytes) {
                Ok(instance) => instances.push(instance),
                Err(e) => warn!(saga_id = %key, error = %e, "Skipping unreadable saga log entry"),
            }
        }
        Ok(instances)
    }

    pub fn delete(&self, saga_id: SagaId) -> Result<()> {
        Ok(self.catalog.delete_saga(&saga_id.to_string())?)
    }

    /// Files touched by sagas that have not reached a terminal state
    pub fn unfinished_files(&self) -> Result<HashSet<FileId>> {
        Ok(self
            .load_all()?
            .into_iter()
            .filter(|s| !s.state.is_terminal())
            .map(|s| s.context.file_id)
            .collect())
    }
}

//! Context manager - layered, versioned, append-only key/value context.
//!
//! Scopes nest `project ⊃ feature ⊃ step`. A read at a step scope that has
//! no version of the key falls through to the feature, then the project
//! scope. Reads can be pinned to a snapshot (the global commit sequence
//! returned by `snapshot()` or carried on every written layer).

use crate::error::ServerError;
use crate::models::context::{ContextLayer, ContextScope};
use crate::store::ContextStore;

#[derive(Clone)]
pub struct ContextManager {
    store: ContextStore,
}

impl ContextManager {
    pub fn new(store: ContextStore) -> Self {
        Self { store }
    }

    /// Append a new version of `key` at `scope`.
    pub async fn write(
        &self,
        scope: &ContextScope,
        key: &str,
        value: serde_json::Value,
        writer_id: &str,
    ) -> Result<ContextLayer, ServerError> {
        if key.trim().is_empty() {
            return Err(ServerError::BadRequest("context key must not be empty".to_string()));
        }
        let layer = self
            .store
            .append(&scope.key(), key, &value, writer_id)
            .await?;
        tracing::debug!(
            "[Context] {} {} = v{} by {}",
            layer.scope,
            layer.key,
            layer.version,
            writer_id
        );
        Ok(layer)
    }

    /// Most specific visible version of `key`, walking outwards from
    /// `scope`. `as_of` pins the read to a snapshot sequence.
    pub async fn read(
        &self,
        scope: &ContextScope,
        key: &str,
        as_of: Option<u64>,
    ) -> Result<Option<ContextLayer>, ServerError> {
        for candidate in scope.chain() {
            if let Some(layer) = self.store.latest(&candidate.key(), key, as_of).await? {
                return Ok(Some(layer));
            }
        }
        Ok(None)
    }

    /// Convenience wrapper returning only the value.
    pub async fn read_value(
        &self,
        scope: &ContextScope,
        key: &str,
    ) -> Result<Option<serde_json::Value>, ServerError> {
        Ok(self.read(scope, key, None).await?.map(|l| l.value))
    }

    /// One exact version at exactly this scope (no fall-through).
    pub async fn read_version(
        &self,
        scope: &ContextScope,
        key: &str,
        version: u64,
    ) -> Result<Option<ContextLayer>, ServerError> {
        self.store.version(&scope.key(), key, version).await
    }

    pub async fn history(
        &self,
        scope: &ContextScope,
        key: &str,
    ) -> Result<Vec<ContextLayer>, ServerError> {
        self.store.history(&scope.key(), key).await
    }

    /// Latest value of every key written at exactly this scope.
    pub async fn list(&self, scope: &ContextScope) -> Result<Vec<ContextLayer>, ServerError> {
        self.store.list_latest(&scope.key()).await
    }

    /// Current commit sequence; pass it as `as_of` for repeatable reads.
    pub async fn snapshot(&self) -> Result<u64, ServerError> {
        self.store.max_seq().await
    }
}

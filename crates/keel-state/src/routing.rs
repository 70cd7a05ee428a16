//! RoutingStore — partition-scoped gateway configuration storage.
//!
//! Gateways read their per-hostname routing descriptors from here. Rows
//! are keyed by `{partition}/{hostname}` and written in bulk: a batch of
//! configs either lands entirely or not at all.

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable};
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::GATEWAY_CONFIGS;
use crate::types::GatewayConfig;

macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Gateway config store for one routing partition.
#[derive(Clone)]
pub struct RoutingStore {
    db: Arc<Database>,
    partition: String,
}

impl RoutingStore {
    /// Open (or create) a routing store at `path`, scoped to `partition`.
    pub fn open(path: &Path, partition: &str) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        Self::from_db(db, partition)
    }

    /// In-memory routing store (for testing).
    pub fn open_in_memory(partition: &str) -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        Self::from_db(db, partition)
    }

    fn from_db(db: Database, partition: &str) -> StateResult<Self> {
        let txn = db.begin_write().map_err(map_err!(Transaction))?;
        txn.open_table(GATEWAY_CONFIGS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%partition, "routing store opened");
        Ok(Self {
            db: Arc::new(db),
            partition: partition.to_string(),
        })
    }

    pub fn partition(&self) -> &str {
        &self.partition
    }

    fn key(&self, hostname: &str) -> String {
        format!("{}/{}", self.partition, hostname)
    }

    /// Insert or replace every config in one transaction.
    pub fn upsert_configs(&self, configs: &[GatewayConfig]) -> StateResult<()> {
        if configs.is_empty() {
            return Ok(());
        }
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(GATEWAY_CONFIGS).map_err(map_err!(Table))?;
            for config in configs {
                let key = self.key(&config.hostname);
                let value = serde_json::to_vec(config).map_err(map_err!(Serialize))?;
                table
                    .insert(key.as_str(), value.as_slice())
                    .map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(partition = %self.partition, count = configs.len(), "gateway configs upserted");
        Ok(())
    }

    pub fn get_config(&self, hostname: &str) -> StateResult<Option<GatewayConfig>> {
        let key = self.key(hostname);
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(GATEWAY_CONFIGS).map_err(map_err!(Table))?;
        let config = match table.get(key.as_str()).map_err(map_err!(Read))? {
            Some(guard) => Some(serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?),
            None => None,
        };
        Ok(config)
    }

    /// All configs in this partition pointing at `deployment_id`.
    pub fn list_for_deployment(&self, deployment_id: &str) -> StateResult<Vec<GatewayConfig>> {
        let prefix = format!("{}/", self.partition);
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(GATEWAY_CONFIGS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if !key.value().starts_with(&prefix) {
                continue;
            }
            let config: GatewayConfig =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            if config.deployment_id == deployment_id {
                results.push(config);
            }
        }
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(hostname: &str, deployment_id: &str) -> GatewayConfig {
        GatewayConfig {
            hostname: hostname.to_string(),
            workspace_id: "ws-1".to_string(),
            project_id: "proj-1".to_string(),
            environment_id: "env-prod".to_string(),
            deployment_id: deployment_id.to_string(),
            instances: vec!["10.0.0.1:8080".to_string()],
            auth: None,
            validation: None,
            updated_at: 1000,
        }
    }

    #[test]
    fn bulk_upsert_and_lookup() {
        let store = RoutingStore::open_in_memory("us-east-1").unwrap();
        store
            .upsert_configs(&[config("a.example.com", "d-1"), config("b.example.com", "d-1")])
            .unwrap();

        assert_eq!(
            store.get_config("a.example.com").unwrap().unwrap().deployment_id,
            "d-1"
        );
        assert_eq!(store.list_for_deployment("d-1").unwrap().len(), 2);

        store.upsert_configs(&[config("a.example.com", "d-2")]).unwrap();
        assert_eq!(store.list_for_deployment("d-1").unwrap().len(), 1);
        assert_eq!(store.list_for_deployment("d-2").unwrap().len(), 1);
    }

    #[test]
    fn missing_hostname_returns_none() {
        let store = RoutingStore::open_in_memory("global").unwrap();
        assert!(store.get_config("nope.example.com").unwrap().is_none());
        store.upsert_configs(&[]).unwrap();
    }
}

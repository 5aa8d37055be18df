//! Backend execution seam
//!
//! Concrete backend clients (VictoriaMetrics, InfluxDB, the offline
//! archive) live outside this crate. They are reached through the
//! [`Instance`] trait and looked up by storage id in a [`StorageRegistry`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::query::context::QueryContext;
use crate::query::error::{QuerierError, Result};
use crate::query::promql::types::Series;

/// Routing hints handed to the backend along with a statement
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueryExpand {
    /// Result tables per metric name
    pub result_table_group: HashMap<String, Vec<String>>,
    /// Routed metric name per reference name
    pub metric_alias_mapping: HashMap<String, String>,
    /// VictoriaMetrics filter condition per reference name
    pub metric_filter_condition: HashMap<String, String>,
    /// Staleness window for instant evaluation
    #[serde(skip)]
    pub lookback_delta: Option<Duration>,
}

/// A queryable backend
#[async_trait]
pub trait Instance: Send + Sync {
    /// Evaluate `stmt` at a single instant
    async fn query(
        &self,
        ctx: &QueryContext,
        stmt: &str,
        at: DateTime<Utc>,
        expand: &QueryExpand,
    ) -> Result<Vec<Series>>;

    /// Evaluate `stmt` over `[start, end]` every `step`
    async fn query_range(
        &self,
        ctx: &QueryContext,
        stmt: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        step: Duration,
        expand: &QueryExpand,
    ) -> Result<Vec<Series>>;
}

pub trait StorageRegistry: Send + Sync {
    fn instance(&self, storage_id: &str) -> Result<Arc<dyn Instance>>;
}

/// Registry backed by a map, filled at startup
#[derive(Default, Clone)]
pub struct InMemoryStorageRegistry {
    instances: HashMap<String, Arc<dyn Instance>>,
}

impl InMemoryStorageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, storage_id: impl Into<String>, instance: Arc<dyn Instance>) {
        let storage_id = storage_id.into();
        log::info!("Registering storage instance '{storage_id}'");
        self.instances.insert(storage_id, instance);
    }

    pub fn with_instance(mut self, storage_id: impl Into<String>, instance: Arc<dyn Instance>) -> Self {
        self.register(storage_id, instance);
        self
    }

    pub fn storage_ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.instances.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }
}

impl StorageRegistry for InMemoryStorageRegistry {
    fn instance(&self, storage_id: &str) -> Result<Arc<dyn Instance>> {
        self.instances
            .get(storage_id)
            .cloned()
            .ok_or_else(|| QuerierError::StorageNotFound(storage_id.to_string()))
    }
}

impl std::fmt::Debug for InMemoryStorageRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryStorageRegistry")
            .field("storage_ids", &self.storage_ids())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EmptyInstance;

    #[async_trait]
    impl Instance for EmptyInstance {
        async fn query(
            &self,
            _ctx: &QueryContext,
            _stmt: &str,
            _at: DateTime<Utc>,
            _expand: &QueryExpand,
        ) -> Result<Vec<Series>> {
            Ok(vec![])
        }

        async fn query_range(
            &self,
            _ctx: &QueryContext,
            _stmt: &str,
            _start: DateTime<Utc>,
            _end: DateTime<Utc>,
            _step: Duration,
            _expand: &QueryExpand,
        ) -> Result<Vec<Series>> {
            Ok(vec![])
        }
    }

    #[test]
    fn test_registry_lookup() {
        let registry = InMemoryStorageRegistry::new()
            .with_instance("vm", Arc::new(EmptyInstance))
            .with_instance("influx", Arc::new(EmptyInstance));

        assert!(registry.instance("vm").is_ok());
        assert_eq!(registry.storage_ids(), vec!["influx", "vm"]);
        assert!(matches!(
            registry.instance("es"),
            Err(QuerierError::StorageNotFound(id)) if id == "es"
        ));
    }
}

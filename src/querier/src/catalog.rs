//! Static routing metadata
//!
//! [`InMemoryCatalog`] serves every metadata collaborator of the query
//! pipeline from the `catalog` section of the configuration. It backs the
//! `explain` command and tests; production deployments plug their own
//! metadata services into the same traits.

use async_trait::async_trait;
use common::config::{ArchiveConfig, CatalogConfig, ProxyConfig};
use regex::Regex;

use crate::query::builder::{ArchiveMetadata, TagRouter};
use crate::query::context::QueryContext;
use crate::query::error::{QuerierError, Result};
use crate::query::routing::{PhysicalTable, Proxy, SpaceMetadata, StorageRouter};

const TAG_EQUALITY: &str = r"(?P<key>[A-Za-z_][A-Za-z0-9_]*) = '(?P<value>(?:[^'\\]|\\.)*)'";

#[derive(Debug, Clone)]
struct SpaceTable {
    space_uid: String,
    table: PhysicalTable,
}

#[derive(Debug, Clone)]
pub struct InMemoryCatalog {
    tag_equality: Regex,
    tables: Vec<SpaceTable>,
    proxies: Vec<ProxyConfig>,
    archives: Vec<ArchiveConfig>,
}

impl InMemoryCatalog {
    /// Build the catalog, rejecting tables with unknown measurement types
    pub fn from_config(config: &CatalogConfig) -> Result<Self> {
        let tables = config
            .tables
            .iter()
            .map(|t| {
                Ok(SpaceTable {
                    space_uid: t.space_uid.clone(),
                    table: PhysicalTable::new(
                        t.table_id.clone(),
                        &t.measurement_type,
                        t.fields.clone(),
                        t.filters.clone(),
                        t.segmented_enable,
                    )?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        log::info!(
            "Loaded catalog with {} tables, {} proxies, {} archived shards",
            tables.len(),
            config.proxies.len(),
            config.archives.len()
        );

        let tag_equality = Regex::new(TAG_EQUALITY)
            .map_err(|e| QuerierError::InvalidInput(format!("tag equality pattern: {e}")))?;

        Ok(Self {
            tag_equality,
            tables,
            proxies: config.proxies.clone(),
            archives: config.archives.clone(),
        })
    }
}

fn check_cancelled(ctx: &QueryContext) -> Result<()> {
    if ctx.is_cancelled() {
        return Err(QuerierError::Cancelled);
    }
    Ok(())
}

#[async_trait]
impl SpaceMetadata for InMemoryCatalog {
    async fn list_physical_tables(
        &self,
        ctx: &QueryContext,
        space_uid: &str,
        table_id: &str,
        field_name: &str,
        is_regexp: bool,
    ) -> Result<Vec<PhysicalTable>> {
        check_cancelled(ctx)?;
        let field = if is_regexp {
            Some(Regex::new(field_name).map_err(|e| {
                QuerierError::InvalidInput(format!("invalid field regex '{field_name}': {e}"))
            })?)
        } else {
            None
        };

        // without a table id every table of the space carrying the field matches
        let tables = self
            .tables
            .iter()
            .filter(|t| t.space_uid == space_uid)
            .filter(|t| {
                if !table_id.is_empty() {
                    return t.table.table_id == table_id;
                }
                match &field {
                    Some(exp) => t.table.fields.iter().any(|f| exp.is_match(f)),
                    None => t.table.fields.iter().any(|f| f == field_name),
                }
            })
            .map(|t| t.table.clone())
            .collect();
        Ok(tables)
    }
}

#[async_trait]
impl StorageRouter for InMemoryCatalog {
    async fn resolve_proxy(
        &self,
        ctx: &QueryContext,
        table_id: &str,
        metric: &str,
        _is_split: bool,
    ) -> Result<Proxy> {
        check_cancelled(ctx)?;
        let candidates = self.proxies.iter().filter(|p| p.table_id == table_id);
        let exact = candidates
            .clone()
            .find(|p| p.metric.as_deref() == Some(metric));
        let proxy = exact
            .or_else(|| candidates.clone().find(|p| p.metric.is_none()))
            .ok_or_else(|| QuerierError::ProxyNotFound {
                table_id: table_id.to_string(),
                metric: metric.to_string(),
            })?;

        Ok(Proxy {
            storage_id: proxy.storage_id.clone(),
            cluster_name: proxy.cluster_name.clone(),
            db: proxy.db.clone(),
            measurement: proxy.measurement.clone(),
            tags_key: proxy.tags_key.clone(),
            vm_rt: proxy.vm_rt.clone(),
            retention_policy: proxy.retention_policy.clone(),
        })
    }
}

#[async_trait]
impl TagRouter for InMemoryCatalog {
    /// `key=value` pairs of the tag keys pinned to a single value in `condition`
    async fn resolve_tag_route(
        &self,
        ctx: &QueryContext,
        tags_key: &[String],
        condition: &str,
    ) -> Result<String> {
        check_cancelled(ctx)?;
        let mut route = Vec::with_capacity(tags_key.len());
        for key in tags_key {
            let mut values = self
                .tag_equality
                .captures_iter(condition)
                .filter(|c| &c["key"] == key.as_str())
                .map(|c| c["value"].to_string());
            let Some(value) = values.next() else {
                continue;
            };
            if values.any(|other| other != value) {
                log::debug!("tag '{key}' has more than one value, left out of the route");
                continue;
            }
            route.push(format!("{key}={value}"));
        }
        Ok(route.join(","))
    }
}

#[async_trait]
impl ArchiveMetadata for InMemoryCatalog {
    async fn readable_shards(
        &self,
        ctx: &QueryContext,
        cluster_name: &str,
        _tag_route: &str,
        db: &str,
        retention_policy: &str,
        start_ns: i64,
        end_ns: i64,
    ) -> Result<Vec<String>> {
        check_cancelled(ctx)?;
        const NANOS: i64 = 1_000_000_000;
        Ok(self
            .archives
            .iter()
            .filter(|a| a.cluster_name == cluster_name && a.db == db)
            .filter(|a| a.retention_policy.is_empty() || a.retention_policy == retention_policy)
            .filter(|a| {
                a.start.saturating_mul(NANOS) <= end_ns && a.end.saturating_mul(NANOS) >= start_ns
            })
            .map(|a| a.shard_id.clone())
            .collect())
    }
}

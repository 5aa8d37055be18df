//! Physical table and proxy resolution
//!
//! A sub-query names a logical table and a field (possibly a regex). The
//! [`SpaceMetadata`] collaborator expands that into physical tables, and the
//! [`StorageRouter`] maps every concrete metric of a table onto a [`Proxy`].
//! Metrics that land on the same proxy are grouped so one physical query is
//! built per distinct (table, proxy) pair.

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};

use super::context::QueryContext;
use super::error::{QuerierError, Result};

/// How metric identity maps onto measurement and field names
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MeasurementType {
    /// `measurement` per table, one field per metric
    #[serde(rename = "bk_traditional_measurement")]
    Traditional,
    /// one measurement per metric, value stored in a fixed field
    #[serde(rename = "bk_split_measurement")]
    Split,
    /// many metrics in one column, keyed by a metric name dimension
    #[serde(rename = "bk_exporter")]
    Exporter,
    /// field name is the metric name
    #[serde(rename = "bk_standard_v2_time_series")]
    StandardV2,
}

impl MeasurementType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Traditional => "bk_traditional_measurement",
            Self::Split => "bk_split_measurement",
            Self::Exporter => "bk_exporter",
            Self::StandardV2 => "bk_standard_v2_time_series",
        }
    }

    pub fn parse(table_id: &str, value: &str) -> Result<Self> {
        match value {
            "bk_traditional_measurement" => Ok(Self::Traditional),
            "bk_split_measurement" => Ok(Self::Split),
            "bk_exporter" => Ok(Self::Exporter),
            "bk_standard_v2_time_series" => Ok(Self::StandardV2),
            other => Err(QuerierError::UnknownMeasurementType {
                table_id: table_id.to_string(),
                measurement_type: other.to_string(),
            }),
        }
    }
}

impl fmt::Display for MeasurementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Deserialize)]
struct RawPhysicalTable {
    table_id: String,
    measurement_type: String,
    #[serde(default)]
    fields: Vec<String>,
    #[serde(default)]
    filters: Vec<BTreeMap<String, String>>,
    #[serde(default)]
    segmented_enable: bool,
}

/// Metadata of one physical result table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawPhysicalTable")]
pub struct PhysicalTable {
    pub table_id: String,
    pub measurement_type: MeasurementType,
    pub fields: Vec<String>,
    /// Space scoped filters, each map is one OR-group of AND-ed equalities
    pub filters: Vec<BTreeMap<String, String>>,
    pub segmented_enable: bool,
}

impl TryFrom<RawPhysicalTable> for PhysicalTable {
    type Error = QuerierError;

    fn try_from(raw: RawPhysicalTable) -> Result<Self> {
        Self::new(
            raw.table_id,
            &raw.measurement_type,
            raw.fields,
            raw.filters,
            raw.segmented_enable,
        )
    }
}

impl PhysicalTable {
    /// Build a table, rejecting unknown measurement types
    pub fn new(
        table_id: String,
        measurement_type: &str,
        fields: Vec<String>,
        filters: Vec<BTreeMap<String, String>>,
        segmented_enable: bool,
    ) -> Result<Self> {
        let measurement_type = MeasurementType::parse(&table_id, measurement_type)?;
        Ok(Self {
            table_id,
            measurement_type,
            fields,
            filters,
            segmented_enable,
        })
    }

    pub fn is_split(&self) -> bool {
        self.measurement_type == MeasurementType::Split
    }
}

/// Resolved storage target of a metric within a table
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Proxy {
    pub storage_id: String,
    pub cluster_name: String,
    pub db: String,
    pub measurement: String,
    pub tags_key: Vec<String>,
    pub vm_rt: String,
    pub retention_policy: String,
}

/// Space/table metadata lookups
#[async_trait]
pub trait SpaceMetadata: Send + Sync {
    async fn list_physical_tables(
        &self,
        ctx: &QueryContext,
        space_uid: &str,
        table_id: &str,
        field_name: &str,
        is_regexp: bool,
    ) -> Result<Vec<PhysicalTable>>;
}

/// Per-metric storage routing
#[async_trait]
pub trait StorageRouter: Send + Sync {
    async fn resolve_proxy(
        &self,
        ctx: &QueryContext,
        table_id: &str,
        metric: &str,
        is_split: bool,
    ) -> Result<Proxy>;
}

/// A physical table with its metrics grouped by proxy, in first-seen order
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedTable {
    pub table: PhysicalTable,
    pub groups: Vec<(Proxy, Vec<String>)>,
}

/// Concrete metric names of `table` for a field name
pub fn expand_metrics(table: &PhysicalTable, field: Option<&Regex>, field_name: &str) -> Vec<String> {
    match field {
        Some(exp) => table
            .fields
            .iter()
            .filter(|f| exp.is_match(f))
            .cloned()
            .collect(),
        None => vec![field_name.to_string()],
    }
}

fn group_by_proxy(resolved: Vec<(Proxy, String)>) -> Vec<(Proxy, Vec<String>)> {
    let mut groups: Vec<(Proxy, Vec<String>)> = Vec::new();
    for (proxy, metric) in resolved {
        match groups.iter_mut().find(|(p, _)| *p == proxy) {
            Some((_, metrics)) => metrics.push(metric),
            None => groups.push((proxy, vec![metric])),
        }
    }
    groups
}

/// Routing front-end over the metadata collaborators
pub struct RoutingResolver<'a> {
    metadata: &'a dyn SpaceMetadata,
    router: &'a dyn StorageRouter,
}

impl<'a> RoutingResolver<'a> {
    pub fn new(metadata: &'a dyn SpaceMetadata, router: &'a dyn StorageRouter) -> Self {
        Self { metadata, router }
    }

    /// Resolve `table_id`/`field_name` in `space_uid` into proxy groups.
    ///
    /// Proxy failures for single metrics are logged and skipped, cancellation
    /// aborts the whole resolution.
    pub async fn resolve(
        &self,
        ctx: &QueryContext,
        space_uid: &str,
        table_id: &str,
        field_name: &str,
        is_regexp: bool,
    ) -> Result<Vec<ResolvedTable>> {
        let tables = self
            .metadata
            .list_physical_tables(ctx, space_uid, table_id, field_name, is_regexp)
            .await?;
        ctx.insert("result_table_num", tables.len());

        let field = if is_regexp {
            Some(Regex::new(field_name).map_err(|e| {
                QuerierError::InvalidInput(format!("invalid field regex '{field_name}': {e}"))
            })?)
        } else {
            None
        };

        let mut resolved_tables = Vec::with_capacity(tables.len());
        for table in tables {
            let mut resolved = Vec::new();
            for metric in expand_metrics(&table, field.as_ref(), field_name) {
                if ctx.is_cancelled() {
                    return Err(QuerierError::Cancelled);
                }
                match self
                    .router
                    .resolve_proxy(ctx, &table.table_id, &metric, table.is_split())
                    .await
                {
                    Ok(proxy) => resolved.push((proxy, metric)),
                    Err(QuerierError::Cancelled) => return Err(QuerierError::Cancelled),
                    Err(e) => log::error!("{e}"),
                }
            }
            resolved_tables.push(ResolvedTable {
                groups: group_by_proxy(resolved),
                table,
            });
        }
        Ok(resolved_tables)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct StaticMetadata(Vec<PhysicalTable>);

    #[async_trait]
    impl SpaceMetadata for StaticMetadata {
        async fn list_physical_tables(
            &self,
            _ctx: &QueryContext,
            _space_uid: &str,
            _table_id: &str,
            _field_name: &str,
            _is_regexp: bool,
        ) -> Result<Vec<PhysicalTable>> {
            Ok(self.0.clone())
        }
    }

    struct StaticRouter(HashMap<String, Proxy>);

    #[async_trait]
    impl StorageRouter for StaticRouter {
        async fn resolve_proxy(
            &self,
            _ctx: &QueryContext,
            table_id: &str,
            metric: &str,
            _is_split: bool,
        ) -> Result<Proxy> {
            self.0
                .get(metric)
                .cloned()
                .ok_or_else(|| QuerierError::ProxyNotFound {
                    table_id: table_id.to_string(),
                    metric: metric.to_string(),
                })
        }
    }

    fn table(fields: &[&str]) -> PhysicalTable {
        PhysicalTable::new(
            "system.cpu_summary".to_string(),
            "bk_traditional_measurement",
            fields.iter().map(|f| f.to_string()).collect(),
            vec![],
            false,
        )
        .unwrap()
    }

    fn proxy(storage: &str) -> Proxy {
        Proxy {
            storage_id: storage.to_string(),
            measurement: "cpu_summary".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_unknown_measurement_type_rejected() {
        let err = PhysicalTable::new("a.b".to_string(), "bk_unknown", vec![], vec![], false)
            .unwrap_err();
        assert_eq!(err.to_string(), "a.b: unknown measurement type 'bk_unknown'");

        let parsed: std::result::Result<PhysicalTable, _> = serde_json::from_str(
            r#"{"table_id": "a.b", "measurement_type": "bk_unknown"}"#,
        );
        assert!(parsed.unwrap_err().to_string().contains("a.b"));
    }

    #[test]
    fn test_is_split() {
        let split = PhysicalTable::new("a.b".to_string(), "bk_split_measurement", vec![], vec![], false)
            .unwrap();
        assert!(split.is_split());
        assert!(!table(&[]).is_split());
    }

    #[tokio::test]
    async fn test_regex_expansion_groups_by_proxy() {
        let metadata = StaticMetadata(vec![table(&["usage", "idle", "iowait", "load1"])]);
        let router = StaticRouter(HashMap::from([
            ("usage".to_string(), proxy("vm")),
            ("idle".to_string(), proxy("influx")),
            ("iowait".to_string(), proxy("vm")),
        ]));
        let resolver = RoutingResolver::new(&metadata, &router);

        let resolved = resolver
            .resolve(&QueryContext::default(), "bkcc__2", "system.cpu_summary", "^(usage|idle|iowait)$", true)
            .await
            .unwrap();

        assert_eq!(resolved.len(), 1);
        let groups = &resolved[0].groups;
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].0.storage_id, "vm");
        assert_eq!(groups[0].1, vec!["usage", "iowait"]);
        assert_eq!(groups[1].1, vec!["idle"]);
    }

    #[tokio::test]
    async fn test_failed_metrics_are_skipped() {
        let metadata = StaticMetadata(vec![table(&["usage"])]);
        let router = StaticRouter(HashMap::new());
        let resolver = RoutingResolver::new(&metadata, &router);

        let resolved = resolver
            .resolve(&QueryContext::default(), "bkcc__2", "system.cpu_summary", "usage", false)
            .await
            .unwrap();

        assert_eq!(resolved.len(), 1);
        assert!(resolved[0].groups.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_field_regex() {
        let metadata = StaticMetadata(vec![table(&["usage"])]);
        let router = StaticRouter(HashMap::new());
        let resolver = RoutingResolver::new(&metadata, &router);

        let result = resolver
            .resolve(&QueryContext::default(), "bkcc__2", "system.cpu_summary", "(", true)
            .await;
        assert!(matches!(result, Err(QuerierError::InvalidInput(_))));
    }

    struct CancellingRouter;

    #[async_trait]
    impl StorageRouter for CancellingRouter {
        async fn resolve_proxy(
            &self,
            ctx: &QueryContext,
            _table_id: &str,
            _metric: &str,
            _is_split: bool,
        ) -> Result<Proxy> {
            ctx.cancel_token().cancel();
            Err(QuerierError::Cancelled)
        }
    }

    #[tokio::test]
    async fn test_cancelled_proxy_lookup_aborts() {
        let metadata = StaticMetadata(vec![table(&["usage", "idle"])]);
        let resolver = RoutingResolver::new(&metadata, &CancellingRouter);
        let ctx = QueryContext::new(tokio_util::sync::CancellationToken::new());

        let result = resolver
            .resolve(&ctx, "bkcc__2", "system.cpu_summary", "usage", false)
            .await;
        assert!(matches!(result, Err(QuerierError::Cancelled)));
        assert!(ctx.is_cancelled());
    }
}

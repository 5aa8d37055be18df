//! Physical query assembly
//!
//! One [`PhysicalQuery`] is built per (sub-query, table, proxy group). The
//! measurement type decides how metric identity maps onto measurement and
//! field names; user conditions, space filters and the metric identity are
//! merged into both the text and VictoriaMetrics condition forms; and the
//! time window decides whether the offline archive serves the query.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use super::condition::{AllConditions, ConditionField, Operator, WhereList};
use super::context::QueryContext;
use super::error::{QuerierError, Result};
use super::promql::types::{LabelMatcher, METRIC_NAME_LABEL};
use super::routing::{MeasurementType, PhysicalTable, Proxy};
use super::structured::FinalizedSubQuery;
use super::time::to_time;

/// Column holding the value in single-column multi-metric tables
pub const STATIC_METRIC_VALUE: &str = "metric_value";
/// Dimension naming the metric in single-column multi-metric tables
pub const STATIC_METRIC_NAME: &str = "metric_name";
/// Value column of split measurements
pub const STATIC_FIELD: &str = "value";

/// Tag based routing of a condition onto a storage shard key
#[async_trait]
pub trait TagRouter: Send + Sync {
    async fn resolve_tag_route(
        &self,
        ctx: &QueryContext,
        tags_key: &[String],
        condition: &str,
    ) -> Result<String>;
}

/// Offline archive shard availability
#[async_trait]
pub trait ArchiveMetadata: Send + Sync {
    #[allow(clippy::too_many_arguments)]
    async fn readable_shards(
        &self,
        ctx: &QueryContext,
        cluster_name: &str,
        tag_route: &str,
        db: &str,
        retention_policy: &str,
        start_ns: i64,
        end_ns: i64,
    ) -> Result<Vec<String>>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AggrMethod {
    pub name: String,
    pub dimensions: Vec<String>,
    pub without: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OffsetInfo {
    #[serde(with = "humantime_serde")]
    pub offset: Duration,
    pub limit: usize,
    pub soffset: usize,
    pub slimit: usize,
}

/// Fully resolved query against one storage, immutable once built
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PhysicalQuery {
    pub table_id: String,
    pub storage_id: String,
    pub cluster_name: String,
    pub tags_key: Vec<String>,
    pub db: String,
    pub measurement: String,
    pub measurements: Vec<String>,
    pub vm_rt: String,
    pub field: String,
    pub fields: Vec<String>,
    pub retention_policy: String,
    pub aggregate_method_list: Vec<AggrMethod>,
    pub offset_info: OffsetInfo,
    pub timezone: String,
    pub condition: String,
    pub vm_condition: String,
    pub vm_condition_num: usize,
    pub labels_matcher: Vec<LabelMatcher>,
    pub is_single_metric: bool,
    pub is_has_or: bool,
    pub segmented_enable: bool,
}

/// Measurement and field naming for one measurement type
struct Naming {
    measurement: String,
    measurements: Vec<String>,
    field: String,
    fields: Vec<String>,
    extra: Option<ConditionField>,
}

fn naming(
    query: &FinalizedSubQuery,
    measurement_type: MeasurementType,
    proxy: &Proxy,
    metrics: &[String],
) -> Naming {
    let metric = query.field_name.clone();
    match measurement_type {
        MeasurementType::Traditional | MeasurementType::StandardV2 => Naming {
            measurement: proxy.measurement.clone(),
            measurements: vec![proxy.measurement.clone()],
            field: metric,
            fields: metrics.to_vec(),
            extra: None,
        },
        MeasurementType::Exporter => {
            let op = if query.is_regexp {
                Operator::Req
            } else {
                Operator::Eq
            };
            Naming {
                measurement: proxy.measurement.clone(),
                measurements: vec![proxy.measurement.clone()],
                field: STATIC_METRIC_VALUE.to_string(),
                fields: vec![STATIC_METRIC_VALUE.to_string()],
                extra: Some(ConditionField::new(STATIC_METRIC_NAME, op, vec![metric])),
            }
        }
        MeasurementType::Split => Naming {
            measurement: metric,
            measurements: metrics.to_vec(),
            field: STATIC_FIELD.to_string(),
            fields: vec![STATIC_FIELD.to_string()],
            extra: None,
        },
    }
}

/// Space filters as OR-groups, plus label matchers of the first group
fn filter_conditions(table: &PhysicalTable) -> (AllConditions, Vec<LabelMatcher>) {
    let mut groups = Vec::with_capacity(table.filters.len());
    let mut matchers = Vec::new();
    for filter in &table.filters {
        let group: Vec<ConditionField> = filter
            .iter()
            .filter(|(_, v)| !v.is_empty())
            .map(|(k, v)| ConditionField::contains(k.as_str(), v.as_str()))
            .collect();

        // label matchers cannot express OR, later groups are lost
        if groups.is_empty() {
            matchers.extend(group.iter().map(|f| LabelMatcher::equal(&f.dimension_name, &f.value[0])));
        }
        if !group.is_empty() {
            groups.push(group);
        }
    }
    (AllConditions::new(groups), matchers)
}

pub struct QueryBuilder<'a> {
    tag_router: &'a dyn TagRouter,
    archive: &'a dyn ArchiveMetadata,
    archive_storage_id: &'a str,
}

impl<'a> QueryBuilder<'a> {
    pub fn new(
        tag_router: &'a dyn TagRouter,
        archive: &'a dyn ArchiveMetadata,
        archive_storage_id: &'a str,
    ) -> Self {
        Self {
            tag_router,
            archive,
            archive_storage_id,
        }
    }

    pub async fn build(
        &self,
        ctx: &QueryContext,
        query: &FinalizedSubQuery,
        table: &PhysicalTable,
        proxy: &Proxy,
        metrics: &[String],
    ) -> Result<PhysicalQuery> {
        let user = query.conditions.analysis_conditions()?;
        let mut where_list = WhereList::new();
        let mut labels_matcher = user.to_label_matchers();
        where_list.push_conditions(&user);

        ctx.insert(
            "result_table",
            serde_json::to_string(table).unwrap_or_default(),
        );
        ctx.insert("proxy", serde_json::to_string(proxy).unwrap_or_default());

        let offset = query.offset_duration()?.unwrap_or_default();

        let naming = naming(query, table.measurement_type, proxy, metrics);
        if let Some(extra) = &naming.extra {
            where_list.push_field(extra);
        }

        let (filters, filter_matchers) = filter_conditions(table);
        labels_matcher.extend(filter_matchers);
        where_list.push_conditions(&filters);

        let identity_op = if query.is_regexp {
            Operator::Req
        } else {
            Operator::Eq
        };
        let identity = ConditionField::new(
            METRIC_NAME_LABEL,
            identity_op,
            vec![format!("{}_{}", naming.measurement, naming.field)],
        );
        let all = user
            .merge(&filters)
            .merge(&AllConditions::new(vec![vec![identity]]));
        let is_has_or = user.len() > 1 || filters.len() > 1;

        let range = to_time(&query.start, &query.end, &query.step, &query.timezone)
            .inspect_err(|e| log::error!("{e}"))?;
        let condition = where_list.to_string();

        let tag_route = self
            .tag_router
            .resolve_tag_route(ctx, &proxy.tags_key, &condition)
            .await
            .map_err(|e| match e {
                QuerierError::TagRoute(_) | QuerierError::Cancelled => e,
                other => QuerierError::TagRoute(other.to_string()),
            })?;

        let start_ns = range.start.timestamp_nanos_opt().unwrap_or(i64::MIN);
        let end_ns = range.stop.timestamp_nanos_opt().unwrap_or(i64::MAX);
        let shards = match self
            .archive
            .readable_shards(
                ctx,
                &proxy.cluster_name,
                &tag_route,
                &proxy.db,
                &proxy.retention_policy,
                start_ns,
                end_ns,
            )
            .await
        {
            Ok(shards) => shards,
            Err(QuerierError::Cancelled) => return Err(QuerierError::Cancelled),
            Err(e) => {
                log::warn!("offline archive lookup failed, using live storage: {e}");
                ctx.insert("offline-data-archive-error", &e);
                Vec::new()
            }
        };

        ctx.insert("offline-data-archive-cluster-name", &proxy.cluster_name);
        ctx.insert("offline-data-archive-tag-router", &tag_route);
        ctx.insert("offline-data-archive-start", range.start);
        ctx.insert("offline-data-archive-end", range.stop);
        ctx.insert("offline-data-archive-shard-num", shards.len());

        let storage_id = if shards.is_empty() {
            proxy.storage_id.clone()
        } else {
            self.archive_storage_id.to_string()
        };
        let (vm_condition, vm_condition_num) = all.vm_string(&proxy.vm_rt);

        Ok(PhysicalQuery {
            table_id: table.table_id.clone(),
            storage_id,
            cluster_name: proxy.cluster_name.clone(),
            tags_key: proxy.tags_key.clone(),
            db: proxy.db.clone(),
            measurement: naming.measurement,
            measurements: naming.measurements,
            vm_rt: proxy.vm_rt.clone(),
            field: naming.field,
            fields: naming.fields,
            retention_policy: proxy.retention_policy.clone(),
            aggregate_method_list: query
                .aggregate_method_list
                .iter()
                .map(|m| AggrMethod {
                    name: m.method.clone(),
                    dimensions: m.dimensions.clone(),
                    without: m.without,
                })
                .collect(),
            offset_info: OffsetInfo {
                offset,
                limit: query.limit,
                soffset: query.soffset,
                slimit: query.slimit,
            },
            timezone: range.timezone,
            condition,
            vm_condition,
            vm_condition_num,
            labels_matcher,
            is_single_metric: table.is_split(),
            is_has_or,
            segmented_enable: table.segmented_enable,
        })
    }
}

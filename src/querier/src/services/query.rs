//! Query service
//!
//! Entry points used by the transport layer:
//!
//! - [`QueryService::query_ts`] runs a [`StructuredQuery`] end to end
//! - [`QueryService::query_raw`] runs a PromQL statement as is
//! - [`QueryService::directly_query`] renames reference names in a statement
//!   to routed metrics and runs it against the routed storage
//!
//! Every backend call is raced against the request's cancellation token.

use std::future::Future;
use std::sync::Arc;

use common::config::QueryConfig;
use futures::future::try_join_all;
use promql_parser::parser::Expr;

use crate::instance::{QueryExpand, StorageRegistry};
use crate::query::builder::{ArchiveMetadata, QueryBuilder, TagRouter};
use crate::query::context::QueryContext;
use crate::query::error::{QuerierError, Result};
use crate::query::promql::{parser, translator};
use crate::query::reference::{QueryMetric, QueryReference};
use crate::query::result::{Status, UniformTable};
use crate::query::routing::{RoutingResolver, SpaceMetadata, StorageRouter};
use crate::query::structured::{CombinedQueryParams, FinalizedSubQuery, StructuredQuery};
use crate::query::time::{set_default_step, to_time};

/// Status code reported when no sub-query resolved to a storage
pub const STATUS_NO_STORAGE: &str = "table_id_proxy_not_exists";

/// Metadata collaborators consumed by the pipeline
#[derive(Clone)]
pub struct Collaborators {
    pub metadata: Arc<dyn SpaceMetadata>,
    pub router: Arc<dyn StorageRouter>,
    pub tag_router: Arc<dyn TagRouter>,
    pub archive: Arc<dyn ArchiveMetadata>,
}

impl Collaborators {
    /// All four roles served by one value
    pub fn shared<C>(catalog: Arc<C>) -> Self
    where
        C: SpaceMetadata + StorageRouter + TagRouter + ArchiveMetadata + 'static,
    {
        Self {
            metadata: catalog.clone(),
            router: catalog.clone(),
            tag_router: catalog.clone(),
            archive: catalog,
        }
    }
}

/// Abort `fut` as soon as the request is cancelled
async fn cancellable<T>(ctx: &QueryContext, fut: impl Future<Output = Result<T>>) -> Result<T> {
    tokio::select! {
        biased;
        _ = ctx.cancel_token().cancelled() => Err(QuerierError::Cancelled),
        result = fut => result,
    }
}

#[derive(Clone)]
pub struct QueryService {
    config: QueryConfig,
    collaborators: Collaborators,
    storages: Arc<dyn StorageRegistry>,
}

impl QueryService {
    pub fn new(
        config: QueryConfig,
        collaborators: Collaborators,
        storages: Arc<dyn StorageRegistry>,
    ) -> Self {
        set_default_step(config.default_step);
        Self {
            config,
            collaborators,
            storages,
        }
    }

    pub fn config(&self) -> &QueryConfig {
        &self.config
    }

    /// Resolve one sub-query into its physical queries
    pub async fn query_metric(
        &self,
        ctx: &QueryContext,
        space_uid: &str,
        query: &FinalizedSubQuery,
    ) -> Result<QueryMetric> {
        let ctx = ctx.child("query-ts-to-query-metric");
        ctx.insert("referenceName", &query.reference_name);
        ctx.insert("metricName", &query.field_name);
        ctx.insert("space_uid", space_uid);
        ctx.insert("table_id", &query.table_id);

        let resolver = RoutingResolver::new(
            self.collaborators.metadata.as_ref(),
            self.collaborators.router.as_ref(),
        );
        let builder = QueryBuilder::new(
            self.collaborators.tag_router.as_ref(),
            self.collaborators.archive.as_ref(),
            &self.config.archive_storage_id,
        );

        let resolved = resolver
            .resolve(&ctx, space_uid, &query.table_id, &query.field_name, query.is_regexp)
            .await?;
        ctx.insert("query_conditions", format!("{:?}", query.conditions));

        let mut metric = QueryMetric::new(&query.reference_name, &query.field_name);
        for table in &resolved {
            for (proxy, metrics) in &table.groups {
                let physical = builder.build(&ctx, query, &table.table, proxy, metrics).await?;
                metric.query_list.push(physical);
            }
        }
        Ok(metric)
    }

    /// Resolve every sub-query concurrently, failing on the first error
    pub async fn query_reference(
        &self,
        ctx: &QueryContext,
        query: &StructuredQuery,
    ) -> Result<QueryReference> {
        let ctx = ctx.child("query-ts-to-query-reference");
        ctx.insert("query_list_num", query.query_list.len());

        let finalized = query.finalized_queries(self.config.align_result)?;
        let metrics = cancellable(
            &ctx,
            try_join_all(
                finalized
                    .iter()
                    .map(|q| self.query_metric(&ctx, &query.space_uid, q)),
            ),
        )
        .await?;
        if ctx.is_cancelled() {
            return Err(QuerierError::Cancelled);
        }

        let mut reference = QueryReference::new();
        for metric in metrics {
            ctx.insert(
                &format!("reference_{}", metric.reference_name),
                serde_json::to_string(&metric).unwrap_or_default(),
            );
            reference.insert(metric);
        }
        Ok(reference)
    }

    /// Resolve `query` and translate it into the PromQL sent to the backend
    pub async fn explain(
        &self,
        ctx: &QueryContext,
        query: &StructuredQuery,
    ) -> Result<(QueryReference, Expr)> {
        let reference = self.query_reference(ctx, query).await?;
        let expr = self.translate(query, &reference)?;
        Ok((reference, expr))
    }

    /// Merged PromQL tree with every reference renamed to its routed metric
    fn translate(&self, query: &StructuredQuery, reference: &QueryReference) -> Result<Expr> {
        query.to_prom_expr(
            self.config.align_result,
            Some(&reference.directly_metric_name()),
            Some(&reference.directly_labels_matcher()),
        )
    }

    fn expand(reference: &QueryReference) -> QueryExpand {
        QueryExpand {
            result_table_group: reference.directly_result_table(),
            metric_alias_mapping: reference.directly_metric_name(),
            metric_filter_condition: reference.vm_filter_conditions(),
            ..Default::default()
        }
    }

    pub async fn query_ts(&self, ctx: &QueryContext, query: &StructuredQuery) -> Result<UniformTable> {
        let reference = self.query_reference(ctx, query).await?;

        let storage_ids = reference.storage_ids();
        let storage_id = match storage_ids.as_slice() {
            [] => {
                log::warn!("No storage resolved for space {}", query.space_uid);
                return Ok(UniformTable {
                    status: Some(Status {
                        code: STATUS_NO_STORAGE.to_string(),
                        message: format!("no storage resolved in space {}", query.space_uid),
                    }),
                    ..Default::default()
                });
            }
            [single] => single.clone(),
            many => {
                return Err(QuerierError::Unsupported(format!(
                    "query spans storages {}",
                    many.join(", ")
                )));
            }
        };
        let instance = self.storages.instance(&storage_id)?;

        let range = to_time(&query.start, &query.end, &query.step, &query.timezone)?;
        let stmt = self.translate(query, &reference)?.to_string();
        let mut expand = Self::expand(&reference);
        expand.lookback_delta = Some(query.lookback_delta()?.unwrap_or(self.config.lookback_delta));

        ctx.insert("storage_id", &storage_id);
        ctx.insert("stmt", &stmt);
        log::info!("query_ts promql: {stmt}");

        let result = if query.instant {
            cancellable(ctx, instance.query(ctx, &stmt, range.stop, &expand)).await
        } else {
            cancellable(
                ctx,
                instance.query_range(ctx, &stmt, range.start, range.stop, range.interval, &expand),
            )
            .await
        };
        let series = result.inspect_err(|e| log::error!("query_ts failed for [{stmt}]: {e}"))?;

        let mut table = UniformTable::from_series(&series, &query.result_columns);
        if let Some(factor) = query.down_sample_factor(range.interval)? {
            table.downsample(factor);
        }

        ctx.insert("resp-series-num", table.series_num());
        ctx.insert("resp-points-num", table.points_num());
        Ok(table)
    }

    /// Run `stmt` unchanged against the requested or default storage
    pub async fn query_raw(
        &self,
        ctx: &QueryContext,
        stmt: &str,
        params: &CombinedQueryParams,
    ) -> Result<UniformTable> {
        let info = params.time_info()?;
        let storage_id = params
            .storage_id
            .as_deref()
            .unwrap_or(&self.config.default_storage_id);
        let instance = self.storages.instance(storage_id)?;

        let series = cancellable(
            ctx,
            instance.query_range(
                ctx,
                stmt,
                info.start,
                info.stop,
                info.interval,
                &QueryExpand::default(),
            ),
        )
        .await
        .inspect_err(|e| log::error!("query prom sql failed for [{stmt}]: {e}"))?;
        log::debug!("query prom: {stmt} success");

        Ok(UniformTable::from_series(&series, &params.result_columns))
    }

    /// Rewrite reference names in `stmt` to routed metrics and run it on
    /// the storage of the first physical query
    pub async fn directly_query(
        &self,
        ctx: &QueryContext,
        stmt: &str,
        params: &CombinedQueryParams,
        reference: &QueryReference,
    ) -> Result<UniformTable> {
        let ctx = ctx.child("directly-query");
        let info = params.time_info()?;
        ctx.insert("queries-data", serde_json::to_string(reference).unwrap_or_default());

        let storage_id = reference.directly_storage_id().ok_or_else(|| {
            QuerierError::InvalidInput("query reference has no physical query".to_string())
        })?;
        let instance = self.storages.instance(storage_id)?;

        let mut expr = parser::parse(stmt)?;
        let old_stmt = expr.to_string();
        ctx.insert("old-stmt", &old_stmt);

        let unreferenced: Vec<&str> = parser::metric_names(&expr)
            .into_iter()
            .filter(|name| reference.get(name).is_none())
            .collect();
        if !unreferenced.is_empty() {
            log::debug!("directly query keeps metrics as written: {}", unreferenced.join(", "));
        }

        translator::rename_metrics(
            &mut expr,
            &reference.directly_metric_name(),
            &reference.directly_labels_matcher(),
        )?;
        let new_stmt = expr.to_string();

        ctx.insert("stmt", &new_stmt);
        ctx.insert("start", info.start);
        ctx.insert("end", info.stop);
        ctx.insert("step", humantime::format_duration(info.interval));
        log::info!("directly query old promql: {old_stmt}");
        log::info!("directly query new promql: {new_stmt}");

        let expand = QueryExpand {
            result_table_group: reference.directly_result_table(),
            ..Default::default()
        };
        let series = cancellable(
            &ctx,
            instance.query_range(&ctx, &new_stmt, info.start, info.stop, info.interval, &expand),
        )
        .await?;

        let table = UniformTable::from_series(&series, &params.result_columns);
        ctx.insert("resp-series-num", table.series_num());
        ctx.insert("resp-points-num", table.points_num());
        Ok(table)
    }
}

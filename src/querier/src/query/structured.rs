//! Structured query model
//!
//! [`StructuredQuery`] is the JSON payload accepted by the query service. Its
//! sub-queries are deserialized raw and turned into immutable
//! [`FinalizedSubQuery`] values by [`SubQuery::finalize`], which back-fills
//! every empty per-query override from the parent request.

use std::collections::{HashMap, HashSet};
use std::ops::Deref;
use std::time::Duration;

use promql_parser::parser::Expr;
use serde::{Deserialize, Serialize};

use super::condition::Conditions;
use super::error::{QuerierError, Result};
use super::promql::{parser, translator};
use super::promql::translator::{AtAnchor, Selector, Window};
use super::promql::types::{LabelMatcher, METRIC_NAME_LABEL};
use super::time::{self, TimeInfo, default_step, parse_duration};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregateMethod {
    pub method: String,
    pub dimensions: Vec<String>,
    pub without: bool,
    /// Argument index of the inner expression for functions
    pub position: usize,
    pub vargs_list: Vec<serde_json::Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeAggregation {
    pub function: String,
    pub window: String,
    pub position: usize,
    pub vargs_list: Vec<serde_json::Value>,
}

impl TimeAggregation {
    pub fn is_set(&self) -> bool {
        !self.function.is_empty() && !self.window.is_empty()
    }
}

/// One named metric query as received
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubQuery {
    pub table_id: String,
    pub field_name: String,
    pub is_regexp: bool,
    #[serde(rename = "function")]
    pub aggregate_method_list: Vec<AggregateMethod>,
    pub time_aggregation: TimeAggregation,
    pub reference_name: String,
    pub dimensions: Vec<String>,
    pub limit: usize,
    pub slimit: usize,
    pub soffset: usize,
    pub conditions: Conditions,
    /// `@` modifier in milliseconds since the epoch
    pub timestamp: Option<i64>,
    pub start_or_end: Option<AtAnchor>,
    pub offset: String,
    pub offset_forward: bool,
    pub timezone: String,
    #[serde(rename = "start_time")]
    pub start: String,
    #[serde(rename = "end_time")]
    pub end: String,
    pub step: String,
    /// Nested inside another time window, ranges become subqueries
    #[serde(skip)]
    pub is_sub_query: bool,
}

/// A sub-query with parent defaults applied
#[derive(Debug, Clone, PartialEq)]
pub struct FinalizedSubQuery {
    query: SubQuery,
    align_result: bool,
}

impl Deref for FinalizedSubQuery {
    type Target = SubQuery;

    fn deref(&self) -> &SubQuery {
        &self.query
    }
}

fn or_inherit(own: &str, parent: &str) -> String {
    if own.is_empty() {
        parent.to_string()
    } else {
        own.to_string()
    }
}

impl SubQuery {
    pub fn finalize(&self, parent: &StructuredQuery, align_result: bool) -> FinalizedSubQuery {
        let mut query = self.clone();
        query.timezone = or_inherit(&self.timezone, &parent.timezone);
        query.start = or_inherit(&self.start, &parent.start);
        query.end = or_inherit(&self.end, &parent.end);
        query.step = or_inherit(&self.step, &parent.step);
        FinalizedSubQuery {
            query,
            align_result,
        }
    }
}

impl FinalizedSubQuery {
    pub fn align_result(&self) -> bool {
        self.align_result
    }

    fn step_or_default(&self) -> Result<Duration> {
        if self.step.is_empty() {
            Ok(default_step())
        } else {
            parse_duration(&self.step)
        }
    }

    pub fn offset_duration(&self) -> Result<Option<Duration>> {
        if self.offset.is_empty() {
            return Ok(None);
        }
        parse_duration(&self.offset).map(Some)
    }

    /// Translate into a PromQL tree.
    ///
    /// The leaf is named `name_override` when given, else the reference name.
    pub fn translate(
        &self,
        name_override: Option<&str>,
        matchers: &[LabelMatcher],
    ) -> Result<Expr> {
        let windowed = self.time_aggregation.is_set();
        let align_step = if self.align_result && !self.time_aggregation.window.is_empty() {
            Some(self.step_or_default()?)
        } else {
            None
        };
        let offset_ms =
            translator::compose_offset(align_step, self.offset_duration()?, self.offset_forward);

        // a regex field cannot name the selector, it is matched through __name__
        let mut all_matchers;
        let (name, matchers) = match name_override {
            Some(routed) if self.is_regexp => {
                all_matchers = vec![LabelMatcher::regex_match(METRIC_NAME_LABEL, routed)];
                all_matchers.extend(matchers.iter().cloned());
                ("", all_matchers.as_slice())
            }
            Some(routed) => (routed, matchers),
            None => (self.reference_name.as_str(), matchers),
        };

        let selector = Selector {
            name,
            matchers,
            timestamp: self.timestamp,
            anchor: self.start_or_end,
            offset_ms,
        };

        let mut expr = if windowed {
            let subquery_step = if self.is_sub_query {
                let step = if self.step.is_empty() {
                    None
                } else {
                    Some(parse_duration(&self.step)?)
                };
                Some(step)
            } else {
                None
            };
            let window = Window {
                function: &self.time_aggregation.function,
                range: parse_duration(&self.time_aggregation.window)?,
                position: self.time_aggregation.position,
                vargs: &self.time_aggregation.vargs_list,
                subquery_step,
            };
            translator::build_selector(&selector, Some(&window))?
        } else {
            translator::build_selector(&selector, None)?
        };

        for method in &self.aggregate_method_list {
            expr = translator::apply_aggregation(
                &method.method,
                &method.dimensions,
                method.without,
                method.position,
                &method.vargs_list,
                expr,
            )
            .inspect_err(|e| log::error!("failed to translate function {}: {e}", method.method))?;
        }
        Ok(expr)
    }
}

/// Multi-metric query combined through `metric_merge`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StructuredQuery {
    pub space_uid: String,
    pub query_list: Vec<SubQuery>,
    /// PromQL formula over reference names, e.g. `a / b * 100`
    pub metric_merge: String,
    pub result_columns: Vec<String>,
    #[serde(rename = "start_time")]
    pub start: String,
    #[serde(rename = "end_time")]
    pub end: String,
    pub step: String,
    pub down_sample_range: String,
    pub timezone: String,
    pub look_back_delta: String,
    pub instant: bool,
}

impl StructuredQuery {
    /// Finalize every sub-query, rejecting duplicate reference names
    pub fn finalized_queries(&self, align_result: bool) -> Result<Vec<FinalizedSubQuery>> {
        let mut seen = HashSet::new();
        self.query_list
            .iter()
            .map(|query| {
                if !seen.insert(query.reference_name.as_str()) {
                    return Err(QuerierError::DuplicateReferenceName(
                        query.reference_name.clone(),
                    ));
                }
                Ok(query.finalize(self, align_result))
            })
            .collect()
    }

    /// Build the merged PromQL tree.
    ///
    /// `reference_metrics` renames leaves to routed metric names and
    /// `reference_matchers` adds routed label matchers, both keyed by
    /// reference name.
    pub fn to_prom_expr(
        &self,
        align_result: bool,
        reference_metrics: Option<&HashMap<String, String>>,
        reference_matchers: Option<&HashMap<String, Vec<LabelMatcher>>>,
    ) -> Result<Expr> {
        if self.metric_merge.is_empty() {
            log::error!("{}", QuerierError::EmptyMetricMerge);
            return Err(QuerierError::EmptyMetricMerge);
        }

        let mut formula = parser::parse(&self.metric_merge).inspect_err(|e| {
            log::error!("failed to parse metric_merge [{}]: {e}", self.metric_merge)
        })?;

        let mut translated = HashMap::with_capacity(self.query_list.len());
        for query in self.finalized_queries(align_result)? {
            let name = reference_metrics
                .and_then(|m| m.get(&query.reference_name))
                .map(String::as_str);
            let matchers = reference_matchers
                .and_then(|m| m.get(&query.reference_name))
                .map(Vec::as_slice)
                .unwrap_or_default();
            let expr = query.translate(name, matchers)?;
            translated.insert(query.reference_name.clone(), expr);
        }

        translator::substitute_references(&mut formula, &translated)?;
        Ok(formula)
    }

    /// Factor by which results are thinned, present only when above 1
    pub fn down_sample_factor(&self, step: Duration) -> Result<Option<f64>> {
        if self.down_sample_range.is_empty() || step.is_zero() {
            return Ok(None);
        }
        let range = parse_duration(&self.down_sample_range)?;
        let factor = range.as_secs_f64() / step.as_secs_f64();
        Ok((factor > 1.0).then_some(factor))
    }

    pub fn lookback_delta(&self) -> Result<Option<Duration>> {
        if self.look_back_delta.is_empty() {
            return Ok(None);
        }
        parse_duration(&self.look_back_delta).map(Some)
    }
}

/// Time window and output options for raw statement execution
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CombinedQueryParams {
    #[serde(rename = "start_time")]
    pub start: String,
    #[serde(rename = "end_time")]
    pub end: String,
    pub step: String,
    pub result_columns: Vec<String>,
    /// Storage for raw statements, the configured default when absent
    pub storage_id: Option<String>,
}

impl CombinedQueryParams {
    pub fn time_info(&self) -> Result<TimeInfo> {
        time::time_info(&self.start, &self.end, &self.step)
    }
}

//! Resolved sub-queries keyed by reference name

use std::collections::{BTreeMap, HashMap};

use serde::Serialize;

use super::builder::PhysicalQuery;
use super::promql::types::LabelMatcher;

/// All physical queries resolved for one reference name
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueryMetric {
    pub reference_name: String,
    pub metric_name: String,
    pub query_list: Vec<PhysicalQuery>,
}

impl QueryMetric {
    pub fn new(reference_name: impl Into<String>, metric_name: impl Into<String>) -> Self {
        Self {
            reference_name: reference_name.into(),
            metric_name: metric_name.into(),
            query_list: Vec::new(),
        }
    }

    /// Routed metric name as the VictoriaMetrics backend stores it
    pub fn routed_metric_name(&self) -> Option<String> {
        self.query_list
            .first()
            .map(|q| format!("{}_{}", q.measurement, q.field))
    }
}

/// Reference name to [`QueryMetric`], iterated in name order
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct QueryReference(BTreeMap<String, QueryMetric>);

impl QueryReference {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, metric: QueryMetric) {
        self.0.insert(metric.reference_name.clone(), metric);
    }

    pub fn get(&self, reference_name: &str) -> Option<&QueryMetric> {
        self.0.get(reference_name)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &QueryMetric)> {
        self.0.iter()
    }

    fn queries(&self) -> impl Iterator<Item = &PhysicalQuery> {
        self.0.values().flat_map(|m| m.query_list.iter())
    }

    /// Distinct storage ids in first-seen order
    pub fn storage_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = Vec::new();
        for query in self.queries() {
            if !ids.contains(&query.storage_id) {
                ids.push(query.storage_id.clone());
            }
        }
        ids
    }

    /// Storage serving the direct path, taken from the first physical query
    pub fn directly_storage_id(&self) -> Option<&str> {
        self.queries().next().map(|q| q.storage_id.as_str())
    }

    pub fn directly_cluster_name(&self) -> Option<&str> {
        self.queries().next().map(|q| q.cluster_name.as_str())
    }

    /// Routed metric name per reference name
    pub fn directly_metric_name(&self) -> HashMap<String, String> {
        self.0
            .iter()
            .filter_map(|(name, metric)| Some((name.clone(), metric.routed_metric_name()?)))
            .collect()
    }

    /// Label matchers of the first physical query per reference name
    pub fn directly_labels_matcher(&self) -> HashMap<String, Vec<LabelMatcher>> {
        self.0
            .iter()
            .filter_map(|(name, metric)| {
                let first = metric.query_list.first()?;
                Some((name.clone(), first.labels_matcher.clone()))
            })
            .collect()
    }

    /// VictoriaMetrics result tables per routed metric name
    pub fn directly_result_table(&self) -> HashMap<String, Vec<String>> {
        let mut groups: HashMap<String, Vec<String>> = HashMap::new();
        for metric in self.0.values() {
            let Some(name) = metric.routed_metric_name() else {
                continue;
            };
            let tables = groups.entry(name).or_default();
            for query in &metric.query_list {
                if !query.vm_rt.is_empty() && !tables.contains(&query.vm_rt) {
                    tables.push(query.vm_rt.clone());
                }
            }
        }
        groups
    }

    /// VictoriaMetrics filter condition per reference name, branches of all
    /// physical queries joined with `or`
    pub fn vm_filter_conditions(&self) -> HashMap<String, String> {
        self.0
            .iter()
            .filter(|(_, metric)| !metric.query_list.is_empty())
            .map(|(name, metric)| {
                let condition = metric
                    .query_list
                    .iter()
                    .map(|q| q.vm_condition.as_str())
                    .filter(|c| !c.is_empty())
                    .collect::<Vec<_>>()
                    .join(" or ");
                (name.clone(), condition)
            })
            .collect()
    }
}

impl<'a> IntoIterator for &'a QueryReference {
    type Item = (&'a String, &'a QueryMetric);
    type IntoIter = std::collections::btree_map::Iter<'a, String, QueryMetric>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn physical(storage_id: &str, measurement: &str, vm_rt: &str, condition: &str) -> PhysicalQuery {
        PhysicalQuery {
            storage_id: storage_id.to_string(),
            cluster_name: "default".to_string(),
            measurement: measurement.to_string(),
            field: "usage".to_string(),
            vm_rt: vm_rt.to_string(),
            vm_condition: condition.to_string(),
            labels_matcher: vec![LabelMatcher::equal("bk_biz_id", "2")],
            ..Default::default()
        }
    }

    fn reference() -> QueryReference {
        let mut a = QueryMetric::new("a", "usage");
        a.query_list.push(physical("vm", "cpu_summary", "2_cpu", r#"ip="1""#));
        a.query_list.push(physical("vm", "cpu_summary", "3_cpu", r#"ip="2""#));
        let mut b = QueryMetric::new("b", "usage");
        b.query_list.push(physical("influx", "cpu_detail", "", ""));

        let mut reference = QueryReference::new();
        reference.insert(b);
        reference.insert(a);
        reference
    }

    #[test]
    fn test_iterates_in_name_order() {
        let reference = reference();
        let names: Vec<&String> = reference.iter().map(|(name, _)| name).collect();
        assert_eq!(names, vec!["a", "b"]);
        assert_eq!(reference.storage_ids(), vec!["vm", "influx"]);
        assert_eq!(reference.directly_storage_id(), Some("vm"));
        assert_eq!(reference.directly_cluster_name(), Some("default"));
    }

    #[test]
    fn test_directly_helpers() {
        let reference = reference();

        let names = reference.directly_metric_name();
        assert_eq!(names["a"], "cpu_summary_usage");
        assert_eq!(names["b"], "cpu_detail_usage");

        let matchers = reference.directly_labels_matcher();
        assert_eq!(matchers["a"], vec![LabelMatcher::equal("bk_biz_id", "2")]);

        let tables = reference.directly_result_table();
        assert_eq!(tables["cpu_summary_usage"], vec!["2_cpu", "3_cpu"]);
        assert!(tables["cpu_detail_usage"].is_empty());

        let conditions = reference.vm_filter_conditions();
        assert_eq!(conditions["a"], r#"ip="1" or ip="2""#);
        assert_eq!(conditions["b"], "");
    }

    #[test]
    fn test_empty_metric_has_no_routed_name() {
        let mut reference = QueryReference::new();
        reference.insert(QueryMetric::new("a", "usage"));
        assert!(reference.directly_metric_name().is_empty());
        assert_eq!(reference.directly_storage_id(), None);
    }

    #[test]
    fn test_serializes_as_map() {
        let json = serde_json::to_value(reference()).unwrap();
        assert_eq!(json["a"]["query_list"][1]["vm_rt"], "3_cpu");
    }
}

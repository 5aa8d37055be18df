//! Result normalization
//!
//! Backend series are first turned into [`Table`]s (one per series, labels
//! as group keys) and then projected into the serving shape,
//! [`UniformTable`], with optional column allow-listing and downsampling.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::downsample;
use super::promql::types::Series;

pub const TIME_COLUMN: &str = "_time";
pub const VALUE_COLUMN: &str = "_value";

/// One backend result table before projection
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Table {
    pub metric_name: String,
    pub headers: Vec<String>,
    pub types: Vec<String>,
    pub group_keys: Vec<String>,
    pub group_values: Vec<String>,
    pub data: Vec<Vec<Value>>,
}

impl Table {
    /// Build a table from a series, group keys sorted by label name
    pub fn from_series(series: &Series) -> Self {
        let (group_keys, group_values): (Vec<String>, Vec<String>) = series
            .metric
            .dimensions()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .unzip();

        let mut headers = group_keys.clone();
        headers.push(TIME_COLUMN.to_string());
        headers.push(VALUE_COLUMN.to_string());
        let mut types = vec!["string".to_string(); group_keys.len()];
        types.push("float".to_string());
        types.push("float".to_string());

        let data = series
            .values
            .iter()
            .map(|(ts, value)| {
                let mut row: Vec<Value> = group_values.iter().map(|v| Value::from(v.as_str())).collect();
                row.push(Value::from(*ts));
                row.push(Value::from(*value));
                row
            })
            .collect();

        Self {
            metric_name: series.metric.name().unwrap_or_default().to_string(),
            headers,
            types,
            group_keys,
            group_values,
            data,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    pub code: String,
    pub message: String,
}

/// One projected output table
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TableItem {
    pub name: String,
    pub metric_name: String,
    pub columns: Vec<String>,
    pub types: Vec<String>,
    pub group_keys: Vec<String>,
    pub group_values: Vec<String>,
    pub values: Vec<Vec<Value>>,
}

impl TableItem {
    fn column(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    /// Time/value points, rows without a numeric pair are skipped
    pub fn points(&self) -> Vec<(i64, f64)> {
        let (Some(t), Some(v)) = (self.column(TIME_COLUMN), self.column(VALUE_COLUMN)) else {
            return Vec::new();
        };
        self.values
            .iter()
            .filter_map(|row| Some((row.get(t)?.as_i64()?, row.get(v)?.as_f64()?)))
            .collect()
    }

    fn downsample(&mut self, factor: f64) {
        let (Some(t), Some(v)) = (self.column(TIME_COLUMN), self.column(VALUE_COLUMN)) else {
            return;
        };
        let Some(template) = self.values.first().cloned() else {
            return;
        };
        self.values = downsample::downsample(&self.points(), factor)
            .into_iter()
            .map(|(ts, value)| {
                let mut row = template.clone();
                row[t] = Value::from(ts);
                row[v] = Value::from(value);
                row
            })
            .collect();
    }
}

/// Uniform response shape shared by every query path
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UniformTable {
    #[serde(rename = "series")]
    pub tables: Vec<TableItem>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<Status>,
}

impl UniformTable {
    /// Project `tables`, keeping only `allowed` columns when non-empty.
    ///
    /// Group keys never appear as columns.
    pub fn fill(tables: &[Table], allowed: &[String]) -> Self {
        let allowed: HashSet<&str> = allowed.iter().map(String::as_str).collect();
        let tables = tables
            .iter()
            .enumerate()
            .map(|(index, table)| {
                let keys: HashSet<&str> = table.group_keys.iter().map(String::as_str).collect();
                let kept: Vec<usize> = table
                    .headers
                    .iter()
                    .enumerate()
                    .filter(|(_, h)| !keys.contains(h.as_str()))
                    .filter(|(_, h)| allowed.is_empty() || allowed.contains(h.as_str()))
                    .map(|(i, _)| i)
                    .collect();

                TableItem {
                    name: format!("_result{index}"),
                    metric_name: table.metric_name.clone(),
                    columns: kept.iter().map(|&i| table.headers[i].clone()).collect(),
                    types: kept
                        .iter()
                        .map(|&i| table.types.get(i).cloned().unwrap_or_default())
                        .collect(),
                    group_keys: table.group_keys.clone(),
                    group_values: table.group_values.clone(),
                    values: table
                        .data
                        .iter()
                        .map(|row| {
                            kept.iter()
                                .map(|&i| row.get(i).cloned().unwrap_or(Value::Null))
                                .collect()
                        })
                        .collect(),
                }
            })
            .collect();

        Self {
            tables,
            status: None,
        }
    }

    pub fn from_series(series: &[Series], allowed: &[String]) -> Self {
        let tables: Vec<Table> = series.iter().map(Table::from_series).collect();
        Self::fill(&tables, allowed)
    }

    /// Downsample every table independently
    pub fn downsample(&mut self, factor: f64) {
        for table in &mut self.tables {
            table.downsample(factor);
        }
    }

    pub fn series_num(&self) -> usize {
        self.tables.len()
    }

    pub fn points_num(&self) -> usize {
        self.tables.iter().map(|t| t.values.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::promql::types::Metric;

    fn cpu_series(points: usize) -> Series {
        Series::new(
            Metric::new("cpu_summary_usage")
                .with_label("ip", "127.0.0.1")
                .with_label("bk_biz_id", "2"),
            (0..points)
                .map(|i| (1_657_848_000_000 + i as i64 * 60_000, i as f64))
                .collect(),
        )
    }

    #[test]
    fn test_table_from_series() {
        let table = Table::from_series(&cpu_series(2));
        assert_eq!(table.metric_name, "cpu_summary_usage");
        assert_eq!(table.group_keys, vec!["bk_biz_id", "ip"]);
        assert_eq!(table.headers, vec!["bk_biz_id", "ip", "_time", "_value"]);
        assert_eq!(table.data[1][2], Value::from(1_657_848_060_000_i64));
    }

    #[test]
    fn test_fill_names_tables_and_drops_group_keys() {
        let uniform = UniformTable::from_series(&[cpu_series(2), cpu_series(3)], &[]);

        assert_eq!(uniform.tables[0].name, "_result0");
        assert_eq!(uniform.tables[1].name, "_result1");
        assert_eq!(uniform.tables[0].columns, vec!["_time", "_value"]);
        assert_eq!(uniform.tables[0].types, vec!["float", "float"]);
        assert_eq!(uniform.tables[1].values.len(), 3);
        assert_eq!(uniform.tables[0].values[1], vec![Value::from(1_657_848_060_000_i64), Value::from(1.0)]);
        assert_eq!(uniform.points_num(), 5);
    }

    #[test]
    fn test_fill_allow_list_never_keeps_keys() {
        let allowed = vec![VALUE_COLUMN.to_string(), "ip".to_string()];
        let uniform = UniformTable::from_series(&[cpu_series(1)], &allowed);
        assert_eq!(uniform.tables[0].columns, vec!["_value"]);
        assert_eq!(uniform.tables[0].values[0], vec![Value::from(0.0)]);
    }

    #[test]
    fn test_downsample_per_table() {
        let mut uniform = UniformTable::from_series(&[cpu_series(10), cpu_series(4)], &[]);
        uniform.downsample(2.0);

        assert_eq!(uniform.tables[0].values.len(), 5);
        assert_eq!(uniform.tables[0].columns, vec!["_time", "_value"]);
        assert_eq!(uniform.tables[0].values[0][1], Value::from(0.0));
        assert_eq!(uniform.tables[0].values[4][1], Value::from(9.0));
        assert_eq!(uniform.tables[1].values.len(), 2);
    }

    #[test]
    fn test_serializes_tables_as_series() {
        let uniform = UniformTable::from_series(&[cpu_series(1)], &[]);
        let json = serde_json::to_value(&uniform).unwrap();
        assert_eq!(json["series"][0]["name"], "_result0");
        assert!(json.get("status").is_none());
    }
}

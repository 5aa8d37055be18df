//! Condition trees and their backend encodings
//!
//! A [`Conditions`] value is the flat form received from callers: a list of
//! fields joined by `and`/`or` operators. [`Conditions::analysis_conditions`]
//! turns it into [`AllConditions`], a list of OR-groups where each group is an
//! AND of fields. From there it can be rendered as:
//!
//! - an InfluxQL style boolean expression ([`AllConditions::to_text`])
//! - a VictoriaMetrics condition string plus its branch count
//!   ([`AllConditions::vm_string`])
//! - PromQL label matchers ([`AllConditions::to_label_matchers`])

use std::fmt;

use serde::{Deserialize, Serialize};

use super::error::{QuerierError, Result};
use super::promql::types::LabelMatcher;

pub const AND_OPERATOR: &str = "and";
pub const OR_OPERATOR: &str = "or";

const VM_RESULT_TABLE_LABEL: &str = "result_table_id";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operator {
    Eq,
    Ne,
    Contains,
    Ncontains,
    Req,
    Nreq,
    Gt,
    Gte,
    Lt,
    Lte,
}

impl Operator {
    fn is_negative(self) -> bool {
        matches!(self, Self::Ne | Self::Ncontains | Self::Nreq)
    }

    fn is_regex(self) -> bool {
        matches!(self, Self::Req | Self::Nreq)
    }

    fn is_comparison(self) -> bool {
        matches!(self, Self::Gt | Self::Gte | Self::Lt | Self::Lte)
    }

    fn text_symbol(self) -> &'static str {
        match self {
            Self::Eq | Self::Contains => "=",
            Self::Ne | Self::Ncontains => "!=",
            Self::Req => "=~",
            Self::Nreq => "!~",
            Self::Gt => ">",
            Self::Gte => ">=",
            Self::Lt => "<",
            Self::Lte => "<=",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConditionField {
    #[serde(rename = "field_name")]
    pub dimension_name: String,
    #[serde(default)]
    pub value: Vec<String>,
    #[serde(rename = "op")]
    pub operator: Operator,
}

impl ConditionField {
    pub fn new(name: impl Into<String>, operator: Operator, value: Vec<String>) -> Self {
        Self {
            dimension_name: name.into(),
            value,
            operator,
        }
    }

    pub fn contains(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self::new(name, Operator::Contains, vec![value.into()])
    }

    fn values(&self) -> Vec<&str> {
        if self.value.is_empty() {
            vec![""]
        } else {
            self.value.iter().map(String::as_str).collect()
        }
    }

    /// InfluxQL form, e.g. `bk_biz_id = '2'` or `(ip = 'a' or ip = 'b')`
    pub fn to_text(&self) -> String {
        let symbol = self.operator.text_symbol();
        let parts: Vec<String> = self
            .values()
            .into_iter()
            .map(|v| {
                let literal = if self.operator.is_regex() {
                    format!("/{}/", v.replace('/', "\\/"))
                } else {
                    format!("'{}'", v.replace('\'', "\\'"))
                };
                format!("{} {symbol} {literal}", self.dimension_name)
            })
            .collect();

        if parts.len() == 1 {
            return parts.into_iter().collect();
        }
        let joiner = if self.operator.is_negative() {
            " and "
        } else {
            " or "
        };
        format!("({})", parts.join(joiner))
    }

    fn alternation(&self, anchored: bool) -> String {
        let values = self.values();
        if self.operator.is_regex() {
            return values.join("|");
        }
        let escaped: Vec<String> = values.into_iter().map(regex::escape).collect();
        if anchored {
            format!("^({})$", escaped.join("|"))
        } else {
            escaped.join("|")
        }
    }

    fn vm_matcher(&self) -> Option<String> {
        if self.operator.is_comparison() {
            log::warn!(
                "Comparison operator on '{}' has no VictoriaMetrics form, dropping it",
                self.dimension_name
            );
            return None;
        }

        let single = self.value.len() <= 1 && !self.operator.is_regex();
        let (symbol, value) = match (single, self.operator.is_negative()) {
            (true, false) => ("=", self.values()[0].to_string()),
            (true, true) => ("!=", self.values()[0].to_string()),
            (false, false) => ("=~", self.alternation(true)),
            (false, true) => ("!~", self.alternation(true)),
        };
        let value = if self.operator.is_regex() {
            self.alternation(false)
        } else {
            value
        };
        Some(format!(
            "{}{symbol}\"{}\"",
            self.dimension_name,
            escape_vm_value(&value)
        ))
    }

    fn label_matcher(&self) -> Option<LabelMatcher> {
        if self.operator.is_comparison() {
            log::warn!(
                "Comparison operator on '{}' has no label matcher form, dropping it",
                self.dimension_name
            );
            return None;
        }
        let name = self.dimension_name.as_str();
        let single = self.value.len() <= 1 && !self.operator.is_regex();
        let matcher = match (single, self.operator.is_negative()) {
            (true, false) => LabelMatcher::equal(name, self.values()[0]),
            (true, true) => LabelMatcher::not_equal(name, self.values()[0]),
            (false, false) => LabelMatcher::regex_match(name, &self.alternation(false)),
            (false, true) => LabelMatcher::regex_not_match(name, &self.alternation(false)),
        };
        Some(matcher)
    }
}

/// Escape a value for a double quoted VictoriaMetrics string
fn escape_vm_value(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

/// Flat condition list as supplied by callers
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conditions {
    #[serde(default)]
    pub field_list: Vec<ConditionField>,
    #[serde(default)]
    pub condition_list: Vec<String>,
}

impl Conditions {
    /// Add a field; the join operator is only recorded once a prior field exists
    pub fn append(&mut self, field: ConditionField, condition: &str) {
        if self.field_list.len() > self.condition_list.len() {
            self.condition_list.push(condition.to_string());
        }
        self.field_list.push(field);
    }

    pub fn analysis_conditions(&self) -> Result<AllConditions> {
        if self.field_list.is_empty() {
            if !self.condition_list.is_empty() {
                return Err(QuerierError::InvalidCondition(
                    "join operators given without fields".to_string(),
                ));
            }
            return Ok(AllConditions::default());
        }
        if self.condition_list.len() + 1 != self.field_list.len() {
            return Err(QuerierError::InvalidCondition(format!(
                "{} fields need {} join operators, got {}",
                self.field_list.len(),
                self.field_list.len() - 1,
                self.condition_list.len()
            )));
        }

        let mut groups = Vec::new();
        let mut current = vec![self.field_list[0].clone()];
        for (field, join) in self.field_list[1..].iter().zip(&self.condition_list) {
            match join.to_lowercase().as_str() {
                AND_OPERATOR => current.push(field.clone()),
                OR_OPERATOR => {
                    groups.push(std::mem::take(&mut current));
                    current.push(field.clone());
                }
                other => {
                    return Err(QuerierError::InvalidCondition(format!(
                        "unknown join operator '{other}'"
                    )));
                }
            }
        }
        groups.push(current);
        Ok(AllConditions(groups))
    }

    pub fn to_label_matchers(&self) -> Result<Vec<LabelMatcher>> {
        Ok(self.analysis_conditions()?.to_label_matchers())
    }
}

/// OR of AND-groups
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AllConditions(pub Vec<Vec<ConditionField>>);

impl AllConditions {
    pub fn new(groups: Vec<Vec<ConditionField>>) -> Self {
        Self(groups)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn groups(&self) -> &[Vec<ConditionField>] {
        &self.0
    }

    /// Cartesian AND: every branch of `self` conjoined with every branch of `other`
    pub fn merge(&self, other: &AllConditions) -> AllConditions {
        if self.is_empty() {
            return other.clone();
        }
        if other.is_empty() {
            return self.clone();
        }
        let mut groups = Vec::with_capacity(self.len() * other.len());
        for left in &self.0 {
            for right in &other.0 {
                let mut group = left.clone();
                group.extend(right.iter().cloned());
                groups.push(group);
            }
        }
        AllConditions(groups)
    }

    pub fn to_text(&self) -> String {
        let multi = self.len() > 1;
        self.0
            .iter()
            .map(|group| {
                let text = group
                    .iter()
                    .map(ConditionField::to_text)
                    .collect::<Vec<_>>()
                    .join(" and ");
                if multi { format!("({text})") } else { text }
            })
            .collect::<Vec<_>>()
            .join(" or ")
    }

    /// VictoriaMetrics condition and the number of OR-branches it contains
    pub fn vm_string(&self, vm_rt: &str) -> (String, usize) {
        let prefix = if vm_rt.is_empty() {
            None
        } else {
            Some(format!(
                "{VM_RESULT_TABLE_LABEL}=\"{}\"",
                escape_vm_value(vm_rt)
            ))
        };

        if self.is_empty() {
            return match prefix {
                Some(prefix) => (prefix, 1),
                None => (String::new(), 0),
            };
        }

        let branches: Vec<String> = self
            .0
            .iter()
            .map(|group| {
                prefix
                    .iter()
                    .cloned()
                    .chain(group.iter().filter_map(ConditionField::vm_matcher))
                    .collect::<Vec<_>>()
                    .join(", ")
            })
            .collect();
        let count = branches.len();
        (branches.join(" or "), count)
    }

    /// Matchers of the first OR-group.
    ///
    /// Label matchers cannot express OR, so every other group is dropped.
    pub fn to_label_matchers(&self) -> Vec<LabelMatcher> {
        self.0
            .first()
            .map(|group| group.iter().filter_map(ConditionField::label_matcher).collect())
            .unwrap_or_default()
    }
}

/// `and`-joined list of text conditions
#[derive(Debug, Clone, Default)]
pub struct WhereList {
    items: Vec<(String, bool)>,
}

impl WhereList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_conditions(&mut self, conditions: &AllConditions) {
        if !conditions.is_empty() {
            self.items.push((conditions.to_text(), conditions.len() > 1));
        }
    }

    pub fn push_field(&mut self, field: &ConditionField) {
        self.items.push((field.to_text(), false));
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl fmt::Display for WhereList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let wrap = self.items.len() > 1;
        for (i, (text, compound)) in self.items.iter().enumerate() {
            if i > 0 {
                write!(f, " {AND_OPERATOR} ")?;
            }
            if wrap && *compound {
                write!(f, "({text})")?;
            } else {
                write!(f, "{text}")?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::promql::types::MatcherOp;

    fn eq(name: &str, value: &str) -> ConditionField {
        ConditionField::new(name, Operator::Eq, vec![value.to_string()])
    }

    fn two_groups() -> Conditions {
        let mut conditions = Conditions::default();
        conditions.append(eq("ip", "127.0.0.1"), AND_OPERATOR);
        conditions.append(eq("api", "/query"), AND_OPERATOR);
        conditions.append(eq("ip", "127.0.0.2"), OR_OPERATOR);
        conditions
    }

    #[test]
    fn test_append_keeps_join_list_short() {
        let conditions = two_groups();
        assert_eq!(conditions.field_list.len(), 3);
        assert_eq!(conditions.condition_list, vec!["and", "or"]);
    }

    #[test]
    fn test_analysis_splits_on_or() {
        let all = two_groups().analysis_conditions().unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all.groups()[0].len(), 2);
        assert_eq!(all.groups()[1].len(), 1);
    }

    #[test]
    fn test_analysis_rejects_bad_join_list() {
        let conditions = Conditions {
            field_list: vec![eq("a", "1"), eq("b", "2")],
            condition_list: vec![],
        };
        assert!(conditions.analysis_conditions().is_err());

        let conditions = Conditions {
            field_list: vec![eq("a", "1"), eq("b", "2")],
            condition_list: vec!["xor".to_string()],
        };
        assert!(matches!(
            conditions.analysis_conditions(),
            Err(QuerierError::InvalidCondition(_))
        ));
    }

    #[test]
    fn test_two_groups_text_has_single_or() {
        let text = two_groups().analysis_conditions().unwrap().to_text();
        assert_eq!(
            text,
            "(ip = '127.0.0.1' and api = '/query') or (ip = '127.0.0.2')"
        );
        assert_eq!(text.matches(" or ").count(), 1);
    }

    #[test]
    fn test_label_matchers_use_first_group_only() {
        let matchers = two_groups().to_label_matchers().unwrap();
        assert_eq!(matchers.len(), 2);
        assert_eq!(matchers[0].name, "ip");
        assert_eq!(matchers[0].value, "127.0.0.1");
        assert_eq!(matchers[1].name, "api");
    }

    #[test]
    fn test_vm_string_counts_branches() {
        let all = two_groups().analysis_conditions().unwrap();
        let (condition, count) = all.vm_string("2_bkmonitor_time_series_1");
        assert_eq!(count, 2);
        assert_eq!(
            condition,
            r#"result_table_id="2_bkmonitor_time_series_1", ip="127.0.0.1", api="/query" or result_table_id="2_bkmonitor_time_series_1", ip="127.0.0.2""#
        );
    }

    #[test]
    fn test_vm_string_escapes_regex_twice() {
        let all = AllConditions::new(vec![vec![
            ConditionField::new("ip", Operator::Req, vec![r"30\.171\.181\.60".to_string()]),
            ConditionField::new("api", Operator::Ne, vec!["/metrics".to_string()]),
        ]]);
        let (condition, count) = all.vm_string("");
        assert_eq!(count, 1);
        assert_eq!(condition, r#"ip=~"30\\.171\\.181\\.60", api!="/metrics""#);
    }

    #[test]
    fn test_multi_value_equality_becomes_anchored_alternation() {
        let field = ConditionField::new(
            "ip",
            Operator::Contains,
            vec!["10.0.0.1".to_string(), "10.0.0.2".to_string()],
        );
        let all = AllConditions::new(vec![vec![field.clone()]]);
        let (condition, _) = all.vm_string("");
        assert_eq!(condition, r#"ip=~"^(10\\.0\\.0\\.1|10\\.0\\.0\\.2)$""#);
        assert_eq!(field.to_text(), "(ip = '10.0.0.1' or ip = '10.0.0.2')");

        let matcher = field.label_matcher().unwrap();
        assert_eq!(matcher.op, MatcherOp::RegexMatch);
        assert_eq!(matcher.value, r"10\.0\.0\.1|10\.0\.0\.2");
    }

    #[test]
    fn test_negative_multi_value_text_uses_and() {
        let field = ConditionField::new(
            "api",
            Operator::Ncontains,
            vec!["/a".to_string(), "/b".to_string()],
        );
        assert_eq!(field.to_text(), "(api != '/a' and api != '/b')");
    }

    #[test]
    fn test_comparison_dropped_from_vm_form() {
        let all = AllConditions::new(vec![vec![
            eq("a", "1"),
            ConditionField::new("b", Operator::Gt, vec!["2".to_string()]),
        ]]);
        assert_eq!(all.vm_string("").0, r#"a="1""#);
        assert_eq!(all.to_text(), "a = '1' and b > '2'");
    }

    #[test]
    fn test_merge_is_cartesian_and() {
        let user = AllConditions::new(vec![vec![eq("x", "1")], vec![eq("x", "2")]]);
        let filters = AllConditions::new(vec![vec![eq("biz", "2")], vec![eq("biz", "3")]]);
        let merged = user.merge(&filters);
        assert_eq!(merged.len(), 4);
        assert_eq!(merged.groups()[1], vec![eq("x", "1"), eq("biz", "3")]);

        assert_eq!(AllConditions::default().merge(&filters), filters);
        assert_eq!(user.merge(&AllConditions::default()), user);
    }

    #[test]
    fn test_where_list_wraps_compound_items() {
        let mut list = WhereList::new();
        list.push_conditions(&two_groups().analysis_conditions().unwrap());
        list.push_field(&eq("metric_name", "usage"));
        assert_eq!(
            list.to_string(),
            "((ip = '127.0.0.1' and api = '/query') or (ip = '127.0.0.2')) and metric_name = 'usage'"
        );
    }

    #[test]
    fn test_deserialize_condition_field() {
        let field: ConditionField =
            serde_json::from_str(r#"{"field_name":"bk_biz_id","value":["2"],"op":"contains"}"#)
                .unwrap();
        assert_eq!(field, ConditionField::contains("bk_biz_id", "2"));
    }
}

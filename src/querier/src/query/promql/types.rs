//! Series and label matcher types shared by the translator, the condition
//! encoder and the result normalizer

use std::collections::BTreeMap;
use std::fmt;

use promql_parser::label::{MatchOp, Matcher};

pub const METRIC_NAME_LABEL: &str = "__name__";

/// One backend series, timestamps in epoch milliseconds
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Series {
    pub metric: Metric,
    pub values: Vec<(i64, f64)>,
}

impl Series {
    pub fn new(metric: Metric, values: Vec<(i64, f64)>) -> Self {
        Self { metric, values }
    }
}

/// Label set of a series, `__name__` included
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Metric {
    pub labels: BTreeMap<String, String>,
}

impl Metric {
    pub fn new(name: &str) -> Self {
        Self {
            labels: BTreeMap::from([(METRIC_NAME_LABEL.to_string(), name.to_string())]),
        }
    }

    pub fn with_label(mut self, name: &str, value: &str) -> Self {
        self.labels.insert(name.to_string(), value.to_string());
        self
    }

    pub fn name(&self) -> Option<&str> {
        self.labels.get(METRIC_NAME_LABEL).map(String::as_str)
    }

    /// Labels other than the metric name, sorted by label name
    pub fn dimensions(&self) -> impl Iterator<Item = (&str, &str)> {
        self.labels
            .iter()
            .filter(|(k, _)| k.as_str() != METRIC_NAME_LABEL)
            .map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum MatcherOp {
    Equal,
    NotEqual,
    RegexMatch,
    RegexNotMatch,
}

impl MatcherOp {
    fn as_str(self) -> &'static str {
        match self {
            Self::Equal => "=",
            Self::NotEqual => "!=",
            Self::RegexMatch => "=~",
            Self::RegexNotMatch => "!~",
        }
    }
}

impl fmt::Display for MatcherOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Label matcher with an unquoted value
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct LabelMatcher {
    pub name: String,
    pub op: MatcherOp,
    pub value: String,
}

impl LabelMatcher {
    fn with_op(name: &str, op: MatcherOp, value: &str) -> Self {
        Self {
            name: name.to_string(),
            op,
            value: value.to_string(),
        }
    }

    pub fn equal(name: &str, value: &str) -> Self {
        Self::with_op(name, MatcherOp::Equal, value)
    }

    pub fn not_equal(name: &str, value: &str) -> Self {
        Self::with_op(name, MatcherOp::NotEqual, value)
    }

    pub fn regex_match(name: &str, pattern: &str) -> Self {
        Self::with_op(name, MatcherOp::RegexMatch, pattern)
    }

    pub fn regex_not_match(name: &str, pattern: &str) -> Self {
        Self::with_op(name, MatcherOp::RegexNotMatch, pattern)
    }
}

impl From<&Matcher> for LabelMatcher {
    fn from(matcher: &Matcher) -> Self {
        let op = match &matcher.op {
            MatchOp::Equal => MatcherOp::Equal,
            MatchOp::NotEqual => MatcherOp::NotEqual,
            MatchOp::Re(_) => MatcherOp::RegexMatch,
            MatchOp::NotRe(_) => MatcherOp::RegexNotMatch,
        };
        Self::with_op(&matcher.name, op, &matcher.value)
    }
}

/// Renders the matcher as it appears inside a selector, e.g. `bk_biz_id="2"`
impl fmt::Display for LabelMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let escaped = self.value.replace('\\', "\\\\").replace('"', "\\\"");
        write!(f, "{}{}\"{}\"", self.name, self.op, escaped)
    }
}

/// Selector text for `name` restricted by `matchers`
pub fn selector_text(name: &str, matchers: &[LabelMatcher]) -> String {
    if matchers.is_empty() {
        return name.to_string();
    }
    let inner = matchers
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ");
    format!("{name}{{{inner}}}")
}

//! Structured sub-query to PromQL AST translation
//!
//! A sub-query becomes a vector selector leaf, optionally wrapped in a range
//! (matrix or subquery) plus a time aggregation function, then in each
//! dimensional aggregation in declaration order.
//!
//! Function and aggregation nodes are built by parsing a small template with
//! a placeholder argument and swapping the placeholder for the real subtree,
//! so argument checking stays with promql-parser.

use std::collections::HashMap;
use std::time::{Duration, UNIX_EPOCH};

use promql_parser::parser::{AtModifier, Expr, MatrixSelector, Offset, SubqueryExpr, VectorSelector};
use serde::{Deserialize, Serialize};

use super::error::PromQLError;
use super::parser::{self, bare_identifier};
use super::types::{LabelMatcher, selector_text};

const PLACEHOLDER: &str = "__ts_inner__";

const AGGREGATION_OPERATORS: &[&str] = &[
    "sum",
    "avg",
    "min",
    "max",
    "count",
    "group",
    "stddev",
    "stdvar",
    "topk",
    "bottomk",
    "count_values",
    "quantile",
    "limitk",
    "limit_ratio",
];

/// `@ start()` / `@ end()` anchors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AtAnchor {
    Start,
    End,
}

/// Selector leaf parameters
#[derive(Debug, Clone, Default)]
pub struct Selector<'a> {
    pub name: &'a str,
    pub matchers: &'a [LabelMatcher],
    /// `@` timestamp in milliseconds, takes precedence over `anchor`
    pub timestamp: Option<i64>,
    pub anchor: Option<AtAnchor>,
    /// Signed offset in milliseconds, positive looks into the past
    pub offset_ms: i64,
}

/// Time window parameters for a ranged selector
#[derive(Debug, Clone)]
pub struct Window<'a> {
    pub function: &'a str,
    pub range: Duration,
    pub position: usize,
    pub vargs: &'a [serde_json::Value],
    /// Inner step when the selector is itself nested in a subquery
    pub subquery_step: Option<Option<Duration>>,
}

/// Compose the selector offset.
///
/// Alignment compensation (`-step + 1ms`) is applied first, then the user
/// offset: forward subtracts, backward adds.
pub fn compose_offset(
    align_step: Option<Duration>,
    user_offset: Option<Duration>,
    forward: bool,
) -> i64 {
    let mut offset_ms: i64 = 0;
    if let Some(step) = align_step {
        offset_ms = -(step.as_millis() as i64) + 1;
    }
    if let Some(offset) = user_offset {
        let offset = offset.as_millis() as i64;
        if forward {
            offset_ms -= offset;
        } else {
            offset_ms += offset;
        }
    }
    offset_ms
}

fn to_offset(offset_ms: i64) -> Option<Offset> {
    match offset_ms {
        0 => None,
        ms if ms > 0 => Some(Offset::Pos(Duration::from_millis(ms as u64))),
        ms => Some(Offset::Neg(Duration::from_millis(ms.unsigned_abs()))),
    }
}

fn to_at(timestamp: Option<i64>, anchor: Option<AtAnchor>) -> Option<AtModifier> {
    if let Some(ms) = timestamp {
        let at = if ms >= 0 {
            UNIX_EPOCH + Duration::from_millis(ms as u64)
        } else {
            UNIX_EPOCH - Duration::from_millis(ms.unsigned_abs())
        };
        return Some(AtModifier::At(at));
    }
    anchor.map(|anchor| match anchor {
        AtAnchor::Start => AtModifier::Start,
        AtAnchor::End => AtModifier::End,
    })
}

/// Parse `name{matchers}` into a vector selector
pub fn vector_selector(name: &str, matchers: &[LabelMatcher]) -> Result<VectorSelector, PromQLError> {
    match parser::parse(&selector_text(name, matchers))? {
        Expr::VectorSelector(vs) => Ok(vs),
        other => Err(PromQLError::RewriteError(format!(
            "'{name}' did not parse as a vector selector: {other}"
        ))),
    }
}

/// Leaf selector with modifiers, optionally ranged and wrapped in its time function
pub fn build_selector(selector: &Selector<'_>, window: Option<&Window<'_>>) -> Result<Expr, PromQLError> {
    let mut vs = vector_selector(selector.name, selector.matchers)?;
    let offset = to_offset(selector.offset_ms);
    let at = to_at(selector.timestamp, selector.anchor);

    let Some(window) = window else {
        vs.offset = offset;
        vs.at = at;
        return Ok(Expr::VectorSelector(vs));
    };

    let ranged = match window.subquery_step {
        Some(step) => Expr::Subquery(SubqueryExpr {
            expr: Box::new(Expr::VectorSelector(vs)),
            range: window.range,
            offset,
            at,
            step,
        }),
        None => {
            vs.offset = offset;
            vs.at = at;
            Expr::MatrixSelector(MatrixSelector {
                vs,
                range: window.range,
            })
        }
    };

    apply_function(window.function, window.position, window.vargs, true, ranged)
}

fn varg_text(name: &str, value: &serde_json::Value) -> Result<String, PromQLError> {
    match value {
        serde_json::Value::Number(n) => Ok(n.to_string()),
        serde_json::Value::String(s) => Ok(format!(
            "\"{}\"",
            s.replace('\\', "\\\\").replace('"', "\\\"")
        )),
        other => Err(PromQLError::FunctionError {
            name: name.to_string(),
            reason: format!("unsupported argument {other}"),
        }),
    }
}

fn substitute_placeholder(mut template: Expr, inner: Expr) -> Result<Expr, PromQLError> {
    let mut inner = Some(inner);
    parser::rewrite(&mut template, &mut |node| {
        let is_placeholder = match node {
            Expr::VectorSelector(vs) => bare_identifier(vs) == Some(PLACEHOLDER),
            Expr::MatrixSelector(ms) => bare_identifier(&ms.vs) == Some(PLACEHOLDER),
            _ => false,
        };
        if is_placeholder {
            Ok(inner.take())
        } else {
            Ok(None)
        }
    })?;

    if inner.is_some() {
        return Err(PromQLError::RewriteError(
            "template has no placeholder argument".to_string(),
        ));
    }
    Ok(template)
}

/// Apply function `name` to `inner`, which sits at argument `position` among `vargs`
pub fn apply_function(
    name: &str,
    position: usize,
    vargs: &[serde_json::Value],
    ranged: bool,
    inner: Expr,
) -> Result<Expr, PromQLError> {
    let mut args = vargs
        .iter()
        .map(|v| varg_text(name, v))
        .collect::<Result<Vec<_>, _>>()?;
    let placeholder = if ranged {
        format!("{PLACEHOLDER}[1m]")
    } else {
        PLACEHOLDER.to_string()
    };
    args.insert(position.min(args.len()), placeholder);

    let template = parser::parse(&format!("{name}({})", args.join(", "))).map_err(|e| {
        PromQLError::FunctionError {
            name: name.to_string(),
            reason: e.to_string(),
        }
    })?;
    substitute_placeholder(template, inner)
}

/// Apply an aggregation operator or, for any other name, a function
pub fn apply_aggregation(
    method: &str,
    dimensions: &[String],
    without: bool,
    position: usize,
    vargs: &[serde_json::Value],
    inner: Expr,
) -> Result<Expr, PromQLError> {
    if !AGGREGATION_OPERATORS.contains(&method) {
        return apply_function(method, position, vargs, false, inner);
    }

    let mut args = vargs
        .iter()
        .map(|v| varg_text(method, v))
        .collect::<Result<Vec<_>, _>>()?;
    args.push(PLACEHOLDER.to_string());

    let grouping = if without {
        format!(" without ({}) ", dimensions.join(", "))
    } else if !dimensions.is_empty() {
        format!(" by ({}) ", dimensions.join(", "))
    } else {
        String::new()
    };

    let template = parser::parse(&format!("{method}{grouping}({})", args.join(", "))).map_err(
        |e| PromQLError::FunctionError {
            name: method.to_string(),
            reason: e.to_string(),
        },
    )?;
    substitute_placeholder(template, inner)
}

/// Substitute every bare reference-name identifier in `formula`
///
/// A reference used as a range (`a[5m]`) must translate to a plain vector
/// selector.
pub fn substitute_references(
    formula: &mut Expr,
    translated: &HashMap<String, Expr>,
) -> Result<(), PromQLError> {
    parser::rewrite(formula, &mut |node| match node {
        Expr::VectorSelector(vs) => Ok(bare_identifier(vs)
            .and_then(|name| translated.get(name))
            .cloned()),
        Expr::MatrixSelector(ms) => {
            let Some(expr) = bare_identifier(&ms.vs).and_then(|name| translated.get(name)) else {
                return Ok(None);
            };
            match expr {
                Expr::VectorSelector(vs) => Ok(Some(Expr::MatrixSelector(MatrixSelector {
                    vs: vs.clone(),
                    range: ms.range,
                }))),
                other => Err(PromQLError::RewriteError(format!(
                    "reference translated to '{other}' cannot take a range"
                ))),
            }
        }
        _ => Ok(None),
    })
}

fn renamed(
    vs: &VectorSelector,
    metrics: &HashMap<String, String>,
    matchers: &HashMap<String, Vec<LabelMatcher>>,
) -> Result<Option<VectorSelector>, PromQLError> {
    let Some(reference) = vs.name.as_deref() else {
        return Ok(None);
    };
    let Some(metric) = metrics.get(reference) else {
        return Ok(None);
    };

    let mut all: Vec<LabelMatcher> = vs.matchers.matchers.iter().map(LabelMatcher::from).collect();
    if let Some(routed) = matchers.get(reference) {
        all.extend(routed.iter().cloned());
    }

    let mut renamed = vector_selector(metric, &all)?;
    renamed.offset = vs.offset.clone();
    renamed.at = vs.at.clone();
    Ok(Some(renamed))
}

/// Rename every selector named by a reference to its routed metric, adding
/// the routed label matchers and keeping offset and `@` modifiers
pub fn rename_metrics(
    expr: &mut Expr,
    metrics: &HashMap<String, String>,
    matchers: &HashMap<String, Vec<LabelMatcher>>,
) -> Result<(), PromQLError> {
    parser::rewrite(expr, &mut |node| match node {
        Expr::VectorSelector(vs) => Ok(renamed(vs, metrics, matchers)?.map(Expr::VectorSelector)),
        Expr::MatrixSelector(ms) => Ok(renamed(&ms.vs, metrics, matchers)?.map(|vs| {
            Expr::MatrixSelector(MatrixSelector {
                vs,
                range: ms.range,
            })
        })),
        _ => Ok(None),
    })
}

/// Milliseconds since the epoch for an `@` modifier, for diagnostics
pub fn at_millis(at: &AtModifier) -> Option<i64> {
    match at {
        AtModifier::At(time) => time
            .duration_since(UNIX_EPOCH)
            .ok()
            .map(|d| d.as_millis() as i64)
            .or_else(|| {
                UNIX_EPOCH
                    .duration_since(*time)
                    .ok()
                    .map(|d| -(d.as_millis() as i64))
            }),
        AtModifier::Start | AtModifier::End => None,
    }
}

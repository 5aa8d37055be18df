//! PromQL parser wrapper
//!
//! Thin layer over promql-parser: error mapping, selector inspection and
//! an in-place node rewriter used by the translator.

use promql_parser::parser::{self, Expr, VectorSelector};

use super::error::PromQLError;

/// Parse a PromQL query string into an AST expression
///
/// # Examples
/// ```ignore
/// use querier::query::promql::parser::parse;
///
/// let expr = parse("cpu_summary_usage{bk_biz_id=\"2\"}").unwrap();
/// let expr = parse("sum by (ip)(rate(cpu_summary_usage[5m]))").unwrap();
/// ```
pub fn parse(query: &str) -> Result<Expr, PromQLError> {
    parser::parse(query).map_err(|e| PromQLError::ParseError(format!("{e:?}")))
}

/// Vector selectors of `expr` in source order, including those under
/// matrix selectors
pub fn selectors(expr: &Expr) -> Vec<&VectorSelector> {
    let mut found = Vec::new();
    let mut pending = vec![expr];
    while let Some(node) = pending.pop() {
        match node {
            Expr::VectorSelector(vs) => found.push(vs),
            Expr::MatrixSelector(ms) => found.push(&ms.vs),
            Expr::Call(call) => pending.extend(call.args.args.iter().rev().map(|a| a.as_ref())),
            Expr::Aggregate(agg) => {
                pending.push(&agg.expr);
                if let Some(param) = &agg.param {
                    pending.push(param);
                }
            }
            Expr::Binary(bin) => {
                pending.push(&bin.rhs);
                pending.push(&bin.lhs);
            }
            Expr::Paren(paren) => pending.push(&paren.expr),
            Expr::Unary(unary) => pending.push(&unary.expr),
            Expr::Subquery(sq) => pending.push(&sq.expr),
            Expr::Extension(_) | Expr::NumberLiteral(_) | Expr::StringLiteral(_) => {}
        }
    }
    found
}

/// Metric names of every named selector in `expr`
pub fn metric_names(expr: &Expr) -> Vec<&str> {
    selectors(expr)
        .into_iter()
        .filter_map(|vs| vs.name.as_deref())
        .collect()
}

/// Rewrite `expr` top-down in place.
///
/// `replace` sees every node before its children. Returning `Some` swaps the
/// node for the returned expression and the replacement is not descended
/// into. Matrix selectors are leaves: their inner vector selector is only
/// reachable through the matrix node itself.
pub fn rewrite<F>(expr: &mut Expr, replace: &mut F) -> Result<(), PromQLError>
where
    F: FnMut(&Expr) -> Result<Option<Expr>, PromQLError>,
{
    if let Some(replacement) = replace(expr)? {
        *expr = replacement;
        return Ok(());
    }

    match expr {
        Expr::Call(call) => {
            for arg in call.args.args.iter_mut() {
                rewrite(arg.as_mut(), replace)?;
            }
        }
        Expr::Aggregate(agg) => {
            if let Some(param) = agg.param.as_mut() {
                rewrite(param.as_mut(), replace)?;
            }
            rewrite(agg.expr.as_mut(), replace)?;
        }
        Expr::Binary(bin) => {
            rewrite(bin.lhs.as_mut(), replace)?;
            rewrite(bin.rhs.as_mut(), replace)?;
        }
        Expr::Paren(paren) => rewrite(paren.expr.as_mut(), replace)?,
        Expr::Unary(unary) => rewrite(unary.expr.as_mut(), replace)?,
        Expr::Subquery(sq) => rewrite(sq.expr.as_mut(), replace)?,
        Expr::VectorSelector(_)
        | Expr::MatrixSelector(_)
        | Expr::Extension(_)
        | Expr::NumberLiteral(_)
        | Expr::StringLiteral(_) => {}
    }
    Ok(())
}

/// Name of a selector that carries no matchers or modifiers, i.e. a bare identifier
pub fn bare_identifier(vs: &VectorSelector) -> Option<&str> {
    if vs.matchers.matchers.is_empty() && vs.offset.is_none() && vs.at.is_none() {
        vs.name.as_deref()
    } else {
        None
    }
}

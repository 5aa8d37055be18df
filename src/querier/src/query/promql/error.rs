/// Errors raised while parsing or assembling PromQL trees
#[derive(Debug, thiserror::Error)]
pub enum PromQLError {
    #[error("PromQL parse error: {0}")]
    ParseError(String),
    /// A rewrite produced an expression that cannot stand in the target position
    #[error("PromQL rewrite error: {0}")]
    RewriteError(String),
    #[error("Function '{name}' error: {reason}")]
    FunctionError { name: String, reason: String },
}

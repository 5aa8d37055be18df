//! Request scoped state threaded through every collaborator call

use tokio_util::sync::CancellationToken;

/// Cancellation plus an optional tracing span for one structured query.
///
/// Attribute insertion is a no-op when no span is attached.
#[derive(Debug, Clone, Default)]
pub struct QueryContext {
    cancel: CancellationToken,
    span: Option<tracing::Span>,
}

impl QueryContext {
    pub fn new(cancel: CancellationToken) -> Self {
        Self { cancel, span: None }
    }

    pub fn with_span(mut self, span: tracing::Span) -> Self {
        self.span = Some(span);
        self
    }

    /// Child context sharing cancellation, observed by a nested span
    pub fn child(&self, name: &'static str) -> Self {
        let span = self
            .span
            .as_ref()
            .map(|parent| tracing::info_span!(parent: parent, "stage", stage = name));
        Self {
            cancel: self.cancel.clone(),
            span,
        }
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn span(&self) -> Option<&tracing::Span> {
        self.span.as_ref()
    }

    pub fn insert(&self, key: &str, value: impl std::fmt::Display) {
        if let Some(span) = &self.span {
            span.in_scope(|| tracing::debug!(attribute = key, value = %value));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_without_span_is_noop() {
        let ctx = QueryContext::default();
        ctx.insert("query_list_num", 3);
        assert!(ctx.span().is_none());
        assert!(ctx.child("resolve").span().is_none());
    }

    #[test]
    fn test_child_shares_cancellation() {
        let token = CancellationToken::new();
        let ctx = QueryContext::new(token.clone());
        let child = ctx.child("build");
        token.cancel();
        assert!(child.is_cancelled());
    }
}

//! Correlation ID generation so a session's reader and keepalive task log lines can be tied
//! back together.

use tracing::Span;
use uuid::Uuid;

/// Identifies one replication session across its reader and keepalive tasks.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct CorrelationId(String);

impl CorrelationId {
    pub fn new() -> Self {
        CorrelationId(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Span + correlation id pair attached to a session for the lifetime of its tasks.
#[derive(Debug, Clone)]
pub struct TracingContext {
    pub correlation_id: CorrelationId,
    pub span: Span,
}

impl TracingContext {
    pub fn new() -> Self {
        let correlation_id = CorrelationId::new();
        let span = tracing::info_span!(
            "replication_session",
            correlation_id = %correlation_id,
        );
        Self {
            correlation_id,
            span,
        }
    }

    pub fn child_context(&self, operation: &str) -> Self {
        let span = tracing::info_span!(
            "replication_operation",
            correlation_id = %self.correlation_id,
            operation = operation,
        );
        Self {
            correlation_id: self.correlation_id.clone(),
            span,
        }
    }

    pub fn with_span<F, R>(&self, f: F) -> R
    where
        F: FnOnce() -> R,
    {
        let _guard = self.span.enter();
        f()
    }
}

impl Default for TracingContext {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn correlation_ids_are_unique() {
        let id1 = CorrelationId::new();
        let id2 = CorrelationId::new();
        assert_ne!(id1, id2);
        assert!(!id1.as_str().is_empty());
    }

    #[test]
    fn child_context_keeps_parent_correlation_id() {
        let context = TracingContext::new();
        let child = context.child_context("ensure_slot");
        assert_eq!(context.correlation_id, child.correlation_id);
    }
}

use uuid::Uuid;

/// Fresh execution id: 32 lowercase hex characters.
pub fn generate_execution_id() -> String {
    Uuid::new_v4().as_simple().to_string()
}

/// Span wrapping one client turn through the execution pipeline.
pub fn execution_span(method: &str, client_id: &str, execution_id: &str) -> tracing::Span {
    tracing::info_span!(
        "execution",
        method = %method,
        client_id = %client_id,
        execution_id = %execution_id,
    )
}

/// Span wrapping one public runtime operation.
pub fn method_span(method: &str, client_id: &str) -> tracing::Span {
    tracing::debug_span!("method", method = %method, client_id = %client_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_execution_id_format() {
        let id = generate_execution_id();
        assert_eq!(id.len(), 32);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_execution_ids_unique() {
        assert_ne!(generate_execution_id(), generate_execution_id());
    }

    #[test]
    fn test_spans_construct_without_subscriber() {
        let span = execution_span("complete", "c1", &generate_execution_id());
        let _guard = span.enter();
        let inner = method_span("commitToolOutput", "c1");
        let _inner_guard = inner.enter();
    }
}

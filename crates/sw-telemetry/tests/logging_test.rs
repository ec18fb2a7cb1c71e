use sw_telemetry::logging::{self, LogFormat};

#[test]
fn test_init_logging_human() {
    // Should not panic; second call is a safe no-op.
    logging::init_logging("test-service", "debug");
    logging::init_logging("test-service", "info");

    tracing::info!(client_id = "c1", "human-readable log line");
}

#[test]
fn test_init_logging_json() {
    // The global subscriber may already be set by another test; that's fine.
    logging::init_logging_json("test-service-json", "info");

    tracing::info!(client_id = "c1", "json log line");
}

#[test]
fn test_second_install_reports_noop() {
    logging::install("first", "warn", LogFormat::Human);
    assert!(!logging::install("second", "warn", LogFormat::Json));
}

use std::fs;

use lib_eventfeed::loggers::loggerlocal::{setup_logging, LoggerLocalOptions};
use tempfile::tempdir;

#[test]
fn test_loggerlocal_file_sinks() {
    // Create a temporary directory for log files
    let temp_dir = tempdir().expect("Failed to create temporary directory");
    let log_dir_path = temp_dir.path().join("logs");

    let options = LoggerLocalOptions {
        level: "info".to_string(),
        json_console: false,
        log_dir: Some(log_dir_path.clone()),
    };
    let guards = setup_logging(&options).expect("Failed to install logger");

    tracing::info!(code = 101, "This is an info message");
    tracing::warn!("This is a warning message");
    tracing::error!("This is an error message");
    tracing::debug!("This is a debug message");

    // Dropping the guards flushes the background writers
    drop(guards);

    let combined = fs::read_to_string(log_dir_path.join("combined.log"))
        .expect("combined.log was not created");
    let errors = fs::read_to_string(log_dir_path.join("error.log"))
        .expect("error.log was not created");

    assert!(combined.contains("This is an info message"), "Info message not found in combined.log");
    assert!(combined.contains(r#""code":101"#), "Structured field not found in combined.log");
    assert!(combined.contains("This is a warning message"), "Warning message not found in combined.log");
    assert!(combined.contains("This is an error message"), "Error message not found in combined.log");
    assert!(!combined.contains("This is a debug message"), "Debug message leaked past the info filter");

    assert!(errors.contains("This is an error message"), "Error message not found in error.log");
    assert!(!errors.contains("This is a warning message"), "error.log must only hold errors");

    // Every line is a standalone JSON record
    for line in combined.lines() {
        serde_json::from_str::<serde_json::Value>(line).expect("combined.log line is not JSON");
    }

    // A second install fails instead of replacing the subscriber
    assert!(setup_logging(&options).is_err());
}

//! Unit tests for the Engine log hub
//!
//! IMPORTANT: LOGGER is a global OnceLock shared across all tests.
//! All tests are marked with #[serial] to run sequentially.

use crate::fast3d::Engine;
use crate::fast3d::log::{LogEntry, LogSeverity, Logger};
use serial_test::serial;
use std::sync::{Arc, Mutex};

// ============================================================================
// TEST HELPERS
// ============================================================================

/// Test logger that captures log entries for verification
struct TestLogger {
    entries: Arc<Mutex<Vec<LogEntry>>>,
}

fn install_test_logger() -> Arc<Mutex<Vec<LogEntry>>> {
    let entries = Arc::new(Mutex::new(Vec::new()));
    Engine::set_logger(TestLogger { entries: entries.clone() });
    entries
}

impl Logger for TestLogger {
    fn log(&self, entry: &LogEntry) {
        self.entries.lock().unwrap().push(entry.clone());
    }
}

// ============================================================================
// LOGGING TESTS
// ============================================================================

#[test]
#[serial]
fn test_log_reaches_custom_logger() {
    let entries = install_test_logger();

    Engine::log(LogSeverity::Info, "fast3d::test", "hello".to_string());
    Engine::reset_logger();

    let entries = entries.lock().unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].severity, LogSeverity::Info);
    assert_eq!(entries[0].source, "fast3d::test");
    assert_eq!(entries[0].message, "hello");
    assert!(entries[0].file.is_none());
}

#[test]
#[serial]
fn test_log_detailed_carries_location() {
    let entries = install_test_logger();

    Engine::log_detailed(LogSeverity::Error, "fast3d::test", "boom".to_string(), "x.rs", 9);
    Engine::reset_logger();

    let entries = entries.lock().unwrap();
    assert_eq!(entries[0].file, Some("x.rs"));
    assert_eq!(entries[0].line, Some(9));
}

#[test]
#[serial]
fn test_macros_route_through_engine() {
    let entries = install_test_logger();

    crate::engine_trace!("fast3d::test", "t {}", 1);
    crate::engine_debug!("fast3d::test", "d {}", 2);
    crate::engine_info!("fast3d::test", "i {}", 3);
    crate::engine_warn!("fast3d::test", "w {}", 4);
    crate::engine_error!("fast3d::test", "e {}", 5);
    Engine::reset_logger();

    let entries = entries.lock().unwrap();
    let severities: Vec<LogSeverity> = entries.iter().map(|e| e.severity).collect();
    assert_eq!(
        severities,
        vec![
            LogSeverity::Trace,
            LogSeverity::Debug,
            LogSeverity::Info,
            LogSeverity::Warn,
            LogSeverity::Error,
        ]
    );
    assert_eq!(entries[4].message, "e 5");
    assert!(entries[4].file.unwrap().ends_with("engine_tests.rs"));
}

#[test]
#[serial]
fn test_reset_logger_detaches_custom_logger() {
    let entries = install_test_logger();
    Engine::reset_logger();

    Engine::log(LogSeverity::Trace, "fast3d::test", "dropped".to_string());
    assert!(entries.lock().unwrap().is_empty());
}

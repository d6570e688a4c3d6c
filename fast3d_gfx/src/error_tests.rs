//! Unit tests for error.rs
//!
//! Tests Error display strings, recoverability and the error macros.

use crate::error::{Error, Result};
use crate::log::{LogEntry, LogSeverity, Logger};
use crate::engine::Engine;
use serial_test::serial;
use std::sync::{Arc, Mutex};

// ============================================================================
// DISPLAY TESTS
// ============================================================================

#[test]
fn test_error_display_messages() {
    assert_eq!(
        Error::BackendError("vkQueueSubmit".to_string()).to_string(),
        "Backend error: vkQueueSubmit"
    );
    assert_eq!(Error::OutOfMemory.to_string(), "Out of GPU memory");
    assert_eq!(
        Error::InvalidResource("texture 3".to_string()).to_string(),
        "Invalid resource: texture 3"
    );
    assert_eq!(
        Error::InitializationFailed("no device".to_string()).to_string(),
        "Initialization failed: no device"
    );
    assert_eq!(
        Error::ShaderCompilationFailed("syntax".to_string()).to_string(),
        "Shader compilation failed: syntax"
    );
    assert_eq!(Error::DescriptorPoolExhausted.to_string(), "Descriptor pool exhausted");
    assert_eq!(Error::SwapchainOutOfDate.to_string(), "Swapchain out of date");
    assert_eq!(
        Error::ConfigError("bad json".to_string()).to_string(),
        "Configuration error: bad json"
    );
}

#[test]
fn test_error_is_std_error() {
    let err: Box<dyn std::error::Error> = Box::new(Error::OutOfMemory);
    assert_eq!(err.to_string(), "Out of GPU memory");
}

// ============================================================================
// RECOVERABILITY TESTS
// ============================================================================

#[test]
fn test_only_swapchain_out_of_date_is_recoverable() {
    assert!(Error::SwapchainOutOfDate.is_recoverable());

    assert!(!Error::OutOfMemory.is_recoverable());
    assert!(!Error::DescriptorPoolExhausted.is_recoverable());
    assert!(!Error::BackendError(String::new()).is_recoverable());
    assert!(!Error::InitializationFailed(String::new()).is_recoverable());
    assert!(!Error::ShaderCompilationFailed(String::new()).is_recoverable());
    assert!(!Error::InvalidResource(String::new()).is_recoverable());
    assert!(!Error::ConfigError(String::new()).is_recoverable());
}

// ============================================================================
// MACRO TESTS
// ============================================================================

struct CaptureLogger {
    entries: Arc<Mutex<Vec<LogEntry>>>,
}

impl Logger for CaptureLogger {
    fn log(&self, entry: &LogEntry) {
        self.entries.lock().unwrap().push(entry.clone());
    }
}

fn failing_step(code: i32) -> Result<u32> {
    if code < 0 {
        crate::engine_bail!("fast3d::test", "step failed with {}", code);
    }
    Ok(code as u32)
}

#[test]
#[serial]
fn test_engine_err_logs_and_builds_backend_error() {
    let entries = Arc::new(Mutex::new(Vec::new()));
    Engine::set_logger(CaptureLogger { entries: entries.clone() });

    let err = crate::engine_err!("fast3d::test", "bad value {}", 7);
    Engine::reset_logger();

    assert_eq!(err, Error::BackendError("bad value 7".to_string()));
    let entries = entries.lock().unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].severity, LogSeverity::Error);
    assert_eq!(entries[0].source, "fast3d::test");
    assert!(entries[0].file.is_some());
    assert!(entries[0].line.is_some());
}

#[test]
#[serial]
fn test_engine_bail_returns_early() {
    let entries = Arc::new(Mutex::new(Vec::new()));
    Engine::set_logger(CaptureLogger { entries: entries.clone() });

    let ok = failing_step(4);
    let err = failing_step(-2);
    Engine::reset_logger();

    assert_eq!(ok, Ok(4));
    assert_eq!(err, Err(Error::BackendError("step failed with -2".to_string())));
    assert_eq!(entries.lock().unwrap().len(), 1);
}

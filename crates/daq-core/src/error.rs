//! Error types shared by the digitizer framework.
//!
//! This module defines the primary error type, `DaqError`, together with the
//! narrower error types it wraps. Using the `thiserror` crate, each failure
//! category carries enough context to be logged once and acted on by the
//! caller.
//!
//! ## Error Hierarchy
//!
//! - **`DriverError`**: Returned by hardware-specific hooks (precondition wait,
//!   settings check, acquisition start, burst read, overflow check, burst
//!   processing). These are *expected operational failures*; the acquisition
//!   controller recovers from them uniformly by entering the `Error` arm state.
//! - **`ParamError`**: Raised by the parameter table for unknown parameters,
//!   writes to write-protected parameters and type mismatches.
//! - **`DaqError`**: Top-level error combining the above with configuration and
//!   I/O failures.
//!
//! Programming contract violations (an invalid channel index, reading a
//! configuration snapshot outside its valid window, an overflow report with a
//! zero buffer capacity) are *not* represented here. They are detected by
//! assertions and are never recovered.

use thiserror::Error;

use crate::parameter::ParamKind;

// =============================================================================
// Driver Errors
// =============================================================================

/// Broad classification of a driver hook failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverErrorKind {
    Configuration,
    Communication,
    Hardware,
    Timeout,
    Resource,
    InvalidParameter,
    Unsupported,
    Unknown,
}

impl std::fmt::Display for DriverErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            DriverErrorKind::Configuration => "configuration",
            DriverErrorKind::Communication => "communication",
            DriverErrorKind::Hardware => "hardware",
            DriverErrorKind::Timeout => "timeout",
            DriverErrorKind::Resource => "resource",
            DriverErrorKind::InvalidParameter => "invalid_parameter",
            DriverErrorKind::Unsupported => "unsupported",
            DriverErrorKind::Unknown => "unknown",
        };
        write!(f, "{}", label)
    }
}

/// Failure reported by a digitizer driver hook.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Driver '{driver_type}' {kind} error: {message}")]
pub struct DriverError {
    pub driver_type: String,
    pub kind: DriverErrorKind,
    pub message: String,
}

impl DriverError {
    pub fn new(
        driver_type: impl Into<String>,
        kind: DriverErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            driver_type: driver_type.into(),
            kind,
            message: message.into(),
        }
    }

    /// Shorthand for a hardware failure.
    pub fn hardware(driver_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(driver_type, DriverErrorKind::Hardware, message)
    }

    /// Shorthand for a configuration rejected by the driver.
    pub fn configuration(driver_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(driver_type, DriverErrorKind::Configuration, message)
    }
}

/// Result type returned by driver hooks.
pub type DriverResult<T> = std::result::Result<T, DriverError>;

// =============================================================================
// Parameter Errors
// =============================================================================

/// Errors raised by [`ParamTable`](crate::parameter::ParamTable).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParamError {
    /// No parameter with this name has been created.
    #[error("Unknown parameter '{0}'")]
    UnknownName(String),

    /// A parameter with this name already exists.
    #[error("Parameter '{0}' already exists")]
    Duplicate(String),

    /// The parameter may only be written by the framework or the driver.
    #[error("Parameter '{0}' is write-protected")]
    WriteProtected(String),

    /// A value was written or read with the wrong type for the parameter.
    #[error("Parameter '{name}' expects a {expected} value, got {actual}")]
    TypeMismatch {
        name: String,
        expected: ParamKind,
        actual: ParamKind,
    },

    /// The parameter has never been given a value.
    #[error("Parameter '{0}' is undefined")]
    Undefined(String),
}

// =============================================================================
// Top-level Error
// =============================================================================

/// Convenience alias for results using the framework error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

/// Primary error type for the digitizer framework.
///
/// # Error Categories
///
/// 1. **Configuration Errors** - `Configuration`
///    - Occur at startup when configuration values are logically invalid
///    - Recovery: fix the configuration and restart
///
/// 2. **Request Errors** - `Parameter`, `InvalidArmRequest`
///    - Occur when an external caller asks for something the framework refuses
///    - Recovery: correct the request; the controller state is unchanged
///
/// 3. **Driver/OS Errors** - `Driver`, `Io`
///    - Occur while constructing a device or spawning its threads
#[derive(Error, Debug)]
pub enum DaqError {
    /// Configuration validation failed.
    ///
    /// Occurs when configuration values parse correctly but fail semantic
    /// validation (e.g., zero channels, zero buffer budget).
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// A parameter read or write was rejected.
    #[error(transparent)]
    Parameter(#[from] ParamError),

    /// A driver failed outside of the acquisition loop (e.g. at construction).
    #[error(transparent)]
    Driver(#[from] DriverError),

    /// An arm request carried a value other than disarm, post-trigger or
    /// pre+post-trigger.
    #[error("Invalid arm request value {0}")]
    InvalidArmRequest(i32),

    /// Standard I/O operation failed (thread spawn, config file access).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

//! Error types for the Toku VM crate.
//!
//! Runtime errors unwind through `Result` propagation instead of longjmp;
//! protected calls catch them, restore the stack and normalise the error
//! object (see `protected`).

use thiserror::Error;

use crate::value::Value;

/// Status code reported to the host after a (protected) call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// No error.
    Ok,
    /// Runtime error.
    Runtime,
    /// Syntax error (raised by the parser collaborator, reserved here).
    Syntax,
    /// Memory allocation error.
    Memory,
    /// Error while running the error handler.
    ErrorHandler,
}

/// VM execution errors.
///
/// `Runtime` carries the rendered message; a value thrown by script code
/// travels as `Thrown` and is re-anchored to the stack by the protected-call
/// machinery before any further allocation can happen.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum VmError {
    /// Runtime error with a rendered message
    #[error("{message}")]
    Runtime { message: String },

    /// Out of memory; the message string is preallocated by the state
    #[error("out of memory")]
    Memory,

    /// Error raised while running the error handler
    #[error("error in error handling")]
    ErrorHandler,

    /// A script value thrown as an error object
    #[error("<error object>")]
    Thrown { value: Value },
}

impl VmError {
    /// Create a runtime error from a rendered message.
    pub fn runtime<S: Into<String>>(message: S) -> Self {
        Self::Runtime {
            message: message.into(),
        }
    }

    /// Status code corresponding to this error.
    pub fn status(&self) -> Status {
        match self {
            VmError::Runtime { .. } | VmError::Thrown { .. } => Status::Runtime,
            VmError::Memory => Status::Memory,
            VmError::ErrorHandler => Status::ErrorHandler,
        }
    }

    /// Error category for logging.
    pub fn category(&self) -> &'static str {
        match self {
            VmError::Runtime { .. } => "runtime",
            VmError::Memory => "memory",
            VmError::ErrorHandler => "handler",
            VmError::Thrown { .. } => "thrown",
        }
    }
}

/// Result type for VM operations.
pub type VmResult<T> = std::result::Result<T, VmError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let error = VmError::runtime("attempt to perform arithmetic on a nil value");
        assert!(matches!(error, VmError::Runtime { .. }));
        assert_eq!(
            error.to_string(),
            "attempt to perform arithmetic on a nil value"
        );
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(VmError::runtime("x").status(), Status::Runtime);
        assert_eq!(VmError::Memory.status(), Status::Memory);
        assert_eq!(VmError::ErrorHandler.status(), Status::ErrorHandler);
    }

    #[test]
    fn test_error_categories() {
        assert_eq!(VmError::runtime("x").category(), "runtime");
        assert_eq!(VmError::Memory.category(), "memory");
    }
}

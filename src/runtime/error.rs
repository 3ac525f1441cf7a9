//! Error taxonomy for the runtime and its marshaling boundary.

use std::fmt;
use thiserror::Error;

/// A JavaScript error reconstructed on the host side.
///
/// Carries the script error's `name`, `message`, and stack frames. The stack
/// is never absent; it is empty when the engine had none to report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptError {
    pub name: String,
    pub message: String,
    pub stack: Vec<String>,
}

impl ScriptError {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            stack: Vec::new(),
        }
    }
}

impl fmt::Display for ScriptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.message.is_empty() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{}: {}", self.name, self.message)
        }
    }
}

/// Errors produced by the runtime, its bindings, and the value marshaler.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// Allocating the engine runtime, context, or global scaffolding failed.
    #[error("engine initialization failed: {0}")]
    EngineInit(String),

    /// The runtime has been closed; no further operations are possible.
    #[error("runtime has been closed")]
    ClosedRuntime,

    /// The engine rejected the source during compilation.
    #[error("compile error in '{filename}': {message}")]
    Compile { message: String, filename: String },

    /// The byte sequence is not bytecode this engine can load.
    #[error("cannot read bytecode: {0}")]
    BytecodeRead(String),

    /// The name is invalid or already registered in the target scope.
    #[error("cannot register binding '{0}': invalid or duplicate name")]
    DuplicateOrInvalidName(String),

    /// The engine handed the async dispatcher malformed capability slots.
    /// This indicates a broken binding contract, not a user error.
    #[error("invalid async call protocol: {0}")]
    InvalidCallProtocol(String),

    /// A composite value reached itself while being marshaled.
    #[error("cannot marshal values with circular references")]
    CircularReference,

    /// A mapping with a non-string key was converted to a plain script object.
    #[error("only string keys can become script object properties, got {0}")]
    UnsupportedKeyType(String),

    /// No script representation exists for this host value, or vice versa.
    #[error("cannot map value of type '{type_name}' across the script boundary")]
    TypeMapping { type_name: String },

    /// A script value could not be coerced into the expected host type.
    #[error("cannot coerce script value of type '{actual}' into host type '{expected}'")]
    TypeCoercion {
        expected: &'static str,
        actual: &'static str,
    },

    /// A runtime error raised by script code.
    #[error("{0}")]
    Script(ScriptError),

    /// The evaluation was cancelled, normally because the runtime closed.
    /// Distinct from a failure; nothing is recorded in the exception slot.
    #[error("evaluation cancelled")]
    Cancelled,

    /// A failure reported by a host-defined binding.
    #[error("{0}")]
    Host(String),

    /// The evaluation exceeded the configured execution timeout.
    #[error("evaluation timed out after {0}ms")]
    EvaluationTimedOut(u64),
}

impl Error {
    /// Convenience constructor for failures inside host-defined bindings.
    pub fn host(message: impl Into<String>) -> Self {
        Error::Host(message.into())
    }

    /// The `name` a script-side `Error` object gets when this error crosses
    /// into the engine.
    pub(crate) fn script_name(&self) -> &str {
        match self {
            Error::EngineInit(_) => "EngineInitError",
            Error::ClosedRuntime => "ClosedRuntimeError",
            Error::Compile { .. } => "CompileError",
            Error::BytecodeRead(_) => "BytecodeReadError",
            Error::DuplicateOrInvalidName(_) => "DuplicateOrInvalidNameError",
            Error::InvalidCallProtocol(_) => "InvalidCallProtocolError",
            Error::CircularReference => "CircularReferenceError",
            Error::UnsupportedKeyType(_) => "UnsupportedKeyTypeError",
            Error::TypeMapping { .. } => "TypeMappingError",
            Error::TypeCoercion { .. } => "TypeCoercionError",
            Error::Script(e) => &e.name,
            Error::Cancelled => "CancellationError",
            Error::Host(_) => "Error",
            Error::EvaluationTimedOut(_) => "TimeoutError",
        }
    }

    /// Message text without the error-name prefix, for script `Error` objects.
    pub(crate) fn script_message(&self) -> String {
        match self {
            Error::Script(e) => e.message.clone(),
            other => other.to_string(),
        }
    }

    /// Stack frames for script `Error` objects; empty when unavailable.
    pub(crate) fn script_stack(&self) -> Vec<String> {
        match self {
            Error::Script(e) => e.stack.clone(),
            _ => Vec::new(),
        }
    }
}

impl From<ScriptError> for Error {
    fn from(e: ScriptError) -> Self {
        Error::Script(e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn script_error_display() {
        let e = ScriptError::new("TypeError", "x is not a function");
        assert_eq!(e.to_string(), "TypeError: x is not a function");

        let bare = ScriptError::new("RangeError", "");
        assert_eq!(bare.to_string(), "RangeError");
    }

    #[test]
    fn script_names_follow_taxonomy() {
        assert_eq!(Error::ClosedRuntime.script_name(), "ClosedRuntimeError");
        assert_eq!(Error::CircularReference.script_name(), "CircularReferenceError");
        assert_eq!(
            Error::Script(ScriptError::new("SyntaxError", "oops")).script_name(),
            "SyntaxError"
        );
        assert_eq!(Error::host("boom").script_name(), "Error");
    }

    #[test]
    fn host_error_message_is_preserved() {
        let e = Error::host("backend unavailable");
        assert_eq!(e.script_message(), "backend unavailable");
        assert!(e.script_stack().is_empty());
    }
}

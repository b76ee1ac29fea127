//! Unified error handling for the bouncer core.
//!
//! Mirrors the failure domains of spec.md §7: parse and auth failures are
//! recovered locally and never surface here: only errors that a caller
//! genuinely cannot route around reach a `BouncerError`.

use std::fmt;

#[derive(Debug)]
pub enum BouncerError {
    /// Configuration-related errors (missing key, wrong type, failed validation).
    Configuration(String),

    /// Network and I/O errors.
    Io(std::io::Error),

    /// Plugin registration/initialization errors.
    Plugin(String),

    /// Proxy lifecycle errors (unknown proxy, duplicate name, ...).
    Proxy(String),

    /// Programmer misuse (enabling an already-enabled plugin, detaching
    /// a listener that was never attached, ...). Always recoverable;
    /// logged at error level by the caller and otherwise ignored.
    Misuse(String),

    /// Internal invariant violation.
    Internal(String),
}

impl fmt::Display for BouncerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BouncerError::Configuration(msg) => write!(f, "configuration error: {msg}"),
            BouncerError::Io(err) => write!(f, "I/O error: {err}"),
            BouncerError::Plugin(msg) => write!(f, "plugin error: {msg}"),
            BouncerError::Proxy(msg) => write!(f, "proxy error: {msg}"),
            BouncerError::Misuse(msg) => write!(f, "misuse: {msg}"),
            BouncerError::Internal(msg) => write!(f, "internal error: {msg}"),
        }
    }
}

impl std::error::Error for BouncerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            BouncerError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for BouncerError {
    fn from(err: std::io::Error) -> Self {
        BouncerError::Io(err)
    }
}

impl From<serde_yaml::Error> for BouncerError {
    fn from(err: serde_yaml::Error) -> Self {
        BouncerError::Configuration(err.to_string())
    }
}

pub type BouncerResult<T> = std::result::Result<T, BouncerError>;

/// Helper trait for attaching context to a foreign error as it crosses
/// into bouncer-owned code.
pub trait ErrorContext<T> {
    fn with_context(self, context: &str) -> BouncerResult<T>;
}

impl<T, E> ErrorContext<T> for std::result::Result<T, E>
where
    E: fmt::Display,
{
    fn with_context(self, context: &str) -> BouncerResult<T> {
        self.map_err(|e| BouncerError::Internal(format!("{context}: {e}")))
    }
}

//! Error types for the kernel compiler

use thiserror::Error;

/// Result type for compilation operations
pub type CompileResult<T> = Result<T, CompileError>;

/// Compilation errors
///
/// Every error is fatal to the compile that raised it. In production mode the
/// driver collapses them into [`CompileError::Opaque`].
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CompileError {
    #[error("Lexer error at line {line}: {message}")]
    LexerError { line: usize, message: String },

    #[error("Parse error at line {line}: {message}")]
    ParseError { line: usize, message: String },

    #[error("Unsupported construct at line {line}: {message}")]
    UnsupportedConstruct { line: usize, message: String },

    #[error("Unresolved name at line {line}: unable to find the type of '{name}'")]
    UnresolvedName { line: usize, name: String },

    #[error("Invalid assignment at line {line}: assigning to undeclared variable '{name}'")]
    InvalidAssignmentTarget { line: usize, name: String },

    #[error("Type error at line {line}: {message}")]
    TypeError { line: usize, message: String },

    #[error("Shape mismatch at line {line}: expected {expected}, got {got}")]
    ShapeMismatch {
        line: usize,
        expected: String,
        got: String,
    },

    #[error("Index out of bounds at line {line}: index {index} on axis {axis} of '{buffer}' with extent {extent}")]
    IndexOutOfBounds {
        line: usize,
        buffer: String,
        axis: usize,
        index: String,
        extent: String,
    },

    #[error("Dependency analysis did not converge after {passes} passes")]
    AnalysisDiverged { passes: usize },

    #[error("Backend error: {message}")]
    BackendError { message: String },

    #[error("Config error: {message}")]
    ConfigError { message: String },

    /// Production-mode wrapper; only the rendered message survives.
    #[error("{message}")]
    Opaque { message: String },
}

/// Discriminant of [`CompileError`], for callers that branch on the failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Lexer,
    Parse,
    UnsupportedConstruct,
    UnresolvedName,
    InvalidAssignmentTarget,
    Type,
    ShapeMismatch,
    IndexOutOfBounds,
    AnalysisDiverged,
    Backend,
    Config,
    Opaque,
}

impl CompileError {
    pub fn lexer(line: usize, msg: impl Into<String>) -> Self {
        CompileError::LexerError { line, message: msg.into() }
    }

    pub fn parse_error(line: usize, msg: impl Into<String>) -> Self {
        CompileError::ParseError { line, message: msg.into() }
    }

    pub fn unsupported(line: usize, msg: impl Into<String>) -> Self {
        CompileError::UnsupportedConstruct { line, message: msg.into() }
    }

    pub fn unresolved(line: usize, name: impl Into<String>) -> Self {
        CompileError::UnresolvedName { line, name: name.into() }
    }

    pub fn undeclared_target(line: usize, name: impl Into<String>) -> Self {
        CompileError::InvalidAssignmentTarget { line, name: name.into() }
    }

    pub fn type_error(line: usize, msg: impl Into<String>) -> Self {
        CompileError::TypeError { line, message: msg.into() }
    }

    pub fn shape_mismatch(line: usize, expected: impl Into<String>, got: impl Into<String>) -> Self {
        CompileError::ShapeMismatch {
            line,
            expected: expected.into(),
            got: got.into(),
        }
    }

    pub fn backend(msg: impl Into<String>) -> Self {
        CompileError::BackendError { message: msg.into() }
    }

    pub fn config(msg: impl Into<String>) -> Self {
        CompileError::ConfigError { message: msg.into() }
    }

    /// Collapse into an opaque error carrying only the rendered message
    pub fn into_opaque(self) -> Self {
        match self {
            CompileError::Opaque { .. } => self,
            other => CompileError::Opaque { message: other.to_string() },
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            CompileError::LexerError { .. } => ErrorKind::Lexer,
            CompileError::ParseError { .. } => ErrorKind::Parse,
            CompileError::UnsupportedConstruct { .. } => ErrorKind::UnsupportedConstruct,
            CompileError::UnresolvedName { .. } => ErrorKind::UnresolvedName,
            CompileError::InvalidAssignmentTarget { .. } => ErrorKind::InvalidAssignmentTarget,
            CompileError::TypeError { .. } => ErrorKind::Type,
            CompileError::ShapeMismatch { .. } => ErrorKind::ShapeMismatch,
            CompileError::IndexOutOfBounds { .. } => ErrorKind::IndexOutOfBounds,
            CompileError::AnalysisDiverged { .. } => ErrorKind::AnalysisDiverged,
            CompileError::BackendError { .. } => ErrorKind::Backend,
            CompileError::ConfigError { .. } => ErrorKind::Config,
            CompileError::Opaque { .. } => ErrorKind::Opaque,
        }
    }
}

//! Runtime error types

use thiserror::Error;

use crate::compiler::CodeError;
use crate::extension::ExtensionError;

/// Failure while running compiled code
#[derive(Debug, Error, Clone, PartialEq)]
pub enum RuntimeError {
    #[error("invalid compiled code: {0}")]
    Code(#[from] CodeError),

    #[error("template data must be an object, got {0}")]
    InvalidData(&'static str),

    #[error("undefined variable '{0}'")]
    UndefinedVariable(String),

    #[error("cannot iterate over {0}")]
    NotIterable(&'static str),

    #[error("no runtime tag '{0}' registered")]
    UnknownTag(String),

    #[error("no runtime filter '{0}' registered")]
    UnknownFilter(String),

    #[error("asynchronous filter '{0}' applied without await")]
    UnawaitedFilter(String),

    #[error("{instr}: stack underflow")]
    StackUnderflow { instr: &'static str },

    #[error("{instr}: no captured body")]
    MissingCapture { instr: &'static str },

    #[error(transparent)]
    Extension(#[from] ExtensionError),
}

/// Failure of an artifact store
#[derive(Debug, Error, Clone, PartialEq)]
pub enum StoreError {
    #[error("artifact store lock poisoned")]
    Poisoned,

    #[error("artifact store unavailable: {0}")]
    Unavailable(String),
}

/// Failure of one `execute` call
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ExecuteError {
    #[error("no compiled template named '{0}'")]
    TemplateNotFound(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("execution of '{template}' failed: {source}")]
    Execution {
        template: String,
        #[source]
        source: RuntimeError,
    },

    #[error("template '{template}' completed without exporting a builder")]
    MissingExport { template: String },
}

impl ExecuteError {
    /// The code of a user-raised error, e.g. from `{% error "CODE" %}`
    pub fn raised_code(&self) -> Option<&str> {
        match self {
            ExecuteError::Execution {
                source: RuntimeError::Extension(ExtensionError::Raised { code }),
                ..
            } => Some(code),
            _ => None,
        }
    }
}

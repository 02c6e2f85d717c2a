//! Module preparation errors.

use thiserror::Error;

/// Errors that make a guest module unusable. All of them surface while the
/// plugin is being constructed, never during a scheduling call.
#[derive(Debug, Error)]
pub enum PrepareError {
    #[error("failed to compile guest module: {0}")]
    Compile(String),

    #[error("guest imports {module}.{name} from an unsupported namespace")]
    UnknownNamespace { module: String, name: String },

    #[error("guest imports unknown host function {module}.{name}")]
    UnknownHostFunction { module: String, name: String },

    #[error("guest imports {module}.{name} as a non-function")]
    NonFunctionImport { module: String, name: String },

    #[error("guest imports {module}.{name} with signature {actual}, host provides {expected}")]
    ImportSignature {
        module: String,
        name: String,
        expected: String,
        actual: String,
    },

    #[error("guest export {name} has signature {actual}, expected {expected}")]
    ExportSignature {
        name: String,
        expected: String,
        actual: String,
    },

    #[error("guest imports host functions but does not export \"memory\"")]
    MissingMemory,

    #[error("failed to link guest module: {0}")]
    Link(String),
}

pub type PrepareResult<T> = Result<T, PrepareError>;

//! Plugin construction and guest call errors.

use thiserror::Error;

use kubewasm_core::{ConfigError, SourceError, Status};
use kubewasm_host::{PrepareError, Stage};

use crate::resolver::ResolveError;

/// Errors that keep a plugin from becoming ready.
#[derive(Debug, Error)]
pub enum PluginError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Source(#[from] SourceError),

    #[error("failed to read guest module {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to fetch guest module from {url}: {reason}")]
    Fetch { url: String, reason: String },

    #[error(transparent)]
    Prepare(#[from] PrepareError),

    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error("failed to start wasm engine: {0}")]
    Engine(String),

    #[error("failed to instantiate guest module {module}: {reason}")]
    Instantiate { module: String, reason: String },

    #[error(transparent)]
    Guest(#[from] GuestCallError),
}

/// A failed call into a guest export.
#[derive(Debug, Error)]
pub enum GuestCallError {
    #[error("guest {stage} trapped: {trap}")]
    Trap {
        stage: Stage,
        trap: String,
        diagnostics: String,
    },

    #[error("guest {stage} exited with code {code}")]
    Exit {
        stage: Stage,
        code: i32,
        diagnostics: String,
    },

    #[error("guest does not export {0}")]
    NotExported(Stage),
}

impl GuestCallError {
    pub(crate) fn from_wasmtime(stage: Stage, err: wasmtime::Error, diagnostics: String) -> Self {
        match err.downcast_ref::<wasmtime_wasi::I32Exit>() {
            Some(exit) => GuestCallError::Exit {
                stage,
                code: exit.0,
                diagnostics,
            },
            None => GuestCallError::Trap {
                stage,
                trap: format!("{err:#}"),
                diagnostics,
            },
        }
    }

    pub fn stage(&self) -> Stage {
        match self {
            GuestCallError::Trap { stage, .. }
            | GuestCallError::Exit { stage, .. }
            | GuestCallError::NotExported(stage) => *stage,
        }
    }

    /// What the guest wrote to stdout/stderr during the failed call.
    pub fn diagnostics(&self) -> &str {
        match self {
            GuestCallError::Trap { diagnostics, .. } | GuestCallError::Exit { diagnostics, .. } => {
                diagnostics
            }
            GuestCallError::NotExported(_) => "",
        }
    }

    /// The `Error` status reported to the framework, with any captured
    /// output appended.
    pub fn into_status(self) -> Status {
        let diagnostics = self.diagnostics().trim_end();
        if diagnostics.is_empty() {
            Status::error(self.to_string())
        } else {
            Status::error(format!("{self}\n{diagnostics}"))
        }
    }
}

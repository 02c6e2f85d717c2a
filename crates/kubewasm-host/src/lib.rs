//! kubewasm-host — the wasmtime side of scheduler guest modules.
//!
//! - **bridge**: host functions in the `k8s.io/api` and `k8s.io/scheduler` namespaces
//! - **module**: compile, validate, and pre-link guest modules
//! - **engine**: shared `wasmtime::Engine` and per-module linkers
//! - **state**: per-instance store data (call context, pod cache, captured stdio)
//! - **limiter**: memory and table caps for guest instances

pub mod bridge;
pub mod context;
pub mod engine;
pub mod error;
pub mod limiter;
pub mod module;
pub mod state;

pub use context::CallContext;
pub use engine::SchedEngine;
pub use error::{PrepareError, PrepareResult};
pub use module::{CompiledModule, ExportSet, ImportSet, Stage, prepare};
pub use state::{GuestSettings, GuestState};

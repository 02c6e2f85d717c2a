//! Shared wasmtime engine and per-module linker setup.
//!
//! # Architecture
//!
//! One `wasmtime::Engine` is shared by every guest module the process
//! loads. Linkers are built per module from its import set, so a module
//! that never imports `k8s.io/api` or WASI never has those registered.

use wasmtime::{Config, Engine, Linker};

use crate::bridge;
use crate::module::ImportSet;
use crate::state::GuestState;

/// Cheap to clone (the engine is reference-counted internally).
#[derive(Clone)]
pub struct SchedEngine {
    engine: Engine,
}

impl SchedEngine {
    /// Create an engine for synchronous, run-to-completion guest calls.
    pub fn new() -> anyhow::Result<Self> {
        let mut config = Config::new();
        config.wasm_multi_value(true);

        let engine = Engine::new(&config)?;
        tracing::info!("kubewasm engine initialized");
        Ok(Self { engine })
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Build a linker with exactly the namespaces in `imports`.
    pub fn linker_for(&self, imports: ImportSet) -> wasmtime::Result<Linker<GuestState>> {
        let mut linker = Linker::new(&self.engine);

        if imports.contains(ImportSet::API) {
            bridge::api::add_to_linker(&mut linker)?;
        }
        if imports.contains(ImportSet::SCHEDULER) {
            bridge::scheduler::add_to_linker(&mut linker)?;
        }
        if imports.contains(ImportSet::WASI) {
            wasmtime_wasi::p1::add_to_linker_sync(&mut linker, |state: &mut GuestState| {
                state.wasi_mut()
            })?;
        }

        tracing::debug!(?imports, "guest linker built");
        Ok(linker)
    }
}

//! Host function bridge.
//!
//! Guests import host functions from two namespaces:
//!
//! - [`API_MODULE`] (`k8s.io/api`): read-only access to the objects of the
//!   in-flight call (`pod`, `node`, `nodeName`, `nodeScoreList`). Each
//!   follows the ask-then-write protocol: `(ptr, limit) -> required_len`.
//! - [`SCHEDULER_MODULE`] (`k8s.io/scheduler`): status reason, structured
//!   logging, guest configuration, and the `result.*` functions stages use
//!   to hand back structured results.
//!
//! A namespace is linked only when the module imports it. Every import
//! from these namespaces is checked against [`host_function`] at
//! preparation time, so a misspelled or mistyped import fails before the
//! first scheduling call.

pub mod api;
pub mod scheduler;

use std::fmt;

use wasmtime::{Caller, Extern, Memory, ValType};

use crate::state::GuestState;

pub const API_MODULE: &str = "k8s.io/api";
pub const SCHEDULER_MODULE: &str = "k8s.io/scheduler";
pub const WASI_MODULE: &str = "wasi_snapshot_preview1";

/// Core value types that appear in bridge and stage signatures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WasmTy {
    I32,
    I64,
    Other,
}

impl WasmTy {
    pub fn of(ty: &ValType) -> Self {
        match ty {
            ValType::I32 => WasmTy::I32,
            ValType::I64 => WasmTy::I64,
            _ => WasmTy::Other,
        }
    }
}

impl fmt::Display for WasmTy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WasmTy::I32 => f.write_str("i32"),
            WasmTy::I64 => f.write_str("i64"),
            WasmTy::Other => f.write_str("?"),
        }
    }
}

/// A function signature over [`WasmTy`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Signature {
    pub params: &'static [WasmTy],
    pub results: &'static [WasmTy],
}

impl Signature {
    pub const fn new(params: &'static [WasmTy], results: &'static [WasmTy]) -> Self {
        Self { params, results }
    }

    /// Whether a wasmtime function type has exactly this shape.
    pub fn matches(&self, ty: &wasmtime::FuncType) -> bool {
        ty.params().map(|t| WasmTy::of(&t)).eq(self.params.iter().copied())
            && ty.results().map(|t| WasmTy::of(&t)).eq(self.results.iter().copied())
    }

    /// Render a wasmtime function type the same way `Display` renders a signature.
    pub fn describe(ty: &wasmtime::FuncType) -> String {
        let params: Vec<String> = ty.params().map(|t| WasmTy::of(&t).to_string()).collect();
        let results: Vec<String> = ty.results().map(|t| WasmTy::of(&t).to_string()).collect();
        format!("({}) -> ({})", params.join(", "), results.join(", "))
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let params: Vec<String> = self.params.iter().map(ToString::to_string).collect();
        let results: Vec<String> = self.results.iter().map(ToString::to_string).collect();
        write!(f, "({}) -> ({})", params.join(", "), results.join(", "))
    }
}

use WasmTy::I32;

const BUF_TO_LEN: Signature = Signature::new(&[I32, I32], &[I32]);
const BUF: Signature = Signature::new(&[I32, I32], &[]);

const API_FUNCTIONS: &[(&str, Signature)] = &[
    (api::POD, BUF_TO_LEN),
    (api::NODE, BUF_TO_LEN),
    (api::NODE_NAME, BUF_TO_LEN),
    (api::NODE_SCORE_LIST, BUF_TO_LEN),
];

const SCHEDULER_FUNCTIONS: &[(&str, Signature)] = &[
    (scheduler::SET_STATUS_REASON, BUF),
    (scheduler::LOG, Signature::new(&[I32, I32, I32], &[])),
    (scheduler::LOGS, Signature::new(&[I32, I32, I32, I32, I32], &[])),
    (scheduler::SEVERITY, Signature::new(&[], &[I32])),
    (scheduler::GET_CONFIG, BUF_TO_LEN),
    (scheduler::RESULT_CLUSTER_EVENTS, BUF),
    (scheduler::RESULT_NODE_NAMES, BUF),
    (scheduler::RESULT_NOMINATED_NODE_NAME, BUF),
    (scheduler::RESULT_NODE_SCORE_LIST, BUF),
];

/// Look up a bridge function by namespace and name.
pub fn host_function(module: &str, name: &str) -> Option<Signature> {
    let table = match module {
        API_MODULE => API_FUNCTIONS,
        SCHEDULER_MODULE => SCHEDULER_FUNCTIONS,
        _ => return None,
    };
    table.iter().find(|(n, _)| *n == name).map(|(_, sig)| *sig)
}

/// Resolve the guest's exported linear memory.
pub(crate) fn guest_memory(caller: &mut Caller<'_, GuestState>) -> wasmtime::Result<Memory> {
    match caller.get_export("memory") {
        Some(Extern::Memory(memory)) => Ok(memory),
        _ => Err(wasmtime::Error::msg("guest does not export a memory named \"memory\"")),
    }
}

//! `k8s.io/scheduler`: status and logging, plus guest configuration and stage results.
//!
//! Guest → host transfers (`set_status_reason`, `result.*`, log messages)
//! pass `(ptr, len)` into guest memory; the range is bounds-checked and
//! copied out before the call returns. `get_config` is ask-then-write.
//!
//! Logging is gated twice: the guest can read the threshold once through
//! `severity` and skip formatting, and the host drops records below it
//! regardless.

use std::borrow::Cow;

use wasmtime::{Caller, Linker};

use kubewasm_core::{LogSeverity, NodeScore, wire};

use super::{SCHEDULER_MODULE, guest_memory};
use crate::context::CallContext;
use crate::state::GuestState;

pub const SET_STATUS_REASON: &str = "set_status_reason";
pub const LOG: &str = "log";
pub const LOGS: &str = "logs";
pub const SEVERITY: &str = "severity";
pub const GET_CONFIG: &str = "get_config";
pub const RESULT_CLUSTER_EVENTS: &str = "result.cluster_events";
pub const RESULT_NODE_NAMES: &str = "result.node_names";
pub const RESULT_NOMINATED_NODE_NAME: &str = "result.nominated_node_name";
pub const RESULT_NODE_SCORE_LIST: &str = "result.node_score_list";

/// Copy `len` bytes at `ptr` out of guest memory and hand them, with the
/// active call context, to `record`.
fn record_from_guest(
    caller: &mut Caller<'_, GuestState>,
    ptr: u32,
    len: u32,
    function: &'static str,
    record: impl FnOnce(&mut CallContext, &[u8]) -> wasmtime::Result<()>,
) -> wasmtime::Result<()> {
    let memory = guest_memory(caller)?;
    let (mem, state) = memory.data_and_store_mut(caller);
    let bytes = wire::guest_range(mem, ptr, len)?;
    match state.call_mut() {
        Some(ctx) => record(ctx, bytes),
        None => {
            tracing::debug!(function, "guest result outside of a stage call ignored");
            Ok(())
        }
    }
}

pub fn add_to_linker(linker: &mut Linker<GuestState>) -> wasmtime::Result<()> {
    linker.func_wrap(
        SCHEDULER_MODULE,
        SET_STATUS_REASON,
        |mut caller: Caller<'_, GuestState>, ptr: u32, len: u32| -> wasmtime::Result<()> {
            record_from_guest(&mut caller, ptr, len, SET_STATUS_REASON, |ctx, bytes| {
                ctx.reason = Some(String::from_utf8_lossy(bytes).into_owned());
                Ok(())
            })
        },
    )?;

    linker.func_wrap(
        SCHEDULER_MODULE,
        LOG,
        |mut caller: Caller<'_, GuestState>, severity: i32, ptr: u32, len: u32| -> wasmtime::Result<()> {
            let Some(severity) = enabled(caller.data(), severity) else {
                return Ok(());
            };
            let memory = guest_memory(&mut caller)?;
            let (mem, state) = memory.data_and_store_mut(&mut caller);
            let msg = String::from_utf8_lossy(wire::guest_range(mem, ptr, len)?);
            emit(&state.settings().module_name, severity, &msg, "");
            Ok(())
        },
    )?;

    linker.func_wrap(
        SCHEDULER_MODULE,
        LOGS,
        |mut caller: Caller<'_, GuestState>,
         severity: i32,
         msg_ptr: u32,
         msg_len: u32,
         kv_ptr: u32,
         kv_len: u32|
         -> wasmtime::Result<()> {
            let Some(severity) = enabled(caller.data(), severity) else {
                return Ok(());
            };
            let memory = guest_memory(&mut caller)?;
            let (mem, state) = memory.data_and_store_mut(&mut caller);
            let msg = String::from_utf8_lossy(wire::guest_range(mem, msg_ptr, msg_len)?);
            let kv = format_key_values(&wire::decode_string_list(wire::guest_range(
                mem, kv_ptr, kv_len,
            )?));
            emit(&state.settings().module_name, severity, &msg, &kv);
            Ok(())
        },
    )?;

    linker.func_wrap(
        SCHEDULER_MODULE,
        SEVERITY,
        |caller: Caller<'_, GuestState>| -> i32 { caller.data().settings().log_severity as i32 },
    )?;

    linker.func_wrap(
        SCHEDULER_MODULE,
        GET_CONFIG,
        |mut caller: Caller<'_, GuestState>, ptr: u32, limit: u32| -> wasmtime::Result<u32> {
            let memory = guest_memory(&mut caller)?;
            let (mem, state) = memory.data_and_store_mut(&mut caller);
            Ok(wire::write_if_fits(mem, ptr, limit, state.guest_config_bytes())?)
        },
    )?;

    linker.func_wrap(
        SCHEDULER_MODULE,
        RESULT_CLUSTER_EVENTS,
        |mut caller: Caller<'_, GuestState>, ptr: u32, len: u32| -> wasmtime::Result<()> {
            record_from_guest(&mut caller, ptr, len, RESULT_CLUSTER_EVENTS, |ctx, bytes| {
                ctx.cluster_events = Some(wire::decode_cluster_events(bytes));
                Ok(())
            })
        },
    )?;

    linker.func_wrap(
        SCHEDULER_MODULE,
        RESULT_NODE_NAMES,
        |mut caller: Caller<'_, GuestState>, ptr: u32, len: u32| -> wasmtime::Result<()> {
            record_from_guest(&mut caller, ptr, len, RESULT_NODE_NAMES, |ctx, bytes| {
                ctx.node_names = Some(wire::decode_string_list(bytes));
                Ok(())
            })
        },
    )?;

    linker.func_wrap(
        SCHEDULER_MODULE,
        RESULT_NOMINATED_NODE_NAME,
        |mut caller: Caller<'_, GuestState>, ptr: u32, len: u32| -> wasmtime::Result<()> {
            record_from_guest(&mut caller, ptr, len, RESULT_NOMINATED_NODE_NAME, |ctx, bytes| {
                ctx.nominated_node_name = Some(String::from_utf8_lossy(bytes).into_owned());
                Ok(())
            })
        },
    )?;

    linker.func_wrap(
        SCHEDULER_MODULE,
        RESULT_NODE_SCORE_LIST,
        |mut caller: Caller<'_, GuestState>, ptr: u32, len: u32| -> wasmtime::Result<()> {
            record_from_guest(&mut caller, ptr, len, RESULT_NODE_SCORE_LIST, |ctx, bytes| {
                let scores: Vec<NodeScore> = serde_json::from_slice(bytes)?;
                ctx.normalized_scores = Some(scores);
                Ok(())
            })
        },
    )?;

    Ok(())
}

/// The record's severity if it clears the configured threshold.
fn enabled(state: &GuestState, severity: i32) -> Option<LogSeverity> {
    // Severities above Error are clamped rather than dropped.
    let severity = LogSeverity::from_i32(severity.clamp(0, 3))?;
    (severity >= state.settings().log_severity).then_some(severity)
}

/// Render alternating key/value entries as `k1=v1 k2=v2`. A trailing key
/// without a value is rendered as `k=`.
fn format_key_values(entries: &[String]) -> String {
    entries
        .chunks(2)
        .map(|pair| {
            let value = pair.get(1).map(String::as_str).unwrap_or_default();
            format!("{}={}", pair[0], value)
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn emit(module: &str, severity: LogSeverity, msg: &Cow<'_, str>, kv: &str) {
    match severity {
        LogSeverity::Debug => tracing::debug!(target: "kubewasm::guest", module, kv, "{msg}"),
        LogSeverity::Info => tracing::info!(target: "kubewasm::guest", module, kv, "{msg}"),
        LogSeverity::Warn => tracing::warn!(target: "kubewasm::guest", module, kv, "{msg}"),
        LogSeverity::Error => tracing::error!(target: "kubewasm::guest", module, kv, "{msg}"),
    }
}

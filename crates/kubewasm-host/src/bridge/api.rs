//! `k8s.io/api`: data access for the in-flight call.
//!
//! Every function here has the shape `(ptr: i32, limit: i32) -> i32` and
//! implements ask-then-write: it returns the byte length of the value and
//! writes it to `ptr` only if that length fits in `limit`. A stage that
//! never asks for the pod never pays for serializing it.

use wasmtime::{Caller, Linker};

use kubewasm_core::wire;

use super::{API_MODULE, guest_memory};
use crate::state::GuestState;

pub const POD: &str = "pod";
pub const NODE: &str = "node";
pub const NODE_NAME: &str = "nodeName";
pub const NODE_SCORE_LIST: &str = "nodeScoreList";

pub fn add_to_linker(linker: &mut Linker<GuestState>) -> wasmtime::Result<()> {
    linker.func_wrap(
        API_MODULE,
        POD,
        |mut caller: Caller<'_, GuestState>, ptr: u32, limit: u32| -> wasmtime::Result<u32> {
            let memory = guest_memory(&mut caller)?;
            let (mem, state) = memory.data_and_store_mut(&mut caller);
            let value = state.pod_bytes()?;
            Ok(wire::write_if_fits(mem, ptr, limit, value)?)
        },
    )?;

    linker.func_wrap(
        API_MODULE,
        NODE,
        |mut caller: Caller<'_, GuestState>, ptr: u32, limit: u32| -> wasmtime::Result<u32> {
            let memory = guest_memory(&mut caller)?;
            let (mem, state) = memory.data_and_store_mut(&mut caller);
            let value = state.node_bytes()?;
            Ok(wire::write_if_fits(mem, ptr, limit, value)?)
        },
    )?;

    linker.func_wrap(
        API_MODULE,
        NODE_NAME,
        |mut caller: Caller<'_, GuestState>, ptr: u32, limit: u32| -> wasmtime::Result<u32> {
            let memory = guest_memory(&mut caller)?;
            let (mem, state) = memory.data_and_store_mut(&mut caller);
            Ok(wire::write_if_fits(mem, ptr, limit, state.node_name_bytes())?)
        },
    )?;

    linker.func_wrap(
        API_MODULE,
        NODE_SCORE_LIST,
        |mut caller: Caller<'_, GuestState>, ptr: u32, limit: u32| -> wasmtime::Result<u32> {
            let memory = guest_memory(&mut caller)?;
            let (mem, state) = memory.data_and_store_mut(&mut caller);
            let value = state.node_scores_bytes()?;
            Ok(wire::write_if_fits(mem, ptr, limit, value)?)
        },
    )?;

    Ok(())
}

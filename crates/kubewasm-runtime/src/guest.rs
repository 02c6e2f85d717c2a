//! One live instance of a guest module, and the stage invoker.
//!
//! Each stage method builds a [`CallContext`], installs it in the store,
//! calls the export, takes the context back, and decodes the return word
//! together with whatever the guest recorded through the bridge. Output the
//! guest wrote to stdout/stderr is drained after every call, whether or not
//! the call succeeded.

use std::sync::Arc;
use std::time::Duration;

use wasmtime::{Instance, Store, TypedFunc};

use kubewasm_core::status::{self, NominatingMode};
use kubewasm_core::{ClusterEvent, CycleId, NodeInfo, NodeScore, Pod, Status};
use kubewasm_host::bridge::WasmTy;
use kubewasm_host::module::INITIALIZE_EXPORT;
use kubewasm_host::{CallContext, CompiledModule, GuestSettings, GuestState, Stage};

use crate::error::GuestCallError;

/// Typed handles to the stage exports, grouped by return shape.
#[derive(Default)]
struct StageFuncs {
    unit: Vec<(Stage, TypedFunc<(), ()>)>,
    status: Vec<(Stage, TypedFunc<(), i32>)>,
    packed: Vec<(Stage, TypedFunc<(), i64>)>,
}

fn lookup<R>(funcs: &[(Stage, TypedFunc<(), R>)], stage: Stage) -> Result<TypedFunc<(), R>, GuestCallError> {
    funcs
        .iter()
        .find(|(s, _)| *s == stage)
        .map(|(_, f)| f.clone())
        .ok_or(GuestCallError::NotExported(stage))
}

/// Result of a PostFilter call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostFilterOutcome {
    pub nominating_mode: NominatingMode,
    pub nominated_node_name: Option<String>,
    pub status: Status,
}

pub struct Guest {
    id: u64,
    module_name: Arc<str>,
    store: Store<GuestState>,
    _instance: Instance,
    funcs: StageFuncs,
}

impl Guest {
    /// Instantiate `module` with a fresh store, running `_initialize` if
    /// the module exports it.
    pub fn new(module: &CompiledModule, settings: GuestSettings, id: u64) -> anyhow::Result<Self> {
        let module_name = Arc::clone(&settings.module_name);
        let mut store = Store::new(module.engine(), GuestState::new(settings));
        store.limiter(|state| state.limiter_mut());

        let instance = module
            .instance_pre()
            .instantiate(&mut store)
            .map_err(|e| anyhow::anyhow!("instantiating {}: {e:#}", module.name()))?;

        if module.has_initialize() {
            let init = instance.get_typed_func::<(), ()>(&mut store, INITIALIZE_EXPORT)?;
            init.call(&mut store, ())
                .map_err(|e| anyhow::anyhow!("{} {INITIALIZE_EXPORT} failed: {e:#}", module.name()))?;
            store.data_mut().take_diagnostics();
        }

        let mut funcs = StageFuncs::default();
        for stage in module.exports().iter() {
            let name = stage.export_name();
            match stage.signature().results {
                [] => funcs.unit.push((stage, instance.get_typed_func(&mut store, name)?)),
                [WasmTy::I32] => {
                    funcs.status.push((stage, instance.get_typed_func(&mut store, name)?))
                }
                _ => funcs.packed.push((stage, instance.get_typed_func(&mut store, name)?)),
            }
        }

        tracing::info!(module = %module_name, guest = id, "guest instance created");
        Ok(Self {
            id,
            module_name,
            store,
            _instance: instance,
            funcs,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Run one export with `ctx` installed, then drain diagnostics.
    fn invoke<R>(
        &mut self,
        stage: Stage,
        ctx: CallContext,
        call: impl FnOnce(&mut Store<GuestState>) -> wasmtime::Result<R>,
    ) -> Result<(R, CallContext), GuestCallError> {
        self.store.data_mut().begin_call(ctx);
        let result = call(&mut self.store);
        let state = self.store.data_mut();
        let ctx = state.end_call();
        let diagnostics = state.take_diagnostics();
        let memory = state.limiter().memory_used();

        match result {
            Ok(value) => {
                if !diagnostics.is_empty() {
                    tracing::debug!(
                        module = %self.module_name,
                        guest = self.id,
                        %stage,
                        output = %diagnostics.trim_end(),
                        "guest wrote diagnostics"
                    );
                }
                Ok((value, ctx))
            }
            Err(err) => {
                let err = GuestCallError::from_wasmtime(stage, err, diagnostics);
                tracing::warn!(module = %self.module_name, guest = self.id, memory, error = %err, "guest call failed");
                Err(err)
            }
        }
    }

    fn call_unit(&mut self, stage: Stage, ctx: CallContext) -> Result<CallContext, GuestCallError> {
        let func = lookup(&self.funcs.unit, stage)?;
        let ((), ctx) = self.invoke(stage, ctx, |store| func.call(store, ()))?;
        Ok(ctx)
    }

    fn call_status(&mut self, stage: Stage, ctx: CallContext) -> Result<(Status, CallContext), GuestCallError> {
        let func = lookup(&self.funcs.status, stage)?;
        let (code, mut ctx) = self.invoke(stage, ctx, |store| func.call(store, ()))?;
        Ok((Status::from_guest(code, ctx.reason.take()), ctx))
    }

    fn call_packed(&mut self, stage: Stage, ctx: CallContext) -> Result<(i64, CallContext), GuestCallError> {
        let func = lookup(&self.funcs.packed, stage)?;
        self.invoke(stage, ctx, |store| func.call(store, ()))
    }

    // ── Stages ─────────────────────────────────────────────────────

    /// Events this guest wants to be requeued on; `None` if it reported none.
    pub fn enqueue(&mut self) -> Result<Option<Vec<ClusterEvent>>, GuestCallError> {
        let ctx = self.call_unit(Stage::Enqueue, CallContext::empty())?;
        Ok(ctx.cluster_events)
    }

    /// PreFilter starts a scheduling cycle, so it drops any cached state
    /// before the guest runs.
    pub fn pre_filter(
        &mut self,
        cycle: CycleId,
        pod: &Arc<Pod>,
    ) -> Result<(Option<Vec<String>>, Status), GuestCallError> {
        let func = lookup(&self.funcs.status, Stage::PreFilter)?;
        let ctx = CallContext::for_pod(cycle, pod);
        let (code, mut ctx) = self.invoke(Stage::PreFilter, ctx, |store| {
            store.data_mut().reset_cycle();
            func.call(store, ())
        })?;
        let status = Status::from_guest(code, ctx.reason.take());
        Ok((ctx.node_names, status))
    }

    pub fn filter(
        &mut self,
        cycle: CycleId,
        pod: &Arc<Pod>,
        node: &Arc<NodeInfo>,
    ) -> Result<Status, GuestCallError> {
        let ctx = CallContext::for_pod(cycle, pod).with_node(node);
        Ok(self.call_status(Stage::Filter, ctx)?.0)
    }

    pub fn post_filter(&mut self, cycle: CycleId, pod: &Arc<Pod>) -> Result<PostFilterOutcome, GuestCallError> {
        let (word, mut ctx) = self.call_packed(Stage::PostFilter, CallContext::for_pod(cycle, pod))?;
        let (nominating_mode, code) = status::unpack_post_filter(word);
        Ok(PostFilterOutcome {
            nominating_mode,
            nominated_node_name: ctx.nominated_node_name.take(),
            status: Status::from_guest(code, ctx.reason.take()),
        })
    }

    pub fn pre_score(&mut self, cycle: CycleId, pod: &Arc<Pod>) -> Result<Status, GuestCallError> {
        Ok(self.call_status(Stage::PreScore, CallContext::for_pod(cycle, pod))?.0)
    }

    pub fn score(
        &mut self,
        cycle: CycleId,
        pod: &Arc<Pod>,
        node: &Arc<NodeInfo>,
    ) -> Result<(i64, Status), GuestCallError> {
        let ctx = CallContext::for_pod(cycle, pod).with_node(node);
        let (word, mut ctx) = self.call_packed(Stage::Score, ctx)?;
        let (score, code) = status::unpack_score(word);
        Ok((i64::from(score), Status::from_guest(code, ctx.reason.take())))
    }

    /// NormalizeScore; returns the rewritten list if the guest reported one.
    pub fn normalize_score(
        &mut self,
        cycle: CycleId,
        pod: &Arc<Pod>,
        scores: Vec<NodeScore>,
    ) -> Result<(Option<Vec<NodeScore>>, Status), GuestCallError> {
        let ctx = CallContext::for_pod(cycle, pod).with_node_scores(scores);
        let (status, ctx) = self.call_status(Stage::NormalizeScore, ctx)?;
        Ok((ctx.normalized_scores, status))
    }

    pub fn reserve(&mut self, cycle: CycleId, pod: &Arc<Pod>, node_name: &str) -> Result<Status, GuestCallError> {
        let ctx = CallContext::for_pod(cycle, pod).with_node_name(node_name);
        Ok(self.call_status(Stage::Reserve, ctx)?.0)
    }

    pub fn unreserve(&mut self, cycle: CycleId, pod: &Arc<Pod>, node_name: &str) -> Result<(), GuestCallError> {
        let ctx = CallContext::for_pod(cycle, pod).with_node_name(node_name);
        self.call_unit(Stage::Unreserve, ctx).map(drop)
    }

    pub fn permit(
        &mut self,
        cycle: CycleId,
        pod: &Arc<Pod>,
        node_name: &str,
    ) -> Result<(Status, Duration), GuestCallError> {
        let ctx = CallContext::for_pod(cycle, pod).with_node_name(node_name);
        let (word, mut ctx) = self.call_packed(Stage::Permit, ctx)?;
        let (code, timeout) = status::unpack_permit(word);
        Ok((Status::from_guest(code, ctx.reason.take()), timeout))
    }

    pub fn pre_bind(&mut self, cycle: CycleId, pod: &Arc<Pod>, node_name: &str) -> Result<Status, GuestCallError> {
        let ctx = CallContext::for_pod(cycle, pod).with_node_name(node_name);
        Ok(self.call_status(Stage::PreBind, ctx)?.0)
    }

    pub fn bind(&mut self, cycle: CycleId, pod: &Arc<Pod>, node_name: &str) -> Result<Status, GuestCallError> {
        let ctx = CallContext::for_pod(cycle, pod).with_node_name(node_name);
        Ok(self.call_status(Stage::Bind, ctx)?.0)
    }

    pub fn post_bind(&mut self, cycle: CycleId, pod: &Arc<Pod>, node_name: &str) -> Result<(), GuestCallError> {
        let ctx = CallContext::for_pod(cycle, pod).with_node_name(node_name);
        self.call_unit(Stage::PostBind, ctx).map(drop)
    }
}

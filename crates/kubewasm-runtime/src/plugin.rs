//! A guest module exposed as a scheduler plugin.
//!
//! Scheduling-phase stages (PreFilter through Permit) run on the pool's
//! scheduled guest; binding-phase stages (Unreserve, PreBind, Bind,
//! PostBind) run on the guest held for the pod's binding cycle.
//!
//! A guest failure never escapes as a panic. It becomes an `Error` status
//! carrying the trap message and whatever the guest printed.

use std::sync::Arc;
use std::time::Duration;

use kubewasm_core::framework::{PostFilterResult, PreFilterResult};
use kubewasm_core::{
    ClusterEvent, Code, CycleState, ModuleSource, NodeInfo, NodeScore, PluginConfig, Pod, Status,
};
use kubewasm_host::{CompiledModule, ExportSet, GuestSettings, SchedEngine, Stage};

use crate::error::{GuestCallError, PluginError};
use crate::fetch;
use crate::guest::Guest;
use crate::pool::{Claim, GuestFactory, GuestPool, Retention};
use crate::resolver::{self, Interfaces};

struct InstanceFactory {
    module: CompiledModule,
    settings: GuestSettings,
}

impl GuestFactory for InstanceFactory {
    type Guest = Guest;

    fn create(&self, id: u64) -> anyhow::Result<Guest> {
        Guest::new(&self.module, self.settings.clone(), id)
    }
}

pub struct WasmPlugin {
    name: String,
    digest: String,
    exports: ExportSet,
    events: Vec<ClusterEvent>,
    pool: GuestPool<InstanceFactory>,
}

impl WasmPlugin {
    /// Load the guest named by `config.guest_url`, prepare it, and resolve
    /// the interfaces it supports.
    pub async fn load(name: &str, config: &PluginConfig) -> Result<Interfaces, PluginError> {
        let source = ModuleSource::parse(&config.guest_url)?;
        let bytes = fetch::load(&source, config.fetch_timeout()).await?;
        Self::from_bytes(name, &bytes, config)
    }

    /// Like [`WasmPlugin::load`], from the plugin args object of a
    /// scheduler profile.
    pub async fn load_from_args(name: &str, args: serde_json::Value) -> Result<Interfaces, PluginError> {
        let config = PluginConfig::from_json_value(args)?;
        Self::load(name, &config).await
    }

    /// Like [`WasmPlugin::load`], for module bytes already in memory.
    pub fn from_bytes(name: &str, bytes: &[u8], config: &PluginConfig) -> Result<Interfaces, PluginError> {
        let engine = SchedEngine::new().map_err(|e| PluginError::Engine(format!("{e:#}")))?;
        Self::with_engine(&engine, name, bytes, config)
    }

    /// Like [`WasmPlugin::from_bytes`], sharing an existing engine.
    pub fn with_engine(
        engine: &SchedEngine,
        name: &str,
        bytes: &[u8],
        config: &PluginConfig,
    ) -> Result<Interfaces, PluginError> {
        let module = kubewasm_host::prepare(engine, name, bytes)?;
        let groups = resolver::classify(module.exports())?;
        let plugin = Self::new(name, module, config)?;
        Ok(Interfaces::new(groups, Arc::new(plugin)))
    }

    /// Build the plugin and instantiate its first guest, so instantiation
    /// problems surface now rather than in the first scheduling cycle.
    fn new(name: &str, module: CompiledModule, config: &PluginConfig) -> Result<Self, PluginError> {
        let instantiate_err = |e: anyhow::Error| PluginError::Instantiate {
            module: name.to_string(),
            reason: format!("{e:#}"),
        };

        let digest = module.digest().to_string();
        let exports = module.exports();
        let factory = InstanceFactory {
            settings: GuestSettings::from_config(name, config),
            module,
        };
        let pool = GuestPool::new(factory);
        pool.prewarm().map_err(instantiate_err)?;

        let events = if exports.contains(Stage::Enqueue) {
            pool.with_free(Guest::enqueue)
                .map_err(instantiate_err)??
                .unwrap_or_default()
        } else {
            vec![ClusterEvent::WILDCARD]
        };

        tracing::info!(plugin = name, digest = %&digest[..12], ?exports, "wasm plugin ready");
        Ok(Self {
            name: name.to_string(),
            digest,
            exports,
            events,
            pool,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// SHA-256 of the guest module, hex encoded.
    pub fn digest(&self) -> &str {
        &self.digest
    }

    pub fn exports(&self) -> ExportSet {
        self.exports
    }

    pub fn events_to_register(&self) -> Vec<ClusterEvent> {
        self.events.clone()
    }

    pub fn pool_stats(&self) -> PoolStats {
        PoolStats {
            free: self.pool.free_count(),
            binding: self.pool.binding_count(),
            scheduled: self.pool.scheduled_guest(),
            created: self.pool.total_created(),
        }
    }

    /// How the scheduled guest is kept for the pod's binding cycle once
    /// Reserve has run. With both Reserve and Bind exported the pod always
    /// reaches Unreserve or PostBind, either of which releases the guest.
    fn reserve_retention(&self) -> Retention {
        if self.exports.contains(Stage::Bind) {
            Retention::Firm
        } else {
            Retention::Tentative
        }
    }

    /// A guest exporting Bind without Reserve gets no Reserve call to
    /// retain at, so every scheduling call retains tentatively.
    fn retains_while_scheduling(&self) -> bool {
        self.exports.contains(Stage::Bind) && !self.exports.contains(Stage::Reserve)
    }

    fn on_scheduling_guest<R>(
        &self,
        state: &CycleState,
        pod: &Arc<Pod>,
        call: impl FnOnce(&mut Guest) -> Result<R, GuestCallError>,
    ) -> Result<R, Status> {
        let pooled = self
            .pool
            .acquire_for_scheduling(state.cycle(), pod.uid())
            .map_err(|e| {
                tracing::error!(plugin = %self.name, error = %format!("{e:#}"), "guest instantiation failed");
                Status::error(format!("failed to instantiate guest: {e:#}"))
            })?;
        if self.retains_while_scheduling() {
            self.pool.retain(state.cycle(), Retention::Tentative);
        }
        let mut guest = pooled.lock();
        call(&mut guest).map_err(GuestCallError::into_status)
    }

    /// The pod's binding guest: the one that scheduled it.
    ///
    /// A pod none of this plugin's scheduling stages saw (a Bind-only
    /// guest, or a cycle where the framework skipped them) binds on a
    /// detached guest. A pod whose scheduling guest was reclaimed fails
    /// with an `Error` status: its guest-side state is gone.
    fn on_binding_guest<R>(
        &self,
        pod: &Arc<Pod>,
        call: impl FnOnce(&mut Guest) -> Result<R, GuestCallError>,
    ) -> Result<R, Status> {
        let pooled = match self.pool.claim_for_binding(pod.uid()) {
            Claim::Held(pooled) => pooled,
            Claim::Reclaimed => {
                tracing::error!(plugin = %self.name, pod = %pod.uid(), "scheduling guest was reclaimed before the binding cycle");
                return Err(Status::error(format!(
                    "guest that scheduled pod {} was reclaimed before its binding cycle",
                    pod.uid()
                )));
            }
            Claim::Unscheduled => {
                tracing::debug!(plugin = %self.name, pod = %pod.uid(), "pod was not scheduled by this plugin; binding on a detached guest");
                self.pool.acquire_detached(pod.uid()).map_err(|e| {
                    tracing::error!(plugin = %self.name, error = %format!("{e:#}"), "guest instantiation failed");
                    Status::error(format!("failed to instantiate guest: {e:#}"))
                })?
            }
        };
        let mut guest = pooled.lock();
        call(&mut guest).map_err(GuestCallError::into_status)
    }

    // ── Scheduling cycle ──────────────────────────────────────────

    pub fn pre_filter(&self, state: &CycleState, pod: &Arc<Pod>) -> (PreFilterResult, Status) {
        if !self.exports.contains(Stage::PreFilter) {
            return (PreFilterResult::all_nodes(), Status::success());
        }
        match self.on_scheduling_guest(state, pod, |g| g.pre_filter(state.cycle(), pod)) {
            Ok((names, status)) => {
                let result = PreFilterResult {
                    node_names: names.map(|names| names.into_iter().collect()),
                };
                (result, status)
            }
            Err(status) => (PreFilterResult::all_nodes(), status),
        }
    }

    pub fn filter(&self, state: &CycleState, pod: &Arc<Pod>, node: &Arc<NodeInfo>) -> Status {
        if !self.exports.contains(Stage::Filter) {
            return Status::success();
        }
        self.on_scheduling_guest(state, pod, |g| g.filter(state.cycle(), pod, node))
            .unwrap_or_else(|status| status)
    }

    pub fn post_filter(&self, state: &CycleState, pod: &Arc<Pod>) -> (PostFilterResult, Status) {
        if !self.exports.contains(Stage::PostFilter) {
            return (
                PostFilterResult::default(),
                Status::new(Code::Unschedulable, "no postfilter"),
            );
        }
        match self.on_scheduling_guest(state, pod, |g| g.post_filter(state.cycle(), pod)) {
            Ok(outcome) => {
                let result = PostFilterResult {
                    nominating_mode: outcome.nominating_mode,
                    nominated_node_name: outcome.nominated_node_name.unwrap_or_default(),
                };
                (result, outcome.status)
            }
            Err(status) => (PostFilterResult::default(), status),
        }
    }

    /// The guest reads what it needs through the bridge; the candidate
    /// node list is not passed across.
    pub fn pre_score(&self, state: &CycleState, pod: &Arc<Pod>, _nodes: &[Arc<NodeInfo>]) -> Status {
        if !self.exports.contains(Stage::PreScore) {
            return Status::success();
        }
        self.on_scheduling_guest(state, pod, |g| g.pre_score(state.cycle(), pod))
            .unwrap_or_else(|status| status)
    }

    pub fn score(&self, state: &CycleState, pod: &Arc<Pod>, node: &Arc<NodeInfo>) -> (i64, Status) {
        self.on_scheduling_guest(state, pod, |g| g.score(state.cycle(), pod, node))
            .unwrap_or_else(|status| (0, status))
    }

    pub fn normalize_score(&self, state: &CycleState, pod: &Arc<Pod>, scores: &mut Vec<NodeScore>) -> Status {
        if !self.exports.contains(Stage::NormalizeScore) {
            return Status::success();
        }
        let input = scores.clone();
        match self.on_scheduling_guest(state, pod, |g| g.normalize_score(state.cycle(), pod, input)) {
            Ok((normalized, status)) => {
                if let Some(normalized) = normalized {
                    *scores = normalized;
                }
                status
            }
            Err(status) => status,
        }
    }

    pub fn reserve(&self, state: &CycleState, pod: &Arc<Pod>, node_name: &str) -> Status {
        let status = self
            .on_scheduling_guest(state, pod, |g| g.reserve(state.cycle(), pod, node_name))
            .unwrap_or_else(|status| status);
        // A failed Reserve is followed by Unreserve, which releases the guest.
        self.pool.retain(state.cycle(), self.reserve_retention());
        status
    }

    pub fn permit(&self, state: &CycleState, pod: &Arc<Pod>, node_name: &str) -> (Status, Duration) {
        self.on_scheduling_guest(state, pod, |g| g.permit(state.cycle(), pod, node_name))
            .unwrap_or_else(|status| (status, Duration::ZERO))
    }

    // ── Binding cycle ─────────────────────────────────────────────

    /// Ends the pod's cycle: the guest goes back to the free list.
    pub fn unreserve(&self, state: &CycleState, pod: &Arc<Pod>, node_name: &str) {
        if self.exports.contains(Stage::Unreserve) {
            if let Err(status) = self.on_binding_guest(pod, |g| g.unreserve(state.cycle(), pod, node_name)) {
                tracing::warn!(plugin = %self.name, pod = %pod.uid(), %status, "unreserve failed");
            }
        }
        self.pool.release(pod.uid());
    }

    pub fn pre_bind(&self, state: &CycleState, pod: &Arc<Pod>, node_name: &str) -> Status {
        if !self.exports.contains(Stage::PreBind) {
            return Status::success();
        }
        let status = self
            .on_binding_guest(pod, |g| g.pre_bind(state.cycle(), pod, node_name))
            .unwrap_or_else(|status| status);
        self.release_on_failure(pod, &status);
        status
    }

    pub fn bind(&self, state: &CycleState, pod: &Arc<Pod>, node_name: &str) -> Status {
        let status = self
            .on_binding_guest(pod, |g| g.bind(state.cycle(), pod, node_name))
            .unwrap_or_else(|status| status);
        self.release_on_failure(pod, &status);
        status
    }

    /// Ends the pod's binding cycle.
    pub fn post_bind(&self, state: &CycleState, pod: &Arc<Pod>, node_name: &str) {
        if self.exports.contains(Stage::PostBind) {
            if let Err(status) = self.on_binding_guest(pod, |g| g.post_bind(state.cycle(), pod, node_name)) {
                tracing::warn!(plugin = %self.name, pod = %pod.uid(), %status, "postbind failed");
            }
        }
        self.pool.release(pod.uid());
    }

    /// A failed binding cycle is followed by Unreserve only when the guest
    /// exports Reserve; otherwise the guest is released here.
    fn release_on_failure(&self, pod: &Arc<Pod>, status: &Status) {
        let failed = !matches!(status.code(), Code::Success | Code::Skip);
        if failed && !self.exports.contains(Stage::Reserve) {
            self.pool.release(pod.uid());
        }
    }
}

/// Snapshot of the plugin's guest pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub free: usize,
    pub binding: usize,
    pub scheduled: Option<u64>,
    pub created: u64,
}

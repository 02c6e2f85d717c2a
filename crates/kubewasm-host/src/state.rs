//! The data owned by one guest's `Store`.
//!
//! Holds the in-flight [`CallContext`], the per-cycle pod cache, the
//! marshaling scratch buffer, the WASI context whose stdout/stderr are
//! captured as diagnostics, and the resource limiter.
//!
//! # Per-cycle cache
//!
//! The serialized pod is kept across calls while calls keep arriving for
//! the same `(cycle, pod uid)` key, so a filter fan-out over many nodes
//! serializes the pod once. A call for a different key, or an explicit
//! [`GuestState::reset_cycle`] at PreFilter, drops it.

use std::sync::Arc;

use wasmtime_wasi::WasiCtxBuilder;
use wasmtime_wasi::p1::WasiP1Ctx;
use wasmtime_wasi::p2::pipe::MemoryOutputPipe;

use kubewasm_core::{CycleId, LogSeverity};

use crate::context::CallContext;
use crate::limiter::{DEFAULT_TABLE_LIMIT, GuestLimiter};

/// Capacity of each captured diagnostic stream.
const DIAGNOSTIC_CAPACITY: usize = 64 * 1024;

/// Initial capacity of the marshaling scratch buffer.
const SCRATCH_CAPACITY: usize = 1024;

/// Per-instance settings derived from the plugin configuration.
#[derive(Debug, Clone)]
pub struct GuestSettings {
    /// Module name used in log records.
    pub module_name: Arc<str>,
    /// Threshold below which guest log records are dropped.
    pub log_severity: LogSeverity,
    /// Opaque configuration returned by `get_config`.
    pub guest_config: Option<Arc<str>>,
    /// Linear memory cap in bytes.
    pub memory_limit: usize,
}

impl GuestSettings {
    pub fn new(module_name: &str) -> Self {
        Self {
            module_name: Arc::from(module_name),
            log_severity: LogSeverity::default(),
            guest_config: None,
            memory_limit: kubewasm_core::config::DEFAULT_MEMORY_LIMIT,
        }
    }

    pub fn from_config(module_name: &str, config: &kubewasm_core::PluginConfig) -> Self {
        Self {
            module_name: Arc::from(module_name),
            log_severity: config.log_severity,
            guest_config: config.guest_config.as_deref().map(Arc::from),
            memory_limit: config.memory_limit(),
        }
    }
}

#[derive(Default)]
struct CycleCache {
    key: Option<(CycleId, String)>,
    pod: Option<Vec<u8>>,
}

impl CycleCache {
    fn matches(&self, cycle: CycleId, uid: &str) -> bool {
        matches!(&self.key, Some((c, u)) if *c == cycle && u == uid)
    }

    fn clear(&mut self) {
        self.key = None;
        self.pod = None;
    }
}

pub struct GuestState {
    settings: GuestSettings,
    call: Option<CallContext>,
    cache: CycleCache,
    scratch: Vec<u8>,
    wasi: WasiP1Ctx,
    stdout: MemoryOutputPipe,
    stderr: MemoryOutputPipe,
    limiter: GuestLimiter,
}

fn capture_streams() -> (WasiP1Ctx, MemoryOutputPipe, MemoryOutputPipe) {
    let stdout = MemoryOutputPipe::new(DIAGNOSTIC_CAPACITY);
    let stderr = MemoryOutputPipe::new(DIAGNOSTIC_CAPACITY);
    let wasi = WasiCtxBuilder::new()
        .stdout(stdout.clone())
        .stderr(stderr.clone())
        .build_p1();
    (wasi, stdout, stderr)
}

impl GuestState {
    pub fn new(settings: GuestSettings) -> Self {
        let (wasi, stdout, stderr) = capture_streams();
        let limiter = GuestLimiter::new(settings.memory_limit, DEFAULT_TABLE_LIMIT);
        Self {
            settings,
            call: None,
            cache: CycleCache::default(),
            scratch: Vec::with_capacity(SCRATCH_CAPACITY),
            wasi,
            stdout,
            stderr,
            limiter,
        }
    }

    pub fn settings(&self) -> &GuestSettings {
        &self.settings
    }

    pub fn wasi_mut(&mut self) -> &mut WasiP1Ctx {
        &mut self.wasi
    }

    pub fn limiter(&self) -> &GuestLimiter {
        &self.limiter
    }

    pub fn limiter_mut(&mut self) -> &mut GuestLimiter {
        &mut self.limiter
    }

    // ── Call scoping ──────────────────────────────────────────────

    /// Install the context for the call about to run.
    ///
    /// A context keyed to a different `(cycle, pod)` than the cached one
    /// invalidates the pod cache.
    pub fn begin_call(&mut self, ctx: CallContext) {
        if let Some((cycle, uid)) = ctx.cycle_key() {
            if !self.cache.matches(cycle, uid) {
                self.cache.clear();
                self.cache.key = Some((cycle, uid.to_string()));
            }
        }
        self.call = Some(ctx);
    }

    /// Take the context back after the call returned or trapped.
    pub fn end_call(&mut self) -> CallContext {
        self.scratch.clear();
        self.call.take().unwrap_or_default()
    }

    pub fn call(&self) -> Option<&CallContext> {
        self.call.as_ref()
    }

    pub fn call_mut(&mut self) -> Option<&mut CallContext> {
        self.call.as_mut()
    }

    /// Drop everything cached for the current cycle.
    pub fn reset_cycle(&mut self) {
        self.cache.clear();
        if let Some(key) = self.call.as_ref().and_then(CallContext::cycle_key) {
            self.cache.key = Some((key.0, key.1.to_string()));
        }
    }

    pub fn cached_cycle(&self) -> Option<CycleId> {
        self.cache.key.as_ref().map(|(cycle, _)| *cycle)
    }

    pub fn has_cached_pod(&self) -> bool {
        self.cache.pod.is_some()
    }

    // ── Lazily serialized inputs ─────────────────────────────────

    /// The current call's pod as JSON, serialized at most once per cycle.
    pub fn pod_bytes(&mut self) -> serde_json::Result<&[u8]> {
        let Some(call) = self.call.as_ref() else {
            return Ok(&[]);
        };
        let Some(pod) = call.pod.as_ref() else {
            return Ok(&[]);
        };
        let cacheable = call
            .cycle_key()
            .is_some_and(|(cycle, uid)| self.cache.matches(cycle, uid));
        if !cacheable {
            self.scratch.clear();
            serde_json::to_writer(&mut self.scratch, pod.as_ref())?;
            return Ok(&self.scratch);
        }
        if self.cache.pod.is_none() {
            self.cache.pod = Some(serde_json::to_vec(pod.as_ref())?);
        }
        Ok(self.cache.pod.as_deref().unwrap_or_default())
    }

    /// The current call's node as JSON, serialized into the scratch buffer.
    pub fn node_bytes(&mut self) -> serde_json::Result<&[u8]> {
        self.scratch.clear();
        if let Some(node) = self.call.as_ref().and_then(|c| c.node.as_ref()) {
            serde_json::to_writer(&mut self.scratch, node.node())?;
        }
        Ok(&self.scratch)
    }

    pub fn node_name_bytes(&self) -> &[u8] {
        self.call
            .as_ref()
            .and_then(|c| c.node_name.as_deref())
            .map(str::as_bytes)
            .unwrap_or_default()
    }

    /// The current call's score list as JSON, serialized into the scratch buffer.
    pub fn node_scores_bytes(&mut self) -> serde_json::Result<&[u8]> {
        self.scratch.clear();
        if let Some(scores) = self.call.as_ref().and_then(|c| c.node_scores.as_ref()) {
            serde_json::to_writer(&mut self.scratch, scores)?;
        }
        Ok(&self.scratch)
    }

    pub fn guest_config_bytes(&self) -> &[u8] {
        self.settings
            .guest_config
            .as_deref()
            .map(str::as_bytes)
            .unwrap_or_default()
    }

    // ── Diagnostics ──────────────────────────────────────────────

    /// Return what the guest wrote to stdout/stderr since the last call,
    /// and reset the streams so nothing bleeds into the next call.
    pub fn take_diagnostics(&mut self) -> String {
        let stdout = self.stdout.contents();
        let stderr = self.stderr.contents();
        if stdout.is_empty() && stderr.is_empty() {
            return String::new();
        }

        let mut output = String::from_utf8_lossy(&stdout).into_owned();
        output.push_str(&String::from_utf8_lossy(&stderr));

        let (wasi, stdout, stderr) = capture_streams();
        self.wasi = wasi;
        self.stdout = stdout;
        self.stderr = stderr;
        output
    }
}

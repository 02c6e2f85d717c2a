//! Module preparation.
//!
//! Turns raw guest bytes into a [`CompiledModule`]: compiled, validated
//! against the bridge and the stage export table, and pre-linked so new
//! instances only pay for instantiation.

use std::fmt;
use std::ops::BitOr;
use std::sync::Arc;

use sha2::{Digest, Sha256};
use wasmtime::{ExternType, InstancePre, Module};

use crate::bridge::{self, API_MODULE, SCHEDULER_MODULE, Signature, WASI_MODULE, WasmTy};
use crate::engine::SchedEngine;
use crate::error::{PrepareError, PrepareResult};
use crate::state::GuestState;

/// Export run once per instance before any stage, when present.
pub const INITIALIZE_EXPORT: &str = "_initialize";
pub const MEMORY_EXPORT: &str = "memory";

const UNIT: Signature = Signature::new(&[], &[]);
const STATUS: Signature = Signature::new(&[], &[WasmTy::I32]);
const PACKED: Signature = Signature::new(&[], &[WasmTy::I64]);

/// Scheduling stages a guest may export, by export name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Enqueue,
    PreFilter,
    Filter,
    PostFilter,
    PreScore,
    Score,
    NormalizeScore,
    Reserve,
    Unreserve,
    Permit,
    PreBind,
    Bind,
    PostBind,
}

impl Stage {
    pub const ALL: [Stage; 13] = [
        Stage::Enqueue,
        Stage::PreFilter,
        Stage::Filter,
        Stage::PostFilter,
        Stage::PreScore,
        Stage::Score,
        Stage::NormalizeScore,
        Stage::Reserve,
        Stage::Unreserve,
        Stage::Permit,
        Stage::PreBind,
        Stage::Bind,
        Stage::PostBind,
    ];

    pub fn export_name(self) -> &'static str {
        match self {
            Stage::Enqueue => "enqueue",
            Stage::PreFilter => "prefilter",
            Stage::Filter => "filter",
            Stage::PostFilter => "postfilter",
            Stage::PreScore => "prescore",
            Stage::Score => "score",
            Stage::NormalizeScore => "normalizescore",
            Stage::Reserve => "reserve",
            Stage::Unreserve => "unreserve",
            Stage::Permit => "permit",
            Stage::PreBind => "prebind",
            Stage::Bind => "bind",
            Stage::PostBind => "postbind",
        }
    }

    pub fn from_export_name(name: &str) -> Option<Stage> {
        Stage::ALL.into_iter().find(|s| s.export_name() == name)
    }

    /// The only signature accepted for this stage's export.
    pub fn signature(self) -> Signature {
        match self {
            Stage::Enqueue | Stage::Unreserve | Stage::PostBind => UNIT,
            Stage::PostFilter | Stage::Score | Stage::Permit => PACKED,
            _ => STATUS,
        }
    }

    fn bit(self) -> u16 {
        1 << self as u16
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.export_name())
    }
}

/// Host namespaces a module imports from.
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct ImportSet(u8);

impl ImportSet {
    pub const API: ImportSet = ImportSet(1);
    pub const SCHEDULER: ImportSet = ImportSet(1 << 1);
    pub const WASI: ImportSet = ImportSet(1 << 2);

    pub fn contains(self, other: ImportSet) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: ImportSet) {
        self.0 |= other.0;
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for ImportSet {
    type Output = ImportSet;

    fn bitor(self, rhs: ImportSet) -> ImportSet {
        ImportSet(self.0 | rhs.0)
    }
}

impl fmt::Debug for ImportSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = [
            (ImportSet::API, API_MODULE),
            (ImportSet::SCHEDULER, SCHEDULER_MODULE),
            (ImportSet::WASI, WASI_MODULE),
        ]
        .into_iter()
        .filter(|(set, _)| self.contains(*set))
        .map(|(_, name)| name)
        .collect();
        f.debug_set().entries(names).finish()
    }
}

/// Stages a module exports.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct ExportSet(u16);

impl ExportSet {
    pub fn contains(self, stage: Stage) -> bool {
        self.0 & stage.bit() != 0
    }

    pub fn insert(&mut self, stage: Stage) {
        self.0 |= stage.bit();
    }

    pub fn iter(self) -> impl Iterator<Item = Stage> {
        Stage::ALL.into_iter().filter(move |s| self.contains(*s))
    }
}

impl FromIterator<Stage> for ExportSet {
    fn from_iter<I: IntoIterator<Item = Stage>>(iter: I) -> Self {
        let mut set = ExportSet::default();
        for stage in iter {
            set.insert(stage);
        }
        set
    }
}

impl fmt::Debug for ExportSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter().map(Stage::export_name)).finish()
    }
}

/// A validated, pre-linked guest module. Cheap to clone.
#[derive(Clone)]
pub struct CompiledModule {
    name: Arc<str>,
    digest: Arc<str>,
    imports: ImportSet,
    exports: ExportSet,
    has_initialize: bool,
    pre: InstancePre<GuestState>,
}

impl CompiledModule {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Lowercase hex SHA-256 of the module bytes.
    pub fn digest(&self) -> &str {
        &self.digest
    }

    pub fn imports(&self) -> ImportSet {
        self.imports
    }

    pub fn exports(&self) -> ExportSet {
        self.exports
    }

    pub fn has_initialize(&self) -> bool {
        self.has_initialize
    }

    pub fn instance_pre(&self) -> &InstancePre<GuestState> {
        &self.pre
    }

    pub fn engine(&self) -> &wasmtime::Engine {
        self.pre.module().engine()
    }
}

impl fmt::Debug for CompiledModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledModule")
            .field("name", &self.name)
            .field("digest", &self.digest)
            .field("imports", &self.imports)
            .field("exports", &self.exports)
            .finish_non_exhaustive()
    }
}

/// Compile, validate, and pre-link a guest module.
pub fn prepare(engine: &SchedEngine, name: &str, bytes: &[u8]) -> PrepareResult<CompiledModule> {
    let digest = hex::encode(Sha256::digest(bytes));

    let module =
        Module::new(engine.engine(), bytes).map_err(|e| PrepareError::Compile(format!("{e:#}")))?;

    let imports = check_imports(&module)?;
    let (exports, has_initialize) = check_exports(&module)?;

    let bridged = imports.contains(ImportSet::API) || imports.contains(ImportSet::SCHEDULER);
    let has_memory = module
        .exports()
        .any(|e| e.name() == MEMORY_EXPORT && matches!(e.ty(), ExternType::Memory(_)));
    if bridged && !has_memory {
        return Err(PrepareError::MissingMemory);
    }

    let linker = engine
        .linker_for(imports)
        .map_err(|e| PrepareError::Link(format!("{e:#}")))?;
    let pre = linker
        .instantiate_pre(&module)
        .map_err(|e| PrepareError::Link(format!("{e:#}")))?;

    tracing::info!(
        module = name,
        digest = &digest[..12],
        ?imports,
        ?exports,
        "guest module prepared"
    );

    Ok(CompiledModule {
        name: Arc::from(name),
        digest: Arc::from(digest),
        imports,
        exports,
        has_initialize,
        pre,
    })
}

fn check_imports(module: &Module) -> PrepareResult<ImportSet> {
    let mut imports = ImportSet::default();

    for import in module.imports() {
        let (namespace, name) = (import.module(), import.name());
        let set = match namespace {
            API_MODULE => ImportSet::API,
            SCHEDULER_MODULE => ImportSet::SCHEDULER,
            // Resolved by the WASI linker; unknown names fail at link time.
            WASI_MODULE => {
                imports.insert(ImportSet::WASI);
                continue;
            }
            _ => {
                return Err(PrepareError::UnknownNamespace {
                    module: namespace.to_string(),
                    name: name.to_string(),
                });
            }
        };

        let Some(expected) = bridge::host_function(namespace, name) else {
            return Err(PrepareError::UnknownHostFunction {
                module: namespace.to_string(),
                name: name.to_string(),
            });
        };
        let ExternType::Func(actual) = import.ty() else {
            return Err(PrepareError::NonFunctionImport {
                module: namespace.to_string(),
                name: name.to_string(),
            });
        };
        if !expected.matches(&actual) {
            return Err(PrepareError::ImportSignature {
                module: namespace.to_string(),
                name: name.to_string(),
                expected: expected.to_string(),
                actual: Signature::describe(&actual),
            });
        }
        imports.insert(set);
    }

    Ok(imports)
}

fn check_exports(module: &Module) -> PrepareResult<(ExportSet, bool)> {
    let mut exports = ExportSet::default();
    let mut has_initialize = false;

    for export in module.exports() {
        if export.name() == INITIALIZE_EXPORT {
            check_export_signature(INITIALIZE_EXPORT, UNIT, export.ty())?;
            has_initialize = true;
            continue;
        }
        let Some(stage) = Stage::from_export_name(export.name()) else {
            continue;
        };
        check_export_signature(stage.export_name(), stage.signature(), export.ty())?;
        exports.insert(stage);
    }

    Ok((exports, has_initialize))
}

fn check_export_signature(name: &str, expected: Signature, ty: ExternType) -> PrepareResult<()> {
    match ty {
        ExternType::Func(actual) if expected.matches(&actual) => Ok(()),
        ExternType::Func(actual) => Err(PrepareError::ExportSignature {
            name: name.to_string(),
            expected: expected.to_string(),
            actual: Signature::describe(&actual),
        }),
        _ => Err(PrepareError::ExportSignature {
            name: name.to_string(),
            expected: expected.to_string(),
            actual: "non-function".to_string(),
        }),
    }
}

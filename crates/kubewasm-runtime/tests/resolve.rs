//! Every export combination resolves to the matching trait set.

mod common;

use kubewasm_core::{Code, CycleState};
use kubewasm_host::SchedEngine;
use kubewasm_runtime::{AsStages, Interfaces, WasmPlugin};

use common::{config, init_tracing, node, pod};

/// (group name, exports with their signatures)
const GROUPS: [(&str, &[(&str, &str)]); 5] = [
    ("Filter", &[("prefilter", "(result i32) (i32.const 0)"), ("filter", "(result i32) (i32.const 0)"), ("postfilter", "(result i64) (i64.const 0)")]),
    ("Score", &[("prescore", "(result i32) (i32.const 0)"), ("score", "(result i64) (i64.const 0)"), ("normalizescore", "(result i32) (i32.const 0)")]),
    ("Reserve", &[("reserve", "(result i32) (i32.const 0)"), ("unreserve", "")]),
    ("Permit", &[("permit", "(result i64) (i64.const 0)")]),
    ("Bind", &[("prebind", "(result i32) (i32.const 0)"), ("bind", "(result i32) (i32.const 0)"), ("postbind", "")]),
];

fn guest_for_mask(mask: u8) -> (String, String) {
    let mut kind = String::new();
    let mut funcs = String::new();
    for (bit, (name, exports)) in GROUPS.iter().enumerate() {
        if mask & (1 << bit) == 0 {
            continue;
        }
        kind.push_str(name);
        for (export, body) in exports.iter() {
            funcs.push_str(&format!("(func (export \"{export}\") {body})\n"));
        }
    }
    (kind, format!("(module (memory (export \"memory\") 1) {funcs})"))
}

fn load(engine: &SchedEngine, wat: &str) -> Interfaces {
    let bytes = wat::parse_str(wat).unwrap();
    WasmPlugin::with_engine(engine, "masked", &bytes, &config())
        .unwrap_or_else(|e| panic!("{e}\n{wat}"))
}

fn assert_accessors(stages: &dyn AsStages, mask: u8) {
    let has = |bit: u8| mask & (1 << bit) != 0;
    assert_eq!(stages.as_pre_filter().is_some(), has(0));
    assert_eq!(stages.as_filter().is_some(), has(0));
    assert_eq!(stages.as_post_filter().is_some(), has(0));
    assert_eq!(stages.as_pre_score().is_some(), has(1));
    assert_eq!(stages.as_score().is_some(), has(1));
    assert_eq!(stages.as_reserve().is_some(), has(2));
    assert_eq!(stages.as_permit().is_some(), has(3));
    assert_eq!(stages.as_pre_bind().is_some(), has(4));
    assert_eq!(stages.as_bind().is_some(), has(4));
    assert_eq!(stages.as_post_bind().is_some(), has(4));
}

#[test]
fn all_group_combinations_resolve() {
    init_tracing();
    let engine = SchedEngine::new().unwrap();

    for mask in 1u8..32 {
        let (kind, wat) = guest_for_mask(mask);
        let interfaces = load(&engine, &wat);
        assert_eq!(interfaces.kind(), kind, "mask {mask:#07b}");
        assert_eq!(interfaces.plugin().name(), "masked");
        assert_accessors(interfaces.stages(), mask);
    }
}

#[test]
fn anchors_alone_resolve_like_full_groups() {
    let engine = SchedEngine::new().unwrap();
    let interfaces = load(
        &engine,
        r#"(module
            (memory (export "memory") 1)
            (func (export "score") (result i64) (i64.const 0))
            (func (export "bind") (result i32) (i32.const 0)))"#,
    );
    assert_eq!(interfaces.kind(), "ScoreBind");
    // Companion accessors exist; their calls fall back to defaults.
    let state = CycleState::new(1);
    let pod = pod("web", "uid-1", "n");
    let stages = interfaces.stages();
    assert!(stages.as_pre_score().unwrap().pre_score(&state, &pod, &[]).is_success());
    assert!(stages.as_pre_bind().unwrap().pre_bind(&state, &pod, "n").is_success());
}

#[test]
fn prefilter_only_guest_admits_every_node() {
    init_tracing();
    let engine = SchedEngine::new().unwrap();
    let interfaces = load(
        &engine,
        r#"(module
            (memory (export "memory") 1)
            (func (export "enqueue"))
            (func (export "prefilter") (result i32) (i32.const 3)))"#,
    );
    assert_eq!(interfaces.kind(), "PreFilterOnly");

    let stages = interfaces.stages();
    assert!(stages.as_score().is_none());
    assert!(stages.as_post_filter().is_none());
    assert!(stages.as_bind().is_none());

    let state = CycleState::new(1);
    let pod = pod("web", "uid-1", "n");
    let (_, status) = stages.as_pre_filter().unwrap().pre_filter(&state, &pod);
    assert_eq!(status.code(), Code::UnschedulableAndUnresolvable);
    assert!(stages.as_filter().unwrap().filter(&state, &pod, &node("n")).is_success());
}

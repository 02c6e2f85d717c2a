//! Shared fixtures for kubewasm-runtime integration tests.
//!
//! Guests are written in WebAssembly text and compiled with `wat` at test
//! time.

#![allow(dead_code)]

use std::sync::Arc;

use kubewasm_core::{Node, NodeInfo, PluginConfig, Pod};
use kubewasm_runtime::{Interfaces, PluginError, WasmPlugin};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn config() -> PluginConfig {
    PluginConfig::new("inline.wasm")
}

pub fn try_plugin_with(wat: &str, config: &PluginConfig) -> Result<Interfaces, PluginError> {
    init_tracing();
    let bytes = wat::parse_str(wat).expect("fixture must be valid wat");
    WasmPlugin::from_bytes("test-guest", &bytes, config)
}

pub fn try_plugin(wat: &str) -> Result<Interfaces, PluginError> {
    try_plugin_with(wat, &config())
}

pub fn plugin(wat: &str) -> Interfaces {
    try_plugin(wat).expect("fixture must load")
}

pub fn pod(name: &str, uid: &str, node_name: &str) -> Arc<Pod> {
    Arc::new(Pod::new(name, uid).with_node_name(node_name))
}

pub fn node(name: &str) -> Arc<NodeInfo> {
    Arc::new(NodeInfo::new(Node::new(name)))
}

/// Helpers shared by the filter guests: substring search for the pod's
/// `"nodeName":"` field, and byte comparison.
///
/// Memory layout: pattern at 0, `" != "` at 16, pod JSON at 1024, node
/// name at 8192, reason scratch at 12288.
const FILTER_HELPERS: &str = r#"
    (data (i32.const 0) "\"nodeName\":\"")
    (data (i32.const 16) " != ")

    ;; Offset just past the pattern in [hay, hay+len), or -1.
    (func $find (param $hay i32) (param $len i32) (result i32)
        (local $i i32) (local $j i32)
        (block $notfound
            (loop $outer
                (br_if $notfound
                    (i32.gt_s (i32.add (local.get $i) (i32.const 12)) (local.get $len)))
                (local.set $j (i32.const 0))
                (block $mismatch
                    (loop $inner
                        (br_if $mismatch
                            (i32.ne
                                (i32.load8_u (i32.add (local.get $hay) (i32.add (local.get $i) (local.get $j))))
                                (i32.load8_u (local.get $j))))
                        (local.set $j (i32.add (local.get $j) (i32.const 1)))
                        (br_if $inner (i32.lt_u (local.get $j) (i32.const 12))))
                    (return (i32.add (local.get $hay) (i32.add (local.get $i) (i32.const 12)))))
                (local.set $i (i32.add (local.get $i) (i32.const 1)))
                (br $outer)))
        (i32.const -1))

    ;; Bytes from p up to the next '"' or end.
    (func $quoted_len (param $p i32) (param $end i32) (result i32)
        (local $n i32)
        (block $done
            (loop $l
                (br_if $done (i32.ge_u (i32.add (local.get $p) (local.get $n)) (local.get $end)))
                (br_if $done (i32.eq (i32.load8_u (i32.add (local.get $p) (local.get $n))) (i32.const 34)))
                (local.set $n (i32.add (local.get $n) (i32.const 1)))
                (br $l)))
        (local.get $n))

    (func $eq (param $a i32) (param $b i32) (param $n i32) (result i32)
        (local $i i32)
        (block $done
            (loop $l
                (br_if $done (i32.ge_u (local.get $i) (local.get $n)))
                (if (i32.ne (i32.load8_u (i32.add (local.get $a) (local.get $i)))
                            (i32.load8_u (i32.add (local.get $b) (local.get $i))))
                    (then (return (i32.const 0))))
                (local.set $i (i32.add (local.get $i) (i32.const 1)))
                (br $l)))
        (i32.const 1))

    ;; Success if the pod's spec.nodeName equals the candidate node name,
    ;; otherwise Unschedulable with reason "<want> != <node>".
    (func $filter_by_node_name (result i32)
        (local $podlen i32) (local $want i32) (local $wantlen i32) (local $nodelen i32) (local $r i32)
        (local.set $podlen (call $pod (i32.const 1024) (i32.const 4096)))
        (local.set $want (call $find (i32.const 1024) (local.get $podlen)))
        (if (i32.lt_s (local.get $want) (i32.const 0))
            (then (return (i32.const 0))))
        (local.set $wantlen
            (call $quoted_len (local.get $want) (i32.add (i32.const 1024) (local.get $podlen))))
        (local.set $nodelen (call $node_name (i32.const 8192) (i32.const 1024)))
        (if (i32.eq (local.get $wantlen) (local.get $nodelen))
            (then
                (if (call $eq (local.get $want) (i32.const 8192) (local.get $nodelen))
                    (then (return (i32.const 0))))))
        (memory.copy (i32.const 12288) (local.get $want) (local.get $wantlen))
        (local.set $r (i32.add (i32.const 12288) (local.get $wantlen)))
        (memory.copy (local.get $r) (i32.const 16) (i32.const 4))
        (local.set $r (i32.add (local.get $r) (i32.const 4)))
        (memory.copy (local.get $r) (i32.const 8192) (local.get $nodelen))
        (call $set_status_reason
            (i32.const 12288)
            (i32.add (i32.add (local.get $wantlen) (i32.const 4)) (local.get $nodelen)))
        (i32.const 2))
"#;

const FILTER_IMPORTS: &str = r#"
    (import "k8s.io/api" "pod" (func $pod (param i32 i32) (result i32)))
    (import "k8s.io/api" "nodeName" (func $node_name (param i32 i32) (result i32)))
    (import "k8s.io/scheduler" "set_status_reason" (func $set_status_reason (param i32 i32)))
"#;

/// A guest exporting only `filter`: the pod must land on `spec.nodeName`.
pub fn filter_only_guest() -> String {
    format!(
        r#"(module
            {FILTER_IMPORTS}
            (memory (export "memory") 1)
            {FILTER_HELPERS}
            (func (export "filter") (result i32) (call $filter_by_node_name)))"#
    )
}

/// A guest exporting every stage.
///
/// - `enqueue` reports one event: (Node, Add).
/// - `prefilter` restricts candidates to `good-node`.
/// - `filter` is the nodeName check of [`filter_only_guest`].
/// - `postfilter` nominates `good-node` with mode Override.
/// - `score` returns 10; `normalizescore` rewrites the list to
///   `[{"name":"good-node","score":100}]`.
pub fn all_stages_guest() -> String {
    format!(
        r#"(module
            {FILTER_IMPORTS}
            (import "k8s.io/scheduler" "result.cluster_events" (func $events (param i32 i32)))
            (import "k8s.io/scheduler" "result.node_names" (func $node_names (param i32 i32)))
            (import "k8s.io/scheduler" "result.nominated_node_name" (func $nominated (param i32 i32)))
            (import "k8s.io/scheduler" "result.node_score_list" (func $scores (param i32 i32)))
            (memory (export "memory") 1)
            {FILTER_HELPERS}
            (data (i32.const 32) "\01\00\00\00\01\00\00\00")
            (data (i32.const 48) "good-node\00")
            (data (i32.const 64) "[{{\"name\":\"good-node\",\"score\":100}}]")

            (func (export "enqueue") (call $events (i32.const 32) (i32.const 8)))
            (func (export "prefilter") (result i32)
                (call $node_names (i32.const 48) (i32.const 10))
                (i32.const 0))
            (func (export "filter") (result i32) (call $filter_by_node_name))
            (func (export "postfilter") (result i64)
                (call $nominated (i32.const 48) (i32.const 9))
                (i64.const 0x100000000))
            (func (export "prescore") (result i32) (i32.const 0))
            (func (export "score") (result i64) (i64.const 0xa00000000))
            (func (export "normalizescore") (result i32)
                (call $scores (i32.const 64) (i32.const 34))
                (i32.const 0))
            (func (export "reserve") (result i32) (i32.const 0))
            (func (export "unreserve"))
            (func (export "permit") (result i64) (i64.const 0))
            (func (export "prebind") (result i32) (i32.const 0))
            (func (export "bind") (result i32) (i32.const 0))
            (func (export "postbind")))"#
    )
}

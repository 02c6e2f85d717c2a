//! End-to-end stage calls against real guests.

mod common;

use std::collections::BTreeSet;
use std::time::Duration;

use kubewasm_core::framework::*;
use kubewasm_core::{ActionType, ClusterEvent, Code, CycleState, LogSeverity, NodeScore, NominatingMode, ResourceKind};
use kubewasm_runtime::{PARKED_LIMIT, PoolStats};

use common::{all_stages_guest, config, filter_only_guest, node, plugin, pod, try_plugin_with};

#[test]
fn filter_admits_the_requested_node() {
    let interfaces = plugin(&filter_only_guest());
    let filter = interfaces.stages().as_filter().expect("filter is exported");

    let state = CycleState::new(1);
    let pod = pod("web", "uid-1", "good-node");
    assert_eq!(filter.filter(&state, &pod, &node("good-node")).code(), Code::Success);
}

#[test]
fn filter_rejects_other_nodes_with_guest_reason() {
    let interfaces = plugin(&filter_only_guest());
    let filter = interfaces.stages().as_filter().unwrap();

    let state = CycleState::new(1);
    let status = filter.filter(&state, &pod("web", "uid-1", "good-node"), &node("bad-node"));
    assert_eq!(status.code(), Code::Unschedulable);
    assert_eq!(status.reason(), "good-node != bad-node");
}

#[test]
fn each_cycle_sees_its_own_pod() {
    let interfaces = plugin(&filter_only_guest());
    let filter = interfaces.stages().as_filter().unwrap();
    let candidate = node("good-node");

    let first = CycleState::new(1);
    let status = filter.filter(&first, &pod("a", "uid-a", "good-node"), &candidate);
    assert_eq!(status.code(), Code::Success);

    let second = CycleState::new(2);
    let status = filter.filter(&second, &pod("b", "uid-b", "other-node"), &candidate);
    assert_eq!(status.code(), Code::Unschedulable);
    assert_eq!(status.reason(), "other-node != good-node");

    // And back again: nothing from cycle 2 leaks into cycle 3.
    let third = CycleState::new(3);
    let status = filter.filter(&third, &pod("c", "uid-c", "good-node"), &candidate);
    assert!(status.is_success(), "{status:?}");
}

#[test]
fn reason_does_not_leak_into_the_next_call() {
    let interfaces = plugin(&filter_only_guest());
    let filter = interfaces.stages().as_filter().unwrap();
    let state = CycleState::new(1);
    let pod = pod("web", "uid-1", "good-node");

    assert_eq!(filter.filter(&state, &pod, &node("bad-node")).code(), Code::Unschedulable);
    let status = filter.filter(&state, &pod, &node("good-node"));
    assert_eq!(status.code(), Code::Success);
    assert_eq!(status.reason(), "");
}

#[test]
fn filter_only_guest_resolves_to_filter_traits_only() {
    let interfaces = plugin(&filter_only_guest());
    assert_eq!(interfaces.kind(), "Filter");

    let stages = interfaces.stages();
    assert!(stages.as_pre_filter().is_some());
    assert!(stages.as_filter().is_some());
    assert!(stages.as_post_filter().is_some());
    assert!(stages.as_score().is_none());
    assert!(stages.as_reserve().is_none());
    assert!(stages.as_permit().is_none());
    assert!(stages.as_bind().is_none());

    // Missing companions fall back to their defaults.
    let state = CycleState::new(1);
    let pod = pod("web", "uid-1", "good-node");
    let (result, status) = stages.as_pre_filter().unwrap().pre_filter(&state, &pod);
    assert!(status.is_success());
    assert_eq!(result, PreFilterResult::all_nodes());

    let (result, status) = stages.as_post_filter().unwrap().post_filter(&state, &pod);
    assert_eq!(status.code(), Code::Unschedulable);
    assert_eq!(status.reason(), "no postfilter");
    assert_eq!(result, PostFilterResult::default());
}

#[test]
fn full_cycle_runs_every_stage() {
    let interfaces = plugin(&all_stages_guest());
    assert_eq!(interfaces.kind(), "FilterScoreReservePermitBind");
    let stages = interfaces.stages();

    let state = CycleState::new(7);
    let pod = pod("web", "uid-7", "good-node");
    let good = node("good-node");

    let (result, status) = stages.as_pre_filter().unwrap().pre_filter(&state, &pod);
    assert!(status.is_success());
    assert_eq!(result.node_names, Some(BTreeSet::from(["good-node".to_string()])));

    assert!(stages.as_filter().unwrap().filter(&state, &pod, &good).is_success());

    let (result, status) = stages.as_post_filter().unwrap().post_filter(&state, &pod);
    assert!(status.is_success());
    assert_eq!(result.nominating_mode, NominatingMode::Override);
    assert_eq!(result.nominated_node_name, "good-node");

    assert!(stages.as_pre_score().unwrap().pre_score(&state, &pod, &[good.clone()]).is_success());

    let score = stages.as_score().unwrap();
    let (value, status) = score.score(&state, &pod, &good);
    assert!(status.is_success());
    assert_eq!(value, 10);

    let mut scores = vec![NodeScore::new("good-node", value)];
    assert!(score.normalize_score(&state, &pod, &mut scores).is_success());
    assert_eq!(scores, vec![NodeScore::new("good-node", 100)]);

    assert!(stages.as_reserve().unwrap().reserve(&state, &pod, "good-node").is_success());

    let (status, timeout) = stages.as_permit().unwrap().permit(&state, &pod, "good-node");
    assert!(status.is_success());
    assert_eq!(timeout, Duration::ZERO);

    assert!(stages.as_pre_bind().unwrap().pre_bind(&state, &pod, "good-node").is_success());
    assert!(stages.as_bind().unwrap().bind(&state, &pod, "good-node").is_success());
    stages.as_post_bind().unwrap().post_bind(&state, &pod, "good-node");

    assert_eq!(
        interfaces.plugin().pool_stats(),
        PoolStats {
            free: 1,
            binding: 0,
            scheduled: None,
            created: 1,
        }
    );
}

#[test]
fn binding_cycle_keeps_its_guest_while_next_pod_schedules() {
    let interfaces = plugin(&all_stages_guest());
    let stages = interfaces.stages();
    let plugin = interfaces.plugin();

    let first = CycleState::new(1);
    let pod_a = pod("a", "uid-a", "good-node");
    stages.as_pre_filter().unwrap().pre_filter(&first, &pod_a);
    assert!(stages.as_reserve().unwrap().reserve(&first, &pod_a, "good-node").is_success());
    assert!(stages.as_permit().unwrap().permit(&first, &pod_a, "good-node").0.is_success());

    // Pod B starts scheduling before pod A's binding cycle has begun.
    let second = CycleState::new(2);
    let pod_b = pod("b", "uid-b", "good-node");
    stages.as_pre_filter().unwrap().pre_filter(&second, &pod_b);

    let stats = plugin.pool_stats();
    assert_eq!(stats.binding, 1, "{stats:?}");
    assert_eq!(stats.created, 2, "{stats:?}");
    assert!(stats.scheduled.is_some());

    assert!(stages.as_bind().unwrap().bind(&first, &pod_a, "good-node").is_success());
    stages.as_post_bind().unwrap().post_bind(&first, &pod_a, "good-node");

    let stats = plugin.pool_stats();
    assert_eq!(stats.binding, 0, "{stats:?}");
    assert_eq!(stats.free, 1, "{stats:?}");
}

#[test]
fn same_pod_scheduled_twice_reuses_one_guest() {
    let interfaces = plugin(&all_stages_guest());
    let stages = interfaces.stages();
    let plugin = interfaces.plugin();
    let good = node("good-node");
    let other = node("other-node");

    let first = CycleState::new(1);
    let web = pod("web", "uid-web", "good-node");
    stages.as_pre_filter().unwrap().pre_filter(&first, &web);
    let guest = plugin.pool_stats().scheduled;
    assert!(guest.is_some());
    assert!(stages.as_filter().unwrap().filter(&first, &web, &good).is_success());
    assert!(stages.as_reserve().unwrap().reserve(&first, &web, "good-node").is_success());
    assert!(stages.as_permit().unwrap().permit(&first, &web, "good-node").0.is_success());
    assert!(stages.as_pre_bind().unwrap().pre_bind(&first, &web, "good-node").is_success());
    assert!(stages.as_bind().unwrap().bind(&first, &web, "good-node").is_success());
    stages.as_post_bind().unwrap().post_bind(&first, &web, "good-node");
    assert_eq!(plugin.pool_stats().free, 1);

    // Same UID, new cycle, different nodeName: nothing cached for cycle 1 may
    // answer for cycle 2.
    let second = CycleState::new(2);
    let web = pod("web", "uid-web", "other-node");
    stages.as_pre_filter().unwrap().pre_filter(&second, &web);
    assert_eq!(plugin.pool_stats().scheduled, guest);

    let status = stages.as_filter().unwrap().filter(&second, &web, &good);
    assert_eq!(status.code(), Code::Unschedulable);
    assert_eq!(status.reason(), "other-node != good-node");
    assert!(stages.as_filter().unwrap().filter(&second, &web, &other).is_success());
    assert!(stages.as_reserve().unwrap().reserve(&second, &web, "other-node").is_success());
    assert!(stages.as_permit().unwrap().permit(&second, &web, "other-node").0.is_success());
    assert!(stages.as_pre_bind().unwrap().pre_bind(&second, &web, "other-node").is_success());
    assert!(stages.as_bind().unwrap().bind(&second, &web, "other-node").is_success());
    stages.as_post_bind().unwrap().post_bind(&second, &web, "other-node");

    assert_eq!(
        plugin.pool_stats(),
        PoolStats {
            free: 1,
            binding: 0,
            scheduled: None,
            created: 1,
        }
    );
}

/// Filter and Bind without Reserve: no stage tells the plugin which pods
/// will reach binding.
const FILTER_BIND: &str = r#"(module
    (memory (export "memory") 1)
    (func (export "filter") (result i32) (i32.const 0))
    (func (export "bind") (result i32) (i32.const 0)))"#;

#[test]
fn bind_without_reserve_uses_the_guest_that_filtered_the_pod() {
    let interfaces = plugin(FILTER_BIND);
    let stages = interfaces.stages();
    let plugin = interfaces.plugin();
    let candidate = node("good-node");

    let first = CycleState::new(1);
    let pod_a = pod("a", "uid-a", "good-node");
    assert!(stages.as_filter().unwrap().filter(&first, &pod_a, &candidate).is_success());
    let guest_a = plugin.pool_stats().scheduled;

    let second = CycleState::new(2);
    let pod_b = pod("b", "uid-b", "good-node");
    assert!(stages.as_filter().unwrap().filter(&second, &pod_b, &candidate).is_success());
    let scheduling = plugin.pool_stats();
    assert_eq!(scheduling.binding, 1, "{scheduling:?}");
    assert_eq!(scheduling.created, 2, "{scheduling:?}");
    assert_ne!(scheduling.scheduled, guest_a);

    // Pod A binds on its parked guest: nothing new is instantiated and
    // pod B keeps the scheduled one.
    assert!(stages.as_bind().unwrap().bind(&first, &pod_a, "good-node").is_success());
    let binding = plugin.pool_stats();
    assert_eq!(binding.created, 2, "{binding:?}");
    assert_eq!(binding.binding, 1, "{binding:?}");
    assert_eq!(binding.scheduled, scheduling.scheduled);

    stages.as_post_bind().unwrap().post_bind(&first, &pod_a, "good-node");
    let done = plugin.pool_stats();
    assert_eq!(done.binding, 0, "{done:?}");
    assert_eq!(done.free, 1, "{done:?}");
}

#[test]
fn bind_after_the_guest_was_reclaimed_is_an_error() {
    let interfaces = plugin(FILTER_BIND);
    let stages = interfaces.stages();
    let filter = stages.as_filter().unwrap();
    let candidate = node("good-node");

    let first = CycleState::new(1);
    let abandoned = pod("a", "uid-a", "good-node");
    assert!(filter.filter(&first, &abandoned, &candidate).is_success());
    for cycle in 2..=(PARKED_LIMIT as u64 + 2) {
        let state = CycleState::new(cycle);
        let pod = pod("p", &format!("uid-{cycle}"), "good-node");
        assert!(filter.filter(&state, &pod, &candidate).is_success());
    }
    assert!(interfaces.plugin().pool_stats().binding <= PARKED_LIMIT);

    let status = stages.as_bind().unwrap().bind(&first, &abandoned, "good-node");
    assert_eq!(status.code(), Code::Error);
    assert!(status.reason().contains("uid-a"), "{status:?}");
    assert!(status.reason().contains("reclaimed"), "{status:?}");
}

#[test]
fn permitted_pods_that_never_bind_do_not_pile_up() {
    let interfaces = plugin(
        r#"(module
            (memory (export "memory") 1)
            (func (export "permit") (result i64) (i64.const 0))
            (func (export "bind") (result i32) (i32.const 0)))"#,
    );
    let stages = interfaces.stages();
    let permit = stages.as_permit().unwrap();

    let mut last = None;
    for cycle in 1..=40 {
        let state = CycleState::new(cycle);
        let pod = pod("p", &format!("uid-{cycle}"), "good-node");
        assert!(permit.permit(&state, &pod, "good-node").0.is_success());
        let stats = interfaces.plugin().pool_stats();
        assert!(stats.binding <= PARKED_LIMIT, "{stats:?}");
        assert!(stats.created <= PARKED_LIMIT as u64 + 1, "{stats:?}");
        last = Some((state, pod));
    }

    // The most recent pod still binds on the guest that permitted it.
    let (state, pod) = last.unwrap();
    let created = interfaces.plugin().pool_stats().created;
    assert!(stages.as_bind().unwrap().bind(&state, &pod, "good-node").is_success());
    assert_eq!(interfaces.plugin().pool_stats().created, created);
}

#[test]
fn unreserve_returns_the_guest() {
    let interfaces = plugin(&all_stages_guest());
    let stages = interfaces.stages();

    let state = CycleState::new(3);
    let pod = pod("web", "uid-3", "good-node");
    stages.as_reserve().unwrap().reserve(&state, &pod, "good-node");
    stages.as_reserve().unwrap().unreserve(&state, &pod, "good-node");

    let stats = interfaces.plugin().pool_stats();
    assert_eq!(stats.binding, 0);
    assert_eq!(stats.scheduled, None);
    assert_eq!(stats.free, 1);
}

#[test]
fn unschedulable_cycle_reuses_the_same_guest() {
    let interfaces = plugin(&all_stages_guest());
    let filter = interfaces.stages().as_filter().unwrap();

    for cycle in 1..=5 {
        let state = CycleState::new(cycle);
        let pod = pod("web", &format!("uid-{cycle}"), "good-node");
        assert_eq!(filter.filter(&state, &pod, &node("bad-node")).code(), Code::Unschedulable);
    }
    assert_eq!(interfaces.plugin().pool_stats().created, 1);
}

#[test]
fn enqueue_events_come_from_the_guest() {
    let interfaces = plugin(&all_stages_guest());
    let events = interfaces.stages().as_enqueue_extensions().events_to_register();
    assert_eq!(events, vec![ClusterEvent::new(ResourceKind::Node, ActionType::ADD)]);
}

#[test]
fn missing_enqueue_registers_the_wildcard() {
    let interfaces = plugin(&filter_only_guest());
    let events = interfaces.stages().as_enqueue_extensions().events_to_register();
    assert_eq!(events, vec![ClusterEvent::WILDCARD]);
}

#[test]
fn enqueue_reporting_nothing_registers_nothing() {
    let interfaces = plugin(
        r#"(module
            (memory (export "memory") 1)
            (func (export "enqueue"))
            (func (export "filter") (result i32) (i32.const 0)))"#,
    );
    assert!(interfaces.stages().as_enqueue_extensions().events_to_register().is_empty());
}

/// Filter returns Unschedulable with the guest config as its reason.
const CONFIG_ECHO: &str = r#"(module
    (import "k8s.io/scheduler" "get_config" (func $get_config (param i32 i32) (result i32)))
    (import "k8s.io/scheduler" "set_status_reason" (func $set_status_reason (param i32 i32)))
    (memory (export "memory") 1)
    (func (export "filter") (result i32)
        (local $len i32)
        (local.set $len (call $get_config (i32.const 0) (i32.const 0)))
        (if (i32.eqz (local.get $len)) (then (return (i32.const 0))))
        (drop (call $get_config (i32.const 1024) (local.get $len)))
        (call $set_status_reason (i32.const 1024) (local.get $len))
        (i32.const 2)))"#;

#[test]
fn guest_reads_its_config() {
    let cfg = config().with_guest_config(r#"{"zone":"eu-west-1"}"#);
    let interfaces = try_plugin_with(CONFIG_ECHO, &cfg).unwrap();
    let status = interfaces.stages().as_filter().unwrap().filter(
        &CycleState::new(1),
        &pod("web", "uid-1", "good-node"),
        &node("good-node"),
    );
    assert_eq!(status.code(), Code::Unschedulable);
    assert_eq!(status.reason(), r#"{"zone":"eu-west-1"}"#);
}

#[test]
fn guest_without_config_reads_nothing() {
    let interfaces = try_plugin_with(CONFIG_ECHO, &config()).unwrap();
    let status = interfaces.stages().as_filter().unwrap().filter(
        &CycleState::new(1),
        &pod("web", "uid-1", "good-node"),
        &node("good-node"),
    );
    assert!(status.is_success());
}

#[test]
fn guest_sees_configured_severity() {
    // Logs a message, then returns the severity threshold as its status code.
    let wat = r#"(module
        (import "k8s.io/scheduler" "log" (func $log (param i32 i32 i32)))
        (import "k8s.io/scheduler" "severity" (func $severity (result i32)))
        (memory (export "memory") 1)
        (data (i32.const 0) "filtering")
        (func (export "filter") (result i32)
            (call $log (i32.const 2) (i32.const 0) (i32.const 9))
            (call $severity)))"#;
    let cfg = config().with_log_severity(LogSeverity::Warn);
    let interfaces = try_plugin_with(wat, &cfg).unwrap();
    let status = interfaces.stages().as_filter().unwrap().filter(
        &CycleState::new(1),
        &pod("web", "uid-1", "good-node"),
        &node("good-node"),
    );
    assert_eq!(status.code(), Code::Unschedulable);
}

#[test]
fn permit_wait_carries_the_timeout() {
    let interfaces = plugin(
        r#"(module
            (memory (export "memory") 1)
            (func (export "permit") (result i64) (i64.const 0x4000003e8)))"#,
    );
    let (status, timeout) = interfaces.stages().as_permit().unwrap().permit(
        &CycleState::new(1),
        &pod("web", "uid-1", "good-node"),
        "good-node",
    );
    assert_eq!(status.code(), Code::Wait);
    assert_eq!(timeout, Duration::from_millis(1000));
}

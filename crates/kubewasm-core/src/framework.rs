//! Scheduler framework extension points.
//!
//! These traits are the surface the scheduler framework calls. A plugin
//! implements exactly the traits for the stages it takes part in; the
//! framework discovers them through the accessors on the plugin value it
//! registers, never by probing at call time.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use crate::event::ClusterEvent;
use crate::status::{NominatingMode, Status};
use crate::types::{CycleState, NodeInfo, NodeScore, Pod};

pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;
}

/// Events that may make a previously unschedulable pod schedulable.
pub trait EnqueueExtensions: Plugin {
    fn events_to_register(&self) -> Vec<ClusterEvent>;
}

/// Optional narrowing of the candidate node set, returned by PreFilter.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PreFilterResult {
    /// `None` means every node remains a candidate.
    pub node_names: Option<BTreeSet<String>>,
}

impl PreFilterResult {
    pub fn all_nodes() -> Self {
        Self::default()
    }

    pub fn allows(&self, node_name: &str) -> bool {
        self.node_names
            .as_ref()
            .is_none_or(|names| names.contains(node_name))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PostFilterResult {
    pub nominating_mode: NominatingMode,
    pub nominated_node_name: String,
}

pub trait PreFilterPlugin: Plugin {
    fn pre_filter(&self, state: &CycleState, pod: &Arc<Pod>) -> (PreFilterResult, Status);
}

pub trait FilterPlugin: Plugin {
    fn filter(&self, state: &CycleState, pod: &Arc<Pod>, node: &Arc<NodeInfo>) -> Status;
}

pub trait PostFilterPlugin: Plugin {
    fn post_filter(&self, state: &CycleState, pod: &Arc<Pod>) -> (PostFilterResult, Status);
}

pub trait PreScorePlugin: Plugin {
    fn pre_score(&self, state: &CycleState, pod: &Arc<Pod>, nodes: &[Arc<NodeInfo>]) -> Status;
}

pub trait ScorePlugin: Plugin {
    fn score(&self, state: &CycleState, pod: &Arc<Pod>, node: &Arc<NodeInfo>) -> (i64, Status);

    /// NormalizeScore; rewrites `scores` in place.
    fn normalize_score(&self, state: &CycleState, pod: &Arc<Pod>, scores: &mut Vec<NodeScore>) -> Status;
}

pub trait ReservePlugin: Plugin {
    fn reserve(&self, state: &CycleState, pod: &Arc<Pod>, node_name: &str) -> Status;
    fn unreserve(&self, state: &CycleState, pod: &Arc<Pod>, node_name: &str);
}

pub trait PermitPlugin: Plugin {
    /// A `Wait` status is paired with how long the framework should wait.
    fn permit(&self, state: &CycleState, pod: &Arc<Pod>, node_name: &str) -> (Status, Duration);
}

pub trait PreBindPlugin: Plugin {
    fn pre_bind(&self, state: &CycleState, pod: &Arc<Pod>, node_name: &str) -> Status;
}

pub trait BindPlugin: Plugin {
    fn bind(&self, state: &CycleState, pod: &Arc<Pod>, node_name: &str) -> Status;
}

pub trait PostBindPlugin: Plugin {
    fn post_bind(&self, state: &CycleState, pod: &Arc<Pod>, node_name: &str);
}

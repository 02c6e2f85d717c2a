//! Inputs and outputs of one in-flight stage call.
//!
//! A context is built right before a guest export is invoked, placed in
//! the store for the duration of that call, and taken back out right
//! after. Host functions read the inputs from it lazily and record the
//! guest's results into it. Nothing in it outlives the call.

use std::sync::Arc;

use kubewasm_core::{ClusterEvent, CycleId, NodeInfo, NodeScore, Pod};

#[derive(Debug, Default)]
pub struct CallContext {
    // Inputs
    pub cycle: Option<CycleId>,
    pub pod: Option<Arc<Pod>>,
    pub node: Option<Arc<NodeInfo>>,
    pub node_name: Option<String>,
    pub node_scores: Option<Vec<NodeScore>>,

    // Outputs set by the guest through the scheduler namespace
    pub reason: Option<String>,
    pub node_names: Option<Vec<String>>,
    pub cluster_events: Option<Vec<ClusterEvent>>,
    pub nominated_node_name: Option<String>,
    pub normalized_scores: Option<Vec<NodeScore>>,
}

impl CallContext {
    /// A context with no pod, as used by `enqueue`.
    pub fn empty() -> Self {
        Self::default()
    }

    /// A context for a stage that sees the pod being scheduled.
    pub fn for_pod(cycle: CycleId, pod: &Arc<Pod>) -> Self {
        Self {
            cycle: Some(cycle),
            pod: Some(Arc::clone(pod)),
            ..Self::default()
        }
    }

    /// Builder method: attach the candidate node.
    pub fn with_node(mut self, node: &Arc<NodeInfo>) -> Self {
        self.node_name = Some(node.name().to_string());
        self.node = Some(Arc::clone(node));
        self
    }

    /// Builder method: attach only the node name (reserve/permit/bind stages).
    pub fn with_node_name(mut self, node_name: &str) -> Self {
        self.node_name = Some(node_name.to_string());
        self
    }

    /// Builder method: attach the score list for NormalizeScore.
    pub fn with_node_scores(mut self, scores: Vec<NodeScore>) -> Self {
        self.node_scores = Some(scores);
        self
    }

    /// Key of the pod cache entry this call may use.
    pub(crate) fn cycle_key(&self) -> Option<(CycleId, &str)> {
        match (&self.cycle, &self.pod) {
            (Some(cycle), Some(pod)) => Some((*cycle, pod.uid())),
            _ => None,
        }
    }
}

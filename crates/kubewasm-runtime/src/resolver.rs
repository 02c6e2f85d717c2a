//! Which framework traits a guest may advertise.
//!
//! Stage exports are grouped around an anchor stage:
//!
//! | group   | anchor    | companions                 |
//! |---------|-----------|----------------------------|
//! | filter  | `filter`  | `prefilter`, `postfilter`  |
//! | score   | `score`   | `prescore`, `normalizescore` |
//! | reserve | `reserve` | `unreserve`                |
//! | permit  | `permit`  |                            |
//! | bind    | `bind`    | `prebind`, `postbind`      |
//!
//! A group is exposed when its anchor is exported; companions never stand
//! alone. The one exception is a guest exporting only `prefilter`, exposed
//! as [`PreFilterOnly`] with a no-op filter. Every other set of groups,
//! 31 in all, has its own type in [`Interfaces`], implementing exactly the
//! traits of its groups.

use std::fmt;
use std::ops::BitOr;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use kubewasm_core::framework::{
    BindPlugin, EnqueueExtensions, FilterPlugin, Plugin, PostBindPlugin, PostFilterPlugin, PostFilterResult,
    PermitPlugin, PreBindPlugin, PreFilterPlugin, PreFilterResult, PreScorePlugin, ReservePlugin, ScorePlugin,
};
use kubewasm_core::{ClusterEvent, CycleState, NodeInfo, NodeScore, Pod, Status};
use kubewasm_host::{ExportSet, Stage};

use crate::plugin::WasmPlugin;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveError {
    #[error("at least one of filter/score/reserve/permit/bind must be exported")]
    NoStages,

    #[error("{stage} is exported without {anchor}")]
    MissingAnchor { stage: Stage, anchor: Stage },
}

/// Set of stage groups a guest exposes.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct GroupSet(u8);

impl GroupSet {
    pub const FILTER: GroupSet = GroupSet(1);
    pub const SCORE: GroupSet = GroupSet(1 << 1);
    pub const RESERVE: GroupSet = GroupSet(1 << 2);
    pub const PERMIT: GroupSet = GroupSet(1 << 3);
    pub const BIND: GroupSet = GroupSet(1 << 4);
    /// Only `prefilter`; exclusive with every other bit.
    pub const PREFILTER_ONLY: GroupSet = GroupSet(1 << 5);

    const NAMED: [(GroupSet, &'static str); 6] = [
        (GroupSet::FILTER, "filter"),
        (GroupSet::SCORE, "score"),
        (GroupSet::RESERVE, "reserve"),
        (GroupSet::PERMIT, "permit"),
        (GroupSet::BIND, "bind"),
        (GroupSet::PREFILTER_ONLY, "prefilter-only"),
    ];

    pub const fn from_bits(bits: u8) -> GroupSet {
        GroupSet(bits)
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn contains(self, other: GroupSet) -> bool {
        self.0 & other.0 == other.0
    }

    fn insert(&mut self, other: GroupSet) {
        self.0 |= other.0;
    }
}

impl BitOr for GroupSet {
    type Output = GroupSet;

    fn bitor(self, rhs: GroupSet) -> GroupSet {
        GroupSet(self.0 | rhs.0)
    }
}

impl fmt::Debug for GroupSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = GroupSet::NAMED
            .iter()
            .filter(|(group, _)| self.contains(*group))
            .map(|(_, name)| *name);
        f.debug_set().entries(names).finish()
    }
}

const GROUPS: [(GroupSet, Stage, &[Stage]); 5] = [
    (GroupSet::FILTER, Stage::Filter, &[Stage::PreFilter, Stage::PostFilter]),
    (GroupSet::SCORE, Stage::Score, &[Stage::PreScore, Stage::NormalizeScore]),
    (GroupSet::RESERVE, Stage::Reserve, &[Stage::Unreserve]),
    (GroupSet::PERMIT, Stage::Permit, &[]),
    (GroupSet::BIND, Stage::Bind, &[Stage::PreBind, Stage::PostBind]),
];

/// Map an export set onto the groups it exposes.
pub fn classify(exports: ExportSet) -> Result<GroupSet, ResolveError> {
    let only_prefilter = exports.iter().all(|s| matches!(s, Stage::PreFilter | Stage::Enqueue));
    if exports.contains(Stage::PreFilter) && only_prefilter {
        return Ok(GroupSet::PREFILTER_ONLY);
    }

    let mut groups = GroupSet::default();
    for (group, anchor, companions) in GROUPS {
        if exports.contains(anchor) {
            groups.insert(group);
        } else if let Some(&stage) = companions.iter().find(|s| exports.contains(**s)) {
            return Err(ResolveError::MissingAnchor { stage, anchor });
        }
    }

    if groups == GroupSet::default() {
        return Err(ResolveError::NoStages);
    }
    Ok(groups)
}

/// Per-stage trait views of a resolved plugin. Each accessor is `Some`
/// exactly when the plugin's group set includes the stage.
pub trait AsStages {
    fn as_enqueue_extensions(&self) -> &dyn EnqueueExtensions;

    fn as_pre_filter(&self) -> Option<&dyn PreFilterPlugin> {
        None
    }
    fn as_filter(&self) -> Option<&dyn FilterPlugin> {
        None
    }
    fn as_post_filter(&self) -> Option<&dyn PostFilterPlugin> {
        None
    }
    fn as_pre_score(&self) -> Option<&dyn PreScorePlugin> {
        None
    }
    fn as_score(&self) -> Option<&dyn ScorePlugin> {
        None
    }
    fn as_reserve(&self) -> Option<&dyn ReservePlugin> {
        None
    }
    fn as_permit(&self) -> Option<&dyn PermitPlugin> {
        None
    }
    fn as_pre_bind(&self) -> Option<&dyn PreBindPlugin> {
        None
    }
    fn as_bind(&self) -> Option<&dyn BindPlugin> {
        None
    }
    fn as_post_bind(&self) -> Option<&dyn PostBindPlugin> {
        None
    }
}

macro_rules! group_bit {
    (Filter) => {
        GroupSet::FILTER
    };
    (Score) => {
        GroupSet::SCORE
    };
    (Reserve) => {
        GroupSet::RESERVE
    };
    (Permit) => {
        GroupSet::PERMIT
    };
    (Bind) => {
        GroupSet::BIND
    };
}

macro_rules! group_traits {
    (Filter for $ty:ident) => {
        impl PreFilterPlugin for $ty {
            fn pre_filter(&self, state: &CycleState, pod: &Arc<Pod>) -> (PreFilterResult, Status) {
                self.0.pre_filter(state, pod)
            }
        }
        impl FilterPlugin for $ty {
            fn filter(&self, state: &CycleState, pod: &Arc<Pod>, node: &Arc<NodeInfo>) -> Status {
                self.0.filter(state, pod, node)
            }
        }
        impl PostFilterPlugin for $ty {
            fn post_filter(&self, state: &CycleState, pod: &Arc<Pod>) -> (PostFilterResult, Status) {
                self.0.post_filter(state, pod)
            }
        }
    };
    (Score for $ty:ident) => {
        impl PreScorePlugin for $ty {
            fn pre_score(&self, state: &CycleState, pod: &Arc<Pod>, nodes: &[Arc<NodeInfo>]) -> Status {
                self.0.pre_score(state, pod, nodes)
            }
        }
        impl ScorePlugin for $ty {
            fn score(&self, state: &CycleState, pod: &Arc<Pod>, node: &Arc<NodeInfo>) -> (i64, Status) {
                self.0.score(state, pod, node)
            }
            fn normalize_score(&self, state: &CycleState, pod: &Arc<Pod>, scores: &mut Vec<NodeScore>) -> Status {
                self.0.normalize_score(state, pod, scores)
            }
        }
    };
    (Reserve for $ty:ident) => {
        impl ReservePlugin for $ty {
            fn reserve(&self, state: &CycleState, pod: &Arc<Pod>, node_name: &str) -> Status {
                self.0.reserve(state, pod, node_name)
            }
            fn unreserve(&self, state: &CycleState, pod: &Arc<Pod>, node_name: &str) {
                self.0.unreserve(state, pod, node_name)
            }
        }
    };
    (Permit for $ty:ident) => {
        impl PermitPlugin for $ty {
            fn permit(&self, state: &CycleState, pod: &Arc<Pod>, node_name: &str) -> (Status, Duration) {
                self.0.permit(state, pod, node_name)
            }
        }
    };
    (Bind for $ty:ident) => {
        impl PreBindPlugin for $ty {
            fn pre_bind(&self, state: &CycleState, pod: &Arc<Pod>, node_name: &str) -> Status {
                self.0.pre_bind(state, pod, node_name)
            }
        }
        impl BindPlugin for $ty {
            fn bind(&self, state: &CycleState, pod: &Arc<Pod>, node_name: &str) -> Status {
                self.0.bind(state, pod, node_name)
            }
        }
        impl PostBindPlugin for $ty {
            fn post_bind(&self, state: &CycleState, pod: &Arc<Pod>, node_name: &str) {
                self.0.post_bind(state, pod, node_name)
            }
        }
    };
}

macro_rules! group_accessors {
    (Filter) => {
        fn as_pre_filter(&self) -> Option<&dyn PreFilterPlugin> {
            Some(self)
        }
        fn as_filter(&self) -> Option<&dyn FilterPlugin> {
            Some(self)
        }
        fn as_post_filter(&self) -> Option<&dyn PostFilterPlugin> {
            Some(self)
        }
    };
    (Score) => {
        fn as_pre_score(&self) -> Option<&dyn PreScorePlugin> {
            Some(self)
        }
        fn as_score(&self) -> Option<&dyn ScorePlugin> {
            Some(self)
        }
    };
    (Reserve) => {
        fn as_reserve(&self) -> Option<&dyn ReservePlugin> {
            Some(self)
        }
    };
    (Permit) => {
        fn as_permit(&self) -> Option<&dyn PermitPlugin> {
            Some(self)
        }
    };
    (Bind) => {
        fn as_pre_bind(&self) -> Option<&dyn PreBindPlugin> {
            Some(self)
        }
        fn as_bind(&self) -> Option<&dyn BindPlugin> {
            Some(self)
        }
        fn as_post_bind(&self) -> Option<&dyn PostBindPlugin> {
            Some(self)
        }
    };
}

/// Traits every resolved plugin carries.
macro_rules! base_traits {
    ($ty:ident) => {
        impl Plugin for $ty {
            fn name(&self) -> &str {
                self.0.name()
            }
        }
        impl EnqueueExtensions for $ty {
            fn events_to_register(&self) -> Vec<ClusterEvent> {
                self.0.events_to_register()
            }
        }
    };
}

macro_rules! interfaces {
    ($( $variant:ident = [$($group:ident),+]; )+) => {
        /// A guest plugin resolved to the exact set of traits it supports.
        pub enum Interfaces {
            PreFilterOnly(PreFilterOnly),
            $( $variant($variant), )+
        }

        $(
            pub struct $variant(Arc<WasmPlugin>);

            base_traits!($variant);
            $( group_traits!($group for $variant); )+

            impl AsStages for $variant {
                fn as_enqueue_extensions(&self) -> &dyn EnqueueExtensions {
                    self
                }
                $( group_accessors!($group); )+
            }
        )+

        impl Interfaces {
            /// Wrap `plugin` in the variant for `groups`, as returned by [`classify`].
            ///
            /// # Panics
            ///
            /// If `groups` is empty or mixes `PREFILTER_ONLY` with other groups.
            pub fn new(groups: GroupSet, plugin: Arc<WasmPlugin>) -> Self {
                if groups == GroupSet::PREFILTER_ONLY {
                    return Interfaces::PreFilterOnly(PreFilterOnly(plugin));
                }
                $(
                    if groups == GroupSet::from_bits(0 $(| group_bit!($group).0)+) {
                        return Interfaces::$variant($variant(plugin));
                    }
                )+
                panic!("no interface group for {groups:?}");
            }

            /// Classify the plugin's exports and wrap it.
            pub fn resolve(plugin: Arc<WasmPlugin>) -> Result<Self, ResolveError> {
                let groups = classify(plugin.exports())?;
                Ok(Self::new(groups, plugin))
            }

            pub fn stages(&self) -> &dyn AsStages {
                match self {
                    Interfaces::PreFilterOnly(p) => p,
                    $( Interfaces::$variant(p) => p, )+
                }
            }

            pub fn plugin(&self) -> &Arc<WasmPlugin> {
                match self {
                    Interfaces::PreFilterOnly(p) => &p.0,
                    $( Interfaces::$variant(p) => &p.0, )+
                }
            }

            /// Name of the resolved variant, e.g. `FilterScore`.
            pub fn kind(&self) -> &'static str {
                match self {
                    Interfaces::PreFilterOnly(_) => "PreFilterOnly",
                    $( Interfaces::$variant(_) => stringify!($variant), )+
                }
            }
        }
    };
}

interfaces! {
    Filter = [Filter];
    Score = [Score];
    Reserve = [Reserve];
    Permit = [Permit];
    Bind = [Bind];
    FilterScore = [Filter, Score];
    FilterReserve = [Filter, Reserve];
    FilterPermit = [Filter, Permit];
    FilterBind = [Filter, Bind];
    ScoreReserve = [Score, Reserve];
    ScorePermit = [Score, Permit];
    ScoreBind = [Score, Bind];
    ReservePermit = [Reserve, Permit];
    ReserveBind = [Reserve, Bind];
    PermitBind = [Permit, Bind];
    FilterScoreReserve = [Filter, Score, Reserve];
    FilterScorePermit = [Filter, Score, Permit];
    FilterScoreBind = [Filter, Score, Bind];
    FilterReservePermit = [Filter, Reserve, Permit];
    FilterReserveBind = [Filter, Reserve, Bind];
    FilterPermitBind = [Filter, Permit, Bind];
    ScoreReservePermit = [Score, Reserve, Permit];
    ScoreReserveBind = [Score, Reserve, Bind];
    ScorePermitBind = [Score, Permit, Bind];
    ReservePermitBind = [Reserve, Permit, Bind];
    FilterScoreReservePermit = [Filter, Score, Reserve, Permit];
    FilterScoreReserveBind = [Filter, Score, Reserve, Bind];
    FilterScorePermitBind = [Filter, Score, Permit, Bind];
    FilterReservePermitBind = [Filter, Reserve, Permit, Bind];
    ScoreReservePermitBind = [Score, Reserve, Permit, Bind];
    FilterScoreReservePermitBind = [Filter, Score, Reserve, Permit, Bind];
}

/// A guest exporting only `prefilter`. Its filter admits every node.
pub struct PreFilterOnly(Arc<WasmPlugin>);

base_traits!(PreFilterOnly);

impl PreFilterPlugin for PreFilterOnly {
    fn pre_filter(&self, state: &CycleState, pod: &Arc<Pod>) -> (PreFilterResult, Status) {
        self.0.pre_filter(state, pod)
    }
}

impl FilterPlugin for PreFilterOnly {
    fn filter(&self, _state: &CycleState, _pod: &Arc<Pod>, _node: &Arc<NodeInfo>) -> Status {
        Status::success()
    }
}

impl AsStages for PreFilterOnly {
    fn as_enqueue_extensions(&self) -> &dyn EnqueueExtensions {
        self
    }
    fn as_pre_filter(&self) -> Option<&dyn PreFilterPlugin> {
        Some(self)
    }
    fn as_filter(&self) -> Option<&dyn FilterPlugin> {
        Some(self)
    }
}

impl Interfaces {
    pub fn name(&self) -> &str {
        self.plugin().name()
    }

    pub fn as_enqueue_extensions(&self) -> &dyn EnqueueExtensions {
        self.stages().as_enqueue_extensions()
    }

    pub fn as_pre_filter(&self) -> Option<&dyn PreFilterPlugin> {
        self.stages().as_pre_filter()
    }

    pub fn as_filter(&self) -> Option<&dyn FilterPlugin> {
        self.stages().as_filter()
    }

    pub fn as_post_filter(&self) -> Option<&dyn PostFilterPlugin> {
        self.stages().as_post_filter()
    }

    pub fn as_pre_score(&self) -> Option<&dyn PreScorePlugin> {
        self.stages().as_pre_score()
    }

    pub fn as_score(&self) -> Option<&dyn ScorePlugin> {
        self.stages().as_score()
    }

    pub fn as_reserve(&self) -> Option<&dyn ReservePlugin> {
        self.stages().as_reserve()
    }

    pub fn as_permit(&self) -> Option<&dyn PermitPlugin> {
        self.stages().as_permit()
    }

    pub fn as_pre_bind(&self) -> Option<&dyn PreBindPlugin> {
        self.stages().as_pre_bind()
    }

    pub fn as_bind(&self) -> Option<&dyn BindPlugin> {
        self.stages().as_bind()
    }

    pub fn as_post_bind(&self) -> Option<&dyn PostBindPlugin> {
        self.stages().as_post_bind()
    }
}

impl fmt::Debug for Interfaces {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Interfaces")
            .field("kind", &self.kind())
            .field("plugin", &self.name())
            .finish()
    }
}

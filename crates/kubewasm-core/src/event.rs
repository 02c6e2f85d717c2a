//! Cluster events a plugin can ask to be re-queued on.

use std::ops::BitOr;

/// Kind of cluster resource an event refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ResourceKind {
    Pod = 0,
    Node = 1,
    PersistentVolume = 2,
    PersistentVolumeClaim = 3,
    PodSchedulingContext = 4,
    ResourceClaim = 5,
    StorageClass = 6,
    CsiNode = 7,
    CsiDriver = 8,
    CsiStorageCapacity = 9,
    WildCard = 10,
}

impl ResourceKind {
    pub fn from_u32(value: u32) -> Option<Self> {
        Some(match value {
            0 => ResourceKind::Pod,
            1 => ResourceKind::Node,
            2 => ResourceKind::PersistentVolume,
            3 => ResourceKind::PersistentVolumeClaim,
            4 => ResourceKind::PodSchedulingContext,
            5 => ResourceKind::ResourceClaim,
            6 => ResourceKind::StorageClass,
            7 => ResourceKind::CsiNode,
            8 => ResourceKind::CsiDriver,
            9 => ResourceKind::CsiStorageCapacity,
            10 => ResourceKind::WildCard,
            _ => return None,
        })
    }
}

/// Bitmask of actions on a resource. Bits combine with `|`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ActionType(u32);

impl ActionType {
    pub const ADD: ActionType = ActionType(1 << 0);
    pub const DELETE: ActionType = ActionType(1 << 1);
    pub const UPDATE_NODE_ALLOCATABLE: ActionType = ActionType(1 << 2);
    pub const UPDATE_NODE_LABEL: ActionType = ActionType(1 << 3);
    pub const UPDATE_NODE_TAINT: ActionType = ActionType(1 << 4);
    pub const UPDATE_NODE_CONDITION: ActionType = ActionType(1 << 5);

    pub const UPDATE: ActionType = ActionType(
        Self::UPDATE_NODE_ALLOCATABLE.0
            | Self::UPDATE_NODE_LABEL.0
            | Self::UPDATE_NODE_TAINT.0
            | Self::UPDATE_NODE_CONDITION.0,
    );
    pub const ALL: ActionType = ActionType(Self::ADD.0 | Self::DELETE.0 | Self::UPDATE.0);

    pub const fn from_bits(bits: u32) -> Self {
        ActionType(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains(self, other: ActionType) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for ActionType {
    type Output = ActionType;

    fn bitor(self, rhs: ActionType) -> ActionType {
        ActionType(self.0 | rhs.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClusterEvent {
    pub resource: ResourceKind,
    pub action: ActionType,
}

impl ClusterEvent {
    /// The sentinel that matches every event.
    pub const WILDCARD: ClusterEvent = ClusterEvent {
        resource: ResourceKind::WildCard,
        action: ActionType::ALL,
    };

    pub fn new(resource: ResourceKind, action: ActionType) -> Self {
        Self { resource, action }
    }

    pub fn is_wildcard(&self) -> bool {
        *self == Self::WILDCARD
    }

    /// Whether an observed event should re-queue pods registered for `self`.
    pub fn matches(&self, observed: &ClusterEvent) -> bool {
        if self.is_wildcard() {
            return true;
        }
        let resource_matches = self.resource == ResourceKind::WildCard
            || self.resource == observed.resource;
        resource_matches && self.action.bits() & observed.action.bits() != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn update_is_union_of_sub_kinds() {
        assert!(ActionType::UPDATE.contains(ActionType::UPDATE_NODE_TAINT));
        assert!(!ActionType::UPDATE.contains(ActionType::ADD));
        assert_eq!(ActionType::ALL.bits(), 0b11_1111);
    }

    #[test]
    fn wildcard_matches_everything() {
        let observed = ClusterEvent::new(ResourceKind::Node, ActionType::ADD);
        assert!(ClusterEvent::WILDCARD.matches(&observed));
    }

    #[test]
    fn specific_event_matches_overlapping_action_only() {
        let registered = ClusterEvent::new(ResourceKind::Node, ActionType::ADD | ActionType::UPDATE_NODE_LABEL);
        assert!(registered.matches(&ClusterEvent::new(ResourceKind::Node, ActionType::UPDATE_NODE_LABEL)));
        assert!(!registered.matches(&ClusterEvent::new(ResourceKind::Node, ActionType::DELETE)));
        assert!(!registered.matches(&ClusterEvent::new(ResourceKind::Pod, ActionType::ADD)));
    }

    #[test]
    fn unknown_resource_code_is_rejected() {
        assert_eq!(ResourceKind::from_u32(10), Some(ResourceKind::WildCard));
        assert_eq!(ResourceKind::from_u32(11), None);
    }
}

//! Peer liveness tracking for health reporting.

use std::collections::BTreeMap;

use rabia_types::NodeId;

use crate::cluster::ClusterView;

/// Last tick each peer was heard from.
#[derive(Debug, Clone, Default)]
pub struct PeerLiveness {
    last_heard: BTreeMap<NodeId, u64>,
}

impl PeerLiveness {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn heard(&mut self, peer: NodeId, tick: u64) {
        self.last_heard.insert(peer, tick);
    }

    pub fn last_heard(&self, peer: NodeId) -> Option<u64> {
        self.last_heard.get(&peer).copied()
    }

    /// Members heard from within `timeout` ticks. `local` counts as
    /// reachable when it is a member.
    pub fn reachable_members(
        &self,
        view: &ClusterView,
        local: NodeId,
        now: u64,
        timeout: u64,
    ) -> usize {
        view.members()
            .filter(|member| {
                *member == local
                    || self
                        .last_heard(*member)
                        .is_some_and(|tick| now.saturating_sub(tick) <= timeout)
            })
            .count()
    }

    /// Forgets peers that are no longer in the view.
    pub fn retain_view(&mut self, view: &ClusterView) {
        self.last_heard.retain(|peer, _| view.contains(*peer));
    }
}

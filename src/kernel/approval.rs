//! Human governance collaborator boundary.
//!
//! Approval decisions feed back into the broker as grants with matching
//! scope: a session approval becomes a standing capability, a one-shot
//! approval becomes a single-use grant that tombstones itself after its
//! first `require`.

use crate::kernel::capability::RiskTier;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalDecision {
    ApproveOnce,
    ApproveSession,
    Deny,
}

/// Governance collaborator. Implementations may block (a terminal prompt,
/// a policy engine); the kernel only sees the decision.
pub trait Approver: Send + Sync {
    fn approve(&self, prompt: &str, tier: RiskTier) -> ApprovalDecision;
}

/// Fixed-policy approver for tests and headless runs.
pub struct AutoApprover {
    decision: ApprovalDecision,
}

impl AutoApprover {
    pub fn new(decision: ApprovalDecision) -> Self {
        Self { decision }
    }

    /// Default stance: deny everything that asks.
    pub fn deny_all() -> Self {
        Self::new(ApprovalDecision::Deny)
    }
}

impl Approver for AutoApprover {
    fn approve(&self, _prompt: &str, _tier: RiskTier) -> ApprovalDecision {
        self.decision
    }
}

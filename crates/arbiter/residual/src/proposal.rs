//! Dimension proposals and the adoption vote.
//!
//! A residual finding becomes a proposal; the proposal becomes a registered
//! dimension only when the worker vote clears the same φ⁻¹ agreement bar
//! that consensus verdicts use.

use std::collections::HashMap;

use arbiter_types::phi::CONSENSUS_QUORUM;
use arbiter_types::{Axiom, DimensionId, WorkerId};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::ResidualFinding;

/// Unique identifier for a dimension proposal.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProposalId(pub String);

impl ProposalId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl std::fmt::Display for ProposalId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A candidate scoring dimension distilled from a residual finding.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DimensionProposal {
    pub id: ProposalId,
    pub dimension_id: DimensionId,
    pub axiom: Axiom,
    pub description: String,
    pub finding: ResidualFinding,
    pub proposed_at: chrono::DateTime<chrono::Utc>,
}

impl DimensionProposal {
    /// Build a proposal from a finding, naming the dimension after the
    /// dominant residual cluster.
    pub fn from_finding(finding: ResidualFinding, axiom: Axiom) -> Self {
        let facet = finding
            .dominant_tag
            .clone()
            .unwrap_or_else(|| format!("residual-{}", finding.window_id));
        let dimension_id = DimensionId::new(format!("{}.{}", axiom, facet));
        let description = format!(
            "Emerged from residual window {} (unexplained variance {:.3})",
            finding.window_id, finding.unexplained_variance
        );
        Self {
            id: ProposalId::generate(),
            dimension_id,
            axiom,
            description,
            finding,
            proposed_at: chrono::Utc::now(),
        }
    }
}

/// True when the approvals reach the φ⁻¹ share of the voting panel.
pub fn vote_passes(approvals: usize, panel_size: usize) -> bool {
    if panel_size == 0 {
        return false;
    }
    approvals as f64 / panel_size as f64 >= CONSENSUS_QUORUM
}

/// One proposal's open ballot. A worker may change its vote until tally.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProposalBallot {
    pub proposal: DimensionProposal,
    votes: HashMap<WorkerId, bool>,
}

impl ProposalBallot {
    pub fn new(proposal: DimensionProposal) -> Self {
        Self {
            proposal,
            votes: HashMap::new(),
        }
    }

    pub fn cast(&mut self, worker: WorkerId, approve: bool) {
        self.votes.insert(worker, approve);
    }

    pub fn approvals(&self) -> usize {
        self.votes.values().filter(|v| **v).count()
    }

    /// Tally against the ORIGINAL panel size: non-voters count as rejections.
    pub fn adopted(&self, panel_size: usize) -> bool {
        let adopted = vote_passes(self.approvals(), panel_size);
        info!(
            proposal = %self.proposal.id,
            dimension = %self.proposal.dimension_id,
            approvals = self.approvals(),
            panel = panel_size,
            adopted = adopted,
            "Proposal tallied"
        );
        adopted
    }
}

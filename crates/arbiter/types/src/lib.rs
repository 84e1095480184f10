//! Arbiter Types - shared data model for the judgment engine
//!
//! Tasks go in, judgments come out, learning state adapts in between.
//! All thresholds derive from the φ constants in [`phi`].

#![deny(unsafe_code)]

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

pub mod phi;

use phi::{clamp_confidence, PHI, PHI_INV, PHI_INV_2};

/// Unique identifier for a task submitted for judgment.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId(pub String);

impl TaskId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a registered worker.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
pub struct WorkerId(pub String);

impl WorkerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a judgment.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JudgmentId(pub String);

impl JudgmentId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

/// Context class a task belongs to, used as the routing key.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContextClass(pub String);

impl ContextClass {
    pub fn new(class: impl Into<String>) -> Self {
        Self(class.into())
    }
}

impl fmt::Display for ContextClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An immutable unit of work submitted for judgment.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    /// Free-form tags; the first tag doubles as the routing context class.
    pub context_tags: Vec<String>,
    pub payload: serde_json::Value,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

impl Task {
    pub fn new(context_tags: Vec<String>, payload: serde_json::Value) -> Self {
        Self {
            id: TaskId::generate(),
            context_tags,
            payload,
            created_at: chrono::Utc::now(),
        }
    }

    /// Routing key for this task. Tasks with no tags share a default class.
    pub fn context_class(&self) -> ContextClass {
        ContextClass::new(
            self.context_tags
                .first()
                .map(String::as_str)
                .unwrap_or("default"),
        )
    }
}

/// A registered worker. The engine only reads capability metadata;
/// registration and lifecycle belong to the caller.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Worker {
    pub id: WorkerId,
    pub capability_tags: Vec<String>,
    /// Estimated cost per invocation, in caller-defined units.
    pub cost_estimate: f64,
}

impl Worker {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: WorkerId::new(id),
            capability_tags: vec![],
            cost_estimate: 1.0,
        }
    }

    pub fn with_capability(mut self, tag: impl Into<String>) -> Self {
        self.capability_tags.push(tag.into());
        self
    }

    pub fn with_cost(mut self, cost: f64) -> Self {
        self.cost_estimate = cost;
        self
    }
}

/// The five scoring axioms. Each groups seven weighted dimensions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Axiom {
    /// Factual and computational correctness.
    Accuracy,
    /// Internal structure and consistency.
    Coherence,
    /// Verifiability and provenance of claims.
    Evidence,
    /// Fit to the task context and constraints.
    Relevance,
    /// Cost discipline and simplicity.
    Economy,
}

impl Axiom {
    pub const ALL: [Axiom; phi::AXIOM_COUNT] = [
        Axiom::Accuracy,
        Axiom::Coherence,
        Axiom::Evidence,
        Axiom::Relevance,
        Axiom::Economy,
    ];
}

impl fmt::Display for Axiom {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Axiom::Accuracy => "accuracy",
            Axiom::Coherence => "coherence",
            Axiom::Evidence => "evidence",
            Axiom::Relevance => "relevance",
            Axiom::Economy => "economy",
        };
        write!(f, "{}", name)
    }
}

/// Identifier of a single scored dimension.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
pub struct DimensionId(pub String);

impl DimensionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl fmt::Display for DimensionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A scoring dimension: one facet of quality under one axiom.
///
/// The structural weight is fixed by position within the axiom:
/// positions 1 and 4 weigh φ, position 3 weighs 1.0, positions 2, 6 and 7
/// weigh φ⁻¹, position 5 weighs φ⁻². Identical template across all axioms.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Dimension {
    pub id: DimensionId,
    pub axiom: Axiom,
    /// 1-based position within the axiom, 1..=7.
    pub position: u8,
    pub description: String,
}

impl Dimension {
    /// Structural weight for this dimension's template position.
    pub fn weight(&self) -> f64 {
        template_weight(self.position)
    }
}

/// Fixed 7-position weight template shared by all axioms.
pub fn template_weight(position: u8) -> f64 {
    match position {
        1 | 4 => PHI,
        3 => 1.0,
        2 | 6 | 7 => PHI_INV,
        5 => PHI_INV_2,
        _ => 0.0,
    }
}

/// Verdict bands over the 0-100 q-score scale.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
pub enum Verdict {
    Poor,
    Marginal,
    Good,
    Excellent,
}

impl Verdict {
    /// Map a q-score to its verdict band.
    pub fn from_q_score(q_score: f64) -> Self {
        if q_score >= 80.0 {
            Verdict::Excellent
        } else if q_score >= 60.0 {
            Verdict::Good
        } else if q_score >= 40.0 {
            Verdict::Marginal
        } else {
            Verdict::Poor
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Verdict::Excellent => "EXCELLENT",
            Verdict::Good => "GOOD",
            Verdict::Marginal => "MARGINAL",
            Verdict::Poor => "POOR",
        };
        write!(f, "{}", name)
    }
}

/// Raw scoring input produced by one worker for one task.
///
/// Must carry a value in [0, 1] for every registered dimension; the scorer
/// rejects incomplete signals.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RawSignal {
    pub task_id: TaskId,
    pub worker_id: WorkerId,
    pub dimension_values: HashMap<DimensionId, f64>,
    /// Self-reported certainty before the φ⁻¹ clamp.
    pub raw_confidence: f64,
}

/// One worker's scored judgment of one task. Immutable once emitted.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Judgment {
    pub judgment_id: JudgmentId,
    pub task_id: TaskId,
    pub worker_id: WorkerId,
    pub dimension_scores: HashMap<DimensionId, f64>,
    /// Per-axiom weighted means, in [`Axiom::ALL`] order, each in [0, 1].
    pub axiom_scores: [f64; phi::AXIOM_COUNT],
    /// 100 × geometric mean of the axiom scores.
    pub q_score: f64,
    pub verdict: Verdict,
    /// Clamped to [0, φ⁻¹].
    pub confidence: f64,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

/// Outcome of consensus over a set of judgments.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ConsensusDecision {
    /// Quorum reached on this verdict.
    Settled(Verdict),
    /// No verdict reached the quorum. A valid terminal state, not an error.
    Undetermined,
}

/// Aggregated verdict over one task, owned by the request that created it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConsensusVerdict {
    pub task_id: TaskId,
    pub decision: ConsensusDecision,
    /// Mode-verdict share of the ORIGINAL worker count (abstentions included
    /// in the denominator).
    pub agreement_ratio: f64,
    pub contributing: Vec<Judgment>,
    /// Workers that missed the deadline or failed.
    pub abstained: Vec<WorkerId>,
    pub decided_at: chrono::DateTime<chrono::Utc>,
}

/// Key into the learning-state space: one (context class, worker) pair.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StateKey {
    pub context_class: ContextClass,
    pub worker_id: WorkerId,
}

impl StateKey {
    pub fn new(context_class: ContextClass, worker_id: WorkerId) -> Self {
        Self {
            context_class,
            worker_id,
        }
    }
}

impl fmt::Display for StateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.context_class, self.worker_id)
    }
}

/// Per-key bandit and Q-learning statistics.
///
/// Invariant: `alpha >= 1.0` and `beta >= 1.0` at all times. Entries are
/// never deleted, only updated through versioned compare-and-swap.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LearningState {
    /// Beta-distribution success count.
    pub alpha: f64,
    /// Beta-distribution failure count.
    pub beta: f64,
    /// TD estimate in [0, 1].
    pub q_value: f64,
    /// Pairwise-preference bonus in [0, φ⁻¹], kept apart from the TD
    /// estimate so the reward and preference loops never write the same
    /// field. Added to `q_value` at selection time.
    pub preference_bonus: f64,
    pub visit_count: u64,
    /// Importance weight in [0, 1]; high values slow further updates.
    pub fisher_importance: f64,
    /// CAS version, bumped on every successful write.
    pub version: u64,
}

impl LearningState {
    /// Fresh state: uniform Beta(1, 1) prior, neutral q-value.
    pub fn new() -> Self {
        Self {
            alpha: 1.0,
            beta: 1.0,
            q_value: 0.5,
            preference_bonus: 0.0,
            visit_count: 0,
            fisher_importance: 0.0,
            version: 0,
        }
    }

    /// Seed with explicit Beta parameters, clamped to the ≥ 1 invariant.
    pub fn seeded(alpha: f64, beta: f64) -> Self {
        Self {
            alpha: alpha.max(1.0),
            beta: beta.max(1.0),
            ..Self::new()
        }
    }

    /// Confidence in this entry: min(visits / F(8), φ⁻¹).
    pub fn confidence(&self) -> f64 {
        clamp_confidence(self.visit_count as f64 / phi::fibonacci(8) as f64)
    }
}

impl Default for LearningState {
    fn default() -> Self {
        Self::new()
    }
}

/// Unique identifier for a reported outcome, used for exactly-once delivery.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OutcomeId(pub String);

impl OutcomeId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

/// Ground-truth feedback for a (task, worker) pair, fed to the learning
/// manager after the fact.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OutcomeReport {
    pub outcome_id: OutcomeId,
    pub task_id: TaskId,
    pub worker_id: WorkerId,
    pub context_class: ContextClass,
    pub success: bool,
    /// Optional graded reward in [0, 1]; defaults to the success bit.
    pub reward: Option<f64>,
    pub reported_at: chrono::DateTime<chrono::Utc>,
}

impl OutcomeReport {
    pub fn new(
        task_id: TaskId,
        worker_id: WorkerId,
        context_class: ContextClass,
        success: bool,
    ) -> Self {
        Self {
            outcome_id: OutcomeId::generate(),
            task_id,
            worker_id,
            context_class,
            success,
            reward: None,
            reported_at: chrono::Utc::now(),
        }
    }

    pub fn with_reward(mut self, reward: f64) -> Self {
        self.reward = Some(reward.clamp(0.0, 1.0));
        self
    }

    /// Effective reward in [0, 1].
    pub fn effective_reward(&self) -> f64 {
        self.reward
            .unwrap_or(if self.success { 1.0 } else { 0.0 })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verdict_bands() {
        assert_eq!(Verdict::from_q_score(80.0), Verdict::Excellent);
        assert_eq!(Verdict::from_q_score(79.9), Verdict::Good);
        assert_eq!(Verdict::from_q_score(60.0), Verdict::Good);
        assert_eq!(Verdict::from_q_score(59.9), Verdict::Marginal);
        assert_eq!(Verdict::from_q_score(40.0), Verdict::Marginal);
        assert_eq!(Verdict::from_q_score(39.9), Verdict::Poor);
        assert_eq!(Verdict::from_q_score(0.0), Verdict::Poor);
    }

    #[test]
    fn test_template_weights() {
        assert_eq!(template_weight(1), PHI);
        assert_eq!(template_weight(2), PHI_INV);
        assert_eq!(template_weight(3), 1.0);
        assert_eq!(template_weight(4), PHI);
        assert_eq!(template_weight(5), PHI_INV_2);
        assert_eq!(template_weight(6), PHI_INV);
        assert_eq!(template_weight(7), PHI_INV);
    }

    #[test]
    fn test_learning_state_invariant() {
        let state = LearningState::seeded(0.0, -3.0);
        assert!(state.alpha >= 1.0);
        assert!(state.beta >= 1.0);
    }

    #[test]
    fn test_learning_state_confidence_capped() {
        let mut state = LearningState::new();
        state.visit_count = 1000;
        assert!(state.confidence() <= phi::MAX_CONFIDENCE);
    }

    #[test]
    fn test_task_context_class() {
        let task = Task::new(vec!["code".into(), "review".into()], serde_json::json!({}));
        assert_eq!(task.context_class(), ContextClass::new("code"));

        let untagged = Task::new(vec![], serde_json::json!({}));
        assert_eq!(untagged.context_class(), ContextClass::new("default"));
    }

    #[test]
    fn test_effective_reward() {
        let t = TaskId::generate();
        let ok = OutcomeReport::new(t.clone(), WorkerId::new("w"), ContextClass::new("c"), true);
        assert_eq!(ok.effective_reward(), 1.0);

        let graded = OutcomeReport::new(t, WorkerId::new("w"), ContextClass::new("c"), false)
            .with_reward(0.3);
        assert_eq!(graded.effective_reward(), 0.3);
    }
}

//! End-to-end pipeline tests: route, judge, learn, and adopt an emergent
//! dimension through the full engine facade.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use arbiter_consensus::{InvokeError, WorkerInvoker, WorkerResponse};
use arbiter_engine::{Arbiter, ArbiterConfig};
use arbiter_residual::ProposalBallot;
use arbiter_scorer::DimensionRegistry;
use arbiter_types::{
    ConsensusDecision, ContextClass, DimensionId, OutcomeReport, RawSignal, StateKey, Task,
    Verdict, Worker, WorkerId,
};
use async_trait::async_trait;

/// Invoker that answers every call with a uniform signal at a fixed value,
/// always against the seed dimension schema.
struct UniformInvoker {
    value: f64,
}

#[async_trait]
impl WorkerInvoker for UniformInvoker {
    async fn invoke(&self, worker: &WorkerId, task: &Task) -> Result<WorkerResponse, InvokeError> {
        let dimension_values: HashMap<DimensionId, f64> = DimensionRegistry::seed()
            .dimensions()
            .iter()
            .map(|d| (d.id.clone(), self.value))
            .collect();
        Ok(WorkerResponse::new(RawSignal {
            task_id: task.id.clone(),
            worker_id: worker.clone(),
            dimension_values,
            raw_confidence: 0.5,
        })
        .with_cost(1.0))
    }
}

fn workers() -> Vec<Worker> {
    vec![
        Worker::new("a").with_capability("code"),
        Worker::new("b").with_capability("code"),
        Worker::new("c"),
    ]
}

fn task() -> Task {
    Task::new(vec!["code".into()], serde_json::json!({"prompt": "review this"}))
}

async fn wait_for_visits(engine: &Arbiter, key: &StateKey, visits: u64) -> bool {
    for _ in 0..200 {
        if engine
            .store()
            .get(key)
            .map(|s| s.visit_count >= visits)
            .unwrap_or(false)
        {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    false
}

#[tokio::test]
async fn test_judge_settles_and_outcomes_reach_learning() {
    let engine = Arbiter::new(
        Arc::new(UniformInvoker { value: 0.9 }),
        ArbiterConfig::default(),
    );

    let task = task();
    let verdict = engine.judge(&task, &workers()).await.unwrap();
    assert_eq!(
        verdict.decision,
        ConsensusDecision::Settled(Verdict::Excellent)
    );
    assert_eq!(verdict.contributing.len(), 3);
    assert_eq!(verdict.agreement_ratio, 1.0);

    for judgment in &verdict.contributing {
        let report = OutcomeReport::new(
            task.id.clone(),
            judgment.worker_id.clone(),
            task.context_class(),
            true,
        );
        engine.report_outcome(report).await.unwrap();
    }

    // Learning is queued, not inline; wait for the manager to drain.
    let key = StateKey::new(ContextClass::new("code"), verdict.contributing[0].worker_id.clone());
    assert!(wait_for_visits(&engine, &key, 1).await);

    let state = engine.store().get(&key).unwrap();
    assert_eq!(state.alpha, 2.0);
    assert!(state.q_value > 0.5);
    assert!(engine.learning_stats().processed >= 1);
}

#[tokio::test]
async fn test_repeated_failures_surface_dimension_proposal() {
    let engine = Arbiter::new(
        Arc::new(UniformInvoker { value: 0.9 }),
        ArbiterConfig::default(),
    );
    let panel = workers();

    // Confident EXCELLENT judgments that keep failing in the real world:
    // exactly what the scored dimensions cannot explain.
    let mut proposal = None;
    for _ in 0..21 {
        let task = task();
        let verdict = engine.judge(&task, &panel).await.unwrap();
        let worker = verdict.contributing[0].worker_id.clone();
        let report =
            OutcomeReport::new(task.id.clone(), worker, task.context_class(), false)
                .with_reward(0.0);
        if let Some(p) = engine.report_outcome(report).await.unwrap() {
            proposal = Some(p);
        }
    }

    let proposal = proposal.expect("a closed residual window should propose a dimension");
    assert_eq!(proposal.dimension_id, DimensionId::new("relevance.code"));
    assert!(proposal.finding.unexplained_variance > 0.5);

    // Two approvals out of a three-worker panel clears the φ⁻¹ bar.
    let mut ballot = ProposalBallot::new(proposal);
    ballot.cast(WorkerId::new("a"), true);
    ballot.cast(WorkerId::new("b"), true);
    ballot.cast(WorkerId::new("c"), false);

    let version = engine.tally_proposal(&ballot, 3).unwrap();
    assert_eq!(version, Some(2));
    assert_eq!(engine.registry_version().unwrap(), 2);

    // Workers still emitting the old schema now fail validation, so the
    // panel abstains and nothing settles.
    let verdict = engine.judge(&task(), &panel).await.unwrap();
    assert_eq!(verdict.decision, ConsensusDecision::Undetermined);
    assert_eq!(verdict.abstained.len(), 3);
}

#[tokio::test]
async fn test_rejected_proposal_leaves_registry_alone() {
    let engine = Arbiter::new(
        Arc::new(UniformInvoker { value: 0.9 }),
        ArbiterConfig::default(),
    );

    let finding = arbiter_residual::ResidualFinding {
        window_id: 0,
        unexplained_variance: 0.7,
        severity: 0.5,
        pattern: None,
        dominant_tag: Some("latency".into()),
        observations: 21,
    };
    let proposal =
        arbiter_residual::DimensionProposal::from_finding(finding, arbiter_types::Axiom::Economy);

    // 3 of 5 approve: 0.6 < φ⁻¹.
    let mut ballot = ProposalBallot::new(proposal);
    for w in ["a", "b", "c"] {
        ballot.cast(WorkerId::new(w), true);
    }
    let version = engine.tally_proposal(&ballot, 5).unwrap();
    assert_eq!(version, None);
    assert_eq!(engine.registry_version().unwrap(), 1);
}

/// Invoker that fails every call, so every panel member abstains.
struct FailingInvoker;

#[async_trait]
impl WorkerInvoker for FailingInvoker {
    async fn invoke(&self, worker: &WorkerId, _task: &Task) -> Result<WorkerResponse, InvokeError> {
        Err(InvokeError::WorkerFailed(worker.0.clone()))
    }
}

#[tokio::test]
async fn test_abstention_reporting_never_blocks_judging() {
    // A one-slot outcome queue cannot hold three abstention reports at once;
    // judging must still return promptly instead of waiting on the learning
    // manager to drain.
    let engine = Arbiter::new(
        Arc::new(FailingInvoker),
        ArbiterConfig {
            queue_capacity: 1,
            ..ArbiterConfig::default()
        },
    );

    let verdict = tokio::time::timeout(Duration::from_secs(5), engine.judge(&task(), &workers()))
        .await
        .expect("judging stalled on the outcome queue")
        .unwrap();

    assert_eq!(verdict.decision, ConsensusDecision::Undetermined);
    assert_eq!(verdict.abstained.len(), 3);
}

#[tokio::test]
async fn test_pending_predictions_stay_bounded() {
    let engine = Arbiter::new(
        Arc::new(UniformInvoker { value: 0.9 }),
        ArbiterConfig {
            pending_capacity: 2,
            ..ArbiterConfig::default()
        },
    );

    // Judged tasks whose outcomes are never reported must not pile up.
    for _ in 0..10 {
        engine.judge(&task(), &workers()).await.unwrap();
    }
    assert!(engine.pending_predictions() <= 2);
}

#[tokio::test]
async fn test_outcomes_separate_good_and_bad_workers() {
    let engine = Arbiter::new(
        Arc::new(UniformInvoker { value: 0.9 }),
        ArbiterConfig::default().with_panel_size(2),
    );
    let ctx = ContextClass::new("code");
    let panel = vec![Worker::new("good"), Worker::new("bad")];

    for _ in 0..15 {
        let task = task();
        engine.judge(&task, &panel).await.unwrap();
        engine
            .report_outcome(OutcomeReport::new(
                task.id.clone(),
                WorkerId::new("good"),
                ctx.clone(),
                true,
            ))
            .await
            .unwrap();
        engine
            .report_outcome(OutcomeReport::new(
                task.id,
                WorkerId::new("bad"),
                ctx.clone(),
                false,
            ))
            .await
            .unwrap();
    }

    let good_key = StateKey::new(ctx.clone(), WorkerId::new("good"));
    let bad_key = StateKey::new(ctx, WorkerId::new("bad"));
    assert!(wait_for_visits(&engine, &good_key, 15).await);
    assert!(wait_for_visits(&engine, &bad_key, 15).await);

    let good = engine.store().get(&good_key).unwrap();
    let bad = engine.store().get(&bad_key).unwrap();
    assert!(good.alpha > bad.alpha);
    assert!(good.q_value > bad.q_value);
}

//! Arbiter engine facade.
//!
//! Wires the judgment pipeline together: the bandit router picks a panel,
//! the consensus engine fans the task out and aggregates verdicts, outcome
//! reports flow through a queue into the learning manager, and the residual
//! detector watches what the current dimensions fail to explain.

#![deny(unsafe_code)]

use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

use arbiter_consensus::{ConsensusConfig, ConsensusEngine, ConsensusError, WorkerInvoker};
use arbiter_learning::{LearningConfig, LearningManager, LearningStats};
use arbiter_residual::{
    DimensionProposal, ProposalBallot, ResidualConfig, ResidualDetector, ResidualObservation,
};
use arbiter_router::{
    BanditRouter, ExplorationControl, InMemoryLearningStore, LearningStore, RouteError,
};
use arbiter_scorer::{DimensionRegistry, DimensionScorer, RegistryError, SharedRegistry};
use arbiter_types::{Axiom, ConsensusVerdict, OutcomeReport, Task, TaskId, Worker, WorkerId};
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Engine-level errors.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Route(#[from] RouteError),

    #[error(transparent)]
    Consensus(#[from] ConsensusError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("Outcome queue closed")]
    QueueClosed,

    #[error("Lock error")]
    LockError,
}

/// Top-level engine tuning.
#[derive(Clone, Debug)]
pub struct ArbiterConfig {
    /// Workers per consensus panel.
    pub panel_size: usize,
    /// Outcome queue depth between judging and learning.
    pub queue_capacity: usize,
    /// Predictions awaiting an outcome report; judging evicts past this.
    pub pending_capacity: usize,
    /// Age past which an unreported prediction may be evicted.
    pub pending_ttl: Duration,
    pub consensus: ConsensusConfig,
    pub learning: LearningConfig,
    pub residual: ResidualConfig,
}

impl Default for ArbiterConfig {
    fn default() -> Self {
        Self {
            panel_size: 3,
            queue_capacity: 1024,
            pending_capacity: 4096,
            pending_ttl: Duration::from_secs(600),
            consensus: ConsensusConfig::default(),
            learning: LearningConfig::default(),
            residual: ResidualConfig::default(),
        }
    }
}

impl ArbiterConfig {
    pub fn with_panel_size(mut self, panel_size: usize) -> Self {
        self.panel_size = panel_size.max(1);
        self
    }
}

struct PendingPrediction {
    context_tags: Vec<String>,
    predicted: f64,
    recorded_at: Instant,
}

/// The judgment-and-routing engine.
///
/// Judging is synchronous with respect to the caller; learning runs on its
/// own task fed by a bounded queue and never blocks a judgment.
pub struct Arbiter {
    registry: SharedRegistry,
    router: BanditRouter,
    consensus: ConsensusEngine,
    learning: Arc<LearningManager>,
    residual: ResidualDetector,
    store: Arc<dyn LearningStore>,
    exploration: Arc<ExplorationControl>,
    outcome_tx: mpsc::Sender<OutcomeReport>,
    pending: DashMap<TaskId, PendingPrediction>,
    pending_capacity: usize,
    pending_ttl: Duration,
    learning_task: tokio::task::JoinHandle<()>,
    panel_size: usize,
}

impl Arbiter {
    /// Build an engine over an in-memory learning store.
    ///
    /// Must be called within a tokio runtime; the learning manager is
    /// spawned immediately.
    pub fn new(invoker: Arc<dyn WorkerInvoker>, config: ArbiterConfig) -> Self {
        Self::with_store(invoker, Arc::new(InMemoryLearningStore::new()), config)
    }

    /// Build an engine over an external learning store.
    pub fn with_store(
        invoker: Arc<dyn WorkerInvoker>,
        store: Arc<dyn LearningStore>,
        config: ArbiterConfig,
    ) -> Self {
        let registry: SharedRegistry = Arc::new(RwLock::new(DimensionRegistry::seed()));
        let scorer = Arc::new(DimensionScorer::new(Arc::clone(&registry)));
        let exploration = Arc::new(ExplorationControl::new());

        let router = BanditRouter::new(Arc::clone(&store), Arc::clone(&exploration));
        let consensus = ConsensusEngine::new(invoker, scorer, config.consensus.clone());
        let learning = Arc::new(LearningManager::new(
            Arc::clone(&store),
            Arc::clone(&exploration),
            config.learning.clone(),
        ));
        let residual = ResidualDetector::new(config.residual.clone());

        let (outcome_tx, outcome_rx) = mpsc::channel(config.queue_capacity);
        let learning_task = tokio::spawn(Arc::clone(&learning).run(outcome_rx));

        info!(panel_size = config.panel_size, "Arbiter engine started");
        Self {
            registry,
            router,
            consensus,
            learning,
            residual,
            store,
            exploration,
            outcome_tx,
            pending: DashMap::new(),
            pending_capacity: config.pending_capacity.max(1),
            pending_ttl: config.pending_ttl,
            learning_task,
            panel_size: config.panel_size,
        }
    }

    /// Pick a single worker for a task from the candidate set.
    pub fn route(&self, task: &Task, candidates: &[Worker]) -> Result<WorkerId, EngineError> {
        let eligible = eligible_ids(task, candidates);
        Ok(self.router.select(&task.context_class(), &eligible)?)
    }

    /// Judge a task: route a panel, fan out, aggregate under the φ⁻¹ quorum.
    pub async fn judge(
        &self,
        task: &Task,
        candidates: &[Worker],
    ) -> Result<ConsensusVerdict, EngineError> {
        let context = task.context_class();
        let mut pool = eligible_ids(task, candidates);
        if pool.is_empty() {
            return Err(RouteError::NoEligibleWorker(context.0.clone()).into());
        }
        let mut panel = Vec::with_capacity(self.panel_size.min(pool.len()));

        while panel.len() < self.panel_size && !pool.is_empty() {
            let picked = self.router.select(&context, &pool)?;
            pool.retain(|w| *w != picked);
            panel.push(picked);
        }

        let verdict = self.consensus.judge(task, &panel).await?;

        // An abstention is a failure for the worker that missed the call.
        // Judging never waits on the learning queue; a full queue drops the
        // report instead of stalling the caller.
        for worker in &verdict.abstained {
            let report =
                OutcomeReport::new(task.id.clone(), worker.clone(), context.clone(), false);
            if let Err(e) = self.outcome_tx.try_send(report) {
                warn!(worker = %worker, error = %e, "Abstention not recorded");
            }
        }

        if !verdict.contributing.is_empty() {
            let predicted = verdict
                .contributing
                .iter()
                .map(|j| j.q_score)
                .sum::<f64>()
                / (100.0 * verdict.contributing.len() as f64);
            self.evict_stale_pending();
            self.pending.insert(
                task.id.clone(),
                PendingPrediction {
                    context_tags: task.context_tags.clone(),
                    predicted,
                    recorded_at: Instant::now(),
                },
            );
        }

        Ok(verdict)
    }

    /// Keep the pending-prediction map bounded: tasks whose outcome never
    /// arrives are dropped once they age out, and at capacity the oldest
    /// entry makes room for the new one.
    fn evict_stale_pending(&self) {
        if self.pending.len() < self.pending_capacity {
            return;
        }
        let ttl = self.pending_ttl;
        self.pending.retain(|_, p| p.recorded_at.elapsed() < ttl);
        if self.pending.len() < self.pending_capacity {
            return;
        }
        let oldest = self
            .pending
            .iter()
            .min_by_key(|entry| entry.value().recorded_at)
            .map(|entry| entry.key().clone());
        if let Some(task_id) = oldest {
            debug!(task_id = %task_id, "Pending prediction evicted at capacity");
            self.pending.remove(&task_id);
        }
    }

    /// Report ground truth for a judged task.
    ///
    /// Queues the report for the learning loops and feeds the residual
    /// detector; a closed window above the emergence threshold comes back as
    /// a ready-to-vote dimension proposal.
    pub async fn report_outcome(
        &self,
        report: OutcomeReport,
    ) -> Result<Option<DimensionProposal>, EngineError> {
        let pending = self.pending.remove(&report.task_id).map(|(_, p)| p);
        let actual = report.effective_reward();
        let task_id = report.task_id.clone();

        self.outcome_tx
            .send(report)
            .await
            .map_err(|_| EngineError::QueueClosed)?;

        let pending = match pending {
            Some(p) => p,
            None => {
                debug!(task_id = %task_id, "Outcome for unjudged task, skipping residual");
                return Ok(None);
            }
        };

        let finding = self.residual.observe(ResidualObservation {
            task_id,
            context_tags: pending.context_tags,
            predicted: pending.predicted,
            actual,
        });

        Ok(finding.map(|f| {
            warn!(
                window_id = f.window_id,
                unexplained_variance = f.unexplained_variance,
                "Residual finding, drafting dimension proposal"
            );
            // Unexplained residuals are context-shaped, so the candidate
            // enters under Relevance; the ballot carries the full finding
            // and a different axiom can be chosen before the vote.
            DimensionProposal::from_finding(f, Axiom::Relevance)
        }))
    }

    /// Tally a proposal ballot against the original panel size; adoption
    /// appends the dimension as a new registry version.
    pub fn tally_proposal(
        &self,
        ballot: &ProposalBallot,
        panel_size: usize,
    ) -> Result<Option<u64>, EngineError> {
        if !ballot.adopted(panel_size) {
            return Ok(None);
        }
        let mut registry = self.registry.write().map_err(|_| EngineError::LockError)?;
        let version = registry.append(
            ballot.proposal.dimension_id.clone(),
            ballot.proposal.axiom,
            ballot.proposal.description.clone(),
        )?;
        Ok(Some(version))
    }

    pub fn registry_version(&self) -> Result<u64, EngineError> {
        Ok(self
            .registry
            .read()
            .map_err(|_| EngineError::LockError)?
            .version())
    }

    pub fn learning_stats(&self) -> LearningStats {
        self.learning.stats()
    }

    /// Judged tasks still waiting for an outcome report.
    pub fn pending_predictions(&self) -> usize {
        self.pending.len()
    }

    pub fn exploration_floor(&self) -> f64 {
        self.exploration.floor()
    }

    pub fn store(&self) -> Arc<dyn LearningStore> {
        Arc::clone(&self.store)
    }
}

impl Drop for Arbiter {
    fn drop(&mut self) {
        self.learning_task.abort();
    }
}

impl std::fmt::Debug for Arbiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Arbiter")
            .field("panel_size", &self.panel_size)
            .field(
                "registry_version",
                &self
                    .registry
                    .read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .version(),
            )
            .finish()
    }
}

/// Workers eligible for a task: untagged generalists, or any worker sharing
/// a capability tag with the task's context tags.
fn eligible_ids(task: &Task, candidates: &[Worker]) -> Vec<WorkerId> {
    candidates
        .iter()
        .filter(|w| {
            w.capability_tags.is_empty()
                || w.capability_tags
                    .iter()
                    .any(|t| task.context_tags.contains(t))
        })
        .map(|w| w.id.clone())
        .collect()
}

//! Arbiter Consensus Engine - parallel judgment with quorum aggregation
//!
//! Fans a task out to a panel of workers, scores whatever comes back before
//! the deadline, and settles on a verdict only when the leading verdict's
//! share of the ORIGINAL panel reaches the φ⁻¹ quorum. Anything less is
//! `Undetermined`, a valid terminal state rather than an error.

#![deny(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use arbiter_scorer::DimensionScorer;
use arbiter_types::phi::CONSENSUS_QUORUM;
use arbiter_types::{
    ConsensusDecision, ConsensusVerdict, Judgment, RawSignal, Task, Verdict, WorkerId,
};
use async_trait::async_trait;
use thiserror::Error;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// What a worker invocation returns: the raw signal plus its price tag.
#[derive(Clone, Debug)]
pub struct WorkerResponse {
    pub signal: RawSignal,
    /// Cost of the invocation, in caller-defined units.
    pub cost: f64,
    pub latency: Duration,
}

impl WorkerResponse {
    pub fn new(signal: RawSignal) -> Self {
        Self {
            signal,
            cost: 0.0,
            latency: Duration::ZERO,
        }
    }

    pub fn with_cost(mut self, cost: f64) -> Self {
        self.cost = cost;
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }
}

/// Seam to whatever actually runs a worker against a task.
///
/// Implementations must be cancellation-safe: `judge` aborts outstanding
/// invocations once the outcome is mathematically settled.
#[async_trait]
pub trait WorkerInvoker: Send + Sync + 'static {
    async fn invoke(&self, worker: &WorkerId, task: &Task) -> Result<WorkerResponse, InvokeError>;
}

/// Failure inside a single worker invocation. Never fails the panel;
/// the worker is recorded as abstained.
#[derive(Debug, Error)]
pub enum InvokeError {
    #[error("Worker failed: {0}")]
    WorkerFailed(String),

    #[error("Worker unavailable: {0}")]
    Unavailable(String),
}

/// Panel-level errors.
#[derive(Debug, Error)]
pub enum ConsensusError {
    #[error("Cannot judge with an empty worker panel")]
    EmptyPanel,
}

/// Tuning knobs for a consensus round.
#[derive(Clone, Debug)]
pub struct ConsensusConfig {
    /// Per-invocation deadline; a miss becomes an abstention.
    pub deadline: Duration,
    /// Agreement share of the original panel needed to settle.
    pub quorum: f64,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            deadline: Duration::from_secs(10),
            quorum: CONSENSUS_QUORUM,
        }
    }
}

impl ConsensusConfig {
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }
}

/// A worker invocation either beats the deadline or times out; inside the
/// deadline it either yields a response or a failure.
type InvocationResult = Result<Result<WorkerResponse, InvokeError>, tokio::time::error::Elapsed>;

/// Running state of one consensus round.
struct RoundTally {
    contributing: Vec<Judgment>,
    abstained: Vec<WorkerId>,
    counts: HashMap<Verdict, usize>,
}

impl RoundTally {
    fn new(panel_size: usize) -> Self {
        Self {
            contributing: Vec::with_capacity(panel_size),
            abstained: Vec::new(),
            counts: HashMap::new(),
        }
    }
}

/// Runs consensus rounds: invoke in parallel, score, aggregate.
pub struct ConsensusEngine {
    invoker: Arc<dyn WorkerInvoker>,
    scorer: Arc<DimensionScorer>,
    config: ConsensusConfig,
}

impl ConsensusEngine {
    pub fn new(
        invoker: Arc<dyn WorkerInvoker>,
        scorer: Arc<DimensionScorer>,
        config: ConsensusConfig,
    ) -> Self {
        Self {
            invoker,
            scorer,
            config,
        }
    }

    /// Judge one task with the given panel.
    ///
    /// Abstentions (timeout, invocation failure, invalid signal) stay in the
    /// agreement denominator: a panel of 5 with one abstention needs the
    /// leading verdict to carry ≥ φ⁻¹ of 5, not of 4. Once the leader cannot
    /// be overtaken by any outstanding vote, results that already finished
    /// are still absorbed, then the rest are cancelled; anything that slips
    /// in after the cutoff is logged for learning and excluded from the
    /// verdict.
    pub async fn judge(
        &self,
        task: &Task,
        panel: &[WorkerId],
    ) -> Result<ConsensusVerdict, ConsensusError> {
        if panel.is_empty() {
            return Err(ConsensusError::EmptyPanel);
        }
        let original_count = panel.len();

        let mut in_flight = JoinSet::new();
        for worker in panel {
            let invoker = Arc::clone(&self.invoker);
            let worker = worker.clone();
            let task = task.clone();
            let deadline = self.config.deadline;
            in_flight.spawn(async move {
                let result = tokio::time::timeout(deadline, invoker.invoke(&worker, &task)).await;
                (worker, result)
            });
        }

        let mut tally = RoundTally::new(original_count);

        while let Some(joined) = in_flight.join_next().await {
            let (worker, result) = match joined {
                Ok(pair) => pair,
                // A panicked invocation task is an abstention we cannot
                // attribute to a worker id; it still shrinks the numerator.
                Err(e) => {
                    warn!(task_id = %task.id, error = %e, "Invocation task failed");
                    continue;
                }
            };
            self.absorb(task, worker, result, &mut tally);

            let settled = tally.contributing.len() + tally.abstained.len();
            let remaining = original_count - settled;
            if remaining > 0 && self.unbeatable(&tally.counts, remaining, original_count) {
                debug!(task_id = %task.id, remaining = remaining,
                       "Consensus settled early, cancelling outstanding invocations");
                // Whatever already finished still counts; only work that is
                // genuinely in flight gets cancelled.
                while let Some(done) = in_flight.try_join_next() {
                    match done {
                        Ok((worker, result)) => self.absorb(task, worker, result, &mut tally),
                        Err(e) => {
                            warn!(task_id = %task.id, error = %e, "Invocation task failed")
                        }
                    }
                }
                in_flight.abort_all();
                self.drain_late(task, in_flight).await;
                break;
            }
        }

        let verdict = self.aggregate(task, original_count, tally.contributing, tally.abstained);
        Ok(verdict)
    }

    /// Fold one invocation result into the running tally.
    fn absorb(
        &self,
        task: &Task,
        worker: WorkerId,
        result: InvocationResult,
        tally: &mut RoundTally,
    ) {
        match result {
            Ok(Ok(response)) => match self.scorer.score(&response.signal) {
                Ok(judgment) => {
                    debug!(
                        task_id = %task.id,
                        worker = %worker,
                        cost = response.cost,
                        latency_ms = response.latency.as_millis() as u64,
                        verdict = %judgment.verdict,
                        "Worker judged"
                    );
                    *tally.counts.entry(judgment.verdict).or_insert(0) += 1;
                    tally.contributing.push(judgment);
                }
                Err(e) => {
                    warn!(task_id = %task.id, worker = %worker, error = %e,
                          "Signal rejected, worker abstains");
                    tally.abstained.push(worker);
                }
            },
            Ok(Err(e)) => {
                warn!(task_id = %task.id, worker = %worker, error = %e,
                      "Worker failed, abstaining");
                tally.abstained.push(worker);
            }
            Err(_) => {
                warn!(task_id = %task.id, worker = %worker,
                      deadline_ms = self.config.deadline.as_millis() as u64,
                      "Worker missed deadline, abstaining");
                tally.abstained.push(worker);
            }
        }
    }

    /// Consume what remains of an aborted round. A result that raced the
    /// abort is logged for learning; it never reaches the verdict.
    async fn drain_late(&self, task: &Task, mut in_flight: JoinSet<(WorkerId, InvocationResult)>) {
        while let Some(joined) = in_flight.join_next().await {
            match joined {
                Ok((worker, Ok(Ok(response)))) => match self.scorer.score(&response.signal) {
                    Ok(judgment) => {
                        info!(
                            task_id = %task.id,
                            worker = %worker,
                            q_score = judgment.q_score,
                            verdict = %judgment.verdict,
                            "Late judgment logged, excluded from verdict"
                        );
                    }
                    Err(e) => {
                        debug!(task_id = %task.id, worker = %worker, error = %e,
                               "Late signal rejected");
                    }
                },
                Ok((worker, _)) => {
                    debug!(task_id = %task.id, worker = %worker,
                           "Late invocation produced no judgment");
                }
                Err(e) if e.is_cancelled() => {
                    debug!(task_id = %task.id, "Invocation cancelled");
                }
                Err(e) => {
                    warn!(task_id = %task.id, error = %e, "Invocation task failed");
                }
            }
        }
    }

    /// True when the leading verdict holds quorum and no outstanding vote
    /// can overtake or tie it.
    fn unbeatable(
        &self,
        counts: &HashMap<Verdict, usize>,
        remaining: usize,
        original_count: usize,
    ) -> bool {
        let mut sorted: Vec<usize> = counts.values().copied().collect();
        sorted.sort_unstable_by(|a, b| b.cmp(a));
        let leader = match sorted.first() {
            Some(&n) => n,
            None => return false,
        };
        let runner_up = sorted.get(1).copied().unwrap_or(0);

        let ratio = leader as f64 / original_count as f64;
        ratio >= self.config.quorum && leader > runner_up + remaining
    }

    fn aggregate(
        &self,
        task: &Task,
        original_count: usize,
        contributing: Vec<Judgment>,
        abstained: Vec<WorkerId>,
    ) -> ConsensusVerdict {
        let (decision, agreement_ratio) =
            match leading_group(&contributing) {
                Some((verdict, count, _mean_q)) => {
                    let ratio = count as f64 / original_count as f64;
                    if ratio >= self.config.quorum {
                        (ConsensusDecision::Settled(verdict), ratio)
                    } else {
                        (ConsensusDecision::Undetermined, ratio)
                    }
                }
                None => (ConsensusDecision::Undetermined, 0.0),
            };

        info!(
            task_id = %task.id,
            decision = ?decision,
            agreement_ratio = agreement_ratio,
            contributing = contributing.len(),
            abstained = abstained.len(),
            panel = original_count,
            "Consensus round complete"
        );

        ConsensusVerdict {
            task_id: task.id.clone(),
            decision,
            agreement_ratio,
            contributing,
            abstained,
            decided_at: chrono::Utc::now(),
        }
    }
}

/// Largest verdict group with its size and mean q-score.
///
/// Groups tied on size are broken by higher mean q-score, so the reported
/// leader is deterministic even when no group reaches quorum.
pub fn leading_group(judgments: &[Judgment]) -> Option<(Verdict, usize, f64)> {
    let mut groups: HashMap<Verdict, (usize, f64)> = HashMap::new();
    for j in judgments {
        let entry = groups.entry(j.verdict).or_insert((0, 0.0));
        entry.0 += 1;
        entry.1 += j.q_score;
    }

    groups
        .into_iter()
        .map(|(verdict, (count, q_sum))| (verdict, count, q_sum / count as f64))
        .max_by(|a, b| {
            a.1.cmp(&b.1)
                .then(a.2.partial_cmp(&b.2).unwrap_or(std::cmp::Ordering::Equal))
        })
}

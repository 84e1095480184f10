//! Arbiter Continual Learning Manager
//!
//! Consumes outcome reports from a queue and runs six independent
//! adaptation loops over the learning state: reward/TD updates, preference
//! learning, confidence calibration, knowledge consolidation, strategy
//! adaptation, and meta-control of the learning rate. Each loop sits behind
//! its own circuit breaker, so a sick loop degrades alone. Judging never
//! waits on any of this.
//!
//! Each loop owns a disjoint slice of [`LearningState`]: reward writes
//! `alpha`/`beta`/`q_value`/`visit_count`, preference writes
//! `preference_bonus`, consolidation writes `fisher_importance`. Strategy
//! and calibration own manager-local state (a reset flag the reward loop
//! honors, the calibration window) and meta-control owns the learning rate,
//! so no two loops ever write the same field.

#![deny(unsafe_code)]

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use arbiter_router::{ExplorationControl, LearningStore};
use arbiter_types::phi::{fibonacci, PHI_INV, PHI_INV_2};
use arbiter_types::{ContextClass, LearningState, OutcomeId, OutcomeReport, StateKey, WorkerId};
use dashmap::{DashMap, DashSet};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub mod breaker;
pub mod calibration;
pub mod update;

pub use breaker::{BreakerConfig, BreakerStats, CircuitBreaker, CircuitState};
pub use calibration::{CalibrationConfig, CalibrationMonitor, CalibrationReport};
pub use update::{apply_outcome, UpdateParams};

/// The six adaptation loops. Each owns a disjoint slice of the work and
/// fails independently.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoopKind {
    Reward = 0,
    Preference = 1,
    Calibration = 2,
    Consolidation = 3,
    Strategy = 4,
    MetaControl = 5,
}

impl LoopKind {
    pub const ALL: [LoopKind; 6] = [
        LoopKind::Reward,
        LoopKind::Preference,
        LoopKind::Calibration,
        LoopKind::Consolidation,
        LoopKind::Strategy,
        LoopKind::MetaControl,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            LoopKind::Reward => "reward",
            LoopKind::Preference => "preference",
            LoopKind::Calibration => "calibration",
            LoopKind::Consolidation => "consolidation",
            LoopKind::Strategy => "strategy",
            LoopKind::MetaControl => "meta-control",
        }
    }
}

/// Learning errors. Loop failures trip breakers instead of propagating to
/// the judging path.
#[derive(Debug, Error)]
pub enum LearnError {
    #[error("Learning store write contention on {0}")]
    WriteContention(String),
}

/// Manager tuning.
#[derive(Clone, Debug)]
pub struct LearningConfig {
    /// CAS retries before a write counts as a loop failure.
    pub cas_retries: u32,
    pub breaker: BreakerConfig,
    pub calibration: CalibrationConfig,
    /// Outcomes per context before the strategy loop evaluates.
    pub strategy_window: usize,
    /// Context success rate below which the Beta posterior is softly reset.
    pub strategy_floor: f64,
    /// Outcome ids remembered per dedup generation; two generations are
    /// kept, so duplicates are caught within the last `2 * dedup_capacity`
    /// distinct outcomes while memory stays bounded.
    pub dedup_capacity: usize,
}

impl Default for LearningConfig {
    fn default() -> Self {
        Self {
            cas_retries: 5,
            breaker: BreakerConfig::default(),
            calibration: CalibrationConfig::default(),
            strategy_window: fibonacci(8) as usize,
            strategy_floor: PHI_INV_2,
            dedup_capacity: 8192,
        }
    }
}

/// Snapshot of manager health.
#[derive(Debug)]
pub struct LearningStats {
    pub processed: u64,
    pub duplicates_dropped: u64,
    /// Outcome ids currently held for duplicate detection.
    pub dedup_entries: usize,
    pub learning_rate: f64,
    pub breakers: Vec<BreakerStats>,
    pub calibration: CalibrationReport,
}

/// Generational set of recently seen outcome ids.
///
/// At capacity the current generation becomes the previous one and the
/// previous is discarded, so membership covers the most recent outcomes
/// without growing forever.
struct RecentOutcomes {
    capacity: usize,
    generations: Mutex<(HashSet<OutcomeId>, HashSet<OutcomeId>)>,
}

impl RecentOutcomes {
    fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            generations: Mutex::new((HashSet::new(), HashSet::new())),
        }
    }

    /// True when the id has not been seen in either generation.
    fn insert(&self, id: &OutcomeId) -> bool {
        let mut generations = self
            .generations
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let (current, previous) = &mut *generations;
        if current.contains(id) || previous.contains(id) {
            return false;
        }
        if current.len() >= self.capacity {
            *previous = std::mem::take(current);
        }
        current.insert(id.clone());
        true
    }

    fn len(&self) -> usize {
        let generations = self
            .generations
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        generations.0.len() + generations.1.len()
    }
}

/// Owns all writes to the learning state.
pub struct LearningManager {
    store: Arc<dyn LearningStore>,
    calibration: CalibrationMonitor,
    breakers: [CircuitBreaker; 6],
    seen: RecentOutcomes,
    last_by_context: DashMap<ContextClass, OutcomeReport>,
    strategy_windows: DashMap<ContextClass, VecDeque<bool>>,
    best_q_by_context: DashMap<ContextClass, f64>,
    pending_resets: DashSet<ContextClass>,
    processed: AtomicU64,
    duplicates: AtomicU64,
    learning_rate_bits: AtomicU64,
    config: LearningConfig,
}

impl LearningManager {
    pub fn new(
        store: Arc<dyn LearningStore>,
        exploration: Arc<ExplorationControl>,
        config: LearningConfig,
    ) -> Self {
        let breakers = LoopKind::ALL
            .map(|kind| CircuitBreaker::new(kind.name(), config.breaker.clone()));
        Self {
            store,
            calibration: CalibrationMonitor::new(config.calibration.clone(), exploration),
            breakers,
            seen: RecentOutcomes::new(config.dedup_capacity),
            last_by_context: DashMap::new(),
            strategy_windows: DashMap::new(),
            best_q_by_context: DashMap::new(),
            pending_resets: DashSet::new(),
            processed: AtomicU64::new(0),
            duplicates: AtomicU64::new(0),
            learning_rate_bits: AtomicU64::new(PHI_INV.to_bits()),
            config,
        }
    }

    /// Current meta-controlled TD learning rate.
    pub fn learning_rate(&self) -> f64 {
        f64::from_bits(self.learning_rate_bits.load(Ordering::Relaxed))
    }

    /// Drain an outcome queue until all senders drop.
    pub async fn run(self: Arc<Self>, mut outcomes: mpsc::Receiver<OutcomeReport>) {
        info!("Learning manager started");
        while let Some(report) = outcomes.recv().await {
            self.handle(&report);
        }
        info!("Learning manager stopped");
    }

    /// Process one outcome through every healthy loop. Exactly-once per
    /// outcome id: duplicates are dropped before any state changes.
    pub fn handle(&self, report: &OutcomeReport) {
        if !self.seen.insert(&report.outcome_id) {
            self.duplicates.fetch_add(1, Ordering::Relaxed);
            debug!(outcome_id = ?report.outcome_id, "Duplicate outcome dropped");
            return;
        }

        self.guarded(LoopKind::Reward, || self.reward_step(report));
        self.guarded(LoopKind::Preference, || self.preference_step(report));
        self.guarded(LoopKind::Calibration, || self.calibration_step(report));
        self.guarded(LoopKind::Consolidation, || self.consolidation_step(report));
        self.guarded(LoopKind::Strategy, || self.strategy_step(report));
        self.guarded(LoopKind::MetaControl, || self.meta_step());
    }

    pub fn stats(&self) -> LearningStats {
        LearningStats {
            processed: self.processed.load(Ordering::Relaxed),
            duplicates_dropped: self.duplicates.load(Ordering::Relaxed),
            dedup_entries: self.seen.len(),
            learning_rate: self.learning_rate(),
            breakers: self.breakers.iter().map(|b| b.stats()).collect(),
            calibration: self.calibration.report(),
        }
    }

    pub fn breaker(&self, kind: LoopKind) -> &CircuitBreaker {
        &self.breakers[kind as usize]
    }

    fn guarded(&self, kind: LoopKind, step: impl FnOnce() -> Result<(), LearnError>) {
        let breaker = &self.breakers[kind as usize];
        if !breaker.allow() {
            debug!(loop_name = kind.name(), "Loop breaker open, skipping");
            return;
        }
        match step() {
            Ok(()) => breaker.record_success(),
            Err(e) => {
                warn!(loop_name = kind.name(), error = %e, "Learning loop step failed");
                breaker.record_failure();
            }
        }
    }

    /// Read-modify-CAS with bounded retries.
    fn mutate(
        &self,
        key: &StateKey,
        f: impl Fn(&LearningState) -> LearningState,
    ) -> Result<LearningState, LearnError> {
        for _ in 0..self.config.cas_retries {
            let current = self.store.get(key).unwrap_or_default();
            let next = f(&current);
            if self.store.compare_and_swap(key, current.version, next.clone()) {
                return Ok(next);
            }
        }
        Err(LearnError::WriteContention(key.to_string()))
    }

    /// Owns `alpha`, `beta`, `q_value` and `visit_count`. A soft reset
    /// requested by the strategy loop is applied here, on the context's next
    /// outcome, so the posterior only ever has one writer.
    fn reward_step(&self, report: &OutcomeReport) -> Result<(), LearnError> {
        let key = StateKey::new(report.context_class.clone(), report.worker_id.clone());
        let reset = self.pending_resets.remove(&report.context_class).is_some();
        let max_q_next = self
            .best_q_by_context
            .get(&report.context_class)
            .map(|e| *e)
            .unwrap_or(0.5);
        let params = UpdateParams {
            learning_rate: self.learning_rate(),
            ..UpdateParams::default()
        };

        let next = self.mutate(&key, |state| {
            let mut state = state.clone();
            if reset {
                state.alpha = 1.0 + (state.alpha - 1.0) * PHI_INV;
                state.beta = 1.0 + (state.beta - 1.0) * PHI_INV;
            }
            apply_outcome(
                &state,
                report.success,
                report.effective_reward(),
                max_q_next,
                params,
            )
        })?;

        self.best_q_by_context
            .entry(report.context_class.clone())
            .and_modify(|best| *best = best.max(next.q_value))
            .or_insert(next.q_value);

        debug!(
            key = %key,
            q_value = next.q_value,
            alpha = next.alpha,
            beta = next.beta,
            "Reward update applied"
        );
        Ok(())
    }

    /// Pair this outcome with the previous one in the same context; when the
    /// workers differ, the better-rewarded worker earns a φ⁻²-scaled bonus.
    /// Owns `preference_bonus` and nothing else; the TD estimate belongs to
    /// the reward loop.
    fn preference_step(&self, report: &OutcomeReport) -> Result<(), LearnError> {
        let previous = self
            .last_by_context
            .insert(report.context_class.clone(), report.clone());

        let previous = match previous {
            Some(p) if p.worker_id != report.worker_id => p,
            _ => return Ok(()),
        };

        let margin = report.effective_reward() - previous.effective_reward();
        if margin == 0.0 {
            return Ok(());
        }
        let (winner, win_margin): (&WorkerId, f64) = if margin > 0.0 {
            (&report.worker_id, margin)
        } else {
            (&previous.worker_id, -margin)
        };

        let key = StateKey::new(report.context_class.clone(), winner.clone());
        let bonus = PHI_INV_2 * win_margin;
        self.mutate(&key, |state| {
            let mut next = state.clone();
            next.preference_bonus = (next.preference_bonus + bonus).clamp(0.0, PHI_INV);
            next
        })?;

        debug!(key = %key, bonus = bonus, "Preference bonus applied");
        Ok(())
    }

    fn calibration_step(&self, report: &OutcomeReport) -> Result<(), LearnError> {
        let key = StateKey::new(report.context_class.clone(), report.worker_id.clone());
        let confidence = self
            .store
            .get(&key)
            .map(|s| s.confidence())
            .unwrap_or(0.0);
        self.calibration.record(confidence, report.success);
        Ok(())
    }

    /// Recompute Fisher importance from visit counts: min(visits / F(8), 1).
    /// Crossing φ⁻¹ marks the entry as consolidated.
    fn consolidation_step(&self, report: &OutcomeReport) -> Result<(), LearnError> {
        let key = StateKey::new(report.context_class.clone(), report.worker_id.clone());
        let state = match self.store.get(&key) {
            Some(s) => s,
            None => return Ok(()),
        };

        let fisher = (state.visit_count as f64 / fibonacci(8) as f64).min(1.0);
        if fisher == state.fisher_importance {
            return Ok(());
        }
        let crossed = state.fisher_importance <= PHI_INV && fisher > PHI_INV;

        self.mutate(&key, |current| {
            let mut next = current.clone();
            next.fisher_importance = fisher;
            next
        })?;

        if crossed {
            info!(key = %key, fisher = fisher, "Learning state consolidated");
        }
        Ok(())
    }

    /// Track per-context success over a rolling window; a collapse below the
    /// strategy floor requests a soft posterior reset so the router
    /// re-explores the context. The request is a manager-local flag that the
    /// reward loop, owner of the posterior, applies on the next outcome.
    fn strategy_step(&self, report: &OutcomeReport) -> Result<(), LearnError> {
        let should_reset = {
            let mut window = self
                .strategy_windows
                .entry(report.context_class.clone())
                .or_default();
            window.push_back(report.success);
            if window.len() < self.config.strategy_window {
                false
            } else {
                let successes = window.iter().filter(|s| **s).count();
                let rate = successes as f64 / window.len() as f64;
                if rate < self.config.strategy_floor {
                    window.clear();
                    true
                } else {
                    window.pop_front();
                    false
                }
            }
        };

        if should_reset {
            info!(
                context = %report.context_class,
                "Context success collapsed, requesting soft posterior reset"
            );
            self.pending_resets.insert(report.context_class.clone());
        }
        Ok(())
    }

    /// Decay the TD learning rate from φ⁻¹ toward φ⁻² as outcomes accrue.
    fn meta_step(&self) -> Result<(), LearnError> {
        let n = self.processed.fetch_add(1, Ordering::Relaxed) + 1;
        let f8 = fibonacci(8) as f64;
        let rate = PHI_INV_2 + (PHI_INV - PHI_INV_2) * f8 / (f8 + n as f64);
        self.learning_rate_bits
            .store(rate.to_bits(), Ordering::Relaxed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arbiter_router::InMemoryLearningStore;
    use arbiter_types::TaskId;

    fn manager_with(store: Arc<dyn LearningStore>) -> Arc<LearningManager> {
        Arc::new(LearningManager::new(
            store,
            Arc::new(ExplorationControl::new()),
            LearningConfig::default(),
        ))
    }

    fn outcome(worker: &str, success: bool) -> OutcomeReport {
        OutcomeReport::new(
            TaskId::generate(),
            WorkerId::new(worker),
            ContextClass::new("code"),
            success,
        )
    }

    fn key(worker: &str) -> StateKey {
        StateKey::new(ContextClass::new("code"), WorkerId::new(worker))
    }

    #[test]
    fn test_success_and_failure_update_posterior() {
        let store = Arc::new(InMemoryLearningStore::new());
        let manager = manager_with(store.clone());

        manager.handle(&outcome("w1", true));
        manager.handle(&outcome("w1", false));

        let state = store.get(&key("w1")).unwrap();
        assert_eq!(state.alpha, 2.0);
        assert_eq!(state.beta, 2.0);
        assert_eq!(state.visit_count, 2);
    }

    #[test]
    fn test_duplicate_outcome_is_dropped() {
        let store = Arc::new(InMemoryLearningStore::new());
        let manager = manager_with(store.clone());

        let report = outcome("w1", true);
        manager.handle(&report);
        manager.handle(&report);

        let state = store.get(&key("w1")).unwrap();
        assert_eq!(state.alpha, 2.0);
        assert_eq!(state.visit_count, 1);
        assert_eq!(manager.stats().duplicates_dropped, 1);
    }

    #[test]
    fn test_reward_moves_q_toward_outcome() {
        let store = Arc::new(InMemoryLearningStore::new());
        let manager = manager_with(store.clone());

        manager.handle(&outcome("w1", true).with_reward(1.0));
        let after_success = store.get(&key("w1")).unwrap().q_value;
        assert!(after_success > 0.5);

        for _ in 0..5 {
            manager.handle(&outcome("w1", false).with_reward(0.0));
        }
        let after_failures = store.get(&key("w1")).unwrap().q_value;
        assert!(after_failures < after_success);
    }

    #[test]
    fn test_preference_bonus_rewards_better_worker() {
        let store = Arc::new(InMemoryLearningStore::new());
        let manager = manager_with(store.clone());

        manager.handle(&outcome("loser", false).with_reward(0.0));

        // Different worker, same context, better reward: pairs with the
        // previous outcome and earns the bonus alongside its own update.
        manager.handle(&outcome("winner", true).with_reward(1.0));
        let winner = store.get(&key("winner")).unwrap();
        assert!(winner.preference_bonus > 0.0);
        assert!(winner.preference_bonus <= PHI_INV);
        assert_eq!(store.get(&key("loser")).unwrap().preference_bonus, 0.0);
    }

    #[test]
    fn test_loops_write_disjoint_fields() {
        let store = Arc::new(InMemoryLearningStore::new());
        let manager = manager_with(store.clone());

        manager.handle(&outcome("loser", false).with_reward(0.0));
        manager.handle(&outcome("winner", true).with_reward(1.0));

        // The preference bonus lives next to the reward-owned fields without
        // disturbing them: posterior, visits and fisher all match a single
        // successful outcome.
        let winner = store.get(&key("winner")).unwrap();
        assert!(winner.preference_bonus > 0.0);
        assert_eq!(winner.alpha, 2.0);
        assert_eq!(winner.beta, 1.0);
        assert_eq!(winner.visit_count, 1);
        assert!((winner.fisher_importance - 1.0 / 21.0).abs() < 1e-9);
    }

    #[test]
    fn test_consolidation_tracks_visits() {
        let store = Arc::new(InMemoryLearningStore::new());
        let manager = manager_with(store.clone());

        for _ in 0..10 {
            manager.handle(&outcome("w1", true));
        }
        let state = store.get(&key("w1")).unwrap();
        assert!((state.fisher_importance - 10.0 / 21.0).abs() < 1e-9);

        for _ in 0..30 {
            manager.handle(&outcome("w1", true));
        }
        let state = store.get(&key("w1")).unwrap();
        assert_eq!(state.fisher_importance, 1.0);
    }

    #[test]
    fn test_strategy_collapse_resets_posterior() {
        let store = Arc::new(InMemoryLearningStore::new());
        store.seed(key("w1"), LearningState::seeded(10.0, 1.0));
        let manager = manager_with(store.clone());

        // 21 failures fill the strategy window and request the reset; the
        // reward loop applies it on the following outcome. Failures never
        // raise alpha, so the decay toward the uniform prior is visible.
        for _ in 0..22 {
            manager.handle(&outcome("w1", false));
        }

        let state = store.get(&key("w1")).unwrap();
        assert!(state.alpha < 10.0);
        assert!(state.alpha > 1.0);
    }

    #[test]
    fn test_meta_control_decays_learning_rate() {
        let store = Arc::new(InMemoryLearningStore::new());
        let manager = manager_with(store);

        assert!((manager.learning_rate() - PHI_INV).abs() < 1e-9);
        for _ in 0..100 {
            manager.handle(&outcome("w1", true));
        }
        let rate = manager.learning_rate();
        assert!(rate < PHI_INV);
        assert!(rate > PHI_INV_2);
    }

    #[test]
    fn test_dedup_memory_stays_bounded() {
        let store = Arc::new(InMemoryLearningStore::new());
        let manager = Arc::new(LearningManager::new(
            store.clone(),
            Arc::new(ExplorationControl::new()),
            LearningConfig {
                dedup_capacity: 4,
                ..LearningConfig::default()
            },
        ));

        let mut reports = Vec::new();
        for _ in 0..100 {
            let report = outcome("w1", true);
            manager.handle(&report);
            reports.push(report);
        }

        // Two generations of four ids each, no matter how many flow through.
        assert!(manager.stats().dedup_entries <= 8);

        // A duplicate inside the retained window is still dropped.
        manager.handle(reports.last().unwrap());
        assert_eq!(manager.stats().duplicates_dropped, 1);
        assert_eq!(store.get(&key("w1")).unwrap().visit_count, 100);
    }

    /// Store that accepts reads but loses every write.
    struct ContentedStore;

    impl LearningStore for ContentedStore {
        fn get(&self, _key: &StateKey) -> Option<LearningState> {
            None
        }
        fn compare_and_swap(
            &self,
            _key: &StateKey,
            _expected_version: u64,
            _new: LearningState,
        ) -> bool {
            false
        }
    }

    #[test]
    fn test_sick_loop_trips_only_its_breaker() {
        let manager = manager_with(Arc::new(ContentedStore));

        // Every reward write fails; five outcomes trip the reward breaker.
        for _ in 0..5 {
            manager.handle(&outcome("w1", true));
        }
        assert_eq!(
            manager.breaker(LoopKind::Reward).state(),
            CircuitState::Open
        );
        for kind in [
            LoopKind::Preference,
            LoopKind::Calibration,
            LoopKind::Consolidation,
            LoopKind::Strategy,
            LoopKind::MetaControl,
        ] {
            assert_eq!(manager.breaker(kind).state(), CircuitState::Closed);
        }

        // Further outcomes still flow through the healthy loops.
        manager.handle(&outcome("w1", true));
        assert_eq!(manager.stats().processed, 6);
    }

    #[tokio::test]
    async fn test_queue_drains_without_blocking_sender() {
        let store = Arc::new(InMemoryLearningStore::new());
        let manager = manager_with(store.clone());

        let (tx, rx) = mpsc::channel(16);
        let worker = tokio::spawn(Arc::clone(&manager).run(rx));

        tx.send(outcome("w1", true)).await.unwrap();
        tx.send(outcome("w1", true)).await.unwrap();
        drop(tx);
        worker.await.unwrap();

        assert_eq!(store.get(&key("w1")).unwrap().visit_count, 2);
        assert_eq!(manager.stats().processed, 2);
    }
}

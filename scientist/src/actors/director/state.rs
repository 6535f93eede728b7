//! Director cycle/budget state machine
//!
//! Pure bookkeeping: every transition takes the event plus the number of
//! experiments currently persisted and returns the [`DirectorAction`]s the
//! actor must carry out. Nothing here touches the bus or the store.

use std::collections::{HashMap, HashSet};

use serde::Serialize;
use shared_types::{
    DesignSpace, EventPayload, ExperimentConfig, ExperimentResult, InsightGenerated, Insights,
    PlanApproved, PlanRejected, PlanRequested, StateUpdated,
};

use super::protocol::{DeadlineStage, DirectorError, DirectorStatus, RunOutcome};

/// Budget and retry policy, fixed for a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectorPolicy {
    /// Ceiling on experiments persisted in the run
    pub budget_max: usize,
    pub max_cycles: u32,
    /// Rejections answered with a fresh plan request before analysis is forced
    pub max_plan_retries: u32,
    /// Most configurations requested per plan
    pub per_cycle_cap: usize,
}

impl Default for DirectorPolicy {
    fn default() -> Self {
        Self {
            budget_max: 20,
            max_cycles: 5,
            max_plan_retries: 2,
            per_cycle_cap: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    Planning,
    Executing,
    Analyzing,
    Terminated,
}

/// Side effects requested by a transition, executed in order.
#[derive(Debug, Clone, PartialEq)]
pub enum DirectorAction {
    Publish(EventPayload),
    /// Create the plan record for a cycle
    OpenPlan { cycle: u32 },
    /// Persist a `TimedOut` failure for each configuration
    RecordTimeouts {
        cycle: u32,
        configs: Vec<ExperimentConfig>,
    },
    ArmDeadline { cycle: u32, stage: DeadlineStage },
    /// Set the stop latch and answer the pending `run`
    Stop,
}

/// How an incoming result is treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// Persist and count toward the current batch
    Count,
    /// Persist only (earlier cycle, or loop already stopped)
    PersistOnly,
    /// Neither persist nor count (abandoned by the watchdog, duplicate, no run)
    Drop,
}

pub struct CycleState {
    policy: DirectorPolicy,
    design_space: DesignSpace,
    phase: Phase,
    current_cycle: u32,
    expected_experiments: usize,
    completed_experiments_cycle: usize,
    plan_retries: u32,
    /// Approved this cycle, result not yet seen
    pending: HashMap<String, ExperimentConfig>,
    /// Result seen this cycle before its approval
    completed_early: HashSet<String>,
    counted: HashSet<String>,
    /// Written off by the cycle watchdog; late results are discarded
    abandoned: HashSet<String>,
    /// One analysis trigger per cycle
    analysis_requested: bool,
    cycles_completed: u32,
    final_pareto: Vec<String>,
    final_insights: Insights,
}

impl CycleState {
    pub fn new(policy: DirectorPolicy, design_space: DesignSpace) -> Self {
        Self {
            policy,
            design_space,
            phase: Phase::Idle,
            current_cycle: 0,
            expected_experiments: 0,
            completed_experiments_cycle: 0,
            plan_retries: 0,
            pending: HashMap::new(),
            completed_early: HashSet::new(),
            counted: HashSet::new(),
            abandoned: HashSet::new(),
            analysis_requested: false,
            cycles_completed: 0,
            final_pareto: Vec::new(),
            final_insights: Insights::pending(),
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn current_cycle(&self) -> u32 {
        self.current_cycle
    }

    pub fn is_stopped(&self) -> bool {
        self.phase == Phase::Terminated
    }

    /// Latch the stop flag after an unrecoverable failure.
    pub fn abort(&mut self) {
        self.phase = Phase::Terminated;
    }

    pub fn status(&self) -> DirectorStatus {
        DirectorStatus {
            phase: self.phase,
            current_cycle: self.current_cycle,
            expected_experiments: self.expected_experiments,
            completed_experiments_cycle: self.completed_experiments_cycle,
            plan_retries: self.plan_retries,
            stopped: self.is_stopped(),
        }
    }

    pub fn outcome(&self, experiments_used: usize) -> RunOutcome {
        RunOutcome {
            pareto_ids: self.final_pareto.clone(),
            insights: self.final_insights.clone(),
            cycles_completed: self.cycles_completed,
            experiments_used,
        }
    }

    // =========================================================================
    // Transitions
    // =========================================================================

    /// Idle -> Planning. The initial batch goes out as an already-approved plan
    /// for cycle 0; the Director counts it when the approval comes back.
    pub fn start(
        &mut self,
        initial: Vec<ExperimentConfig>,
    ) -> Result<Vec<DirectorAction>, DirectorError> {
        if self.phase != Phase::Idle {
            return Err(DirectorError::AlreadyRunning);
        }
        self.phase = Phase::Planning;
        self.current_cycle = 0;
        self.reset_cycle();

        Ok(vec![
            DirectorAction::OpenPlan { cycle: 0 },
            DirectorAction::ArmDeadline {
                cycle: 0,
                stage: DeadlineStage::Cycle,
            },
            DirectorAction::Publish(
                PlanApproved {
                    configs: initial,
                    cycle: 0,
                }
                .into(),
            ),
        ])
    }

    pub fn on_plan_approved(&mut self, plan: &PlanApproved, total: usize) -> Vec<DirectorAction> {
        if !self.accepts(plan.cycle, "PLAN_APPROVED") {
            return Vec::new();
        }
        if self.phase == Phase::Planning {
            self.phase = Phase::Executing;
        }

        for config in &plan.configs {
            let id = &config.experiment_id;
            if !self.completed_early.remove(id) {
                self.pending.insert(id.clone(), config.clone());
            }
        }
        self.expected_experiments += plan.configs.len();

        tracing::info!(
            cycle = self.current_cycle,
            approved = plan.configs.len(),
            expected = self.expected_experiments,
            completed = self.completed_experiments_cycle,
            "Plan approved"
        );

        if self.expected_experiments == 0 {
            return self.request_analysis("empty_plan");
        }
        self.check_progress(total)
    }

    pub fn on_plan_rejected(&mut self, rejected: &PlanRejected, total: usize) -> Vec<DirectorAction> {
        if !self.accepts(rejected.cycle, "PLAN_REJECTED") || self.phase == Phase::Analyzing {
            return Vec::new();
        }

        tracing::info!(
            cycle = self.current_cycle,
            retries = self.plan_retries,
            feedback = %rejected.feedback,
            "Plan rejected"
        );

        if self.plan_retries < self.policy.max_plan_retries {
            let budget = self.remaining_cap(total);
            if budget == 0 {
                return self.request_analysis("budget_exhausted");
            }
            self.plan_retries += 1;
            return vec![DirectorAction::Publish(
                PlanRequested {
                    budget,
                    design_space: self.design_space.clone(),
                    cycle: self.current_cycle,
                }
                .into(),
            )];
        }
        self.request_analysis("plan_retries_exhausted")
    }

    pub fn classify_completion(&self, result: &ExperimentResult) -> Completion {
        let id = &result.experiment_id;
        match self.phase {
            Phase::Idle => Completion::Drop,
            _ if self.abandoned.contains(id) => Completion::Drop,
            Phase::Terminated => Completion::PersistOnly,
            _ if result.cycle != self.current_cycle => Completion::PersistOnly,
            _ if self.counted.contains(id) => Completion::Drop,
            _ => Completion::Count,
        }
    }

    /// Called after the result has been persisted (or dropped).
    pub fn on_experiment_persisted(
        &mut self,
        result: &ExperimentResult,
        disposition: Completion,
        total: usize,
    ) -> Vec<DirectorAction> {
        if matches!(self.phase, Phase::Idle | Phase::Terminated) {
            return Vec::new();
        }
        if disposition == Completion::Count {
            let id = result.experiment_id.clone();
            self.completed_experiments_cycle += 1;
            if self.pending.remove(&id).is_none() {
                self.completed_early.insert(id.clone());
            }
            self.counted.insert(id);
        }
        if disposition == Completion::Drop {
            return Vec::new();
        }

        tracing::debug!(
            cycle = self.current_cycle,
            experiment_id = %result.experiment_id,
            status = result.status.as_str(),
            completed = self.completed_experiments_cycle,
            expected = self.expected_experiments,
            total,
            "Experiment recorded"
        );
        self.check_progress(total)
    }

    pub fn on_insight(&mut self, insight: &InsightGenerated, total: usize) -> Vec<DirectorAction> {
        if self.phase != Phase::Analyzing || insight.cycle != self.current_cycle {
            tracing::debug!(
                cycle = insight.cycle,
                current = self.current_cycle,
                phase = ?self.phase,
                "Ignoring insight outside the current analysis"
            );
            return Vec::new();
        }

        self.final_pareto = insight.pareto_ids.clone();
        self.final_insights = insight.insights.clone();
        self.cycles_completed += 1;

        if total < self.policy.budget_max && self.current_cycle < self.policy.max_cycles {
            self.current_cycle += 1;
            self.reset_cycle();
            self.phase = Phase::Planning;
            let cycle = self.current_cycle;
            let budget = self.remaining_cap(total);
            tracing::info!(cycle, budget, total, "Starting next cycle");
            return vec![
                DirectorAction::OpenPlan { cycle },
                DirectorAction::ArmDeadline {
                    cycle,
                    stage: DeadlineStage::Cycle,
                },
                DirectorAction::Publish(
                    PlanRequested {
                        budget,
                        design_space: self.design_space.clone(),
                        cycle,
                    }
                    .into(),
                ),
            ];
        }

        tracing::info!(
            cycle = self.current_cycle,
            total,
            budget_max = self.policy.budget_max,
            pareto = self.final_pareto.len(),
            "Stop condition reached"
        );
        self.phase = Phase::Terminated;
        vec![DirectorAction::Stop]
    }

    pub fn on_deadline(&mut self, cycle: u32, stage: DeadlineStage, total: usize) -> Vec<DirectorAction> {
        if cycle != self.current_cycle {
            return Vec::new();
        }
        match stage {
            DeadlineStage::Cycle => {
                if !matches!(self.phase, Phase::Planning | Phase::Executing) || self.analysis_requested
                {
                    return Vec::new();
                }
                let mut configs: Vec<ExperimentConfig> =
                    self.pending.drain().map(|(_, config)| config).collect();
                configs.sort_by(|a, b| a.experiment_id.cmp(&b.experiment_id));
                for config in &configs {
                    self.abandoned.insert(config.experiment_id.clone());
                }
                tracing::warn!(
                    cycle,
                    abandoned = configs.len(),
                    "Cycle deadline expired; forcing analysis"
                );

                let mut actions = Vec::new();
                if !configs.is_empty() {
                    actions.push(DirectorAction::RecordTimeouts { cycle, configs });
                }
                actions.extend(self.request_analysis("cycle_timeout"));
                actions
            }
            DeadlineStage::Analysis => {
                if self.phase != Phase::Analyzing {
                    return Vec::new();
                }
                tracing::warn!(cycle, "Analysis deadline expired; closing cycle without insight");
                let insight = InsightGenerated {
                    insights: Insights::timed_out(cycle),
                    pareto_ids: self.final_pareto.clone(),
                    cycle,
                };
                self.on_insight(&insight, total)
            }
        }
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    fn accepts(&self, cycle: u32, topic: &str) -> bool {
        let live = matches!(
            self.phase,
            Phase::Planning | Phase::Executing | Phase::Analyzing
        );
        if !live || cycle != self.current_cycle {
            tracing::debug!(
                topic,
                cycle,
                current = self.current_cycle,
                phase = ?self.phase,
                "Ignoring stale event"
            );
            return false;
        }
        true
    }

    fn check_progress(&mut self, total: usize) -> Vec<DirectorAction> {
        if self.expected_experiments > 0
            && self.completed_experiments_cycle >= self.expected_experiments
        {
            return self.request_analysis("batch_complete");
        }
        if total >= self.policy.budget_max {
            return self.request_analysis("budget_exhausted");
        }
        Vec::new()
    }

    fn request_analysis(&mut self, reason: &str) -> Vec<DirectorAction> {
        if self.analysis_requested || self.phase == Phase::Terminated {
            return Vec::new();
        }
        self.analysis_requested = true;
        self.phase = Phase::Analyzing;
        tracing::info!(cycle = self.current_cycle, reason, "Requesting analysis");

        let cycle = self.current_cycle;
        vec![
            DirectorAction::Publish(
                StateUpdated {
                    trigger_analysis: true,
                    cycle,
                    reason: Some(reason.to_string()),
                }
                .into(),
            ),
            DirectorAction::ArmDeadline {
                cycle,
                stage: DeadlineStage::Analysis,
            },
        ]
    }

    fn remaining_cap(&self, total: usize) -> usize {
        self.policy
            .per_cycle_cap
            .min(self.policy.budget_max.saturating_sub(total))
    }

    fn reset_cycle(&mut self) {
        self.expected_experiments = 0;
        self.completed_experiments_cycle = 0;
        self.plan_retries = 0;
        self.pending.clear();
        self.completed_early.clear();
        self.counted.clear();
        self.analysis_requested = false;
    }
}

// ============================================================================
// Tests
// ============================================================================

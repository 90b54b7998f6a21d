//! Task run controller: drives one plan through execute → verify → advance or
//! correct, until the run is completed, failed, or cancelled.
//!
//! The controller is the only writer of step status and the plan cursor. Each
//! call to [`TaskRun::step`] performs one attempt at the current step; a
//! spawned run loops on it until a terminal state.
//!
//! Failures are values here. A step that cannot be fixed, an invalid
//! replacement plan, or an unreachable collaborator all end in
//! [`RunState::Failed`] with a [`FailureReason`]; nothing propagates past the
//! run as an error.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use thiserror::Error;
use tokio::sync::Notify;
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::core::correction::{Correction, CorrectionStrategy, GiveUpReason};
use crate::core::events::{EventKind, EventSequencer};
use crate::core::plan::{splice_tail, validate_plan};
use crate::core::records::{
    ActionStatus, CorrectionRecord, RunOutcomeRecord, TaskAction, VerificationRecord,
};
use crate::core::types::{
    ActualState, Collaborator, FailureReason, RunContext, RunState, Step, StepStatus, TaskPlan,
};
use crate::core::verification::{VerificationResult, evaluate_checks};
use crate::correct::SelfCorrectionEngine;
use crate::io::broadcaster::EventBroadcaster;
use crate::io::config::RunnerConfig;
use crate::io::executor::{ExecutionErrorKind, StepExecutor};
use crate::io::judge::{JudgeError, SemanticJudge};
use crate::io::planner::Planner;
use crate::io::record_store::{RecordStore, StoreError};
use crate::verify::VerificationEngine;

/// Injected collaborators, shared by every run a controller starts.
#[derive(Clone)]
pub struct Collaborators {
    pub executor: Arc<dyn StepExecutor>,
    pub judge: Arc<dyn SemanticJudge>,
    pub planner: Arc<dyn Planner>,
    pub store: Arc<dyn RecordStore>,
    pub broadcaster: Arc<dyn EventBroadcaster>,
}

#[derive(Debug, Error)]
pub enum StartError {
    #[error("task '{task_id}' already has an active run")]
    AlreadyRunning { task_id: String },

    #[error("invalid plan: {}", .errors.join("; "))]
    InvalidPlan { errors: Vec<String> },

    #[error("could not acquire run lease: {0}")]
    Store(#[source] StoreError),
}

/// Terminal summary of one run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunOutcome {
    pub task_id: String,
    pub state: RunState,
    pub reason: Option<FailureReason>,
    pub plan: TaskPlan,
}

pub struct TaskRunController {
    collaborators: Collaborators,
    config: RunnerConfig,
}

impl TaskRunController {
    /// Fails when `config` does not pass [`RunnerConfig::validate`].
    pub fn new(collaborators: Collaborators, config: RunnerConfig) -> anyhow::Result<Self> {
        config.validate().context("invalid runner config")?;
        Ok(Self {
            collaborators,
            config,
        })
    }

    /// Validate `plan`, take the task's run lease, and return a run that has
    /// not executed anything yet.
    pub async fn prepare_run(
        &self,
        ctx: RunContext,
        mut plan: TaskPlan,
    ) -> Result<TaskRun, StartError> {
        plan.current_step_index = 0;
        let mut errors = validate_plan(&plan);
        if let Some(first) = plan.steps.first() {
            if first.status != StepStatus::Pending {
                errors.push(format!(
                    "step {} is {} (a new run starts with pending steps)",
                    first.index,
                    first.status.as_str()
                ));
            }
        }
        if !errors.is_empty() {
            return Err(StartError::InvalidPlan { errors });
        }

        let holder = Uuid::new_v4().to_string();
        let generation = match self
            .collaborators
            .store
            .acquire_run_lease(&ctx.task_id, &holder, self.config.lease_ttl())
            .await
        {
            Ok(generation) => generation,
            Err(StoreError::LeaseHeld { task_id }) => {
                return Err(StartError::AlreadyRunning { task_id });
            }
            Err(err) => return Err(StartError::Store(err)),
        };
        info!(
            task_id = %ctx.task_id,
            tenant_id = %ctx.tenant_id,
            steps = plan.steps.len(),
            generation,
            "run prepared"
        );

        let collab = &self.collaborators;
        Ok(TaskRun {
            ctx,
            plan,
            state: RunState::Idle,
            failure: None,
            holder,
            cancel: Arc::new(CancelSignal::default()),
            sequencer: EventSequencer::for_generation(generation),
            executor: Arc::clone(&collab.executor),
            store: Arc::clone(&collab.store),
            broadcaster: Arc::clone(&collab.broadcaster),
            verifier: VerificationEngine::new(
                Arc::clone(&collab.judge),
                self.config.judge_timeout(),
            )
            .with_semantic_confidence(self.config.semantic_match_confidence),
            corrector: SelfCorrectionEngine::new(
                Arc::clone(&collab.planner),
                self.config.max_attempts,
                self.config.retry.clone(),
            ),
            executor_timeout: self.config.executor_timeout(),
            lease_ttl: self.config.lease_ttl(),
        })
    }

    /// Prepare a run and drive it on its own tokio task.
    pub async fn start_run(
        &self,
        ctx: RunContext,
        plan: TaskPlan,
    ) -> Result<RunHandle, StartError> {
        let run = self.prepare_run(ctx, plan).await?;
        let task_id = run.ctx.task_id.clone();
        let cancel = Arc::clone(&run.cancel);
        let join = tokio::spawn(run.run());
        Ok(RunHandle {
            task_id,
            cancel,
            join,
        })
    }
}

/// Cooperative cancellation shared by a run and its handle.
#[derive(Debug, Default)]
struct CancelSignal {
    requested: AtomicBool,
    wake: Notify,
}

impl CancelSignal {
    fn request(&self) {
        self.requested.store(true, Ordering::SeqCst);
        self.wake.notify_one();
    }

    fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    /// Resolves once cancellation has been requested.
    async fn requested(&self) {
        while !self.is_requested() {
            self.wake.notified().await;
        }
    }
}

/// Handle to a spawned run.
#[derive(Debug)]
pub struct RunHandle {
    task_id: String,
    cancel: Arc<CancelSignal>,
    join: JoinHandle<RunOutcome>,
}

impl RunHandle {
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// Request cancellation. Honored at the next step boundary or during a
    /// retry delay; an in-flight executor or judge call is never interrupted.
    pub fn cancel(&self) {
        self.cancel.request();
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    pub async fn wait(self) -> Result<RunOutcome, JoinError> {
        self.join.await
    }
}

/// What the loop does after one attempt.
enum Flow {
    Continue,
    Completed,
    Cancelled,
}

fn unavailable(collaborator: Collaborator, message: impl ToString) -> FailureReason {
    FailureReason::CollaboratorUnavailable {
        collaborator,
        message: message.to_string(),
    }
}

fn store_unavailable(err: StoreError) -> FailureReason {
    unavailable(Collaborator::RecordStore, err)
}

/// One run of one plan. Owned by a single worker.
pub struct TaskRun {
    ctx: RunContext,
    plan: TaskPlan,
    state: RunState,
    failure: Option<FailureReason>,
    holder: String,
    cancel: Arc<CancelSignal>,
    sequencer: EventSequencer,
    executor: Arc<dyn StepExecutor>,
    store: Arc<dyn RecordStore>,
    broadcaster: Arc<dyn EventBroadcaster>,
    verifier: VerificationEngine,
    corrector: SelfCorrectionEngine,
    executor_timeout: Duration,
    lease_ttl: Duration,
}

impl TaskRun {
    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn plan(&self) -> &TaskPlan {
        &self.plan
    }

    pub fn failure(&self) -> Option<&FailureReason> {
        self.failure.as_ref()
    }

    pub fn context(&self) -> &RunContext {
        &self.ctx
    }

    pub fn cancel(&self) {
        self.cancel.request();
    }

    fn cancel_requested(&self) -> bool {
        self.cancel.is_requested()
    }

    /// Drive the run to a terminal state.
    pub async fn run(mut self) -> RunOutcome {
        while !self.state.is_terminal() {
            self.step().await;
        }
        RunOutcome {
            task_id: self.ctx.task_id,
            state: self.state,
            reason: self.failure,
            plan: self.plan,
        }
    }

    /// One attempt at the current step. No-op once terminal.
    #[instrument(skip(self), fields(task_id = %self.ctx.task_id, step_index = self.plan.current_step_index))]
    pub async fn step(&mut self) -> RunState {
        if self.state.is_terminal() {
            return self.state;
        }
        let (state, reason) = match self.attempt().await {
            Ok(Flow::Continue) => return self.state,
            Ok(Flow::Completed) => (RunState::Completed, None),
            Ok(Flow::Cancelled) => (RunState::Cancelled, None),
            Err(reason) => (RunState::Failed, Some(reason)),
        };
        self.finish(state, reason).await;
        self.state
    }

    async fn attempt(&mut self) -> Result<Flow, FailureReason> {
        if self.state == RunState::Idle {
            let plan = self.plan.clone();
            self.publish(EventKind::PlanPreview { plan }).await;
        }
        if self.cancel_requested() {
            info!("cancellation observed at step boundary");
            return Ok(Flow::Cancelled);
        }
        self.store
            .renew_run_lease(&self.ctx.task_id, &self.holder, self.lease_ttl)
            .await
            .map_err(store_unavailable)?;

        let Some(current) = self.plan.current_step() else {
            return Ok(Flow::Completed);
        };
        let mut step = current.clone();
        if step.status == StepStatus::Pending {
            self.set_status(StepStatus::Running);
            step.status = StepStatus::Running;
        }

        self.state = RunState::Executing;
        let observed = self.execute(&step).await?;

        self.state = RunState::Verifying;
        let (actual, result) = match observed {
            Ok(actual) => {
                let verdict = self.verifier.verify(&step.expected_outcome, &actual).await;
                match verdict {
                    Ok(result) => (Some(actual), result),
                    Err(JudgeError::Unavailable(message)) => {
                        warn!(%message, "semantic judge unavailable");
                        let checks = evaluate_checks(&step.expected_outcome, &actual);
                        let result = VerificationResult::judge_unavailable(checks, &message);
                        self.record_verification(&step, Some(actual), &result)
                            .await?;
                        return Err(unavailable(Collaborator::Judge, message));
                    }
                }
            }
            Err(result) => (None, result),
        };
        self.record_verification(&step, actual, &result).await?;

        if result.success {
            self.set_status(StepStatus::Succeeded);
            self.state = RunState::Advancing;
            self.plan.current_step_index += 1;
            debug!(confidence = result.confidence, "step succeeded");
            if self.plan.is_exhausted() {
                return Ok(Flow::Completed);
            }
            return Ok(Flow::Continue);
        }

        if self.cancel_requested() {
            info!("cancellation observed after failed verification");
            return Ok(Flow::Cancelled);
        }
        self.state = RunState::Correcting;
        self.correct(step, &result).await
    }

    /// Call the executor under its timeout and log the action.
    ///
    /// `Ok(Err(..))` is a failed verification built from an executor error.
    async fn execute(
        &mut self,
        step: &Step,
    ) -> Result<Result<ActualState, VerificationResult>, FailureReason> {
        let outcome =
            tokio::time::timeout(self.executor_timeout, self.executor.execute(&step.action)).await;
        let (status, thought, observed) = match outcome {
            Ok(Ok(actual)) => (ActionStatus::Completed, None, Ok(actual)),
            Ok(Err(err)) if err.is_unavailable() => {
                warn!(error = %err, "executor unavailable");
                self.append_action(step, ActionStatus::Errored, Some(err.to_string()))
                    .await?;
                let result = VerificationResult::execution_failed(err.kind.label(), &err.message);
                self.record_verification(step, None, &result).await?;
                return Err(unavailable(Collaborator::Executor, err.message));
            }
            Ok(Err(err)) => {
                warn!(error = %err, "executor reported an error");
                let result = VerificationResult::execution_failed(err.kind.label(), &err.message);
                (ActionStatus::Errored, Some(err.to_string()), Err(result))
            }
            Err(_) => {
                let message = format!(
                    "no response within {}s",
                    self.executor_timeout.as_secs()
                );
                warn!(timeout_secs = self.executor_timeout.as_secs(), "executor timed out");
                let result =
                    VerificationResult::execution_failed(ExecutionErrorKind::Timeout.label(), &message);
                (ActionStatus::TimedOut, Some(message), Err(result))
            }
        };
        self.append_action(step, status, thought).await?;
        Ok(observed)
    }

    async fn correct(
        &mut self,
        step: Step,
        result: &VerificationResult,
    ) -> Result<Flow, FailureReason> {
        let counts = self
            .store
            .get_counts(&self.ctx.tenant_id, &self.ctx.task_id, step.index)
            .await
            .map_err(store_unavailable)?;
        let attempt_number = counts.next_attempt_number();
        let remaining = self.plan.remaining().to_vec();
        let correction = self
            .corrector
            .correct(step.index, &step, result, attempt_number, &remaining)
            .await
            .map_err(|err| unavailable(Collaborator::Planner, err))?;

        match correction {
            Correction::GiveUp(give_up) => {
                self.set_status(StepStatus::Failed);
                Err(match give_up {
                    GiveUpReason::Exhausted {
                        attempt_number,
                        max_attempts,
                    } => FailureReason::CorrectionExhausted {
                        step_index: step.index,
                        attempt_number,
                        max_attempts,
                    },
                    GiveUpReason::PlanInvalid(message) => FailureReason::PlanInvalid {
                        step_index: step.index,
                        message,
                    },
                })
            }
            Correction::Step {
                step: corrected,
                strategy,
                reason,
                delay,
            } => {
                self.record_correction(&step, &corrected, strategy, reason, attempt_number)
                    .await?;
                if let Some(current) = self.plan.current_step_mut() {
                    *current = corrected;
                }
                if let Some(delay) = delay.filter(|d| !d.is_zero()) {
                    debug!(delay_ms = delay.as_millis() as u64, "waiting before retry");
                    tokio::select! {
                        () = tokio::time::sleep(delay) => {}
                        () = self.cancel.requested() => {
                            info!("cancellation observed during retry delay");
                            return Ok(Flow::Cancelled);
                        }
                    }
                }
                self.state = RunState::Executing;
                Ok(Flow::Continue)
            }
            Correction::Tail { steps, reason } => {
                let Some(head) = steps.first().cloned() else {
                    self.set_status(StepStatus::Failed);
                    return Err(FailureReason::PlanInvalid {
                        step_index: step.index,
                        message: "replacement tail has no steps".to_string(),
                    });
                };
                self.record_correction(
                    &step,
                    &head,
                    CorrectionStrategy::UpdatePlan,
                    reason.clone(),
                    attempt_number,
                )
                .await?;
                splice_tail(&mut self.plan, steps);
                info!(steps = self.plan.steps.len(), "plan tail replaced");
                let plan = self.plan.clone();
                self.publish(EventKind::PlanUpdate {
                    plan,
                    reason: Some(reason),
                })
                .await;
                self.state = RunState::Executing;
                Ok(Flow::Continue)
            }
        }
    }

    /// Persist one verification attempt and announce it.
    async fn record_verification(
        &mut self,
        step: &Step,
        actual: Option<ActualState>,
        result: &VerificationResult,
    ) -> Result<(), FailureReason> {
        let record = VerificationRecord::new(&self.ctx, step, actual, result, Utc::now());
        self.store
            .put_verification(&record)
            .await
            .map_err(store_unavailable)?;
        self.publish(EventKind::StepResult {
            step_index: step.index,
            success: result.success,
            confidence: result.confidence,
        })
        .await;
        Ok(())
    }

    async fn record_correction(
        &self,
        original: &Step,
        corrected: &Step,
        strategy: CorrectionStrategy,
        reason: String,
        attempt_number: u32,
    ) -> Result<(), FailureReason> {
        info!(
            attempt = attempt_number,
            strategy = strategy.as_str(),
            "correcting step"
        );
        let record = CorrectionRecord {
            tenant_id: self.ctx.tenant_id.clone(),
            task_id: self.ctx.task_id.clone(),
            step_index: original.index,
            original_step: original.clone(),
            corrected_step: corrected.clone(),
            strategy,
            reason,
            attempt_number,
            timestamp: Utc::now(),
        };
        self.store
            .put_correction(&record)
            .await
            .map_err(store_unavailable)
    }

    async fn append_action(
        &self,
        step: &Step,
        status: ActionStatus,
        thought: Option<String>,
    ) -> Result<(), FailureReason> {
        let entry = TaskAction {
            tenant_id: self.ctx.tenant_id.clone(),
            task_id: self.ctx.task_id.clone(),
            step_index: step.index,
            action: step.action.clone(),
            status,
            thought,
            timestamp: Utc::now(),
        };
        self.store
            .append_action(&entry)
            .await
            .map_err(store_unavailable)
    }

    fn set_status(&mut self, next: StepStatus) {
        let Some(step) = self.plan.current_step_mut() else {
            return;
        };
        if step.status.can_transition_to(next) {
            step.status = next;
        } else {
            warn!(
                from = step.status.as_str(),
                to = next.as_str(),
                "ignoring backward step transition"
            );
        }
    }

    /// Broadcast failures are logged and never abort the run.
    async fn publish(&mut self, kind: EventKind) {
        let event = self
            .sequencer
            .next_event(&self.ctx.task_id, kind, Utc::now());
        let name = event.kind.name();
        let sequence = event.sequence_number;
        if let Err(err) = self.broadcaster.publish(&self.ctx.session_id, event).await {
            warn!(event = name, sequence, error = %err, "progress event not delivered");
        }
    }

    /// Enter a terminal state: persist the outcome, announce it, release the
    /// lease. Errors here are logged; the run is already over.
    async fn finish(&mut self, state: RunState, reason: Option<FailureReason>) {
        self.state = state;
        self.failure = reason.clone();
        match &reason {
            Some(reason) => warn!(state = state.as_str(), %reason, "run finished"),
            None => info!(state = state.as_str(), "run finished"),
        }

        let record = RunOutcomeRecord {
            tenant_id: self.ctx.tenant_id.clone(),
            task_id: self.ctx.task_id.clone(),
            state,
            reason: reason.clone(),
            current_step_index: self.plan.current_step_index,
            step_count: self.plan.steps.len() as u32,
            timestamp: Utc::now(),
        };
        if let Err(err) = self.store.put_run_outcome(&record).await {
            warn!(error = %err, "run outcome not persisted");
        }
        self.publish(EventKind::RunFinished { state, reason }).await;
        if let Err(err) = self
            .store
            .release_run_lease(&self.ctx.task_id, &self.holder)
            .await
        {
            warn!(error = %err, "run lease not released");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::planner::NoopPlanner;
    use crate::io::record_store::InMemoryRecordStore;
    use crate::test_support::{RecordingBroadcaster, ScriptedExecutor, ScriptedJudge, plan_of};

    struct Fixture {
        store: Arc<InMemoryRecordStore>,
        broadcaster: Arc<RecordingBroadcaster>,
        controller: TaskRunController,
    }

    fn fixture(executor: ScriptedExecutor, judge: ScriptedJudge) -> Fixture {
        let store = Arc::new(InMemoryRecordStore::new());
        let broadcaster = Arc::new(RecordingBroadcaster::new());
        let controller = TaskRunController::new(
            Collaborators {
                executor: Arc::new(executor),
                judge: Arc::new(judge),
                planner: Arc::new(NoopPlanner),
                store: store.clone(),
                broadcaster: broadcaster.clone(),
            },
            RunnerConfig::default(),
        )
        .expect("controller");
        Fixture {
            store,
            broadcaster,
            controller,
        }
    }

    fn ctx() -> RunContext {
        RunContext::new("tenant", "task-1", "session-1")
    }

    #[test]
    fn rejects_invalid_config() {
        let built = TaskRunController::new(
            Collaborators {
                executor: Arc::new(ScriptedExecutor::new()),
                judge: Arc::new(ScriptedJudge::always(true)),
                planner: Arc::new(NoopPlanner),
                store: Arc::new(InMemoryRecordStore::new()),
                broadcaster: Arc::new(RecordingBroadcaster::new()),
            },
            RunnerConfig {
                max_attempts: 0,
                ..RunnerConfig::default()
            },
        );
        let Err(err) = built else {
            panic!("zero max_attempts should be rejected");
        };
        let message = format!("{err:#}");
        assert!(message.contains("invalid runner config"));
        assert!(message.contains("max_attempts must be > 0"));
    }

    #[tokio::test]
    async fn step_advances_one_attempt_at_a_time() {
        let f = fixture(ScriptedExecutor::new(), ScriptedJudge::always(true));
        let mut run = f
            .controller
            .prepare_run(ctx(), plan_of(&["open", "search"]))
            .await
            .expect("prepare");
        assert_eq!(run.state(), RunState::Idle);

        assert_eq!(run.step().await, RunState::Advancing);
        assert_eq!(run.plan().current_step_index, 1);
        assert_eq!(run.plan().steps[0].status, StepStatus::Succeeded);
        assert_eq!(run.plan().steps[1].status, StepStatus::Pending);

        assert_eq!(run.step().await, RunState::Completed);
        assert_eq!(run.step().await, RunState::Completed);
        assert_eq!(
            f.broadcaster.names(),
            vec!["plan_preview", "step_result", "step_result", "run_finished"]
        );
    }

    #[tokio::test]
    async fn rejects_empty_and_started_plans() {
        let f = fixture(ScriptedExecutor::new(), ScriptedJudge::always(true));
        let err = f
            .controller
            .prepare_run(ctx(), TaskPlan::from_drafts(Vec::new()))
            .await
            .err()
            .expect("empty plan");
        assert!(matches!(err, StartError::InvalidPlan { .. }));

        let mut plan = plan_of(&["open"]);
        plan.steps[0].status = StepStatus::Succeeded;
        let err = f
            .controller
            .prepare_run(ctx(), plan)
            .await
            .err()
            .expect("started plan");
        assert!(err.to_string().contains("a new run starts with pending steps"));
    }

    #[tokio::test]
    async fn cancel_before_first_step_executes_nothing() {
        let f = fixture(ScriptedExecutor::new(), ScriptedJudge::always(true));
        let run = f
            .controller
            .prepare_run(ctx(), plan_of(&["open"]))
            .await
            .expect("prepare");
        run.cancel();
        let outcome = run.run().await;

        assert_eq!(outcome.state, RunState::Cancelled);
        assert_eq!(outcome.plan.current_step_index, 0);
        assert!(
            f.store
                .list_actions("tenant", "task-1")
                .await
                .expect("actions")
                .is_empty()
        );
        let recorded = f
            .store
            .run_outcome("tenant", "task-1")
            .await
            .expect("outcome")
            .expect("persisted");
        assert_eq!(recorded.state, RunState::Cancelled);
    }

    #[tokio::test]
    async fn finished_run_releases_lease() {
        let f = fixture(ScriptedExecutor::new(), ScriptedJudge::always(true));
        let outcome = f
            .controller
            .prepare_run(ctx(), plan_of(&["open"]))
            .await
            .expect("prepare")
            .run()
            .await;
        assert_eq!(outcome.state, RunState::Completed);

        f.controller
            .prepare_run(ctx(), plan_of(&["open"]))
            .await
            .expect("lease released");
    }

    #[tokio::test]
    async fn lost_lease_fails_the_run() {
        let f = fixture(ScriptedExecutor::new(), ScriptedJudge::always(true));
        let mut run = f
            .controller
            .prepare_run(ctx(), plan_of(&["open", "search"]))
            .await
            .expect("prepare");
        assert_eq!(run.step().await, RunState::Advancing);

        f.store
            .release_run_lease("task-1", &run.holder)
            .await
            .expect("release");
        f.store
            .acquire_run_lease("task-1", "intruder", Duration::from_secs(60))
            .await
            .expect("steal");

        assert_eq!(run.step().await, RunState::Failed);
        assert!(matches!(
            run.failure(),
            Some(FailureReason::CollaboratorUnavailable {
                collaborator: Collaborator::RecordStore,
                ..
            })
        ));
    }
}

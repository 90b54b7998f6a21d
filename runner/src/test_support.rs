//! Test-only builders and scripted collaborators.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;

use crate::core::events::ProgressEvent;
use crate::core::types::{
    ActualState, ElementState, ExpectedOutcome, Step, StepDraft, StepStatus, TaskPlan,
};
use crate::io::broadcaster::{BroadcastError, EventBroadcaster};
use crate::io::executor::{ExecutionError, StepExecutor};
use crate::io::fs_store::FsRecordStore;
use crate::io::judge::{JudgeError, Judgment, SemanticJudge};
use crate::io::planner::{Planner, PlannerError, RevisionRequest};

/// Deterministic pending step: action `do {name}`, expecting `{name} done`.
pub fn step(index: u32, name: &str) -> Step {
    draft(name).into_step(index, StepStatus::Pending)
}

pub fn draft(name: &str) -> StepDraft {
    StepDraft {
        description: name.to_string(),
        action: format!("do {name}"),
        expected_outcome: ExpectedOutcome::described(format!("{name} done")),
    }
}

/// Fresh plan with one step per name.
pub fn plan_of(names: &[&str]) -> TaskPlan {
    TaskPlan::from_drafts(names.iter().map(|name| draft(name)).collect())
}

/// Observation reporting `selector` as present or absent.
pub fn page_with(selector: &str, present: bool) -> ActualState {
    let mut states = BTreeMap::new();
    states.insert(
        selector.to_string(),
        ElementState {
            present,
            text: None,
        },
    );
    ActualState {
        dom_snapshot: "<html><body></body></html>".to_string(),
        url: "https://app.test/".to_string(),
        extracted_text: None,
        element_states: Some(states),
    }
}

/// Filesystem store rooted in a fresh temp dir. Keep the dir alive for as
/// long as the store is used.
pub fn temp_fs_store() -> std::io::Result<(tempfile::TempDir, FsRecordStore)> {
    let dir = tempfile::tempdir()?;
    let store = FsRecordStore::new(dir.path());
    Ok((dir, store))
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Handshake for holding an executor call in flight.
#[derive(Debug, Clone, Default)]
pub struct Gate {
    entered: Arc<Notify>,
    release: Arc<Notify>,
}

impl Gate {
    /// Wait until a gated call has started.
    pub async fn entered(&self) {
        self.entered.notified().await;
    }

    /// Let the gated call return.
    pub fn release(&self) {
        self.release.notify_one();
    }
}

type ExecutorReply = Result<ActualState, ExecutionError>;

/// Executor whose replies are keyed by a substring of the action.
///
/// Each key holds a reply sequence; the last reply repeats. Actions that match
/// no key observe `ActualState::default()`.
#[derive(Debug, Default)]
pub struct ScriptedExecutor {
    replies: Vec<(String, Mutex<VecDeque<ExecutorReply>>)>,
    delays: Vec<(String, Duration)>,
    gates: Vec<(String, Gate)>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(self, needle: &str, reply: ExecutorReply) -> Self {
        self.sequence(needle, vec![reply])
    }

    pub fn sequence(mut self, needle: &str, replies: Vec<ExecutorReply>) -> Self {
        self.replies
            .push((needle.to_string(), Mutex::new(replies.into())));
        self
    }

    pub fn with_delay(mut self, needle: &str, delay: Duration) -> Self {
        self.delays.push((needle.to_string(), delay));
        self
    }

    /// Hold matching calls until the returned gate is released.
    pub fn gate_on(&mut self, needle: &str) -> Gate {
        let gate = Gate::default();
        self.gates.push((needle.to_string(), gate.clone()));
        gate
    }

    /// Actions received, in call order.
    pub fn actions(&self) -> Vec<String> {
        lock(&self.calls).clone()
    }
}

#[async_trait]
impl StepExecutor for ScriptedExecutor {
    async fn execute(&self, action: &str) -> Result<ActualState, ExecutionError> {
        lock(&self.calls).push(action.to_string());

        for (needle, gate) in &self.gates {
            if action.contains(needle.as_str()) {
                gate.entered.notify_one();
                gate.release.notified().await;
            }
        }
        if let Some((_, delay)) = self
            .delays
            .iter()
            .find(|(needle, _)| action.contains(needle.as_str()))
        {
            tokio::time::sleep(*delay).await;
        }

        let Some((_, queue)) = self
            .replies
            .iter()
            .find(|(needle, _)| action.contains(needle.as_str()))
        else {
            return Ok(ActualState::default());
        };
        let mut queue = lock(queue);
        let reply = if queue.len() > 1 {
            queue.pop_front()
        } else {
            queue.front().cloned()
        };
        reply.unwrap_or_else(|| Ok(ActualState::default()))
    }
}

/// Judge with a default verdict and per-description overrides.
#[derive(Debug)]
pub struct ScriptedJudge {
    default: Result<Judgment, JudgeError>,
    overrides: Vec<(String, Judgment)>,
    delay: Option<Duration>,
    calls: AtomicUsize,
}

impl ScriptedJudge {
    pub fn always(is_match: bool) -> Self {
        let explanation = if is_match {
            "observation fits the intent"
        } else {
            "observation does not fit the intent"
        };
        Self {
            default: Ok(Judgment {
                is_match,
                explanation: explanation.to_string(),
            }),
            overrides: Vec::new(),
            delay: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn unavailable(message: &str) -> Self {
        Self {
            default: Err(JudgeError::Unavailable(message.to_string())),
            ..Self::always(false)
        }
    }

    /// Reject expectations whose description contains `needle`.
    pub fn rejecting(self, needle: &str, explanation: &str) -> Self {
        self.with_override(needle, false, explanation)
    }

    pub fn with_override(mut self, needle: &str, is_match: bool, explanation: &str) -> Self {
        self.overrides.push((
            needle.to_string(),
            Judgment {
                is_match,
                explanation: explanation.to_string(),
            },
        ));
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SemanticJudge for ScriptedJudge {
    async fn judge(
        &self,
        expected_description: &str,
        _actual: &ActualState,
    ) -> Result<Judgment, JudgeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if let Some((_, judgment)) = self
            .overrides
            .iter()
            .find(|(needle, _)| expected_description.contains(needle.as_str()))
        {
            return Ok(judgment.clone());
        }
        self.default.clone()
    }
}

/// Planner returning queued revisions and tails, then `None`.
#[derive(Debug, Default)]
pub struct ScriptedPlanner {
    revisions: Mutex<VecDeque<StepDraft>>,
    tails: Mutex<VecDeque<Vec<StepDraft>>>,
    unavailable: Option<String>,
    requests: Mutex<Vec<RevisionRequest>>,
}

impl ScriptedPlanner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn unavailable(message: &str) -> Self {
        Self {
            unavailable: Some(message.to_string()),
            ..Self::default()
        }
    }

    pub fn with_revision(self, draft: StepDraft) -> Self {
        lock(&self.revisions).push_back(draft);
        self
    }

    pub fn with_tail(self, tail: Vec<StepDraft>) -> Self {
        lock(&self.tails).push_back(tail);
        self
    }

    pub fn requests(&self) -> Vec<RevisionRequest> {
        lock(&self.requests).clone()
    }

    fn record(&self, request: &RevisionRequest) -> Result<(), PlannerError> {
        lock(&self.requests).push(request.clone());
        match &self.unavailable {
            Some(message) => Err(PlannerError::Unavailable(message.clone())),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl Planner for ScriptedPlanner {
    async fn revise_step(
        &self,
        request: &RevisionRequest,
    ) -> Result<Option<StepDraft>, PlannerError> {
        self.record(request)?;
        Ok(lock(&self.revisions).pop_front())
    }

    async fn replan_tail(
        &self,
        request: &RevisionRequest,
    ) -> Result<Option<Vec<StepDraft>>, PlannerError> {
        self.record(request)?;
        Ok(lock(&self.tails).pop_front())
    }
}

/// Broadcaster that keeps every published event.
#[derive(Debug, Default)]
pub struct RecordingBroadcaster {
    events: Mutex<Vec<(String, ProgressEvent)>>,
}

impl RecordingBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ProgressEvent> {
        lock(&self.events)
            .iter()
            .map(|(_, event)| event.clone())
            .collect()
    }

    /// Event names in publish order.
    pub fn names(&self) -> Vec<&'static str> {
        lock(&self.events)
            .iter()
            .map(|(_, event)| event.kind.name())
            .collect()
    }

    pub fn sessions(&self) -> Vec<String> {
        lock(&self.events)
            .iter()
            .map(|(session, _)| session.clone())
            .collect()
    }
}

#[async_trait]
impl EventBroadcaster for RecordingBroadcaster {
    async fn publish(&self, session_id: &str, event: ProgressEvent) -> Result<(), BroadcastError> {
        lock(&self.events).push((session_id.to_string(), event));
        Ok(())
    }
}

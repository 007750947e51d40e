//! Per-call conversational position: dialogue state, collected variables and the task stack.
//!
//! One `SessionState` exists per active call and is owned by exactly one orchestrator. The
//! task stack is an indexed arena with value semantics: the flow engine clones it, mutates the
//! clone by index and hands the result back, so no task is ever aliased between two holders.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Collected slot values keyed by parameter name.
pub type Variables = HashMap<String, serde_json::Value>;

/// Whose turn it is to speak.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TurnState {
    /// Agent is speaking.
    BotTurn,
    /// Awaiting or processing caller speech.
    UserTurn,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    InProgress,
    Paused,
    Completed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskMode {
    #[default]
    Normal,
    /// Caller demanded the result; ask only what is strictly required.
    Forced,
}

/// One active goal: the main transaction or a digression.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub goal_id: String,
    pub status: TaskStatus,
    pub mode: TaskMode,
    /// Dialogue state to resume at once this task is back on top.
    pub return_state: Option<String>,
}

impl Task {
    pub fn new(goal_id: impl Into<String>) -> Self {
        Self {
            goal_id: goal_id.into(),
            status: TaskStatus::InProgress,
            mode: TaskMode::Normal,
            return_state: None,
        }
    }

    pub fn with_mode(mut self, mode: TaskMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_return_state(mut self, state: impl Into<String>) -> Self {
        self.return_state = Some(state.into());
        self
    }

    pub fn with_status(mut self, status: TaskStatus) -> Self {
        self.status = status;
        self
    }
}

/// Ordered stack of tasks; index 0 is the bottom, the last entry drives state selection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskStack {
    tasks: Vec<Task>,
}

impl TaskStack {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stack holding a single task (used for the terminal reset).
    pub fn single(task: Task) -> Self {
        Self { tasks: vec![task] }
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn push(&mut self, task: Task) -> usize {
        self.tasks.push(task);
        self.tasks.len() - 1
    }

    pub fn pop(&mut self) -> Option<Task> {
        self.tasks.pop()
    }

    pub fn top(&self) -> Option<&Task> {
        self.tasks.last()
    }

    pub fn top_index(&self) -> Option<usize> {
        self.tasks.len().checked_sub(1)
    }

    pub fn get(&self, index: usize) -> Option<&Task> {
        self.tasks.get(index)
    }

    /// Apply `f` to the task at `index`. Returns false if the index is out of range.
    pub fn update<F>(&mut self, index: usize, f: F) -> bool
    where
        F: FnOnce(&mut Task),
    {
        match self.tasks.get_mut(index) {
            Some(task) => {
                f(task);
                true
            }
            None => false,
        }
    }

    /// Drop every task above `index`, leaving it on top.
    pub fn truncate_above(&mut self, index: usize) {
        self.tasks.truncate(index + 1);
    }

    /// Index of the nearest task, searching from the top, that satisfies `pred`.
    pub fn position_from_top<P>(&self, pred: P) -> Option<usize>
    where
        P: Fn(&Task) -> bool,
    {
        self.tasks.iter().rposition(pred)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Task> {
        self.tasks.iter()
    }
}

impl FromIterator<Task> for TaskStack {
    fn from_iter<I: IntoIterator<Item = Task>>(iter: I) -> Self {
        Self {
            tasks: iter.into_iter().collect(),
        }
    }
}

/// Pure output of the flow state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowResult {
    pub next_state: String,
    /// True when the caller is nested deep enough that the agent should steer back.
    pub should_guide_back: bool,
    pub task_stack: TaskStack,
}

impl FlowResult {
    pub fn new(next_state: impl Into<String>, task_stack: TaskStack) -> Self {
        Self {
            next_state: next_state.into(),
            should_guide_back: false,
            task_stack,
        }
    }

    pub fn guiding_back(mut self, should_guide_back: bool) -> Self {
        self.should_guide_back = should_guide_back;
        self
    }
}

/// Mutable record of one call's conversational position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionState {
    pub call_id: String,
    pub current_state: String,
    pub variables: Variables,
    /// Visited dialogue states, oldest first.
    pub history: Vec<String>,
    /// Leading intent from the previous classification (stability gate).
    pub previous_leader: Option<String>,
    pub turn: TurnState,
    pub task_stack: TaskStack,
    pub started_at: DateTime<Utc>,
}

impl SessionState {
    pub fn new(call_id: impl Into<String>, start_state: impl Into<String>) -> Self {
        let start_state = start_state.into();
        Self {
            call_id: call_id.into(),
            history: vec![start_state.clone()],
            current_state: start_state,
            variables: Variables::new(),
            previous_leader: None,
            turn: TurnState::BotTurn,
            task_stack: TaskStack::new(),
            started_at: Utc::now(),
        }
    }

    /// Adopt the state machine's decision.
    pub fn apply(&mut self, result: FlowResult) {
        self.history.push(result.next_state.clone());
        self.current_state = result.next_state;
        self.task_stack = result.task_stack;
    }

    pub fn set_variable(&mut self, name: impl Into<String>, value: serde_json::Value) {
        self.variables.insert(name.into(), value);
    }
}

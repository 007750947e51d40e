//! Goal/flow state machine: `(session, intent) -> (next dialogue state, task stack)`.
//!
//! Exactly one of five tiers handles an event, checked in fixed order:
//!
//! 1. terminal goal   - reset the stack to the terminal goal alone
//! 2. forcing goal    - force the main task, drop digressions above it, ask forced questions
//! 3. return intent   - pop the digression and resume the task below at its return state
//! 4. digression goal - pause the top task and push the aside
//! 5. happy path      - ask the next required parameter or follow the dialogue map
//!
//! The engine never mutates the session it is given; it works on a copy of the task stack and
//! returns the new stack inside the `FlowResult`.

use crate::catalog::{digression_answer_state, DialogueMap, Goal, GoalCatalog, GoalParameter};
use crate::error::{CoreError, CoreResult};
use crate::session::{FlowResult, SessionState, Task, TaskMode, TaskStack, TaskStatus, Variables};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

/// Reserved ids and thresholds used by the state machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowSettings {
    /// Goal pushed when the first scripted intent arrives on an empty stack.
    pub default_goal: String,
    pub summary_state: String,
    /// Intent that pops a digression.
    pub return_intent: String,
    /// Transition target meaning "switch the task to forced mode and ask again".
    pub force_check_sentinel: String,
    /// Resume state when the resumed task never recorded one.
    pub return_fallback_state: String,
    /// Used when a digression's answer state is not in the dialogue map.
    pub faq_fallback_state: String,
    /// Stack depth at which a new digression raises `should_guide_back`.
    pub guide_back_depth: usize,
}

impl Default for FlowSettings {
    fn default() -> Self {
        Self {
            default_goal: "provide_total_price".to_string(),
            summary_state: "summary_single".to_string(),
            return_intent: "return_to_main_goal".to_string(),
            force_check_sentinel: "RUN_FORCE_CHECK".to_string(),
            return_fallback_state: "start_greeting".to_string(),
            faq_fallback_state: "fallback_faq_state".to_string(),
            guide_back_depth: 3,
        }
    }
}

/// Pure decision function over the shared catalogs.
#[derive(Debug, Clone)]
pub struct FlowEngine {
    goals: Arc<GoalCatalog>,
    dialogue: Arc<DialogueMap>,
    settings: FlowSettings,
}

impl FlowEngine {
    pub fn new(goals: Arc<GoalCatalog>, dialogue: Arc<DialogueMap>, settings: FlowSettings) -> Self {
        Self {
            goals,
            dialogue,
            settings,
        }
    }

    pub fn goals(&self) -> &GoalCatalog {
        &self.goals
    }

    pub fn dialogue(&self) -> &DialogueMap {
        &self.dialogue
    }

    pub fn settings(&self) -> &FlowSettings {
        &self.settings
    }

    /// Decide the next dialogue state for a recognized intent.
    ///
    /// Errors only on catalog inconsistencies (unknown goal on the stack, terminal goal without
    /// a transition); those are fatal to the call.
    pub fn process_event(&self, session: &SessionState, intent_id: &str) -> CoreResult<FlowResult> {
        let mut stack = session.task_stack.clone();
        let goal = self.goals.goal_for_intent(intent_id);

        if let Some(goal) = goal.filter(|g| g.is_terminal) {
            debug!(call_id = %session.call_id, intent = %intent_id, goal = %goal.id, "terminal intent");
            return self.terminate(goal, intent_id);
        }

        if goal.is_some_and(|g| g.is_forcing) {
            if let Some(main) = stack.position_from_top(|t| !self.goals.is_digression(&t.goal_id)) {
                debug!(call_id = %session.call_id, intent = %intent_id, depth = stack.len(), "forcing main task");
                stack.truncate_above(main);
                stack.update(main, |t| {
                    t.mode = TaskMode::Forced;
                    t.status = TaskStatus::InProgress;
                });
                let main_goal = self.goal_of(&stack, main)?;
                return Ok(self.ask_forced(stack, main, main_goal, &session.variables));
            }
        }

        if intent_id == self.settings.return_intent && stack.len() > 1 {
            debug!(call_id = %session.call_id, depth = stack.len(), "returning to previous task");
            return Ok(self.resume(stack));
        }

        if let Some(goal) = goal.filter(|g| g.is_digression) {
            debug!(call_id = %session.call_id, intent = %intent_id, goal = %goal.id, depth = stack.len(), "digression");
            return Ok(self.digress(goal, intent_id, stack, &session.current_state));
        }

        self.advance(stack, session, intent_id)
    }

    /// Parameter the current dialogue state asks for, if any.
    ///
    /// Looks at the nearest non-digression task's goal, or the default goal when the stack holds
    /// only digressions (a call that opened with an aside still walks the default goal's states).
    pub fn parameter_for_state(&self, session: &SessionState) -> Option<&GoalParameter> {
        let stack = &session.task_stack;
        let goal_id = stack
            .position_from_top(|t| !self.goals.is_digression(&t.goal_id))
            .and_then(|index| stack.get(index))
            .map(|t| t.goal_id.as_str())
            .unwrap_or(&self.settings.default_goal);
        self.goals
            .goal(goal_id)?
            .parameter_asked_in(&session.current_state)
    }

    fn terminate(&self, goal: &Goal, intent_id: &str) -> CoreResult<FlowResult> {
        let stack = TaskStack::single(Task::new(goal.id.clone()));
        let param = goal
            .parameters
            .first()
            .ok_or_else(|| CoreError::EmptyGoal(goal.id.clone()))?;
        let next = self
            .dialogue
            .transition(&param.ask_state, intent_id)
            .ok_or_else(|| CoreError::MissingTerminalTransition {
                goal: goal.id.clone(),
                intent: intent_id.to_string(),
            })?;
        Ok(FlowResult::new(next, stack))
    }

    fn resume(&self, mut stack: TaskStack) -> FlowResult {
        stack.pop();
        let mut next = self.settings.return_fallback_state.clone();
        if let Some(top) = stack.top_index() {
            stack.update(top, |t| {
                t.status = TaskStatus::InProgress;
                if let Some(state) = &t.return_state {
                    next = state.clone();
                }
            });
        }
        FlowResult::new(next, stack)
    }

    fn digress(&self, goal: &Goal, intent_id: &str, mut stack: TaskStack, current_state: &str) -> FlowResult {
        let should_guide_back = stack.len() >= self.settings.guide_back_depth;
        if let Some(top) = stack.top_index() {
            stack.update(top, |t| {
                t.status = TaskStatus::Paused;
                t.return_state = Some(current_state.to_string());
            });
        }
        stack.push(Task::new(goal.id.clone()));

        let answer = digression_answer_state(goal);
        let next = match self.dialogue.state(&answer) {
            Some(state) => state
                .transitions
                .get(intent_id)
                .or(state.next_state.as_ref())
                .cloned()
                .unwrap_or(answer),
            None => self.settings.faq_fallback_state.clone(),
        };
        FlowResult::new(next, stack).guiding_back(should_guide_back)
    }

    fn advance(&self, mut stack: TaskStack, session: &SessionState, intent_id: &str) -> CoreResult<FlowResult> {
        if stack.is_empty() {
            stack.push(Task::new(self.settings.default_goal.clone()));
        }
        let top = stack.top_index().unwrap_or_default();
        let goal = self.goal_of(&stack, top)?;
        let variables = &session.variables;

        let mode = stack.get(top).map(|t| t.mode).unwrap_or_default();
        if mode == TaskMode::Forced {
            return Ok(self.ask_forced(stack, top, goal, variables));
        }

        if let Some(param) = goal.next_required_parameter(variables) {
            return Ok(FlowResult::new(param.ask_state.clone(), stack));
        }

        match self.dialogue.transition(&session.current_state, intent_id) {
            Some(target) if target == self.settings.force_check_sentinel => {
                debug!(call_id = %session.call_id, goal = %goal.id, "force check requested by transition");
                stack.update(top, |t| t.mode = TaskMode::Forced);
                Ok(self.ask_forced(stack, top, goal, variables))
            }
            Some(target) => Ok(FlowResult::new(target, stack)),
            // The required-parameter scan already came up empty, so only the summary is left.
            None => Ok(FlowResult::new(self.settings.summary_state.clone(), stack)),
        }
    }

    /// Ask the next forced question, or complete the task and summarize.
    fn ask_forced(&self, mut stack: TaskStack, index: usize, goal: &Goal, variables: &Variables) -> FlowResult {
        match goal.next_required_parameter(variables) {
            Some(param) => FlowResult::new(param.state_for(TaskMode::Forced), stack),
            None => {
                stack.update(index, |t| t.status = TaskStatus::Completed);
                FlowResult::new(self.settings.summary_state.clone(), stack)
            }
        }
    }

    fn goal_of(&self, stack: &TaskStack, index: usize) -> CoreResult<&Goal> {
        let goal_id = stack
            .get(index)
            .map(|t| t.goal_id.as_str())
            .unwrap_or_default();
        self.goals
            .goal(goal_id)
            .ok_or_else(|| CoreError::UnknownGoal(goal_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn engine() -> FlowEngine {
        let goals = GoalCatalog::from_json_str(
            r#"{
                "main": {"parameters": [
                    {"name": "a", "dialogue_state_to_ask": "ask_a", "force_dialogue_state_to_ask": "force_a", "is_required": true},
                    {"name": "b", "dialogue_state_to_ask": "ask_b", "is_required": true}
                ]},
                "faq_x": {"is_digression": true, "dialogue_state_to_ask": "info_x"},
                "hurry": {"is_forcing": true, "is_digression": true}
            }"#,
        )
        .unwrap();
        let dialogue = DialogueMap::from_json_str(
            r#"{
                "info_x": {},
                "ask_b": {"transitions": {"later": "RUN_FORCE_CHECK"}},
                "done": {"transitions": {"ok": "RUN_FORCE_CHECK"}}
            }"#,
        )
        .unwrap();
        let settings = FlowSettings {
            default_goal: "main".into(),
            ..Default::default()
        };
        FlowEngine::new(Arc::new(goals), Arc::new(dialogue), settings)
    }

    #[test]
    fn empty_stack_pushes_default_goal() {
        let session = SessionState::new("c", "start_greeting");
        let result = engine().process_event(&session, "hello").unwrap();
        assert_eq!(result.next_state, "ask_a");
        assert_eq!(result.task_stack.len(), 1);
        assert_eq!(result.task_stack.top().unwrap().goal_id, "main");
    }

    #[test]
    fn force_check_sentinel_flips_mode_once() {
        let mut session = SessionState::new("c", "done");
        session.task_stack = TaskStack::single(Task::new("main"));
        session.set_variable("a", json!(1));
        session.set_variable("b", json!(2));

        let result = engine().process_event(&session, "ok").unwrap();
        let top = result.task_stack.top().unwrap();
        assert_eq!(top.mode, TaskMode::Forced);
        assert_eq!(top.status, TaskStatus::Completed);
        assert_eq!(result.next_state, "summary_single");
    }

    #[test]
    fn forcing_without_main_task_falls_through() {
        // "hurry" is also a digression: with nothing to force it is handled as an aside.
        let session = SessionState::new("c", "start_greeting");
        let result = engine().process_event(&session, "hurry").unwrap();
        assert_eq!(result.task_stack.len(), 1);
        assert_eq!(result.task_stack.top().unwrap().goal_id, "hurry");
        assert_eq!(result.next_state, "fallback_faq_state");
    }

    #[test]
    fn unknown_goal_on_stack_is_an_error() {
        let mut session = SessionState::new("c", "x");
        session.task_stack = TaskStack::single(Task::new("ghost"));
        let err = engine().process_event(&session, "anything").unwrap_err();
        assert!(matches!(err, CoreError::UnknownGoal(g) if g == "ghost"));
    }

    #[test]
    fn input_session_is_not_mutated() {
        let mut session = SessionState::new("c", "ask_a");
        session.task_stack = TaskStack::single(Task::new("main"));
        let before = session.task_stack.clone();
        let _ = engine().process_event(&session, "faq_x").unwrap();
        assert_eq!(session.task_stack, before);
    }

    #[test]
    fn parameter_for_state_skips_digressions() {
        let mut session = SessionState::new("c", "ask_b");
        session.task_stack = TaskStack::single(Task::new("faq_x"));
        assert_eq!(engine().parameter_for_state(&session).unwrap().name, "b");

        session.task_stack = [Task::new("main"), Task::new("faq_x")].into_iter().collect();
        assert_eq!(engine().parameter_for_state(&session).unwrap().name, "b");
    }

    #[test]
    fn forcing_with_nothing_left_completes_the_main_task() {
        let mut session = SessionState::new("c", "info_x");
        session.task_stack = [Task::new("main"), Task::new("faq_x")].into_iter().collect();
        session.set_variable("a", json!(1));
        session.set_variable("b", json!(2));

        let result = engine().process_event(&session, "hurry").unwrap();
        assert_eq!(result.next_state, "summary_single");
        assert_eq!(result.task_stack.len(), 1);
        let main = result.task_stack.top().unwrap();
        assert_eq!(main.goal_id, "main");
        assert_eq!(main.mode, TaskMode::Forced);
        assert_eq!(main.status, TaskStatus::Completed);
    }

    #[test]
    fn parameter_for_state_falls_back_to_default_goal() {
        let mut session = SessionState::new("c", "force_a");
        assert_eq!(engine().parameter_for_state(&session).unwrap().name, "a");
        session.current_state = "elsewhere".into();
        assert!(engine().parameter_for_state(&session).is_none());
    }
}

//! Replays a chaotic caller straight against the flow engine and logs the task stack after
//! every event. No audio, no collaborators.

use anyhow::{bail, Context};
use parley_core::{Catalogs, FlowEngine, ParleyConfig, SessionState, TaskStack};
use serde_json::{json, Value};
use tracing::info;

struct Step {
    intent: &'static str,
    /// Variables the caller supplied along with the intent.
    fills: Vec<(&'static str, Value)>,
}

fn step(intent: &'static str) -> Step {
    Step {
        intent,
        fills: Vec::new(),
    }
}

fn step_with(intent: &'static str, name: &'static str, value: Value) -> Step {
    Step {
        intent,
        fills: vec![(name, value)],
    }
}

fn chaotic_caller() -> Vec<Step> {
    vec![
        step("start_dialogue"),
        step_with("ask_company", "contact_name", json!("Alexander")),
        step("ask_robot"),
        step("demand_final_answer_cost"),
        step_with("provide_number", "property_value", json!(5_000_000)),
        step("government_compensation"),
        step("return_to_main_goal"),
        step_with("confirm_yes", "wants_inner_insurance", json!(true)),
        step_with("provide_number", "inner_amount", json!(1_000_000)),
        step("provide_reject_reason"),
    ]
}

fn describe(stack: &TaskStack) -> String {
    stack
        .iter()
        .map(|task| format!("{}:{:?}:{:?}", task.goal_id, task.mode, task.status))
        .collect::<Vec<_>>()
        .join(" > ")
}

pub fn run(catalogs: &Catalogs, config: &ParleyConfig) -> anyhow::Result<()> {
    let engine = FlowEngine::new(catalogs.goals.clone(), catalogs.dialogue.clone(), config.flow.clone());
    let mut session = SessionState::new("stress_test_call", config.call.start_state.clone());

    for (index, step) in chaotic_caller().into_iter().enumerate() {
        for (name, value) in step.fills {
            session.set_variable(name, value);
        }
        let from = session.current_state.clone();
        let result = engine
            .process_event(&session, step.intent)
            .with_context(|| format!("step {} ({})", index + 1, step.intent))?;
        if result.task_stack.is_empty() {
            bail!("task stack emptied at step {} ({})", index + 1, step.intent);
        }
        info!(
            step = index + 1,
            intent = step.intent,
            %from,
            to = %result.next_state,
            guide_back = result.should_guide_back,
            stack = %describe(&result.task_stack),
            "stress step"
        );
        session.apply(result);
    }

    info!(
        final_state = %session.current_state,
        history = session.history.len(),
        "stress scenario finished"
    );
    Ok(())
}

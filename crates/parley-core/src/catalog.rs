//! Read-only catalogs loaded once at startup: the goal catalog and the dialogue map.
//!
//! Both are JSON documents keyed by id. Catalogs are shared by every call and never mutated
//! after load, so callers hold them behind `Arc`.

use crate::error::{CoreError, CoreResult};
use crate::requirement::Requirement;
use crate::session::{TaskMode, Variables};
use crate::template::double_brace_regex;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

/// Parse a JSON catalog file.
pub fn load_json<T: DeserializeOwned>(path: &Path) -> CoreResult<T> {
    if !path.exists() {
        return Err(CoreError::CatalogNotFound(path.display().to_string()));
    }
    let content = std::fs::read_to_string(path)?;
    serde_json::from_str(&content).map_err(|source| CoreError::CatalogParse {
        path: path.display().to_string(),
        source,
    })
}

// -----------------------------------------------------------------------------
// Goal catalog
// -----------------------------------------------------------------------------

/// One slot a goal needs filled.
#[derive(Debug, Clone, Deserialize)]
pub struct GoalParameter {
    pub name: String,
    /// Dialogue state that asks for this parameter.
    #[serde(rename = "dialogue_state_to_ask")]
    pub ask_state: String,
    /// Shorter variant used once the caller forced the goal.
    #[serde(rename = "force_dialogue_state_to_ask", default)]
    pub forced_ask_state: Option<String>,
    #[serde(rename = "is_required", default)]
    pub required: Requirement,
}

impl GoalParameter {
    /// Question state for the given task mode; forced falls back to the normal state.
    pub fn state_for(&self, mode: TaskMode) -> &str {
        match mode {
            TaskMode::Forced => self.forced_ask_state.as_deref().unwrap_or(&self.ask_state),
            TaskMode::Normal => &self.ask_state,
        }
    }

    pub fn asks_in(&self, state: &str) -> bool {
        self.ask_state == state || self.forced_ask_state.as_deref() == Some(state)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Goal {
    /// Filled from the catalog key after load.
    #[serde(skip)]
    pub id: String,
    /// Intent that enters this goal when it differs from the goal id.
    #[serde(default)]
    pub intent: Option<String>,
    #[serde(default)]
    pub is_terminal: bool,
    #[serde(default)]
    pub is_forcing: bool,
    #[serde(default)]
    pub is_digression: bool,
    /// Answer state for digressions.
    #[serde(rename = "dialogue_state_to_ask", default)]
    pub answer_state: Option<String>,
    #[serde(default)]
    pub parameters: Vec<GoalParameter>,
}

impl Goal {
    /// First parameter, in catalog order, that is required and not yet collected.
    pub fn next_required_parameter(&self, variables: &Variables) -> Option<&GoalParameter> {
        self.parameters
            .iter()
            .filter(|p| !variables.contains_key(&p.name))
            .find(|p| p.required.is_required(variables))
    }

    pub fn parameter_asked_in(&self, state: &str) -> Option<&GoalParameter> {
        self.parameters.iter().find(|p| p.asks_in(state))
    }
}

#[derive(Debug, Clone, Default)]
pub struct GoalCatalog {
    goals: BTreeMap<String, Goal>,
}

impl<'de> Deserialize<'de> for GoalCatalog {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let mut goals = BTreeMap::<String, Goal>::deserialize(deserializer)?;
        for (id, goal) in goals.iter_mut() {
            goal.id = id.clone();
        }
        Ok(Self { goals })
    }
}

impl GoalCatalog {
    pub fn load(path: &Path) -> CoreResult<Self> {
        load_json(path)
    }

    pub fn from_json_str(json: &str) -> CoreResult<Self> {
        serde_json::from_str(json).map_err(|source| CoreError::CatalogParse {
            path: "<inline>".to_string(),
            source,
        })
    }

    pub fn goal(&self, id: &str) -> Option<&Goal> {
        self.goals.get(id)
    }

    /// Goal entered by `intent_id`: the goal with that id, else the first goal naming it.
    pub fn goal_for_intent(&self, intent_id: &str) -> Option<&Goal> {
        self.goals.get(intent_id).or_else(|| {
            self.goals
                .values()
                .find(|g| g.intent.as_deref() == Some(intent_id))
        })
    }

    pub fn is_digression(&self, goal_id: &str) -> bool {
        self.goals.get(goal_id).is_some_and(|g| g.is_digression)
    }

    pub fn goals(&self) -> impl Iterator<Item = &Goal> {
        self.goals.values()
    }

    pub fn len(&self) -> usize {
        self.goals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.goals.is_empty()
    }
}

// -----------------------------------------------------------------------------
// Dialogue map
// -----------------------------------------------------------------------------

/// One audio-producing entry of a response playlist.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum PlaylistItem {
    /// Precomputed chunks from the audio cache.
    #[serde(alias = "filler")]
    Cache { key: String },
    /// Synthesized from a template rendered against session variables.
    Tts { text_template: String },
    /// Synthesized as-is; braces in the text are spoken, not substituted.
    Text { text: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResponseAction {
    EndCall,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SystemResponse {
    #[serde(default)]
    pub template: Option<String>,
    #[serde(default)]
    pub redis_key: Option<String>,
    #[serde(default)]
    pub playlist: Option<Vec<PlaylistItem>>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum TransitionSpec {
    Target(String),
    Detailed { next_state: String },
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DialogueState {
    #[serde(default)]
    pub system_response: SystemResponse,
    #[serde(default, deserialize_with = "deserialize_transitions")]
    pub transitions: BTreeMap<String, String>,
    #[serde(default)]
    pub action: Option<ResponseAction>,
    /// Default successor, used by digression answers without a matching transition.
    #[serde(default)]
    pub next_state: Option<String>,
}

fn deserialize_transitions<'de, D>(deserializer: D) -> Result<BTreeMap<String, String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw = BTreeMap::<String, TransitionSpec>::deserialize(deserializer)?;
    Ok(raw
        .into_iter()
        .map(|(intent, spec)| {
            let target = match spec {
                TransitionSpec::Target(s) => s,
                TransitionSpec::Detailed { next_state } => next_state,
            };
            (intent, target)
        })
        .collect())
}

impl DialogueState {
    pub fn playlist(&self) -> &[PlaylistItem] {
        self.system_response.playlist.as_deref().unwrap_or_default()
    }

    pub fn ends_call(&self) -> bool {
        self.action == Some(ResponseAction::EndCall)
    }
}

#[derive(Debug, Clone, Default)]
pub struct DialogueMap {
    states: BTreeMap<String, DialogueState>,
}

impl<'de> Deserialize<'de> for DialogueMap {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let mut states = BTreeMap::<String, DialogueState>::deserialize(deserializer)?;
        for (id, state) in states.iter_mut() {
            if state.system_response.playlist.is_none() {
                if let Some(template) = state.system_response.template.as_deref() {
                    let playlist =
                        playlist_from_template(id, template, state.system_response.redis_key.as_deref());
                    state.system_response.playlist = Some(playlist);
                }
            }
        }
        Ok(Self { states })
    }
}

impl DialogueMap {
    pub fn load(path: &Path) -> CoreResult<Self> {
        load_json(path)
    }

    pub fn from_json_str(json: &str) -> CoreResult<Self> {
        serde_json::from_str(json).map_err(|source| CoreError::CatalogParse {
            path: "<inline>".to_string(),
            source,
        })
    }

    pub fn state(&self, id: &str) -> Option<&DialogueState> {
        self.states.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.states.contains_key(id)
    }

    pub fn transition(&self, state: &str, intent_id: &str) -> Option<&str> {
        self.states
            .get(state)
            .and_then(|s| s.transitions.get(intent_id))
            .map(String::as_str)
    }

    /// Intents accepted in `state`, in key order.
    pub fn expected_intents(&self, state: &str) -> Vec<String> {
        self.states
            .get(state)
            .map(|s| s.transitions.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn playlist(&self, state: &str) -> &[PlaylistItem] {
        self.states.get(state).map(|s| s.playlist()).unwrap_or_default()
    }

    pub fn ends_call(&self, state: &str) -> bool {
        self.states.get(state).is_some_and(DialogueState::ends_call)
    }

    pub fn states(&self) -> impl Iterator<Item = (&str, &DialogueState)> {
        self.states.iter().map(|(id, state)| (id.as_str(), state))
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}

/// Split a response template into cached static parts and synthesized placeholders.
///
/// Keys follow the audio loader's convention: `static:<state>` for a template with no
/// placeholders (unless `redis_key` is given) and `static:<state>_part_<i>` for segments.
pub fn playlist_from_template(state_id: &str, template: &str, redis_key: Option<&str>) -> Vec<PlaylistItem> {
    let re = double_brace_regex();
    let placeholders: Vec<&str> = re.find_iter(template).map(|m| m.as_str()).collect();
    if placeholders.is_empty() {
        let key = redis_key
            .map(str::to_string)
            .unwrap_or_else(|| format!("static:{state_id}"));
        return vec![PlaylistItem::Cache { key }];
    }

    let mut playlist = Vec::new();
    for (i, part) in re.split(template).enumerate() {
        if !part.is_empty() {
            playlist.push(PlaylistItem::Cache {
                key: format!("static:{state_id}_part_{i}"),
            });
        }
        if let Some(placeholder) = placeholders.get(i) {
            playlist.push(PlaylistItem::Tts {
                text_template: placeholder.to_string(),
            });
        }
    }
    playlist
}

// -----------------------------------------------------------------------------
// Cross-catalog validation
// -----------------------------------------------------------------------------

/// Non-fatal inconsistency between the goal catalog and the dialogue map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CatalogIssue {
    MissingAskState { goal: String, parameter: String, state: String },
    MissingAnswerState { goal: String, state: String },
    UndeclaredRuleVariable { goal: String, parameter: String, variable: String },
    TerminalWithoutParameters { goal: String },
}

impl fmt::Display for CatalogIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CatalogIssue::MissingAskState { goal, parameter, state } => {
                write!(f, "goal {goal}: parameter {parameter} asks in unknown state {state}")
            }
            CatalogIssue::MissingAnswerState { goal, state } => {
                write!(f, "digression {goal}: answer state {state} is not in the dialogue map")
            }
            CatalogIssue::UndeclaredRuleVariable { goal, parameter, variable } => {
                write!(f, "goal {goal}: rule of {parameter} reads undeclared variable {variable}")
            }
            CatalogIssue::TerminalWithoutParameters { goal } => {
                write!(f, "terminal goal {goal} has no parameter to resolve its transition")
            }
        }
    }
}

/// Check the catalogs against each other. A missing default goal is a hard error.
pub fn validate(goals: &GoalCatalog, dialogue: &DialogueMap, default_goal: &str) -> CoreResult<Vec<CatalogIssue>> {
    if goals.goal(default_goal).is_none() {
        return Err(CoreError::UnknownGoal(default_goal.to_string()));
    }

    let mut issues = Vec::new();
    for goal in goals.goals() {
        if goal.is_terminal && goal.parameters.is_empty() {
            issues.push(CatalogIssue::TerminalWithoutParameters { goal: goal.id.clone() });
        }
        if goal.is_digression {
            let state = digression_answer_state(goal);
            if !dialogue.contains(&state) {
                issues.push(CatalogIssue::MissingAnswerState {
                    goal: goal.id.clone(),
                    state,
                });
            }
        }
        for param in &goal.parameters {
            let states = std::iter::once(param.ask_state.as_str()).chain(param.forced_ask_state.as_deref());
            for state in states {
                if !dialogue.contains(state) {
                    issues.push(CatalogIssue::MissingAskState {
                        goal: goal.id.clone(),
                        parameter: param.name.clone(),
                        state: state.to_string(),
                    });
                }
            }
            if let Some(variable) = param.required.variable() {
                if !goal.parameters.iter().any(|p| p.name == variable) {
                    issues.push(CatalogIssue::UndeclaredRuleVariable {
                        goal: goal.id.clone(),
                        parameter: param.name.clone(),
                        variable: variable.to_string(),
                    });
                }
            }
        }
    }
    Ok(issues)
}

/// Configured answer state, or `info_<last segment of the goal id>`.
pub fn digression_answer_state(goal: &Goal) -> String {
    goal.answer_state.clone().unwrap_or_else(|| {
        let suffix = goal.id.rsplit('_').next().unwrap_or(&goal.id);
        format!("info_{suffix}")
    })
}

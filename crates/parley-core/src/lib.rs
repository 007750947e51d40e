//! parley-core: the synchronous half of the dialogue protocol.
//!
//! Holds the per-call [`SessionState`], the task-stack arena, the read-only goal catalog and
//! dialogue map, and the [`FlowEngine`] that decides which dialogue state comes next. Nothing in
//! this crate performs I/O after startup or suspends; the async orchestrator in `parley-voice`
//! calls into it between awaits.

mod catalog;
mod config;
mod error;
mod flow;
mod requirement;
mod session;
pub mod template;

pub use catalog::{
    digression_answer_state, load_json, playlist_from_template, validate, CatalogIssue, DialogueMap,
    DialogueState, Goal, GoalCatalog, GoalParameter, PlaylistItem, ResponseAction, SystemResponse,
};
pub use config::{CallSettings, CatalogPaths, Catalogs, ParleyConfig};
pub use error::{CoreError, CoreResult};
pub use flow::{FlowEngine, FlowSettings};
pub use requirement::Requirement;
pub use session::{
    FlowResult, SessionState, Task, TaskMode, TaskStack, TaskStatus, TurnState, Variables,
};

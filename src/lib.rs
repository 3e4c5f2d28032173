//! Text2SQL dialogue agent for a hierarchical education-metrics database.
//!
//! Natural-language questions are classified, checked for ambiguity against
//! the metric taxonomy, clarified with the user when needed, and only then
//! turned into SQL, executed, and answered. See [`graph::AgentGraph`] for the
//! orchestration state machine.

pub mod ambiguity;
pub mod app;
pub mod assemble;
pub mod config;
pub mod error;
pub mod events;
pub mod executor;
pub mod graph;
pub mod hierarchy;
pub mod intent;
pub mod llm;
pub mod matcher;
pub mod resolver;
pub mod services;
pub mod session;

pub use error::{AgentError, Result};
pub use graph::{AgentGraph, TurnOutcome};
pub use session::SessionStore;

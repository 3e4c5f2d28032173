//! Per-conversation state and the keyed store that owns it.
//!
//! The store hands out `Arc<Mutex<SessionState>>` entries; the graph engine
//! holds the lock for the whole turn, so turns for one session are strictly
//! sequential while different sessions proceed in parallel.

use crate::ambiguity::{AmbiguityIssue, ScopeOption};
use crate::graph::NodeId;
use crate::intent::IntentType;
use crate::resolver::ResolvedMetric;
use crate::services::QueryRows;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Everything one conversation has accumulated. Mutated only by the graph
/// engine while it holds the session lock.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionState {
    pub session_id: String,
    pub turn_history: Vec<Message>,
    pub intent_type: Option<IntentType>,
    pub identified_metrics: Vec<ResolvedMetric>,
    pub scope_choices: HashMap<String, ScopeOption>,
    pub provided_params: HashMap<String, String>,
    pub open_issues: Vec<AmbiguityIssue>,
    pub refined_intent: Option<String>,
    pub generated_sql: Option<String>,
    pub execution_result: Option<QueryRows>,
    pub failure: Option<String>,
    pub retry_count: u8,
    pub clarification_count: u8,
    /// Clarification replies that matched no expected answer, folded into
    /// the refined intent verbatim once re-asking is exhausted.
    pub fallback_notes: Vec<String>,
    pub pending_node: Option<NodeId>,
    /// The utterance that opened the current question, kept across
    /// clarification turns so evaluation context stays stable.
    pub active_utterance: String,
}

impl SessionState {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            turn_history: Vec::new(),
            intent_type: None,
            identified_metrics: Vec::new(),
            scope_choices: HashMap::new(),
            provided_params: HashMap::new(),
            open_issues: Vec::new(),
            refined_intent: None,
            generated_sql: None,
            execution_result: None,
            failure: None,
            retry_count: 0,
            clarification_count: 0,
            fallback_notes: Vec::new(),
            pending_node: None,
            active_utterance: String::new(),
        }
    }

    /// True when the last turn suspended waiting for a clarification reply.
    pub fn is_suspended(&self) -> bool {
        self.pending_node == Some(NodeId::Clarify)
    }

    /// Promotes newly resolved metrics, skipping ids already identified.
    pub fn merge_metrics(&mut self, metrics: Vec<ResolvedMetric>) {
        for metric in metrics {
            if !self
                .identified_metrics
                .iter()
                .any(|m| m.node_id == metric.node_id)
            {
                self.identified_metrics.push(metric);
            }
        }
    }

    /// Clears per-question working state when a fresh question arrives.
    /// History, scope choices, and provided parameters carry across.
    pub fn begin_question(&mut self, utterance: &str) {
        self.identified_metrics.clear();
        self.open_issues.clear();
        self.refined_intent = None;
        self.generated_sql = None;
        self.execution_result = None;
        self.failure = None;
        self.retry_count = 0;
        self.clarification_count = 0;
        self.fallback_notes.clear();
        self.pending_node = None;
        self.active_utterance = utterance.to_string();
    }
}

/// Keyed store: independent entries, per-session mutex.
pub struct SessionStore {
    sessions: DashMap<String, Arc<Mutex<SessionState>>>,
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionStore {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
        }
    }

    pub fn generate_id() -> String {
        Uuid::new_v4().to_string()
    }

    /// Fresh state is created for unknown ids; a malformed or stale id is
    /// recovered locally, never an error.
    pub fn get_or_create(&self, session_id: &str) -> Arc<Mutex<SessionState>> {
        self.sessions
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(SessionState::new(session_id))))
            .clone()
    }

    /// Drops the session. Returns whether anything was removed.
    pub fn reset(&self, session_id: &str) -> bool {
        self.sessions.remove(session_id).is_some()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_get_or_create_returns_same_entry() {
        let store = SessionStore::new();
        let a = store.get_or_create("s1");
        let b = store.get_or_create("s1");
        {
            let mut state = a.lock().await;
            state.retry_count = 1;
        }
        assert_eq!(b.lock().await.retry_count, 1);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_reset_drops_state() {
        let store = SessionStore::new();
        store.get_or_create("s1");
        assert!(store.reset("s1"));
        assert!(!store.reset("s1"));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_begin_question_keeps_history_and_choices() {
        let store = SessionStore::new();
        let entry = store.get_or_create("s1");
        let mut state = entry.lock().await;
        state.turn_history.push(Message::user("第一个问题"));
        state
            .scope_choices
            .insert("infra".to_string(), crate::ambiguity::ScopeOption::Rollup);
        state.retry_count = 2;
        state.begin_question("第二个问题");
        assert_eq!(state.turn_history.len(), 1);
        assert_eq!(state.scope_choices.len(), 1);
        assert_eq!(state.retry_count, 0);
        assert_eq!(state.active_utterance, "第二个问题");
    }
}

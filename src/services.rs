//! Contracts for the external collaborators: the chat LLM, the fuzzy term
//! matcher, the text-to-SQL model, and the database. The orchestration
//! engine only ever sees these traits, so tests swap in scripted
//! implementations and the binaries wire up the real clients.

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One fuzzy-match candidate returned by the term matcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FuzzyCandidate {
    pub metric_id: String,
    pub score: f64,
}

/// Everything the SQL generator is allowed to see. `refined_user_query` is
/// the disambiguated restatement of the request; the raw utterance is never
/// placed here.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GenerationPayload {
    pub instruction: String,
    pub full_schema: String,
    pub metric_context: String,
    pub refined_user_query: String,
    pub prior_sql: Option<String>,
    pub prior_error_feedback: Option<String>,
}

/// Column-ordered result set decoded from the database.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryRows {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

impl QueryRows {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Chat completion used for intent classification and answer phrasing.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn complete(&self, prompt: &str) -> Result<String>;
}

/// Embedding-backed (or local) fuzzy lookup from free text to metric ids.
#[async_trait]
pub trait TermMatcher: Send + Sync {
    async fn match_terms(&self, text: &str, top_k: usize) -> Result<Vec<FuzzyCandidate>>;
}

/// The fine-tuned text-to-SQL model.
#[async_trait]
pub trait SqlGenerator: Send + Sync {
    async fn generate(&self, payload: &GenerationPayload) -> Result<String>;
}

/// Read-only query execution against the metrics database.
#[async_trait]
pub trait SqlExecutor: Send + Sync {
    async fn execute(&self, sql: &str) -> Result<QueryRows>;
}

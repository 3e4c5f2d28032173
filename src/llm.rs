//! OpenAI-compatible HTTP clients: the chat LLM, the fine-tuned text-to-SQL
//! model, and the embedding endpoint.

use crate::config::{EmbeddingConfig, LlmConfig, SqlModelConfig};
use crate::error::{AgentError, Result};
use crate::services::{GenerationPayload, LanguageModel, SqlGenerator};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    content: String,
}

/// Thin chat-completions client. One instance per configured endpoint.
pub struct OpenAiChatClient {
    client: reqwest::Client,
    api_base: String,
    api_key: String,
    model: String,
    temperature: f32,
    max_tokens: u32,
}

impl OpenAiChatClient {
    pub fn from_llm_config(config: &LlmConfig, timeout_secs: u64) -> Result<Self> {
        Self::build(
            &config.api_base,
            &config.api_key,
            &config.model_name,
            config.temperature,
            config.max_tokens,
            timeout_secs,
        )
    }

    pub fn from_sql_model_config(config: &SqlModelConfig, timeout_secs: u64) -> Result<Self> {
        Self::build(
            &config.api_base,
            &config.api_key,
            &config.model_name,
            config.temperature,
            config.max_tokens,
            timeout_secs,
        )
    }

    fn build(
        api_base: &str,
        api_key: &str,
        model: &str,
        temperature: f32,
        max_tokens: u32,
        timeout_secs: u64,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| AgentError::Config(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            api_base: api_base.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
            temperature,
            max_tokens,
        })
    }

    pub async fn chat(&self, prompt: &str) -> Result<String> {
        let url = format!("{}/chat/completions", self.api_base);
        let body = json!({
            "model": self.model,
            "messages": [ChatMessage { role: "user", content: prompt }],
            "temperature": self.temperature,
            "max_tokens": self.max_tokens,
        });

        debug!(model = %self.model, prompt_len = prompt.len(), "chat completion request");
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| AgentError::Llm(format!("request to {} failed: {}", url, e)))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(AgentError::Llm(format!(
                "model endpoint returned {}: {}",
                status, text
            )));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| AgentError::Llm(format!("malformed completion response: {}", e)))?;
        parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| AgentError::Llm("completion had no choices".to_string()))
    }
}

#[async_trait]
impl LanguageModel for OpenAiChatClient {
    async fn complete(&self, prompt: &str) -> Result<String> {
        self.chat(prompt).await
    }
}

/// Adapter from the fine-tuned SQL model endpoint to the generator contract.
pub struct LlmSqlGenerator {
    chat: OpenAiChatClient,
}

impl LlmSqlGenerator {
    pub fn new(config: &SqlModelConfig, timeout_secs: u64) -> Result<Self> {
        Ok(Self {
            chat: OpenAiChatClient::from_sql_model_config(config, timeout_secs)?,
        })
    }
}

#[async_trait]
impl SqlGenerator for LlmSqlGenerator {
    async fn generate(&self, payload: &GenerationPayload) -> Result<String> {
        let mut prompt = format!(
            "{}\n\n### 数据库结构\n{}\n\n### 指标口径\n{}\n\n### 用户需求\n{}\n",
            payload.instruction,
            payload.full_schema,
            payload.metric_context,
            payload.refined_user_query,
        );
        if let Some(prior_sql) = &payload.prior_sql {
            prompt.push_str(&format!("\n### 上一次生成的SQL\n{}\n", prior_sql));
        }
        if let Some(feedback) = &payload.prior_error_feedback {
            prompt.push_str(&format!(
                "\n### 执行反馈\n{}\n请修正上述问题后重新生成SQL。\n",
                feedback
            ));
        }
        prompt.push_str("\n只输出一条SELECT语句，不要输出任何解释。");

        let raw = self
            .chat
            .chat(&prompt)
            .await
            .map_err(|e| AgentError::Generation(e.to_string()))?;
        let sql = clean_sql(&raw);
        if sql.is_empty() {
            return Err(AgentError::Generation(
                "model returned an empty statement".to_string(),
            ));
        }
        Ok(sql)
    }
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingDatum>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingDatum {
    embedding: Vec<f32>,
}

pub struct EmbeddingClient {
    client: reqwest::Client,
    api_base: String,
    api_key: String,
    model: String,
}

impl EmbeddingClient {
    pub fn new(config: &EmbeddingConfig, timeout_secs: u64) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| AgentError::Config(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            model: config.model_name.clone(),
        })
    }

    pub async fn embed(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>> {
        let url = format!("{}/embeddings", self.api_base);
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&json!({ "model": self.model, "input": inputs }))
            .send()
            .await
            .map_err(|e| AgentError::Llm(format!("embedding request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(AgentError::Llm(format!(
                "embedding endpoint returned {}: {}",
                status, text
            )));
        }

        let parsed: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| AgentError::Llm(format!("malformed embedding response: {}", e)))?;
        if parsed.data.len() != inputs.len() {
            return Err(AgentError::Llm(format!(
                "embedding count mismatch: sent {}, got {}",
                inputs.len(),
                parsed.data.len()
            )));
        }
        Ok(parsed.data.into_iter().map(|d| d.embedding).collect())
    }
}

/// Strips markdown fences and a leading `sql` language tag from model output.
pub fn clean_sql(raw: &str) -> String {
    let mut text = raw.trim();
    if let Some(stripped) = text.strip_prefix("```") {
        text = stripped;
        if let Some(rest) = text.strip_prefix("sql") {
            text = rest;
        } else if let Some(rest) = text.strip_prefix("SQL") {
            text = rest;
        }
        if let Some(end) = text.rfind("```") {
            text = &text[..end];
        }
    }
    text.trim().trim_end_matches(';').trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_sql_strips_fences() {
        assert_eq!(
            clean_sql("```sql\nSELECT 1;\n```"),
            "SELECT 1".to_string()
        );
        assert_eq!(clean_sql("SELECT a FROM t;"), "SELECT a FROM t");
        assert_eq!(clean_sql("  SELECT 1  "), "SELECT 1");
        assert_eq!(clean_sql("```\nSELECT 2\n```"), "SELECT 2");
    }
}

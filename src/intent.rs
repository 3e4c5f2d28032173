//! LLM-backed intent classification.
//!
//! The model is asked for a one-field JSON object; extraction scans for the
//! first balanced brace pair so chatty completions still parse. Anything
//! unparseable downgrades to `Unknown` rather than failing the turn.

use crate::services::LanguageModel;
use crate::session::Message;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentType {
    Chitchat,
    MetricDefinition,
    SimpleQuery,
    MetricQuery,
    Unknown,
}

impl IntentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            IntentType::Chitchat => "chitchat",
            IntentType::MetricDefinition => "metric_definition",
            IntentType::SimpleQuery => "simple_query",
            IntentType::MetricQuery => "metric_query",
            IntentType::Unknown => "unknown",
        }
    }

    fn parse(s: &str) -> Self {
        match s.trim() {
            "chitchat" => IntentType::Chitchat,
            "metric_definition" => IntentType::MetricDefinition,
            "simple_query" => IntentType::SimpleQuery,
            "metric_query" => IntentType::MetricQuery,
            _ => IntentType::Unknown,
        }
    }
}

const CLASSIFY_PROMPT: &str = r#"你是教育数字化数据助手的意图分类器。请将用户消息分类为以下意图之一:
- chitchat: 打招呼、闲聊、与数据无关的对话
- metric_definition: 询问某个指标的定义或构成
- simple_query: 不涉及指标体系的简单数据查询
- metric_query: 涉及指标体系的数据查询

只输出一个JSON对象，格式: {"intent": "<意图>"}"#;

pub struct IntentClassifier {
    llm: Arc<dyn LanguageModel>,
}

impl IntentClassifier {
    pub fn new(llm: Arc<dyn LanguageModel>) -> Self {
        Self { llm }
    }

    /// Classifies the latest utterance. LLM transport failures and
    /// unparseable output both downgrade to `Unknown`.
    pub async fn classify(&self, utterance: &str, history: &[Message]) -> IntentType {
        let mut prompt = String::from(CLASSIFY_PROMPT);
        let recent: Vec<&Message> = history.iter().rev().take(6).collect();
        if !recent.is_empty() {
            prompt.push_str("\n\n最近对话:\n");
            for msg in recent.iter().rev() {
                prompt.push_str(&format!("{}: {}\n", msg.role, msg.content));
            }
        }
        prompt.push_str(&format!("\n用户消息: {}", utterance));

        let completion = match self.llm.complete(&prompt).await {
            Ok(text) => text,
            Err(e) => {
                warn!(error = %e, "intent classification call failed");
                return IntentType::Unknown;
            }
        };

        match extract_json_object(&completion)
            .and_then(|v| v.get("intent").and_then(Value::as_str).map(str::to_string))
        {
            Some(intent) => IntentType::parse(&intent),
            None => {
                warn!(completion = %completion, "intent reply had no parseable JSON");
                IntentType::Unknown
            }
        }
    }
}

/// First balanced `{...}` object in the text, parsed as JSON.
pub fn extract_json_object(text: &str) -> Option<Value> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, c) in text[start..].char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    let end = start + offset + c.len_utf8();
                    return serde_json::from_str(&text[start..end]).ok();
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{AgentError, Result};
    use async_trait::async_trait;

    struct FixedLlm {
        reply: Result<String>,
    }

    #[async_trait]
    impl LanguageModel for FixedLlm {
        async fn complete(&self, _prompt: &str) -> Result<String> {
            match &self.reply {
                Ok(s) => Ok(s.clone()),
                Err(e) => Err(AgentError::Llm(e.to_string())),
            }
        }
    }

    async fn classify_with(reply: Result<String>) -> IntentType {
        let classifier = IntentClassifier::new(Arc::new(FixedLlm { reply }));
        classifier.classify("帮我看看基础设施", &[]).await
    }

    #[tokio::test]
    async fn test_plain_json_reply() {
        let intent = classify_with(Ok(r#"{"intent": "metric_query"}"#.to_string())).await;
        assert_eq!(intent, IntentType::MetricQuery);
    }

    #[tokio::test]
    async fn test_chatty_reply_with_embedded_json() {
        let intent = classify_with(Ok(
            "好的，分类结果如下:\n```json\n{\"intent\": \"chitchat\"}\n```".to_string(),
        ))
        .await;
        assert_eq!(intent, IntentType::Chitchat);
    }

    #[tokio::test]
    async fn test_unparseable_reply_downgrades() {
        let intent = classify_with(Ok("我觉得这是一个数据查询".to_string())).await;
        assert_eq!(intent, IntentType::Unknown);
    }

    #[tokio::test]
    async fn test_llm_failure_downgrades() {
        let intent = classify_with(Err(AgentError::Llm("timeout".into()))).await;
        assert_eq!(intent, IntentType::Unknown);
    }

    #[test]
    fn test_extract_json_handles_nesting_and_strings() {
        let v = extract_json_object(r#"前缀 {"a": {"b": "含}括号"}, "c": 1} 后缀"#).unwrap();
        assert_eq!(v["c"], 1);
        assert!(extract_json_object("no json here").is_none());
    }
}

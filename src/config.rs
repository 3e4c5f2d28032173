//! Application configuration, read from environment variables.
//!
//! All endpoints are OpenAI-compatible. A `.env` file is loaded by the
//! binaries before this is constructed.

use std::path::PathBuf;

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Chat LLM used for intent classification and response phrasing.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub api_base: String,
    pub api_key: String,
    pub model_name: String,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl LlmConfig {
    pub fn from_env() -> Self {
        Self {
            api_base: env_or("LLM_API_BASE", "http://localhost:11434/v1"),
            api_key: env_or("LLM_API_KEY", "ollama"),
            model_name: env_or("LLM_MODEL_NAME", "qwen2.5:7b"),
            temperature: 0.0,
            max_tokens: 2048,
        }
    }
}

/// Fine-tuned text-to-SQL model endpoint.
#[derive(Debug, Clone)]
pub struct SqlModelConfig {
    pub api_base: String,
    pub api_key: String,
    pub model_name: String,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl SqlModelConfig {
    pub fn from_env() -> Self {
        Self {
            api_base: env_or("SQL_MODEL_API_BASE", "http://localhost:11434/v1"),
            api_key: env_or("SQL_MODEL_API_KEY", "ollama"),
            model_name: env_or("SQL_MODEL_NAME", "text2sql-finetuned"),
            temperature: 0.0,
            max_tokens: 1024,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EmbeddingConfig {
    pub api_base: String,
    pub api_key: String,
    pub model_name: String,
}

impl EmbeddingConfig {
    pub fn from_env() -> Self {
        Self {
            api_base: env_or("EMBEDDING_API_BASE", "http://localhost:11434/v1"),
            api_key: env_or("EMBEDDING_API_KEY", "ollama"),
            model_name: env_or("EMBEDDING_MODEL_NAME", "bge-m3"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
}

impl DatabaseConfig {
    pub fn from_env() -> Self {
        Self {
            host: env_or("DB_HOST", "localhost"),
            port: env_or("DB_PORT", "3306").parse().unwrap_or(3306),
            user: env_or("DB_USER", "root"),
            password: env_or("DB_PASSWORD", ""),
            database: env_or("DB_NAME", "education_metrics"),
        }
    }

    pub fn url(&self) -> String {
        format!(
            "mysql://{}:{}@{}:{}/{}",
            self.user, self.password, self.host, self.port, self.database
        )
    }
}

#[derive(Debug, Clone)]
pub struct PathConfig {
    /// Flat-record metric hierarchy JSON.
    pub metrics_path: PathBuf,
    /// Database schema description JSON.
    pub schema_path: PathBuf,
}

impl PathConfig {
    pub fn from_env() -> Self {
        Self {
            metrics_path: PathBuf::from(env_or("METRICS_PATH", "metadata/metric_hierarchy.json")),
            schema_path: PathBuf::from(env_or("SCHEMA_PATH", "metadata/schema.json")),
        }
    }
}

/// A filter the generated SQL must be able to pin down. Parameters with a
/// default are filled silently and never trigger a clarification question.
#[derive(Debug, Clone)]
pub struct RequiredParam {
    pub name: String,
    pub reason: String,
    pub default: Option<String>,
}

impl RequiredParam {
    pub fn new(name: &str, reason: &str, default: Option<&str>) -> Self {
        Self {
            name: name.to_string(),
            reason: reason.to_string(),
            default: default.map(|d| d.to_string()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub llm: LlmConfig,
    pub sql_model: SqlModelConfig,
    pub embedding: EmbeddingConfig,
    pub database: DatabaseConfig,
    pub paths: PathConfig,

    pub vector_top_k: usize,
    pub similarity_threshold: f64,
    pub max_retries: u8,
    pub request_timeout_secs: u64,
    pub required_params: Vec<RequiredParam>,
}

impl AppConfig {
    pub fn from_env() -> Self {
        Self {
            llm: LlmConfig::from_env(),
            sql_model: SqlModelConfig::from_env(),
            embedding: EmbeddingConfig::from_env(),
            database: DatabaseConfig::from_env(),
            paths: PathConfig::from_env(),
            vector_top_k: env_or("VECTOR_TOP_K", "5").parse().unwrap_or(5),
            similarity_threshold: env_or("SIMILARITY_THRESHOLD", "0.7").parse().unwrap_or(0.7),
            max_retries: env_or("MAX_CORRECTION_ATTEMPTS", "2").parse().unwrap_or(2),
            request_timeout_secs: env_or("REQUEST_TIMEOUT_SECS", "60").parse().unwrap_or(60),
            required_params: default_required_params(),
        }
    }
}

/// Education-domain defaults: both filters fall back silently, so a query
/// without a year or region never interrupts the user.
pub fn default_required_params() -> Vec<RequiredParam> {
    vec![
        RequiredParam::new("year", "缺少年份，需明确查询的时间范围", Some("最新年份")),
        RequiredParam::new("region", "缺少地区范围", Some("全国")),
    ]
}

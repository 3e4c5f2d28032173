//! Wiring shared by the CLI and the HTTP server: loads the metric hierarchy
//! and schema, connects the real service clients, and builds the graph.

use crate::ambiguity::AmbiguityEvaluator;
use crate::assemble::{ContextAssembler, SchemaCatalog};
use crate::config::AppConfig;
use crate::error::Result;
use crate::graph::{AgentGraph, GraphOptions};
use crate::hierarchy::MetricHierarchy;
use crate::llm::{EmbeddingClient, LlmSqlGenerator, OpenAiChatClient};
use crate::matcher::{EmbeddingTermMatcher, LocalSimilarityMatcher};
use crate::services::TermMatcher;
use crate::session::SessionStore;
use std::sync::Arc;
use tracing::info;

pub struct AppContext {
    pub graph: Arc<AgentGraph>,
    pub sessions: Arc<SessionStore>,
}

/// Builds the fully wired agent. The embedding matcher is used when an
/// embedding endpoint is configured, otherwise the local string-similarity
/// fallback; everything else comes straight from the config.
pub async fn bootstrap(config: &AppConfig) -> Result<AppContext> {
    let hierarchy = Arc::new(MetricHierarchy::load(&config.paths.metrics_path)?);
    info!(
        nodes = hierarchy.nodes().count(),
        path = %config.paths.metrics_path.display(),
        "metric hierarchy loaded"
    );
    let schema = SchemaCatalog::load(&config.paths.schema_path)?;

    let llm = Arc::new(OpenAiChatClient::from_llm_config(
        &config.llm,
        config.request_timeout_secs,
    )?);
    let generator = Arc::new(LlmSqlGenerator::new(
        &config.sql_model,
        config.request_timeout_secs,
    )?);
    let executor = Arc::new(crate::executor::MySqlExecutor::connect(&config.database).await?);

    let matcher: Arc<dyn TermMatcher> = if std::env::var("EMBEDDING_API_BASE").is_ok() {
        let client = EmbeddingClient::new(&config.embedding, config.request_timeout_secs)?;
        Arc::new(EmbeddingTermMatcher::build(&hierarchy, client).await?)
    } else {
        info!("no embedding endpoint configured, using local similarity matcher");
        Arc::new(LocalSimilarityMatcher::from_shared(&hierarchy))
    };

    let assembler = ContextAssembler::new(hierarchy.clone(), schema);
    let evaluator = AmbiguityEvaluator::new(hierarchy.clone(), config.required_params.clone());
    let graph = AgentGraph::new(
        hierarchy,
        llm,
        matcher,
        generator,
        executor,
        assembler,
        evaluator,
        GraphOptions::from_config(config),
    );

    Ok(AppContext {
        graph: Arc::new(graph),
        sessions: Arc::new(SessionStore::new()),
    })
}

//! The dialogue orchestration state machine.
//!
//! One turn walks Classify → Evaluate → {Respond | Clarify | Assemble} →
//! Generate → Execute → Respond, with the Execute→Generate retry edge bounded
//! by `max_retries`. Clarify suspends the turn; the next message for the same
//! session resumes at the clarification-merge step. Cancellation is checked
//! before every node transition and every external call runs behind a
//! timeout.

use crate::ambiguity::{detect_year, AmbiguityEvaluator, AmbiguityIssue, ScopeOption};
use crate::assemble::ContextAssembler;
use crate::config::AppConfig;
use crate::error::{AgentError, Result};
use crate::events::EventSink;
use crate::intent::{IntentClassifier, IntentType};
use crate::hierarchy::MetricHierarchy;
use crate::resolver::{Resolution, TermResolver};
use crate::services::{LanguageModel, QueryRows, SqlExecutor, SqlGenerator, TermMatcher};
use crate::session::{Message, SessionState};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeId {
    Classify,
    Evaluate,
    Clarify,
    Assemble,
    Generate,
    Execute,
    Respond,
}

impl NodeId {
    pub fn name(&self) -> &'static str {
        match self {
            NodeId::Classify => "classify",
            NodeId::Evaluate => "evaluate",
            NodeId::Clarify => "clarify",
            NodeId::Assemble => "assemble",
            NodeId::Generate => "generate",
            NodeId::Execute => "execute",
            NodeId::Respond => "respond",
        }
    }

    pub fn display(&self) -> &'static str {
        match self {
            NodeId::Classify => "意图识别",
            NodeId::Evaluate => "歧义检测",
            NodeId::Clarify => "澄清确认",
            NodeId::Assemble => "上下文组装",
            NodeId::Generate => "SQL生成",
            NodeId::Execute => "SQL执行",
            NodeId::Respond => "生成回答",
        }
    }
}

/// What one turn produced: either a final answer or a clarification question.
#[derive(Debug, Clone, Serialize)]
pub struct TurnOutcome {
    pub answer: String,
    pub need_clarification: bool,
    pub sql: Option<String>,
    pub rows: Option<QueryRows>,
}

impl TurnOutcome {
    fn clarification(question: String) -> Self {
        Self {
            answer: question,
            need_clarification: true,
            sql: None,
            rows: None,
        }
    }

    fn answer_only(answer: String) -> Self {
        Self {
            answer,
            need_clarification: false,
            sql: None,
            rows: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct GraphOptions {
    pub max_retries: u8,
    pub call_timeout: Duration,
    pub top_k: usize,
    pub similarity_threshold: f64,
}

impl Default for GraphOptions {
    fn default() -> Self {
        Self {
            max_retries: 2,
            call_timeout: Duration::from_secs(60),
            top_k: 5,
            similarity_threshold: 0.7,
        }
    }
}

impl GraphOptions {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            call_timeout: Duration::from_secs(config.request_timeout_secs),
            top_k: config.vector_top_k,
            similarity_threshold: config.similarity_threshold,
        }
    }
}

const FAILURE_ANSWER: &str = "抱歉，这次查询没有成功，请稍后重试，或换一种问法描述您想看的指标。";
const CHITCHAT_FALLBACK: &str = "你好！我是教育数字化数据助手，可以帮你查询各级指标数据，比如“帮我看看基础设施的情况”。";

pub struct AgentGraph {
    hierarchy: Arc<MetricHierarchy>,
    llm: Arc<dyn LanguageModel>,
    resolver: TermResolver,
    evaluator: AmbiguityEvaluator,
    assembler: ContextAssembler,
    classifier: IntentClassifier,
    generator: Arc<dyn SqlGenerator>,
    executor: Arc<dyn SqlExecutor>,
    max_retries: u8,
    call_timeout: Duration,
}

impl AgentGraph {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        hierarchy: Arc<MetricHierarchy>,
        llm: Arc<dyn LanguageModel>,
        matcher: Arc<dyn TermMatcher>,
        generator: Arc<dyn SqlGenerator>,
        executor: Arc<dyn SqlExecutor>,
        assembler: ContextAssembler,
        evaluator: AmbiguityEvaluator,
        options: GraphOptions,
    ) -> Self {
        Self {
            resolver: TermResolver::new(
                hierarchy.clone(),
                matcher,
                options.top_k,
                options.similarity_threshold,
            ),
            classifier: IntentClassifier::new(llm.clone()),
            hierarchy,
            llm,
            evaluator,
            assembler,
            generator,
            executor,
            max_retries: options.max_retries,
            call_timeout: options.call_timeout,
        }
    }

    /// Runs one turn to suspension or completion. The caller holds the
    /// session lock for the duration.
    pub async fn run_turn(
        &self,
        state: &mut SessionState,
        user_input: &str,
        sink: &mut EventSink,
        cancel: &CancellationToken,
    ) -> Result<TurnOutcome> {
        sink.start(&state.session_id);
        state.turn_history.push(Message::user(user_input));

        let outcome = match self.drive(state, user_input, sink, cancel).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(session_id = %state.session_id, error = %e, "turn failed");
                sink.error(FAILURE_ANSWER);
                return Err(e);
            }
        };

        state.turn_history.push(Message::assistant(&outcome.answer));
        sink.result(
            &outcome.answer,
            outcome.need_clarification,
            outcome.sql.as_deref(),
            outcome.rows.as_ref(),
        );
        Ok(outcome)
    }

    async fn drive(
        &self,
        state: &mut SessionState,
        user_input: &str,
        sink: &mut EventSink,
        cancel: &CancellationToken,
    ) -> Result<TurnOutcome> {
        let resuming = state.is_suspended();

        // Classify. A clarification reply keeps the original intent and is
        // merged into state instead of being re-classified.
        check_cancel(cancel)?;
        if resuming {
            sink.step(NodeId::Classify, "澄清回复，沿用原意图", None);
            self.apply_clarification(state, user_input).await;
        } else {
            state.begin_question(user_input);
            let intent = match tokio::time::timeout(
                self.call_timeout,
                self.classifier.classify(user_input, &state.turn_history),
            )
            .await
            {
                Ok(intent) => intent,
                Err(_) => {
                    warn!("intent classification timed out");
                    IntentType::Unknown
                }
            };
            state.intent_type = Some(intent);
            info!(session_id = %state.session_id, intent = intent.as_str(), "classified");
            sink.step(
                NodeId::Classify,
                format!("意图: {}", intent.as_str()),
                None,
            );
        }
        let intent = state.intent_type.unwrap_or(IntentType::Unknown);

        // Evaluate. Chitchat and definition intents never touch the fuzzy
        // matcher or the SQL path.
        check_cancel(cancel)?;
        match intent {
            IntentType::Chitchat | IntentType::Unknown => {
                sink.step(NodeId::Evaluate, "闲聊对话，直接回复", None);
                let answer = self.chitchat_answer(user_input).await;
                return Ok(TurnOutcome::answer_only(answer));
            }
            IntentType::MetricDefinition => {
                sink.step(NodeId::Evaluate, "指标定义，从指标库作答", None);
                return Ok(TurnOutcome::answer_only(self.definition_answer(user_input)));
            }
            IntentType::SimpleQuery | IntentType::MetricQuery => {}
        }

        if !resuming {
            let utterance = state.active_utterance.clone();
            let resolution = match tokio::time::timeout(
                self.call_timeout,
                self.resolver.resolve(&utterance),
            )
            .await
            {
                Ok(resolution) => resolution,
                Err(_) => {
                    warn!("term resolution timed out, using exact matches only");
                    Resolution {
                        metrics: self.resolver.resolve_exact(&utterance),
                        unmatched_spans: Vec::new(),
                    }
                }
            };
            state.merge_metrics(resolution.metrics.clone());
            let eval = self.evaluator.evaluate(
                intent,
                &utterance,
                &resolution,
                &state.scope_choices,
                &state.provided_params,
            );
            for (node_id, scope) in eval.implied_scopes {
                state.scope_choices.insert(node_id, scope);
            }
            // Plain insert: the evaluator only emits values for params that
            // are not already provided, plus year overrides from the
            // utterance, which must replace a carried-over value.
            for (name, value) in eval.filled_defaults {
                state.provided_params.insert(name, value);
            }
            state.open_issues = eval.issues;
            sink.step(
                NodeId::Evaluate,
                format!(
                    "识别指标{}个，待澄清{}项",
                    state.identified_metrics.len(),
                    state.open_issues.len()
                ),
                None,
            );
        } else {
            sink.step(
                NodeId::Evaluate,
                format!("待澄清{}项", state.open_issues.len()),
                None,
            );
        }

        // Clarify: one question, first open issue, then suspend.
        if let Some(first) = state.open_issues.first() {
            let question = first.question();
            state.clarification_count += 1;
            state.pending_node = Some(NodeId::Clarify);
            sink.step(NodeId::Clarify, "等待用户澄清", None);
            return Ok(TurnOutcome::clarification(question));
        }
        state.pending_node = None;

        // Assemble.
        check_cancel(cancel)?;
        let refined = self.assembler.refine_intent(state);
        state.refined_intent = Some(refined);
        sink.step(NodeId::Assemble, "上下文组装完成", None);

        // Generate / Execute with the bounded self-correction edge.
        loop {
            check_cancel(cancel)?;
            let payload = self.assembler.build_payload(state)?;
            let sql = match self
                .with_timeout(self.generator.generate(&payload), || {
                    AgentError::Generation("SQL生成服务超时".to_string())
                })
                .await
            {
                Ok(sql) => sql,
                Err(e) => {
                    warn!(error = %e, retry = state.retry_count, "generation failed");
                    // Terminal on the first generation; inside the correction
                    // loop it spends a retry like an execution error.
                    if state.retry_count == 0 || state.retry_count >= self.max_retries {
                        sink.step(NodeId::Generate, "生成失败", None);
                        return Ok(self.failure_outcome(state, &e));
                    }
                    state.retry_count += 1;
                    state.failure = Some(e.to_string());
                    sink.step(
                        NodeId::Generate,
                        format!("生成失败，第{}次修正", state.retry_count),
                        None,
                    );
                    continue;
                }
            };
            state.generated_sql = Some(sql.clone());
            sink.step(NodeId::Generate, "SQL已生成", Some(&sql));

            check_cancel(cancel)?;
            match self
                .with_timeout(self.executor.execute(&sql), || {
                    AgentError::Execution("SQL执行超时".to_string())
                })
                .await
            {
                Ok(rows) => {
                    state.execution_result = Some(rows.clone());
                    state.failure = None;
                    sink.step(NodeId::Execute, format!("返回{}行", rows.len()), None);
                    check_cancel(cancel)?;
                    let answer = self.result_answer(state, &rows).await;
                    return Ok(TurnOutcome {
                        answer,
                        need_clarification: false,
                        sql: state.generated_sql.clone(),
                        rows: Some(rows),
                    });
                }
                Err(e) => {
                    warn!(error = %e, retry = state.retry_count, "execution failed");
                    if state.retry_count >= self.max_retries {
                        sink.step(NodeId::Execute, "执行失败，修正次数已用尽", None);
                        return Ok(self.failure_outcome(state, &e));
                    }
                    state.retry_count += 1;
                    state.failure = Some(e.to_string());
                    sink.step(
                        NodeId::Execute,
                        format!("执行失败，第{}次修正", state.retry_count),
                        None,
                    );
                }
            }
        }
    }

    /// Merges a clarification reply into state. A recognized reply removes
    /// exactly the first open issue; an unrecognized one leaves it in place
    /// until the re-ask budget runs out, after which the reply is folded into
    /// the refined intent verbatim.
    async fn apply_clarification(&self, state: &mut SessionState, reply: &str) {
        let Some(first) = state.open_issues.first().cloned() else {
            state.pending_node = None;
            return;
        };

        let resolved = match &first {
            AmbiguityIssue::UnresolvedTerm { .. } => {
                let resolution = match tokio::time::timeout(
                    self.call_timeout,
                    self.resolver.resolve(reply),
                )
                .await
                {
                    Ok(resolution) => resolution,
                    Err(_) => {
                        warn!("term resolution timed out on clarification reply");
                        Resolution {
                            metrics: self.resolver.resolve_exact(reply),
                            unmatched_spans: Vec::new(),
                        }
                    }
                };
                if resolution.metrics.is_empty() {
                    false
                } else {
                    let fresh: Vec<_> = resolution
                        .metrics
                        .iter()
                        .filter(|m| {
                            !state
                                .identified_metrics
                                .iter()
                                .any(|known| known.node_id == m.node_id)
                        })
                        .cloned()
                        .collect();
                    state.merge_metrics(resolution.metrics);
                    // A replacement metric that is itself a parent may need
                    // its own aggregation decision, asked before any pending
                    // parameter issues to keep the question order stable.
                    let mut insert_at = state
                        .open_issues
                        .iter()
                        .position(|i| matches!(i, AmbiguityIssue::MissingParameter { .. }))
                        .unwrap_or(state.open_issues.len());
                    for metric in fresh {
                        if self.hierarchy.is_leaf(&metric.node_id)
                            || state.scope_choices.contains_key(&metric.node_id)
                        {
                            continue;
                        }
                        let mut options = vec![ScopeOption::Rollup];
                        if self.hierarchy.all_children_weighted(&metric.node_id) {
                            options.push(ScopeOption::WeightedScore);
                        }
                        options.push(ScopeOption::ChildDetail);
                        state.open_issues.insert(
                            insert_at,
                            AmbiguityIssue::ScopeAmbiguous {
                                node_id: metric.node_id.clone(),
                                name: metric.name.clone(),
                                options,
                            },
                        );
                        insert_at += 1;
                    }
                    true
                }
            }
            AmbiguityIssue::ScopeAmbiguous {
                node_id, options, ..
            } => match parse_scope_reply(reply, options) {
                Some(choice) => {
                    state.scope_choices.insert(node_id.clone(), choice);
                    true
                }
                None => false,
            },
            AmbiguityIssue::MissingParameter { name, .. } => {
                let value = if name == "year" {
                    detect_year(reply)
                } else {
                    let trimmed = reply.trim();
                    (!trimmed.is_empty()).then(|| trimmed.to_string())
                };
                match value {
                    Some(v) => {
                        state.provided_params.insert(name.clone(), v);
                        true
                    }
                    None => false,
                }
            }
        };

        if resolved {
            state.open_issues.remove(0);
        } else if state.clarification_count >= 2 {
            info!(session_id = %state.session_id, "re-ask budget spent, folding reply verbatim");
            state.fallback_notes.push(reply.trim().to_string());
            state.open_issues.remove(0);
        }
    }

    async fn with_timeout<T, F>(&self, fut: F, on_timeout: impl FnOnce() -> AgentError) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        match tokio::time::timeout(self.call_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(on_timeout()),
        }
    }

    fn failure_outcome(&self, state: &mut SessionState, error: &AgentError) -> TurnOutcome {
        state.failure = Some(error.to_string());
        TurnOutcome::answer_only(FAILURE_ANSWER.to_string())
    }

    async fn chitchat_answer(&self, user_input: &str) -> String {
        let prompt = format!(
            "你是教育数字化数据助手，可以查询各级教育指标数据。请简短友好地回复用户，并提示可以问数据问题。\n用户: {}",
            user_input
        );
        match tokio::time::timeout(self.call_timeout, self.llm.complete(&prompt)).await {
            Ok(Ok(answer)) if !answer.trim().is_empty() => answer.trim().to_string(),
            _ => CHITCHAT_FALLBACK.to_string(),
        }
    }

    fn definition_answer(&self, user_input: &str) -> String {
        let metrics = self.resolver.resolve_exact(user_input);
        for metric in &metrics {
            if let Some(text) = self.hierarchy.definition_text(&metric.node_id) {
                return text;
            }
        }
        let top_level: Vec<String> = self
            .hierarchy
            .nodes()
            .filter(|n| n.level == 1)
            .map(|n| n.name.clone())
            .collect();
        format!(
            "没有找到对应的指标定义。目前支持的一级指标包括: {}。",
            top_level.join("、")
        )
    }

    async fn result_answer(&self, state: &SessionState, rows: &QueryRows) -> String {
        let observation = crate::executor::format_observation(rows);
        let question = state
            .refined_intent
            .as_deref()
            .unwrap_or(&state.active_utterance);
        let prompt = format!(
            "你是教育数字化数据助手。请根据查询结果用简洁的中文回答用户的问题，不要编造数据。\n用户问题: {}\n查询结果:\n{}",
            question, observation
        );
        match tokio::time::timeout(self.call_timeout, self.llm.complete(&prompt)).await {
            Ok(Ok(answer)) if !answer.trim().is_empty() => answer.trim().to_string(),
            _ => observation,
        }
    }
}

fn check_cancel(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        return Err(AgentError::Session("turn cancelled by caller".to_string()));
    }
    Ok(())
}

/// Maps a clarification reply onto one of the offered scope options, by
/// option number, label, or keyword. Only offered options are accepted.
fn parse_scope_reply(reply: &str, options: &[ScopeOption]) -> Option<ScopeOption> {
    let trimmed = reply.trim();

    for (i, option) in options.iter().enumerate() {
        if trimmed.contains(option.label()) {
            return Some(*option);
        }
        let number = (i + 1).to_string();
        if trimmed == number || trimmed == format!("{}.", number) || trimmed == format!("选{}", number)
        {
            return Some(*option);
        }
    }

    let keyword_hit = |cues: &[&str]| cues.iter().any(|c| trimmed.contains(c));
    if keyword_hit(&["评分", "综合", "得分", "score"]) {
        return options
            .iter()
            .copied()
            .find(|o| *o == ScopeOption::WeightedScore);
    }
    if keyword_hit(&["明细", "分项", "分别", "各", "detail", "breakdown"]) {
        return options
            .iter()
            .copied()
            .find(|o| *o == ScopeOption::ChildDetail);
    }
    if keyword_hit(&["汇总", "整体", "总", "合计", "rollup", "sum"]) {
        return options.iter().copied().find(|o| *o == ScopeOption::Rollup);
    }
    None
}

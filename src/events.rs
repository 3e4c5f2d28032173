//! Progress events streamed to the caller, one per node transition, in
//! exactly the order the graph executed. The HTTP layer serializes these as
//! JSON lines and appends a `[DONE]` sentinel after the terminal event.

use crate::graph::NodeId;
use crate::services::QueryRows;
use serde::Serialize;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    Start {
        session_id: String,
    },
    Step {
        step: u32,
        node: &'static str,
        display: &'static str,
        detail: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        sql: Option<String>,
    },
    Result {
        answer: String,
        need_clarification: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        sql: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        rows: Option<QueryRows>,
    },
    Error {
        message: String,
    },
}

/// Ordered, non-dropping sink over an unbounded channel. A sink without a
/// channel (CLI one-shot mode, unit tests) counts steps but emits nothing.
pub struct EventSink {
    tx: Option<UnboundedSender<AgentEvent>>,
    step: u32,
}

impl EventSink {
    pub fn channel() -> (Self, UnboundedReceiver<AgentEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx: Some(tx),
                step: 0,
            },
            rx,
        )
    }

    pub fn disabled() -> Self {
        Self { tx: None, step: 0 }
    }

    fn send(&self, event: AgentEvent) {
        if let Some(tx) = &self.tx {
            // A dropped receiver just means the caller went away.
            let _ = tx.send(event);
        }
    }

    pub fn start(&mut self, session_id: &str) {
        self.send(AgentEvent::Start {
            session_id: session_id.to_string(),
        });
    }

    pub fn step(&mut self, node: NodeId, detail: impl Into<String>, sql: Option<&str>) {
        self.step += 1;
        self.send(AgentEvent::Step {
            step: self.step,
            node: node.name(),
            display: node.display(),
            detail: detail.into(),
            sql: sql.map(str::to_string),
        });
    }

    pub fn result(
        &mut self,
        answer: &str,
        need_clarification: bool,
        sql: Option<&str>,
        rows: Option<&QueryRows>,
    ) {
        self.send(AgentEvent::Result {
            answer: answer.to_string(),
            need_clarification,
            sql: sql.map(str::to_string),
            rows: rows.cloned(),
        });
    }

    pub fn error(&mut self, message: &str) {
        self.send(AgentEvent::Error {
            message: message.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_events_arrive_in_emission_order() {
        let (mut sink, mut rx) = EventSink::channel();
        sink.start("s1");
        sink.step(NodeId::Classify, "intent=metric_query", None);
        sink.step(NodeId::Generate, "sql ready", Some("SELECT 1"));
        sink.result("done", false, Some("SELECT 1"), None);
        drop(sink);

        let mut kinds = Vec::new();
        while let Some(event) = rx.recv().await {
            kinds.push(match event {
                AgentEvent::Start { .. } => "start",
                AgentEvent::Step { .. } => "step",
                AgentEvent::Result { .. } => "result",
                AgentEvent::Error { .. } => "error",
            });
        }
        assert_eq!(kinds, vec!["start", "step", "step", "result"]);
    }

    #[tokio::test]
    async fn test_step_numbering_increments() {
        let (mut sink, mut rx) = EventSink::channel();
        sink.step(NodeId::Classify, "a", None);
        sink.step(NodeId::Evaluate, "b", None);
        drop(sink);

        let mut steps = Vec::new();
        while let Some(AgentEvent::Step { step, .. }) = rx.recv().await {
            steps.push(step);
        }
        assert_eq!(steps, vec![1, 2]);
    }

    #[test]
    fn test_disabled_sink_is_silent() {
        let mut sink = EventSink::disabled();
        sink.start("s1");
        sink.step(NodeId::Respond, "x", None);
        sink.result("ok", false, None, None);
    }
}

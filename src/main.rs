use anyhow::Result;
use clap::Parser;
use std::io::{BufRead, Write};
use text2sql_agent::app::{bootstrap, AppContext};
use text2sql_agent::config::AppConfig;
use text2sql_agent::events::{AgentEvent, EventSink};
use text2sql_agent::session::SessionStore;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Parser, Debug)]
#[command(
    name = "text2sql-agent",
    about = "教育数字化指标问答助手 — 自然语言转SQL查询"
)]
struct Cli {
    /// One-shot question. Interactive mode when omitted.
    #[arg(short, long)]
    query: Option<String>,

    /// Session id to resume; a fresh one is generated when omitted.
    #[arg(long)]
    session: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();
    let config = AppConfig::from_env();
    let ctx = bootstrap(&config).await?;

    let session_id = cli.session.unwrap_or_else(SessionStore::generate_id);
    info!(session_id = %session_id, "session ready");

    match cli.query {
        Some(query) => {
            run_question(&ctx, &session_id, &query).await?;
        }
        None => {
            println!("教育数字化数据助手 (输入 exit 退出)");
            let stdin = std::io::stdin();
            loop {
                print!("> ");
                std::io::stdout().flush()?;
                let mut line = String::new();
                if stdin.lock().read_line(&mut line)? == 0 {
                    break;
                }
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                if line == "exit" || line == "quit" {
                    break;
                }
                run_question(&ctx, &session_id, line).await?;
            }
        }
    }
    Ok(())
}

/// Runs one question to completion, answering clarification questions from
/// stdin until the turn no longer suspends.
async fn run_question(ctx: &AppContext, session_id: &str, query: &str) -> Result<()> {
    let mut input = query.to_string();
    loop {
        let outcome = run_turn(ctx, session_id, &input).await?;
        if !outcome.need_clarification {
            break;
        }
        print!("? ");
        std::io::stdout().flush()?;
        let mut reply = String::new();
        if std::io::stdin().lock().read_line(&mut reply)? == 0 {
            break;
        }
        input = reply.trim().to_string();
        if input.is_empty() {
            break;
        }
    }
    Ok(())
}

async fn run_turn(
    ctx: &AppContext,
    session_id: &str,
    input: &str,
) -> Result<text2sql_agent::TurnOutcome> {
    let entry = ctx.sessions.get_or_create(session_id);
    let mut state = entry.lock().await;
    let (mut sink, mut rx) = EventSink::channel();
    let cancel = CancellationToken::new();

    let result = ctx.graph.run_turn(&mut state, input, &mut sink, &cancel).await;
    drop(sink);
    drop(state);

    while let Some(event) = rx.recv().await {
        match event {
            AgentEvent::Step { display, detail, .. } => println!("  · {}: {}", display, detail),
            AgentEvent::Result { answer, sql, .. } => {
                if let Some(sql) = sql {
                    println!("  SQL: {}", sql);
                }
                println!("{}", answer);
            }
            AgentEvent::Error { message } => println!("{}", message),
            AgentEvent::Start { .. } => {}
        }
    }

    Ok(result?)
}

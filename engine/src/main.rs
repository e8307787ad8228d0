use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;

use conclave_core::{EngineConfig, TaskEvent};
use conclave_observability::{canonical_logs_dir, init_process_logging, ProcessKind};
use conclave_server::{build_state, serve, AppState};
use conclave_types::UserRecord;

#[derive(Parser, Debug)]
#[command(name = "conclave-engine")]
#[command(about = "Multi-AI collaboration orchestrator")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP API and event stream.
    Serve {
        #[arg(long, alias = "host", default_value = "127.0.0.1")]
        hostname: String,
        #[arg(long, default_value_t = 8000)]
        port: u16,
        #[arg(long)]
        state_dir: Option<String>,
    },
    /// Run a single task end to end and print the report.
    Run {
        #[arg(long, default_value = "topic-analysis")]
        scene: String,
        user_input: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = EngineConfig::from_env();
    let (_log_guard, log_info) = init_process_logging(
        ProcessKind::Engine,
        &canonical_logs_dir(&config.state_dir),
        7,
    )?;
    info!(logs_dir = %log_info.logs_dir, "logging initialized");

    match cli.command {
        Command::Serve {
            hostname,
            port,
            state_dir,
        } => {
            if let Some(dir) = state_dir {
                config.state_dir = PathBuf::from(dir);
            }
            let addr: SocketAddr = format!("{hostname}:{port}")
                .parse()
                .context("invalid hostname or port")?;
            let state = build_state(config).await?;
            info!("starting conclave-engine on http://{addr}");
            serve(addr, state).await?;
        }
        Command::Run { scene, user_input } => {
            // The CLI runs without the quota gate in the way.
            config.quota_enabled = false;
            let state = build_state(config).await?;
            run_once(state, &scene, &user_input).await?;
        }
    }

    Ok(())
}

async fn run_once(state: AppState, scene: &str, user_input: &str) -> anyhow::Result<()> {
    state
        .runtime
        .store()
        .upsert_user(UserRecord::new("local", u32::MAX))
        .await?;

    let response = state.runtime.create_task("local", scene, user_input).await?;
    let task_id = match response {
        conclave_core::CreateTaskResponse::Inquiry {
            task_id,
            inquiry_details,
            ..
        } => {
            println!("The task needs more information before it can run:");
            for question in inquiry_details {
                println!("  {}. {} ({})", question.id, question.question, question.placeholder);
            }
            println!("Answer through the HTTP API: POST /tasks/{task_id}/answers");
            return Ok(());
        }
        conclave_core::CreateTaskResponse::Processing { task_id, .. } => task_id,
    };

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    state.runtime.hub().subscribe(&task_id, "cli", tx).await;

    let deadline = Duration::from_secs(600);
    let result = tokio::time::timeout(deadline, async {
        while let Some(event) = rx.recv().await {
            match event {
                TaskEvent::Progress(item) => {
                    eprintln!("[{:>3}%] {} - {}", item.progress, item.phase, item.message);
                }
                TaskEvent::AiMessage { actor, content } => {
                    eprintln!("{actor}: {content}");
                }
                TaskEvent::Error { error } => {
                    anyhow::bail!("task failed: {error}");
                }
                TaskEvent::Complete(envelope) => {
                    println!("{}", serde_json::to_string_pretty(&envelope.output)?);
                    return Ok(());
                }
            }
        }
        anyhow::bail!("event stream closed before completion");
    })
    .await;

    match result {
        Ok(inner) => inner,
        Err(_) => anyhow::bail!("timed out waiting for the task to complete"),
    }
}

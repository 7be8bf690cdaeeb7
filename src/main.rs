use std::error::Error;
use std::future::Future;
use std::process::ExitCode;
use std::sync::Arc;

use chat_protocol::{Role, SelectionRequest};
use thread_session::collaborators::controller_from_config;
use thread_session::logging::init_tracing;
use thread_session::{
    EnvConfig, SessionResult, ThreadSessionController, TurnOutcome, TurnStatus,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, warn};

const HELP: &str = "\
commands:
  <text>                 send a message
  /new [title]           start an empty thread
  /open <thread-id>      open an existing thread
  /threads               list threads
  /model <id> [budget]   change the thread's model selection
  /rerun                 regenerate the last assistant message
  /retry                 retry a failed save
  /usage                 show usage totals
  /delete                delete the open thread
  /help                  show this help
  /quit                  exit
Ctrl-C stops a streaming reply.";

#[derive(Debug, Clone, PartialEq, Eq)]
enum Command {
    Send(String),
    New(Option<String>),
    Open(String),
    Threads,
    Model {
        model_id: String,
        reasoning_budget: Option<String>,
    },
    Rerun,
    Retry,
    Usage,
    Delete,
    Help,
    Quit,
    Unknown(String),
}

impl Command {
    fn parse(line: &str) -> Option<Self> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        let Some(rest) = line.strip_prefix('/') else {
            return Some(Self::Send(line.to_string()));
        };

        let mut words = rest.split_whitespace();
        let name = words.next().unwrap_or_default();
        let args: Vec<&str> = words.collect();
        let command = match (name, args.as_slice()) {
            ("new", []) => Self::New(None),
            ("new", title) => Self::New(Some(title.join(" "))),
            ("open", [thread_id]) => Self::Open((*thread_id).to_string()),
            ("threads", []) => Self::Threads,
            ("model", [model_id]) => Self::Model {
                model_id: (*model_id).to_string(),
                reasoning_budget: None,
            },
            ("model", [model_id, budget]) => Self::Model {
                model_id: (*model_id).to_string(),
                reasoning_budget: Some((*budget).to_string()),
            },
            ("rerun", []) => Self::Rerun,
            ("retry", []) => Self::Retry,
            ("usage", []) => Self::Usage,
            ("delete", []) => Self::Delete,
            ("help", []) => Self::Help,
            ("quit" | "exit", []) => Self::Quit,
            _ => Self::Unknown(line.to_string()),
        };
        Some(command)
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            eprintln!("thread-session: {error}");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<(), Box<dyn Error>> {
    let config = EnvConfig::from_env()?;
    init_tracing(&config);
    let controller = controller_from_config(&config)?;
    debug!(user_id = %config.user_id, "session ready");

    println!("{HELP}");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let Some(command) = Command::parse(&line) else {
            continue;
        };
        if command == Command::Quit {
            break;
        }
        if let Err(error) = execute(&controller, command).await {
            eprintln!("error: {error}");
        }
    }

    controller.stop();
    Ok(())
}

async fn execute(
    controller: &Arc<ThreadSessionController>,
    command: Command,
) -> Result<(), Box<dyn Error>> {
    match command {
        Command::Send(text) => {
            let outcome = until_interrupted(controller, controller.send(text, None)).await?;
            print_outcome(&outcome);
        }
        Command::New(title) => {
            let snapshot = controller.create(title).await?;
            println!("thread {}", snapshot.thread_id.as_deref().unwrap_or("?"));
        }
        Command::Open(thread_id) => {
            let snapshot = controller.open(&thread_id).await?;
            for entry in &snapshot.entries {
                println!("[{}] {}", entry.message.role.as_str(), entry.message.text());
            }
        }
        Command::Threads => {
            for thread in controller.list_threads().await? {
                println!(
                    "{}  {}  ({} messages)",
                    thread.id,
                    thread.title.as_deref().unwrap_or("untitled"),
                    thread.live_transcript().len()
                );
            }
        }
        Command::Model {
            model_id,
            reasoning_budget,
        } => {
            let mut request = SelectionRequest::for_model(model_id);
            request.reasoning_budget = reasoning_budget;
            let selection = controller.set_model_selection(request).await?;
            println!(
                "model {} ({}), budget {}, runtime {}",
                selection.model_id,
                selection.provider_id,
                selection.reasoning_budget,
                selection.runtime_provider
            );
        }
        Command::Rerun => {
            let snapshot = controller.snapshot();
            let Some(last) = snapshot
                .entries
                .iter()
                .rev()
                .find(|entry| entry.message.role == Role::Assistant)
            else {
                return Err("no assistant message to regenerate".into());
            };
            let outcome = until_interrupted(controller, controller.rerun(last.id(), None)).await?;
            print_outcome(&outcome);
        }
        Command::Retry => {
            controller.retry_persistence().await?;
            println!("saved");
        }
        Command::Usage => {
            let usage = controller.usage_rollup();
            println!(
                "input {} / output {} tokens, {} ms{}",
                usage.input_tokens,
                usage.output_tokens,
                usage.total_duration_ms,
                usage
                    .total_cost_usd
                    .map(|cost| format!(", ${cost:.4}"))
                    .unwrap_or_default()
            );
        }
        Command::Delete => {
            controller.delete_thread().await?;
            println!("deleted");
        }
        Command::Help => println!("{HELP}"),
        Command::Quit => {}
        Command::Unknown(line) => return Err(format!("unknown command: {line}").into()),
    }
    Ok(())
}

/// Drives a turn to completion, stopping its stream on Ctrl-C. The stopped
/// turn still settles and is saved.
async fn until_interrupted(
    controller: &ThreadSessionController,
    turn: impl Future<Output = SessionResult<TurnOutcome>>,
) -> SessionResult<TurnOutcome> {
    tokio::pin!(turn);
    tokio::select! {
        outcome = &mut turn => outcome,
        signal = tokio::signal::ctrl_c() => {
            match signal {
                Ok(()) => {
                    controller.stop();
                }
                Err(error) => warn!(%error, "failed to listen for Ctrl-C"),
            }
            turn.await
        }
    }
}

fn print_outcome(outcome: &TurnOutcome) {
    match outcome.status {
        TurnStatus::Error => {
            let partial = outcome.text();
            if !partial.is_empty() {
                println!("{partial}");
            }
            eprintln!(
                "turn failed: {}",
                outcome.error.as_deref().unwrap_or("unknown error")
            );
        }
        _ => {
            println!("{}", outcome.text());
            if outcome.stopped {
                println!("(stopped)");
            }
        }
    }
}

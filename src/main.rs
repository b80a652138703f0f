use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use anyhow::{anyhow, Context};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::Notify;

use mcpilot::agent_core::AgentError;
use mcpilot::config::AppConfig;
use mcpilot::inference::MessagesClient;
use mcpilot::mcp_client::ServerConfig;
use mcpilot::Engine;

#[derive(Parser, Debug)]
#[command(
    name = "mcpilot",
    version,
    about = "Chat with a model that can call tools on a local MCP server"
)]
struct Cli {
    /// Server script or executable (.py, .js, .ts, or a binary). Overrides `server` in the config.
    server_script: Option<String>,
    /// Path to mcpilot.yaml.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Maximum model rounds per query.
    #[arg(long)]
    max_rounds: Option<u32>,
    /// Mirror logs to stderr.
    #[arg(long, short)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let _ = dotenvy::dotenv();
    let log_path = mcpilot::init_tracing(cli.verbose).context("failed to initialize logging")?;

    let (mut config, loaded_from) =
        AppConfig::resolve(cli.config.as_deref()).map_err(|e| anyhow!(e.user_message()))?;
    match &loaded_from {
        Some(path) => tracing::info!(path = %path.display(), "loaded configuration"),
        None => tracing::info!("no config file found; using defaults"),
    }
    if let Some(script) = cli.server_script.as_deref() {
        config.server = Some(ServerConfig::from_script_path(script));
    }
    if let Some(max_rounds) = cli.max_rounds {
        config.engine.max_rounds = max_rounds;
    }

    let model = MessagesClient::from_config(&config.model).map_err(|e| anyhow!(e.user_message()))?;
    let mut engine = Engine::start(&config, Box::new(model))
        .await
        .map_err(|e| anyhow!(e.user_message()))?;

    println!(
        "Connected to '{}' with tools: {}",
        engine.server_name(),
        engine.catalog().names().join(", ")
    );
    println!("Type a question, /tools, /refresh, or 'quit'. Logs: {}", log_path.display());

    let interrupted = Arc::new(Notify::new());
    {
        let cancel = engine.cancel_flag();
        let interrupted = interrupted.clone();
        tokio::spawn(async move {
            while tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("interrupt received");
                cancel.store(true, Ordering::SeqCst);
                interrupted.notify_one();
            }
        });
    }

    let result = repl(&mut engine, &interrupted).await;
    if let Err(e) = engine.shutdown().await {
        tracing::warn!(error = %e, "shutdown failed");
    }
    result
}

async fn repl(engine: &mut Engine, interrupted: &Notify) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        print!("\nQuery: ");
        std::io::stdout().flush()?;

        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = interrupted.notified() => break,
        };
        let Some(line) = line else { break };
        let query = line.trim();

        match query {
            "" => continue,
            "quit" | "exit" => break,
            "/tools" => {
                for tool in engine.catalog().iter() {
                    println!("  {:<24} {}", tool.name, tool.description);
                }
                continue;
            }
            "/refresh" => {
                match engine.refresh_tools().await {
                    Ok(count) => println!("Reloaded {count} tools."),
                    Err(e) => eprintln!("{}", e.user_message()),
                }
                continue;
            }
            _ => {}
        }

        match engine.ask(query).await {
            Ok(outcome) => {
                println!("\n{}", outcome.answer);
                if engine.tools_changed() {
                    println!("(the server's tools changed; type /refresh to reload them)");
                }
            }
            Err(AgentError::Cancelled) => {
                println!("\nCancelled.");
                break;
            }
            Err(e) => {
                eprintln!("\n{}", e.user_message());
                if e.is_fatal() || !engine.is_connected() {
                    return Err(anyhow!("lost connection to the tool server"));
                }
            }
        }
    }

    Ok(())
}

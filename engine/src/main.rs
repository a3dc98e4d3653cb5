use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;

use cadara_core::{ChatService, ConfigStore, DEFAULT_SERVER_HOST};
use cadara_observability::{
    canonical_logs_dir_from_root, emit_event, init_process_logging, ProviderEvent,
};
use cadara_providers::HttpChatBackend;
use cadara_server::{serve, AppState};
use cadara_workflows::WorkflowClient;

const LOG_RETENTION_DAYS: u64 = 14;

#[derive(Parser, Debug)]
#[command(name = "cadara-engine")]
#[command(about = "Headless CADara learning backend")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP backend.
    Serve {
        #[arg(long, alias = "host", default_value = DEFAULT_SERVER_HOST)]
        hostname: String,
        #[arg(long)]
        port: Option<u16>,
        #[arg(long)]
        state_dir: Option<String>,
        #[arg(long)]
        config: Option<String>,
        #[arg(long)]
        workflow_url: Option<String>,
    },
    /// Send one prompt through the fallback router and print the answer.
    Ask {
        prompt: String,
        #[arg(long)]
        provider: Option<String>,
        #[arg(long)]
        state_dir: Option<String>,
        #[arg(long)]
        config: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Serve {
            hostname,
            port,
            state_dir,
            config,
            workflow_url,
        } => {
            let state_dir = resolve_state_dir(state_dir);
            let logs_dir = canonical_logs_dir_from_root(&state_dir);
            let (_log_guard, log_info) = init_process_logging(&logs_dir, LOG_RETENTION_DAYS)?;
            emit_event(
                tracing::Level::INFO,
                ProviderEvent {
                    event: "logging.initialized",
                    component: "engine.main",
                    correlation_id: None,
                    provider_id: None,
                    status: Some("ok"),
                    error_code: None,
                    detail: Some("engine jsonl logging initialized"),
                    elapsed_ms: None,
                },
            );
            info!("engine logging initialized: {log_info:?}");

            let overrides = build_cli_overrides(port, workflow_url.as_deref());
            let config_path = resolve_config_path(&state_dir, config);
            let store = ConfigStore::new(&config_path, overrides).await?;
            let app_config = store.get().await;

            let registry = app_config.build_registry().await;
            let chat = ChatService::new(registry, Arc::new(HttpChatBackend::new()));
            let workflows = WorkflowClient::new(app_config.workflow.url.clone());
            let state = AppState::new(chat, workflows);

            let addr: SocketAddr = format!("{hostname}:{}", app_config.server.port)
                .parse()
                .context("invalid hostname or port")?;
            info!(
                "starting cadara-engine on http://{addr} (state_dir={}, config={}, workflow_url={})",
                state_dir.display(),
                config_path.display(),
                app_config.workflow.url
            );
            serve(addr, state).await?;
        }
        Command::Ask {
            prompt,
            provider,
            state_dir,
            config,
        } => {
            let state_dir = resolve_state_dir(state_dir);
            let config_path = resolve_config_path(&state_dir, config);
            let store = ConfigStore::new(&config_path, None).await?;
            let app_config = store.get().await;

            let registry = app_config.build_registry().await;
            let chat = ChatService::new(registry, Arc::new(HttpChatBackend::new()));

            let answer = match provider {
                Some(provider) => {
                    let reply = chat.route_to_provider(&provider, &prompt, None, &[]).await;
                    if !reply.success {
                        anyhow::bail!(
                            "{}",
                            reply
                                .error
                                .unwrap_or_else(|| "provider call failed".to_string())
                        );
                    }
                    reply.content
                }
                None => chat.process_message(&prompt, None, &[]).await.content,
            };
            println!("{answer}");
        }
    }

    Ok(())
}

fn build_cli_overrides(port: Option<u16>, workflow_url: Option<&str>) -> Option<serde_json::Value> {
    if port.is_none() && workflow_url.is_none() {
        return None;
    }
    let mut root = serde_json::Map::new();
    if let Some(port) = port {
        root.insert("server".to_string(), serde_json::json!({ "port": port }));
    }
    if let Some(url) = workflow_url {
        root.insert("workflow".to_string(), serde_json::json!({ "url": url }));
    }
    Some(serde_json::Value::Object(root))
}

fn resolve_state_dir(flag: Option<String>) -> PathBuf {
    if let Some(dir) = flag {
        return PathBuf::from(dir);
    }
    if let Ok(dir) = std::env::var("CADARA_STATE_DIR") {
        if !dir.trim().is_empty() {
            return PathBuf::from(dir);
        }
    }
    PathBuf::from(".cadara")
}

fn resolve_config_path(state_dir: &Path, flag: Option<String>) -> PathBuf {
    flag.map(PathBuf::from)
        .unwrap_or_else(|| state_dir.join("config.json"))
}

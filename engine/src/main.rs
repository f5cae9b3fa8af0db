use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::info;

use forma_core::{
    ConfigStore, EventBus, ResponseCoordinator, SessionStore, DEFAULT_ENGINE_HOST,
    DEFAULT_ENGINE_PORT,
};
use forma_observability::{
    canonical_logs_dir_from_root, emit_event, init_process_logging, ObservabilityEvent, ProcessKind,
};
use forma_providers::ProviderRegistry;
use forma_runtime::{ArtifactStore, ExecutionOptions, ExecutionPipeline};
use forma_server::{serve, AppState};

const SUPPORTED_PROVIDER_IDS: [&str; 7] = [
    "openai",
    "openrouter",
    "anthropic",
    "ollama",
    "groq",
    "mistral",
    "local",
];

#[derive(Parser, Debug)]
#[command(name = "forma-engine")]
#[command(about = "Headless Forma CAD-generation backend")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the chat/execution server.
    Serve {
        #[arg(long, alias = "host", default_value = DEFAULT_ENGINE_HOST)]
        hostname: String,
        #[arg(long, default_value_t = DEFAULT_ENGINE_PORT)]
        port: u16,
        #[arg(long)]
        state_dir: Option<String>,
        #[arg(long)]
        api_key: Option<String>,
        #[arg(long)]
        provider: Option<String>,
        #[arg(long)]
        model: Option<String>,
        #[arg(long)]
        config: Option<String>,
    },
    /// One-shot completion printed to stdout.
    Run {
        prompt: String,
        #[arg(long)]
        api_key: Option<String>,
        #[arg(long)]
        provider: Option<String>,
        #[arg(long)]
        model: Option<String>,
        #[arg(long)]
        config: Option<String>,
    },
    /// Execute a script through the pipeline once and print the outcome.
    Exec {
        #[arg(long, conflicts_with = "file")]
        code: Option<String>,
        #[arg(long)]
        file: Option<String>,
        #[arg(long)]
        state_dir: Option<String>,
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
            api_key,
            provider,
            model,
            config,
        } => {
            let provider = normalize_and_validate_provider(provider)?;
            let overrides = build_cli_overrides(api_key, provider, model)?;
            let state_dir = resolve_state_dir(state_dir);
            let logs_dir = canonical_logs_dir_from_root(&state_dir);
            let (_log_guard, log_info) = init_process_logging(ProcessKind::Engine, &logs_dir, 14)?;
            emit_event(
                tracing::Level::INFO,
                ProcessKind::Engine,
                ObservabilityEvent {
                    event: "logging.initialized",
                    component: "engine.main",
                    session_id: None,
                    response_id: None,
                    provider_id: None,
                    model_id: None,
                    status: Some("ok"),
                    error_code: None,
                    detail: Some("engine jsonl logging initialized"),
                },
            );
            info!("engine logging initialized: {:?}", log_info);

            let addr: SocketAddr = format!("{hostname}:{port}")
                .parse()
                .context("invalid hostname or port")?;
            log_startup_paths(&state_dir, &addr);

            let state = build_runtime(&state_dir, overrides, config.map(PathBuf::from)).await?;
            emit_event(
                tracing::Level::INFO,
                ProcessKind::Engine,
                ObservabilityEvent {
                    event: "engine.startup.ready",
                    component: "engine.main",
                    session_id: None,
                    response_id: None,
                    provider_id: None,
                    model_id: None,
                    status: Some("ok"),
                    error_code: None,
                    detail: None,
                },
            );
            serve(addr, state).await?;
        }
        Command::Run {
            prompt,
            api_key,
            provider,
            model,
            config,
        } => {
            let provider = normalize_and_validate_provider(provider)?;
            let overrides = build_cli_overrides(api_key, provider.clone(), model)?;
            let state_dir = resolve_state_dir(None);
            let state = build_runtime(&state_dir, overrides, config.map(PathBuf::from)).await?;
            let reply = state
                .providers
                .complete_for_provider(provider.as_deref(), &prompt, None)
                .await?;
            println!("{reply}");
        }
        Command::Exec {
            code,
            file,
            state_dir,
        } => {
            let state_dir = resolve_state_dir(state_dir);
            let state = build_runtime(&state_dir, None, None).await?;
            let code = match (code, file) {
                (Some(code), _) => code,
                (None, Some(path)) => tokio::fs::read_to_string(&path)
                    .await
                    .with_context(|| format!("failed to read script `{path}`"))?,
                (None, None) => anyhow::bail!("pass --code or --file"),
            };
            let pipeline = state.coordinator.pipeline();
            let slot = pipeline.artifacts().new_slot();
            let result = pipeline
                .execute(&code, &slot, CancellationToken::new())
                .await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
    }

    Ok(())
}

fn build_cli_overrides(
    api_key: Option<String>,
    provider: Option<String>,
    model: Option<String>,
) -> anyhow::Result<Option<serde_json::Value>> {
    let provider = normalize_and_validate_provider(provider)?;

    if api_key.is_none() && provider.is_none() && model.is_none() {
        return Ok(None);
    }
    let mut root = serde_json::Map::new();

    if let Some(p) = &provider {
        root.insert(
            "default_provider".to_string(),
            serde_json::Value::String(p.clone()),
        );
    }

    let target_provider = provider.as_deref().unwrap_or("openai");

    if api_key.is_some() || model.is_some() {
        let mut provider_config = serde_json::Map::new();
        if let Some(k) = api_key {
            provider_config.insert("api_key".to_string(), serde_json::Value::String(k));
        }
        if let Some(m) = model {
            provider_config.insert("default_model".to_string(), serde_json::Value::String(m));
        }

        let mut providers = serde_json::Map::new();
        providers.insert(
            target_provider.to_string(),
            serde_json::Value::Object(provider_config),
        );
        root.insert(
            "providers".to_string(),
            serde_json::Value::Object(providers),
        );
    }

    Ok(Some(serde_json::Value::Object(root)))
}

fn normalize_and_validate_provider(provider: Option<String>) -> anyhow::Result<Option<String>> {
    let Some(provider) = provider else {
        return Ok(None);
    };
    let normalized = provider.trim().to_lowercase();
    if normalized.is_empty() {
        anyhow::bail!(
            "provider cannot be empty. supported providers: {}",
            SUPPORTED_PROVIDER_IDS.join(", ")
        );
    }
    if SUPPORTED_PROVIDER_IDS.contains(&normalized.as_str()) {
        return Ok(Some(normalized));
    }
    anyhow::bail!(
        "unsupported provider `{}`. supported providers: {}",
        provider,
        SUPPORTED_PROVIDER_IDS.join(", ")
    );
}

fn resolve_state_dir(flag: Option<String>) -> PathBuf {
    if let Some(dir) = flag {
        return PathBuf::from(dir);
    }
    if let Ok(dir) = std::env::var("FORMA_STATE_DIR") {
        if !dir.trim().is_empty() {
            return PathBuf::from(dir);
        }
    }
    dirs::data_dir()
        .map(|d| d.join("forma"))
        .unwrap_or_else(|| PathBuf::from(".forma"))
}

fn log_startup_paths(state_dir: &Path, addr: &SocketAddr) {
    let exe = std::env::current_exe().unwrap_or_else(|_| PathBuf::from("<unknown>"));
    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("<unknown>"));
    let config_path = state_dir.join("config.json");
    info!("starting forma-engine on http://{addr}");
    info!(
        "startup paths: exe={} cwd={} state_dir={} config_path={}",
        exe.display(),
        cwd.display(),
        state_dir.display(),
        config_path.display()
    );
}

async fn build_runtime(
    state_dir: &Path,
    cli_overrides: Option<serde_json::Value>,
    override_config_path: Option<PathBuf>,
) -> anyhow::Result<AppState> {
    let config_path = override_config_path.unwrap_or_else(|| state_dir.join("config.json"));
    let config = ConfigStore::new(config_path, cli_overrides).await?;
    let effective = config.get().await;

    let output_dir = effective
        .execution
        .output_dir
        .as_deref()
        .map(PathBuf::from)
        .unwrap_or_else(|| state_dir.join("generated"));
    let artifacts = ArtifactStore::new(output_dir).await?;
    let pipeline = ExecutionPipeline::new(
        ExecutionOptions {
            interpreter: effective.execution.interpreter.clone(),
            timeout: Duration::from_secs(effective.execution.timeout_secs),
        },
        artifacts,
    );

    let event_bus = EventBus::new();
    let providers = ProviderRegistry::new(effective.into());
    let sessions = SessionStore::new();
    let coordinator = ResponseCoordinator::new(
        sessions.clone(),
        providers.clone(),
        event_bus.clone(),
        pipeline,
    );

    Ok(AppState {
        config,
        event_bus,
        providers,
        sessions,
        coordinator,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn build_cli_overrides_targets_selected_provider() {
        let overrides = build_cli_overrides(
            Some("sk-test".to_string()),
            Some("openrouter".to_string()),
            Some("google/gemini-2.5-flash".to_string()),
        )
        .expect("overrides")
        .expect("some");

        assert_eq!(overrides["default_provider"], "openrouter");
        assert_eq!(
            overrides["providers"]["openrouter"]["api_key"],
            json!("sk-test")
        );
        assert_eq!(
            overrides["providers"]["openrouter"]["default_model"],
            json!("google/gemini-2.5-flash")
        );
    }

    #[test]
    fn build_cli_overrides_defaults_model_and_key_to_openai_without_provider() {
        let overrides = build_cli_overrides(
            Some("sk-test".to_string()),
            None,
            Some("gpt-4o-mini".to_string()),
        )
        .expect("overrides")
        .expect("some");

        assert!(overrides.get("default_provider").is_none());
        assert_eq!(
            overrides["providers"]["openai"]["api_key"],
            json!("sk-test")
        );
        assert_eq!(
            overrides["providers"]["openai"]["default_model"],
            json!("gpt-4o-mini")
        );
    }

    #[test]
    fn normalize_and_validate_provider_accepts_known_values_case_insensitive() {
        let provider =
            normalize_and_validate_provider(Some(" OpenRouter ".to_string())).expect("provider");
        assert_eq!(provider.as_deref(), Some("openrouter"));
    }

    #[test]
    fn normalize_and_validate_provider_rejects_unknown_value() {
        let err = normalize_and_validate_provider(Some("openruter".to_string())).unwrap_err();
        assert!(err.to_string().contains("unsupported provider `openruter`"));
    }

    #[tokio::test]
    async fn build_runtime_assembles_state_from_a_temp_dir() {
        let dir = std::env::temp_dir().join(format!("forma-engine-{}", uuid::Uuid::new_v4()));
        let state = build_runtime(&dir, None, None).await.expect("runtime");
        assert_eq!(state.sessions.count().await, 0);
        // With an empty config, the local template provider backs the registry.
        let providers = state.providers.list().await;
        assert_eq!(providers.len(), 1);
        assert_eq!(providers[0].id, "local");
        let _ = tokio::fs::remove_dir_all(&dir).await;
    }
}

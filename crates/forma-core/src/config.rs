use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::fs;
use tokio::sync::RwLock;

use forma_runtime::{DEFAULT_INTERPRETER, DEFAULT_TIMEOUT_SECS};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProviderConfig {
    pub api_key: Option<String>,
    pub url: Option<String>,
    pub default_model: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionSettings {
    #[serde(default = "default_interpreter")]
    pub interpreter: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub output_dir: Option<String>,
}

fn default_interpreter() -> String {
    DEFAULT_INTERPRETER.to_string()
}

fn default_timeout_secs() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

impl Default for ExecutionSettings {
    fn default() -> Self {
        Self {
            interpreter: default_interpreter(),
            timeout_secs: default_timeout_secs(),
            output_dir: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,
    pub default_provider: Option<String>,
    #[serde(default)]
    pub execution: ExecutionSettings,
}

impl From<AppConfig> for forma_providers::AppConfig {
    fn from(config: AppConfig) -> Self {
        forma_providers::AppConfig {
            providers: config
                .providers
                .into_iter()
                .map(|(id, p)| {
                    (
                        id,
                        forma_providers::ProviderConfig {
                            api_key: p.api_key,
                            url: p.url,
                            default_model: p.default_model,
                        },
                    )
                })
                .collect(),
            default_provider: config.default_provider,
        }
    }
}

#[derive(Debug, Clone, Default)]
struct ConfigLayers {
    global: Value,
    project: Value,
    env: Value,
    cli: Value,
}

/// Layered JSON configuration. Later layers win key-by-key:
/// global file < project file < environment < CLI overrides.
#[derive(Clone)]
pub struct ConfigStore {
    project_path: PathBuf,
    layers: Arc<RwLock<ConfigLayers>>,
}

impl ConfigStore {
    pub async fn new(path: impl AsRef<Path>, cli_overrides: Option<Value>) -> anyhow::Result<Self> {
        let project_path = path.as_ref().to_path_buf();
        if let Some(parent) = project_path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let global_path = resolve_global_config_path();

        let global = read_json_file(&global_path)
            .await
            .unwrap_or_else(|_| empty_object());
        let project = read_json_file(&project_path)
            .await
            .unwrap_or_else(|_| empty_object());

        let layers = ConfigLayers {
            global,
            project,
            env: env_layer(),
            cli: cli_overrides.unwrap_or_else(empty_object),
        };

        Ok(Self {
            project_path,
            layers: Arc::new(RwLock::new(layers)),
        })
    }

    pub async fn get(&self) -> AppConfig {
        let merged = self.get_effective_value().await;
        serde_json::from_value(merged).unwrap_or_default()
    }

    pub async fn get_effective_value(&self) -> Value {
        let layers = self.layers.read().await.clone();
        let mut merged = empty_object();
        deep_merge(&mut merged, &layers.global);
        deep_merge(&mut merged, &layers.project);
        deep_merge(&mut merged, &layers.env);
        deep_merge(&mut merged, &layers.cli);
        merged
    }

    /// Merge a partial document into the project layer and persist it.
    pub async fn patch(&self, patch: Value) -> anyhow::Result<AppConfig> {
        {
            let mut layers = self.layers.write().await;
            let mut project = layers.project.clone();
            deep_merge(&mut project, &patch);
            layers.project = project;
        }
        self.save_project().await?;
        Ok(self.get().await)
    }

    async fn save_project(&self) -> anyhow::Result<()> {
        let project = self.layers.read().await.project.clone();
        let payload = serde_json::to_string_pretty(&project)?;
        fs::write(&self.project_path, payload).await?;
        Ok(())
    }
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

async fn read_json_file(path: &Path) -> anyhow::Result<Value> {
    let raw = fs::read_to_string(path).await?;
    Ok(serde_json::from_str(&raw)?)
}

fn resolve_global_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("forma")
        .join("config.json")
}

fn env_layer() -> Value {
    let mut execution = Map::new();
    if let Ok(interpreter) = std::env::var("FORMA_INTERPRETER") {
        if !interpreter.trim().is_empty() {
            execution.insert(
                "interpreter".to_string(),
                Value::String(interpreter.trim().to_string()),
            );
        }
    }
    if let Ok(dir) = std::env::var("FORMA_OUTPUT_DIR") {
        if !dir.trim().is_empty() {
            execution.insert(
                "output_dir".to_string(),
                Value::String(dir.trim().to_string()),
            );
        }
    }
    if let Some(secs) = std::env::var("FORMA_TIMEOUT_SECS")
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
    {
        execution.insert("timeout_secs".to_string(), Value::Number(secs.into()));
    }

    let mut root = Map::new();
    if !execution.is_empty() {
        root.insert("execution".to_string(), Value::Object(execution));
    }
    if let Ok(provider) = std::env::var("FORMA_DEFAULT_PROVIDER") {
        if !provider.trim().is_empty() {
            root.insert(
                "default_provider".to_string(),
                Value::String(provider.trim().to_lowercase()),
            );
        }
    }
    Value::Object(root)
}

fn deep_merge(base: &mut Value, overlay: &Value) {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        base_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base, overlay) => {
            *base = overlay.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tmp_config_file(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("forma-config-{name}-{}.json", uuid::Uuid::new_v4()))
    }

    #[tokio::test]
    async fn defaults_apply_when_no_files_exist() {
        let store = ConfigStore::new(tmp_config_file("defaults"), None)
            .await
            .expect("store");
        let config = store.get().await;
        assert_eq!(config.execution.interpreter, DEFAULT_INTERPRETER);
        assert_eq!(config.execution.timeout_secs, DEFAULT_TIMEOUT_SECS);
        assert!(config.providers.is_empty());
    }

    #[tokio::test]
    async fn cli_overrides_win_over_project_layer() {
        let path = tmp_config_file("cli-wins");
        fs::write(
            &path,
            json!({"default_provider": "openai", "execution": {"timeout_secs": 10}}).to_string(),
        )
        .await
        .expect("seed");

        let store = ConfigStore::new(
            &path,
            Some(json!({"default_provider": "openrouter"})),
        )
        .await
        .expect("store");
        let config = store.get().await;
        assert_eq!(config.default_provider.as_deref(), Some("openrouter"));
        assert_eq!(config.execution.timeout_secs, 10);

        let _ = fs::remove_file(path).await;
    }

    #[tokio::test]
    async fn patch_persists_to_the_project_file() {
        let path = tmp_config_file("patch");
        let store = ConfigStore::new(&path, None).await.expect("store");
        store
            .patch(json!({"providers": {"openai": {"default_model": "gpt-4o"}}}))
            .await
            .expect("patch");

        let raw = fs::read_to_string(&path).await.expect("persisted");
        assert!(raw.contains("gpt-4o"));

        let reloaded = ConfigStore::new(&path, None).await.expect("reload");
        let config = reloaded.get().await;
        assert_eq!(
            config
                .providers
                .get("openai")
                .and_then(|p| p.default_model.as_deref()),
            Some("gpt-4o")
        );

        let _ = fs::remove_file(path).await;
    }

    #[test]
    fn deep_merge_replaces_scalars_and_merges_objects() {
        let mut base = json!({"a": {"x": 1, "y": 2}, "b": 3});
        deep_merge(&mut base, &json!({"a": {"y": 9}, "c": 4}));
        assert_eq!(base, json!({"a": {"x": 1, "y": 9}, "b": 3, "c": 4}));
    }
}

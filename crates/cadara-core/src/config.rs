use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::fs;
use tokio::sync::RwLock;

use cadara_providers::{ProviderKind, ProviderPatch, ProviderRegistry};

/// Per-provider overrides accepted from the config file and env layer.
/// API keys are deliberately absent: they are read from the environment at
/// call time and never persisted.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProviderOverrides {
    pub endpoint: Option<String>,
    pub model: Option<String>,
    pub priority: Option<u32>,
    pub timeout_ms: Option<u64>,
}

impl From<ProviderOverrides> for ProviderPatch {
    fn from(value: ProviderOverrides) -> Self {
        Self {
            name: None,
            endpoint: value.endpoint,
            model: value.model,
            priority: value.priority,
            timeout_ms: value.timeout_ms,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
        }
    }
}

fn default_port() -> u16 {
    crate::DEFAULT_SERVER_PORT
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowConfig {
    #[serde(default = "default_workflow_url")]
    pub url: String,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            url: default_workflow_url(),
        }
    }
}

fn default_workflow_url() -> String {
    "http://localhost:8080".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub providers: HashMap<String, ProviderOverrides>,
    #[serde(default)]
    pub fallback_chain: Option<Vec<String>>,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub workflow: WorkflowConfig,
}

impl AppConfig {
    /// Registry seeded with built-in defaults, this config's provider
    /// overrides merged on top, and the configured chain (if any)
    /// replacing the priority-derived default.
    pub async fn build_registry(&self) -> ProviderRegistry {
        let mut configs = BTreeMap::new();
        for kind in ProviderKind::ALL {
            let mut config = kind.default_config();
            if let Some(overrides) = self.providers.get(kind.id()) {
                config.apply(overrides.clone().into());
            }
            configs.insert(kind, config);
        }
        let registry = ProviderRegistry::with_configs(configs);
        if let Some(chain) = &self.fallback_chain {
            registry.replace_fallback_chain(chain.clone()).await;
        }
        registry
    }
}

#[derive(Debug, Clone, Default)]
struct ConfigLayers {
    file: Value,
    env: Value,
    cli: Value,
}

/// Layered configuration: file < env < CLI, deep-merged JSON. The file
/// layer is persisted back on startup so a fresh state dir gets a
/// `config.json` to edit.
#[derive(Clone)]
pub struct ConfigStore {
    file_path: PathBuf,
    layers: Arc<RwLock<ConfigLayers>>,
}

impl ConfigStore {
    pub async fn new(path: impl AsRef<Path>, cli_overrides: Option<Value>) -> anyhow::Result<Self> {
        let file_path = path.as_ref().to_path_buf();
        if let Some(parent) = file_path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let file = read_json_file(&file_path)
            .await
            .unwrap_or_else(|_| empty_object());
        let layers = ConfigLayers {
            file,
            env: env_layer(),
            cli: cli_overrides.unwrap_or_else(empty_object),
        };

        let store = Self {
            file_path,
            layers: Arc::new(RwLock::new(layers)),
        };
        store.save_file().await?;
        Ok(store)
    }

    pub async fn get(&self) -> AppConfig {
        let merged = self.get_effective_value().await;
        serde_json::from_value(merged).unwrap_or_default()
    }

    pub async fn get_effective_value(&self) -> Value {
        let layers = self.layers.read().await.clone();
        let mut merged = empty_object();
        deep_merge(&mut merged, &layers.file);
        deep_merge(&mut merged, &layers.env);
        deep_merge(&mut merged, &layers.cli);
        merged
    }

    async fn save_file(&self) -> anyhow::Result<()> {
        let snapshot = self.layers.read().await.file.clone();
        write_json_file(&self.file_path, &snapshot).await
    }
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

async fn read_json_file(path: &Path) -> anyhow::Result<Value> {
    if !path.exists() {
        return Ok(empty_object());
    }
    let raw = fs::read_to_string(path).await?;
    Ok(serde_json::from_str::<Value>(&raw).unwrap_or_else(|_| empty_object()))
}

async fn write_json_file(path: &Path, value: &Value) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    let raw = serde_json::to_string_pretty(value)?;
    fs::write(path, raw).await?;
    Ok(())
}

fn env_layer() -> Value {
    let mut root = empty_object();

    for kind in ProviderKind::ALL {
        if let Some(endpoint) = std::env::var(kind.endpoint_env())
            .ok()
            .filter(|v| !v.trim().is_empty())
        {
            let id = kind.id();
            deep_merge(
                &mut root,
                &json!({ "providers": { id: { "endpoint": endpoint.trim() } } }),
            );
        }
    }
    if let Some(url) = std::env::var("KESTRA_URL")
        .ok()
        .filter(|v| !v.trim().is_empty())
    {
        deep_merge(&mut root, &json!({ "workflow": { "url": url.trim() } }));
    }
    if let Ok(raw) = std::env::var("PORT") {
        if let Ok(port) = raw.trim().parse::<u16>() {
            deep_merge(&mut root, &json!({ "server": { "port": port } }));
        }
    }

    root
}

fn deep_merge(base: &mut Value, overlay: &Value) {
    if overlay.is_null() {
        return;
    }
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                if value.is_null() {
                    continue;
                }
                match base_map.get_mut(key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        base_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base_value, overlay_value) => {
            *base_value = overlay_value.clone();
        }
    }
}

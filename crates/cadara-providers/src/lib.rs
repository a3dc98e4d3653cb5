use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::future::join_all;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tokio::sync::RwLock;

use cadara_types::{ChatMessage, ProviderHealth, TokenUsage};

/// The closed set of chat providers this backend knows how to talk to.
/// Adding a provider means adding a variant and its constants here; the
/// router never needs to change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Oumi,
    Groq,
}

impl ProviderKind {
    pub const ALL: [ProviderKind; 2] = [ProviderKind::Oumi, ProviderKind::Groq];

    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "oumi" => Some(Self::Oumi),
            "groq" => Some(Self::Groq),
            _ => None,
        }
    }

    pub fn id(self) -> &'static str {
        match self {
            Self::Oumi => "oumi",
            Self::Groq => "groq",
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            Self::Oumi => "Oumi",
            Self::Groq => "Groq",
        }
    }

    /// Per-provider sampling temperature. These constants are part of the
    /// provider contract and differ deliberately.
    pub fn temperature(self) -> f64 {
        match self {
            Self::Oumi => 0.2,
            Self::Groq => 0.1,
        }
    }

    pub fn max_tokens(self) -> u32 {
        match self {
            Self::Oumi => 800,
            Self::Groq => 500,
        }
    }

    pub fn api_key_env(self) -> &'static str {
        match self {
            Self::Oumi => "OUMI_API_KEY",
            Self::Groq => "GROQ_API_KEY",
        }
    }

    pub fn endpoint_env(self) -> &'static str {
        match self {
            Self::Oumi => "OUMI_API_ENDPOINT",
            Self::Groq => "GROQ_API_ENDPOINT",
        }
    }

    pub fn default_config(self) -> ProviderConfig {
        match self {
            Self::Oumi => ProviderConfig {
                name: "Oumi".to_string(),
                endpoint: "https://api.oumi.ai/v1/chat/completions".to_string(),
                model: "oumi-flash".to_string(),
                priority: 0,
                timeout_ms: 8_000,
            },
            Self::Groq => ProviderConfig {
                name: "Groq".to_string(),
                endpoint: "https://api.groq.com/openai/v1/chat/completions".to_string(),
                model: "llama-3.1-8b-instant".to_string(),
                priority: 1,
                timeout_ms: 10_000,
            },
        }
    }
}

/// Runtime description of one remote provider. API keys are deliberately
/// not stored here; they are read from the environment at call time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProviderConfig {
    pub name: String,
    pub endpoint: String,
    pub model: String,
    pub priority: u32,
    pub timeout_ms: u64,
}

impl ProviderConfig {
    /// Built-in defaults with the endpoint override env var applied.
    pub fn for_kind(kind: ProviderKind) -> Self {
        let mut config = kind.default_config();
        if let Some(endpoint) = std::env::var(kind.endpoint_env())
            .ok()
            .filter(|v| !v.trim().is_empty())
        {
            config.endpoint = endpoint.trim().to_string();
        }
        config
    }

    /// Shallow field merge: each supplied field overwrites the stored one,
    /// absent fields are untouched.
    pub fn apply(&mut self, patch: ProviderPatch) {
        if let Some(name) = patch.name {
            self.name = name;
        }
        if let Some(endpoint) = patch.endpoint {
            self.endpoint = endpoint;
        }
        if let Some(model) = patch.model {
            self.model = model;
        }
        if let Some(priority) = patch.priority {
            self.priority = priority;
        }
        if let Some(timeout_ms) = patch.timeout_ms {
            self.timeout_ms = timeout_ms;
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderPatch {
    pub name: Option<String>,
    pub endpoint: Option<String>,
    pub model: Option<String>,
    pub priority: Option<u32>,
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("{env} not configured")]
    CredentialMissing { env: &'static str },
    #[error("{provider} API timeout")]
    Timeout { provider: &'static str },
    #[error("{provider} API error: {detail}")]
    Api {
        provider: &'static str,
        detail: String,
    },
    #[error("unknown provider: {0}")]
    UnknownProvider(String),
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("unknown provider: {0}")]
    UnknownProvider(String),
}

#[derive(Debug, Clone)]
pub struct BackendReply {
    pub content: String,
    pub provider: String,
    pub tokens: u64,
}

/// Uniform seam in front of every remote provider. The router and the
/// health checker only ever talk to this trait.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    async fn call(
        &self,
        kind: ProviderKind,
        config: &ProviderConfig,
        messages: &[ChatMessage],
    ) -> Result<BackendReply, ProviderError>;
}

/// Production backend: OpenAI-compatible chat-completions over HTTP.
pub struct HttpChatBackend {
    client: Client,
}

impl HttpChatBackend {
    pub fn new() -> Self {
        Self {
            client: Client::new(),
        }
    }
}

impl Default for HttpChatBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChatBackend for HttpChatBackend {
    async fn call(
        &self,
        kind: ProviderKind,
        config: &ProviderConfig,
        messages: &[ChatMessage],
    ) -> Result<BackendReply, ProviderError> {
        let Some(api_key) = env_api_key(kind) else {
            return Err(ProviderError::CredentialMissing {
                env: kind.api_key_env(),
            });
        };

        let response = self
            .client
            .post(&config.endpoint)
            .bearer_auth(api_key)
            .timeout(Duration::from_millis(config.timeout_ms))
            .json(&json!({
                "model": config.model,
                "messages": messages,
                "temperature": kind.temperature(),
                "max_tokens": kind.max_tokens(),
            }))
            .send()
            .await
            .map_err(|err| classify_transport_error(kind, err))?;

        let status = response.status();
        let value: serde_json::Value = response
            .json()
            .await
            .map_err(|err| classify_transport_error(kind, err))?;

        if !status.is_success() {
            let detail =
                extract_api_error(&value).unwrap_or_else(|| status.as_u16().to_string());
            return Err(ProviderError::Api {
                provider: kind.display_name(),
                detail,
            });
        }

        let Some(content) = extract_completion_text(&value) else {
            return Err(ProviderError::Api {
                provider: kind.display_name(),
                detail: "no completion content".to_string(),
            });
        };

        let tokens = extract_usage(&value)
            .map(|usage| usage.total_tokens)
            .unwrap_or(0);

        Ok(BackendReply {
            content,
            provider: config.name.clone(),
            tokens,
        })
    }
}

fn env_api_key(kind: ProviderKind) -> Option<String> {
    std::env::var(kind.api_key_env())
        .ok()
        .filter(|v| !v.trim().is_empty())
}

fn classify_transport_error(kind: ProviderKind, err: reqwest::Error) -> ProviderError {
    if err.is_timeout() {
        ProviderError::Timeout {
            provider: kind.display_name(),
        }
    } else {
        ProviderError::Api {
            provider: kind.display_name(),
            detail: err.to_string(),
        }
    }
}

/// First completion's trimmed text; empty or missing content is treated as
/// a provider failure, not an empty answer.
fn extract_completion_text(value: &serde_json::Value) -> Option<String> {
    let content = value
        .get("choices")?
        .get(0)?
        .get("message")?
        .get("content")?
        .as_str()?
        .trim();
    if content.is_empty() {
        return None;
    }
    Some(content.to_string())
}

fn extract_api_error(value: &serde_json::Value) -> Option<String> {
    value
        .get("error")
        .and_then(|v| v.get("message"))
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .or_else(|| {
            value
                .get("message")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string())
        })
}

fn extract_usage(value: &serde_json::Value) -> Option<TokenUsage> {
    let usage = value.get("usage")?;
    let prompt_tokens = usage
        .get("prompt_tokens")
        .and_then(|v| v.as_u64())
        .unwrap_or(0);
    let completion_tokens = usage
        .get("completion_tokens")
        .and_then(|v| v.as_u64())
        .unwrap_or(0);
    let total_tokens = usage
        .get("total_tokens")
        .and_then(|v| v.as_u64())
        .unwrap_or(prompt_tokens.saturating_add(completion_tokens));
    Some(TokenUsage {
        prompt_tokens,
        completion_tokens,
        total_tokens,
    })
}

#[derive(Debug, Clone)]
struct RegistryState {
    configs: BTreeMap<ProviderKind, ProviderConfig>,
    fallback_chain: Vec<String>,
}

/// Process-wide provider configuration. Read on every request, written only
/// on operator action, so a read-mostly lock over a snapshot is enough.
#[derive(Clone)]
pub struct ProviderRegistry {
    state: Arc<RwLock<RegistryState>>,
}

impl ProviderRegistry {
    /// Built-in providers with env endpoint overrides applied. The default
    /// attempt order follows ascending `priority`.
    pub fn new() -> Self {
        Self::with_configs(
            ProviderKind::ALL
                .iter()
                .map(|kind| (*kind, ProviderConfig::for_kind(*kind)))
                .collect(),
        )
    }

    pub fn with_configs(configs: BTreeMap<ProviderKind, ProviderConfig>) -> Self {
        let fallback_chain = chain_by_priority(&configs);
        Self {
            state: Arc::new(RwLock::new(RegistryState {
                configs,
                fallback_chain,
            })),
        }
    }

    pub async fn get(&self, name: &str) -> Option<(ProviderKind, ProviderConfig)> {
        let kind = ProviderKind::from_name(name)?;
        let state = self.state.read().await;
        state.configs.get(&kind).map(|config| (kind, config.clone()))
    }

    /// Shallow-merges `patch` into the named provider's config. Unknown
    /// names are an error, not a silent no-op.
    pub async fn update(&self, name: &str, patch: ProviderPatch) -> Result<(), RegistryError> {
        let Some(kind) = ProviderKind::from_name(name) else {
            return Err(RegistryError::UnknownProvider(name.to_string()));
        };
        let mut state = self.state.write().await;
        match state.configs.get_mut(&kind) {
            Some(config) => {
                config.apply(patch);
                Ok(())
            }
            None => Err(RegistryError::UnknownProvider(name.to_string())),
        }
    }

    /// Unconditional replacement, no membership validation: an unknown name
    /// in the new chain surfaces as a per-attempt failure at call time.
    pub async fn replace_fallback_chain(&self, chain: Vec<String>) {
        self.state.write().await.fallback_chain = chain;
    }

    pub async fn fallback_chain(&self) -> Vec<String> {
        self.state.read().await.fallback_chain.clone()
    }

    /// Snapshot of every registered provider, not just the active chain.
    pub async fn snapshot(&self) -> Vec<(ProviderKind, ProviderConfig)> {
        self.state
            .read()
            .await
            .configs
            .iter()
            .map(|(kind, config)| (*kind, config.clone()))
            .collect()
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn chain_by_priority(configs: &BTreeMap<ProviderKind, ProviderConfig>) -> Vec<String> {
    let mut order: Vec<(u32, &'static str)> = configs
        .iter()
        .map(|(kind, config)| (config.priority, kind.id()))
        .collect();
    order.sort();
    order.into_iter().map(|(_, id)| id.to_string()).collect()
}

/// Probes every registered provider once, concurrently, through the same
/// backend used for real traffic. One provider failing never suppresses
/// another's status. Diagnostic only: nothing in the registry changes.
pub async fn check_providers(
    registry: &ProviderRegistry,
    backend: &dyn ChatBackend,
) -> BTreeMap<String, ProviderHealth> {
    let providers = registry.snapshot().await;
    let probes = providers.into_iter().map(|(kind, config)| async move {
        let started = Instant::now();
        let probe = [ChatMessage::user("test")];
        let health = match backend.call(kind, &config, &probe).await {
            Ok(_) => ProviderHealth {
                available: true,
                endpoint: config.endpoint,
                response_time: Some(started.elapsed().as_millis() as u64),
                error: None,
            },
            Err(err) => ProviderHealth {
                available: false,
                endpoint: config.endpoint,
                response_time: None,
                error: Some(err.to_string()),
            },
        };
        (kind.id().to_string(), health)
    });
    join_all(probes).await.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_name_is_case_insensitive_and_trims() {
        assert_eq!(ProviderKind::from_name("oumi"), Some(ProviderKind::Oumi));
        assert_eq!(ProviderKind::from_name("  Groq "), Some(ProviderKind::Groq));
        assert_eq!(ProviderKind::from_name("OUMI"), Some(ProviderKind::Oumi));
        assert_eq!(ProviderKind::from_name("mistral"), None);
    }

    #[test]
    fn built_in_constants_differ_per_provider() {
        assert_eq!(ProviderKind::Oumi.temperature(), 0.2);
        assert_eq!(ProviderKind::Groq.temperature(), 0.1);
        assert_eq!(ProviderKind::Oumi.max_tokens(), 800);
        assert_eq!(ProviderKind::Groq.max_tokens(), 500);
        let oumi = ProviderKind::Oumi.default_config();
        assert_eq!(oumi.model, "oumi-flash");
        assert_eq!(oumi.timeout_ms, 8_000);
        let groq = ProviderKind::Groq.default_config();
        assert_eq!(groq.model, "llama-3.1-8b-instant");
        assert_eq!(groq.timeout_ms, 10_000);
    }

    #[test]
    fn patch_overwrites_only_supplied_fields() {
        let mut config = ProviderKind::Oumi.default_config();
        config.apply(ProviderPatch {
            model: Some("oumi-pro".to_string()),
            timeout_ms: Some(12_000),
            ..Default::default()
        });
        assert_eq!(config.model, "oumi-pro");
        assert_eq!(config.timeout_ms, 12_000);
        assert_eq!(config.name, "Oumi");
        assert_eq!(config.endpoint, "https://api.oumi.ai/v1/chat/completions");
        assert_eq!(config.priority, 0);
    }

    #[tokio::test]
    async fn default_chain_follows_priority_order() {
        let registry = ProviderRegistry::with_configs(
            ProviderKind::ALL
                .iter()
                .map(|kind| (*kind, kind.default_config()))
                .collect(),
        );
        assert_eq!(registry.fallback_chain().await, vec!["oumi", "groq"]);
    }

    #[tokio::test]
    async fn priority_override_reorders_default_chain() {
        let mut configs: BTreeMap<ProviderKind, ProviderConfig> = ProviderKind::ALL
            .iter()
            .map(|kind| (*kind, kind.default_config()))
            .collect();
        configs.get_mut(&ProviderKind::Oumi).unwrap().priority = 5;
        let registry = ProviderRegistry::with_configs(configs);
        assert_eq!(registry.fallback_chain().await, vec!["groq", "oumi"]);
    }

    #[tokio::test]
    async fn get_resolves_names_case_insensitively() {
        let registry = ProviderRegistry::with_configs(
            ProviderKind::ALL
                .iter()
                .map(|kind| (*kind, kind.default_config()))
                .collect(),
        );
        let (kind, config) = registry.get("Groq").await.expect("groq registered");
        assert_eq!(kind, ProviderKind::Groq);
        assert_eq!(config.name, "Groq");
        assert!(registry.get("mistral").await.is_none());
    }

    #[tokio::test]
    async fn update_merges_and_rejects_unknown_names() {
        let registry = ProviderRegistry::with_configs(
            ProviderKind::ALL
                .iter()
                .map(|kind| (*kind, kind.default_config()))
                .collect(),
        );
        registry
            .update(
                "oumi",
                ProviderPatch {
                    endpoint: Some("https://staging.oumi.ai/v1/chat/completions".to_string()),
                    ..Default::default()
                },
            )
            .await
            .expect("oumi update");
        let (_, config) = registry.get("oumi").await.expect("oumi registered");
        assert_eq!(config.endpoint, "https://staging.oumi.ai/v1/chat/completions");
        assert_eq!(config.model, "oumi-flash");

        let err = registry
            .update("mistral", ProviderPatch::default())
            .await
            .expect_err("unknown provider must be rejected");
        assert_eq!(err.to_string(), "unknown provider: mistral");
    }

    #[tokio::test]
    async fn replace_fallback_chain_is_unconditional() {
        let registry = ProviderRegistry::new();
        registry
            .replace_fallback_chain(vec!["groq".to_string(), "nonexistent".to_string()])
            .await;
        assert_eq!(registry.fallback_chain().await, vec!["groq", "nonexistent"]);
    }

    #[test]
    fn usage_defaults_to_zero_when_absent() {
        assert!(extract_usage(&json!({"choices": []})).is_none());
        let usage = extract_usage(&json!({"usage": {}})).expect("usage present");
        assert_eq!(usage.total_tokens, 0);
        let usage = extract_usage(&json!({
            "usage": {"prompt_tokens": 10, "completion_tokens": 5}
        }))
        .expect("usage present");
        assert_eq!(usage.total_tokens, 15);
    }

    #[test]
    fn completion_text_is_trimmed_and_empty_is_rejected() {
        let value = json!({
            "choices": [{"message": {"role": "assistant", "content": "  hello  "}}]
        });
        assert_eq!(extract_completion_text(&value).as_deref(), Some("hello"));

        let blank = json!({
            "choices": [{"message": {"role": "assistant", "content": "   "}}]
        });
        assert!(extract_completion_text(&blank).is_none());
        assert!(extract_completion_text(&json!({"choices": []})).is_none());
    }

    #[test]
    fn api_error_prefers_nested_error_message() {
        let value = json!({"error": {"message": "rate limited"}});
        assert_eq!(extract_api_error(&value).as_deref(), Some("rate limited"));
        let flat = json!({"message": "bad request"});
        assert_eq!(extract_api_error(&flat).as_deref(), Some("bad request"));
        assert!(extract_api_error(&json!({})).is_none());
    }

    #[test]
    fn provider_error_messages_name_the_failure() {
        let err = ProviderError::CredentialMissing { env: "OUMI_API_KEY" };
        assert_eq!(err.to_string(), "OUMI_API_KEY not configured");
        let err = ProviderError::Timeout { provider: "Oumi" };
        assert_eq!(err.to_string(), "Oumi API timeout");
        let err = ProviderError::Api {
            provider: "Groq",
            detail: "503".to_string(),
        };
        assert_eq!(err.to_string(), "Groq API error: 503");
        let err = ProviderError::UnknownProvider("mistral".to_string());
        assert_eq!(err.to_string(), "unknown provider: mistral");
    }
}

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;
use tracing::{info, warn};
use uuid::Uuid;

use cadara_observability::redact_text;
use cadara_providers::{check_providers, ChatBackend, ProviderError, ProviderRegistry};
use cadara_types::{ChatMessage, ChatReply, DirectReply, ProviderHealth};

use crate::fallback::canned_fallback;
use crate::prompt::build_prompt;

/// Routes chat messages through the fallback chain: providers are tried in
/// order, each at most once, and the caller always gets an answer. On
/// total failure a canned reply is synthesized instead of an error.
///
/// Cheap to clone; clones share the registry and the backend.
#[derive(Clone)]
pub struct ChatService {
    registry: ProviderRegistry,
    backend: Arc<dyn ChatBackend>,
}

impl ChatService {
    pub fn new(registry: ProviderRegistry, backend: Arc<dyn ChatBackend>) -> Self {
        Self { registry, backend }
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    pub async fn process_message(
        &self,
        message: &str,
        context: Option<&Value>,
        history: &[ChatMessage],
    ) -> ChatReply {
        let correlation_id = Uuid::new_v4();
        let messages = build_prompt(message, context, history);
        let started = Instant::now();
        let chain = self.registry.fallback_chain().await;

        info!(
            correlation_id = %correlation_id,
            message = %redact_text(message),
            history_len = history.len(),
            chain_len = chain.len(),
            "routing chat message"
        );

        let mut last_error: Option<ProviderError> = None;
        for (index, name) in chain.iter().enumerate() {
            info!(correlation_id = %correlation_id, provider = %name, "attempting provider");
            match self.attempt(name, &messages).await {
                Ok(reply) => {
                    let response_time_ms = started.elapsed().as_millis() as u64;
                    info!(
                        correlation_id = %correlation_id,
                        provider = %reply.provider,
                        elapsed_ms = response_time_ms,
                        tokens = reply.tokens,
                        fallback_used = index > 0,
                        "chat request served"
                    );
                    return ChatReply {
                        content: reply.content,
                        provider: reply.provider,
                        success: true,
                        response_time_ms,
                        tokens: reply.tokens,
                        fallback_used: index > 0,
                        error: None,
                    };
                }
                Err(err) => {
                    warn!(
                        correlation_id = %correlation_id,
                        provider = %name,
                        error = %err,
                        "provider attempt failed"
                    );
                    last_error = Some(err);
                }
            }
        }

        let response_time_ms = started.elapsed().as_millis() as u64;
        let error = last_error
            .map(|err| err.to_string())
            .unwrap_or_else(|| "no providers configured".to_string());
        warn!(
            correlation_id = %correlation_id,
            elapsed_ms = response_time_ms,
            error = %error,
            "all providers failed, returning canned response"
        );
        ChatReply {
            content: canned_fallback(message),
            provider: "Fallback".to_string(),
            success: false,
            response_time_ms,
            tokens: 0,
            fallback_used: true,
            error: Some(error),
        }
    }

    /// Calls exactly the named provider, bypassing the fallback chain.
    pub async fn route_to_provider(
        &self,
        name: &str,
        message: &str,
        context: Option<&Value>,
        history: &[ChatMessage],
    ) -> DirectReply {
        let messages = build_prompt(message, context, history);
        match self.attempt(name, &messages).await {
            Ok(reply) => DirectReply {
                content: reply.content,
                provider: reply.provider,
                success: true,
                tokens: reply.tokens,
                error: None,
            },
            Err(err) => {
                warn!(provider = %name, error = %err, "direct provider route failed");
                DirectReply {
                    content: format!("{name} provider failed: {err}"),
                    provider: name.to_string(),
                    success: false,
                    tokens: 0,
                    error: Some(err.to_string()),
                }
            }
        }
    }

    pub async fn check_providers(&self) -> BTreeMap<String, ProviderHealth> {
        check_providers(&self.registry, self.backend.as_ref()).await
    }

    async fn attempt(
        &self,
        name: &str,
        messages: &[ChatMessage],
    ) -> Result<cadara_providers::BackendReply, ProviderError> {
        let Some((kind, config)) = self.registry.get(name).await else {
            return Err(ProviderError::UnknownProvider(name.to_string()));
        };
        self.backend.call(kind, &config, messages).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use cadara_providers::{BackendReply, ProviderConfig, ProviderKind};
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Clone, Copy)]
    enum Script {
        Ok(&'static str, u64),
        CredentialMissing,
        Timeout,
        Api(&'static str),
    }

    struct ScriptedBackend {
        scripts: HashMap<ProviderKind, Script>,
        calls: Mutex<Vec<ProviderKind>>,
    }

    impl ScriptedBackend {
        fn new(scripts: &[(ProviderKind, Script)]) -> Arc<Self> {
            Arc::new(Self {
                scripts: scripts.iter().copied().collect(),
                calls: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> Vec<ProviderKind> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ChatBackend for ScriptedBackend {
        async fn call(
            &self,
            kind: ProviderKind,
            config: &ProviderConfig,
            _messages: &[ChatMessage],
        ) -> Result<BackendReply, ProviderError> {
            self.calls.lock().unwrap().push(kind);
            match self.scripts.get(&kind) {
                Some(Script::Ok(content, tokens)) => Ok(BackendReply {
                    content: content.to_string(),
                    provider: config.name.clone(),
                    tokens: *tokens,
                }),
                Some(Script::CredentialMissing) => Err(ProviderError::CredentialMissing {
                    env: kind.api_key_env(),
                }),
                Some(Script::Timeout) => Err(ProviderError::Timeout {
                    provider: kind.display_name(),
                }),
                Some(Script::Api(detail)) => Err(ProviderError::Api {
                    provider: kind.display_name(),
                    detail: detail.to_string(),
                }),
                None => panic!("unexpected call to {kind:?}"),
            }
        }
    }

    fn service_with(backend: Arc<ScriptedBackend>) -> ChatService {
        let registry = ProviderRegistry::with_configs(
            ProviderKind::ALL
                .iter()
                .map(|kind| (*kind, kind.default_config()))
                .collect(),
        );
        ChatService::new(registry, backend)
    }

    #[tokio::test]
    async fn failing_first_provider_falls_back_in_chain_order() {
        let backend = ScriptedBackend::new(&[
            (ProviderKind::Oumi, Script::Api("503")),
            (ProviderKind::Groq, Script::Ok("answer from groq", 42)),
        ]);
        let service = service_with(backend.clone());

        let reply = service.process_message("how do I scale?", None, &[]).await;

        assert!(reply.success);
        assert_eq!(reply.provider, "Groq");
        assert!(reply.fallback_used);
        assert_eq!(reply.tokens, 42);
        assert_eq!(reply.content, "answer from groq");
        assert!(reply.error.is_none());
        assert_eq!(backend.calls(), vec![ProviderKind::Oumi, ProviderKind::Groq]);
    }

    #[tokio::test]
    async fn first_success_short_circuits_the_chain() {
        let backend = ScriptedBackend::new(&[(ProviderKind::Oumi, Script::Ok("done", 7))]);
        let service = service_with(backend.clone());

        let reply = service.process_message("hello", None, &[]).await;

        assert!(reply.success);
        assert_eq!(reply.provider, "Oumi");
        assert!(!reply.fallback_used);
        assert_eq!(backend.calls(), vec![ProviderKind::Oumi]);
    }

    #[tokio::test]
    async fn total_failure_degrades_to_the_canned_reply() {
        let backend = ScriptedBackend::new(&[
            (ProviderKind::Oumi, Script::Api("500")),
            (ProviderKind::Groq, Script::Timeout),
        ]);
        let service = service_with(backend.clone());

        let reply = service
            .process_message("how does boolean union work", None, &[])
            .await;

        assert!(!reply.success);
        assert_eq!(reply.provider, "Fallback");
        assert_eq!(reply.content, canned_fallback("how does boolean union work"));
        assert!(!reply.content.is_empty());
        assert_eq!(reply.tokens, 0);
        assert!(reply.fallback_used);
        assert_eq!(reply.error.as_deref(), Some("Groq API timeout"));
        assert_eq!(backend.calls(), vec![ProviderKind::Oumi, ProviderKind::Groq]);
    }

    #[tokio::test]
    async fn missing_credential_advances_to_the_next_provider() {
        let backend = ScriptedBackend::new(&[
            (ProviderKind::Oumi, Script::CredentialMissing),
            (ProviderKind::Groq, Script::Ok("groq answer", 10)),
        ]);
        let service = service_with(backend.clone());

        let reply = service.process_message("test", None, &[]).await;

        assert!(reply.success);
        assert_eq!(reply.provider, "Groq");
        assert!(reply.fallback_used);
        assert_eq!(backend.calls(), vec![ProviderKind::Oumi, ProviderKind::Groq]);
    }

    #[tokio::test]
    async fn unknown_chain_entries_fail_without_reaching_the_backend() {
        let backend = ScriptedBackend::new(&[(ProviderKind::Groq, Script::Ok("ok", 1))]);
        let service = service_with(backend.clone());
        service
            .registry()
            .replace_fallback_chain(vec!["mistral".to_string(), "groq".to_string()])
            .await;

        let reply = service.process_message("test", None, &[]).await;

        assert!(reply.success);
        assert_eq!(reply.provider, "Groq");
        assert!(reply.fallback_used);
        assert_eq!(backend.calls(), vec![ProviderKind::Groq]);
    }

    #[tokio::test]
    async fn empty_chain_degrades_like_total_failure() {
        let backend = ScriptedBackend::new(&[]);
        let service = service_with(backend.clone());
        service.registry().replace_fallback_chain(Vec::new()).await;

        let reply = service.process_message("anything", None, &[]).await;

        assert!(!reply.success);
        assert_eq!(reply.provider, "Fallback");
        assert_eq!(reply.error.as_deref(), Some("no providers configured"));
        assert!(backend.calls().is_empty());
    }

    #[tokio::test]
    async fn direct_route_calls_exactly_the_named_provider() {
        let backend = ScriptedBackend::new(&[(ProviderKind::Groq, Script::Ok("direct", 5))]);
        let service = service_with(backend.clone());

        let reply = service.route_to_provider("groq", "test", None, &[]).await;

        assert!(reply.success);
        assert_eq!(reply.provider, "Groq");
        assert_eq!(reply.content, "direct");
        assert_eq!(reply.tokens, 5);
        assert_eq!(backend.calls(), vec![ProviderKind::Groq]);
    }

    #[tokio::test]
    async fn direct_route_rejects_unknown_providers_without_a_call() {
        let backend = ScriptedBackend::new(&[]);
        let service = service_with(backend.clone());

        let reply = service.route_to_provider("mistral", "test", None, &[]).await;

        assert!(!reply.success);
        assert_eq!(reply.provider, "mistral");
        assert_eq!(
            reply.content,
            "mistral provider failed: unknown provider: mistral"
        );
        assert_eq!(reply.error.as_deref(), Some("unknown provider: mistral"));
        assert!(backend.calls().is_empty());
    }

    #[tokio::test]
    async fn direct_route_reports_provider_failures_in_the_content() {
        let backend = ScriptedBackend::new(&[(ProviderKind::Oumi, Script::Api("502"))]);
        let service = service_with(backend.clone());

        let reply = service.route_to_provider("oumi", "test", None, &[]).await;

        assert!(!reply.success);
        assert_eq!(reply.content, "oumi provider failed: Oumi API error: 502");
        assert_eq!(reply.error.as_deref(), Some("Oumi API error: 502"));
    }

    #[tokio::test]
    async fn health_check_collects_every_provider_independently() {
        let backend = ScriptedBackend::new(&[
            (ProviderKind::Oumi, Script::Api("connection refused")),
            (ProviderKind::Groq, Script::Ok("pong", 1)),
        ]);
        let service = service_with(backend.clone());

        let health = service.check_providers().await;

        assert_eq!(health.len(), 2);
        let oumi = &health["oumi"];
        assert!(!oumi.available);
        assert_eq!(
            oumi.error.as_deref(),
            Some("Oumi API error: connection refused")
        );
        assert!(oumi.response_time.is_none());
        let groq = &health["groq"];
        assert!(groq.available);
        assert!(groq.response_time.is_some());
        assert!(groq.error.is_none());
        assert!(!oumi.endpoint.is_empty());
        assert!(!groq.endpoint.is_empty());
    }
}

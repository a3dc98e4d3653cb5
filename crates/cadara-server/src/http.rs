use std::net::SocketAddr;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::cors::{Any, CorsLayer};
use tracing::error;

use cadara_types::ChatMessage;

use crate::AppState;

pub async fn serve(addr: SocketAddr, state: AppState) -> anyhow::Result<()> {
    let app = app_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("cadara backend listening on http://{addr}");
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if tokio::signal::ctrl_c().await.is_err() {
                futures::future::pending::<()>().await;
            }
        })
        .await?;
    Ok(())
}

fn app_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/chat", post(chat))
        .route("/api/chat/health", get(chat_health))
        .route("/api/chat/provider/{provider}", post(chat_with_provider))
        .route("/api/challenges/submit", post(submit_challenge))
        .route("/api/workflow-status/{execution_id}", get(workflow_status))
        .route(
            "/api/learning-path/update/{user_id}",
            post(update_learning_path),
        )
        .layer(cors)
        .with_state(state)
}

/// Error payload for the JSON API: a status code plus `{ "error": ... }`.
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

#[derive(Debug, Deserialize)]
struct ChatInput {
    message: Option<String>,
    context: Option<Value>,
    #[serde(default, rename = "conversationHistory")]
    conversation_history: Vec<ChatMessage>,
}

fn validated_message(message: Option<&str>) -> Result<&str, ApiError> {
    match message {
        Some(message) if !message.trim().is_empty() => Ok(message),
        _ => Err(ApiError::bad_request("Message is required")),
    }
}

async fn chat(
    State(state): State<AppState>,
    Json(input): Json<ChatInput>,
) -> Result<Json<Value>, ApiError> {
    let message = validated_message(input.message.as_deref())?;
    let reply = state
        .chat
        .process_message(message, input.context.as_ref(), &input.conversation_history)
        .await;

    let mut body = json!({
        "response": reply.content,
        "provider": reply.provider,
        "success": reply.success,
        "responseTime": reply.response_time_ms,
        "tokens": reply.tokens,
        "fallbackUsed": reply.fallback_used,
        "timestamp": Utc::now().to_rfc3339(),
    });
    if let Some(error) = reply.error {
        body["error"] = json!(error);
    }
    Ok(Json(body))
}

async fn chat_health(State(state): State<AppState>) -> Json<Value> {
    let providers = state.chat.check_providers().await;
    let fallback_chain = state.chat.registry().fallback_chain().await;
    Json(json!({
        "status": "ok",
        "providers": providers,
        "fallbackChain": fallback_chain,
    }))
}

async fn chat_with_provider(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    Json(input): Json<ChatInput>,
) -> Result<Json<Value>, ApiError> {
    let message = validated_message(input.message.as_deref())?;
    let reply = state
        .chat
        .route_to_provider(
            &provider,
            message,
            input.context.as_ref(),
            &input.conversation_history,
        )
        .await;

    let mut body = json!({
        "response": reply.content,
        "provider": reply.provider,
        "success": reply.success,
        "tokens": reply.tokens,
        "timestamp": Utc::now().to_rfc3339(),
    });
    if let Some(error) = reply.error {
        body["error"] = json!(error);
    }
    Ok(Json(body))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChallengeSubmissionInput {
    submission_data: Value,
    challenge_id: String,
    user_id: String,
}

async fn submit_challenge(
    State(state): State<AppState>,
    Json(input): Json<ChallengeSubmissionInput>,
) -> Result<Json<Value>, ApiError> {
    let execution = state
        .workflows
        .submit_challenge(&input.submission_data, &input.challenge_id, &input.user_id)
        .await
        .map_err(|err| {
            error!("challenge submission failed: {err}");
            ApiError::internal(err.to_string())
        })?;
    Ok(Json(json!({
        "success": true,
        "executionId": execution.id,
        "message": "Evaluation started",
    })))
}

async fn workflow_status(
    State(state): State<AppState>,
    Path(execution_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let execution = state
        .workflows
        .execution_status(&execution_id)
        .await
        .map_err(|err| {
            error!("workflow status lookup failed: {err}");
            ApiError::internal(err.to_string())
        })?;
    Ok(Json(json!({
        "status": execution.status,
        "outputs": execution.outputs,
        "completed": execution.completed,
    })))
}

#[derive(Debug, Deserialize, Default)]
struct LearningPathInput {
    trigger_event: Option<String>,
}

async fn update_learning_path(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    Json(input): Json<LearningPathInput>,
) -> Result<Json<Value>, ApiError> {
    let execution = state
        .workflows
        .update_learning_path(&user_id, input.trigger_event.as_deref())
        .await
        .map_err(|err| {
            error!("learning path update failed: {err}");
            ApiError::internal(err.to_string())
        })?;
    Ok(Json(json!({
        "success": true,
        "executionId": execution.id,
    })))
}

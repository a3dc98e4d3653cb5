//! Client for the workflow engine that runs CADara's long-lived pipelines.
//!
//! Challenge submissions and learning-path updates are not handled inline by
//! the chat backend; they are delegated to flows deployed on a Kestra-style
//! engine. This crate wraps the two calls the backend makes against that
//! engine: starting an execution of a known flow and polling an execution by
//! id. The HTTP layer decides how engine failures map onto client responses.

use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

pub const DEFAULT_ENGINE_URL: &str = "http://localhost:8080";

/// Flows this backend triggers. The namespace and flow id name pipelines
/// deployed on the engine, so they must match the engine's catalog exactly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Evaluates a submitted challenge solution.
    ChallengeEvaluation,
    /// Recomputes a user's personalized learning path.
    LearningPath,
}

impl Flow {
    pub fn namespace(self) -> &'static str {
        match self {
            Self::ChallengeEvaluation => "cademy.evaluation",
            Self::LearningPath => "cademy.personalization",
        }
    }

    pub fn flow_id(self) -> &'static str {
        match self {
            Self::ChallengeEvaluation => "challenge-submission-pipeline",
            Self::LearningPath => "learning-path-agent",
        }
    }
}

#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("workflow engine returned status {status}: {detail}")]
    Api { status: u16, detail: String },
    #[error("workflow engine unreachable: {0}")]
    Transport(String),
}

/// Handle returned by the engine when an execution is created.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionRef {
    pub id: String,
}

/// Flattened view of an execution, as reported to clients.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionStatus {
    pub status: String,
    pub outputs: Value,
    pub completed: bool,
}

#[derive(Clone)]
pub struct WorkflowClient {
    base_url: String,
    client: Client,
}

impl WorkflowClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self {
            base_url,
            client: Client::new(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Starts an execution of `flow` with the given inputs and returns its id.
    pub async fn start_execution(
        &self,
        flow: Flow,
        inputs: Value,
    ) -> Result<ExecutionRef, WorkflowError> {
        let url = format!(
            "{}/api/v1/executions/{}/{}",
            self.base_url,
            flow.namespace(),
            flow.flow_id()
        );
        let response = self
            .client
            .post(&url)
            .json(&json!({ "inputs": inputs }))
            .send()
            .await
            .map_err(transport)?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(api_error(status.as_u16(), detail));
        }
        response.json::<ExecutionRef>().await.map_err(transport)
    }

    /// Fetches an execution by id and flattens the engine's state shape.
    ///
    /// The engine reports state as `{ "state": { "current": "RUNNING" } }`
    /// alongside an optional `outputs` object. An execution counts as
    /// completed only when its current state is `SUCCESS`.
    pub async fn execution_status(
        &self,
        execution_id: &str,
    ) -> Result<ExecutionStatus, WorkflowError> {
        let url = format!("{}/api/v1/executions/{}", self.base_url, execution_id);
        let response = self.client.get(&url).send().await.map_err(transport)?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(api_error(status.as_u16(), detail));
        }

        let value: Value = response.json().await.map_err(transport)?;
        let current = value
            .get("state")
            .and_then(|v| v.get("current"))
            .and_then(|v| v.as_str())
            .unwrap_or("UNKNOWN")
            .to_string();
        let outputs = value.get("outputs").cloned().unwrap_or(Value::Null);
        let completed = current == "SUCCESS";
        Ok(ExecutionStatus {
            status: current,
            outputs,
            completed,
        })
    }

    /// Kicks off the challenge evaluation pipeline.
    ///
    /// The flow declares `submission_data` as a string input, so the
    /// submitted solution is serialized before dispatch.
    pub async fn submit_challenge(
        &self,
        submission_data: &Value,
        challenge_id: &str,
        user_id: &str,
    ) -> Result<ExecutionRef, WorkflowError> {
        let inputs = json!({
            "submission_data": submission_data.to_string(),
            "challenge_id": challenge_id,
            "user_id": user_id,
        });
        self.start_execution(Flow::ChallengeEvaluation, inputs).await
    }

    /// Kicks off a learning-path recomputation for one user.
    pub async fn update_learning_path(
        &self,
        user_id: &str,
        trigger_event: Option<&str>,
    ) -> Result<ExecutionRef, WorkflowError> {
        let inputs = json!({
            "user_id": user_id,
            "trigger_event": trigger_event.unwrap_or("periodic"),
        });
        self.start_execution(Flow::LearningPath, inputs).await
    }
}

fn transport(err: reqwest::Error) -> WorkflowError {
    WorkflowError::Transport(err.to_string())
}

fn api_error(status: u16, detail: String) -> WorkflowError {
    let mut detail = detail.trim().to_string();
    if detail.is_empty() {
        detail = "no response body".to_string();
    } else if detail.chars().count() > 300 {
        detail = detail.chars().take(300).collect();
    }
    WorkflowError::Api { status, detail }
}

use cadara_core::ChatService;
use cadara_workflows::WorkflowClient;

mod http;

pub use http::serve;

/// Shared state handed to every route handler. Cheap to clone; all routes
/// see the same provider registry and workflow client.
#[derive(Clone)]
pub struct AppState {
    pub chat: ChatService,
    pub workflows: WorkflowClient,
}

impl AppState {
    pub fn new(chat: ChatService, workflows: WorkflowClient) -> Self {
        Self { chat, workflows }
    }
}

pub mod chat;
pub mod health;

pub use chat::{ChatMessage, ChatReply, DirectReply, Role, TokenUsage};
pub use health::ProviderHealth;

pub mod config;
pub mod fallback;
pub mod prompt;
pub mod service;

pub const DEFAULT_SERVER_HOST: &str = "127.0.0.1";
pub const DEFAULT_SERVER_PORT: u16 = 3001;

pub use config::*;
pub use fallback::*;
pub use prompt::*;
pub use service::*;

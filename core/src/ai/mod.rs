pub mod config;
pub mod orchestrator;
pub mod providers;

pub use config::{AiProviderInfo, AiRuntimeSelection};
pub use orchestrator::{
    AiChatInput, AiChatMessage, AiChatResponse, AiUsageMetrics, ChatBackend, HttpChatBackend,
};

//! LLM credential brokering and the completion client.

pub mod broker;
pub mod client;

pub use broker::{BindingInfo, GroupBinding, LlmBroker, LlmPreset, parse_duration};
pub use client::{ChatCompletion, ChatMessage, CompletionOutput, LlmClient, Role, TokenUsage};

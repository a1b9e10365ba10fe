//! `demandflow-llm`
//!
//! **Responsibility:** the boundary to large-language-model providers.
//!
//! - [`LlmClient`] is the only thing the worker calls; it knows nothing about
//!   requests, queues, or storage.
//! - [`LlmError::is_transient`] is the single classification the retry loop
//!   relies on.
//! - Prompt assembly and response parsing are pure functions kept here so the
//!   worker stays orchestration-only.

pub mod client;
pub mod error;
pub mod http;
pub mod parse;
pub mod prompt;
pub mod scripted;

pub use client::{LlmClient, LlmResponse};
pub use error::LlmError;
pub use http::{HttpLlmClient, ProviderEndpoint};
pub use parse::{GeneratedPayload, JsonResponseParser, ParseError, ResponseParser};
pub use prompt::Prompt;
pub use scripted::ScriptedLlmClient;

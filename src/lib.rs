//! multiai - Local OpenAI-compatible gateway for free-tier LLMs.
//!
//! Aggregates free models from Ollama, OpenCode Zen and OpenRouter,
//! fans chat-completion requests out across them with per-model
//! resilience (retry, circuit breaking), and captures transaction
//! telemetry for inspection and spending accounting.

pub mod config;
pub mod error;
pub mod gateway;
pub mod infra;
pub mod scanner;
pub mod shared;

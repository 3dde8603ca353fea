//! Local AI inference gateway.
//!
//! A single OpenAI-compatible front door for a heterogeneous pool of model
//! backends (chat/embedding runtimes, image generators, music/TTS engines).
//! The library crate exists so both binaries (`inference-gateway` and
//! `user-manager`) share one module tree; all routing, admission, streaming
//! and tool-execution logic lives here.

pub mod admission;
pub mod agent;
pub mod aliases;
pub mod canonical;
pub mod context;
pub mod error;
pub mod gateway;
pub mod health;
pub mod ids;
pub mod metrics;
pub mod observability;
pub mod registry;
pub mod request_log;
pub mod router;
pub mod settings;
pub mod stores;
pub mod tools;
pub mod upstream;

pub use context::GatewayContext;
pub use error::GatewayError;
pub use settings::Settings;

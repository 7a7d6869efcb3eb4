//! llama-gateway: OpenAI- and Claude-compatible HTTP front end for one local model
//!
//! This library provides:
//! - Role normalization across both wire protocols
//! - Llama-2 `[INST]` prompt templating
//! - Non-streaming JSON bodies and SSE frame streams in either protocol's shape
//! - A llama.cpp-backed [`TextGenerator`] that runs one process per request
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use llama_gateway::{create_router, AppState, GatewayConfig, LlamaCppEngine, Result};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let config = GatewayConfig::default();
//!     let engine = LlamaCppEngine::load(&config.llama_bin, &config.model_path, 0).await?;
//!
//!     let app = create_router(AppState::new(Arc::new(engine), config));
//!     let listener = tokio::net::TcpListener::bind("0.0.0.0:3000").await?;
//!     axum::serve(listener, app).await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod emitter;
pub mod engine;
pub mod error;
pub mod messages;
pub mod prompt;
pub mod server;

pub use config::GatewayConfig;
pub use emitter::{estimate_tokens, Frame, Protocol, ResponseContext};
pub use engine::{ChunkStream, GenerationOptions, LlamaCppEngine, TextGenerator};
pub use error::{ApiError, GenerationError};
pub use messages::{normalize, Message, RawMessage, Role};
pub use prompt::render_prompt;
pub use server::{create_router, serve, AppState, CompletionRequest};

pub type Result<T> = std::result::Result<T, anyhow::Error>;

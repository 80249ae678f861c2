//! Embeddable LLM serving core.
//!
//! A [`Model`] loads weights through a [`ComputeBackend`](llama_engine::ComputeBackend)
//! and splits its context budget between registered processors. A
//! [`TextProcessor`] prefills prompts and decodes tokens; an
//! [`EmbedderProcessor`] turns sequences into vectors. Each processor runs its
//! blocking work on its own worker thread and hands results to a client from
//! `update()`.

pub mod client;
pub mod config;
pub mod error;
pub mod model;
pub mod processor;
pub mod signal;

pub use client::{Client, ClientGuard, EmbedderClient, TextClient};
pub use config::{DecodeBehavior, EmbedderConfig, ModelConfig, ProcessorConfig, ServeConfig};
pub use error::{ConfigError, InitFailure, ModelError, ModelResult, ProcessorError, ProcessorResult};
pub use model::{Model, ModelObserver, ModelState};
pub use processor::{
    cosine_similarity, CachingMode, EmbedderProcessor, FinishState, ProcessorLifecycle,
    ProcessorObserver, ProcessorStatus, TextProcessor, TokenDescription,
};
pub use signal::Signal;

pub use llama_engine::{ModelMetadata, TokenId};
pub use llama_sampling::{RepetitionParams, SamplerDescription, SamplerKind};
pub use llama_tokenizer::{ChatTemplate, ContextLine, Role};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

//! Error types for the llama-serve core.
//!
//! Synchronous failures come back from the call that triggered them and
//! leave every state machine untouched. Worker-side failures are recorded as
//! an [`InitFailure`] and surfaced on the next `update()`.

use std::path::PathBuf;

use llama_engine::LlamaError;
use llama_sampling::SamplingError;
use thiserror::Error;

/// Why a model load or a processor's context creation failed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InitFailure {
    #[error("model file not found: {0}")]
    PathNotFound(String),

    #[error("model metadata mismatch: {0}")]
    MetadataMismatch(String),

    #[error("not enough memory: {0}")]
    NotEnoughMemory(String),

    #[error("backend failed to load: {0}")]
    BackendLoadError(String),

    #[error("model is not initialized")]
    ModelNotInitialized,
}

impl From<LlamaError> for InitFailure {
    fn from(e: LlamaError) -> Self {
        match e {
            LlamaError::PathNotFound(path) => InitFailure::PathNotFound(path.display().to_string()),
            LlamaError::Metadata(msg) => InitFailure::MetadataMismatch(msg),
            LlamaError::OutOfMemory(msg) => InitFailure::NotEnoughMemory(msg),
            other => InitFailure::BackendLoadError(other.to_string()),
        }
    }
}

/// Errors returned by [`Model`](crate::Model) operations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ModelError {
    #[error("model is initializing")]
    Initializing,

    #[error("model is being destroyed")]
    Destroying,

    #[error("model is not initialized")]
    NotInitialized,

    #[error("model is already initialized")]
    AlreadyInitialized,

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("context length {requested} is below the minimum of {minimum}")]
    InvalidContextLength { requested: u32, minimum: u32 },

    #[error("model context is full: requested {requested}, available {available}")]
    ContextFull { requested: u32, available: u32 },

    #[error("processor is already registered")]
    ProcessorAlreadyRegistered,

    #[error("processor kind does not match the model: {0}")]
    ProcessorKindMismatch(String),

    #[error("invalid sampler chain: {0}")]
    InvalidSampler(#[from] SamplingError),

    #[error("initialization failed: {0}")]
    InitFailed(#[from] InitFailure),

    #[error("failed to spawn worker thread: {0}")]
    WorkerSpawn(String),
}

impl ModelError {
    /// Lifecycle information rather than a failure: call `update()` again.
    pub fn is_info(&self) -> bool {
        matches!(self, ModelError::Initializing | ModelError::Destroying)
    }
}

/// Errors returned by processor operations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProcessorError {
    #[error("processor is initializing")]
    Initializing,

    #[error("processor is being destroyed")]
    Destroying,

    #[error("processor has results waiting for update()")]
    NeedUpdate,

    #[error("processor is not registered")]
    Unregistered,

    #[error("processor is already processing")]
    AlreadyProcessing,

    #[error("no inference client is bound")]
    MissingClient,

    #[error("client belongs to another processor")]
    BelongsToAnotherProcessor,

    #[error("processor is halted")]
    Halted,

    #[error("input is empty")]
    InputEmpty,

    #[error("input of {len} tokens exceeds the limit of {limit}")]
    InputExceedsTokenLimit { len: usize, limit: u32 },

    #[error("tokenization failed: {0}")]
    TokenizationFailed(String),

    #[error("kv_locked input requires the KvLock caching mode")]
    CachingModeMismatch,

    #[error("model is unavailable")]
    ModelUnavailable,

    #[error("initialization failed: {0}")]
    InitializeFailed(InitFailure),
}

impl ProcessorError {
    /// Lifecycle information rather than a failure: call `update()` again.
    pub fn is_info(&self) -> bool {
        matches!(
            self,
            ProcessorError::Initializing | ProcessorError::Destroying | ProcessorError::NeedUpdate
        )
    }
}

/// Errors loading a [`ServeConfig`](crate::ServeConfig).
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid config value: {0}")]
    Invalid(String),
}

pub type ModelResult<T> = std::result::Result<T, ModelError>;
pub type ProcessorResult<T> = std::result::Result<T, ProcessorError>;

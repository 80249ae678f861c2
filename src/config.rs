//! Configuration for models, processors and decode calls.
//!
//! Every struct deserializes with `#[serde(default)]`, so a JSON file only
//! needs the fields it changes.

use std::path::Path;

use llama_engine::ContextParams;
use llama_sampling::SamplerDescription;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::processor::CachingMode;

/// Smallest context a processor may reserve.
pub const MIN_CONTEXT_LENGTH: u32 = 32;

/// Model loading parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Context budget shared by every processor registered on the model.
    pub total_context: u32,
    pub gpu_layers: i32,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            total_context: 4096,
            gpu_layers: 0,
        }
    }
}

impl ModelConfig {
    pub fn with_total_context(mut self, total_context: u32) -> Self {
        self.total_context = total_context;
        self
    }

    pub fn with_gpu_layers(mut self, gpu_layers: i32) -> Self {
        self.gpu_layers = gpu_layers;
        self
    }
}

/// Text processor registration parameters.
///
/// Zero `batch_size`, `thread_count` or `batch_thread_count` mean "derive a
/// default": batch is an eighth of the context, one thread, and as many batch
/// threads as threads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessorConfig {
    pub context_length: u32,
    pub batch_size: u32,
    pub thread_count: u32,
    pub batch_thread_count: u32,
    pub flash_attention: bool,
    /// Applied in order; the order is significant.
    pub samplers: Vec<SamplerDescription>,
    pub caching: CachingMode,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            context_length: 2048,
            batch_size: 0,
            thread_count: 0,
            batch_thread_count: 0,
            flash_attention: false,
            samplers: Vec::new(),
            caching: CachingMode::Disabled,
        }
    }
}

impl ProcessorConfig {
    pub fn new(context_length: u32) -> Self {
        Self {
            context_length,
            ..Self::default()
        }
    }

    pub fn with_batch_size(mut self, batch_size: u32) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_threads(mut self, thread_count: u32) -> Self {
        self.thread_count = thread_count;
        self
    }

    pub fn with_batch_threads(mut self, batch_thread_count: u32) -> Self {
        self.batch_thread_count = batch_thread_count;
        self
    }

    pub fn with_flash_attention(mut self, enabled: bool) -> Self {
        self.flash_attention = enabled;
        self
    }

    pub fn with_samplers(mut self, samplers: Vec<SamplerDescription>) -> Self {
        self.samplers = samplers;
        self
    }

    /// Append one sampler to the end of the chain.
    pub fn with_sampler(mut self, sampler: SamplerDescription) -> Self {
        self.samplers.push(sampler);
        self
    }

    pub fn with_caching(mut self, caching: CachingMode) -> Self {
        self.caching = caching;
        self
    }

    pub(crate) fn context_params(&self) -> ContextParams {
        let batch_size = if self.batch_size == 0 {
            self.context_length / 8
        } else {
            self.batch_size
        };
        let (thread_count, batch_thread_count) =
            resolve_threads(self.thread_count, self.batch_thread_count);
        ContextParams {
            context_length: self.context_length,
            batch_size: batch_size.clamp(1, self.context_length.max(1)),
            thread_count,
            batch_thread_count,
            flash_attention: self.flash_attention,
            embeddings: false,
        }
    }
}

/// Embedder registration parameters. The whole input goes out in one call,
/// so the batch defaults to the full context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbedderConfig {
    pub context_length: u32,
    pub batch_size: u32,
    pub thread_count: u32,
    pub batch_thread_count: u32,
    pub flash_attention: bool,
}

impl Default for EmbedderConfig {
    fn default() -> Self {
        Self {
            context_length: 512,
            batch_size: 0,
            thread_count: 0,
            batch_thread_count: 0,
            flash_attention: false,
        }
    }
}

impl EmbedderConfig {
    pub fn new(context_length: u32) -> Self {
        Self {
            context_length,
            ..Self::default()
        }
    }

    pub fn with_batch_size(mut self, batch_size: u32) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_threads(mut self, thread_count: u32) -> Self {
        self.thread_count = thread_count;
        self
    }

    pub(crate) fn context_params(&self) -> ContextParams {
        let batch_size = if self.batch_size == 0 {
            self.context_length
        } else {
            self.batch_size.min(self.context_length)
        };
        let (thread_count, batch_thread_count) =
            resolve_threads(self.thread_count, self.batch_thread_count);
        ContextParams {
            context_length: self.context_length,
            batch_size: batch_size.max(1),
            thread_count,
            batch_thread_count,
            flash_attention: self.flash_attention,
            embeddings: true,
        }
    }
}

fn resolve_threads(thread_count: u32, batch_thread_count: u32) -> (u32, u32) {
    let threads = thread_count.max(1);
    let batch_threads = if batch_thread_count == 0 {
        threads
    } else {
        batch_thread_count
    };
    (threads, batch_threads)
}

/// How far one `next()` call advances a text processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecodeBehavior {
    /// Tokens to generate before the call completes.
    pub token_budget: u32,
    /// Pause between consecutive steps of one call, in milliseconds.
    pub halt_delay_ms: u64,
    /// Halt the processor once the first token of the call is delivered.
    pub halt_on_write: bool,
}

impl Default for DecodeBehavior {
    fn default() -> Self {
        Self {
            token_budget: 1,
            halt_delay_ms: 0,
            halt_on_write: false,
        }
    }
}

impl DecodeBehavior {
    pub fn with_token_budget(mut self, token_budget: u32) -> Self {
        self.token_budget = token_budget;
        self
    }

    pub fn with_halt_delay_ms(mut self, halt_delay_ms: u64) -> Self {
        self.halt_delay_ms = halt_delay_ms;
        self
    }

    pub fn with_halt_on_write(mut self, halt_on_write: bool) -> Self {
        self.halt_on_write = halt_on_write;
        self
    }
}

/// Everything an application typically reads from one JSON file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServeConfig {
    pub model: ModelConfig,
    pub processor: ProcessorConfig,
    pub embedder: EmbedderConfig,
    pub decode: DecodeBehavior,
}

impl ServeConfig {
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        let config: ServeConfig = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Values no registration could ever accept.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.model.total_context == 0 {
            return Err(ConfigError::Invalid(
                "model.total_context must be non-zero".to_string(),
            ));
        }
        for sampler in &self.processor.samplers {
            sampler
                .validate()
                .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        }
        Ok(())
    }
}

//! # llama-engine
//!
//! The "narrow waist" of the llama-serve stack. Defines the compute capability
//! that the serving core consumes: loading weights, tokenization, context
//! creation, batched decode/encode, logits, embeddings and KV maintenance.
//! Implementations can swap CPU/GPU/FFI backends without changing the
//! processors that drive them.
//!
//! ## Design Notes
//!
//! ### Ownership
//! [`ModelWeights`] is shared (`Arc`) between the model and every context
//! created from it; the last owner frees it. [`ComputeContext`] is a
//! move-only handle owned by exactly one worker thread. Dropping the box is
//! the only way to free a context, so it is released exactly once.
//!
//! ### Token Type
//! `TokenId` is aliased as `i32` for FFI compatibility, though token IDs are logically
//! non-negative.

use std::path::{Path, PathBuf};
use std::sync::Arc;

pub type Result<T> = std::result::Result<T, LlamaError>;

/// Token ID type (i32 for FFI compat; logically non-negative).
pub type TokenId = i32;

/// Sequence ID inside a batch. Text processors use a single sequence, the
/// embedder tags every input sequence with its own id.
pub type SeqId = i32;

/// Top-level error type for all backend operations.
#[derive(Debug, thiserror::Error)]
pub enum LlamaError {
    #[error("Model file not found: {}", .0.display())]
    PathNotFound(PathBuf),
    #[error("Model metadata mismatch: {0}")]
    Metadata(String),
    #[error("Model loading failed: {0}")]
    ModelLoad(String),
    #[error("Out of memory: {0}")]
    OutOfMemory(String),
    #[error("Tokenization failed: {0}")]
    Tokenization(String),
    #[error("Inference failed: {0}")]
    Inference(String),
}

/// Architecture and vocabulary facts read from a model file.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelMetadata {
    pub name: String,
    /// Architecture tag (`llama`, `qwen2`, `gemma2`, ...). Selects the chat template.
    pub architecture: String,
    pub embedding_length: usize,
    pub vocab_size: usize,
    /// Quantization tag, e.g. `Q4_K_M`.
    pub quantization: String,
    /// Context length the model was trained with.
    pub trained_context_length: u32,
    pub is_embedding_model: bool,
    pub has_encoder: bool,
    pub has_decoder: bool,
    pub eot_token: Option<TokenId>,
    pub linefeed_token: Option<TokenId>,
}

/// Per-token attributes reported by the vocabulary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenAttributes {
    pub is_control: bool,
    pub is_special: bool,
    pub is_end_of_generation: bool,
}

/// Parameters for loading weights.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadParams {
    /// Number of layers to offload to an accelerator. Backends without one ignore it.
    pub gpu_layers: i32,
    pub use_mmap: bool,
}

impl Default for LoadParams {
    fn default() -> Self {
        Self {
            gpu_layers: 0,
            use_mmap: true,
        }
    }
}

/// Parameters for creating a compute context.
#[derive(Debug, Clone, PartialEq)]
pub struct ContextParams {
    pub context_length: u32,
    pub batch_size: u32,
    pub thread_count: u32,
    pub batch_thread_count: u32,
    pub flash_attention: bool,
    /// Produce pooled embeddings instead of logits.
    pub embeddings: bool,
}

/// A batch of tokens submitted in one decode/encode call.
///
/// Each entry carries its position, the sequence it belongs to, and whether
/// the backend should produce output (logits or embeddings) for it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Batch {
    tokens: Vec<TokenId>,
    positions: Vec<u32>,
    seq_ids: Vec<SeqId>,
    outputs: Vec<bool>,
}

/// One entry of a [`Batch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchEntry {
    pub token: TokenId,
    pub position: u32,
    pub seq_id: SeqId,
    pub output: bool,
}

impl Batch {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            tokens: Vec::with_capacity(capacity),
            positions: Vec::with_capacity(capacity),
            seq_ids: Vec::with_capacity(capacity),
            outputs: Vec::with_capacity(capacity),
        }
    }

    /// Single-sequence batch starting at `start`, with output only on the last token.
    pub fn for_sequence(tokens: &[TokenId], start: u32, seq_id: SeqId) -> Self {
        let mut batch = Self::with_capacity(tokens.len());
        for (i, &token) in tokens.iter().enumerate() {
            let last = i + 1 == tokens.len();
            batch.push(token, start + i as u32, seq_id, last);
        }
        batch
    }

    pub fn push(&mut self, token: TokenId, position: u32, seq_id: SeqId, output: bool) {
        self.tokens.push(token);
        self.positions.push(position);
        self.seq_ids.push(seq_id);
        self.outputs.push(output);
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn tokens(&self) -> &[TokenId] {
        &self.tokens
    }

    /// Number of entries that request output.
    pub fn output_count(&self) -> usize {
        self.outputs.iter().filter(|o| **o).count()
    }

    pub fn entries(&self) -> impl Iterator<Item = BatchEntry> + '_ {
        (0..self.tokens.len()).map(move |i| BatchEntry {
            token: self.tokens[i],
            position: self.positions[i],
            seq_id: self.seq_ids[i],
            output: self.outputs[i],
        })
    }

    pub fn clear(&mut self) {
        self.tokens.clear();
        self.positions.clear();
        self.seq_ids.clear();
        self.outputs.clear();
    }
}

/// Entry point of a compute backend: reads metadata and loads weights.
pub trait ComputeBackend: Send + Sync {
    /// Short backend name for logs and telemetry.
    fn name(&self) -> &str;

    /// Read architecture metadata without loading the weights.
    fn read_metadata(&self, path: &Path) -> Result<ModelMetadata>;

    /// Load weights. Blocking; called from a worker thread.
    fn load(&self, path: &Path, params: &LoadParams) -> Result<Arc<dyn ModelWeights>>;
}

/// Loaded weights and vocabulary.
pub trait ModelWeights: Send + Sync {
    fn metadata(&self) -> &ModelMetadata;

    /// Convert text into token IDs. With `parse_special`, control strings such
    /// as chat-template delimiters map to their single control token.
    fn tokenize(&self, text: &str, parse_special: bool) -> Result<Vec<TokenId>>;

    /// Raw bytes of a token. May be a partial UTF-8 sequence.
    fn token_to_piece(&self, token: TokenId) -> Result<Vec<u8>>;

    fn token_attributes(&self, token: TokenId) -> TokenAttributes;

    fn is_end_of_generation(&self, token: TokenId) -> bool {
        self.token_attributes(token).is_end_of_generation
    }

    /// Create a context over these weights. Blocking; called from a worker thread.
    fn create_context(&self, params: &ContextParams) -> Result<Box<dyn ComputeContext>>;
}

/// A native inference context with its own KV cache.
pub trait ComputeContext: Send {
    /// Run the decoder over `batch`, appending its entries to the KV cache.
    fn decode(&mut self, batch: &Batch) -> Result<()>;

    /// Run the encoder over `batch` (encoder-only embedding models).
    fn encode(&mut self, batch: &Batch) -> Result<()>;

    /// Logits for entry `batch_index` of the most recent batch. The entry
    /// must have requested output.
    fn logits(&self, batch_index: usize) -> Result<&[f32]>;

    /// Pooled embedding of `seq_id` from the most recent batch.
    fn embedding(&self, seq_id: SeqId) -> Result<&[f32]>;

    /// Number of occupied KV cells.
    fn kv_used_cells(&self) -> usize;

    /// Drop every cached cell.
    fn kv_clear(&mut self);

    /// Drop cells of `seq_id` with positions in `[from, to)`; `None` means to the end.
    fn kv_remove(&mut self, seq_id: SeqId, from: u32, to: Option<u32>) -> bool;
}

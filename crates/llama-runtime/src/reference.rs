//! Deterministic reference backend.
//!
//! A "model file" is a JSON [`ModelCard`]. Logits are derived from a hash of
//! the sequence history, so the same prompt always yields the same tokens.
//! A card may carry a `script`: the backend then strongly favours the next
//! unspoken token of the script and ends with the end-of-turn token once the
//! script is exhausted.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use llama_engine::{
    Batch, ComputeBackend, ComputeContext, ContextParams, LlamaError, LoadParams, ModelMetadata,
    ModelWeights, Result, SeqId, TokenAttributes, TokenId,
};
use llama_kv::KvCells;
use llama_tokenizer::{ByteTokenizer, ChatTemplate, Tokenizer, EOS_TOKEN, UNK_TOKEN};
use serde::{Deserialize, Serialize};
use tracing::debug;

const SCRIPT_LOGIT: f32 = 10.0;
const EOG_PENALTY: f32 = 4.0;

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Contents of a reference model file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelCard {
    pub name: String,
    pub architecture: String,
    pub embedding_length: usize,
    pub quantization: String,
    pub context_length: u32,
    pub embedding_model: bool,
    /// Encoder-only model: embeddings come from `encode` and no KV is kept.
    pub encoder: bool,
    /// Text the model "wants" to say; tokenized with control strings parsed.
    pub script: Option<String>,
    pub seed: u64,
    /// Make `load` fail after metadata was read.
    pub fail_load: bool,
    /// Largest context a single `create_context` may request.
    pub context_memory_limit: Option<u32>,
    /// Artificial latency per decode call.
    pub decode_delay_ms: u64,
    /// Decode calls a context serves before every further one fails.
    pub fail_decode_after: Option<u32>,
}

impl Default for ModelCard {
    fn default() -> Self {
        Self {
            name: "reference".to_string(),
            architecture: "llama".to_string(),
            embedding_length: 16,
            quantization: "F32".to_string(),
            context_length: 4096,
            embedding_model: false,
            encoder: false,
            script: None,
            seed: 0x5eed,
            fail_load: false,
            context_memory_limit: None,
            decode_delay_ms: 0,
            fail_decode_after: None,
        }
    }
}

impl ModelCard {
    pub fn from_path(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(LlamaError::PathNotFound(path.to_path_buf()));
        }
        let raw = fs::read_to_string(path).map_err(|e| LlamaError::Metadata(e.to_string()))?;
        let card: ModelCard =
            serde_json::from_str(&raw).map_err(|e| LlamaError::Metadata(e.to_string()))?;
        if card.architecture.is_empty() {
            return Err(LlamaError::Metadata("missing architecture".to_string()));
        }
        Ok(card)
    }

    pub fn write_to(&self, path: &Path) -> std::io::Result<()> {
        let json = serde_json::to_string_pretty(self).map_err(std::io::Error::other)?;
        fs::write(path, json)
    }
}

/// Something the backend did, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendEvent {
    WeightsLoaded { name: String },
    WeightsFreed { name: String },
    ContextCreated { context: u64 },
    ContextFreed { context: u64 },
    Decoded { context: u64, tokens: usize },
    Encoded { context: u64, tokens: usize },
    KvCleared { context: u64 },
}

/// Shared, append-only record of backend events.
#[derive(Debug, Clone, Default)]
pub struct BackendLog(Arc<Mutex<Vec<BackendEvent>>>);

impl BackendLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, event: BackendEvent) {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }

    pub fn events(&self) -> Vec<BackendEvent> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn count(&self, pred: impl Fn(&BackendEvent) -> bool) -> usize {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|e| pred(e))
            .count()
    }

    /// Contexts created but not yet freed.
    pub fn live_contexts(&self) -> usize {
        let created = self.count(|e| matches!(e, BackendEvent::ContextCreated { .. }));
        let freed = self.count(|e| matches!(e, BackendEvent::ContextFreed { .. }));
        created - freed
    }
}

/// Reference [`ComputeBackend`].
#[derive(Debug, Clone, Default)]
pub struct ReferenceBackend {
    log: BackendLog,
}

impl ReferenceBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_log(log: BackendLog) -> Self {
        Self { log }
    }

    pub fn log(&self) -> BackendLog {
        self.log.clone()
    }
}

impl ComputeBackend for ReferenceBackend {
    fn name(&self) -> &str {
        "reference"
    }

    fn read_metadata(&self, path: &Path) -> Result<ModelMetadata> {
        let card = ModelCard::from_path(path)?;
        Ok(Vocabulary::new(&card).metadata(&card))
    }

    fn load(&self, path: &Path, _params: &LoadParams) -> Result<Arc<dyn ModelWeights>> {
        let card = ModelCard::from_path(path)?;
        if card.fail_load {
            return Err(LlamaError::ModelLoad(format!(
                "{}: refusing to load",
                card.name
            )));
        }

        let vocab = Vocabulary::new(&card);
        let metadata = vocab.metadata(&card);
        let script = match &card.script {
            Some(text) => vocab.tokenizer.encode_with(text, true),
            None => Vec::new(),
        };
        debug!(name = %card.name, arch = %card.architecture, vocab = metadata.vocab_size, "weights loaded");
        self.log.record(BackendEvent::WeightsLoaded {
            name: card.name.clone(),
        });

        Ok(Arc::new(ReferenceWeights {
            core: Arc::new(ModelCore {
                card,
                metadata,
                vocab,
                script,
                log: self.log.clone(),
            }),
        }))
    }
}

struct Vocabulary {
    tokenizer: ByteTokenizer,
    eog: Vec<TokenId>,
    eot: TokenId,
}

impl Vocabulary {
    fn new(card: &ModelCard) -> Self {
        let template = ChatTemplate::for_architecture(&card.architecture);
        let tokenizer = match &template {
            Some(t) => ByteTokenizer::with_special_tokens(t.control_strings()),
            None => ByteTokenizer::new(),
        };
        let eot = template
            .as_ref()
            .and_then(|t| tokenizer.special_id(t.assistant_end.trim_end_matches('\n')))
            .unwrap_or(EOS_TOKEN);
        let mut eog = vec![EOS_TOKEN];
        if eot != EOS_TOKEN {
            eog.push(eot);
        }
        Self { tokenizer, eog, eot }
    }

    fn metadata(&self, card: &ModelCard) -> ModelMetadata {
        ModelMetadata {
            name: card.name.clone(),
            architecture: card.architecture.clone(),
            embedding_length: card.embedding_length,
            vocab_size: self.tokenizer.vocab_size(),
            quantization: card.quantization.clone(),
            trained_context_length: card.context_length,
            is_embedding_model: card.embedding_model,
            has_encoder: card.encoder,
            has_decoder: !card.encoder,
            eot_token: Some(self.eot),
            linefeed_token: Some(self.tokenizer.byte_token(b'\n')),
        }
    }
}

struct ModelCore {
    card: ModelCard,
    metadata: ModelMetadata,
    vocab: Vocabulary,
    script: Vec<TokenId>,
    log: BackendLog,
}

impl ModelCore {
    fn next_logits(&self, history: &[TokenId]) -> Vec<f32> {
        let salt = history
            .iter()
            .fold(self.card.seed, |h, &t| splitmix64(h ^ t as u64));
        let mut logits: Vec<f32> = (0..self.metadata.vocab_size)
            .map(|t| unit(splitmix64(salt ^ (t as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15))))
            .collect();

        logits[UNK_TOKEN as usize] -= EOG_PENALTY;
        if self.script.is_empty() {
            for &t in &self.vocab.eog {
                logits[t as usize] -= EOG_PENALTY;
            }
        } else {
            let target = script_continuation(&self.script, history).unwrap_or(self.vocab.eot);
            logits[target as usize] = SCRIPT_LOGIT;
        }
        logits
    }

    fn embed(&self, tokens: &[TokenId]) -> Vec<f32> {
        let dim = self.card.embedding_length;
        let mut out = vec![0.0f32; dim];
        if tokens.is_empty() {
            return out;
        }
        for &t in tokens {
            for (j, slot) in out.iter_mut().enumerate() {
                let h = splitmix64(self.card.seed ^ ((t as u64) << 32) ^ j as u64);
                *slot += unit(h) * 2.0 - 1.0;
            }
        }
        let n = tokens.len() as f32;
        out.iter_mut().for_each(|v| *v /= n);
        out
    }
}

impl Drop for ModelCore {
    fn drop(&mut self) {
        debug!(name = %self.card.name, "weights freed");
        self.log.record(BackendEvent::WeightsFreed {
            name: self.card.name.clone(),
        });
    }
}

/// Next script token after the longest script prefix that ends `history`.
fn script_continuation(script: &[TokenId], history: &[TokenId]) -> Option<TokenId> {
    let matched = (0..=script.len().min(history.len()))
        .rev()
        .find(|&k| history.ends_with(&script[..k]))
        .unwrap_or(0);
    script.get(matched).copied()
}

fn splitmix64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9E37_79B9_7F4A_7C15);
    x = (x ^ (x >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    x ^ (x >> 31)
}

/// Map a hash to `[0, 1)`.
fn unit(h: u64) -> f32 {
    (h >> 40) as f32 / (1u64 << 24) as f32
}

struct ReferenceWeights {
    core: Arc<ModelCore>,
}

impl ModelWeights for ReferenceWeights {
    fn metadata(&self) -> &ModelMetadata {
        &self.core.metadata
    }

    fn tokenize(&self, text: &str, parse_special: bool) -> Result<Vec<TokenId>> {
        Ok(self.core.vocab.tokenizer.encode_with(text, parse_special))
    }

    fn token_to_piece(&self, token: TokenId) -> Result<Vec<u8>> {
        self.core
            .vocab
            .tokenizer
            .token_bytes(token)
            .map_err(|e| LlamaError::Tokenization(e.to_string()))
    }

    fn token_attributes(&self, token: TokenId) -> TokenAttributes {
        let control = self.core.vocab.tokenizer.is_control(token);
        TokenAttributes {
            is_control: control,
            is_special: control,
            is_end_of_generation: self.core.vocab.eog.contains(&token),
        }
    }

    fn create_context(&self, params: &ContextParams) -> Result<Box<dyn ComputeContext>> {
        if let Some(limit) = self.core.card.context_memory_limit {
            if params.context_length > limit {
                return Err(LlamaError::OutOfMemory(format!(
                    "context of {} tokens exceeds limit {}",
                    params.context_length, limit
                )));
            }
        }
        let id = NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed);
        debug!(context = id, ctx = params.context_length, batch = params.batch_size, "context created");
        self.core.log.record(BackendEvent::ContextCreated { context: id });

        Ok(Box::new(ReferenceContext {
            id,
            core: self.core.clone(),
            params: params.clone(),
            cells: KvCells::new(params.context_length as usize),
            logits: HashMap::new(),
            embeddings: HashMap::new(),
            decodes: 0,
        }))
    }
}

struct ReferenceContext {
    id: u64,
    core: Arc<ModelCore>,
    params: ContextParams,
    cells: KvCells,
    logits: HashMap<usize, Vec<f32>>,
    embeddings: HashMap<SeqId, Vec<f32>>,
    /// Decode calls served so far.
    decodes: u32,
}

impl ReferenceContext {
    fn check_batch(&self, batch: &Batch) -> Result<()> {
        if batch.is_empty() {
            return Err(LlamaError::Inference("empty batch".to_string()));
        }
        if batch.len() > self.params.batch_size as usize {
            return Err(LlamaError::Inference(format!(
                "batch of {} exceeds batch size {}",
                batch.len(),
                self.params.batch_size
            )));
        }
        if self.core.card.decode_delay_ms > 0 {
            std::thread::sleep(Duration::from_millis(self.core.card.decode_delay_ms));
        }
        Ok(())
    }
}

impl ComputeContext for ReferenceContext {
    fn decode(&mut self, batch: &Batch) -> Result<()> {
        self.check_batch(batch)?;
        if let Some(limit) = self.core.card.fail_decode_after {
            if self.decodes >= limit {
                return Err(LlamaError::Inference(format!(
                    "decode refused after {limit} calls"
                )));
            }
        }
        self.decodes += 1;
        self.cells
            .reserve(batch.len())
            .map_err(|e| LlamaError::Inference(e.to_string()))?;
        for entry in batch.entries() {
            self.cells
                .insert(entry.seq_id, entry.position, entry.token)
                .map_err(|e| LlamaError::Inference(e.to_string()))?;
        }

        self.logits.clear();
        self.embeddings.clear();
        for (i, entry) in batch.entries().enumerate() {
            if !entry.output {
                continue;
            }
            if self.params.embeddings {
                let tokens = self.cells.seq_tokens(entry.seq_id);
                self.embeddings
                    .insert(entry.seq_id, self.core.embed(&tokens));
            } else {
                let history = self.cells.seq_tokens_before(entry.seq_id, entry.position + 1);
                self.logits.insert(i, self.core.next_logits(&history));
            }
        }

        self.core.log.record(BackendEvent::Decoded {
            context: self.id,
            tokens: batch.len(),
        });
        Ok(())
    }

    fn encode(&mut self, batch: &Batch) -> Result<()> {
        self.check_batch(batch)?;
        let mut sequences: Vec<(SeqId, Vec<TokenId>)> = Vec::new();
        for entry in batch.entries() {
            match sequences.iter_mut().find(|(s, _)| *s == entry.seq_id) {
                Some((_, tokens)) => tokens.push(entry.token),
                None => sequences.push((entry.seq_id, vec![entry.token])),
            }
        }

        self.logits.clear();
        self.embeddings.clear();
        for (seq, tokens) in sequences {
            self.embeddings.insert(seq, self.core.embed(&tokens));
        }

        self.core.log.record(BackendEvent::Encoded {
            context: self.id,
            tokens: batch.len(),
        });
        Ok(())
    }

    fn logits(&self, batch_index: usize) -> Result<&[f32]> {
        self.logits
            .get(&batch_index)
            .map(Vec::as_slice)
            .ok_or_else(|| LlamaError::Inference(format!("no logits for entry {}", batch_index)))
    }

    fn embedding(&self, seq_id: SeqId) -> Result<&[f32]> {
        self.embeddings
            .get(&seq_id)
            .map(Vec::as_slice)
            .ok_or_else(|| LlamaError::Inference(format!("no embedding for sequence {}", seq_id)))
    }

    fn kv_used_cells(&self) -> usize {
        self.cells.used()
    }

    fn kv_clear(&mut self) {
        self.cells.clear();
        self.core
            .log
            .record(BackendEvent::KvCleared { context: self.id });
    }

    fn kv_remove(&mut self, seq_id: SeqId, from: u32, to: Option<u32>) -> bool {
        self.cells.remove(seq_id, from, to);
        true
    }
}

impl Drop for ReferenceContext {
    fn drop(&mut self) {
        debug!(context = self.id, "context freed");
        self.core
            .log
            .record(BackendEvent::ContextFreed { context: self.id });
    }
}

//! Shared fixtures: reference model cards, recording clients and helpers
//! that drive a processor until its worker has settled.

#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use llama_runtime::{BackendEvent, BackendLog, ModelCard, ReferenceBackend};
use llama_serve::{
    DecodeBehavior, EmbedderClient, EmbedderProcessor, FinishState, Model, ProcessorConfig,
    ProcessorStatus, TextClient, TextProcessor, TokenId,
};
use tempfile::TempDir;

pub fn card(name: &str) -> ModelCard {
    ModelCard {
        name: name.to_string(),
        ..ModelCard::default()
    }
}

/// A chat model that answers `script` and then ends its turn.
pub fn scripted_card(name: &str, script: &str) -> ModelCard {
    ModelCard {
        name: name.to_string(),
        architecture: "qwen2".to_string(),
        script: Some(script.to_string()),
        ..ModelCard::default()
    }
}

pub fn embedding_card(name: &str) -> ModelCard {
    ModelCard {
        name: name.to_string(),
        architecture: "bert".to_string(),
        embedding_model: true,
        encoder: true,
        ..ModelCard::default()
    }
}

pub fn write_card(dir: &TempDir, card: &ModelCard) -> PathBuf {
    let path = dir.path().join(format!("{}.json", card.name));
    card.write_to(&path).unwrap();
    path
}

/// A model that finished loading `card`.
pub struct Loaded {
    pub model: Model,
    pub log: BackendLog,
    pub dir: TempDir,
}

pub fn load(card: &ModelCard, total_context: u32) -> Loaded {
    let dir = TempDir::new().unwrap();
    let path = write_card(&dir, card);
    let log = BackendLog::new();
    let mut model = Model::new(Arc::new(ReferenceBackend::with_log(log.clone())));
    model.load_sync(&path, total_context, 0).unwrap();
    Loaded { model, log, dir }
}

pub fn text_processor(model: &Model, config: ProcessorConfig) -> TextProcessor {
    let processor = TextProcessor::new();
    model.register_text_processor(&processor, config).unwrap();
    processor.initialize_sync().unwrap();
    processor
}

pub fn weights_freed(log: &BackendLog) -> usize {
    log.count(|e| matches!(e, BackendEvent::WeightsFreed { .. }))
}

pub fn kv_clears(log: &BackendLog) -> usize {
    log.count(|e| matches!(e, BackendEvent::KvCleared { .. }))
}

/// Poll `update()` until nothing is in flight or waiting.
pub fn settle(processor: &TextProcessor) {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        processor.update();
        match processor.processor_status() {
            ProcessorStatus::InputProcessing
            | ProcessorStatus::Decoding
            | ProcessorStatus::NeedUpdate
            | ProcessorStatus::Initializing
            | ProcessorStatus::Destroying => {}
            _ => return,
        }
        assert!(Instant::now() < deadline, "processor did not settle");
        thread::sleep(Duration::from_millis(1));
    }
}

/// Decode until the sequence ends, `budget` tokens per call.
pub fn run_to_end(processor: &TextProcessor, budget: u32) -> FinishState {
    let behavior = DecodeBehavior::default().with_token_budget(budget);
    for _ in 0..1000 {
        processor.next_sync(behavior).unwrap();
        match processor.finish_state() {
            Some(FinishState::Continue) => continue,
            Some(state) => return state,
            None => panic!("no sequence pending"),
        }
    }
    panic!("sequence did not end");
}

/// Text client that records every callback.
#[derive(Default)]
pub struct Transcript {
    pub registered: usize,
    pub unregistered: usize,
    pub batches: Vec<(usize, bool)>,
    /// Printable text, control tokens excluded.
    pub text: String,
    pub tokens: Vec<TokenId>,
    pub control_tokens: Vec<TokenId>,
    pub finished: Vec<(u32, FinishState)>,
    /// Weights-freed events already logged when `on_unregister` ran.
    pub freed_at_unregister: Option<usize>,
    pub log: Option<BackendLog>,
}

impl Transcript {
    pub fn watching(log: BackendLog) -> Self {
        Self {
            log: Some(log),
            ..Self::default()
        }
    }
}

impl TextClient for Transcript {
    fn on_register(&mut self, _processor: &TextProcessor) {
        self.registered += 1;
    }

    fn on_batch_processed(&mut self, _processor: &TextProcessor, batch_len: usize, kv_locked: bool) {
        self.batches.push((batch_len, kv_locked));
    }

    fn on_write(
        &mut self,
        _processor: &TextProcessor,
        text: &str,
        token: TokenId,
        is_control: bool,
        _is_finished: bool,
    ) {
        self.tokens.push(token);
        if is_control {
            self.control_tokens.push(token);
        } else {
            self.text.push_str(text);
        }
    }

    fn on_finish(&mut self, _processor: &TextProcessor, total_tokens: u32, state: FinishState) {
        self.finished.push((total_tokens, state));
    }

    fn on_unregister(&mut self) {
        self.unregistered += 1;
        if let Some(log) = &self.log {
            self.freed_at_unregister = Some(weights_freed(log));
        }
    }
}

/// Embedder client that keeps every delivered vector.
#[derive(Default)]
pub struct VectorSink {
    pub registered: usize,
    pub unregistered: usize,
    pub batches: Vec<usize>,
    pub vectors: Vec<(usize, Vec<f32>, bool)>,
    pub finished: Vec<usize>,
}

impl EmbedderClient for VectorSink {
    fn on_register(&mut self, _processor: &EmbedderProcessor) {
        self.registered += 1;
    }

    fn on_batch_processed(&mut self, _processor: &EmbedderProcessor, batch_len: usize) {
        self.batches.push(batch_len);
    }

    fn on_write(&mut self, _processor: &EmbedderProcessor, vector: &[f32], index: usize, is_last: bool) {
        self.vectors.push((index, vector.to_vec(), is_last));
    }

    fn on_finish(&mut self, _processor: &EmbedderProcessor, total_elements: usize) {
        self.finished.push(total_elements);
    }

    fn on_unregister(&mut self) {
        self.unregistered += 1;
    }
}

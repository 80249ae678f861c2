//! # llama-cli
//!
//! Drives a [`Model`] end to end from the command line: load a model file,
//! register one processor, stream its output and tear everything down.

use std::io::{self, Write};

use llama_serve::{
    Client, ConfigError, ContextLine, EmbedderClient, EmbedderProcessor, FinishState, Model,
    ModelError, ProcessorError, ServeConfig, TextClient, TextProcessor, TokenId,
};
use tracing::{debug, info};

/// Errors from a CLI run.
#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    #[error("model error: {0}")]
    Model(#[from] ModelError),
    #[error("processor error: {0}")]
    Processor(#[from] ProcessorError),
    #[error("output error: {0}")]
    Io(#[from] io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("empty prompt")]
    EmptyPrompt,
}

/// Writes generated text to `out` as it arrives.
pub struct StreamWriter<W> {
    pub out: W,
    pub tokens: Vec<TokenId>,
    pub finish: Option<FinishState>,
    /// First write failure; later text is dropped.
    pub error: Option<io::Error>,
}

impl<W: Write> StreamWriter<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            tokens: Vec::new(),
            finish: None,
            error: None,
        }
    }
}

impl<W: Write + Send> TextClient for StreamWriter<W> {
    fn on_write(
        &mut self,
        _processor: &TextProcessor,
        text: &str,
        token: TokenId,
        is_control: bool,
        _is_finished: bool,
    ) {
        self.tokens.push(token);
        if is_control || self.error.is_some() {
            return;
        }
        if let Err(e) = self.out.write_all(text.as_bytes()).and_then(|_| self.out.flush()) {
            self.error = Some(e);
        }
    }

    fn on_finish(&mut self, _processor: &TextProcessor, total_tokens: u32, state: FinishState) {
        debug!(total_tokens, ?state, "generation finished");
        self.finish = Some(state);
    }
}

/// Outcome of [`generate`].
#[derive(Debug, Clone, PartialEq)]
pub struct GenerateSummary {
    pub prompt_tokens: usize,
    pub generated_tokens: usize,
    pub finish: FinishState,
}

/// Generate a reply to `prompt`, streaming it through `client`.
///
/// Stops at the end of the turn, at the context limit, or after
/// `max_tokens` tokens when given.
pub fn generate<W: Write + Send + 'static>(
    model: &Model,
    config: &ServeConfig,
    system: Option<&str>,
    prompt: &str,
    max_tokens: Option<u32>,
    client: &Client<StreamWriter<W>>,
) -> Result<GenerateSummary, CliError> {
    if prompt.trim().is_empty() {
        return Err(CliError::EmptyPrompt);
    }
    let processor = TextProcessor::new();
    model.register_text_processor(&processor, config.processor.clone())?;
    processor.initialize_sync()?;
    processor.set_inference_client(client)?;

    let mut lines = Vec::new();
    if let Some(system) = system {
        lines.push(ContextLine::system(system));
    }
    lines.push(ContextLine::user(prompt));
    let tokens = processor.tokenize_lines(&lines, true)?;
    let prompt_tokens = tokens.len();
    processor.execute_input_sync(tokens, false)?;
    info!(prompt_tokens, context = processor.reserved_context(), "prompt processed");

    let mut generated = 0;
    let finish = loop {
        let budget = match max_tokens {
            Some(limit) if generated >= limit => break FinishState::Continue,
            Some(limit) => config.decode.token_budget.clamp(1, limit - generated),
            None => config.decode.token_budget.max(1),
        };
        processor.next_sync(config.decode.with_token_budget(budget))?;
        generated = client.lock().tokens.len() as u32;
        match processor.finish_state() {
            Some(FinishState::Continue) => continue,
            Some(state) => break state,
            None => break FinishState::Failed,
        }
    };
    processor.destroy_sync()?;

    if let Some(e) = client.lock().error.take() {
        return Err(e.into());
    }
    Ok(GenerateSummary {
        prompt_tokens,
        generated_tokens: generated as usize,
        finish,
    })
}

/// Collects every delivered vector in order.
#[derive(Debug, Default)]
pub struct VectorCollector {
    pub vectors: Vec<Vec<f32>>,
}

impl EmbedderClient for VectorCollector {
    fn on_write(&mut self, _processor: &EmbedderProcessor, vector: &[f32], _index: usize, _is_last: bool) {
        self.vectors.push(vector.to_vec());
    }
}

/// Embed each text; one unit-length vector per text, in order.
pub fn embed(
    model: &Model,
    config: &ServeConfig,
    texts: &[String],
) -> Result<Vec<Vec<f32>>, CliError> {
    let processor = EmbedderProcessor::new();
    model.register_embedder_processor(&processor, config.embedder.clone())?;
    processor.initialize_sync()?;
    let client = Client::new(VectorCollector::default());
    processor.set_inference_client(&client)?;

    let sequences = texts
        .iter()
        .map(|text| processor.tokenize(text))
        .collect::<Result<Vec<_>, _>>()?;
    processor.execute_input_sync(sequences)?;
    while processor.pending_vectors() > 0 {
        processor.next()?;
    }
    processor.destroy_sync()?;

    let vectors = std::mem::take(&mut client.lock().vectors);
    Ok(vectors)
}

/// Human-readable summary of a loaded model.
pub fn describe(model: &Model) -> String {
    let mut out = String::new();
    if let Some(meta) = model.metadata() {
        out.push_str(&format!("Name:            {}\n", meta.name));
        out.push_str(&format!("Architecture:    {}\n", meta.architecture));
        out.push_str(&format!("Quantization:    {}\n", meta.quantization));
        out.push_str(&format!("Vocabulary:      {}\n", meta.vocab_size));
        out.push_str(&format!("Embedding size:  {}\n", meta.embedding_length));
        out.push_str(&format!("Trained context: {}\n", meta.trained_context_length));
        out.push_str(&format!("Embedding model: {}\n", meta.is_embedding_model));
    }
    out.push_str(&format!("Backend:         {}\n", model.backend_name()));
    out.push_str(&format!("Context budget:  {}\n", model.total_context_budget()));
    out
}

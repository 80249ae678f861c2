//! # llama-tokenizer
//!
//! Deterministic tokenization for llama-serve.
//!
//! This crate provides:
//! - A `Tokenizer` trait for pluggable tokenization backends
//! - A reference byte-level tokenizer with control tokens for testing
//! - Streaming decoding with UTF-8 handling
//! - Chat templates: role delimiters per model architecture

mod template;

pub use template::{ChatTemplate, ContextLine, Role};

use std::collections::HashMap;

/// Error type for tokenization operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TokenizerError {
    #[error("Invalid token ID: {0}")]
    InvalidToken(i32),
    #[error("Encoding error: {0}")]
    EncodingError(String),
    #[error("Decoding error: {0}")]
    DecodingError(String),
}

pub type TokenizerResult<T> = std::result::Result<T, TokenizerError>;

/// Core tokenizer trait. Implementations can be swapped without changing app code.
pub trait Tokenizer: Send + Sync {
    /// Encode text into a sequence of token IDs.
    fn encode(&self, text: &str) -> TokenizerResult<Vec<i32>>;

    /// Decode a complete sequence of tokens into text.
    fn decode(&self, tokens: &[i32]) -> TokenizerResult<String>;

    /// Decode a single token and accumulate with partial UTF-8 state.
    /// For streaming decoding, this allows emitting printable characters immediately.
    fn decode_token(&self, token: i32, state: &mut DecodingState) -> TokenizerResult<String>;

    /// Get vocabulary size.
    fn vocab_size(&self) -> usize;
}

/// Streaming decoding state for handling partial UTF-8 sequences.
///
/// Tokens may split a multi-byte character. Bytes are held back until the
/// character is complete; invalid sequences become U+FFFD.
#[derive(Debug, Clone, Default)]
pub struct DecodingState {
    buffer: String,
    pending_utf8: Vec<u8>,
}

impl DecodingState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything emitted so far.
    pub fn buffer(&self) -> &str {
        &self.buffer
    }

    /// Whether an incomplete character is being held back.
    pub fn has_pending(&self) -> bool {
        !self.pending_utf8.is_empty()
    }

    /// Feed raw token bytes; returns the text that became printable.
    pub fn push_bytes(&mut self, bytes: &[u8]) -> String {
        self.pending_utf8.extend_from_slice(bytes);
        let mut emitted = String::new();

        loop {
            match std::str::from_utf8(&self.pending_utf8) {
                Ok(text) => {
                    emitted.push_str(text);
                    self.pending_utf8.clear();
                    break;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    // valid_up_to guarantees this prefix is UTF-8
                    emitted.push_str(&String::from_utf8_lossy(&self.pending_utf8[..valid]));
                    match e.error_len() {
                        Some(bad) => {
                            emitted.push(char::REPLACEMENT_CHARACTER);
                            self.pending_utf8.drain(..valid + bad);
                        }
                        None => {
                            self.pending_utf8.drain(..valid);
                            break;
                        }
                    }
                }
            }
        }

        self.buffer.push_str(&emitted);
        emitted
    }

    /// Emit any held-back bytes lossily.
    pub fn flush(&mut self) -> String {
        if self.pending_utf8.is_empty() {
            return String::new();
        }
        let emitted = String::from_utf8_lossy(&self.pending_utf8).into_owned();
        self.pending_utf8.clear();
        self.buffer.push_str(&emitted);
        emitted
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
        self.pending_utf8.clear();
    }
}

pub const UNK_TOKEN: i32 = 0;
pub const BOS_TOKEN: i32 = 1;
pub const EOS_TOKEN: i32 = 2;

const BUILTIN_CONTROL: [&str; 3] = ["<unk>", "<s>", "</s>"];

/// Reference byte-level tokenizer.
///
/// - Ids `0..3` are `<unk>`, `<s>`, `</s>`
/// - Then one control token per registered special string (e.g. chat-template delimiters)
/// - Then one token per byte value, so any text roundtrips bit-perfectly
/// - Deterministic
pub struct ByteTokenizer {
    specials: Vec<String>,
    special_ids: HashMap<String, i32>,
    /// Specials sorted longest first for greedy matching.
    match_order: Vec<(String, i32)>,
}

impl ByteTokenizer {
    pub fn new() -> Self {
        Self::with_special_tokens(Vec::<String>::new())
    }

    /// Register extra control strings. Empty and duplicate strings are skipped.
    pub fn with_special_tokens<I, S>(specials: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut special_ids = HashMap::new();
        for (i, name) in BUILTIN_CONTROL.iter().enumerate() {
            special_ids.insert(name.to_string(), i as i32);
        }

        let mut ordered = Vec::new();
        for special in specials {
            let special = special.into();
            if special.is_empty() || special_ids.contains_key(&special) {
                continue;
            }
            let id = (BUILTIN_CONTROL.len() + ordered.len()) as i32;
            special_ids.insert(special.clone(), id);
            ordered.push(special);
        }

        let mut match_order: Vec<(String, i32)> =
            special_ids.iter().map(|(s, id)| (s.clone(), *id)).collect();
        match_order.sort_by(|a, b| b.0.len().cmp(&a.0.len()).then(a.1.cmp(&b.1)));

        Self {
            specials: ordered,
            special_ids,
            match_order,
        }
    }

    /// First byte token id.
    pub fn byte_offset(&self) -> i32 {
        (BUILTIN_CONTROL.len() + self.specials.len()) as i32
    }

    pub fn byte_token(&self, byte: u8) -> i32 {
        self.byte_offset() + byte as i32
    }

    pub fn special_id(&self, special: &str) -> Option<i32> {
        self.special_ids.get(special).copied()
    }

    /// Control tokens are every id below the byte range.
    pub fn is_control(&self, token: i32) -> bool {
        (0..self.byte_offset()).contains(&token)
    }

    /// Encode, optionally mapping registered control strings to their token.
    pub fn encode_with(&self, text: &str, parse_special: bool) -> Vec<i32> {
        let bytes = text.as_bytes();
        let mut ids = Vec::with_capacity(bytes.len());
        let mut i = 0;
        while i < bytes.len() {
            if parse_special {
                let hit = self
                    .match_order
                    .iter()
                    .find(|(s, _)| bytes[i..].starts_with(s.as_bytes()));
                if let Some((s, id)) = hit {
                    ids.push(*id);
                    i += s.len();
                    continue;
                }
            }
            ids.push(self.byte_token(bytes[i]));
            i += 1;
        }
        ids
    }

    /// Raw bytes of a token.
    pub fn token_bytes(&self, token: i32) -> TokenizerResult<Vec<u8>> {
        let offset = self.byte_offset();
        if token < 0 || token >= offset + 256 {
            return Err(TokenizerError::InvalidToken(token));
        }
        if token >= offset {
            return Ok(vec![(token - offset) as u8]);
        }
        let idx = token as usize;
        let text = match BUILTIN_CONTROL.get(idx) {
            Some(builtin) => builtin.to_string(),
            None => self.specials[idx - BUILTIN_CONTROL.len()].clone(),
        };
        Ok(text.into_bytes())
    }
}

impl Default for ByteTokenizer {
    fn default() -> Self {
        Self::new()
    }
}

impl Tokenizer for ByteTokenizer {
    fn encode(&self, text: &str) -> TokenizerResult<Vec<i32>> {
        Ok(self.encode_with(text, true))
    }

    fn decode(&self, tokens: &[i32]) -> TokenizerResult<String> {
        let mut bytes = Vec::with_capacity(tokens.len());
        for &token in tokens {
            bytes.extend(self.token_bytes(token)?);
        }
        String::from_utf8(bytes).map_err(|e| TokenizerError::DecodingError(e.to_string()))
    }

    fn decode_token(&self, token: i32, state: &mut DecodingState) -> TokenizerResult<String> {
        let bytes = self.token_bytes(token)?;
        Ok(state.push_bytes(&bytes))
    }

    fn vocab_size(&self) -> usize {
        self.byte_offset() as usize + 256
    }
}

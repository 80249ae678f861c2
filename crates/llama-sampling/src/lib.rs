//! # llama-sampling
//!
//! Token selection for llama-serve.
//!
//! A [`SamplerChain`] applies caller-ordered [`SamplerDescription`]s to a
//! mutable [`Candidates`] list, then normalizes with softmax and draws from
//! the distribution with a [`SeededRng`]. An empty chain is greedy.
//!
//! Supports:
//! - Top-k, top-p (nucleus), min-p and locally typical filtering
//! - Temperature scaling
//! - Repetition, frequency and presence penalties
//! - Deterministic seeded RNG for reproducible generation

mod chain;
mod samplers;

pub use chain::{SamplerChain, SamplerDescription, SamplerKind, RepetitionParams, DEFAULT_SEED};
pub use samplers::{
    apply_min_p, apply_penalties, apply_temperature, apply_top_k, apply_top_p, apply_typical,
};

use llama_engine::TokenId;

/// Sampling error type.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SamplingError {
    #[error("Invalid logits array")]
    InvalidLogits,
    #[error("No valid tokens after filtering")]
    NoValidTokens,
    #[error("Invalid sampler parameter: {0}")]
    InvalidParameter(String),
}

pub type SamplingResult<T> = std::result::Result<T, SamplingError>;

/// Deterministic RNG for reproducible sampling.
///
/// Uses a simple xorshift64 algorithm for fast, reproducible random numbers.
#[derive(Debug, Clone)]
pub struct SeededRng {
    state: u64,
}

impl SeededRng {
    pub fn new(seed: u64) -> Self {
        // Avoid zero state which would produce all zeros
        Self {
            state: if seed == 0 { 1 } else { seed },
        }
    }

    /// Generate next random float in [0, 1).
    pub fn next_f32(&mut self) -> f32 {
        // xorshift64
        self.state ^= self.state << 13;
        self.state ^= self.state >> 7;
        self.state ^= self.state << 17;
        (self.state >> 40) as f32 / (1u64 << 24) as f32
    }
}

/// A token with its logit and (after [`Candidates::softmax`]) probability.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TokenCandidate {
    pub id: TokenId,
    pub logit: f32,
    pub p: f32,
}

/// Mutable candidate list the samplers narrow and reweight.
#[derive(Debug, Clone)]
pub struct Candidates {
    data: Vec<TokenCandidate>,
    sorted: bool,
}

impl Candidates {
    /// One candidate per vocabulary entry, id = index.
    pub fn from_logits(logits: &[f32]) -> SamplingResult<Self> {
        if logits.is_empty() || logits.iter().any(|l| l.is_nan()) {
            return Err(SamplingError::InvalidLogits);
        }
        let data = logits
            .iter()
            .enumerate()
            .map(|(i, &logit)| TokenCandidate {
                id: i as TokenId,
                logit,
                p: 0.0,
            })
            .collect();
        Ok(Self {
            data,
            sorted: false,
        })
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_slice(&self) -> &[TokenCandidate] {
        &self.data
    }

    /// Whether the list is known to be sorted by descending logit.
    pub fn is_sorted(&self) -> bool {
        self.sorted
    }

    pub fn logit_of(&self, id: TokenId) -> Option<f32> {
        self.data.iter().find(|c| c.id == id).map(|c| c.logit)
    }

    /// Sort by descending logit.
    pub fn sort_desc(&mut self) {
        if !self.sorted {
            self.data
                .sort_by(|a, b| b.logit.partial_cmp(&a.logit).unwrap_or(std::cmp::Ordering::Equal));
            self.sorted = true;
        }
    }

    /// Sort by descending logit and fill `p` with normalized probabilities.
    pub fn softmax(&mut self) {
        self.sort_desc();
        let Some(max_logit) = self.data.first().map(|c| c.logit) else {
            return;
        };
        let mut sum = 0.0;
        for c in &mut self.data {
            c.p = (c.logit - max_logit).exp();
            sum += c.p;
        }
        if sum > 0.0 {
            for c in &mut self.data {
                c.p /= sum;
            }
        } else {
            let uniform = 1.0 / self.data.len() as f32;
            for c in &mut self.data {
                c.p = uniform;
            }
        }
    }

    /// Candidate with the highest logit.
    pub fn argmax(&self) -> Option<TokenId> {
        self.data
            .iter()
            .max_by(|a, b| a.logit.partial_cmp(&b.logit).unwrap_or(std::cmp::Ordering::Equal))
            .map(|c| c.id)
    }

    pub(crate) fn data_mut(&mut self) -> &mut Vec<TokenCandidate> {
        &mut self.data
    }

    pub(crate) fn truncate(&mut self, len: usize) {
        self.data.truncate(len);
    }

    pub(crate) fn mark_unsorted(&mut self) {
        self.sorted = false;
    }

    pub(crate) fn replace(&mut self, data: Vec<TokenCandidate>, sorted: bool) {
        self.data = data;
        self.sorted = sorted;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seeded_rng_reproducible() {
        let mut rng1 = SeededRng::new(42);
        let mut rng2 = SeededRng::new(42);

        for _ in 0..100 {
            let v1 = rng1.next_f32();
            let v2 = rng2.next_f32();
            assert!((v1 - v2).abs() < 1e-6);
            assert!((0.0..1.0).contains(&v1));
        }
    }

    #[test]
    fn seeded_rng_zero_seed_is_not_stuck() {
        let mut rng = SeededRng::new(0);
        let a = rng.next_f32();
        let b = rng.next_f32();
        assert_ne!(a, b);
    }

    #[test]
    fn candidates_reject_empty_and_nan() {
        assert_eq!(
            Candidates::from_logits(&[]).unwrap_err(),
            SamplingError::InvalidLogits
        );
        assert_eq!(
            Candidates::from_logits(&[1.0, f32::NAN]).unwrap_err(),
            SamplingError::InvalidLogits
        );
    }

    #[test]
    fn softmax_uniform() {
        let mut c = Candidates::from_logits(&[1.0, 1.0, 1.0]).unwrap();
        c.softmax();
        assert!((c.as_slice()[0].p - 1.0 / 3.0).abs() < 1e-5);
        let sum: f32 = c.as_slice().iter().map(|t| t.p).sum();
        assert!((sum - 1.0).abs() < 1e-5);
    }

    #[test]
    fn softmax_sorts_descending() {
        let mut c = Candidates::from_logits(&[0.5, 3.0, 1.0]).unwrap();
        c.softmax();
        let ids: Vec<_> = c.as_slice().iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![1, 2, 0]);
        assert!(c.is_sorted());
    }

    #[test]
    fn softmax_ignores_negative_infinity() {
        let mut c = Candidates::from_logits(&[2.0, f32::NEG_INFINITY]).unwrap();
        c.softmax();
        assert_eq!(c.as_slice()[0].p, 1.0);
        assert_eq!(c.as_slice()[1].p, 0.0);
    }

    #[test]
    fn argmax_picks_highest_logit() {
        let c = Candidates::from_logits(&[1.0, 10.0, 2.0, 0.5]).unwrap();
        assert_eq!(c.argmax(), Some(1));
        assert_eq!(c.logit_of(2), Some(2.0));
    }
}

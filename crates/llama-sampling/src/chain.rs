use std::collections::VecDeque;

use llama_engine::TokenId;
use serde::{Deserialize, Serialize};

use crate::samplers::{
    apply_min_p, apply_penalties, apply_temperature, apply_top_k, apply_top_p, apply_typical,
};
use crate::{Candidates, SamplingError, SamplingResult, SeededRng};

/// Seed of the distribution draw when no [`SamplerDescription::Seed`] is given.
pub const DEFAULT_SEED: u32 = 1_048_204_757;

/// Repetition penalty parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RepetitionParams {
    /// Number of most recent tokens considered. `0` disables the penalty.
    pub last_n: u32,
    pub repeat: f32,
    pub frequency: f32,
    pub presence: f32,
    pub penalize_linefeed: bool,
    pub penalize_eos: bool,
}

impl Default for RepetitionParams {
    fn default() -> Self {
        Self {
            last_n: 64,
            repeat: 1.0,
            frequency: 0.0,
            presence: 0.0,
            penalize_linefeed: true,
            penalize_eos: true,
        }
    }
}

impl RepetitionParams {
    pub fn is_disabled(&self) -> bool {
        self.last_n == 0
            || ((self.repeat - 1.0).abs() < f32::EPSILON
                && self.frequency == 0.0
                && self.presence == 0.0)
    }
}

/// One step of a sampler chain, as configured by the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SamplerDescription {
    /// Seeds the final distribution draw. Position in the chain is irrelevant.
    Seed { seed: u32 },
    TopK { k: u32 },
    TopP { p: f32 },
    MinP { p: f32 },
    TypicalP { p: f32 },
    Temperature { temperature: f32 },
    Repetition(RepetitionParams),
}

/// Discriminant of a [`SamplerDescription`], for lookups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SamplerKind {
    Seed,
    TopK,
    TopP,
    MinP,
    TypicalP,
    Temperature,
    Repetition,
}

impl SamplerDescription {
    pub fn kind(&self) -> SamplerKind {
        match self {
            SamplerDescription::Seed { .. } => SamplerKind::Seed,
            SamplerDescription::TopK { .. } => SamplerKind::TopK,
            SamplerDescription::TopP { .. } => SamplerKind::TopP,
            SamplerDescription::MinP { .. } => SamplerKind::MinP,
            SamplerDescription::TypicalP { .. } => SamplerKind::TypicalP,
            SamplerDescription::Temperature { .. } => SamplerKind::Temperature,
            SamplerDescription::Repetition(_) => SamplerKind::Repetition,
        }
    }

    /// Reject parameters outside their meaningful range.
    pub fn validate(&self) -> SamplingResult<()> {
        let in_unit = |name: &str, p: f32| {
            if (0.0..=1.0).contains(&p) {
                Ok(())
            } else {
                Err(SamplingError::InvalidParameter(format!(
                    "{} must be within [0, 1], got {}",
                    name, p
                )))
            }
        };
        match self {
            SamplerDescription::TopP { p } => in_unit("top_p", *p),
            SamplerDescription::MinP { p } => in_unit("min_p", *p),
            SamplerDescription::TypicalP { p } => in_unit("typical_p", *p),
            SamplerDescription::Temperature { temperature } if !temperature.is_finite() => Err(
                SamplingError::InvalidParameter(format!("temperature {} is not finite", temperature)),
            ),
            SamplerDescription::Repetition(params) if params.repeat <= 0.0 => {
                Err(SamplingError::InvalidParameter(format!(
                    "repeat penalty must be positive, got {}",
                    params.repeat
                )))
            }
            _ => Ok(()),
        }
    }
}

/// Ordered list of candidate transforms followed by softmax and a seeded draw.
///
/// Transforms run in the order they were given. A chain with no transforms
/// (seed only, or nothing at all) picks the argmax.
#[derive(Debug, Clone)]
pub struct SamplerChain {
    descriptions: Vec<SamplerDescription>,
    seed: u32,
    rng: SeededRng,
    history: VecDeque<TokenId>,
    history_cap: usize,
    eos_token: Option<TokenId>,
    linefeed_token: Option<TokenId>,
}

impl SamplerChain {
    /// Build a chain, validating every description.
    pub fn new(descriptions: Vec<SamplerDescription>) -> SamplingResult<Self> {
        for description in &descriptions {
            description.validate()?;
        }
        let seed = descriptions
            .iter()
            .rev()
            .find_map(|d| match d {
                SamplerDescription::Seed { seed } => Some(*seed),
                _ => None,
            })
            .unwrap_or(DEFAULT_SEED);
        let history_cap = descriptions
            .iter()
            .filter_map(|d| match d {
                SamplerDescription::Repetition(params) => Some(params.last_n as usize),
                _ => None,
            })
            .max()
            .unwrap_or(0);

        Ok(Self {
            descriptions,
            seed,
            rng: SeededRng::new(seed as u64),
            history: VecDeque::with_capacity(history_cap),
            history_cap,
            eos_token: None,
            linefeed_token: None,
        })
    }

    /// Greedy chain.
    pub fn greedy() -> Self {
        Self {
            descriptions: Vec::new(),
            seed: DEFAULT_SEED,
            rng: SeededRng::new(DEFAULT_SEED as u64),
            history: VecDeque::new(),
            history_cap: 0,
            eos_token: None,
            linefeed_token: None,
        }
    }

    /// Tokens the repetition penalty can be told to spare.
    pub fn with_special_tokens(
        mut self,
        eos_token: Option<TokenId>,
        linefeed_token: Option<TokenId>,
    ) -> Self {
        self.eos_token = eos_token;
        self.linefeed_token = linefeed_token;
        self
    }

    pub fn descriptions(&self) -> &[SamplerDescription] {
        &self.descriptions
    }

    pub fn has(&self, kind: SamplerKind) -> bool {
        self.descriptions.iter().any(|d| d.kind() == kind)
    }

    pub fn seed(&self) -> u32 {
        self.seed
    }

    /// True when selection is a plain argmax.
    pub fn is_greedy(&self) -> bool {
        self.descriptions
            .iter()
            .all(|d| d.kind() == SamplerKind::Seed)
    }

    /// Apply every transform in order. Does not normalize or select.
    pub fn apply(&self, candidates: &mut Candidates) {
        let history: Vec<TokenId> = self.history.iter().copied().collect();
        for description in &self.descriptions {
            match description {
                SamplerDescription::Seed { .. } => {}
                SamplerDescription::TopK { k } => apply_top_k(candidates, *k),
                SamplerDescription::TopP { p } => apply_top_p(candidates, *p),
                SamplerDescription::MinP { p } => apply_min_p(candidates, *p),
                SamplerDescription::TypicalP { p } => apply_typical(candidates, *p),
                SamplerDescription::Temperature { temperature } => {
                    apply_temperature(candidates, *temperature)
                }
                SamplerDescription::Repetition(params) => apply_penalties(
                    candidates,
                    &history,
                    params,
                    self.eos_token,
                    self.linefeed_token,
                ),
            }
        }
    }

    /// Select a token from raw logits.
    pub fn sample(&mut self, logits: &[f32]) -> SamplingResult<TokenId> {
        let mut candidates = Candidates::from_logits(logits)?;
        if self.is_greedy() {
            return candidates.argmax().ok_or(SamplingError::NoValidTokens);
        }
        self.apply(&mut candidates);
        candidates.softmax();
        self.draw(&candidates)
    }

    fn draw(&mut self, candidates: &Candidates) -> SamplingResult<TokenId> {
        let r = self.rng.next_f32();
        let mut cumsum = 0.0;
        for c in candidates.as_slice() {
            cumsum += c.p;
            if r < cumsum {
                return Ok(c.id);
            }
        }

        // Fallback to last token with nonzero probability
        candidates
            .as_slice()
            .iter()
            .rev()
            .find(|c| c.p > 0.0)
            .map(|c| c.id)
            .ok_or(SamplingError::NoValidTokens)
    }

    /// Record a selected token for the repetition window.
    pub fn accept(&mut self, token: TokenId) {
        if self.history_cap == 0 {
            return;
        }
        if self.history.len() == self.history_cap {
            self.history.pop_front();
        }
        self.history.push_back(token);
    }

    /// Forget history and restart the RNG from the seed.
    pub fn reset(&mut self) {
        self.history.clear();
        self.rng = SeededRng::new(self.seed as u64);
    }
}

impl Default for SamplerChain {
    fn default() -> Self {
        Self::greedy()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_chain_is_greedy() {
        let mut chain = SamplerChain::new(Vec::new()).unwrap();
        assert!(chain.is_greedy());
        assert_eq!(chain.sample(&[1.0, 10.0, 2.0, 0.5]).unwrap(), 1);
    }

    #[test]
    fn seed_only_chain_is_greedy() {
        let mut chain = SamplerChain::new(vec![SamplerDescription::Seed { seed: 7 }]).unwrap();
        assert!(chain.is_greedy());
        assert_eq!(chain.seed(), 7);
        assert_eq!(chain.sample(&[3.0, 1.0]).unwrap(), 0);
    }

    #[test]
    fn default_seed_applies_without_description() {
        let chain = SamplerChain::new(vec![SamplerDescription::TopK { k: 5 }]).unwrap();
        assert_eq!(chain.seed(), DEFAULT_SEED);
    }

    #[test]
    fn invalid_top_p_rejected() {
        let err = SamplerChain::new(vec![SamplerDescription::TopP { p: 1.5 }]).unwrap_err();
        assert!(matches!(err, SamplingError::InvalidParameter(_)));
    }

    #[test]
    fn has_reports_configured_kinds() {
        let chain = SamplerChain::new(vec![
            SamplerDescription::TopK { k: 40 },
            SamplerDescription::Temperature { temperature: 0.8 },
        ])
        .unwrap();
        assert!(chain.has(SamplerKind::TopK));
        assert!(chain.has(SamplerKind::Temperature));
        assert!(!chain.has(SamplerKind::MinP));
    }

    #[test]
    fn order_is_significant() {
        // temperature before min_p widens the logit gap that min_p measures
        let logits = [2.0, 1.9];
        let sharpened_first = SamplerChain::new(vec![
            SamplerDescription::Temperature { temperature: 0.1 },
            SamplerDescription::MinP { p: 0.5 },
        ])
        .unwrap();
        let mut c = Candidates::from_logits(&logits).unwrap();
        sharpened_first.apply(&mut c);
        assert_eq!(c.len(), 1);

        let filtered_first = SamplerChain::new(vec![
            SamplerDescription::MinP { p: 0.5 },
            SamplerDescription::Temperature { temperature: 0.1 },
        ])
        .unwrap();
        let mut c = Candidates::from_logits(&logits).unwrap();
        filtered_first.apply(&mut c);
        assert_eq!(c.len(), 2);
    }

    #[test]
    fn accept_bounds_history_to_window() {
        let mut chain = SamplerChain::new(vec![SamplerDescription::Repetition(RepetitionParams {
            last_n: 2,
            repeat: 1.5,
            ..RepetitionParams::default()
        })])
        .unwrap();
        chain.accept(1);
        chain.accept(2);
        chain.accept(3);
        assert_eq!(chain.history.iter().copied().collect::<Vec<_>>(), vec![2, 3]);

        chain.reset();
        assert!(chain.history.is_empty());
    }

    #[test]
    fn reset_restarts_rng_sequence() {
        let logits = [0.25, 0.25, 0.25, 0.25];
        let mut chain = SamplerChain::new(vec![SamplerDescription::Temperature {
            temperature: 1.0,
        }])
        .unwrap();
        let first: Vec<_> = (0..8).map(|_| chain.sample(&logits).unwrap()).collect();
        chain.reset();
        let second: Vec<_> = (0..8).map(|_| chain.sample(&logits).unwrap()).collect();
        assert_eq!(first, second);
    }

    #[test]
    fn description_serde_is_tagged() {
        let json = r#"[{"kind":"top_k","k":40},{"kind":"temperature","temperature":0.7},
                       {"kind":"repetition","repeat":1.1}]"#;
        let descriptions: Vec<SamplerDescription> = serde_json::from_str(json).unwrap();
        assert_eq!(descriptions[0], SamplerDescription::TopK { k: 40 });
        match &descriptions[2] {
            SamplerDescription::Repetition(params) => {
                assert_eq!(params.repeat, 1.1);
                assert_eq!(params.last_n, 64);
            }
            other => panic!("unexpected description {:?}", other),
        }
    }
}

//! Individual candidate transforms. Each one narrows or reweights a
//! [`Candidates`] list in place and keeps at least one candidate.

use std::collections::HashMap;

use llama_engine::TokenId;

use crate::chain::RepetitionParams;
use crate::Candidates;

/// Keep the `k` highest-logit candidates. `k == 0` disables the filter.
pub fn apply_top_k(candidates: &mut Candidates, k: u32) {
    if k == 0 || candidates.is_empty() {
        return;
    }
    let k = (k as usize).min(candidates.len());
    candidates.sort_desc();
    candidates.truncate(k);
}

/// Keep the smallest prefix whose cumulative probability reaches `p`.
pub fn apply_top_p(candidates: &mut Candidates, p: f32) {
    if p >= 1.0 || candidates.is_empty() {
        return;
    }
    candidates.softmax();

    let mut cumsum = 0.0;
    let mut keep = candidates.len();
    for (idx, c) in candidates.as_slice().iter().enumerate() {
        cumsum += c.p;
        if cumsum >= p {
            keep = idx + 1;
            break;
        }
    }
    candidates.truncate(keep.max(1));
}

/// Drop candidates whose probability is below `p` times the top probability.
///
/// Works on logits: `p_i >= p * p_max` is `logit_i >= logit_max + ln(p)`.
pub fn apply_min_p(candidates: &mut Candidates, p: f32) {
    if p <= 0.0 || candidates.is_empty() {
        return;
    }
    let max_logit = candidates
        .as_slice()
        .iter()
        .map(|c| c.logit)
        .fold(f32::NEG_INFINITY, f32::max);
    let threshold = max_logit + p.ln();

    let sorted = candidates.is_sorted();
    let kept: Vec<_> = candidates
        .as_slice()
        .iter()
        .copied()
        .filter(|c| c.logit >= threshold)
        .collect();
    if kept.is_empty() {
        candidates.sort_desc();
        candidates.truncate(1);
    } else {
        candidates.replace(kept, sorted);
    }
}

/// Locally typical sampling: keep the tokens whose surprise is closest to the
/// distribution's entropy until their mass reaches `p`.
pub fn apply_typical(candidates: &mut Candidates, p: f32) {
    if p >= 1.0 || candidates.is_empty() {
        return;
    }
    candidates.softmax();

    let entropy: f32 = candidates
        .as_slice()
        .iter()
        .filter(|c| c.p > 0.0)
        .map(|c| -c.p * c.p.ln())
        .sum();

    let mut ranked: Vec<(usize, f32)> = candidates
        .as_slice()
        .iter()
        .enumerate()
        .map(|(i, c)| {
            let surprise = if c.p > 0.0 { -c.p.ln() } else { f32::INFINITY };
            (i, (surprise - entropy).abs())
        })
        .collect();
    ranked.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));

    let mut cumsum = 0.0;
    let mut keep = ranked.len();
    for (rank, &(idx, _)) in ranked.iter().enumerate() {
        cumsum += candidates.as_slice()[idx].p;
        if cumsum > p {
            keep = rank + 1;
            break;
        }
    }

    let data: Vec<_> = ranked[..keep]
        .iter()
        .map(|&(idx, _)| candidates.as_slice()[idx])
        .collect();
    candidates.replace(data, false);
}

/// Divide logits by `temperature`. A non-positive temperature keeps only the
/// highest-logit candidate selectable.
pub fn apply_temperature(candidates: &mut Candidates, temperature: f32) {
    if candidates.is_empty() {
        return;
    }
    if temperature <= 0.0 {
        let best = candidates.argmax();
        for c in candidates.data_mut().iter_mut() {
            if Some(c.id) != best {
                c.logit = f32::NEG_INFINITY;
            }
        }
        return;
    }
    if (temperature - 1.0).abs() > 1e-6 {
        for c in candidates.data_mut().iter_mut() {
            c.logit /= temperature;
        }
    }
}

/// Repetition, frequency and presence penalties over the recent `history`.
///
/// Positive logits of repeated tokens are divided by `repeat`, negative ones
/// multiplied, so a repeated token always becomes less likely.
pub fn apply_penalties(
    candidates: &mut Candidates,
    history: &[TokenId],
    params: &RepetitionParams,
    eos_token: Option<TokenId>,
    linefeed_token: Option<TokenId>,
) {
    if params.is_disabled() || history.is_empty() || candidates.is_empty() {
        return;
    }

    let start = history.len().saturating_sub(params.last_n as usize);
    let mut counts: HashMap<TokenId, u32> = HashMap::new();
    for &token in &history[start..] {
        *counts.entry(token).or_insert(0) += 1;
    }

    let saved_linefeed = linefeed_token
        .filter(|_| !params.penalize_linefeed)
        .and_then(|t| candidates.logit_of(t).map(|l| (t, l)));
    let saved_eos = eos_token
        .filter(|_| !params.penalize_eos)
        .and_then(|t| candidates.logit_of(t).map(|l| (t, l)));

    for c in candidates.data_mut().iter_mut() {
        let Some(&count) = counts.get(&c.id) else {
            continue;
        };
        if c.logit <= 0.0 {
            c.logit *= params.repeat;
        } else {
            c.logit /= params.repeat;
        }
        c.logit -= count as f32 * params.frequency + params.presence;
    }

    for (token, logit) in saved_linefeed.into_iter().chain(saved_eos) {
        if let Some(c) = candidates.data_mut().iter_mut().find(|c| c.id == token) {
            c.logit = logit;
        }
    }
    candidates.mark_unsorted();
}

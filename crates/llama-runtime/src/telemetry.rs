//! Per-processor timing of prefill and decode.
//!
//! A processor's worker thread owns one [`InferenceTimer`] per input. The
//! timer starts when the input reaches the worker, is marked when the prefill
//! finishes and on every decoded token, and is finished when the sequence
//! ends. Every mark is forwarded to the processor's [`TelemetryHook`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

/// What kind of work a timer measured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SequenceKind {
    /// Prompt prefill followed by token generation.
    Text,
    /// One batched embedding call.
    Embedding,
}

/// Summary of one measured sequence.
#[derive(Debug, Clone, PartialEq)]
pub struct InferenceMetrics {
    pub processor: u64,
    pub kind: SequenceKind,
    /// Name of the compute backend that ran the sequence.
    pub backend: String,
    /// Start to end of prefill, in milliseconds.
    pub ttft_ms: f64,
    /// Decode throughput; prefill time excluded.
    pub tokens_per_sec: f64,
    pub prompt_tokens: usize,
    pub generated_tokens: usize,
    pub total_time_ms: f64,
}

/// Receives timing events from processor workers.
///
/// Every method defaults to a no-op. Calls arrive on worker threads, one
/// thread per processor, so a hook shared between processors sees
/// interleaved events and must tell them apart by `processor`.
pub trait TelemetryHook: Send + Sync {
    fn on_prefill_complete(&self, _processor: u64, _ttft_ms: f64) {}

    fn on_token_generated(&self, _processor: u64, _token_idx: usize, _elapsed_ms: f64) {}

    fn on_generation_complete(&self, _metrics: &InferenceMetrics) {}
}

/// Hook that ignores everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopTelemetry;

impl TelemetryHook for NoopTelemetry {}

/// Totals kept by [`LogTelemetry`].
#[derive(Debug, Clone, Default, PartialEq)]
struct Report {
    last: Option<InferenceMetrics>,
    completed: usize,
    generated_by: HashMap<u64, usize>,
}

/// Hook that logs each finished sequence through `tracing` and keeps
/// running totals. Clones share the same totals.
#[derive(Debug, Clone, Default)]
pub struct LogTelemetry {
    report: Arc<Mutex<Report>>,
}

impl LogTelemetry {
    pub fn new() -> Self {
        Self::default()
    }

    fn report(&self) -> MutexGuard<'_, Report> {
        self.report.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn last_metrics(&self) -> Option<InferenceMetrics> {
        self.report().last.clone()
    }

    /// Sequences finished so far, across every processor.
    pub fn completed(&self) -> usize {
        self.report().completed
    }

    /// Tokens `processor` generated over all of its finished sequences.
    pub fn generated_by(&self, processor: u64) -> usize {
        self.report()
            .generated_by
            .get(&processor)
            .copied()
            .unwrap_or(0)
    }
}

impl TelemetryHook for LogTelemetry {
    fn on_generation_complete(&self, metrics: &InferenceMetrics) {
        tracing::debug!(
            processor = metrics.processor,
            kind = ?metrics.kind,
            backend = %metrics.backend,
            ttft_ms = metrics.ttft_ms,
            tokens_per_sec = metrics.tokens_per_sec,
            generated = metrics.generated_tokens,
            "sequence complete"
        );
        let mut report = self.report();
        *report.generated_by.entry(metrics.processor).or_default() += metrics.generated_tokens;
        report.completed += 1;
        report.last = Some(metrics.clone());
    }
}

/// Stopwatch for one sequence of one processor.
pub struct InferenceTimer {
    processor: u64,
    kind: SequenceKind,
    backend: String,
    prompt_tokens: usize,
    start: Instant,
    prefill_end: Option<Instant>,
    token_count: usize,
    hook: Arc<dyn TelemetryHook>,
}

impl InferenceTimer {
    pub fn new(
        processor: u64,
        kind: SequenceKind,
        backend: impl Into<String>,
        prompt_tokens: usize,
        hook: Arc<dyn TelemetryHook>,
    ) -> Self {
        Self {
            processor,
            kind,
            backend: backend.into(),
            prompt_tokens,
            start: Instant::now(),
            prefill_end: None,
            token_count: 0,
            hook,
        }
    }

    fn elapsed_ms(since: Instant, now: Instant) -> f64 {
        now.duration_since(since).as_secs_f64() * 1000.0
    }

    pub fn mark_prefill_complete(&mut self) {
        let now = Instant::now();
        self.prefill_end = Some(now);
        self.hook
            .on_prefill_complete(self.processor, Self::elapsed_ms(self.start, now));
    }

    pub fn mark_token(&mut self) {
        self.token_count += 1;
        let elapsed = Self::elapsed_ms(self.start, Instant::now());
        self.hook
            .on_token_generated(self.processor, self.token_count, elapsed);
    }

    pub fn generated_tokens(&self) -> usize {
        self.token_count
    }

    /// Stop the clock and report the sequence to the hook.
    pub fn finish(self) -> InferenceMetrics {
        let now = Instant::now();
        let total_time_ms = Self::elapsed_ms(self.start, now);
        let ttft_ms = self
            .prefill_end
            .map(|end| Self::elapsed_ms(self.start, end))
            .unwrap_or(0.0);
        let decode_ms = total_time_ms - ttft_ms;
        let tokens_per_sec = if decode_ms > 0.0 && self.token_count > 0 {
            self.token_count as f64 * 1000.0 / decode_ms
        } else {
            0.0
        };

        let metrics = InferenceMetrics {
            processor: self.processor,
            kind: self.kind,
            backend: self.backend,
            ttft_ms,
            tokens_per_sec,
            prompt_tokens: self.prompt_tokens,
            generated_tokens: self.token_count,
            total_time_ms,
        };
        self.hook.on_generation_complete(&metrics);
        metrics
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metrics(processor: u64, generated_tokens: usize) -> InferenceMetrics {
        InferenceMetrics {
            processor,
            kind: SequenceKind::Text,
            backend: "reference".to_string(),
            ttft_ms: 12.5,
            tokens_per_sec: 80.0,
            prompt_tokens: 4,
            generated_tokens,
            total_time_ms: 112.5,
        }
    }

    #[derive(Default)]
    struct Marks(Mutex<Vec<(u64, usize)>>);

    impl TelemetryHook for Marks {
        fn on_token_generated(&self, processor: u64, token_idx: usize, _elapsed_ms: f64) {
            self.0.lock().unwrap().push((processor, token_idx));
        }
    }

    #[test]
    fn log_telemetry_totals_per_processor() {
        let hook = LogTelemetry::new();
        assert!(hook.last_metrics().is_none());

        hook.on_generation_complete(&metrics(1, 8));
        hook.on_generation_complete(&metrics(2, 3));
        hook.on_generation_complete(&metrics(1, 2));

        assert_eq!(hook.completed(), 3);
        assert_eq!(hook.generated_by(1), 10);
        assert_eq!(hook.generated_by(2), 3);
        assert_eq!(hook.generated_by(9), 0);
        assert_eq!(hook.last_metrics().unwrap().processor, 1);
    }

    #[test]
    fn timer_reports_through_shared_hook() {
        let log = LogTelemetry::new();
        let mut timer = InferenceTimer::new(7, SequenceKind::Text, "reference", 3, Arc::new(log.clone()));
        timer.mark_prefill_complete();
        timer.mark_token();
        timer.mark_token();
        assert_eq!(timer.generated_tokens(), 2);

        let finished = timer.finish();
        assert_eq!(finished.processor, 7);
        assert_eq!(finished.prompt_tokens, 3);
        assert!(finished.total_time_ms >= finished.ttft_ms);
        assert_eq!(log.last_metrics(), Some(finished));
    }

    #[test]
    fn token_marks_carry_the_processor() {
        let marks = Arc::new(Marks::default());
        let mut timer = InferenceTimer::new(4, SequenceKind::Text, "reference", 1, marks.clone());
        timer.mark_token();
        timer.mark_token();
        assert_eq!(*marks.0.lock().unwrap(), vec![(4, 1), (4, 2)]);
    }

    #[test]
    fn embedding_batch_has_no_decode_rate() {
        let mut timer = InferenceTimer::new(2, SequenceKind::Embedding, "reference", 9, Arc::new(NoopTelemetry));
        timer.mark_prefill_complete();
        let finished = timer.finish();
        assert_eq!(finished.kind, SequenceKind::Embedding);
        assert_eq!(finished.generated_tokens, 0);
        assert_eq!(finished.tokens_per_sec, 0.0);
    }
}

//! Worker thread of a text processor. Owns the compute context.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use llama_engine::{Batch, ComputeContext, ContextParams, LlamaError, ModelWeights, SeqId, TokenId};
use llama_runtime::{InferenceTimer, SequenceKind, TelemetryHook};
use llama_sampling::SamplerChain;
use tracing::{debug, warn};

use super::text::{TextCore, TextEvent, TextWork};
use super::{CachingMode, Command, FinishState, ProcessorLifecycle, ReleaseGuard};
use crate::config::DecodeBehavior;
use crate::error::InitFailure;

const SEQ: SeqId = 0;

pub(crate) struct TextSpawn {
    pub core: Arc<TextCore>,
    pub weights: Arc<dyn ModelWeights>,
    pub params: ContextParams,
    pub chain: SamplerChain,
    pub commands: Receiver<Command<TextWork>>,
    pub events: Sender<TextEvent>,
    pub release: ReleaseGuard,
    pub backend: String,
    pub telemetry: Option<Arc<dyn TelemetryHook>>,
}

pub(crate) fn run(spawn: TextSpawn) {
    let TextSpawn {
        core,
        weights,
        params,
        chain,
        commands,
        events,
        release,
        backend,
        telemetry,
    } = spawn;

    let ctx = match weights.create_context(&params) {
        Ok(ctx) => ctx,
        Err(e) => {
            let failure = InitFailure::from(e);
            warn!(processor = core.id(), error = %failure, "context creation failed");
            drop(weights);
            core.signals.initialize.complete();
            core.finish_failed_initialize();
            let _ = events.send(TextEvent::InitializeFailed(failure));
            drop(release);
            return;
        }
    };
    debug!(
        processor = core.id(),
        context = params.context_length,
        batch = params.batch_size,
        "text context created"
    );
    core.signals.initialize.complete();
    core.transition(ProcessorLifecycle::Initializing, ProcessorLifecycle::Idle);
    let _ = events.send(TextEvent::Initialized);

    let mut worker = TextWorker {
        core: core.clone(),
        weights,
        ctx,
        chain,
        events: events.clone(),
        backend,
        telemetry,
        timer: None,
        batch_size: params.batch_size.max(1) as usize,
        reserved: params.context_length,
        cached: Vec::new(),
        pinned: 0,
        finish: FinishState::Finished,
        last_logits: 0,
        epoch: 0,
    };

    while let Ok(command) = commands.recv() {
        if core.signals.destroy.is_requested() {
            break;
        }
        match command {
            Command::Work(work) => {
                core.transition(ProcessorLifecycle::Idle, ProcessorLifecycle::Operating);
                worker.handle(work);
                core.transition(ProcessorLifecycle::Operating, ProcessorLifecycle::Idle);
            }
            Command::Destroy => break,
        }
    }

    // Context before weights: the context borrows the model's memory.
    drop(worker);
    core.signals.destroy.complete();
    core.set_lifecycle(ProcessorLifecycle::Unregistered);
    let _ = events.send(TextEvent::Destroyed);
    debug!(processor = core.id(), "text worker exited");
    drop(release);
}

struct TextWorker {
    core: Arc<TextCore>,
    ctx: Box<dyn ComputeContext>,
    weights: Arc<dyn ModelWeights>,
    chain: SamplerChain,
    events: Sender<TextEvent>,
    backend: String,
    telemetry: Option<Arc<dyn TelemetryHook>>,
    timer: Option<InferenceTimer>,
    batch_size: usize,
    reserved: u32,
    /// Tokens occupying KV positions `0..cached.len()`.
    cached: Vec<TokenId>,
    pinned: u32,
    finish: FinishState,
    /// Batch index of the logits the next sample reads.
    last_logits: usize,
    epoch: u64,
}

impl TextWorker {
    fn cursor(&self) -> u32 {
        self.cached.len() as u32
    }

    fn handle(&mut self, work: TextWork) {
        match work {
            TextWork::Input {
                tokens,
                kv_locked,
                caching,
                epoch,
            } => self.process_input(tokens, kv_locked, caching, epoch),
            TextWork::Decode(behavior) => self.decode(behavior),
            TextWork::ClearResponse { epoch } => self.clear_response(epoch),
        }
    }

    fn process_input(
        &mut self,
        tokens: Vec<TokenId>,
        kv_locked: bool,
        caching: CachingMode,
        epoch: u64,
    ) {
        if self.core.is_superseded(epoch) {
            debug!(processor = self.core.id(), "input superseded before prefill");
            return;
        }
        self.epoch = epoch;
        self.chain.reset();
        let id = self.core.id();
        self.timer = self.telemetry.clone().map(|hook| {
            InferenceTimer::new(id, SequenceKind::Text, self.backend.clone(), tokens.len(), hook)
        });

        let (keep, fresh) = match caching {
            CachingMode::Disabled => (0, &tokens[..]),
            CachingMode::KvLock => (self.pinned as usize, &tokens[..]),
            CachingMode::AutoLogitStore => {
                let common = self
                    .cached
                    .iter()
                    .zip(&tokens)
                    .take_while(|(cached, token)| cached == token)
                    .count();
                // The last prompt token always goes through to produce logits.
                let keep = common.min(tokens.len() - 1);
                (keep, &tokens[keep..])
            }
        };
        if caching != CachingMode::KvLock {
            self.pinned = 0;
        }
        self.truncate_cache(keep);

        match self.prefill(fresh) {
            Ok(false) => {
                // The newer input completes the signal.
                self.timer = None;
                debug!(processor = self.core.id(), cursor = self.cursor(), "prefill superseded");
            }
            Ok(true) => {
                if kv_locked {
                    self.pinned = self.cursor();
                }
                self.finish = FinishState::Continue;
                if let Some(timer) = self.timer.as_mut() {
                    timer.mark_prefill_complete();
                }
                debug!(
                    processor = self.core.id(),
                    tokens = fresh.len(),
                    reused = keep,
                    cursor = self.cursor(),
                    "prompt prefilled"
                );
                self.core.signals.input.complete();
                let _ = self.events.send(TextEvent::InputProcessed {
                    batch_len: fresh.len(),
                    kv_locked,
                    cursor: self.cursor(),
                    pinned: self.pinned,
                    epoch,
                });
            }
            Err(e) => {
                self.core.signals.input.complete();
                self.fail(e.to_string());
            }
        }
    }

    /// Feed `tokens` in batches. `false` if a newer input arrived first.
    fn prefill(&mut self, tokens: &[TokenId]) -> Result<bool, LlamaError> {
        let chunk_count = tokens.len().div_ceil(self.batch_size);
        for (i, chunk) in tokens.chunks(self.batch_size).enumerate() {
            if self.core.is_superseded(self.epoch) {
                return Ok(false);
            }
            let start = self.cursor();
            let mut batch = Batch::with_capacity(chunk.len());
            for (j, &token) in chunk.iter().enumerate() {
                let output = i + 1 == chunk_count && j + 1 == chunk.len();
                batch.push(token, start + j as u32, SEQ, output);
            }
            self.ctx.decode(&batch)?;
            self.cached.extend_from_slice(chunk);
            self.last_logits = chunk.len() - 1;
        }
        Ok(!self.core.is_superseded(self.epoch))
    }

    fn should_stop(&self) -> bool {
        self.core.signals.destroy.is_requested()
            || !self.core.is_running()
            || self.core.is_superseded(self.epoch)
    }

    fn decode(&mut self, behavior: DecodeBehavior) {
        let budget = behavior.token_budget.max(1);
        let mut generated = 0;
        while generated < budget && self.finish == FinishState::Continue {
            if generated > 0 && behavior.halt_delay_ms > 0 {
                thread::sleep(Duration::from_millis(behavior.halt_delay_ms));
            }
            if self.should_stop() {
                break;
            }
            self.step();
            generated += 1;
            if behavior.halt_on_write {
                break;
            }
        }
        self.core.signals.decode.complete();
        let _ = self.events.send(TextEvent::DecodeDone { generated });
    }

    /// Sample one token and feed it back.
    fn step(&mut self) {
        let sampled = match self.ctx.logits(self.last_logits) {
            Ok(logits) => self.chain.sample(logits).map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        };
        let token = match sampled {
            Ok(token) => token,
            Err(reason) => {
                self.fail(reason);
                return;
            }
        };
        self.chain.accept(token);

        let cursor = self.cursor();
        if token == 0 || self.weights.is_end_of_generation(token) {
            self.finish = FinishState::Finished;
            self.clear_cache(true);
        } else if cursor >= self.reserved {
            self.finish = FinishState::TokenLimitReached;
            self.clear_cache(false);
        } else {
            let batch = Batch::for_sequence(&[token], cursor, SEQ);
            match self.ctx.decode(&batch) {
                Ok(()) => {
                    self.cached.push(token);
                    self.last_logits = 0;
                }
                Err(e) => {
                    self.fail(e.to_string());
                    return;
                }
            }
        }

        if let Some(timer) = self.timer.as_mut() {
            timer.mark_token();
        }
        let _ = self.events.send(TextEvent::TokenGenerated {
            token,
            cursor: self.cursor(),
            pinned: self.pinned,
            finish: self.finish,
            epoch: self.epoch,
        });
        if self.finish != FinishState::Continue {
            self.finish_timer();
        }
    }

    fn clear_response(&mut self, epoch: u64) {
        if self.core.is_superseded(epoch) {
            return;
        }
        self.clear_cache(true);
        self.finish = FinishState::Finished;
        self.timer = None;
        self.core.signals.input.complete();
        let _ = self.events.send(TextEvent::ResponseCleared {
            cursor: self.cursor(),
            pinned: self.pinned,
            epoch,
        });
    }

    fn fail(&mut self, reason: String) {
        warn!(processor = self.core.id(), %reason, "sequence failed");
        self.finish = FinishState::Failed;
        self.clear_cache(false);
        self.finish_timer();
        let _ = self.events.send(TextEvent::Failed {
            reason,
            epoch: self.epoch,
        });
    }

    fn finish_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            let metrics = timer.finish();
            debug!(
                processor = self.core.id(),
                ttft_ms = metrics.ttft_ms,
                tokens_per_sec = metrics.tokens_per_sec,
                "sequence timing"
            );
        }
    }

    /// Keep KV positions `0..keep`.
    fn truncate_cache(&mut self, keep: usize) {
        if keep == 0 {
            self.ctx.kv_clear();
        } else {
            self.ctx.kv_remove(SEQ, keep as u32, None);
        }
        self.cached.truncate(keep);
    }

    fn clear_cache(&mut self, keep_pinned: bool) {
        if keep_pinned && self.pinned > 0 {
            self.truncate_cache(self.pinned as usize);
        } else {
            self.pinned = 0;
            self.truncate_cache(0);
        }
    }
}

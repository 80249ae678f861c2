//! Worker thread of an embedder.

use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender};
use llama_engine::{Batch, ComputeContext, ContextParams, LlamaError, ModelWeights, SeqId, TokenId};
use llama_runtime::{InferenceTimer, SequenceKind, TelemetryHook};
use tracing::{debug, warn};

use super::embedder::{EmbedderCore, EmbedderEvent, EmbedderWork};
use super::{Command, ProcessorLifecycle, ReleaseGuard};
use crate::error::InitFailure;

pub(crate) struct EmbedderSpawn {
    pub core: Arc<EmbedderCore>,
    pub weights: Arc<dyn ModelWeights>,
    pub params: ContextParams,
    pub commands: Receiver<Command<EmbedderWork>>,
    pub events: Sender<EmbedderEvent>,
    pub release: ReleaseGuard,
    pub backend: String,
    pub telemetry: Option<Arc<dyn TelemetryHook>>,
}

pub(crate) fn run(spawn: EmbedderSpawn) {
    let EmbedderSpawn {
        core,
        weights,
        params,
        commands,
        events,
        release,
        backend,
        telemetry,
    } = spawn;

    let mut ctx = match weights.create_context(&params) {
        Ok(ctx) => ctx,
        Err(e) => {
            let failure = InitFailure::from(e);
            warn!(processor = core.id(), error = %failure, "embedding context creation failed");
            drop(weights);
            core.signals.initialize.complete();
            core.finish_failed_initialize();
            let _ = events.send(EmbedderEvent::InitializeFailed(failure));
            drop(release);
            return;
        }
    };
    core.signals.initialize.complete();
    core.transition(ProcessorLifecycle::Initializing, ProcessorLifecycle::Idle);
    let _ = events.send(EmbedderEvent::Initialized);

    let metadata = weights.metadata();
    let encoder_only = metadata.has_encoder && !metadata.has_decoder;

    while let Ok(command) = commands.recv() {
        if core.signals.destroy.is_requested() {
            break;
        }
        match command {
            Command::Work(EmbedderWork::Input { sequences, epoch }) => {
                if core.is_superseded(epoch) {
                    debug!(processor = core.id(), "batch superseded before compute");
                    continue;
                }
                core.transition(ProcessorLifecycle::Idle, ProcessorLifecycle::Operating);
                let batch_len: usize = sequences.iter().map(Vec::len).sum();
                let timer = telemetry.clone().map(|hook| {
                    InferenceTimer::new(
                        core.id(),
                        SequenceKind::Embedding,
                        backend.clone(),
                        batch_len,
                        hook,
                    )
                });
                let result = embed(ctx.as_mut(), &sequences, encoder_only);
                if let Some(mut timer) = timer {
                    timer.mark_prefill_complete();
                    timer.finish();
                }
                let event = match result {
                    Ok(vectors) => {
                        debug!(
                            processor = core.id(),
                            sequences = vectors.len(),
                            tokens = batch_len,
                            "embeddings computed"
                        );
                        EmbedderEvent::Computed {
                            vectors,
                            batch_len,
                            epoch,
                        }
                    }
                    Err(e) => {
                        warn!(processor = core.id(), error = %e, "embedding failed");
                        EmbedderEvent::Failed {
                            reason: e.to_string(),
                            epoch,
                        }
                    }
                };
                // A newer batch completes the signal.
                if !core.is_superseded(epoch) {
                    core.signals.input.complete();
                    let _ = events.send(event);
                }
                core.transition(ProcessorLifecycle::Operating, ProcessorLifecycle::Idle);
            }
            Command::Destroy => break,
        }
    }

    drop(ctx);
    drop(weights);
    core.signals.destroy.complete();
    core.set_lifecycle(ProcessorLifecycle::Unregistered);
    let _ = events.send(EmbedderEvent::Destroyed);
    debug!(processor = core.id(), "embedder worker exited");
    drop(release);
}

/// All sequences go out in one batch, each under its own sequence id.
fn embed(
    ctx: &mut dyn ComputeContext,
    sequences: &[Vec<TokenId>],
    encoder_only: bool,
) -> Result<Vec<Vec<f32>>, LlamaError> {
    ctx.kv_clear();
    let mut batch = Batch::with_capacity(sequences.iter().map(Vec::len).sum());
    for (seq, tokens) in sequences.iter().enumerate() {
        for (position, &token) in tokens.iter().enumerate() {
            batch.push(token, position as u32, seq as SeqId, true);
        }
    }
    if encoder_only {
        ctx.encode(&batch)?;
    } else {
        ctx.decode(&batch)?;
    }
    (0..sequences.len())
        .map(|seq| ctx.embedding(seq as SeqId).map(<[f32]>::to_vec))
        .collect()
}

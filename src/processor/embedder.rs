//! Embedding processor: one pooled vector per input sequence.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::thread;

use crossbeam_channel::{unbounded, Receiver};
use llama_engine::TokenId;
use llama_runtime::TelemetryHook;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::embedder_worker::{self, EmbedderSpawn};
use super::{
    Attachment, Link, ProcessorCore, ProcessorLifecycle, ProcessorObserver, ProcessorStatus,
    RegisteredProcessor, ReleaseGuard,
};
use crate::client::{Client, ClientCell, EmbedderClient};
use crate::error::{InitFailure, ModelError, ModelResult, ProcessorError, ProcessorResult};
use crate::model::ModelShared;

pub(crate) type EmbedderCore = ProcessorCore<EmbedderWork, dyn EmbedderClient>;

pub(crate) enum EmbedderWork {
    Input {
        sequences: Vec<Vec<TokenId>>,
        epoch: u64,
    },
}

#[derive(Debug)]
pub(crate) enum EmbedderEvent {
    Initialized,
    InitializeFailed(InitFailure),
    Computed {
        vectors: Vec<Vec<f32>>,
        batch_len: usize,
        epoch: u64,
    },
    Failed {
        reason: String,
        epoch: u64,
    },
    Destroyed,
}

impl EmbedderEvent {
    fn is_terminal(&self) -> bool {
        matches!(self, EmbedderEvent::Destroyed | EmbedderEvent::InitializeFailed(_))
    }
}

#[derive(Default)]
struct EmbedderControl {
    events: Option<Receiver<EmbedderEvent>>,
    model: Weak<ModelShared>,
    /// Largest input one call can take: the batch size of the context.
    token_limit: u32,
    /// Computed vectors not yet handed to the client, in input order.
    pending: VecDeque<Vec<f32>>,
    total: usize,
    delivered: usize,
    last_fail: Option<InitFailure>,
    last_error: Option<String>,
}

/// Turns token sequences into L2-normalized embedding vectors.
///
/// `execute_input` computes every vector in one worker call; each `next()`
/// then hands the following vector to the client, in input order.
pub struct EmbedderProcessor {
    core: Arc<EmbedderCore>,
    control: Mutex<EmbedderControl>,
    telemetry: Option<Arc<dyn TelemetryHook>>,
    observer: Mutex<Option<Box<dyn ProcessorObserver>>>,
}

impl Default for EmbedderProcessor {
    fn default() -> Self {
        Self::new()
    }
}

impl EmbedderProcessor {
    pub fn new() -> Self {
        Self {
            core: Arc::new(ProcessorCore::new()),
            control: Mutex::new(EmbedderControl::default()),
            telemetry: None,
            observer: Mutex::new(None),
        }
    }

    /// Report the timing of every batch to `hook`. Takes effect on the next
    /// registration.
    pub fn with_telemetry(mut self, hook: Arc<dyn TelemetryHook>) -> Self {
        self.telemetry = Some(hook);
        self
    }

    pub fn set_observer(&self, observer: Box<dyn ProcessorObserver>) {
        *self.observer.lock().unwrap_or_else(PoisonError::into_inner) = Some(observer);
    }

    fn control(&self) -> MutexGuard<'_, EmbedderControl> {
        self.control.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn id(&self) -> u64 {
        self.core.id()
    }

    pub fn context_id(&self) -> Option<Uuid> {
        self.core.context_id()
    }

    pub fn reserved_context(&self) -> u32 {
        if self.core.lifecycle().is_attached() {
            self.core.reserved()
        } else {
            0
        }
    }

    pub fn lifecycle(&self) -> ProcessorLifecycle {
        self.core.lifecycle()
    }

    pub fn processor_status(&self) -> ProcessorStatus {
        self.core.status()
    }

    pub fn is_registered(&self) -> bool {
        self.core.lifecycle().is_attached()
    }

    pub fn is_running(&self) -> bool {
        self.core.is_running()
    }

    pub fn is_available(&self) -> bool {
        self.core.is_running()
            && self.core.status() == ProcessorStatus::Idle
            && self.control().pending.is_empty()
    }

    /// Vectors computed but not yet delivered.
    pub fn pending_vectors(&self) -> usize {
        self.control().pending.len()
    }

    pub fn last_fail(&self) -> Option<InitFailure> {
        self.control().last_fail.clone()
    }

    /// Reason the most recent input failed in the backend, if it did.
    pub fn last_error(&self) -> Option<String> {
        self.control().last_error.clone()
    }

    pub fn halt(&self) {
        self.core.set_running(false);
    }

    pub fn resume(&self) {
        self.core.set_running(true);
    }

    pub fn set_inference_client<C: EmbedderClient + 'static>(
        &self,
        client: &Client<C>,
    ) -> ProcessorResult<()> {
        let cell: Arc<ClientCell<dyn EmbedderClient>> = client.0.clone();
        if self.core.bind_client(cell.clone())? {
            cell.with(|c| c.on_register(self));
        }
        Ok(())
    }

    pub fn release_inference_client(&self) -> ProcessorResult<()> {
        if self.core.release_client() {
            Ok(())
        } else {
            Err(ProcessorError::MissingClient)
        }
    }

    pub fn has_client(&self) -> bool {
        self.core.client().is_some()
    }

    pub fn tokenize(&self, text: &str) -> ProcessorResult<Vec<TokenId>> {
        self.core.check_registered()?;
        if text.is_empty() {
            return Err(ProcessorError::InputEmpty);
        }
        let model = self
            .control()
            .model
            .upgrade()
            .ok_or(ProcessorError::ModelUnavailable)?;
        let weights = model.weights().ok_or(ProcessorError::ModelUnavailable)?;
        weights
            .tokenize(text, true)
            .map_err(|e| ProcessorError::TokenizationFailed(e.to_string()))
    }

    /// Compute one vector per sequence. Refused while vectors of the
    /// previous input are still undelivered.
    pub fn execute_input(&self, sequences: Vec<Vec<TokenId>>) -> ProcessorResult<()> {
        self.queue_input(sequences, false)
    }

    /// Like [`execute_input`](Self::execute_input), but undelivered vectors
    /// of the previous input are discarded, and a batch still being computed
    /// is superseded.
    pub fn execute_input_abandon(&self, sequences: Vec<Vec<TokenId>>) -> ProcessorResult<()> {
        self.queue_input(sequences, true)
    }

    pub fn execute_input_sync(&self, sequences: Vec<Vec<TokenId>>) -> ProcessorResult<()> {
        self.execute_input(sequences)?;
        let epoch = self.core.epoch();
        self.wait_for(|event| match event {
            EmbedderEvent::Computed { epoch: e, .. } | EmbedderEvent::Failed { epoch: e, .. } => {
                *e == epoch
            }
            _ => false,
        })
    }

    fn queue_input(&self, sequences: Vec<Vec<TokenId>>, abandon: bool) -> ProcessorResult<()> {
        self.core.check_operable()?;
        if sequences.is_empty() || sequences.iter().any(Vec::is_empty) {
            return Err(ProcessorError::InputEmpty);
        }
        let mut control = self.control();
        let len: usize = sequences.iter().map(Vec::len).sum();
        if len > control.token_limit as usize {
            return Err(ProcessorError::InputExceedsTokenLimit {
                len,
                limit: control.token_limit,
            });
        }
        if !self.core.is_running() {
            return Err(ProcessorError::Halted);
        }
        let busy = self.core.signals.input.is_active();
        if busy || !control.pending.is_empty() {
            if !abandon {
                return Err(ProcessorError::AlreadyProcessing);
            }
            if busy {
                debug!(processor = self.core.id(), "superseding the batch in flight");
            }
        }
        if !control.pending.is_empty() {
            debug!(
                processor = self.core.id(),
                discarded = control.pending.len(),
                "discarding undelivered vectors"
            );
            control.pending.clear();
        }
        control.last_error = None;
        let epoch = self.core.next_epoch();
        self.core.signals.input.raise();
        drop(control);

        let count = sequences.len();
        if let Err(e) = self.core.send(EmbedderWork::Input { sequences, epoch }) {
            self.core.signals.input.reset();
            return Err(e);
        }
        debug!(processor = self.core.id(), sequences = count, tokens = len, "input queued");
        Ok(())
    }

    /// Deliver the next computed vector to the client.
    pub fn next(&self) -> ProcessorResult<()> {
        self.core.check_operable()?;
        let signals = &self.core.signals;
        if signals.input.is_requested() {
            return Err(ProcessorError::AlreadyProcessing);
        }
        if signals.input.is_completed() {
            return Err(ProcessorError::NeedUpdate);
        }

        let (vector, index, is_last, total) = {
            let mut control = self.control();
            if control.pending.is_empty() {
                return Err(ProcessorError::InputEmpty);
            }
            if !self.core.is_running() {
                return Err(ProcessorError::Halted);
            }
            let mut vector = control.pending.pop_front().unwrap_or_default();
            normalize(&mut vector);
            let index = control.delivered;
            control.delivered += 1;
            (vector, index, control.pending.is_empty(), control.total)
        };

        self.with_client(|c| c.on_write(self, &vector, index, is_last));
        if is_last {
            self.with_client(|c| c.on_finish(self, total));
        }
        Ok(())
    }

    /// Block until the context is created or has failed.
    pub fn initialize_sync(&self) -> ProcessorResult<()> {
        if self.core.signals.initialize.is_active() {
            self.wait_for(|event| {
                matches!(
                    event,
                    EmbedderEvent::Initialized | EmbedderEvent::InitializeFailed(_)
                )
            })?;
        }
        match self.core.lifecycle() {
            ProcessorLifecycle::InitializeFailed => Err(ProcessorError::InitializeFailed(
                self.last_fail().unwrap_or(InitFailure::ModelNotInitialized),
            )),
            ProcessorLifecycle::Unregistered => Err(ProcessorError::Unregistered),
            _ => Ok(()),
        }
    }

    pub fn destroy(&self) -> ProcessorResult<()> {
        match self.core.lifecycle() {
            ProcessorLifecycle::Unregistered | ProcessorLifecycle::InitializeFailed => Ok(()),
            ProcessorLifecycle::Destroying => Err(ProcessorError::Destroying),
            _ => {
                let discarded = std::mem::take(&mut self.control().pending).len();
                if discarded > 0 {
                    debug!(processor = self.core.id(), discarded, "discarding undelivered vectors");
                }
                self.core.request_destroy();
                Ok(())
            }
        }
    }

    pub fn destroy_sync(&self) -> ProcessorResult<()> {
        match self.destroy() {
            Ok(()) | Err(ProcessorError::Destroying) => {}
            Err(e) => return Err(e),
        }
        if self.control().events.is_none() {
            return Ok(());
        }
        self.wait_for(|event| event.is_terminal())
    }

    pub fn update(&self) {
        loop {
            let event = match self.control().events.as_ref() {
                Some(events) => events.try_recv().ok(),
                None => None,
            };
            match event {
                Some(event) => self.dispatch(event),
                None => break,
            }
        }
    }

    fn wait_for(&self, done: impl Fn(&EmbedderEvent) -> bool) -> ProcessorResult<()> {
        let events = self
            .control()
            .events
            .clone()
            .ok_or(ProcessorError::Unregistered)?;
        loop {
            let event = events.recv().map_err(|_| ProcessorError::Unregistered)?;
            if done(&event) {
                self.dispatch(event);
                return Ok(());
            }
            let terminal = event.is_terminal();
            self.dispatch(event);
            if terminal {
                return Err(ProcessorError::Unregistered);
            }
        }
    }

    fn dispatch(&self, event: EmbedderEvent) {
        let id = self.core.id();
        match event {
            EmbedderEvent::Initialized => {
                self.core.signals.initialize.reset();
                info!(processor = id, reserved = self.core.reserved(), "embedder initialized");
                self.observe(|o| o.on_initialize());
            }
            EmbedderEvent::InitializeFailed(failure) => {
                self.core.signals.initialize.reset();
                warn!(processor = id, error = %failure, "embedder failed to initialize");
                {
                    let mut control = self.control();
                    control.last_fail = Some(failure.clone());
                    control.events = None;
                }
                self.observe(|o| o.on_initialize_fail(&failure));
            }
            EmbedderEvent::Computed {
                vectors,
                batch_len,
                epoch,
            } => {
                if epoch != self.core.epoch() {
                    debug!(processor = id, batch_len, "superseded batch dropped");
                    return;
                }
                self.core.signals.input.reset();
                {
                    let mut control = self.control();
                    control.total = vectors.len();
                    control.delivered = 0;
                    control.pending = vectors.into();
                }
                self.with_client(|c| c.on_batch_processed(self, batch_len));
            }
            EmbedderEvent::Failed { reason, epoch } => {
                if epoch != self.core.epoch() {
                    return;
                }
                self.core.signals.input.reset();
                warn!(processor = id, %reason, "embedding failed");
                self.control().last_error = Some(reason);
            }
            EmbedderEvent::Destroyed => {
                self.core.signals.destroy.reset();
                {
                    let mut control = self.control();
                    control.events = None;
                    control.pending.clear();
                }
                info!(processor = id, "embedder destroyed");
                self.observe(|o| o.on_destroy());
            }
        }
    }

    fn with_client(&self, f: impl FnOnce(&mut (dyn EmbedderClient + 'static))) {
        if let Some(cell) = self.core.client() {
            cell.with(f);
        }
    }

    fn observe(&self, f: impl FnOnce(&mut dyn ProcessorObserver)) {
        let mut observer = self.observer.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(observer) = observer.as_mut() {
            f(observer.as_mut());
        }
    }

    pub(crate) fn attach(&self, attachment: Attachment) -> ModelResult<Arc<dyn RegisteredProcessor>> {
        let (command_tx, command_rx) = unbounded();
        let (event_tx, event_rx) = unbounded();
        let reserved = attachment.params.context_length;
        let registration = self.core.begin_registration(reserved, command_tx);
        {
            let mut control = self.control();
            *control = EmbedderControl {
                events: Some(event_rx),
                model: attachment.model,
                token_limit: attachment.params.batch_size.min(reserved),
                ..EmbedderControl::default()
            };
        }

        let spawn = EmbedderSpawn {
            core: self.core.clone(),
            weights: attachment.weights,
            params: attachment.params,
            commands: command_rx,
            events: event_tx,
            release: ReleaseGuard::new(attachment.released, (self.core.id(), registration)),
            backend: attachment.backend,
            telemetry: self.telemetry.clone(),
        };
        let spawned = thread::Builder::new()
            .name(format!("llama-embed-{}", self.core.id()))
            .spawn(move || embedder_worker::run(spawn));
        if let Err(e) = spawned {
            self.core.abort_registration();
            self.control().events = None;
            return Err(ModelError::WorkerSpawn(e.to_string()));
        }

        Ok(Arc::new(Link::new(self.core.clone(), registration, reserved)))
    }
}

impl fmt::Debug for EmbedderProcessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EmbedderProcessor")
            .field("id", &self.core.id())
            .field("lifecycle", &self.core.lifecycle())
            .field("reserved", &self.core.reserved())
            .finish()
    }
}

impl Drop for EmbedderProcessor {
    fn drop(&mut self) {
        self.core.request_destroy();
    }
}

/// Scale to unit length. A zero vector stays zero.
fn normalize(vector: &mut [f32]) {
    let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        vector.iter_mut().for_each(|v| *v /= norm);
    }
}

/// Cosine similarity of two vectors; `0.0` when either is zero or the
/// lengths differ.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na = a.iter().map(|v| v * v).sum::<f32>().sqrt();
    let nb = b.iter().map(|v| v * v).sum::<f32>().sqrt();
    if na == 0.0 || nb == 0.0 {
        0.0
    } else {
        dot / (na * nb)
    }
}

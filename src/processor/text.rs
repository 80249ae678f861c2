//! Text generation processor: prompt prefill and token-by-token decode.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::thread;

use crossbeam_channel::{unbounded, Receiver};
use llama_engine::{ModelWeights, TokenId};
use llama_runtime::TelemetryHook;
use llama_sampling::{SamplerChain, SamplerDescription, SamplerKind};
use llama_tokenizer::{ContextLine, DecodingState};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::text_worker::{self, TextSpawn};
use super::{
    Attachment, CachingMode, FinishState, Link, ProcessorCore, ProcessorLifecycle,
    ProcessorObserver, ProcessorStatus, RegisteredProcessor, ReleaseGuard,
};
use crate::client::{Client, ClientCell, TextClient};
use crate::config::DecodeBehavior;
use crate::error::{InitFailure, ModelError, ModelResult, ProcessorError, ProcessorResult};
use crate::model::ModelShared;

pub(crate) type TextCore = ProcessorCore<TextWork, dyn TextClient>;

/// Work a text processor sends its worker.
pub(crate) enum TextWork {
    Input {
        tokens: Vec<TokenId>,
        kv_locked: bool,
        caching: CachingMode,
        epoch: u64,
    },
    Decode(DecodeBehavior),
    ClearResponse { epoch: u64 },
}

/// What a text worker reports back.
#[derive(Debug)]
pub(crate) enum TextEvent {
    Initialized,
    InitializeFailed(InitFailure),
    InputProcessed {
        batch_len: usize,
        kv_locked: bool,
        cursor: u32,
        pinned: u32,
        epoch: u64,
    },
    TokenGenerated {
        token: TokenId,
        cursor: u32,
        pinned: u32,
        finish: FinishState,
        epoch: u64,
    },
    /// One `next()` call is over.
    DecodeDone { generated: u32 },
    ResponseCleared { cursor: u32, pinned: u32, epoch: u64 },
    Failed { reason: String, epoch: u64 },
    Destroyed,
}

impl TextEvent {
    /// The worker is gone after this event.
    fn is_terminal(&self) -> bool {
        matches!(self, TextEvent::Destroyed | TextEvent::InitializeFailed(_))
    }
}

/// What the vocabulary says about one token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenDescription {
    pub text: String,
    pub is_special: bool,
    pub is_control: bool,
}

/// Control-side state, only touched by the thread driving the processor.
struct TextControl {
    events: Option<Receiver<TextEvent>>,
    model: Weak<ModelShared>,
    samplers: Vec<SamplerDescription>,
    caching: CachingMode,
    decoding: DecodingState,
    behavior: DecodeBehavior,
    cursor: u32,
    pinned: u32,
    /// `None` until an input has been processed.
    finish: Option<FinishState>,
    generated: u32,
    last_fail: Option<InitFailure>,
    /// Why the last sequence failed.
    last_error: Option<String>,
}

impl Default for TextControl {
    fn default() -> Self {
        Self {
            events: None,
            model: Weak::new(),
            samplers: Vec::new(),
            caching: CachingMode::Disabled,
            decoding: DecodingState::new(),
            behavior: DecodeBehavior::default(),
            cursor: 0,
            pinned: 0,
            finish: None,
            generated: 0,
            last_fail: None,
            last_error: None,
        }
    }
}

/// A text generation session.
///
/// Create one, register it on a [`Model`](crate::Model), bind a
/// [`TextClient`], then alternate `execute_input` / `next` with `update()`
/// calls that deliver results to the client.
pub struct TextProcessor {
    core: Arc<TextCore>,
    control: Mutex<TextControl>,
    telemetry: Option<Arc<dyn TelemetryHook>>,
    observer: Mutex<Option<Box<dyn ProcessorObserver>>>,
}

impl Default for TextProcessor {
    fn default() -> Self {
        Self::new()
    }
}

impl TextProcessor {
    pub fn new() -> Self {
        Self {
            core: Arc::new(ProcessorCore::new()),
            control: Mutex::new(TextControl::default()),
            telemetry: None,
            observer: Mutex::new(None),
        }
    }

    /// Report prefill and decode timings of every sequence to `hook`.
    /// Takes effect on the next registration.
    pub fn with_telemetry(mut self, hook: Arc<dyn TelemetryHook>) -> Self {
        self.telemetry = Some(hook);
        self
    }

    pub fn set_observer(&self, observer: Box<dyn ProcessorObserver>) {
        *self.observer.lock().unwrap_or_else(PoisonError::into_inner) = Some(observer);
    }

    fn control(&self) -> MutexGuard<'_, TextControl> {
        self.control.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn id(&self) -> u64 {
        self.core.id()
    }

    /// Fresh for every registration.
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

    /// KV positions in use as of the last `update()`.
    pub fn cursor(&self) -> u32 {
        self.control().cursor
    }

    pub fn finish_state(&self) -> Option<FinishState> {
        self.control().finish
    }

    pub fn caching_mode(&self) -> CachingMode {
        self.control().caching
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

    /// Ready to accept work right now.
    pub fn is_available(&self) -> bool {
        self.core.is_running() && self.core.status() == ProcessorStatus::Idle
    }

    pub fn last_fail(&self) -> Option<InitFailure> {
        self.control().last_fail.clone()
    }

    /// The backend error that ended the last sequence with
    /// [`FinishState::Failed`]. Cleared by the next input.
    pub fn last_error(&self) -> Option<String> {
        self.control().last_error.clone()
    }

    pub fn has_sampler(&self, kind: SamplerKind) -> bool {
        self.control().samplers.iter().any(|d| d.kind() == kind)
    }

    /// The configured chain, in order.
    pub fn available_samplers(&self) -> Vec<SamplerKind> {
        self.control().samplers.iter().map(|d| d.kind()).collect()
    }

    /// Pause decoding. An in-flight decode stops before its next token.
    pub fn halt(&self) {
        self.core.set_running(false);
        debug!(processor = self.core.id(), "halted");
    }

    pub fn resume(&self) {
        self.core.set_running(true);
        debug!(processor = self.core.id(), "resumed");
    }

    /// Switch caching for subsequent inputs. Leaving `KvLock` drops the pin.
    pub fn set_manual_caching(&self, caching: CachingMode) {
        let mut control = self.control();
        if caching != CachingMode::KvLock {
            control.pinned = 0;
        }
        control.caching = caching;
    }

    pub fn set_inference_client<C: TextClient + 'static>(
        &self,
        client: &Client<C>,
    ) -> ProcessorResult<()> {
        let cell: Arc<ClientCell<dyn TextClient>> = client.0.clone();
        if self.core.bind_client(cell.clone())? {
            debug!(processor = self.core.id(), "client bound");
            cell.with(|c| c.on_register(self));
        }
        Ok(())
    }

    pub fn release_inference_client(&self) -> ProcessorResult<()> {
        if self.core.release_client() {
            debug!(processor = self.core.id(), "client released");
            Ok(())
        } else {
            Err(ProcessorError::MissingClient)
        }
    }

    pub fn has_client(&self) -> bool {
        self.core.client().is_some()
    }

    fn weights(&self) -> ProcessorResult<Arc<dyn ModelWeights>> {
        let model = self
            .control()
            .model
            .upgrade()
            .ok_or(ProcessorError::ModelUnavailable)?;
        model.weights().ok_or(ProcessorError::ModelUnavailable)
    }

    /// Tokenize with control strings parsed into their tokens.
    pub fn tokenize(&self, text: &str) -> ProcessorResult<Vec<TokenId>> {
        self.core.check_registered()?;
        if text.is_empty() {
            return Err(ProcessorError::InputEmpty);
        }
        self.weights()?
            .tokenize(text, true)
            .map_err(|e| ProcessorError::TokenizationFailed(e.to_string()))
    }

    /// Render `lines` with the model's chat template and tokenize the result.
    pub fn tokenize_lines(
        &self,
        lines: &[ContextLine],
        append_assistant: bool,
    ) -> ProcessorResult<Vec<TokenId>> {
        self.core.check_registered()?;
        if lines.is_empty() {
            return Err(ProcessorError::InputEmpty);
        }
        let model = self.control().model.upgrade();
        let template = model
            .and_then(|model| model.chat_template())
            .ok_or(ProcessorError::ModelUnavailable)?;
        self.tokenize(&template.render(lines, append_assistant))
    }

    pub fn token_to_description(&self, token: TokenId) -> ProcessorResult<TokenDescription> {
        let weights = self.weights()?;
        let piece = weights
            .token_to_piece(token)
            .map_err(|e| ProcessorError::TokenizationFailed(e.to_string()))?;
        let attributes = weights.token_attributes(token);
        Ok(TokenDescription {
            text: String::from_utf8_lossy(&piece).into_owned(),
            is_special: attributes.is_special,
            is_control: attributes.is_control,
        })
    }

    /// Queue a prompt. With `kv_locked` (only in `KvLock` mode) the cache is
    /// pinned up to the end of this prompt.
    pub fn execute_input(&self, tokens: Vec<TokenId>, kv_locked: bool) -> ProcessorResult<()> {
        self.queue_input(tokens, kv_locked, false)
    }

    /// Like [`execute_input`](Self::execute_input), but work in flight is
    /// abandoned instead of refusing the input: a running decode stops, and
    /// a prompt still being prefilled is superseded. Only the new input is
    /// reported to the client.
    pub fn execute_input_abandon(
        &self,
        tokens: Vec<TokenId>,
        kv_locked: bool,
    ) -> ProcessorResult<()> {
        self.queue_input(tokens, kv_locked, true)
    }

    pub fn execute_input_sync(&self, tokens: Vec<TokenId>, kv_locked: bool) -> ProcessorResult<()> {
        self.execute_input(tokens, kv_locked)?;
        let epoch = self.core.epoch();
        self.wait_for(|event| match event {
            TextEvent::InputProcessed { epoch: e, .. } | TextEvent::Failed { epoch: e, .. } => {
                *e == epoch
            }
            _ => false,
        })
    }

    fn queue_input(
        &self,
        tokens: Vec<TokenId>,
        kv_locked: bool,
        abandon: bool,
    ) -> ProcessorResult<()> {
        self.core.check_operable()?;
        if tokens.is_empty() {
            return Err(ProcessorError::InputEmpty);
        }

        let mut control = self.control();
        let limit = self.core.reserved();
        let pinned = if control.caching == CachingMode::KvLock {
            control.pinned as usize
        } else {
            0
        };
        if pinned + tokens.len() > limit as usize {
            return Err(ProcessorError::InputExceedsTokenLimit {
                len: tokens.len(),
                limit,
            });
        }
        if kv_locked && control.caching != CachingMode::KvLock {
            return Err(ProcessorError::CachingModeMismatch);
        }
        if !self.core.is_running() {
            return Err(ProcessorError::Halted);
        }

        let signals = &self.core.signals;
        if signals.input.is_active() || signals.decode.is_active() {
            if !abandon {
                return Err(ProcessorError::AlreadyProcessing);
            }
            debug!(processor = self.core.id(), "abandoning work in flight");
        }

        // Bumping the epoch is what stops the worker on older work.
        let epoch = self.core.next_epoch();
        let len = tokens.len();
        control.decoding.clear();
        control.generated = 0;
        control.last_error = None;
        signals.input.raise();
        let caching = control.caching;
        drop(control);

        if let Err(e) = self.core.send(TextWork::Input {
            tokens,
            kv_locked,
            caching,
            epoch,
        }) {
            signals.input.reset();
            return Err(e);
        }
        debug!(processor = self.core.id(), tokens = len, kv_locked, "input queued");
        Ok(())
    }

    /// Generate up to `behavior.token_budget` tokens. A call while a decode
    /// is already running is a no-op.
    pub fn next(&self, behavior: DecodeBehavior) -> ProcessorResult<()> {
        self.core.check_operable()?;
        let signals = &self.core.signals;
        if signals.decode.is_requested() {
            return Ok(());
        }
        if signals.decode.is_completed() || signals.input.is_active() {
            return Err(ProcessorError::AlreadyProcessing);
        }

        let mut control = self.control();
        if control.finish != Some(FinishState::Continue) {
            return Err(ProcessorError::InputEmpty);
        }
        if !self.core.is_running() {
            return Err(ProcessorError::Halted);
        }
        control.behavior = behavior;
        signals.decode.raise();
        drop(control);

        if let Err(e) = self.core.send(TextWork::Decode(behavior)) {
            signals.decode.reset();
            return Err(e);
        }
        Ok(())
    }

    pub fn next_sync(&self, behavior: DecodeBehavior) -> ProcessorResult<()> {
        self.next(behavior)?;
        self.wait_for(|event| matches!(event, TextEvent::DecodeDone { .. }))
    }

    /// Drop the generated response, keeping the pinned prefix.
    pub fn clear_response(&self) -> ProcessorResult<()> {
        self.core.check_operable()?;
        let signals = &self.core.signals;
        if signals.input.is_active() || signals.decode.is_active() {
            return Err(ProcessorError::AlreadyProcessing);
        }
        {
            let mut control = self.control();
            control.finish = None;
            control.decoding.clear();
        }
        signals.input.raise();
        let epoch = self.core.epoch();
        self.core.send(TextWork::ClearResponse { epoch }).map_err(|e| {
            signals.input.reset();
            e
        })
    }

    /// Block until the context is created or has failed.
    pub fn initialize_sync(&self) -> ProcessorResult<()> {
        if self.core.signals.initialize.is_active() {
            self.wait_for(|event| {
                matches!(event, TextEvent::Initialized | TextEvent::InitializeFailed(_))
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

    /// Unregister from the model. The client is released right away; the
    /// budget is returned once the worker is gone.
    pub fn destroy(&self) -> ProcessorResult<()> {
        match self.core.lifecycle() {
            ProcessorLifecycle::Unregistered | ProcessorLifecycle::InitializeFailed => Ok(()),
            ProcessorLifecycle::Destroying => Err(ProcessorError::Destroying),
            _ => {
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

    /// Drain worker events, delivering client callbacks on this thread.
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

    /// Dispatch events until one satisfies `done`. Must not race with
    /// `update()` on another thread.
    fn wait_for(&self, done: impl Fn(&TextEvent) -> bool) -> ProcessorResult<()> {
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

    fn dispatch(&self, event: TextEvent) {
        let id = self.core.id();
        match event {
            TextEvent::Initialized => {
                self.core.signals.initialize.reset();
                info!(
                    processor = id,
                    context_id = ?self.core.context_id(),
                    reserved = self.core.reserved(),
                    "text processor initialized"
                );
                self.observe(|o| o.on_initialize());
            }
            TextEvent::InitializeFailed(failure) => {
                self.core.signals.initialize.reset();
                warn!(processor = id, error = %failure, "text processor failed to initialize");
                {
                    let mut control = self.control();
                    control.last_fail = Some(failure.clone());
                    control.events = None;
                }
                self.observe(|o| o.on_initialize_fail(&failure));
            }
            TextEvent::InputProcessed {
                batch_len,
                kv_locked,
                cursor,
                pinned,
                epoch,
            } => {
                // A newer input owns the signal now.
                if epoch != self.core.epoch() {
                    debug!(processor = id, batch_len, "superseded input dropped");
                    return;
                }
                self.core.signals.input.reset();
                {
                    let mut control = self.control();
                    control.cursor = cursor;
                    control.pinned = pinned;
                    control.finish = Some(FinishState::Continue);
                }
                debug!(processor = id, batch_len, cursor, pinned, "input processed");
                self.with_client(|c| c.on_batch_processed(self, batch_len, kv_locked));
            }
            TextEvent::TokenGenerated {
                token,
                cursor,
                pinned,
                finish,
                epoch,
            } => self.deliver_token(token, cursor, pinned, finish, epoch),
            TextEvent::DecodeDone { generated } => {
                self.core.signals.decode.reset();
                debug!(processor = id, generated, "decode call done");
            }
            TextEvent::ResponseCleared {
                cursor,
                pinned,
                epoch,
            } => {
                if epoch != self.core.epoch() {
                    return;
                }
                self.core.signals.input.reset();
                let mut control = self.control();
                control.cursor = cursor;
                control.pinned = pinned;
            }
            TextEvent::Failed { reason, epoch } => {
                if epoch != self.core.epoch() {
                    return;
                }
                self.core.signals.input.reset();
                let generated = {
                    let mut control = self.control();
                    control.finish = Some(FinishState::Failed);
                    control.cursor = 0;
                    control.pinned = 0;
                    control.last_error = Some(reason.clone());
                    control.generated
                };
                warn!(processor = id, %reason, "sequence failed");
                self.with_client(|c| c.on_finish(self, generated, FinishState::Failed));
            }
            TextEvent::Destroyed => {
                self.core.signals.destroy.reset();
                {
                    let mut control = self.control();
                    control.events = None;
                    control.finish = None;
                    control.cursor = 0;
                    control.pinned = 0;
                }
                info!(processor = id, "text processor destroyed");
                self.observe(|o| o.on_destroy());
            }
        }
    }

    fn deliver_token(
        &self,
        token: TokenId,
        cursor: u32,
        pinned: u32,
        finish: FinishState,
        epoch: u64,
    ) {
        if epoch != self.core.epoch() {
            debug!(processor = self.core.id(), token, "dropping token of an abandoned input");
            return;
        }
        let (is_control, piece) = match self.weights() {
            Ok(weights) => (
                weights.token_attributes(token).is_control,
                weights.token_to_piece(token).unwrap_or_default(),
            ),
            Err(_) => (false, Vec::new()),
        };
        let is_finished = finish != FinishState::Continue;

        let (text, generated, halt_on_write) = {
            let mut control = self.control();
            control.cursor = cursor;
            control.pinned = pinned;
            control.finish = Some(finish);
            control.generated += 1;
            let mut text = if is_control {
                let mut text = control.decoding.flush();
                text.push_str(&String::from_utf8_lossy(&piece));
                text
            } else {
                control.decoding.push_bytes(&piece)
            };
            if is_finished {
                text.push_str(&control.decoding.flush());
            }
            (text, control.generated, control.behavior.halt_on_write)
        };

        self.with_client(|c| c.on_write(self, &text, token, is_control, is_finished));
        if is_finished {
            debug!(
                processor = self.core.id(),
                tokens = generated,
                state = ?finish,
                "sequence finished"
            );
            self.with_client(|c| c.on_finish(self, generated, finish));
        }
        if halt_on_write {
            self.halt();
        }
    }

    fn with_client(&self, f: impl FnOnce(&mut (dyn TextClient + 'static))) {
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

    /// Start a registration. Called by the model with its registry locked.
    pub(crate) fn attach(
        &self,
        attachment: Attachment,
        chain: SamplerChain,
        caching: CachingMode,
    ) -> ModelResult<Arc<dyn RegisteredProcessor>> {
        let (command_tx, command_rx) = unbounded();
        let (event_tx, event_rx) = unbounded();
        let reserved = attachment.params.context_length;
        let registration = self.core.begin_registration(reserved, command_tx);
        {
            let mut control = self.control();
            *control = TextControl {
                events: Some(event_rx),
                model: attachment.model,
                samplers: chain.descriptions().to_vec(),
                caching,
                ..TextControl::default()
            };
        }

        let spawn = TextSpawn {
            core: self.core.clone(),
            weights: attachment.weights,
            params: attachment.params,
            chain,
            commands: command_rx,
            events: event_tx,
            release: ReleaseGuard::new(attachment.released, (self.core.id(), registration)),
            backend: attachment.backend,
            telemetry: self.telemetry.clone(),
        };
        let spawned = thread::Builder::new()
            .name(format!("llama-text-{}", self.core.id()))
            .spawn(move || text_worker::run(spawn));
        if let Err(e) = spawned {
            self.core.abort_registration();
            self.control().events = None;
            return Err(ModelError::WorkerSpawn(e.to_string()));
        }

        Ok(Arc::new(Link::new(self.core.clone(), registration, reserved)))
    }
}

impl fmt::Debug for TextProcessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TextProcessor")
            .field("id", &self.core.id())
            .field("lifecycle", &self.core.lifecycle())
            .field("reserved", &self.core.reserved())
            .finish()
    }
}

impl Drop for TextProcessor {
    fn drop(&mut self) {
        self.core.request_destroy();
    }
}

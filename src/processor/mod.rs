//! Processors: per-session state machines multiplexed over one model.
//!
//! Each registered processor owns a worker thread that holds its compute
//! context. The control side (the processor handle the application keeps)
//! sends work over a command channel and drains completion events in
//! `update()`. [`Signal`](crate::Signal)s answer "busy or done" without
//! touching the channels.
//!
//! ```text
//! ┌──────────────┐     Command<W>      ┌─────────────────────┐
//! │ control site │ ──────────────────> │ processor worker    │
//! │  update()    │ <────────────────── │ owns ComputeContext │
//! └──────────────┘     events          └─────────────────────┘
//! ```

mod embedder;
mod embedder_worker;
mod text;
mod text_worker;

pub use embedder::{cosine_similarity, EmbedderProcessor};
pub use text::{TextProcessor, TokenDescription};

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use crossbeam_channel::Sender;
use llama_engine::{ContextParams, ModelWeights};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::client::{cell_addr, ClientCell, Unbind};
use crate::error::{InitFailure, ProcessorError, ProcessorResult};
use crate::model::ModelShared;
use crate::signal::Signals;

static NEXT_PROCESSOR_ID: AtomicU64 = AtomicU64::new(1);

/// Why a generated sequence stopped, or `Continue` while it has not.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishState {
    Continue,
    /// Token id 0 or an end-of-generation token was selected.
    Finished,
    /// The cursor reached the reserved context.
    TokenLimitReached,
    /// The backend failed mid-sequence.
    Failed,
}

/// How the KV cache survives from one input to the next.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CachingMode {
    /// Every input starts from an empty cache.
    #[default]
    Disabled,
    /// Reuse the prefix an input shares with what is already cached.
    AutoLogitStore,
    /// `kv_locked` inputs pin the cache; later inputs resume after the pin.
    KvLock,
}

/// Registration lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ProcessorLifecycle {
    Unregistered = 0,
    Initializing = 1,
    Idle = 2,
    Operating = 3,
    Destroying = 4,
    InitializeFailed = 5,
}

impl ProcessorLifecycle {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => ProcessorLifecycle::Initializing,
            2 => ProcessorLifecycle::Idle,
            3 => ProcessorLifecycle::Operating,
            4 => ProcessorLifecycle::Destroying,
            5 => ProcessorLifecycle::InitializeFailed,
            _ => ProcessorLifecycle::Unregistered,
        }
    }

    /// Holds a slice of some model's budget.
    pub fn is_attached(self) -> bool {
        !matches!(
            self,
            ProcessorLifecycle::Unregistered | ProcessorLifecycle::InitializeFailed
        )
    }
}

/// What a processor is doing, from the control side's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProcessorStatus {
    Unregistered,
    Initializing,
    Destroying,
    InputProcessing,
    Decoding,
    /// A result is waiting for `update()`.
    NeedUpdate,
    Idle,
}

/// Lifecycle callbacks of a processor, delivered on the control thread.
pub trait ProcessorObserver: Send {
    fn on_initialize(&mut self) {}

    fn on_initialize_fail(&mut self, _failure: &InitFailure) {}

    fn on_destroy(&mut self) {}
}

/// What a model hands a processor when it registers it.
pub(crate) struct Attachment {
    pub model: Weak<ModelShared>,
    pub weights: Arc<dyn ModelWeights>,
    pub params: ContextParams,
    pub released: Sender<Release>,
    pub backend: String,
}

/// Message from a processor handle to its worker.
pub(crate) enum Command<W> {
    Work(W),
    Destroy,
}

/// Identity of one registration: `(processor id, registration number)`.
pub(crate) type Release = (u64, u64);

/// State shared between a processor handle, its worker and the model's
/// registry.
pub(crate) struct ProcessorCore<W, C: ?Sized> {
    id: u64,
    pub(crate) signals: Signals,
    running: AtomicBool,
    lifecycle: AtomicU8,
    registration: AtomicU64,
    reserved: AtomicU32,
    /// Bumped by every input. Work and events of older inputs are dropped.
    epoch: AtomicU64,
    context_id: Mutex<Option<Uuid>>,
    commands: Mutex<Option<Sender<Command<W>>>>,
    client: Mutex<Option<Arc<ClientCell<C>>>>,
}

fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<W, C: ?Sized> ProcessorCore<W, C> {
    pub(crate) fn new() -> Self {
        Self {
            id: NEXT_PROCESSOR_ID.fetch_add(1, Ordering::Relaxed),
            signals: Signals::default(),
            running: AtomicBool::new(true),
            lifecycle: AtomicU8::new(ProcessorLifecycle::Unregistered as u8),
            registration: AtomicU64::new(0),
            reserved: AtomicU32::new(0),
            epoch: AtomicU64::new(0),
            context_id: Mutex::new(None),
            commands: Mutex::new(None),
            client: Mutex::new(None),
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn lifecycle(&self) -> ProcessorLifecycle {
        ProcessorLifecycle::from_u8(self.lifecycle.load(Ordering::Acquire))
    }

    pub(crate) fn set_lifecycle(&self, lifecycle: ProcessorLifecycle) {
        self.lifecycle.store(lifecycle as u8, Ordering::Release);
    }

    /// Move `from -> to` unless someone else moved the lifecycle first.
    pub(crate) fn transition(&self, from: ProcessorLifecycle, to: ProcessorLifecycle) -> bool {
        self.lifecycle
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn registration(&self) -> u64 {
        self.registration.load(Ordering::Acquire)
    }

    pub(crate) fn reserved(&self) -> u32 {
        self.reserved.load(Ordering::Acquire)
    }

    pub(crate) fn context_id(&self) -> Option<Uuid> {
        *lock(&self.context_id)
    }

    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub(crate) fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::Release);
    }

    pub(crate) fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    pub(crate) fn next_epoch(&self) -> u64 {
        self.epoch.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// A newer input was queued after the one tagged `epoch`.
    pub(crate) fn is_superseded(&self, epoch: u64) -> bool {
        self.epoch() != epoch
    }

    /// Start a registration: reset signals, mark `Initializing` and install
    /// the command channel. Returns the registration number.
    pub(crate) fn begin_registration(&self, reserved: u32, commands: Sender<Command<W>>) -> u64 {
        self.signals.reset_all();
        self.reserved.store(reserved, Ordering::Release);
        *lock(&self.context_id) = Some(Uuid::new_v4());
        *lock(&self.commands) = Some(commands);
        self.signals.initialize.raise();
        self.set_lifecycle(ProcessorLifecycle::Initializing);
        self.registration.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Worker side: the context could not be created. A destroy that got in
    /// first wins, and the processor ends up unregistered.
    pub(crate) fn finish_failed_initialize(&self) {
        if !self.transition(ProcessorLifecycle::Initializing, ProcessorLifecycle::InitializeFailed) {
            self.set_lifecycle(ProcessorLifecycle::Unregistered);
        }
    }

    /// Undo `begin_registration` when the worker could not be started.
    pub(crate) fn abort_registration(&self) {
        lock(&self.commands).take();
        self.signals.reset_all();
        self.reserved.store(0, Ordering::Release);
        self.set_lifecycle(ProcessorLifecycle::Unregistered);
    }

    /// Send work to the worker. `Unregistered` once the channel is gone.
    pub(crate) fn send(&self, work: W) -> ProcessorResult<()> {
        let commands = lock(&self.commands);
        let tx = commands.as_ref().ok_or(ProcessorError::Unregistered)?;
        tx.send(Command::Work(work))
            .map_err(|_| ProcessorError::Unregistered)
    }

    /// Registered, whether or not the worker has results waiting.
    pub(crate) fn check_registered(&self) -> ProcessorResult<()> {
        match self.lifecycle() {
            ProcessorLifecycle::Unregistered | ProcessorLifecycle::InitializeFailed => {
                Err(ProcessorError::Unregistered)
            }
            ProcessorLifecycle::Destroying => Err(ProcessorError::Destroying),
            ProcessorLifecycle::Initializing => Err(ProcessorError::Initializing),
            ProcessorLifecycle::Idle | ProcessorLifecycle::Operating => Ok(()),
        }
    }

    /// Common precondition of every operation that needs a live context.
    pub(crate) fn check_operable(&self) -> ProcessorResult<()> {
        match self.lifecycle() {
            ProcessorLifecycle::Unregistered | ProcessorLifecycle::InitializeFailed => {
                Err(ProcessorError::Unregistered)
            }
            ProcessorLifecycle::Destroying => Err(ProcessorError::Destroying),
            ProcessorLifecycle::Initializing => Err(ProcessorError::Initializing),
            ProcessorLifecycle::Idle | ProcessorLifecycle::Operating => {
                if self.signals.initialize.is_completed() {
                    Err(ProcessorError::NeedUpdate)
                } else {
                    Ok(())
                }
            }
        }
    }

    pub(crate) fn status(&self) -> ProcessorStatus {
        let signals = &self.signals;
        match self.lifecycle() {
            ProcessorLifecycle::Unregistered | ProcessorLifecycle::InitializeFailed => {
                if signals.initialize.is_active() || signals.destroy.is_completed() {
                    ProcessorStatus::NeedUpdate
                } else {
                    ProcessorStatus::Unregistered
                }
            }
            ProcessorLifecycle::Destroying => ProcessorStatus::Destroying,
            ProcessorLifecycle::Initializing => ProcessorStatus::Initializing,
            ProcessorLifecycle::Idle | ProcessorLifecycle::Operating => {
                if signals.initialize.is_completed() {
                    ProcessorStatus::NeedUpdate
                } else if signals.input.is_requested() {
                    ProcessorStatus::InputProcessing
                } else if signals.decode.is_requested() {
                    ProcessorStatus::Decoding
                } else if signals.input.is_completed() || signals.decode.is_completed() {
                    ProcessorStatus::NeedUpdate
                } else {
                    ProcessorStatus::Idle
                }
            }
        }
    }

    pub(crate) fn client(&self) -> Option<Arc<ClientCell<C>>> {
        lock(&self.client).clone()
    }

    /// Bind `cell`. Idempotent for the client already bound.
    pub(crate) fn bind_client(&self, cell: Arc<ClientCell<C>>) -> ProcessorResult<bool> {
        let mut slot = lock(&self.client);
        if let Some(current) = slot.as_ref() {
            if cell_addr(current) == cell_addr(&cell) {
                return Ok(false);
            }
            return Err(ProcessorError::AlreadyProcessing);
        }
        if !cell.claim(self.id) {
            return Err(ProcessorError::BelongsToAnotherProcessor);
        }
        *slot = Some(cell);
        Ok(true)
    }
}

impl<W, C: ?Sized + Unbind + Send + 'static> ProcessorCore<W, C> {
    /// Unbind the client, delivering `on_unregister`. `false` if none was bound.
    pub(crate) fn release_client(&self) -> bool {
        let cell = lock(&self.client).take();
        match cell {
            Some(cell) => {
                ClientCell::release(&cell);
                true
            }
            None => false,
        }
    }

    /// Move a live registration to `Destroying`. Loses to a worker that
    /// moved the lifecycle somewhere else first.
    fn begin_destroy(&self) -> bool {
        loop {
            let current = self.lifecycle();
            match current {
                ProcessorLifecycle::Initializing
                | ProcessorLifecycle::Idle
                | ProcessorLifecycle::Operating => {
                    if self.transition(current, ProcessorLifecycle::Destroying) {
                        return true;
                    }
                }
                _ => return false,
            }
        }
    }

    /// Release the client and ask the worker to tear down. `false` if there
    /// was nothing to destroy.
    pub(crate) fn request_destroy(&self) -> bool {
        if !self.begin_destroy() {
            return false;
        }
        self.release_client();
        self.signals.destroy.raise();
        if let Some(tx) = lock(&self.commands).take() {
            let _ = tx.send(Command::Destroy);
        }
        tracing::debug!(processor = self.id, "destroy requested");
        true
    }
}

/// A processor as seen by the model's registry: one registration of one core.
pub(crate) trait RegisteredProcessor: Send + Sync {
    fn id(&self) -> u64;

    fn registration(&self) -> u64;

    /// Budget this registration holds.
    fn reserved(&self) -> u32;

    /// The core has not been registered again since.
    fn is_current(&self) -> bool;

    fn lifecycle(&self) -> ProcessorLifecycle;

    /// The budget can be reclaimed.
    fn is_released(&self) -> bool {
        !self.is_current() || !self.lifecycle().is_attached()
    }

    fn request_destroy(&self);
}

pub(crate) struct Link<W, C: ?Sized> {
    core: Arc<ProcessorCore<W, C>>,
    registration: u64,
    reserved: u32,
}

impl<W, C: ?Sized> Link<W, C> {
    pub(crate) fn new(core: Arc<ProcessorCore<W, C>>, registration: u64, reserved: u32) -> Self {
        Self {
            core,
            registration,
            reserved,
        }
    }
}

impl<W, C> RegisteredProcessor for Link<W, C>
where
    W: Send,
    C: ?Sized + Unbind + Send + 'static,
{
    fn id(&self) -> u64 {
        self.core.id()
    }

    fn registration(&self) -> u64 {
        self.registration
    }

    fn reserved(&self) -> u32 {
        self.reserved
    }

    fn is_current(&self) -> bool {
        self.core.registration() == self.registration
    }

    fn lifecycle(&self) -> ProcessorLifecycle {
        self.core.lifecycle()
    }

    fn request_destroy(&self) {
        if self.is_current() {
            self.core.request_destroy();
        }
    }
}

/// Reports a worker's exit to its model, even if the worker panics.
pub(crate) struct ReleaseGuard {
    released: Sender<Release>,
    release: Release,
}

impl ReleaseGuard {
    pub(crate) fn new(released: Sender<Release>, release: Release) -> Self {
        Self { released, release }
    }
}

impl Drop for ReleaseGuard {
    fn drop(&mut self) {
        let _ = self.released.send(self.release);
    }
}

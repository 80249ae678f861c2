//! The model: loaded weights plus the context budget its processors share.
//!
//! Loading and teardown run on a model worker thread. Every registration
//! reserves `context_length` positions out of the total budget under the
//! model's lock; the reservation comes back once the processor's worker has
//! let go of its context.

mod worker;

use std::collections::HashSet;
use std::fmt;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{unbounded, Receiver, Sender};
use llama_engine::{ComputeBackend, ContextParams, LoadParams, ModelMetadata, ModelWeights};
use llama_sampling::SamplerChain;
use llama_tokenizer::ChatTemplate;
use tracing::{debug, info, warn};

use self::worker::{Loaded, ModelCommand, ModelEvent, ModelSpawn};
use crate::config::{EmbedderConfig, ModelConfig, ProcessorConfig, MIN_CONTEXT_LENGTH};
use crate::error::{InitFailure, ModelError, ModelResult};
use crate::processor::{
    Attachment, EmbedderProcessor, ProcessorLifecycle, RegisteredProcessor, Release,
    TextProcessor,
};

/// Model lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModelState {
    Uninitialized,
    Initializing,
    Ready,
    Destroying,
}

/// Lifecycle callbacks of a model, delivered from `update()` and the `_sync`
/// operations.
pub trait ModelObserver: Send {
    fn on_initialize(&mut self) {}

    fn on_initialize_fail(&mut self, _failure: &InitFailure) {}

    fn on_destroy(&mut self) {}
}

struct ModelInner {
    state: ModelState,
    weights: Option<Arc<dyn ModelWeights>>,
    metadata: Option<ModelMetadata>,
    template: Option<ChatTemplate>,
    total: u32,
    occupied: u32,
    processors: Vec<Arc<dyn RegisteredProcessor>>,
    last_fail: Option<InitFailure>,
}

/// The part of a model its processors can reach through a `Weak`.
pub(crate) struct ModelShared {
    backend: Arc<dyn ComputeBackend>,
    inner: Mutex<ModelInner>,
    released_tx: Sender<Release>,
    released_rx: Receiver<Release>,
}

impl ModelShared {
    fn inner(&self) -> MutexGuard<'_, ModelInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn weights(&self) -> Option<Arc<dyn ModelWeights>> {
        self.inner().weights.clone()
    }

    pub(crate) fn chat_template(&self) -> Option<ChatTemplate> {
        self.inner().template.clone()
    }
}

/// Channels to a running model worker.
struct ModelLink {
    commands: Option<Sender<ModelCommand>>,
    events: Receiver<ModelEvent>,
    handle: Option<JoinHandle<()>>,
}

impl Drop for ModelLink {
    fn drop(&mut self) {
        self.commands.take();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("model worker panicked");
            }
        }
    }
}

/// A loaded (or loading) model and the registry of its processors.
///
/// ```no_run
/// use std::sync::Arc;
/// use llama_runtime::ReferenceBackend;
/// use llama_serve::{Model, ProcessorConfig, TextProcessor};
///
/// let mut model = Model::new(Arc::new(ReferenceBackend::new()));
/// model.load_sync("model.json", 8192, 0)?;
/// let processor = TextProcessor::new();
/// model.register_text_processor(&processor, ProcessorConfig::new(4096))?;
/// processor.initialize_sync()?;
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
pub struct Model {
    shared: Arc<ModelShared>,
    link: Option<ModelLink>,
    observer: Mutex<Option<Box<dyn ModelObserver>>>,
}

impl Model {
    pub fn new(backend: Arc<dyn ComputeBackend>) -> Self {
        let (released_tx, released_rx) = unbounded();
        Self {
            shared: Arc::new(ModelShared {
                backend,
                inner: Mutex::new(ModelInner {
                    state: ModelState::Uninitialized,
                    weights: None,
                    metadata: None,
                    template: None,
                    total: 0,
                    occupied: 0,
                    processors: Vec::new(),
                    last_fail: None,
                }),
                released_tx,
                released_rx,
            }),
            link: None,
            observer: Mutex::new(None),
        }
    }

    pub fn set_observer(&mut self, observer: Box<dyn ModelObserver>) {
        *self.observer.lock().unwrap_or_else(PoisonError::into_inner) = Some(observer);
    }

    fn observe(&self, f: impl FnOnce(&mut dyn ModelObserver)) {
        let mut observer = self.observer.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(observer) = observer.as_mut() {
            f(observer.as_mut());
        }
    }

    fn inner(&self) -> MutexGuard<'_, ModelInner> {
        self.shared.inner()
    }

    /// Start loading `path` on the model worker. Completion is reported by
    /// `update()`.
    pub fn load(
        &mut self,
        path: impl AsRef<Path>,
        total_context: u32,
        gpu_layers: i32,
    ) -> ModelResult<()> {
        let path = path.as_ref().to_path_buf();
        {
            let mut inner = self.inner();
            match inner.state {
                ModelState::Uninitialized => {}
                ModelState::Initializing => return Err(ModelError::Initializing),
                ModelState::Ready => return Err(ModelError::AlreadyInitialized),
                ModelState::Destroying => return Err(ModelError::Destroying),
            }
            if total_context == 0 {
                return Err(ModelError::InvalidInput(
                    "total context budget must be non-zero".to_string(),
                ));
            }
            inner.state = ModelState::Initializing;
            inner.total = total_context;
            inner.occupied = 0;
            inner.last_fail = None;
        }
        // The previous worker, if any, has already exited.
        self.link = None;

        let (command_tx, command_rx) = unbounded();
        let (event_tx, event_rx) = unbounded();
        let spawn = ModelSpawn {
            backend: self.shared.backend.clone(),
            path: path.clone(),
            params: LoadParams {
                gpu_layers,
                ..LoadParams::default()
            },
            commands: command_rx,
            events: event_tx,
            released: self.shared.released_rx.clone(),
        };
        let handle = thread::Builder::new()
            .name("llama-model".to_string())
            .spawn(move || worker::run(spawn))
            .map_err(|e| {
                self.inner().state = ModelState::Uninitialized;
                ModelError::WorkerSpawn(e.to_string())
            })?;

        self.link = Some(ModelLink {
            commands: Some(command_tx),
            events: event_rx,
            handle: Some(handle),
        });
        info!(path = %path.display(), total_context, gpu_layers, "model load started");
        Ok(())
    }

    pub fn load_with(&mut self, path: impl AsRef<Path>, config: &ModelConfig) -> ModelResult<()> {
        self.load(path, config.total_context, config.gpu_layers)
    }

    /// Load and block until the weights are ready or the load failed.
    pub fn load_sync(
        &mut self,
        path: impl AsRef<Path>,
        total_context: u32,
        gpu_layers: i32,
    ) -> ModelResult<()> {
        self.load(path, total_context, gpu_layers)?;
        self.wait_for(|event| matches!(event, ModelEvent::Loaded(_) | ModelEvent::LoadFailed(_)));
        let inner = self.inner();
        match inner.state {
            ModelState::Ready => Ok(()),
            _ => Err(ModelError::InitFailed(
                inner
                    .last_fail
                    .clone()
                    .unwrap_or(InitFailure::ModelNotInitialized),
            )),
        }
    }

    /// Reserve `config.context_length` of the budget for `processor` and
    /// start creating its context.
    pub fn register_text_processor(
        &self,
        processor: &TextProcessor,
        config: ProcessorConfig,
    ) -> ModelResult<()> {
        let mut inner = self.inner();
        sweep(&mut inner, &self.shared.released_rx);
        let requested = config.context_length;
        check_registration(&inner, requested, processor.lifecycle(), false)?;

        let (eot, linefeed) = inner
            .metadata
            .as_ref()
            .map(|m| (m.eot_token, m.linefeed_token))
            .unwrap_or((None, None));
        let chain = SamplerChain::new(config.samplers.clone())?.with_special_tokens(eot, linefeed);
        let attachment = self.attachment(&inner, config.context_params())?;
        let link = processor.attach(attachment, chain, config.caching)?;

        inner.occupied += requested;
        inner.processors.push(link);
        info!(
            processor = processor.id(),
            context_id = ?processor.context_id(),
            reserved = requested,
            occupied = inner.occupied,
            total = inner.total,
            "text processor registered"
        );
        Ok(())
    }

    pub fn register_embedder_processor(
        &self,
        processor: &EmbedderProcessor,
        config: EmbedderConfig,
    ) -> ModelResult<()> {
        let mut inner = self.inner();
        sweep(&mut inner, &self.shared.released_rx);
        let requested = config.context_length;
        check_registration(&inner, requested, processor.lifecycle(), true)?;

        let attachment = self.attachment(&inner, config.context_params())?;
        let link = processor.attach(attachment)?;

        inner.occupied += requested;
        inner.processors.push(link);
        info!(
            processor = processor.id(),
            reserved = requested,
            occupied = inner.occupied,
            total = inner.total,
            "embedder registered"
        );
        Ok(())
    }

    fn attachment(&self, inner: &ModelInner, params: ContextParams) -> ModelResult<Attachment> {
        let weights = inner.weights.clone().ok_or(ModelError::NotInitialized)?;
        Ok(Attachment {
            model: Arc::downgrade(&self.shared),
            weights,
            params,
            released: self.shared.released_tx.clone(),
            backend: self.shared.backend.name().to_string(),
        })
    }

    /// Destroy every registered processor, then free the weights once their
    /// workers are gone. Completion is reported by `update()`.
    pub fn destroy(&mut self) -> ModelResult<()> {
        let (weights, links) = {
            let mut inner = self.inner();
            match inner.state {
                ModelState::Ready => {}
                ModelState::Uninitialized => return Err(ModelError::NotInitialized),
                ModelState::Initializing => return Err(ModelError::Initializing),
                ModelState::Destroying => return Err(ModelError::Destroying),
            }
            inner.state = ModelState::Destroying;
            (inner.weights.take(), inner.processors.clone())
        };

        let pending: HashSet<Release> = links.iter().map(|l| (l.id(), l.registration())).collect();
        info!(processors = links.len(), "model destroy started");
        // Clients are released here, on the control thread.
        for link in &links {
            link.request_destroy();
        }

        let command = ModelCommand::Destroy { weights, pending };
        let sent = self
            .link
            .as_ref()
            .and_then(|link| link.commands.as_ref())
            .map(|commands| commands.send(command).is_ok())
            .unwrap_or(false);
        if !sent {
            warn!("model worker is gone, finishing destroy in place");
            let mut inner = self.inner();
            inner.state = ModelState::Uninitialized;
            inner.processors.clear();
            inner.occupied = 0;
        }
        Ok(())
    }

    pub fn destroy_sync(&mut self) -> ModelResult<()> {
        self.destroy()?;
        self.wait_for(|event| matches!(event, ModelEvent::Destroyed));
        Ok(())
    }

    /// Reclaim the budget of processors that are gone and deliver worker
    /// events to the observer.
    pub fn update(&mut self) {
        sweep(&mut self.inner(), &self.shared.released_rx);
        loop {
            let event = match &self.link {
                Some(link) => link.events.try_recv().ok(),
                None => None,
            };
            match event {
                Some(event) => self.dispatch(event),
                None => break,
            }
        }
    }

    fn wait_for(&mut self, done: impl Fn(&ModelEvent) -> bool) {
        let events = match &self.link {
            Some(link) => link.events.clone(),
            None => return,
        };
        while let Ok(event) = events.recv() {
            let finished = done(&event);
            self.dispatch(event);
            if finished {
                break;
            }
        }
    }

    fn dispatch(&mut self, event: ModelEvent) {
        match event {
            ModelEvent::Loaded(loaded) => {
                let Loaded {
                    weights,
                    metadata,
                    template,
                } = *loaded;
                {
                    let mut inner = self.inner();
                    inner.state = ModelState::Ready;
                    inner.weights = Some(weights);
                    inner.metadata = Some(metadata);
                    inner.template = Some(template);
                }
                self.observe(|o| o.on_initialize());
            }
            ModelEvent::LoadFailed(failure) => {
                {
                    let mut inner = self.inner();
                    inner.state = ModelState::Uninitialized;
                    inner.last_fail = Some(failure.clone());
                }
                self.observe(|o| o.on_initialize_fail(&failure));
            }
            ModelEvent::Destroyed => {
                {
                    let mut inner = self.inner();
                    inner.state = ModelState::Uninitialized;
                    inner.processors.clear();
                    inner.occupied = 0;
                    inner.metadata = None;
                    inner.template = None;
                }
                info!("model destroyed");
                self.observe(|o| o.on_destroy());
            }
        }
    }

    pub fn state(&self) -> ModelState {
        self.inner().state
    }

    pub fn metadata(&self) -> Option<ModelMetadata> {
        self.inner().metadata.clone()
    }

    pub fn chat_template(&self) -> Option<ChatTemplate> {
        self.inner().template.clone()
    }

    pub fn total_context_budget(&self) -> u32 {
        self.inner().total
    }

    /// Budget held by registrations, as of the last reclaim.
    pub fn occupied_context(&self) -> u32 {
        self.inner().occupied
    }

    pub fn available_context(&self) -> u32 {
        let inner = self.inner();
        inner.total.saturating_sub(inner.occupied)
    }

    /// Registered processors that still hold budget.
    pub fn processor_count(&self) -> usize {
        self.inner()
            .processors
            .iter()
            .filter(|p| !p.is_released())
            .count()
    }

    pub fn is_embedding_model(&self) -> bool {
        self.inner()
            .metadata
            .as_ref()
            .is_some_and(|m| m.is_embedding_model)
    }

    pub fn last_fail(&self) -> Option<InitFailure> {
        self.inner().last_fail.clone()
    }

    pub fn backend_name(&self) -> &str {
        self.shared.backend.name()
    }
}

impl fmt::Debug for Model {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner();
        f.debug_struct("Model")
            .field("state", &inner.state)
            .field("total", &inner.total)
            .field("occupied", &inner.occupied)
            .field("processors", &inner.processors.len())
            .finish()
    }
}

impl Drop for Model {
    fn drop(&mut self) {
        if self.state() == ModelState::Ready {
            let _ = self.destroy();
        }
        if self.state() == ModelState::Destroying {
            self.wait_for(|event| matches!(event, ModelEvent::Destroyed));
        }
    }
}

/// Drop registrations whose workers are gone and return their budget.
///
/// Release notices only matter to a destroy in flight, which waits on them.
/// Otherwise they are drained here: a worker sends its notice after its
/// lifecycle left the attached states, so its link goes in the same sweep.
fn sweep(inner: &mut ModelInner, released: &Receiver<Release>) {
    if inner.state != ModelState::Destroying {
        let drained = released.try_iter().count();
        if drained > 0 {
            debug!(drained, "release notices drained");
        }
    }
    let mut reclaimed = 0;
    inner.processors.retain(|p| {
        if p.is_released() {
            debug!(processor = p.id(), reserved = p.reserved(), "budget reclaimed");
            reclaimed += p.reserved();
            false
        } else {
            true
        }
    });
    inner.occupied = inner.occupied.saturating_sub(reclaimed);
}

fn check_registration(
    inner: &ModelInner,
    requested: u32,
    lifecycle: ProcessorLifecycle,
    embedder: bool,
) -> ModelResult<()> {
    match inner.state {
        ModelState::Ready => {}
        ModelState::Uninitialized => return Err(ModelError::NotInitialized),
        ModelState::Initializing => return Err(ModelError::Initializing),
        ModelState::Destroying => return Err(ModelError::Destroying),
    }
    if requested == 0 {
        return Err(ModelError::InvalidInput(
            "context length must be non-zero".to_string(),
        ));
    }
    if requested < MIN_CONTEXT_LENGTH {
        return Err(ModelError::InvalidContextLength {
            requested,
            minimum: MIN_CONTEXT_LENGTH,
        });
    }
    if lifecycle.is_attached() {
        return Err(ModelError::ProcessorAlreadyRegistered);
    }
    let embedding_model = inner
        .metadata
        .as_ref()
        .is_some_and(|m| m.is_embedding_model);
    if embedder && !embedding_model {
        return Err(ModelError::ProcessorKindMismatch(
            "model does not produce embeddings".to_string(),
        ));
    }
    if !embedder && embedding_model {
        return Err(ModelError::ProcessorKindMismatch(
            "embedding model cannot generate text".to_string(),
        ));
    }
    let available = inner.total.saturating_sub(inner.occupied);
    if requested > available {
        debug!(requested, available, "registration refused, context full");
        return Err(ModelError::ContextFull {
            requested,
            available,
        });
    }
    Ok(())
}

//! Model worker: loads weights, and on destroy waits for every processor
//! worker to let go of them before dropping the model's own handle.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender};
use llama_engine::{ComputeBackend, LlamaError, LoadParams, ModelMetadata, ModelWeights};
use llama_tokenizer::ChatTemplate;
use tracing::{debug, info, warn};

use crate::error::InitFailure;
use crate::processor::Release;

pub(crate) enum ModelCommand {
    Destroy {
        weights: Option<Arc<dyn ModelWeights>>,
        /// Registrations whose workers must exit first.
        pending: HashSet<Release>,
    },
}

pub(crate) struct Loaded {
    pub weights: Arc<dyn ModelWeights>,
    pub metadata: ModelMetadata,
    pub template: ChatTemplate,
}

pub(crate) enum ModelEvent {
    Loaded(Box<Loaded>),
    LoadFailed(InitFailure),
    Destroyed,
}

pub(crate) struct ModelSpawn {
    pub backend: Arc<dyn ComputeBackend>,
    pub path: PathBuf,
    pub params: LoadParams,
    pub commands: Receiver<ModelCommand>,
    pub events: Sender<ModelEvent>,
    pub released: Receiver<Release>,
}

pub(crate) fn run(spawn: ModelSpawn) {
    let ModelSpawn {
        backend,
        path,
        params,
        commands,
        events,
        released,
    } = spawn;

    match load(backend.as_ref(), &path, &params) {
        Ok(loaded) => {
            info!(
                name = %loaded.metadata.name,
                arch = %loaded.metadata.architecture,
                backend = backend.name(),
                "model loaded"
            );
            let _ = events.send(ModelEvent::Loaded(Box::new(loaded)));
        }
        Err(failure) => {
            warn!(path = %path.display(), error = %failure, "model load failed");
            let _ = events.send(ModelEvent::LoadFailed(failure));
            return;
        }
    }

    // The only command ends the worker. A closed channel means the model
    // handle is gone and nothing is left to wait for.
    if let Ok(ModelCommand::Destroy {
        weights,
        mut pending,
    }) = commands.recv()
    {
        debug!(processors = pending.len(), "waiting for processor workers");
        while !pending.is_empty() {
            match released.recv() {
                Ok(release) => {
                    pending.remove(&release);
                }
                Err(_) => break,
            }
        }
        drop(weights);
        let _ = events.send(ModelEvent::Destroyed);
    }
    debug!("model worker exited");
}

fn load(backend: &dyn ComputeBackend, path: &Path, params: &LoadParams) -> Result<Loaded, InitFailure> {
    if !path.exists() {
        return Err(InitFailure::PathNotFound(path.display().to_string()));
    }
    let metadata = backend.read_metadata(path).map_err(InitFailure::from)?;
    if metadata.architecture.is_empty() {
        return Err(InitFailure::MetadataMismatch(
            "missing architecture tag".to_string(),
        ));
    }
    let template = match ChatTemplate::for_architecture(&metadata.architecture) {
        Some(template) => template,
        None => {
            warn!(arch = %metadata.architecture, "no chat template for architecture, using plain delimiters");
            ChatTemplate::plain()
        }
    };
    let weights = backend.load(path, params).map_err(|e| match e {
        LlamaError::OutOfMemory(msg) => InitFailure::NotEnoughMemory(msg),
        other => InitFailure::BackendLoadError(other.to_string()),
    })?;
    Ok(Loaded {
        weights,
        metadata,
        template,
    })
}

//! Client contracts: the callbacks an application implements to receive
//! generated text or embedding vectors.
//!
//! A client is wrapped in a [`Client`] handle. The application keeps one
//! clone to read results back; the processor keeps another while the client
//! is bound. A client is bound to at most one processor at a time, and a
//! processor holds at most one client. Every callback runs on the thread
//! that called `update()`, `next()` or one of the `_sync` operations.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, TryLockError};

use llama_engine::TokenId;

use crate::processor::{EmbedderProcessor, FinishState, TextProcessor};

/// Receives the output of a [`TextProcessor`].
pub trait TextClient: Send {
    fn on_register(&mut self, _processor: &TextProcessor) {}

    /// The prompt was prefilled; `batch_len` tokens went through the model.
    fn on_batch_processed(&mut self, _processor: &TextProcessor, _batch_len: usize, _kv_locked: bool) {}

    fn on_write(
        &mut self,
        processor: &TextProcessor,
        text: &str,
        token: TokenId,
        is_control: bool,
        is_finished: bool,
    );

    fn on_finish(&mut self, _processor: &TextProcessor, _total_tokens: u32, _state: FinishState) {}

    fn on_unregister(&mut self) {}
}

/// Receives the output of an [`EmbedderProcessor`].
pub trait EmbedderClient: Send {
    fn on_register(&mut self, _processor: &EmbedderProcessor) {}

    fn on_batch_processed(&mut self, _processor: &EmbedderProcessor, _batch_len: usize) {}

    fn on_write(&mut self, processor: &EmbedderProcessor, vector: &[f32], index: usize, is_last: bool);

    fn on_finish(&mut self, _processor: &EmbedderProcessor, _total_elements: usize) {}

    fn on_unregister(&mut self) {}
}

/// Delivers `on_unregister` through a type-erased client.
pub(crate) trait Unbind {
    fn unbind(&mut self);
}

impl Unbind for dyn TextClient {
    fn unbind(&mut self) {
        self.on_unregister();
    }
}

impl Unbind for dyn EmbedderClient {
    fn unbind(&mut self) {
        self.on_unregister();
    }
}

/// An `on_unregister` waiting for the client lock.
type Deferred = Box<dyn FnOnce() + Send>;

fn take_deferred(slot: &Mutex<Option<Deferred>>) -> Option<Deferred> {
    slot.lock().unwrap_or_else(PoisonError::into_inner).take()
}

fn run_deferred(slot: &Mutex<Option<Deferred>>) {
    if let Some(unbind) = take_deferred(slot) {
        unbind();
    }
}

/// Shared storage behind a [`Client`] handle.
pub struct ClientCell<C: ?Sized> {
    /// Id of the processor the client is bound to, `0` when unbound.
    host: AtomicU64,
    /// Filled when the client was locked at release time. Whoever unlocks
    /// next runs it.
    deferred: Mutex<Option<Deferred>>,
    client: Mutex<C>,
}

impl<C: ?Sized> ClientCell<C> {
    pub(crate) fn host(&self) -> u64 {
        self.host.load(Ordering::Acquire)
    }

    /// Claim the cell for `processor`. Fails if another processor holds it.
    pub(crate) fn claim(&self, processor: u64) -> bool {
        match self
            .host
            .compare_exchange(0, processor, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => true,
            Err(current) => current == processor,
        }
    }

    fn lock(&self) -> MutexGuard<'_, C> {
        self.client.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<C: ?Sized + Unbind + Send + 'static> ClientCell<C> {
    /// Run a callback with exclusive access to the client.
    pub(crate) fn with<R>(&self, f: impl FnOnce(&mut C) -> R) -> R {
        let mut guard = self.lock();
        // A pending unbind belongs to an earlier binding.
        if take_deferred(&self.deferred).is_some() {
            guard.unbind();
        }
        let out = f(&mut guard);
        drop(guard);
        run_deferred(&self.deferred);
        out
    }

    /// Unbind and deliver `on_unregister`. If the client is locked, by a
    /// callback or by the application, the notification is delivered as
    /// soon as that lock is let go.
    pub(crate) fn release(cell: &Arc<Self>) {
        cell.host.store(0, Ordering::Release);
        let busy = match cell.client.try_lock() {
            Ok(mut guard) => {
                guard.unbind();
                false
            }
            Err(TryLockError::Poisoned(poisoned)) => {
                poisoned.into_inner().unbind();
                false
            }
            Err(TryLockError::WouldBlock) => true,
        };
        if !busy {
            return;
        }

        let weak = Arc::downgrade(cell);
        let unbind: Deferred = Box::new(move || {
            if let Some(cell) = weak.upgrade() {
                cell.lock().unbind();
            }
        });
        *cell.deferred.lock().unwrap_or_else(PoisonError::into_inner) = Some(unbind);
        // The holder may have unlocked before the slot was filled.
        let free = !matches!(cell.client.try_lock(), Err(TryLockError::WouldBlock));
        if free {
            run_deferred(&cell.deferred);
        }
    }
}

/// Identity of a client cell regardless of its concrete type.
pub(crate) fn cell_addr<C: ?Sized>(cell: &Arc<ClientCell<C>>) -> *const () {
    Arc::as_ptr(cell) as *const ()
}

/// Application-side handle to a client.
pub struct Client<C: ?Sized>(pub(crate) Arc<ClientCell<C>>);

impl<C> Client<C> {
    pub fn new(client: C) -> Self {
        Self(Arc::new(ClientCell {
            host: AtomicU64::new(0),
            deferred: Mutex::new(None),
            client: Mutex::new(client),
        }))
    }
}

impl<C: ?Sized> Client<C> {
    /// Access the client, e.g. to read what it collected.
    ///
    /// A processor that lets the client go while the guard is held delivers
    /// `on_unregister` when the guard is dropped.
    pub fn lock(&self) -> ClientGuard<'_, C> {
        ClientGuard {
            guard: self.0.lock(),
            _unlock: RunDeferred(&self.0.deferred),
        }
    }

    pub fn is_bound(&self) -> bool {
        self.0.host() != 0
    }
}

/// Exclusive access to a client, returned by [`Client::lock`].
pub struct ClientGuard<'a, C: ?Sized> {
    guard: MutexGuard<'a, C>,
    // Declared after `guard` so it drops once the client is unlocked.
    _unlock: RunDeferred<'a>,
}

struct RunDeferred<'a>(&'a Mutex<Option<Deferred>>);

impl Drop for RunDeferred<'_> {
    fn drop(&mut self) {
        run_deferred(self.0);
    }
}

impl<C: ?Sized> Deref for ClientGuard<'_, C> {
    type Target = C;

    fn deref(&self) -> &C {
        &self.guard
    }
}

impl<C: ?Sized> DerefMut for ClientGuard<'_, C> {
    fn deref_mut(&mut self) -> &mut C {
        &mut self.guard
    }
}

impl<C: ?Sized> Clone for Client<C> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<C: ?Sized> std::fmt::Debug for Client<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("host", &self.0.host())
            .finish()
    }
}

/*
 * Convenience core for the common wrapper shape: an object that owns exactly
 * one native handle for its whole life. Wrapper types embed a `NativeObject`
 * and delegate to it for registration state, disposal, thread affinity, and
 * marshaled invocation, so each individual wrapper only contributes its own
 * payload and methods.
 *
 * Disposal is idempotent behind an atomic test-and-set. Explicit `dispose`
 * runs the managed cleanup callbacks and then unregisters (which releases
 * the peer); the `Drop` path performs only the unregister/release half;
 * callbacks may touch other objects whose destruction order is unspecified,
 * exactly the restriction the original placed on finalization.
 */
use crate::affinity::ThreadAffinityGuard;
use crate::dispatcher::Dispatcher;
use crate::error::{BridgeError, Result as BridgeResult};
use crate::handle_registry::HandleRegistry;
use crate::invocation::InvocationHandle;
use crate::types::RawHandle;

use log::debug;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

type DisposeCallback = Box<dyn FnOnce() + Send>;

pub struct NativeObject {
    registry: Arc<HandleRegistry>,
    // Raw handle value; zeroed when the native reference is surrendered.
    handle: AtomicUsize,
    disposed: AtomicBool,
    affinity: ThreadAffinityGuard,
    dispose_callbacks: Mutex<Vec<DisposeCallback>>,
}

impl NativeObject {
    /// Builds the core around a non-null handle, binding thread affinity to
    /// the dispatcher of the constructing thread (unbound when constructed
    /// off any loop). Registration is the registry's job; wrappers go live
    /// through `HandleRegistry::register` or `get_or_create`.
    pub fn new(registry: Arc<HandleRegistry>, handle: RawHandle) -> BridgeResult<Self> {
        if handle.is_null() {
            return Err(BridgeError::InvalidHandle(
                "cannot construct a wrapper around a null handle".into(),
            ));
        }
        Ok(Self {
            registry,
            handle: AtomicUsize::new(handle.raw()),
            disposed: AtomicBool::new(false),
            affinity: ThreadAffinityGuard::bound_to_current(),
            dispose_callbacks: Mutex::new(Vec::new()),
        })
    }

    /// The owned handle; `ObjectDisposed` once `dispose` has run.
    pub fn handle(&self) -> BridgeResult<RawHandle> {
        self.check_disposed()?;
        Ok(RawHandle::from_raw(self.handle.load(Ordering::Acquire)))
    }

    pub fn registry(&self) -> &Arc<HandleRegistry> {
        &self.registry
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Guard for use at the top of wrapper methods: fails once the object
    /// has been disposed.
    pub fn check_disposed(&self) -> BridgeResult<()> {
        if self.is_disposed() {
            return Err(BridgeError::ObjectDisposed(
                "operation attempted on a disposed wrapper".into(),
            ));
        }
        Ok(())
    }

    /// Debug-build assertion flavor of `check_disposed`; compiles to nothing
    /// in release builds.
    #[inline]
    pub fn debug_check_disposed(&self) {
        debug_assert!(
            !self.is_disposed(),
            "operation attempted on a disposed wrapper"
        );
    }

    /// Registers a managed cleanup callback. Callbacks run on explicit
    /// `dispose` only, in registration order, before the native release;
    /// the `Drop` path never runs them.
    pub fn on_dispose(&self, callback: impl FnOnce() + Send + 'static) {
        self.dispose_callbacks.lock().push(Box::new(callback));
    }

    /*
     * Tears the wrapper down exactly once: managed callbacks, then
     * unregistration (which zeroes the embedded ID and releases the peer),
     * then the handle is cleared. Every call after the first is a no-op,
     * however the first call and a concurrent Drop may race, and the atomic swap
     * on `disposed` picks the single winner.
     * [PD-IdempotentDisposeV1]
     */
    pub fn dispose(&self) -> BridgeResult<()> {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let callbacks = std::mem::take(&mut *self.dispose_callbacks.lock());
        for callback in callbacks {
            callback();
        }

        let handle = RawHandle::from_raw(self.handle.swap(0, Ordering::AcqRel));
        if !handle.is_null() {
            self.registry.unregister(handle)?;
        }
        debug!("NativeObject: disposed wrapper for handle {handle:?}");
        Ok(())
    }

    // Affinity passthroughs; wrapper methods call `verify_access` first.

    pub fn check_access(&self) -> bool {
        self.affinity.check()
    }

    pub fn verify_access(&self) -> BridgeResult<()> {
        self.affinity.verify()
    }

    /// Drops thread affinity for good, e.g. when handing the object to
    /// teardown code after its owning loop has stopped.
    pub fn detach_affinity(&self) {
        self.affinity.detach();
    }

    fn owner_dispatcher(&self) -> BridgeResult<Option<Dispatcher>> {
        let Some(owner) = self.affinity.owner() else {
            return Ok(None);
        };
        match Dispatcher::for_id(owner) {
            Some(dispatcher) => Ok(Some(dispatcher)),
            None => Err(BridgeError::InvalidOperation(format!(
                "owning dispatcher {owner:?} is no longer running"
            ))),
        }
    }

    /// Runs `callable` on the owning dispatcher's thread and blocks for the
    /// result; free-threaded objects run it in place. The supported way to
    /// touch an affine wrapper from a background thread.
    pub fn invoke<R, F>(&self, callable: F) -> BridgeResult<R>
    where
        R: Send + 'static,
        F: FnOnce() -> R + Send + 'static,
    {
        self.check_disposed()?;
        match self.owner_dispatcher()? {
            Some(dispatcher) => dispatcher.invoke(callable),
            None => Ok(callable()),
        }
    }

    /// Fire-and-forget-with-later-join flavor of `invoke`. Fails for
    /// free-threaded objects, which have no backing dispatcher to queue on.
    pub fn begin_invoke<R, F>(&self, callable: F) -> BridgeResult<InvocationHandle<R>>
    where
        R: Send + 'static,
        F: FnOnce() -> R + Send + 'static,
    {
        self.check_disposed()?;
        match self.owner_dispatcher()? {
            Some(dispatcher) => dispatcher.begin_invoke(callable),
            None => Err(BridgeError::InvalidOperation(
                "free-threaded object has no backing dispatcher".into(),
            )),
        }
    }
}

impl Drop for NativeObject {
    /*
     * Release-only fallback for wrappers that were never explicitly
     * disposed: surrender the native reference but skip managed callbacks.
     * For already-disposed wrappers the swap loses and this is a no-op.
     */
    fn drop(&mut self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        let handle = RawHandle::from_raw(self.handle.swap(0, Ordering::AcqRel));
        if !handle.is_null() {
            if let Err(e) = self.registry.unregister(handle) {
                log::warn!("NativeObject: release-only cleanup failed for {handle:?}: {e}");
            }
        }
    }
}

impl std::fmt::Debug for NativeObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeObject")
            .field("handle", &RawHandle::from_raw(self.handle.load(Ordering::Acquire)))
            .field("disposed", &self.is_disposed())
            .field("owner", &self.affinity.owner())
            .finish()
    }
}

/*
 * The handle registry: maps small integer IDs to live wrapper objects and
 * embeds the ID on the native peer itself through the backend's user-id
 * slot. Recovering "the wrapper for this native pointer" is then a field
 * read plus a dense-table lookup, with no hashing of pointer values, and no ABA
 * hazard from pointer reuse after native deallocation, because the embedded
 * ID is zeroed synchronously with unregistration.
 *
 * The registry also drives the native side's reference counting: each
 * registration and each `get_or_create` recovery adds one retaining edge so
 * the peer survives as long as either memory domain still references it.
 *
 * Lock discipline: the table mutex is short-held and is never held across a
 * backend retain/release or across dropping a wrapper Arc, since native teardown
 * and wrapper Drop may both re-enter the registry.
 */
use crate::error::{BridgeError, Result as BridgeResult};
use crate::id_allocator::IdAllocator;
use crate::native_backend::NativeBackend;
use crate::types::RawHandle;

use log::{debug, warn};
use parking_lot::Mutex;
use std::any::Any;
use std::sync::Arc;

/// Type-erased shared reference to a registered wrapper. The registry's
/// clone is the one that keeps the wrapper reachable for native-side
/// recovery until `unregister` runs.
pub type WrapperRef = Arc<dyn Any + Send + Sync>;

struct RegistryEntry {
    handle: RawHandle,
    wrapper: WrapperRef,
}

pub struct HandleRegistry {
    backend: Arc<dyn NativeBackend>,
    table: Mutex<IdAllocator<RegistryEntry>>,
    // Serializes the resolve-miss-then-create window of `get_or_create` so
    // two threads adopting the same handle race to exactly one wrapper.
    creation: Mutex<()>,
}

impl HandleRegistry {
    pub fn new(backend: Arc<dyn NativeBackend>) -> Arc<Self> {
        Arc::new(Self {
            backend,
            table: Mutex::new(IdAllocator::new()),
            creation: Mutex::new(()),
        })
    }

    pub fn backend(&self) -> &Arc<dyn NativeBackend> {
        &self.backend
    }

    /*
     * Associates `wrapper` with `handle`: allocates an ID, stores the entry,
     * writes the ID into the peer's user-id slot, and retains the peer.
     * Fails on null handles and on handles that already carry a non-zero ID
     * (double registration without an intervening unregister).
     */
    pub fn register(&self, handle: RawHandle, wrapper: WrapperRef) -> BridgeResult<u32> {
        if handle.is_null() {
            return Err(BridgeError::InvalidHandle(
                "cannot register a null handle".into(),
            ));
        }

        let id = {
            let mut table = self.table.lock();
            let existing = self.backend.read_user_id(handle);
            if existing != 0 {
                warn!("HandleRegistry: handle {handle:?} already registered as id {existing}");
                return Err(BridgeError::InvalidOperation(format!(
                    "handle {handle:?} is already registered (id {existing})"
                )));
            }
            let id = table.allocate(RegistryEntry { handle, wrapper });
            self.backend.write_user_id(handle, id);
            id
        };

        self.backend.retain(handle);
        debug!("HandleRegistry: registered handle {handle:?} as id {id}");
        Ok(id)
    }

    /// Recovers the wrapper registered for `handle`, if any. Null handles
    /// and handles whose embedded ID is zero (or stale) answer `None`; this
    /// path never errors and never allocates beyond the returned Arc clone.
    pub fn resolve(&self, handle: RawHandle) -> Option<WrapperRef> {
        if handle.is_null() {
            return None;
        }
        let id = self.backend.read_user_id(handle);
        if id == 0 {
            return None;
        }
        self.table.lock().get(id).map(|entry| entry.wrapper.clone())
    }

    /// `resolve` narrowed to a concrete wrapper type. Answers `None` both
    /// for unregistered handles and for registered wrappers of another type.
    pub fn resolve_as<W: Any + Send + Sync>(&self, handle: RawHandle) -> Option<Arc<W>> {
        self.resolve(handle)
            .and_then(|wrapper| wrapper.downcast::<W>().ok())
    }

    /*
     * Returns the wrapper for `handle`, constructing one through `factory`
     * when none is registered. A resolve hit retains the peer again; the
     * caller now holds a new strong edge; a miss registers the factory's
     * wrapper, which carries the registration's own retaining edge.
     * [PD-HandleAdoptionV1]
     */
    pub fn get_or_create<W, F>(&self, handle: RawHandle, factory: F) -> BridgeResult<Arc<W>>
    where
        W: Any + Send + Sync,
        F: FnOnce(RawHandle) -> BridgeResult<Arc<W>>,
    {
        if handle.is_null() {
            return Err(BridgeError::InvalidHandle(
                "cannot adopt a null handle".into(),
            ));
        }

        let _creating = self.creation.lock();

        if let Some(existing) = self.resolve(handle) {
            let wrapper = existing.downcast::<W>().map_err(|_| {
                BridgeError::InvalidOperation(format!(
                    "handle {handle:?} is registered with a different wrapper type"
                ))
            })?;
            self.backend.retain(handle);
            debug!("HandleRegistry: recovered existing wrapper for handle {handle:?}");
            return Ok(wrapper);
        }

        let wrapper = factory(handle)?;
        self.register(handle, wrapper.clone())?;
        Ok(wrapper)
    }

    /*
     * Reverses one successful `register`: zeroes the embedded ID and frees
     * the slot under the table lock, then releases the peer outside it. A
     * handle whose embedded ID is already zero is a warned no-op, which is
     * what defends the dispose-then-drop race: only the first caller acts.
     */
    pub fn unregister(&self, handle: RawHandle) -> BridgeResult<()> {
        if handle.is_null() {
            return Err(BridgeError::InvalidHandle(
                "cannot unregister a null handle".into(),
            ));
        }

        let removed = {
            let mut table = self.table.lock();
            let id = self.backend.read_user_id(handle);
            if id == 0 {
                warn!("HandleRegistry: unregister on unregistered handle {handle:?}");
                return Ok(());
            }
            self.backend.write_user_id(handle, 0);
            let entry = table.free(id);
            if let Some(entry) = &entry {
                // A mismatch means the embedded ID pointed at a recycled
                // slot, i.e. a stale handle was passed after its release.
                debug_assert_eq!(
                    entry.handle, handle,
                    "embedded ID {id} belongs to a different handle"
                );
            }
            entry
        };

        self.backend.release(handle);
        debug!("HandleRegistry: unregistered handle {handle:?}");
        // The wrapper Arc drops here, after the lock is gone; if this was
        // the last reference its Drop may re-enter the registry safely.
        drop(removed);
        Ok(())
    }

    /// Number of currently registered wrappers.
    pub fn live_count(&self) -> usize {
        self.table.lock().live_count()
    }
}

/*
 * Per-object thread-affinity tracking. An affine object records the
 * dispatcher of the thread that constructed it; every public method on such
 * an object is expected to call `verify` first, so a background thread that
 * touches it directly gets an immediate `WrongThread` error instead of a
 * silent data race inside the native peer.
 *
 * The association is one-way: bound at construction, optionally severed by
 * `detach` (for teardown code that runs after the owning loop has stopped).
 * Re-binding to a different dispatcher is deliberately unsupported: it
 * would invalidate every outstanding reference to the object.
 */
use crate::dispatcher::current_dispatcher_id;
use crate::error::{BridgeError, Result as BridgeResult};
use crate::types::DispatcherId;

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug)]
pub struct ThreadAffinityGuard {
    // Raw dispatcher ID; zero encodes "unbound" (free-threaded).
    owner: AtomicU64,
}

impl ThreadAffinityGuard {
    /// Binds to the dispatcher whose loop is draining on the calling
    /// thread. Objects constructed off any loop come out unbound and are
    /// treated as free-threaded.
    pub fn bound_to_current() -> Self {
        let owner = current_dispatcher_id().map(DispatcherId::raw).unwrap_or(0);
        Self {
            owner: AtomicU64::new(owner),
        }
    }

    pub fn unbound() -> Self {
        Self {
            owner: AtomicU64::new(0),
        }
    }

    pub fn owner(&self) -> Option<DispatcherId> {
        DispatcherId::from_raw(self.owner.load(Ordering::Acquire))
    }

    /// Non-throwing affinity test: true when unbound or when the calling
    /// thread is the owning dispatcher's loop thread.
    pub fn check(&self) -> bool {
        match self.owner() {
            None => true,
            owner => owner == current_dispatcher_id(),
        }
    }

    /// Throwing counterpart of `check`; the first line of every thread-
    /// affine public method.
    pub fn verify(&self) -> BridgeResult<()> {
        if self.check() {
            return Ok(());
        }
        Err(BridgeError::WrongThread(format!(
            "object owned by dispatcher {:?} was accessed from {}",
            self.owner(),
            match current_dispatcher_id() {
                Some(id) => format!("dispatcher {id:?}"),
                None => "a non-dispatcher thread".to_string(),
            }
        )))
    }

    /// Severs the association; the object is free-threaded from here on.
    pub fn detach(&self) {
        self.owner.store(0, Ordering::Release);
    }
}

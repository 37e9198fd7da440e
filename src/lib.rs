/*
 * Provides the public entry point for the PeerDuct crate, the object-lifetime
 * and thread-marshaling core shared by native widget wrappers. This module
 * wires together the handle registry (integer-ID association between wrapper
 * objects and native peers), the thread-affinity guard, the dispatcher run
 * loop, and the invocation bridge so a UI toolkit can treat cross-boundary
 * lifetime and cross-thread calls as a single dependency.
 *
 * The library exposes only the safe API surface (`HandleRegistry`,
 * `NativeObject`, `Dispatcher`, etc.) while keeping the slot table and queue
 * internals scoped to the crate. The native side is abstracted behind the
 * `NativeBackend` trait (a user-id slot plus retain/release) so the core
 * compiles and tests on every platform without a widget library present.
 */
pub mod affinity;
pub(crate) mod dispatcher;
pub mod error;
pub(crate) mod handle_registry;
pub(crate) mod id_allocator;
pub(crate) mod invocation;
pub(crate) mod native_backend;
pub(crate) mod native_object;
pub mod types;

pub use affinity::ThreadAffinityGuard;
pub use dispatcher::{Dispatcher, RunLoop, SpawnedDispatcher, current_dispatcher_id};
pub use error::{BridgeError, Result as BridgeResult};
pub use handle_registry::{HandleRegistry, WrapperRef};
pub use invocation::InvocationHandle;
pub use native_backend::NativeBackend;
pub use native_object::NativeObject;
pub use types::{DispatcherId, RawHandle};

/*
 * Defines the error type shared by every component of the crate. The taxonomy
 * is deliberately small: thread-affinity violations, use-after-dispose, and
 * operations attempted against a registry or dispatcher that cannot honor
 * them. Panics raised by marshaled callables are not represented here; they
 * are transported through the invocation outcome and resumed at the join
 * point so the caller sees the original payload.
 */
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BridgeError {
    /// An affine object was touched from a thread that does not own it.
    #[error("wrong thread: {0}")]
    WrongThread(String),

    /// An operation was attempted after `dispose()` ran.
    #[error("object disposed: {0}")]
    ObjectDisposed(String),

    /// The registry or dispatcher cannot perform the request in its current
    /// state (double registration, stopped run loop, missing dispatcher).
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// A null or otherwise unusable native handle was passed in.
    #[error("invalid handle: {0}")]
    InvalidHandle(String),
}

pub type Result<T> = std::result::Result<T, BridgeError>;

/*
 * Platform-agnostic value types used across the crate: the opaque native
 * handle and the identity of a dispatcher's run loop. Both are thin newtypes
 * so they can cross module boundaries (and logs) without exposing what the
 * native side actually stores behind them.
 */

/// Opaque pointer-sized reference to a native-side resource. A value of
/// `RawHandle::NULL` means "no resource"; at most one wrapper owns a given
/// non-null handle at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RawHandle(usize);

impl RawHandle {
    pub const NULL: RawHandle = RawHandle(0);

    pub fn from_raw(raw: usize) -> Self {
        RawHandle(raw)
    }

    pub fn raw(self) -> usize {
        self.0
    }

    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

/// Identity of one dispatcher (one single-threaded run loop). IDs are
/// process-unique and never reused; the zero value is reserved internally
/// for "no dispatcher" and never appears in a `DispatcherId`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DispatcherId(u64);

impl DispatcherId {
    pub(crate) fn from_raw(raw: u64) -> Option<Self> {
        (raw != 0).then_some(DispatcherId(raw))
    }

    pub(crate) fn raw(self) -> u64 {
        self.0
    }
}

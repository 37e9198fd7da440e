/*
 * The collaborator contract this core requires from the native layer. The
 * registry deliberately depends on nothing else from the native side: a
 * small integer "user id" slot it can read and write on a peer, and the
 * peer's reference count. Posting work onto a run loop is covered by the
 * `dispatcher` module and is not part of this trait.
 *
 * A production backend forwards these to the real widget library (the user
 * data word and refcount of the peer object). Tests use `FakeBackend`, an
 * in-process table of peers with the same observable behavior.
 */
use crate::types::RawHandle;

pub trait NativeBackend: Send + Sync + 'static {
    /// Reads the user-id slot of `handle`. Zero means "no wrapper registered".
    fn read_user_id(&self, handle: RawHandle) -> u32;

    /// Writes the user-id slot of `handle`. Writing zero detaches the peer
    /// from its registry entry.
    fn write_user_id(&self, handle: RawHandle, id: u32);

    /// Increments the peer's reference count so it survives while the
    /// registry (or any other edge) holds it.
    fn retain(&self, handle: RawHandle);

    /// Decrements the peer's reference count; the native side frees the peer
    /// when it reaches zero.
    fn release(&self, handle: RawHandle);
}

#[cfg(test)]
pub(crate) mod fake {
    /*
     * In-process stand-in for the native side: each peer is a refcounted
     * table entry with a user-id slot. Peers start unowned (refcount zero)
     * and are removed from the table when a release drops the count back to
     * zero, which lets tests observe "native deallocation" directly.
     */
    use super::NativeBackend;
    use crate::types::RawHandle;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Default)]
    struct FakePeer {
        user_id: u32,
        refcount: u32,
    }

    #[derive(Default)]
    pub(crate) struct FakeBackend {
        peers: Mutex<HashMap<usize, FakePeer>>,
        next_address: AtomicUsize,
    }

    impl FakeBackend {
        pub(crate) fn new() -> Self {
            Self {
                peers: Mutex::new(HashMap::new()),
                // Arbitrary non-zero base so handles look like addresses.
                next_address: AtomicUsize::new(0x1000),
            }
        }

        pub(crate) fn create_peer(&self) -> RawHandle {
            let address = self.next_address.fetch_add(0x10, Ordering::Relaxed);
            self.peers.lock().insert(address, FakePeer::default());
            RawHandle::from_raw(address)
        }

        pub(crate) fn refcount_of(&self, handle: RawHandle) -> u32 {
            self.peers
                .lock()
                .get(&handle.raw())
                .map(|peer| peer.refcount)
                .unwrap_or(0)
        }

        pub(crate) fn peer_exists(&self, handle: RawHandle) -> bool {
            self.peers.lock().contains_key(&handle.raw())
        }
    }

    impl NativeBackend for FakeBackend {
        fn read_user_id(&self, handle: RawHandle) -> u32 {
            self.peers
                .lock()
                .get(&handle.raw())
                .map(|peer| peer.user_id)
                .unwrap_or(0)
        }

        fn write_user_id(&self, handle: RawHandle, id: u32) {
            if let Some(peer) = self.peers.lock().get_mut(&handle.raw()) {
                peer.user_id = id;
            }
        }

        fn retain(&self, handle: RawHandle) {
            if let Some(peer) = self.peers.lock().get_mut(&handle.raw()) {
                peer.refcount += 1;
            }
        }

        fn release(&self, handle: RawHandle) {
            let mut peers = self.peers.lock();
            let Some(peer) = peers.get_mut(&handle.raw()) else {
                log::error!("FakeBackend: release on unknown peer {handle:?}");
                return;
            };
            assert!(peer.refcount > 0, "FakeBackend: over-release of {handle:?}");
            peer.refcount -= 1;
            if peer.refcount == 0 {
                peers.remove(&handle.raw());
            }
        }
    }
}

/*
 * Dense small-integer ID allocation backing the handle registry. IDs are
 * slot indices offset by one so that zero can mean "unregistered" in the
 * native side's user-id field. Freed slots go onto a freelist and are handed
 * out again first, which keeps the ID space bounded by the peak number of
 * concurrently live handles rather than by lifetime totals.
 */
use log::error;

/// Highest ID this allocator will ever hand out. Running into this limit
/// means native handles are leaking; wrapping around instead would alias two
/// live objects, so exhaustion is fatal.
const MAX_ID: u32 = u32::MAX - 1;

#[derive(Debug)]
pub(crate) struct IdAllocator<T> {
    slots: Vec<Option<T>>,
    freelist: Vec<u32>,
}

impl<T> IdAllocator<T> {
    pub(crate) fn new() -> Self {
        Self {
            slots: Vec::new(),
            freelist: Vec::new(),
        }
    }

    /// Stores `data` and returns its ID (always >= 1). Recycled IDs from the
    /// freelist are preferred over growing the slot table.
    pub(crate) fn allocate(&mut self, data: T) -> u32 {
        if let Some(id) = self.freelist.pop() {
            let slot = &mut self.slots[(id - 1) as usize];
            debug_assert!(slot.is_none(), "freelist pointed at an occupied slot");
            *slot = Some(data);
            return id;
        }

        if self.slots.len() as u64 >= MAX_ID as u64 {
            // [PD-IdExhaustionFatalV1] Exhaustion indicates a native handle
            // leak and must surface loudly rather than wrap around.
            error!("IdAllocator: ID space exhausted at {} live slots", self.slots.len());
            panic!("IdAllocator: ID space exhausted; native handles are leaking");
        }

        self.slots.push(Some(data));
        self.slots.len() as u32
    }

    /// Releases `id` and returns its data. Unknown or already-freed IDs are a
    /// no-op returning `None`: a dispose racing a wrapper drop may legally
    /// free the same ID twice, and only the first free may act. Debug builds
    /// assert so genuine double-free bugs still surface during development.
    pub(crate) fn free(&mut self, id: u32) -> Option<T> {
        let Some(slot) = id
            .checked_sub(1)
            .and_then(|index| self.slots.get_mut(index as usize))
        else {
            debug_assert!(id == 0, "IdAllocator::free called with out-of-range ID {id}");
            return None;
        };

        let data = slot.take();
        if data.is_some() {
            self.freelist.push(id);
        } else {
            debug_assert!(false, "IdAllocator::free called twice for ID {id}");
        }
        data
    }

    /// Looks up the data stored under `id`. Unknown IDs return `None`; this
    /// is the "no wrapper exists for this native pointer" answer, never an
    /// error.
    pub(crate) fn get(&self, id: u32) -> Option<&T> {
        id.checked_sub(1)
            .and_then(|index| self.slots.get(index as usize))
            .and_then(Option::as_ref)
    }

    pub(crate) fn live_count(&self) -> usize {
        self.slots.len() - self.freelist.len()
    }
}

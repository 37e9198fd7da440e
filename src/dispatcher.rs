/*
 * The dispatcher: one distinguished thread runs a cooperative loop draining
 * a FIFO work queue, and any other thread may post zero-argument thunks onto
 * it. This is the crate's replacement for the Win32 message pump the wrapped
 * toolkits normally provide: `post` plays the role of `PostMessage` and
 * `post_quit` the role of `PostQuitMessage`.
 *
 * A process-wide table maps live `DispatcherId`s to their queue senders so
 * that an affinity guard's owner ID can be turned back into a postable
 * dispatcher (`Dispatcher::for_id`). Entries are removed when the loop
 * exits; posting to a stopped dispatcher fails instead of queueing forever.
 */
use crate::error::{BridgeError, Result as BridgeResult};
use crate::types::DispatcherId;

use crossbeam_channel::{Receiver, Sender, unbounded};
use log::{debug, warn};
use parking_lot::Mutex;
use std::cell::Cell;
use std::collections::HashMap;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::JoinHandle;

enum Message {
    Run(Box<dyn FnOnce() + Send>),
    Quit,
}

static NEXT_DISPATCHER_ID: AtomicU64 = AtomicU64::new(1);

fn live_dispatchers() -> &'static Mutex<HashMap<u64, Sender<Message>>> {
    static LIVE: OnceLock<Mutex<HashMap<u64, Sender<Message>>>> = OnceLock::new();
    LIVE.get_or_init(|| Mutex::new(HashMap::new()))
}

thread_local! {
    // Dispatcher ID published while a run loop is draining on this thread;
    // zero when the thread is an ordinary preemptive thread.
    static CURRENT_DISPATCHER: Cell<u64> = const { Cell::new(0) };
}

/// The dispatcher whose run loop is draining on the calling thread, if any.
pub fn current_dispatcher_id() -> Option<DispatcherId> {
    DispatcherId::from_raw(CURRENT_DISPATCHER.get())
}

/// Cloneable posting handle for one run loop.
#[derive(Clone)]
pub struct Dispatcher {
    id: DispatcherId,
    queue: Sender<Message>,
}

impl Dispatcher {
    /// Creates a dispatcher and the run loop that services it. The loop is
    /// inert until some thread calls `RunLoop::run`.
    pub fn new() -> (Dispatcher, RunLoop) {
        let raw_id = NEXT_DISPATCHER_ID.fetch_add(1, Ordering::Relaxed);
        let id = DispatcherId::from_raw(raw_id)
            .unwrap_or_else(|| unreachable!("dispatcher ID counter starts at 1"));
        let (tx, rx) = unbounded();
        live_dispatchers().lock().insert(raw_id, tx.clone());
        debug!("Dispatcher: created {id:?}");
        (Dispatcher { id, queue: tx }, RunLoop { id, queue: rx })
    }

    /// Runs a dispatcher loop on a named background thread. The returned
    /// guard posts quit and joins the thread when shut down or dropped.
    pub fn spawn(name: &str) -> BridgeResult<SpawnedDispatcher> {
        let (dispatcher, run_loop) = Dispatcher::new();
        let thread = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || run_loop.run())
            .map_err(|e| {
                BridgeError::InvalidOperation(format!("failed to spawn dispatcher thread: {e}"))
            })?;
        Ok(SpawnedDispatcher {
            dispatcher,
            thread: Some(thread),
        })
    }

    /// Recovers a postable handle from an owner ID recorded by an affinity
    /// guard. Returns `None` once that dispatcher's loop has exited.
    pub fn for_id(id: DispatcherId) -> Option<Dispatcher> {
        live_dispatchers()
            .lock()
            .get(&id.raw())
            .map(|queue| Dispatcher {
                id,
                queue: queue.clone(),
            })
    }

    pub fn id(&self) -> DispatcherId {
        self.id
    }

    /// True when the calling thread is the one draining this dispatcher's
    /// run loop, i.e. no marshaling is needed to touch objects it owns.
    pub fn is_current(&self) -> bool {
        current_dispatcher_id() == Some(self.id)
    }

    /// Fire-and-forget enqueue of a thunk for the next loop iteration.
    /// Thunks from any number of threads execute in enqueue order.
    pub fn post(&self, thunk: impl FnOnce() + Send + 'static) -> BridgeResult<()> {
        self.post_message(Message::Run(Box::new(thunk)))
    }

    /// Asks the run loop to exit after the thunks already queued ahead of
    /// this message have executed.
    pub fn post_quit(&self) -> BridgeResult<()> {
        debug!("Dispatcher: posting quit to {:?}", self.id);
        self.post_message(Message::Quit)
    }

    fn post_message(&self, message: Message) -> BridgeResult<()> {
        self.queue.send(message).map_err(|_| {
            BridgeError::InvalidOperation(format!("dispatcher {:?} is not running", self.id))
        })
    }
}

/// Receiving half of a dispatcher; drains the queue on whichever thread
/// calls `run`.
pub struct RunLoop {
    id: DispatcherId,
    queue: Receiver<Message>,
}

impl RunLoop {
    /// Drains the queue on the calling thread until a quit message arrives
    /// or every `Dispatcher` handle has been dropped. While running, the
    /// dispatcher ID is published in a thread-local so affinity guards
    /// constructed on this thread bind to it.
    pub fn run(self) {
        debug!("Dispatcher: run loop for {:?} starting", self.id);
        CURRENT_DISPATCHER.set(self.id.raw());

        while let Ok(message) = self.queue.recv() {
            match message {
                Message::Run(thunk) => thunk(),
                Message::Quit => break,
            }
        }

        CURRENT_DISPATCHER.set(0);
        debug!("Dispatcher: run loop for {:?} exited", self.id);
        // Deregister before the queue drops so `for_id` cannot hand out a
        // sender whose messages would never run. Thunks still queued are
        // dropped with the receiver; pending invocations observe that drop
        // and fail their joiners instead of hanging them.
    }
}

impl Drop for RunLoop {
    fn drop(&mut self) {
        live_dispatchers().lock().remove(&self.id.raw());
    }
}

/// A dispatcher running on a dedicated background thread.
pub struct SpawnedDispatcher {
    dispatcher: Dispatcher,
    thread: Option<JoinHandle<()>>,
}

impl SpawnedDispatcher {
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Posts quit and joins the loop thread.
    pub fn shutdown(mut self) {
        self.shutdown_inner();
    }

    fn shutdown_inner(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };
        // The loop may already have exited (explicit post_quit); a failed
        // post then just means there is nothing left to stop.
        let _ = self.dispatcher.post_quit();
        if thread.join().is_err() {
            warn!(
                "Dispatcher: loop thread for {:?} terminated by panic",
                self.dispatcher.id
            );
        }
    }
}

impl Drop for SpawnedDispatcher {
    fn drop(&mut self) {
        self.shutdown_inner();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;

    #[test]
    fn test_current_dispatcher_published_while_running() {
        let (dispatcher, run_loop) = Dispatcher::new();
        let (id_tx, id_rx) = mpsc::channel();

        dispatcher
            .post(move || {
                let _ = id_tx.send(current_dispatcher_id());
            })
            .unwrap();
        dispatcher.post_quit().unwrap();

        let id = dispatcher.id();
        let handle = std::thread::spawn(move || run_loop.run());
        assert_eq!(id_rx.recv().unwrap(), Some(id));
        handle.join().unwrap();

        // Off-loop threads have no current dispatcher.
        assert_eq!(current_dispatcher_id(), None);
    }

    #[test]
    // [PD-DispatcherFifoV1] Thunks posted from several threads run on the
    // loop thread in enqueue order.
    fn test_posted_thunks_run_in_fifo_order() {
        let spawned = Dispatcher::spawn("fifo-test").unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));

        for n in 0..20usize {
            let order = order.clone();
            spawned
                .dispatcher()
                .post(move || order.lock().push(n))
                .unwrap();
        }

        let (done_tx, done_rx) = mpsc::channel();
        spawned
            .dispatcher()
            .post(move || {
                let _ = done_tx.send(());
            })
            .unwrap();
        done_rx.recv().unwrap();

        assert_eq!(*order.lock(), (0..20).collect::<Vec<_>>());
        spawned.shutdown();
    }

    #[test]
    fn test_post_after_shutdown_fails() {
        let spawned = Dispatcher::spawn("stopped-test").unwrap();
        let dispatcher = spawned.dispatcher().clone();
        spawned.shutdown();

        let result = dispatcher.post(|| {});
        assert!(matches!(result, Err(BridgeError::InvalidOperation(_))));
        assert!(Dispatcher::for_id(dispatcher.id()).is_none());
    }

    #[test]
    fn test_for_id_finds_live_dispatcher() {
        let spawned = Dispatcher::spawn("for-id-test").unwrap();
        let id = spawned.dispatcher().id();

        let found = Dispatcher::for_id(id).expect("dispatcher should be live");
        let counter = Arc::new(AtomicUsize::new(0));
        let c = counter.clone();
        let (done_tx, done_rx) = mpsc::channel();
        found
            .post(move || {
                c.fetch_add(1, Ordering::SeqCst);
                let _ = done_tx.send(());
            })
            .unwrap();
        done_rx.recv().unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        spawned.shutdown();
    }
}

/*
 * Call marshaling onto a dispatcher thread. `begin_invoke` enqueues a thunk
 * that runs the callable under `catch_unwind`, records the outcome, and
 * completes the invocation; `end_invoke` blocks the joining thread on a
 * lazily-created completion event and then yields the value or resumes the
 * callable's panic. `invoke` is the blocking composition of the two, short-
 * circuiting to an in-place call when the caller already is the loop thread.
 *
 * A panic inside a marshaled callable is never lost and never unwinds the
 * dispatcher's loop: it travels through the invocation outcome verbatim and
 * re-raises on the thread that joins. Thunks still queued when the loop
 * exits complete their invocations with an error so no joiner hangs.
 */
use crate::dispatcher::Dispatcher;
use crate::error::{BridgeError, Result as BridgeResult};

use log::trace;
use parking_lot::{Condvar, Mutex};
use std::panic::{AssertUnwindSafe, catch_unwind, resume_unwind};
use std::sync::Arc;

/// Manual-reset event the joining thread parks on.
struct CompletionEvent {
    signaled: Mutex<bool>,
    condvar: Condvar,
}

impl CompletionEvent {
    fn new(signaled: bool) -> Self {
        Self {
            signaled: Mutex::new(signaled),
            condvar: Condvar::new(),
        }
    }

    fn set(&self) {
        *self.signaled.lock() = true;
        self.condvar.notify_all();
    }

    fn wait(&self) {
        let mut signaled = self.signaled.lock();
        while !*signaled {
            self.condvar.wait(&mut signaled);
        }
    }
}

/// What the dispatcher thread hands back through an invocation: the
/// callable's return value, its panic payload, or the bridge-level reason
/// the callable never ran.
type Outcome<R> = BridgeResult<std::thread::Result<R>>;

struct InvocationState<R> {
    completed: bool,
    outcome: Option<Outcome<R>>,
    wait_event: Option<Arc<CompletionEvent>>,
}

struct Invocation<R> {
    state: Mutex<InvocationState<R>>,
}

impl<R> Invocation<R> {
    fn new() -> Self {
        Self {
            state: Mutex::new(InvocationState {
                completed: false,
                outcome: None,
                wait_event: None,
            }),
        }
    }

    fn is_completed(&self) -> bool {
        self.state.lock().completed
    }

    /// Records the outcome and flips `completed` exactly once, signaling the
    /// wait event if one was materialized before completion.
    fn complete(&self, outcome: Outcome<R>) {
        let event = {
            let mut state = self.state.lock();
            debug_assert!(!state.completed, "invocation completed twice");
            state.completed = true;
            state.outcome = Some(outcome);
            state.wait_event.clone()
        };
        if let Some(event) = event {
            event.set();
        }
    }

    /*
     * Materializes the wait event on first request. Checking `completed`
     * under the same lock that `complete` takes decides whether the fresh
     * event must be pre-signaled, so a completion racing with the first
     * join can never strand the waiter on an unsignaled event.
     * [PD-LazyWaitEventV1]
     */
    fn wait_handle(&self) -> Arc<CompletionEvent> {
        let mut state = self.state.lock();
        if let Some(event) = &state.wait_event {
            return event.clone();
        }
        let event = Arc::new(CompletionEvent::new(state.completed));
        state.wait_event = Some(event.clone());
        event
    }

    fn take_outcome(&self) -> Option<Outcome<R>> {
        self.state.lock().outcome.take()
    }
}

/// Join handle for one marshaled call, returned by `begin_invoke`.
pub struct InvocationHandle<R> {
    invocation: Arc<Invocation<R>>,
}

impl<R> InvocationHandle<R> {
    /// True once the dispatcher thread has finished (or abandoned) the
    /// callable. Non-blocking; may be polled repeatedly.
    pub fn is_completed(&self) -> bool {
        self.invocation.is_completed()
    }

    /// Blocks until the invocation completes, without collecting the
    /// outcome. Safe to call any number of times.
    pub fn wait(&self) {
        if self.invocation.is_completed() {
            return;
        }
        self.invocation.wait_handle().wait();
    }

    /// Blocks until completion, then yields the callable's return value.
    /// A panic raised by the callable resumes here, on the joining thread.
    /// Consuming `self` makes a second join unrepresentable, which stands in
    /// for the original's idempotent re-read of completed state.
    pub fn end_invoke(self) -> BridgeResult<R> {
        self.wait();
        let outcome = self.invocation.take_outcome().ok_or_else(|| {
            BridgeError::InvalidOperation("invocation outcome already collected".into())
        })?;
        match outcome? {
            Ok(value) => Ok(value),
            Err(panic_payload) => resume_unwind(panic_payload),
        }
    }
}

/*
 * Owns the callable between enqueue and execution. If the run loop exits
 * before the thunk runs, the queued message is dropped with the receiver;
 * this guard's Drop then completes the invocation with an error so the
 * joining thread unblocks instead of waiting forever.
 */
struct PendingInvocation<R, F> {
    invocation: Arc<Invocation<R>>,
    callable: Option<F>,
}

impl<R, F: FnOnce() -> R> PendingInvocation<R, F> {
    fn run(mut self) {
        let Some(callable) = self.callable.take() else {
            debug_assert!(false, "pending invocation ran twice");
            return;
        };
        let result = catch_unwind(AssertUnwindSafe(callable));
        self.invocation.complete(Ok(result));
    }
}

impl<R, F> Drop for PendingInvocation<R, F> {
    fn drop(&mut self) {
        if !self.invocation.is_completed() {
            self.invocation.complete(Err(BridgeError::InvalidOperation(
                "dispatcher stopped before the invocation ran".into(),
            )));
        }
    }
}

impl Dispatcher {
    /// Enqueues `callable` for execution on this dispatcher's loop thread
    /// and returns immediately. Calls from any threads targeting the same
    /// dispatcher execute in enqueue order.
    pub fn begin_invoke<R, F>(&self, callable: F) -> BridgeResult<InvocationHandle<R>>
    where
        R: Send + 'static,
        F: FnOnce() -> R + Send + 'static,
    {
        let invocation = Arc::new(Invocation::new());
        let pending = PendingInvocation {
            invocation: invocation.clone(),
            callable: Some(callable),
        };
        trace!("Invocation: begin_invoke targeting {:?}", self.id());
        self.post(move || pending.run())?;
        Ok(InvocationHandle { invocation })
    }

    /// Runs `callable` on this dispatcher's loop thread and blocks for the
    /// result. When the calling thread already is the loop thread the
    /// callable runs in place, so dispatcher-thread code may call through
    /// the same entry point without deadlocking on itself.
    pub fn invoke<R, F>(&self, callable: F) -> BridgeResult<R>
    where
        R: Send + 'static,
        F: FnOnce() -> R + Send + 'static,
    {
        if self.is_current() {
            return Ok(callable());
        }
        self.begin_invoke(callable)?.end_invoke()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    // [PD-InvokeResultV1] A value produced on the loop thread comes back to
    // the calling thread.
    fn test_invoke_returns_value_from_loop_thread() {
        let spawned = Dispatcher::spawn("invoke-value").unwrap();
        let value = spawned.dispatcher().invoke(|| 6 * 7).unwrap();
        assert_eq!(value, 42);
        spawned.shutdown();
    }

    #[test]
    fn test_invoke_runs_in_place_on_loop_thread() {
        let spawned = Dispatcher::spawn("invoke-inplace").unwrap();
        let dispatcher = spawned.dispatcher().clone();
        let nested = spawned
            .dispatcher()
            .invoke(move || {
                // On the loop thread a nested invoke must not deadlock.
                dispatcher.invoke(|| 7).unwrap()
            })
            .unwrap();
        assert_eq!(nested, 7);
        spawned.shutdown();
    }

    #[test]
    // [PD-PanicPropagationV1] A callable panic re-raises at the join point
    // and leaves the loop thread alive.
    fn test_callable_panic_resumes_at_join_and_loop_survives() {
        let spawned = Dispatcher::spawn("invoke-panic").unwrap();
        let handle = spawned
            .dispatcher()
            .begin_invoke(|| panic!("boom from the loop"))
            .unwrap();

        let join_result =
            std::panic::catch_unwind(AssertUnwindSafe(move || handle.end_invoke().unwrap()));
        let payload = join_result.expect_err("panic should resume on the joining thread");
        let message = payload.downcast_ref::<&str>().copied().unwrap_or_default();
        assert_eq!(message, "boom from the loop");

        // The loop keeps servicing work after the panic.
        assert_eq!(spawned.dispatcher().invoke(|| 1).unwrap(), 1);
        spawned.shutdown();
    }

    #[test]
    fn test_begin_invoke_preserves_fifo_between_threads() {
        let spawned = Dispatcher::spawn("invoke-fifo").unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));

        // Enqueue A then B from different threads, serialized by join so
        // the enqueue order is deterministic.
        let order_a = order.clone();
        let dispatcher_a = spawned.dispatcher().clone();
        let handle_a = std::thread::spawn(move || {
            dispatcher_a.begin_invoke(move || {
                order_a.lock().push("A-start");
                std::thread::sleep(Duration::from_millis(20));
                order_a.lock().push("A-end");
            })
        })
        .join()
        .unwrap()
        .unwrap();

        let order_b = order.clone();
        let dispatcher_b = spawned.dispatcher().clone();
        let handle_b = std::thread::spawn(move || {
            dispatcher_b.begin_invoke(move || order_b.lock().push("B"))
        })
        .join()
        .unwrap()
        .unwrap();

        handle_a.end_invoke().unwrap();
        handle_b.end_invoke().unwrap();
        assert_eq!(*order.lock(), vec!["A-start", "A-end", "B"]);
        spawned.shutdown();
    }

    #[test]
    fn test_end_invoke_after_completion_returns_immediately() {
        let spawned = Dispatcher::spawn("invoke-late-join").unwrap();
        let handle = spawned.dispatcher().begin_invoke(|| "done").unwrap();

        // Let the thunk finish before the first wait so the lazily-created
        // event must be pre-signaled.
        while !handle.is_completed() {
            std::thread::sleep(Duration::from_millis(1));
        }
        handle.wait();
        assert_eq!(handle.end_invoke().unwrap(), "done");
        spawned.shutdown();
    }

    #[test]
    // [PD-NoHangOnStopV1] Joining an invocation whose dispatcher stopped
    // before running it fails instead of blocking forever.
    fn test_queued_invocation_fails_when_loop_stops() {
        let (dispatcher, run_loop) = Dispatcher::new();
        let counter = Arc::new(AtomicUsize::new(0));

        let c = counter.clone();
        let handle = dispatcher
            .begin_invoke(move || {
                c.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        // Drop the loop without ever draining the queue; the pending thunk
        // is discarded with the receiver.
        drop(run_loop);

        let result = handle.end_invoke();
        assert!(matches!(result, Err(BridgeError::InvalidOperation(_))));
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_invoke_from_worker_observes_side_effect_before_return() {
        let spawned = Dispatcher::spawn("invoke-side-effect").unwrap();
        let counter = Arc::new(AtomicUsize::new(0));

        let dispatcher = spawned.dispatcher().clone();
        let c = counter.clone();
        let (done_tx, done_rx) = mpsc::channel();
        std::thread::spawn(move || {
            let seen = dispatcher
                .invoke(move || {
                    c.fetch_add(1, Ordering::SeqCst);
                    c.load(Ordering::SeqCst)
                })
                .unwrap();
            let _ = done_tx.send(seen);
        });

        // The increment must be visible before invoke returned to the worker.
        assert_eq!(done_rx.recv().unwrap(), 1);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        spawned.shutdown();
    }
}

//! A global-lock transaction system ordering propagation by node rank.
//!
//! At most one transaction propagates at a time, guarded by a global static
//! mutex. The transaction itself lives in a thread-local slot so that
//! nested [`run`] and internal `commit` calls on the same thread join the
//! open transaction instead of deadlocking on the lock.
//!
//! A transaction drains in phases. Work enqueued with [`prioritized`] runs
//! in rank order off the priority queue. Callbacks registered with [`last`]
//! run in FIFO batches once the queue is empty; a batch may feed the queue
//! again (coalesced streams flush their pending value this way), in which
//! case the queue is drained before the next batch. Callbacks registered
//! with [`post`] run after the transaction has closed and the global lock
//! has been released.

use std::cell::RefCell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use lazy_static::lazy_static;
use log::trace;

use crate::error::{Error, Result};
use crate::node::Node;
use crate::queue::PriorityQueue;

lazy_static! {
    /// The global transaction lock: at most one transaction is open at a
    /// time across the process.
    static ref TRANSACTION_MUTEX: Mutex<()> = Mutex::new(());
}

thread_local!(
    static CURRENT_TRANSACTION: RefCell<Option<Transaction>> = RefCell::new(None)
);

static NEXT_TRANSACTION_ID: AtomicU64 = AtomicU64::new(0);

type Callback = Box<dyn FnOnce() + 'static>;

/// Definition bookkeeping for one forward-reference loop.
pub(crate) struct LoopState {
    pub defined: bool,
    pub transaction: u64,
}

/// One atomic propagation unit.
pub(crate) struct Transaction {
    id: u64,
    queue: PriorityQueue,
    last: Vec<Callback>,
    post: Vec<Callback>,
    needs_regenerating: bool,
    in_callback: u32,
    loops: Vec<Arc<Mutex<LoopState>>>,
}

impl Transaction {
    fn new() -> Transaction {
        Transaction {
            id: NEXT_TRANSACTION_ID.fetch_add(1, Ordering::Relaxed),
            queue: PriorityQueue::new(),
            last: Vec::new(),
            post: Vec::new(),
            needs_regenerating: false,
            in_callback: 0,
            loops: Vec::new(),
        }
    }

    /// Resort the queue if a link bumped ranks, then pop the next action.
    fn next_action(&mut self) -> Option<Callback> {
        if self.needs_regenerating {
            self.needs_regenerating = false;
            self.queue.resort();
        }
        self.queue.pop()
    }

    fn take_last_batch(&mut self) -> Vec<Callback> {
        std::mem::take(&mut self.last)
    }

    fn has_undefined_loop(&self) -> bool {
        self.loops
            .iter()
            .any(|state| !state.lock().unwrap().defined)
    }
}

/// Borrow the current transaction. Panics when none is open; the engine
/// only calls this from inside a transaction frame.
pub(crate) fn with_current<A, F: FnOnce(&mut Transaction) -> A>(action: F) -> A {
    CURRENT_TRANSACTION.with(|current| match &mut *current.borrow_mut() {
        Some(transaction) => action(transaction),
        None => panic!("there is no active transaction"),
    })
}

fn try_with_current<A, F: FnOnce(&mut Transaction) -> A>(action: F) -> Option<A> {
    CURRENT_TRANSACTION.with(|current| current.borrow_mut().as_mut().map(action))
}

/// Enqueue rank-ordered propagation work against `target`.
pub(crate) fn prioritized<F: FnOnce() + 'static>(target: Node, action: F) {
    with_current(|transaction| transaction.queue.push(target, action));
}

/// Register a callback for the `last` phase of the current transaction.
pub(crate) fn last<F: FnOnce() + 'static>(action: F) {
    with_current(|transaction| transaction.last.push(Box::new(action)));
}

/// Register a callback to run after the current transaction has closed.
pub(crate) fn post<F: FnOnce() + 'static>(action: F) {
    with_current(|transaction| transaction.post.push(Box::new(action)));
}

/// Request a queue resort before the next dispatch.
pub(crate) fn set_needs_regenerating() {
    with_current(|transaction| transaction.needs_regenerating = true);
}

/// Whether a transaction is open on this thread.
pub(crate) fn active() -> bool {
    CURRENT_TRANSACTION.with(|current| current.borrow().is_some())
}

/// Id of the transaction open on this thread, if any.
pub(crate) fn current_id() -> Option<u64> {
    try_with_current(|transaction| transaction.id)
}

/// Whether the current thread is inside a user-supplied handler.
pub(crate) fn in_callback() -> bool {
    try_with_current(|transaction| transaction.in_callback > 0).unwrap_or(false)
}

/// Run a user-supplied handler with the callback counter raised, so that
/// any `send` it attempts is rejected.
pub(crate) fn guard_callback<A, F: FnOnce() -> A>(handler: F) -> A {
    with_current(|transaction| transaction.in_callback += 1);
    let result = handler();
    with_current(|transaction| transaction.in_callback -= 1);
    result
}

/// Register a fresh forward-reference loop with the current transaction
/// and hand its definition flag back to the placeholder.
pub(crate) fn register_loop() -> Arc<Mutex<LoopState>> {
    with_current(|transaction| {
        let state = Arc::new(Mutex::new(LoopState {
            defined: false,
            transaction: transaction.id,
        }));
        transaction.loops.push(state.clone());
        state
    })
}

/// Clears the thread-local transaction if a user handler unwinds, so the
/// engine stays usable after the panic propagates.
struct UnwindGuard;

impl Drop for UnwindGuard {
    fn drop(&mut self) {
        CURRENT_TRANSACTION.with(|current| current.borrow_mut().take());
    }
}

/// Execute `body` inside a transaction.
///
/// Joins the transaction already open on this thread if there is one;
/// otherwise opens a new transaction under the global lock, drains all
/// propagation phases after `body` returns, and closes. Combining several
/// `send`s in one `run` makes them simultaneous:
///
/// ```
/// use covalent::StreamSink;
///
/// let a = StreamSink::new();
/// let b = StreamSink::new();
/// let sum = a.stream().merge(&b.stream(), |l, r| l + r);
/// let mut events = sum.events();
/// covalent::run(|| {
///     a.send(2).unwrap();
///     b.send(3).unwrap();
/// })
/// .unwrap();
/// assert_eq!(events.next(), Some(5));
/// ```
///
/// # Errors
///
/// [`Error::LoopNotClosed`] when a stream or cell loop created inside the
/// transaction is still undefined at close; propagation is abandoned and
/// neither the `last` nor the `post` phase runs.
pub fn run<A, F: FnOnce() -> A>(body: F) -> Result<A> {
    eprintln!("DBG run() enter");
    let outermost = CURRENT_TRANSACTION.with(|current| {
        let mut current = current.borrow_mut();
        if current.is_none() {
            *current = Some(Transaction::new());
            true
        } else {
            false
        }
    });
    eprintln!("DBG run() outermost={}", outermost);
    if !outermost {
        let r = body();
        eprintln!("DBG run() nested body returned");
        return Ok(r);
    }

    // The lock guards no data of its own, so a poisoned flag left behind
    // by a panicking handler is safe to clear.
    let lock = TRANSACTION_MUTEX
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    let guard = UnwindGuard;
    trace!("transaction opened");

    let result = body();

    if with_current(|t: &mut Transaction| t.has_undefined_loop()) {
        // Abort: drop all queued work without running `last` or `post`.
        drop(guard);
        drop(lock);
        return Err(Error::LoopNotClosed);
    }

    // Drain the rank queue, then run one batch of `last` callbacks, and
    // repeat until neither produces more work.
    loop {
        loop {
            let action = with_current(Transaction::next_action);
            match action {
                Some(action) => action(),
                None => break,
            }
        }
        let batch = with_current(Transaction::take_last_batch);
        if batch.is_empty() {
            break;
        }
        for callback in batch {
            callback();
        }
    }

    let transaction = CURRENT_TRANSACTION
        .with(|current| current.borrow_mut().take())
        .expect("transaction disappeared during drain");
    std::mem::forget(guard);
    drop(lock);
    trace!("transaction closed");

    for callback in transaction.post {
        callback();
    }
    Ok(result)
}

/// Internal entry point for combinator construction and other operations
/// that cannot produce a transaction-level error themselves.
pub(crate) fn commit<A, F: FnOnce() -> A>(body: F) -> A {
    run(body).expect("forward reference left undefined by engine internals")
}

#[cfg(test)]
mod test {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn run_single() {
        let mut v = 3;
        run(|| v += 5).unwrap();
        assert_eq!(v, 8);
    }

    #[test]
    fn run_nested() {
        let mut v = 3;
        run(|| {
            commit(|| v *= 2);
            v += 4;
        })
        .unwrap();
        assert_eq!(v, 10);
    }

    #[test]
    fn runs_parallel() {
        // Set up a ref-counted value
        let v = Arc::new(Mutex::new(3));
        // Spawn a couple of threads performing atomic operations on it
        let guards: Vec<_> = (0..3)
            .map(|_| {
                let v = v.clone();
                thread::spawn(move || {
                    run(move || {
                        // Acquire locks independently, s.t. atomicity does
                        // not rely on the local locks here
                        *v.lock().unwrap() *= 2;
                        // …and sleep for a bit
                        thread::sleep(Duration::from_millis(1));
                        *v.lock().unwrap() -= 1;
                    })
                    .unwrap()
                })
            })
            .collect();
        for guard in guards {
            guard.join().expect("thread failed");
        }
        assert_eq!(*v.lock().unwrap(), 17);
    }

    #[test]
    fn last_runs_after_queue() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        run(|| {
            let node = Node::new();
            let seen2 = seen.clone();
            last(move || seen2.lock().unwrap().push(10));
            for tag in [1, 2] {
                let seen2 = seen.clone();
                prioritized(node.clone(), move || seen2.lock().unwrap().push(tag));
            }
        })
        .unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![1, 2, 10]);
    }

    #[test]
    fn last_batch_may_feed_the_queue() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        run(|| {
            let node = Node::new();
            let seen2 = seen.clone();
            last(move || {
                let seen3 = seen2.clone();
                seen2.lock().unwrap().push(1);
                prioritized(node, move || seen3.lock().unwrap().push(2));
            });
        })
        .unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![1, 2]);
    }

    #[test]
    fn post_runs_outside_the_transaction() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        run(|| {
            let seen2 = seen.clone();
            post(move || seen2.lock().unwrap().push(active()));
            let seen2 = seen.clone();
            last(move || seen2.lock().unwrap().push(true));
        })
        .unwrap();
        // `last` saw the open transaction, `post` did not.
        assert_eq!(*seen.lock().unwrap(), vec![true, false]);
    }

    #[test]
    fn undefined_loop_aborts_the_transaction() {
        let ran = Arc::new(Mutex::new(false));
        let ran2 = ran.clone();
        let result = run(|| {
            let _ = register_loop();
            let ran3 = ran2.clone();
            last(move || *ran3.lock().unwrap() = true);
        });
        assert_eq!(result, Err(Error::LoopNotClosed));
        assert!(!*ran.lock().unwrap());
        // The engine is still usable afterwards.
        assert_eq!(run(|| 4).unwrap(), 4);
    }

    #[test]
    fn defined_loop_closes_cleanly() {
        let result = run(|| {
            let state = register_loop();
            state.lock().unwrap().defined = true;
        });
        assert!(result.is_ok());
    }

    #[test]
    fn callback_guard_is_visible() {
        run(|| {
            assert!(!in_callback());
            guard_callback(|| assert!(in_callback()));
            assert!(!in_callback());
        })
        .unwrap();
    }
}

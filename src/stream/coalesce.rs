//! Helper module for coalesce.
//!
//! A coalesced stream fires at most once per transaction. The first firing
//! of the input stores the value and schedules a flush in the `last`
//! phase; further firings in the same transaction reduce into the stored
//! value. The flush sends the reduced value on the output, which re-enters
//! rank-ordered propagation before the next `last` batch runs.

use std::sync::{Arc, Mutex, Weak};

use super::{listen_with, new_core, send, Action, Stream, StreamCore};
use crate::node::EdgeKind;
use crate::transaction;

fn reduce_into<A, F>(pending: &Mutex<Option<A>>, a: A, f: &F) -> bool
where
    A: Clone + Send + Sync + 'static,
    F: Fn(A, A) -> A + Send + Sync,
{
    let mut slot = pending.lock().unwrap();
    let first = slot.is_none();
    *slot = Some(match slot.take() {
        Some(earlier) => f(earlier, a),
        None => a,
    });
    first
}

fn flush<A>(pending: &Mutex<Option<A>>, out: &Weak<StreamCore<A>>)
where
    A: Clone + Send + Sync + 'static,
{
    if let Some(value) = pending.lock().unwrap().take() {
        if let Some(core) = out.upgrade() {
            send(&core, value);
        }
    }
}

/// Build a stream firing the per-transaction reduction of `input` under
/// `f(earlier, later)`.
pub fn stream<A, F>(input: &Stream<A>, f: F) -> Stream<A>
where
    A: Clone + Send + Sync + 'static,
    F: Fn(A, A) -> A + Send + Sync + 'static,
{
    let out = Stream { core: new_core() };
    let weak = Arc::downgrade(&out.core);
    let pending: Arc<Mutex<Option<A>>> = Arc::new(Mutex::new(None));
    let action: Arc<Action<A>> = Arc::new(move |a| {
        if reduce_into(&pending, a, &f) {
            let pending = pending.clone();
            let weak = weak.clone();
            transaction::last(move || flush(&pending, &weak));
        }
    });
    // Earlier firings of the input are deliberately not replayed into the
    // coalescer; it only reduces what fires from here on.
    let listener = listen_with(input, out.node().clone(), EdgeKind::Immediate, true, action);
    out.retain(listener);
    out
}

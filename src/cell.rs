//! Cells: containers for values that change discretely over time.
//!
//! A cell holds a current value and, while a transaction is running, at
//! most one pending next value fed by its backing stream. Sampling inside
//! a transaction always observes the value from before the transaction;
//! the pending value is swapped in during the `last` phase, so updates
//! become visible only to later transactions. This one-transaction delay
//! is what makes recursive definitions through [`CellLoop`] well-founded.

use std::sync::{Arc, Mutex};

use crate::error::Result;
use crate::listener::Listener;
use crate::node::{EdgeKind, Node};
use crate::stream::{coalesce, listen_with, Action, Stream, StreamLoop, StreamSink};
use crate::transaction::{self, commit};

/// An initial value that may be deferred until it is first needed.
enum Lazy<A> {
    Value(A),
    Thunk(Option<Box<dyn FnOnce() -> A + Send>>),
}

impl<A: Clone> Lazy<A> {
    fn get(&mut self) -> A {
        eprintln!("DBG Lazy::get enter");
        if let Lazy::Thunk(thunk) = self {
            eprintln!("DBG Lazy::get calling thunk");
            let thunk = thunk.take().expect("lazy initial value already taken");
            *self = Lazy::Value(thunk());
            eprintln!("DBG Lazy::get thunk returned");
        }
        match self {
            Lazy::Value(a) => a.clone(),
            Lazy::Thunk(_) => unreachable!(),
        }
    }
}

struct CellState<A> {
    value: Lazy<A>,
    next: Option<A>,
    /// The internal listener feeding `next`; lives as long as the cell.
    retained: Vec<Listener>,
}

struct CellCore<A> {
    state: Mutex<CellState<A>>,
    updates: Stream<A>,
}

/// A container for a value that changes over time.
///
/// Cells are sampled, not listened to; the stream of changes is available
/// as [`Cell::updates`]. Clones share the underlying container.
///
/// ```
/// use covalent::StreamSink;
///
/// let sink = StreamSink::new();
/// let cell = sink.stream().hold(3);
/// assert_eq!(cell.sample(), 3);
/// sink.send(5).unwrap();
/// assert_eq!(cell.sample(), 5);
/// ```
pub struct Cell<A> {
    core: Arc<CellCore<A>>,
}

impl<A> Clone for Cell<A> {
    fn clone(&self) -> Cell<A> {
        Cell {
            core: self.core.clone(),
        }
    }
}

impl<A: Clone + Send + Sync + 'static> Cell<A> {
    /// A cell that holds one value forever.
    pub fn new(value: A) -> Cell<A> {
        Cell {
            core: Arc::new(CellCore {
                state: Mutex::new(CellState {
                    value: Lazy::Value(value),
                    next: None,
                    retained: Vec::new(),
                }),
                updates: Stream::never(),
            }),
        }
    }

    /// Sample the current value.
    ///
    /// Within a transaction this is the value from before the transaction
    /// opened, however often the backing stream has fired meanwhile.
    pub fn sample(&self) -> A {
        commit(|| sample_in_transaction(self))
    }

    /// The stream of values this cell is updated with, at most one per
    /// transaction.
    pub fn updates(&self) -> Stream<A> {
        self.core.updates.clone()
    }

    /// Define a cell in terms of itself.
    ///
    /// The closure receives a placeholder for the result and must return
    /// the defining cell; the definition must not sample the placeholder.
    ///
    /// ```
    /// use covalent::{Cell, StreamSink};
    ///
    /// let sink = StreamSink::new();
    /// let total = Cell::cyclic(|total| {
    ///     sink.stream().snapshot(total, |a, t| t + a).hold(0)
    /// });
    /// sink.send(3).unwrap();
    /// sink.send(7).unwrap();
    /// assert_eq!(total.sample(), 10);
    /// ```
    pub fn cyclic<F>(f: F) -> Cell<A>
    where
        F: FnOnce(&Cell<A>) -> Cell<A>,
    {
        commit(|| {
            let placeholder = CellLoop::new();
            let definition = f(&placeholder.cell());
            placeholder
                .loop_(&definition)
                .expect("cyclic cell defined exactly once");
            placeholder.cell()
        })
    }
}

/// Read the pre-transaction value without opening a transaction. Only
/// called while one is active.
pub(crate) fn sample_in_transaction<A: Clone + Send + Sync + 'static>(cell: &Cell<A>) -> A {
    cell.core.state.lock().unwrap().value.get()
}

/// Hold the last firing of `input` in a cell, starting from `initial`.
pub(crate) fn hold<A: Clone + Send + Sync + 'static>(initial: A, input: &Stream<A>) -> Cell<A> {
    hold_lazy(Lazy::Value(initial), input)
}

fn hold_lazy<A: Clone + Send + Sync + 'static>(initial: Lazy<A>, input: &Stream<A>) -> Cell<A> {
    commit(|| {
        // The cell tracks the last-firing-only view of its backing stream,
        // so `next` is written at most once per transaction.
        let updates = coalesce::stream(input, |_, newest| newest);
        let core = Arc::new(CellCore {
            state: Mutex::new(CellState {
                value: initial,
                next: None,
                retained: Vec::new(),
            }),
            updates: updates.clone(),
        });
        let weak = Arc::downgrade(&core);
        let action: Arc<Action<A>> = Arc::new(move |a| {
            if let Some(core) = weak.upgrade() {
                let first = {
                    let mut state = core.state.lock().unwrap();
                    let first = state.next.is_none();
                    state.next = Some(a);
                    first
                };
                if first {
                    let weak = weak.clone();
                    transaction::last(move || {
                        if let Some(core) = weak.upgrade() {
                            let mut state = core.state.lock().unwrap();
                            if let Some(next) = state.next.take() {
                                state.value = Lazy::Value(next);
                            }
                        }
                    });
                }
            }
        });
        let listener = listen_with(&updates, Node::new(), EdgeKind::Immediate, false, action);
        core.state.lock().unwrap().retained.push(listener);
        Cell { core }
    })
}

/// A sink with a cell attached: the ingress for time-varying values.
///
/// ```
/// use covalent::CellSink;
///
/// let sink = CellSink::new(0);
/// let cell = sink.cell();
/// assert_eq!(cell.sample(), 0);
/// sink.send(42).unwrap();
/// assert_eq!(cell.sample(), 42);
/// ```
pub struct CellSink<A> {
    sink: StreamSink<A>,
    cell: Cell<A>,
}

impl<A> Clone for CellSink<A> {
    fn clone(&self) -> CellSink<A> {
        CellSink {
            sink: self.sink.clone(),
            cell: self.cell.clone(),
        }
    }
}

impl<A: Clone + Send + Sync + 'static> CellSink<A> {
    /// Create a sink whose cell starts out holding `initial`.
    pub fn new(initial: A) -> CellSink<A> {
        let sink = StreamSink::new();
        let cell = sink.stream().hold(initial);
        CellSink { sink, cell }
    }

    /// The cell holding the most recently sent value.
    pub fn cell(&self) -> Cell<A> {
        self.cell.clone()
    }

    /// Send a new value for the cell.
    ///
    /// # Errors
    ///
    /// [`crate::Error::SendFromCallback`] when invoked from inside a
    /// listener callback.
    pub fn send(&self, a: A) -> Result<()> {
        self.sink.send(a)
    }
}

/// Forward declaration of a cell, used to build recursive definitions
/// such as accumulators.
///
/// The placeholder cell is available immediately; the defining cell is
/// supplied later with [`CellLoop::loop_`], within the same transaction.
/// Because samples observe pre-transaction values, the definition may
/// snapshot the placeholder without ill-founded recursion — it must not
/// `sample` it directly while defining.
pub struct CellLoop<A> {
    placeholder: StreamLoop<A>,
    cell: Cell<A>,
}

impl<A: Clone + Send + Sync + 'static> CellLoop<A> {
    /// Create a placeholder cell.
    ///
    /// # Panics
    ///
    /// Panics when no transaction is active on this thread, like
    /// [`StreamLoop::new`].
    pub fn new() -> CellLoop<A> {
        let placeholder = StreamLoop::new();
        let cell = hold_lazy(
            Lazy::Thunk(Some(Box::new(|| {
                panic!("cell loop sampled before it was defined")
            }))),
            &placeholder.stream(),
        );
        CellLoop { placeholder, cell }
    }

    /// The placeholder cell.
    pub fn cell(&self) -> Cell<A> {
        self.cell.clone()
    }

    /// Bind the placeholder to its definition. The placeholder adopts the
    /// definition's updates and its initial value.
    ///
    /// # Errors
    ///
    /// [`crate::Error::DoubleLoop`] when the placeholder is already
    /// defined, [`crate::Error::LoopNotClosed`] when called from a
    /// different transaction than the one that created it.
    pub fn loop_(&self, definition: &Cell<A>) -> Result<()> {
        commit(|| {
            self.placeholder.loop_(&definition.updates())?;
            let mut state = self.cell.core.state.lock().unwrap();
            if let Lazy::Thunk(_) = state.value {
                let definition = definition.clone();
                state.value = Lazy::Thunk(Some(Box::new(move || {
                    sample_in_transaction(&definition)
                })));
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::testing::Recorder;
    use crate::StreamSink;
    use quickcheck::quickcheck;

    #[test]
    fn constant_cell() {
        let cell = Cell::new(3);
        assert_eq!(cell.clone().sample(), 3);
    }

    #[test]
    fn hold_samples_the_last_event() {
        let sink = StreamSink::new();
        let cell = sink.stream().hold(3);
        assert_eq!(cell.sample(), 3);
        sink.send(4).unwrap();
        assert_eq!(cell.sample(), 4);
    }

    #[test]
    fn hold_through_a_derived_stream() {
        let sink = StreamSink::new();
        let cell = sink.stream().map(|n| 2 * n).hold(0);
        assert_eq!(cell.sample(), 0);
        sink.send(4).unwrap();
        assert_eq!(cell.sample(), 8);
    }

    #[test]
    fn sample_within_a_transaction_sees_the_old_value() {
        let sink = StreamSink::new();
        let cell = sink.stream().hold(0);
        let observed = crate::run(|| {
            sink.send(10).unwrap();
            cell.sample()
        })
        .unwrap();
        assert_eq!(observed, 0);
        assert_eq!(cell.sample(), 10);
    }

    #[test]
    fn updates_fire_at_most_once_per_transaction() {
        let sink = StreamSink::new();
        let cell = sink.stream().hold(0);
        let updates = Recorder::attach(&cell.updates());
        crate::run(|| {
            sink.send(1).unwrap();
            sink.send(2).unwrap();
        })
        .unwrap();
        sink.send(3).unwrap();
        assert_eq!(updates.values(), vec![2, 3]);
    }

    #[test]
    fn snapshot_observes_pre_transaction_values() {
        let sink = StreamSink::new();
        let cell = sink.stream().hold(0);
        let out = sink.stream().snapshot(&cell, |_, v| v);
        let recorder = Recorder::attach(&out);
        sink.send(10).unwrap();
        sink.send(20).unwrap();
        assert_eq!(recorder.values(), vec![0, 10]);
    }

    #[test]
    fn cell_sink_round_trip() {
        let sink = CellSink::new(1);
        let cell = sink.cell();
        assert_eq!(cell.sample(), 1);
        sink.send(2).unwrap();
        assert_eq!(cell.sample(), 2);
    }

    #[test]
    fn accum_totals_its_events() {
        let sink = StreamSink::new();
        let sum = sink.stream().accum(0, |state, a| state + a);
        assert_eq!(sum.sample(), 0);
        sink.send(2).unwrap();
        assert_eq!(sum.sample(), 2);
        sink.send(4).unwrap();
        assert_eq!(sum.sample(), 6);
    }

    #[test]
    fn cyclic_snapshot_accum() {
        let sink = StreamSink::new();
        let accum = Cell::cyclic(|accum| {
            sink.stream().snapshot(accum, |s, acc| acc + s).hold(0)
        });
        assert_eq!(accum.sample(), 0);
        sink.send(3).unwrap();
        assert_eq!(accum.sample(), 3);
        sink.send(7).unwrap();
        assert_eq!(accum.sample(), 10);
        sink.send(-21).unwrap();
        assert_eq!(accum.sample(), -11);
    }

    #[test]
    fn collect_threads_its_state() {
        let sink = StreamSink::new();
        let indexed = sink.stream().collect(0, |a: i32, n: i32| (a + n, n + 1));
        let recorder = Recorder::attach(&indexed);
        sink.send(10).unwrap();
        sink.send(10).unwrap();
        sink.send(10).unwrap();
        assert_eq!(recorder.values(), vec![10, 11, 12]);
    }

    #[test]
    fn cell_loop_adopts_the_definition_initial() {
        let sink: StreamSink<i32> = StreamSink::new();
        let cell = crate::run(|| {
            let placeholder = CellLoop::new();
            let definition = sink.stream().hold(7);
            placeholder.loop_(&definition).unwrap();
            placeholder.cell()
        })
        .unwrap();
        assert_eq!(cell.sample(), 7);
        sink.send(8).unwrap();
        assert_eq!(cell.sample(), 8);
    }

    #[test]
    #[should_panic(expected = "sampled before it was defined")]
    fn cell_loop_sampled_before_definition_panics() {
        let _ = crate::run(|| {
            let placeholder: CellLoop<i32> = CellLoop::new();
            placeholder.cell().sample()
        });
    }

    #[test]
    fn hold_of_updates_reproduces_the_cell() {
        fn check(input: Vec<i32>) -> bool {
            let sink = StreamSink::new();
            let original = sink.stream().hold(0);
            let rebuilt = original.updates().hold(0);
            let original_updates = Recorder::attach(&original.updates());
            let rebuilt_updates = Recorder::attach(&rebuilt.updates());
            sink.feed(input).unwrap();
            original.sample() == rebuilt.sample()
                && original_updates.values() == rebuilt_updates.values()
        }
        quickcheck(check as fn(Vec<i32>) -> bool);
    }
}

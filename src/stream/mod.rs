//! Streams of discrete events.
//!
//! Conceptually a stream is a series of discrete events that occur at
//! specific times. Firings are ordered by the transaction system: all
//! events sharing a transaction are simultaneous, and their consequences
//! are reflected atomically in every dependent stream and cell.
//!
//! # Algebraic laws
//!
//! Streams of the same type form a **monoid** under merging with
//! [`Stream::never`] as the neutral element, and a **functor** under
//! [`Stream::map`]:
//!
//! - `Stream::never().merge(&a, f)` behaves like `a`,
//! - `a.merge(&Stream::never(), f)` behaves like `a`,
//! - `a.map(|x| x)` behaves like `a`,
//! - `a.map(f).map(g)` behaves like `a.map(|x| g(f(x)))`.

use std::sync::mpsc::{channel, Receiver};
use std::sync::{Arc, Mutex, Weak};

use smallvec::SmallVec;

use crate::cell::{self, Cell, CellLoop};
use crate::error::{Error, Result};
use crate::listener::Listener;
use crate::node::{EdgeKind, Node, TargetId};
use crate::transaction::{self, commit};

pub(crate) mod coalesce;

pub(crate) type Action<A> = dyn Fn(A) + Send + Sync;

/// One typed outgoing edge of a stream.
struct Target<A> {
    id: TargetId,
    node: Node,
    action: Weak<Action<A>>,
}

pub(crate) struct StreamState<A> {
    /// Values fired in the current transaction, served to late listeners
    /// and cleared in the `last` phase.
    firings: SmallVec<[A; 1]>,
    targets: SmallVec<[Target<A>; 2]>,
    /// Internal listeners that must live exactly as long as this stream.
    retained: Vec<Listener>,
}

pub(crate) struct StreamCore<A> {
    node: Node,
    state: Mutex<StreamState<A>>,
}

pub(crate) fn new_core<A>() -> Arc<StreamCore<A>> {
    Arc::new(StreamCore {
        node: Node::new(),
        state: Mutex::new(StreamState {
            firings: SmallVec::new(),
            targets: SmallVec::new(),
            retained: Vec::new(),
        }),
    })
}

/// Fire `a` on the stream inside the current transaction: record the
/// firing for late listeners and enqueue one rank-ordered delivery per
/// outgoing edge.
pub(crate) fn send<A: Clone + Send + Sync + 'static>(core: &Arc<StreamCore<A>>, a: A) {
    let targets: SmallVec<[(Node, Weak<Action<A>>, TargetId); 2]> = {
        let mut state = core.state.lock().unwrap();
        if state.firings.is_empty() {
            let weak = Arc::downgrade(core);
            transaction::last(move || {
                if let Some(core) = weak.upgrade() {
                    core.state.lock().unwrap().firings.clear();
                }
            });
        }
        state.firings.push(a.clone());
        state
            .targets
            .iter()
            .map(|target| (target.node.clone(), target.action.clone(), target.id))
            .collect()
    };
    for (node, action, id) in targets {
        dispatch(Arc::downgrade(core), node, action, id, a.clone());
    }
}

/// Enqueue one delivery. The action is resolved at dispatch time: a
/// revoked listener leaves a dead weak reference behind, which turns the
/// queued delivery into a no-op and prunes the edge.
fn dispatch<A: Clone + Send + Sync + 'static>(
    weak_core: Weak<StreamCore<A>>,
    node: Node,
    action: Weak<Action<A>>,
    id: TargetId,
    a: A,
) {
    transaction::prioritized(node, move || match action.upgrade() {
        Some(action) => transaction::guard_callback(|| action(a)),
        None => {
            if let Some(core) = weak_core.upgrade() {
                remove_target(&core, id);
            }
        }
    });
}

fn remove_target<A>(core: &Arc<StreamCore<A>>, id: TargetId) {
    core.state.lock().unwrap().targets.retain(|target| target.id != id);
    core.node.unlink(id);
}

/// Link an edge from `stream` to `target` and register `action` for it.
///
/// When the stream has already fired in the current transaction, each
/// existing firing is re-delivered to the new edge so that attaching a
/// listener commutes with sending — unless `suppress_earlier_firings` is
/// set, which coalesced construction uses to see only future firings.
pub(crate) fn listen_with<A: Clone + Send + Sync + 'static>(
    stream: &Stream<A>,
    target: Node,
    kind: EdgeKind,
    suppress_earlier_firings: bool,
    action: Arc<Action<A>>,
) -> Listener {
    commit(|| {
        let core = &stream.core;
        let (bumped, id) = core
            .node
            .link(&target, kind)
            .expect("rank regeneration failed");
        if bumped {
            transaction::set_needs_regenerating();
        }
        {
            let mut state = core.state.lock().unwrap();
            state.targets.push(Target {
                id,
                node: target.clone(),
                action: Arc::downgrade(&action),
            });
            if !suppress_earlier_firings {
                for a in state.firings.iter().cloned() {
                    dispatch(
                        Arc::downgrade(core),
                        target.clone(),
                        Arc::downgrade(&action),
                        id,
                        a,
                    );
                }
            }
        }
        let upstream = core.clone();
        Listener::new(Box::new(move || {
            // Dropping the strong action reference is what revokes the
            // callback; the structural unlink happens outside the current
            // propagation, in the post phase.
            drop(action);
            let unlink = move || remove_target(&upstream, id);
            let active = transaction::active();
            eprintln!("DBG revoke closure: active={} thread={:?}", active, std::thread::current().id());
            if active {
                transaction::post(unlink);
            } else {
                eprintln!("DBG revoke closure: about to commit(unlink)");
                commit(unlink);
                eprintln!("DBG revoke closure: commit(unlink) returned");
            }
        }))
    })
}

/// An event sink: the ingress of the graph.
///
/// This primitive is the only way to fire an event from outside the
/// dataflow graph. One can send input values into a sink and observe them
/// on its stream:
///
/// ```
/// use covalent::StreamSink;
///
/// let sink = StreamSink::new();
/// let mut events = sink.stream().events();
/// sink.send(5).unwrap();
/// assert_eq!(events.next(), Some(5));
/// ```
pub struct StreamSink<A> {
    stream: Stream<A>,
}

impl<A> Clone for StreamSink<A> {
    fn clone(&self) -> StreamSink<A> {
        StreamSink {
            stream: self.stream.clone(),
        }
    }
}

impl<A: Send + Sync> StreamSink<A> {
    /// Create a new sink.
    pub fn new() -> StreamSink<A> {
        StreamSink {
            stream: Stream { core: new_core() },
        }
    }

    /// The stream that fires everything sent into the sink.
    pub fn stream(&self) -> Stream<A> {
        self.stream.clone()
    }
}

impl<A: Send + Sync> Default for StreamSink<A> {
    fn default() -> StreamSink<A> {
        StreamSink::new()
    }
}

impl<A: Clone + Send + Sync + 'static> StreamSink<A> {
    /// Send a value into the sink.
    ///
    /// Opens a transaction if none is active on this thread; inside
    /// [`crate::run`] several sends become simultaneous.
    ///
    /// # Errors
    ///
    /// [`Error::SendFromCallback`] when invoked from inside a listener
    /// callback. Listeners must not originate external events; the engine
    /// state is left unchanged.
    pub fn send(&self, a: A) -> Result<()> {
        transaction::run(|| {
            if transaction::in_callback() {
                return Err(Error::SendFromCallback);
            }
            send(&self.stream.core, a);
            Ok(())
        })?
    }

    /// Feed values from an iterator into the sink.
    ///
    /// Each item goes through [`StreamSink::send`]: one transaction per
    /// item, or all joining the caller's transaction when invoked inside
    /// [`crate::run`].
    pub fn feed<I: IntoIterator<Item = A>>(&self, iterator: I) -> Result<()> {
        for a in iterator {
            self.send(a)?;
        }
        Ok(())
    }
}

/// A stream of discrete events.
///
/// Streams are composed with the primitives below; all of them construct a
/// derived stream whose internal listener lives exactly as long as the
/// derived stream does. Clones share the underlying event source.
pub struct Stream<A> {
    pub(crate) core: Arc<StreamCore<A>>,
}

impl<A> Clone for Stream<A> {
    fn clone(&self) -> Stream<A> {
        Stream {
            core: self.core.clone(),
        }
    }
}

impl<A> Stream<A> {
    pub(crate) fn node(&self) -> &Node {
        &self.core.node
    }

    pub(crate) fn retain(&self, listener: Listener) {
        self.core.state.lock().unwrap().retained.push(listener);
    }
}

impl<A: Clone + Send + Sync + 'static> Stream<A> {
    /// A stream that never fires. This is the neutral element of `merge`,
    /// useful where a stream is logically required but no events are
    /// expected.
    pub fn never() -> Stream<A> {
        Stream { core: new_core() }
    }

    /// Map the stream to another stream using a function.
    ///
    /// `map` applies a pure function to every event fired in this stream
    /// to create a new stream of type `B`.
    ///
    /// ```
    /// use covalent::StreamSink;
    ///
    /// let sink: StreamSink<i32> = StreamSink::new();
    /// let mut events = sink.stream().map(|x| x + 4).events();
    /// sink.send(3).unwrap();
    /// assert_eq!(events.next(), Some(7));
    /// ```
    pub fn map<B, F>(&self, f: F) -> Stream<B>
    where
        B: Clone + Send + Sync + 'static,
        F: Fn(A) -> B + Send + Sync + 'static,
    {
        commit(|| {
            let out = Stream { core: new_core() };
            let weak = Arc::downgrade(&out.core);
            let action: Arc<Action<A>> = Arc::new(move |a| {
                if let Some(core) = weak.upgrade() {
                    send(&core, f(a));
                }
            });
            let listener =
                listen_with(self, out.node().clone(), EdgeKind::Immediate, false, action);
            out.retain(listener);
            out
        })
    }

    /// Filter a stream according to a predicate.
    ///
    /// The new stream only fires those events from this stream that
    /// satisfy the predicate.
    ///
    /// ```
    /// use covalent::StreamSink;
    ///
    /// let sink: StreamSink<i32> = StreamSink::new();
    /// let mut events = sink.stream().filter(|&x| x >= 4).events();
    /// sink.send(2).unwrap(); // won't arrive
    /// sink.send(5).unwrap(); // will arrive
    /// assert_eq!(events.next(), Some(5));
    /// ```
    pub fn filter<P>(&self, predicate: P) -> Stream<A>
    where
        P: Fn(&A) -> bool + Send + Sync + 'static,
    {
        self.filter_map(move |a| if predicate(&a) { Some(a) } else { None })
    }

    /// Filter and map in one step: events mapped to `None` are dropped.
    pub fn filter_map<B, F>(&self, f: F) -> Stream<B>
    where
        B: Clone + Send + Sync + 'static,
        F: Fn(A) -> Option<B> + Send + Sync + 'static,
    {
        commit(|| {
            let out = Stream { core: new_core() };
            let weak = Arc::downgrade(&out.core);
            let action: Arc<Action<A>> = Arc::new(move |a| {
                if let Some(b) = f(a) {
                    if let Some(core) = weak.upgrade() {
                        send(&core, b);
                    }
                }
            });
            let listener =
                listen_with(self, out.node().clone(), EdgeKind::Immediate, false, action);
            out.retain(listener);
            out
        })
    }

    /// Merge with another stream.
    ///
    /// Events from either input fire on the result. The result fires at
    /// most once per transaction: simultaneous events are combined with
    /// `f(left, right)` in the transaction's `last` phase, where `left`
    /// comes from `self` and `right` from `other`.
    ///
    /// ```
    /// use covalent::StreamSink;
    ///
    /// let left = StreamSink::new();
    /// let right = StreamSink::new();
    /// let merged = left.stream().merge(&right.stream(), |l, r| l + r);
    /// let mut events = merged.events();
    /// left.send(2).unwrap();
    /// right.send(4).unwrap();
    /// assert_eq!(events.next(), Some(2));
    /// assert_eq!(events.next(), Some(4));
    /// ```
    pub fn merge<F>(&self, other: &Stream<A>, f: F) -> Stream<A>
    where
        F: Fn(A, A) -> A + Send + Sync + 'static,
    {
        commit(|| {
            let raw = Stream { core: new_core() };
            // The left input passes through an extra node ranked below the
            // merge point, so left events always arrive at the coalescer
            // before right events fired in the same transaction.
            let left_node = Node::new();
            left_node
                .link(raw.node(), EdgeKind::Immediate)
                .expect("rank regeneration failed");
            for (parent, target) in [(self, left_node), (other, raw.node().clone())] {
                let weak = Arc::downgrade(&raw.core);
                let action: Arc<Action<A>> = Arc::new(move |a| {
                    if let Some(core) = weak.upgrade() {
                        send(&core, a);
                    }
                });
                let listener = listen_with(parent, target, EdgeKind::Immediate, false, action);
                raw.retain(listener);
            }
            coalesce::stream(&raw, f)
        })
    }

    /// Coalesce multiple event firings within the same transaction into a
    /// single event, reduced with `f(earlier, later)`.
    pub fn coalesce<F>(&self, f: F) -> Stream<A>
    where
        F: Fn(A, A) -> A + Send + Sync + 'static,
    {
        commit(|| coalesce::stream(self, f))
    }

    /// Sample a cell whenever this stream fires.
    ///
    /// The output fires `f(event, value)` where `value` is the cell's
    /// value as of the start of the transaction — an update to the cell in
    /// the same transaction is not yet visible.
    ///
    /// ```
    /// use covalent::StreamSink;
    ///
    /// let sink = StreamSink::new();
    /// let cell = sink.stream().hold(0);
    /// let mut events = sink.stream().snapshot(&cell, |a, v| a + v).events();
    /// sink.send(10).unwrap();
    /// sink.send(5).unwrap();
    /// assert_eq!(events.next(), Some(10));
    /// assert_eq!(events.next(), Some(15));
    /// ```
    pub fn snapshot<B, C, F>(&self, cell: &Cell<B>, f: F) -> Stream<C>
    where
        B: Clone + Send + Sync + 'static,
        C: Clone + Send + Sync + 'static,
        F: Fn(A, B) -> C + Send + Sync + 'static,
    {
        commit(|| {
            let out = Stream { core: new_core() };
            let weak = Arc::downgrade(&out.core);
            let cell = cell.clone();
            let action: Arc<Action<A>> = Arc::new(move |a| {
                let value = cell::sample_in_transaction(&cell);
                if let Some(core) = weak.upgrade() {
                    send(&core, f(a, value));
                }
            });
            let listener =
                listen_with(self, out.node().clone(), EdgeKind::Immediate, false, action);
            out.retain(listener);
            out
        })
    }

    /// A stream that fires only the first event delivered to it, then
    /// unlinks itself within the same transaction.
    pub fn once(&self) -> Stream<A> {
        commit(|| {
            let out = Stream { core: new_core() };
            let weak = Arc::downgrade(&out.core);
            let slot: Arc<Mutex<Option<Listener>>> = Arc::new(Mutex::new(None));
            let slot2 = slot.clone();
            let action: Arc<Action<A>> = Arc::new(move |a| {
                if let Some(core) = weak.upgrade() {
                    send(&core, a);
                }
                if let Some(listener) = slot2.lock().unwrap().take() {
                    listener.unlisten();
                }
            });
            let listener =
                listen_with(self, out.node().clone(), EdgeKind::Immediate, false, action);
            *slot.lock().unwrap() = Some(listener.clone());
            out.retain(listener);
            out
        })
    }

    /// Hold the last event of this stream in a cell starting from an
    /// initial value.
    ///
    /// ```
    /// use covalent::StreamSink;
    ///
    /// let sink = StreamSink::new();
    /// let cell = sink.stream().hold(0);
    /// assert_eq!(cell.sample(), 0);
    /// sink.send(2).unwrap();
    /// assert_eq!(cell.sample(), 2);
    /// ```
    pub fn hold(&self, initial: A) -> Cell<A> {
        cell::hold(initial, self)
    }

    /// Accumulate event firings in a cell.
    ///
    /// Starting from `initial`, each event updates the state as prescribed
    /// by `f(state, event)`. The state visible to `sample` within a
    /// transaction is the state from before that transaction.
    ///
    /// ```
    /// use covalent::StreamSink;
    ///
    /// let sink = StreamSink::new();
    /// let sum = sink.stream().accum(0, |state, a| state + a);
    /// assert_eq!(sum.sample(), 0);
    /// sink.send(2).unwrap();
    /// sink.send(4).unwrap();
    /// assert_eq!(sum.sample(), 6);
    /// ```
    pub fn accum<S, F>(&self, initial: S, f: F) -> Cell<S>
    where
        S: Clone + Send + Sync + 'static,
        F: Fn(S, A) -> S + Send + Sync + 'static,
    {
        commit(|| {
            let state = CellLoop::new();
            let updated = self.snapshot(&state.cell(), move |a, s| f(s, a));
            let out = updated.hold(initial);
            state
                .loop_(&out)
                .expect("accumulator loop defined exactly once");
            out
        })
    }

    /// Transform the stream with a stateful function.
    ///
    /// `f` maps each event and the current state to an output event and
    /// the successor state, starting from `initial`.
    ///
    /// ```
    /// use covalent::StreamSink;
    ///
    /// let sink = StreamSink::new();
    /// let labelled = sink.stream().collect(0, |a, n: i32| (format!("{n}: {a}"), n + 1));
    /// let mut events = labelled.events();
    /// sink.send("first").unwrap();
    /// sink.send("second").unwrap();
    /// assert_eq!(events.next().as_deref(), Some("0: first"));
    /// assert_eq!(events.next().as_deref(), Some("1: second"));
    /// ```
    pub fn collect<B, S, F>(&self, initial: S, f: F) -> Stream<B>
    where
        B: Clone + Send + Sync + 'static,
        S: Clone + Send + Sync + 'static,
        F: Fn(A, S) -> (B, S) + Send + Sync + 'static,
    {
        commit(|| {
            let state = CellLoop::new();
            let both = self.snapshot(&state.cell(), move |a, s| f(a, s));
            let out = both.map(|(b, _)| b);
            let successor = both.map(|(_, s)| s).hold(initial);
            state
                .loop_(&successor)
                .expect("collect loop defined exactly once");
            out
        })
    }

    /// Attach a handler to the stream and keep it registered until
    /// [`Listener::unlisten`], independent of the returned handle.
    ///
    /// Handlers run during propagation, on the thread that opened the
    /// transaction. They must not send into any sink.
    pub fn listen<F>(&self, handler: F) -> Listener
    where
        F: Fn(A) + Send + Sync + 'static,
    {
        self.listen_weak(handler).keep_alive()
    }

    /// Attach a handler whose registration lives only as long as the
    /// returned handle: dropping every clone deregisters it.
    pub fn listen_weak<F>(&self, handler: F) -> Listener
    where
        F: Fn(A) + Send + Sync + 'static,
    {
        let action: Arc<Action<A>> = Arc::new(handler);
        listen_with(self, Node::new(), EdgeKind::Immediate, false, action)
    }

    /// A blocking iterator over the stream.
    pub fn events(&self) -> Events<A> {
        Events::new(self)
    }

    /// Define a stream in terms of itself.
    ///
    /// The closure receives a placeholder for the result and must return
    /// the defining stream; both happen within a single transaction.
    pub fn cyclic<F>(f: F) -> Stream<A>
    where
        F: FnOnce(&Stream<A>) -> Stream<A>,
    {
        commit(|| {
            let placeholder = StreamLoop::new();
            let definition = f(&placeholder.stream());
            placeholder
                .loop_(&definition)
                .expect("cyclic stream defined exactly once");
            placeholder.stream()
        })
    }
}

/// Forward declaration of a stream, used to build recursive definitions.
///
/// The placeholder stream is available immediately; the defining stream is
/// supplied later with [`StreamLoop::loop_`], within the same transaction.
pub struct StreamLoop<A> {
    stream: Stream<A>,
    state: Arc<Mutex<crate::transaction::LoopState>>,
}

impl<A: Clone + Send + Sync + 'static> StreamLoop<A> {
    /// Create a placeholder stream.
    ///
    /// # Panics
    ///
    /// Panics when no transaction is active on this thread; loops only
    /// make sense inside [`crate::run`] (or a combinator that opens a
    /// transaction, like [`Stream::cyclic`]).
    pub fn new() -> StreamLoop<A> {
        assert!(
            transaction::active(),
            "StreamLoop::new must be called within a transaction"
        );
        StreamLoop {
            stream: Stream { core: new_core() },
            state: transaction::register_loop(),
        }
    }

    /// The placeholder stream.
    pub fn stream(&self) -> Stream<A> {
        self.stream.clone()
    }

    /// Bind the placeholder to its definition.
    ///
    /// # Errors
    ///
    /// [`Error::DoubleLoop`] when the placeholder is already defined, and
    /// [`Error::LoopNotClosed`] when called from a different transaction
    /// than the one that created the placeholder.
    pub fn loop_(&self, definition: &Stream<A>) -> Result<()> {
        commit(|| {
            {
                let mut state = self.state.lock().unwrap();
                if state.defined {
                    return Err(Error::DoubleLoop);
                }
                if transaction::current_id() != Some(state.transaction) {
                    return Err(Error::LoopNotClosed);
                }
                state.defined = true;
            }
            let weak = Arc::downgrade(&self.stream.core);
            let action: Arc<Action<A>> = Arc::new(move |a| {
                if let Some(core) = weak.upgrade() {
                    send(&core, a);
                }
            });
            // The back edge of the cycle: exempt from rank analysis.
            let listener = listen_with(
                definition,
                self.stream.node().clone(),
                EdgeKind::Delayed,
                false,
                action,
            );
            self.stream.retain(listener);
            Ok(())
        })
    }
}

/// A blocking iterator over events in a stream.
///
/// The iterator buffers firings through a channel; `next` blocks until the
/// next event is sent, and ends once the stream is dropped.
pub struct Events<A> {
    receiver: Receiver<A>,
    #[allow(dead_code)]
    listener: Listener,
}

impl<A: Clone + Send + Sync + 'static> Events<A> {
    fn new(stream: &Stream<A>) -> Events<A> {
        let (tx, rx) = channel();
        let tx = Mutex::new(tx);
        let listener = stream.listen_weak(move |a| {
            let _ = tx.lock().unwrap().send(a);
        });
        Events {
            receiver: rx,
            listener,
        }
    }
}

impl<A> Iterator for Events<A> {
    type Item = A;
    fn next(&mut self) -> Option<A> {
        self.receiver.recv().ok()
    }
}

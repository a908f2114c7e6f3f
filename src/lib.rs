//! *Covalent* provides primitives for transactional functional reactive
//! programming (FRP) in Rust, in the tradition of the
//! [Sodium](https://github.com/SodiumFRP/sodium/) family of libraries.
//!
//! Functional reactive programming models a reactive system as a graph of
//! compositional primitives instead of ad-hoc observer callbacks. This
//! library provides two basic types: [`Stream`], a sequence of discrete
//! events, and [`Cell`], a container for a value that changes over time.
//! Everything that happens as a consequence of one event is applied
//! atomically inside a *transaction*: propagation visits the dependency
//! graph in topological order, so no listener or snapshot can observe a
//! half-updated state, and all events fired inside one transaction are
//! simultaneous.
//!
//! # Usage example
//!
//! Events enter the graph through a [`StreamSink`]. From its stream one
//! can map, filter, merge and accumulate; a cell holds the latest value:
//!
//! ```
//! use covalent::StreamSink;
//!
//! let sink = StreamSink::new();
//! let stream = sink.stream();
//! let cell = stream.hold(3);
//!
//! // The current value of the cell is initially 3
//! assert_eq!(cell.sample(), 3);
//!
//! // When we fire an event, the cell gets updated accordingly
//! sink.send(5).unwrap();
//! assert_eq!(cell.sample(), 5);
//! ```
//!
//! One can also iterate over the stream directly:
//!
//! ```
//! # use covalent::StreamSink;
//! # let sink = StreamSink::new();
//! let mut events = sink.stream().events();
//! sink.send(4).unwrap();
//! assert_eq!(events.next(), Some(4));
//! ```
//!
//! Several sends become simultaneous when wrapped in [`run`]; here both
//! inputs of a merge fire in the same transaction, so the merge combines
//! them instead of firing twice:
//!
//! ```
//! # use covalent::StreamSink;
//! let a = StreamSink::new();
//! let b = StreamSink::new();
//! let mut sums = a.stream().merge(&b.stream(), |l, r| l + r).events();
//! covalent::run(|| {
//!     a.send(2).unwrap();
//!     b.send(3).unwrap();
//! })
//! .unwrap();
//! assert_eq!(sums.next(), Some(5));
//! ```
//!
//! Recursive definitions — accumulators, counters, state machines — are
//! expressed with forward references ([`StreamLoop`], [`CellLoop`]) or
//! their closure forms [`Stream::cyclic`] and [`Cell::cyclic`]:
//!
//! ```
//! # use covalent::StreamSink;
//! let deltas = StreamSink::new();
//! let total = deltas.stream().accum(0, |sum, d| sum + d);
//! deltas.feed([1, 2, 3]).unwrap();
//! assert_eq!(total.sample(), 6);
//! ```
//!
//! # Functions passed to primitives
//!
//! The functions supplied to `map`, `filter`, `snapshot` and friends
//! should be pure: they may run at arbitrary points of a transaction and
//! must not have observable side effects. Side effects belong in
//! listeners attached with [`Stream::listen`] — and listeners in turn must
//! not feed values back into any sink; such a send is rejected with
//! [`Error::SendFromCallback`]. All primitives are `Send + Sync + Clone`,
//! so they can be handed freely between threads; sends from different
//! threads are serialized, one transaction at a time.

#![warn(missing_docs)]

mod cell;
mod error;
mod listener;
mod node;
mod queue;
mod stream;
#[cfg(test)]
mod testing;
mod transaction;

pub use cell::{Cell, CellLoop, CellSink};
pub use error::{Error, Result};
pub use listener::Listener;
pub use stream::{Events, Stream, StreamLoop, StreamSink};
pub use transaction::run;

//! Errors surfaced by transactions and graph edits.

use thiserror::Error;

/// Shorthand for results produced by the engine.
pub type Result<T> = std::result::Result<T, Error>;

/// Things that can go wrong while building or running the dataflow graph.
///
/// The first three variants are recoverable: they are reported to the
/// caller and leave the engine in a usable state. `RankOverflow` and
/// `CycleDetected` indicate that the propagation order can no longer be
/// maintained; a graph that produced one of them should be discarded.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// A sink was fed from inside a listener callback. Listeners observe
    /// the current transaction and must not originate new ones.
    #[error("send invoked from inside a listener callback")]
    SendFromCallback,

    /// A forward reference was still undefined when the transaction that
    /// created it closed, or it was defined in a different transaction.
    #[error("forward reference was not defined within its transaction")]
    LoopNotClosed,

    /// A forward reference was defined twice.
    #[error("forward reference was defined twice")]
    DoubleLoop,

    /// A node rank left the representable range during regeneration.
    #[error("node rank overflowed during regeneration")]
    RankOverflow,

    /// Rank regeneration did not terminate within its depth bound, which
    /// means an immediate dependency cycle was built without going through
    /// a stream or cell loop.
    #[error("rank regeneration exceeded its depth bound: dependency cycle")]
    CycleDetected,
}

#![deny(missing_docs)]

//! # smkt-fsm — Finite-State-Machine Runtime
//!
//! A reusable engine that drives many independent entities through one
//! transition chart. The storage-market provider and client deal charts
//! are both built on it.
//!
//! ## Model
//!
//! - A [`Machine`] names four types: the entity key, the state enum, the
//!   event type, and the entity record the actions mutate.
//! - A [`TransitionTable`] is an ordered list of [`Rule`]s:
//!   `event × source states → target state + action`. The table is
//!   validated once in [`Fsm::new`]; ambiguous or terminal-sourced rules
//!   are configuration errors.
//! - Actions are plain functions of `(&mut entity, &transition)` returning
//!   [`Effects`]: an optional next event to dispatch immediately, futures
//!   to await, and closures to poll on each tick. Actions never call back
//!   into the engine.
//!
//! ## Concurrency
//!
//! Each entity sits behind its own mutex. [`Fsm::send`] holds that mutex
//! for the whole hop (lookup, action, commit) and for the synchronous
//! chain of emitted follow-ups, so two sends for the same entity are
//! serialized while sends for different entities never contend. Awaited
//! futures are spawned only after the mutex is released.

pub mod effects;
pub mod engine;
pub mod error;
pub mod table;

pub use effects::{BoxFuture, Effects, PollFn};
pub use engine::{Fsm, TransitionRecord};
pub use error::FsmError;
pub use table::{Action, Rule, RuleBuilder, Sources, Transition, TransitionTable};

use std::fmt::{Debug, Display};
use std::hash::Hash;

/// A state of a machine's chart.
pub trait MachineState: Copy + Eq + Hash + Debug + Display + Send + Sync + 'static {
    /// Terminal states accept no events.
    fn is_terminal(&self) -> bool;
}

/// An event dispatched against an entity.
///
/// Events may carry payloads; rule lookup uses only the copyable
/// [`kind`](MachineEvent::kind). Payload-free event enums use `Kind = Self`.
pub trait MachineEvent: Debug + Send + 'static {
    /// The discriminant used for rule lookup.
    type Kind: Copy + Eq + Hash + Debug + Display + Send + Sync + 'static;

    /// The discriminant of this event.
    fn kind(&self) -> Self::Kind;
}

/// Bundles the types one chart operates on.
pub trait Machine: Send + Sync + 'static {
    /// Entity identifier.
    type Key: Clone + Eq + Hash + Debug + Display + Send + Sync + 'static;
    /// Chart state.
    type State: MachineState;
    /// Dispatched event.
    type Event: MachineEvent;
    /// Per-entity record mutated by actions.
    type Entity: Send + 'static;
}

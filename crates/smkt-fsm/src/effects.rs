//! # Action Effects
//!
//! What an action asks the engine to do after its transition commits.
//!
//! - **emit**: dispatch one follow-up event immediately, still under the
//!   entity's lock.
//! - **await**: spawn a future on the tokio runtime; when it yields
//!   `Some(event)` the event is sent. `None` means nothing will follow,
//!   e.g. the chain watcher was stopped.
//! - **poll**: run a closure on every tick until it yields an event. A
//!   poller is bound to the state it was registered in and is discarded
//!   once the entity leaves that state.

use std::future::Future;
use std::pin::Pin;

/// A boxed future resolving to an optional follow-up event.
pub type BoxFuture<E> = Pin<Box<dyn Future<Output = Option<E>> + Send + 'static>>;

/// A tick-driven poll closure.
pub type PollFn<E> = Box<dyn FnMut() -> Option<E> + Send + 'static>;

/// The effects produced by one action invocation.
pub struct Effects<E> {
    pub(crate) emit: Option<E>,
    pub(crate) awaits: Vec<BoxFuture<E>>,
    pub(crate) polls: Vec<PollFn<E>>,
}

impl<E> Effects<E> {
    /// No follow-up: the target state is a wait point.
    pub fn none() -> Self {
        Self {
            emit: None,
            awaits: Vec::new(),
            polls: Vec::new(),
        }
    }

    /// Dispatch `event` right after the transition commits.
    pub fn emit(event: E) -> Self {
        Self {
            emit: Some(event),
            ..Self::none()
        }
    }

    /// Await `fut` and dispatch the event it yields.
    pub fn await_event(fut: impl Future<Output = Option<E>> + Send + 'static) -> Self {
        Self::none().and_await(fut)
    }

    /// Poll `f` on every tick until it yields an event.
    pub fn poll(f: impl FnMut() -> Option<E> + Send + 'static) -> Self {
        Self::none().and_poll(f)
    }

    /// Add an awaited future.
    pub fn and_await(mut self, fut: impl Future<Output = Option<E>> + Send + 'static) -> Self {
        self.awaits.push(Box::pin(fut));
        self
    }

    /// Add a poll closure.
    pub fn and_poll(mut self, f: impl FnMut() -> Option<E> + Send + 'static) -> Self {
        self.polls.push(Box::new(f));
        self
    }

    /// The event this action emits, if any.
    pub fn emitted(&self) -> Option<&E> {
        self.emit.as_ref()
    }

    /// Number of deferred effects (awaits plus polls).
    pub fn deferred_len(&self) -> usize {
        self.awaits.len() + self.polls.len()
    }

    /// Whether the action requested nothing.
    pub fn is_empty(&self) -> bool {
        self.emit.is_none() && self.awaits.is_empty() && self.polls.is_empty()
    }
}

impl<E> Default for Effects<E> {
    fn default() -> Self {
        Self::none()
    }
}

impl<E: std::fmt::Debug> std::fmt::Debug for Effects<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Effects")
            .field("emit", &self.emit)
            .field("awaits", &self.awaits.len())
            .field("polls", &self.polls.len())
            .finish()
    }
}

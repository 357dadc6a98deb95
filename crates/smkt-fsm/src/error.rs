//! Engine errors.
//!
//! States, events and keys are rendered to strings so one error type
//! serves every machine and wraps cleanly into caller error enums.

use thiserror::Error;

/// Errors raised by table validation and dispatch.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FsmError {
    // ── Configuration ────────────────────────────────────────────────
    /// Two rules resolve the same (state, event) pair.
    #[error("duplicate transition rule for event {event} in state {state}")]
    DuplicateRule {
        /// The source state, or `*` for from-any rules.
        state: String,
        /// The event kind.
        event: String,
    },

    /// A rule names a terminal state as an explicit source.
    #[error("transition rule for event {event} lists terminal state {state} as a source")]
    TerminalSource {
        /// The terminal state.
        state: String,
        /// The event kind.
        event: String,
    },

    /// A rule has neither explicit sources nor from-any.
    #[error("transition rule for event {event} has no source states")]
    EmptySources {
        /// The event kind.
        event: String,
    },

    // ── Protocol ─────────────────────────────────────────────────────
    /// No rule accepts the event in the entity's current state.
    #[error("illegal transition for {key}: event {event} in state {state}")]
    IllegalTransition {
        /// The entity key.
        key: String,
        /// The entity's current state.
        state: String,
        /// The rejected event kind.
        event: String,
    },

    /// The entity was never registered with [`begin`](crate::Fsm::begin).
    #[error("unknown entity {key}")]
    UnknownEntity {
        /// The entity key.
        key: String,
    },

    /// [`begin`](crate::Fsm::begin) was called twice for one key.
    #[error("entity {key} is already registered")]
    AlreadyRegistered {
        /// The entity key.
        key: String,
    },

    // ── Runtime ──────────────────────────────────────────────────────
    /// An action produced an awaited effect but no tokio runtime is
    /// available to spawn it on.
    #[error("no tokio runtime available to run an awaited effect")]
    NoRuntime,
}

impl FsmError {
    /// Whether this error stems from an invalid transition table.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::DuplicateRule { .. } | Self::TerminalSource { .. } | Self::EmptySources { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn illegal_transition_names_all_parts() {
        let err = FsmError::IllegalTransition {
            key: "deal-1".into(),
            state: "Validating".into(),
            event: "Funded".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("deal-1"));
        assert!(msg.contains("Validating"));
        assert!(msg.contains("Funded"));
    }

    #[test]
    fn configuration_classification() {
        assert!(FsmError::EmptySources { event: "Open".into() }.is_configuration());
        assert!(!FsmError::NoRuntime.is_configuration());
        assert!(!FsmError::UnknownEntity { key: "k".into() }.is_configuration());
    }
}

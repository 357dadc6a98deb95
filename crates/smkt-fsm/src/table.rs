//! # Transition Table
//!
//! Rules are declared with a small builder:
//!
//! ```text
//! Rule::on(Open).from(Unknown).to(Validating).action(validate)
//! Rule::on(NodeErrored).from_any().to(Failing).action(fail)
//! Rule::on(VerifiedData).from_many([VerifyData, WaitingForData]).to(EnsureProviderFunds)
//! ```
//!
//! ## Resolution
//!
//! A from-any rule matches every non-terminal state. An explicit rule for
//! a (state, event) pair takes precedence over a from-any rule for the
//! same event. Terminal states match nothing.
//!
//! ## Validation
//!
//! [`TransitionTable::compile`] rejects, in rule order:
//! duplicate explicit (state, event) pairs, a second from-any rule for one
//! event, explicit terminal sources and rules with no sources.

use std::collections::HashMap;
use std::sync::Arc;

use crate::effects::Effects;
use crate::error::FsmError;
use crate::{Machine, MachineEvent, MachineState};

/// The transition an action is invoked for.
pub struct Transition<'a, M: Machine> {
    /// The entity being advanced.
    pub key: &'a M::Key,
    /// State before the transition.
    pub from: M::State,
    /// State the transition commits to.
    pub to: M::State,
    /// The dispatched event.
    pub event: &'a M::Event,
}

/// An action handler.
pub type Action<M> = Arc<
    dyn Fn(&mut <M as Machine>::Entity, &Transition<'_, M>) -> Effects<<M as Machine>::Event>
        + Send
        + Sync,
>;

/// Source states of a rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sources<S> {
    /// An explicit list.
    States(Vec<S>),
    /// Every non-terminal state.
    Any,
}

/// First half of a rule: event kind and sources, awaiting a target.
pub struct RuleBuilder<M: Machine> {
    event: <M::Event as MachineEvent>::Kind,
    sources: Sources<M::State>,
}

impl<M: Machine> RuleBuilder<M> {
    /// Add one explicit source state. Ignored after [`from_any`](Self::from_any).
    pub fn from(mut self, state: M::State) -> Self {
        if let Sources::States(states) = &mut self.sources {
            states.push(state);
        }
        self
    }

    /// Add several explicit source states.
    pub fn from_many(mut self, states: impl IntoIterator<Item = M::State>) -> Self {
        if let Sources::States(existing) = &mut self.sources {
            existing.extend(states);
        }
        self
    }

    /// Match every non-terminal state, subsuming explicit sources.
    pub fn from_any(mut self) -> Self {
        self.sources = Sources::Any;
        self
    }

    /// Set the target state.
    pub fn to(self, target: M::State) -> Rule<M> {
        Rule {
            event: self.event,
            sources: self.sources,
            target,
            action: None,
        }
    }
}

/// One transition rule.
pub struct Rule<M: Machine> {
    event: <M::Event as MachineEvent>::Kind,
    sources: Sources<M::State>,
    target: M::State,
    action: Option<Action<M>>,
}

impl<M: Machine> Rule<M> {
    /// Start a rule for an event kind.
    pub fn on(event: <M::Event as MachineEvent>::Kind) -> RuleBuilder<M> {
        RuleBuilder {
            event,
            sources: Sources::States(Vec::new()),
        }
    }

    /// Attach the action run when the rule fires.
    pub fn action<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut M::Entity, &Transition<'_, M>) -> Effects<M::Event> + Send + Sync + 'static,
    {
        self.action = Some(Arc::new(f));
        self
    }

    /// The event kind.
    pub fn event(&self) -> <M::Event as MachineEvent>::Kind {
        self.event
    }

    /// The source states.
    pub fn sources(&self) -> &Sources<M::State> {
        &self.sources
    }

    /// The target state.
    pub fn target(&self) -> M::State {
        self.target
    }

    pub(crate) fn run(&self, entity: &mut M::Entity, t: &Transition<'_, M>) -> Effects<M::Event> {
        match &self.action {
            Some(action) => action(entity, t),
            None => Effects::none(),
        }
    }
}

/// An ordered, not yet validated rule set.
pub struct TransitionTable<M: Machine> {
    rules: Vec<Rule<M>>,
}

impl<M: Machine> Default for TransitionTable<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M: Machine> TransitionTable<M> {
    /// An empty table.
    pub fn new() -> Self {
        Self { rules: Vec::new() }
    }

    /// Append a rule.
    pub fn rule(mut self, rule: Rule<M>) -> Self {
        self.rules.push(rule);
        self
    }

    /// Number of rules.
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Whether the table has no rules.
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Validate and index the rule set.
    pub fn compile(self) -> Result<CompiledTable<M>, FsmError> {
        let mut explicit = HashMap::new();
        let mut any = HashMap::new();

        for (idx, rule) in self.rules.iter().enumerate() {
            match &rule.sources {
                Sources::Any => {
                    if any.insert(rule.event, idx).is_some() {
                        return Err(FsmError::DuplicateRule {
                            state: "*".to_string(),
                            event: rule.event.to_string(),
                        });
                    }
                }
                Sources::States(states) => {
                    if states.is_empty() {
                        return Err(FsmError::EmptySources {
                            event: rule.event.to_string(),
                        });
                    }
                    for state in states {
                        if state.is_terminal() {
                            return Err(FsmError::TerminalSource {
                                state: state.to_string(),
                                event: rule.event.to_string(),
                            });
                        }
                        if explicit.insert((*state, rule.event), idx).is_some() {
                            return Err(FsmError::DuplicateRule {
                                state: state.to_string(),
                                event: rule.event.to_string(),
                            });
                        }
                    }
                }
            }
        }

        Ok(CompiledTable {
            rules: self.rules,
            explicit,
            any,
        })
    }
}

/// A validated, indexed rule set.
pub struct CompiledTable<M: Machine> {
    rules: Vec<Rule<M>>,
    explicit: HashMap<(M::State, <M::Event as MachineEvent>::Kind), usize>,
    any: HashMap<<M::Event as MachineEvent>::Kind, usize>,
}

impl<M: Machine> CompiledTable<M> {
    /// The rule resolving `event` in `state`, if any.
    pub fn lookup(
        &self,
        state: M::State,
        event: <M::Event as MachineEvent>::Kind,
    ) -> Option<&Rule<M>> {
        if state.is_terminal() {
            return None;
        }
        self.explicit
            .get(&(state, event))
            .or_else(|| self.any.get(&event))
            .and_then(|&idx| self.rules.get(idx))
    }

    /// All rules, in declaration order.
    pub fn rules(&self) -> &[Rule<M>] {
        &self.rules
    }
}

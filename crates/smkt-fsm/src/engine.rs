//! # Engine
//!
//! [`Fsm`] owns the entity table and dispatches events against it.
//!
//! ## Dispatch
//!
//! ```text
//! send(key, event)
//!   lock entity
//!   loop:
//!     rule = table.lookup(state, event.kind)   // none → IllegalTransition
//!     effects = rule.action(&mut entity, transition)
//!     state = rule.target; log.push(record)
//!     abort tasks and drop polls bound to other states
//!     register polls; collect awaits
//!     event = effects.emit or break
//!   spawn collected awaits, bound to the state reached
//!   unlock entity
//! ```
//!
//! Awaits are spawned only after the emit chain has drained and before
//! the lock is released, so a future that resolves instantly still finds
//! the entity in the wait state it was bound to. Leaving that state, or
//! reaching a terminal one, aborts the task and drops whatever it holds.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::MissedTickBehavior;

use crate::effects::{BoxFuture, Effects, PollFn};
use crate::error::FsmError;
use crate::table::{CompiledTable, Transition, TransitionTable};
use crate::{Machine, MachineEvent, MachineState};

type KindOf<M> = <<M as Machine>::Event as MachineEvent>::Kind;

/// One committed transition of an entity.
///
/// Every hop is appended to the entity's log with its source and target
/// states, the event kind that caused it and a timestamp. Operators read
/// the log to see how a deal reached its current state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionRecord<S, K> {
    /// State before the transition.
    pub from: S,
    /// State after the transition.
    pub to: S,
    /// The event kind that fired the rule.
    pub event: K,
    /// When the transition committed.
    pub timestamp: DateTime<Utc>,
}

struct Poller<M: Machine> {
    state: M::State,
    f: PollFn<M::Event>,
}

struct Task<M: Machine> {
    state: M::State,
    handle: AbortHandle,
}

struct Slot<M: Machine> {
    state: M::State,
    entity: M::Entity,
    log: Vec<TransitionRecord<M::State, KindOf<M>>>,
    pollers: Vec<Poller<M>>,
    tasks: Vec<Task<M>>,
}

impl<M: Machine> Slot<M> {
    /// Drop pollers and abort tasks not bound to `state`.
    fn release_stale(&mut self, state: M::State) {
        let terminal = state.is_terminal();
        self.pollers.retain(|p| !terminal && p.state == state);
        self.tasks.retain(|t| {
            let keep = !terminal && t.state == state && !t.handle.is_finished();
            if !keep {
                t.handle.abort();
            }
            keep
        });
    }
}

struct Inner<M: Machine> {
    table: CompiledTable<M>,
    entities: RwLock<HashMap<M::Key, Arc<Mutex<Slot<M>>>>>,
    runtime: Option<Handle>,
}

/// A running state machine over many entities.
///
/// Cloning is cheap and shares the entity table.
pub struct Fsm<M: Machine> {
    inner: Arc<Inner<M>>,
}

impl<M: Machine> Clone for Fsm<M> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<M: Machine> std::fmt::Debug for Fsm<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fsm")
            .field("entities", &self.len())
            .field("rules", &self.inner.table.rules().len())
            .finish()
    }
}

impl<M: Machine> Fsm<M> {
    /// Validate `table` and create an engine with no entities.
    ///
    /// If called inside a tokio runtime, that runtime is remembered for
    /// awaited effects dispatched from threads outside it.
    pub fn new(table: TransitionTable<M>) -> Result<Self, FsmError> {
        let table = table.compile()?;
        Ok(Self {
            inner: Arc::new(Inner {
                table,
                entities: RwLock::new(HashMap::new()),
                runtime: Handle::try_current().ok(),
            }),
        })
    }

    // ── Entity lifecycle ─────────────────────────────────────────────

    /// Register `key` at `initial`. Fails if the key is already present.
    pub fn begin(&self, key: M::Key, entity: M::Entity, initial: M::State) -> Result<(), FsmError> {
        use std::collections::hash_map::Entry;

        let mut entities = self.inner.entities.write();
        match entities.entry(key) {
            Entry::Occupied(e) => Err(FsmError::AlreadyRegistered {
                key: e.key().to_string(),
            }),
            Entry::Vacant(v) => {
                tracing::debug!(key = %v.key(), state = %initial, "entity registered");
                v.insert(Arc::new(Mutex::new(Slot {
                    state: initial,
                    entity,
                    log: Vec::new(),
                    pollers: Vec::new(),
                    tasks: Vec::new(),
                })));
                Ok(())
            }
        }
    }

    /// Evict an entity. The chart never calls this; it is an
    /// administrative operation. Returns whether the key was present.
    pub fn remove(&self, key: &M::Key) -> bool {
        let Some(slot) = self.inner.entities.write().remove(key) else {
            return false;
        };
        for task in slot.lock().tasks.drain(..) {
            task.handle.abort();
        }
        true
    }

    // ── Dispatch ─────────────────────────────────────────────────────

    /// Dispatch `event` against `key` and follow emitted events until the
    /// chain stops. Returns the state reached.
    ///
    /// The first event is validated before anything runs: an unknown key
    /// or an event the current state does not accept leaves the entity
    /// untouched. A rejected follow-up event is a chart defect; the hops
    /// already committed stay committed and the error is returned.
    pub fn send(&self, key: &M::Key, event: M::Event) -> Result<M::State, FsmError> {
        let slot = self.slot(key)?;
        let mut awaits = Vec::new();
        let (outcome, spawned) = {
            let mut guard = slot.lock();
            let outcome = self.dispatch(key, &mut guard, event, &mut awaits);
            (outcome, self.spawn_awaits(key, &mut guard, awaits))
        };
        let state = outcome?;
        spawned?;
        Ok(state)
    }

    fn dispatch(
        &self,
        key: &M::Key,
        slot: &mut Slot<M>,
        event: M::Event,
        awaits: &mut Vec<BoxFuture<M::Event>>,
    ) -> Result<M::State, FsmError> {
        let mut next = Some(event);
        let mut hops = 0usize;

        while let Some(event) = next.take() {
            let from = slot.state;
            let kind = event.kind();
            let Some(rule) = self.inner.table.lookup(from, kind) else {
                if hops == 0 {
                    tracing::debug!(key = %key, state = %from, event = %kind, "event rejected");
                } else {
                    tracing::error!(
                        key = %key, state = %from, event = %kind,
                        "follow-up event rejected by the transition table"
                    );
                }
                return Err(FsmError::IllegalTransition {
                    key: key.to_string(),
                    state: from.to_string(),
                    event: kind.to_string(),
                });
            };
            let to = rule.target();

            let effects = {
                let transition = Transition {
                    key,
                    from,
                    to,
                    event: &event,
                };
                rule.run(&mut slot.entity, &transition)
            };

            slot.state = to;
            slot.log.push(TransitionRecord {
                from,
                to,
                event: kind,
                timestamp: Utc::now(),
            });
            tracing::debug!(key = %key, from = %from, to = %to, event = %kind, "transition");

            let Effects {
                emit,
                awaits: pending,
                polls,
            } = effects;
            slot.release_stale(to);
            if !to.is_terminal() {
                slot.pollers
                    .extend(polls.into_iter().map(|f| Poller { state: to, f }));
            }
            awaits.extend(pending);
            next = emit;
            hops += 1;
        }

        Ok(slot.state)
    }

    fn spawn_awaits(
        &self,
        key: &M::Key,
        slot: &mut Slot<M>,
        awaits: Vec<BoxFuture<M::Event>>,
    ) -> Result<(), FsmError> {
        if awaits.is_empty() {
            return Ok(());
        }
        let state = slot.state;
        if state.is_terminal() {
            tracing::debug!(key = %key, state = %state, count = awaits.len(), "awaits dropped at terminal state");
            return Ok(());
        }
        let Some(handle) = self.handle() else {
            tracing::error!(key = %key, "awaited effect dropped: no tokio runtime");
            return Err(FsmError::NoRuntime);
        };
        for fut in awaits {
            let fsm = self.clone();
            let key = key.clone();
            let task = handle.spawn(async move {
                if let Some(event) = fut.await {
                    if let Err(err) = fsm.send(&key, event) {
                        tracing::warn!(key = %key, error = %err, "awaited event not applied");
                    }
                }
            });
            slot.tasks.push(Task {
                state,
                handle: task.abort_handle(),
            });
        }
        Ok(())
    }

    fn handle(&self) -> Option<Handle> {
        Handle::try_current()
            .ok()
            .or_else(|| self.inner.runtime.clone())
    }

    // ── Tick ─────────────────────────────────────────────────────────

    /// Run every registered poller once and dispatch the events they
    /// yield. Safe to call with nothing pending. Returns the number of
    /// events produced.
    pub fn tick(&self) -> usize {
        let slots: Vec<_> = self
            .inner
            .entities
            .read()
            .iter()
            .map(|(k, s)| (k.clone(), Arc::clone(s)))
            .collect();

        let mut fired = 0;
        for (key, slot) in slots {
            let ready = {
                let mut guard = slot.lock();
                if guard.pollers.is_empty() {
                    continue;
                }
                let current = guard.state;
                guard.pollers.retain(|p| p.state == current);
                let mut ready = Vec::new();
                guard.pollers.retain_mut(|p| match (p.f)() {
                    Some(event) => {
                        ready.push(event);
                        false
                    }
                    None => true,
                });
                ready
            };
            for event in ready {
                fired += 1;
                if let Err(err) = self.send(&key, event) {
                    tracing::warn!(key = %key, error = %err, "polled event not applied");
                }
            }
        }
        fired
    }

    /// Spawn a loop calling [`tick`](Self::tick) every `period`.
    ///
    /// The loop holds only a weak reference and exits once every `Fsm`
    /// handle is dropped. Abort the returned handle to stop it earlier.
    pub fn run_ticker(&self, period: Duration) -> Result<JoinHandle<()>, FsmError> {
        let handle = self.handle().ok_or(FsmError::NoRuntime)?;
        let weak = Arc::downgrade(&self.inner);
        Ok(handle.spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                Fsm { inner }.tick();
            }
        }))
    }

    // ── Read access ──────────────────────────────────────────────────

    /// Current state of `key`.
    pub fn state(&self, key: &M::Key) -> Result<M::State, FsmError> {
        Ok(self.slot(key)?.lock().state)
    }

    /// Run `f` over a consistent view of state, entity and log. The view
    /// is taken under the same lock `send` holds across a commit.
    pub fn inspect<R>(
        &self,
        key: &M::Key,
        f: impl FnOnce(M::State, &M::Entity, &[TransitionRecord<M::State, KindOf<M>>]) -> R,
    ) -> Result<R, FsmError> {
        let slot = self.slot(key)?;
        let guard = slot.lock();
        Ok(f(guard.state, &guard.entity, &guard.log))
    }

    /// Mutate an entity's scratch fields outside the chart. The state is
    /// passed read-only; only dispatch changes it.
    pub fn update<R>(
        &self,
        key: &M::Key,
        f: impl FnOnce(M::State, &mut M::Entity) -> R,
    ) -> Result<R, FsmError> {
        let slot = self.slot(key)?;
        let mut guard = slot.lock();
        let state = guard.state;
        Ok(f(state, &mut guard.entity))
    }

    /// All registered keys.
    pub fn keys(&self) -> Vec<M::Key> {
        self.inner.entities.read().keys().cloned().collect()
    }

    /// Number of registered entities.
    pub fn len(&self) -> usize {
        self.inner.entities.read().len()
    }

    /// Whether no entity is registered.
    pub fn is_empty(&self) -> bool {
        self.inner.entities.read().is_empty()
    }

    /// Whether `key` is registered.
    pub fn contains(&self, key: &M::Key) -> bool {
        self.inner.entities.read().contains_key(key)
    }

    /// Number of pollers waiting on `key`.
    pub fn pending_polls(&self, key: &M::Key) -> Result<usize, FsmError> {
        Ok(self.slot(key)?.lock().pollers.len())
    }

    /// Number of awaited effects still running for `key`.
    pub fn pending_awaits(&self, key: &M::Key) -> Result<usize, FsmError> {
        let slot = self.slot(key)?;
        let mut guard = slot.lock();
        guard.tasks.retain(|t| !t.handle.is_finished());
        Ok(guard.tasks.len())
    }

    /// The state `event` would move an entity in `state` to, if accepted.
    pub fn target(&self, state: M::State, event: KindOf<M>) -> Option<M::State> {
        self.inner.table.lookup(state, event).map(|r| r.target())
    }

    /// Whether an entity in `state` accepts `event`.
    pub fn accepts(&self, state: M::State, event: KindOf<M>) -> bool {
        self.target(state, event).is_some()
    }

    fn slot(&self, key: &M::Key) -> Result<Arc<Mutex<Slot<M>>>, FsmError> {
        self.inner
            .entities
            .read()
            .get(key)
            .cloned()
            .ok_or_else(|| FsmError::UnknownEntity {
                key: key.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::Rule;
    use std::fmt;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    enum Light {
        Off,
        Warming,
        On,
        Broken,
    }

    impl fmt::Display for Light {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{self:?}")
        }
    }

    impl MachineState for Light {
        fn is_terminal(&self) -> bool {
            matches!(self, Light::Broken)
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    enum Switch {
        Press,
        Warm,
        Release,
        Smash,
    }

    impl fmt::Display for Switch {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{self:?}")
        }
    }

    impl MachineEvent for Switch {
        type Kind = Switch;
        fn kind(&self) -> Switch {
            *self
        }
    }

    #[derive(Default)]
    struct Bulb {
        presses: u32,
    }

    struct Lamp;
    impl Machine for Lamp {
        type Key = String;
        type State = Light;
        type Event = Switch;
        type Entity = Bulb;
    }

    fn lamp() -> Fsm<Lamp> {
        let table = TransitionTable::new()
            .rule(
                Rule::on(Switch::Press)
                    .from(Light::Off)
                    .to(Light::Warming)
                    .action(|bulb: &mut Bulb, _t: &Transition<'_, Lamp>| {
                        bulb.presses += 1;
                        Effects::emit(Switch::Warm)
                    }),
            )
            .rule(Rule::on(Switch::Warm).from(Light::Warming).to(Light::On))
            .rule(Rule::on(Switch::Release).from(Light::On).to(Light::Off))
            .rule(Rule::on(Switch::Smash).from_any().to(Light::Broken));
        Fsm::new(table).unwrap()
    }

    #[test]
    fn begin_twice_fails() {
        let fsm = lamp();
        fsm.begin("a".into(), Bulb::default(), Light::Off).unwrap();
        let err = fsm.begin("a".into(), Bulb::default(), Light::Off).unwrap_err();
        assert!(matches!(err, FsmError::AlreadyRegistered { .. }));
    }

    #[test]
    fn emitted_events_chain_within_one_send() {
        let fsm = lamp();
        fsm.begin("a".into(), Bulb::default(), Light::Off).unwrap();
        let reached = fsm.send(&"a".into(), Switch::Press).unwrap();
        assert_eq!(reached, Light::On);
        let (presses, hops) = fsm
            .inspect(&"a".into(), |_, bulb, log| (bulb.presses, log.len()))
            .unwrap();
        assert_eq!(presses, 1);
        assert_eq!(hops, 2);
    }

    #[test]
    fn illegal_event_leaves_state_untouched() {
        let fsm = lamp();
        fsm.begin("a".into(), Bulb::default(), Light::Off).unwrap();
        let err = fsm.send(&"a".into(), Switch::Release).unwrap_err();
        assert!(matches!(err, FsmError::IllegalTransition { .. }));
        assert_eq!(fsm.state(&"a".into()).unwrap(), Light::Off);
        let hops = fsm.inspect(&"a".into(), |_, _, log| log.len()).unwrap();
        assert_eq!(hops, 0);
    }

    #[test]
    fn unknown_entity_reported() {
        let fsm = lamp();
        let err = fsm.send(&"ghost".into(), Switch::Press).unwrap_err();
        assert_eq!(err, FsmError::UnknownEntity { key: "ghost".into() });
    }

    #[test]
    fn from_any_reaches_terminal_and_terminal_accepts_nothing() {
        let fsm = lamp();
        fsm.begin("a".into(), Bulb::default(), Light::On).unwrap();
        assert_eq!(fsm.send(&"a".into(), Switch::Smash).unwrap(), Light::Broken);
        for ev in [Switch::Press, Switch::Warm, Switch::Release, Switch::Smash] {
            assert!(!fsm.accepts(Light::Broken, ev));
        }
    }

    #[test]
    fn tick_with_nothing_pending_is_noop() {
        let fsm = lamp();
        assert_eq!(fsm.tick(), 0);
        fsm.begin("a".into(), Bulb::default(), Light::Off).unwrap();
        assert_eq!(fsm.tick(), 0);
        assert_eq!(fsm.state(&"a".into()).unwrap(), Light::Off);
    }

    #[test]
    fn poller_fires_on_tick_and_is_discarded_after() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let table = TransitionTable::<Lamp>::new()
            .rule(
                Rule::on(Switch::Press)
                    .from(Light::Off)
                    .to(Light::Warming)
                    .action(move |_, _| {
                        let counter = Arc::clone(&counter);
                        Effects::poll(move || {
                            let n = counter.fetch_add(1, Ordering::SeqCst);
                            (n >= 1).then_some(Switch::Warm)
                        })
                    }),
            )
            .rule(Rule::on(Switch::Warm).from(Light::Warming).to(Light::On));
        let fsm = Fsm::new(table).unwrap();
        fsm.begin("a".into(), Bulb::default(), Light::Off).unwrap();
        assert_eq!(fsm.send(&"a".into(), Switch::Press).unwrap(), Light::Warming);
        assert_eq!(fsm.pending_polls(&"a".into()).unwrap(), 1);

        assert_eq!(fsm.tick(), 0);
        assert_eq!(fsm.state(&"a".into()).unwrap(), Light::Warming);
        assert_eq!(fsm.tick(), 1);
        assert_eq!(fsm.state(&"a".into()).unwrap(), Light::On);
        assert_eq!(fsm.pending_polls(&"a".into()).unwrap(), 0);
        assert_eq!(fsm.tick(), 0);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn stale_poller_dropped_when_state_moves_on() {
        let table = TransitionTable::<Lamp>::new()
            .rule(
                Rule::on(Switch::Press)
                    .from(Light::Off)
                    .to(Light::Warming)
                    .action(|_, _| Effects::poll(|| Some(Switch::Warm))),
            )
            .rule(Rule::on(Switch::Warm).from(Light::Warming).to(Light::On))
            .rule(Rule::on(Switch::Smash).from_any().to(Light::Broken));
        let fsm = Fsm::new(table).unwrap();
        fsm.begin("a".into(), Bulb::default(), Light::Off).unwrap();
        fsm.send(&"a".into(), Switch::Press).unwrap();
        fsm.send(&"a".into(), Switch::Smash).unwrap();
        assert_eq!(fsm.pending_polls(&"a".into()).unwrap(), 0);
        assert_eq!(fsm.tick(), 0);
        assert_eq!(fsm.state(&"a".into()).unwrap(), Light::Broken);
    }

    #[test]
    fn awaited_effect_without_runtime_reports_no_runtime() {
        let table = TransitionTable::<Lamp>::new().rule(
            Rule::on(Switch::Press)
                .from(Light::Off)
                .to(Light::Warming)
                .action(|_, _| Effects::await_event(async { Some(Switch::Warm) })),
        );
        let fsm = Fsm::new(table).unwrap();
        fsm.begin("a".into(), Bulb::default(), Light::Off).unwrap();
        assert_eq!(fsm.send(&"a".into(), Switch::Press), Err(FsmError::NoRuntime));
        assert_eq!(fsm.state(&"a".into()).unwrap(), Light::Warming);
    }

    type Held = Arc<Mutex<Option<tokio::sync::oneshot::Receiver<()>>>>;

    fn holding_lamp(held: Held) -> Fsm<Lamp> {
        let table = TransitionTable::<Lamp>::new()
            .rule(
                Rule::on(Switch::Press)
                    .from(Light::Off)
                    .to(Light::Warming)
                    .action(move |_, _| match held.lock().take() {
                        Some(rx) => Effects::await_event(async move {
                            rx.await.ok().map(|_| Switch::Warm)
                        }),
                        None => Effects::none(),
                    }),
            )
            .rule(Rule::on(Switch::Warm).from(Light::Warming).to(Light::On))
            .rule(Rule::on(Switch::Smash).from_any().to(Light::Broken));
        Fsm::new(table).unwrap()
    }

    async fn closed(tx: &tokio::sync::oneshot::Sender<()>) -> bool {
        for _ in 0..100 {
            if tx.is_closed() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        tx.is_closed()
    }

    #[tokio::test]
    async fn awaited_task_aborted_when_state_moves_on() {
        let (tx, rx) = tokio::sync::oneshot::channel();
        let fsm = holding_lamp(Arc::new(Mutex::new(Some(rx))));
        fsm.begin("a".into(), Bulb::default(), Light::Off).unwrap();
        fsm.send(&"a".into(), Switch::Press).unwrap();
        assert_eq!(fsm.pending_awaits(&"a".into()).unwrap(), 1);

        // Moved on by someone else; the task's receiver must go away.
        assert_eq!(fsm.send(&"a".into(), Switch::Warm).unwrap(), Light::On);
        assert!(closed(&tx).await);
        assert_eq!(fsm.pending_awaits(&"a".into()).unwrap(), 0);
    }

    #[tokio::test]
    async fn awaited_task_aborted_at_terminal_state() {
        let (tx, rx) = tokio::sync::oneshot::channel();
        let fsm = holding_lamp(Arc::new(Mutex::new(Some(rx))));
        fsm.begin("a".into(), Bulb::default(), Light::Off).unwrap();
        fsm.send(&"a".into(), Switch::Press).unwrap();
        assert_eq!(fsm.send(&"a".into(), Switch::Smash).unwrap(), Light::Broken);
        assert!(closed(&tx).await);
        assert_eq!(fsm.pending_awaits(&"a".into()).unwrap(), 0);
    }

    #[tokio::test]
    async fn awaited_task_survives_while_state_holds() {
        let (tx, rx) = tokio::sync::oneshot::channel();
        let fsm = holding_lamp(Arc::new(Mutex::new(Some(rx))));
        fsm.begin("a".into(), Bulb::default(), Light::Off).unwrap();
        fsm.send(&"a".into(), Switch::Press).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!tx.is_closed());

        tx.send(()).unwrap();
        for _ in 0..100 {
            if fsm.state(&"a".into()).unwrap() == Light::On {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(fsm.state(&"a".into()).unwrap(), Light::On);
        assert_eq!(fsm.pending_awaits(&"a".into()).unwrap(), 0);
    }

    #[tokio::test]
    async fn remove_aborts_awaited_tasks() {
        let (tx, rx) = tokio::sync::oneshot::channel();
        let fsm = holding_lamp(Arc::new(Mutex::new(Some(rx))));
        fsm.begin("a".into(), Bulb::default(), Light::Off).unwrap();
        fsm.send(&"a".into(), Switch::Press).unwrap();
        assert!(fsm.remove(&"a".into()));
        assert!(closed(&tx).await);
    }

    #[test]
    fn same_entity_sends_are_serialized() {
        let busy = Arc::new(AtomicBool::new(false));
        let overlaps = Arc::new(AtomicUsize::new(0));
        let (b, o) = (Arc::clone(&busy), Arc::clone(&overlaps));
        let table = TransitionTable::<Lamp>::new().rule(
            Rule::on(Switch::Press)
                .from_many([Light::Off, Light::On])
                .to(Light::On)
                .action(move |bulb: &mut Bulb, _: &Transition<'_, Lamp>| {
                    if b.swap(true, Ordering::SeqCst) {
                        o.fetch_add(1, Ordering::SeqCst);
                    }
                    std::thread::sleep(Duration::from_millis(30));
                    bulb.presses += 1;
                    b.store(false, Ordering::SeqCst);
                    Effects::none()
                }),
        );
        let fsm = Fsm::new(table).unwrap();
        fsm.begin("a".into(), Bulb::default(), Light::Off).unwrap();

        let threads: Vec<_> = (0..4)
            .map(|_| {
                let fsm = fsm.clone();
                std::thread::spawn(move || fsm.send(&"a".into(), Switch::Press))
            })
            .collect();
        for t in threads {
            t.join().unwrap().unwrap();
        }
        assert_eq!(overlaps.load(Ordering::SeqCst), 0);
        let presses = fsm.inspect(&"a".into(), |_, b, _| b.presses).unwrap();
        assert_eq!(presses, 4);
    }

    #[test]
    fn different_entities_do_not_block_each_other() {
        let (entered_tx, entered_rx) = std::sync::mpsc::channel::<()>();
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
        let release_rx = Arc::new(Mutex::new(release_rx));
        let entered_tx = Arc::new(Mutex::new(entered_tx));
        let table = TransitionTable::<Lamp>::new()
            .rule(
                Rule::on(Switch::Press)
                    .from(Light::Off)
                    .to(Light::On)
                    .action(move |_, t| {
                        if t.key == "slow" {
                            let _ = entered_tx.lock().send(());
                            let _ = release_rx.lock().recv();
                        }
                        Effects::none()
                    }),
            );
        let fsm = Fsm::new(table).unwrap();
        fsm.begin("slow".into(), Bulb::default(), Light::Off).unwrap();
        fsm.begin("fast".into(), Bulb::default(), Light::Off).unwrap();

        let slow = {
            let fsm = fsm.clone();
            std::thread::spawn(move || fsm.send(&"slow".into(), Switch::Press))
        };
        entered_rx.recv().unwrap();
        assert_eq!(fsm.send(&"fast".into(), Switch::Press).unwrap(), Light::On);
        release_tx.send(()).unwrap();
        assert_eq!(slow.join().unwrap().unwrap(), Light::On);
    }

    #[test]
    fn remove_evicts_entity() {
        let fsm = lamp();
        fsm.begin("a".into(), Bulb::default(), Light::Off).unwrap();
        assert!(fsm.contains(&"a".into()));
        assert!(fsm.remove(&"a".into()));
        assert!(!fsm.remove(&"a".into()));
        assert!(fsm.is_empty());
    }
}

//! Dispatch properties of the engine over a small payload-carrying chart.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use proptest::prelude::*;
use serde::{Deserialize, Serialize};
use smkt_fsm::{
    Effects, Fsm, FsmError, Machine, MachineEvent, MachineState, Rule, TransitionRecord,
    TransitionTable,
};
use tokio::sync::oneshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
enum Order {
    New,
    Paid,
    Shipped,
    Delivered,
    Cancelled,
}

const ALL_STATES: [Order; 5] = [
    Order::New,
    Order::Paid,
    Order::Shipped,
    Order::Delivered,
    Order::Cancelled,
];

impl fmt::Display for Order {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

impl MachineState for Order {
    fn is_terminal(&self) -> bool {
        matches!(self, Order::Delivered | Order::Cancelled)
    }
}

#[derive(Debug, Clone, PartialEq)]
enum OrderEvent {
    Pay { amount: u64 },
    Ship,
    Deliver,
    Cancel(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
enum OrderEventKind {
    Pay,
    Ship,
    Deliver,
    Cancel,
}

const ALL_KINDS: [OrderEventKind; 4] = [
    OrderEventKind::Pay,
    OrderEventKind::Ship,
    OrderEventKind::Deliver,
    OrderEventKind::Cancel,
];

impl fmt::Display for OrderEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

impl MachineEvent for OrderEvent {
    type Kind = OrderEventKind;
    fn kind(&self) -> OrderEventKind {
        match self {
            OrderEvent::Pay { .. } => OrderEventKind::Pay,
            OrderEvent::Ship => OrderEventKind::Ship,
            OrderEvent::Deliver => OrderEventKind::Deliver,
            OrderEvent::Cancel(_) => OrderEventKind::Cancel,
        }
    }
}

#[derive(Debug, Default)]
struct Ledger {
    paid: u64,
    reason: Option<String>,
}

struct Shop;
impl Machine for Shop {
    type Key = u32;
    type State = Order;
    type Event = OrderEvent;
    type Entity = Ledger;
}

fn table() -> TransitionTable<Shop> {
    TransitionTable::new()
        .rule(
            Rule::on(OrderEventKind::Pay)
                .from(Order::New)
                .to(Order::Paid)
                .action(|ledger: &mut Ledger, t| {
                    if let OrderEvent::Pay { amount } = t.event {
                        ledger.paid = *amount;
                    }
                    Effects::none()
                }),
        )
        .rule(Rule::on(OrderEventKind::Ship).from(Order::Paid).to(Order::Shipped))
        .rule(
            Rule::on(OrderEventKind::Deliver)
                .from(Order::Shipped)
                .to(Order::Delivered),
        )
        .rule(
            Rule::on(OrderEventKind::Cancel)
                .from_any()
                .to(Order::Cancelled)
                .action(|ledger: &mut Ledger, t| {
                    if let OrderEvent::Cancel(reason) = t.event {
                        ledger.reason = Some(reason.clone());
                    }
                    Effects::none()
                }),
        )
}

fn event_of(kind: OrderEventKind) -> OrderEvent {
    match kind {
        OrderEventKind::Pay => OrderEvent::Pay { amount: 1 },
        OrderEventKind::Ship => OrderEvent::Ship,
        OrderEventKind::Deliver => OrderEvent::Deliver,
        OrderEventKind::Cancel => OrderEvent::Cancel("x".into()),
    }
}

#[test]
fn payload_reaches_action() {
    let fsm = Fsm::new(table()).unwrap();
    fsm.begin(1, Ledger::default(), Order::New).unwrap();
    fsm.send(&1, OrderEvent::Pay { amount: 250 }).unwrap();
    fsm.send(&1, OrderEvent::Cancel("customer request".into()))
        .unwrap();
    let (state, paid, reason) = fsm
        .inspect(&1, |s, l, _| (s, l.paid, l.reason.clone()))
        .unwrap();
    assert_eq!(state, Order::Cancelled);
    assert_eq!(paid, 250);
    assert_eq!(reason.as_deref(), Some("customer request"));
}

#[test]
fn terminal_states_have_no_outgoing_rules() {
    let fsm = Fsm::new(table()).unwrap();
    for state in ALL_STATES.iter().filter(|s| s.is_terminal()) {
        for kind in ALL_KINDS {
            assert!(!fsm.accepts(*state, kind), "{state} accepts {kind}");
        }
    }
}

#[test]
fn every_live_state_has_an_exit() {
    let fsm = Fsm::new(table()).unwrap();
    for state in ALL_STATES.iter().filter(|s| !s.is_terminal()) {
        assert!(ALL_KINDS.iter().any(|k| fsm.accepts(*state, *k)), "{state}");
    }
}

#[test]
fn transition_log_serializes() {
    let fsm = Fsm::new(table()).unwrap();
    fsm.begin(9, Ledger::default(), Order::New).unwrap();
    fsm.send(&9, OrderEvent::Pay { amount: 3 }).unwrap();
    let log = fsm.inspect(&9, |_, _, log| log.to_vec()).unwrap();
    let json = serde_json::to_string(&log).unwrap();
    let back: Vec<TransitionRecord<Order, OrderEventKind>> = serde_json::from_str(&json).unwrap();
    assert_eq!(back, log);
    assert_eq!(back[0].from, Order::New);
    assert_eq!(back[0].to, Order::Paid);
    assert_eq!(back[0].event, OrderEventKind::Pay);
}

proptest! {
    #[test]
    fn rejected_events_never_change_state(
        start in prop::sample::select(ALL_STATES.to_vec()),
        kind in prop::sample::select(ALL_KINDS.to_vec()),
    ) {
        let fsm = Fsm::new(table()).unwrap();
        fsm.begin(7, Ledger::default(), start).unwrap();
        let accepted = fsm.accepts(start, kind);
        match fsm.send(&7, event_of(kind)) {
            Ok(reached) => {
                prop_assert!(accepted);
                prop_assert_eq!(Some(reached), fsm.target(start, kind));
            }
            Err(err) => {
                prop_assert!(!accepted);
                let is_illegal = matches!(err, FsmError::IllegalTransition { .. });
                prop_assert!(is_illegal);
                prop_assert_eq!(fsm.state(&7).unwrap(), start);
                prop_assert_eq!(fsm.inspect(&7, |_, _, log| log.len()).unwrap(), 0);
            }
        }
    }
}

// ── Async effects ────────────────────────────────────────────────────

fn awaiting_table(rx: Arc<parking_lot::Mutex<Option<oneshot::Receiver<u64>>>>) -> TransitionTable<Shop> {
    TransitionTable::new()
        .rule(
            Rule::on(OrderEventKind::Ship)
                .from(Order::New)
                .to(Order::Shipped)
                .action(move |_, _| match rx.lock().take() {
                    Some(rx) => Effects::await_event(async move {
                        rx.await.ok().map(|_| OrderEvent::Deliver)
                    }),
                    None => Effects::none(),
                }),
        )
        .rule(
            Rule::on(OrderEventKind::Deliver)
                .from(Order::Shipped)
                .to(Order::Delivered),
        )
}

async fn wait_for(fsm: &Fsm<Shop>, key: u32, want: Order) -> bool {
    for _ in 0..100 {
        if fsm.state(&key).ok() == Some(want) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

#[tokio::test]
async fn awaited_event_is_dispatched_on_resolution() {
    let (tx, rx) = oneshot::channel();
    let fsm = Fsm::new(awaiting_table(Arc::new(parking_lot::Mutex::new(Some(rx))))).unwrap();
    fsm.begin(1, Ledger::default(), Order::New).unwrap();
    assert_eq!(fsm.send(&1, OrderEvent::Ship).unwrap(), Order::Shipped);

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(fsm.state(&1).unwrap(), Order::Shipped);

    tx.send(5).unwrap();
    assert!(wait_for(&fsm, 1, Order::Delivered).await);
}

#[tokio::test]
async fn dropped_sender_yields_no_follow_up() {
    let (tx, rx) = oneshot::channel::<u64>();
    let fsm = Fsm::new(awaiting_table(Arc::new(parking_lot::Mutex::new(Some(rx))))).unwrap();
    fsm.begin(1, Ledger::default(), Order::New).unwrap();
    fsm.send(&1, OrderEvent::Ship).unwrap();
    drop(tx);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(fsm.state(&1).unwrap(), Order::Shipped);
}

#[tokio::test]
async fn ticker_drives_pollers() {
    let flag = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let ready = Arc::clone(&flag);
    let table = TransitionTable::<Shop>::new()
        .rule(
            Rule::on(OrderEventKind::Pay)
                .from(Order::New)
                .to(Order::Paid)
                .action(move |_, _| {
                    let ready = Arc::clone(&ready);
                    Effects::poll(move || {
                        ready
                            .load(std::sync::atomic::Ordering::SeqCst)
                            .then_some(OrderEvent::Ship)
                    })
                }),
        )
        .rule(Rule::on(OrderEventKind::Ship).from(Order::Paid).to(Order::Shipped));
    let fsm = Fsm::new(table).unwrap();
    let ticker = fsm.run_ticker(Duration::from_millis(5)).unwrap();
    fsm.begin(3, Ledger::default(), Order::New).unwrap();
    fsm.send(&3, OrderEvent::Pay { amount: 1 }).unwrap();

    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(fsm.state(&3).unwrap(), Order::Paid);

    flag.store(true, std::sync::atomic::Ordering::SeqCst);
    assert!(wait_for(&fsm, 3, Order::Shipped).await);
    ticker.abort();
}

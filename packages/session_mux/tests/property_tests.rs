use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use proptest::prelude::*;

use session_mux::connection::Effect;
use session_mux::{
    BackoffPolicy, ConnectionEvent, ConnectionMachine, ConnectionState, DedupPolicy, Message,
    MessageKind, MuxConfig, Multiplexer, NoView, SessionRegistry, memory_pair,
};

// --- Backoff ---

fn arb_policy() -> impl Strategy<Value = BackoffPolicy> {
    (1u64..2_000, 1.0f64..4.0, 1u64..60_000, 0u32..30).prop_map(|(base, factor, max, retries)| {
        BackoffPolicy {
            base: Duration::from_millis(base),
            factor,
            max: Duration::from_millis(max),
            max_retries: retries,
        }
    })
}

proptest! {
    #[test]
    fn backoff_is_monotone(policy in arb_policy(), attempt in 1u32..200) {
        prop_assert!(policy.delay(attempt) <= policy.delay(attempt + 1));
    }

    #[test]
    fn backoff_never_exceeds_cap(policy in arb_policy(), attempt in 0u32..10_000) {
        prop_assert!(policy.delay(attempt) <= policy.max);
    }

    #[test]
    fn first_attempt_uses_base(policy in arb_policy()) {
        prop_assert_eq!(policy.delay(1), policy.base.min(policy.max));
    }
}

// --- Connection machine ---

#[derive(Debug, Clone, Copy)]
enum Input {
    Event(ConnectionEvent),
    TimerFired,
    Visible(bool),
    Online,
}

fn arb_input() -> impl Strategy<Value = Input> {
    // MaxRetries is raised by the machine itself, never fed from outside
    let external: Vec<ConnectionEvent> = ConnectionEvent::ALL
        .into_iter()
        .filter(|e| *e != ConnectionEvent::MaxRetries)
        .collect();
    prop_oneof![
        6 => proptest::sample::select(external).prop_map(Input::Event),
        2 => Just(Input::TimerFired),
        1 => any::<bool>().prop_map(Input::Visible),
        1 => Just(Input::Online),
    ]
}

fn feed(m: &mut ConnectionMachine, input: Input) -> Vec<Effect> {
    match input {
        Input::Event(e) => m.handle(e),
        Input::TimerFired => m.reconnect_due(),
        Input::Visible(v) => m.visibility_changed(v),
        Input::Online => m.network_online(),
    }
}

proptest! {
    #[test]
    fn attempts_stay_within_budget(
        retries in 0u32..6,
        inputs in proptest::collection::vec(arb_input(), 0..80),
    ) {
        let policy = BackoffPolicy { max_retries: retries, ..BackoffPolicy::transport() };
        let mut m = ConnectionMachine::new(policy);
        for input in inputs {
            let effects = feed(&mut m, input);
            prop_assert!(m.attempts() <= retries);
            if m.state() == ConnectionState::Idle {
                prop_assert_eq!(m.attempts(), 0);
            }
            if m.state() == ConnectionState::Failed {
                prop_assert_eq!(m.attempts(), retries);
            }
            for effect in &effects {
                if let Effect::Schedule(delay) = effect {
                    prop_assert_eq!(m.state(), ConnectionState::Reconnecting);
                    prop_assert!(*delay <= policy.max);
                }
            }
        }
    }

    #[test]
    fn disconnect_always_lands_idle(inputs in proptest::collection::vec(arb_input(), 0..40)) {
        let mut m = ConnectionMachine::new(BackoffPolicy::transport());
        for input in inputs {
            feed(&mut m, input);
        }
        m.handle(ConnectionEvent::Disconnect);
        prop_assert_eq!(m.state(), ConnectionState::Idle);
        prop_assert_eq!(m.attempts(), 0);
    }

    #[test]
    fn changed_effects_chain(inputs in proptest::collection::vec(arb_input(), 0..60)) {
        let mut m = ConnectionMachine::new(BackoffPolicy {
            max_retries: 2,
            ..BackoffPolicy::transport()
        });
        let mut current = m.state();
        for input in inputs {
            for effect in feed(&mut m, input) {
                if let Effect::Changed { from, to } = effect {
                    prop_assert_eq!(from, current);
                    prop_assert_ne!(from, to);
                    current = to;
                }
            }
            prop_assert_eq!(current, m.state());
        }
    }
}

// --- Dedup ---

fn arb_kind() -> impl Strategy<Value = MessageKind> {
    prop_oneof![
        Just(MessageKind::User),
        Just(MessageKind::Assistant),
        Just(MessageKind::ToolUse),
        Just(MessageKind::ToolResult),
    ]
}

proptest! {
    #[test]
    fn untimed_user_messages_never_deduplicate(
        content in "[a-z]{1,8}",
        history in proptest::collection::vec(("[a-z]{1,8}", arb_kind()), 0..20),
    ) {
        let mut log: Vec<Message> = history
            .into_iter()
            .map(|(c, k)| Message::new(k, c))
            .collect();
        log.push(Message::new(MessageKind::User, content.clone()));
        let candidate = Message::new(MessageKind::User, content);
        prop_assert!(!DedupPolicy::default().is_duplicate(&log, &candidate));
    }

    #[test]
    fn duplicates_only_match_same_kind(
        content in "[a-z]{1,8}",
        kind in arb_kind(),
        other in arb_kind(),
    ) {
        prop_assume!(kind != other);
        let now = chrono::Utc::now();
        let log = vec![Message::new(kind, content.clone()).at(now)];
        let candidate = Message::new(other, content).at(now);
        prop_assert!(!DedupPolicy::default().is_duplicate(&log, &candidate));
    }
}

// --- Registry rename ---

#[derive(Debug, Clone)]
enum RegistryOp {
    Open(u8),
    Rename(u8, u8),
    Close(u8),
    Switch(u8),
}

fn arb_op() -> impl Strategy<Value = RegistryOp> {
    prop_oneof![
        (0u8..6).prop_map(RegistryOp::Open),
        (0u8..6, 0u8..6).prop_map(|(a, b)| RegistryOp::Rename(a, b)),
        (0u8..6).prop_map(RegistryOp::Close),
        (0u8..6).prop_map(RegistryOp::Switch),
    ]
}

fn key(n: u8) -> String {
    format!("k{n}")
}

proptest! {
    #[test]
    fn registry_matches_set_model(ops in proptest::collection::vec(arb_op(), 0..40)) {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        rt.block_on(async {
            let (transport, _server) = memory_pair();
            let mux = Multiplexer::new(transport, MuxConfig::default());
            let reg = SessionRegistry::new(mux, BackoffPolicy::session(), Arc::new(NoView));
            let mut model: BTreeSet<String> = BTreeSet::new();
            let mut active: Option<String> = None;

            for op in ops {
                match op {
                    RegistryOp::Open(n) => {
                        reg.open(&key(n), "s");
                        model.insert(key(n));
                        active = Some(key(n));
                    }
                    RegistryOp::Rename(a, b) => {
                        let expect = model.contains(&key(a)) && !model.contains(&key(b));
                        prop_assert_eq!(reg.rename(&key(a), &key(b)), expect);
                        if expect {
                            model.remove(&key(a));
                            model.insert(key(b));
                            if active.as_deref() == Some(key(a).as_str()) {
                                active = Some(key(b));
                            }
                        }
                    }
                    RegistryOp::Close(n) => {
                        prop_assert_eq!(reg.close(&key(n)), model.remove(&key(n)));
                        if active.as_deref() == Some(key(n).as_str()) {
                            active = None;
                        }
                    }
                    RegistryOp::Switch(n) => {
                        let known = model.contains(&key(n));
                        prop_assert_eq!(reg.switch_to(&key(n)), known);
                        if known {
                            active = Some(key(n));
                        }
                    }
                }
                prop_assert_eq!(reg.keys(), model.iter().cloned().collect::<Vec<_>>());
                prop_assert_eq!(reg.active(), active.clone());
                if let Some(previous) = reg.previous() {
                    prop_assert!(model.contains(&previous));
                }
            }
            Ok(())
        })?;
    }
}

use conversation_realtime_kit::auth::Credential;
use conversation_realtime_kit::ws::connection::{
    ConnectionAction, ConnectionMachine, ReconnectPolicy, TERMINAL_ERROR,
};
use conversation_realtime_kit::ws::types::NORMAL_CLOSURE;
use proptest::prelude::*;
use std::time::Duration;

#[derive(Debug, Clone)]
enum Failure {
    Close(u16),
    TransportError,
}

fn failure() -> impl Strategy<Value = Failure> {
    prop_oneof![
        (1001u16..=4999).prop_map(Failure::Close),
        Just(Failure::TransportError),
    ]
}

fn policy() -> impl Strategy<Value = ReconnectPolicy> {
    (1u64..5_000, 0u64..120_000, 0u32..8).prop_map(|(base, extra, attempts)| ReconnectPolicy {
        base_delay: Duration::from_millis(base),
        max_delay: Duration::from_millis(base + extra),
        max_attempts: attempts,
    })
}

proptest! {
    #[test]
    fn delay_is_capped_exponential(policy in policy(), attempt in 0u32..80) {
        let base = policy.base_delay.as_millis();
        let max = policy.max_delay.as_millis();
        let expected = if attempt >= 64 {
            max
        } else {
            (base * (1u128 << attempt)).min(max)
        };
        prop_assert_eq!(policy.delay_for(attempt).as_millis(), expected);
    }

    #[test]
    fn delays_never_decrease(policy in policy(), attempt in 0u32..80) {
        prop_assert!(policy.delay_for(attempt) <= policy.delay_for(attempt + 1));
    }

    /// Consecutive failures schedule at most `max_attempts` reconnects, one
    /// at a time, then become terminal.
    #[test]
    fn retry_budget_is_respected(
        policy in policy(),
        failures in proptest::collection::vec(failure(), 1..20),
    ) {
        let mut machine = ConnectionMachine::new(policy, Duration::from_secs(30));
        machine.connect(Some(Credential::new("t")));

        let mut scheduled = Vec::new();
        for failure in &failures {
            let actions = match failure {
                Failure::Close(code) => machine.on_closed(*code, ""),
                Failure::TransportError => machine.on_transport_error("refused"),
            };
            let schedules = actions
                .iter()
                .filter(|a| matches!(a, ConnectionAction::ScheduleReconnect { .. }))
                .count();
            prop_assert!(schedules <= 1);

            for action in actions {
                if let ConnectionAction::ScheduleReconnect { attempt, delay } = action {
                    prop_assert_eq!(delay, policy.delay_for(attempt));
                    scheduled.push(attempt);
                }
            }
            machine.on_reconnect_timer();
        }

        let expected_count = failures.len().min(policy.max_attempts as usize);
        prop_assert_eq!(scheduled.len(), expected_count);
        prop_assert_eq!(scheduled, (1..=expected_count as u32).collect::<Vec<_>>());

        if failures.len() > policy.max_attempts as usize {
            prop_assert!(machine.is_terminal());
            prop_assert_eq!(machine.last_error(), Some(TERMINAL_ERROR));
            prop_assert!(!machine.reconnect_pending());
        }
    }

    #[test]
    fn normal_close_never_schedules(reason in "[a-z ]{0,16}") {
        let mut machine = ConnectionMachine::default();
        machine.connect(Some(Credential::new("t")));
        machine.on_open();
        let actions = machine.on_closed(NORMAL_CLOSURE, &reason);
        prop_assert!(!actions.iter().any(|a| matches!(a, ConnectionAction::ScheduleReconnect { .. })), "unexpected ScheduleReconnect action");
        prop_assert!(!machine.reconnect_pending());
    }
}

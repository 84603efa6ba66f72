//! Connection lifecycle state machine.
//!
//! Tracks one logical connection: credential, state, retry budget and timers.
//! Uses the action pattern: every input returns the [`ConnectionAction`]s the
//! driver must execute, and the machine itself performs no I/O and reads no
//! clock. That keeps the backoff and retry-budget rules testable without a
//! socket or a runtime.
//!
//! # State Machine
//!
//! ```text
//!            connect                on_open
//! ┌──────┐ ─────────> ┌────────────┐ ──────> ┌──────┐
//! │ Idle │            │ Connecting │         │ Open │
//! └──────┘            └────────────┘         └──────┘
//!                       │    ^                  │  │ disconnect
//!          error/close  │    │ reconnect timer  │  v
//!         (code ≠ 1000) v    │                  │ ┌─────────┐
//!                     ┌────────┐ <──────────────┘ │ Closing │
//!                     │ Closed │ <────────────────└─────────┘
//!                     └────────┘   close complete
//! ```
//!
//! While `Closed` a single reconnect may be pending. Once the retry budget is
//! spent the machine stays `Closed` and reports a terminal error until the
//! next explicit [`ConnectionMachine::connect`].

use crate::auth::Credential;
use crate::config::{
    DEFAULT_MAX_RECONNECT_ATTEMPTS, DEFAULT_PING_INTERVAL, DEFAULT_RECONNECT_BASE_DELAY,
    DEFAULT_RECONNECT_MAX_DELAY,
};
use crate::ws::types::{ConnectionState, ConnectionStatus, NORMAL_CLOSURE};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Reported once the reconnect budget is exhausted.
pub const TERMINAL_ERROR: &str = "failed to reconnect after multiple attempts";

/// Reported when `connect` is called without a usable credential.
pub const MISSING_CREDENTIAL: &str = "no authentication credential available";

/// Exponential backoff parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: DEFAULT_RECONNECT_BASE_DELAY,
            max_delay: DEFAULT_RECONNECT_MAX_DELAY,
            max_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
        }
    }
}

impl ReconnectPolicy {
    /// `min(base · 2^attempt, max)`, saturating.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base_ms = u64::try_from(self.base_delay.as_millis()).unwrap_or(u64::MAX);
        let max_ms = u64::try_from(self.max_delay.as_millis()).unwrap_or(u64::MAX);
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        Duration::from_millis(base_ms.saturating_mul(factor).min(max_ms))
    }
}

/// Actions returned by the state machine for the driver to execute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionAction {
    /// Open a new transport for this credential. Any previous transport has
    /// already been closed by an earlier `CloseTransport`.
    OpenTransport { credential: Credential },
    /// Close the live transport.
    CloseTransport { code: u16, reason: String },
    /// Arm the (single) reconnect timer.
    ScheduleReconnect { attempt: u32, delay: Duration },
    /// Disarm the reconnect timer.
    CancelReconnect,
    /// Start sending keep-alive pings.
    StartKeepAlive { interval: Duration },
    StopKeepAlive,
}

/// The connection state machine.
#[derive(Debug, Clone)]
pub struct ConnectionMachine {
    state: ConnectionState,
    policy: ReconnectPolicy,
    ping_interval: Duration,
    credential: Option<Credential>,
    retry_attempt: u32,
    last_error: Option<String>,
    terminal: bool,
    transport_live: bool,
    keepalive_running: bool,
    reconnect_pending: bool,
}

impl Default for ConnectionMachine {
    fn default() -> Self {
        Self::new(ReconnectPolicy::default(), DEFAULT_PING_INTERVAL)
    }
}

impl ConnectionMachine {
    pub fn new(policy: ReconnectPolicy, ping_interval: Duration) -> Self {
        Self {
            state: ConnectionState::Idle,
            policy,
            ping_interval,
            credential: None,
            retry_attempt: 0,
            last_error: None,
            terminal: false,
            transport_live: false,
            keepalive_running: false,
            reconnect_pending: false,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn retry_attempt(&self) -> u32 {
        self.retry_attempt
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn is_terminal(&self) -> bool {
        self.terminal
    }

    pub fn reconnect_pending(&self) -> bool {
        self.reconnect_pending
    }

    /// Whether a transport is open or being opened.
    pub fn transport_live(&self) -> bool {
        self.transport_live
    }

    pub fn status(&self) -> ConnectionStatus {
        ConnectionStatus {
            state: self.state,
            retry_attempt: self.retry_attempt,
            last_error: self.last_error.clone(),
            terminal: self.terminal,
        }
    }

    /// Starts a connection with `credential`.
    ///
    /// A no-op while already open or connecting with the same credential.
    /// Without a usable credential the machine closes and records
    /// [`MISSING_CREDENTIAL`]; no retry is scheduled.
    pub fn connect(&mut self, credential: Option<Credential>) -> Vec<ConnectionAction> {
        let Some(credential) = credential.filter(|c| !c.is_blank()) else {
            warn!("Connect requested without a credential");
            let actions = self.teardown("no credential");
            self.state = ConnectionState::Closed;
            self.retry_attempt = 0;
            self.terminal = false;
            self.last_error = Some(MISSING_CREDENTIAL.to_string());
            return actions;
        };

        let same_credential = self.credential.as_ref() == Some(&credential);
        if same_credential
            && matches!(
                self.state,
                ConnectionState::Open | ConnectionState::Connecting
            )
        {
            debug!(state = %self.state, "Connect ignored; already connected with this credential");
            return Vec::new();
        }

        let mut actions = self.teardown("reconnecting");
        self.retry_attempt = 0;
        self.terminal = false;
        self.last_error = None;
        self.credential = Some(credential.clone());
        self.begin_open(credential, &mut actions);
        actions
    }

    /// Closes deliberately. Cancels every timer and resets the retry budget.
    pub fn disconnect(&mut self, reason: &str) -> Vec<ConnectionAction> {
        let had_transport = self.transport_live;
        let actions = self.teardown(reason);
        self.retry_attempt = 0;
        self.terminal = false;
        self.last_error = None;
        self.state = if had_transport {
            ConnectionState::Closing
        } else {
            ConnectionState::Closed
        };
        info!(reason, "Disconnect requested");
        actions
    }

    /// The transport opened successfully.
    pub fn on_open(&mut self) -> Vec<ConnectionAction> {
        if self.state != ConnectionState::Connecting {
            debug!(state = %self.state, "Ignoring open outside of Connecting");
            return Vec::new();
        }
        self.state = ConnectionState::Open;
        self.retry_attempt = 0;
        self.last_error = None;
        self.terminal = false;
        self.keepalive_running = true;
        vec![ConnectionAction::StartKeepAlive {
            interval: self.ping_interval,
        }]
    }

    /// The transport closed with `code`.
    ///
    /// Normal closure (1000) never reconnects; anything else goes through
    /// the backoff.
    pub fn on_closed(&mut self, code: u16, reason: &str) -> Vec<ConnectionAction> {
        let mut actions = Vec::new();
        match self.state {
            ConnectionState::Closing => {
                self.transport_live = false;
                self.stop_keepalive(&mut actions);
                self.state = ConnectionState::Closed;
            }
            ConnectionState::Open | ConnectionState::Connecting => {
                self.transport_live = false;
                self.stop_keepalive(&mut actions);
                if code == NORMAL_CLOSURE {
                    info!(reason, "Connection closed normally");
                    self.state = ConnectionState::Closed;
                    self.retry_attempt = 0;
                } else {
                    let message = if reason.is_empty() {
                        format!("connection closed abnormally (code {code})")
                    } else {
                        format!("connection closed abnormally (code {code}): {reason}")
                    };
                    warn!(code, reason, "Connection closed abnormally");
                    self.last_error = Some(message);
                    self.schedule_reconnect(&mut actions);
                }
            }
            ConnectionState::Idle | ConnectionState::Closed => {
                debug!(code, "Ignoring close with no live transport");
            }
        }
        actions
    }

    /// The transport failed to open or errored while open. Recovered through
    /// the same backoff as an abnormal close.
    pub fn on_transport_error(&mut self, error: &str) -> Vec<ConnectionAction> {
        let mut actions = Vec::new();
        if !matches!(
            self.state,
            ConnectionState::Open | ConnectionState::Connecting
        ) {
            debug!(error, state = %self.state, "Ignoring transport error with no live transport");
            return actions;
        }
        self.transport_live = false;
        self.stop_keepalive(&mut actions);
        warn!(error, "Transport error");
        self.last_error = Some(error.to_string());
        self.schedule_reconnect(&mut actions);
        actions
    }

    /// The server (or the endpoint builder) rejected this attempt outright.
    /// Retrying with the same credential cannot succeed, so nothing is
    /// scheduled.
    pub fn on_rejected(&mut self, reason: &str) -> Vec<ConnectionAction> {
        let mut actions = self.teardown(reason);
        self.stop_keepalive(&mut actions);
        self.state = ConnectionState::Closed;
        self.retry_attempt = 0;
        self.last_error = Some(reason.to_string());
        error!(reason, "Connection rejected; waiting for a new credential");
        actions
    }

    /// The reconnect timer fired.
    pub fn on_reconnect_timer(&mut self) -> Vec<ConnectionAction> {
        if !self.reconnect_pending {
            debug!("Ignoring stale reconnect timer");
            return Vec::new();
        }
        self.reconnect_pending = false;

        let Some(credential) = self.credential.clone() else {
            return Vec::new();
        };
        info!(attempt = self.retry_attempt, "Reconnecting");
        let mut actions = Vec::new();
        self.begin_open(credential, &mut actions);
        actions
    }

    fn begin_open(&mut self, credential: Credential, actions: &mut Vec<ConnectionAction>) {
        debug_assert!(!self.transport_live, "a transport is already live");
        self.state = ConnectionState::Connecting;
        self.transport_live = true;
        actions.push(ConnectionAction::OpenTransport { credential });
    }

    /// Cancels timers and closes the live transport, if any.
    fn teardown(&mut self, reason: &str) -> Vec<ConnectionAction> {
        let mut actions = Vec::new();
        if self.reconnect_pending {
            self.reconnect_pending = false;
            actions.push(ConnectionAction::CancelReconnect);
        }
        self.stop_keepalive(&mut actions);
        if self.transport_live {
            self.transport_live = false;
            actions.push(ConnectionAction::CloseTransport {
                code: NORMAL_CLOSURE,
                reason: reason.to_string(),
            });
        }
        actions
    }

    fn stop_keepalive(&mut self, actions: &mut Vec<ConnectionAction>) {
        if self.keepalive_running {
            self.keepalive_running = false;
            actions.push(ConnectionAction::StopKeepAlive);
        }
    }

    fn schedule_reconnect(&mut self, actions: &mut Vec<ConnectionAction>) {
        self.state = ConnectionState::Closed;

        if self.retry_attempt >= self.policy.max_attempts {
            self.terminal = true;
            self.last_error = Some(TERMINAL_ERROR.to_string());
            error!(
                attempts = self.retry_attempt,
                "Giving up on reconnecting; explicit connect required"
            );
            return;
        }

        self.retry_attempt += 1;
        let delay = self.policy.delay_for(self.retry_attempt);
        if self.reconnect_pending {
            actions.push(ConnectionAction::CancelReconnect);
        }
        self.reconnect_pending = true;
        info!(
            attempt = self.retry_attempt,
            max_attempts = self.policy.max_attempts,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "Scheduling reconnect"
        );
        actions.push(ConnectionAction::ScheduleReconnect {
            attempt: self.retry_attempt,
            delay,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ws::types::ABNORMAL_CLOSURE;

    fn cred(token: &str) -> Option<Credential> {
        Some(Credential::new(token))
    }

    fn open_machine() -> ConnectionMachine {
        let mut machine = ConnectionMachine::default();
        machine.connect(cred("t"));
        machine.on_open();
        machine
    }

    fn scheduled(actions: &[ConnectionAction]) -> Vec<(u32, Duration)> {
        actions
            .iter()
            .filter_map(|a| match a {
                ConnectionAction::ScheduleReconnect { attempt, delay } => Some((*attempt, *delay)),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn connect_opens_a_transport() {
        let mut machine = ConnectionMachine::default();
        let actions = machine.connect(cred("t"));
        assert_eq!(
            actions,
            vec![ConnectionAction::OpenTransport {
                credential: Credential::new("t")
            }]
        );
        assert_eq!(machine.state(), ConnectionState::Connecting);

        assert_eq!(
            machine.on_open(),
            vec![ConnectionAction::StartKeepAlive {
                interval: Duration::from_secs(30)
            }]
        );
        assert_eq!(machine.state(), ConnectionState::Open);
    }

    #[test]
    fn connect_is_idempotent_for_the_same_credential() {
        let mut machine = ConnectionMachine::default();
        machine.connect(cred("t"));
        assert!(machine.connect(cred("t")).is_empty());
        machine.on_open();
        assert!(machine.connect(cred("t")).is_empty());
    }

    #[test]
    fn new_credential_tears_down_before_opening() {
        let mut machine = open_machine();
        let actions = machine.connect(cred("other"));
        assert_eq!(
            actions,
            vec![
                ConnectionAction::StopKeepAlive,
                ConnectionAction::CloseTransport {
                    code: NORMAL_CLOSURE,
                    reason: "reconnecting".into()
                },
                ConnectionAction::OpenTransport {
                    credential: Credential::new("other")
                },
            ]
        );
    }

    #[test]
    fn missing_credential_closes_without_retry() {
        let mut machine = ConnectionMachine::default();
        assert!(machine.connect(None).is_empty());
        assert_eq!(machine.state(), ConnectionState::Closed);
        assert_eq!(machine.last_error(), Some(MISSING_CREDENTIAL));
        assert!(!machine.reconnect_pending());

        assert!(machine.connect(cred("   ")).is_empty());

        // A later connect with a credential works.
        assert_eq!(machine.connect(cred("t")).len(), 1);
        assert_eq!(machine.state(), ConnectionState::Connecting);
        assert_eq!(machine.last_error(), None);
    }

    #[test]
    fn normal_close_schedules_nothing() {
        let mut machine = open_machine();
        let actions = machine.on_closed(NORMAL_CLOSURE, "bye");
        assert_eq!(actions, vec![ConnectionAction::StopKeepAlive]);
        assert!(scheduled(&actions).is_empty());
        assert_eq!(machine.state(), ConnectionState::Closed);
    }

    #[test]
    fn abnormal_close_schedules_exactly_one_reconnect() {
        let mut machine = open_machine();
        let actions = machine.on_closed(ABNORMAL_CLOSURE, "");
        assert_eq!(scheduled(&actions), vec![(1, Duration::from_secs(2))]);
        assert!(machine.reconnect_pending());
        assert_eq!(
            machine.last_error(),
            Some("connection closed abnormally (code 1006)")
        );
        assert!(!machine.is_terminal());
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let mut machine = open_machine();
        let mut delays = Vec::new();
        let mut actions = machine.on_closed(ABNORMAL_CLOSURE, "");
        for _ in 0..5 {
            delays.extend(scheduled(&actions));
            machine.on_reconnect_timer();
            actions = machine.on_transport_error("connection refused");
        }
        assert_eq!(
            delays,
            vec![
                (1, Duration::from_millis(2_000)),
                (2, Duration::from_millis(4_000)),
                (3, Duration::from_millis(8_000)),
                (4, Duration::from_millis(16_000)),
                (5, Duration::from_millis(30_000)),
            ]
        );
    }

    #[test]
    fn budget_exhaustion_is_terminal_until_explicit_connect() {
        let mut machine = open_machine();
        let mut total_scheduled = scheduled(&machine.on_closed(ABNORMAL_CLOSURE, "")).len();
        for _ in 0..4 {
            machine.on_reconnect_timer();
            total_scheduled += scheduled(&machine.on_closed(ABNORMAL_CLOSURE, "")).len();
        }
        assert_eq!(total_scheduled, 5);
        assert!(!machine.is_terminal());

        // The fifth reconnect fails too: the budget is spent.
        machine.on_reconnect_timer();
        let actions = machine.on_closed(ABNORMAL_CLOSURE, "");
        assert!(scheduled(&actions).is_empty());
        assert!(machine.is_terminal());
        assert_eq!(machine.last_error(), Some(TERMINAL_ERROR));
        assert!(!machine.reconnect_pending());

        // Further closes and stray timers do nothing.
        assert!(machine.on_closed(ABNORMAL_CLOSURE, "").is_empty());
        assert!(machine.on_reconnect_timer().is_empty());

        // An explicit connect starts over.
        let actions = machine.connect(cred("t"));
        assert!(matches!(
            actions.as_slice(),
            [ConnectionAction::OpenTransport { .. }]
        ));
        assert!(!machine.is_terminal());
        assert_eq!(machine.retry_attempt(), 0);
    }

    #[test]
    fn successful_open_resets_the_budget() {
        let mut machine = open_machine();
        machine.on_closed(ABNORMAL_CLOSURE, "");
        machine.on_reconnect_timer();
        machine.on_transport_error("refused");
        assert_eq!(machine.retry_attempt(), 2);

        machine.on_reconnect_timer();
        machine.on_open();
        assert_eq!(machine.retry_attempt(), 0);
        let actions = machine.on_closed(ABNORMAL_CLOSURE, "");
        assert_eq!(scheduled(&actions), vec![(1, Duration::from_secs(2))]);
    }

    #[test]
    fn disconnect_cancels_pending_reconnect() {
        let mut machine = open_machine();
        machine.on_closed(ABNORMAL_CLOSURE, "");
        let actions = machine.disconnect("logout");
        assert_eq!(actions, vec![ConnectionAction::CancelReconnect]);
        assert_eq!(machine.state(), ConnectionState::Closed);
        assert_eq!(machine.retry_attempt(), 0);
        assert!(machine.on_reconnect_timer().is_empty());
    }

    #[test]
    fn disconnect_while_open_goes_through_closing() {
        let mut machine = open_machine();
        let actions = machine.disconnect("logout");
        assert_eq!(
            actions,
            vec![
                ConnectionAction::StopKeepAlive,
                ConnectionAction::CloseTransport {
                    code: NORMAL_CLOSURE,
                    reason: "logout".into()
                },
            ]
        );
        assert_eq!(machine.state(), ConnectionState::Closing);
        assert!(machine.on_closed(NORMAL_CLOSURE, "logout").is_empty());
        assert_eq!(machine.state(), ConnectionState::Closed);
    }

    #[test]
    fn disconnect_when_idle_is_safe() {
        let mut machine = ConnectionMachine::default();
        assert!(machine.disconnect("nothing to do").is_empty());
        assert_eq!(machine.state(), ConnectionState::Closed);
    }

    #[test]
    fn rejection_is_not_retried() {
        let mut machine = ConnectionMachine::default();
        machine.connect(cred("expired"));
        let actions = machine.on_rejected("unauthorized");
        assert!(scheduled(&actions).is_empty());
        assert_eq!(machine.state(), ConnectionState::Closed);
        assert_eq!(machine.last_error(), Some("unauthorized"));
        assert!(!machine.is_terminal());

        assert_eq!(machine.connect(cred("fresh")).len(), 1);
    }

    #[test]
    fn delay_for_saturates() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.delay_for(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for(64), Duration::from_secs(30));
        assert_eq!(policy.delay_for(u32::MAX), Duration::from_secs(30));
    }

    #[test]
    fn huge_delays_are_scheduled_without_overflow() {
        let policy = ReconnectPolicy {
            base_delay: Duration::MAX,
            max_delay: Duration::MAX,
            max_attempts: 1,
        };
        let mut machine = ConnectionMachine::new(policy, Duration::from_secs(30));
        machine.connect(Some(Credential::new("t")));

        let actions = machine.on_transport_error("refused");
        assert!(actions.contains(&ConnectionAction::ScheduleReconnect {
            attempt: 1,
            delay: Duration::from_millis(u64::MAX),
        }));
    }
}

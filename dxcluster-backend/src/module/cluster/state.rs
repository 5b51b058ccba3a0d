///! Connection lifecycle as data
///!
///! [`transition`] is pure: the connection task feeds it events and performs
///! whatever I/O the resulting state calls for.

use dxcluster_common::ConnectionState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    StartRequested,
    ConnectOk,
    ConnectFailed,
    LoginComplete,
    LineReceived,
    IoError,
    RestartRequested,
    StopRequested,
    /// Backoff delay elapsed
    TimerFired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub state: ConnectionState,
    /// Start the next backoff from the minimum delay
    pub reset_backoff: bool,
    /// Leaving `Reconnecting` for a new connection attempt
    pub reconnect_attempt: bool,
}

impl Transition {
    fn to(state: ConnectionState) -> Self {
        Self {
            state,
            reset_backoff: false,
            reconnect_attempt: false,
        }
    }

    fn with_reset(mut self) -> Self {
        self.reset_backoff = true;
        self
    }

    fn as_attempt(mut self) -> Self {
        self.reconnect_attempt = true;
        self
    }
}

pub fn transition(state: ConnectionState, event: ConnectionEvent) -> Transition {
    use ConnectionEvent as E;
    use ConnectionState as S;

    match (state, event) {
        (_, E::StopRequested) => Transition::to(S::Disconnected).with_reset(),

        (S::Disconnected, E::StartRequested | E::RestartRequested) => {
            Transition::to(S::Connecting).with_reset()
        }

        (S::Connecting, E::ConnectOk) => Transition::to(S::AwaitingLogin),
        (S::Connecting, E::ConnectFailed) => Transition::to(S::Reconnecting),

        (S::AwaitingLogin, E::LoginComplete) => Transition::to(S::Connected),

        (S::Connecting | S::AwaitingLogin | S::Connected, E::IoError) => {
            Transition::to(S::Reconnecting)
        }
        (S::Connecting | S::AwaitingLogin | S::Connected, E::RestartRequested) => {
            Transition::to(S::Reconnecting).with_reset()
        }

        (S::Reconnecting, E::TimerFired) => Transition::to(S::Connecting).as_attempt(),
        // Skip the pending delay and try right away
        (S::Reconnecting, E::RestartRequested) => {
            Transition::to(S::Connecting).with_reset().as_attempt()
        }

        // Everything else, including stale I/O results after a stop, is ignored
        (state, _) => Transition::to(state),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ConnectionEvent as E;
    use ConnectionState as S;

    const ALL_STATES: [S; 5] = [
        S::Disconnected,
        S::Connecting,
        S::AwaitingLogin,
        S::Connected,
        S::Reconnecting,
    ];

    fn run(events: &[E]) -> S {
        events
            .iter()
            .fold(S::Disconnected, |state, &event| transition(state, event).state)
    }

    #[test]
    fn test_happy_path() {
        assert_eq!(
            run(&[E::StartRequested, E::ConnectOk, E::LoginComplete, E::LineReceived]),
            S::Connected
        );
    }

    #[test]
    fn test_io_error_reconnects_until_connected() {
        let mut state = run(&[E::StartRequested, E::ConnectOk, E::LoginComplete]);

        let t = transition(state, E::IoError);
        assert_eq!(t.state, S::Reconnecting);
        assert!(!t.reconnect_attempt);
        state = t.state;

        let t = transition(state, E::TimerFired);
        assert_eq!(t.state, S::Connecting);
        assert!(t.reconnect_attempt);
        state = t.state;

        state = transition(state, E::ConnectFailed).state;
        assert_eq!(state, S::Reconnecting);

        assert_eq!(
            [E::TimerFired, E::ConnectOk, E::LoginComplete]
                .iter()
                .fold(state, |s, &e| transition(s, e).state),
            S::Connected
        );
    }

    #[test]
    fn test_restart_resets_backoff() {
        for state in [S::Connecting, S::AwaitingLogin, S::Connected] {
            let t = transition(state, E::RestartRequested);
            assert_eq!(t.state, S::Reconnecting);
            assert!(t.reset_backoff);
            assert!(!t.reconnect_attempt);
        }

        let t = transition(S::Reconnecting, E::RestartRequested);
        assert_eq!(t.state, S::Connecting);
        assert!(t.reset_backoff && t.reconnect_attempt);
    }

    #[test]
    fn test_stop_from_anywhere() {
        for state in ALL_STATES {
            assert_eq!(transition(state, E::StopRequested).state, S::Disconnected);
        }
    }

    #[test]
    fn test_disconnected_ignores_io_events() {
        for event in [E::ConnectOk, E::ConnectFailed, E::LoginComplete, E::LineReceived, E::IoError, E::TimerFired] {
            assert_eq!(transition(S::Disconnected, event), Transition::to(S::Disconnected));
        }
    }

    #[test]
    fn test_line_received_never_changes_state() {
        for state in ALL_STATES {
            assert_eq!(transition(state, E::LineReceived).state, state);
        }
    }

    #[test]
    fn test_reconnecting_waits_for_timer() {
        for event in [E::ConnectOk, E::LoginComplete, E::IoError, E::StartRequested] {
            assert_eq!(transition(S::Reconnecting, event).state, S::Reconnecting);
        }
    }
}

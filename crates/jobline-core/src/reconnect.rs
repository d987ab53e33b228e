//! Browser connection state machine.
//!
//! The browser drives this with socket lifecycle events; the machine decides
//! whether and when to reconnect. It owns no timers or sockets so it can be
//! tested exhaustively.

use std::time::Duration;

use crate::retry::ReconnectPolicy;

/// Normal closure.
pub const CLOSE_NORMAL: u16 = 1000;
/// Endpoint going away (page navigation, server shutdown).
pub const CLOSE_GOING_AWAY: u16 = 1001;
/// Server cannot serve the session right now; reconnect later.
pub const CLOSE_TRY_AGAIN_LATER: u16 = 1013;

/// Whether a close code asks the client to reconnect.
pub fn is_abnormal_close(code: u16) -> bool {
    code != CLOSE_NORMAL && code != CLOSE_GOING_AWAY
}

#[derive(Clone, Debug, PartialEq)]
pub enum ConnectionState {
    Disconnected,
    Connecting { attempt: u32 },
    Open,
    Backoff { attempt: u32, delay: Duration },
    Failed,
}

/// What the caller should do after a transition.
#[derive(Clone, Debug, PartialEq)]
pub enum Action {
    None,
    OpenSocket,
    ScheduleRetry(Duration),
    ShowFailure,
}

#[derive(Clone, Debug)]
pub struct ConnectionManager {
    policy: ReconnectPolicy,
    state: ConnectionState,
    /// Retries already scheduled since the last successful open.
    retries: u32,
}

impl ConnectionManager {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            state: ConnectionState::Disconnected,
            retries: 0,
        }
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    pub fn policy(&self) -> &ReconnectPolicy {
        &self.policy
    }

    /// User or page asks for a connection.
    pub fn connect(&mut self) -> Action {
        match self.state {
            ConnectionState::Disconnected => {
                self.retries = 0;
                self.state = ConnectionState::Connecting { attempt: 0 };
                Action::OpenSocket
            }
            _ => Action::None,
        }
    }

    pub fn on_open(&mut self) -> Action {
        if matches!(self.state, ConnectionState::Connecting { .. }) {
            self.state = ConnectionState::Open;
            self.retries = 0;
        }
        Action::None
    }

    /// Socket closed (or failed to open) with `code`. `random` in `[0, 1)`
    /// feeds the jitter.
    pub fn on_close(&mut self, code: u16, random: f64) -> Action {
        match self.state {
            ConnectionState::Open | ConnectionState::Connecting { .. } => {}
            _ => return Action::None,
        }
        if !is_abnormal_close(code) {
            self.state = ConnectionState::Disconnected;
            self.retries = 0;
            return Action::None;
        }
        if self.retries >= self.policy.max_attempts {
            self.state = ConnectionState::Failed;
            return Action::ShowFailure;
        }
        let attempt = self.retries;
        let delay = self.policy.delay(attempt, random);
        self.retries += 1;
        self.state = ConnectionState::Backoff { attempt, delay };
        Action::ScheduleRetry(delay)
    }

    /// The scheduled backoff delay elapsed.
    pub fn on_backoff_elapsed(&mut self) -> Action {
        if let ConnectionState::Backoff { attempt, .. } = self.state {
            self.state = ConnectionState::Connecting {
                attempt: attempt + 1,
            };
            Action::OpenSocket
        } else {
            Action::None
        }
    }

    /// Manual retry from the failure state.
    pub fn retry(&mut self) -> Action {
        if self.state == ConnectionState::Failed {
            self.retries = 0;
            self.state = ConnectionState::Connecting { attempt: 0 };
            Action::OpenSocket
        } else {
            Action::None
        }
    }

    /// Whether the UI should show the reconnecting indicator.
    pub fn is_reconnecting(&self) -> bool {
        matches!(self.state, ConnectionState::Backoff { .. })
            || matches!(self.state, ConnectionState::Connecting { attempt } if attempt > 0)
    }
}

use std::fmt;

use crate::error::SessionError;

/// 进入降级状态的原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DegradeReason {
    Transport,
    Auth,
    AuthTimeout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Authenticating,
    Subscribed,
    Degraded(DegradeReason),
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Disconnected => write!(f, "disconnected"),
            SessionState::Connecting => write!(f, "connecting"),
            SessionState::Authenticating => write!(f, "authenticating"),
            SessionState::Subscribed => write!(f, "subscribed"),
            SessionState::Degraded(reason) => write!(f, "degraded({reason:?})"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    Connect,
    TransportEstablished,
    TransportLost,
    AuthAccepted,
    AuthRejected,
    AuthTimeout,
    BackoffElapsed,
    TokenRefreshFailed,
    Close,
}

/// 连接会话状态机
///
/// 只负责合法转移与重试计数，不做任何 I/O。`Close` 之后是终态，
/// 除再次 `Close` 外的事件都返回 [`SessionError::Closed`]。
#[derive(Debug, Clone)]
pub struct SessionMachine {
    state: SessionState,
    attempt: u32,
    closed: bool,
}

impl Default for SessionMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionMachine {
    pub fn new() -> Self {
        Self {
            state: SessionState::Disconnected,
            attempt: 0,
            closed: false,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// 连续失败次数，认证成功后归零
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn apply(&mut self, event: SessionEvent) -> Result<SessionState, SessionError> {
        use DegradeReason as R;
        use SessionEvent as E;
        use SessionState as S;

        if event == E::Close {
            self.state = S::Disconnected;
            self.closed = true;
            return Ok(self.state);
        }
        if self.closed {
            return Err(SessionError::Closed);
        }

        let next = match (self.state, event) {
            (S::Disconnected, E::Connect) => S::Connecting,
            (S::Connecting, E::TransportEstablished) => S::Authenticating,
            (S::Connecting | S::Authenticating | S::Subscribed, E::TransportLost) => {
                S::Degraded(R::Transport)
            }
            (S::Authenticating, E::AuthAccepted) => {
                self.attempt = 0;
                S::Subscribed
            }
            (S::Authenticating | S::Subscribed, E::AuthRejected) => S::Degraded(R::Auth),
            (S::Authenticating, E::AuthTimeout) => S::Degraded(R::AuthTimeout),
            (S::Degraded(_), E::BackoffElapsed) => {
                self.attempt = self.attempt.saturating_add(1);
                S::Connecting
            }
            (S::Degraded(R::Auth), E::TokenRefreshFailed) => {
                self.attempt = self.attempt.saturating_add(1);
                S::Degraded(R::Auth)
            }
            (state, event) => {
                return Err(SessionError::InvalidTransition {
                    state: state.to_string(),
                    event: format!("{event:?}"),
                })
            }
        };

        self.state = next;
        Ok(next)
    }
}

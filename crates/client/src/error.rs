use std::time::Duration;

use thiserror::Error;

/// 客户端会话错误
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("authentication expired")]
    AuthExpired,
    #[error("authentication rejected: {0}")]
    AuthRejected(String),
    #[error("transport lost: {0}")]
    TransportLost(String),
    #[error("request timed out")]
    Timeout,
    /// 服务端限流，请求本身没有问题，稍后原样重试
    #[error("throttled by server")]
    Throttled { retry_after: Option<Duration> },
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("api error {status} {code}: {message}")]
    Api {
        status: u16,
        code: String,
        message: String,
    },
    #[error("invalid transition: {event} in {state}")]
    InvalidTransition { state: String, event: String },
    #[error("session closed")]
    Closed,
}

impl SessionError {
    pub fn transport(err: impl std::fmt::Display) -> Self {
        SessionError::TransportLost(err.to_string())
    }

    /// 只影响单个请求、不需要重建连接、重试也不会成功的错误
    pub fn is_request_scoped(&self) -> bool {
        matches!(self, SessionError::Api { .. } | SessionError::Protocol(_))
    }

    /// 等待后重试同一请求即可，不需要重建连接
    pub fn is_throttled(&self) -> bool {
        matches!(self, SessionError::Throttled { .. })
    }
}

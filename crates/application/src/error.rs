use std::time::Duration;

use domain::{DomainError, RepositoryError};
use thiserror::Error;

use crate::rate_limiter::RateLimitError;

#[derive(Debug, Error)]
pub enum ApplicationError {
    #[error("domain error: {0}")]
    Domain(#[from] DomainError),
    #[error("repository error: {0}")]
    Repository(RepositoryError),
    #[error("rate limited: {0}")]
    RateLimited(#[from] RateLimitError),
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("authentication failed")]
    Authentication,
    #[error("infrastructure error: {0}")]
    Infrastructure(String),
}

impl ApplicationError {
    /// 创建基础设施错误
    pub fn infrastructure(message: impl Into<String>) -> Self {
        ApplicationError::Infrastructure(message.into())
    }
}

impl From<RepositoryError> for ApplicationError {
    fn from(value: RepositoryError) -> Self {
        match value {
            // 仓储找不到会话时统一成领域错误，调用方只需处理一种
            RepositoryError::NotFound => ApplicationError::Domain(DomainError::ConversationNotFound),
            other => ApplicationError::Repository(other),
        }
    }
}

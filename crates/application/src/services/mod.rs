mod chat_service;
mod presence_service;

use std::future::Future;
use std::time::Duration;

use crate::error::ApplicationError;

pub use chat_service::{ChatService, ChatServiceDependencies, ChatSettings, SendMessageRequest};
pub use presence_service::PresenceService;

/// 给请求/响应类调用加上调用方指定的超时
pub async fn with_deadline<T, F>(timeout: Duration, future: F) -> Result<T, ApplicationError>
where
    F: Future<Output = Result<T, ApplicationError>>,
{
    tokio::time::timeout(timeout, future)
        .await
        .map_err(|_| ApplicationError::Timeout(timeout))?
}

use std::sync::Arc;
use std::time::Duration;

use application::{ChatService, DeliveryBroker, PresenceService};

use crate::JwtService;

/// WebSocket 会话与请求超时参数
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub auth_timeout: Duration,
    pub heartbeat_timeout: Duration,
    /// 调用方未给出 `timeout_ms` 时的默认值
    pub request_timeout: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            auth_timeout: Duration::from_secs(10),
            heartbeat_timeout: Duration::from_secs(60),
            request_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub presence_service: PresenceService,
    pub chat_service: Arc<ChatService>,
    pub broker: DeliveryBroker,
    pub jwt_service: Arc<JwtService>,
    pub session: SessionSettings,
}

impl AppState {
    pub fn new(
        presence_service: PresenceService,
        chat_service: Arc<ChatService>,
        broker: DeliveryBroker,
        jwt_service: Arc<JwtService>,
        session: SessionSettings,
    ) -> Self {
        Self {
            presence_service,
            chat_service,
            broker,
            jwt_service,
            session,
        }
    }

    /// 调用方指定的超时，上限为默认值的十倍
    pub fn request_timeout(&self, requested_ms: Option<u64>) -> Duration {
        let default = self.session.request_timeout;
        requested_ms
            .map(Duration::from_millis)
            .map(|requested| requested.min(default * 10))
            .unwrap_or(default)
    }
}

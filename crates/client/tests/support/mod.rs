#![allow(dead_code)]

use std::{future::Future, net::SocketAddr, sync::Arc, time::Duration};

use application::{
    ChatService, ChatServiceDependencies, ChatSettings, Clock, DeliveryBroker,
    MemoryConversationRepository, MessageRateLimiter, PresenceRegistry, PresenceService,
    PresenceSettings, SystemClock,
};
use client::{Backoff, ConnectivityStatus, SessionConfig, SessionHandle, SessionUpdate};
use tokio::net::TcpListener;
use tokio::time::timeout;
use uuid::Uuid;
use web_api::{router, AppState, JwtConfig, JwtService, SessionSettings};

pub const SECRET: &str = "client-integration-secret-with-32-characters";

pub fn chat_service() -> Arc<ChatService> {
    chat_service_with_limiter(MessageRateLimiter::new(0))
}

pub fn chat_service_with_limiter(rate_limiter: MessageRateLimiter) -> Arc<ChatService> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    Arc::new(ChatService::new(ChatServiceDependencies {
        repository: Arc::new(MemoryConversationRepository::new()),
        broker: DeliveryBroker::new(64),
        clock,
        rate_limiter: Arc::new(rate_limiter),
        settings: ChatSettings::default(),
    }))
}

pub fn fast_config() -> SessionConfig {
    SessionConfig {
        backoff: Backoff::new(Duration::from_millis(10), Duration::from_millis(100), 0.0),
        auth_timeout: Duration::from_secs(2),
        request_timeout: Duration::from_secs(2),
        ..SessionConfig::default()
    }
}

pub async fn wait_for_status(handle: &SessionHandle, expected: ConnectivityStatus) {
    let mut status = handle.status();
    timeout(Duration::from_secs(5), status.wait_for(|s| *s == expected))
        .await
        .expect("status within timeout")
        .expect("session alive");
}

/// 丢弃不关心的更新，直到 `pick` 命中
pub async fn next_matching<T>(
    handle: &mut SessionHandle,
    mut pick: impl FnMut(SessionUpdate) -> Option<T>,
) -> T {
    let wait = async {
        loop {
            let update = handle.next_update().await.expect("session alive");
            if let Some(found) = pick(update) {
                return found;
            }
        }
    };
    timeout(Duration::from_secs(5), wait)
        .await
        .expect("update within timeout")
}

pub async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..100 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("condition not reached within timeout");
}

pub struct TestServer {
    pub addr: SocketAddr,
    pub jwt: Arc<JwtService>,
    pub state: AppState,
}

impl TestServer {
    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn http(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn ws_url(&self) -> String {
        format!("ws://{}/api/v1/ws", self.addr)
    }

    pub fn token_for(&self, user_id: Uuid) -> String {
        self.jwt.generate_token(user_id).expect("token")
    }
}

pub async fn spawn_server() -> TestServer {
    let broker = DeliveryBroker::new(64);
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let registry = Arc::new(PresenceRegistry::new(PresenceSettings::default(), clock.clone()));
    let presence_service = PresenceService::new(registry, broker.clone());
    let chat_service = ChatService::new(ChatServiceDependencies {
        repository: Arc::new(MemoryConversationRepository::new()),
        broker: broker.clone(),
        clock,
        rate_limiter: Arc::new(MessageRateLimiter::new(0)),
        settings: ChatSettings::default(),
    });
    let jwt = Arc::new(JwtService::new(JwtConfig {
        secret: SECRET.to_string(),
        expiration_hours: 24,
    }));
    let state = AppState::new(
        presence_service,
        Arc::new(chat_service),
        broker,
        jwt.clone(),
        SessionSettings::default(),
    );

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let app = router(state.clone(), &[]);
    tokio::spawn(async move {
        axum::serve(listener, app.into_make_service()).await.ok();
    });
    tokio::time::sleep(Duration::from_millis(20)).await;

    TestServer { addr, jwt, state }
}

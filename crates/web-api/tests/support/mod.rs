#![allow(dead_code)]

use std::{net::SocketAddr, sync::Arc, time::Duration};

use application::{
    ChatService, ChatServiceDependencies, ChatSettings, DeliveryBroker,
    MemoryConversationRepository, MessageRateLimiter, PresenceRegistry, PresenceService,
    PresenceSettings, SystemClock,
};
use tokio::net::TcpListener;
use uuid::Uuid;
use web_api::{router, AppState, JwtConfig, JwtService, SessionSettings};

pub const SECRET: &str = "integration-test-secret-with-32-characters";

pub struct TestServer {
    pub addr: SocketAddr,
    pub jwt: Arc<JwtService>,
    pub state: AppState,
}

impl TestServer {
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

pub fn build_state(session: SessionSettings, rate_limit: u32) -> AppState {
    let broker = DeliveryBroker::new(64);
    let clock: Arc<dyn application::Clock> = Arc::new(SystemClock);
    let registry = Arc::new(PresenceRegistry::new(PresenceSettings::default(), clock.clone()));
    let presence_service = PresenceService::new(registry, broker.clone());

    let chat_service = ChatService::new(ChatServiceDependencies {
        repository: Arc::new(MemoryConversationRepository::new()),
        broker: broker.clone(),
        clock,
        rate_limiter: Arc::new(MessageRateLimiter::new(rate_limit)),
        settings: ChatSettings::default(),
    });

    let jwt_service = Arc::new(JwtService::new(JwtConfig {
        secret: SECRET.to_string(),
        expiration_hours: 24,
    }));

    AppState::new(
        presence_service,
        Arc::new(chat_service),
        broker,
        jwt_service,
        session,
    )
}

pub async fn spawn_server() -> TestServer {
    spawn_server_with(SessionSettings::default(), 0).await
}

pub async fn spawn_server_with(session: SessionSettings, rate_limit: u32) -> TestServer {
    let state = build_state(session, rate_limit);
    let jwt = state.jwt_service.clone();
    let app = router(state.clone(), &[]);

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        axum::serve(listener, app.into_make_service()).await.ok();
    });
    tokio::time::sleep(Duration::from_millis(20)).await;

    TestServer { addr, jwt, state }
}

//! 主应用程序入口
//!
//! 加载配置，选择会话存储，启动在线状态清理任务与 Axum 服务。

use std::sync::Arc;

use application::{
    spawn_presence_sweeper, ChatService, ChatServiceDependencies, ChatSettings, Clock,
    ConversationRepository, DeliveryBroker, MemoryConversationRepository, MessageRateLimiter,
    PresenceRegistry, PresenceService, PresenceSettings, SystemClock,
};
use config::AppConfig;
use infrastructure::{create_pg_pool, PgConversationRepository, MIGRATOR};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use web_api::{router, AppState, JwtService, SessionSettings};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = AppConfig::load()?;
    tracing::info!(config = %config.sanitize(), "配置已加载");

    let repository: Arc<dyn ConversationRepository> = match &config.database.url {
        Some(url) => {
            let pool = create_pg_pool(url, config.database.max_connections).await?;
            MIGRATOR.run(&pool).await?;
            tracing::info!("使用 PostgreSQL 会话存储");
            Arc::new(PgConversationRepository::new(pool))
        }
        None => {
            tracing::warn!("未配置数据库，会话与消息只保存在内存中");
            Arc::new(MemoryConversationRepository::new())
        }
    };

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let broker = DeliveryBroker::new(config.broker.mailbox_capacity);

    let registry = Arc::new(PresenceRegistry::new(
        PresenceSettings {
            ttl: config.presence.ttl(),
            cell_size_degrees: config.presence.cell_size_degrees,
            max_radius_meters: config.presence.max_radius_meters,
        },
        clock.clone(),
    ));
    let presence_service = PresenceService::new(registry, broker.clone());

    let rate_limiter = Arc::new(MessageRateLimiter::new(
        config.messaging.rate_limit_per_minute,
    ));
    let chat_service = ChatService::new(ChatServiceDependencies {
        repository,
        broker: broker.clone(),
        clock,
        rate_limiter: rate_limiter.clone(),
        settings: ChatSettings {
            max_body_chars: config.messaging.max_body_chars,
        },
    });

    let jwt_service = Arc::new(JwtService::new(config.jwt.clone()));

    let state = AppState::new(
        presence_service.clone(),
        Arc::new(chat_service),
        broker,
        jwt_service,
        SessionSettings {
            auth_timeout: config.session.auth_timeout(),
            heartbeat_timeout: config.session.heartbeat_timeout(),
            request_timeout: config.session.request_timeout(),
        },
    );

    let shutdown = CancellationToken::new();
    let sweeper = spawn_presence_sweeper(
        presence_service,
        rate_limiter,
        config.presence.sweep_interval(),
        shutdown.clone(),
    );

    let app = router(state, &config.server.cors_origins);
    let address = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&address).await?;
    tracing::info!("服务器启动在 http://{}", address);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    shutdown.cancel();
    sweeper.await?;
    tracing::info!("服务器已停止");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %err, "无法监听 Ctrl-C");
        std::future::pending::<()>().await;
    }
    tracing::info!("收到退出信号，开始关闭");
}

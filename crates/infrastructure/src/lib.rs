//! 基础设施层实现。
//!
//! 提供基于 PostgreSQL 的会话仓储，实现应用层定义的 [`application::ConversationRepository`]。

pub mod migrations;
pub mod repository;
pub mod retry;

pub use migrations::MIGRATOR;
pub use repository::{create_pg_pool, PgConversationRepository};
pub use retry::{retry_async, Backoff, RetryConfig};

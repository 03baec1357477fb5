//! 应用层实现。
//!
//! 在线状态注册表、会话存储抽象、进程内推送代理，
//! 以及组合它们的用例服务。

pub mod broker;
pub mod clock;
pub mod error;
pub mod geo_index;
pub mod memory;
pub mod presence;
pub mod rate_limiter;
pub mod repository;
pub mod services;
pub mod sweeper;

pub use broker::{BrokerEvent, BrokerSession, DeliveryBroker, SessionId};
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::ApplicationError;
pub use geo_index::GeoIndex;
pub use memory::MemoryConversationRepository;
pub use presence::{PresenceRegistry, PresenceSettings};
pub use rate_limiter::{MessageRateLimiter, RateLimitError};
pub use repository::ConversationRepository;
pub use services::{
    with_deadline, ChatService, ChatServiceDependencies, ChatSettings, PresenceService,
    SendMessageRequest,
};
pub use sweeper::spawn_presence_sweeper;

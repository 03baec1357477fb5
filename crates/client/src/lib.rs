//! 客户端会话层。
//!
//! 维护到实时服务的单条连接：认证、订阅、断线重连、离线发送队列，
//! 以及重连后的补偿查询。传输、令牌和 REST 接口都通过 trait 注入，便于替换和测试。

pub mod backoff;
pub mod cache;
pub mod error;
pub mod http_api;
pub mod session;
pub mod state;
pub mod transport;
pub mod ws_transport;

pub use backoff::Backoff;
pub use cache::{ClientCache, PendingSend};
pub use error::SessionError;
pub use http_api::HttpChatApi;
pub use session::{
    ConnectionSession, ConnectivityStatus, SessionConfig, SessionHandle, SessionSnapshot,
    SessionUpdate,
};
pub use state::{DegradeReason, SessionEvent, SessionMachine, SessionState};
pub use transport::{ChatApi, Connection, StaticToken, TokenSource, Transport};
pub use ws_transport::WsTransport;

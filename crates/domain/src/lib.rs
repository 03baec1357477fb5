//! 实时在线状态、地理发现与消息子系统的领域模型
//!
//! 包含看护者在线记录、会话、消息、推送主题与 WebSocket 帧定义，不涉及任何 I/O。

pub mod conversation;
pub mod errors;
pub mod frames;
pub mod message;
pub mod presence;
pub mod topic;
pub mod value_objects;

// 重新导出常用类型
pub use conversation::*;
pub use errors::*;
pub use frames::*;
pub use message::*;
pub use presence::*;
pub use topic::*;
pub use value_objects::*;

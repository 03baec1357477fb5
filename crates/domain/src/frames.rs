//! WebSocket 帧定义
//!
//! 服务端与客户端共用；JSON 文本帧，按 `type` 字段区分。

use serde::{Deserialize, Serialize};

use crate::conversation::Conversation;
use crate::message::Message;
use crate::presence::PresenceDelta;
use crate::topic::Topic;
use crate::value_objects::{ConversationId, Timestamp, UserId};

/// 客户端 → 服务端
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// 连接建立后的第一帧
    Authenticate { token: String },
    Subscribe { topic: Topic },
    Unsubscribe { topic: Topic },
    /// 确认已收到 `seq` 及之前的消息
    Ack {
        conversation_id: ConversationId,
        seq: u64,
    },
    Ping,
}

/// 服务端 → 客户端
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Authenticated { user_id: UserId },
    AuthRejected { reason: String },
    /// 会话期间令牌过期，服务端随后关闭连接
    AuthExpired,
    Subscribed { topic: Topic },
    Unsubscribed { topic: Topic },
    Event { topic: Topic, event: RealtimeEvent },
    Error { code: String, message: String },
    Pong,
}

/// 推送事件。推送只是"有变化"的提示，权威数据以查询结果为准。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RealtimeEvent {
    MessageCreated {
        message: Message,
    },
    MessagesRead {
        conversation_id: ConversationId,
        reader_id: UserId,
        up_to_seq: u64,
        read_at: Timestamp,
    },
    MessagesDelivered {
        conversation_id: ConversationId,
        recipient_id: UserId,
        up_to_seq: u64,
        delivered_at: Timestamp,
    },
    ConversationStarted {
        conversation: Conversation,
    },
    Presence {
        delta: PresenceDelta,
    },
}

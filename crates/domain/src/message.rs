use serde::{Deserialize, Serialize};

use crate::value_objects::{ClientNonce, ConversationId, MessageBody, Timestamp, UserId};

/// 会话中的一条消息。
///
/// 仅追加；除了标记 `delivered_at` / `read_at` 外不再修改。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub conversation_id: ConversationId,
    /// 每个会话内从 1 开始、严格递增且无空洞
    pub seq: u64,
    pub sender_id: UserId,
    pub body: String,
    pub created_at: Timestamp,
    pub client_nonce: ClientNonce,
    pub delivered_at: Option<Timestamp>,
    pub read_at: Option<Timestamp>,
}

impl Message {
    /// 标记已送达，已有时间戳时保持不变。返回是否发生了变化
    pub fn mark_delivered(&mut self, at: Timestamp) -> bool {
        if self.delivered_at.is_some() {
            return false;
        }
        self.delivered_at = Some(at);
        true
    }

    /// 标记已读；已读隐含已送达
    pub fn mark_read(&mut self, at: Timestamp) -> bool {
        if self.read_at.is_some() {
            return false;
        }
        self.read_at = Some(at);
        if self.delivered_at.is_none() {
            self.delivered_at = Some(at);
        }
        true
    }
}

/// 待追加的消息，`seq` 由存储分配
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub body: MessageBody,
    pub client_nonce: ClientNonce,
    pub created_at: Timestamp,
}

impl NewMessage {
    pub fn into_message(self, seq: u64) -> Message {
        Message {
            conversation_id: self.conversation_id,
            seq,
            sender_id: self.sender_id,
            body: self.body.into_inner(),
            created_at: self.created_at,
            client_nonce: self.client_nonce,
            delivered_at: None,
            read_at: None,
        }
    }
}

/// 追加结果：新建，或者命中幂等键返回原消息
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppendOutcome {
    Created(Message),
    Duplicate(Message),
}

impl AppendOutcome {
    pub fn message(&self) -> &Message {
        match self {
            AppendOutcome::Created(message) | AppendOutcome::Duplicate(message) => message,
        }
    }

    pub fn into_message(self) -> Message {
        match self {
            AppendOutcome::Created(message) | AppendOutcome::Duplicate(message) => message,
        }
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, AppendOutcome::Duplicate(_))
    }
}

/// 发起会话的结果；`created` 只有真正插入记录的一方为 true
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartOutcome {
    pub conversation: crate::Conversation,
    pub created: bool,
}

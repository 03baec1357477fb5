use async_trait::async_trait;
use domain::{
    AppendOutcome, ClientNonce, Conversation, ConversationId, Message, NewMessage,
    RepositoryError, StartOutcome, Timestamp, UserId,
};

/// 会话与消息的持久化边界。
///
/// 实现必须保证：
/// - 同一参与者对只有一条会话记录，并发发起时只有一方 `created == true`
/// - `append_message` 原子地分配 `last_message_seq + 1`，序号无空洞
/// - `(conversation_id, client_nonce)` 唯一，重复追加返回原消息
#[async_trait]
pub trait ConversationRepository: Send + Sync {
    /// 插入候选会话；已存在时返回已有记录
    async fn start_conversation(
        &self,
        candidate: Conversation,
    ) -> Result<StartOutcome, RepositoryError>;

    async fn find_conversation(
        &self,
        id: ConversationId,
    ) -> Result<Option<Conversation>, RepositoryError>;

    /// 用户参与的会话，按最近活动时间倒序
    async fn list_conversations(&self, user_id: UserId)
        -> Result<Vec<Conversation>, RepositoryError>;

    async fn find_by_nonce(
        &self,
        id: ConversationId,
        nonce: &ClientNonce,
    ) -> Result<Option<Message>, RepositoryError>;

    /// 会话不存在时返回 [`RepositoryError::NotFound`]
    async fn append_message(&self, message: NewMessage) -> Result<AppendOutcome, RepositoryError>;

    /// `seq > since_seq` 的消息，按 `seq` 升序
    async fn get_messages(
        &self,
        id: ConversationId,
        since_seq: u64,
    ) -> Result<Vec<Message>, RepositoryError>;

    /// 给 `seq <= up_to_seq` 且不是 `reader_id` 发送的消息打已读时间，返回新标记的条数
    async fn mark_read(
        &self,
        id: ConversationId,
        up_to_seq: u64,
        reader_id: UserId,
        at: Timestamp,
    ) -> Result<u64, RepositoryError>;

    /// 同 [`Self::mark_read`]，只打送达时间
    async fn mark_delivered(
        &self,
        id: ConversationId,
        up_to_seq: u64,
        recipient_id: UserId,
        at: Timestamp,
    ) -> Result<u64, RepositoryError>;
}

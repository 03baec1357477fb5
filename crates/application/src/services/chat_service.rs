use std::sync::Arc;

use domain::{
    AppendOutcome, ClientNonce, Conversation, ConversationId, Message, MessageBody, NewMessage,
    RealtimeEvent, StartOutcome, Topic, UserId,
};
use uuid::Uuid;

use crate::{
    broker::DeliveryBroker, clock::Clock, error::ApplicationError,
    rate_limiter::MessageRateLimiter, repository::ConversationRepository,
};

#[derive(Debug, Clone)]
pub struct SendMessageRequest {
    pub conversation_id: Uuid,
    pub sender_id: Uuid, // 发送者（从JWT获取）
    pub body: String,
    pub client_nonce: String,
}

#[derive(Debug, Clone)]
pub struct ChatSettings {
    pub max_body_chars: usize,
}

impl Default for ChatSettings {
    fn default() -> Self {
        Self {
            max_body_chars: 4000,
        }
    }
}

pub struct ChatServiceDependencies {
    pub repository: Arc<dyn ConversationRepository>,
    pub broker: DeliveryBroker,
    pub clock: Arc<dyn Clock>,
    pub rate_limiter: Arc<MessageRateLimiter>,
    pub settings: ChatSettings,
}

/// 会话用例：发起会话、收发消息、回执。
///
/// 先写存储，再发布推送；推送失败不影响写入结果。
pub struct ChatService {
    deps: ChatServiceDependencies,
}

impl ChatService {
    pub fn new(deps: ChatServiceDependencies) -> Self {
        Self { deps }
    }

    /// 取会话并确认 `user_id` 是参与者
    pub async fn ensure_participant(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
    ) -> Result<Conversation, ApplicationError> {
        let conversation = self
            .deps
            .repository
            .find_conversation(conversation_id)
            .await?
            .ok_or(domain::DomainError::ConversationNotFound)?;
        conversation.ensure_participant(user_id)?;
        Ok(conversation)
    }

    /// 幂等地发起会话；并发的 (A,B) 与 (B,A) 得到同一条会话
    pub async fn start_conversation(
        &self,
        initiator: UserId,
        other: UserId,
    ) -> Result<StartOutcome, ApplicationError> {
        let candidate = Conversation::new(initiator, other, self.deps.clock.now())?;
        let outcome = self.deps.repository.start_conversation(candidate).await?;

        if outcome.created {
            tracing::info!(
                conversation_id = %outcome.conversation.id,
                initiator = %initiator,
                other = %other,
                "会话已创建"
            );
            self.deps.broker.publish(
                &Topic::User(other),
                RealtimeEvent::ConversationStarted {
                    conversation: outcome.conversation.clone(),
                },
            );
        }
        Ok(outcome)
    }

    pub async fn list_conversations(
        &self,
        user_id: UserId,
    ) -> Result<Vec<Conversation>, ApplicationError> {
        Ok(self.deps.repository.list_conversations(user_id).await?)
    }

    /// 拉取 `seq > since_seq` 的消息；对方发来的消息顺带标记为已送达
    pub async fn get_messages(
        &self,
        conversation_id: ConversationId,
        viewer_id: UserId,
        since_seq: u64,
    ) -> Result<Vec<Message>, ApplicationError> {
        self.ensure_participant(conversation_id, viewer_id).await?;
        let mut messages = self
            .deps
            .repository
            .get_messages(conversation_id, since_seq)
            .await?;

        let pending_up_to = messages
            .iter()
            .filter(|m| m.sender_id != viewer_id && m.delivered_at.is_none())
            .map(|m| m.seq)
            .max();

        if let Some(up_to_seq) = pending_up_to {
            let now = self.deps.clock.now();
            self.stamp_delivered(conversation_id, up_to_seq, viewer_id, now)
                .await?;
            for message in messages
                .iter_mut()
                .filter(|m| m.sender_id != viewer_id && m.seq <= up_to_seq)
            {
                message.mark_delivered(now);
            }
        }
        Ok(messages)
    }

    /// 追加消息。
    ///
    /// 相同 nonce 的重试返回原消息，不计入限流，也不再推送。
    pub async fn send_message(
        &self,
        request: SendMessageRequest,
    ) -> Result<AppendOutcome, ApplicationError> {
        let conversation_id = ConversationId::from(request.conversation_id);
        let sender_id = UserId::from(request.sender_id);
        let client_nonce = ClientNonce::new(request.client_nonce)?;
        let body = MessageBody::new(request.body, self.deps.settings.max_body_chars)?;

        self.ensure_participant(conversation_id, sender_id).await?;

        if let Some(existing) = self
            .deps
            .repository
            .find_by_nonce(conversation_id, &client_nonce)
            .await?
        {
            tracing::debug!(conversation_id = %conversation_id, seq = existing.seq, "重复发送，返回已有消息");
            return Ok(AppendOutcome::Duplicate(existing));
        }

        self.deps.rate_limiter.check_and_record(sender_id)?;

        let outcome = self
            .deps
            .repository
            .append_message(NewMessage {
                conversation_id,
                sender_id,
                body,
                client_nonce,
                created_at: self.deps.clock.now(),
            })
            .await?;

        if let AppendOutcome::Created(message) = &outcome {
            tracing::debug!(conversation_id = %conversation_id, seq = message.seq, "消息已保存");
            self.deps.broker.publish(
                &Topic::Conversation(conversation_id),
                RealtimeEvent::MessageCreated {
                    message: message.clone(),
                },
            );
        }
        Ok(outcome)
    }

    /// 标记已读并推送回执，返回新标记的条数
    pub async fn mark_read(
        &self,
        conversation_id: ConversationId,
        reader_id: UserId,
        up_to_seq: u64,
    ) -> Result<u64, ApplicationError> {
        self.ensure_participant(conversation_id, reader_id).await?;
        let read_at = self.deps.clock.now();
        let changed = self
            .deps
            .repository
            .mark_read(conversation_id, up_to_seq, reader_id, read_at)
            .await?;

        if changed > 0 {
            self.deps.broker.publish(
                &Topic::Conversation(conversation_id),
                RealtimeEvent::MessagesRead {
                    conversation_id,
                    reader_id,
                    up_to_seq,
                    read_at,
                },
            );
        }
        Ok(changed)
    }

    /// 会话确认收到推送的消息
    pub async fn acknowledge_delivery(
        &self,
        conversation_id: ConversationId,
        recipient_id: UserId,
        up_to_seq: u64,
    ) -> Result<u64, ApplicationError> {
        self.ensure_participant(conversation_id, recipient_id).await?;
        self.stamp_delivered(conversation_id, up_to_seq, recipient_id, self.deps.clock.now())
            .await
    }

    async fn stamp_delivered(
        &self,
        conversation_id: ConversationId,
        up_to_seq: u64,
        recipient_id: UserId,
        delivered_at: domain::Timestamp,
    ) -> Result<u64, ApplicationError> {
        let changed = self
            .deps
            .repository
            .mark_delivered(conversation_id, up_to_seq, recipient_id, delivered_at)
            .await?;
        if changed > 0 {
            self.deps.broker.publish(
                &Topic::Conversation(conversation_id),
                RealtimeEvent::MessagesDelivered {
                    conversation_id,
                    recipient_id,
                    up_to_seq,
                    delivered_at,
                },
            );
        }
        Ok(changed)
    }
}

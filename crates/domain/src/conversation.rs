use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::DomainError;
use crate::value_objects::{ConversationId, Timestamp, UserId};

/// 会话 ID 的 UUIDv5 命名空间
const CONVERSATION_NAMESPACE: Uuid = Uuid::from_u128(0x6f1c_2a57_93d4_4e0b_9b8e_51c3_a4d2_7e10);

/// 恰好两个参与者之间的会话。
///
/// `participant_a < participant_b`，ID 由该有序对推导，
/// 因此双方并发发起会话时会落到同一条记录上。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: ConversationId,
    pub participant_a: UserId,
    pub participant_b: UserId,
    pub created_at: Timestamp,
    /// 只能通过原子追加操作推进
    pub last_message_seq: u64,
    pub last_activity_at: Timestamp,
}

impl Conversation {
    pub fn new(user_a: UserId, user_b: UserId, now: Timestamp) -> Result<Self, DomainError> {
        if user_a == user_b {
            return Err(DomainError::SelfConversation);
        }
        let (participant_a, participant_b) = ordered(user_a, user_b);
        Ok(Self {
            id: Self::id_for(user_a, user_b),
            participant_a,
            participant_b,
            created_at: now,
            last_message_seq: 0,
            last_activity_at: now,
        })
    }

    /// 无序参与者对 → 会话 ID（确定性）
    pub fn id_for(user_a: UserId, user_b: UserId) -> ConversationId {
        let (low, high) = ordered(user_a, user_b);
        let mut name = [0u8; 32];
        name[..16].copy_from_slice(low.0.as_bytes());
        name[16..].copy_from_slice(high.0.as_bytes());
        ConversationId(Uuid::new_v5(&CONVERSATION_NAMESPACE, &name))
    }

    pub fn has_participant(&self, user_id: UserId) -> bool {
        self.participant_a == user_id || self.participant_b == user_id
    }

    pub fn other_participant(&self, user_id: UserId) -> Option<UserId> {
        if self.participant_a == user_id {
            Some(self.participant_b)
        } else if self.participant_b == user_id {
            Some(self.participant_a)
        } else {
            None
        }
    }

    pub fn ensure_participant(&self, user_id: UserId) -> Result<(), DomainError> {
        if self.has_participant(user_id) {
            Ok(())
        } else {
            Err(DomainError::ConversationNotParticipant)
        }
    }
}

fn ordered(a: UserId, b: UserId) -> (UserId, UserId) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

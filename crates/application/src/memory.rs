//! 内存中的会话存储，未配置数据库时使用，也用于测试。

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use domain::{
    AppendOutcome, ClientNonce, Conversation, ConversationId, Message, NewMessage,
    RepositoryError, StartOutcome, Timestamp, UserId,
};
use tokio::sync::Mutex;

use crate::repository::ConversationRepository;

/// 一个会话的全部状态，由同一把锁保护，序号分配和幂等检查在锁内完成
#[derive(Debug)]
struct ConversationLog {
    conversation: Conversation,
    /// `messages[i].seq == i + 1`
    messages: Vec<Message>,
    nonces: HashMap<ClientNonce, u64>,
}

impl ConversationLog {
    fn new(conversation: Conversation) -> Self {
        Self {
            conversation,
            messages: Vec::new(),
            nonces: HashMap::new(),
        }
    }

    fn upto(&self, up_to_seq: u64) -> usize {
        usize::try_from(up_to_seq)
            .unwrap_or(usize::MAX)
            .min(self.messages.len())
    }
}

#[derive(Default)]
pub struct MemoryConversationRepository {
    conversations: DashMap<ConversationId, Arc<Mutex<ConversationLog>>>,
    by_user: DashMap<UserId, HashSet<ConversationId>>,
}

impl MemoryConversationRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// 先克隆出 Arc 再等待锁，等待期间不持有分片锁
    fn log(&self, id: ConversationId) -> Option<Arc<Mutex<ConversationLog>>> {
        self.conversations.get(&id).map(|log| log.clone())
    }
}

#[async_trait]
impl ConversationRepository for MemoryConversationRepository {
    async fn start_conversation(
        &self,
        candidate: Conversation,
    ) -> Result<StartOutcome, RepositoryError> {
        // 先写参与者索引再让会话可见：能查到的会话一定能被列出。
        // 锁顺序固定为 conversations 分片 → by_user 分片
        let (log, created) = match self.conversations.entry(candidate.id) {
            Entry::Occupied(existing) => (existing.get().clone(), false),
            Entry::Vacant(vacant) => {
                for participant in [candidate.participant_a, candidate.participant_b] {
                    self.by_user
                        .entry(participant)
                        .or_default()
                        .insert(candidate.id);
                }
                let log = Arc::new(Mutex::new(ConversationLog::new(candidate.clone())));
                vacant.insert(log.clone());
                (log, true)
            }
        };

        let conversation = log.lock().await.conversation.clone();
        Ok(StartOutcome {
            conversation,
            created,
        })
    }

    async fn find_conversation(
        &self,
        id: ConversationId,
    ) -> Result<Option<Conversation>, RepositoryError> {
        match self.log(id) {
            Some(log) => Ok(Some(log.lock().await.conversation.clone())),
            None => Ok(None),
        }
    }

    async fn list_conversations(
        &self,
        user_id: UserId,
    ) -> Result<Vec<Conversation>, RepositoryError> {
        let ids: Vec<ConversationId> = self
            .by_user
            .get(&user_id)
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default();

        let mut conversations = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(log) = self.log(id) {
                conversations.push(log.lock().await.conversation.clone());
            }
        }
        conversations.sort_by(|a, b| {
            b.last_activity_at
                .cmp(&a.last_activity_at)
                .then_with(|| b.created_at.cmp(&a.created_at))
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(conversations)
    }

    async fn find_by_nonce(
        &self,
        id: ConversationId,
        nonce: &ClientNonce,
    ) -> Result<Option<Message>, RepositoryError> {
        let Some(log) = self.log(id) else {
            return Ok(None);
        };
        let log = log.lock().await;
        Ok(log
            .nonces
            .get(nonce)
            .and_then(|seq| log.messages.get(log.upto(*seq).saturating_sub(1)))
            .cloned())
    }

    async fn append_message(&self, message: NewMessage) -> Result<AppendOutcome, RepositoryError> {
        let log = self
            .log(message.conversation_id)
            .ok_or(RepositoryError::NotFound)?;
        let mut log = log.lock().await;

        if let Some(seq) = log.nonces.get(&message.client_nonce).copied() {
            let index = log.upto(seq).saturating_sub(1);
            let existing = log
                .messages
                .get(index)
                .cloned()
                .ok_or_else(|| RepositoryError::storage("nonce index out of sync"))?;
            return Ok(AppendOutcome::Duplicate(existing));
        }

        let seq = log.conversation.last_message_seq + 1;
        let created_at = message.created_at;
        let stored = message.into_message(seq);

        log.nonces.insert(stored.client_nonce.clone(), seq);
        log.messages.push(stored.clone());
        log.conversation.last_message_seq = seq;
        log.conversation.last_activity_at = created_at;

        Ok(AppendOutcome::Created(stored))
    }

    async fn get_messages(
        &self,
        id: ConversationId,
        since_seq: u64,
    ) -> Result<Vec<Message>, RepositoryError> {
        let log = self.log(id).ok_or(RepositoryError::NotFound)?;
        let log = log.lock().await;
        let start = log.upto(since_seq);
        Ok(log.messages[start..].to_vec())
    }

    async fn mark_read(
        &self,
        id: ConversationId,
        up_to_seq: u64,
        reader_id: UserId,
        at: Timestamp,
    ) -> Result<u64, RepositoryError> {
        let log = self.log(id).ok_or(RepositoryError::NotFound)?;
        let mut log = log.lock().await;
        let end = log.upto(up_to_seq);
        let changed = log.messages[..end]
            .iter_mut()
            .filter(|message| message.sender_id != reader_id)
            .map(|message| message.mark_read(at))
            .filter(|changed| *changed)
            .count();
        Ok(changed as u64)
    }

    async fn mark_delivered(
        &self,
        id: ConversationId,
        up_to_seq: u64,
        recipient_id: UserId,
        at: Timestamp,
    ) -> Result<u64, RepositoryError> {
        let log = self.log(id).ok_or(RepositoryError::NotFound)?;
        let mut log = log.lock().await;
        let end = log.upto(up_to_seq);
        let changed = log.messages[..end]
            .iter_mut()
            .filter(|message| message.sender_id != recipient_id)
            .map(|message| message.mark_delivered(at))
            .filter(|changed| *changed)
            .count();
        Ok(changed as u64)
    }
}

use std::collections::{BTreeMap, HashMap, VecDeque};

use domain::{ClientNonce, ConversationId, Message, Timestamp, UserId};

/// 离线待发消息。重发时始终使用同一个 nonce
#[derive(Debug, Clone, PartialEq)]
pub struct PendingSend {
    pub conversation_id: ConversationId,
    pub body: String,
    pub nonce: ClientNonce,
    pub queued_at: Timestamp,
}

impl PendingSend {
    pub fn new(conversation_id: ConversationId, body: impl Into<String>, nonce: ClientNonce) -> Self {
        Self {
            conversation_id,
            body: body.into(),
            nonce,
            queued_at: chrono::Utc::now(),
        }
    }
}

#[derive(Debug, Default)]
struct ConversationCache {
    messages: BTreeMap<u64, Message>,
    /// 连续水位：`1..=last_seq` 都已在本地
    last_seq: u64,
}

impl ConversationCache {
    fn advance_watermark(&mut self) {
        while self.messages.contains_key(&(self.last_seq + 1)) {
            self.last_seq += 1;
        }
    }
}

/// 客户端本地缓存：有序发件箱 + 按 `(conversation_id, seq)` 去重的消息副本
///
/// 只属于单个客户端进程，由会话任务独占访问。
#[derive(Debug, Default)]
pub struct ClientCache {
    outbox: VecDeque<PendingSend>,
    conversations: HashMap<ConversationId, ConversationCache>,
}

impl ClientCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// 入队；同一 nonce 已在队列中时返回 false
    pub fn enqueue(&mut self, pending: PendingSend) -> bool {
        if self.outbox.iter().any(|queued| queued.nonce == pending.nonce) {
            return false;
        }
        self.outbox.push_back(pending);
        true
    }

    pub fn front(&self) -> Option<&PendingSend> {
        self.outbox.front()
    }

    pub fn pending(&self) -> impl Iterator<Item = &PendingSend> {
        self.outbox.iter()
    }

    pub fn outbox_len(&self) -> usize {
        self.outbox.len()
    }

    /// 服务端确认（新建或重复都算），出队并写入本地副本
    pub fn acknowledge(&mut self, nonce: &ClientNonce, message: Message) -> Option<PendingSend> {
        let removed = self.take(nonce);
        self.ingest([message]);
        removed
    }

    /// 永久失败的发送直接丢弃
    pub fn discard(&mut self, nonce: &ClientNonce) -> Option<PendingSend> {
        self.take(nonce)
    }

    fn take(&mut self, nonce: &ClientNonce) -> Option<PendingSend> {
        let index = self.outbox.iter().position(|queued| &queued.nonce == nonce)?;
        self.outbox.remove(index)
    }

    /// 合并查询或推送得到的消息，返回此前未见过的那些（按 seq 升序）
    pub fn ingest(&mut self, messages: impl IntoIterator<Item = Message>) -> Vec<Message> {
        let mut fresh = Vec::new();
        for message in messages {
            let entry = self.conversations.entry(message.conversation_id).or_default();
            if entry.messages.contains_key(&message.seq) {
                continue;
            }
            entry.messages.insert(message.seq, message.clone());
            entry.advance_watermark();
            fresh.push(message);
        }
        fresh.sort_by_key(|message| (message.conversation_id, message.seq));
        fresh
    }

    pub fn last_seq(&self, conversation_id: ConversationId) -> u64 {
        self.conversations
            .get(&conversation_id)
            .map(|cache| cache.last_seq)
            .unwrap_or(0)
    }

    pub fn messages(&self, conversation_id: ConversationId) -> Vec<Message> {
        self.conversations
            .get(&conversation_id)
            .map(|cache| cache.messages.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn apply_read(
        &mut self,
        conversation_id: ConversationId,
        reader_id: UserId,
        up_to_seq: u64,
        at: Timestamp,
    ) -> usize {
        self.stamp(conversation_id, reader_id, up_to_seq, |message| {
            message.mark_read(at)
        })
    }

    pub fn apply_delivered(
        &mut self,
        conversation_id: ConversationId,
        recipient_id: UserId,
        up_to_seq: u64,
        at: Timestamp,
    ) -> usize {
        self.stamp(conversation_id, recipient_id, up_to_seq, |message| {
            message.mark_delivered(at)
        })
    }

    fn stamp(
        &mut self,
        conversation_id: ConversationId,
        counterpart: UserId,
        up_to_seq: u64,
        mut mark: impl FnMut(&mut Message) -> bool,
    ) -> usize {
        let Some(cache) = self.conversations.get_mut(&conversation_id) else {
            return 0;
        };
        let mut stamped = 0;
        for message in cache.messages.range_mut(..=up_to_seq).map(|(_, message)| message) {
            if message.sender_id != counterpart && mark(message) {
                stamped += 1;
            }
        }
        stamped
    }
}

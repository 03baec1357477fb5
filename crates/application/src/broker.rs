//! 进程内的主题扇出。
//!
//! 每个连接会话一个有界邮箱，发布时对每个订阅者 `try_send`，
//! 邮箱满了就丢弃并记日志，慢消费者不会阻塞发布者，也不会拖慢其他会话。
//! 推送是尽力而为的，客户端重连时通过查询补齐。

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use domain::{RealtimeEvent, Topic, UserId};
use tokio::sync::mpsc;

/// 会话在代理中的标识
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

/// 投递给订阅者的事件；同一事件在多个订阅者间共享
#[derive(Debug, Clone)]
pub struct BrokerEvent {
    pub topic: Topic,
    pub event: Arc<RealtimeEvent>,
}

struct BrokerInner {
    topics: DashMap<Topic, HashMap<SessionId, mpsc::Sender<BrokerEvent>>>,
    next_session: AtomicU64,
    mailbox_capacity: usize,
}

#[derive(Clone)]
pub struct DeliveryBroker {
    inner: Arc<BrokerInner>,
}

impl DeliveryBroker {
    pub fn new(mailbox_capacity: usize) -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                topics: DashMap::new(),
                next_session: AtomicU64::new(1),
                mailbox_capacity: mailbox_capacity.max(1),
            }),
        }
    }

    /// 为一个已认证的连接创建会话
    pub fn open_session(&self, user_id: UserId) -> BrokerSession {
        let id = SessionId(self.inner.next_session.fetch_add(1, Ordering::Relaxed));
        let (sender, receiver) = mpsc::channel(self.inner.mailbox_capacity);
        tracing::debug!(session = id.0, user_id = %user_id, "broker session opened");
        BrokerSession {
            id,
            user_id,
            broker: self.clone(),
            sender,
            receiver,
            channels: HashSet::new(),
        }
    }

    /// 发布事件，返回成功放入邮箱的订阅者数量。
    ///
    /// 先复制订阅者列表再发送，发送期间不持有主题锁。
    pub fn publish(&self, topic: &Topic, event: RealtimeEvent) -> usize {
        let subscribers: Vec<(SessionId, mpsc::Sender<BrokerEvent>)> = match self.inner.topics.get(topic) {
            Some(subscribers) => subscribers
                .iter()
                .map(|(id, sender)| (*id, sender.clone()))
                .collect(),
            None => return 0,
        };

        let payload = BrokerEvent {
            topic: *topic,
            event: Arc::new(event),
        };
        let mut delivered = 0;
        for (session, sender) in subscribers {
            match sender.try_send(payload.clone()) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::warn!(session = session.0, topic = %topic, "subscriber mailbox full, dropping event");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    self.remove_subscriber(topic, session);
                }
            }
        }
        delivered
    }

    pub fn subscriber_count(&self, topic: &Topic) -> usize {
        self.inner
            .topics
            .get(topic)
            .map(|subscribers| subscribers.len())
            .unwrap_or(0)
    }

    pub fn topic_count(&self) -> usize {
        self.inner.topics.len()
    }

    fn add_subscriber(&self, topic: Topic, session: SessionId, sender: mpsc::Sender<BrokerEvent>) {
        self.inner
            .topics
            .entry(topic)
            .or_default()
            .insert(session, sender);
    }

    fn remove_subscriber(&self, topic: &Topic, session: SessionId) {
        if let Some(mut subscribers) = self.inner.topics.get_mut(topic) {
            subscribers.remove(&session);
        }
        self.inner
            .topics
            .remove_if(topic, |_, subscribers| subscribers.is_empty());
    }
}

impl Default for DeliveryBroker {
    fn default() -> Self {
        Self::new(256)
    }
}

/// 一个连接在代理中的订阅状态和邮箱。
///
/// 释放时自动退订所有主题；连接断开就是订阅结束。
pub struct BrokerSession {
    id: SessionId,
    user_id: UserId,
    broker: DeliveryBroker,
    sender: mpsc::Sender<BrokerEvent>,
    receiver: mpsc::Receiver<BrokerEvent>,
    channels: HashSet<Topic>,
}

impl BrokerSession {
    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    /// 订阅主题；重复订阅不产生副作用，返回是否为新订阅
    pub fn subscribe(&mut self, topic: Topic) -> bool {
        if !self.channels.insert(topic) {
            return false;
        }
        self.broker.add_subscriber(topic, self.id, self.sender.clone());
        true
    }

    pub fn unsubscribe(&mut self, topic: &Topic) -> bool {
        if !self.channels.remove(topic) {
            return false;
        }
        self.broker.remove_subscriber(topic, self.id);
        true
    }

    pub fn channels(&self) -> &HashSet<Topic> {
        &self.channels
    }

    pub fn is_subscribed(&self, topic: &Topic) -> bool {
        self.channels.contains(topic)
    }

    /// 等待下一个事件。会话自己持有一个发送端，因此不会返回 `None`
    /// 直到会话被释放。
    pub async fn recv(&mut self) -> Option<BrokerEvent> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<BrokerEvent> {
        self.receiver.try_recv().ok()
    }
}

impl Drop for BrokerSession {
    fn drop(&mut self) {
        for topic in self.channels.drain() {
            self.broker.remove_subscriber(&topic, self.id);
        }
        tracing::debug!(session = self.id.0, user_id = %self.user_id, "broker session closed");
    }
}

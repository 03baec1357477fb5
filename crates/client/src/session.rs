use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep_until, timeout, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use domain::{
    CellId, ClientFrame, ClientNonce, Conversation, ConversationId, GeoPoint, Message,
    NearbySitter, PresenceDelta, RealtimeEvent, ServerFrame, Topic, UserId,
};

use crate::backoff::Backoff;
use crate::cache::{ClientCache, PendingSend};
use crate::error::SessionError;
use crate::state::{DegradeReason, SessionEvent, SessionMachine, SessionState};
use crate::transport::{ChatApi, Connection, TokenSource, Transport};

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub backoff: Backoff,
    pub connect_timeout: Duration,
    pub auth_timeout: Duration,
    pub ping_interval: Duration,
    pub request_timeout: Duration,
    /// 必须与服务端的 `presence.cell_size_degrees` 一致
    pub cell_size_degrees: f64,
    /// 应用层更新队列容量，满了之后新的更新被丢弃
    pub update_buffer: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            backoff: Backoff::default(),
            connect_timeout: Duration::from_secs(10),
            auth_timeout: Duration::from_secs(10),
            ping_interval: Duration::from_secs(25),
            request_timeout: Duration::from_secs(5),
            cell_size_degrees: 0.05,
            update_buffer: 256,
        }
    }
}

/// 给界面使用的连通性信号
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityStatus {
    Online,
    Reconnecting { attempt: u32 },
    Offline,
}

impl ConnectivityStatus {
    fn from_state(state: SessionState, attempt: u32) -> Self {
        match state {
            SessionState::Subscribed => ConnectivityStatus::Online,
            SessionState::Disconnected => ConnectivityStatus::Offline,
            _ => ConnectivityStatus::Reconnecting { attempt },
        }
    }
}

/// 会话状况的只读快照
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    pub state: SessionState,
    pub user_id: Option<UserId>,
    pub attempt: u32,
    /// 最近一次成功换取新令牌的时间
    pub last_auth_refresh_at: Option<DateTime<Utc>>,
    pub channels: Vec<Topic>,
    pub pending_sends: usize,
}

/// 会话推给应用层的更新
#[derive(Debug, Clone, PartialEq)]
pub enum SessionUpdate {
    /// 去重后新出现的消息，按 seq 升序
    Messages {
        conversation_id: ConversationId,
        messages: Vec<Message>,
    },
    Queued {
        nonce: ClientNonce,
    },
    /// 发件箱中的消息已被服务端确认
    MessageSent {
        nonce: ClientNonce,
        message: Message,
    },
    /// 服务端永久拒绝，已从发件箱移除
    SendRejected {
        nonce: ClientNonce,
        error: SessionError,
    },
    NearbySnapshot {
        cell: CellId,
        sitters: Vec<NearbySitter>,
    },
    Presence(PresenceDelta),
    ConversationStarted(Conversation),
    Receipt(RealtimeEvent),
}

#[derive(Debug)]
enum SessionCommand {
    Send(PendingSend),
    Subscribe(Topic),
    Unsubscribe(Topic),
    WatchArea { center: GeoPoint, radius_meters: f64 },
}

/// 会话任务的句柄。丢弃句柄等同于 `close`
pub struct SessionHandle {
    commands: mpsc::Sender<SessionCommand>,
    status: watch::Receiver<ConnectivityStatus>,
    snapshot: watch::Receiver<SessionSnapshot>,
    updates: mpsc::Receiver<SessionUpdate>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl SessionHandle {
    /// 任何状态下都可以发送；未连接时进入发件箱，连上后按序冲刷
    pub async fn send_message(
        &self,
        conversation_id: ConversationId,
        body: impl Into<String>,
    ) -> Result<ClientNonce, SessionError> {
        self.send_message_with_nonce(conversation_id, body, ClientNonce::generate())
            .await
    }

    pub async fn send_message_with_nonce(
        &self,
        conversation_id: ConversationId,
        body: impl Into<String>,
        nonce: ClientNonce,
    ) -> Result<ClientNonce, SessionError> {
        let pending = PendingSend::new(conversation_id, body, nonce.clone());
        self.command(SessionCommand::Send(pending)).await?;
        Ok(nonce)
    }

    pub async fn subscribe(&self, topic: Topic) -> Result<(), SessionError> {
        self.command(SessionCommand::Subscribe(topic)).await
    }

    pub async fn unsubscribe(&self, topic: Topic) -> Result<(), SessionError> {
        self.command(SessionCommand::Unsubscribe(topic)).await
    }

    /// 订阅覆盖该圆形区域的所有地理格
    pub async fn watch_area(&self, center: GeoPoint, radius_meters: f64) -> Result<(), SessionError> {
        self.command(SessionCommand::WatchArea {
            center,
            radius_meters,
        })
        .await
    }

    async fn command(&self, command: SessionCommand) -> Result<(), SessionError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| SessionError::Closed)
    }

    pub fn status(&self) -> watch::Receiver<ConnectivityStatus> {
        self.status.clone()
    }

    pub fn current_status(&self) -> ConnectivityStatus {
        *self.status.borrow()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot.borrow().clone()
    }

    pub async fn next_update(&mut self) -> Option<SessionUpdate> {
        self.updates.recv().await
    }

    pub fn try_next_update(&mut self) -> Option<SessionUpdate> {
        self.updates.try_recv().ok()
    }

    /// 终止会话并等待任务退出；之后状态为 `Offline`
    pub async fn close(self) {
        self.cancel.cancel();
        if let Err(err) = self.task.await {
            tracing::warn!(error = %err, "session task ended abnormally");
        }
    }
}

/// 客户端连接会话
///
/// 单个任务独占状态机、缓存和当前连接。每个状态对应一个步骤函数，
/// 步骤返回下一个状态机事件；返回 `None` 表示会话被关闭。
pub struct ConnectionSession {
    config: SessionConfig,
    transport: Arc<dyn Transport>,
    tokens: Arc<dyn TokenSource>,
    api: Arc<dyn ChatApi>,
    machine: SessionMachine,
    cache: ClientCache,
    channels: BTreeSet<Topic>,
    /// 已发出订阅、尚未收到 `subscribed` 的频道；补偿要等确认之后再做
    awaiting_ack: BTreeSet<Topic>,
    connection: Option<Box<dyn Connection>>,
    user_id: Option<UserId>,
    last_auth_refresh_at: Option<DateTime<Utc>>,
    /// 发件箱被限流时的下次冲刷时间
    flush_at: Option<Instant>,
    throttled: u32,
    commands: mpsc::Receiver<SessionCommand>,
    status: watch::Sender<ConnectivityStatus>,
    snapshot: watch::Sender<SessionSnapshot>,
    updates: mpsc::Sender<SessionUpdate>,
    cancel: CancellationToken,
}

impl ConnectionSession {
    pub fn spawn(
        config: SessionConfig,
        transport: Arc<dyn Transport>,
        tokens: Arc<dyn TokenSource>,
        api: Arc<dyn ChatApi>,
        channels: impl IntoIterator<Item = Topic>,
    ) -> SessionHandle {
        let (command_tx, command_rx) = mpsc::channel(64);
        let (status_tx, status_rx) = watch::channel(ConnectivityStatus::Reconnecting { attempt: 0 });
        let (update_tx, update_rx) = mpsc::channel(config.update_buffer.max(1));
        let channels: BTreeSet<Topic> = channels.into_iter().collect();
        let (snapshot_tx, snapshot_rx) = watch::channel(SessionSnapshot {
            state: SessionState::Disconnected,
            user_id: None,
            attempt: 0,
            last_auth_refresh_at: None,
            channels: channels.iter().copied().collect(),
            pending_sends: 0,
        });
        let cancel = CancellationToken::new();

        let session = ConnectionSession {
            config,
            transport,
            tokens,
            api,
            machine: SessionMachine::new(),
            cache: ClientCache::new(),
            channels,
            awaiting_ack: BTreeSet::new(),
            connection: None,
            user_id: None,
            last_auth_refresh_at: None,
            flush_at: None,
            throttled: 0,
            commands: command_rx,
            status: status_tx,
            snapshot: snapshot_tx,
            updates: update_tx,
            cancel: cancel.clone(),
        };
        let task = tokio::spawn(session.run());

        SessionHandle {
            commands: command_tx,
            status: status_rx,
            snapshot: snapshot_rx,
            updates: update_rx,
            cancel,
            task,
        }
    }

    async fn run(mut self) {
        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            let step = match self.machine.state() {
                SessionState::Disconnected => Some(SessionEvent::Connect),
                SessionState::Connecting => self.connect().await,
                SessionState::Authenticating => self.authenticate().await,
                SessionState::Subscribed => self.serve().await,
                SessionState::Degraded(reason) => self.recover(reason).await,
            };
            match step {
                Some(event) => self.transition(event),
                None => break,
            }
        }

        self.connection = None;
        self.transition(SessionEvent::Close);
        tracing::debug!(pending = self.cache.outbox_len(), "会话已关闭");
    }

    fn transition(&mut self, event: SessionEvent) {
        let from = self.machine.state();
        match self.machine.apply(event) {
            Ok(to) => {
                if matches!(to, SessionState::Degraded(_)) {
                    self.connection = None;
                    tracing::warn!(from = %from, to = %to, event = ?event, attempt = self.machine.attempt(), "会话降级");
                } else {
                    tracing::debug!(from = %from, to = %to, event = ?event, "会话状态转移");
                }
                self.status
                    .send_replace(ConnectivityStatus::from_state(to, self.machine.attempt()));
                self.publish_snapshot();
            }
            Err(err) => tracing::warn!(error = %err, "忽略非法状态转移"),
        }
    }

    fn publish_snapshot(&self) {
        self.snapshot.send_replace(SessionSnapshot {
            state: self.machine.state(),
            user_id: self.user_id,
            attempt: self.machine.attempt(),
            last_auth_refresh_at: self.last_auth_refresh_at,
            channels: self.channels.iter().copied().collect(),
            pending_sends: self.cache.outbox_len(),
        });
    }

    async fn connect(&mut self) -> Option<SessionEvent> {
        let result = tokio::select! {
            _ = self.cancel.cancelled() => return None,
            result = timeout(self.config.connect_timeout, self.transport.connect()) => result,
        };
        match result {
            Ok(Ok(connection)) => {
                self.connection = Some(connection);
                Some(SessionEvent::TransportEstablished)
            }
            Ok(Err(err)) => {
                tracing::debug!(error = %err, "连接失败");
                Some(SessionEvent::TransportLost)
            }
            Err(_) => Some(SessionEvent::TransportLost),
        }
    }

    async fn authenticate(&mut self) -> Option<SessionEvent> {
        let token = match self.tokens.current().await {
            Ok(token) => token,
            Err(err) => {
                tracing::warn!(error = %err, "无法获取令牌");
                return Some(SessionEvent::AuthRejected);
            }
        };
        let Some(connection) = self.connection.as_mut() else {
            return Some(SessionEvent::TransportLost);
        };
        if connection
            .send(ClientFrame::Authenticate { token })
            .await
            .is_err()
        {
            return Some(SessionEvent::TransportLost);
        }

        let deadline = Instant::now() + self.config.auth_timeout;
        loop {
            let frame = tokio::select! {
                _ = self.cancel.cancelled() => return None,
                _ = sleep_until(deadline) => return Some(SessionEvent::AuthTimeout),
                frame = connection.recv() => frame,
            };
            match frame {
                Ok(Some(ServerFrame::Authenticated { user_id })) => {
                    self.user_id = Some(user_id);
                    return Some(SessionEvent::AuthAccepted);
                }
                Ok(Some(ServerFrame::AuthRejected { reason })) => {
                    tracing::warn!(reason = %reason, "认证被拒绝");
                    return Some(SessionEvent::AuthRejected);
                }
                Ok(Some(ServerFrame::AuthExpired)) => return Some(SessionEvent::AuthRejected),
                Ok(Some(_)) => continue,
                Err(SessionError::Protocol(reason)) => {
                    tracing::warn!(reason = %reason, "无法解析的服务端帧");
                }
                Ok(None) | Err(_) => return Some(SessionEvent::TransportLost),
            }
        }
    }

    /// 降级：退避等待，期间的发送进入发件箱。认证类失败在重连前先换新令牌
    async fn recover(&mut self, reason: DegradeReason) -> Option<SessionEvent> {
        let wake = Instant::now() + self.config.backoff.delay(self.machine.attempt());
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return None,
                _ = sleep_until(wake) => break,
                command = self.commands.recv() => match command {
                    Some(command) => self.queue_command(command),
                    None => return None,
                },
            }
        }

        if reason == DegradeReason::Auth {
            if let Err(err) = self.tokens.refresh().await {
                tracing::warn!(error = %err, "刷新令牌失败");
                return Some(SessionEvent::TokenRefreshFailed);
            }
            self.last_auth_refresh_at = Some(Utc::now());
        }
        Some(SessionEvent::BackoffElapsed)
    }

    fn queue_command(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::Send(pending) => {
                let nonce = pending.nonce.clone();
                if self.cache.enqueue(pending) {
                    self.emit(SessionUpdate::Queued { nonce });
                }
            }
            SessionCommand::Subscribe(topic) => {
                self.channels.insert(topic);
            }
            SessionCommand::Unsubscribe(topic) => {
                self.channels.remove(&topic);
            }
            SessionCommand::WatchArea {
                center,
                radius_meters,
            } => {
                let cells = CellId::covering(center, radius_meters, self.config.cell_size_degrees);
                self.channels.extend(cells.into_iter().map(Topic::GeoCell));
            }
        }
        self.publish_snapshot();
    }

    /// 已订阅：先补偿，再处理推送、命令和心跳
    async fn serve(&mut self) -> Option<SessionEvent> {
        let cancel = self.cancel.clone();
        tokio::select! {
            _ = cancel.cancelled() => return None,
            result = self.reconcile() => {
                if let Err(event) = result {
                    return Some(event);
                }
            }
        }

        let mut ping = interval_at(
            Instant::now() + self.config.ping_interval,
            self.config.ping_interval,
        );
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let flush_at = self.flush_at;
            let Some(connection) = self.connection.as_mut() else {
                return Some(SessionEvent::TransportLost);
            };
            let outcome = tokio::select! {
                _ = self.cancel.cancelled() => return None,
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => return None,
                },
                frame = connection.recv() => self.handle_frame(frame).await,
                _ = sleep_until(flush_at.unwrap_or_else(Instant::now)), if flush_at.is_some() => {
                    self.flush_at = None;
                    self.flush_outbox().await
                }
                _ = ping.tick() => self.send_frame(ClientFrame::Ping).await,
            };
            self.publish_snapshot();
            if let Err(event) = outcome {
                return Some(event);
            }
        }
    }

    /// 重新订阅全部频道并按序冲刷发件箱。
    ///
    /// 每个频道的补拉在收到该频道的 `subscribed` 之后才做：服务端确认时订阅已生效，
    /// 此后写入的消息一定会推送过来，早于确认的写入则由补拉取回。
    async fn reconcile(&mut self) -> Result<(), SessionEvent> {
        self.awaiting_ack.clear();
        self.flush_at = None;
        self.throttled = 0;
        let channels: Vec<Topic> = self.channels.iter().copied().collect();
        for topic in channels {
            self.request_subscription(topic).await?;
        }
        self.flush_outbox().await
    }

    async fn request_subscription(&mut self, topic: Topic) -> Result<(), SessionEvent> {
        self.send_frame(ClientFrame::Subscribe { topic }).await?;
        self.awaiting_ack.insert(topic);
        Ok(())
    }

    async fn reconcile_topic(&mut self, topic: Topic) -> Result<(), SessionEvent> {
        match topic {
            Topic::Conversation(conversation_id) => self.catch_up(conversation_id).await,
            Topic::GeoCell(cell) => self.snapshot(cell).await,
            Topic::User(_) => Ok(()),
        }
    }

    async fn handle_command(&mut self, command: SessionCommand) -> Result<(), SessionEvent> {
        match command {
            SessionCommand::Send(pending) => {
                let nonce = pending.nonce.clone();
                if self.cache.enqueue(pending) {
                    self.emit(SessionUpdate::Queued { nonce });
                }
                self.flush_outbox().await
            }
            SessionCommand::Subscribe(topic) => self.add_channel(topic).await,
            SessionCommand::Unsubscribe(topic) => {
                self.awaiting_ack.remove(&topic);
                if self.channels.remove(&topic) {
                    self.send_frame(ClientFrame::Unsubscribe { topic }).await?;
                }
                Ok(())
            }
            SessionCommand::WatchArea {
                center,
                radius_meters,
            } => {
                for cell in CellId::covering(center, radius_meters, self.config.cell_size_degrees) {
                    self.add_channel(Topic::GeoCell(cell)).await?;
                }
                Ok(())
            }
        }
    }

    async fn add_channel(&mut self, topic: Topic) -> Result<(), SessionEvent> {
        if !self.channels.insert(topic) {
            return Ok(());
        }
        self.request_subscription(topic).await
    }

    async fn handle_frame(
        &mut self,
        frame: Result<Option<ServerFrame>, SessionError>,
    ) -> Result<(), SessionEvent> {
        match frame {
            Ok(Some(ServerFrame::Event { event, .. })) => self.handle_event(event).await,
            Ok(Some(ServerFrame::Subscribed { topic })) => {
                if self.awaiting_ack.remove(&topic) {
                    self.reconcile_topic(topic).await
                } else {
                    Ok(())
                }
            }
            Ok(Some(ServerFrame::AuthExpired)) => {
                tracing::info!("令牌在会话中途过期");
                Err(SessionEvent::AuthRejected)
            }
            Ok(Some(ServerFrame::AuthRejected { reason })) => {
                tracing::warn!(reason = %reason, "会话被服务端拒绝");
                Err(SessionEvent::AuthRejected)
            }
            Ok(Some(ServerFrame::Error { code, message })) => {
                tracing::warn!(code = %code, message = %message, "服务端返回错误帧");
                Ok(())
            }
            Ok(Some(_)) => Ok(()),
            Err(SessionError::Protocol(reason)) => {
                tracing::warn!(reason = %reason, "无法解析的服务端帧");
                Ok(())
            }
            Ok(None) | Err(_) => Err(SessionEvent::TransportLost),
        }
    }

    /// 推送只是提示：seq 连续时直接并入，出现空洞就用查询补齐
    async fn handle_event(&mut self, event: RealtimeEvent) -> Result<(), SessionEvent> {
        match event {
            RealtimeEvent::MessageCreated { message } => {
                let conversation_id = message.conversation_id;
                let last_seq = self.cache.last_seq(conversation_id);
                if message.seq <= last_seq {
                    Ok(())
                } else if message.seq == last_seq + 1 {
                    self.deliver(conversation_id, vec![message]).await
                } else {
                    tracing::debug!(conversation_id = %conversation_id, seq = message.seq, last_seq, "推送出现空洞，补拉");
                    self.catch_up(conversation_id).await
                }
            }
            RealtimeEvent::MessagesRead {
                conversation_id,
                reader_id,
                up_to_seq,
                read_at,
            } => {
                self.cache
                    .apply_read(conversation_id, reader_id, up_to_seq, read_at);
                self.emit(SessionUpdate::Receipt(event));
                Ok(())
            }
            RealtimeEvent::MessagesDelivered {
                conversation_id,
                recipient_id,
                up_to_seq,
                delivered_at,
            } => {
                self.cache
                    .apply_delivered(conversation_id, recipient_id, up_to_seq, delivered_at);
                self.emit(SessionUpdate::Receipt(event));
                Ok(())
            }
            RealtimeEvent::ConversationStarted { conversation } => {
                self.emit(SessionUpdate::ConversationStarted(conversation.clone()));
                self.add_channel(Topic::Conversation(conversation.id)).await
            }
            RealtimeEvent::Presence { delta } => {
                self.emit(SessionUpdate::Presence(delta));
                Ok(())
            }
        }
    }

    async fn catch_up(&mut self, conversation_id: ConversationId) -> Result<(), SessionEvent> {
        let token = current_token(self.tokens.as_ref()).await?;
        let since = self.cache.last_seq(conversation_id);
        let result = request(
            self.config.request_timeout,
            self.api.get_messages(&token, conversation_id, since),
        )
        .await;
        match result {
            Ok(messages) => self.deliver(conversation_id, messages).await,
            Err(err) => Self::escalate(err, "补拉消息失败"),
        }
    }

    async fn snapshot(&mut self, cell: CellId) -> Result<(), SessionEvent> {
        let token = current_token(self.tokens.as_ref()).await?;
        let size = self.config.cell_size_degrees;
        let result = request(
            self.config.request_timeout,
            self.api
                .query_nearby(&token, cell.center(size), cell.circumradius_meters(size)),
        )
        .await;
        match result {
            Ok(sitters) => {
                let sitters = sitters
                    .into_iter()
                    .filter(|sitter| sitter.presence.cell(size) == cell)
                    .collect();
                self.emit(SessionUpdate::NearbySnapshot { cell, sitters });
                Ok(())
            }
            Err(err) => Self::escalate(err, "查询附近看护者失败"),
        }
    }

    async fn deliver(
        &mut self,
        conversation_id: ConversationId,
        messages: Vec<Message>,
    ) -> Result<(), SessionEvent> {
        let fresh = self.cache.ingest(messages);
        if fresh.is_empty() {
            return Ok(());
        }
        let from_others = fresh
            .iter()
            .any(|message| Some(message.sender_id) != self.user_id);
        self.emit(SessionUpdate::Messages {
            conversation_id,
            messages: fresh,
        });
        if from_others {
            let seq = self.cache.last_seq(conversation_id);
            self.send_frame(ClientFrame::Ack {
                conversation_id,
                seq,
            })
            .await?;
        }
        Ok(())
    }

    /// 按入队顺序逐条发送。
    ///
    /// 连接类失败保留队列并中止；请求类失败丢弃该条；被限流时队首保持不动，
    /// 等 `Retry-After` 或退避时间过后由 `serve` 再次冲刷。
    async fn flush_outbox(&mut self) -> Result<(), SessionEvent> {
        if self.flush_at.is_some() {
            return Ok(());
        }
        while let Some(pending) = self.cache.front().cloned() {
            let token = current_token(self.tokens.as_ref()).await?;
            let result = request(
                self.config.request_timeout,
                self.api.send_message(
                    &token,
                    pending.conversation_id,
                    &pending.body,
                    &pending.nonce,
                ),
            )
            .await;
            match result {
                Ok(message) => {
                    self.throttled = 0;
                    tracing::debug!(conversation_id = %pending.conversation_id, seq = message.seq, nonce = %pending.nonce, "发件箱消息已确认");
                    self.cache.acknowledge(&pending.nonce, message.clone());
                    self.emit(SessionUpdate::MessageSent {
                        nonce: pending.nonce,
                        message,
                    });
                }
                Err(SessionError::Throttled { retry_after }) => {
                    let delay =
                        retry_after.unwrap_or_else(|| self.config.backoff.delay(self.throttled));
                    self.throttled = self.throttled.saturating_add(1);
                    tracing::info!(nonce = %pending.nonce, delay_ms = delay.as_millis() as u64, pending = self.cache.outbox_len(), "发件箱被限流，稍后重试");
                    self.flush_at = Some(Instant::now() + delay);
                    return Ok(());
                }
                Err(err) if err.is_request_scoped() => {
                    tracing::warn!(nonce = %pending.nonce, error = %err, "消息被服务端拒绝");
                    self.cache.discard(&pending.nonce);
                    self.emit(SessionUpdate::SendRejected {
                        nonce: pending.nonce,
                        error: err,
                    });
                }
                Err(err) => {
                    tracing::debug!(pending = self.cache.outbox_len(), error = %err, "冲刷中断");
                    return Err(Self::connection_event(&err));
                }
            }
        }
        Ok(())
    }

    fn connection_event(err: &SessionError) -> SessionEvent {
        match err {
            SessionError::AuthExpired | SessionError::AuthRejected(_) => SessionEvent::AuthRejected,
            _ => SessionEvent::TransportLost,
        }
    }

    fn escalate(err: SessionError, context: &'static str) -> Result<(), SessionEvent> {
        if err.is_request_scoped() {
            tracing::warn!(error = %err, "{context}");
            return Ok(());
        }
        Err(Self::connection_event(&err))
    }

    async fn send_frame(&mut self, frame: ClientFrame) -> Result<(), SessionEvent> {
        let Some(connection) = self.connection.as_mut() else {
            return Err(SessionEvent::TransportLost);
        };
        connection.send(frame).await.map_err(|err| {
            tracing::debug!(error = %err, "发送帧失败");
            SessionEvent::TransportLost
        })
    }

    fn emit(&self, update: SessionUpdate) {
        match self.updates.try_send(update) {
            Ok(()) => {}
            Err(TrySendError::Full(update)) => {
                tracing::warn!(update = ?update, "更新队列已满，丢弃");
            }
            // 应用层不再接收
            Err(TrySendError::Closed(_)) => {}
        }
    }
}

async fn current_token(tokens: &dyn TokenSource) -> Result<String, SessionEvent> {
    tokens.current().await.map_err(|err| {
        tracing::warn!(error = %err, "无法获取令牌");
        SessionEvent::AuthRejected
    })
}

async fn request<T>(
    limit: Duration,
    call: impl Future<Output = Result<T, SessionError>>,
) -> Result<T, SessionError> {
    match timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(SessionError::Timeout),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{MockChatApi, MockTokenSource};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Mutex;

    /// 服务端行为可编排的假连接
    struct ScriptedConnection {
        incoming: mpsc::UnboundedReceiver<ServerFrame>,
        outgoing: mpsc::UnboundedSender<ClientFrame>,
    }

    #[async_trait]
    impl Connection for ScriptedConnection {
        async fn send(&mut self, frame: ClientFrame) -> Result<(), SessionError> {
            self.outgoing
                .send(frame)
                .map_err(|_| SessionError::transport("closed"))
        }

        async fn recv(&mut self) -> Result<Option<ServerFrame>, SessionError> {
            Ok(self.incoming.recv().await)
        }
    }

    /// 每次 connect 取出一条预先准备好的连接；没有时连接失败
    #[derive(Default)]
    struct ScriptedTransport {
        connections: Mutex<Vec<ScriptedConnection>>,
        attempts: AtomicUsize,
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn connect(&self) -> Result<Box<dyn Connection>, SessionError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            let mut connections = self.connections.lock().await;
            if connections.is_empty() {
                return Err(SessionError::transport("refused"));
            }
            Ok(Box::new(connections.remove(0)))
        }
    }

    struct ServerSide {
        to_client: mpsc::UnboundedSender<ServerFrame>,
        from_client: mpsc::UnboundedReceiver<ClientFrame>,
    }

    fn scripted_connection() -> (ScriptedConnection, ServerSide) {
        let (to_client, incoming) = mpsc::unbounded_channel();
        let (outgoing, from_client) = mpsc::unbounded_channel();
        (
            ScriptedConnection { incoming, outgoing },
            ServerSide {
                to_client,
                from_client,
            },
        )
    }

    fn fast_config() -> SessionConfig {
        SessionConfig {
            backoff: Backoff::new(Duration::from_millis(10), Duration::from_millis(50), 0.0),
            auth_timeout: Duration::from_millis(200),
            ..SessionConfig::default()
        }
    }

    fn message_from(sender_id: UserId, conversation_id: ConversationId, seq: u64) -> Message {
        Message {
            conversation_id,
            seq,
            sender_id,
            body: format!("m{seq}"),
            created_at: chrono::Utc::now(),
            client_nonce: ClientNonce::new(format!("t{seq}")).unwrap(),
            delivered_at: None,
            read_at: None,
        }
    }

    async fn authenticate(server: &mut ServerSide, user_id: UserId) {
        assert!(matches!(
            server.from_client.recv().await.unwrap(),
            ClientFrame::Authenticate { .. }
        ));
        server
            .to_client
            .send(ServerFrame::Authenticated { user_id })
            .unwrap();
    }

    async fn wait_for_status(handle: &SessionHandle, expected: ConnectivityStatus) {
        let mut status = handle.status();
        timeout(Duration::from_secs(5), status.wait_for(|s| *s == expected))
            .await
            .expect("status within timeout")
            .expect("session alive");
    }

    #[tokio::test]
    async fn auth_rejection_refreshes_token_before_reconnecting() {
        let transport = Arc::new(ScriptedTransport::default());
        let (first, mut first_server) = scripted_connection();
        let (second, mut second_server) = scripted_connection();
        transport.connections.lock().await.extend([first, second]);

        let refreshed = Arc::new(std::sync::Mutex::new(false));
        let mut tokens = MockTokenSource::new();
        let flag = refreshed.clone();
        tokens.expect_current().returning(move || {
            let fresh = *flag.lock().unwrap();
            Ok(if fresh { "fresh".into() } else { "stale".into() })
        });
        let flag = refreshed.clone();
        tokens.expect_refresh().times(1).returning(move || {
            *flag.lock().unwrap() = true;
            Ok("fresh".into())
        });

        let api = MockChatApi::new();
        let handle = ConnectionSession::spawn(
            fast_config(),
            transport.clone(),
            Arc::new(tokens),
            Arc::new(api),
            [],
        );

        let frame = first_server.from_client.recv().await.unwrap();
        assert_eq!(frame, ClientFrame::Authenticate { token: "stale".into() });
        first_server
            .to_client
            .send(ServerFrame::AuthRejected {
                reason: "token expired".into(),
            })
            .unwrap();

        let frame = second_server.from_client.recv().await.unwrap();
        assert_eq!(frame, ClientFrame::Authenticate { token: "fresh".into() });
        second_server
            .to_client
            .send(ServerFrame::Authenticated {
                user_id: UserId::from(uuid::Uuid::new_v4()),
            })
            .unwrap();

        wait_for_status(&handle, ConnectivityStatus::Online).await;
        assert_eq!(transport.attempts.load(Ordering::SeqCst), 2);
        assert!(handle.snapshot().last_auth_refresh_at.is_some());

        handle.close().await;
    }

    #[tokio::test]
    async fn silent_server_triggers_auth_timeout_and_retry() {
        let transport = Arc::new(ScriptedTransport::default());
        let (first, _first_server) = scripted_connection();
        transport.connections.lock().await.push(first);

        let mut tokens = MockTokenSource::new();
        tokens.expect_current().returning(|| Ok("t".into()));
        tokens.expect_refresh().never();

        let handle = ConnectionSession::spawn(
            fast_config(),
            transport.clone(),
            Arc::new(tokens),
            Arc::new(MockChatApi::new()),
            [],
        );

        // 第一次认证超时，之后每次连接都被拒绝，计数持续增长
        wait_for_status(&handle, ConnectivityStatus::Reconnecting { attempt: 2 }).await;
        assert!(transport.attempts.load(Ordering::SeqCst) >= 2);
        assert!(handle.snapshot().last_auth_refresh_at.is_none());

        handle.close().await;
    }

    #[tokio::test]
    async fn reconnect_reconciles_subscriptions_and_ignores_duplicate_pushes() {
        let conversation_id = ConversationId::from(uuid::Uuid::new_v4());
        let me = UserId::from(uuid::Uuid::new_v4());
        let them = UserId::from(uuid::Uuid::new_v4());
        let message = |seq: u64| Message {
            conversation_id,
            seq,
            sender_id: them,
            body: format!("m{seq}"),
            created_at: chrono::Utc::now(),
            client_nonce: ClientNonce::new(format!("t{seq}")).unwrap(),
            delivered_at: None,
            read_at: None,
        };

        let transport = Arc::new(ScriptedTransport::default());
        let (connection, mut server) = scripted_connection();
        transport.connections.lock().await.push(connection);

        let mut tokens = MockTokenSource::new();
        tokens.expect_current().returning(|| Ok("t".into()));

        let mut api = MockChatApi::new();
        let first = message(1);
        let second = message(2);
        api.expect_get_messages()
            .withf(move |_, id, since| *id == conversation_id && *since == 0)
            .times(1)
            .returning(move |_, _, _| Ok(vec![first.clone(), second.clone()]));
        let third = message(3);
        let fourth = message(4);
        api.expect_get_messages()
            .withf(move |_, _, since| *since == 2)
            .times(1)
            .returning(move |_, _, _| Ok(vec![third.clone(), fourth.clone()]));

        let mut handle = ConnectionSession::spawn(
            fast_config(),
            transport,
            Arc::new(tokens),
            Arc::new(api),
            [Topic::Conversation(conversation_id)],
        );

        assert!(matches!(
            server.from_client.recv().await.unwrap(),
            ClientFrame::Authenticate { .. }
        ));
        server
            .to_client
            .send(ServerFrame::Authenticated { user_id: me })
            .unwrap();
        assert_eq!(
            server.from_client.recv().await.unwrap(),
            ClientFrame::Subscribe {
                topic: Topic::Conversation(conversation_id)
            }
        );
        server
            .to_client
            .send(ServerFrame::Subscribed {
                topic: Topic::Conversation(conversation_id),
            })
            .unwrap();

        let Some(SessionUpdate::Messages { messages, .. }) = handle.next_update().await else {
            panic!("expected catch-up messages");
        };
        assert_eq!(messages.iter().map(|m| m.seq).collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(
            server.from_client.recv().await.unwrap(),
            ClientFrame::Ack {
                conversation_id,
                seq: 2
            }
        );

        // 重复推送被去重；跳号推送触发补拉
        for seq in [2, 4] {
            server
                .to_client
                .send(ServerFrame::Event {
                    topic: Topic::Conversation(conversation_id),
                    event: RealtimeEvent::MessageCreated {
                        message: message(seq),
                    },
                })
                .unwrap();
        }
        let Some(SessionUpdate::Messages { messages, .. }) = handle.next_update().await else {
            panic!("expected gap fill");
        };
        assert_eq!(messages.iter().map(|m| m.seq).collect::<Vec<_>>(), vec![3, 4]);

        handle.close().await;
    }

    #[tokio::test]
    async fn catch_up_waits_for_subscription_ack() {
        let conversation_id = ConversationId::from(uuid::Uuid::new_v4());
        let me = UserId::from(uuid::Uuid::new_v4());
        let them = UserId::from(uuid::Uuid::new_v4());

        let transport = Arc::new(ScriptedTransport::default());
        let (connection, mut server) = scripted_connection();
        transport.connections.lock().await.push(connection);

        let mut tokens = MockTokenSource::new();
        tokens.expect_current().returning(|| Ok("t".into()));

        let stored: Arc<std::sync::Mutex<Vec<Message>>> = Arc::default();
        let fetches = Arc::new(AtomicUsize::new(0));
        let mut api = MockChatApi::new();
        let (log, counter) = (stored.clone(), fetches.clone());
        api.expect_get_messages().returning(move |_, _, since| {
            counter.fetch_add(1, Ordering::SeqCst);
            let log = log.lock().unwrap();
            Ok(log.iter().filter(|m| m.seq > since).cloned().collect())
        });

        let mut handle = ConnectionSession::spawn(
            fast_config(),
            transport,
            Arc::new(tokens),
            Arc::new(api),
            [Topic::Conversation(conversation_id)],
        );

        authenticate(&mut server, me).await;
        assert_eq!(
            server.from_client.recv().await.unwrap(),
            ClientFrame::Subscribe {
                topic: Topic::Conversation(conversation_id)
            }
        );

        // 订阅还没生效时写入的消息不会被推送，只能靠确认后的补拉取回
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(fetches.load(Ordering::SeqCst), 0);
        stored
            .lock()
            .unwrap()
            .push(message_from(them, conversation_id, 1));
        server
            .to_client
            .send(ServerFrame::Subscribed {
                topic: Topic::Conversation(conversation_id),
            })
            .unwrap();

        let Some(SessionUpdate::Messages { messages, .. }) = handle.next_update().await else {
            panic!("expected catch-up after ack");
        };
        assert_eq!(messages.iter().map(|m| m.seq).collect::<Vec<_>>(), vec![1]);
        assert_eq!(fetches.load(Ordering::SeqCst), 1);

        handle.close().await;
    }

    #[tokio::test]
    async fn transport_loss_reconnects_with_same_token_and_resumes_from_watermark() {
        let conversation_id = ConversationId::from(uuid::Uuid::new_v4());
        let me = UserId::from(uuid::Uuid::new_v4());
        let them = UserId::from(uuid::Uuid::new_v4());
        let topic = Topic::Conversation(conversation_id);

        let transport = Arc::new(ScriptedTransport::default());
        let (first, mut first_server) = scripted_connection();
        let (second, mut second_server) = scripted_connection();
        transport.connections.lock().await.extend([first, second]);

        let mut tokens = MockTokenSource::new();
        tokens.expect_current().returning(|| Ok("t".into()));
        tokens.expect_refresh().never();

        let mut api = MockChatApi::new();
        api.expect_get_messages()
            .withf(|_, _, since| *since == 0)
            .times(1)
            .returning(move |_, id, _| {
                Ok(vec![message_from(them, id, 1), message_from(them, id, 2)])
            });
        api.expect_get_messages()
            .withf(|_, _, since| *since == 2)
            .times(1)
            .returning(move |_, id, _| Ok(vec![message_from(them, id, 3)]));

        let mut config = fast_config();
        config.backoff = Backoff::new(Duration::from_millis(40), Duration::from_millis(200), 0.0);
        let mut handle = ConnectionSession::spawn(
            config,
            transport.clone(),
            Arc::new(tokens),
            Arc::new(api),
            [topic],
        );

        authenticate(&mut first_server, me).await;
        assert_eq!(
            first_server.from_client.recv().await.unwrap(),
            ClientFrame::Subscribe { topic }
        );
        first_server
            .to_client
            .send(ServerFrame::Subscribed { topic })
            .unwrap();
        let Some(SessionUpdate::Messages { messages, .. }) = handle.next_update().await else {
            panic!("expected initial catch-up");
        };
        assert_eq!(messages.len(), 2);
        assert_eq!(
            first_server.from_client.recv().await.unwrap(),
            ClientFrame::Ack {
                conversation_id,
                seq: 2
            }
        );
        wait_for_status(&handle, ConnectivityStatus::Online).await;

        // 服务端断开：不换令牌，退避后重连
        let dropped_at = Instant::now();
        drop(first_server);

        assert_eq!(
            second_server.from_client.recv().await.unwrap(),
            ClientFrame::Authenticate { token: "t".into() }
        );
        assert!(dropped_at.elapsed() >= Duration::from_millis(40));
        second_server
            .to_client
            .send(ServerFrame::Authenticated { user_id: me })
            .unwrap();
        assert_eq!(
            second_server.from_client.recv().await.unwrap(),
            ClientFrame::Subscribe { topic }
        );
        second_server
            .to_client
            .send(ServerFrame::Subscribed { topic })
            .unwrap();

        let Some(SessionUpdate::Messages { messages, .. }) = handle.next_update().await else {
            panic!("expected catch-up after reconnect");
        };
        assert_eq!(messages.iter().map(|m| m.seq).collect::<Vec<_>>(), vec![3]);
        assert_eq!(transport.attempts.load(Ordering::SeqCst), 2);
        let snapshot = handle.snapshot();
        assert_eq!(snapshot.state, SessionState::Subscribed);
        assert_eq!(snapshot.channels, vec![topic]);
        assert!(snapshot.last_auth_refresh_at.is_none());

        handle.close().await;
    }

    #[tokio::test]
    async fn full_update_buffer_drops_updates_without_stalling() {
        let transport = Arc::new(ScriptedTransport::default());
        let mut tokens = MockTokenSource::new();
        tokens.expect_current().returning(|| Ok("t".into()));

        let mut config = fast_config();
        config.update_buffer = 2;
        let mut handle = ConnectionSession::spawn(
            config,
            transport,
            Arc::new(tokens),
            Arc::new(MockChatApi::new()),
            [],
        );

        let conversation_id = ConversationId::from(uuid::Uuid::new_v4());
        for n in 0..5 {
            handle
                .send_message(conversation_id, format!("queued {n}"))
                .await
                .expect("queue while offline");
        }
        // 发件箱照常累积，应用层只收到缓冲区容量内的更新
        let mut snapshot = handle.snapshot.clone();
        timeout(
            Duration::from_secs(5),
            snapshot.wait_for(|s| s.pending_sends == 5),
        )
        .await
        .expect("outbox within timeout")
        .expect("session alive");

        let mut received = 0;
        while handle.try_next_update().is_some() {
            received += 1;
        }
        assert_eq!(received, 2);

        handle
            .send_message(conversation_id, "after drain")
            .await
            .expect("session still accepts commands");
        let Some(SessionUpdate::Queued { .. }) = handle.next_update().await else {
            panic!("expected queued update after drain");
        };

        handle.close().await;
    }
}

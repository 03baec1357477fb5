use std::time::Duration;

use application::BrokerSession;
use axum::extract::ws::{Message as WsMessage, Utf8Bytes, WebSocket};
use domain::{ClientFrame, ServerFrame, Topic, UserId};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::time::{sleep_until, timeout, Instant};

use crate::auth::{AuthError, Claims};
use crate::state::AppState;

type WsSink = SplitSink<WebSocket, WsMessage>;
type WsStream = SplitStream<WebSocket>;

/// 连接结束的原因，仅用于日志
#[derive(Debug)]
enum CloseReason {
    ClientClosed,
    Idle,
    TokenExpired,
    AuthRejected,
    SendFailed,
}

/// 处理升级后的 WebSocket：先完成认证握手，再进入会话主循环
pub async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sender, mut incoming) = socket.split();

    let claims = match authenticate(&mut sender, &mut incoming, &state).await {
        Ok(claims) => claims,
        Err(reason) => {
            tracing::info!(reason = ?reason, "WebSocket 认证失败，关闭连接");
            let _ = sender.send(WsMessage::Close(None)).await;
            return;
        }
    };

    let user_id = claims.user();
    let mut session = state.broker.open_session(user_id);
    session.subscribe(Topic::User(user_id));

    if send_frame(&mut sender, &ServerFrame::Authenticated { user_id })
        .await
        .is_err()
    {
        return;
    }
    tracing::info!(user_id = %user_id, session = session.id().0, "WebSocket 连接已建立");

    let connection = WebSocketConnection {
        state,
        user_id,
        session,
        expires_at: expiry_instant(claims.exp),
    };
    let reason = connection.run(sender, incoming).await;
    tracing::info!(user_id = %user_id, reason = ?reason, "WebSocket连接已断开");
}

/// 第一帧必须是 `authenticate`，且在超时内到达
async fn authenticate(
    sender: &mut WsSink,
    incoming: &mut WsStream,
    state: &AppState,
) -> Result<Claims, CloseReason> {
    let first = match timeout(state.session.auth_timeout, next_client_frame(incoming)).await {
        Ok(Some(Ok(frame))) => frame,
        Ok(Some(Err(reason))) => {
            reject(sender, reason).await;
            return Err(CloseReason::AuthRejected);
        }
        Ok(None) => return Err(CloseReason::ClientClosed),
        Err(_) => {
            reject(sender, "authentication timed out".into()).await;
            return Err(CloseReason::AuthRejected);
        }
    };

    let ClientFrame::Authenticate { token } = first else {
        reject(sender, "first frame must be authenticate".into()).await;
        return Err(CloseReason::AuthRejected);
    };

    match state.jwt_service.verify_token(&token) {
        Ok(claims) => Ok(claims),
        Err(err) => {
            reject(sender, err.to_string()).await;
            Err(CloseReason::AuthRejected)
        }
    }
}

async fn reject(sender: &mut WsSink, reason: String) {
    let _ = send_frame(sender, &ServerFrame::AuthRejected { reason }).await;
}

/// 读取下一帧客户端 JSON；控制帧被跳过。`None` 表示连接已关闭
async fn next_client_frame(incoming: &mut WsStream) -> Option<Result<ClientFrame, String>> {
    loop {
        match incoming.next().await? {
            Ok(WsMessage::Text(text)) => {
                return Some(serde_json::from_str(text.as_str()).map_err(|err| err.to_string()))
            }
            Ok(WsMessage::Binary(bytes)) => {
                return Some(serde_json::from_slice(&bytes).map_err(|err| err.to_string()))
            }
            Ok(WsMessage::Close(_)) | Err(_) => return None,
            Ok(WsMessage::Ping(_)) | Ok(WsMessage::Pong(_)) => continue,
        }
    }
}

async fn send_frame(sender: &mut WsSink, frame: &ServerFrame) -> Result<(), axum::Error> {
    let payload = match serde_json::to_string(frame) {
        Ok(json) => json,
        Err(err) => {
            tracing::warn!(error = %err, "failed to serialize websocket payload");
            return Ok(());
        }
    };
    sender.send(WsMessage::Text(Utf8Bytes::from(payload))).await
}

fn expiry_instant(exp: i64) -> Instant {
    let remaining = exp.saturating_sub(chrono::Utc::now().timestamp()).max(0);
    Instant::now() + Duration::from_secs(remaining as u64)
}

/// 已认证的 WebSocket 连接
///
/// 单个任务内 `select!` 处理：
/// - 客户端帧（订阅、确认、心跳、续期）
/// - 代理推送的事件
/// - 空闲超时与令牌过期
struct WebSocketConnection {
    state: AppState,
    user_id: UserId,
    session: BrokerSession,
    expires_at: Instant,
}

impl WebSocketConnection {
    async fn run(mut self, mut sender: WsSink, mut incoming: WsStream) -> CloseReason {
        let heartbeat = self.state.session.heartbeat_timeout;
        let mut last_seen = Instant::now();

        let reason = loop {
            tokio::select! {
                frame = next_client_frame(&mut incoming) => {
                    last_seen = Instant::now();
                    let reply = match frame {
                        None => break CloseReason::ClientClosed,
                        Some(Err(message)) => vec![ServerFrame::Error {
                            code: "BAD_FRAME".into(),
                            message,
                        }],
                        Some(Ok(frame)) => match self.handle_frame(frame).await {
                            Ok(replies) => replies,
                            Err(reason) => {
                                let _ = send_frame(&mut sender, &ServerFrame::AuthRejected {
                                    reason: "token does not match session".into(),
                                }).await;
                                break reason;
                            }
                        },
                    };
                    for frame in reply {
                        if send_frame(&mut sender, &frame).await.is_err() {
                            return CloseReason::SendFailed;
                        }
                    }
                }
                event = self.session.recv() => {
                    let Some(event) = event else {
                        break CloseReason::SendFailed;
                    };
                    let frame = ServerFrame::Event {
                        topic: event.topic,
                        event: event.event.as_ref().clone(),
                    };
                    if send_frame(&mut sender, &frame).await.is_err() {
                        break CloseReason::SendFailed;
                    }
                }
                _ = sleep_until(last_seen + heartbeat) => {
                    tracing::info!(user_id = %self.user_id, "WebSocket 空闲超时");
                    break CloseReason::Idle;
                }
                _ = sleep_until(self.expires_at) => {
                    let _ = send_frame(&mut sender, &ServerFrame::AuthExpired).await;
                    break CloseReason::TokenExpired;
                }
            }
        };

        let _ = sender.send(WsMessage::Close(None)).await;
        reason
    }

    async fn handle_frame(&mut self, frame: ClientFrame) -> Result<Vec<ServerFrame>, CloseReason> {
        let reply = match frame {
            ClientFrame::Authenticate { token } => return self.refresh(&token),
            ClientFrame::Subscribe { topic } => match self.authorize_topic(&topic).await {
                Ok(()) => {
                    self.session.subscribe(topic);
                    ServerFrame::Subscribed { topic }
                }
                Err(frame) => frame,
            },
            ClientFrame::Unsubscribe { topic } => {
                self.session.unsubscribe(&topic);
                ServerFrame::Unsubscribed { topic }
            }
            ClientFrame::Ack {
                conversation_id,
                seq,
            } => {
                match self
                    .state
                    .chat_service
                    .acknowledge_delivery(conversation_id, self.user_id, seq)
                    .await
                {
                    Ok(_) => return Ok(Vec::new()),
                    Err(err) => error_frame(crate::error::ApiError::from(err)),
                }
            }
            ClientFrame::Ping => ServerFrame::Pong,
        };
        Ok(vec![reply])
    }

    /// 会话中途续期：同一用户的新令牌延长过期时间
    fn refresh(&mut self, token: &str) -> Result<Vec<ServerFrame>, CloseReason> {
        match self.state.jwt_service.verify_token(token) {
            Ok(claims) if claims.user() == self.user_id => {
                self.expires_at = expiry_instant(claims.exp);
                Ok(vec![ServerFrame::Authenticated {
                    user_id: self.user_id,
                }])
            }
            Ok(_) => Err(CloseReason::AuthRejected),
            Err(AuthError::Expired) => Ok(vec![ServerFrame::AuthRejected {
                reason: "token expired".into(),
            }]),
            Err(AuthError::Invalid(reason)) => Ok(vec![ServerFrame::AuthRejected { reason }]),
        }
    }

    async fn authorize_topic(&self, topic: &Topic) -> Result<(), ServerFrame> {
        match topic {
            Topic::Conversation(id) => self
                .state
                .chat_service
                .ensure_participant(*id, self.user_id)
                .await
                .map(|_| ())
                .map_err(|err| error_frame(crate::error::ApiError::from(err))),
            Topic::User(id) if *id != self.user_id => Err(ServerFrame::Error {
                code: "FORBIDDEN".into(),
                message: "cannot subscribe to another user's topic".into(),
            }),
            Topic::User(_) | Topic::GeoCell(_) => Ok(()),
        }
    }
}

fn error_frame(err: crate::error::ApiError) -> ServerFrame {
    ServerFrame::Error {
        code: err.code().to_string(),
        message: err.message().to_string(),
    }
}

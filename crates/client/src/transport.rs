use async_trait::async_trait;

use domain::{ClientFrame, ClientNonce, ConversationId, GeoPoint, Message, NearbySitter, ServerFrame};

use crate::error::SessionError;

/// 建立实时连接
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn Connection>, SessionError>;
}

/// 一条已建立的实时连接
///
/// `recv` 必须可以安全地在 `select!` 中被取消。
#[async_trait]
pub trait Connection: Send {
    async fn send(&mut self, frame: ClientFrame) -> Result<(), SessionError>;

    /// 下一帧服务端消息；`Ok(None)` 表示对端正常关闭
    async fn recv(&mut self) -> Result<Option<ServerFrame>, SessionError>;
}

/// 令牌来源。刷新由外部协作方完成
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn current(&self) -> Result<String, SessionError>;

    async fn refresh(&self) -> Result<String, SessionError>;
}

/// 固定令牌，刷新时原样返回
#[derive(Debug, Clone)]
pub struct StaticToken(pub String);

#[async_trait]
impl TokenSource for StaticToken {
    async fn current(&self) -> Result<String, SessionError> {
        Ok(self.0.clone())
    }

    async fn refresh(&self) -> Result<String, SessionError> {
        Ok(self.0.clone())
    }
}

/// 会话补偿和发件箱冲刷用到的 REST 接口
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChatApi: Send + Sync {
    async fn get_messages(
        &self,
        token: &str,
        conversation_id: ConversationId,
        since_seq: u64,
    ) -> Result<Vec<Message>, SessionError>;

    /// 新建与重复发送都返回服务端保存的那条消息
    async fn send_message(
        &self,
        token: &str,
        conversation_id: ConversationId,
        body: &str,
        nonce: &ClientNonce,
    ) -> Result<Message, SessionError>;

    async fn query_nearby(
        &self,
        token: &str,
        center: GeoPoint,
        radius_meters: f64,
    ) -> Result<Vec<NearbySitter>, SessionError>;
}

//! 领域模型错误定义
//!
//! 数据完整性类错误（例如非会话参与者）会同步返回给调用方；
//! 重复发送不属于错误，见 [`crate::AppendOutcome`]。

use thiserror::Error;

/// 领域模型错误类型
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DomainError {
    /// 参数校验失败
    #[error("invalid argument {field}: {reason}")]
    InvalidArgument { field: String, reason: String },

    /// 会话不存在
    #[error("conversation not found")]
    ConversationNotFound,

    /// 调用者不是该会话的参与者，不可重试
    #[error("user is not a participant of this conversation")]
    ConversationNotParticipant,

    /// 不能和自己建立会话
    #[error("cannot start a conversation with yourself")]
    SelfConversation,

    /// 指定的看护者当前不在线（已过期或主动下线）
    #[error("sitter presence not found")]
    PresenceNotFound,
}

impl DomainError {
    pub fn invalid_argument(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// 仓储层错误
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RepositoryError {
    #[error("record not found")]
    NotFound,
    #[error("record already exists")]
    Conflict,
    /// 追加消息时序列号冲突，存储内部会用新分配的序列号重试
    #[error("stale write: sequence {seq} already taken")]
    StaleWrite { seq: u64 },
    #[error("storage error: {message}")]
    Storage { message: String },
}

impl RepositoryError {
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }
}

/// 领域模型结果类型
pub type DomainResult<T> = Result<T, DomainError>;

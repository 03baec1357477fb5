//! 推送主题
//!
//! - `conversation.<id>`：新消息、已读/送达回执
//! - `presence.geo:<cell>`：位置增量、上线、下线
//! - `user.<id>`：发给某个用户的通知（例如新会话）

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::DomainError;
use crate::value_objects::{CellId, ConversationId, UserId};

const CONVERSATION_PREFIX: &str = "conversation.";
const GEO_PREFIX: &str = "presence.geo:";
const USER_PREFIX: &str = "user.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Topic {
    Conversation(ConversationId),
    GeoCell(CellId),
    User(UserId),
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Topic::Conversation(id) => write!(f, "{CONVERSATION_PREFIX}{id}"),
            Topic::GeoCell(cell) => write!(f, "{GEO_PREFIX}{cell}"),
            Topic::User(id) => write!(f, "{USER_PREFIX}{id}"),
        }
    }
}

impl FromStr for Topic {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(rest) = s.strip_prefix(CONVERSATION_PREFIX) {
            let id = Uuid::parse_str(rest)
                .map_err(|_| DomainError::invalid_argument("topic", "invalid conversation id"))?;
            return Ok(Topic::Conversation(ConversationId::from(id)));
        }
        if let Some(rest) = s.strip_prefix(GEO_PREFIX) {
            return Ok(Topic::GeoCell(rest.parse()?));
        }
        if let Some(rest) = s.strip_prefix(USER_PREFIX) {
            let id = Uuid::parse_str(rest)
                .map_err(|_| DomainError::invalid_argument("topic", "invalid user id"))?;
            return Ok(Topic::User(UserId::from(id)));
        }
        Err(DomainError::invalid_argument("topic", format!("unknown topic {s}")))
    }
}

impl Serialize for Topic {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Topic {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

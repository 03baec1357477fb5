use application::ConversationRepository;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use domain::{
    AppendOutcome, ClientNonce, Conversation, ConversationId, Message, NewMessage,
    RepositoryError, StartOutcome, Timestamp, UserId,
};
use sqlx::{postgres::PgPoolOptions, FromRow, PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::retry::{retry_async, RetryConfig};

const NONCE_CONSTRAINT: &str = "messages_nonce_unique";
const SEQ_CONSTRAINT: &str = "messages_pkey";

const CONVERSATION_COLUMNS: &str =
    "id, participant_a, participant_b, created_at, last_message_seq, last_activity_at";
const MESSAGE_COLUMNS: &str =
    "conversation_id, seq, sender_id, body, created_at, client_nonce, delivered_at, read_at";

fn map_sqlx_err(err: sqlx::Error) -> RepositoryError {
    if let sqlx::Error::Database(db) = &err {
        match db.constraint() {
            Some(SEQ_CONSTRAINT) => return RepositoryError::StaleWrite { seq: 0 },
            Some(_) if db.is_unique_violation() => return RepositoryError::Conflict,
            _ => {}
        }
    }
    RepositoryError::storage(err.to_string())
}

fn invalid_data(message: impl Into<String>) -> RepositoryError {
    RepositoryError::storage(message)
}

fn to_db_seq(seq: u64) -> i64 {
    i64::try_from(seq).unwrap_or(i64::MAX)
}

fn from_db_seq(seq: i64) -> Result<u64, RepositoryError> {
    u64::try_from(seq).map_err(|_| invalid_data(format!("negative seq {seq}")))
}

#[derive(Debug, FromRow)]
struct ConversationRecord {
    id: Uuid,
    participant_a: Uuid,
    participant_b: Uuid,
    created_at: DateTime<Utc>,
    last_message_seq: i64,
    last_activity_at: DateTime<Utc>,
}

impl TryFrom<ConversationRecord> for Conversation {
    type Error = RepositoryError;

    fn try_from(value: ConversationRecord) -> Result<Self, Self::Error> {
        Ok(Conversation {
            id: ConversationId::from(value.id),
            participant_a: UserId::from(value.participant_a),
            participant_b: UserId::from(value.participant_b),
            created_at: value.created_at,
            last_message_seq: from_db_seq(value.last_message_seq)?,
            last_activity_at: value.last_activity_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct MessageRecord {
    conversation_id: Uuid,
    seq: i64,
    sender_id: Uuid,
    body: String,
    created_at: DateTime<Utc>,
    client_nonce: String,
    delivered_at: Option<DateTime<Utc>>,
    read_at: Option<DateTime<Utc>>,
}

impl TryFrom<MessageRecord> for Message {
    type Error = RepositoryError;

    fn try_from(value: MessageRecord) -> Result<Self, Self::Error> {
        let client_nonce =
            ClientNonce::new(value.client_nonce).map_err(|err| invalid_data(err.to_string()))?;
        Ok(Message {
            conversation_id: ConversationId::from(value.conversation_id),
            seq: from_db_seq(value.seq)?,
            sender_id: UserId::from(value.sender_id),
            body: value.body,
            created_at: value.created_at,
            client_nonce,
            delivered_at: value.delivered_at,
            read_at: value.read_at,
        })
    }
}

/// PostgreSQL 会话仓储。
///
/// 序号分配依赖 `UPDATE conversations ... RETURNING last_message_seq` 的行锁：
/// 同一会话的并发追加在该行上串行化，插入失败时整个事务回滚，序号不会产生空洞。
#[derive(Clone)]
pub struct PgConversationRepository {
    pool: PgPool,
    retry: RetryConfig,
}

impl PgConversationRepository {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            retry: RetryConfig::default(),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn nonce_lookup<'e, E>(
        executor: E,
        id: ConversationId,
        nonce: &ClientNonce,
    ) -> Result<Option<Message>, RepositoryError>
    where
        E: sqlx::PgExecutor<'e>,
    {
        let record = sqlx::query_as::<_, MessageRecord>(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE conversation_id = $1 AND client_nonce = $2"
        ))
        .bind(Uuid::from(id))
        .bind(nonce.as_str())
        .fetch_optional(executor)
        .await
        .map_err(map_sqlx_err)?;

        record.map(Message::try_from).transpose()
    }

    async fn append_once(&self, message: &NewMessage) -> Result<AppendOutcome, RepositoryError> {
        let mut tx: Transaction<'_, Postgres> = self.pool.begin().await.map_err(map_sqlx_err)?;

        if let Some(existing) =
            Self::nonce_lookup(&mut *tx, message.conversation_id, &message.client_nonce).await?
        {
            tx.rollback().await.map_err(map_sqlx_err)?;
            return Ok(AppendOutcome::Duplicate(existing));
        }

        let seq: Option<i64> = sqlx::query_scalar(
            r#"UPDATE conversations
               SET last_message_seq = last_message_seq + 1, last_activity_at = $2
               WHERE id = $1
               RETURNING last_message_seq"#,
        )
        .bind(Uuid::from(message.conversation_id))
        .bind(message.created_at)
        .fetch_optional(&mut *tx)
        .await
        .map_err(map_sqlx_err)?;
        let seq = seq.ok_or(RepositoryError::NotFound)?;

        let inserted = sqlx::query_as::<_, MessageRecord>(&format!(
            "INSERT INTO messages (conversation_id, seq, sender_id, body, created_at, client_nonce)
             VALUES ($1, $2, $3, $4, $5, $6)
             RETURNING {MESSAGE_COLUMNS}"
        ))
        .bind(Uuid::from(message.conversation_id))
        .bind(seq)
        .bind(Uuid::from(message.sender_id))
        .bind(message.body.as_str())
        .bind(message.created_at)
        .bind(message.client_nonce.as_str())
        .fetch_one(&mut *tx)
        .await;

        match inserted {
            Ok(record) => {
                tx.commit().await.map_err(map_sqlx_err)?;
                Ok(AppendOutcome::Created(Message::try_from(record)?))
            }
            Err(sqlx::Error::Database(db)) if db.constraint() == Some(NONCE_CONSTRAINT) => {
                // 并发的相同 nonce 已先提交，回滚本次序号并返回已有消息
                tx.rollback().await.map_err(map_sqlx_err)?;
                Self::nonce_lookup(&self.pool, message.conversation_id, &message.client_nonce)
                    .await?
                    .map(AppendOutcome::Duplicate)
                    .ok_or_else(|| invalid_data("nonce conflict without stored message"))
            }
            Err(err) => {
                let err = map_sqlx_err(err);
                tx.rollback().await.map_err(map_sqlx_err)?;
                Err(match err {
                    RepositoryError::StaleWrite { .. } => RepositoryError::StaleWrite {
                        seq: from_db_seq(seq)?,
                    },
                    other => other,
                })
            }
        }
    }
}

#[async_trait]
impl ConversationRepository for PgConversationRepository {
    async fn start_conversation(
        &self,
        candidate: Conversation,
    ) -> Result<StartOutcome, RepositoryError> {
        let inserted = sqlx::query_as::<_, ConversationRecord>(&format!(
            "INSERT INTO conversations ({CONVERSATION_COLUMNS})
             VALUES ($1, $2, $3, $4, $5, $6)
             ON CONFLICT DO NOTHING
             RETURNING {CONVERSATION_COLUMNS}"
        ))
        .bind(Uuid::from(candidate.id))
        .bind(Uuid::from(candidate.participant_a))
        .bind(Uuid::from(candidate.participant_b))
        .bind(candidate.created_at)
        .bind(to_db_seq(candidate.last_message_seq))
        .bind(candidate.last_activity_at)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        if let Some(record) = inserted {
            return Ok(StartOutcome {
                conversation: Conversation::try_from(record)?,
                created: true,
            });
        }

        let existing = sqlx::query_as::<_, ConversationRecord>(&format!(
            "SELECT {CONVERSATION_COLUMNS} FROM conversations
             WHERE participant_a = $1 AND participant_b = $2"
        ))
        .bind(Uuid::from(candidate.participant_a))
        .bind(Uuid::from(candidate.participant_b))
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        Ok(StartOutcome {
            conversation: Conversation::try_from(existing)?,
            created: false,
        })
    }

    async fn find_conversation(
        &self,
        id: ConversationId,
    ) -> Result<Option<Conversation>, RepositoryError> {
        let record = sqlx::query_as::<_, ConversationRecord>(&format!(
            "SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE id = $1"
        ))
        .bind(Uuid::from(id))
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        record.map(Conversation::try_from).transpose()
    }

    async fn list_conversations(
        &self,
        user_id: UserId,
    ) -> Result<Vec<Conversation>, RepositoryError> {
        let records = sqlx::query_as::<_, ConversationRecord>(&format!(
            "SELECT {CONVERSATION_COLUMNS} FROM conversations
             WHERE participant_a = $1 OR participant_b = $1
             ORDER BY last_activity_at DESC, created_at DESC, id"
        ))
        .bind(Uuid::from(user_id))
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        records.into_iter().map(Conversation::try_from).collect()
    }

    async fn find_by_nonce(
        &self,
        id: ConversationId,
        nonce: &ClientNonce,
    ) -> Result<Option<Message>, RepositoryError> {
        Self::nonce_lookup(&self.pool, id, nonce).await
    }

    async fn append_message(&self, message: NewMessage) -> Result<AppendOutcome, RepositoryError> {
        retry_async(
            &self.retry,
            |err| matches!(err, RepositoryError::StaleWrite { .. }),
            || self.append_once(&message),
        )
        .await
    }

    async fn get_messages(
        &self,
        id: ConversationId,
        since_seq: u64,
    ) -> Result<Vec<Message>, RepositoryError> {
        let records = sqlx::query_as::<_, MessageRecord>(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages
             WHERE conversation_id = $1 AND seq > $2
             ORDER BY seq ASC"
        ))
        .bind(Uuid::from(id))
        .bind(to_db_seq(since_seq))
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        records.into_iter().map(Message::try_from).collect()
    }

    async fn mark_read(
        &self,
        id: ConversationId,
        up_to_seq: u64,
        reader_id: UserId,
        at: Timestamp,
    ) -> Result<u64, RepositoryError> {
        let result = sqlx::query(
            r#"UPDATE messages
               SET read_at = $4, delivered_at = COALESCE(delivered_at, $4)
               WHERE conversation_id = $1 AND seq <= $2 AND sender_id <> $3 AND read_at IS NULL"#,
        )
        .bind(Uuid::from(id))
        .bind(to_db_seq(up_to_seq))
        .bind(Uuid::from(reader_id))
        .bind(at)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        Ok(result.rows_affected())
    }

    async fn mark_delivered(
        &self,
        id: ConversationId,
        up_to_seq: u64,
        recipient_id: UserId,
        at: Timestamp,
    ) -> Result<u64, RepositoryError> {
        let result = sqlx::query(
            r#"UPDATE messages
               SET delivered_at = $4
               WHERE conversation_id = $1 AND seq <= $2 AND sender_id <> $3 AND delivered_at IS NULL"#,
        )
        .bind(Uuid::from(id))
        .bind(to_db_seq(up_to_seq))
        .bind(Uuid::from(recipient_id))
        .bind(at)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        Ok(result.rows_affected())
    }
}

pub async fn create_pg_pool(
    database_url: &str,
    max_connections: u32,
) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await
}

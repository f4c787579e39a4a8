use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::models::{
    CloseReason, ContextRef, Conversation, ConversationStatus, ConversationType, DeliveryStatus,
    Message, Participant, ParticipantRole,
};
use crate::store::{ConversationStore, MessageStore, PurgeOutcome};

/// Production store. Schema lives in `migrations/`.
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> AppResult<Self> {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| AppError::StartServer(format!("migrations: {e}")))?;
        Ok(Self { pool })
    }
}

fn conversation_from_row(row: &PgRow) -> AppResult<Conversation> {
    let status_text: String = row.try_get("status")?;
    let status = ConversationStatus::parse(&status_text)
        .ok_or_else(|| AppError::Database(format!("bad conversation status: {status_text}")))?;
    let type_text: String = row.try_get("conversation_type")?;
    let conversation_type = ConversationType::parse(&type_text)
        .ok_or_else(|| AppError::Database(format!("bad conversation type: {type_text}")))?;
    let close_reason: Option<String> = row.try_get("close_reason")?;
    let close_reason = match close_reason {
        Some(raw) => Some(
            CloseReason::parse(&raw)
                .ok_or_else(|| AppError::Database(format!("bad close reason: {raw}")))?,
        ),
        None => None,
    };
    let context_type: Option<String> = row.try_get("context_type")?;
    let context_id: Option<Uuid> = row.try_get("context_id")?;
    let context = match (context_type, context_id) {
        (Some(context_type), Some(context_id)) => Some(ContextRef {
            context_type,
            context_id,
        }),
        _ => None,
    };
    let max_participants: i32 = row.try_get("max_participants")?;
    Ok(Conversation {
        id: row.try_get("id")?,
        tenant_id: row.try_get("tenant_id")?,
        topic: row.try_get("topic")?,
        conversation_type,
        context,
        initiator_id: row.try_get("initiator_id")?,
        status,
        close_reason,
        max_participants: max_participants as usize,
        confidential: row.try_get("confidential")?,
        system_muted: row.try_get("system_muted")?,
        retention_days: row.try_get("retention_days")?,
        auto_close_days: row.try_get("auto_close_days")?,
        metadata: row.try_get("metadata")?,
        created_at: row.try_get("created_at")?,
        last_activity_at: row.try_get("last_activity_at")?,
    })
}

fn participant_from_row(row: &PgRow) -> AppResult<Participant> {
    let role_text: String = row.try_get("role")?;
    let role = ParticipantRole::parse(&role_text)
        .ok_or_else(|| AppError::Database(format!("bad participant role: {role_text}")))?;
    Ok(Participant {
        conversation_id: row.try_get("conversation_id")?,
        user_id: row.try_get("user_id")?,
        role,
        joined_at: row.try_get("joined_at")?,
        muted: row.try_get("muted")?,
        last_read_seq: row.try_get("last_read_seq")?,
    })
}

fn message_from_row(row: &PgRow) -> AppResult<Message> {
    Ok(Message {
        id: row.try_get("id")?,
        conversation_id: row.try_get("conversation_id")?,
        sender_id: row.try_get("sender_id")?,
        sequence_number: row.try_get("sequence_number")?,
        ciphertext: row.try_get("ciphertext")?,
        created_at: row.try_get("created_at")?,
        edited_at: row.try_get("edited_at")?,
        deleted: row.try_get("deleted")?,
    })
}

#[async_trait]
impl ConversationStore for PostgresStore {
    async fn insert_conversation(
        &self,
        conversation: &Conversation,
        owner: &Participant,
    ) -> AppResult<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO conversations
                (id, tenant_id, topic, conversation_type, context_type, context_id,
                 initiator_id, status, close_reason, max_participants, confidential,
                 system_muted, retention_days, auto_close_days, metadata,
                 created_at, last_activity_at, next_seq)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, NULL, $9, $10, $11, $12, $13, $14, $15, $16, 0)
            "#,
        )
        .bind(conversation.id)
        .bind(conversation.tenant_id)
        .bind(&conversation.topic)
        .bind(conversation.conversation_type.as_str())
        .bind(conversation.context.as_ref().map(|c| c.context_type.clone()))
        .bind(conversation.context.as_ref().map(|c| c.context_id))
        .bind(conversation.initiator_id)
        .bind(conversation.status.as_str())
        .bind(conversation.max_participants as i32)
        .bind(conversation.confidential)
        .bind(conversation.system_muted)
        .bind(conversation.retention_days)
        .bind(conversation.auto_close_days)
        .bind(&conversation.metadata)
        .bind(conversation.created_at)
        .bind(conversation.last_activity_at)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO participants
                (conversation_id, user_id, role, joined_at, muted, last_read_seq)
            VALUES ($1, $2, $3, $4, FALSE, 0)
            "#,
        )
        .bind(owner.conversation_id)
        .bind(owner.user_id)
        .bind(owner.role.as_str())
        .bind(owner.joined_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn get_conversation(&self, id: Uuid) -> AppResult<Conversation> {
        let row = sqlx::query("SELECT * FROM conversations WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(AppError::NotFound)?;
        conversation_from_row(&row)
    }

    async fn update_status(
        &self,
        id: Uuid,
        status: ConversationStatus,
        reason: Option<CloseReason>,
    ) -> AppResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE conversations
            SET status = $2, close_reason = COALESCE($3, close_reason)
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(status.as_str())
        .bind(reason.map(|r| r.as_str()))
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(AppError::NotFound);
        }
        Ok(())
    }

    async fn touch_activity(&self, id: Uuid, at: DateTime<Utc>) -> AppResult<()> {
        sqlx::query("UPDATE conversations SET last_activity_at = $2 WHERE id = $1")
            .bind(id)
            .bind(at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn add_participant(&self, participant: &Participant) -> AppResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO participants
                (conversation_id, user_id, role, joined_at, muted, last_read_seq)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (conversation_id, user_id) DO NOTHING
            "#,
        )
        .bind(participant.conversation_id)
        .bind(participant.user_id)
        .bind(participant.role.as_str())
        .bind(participant.joined_at)
        .bind(participant.muted)
        .bind(participant.last_read_seq)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn remove_participant(&self, conversation_id: Uuid, user_id: Uuid) -> AppResult<bool> {
        let result =
            sqlx::query("DELETE FROM participants WHERE conversation_id = $1 AND user_id = $2")
                .bind(conversation_id)
                .bind(user_id)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn set_participant_muted(
        &self,
        conversation_id: Uuid,
        user_id: Uuid,
        muted: bool,
    ) -> AppResult<()> {
        let result = sqlx::query(
            "UPDATE participants SET muted = $3 WHERE conversation_id = $1 AND user_id = $2",
        )
        .bind(conversation_id)
        .bind(user_id)
        .bind(muted)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(AppError::NotAParticipant);
        }
        Ok(())
    }

    async fn update_system_muted(&self, id: Uuid, muted: bool) -> AppResult<()> {
        let result = sqlx::query("UPDATE conversations SET system_muted = $2 WHERE id = $1")
            .bind(id)
            .bind(muted)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(AppError::NotFound);
        }
        Ok(())
    }

    async fn participants(&self, conversation_id: Uuid) -> AppResult<Vec<Participant>> {
        let rows = sqlx::query(
            "SELECT * FROM participants WHERE conversation_id = $1 ORDER BY joined_at",
        )
        .bind(conversation_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(participant_from_row).collect()
    }

    async fn participant(
        &self,
        conversation_id: Uuid,
        user_id: Uuid,
    ) -> AppResult<Option<Participant>> {
        let row = sqlx::query(
            "SELECT * FROM participants WHERE conversation_id = $1 AND user_id = $2",
        )
        .bind(conversation_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(participant_from_row).transpose()
    }

    async fn set_last_read_seq(
        &self,
        conversation_id: Uuid,
        user_id: Uuid,
        seq: i64,
    ) -> AppResult<()> {
        sqlx::query(
            r#"
            UPDATE participants
            SET last_read_seq = GREATEST(last_read_seq, $3)
            WHERE conversation_id = $1 AND user_id = $2
            "#,
        )
        .bind(conversation_id)
        .bind(user_id)
        .bind(seq)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_for_user(&self, user_id: Uuid) -> AppResult<Vec<Conversation>> {
        let rows = sqlx::query(
            r#"
            SELECT c.* FROM conversations c
            JOIN participants p ON p.conversation_id = c.id
            WHERE p.user_id = $1
            ORDER BY c.last_activity_at DESC
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(conversation_from_row).collect()
    }

    async fn list_all(&self) -> AppResult<Vec<Conversation>> {
        let rows = sqlx::query("SELECT * FROM conversations")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(conversation_from_row).collect()
    }

    async fn purge_conversation(&self, id: Uuid) -> AppResult<()> {
        // participants, messages, and receipts cascade from the FK
        sqlx::query("DELETE FROM conversations WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl MessageStore for PostgresStore {
    async fn append(
        &self,
        conversation_id: Uuid,
        sender_id: Uuid,
        ciphertext: Vec<u8>,
    ) -> AppResult<Message> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(
            "UPDATE conversations SET next_seq = next_seq + 1 WHERE id = $1 RETURNING next_seq",
        )
        .bind(conversation_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(AppError::NotFound)?;
        let seq: i64 = row.try_get("next_seq")?;

        let message = Message {
            id: Uuid::new_v4(),
            conversation_id,
            sender_id,
            sequence_number: seq,
            ciphertext,
            created_at: Utc::now(),
            edited_at: None,
            deleted: false,
        };

        sqlx::query(
            r#"
            INSERT INTO messages
                (id, conversation_id, sender_id, sequence_number, ciphertext,
                 created_at, edited_at, deleted)
            VALUES ($1, $2, $3, $4, $5, $6, NULL, FALSE)
            "#,
        )
        .bind(message.id)
        .bind(message.conversation_id)
        .bind(message.sender_id)
        .bind(message.sequence_number)
        .bind(&message.ciphertext)
        .bind(message.created_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(message)
    }

    async fn get(&self, message_id: Uuid) -> AppResult<Message> {
        let row = sqlx::query("SELECT * FROM messages WHERE id = $1")
            .bind(message_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(AppError::NotFound)?;
        message_from_row(&row)
    }

    async fn update_ciphertext(
        &self,
        message_id: Uuid,
        ciphertext: Vec<u8>,
        edited_at: DateTime<Utc>,
    ) -> AppResult<()> {
        let result = sqlx::query(
            "UPDATE messages SET ciphertext = $2, edited_at = $3 WHERE id = $1 AND NOT deleted",
        )
        .bind(message_id)
        .bind(ciphertext)
        .bind(edited_at)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(AppError::NotFound);
        }
        Ok(())
    }

    async fn tombstone(&self, message_id: Uuid) -> AppResult<()> {
        let result = sqlx::query(
            "UPDATE messages SET deleted = TRUE, ciphertext = ''::bytea WHERE id = $1",
        )
        .bind(message_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(AppError::NotFound);
        }
        Ok(())
    }

    async fn list_since(
        &self,
        conversation_id: Uuid,
        since_seq: i64,
        limit: i64,
    ) -> AppResult<Vec<Message>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM messages
            WHERE conversation_id = $1 AND sequence_number > $2
            ORDER BY sequence_number
            LIMIT $3
            "#,
        )
        .bind(conversation_id)
        .bind(since_seq)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(message_from_row).collect()
    }

    async fn unread_count(&self, conversation_id: Uuid, last_read_seq: i64) -> AppResult<i64> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS n FROM messages
            WHERE conversation_id = $1 AND sequence_number > $2 AND NOT deleted
            "#,
        )
        .bind(conversation_id)
        .bind(last_read_seq)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("n")?)
    }

    async fn upsert_receipts(
        &self,
        message_id: Uuid,
        recipients: &[Uuid],
        status: DeliveryStatus,
    ) -> AppResult<()> {
        if recipients.is_empty() {
            return Ok(());
        }
        // rank order: sent < delivered < read; only upgrades apply
        sqlx::query(
            r#"
            INSERT INTO delivery_receipts (message_id, recipient_id, status, updated_at)
            SELECT $1, r, $2, NOW() FROM UNNEST($3::uuid[]) AS r
            ON CONFLICT (message_id, recipient_id) DO UPDATE
            SET status = EXCLUDED.status, updated_at = NOW()
            WHERE CASE delivery_receipts.status
                    WHEN 'sent' THEN 0 WHEN 'delivered' THEN 1 ELSE 2 END
                < CASE EXCLUDED.status
                    WHEN 'sent' THEN 0 WHEN 'delivered' THEN 1 ELSE 2 END
            "#,
        )
        .bind(message_id)
        .bind(status.as_str())
        .bind(recipients)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_read_up_to(
        &self,
        conversation_id: Uuid,
        recipient_id: Uuid,
        up_to_seq: i64,
    ) -> AppResult<()> {
        sqlx::query(
            r#"
            UPDATE delivery_receipts dr
            SET status = 'read', updated_at = NOW()
            FROM messages m
            WHERE m.id = dr.message_id
              AND m.conversation_id = $1
              AND m.sequence_number <= $3
              AND dr.recipient_id = $2
              AND dr.status <> 'read'
            "#,
        )
        .bind(conversation_id)
        .bind(recipient_id)
        .bind(up_to_seq)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn purge_older_than(
        &self,
        conversation_id: Uuid,
        cutoff: DateTime<Utc>,
    ) -> AppResult<PurgeOutcome> {
        let mut tx = self.pool.begin().await?;

        let tombstoned = sqlx::query(
            r#"
            UPDATE messages m
            SET deleted = TRUE, ciphertext = ''::bytea
            WHERE m.conversation_id = $1 AND m.created_at < $2 AND NOT m.deleted
              AND EXISTS (SELECT 1 FROM delivery_receipts dr WHERE dr.message_id = m.id)
            "#,
        )
        .bind(conversation_id)
        .bind(cutoff)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        let purged = sqlx::query(
            r#"
            DELETE FROM messages m
            WHERE m.conversation_id = $1 AND m.created_at < $2 AND NOT m.deleted
              AND NOT EXISTS (SELECT 1 FROM delivery_receipts dr WHERE dr.message_id = m.id)
            "#,
        )
        .bind(conversation_id)
        .bind(cutoff)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        tx.commit().await?;
        Ok(PurgeOutcome { purged, tombstoned })
    }
}

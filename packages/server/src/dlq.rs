use chrono::Utc;
use common::DlqEnvelope;
use sea_orm::{ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter, Set, SqlErr};

use crate::entity::dead_letter_message;
use crate::error::{DepotError, DepotResult};

/// Dead-lettered ingestion tasks, kept for inspection.
pub struct DlqService<'a, C: ConnectionTrait> {
    conn: &'a C,
}

impl<'a, C: ConnectionTrait> DlqService<'a, C> {
    pub fn new(conn: &'a C) -> Self {
        Self { conn }
    }

    /// Persist a failed message. A message dead-lettered again keeps its first row.
    pub async fn send_to_dlq(&self, envelope: &DlqEnvelope) -> DepotResult<dead_letter_message::Model> {
        let now = Utc::now();
        let model = dead_letter_message::ActiveModel {
            message_id: Set(envelope.message_id.clone()),
            message_type: Set(envelope.message_type.clone()),
            user_identity: Set(envelope.user_identity.clone()),
            payload: Set(envelope.payload.clone()),
            error_message: Set(envelope.error_message.clone()),
            error_code: Set(envelope.error_code.to_string()),
            retry_count: Set(envelope.retry_history.len() as i32),
            retry_history: Set(serde_json::to_value(&envelope.retry_history).unwrap_or_default()),
            first_failed_at: Set(envelope.retry_history.first().map_or(now, |r| r.timestamp)),
            created_at: Set(now),
            ..Default::default()
        };

        match model.insert(self.conn).await {
            Ok(inserted) => Ok(inserted),
            Err(e) if matches!(e.sql_err(), Some(SqlErr::UniqueConstraintViolation(_))) => {
                dead_letter_message::Entity::find()
                    .filter(dead_letter_message::Column::MessageId.eq(&envelope.message_id))
                    .one(self.conn)
                    .await?
                    .ok_or_else(|| DepotError::NotFound(format!("dead letter {}", envelope.message_id)))
            }
            Err(e) => Err(e.into()),
        }
    }
}

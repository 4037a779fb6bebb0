//! Append-only ledger of processed objects
//!
//! Records are keyed by `(thread_id, message_id, object_type)`. The push
//! processor looks that key up before categorizing to detect replays, and
//! bulk re-processing uses `find_since` to skip recent work. Nothing in the
//! pipeline updates or deletes a record.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{PipelineError, Result};
use crate::models::Message;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectType {
    Email,
    Attachment,
    Reminder,
    CalendarEvent,
    MeetingRecording,
    Document,
    Image,
    Video,
    UrlLink,
    User,
    Message,
    Note,
    VoiceNote,
}

impl ObjectType {
    pub const ALL: [ObjectType; 13] = [
        ObjectType::Email,
        ObjectType::Attachment,
        ObjectType::Reminder,
        ObjectType::CalendarEvent,
        ObjectType::MeetingRecording,
        ObjectType::Document,
        ObjectType::Image,
        ObjectType::Video,
        ObjectType::UrlLink,
        ObjectType::User,
        ObjectType::Message,
        ObjectType::Note,
        ObjectType::VoiceNote,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectType::Email => "email",
            ObjectType::Attachment => "attachment",
            ObjectType::Reminder => "reminder",
            ObjectType::CalendarEvent => "calendar_event",
            ObjectType::MeetingRecording => "meeting_recording",
            ObjectType::Document => "document",
            ObjectType::Image => "image",
            ObjectType::Video => "video",
            ObjectType::UrlLink => "url_link",
            ObjectType::User => "user",
            ObjectType::Message => "message",
            ObjectType::Note => "note",
            ObjectType::VoiceNote => "voice_note",
        }
    }
}

impl fmt::Display for ObjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for ObjectType {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        ObjectType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| PipelineError::Validation(format!("Unknown object type: {}", s)))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditRecord {
    pub id: Uuid,
    pub thread_id: String,
    pub message_id: String,
    pub object_type: ObjectType,
    /// Serialized outcome
    pub result: String,
    pub object_timestamp: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl AuditRecord {
    pub fn new(
        thread_id: impl Into<String>,
        message_id: impl Into<String>,
        object_type: ObjectType,
        result: impl Into<String>,
        object_timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            thread_id: thread_id.into(),
            message_id: message_id.into(),
            object_type,
            result: result.into(),
            object_timestamp,
            created_at: Utc::now(),
        }
    }

    /// Email record for a processed message
    pub fn for_message(message: &Message, result: impl Into<String>) -> Self {
        Self::new(
            message.thread_id.clone(),
            message.id.clone(),
            ObjectType::Email,
            result,
            message.timestamp,
        )
    }

    fn matches(&self, thread_id: &str, message_id: &str, object_type: ObjectType) -> bool {
        self.thread_id == thread_id && self.message_id == message_id && self.object_type == object_type
    }
}

#[async_trait]
pub trait AuditLog: Send + Sync {
    async fn append(&self, record: AuditRecord) -> Result<()>;

    async fn exists(&self, thread_id: &str, message_id: &str, object_type: ObjectType)
        -> Result<bool>;

    /// Records created at or after `since`, oldest first
    async fn find_since(
        &self,
        since: DateTime<Utc>,
        object_type: Option<ObjectType>,
    ) -> Result<Vec<AuditRecord>>;
}

/// Process-local ledger
#[derive(Debug, Default)]
pub struct MemoryAuditLog {
    records: RwLock<Vec<AuditRecord>>,
}

impl MemoryAuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    pub async fn records(&self) -> Vec<AuditRecord> {
        self.records.read().await.clone()
    }
}

#[async_trait]
impl AuditLog for MemoryAuditLog {
    async fn append(&self, record: AuditRecord) -> Result<()> {
        self.records.write().await.push(record);
        Ok(())
    }

    async fn exists(
        &self,
        thread_id: &str,
        message_id: &str,
        object_type: ObjectType,
    ) -> Result<bool> {
        Ok(self
            .records
            .read()
            .await
            .iter()
            .any(|r| r.matches(thread_id, message_id, object_type)))
    }

    async fn find_since(
        &self,
        since: DateTime<Utc>,
        object_type: Option<ObjectType>,
    ) -> Result<Vec<AuditRecord>> {
        let mut found: Vec<AuditRecord> = self
            .records
            .read()
            .await
            .iter()
            .filter(|r| r.created_at >= since)
            .filter(|r| object_type.map_or(true, |t| r.object_type == t))
            .cloned()
            .collect();
        found.sort_by_key(|r| r.created_at);
        Ok(found)
    }
}

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteAuditLog;

#[cfg(feature = "sqlite")]
mod sqlite {
    use super::*;
    use crate::database::Database;
    use chrono::SecondsFormat;
    use rusqlite::types::Type;

    /// Fixed-width UTC text so SQL string comparison orders by time
    fn encode_time(time: DateTime<Utc>) -> String {
        time.to_rfc3339_opts(SecondsFormat::Millis, true)
    }

    fn conversion_error<E>(column: usize, err: E) -> rusqlite::Error
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        rusqlite::Error::FromSqlConversionFailure(column, Type::Text, Box::new(err))
    }

    fn decode_time(column: usize, text: &str) -> rusqlite::Result<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(text)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| conversion_error(column, e))
    }

    fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<AuditRecord> {
        let id: String = row.get(0)?;
        let object_type: String = row.get(3)?;
        let object_timestamp: String = row.get(5)?;
        let created_at: String = row.get(6)?;
        Ok(AuditRecord {
            id: Uuid::parse_str(&id).map_err(|e| conversion_error(0, e))?,
            thread_id: row.get(1)?,
            message_id: row.get(2)?,
            object_type: ObjectType::from_str(&object_type)
                .map_err(|e| conversion_error(3, e))?,
            result: row.get(4)?,
            object_timestamp: decode_time(5, &object_timestamp)?,
            created_at: decode_time(6, &created_at)?,
        })
    }

    /// `processed_objects` table in the shared database
    #[derive(Debug, Clone)]
    pub struct SqliteAuditLog {
        db: Database,
    }

    impl SqliteAuditLog {
        pub fn new(db: Database) -> Self {
            Self { db }
        }
    }

    #[async_trait]
    impl AuditLog for SqliteAuditLog {
        async fn append(&self, record: AuditRecord) -> Result<()> {
            self.db
                .with_conn(move |conn| {
                    conn.execute(
                        "INSERT INTO processed_objects
                            (id, thread_id, message_id, object_type, result, object_timestamp, created_at)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                        rusqlite::params![
                            record.id.to_string(),
                            record.thread_id,
                            record.message_id,
                            record.object_type.as_str(),
                            record.result,
                            encode_time(record.object_timestamp),
                            encode_time(record.created_at),
                        ],
                    )?;
                    Ok(())
                })
                .await
        }

        async fn exists(
            &self,
            thread_id: &str,
            message_id: &str,
            object_type: ObjectType,
        ) -> Result<bool> {
            let thread_id = thread_id.to_string();
            let message_id = message_id.to_string();
            self.db
                .with_conn(move |conn| {
                    let found: bool = conn.query_row(
                        "SELECT EXISTS(
                            SELECT 1 FROM processed_objects
                            WHERE thread_id = ?1 AND message_id = ?2 AND object_type = ?3)",
                        rusqlite::params![thread_id, message_id, object_type.as_str()],
                        |row| row.get(0),
                    )?;
                    Ok(found)
                })
                .await
        }

        async fn find_since(
            &self,
            since: DateTime<Utc>,
            object_type: Option<ObjectType>,
        ) -> Result<Vec<AuditRecord>> {
            let since = encode_time(since);
            let object_type = object_type.map(|t| t.as_str());
            self.db
                .with_conn(move |conn| {
                    let mut stmt = conn.prepare(
                        "SELECT id, thread_id, message_id, object_type, result, object_timestamp, created_at
                         FROM processed_objects
                         WHERE created_at >= ?1 AND (?2 IS NULL OR object_type = ?2)
                         ORDER BY created_at ASC",
                    )?;
                    let records = stmt
                        .query_map(rusqlite::params![since, object_type], row_to_record)?
                        .collect::<std::result::Result<Vec<_>, _>>()?;
                    Ok(records)
                })
                .await
        }
    }
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::encode::IsNull;
use sqlx::error::BoxDynError;
use sqlx::postgres::{PgArgumentBuffer, PgTypeInfo, PgValueRef};
use sqlx::{Decode, Encode, Postgres, Type};
use strum::{Display, EnumString};
use uuid::Uuid;

/// Lifecycle state of an alt-text generation task.
///
/// Transitions are monotone (`PENDING -> PROCESSING -> DONE|FAILED`) except
/// for the DLQ-driven `PROCESSING -> PENDING` re-drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "UPPERCASE")]
#[strum(serialize_all = "UPPERCASE")]
pub enum TaskStatus {
    Pending,
    Processing,
    Done,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Done | TaskStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "PENDING",
            TaskStatus::Processing => "PROCESSING",
            TaskStatus::Done => "DONE",
            TaskStatus::Failed => "FAILED",
        }
    }
}

// Stored as TEXT; delegate the wire representation to `&str`.
impl Type<Postgres> for TaskStatus {
    fn type_info() -> PgTypeInfo {
        <&str as Type<Postgres>>::type_info()
    }

    fn compatible(ty: &PgTypeInfo) -> bool {
        <&str as Type<Postgres>>::compatible(ty)
    }
}

impl Encode<'_, Postgres> for TaskStatus {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> Result<IsNull, BoxDynError> {
        <&str as Encode<'_, Postgres>>::encode_by_ref(&self.as_str(), buf)
    }
}

impl<'r> Decode<'r, Postgres> for TaskStatus {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let text = <&'r str as Decode<'r, Postgres>>::decode(value)?;
        text.parse::<TaskStatus>().map_err(Into::into)
    }
}

/// One (image, context) unit of work with a lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Task {
    pub id: Uuid,
    pub image_key: String,
    pub context_text: String,
    pub status: TaskStatus,
    pub alt1: Option<String>,
    pub alt2: Option<String>,
    pub selected_index: Option<i32>,
    pub final_alt: Option<String>,
    pub is_approved: bool,
    pub attempts: i32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Wire payload published to `tasks.main` for each accepted upload.
///
/// The shape is part of the external contract; unknown fields are rejected.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TaskMessage {
    pub id: Uuid,
    pub image_key: String,
    pub context: String,
}

impl TaskMessage {
    pub fn for_task(task: &Task) -> Self {
        Self {
            id: task.id,
            image_key: task.image_key.clone(),
            context: task.context_text.clone(),
        }
    }
}

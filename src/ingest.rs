use std::io::Cursor;

use image::ImageFormat;
use uuid::Uuid;

use crate::db::store::TaskStore;
use crate::error::ApiError;
use crate::models::api::{BulkItemOutcome, BulkUploadResponse};
use crate::models::task::{Task, TaskMessage};
use crate::services::broker::{Broker, MAIN_QUEUE};
use crate::services::storage::ObjectStore;
use crate::services::text::clean_context;

pub const MAX_IMAGE_BYTES: usize = 20 * 1024 * 1024;
pub const MAX_IMAGE_DIMENSION: u32 = 8192;
pub const MAX_CONTEXT_BYTES: usize = 16 * 1024;

/// One raw upload item before validation.
pub struct UploadItem {
    pub image: Vec<u8>,
    pub context: String,
}

/// Compensation for a completed staging step, executed in reverse when a
/// later step fails.
enum Undo<'a> {
    Blob(&'a str),
    Row(Uuid),
}

/// Stage one accepted upload: blob write, row insert, message publish, in
/// that order. On failure the completed steps are unwound; if the unwind
/// itself fails the orphan is left for the reconciler and the caller sees
/// `Internal`.
pub async fn stage_task(
    store: &dyn TaskStore,
    blobs: &dyn ObjectStore,
    broker: &dyn Broker,
    item: &UploadItem,
) -> Result<Task, ApiError> {
    let content_type = validate_image(&item.image)?;
    let context = validate_context(&item.context)?;

    let id = Uuid::new_v4();
    let image_key = format!("tasks/{id}");
    let mut undo: Vec<Undo> = Vec::with_capacity(2);

    blobs
        .put_if_absent(&image_key, &item.image, content_type)
        .await
        .map_err(ApiError::from)?;
    undo.push(Undo::Blob(&image_key));

    let task = match store.insert(id, &image_key, &context).await {
        Ok(task) => task,
        Err(e) => return Err(unwind(store, blobs, undo, e.into()).await),
    };
    undo.push(Undo::Row(id));

    let message = serde_json::to_string(&TaskMessage::for_task(&task))
        .map_err(|e| ApiError::Internal(format!("message encoding failed: {e}")))?;

    if let Err(e) = broker
        .publish(MAIN_QUEUE, &message, std::time::Duration::ZERO)
        .await
    {
        return Err(unwind(store, blobs, undo, e.into()).await);
    }

    metrics::counter!("alt_tasks_submitted").increment(1);
    tracing::info!(
        task_id = %task.id,
        image_key = %task.image_key,
        image_size = item.image.len(),
        "task staged and queued"
    );

    Ok(task)
}

/// Process items sequentially, keeping earlier successes when one fails.
pub async fn stage_bulk(
    store: &dyn TaskStore,
    blobs: &dyn ObjectStore,
    broker: &dyn Broker,
    items: &[UploadItem],
) -> BulkUploadResponse {
    let mut outcomes = Vec::with_capacity(items.len());
    for (index, item) in items.iter().enumerate() {
        match stage_task(store, blobs, broker, item).await {
            Ok(task) => outcomes.push(BulkItemOutcome {
                index,
                id: Some(task.id),
                status: Some(task.status),
                error: None,
            }),
            Err(e) => {
                tracing::warn!(index, error = %e, "bulk item rejected");
                outcomes.push(BulkItemOutcome {
                    index,
                    id: None,
                    status: None,
                    error: Some(e.to_string()),
                });
            }
        }
    }
    BulkUploadResponse { tasks: outcomes }
}

async fn unwind(
    store: &dyn TaskStore,
    blobs: &dyn ObjectStore,
    undo: Vec<Undo<'_>>,
    primary: ApiError,
) -> ApiError {
    for step in undo.into_iter().rev() {
        let result = match step {
            Undo::Row(id) => store.delete(id).await.map_err(|e| e.to_string()),
            Undo::Blob(key) => blobs.delete(key).await.map_err(|e| e.to_string()),
        };
        if let Err(e) = result {
            tracing::error!(error = %e, "staging rollback failed, orphan left for reconciler");
            return ApiError::Internal(format!("rollback failed after: {primary}"));
        }
    }
    primary
}

/// Reject anything that is not a bounded, decodable raster image.
pub fn validate_image(bytes: &[u8]) -> Result<&'static str, ApiError> {
    if bytes.is_empty() {
        return Err(ApiError::BadInput("image is empty".to_string()));
    }
    if bytes.len() > MAX_IMAGE_BYTES {
        return Err(ApiError::PayloadTooLarge(format!(
            "image exceeds {} MiB",
            MAX_IMAGE_BYTES / (1024 * 1024)
        )));
    }

    let format = image::guess_format(bytes).map_err(|_| {
        ApiError::UnsupportedMedia("invalid or unrecognized image format".to_string())
    })?;
    let content_type = match format {
        ImageFormat::Jpeg => "image/jpeg",
        ImageFormat::Png => "image/png",
        ImageFormat::WebP => "image/webp",
        _ => {
            return Err(ApiError::UnsupportedMedia(
                "only JPEG, PNG, and WebP formats are supported".to_string(),
            ))
        }
    };

    let (width, height) = image::ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .map_err(|e| ApiError::UnsupportedMedia(format!("unreadable image header: {e}")))?
        .into_dimensions()
        .map_err(|e| ApiError::UnsupportedMedia(format!("unreadable image header: {e}")))?;

    if width > MAX_IMAGE_DIMENSION || height > MAX_IMAGE_DIMENSION {
        return Err(ApiError::BadInput(format!(
            "image dimensions {width}x{height} exceed {MAX_IMAGE_DIMENSION}x{MAX_IMAGE_DIMENSION}"
        )));
    }

    Ok(content_type)
}

/// Clean and bound the surrounding context text.
pub fn validate_context(raw: &str) -> Result<String, ApiError> {
    let cleaned = clean_context(raw);
    if cleaned.is_empty() {
        return Err(ApiError::BadInput("context is empty".to_string()));
    }
    if cleaned.len() > MAX_CONTEXT_BYTES {
        return Err(ApiError::BadInput(format!(
            "context exceeds {} KiB",
            MAX_CONTEXT_BYTES / 1024
        )));
    }
    Ok(cleaned)
}

use chrono::Utc;
use uuid::Uuid;

use scholaris_shared::clients::minio::MinioClient;
use scholaris_shared::errors::{AppError, AppResult, ErrorCode};

use crate::models::{Attachment, MessageType};
use crate::BoxFuture;

pub const MAX_UPLOAD_BYTES: usize = 25 * 1024 * 1024;

/// A file handed over by a client, not yet stored.
#[derive(Debug, Clone)]
pub struct Upload {
    pub file_name: Option<String>,
    pub content_type: String,
    pub bytes: Vec<u8>,
}

impl Upload {
    pub fn message_type(&self) -> MessageType {
        if self.content_type.starts_with("image/") {
            MessageType::Image
        } else {
            MessageType::File
        }
    }
}

/// Stores binary content and hands back an opaque reference.
pub trait UploadStore: Send + Sync {
    fn store(&self, tenant_id: Uuid, conversation_id: Uuid, upload: Upload) -> BoxFuture<'_, AppResult<Attachment>>;
}

pub struct MinioUploadStore {
    minio: MinioClient,
}

impl MinioUploadStore {
    pub fn new(minio: MinioClient) -> Self {
        Self { minio }
    }
}

fn extension(file_name: Option<&str>) -> Option<&str> {
    file_name
        .and_then(|n| n.rsplit_once('.'))
        .map(|(_, ext)| ext)
        .filter(|ext| !ext.is_empty() && ext.len() <= 10 && ext.chars().all(|c| c.is_ascii_alphanumeric()))
}

pub fn object_key(tenant_id: Uuid, conversation_id: Uuid, file_name: Option<&str>) -> String {
    let date = Utc::now().format("%Y/%m");
    let id = Uuid::now_v7();
    match extension(file_name) {
        Some(ext) => format!("{tenant_id}/{conversation_id}/{date}/{id}.{}", ext.to_ascii_lowercase()),
        None => format!("{tenant_id}/{conversation_id}/{date}/{id}"),
    }
}

impl UploadStore for MinioUploadStore {
    fn store(&self, tenant_id: Uuid, conversation_id: Uuid, upload: Upload) -> BoxFuture<'_, AppResult<Attachment>> {
        Box::pin(async move {
            if upload.bytes.is_empty() {
                return Err(AppError::Validation("upload is empty".into()));
            }
            if upload.bytes.len() > MAX_UPLOAD_BYTES {
                return Err(AppError::new(ErrorCode::PayloadTooLarge, "upload exceeds 25 MB"));
            }

            let key = object_key(tenant_id, conversation_id, upload.file_name.as_deref());
            let size_bytes = upload.bytes.len() as i64;
            let stored = self
                .minio
                .upload(&key, upload.bytes, &upload.content_type)
                .await
                .map_err(|e| AppError::Internal(anyhow::anyhow!(e)))?;

            tracing::debug!(key = %stored.reference, size_bytes, "upload stored");

            Ok(Attachment {
                reference: stored.reference,
                storage_tag: stored.storage_tag,
                file_name: upload.file_name,
                content_type: Some(upload.content_type),
                size_bytes: Some(size_bytes),
            })
        })
    }
}

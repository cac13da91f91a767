//! Document upload endpoint: validate, store, hand back a retrieval URL.

use std::sync::Arc;
use std::time::Duration;

use idgate_core::document::{self, DocumentUpload, ValidationError};
use idgate_core::{DocumentRecord, ObjectLocation};
use serde::Serialize;
use thiserror::Error;

use crate::providers::{ObjectStorage, ProviderError};

#[derive(Error, Debug)]
pub enum UploadError {
    #[error("document bucket is not configured")]
    Configuration,
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("storing document failed: {0}")]
    Storage(#[from] ProviderError),
}

/// What the endpoint answers for a stored document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UploadReceipt {
    pub bucket: String,
    pub key: String,
    pub url: String,
    pub kind: String,
    pub content_type: String,
    pub bytes: u64,
}

impl UploadReceipt {
    pub fn into_record(self, country: &str) -> DocumentRecord {
        DocumentRecord {
            country: country.to_string(),
            kind: self.kind,
            url: self.url,
            location: ObjectLocation::new(self.bucket, self.key),
            content_type: self.content_type,
            bytes: self.bytes,
        }
    }
}

pub struct DocumentUploader {
    storage: Arc<dyn ObjectStorage>,
    bucket: Option<String>,
    prefix: String,
    presign: bool,
    url_ttl: Duration,
}

impl DocumentUploader {
    pub fn new(
        storage: Arc<dyn ObjectStorage>,
        bucket: Option<String>,
        prefix: impl Into<String>,
        presign: bool,
        url_ttl: Duration,
    ) -> Self {
        Self {
            storage,
            bucket,
            prefix: prefix.into(),
            presign,
            url_ttl,
        }
    }

    pub async fn upload(&self, upload: DocumentUpload) -> Result<UploadReceipt, UploadError> {
        let bucket = self.bucket.clone().ok_or(UploadError::Configuration)?;
        let doc = document::validate(upload).map_err(|e| {
            tracing::warn!(error = %e, "document upload rejected");
            e
        })?;

        let key = document::object_key(
            &self.prefix,
            &doc,
            chrono::Utc::now().timestamp_millis(),
            uuid::Uuid::new_v4(),
        );
        let location = ObjectLocation::new(bucket, key);
        let size = doc.bytes.len() as u64;

        self.storage
            .put(&location, doc.bytes, &doc.content_type)
            .await?;
        let url = if self.presign {
            match self.storage.retrieval_url(&location, self.url_ttl).await {
                Ok(url) => url,
                Err(e) => {
                    self.remove(&location).await;
                    return Err(e.into());
                }
            }
        } else {
            self.storage.public_url(&location)
        };

        tracing::info!(%location, kind = %doc.kind, bytes = size, "document stored");
        Ok(UploadReceipt {
            bucket: location.bucket,
            key: location.key,
            url,
            kind: doc.kind,
            content_type: doc.content_type,
            bytes: size,
        })
    }

    /// Delete a stored document that will not be attached to any run.
    pub async fn discard(&self, receipt: &UploadReceipt) {
        self.remove(&ObjectLocation::new(&receipt.bucket, &receipt.key))
            .await;
    }

    async fn remove(&self, location: &ObjectLocation) {
        match self.storage.delete(location).await {
            Ok(()) => tracing::info!(%location, "unattached document removed"),
            Err(e) => tracing::warn!(%location, error = %e, "failed to remove unattached document"),
        }
    }
}

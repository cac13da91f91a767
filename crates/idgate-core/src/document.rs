//! Validation and key layout for uploaded identity documents.

use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use thiserror::Error;

/// Largest accepted document image.
pub const MAX_DOCUMENT_BYTES: usize = 12 * 1024 * 1024;

pub const ALLOWED_CONTENT_TYPES: &[&str] = &["image/jpeg", "image/png", "image/webp"];

pub const DEFAULT_DOCUMENT_KIND: &str = "national_id";
pub const DEFAULT_USER_ID: &str = "anon";

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ValidationError {
    #[error("missing file")]
    MissingFile,
    #[error("unsupported type: {0}")]
    UnsupportedType(String),
    #[error("file too large: {size} bytes (max {max})")]
    TooLarge { size: usize, max: usize },
    #[error("declared {declared} but content looks like {detected}")]
    ContentMismatch { declared: String, detected: String },
}

/// A document as submitted by the capture screen.
#[derive(Debug, Clone)]
pub struct DocumentUpload {
    pub bytes: Vec<u8>,
    pub content_type: String,
    pub kind: Option<String>,
    pub user_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedDocument {
    pub bytes: Vec<u8>,
    pub content_type: String,
    pub kind: String,
    pub user_id: String,
}

impl ValidatedDocument {
    pub fn extension(&self) -> &'static str {
        extension_for(&self.content_type)
    }
}

/// Check type, size and magic bytes; fill in default kind and user.
pub fn validate(upload: DocumentUpload) -> Result<ValidatedDocument, ValidationError> {
    if upload.bytes.is_empty() {
        return Err(ValidationError::MissingFile);
    }

    let content_type = upload.content_type.trim().to_ascii_lowercase();
    if !ALLOWED_CONTENT_TYPES.contains(&content_type.as_str()) {
        return Err(ValidationError::UnsupportedType(upload.content_type));
    }

    if upload.bytes.len() > MAX_DOCUMENT_BYTES {
        return Err(ValidationError::TooLarge {
            size: upload.bytes.len(),
            max: MAX_DOCUMENT_BYTES,
        });
    }

    let detected = image::guess_format(&upload.bytes)
        .map(|f| f.to_mime_type().to_string())
        .unwrap_or_else(|_| "unknown".to_string());
    if detected != content_type {
        return Err(ValidationError::ContentMismatch {
            declared: content_type,
            detected,
        });
    }

    Ok(ValidatedDocument {
        bytes: upload.bytes,
        content_type,
        kind: non_empty_or(upload.kind, DEFAULT_DOCUMENT_KIND),
        user_id: non_empty_or(upload.user_id, DEFAULT_USER_ID),
    })
}

/// Capture guide aspect for a document kind. Passports use the ID-3 data
/// page, everything else is card sized.
pub fn guide_aspect(kind: &str) -> f32 {
    match kind {
        "passport" => crate::frame::ID3_ASPECT,
        _ => crate::frame::ID1_ASPECT,
    }
}

pub fn extension_for(content_type: &str) -> &'static str {
    match content_type {
        "image/png" => ".png",
        "image/webp" => ".webp",
        _ => ".jpg",
    }
}

/// `<prefix><user>/<kind>/<millis>-<uuid><ext>`, with user and kind
/// percent-encoded so neither can introduce extra path segments.
pub fn object_key(prefix: &str, doc: &ValidatedDocument, millis: i64, id: uuid::Uuid) -> String {
    format!(
        "{prefix}{}/{}/{millis}-{id}{}",
        encode_component(&doc.user_id),
        encode_component(&doc.kind),
        doc.extension()
    )
}

fn non_empty_or(value: Option<String>, default: &str) -> String {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_string())
}

/// Same unreserved set as ECMAScript `encodeURIComponent`.
const COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'!')
    .remove(b'~')
    .remove(b'*')
    .remove(b'\'')
    .remove(b'(')
    .remove(b')');

fn encode_component(s: &str) -> String {
    utf8_percent_encode(s, COMPONENT).to_string()
}

//! Local media records.

use crate::error::{ValidationError, ValidationReason};
use crate::sanitize::document_id;
use crate::value::Value;

/// Upload state of a media record, mirrored in the local `status` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaStatus {
    /// Captured locally, upload not started.
    Pending,
    /// Binary transfer in progress.
    Uploading,
    /// Binary and metadata are on the remote store.
    Synced,
    /// The last upload attempt failed.
    Error,
}

impl MediaStatus {
    /// Stored string form.
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaStatus::Pending => "pending",
            MediaStatus::Uploading => "uploading",
            MediaStatus::Synced => "synced",
            MediaStatus::Error => "error",
        }
    }

    /// Parses the stored string form.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(MediaStatus::Pending),
            "uploading" => Some(MediaStatus::Uploading),
            "synced" => Some(MediaStatus::Synced),
            "error" => Some(MediaStatus::Error),
            _ => None,
        }
    }
}

/// Fields that only make sense on the capturing device.
const LOCAL_ONLY_FIELDS: &[&str] = &["localUri", "status", "lastError"];

/// Typed view of a local media document.
///
/// Local documents carry `localUri` (where the captured file lives) and
/// `status`; neither is transmitted.
#[derive(Debug, Clone, PartialEq)]
pub struct MediaRecord {
    /// Media id.
    pub id: String,
    /// Owning job id.
    pub job_id: String,
    /// Location of the captured file on this device.
    pub local_uri: String,
    /// MIME type, if known.
    pub content_type: Option<String>,
    /// Upload state.
    pub status: MediaStatus,
    /// Full local document.
    pub doc: Value,
}

impl MediaRecord {
    /// Reads a media record from its local document.
    pub fn from_value(doc: &Value, path: &str) -> Result<Self, ValidationError> {
        let id = document_id(doc, "id", path)?;
        let job_id = document_id(doc, "jobId", path)?;
        let local_uri = match doc.get("localUri") {
            Some(Value::Text(s)) if !s.trim().is_empty() => s.trim().to_string(),
            Some(Value::Text(_)) => {
                return Err(ValidationError::new("localUri", path, ValidationReason::Empty))
            }
            _ => return Err(ValidationError::missing("localUri", path)),
        };
        let content_type = doc
            .get("contentType")
            .and_then(Value::as_str)
            .map(str::to_string);
        let status = doc
            .get("status")
            .and_then(Value::as_str)
            .and_then(MediaStatus::parse)
            .unwrap_or(MediaStatus::Pending);

        Ok(Self {
            id,
            job_id,
            local_uri,
            content_type,
            status,
            doc: doc.clone(),
        })
    }

    /// Path of the binary object on the remote store.
    pub fn storage_path(&self) -> String {
        format!("media/{}/{}", self.job_id, self.id)
    }

    /// Remote metadata document referencing the uploaded object.
    pub fn metadata(&self, url: &str, uploaded_at: i64) -> Value {
        let mut meta = self.doc.clone();
        for field in LOCAL_ONLY_FIELDS {
            meta.remove(field);
        }
        meta.with("id", self.id.as_str())
            .with("storagePath", self.storage_path())
            .with("url", url)
            .with("uploadedAt", uploaded_at)
            .with("updatedAt", uploaded_at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local_doc() -> Value {
        Value::object()
            .with("id", "m-1")
            .with("jobId", 12)
            .with("localUri", "/tmp/photo.jpg")
            .with("contentType", "image/jpeg")
            .with("caption", "Before")
            .with("status", "pending")
    }

    #[test]
    fn reads_local_document() {
        let media = MediaRecord::from_value(&local_doc(), "media/m-1").unwrap();
        assert_eq!(media.id, "m-1");
        assert_eq!(media.job_id, "12");
        assert_eq!(media.status, MediaStatus::Pending);
        assert_eq!(media.storage_path(), "media/12/m-1");
    }

    #[test]
    fn missing_local_uri_is_a_validation_error() {
        let mut doc = local_doc();
        doc.remove("localUri");
        let err = MediaRecord::from_value(&doc, "media/m-1").unwrap_err();
        assert_eq!(err.field, "localUri");
    }

    #[test]
    fn metadata_drops_local_fields() {
        let media = MediaRecord::from_value(&local_doc(), "media/m-1").unwrap();
        let meta = media.metadata("mem://media/12/m-1", 500);

        assert!(meta.get("localUri").is_none());
        assert!(meta.get("status").is_none());
        assert_eq!(meta.get("caption").and_then(Value::as_str), Some("Before"));
        assert_eq!(meta.get("url").and_then(Value::as_str), Some("mem://media/12/m-1"));
        assert_eq!(meta.get("updatedAt").and_then(Value::as_i64), Some(500));
    }

    #[test]
    fn status_strings() {
        for status in [
            MediaStatus::Pending,
            MediaStatus::Uploading,
            MediaStatus::Synced,
            MediaStatus::Error,
        ] {
            assert_eq!(MediaStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(MediaStatus::parse("done"), None);
    }
}

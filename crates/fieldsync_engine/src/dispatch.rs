//! Applies pending operations to the remote store.

use crate::auth::Authorizer;
use crate::clock::Clock;
use crate::error::{SyncError, SyncResult};
use crate::remote::RemoteStore;
use fieldsync_protocol::{
    collections, document_id, next_logical_time, sanitize_record, updated_at, DocumentPath,
    MediaRecord, MediaStatus, Mutation, PendingOperation, RecordSchema, RemoteWrite, Requirement,
    SanitizationReport, ValidationError, Value, WriteKind, UPDATED_AT,
};
use fieldsync_store::{LocalStore, LocalStoreExt};
use std::sync::Arc;
use tracing::{debug, warn};

const OCTET_STREAM: &str = "application/octet-stream";
const REACTIONS: &str = "reactions";

/// Turns a pending operation into exactly one remote write.
///
/// Every apply ensures authorization and sanitizes the payload again before
/// touching the network. Media uploads transfer the binary first and only
/// then write the metadata document that references it.
pub struct Dispatcher {
    remote: Arc<dyn RemoteStore>,
    authorizer: Arc<dyn Authorizer>,
    store: Arc<dyn LocalStore>,
    clock: Arc<dyn Clock>,
}

impl Dispatcher {
    /// Creates a dispatcher.
    pub fn new(
        remote: Arc<dyn RemoteStore>,
        authorizer: Arc<dyn Authorizer>,
        store: Arc<dyn LocalStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            remote,
            authorizer,
            store,
            clock,
        }
    }

    /// Applies one operation.
    ///
    /// Returns what sanitizing the stored payload again changed, which is
    /// normally nothing.
    ///
    /// # Errors
    ///
    /// Validation errors mean the payload can never be applied as is. Any
    /// other error leaves the remote store without a partial write.
    pub async fn apply(&self, op: &PendingOperation) -> SyncResult<SanitizationReport> {
        self.authorizer.ensure_authorized().await?;
        let (mutation, report) = op.mutation.sanitize()?;
        debug!(op_id = %op.id, kind = mutation.kind(), attempt = op.attempt, "applying");

        match mutation {
            Mutation::JobAdd { job } => {
                let id = document_id(&job, "id", collections::JOBS)?;
                self.commit(op, DocumentPath::job(&id), WriteKind::Set(job), None)
                    .await?;
            }
            Mutation::JobUpdate { job } => {
                let id = document_id(&job, "id", collections::JOBS)?;
                self.commit(op, DocumentPath::job(&id), WriteKind::Merge(job), None)
                    .await?;
            }
            Mutation::JobDelete { job_id } => {
                self.commit(op, DocumentPath::job(&job_id), WriteKind::Delete, None)
                    .await?;
            }
            Mutation::PolicyUpdate { policy } => {
                self.commit(op, DocumentPath::policy(), WriteKind::Set(policy), None)
                    .await?;
            }
            Mutation::KudosReact {
                kudos_id,
                emoji,
                by,
            } => {
                let kind = WriteKind::Increment {
                    field: vec![REACTIONS.to_string(), emoji],
                    amount: 1,
                };
                self.commit(op, DocumentPath::kudos(&kudos_id), kind, Some(by))
                    .await?;
            }
            Mutation::UserUpdate { user_id, changes } => {
                self.commit(op, DocumentPath::user(&user_id), WriteKind::Merge(changes), None)
                    .await?;
            }
            Mutation::Custom { payload } => {
                self.commit(op, DocumentPath::custom(op.id.as_str()), WriteKind::Set(payload), None)
                    .await?;
            }
            Mutation::MediaUpload { media_id } => self.upload_media(op, &media_id).await?,
        }
        Ok(report)
    }

    async fn commit(
        &self,
        op: &PendingOperation,
        path: DocumentPath,
        kind: WriteKind,
        actor: Option<String>,
    ) -> SyncResult<()> {
        let mut write = RemoteWrite::new(op.id.clone(), path, kind);
        if let Some(actor) = actor {
            write = write.with_actor(actor);
        }
        self.remote.commit(write).await
    }

    async fn upload_media(&self, op: &PendingOperation, media_id: &str) -> SyncResult<()> {
        let record = self.load_media(media_id)?;
        self.write_media_status(&record, MediaStatus::Uploading, None, None)?;

        match self.transfer(op, &record).await {
            Ok((url, uploaded_at)) => {
                self.write_media_status(&record, MediaStatus::Synced, Some(&url), Some(uploaded_at))?;
                debug!(media_id, url = %url, "media synced");
                Ok(())
            }
            Err(err) => {
                let message = err.to_string();
                if let Err(status_err) =
                    self.write_media_status(&record, MediaStatus::Error, Some(&message), None)
                {
                    warn!(media_id, error = %status_err, "could not record media failure");
                }
                Err(err)
            }
        }
    }

    fn load_media(&self, media_id: &str) -> SyncResult<MediaRecord> {
        let path = format!("{}/{media_id}", collections::MEDIA);
        let doc = self
            .store
            .get(collections::MEDIA, media_id)?
            .ok_or_else(|| ValidationError::missing("mediaId", path.as_str()))?;
        Ok(MediaRecord::from_value(&doc, &path)?)
    }

    /// Uploads the binary, then writes the metadata document. Returns the
    /// download URL and the upload time.
    async fn transfer(&self, op: &PendingOperation, record: &MediaRecord) -> SyncResult<(String, i64)> {
        let bytes = tokio::fs::read(&record.local_uri)
            .await
            .map_err(|e| SyncError::Upload(format!("cannot read {}: {e}", record.local_uri)))?;
        let content_type = record.content_type.as_deref().unwrap_or(OCTET_STREAM);
        let url = self
            .remote
            .upload_blob(&record.storage_path(), bytes, content_type)
            .await?;

        let uploaded_at = self.clock.now_ms();
        let path = DocumentPath::media(&record.job_id, &record.id);
        let metadata = sanitize_record(
            &record.metadata(&url, uploaded_at),
            &RecordSchema::MEDIA,
            Requirement::Full,
            path.as_str(),
        )?;
        self.commit(op, path, WriteKind::Set(metadata.cleaned), None)
            .await?;
        Ok((url, uploaded_at))
    }

    /// Rewrites the local media document with a new status.
    ///
    /// Starts from the document read before the upload so device-only fields
    /// survive an echo of the metadata merging in first. `floor` keeps the
    /// local stamp ahead of the metadata written remotely.
    fn write_media_status(
        &self,
        record: &MediaRecord,
        status: MediaStatus,
        detail: Option<&str>,
        floor: Option<i64>,
    ) -> SyncResult<()> {
        let now = self.clock.now_ms();
        self.store.transaction(|txn| {
            let current = txn.get(collections::MEDIA, &record.id);
            let previous = current
                .as_ref()
                .and_then(updated_at)
                .into_iter()
                .chain(updated_at(&record.doc))
                .chain(floor)
                .max();

            let mut doc = record.doc.clone();
            doc.insert("status", status.as_str());
            match (status, detail) {
                (MediaStatus::Synced, Some(url)) => {
                    doc.insert("remoteUrl", url);
                    doc.remove("lastError");
                }
                (MediaStatus::Error, Some(message)) => {
                    doc.insert("lastError", message);
                }
                _ => {}
            }
            doc.insert(UPDATED_AT, next_logical_time(previous, now));
            txn.put(collections::MEDIA, &record.id, doc);
            Ok::<_, SyncError>(())
        })
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher").finish_non_exhaustive()
    }
}

/// Reads a local media document's status.
pub fn media_status(doc: &Value) -> Option<MediaStatus> {
    doc.get("status").and_then(Value::as_str).and_then(MediaStatus::parse)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StaticAuthorizer;
    use crate::clock::ManualClock;
    use crate::remote::MemoryRemote;
    use fieldsync_protocol::OpId;
    use fieldsync_store::MemoryStore;
    use tempfile::TempDir;

    struct Fixture {
        dispatcher: Dispatcher,
        remote: Arc<MemoryRemote>,
        store: Arc<MemoryStore>,
        authorizer: Arc<StaticAuthorizer>,
        dir: TempDir,
    }

    fn fixture() -> Fixture {
        let remote = Arc::new(MemoryRemote::new());
        let store = Arc::new(MemoryStore::new());
        let authorizer = Arc::new(StaticAuthorizer::allow());
        let dispatcher = Dispatcher::new(
            remote.clone(),
            authorizer.clone(),
            store.clone(),
            Arc::new(ManualClock::new(5_000)),
        );
        Fixture {
            dispatcher,
            remote,
            store,
            authorizer,
            dir: tempfile::tempdir().unwrap(),
        }
    }

    fn op(mutation: Mutation) -> PendingOperation {
        PendingOperation::new(OpId::new("op-1"), mutation, 1_000)
    }

    fn capture(f: &Fixture) {
        let file = f.dir.path().join("photo.jpg");
        std::fs::write(&file, b"jpeg bytes").unwrap();
        let doc = Value::object()
            .with("id", "m1")
            .with("jobId", 12)
            .with("localUri", file.to_string_lossy().into_owned())
            .with("contentType", "image/jpeg")
            .with("caption", "Before")
            .with("status", "pending")
            .with(UPDATED_AT, 4_000);
        f.store.put(collections::MEDIA, "m1", doc).unwrap();
    }

    #[tokio::test]
    async fn job_add_sets_document() {
        let f = fixture();
        let job = Value::object()
            .with("id", "12")
            .with("date", "2025-11-28")
            .with("crew", Value::Array(vec!["ana".into()]))
            .with("client", " Harbor Dental ")
            .with("scope", "Windows");
        let report = f
            .dispatcher
            .apply(&op(Mutation::JobAdd { job }))
            .await
            .unwrap();

        let doc = f.remote.document("jobs/12").unwrap();
        assert_eq!(doc.get("client").and_then(Value::as_str), Some("Harbor Dental"));
        assert_eq!(report.string_corrections, vec!["jobs/12.client"]);
    }

    #[tokio::test]
    async fn kudos_reaction_increments_with_actor() {
        let f = fixture();
        f.dispatcher
            .apply(&op(Mutation::KudosReact {
                kudos_id: "k1".into(),
                emoji: "tada".into(),
                by: "u7".into(),
            }))
            .await
            .unwrap();

        let writes = f.remote.writes();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].actor.as_deref(), Some("u7"));
        assert_eq!(writes[0].path.as_str(), "kudos/k1");
    }

    #[tokio::test]
    async fn reaction_keys_with_dots_stay_one_field() {
        let f = fixture();
        f.dispatcher
            .apply(&op(Mutation::KudosReact {
                kudos_id: "k1".into(),
                emoji: "thumbs.up".into(),
                by: "u7".into(),
            }))
            .await
            .unwrap();

        let doc = f.remote.document("kudos/k1").unwrap();
        let reactions = doc.get("reactions").unwrap();
        assert_eq!(reactions.get("thumbs.up").and_then(Value::as_i64), Some(1));
        assert!(reactions.get("thumbs").is_none());
    }

    #[tokio::test]
    async fn media_upload_writes_blob_then_metadata() {
        let f = fixture();
        capture(&f);
        f.dispatcher
            .apply(&op(Mutation::MediaUpload { media_id: "m1".into() }))
            .await
            .unwrap();

        assert_eq!(f.remote.blob("media/12/m1").unwrap().bytes, b"jpeg bytes");
        let meta = f.remote.document("jobs/12/media/m1").unwrap();
        assert_eq!(meta.get("url").and_then(Value::as_str), Some("mem://media/12/m1"));
        assert!(meta.get("localUri").is_none());
        assert!(meta.get("status").is_none());

        let local = f.store.get(collections::MEDIA, "m1").unwrap().unwrap();
        assert_eq!(media_status(&local), Some(MediaStatus::Synced));
        assert_eq!(local.get("remoteUrl").and_then(Value::as_str), Some("mem://media/12/m1"));
        assert!(updated_at(&local).unwrap() > updated_at(&meta).unwrap());
    }

    #[tokio::test]
    async fn failed_transfer_leaves_error_status_and_no_metadata() {
        let f = fixture();
        capture(&f);
        f.remote.fail_next_uploads(1);

        let err = f
            .dispatcher
            .apply(&op(Mutation::MediaUpload { media_id: "m1".into() }))
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert!(f.remote.document("jobs/12/media/m1").is_none());

        let local = f.store.get(collections::MEDIA, "m1").unwrap().unwrap();
        assert_eq!(media_status(&local), Some(MediaStatus::Error));
        assert!(local
            .get("lastError")
            .and_then(Value::as_str)
            .unwrap()
            .starts_with("upload failed"));
    }

    #[tokio::test]
    async fn missing_media_record_is_a_validation_error() {
        let f = fixture();
        let err = f
            .dispatcher
            .apply(&op(Mutation::MediaUpload { media_id: "gone".into() }))
            .await
            .unwrap_err();
        assert!(err.is_validation());
        assert!(err.to_string().contains("mediaId"));
        assert_eq!(f.remote.call_count(), 0);
    }

    #[tokio::test]
    async fn unauthorized_apply_never_reaches_remote() {
        let f = fixture();
        f.authorizer.set_denied("session expired");
        let err = f
            .dispatcher
            .apply(&op(Mutation::JobDelete { job_id: "12".into() }))
            .await
            .unwrap_err();
        assert!(err.is_structural());
        assert!(err.to_string().starts_with("authorization required"));
        assert_eq!(f.remote.call_count(), 0);
    }
}

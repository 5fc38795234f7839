//! Remote store layout, writes and change batches.

use crate::operation::OpId;
use crate::value::Value;
use std::fmt;

/// Collection names shared by the remote store and the local tables.
pub mod collections {
    /// Top-level job documents keyed by job id.
    pub const JOBS: &str = "jobs";
    /// Holds the policy singleton.
    pub const POLICY: &str = "policy";
    /// Kudos documents.
    pub const KUDOS: &str = "kudos";
    /// User profiles.
    pub const USERS: &str = "users";
    /// Media metadata (a subcollection of each job remotely).
    pub const MEDIA: &str = "media";
    /// Generic custom payloads.
    pub const CUSTOM: &str = "custom";

    /// Id of the policy singleton document.
    pub const POLICY_ID: &str = "current";

    /// Collections a client listens to by default.
    pub const REPLICATED: &[&str] = &[JOBS, POLICY, KUDOS, USERS, MEDIA];
}

/// Slash-separated path of a remote document.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DocumentPath(String);

impl DocumentPath {
    /// Creates a path from raw segments.
    pub fn new(path: impl Into<String>) -> Self {
        Self(path.into())
    }

    /// `jobs/{id}`.
    pub fn job(id: &str) -> Self {
        Self(format!("{}/{id}", collections::JOBS))
    }

    /// The policy singleton.
    pub fn policy() -> Self {
        Self(format!("{}/{}", collections::POLICY, collections::POLICY_ID))
    }

    /// `kudos/{id}`.
    pub fn kudos(id: &str) -> Self {
        Self(format!("{}/{id}", collections::KUDOS))
    }

    /// `users/{id}`.
    pub fn user(id: &str) -> Self {
        Self(format!("{}/{id}", collections::USERS))
    }

    /// `jobs/{job_id}/media/{media_id}`.
    pub fn media(job_id: &str, media_id: &str) -> Self {
        Self(format!(
            "{}/{job_id}/{}/{media_id}",
            collections::JOBS,
            collections::MEDIA
        ))
    }

    /// `custom/{id}`.
    pub fn custom(id: &str) -> Self {
        Self(format!("{}/{id}", collections::CUSTOM))
    }

    /// Returns the path as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Name of the collection holding the document (the second-to-last segment).
    pub fn collection(&self) -> &str {
        let mut segments = self.0.rsplit('/');
        segments.next();
        segments.next().unwrap_or("")
    }

    /// Document id (the last segment).
    pub fn id(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or("")
    }
}

impl fmt::Display for DocumentPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The effect of a single remote write.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteKind {
    /// Replace the whole document.
    Set(Value),
    /// Overwrite the given top-level fields, creating the document if needed.
    Merge(Value),
    /// Delete the document.
    Delete,
    /// Add `amount` to a numeric field, creating parent objects as needed.
    Increment {
        /// Field path, one segment per nesting level. Segments are taken
        /// verbatim, so a key may contain `.`.
        field: Vec<String>,
        /// Amount to add.
        amount: i64,
    },
}

impl WriteKind {
    /// Short name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            WriteKind::Set(_) => "set",
            WriteKind::Merge(_) => "merge",
            WriteKind::Delete => "delete",
            WriteKind::Increment { .. } => "increment",
        }
    }
}

/// One atomic remote write, tagged with the operation that produced it.
///
/// The tag lets the remote store recognise a replayed write after a client
/// crashed between the write and deleting its pending operation.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteWrite {
    /// Producing operation.
    pub op_id: OpId,
    /// Target document.
    pub path: DocumentPath,
    /// What to do.
    pub kind: WriteKind,
    /// User on whose behalf the write is made, when known.
    pub actor: Option<String>,
}

impl RemoteWrite {
    /// Creates a write.
    pub fn new(op_id: OpId, path: DocumentPath, kind: WriteKind) -> Self {
        Self {
            op_id,
            path,
            kind,
            actor: None,
        }
    }

    /// Sets the acting user.
    #[must_use]
    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }
}

/// A change to one document in a subscribed collection.
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteChange {
    /// The document was created or modified; carries the full document.
    Upsert {
        /// Document id.
        id: String,
        /// Full document.
        doc: Value,
    },
    /// The document was deleted.
    Removed {
        /// Document id.
        id: String,
    },
}

impl RemoteChange {
    /// Id of the changed document.
    pub fn id(&self) -> &str {
        match self {
            RemoteChange::Upsert { id, .. } | RemoteChange::Removed { id } => id,
        }
    }
}

/// A batch of changes delivered by a collection subscription.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeBatch {
    /// Collection the changes belong to.
    pub collection: String,
    /// Changes in delivery order.
    pub changes: Vec<RemoteChange>,
}

impl ChangeBatch {
    /// Creates a batch.
    pub fn new(collection: impl Into<String>, changes: Vec<RemoteChange>) -> Self {
        Self {
            collection: collection.into(),
            changes,
        }
    }

    /// Number of changes.
    pub fn len(&self) -> usize {
        self.changes.len()
    }

    /// Returns true if the batch carries no changes.
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn document_paths() {
        assert_eq!(DocumentPath::job("12").as_str(), "jobs/12");
        assert_eq!(DocumentPath::policy().as_str(), "policy/current");

        let media = DocumentPath::media("12", "m-1");
        assert_eq!(media.as_str(), "jobs/12/media/m-1");
        assert_eq!(media.collection(), "media");
        assert_eq!(media.id(), "m-1");

        let user = DocumentPath::user("u-9");
        assert_eq!(user.collection(), "users");
        assert_eq!(user.id(), "u-9");
    }

    #[test]
    fn write_builder() {
        let write = RemoteWrite::new(
            OpId::new("op-1"),
            DocumentPath::kudos("k1"),
            WriteKind::Increment {
                field: vec!["reactions".into(), "tada".into()],
                amount: 1,
            },
        )
        .with_actor("u-1");

        assert_eq!(write.kind.name(), "increment");
        assert_eq!(write.actor.as_deref(), Some("u-1"));
    }

    #[test]
    fn change_ids() {
        let batch = ChangeBatch::new(
            "jobs",
            vec![
                RemoteChange::Upsert {
                    id: "1".into(),
                    doc: Value::object(),
                },
                RemoteChange::Removed { id: "2".into() },
            ],
        );
        let ids: Vec<_> = batch.changes.iter().map(RemoteChange::id).collect();
        assert_eq!(ids, vec!["1", "2"]);
        assert_eq!(batch.len(), 2);
    }
}

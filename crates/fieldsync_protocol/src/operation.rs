//! Queued mutations and the durable outbox record.

use crate::change::{collections, DocumentPath};
use crate::error::{ProtocolError, ProtocolResult, ValidationError, ValidationReason};
use crate::sanitize::{
    document_id, sanitize, sanitize_record, RecordSchema, Requirement, SanitizationReport,
};
use crate::value::Value;
use std::fmt;

/// Opaque identifier of a pending operation.
///
/// Every remote write carries the id of the operation that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OpId(String);

impl OpId {
    /// Wraps an existing id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generates a fresh random id.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Returns the id as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A mutation a client can queue for the remote store.
///
/// This is a closed set: the dispatcher matches on it exhaustively.
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    /// Create a job.
    JobAdd {
        /// Full job document.
        job: Value,
    },
    /// Overwrite some fields of a job.
    JobUpdate {
        /// Partial job document; must carry `id`.
        job: Value,
    },
    /// Delete a job.
    JobDelete {
        /// Job id.
        job_id: String,
    },
    /// Replace the policy singleton.
    PolicyUpdate {
        /// Policy document.
        policy: Value,
    },
    /// Add a reaction to a kudos document.
    KudosReact {
        /// Kudos document id.
        kudos_id: String,
        /// Reaction key.
        emoji: String,
        /// Reacting user.
        by: String,
    },
    /// Upload a locally captured media file and publish its metadata.
    MediaUpload {
        /// Local media record id.
        media_id: String,
    },
    /// Overwrite some fields of a user profile.
    UserUpdate {
        /// User id.
        user_id: String,
        /// Fields to overwrite.
        changes: Value,
    },
    /// Free-form payload written to the `custom` collection.
    Custom {
        /// Payload document.
        payload: Value,
    },
}

impl Mutation {
    /// Type tag stored with the operation.
    pub fn kind(&self) -> &'static str {
        match self {
            Mutation::JobAdd { .. } => "job.add",
            Mutation::JobUpdate { .. } => "job.update",
            Mutation::JobDelete { .. } => "job.delete",
            Mutation::PolicyUpdate { .. } => "policy.update",
            Mutation::KudosReact { .. } => "kudos.react",
            Mutation::MediaUpload { .. } => "media.upload",
            Mutation::UserUpdate { .. } => "user.update",
            Mutation::Custom { .. } => "custom",
        }
    }

    /// The remote document this mutation writes, if it can be resolved.
    ///
    /// Operations sharing a target must reach the remote store in the order
    /// they were queued. `Custom` payloads each get a document of their own,
    /// and an invalid payload has no target.
    pub fn target(&self) -> Option<DocumentPath> {
        let (mutation, _) = self.sanitize().ok()?;
        match mutation {
            Mutation::JobAdd { job } | Mutation::JobUpdate { job } => {
                let id = document_id(&job, "id", collections::JOBS).ok()?;
                Some(DocumentPath::job(&id))
            }
            Mutation::JobDelete { job_id } => Some(DocumentPath::job(&job_id)),
            Mutation::PolicyUpdate { .. } => Some(DocumentPath::policy()),
            Mutation::KudosReact { kudos_id, .. } => Some(DocumentPath::kudos(&kudos_id)),
            Mutation::MediaUpload { media_id } => Some(DocumentPath::new(format!(
                "{}/{media_id}",
                collections::MEDIA
            ))),
            Mutation::UserUpdate { user_id, .. } => Some(DocumentPath::user(&user_id)),
            Mutation::Custom { .. } => None,
        }
    }

    /// Returns the transmittable form of this mutation.
    ///
    /// Fails with the first offending field if the payload is not valid for
    /// its kind. Running this on already sanitized output yields the same
    /// mutation and an empty report.
    pub fn sanitize(&self) -> Result<(Mutation, SanitizationReport), ValidationError> {
        match self {
            Mutation::JobAdd { job } => {
                let path = job_path(job)?;
                let out = sanitize_record(job, &RecordSchema::JOB, Requirement::Full, &path)?;
                Ok((Mutation::JobAdd { job: out.cleaned }, out.report))
            }
            Mutation::JobUpdate { job } => {
                let path = job_path(job)?;
                let out = sanitize_record(job, &RecordSchema::JOB, Requirement::Partial, &path)?;
                Ok((Mutation::JobUpdate { job: out.cleaned }, out.report))
            }
            Mutation::JobDelete { job_id } => {
                let doc = Value::object().with("jobId", job_id.as_str());
                let job_id = numeric_id(&doc, "jobId", collections::JOBS)?;
                Ok((Mutation::JobDelete { job_id }, SanitizationReport::default()))
            }
            Mutation::PolicyUpdate { policy } => {
                let path = format!("{}/{}", collections::POLICY, collections::POLICY_ID);
                let out =
                    sanitize_record(policy, &RecordSchema::POLICY, Requirement::Full, &path)?;
                Ok((Mutation::PolicyUpdate { policy: out.cleaned }, out.report))
            }
            Mutation::KudosReact {
                kudos_id,
                emoji,
                by,
            } => {
                let kudos_id = required_text(kudos_id, "kudosId", collections::KUDOS)?;
                let path = format!("{}/{kudos_id}", collections::KUDOS);
                Ok((
                    Mutation::KudosReact {
                        emoji: required_text(emoji, "emoji", &path)?,
                        by: required_text(by, "by", &path)?,
                        kudos_id,
                    },
                    SanitizationReport::default(),
                ))
            }
            Mutation::MediaUpload { media_id } => Ok((
                Mutation::MediaUpload {
                    media_id: required_text(media_id, "mediaId", collections::MEDIA)?,
                },
                SanitizationReport::default(),
            )),
            Mutation::UserUpdate { user_id, changes } => {
                let user_id = required_text(user_id, "userId", collections::USERS)?;
                let path = format!("{}/{user_id}", collections::USERS);
                let out = sanitize_record(changes, &RecordSchema::ANY, Requirement::Partial, &path)?;
                Ok((
                    Mutation::UserUpdate {
                        user_id,
                        changes: out.cleaned,
                    },
                    out.report,
                ))
            }
            Mutation::Custom { payload } => {
                let out = sanitize(payload, collections::CUSTOM);
                Ok((Mutation::Custom { payload: out.cleaned }, out.report))
            }
        }
    }

    /// Encodes as `{type, payload}`.
    pub fn to_value(&self) -> Value {
        let payload = match self {
            Mutation::JobAdd { job } | Mutation::JobUpdate { job } => {
                Value::object().with("job", job.clone())
            }
            Mutation::JobDelete { job_id } => Value::object().with("jobId", job_id.as_str()),
            Mutation::PolicyUpdate { policy } => Value::object().with("policy", policy.clone()),
            Mutation::KudosReact {
                kudos_id,
                emoji,
                by,
            } => Value::object()
                .with("kudosId", kudos_id.as_str())
                .with("emoji", emoji.as_str())
                .with("by", by.as_str()),
            Mutation::MediaUpload { media_id } => {
                Value::object().with("mediaId", media_id.as_str())
            }
            Mutation::UserUpdate { user_id, changes } => Value::object()
                .with("userId", user_id.as_str())
                .with("changes", changes.clone()),
            Mutation::Custom { payload } => Value::object().with("payload", payload.clone()),
        };
        Value::object().with("type", self.kind()).with("payload", payload)
    }

    /// Decodes the `{type, payload}` form.
    pub fn from_value(value: &Value) -> ProtocolResult<Self> {
        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| ProtocolError::invalid_structure("missing mutation type"))?;
        let payload = value
            .get("payload")
            .ok_or_else(|| ProtocolError::invalid_structure("missing mutation payload"))?;

        let get_doc = |name: &str| {
            payload
                .get(name)
                .cloned()
                .ok_or_else(|| ProtocolError::invalid_structure(format!("missing {name}")))
        };
        let get_text = |name: &str| {
            payload
                .get(name)
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| ProtocolError::invalid_structure(format!("missing {name}")))
        };

        let mutation = match kind {
            "job.add" => Mutation::JobAdd {
                job: get_doc("job")?,
            },
            "job.update" => Mutation::JobUpdate {
                job: get_doc("job")?,
            },
            "job.delete" => Mutation::JobDelete {
                job_id: get_text("jobId")?,
            },
            "policy.update" => Mutation::PolicyUpdate {
                policy: get_doc("policy")?,
            },
            "kudos.react" => Mutation::KudosReact {
                kudos_id: get_text("kudosId")?,
                emoji: get_text("emoji")?,
                by: get_text("by")?,
            },
            "media.upload" => Mutation::MediaUpload {
                media_id: get_text("mediaId")?,
            },
            "user.update" => Mutation::UserUpdate {
                user_id: get_text("userId")?,
                changes: get_doc("changes")?,
            },
            "custom" => Mutation::Custom {
                payload: get_doc("payload")?,
            },
            other => return Err(ProtocolError::UnknownMutation(other.to_string())),
        };
        Ok(mutation)
    }
}

fn job_path(job: &Value) -> Result<String, ValidationError> {
    if job.as_object().is_none() {
        return Err(ValidationError::new(
            RecordSchema::JOB.name,
            collections::JOBS,
            ValidationReason::WrongType,
        ));
    }
    let id = numeric_id(job, "id", collections::JOBS)?;
    Ok(format!("{}/{id}", collections::JOBS))
}

fn numeric_id(doc: &Value, field: &str, path: &str) -> Result<String, ValidationError> {
    let id = document_id(doc, field, path)?;
    match id.parse::<f64>() {
        Ok(n) if n.is_finite() => Ok(id),
        _ => Err(ValidationError::new(field, path, ValidationReason::UnparseableId)),
    }
}

fn required_text(value: &str, field: &str, path: &str) -> Result<String, ValidationError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(ValidationError::new(field, path, ValidationReason::Empty));
    }
    Ok(trimmed.to_string())
}

/// A queued mutation awaiting its remote write.
///
/// Stored in the outbox table keyed by `id`. `attempt` only grows, and
/// `next_attempt_at` never moves backwards for the same operation.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingOperation {
    /// Operation id.
    pub id: OpId,
    /// Sanitized mutation.
    pub mutation: Mutation,
    /// Failed apply attempts so far.
    pub attempt: u32,
    /// Earliest time (ms) the operation may be applied.
    pub next_attempt_at: i64,
    /// Enqueue time (ms).
    pub created_at: i64,
    /// Last modification time (ms).
    pub updated_at: i64,
    /// Reason the operation was parked for manual correction.
    pub parked: Option<String>,
    /// Message of the last failed attempt.
    pub last_error: Option<String>,
}

impl PendingOperation {
    /// Creates a fresh operation, due at `now`.
    pub fn new(id: OpId, mutation: Mutation, now: i64) -> Self {
        Self {
            id,
            mutation,
            attempt: 0,
            next_attempt_at: now,
            created_at: now,
            updated_at: now,
            parked: None,
            last_error: None,
        }
    }

    /// Returns true if the operation waits for manual correction.
    pub fn is_parked(&self) -> bool {
        self.parked.is_some()
    }

    /// Encodes the stored record.
    pub fn to_value(&self) -> Value {
        self.mutation
            .to_value()
            .with("id", self.id.as_str())
            .with("attempt", self.attempt)
            .with("nextAttemptAt", self.next_attempt_at)
            .with("createdAt", self.created_at)
            .with("updatedAt", self.updated_at)
            .with("parked", self.parked.clone())
            .with("lastError", self.last_error.clone())
    }

    /// Decodes a stored record.
    pub fn from_value(value: &Value) -> ProtocolResult<Self> {
        let get_time = |name: &str| {
            value
                .get(name)
                .and_then(Value::as_i64)
                .ok_or_else(|| ProtocolError::invalid_structure(format!("missing {name}")))
        };
        let get_note = |name: &str| value.get(name).and_then(Value::as_str).map(str::to_string);

        let id = value
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| ProtocolError::invalid_structure("missing id"))?;
        let attempt = u32::try_from(get_time("attempt")?)
            .map_err(|_| ProtocolError::invalid_structure("attempt out of range"))?;

        Ok(Self {
            id: OpId::new(id),
            mutation: Mutation::from_value(value)?,
            attempt,
            next_attempt_at: get_time("nextAttemptAt")?,
            created_at: get_time("createdAt")?,
            updated_at: get_time("updatedAt")?,
            parked: get_note("parked"),
            last_error: get_note("lastError"),
        })
    }
}

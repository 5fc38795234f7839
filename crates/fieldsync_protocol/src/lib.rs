//! # fieldsync protocol
//!
//! Pure types shared by every fieldsync crate.
//!
//! This crate provides:
//! - [`Value`], the dynamic document model (including `Undefined`, which the
//!   wire format cannot carry)
//! - The sanitizer/validator that turns arbitrary payloads into transmittable
//!   documents ([`sanitize`], [`sanitize_record`])
//! - [`Mutation`], the closed set of operations a client can queue, and
//!   [`PendingOperation`], the durable outbox record
//! - Remote write and change-stream types ([`RemoteWrite`], [`ChangeBatch`])
//! - The single last-write-wins rule ([`should_accept_incoming`])
//!
//! This is a pure crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod change;
mod conflict;
mod error;
mod media;
mod operation;
mod sanitize;
mod value;

pub use change::{collections, ChangeBatch, DocumentPath, RemoteChange, RemoteWrite, WriteKind};
pub use conflict::{
    merge_decision, next_logical_time, should_accept_incoming, updated_at, LogicalTime,
    MergeDecision, UPDATED_AT,
};
pub use error::{ProtocolError, ProtocolResult, ValidationError, ValidationReason};
pub use media::{MediaRecord, MediaStatus};
pub use operation::{Mutation, OpId, PendingOperation};
pub use sanitize::{
    document_id, sanitize, sanitize_record, validate, FieldRule, RecordSchema, Requirement,
    SanitizationReport, Sanitized,
};
pub use value::Value;

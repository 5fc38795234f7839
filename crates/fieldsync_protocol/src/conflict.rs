//! Last-write-wins conflict resolution.
//!
//! Every merge site goes through [`should_accept_incoming`]. The rule is:
//! the higher `updatedAt` wins and the remote store wins ties, since it is
//! authoritative for multi-client convergence. Documents are replaced
//! wholesale; no field-level merge is attempted.

use crate::value::Value;

/// Logical timestamp (milliseconds) used as the total order for merges.
pub type LogicalTime = i64;

/// Field holding an entity's logical timestamp.
pub const UPDATED_AT: &str = "updatedAt";

/// Outcome of comparing an incoming remote record with the local one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeDecision {
    /// No local record exists; the incoming record is inserted.
    Insert,
    /// The incoming record is at least as new; it replaces the local one.
    Replace,
    /// The local record is newer; the incoming record is discarded.
    Stale,
}

impl MergeDecision {
    /// Returns true if the incoming record should be written locally.
    pub fn accepts(&self) -> bool {
        !matches!(self, MergeDecision::Stale)
    }
}

/// Returns true if a remote record stamped `incoming` should replace a local
/// record stamped `local` (`None` when no local record exists).
pub fn should_accept_incoming<T: PartialOrd>(local: Option<T>, incoming: T) -> bool {
    match local {
        None => true,
        Some(local) => incoming >= local,
    }
}

/// Reads the logical timestamp of a document.
///
/// Accepts numbers and numeric strings; anything else reads as `None`.
/// Fractional stamps round down here; [`merge_decision`] compares them at
/// full precision.
pub fn updated_at(doc: &Value) -> Option<LogicalTime> {
    stamp(doc).map(|n| n.floor() as LogicalTime)
}

fn stamp(doc: &Value) -> Option<f64> {
    let n = match doc.get(UPDATED_AT)? {
        Value::Number(n) => *n,
        Value::Text(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    n.is_finite().then_some(n)
}

/// Decides how an incoming document merges with the local one.
///
/// A local record without a timestamp counts as time zero, as does an
/// incoming record without one.
pub fn merge_decision(local: Option<&Value>, incoming: &Value) -> MergeDecision {
    let Some(local) = local else {
        return MergeDecision::Insert;
    };
    let local_time = stamp(local).unwrap_or(0.0);
    let incoming_time = stamp(incoming).unwrap_or(0.0);

    if should_accept_incoming(Some(local_time), incoming_time) {
        MergeDecision::Replace
    } else {
        MergeDecision::Stale
    }
}

/// Next timestamp for a local write of an entity last stamped `previous`.
///
/// Never goes backwards, even if the wall clock does.
pub fn next_logical_time(previous: Option<LogicalTime>, now: LogicalTime) -> LogicalTime {
    match previous {
        Some(previous) if previous >= now => previous + 1,
        _ => now,
    }
}

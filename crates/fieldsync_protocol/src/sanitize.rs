//! Payload sanitization and validation.
//!
//! Every payload passes through here twice: once before it is queued and once
//! more right before it is written to the remote store. Both passes must agree,
//! so sanitization is pure and idempotent:
//!
//! - `Undefined` object fields are dropped, `Undefined` array slots become `null`
//! - non-finite numbers become `null`
//! - strings are trimmed
//!
//! Every change is recorded in a [`SanitizationReport`]. A second pass over
//! cleaned output changes nothing and reports nothing.

use crate::error::{ValidationError, ValidationReason};
use crate::value::Value;
use std::collections::BTreeMap;

/// What the sanitizer changed, by document path.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SanitizationReport {
    /// Paths of `Undefined` values that were removed (or nulled inside arrays).
    pub removed_paths: Vec<String>,
    /// Paths of non-finite numbers replaced with `null`.
    pub numeric_corrections: Vec<String>,
    /// Paths of strings that were trimmed.
    pub string_corrections: Vec<String>,
}

impl SanitizationReport {
    /// Returns true if nothing was changed.
    pub fn is_clean(&self) -> bool {
        self.removed_paths.is_empty()
            && self.numeric_corrections.is_empty()
            && self.string_corrections.is_empty()
    }

    /// Total number of corrections.
    pub fn len(&self) -> usize {
        self.removed_paths.len() + self.numeric_corrections.len() + self.string_corrections.len()
    }

    /// Returns true if the report is empty.
    pub fn is_empty(&self) -> bool {
        self.is_clean()
    }

    /// Appends another report's entries.
    pub fn extend(&mut self, other: SanitizationReport) {
        self.removed_paths.extend(other.removed_paths);
        self.numeric_corrections.extend(other.numeric_corrections);
        self.string_corrections.extend(other.string_corrections);
    }

    /// Every corrected path, in report order.
    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.removed_paths
            .iter()
            .chain(&self.numeric_corrections)
            .chain(&self.string_corrections)
            .map(String::as_str)
    }

    /// One-line human readable summary.
    pub fn summary(&self) -> String {
        format!(
            "{} removed, {} numeric, {} string corrections",
            self.removed_paths.len(),
            self.numeric_corrections.len(),
            self.string_corrections.len()
        )
    }
}

/// Output of a sanitization pass.
#[derive(Debug, Clone, PartialEq)]
pub struct Sanitized {
    /// Transmittable document.
    pub cleaned: Value,
    /// What was changed to produce `cleaned`.
    pub report: SanitizationReport,
}

/// How a schema field is checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldRule {
    /// Must be present and non-empty after trimming.
    NonEmpty,
    /// Must be a number, or a string that parses to a finite number.
    NumericId,
}

/// Which fields must be present.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Requirement {
    /// Every schema field is required (creates and full replacements).
    Full,
    /// Only the `id` field is required; other schema fields are checked only
    /// when present (partial updates).
    Partial,
}

/// Required-field schema of a record kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordSchema {
    /// Record kind name.
    pub name: &'static str,
    /// Checked fields, in reporting order.
    pub fields: &'static [(&'static str, FieldRule)],
}

impl RecordSchema {
    /// Jobs: numeric id plus date, crew, client and scope.
    pub const JOB: RecordSchema = RecordSchema {
        name: "job",
        fields: &[
            ("id", FieldRule::NumericId),
            ("date", FieldRule::NonEmpty),
            ("crew", FieldRule::NonEmpty),
            ("client", FieldRule::NonEmpty),
            ("scope", FieldRule::NonEmpty),
        ],
    };

    /// The policy singleton has no required fields.
    pub const POLICY: RecordSchema = RecordSchema {
        name: "policy",
        fields: &[],
    };

    /// Kudos documents.
    pub const KUDOS: RecordSchema = RecordSchema {
        name: "kudos",
        fields: &[("id", FieldRule::NonEmpty)],
    };

    /// User profiles.
    pub const USER: RecordSchema = RecordSchema {
        name: "user",
        fields: &[("id", FieldRule::NonEmpty)],
    };

    /// Media metadata; always belongs to a job.
    pub const MEDIA: RecordSchema = RecordSchema {
        name: "media",
        fields: &[("id", FieldRule::NonEmpty), ("jobId", FieldRule::NumericId)],
    };

    /// Free-form documents.
    pub const ANY: RecordSchema = RecordSchema {
        name: "document",
        fields: &[],
    };

    /// Schema for a collection name, falling back to [`RecordSchema::ANY`].
    pub fn for_collection(collection: &str) -> RecordSchema {
        match collection {
            "jobs" => Self::JOB,
            "policy" => Self::POLICY,
            "kudos" => Self::KUDOS,
            "users" => Self::USER,
            "media" => Self::MEDIA,
            _ => Self::ANY,
        }
    }

    fn is_required(&self, field: &str, requirement: Requirement) -> bool {
        match requirement {
            Requirement::Full => true,
            Requirement::Partial => field == "id",
        }
    }
}

/// Cleans `value` into its transmittable form.
///
/// `path` names the document (for example `jobs/12`); nested fields are
/// reported as `jobs/12.crew[0]`.
pub fn sanitize(value: &Value, path: &str) -> Sanitized {
    let mut report = SanitizationReport::default();
    let cleaned = match value {
        Value::Undefined => {
            report.removed_paths.push(path.to_string());
            Value::Null
        }
        other => clean(other, path, &mut report),
    };
    Sanitized { cleaned, report }
}

fn clean(value: &Value, path: &str, report: &mut SanitizationReport) -> Value {
    match value {
        // Callers handle Undefined by position; reaching here means a bare value.
        Value::Undefined => Value::Null,
        Value::Null => Value::Null,
        Value::Bool(b) => Value::Bool(*b),
        Value::Number(n) if n.is_finite() => Value::Number(*n),
        Value::Number(_) => {
            report.numeric_corrections.push(path.to_string());
            Value::Null
        }
        Value::Text(s) => {
            let trimmed = s.trim();
            if trimmed.len() != s.len() {
                report.string_corrections.push(path.to_string());
            }
            Value::Text(trimmed.to_string())
        }
        Value::Array(items) => Value::Array(
            items
                .iter()
                .enumerate()
                .map(|(i, item)| {
                    let item_path = format!("{path}[{i}]");
                    if item.is_undefined() {
                        report.removed_paths.push(item_path);
                        Value::Null
                    } else {
                        clean(item, &item_path, report)
                    }
                })
                .collect(),
        ),
        Value::Object(fields) => {
            let mut out = BTreeMap::new();
            for (key, field) in fields {
                let field_path = format!("{path}.{key}");
                if field.is_undefined() {
                    report.removed_paths.push(field_path);
                    continue;
                }
                out.insert(key.clone(), clean(field, &field_path, report));
            }
            Value::Object(out)
        }
    }
}

/// Checks a cleaned document against `schema`.
///
/// Returns the first failing field in schema order.
pub fn validate(
    cleaned: &Value,
    schema: &RecordSchema,
    requirement: Requirement,
    path: &str,
) -> Result<(), ValidationError> {
    if cleaned.as_object().is_none() {
        return Err(ValidationError::new(
            schema.name,
            path,
            ValidationReason::WrongType,
        ));
    }

    for (field, rule) in schema.fields {
        let value = match cleaned.get(field) {
            None | Some(Value::Null) => {
                if schema.is_required(field, requirement) {
                    return Err(ValidationError::missing(*field, path));
                }
                continue;
            }
            Some(value) => value,
        };

        let reason = match rule {
            FieldRule::NonEmpty => empty_reason(value),
            FieldRule::NumericId => match value {
                Value::Text(s) if s.trim().is_empty() => Some(ValidationReason::Empty),
                other if coerce_numeric(other).is_none() => Some(ValidationReason::UnparseableId),
                _ => None,
            },
        };

        if let Some(reason) = reason {
            return Err(ValidationError::new(*field, path, reason));
        }
    }

    Ok(())
}

/// Sanitizes `value` and validates the result.
pub fn sanitize_record(
    value: &Value,
    schema: &RecordSchema,
    requirement: Requirement,
    path: &str,
) -> Result<Sanitized, ValidationError> {
    let sanitized = sanitize(value, path);
    validate(&sanitized.cleaned, schema, requirement, path)?;
    Ok(sanitized)
}

/// Reads `field` of `doc` as a canonical id string.
///
/// Integral numbers are written without a fraction (`12`, not `12.0`), text
/// ids are trimmed.
pub fn document_id(doc: &Value, field: &str, path: &str) -> Result<String, ValidationError> {
    match doc.get(field) {
        None | Some(Value::Null) => Err(ValidationError::missing(field, path)),
        Some(value @ Value::Number(n)) if n.is_finite() => Ok(value
            .as_i64()
            .map_or_else(|| n.to_string(), |i| i.to_string())),
        Some(Value::Text(s)) if !s.trim().is_empty() => Ok(s.trim().to_string()),
        Some(Value::Text(_)) => Err(ValidationError::new(field, path, ValidationReason::Empty)),
        Some(_) => Err(ValidationError::new(
            field,
            path,
            ValidationReason::UnparseableId,
        )),
    }
}

fn empty_reason(value: &Value) -> Option<ValidationReason> {
    let empty = match value {
        Value::Text(s) => s.trim().is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(fields) => fields.is_empty(),
        _ => false,
    };
    empty.then_some(ValidationReason::Empty)
}

fn coerce_numeric(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) if n.is_finite() => Some(*n),
        Value::Text(s) => s.trim().parse::<f64>().ok().filter(|n| n.is_finite()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn doc(json: serde_json::Value) -> Value {
        serde_json::from_value(json).unwrap()
    }

    fn job() -> Value {
        doc(serde_json::json!({
            "id": 1,
            "date": "2025-11-28",
            "crew": ["ana", "li"],
            "client": "Harbor Dental",
            "scope": "Window cleaning"
        }))
    }

    #[test]
    fn undefined_fields_are_removed() {
        let input = job().with("notes", Value::Undefined);
        let out = sanitize(&input, "jobs/1");

        assert!(out.cleaned.as_object().unwrap().get("notes").is_none());
        assert_eq!(out.report.removed_paths, vec!["jobs/1.notes"]);
    }

    #[test]
    fn undefined_array_slots_become_null() {
        let input = Value::object().with(
            "crew",
            Value::Array(vec!["ana".into(), Value::Undefined]),
        );
        let out = sanitize(&input, "jobs/1");

        assert_eq!(
            out.cleaned.get("crew"),
            Some(&Value::Array(vec!["ana".into(), Value::Null]))
        );
        assert_eq!(out.report.removed_paths, vec!["jobs/1.crew[1]"]);
    }

    #[test]
    fn non_finite_numbers_are_nulled() {
        let input = Value::object()
            .with("hours", f64::NAN)
            .with("rate", f64::NEG_INFINITY)
            .with("ok", 2.5);
        let out = sanitize(&input, "jobs/1");

        assert_eq!(out.cleaned.get("hours"), Some(&Value::Null));
        assert_eq!(out.cleaned.get("rate"), Some(&Value::Null));
        assert_eq!(out.cleaned.get("ok"), Some(&Value::Number(2.5)));
        assert_eq!(
            out.report.numeric_corrections,
            vec!["jobs/1.hours", "jobs/1.rate"]
        );
    }

    #[test]
    fn strings_are_trimmed() {
        let input = Value::object().with("client", "  Harbor Dental ");
        let out = sanitize(&input, "jobs/1");

        assert_eq!(
            out.cleaned.get("client").and_then(Value::as_str),
            Some("Harbor Dental")
        );
        assert_eq!(out.report.string_corrections, vec!["jobs/1.client"]);
    }

    #[test]
    fn full_job_validates() {
        let out = sanitize_record(&job(), &RecordSchema::JOB, Requirement::Full, "jobs/1").unwrap();
        assert!(out.report.is_clean());
    }

    #[test]
    fn missing_required_field_is_named() {
        let mut input = job();
        input.remove("client");
        let err = sanitize_record(&input, &RecordSchema::JOB, Requirement::Full, "jobs/1")
            .unwrap_err();

        assert_eq!(err.field, "client");
        assert_eq!(err.path, "jobs/1");
        assert_eq!(err.reason, ValidationReason::Missing);
    }

    #[test]
    fn whitespace_only_required_field_fails() {
        let input = job().with("scope", "   ");
        let err = sanitize_record(&input, &RecordSchema::JOB, Requirement::Full, "jobs/1")
            .unwrap_err();

        assert_eq!(err.field, "scope");
        assert_eq!(err.reason, ValidationReason::Empty);
    }

    #[test]
    fn first_missing_field_wins() {
        let input = doc(serde_json::json!({ "id": 3 }));
        let err = validate(&input, &RecordSchema::JOB, Requirement::Full, "jobs/3").unwrap_err();
        assert_eq!(err.field, "date");
    }

    #[test]
    fn id_must_be_numeric() {
        let input = job().with("id", "abc");
        let err = sanitize_record(&input, &RecordSchema::JOB, Requirement::Full, "jobs/abc")
            .unwrap_err();
        assert_eq!(err.field, "id");
        assert_eq!(err.reason, ValidationReason::UnparseableId);

        let input = job().with("id", " 42 ");
        assert!(sanitize_record(&input, &RecordSchema::JOB, Requirement::Full, "jobs/42").is_ok());

        let input = job().with("id", f64::NAN);
        let err = sanitize_record(&input, &RecordSchema::JOB, Requirement::Full, "jobs/?")
            .unwrap_err();
        assert_eq!(err.reason, ValidationReason::Missing);
    }

    #[test]
    fn partial_update_only_requires_id() {
        let input = Value::object()
            .with("id", 1)
            .with("client", Value::Undefined);
        let out =
            sanitize_record(&input, &RecordSchema::JOB, Requirement::Partial, "jobs/1").unwrap();
        assert!(out.cleaned.as_object().unwrap().get("client").is_none());

        let input = Value::object().with("id", 1).with("crew", "");
        let err = sanitize_record(&input, &RecordSchema::JOB, Requirement::Partial, "jobs/1")
            .unwrap_err();
        assert_eq!(err.field, "crew");

        let input = Value::object().with("client", "x");
        let err = sanitize_record(&input, &RecordSchema::JOB, Requirement::Partial, "jobs/?")
            .unwrap_err();
        assert_eq!(err.field, "id");
    }

    #[test]
    fn non_object_payload_is_rejected() {
        let err = validate(&Value::from(3), &RecordSchema::ANY, Requirement::Full, "custom")
            .unwrap_err();
        assert_eq!(err.reason, ValidationReason::WrongType);
    }

    #[test]
    fn document_id_is_canonical() {
        let input = doc(serde_json::json!({ "id": 12, "other": " 7 ", "frac": 1.5 }));
        assert_eq!(document_id(&input, "id", "jobs").unwrap(), "12");
        assert_eq!(document_id(&input, "other", "jobs").unwrap(), "7");
        assert_eq!(document_id(&input, "frac", "jobs").unwrap(), "1.5");
        assert!(document_id(&input, "missing", "jobs").is_err());
    }

    #[test]
    fn resanitizing_reports_nothing() {
        let input = job()
            .with("client", Value::Undefined)
            .with("hours", f64::INFINITY)
            .with("scope", " trim me ");
        let first = sanitize(&input, "jobs/1");
        assert_eq!(first.report.len(), 3);

        let second = sanitize(&first.cleaned, "jobs/1");
        assert_eq!(second.cleaned, first.cleaned);
        assert!(second.report.is_clean());
    }

    fn arb_value() -> impl Strategy<Value = Value> {
        let leaf = prop_oneof![
            Just(Value::Undefined),
            Just(Value::Null),
            any::<bool>().prop_map(Value::Bool),
            any::<f64>().prop_map(Value::Number),
            Just(Value::Number(f64::NAN)),
            Just(Value::Number(f64::INFINITY)),
            "[ a-z]{0,6}".prop_map(Value::Text),
        ];
        leaf.prop_recursive(4, 48, 6, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..6).prop_map(Value::Array),
                prop::collection::btree_map("[a-z]{1,4}", inner, 0..6).prop_map(Value::Object),
            ]
        })
    }

    proptest! {
        #[test]
        fn sanitize_is_idempotent(input in arb_value()) {
            let once = sanitize(&input, "doc");
            let twice = sanitize(&once.cleaned, "doc");

            prop_assert_eq!(&twice.cleaned, &once.cleaned);
            prop_assert!(twice.report.is_clean());
            prop_assert_eq!(
                serde_json::to_vec(&twice.cleaned).unwrap(),
                serde_json::to_vec(&once.cleaned).unwrap()
            );
        }
    }
}

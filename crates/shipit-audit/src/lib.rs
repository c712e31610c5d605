//! Audit trail for shipit reconciliations.
//!
//! Every write that changes something leaves one immutable [`AuditRow`]
//! behind. The row carries a structural patch between the before and after
//! representations of the touched entity, sealed with the [`FieldCodec`].
//!
//! - [`diff`] computes the patch. Objects are walked by key; arrays whose
//!   elements all carry a `name` are matched by name, other arrays by index.
//! - [`AuditRecorder`] turns a before/after pair into a sealed row, or into
//!   nothing when the patch is empty.
//! - [`AuditReader`] opens rows again and hides the patch of hidden rows from
//!   unauthenticated readers.
//!
//! # Example
//!
//! ```
//! use serde_json::json;
//! use shipit_audit::{AuditContext, AuditReader, AuditRecorder};
//! use shipit_encrypt::FieldCodec;
//! use shipit_types::{Actor, ReadView};
//!
//! let codec = FieldCodec::passthrough();
//! let recorder = AuditRecorder::new(codec.clone());
//! let actor = Actor::new("alice");
//! let ctx = AuditContext { actor: &actor, shipment: "billing", environment: "prod" };
//!
//! let row = recorder
//!     .record(&ctx, "prod", &json!({"iamRole": ""}), &json!({"iamRole": "arn"}), false)
//!     .expect("record")
//!     .expect("non-empty diff");
//!
//! let entries = AuditReader::new(codec).read(vec![row], ReadView::anonymous()).expect("read");
//! assert_eq!(entries[0].diff[0]["op"], "replace");
//! ```

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use shipit_encrypt::FieldCodec;
use shipit_types::{Actor, AuditEntry, AuditRow, REDACTED, ReadView};

/// Kind of change at one path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatchKind {
    Add,
    Remove,
    Replace,
}

/// One change in a structural patch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatchOp {
    pub op: PatchKind,
    /// Slash-separated path; array elements with a `name` are addressed by it
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new: Option<Value>,
}

impl PatchOp {
    fn add(path: String, new: &Value) -> Self {
        Self { op: PatchKind::Add, path, old: None, new: Some(new.clone()) }
    }

    fn remove(path: String, old: &Value) -> Self {
        Self { op: PatchKind::Remove, path, old: Some(old.clone()), new: None }
    }

    fn replace(path: String, old: &Value, new: &Value) -> Self {
        Self {
            op: PatchKind::Replace,
            path,
            old: Some(old.clone()),
            new: Some(new.clone()),
        }
    }
}

/// Structural patch turning `before` into `after`.
///
/// `Null` on either side stands for "did not exist": the patch is then a
/// single `add` or `remove` at the root path.
pub fn diff(before: &Value, after: &Value) -> Vec<PatchOp> {
    let mut ops = Vec::new();
    match (before, after) {
        (Value::Null, Value::Null) => {}
        (Value::Null, new) => ops.push(PatchOp::add(String::new(), new)),
        (old, Value::Null) => ops.push(PatchOp::remove(String::new(), old)),
        (old, new) => diff_into(&mut ops, String::new(), old, new),
    }
    ops
}

fn diff_into(ops: &mut Vec<PatchOp>, path: String, before: &Value, after: &Value) {
    match (before, after) {
        (Value::Object(old), Value::Object(new)) => diff_objects(ops, &path, old, new),
        (Value::Array(old), Value::Array(new)) => {
            if names_of(old).is_some() && names_of(new).is_some() {
                diff_named(ops, &path, old, new);
            } else {
                diff_indexed(ops, &path, old, new);
            }
        }
        (old, new) if old != new => ops.push(PatchOp::replace(path, old, new)),
        _ => {}
    }
}

fn diff_objects(ops: &mut Vec<PatchOp>, path: &str, old: &Map<String, Value>, new: &Map<String, Value>) {
    for (key, old_value) in old {
        match new.get(key) {
            Some(new_value) => diff_into(ops, child_path(path, key), old_value, new_value),
            None => ops.push(PatchOp::remove(child_path(path, key), old_value)),
        }
    }
    for (key, new_value) in new {
        if !old.contains_key(key) {
            ops.push(PatchOp::add(child_path(path, key), new_value));
        }
    }
}

fn diff_named(ops: &mut Vec<PatchOp>, path: &str, old: &[Value], new: &[Value]) {
    for old_value in old {
        let name = element_name(old_value).unwrap_or_default();
        if find(new, name).is_none() {
            ops.push(PatchOp::remove(child_path(path, name), old_value));
        }
    }
    for new_value in new {
        let name = element_name(new_value).unwrap_or_default();
        match find(old, name) {
            Some(i) => diff_into(ops, child_path(path, name), &old[i], new_value),
            None => ops.push(PatchOp::add(child_path(path, name), new_value)),
        }
    }
}

fn diff_indexed(ops: &mut Vec<PatchOp>, path: &str, old: &[Value], new: &[Value]) {
    let shared = old.len().min(new.len());
    for i in 0..shared {
        diff_into(ops, child_path(path, &i.to_string()), &old[i], &new[i]);
    }
    for (i, value) in old.iter().enumerate().skip(shared) {
        ops.push(PatchOp::remove(child_path(path, &i.to_string()), value));
    }
    for (i, value) in new.iter().enumerate().skip(shared) {
        ops.push(PatchOp::add(child_path(path, &i.to_string()), value));
    }
}

fn find(items: &[Value], name: &str) -> Option<usize> {
    items.iter().position(|v| element_name(v) == Some(name))
}

fn element_name(value: &Value) -> Option<&str> {
    value.get("name").and_then(Value::as_str)
}

/// `Some` when every element is an object with a string `name`.
fn names_of(items: &[Value]) -> Option<Vec<&str>> {
    items.iter().map(element_name).collect()
}

fn child_path(parent: &str, segment: &str) -> String {
    let escaped = segment.replace('~', "~0").replace('/', "~1");
    format!("{parent}/{escaped}")
}

/// Who changed what, shared by every row of one reconciliation.
#[derive(Debug, Clone, Copy)]
pub struct AuditContext<'a> {
    pub actor: &'a Actor,
    pub shipment: &'a str,
    pub environment: &'a str,
}

/// Builds sealed audit rows.
#[derive(Debug, Clone)]
pub struct AuditRecorder {
    codec: FieldCodec,
}

impl AuditRecorder {
    pub fn new(codec: FieldCodec) -> Self {
        Self { codec }
    }

    /// Build the row for one before/after pair.
    ///
    /// Returns `None` when nothing changed. The row is hidden when `hidden` is
    /// set or the actor is a hidden actor.
    pub fn record(
        &self,
        ctx: &AuditContext<'_>,
        name: &str,
        before: &Value,
        after: &Value,
        hidden: bool,
    ) -> Result<Option<AuditRow>> {
        let ops = diff(before, after);
        if ops.is_empty() {
            return Ok(None);
        }

        let json = serde_json::to_string(&ops).context("failed to serialize audit diff")?;
        let sealed = self
            .codec
            .encrypt_field(&json)
            .context("failed to seal audit diff")?;

        Ok(Some(AuditRow {
            shipment: ctx.shipment.to_string(),
            environment: ctx.environment.to_string(),
            user: ctx.actor.username.clone(),
            name: name.to_string(),
            hidden: hidden || ctx.actor.hidden,
            updated: Utc::now().timestamp_millis(),
            diff: sealed,
        }))
    }
}

/// Opens stored audit rows for a reader.
#[derive(Debug, Clone)]
pub struct AuditReader {
    codec: FieldCodec,
}

impl AuditReader {
    pub fn new(codec: FieldCodec) -> Self {
        Self { codec }
    }

    /// Open rows oldest first. Hidden rows show [`REDACTED`] to anonymous views.
    pub fn read(&self, mut rows: Vec<AuditRow>, view: ReadView) -> Result<Vec<AuditEntry>> {
        rows.sort_by_key(|row| row.updated);
        rows.into_iter().map(|row| self.open(row, view)).collect()
    }

    fn open(&self, row: AuditRow, view: ReadView) -> Result<AuditEntry> {
        let diff = if row.hidden && !view.authenticated {
            Value::String(REDACTED.to_string())
        } else {
            let json = self.codec.decrypt_field(&row.diff);
            serde_json::from_str(&json).with_context(|| {
                format!(
                    "failed to parse audit diff for {}/{} at {}",
                    row.shipment, row.environment, row.updated
                )
            })?
        };

        Ok(AuditEntry {
            shipment: row.shipment,
            environment: row.environment,
            user: row.user,
            name: row.name,
            hidden: row.hidden,
            updated: row.updated,
            diff,
        })
    }
}

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;
use sha2::{Digest, Sha256};
use shipit_encrypt::FieldCodec;
use shipit_store::Record;
use shipit_types::EntityKind;

use crate::diff::{Change, TreeDiff};
use crate::error::ReconcileError;
use crate::tree::to_record;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Method {
    Upsert,
    Destroy,
}

/// Whether an operation must finish before anything below it can start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Deletes and the root row
    Now,
    /// Rows that only need their parent to exist
    Later,
}

#[derive(Debug, Clone, Serialize)]
pub struct Operation {
    pub kind: EntityKind,
    pub id: String,
    pub method: Method,
    pub phase: Phase,
    pub depth: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub change: Option<Change>,
    /// Row written by an upsert, sealed fields already encrypted
    #[serde(skip)]
    pub record: Option<Record>,
}

/// Operations with no dependency on each other.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Batch {
    pub operations: Vec<Operation>,
}

/// Ordered batches of one reconciliation.
///
/// Every delete comes first, deepest level first, so a rename frees its id
/// before the new name is written. Upserts follow level by level from the
/// root, so each row's parent exists when it is written.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Plan {
    pub plan_id: String,
    pub batches: Vec<Batch>,
}

impl Plan {
    pub fn build(diff: &TreeDiff, codec: &FieldCodec) -> Result<Plan, ReconcileError> {
        let mut seen = BTreeSet::new();
        for upsert in &diff.upserts {
            if !seen.insert((upsert.kind, upsert.id.as_str())) {
                return Err(ReconcileError::Conflict(format!(
                    "{} `{}` is written twice in one reconciliation",
                    upsert.kind, upsert.id
                )));
            }
        }

        let mut deletes: BTreeMap<usize, Vec<Operation>> = BTreeMap::new();
        for delete in &diff.deletes {
            deletes.entry(delete.depth).or_default().push(Operation {
                kind: delete.kind,
                id: delete.id.clone(),
                method: Method::Destroy,
                phase: Phase::Now,
                depth: delete.depth,
                change: None,
                record: None,
            });
        }

        let mut upserts: BTreeMap<usize, Vec<Operation>> = BTreeMap::new();
        for upsert in &diff.upserts {
            let record = to_record(
                &upsert.node,
                &upsert.id,
                upsert.parent.clone(),
                upsert.position,
                codec,
            )?;
            upserts.entry(upsert.depth).or_default().push(Operation {
                kind: upsert.kind,
                id: upsert.id.clone(),
                method: Method::Upsert,
                phase: if upsert.depth == 0 { Phase::Now } else { Phase::Later },
                depth: upsert.depth,
                change: Some(upsert.change),
                record: Some(record),
            });
        }

        let batches: Vec<Batch> = deletes
            .into_values()
            .rev()
            .chain(upserts.into_values())
            .map(|operations| Batch { operations })
            .collect();

        Ok(Plan {
            plan_id: compute_plan_id(&batches),
            batches,
        })
    }

    pub fn operations(&self) -> impl Iterator<Item = &Operation> {
        self.batches.iter().flat_map(|b| b.operations.iter())
    }

    pub fn len(&self) -> usize {
        self.batches.iter().map(|b| b.operations.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn summary(&self) -> PlanSummary {
        let mut summary = PlanSummary::default();
        for op in self.operations() {
            match (op.method, op.change) {
                (Method::Destroy, _) => summary.deleted += 1,
                (Method::Upsert, Some(Change::Created)) => summary.created += 1,
                (Method::Upsert, Some(Change::Updated)) => summary.updated += 1,
                (Method::Upsert, _) => summary.unchanged += 1,
            }
        }
        summary
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PlanSummary {
    pub created: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub deleted: usize,
}

impl std::fmt::Display for PlanSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} to create, {} to update, {} unchanged, {} to delete",
            self.created, self.updated, self.unchanged, self.deleted
        )
    }
}

fn compute_plan_id(batches: &[Batch]) -> String {
    let mut hasher = Sha256::new();
    for (i, batch) in batches.iter().enumerate() {
        for op in &batch.operations {
            hasher.update(i.to_string().as_bytes());
            hasher.update(b" ");
            hasher.update(op.kind.as_str().as_bytes());
            hasher.update(b" ");
            hasher.update(op.id.as_bytes());
            hasher.update(match op.method {
                Method::Upsert => b" upsert\n".as_slice(),
                Method::Destroy => b" destroy\n".as_slice(),
            });
        }
    }
    hex::encode(hasher.finalize())
}

use std::time::Duration;

use futures::{StreamExt, TryStreamExt, stream};
use shipit_store::Transaction;

use crate::error::ReconcileError;
use crate::plan::{Method, Operation, Plan};

pub trait Reporter {
    fn info(&mut self, msg: &str);
    fn warn(&mut self, msg: &str);
    fn error(&mut self, msg: &str);
}

/// Knobs of the transactional phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineOptions {
    /// Operations of one batch in flight at once
    pub max_concurrency: usize,
    /// Upper bound on everything done inside the transaction
    pub transaction_timeout: Duration,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            transaction_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecutionSummary {
    pub upserted: usize,
    pub destroyed: usize,
    /// Deletes whose row was already removed by a cascade
    pub already_gone: usize,
}

enum Applied {
    Upserted,
    Destroyed,
    AlreadyGone,
}

/// Run every batch of `plan` on `tx`.
///
/// Batches run one after another. Inside a batch up to `max_concurrency`
/// operations are in flight; the first failure drops the rest of the batch
/// and is returned. Nothing is committed here.
pub async fn execute<T: Transaction>(
    tx: &T,
    plan: &Plan,
    max_concurrency: usize,
    reporter: &mut dyn Reporter,
) -> Result<ExecutionSummary, ReconcileError> {
    let mut summary = ExecutionSummary::default();
    let total = plan.batches.len();

    for (i, batch) in plan.batches.iter().enumerate() {
        reporter.info(&format!(
            "batch {}/{}: {} operation(s)",
            i + 1,
            total,
            batch.operations.len()
        ));

        let applied: Vec<Applied> = stream::iter(batch.operations.iter())
            .map(|op| apply(tx, op))
            .buffer_unordered(max_concurrency.max(1))
            .try_collect()
            .await?;

        for outcome in applied {
            match outcome {
                Applied::Upserted => summary.upserted += 1,
                Applied::Destroyed => summary.destroyed += 1,
                Applied::AlreadyGone => summary.already_gone += 1,
            }
        }
    }

    Ok(summary)
}

async fn apply<T: Transaction>(tx: &T, op: &Operation) -> Result<Applied, ReconcileError> {
    match op.method {
        Method::Destroy => {
            if tx.destroy(op.kind, &op.id).await? {
                Ok(Applied::Destroyed)
            } else {
                Ok(Applied::AlreadyGone)
            }
        }
        Method::Upsert => {
            let record = op.record.clone().ok_or_else(|| {
                ReconcileError::Transaction(format!("upsert of {} `{}` has no row", op.kind, op.id))
            })?;
            tx.upsert(record).await?;
            Ok(Applied::Upserted)
        }
    }
}

//! # Shipit
//!
//! Transactional bulk reconciliation of shipment topologies.
//!
//! A shipment owns environments; an environment owns containers, providers
//! and env vars; containers own ports and env vars; providers own env vars.
//! Callers send the complete desired tree of a shipment or of one
//! environment. Shipit compares it with what is stored and applies the
//! difference in a single transaction, with an encrypted audit trail.
//!
//! ## Features
//!
//! - **Deterministic ids**: Every row is keyed by the names on its path, so
//!   repeating a call is a no-op and a rename is a delete plus a create.
//! - **Ordered plans**: Deletes run deepest first, then upserts run level by
//!   level from the root, so foreign keys always hold.
//! - **All or nothing**: The plan, the read-back and the audit rows share one
//!   transaction, bounded by a timeout.
//! - **Secrets at rest**: Env var values, private keys and build tokens are
//!   sealed with AES-256-GCM; values and build tokens also get a searchable
//!   digest.
//! - **Audit trail**: One sealed structural patch per change, hidden from
//!   anonymous readers when it touches a secret.
//!
//! ## Pipeline
//!
//! 1. [`tree::parse`] validates the incoming tree against the [`schema`]
//!    tables and reports every problem with its path.
//! 2. [`diff::TreeDiff::compute`] matches siblings by name against the stored
//!    tree and classifies each node.
//! 3. [`plan::Plan::build`] orders the operations into batches and prepares
//!    the rows to write.
//! 4. [`engine::execute`] runs the batches inside the transaction.
//! 5. [`reconcile::Reconciler`] reads the result back, appends audit rows and
//!    commits, or rolls everything back.
//!
//! ## Example
//!
//! ```
//! use serde_json::json;
//! use shipit::{Reconciler, Reporter};
//! use shipit_encrypt::FieldCodec;
//! use shipit_store::MemoryStore;
//! use shipit_types::{Actor, Outcome};
//!
//! struct Quiet;
//! impl Reporter for Quiet {
//!     fn info(&mut self, _: &str) {}
//!     fn warn(&mut self, _: &str) {}
//!     fn error(&mut self, _: &str) {}
//! }
//!
//! # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
//! let reconciler = Reconciler::new(MemoryStore::new(), FieldCodec::passthrough());
//! let tree = json!({
//!     "name": "billing",
//!     "group": "payments",
//!     "environments": [{"name": "prod", "envVars": [{"name": "PORT", "value": 80}]}]
//! });
//!
//! let done = reconciler
//!     .reconcile_shipment(&tree, &Actor::new("alice"), &mut Quiet)
//!     .await
//!     .expect("reconcile");
//! assert_eq!(done.outcome, Outcome::Created);
//! assert_eq!(done.tree.environments[0].env_vars[0].value, "80");
//! # });
//! ```

/// Ordered tree diff between the stored and the incoming tree.
pub mod diff;

/// Batch execution inside a transaction, and the [`Reporter`] trait.
pub mod engine;

/// Error taxonomy and status mapping.
pub mod error;

/// Composite id derivation and name rules.
pub mod identity;

/// Dependency-ordered operation batches.
pub mod plan;

/// Reconciliation entry points and reads.
pub mod reconcile;

/// Per-kind field tables.
pub mod schema;

/// Generic entity tree: parsing, loading, record preparation.
pub mod tree;

pub use engine::{EngineOptions, ExecutionSummary, Reporter};
pub use error::{FieldError, ReconcileError};
pub use plan::{Plan, PlanSummary};
pub use reconcile::{BuildTarget, Reconciled, Reconciler};

#[cfg(test)]
mod property_tests;

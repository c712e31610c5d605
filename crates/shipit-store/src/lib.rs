//! Transactional entity store for shipit.
//!
//! This crate provides the [`Store`] / [`Transaction`] traits the
//! reconciliation engine writes through, and [`MemoryStore`], an in-memory
//! implementation with the relational guarantees the engine relies on:
//!
//! - primary key per entity kind (the composite id),
//! - foreign keys: a row can only be written under an existing parent,
//! - cascading delete of every descendant row,
//! - all-or-nothing commits (a transaction works on a private copy).
//!
//! A `MemoryStore` can be bound to a JSON snapshot file which is rewritten
//! atomically on every commit.
//!
//! # Example
//!
//! ```
//! use shipit_store::{MemoryStore, Record, Store, Transaction};
//! use shipit_types::EntityKind;
//!
//! # tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(async {
//! let store = MemoryStore::new();
//!
//! let tx = store.begin().await.expect("begin");
//! tx.upsert(Record::new(EntityKind::Shipment, "billing", None, "billing"))
//!     .await
//!     .expect("upsert");
//! tx.commit().await.expect("commit");
//!
//! let tx = store.begin().await.expect("begin");
//! assert!(tx.get(EntityKind::Shipment, "billing").await.expect("get").is_some());
//! # });
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use shipit_types::{AuditRow, EntityKind, ParentRef};
use thiserror::Error;

/// Minimum supported schema version
pub const MINIMUM_SUPPORTED_VERSION: u32 = 1;

/// Current schema version
pub const CURRENT_VERSION: u32 = 1;

/// Schema version for snapshot files
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaVersion {
    /// Version number
    pub version: u32,
}

impl SchemaVersion {
    /// Parse a schema version from a string like "shipit.store.v1"
    pub fn parse(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.split('.').collect();
        if parts.len() != 3 || parts[0] != "shipit" || !parts[2].starts_with('v') {
            return Err(anyhow::anyhow!("invalid schema version format: {}", s));
        }

        let version = parts[2][1..]
            .parse::<u32>()
            .with_context(|| format!("invalid version number: {}", s))?;

        Ok(Self { version })
    }

    /// Check if this version is supported (>= minimum, <= current)
    pub fn is_supported(&self) -> bool {
        (MINIMUM_SUPPORTED_VERSION..=CURRENT_VERSION).contains(&self.version)
    }

    /// Format as a version string
    pub fn to_version_string(&self, prefix: &str) -> String {
        format!("shipit.{}.v{}", prefix, self.version)
    }
}

impl Default for SchemaVersion {
    fn default() -> Self {
        Self { version: CURRENT_VERSION }
    }
}

impl std::fmt::Display for SchemaVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "v{}", self.version)
    }
}

/// One persisted entity row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub kind: EntityKind,
    /// Composite id, the primary key within `kind`
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<ParentRef>,
    pub name: String,
    /// Sort order among siblings
    #[serde(default)]
    pub position: usize,
    /// Field values as stored; secret fields are sealed
    #[serde(default)]
    pub fields: Map<String, Value>,
    /// Searchable digests keyed by field name
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub digests: BTreeMap<String, String>,
}

impl Record {
    pub fn new(
        kind: EntityKind,
        id: impl Into<String>,
        parent: Option<ParentRef>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            id: id.into(),
            parent,
            name: name.into(),
            position: 0,
            fields: Map::new(),
            digests: BTreeMap::new(),
        }
    }

    pub fn parent_ref(&self) -> ParentRef {
        ParentRef::new(self.kind, self.id.clone())
    }
}

/// What an upsert did to the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{kind} `{id}` already exists under a different parent")]
    UniqueViolation { kind: EntityKind, id: String },

    #[error("{kind} `{id}` references missing {} `{}`", parent.kind, parent.id)]
    MissingParent {
        kind: EntityKind,
        id: String,
        parent: ParentRef,
    },

    #[error("store lock poisoned")]
    Poisoned,

    #[error("failed to persist snapshot: {0}")]
    Persist(String),

    #[error("{0}")]
    Backend(String),
}

/// Entry point of a storage backend.
#[async_trait]
pub trait Store: Send + Sync {
    type Tx: Transaction;

    /// Open a transaction. Nothing it does is visible until `commit`.
    async fn begin(&self) -> Result<Self::Tx, StoreError>;

    /// Get the storage location description
    fn location(&self) -> String;
}

/// Unit of work over the entity tables and the audit log.
///
/// Methods take `&self` so several statements can be in flight on one
/// transaction at the same time.
#[async_trait]
pub trait Transaction: Send + Sync {
    async fn get(&self, kind: EntityKind, id: &str) -> Result<Option<Record>, StoreError>;

    /// Rows of `kind` owned by `parent` (roots when `None`), in sort order.
    async fn children(
        &self,
        parent: Option<&ParentRef>,
        kind: EntityKind,
    ) -> Result<Vec<Record>, StoreError>;

    /// Rows of `kind` whose `field` digest equals `digest`.
    async fn find_by_digest(
        &self,
        kind: EntityKind,
        field: &str,
        digest: &str,
    ) -> Result<Vec<Record>, StoreError>;

    async fn upsert(&self, record: Record) -> Result<UpsertOutcome, StoreError>;

    /// Delete a row and everything below it. Returns `false` if it was already gone.
    async fn destroy(&self, kind: EntityKind, id: &str) -> Result<bool, StoreError>;

    async fn append_audit(&self, row: AuditRow) -> Result<(), StoreError>;

    async fn audit_rows(
        &self,
        shipment: &str,
        environment: &str,
    ) -> Result<Vec<AuditRow>, StoreError>;

    async fn commit(self) -> Result<(), StoreError>;

    async fn rollback(self) -> Result<(), StoreError>;
}

/// The relational state: entity tables plus the append-only audit log.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Tables {
    #[serde(default)]
    rows: BTreeMap<EntityKind, BTreeMap<String, Record>>,
    #[serde(default)]
    audit: Vec<AuditRow>,
}

impl Tables {
    pub fn get(&self, kind: EntityKind, id: &str) -> Option<&Record> {
        self.rows.get(&kind).and_then(|table| table.get(id))
    }

    pub fn children(&self, parent: Option<&ParentRef>, kind: EntityKind) -> Vec<Record> {
        let mut out: Vec<Record> = self
            .rows
            .get(&kind)
            .map(|table| {
                table
                    .values()
                    .filter(|r| r.parent.as_ref() == parent)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        out.sort_by(|a, b| a.position.cmp(&b.position).then_with(|| a.name.cmp(&b.name)));
        out
    }

    pub fn find_by_digest(&self, kind: EntityKind, field: &str, digest: &str) -> Vec<Record> {
        self.rows
            .get(&kind)
            .map(|table| {
                table
                    .values()
                    .filter(|r| r.digests.get(field).map(String::as_str) == Some(digest))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn upsert(&mut self, record: Record) -> Result<UpsertOutcome, StoreError> {
        if let Some(parent) = &record.parent
            && self.get(parent.kind, &parent.id).is_none()
        {
            return Err(StoreError::MissingParent {
                kind: record.kind,
                id: record.id.clone(),
                parent: parent.clone(),
            });
        }

        let table = self.rows.entry(record.kind).or_default();
        match table.get(&record.id) {
            Some(existing) if existing.parent != record.parent => Err(StoreError::UniqueViolation {
                kind: record.kind,
                id: record.id.clone(),
            }),
            Some(_) => {
                table.insert(record.id.clone(), record);
                Ok(UpsertOutcome::Updated)
            }
            None => {
                table.insert(record.id.clone(), record);
                Ok(UpsertOutcome::Inserted)
            }
        }
    }

    pub fn destroy(&mut self, kind: EntityKind, id: &str) -> bool {
        let removed = self
            .rows
            .get_mut(&kind)
            .and_then(|table| table.remove(id))
            .is_some();
        if !removed {
            return false;
        }

        // Cascade: walk owners breadth-first until no row points at a removed one.
        let mut frontier = vec![ParentRef::new(kind, id)];
        while !frontier.is_empty() {
            let owners: BTreeSet<ParentRef> = frontier.drain(..).collect();
            for (child_kind, table) in self.rows.iter_mut() {
                let orphaned: Vec<String> = table
                    .values()
                    .filter(|r| r.parent.as_ref().is_some_and(|p| owners.contains(p)))
                    .map(|r| r.id.clone())
                    .collect();
                for child_id in orphaned {
                    table.remove(&child_id);
                    frontier.push(ParentRef::new(*child_kind, child_id));
                }
            }
        }
        true
    }

    pub fn append_audit(&mut self, row: AuditRow) {
        self.audit.push(row);
    }

    pub fn audit_rows(&self, shipment: &str, environment: &str) -> Vec<AuditRow> {
        self.audit
            .iter()
            .filter(|r| r.shipment == shipment && r.environment == environment)
            .cloned()
            .collect()
    }

    /// Number of rows of `kind`.
    pub fn count(&self, kind: EntityKind) -> usize {
        self.rows.get(&kind).map_or(0, BTreeMap::len)
    }

    pub fn audit_len(&self) -> usize {
        self.audit.len()
    }
}

/// Metadata about the stored snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreMetadata {
    /// When the store was created
    pub created_at: DateTime<Utc>,
    /// When the store was last committed to
    pub updated_at: DateTime<Utc>,
}

impl StoreMetadata {
    /// Create new metadata with current timestamp
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            created_at: now,
            updated_at: now,
        }
    }

    /// Update the modified timestamp
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

impl Default for StoreMetadata {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Snapshot {
    schema_version: String,
    metadata: StoreMetadata,
    tables: Tables,
}

#[derive(Debug, Default)]
struct Committed {
    tables: Tables,
    metadata: StoreMetadata,
}

/// In-memory store, optionally backed by a snapshot file.
///
/// Transactions copy the committed tables on `begin` and swap their copy
/// back in on `commit`; dropping or rolling back a transaction discards it.
/// Two transactions committed concurrently do not see each other: the last
/// commit wins.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Committed>>,
    snapshot: Option<PathBuf>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a store persisted at `path`, loading it if the file exists.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let committed = match std::fs::read(&path) {
            Ok(content) => {
                let snapshot: Snapshot = serde_json::from_slice(&content)
                    .with_context(|| format!("failed to parse store snapshot: {}", path.display()))?;
                validate_schema_version(&snapshot.schema_version)?;
                Committed {
                    tables: snapshot.tables,
                    metadata: snapshot.metadata,
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Committed::default(),
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("failed to read store snapshot: {}", path.display()));
            }
        };

        Ok(Self {
            inner: Arc::new(Mutex::new(committed)),
            snapshot: Some(path),
        })
    }

    pub fn snapshot_path(&self) -> Option<&Path> {
        self.snapshot.as_deref()
    }

    /// Copy of the committed tables.
    pub fn tables(&self) -> Result<Tables, StoreError> {
        Ok(self.lock()?.tables.clone())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Committed>, StoreError> {
        self.inner.lock().map_err(|_| StoreError::Poisoned)
    }

    fn persist(&self, path: &Path, tables: &Tables, metadata: &StoreMetadata) -> Result<()> {
        let snapshot = Snapshot {
            schema_version: SchemaVersion::default().to_version_string("store"),
            metadata: metadata.clone(),
            tables: tables.clone(),
        };
        let content =
            serde_json::to_vec_pretty(&snapshot).context("failed to serialize store snapshot")?;
        write_atomic(path, &content)
    }
}

/// Validate a snapshot schema version string
pub fn validate_schema_version(version: &str) -> Result<()> {
    let parsed = SchemaVersion::parse(version)?;

    if !parsed.is_supported() {
        anyhow::bail!(
            "schema version {} is not supported. Supported versions are v{}..=v{}",
            version,
            MINIMUM_SUPPORTED_VERSION,
            CURRENT_VERSION
        );
    }

    Ok(())
}

/// Write data to a file atomically
fn write_atomic(path: &Path, content: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create store dir: {}", parent.display()))?;
    }

    let tmp_path = path.with_extension("tmp");
    std::fs::write(&tmp_path, content)
        .with_context(|| format!("failed to write file: {}", tmp_path.display()))?;
    std::fs::rename(&tmp_path, path)
        .with_context(|| format!("failed to rename file to: {}", path.display()))?;

    Ok(())
}

#[async_trait]
impl Store for MemoryStore {
    type Tx = MemoryTx;

    async fn begin(&self) -> Result<MemoryTx, StoreError> {
        let tables = self.lock()?.tables.clone();
        Ok(MemoryTx {
            staged: Mutex::new(tables),
            store: self.clone(),
        })
    }

    fn location(&self) -> String {
        match &self.snapshot {
            Some(path) => path.display().to_string(),
            None => "memory".to_string(),
        }
    }
}

/// Transaction over a private copy of a [`MemoryStore`].
#[derive(Debug)]
pub struct MemoryTx {
    staged: Mutex<Tables>,
    store: MemoryStore,
}

impl MemoryTx {
    fn staged(&self) -> Result<MutexGuard<'_, Tables>, StoreError> {
        self.staged.lock().map_err(|_| StoreError::Poisoned)
    }
}

#[async_trait]
impl Transaction for MemoryTx {
    async fn get(&self, kind: EntityKind, id: &str) -> Result<Option<Record>, StoreError> {
        Ok(self.staged()?.get(kind, id).cloned())
    }

    async fn children(
        &self,
        parent: Option<&ParentRef>,
        kind: EntityKind,
    ) -> Result<Vec<Record>, StoreError> {
        Ok(self.staged()?.children(parent, kind))
    }

    async fn find_by_digest(
        &self,
        kind: EntityKind,
        field: &str,
        digest: &str,
    ) -> Result<Vec<Record>, StoreError> {
        Ok(self.staged()?.find_by_digest(kind, field, digest))
    }

    async fn upsert(&self, record: Record) -> Result<UpsertOutcome, StoreError> {
        self.staged()?.upsert(record)
    }

    async fn destroy(&self, kind: EntityKind, id: &str) -> Result<bool, StoreError> {
        Ok(self.staged()?.destroy(kind, id))
    }

    async fn append_audit(&self, row: AuditRow) -> Result<(), StoreError> {
        self.staged()?.append_audit(row);
        Ok(())
    }

    async fn audit_rows(
        &self,
        shipment: &str,
        environment: &str,
    ) -> Result<Vec<AuditRow>, StoreError> {
        Ok(self.staged()?.audit_rows(shipment, environment))
    }

    async fn commit(self) -> Result<(), StoreError> {
        let tables = self.staged.into_inner().map_err(|_| StoreError::Poisoned)?;
        let mut committed = self.store.lock()?;
        let mut metadata = committed.metadata.clone();
        metadata.touch();

        // Persist before swapping so a failed write leaves both copies untouched.
        if let Some(path) = &self.store.snapshot {
            self.store
                .persist(path, &tables, &metadata)
                .map_err(|e| StoreError::Persist(format!("{e:#}")))?;
        }

        committed.tables = tables;
        committed.metadata = metadata;
        Ok(())
    }

    async fn rollback(self) -> Result<(), StoreError> {
        Ok(())
    }
}

//! Reconciliation entry points and reads.
//!
//! A reconciliation takes the full desired tree of one shipment or
//! environment, diffs it against what is stored, and applies the resulting
//! plan in one transaction together with its audit rows. Either all of it is
//! committed or none of it is.
//!
//! Two calls on the same target are not serialized against each other: each
//! works on the state it read, and the later commit wins.

use serde_json::Value;
use shipit_audit::{AuditContext, AuditReader, AuditRecorder};
use shipit_encrypt::{FieldCodec, random_token};
use shipit_store::{Store, Transaction};
use shipit_types::{
    Actor, AuditEntry, EntityKind, Environment, Outcome, ParentRef, ReadView, Redact, Shipment,
};

use crate::diff::TreeDiff;
use crate::engine::{EngineOptions, ExecutionSummary, Reporter, execute};
use crate::error::{FieldError, ReconcileError};
use crate::identity::derive_id;
use crate::plan::Plan;
use crate::schema::BUILD_TOKEN;
use crate::tree::{self, Node};

const ENVIRONMENTS: &str = "environments";

/// Result of a committed reconciliation.
#[derive(Debug, Clone)]
pub struct Reconciled<T> {
    /// Whether the root existed before
    pub outcome: Outcome,
    /// Root as stored after the commit
    pub tree: T,
    pub plan: Plan,
    pub execution: ExecutionSummary,
    /// Audit rows appended
    pub audit_rows: usize,
}

/// Environment resolved from a build token.
#[derive(Debug, Clone, PartialEq)]
pub struct BuildTarget {
    pub shipment: String,
    pub environment: Environment,
}

/// What one call reconciles.
struct Target {
    shipment: String,
    /// Environment named in the call, if any
    environment: Option<String>,
    root_kind: EntityKind,
    ancestry: Vec<String>,
    parent: Option<ParentRef>,
}

impl Target {
    fn root_name(&self) -> &str {
        match self.root_kind {
            EntityKind::Shipment => &self.shipment,
            _ => self.environment.as_deref().unwrap_or_default(),
        }
    }

    fn root_id(&self) -> String {
        derive_id(&self.ancestry, self.root_name())
    }

    /// Collections of the root that are loaded and diffed one entry at a time.
    fn scoped(&self) -> &'static [&'static str] {
        match self.root_kind {
            EntityKind::Shipment => &[ENVIRONMENTS],
            _ => &[],
        }
    }
}

/// Incoming tree checked, current tree loaded, plan built.
struct Prepared {
    current: Option<Node>,
    diff: TreeDiff,
    plan: Plan,
}

/// Reconciles shipment and environment trees against a [`Store`].
pub struct Reconciler<S: Store> {
    store: S,
    codec: FieldCodec,
    options: EngineOptions,
}

impl<S: Store> Reconciler<S> {
    pub fn new(store: S, codec: FieldCodec) -> Self {
        Self {
            store,
            codec,
            options: EngineOptions::default(),
        }
    }

    pub fn with_options(mut self, options: EngineOptions) -> Self {
        self.options = options;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn options(&self) -> EngineOptions {
        self.options
    }

    /// Reconcile a shipment and its first environment.
    ///
    /// Other environments of the shipment are neither read nor touched.
    pub async fn reconcile_shipment(
        &self,
        tree: &Value,
        actor: &Actor,
        reporter: &mut dyn Reporter,
    ) -> Result<Reconciled<Shipment>, ReconcileError> {
        let (target, incoming) = parse_shipment(tree)?;
        let applied = self.reconcile(&target, incoming, actor, reporter).await?;
        applied.typed()
    }

    /// Reconcile one environment of an existing shipment.
    pub async fn reconcile_environment(
        &self,
        shipment: &str,
        tree: &Value,
        actor: &Actor,
        reporter: &mut dyn Reporter,
    ) -> Result<Reconciled<Environment>, ReconcileError> {
        let (target, incoming) = parse_environment(shipment, tree)?;
        let applied = self.reconcile(&target, incoming, actor, reporter).await?;
        applied.typed()
    }

    /// Plan a shipment reconciliation without writing anything.
    pub async fn plan_shipment(&self, tree: &Value) -> Result<Plan, ReconcileError> {
        let (target, incoming) = parse_shipment(tree)?;
        self.dry_run(&target, incoming).await
    }

    /// Plan an environment reconciliation without writing anything.
    pub async fn plan_environment(
        &self,
        shipment: &str,
        tree: &Value,
    ) -> Result<Plan, ReconcileError> {
        let (target, incoming) = parse_environment(shipment, tree)?;
        self.dry_run(&target, incoming).await
    }

    pub async fn get_shipment(
        &self,
        name: &str,
        view: ReadView,
    ) -> Result<Shipment, ReconcileError> {
        self.read(async |tx| {
            let record = tx
                .get(EntityKind::Shipment, name)
                .await?
                .ok_or_else(|| ReconcileError::not_found(EntityKind::Shipment, name))?;
            let node = tree::load(tx, &self.codec, record, &[]).await?;
            Ok(node)
        })
        .await
        .and_then(|node| redacted(&node, view))
    }

    pub async fn get_environment(
        &self,
        shipment: &str,
        name: &str,
        view: ReadView,
    ) -> Result<Environment, ReconcileError> {
        let id = derive_id(&[shipment], name);
        self.read(async |tx| {
            let record = tx
                .get(EntityKind::Environment, &id)
                .await?
                .ok_or_else(|| ReconcileError::not_found(EntityKind::Environment, name))?;
            Ok(tree::load(tx, &self.codec, record, &[]).await?)
        })
        .await
        .and_then(|node| redacted(&node, view))
    }

    /// Environments of a shipment, sorted by name.
    pub async fn list_environments(
        &self,
        shipment: &str,
        view: ReadView,
    ) -> Result<Vec<Environment>, ReconcileError> {
        let nodes = self
            .read(async |tx| {
                if tx.get(EntityKind::Shipment, shipment).await?.is_none() {
                    return Err(ReconcileError::not_found(EntityKind::Shipment, shipment));
                }
                let owner = ParentRef::new(EntityKind::Shipment, shipment);
                let mut nodes = Vec::new();
                for record in tx.children(Some(&owner), EntityKind::Environment).await? {
                    nodes.push(tree::load(tx, &self.codec, record, &[]).await?);
                }
                Ok(nodes)
            })
            .await?;
        sorted_by_name(nodes, view)
    }

    /// Every shipment, sorted by name.
    pub async fn list_shipments(&self, view: ReadView) -> Result<Vec<Shipment>, ReconcileError> {
        let nodes = self
            .read(async |tx| {
                let mut nodes = Vec::new();
                for record in tx.children(None, EntityKind::Shipment).await? {
                    nodes.push(tree::load(tx, &self.codec, record, &[]).await?);
                }
                Ok(nodes)
            })
            .await?;
        sorted_by_name(nodes, view)
    }

    /// Audit trail of one environment, oldest first.
    pub async fn audit_log(
        &self,
        shipment: &str,
        environment: &str,
        view: ReadView,
    ) -> Result<Vec<AuditEntry>, ReconcileError> {
        let rows = self
            .read(async |tx| { Ok(tx.audit_rows(shipment, environment).await?) })
            .await?;
        AuditReader::new(self.codec.clone())
            .read(rows, view)
            .map_err(ReconcileError::codec)
    }

    /// Environment whose build token is `token`.
    pub async fn find_environment_by_build_token(
        &self,
        token: &str,
    ) -> Result<Option<BuildTarget>, ReconcileError> {
        let digest = self.codec.digest(token);
        let found = self
            .read(async |tx| {
                for record in tx.find_by_digest(EntityKind::Environment, BUILD_TOKEN, &digest).await? {
                    let Some(owner) = record.parent.clone() else {
                        continue;
                    };
                    let node = tree::load(tx, &self.codec, record, &[]).await?;
                    if node.field_str(BUILD_TOKEN) == Some(token) {
                        return Ok(Some((owner.id, node)));
                    }
                }
                Ok(None)
            })
            .await?;

        found
            .map(|(shipment, node)| {
                Ok(BuildTarget {
                    shipment,
                    environment: node.to_typed()?,
                })
            })
            .transpose()
    }

    /// Run `f` in a transaction that is always rolled back.
    async fn read<R>(
        &self,
        f: impl AsyncFnOnce(&S::Tx) -> Result<R, ReconcileError>,
    ) -> Result<R, ReconcileError> {
        let tx = self.store.begin().await?;
        let result = f(&tx).await;
        tx.rollback().await?;
        result
    }

    async fn dry_run(&self, target: &Target, incoming: Node) -> Result<Plan, ReconcileError> {
        let tx = self.store.begin().await?;
        let prepared = self.prepare(&tx, target, incoming).await;
        tx.rollback().await?;
        Ok(prepared?.plan)
    }

    async fn reconcile(
        &self,
        target: &Target,
        incoming: Node,
        actor: &Actor,
        reporter: &mut dyn Reporter,
    ) -> Result<Applied, ReconcileError> {
        let tx = self.store.begin().await?;
        let timeout = self.options.transaction_timeout;

        let result = tokio::time::timeout(
            timeout,
            self.apply(&tx, target, incoming, actor, &mut *reporter),
        )
        .await
        .unwrap_or_else(|_| Err(ReconcileError::Timeout(timeout)));

        match result {
            Ok(applied) => {
                tx.commit().await?;
                reporter.info(&format!(
                    "committed {} `{}` ({} audit row(s))",
                    target.root_kind,
                    target.root_id(),
                    applied.audit_rows
                ));
                Ok(applied)
            }
            Err(err) => {
                reporter.warn(&format!("rolling back {} `{}`: {err}", target.root_kind, target.root_id()));
                if let Err(rollback) = tx.rollback().await {
                    reporter.error(&format!("rollback failed: {rollback}"));
                }
                Err(err)
            }
        }
    }

    async fn apply(
        &self,
        tx: &S::Tx,
        target: &Target,
        incoming: Node,
        actor: &Actor,
        reporter: &mut dyn Reporter,
    ) -> Result<Applied, ReconcileError> {
        let Prepared { current, diff, plan } = self.prepare(tx, target, incoming).await?;
        reporter.info(&format!(
            "plan {}: {} operation(s) in {} batch(es); {}",
            short_id(&plan.plan_id),
            plan.len(),
            plan.batches.len(),
            plan.summary()
        ));

        let execution = execute(tx, &plan, self.options.max_concurrency, reporter).await?;

        let after = self
            .load_root(tx, target)
            .await?
            .ok_or_else(|| ReconcileError::Transaction(format!("`{}` vanished", target.root_id())))?;

        let audit_rows = self.audit(tx, target, current.as_ref(), &after, &diff, actor).await?;

        Ok(Applied {
            outcome: if current.is_some() { Outcome::Updated } else { Outcome::Created },
            root: after,
            plan,
            execution,
            audit_rows,
        })
    }

    async fn prepare(
        &self,
        tx: &S::Tx,
        target: &Target,
        mut incoming: Node,
    ) -> Result<Prepared, ReconcileError> {
        if let Some(parent) = &target.parent
            && tx.get(parent.kind, &parent.id).await?.is_none()
        {
            return Err(ReconcileError::not_found(parent.kind, parent.id.clone()));
        }

        let current = self.load_root(tx, target).await?;
        fill_build_token(&mut incoming, current.as_ref());

        let diff = TreeDiff::compute(
            current.as_ref(),
            &incoming,
            &target.ancestry,
            target.parent.clone(),
        );
        let plan = Plan::build(&diff, &self.codec)?;
        Ok(Prepared { current, diff, plan })
    }

    /// Root of `target` as stored, with only the named environment below a shipment.
    async fn load_root(&self, tx: &S::Tx, target: &Target) -> Result<Option<Node>, ReconcileError> {
        let root_id = target.root_id();
        let Some(record) = tx.get(target.root_kind, &root_id).await? else {
            return Ok(None);
        };
        let mut root = tree::load(tx, &self.codec, record, target.scoped()).await?;

        if target.root_kind == EntityKind::Shipment {
            let mut environments = Vec::new();
            if let Some(name) = &target.environment {
                let id = derive_id(&[target.shipment.as_str()], name);
                if let Some(record) = tx.get(EntityKind::Environment, &id).await? {
                    environments.push(tree::load(tx, &self.codec, record, &[]).await?);
                }
            }
            root.children.insert(ENVIRONMENTS, environments);
        }
        Ok(Some(root))
    }

    async fn audit(
        &self,
        tx: &S::Tx,
        target: &Target,
        before: Option<&Node>,
        after: &Node,
        diff: &TreeDiff,
        actor: &Actor,
    ) -> Result<usize, ReconcileError> {
        let recorder = AuditRecorder::new(self.codec.clone());
        let ctx = AuditContext {
            actor,
            shipment: &target.shipment,
            environment: target.environment.as_deref().unwrap_or_default(),
        };

        let mut rows = Vec::new();
        let before_value = before.map(Node::to_value).unwrap_or(Value::Null);
        rows.extend(
            recorder
                .record(&ctx, &after.name, &before_value, &after.to_value(), diff.touches_secret())
                .map_err(ReconcileError::codec)?,
        );
        for delete in diff.deletes.iter().filter(|d| !d.cascaded) {
            rows.extend(
                recorder
                    .record(
                        &ctx,
                        &delete.node.name,
                        &delete.node.to_value(),
                        &Value::Null,
                        delete.node.contains_secret(),
                    )
                    .map_err(ReconcileError::codec)?,
            );
        }

        let count = rows.len();
        for row in rows {
            tx.append_audit(row).await?;
        }
        Ok(count)
    }
}

/// Reconciliation applied inside a transaction, not yet typed.
struct Applied {
    outcome: Outcome,
    root: Node,
    plan: Plan,
    execution: ExecutionSummary,
    audit_rows: usize,
}

impl Applied {
    fn typed<T: serde::de::DeserializeOwned>(self) -> Result<Reconciled<T>, ReconcileError> {
        Ok(Reconciled {
            outcome: self.outcome,
            tree: self.root.to_typed()?,
            plan: self.plan,
            execution: self.execution,
            audit_rows: self.audit_rows,
        })
    }
}

fn parse_environment(shipment: &str, tree: &Value) -> Result<(Target, Node), ReconcileError> {
    let incoming = tree::parse(EntityKind::Environment, tree, "").map_err(ReconcileError::validation)?;
    let target = Target {
        shipment: shipment.to_string(),
        environment: Some(incoming.name.clone()),
        root_kind: EntityKind::Environment,
        ancestry: vec![shipment.to_string()],
        parent: Some(ParentRef::new(EntityKind::Shipment, shipment)),
    };
    Ok((target, incoming))
}

fn parse_shipment(tree: &Value) -> Result<(Target, Node), ReconcileError> {
    let mut errors = Vec::new();
    let shipment = tree::parse_into(EntityKind::Shipment, tree, "", &[ENVIRONMENTS], &mut errors);

    let environment = match tree.get(ENVIRONMENTS) {
        None | Some(Value::Null) => None,
        Some(Value::Array(items)) => items.first().and_then(|first| {
            tree::parse_into(
                EntityKind::Environment,
                first,
                &format!("{ENVIRONMENTS}[0]"),
                &[],
                &mut errors,
            )
        }),
        Some(_) => {
            errors.push(FieldError::new(ENVIRONMENTS, "must be an array"));
            None
        }
    };

    let mut shipment = match shipment {
        Some(node) if errors.is_empty() => node,
        _ => return Err(ReconcileError::validation(errors)),
    };

    let target = Target {
        shipment: shipment.name.clone(),
        environment: environment.as_ref().map(|e| e.name.clone()),
        root_kind: EntityKind::Shipment,
        ancestry: Vec::new(),
        parent: None,
    };
    shipment
        .children
        .insert(ENVIRONMENTS, environment.into_iter().collect());
    Ok((target, shipment))
}

/// Keep the stored build token when none is supplied; mint one for new environments.
fn fill_build_token(root: &mut Node, current: Option<&Node>) {
    let environment = match root.kind {
        EntityKind::Environment => Some(root),
        _ => root
            .children
            .get_mut(ENVIRONMENTS)
            .and_then(|envs| envs.first_mut()),
    };
    let Some(environment) = environment else {
        return;
    };
    if environment.fields.contains_key(BUILD_TOKEN) {
        return;
    }

    let stored = current
        .and_then(|c| match c.kind {
            EntityKind::Environment => Some(c),
            _ => c.children(ENVIRONMENTS).first(),
        })
        .filter(|c| c.name == environment.name)
        .and_then(|c| c.fields.get(BUILD_TOKEN).cloned());

    let token = stored.unwrap_or_else(|| Value::String(random_token()));
    environment.fields.insert(BUILD_TOKEN.to_string(), token);
}

fn redacted<T>(node: &Node, view: ReadView) -> Result<T, ReconcileError>
where
    T: serde::de::DeserializeOwned + Redact,
{
    let mut typed: T = node.to_typed()?;
    typed.redact_for(view);
    Ok(typed)
}

fn sorted_by_name<T>(mut nodes: Vec<Node>, view: ReadView) -> Result<Vec<T>, ReconcileError>
where
    T: serde::de::DeserializeOwned + Redact,
{
    nodes.sort_by(|a, b| a.name.cmp(&b.name));
    nodes.iter().map(|n| redacted(n, view)).collect()
}

fn short_id(plan_id: &str) -> &str {
    plan_id.get(..12).unwrap_or(plan_id)
}

//! Generic entity tree.
//!
//! Incoming JSON trees and trees loaded from the store are both turned into
//! [`Node`]s, so one diff walks every kind. A node holds plaintext field
//! values; ciphertext read from the store is kept on the side so unchanged
//! secrets can be written back as they were.

use std::collections::{BTreeMap, BTreeSet};

use futures::future::{BoxFuture, FutureExt};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use shipit_encrypt::FieldCodec;
use shipit_store::{Record, StoreError, Transaction};
use shipit_types::{EntityKind, ParentRef};

use crate::error::{FieldError, ReconcileError};
use crate::identity::validate_name;
use crate::schema::{self, PRIVATE_KEY};

#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub kind: EntityKind,
    pub name: String,
    /// Plaintext field values, defaults applied
    pub fields: Map<String, Value>,
    /// Child collections keyed by wire key (`envVars`, `ports`, ...)
    pub children: BTreeMap<&'static str, Vec<Node>>,
    /// Stored ciphertext of sealed fields whose plaintext is unchanged
    pub(crate) sealed: BTreeMap<String, String>,
}

impl Node {
    pub fn new(kind: EntityKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
            fields: Map::new(),
            children: BTreeMap::new(),
            sealed: BTreeMap::new(),
        }
    }

    pub fn children(&self, key: &str) -> &[Node] {
        self.children.get(key).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn field_str(&self, name: &str) -> Option<&str> {
        self.fields.get(name).and_then(Value::as_str)
    }

    /// Copy without child collections.
    pub fn shallow(&self) -> Node {
        Node {
            children: BTreeMap::new(),
            ..self.clone()
        }
    }

    /// Number of nodes in this subtree, itself included.
    pub fn count(&self) -> usize {
        1 + self.children.values().flatten().map(Node::count).sum::<usize>()
    }

    /// Wire representation: `name`, the fields, then every collection.
    pub fn to_value(&self) -> Value {
        let mut obj = Map::new();
        obj.insert("name".to_string(), Value::String(self.name.clone()));
        for (key, value) in &self.fields {
            obj.insert(key.clone(), value.clone());
        }
        for collection in self.kind.collections() {
            let items = self.children(collection.key).iter().map(Node::to_value).collect();
            obj.insert(collection.key.to_string(), Value::Array(items));
        }
        Value::Object(obj)
    }

    /// Typed read model of this subtree.
    pub fn to_typed<T: DeserializeOwned>(&self) -> Result<T, ReconcileError> {
        serde_json::from_value(self.to_value()).map_err(|e| {
            ReconcileError::Transaction(format!("stored {} `{}` is malformed: {e}", self.kind, self.name))
        })
    }

    /// Whether this node carries a value that only authenticated readers see.
    pub fn is_secret(&self) -> bool {
        match self.kind {
            EntityKind::EnvVar => self.field_str("type") == Some("hidden"),
            EntityKind::Port => self.field_str(PRIVATE_KEY).is_some_and(|k| !k.is_empty()),
            EntityKind::Environment => self.fields.contains_key(schema::BUILD_TOKEN),
            _ => false,
        }
    }

    /// Whether anything in this subtree is secret.
    pub fn contains_secret(&self) -> bool {
        self.is_secret() || self.children.values().flatten().any(Node::contains_secret)
    }
}

fn join_path(path: &str, key: &str) -> String {
    if path.is_empty() {
        key.to_string()
    } else {
        format!("{path}.{key}")
    }
}

/// Parse and validate an incoming tree rooted at `kind`.
///
/// Every problem is reported, each with its path below `path`.
pub fn parse(kind: EntityKind, value: &Value, path: &str) -> Result<Node, Vec<FieldError>> {
    let mut errors = Vec::new();
    let node = parse_into(kind, value, path, &[], &mut errors);
    match node {
        Some(node) if errors.is_empty() => Ok(node),
        _ => Err(errors),
    }
}

/// Like [`parse`], leaving out the collections named in `skip`.
pub(crate) fn parse_into(
    kind: EntityKind,
    value: &Value,
    path: &str,
    skip: &[&str],
    errors: &mut Vec<FieldError>,
) -> Option<Node> {
    let Some(obj) = value.as_object() else {
        errors.push(FieldError::new(path, "must be an object"));
        return None;
    };

    let name_path = join_path(path, "name");
    let name = match obj.get("name") {
        None | Some(Value::Null) => {
            errors.push(FieldError::new(name_path, "is required"));
            String::new()
        }
        Some(Value::String(name)) => {
            if let Err(message) = validate_name(kind, name) {
                errors.push(FieldError::new(name_path, message));
            }
            name.clone()
        }
        Some(_) => {
            errors.push(FieldError::new(name_path, "must be a string"));
            String::new()
        }
    };

    let mut node = Node::new(kind, name);

    for spec in schema::fields(kind) {
        let supplied = obj.get(spec.name).filter(|v| !v.is_null());
        match (supplied, spec.default) {
            (Some(raw), _) => match (spec.parse)(raw) {
                Ok(parsed) => {
                    node.fields.insert(spec.name.to_string(), parsed);
                }
                Err(message) => errors.push(FieldError::new(join_path(path, spec.name), message)),
            },
            (None, Some(default)) => {
                node.fields.insert(spec.name.to_string(), default());
            }
            (None, None) if spec.required => {
                errors.push(FieldError::new(join_path(path, spec.name), "is required"));
            }
            (None, None) => {}
        }
    }

    for collection in kind.collections() {
        if skip.contains(&collection.key) {
            continue;
        }
        let key_path = join_path(path, collection.key);
        let items: &[Value] = match obj.get(collection.key) {
            None | Some(Value::Null) => &[],
            Some(Value::Array(items)) => items,
            Some(_) => {
                errors.push(FieldError::new(key_path, "must be an array"));
                continue;
            }
        };

        let mut children = Vec::with_capacity(items.len());
        let mut seen = BTreeSet::new();
        for (i, item) in items.iter().enumerate() {
            let item_path = format!("{key_path}[{i}]");
            if let Some(child) = parse_into(collection.kind, item, &item_path, &[], errors) {
                if !child.name.is_empty() && !seen.insert(child.name.clone()) {
                    errors.push(FieldError::new(
                        join_path(&item_path, "name"),
                        format!("duplicate name `{}`", child.name),
                    ));
                }
                children.push(child);
            }
        }
        node.children.insert(collection.key, children);
    }

    check_kind_rules(&node, path, errors);
    Some(node)
}

fn check_kind_rules(node: &Node, path: &str, errors: &mut Vec<FieldError>) {
    match node.kind {
        EntityKind::Environment => {
            // Container and provider env vars share one id space.
            let containers: BTreeSet<&str> =
                node.children("containers").iter().map(|c| c.name.as_str()).collect();
            for (i, provider) in node.children("providers").iter().enumerate() {
                if containers.contains(provider.name.as_str()) {
                    errors.push(FieldError::new(
                        join_path(path, &format!("providers[{i}].name")),
                        format!("`{}` is already used by a container", provider.name),
                    ));
                }
            }
        }
        EntityKind::Container => {
            let primaries = node
                .children("ports")
                .iter()
                .enumerate()
                .filter(|(_, p)| p.fields.get("primary") == Some(&Value::Bool(true)));
            for (i, _) in primaries.skip(1) {
                errors.push(FieldError::new(
                    join_path(path, &format!("ports[{i}].primary")),
                    "only one port may be primary",
                ));
            }
        }
        _ => {}
    }
}

/// Node from a stored row, sealed fields opened.
///
/// Values that do not open under `codec` (written before a key was set) are
/// read as plaintext.
pub(crate) fn from_record(record: &Record, codec: &FieldCodec) -> Node {
    let mut node = Node::new(record.kind, record.name.clone());
    for (key, value) in &record.fields {
        let sealed = schema::field_spec(record.kind, key).is_some_and(|f| f.secret.is_sealed());
        match value {
            Value::String(stored) if sealed => {
                // Only real ciphertext is carried over; anything else is
                // sealed again on the next write.
                let plain = match codec.try_decrypt_field(stored) {
                    Ok(plain) => {
                        node.sealed.insert(key.clone(), stored.clone());
                        plain
                    }
                    Err(_) => stored.clone(),
                };
                node.fields.insert(key.clone(), Value::String(plain));
            }
            other => {
                node.fields.insert(key.clone(), other.clone());
            }
        }
    }
    node
}

/// Stored row for `node`, sealed fields encrypted and digests computed.
pub(crate) fn to_record(
    node: &Node,
    id: &str,
    parent: Option<ParentRef>,
    position: usize,
    codec: &FieldCodec,
) -> Result<Record, ReconcileError> {
    let mut record = Record::new(node.kind, id, parent, node.name.clone());
    record.position = position;

    for (key, value) in &node.fields {
        let spec = schema::field_spec(node.kind, key);
        match (spec, value) {
            (Some(spec), Value::String(plain)) if spec.secret.is_sealed() => {
                let stored = match node.sealed.get(key) {
                    Some(sealed) => sealed.clone(),
                    None => codec.encrypt_field(plain).map_err(ReconcileError::codec)?,
                };
                if spec.secret.is_hashed() {
                    record.digests.insert(key.clone(), codec.digest(plain));
                }
                record.fields.insert(key.clone(), Value::String(stored));
            }
            _ => {
                record.fields.insert(key.clone(), value.clone());
            }
        }
    }
    Ok(record)
}

/// Load the subtree below `record`, leaving out the collections named in `skip`.
pub(crate) fn load<'a, T: Transaction>(
    tx: &'a T,
    codec: &'a FieldCodec,
    record: Record,
    skip: &'a [&'a str],
) -> BoxFuture<'a, Result<Node, StoreError>> {
    async move {
        let mut node = from_record(&record, codec);
        let owner = record.parent_ref();
        for collection in record.kind.collections() {
            if skip.contains(&collection.key) {
                continue;
            }
            let mut children = Vec::new();
            for child in tx.children(Some(&owner), collection.kind).await? {
                children.push(load(tx, codec, child, &[]).await?);
            }
            node.children.insert(collection.key, children);
        }
        Ok(node)
    }
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use shipit_types::Environment;

    fn paths(errors: &[FieldError]) -> Vec<&str> {
        errors.iter().map(|e| e.path.as_str()).collect()
    }

    #[test]
    fn applies_defaults_and_coerces_values() {
        let env = parse(
            EntityKind::Environment,
            &json!({
                "name": "bar",
                "envVars": [{"name": "PORT", "value": 80}],
                "containers": [{"name": "web", "image": "nginx", "ports": [{"name": "http", "value": 8080}]}]
            }),
            "",
        )
        .expect("valid");

        assert_eq!(env.fields["enableMonitoring"], json!(true));
        assert_eq!(env.fields["iamRole"], json!(""));
        assert!(!env.fields.contains_key("buildToken"));

        let var = &env.children("envVars")[0];
        assert_eq!(var.fields["value"], json!("80"));
        assert_eq!(var.fields["type"], json!("basic"));

        let port = &env.children("containers")[0].children("ports")[0];
        assert_eq!(port.fields["protocol"], json!("http"));
        assert_eq!(port.fields["external"], json!(true));
        assert_eq!(port.fields["healthcheck_timeout"], json!(1));
        assert_eq!(port.fields["healthcheck_interval"], json!(10));
        assert_eq!(port.fields["ssl_management_type"], json!("iam"));
    }

    #[test]
    fn aggregates_every_error_with_its_path() {
        let errors = parse(
            EntityKind::Shipment,
            &json!({
                "name": "billing",
                "environments": [{
                    "name": "prod",
                    "containers": [
                        {"name": "api", "image": "api:1"},
                        {"name": "worker"}
                    ],
                    "providers": [{"name": "ec2", "replicas": -1}]
                }]
            }),
            "",
        )
        .expect_err("invalid");

        assert_eq!(
            paths(&errors),
            vec![
                "group",
                "environments[0].containers[1].image",
                "environments[0].providers[0].replicas",
                "environments[0].providers[0].barge",
            ]
        );
    }

    #[test]
    fn rejects_separator_in_names_below_the_shipment() {
        let errors = parse(
            EntityKind::Environment,
            &json!({"name": "blue-green", "envVars": [{"name": "A-B", "value": "x"}]}),
            "",
        )
        .expect_err("invalid");
        assert_eq!(paths(&errors), vec!["name", "envVars[0].name"]);
    }

    #[test]
    fn rejects_duplicate_sibling_names() {
        let errors = parse(
            EntityKind::Environment,
            &json!({"name": "bar", "envVars": [
                {"name": "A", "value": "1"},
                {"name": "A", "value": "2"}
            ]}),
            "",
        )
        .expect_err("duplicate");
        assert_eq!(errors, vec![FieldError::new("envVars[1].name", "duplicate name `A`")]);
    }

    #[test]
    fn container_and_provider_names_are_disjoint() {
        let errors = parse(
            EntityKind::Environment,
            &json!({
                "name": "bar",
                "containers": [{"name": "app", "image": "x"}],
                "providers": [{"name": "app", "barge": "corp"}]
            }),
            "",
        )
        .expect_err("clash");
        assert_eq!(paths(&errors), vec!["providers[0].name"]);
    }

    #[test]
    fn at_most_one_primary_port() {
        let errors = parse(
            EntityKind::Container,
            &json!({"name": "web", "image": "x", "ports": [
                {"name": "a", "value": 80, "primary": true},
                {"name": "b", "value": 81},
                {"name": "c", "value": 82, "primary": true}
            ]}),
            "containers[0]",
        )
        .expect_err("two primaries");
        assert_eq!(paths(&errors), vec!["containers[0].ports[2].primary"]);
    }

    #[test]
    fn wrong_shapes_are_reported() {
        let errors = parse(EntityKind::Environment, &json!({"name": "bar", "containers": {}}), "")
            .expect_err("shape");
        assert_eq!(errors, vec![FieldError::new("containers", "must be an array")]);

        let errors = parse(EntityKind::Environment, &json!(["bar"]), "").expect_err("shape");
        assert_eq!(errors, vec![FieldError::new("", "must be an object")]);
    }

    #[test]
    fn value_round_trips_into_the_typed_model() {
        let node = parse(
            EntityKind::Environment,
            &json!({
                "name": "bar",
                "buildToken": "tok",
                "providers": [{"name": "ec2", "barge": "corp", "replicas": 2}]
            }),
            "",
        )
        .expect("valid");

        let env: Environment = node.to_typed().expect("typed");
        assert_eq!(env.name, "bar");
        assert_eq!(env.build_token.as_deref(), Some("tok"));
        assert_eq!(env.providers[0].replicas, 2);
        assert!(env.containers.is_empty());
    }

    #[test]
    fn sealed_fields_reuse_stored_ciphertext() {
        let codec = FieldCodec::with_passphrase("tree-test");
        let mut var = Node::new(EntityKind::EnvVar, "KEY");
        var.fields.insert("value".into(), json!("secret"));
        var.fields.insert("type".into(), json!("hidden"));

        let first = to_record(&var, "s-e-KEY", None, 0, &codec).expect("record");
        let stored = first.fields["value"].as_str().expect("sealed").to_string();
        assert_ne!(stored, "secret");
        assert_eq!(first.digests["value"], codec.digest("secret"));

        let loaded = from_record(&first, &codec);
        assert_eq!(loaded.fields["value"], json!("secret"));

        let again = to_record(&loaded, "s-e-KEY", None, 0, &codec).expect("record");
        assert_eq!(again, first);
    }

    #[test]
    fn plaintext_rows_are_sealed_on_the_next_write() {
        let codec = FieldCodec::with_passphrase("tree-test");
        let mut var = Node::new(EntityKind::EnvVar, "KEY");
        var.fields.insert("value".into(), json!("secret"));
        var.fields.insert("type".into(), json!("hidden"));
        let plain = to_record(&var, "s-e-KEY", None, 0, &FieldCodec::passthrough()).expect("record");
        assert_eq!(plain.fields["value"], json!("secret"));

        let loaded = from_record(&plain, &codec);
        assert_eq!(loaded.fields["value"], json!("secret"));
        assert!(loaded.sealed.is_empty());

        let resealed = to_record(&loaded, "s-e-KEY", None, 0, &codec).expect("record");
        let stored = resealed.fields["value"].as_str().expect("sealed");
        assert_ne!(stored, "secret");
        assert_eq!(codec.try_decrypt_field(stored).expect("opens"), "secret");
    }

    #[test]
    fn secrets_are_detected_through_the_subtree() {
        let mut env = Node::new(EntityKind::Environment, "bar");
        let mut container = Node::new(EntityKind::Container, "web");
        let mut port = Node::new(EntityKind::Port, "https");
        port.fields.insert(PRIVATE_KEY.into(), json!(""));
        container.children.insert("ports", vec![port.clone()]);
        env.children.insert("containers", vec![container.clone()]);
        assert!(!env.contains_secret());

        port.fields.insert(PRIVATE_KEY.into(), json!("KEY"));
        container.children.insert("ports", vec![port]);
        env.children.insert("containers", vec![container]);
        assert!(env.contains_secret());
        assert_eq!(env.count(), 3);
    }
}

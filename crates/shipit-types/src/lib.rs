//! Core domain types for shipit.
//!
//! This crate provides the types shared across the shipit workspace: the
//! closed set of reconcilable [`EntityKind`]s and their child-collection
//! table, the typed read model returned to callers ([`Shipment`],
//! [`Environment`], ...), the [`Actor`] attributed in audit rows, and the
//! audit row types themselves.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Placeholder shown instead of secret values to unauthenticated readers.
pub const REDACTED: &str = "*******";

/// Every kind of node that takes part in a reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Shipment,
    Environment,
    Container,
    Provider,
    Port,
    EnvVar,
}

/// A named child collection of an entity kind, e.g. `Container.ports`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Collection {
    /// Key of the collection in the wire tree (`envVars`, `ports`, ...)
    pub key: &'static str,
    /// Kind of every element in the collection
    pub kind: EntityKind,
}

const SHIPMENT_CHILDREN: &[Collection] = &[
    Collection { key: "envVars", kind: EntityKind::EnvVar },
    Collection { key: "environments", kind: EntityKind::Environment },
];

const ENVIRONMENT_CHILDREN: &[Collection] = &[
    Collection { key: "envVars", kind: EntityKind::EnvVar },
    Collection { key: "containers", kind: EntityKind::Container },
    Collection { key: "providers", kind: EntityKind::Provider },
];

const CONTAINER_CHILDREN: &[Collection] = &[
    Collection { key: "envVars", kind: EntityKind::EnvVar },
    Collection { key: "ports", kind: EntityKind::Port },
];

const PROVIDER_CHILDREN: &[Collection] = &[Collection { key: "envVars", kind: EntityKind::EnvVar }];

impl EntityKind {
    pub const ALL: [EntityKind; 6] = [
        EntityKind::Shipment,
        EntityKind::Environment,
        EntityKind::Container,
        EntityKind::Provider,
        EntityKind::Port,
        EntityKind::EnvVar,
    ];

    /// Child collections owned by this kind, in wire order.
    pub fn collections(self) -> &'static [Collection] {
        match self {
            EntityKind::Shipment => SHIPMENT_CHILDREN,
            EntityKind::Environment => ENVIRONMENT_CHILDREN,
            EntityKind::Container => CONTAINER_CHILDREN,
            EntityKind::Provider => PROVIDER_CHILDREN,
            EntityKind::Port | EntityKind::EnvVar => &[],
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EntityKind::Shipment => "shipment",
            EntityKind::Environment => "environment",
            EntityKind::Container => "container",
            EntityKind::Provider => "provider",
            EntityKind::Port => "port",
            EntityKind::EnvVar => "env_var",
        }
    }
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reference from a stored row to the row that owns it.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ParentRef {
    pub kind: EntityKind,
    pub id: String,
}

impl ParentRef {
    pub fn new(kind: EntityKind, id: impl Into<String>) -> Self {
        Self { kind, id: id.into() }
    }
}

/// Classification of an environment variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvVarType {
    /// Plain configuration value
    #[default]
    Basic,
    /// Value resolved by service discovery at deploy time
    Discover,
    /// Secret value, redacted from unauthenticated reads and audit logs
    Hidden,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvVar {
    pub name: String,
    pub value: String,
    #[serde(rename = "type", default)]
    pub var_type: EnvVarType,
}

impl EnvVar {
    pub fn is_hidden(&self) -> bool {
        self.var_type == EnvVarType::Hidden
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    #[default]
    Http,
    Https,
    Tcp,
    Udp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SslManagementType {
    #[default]
    Iam,
    Acm,
}

/// A listening port of a container and its load-balancer settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Port {
    pub name: String,
    pub value: u16,
    #[serde(default)]
    pub protocol: Protocol,
    #[serde(default)]
    pub healthcheck: String,
    #[serde(default)]
    pub external: bool,
    #[serde(default)]
    pub primary: bool,
    #[serde(default)]
    pub public_vip: bool,
    #[serde(default)]
    pub public_port: u16,
    #[serde(default)]
    pub enable_proxy_protocol: bool,
    #[serde(default)]
    pub private_key: String,
    #[serde(default)]
    pub public_key_certificate: String,
    #[serde(default)]
    pub certificate_chain: String,
    #[serde(default)]
    pub ssl_arn: String,
    #[serde(default)]
    pub ssl_management_type: SslManagementType,
    #[serde(default)]
    pub healthcheck_timeout: u32,
    #[serde(default)]
    pub healthcheck_interval: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Container {
    pub name: String,
    pub image: String,
    #[serde(rename = "envVars", default)]
    pub env_vars: Vec<EnvVar>,
    #[serde(default)]
    pub ports: Vec<Port>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provider {
    pub name: String,
    #[serde(default)]
    pub replicas: u32,
    pub barge: String,
    #[serde(rename = "envVars", default)]
    pub env_vars: Vec<EnvVar>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Environment {
    pub name: String,
    #[serde(rename = "enableMonitoring", default)]
    pub enable_monitoring: bool,
    #[serde(rename = "iamRole", default)]
    pub iam_role: String,
    #[serde(rename = "buildToken", default, skip_serializing_if = "Option::is_none")]
    pub build_token: Option<String>,
    #[serde(rename = "envVars", default)]
    pub env_vars: Vec<EnvVar>,
    #[serde(default)]
    pub containers: Vec<Container>,
    #[serde(default)]
    pub providers: Vec<Provider>,
}

/// Top-level deployable application record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shipment {
    pub name: String,
    pub group: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contact_email: Option<String>,
    #[serde(rename = "envVars", default)]
    pub env_vars: Vec<EnvVar>,
    #[serde(default)]
    pub environments: Vec<Environment>,
}

fn redact_env_vars(vars: &mut [EnvVar]) {
    for var in vars.iter_mut().filter(|v| v.is_hidden()) {
        var.value = REDACTED.to_string();
    }
}

/// Read-side redaction of secret values.
pub trait Redact {
    /// Replace every hidden env var value, build token and private key with [`REDACTED`].
    fn redact(&mut self);

    /// Redact unless the reader is authenticated.
    fn redact_for(&mut self, view: ReadView) {
        if !view.authenticated {
            self.redact();
        }
    }
}

impl Redact for Container {
    fn redact(&mut self) {
        redact_env_vars(&mut self.env_vars);
        for port in self.ports.iter_mut().filter(|p| !p.private_key.is_empty()) {
            port.private_key = REDACTED.to_string();
        }
    }
}

impl Redact for Provider {
    fn redact(&mut self) {
        redact_env_vars(&mut self.env_vars);
    }
}

impl Redact for Environment {
    fn redact(&mut self) {
        if self.build_token.is_some() {
            self.build_token = Some(REDACTED.to_string());
        }
        redact_env_vars(&mut self.env_vars);
        self.containers.iter_mut().for_each(Redact::redact);
        self.providers.iter_mut().for_each(Redact::redact);
    }
}

impl Redact for Shipment {
    fn redact(&mut self) {
        redact_env_vars(&mut self.env_vars);
        self.environments.iter_mut().for_each(Redact::redact);
    }
}

/// Who is reading: decides whether secrets are shown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReadView {
    pub authenticated: bool,
}

impl ReadView {
    pub fn authenticated() -> Self {
        Self { authenticated: true }
    }

    pub fn anonymous() -> Self {
        Self { authenticated: false }
    }
}

/// Caller identity supplied by the authentication collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub username: String,
    /// Forces every audit row written on behalf of this actor to be hidden
    #[serde(default)]
    pub hidden: bool,
}

impl Actor {
    pub fn new(username: impl Into<String>) -> Self {
        Self { username: username.into(), hidden: false }
    }
}

/// Whether a reconciliation created its root or updated an existing one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Created,
    Updated,
}

impl Outcome {
    /// HTTP status the router answers with.
    pub fn status_code(self) -> u16 {
        match self {
            Outcome::Created => 201,
            Outcome::Updated => 200,
        }
    }
}

/// Immutable audit row as persisted. `diff` holds the sealed JSON patch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditRow {
    pub shipment: String,
    pub environment: String,
    pub user: String,
    pub name: String,
    pub hidden: bool,
    /// Epoch milliseconds
    pub updated: i64,
    pub diff: String,
}

impl AuditRow {
    pub fn updated_at(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_millis_opt(self.updated).single()
    }
}

/// Audit row as returned to readers, with the diff opened.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub shipment: String,
    pub environment: String,
    pub user: String,
    pub name: String,
    pub hidden: bool,
    pub updated: i64,
    pub diff: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn var(name: &str, value: &str, var_type: EnvVarType) -> EnvVar {
        EnvVar { name: name.to_string(), value: value.to_string(), var_type }
    }

    fn sample_shipment() -> Shipment {
        Shipment {
            name: "billing".to_string(),
            group: "payments".to_string(),
            contact_email: None,
            env_vars: vec![var("REGION", "us-east-1", EnvVarType::Basic)],
            environments: vec![Environment {
                name: "prod".to_string(),
                enable_monitoring: true,
                iam_role: String::new(),
                build_token: Some("token".to_string()),
                env_vars: vec![var("DB_PASSWORD", "hunter2", EnvVarType::Hidden)],
                containers: vec![Container {
                    name: "api".to_string(),
                    image: "registry/api:1.0".to_string(),
                    env_vars: vec![var("API_KEY", "abc", EnvVarType::Hidden)],
                    ports: vec![Port {
                        name: "https".to_string(),
                        value: 443,
                        protocol: Protocol::Https,
                        healthcheck: "/ping".to_string(),
                        external: true,
                        primary: true,
                        public_vip: false,
                        public_port: 443,
                        enable_proxy_protocol: false,
                        private_key: "-----BEGIN KEY-----".to_string(),
                        public_key_certificate: String::new(),
                        certificate_chain: String::new(),
                        ssl_arn: String::new(),
                        ssl_management_type: SslManagementType::Acm,
                        healthcheck_timeout: 1,
                        healthcheck_interval: 10,
                    }],
                }],
                providers: vec![Provider {
                    name: "ec2".to_string(),
                    replicas: 2,
                    barge: "corp".to_string(),
                    env_vars: vec![var("SECRET", "xyz", EnvVarType::Hidden)],
                }],
            }],
        }
    }

    #[test]
    fn collections_follow_the_schema_shape() {
        let keys: Vec<_> = EntityKind::Environment.collections().iter().map(|c| c.key).collect();
        assert_eq!(keys, vec!["envVars", "containers", "providers"]);
        assert!(EntityKind::Port.collections().is_empty());
        assert!(EntityKind::EnvVar.collections().is_empty());
    }

    #[test]
    fn entity_kind_serializes_as_snake_case() {
        let json = serde_json::to_string(&EntityKind::EnvVar).expect("serialize");
        assert_eq!(json, "\"env_var\"");
        assert_eq!(EntityKind::EnvVar.to_string(), "env_var");
    }

    #[test]
    fn redact_hides_every_hidden_var() {
        let mut shipment = sample_shipment();
        shipment.redact();

        assert_eq!(shipment.env_vars[0].value, "us-east-1");
        let env = &shipment.environments[0];
        assert_eq!(env.env_vars[0].value, REDACTED);
        assert_eq!(env.containers[0].env_vars[0].value, REDACTED);
        assert_eq!(env.providers[0].env_vars[0].value, REDACTED);
        assert_eq!(env.build_token.as_deref(), Some(REDACTED));
        assert_eq!(env.containers[0].ports[0].private_key, REDACTED);
    }

    #[test]
    fn redact_for_authenticated_view_keeps_values() {
        let mut shipment = sample_shipment();
        shipment.redact_for(ReadView::authenticated());
        assert_eq!(shipment.environments[0].env_vars[0].value, "hunter2");
        assert_eq!(shipment.environments[0].build_token.as_deref(), Some("token"));
    }

    #[test]
    fn wire_keys_match_the_tree_shape() {
        let value = serde_json::to_value(sample_shipment()).expect("serialize");
        let env = &value["environments"][0];
        assert!(env.get("enableMonitoring").is_some());
        assert!(env.get("buildToken").is_some());
        assert_eq!(env["envVars"][0]["type"], "hidden");
        assert!(value.get("contact_email").is_none());
    }

    #[test]
    fn outcome_maps_to_status_codes() {
        assert_eq!(Outcome::Created.status_code(), 201);
        assert_eq!(Outcome::Updated.status_code(), 200);
    }

    #[test]
    fn audit_row_exposes_timestamp() {
        let row = AuditRow {
            shipment: "s".into(),
            environment: "e".into(),
            user: "u".into(),
            name: "e".into(),
            hidden: false,
            updated: 1_700_000_000_000,
            diff: "[]".into(),
        };
        let at = row.updated_at().expect("valid millis");
        assert_eq!(at.timestamp_millis(), 1_700_000_000_000);
    }
}

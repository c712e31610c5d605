//! Static field tables of every entity kind.
//!
//! Each kind lists its fields once, with what a missing value defaults to,
//! how a supplied value is parsed into its stored form, and whether it is
//! sealed at rest and indexed by digest. Names and child collections are not
//! fields; they are handled by the tree.

use serde_json::{Value, json};
use shipit_types::EntityKind;

/// How a field is protected at rest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Secret {
    /// Stored as given
    Plain,
    /// Sealed with the field codec
    Encrypted,
    /// Sealed, plus a searchable digest of the plaintext
    EncryptedHashed,
}

impl Secret {
    pub fn is_sealed(self) -> bool {
        self != Secret::Plain
    }

    pub fn is_hashed(self) -> bool {
        self == Secret::EncryptedHashed
    }
}

/// Parser from wire value to stored value.
pub type Parser = fn(&Value) -> Result<Value, String>;

#[derive(Debug, Clone, Copy)]
pub struct FieldSpec {
    pub name: &'static str,
    pub required: bool,
    pub secret: Secret,
    /// Value used when the field is missing or null
    pub default: Option<fn() -> Value>,
    pub parse: Parser,
}

const fn field(name: &'static str, parse: Parser) -> FieldSpec {
    FieldSpec {
        name,
        required: false,
        secret: Secret::Plain,
        default: None,
        parse,
    }
}

const fn required(name: &'static str, parse: Parser) -> FieldSpec {
    FieldSpec {
        required: true,
        ..field(name, parse)
    }
}

const fn with_default(name: &'static str, parse: Parser, default: fn() -> Value) -> FieldSpec {
    FieldSpec {
        default: Some(default),
        ..field(name, parse)
    }
}

const fn sealed(spec: FieldSpec, secret: Secret) -> FieldSpec {
    FieldSpec { secret, ..spec }
}

const SHIPMENT_FIELDS: &[FieldSpec] = &[
    required("group", parse_string),
    field("contact_email", parse_string),
];

const ENVIRONMENT_FIELDS: &[FieldSpec] = &[
    with_default("enableMonitoring", parse_bool, || json!(true)),
    with_default("iamRole", parse_string, empty_string),
    sealed(field(BUILD_TOKEN, parse_token), Secret::EncryptedHashed),
];

const CONTAINER_FIELDS: &[FieldSpec] = &[required("image", parse_string)];

const PROVIDER_FIELDS: &[FieldSpec] = &[
    with_default("replicas", parse_u32, || json!(0)),
    required("barge", parse_string),
];

const PORT_FIELDS: &[FieldSpec] = &[
    required("value", parse_port_number),
    with_default("protocol", parse_protocol, || json!("http")),
    with_default("healthcheck", parse_string, empty_string),
    with_default("external", parse_bool, || json!(true)),
    with_default("primary", parse_bool, || json!(false)),
    with_default("public_vip", parse_bool, || json!(false)),
    with_default("public_port", parse_public_port, || json!(0)),
    with_default("enable_proxy_protocol", parse_bool, || json!(false)),
    sealed(with_default(PRIVATE_KEY, parse_string, empty_string), Secret::Encrypted),
    with_default("public_key_certificate", parse_string, empty_string),
    with_default("certificate_chain", parse_string, empty_string),
    with_default("ssl_arn", parse_string, empty_string),
    with_default("ssl_management_type", parse_ssl_management_type, || json!("iam")),
    with_default("healthcheck_timeout", parse_u32, || json!(1)),
    with_default("healthcheck_interval", parse_u32, || json!(10)),
];

const ENV_VAR_FIELDS: &[FieldSpec] = &[
    sealed(required("value", parse_var_value), Secret::EncryptedHashed),
    with_default("type", parse_var_type, || json!("basic")),
];

pub const BUILD_TOKEN: &str = "buildToken";
pub const PRIVATE_KEY: &str = "private_key";

/// Field table of `kind`, in wire order.
pub fn fields(kind: EntityKind) -> &'static [FieldSpec] {
    match kind {
        EntityKind::Shipment => SHIPMENT_FIELDS,
        EntityKind::Environment => ENVIRONMENT_FIELDS,
        EntityKind::Container => CONTAINER_FIELDS,
        EntityKind::Provider => PROVIDER_FIELDS,
        EntityKind::Port => PORT_FIELDS,
        EntityKind::EnvVar => ENV_VAR_FIELDS,
    }
}

pub fn field_spec(kind: EntityKind, name: &str) -> Option<&'static FieldSpec> {
    fields(kind).iter().find(|f| f.name == name)
}

fn empty_string() -> Value {
    json!("")
}

fn parse_string(value: &Value) -> Result<Value, String> {
    match value {
        Value::String(_) => Ok(value.clone()),
        _ => Err("must be a string".to_string()),
    }
}

fn parse_token(value: &Value) -> Result<Value, String> {
    match value.as_str() {
        Some("") => Err("must not be empty".to_string()),
        Some(_) => Ok(value.clone()),
        None => Err("must be a string".to_string()),
    }
}

fn parse_bool(value: &Value) -> Result<Value, String> {
    match value {
        Value::Bool(_) => Ok(value.clone()),
        _ => Err("must be a boolean".to_string()),
    }
}

fn parse_u32(value: &Value) -> Result<Value, String> {
    value
        .as_u64()
        .filter(|n| u32::try_from(*n).is_ok())
        .map(Value::from)
        .ok_or_else(|| "must be a non-negative integer".to_string())
}

fn parse_port_number(value: &Value) -> Result<Value, String> {
    match value.as_u64() {
        Some(n @ 1..=65535) => Ok(Value::from(n)),
        _ => Err("must be an integer between 1 and 65535".to_string()),
    }
}

fn parse_public_port(value: &Value) -> Result<Value, String> {
    match value.as_u64() {
        Some(n @ 0..=65535) => Ok(Value::from(n)),
        _ => Err("must be an integer between 0 and 65535".to_string()),
    }
}

fn one_of(value: &Value, allowed: &[&str]) -> Result<Value, String> {
    match value.as_str() {
        Some(s) if allowed.contains(&s) => Ok(value.clone()),
        _ => Err(format!("must be one of: {}", allowed.join(", "))),
    }
}

fn parse_protocol(value: &Value) -> Result<Value, String> {
    one_of(value, &["http", "https", "tcp", "udp"])
}

fn parse_ssl_management_type(value: &Value) -> Result<Value, String> {
    one_of(value, &["iam", "acm"])
}

fn parse_var_type(value: &Value) -> Result<Value, String> {
    one_of(value, &["basic", "discover", "hidden"])
}

/// Env var values are strings; numbers and booleans are taken as their text.
fn parse_var_value(value: &Value) -> Result<Value, String> {
    match value {
        Value::String(_) => Ok(value.clone()),
        Value::Number(n) => Ok(Value::String(n.to_string())),
        Value::Bool(b) => Ok(Value::String(b.to_string())),
        _ => Err("must be a string".to_string()),
    }
}

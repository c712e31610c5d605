//! Composite identifiers.
//!
//! Every stored row is keyed by the names on its ancestry path joined with
//! [`SEPARATOR`], root first. `test-group` / `bar` / `PORT` becomes
//! `test-group-bar-PORT`.
//!
//! Only shipment names may contain the separator. Every other name is
//! rejected by [`validate_name`] before an id is derived from it, which keeps
//! ids of one kind from colliding.

use shipit_types::EntityKind;

pub const SEPARATOR: char = '-';

/// Id of the entity called `name` below `ancestry` (root first).
pub fn derive_id<S: AsRef<str>>(ancestry: &[S], name: &str) -> String {
    let mut id = String::new();
    for segment in ancestry {
        id.push_str(segment.as_ref());
        id.push(SEPARATOR);
    }
    id.push_str(name);
    id
}

/// Check a user-supplied name for `kind`.
pub fn validate_name(kind: EntityKind, name: &str) -> Result<(), String> {
    if name.is_empty() {
        return Err("must not be empty".to_string());
    }

    let allow_separator = kind == EntityKind::Shipment;
    let bad = name.chars().find(|&c| {
        !(c.is_ascii_alphanumeric() || c == '_' || c == '.' || (allow_separator && c == SEPARATOR))
    });

    match bad {
        Some(c) if c == SEPARATOR => Err(format!("must not contain `{SEPARATOR}`")),
        Some(c) => Err(format!("contains invalid character `{c}`")),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn joins_ancestry_root_first() {
        assert_eq!(derive_id(&["test-group", "bar"], "PORT"), "test-group-bar-PORT");
        assert_eq!(derive_id::<&str>(&[], "billing"), "billing");
    }

    #[test]
    fn is_deterministic_and_tracks_ancestors() {
        let a = derive_id(&["a", "b"], "c");
        assert_eq!(a, derive_id(&["a", "b"], "c"));
        assert_ne!(a, derive_id(&["a", "x"], "c"));
        assert_ne!(a, derive_id(&["a", "b"], "d"));
    }

    #[test]
    fn only_shipments_may_contain_the_separator() {
        assert!(validate_name(EntityKind::Shipment, "test-group").is_ok());
        assert_eq!(
            validate_name(EntityKind::Environment, "a-b"),
            Err("must not contain `-`".to_string())
        );
        assert!(validate_name(EntityKind::EnvVar, "DB_HOST").is_ok());
        assert!(validate_name(EntityKind::Port, "http.alt").is_ok());
    }

    #[test]
    fn rejects_empty_and_odd_names() {
        assert!(validate_name(EntityKind::Container, "").is_err());
        assert_eq!(
            validate_name(EntityKind::Container, "api server"),
            Err("contains invalid character ` `".to_string())
        );
        assert!(validate_name(EntityKind::Shipment, "billing/api").is_err());
    }
}

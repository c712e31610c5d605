//! Property-based tests for reconciliation invariants.
//!
//! These tests verify properties that should hold for all inputs:
//! - Id determinism: the same path always yields the same id
//! - Deletion completeness: exactly the missing names are deleted
//! - Plan ordering: deletes first, parents before children
//! - Idempotence: repeating a reconciliation writes nothing

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use proptest::prelude::*;
    use serde_json::{Value, json};
    use shipit_encrypt::FieldCodec;
    use shipit_store::MemoryStore;
    use shipit_types::{Actor, EntityKind, ParentRef};

    use crate::diff::{Change, TreeDiff};
    use crate::engine::tests::CollectingReporter;
    use crate::identity::{derive_id, validate_name};
    use crate::plan::{Method, Plan};
    use crate::reconcile::Reconciler;
    use crate::tree::{Node, parse};

    /// Names valid for every non-shipment kind
    fn name_strategy() -> impl Strategy<Value = String> {
        "[A-Za-z_][A-Za-z0-9_.]{0,11}"
    }

    fn names_strategy(max: usize) -> impl Strategy<Value = BTreeSet<String>> {
        prop::collection::btree_set(name_strategy(), 0..max)
    }

    fn env_with_vars(names: &BTreeSet<String>) -> Node {
        let vars: Vec<Value> = names.iter().map(|n| json!({"name": n, "value": n})).collect();
        parse(EntityKind::Environment, &json!({"name": "bar", "envVars": vars}), "").unwrap()
    }

    fn env_with_containers(containers: &[(String, BTreeSet<String>)]) -> Node {
        let containers: Vec<Value> = containers
            .iter()
            .enumerate()
            .map(|(i, (name, ports))| {
                let ports: Vec<Value> = ports
                    .iter()
                    .enumerate()
                    .map(|(p, port)| json!({"name": port, "value": 8000 + i * 100 + p}))
                    .collect();
                json!({"name": name, "image": "img", "ports": ports})
            })
            .collect();
        parse(EntityKind::Environment, &json!({"name": "bar", "containers": containers}), "").unwrap()
    }

    fn containers_strategy() -> impl Strategy<Value = Vec<(String, BTreeSet<String>)>> {
        prop::collection::btree_map(name_strategy(), names_strategy(4), 0..4)
            .prop_map(|m| m.into_iter().collect())
    }

    fn compute(current: Option<&Node>, incoming: &Node) -> TreeDiff {
        TreeDiff::compute(
            current,
            incoming,
            &["test-group".to_string()],
            Some(ParentRef::new(EntityKind::Shipment, "test-group")),
        )
    }

    proptest! {
        /// Property: ids depend only on the path, and split back into it
        #[test]
        fn derive_id_is_deterministic(
            shipment in "[a-z][a-z0-9]{0,7}",
            path in prop::collection::vec(name_strategy(), 1..5),
        ) {
            let (name, ancestry) = path.split_last().unwrap();
            let mut full = vec![shipment];
            full.extend(ancestry.iter().cloned());

            let a = derive_id(&full, name);
            let b = derive_id(&full, name);
            prop_assert_eq!(&a, &b);

            let parts: Vec<&str> = a.split('-').collect();
            prop_assert_eq!(parts.len(), full.len() + 1);
            prop_assert_eq!(parts.last().copied(), Some(name.as_str()));
        }

        /// Property: generated names pass validation for nested kinds
        #[test]
        fn generated_names_are_valid(name in name_strategy()) {
            prop_assert!(validate_name(EntityKind::EnvVar, &name).is_ok());
            let dashed = format!("{name}-x");
            prop_assert!(validate_name(EntityKind::EnvVar, &dashed).is_err());
            prop_assert!(validate_name(EntityKind::Shipment, &dashed).is_ok());
        }

        /// Property: exactly the current names missing from the incoming tree are deleted
        #[test]
        fn deletes_exactly_the_missing_names(
            current in names_strategy(8),
            incoming in names_strategy(8),
        ) {
            let diff = compute(Some(&env_with_vars(&current)), &env_with_vars(&incoming));

            let deleted: BTreeSet<String> = diff.deletes.iter().map(|d| d.node.name.clone()).collect();
            let expected: BTreeSet<String> = current.difference(&incoming).cloned().collect();
            prop_assert_eq!(deleted, expected);

            let created: BTreeSet<String> = diff
                .upserts
                .iter()
                .filter(|u| u.change == Change::Created)
                .map(|u| u.node.name.clone())
                .collect();
            let expected: BTreeSet<String> = incoming.difference(&current).cloned().collect();
            prop_assert_eq!(created, expected);

            prop_assert_eq!(diff.upserts.len(), incoming.len() + 1);
        }

        /// Property: deletes come first, deepest first; upserts follow shallowest first
        #[test]
        fn plan_orders_by_dependency(
            current in containers_strategy(),
            incoming in containers_strategy(),
        ) {
            let diff = compute(Some(&env_with_containers(&current)), &env_with_containers(&incoming));
            let plan = Plan::build(&diff, &FieldCodec::passthrough()).unwrap();

            let ops: Vec<_> = plan.operations().collect();
            let first_upsert = ops.iter().position(|op| op.method == Method::Upsert).unwrap();
            prop_assert!(ops[first_upsert..].iter().all(|op| op.method == Method::Upsert));

            let delete_depths: Vec<usize> = ops[..first_upsert].iter().map(|op| op.depth).collect();
            prop_assert!(delete_depths.windows(2).all(|w| w[0] >= w[1]));

            let upsert_depths: Vec<usize> = ops[first_upsert..].iter().map(|op| op.depth).collect();
            prop_assert!(upsert_depths.windows(2).all(|w| w[0] <= w[1]));

            let mut written = BTreeSet::from([(EntityKind::Shipment, "test-group".to_string())]);
            for op in &ops[first_upsert..] {
                let record = op.record.as_ref().unwrap();
                let parent = record.parent.as_ref().unwrap();
                prop_assert!(written.contains(&(parent.kind, parent.id.clone())), "{} before its parent", op.id);
                written.insert((op.kind, op.id.clone()));
            }
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]

        /// Property: a repeated reconciliation changes no row and logs nothing
        #[test]
        fn reconcile_is_idempotent(names in names_strategy(6), hidden in any::<bool>()) {
            let var_type = if hidden { "hidden" } else { "basic" };
            let vars: Vec<Value> = names
                .iter()
                .map(|n| json!({"name": n, "value": format!("v-{n}"), "type": var_type}))
                .collect();
            let tree = json!({"name": "test-group", "group": "g", "environments": [{"name": "bar", "envVars": vars}]});

            let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
            rt.block_on(async {
                let store = MemoryStore::new();
                let reconciler = Reconciler::new(store.clone(), FieldCodec::with_passphrase("prop"));
                let actor = Actor::new("prop");
                let mut reporter = CollectingReporter::default();

                reconciler.reconcile_shipment(&tree, &actor, &mut reporter).await.unwrap();
                let before = store.tables().unwrap();

                let again = reconciler.reconcile_shipment(&tree, &actor, &mut reporter).await.unwrap();
                assert_eq!(again.audit_rows, 0);
                assert_eq!(store.tables().unwrap(), before);
            });
        }
    }
}

//! Proptest generators for property-based testing.

use std::collections::BTreeSet;

use proptest::prelude::*;
use proptest::sample::Index;

use proofnet_core::{Keypair, NodeId, Person, PersonDetails, Statement, StatementBuilder, StatementKind, Uuid};

/// Generate a random keypair.
pub fn keypair() -> impl Strategy<Value = Keypair> {
    any::<[u8; 32]>().prop_map(|seed| Keypair::from_seed(&seed))
}

/// Generate a random node identity.
pub fn node_id() -> impl Strategy<Value = NodeId> {
    any::<[u8; 16]>().prop_map(NodeId::from_bytes)
}

/// A root context followed by up to `max` statements in creation order.
///
/// Each statement lives in the root or in an earlier nested context and
/// may depend on up to three earlier statements, so every reference points
/// backwards.
pub fn statement_dag(max: usize) -> impl Strategy<Value = Vec<Statement>> {
    let shape = (any::<bool>(), any::<Index>(), prop::collection::vec(any::<Index>(), 0..3));
    prop::collection::vec(shape, 0..=max).prop_map(|shapes| {
        let root = StatementBuilder::root_context().build();
        let mut contexts = vec![root.uuid];
        let mut all = vec![root];
        for (is_context, context, deps) in shapes {
            let context = contexts[context.index(contexts.len())];
            let kind = if is_context {
                StatementKind::Context
            } else {
                StatementKind::Axiom
            };
            let mut builder = StatementBuilder::new(kind).context(context);
            let mut seen = BTreeSet::new();
            for dep in deps {
                let target = all[dep.index(all.len())].uuid;
                if target != context && seen.insert(target) {
                    builder = builder.depends_on(target);
                }
            }
            let statement = builder.build();
            if is_context {
                contexts.push(statement.uuid);
            }
            all.push(statement);
        }
        all
    })
}

/// Successive signed versions of one person, in arbitrary timestamp order.
pub fn person_history(max: usize) -> impl Strategy<Value = Vec<Person>> {
    (
        any::<[u8; 32]>(),
        any::<u128>(),
        prop::collection::vec(0i64..1_000, 1..=max.max(1)),
    )
        .prop_map(|(seed, id, stamps)| {
            let keypair = Keypair::from_seed(&seed);
            let uuid = Uuid::from_u128(id);
            stamps
                .into_iter()
                .enumerate()
                .map(|(i, at)| Person::signed(uuid, &keypair, PersonDetails::nick(format!("v{i}")), at))
                .collect()
        })
}

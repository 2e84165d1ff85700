use std::sync::Arc;

use rand::{rngs::StdRng, Rng, SeedableRng};
use tracing_test::traced_test;

use crate::{
    field::string::HeapString,
    graph::{Graph, GraphError},
    heap::store::MemStore,
    schema::{DeletionSemantics, SchemaRegistry, StructDef, TypeId},
};

fn graph(registry: SchemaRegistry) -> Graph<MemStore> {
    Graph::new(MemStore::new(), false, Arc::new(registry)).expect("failed to create graph")
}

#[test]
#[traced_test]
fn int_and_pointer_attributes() {
    let mut registry = SchemaRegistry::new();
    let mut def = StructDef::new_node("thing", TypeId(1));
    let count = def.add_int("count");
    let link = def.add_pointer("link");
    registry.register(def.done(), DeletionSemantics::Explicit);

    let mut g = graph(registry);
    let a = g.create_node(TypeId(1)).unwrap();
    let b = g.create_node(TypeId(1)).unwrap();
    assert_eq!(count.get(&mut g, a).unwrap(), 0);
    count.put(&mut g, a, 7).unwrap();
    link.put(&mut g, a, b).unwrap();
    assert_eq!(count.get(&mut g, a).unwrap(), 7);
    assert_eq!(link.get(&mut g, a).unwrap(), b);
}

#[test]
#[traced_test]
fn string_attribute_roundtrip() {
    let mut registry = SchemaRegistry::new();
    let mut def = StructDef::new_node("labeled", TypeId(1));
    let label = def.add_string("label");
    registry.register(def.done(), DeletionSemantics::Explicit);

    let mut g = graph(registry);
    let a = g.create_node(TypeId(1)).unwrap();
    assert_eq!(label.get(&mut g, a).unwrap(), HeapString::Empty);
    label.put(&mut g, a, "first").unwrap();
    assert_eq!(
        label.get(&mut g, a).unwrap(),
        HeapString::Interned("first".into())
    );
    label.put(&mut g, a, "second value, rather longer").unwrap();
    assert_eq!(
        label.get(&mut g, a).unwrap().as_str(),
        "second value, rather longer"
    );
    // storing "" drops back to the null representation
    label.put(&mut g, a, "").unwrap();
    assert_eq!(label.get(&mut g, a).unwrap(), HeapString::Empty);
}

#[test]
#[traced_test]
fn string_put_skips_equal_content() {
    let mut registry = SchemaRegistry::new();
    let mut def = StructDef::new_node("labeled", TypeId(1));
    let label = def.add_string("label");
    registry.register(def.done(), DeletionSemantics::Explicit);

    let mut g = graph(registry);
    let a = g.create_node(TypeId(1)).unwrap();
    label.put(&mut g, a, "stable").unwrap();
    let raw = g.heap.get_ptr(a.offset(label.offset() as u64)).unwrap();
    label.put(&mut g, a, "stable").unwrap();
    let raw_after = g.heap.get_ptr(a.offset(label.offset() as u64)).unwrap();
    assert_eq!(raw, raw_after, "equal content must not be re-interned");
    label.put(&mut g, a, "changed").unwrap();
    assert_ne!(
        raw,
        g.heap.get_ptr(a.offset(label.offset() as u64)).unwrap()
    );
}

#[test]
#[traced_test]
fn relationship_roundtrip() {
    let mut registry = SchemaRegistry::new();
    let mut target_def = StructDef::new_node("target", TypeId(1));
    let referrers = target_def.add_one_to_many("referrers");
    let mut ref_def = StructDef::new_node("referrer", TypeId(2));
    let points_at = ref_def.add_many_to_one("points_at", &referrers);
    registry.register(target_def.done(), DeletionSemantics::Explicit);
    registry.register(ref_def.done(), DeletionSemantics::Explicit);

    let mut g = graph(registry);
    let t = g.create_node(TypeId(1)).unwrap();
    let r = g.create_node(TypeId(2)).unwrap();

    assert!(referrers.is_empty(&mut g, t).unwrap());
    assert_eq!(points_at.get_opt(&mut g, r).unwrap(), None);

    points_at.put(&mut g, r, t).unwrap();
    assert_eq!(points_at.get(&mut g, r).unwrap(), t);
    assert_eq!(referrers.get(&mut g, t).unwrap(), vec![r]);

    // putting the current target again must not duplicate the entry
    points_at.put(&mut g, r, t).unwrap();
    assert_eq!(referrers.size(&mut g, t).unwrap(), 1);

    points_at.put(&mut g, r, crate::Ptr::null()).unwrap();
    assert_eq!(points_at.get_opt(&mut g, r).unwrap(), None);
    assert!(referrers.is_empty(&mut g, t).unwrap());
}

#[test]
#[traced_test]
fn repointing_moves_the_back_pointer() {
    let mut registry = SchemaRegistry::new();
    let mut target_def = StructDef::new_node("target", TypeId(1));
    let referrers = target_def.add_one_to_many("referrers");
    let mut ref_def = StructDef::new_node("referrer", TypeId(2));
    let points_at = ref_def.add_many_to_one("points_at", &referrers);
    registry.register(target_def.done(), DeletionSemantics::Explicit);
    registry.register(ref_def.done(), DeletionSemantics::Explicit);

    let mut g = graph(registry);
    let t1 = g.create_node(TypeId(1)).unwrap();
    let t2 = g.create_node(TypeId(1)).unwrap();
    let r = g.create_node(TypeId(2)).unwrap();

    points_at.put(&mut g, r, t1).unwrap();
    points_at.put(&mut g, r, t2).unwrap();
    assert!(referrers.is_empty(&mut g, t1).unwrap());
    assert_eq!(referrers.get(&mut g, t2).unwrap(), vec![r]);
    assert_eq!(points_at.get(&mut g, r).unwrap(), t2);
}

#[test]
#[traced_test]
fn back_pointer_list_survives_swap_removal() {
    let mut registry = SchemaRegistry::new();
    let mut target_def = StructDef::new_node("target", TypeId(1));
    let referrers = target_def.add_one_to_many("referrers");
    let mut ref_def = StructDef::new_node("referrer", TypeId(2));
    let points_at = ref_def.add_many_to_one("points_at", &referrers);
    registry.register(target_def.done(), DeletionSemantics::Explicit);
    registry.register(ref_def.done(), DeletionSemantics::Explicit);

    let mut g = graph(registry);
    let t = g.create_node(TypeId(1)).unwrap();
    let r1 = g.create_node(TypeId(2)).unwrap();
    let r2 = g.create_node(TypeId(2)).unwrap();
    let r3 = g.create_node(TypeId(2)).unwrap();
    for r in [r1, r2, r3] {
        points_at.put(&mut g, r, t).unwrap();
    }
    assert_eq!(referrers.size(&mut g, t).unwrap(), 3);

    // removing the first entry swaps the last one into its slot; the moved
    // record's stored index must keep tracking it
    points_at.put(&mut g, r1, crate::Ptr::null()).unwrap();
    let mut remaining = referrers.get(&mut g, t).unwrap();
    remaining.sort_by_key(|p| p.addr);
    assert_eq!(remaining, vec![r2, r3]);

    points_at.put(&mut g, r3, crate::Ptr::null()).unwrap();
    assert_eq!(referrers.get(&mut g, t).unwrap(), vec![r2]);
    points_at.put(&mut g, r2, crate::Ptr::null()).unwrap();
    assert!(referrers.is_empty(&mut g, t).unwrap());
}

#[test]
#[traced_test]
fn growing_past_the_initial_block_capacity() {
    let mut registry = SchemaRegistry::new();
    let mut target_def = StructDef::new_node("target", TypeId(1));
    let referrers = target_def.add_one_to_many("referrers");
    let mut ref_def = StructDef::new_node("referrer", TypeId(2));
    let points_at = ref_def.add_many_to_one("points_at", &referrers);
    registry.register(target_def.done(), DeletionSemantics::Explicit);
    registry.register(ref_def.done(), DeletionSemantics::Explicit);

    let mut g = graph(registry);
    let t = g.create_node(TypeId(1)).unwrap();
    let rs = (0..23)
        .map(|_| {
            let r = g.create_node(TypeId(2)).unwrap();
            points_at.put(&mut g, r, t).unwrap();
            r
        })
        .collect::<Vec<_>>();
    assert_eq!(referrers.size(&mut g, t).unwrap(), 23);
    for r in &rs {
        assert_eq!(points_at.get(&mut g, *r).unwrap(), t);
    }
    // detach them all, in an order that exercises the swap path
    for r in rs.iter().rev() {
        points_at.put(&mut g, *r, crate::Ptr::null()).unwrap();
    }
    assert!(referrers.is_empty(&mut g, t).unwrap());
}

#[test]
#[traced_test]
fn null_in_non_nullable_field_is_corruption() {
    let mut registry = SchemaRegistry::new();
    let mut target_def = StructDef::new_node("target", TypeId(1));
    let referrers = target_def.add_one_to_many("referrers");
    let mut ref_def = StructDef::new_node("referrer", TypeId(2));
    let points_at = ref_def.add_many_to_one("points_at", &referrers);
    points_at.permit_null(false);
    registry.register(target_def.done(), DeletionSemantics::Explicit);
    registry.register(ref_def.done(), DeletionSemantics::Explicit);

    let mut g = graph(registry);
    let r = g.create_node(TypeId(2)).unwrap();
    // freshly created records are zeroed, so the field reads as null
    match points_at.get(&mut g, r) {
        Err(GraphError::Corrupt(problem)) => {
            let text = problem.to_string();
            assert!(text.contains("referrer.points_at"), "report was: {text}");
        }
        other => panic!("expected a corruption report, got {other:?}"),
    }
    // but get_opt treats it as an ordinary absent value
    assert_eq!(points_at.get_opt(&mut g, r).unwrap(), None);
}

#[test]
#[traced_test]
fn orphaned_records_are_scheduled() {
    let mut registry = SchemaRegistry::new();
    let mut parent_def = StructDef::new_node("parent", TypeId(1));
    let children = parent_def.add_one_to_many("children");
    let mut child_def = StructDef::new_node("child", TypeId(2));
    let owner = child_def.add_owner_many_to_one("owner", &children);
    registry.register(parent_def.done(), DeletionSemantics::Explicit);
    registry.register(child_def.done(), DeletionSemantics::Explicit);

    let mut g = graph(registry);
    let p = g.create_node(TypeId(1)).unwrap();
    let c = g.create_node(TypeId(2)).unwrap();
    owner.put(&mut g, c, p).unwrap();

    assert!(!g.has_pending_deletions());
    owner.put(&mut g, c, crate::Ptr::null()).unwrap();
    assert!(g.has_pending_deletions());
    assert_eq!(g.process_deletions().unwrap(), 1);
    assert!(children.is_empty(&mut g, p).unwrap());
}

#[test]
#[traced_test]
fn deleting_a_parent_cascades_to_owned_children() {
    let mut registry = SchemaRegistry::new();
    let mut parent_def = StructDef::new_node("parent", TypeId(1));
    let name = parent_def.add_string("name");
    let children = parent_def.add_one_to_many("children");
    let mut child_def = StructDef::new_node("child", TypeId(2));
    let owner = child_def.add_owner_many_to_one("owner", &children);
    let child_name = child_def.add_string("name");
    registry.register(parent_def.done(), DeletionSemantics::Explicit);
    registry.register(child_def.done(), DeletionSemantics::Explicit);

    let mut g = graph(registry);
    let p = g.create_node(TypeId(1)).unwrap();
    name.put(&mut g, p, "root").unwrap();
    for i in 0..5 {
        let c = g.create_node(TypeId(2)).unwrap();
        owner.put(&mut g, c, p).unwrap();
        child_name.put(&mut g, c, &format!("child {i}")).unwrap();
    }
    assert_eq!(children.size(&mut g, p).unwrap(), 5);

    g.schedule_deletion(p);
    // the parent plus all five owned children go down together
    assert_eq!(g.process_deletions().unwrap(), 6);
    assert!(!g.has_pending_deletions());
}

#[test]
#[traced_test]
fn cascade_travels_through_grandchildren() {
    let mut registry = SchemaRegistry::new();
    let mut parent_def = StructDef::new_node("parent", TypeId(1));
    let children = parent_def.add_one_to_many("children");
    let mut child_def = StructDef::new_node("child", TypeId(2));
    let owner = child_def.add_owner_many_to_one("owner", &children);
    let grandchildren = child_def.add_one_to_many("grandchildren");
    let mut grand_def = StructDef::new_node("grandchild", TypeId(3));
    let grand_owner = grand_def.add_owner_many_to_one("owner", &grandchildren);
    registry.register(parent_def.done(), DeletionSemantics::Explicit);
    registry.register(child_def.done(), DeletionSemantics::Explicit);
    registry.register(grand_def.done(), DeletionSemantics::Explicit);

    let mut g = graph(registry);
    let p = g.create_node(TypeId(1)).unwrap();
    let mut total = 1;
    for _ in 0..3 {
        let c = g.create_node(TypeId(2)).unwrap();
        owner.put(&mut g, c, p).unwrap();
        total += 1;
        for _ in 0..2 {
            let gc = g.create_node(TypeId(3)).unwrap();
            grand_owner.put(&mut g, gc, c).unwrap();
            total += 1;
        }
    }
    g.schedule_deletion(p);
    assert_eq!(g.process_deletions().unwrap(), total);
}

#[test]
#[traced_test]
fn refcounted_records_die_with_their_last_reference() {
    let mut registry = SchemaRegistry::new();
    let mut sym_def = StructDef::new_node("symbol", TypeId(1));
    let uses = sym_def.add_one_to_many("uses");
    let mut use_def = StructDef::new_node("use", TypeId(2));
    let target = use_def.add_many_to_one("target", &uses);
    registry.register(sym_def.done(), DeletionSemantics::Refcounted);
    registry.register(use_def.done(), DeletionSemantics::Explicit);

    let mut g = graph(registry);
    let sym = g.create_node(TypeId(1)).unwrap();
    let u1 = g.create_node(TypeId(2)).unwrap();
    let u2 = g.create_node(TypeId(2)).unwrap();
    target.put(&mut g, u1, sym).unwrap();
    target.put(&mut g, u2, sym).unwrap();

    target.put(&mut g, u1, crate::Ptr::null()).unwrap();
    assert!(
        !g.has_pending_deletions(),
        "symbol still has a reference and must not be scheduled"
    );
    target.put(&mut g, u2, crate::Ptr::null()).unwrap();
    assert!(g.has_pending_deletions());
    // only the symbol goes; the (explicit-deletion) use records stay
    assert_eq!(g.process_deletions().unwrap(), 1);
}

#[test]
#[traced_test]
fn search_key_find_all() {
    let mut registry = SchemaRegistry::new();
    let index = registry.create_index("names");
    let mut def = StructDef::new_node("named", TypeId(1));
    let key = def.add_search_key("name", &index);
    registry.register(def.done(), DeletionSemantics::Explicit);

    let mut g = graph(registry);
    let a = g.create_node(TypeId(1)).unwrap();
    let b = g.create_node(TypeId(1)).unwrap();
    let c = g.create_node(TypeId(1)).unwrap();
    key.put(&mut g, a, "shared").unwrap();
    key.put(&mut g, b, "shared").unwrap();
    key.put(&mut g, c, "lonely").unwrap();

    // duplicates come back together, in address order
    assert_eq!(index.find_all(&mut g, "shared").unwrap(), vec![a, b]);
    assert_eq!(index.find_all(&mut g, "lonely").unwrap(), vec![c]);
    assert!(index.find_all(&mut g, "absent").unwrap().is_empty());
    assert_eq!(key.get(&mut g, a).unwrap(), "shared");
}

#[test]
#[traced_test]
fn rekeying_moves_the_index_entry() {
    let mut registry = SchemaRegistry::new();
    let index = registry.create_index("names");
    let mut def = StructDef::new_node("named", TypeId(1));
    let key = def.add_search_key("name", &index);
    registry.register(def.done(), DeletionSemantics::Explicit);

    let mut g = graph(registry);
    let a = g.create_node(TypeId(1)).unwrap();
    key.put(&mut g, a, "before").unwrap();
    // same key again is a no-op, not a duplicate entry
    key.put(&mut g, a, "before").unwrap();
    assert_eq!(index.find_all(&mut g, "before").unwrap(), vec![a]);
    key.put(&mut g, a, "after").unwrap();
    assert!(index.find_all(&mut g, "before").unwrap().is_empty());
    assert_eq!(index.find_all(&mut g, "after").unwrap(), vec![a]);
}

#[test]
#[traced_test]
fn unindexing_is_idempotent() {
    let mut registry = SchemaRegistry::new();
    let index = registry.create_index("names");
    let mut def = StructDef::new_node("named", TypeId(1));
    let key = def.add_search_key("name", &index);
    registry.register(def.done(), DeletionSemantics::Explicit);

    let mut g = graph(registry);
    let a = g.create_node(TypeId(1)).unwrap();
    key.put(&mut g, a, "ephemeral").unwrap();
    assert!(key.is_in_index(&mut g, a).unwrap());
    key.remove_from_index(&mut g, a).unwrap();
    assert!(!key.is_in_index(&mut g, a).unwrap());
    key.remove_from_index(&mut g, a).unwrap();
    assert!(index.find_all(&mut g, "ephemeral").unwrap().is_empty());
}

#[test]
#[traced_test]
fn deleted_records_leave_the_index() {
    let mut registry = SchemaRegistry::new();
    let index = registry.create_index("names");
    let mut def = StructDef::new_node("named", TypeId(1));
    let key = def.add_search_key("name", &index);
    registry.register(def.done(), DeletionSemantics::Explicit);

    let mut g = graph(registry);
    let a = g.create_node(TypeId(1)).unwrap();
    let b = g.create_node(TypeId(1)).unwrap();
    key.put(&mut g, a, "kept").unwrap();
    key.put(&mut g, b, "reaped").unwrap();
    g.schedule_deletion(b);
    assert_eq!(g.process_deletions().unwrap(), 1);
    assert!(index.find_all(&mut g, "reaped").unwrap().is_empty());
    assert_eq!(index.find_all(&mut g, "kept").unwrap(), vec![a]);
}

#[test]
#[traced_test]
fn one_index_spans_multiple_record_types() {
    let mut registry = SchemaRegistry::new();
    let index = registry.create_index("names");
    let mut kind_a = StructDef::new_node("kind_a", TypeId(1));
    let key_a = kind_a.add_search_key("name", &index);
    let mut kind_b = StructDef::new_node("kind_b", TypeId(2));
    let key_b = kind_b.add_search_key("name", &index);
    registry.register(kind_a.done(), DeletionSemantics::Explicit);
    registry.register(kind_b.done(), DeletionSemantics::Explicit);

    let mut g = graph(registry);
    let a = g.create_node(TypeId(1)).unwrap();
    let b = g.create_node(TypeId(2)).unwrap();
    key_a.put(&mut g, a, "both").unwrap();
    key_b.put(&mut g, b, "both").unwrap();
    assert_eq!(index.find_all(&mut g, "both").unwrap(), vec![a, b]);
}

#[test]
#[traced_test]
fn index_stress() {
    let mut registry = SchemaRegistry::new();
    let index = registry.create_index("names");
    let mut def = StructDef::new_node("named", TypeId(1));
    let key = def.add_search_key("name", &index);
    registry.register(def.done(), DeletionSemantics::Explicit);

    let mut g = graph(registry);
    let mut rng = StdRng::seed_from_u64(0xBEE5);
    // a small alphabet of keys so duplicate runs get long enough to
    // straddle node boundaries
    let keys = ["alpha", "beta", "gamma", "delta", "epsilon", "zeta"];
    let mut expect: std::collections::BTreeMap<&str, Vec<crate::Ptr<crate::Void>>> =
        Default::default();

    let mut records = vec![];
    for _ in 0..400 {
        let k = keys[rng.gen_range(0..keys.len())];
        let r = g.create_node(TypeId(1)).unwrap();
        key.put(&mut g, r, k).unwrap();
        expect.entry(k).or_default().push(r);
        records.push((r, k));
    }
    for records in expect.values_mut() {
        records.sort_by_key(|p| p.addr);
    }
    for (k, records) in &expect {
        assert_eq!(&index.find_all(&mut g, k).unwrap(), records, "key {k}");
    }

    // unindex a random half and re-verify
    for (r, k) in &records {
        if rng.gen_bool(0.5) {
            key.remove_from_index(&mut g, *r).unwrap();
            let list = expect.get_mut(k).unwrap();
            list.retain(|p| p != r);
        }
    }
    for (k, records) in &expect {
        assert_eq!(&index.find_all(&mut g, k).unwrap(), records, "key {k}");
    }

    // and drain the rest so the tree collapses back to empty
    for (r, _) in &records {
        key.remove_from_index(&mut g, *r).unwrap();
    }
    for k in keys {
        assert!(index.find_all(&mut g, k).unwrap().is_empty());
    }
}

use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use orbit_datastore::{Datastore, DatastoreConfig, GroupRecord, MemoryStore, PermissionMatcher};

fn open(groups: Vec<GroupRecord>, pool_size: usize) -> (Datastore, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::with_groups(groups));
    let config = DatastoreConfig {
        pool_size,
        ..DatastoreConfig::default()
    };
    let datastore = Datastore::new(config, store.clone()).expect("datastore should start");
    datastore.connect().expect("memory store should connect");
    (datastore, store)
}

#[test]
fn admin_inherits_member_nodes() {
    let (datastore, _store) = open(
        vec![
            GroupRecord::new("member")
                .with_permission("chat.send")
                .with_sort_order(1),
            GroupRecord::new("admin")
                .with_parent("member")
                .with_permission("admin.kick")
                .with_sort_order(2),
        ],
        1,
    );
    assert!(datastore.fetch_and_cache_groups());

    let admin = datastore.get_group("admin").expect("admin should be cached");
    let mut effective = admin.effective_permissions();
    effective.sort();
    assert_eq!(effective, vec!["admin.kick", "chat.send"]);
    assert!(admin.has_permission("chat.send"));
    assert!(admin.has_permission("admin.kick"));

    let member = datastore.get_group("member").expect("member should be cached");
    assert!(!member.has_permission("admin.kick"));
}

#[test]
fn cyclic_parents_resolve_once_each() {
    let (datastore, _store) = open(
        vec![
            GroupRecord::new("a")
                .with_parent("b")
                .with_permission("a.node")
                .with_sort_order(1),
            GroupRecord::new("b")
                .with_parent("a")
                .with_permission("b.node")
                .with_sort_order(2),
        ],
        1,
    );
    assert!(datastore.fetch_and_cache_groups());

    for name in ["a", "b"] {
        let group = datastore.get_group(name).expect("group should be cached");
        let mut effective = group.effective_permissions();
        effective.sort();
        assert_eq!(effective, vec!["a.node", "b.node"], "group {name}");
    }
    assert_eq!(datastore.ancestry("a"), vec!["a", "b"]);
}

#[test]
fn negation_is_left_to_the_caller() {
    let matcher = PermissionMatcher::with_decision_cache(["chat.*", "-chat.spam"]);

    assert!(matcher.has_permission("chat.send"));
    assert!(matcher.has_permission("chat.spam"));
    assert!(matcher.has_permission("-chat.spam"));
    assert!(!matcher.has_permission("-chat.send"));
}

#[test]
fn concurrent_cold_loads_retain_one_instance() {
    let (datastore, store) = open(
        vec![GroupRecord::new("x").with_permission("x.node")],
        2,
    );
    store.set_load_delay(Duration::from_millis(200));

    let barrier = Arc::new(Barrier::new(2));
    let callers: Vec<_> = (0..2)
        .map(|_| {
            let datastore = datastore.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                datastore.get_group("x")
            })
        })
        .collect();

    let results: Vec<_> = callers
        .into_iter()
        .map(|caller| caller.join().unwrap().expect("x should load"))
        .collect();

    assert_eq!(store.group_loads(), 2);
    assert_eq!(datastore.cached_groups().len(), 1);

    let cached = datastore.get_group("x").unwrap();
    for group in &results {
        assert!(Arc::ptr_eq(group, &cached));
        assert_eq!(group.effective_permissions(), vec!["x.node"]);
    }
}

#[test]
fn refresh_after_update_changes_answers() {
    let (datastore, _store) = open(
        vec![
            GroupRecord::new("default")
                .as_default()
                .with_permission("chat.send"),
            GroupRecord::new("vip")
                .with_parent("default")
                .with_permission("fly")
                .with_sort_order(5),
        ],
        1,
    );
    assert!(datastore.fetch_and_cache_groups());

    let before = datastore.get_group("vip").unwrap();
    assert!(before.has_permission("chat.send"));
    assert!(!before.has_permission("chat.color"));

    let mut default = datastore.get_group("default").unwrap().to_record();
    default.permissions.insert("chat.color".into());
    assert!(datastore.update_group(&default));

    // writes don't touch the cache until the next refresh
    assert!(!datastore.get_group("vip").unwrap().has_permission("chat.color"));

    assert!(datastore.fetch_and_cache_groups());
    let after = datastore.get_group("vip").unwrap();
    assert!(after.has_permission("chat.color"));
    assert!(!Arc::ptr_eq(&before, &after));
}

#[test]
fn late_loaded_group_resolves_against_cache() {
    let (datastore, store) = open(
        vec![GroupRecord::new("default")
            .as_default()
            .with_permission("chat.send")],
        1,
    );
    assert!(datastore.fetch_and_cache_groups());

    assert!(datastore.insert_group(
        &GroupRecord::new("builder")
            .with_parent("default")
            .with_permission("build.*")
            .with_sort_order(3)
    ));
    assert!(!datastore.is_cached("builder"));

    let builder = datastore.get_group("builder").expect("builder should load");
    assert!(builder.has_permission("build.place"));
    assert!(builder.has_permission("chat.send"));
    assert!(datastore.is_cached("builder"));
    assert!(store.group_loads() >= 2);
}

#[test]
fn dangling_parent_is_harmless() {
    let (datastore, _store) = open(
        vec![GroupRecord::new("orphan")
            .with_parent("ghost")
            .with_permission("orphan.node")],
        1,
    );
    assert!(datastore.fetch_and_cache_groups());

    let orphan = datastore.get_group("orphan").unwrap();
    assert_eq!(orphan.effective_permissions(), vec!["orphan.node"]);
    assert_eq!(datastore.unresolved_parents("orphan"), vec!["ghost"]);
    assert!(!datastore.has_group("ghost"));
}

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use blendstore::application::kv::KvClient;
use blendstore::application::repos::{EntityRepo, RepoError};
use blendstore::cache::MemoryKv;
use blendstore::domain::coercion::{Coercion, CoercionTable, FieldKind};
use blendstore::domain::filter::Filter;
use blendstore::infra::memory::{MemoryRepo, MemoryRepositories};
use blendstore::{
    Connection, EntityDescriptor, FieldValue, Lookup, Record, RetryPolicy, Step, StoreControl,
    StoreError, SyncMode,
};

struct Harness {
    kv: Arc<MemoryKv>,
    table: Arc<MemoryRepo>,
    store: StoreControl,
}

fn user_descriptor(mode: SyncMode) -> EntityDescriptor {
    EntityDescriptor::builder("User")
        .table("users")
        .index("email")
        .multi_index("groupId")
        .cache_fields(["id", "email", "groupId", "name", "age"])
        .sync_mode(mode)
        .coercion(Coercion::Typed(
            CoercionTable::new()
                .field("id", FieldKind::Integer)
                .field("groupId", FieldKind::Integer)
                .field("age", FieldKind::Integer),
        ))
        .build()
        .expect("valid descriptor")
}

fn harness(mode: SyncMode) -> Harness {
    let kv = Arc::new(MemoryKv::new());
    let repos = Arc::new(MemoryRepositories::new());
    let table = repos.table("users", "id");
    let connection = Connection::open(kv.clone(), repos);
    let store = connection
        .store_control(user_descriptor(mode))
        .expect("store control");
    Harness { kv, table, store }
}

fn user_a() -> Record {
    Record::new()
        .with("id", 1)
        .with("email", "a@x.com")
        .with("groupId", 10)
        .with("name", "A")
        .with("age", 20)
}

async fn exists(kv: &MemoryKv, key: &str) -> bool {
    kv.exists(key).await.expect("exists")
}

#[tokio::test]
async fn pushed_record_is_readable_by_every_lookup_shape() {
    let h = harness(SyncMode::Sync);
    h.store.push(&user_a()).await.expect("push");

    let by_key = h.store.get(&FieldValue::Int(1)).await.expect("get");
    assert_eq!(by_key, Some(user_a()));

    let by_email = h
        .store
        .get_by_index("email", &FieldValue::from("a@x.com"))
        .await
        .expect("get by index");
    assert_eq!(by_email, Some(user_a()));

    let handles = h
        .store
        .instances(&Lookup::multi("groupId", 10, -1))
        .await
        .expect("instances");
    assert_eq!(handles.len(), 1);
    assert_eq!(handles[0].uk().to_cache_text(), "1");
    assert_eq!(handles[0].cache_key(), "User:1");
}

#[tokio::test]
async fn changing_an_indexed_field_moves_the_lookup() {
    let h = harness(SyncMode::Sync);
    h.store.push(&user_a()).await.expect("push");

    let handle = h
        .store
        .instance_by_index("email", &FieldValue::from("a@x.com"))
        .await
        .expect("handle");
    handle
        .set_items(&Record::new().with("email", "b@x.com"))
        .await
        .expect("set items")
        .wait()
        .await
        .expect("write-back");

    let old = h
        .store
        .get_by_index_or_fail("email", &FieldValue::from("a@x.com"))
        .await
        .expect_err("old email is gone");
    assert!(old.is_not_found());
    assert!(
        h.store
            .get_by_index("email", &FieldValue::from("a@x.com"))
            .await
            .expect("non-failing read")
            .is_none()
    );

    let updated = h
        .store
        .get_by_index_or_fail("email", &FieldValue::from("b@x.com"))
        .await
        .expect("new email resolves");
    assert_eq!(updated, user_a().with("email", "b@x.com"));
    assert_eq!(h.table.rows()[0].get("email"), Some(&FieldValue::from("b@x.com")));
}

#[tokio::test]
async fn saving_changed_index_fields_moves_both_lookups() {
    let h = harness(SyncMode::Sync);
    h.store.push(&user_a()).await.expect("push");

    let moved = user_a().with("email", "b@x.com").with("groupId", 20);
    h.store.save(&moved, false).await.expect("save");

    let old = h
        .store
        .get_by_index_or_fail("email", &FieldValue::from("a@x.com"))
        .await
        .expect_err("old email is gone");
    assert!(old.is_not_found());
    let updated = h
        .store
        .get_by_index_or_fail("email", &FieldValue::from("b@x.com"))
        .await
        .expect("new email resolves");
    assert_eq!(updated, moved);

    assert!(!exists(&h.kv, "User-groupId:10").await);
    assert!(
        h.store
            .get_by_multi_index("groupId", &FieldValue::Int(10), -1, 0)
            .await
            .expect("old partition")
            .is_empty()
    );
    assert_eq!(
        h.kv.smembers("User-groupId:20").await.expect("members"),
        ["1"]
    );
    let partition = h
        .store
        .get_by_multi_index_or_fail("groupId", &FieldValue::Int(20), -1, 0)
        .await
        .expect("new partition");
    assert_eq!(partition, vec![moved]);
}

#[tokio::test]
async fn partial_save_keeps_unlisted_fields_indexed() {
    let h = harness(SyncMode::Sync);
    h.store.push(&user_a()).await.expect("push");

    h.store
        .save(&Record::new().with("id", 1).with("name", "Z"), false)
        .await
        .expect("save");

    let expected = user_a().with("name", "Z");
    let by_email = h
        .store
        .get_by_index("email", &FieldValue::from("a@x.com"))
        .await
        .expect("get by index");
    assert_eq!(by_email, Some(expected.clone()));
    assert_eq!(
        h.kv.smembers("User-groupId:10").await.expect("members"),
        ["1"]
    );
    assert_eq!(h.table.rows(), vec![expected]);
}

/// Holds back its first patch so later writes could overtake it.
struct LaggingRepo {
    inner: Arc<MemoryRepo>,
    stalled: AtomicBool,
}

#[async_trait]
impl EntityRepo for LaggingRepo {
    async fn find_many(&self, filter: &Filter) -> Result<Vec<Record>, RepoError> {
        self.inner.find_many(filter).await
    }

    async fn find_one(&self, filter: &Filter) -> Result<Option<Record>, RepoError> {
        self.inner.find_one(filter).await
    }

    async fn save(&self, record: &Record) -> Result<Record, RepoError> {
        self.inner.save(record).await
    }

    async fn patch(&self, filter: &Filter, fields: &Record) -> Result<(), RepoError> {
        if !self.stalled.swap(true, Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        self.inner.patch(filter, fields).await
    }

    async fn remove(&self, record: &Record) -> Result<(), RepoError> {
        self.inner.remove(record).await
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn async_updates_through_one_handle_all_reach_the_backing_store() {
    let table = Arc::new(MemoryRepo::new("id"));
    table.seed([user_a()]);
    let repo = Arc::new(LaggingRepo {
        inner: table.clone(),
        stalled: AtomicBool::new(false),
    });
    let store = StoreControl::new(
        user_descriptor(SyncMode::Async),
        Arc::new(MemoryKv::new()),
        repo,
        RetryPolicy::default(),
    )
    .expect("store control");

    let handle = store.instance(1);
    let rename = handle
        .set_items(&Record::new().with("name", "B"))
        .await
        .expect("rename");
    let (age, birthday) = handle.step("age", Step::By(10)).await.expect("step");
    assert_eq!(age, FieldValue::Int(30));
    let rename_again = handle
        .set_items(&Record::new().with("name", "C"))
        .await
        .expect("rename again");
    for pending in [rename_again, birthday, rename] {
        pending.wait().await.expect("write-back");
    }

    let expected = user_a().with("name", "C").with("age", 30);
    assert_eq!(table.rows(), vec![expected.clone()]);
    assert_eq!(handle.get_or_fail().await.expect("cached"), expected);
}

#[tokio::test]
async fn step_increments_and_persists() {
    let h = harness(SyncMode::Sync);
    h.store.push(&user_a()).await.expect("push");

    let (age, pending) = h
        .store
        .instance(1)
        .step("age", Step::By(1))
        .await
        .expect("step");
    pending.wait().await.expect("write-back");

    assert_eq!(age, FieldValue::Int(21));
    let record = h.store.get_or_fail(&FieldValue::Int(1)).await.expect("get");
    assert_eq!(record.get("age"), Some(&FieldValue::Int(21)));
    assert_eq!(h.table.rows()[0].get("age"), Some(&FieldValue::Int(21)));
}

#[tokio::test]
async fn stepping_a_multi_index_field_moves_partitions() {
    let h = harness(SyncMode::Sync);
    h.store.push(&user_a()).await.expect("push");

    let (group, _) = h
        .store
        .instance(1)
        .step("groupId", Step::By(1))
        .await
        .expect("step");

    assert_eq!(group, FieldValue::Int(11));
    assert!(!exists(&h.kv, "User-groupId:10").await);
    assert_eq!(
        h.kv.smembers("User-groupId:11").await.expect("members"),
        ["1"]
    );
}

#[tokio::test]
async fn delete_removes_record_indexes_and_empty_partitions() {
    let h = harness(SyncMode::Sync);
    h.store.push(&user_a()).await.expect("push");
    h.store
        .push(&Record::new().with("id", 2).with("email", "c@x.com").with("groupId", 20))
        .await
        .expect("push");

    h.store
        .del(&FieldValue::Int(1), false)
        .await
        .expect("del")
        .wait()
        .await
        .expect("write-back");

    assert!(h.store.get(&FieldValue::Int(1)).await.expect("get").is_none());
    assert!(!exists(&h.kv, "User:1").await);
    assert!(!exists(&h.kv, "User-email:a@x.com").await);
    assert!(!exists(&h.kv, "User-groupId:10").await);
    assert_eq!(h.store.index_array(-1, 0).await.expect("keys"), ["2"]);
    assert_eq!(h.table.rows().len(), 1);
}

#[tokio::test]
async fn range_lists_each_record_once_and_scans_once() {
    let h = harness(SyncMode::Sync);
    for id in 1..=3 {
        h.store
            .push(
                &Record::new()
                    .with("id", id)
                    .with("email", format!("u{id}@x.com"))
                    .with("groupId", 10),
            )
            .await
            .expect("push");
    }

    let first = h.store.all().await.expect("all");
    let second = h.store.range(-1, 0).await.expect("range");

    let ids: Vec<_> = first.iter().filter_map(|r| r.get("id").cloned()).collect();
    assert_eq!(
        ids,
        [FieldValue::Int(3), FieldValue::Int(2), FieldValue::Int(1)]
    );
    assert_eq!(first, second);
    assert_eq!(h.table.scan_count(), 1);
    assert_eq!(h.store.range(0, 0).await.expect("window").len(), 1);
}

#[tokio::test]
async fn cold_cache_heals_from_the_backing_store() {
    let h = harness(SyncMode::Async);
    h.table.seed([
        user_a(),
        Record::new()
            .with("id", 2)
            .with("email", "b@x.com")
            .with("groupId", 10)
            .with("name", "B")
            .with("age", 30),
    ]);

    let partition = h
        .store
        .get_by_multi_index_or_fail("groupId", &FieldValue::Int(10), 5, 0)
        .await
        .expect("partition");
    assert_eq!(partition.len(), 2);
    assert!(exists(&h.kv, "User:1").await);
    assert!(exists(&h.kv, "User:2").await);

    h.kv.del(&["User:1".to_string()]).await.expect("evict");
    let healed = h
        .store
        .get_by_index_or_fail("email", &FieldValue::from("a@x.com"))
        .await
        .expect("dangling index reloads");
    assert_eq!(healed, user_a());
}

#[tokio::test]
async fn empty_partition_is_empty_on_both_variants() {
    let h = harness(SyncMode::Sync);
    let strict = h
        .store
        .get_by_multi_index_or_fail("groupId", &FieldValue::Int(99), -1, 0)
        .await
        .expect("empty partition is not an error");
    assert!(strict.is_empty());
    assert!(
        h.store
            .lookup(&Lookup::multi("groupId", 99, -1))
            .await
            .expect("lookup")
            .is_empty()
    );
}

#[tokio::test]
async fn async_save_is_eventually_durable() {
    let h = harness(SyncMode::Async);
    let pending = h.store.save(&user_a(), false).await.expect("save");
    assert!(pending.is_detached());
    pending.wait().await.expect("write-back");
    assert_eq!(h.table.rows(), vec![user_a()]);

    let forced = h
        .store
        .save(&user_a().with("name", "AA"), true)
        .await
        .expect("save");
    assert!(!forced.is_detached());
    assert_eq!(h.table.rows()[0].get("name"), Some(&FieldValue::from("AA")));
}

#[tokio::test]
async fn lookups_on_undeclared_fields_are_configuration_errors() {
    let h = harness(SyncMode::Sync);
    let err = h
        .store
        .lookup(&Lookup::index("name", "A"))
        .await
        .expect_err("name is not indexed");
    assert!(matches!(err, StoreError::Configuration { .. }));

    let err = h
        .store
        .get_by_multi_index("email", &FieldValue::from("a@x.com"), -1, 0)
        .await
        .expect_err("email is a unique index");
    assert!(matches!(err, StoreError::Configuration { .. }));
}

#[tokio::test]
async fn custom_query_mapping_resolves_natural_keys() {
    let kv = Arc::new(MemoryKv::new());
    let repos = Arc::new(MemoryRepositories::new());
    let table = repos.table("members", "code");
    table.seed([Record::new()
        .with("code", "acme/7")
        .with("org", "acme")
        .with("user", "7")]);

    let descriptor = EntityDescriptor::builder("Member")
        .table("members")
        .unique_key("code")
        .query_mapping(|uk| {
            let text = uk.to_cache_text();
            let (org, user) = text.split_once('/').unwrap_or((text.as_str(), ""));
            blendstore::domain::filter::Filter::eq("org", org).and("user", user)
        })
        .build()
        .expect("descriptor");
    let store = Connection::open(kv, repos)
        .store_control(descriptor)
        .expect("store");

    let record = store
        .get_or_fail(&FieldValue::from("acme/7"))
        .await
        .expect("natural key");
    assert_eq!(record.get("org"), Some(&FieldValue::from("acme")));
}

#[tokio::test]
async fn convert_hook_runs_after_every_read() {
    let kv = Arc::new(MemoryKv::new());
    let repos = Arc::new(MemoryRepositories::new());
    repos
        .table("Tag", "id")
        .seed([Record::new().with("id", 1).with("label", "rust")]);

    let descriptor = EntityDescriptor::builder("Tag")
        .coercion(Coercion::convert(|mut record| {
            let upper = record
                .get("label")
                .map(|label| label.to_cache_text().to_uppercase());
            if let Some(upper) = upper {
                record.insert("label", upper);
            }
            record
        }))
        .build()
        .expect("descriptor");
    let store = Connection::open(kv, repos)
        .store_control(descriptor)
        .expect("store");

    let record = store.get_or_fail(&FieldValue::Int(1)).await.expect("get");
    assert_eq!(record.get("label"), Some(&FieldValue::from("RUST")));
    assert_eq!(record.get("id"), Some(&FieldValue::from("1")));
}

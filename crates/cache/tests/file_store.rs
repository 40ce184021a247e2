//! Integration tests for the filesystem backend

#![allow(unused)]

mod common;

use common::*;
use kvcache::file::key_digest;
use kvcache::{
    CacheKey, FileSettings, FileStore, HostEnvironment, InProcessLockManager, LockManager,
    ManualClock, RegionScope, Storage, StorageExt,
};
use proptest::prelude::*;
use rstest::rstest;
use serde::{Deserialize, Serialize};
use std::fs;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const MINUTE: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Profile {
    name: String,
    visits: u32,
    tags: Vec<String>,
}

fn profile() -> Profile {
    Profile {
        name: "Renge".to_string(),
        visits: 7,
        tags: vec!["nyanpasu".to_string(), "asahigaoka".to_string()],
    }
}

#[rstest]
#[case::flat(false)]
#[case::sharded(true)]
fn test_round_trip_across_instances(#[case] multi_folder: bool) {
    init_tracing();
    let dir = create_test_dir();
    let (writer, _) = file_store(dir.path(), multi_folder);
    writer.set_value("profile", &profile(), MINUTE).unwrap();

    let (reader, _) = file_store(dir.path(), multi_folder);
    assert_eq!(reader.get::<Profile>("profile").unwrap(), Some(profile()));

    let envelope = reader.get_full::<Profile>("profile").unwrap().unwrap();
    assert_eq!(envelope.key, CacheKey::from("profile"));
    assert!((envelope.time_expires - envelope.time_create - 60.0).abs() < 1e-6);
    assert_eq!(envelope.creation_pid, Some(std::process::id()));
    assert!(envelope.creation_site.unwrap().file.ends_with("file_store.rs"));
}

#[test]
fn test_sharded_layout() {
    let dir = create_test_dir();
    let store = FileStore::new(
        FileSettings::new()
            .with_folder(dir.path())
            .with_multi_folder(true)
            .with_prefix("abc_"),
    )
    .unwrap()
    .with_lock_manager(Arc::new(InProcessLockManager::new()));

    let key = CacheKey::from("historia");
    let digest = key_digest(&key);
    let expected = dir
        .path()
        .join(&digest[0..2])
        .join(&digest[2..4])
        .join(format!("prefix_abc_{digest}.dat"));
    assert_eq!(store.filename(&key), expected);
    assert!(!expected.exists());

    store.set_value(&key, &"chronicle".to_string(), MINUTE).unwrap();
    assert!(expected.is_file());
    assert_eq!(
        store.get::<String>(&key).unwrap().as_deref(),
        Some("chronicle")
    );
}

#[test]
fn test_integer_and_text_keys_share_a_record() {
    let dir = create_test_dir();
    let (store, _) = file_store(dir.path(), false);
    store.set_value(42i64, &"answer".to_string(), MINUTE).unwrap();
    assert_eq!(
        store.get::<String>("42").unwrap().as_deref(),
        Some("answer")
    );
}

#[rstest]
#[case::flat(false)]
#[case::sharded(true)]
fn test_clear_only_touches_own_prefix(#[case] multi_folder: bool) {
    let dir = create_test_dir();
    let store_for = |prefix: &str| {
        FileStore::new(
            FileSettings::new()
                .with_folder(dir.path())
                .with_multi_folder(multi_folder)
                .with_prefix(prefix),
        )
        .unwrap()
        .with_lock_manager(Arc::new(InProcessLockManager::new()))
    };
    let a = store_for("a_");
    let b = store_for("ab_");
    let bare = store_for("");

    a.set_value("k", &1, MINUTE).unwrap();
    b.set_value("k", &2, MINUTE).unwrap();
    bare.set_value("k", &3, MINUTE).unwrap();
    fs::write(dir.path().join("notes.txt"), "keep me").unwrap();

    a.clear().unwrap();
    assert_eq!(a.get::<i32>("k").unwrap(), None);
    assert_eq!(b.get::<i32>("k").unwrap(), Some(2));
    assert_eq!(bare.get::<i32>("k").unwrap(), Some(3));

    bare.clear().unwrap();
    assert_eq!(bare.get::<i32>("k").unwrap(), None);
    assert_eq!(b.get::<i32>("k").unwrap(), Some(2));
    assert!(dir.path().join("notes.txt").exists());
}

#[test]
fn test_clear_missing_folder_is_noop() {
    let dir = create_test_dir();
    let (store, _) = file_store(&dir.path().join("never-created"), true);
    store.clear().unwrap();
}

#[test]
fn test_expiry_follows_the_clock() {
    let dir = create_test_dir();
    let clock = Arc::new(ManualClock::new(1_000.0));
    let (store, _) = file_store(dir.path(), false);
    let store = store.with_clock(clock.clone());
    let key = CacheKey::from("ephemeral");

    store
        .set_value(&key, &"v".to_string(), Duration::from_secs(10))
        .unwrap();
    assert_eq!(store.change_time(&key).unwrap(), Some(1_000.0));
    assert_eq!(store.expiry_time(&key).unwrap(), Some(1_010.0));

    clock.advance(Duration::from_secs(9));
    assert!(store.has(&key).unwrap());

    clock.set(1_010.0);
    assert!(!store.has(&key).unwrap());
    assert_eq!(
        store.get_value(&key, "fallback".to_string()).unwrap(),
        "fallback"
    );
    // Expired records stay on disk until overwritten or deleted
    assert!(store.filename(&key).exists());
}

#[test]
fn test_zero_ttl_is_absent_immediately() {
    let dir = create_test_dir();
    let (store, _) = file_store(dir.path(), true);
    store.set_value("gone", &1, Duration::ZERO).unwrap();
    assert!(!store.has(&CacheKey::from("gone")).unwrap());
    assert_eq!(store.get_value("gone", 0).unwrap(), 0);
}

#[test]
fn test_set_expiry_time_rewrites_record() {
    let dir = create_test_dir();
    let clock = Arc::new(ManualClock::new(500.0));
    let (store, _) = file_store(dir.path(), true);
    let store = store.with_clock(clock.clone());
    let key = CacheKey::from("lease");

    store.set_value(&key, &"held".to_string(), MINUTE).unwrap();
    let site = store.get_full::<String>(&key).unwrap().unwrap().creation_site;

    clock.advance(Duration::from_secs(30));
    store.set_expiry_time(&key, Duration::from_secs(300)).unwrap();

    let envelope = store.get_full::<String>(&key).unwrap().unwrap();
    assert_eq!(envelope.time_create, 530.0);
    assert_eq!(envelope.time_expires, 830.0);
    assert_eq!(envelope.value.as_deref(), Some("held"));
    assert_eq!(envelope.creation_site, site);

    store
        .set_expiry_time(&CacheKey::from("absent"), MINUTE)
        .unwrap();
    assert!(!store.filename(&CacheKey::from("absent")).exists());
}

#[test]
fn test_false_survives() {
    let dir = create_test_dir();
    let (store, _) = file_store(dir.path(), false);
    store.set_value("flag", &false, MINUTE).unwrap();
    assert_eq!(store.get::<bool>("flag").unwrap(), Some(false));
    assert!(!store.get_value("flag", true).unwrap());
}

#[test]
fn test_delete() {
    let dir = create_test_dir();
    let (store, locks) = file_store(dir.path(), true);
    let key = CacheKey::from("doomed");

    store.delete_value(&CacheKey::from("never-written")).unwrap();

    store.set_value(&key, &1, MINUTE).unwrap();
    store.delete(&key).unwrap();
    assert!(!store.exists(&key).unwrap());
    assert!(!store.filename(&key).exists());
    assert!(locks.held_names().is_empty());
}

#[test]
fn test_multiple_entries() {
    let dir = create_test_dir();
    let (store, _) = file_store(dir.path(), true);

    assert!(store
        .set_multiple(vec![("a", 1), ("b", 2)], Some(MINUTE))
        .unwrap());
    let values: Vec<i32> = store
        .get_multiple(["a", "b", "c"], 0)
        .unwrap()
        .into_iter()
        .map(|(_, value)| value)
        .collect();
    assert_eq!(values, vec![1, 2, 0]);

    store
        .delete_multiple(&[CacheKey::from("a"), CacheKey::from("c")])
        .unwrap();
    assert_eq!(store.get::<i32>("a").unwrap(), None);
    assert_eq!(store.get::<i32>("b").unwrap(), Some(2));
}

#[test]
fn test_invalid_keys_rejected() {
    let dir = create_test_dir();
    let (store, locks) = file_store(dir.path(), false);

    let error = store.set_value("user@host", &1, MINUTE).unwrap_err();
    assert!(error.is_invalid_argument());
    assert!(store.set("a:b", &1, None).unwrap_err().is_invalid_argument());
    assert!(store
        .get::<i32>("{x}")
        .unwrap_err()
        .is_invalid_argument());
    assert!(store
        .delete_value(&CacheKey::from("a/b"))
        .unwrap_err()
        .is_invalid_argument());
    assert!(locks.held_names().is_empty());
}

#[test]
fn test_boolean_set_reports_failure_on_missing_parent() {
    let dir = create_test_dir();
    let (store, locks) = file_store(&dir.path().join("missing").join("cache"), true);

    assert!(!store.set("k", &1, Some(MINUTE)).unwrap());
    let error = store.set_value("k", &1, MINUTE).unwrap_err();
    assert_eq!(error.category(), "filesystem");
    assert!(locks.held_names().is_empty());
}

#[test]
fn test_default_ttl_is_ten_years() {
    let dir = create_test_dir();
    let clock = Arc::new(ManualClock::new(0.0));
    let (store, _) = file_store(dir.path(), false);
    let store = store.with_clock(clock);

    assert!(store.set("long", &1, None).unwrap());
    assert_eq!(
        store.expiry_time(&CacheKey::from("long")).unwrap(),
        Some(315_576_000.0)
    );
}

#[test]
fn test_locks_released_on_every_path() {
    let dir = create_test_dir();
    let store = FileStore::new(
        FileSettings::new()
            .with_folder(dir.path().join("cache"))
            .with_prefix("")
            .with_lock_folder(dir.path().join("locks")),
    )
    .unwrap();
    let key = CacheKey::from("k");
    let lock_name = store.lock_name(&key);

    store.set_value(&key, &1, MINUTE).unwrap();
    assert_eq!(store.get::<i32>(&key).unwrap(), Some(1));
    store.set_expiry_time(&key, MINUTE).unwrap();
    assert!(store.lock_manager().is_free(&lock_name));

    // Corrupt record reads as absent
    fs::write(store.filename(&key), b"not an envelope").unwrap();
    assert_eq!(store.get::<i32>(&key).unwrap(), None);
    assert!(store.lock_manager().is_free(&lock_name));

    // Write failure while the lock is held
    fs::remove_file(store.filename(&key)).unwrap();
    fs::create_dir(store.filename(&key)).unwrap();
    assert!(store.set_value(&key, &2, MINUTE).is_err());
    assert!(store.lock_manager().is_free(&lock_name));
    assert!(!store.set(&key, &2, Some(MINUTE)).unwrap());
    assert!(store.lock_manager().is_free(&lock_name));
}

#[test]
fn test_concurrent_writers_leave_one_whole_record() {
    let dir = create_test_dir();
    let settings = FileSettings::new()
        .with_folder(dir.path().join("cache"))
        .with_multi_folder(true)
        .with_prefix("")
        .with_lock_folder(dir.path().join("locks"));

    let writers: Vec<_> = (0..8)
        .map(|n| {
            let settings = settings.clone();
            thread::spawn(move || {
                let store = FileStore::new(settings).unwrap();
                for round in 0..10 {
                    store
                        .set_value("contended", &vec![n; 64 + round], MINUTE)
                        .unwrap();
                }
            })
        })
        .collect();
    for writer in writers {
        writer.join().unwrap();
    }

    let store = FileStore::new(settings).unwrap();
    let value = store.get::<Vec<u32>>("contended").unwrap().unwrap();
    assert!(value.windows(2).all(|pair| pair[0] == pair[1]));

    let shard = store.shard_folder(&CacheKey::from("contended"));
    let names: Vec<_> = fs::read_dir(shard)
        .unwrap()
        .map(|entry| entry.unwrap().file_name())
        .collect();
    assert_eq!(names.len(), 1, "temporary files left behind: {names:?}");
}

#[test]
fn test_domain_region_isolates_hosts() {
    let dir = create_test_dir();
    let store_for = |host: &str| {
        FileStore::new(
            FileSettings::new()
                .with_folder(dir.path())
                .with_region(RegionScope::Domain)
                .with_environment(HostEnvironment::new(host, "/srv/www")),
        )
        .unwrap()
        .with_lock_manager(Arc::new(InProcessLockManager::new()))
    };
    let first = store_for("www.example.org");
    let same = store_for("EXAMPLE.org:8080");
    let other = store_for("example.net");

    first.set_value("k", &1, MINUTE).unwrap();
    assert_eq!(same.get::<i32>("k").unwrap(), Some(1));
    assert_eq!(other.get::<i32>("k").unwrap(), None);
    assert_eq!(first.prefix(), same.prefix());
}

#[cfg(unix)]
#[test]
fn test_record_files_are_private() {
    use std::os::unix::fs::PermissionsExt;

    let dir = create_test_dir();
    let (store, _) = file_store(dir.path(), false);
    store.set_value("secret", &"s3cr3t".to_string(), MINUTE).unwrap();
    let mode = fs::metadata(store.filename(&CacheKey::from("secret")))
        .unwrap()
        .permissions()
        .mode();
    assert_eq!(mode & 0o777, 0o600);
}

#[test]
fn test_non_finite_float_reads_back_as_missing() {
    let dir = create_test_dir();
    let (store, _) = file_store(dir.path(), false);
    store.set_value("ratio", &f64::NAN, MINUTE).unwrap();
    store.set_value("edge", &f64::NEG_INFINITY, MINUTE).unwrap();

    assert!(store.has(&CacheKey::from("ratio")).unwrap());
    assert_eq!(store.get::<f64>("ratio").unwrap(), None);
    assert_eq!(store.get::<f64>("edge").unwrap(), None);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_values_round_trip(
        key in "[a-z0-9_.-]{1,24}",
        text in ".{0,64}",
        numbers in proptest::collection::vec(any::<i64>(), 0..16),
        ratios in proptest::collection::vec(
            any::<f64>().prop_filter("finite", |f| f.is_finite()),
            0..16,
        ),
    ) {
        let dir = create_test_dir();
        let (store, _) = file_store(dir.path(), true);
        let value = (text, numbers, ratios);
        store.set_value(key.as_str(), &value, MINUTE).unwrap();
        prop_assert_eq!(
            store.get::<(String, Vec<i64>, Vec<f64>)>(key.as_str()).unwrap(),
            Some(value)
        );
    }
}

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use gantry::cache::{Cache, CacheAdapterRegistry, CacheError, CacheExt};
use serde_json::json;
use tempfile::TempDir;

const HOUR: Duration = Duration::from_secs(3600);

fn file_config(dir: &TempDir) -> String {
    json!({ "path": dir.path().join("cache"), "extension": ".cache" }).to_string()
}

/// Contract shared by every backend.
fn exercise(cache: &dyn Cache) {
    cache.put("user:1", json!({"name": "ada"}), HOUR).expect("put");
    cache.put("user:2", json!("grace"), HOUR).expect("put");

    assert_eq!(cache.get("user:1"), Some(json!({"name": "ada"})));
    assert!(cache.exists("user:2"));
    assert_eq!(
        cache.get_multi(&["user:2", "missing", "user:1"]),
        vec![Some(json!("grace")), None, Some(json!({"name": "ada"}))]
    );

    cache.put("user:2", json!("hopper"), HOUR).expect("overwrite");
    assert_eq!(cache.get_as::<String>("user:2").as_deref(), Some("hopper"));

    cache.delete("user:1").expect("delete");
    cache.delete("user:1").expect("delete twice");
    assert!(!cache.exists("user:1"));

    cache.put("short", json!(1), Duration::from_millis(20)).expect("put");
    thread::sleep(Duration::from_millis(60));
    assert_eq!(cache.get("short"), None);
    assert!(!cache.exists("short"));

    cache.clear_all().expect("clear_all");
    assert_eq!(cache.get("user:2"), None);
}

#[test]
fn memory_backend_put_get_clear_all() {
    let registry = CacheAdapterRegistry::with_defaults();
    let cache = registry.construct("memory", "").expect("memory cache");
    exercise(cache.as_ref());
}

#[test]
fn file_backend_honours_the_same_contract() {
    let dir = TempDir::new().expect("tempdir");
    let registry = CacheAdapterRegistry::with_defaults();
    let cache = registry
        .construct("file", &file_config(&dir))
        .expect("file cache");
    assert!(dir.path().join("cache").is_dir());
    exercise(cache.as_ref());
}

#[test]
fn file_entries_outlive_the_instance() {
    let dir = TempDir::new().expect("tempdir");
    let registry = CacheAdapterRegistry::with_defaults();
    let config = file_config(&dir);

    let writer = registry.construct("file", &config).expect("file cache");
    writer.put_as("greeting", &"hello", HOUR).expect("put");
    drop(writer);

    let reader = registry.construct("file", &config).expect("file cache");
    assert_eq!(reader.get_as::<String>("greeting").as_deref(), Some("hello"));
}

#[test]
fn shared_memory_cache_is_usable_across_threads() {
    let cache = CacheAdapterRegistry::with_defaults()
        .construct("memory", "{}")
        .expect("memory cache");

    let handles: Vec<_> = (0..4)
        .map(|worker| {
            let cache = Arc::clone(&cache);
            thread::spawn(move || {
                for n in 0..25 {
                    let key = format!("w{worker}:{n}");
                    cache.put(&key, json!(n), HOUR).expect("put");
                    assert_eq!(cache.get(&key), Some(json!(n)));
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("worker");
    }

    assert!(cache.exists("w3:24"));
    cache.clear_all().expect("clear_all");
    assert!(!cache.exists("w0:0"));
}

#[test]
fn registry_errors() {
    let registry = CacheAdapterRegistry::with_defaults();
    assert!(matches!(
        registry.construct("redis", ""),
        Err(CacheError::UnknownAdapter(name)) if name == "redis"
    ));
    assert!(matches!(
        registry.construct("file", "{not json"),
        Err(CacheError::Config(_))
    ));
}

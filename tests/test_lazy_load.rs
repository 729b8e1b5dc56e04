//! Transient cores: lazy loading, single creation under contention and
//! bounded-cache eviction.

mod common;

use common::{lazy_config, loaded_container, wait_until, FakeFactory, WAIT};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test(flavor = "multi_thread")]
async fn lazy_core_loads_on_first_get() {
    let factory = FakeFactory::new();
    let (_tmp, container) = loaded_container(lazy_config(&["a", "b"], 10), &factory).await;

    assert!(container.core_names().is_empty());
    assert_eq!(container.all_core_names(), vec!["a", "b"]);
    assert!(container.unloaded_core_descriptor("a").is_some());
    assert_eq!(factory.creates("a"), 0);

    let a = container.get("a").unwrap().unwrap();
    assert_eq!(a.name(), "a");
    assert_eq!(factory.creates("a"), 1);
    assert!(container.is_loaded("a"));
    assert!(!container.is_loaded("b"));

    drop(a);
    assert!(container.get("a").unwrap().is_some());
    assert_eq!(factory.creates("a"), 1);
    container.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn unknown_name_is_none() {
    let factory = FakeFactory::new();
    let (_tmp, container) = loaded_container(lazy_config(&["a"], 10), &factory).await;

    assert!(container.get("nope").unwrap().is_none());
    container.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_gets_create_once() {
    let factory = FakeFactory::with_delay(Duration::from_millis(200));
    let (_tmp, container) = loaded_container(lazy_config(&["slow"], 10), &factory).await;

    let refs: Vec<_> = std::thread::scope(|s| {
        let handles: Vec<_> = (0..8)
            .map(|_| s.spawn(|| container.get("slow").unwrap().unwrap()))
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    assert_eq!(factory.creates("slow"), 1);
    assert!(refs.windows(2).all(|w| w[0].ptr_eq(&w[1])));
    assert_eq!(refs[0].ref_count(), 8);
    drop(refs);
    container.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn capacity_one_evicts_and_reloads() {
    let factory = FakeFactory::new();
    let (_tmp, container) = loaded_container(lazy_config(&["a", "b"], 1), &factory).await;

    let a = container.get("a").unwrap().unwrap().core().clone();
    let b = container.get("b").unwrap().unwrap();

    assert!(wait_until(WAIT, || a.is_closed()));
    assert_eq!(container.core_names(), vec!["b"]);
    assert!(container.unloaded_core_descriptor("a").is_some());
    drop(b);

    let a2 = container.get("a").unwrap().unwrap();
    assert!(!Arc::ptr_eq(a2.core(), &a));
    assert_eq!(factory.creates("a"), 2);
    assert_eq!(container.core_names(), vec!["a"]);
    container.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn referenced_core_survives_eviction_until_released() {
    let factory = FakeFactory::new();
    let (_tmp, container) = loaded_container(lazy_config(&["a", "b"], 1), &factory).await;

    let a = container.get("a").unwrap().unwrap();
    let b = container.get("b").unwrap().unwrap();

    assert_eq!(container.core_names(), vec!["b"]);
    std::thread::sleep(Duration::from_millis(100));
    assert!(a.is_retired());
    assert!(!a.is_closed());

    let a_core = Arc::clone(a.core());
    drop(a);
    assert!(wait_until(WAIT, || a_core.is_closed()));
    assert!(!b.is_closed());
    container.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn failed_lazy_load_is_recorded_and_retried() {
    let factory = FakeFactory::new();
    factory.fail("a");
    let (_tmp, container) = loaded_container(lazy_config(&["a"], 10), &factory).await;

    assert!(container.get("a").is_err());
    assert!(container.core_init_failures().contains_key("a"));

    // The descriptor is still known, so the next get tries again.
    factory.heal("a");
    assert!(container.get("a").unwrap().is_some());
    assert!(container.core_init_failures().is_empty());
    container.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn registering_permanent_core_drops_lazy_descriptor() {
    let factory = FakeFactory::new();
    let (_tmp, container) = loaded_container(lazy_config(&["a"], 10), &factory).await;

    let core = container
        .create(corehost::CoreDescriptor::new("a"))
        .unwrap();
    container.register("a", Arc::clone(&core), false).unwrap();

    assert!(container.unloaded_core_descriptor("a").is_none());
    assert!(Arc::ptr_eq(container.get("a").unwrap().unwrap().core(), &core));
    assert_eq!(factory.creates("a"), 1);
    container.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn rename_of_transient_core_in_full_cache_keeps_it_open() {
    let factory = FakeFactory::new();
    let (_tmp, container) = loaded_container(lazy_config(&["t"], 1), &factory).await;
    drop(container.get("t").unwrap().unwrap());

    container.rename("t", "u").unwrap();
    std::thread::sleep(Duration::from_millis(300));

    let u = container.get("u").unwrap().unwrap();
    assert_eq!(container.core_names(), vec!["u"]);
    assert!(!u.is_closed());
    assert!(!u.is_retired());
    assert_eq!(factory.closes(), 0);
    drop(u);
    container.shutdown();
}

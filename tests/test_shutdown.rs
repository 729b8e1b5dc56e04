//! Shutdown ordering and cluster-mode startup.

mod common;

use common::{
    entry, lazy_config, loaded_container, startup_config, FakeFactory, RecordingCoordinator,
};
use corehost::{ContainerConfig, CoreContainer, CoreDescriptor, CoreError};
use std::sync::Arc;
use tempfile::TempDir;

#[tokio::test(flavor = "multi_thread")]
async fn shutdown_closes_every_core_once() {
    let factory = FakeFactory::new();
    let (_tmp, container) = loaded_container(startup_config(&["a", "b", "c"]), &factory).await;
    let cores = container.cores();

    container.shutdown();
    container.shutdown();

    assert!(container.is_shut_down());
    assert!(cores.iter().all(|c| c.is_closed()));
    assert_eq!(factory.closes(), 3);
    assert!(container.core_names().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn shutdown_force_closes_referenced_cores() {
    let factory = FakeFactory::new();
    let (_tmp, container) = loaded_container(startup_config(&["a"]), &factory).await;
    let held = container.get("a").unwrap().unwrap();

    container.shutdown();

    assert!(held.is_closed());
    drop(held);
    assert_eq!(factory.closes(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn operations_after_shutdown_are_refused() {
    let factory = FakeFactory::new();
    let (_tmp, container) = loaded_container(lazy_config(&["lazy"], 10), &factory).await;
    let spare = container.create(CoreDescriptor::new("spare")).unwrap();

    container.shutdown();

    assert!(container.get("lazy").unwrap().is_none());
    assert_eq!(factory.creates("lazy"), 0);

    let err = container.create(CoreDescriptor::new("late")).unwrap_err();
    assert!(matches!(err, CoreError::ServiceUnavailable(_)));
    assert!(container.core_init_failures().is_empty());

    let err = container.register("spare", Arc::clone(&spare), false).unwrap_err();
    assert!(matches!(err, CoreError::IllegalState(_)));
    assert!(spare.is_closed());

    assert!(matches!(container.reload("lazy"), Err(CoreError::ServiceUnavailable(_))));
    assert!(matches!(container.load().await, Err(CoreError::ServiceUnavailable(_))));
}

#[tokio::test(flavor = "multi_thread")]
async fn cluster_mode_needs_two_load_threads() {
    let factory = FakeFactory::new();
    let tmp = TempDir::new().unwrap();
    let mut config = startup_config(&["a"]);
    config.settings.core_load_threads = 1;
    let container = CoreContainer::builder(tmp.path(), Arc::new(factory.clone()))
        .config(Arc::new(config))
        .coordinator(Arc::new(RecordingCoordinator::cluster("shared")))
        .build();

    assert!(matches!(container.load().await, Err(CoreError::Config(_))));
    assert_eq!(factory.creates("a"), 0);
    container.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn pre_register_failure_is_isolated() {
    let factory = FakeFactory::new();
    let tmp = TempDir::new().unwrap();
    let coordinator = Arc::new(RecordingCoordinator::cluster("shared"));
    coordinator.reject_pre_register("b");
    let container = CoreContainer::builder(tmp.path(), Arc::new(factory.clone()))
        .config(Arc::new(startup_config(&["a", "b", "c"])))
        .coordinator(coordinator.clone())
        .build();

    container.load().await.unwrap();

    assert_eq!(container.core_names(), vec!["a", "c"]);
    assert!(matches!(
        container.core_init_failures().get("b"),
        Some(CoreError::Coordination(_))
    ));
    assert_eq!(factory.creates("b"), 0);
    let events = coordinator.events();
    assert!(events.contains(&"unregister:b".to_string()));
    assert!(events.contains(&"register:a".to_string()));
    assert!(events.contains(&"collection_node:c".to_string()));
    container.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn cluster_core_without_config_set_fails() {
    let factory = FakeFactory::new();
    let tmp = TempDir::new().unwrap();
    let coordinator = RecordingCoordinator {
        active: true,
        ..RecordingCoordinator::default()
    };
    let container = CoreContainer::builder(tmp.path(), Arc::new(factory.clone()))
        .config(Arc::new(startup_config(&["a"])))
        .coordinator(Arc::new(coordinator))
        .build();

    container.load().await.unwrap();

    assert!(container.core_names().is_empty());
    assert!(matches!(
        container.core_init_failures().get("a"),
        Some(CoreError::Coordination(_))
    ));
    container.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn shutdown_notifies_coordinator_in_order() {
    let factory = FakeFactory::new();
    let tmp = TempDir::new().unwrap();
    let coordinator = Arc::new(RecordingCoordinator::cluster("shared"));
    let config = ContainerConfig::default()
        .with_core(entry("a", false, true))
        .with_core(entry("b", true, true));
    let container = CoreContainer::builder(tmp.path(), Arc::new(factory.clone()))
        .config(Arc::new(config))
        .coordinator(coordinator.clone())
        .build();
    container.load().await.unwrap();

    container.shutdown();

    let events = coordinator.events();
    let down = events.iter().position(|e| e == "publish_down:2").unwrap();
    let close = events.iter().position(|e| e == "close").unwrap();
    assert!(down < close);
    assert_eq!(events.last().map(String::as_str), Some("close"));
    assert_eq!(factory.closes(), 2);
}

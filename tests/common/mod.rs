#![allow(dead_code)]

use corehost::config::CoreEntry;
use corehost::{
    Core, CoreContainer, CoreContext, CoreDescriptor, CoreEngine, CoreError, CoreFactory,
    ContainerConfig, Coordinator, Result,
};
use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tempfile::TempDir;

/// Engine that only tracks its own lifecycle.
pub struct FakeEngine {
    pub name: String,
    pub generation: usize,
    closed: Arc<AtomicBool>,
    stats: Arc<FactoryStats>,
}

impl CoreEngine for FakeEngine {
    fn close(&self) -> Result<()> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.stats.closes.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    fn reload(&self, ctx: &CoreContext) -> Result<Box<dyn CoreEngine>> {
        if self.stats.fails(ctx.descriptor.name()) {
            return Err(CoreError::Engine(format!(
                "reload of {} refused",
                ctx.descriptor.name()
            )));
        }
        self.stats.reloads.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeEngine {
            name: self.name.clone(),
            generation: self.generation + 1,
            closed: Arc::new(AtomicBool::new(false)),
            stats: Arc::clone(&self.stats),
        }))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[derive(Default)]
pub struct FactoryStats {
    pub closes: AtomicUsize,
    pub reloads: AtomicUsize,
    creates: Mutex<HashMap<String, usize>>,
    failing: Mutex<HashSet<String>>,
}

impl FactoryStats {
    fn fails(&self, name: &str) -> bool {
        self.failing.lock().unwrap().contains(name)
    }
}

/// Counts creations per core name and fails on request.
#[derive(Clone, Default)]
pub struct FakeFactory {
    pub stats: Arc<FactoryStats>,
    delay: Option<Duration>,
}

impl FakeFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(delay: Duration) -> Self {
        FakeFactory {
            delay: Some(delay),
            ..Self::default()
        }
    }

    pub fn fail(&self, name: &str) {
        self.stats.failing.lock().unwrap().insert(name.to_string());
    }

    pub fn heal(&self, name: &str) {
        self.stats.failing.lock().unwrap().remove(name);
    }

    pub fn creates(&self, name: &str) -> usize {
        self.stats
            .creates
            .lock()
            .unwrap()
            .get(name)
            .copied()
            .unwrap_or(0)
    }

    pub fn closes(&self) -> usize {
        self.stats.closes.load(Ordering::SeqCst)
    }
}

impl CoreFactory for FakeFactory {
    fn create(&self, ctx: &CoreContext) -> Result<Box<dyn CoreEngine>> {
        let name = ctx.descriptor.name().to_string();
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }
        if self.stats.fails(&name) {
            return Err(CoreError::Engine(format!("cannot open index for {}", name)));
        }
        *self.stats.creates.lock().unwrap().entry(name.clone()).or_insert(0) += 1;
        Ok(Box::new(FakeEngine {
            name,
            generation: 0,
            closed: Arc::new(AtomicBool::new(false)),
            stats: Arc::clone(&self.stats),
        }))
    }
}

/// Cluster coordinator that records every call it receives.
#[derive(Default)]
pub struct RecordingCoordinator {
    pub active: bool,
    pub config_name: Option<String>,
    pub events: Mutex<Vec<String>>,
    pub reject: Mutex<HashSet<String>>,
}

impl RecordingCoordinator {
    pub fn cluster(config_name: &str) -> Self {
        RecordingCoordinator {
            active: true,
            config_name: Some(config_name.to_string()),
            ..Self::default()
        }
    }

    pub fn reject_pre_register(&self, name: &str) {
        self.reject.lock().unwrap().insert(name.to_string());
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    fn record(&self, event: String) {
        self.events.lock().unwrap().push(event);
    }
}

impl Coordinator for RecordingCoordinator {
    fn is_active(&self) -> bool {
        self.active
    }

    fn pre_register(&self, descriptor: &CoreDescriptor) -> Result<()> {
        self.record(format!("pre_register:{}", descriptor.name()));
        if self.reject.lock().unwrap().contains(descriptor.name()) {
            return Err(CoreError::Coordination(format!(
                "placement rejected for {}",
                descriptor.name()
            )));
        }
        Ok(())
    }

    fn register(&self, core: &Core) -> Result<()> {
        self.record(format!("register:{}", core.name()));
        Ok(())
    }

    fn unregister(&self, name: &str, _descriptor: &CoreDescriptor) -> Result<()> {
        self.record(format!("unregister:{}", name));
        Ok(())
    }

    fn publish_down(&self, cores: &[Arc<Core>]) -> Result<()> {
        self.record(format!("publish_down:{}", cores.len()));
        Ok(())
    }

    fn read_config_name(&self, _collection: &str) -> Result<Option<String>> {
        Ok(self.config_name.clone())
    }

    fn create_collection_node(&self, descriptor: &CoreDescriptor) -> Result<()> {
        self.record(format!("collection_node:{}", descriptor.collection_name()));
        Ok(())
    }

    fn close(&self) -> Result<()> {
        self.record("close".to_string());
        Ok(())
    }
}

/// A `cores.json` entry with the given lifecycle flags.
pub fn entry(name: &str, transient: bool, load_on_startup: bool) -> CoreEntry {
    let mut e = CoreEntry::default();
    e.attributes.insert("name".to_string(), serde_json::json!(name));
    e.attributes
        .insert("transient".to_string(), serde_json::json!(transient));
    e.attributes
        .insert("loadOnStartup".to_string(), serde_json::json!(load_on_startup));
    e
}

pub fn startup_config(names: &[&str]) -> ContainerConfig {
    names
        .iter()
        .fold(ContainerConfig::default(), |c, n| c.with_core(entry(n, false, true)))
}

pub fn lazy_config(names: &[&str], cache_size: usize) -> ContainerConfig {
    let mut config = names
        .iter()
        .fold(ContainerConfig::default(), |c, n| c.with_core(entry(n, true, false)));
    config.settings.transient_cache_size = cache_size;
    config
}

/// Build and load a standalone container over `config`.
pub async fn loaded_container(
    config: ContainerConfig,
    factory: &FakeFactory,
) -> (TempDir, Arc<CoreContainer>) {
    let temp_dir = TempDir::new().unwrap();
    let container = CoreContainer::builder(temp_dir.path(), Arc::new(factory.clone()))
        .config(Arc::new(config))
        .build();
    container.load().await.unwrap();
    (temp_dir, container)
}

/// Poll `cond` until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, cond: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    cond()
}

pub const WAIT: Duration = Duration::from_secs(5);

use crate::closer::BackgroundCloser;
use crate::config::{ConfigSource, ContainerConfig, ContainerSettings};
use crate::coordination::{Coordinator, NoopFanout, ShardFanout, Standalone};
use crate::descriptor::{validate_core_name, CoreDescriptor};
use crate::engine::{CoreEngine, CoreFactory};
use crate::error::{CoreError, Result};
use crate::instance::{Core, CoreRef};
use crate::registry::{CoreRegistry, PendingOp};
use crate::resource::ResourceLoader;
use indexmap::IndexMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

/// Last create/reload failure for one name. The descriptor is kept when
/// known so a later reload can retry the core.
struct CoreLoadFailure {
    descriptor: Option<Arc<CoreDescriptor>>,
    error: CoreError,
}

pub struct CoreContainerBuilder {
    home: PathBuf,
    factory: Arc<dyn CoreFactory>,
    config: Arc<dyn ConfigSource>,
    coordinator: Arc<dyn Coordinator>,
    fanout: Arc<dyn ShardFanout>,
}

impl CoreContainerBuilder {
    pub fn config(mut self, config: Arc<dyn ConfigSource>) -> Self {
        self.config = config;
        self
    }

    pub fn coordinator(mut self, coordinator: Arc<dyn Coordinator>) -> Self {
        self.coordinator = coordinator;
        self
    }

    pub fn fanout(mut self, fanout: Arc<dyn ShardFanout>) -> Self {
        self.fanout = fanout;
        self
    }

    pub fn build(self) -> Arc<CoreContainer> {
        let settings = self.config.settings().clone();
        tracing::info!(
            "[CONTAINER] home={}, coreLoadThreads={}, transientCacheSize={}, shareSchema={}, cluster={}",
            self.home.display(),
            settings.core_load_threads,
            settings.transient_cache_size,
            settings.share_schema,
            self.coordinator.is_active()
        );
        Arc::new(CoreContainer {
            registry: CoreRegistry::new(settings.transient_cache_size),
            resources: ResourceLoader::new(self.home.clone(), settings.share_schema),
            home: self.home,
            settings,
            config: self.config,
            factory: self.factory,
            coordinator: self.coordinator,
            fanout: self.fanout,
            init_failures: Mutex::new(IndexMap::new()),
            closer: Mutex::new(None),
            shutdown_started: AtomicBool::new(false),
        })
    }
}

/// Owns every core hosted by this node and drives their lifecycle.
pub struct CoreContainer {
    home: PathBuf,
    settings: ContainerSettings,
    config: Arc<dyn ConfigSource>,
    registry: Arc<CoreRegistry>,
    factory: Arc<dyn CoreFactory>,
    resources: ResourceLoader,
    coordinator: Arc<dyn Coordinator>,
    fanout: Arc<dyn ShardFanout>,
    init_failures: Mutex<IndexMap<String, CoreLoadFailure>>,
    closer: Mutex<Option<BackgroundCloser>>,
    shutdown_started: AtomicBool,
}

impl CoreContainer {
    /// Standalone container with no configured cores; see the builder
    /// methods to supply configuration and cluster collaborators.
    pub fn builder(home: impl Into<PathBuf>, factory: Arc<dyn CoreFactory>) -> CoreContainerBuilder {
        CoreContainerBuilder {
            home: home.into(),
            factory,
            config: Arc::new(ContainerConfig::default()),
            coordinator: Arc::new(Standalone),
            fanout: Arc::new(NoopFanout),
        }
    }

    // ── startup ─────────────────────────────────────────────────────────

    /// Load every configured core marked `loadOnStartup`, in parallel.
    ///
    /// Failures are isolated per core and recorded; only a bad thread count
    /// in cluster mode or a cancelled drain fails the whole call. The
    /// background closer starts once every load has finished.
    pub async fn load(self: &Arc<Self>) -> Result<()> {
        if self.is_shut_down() {
            return Err(CoreError::ServiceUnavailable(
                "container has been shut down".to_string(),
            ));
        }
        let cluster = self.coordinator.is_active();
        let threads = self.settings.core_load_threads;
        if cluster && threads < 2 {
            return Err(CoreError::Config(format!(
                "coreLoadThreads must be at least 2 in cluster mode, got {}",
                threads
            )));
        }

        let semaphore = Arc::new(Semaphore::new(threads.max(1)));
        let mut join_set = JoinSet::new();
        for entry in self.config.all_core_names() {
            let desc = match CoreDescriptor::from_config(self.config.as_ref(), &entry, cluster) {
                Ok(desc) => Arc::new(desc),
                Err(e) => {
                    self.record_failure(&entry, None, e);
                    continue;
                }
            };
            if desc.is_transient() || !desc.is_load_on_startup() {
                self.registry.put_descriptor(desc.name(), Arc::clone(&desc));
            }
            if !desc.is_load_on_startup() {
                tracing::debug!("[LOAD {}] deferred until first use", desc.name());
                continue;
            }

            let container = Arc::clone(self);
            let semaphore = Arc::clone(&semaphore);
            join_set.spawn(async move {
                let name = desc.name().to_string();
                let outcome = match semaphore.acquire_owned().await {
                    Ok(_permit) => {
                        tokio::task::spawn_blocking(move || container.load_startup_core(desc))
                            .await
                            .map_err(|e| CoreError::Engine(format!("core load task failed: {}", e)))
                    }
                    Err(e) => Err(CoreError::ServiceUnavailable(format!(
                        "core load pool closed: {}",
                        e
                    ))),
                };
                (name, outcome)
            });
        }

        let mut loaded = 0usize;
        let mut failed = 0usize;
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((_, Ok(true))) => loaded += 1,
                Ok((_, Ok(false))) => failed += 1,
                Ok((name, Err(e))) => {
                    failed += 1;
                    self.record_failure(&name, None, e);
                }
                Err(e) if e.is_cancelled() => {
                    return Err(CoreError::ServiceUnavailable(format!(
                        "interrupted while loading cores: {}",
                        e
                    )));
                }
                Err(e) => {
                    failed += 1;
                    tracing::error!("[LOAD] core load task panicked: {}", e);
                }
            }
        }
        tracing::info!("[LOAD] loaded {} cores, {} failed", loaded, failed);

        let mut closer = self.closer_slot();
        if closer.is_none() && !self.is_shut_down() {
            *closer = Some(BackgroundCloser::start(Arc::clone(&self.registry))?);
        }
        Ok(())
    }

    /// Runs on the blocking pool. Returns whether the core was registered.
    fn load_startup_core(&self, desc: Arc<CoreDescriptor>) -> bool {
        let name = desc.name().to_string();
        let core = match self
            .coordinator
            .pre_register(&desc)
            .and_then(|_| self.create_core(Arc::clone(&desc)))
        {
            Ok(core) => core,
            Err(e) => {
                self.unregister_quietly(&name, &desc);
                self.record_failure(&name, Some(&desc), e);
                return false;
            }
        };
        match self.register_core(desc.is_transient(), &name, Arc::clone(&core), false) {
            Ok(_) => true,
            Err(e) => {
                self.unregister_quietly(&name, &desc);
                self.record_failure(&name, Some(&desc), e);
                core.close_now();
                false
            }
        }
    }

    // ── create / register ───────────────────────────────────────────────

    /// Build a core from `desc` without registering it. Failures are
    /// recorded against the descriptor's name.
    pub fn create(&self, desc: CoreDescriptor) -> Result<Arc<Core>> {
        if self.is_shut_down() {
            return Err(CoreError::ServiceUnavailable(format!(
                "container is shutting down, cannot create core {}",
                desc.name()
            )));
        }
        let desc = Arc::new(desc);
        let name = desc.name().to_string();
        self.create_core(Arc::clone(&desc))
            .map_err(|e| self.record_failure(&name, Some(&desc), e))
    }

    fn create_core(&self, desc: Arc<CoreDescriptor>) -> Result<Arc<Core>> {
        let name = desc.name().to_string();
        if self.is_shut_down() {
            return Err(CoreError::ServiceUnavailable(format!(
                "container is shutting down, cannot create core {}",
                name
            )));
        }
        tracing::info!(
            "[LOAD {}] creating core in {}",
            name,
            self.resources.resolve_instance_dir(&desc).display()
        );

        let config_set = self.resolve_config_set(&desc)?;
        let ctx = self.resources.load_context(Arc::clone(&desc), config_set)?;
        let engine = self.factory.create(&ctx)?;
        if let Err(e) = engine.open() {
            close_quietly(&name, engine.as_ref());
            return Err(e);
        }

        // In cluster mode recovery is driven by the coordinator.
        if !self.coordinator.is_active() && engine.has_update_log() {
            match engine.recover_from_log() {
                Ok(0) => {}
                Ok(n) => tracing::info!("[RECOVERY {}] replayed {} buffered updates", name, n),
                Err(e) => {
                    tracing::error!("[RECOVERY {}] log replay failed: {}", name, e);
                    close_quietly(&name, engine.as_ref());
                    return Err(e);
                }
            }
        }
        Ok(Core::new(desc, engine))
    }

    fn resolve_config_set(&self, desc: &CoreDescriptor) -> Result<Option<String>> {
        if !self.coordinator.is_active() {
            return Ok(None);
        }
        self.coordinator.create_collection_node(desc)?;
        let collection = desc.collection_name();
        let config_name = self.coordinator.read_config_name(collection)?.ok_or_else(|| {
            CoreError::Coordination(format!(
                "could not find config set name for collection {}",
                collection
            ))
        })?;
        Ok(Some(config_name))
    }

    /// Register `core` under `name` with the transient flag taken from its
    /// descriptor. See [`CoreContainer::register_core`].
    pub fn register(&self, name: &str, core: Arc<Core>, return_prev: bool) -> Result<Option<Arc<Core>>> {
        let transient = core.descriptor().is_transient();
        self.register_core(transient, name, core, return_prev)
    }

    /// Publish `core` under `name`. The displaced core is returned when
    /// `return_prev` is set and queued for close otherwise.
    ///
    /// After shutdown the new core is closed and the call fails.
    pub fn register_core(
        &self,
        transient: bool,
        name: &str,
        core: Arc<Core>,
        return_prev: bool,
    ) -> Result<Option<Arc<Core>>> {
        validate_core_name(name)?;
        if self.is_shut_down() {
            core.close_now();
            return Err(CoreError::IllegalState(format!(
                "this container has been shut down, cannot register core {}",
                name
            )));
        }

        // Cleared before publishing so nobody can see the new core and
        // then a stale failure.
        self.failures().shift_remove(name);
        let prev = self.registry.put(name, Arc::clone(&core), transient);
        if prev.is_none() {
            tracing::info!("[REGISTRY] registering core: {}", name);
        } else {
            tracing::info!("[REGISTRY] replacing core: {}", name);
        }
        if let Err(e) = self.coordinator.register(&core) {
            tracing::warn!("[REGISTRY] coordinator registration failed for {}: {}", name, e);
        }

        match prev {
            Some(old) if !return_prev => {
                self.registry.schedule_close(old);
                Ok(None)
            }
            other => Ok(other),
        }
    }

    // ── lookup ──────────────────────────────────────────────────────────

    /// Counted reference to core `name`, loading it on first use when only
    /// its descriptor is known.
    ///
    /// `Ok(None)` means the name is unknown or the container is shutting
    /// down. A recorded init failure comes back as the error.
    pub fn get(&self, name: &str) -> Result<Option<CoreRef>> {
        let name = self.normalize(name);
        if let Some(core) = self.registry.acquire(&name) {
            return Ok(Some(core));
        }
        if self.is_shut_down() {
            return Ok(None);
        }

        let Some(desc) = self.registry.unloaded_descriptor(&name) else {
            return match self.init_failure(&name) {
                Some(cause) => Err(CoreError::InitFailure {
                    name,
                    cause: Box::new(cause),
                }),
                None => Ok(None),
            };
        };

        let existing = match self.registry.wait_add_pending_op(&name) {
            Ok(existing) => existing,
            Err(_) => return Ok(None),
        };
        let _op = PendingOp::adopt(&self.registry, &name);
        // The wait may have ended because of shutdown itself.
        if self.is_shut_down() {
            return Ok(None);
        }
        if let Some(core) = existing {
            return Ok(Some(core));
        }
        self.load_lazy_core(&name, desc).map(Some)
    }

    fn load_lazy_core(&self, name: &str, desc: Arc<CoreDescriptor>) -> Result<CoreRef> {
        tracing::info!("[LOAD {}] loading on first use", name);
        let core = match self
            .coordinator
            .pre_register(&desc)
            .and_then(|_| self.create_core(Arc::clone(&desc)))
        {
            Ok(core) => core,
            Err(e) => {
                self.unregister_quietly(name, &desc);
                return Err(self.record_failure(name, Some(&desc), e));
            }
        };
        // Counted before it is visible, so an eviction cannot close it
        // under the caller.
        let core_ref = self.registry.share(&core);
        if let Err(e) = self.register_core(desc.is_transient(), name, Arc::clone(&core), false) {
            drop(core_ref);
            self.unregister_quietly(name, &desc);
            core.close_now();
            return Err(self.record_failure(name, Some(&desc), e));
        }
        Ok(core_ref)
    }

    // ── reload / swap / rename / remove ─────────────────────────────────

    /// Replace core `name` with a fresh instance built from reloaded
    /// config and schema. Holders of the old core keep using it until they
    /// release it. A core that failed to load is retried from its
    /// descriptor.
    pub fn reload(&self, name: &str) -> Result<()> {
        let name = self.normalize(name);
        let existing = self.registry.wait_add_pending_op(&name)?;
        let _op = PendingOp::adopt(&self.registry, &name);

        let Some(current) = existing else {
            let Some(desc) = self.failed_descriptor(&name) else {
                return Err(CoreError::NotFound(name));
            };
            tracing::info!("[RELOAD {}] retrying core after earlier failure", name);
            let core = self
                .create_core(Arc::clone(&desc))
                .map_err(|e| self.record_failure(&name, Some(&desc), e))?;
            self.register_core(desc.is_transient(), &name, core, false)
                .map_err(|e| self.record_failure(&name, Some(&desc), e))?;
            return Ok(());
        };

        let desc = Arc::clone(current.descriptor());
        let rebuilt = self
            .resolve_config_set(&desc)
            .and_then(|config_set| self.resources.load_context(Arc::clone(&desc), config_set))
            .and_then(|ctx| current.engine().reload(&ctx))
            .and_then(|engine| match engine.open() {
                Ok(()) => Ok(engine),
                Err(e) => {
                    close_quietly(&name, engine.as_ref());
                    Err(e)
                }
            });
        let engine = rebuilt.map_err(|e| self.record_failure(&name, Some(&desc), e))?;

        let new_core = Core::new(desc, engine);
        self.register_core(new_core.descriptor().is_transient(), &name, new_core, false)
            .map_err(|e| self.record_failure(&name, Some(current.descriptor()), e))?;
        tracing::info!("[RELOAD {}] reloaded", name);
        Ok(())
    }

    /// Exchange the names of two cores, loading either one if needed. No
    /// core is closed.
    pub fn swap(&self, n0: &str, n1: &str) -> Result<()> {
        let n0 = self.normalize(n0);
        let n1 = self.normalize(n1);
        let _c0 = self.get(&n0)?.ok_or_else(|| CoreError::NotFound(n0.clone()))?;
        let _c1 = self.get(&n1)?.ok_or_else(|| CoreError::NotFound(n1.clone()))?;
        self.registry.swap(&n0, &n1)
    }

    /// Rebind core `name` to `to_name`. The core keeps running and is
    /// registered as permanent under its new name.
    pub fn rename(&self, name: &str, to_name: &str) -> Result<()> {
        validate_core_name(to_name)?;
        let name = self.normalize(name);
        if name == to_name {
            return Ok(());
        }
        let core = self
            .get(&name)?
            .ok_or_else(|| CoreError::NotFound(name.clone()))?;
        self.register_core(false, to_name, Arc::clone(core.core()), false)?;
        self.registry.remove(&name, false);
        tracing::info!("[REGISTRY] renamed core {} to {}", name, to_name);
        Ok(())
    }

    /// Drop core `name` from the registry and queue it for close.
    pub fn remove(&self, name: &str) -> Option<Arc<Core>> {
        let name = self.normalize(name);
        self.registry.remove(&name, true)
    }

    // ── shutdown ────────────────────────────────────────────────────────

    /// Stop the container. Safe to call more than once.
    pub fn shutdown(&self) {
        if self.shutdown_started.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!("[shutdown] shutting down core container {}", self.home.display());
        self.registry.begin_shutdown();

        let cores = self.registry.cores();
        if let Err(e) = self.coordinator.publish_down(&cores) {
            tracing::warn!("[shutdown] failed to publish down state: {}", e);
        }
        self.cancel_core_recoveries();
        self.registry.notify_all();

        let closer = self.closer_slot().take();
        if let Some(mut closer) = closer {
            let timeout = Duration::from_millis(self.settings.closer_join_timeout_ms);
            if !closer.join_timeout(timeout) {
                tracing::warn!("[shutdown] core closer did not stop within {:?}", timeout);
            }
        }

        self.registry.close_all();
        self.registry.notify_all();

        if let Err(e) = self.fanout.close() {
            tracing::warn!("[shutdown] error closing shard fan-out: {}", e);
        }
        if let Err(e) = self.coordinator.close() {
            tracing::warn!("[shutdown] error closing coordinator: {}", e);
        }
        tracing::info!("[shutdown] core container stopped");
    }

    pub fn cancel_core_recoveries(&self) {
        for core in self.registry.cores() {
            self.coordinator.cancel_recovery(&core);
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown_started.load(Ordering::SeqCst) || self.registry.is_shut_down()
    }

    // ── accessors ───────────────────────────────────────────────────────

    pub fn home(&self) -> &Path {
        &self.home
    }

    pub fn settings(&self) -> &ContainerSettings {
        &self.settings
    }

    pub fn default_core_name(&self) -> &str {
        &self.settings.default_core_name
    }

    pub fn core_names(&self) -> Vec<String> {
        self.registry.core_names()
    }

    pub fn core_names_for(&self, core: &Arc<Core>) -> Vec<String> {
        self.registry.core_names_for(core)
    }

    pub fn all_core_names(&self) -> Vec<String> {
        self.registry.all_core_names()
    }

    pub fn cores(&self) -> Vec<Arc<Core>> {
        self.registry.cores()
    }

    pub fn is_loaded(&self, name: &str) -> bool {
        self.registry.is_loaded(&self.normalize(name))
    }

    pub fn unloaded_core_descriptor(&self, name: &str) -> Option<Arc<CoreDescriptor>> {
        self.registry.unloaded_descriptor(&self.normalize(name))
    }

    /// Snapshot of recorded init failures, oldest first.
    pub fn core_init_failures(&self) -> IndexMap<String, CoreError> {
        self.failures()
            .iter()
            .map(|(name, f)| (name.clone(), f.error.clone()))
            .collect()
    }

    pub fn registry(&self) -> &Arc<CoreRegistry> {
        &self.registry
    }

    pub fn shard_fanout(&self) -> &Arc<dyn ShardFanout> {
        &self.fanout
    }

    pub fn coordinator(&self) -> &Arc<dyn Coordinator> {
        &self.coordinator
    }

    // ── internals ───────────────────────────────────────────────────────

    fn normalize(&self, name: &str) -> String {
        if name.is_empty() {
            self.settings.default_core_name.clone()
        } else {
            name.to_string()
        }
    }

    fn failures(&self) -> MutexGuard<'_, IndexMap<String, CoreLoadFailure>> {
        self.init_failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn closer_slot(&self) -> MutexGuard<'_, Option<BackgroundCloser>> {
        self.closer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn init_failure(&self, name: &str) -> Option<CoreError> {
        self.failures().get(name).map(|f| f.error.clone())
    }

    fn failed_descriptor(&self, name: &str) -> Option<Arc<CoreDescriptor>> {
        self.failures().get(name).and_then(|f| f.descriptor.clone())
    }

    /// Store `err` as the latest failure for `name` (moving it to the end)
    /// and return it wrapped for the caller.
    fn record_failure(
        &self,
        name: &str,
        descriptor: Option<&Arc<CoreDescriptor>>,
        err: CoreError,
    ) -> CoreError {
        let cause = err.into_cause();
        tracing::error!("[LOAD {}] unable to create core: {}", name, cause);
        let mut failures = self.failures();
        failures.shift_remove(name);
        failures.insert(
            name.to_string(),
            CoreLoadFailure {
                descriptor: descriptor.cloned(),
                error: cause.clone(),
            },
        );
        CoreError::InitFailure {
            name: name.to_string(),
            cause: Box::new(cause),
        }
    }

    fn unregister_quietly(&self, name: &str, desc: &CoreDescriptor) {
        if let Err(e) = self.coordinator.unregister(name, desc) {
            tracing::warn!("[LOAD {}] unregister after failed load also failed: {}", name, e);
        }
    }
}

impl Drop for CoreContainer {
    fn drop(&mut self) {
        if !self.shutdown_started.load(Ordering::SeqCst) {
            tracing::error!(
                "CoreContainer for {} was not shut down prior to drop; cores may not have been closed",
                self.home.display()
            );
        }
    }
}

fn close_quietly(name: &str, engine: &dyn CoreEngine) {
    if let Err(e) = engine.close() {
        tracing::warn!("[LOAD {}] error closing partially built core: {}", name, e);
    }
}

use crate::descriptor::CoreDescriptor;
use crate::error::{CoreError, Result};
use crate::instance::{Core, CoreRef};
use lru::LruCache;
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

struct RegistryState {
    /// Permanent cores, never evicted.
    cores: HashMap<String, Arc<Core>>,
    /// Transient cores in access order, bounded by `transient_cache_size`.
    transient: LruCache<String, Arc<Core>>,
    /// Descriptors of cores that may be loaded lazily.
    descriptors: HashMap<String, Arc<CoreDescriptor>>,
    pending_ops: HashSet<String>,
    pending_closes: VecDeque<Arc<Core>>,
}

impl RegistryState {
    fn find(&self, name: &str) -> Option<&Arc<Core>> {
        self.cores.get(name).or_else(|| self.transient.peek(name))
    }

    fn has_closable(&self) -> bool {
        self.pending_closes
            .iter()
            .any(|c| !self.pending_ops.contains(&c.name()))
    }

    fn is_close_pending(&self, name: &str) -> bool {
        self.pending_closes.iter().any(|c| c.name() == name)
    }
}

/// The three views of cores plus the pending-operation table, all guarded
/// by one mutex. `modified` is signalled whenever a pending op clears or a
/// core is queued for close.
pub struct CoreRegistry {
    state: Mutex<RegistryState>,
    modified: Condvar,
    transient_cache_size: usize,
    shut_down: AtomicBool,
}

impl CoreRegistry {
    pub fn new(transient_cache_size: usize) -> Arc<Self> {
        Arc::new(CoreRegistry {
            state: Mutex::new(RegistryState {
                cores: HashMap::new(),
                transient: LruCache::unbounded(),
                descriptors: HashMap::new(),
                pending_ops: HashSet::new(),
                pending_closes: VecDeque::new(),
            }),
            modified: Condvar::new(),
            transient_cache_size: transient_cache_size.max(1),
            shut_down: AtomicBool::new(false),
        })
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn transient_cache_size(&self) -> usize {
        self.transient_cache_size
    }

    /// Insert `core` under `name`, returning the core it displaced.
    ///
    /// The displaced core is left to the caller. Only transient inserts may
    /// evict, and evicted cores go straight to the close queue.
    pub fn put(&self, name: &str, core: Arc<Core>, transient: bool) -> Option<Arc<Core>> {
        let mut st = self.lock();
        core.set_name(name);
        let prev = if transient {
            let prev_permanent = st.cores.remove(name);
            let prev_transient = st.transient.put(name.to_string(), Arc::clone(&core));
            self.evict_locked(&mut st, name);
            prev_transient.or(prev_permanent)
        } else {
            let prev_transient = st.transient.pop(name);
            st.descriptors.remove(name);
            let prev_permanent = st.cores.insert(name.to_string(), Arc::clone(&core));
            prev_permanent.or(prev_transient)
        };
        prev.filter(|p| !Arc::ptr_eq(p, &core))
    }

    /// Shrink the transient cache back to capacity, never evicting `keep`.
    /// Idle cores go first; a referenced victim is retired and closes once
    /// its last reference is released.
    fn evict_locked(&self, st: &mut RegistryState, keep: &str) {
        let kept = st.transient.peek(keep).cloned();
        // An entry sharing the kept core is another binding of a live core.
        let evictable = |name: &String, core: &Arc<Core>| {
            name.as_str() != keep && !kept.as_ref().is_some_and(|k| Arc::ptr_eq(k, core))
        };
        while st.transient.len() > self.transient_cache_size {
            let victim = st
                .transient
                .iter()
                .rev()
                .find(|(name, core)| evictable(*name, *core) && core.ref_count() == 0)
                .or_else(|| {
                    st.transient
                        .iter()
                        .rev()
                        .find(|(name, core)| evictable(*name, *core))
                })
                .map(|(name, _)| name.clone());
            let Some(victim) = victim else { break };
            let Some(core) = st.transient.pop(&victim) else { break };
            tracing::info!(
                "[REGISTRY] evicting transient core {} (refs={})",
                victim,
                core.ref_count()
            );
            st.descriptors
                .entry(victim)
                .or_insert_with(|| Arc::clone(core.descriptor()));
            self.schedule_close_locked(st, core);
        }
    }

    /// Permanent map first, then the transient cache. With `mark_used` the
    /// core's recency is refreshed and its count incremented.
    pub(crate) fn lookup(&self, name: &str, mark_used: bool) -> Option<Arc<Core>> {
        let mut st = self.lock();
        Self::lookup_locked(&mut st, name, mark_used)
    }

    fn lookup_locked(st: &mut RegistryState, name: &str, mark_used: bool) -> Option<Arc<Core>> {
        if let Some(core) = st.cores.get(name) {
            if mark_used {
                core.retain();
            }
            return Some(Arc::clone(core));
        }
        if mark_used {
            let core = st.transient.get(name)?;
            core.retain();
            Some(Arc::clone(core))
        } else {
            st.transient.peek(name).cloned()
        }
    }

    /// Look up `name` without touching recency or counts.
    pub fn peek(&self, name: &str) -> Option<Arc<Core>> {
        self.lookup(name, false)
    }

    /// Counted reference to the core registered under `name`.
    pub fn acquire(self: &Arc<Self>, name: &str) -> Option<CoreRef> {
        self.lookup(name, true)
            .map(|core| CoreRef::adopt(core, Arc::clone(self)))
    }

    /// Counted reference to a core the caller already holds.
    pub fn share(self: &Arc<Self>, core: &Arc<Core>) -> CoreRef {
        core.retain();
        CoreRef::adopt(Arc::clone(core), Arc::clone(self))
    }

    pub fn unloaded_descriptor(&self, name: &str) -> Option<Arc<CoreDescriptor>> {
        self.lock().descriptors.get(name).cloned()
    }

    pub fn put_descriptor(&self, name: &str, descriptor: Arc<CoreDescriptor>) {
        self.lock().descriptors.insert(name.to_string(), descriptor);
    }

    /// Mark `name` pending, first waiting out any in-flight operation or
    /// queued close for it. Returns whatever is registered under `name`
    /// once the marker is held.
    ///
    /// Callers must pair a successful return with [`PendingOp`] (or
    /// [`CoreRegistry::remove_pending_op`]).
    pub fn wait_add_pending_op(self: &Arc<Self>, name: &str) -> Result<Option<CoreRef>> {
        let mut st = self.lock();
        loop {
            if self.is_shut_down() {
                return Err(CoreError::ServiceUnavailable(format!(
                    "container is shutting down, cannot operate on core {}",
                    name
                )));
            }
            if !st.pending_ops.contains(name) && !st.is_close_pending(name) {
                break;
            }
            st = self
                .modified
                .wait(st)
                .unwrap_or_else(PoisonError::into_inner);
        }
        st.pending_ops.insert(name.to_string());
        Ok(Self::lookup_locked(&mut st, name, true)
            .map(|core| CoreRef::adopt(core, Arc::clone(self))))
    }

    pub fn remove_pending_op(&self, name: &str) {
        let mut st = self.lock();
        st.pending_ops.remove(name);
        self.modified.notify_all();
    }

    pub fn is_pending(&self, name: &str) -> bool {
        self.lock().pending_ops.contains(name)
    }

    /// Drop `name` from every view, including its descriptor. With
    /// `close_old` the removed core is queued for close.
    pub fn remove(&self, name: &str, close_old: bool) -> Option<Arc<Core>> {
        let removed = {
            let mut st = self.lock();
            st.descriptors.remove(name);
            st.cores.remove(name).or_else(|| st.transient.pop(name))
        };
        if close_old {
            if let Some(core) = &removed {
                self.schedule_close(Arc::clone(core));
            }
        }
        removed
    }

    /// Exchange the cores bound to `n0` and `n1`. Each name keeps its view.
    pub fn swap(&self, n0: &str, n1: &str) -> Result<()> {
        let mut st = self.lock();
        let c0 = st
            .find(n0)
            .cloned()
            .ok_or_else(|| CoreError::NotFound(n0.to_string()))?;
        let c1 = st
            .find(n1)
            .cloned()
            .ok_or_else(|| CoreError::NotFound(n1.to_string()))?;
        Self::rebind_locked(&mut st, n0, Arc::clone(&c1));
        Self::rebind_locked(&mut st, n1, Arc::clone(&c0));
        c0.set_name(n1);
        c1.set_name(n0);
        tracing::info!("[REGISTRY] swapped cores {} and {}", n0, n1);
        Ok(())
    }

    fn rebind_locked(st: &mut RegistryState, name: &str, core: Arc<Core>) {
        if let Some(slot) = st.cores.get_mut(name) {
            *slot = core;
        } else if let Some(slot) = st.transient.peek_mut(name) {
            *slot = core;
        }
    }

    /// Pop the next queued core whose name has no operation in flight and
    /// mark that name pending. Only the background closer calls this.
    pub(crate) fn core_to_close(&self) -> Option<Arc<Core>> {
        let mut guard = self.lock();
        let st = &mut *guard;
        let idx = st
            .pending_closes
            .iter()
            .position(|c| !st.pending_ops.contains(&c.name()))?;
        let core = st.pending_closes.remove(idx)?;
        st.pending_ops.insert(core.name());
        Some(core)
    }

    /// Retire `core` and queue it for close once nothing references it.
    /// After shutdown the close happens inline.
    pub(crate) fn schedule_close(&self, core: Arc<Core>) {
        if self.is_shut_down() {
            core.retire();
            if core.ref_count() == 0 {
                core.close_now();
            }
            return;
        }
        let mut st = self.lock();
        self.schedule_close_locked(&mut st, core);
    }

    fn schedule_close_locked(&self, st: &mut RegistryState, core: Arc<Core>) {
        core.retire();
        if core.ref_count() > 0 || core.is_closed() {
            return;
        }
        if !st.pending_closes.iter().any(|c| Arc::ptr_eq(c, &core)) {
            st.pending_closes.push_back(core);
            self.modified.notify_all();
        }
    }

    /// Block until a queued core can be closed or shutdown begins.
    pub(crate) fn wait_for_work(&self) {
        let mut st = self.lock();
        while !self.is_shut_down() && !st.has_closable() {
            st = self
                .modified
                .wait(st)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    pub fn notify_all(&self) {
        let _st = self.lock();
        self.modified.notify_all();
    }

    pub(crate) fn begin_shutdown(&self) {
        let _st = self.lock();
        self.shut_down.store(true, Ordering::SeqCst);
        self.modified.notify_all();
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    /// Names of loaded cores.
    pub fn core_names(&self) -> Vec<String> {
        let st = self.lock();
        let names: BTreeSet<String> = st
            .cores
            .keys()
            .chain(st.transient.iter().map(|(k, _)| k))
            .cloned()
            .collect();
        names.into_iter().collect()
    }

    /// Every name currently bound to `core`.
    pub fn core_names_for(&self, core: &Arc<Core>) -> Vec<String> {
        let st = self.lock();
        let names: BTreeSet<String> = st
            .cores
            .iter()
            .chain(st.transient.iter())
            .filter(|(_, c)| Arc::ptr_eq(c, core))
            .map(|(k, _)| k.clone())
            .collect();
        names.into_iter().collect()
    }

    /// Loaded names plus names known only by descriptor.
    pub fn all_core_names(&self) -> Vec<String> {
        let st = self.lock();
        let names: BTreeSet<String> = st
            .cores
            .keys()
            .chain(st.transient.iter().map(|(k, _)| k))
            .chain(st.descriptors.keys())
            .cloned()
            .collect();
        names.into_iter().collect()
    }

    pub fn is_loaded(&self, name: &str) -> bool {
        let st = self.lock();
        st.cores.contains_key(name) || st.transient.contains(name)
    }

    /// Snapshot of the loaded cores, each listed once.
    pub fn cores(&self) -> Vec<Arc<Core>> {
        let st = self.lock();
        let mut out: Vec<Arc<Core>> = Vec::new();
        for core in st.cores.values().chain(st.transient.iter().map(|(_, c)| c)) {
            if !out.iter().any(|c| Arc::ptr_eq(c, core)) {
                out.push(Arc::clone(core));
            }
        }
        out
    }

    pub fn pending_close_count(&self) -> usize {
        self.lock().pending_closes.len()
    }

    /// Close every registered and queued core, referenced or not. Cores
    /// queued while this runs are picked up by the next round.
    pub(crate) fn close_all(&self) {
        loop {
            let batch: Vec<Arc<Core>> = {
                let mut st = self.lock();
                let mut batch: Vec<Arc<Core>> = st.cores.drain().map(|(_, c)| c).collect();
                while let Some((_, core)) = st.transient.pop_lru() {
                    batch.push(core);
                }
                batch.extend(st.pending_closes.drain(..));
                batch
            };
            if batch.is_empty() {
                break;
            }
            for core in batch {
                core.retire();
                core.close_now();
            }
        }
    }
}

/// Clears a pending-operation marker when dropped.
pub struct PendingOp {
    registry: Arc<CoreRegistry>,
    name: String,
}

impl PendingOp {
    /// Take ownership of a marker set by [`CoreRegistry::wait_add_pending_op`].
    pub fn adopt(registry: &Arc<CoreRegistry>, name: &str) -> Self {
        PendingOp {
            registry: Arc::clone(registry),
            name: name.to_string(),
        }
    }
}

impl Drop for PendingOp {
    fn drop(&mut self) {
        self.registry.remove_pending_op(&self.name);
    }
}

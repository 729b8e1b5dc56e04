use crate::descriptor::CoreDescriptor;
use crate::engine::CoreEngine;
use crate::registry::CoreRegistry;
use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

/// A loaded core: one engine plus its lifecycle state.
///
/// `refs` counts outstanding [`CoreRef`]s. A core becomes closable once it
/// is `retired` (dropped from every registry view) and `refs` is zero.
pub struct Core {
    name: RwLock<String>,
    descriptor: Arc<CoreDescriptor>,
    engine: Box<dyn CoreEngine>,
    refs: AtomicUsize,
    retired: AtomicBool,
    closed: AtomicBool,
}

impl Core {
    pub fn new(descriptor: Arc<CoreDescriptor>, engine: Box<dyn CoreEngine>) -> Arc<Self> {
        Arc::new(Core {
            name: RwLock::new(descriptor.name().to_string()),
            descriptor,
            engine,
            refs: AtomicUsize::new(0),
            retired: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }

    /// Current binding name. Changes on rename and swap.
    pub fn name(&self) -> String {
        self.name
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn set_name(&self, name: &str) {
        *self.name.write().unwrap_or_else(PoisonError::into_inner) = name.to_string();
    }

    pub fn descriptor(&self) -> &Arc<CoreDescriptor> {
        &self.descriptor
    }

    pub fn engine(&self) -> &dyn CoreEngine {
        self.engine.as_ref()
    }

    pub fn ref_count(&self) -> usize {
        self.refs.load(Ordering::SeqCst)
    }

    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn retain(&self) {
        self.refs.fetch_add(1, Ordering::SeqCst);
    }

    /// Returns true when this release made a retired core closable.
    pub(crate) fn release(&self) -> bool {
        let prev = self
            .refs
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        match prev {
            Ok(1) => self.is_retired(),
            Ok(_) => false,
            Err(_) => {
                tracing::error!("[CORE {}] reference released more often than taken", self.name());
                false
            }
        }
    }

    pub(crate) fn retire(&self) {
        self.retired.store(true, Ordering::SeqCst);
    }

    /// Close the engine. Only the first call does anything; errors are
    /// logged because callers are always on a teardown path.
    pub(crate) fn close_now(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let name = self.name();
        let refs = self.ref_count();
        if refs > 0 {
            tracing::warn!("[CORE {}] closing with {} outstanding references", name, refs);
        }
        match self.engine.close() {
            Ok(()) => tracing::info!("[CORE {}] closed", name),
            Err(e) => tracing::error!("[CORE {}] error while closing: {}", name, e),
        }
    }
}

impl fmt::Debug for Core {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Core")
            .field("name", &self.name())
            .field("refs", &self.ref_count())
            .field("retired", &self.is_retired())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// A counted reference to a registered core. Dropping it is the release.
pub struct CoreRef {
    core: Arc<Core>,
    registry: Arc<CoreRegistry>,
}

impl CoreRef {
    /// Wrap a core whose count the caller has already incremented.
    pub(crate) fn adopt(core: Arc<Core>, registry: Arc<CoreRegistry>) -> Self {
        CoreRef { core, registry }
    }

    pub fn core(&self) -> &Arc<Core> {
        &self.core
    }

    pub fn ptr_eq(&self, other: &CoreRef) -> bool {
        Arc::ptr_eq(&self.core, &other.core)
    }
}

impl Deref for CoreRef {
    type Target = Core;

    fn deref(&self) -> &Core {
        &self.core
    }
}

impl Clone for CoreRef {
    fn clone(&self) -> Self {
        self.core.retain();
        CoreRef {
            core: Arc::clone(&self.core),
            registry: Arc::clone(&self.registry),
        }
    }
}

impl Drop for CoreRef {
    fn drop(&mut self) {
        if self.core.release() {
            self.registry.schedule_close(Arc::clone(&self.core));
        }
    }
}

impl fmt::Debug for CoreRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CoreRef").field(&self.core).finish()
    }
}

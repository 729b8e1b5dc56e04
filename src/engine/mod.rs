pub mod local;
pub mod tlog;

use crate::error::Result;
use crate::resource::CoreContext;
use std::any::Any;

/// The index engine behind one loaded core.
///
/// The container never touches engine internals; it drives the lifecycle
/// through this trait and leaves search/indexing I/O to the implementation.
pub trait CoreEngine: Send + Sync {
    /// Called once after construction, before the core is registered.
    fn open(&self) -> Result<()> {
        Ok(())
    }

    /// Physically release the engine's resources. Called at most once.
    fn close(&self) -> Result<()>;

    /// Build a replacement engine for the same core from a freshly loaded
    /// context. The current engine keeps serving until it is closed.
    fn reload(&self, ctx: &CoreContext) -> Result<Box<dyn CoreEngine>>;

    fn has_update_log(&self) -> bool {
        false
    }

    /// Replay the write-ahead log. Returns the number of replayed entries.
    fn recover_from_log(&self) -> Result<usize> {
        Ok(0)
    }

    fn cancel_recovery(&self) {}

    fn as_any(&self) -> &dyn Any;
}

pub trait CoreFactory: Send + Sync {
    fn create(&self, ctx: &CoreContext) -> Result<Box<dyn CoreEngine>>;
}

use crate::descriptor::CoreDescriptor;
use crate::error::Result;
use crate::instance::Core;
use std::sync::Arc;

/// Cluster presence and recovery hooks.
///
/// The container calls every method unconditionally; [`Standalone`] makes
/// them all no-ops when the node is not part of a cluster.
pub trait Coordinator: Send + Sync {
    fn is_active(&self) -> bool;

    /// Announce placement intent before a core is built. A failure here
    /// aborts that core's load.
    fn pre_register(&self, descriptor: &CoreDescriptor) -> Result<()>;

    fn register(&self, core: &Core) -> Result<()>;

    fn unregister(&self, name: &str, descriptor: &CoreDescriptor) -> Result<()>;

    /// Publish a "going down" state for every listed core.
    fn publish_down(&self, cores: &[Arc<Core>]) -> Result<()>;

    fn cancel_recovery(&self, core: &Core) {
        core.engine().cancel_recovery();
    }

    /// Config set name registered for `collection`, if any.
    fn read_config_name(&self, collection: &str) -> Result<Option<String>>;

    fn create_collection_node(&self, descriptor: &CoreDescriptor) -> Result<()>;

    fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Inert coordinator for a node that runs outside a cluster.
#[derive(Debug, Default, Clone, Copy)]
pub struct Standalone;

impl Coordinator for Standalone {
    fn is_active(&self) -> bool {
        false
    }

    fn pre_register(&self, _descriptor: &CoreDescriptor) -> Result<()> {
        Ok(())
    }

    fn register(&self, _core: &Core) -> Result<()> {
        Ok(())
    }

    fn unregister(&self, _name: &str, _descriptor: &CoreDescriptor) -> Result<()> {
        Ok(())
    }

    fn publish_down(&self, _cores: &[Arc<Core>]) -> Result<()> {
        Ok(())
    }

    fn read_config_name(&self, _collection: &str) -> Result<Option<String>> {
        Ok(None)
    }

    fn create_collection_node(&self, _descriptor: &CoreDescriptor) -> Result<()> {
        Ok(())
    }
}

/// Shard request fan-out resource. Opaque to the container apart from its
/// lifetime: created with the container, closed last at shutdown.
pub trait ShardFanout: Send + Sync {
    fn close(&self) -> Result<()>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopFanout;

impl ShardFanout for NoopFanout {
    fn close(&self) -> Result<()> {
        Ok(())
    }
}

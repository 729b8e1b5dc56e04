//! Node-local container for search cores.
//!
//! A [`CoreContainer`] owns every core hosted by one process: it loads the
//! configured cores in parallel at startup, loads transient cores lazily
//! on first use, evicts idle ones under a capacity bound, and retires
//! replaced or removed cores through a single background closer.

pub mod closer;
pub mod config;
pub mod container;
pub mod coordination;
pub mod descriptor;
pub mod engine;
pub mod error;
pub mod instance;
pub mod registry;
pub mod resource;

pub use config::{ConfigSource, ContainerConfig, ContainerSettings, CoreEntry};
pub use container::{CoreContainer, CoreContainerBuilder};
pub use coordination::{Coordinator, NoopFanout, ShardFanout, Standalone};
pub use descriptor::{CloudDescriptor, CoreDescriptor};
pub use engine::local::{TantivyCoreFactory, TantivyEngine};
pub use engine::{CoreEngine, CoreFactory};
pub use error::{CoreError, Result};
pub use instance::{Core, CoreRef};
pub use registry::{CoreRegistry, PendingOp};
pub use resource::{CoreConfig, CoreContext, FieldDef, FieldType, IndexSchema, ResourceLoader};

//! Orbit permission datastore
//!
//! Groups form an inheritance graph and carry permission nodes; subjects
//! belong to one group and may hold nodes of their own. The crate resolves
//! effective permission sets across that graph, answers capability queries
//! with glob and regex matching, and keeps groups in a cache in front of a
//! persistent store, serializing storage work on a worker-thread queue.
//!
//! ```no_run
//! use orbit_datastore::{Datastore, DatastoreConfig};
//!
//! # fn main() -> Result<(), orbit_datastore::DatastoreError> {
//! let datastore = Datastore::with_sqlite(DatastoreConfig::default())?;
//! datastore.bootstrap()?;
//!
//! if let Some(group) = datastore.get_group("default") {
//!     println!("chat allowed: {}", group.has_permission("chat.send"));
//! }
//! datastore.close();
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod datastore;
pub mod entity;
pub mod error;
pub mod permissible;
pub mod permissions;
pub mod queue;
pub mod store;
pub mod telemetry;

pub use config::DatastoreConfig;
pub use datastore::Datastore;
pub use entity::{Group, GroupDisplay, GroupRecord, Subject, SubjectRecord};
pub use error::{DatastoreError, Result};
pub use permissible::{Permissible, PermissionAttachment};
pub use permissions::{PermissionMatcher, PermissionResolver};
pub use queue::TaskQueue;
pub use store::{MemoryStore, PersistentStore, SqliteStore, TableNames};

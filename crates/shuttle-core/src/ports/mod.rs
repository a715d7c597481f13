//! Ports: interfaces to collaborators living outside the queue engine.
//!
//! Durable stores, package builders, credentials and queue consumers are all
//! injected as trait objects at construction time.

pub mod clock;
pub mod id_generator;
pub mod job_store;
pub mod package;
pub mod processor;
pub mod resource_tree;
pub mod secret_provider;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::job_store::{Job, JobStore};
pub use self::package::{DistributionPackage, PackageBuilder, SharedPackage, require_shared};
pub use self::processor::QueueProcessor;
pub use self::resource_tree::{Node, Properties, ResourceTree, TreeChange};
pub use self::secret_provider::SecretProvider;

//! Impls - in-process implementations of the ports.
//!
//! - **InMemoryJobStore**: job store behind `PersistedQueue` in tests and single-node agents
//! - **InMemoryResourceTree**: resource tree behind `TreeQueue`
//! - **InMemoryPackageBuilder**: reference-counted packages with the simple encoding
//! - **StaticSecretProvider**: endpoint credentials from configuration

pub mod job_store;
pub mod package;
pub mod resource_tree;
pub mod secret;

pub use self::job_store::InMemoryJobStore;
pub use self::package::{
    BINARY_PACKAGE_TYPE, InMemoryPackage, InMemoryPackageBuilder, SIMPLE_PACKAGE_TYPE,
    decode_simple, encode_simple,
};
pub use self::resource_tree::InMemoryResourceTree;
pub use self::secret::StaticSecretProvider;

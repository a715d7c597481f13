//! IdGenerator port.
//!
//! Ids are ULIDs stamped with the injected clock, so a `FixedClock` yields ids
//! sharing the same timestamp part while staying unique.

use ulid::Ulid;

use crate::domain::{JobId, PackageId};
use crate::ports::Clock;

pub trait IdGenerator: Send + Sync {
    fn generate_job_id(&self) -> JobId;

    fn generate_package_id(&self) -> PackageId;

    /// Node name for a new entry in a resource tree.
    fn generate_node_name(&self) -> String;
}

pub struct UlidGenerator<C> {
    clock: C,
}

impl<C: Clock> UlidGenerator<C> {
    pub fn new(clock: C) -> Self {
        Self { clock }
    }

    fn next(&self) -> Ulid {
        let timestamp_ms = self.clock.now().timestamp_millis().max(0) as u64;
        Ulid::from_parts(timestamp_ms, rand::random())
    }
}

impl<C: Clock> IdGenerator for UlidGenerator<C> {
    fn generate_job_id(&self) -> JobId {
        JobId::from(self.next())
    }

    fn generate_package_id(&self) -> PackageId {
        PackageId::from(self.next())
    }

    fn generate_node_name(&self) -> String {
        self.next().to_string()
    }
}

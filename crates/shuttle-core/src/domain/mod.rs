//! Domain model: requests, queue items, entries and derived queue status.

pub mod entry;
pub mod ids;
pub mod item;
pub mod request;
pub mod status;

pub use entry::{EntryId, ItemState, QueueEntry, QueueItemStatus};
pub use ids::{Id, IdMarker, JobId, PackageId};
pub use item::{PackageInfo, QueueItem};
pub use request::{DistributionRequest, RequestType};
pub use status::{QueueState, QueueStatus, StateContext};

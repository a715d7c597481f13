//! App - wiring of queues, strategies and transports into a running agent.
//!
//! - **DefaultQueueProvider**: opens decorated queues and owns their poll tasks
//! - **ProviderBuilder**: provider wiring with startup validation
//! - **QueuePoller / ProcessingGroup**: per-queue drain loop and its shutdown handle
//! - **DistributionAgent**: distribute, dispatch, pull, start/stop
//! - **DeliveryProcessor**: queue consumer sending heads through a transport

pub mod agent;
pub mod builder;
pub mod processing;
pub mod provider;

pub use self::agent::{DeliveryProcessor, DistributionAgent};
pub use self::builder::ProviderBuilder;
pub use self::processing::{ErrorEscalation, ProcessingGroup, QueuePoller};
pub use self::provider::{
    DefaultQueueProvider, PersistedQueueFactory, ProviderSettings, QueueFactory, QueueProvider,
    TransientQueueFactory, TreeQueueFactory,
};

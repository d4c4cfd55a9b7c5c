//! PostGuard Worker
//!
//! Consumes content-creation events, scores each post with the active
//! scoring resource and republishes the ones above the threshold.
//!
//! - [`queue`]: the queue boundary plus in-memory and Redis Streams transports
//! - [`processor`]: per-delivery decode → score → decide → publish → settle
//! - [`lifecycle`]: startup/shutdown ordering around the resource manager
//! - [`reload`]: hot reload triggers
//! - [`config`]: layered worker configuration

pub mod config;
pub mod lifecycle;
pub mod processor;
pub mod queue;
pub mod reload;

pub use crate::config::{ConfigOverrides, QueueBackend, WorkerConfig};
pub use crate::lifecycle::{LifecycleCoordinator, StopOutcome};
pub use crate::processor::{MessageProcessor, ProcessOutcome, ProcessorSettings, RequeueReason};
pub use crate::queue::{Acknowledger, Delivery, InMemoryBroker, QueueClient, Subscription};
pub use crate::reload::Reloader;

//! Durable-log and replica-stream sinks for the execution core.
//!
//! Both sinks implement the propagation traits from `ember-core`. Their
//! failure modes never surface as synchronous errors to the dispatcher:
//! the durable log keeps a sticky status flag the admission gates read,
//! and replica streams buffer internally until their peer catches up.

pub mod feed;
pub mod log;

pub use feed::{ReplicaFeed, ReplicaPeer};
pub use log::{DurableLog, LogRecord};

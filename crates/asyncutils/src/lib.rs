//! Async plumbing shared by every background pipeline.
//!
//! Nothing in here knows about folders, databases or roots. The library crate
//! composes these pieces into the scan/persist/metadata pipelines.

pub mod debounce;
pub mod inflight;
pub mod locks;
pub mod pool;

pub use crate::debounce::{Debounce, debounced};
pub use crate::inflight::{InFlight, InFlightObserver};
pub use crate::locks::WriteLocks;
pub use crate::pool::{Channel, ChannelSender, Handler, Message, WorkerPool};

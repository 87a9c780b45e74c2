//! In-memory view of the library's folders.
//!
//! [`FolderCacheStore`] serves folder snapshots to request handlers and to the
//! background pipelines alike. It sits on a [`SegmentedCache`], which bounds
//! the number of folders held and collapses concurrent misses for the same
//! folder into one filesystem read. Refreshing a cached folder emits
//! [`ItemAdded`], [`ItemUpdated`] and [`ItemRemoved`] events.

pub mod error;
mod events;
mod segmented;
mod store;

pub use crate::events::{CacheSubscription, Change, ItemAdded, ItemRemoved, ItemUpdated, diff};
pub use crate::segmented::{EvictionCallback, EvictionError, SegmentedCache, Tier};
pub use crate::store::{CachedFolder, FolderCacheStore};

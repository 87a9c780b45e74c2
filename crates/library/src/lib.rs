//! The moving parts that keep the folder cache and the node index in step
//! with the configured roots.
//!
//! - [`ChangeWatcher`] observes each root (non-recursively) and turns settled
//!   native events into [`RootChange`] messages.
//! - The pipelines in [`pipeline`] turn those into dirty checks, dirty checks
//!   into reconciliations, and reconciliations into metadata requests.
//! - [`PersistenceSynchronizer`] reconciles one folder at a time.
//! - [`ScanProgressTracker`] reports whether any of that is still going on.
//! - [`LibraryService`] builds and runs all of it.

pub mod error;
pub mod external;
pub mod pipeline;
mod progress;
mod service;
mod sync;
mod watch;

pub use crate::external::{LoggingMetadataService, LoggingNotificationSink, MetadataService, NotificationSink};
pub use crate::progress::{ScanCompleted, ScanProgressTracker};
pub use crate::service::{Collaborators, LibraryService};
pub use crate::sync::{Changes, PersistenceSynchronizer, Reconciled};
pub use crate::watch::{ChangeKind, ChangeWatcher, RootChange};

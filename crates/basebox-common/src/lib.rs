//! Shared state containers for baseboxd.
//!
//! - [`SyncMap`]: map that never creates entries implicitly, with explicit
//!   reference counting for shared dataplane objects such as groups
//! - [`Subscribers`]: closure registry used to fan out change notifications
//!   without observer base traits

mod subscribers;
mod sync_map;

pub use subscribers::{SubscriptionId, Subscribers};
pub use sync_map::{HasRefCount, SyncMap, SyncMapError};

//! Client-side synchronization for Threadline.
//!
//! - **Query cache**: memoized remote reads keyed by collection, method and
//!   canonical parameters, invalidated explicitly after mutations
//! - **Realtime list resources**: a fetched list kept current by folding
//!   realtime events into it
//! - **Record sources**: the seam between the two and the backend, with an
//!   in-memory implementation for tests

mod error;
pub mod key;
pub mod memory;
pub mod query;
pub mod resource;
mod source;

pub use error::SyncError;
pub use key::{CacheKey, QueryMethod};
pub use memory::MemorySource;
pub use query::{CachedCollection, QueryCache};
pub use resource::{
    EventOutcome, FetchOutcome, ListParams, ListSnapshot, MergeFn, RealtimeListResource,
    RealtimeListResourceBuilder, ResourceState, ResourceStatus, default_merge,
};
pub use source::RecordSource;

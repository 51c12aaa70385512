//! Keyset-paginated thread feed with optimistic read state, backed by a
//! stale-while-revalidate cache that push events keep honest.

pub mod config;
pub mod core;
pub mod error;
pub mod sync;

pub use config::Config;
pub use error::{Result, SyncError};
pub use sync::client::{PageView, SyncClient, ThreadView};
pub use sync::reconcile::ReadState;

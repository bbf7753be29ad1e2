//! Cache tier implementations
//!
//! Three reference tiers for the cascade:
//!
//! - **Memory** - weight-bounded in-process tier (Moka), written inline on
//!   the request path.
//! - **Disk** - sharded files under a root directory with an append-only
//!   metadata log and background cleanup.
//! - **Remote** - adapter over an [`ObjectStore`](remote::ObjectStore),
//!   with purge-by-source via prefix listing.
//!
//! All three implement [`CacheProvider`](crate::provider::CacheProvider);
//! the cascade never special-cases a tier type.

pub mod disk;
pub mod memory;
pub mod remote;

pub use disk::{DiskTier, DiskTierConfig};
pub use memory::{MemoryTier, MemoryTierConfig};
pub use remote::{ObjectBody, ObjectStore, RemoteTier, RemoteTierConfig};

//! ExtentIO metadata service
//!
//! Two stores with different granularity back every RAID group:
//!
//! - **Non-paged**: one small fixed-size record per object (rebuild
//!   checkpoints, rebuild-logging bitmask, clustered flags), mirrored
//!   synchronously to the peer SP and persisted crash-atomically.
//! - **Paged**: one fixed-size record per chunk of user capacity
//!   (needs-rebuild bitmask per position, verify bits, state flags),
//!   written only by the ACTIVE side with a pushed shadow on the
//!   PASSIVE side.
//!
//! The per-object ACTIVE/PASSIVE role lives in [`ElementTable`].

pub mod element;
pub mod nonpaged;
pub mod paged;

pub use element::{ElementState, ElementTable};
pub use nonpaged::{layout, NonPagedRecord, NonPagedStore, NONPAGED_RECORD_SIZE};
pub use paged::{ChunkRecord, PagedStore, PAGED_RECORD_SIZE};

//! RAID group engine
//!
//! Ties the lower layers together into dual-SP RAID groups:
//!
//! - [`geometry`] maps group LBAs onto member positions and rotates
//!   parity across stripe rows
//! - [`reconstruct`] recovers missing elements (XOR for single-parity
//!   types, Reed-Solomon for RAID-6, copies for mirrors)
//! - [`group`] owns lifecycle, member states and I/O admission
//! - [`io`] is the foreground read/write path with degraded handling
//! - [`rebuild`] is the background chunk-by-chunk rebuild engine and
//!   the rekey pass
//! - [`sp`] assembles a storage processor and its peer service
//!
//! A group exists once per SP; both instances share the member drives
//! and coordinate through metadata mirroring and the stripe lock
//! manager.

pub mod geometry;
pub mod group;
pub mod io;
pub mod rebuild;
pub mod reconstruct;
pub mod sp;

pub use geometry::Geometry;
pub use group::{GroupSpec, MemberState, RaidGroup};
pub use rebuild::RebuildStats;
pub use sp::{SpPair, StorageProcessor};

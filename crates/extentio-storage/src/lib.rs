//! Virtualized member drives
//!
//! File-backed block devices standing in for physical array members.
//! Drives can be pulled and reinserted, report per-SP path reachability
//! (for single-loop-failure handling), and can inject transient media
//! errors to exercise the rebuild engine's retry policy.

pub mod drive;

pub use drive::{DriveSet, DriveState, VirtualDrive};

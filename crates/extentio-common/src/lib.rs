//! ExtentIO common types
//!
//! Shared identifiers, the RAID type taxonomy, the common error taxonomy
//! and engine configuration used by every other ExtentIO crate.

pub mod checksum;
pub mod config;
pub mod error;
pub mod types;

pub use checksum::BlockChecksum;
pub use config::{EngineConfig, JournalConfig, RebuildConfig};
pub use error::{Error, Qualifier, Result};
pub use types::{Lba, LifecycleState, LockMode, ObjectId, Position, RaidType, RejectFlags, SpId};

/// Block (sector) size in bytes.
pub const BLOCK_SIZE: usize = 512;

/// Blocks per paged-metadata chunk (1 MiB of user data per chunk).
pub const CHUNK_BLOCKS: u64 = 2048;

/// Default element size in blocks (contiguous blocks per member per stripe).
pub const DEFAULT_ELEMENT_BLOCKS: u64 = 128;

/// Sentinel LBA meaning "no checkpoint" / "not rebuilding".
pub const INVALID_LBA: u64 = u64::MAX;

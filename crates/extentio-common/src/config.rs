//! Configuration types for ExtentIO
//!
//! Engine-level tunables with defaults matching the original system's
//! behavior (60 s lifecycle wait budget, bounded rebuild retries).

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Root configuration for the extent engine
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Rebuild engine tunables
    pub rebuild: RebuildConfig,
    /// Write journal tunables
    pub journal: JournalConfig,
    /// Budget for lifecycle-state and flag waits (milliseconds)
    pub wait_budget_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            rebuild: RebuildConfig::default(),
            journal: JournalConfig::default(),
            wait_budget_ms: 60_000,
        }
    }
}

impl EngineConfig {
    /// Wait budget as a `Duration`
    #[must_use]
    pub const fn wait_budget(&self) -> Duration {
        Duration::from_millis(self.wait_budget_ms)
    }
}

/// Rebuild engine configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RebuildConfig {
    /// Retries per chunk on a transient media error before escalating
    pub max_chunk_retries: u32,
    /// Chunks reconstructed per checkpoint advance
    pub chunks_per_pass: u64,
}

impl Default for RebuildConfig {
    fn default() -> Self {
        Self {
            max_chunk_retries: 3,
            chunks_per_pass: 1,
        }
    }
}

/// Write journal configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JournalConfig {
    /// Number of slots in the journal region
    pub slot_count: u32,
    /// Blocks per slot (1 header block + staged data blocks)
    pub slot_blocks: u64,
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            slot_count: 32,
            slot_blocks: 1 + 128,
        }
    }
}

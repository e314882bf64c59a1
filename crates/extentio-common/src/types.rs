//! Core type definitions for ExtentIO
//!
//! Identifiers, RAID type taxonomy and the block-operation qualifiers
//! exchanged with clients.

use derive_more::{Display, From, Into};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Logical block address.
pub type Lba = u64;

/// Member position within a RAID group (0-based).
pub type Position = u32;

/// Unique identifier for a configured object (RAID group, drive, ...).
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, From, Into, Display,
)]
#[display("0x{_0:x}")]
pub struct ObjectId(u64);

impl ObjectId {
    /// Create from a raw id
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Get the raw id
    #[must_use]
    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId(0x{:x})", self.0)
    }
}

/// Storage processor identity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
pub enum SpId {
    #[display("SPA")]
    A,
    #[display("SPB")]
    B,
}

impl SpId {
    /// The other side of the pair
    #[must_use]
    pub const fn peer(self) -> Self {
        match self {
            Self::A => Self::B,
            Self::B => Self::A,
        }
    }
}

/// RAID level of a group.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RaidType {
    Raid0,
    Raid1,
    Raid3,
    Raid5,
    Raid6,
    Raid10,
}

impl RaidType {
    /// Number of member failures the type tolerates.
    ///
    /// For RAID-10 this is the per-mirror-pair tolerance; losing both
    /// sides of one pair fails the whole group regardless of width.
    #[must_use]
    pub const fn fault_tolerance(self) -> u32 {
        match self {
            Self::Raid0 => 0,
            Self::Raid1 | Self::Raid3 | Self::Raid5 | Self::Raid10 => 1,
            Self::Raid6 => 2,
        }
    }

    /// Number of members carrying client data for the given width.
    #[must_use]
    pub const fn data_disks(self, width: u32) -> u32 {
        match self {
            Self::Raid0 => width,
            Self::Raid1 => 1,
            Self::Raid3 | Self::Raid5 => width - 1,
            Self::Raid6 => width - 2,
            Self::Raid10 => width / 2,
        }
    }

    /// True for parity-protected types (journal + parity stripe rules apply).
    #[must_use]
    pub const fn is_parity(self) -> bool {
        matches!(self, Self::Raid3 | Self::Raid5 | Self::Raid6)
    }

    /// True for mirror-protected types.
    #[must_use]
    pub const fn is_mirror(self) -> bool {
        matches!(self, Self::Raid1 | Self::Raid10)
    }

    /// Map a RAID-10 position to its mirror pair index.
    #[must_use]
    pub const fn mirror_pair(self, position: Position) -> u32 {
        match self {
            Self::Raid10 => position / 2,
            _ => 0,
        }
    }
}

/// Object lifecycle state, aggregated per RAID group.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LifecycleState {
    /// Coming up: metadata loaded, journal recovery in progress
    Activate,
    /// Servicing I/O (possibly degraded within fault tolerance)
    Ready,
    /// Too many members lost; all I/O fails until members return
    Failed,
    /// Group torn down
    Destroyed,
}

/// Stripe lock mode.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LockMode {
    /// Shared: any number of concurrent readers
    Read,
    /// Exclusive: at most one holder across both SPs
    Write,
}

impl LockMode {
    /// Whether two holders of these modes may overlap
    #[must_use]
    pub const fn compatible(self, other: Self) -> bool {
        matches!((self, other), (Self::Read, Self::Read))
    }
}

/// Client capability flags: the client opts in to deliberate rejection
/// instead of degraded-mode service.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectFlags {
    /// Reject sub-stripe writes while degraded with `NotFullStripe`
    pub prefer_full_stripe: bool,
    /// Reject I/O arriving on a non-preferred SP path with `NotPreferred`
    pub not_preferred: bool,
}

impl RejectFlags {
    /// No rejection capabilities (always service, at whatever cost).
    pub const NONE: Self = Self {
        prefer_full_stripe: false,
        not_preferred: false,
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fault_tolerance() {
        assert_eq!(RaidType::Raid0.fault_tolerance(), 0);
        assert_eq!(RaidType::Raid1.fault_tolerance(), 1);
        assert_eq!(RaidType::Raid5.fault_tolerance(), 1);
        assert_eq!(RaidType::Raid6.fault_tolerance(), 2);
        assert_eq!(RaidType::Raid10.fault_tolerance(), 1);
    }

    #[test]
    fn test_data_disks() {
        assert_eq!(RaidType::Raid5.data_disks(3), 2);
        assert_eq!(RaidType::Raid6.data_disks(6), 4);
        assert_eq!(RaidType::Raid10.data_disks(4), 2);
        assert_eq!(RaidType::Raid1.data_disks(2), 1);
    }

    #[test]
    fn test_mirror_pair_mapping() {
        assert_eq!(RaidType::Raid10.mirror_pair(0), 0);
        assert_eq!(RaidType::Raid10.mirror_pair(1), 0);
        assert_eq!(RaidType::Raid10.mirror_pair(2), 1);
        assert_eq!(RaidType::Raid10.mirror_pair(5), 2);
    }

    #[test]
    fn test_sp_peer() {
        assert_eq!(SpId::A.peer(), SpId::B);
        assert_eq!(SpId::B.peer(), SpId::A);
    }
}

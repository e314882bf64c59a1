//! LBA-to-member geometry
//!
//! A group exports a linear block space striped over its members in
//! elements of `element_blocks` contiguous blocks. One stripe row is one
//! element per data member plus the row's parity element(s); parity
//! rotates across rows for RAID-5/6 (RAID-3 keeps it fixed on the last
//! position). Mirror types map each element to a position pair instead.
//!
//! Member block addresses are row-major: every member carries the same
//! pba for a given row, which keeps chunk bookkeeping identical across
//! positions.

use extentio_common::{Error, Lba, Position, RaidType, Result, CHUNK_BLOCKS};
use extentio_metadata::layout::MAX_WIDTH;

/// Where one group-LBA span lands on the members.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ElementMap {
    /// Stripe row (also the stripe-lock index)
    pub row: u64,
    /// Member block address of the element start
    pub pba: Lba,
    /// Offset of the mapped LBA within the element
    pub offset: u64,
    /// Position(s) holding this element: one for striped types, the
    /// mirror pair for RAID-1/10
    pub positions: Vec<Position>,
}

/// Layout of one stripe row.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RowLayout {
    /// Member pba of the row's elements (same on every position)
    pub pba: Lba,
    /// Data positions in data-index order
    pub data: Vec<Position>,
    /// Parity positions for this row (P first, then Q)
    pub parity: Vec<Position>,
}

/// Static geometry of one RAID group.
#[derive(Clone, Copy, Debug)]
pub struct Geometry {
    pub raid_type: RaidType,
    pub width: u32,
    /// Contiguous blocks per member per stripe element
    pub element_blocks: u64,
    /// User-data blocks per member; the journal region follows
    pub member_user_blocks: u64,
}

impl Geometry {
    pub fn new(
        raid_type: RaidType,
        width: u32,
        element_blocks: u64,
        member_user_blocks: u64,
    ) -> Result<Self> {
        let valid_width = match raid_type {
            RaidType::Raid0 => width >= 1,
            RaidType::Raid1 => width == 2,
            RaidType::Raid3 | RaidType::Raid5 => width >= 3,
            RaidType::Raid6 => width >= 4,
            RaidType::Raid10 => width >= 4 && width % 2 == 0,
        };
        if !valid_width {
            return Err(Error::internal(format!(
                "invalid width {width} for {raid_type:?}"
            )));
        }
        // The non-paged record carries one checkpoint and one bitmask
        // bit per position, sized for MAX_WIDTH members.
        if width as usize > MAX_WIDTH {
            return Err(Error::internal(format!(
                "width {width} exceeds the {MAX_WIDTH}-position record limit"
            )));
        }
        if member_user_blocks % element_blocks != 0 {
            return Err(Error::internal(
                "member capacity must be a whole number of elements",
            ));
        }
        Ok(Self {
            raid_type,
            width,
            element_blocks,
            member_user_blocks,
        })
    }

    /// Members carrying client data.
    #[must_use]
    pub fn data_disks(&self) -> u32 {
        self.raid_type.data_disks(self.width)
    }

    /// Client-visible capacity in blocks.
    #[must_use]
    pub fn exported_blocks(&self) -> u64 {
        self.member_user_blocks * u64::from(self.data_disks())
    }

    /// Client data blocks per stripe row.
    #[must_use]
    pub fn row_data_blocks(&self) -> u64 {
        self.element_blocks * u64::from(self.data_disks())
    }

    /// Number of stripe rows in the group.
    #[must_use]
    pub fn row_count(&self) -> u64 {
        self.member_user_blocks / self.element_blocks
    }

    /// Stripe row containing a group LBA.
    #[must_use]
    pub fn row_of_lba(&self, lba: Lba) -> u64 {
        lba / self.row_data_blocks()
    }

    /// Paged-metadata chunk covering a member pba.
    #[must_use]
    pub fn chunk_of_pba(pba: Lba) -> u64 {
        pba / CHUNK_BLOCKS
    }

    /// Chunk records needed to cover the member user region.
    #[must_use]
    pub fn chunk_count(&self) -> u64 {
        self.member_user_blocks.div_ceil(CHUNK_BLOCKS)
    }

    /// Parity position(s) for a stripe row.
    #[must_use]
    pub fn parity_positions(&self, row: u64) -> Vec<Position> {
        match self.raid_type {
            RaidType::Raid3 => vec![self.width - 1],
            RaidType::Raid5 => {
                vec![self.width - 1 - (row % u64::from(self.width)) as u32]
            }
            RaidType::Raid6 => {
                let p = self.width - 1 - (row % u64::from(self.width)) as u32;
                let q = (p + 1) % self.width;
                vec![p, q]
            }
            _ => Vec::new(),
        }
    }

    /// Layout of one stripe row.
    #[must_use]
    pub fn row_layout(&self, row: u64) -> RowLayout {
        let pba = row * self.element_blocks;
        let parity = self.parity_positions(row);
        let data = match self.raid_type {
            RaidType::Raid1 => vec![0],
            RaidType::Raid10 => (0..self.width / 2).map(|p| p * 2).collect(),
            _ => (0..self.width)
                .filter(|p| !parity.contains(p))
                .collect(),
        };
        RowLayout { pba, data, parity }
    }

    /// Map one group LBA to its element.
    pub fn map_lba(&self, lba: Lba) -> Result<ElementMap> {
        if lba >= self.exported_blocks() {
            return Err(Error::internal(format!(
                "lba {lba} beyond exported capacity {}",
                self.exported_blocks()
            )));
        }
        let element_index = lba / self.element_blocks;
        let offset = lba % self.element_blocks;
        let data_disks = u64::from(self.data_disks());
        let row = element_index / data_disks;
        let data_index = (element_index % data_disks) as u32;
        let pba = row * self.element_blocks;

        let positions = match self.raid_type {
            RaidType::Raid1 => vec![0, 1],
            RaidType::Raid10 => vec![data_index * 2, data_index * 2 + 1],
            _ => {
                let layout = self.row_layout(row);
                vec![layout.data[data_index as usize]]
            }
        };
        Ok(ElementMap {
            row,
            pba,
            offset,
            positions,
        })
    }

    /// Data index of a position within a row, if it carries data.
    #[must_use]
    pub fn data_index_of(&self, row: u64, position: Position) -> Option<usize> {
        self.row_layout(row).data.iter().position(|&p| p == position)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn r5() -> Geometry {
        Geometry::new(RaidType::Raid5, 3, 4, 64).unwrap()
    }

    #[test]
    fn test_width_validation() {
        assert!(Geometry::new(RaidType::Raid5, 2, 4, 64).is_err());
        assert!(Geometry::new(RaidType::Raid6, 3, 4, 64).is_err());
        assert!(Geometry::new(RaidType::Raid10, 5, 4, 64).is_err());
        assert!(Geometry::new(RaidType::Raid1, 2, 4, 64).is_ok());
        // Bounded by the per-position metadata fields.
        assert!(Geometry::new(RaidType::Raid0, 17, 4, 64).is_err());
        assert!(Geometry::new(RaidType::Raid6, 16, 4, 64).is_ok());
    }

    #[test]
    fn test_parity_rotates_on_raid5() {
        let g = r5();
        let rows: Vec<_> = (0..3).map(|r| g.parity_positions(r)[0]).collect();
        assert_eq!(rows, vec![2, 1, 0]);
        // Every position takes a parity turn.
        let mut seen: Vec<_> = (0..6).map(|r| g.parity_positions(r)[0]).collect();
        seen.sort_unstable();
        seen.dedup();
        assert_eq!(seen, vec![0, 1, 2]);
    }

    #[test]
    fn test_raid3_parity_fixed() {
        let g = Geometry::new(RaidType::Raid3, 3, 4, 64).unwrap();
        assert_eq!(g.parity_positions(0), vec![2]);
        assert_eq!(g.parity_positions(5), vec![2]);
    }

    #[test]
    fn test_raid6_two_parity_positions() {
        let g = Geometry::new(RaidType::Raid6, 6, 4, 64).unwrap();
        for row in 0..12 {
            let parity = g.parity_positions(row);
            assert_eq!(parity.len(), 2);
            assert_ne!(parity[0], parity[1]);
            let layout = g.row_layout(row);
            assert_eq!(layout.data.len(), 4);
            for p in &parity {
                assert!(!layout.data.contains(p));
            }
        }
    }

    #[test]
    fn test_lba_mapping_round_robin() {
        let g = r5();
        // Row 0: parity on 2, data on 0 and 1.
        let m = g.map_lba(0).unwrap();
        assert_eq!((m.row, m.pba, m.offset, m.positions.clone()), (0, 0, 0, vec![0]));
        let m = g.map_lba(5).unwrap();
        assert_eq!((m.row, m.offset, m.positions.clone()), (0, 1, vec![1]));
        // Row 1 starts at lba 8 (2 data elements of 4 blocks per row).
        let m = g.map_lba(8).unwrap();
        assert_eq!(m.row, 1);
        assert_eq!(m.pba, 4);

        assert!(g.map_lba(g.exported_blocks()).is_err());
    }

    #[test]
    fn test_raid10_maps_to_pairs() {
        let g = Geometry::new(RaidType::Raid10, 4, 4, 64).unwrap();
        assert_eq!(g.exported_blocks(), 128);
        let m = g.map_lba(0).unwrap();
        assert_eq!(m.positions, vec![0, 1]);
        let m = g.map_lba(4).unwrap();
        assert_eq!(m.positions, vec![2, 3]);
        // Second row wraps back to the first pair.
        let m = g.map_lba(8).unwrap();
        assert_eq!((m.row, m.pba, m.positions.clone()), (1, 4, vec![0, 1]));
    }

    #[test]
    fn test_chunk_mapping() {
        assert_eq!(Geometry::chunk_of_pba(0), 0);
        assert_eq!(Geometry::chunk_of_pba(CHUNK_BLOCKS - 1), 0);
        assert_eq!(Geometry::chunk_of_pba(CHUNK_BLOCKS), 1);
        let g = Geometry::new(RaidType::Raid5, 3, 128, 3 * CHUNK_BLOCKS).unwrap();
        assert_eq!(g.chunk_count(), 3);
    }
}

//! File-backed virtual drives
//!
//! Each drive is one sparse file of `capacity_blocks` 512-byte blocks.
//! Both SPs share the same backing files (the drives are the shared
//! medium between the processors); removal and reinsertion toggle the
//! drive state without touching the file contents, the way pulling a
//! physical drive leaves its platters intact.

use extentio_common::{Error, Lba, Position, Result, SpId, BLOCK_SIZE};
use parking_lot::{Mutex, RwLock};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use tracing::{info, warn};

/// Drive presence state as seen by the RAID group.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DriveState {
    /// Present and servicing I/O
    Ready,
    /// Pulled; all I/O fails with `DriveRemoved`
    Removed,
}

/// One virtualized member drive.
pub struct VirtualDrive {
    position: Position,
    capacity_blocks: u64,
    file: Mutex<File>,
    state: RwLock<DriveState>,
    /// Media errors still to inject on reads (test hook; counts down)
    inject_read_errors: AtomicU32,
    /// Media errors to inject only on reads covering one address
    inject_read_errors_at: Mutex<Option<(Lba, u32)>>,
    /// Which SPs have a live path to this drive (SLF modeling)
    reachable_a: RwLock<bool>,
    reachable_b: RwLock<bool>,
    reads: AtomicU64,
    writes: AtomicU64,
}

impl VirtualDrive {
    /// Create or open a drive backed by `path`.
    pub fn open(path: impl AsRef<Path>, position: Position, capacity_blocks: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.as_ref())?;
        file.set_len(capacity_blocks * BLOCK_SIZE as u64)?;
        Ok(Self {
            position,
            capacity_blocks,
            file: Mutex::new(file),
            state: RwLock::new(DriveState::Ready),
            inject_read_errors: AtomicU32::new(0),
            inject_read_errors_at: Mutex::new(None),
            reachable_a: RwLock::new(true),
            reachable_b: RwLock::new(true),
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
        })
    }

    /// Member position this drive occupies.
    #[must_use]
    pub const fn position(&self) -> Position {
        self.position
    }

    /// Capacity in blocks.
    #[must_use]
    pub const fn capacity_blocks(&self) -> u64 {
        self.capacity_blocks
    }

    /// Current presence state.
    #[must_use]
    pub fn state(&self) -> DriveState {
        *self.state.read()
    }

    fn check_ready(&self) -> Result<()> {
        match self.state() {
            DriveState::Ready => Ok(()),
            DriveState::Removed => Err(Error::DriveRemoved(self.position)),
        }
    }

    fn check_span(&self, lba: Lba, blocks: u64) -> Result<()> {
        if lba + blocks > self.capacity_blocks {
            return Err(Error::internal(format!(
                "I/O past drive capacity: lba {lba} + {blocks} > {}",
                self.capacity_blocks
            )));
        }
        Ok(())
    }

    /// Read `blocks` blocks starting at `lba`.
    pub fn read_blocks(&self, lba: Lba, blocks: u64) -> Result<Vec<u8>> {
        self.check_ready()?;
        self.check_span(lba, blocks)?;
        if self.inject_read_errors.load(Ordering::SeqCst) > 0 {
            self.inject_read_errors.fetch_sub(1, Ordering::SeqCst);
            warn!(position = self.position, lba, "injected media error on read");
            return Err(Error::Media {
                position: self.position,
                lba,
            });
        }
        {
            let mut armed = self.inject_read_errors_at.lock();
            if let Some((target, remaining)) = armed.as_mut() {
                if *remaining > 0 && lba <= *target && *target < lba + blocks {
                    *remaining -= 1;
                    let target = *target;
                    warn!(position = self.position, lba = target, "injected media error on read");
                    return Err(Error::Media {
                        position: self.position,
                        lba: target,
                    });
                }
            }
        }
        self.reads.fetch_add(1, Ordering::Relaxed);
        let mut buf = vec![0u8; blocks as usize * BLOCK_SIZE];
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(lba * BLOCK_SIZE as u64))?;
        file.read_exact(&mut buf)?;
        Ok(buf)
    }

    /// Write block-aligned data starting at `lba`.
    pub fn write_blocks(&self, lba: Lba, data: &[u8]) -> Result<()> {
        debug_assert_eq!(data.len() % BLOCK_SIZE, 0);
        self.check_ready()?;
        self.check_span(lba, (data.len() / BLOCK_SIZE) as u64)?;
        self.writes.fetch_add(1, Ordering::Relaxed);
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(lba * BLOCK_SIZE as u64))?;
        file.write_all(data)?;
        file.sync_data()?;
        Ok(())
    }

    /// Pull the drive. Contents stay intact.
    pub fn remove(&self) {
        info!(position = self.position, "drive removed");
        *self.state.write() = DriveState::Removed;
    }

    /// Reinsert a pulled drive.
    pub fn insert(&self) {
        info!(position = self.position, "drive inserted");
        *self.state.write() = DriveState::Ready;
    }

    /// Arm `count` transient media errors on subsequent reads.
    pub fn inject_read_errors(&self, count: u32) {
        self.inject_read_errors.store(count, Ordering::SeqCst);
    }

    /// Arm `count` media errors on reads whose span covers `lba` only;
    /// reads elsewhere keep succeeding.
    pub fn inject_read_errors_at(&self, lba: Lba, count: u32) {
        *self.inject_read_errors_at.lock() = Some((lba, count));
    }

    /// Cut or restore one SP's path to this drive (single-loop failure).
    pub fn set_reachable(&self, sp: SpId, reachable: bool) {
        match sp {
            SpId::A => *self.reachable_a.write() = reachable,
            SpId::B => *self.reachable_b.write() = reachable,
        }
    }

    /// Whether the given SP has a live path to this drive.
    #[must_use]
    pub fn reachable_from(&self, sp: SpId) -> bool {
        match sp {
            SpId::A => *self.reachable_a.read(),
            SpId::B => *self.reachable_b.read(),
        }
    }

    /// Total successful reads (observability).
    #[must_use]
    pub fn read_count(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    /// Total writes (observability).
    #[must_use]
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }
}

/// The member drives of one RAID group, indexed by position.
pub struct DriveSet {
    drives: Vec<VirtualDrive>,
}

impl DriveSet {
    /// Create `width` drives under `dir`, one file per position.
    pub fn create(dir: impl AsRef<Path>, width: u32, capacity_blocks: u64) -> Result<Self> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        let mut drives = Vec::with_capacity(width as usize);
        for position in 0..width {
            let path = dir.join(format!("drive_{position}.bin"));
            drives.push(VirtualDrive::open(path, position, capacity_blocks)?);
        }
        Ok(Self { drives })
    }

    /// Number of member positions.
    #[must_use]
    pub fn width(&self) -> u32 {
        self.drives.len() as u32
    }

    /// Drive at a position.
    pub fn drive(&self, position: Position) -> Result<&VirtualDrive> {
        self.drives
            .get(position as usize)
            .ok_or_else(|| Error::internal(format!("no drive at position {position}")))
    }

    /// Positions currently not Ready.
    #[must_use]
    pub fn missing_positions(&self) -> Vec<Position> {
        self.drives
            .iter()
            .filter(|d| d.state() != DriveState::Ready)
            .map(VirtualDrive::position)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_write_read_round_trip() {
        let dir = tempdir().unwrap();
        let drive = VirtualDrive::open(dir.path().join("d.bin"), 0, 64).unwrap();

        let data = vec![0x5Au8; 2 * BLOCK_SIZE];
        drive.write_blocks(10, &data).unwrap();
        assert_eq!(drive.read_blocks(10, 2).unwrap(), data);
    }

    #[test]
    fn test_removed_drive_fails_io_keeps_contents() {
        let dir = tempdir().unwrap();
        let drive = VirtualDrive::open(dir.path().join("d.bin"), 3, 64).unwrap();
        let data = vec![0xC3u8; BLOCK_SIZE];
        drive.write_blocks(0, &data).unwrap();

        drive.remove();
        assert!(matches!(
            drive.read_blocks(0, 1),
            Err(Error::DriveRemoved(3))
        ));
        assert!(matches!(
            drive.write_blocks(0, &data),
            Err(Error::DriveRemoved(3))
        ));

        drive.insert();
        assert_eq!(drive.read_blocks(0, 1).unwrap(), data);
    }

    #[test]
    fn test_injected_media_errors_count_down() {
        let dir = tempdir().unwrap();
        let drive = VirtualDrive::open(dir.path().join("d.bin"), 1, 64).unwrap();
        drive.inject_read_errors(2);

        assert!(matches!(drive.read_blocks(0, 1), Err(Error::Media { .. })));
        assert!(matches!(drive.read_blocks(0, 1), Err(Error::Media { .. })));
        assert!(drive.read_blocks(0, 1).is_ok());
    }

    #[test]
    fn test_targeted_media_errors_hit_one_address() {
        let dir = tempdir().unwrap();
        let drive = VirtualDrive::open(dir.path().join("d.bin"), 1, 64).unwrap();
        drive.inject_read_errors_at(5, 1);

        assert!(drive.read_blocks(0, 2).is_ok());
        assert!(matches!(
            drive.read_blocks(4, 4),
            Err(Error::Media { lba: 5, .. })
        ));
        assert!(drive.read_blocks(4, 4).is_ok());
    }

    #[test]
    fn test_reachability_flags() {
        let dir = tempdir().unwrap();
        let drive = VirtualDrive::open(dir.path().join("d.bin"), 0, 8).unwrap();
        assert!(drive.reachable_from(SpId::A));
        drive.set_reachable(SpId::A, false);
        assert!(!drive.reachable_from(SpId::A));
        assert!(drive.reachable_from(SpId::B));
    }

    #[test]
    fn test_drive_set() {
        let dir = tempdir().unwrap();
        let set = DriveSet::create(dir.path(), 3, 32).unwrap();
        assert_eq!(set.width(), 3);
        set.drive(1).unwrap().remove();
        assert_eq!(set.missing_positions(), vec![1]);
    }
}

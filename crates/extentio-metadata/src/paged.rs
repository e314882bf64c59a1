//! Paged metadata store
//!
//! One fixed 8-byte record per chunk of user capacity, holding the
//! needs-rebuild bitmask (one bit per position), verify bits and state
//! flags. Records are packed into 512-byte storage blocks with a trailing
//! CRC32C per block:
//!
//! ```text
//! +----------------------+--------+
//! | payload (508 bytes)  | CRC32C |
//! +----------------------+--------+
//! ```
//!
//! Because 508 is not a multiple of the record size, a record can
//! straddle two storage blocks; reads reassemble it transparently.
//!
//! Only the ACTIVE side for an object writes the backing store. The
//! PASSIVE side forwards mutations over the peer link and serves reads
//! from a shadow that the active side pushes on every mutation.

use dashmap::DashMap;
use extentio_common::{BlockChecksum, Error, ObjectId, Position, Result};
use extentio_peer::{PagedOp, PeerLink, PeerRequest};
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

use crate::element::ElementTable;

/// Fixed size of every paged chunk record.
pub const PAGED_RECORD_SIZE: usize = 8;

/// Storage block size in the paged backing file.
const STORE_BLOCK_SIZE: usize = 512;

/// Payload bytes per storage block (the rest is the block CRC).
const STORE_BLOCK_PAYLOAD: usize = STORE_BLOCK_SIZE - 4;

/// Chunk state flags.
pub const CHUNK_FLAG_VALID: u8 = 1 << 0;
pub const CHUNK_FLAG_CONSUMED: u8 = 1 << 1;
pub const CHUNK_FLAG_ZEROED: u8 = 1 << 2;

/// One chunk's paged metadata.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ChunkRecord {
    /// One bit per position that missed a write and needs rebuild
    pub needs_rebuild: u16,
    /// One bit per position that needs verify
    pub verify_bits: u16,
    /// Valid / consumed / zeroed flags
    pub flags: u8,
}

impl ChunkRecord {
    /// Serialize to the fixed on-disk layout.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; PAGED_RECORD_SIZE] {
        let mut buf = [0u8; PAGED_RECORD_SIZE];
        buf[0..2].copy_from_slice(&self.needs_rebuild.to_le_bytes());
        buf[2..4].copy_from_slice(&self.verify_bits.to_le_bytes());
        buf[4] = self.flags;
        buf
    }

    /// Deserialize from the fixed on-disk layout.
    #[must_use]
    pub fn from_bytes(buf: &[u8; PAGED_RECORD_SIZE]) -> Self {
        Self {
            needs_rebuild: u16::from_le_bytes(buf[0..2].try_into().unwrap()),
            verify_bits: u16::from_le_bytes(buf[2..4].try_into().unwrap()),
            flags: buf[4],
        }
    }

    /// Bit pattern selecting one position's needs-rebuild bit.
    #[must_use]
    pub fn nr_pattern(position: Position) -> [u8; PAGED_RECORD_SIZE] {
        let mut buf = [0u8; PAGED_RECORD_SIZE];
        buf[0..2].copy_from_slice(&(1u16 << position).to_le_bytes());
        buf
    }

    /// Whether a position's needs-rebuild bit is set.
    #[must_use]
    pub fn needs_rebuild_for(&self, position: Position) -> bool {
        self.needs_rebuild & (1 << position) != 0
    }
}

struct PagedObject {
    chunk_count: u64,
    /// In-memory shadow of all records (authoritative on the active side,
    /// pushed cache on the passive side).
    shadow: Mutex<Vec<u8>>,
    file: Mutex<File>,
}

/// Paged metadata store for all objects on one SP.
pub struct PagedStore {
    dir: PathBuf,
    objects: DashMap<ObjectId, Arc<PagedObject>>,
    element: Arc<ElementTable>,
    peer: Arc<dyn PeerLink>,
}

impl PagedStore {
    /// Create a store backed by `dir`.
    pub fn new(
        dir: impl AsRef<Path>,
        element: Arc<ElementTable>,
        peer: Arc<dyn PeerLink>,
    ) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            objects: DashMap::new(),
            element,
            peer,
        })
    }

    /// Register an object's paged region with `chunk_count` records.
    pub fn register(&self, object_id: ObjectId, chunk_count: u64) -> Result<()> {
        let path = self.dir.join(format!("pg_{:016x}.bin", object_id.as_u64()));
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        let object = Arc::new(PagedObject {
            chunk_count,
            shadow: Mutex::new(vec![0u8; chunk_count as usize * PAGED_RECORD_SIZE]),
            file: Mutex::new(file),
        });
        // Materialize the zeroed region so force reads always succeed.
        {
            let shadow = object.shadow.lock();
            let mut file = object.file.lock();
            Self::write_span(&mut file, 0, &shadow)?;
        }
        self.objects.insert(object_id, object);
        Ok(())
    }

    fn object(&self, object_id: ObjectId) -> Result<Arc<PagedObject>> {
        self.objects
            .get(&object_id)
            .map(|o| Arc::clone(&o))
            .ok_or(Error::NotFound(object_id))
    }

    /// Number of chunk records registered for an object.
    pub fn chunk_count(&self, object_id: ObjectId) -> Result<u64> {
        Ok(self.object(object_id)?.chunk_count)
    }

    fn check_offset(offset: u64) -> Result<()> {
        if offset % PAGED_RECORD_SIZE as u64 != 0 {
            return Err(Error::InvalidOffset {
                offset,
                record_size: PAGED_RECORD_SIZE as u64,
            });
        }
        Ok(())
    }

    /// Read `count` records starting at byte `metadata_offset`.
    ///
    /// `force_read` bypasses the in-memory shadow and reassembles the
    /// records from backing-store blocks, verifying each block CRC.
    /// Offset 0 is the first chunk; the offset must be record-aligned.
    pub fn get_bits(
        &self,
        object_id: ObjectId,
        metadata_offset: u64,
        count: u64,
        force_read: bool,
    ) -> Result<Vec<ChunkRecord>> {
        Self::check_offset(metadata_offset)?;
        let object = self.object(object_id)?;
        let first = metadata_offset / PAGED_RECORD_SIZE as u64;
        if first + count > object.chunk_count {
            return Err(Error::InvalidOffset {
                offset: metadata_offset,
                record_size: PAGED_RECORD_SIZE as u64,
            });
        }

        let start = first as usize * PAGED_RECORD_SIZE;
        let len = count as usize * PAGED_RECORD_SIZE;
        let raw = if force_read {
            let mut file = object.file.lock();
            Self::read_span(&mut file, start as u64, len)?
        } else {
            object.shadow.lock()[start..start + len].to_vec()
        };

        Ok(raw
            .chunks_exact(PAGED_RECORD_SIZE)
            .map(|c| ChunkRecord::from_bytes(c.try_into().unwrap()))
            .collect())
    }

    /// OR `bit_pattern` into `repeat_count` records starting at
    /// `metadata_offset`. On the passive side the mutation is forwarded
    /// to the active SP.
    pub async fn set_bits(
        &self,
        object_id: ObjectId,
        metadata_offset: u64,
        bit_pattern: [u8; PAGED_RECORD_SIZE],
        repeat_count: u64,
    ) -> Result<()> {
        self.change_bits(object_id, metadata_offset, bit_pattern, repeat_count, true)
            .await
    }

    /// AND-NOT `bit_pattern` out of `repeat_count` records starting at
    /// `metadata_offset`.
    pub async fn clear_bits(
        &self,
        object_id: ObjectId,
        metadata_offset: u64,
        bit_pattern: [u8; PAGED_RECORD_SIZE],
        repeat_count: u64,
    ) -> Result<()> {
        self.change_bits(object_id, metadata_offset, bit_pattern, repeat_count, false)
            .await
    }

    async fn change_bits(
        &self,
        object_id: ObjectId,
        metadata_offset: u64,
        bit_pattern: [u8; PAGED_RECORD_SIZE],
        repeat_count: u64,
        set: bool,
    ) -> Result<()> {
        Self::check_offset(metadata_offset)?;
        let chunk_index = metadata_offset / PAGED_RECORD_SIZE as u64;

        if !self.element.is_active(object_id)? {
            // Passive side: the active SP owns the backing store.
            let op = if set {
                PagedOp::SetBits {
                    chunk_index,
                    repeat_count,
                    bit_pattern,
                }
            } else {
                PagedOp::ClearBits {
                    chunk_index,
                    repeat_count,
                    bit_pattern,
                }
            };
            self.peer
                .call(PeerRequest::PagedMutate { object_id, op })
                .await?;
            return Ok(());
        }

        self.apply_local(object_id, chunk_index, repeat_count, bit_pattern, set)?;
        self.push_shadow(object_id, chunk_index, repeat_count).await;
        Ok(())
    }

    /// Apply a mutation on the active side (local caller or forwarded
    /// from the passive peer).
    pub fn apply_local(
        &self,
        object_id: ObjectId,
        chunk_index: u64,
        repeat_count: u64,
        bit_pattern: [u8; PAGED_RECORD_SIZE],
        set: bool,
    ) -> Result<()> {
        let object = self.object(object_id)?;
        if chunk_index + repeat_count > object.chunk_count {
            return Err(Error::InvalidOffset {
                offset: chunk_index * PAGED_RECORD_SIZE as u64,
                record_size: PAGED_RECORD_SIZE as u64,
            });
        }

        let start = chunk_index as usize * PAGED_RECORD_SIZE;
        let len = repeat_count as usize * PAGED_RECORD_SIZE;

        let mut shadow = object.shadow.lock();
        for rep in 0..repeat_count as usize {
            for (i, pat) in bit_pattern.iter().enumerate() {
                let target = &mut shadow[start + rep * PAGED_RECORD_SIZE + i];
                if set {
                    *target |= pat;
                } else {
                    *target &= !pat;
                }
            }
        }
        let span = shadow[start..start + len].to_vec();
        let mut file = object.file.lock();
        Self::write_span(&mut file, start as u64, &span)?;
        debug!(%object_id, chunk_index, repeat_count, set, "paged bits updated");
        Ok(())
    }

    /// Service a mutation forwarded from the passive peer: apply it
    /// locally, then push the resulting span back so the passive shadow
    /// catches up.
    pub async fn apply_peer_mutate(&self, object_id: ObjectId, op: PagedOp) -> Result<()> {
        let (chunk_index, repeat_count, bit_pattern, set) = match op {
            PagedOp::SetBits {
                chunk_index,
                repeat_count,
                bit_pattern,
            } => (chunk_index, repeat_count, bit_pattern, true),
            PagedOp::ClearBits {
                chunk_index,
                repeat_count,
                bit_pattern,
            } => (chunk_index, repeat_count, bit_pattern, false),
        };
        self.apply_local(object_id, chunk_index, repeat_count, bit_pattern, set)?;
        self.push_shadow(object_id, chunk_index, repeat_count).await;
        Ok(())
    }

    /// Push the mutated span to the passive peer's shadow.
    async fn push_shadow(&self, object_id: ObjectId, chunk_index: u64, repeat_count: u64) {
        let records = {
            let Ok(object) = self.object(object_id) else {
                return;
            };
            let start = chunk_index as usize * PAGED_RECORD_SIZE;
            let len = repeat_count as usize * PAGED_RECORD_SIZE;
            let shadow = object.shadow.lock();
            shadow[start..start + len].to_vec()
        };
        // Shadow refresh is best-effort while the peer is down; the peer
        // reloads from the backing store on fail-over.
        let _ = self
            .peer
            .call(PeerRequest::PagedShadowPush {
                object_id,
                chunk_index,
                records,
            })
            .await;
    }

    /// Apply a shadow push received from the active peer.
    pub fn apply_shadow_push(
        &self,
        object_id: ObjectId,
        chunk_index: u64,
        records: &[u8],
    ) -> Result<()> {
        let object = self.object(object_id)?;
        let start = chunk_index as usize * PAGED_RECORD_SIZE;
        let mut shadow = object.shadow.lock();
        if start + records.len() > shadow.len() {
            return Err(Error::InvalidOffset {
                offset: chunk_index * PAGED_RECORD_SIZE as u64,
                record_size: PAGED_RECORD_SIZE as u64,
            });
        }
        shadow[start..start + records.len()].copy_from_slice(records);
        // Keep the passive backing copy warm as well so a force read on
        // either SP sees the same bits.
        let span = shadow[start..start + records.len()].to_vec();
        drop(shadow);
        let mut file = object.file.lock();
        Self::write_span(&mut file, start as u64, &span)?;
        Ok(())
    }

    /// Count chunks with the needs-rebuild bit set for one position.
    pub fn count_needs_rebuild(
        &self,
        object_id: ObjectId,
        position: Position,
        force_read: bool,
    ) -> Result<u64> {
        let count = self.chunk_count(object_id)?;
        let records = self.get_bits(object_id, 0, count, force_read)?;
        Ok(records
            .iter()
            .filter(|r| r.needs_rebuild_for(position))
            .count() as u64)
    }

    /// Read a payload span, reassembling records across block boundaries
    /// and verifying each block's CRC.
    fn read_span(file: &mut File, payload_offset: u64, len: usize) -> Result<Vec<u8>> {
        let first_block = payload_offset / STORE_BLOCK_PAYLOAD as u64;
        let last_block = (payload_offset + len as u64 - 1) / STORE_BLOCK_PAYLOAD as u64;

        let mut out = Vec::with_capacity(len);
        for block in first_block..=last_block {
            let mut buf = [0u8; STORE_BLOCK_SIZE];
            file.seek(SeekFrom::Start(block * STORE_BLOCK_SIZE as u64))?;
            file.read_exact(&mut buf)?;

            let expected = u32::from_le_bytes(buf[STORE_BLOCK_PAYLOAD..].try_into().unwrap());
            let actual = BlockChecksum::compute(&buf[..STORE_BLOCK_PAYLOAD]).0;
            if expected != actual {
                return Err(Error::ChecksumMismatch { expected, actual });
            }

            let block_start = block * STORE_BLOCK_PAYLOAD as u64;
            let from = payload_offset.saturating_sub(block_start) as usize;
            let to = ((payload_offset + len as u64) - block_start)
                .min(STORE_BLOCK_PAYLOAD as u64) as usize;
            out.extend_from_slice(&buf[from..to]);
        }
        Ok(out)
    }

    /// Write a payload span, read-modify-writing the boundary blocks.
    fn write_span(file: &mut File, payload_offset: u64, data: &[u8]) -> Result<()> {
        let first_block = payload_offset / STORE_BLOCK_PAYLOAD as u64;
        let last_block = (payload_offset + data.len() as u64 - 1) / STORE_BLOCK_PAYLOAD as u64;

        for block in first_block..=last_block {
            let block_pos = block * STORE_BLOCK_SIZE as u64;
            let mut buf = [0u8; STORE_BLOCK_SIZE];
            let file_len = file.metadata()?.len();
            if block_pos + (STORE_BLOCK_SIZE as u64) <= file_len {
                file.seek(SeekFrom::Start(block_pos))?;
                file.read_exact(&mut buf)?;
            }

            let block_start = block * STORE_BLOCK_PAYLOAD as u64;
            let from = payload_offset.saturating_sub(block_start) as usize;
            let to = ((payload_offset + data.len() as u64) - block_start)
                .min(STORE_BLOCK_PAYLOAD as u64) as usize;
            let src_from = (block_start + from as u64).saturating_sub(payload_offset) as usize;
            let src_to = src_from + (to - from);
            buf[from..to].copy_from_slice(&data[src_from..src_to]);

            let crc = BlockChecksum::compute(&buf[..STORE_BLOCK_PAYLOAD]).0;
            buf[STORE_BLOCK_PAYLOAD..].copy_from_slice(&crc.to_le_bytes());

            file.seek(SeekFrom::Start(block_pos))?;
            file.write_all(&buf)?;
        }
        file.sync_data()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::element::ElementState;
    use async_trait::async_trait;
    use extentio_common::SpId;
    use extentio_peer::PeerResponse;
    use tempfile::tempdir;

    struct AckPeer;

    #[async_trait]
    impl PeerLink for AckPeer {
        async fn call(&self, _request: PeerRequest) -> Result<PeerResponse> {
            Ok(PeerResponse::Ack)
        }
        fn is_connected(&self) -> bool {
            true
        }
        fn local_sp(&self) -> SpId {
            SpId::A
        }
    }

    fn active_store(dir: &Path, id: ObjectId, chunks: u64) -> PagedStore {
        let element = Arc::new(ElementTable::new());
        element.register(id, ElementState::Active);
        let store = PagedStore::new(dir, element, Arc::new(AckPeer)).unwrap();
        store.register(id, chunks).unwrap();
        store
    }

    #[tokio::test]
    async fn test_set_clear_get_bits() {
        let dir = tempdir().unwrap();
        let id = ObjectId::new(1);
        let store = active_store(dir.path(), id, 16);

        let pattern = ChunkRecord::nr_pattern(2);
        store.set_bits(id, 0, pattern, 4).await.unwrap();

        let records = store.get_bits(id, 0, 16, false).unwrap();
        assert!(records[0].needs_rebuild_for(2));
        assert!(records[3].needs_rebuild_for(2));
        assert!(!records[4].needs_rebuild_for(2));
        assert_eq!(store.count_needs_rebuild(id, 2, false).unwrap(), 4);

        store.clear_bits(id, 0, pattern, 4).await.unwrap();
        assert_eq!(store.count_needs_rebuild(id, 2, false).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_force_read_matches_shadow() {
        let dir = tempdir().unwrap();
        let id = ObjectId::new(2);
        // 200 records of 8 bytes = 1600 payload bytes, spans 4 blocks,
        // so several records straddle block boundaries.
        let store = active_store(dir.path(), id, 200);

        let pattern = ChunkRecord::nr_pattern(1);
        store.set_bits(id, 62 * 8, pattern, 10).await.unwrap();

        let shadow = store.get_bits(id, 0, 200, false).unwrap();
        let disk = store.get_bits(id, 0, 200, true).unwrap();
        assert_eq!(shadow, disk);
        assert_eq!(store.count_needs_rebuild(id, 1, true).unwrap(), 10);
    }

    #[tokio::test]
    async fn test_unaligned_offset_rejected() {
        let dir = tempdir().unwrap();
        let id = ObjectId::new(3);
        let store = active_store(dir.path(), id, 8);

        let err = store.get_bits(id, 3, 1, false).unwrap_err();
        assert!(matches!(err, Error::InvalidOffset { offset: 3, .. }));

        let err = store
            .set_bits(id, 5, ChunkRecord::nr_pattern(0), 1)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidOffset { offset: 5, .. }));
    }

    #[tokio::test]
    async fn test_out_of_range_rejected() {
        let dir = tempdir().unwrap();
        let id = ObjectId::new(4);
        let store = active_store(dir.path(), id, 8);
        assert!(store.get_bits(id, 7 * 8, 2, false).is_err());
    }

    #[test]
    fn test_record_round_trip() {
        let record = ChunkRecord {
            needs_rebuild: 0b101,
            verify_bits: 0b10,
            flags: CHUNK_FLAG_VALID | CHUNK_FLAG_CONSUMED,
        };
        assert_eq!(ChunkRecord::from_bytes(&record.to_bytes()), record);
    }
}

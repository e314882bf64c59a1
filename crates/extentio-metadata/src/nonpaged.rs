//! Non-paged metadata store
//!
//! One fixed 256-byte record per object, addressed by byte offset so that
//! `set_bits`/`clear_bits` can update several positions' fields in a
//! single call via the repeat stride. Every mutation mirrors the record
//! to the peer SP before returning; if the peer is unreachable the store
//! degrades to the local view and records that a resynchronization is
//! needed.
//!
//! Record layout (little-endian):
//! ```text
//! +-------+---------+------+----------+-----------------+------------------+
//! | Magic | Version | Size | Flags    | RbLogging (u16) | Checkpoints ...  |
//! | 4B    | 2B      | 2B   | 8B @16   | 2B @24          | 16 x 8B @32      |
//! +-------+---------+------+----------+-----------------+------------------+
//! | Rekey checkpoint 8B @160 | reserved to 256          |
//! +--------------------------+--------------------------+
//! ```

use dashmap::DashMap;
use extentio_common::{Error, ObjectId, Result};
use extentio_peer::{PeerLink, PeerRequest};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Fixed size of every non-paged record.
pub const NONPAGED_RECORD_SIZE: usize = 256;

/// Record header magic ("NPMD").
const NONPAGED_MAGIC: u32 = 0x4E50_4D44;

/// Current record layout version.
const NONPAGED_VERSION: u16 = 1;

/// Byte offsets of the typed fields within a record.
///
/// Callers address fields by offset so one `set_bits` call with a repeat
/// stride can touch several positions at once.
pub mod layout {
    /// Widest group the record can describe.
    pub const MAX_WIDTH: usize = 16;

    /// Clustered flags (u64).
    pub const CLUSTERED_FLAGS: u64 = 16;
    /// New I/O admission is paused while set.
    pub const FLAG_QUIESCED: u64 = 1 << 0;
    /// Journal recovery is required before the group goes Ready.
    pub const FLAG_JOURNAL_RECOVERY: u64 = 1 << 1;

    /// Rebuild-logging bitmask, one bit per position (u16).
    pub const RB_LOGGING_BITMASK: u64 = 24;

    /// First rebuild checkpoint (u64 per position).
    pub const REBUILD_CHECKPOINTS: u64 = 32;

    /// Encryption rekey checkpoint (u64).
    pub const REKEY_CHECKPOINT: u64 = 160;

    /// Offset of one position's rebuild checkpoint.
    #[must_use]
    pub const fn checkpoint_offset(position: u32) -> u64 {
        REBUILD_CHECKPOINTS + position as u64 * 8
    }
}

/// In-memory copy of one object's non-paged record.
#[derive(Clone)]
pub struct NonPagedRecord {
    data: [u8; NONPAGED_RECORD_SIZE],
}

impl NonPagedRecord {
    /// Fresh record with a valid header and zeroed body.
    #[must_use]
    pub fn new() -> Self {
        let mut data = [0u8; NONPAGED_RECORD_SIZE];
        data[0..4].copy_from_slice(&NONPAGED_MAGIC.to_le_bytes());
        data[4..6].copy_from_slice(&NONPAGED_VERSION.to_le_bytes());
        data[6..8].copy_from_slice(&(NONPAGED_RECORD_SIZE as u16).to_le_bytes());
        Self { data }
    }

    /// Raw record bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Rebuild a record from raw bytes (peer mirror push or load).
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 8 {
            return Err(Error::Serialization("non-paged record truncated".into()));
        }
        let magic = u32::from_le_bytes(bytes[0..4].try_into().expect("sliced"));
        if magic != NONPAGED_MAGIC {
            return Err(Error::Serialization(format!(
                "bad non-paged record magic {magic:#010x}"
            )));
        }
        let version = u16::from_le_bytes(bytes[4..6].try_into().expect("sliced"));
        if version > NONPAGED_VERSION {
            // Forward compatibility: load the prefix we understand.
            warn!(version, "non-paged record written by newer layout");
        }
        let mut data = [0u8; NONPAGED_RECORD_SIZE];
        let n = bytes.len().min(NONPAGED_RECORD_SIZE);
        data[..n].copy_from_slice(&bytes[..n]);
        Ok(Self { data })
    }

    /// Read a u64 field at the given offset.
    #[must_use]
    pub fn get_u64(&self, offset: u64) -> u64 {
        let o = offset as usize;
        u64::from_le_bytes(self.data[o..o + 8].try_into().expect("in-bounds"))
    }

    /// Read a u16 field at the given offset.
    #[must_use]
    pub fn get_u16(&self, offset: u64) -> u16 {
        let o = offset as usize;
        u16::from_le_bytes(self.data[o..o + 2].try_into().expect("in-bounds"))
    }

    fn put_u64(&mut self, offset: u64, value: u64) {
        let o = offset as usize;
        self.data[o..o + 8].copy_from_slice(&value.to_le_bytes());
    }

    /// Rebuild-logging state of one position.
    #[must_use]
    pub fn rb_logging(&self, position: u32) -> bool {
        self.get_u16(layout::RB_LOGGING_BITMASK) & (1 << position) != 0
    }

    /// Count of positions currently rebuild-logging.
    #[must_use]
    pub fn rb_logging_count(&self) -> u32 {
        self.get_u16(layout::RB_LOGGING_BITMASK).count_ones()
    }

    /// Rebuild checkpoint of one position.
    #[must_use]
    pub fn rebuild_checkpoint(&self, position: u32) -> u64 {
        self.get_u64(layout::checkpoint_offset(position))
    }

    /// Whether a clustered flag is set.
    #[must_use]
    pub fn has_flag(&self, flag: u64) -> bool {
        self.get_u64(layout::CLUSTERED_FLAGS) & flag != 0
    }
}

impl Default for NonPagedRecord {
    fn default() -> Self {
        Self::new()
    }
}

/// Store of non-paged records for all objects on one SP.
pub struct NonPagedStore {
    dir: PathBuf,
    records: DashMap<ObjectId, NonPagedRecord>,
    peer: Arc<dyn PeerLink>,
    /// Set when a mirror push failed; cleared on successful resync.
    peer_resync_needed: AtomicBool,
}

impl NonPagedStore {
    /// Create a store backed by `dir`, mirroring through `peer`.
    pub fn new(dir: impl AsRef<Path>, peer: Arc<dyn PeerLink>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            records: DashMap::new(),
            peer,
            peer_resync_needed: AtomicBool::new(false),
        })
    }

    /// Register a new object with a fresh record.
    pub fn register(&self, object_id: ObjectId) {
        self.records.entry(object_id).or_default();
    }

    /// Current in-memory copy of an object's record.
    pub fn get(&self, object_id: ObjectId) -> Result<NonPagedRecord> {
        self.records
            .get(&object_id)
            .map(|r| r.clone())
            .ok_or(Error::NotFound(object_id))
    }

    /// Atomically OR `data` into the record at `offset`, repeated
    /// `repeat_count` times at `repeat_offset` stride, then mirror.
    pub async fn set_bits(
        &self,
        object_id: ObjectId,
        offset: u64,
        data: &[u8],
        repeat_count: u64,
        repeat_offset: u64,
    ) -> Result<()> {
        self.change_bits(object_id, offset, data, repeat_count, repeat_offset, true)
            .await
    }

    /// Atomically AND-NOT `data` out of the record, with the same repeat
    /// semantics as [`set_bits`](Self::set_bits).
    pub async fn clear_bits(
        &self,
        object_id: ObjectId,
        offset: u64,
        data: &[u8],
        repeat_count: u64,
        repeat_offset: u64,
    ) -> Result<()> {
        self.change_bits(object_id, offset, data, repeat_count, repeat_offset, false)
            .await
    }

    async fn change_bits(
        &self,
        object_id: ObjectId,
        offset: u64,
        data: &[u8],
        repeat_count: u64,
        repeat_offset: u64,
        set: bool,
    ) -> Result<()> {
        {
            let mut entry = self
                .records
                .get_mut(&object_id)
                .ok_or(Error::NotFound(object_id))?;
            for rep in 0..repeat_count.max(1) {
                let base = offset + rep * repeat_offset;
                let end = base as usize + data.len();
                if end > NONPAGED_RECORD_SIZE {
                    return Err(Error::InvalidOffset {
                        offset: base,
                        record_size: NONPAGED_RECORD_SIZE as u64,
                    });
                }
                for (i, byte) in data.iter().enumerate() {
                    let target = &mut entry.data[base as usize + i];
                    if set {
                        *target |= byte;
                    } else {
                        *target &= !byte;
                    }
                }
            }
        }
        self.mirror(object_id).await;
        Ok(())
    }

    /// Offsets for u64 fields must be aligned and inside the record.
    fn check_u64_offset(field_offset: u64) -> Result<()> {
        if field_offset % 8 != 0 || field_offset as usize + 8 > NONPAGED_RECORD_SIZE {
            return Err(Error::InvalidOffset {
                offset: field_offset,
                record_size: 8,
            });
        }
        Ok(())
    }

    /// Unconditionally set a u64 checkpoint field, then mirror.
    pub async fn set_checkpoint(
        &self,
        object_id: ObjectId,
        field_offset: u64,
        value: u64,
    ) -> Result<()> {
        Self::check_u64_offset(field_offset)?;
        {
            let mut entry = self
                .records
                .get_mut(&object_id)
                .ok_or(Error::NotFound(object_id))?;
            entry.put_u64(field_offset, value);
        }
        self.mirror(object_id).await;
        Ok(())
    }

    /// Compare-and-swap advance of a u64 checkpoint field.
    ///
    /// Returns `Ok(false)` (a reported no-op, not an error) when the
    /// current value does not match `expected_old` — this protects the
    /// rebuild engine against racing a concurrent checkpoint
    /// reinitialization.
    pub async fn increment_checkpoint(
        &self,
        object_id: ObjectId,
        field_offset: u64,
        expected_old: u64,
        delta: u64,
    ) -> Result<bool> {
        Self::check_u64_offset(field_offset)?;
        let advanced = {
            let mut entry = self
                .records
                .get_mut(&object_id)
                .ok_or(Error::NotFound(object_id))?;
            if entry.get_u64(field_offset) != expected_old {
                debug!(
                    %object_id,
                    field_offset, expected_old, "checkpoint CAS lost, reporting no-op"
                );
                false
            } else {
                entry.put_u64(field_offset, expected_old.wrapping_add(delta));
                true
            }
        };
        if advanced {
            self.mirror(object_id).await;
        }
        Ok(advanced)
    }

    /// Push the authoritative record to the peer SP.
    ///
    /// Peer loss degrades to the local view only; the condition is
    /// recorded so the monitor can resynchronize later.
    async fn mirror(&self, object_id: ObjectId) {
        let record = match self.records.get(&object_id) {
            Some(r) => r.as_bytes().to_vec(),
            None => return,
        };
        let result = self
            .peer
            .call(PeerRequest::NonpagedMirror { object_id, record })
            .await;
        if let Err(e) = result {
            warn!(%object_id, error = %e, "non-paged mirror failed, local view only");
            self.peer_resync_needed.store(true, Ordering::SeqCst);
        }
    }

    /// Apply a mirror push received from the peer SP.
    pub fn apply_peer_mirror(&self, object_id: ObjectId, bytes: &[u8]) -> Result<()> {
        let record = NonPagedRecord::from_bytes(bytes)?;
        self.records.insert(object_id, record);
        Ok(())
    }

    /// Whether a mirror push has failed since the last resync.
    #[must_use]
    pub fn needs_peer_resync(&self) -> bool {
        self.peer_resync_needed.load(Ordering::SeqCst)
    }

    /// Re-push every record to the peer and clear the resync flag.
    pub async fn resync_peer(&self) -> Result<()> {
        let ids: Vec<ObjectId> = self.records.iter().map(|e| *e.key()).collect();
        for object_id in ids {
            let record = match self.records.get(&object_id) {
                Some(r) => r.as_bytes().to_vec(),
                None => continue,
            };
            self.peer
                .call(PeerRequest::NonpagedMirror { object_id, record })
                .await?;
        }
        self.peer_resync_needed.store(false, Ordering::SeqCst);
        info!("non-paged peer resync complete");
        Ok(())
    }

    fn record_path(&self, object_id: ObjectId) -> PathBuf {
        self.dir.join(format!("np_{:016x}.bin", object_id.as_u64()))
    }

    /// Persist one object's record crash-atomically (temp + rename).
    pub fn persist(&self, object_id: ObjectId) -> Result<()> {
        let record = self.get(object_id)?;
        let path = self.record_path(object_id);
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, record.as_bytes())?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// Persist every registered object's record.
    pub fn persist_all(&self) -> Result<()> {
        let ids: Vec<ObjectId> = self.records.iter().map(|e| *e.key()).collect();
        for id in ids {
            self.persist(id)?;
        }
        Ok(())
    }

    /// Reload one object's record from the backing store.
    pub fn load(&self, object_id: ObjectId) -> Result<()> {
        let bytes = fs::read(self.record_path(object_id))?;
        let record = NonPagedRecord::from_bytes(&bytes)?;
        self.records.insert(object_id, record);
        Ok(())
    }

    /// Reload every persisted record found in the backing directory.
    pub fn load_all(&self) -> Result<usize> {
        let mut loaded = 0;
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            let Some(hex) = name.strip_prefix("np_").and_then(|n| n.strip_suffix(".bin")) else {
                continue;
            };
            let Ok(id) = u64::from_str_radix(hex, 16) else {
                continue;
            };
            let bytes = fs::read(entry.path())?;
            self.records
                .insert(ObjectId::new(id), NonPagedRecord::from_bytes(&bytes)?);
            loaded += 1;
        }
        info!(loaded, "non-paged load complete");
        Ok(loaded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use extentio_common::SpId;
    use extentio_peer::PeerResponse;
    use tempfile::tempdir;

    /// Peer stub: acks everything, optionally fails.
    struct StubPeer {
        fail: AtomicBool,
    }

    impl StubPeer {
        fn ok() -> Arc<Self> {
            Arc::new(Self {
                fail: AtomicBool::new(false),
            })
        }
    }

    #[async_trait]
    impl PeerLink for StubPeer {
        async fn call(&self, _request: PeerRequest) -> Result<PeerResponse> {
            if self.fail.load(Ordering::SeqCst) {
                Err(Error::PeerUnreachable)
            } else {
                Ok(PeerResponse::Ack)
            }
        }
        fn is_connected(&self) -> bool {
            !self.fail.load(Ordering::SeqCst)
        }
        fn local_sp(&self) -> SpId {
            SpId::A
        }
    }

    #[tokio::test]
    async fn test_set_bits_with_repeat_stride() {
        let dir = tempdir().unwrap();
        let store = NonPagedStore::new(dir.path(), StubPeer::ok()).unwrap();
        let id = ObjectId::new(1);
        store.register(id);

        // Mark positions 0..3 checkpoints with the same low byte in one call.
        store
            .set_bits(id, layout::checkpoint_offset(0), &[0x01], 3, 8)
            .await
            .unwrap();

        let record = store.get(id).unwrap();
        assert_eq!(record.rebuild_checkpoint(0), 1);
        assert_eq!(record.rebuild_checkpoint(1), 1);
        assert_eq!(record.rebuild_checkpoint(2), 1);
        assert_eq!(record.rebuild_checkpoint(3), 0);
    }

    #[tokio::test]
    async fn test_increment_checkpoint_cas() {
        let dir = tempdir().unwrap();
        let store = NonPagedStore::new(dir.path(), StubPeer::ok()).unwrap();
        let id = ObjectId::new(2);
        store.register(id);

        let off = layout::checkpoint_offset(1);
        store.set_checkpoint(id, off, 100).await.unwrap();

        // Matching expectation advances.
        assert!(store.increment_checkpoint(id, off, 100, 50).await.unwrap());
        assert_eq!(store.get(id).unwrap().rebuild_checkpoint(1), 150);

        // Stale expectation is a no-op, not an error.
        assert!(!store.increment_checkpoint(id, off, 100, 50).await.unwrap());
        assert_eq!(store.get(id).unwrap().rebuild_checkpoint(1), 150);
    }

    #[tokio::test]
    async fn test_checkpoint_offset_validation() {
        let dir = tempdir().unwrap();
        let store = NonPagedStore::new(dir.path(), StubPeer::ok()).unwrap();
        let id = ObjectId::new(5);
        store.register(id);

        // Past the record end.
        assert!(matches!(
            store.set_checkpoint(id, NONPAGED_RECORD_SIZE as u64, 1).await,
            Err(Error::InvalidOffset { .. })
        ));
        // Misaligned.
        assert!(matches!(
            store.increment_checkpoint(id, 33, 0, 1).await,
            Err(Error::InvalidOffset { .. })
        ));
    }

    #[tokio::test]
    async fn test_persist_and_load() {
        let dir = tempdir().unwrap();
        let id = ObjectId::new(3);
        {
            let store = NonPagedStore::new(dir.path(), StubPeer::ok()).unwrap();
            store.register(id);
            store
                .set_checkpoint(id, layout::checkpoint_offset(0), 0xDEAD)
                .await
                .unwrap();
            store.persist(id).unwrap();
        }
        let store = NonPagedStore::new(dir.path(), StubPeer::ok()).unwrap();
        assert_eq!(store.load_all().unwrap(), 1);
        assert_eq!(store.get(id).unwrap().rebuild_checkpoint(0), 0xDEAD);
    }

    #[tokio::test]
    async fn test_peer_loss_degrades_not_fails() {
        let dir = tempdir().unwrap();
        let peer = StubPeer::ok();
        let store = NonPagedStore::new(dir.path(), Arc::clone(&peer) as Arc<dyn PeerLink>).unwrap();
        let id = ObjectId::new(4);
        store.register(id);

        peer.fail.store(true, Ordering::SeqCst);
        store
            .set_checkpoint(id, layout::checkpoint_offset(0), 7)
            .await
            .unwrap();
        assert!(store.needs_peer_resync());
        assert_eq!(store.get(id).unwrap().rebuild_checkpoint(0), 7);
    }

    #[tokio::test]
    async fn test_unknown_object() {
        let dir = tempdir().unwrap();
        let store = NonPagedStore::new(dir.path(), StubPeer::ok()).unwrap();
        assert!(matches!(
            store.get(ObjectId::new(99)),
            Err(Error::NotFound(_))
        ));
    }
}

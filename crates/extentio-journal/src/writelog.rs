//! Journaled full-stripe write staging
//!
//! Each member drive reserves `slot_count * slot_blocks` blocks at
//! `journal_start` for the write log. A slot occupies the same block
//! range on every member: one header block followed by that member's
//! staged data. Staging is durable before the live-stripe write begins,
//! so a crash between the two leaves a replayable intent on disk.
//!
//! Slot lifecycle:
//!
//! ```text
//!   Free -> Reserved -> DataWritten -> Committed -> Free
//!                            |
//!                       (recovery scan)
//!                            v
//!                        Verifying -> replayed or invalidated
//! ```
//!
//! Recovery and member-return rebuild are one state machine with two
//! entry points: [`WriteLog::verify_and_flush`] scans all slots on all
//! present members, [`WriteLog::rebuild_region`] re-initializes a single
//! returning member's extent under the current key epoch.

use crate::keys::RekeyCipher;
use extentio_common::{
    BlockChecksum, Error, JournalConfig, Lba, Position, Result, BLOCK_SIZE,
};
use extentio_storage::DriveSet;
use parking_lot::Mutex;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

/// Slot header magic ("EJRN").
const HEADER_MAGIC: u32 = 0x4E52_4A45;
const HEADER_VERSION: u16 = 1;
/// Header bytes covered by the trailing CRC.
const HEADER_CRC_SPAN: usize = 52;

/// On-disk marker for a fully staged slot.
const MARKER_DATA_WRITTEN: u8 = 2;

/// In-memory lifecycle of one slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SlotState {
    Free,
    Reserved,
    DataWritten,
    Committed,
    Verifying,
}

/// One member's share of a staged stripe write.
#[derive(Clone, Debug)]
pub struct MemberWrite {
    pub position: Position,
    /// Member-drive block address the data belongs at.
    pub pba: Lba,
    /// Plaintext block-aligned payload.
    pub data: Vec<u8>,
}

/// A full-stripe write intent to be staged before the live write.
#[derive(Clone, Debug)]
pub struct StripeIntent {
    /// Group-relative LBA of the stripe, for diagnostics.
    pub stripe_start_lba: Lba,
    pub writes: Vec<MemberWrite>,
}

/// Outcome of a recovery scan.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FlushSummary {
    /// Slots whose staged data was verified and written to the live stripe.
    pub replayed: u32,
    /// Slots whose staging was incomplete and were discarded.
    pub invalidated: u32,
    /// Fully staged intents whose slot data could not be read back. The
    /// live span each one covers may be torn and must be reconstructed
    /// from the surviving positions before it is trusted.
    pub torn: Vec<TornIntent>,
}

/// A staged intent lost to a media error during recovery.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TornIntent {
    pub position: Position,
    pub live_pba: Lba,
    pub block_count: u32,
}

/// Parsed slot header.
struct SlotHeader {
    slot_id: u32,
    position: Position,
    live_pba: Lba,
    block_count: u32,
    key_epoch: u64,
    csum_of_csums: BlockChecksum,
}

impl SlotHeader {
    fn to_block(&self, stripe_start_lba: Lba) -> [u8; BLOCK_SIZE] {
        let mut block = [0u8; BLOCK_SIZE];
        block[0..4].copy_from_slice(&HEADER_MAGIC.to_le_bytes());
        block[4..6].copy_from_slice(&HEADER_VERSION.to_le_bytes());
        block[6] = MARKER_DATA_WRITTEN;
        block[8..12].copy_from_slice(&self.slot_id.to_le_bytes());
        block[12..16].copy_from_slice(&self.position.to_le_bytes());
        block[16..24].copy_from_slice(&self.live_pba.to_le_bytes());
        block[24..28].copy_from_slice(&self.block_count.to_le_bytes());
        block[32..40].copy_from_slice(&stripe_start_lba.to_le_bytes());
        block[40..48].copy_from_slice(&self.key_epoch.to_le_bytes());
        block[48..52].copy_from_slice(&self.csum_of_csums.0.to_le_bytes());
        let crc = crc32c::crc32c(&block[..HEADER_CRC_SPAN]);
        block[HEADER_CRC_SPAN..HEADER_CRC_SPAN + 4].copy_from_slice(&crc.to_le_bytes());
        block
    }

    /// Parse a header block; `None` for anything not a valid staged header.
    fn from_block(block: &[u8]) -> Option<Self> {
        let magic = u32::from_le_bytes(block[0..4].try_into().ok()?);
        if magic != HEADER_MAGIC {
            return None;
        }
        let version = u16::from_le_bytes(block[4..6].try_into().ok()?);
        if version != HEADER_VERSION || block[6] != MARKER_DATA_WRITTEN {
            return None;
        }
        let crc = u32::from_le_bytes(
            block[HEADER_CRC_SPAN..HEADER_CRC_SPAN + 4].try_into().ok()?,
        );
        if crc32c::crc32c(&block[..HEADER_CRC_SPAN]) != crc {
            return None;
        }
        Some(Self {
            slot_id: u32::from_le_bytes(block[8..12].try_into().ok()?),
            position: u32::from_le_bytes(block[12..16].try_into().ok()?),
            live_pba: u64::from_le_bytes(block[16..24].try_into().ok()?),
            block_count: u32::from_le_bytes(block[24..28].try_into().ok()?),
            key_epoch: u64::from_le_bytes(block[40..48].try_into().ok()?),
            csum_of_csums: BlockChecksum(u32::from_le_bytes(
                block[48..52].try_into().ok()?,
            )),
        })
    }
}

/// The write log for one RAID group.
pub struct WriteLog {
    journal_start: Lba,
    config: JournalConfig,
    slots: Mutex<Vec<SlotState>>,
    slot_freed: Notify,
}

impl WriteLog {
    /// Blocks the journal region occupies on each member drive.
    #[must_use]
    pub fn region_blocks(config: &JournalConfig) -> u64 {
        u64::from(config.slot_count) * config.slot_blocks
    }

    #[must_use]
    pub fn new(journal_start: Lba, config: JournalConfig) -> Self {
        let slots = vec![SlotState::Free; config.slot_count as usize];
        Self {
            journal_start,
            config,
            slots: Mutex::new(slots),
            slot_freed: Notify::new(),
        }
    }

    /// Member-drive block address of a slot's header block.
    fn slot_pba(&self, slot_id: u32) -> Lba {
        self.journal_start + u64::from(slot_id) * self.config.slot_blocks
    }

    /// Data blocks available per member per slot.
    fn data_blocks(&self) -> u64 {
        self.config.slot_blocks - 1
    }

    #[must_use]
    pub fn slot_state(&self, slot_id: u32) -> SlotState {
        self.slots.lock()[slot_id as usize]
    }

    /// Claim a free slot, or fail fast with `JournalFull`.
    pub fn reserve_slot(&self) -> Result<u32> {
        let mut slots = self.slots.lock();
        for (id, state) in slots.iter_mut().enumerate() {
            if *state == SlotState::Free {
                *state = SlotState::Reserved;
                return Ok(id as u32);
            }
        }
        Err(Error::JournalFull)
    }

    /// Claim a free slot, waiting up to `budget` for one to free up.
    pub async fn reserve_slot_wait(&self, budget: Duration) -> Result<u32> {
        let deadline = tokio::time::Instant::now() + budget;
        loop {
            // Register for the wakeup before probing: a release landing
            // between a failed probe and the wait must not be missed.
            let notified = self.slot_freed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            match self.reserve_slot() {
                Err(Error::JournalFull) => {}
                other => return other,
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                // A release may have raced the deadline itself.
                return match self.reserve_slot() {
                    Err(Error::JournalFull) => {
                        Err(Error::Timeout("journal slot reservation".into()))
                    }
                    other => other,
                };
            }
        }
    }

    /// Abort a reservation that never staged data.
    pub fn release_slot(&self, slot_id: u32) {
        let mut slots = self.slots.lock();
        if slots[slot_id as usize] == SlotState::Reserved {
            slots[slot_id as usize] = SlotState::Free;
            self.slot_freed.notify_waiters();
        }
    }

    fn set_state(&self, slot_id: u32, state: SlotState) {
        self.slots.lock()[slot_id as usize] = state;
        if state == SlotState::Free {
            self.slot_freed.notify_waiters();
        }
    }

    /// Stage an intent into a reserved slot, durably, on every present
    /// member it touches. Data is encrypted under the epoch in force for
    /// its live address right now, and that epoch is captured in the
    /// slot header. Missing members are skipped; their blocks are owed
    /// to rebuild via needs-rebuild marks, not the journal.
    pub fn write_intent(
        &self,
        drives: &DriveSet,
        slot_id: u32,
        intent: &StripeIntent,
        cipher: &RekeyCipher,
    ) -> Result<()> {
        if self.slot_state(slot_id) != SlotState::Reserved {
            return Err(Error::internal(format!(
                "write_intent on slot {slot_id} in state {:?}",
                self.slot_state(slot_id)
            )));
        }
        let slot_pba = self.slot_pba(slot_id);
        for write in &intent.writes {
            let block_count = (write.data.len() / BLOCK_SIZE) as u32;
            if u64::from(block_count) > self.data_blocks() {
                return Err(Error::internal(format!(
                    "intent of {block_count} blocks exceeds slot capacity {}",
                    self.data_blocks()
                )));
            }
            let drive = drives.drive(write.position)?;

            let epoch = cipher.epoch_for_lba(write.pba);
            let mut staged = write.data.clone();
            cipher.apply(epoch, write.pba, &mut staged)?;

            let checksums: Vec<BlockChecksum> = staged
                .chunks(BLOCK_SIZE)
                .map(BlockChecksum::compute)
                .collect();
            let header = SlotHeader {
                slot_id,
                position: write.position,
                live_pba: write.pba,
                block_count,
                key_epoch: epoch,
                csum_of_csums: BlockChecksum::fold(&checksums),
            };

            // Data first, header last: a header only becomes visible
            // once the blocks it vouches for are durable.
            match drive.write_blocks(slot_pba + 1, &staged) {
                Ok(()) => {}
                Err(Error::DriveRemoved(position)) => {
                    debug!(slot_id, position, "skipping absent member during staging");
                    continue;
                }
                Err(e) => return Err(e),
            }
            drive.write_blocks(slot_pba, &header.to_block(intent.stripe_start_lba))?;
        }
        self.set_state(slot_id, SlotState::DataWritten);
        debug!(
            slot_id,
            stripe = intent.stripe_start_lba,
            "stripe intent staged"
        );
        Ok(())
    }

    /// The live-stripe write landed; invalidate the slot's headers on
    /// every present member and free the slot.
    pub fn commit(&self, drives: &DriveSet, slot_id: u32) -> Result<()> {
        if self.slot_state(slot_id) != SlotState::DataWritten {
            return Err(Error::internal(format!(
                "commit on slot {slot_id} in state {:?}",
                self.slot_state(slot_id)
            )));
        }
        self.set_state(slot_id, SlotState::Committed);
        self.invalidate_slot(drives, slot_id)?;
        self.set_state(slot_id, SlotState::Free);
        Ok(())
    }

    fn invalidate_slot(&self, drives: &DriveSet, slot_id: u32) -> Result<()> {
        let zero = [0u8; BLOCK_SIZE];
        let pba = self.slot_pba(slot_id);
        for position in 0..drives.width() {
            match drives.drive(position)?.write_blocks(pba, &zero) {
                Ok(()) | Err(Error::DriveRemoved(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Recovery entry point: scan every slot header on every present
    /// member. A header whose staged data verifies is replayed to its
    /// live address (re-encrypted under the epoch that governs that
    /// address now); a header whose data fails verification marks an
    /// interrupted staging and is discarded, leaving the live stripe as
    /// it was. A media error on fully staged data also discards the
    /// slot, but the lost span is reported in [`FlushSummary::torn`]:
    /// the live write may have started, so the caller must mark the
    /// span for reconstruction from the surviving positions.
    pub fn verify_and_flush(
        &self,
        drives: &DriveSet,
        cipher: &RekeyCipher,
    ) -> Result<FlushSummary> {
        let mut summary = FlushSummary::default();
        for slot_id in 0..self.config.slot_count {
            self.set_state(slot_id, SlotState::Verifying);
            let outcome = self.verify_slot(drives, cipher, slot_id, &mut summary);
            self.set_state(slot_id, SlotState::Free);
            outcome?;
        }
        if summary.replayed + summary.invalidated > 0 {
            info!(
                replayed = summary.replayed,
                invalidated = summary.invalidated,
                "journal recovery complete"
            );
        }
        Ok(summary)
    }

    fn verify_slot(
        &self,
        drives: &DriveSet,
        cipher: &RekeyCipher,
        slot_id: u32,
        summary: &mut FlushSummary,
    ) -> Result<()> {
        let slot_pba = self.slot_pba(slot_id);
        for position in 0..drives.width() {
            let drive = match drives.drive(position) {
                Ok(d) => d,
                Err(e) => return Err(e),
            };
            let header_block = match drive.read_blocks(slot_pba, 1) {
                Ok(b) => b,
                Err(Error::DriveRemoved(_)) => continue,
                Err(e) => return Err(e),
            };
            let Some(header) = SlotHeader::from_block(&header_block) else {
                continue;
            };
            if header.slot_id != slot_id || header.position != position {
                warn!(slot_id, position, "mismatched slot header, discarding");
                drive.write_blocks(slot_pba, &[0u8; BLOCK_SIZE])?;
                summary.invalidated += 1;
                continue;
            }

            let staged = match drive.read_blocks(slot_pba + 1, u64::from(header.block_count)) {
                Ok(staged) => staged,
                Err(Error::Media { position: p, lba }) => {
                    // The header was durable, so the live write may have
                    // started. The span cannot be replayed; report it so
                    // the caller reconstructs it from the survivors.
                    warn!(slot_id, position = p, lba, "staged data unreadable, span is suspect");
                    summary.torn.push(TornIntent {
                        position,
                        live_pba: header.live_pba,
                        block_count: header.block_count,
                    });
                    drive.write_blocks(slot_pba, &[0u8; BLOCK_SIZE])?;
                    summary.invalidated += 1;
                    continue;
                }
                Err(e) => return Err(e),
            };
            let checksums: Vec<BlockChecksum> = staged
                .chunks(BLOCK_SIZE)
                .map(BlockChecksum::compute)
                .collect();
            if BlockChecksum::fold(&checksums) != header.csum_of_csums {
                warn!(slot_id, position, "staged data fails verification, discarding");
                drive.write_blocks(slot_pba, &[0u8; BLOCK_SIZE])?;
                summary.invalidated += 1;
                continue;
            }

            // Decrypt under the captured epoch, re-encrypt under the
            // epoch governing the live address at replay time.
            let mut data = staged;
            cipher.apply(header.key_epoch, header.live_pba, &mut data)?;
            let live_epoch = cipher.epoch_for_lba(header.live_pba);
            cipher.apply(live_epoch, header.live_pba, &mut data)?;
            drive.write_blocks(header.live_pba, &data)?;
            drive.write_blocks(slot_pba, &[0u8; BLOCK_SIZE])?;
            info!(
                slot_id,
                position,
                live_pba = header.live_pba,
                "replayed journaled write"
            );
            summary.replayed += 1;
        }
        Ok(())
    }

    /// A member has returned: its journal extent is stale and must be
    /// re-initialized before normal I/O resumes. Headers are written
    /// invalid and data blocks zero-filled under the current key epoch.
    pub fn rebuild_region(
        &self,
        drives: &DriveSet,
        position: Position,
        cipher: &RekeyCipher,
    ) -> Result<()> {
        let drive = drives.drive(position)?;
        let epoch = cipher.current_epoch();
        for slot_id in 0..self.config.slot_count {
            let slot_pba = self.slot_pba(slot_id);
            let mut data = vec![0u8; self.data_blocks() as usize * BLOCK_SIZE];
            cipher.apply(epoch, slot_pba + 1, &mut data)?;
            drive.write_blocks(slot_pba + 1, &data)?;
            drive.write_blocks(slot_pba, &[0u8; BLOCK_SIZE])?;
        }
        info!(position, "journal region rebuilt");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const JOURNAL_START: Lba = 1024;

    fn config() -> JournalConfig {
        JournalConfig {
            slot_count: 4,
            slot_blocks: 1 + 8,
        }
    }

    fn setup(width: u32) -> (tempfile::TempDir, DriveSet, WriteLog, RekeyCipher) {
        let dir = tempdir().unwrap();
        let capacity = JOURNAL_START + WriteLog::region_blocks(&config());
        let drives = DriveSet::create(dir.path(), width, capacity).unwrap();
        let log = WriteLog::new(JOURNAL_START, config());
        let cipher = RekeyCipher::new([7u8; 32]);
        (dir, drives, log, cipher)
    }

    fn intent(position: Position, pba: Lba, fill: u8, blocks: usize) -> StripeIntent {
        StripeIntent {
            stripe_start_lba: 0,
            writes: vec![MemberWrite {
                position,
                pba,
                data: vec![fill; blocks * BLOCK_SIZE],
            }],
        }
    }

    fn read_plain(
        drives: &DriveSet,
        cipher: &RekeyCipher,
        position: Position,
        pba: Lba,
        blocks: u64,
    ) -> Vec<u8> {
        let mut data = drives.drive(position).unwrap().read_blocks(pba, blocks).unwrap();
        cipher.apply(cipher.epoch_for_lba(pba), pba, &mut data).unwrap();
        data
    }

    #[test]
    fn test_reserve_exhaust_release() {
        let (_dir, _drives, log, _cipher) = setup(1);
        for expected in 0..4 {
            assert_eq!(log.reserve_slot().unwrap(), expected);
        }
        assert!(matches!(log.reserve_slot(), Err(Error::JournalFull)));
        log.release_slot(2);
        assert_eq!(log.reserve_slot().unwrap(), 2);
    }

    #[tokio::test]
    async fn test_reserve_wait_times_out() {
        let (_dir, _drives, log, _cipher) = setup(1);
        for _ in 0..4 {
            log.reserve_slot().unwrap();
        }
        let err = log
            .reserve_slot_wait(Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
    }

    #[tokio::test]
    async fn test_reserve_wait_wakes_on_release() {
        let (_dir, _drives, log, _cipher) = setup(1);
        for _ in 0..4 {
            log.reserve_slot().unwrap();
        }
        // A release while the waiter is parked must wake it, not let it
        // burn the budget.
        let (got, ()) = tokio::join!(log.reserve_slot_wait(Duration::from_secs(5)), async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            log.release_slot(1);
        });
        assert_eq!(got.unwrap(), 1);
    }

    #[test]
    fn test_stage_flush_replays_to_live() {
        let (_dir, drives, log, cipher) = setup(2);
        let slot = log.reserve_slot().unwrap();
        log.write_intent(&drives, slot, &intent(1, 100, 0xAB, 3), &cipher)
            .unwrap();

        // Crash before the live write: recovery must replay the intent.
        let summary = log.verify_and_flush(&drives, &cipher).unwrap();
        assert_eq!(summary.replayed, 1);
        assert_eq!(summary.invalidated, 0);
        assert_eq!(
            read_plain(&drives, &cipher, 1, 100, 3),
            vec![0xABu8; 3 * BLOCK_SIZE]
        );

        // Replay invalidated the header; a second scan finds nothing.
        let again = log.verify_and_flush(&drives, &cipher).unwrap();
        assert_eq!(again, FlushSummary::default());
    }

    #[test]
    fn test_commit_invalidates_slot() {
        let (_dir, drives, log, cipher) = setup(1);
        let slot = log.reserve_slot().unwrap();
        log.write_intent(&drives, slot, &intent(0, 200, 0x11, 2), &cipher)
            .unwrap();
        log.commit(&drives, slot).unwrap();

        assert_eq!(log.slot_state(slot), SlotState::Free);
        let summary = log.verify_and_flush(&drives, &cipher).unwrap();
        assert_eq!(summary, FlushSummary::default());
    }

    #[test]
    fn test_torn_staging_is_discarded() {
        let (_dir, drives, log, cipher) = setup(1);
        let slot = log.reserve_slot().unwrap();
        log.write_intent(&drives, slot, &intent(0, 300, 0x42, 2), &cipher)
            .unwrap();

        // Corrupt one staged data block under the header's checksum.
        let drive = drives.drive(0).unwrap();
        let slot_pba = JOURNAL_START + u64::from(slot) * 9;
        drive.write_blocks(slot_pba + 1, &[0xFFu8; BLOCK_SIZE]).unwrap();

        let before = drive.read_blocks(300, 2).unwrap();
        let summary = log.verify_and_flush(&drives, &cipher).unwrap();
        assert_eq!(summary.replayed, 0);
        assert_eq!(summary.invalidated, 1);
        // Live blocks untouched by the discarded intent.
        assert_eq!(drive.read_blocks(300, 2).unwrap(), before);
    }

    #[test]
    fn test_unreadable_staged_data_reports_torn_span() {
        let (_dir, drives, log, cipher) = setup(2);
        let slot = log.reserve_slot().unwrap();
        log.write_intent(
            &drives,
            slot,
            &StripeIntent {
                stripe_start_lba: 0,
                writes: vec![
                    MemberWrite {
                        position: 0,
                        pba: 100,
                        data: vec![0x21; 2 * BLOCK_SIZE],
                    },
                    MemberWrite {
                        position: 1,
                        pba: 100,
                        data: vec![0x12; 2 * BLOCK_SIZE],
                    },
                ],
            },
            &cipher,
        )
        .unwrap();

        // The staged copy on member 1 dies before recovery reads it back.
        let slot_pba = JOURNAL_START + u64::from(slot) * 9;
        drives.drive(1).unwrap().inject_read_errors_at(slot_pba + 1, 1);

        let summary = log.verify_and_flush(&drives, &cipher).unwrap();
        assert_eq!(summary.replayed, 1);
        assert_eq!(summary.invalidated, 1);
        // The lost span is reported for reconstruction, not dropped.
        assert_eq!(
            summary.torn,
            vec![TornIntent {
                position: 1,
                live_pba: 100,
                block_count: 2,
            }]
        );
        // The surviving copy still replayed.
        assert_eq!(
            read_plain(&drives, &cipher, 0, 100, 2),
            vec![0x21u8; 2 * BLOCK_SIZE]
        );
        // The failed slot's header is invalidated; a rescan is clean.
        assert_eq!(
            log.verify_and_flush(&drives, &cipher).unwrap(),
            FlushSummary::default()
        );
    }

    #[test]
    fn test_replay_uses_captured_epoch_across_rekey() {
        let (_dir, drives, log, cipher) = setup(1);
        let slot = log.reserve_slot().unwrap();
        let plain = vec![0x5Au8; 2 * BLOCK_SIZE];
        log.write_intent(
            &drives,
            slot,
            &StripeIntent {
                stripe_start_lba: 0,
                writes: vec![MemberWrite {
                    position: 0,
                    pba: 400,
                    data: plain.clone(),
                }],
            },
            &cipher,
        )
        .unwrap();

        // The rekey checkpoint passes the live address between staging
        // and recovery. Replay must decrypt with the staged epoch and
        // land the data under the new one.
        cipher.start_rekey([9u8; 32]).unwrap();
        cipher.advance_checkpoint(500);

        let summary = log.verify_and_flush(&drives, &cipher).unwrap();
        assert_eq!(summary.replayed, 1);
        assert_eq!(cipher.epoch_for_lba(400), 1);
        assert_eq!(read_plain(&drives, &cipher, 0, 400, 2), plain);
    }

    #[test]
    fn test_rebuild_region_clears_stale_headers() {
        let (_dir, drives, log, cipher) = setup(2);
        let slot = log.reserve_slot().unwrap();
        log.write_intent(&drives, slot, &intent(1, 100, 0x77, 1), &cipher)
            .unwrap();

        log.rebuild_region(&drives, 1, &cipher).unwrap();
        let summary = log.verify_and_flush(&drives, &cipher).unwrap();
        assert_eq!(summary, FlushSummary::default());
    }

    #[test]
    fn test_staging_skips_absent_member() {
        let (_dir, drives, log, cipher) = setup(2);
        drives.drive(1).unwrap().remove();
        let slot = log.reserve_slot().unwrap();
        log.write_intent(&drives, slot, &intent(1, 100, 0xEE, 1), &cipher)
            .unwrap();
        assert_eq!(log.slot_state(slot), SlotState::DataWritten);
    }
}

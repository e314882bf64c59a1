//! RAID group object
//!
//! One `RaidGroup` exists per SP per configured group; both instances
//! share the member drives and coordinate through mirrored non-paged
//! metadata, the paged chunk records and the stripe lock manager.
//!
//! Member position lifecycle:
//!
//! ```text
//!   Present --drive pulled--> Degraded --logging mark--> RebuildLogging
//!      ^                                                     |
//!      |                                         drive returns, journal
//!      +-- rebuild drains needs-rebuild chunks <-- region rebuilt
//!                 (Rebuilding)
//! ```
//!
//! Losing more positions than the type tolerates fails the whole group;
//! every client I/O then fails until enough members return and the group
//! re-activates.

use crate::geometry::Geometry;
use extentio_common::{
    EngineConfig, Error, Lba, LifecycleState, ObjectId, Position, RaidType, Result, SpId,
    INVALID_LBA,
};
use extentio_journal::{RekeyCipher, WriteLog};
use extentio_lock::StripeLockManager;
use extentio_metadata::{layout, ElementTable, NonPagedStore, PagedStore};
use extentio_storage::{DriveSet, DriveState};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{info, warn};

/// Configuration of one group.
#[derive(Clone, Copy, Debug)]
pub struct GroupSpec {
    pub id: ObjectId,
    pub raid_type: RaidType,
    pub width: u32,
    pub element_blocks: u64,
    pub member_user_blocks: u64,
}

/// Derived state of one member position.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemberState {
    /// In sync and servicing I/O
    Present,
    /// Drive gone, loss not yet being logged
    Degraded,
    /// Writes to this position are recorded as needs-rebuild marks
    RebuildLogging,
    /// Drive back, rebuild draining the needs-rebuild chunks
    Rebuilding,
}

/// One RAID group as seen from one SP.
pub struct RaidGroup {
    id: ObjectId,
    geometry: Geometry,
    sp: SpId,
    config: EngineConfig,
    drives: Arc<DriveSet>,
    element: Arc<ElementTable>,
    nonpaged: Arc<NonPagedStore>,
    paged: Arc<PagedStore>,
    locks: Arc<StripeLockManager>,
    journal: Arc<WriteLog>,
    cipher: Arc<RekeyCipher>,
    state_changed: Notify,
}

impl RaidGroup {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        spec: &GroupSpec,
        sp: SpId,
        config: EngineConfig,
        drives: Arc<DriveSet>,
        element: Arc<ElementTable>,
        nonpaged: Arc<NonPagedStore>,
        paged: Arc<PagedStore>,
        locks: Arc<StripeLockManager>,
        journal: Arc<WriteLog>,
        cipher: Arc<RekeyCipher>,
    ) -> Result<Arc<Self>> {
        let geometry = Geometry::new(
            spec.raid_type,
            spec.width,
            spec.element_blocks,
            spec.member_user_blocks,
        )?;
        if drives.width() != spec.width {
            return Err(Error::internal(format!(
                "drive set width {} does not match group width {}",
                drives.width(),
                spec.width
            )));
        }
        nonpaged.register(spec.id);
        paged.register(spec.id, geometry.chunk_count())?;
        Ok(Arc::new(Self {
            id: spec.id,
            geometry,
            sp,
            config,
            drives,
            element,
            nonpaged,
            paged,
            locks,
            journal,
            cipher,
            state_changed: Notify::new(),
        }))
    }

    #[must_use]
    pub fn id(&self) -> ObjectId {
        self.id
    }

    #[must_use]
    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    #[must_use]
    pub fn sp(&self) -> SpId {
        self.sp
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    #[must_use]
    pub fn drives(&self) -> &Arc<DriveSet> {
        &self.drives
    }

    #[must_use]
    pub fn paged(&self) -> &Arc<PagedStore> {
        &self.paged
    }

    #[must_use]
    pub fn nonpaged(&self) -> &Arc<NonPagedStore> {
        &self.nonpaged
    }

    #[must_use]
    pub fn locks(&self) -> &Arc<StripeLockManager> {
        &self.locks
    }

    #[must_use]
    pub fn journal(&self) -> &Arc<WriteLog> {
        &self.journal
    }

    #[must_use]
    pub fn cipher(&self) -> &Arc<RekeyCipher> {
        &self.cipher
    }

    pub fn lifecycle(&self) -> Result<LifecycleState> {
        self.element.lifecycle(self.id)
    }

    pub(crate) fn set_lifecycle(&self, state: LifecycleState) -> Result<()> {
        self.element.set_lifecycle(self.id, state)?;
        self.state_changed.notify_waiters();
        Ok(())
    }

    /// Suspend until the group reaches `target`, bounded by `budget`.
    pub async fn wait_lifecycle(&self, target: LifecycleState, budget: Duration) -> Result<()> {
        let deadline = tokio::time::Instant::now() + budget;
        loop {
            if self.lifecycle()? == target {
                return Ok(());
            }
            let notified = self.state_changed.notified();
            if self.lifecycle()? == target {
                return Ok(());
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(Error::Timeout(format!("waiting for {target:?}")));
            }
        }
    }

    /// Positions currently in rebuild logging.
    pub fn num_logging_positions(&self) -> Result<u32> {
        Ok(self.nonpaged.get(self.id)?.rb_logging_count())
    }

    /// Suspend until `expected` positions are rebuild logging, bounded
    /// by `budget`.
    pub async fn wait_for_rebuild_logging(&self, expected: u32, budget: Duration) -> Result<()> {
        let deadline = tokio::time::Instant::now() + budget;
        loop {
            if self.num_logging_positions()? == expected {
                return Ok(());
            }
            let notified = self.state_changed.notified();
            if self.num_logging_positions()? == expected {
                return Ok(());
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(Error::Timeout(format!(
                    "waiting for {expected} rebuild-logging positions"
                )));
            }
        }
    }

    /// Move a position's rebuild checkpoint. Checkpoints only move
    /// forward; a backward move is a policy violation and is refused,
    /// except reinitialization to zero when the position re-enters
    /// rebuild (the `INVALID_LBA` park is the maximum value, so leaving
    /// rebuild is always a forward move).
    pub async fn advance_rebuild_checkpoint(&self, position: Position, to: Lba) -> Result<()> {
        let current = self.nonpaged.get(self.id)?.rebuild_checkpoint(position);
        if to != 0 && to < current {
            warn!(
                group = %self.id,
                position, current, to, "backward checkpoint move refused"
            );
            return Err(Error::internal(format!(
                "rebuild checkpoint for position {position} may not move backward \
                 ({current} -> {to})"
            )));
        }
        self.nonpaged
            .set_checkpoint(self.id, layout::checkpoint_offset(position), to)
            .await
    }

    /// Derived state of one member position.
    pub fn member_state(&self, position: Position) -> Result<MemberState> {
        let record = self.nonpaged.get(self.id)?;
        if record.rb_logging(position) {
            return Ok(MemberState::RebuildLogging);
        }
        if self.drives.drive(position)?.state() == DriveState::Removed {
            return Ok(MemberState::Degraded);
        }
        if record.rebuild_checkpoint(position) != INVALID_LBA {
            return Ok(MemberState::Rebuilding);
        }
        Ok(MemberState::Present)
    }

    /// Whether writes to this position must be logged as needs-rebuild
    /// marks instead of device writes.
    pub(crate) fn write_unavailable(&self, position: Position) -> Result<bool> {
        let record = self.nonpaged.get(self.id)?;
        Ok(record.rb_logging(position)
            || self.drives.drive(position)?.state() == DriveState::Removed)
    }

    /// Whether reads from this position must go through reconstruction.
    /// Chunk-level staleness of a rebuilding member is checked separately.
    pub(crate) fn read_unavailable(&self, position: Position) -> Result<bool> {
        if self.write_unavailable(position)? {
            return Ok(true);
        }
        Ok(!self.drives.drive(position)?.reachable_from(self.sp))
    }

    /// Begin rebuild logging for a lost position. Mirrored to the peer,
    /// so both SPs mark subsequent writes in the same chunk records.
    pub async fn mark_position_degraded(&self, position: Position) -> Result<()> {
        let record = self.nonpaged.get(self.id)?;
        if record.rb_logging(position) {
            return Ok(());
        }
        warn!(group = %self.id, position, "member lost, entering rebuild logging");
        let bit = (1u16 << position).to_le_bytes();
        self.nonpaged
            .set_bits(self.id, layout::RB_LOGGING_BITMASK, &bit, 1, 0)
            .await?;
        self.evaluate_shutdown()?;
        self.state_changed.notify_waiters();
        Ok(())
    }

    /// Re-evaluate membership against the type's fault tolerance and
    /// fail the group when too many positions are lost. For RAID-10 the
    /// bound is per mirror pair, not global.
    ///
    /// Returns whether the current membership is viable. The verdict is
    /// independent of the recorded lifecycle: a `Failed` group whose
    /// members returned reports viable here, which is what lets
    /// [`member_returned`](Self::member_returned) bring it back up.
    pub fn evaluate_shutdown(&self) -> Result<bool> {
        let missing = self.drives.missing_positions();
        let beyond_tolerance = if self.geometry.raid_type == RaidType::Raid10 {
            (0..self.geometry.width / 2).any(|pair| {
                missing.contains(&(pair * 2)) && missing.contains(&(pair * 2 + 1))
            })
        } else {
            missing.len() as u32 > self.geometry.raid_type.fault_tolerance()
        };

        if beyond_tolerance {
            if self.lifecycle()? != LifecycleState::Failed {
                warn!(group = %self.id, ?missing, "beyond fault tolerance, group failed");
                self.set_lifecycle(LifecycleState::Failed)?;
            }
            return Ok(false);
        }
        Ok(true)
    }

    /// Bring the group up: recover the journal, start rebuild logging for
    /// any members already missing, then go Ready (or Failed).
    pub async fn activate(&self) -> Result<LifecycleState> {
        self.set_lifecycle(LifecycleState::Activate)?;

        // Fresh records carry zeroed checkpoints; a position with no
        // needs-rebuild backlog is not rebuilding.
        for position in 0..self.geometry.width {
            let record = self.nonpaged.get(self.id)?;
            if record.rebuild_checkpoint(position) == 0
                && self.paged.count_needs_rebuild(self.id, position, false)? == 0
            {
                self.nonpaged
                    .set_checkpoint(self.id, layout::checkpoint_offset(position), INVALID_LBA)
                    .await?;
            }
        }

        let flag = layout::FLAG_JOURNAL_RECOVERY.to_le_bytes();
        self.nonpaged
            .set_bits(self.id, layout::CLUSTERED_FLAGS, &flag, 1, 0)
            .await?;
        let summary = self.journal.verify_and_flush(&self.drives, &self.cipher)?;
        // A span whose staged copy was lost may be torn on disk; mark it
        // so reads reconstruct it instead of trusting it.
        for torn in &summary.torn {
            self.set_nr_bits(torn.position, torn.live_pba, u64::from(torn.block_count))
                .await?;
        }
        self.nonpaged
            .clear_bits(self.id, layout::CLUSTERED_FLAGS, &flag, 1, 0)
            .await?;

        if !self.evaluate_shutdown()? {
            return Ok(LifecycleState::Failed);
        }
        for position in self.drives.missing_positions() {
            self.mark_position_degraded(position).await?;
        }
        self.set_lifecycle(LifecycleState::Ready)?;
        info!(
            group = %self.id,
            replayed = summary.replayed,
            "group activated"
        );
        Ok(LifecycleState::Ready)
    }

    /// A pulled member came back: rebuild its journal region under the
    /// current key, stop logging against it and arm the rebuild
    /// checkpoint at zero. The rebuild engine drains the backlog.
    pub async fn member_returned(&self, position: Position) -> Result<()> {
        info!(group = %self.id, position, "member returned");
        // Slot headers staged on this member while it was still present
        // are only trustworthy before the region is re-initialized, so
        // recovery scans first.
        let summary = self.journal.verify_and_flush(&self.drives, &self.cipher)?;
        for torn in &summary.torn {
            self.set_nr_bits(torn.position, torn.live_pba, u64::from(torn.block_count))
                .await?;
        }
        self.journal
            .rebuild_region(&self.drives, position, &self.cipher)?;
        let bit = (1u16 << position).to_le_bytes();
        self.nonpaged
            .clear_bits(self.id, layout::RB_LOGGING_BITMASK, &bit, 1, 0)
            .await?;
        self.advance_rebuild_checkpoint(position, 0).await?;
        self.state_changed.notify_waiters();

        // A group that failed beyond tolerance may now be viable again.
        if self.lifecycle()? == LifecycleState::Failed && self.evaluate_shutdown()? {
            self.activate().await?;
        }
        Ok(())
    }

    /// Pause new I/O admission on both SPs.
    pub async fn quiesce(&self) -> Result<()> {
        let flag = layout::FLAG_QUIESCED.to_le_bytes();
        self.nonpaged
            .set_bits(self.id, layout::CLUSTERED_FLAGS, &flag, 1, 0)
            .await
    }

    /// Resume I/O admission.
    pub async fn unquiesce(&self) -> Result<()> {
        let flag = layout::FLAG_QUIESCED.to_le_bytes();
        self.nonpaged
            .clear_bits(self.id, layout::CLUSTERED_FLAGS, &flag, 1, 0)
            .await?;
        self.state_changed.notify_waiters();
        Ok(())
    }

    #[must_use]
    pub fn is_quiesced(&self) -> bool {
        self.nonpaged
            .get(self.id)
            .map(|r| r.has_flag(layout::FLAG_QUIESCED))
            .unwrap_or(false)
    }

    /// Gate every client I/O: the group must be Ready and not quiesced.
    /// Membership is re-evaluated here so a loss beyond tolerance fails
    /// the I/O before any member write lands.
    pub(crate) fn admit(&self) -> Result<()> {
        self.evaluate_shutdown()?;
        let state = self.lifecycle()?;
        if state != LifecycleState::Ready {
            return Err(Error::fatal(format!(
                "I/O failed: group {} is {state:?}",
                self.id
            )));
        }
        if self.is_quiesced() {
            return Err(Error::Quiesced);
        }
        Ok(())
    }

    /// Chunks still owing a rebuild for one position, as visible on this
    /// SP. `force_read` bypasses the shadow and reads the backing store.
    pub fn num_nr_chunks(&self, position: Position, force_read: bool) -> Result<u64> {
        self.paged.count_needs_rebuild(self.id, position, force_read)
    }
}

//! Foreground I/O path
//!
//! Reads and writes address the group's exported block space. Every
//! operation takes stripe locks over the rows it touches, so foreground
//! I/O, rebuild passes and journal recovery serialize on the same
//! ranges across both SPs.
//!
//! Member blocks are encrypted at rest under the key epoch governing
//! their address; parity is computed over plaintext and then encrypted
//! like any other element.
//!
//! Degraded rules:
//! - reads from an unavailable position reconstruct from the survivors
//! - writes to a rebuild-logging position become needs-rebuild marks
//! - full-stripe writes on parity types stage through the write journal
//!   so a crash can never leave a torn stripe

use crate::group::RaidGroup;
use crate::reconstruct;
use extentio_common::{
    Error, Lba, LockMode, Position, Qualifier, RaidType, RejectFlags, Result, BLOCK_SIZE,
    CHUNK_BLOCKS,
};
use extentio_journal::{MemberWrite, StripeIntent};
use extentio_metadata::{ChunkRecord, PAGED_RECORD_SIZE};
use extentio_storage::DriveState;
use tracing::{debug, warn};

impl RaidGroup {
    /// Read `blocks` blocks at group LBA `lba`.
    pub async fn read(&self, lba: Lba, blocks: u64, flags: RejectFlags) -> Result<Vec<u8>> {
        self.admit()?;
        self.check_span(lba, blocks)?;
        self.check_preferred_path(lba, blocks, flags)?;

        let geometry = *self.geometry();
        let first_row = geometry.row_of_lba(lba);
        let last_row = geometry.row_of_lba(lba + blocks - 1);
        let _guard = self
            .locks()
            .acquire_timeout(
                self.id(),
                first_row,
                last_row - first_row + 1,
                LockMode::Read,
                self.config().wait_budget(),
            )
            .await?;

        let mut out = Vec::with_capacity(blocks as usize * BLOCK_SIZE);
        let mut cursor = lba;
        let end = lba + blocks;
        while cursor < end {
            let map = geometry.map_lba(cursor)?;
            let span = (geometry.element_blocks - map.offset).min(end - cursor);
            out.extend_from_slice(&self.read_element_span(
                map.row,
                &map.positions,
                map.pba,
                map.offset,
                span,
            )?);
            cursor += span;
        }
        Ok(out)
    }

    /// Write block-aligned `data` at group LBA `lba`.
    pub async fn write(&self, lba: Lba, data: &[u8], flags: RejectFlags) -> Result<()> {
        self.admit()?;
        if data.is_empty() || data.len() % BLOCK_SIZE != 0 {
            return Err(Error::internal("write payload must be block-aligned"));
        }
        let blocks = (data.len() / BLOCK_SIZE) as u64;
        self.check_span(lba, blocks)?;
        self.check_preferred_path(lba, blocks, flags)?;

        let geometry = *self.geometry();
        if geometry.raid_type.is_parity()
            && flags.prefer_full_stripe
            && self.any_position_unavailable()?
            && !self.is_full_stripe(lba, blocks)
        {
            debug!(group = %self.id(), lba, blocks, "sub-stripe write rejected while degraded");
            return Err(Error::PolicyRejected(Qualifier::NotFullStripe));
        }

        let first_row = geometry.row_of_lba(lba);
        let last_row = geometry.row_of_lba(lba + blocks - 1);
        let _guard = self
            .locks()
            .acquire_timeout(
                self.id(),
                first_row,
                last_row - first_row + 1,
                LockMode::Write,
                self.config().wait_budget(),
            )
            .await?;

        for row in first_row..=last_row {
            self.write_row(row, lba, data).await?;
        }
        Ok(())
    }

    /// Write zeros over a block range.
    pub async fn zero(&self, lba: Lba, blocks: u64, flags: RejectFlags) -> Result<()> {
        let zeros = vec![0u8; blocks as usize * BLOCK_SIZE];
        self.write(lba, &zeros, flags).await
    }

    fn check_span(&self, lba: Lba, blocks: u64) -> Result<()> {
        if blocks == 0 || lba + blocks > self.geometry().exported_blocks() {
            return Err(Error::internal(format!(
                "I/O span [{lba},+{blocks}) outside exported capacity {}",
                self.geometry().exported_blocks()
            )));
        }
        Ok(())
    }

    /// `NotPreferred` rejection: the client asked to be redirected when
    /// this SP has lost its path to a member the I/O needs while the
    /// peer SP still has one.
    fn check_preferred_path(&self, lba: Lba, blocks: u64, flags: RejectFlags) -> Result<()> {
        if !flags.not_preferred {
            return Ok(());
        }
        let geometry = self.geometry();
        let mut cursor = lba;
        let end = lba + blocks;
        while cursor < end {
            let map = geometry.map_lba(cursor)?;
            for &position in &map.positions {
                let drive = self.drives().drive(position)?;
                if drive.state() == DriveState::Ready
                    && !drive.reachable_from(self.sp())
                    && drive.reachable_from(self.sp().peer())
                {
                    return Err(Error::PolicyRejected(Qualifier::NotPreferred));
                }
            }
            cursor += geometry.element_blocks - map.offset;
        }
        Ok(())
    }

    fn any_position_unavailable(&self) -> Result<bool> {
        for position in 0..self.geometry().width {
            if self.write_unavailable(position)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn is_full_stripe(&self, lba: Lba, blocks: u64) -> bool {
        let row_blocks = self.geometry().row_data_blocks();
        lba % row_blocks == 0 && blocks % row_blocks == 0
    }

    /// Whether a chunk still owes this position a rebuild, making direct
    /// reads of the position's blocks stale.
    fn nr_stale(&self, position: Position, pba: Lba) -> Result<bool> {
        let chunk = pba / CHUNK_BLOCKS;
        let records = self
            .paged()
            .get_bits(self.id(), chunk * PAGED_RECORD_SIZE as u64, 1, false)?;
        Ok(records[0].needs_rebuild_for(position))
    }

    fn element_unreadable(&self, position: Position, pba: Lba) -> Result<bool> {
        Ok(self.read_unavailable(position)? || self.nr_stale(position, pba)?)
    }

    /// Read and decrypt member blocks.
    pub(crate) fn read_member(&self, position: Position, pba: Lba, blocks: u64) -> Result<Vec<u8>> {
        let mut data = self.drives().drive(position)?.read_blocks(pba, blocks)?;
        let epoch = self.cipher().epoch_for_lba(pba);
        self.cipher().apply(epoch, pba, &mut data)?;
        Ok(data)
    }

    /// Encrypt and write member blocks.
    pub(crate) fn write_member(&self, position: Position, pba: Lba, plain: &[u8]) -> Result<()> {
        let mut data = plain.to_vec();
        let epoch = self.cipher().epoch_for_lba(pba);
        self.cipher().apply(epoch, pba, &mut data)?;
        self.drives().drive(position)?.write_blocks(pba, &data)
    }

    /// Record that a position missed a write over a pba range.
    pub(crate) async fn set_nr_bits(&self, position: Position, pba: Lba, blocks: u64) -> Result<()> {
        let first = pba / CHUNK_BLOCKS;
        let last = (pba + blocks - 1) / CHUNK_BLOCKS;
        self.paged()
            .set_bits(
                self.id(),
                first * PAGED_RECORD_SIZE as u64,
                ChunkRecord::nr_pattern(position),
                last - first + 1,
            )
            .await
    }

    fn read_element_span(
        &self,
        row: u64,
        positions: &[Position],
        pba: Lba,
        offset: u64,
        span: u64,
    ) -> Result<Vec<u8>> {
        // Mirrors: any in-sync side serves the read.
        for &position in positions {
            if self.element_unreadable(position, pba)? {
                continue;
            }
            match self.read_member(position, pba + offset, span) {
                Ok(data) => return Ok(data),
                Err(Error::Media { position, lba }) => {
                    warn!(group = %self.id(), position, lba, "media error, reconstructing");
                }
                Err(e) => return Err(e),
            }
        }
        let element = self.reconstruct_element(row, positions[0])?;
        let from = offset as usize * BLOCK_SIZE;
        let to = from + span as usize * BLOCK_SIZE;
        Ok(element[from..to].to_vec())
    }

    /// Rebuild one position's element of a row from the survivors.
    pub(crate) fn reconstruct_element(&self, row: u64, target: Position) -> Result<Vec<u8>> {
        let geometry = self.geometry();
        let layout = geometry.row_layout(row);
        let pba = layout.pba;
        let blocks = geometry.element_blocks;

        match geometry.raid_type {
            RaidType::Raid0 => Err(Error::fatal(format!(
                "position {target} unrecoverable on RAID-0"
            ))),
            RaidType::Raid1 | RaidType::Raid10 => {
                let partner = target ^ 1;
                if self.read_unavailable(partner)? || self.nr_stale(partner, pba)? {
                    return Err(Error::fatal(format!(
                        "mirror pair {}/{} has no in-sync side",
                        target.min(partner),
                        target.max(partner)
                    )));
                }
                self.read_member(partner, pba, blocks)
            }
            RaidType::Raid3 | RaidType::Raid5 => {
                let mut survivors = Vec::with_capacity(geometry.width as usize - 1);
                for position in 0..geometry.width {
                    if position == target {
                        continue;
                    }
                    if self.read_unavailable(position)? || self.nr_stale(position, pba)? {
                        return Err(Error::fatal(format!(
                            "row {row}: positions {target} and {position} both unavailable"
                        )));
                    }
                    survivors.push(self.read_member(position, pba, blocks)?);
                }
                let refs: Vec<&[u8]> = survivors.iter().map(Vec::as_slice).collect();
                reconstruct::xor_parity(&refs)
            }
            RaidType::Raid6 => self.reconstruct_raid6(row, target),
        }
    }

    fn reconstruct_raid6(&self, row: u64, target: Position) -> Result<Vec<u8>> {
        let geometry = self.geometry();
        let layout = geometry.row_layout(row);
        let pba = layout.pba;
        let blocks = geometry.element_blocks;
        let shard_size = blocks as usize * BLOCK_SIZE;
        let data_count = layout.data.len();

        let mut originals: Vec<(usize, Vec<u8>)> = Vec::new();
        let mut missing_data: Vec<usize> = Vec::new();
        for (index, &position) in layout.data.iter().enumerate() {
            if position == target
                || self.read_unavailable(position)?
                || self.nr_stale(position, pba)?
            {
                missing_data.push(index);
            } else {
                originals.push((index, self.read_member(position, pba, blocks)?));
            }
        }
        let mut recovery: Vec<(usize, Vec<u8>)> = Vec::new();
        for (index, &position) in layout.parity.iter().enumerate() {
            if position != target
                && !self.read_unavailable(position)?
                && !self.nr_stale(position, pba)?
            {
                recovery.push((index, self.read_member(position, pba, blocks)?));
            }
        }

        let restored = if missing_data.is_empty() {
            Vec::new()
        } else {
            let original_refs: Vec<(usize, &[u8])> =
                originals.iter().map(|(i, d)| (*i, d.as_slice())).collect();
            let recovery_refs: Vec<(usize, &[u8])> =
                recovery.iter().map(|(i, d)| (*i, d.as_slice())).collect();
            reconstruct::rs_recover(
                data_count,
                shard_size,
                &original_refs,
                &recovery_refs,
                &missing_data,
            )?
        };

        if let Some(slot) = layout.data.iter().position(|&p| p == target) {
            let index = missing_data
                .iter()
                .position(|&m| m == slot)
                .ok_or_else(|| Error::internal("target data index not in missing set"))?;
            return Ok(restored[index].clone());
        }

        // Target is a parity position: rebuild the full data row, then
        // re-encode P and Q.
        let mut full: Vec<Vec<u8>> = vec![Vec::new(); data_count];
        for (index, data) in originals {
            full[index] = data;
        }
        for (missing_index, data) in missing_data.iter().zip(restored) {
            full[*missing_index] = data;
        }
        let refs: Vec<&[u8]> = full.iter().map(Vec::as_slice).collect();
        let parity = reconstruct::rs_parity(&refs)?;
        let parity_index = layout
            .parity
            .iter()
            .position(|&p| p == target)
            .ok_or_else(|| Error::internal("target neither data nor parity"))?;
        Ok(parity[parity_index].clone())
    }

    /// Apply the part of a write falling into one stripe row.
    async fn write_row(&self, row: u64, lba: Lba, data: &[u8]) -> Result<()> {
        let geometry = *self.geometry();
        let layout = geometry.row_layout(row);
        let element_bytes = geometry.element_blocks as usize * BLOCK_SIZE;
        let row_start = row * geometry.row_data_blocks();
        let write_end = lba + (data.len() / BLOCK_SIZE) as u64;

        // Assemble the row's data elements in plaintext, tracking which
        // ones the write touches.
        let mut elements: Vec<Vec<u8>> = Vec::with_capacity(layout.data.len());
        let mut changed: Vec<bool> = Vec::with_capacity(layout.data.len());
        let mut full_row = true;
        for data_index in 0..layout.data.len() {
            let element_lba = row_start + data_index as u64 * geometry.element_blocks;
            let element_end = element_lba + geometry.element_blocks;
            let overlap_start = element_lba.max(lba);
            let overlap_end = element_end.min(write_end);

            if overlap_start >= overlap_end {
                // Untouched element; needed only to recompute parity.
                full_row = false;
                changed.push(false);
                if geometry.raid_type.is_parity() {
                    elements.push(self.read_row_element(row, layout.data[data_index])?);
                } else {
                    elements.push(Vec::new());
                }
                continue;
            }

            let fully_covered = overlap_start == element_lba && overlap_end == element_end;
            let mut element = if fully_covered {
                vec![0u8; element_bytes]
            } else {
                full_row = false;
                self.read_row_element(row, layout.data[data_index])?
            };
            let dst = (overlap_start - element_lba) as usize * BLOCK_SIZE;
            let src = (overlap_start - lba) as usize * BLOCK_SIZE;
            let len = (overlap_end - overlap_start) as usize * BLOCK_SIZE;
            element[dst..dst + len].copy_from_slice(&data[src..src + len]);
            changed.push(true);
            elements.push(element);
        }

        // Member writes for this row: changed data elements (mirrored
        // for mirror types) plus freshly computed parity.
        let mut writes: Vec<MemberWrite> = Vec::new();
        for (data_index, &position) in layout.data.iter().enumerate() {
            if !changed[data_index] {
                continue;
            }
            writes.push(MemberWrite {
                position,
                pba: layout.pba,
                data: elements[data_index].clone(),
            });
            if geometry.raid_type.is_mirror() {
                writes.push(MemberWrite {
                    position: position ^ 1,
                    pba: layout.pba,
                    data: elements[data_index].clone(),
                });
            }
        }
        if geometry.raid_type.is_parity() {
            let refs: Vec<&[u8]> = elements.iter().map(Vec::as_slice).collect();
            let parity = match geometry.raid_type {
                RaidType::Raid6 => reconstruct::rs_parity(&refs)?,
                _ => vec![reconstruct::xor_parity(&refs)?],
            };
            for (parity_index, &position) in layout.parity.iter().enumerate() {
                writes.push(MemberWrite {
                    position,
                    pba: layout.pba,
                    data: parity[parity_index].clone(),
                });
            }
        }

        // Full-stripe writes on parity types stage through the journal
        // so the whole row lands atomically across a crash.
        let journaled = geometry.raid_type.is_parity() && full_row;
        let slot = if journaled {
            let slot = self
                .journal()
                .reserve_slot_wait(self.config().wait_budget())
                .await?;
            let intent_writes: Vec<MemberWrite> = {
                let mut kept = Vec::with_capacity(writes.len());
                for w in &writes {
                    if !self.write_unavailable(w.position)? {
                        kept.push(w.clone());
                    }
                }
                kept
            };
            self.journal().write_intent(
                self.drives(),
                slot,
                &StripeIntent {
                    stripe_start_lba: row_start,
                    writes: intent_writes,
                },
                self.cipher(),
            )?;
            Some(slot)
        } else {
            None
        };

        for write in &writes {
            self.apply_member_write(write).await?;
        }

        if let Some(slot) = slot {
            self.journal().commit(self.drives(), slot)?;
        }
        Ok(())
    }

    /// Current plaintext of one data element, reconstructing when the
    /// position cannot serve it.
    fn read_row_element(&self, row: u64, position: Position) -> Result<Vec<u8>> {
        let geometry = self.geometry();
        let pba = row * geometry.element_blocks;
        if self.element_unreadable(position, pba)? {
            return self.reconstruct_element(row, position);
        }
        match self.read_member(position, pba, geometry.element_blocks) {
            Ok(data) => Ok(data),
            Err(Error::Media { .. }) => self.reconstruct_element(row, position),
            Err(e) => Err(e),
        }
    }

    /// Land one member write, downgrading to a needs-rebuild mark when
    /// the position cannot take it.
    async fn apply_member_write(&self, write: &MemberWrite) -> Result<()> {
        let blocks = (write.data.len() / BLOCK_SIZE) as u64;
        if self.write_unavailable(write.position)? {
            return self.log_missed_write(write.position, write.pba, blocks).await;
        }
        match self.write_member(write.position, write.pba, &write.data) {
            Ok(()) => Ok(()),
            Err(Error::DriveRemoved(position)) => {
                self.log_missed_write(position, write.pba, blocks).await
            }
            Err(e) => Err(e),
        }
    }

    /// A member missed a write: make sure it is rebuild logging, fail
    /// the group if the loss pushed it beyond tolerance, otherwise
    /// record the miss as needs-rebuild marks.
    async fn log_missed_write(&self, position: Position, pba: Lba, blocks: u64) -> Result<()> {
        self.mark_position_degraded(position).await?;
        // Record the miss even when the loss pushed the group beyond
        // tolerance: the stale blocks must never be trusted again.
        self.set_nr_bits(position, pba, blocks).await?;
        if self.lifecycle()? == extentio_common::LifecycleState::Failed {
            return Err(Error::fatal(format!(
                "group {} failed during write",
                self.id()
            )));
        }
        Ok(())
    }
}

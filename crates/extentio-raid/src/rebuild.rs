//! Background rebuild and rekey passes
//!
//! The rebuild engine walks a returned member's user region chunk by
//! chunk, reconstructing only the chunks whose needs-rebuild bit is set
//! and advancing the per-position checkpoint through a compare-and-swap
//! so a racing reinitialization can never move it backwards. Each chunk
//! is rebuilt under the same stripe locks the foreground path takes, so
//! client writes and reconstruction never interleave on a row.
//!
//! The rekey pass reuses the same walk: re-encrypt a span under the new
//! key, then advance the rekey checkpoint past it.

use crate::group::RaidGroup;
use extentio_common::{
    Error, Lba, LockMode, Position, Result, CHUNK_BLOCKS, INVALID_LBA,
};
use extentio_metadata::{layout, ChunkRecord, PAGED_RECORD_SIZE};
use tracing::{debug, info, warn};

/// Counters from one rebuild run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RebuildStats {
    pub chunks_rebuilt: u64,
    pub retries: u64,
}

impl RaidGroup {
    /// Drain the needs-rebuild backlog for a returned member.
    ///
    /// Resumes from the persisted checkpoint, so an interrupted rebuild
    /// continues where it left off instead of starting over.
    pub async fn run_rebuild(&self, position: Position) -> Result<RebuildStats> {
        let geometry = *self.geometry();
        let mut stats = RebuildStats::default();

        let mut checkpoint = self.nonpaged().get(self.id())?.rebuild_checkpoint(position);
        if checkpoint == INVALID_LBA {
            self.advance_rebuild_checkpoint(position, 0).await?;
            checkpoint = 0;
        }
        info!(group = %self.id(), position, checkpoint, "rebuild starting");

        let per_pass = self.config().rebuild.chunks_per_pass.max(1);
        while checkpoint < geometry.member_user_blocks {
            let first_chunk = checkpoint / CHUNK_BLOCKS;
            let last_chunk = (first_chunk + per_pass).min(geometry.chunk_count());
            let pass_end = (last_chunk * CHUNK_BLOCKS).min(geometry.member_user_blocks);

            for chunk in first_chunk..last_chunk {
                let chunk_start = chunk * CHUNK_BLOCKS;
                let chunk_end = (chunk_start + CHUNK_BLOCKS).min(geometry.member_user_blocks);
                let record = self
                    .paged()
                    .get_bits(self.id(), chunk * PAGED_RECORD_SIZE as u64, 1, false)?[0];
                if record.needs_rebuild_for(position) {
                    self.rebuild_one_chunk(position, chunk_start, chunk_end, &mut stats)
                        .await?;
                    self.paged()
                        .clear_bits(
                            self.id(),
                            chunk * PAGED_RECORD_SIZE as u64,
                            ChunkRecord::nr_pattern(position),
                            1,
                        )
                        .await?;
                    stats.chunks_rebuilt += 1;
                }
            }

            let advanced = self
                .nonpaged()
                .increment_checkpoint(
                    self.id(),
                    layout::checkpoint_offset(position),
                    checkpoint,
                    pass_end - checkpoint,
                )
                .await?;
            if advanced {
                checkpoint = pass_end;
            } else {
                // Lost the CAS: someone reinitialized the checkpoint.
                // Reload and continue forward only.
                let current = self.nonpaged().get(self.id())?.rebuild_checkpoint(position);
                if current == INVALID_LBA {
                    debug!(group = %self.id(), position, "checkpoint cleared, rebuild yields");
                    return Ok(stats);
                }
                checkpoint = checkpoint.max(current);
            }
        }

        if self.num_nr_chunks(position, false)? == 0 {
            self.advance_rebuild_checkpoint(position, INVALID_LBA).await?;
            info!(
                group = %self.id(),
                position,
                chunks = stats.chunks_rebuilt,
                "rebuild complete"
            );
        }
        Ok(stats)
    }

    /// Rebuild the elements of one chunk under a stripe lock, retrying
    /// transient media errors up to the configured bound.
    async fn rebuild_one_chunk(
        &self,
        position: Position,
        chunk_start: Lba,
        chunk_end: Lba,
        stats: &mut RebuildStats,
    ) -> Result<()> {
        let geometry = self.geometry();
        let first_row = chunk_start / geometry.element_blocks;
        let rows = (chunk_end - chunk_start).div_ceil(geometry.element_blocks);
        let guard = self
            .locks()
            .acquire_timeout(
                self.id(),
                first_row,
                rows,
                LockMode::Write,
                self.config().wait_budget(),
            )
            .await?;

        let mut attempt = 0;
        let result = loop {
            match self.rebuild_chunk_elements(position, chunk_start, chunk_end) {
                Ok(()) => break Ok(()),
                Err(Error::Media { position: p, lba })
                    if attempt < self.config().rebuild.max_chunk_retries =>
                {
                    attempt += 1;
                    stats.retries += 1;
                    warn!(
                        group = %self.id(),
                        position = p,
                        lba,
                        attempt,
                        "media error during rebuild, retrying chunk"
                    );
                }
                Err(Error::Media { position: p, lba }) => {
                    break Err(Error::fatal(format!(
                        "rebuild of chunk at {chunk_start} failed: persistent media error \
                         at position {p} lba {lba}"
                    )))
                }
                Err(e) => break Err(e),
            }
        };
        guard.release().await;
        result
    }

    fn rebuild_chunk_elements(
        &self,
        position: Position,
        chunk_start: Lba,
        chunk_end: Lba,
    ) -> Result<()> {
        let geometry = self.geometry();
        let mut pba = chunk_start;
        while pba < chunk_end {
            let row = pba / geometry.element_blocks;
            let element = self.reconstruct_element(row, position)?;
            self.write_member(position, pba, &element)?;
            pba += geometry.element_blocks;
        }
        Ok(())
    }

    /// Re-encrypt the whole group under `new_key`, advancing the rekey
    /// checkpoint span by span. Writes staged in the journal before a
    /// span flipped keep their captured epoch, so recovery stays correct
    /// mid-pass.
    pub async fn rekey(&self, new_key: [u8; 32]) -> Result<()> {
        let geometry = *self.geometry();
        self.cipher().start_rekey(new_key)?;
        self.nonpaged()
            .set_checkpoint(self.id(), layout::REKEY_CHECKPOINT, 0)
            .await?;
        info!(group = %self.id(), epoch = self.cipher().current_epoch(), "rekey pass starting");

        let mut pba = 0;
        while pba < geometry.member_user_blocks {
            let end = (pba + CHUNK_BLOCKS).min(geometry.member_user_blocks);
            let first_row = pba / geometry.element_blocks;
            let rows = (end - pba).div_ceil(geometry.element_blocks);
            let guard = self
                .locks()
                .acquire_timeout(
                    self.id(),
                    first_row,
                    rows,
                    LockMode::Write,
                    self.config().wait_budget(),
                )
                .await?;

            // Decrypt under the old epoch before the checkpoint moves.
            let mut spans: Vec<(Position, Vec<u8>)> = Vec::new();
            for position in 0..geometry.width {
                if self.write_unavailable(position)? {
                    // Stale anyway; rebuild rewrites it under the new key.
                    continue;
                }
                spans.push((position, self.read_member(position, pba, end - pba)?));
            }

            self.cipher().advance_checkpoint(end);
            self.nonpaged()
                .set_checkpoint(self.id(), layout::REKEY_CHECKPOINT, end)
                .await?;

            for (position, plain) in spans {
                self.write_member(position, pba, &plain)?;
            }
            guard.release().await;
            pba = end;
        }

        self.cipher().finish_rekey();
        self.nonpaged()
            .set_checkpoint(self.id(), layout::REKEY_CHECKPOINT, INVALID_LBA)
            .await?;
        info!(group = %self.id(), "rekey pass complete");
        Ok(())
    }
}

//! Rekey epoch key management
//!
//! Data at rest is encrypted with AES-256-CTR, one keystream per block
//! with the IV derived from the block's physical address. A rekey walks
//! the group front to back re-encrypting under a new key; the rekey
//! checkpoint records how far it has advanced. Which key governs a given
//! block is therefore a function of its address and the checkpoint:
//! below the checkpoint the new key applies, at or above it the old one
//! still does.
//!
//! Epochs are never reused. Journal slot headers capture the epoch that
//! was in force when the slot was staged, so recovery can always decrypt
//! staged data correctly even if the checkpoint moved in between.

use aes::cipher::{KeyIvInit, StreamCipher};
use extentio_common::{Error, Lba, Result, BLOCK_SIZE, INVALID_LBA};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::info;

type Aes256Ctr = ctr::Ctr128BE<aes::Aes256>;

/// Key material and rekey progress for one RAID group.
pub struct RekeyCipher {
    /// Keys indexed by epoch; the last entry is the current epoch.
    keys: RwLock<Vec<[u8; 32]>>,
    /// First member LBA not yet re-encrypted under the current epoch.
    /// `INVALID_LBA` means no rekey is in progress.
    checkpoint: AtomicU64,
}

impl RekeyCipher {
    /// Start with a single key at epoch 0 and no rekey in progress.
    #[must_use]
    pub fn new(initial_key: [u8; 32]) -> Self {
        Self {
            keys: RwLock::new(vec![initial_key]),
            checkpoint: AtomicU64::new(INVALID_LBA),
        }
    }

    /// Current (newest) epoch.
    #[must_use]
    pub fn current_epoch(&self) -> u64 {
        self.keys.read().len() as u64 - 1
    }

    /// Whether a rekey pass is in flight.
    #[must_use]
    pub fn rekey_in_progress(&self) -> bool {
        self.checkpoint.load(Ordering::SeqCst) != INVALID_LBA
    }

    /// Rekey checkpoint, or `INVALID_LBA` when idle.
    #[must_use]
    pub fn checkpoint(&self) -> Lba {
        self.checkpoint.load(Ordering::SeqCst)
    }

    /// Begin a rekey to `new_key`. Returns the new epoch.
    pub fn start_rekey(&self, new_key: [u8; 32]) -> Result<u64> {
        if self.rekey_in_progress() {
            return Err(Error::internal("rekey already in progress"));
        }
        let mut keys = self.keys.write();
        keys.push(new_key);
        let epoch = keys.len() as u64 - 1;
        drop(keys);
        self.checkpoint.store(0, Ordering::SeqCst);
        info!(epoch, "rekey started");
        Ok(epoch)
    }

    /// Advance the rekey checkpoint. Regions below `lba` have been
    /// re-encrypted under the current epoch.
    pub fn advance_checkpoint(&self, lba: Lba) {
        self.checkpoint.store(lba, Ordering::SeqCst);
    }

    /// Conclude the rekey pass; all addresses now use the current epoch.
    pub fn finish_rekey(&self) {
        info!(epoch = self.current_epoch(), "rekey finished");
        self.checkpoint.store(INVALID_LBA, Ordering::SeqCst);
    }

    /// Epoch governing the data at `lba` right now.
    #[must_use]
    pub fn epoch_for_lba(&self, lba: Lba) -> u64 {
        let current = self.current_epoch();
        let checkpoint = self.checkpoint.load(Ordering::SeqCst);
        if checkpoint == INVALID_LBA || lba < checkpoint {
            current
        } else {
            current - 1
        }
    }

    /// Encrypt or decrypt `data` in place under `epoch`, one keystream
    /// per 512-byte block keyed on `pba` so any block-aligned sub-span
    /// transforms independently. CTR mode is its own inverse.
    pub fn apply(&self, epoch: u64, pba: Lba, data: &mut [u8]) -> Result<()> {
        debug_assert_eq!(data.len() % BLOCK_SIZE, 0);
        let keys = self.keys.read();
        let key = keys
            .get(epoch as usize)
            .ok_or_else(|| Error::internal(format!("no key for epoch {epoch}")))?;
        for (i, block) in data.chunks_mut(BLOCK_SIZE).enumerate() {
            let mut iv = [0u8; 16];
            iv[..8].copy_from_slice(&(pba + i as u64).to_le_bytes());
            let mut cipher = Aes256Ctr::new(key.into(), (&iv).into());
            cipher.apply_keystream(block);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(fill: u8) -> [u8; 32] {
        [fill; 32]
    }

    #[test]
    fn test_apply_is_involution() {
        let cipher = RekeyCipher::new(key(1));
        let plain = vec![0xABu8; 2 * BLOCK_SIZE];
        let mut buf = plain.clone();
        cipher.apply(0, 100, &mut buf).unwrap();
        assert_ne!(buf, plain);
        cipher.apply(0, 100, &mut buf).unwrap();
        assert_eq!(buf, plain);
    }

    #[test]
    fn test_wrong_epoch_does_not_decrypt() {
        let cipher = RekeyCipher::new(key(1));
        cipher.start_rekey(key(2)).unwrap();
        let plain = vec![0x55u8; BLOCK_SIZE];
        let mut buf = plain.clone();
        cipher.apply(0, 7, &mut buf).unwrap();
        cipher.apply(1, 7, &mut buf).unwrap();
        assert_ne!(buf, plain);
    }

    #[test]
    fn test_epoch_selection_follows_checkpoint() {
        let cipher = RekeyCipher::new(key(1));
        assert_eq!(cipher.epoch_for_lba(500), 0);

        cipher.start_rekey(key(2)).unwrap();
        cipher.advance_checkpoint(1000);
        assert_eq!(cipher.epoch_for_lba(500), 1);
        assert_eq!(cipher.epoch_for_lba(1000), 0);

        cipher.finish_rekey();
        assert_eq!(cipher.epoch_for_lba(1000), 1);
    }

    #[test]
    fn test_double_start_rejected() {
        let cipher = RekeyCipher::new(key(1));
        cipher.start_rekey(key(2)).unwrap();
        assert!(cipher.start_rekey(key(3)).is_err());
    }
}

//! Checksum utilities for ExtentIO
//!
//! Per-block CRC32C checksums used by the journal slot headers and the
//! paged metadata store for inline integrity verification.

use serde::{Deserialize, Serialize};

/// CRC32C checksum over one block of data
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockChecksum(pub u32);

impl BlockChecksum {
    /// Compute the checksum of a block
    #[must_use]
    pub fn compute(data: &[u8]) -> Self {
        Self(crc32c::crc32c(data))
    }

    /// Verify data against this checksum
    #[must_use]
    pub fn verify(&self, data: &[u8]) -> bool {
        crc32c::crc32c(data) == self.0
    }

    /// Fold a set of per-block checksums into one checksum-of-checksums.
    ///
    /// Used by journal slot headers to validate all staged data blocks
    /// with a single header field.
    #[must_use]
    pub fn fold(checksums: &[BlockChecksum]) -> Self {
        let mut buf = Vec::with_capacity(checksums.len() * 4);
        for c in checksums {
            buf.extend_from_slice(&c.0.to_le_bytes());
        }
        Self::compute(&buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compute_verify() {
        let data = vec![0xA5u8; 512];
        let sum = BlockChecksum::compute(&data);
        assert!(sum.verify(&data));

        let mut corrupted = data.clone();
        corrupted[17] ^= 0xFF;
        assert!(!sum.verify(&corrupted));
    }

    #[test]
    fn test_fold_order_sensitive() {
        let a = BlockChecksum::compute(b"aaaa");
        let b = BlockChecksum::compute(b"bbbb");
        assert_ne!(BlockChecksum::fold(&[a, b]), BlockChecksum::fold(&[b, a]));
    }
}

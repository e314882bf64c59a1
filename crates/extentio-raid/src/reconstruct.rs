//! Element reconstruction
//!
//! Single-parity types (RAID-3/5) recover a missing element by XOR over
//! the surviving elements of the row. RAID-6 uses Reed-Solomon with the
//! data elements as original shards and P/Q as recovery shards, so any
//! two missing members of a row are recoverable. Mirrors copy.
//!
//! All functions operate on plaintext element payloads; at-rest
//! encryption is applied per member block above this layer.

use extentio_common::{Error, Result};
use reed_solomon_simd::{ReedSolomonDecoder, ReedSolomonEncoder};

/// XOR parity over equal-length shards (also recovers any single
/// missing shard when called over the survivors).
pub fn xor_parity(shards: &[&[u8]]) -> Result<Vec<u8>> {
    let first = shards
        .first()
        .ok_or_else(|| Error::internal("xor over zero shards"))?;
    let mut out = first.to_vec();
    for shard in &shards[1..] {
        if shard.len() != out.len() {
            return Err(Error::internal("xor shard length mismatch"));
        }
        for (o, s) in out.iter_mut().zip(shard.iter()) {
            *o ^= s;
        }
    }
    Ok(out)
}

/// Compute RAID-6 P and Q recovery shards over the data elements.
pub fn rs_parity(data: &[&[u8]]) -> Result<Vec<Vec<u8>>> {
    let shard_size = data
        .first()
        .map(|d| d.len())
        .ok_or_else(|| Error::internal("rs_parity over zero shards"))?;
    let mut encoder = ReedSolomonEncoder::new(data.len(), 2, shard_size)
        .map_err(|e| Error::internal(format!("rs encoder: {e}")))?;
    for shard in data {
        encoder
            .add_original_shard(shard)
            .map_err(|e| Error::internal(format!("rs encode: {e}")))?;
    }
    let result = encoder
        .encode()
        .map_err(|e| Error::internal(format!("rs encode: {e}")))?;
    Ok(result.recovery_iter().map(<[u8]>::to_vec).collect())
}

/// Recover missing data shards of a RAID-6 row.
///
/// `originals` are the surviving data elements by data index,
/// `recovery` the surviving P/Q shards by recovery index (P=0, Q=1).
/// Returns the restored data elements in `missing` order.
pub fn rs_recover(
    data_count: usize,
    shard_size: usize,
    originals: &[(usize, &[u8])],
    recovery: &[(usize, &[u8])],
    missing: &[usize],
) -> Result<Vec<Vec<u8>>> {
    if originals.len() + recovery.len() < data_count {
        return Err(Error::internal(format!(
            "unrecoverable row: {} shards available, {data_count} needed",
            originals.len() + recovery.len()
        )));
    }
    let mut decoder = ReedSolomonDecoder::new(data_count, 2, shard_size)
        .map_err(|e| Error::internal(format!("rs decoder: {e}")))?;
    for (index, shard) in originals {
        decoder
            .add_original_shard(*index, shard)
            .map_err(|e| Error::internal(format!("rs decode: {e}")))?;
    }
    for (index, shard) in recovery {
        decoder
            .add_recovery_shard(*index, shard)
            .map_err(|e| Error::internal(format!("rs decode: {e}")))?;
    }
    let result = decoder
        .decode()
        .map_err(|e| Error::internal(format!("rs decode: {e}")))?;
    missing
        .iter()
        .map(|&index| {
            result
                .restored_original(index)
                .map(<[u8]>::to_vec)
                .ok_or_else(|| Error::internal(format!("data shard {index} not restored")))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shard(fill: u8, len: usize) -> Vec<u8> {
        (0..len).map(|i| fill ^ (i as u8)).collect()
    }

    #[test]
    fn test_xor_recovers_any_single_shard() {
        let shards = [shard(1, 64), shard(2, 64), shard(3, 64)];
        let refs: Vec<&[u8]> = shards.iter().map(Vec::as_slice).collect();
        let parity = xor_parity(&refs).unwrap();

        for missing in 0..shards.len() {
            let mut survivors: Vec<&[u8]> = Vec::new();
            for (i, s) in shards.iter().enumerate() {
                if i != missing {
                    survivors.push(s);
                }
            }
            survivors.push(&parity);
            assert_eq!(xor_parity(&survivors).unwrap(), shards[missing]);
        }
    }

    #[test]
    fn test_rs_recovers_two_missing_data_shards() {
        let data = [shard(0x10, 128), shard(0x20, 128), shard(0x30, 128), shard(0x40, 128)];
        let refs: Vec<&[u8]> = data.iter().map(Vec::as_slice).collect();
        let parity = rs_parity(&refs).unwrap();
        assert_eq!(parity.len(), 2);

        // Lose data shards 1 and 3; P and Q survive.
        let originals: Vec<(usize, &[u8])> = vec![(0, &data[0]), (2, &data[2])];
        let recovery: Vec<(usize, &[u8])> = vec![(0, &parity[0]), (1, &parity[1])];
        let restored = rs_recover(4, 128, &originals, &recovery, &[1, 3]).unwrap();
        assert_eq!(restored[0], data[1]);
        assert_eq!(restored[1], data[3]);
    }

    #[test]
    fn test_rs_recovers_data_with_one_parity_lost() {
        let data = [shard(5, 64), shard(6, 64)];
        let refs: Vec<&[u8]> = data.iter().map(Vec::as_slice).collect();
        let parity = rs_parity(&refs).unwrap();

        // Lose data shard 0 and P; Q plus data shard 1 suffice.
        let originals: Vec<(usize, &[u8])> = vec![(1, &data[1])];
        let recovery: Vec<(usize, &[u8])> = vec![(1, &parity[1])];
        let restored = rs_recover(2, 64, &originals, &recovery, &[0]).unwrap();
        assert_eq!(restored[0], data[0]);
    }

    #[test]
    fn test_rs_recovers_random_payloads() {
        use rand::{rngs::StdRng, Rng, SeedableRng};
        let mut rng = StdRng::seed_from_u64(0x0badcafe);
        let data: Vec<Vec<u8>> = (0..4)
            .map(|_| (0..256).map(|_| rng.gen()).collect())
            .collect();
        let refs: Vec<&[u8]> = data.iter().map(Vec::as_slice).collect();
        let parity = rs_parity(&refs).unwrap();

        let originals: Vec<(usize, &[u8])> = vec![(1, &data[1]), (2, &data[2])];
        let recovery: Vec<(usize, &[u8])> = vec![(0, &parity[0]), (1, &parity[1])];
        let restored = rs_recover(4, 256, &originals, &recovery, &[0, 3]).unwrap();
        assert_eq!(restored[0], data[0]);
        assert_eq!(restored[1], data[3]);
    }

    #[test]
    fn test_rs_too_many_missing() {
        let data = [shard(5, 64), shard(6, 64), shard(7, 64)];
        let originals: Vec<(usize, &[u8])> = vec![(2, &data[2])];
        let err = rs_recover(3, 64, &originals, &[], &[0, 1]).unwrap_err();
        assert!(matches!(err, Error::Internal(_)));
    }

    #[test]
    fn test_xor_length_mismatch() {
        let a = shard(1, 64);
        let b = shard(2, 32);
        assert!(xor_parity(&[&a, &b]).is_err());
    }
}

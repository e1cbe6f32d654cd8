//! Preimage table for common-prefix-length targeting.
//!
//! Harvesting a remote's routing table bucket by bucket requires, for each
//! common prefix length `cpl`, a FIND_NODE key whose SHA-256 hash shares
//! exactly `cpl` leading bits with the remote's keyspace position. Hashes
//! cannot be inverted on demand, so the keys are precomputed offline: for
//! every possible `depth`-bit hash prefix the table holds one preimage
//! whose hash starts with that prefix.
//!
//! Lookup is then O(1): take the first `cpl` bits of the target's hash,
//! flip bit `cpl`, keep the target's remaining bits up to `depth`, and
//! index. The looked-up preimage agrees with the target on bits
//! `0..cpl` and differs at bit `cpl`, i.e. shares exactly `cpl` bits.
//!
//! The production table is produced by a separate batch job and consumed
//! here as a (optionally gzip-compressed) CSV of `bucket,hex_preimage`
//! rows covering `0..2^depth` contiguously. [`PreimageTable::generate`]
//! brute-forces small-depth tables for tests and tooling.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;

use anyhow::{bail, Context, Result};
use flate2::read::GzDecoder;
use sha2::{Digest, Sha256};
use tracing::info;

use crate::error::CrawlError;
use crate::peer::{KadKey, PeerId};

pub struct PreimageTable {
    depth: u8,
    entries: HashMap<u32, Vec<u8>>,
}

impl PreimageTable {
    /// Load a table from a CSV file of `bucket,hex_preimage` rows. A `.gz`
    /// suffix selects gzip decompression. The row count must be a power of
    /// two and cover every bucket exactly once; depth is inferred from it.
    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path)
            .with_context(|| format!("opening preimage file {}", path.display()))?;
        let reader: Box<dyn Read> = if path.extension().is_some_and(|e| e == "gz") {
            Box::new(GzDecoder::new(file))
        } else {
            Box::new(file)
        };

        let mut rows = Vec::new();
        for (lineno, line) in BufReader::new(reader).lines().enumerate() {
            let line = line.context("reading preimage file")?;
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let (bucket, payload) = line
                .split_once(',')
                .with_context(|| format!("line {}: expected bucket,preimage", lineno + 1))?;
            let bucket: u32 = bucket
                .trim()
                .parse()
                .with_context(|| format!("line {}: bad bucket index", lineno + 1))?;
            let preimage = hex::decode(payload.trim())
                .with_context(|| format!("line {}: bad hex preimage", lineno + 1))?;
            rows.push((bucket, preimage));
        }

        if rows.is_empty() {
            bail!("preimage file {} is empty", path.display());
        }
        if !rows.len().is_power_of_two() {
            bail!(
                "preimage file holds {} rows, expected a power of two",
                rows.len()
            );
        }
        let depth = rows.len().trailing_zeros() as u8;

        let table = Self::from_rows(depth, rows)?;
        if table.entries.len() != 1usize << depth {
            bail!("preimage file does not cover every bucket up to depth {depth}");
        }
        info!(depth, buckets = table.entries.len(), "loaded preimage table");
        Ok(table)
    }

    /// Build a table from explicit rows. Coverage is not checked here;
    /// sparse tables are only suitable for tests and tooling.
    pub fn from_rows(depth: u8, rows: impl IntoIterator<Item = (u32, Vec<u8>)>) -> Result<Self> {
        if depth == 0 || depth > 32 {
            bail!("preimage depth {depth} out of range (1..=32)");
        }
        let mut entries = HashMap::new();
        for (bucket, preimage) in rows {
            if u64::from(bucket) >= 1u64 << depth {
                bail!("bucket {bucket} out of range for depth {depth}");
            }
            if entries.insert(bucket, preimage).is_some() {
                bail!("duplicate preimage row for bucket {bucket}");
            }
        }
        Ok(Self { depth, entries })
    }

    /// Brute-force a complete table of the given depth by hashing a counter
    /// until every bucket has a preimage. Cost grows as `2^depth * depth`,
    /// so this is for small depths only; production tables come from the
    /// offline precomputation job.
    pub fn generate(depth: u8) -> Self {
        assert!(depth >= 1 && depth <= 20, "generate() is for small depths");
        let total = 1usize << depth;
        let mut entries: HashMap<u32, Vec<u8>> = HashMap::with_capacity(total);
        let mut counter: u64 = 0;
        while entries.len() < total {
            let preimage = counter.to_be_bytes().to_vec();
            let hash: KadKey = Sha256::digest(&preimage).into();
            let bucket = leading_prefix(&hash, depth);
            entries.entry(bucket).or_insert(preimage);
            counter += 1;
        }
        Self { depth, entries }
    }

    pub fn depth(&self) -> u8 {
        self.depth
    }

    /// Key bytes whose hash shares exactly `cpl` leading bits with the
    /// target's keyspace position. Asking past the table depth is a hard
    /// error; callers cap their bucket traversal accordingly.
    pub fn find_preimage_for_cpl(&self, target: &PeerId, cpl: u8) -> Result<&[u8], CrawlError> {
        if cpl >= self.depth {
            return Err(CrawlError::PreimageDepthExceeded { cpl, depth: self.depth });
        }
        let bucket = flipped_prefix(&target.kad_key(), cpl, self.depth);
        self.entries
            .get(&bucket)
            .map(Vec::as_slice)
            .ok_or(CrawlError::PreimageMissing { bucket })
    }
}

/// First `depth` bits of `hash` as an integer, with the bit at position
/// `cpl` flipped. Bit 0 is the most significant bit of the hash.
pub fn flipped_prefix(hash: &KadKey, cpl: u8, depth: u8) -> u32 {
    debug_assert!(cpl < depth && depth <= 32);
    leading_prefix(hash, depth) ^ (1u32 << (depth - 1 - cpl))
}

/// First `depth` bits of `hash` as an integer.
pub fn leading_prefix(hash: &KadKey, depth: u8) -> u32 {
    let head = u32::from_be_bytes([hash[0], hash[1], hash[2], hash[3]]);
    if depth == 32 {
        head
    } else {
        head >> (32 - depth)
    }
}

/// Number of leading bits two keyspace positions share.
pub fn common_prefix_len(a: &KadKey, b: &KadKey) -> u32 {
    for (i, (x, y)) in a.iter().zip(b.iter()).enumerate() {
        let diff = x ^ y;
        if diff != 0 {
            return i as u32 * 8 + diff.leading_zeros();
        }
    }
    256
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn pid(seed: u8) -> PeerId {
        PeerId::from_bytes(vec![seed; 34])
    }

    #[test]
    fn generated_preimages_hit_exact_cpl() {
        let table = PreimageTable::generate(8);
        for seed in [1u8, 42, 200] {
            let target = pid(seed);
            let target_key = target.kad_key();
            for cpl in 0..8u8 {
                let preimage = table.find_preimage_for_cpl(&target, cpl).unwrap();
                let key: KadKey = Sha256::digest(preimage).into();
                assert_eq!(
                    common_prefix_len(&key, &target_key),
                    u32::from(cpl),
                    "seed {seed} cpl {cpl}"
                );
            }
        }
    }

    #[test]
    fn lookup_past_depth_is_an_error() {
        let table = PreimageTable::generate(4);
        let err = table.find_preimage_for_cpl(&pid(1), 4).unwrap_err();
        assert!(matches!(
            err,
            CrawlError::PreimageDepthExceeded { cpl: 4, depth: 4 }
        ));
    }

    #[test]
    fn sparse_table_reports_missing_bucket() {
        let table = PreimageTable::from_rows(8, vec![(0u32, vec![1, 2, 3])]).unwrap();
        let err = table.find_preimage_for_cpl(&pid(1), 3).unwrap_err();
        assert!(matches!(err, CrawlError::PreimageMissing { .. }));
    }

    #[test]
    fn from_rows_rejects_out_of_range_and_duplicates() {
        assert!(PreimageTable::from_rows(2, vec![(4u32, vec![0])]).is_err());
        assert!(PreimageTable::from_rows(2, vec![(1, vec![0]), (1, vec![1])]).is_err());
    }

    #[test]
    fn common_prefix_len_boundaries() {
        let zero = [0u8; 32];
        let mut one = [0u8; 32];
        one[0] = 0x80;
        assert_eq!(common_prefix_len(&zero, &zero), 256);
        assert_eq!(common_prefix_len(&zero, &one), 0);

        let mut late = [0u8; 32];
        late[1] = 0x01;
        assert_eq!(common_prefix_len(&zero, &late), 15);
    }

    #[test]
    fn flipped_prefix_flips_exactly_one_bit() {
        let hash = pid(5).kad_key();
        let base = leading_prefix(&hash, 16);
        for cpl in 0..16u8 {
            let flipped = flipped_prefix(&hash, cpl, 16);
            assert_eq!((base ^ flipped).count_ones(), 1);
            assert_eq!(base ^ flipped, 1u32 << (15 - cpl));
        }
    }

    #[test]
    fn loads_plain_csv_and_infers_depth() {
        let generated = PreimageTable::generate(4);
        let path = std::env::temp_dir().join(format!("preimages-{}.csv", std::process::id()));
        {
            let mut f = File::create(&path).unwrap();
            for bucket in 0..(1u32 << 4) {
                let preimage = generated.entries.get(&bucket).unwrap();
                writeln!(f, "{},{}", bucket, hex::encode(preimage)).unwrap();
            }
        }
        let loaded = PreimageTable::load(&path).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(loaded.depth(), 4);
        let target = pid(9);
        assert_eq!(
            loaded.find_preimage_for_cpl(&target, 2).unwrap(),
            generated.find_preimage_for_cpl(&target, 2).unwrap()
        );
    }

    #[test]
    fn load_rejects_gappy_files() {
        let path = std::env::temp_dir().join(format!("preimages-gap-{}.csv", std::process::id()));
        {
            let mut f = File::create(&path).unwrap();
            // Two rows (power of two) but bucket 1 appears twice.
            writeln!(f, "0,00").unwrap();
            writeln!(f, "0,01").unwrap();
        }
        let result = PreimageTable::load(&path);
        std::fs::remove_file(&path).ok();
        assert!(result.is_err());
    }
}

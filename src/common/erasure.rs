//! Reed-Solomon erasure codec.
//!
//! Pure (k,m) split/combine over GF(2^8). The codec carries no request state,
//! so one instance is shared across the write path, read path, and migration
//! engine. Defaults are k=6 data + m=3 parity, tolerating up to 3 lost shards.

use reed_solomon_erasure::galois_8::ReedSolomon;
use std::sync::Arc;

use crate::common::config::ErasureConfig;
use crate::common::{Error, Result};

/// Shard classification by position: the first k shards carry ciphertext,
/// the last m carry parity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardKind {
    Data,
    Parity,
}

impl ShardKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ShardKind::Data => "data",
            ShardKind::Parity => "parity",
        }
    }
}

/// Erasure codec with a fixed (k,m) schema
pub struct ErasureCodec {
    rs: Arc<ReedSolomon>,
    data_shards: usize,
    parity_shards: usize,
}

impl std::fmt::Debug for ErasureCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ErasureCodec")
            .field("data_shards", &self.data_shards)
            .field("parity_shards", &self.parity_shards)
            .finish()
    }
}

impl ErasureCodec {
    pub fn new(data_shards: usize, parity_shards: usize) -> Result<Self> {
        if data_shards == 0 || parity_shards == 0 {
            return Err(Error::InvalidConfig(format!(
                "invalid erasure schema: data={}, parity={}",
                data_shards, parity_shards
            )));
        }

        let rs = ReedSolomon::new(data_shards, parity_shards)
            .map_err(|e| Error::InvalidConfig(format!("failed to build codec: {}", e)))?;

        Ok(Self {
            rs: Arc::new(rs),
            data_shards,
            parity_shards,
        })
    }

    pub fn from_config(config: &ErasureConfig) -> Result<Self> {
        Self::new(config.data_shards, config.parity_shards)
    }

    pub fn data_shards(&self) -> usize {
        self.data_shards
    }

    pub fn parity_shards(&self) -> usize {
        self.parity_shards
    }

    pub fn total_shards(&self) -> usize {
        self.data_shards + self.parity_shards
    }

    /// Shard kind for a given index
    pub fn shard_kind(&self, index: usize) -> ShardKind {
        if index < self.data_shards {
            ShardKind::Data
        } else {
            ShardKind::Parity
        }
    }

    /// Size every shard will have for an input of `data_len` bytes
    pub fn shard_size(&self, data_len: usize) -> usize {
        data_len.div_ceil(self.data_shards)
    }

    /// Split `data` into k zero-padded data shards and compute m parity
    /// shards. Returns all k+m shards in index order.
    pub fn encode(&self, data: &[u8]) -> Result<Vec<Vec<u8>>> {
        if data.is_empty() {
            return Err(Error::InvalidRequest("cannot encode empty input".into()));
        }

        let shard_size = self.shard_size(data.len());
        let mut shards: Vec<Vec<u8>> = Vec::with_capacity(self.total_shards());

        for i in 0..self.data_shards {
            let start = i * shard_size;
            let end = std::cmp::min(start + shard_size, data.len());

            let mut shard = if start < data.len() {
                data[start..end].to_vec()
            } else {
                Vec::new()
            };

            shard.resize(shard_size, 0);
            shards.push(shard);
        }

        for _ in 0..self.parity_shards {
            shards.push(vec![0u8; shard_size]);
        }

        self.rs
            .encode(&mut shards)
            .map_err(|e| Error::Internal(format!("Reed-Solomon encoding failed: {}", e)))?;

        Ok(shards)
    }

    /// Check that the parity shards are consistent with the data shards
    pub fn verify(&self, shards: &[Vec<u8>]) -> Result<bool> {
        if shards.len() != self.total_shards() {
            return Err(Error::InvalidRequest(format!(
                "expected {} shards, got {}",
                self.total_shards(),
                shards.len()
            )));
        }

        self.rs
            .verify(shards)
            .map_err(|e| Error::Internal(format!("verification failed: {}", e)))
    }

    /// Reconstruct any missing shards in place. Requires at least k present.
    pub fn reconstruct(&self, shards: &mut [Option<Vec<u8>>]) -> Result<()> {
        if shards.len() != self.total_shards() {
            return Err(Error::InvalidRequest(format!(
                "expected {} shards, got {}",
                self.total_shards(),
                shards.len()
            )));
        }

        let available = shards.iter().filter(|s| s.is_some()).count();
        if available < self.data_shards {
            return Err(Error::InsufficientShards {
                needed: self.data_shards,
                available,
            });
        }

        self.rs
            .reconstruct(shards)
            .map_err(|e| Error::Internal(format!("Reed-Solomon reconstruction failed: {}", e)))?;

        Ok(())
    }

    /// Recover the original byte string from a (possibly incomplete) shard
    /// set: reconstruct missing entries, verify the parity equations, then
    /// concatenate the k data shards and truncate to `original_size`.
    ///
    /// Fails with `InsufficientShards` below k survivors and with
    /// `IntegrityFailure` when the reconstructed set does not satisfy the
    /// parity equations (a corrupt shard slipped in).
    pub fn decode(&self, shards: &mut [Option<Vec<u8>>], original_size: usize) -> Result<Vec<u8>> {
        self.reconstruct(shards)?;

        let full: Vec<Vec<u8>> = shards
            .iter()
            .map(|s| s.clone().expect("reconstruct fills all shards"))
            .collect();

        if !self.verify(&full)? {
            return Err(Error::IntegrityFailure(
                "erasure verification failed: parity equations not satisfied".into(),
            ));
        }

        let mut data = Vec::with_capacity(original_size);
        for shard in full.iter().take(self.data_shards) {
            data.extend_from_slice(shard);
        }

        data.truncate(original_size);
        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codec_shape() {
        let codec = ErasureCodec::new(6, 3).unwrap();
        assert_eq!(codec.data_shards(), 6);
        assert_eq!(codec.parity_shards(), 3);
        assert_eq!(codec.total_shards(), 9);
        assert_eq!(codec.shard_kind(0), ShardKind::Data);
        assert_eq!(codec.shard_kind(5), ShardKind::Data);
        assert_eq!(codec.shard_kind(6), ShardKind::Parity);
    }

    #[test]
    fn test_invalid_schema() {
        assert!(ErasureCodec::new(0, 3).is_err());
        assert!(ErasureCodec::new(6, 0).is_err());
    }

    #[test]
    fn test_encode_shape_and_padding() {
        let codec = ErasureCodec::new(6, 3).unwrap();
        let data = b"hello world";

        let shards = codec.encode(data).unwrap();
        assert_eq!(shards.len(), 9);

        // ceil(11/6) = 2 bytes per shard
        for shard in &shards {
            assert_eq!(shard.len(), 2);
        }
    }

    #[test]
    fn test_roundtrip_no_loss() {
        let codec = ErasureCodec::new(6, 3).unwrap();
        let data = b"the quick brown fox jumps over the lazy dog";

        let shards = codec.encode(data).unwrap();
        let mut optional: Vec<Option<Vec<u8>>> = shards.into_iter().map(Some).collect();

        assert_eq!(codec.decode(&mut optional, data.len()).unwrap(), data);
    }

    #[test]
    fn test_roundtrip_with_max_loss() {
        let codec = ErasureCodec::new(6, 3).unwrap();
        let data = b"tolerates up to m simultaneous shard losses";

        let shards = codec.encode(data).unwrap();
        let mut optional: Vec<Option<Vec<u8>>> = shards.into_iter().map(Some).collect();
        optional[2] = None;
        optional[4] = None;
        optional[7] = None;

        assert_eq!(codec.decode(&mut optional, data.len()).unwrap(), data);
    }

    #[test]
    fn test_too_many_losses() {
        let codec = ErasureCodec::new(6, 3).unwrap();
        let data = b"one loss too many";

        let shards = codec.encode(data).unwrap();
        let mut optional: Vec<Option<Vec<u8>>> = shards.into_iter().map(Some).collect();
        for idx in [2, 4, 5, 7] {
            optional[idx] = None;
        }

        match codec.decode(&mut optional, data.len()) {
            Err(Error::InsufficientShards { needed, available }) => {
                assert_eq!(needed, 6);
                assert_eq!(available, 5);
            }
            other => panic!("expected InsufficientShards, got {:?}", other),
        }
    }

    #[test]
    fn test_corrupt_shard_fails_verification() {
        let codec = ErasureCodec::new(6, 3).unwrap();
        let data = b"corruption should never decode silently";

        let shards = codec.encode(data).unwrap();
        let mut optional: Vec<Option<Vec<u8>>> = shards.into_iter().map(Some).collect();
        optional[3].as_mut().unwrap()[0] ^= 0xff;

        assert!(matches!(
            codec.decode(&mut optional, data.len()),
            Err(Error::IntegrityFailure(_))
        ));
    }

    #[test]
    fn test_empty_input_rejected() {
        let codec = ErasureCodec::new(6, 3).unwrap();
        assert!(codec.encode(&[]).is_err());
    }

    #[test]
    fn test_single_byte_input() {
        let codec = ErasureCodec::new(6, 3).unwrap();
        let data = [0x42u8];

        let shards = codec.encode(&data).unwrap();
        let mut optional: Vec<Option<Vec<u8>>> = shards.into_iter().map(Some).collect();
        optional[0] = None;

        assert_eq!(codec.decode(&mut optional, 1).unwrap(), data);
    }
}

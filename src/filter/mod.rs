pub mod feed;

pub use feed::*;

use sha2::{Digest, Sha256};

#[derive(Debug, thiserror::Error)]
pub enum FilterError {
    #[error("bloom filter requires non-zero size_bits and num_hashes")]
    InvalidParameters,
    #[error("serialized bloom filter is truncated or malformed")]
    MalformedData,
    #[error("serialized bloom filter size does not match header")]
    SizeMismatch,
    #[error("cannot merge bloom filters with different parameters")]
    ShapeMismatch,
}

/// Probabilistic set used as a fast "known threat hash" prefilter.
///
/// False positives are possible; false negatives are not. Double hashing
/// (`h_i = h1 + i * h2`) over two SHA-256 derived seeds keeps the per-item
/// cost at two digests regardless of `num_hashes`.
pub struct BloomFilter {
    bits: Vec<u8>,
    size_bits: u64,
    num_hashes: u32,
}

impl BloomFilter {
    pub fn new(size_bits: u64, num_hashes: u32) -> Result<Self, FilterError> {
        if size_bits == 0 || num_hashes == 0 {
            return Err(FilterError::InvalidParameters);
        }

        let size_bytes = (size_bits as usize + 7) / 8;
        Ok(Self {
            bits: vec![0u8; size_bytes],
            size_bits,
            num_hashes,
        })
    }

    pub fn size_bits(&self) -> u64 {
        self.size_bits
    }

    pub fn num_hashes(&self) -> u32 {
        self.num_hashes
    }

    pub fn add(&mut self, item: &[u8]) {
        let (h1, h2) = Self::hash_seeds(item);
        for i in 0..self.num_hashes as u64 {
            let position = h1.wrapping_add(i.wrapping_mul(h2)) % self.size_bits;
            self.set_bit(position);
        }
    }

    pub fn contains(&self, item: &[u8]) -> bool {
        let (h1, h2) = Self::hash_seeds(item);
        for i in 0..self.num_hashes as u64 {
            let position = h1.wrapping_add(i.wrapping_mul(h2)) % self.size_bits;
            if !self.get_bit(position) {
                return false;
            }
        }
        true
    }

    pub fn clear(&mut self) {
        self.bits.fill(0);
    }

    pub fn bits_set(&self) -> u64 {
        self.bits.iter().map(|b| b.count_ones() as u64).sum()
    }

    /// Estimate of distinct items added: `n = -(m/k) * ln(1 - x/m)`.
    pub fn estimated_item_count(&self) -> u64 {
        let x = self.bits_set();
        if x == 0 {
            return 0;
        }

        let m = self.size_bits as f64;
        let k = self.num_hashes as f64;
        let ratio = x as f64 / m;
        if ratio >= 1.0 {
            // Saturated filter
            return self.size_bits;
        }

        (-(m / k) * (1.0 - ratio).ln()) as u64
    }

    /// Theoretical false positive rate for the current fill: `(1 - e^(-kn/m))^k`.
    pub fn estimated_false_positive_rate(&self) -> f64 {
        let n = self.estimated_item_count();
        if n == 0 {
            return 0.0;
        }

        let m = self.size_bits as f64;
        let k = self.num_hashes as f64;
        let base = 1.0 - (-k * n as f64 / m).exp();
        base.powf(k)
    }

    /// Layout: `[size_bits: u64 LE][num_hashes: u32 LE][bit bytes]`.
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(8 + 4 + self.bits.len());
        out.extend_from_slice(&self.size_bits.to_le_bytes());
        out.extend_from_slice(&self.num_hashes.to_le_bytes());
        out.extend_from_slice(&self.bits);
        out
    }

    pub fn deserialize(data: &[u8]) -> Result<Self, FilterError> {
        const HEADER: usize = 8 + 4;
        if data.len() < HEADER {
            return Err(FilterError::MalformedData);
        }

        let size_bits = u64::from_le_bytes(data[0..8].try_into().unwrap());
        let num_hashes = u32::from_le_bytes(data[8..12].try_into().unwrap());

        let mut filter = Self::new(size_bits, num_hashes)?;
        let expected_bytes = (size_bits as usize + 7) / 8;
        if data.len() != HEADER + expected_bytes {
            return Err(FilterError::SizeMismatch);
        }

        filter.bits.copy_from_slice(&data[HEADER..]);
        Ok(filter)
    }

    /// Bitwise-OR merge; both filters must share `size_bits` and `num_hashes`.
    pub fn merge(&mut self, other: &BloomFilter) -> Result<(), FilterError> {
        if self.size_bits != other.size_bits || self.num_hashes != other.num_hashes {
            return Err(FilterError::ShapeMismatch);
        }
        for (dst, src) in self.bits.iter_mut().zip(other.bits.iter()) {
            *dst |= src;
        }
        Ok(())
    }

    // Two 64-bit seeds from SHA-256(item) and SHA-256("salt" || item),
    // first 8 bytes of each digest, big-endian.
    fn hash_seeds(item: &[u8]) -> (u64, u64) {
        let digest1 = Sha256::digest(item);

        let mut salted = Sha256::new();
        salted.update(b"salt");
        salted.update(item);
        let digest2 = salted.finalize();

        let h1 = u64::from_be_bytes(digest1[0..8].try_into().unwrap());
        let h2 = u64::from_be_bytes(digest2[0..8].try_into().unwrap());
        (h1, h2)
    }

    fn get_bit(&self, position: u64) -> bool {
        let byte_idx = (position / 8) as usize;
        let bit_idx = position % 8;
        match self.bits.get(byte_idx) {
            Some(byte) => byte & (1 << bit_idx) != 0,
            None => false,
        }
    }

    fn set_bit(&mut self, position: u64) {
        let byte_idx = (position / 8) as usize;
        let bit_idx = position % 8;
        if let Some(byte) = self.bits.get_mut(byte_idx) {
            *byte |= 1 << bit_idx;
        }
    }
}

use crate::crypto::{sha256, Address};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

pub const BLOOM_BYTE_LENGTH: usize = 256;
pub const BLOOM_BIT_LENGTH: u32 = (BLOOM_BYTE_LENGTH * 8) as u32;

/// 2048-bit log bloom carried by every header.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Bloom(pub [u8; BLOOM_BYTE_LENGTH]);

impl Default for Bloom {
    fn default() -> Self {
        Bloom([0u8; BLOOM_BYTE_LENGTH])
    }
}

/// The three bit positions that `data` sets in a bloom.
pub fn bloom_bits(data: &[u8]) -> [u32; 3] {
    let h = sha256(data);
    let mut idxs = [0u32; 3];
    for (i, idx) in idxs.iter_mut().enumerate() {
        *idx = ((u32::from(h[2 * i]) << 8) & (BLOOM_BIT_LENGTH - 1)) | u32::from(h[2 * i + 1]);
    }
    idxs
}

impl Bloom {
    pub fn add(&mut self, data: &[u8]) {
        for bit in bloom_bits(data) {
            let (byte, mask) = Self::locate(bit);
            self.0[byte] |= mask;
        }
    }

    pub fn add_address(&mut self, address: &Address) {
        self.add(address.as_bytes());
    }

    pub fn contains(&self, data: &[u8]) -> bool {
        bloom_bits(data).iter().all(|bit| self.test_bit(*bit))
    }

    pub fn test_bit(&self, bit: u32) -> bool {
        let (byte, mask) = Self::locate(bit);
        self.0[byte] & mask != 0
    }

    pub fn union(&mut self, other: &Bloom) {
        for (a, b) in self.0.iter_mut().zip(other.0.iter()) {
            *a |= *b;
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    // Bit 0 lives in the lowest bit of the last byte.
    fn locate(bit: u32) -> (usize, u8) {
        let bit = bit % BLOOM_BIT_LENGTH;
        (BLOOM_BYTE_LENGTH - 1 - (bit / 8) as usize, 1u8 << (bit % 8))
    }
}

impl fmt::Debug for Bloom {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let set = (0..BLOOM_BIT_LENGTH).filter(|b| self.test_bit(*b)).count();
        write!(f, "Bloom({} bits set)", set)
    }
}

impl Serialize for Bloom {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(self.0))
    }
}

impl<'de> Deserialize<'de> for Bloom {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        let bytes = hex::decode(&s).map_err(serde::de::Error::custom)?;
        let arr: [u8; BLOOM_BYTE_LENGTH] = bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("bloom must be 256 bytes"))?;
        Ok(Bloom(arr))
    }
}

// Pattern streams - offset-addressable byte generators for overwrite passes
//
// Every stream is a pure function of (generator, seed, absolute offset), so the
// executor can write chunk by chunk and the sampler can regenerate any sector
// independently when it checks the terminal pass.

use super::method::PatternGenerator;
use crate::{EngineError, EngineResult};
use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha20Rng;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// 256-bit seed for a random pass, recorded in the job as lowercase hex.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct PatternSeed(pub [u8; 32]);

impl PatternSeed {
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> EngineResult<Self> {
        let bytes = hex::decode(s)
            .map_err(|e| EngineError::InvalidMethod(format!("invalid seed encoding: {}", e)))?;
        let seed: [u8; 32] = bytes
            .try_into()
            .map_err(|_| EngineError::InvalidMethod("seed must be 32 bytes".to_string()))?;
        Ok(Self(seed))
    }
}

impl fmt::Debug for PatternSeed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PatternSeed({})", self.to_hex())
    }
}

impl Serialize for PatternSeed {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for PatternSeed {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        PatternSeed::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

pub enum PatternStream {
    Constant(u8),
    Repeating(Vec<u8>),
    Random(Box<ChaCha20Rng>),
}

impl PatternStream {
    pub fn new(generator: &PatternGenerator, seed: Option<&PatternSeed>) -> EngineResult<Self> {
        match generator {
            PatternGenerator::Constant(byte) => Ok(PatternStream::Constant(*byte)),
            PatternGenerator::Repeating(bytes) if bytes.is_empty() => Err(
                EngineError::InvalidMethod("repeating pattern must not be empty".to_string()),
            ),
            PatternGenerator::Repeating(bytes) => Ok(PatternStream::Repeating(bytes.clone())),
            PatternGenerator::Random => {
                let seed = seed.ok_or_else(|| {
                    EngineError::InvalidMethod("random pass has no recorded seed".to_string())
                })?;
                Ok(PatternStream::Random(Box::new(ChaCha20Rng::from_seed(seed.0))))
            }
        }
    }

    /// Fill `buf` with the bytes this pattern places at `offset..offset + buf.len()`.
    pub fn fill(&mut self, buf: &mut [u8], offset: u64) {
        match self {
            PatternStream::Constant(byte) => buf.fill(*byte),
            PatternStream::Repeating(pattern) => {
                let len = pattern.len() as u64;
                for (i, b) in buf.iter_mut().enumerate() {
                    *b = pattern[((offset + i as u64) % len) as usize];
                }
            }
            PatternStream::Random(rng) => {
                // ChaCha emits 32-bit little-endian words; byte k of the stream is
                // byte k % 4 of word k / 4.
                rng.set_word_pos(u128::from(offset / 4));
                let skip = (offset % 4) as usize;
                if skip == 0 {
                    rng.fill_bytes(buf);
                } else {
                    let mut scratch = vec![0u8; buf.len() + skip];
                    rng.fill_bytes(&mut scratch);
                    buf.copy_from_slice(&scratch[skip..]);
                }
            }
        }
    }

    /// True if `data` equals what this pattern places at `offset`.
    pub fn matches(&mut self, data: &[u8], offset: u64) -> bool {
        match self {
            PatternStream::Constant(byte) => data.iter().all(|b| b == byte),
            _ => {
                let mut expected = vec![0u8; data.len()];
                self.fill(&mut expected, offset);
                expected == data
            }
        }
    }
}

//! Sampler descriptors and their bit-exact encoding.
//!
//! The enum discriminants are public ABI: a backend maps them directly onto
//! its native sampler state. The packed word produced by
//! [`SamplerDescriptor::encode`] is what argument buffers store for sampler
//! slots:
//!
//! ```text
//! bit  0      coordinate mode
//! bits 1..=3  address mode
//! bits 4..=5  filter mode
//! bits 8..=10 depth compare function
//! ```

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

const COORD_MASK: u32 = 0x1;
const ADDRESS_MASK: u32 = 0xE;
const FILTER_MASK: u32 = 0x30;
const COMPARE_SHIFT: u32 = 8;
const COMPARE_MASK: u32 = 0x7 << COMPARE_SHIFT;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[repr(u32)]
pub enum AddressMode {
    #[default]
    None = 0,
    ClampToEdge = 2,
    ClampToZero = 4,
    Repeat = 6,
    MirroredRepeat = 8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[repr(u32)]
pub enum FilterMode {
    #[default]
    Nearest = 0x10,
    Linear = 0x20,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[repr(u32)]
pub enum CoordMode {
    #[default]
    Pixel = 0,
    Normalized = 1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[repr(u32)]
pub enum CompareFunction {
    #[default]
    Never = 0,
    Less = 1,
    Equal = 2,
    LessOrEqual = 3,
    Greater = 4,
    NotEqual = 5,
    GreaterOrEqual = 6,
    Always = 7,
}

/// Pure-value sampler state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct SamplerDescriptor {
    pub address: AddressMode,
    pub filter: FilterMode,
    pub coords: CoordMode,
    pub compare: CompareFunction,
}

impl SamplerDescriptor {
    pub fn new(
        address: AddressMode,
        filter: FilterMode,
        coords: CoordMode,
        compare: CompareFunction,
    ) -> Self {
        SamplerDescriptor {
            address,
            filter,
            coords,
            compare,
        }
    }

    /// Pack into the 32-bit word stored in argument buffers.
    pub fn encode(&self) -> u32 {
        self.coords as u32
            | self.address as u32
            | self.filter as u32
            | ((self.compare as u32) << COMPARE_SHIFT)
    }

    /// Inverse of [`encode`](Self::encode). Unknown codes are rejected.
    pub fn decode(word: u32) -> Result<Self> {
        let address = match word & ADDRESS_MASK {
            0 => AddressMode::None,
            2 => AddressMode::ClampToEdge,
            4 => AddressMode::ClampToZero,
            6 => AddressMode::Repeat,
            8 => AddressMode::MirroredRepeat,
            other => {
                return Err(Error::invalid_argument(format!(
                    "unknown sampler address code {:#x}",
                    other
                )))
            }
        };
        let filter = match word & FILTER_MASK {
            0x10 => FilterMode::Nearest,
            0x20 => FilterMode::Linear,
            other => {
                return Err(Error::invalid_argument(format!(
                    "unknown sampler filter code {:#x}",
                    other
                )))
            }
        };
        let coords = if word & COORD_MASK != 0 {
            CoordMode::Normalized
        } else {
            CoordMode::Pixel
        };
        let compare = match (word & COMPARE_MASK) >> COMPARE_SHIFT {
            0 => CompareFunction::Never,
            1 => CompareFunction::Less,
            2 => CompareFunction::Equal,
            3 => CompareFunction::LessOrEqual,
            4 => CompareFunction::Greater,
            5 => CompareFunction::NotEqual,
            6 => CompareFunction::GreaterOrEqual,
            _ => CompareFunction::Always,
        };
        let known = COORD_MASK | ADDRESS_MASK | FILTER_MASK | COMPARE_MASK;
        if word & !known != 0 {
            return Err(Error::invalid_argument(format!(
                "sampler word {:#x} has reserved bits set",
                word
            )));
        }
        Ok(SamplerDescriptor {
            address,
            filter,
            coords,
            compare,
        })
    }

    pub fn address_bits(word: u32) -> u32 {
        word & ADDRESS_MASK
    }

    pub fn filter_bits(word: u32) -> u32 {
        word & FILTER_MASK
    }

    pub fn coord_bit(word: u32) -> u32 {
        word & COORD_MASK
    }

    pub fn compare_bits(word: u32) -> u32 {
        (word & COMPARE_MASK) >> COMPARE_SHIFT
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encoding_fields() {
        let sampler = SamplerDescriptor::new(
            AddressMode::ClampToEdge,
            FilterMode::Linear,
            CoordMode::Normalized,
            CompareFunction::LessOrEqual,
        );
        let word = sampler.encode();
        assert_eq!(SamplerDescriptor::address_bits(word), 2);
        assert_eq!(SamplerDescriptor::filter_bits(word), 0x20);
        assert_eq!(SamplerDescriptor::coord_bit(word), 1);
        assert_eq!(SamplerDescriptor::compare_bits(word), 3);
        assert_eq!(word, 0x323);
    }

    #[test]
    fn test_default_is_pixel_nearest_never() {
        let word = SamplerDescriptor::default().encode();
        assert_eq!(word, 0x10);
    }

    #[test]
    fn test_decode_restores_descriptor() {
        let sampler = SamplerDescriptor::new(
            AddressMode::MirroredRepeat,
            FilterMode::Nearest,
            CoordMode::Pixel,
            CompareFunction::Always,
        );
        assert_eq!(SamplerDescriptor::decode(sampler.encode()).unwrap(), sampler);
    }

    #[test]
    fn test_decode_rejects_bad_codes() {
        // address code 0xA is not assigned
        assert!(SamplerDescriptor::decode(0x1A).is_err());
        // missing filter bits
        assert!(SamplerDescriptor::decode(0x2).is_err());
        // reserved high bit
        assert!(SamplerDescriptor::decode(0x10 | (1 << 20)).is_err());
    }
}

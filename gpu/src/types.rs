//! Small value types shared across resources: extents and index widths.

use serde::{Deserialize, Serialize};

/// Three-component extent used for image sizes and work dimensions.
///
/// Unused trailing dimensions are 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Extent3 {
    pub x: u32,
    pub y: u32,
    pub z: u32,
}

impl Extent3 {
    pub const fn new(x: u32, y: u32, z: u32) -> Self {
        Extent3 { x, y, z }
    }

    pub const fn d1(x: u32) -> Self {
        Extent3 { x, y: 1, z: 1 }
    }

    pub const fn d2(x: u32, y: u32) -> Self {
        Extent3 { x, y, z: 1 }
    }

    /// Total element count (x * y * z), saturating at `u64::MAX`.
    pub fn product(&self) -> u64 {
        (self.x as u64 * self.y as u64).saturating_mul(self.z as u64)
    }

    pub fn as_array(&self) -> [u32; 3] {
        [self.x, self.y, self.z]
    }

    pub fn has_zero(&self) -> bool {
        self.x == 0 || self.y == 0 || self.z == 0
    }

    /// Number of `local`-sized groups needed to cover `self`, per dimension.
    pub fn groups_for(&self, local: Extent3) -> Extent3 {
        Extent3 {
            x: self.x.div_ceil(local.x.max(1)),
            y: self.y.div_ceil(local.y.max(1)),
            z: self.z.div_ceil(local.z.max(1)),
        }
    }
}

impl From<u32> for Extent3 {
    fn from(x: u32) -> Self {
        Extent3::d1(x)
    }
}

impl From<[u32; 2]> for Extent3 {
    fn from(v: [u32; 2]) -> Self {
        Extent3::d2(v[0], v[1])
    }
}

impl From<[u32; 3]> for Extent3 {
    fn from(v: [u32; 3]) -> Self {
        Extent3::new(v[0], v[1], v[2])
    }
}

/// Index buffer element type. The numeric codes are part of the public ABI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum IndexType {
    /// 32-bit unsigned indices
    UInt = 0,
    /// 16-bit unsigned indices
    UShort = 1,
}

impl IndexType {
    /// Serialised width of one index in bytes.
    pub const fn size_of(self) -> usize {
        match self {
            IndexType::UInt => 4,
            IndexType::UShort => 2,
        }
    }

    pub const fn code(self) -> u32 {
        self as u32
    }

    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(IndexType::UInt),
            1 => Some(IndexType::UShort),
            _ => None,
        }
    }
}

//! Device capability record.
//!
//! A [`Capabilities`] value is a plain, serialisable description of what a
//! device can do. Backends fill it in at enumeration time; the core only ever
//! reads it or masks features away (see [`Capabilities::restrict`]). A feature
//! a backend reports as absent is never turned back on.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::image::{ImageKind, ImageUsage};

/// Minimum group-shared memory a compliant device provides.
pub const MIN_LOCAL_MEMORY_SIZE: u64 = 16 * 1024;

bitflags! {
    /// Image features a device can perform.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct ImageFeatures: u32 {
        const IMAGE = 1 << 0;
        const DEPTH = 1 << 1;
        const MSAA_READ = 1 << 2;
        const MSAA_WRITE = 1 << 3;
        const MSAA_ARRAY_READ = 1 << 4;
        const MSAA_ARRAY_WRITE = 1 << 5;
        const CUBE_READ = 1 << 6;
        const CUBE_WRITE = 1 << 7;
        const CUBE_ARRAY_READ = 1 << 8;
        const CUBE_ARRAY_WRITE = 1 << 9;
        const OFFSET_READ = 1 << 10;
        const OFFSET_WRITE = 1 << 11;
        const MIPMAP = 1 << 12;
        const MIPMAP_WRITE = 1 << 13;
        const WRITE_3D = 1 << 14;
    }
}

/// What a device supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    /// Total device memory in bytes
    pub global_memory_size: u64,
    /// Largest single allocation in bytes
    pub max_mem_alloc: u64,
    /// Group-shared memory per work-group in bytes
    pub local_memory_size: u64,
    /// Lanes per hardware subgroup, 0 if unknown
    pub simd_width: u32,
    /// Compute units, 0 if unknown
    pub compute_units: u32,
    /// Maximum work-items per work-group
    pub max_total_local_size: u32,
    pub max_image_1d: u32,
    pub max_image_2d: [u32; 2],
    pub max_image_3d: [u32; 3],
    pub max_image_layers: u32,
    pub image_features: ImageFeatures,
    pub profiling_support: bool,
    pub graphics_support: bool,
    pub double_support: bool,
    pub argument_buffer_support: bool,
}

impl Default for Capabilities {
    /// A device that supports nothing beyond plain compute.
    fn default() -> Self {
        Capabilities {
            global_memory_size: 0,
            max_mem_alloc: 0,
            local_memory_size: 0,
            simd_width: 0,
            compute_units: 0,
            max_total_local_size: 1,
            max_image_1d: 0,
            max_image_2d: [0, 0],
            max_image_3d: [0, 0, 0],
            max_image_layers: 0,
            image_features: ImageFeatures::empty(),
            profiling_support: false,
            graphics_support: false,
            double_support: false,
            argument_buffer_support: false,
        }
    }
}

impl Capabilities {
    /// Whether the device meets the minimum local memory requirement.
    pub fn is_compliant(&self) -> bool {
        self.local_memory_size >= MIN_LOCAL_MEMORY_SIZE
    }

    pub fn image_support(&self) -> bool {
        self.image_features.contains(ImageFeatures::IMAGE)
    }

    /// Whether images of `kind` can be created with at least one of read or
    /// write access.
    pub fn supports(&self, kind: ImageKind) -> bool {
        self.supports_usage(kind, ImageUsage::READ) || self.supports_usage(kind, ImageUsage::WRITE)
    }

    /// Whether an image of `kind` with `usage` can be created.
    pub fn supports_usage(&self, kind: ImageKind, usage: ImageUsage) -> bool {
        self.image_features
            .contains(Self::required_features(kind, usage))
    }

    /// Features a device must report to create an image of `kind` with `usage`.
    pub fn required_features(kind: ImageKind, usage: ImageUsage) -> ImageFeatures {
        let mut required = ImageFeatures::IMAGE;
        if kind.is_depth() {
            required |= ImageFeatures::DEPTH;
        }
        if usage.contains(ImageUsage::READ) {
            if kind.is_msaa() {
                required |= ImageFeatures::MSAA_READ;
                if kind.is_array() {
                    required |= ImageFeatures::MSAA_ARRAY_READ;
                }
            }
            if kind.is_cube() {
                required |= ImageFeatures::CUBE_READ;
                if kind.is_array() {
                    required |= ImageFeatures::CUBE_ARRAY_READ;
                }
            }
        }
        if usage.contains(ImageUsage::WRITE) {
            if kind.is_msaa() {
                required |= ImageFeatures::MSAA_WRITE;
                if kind.is_array() {
                    required |= ImageFeatures::MSAA_ARRAY_WRITE;
                }
            }
            if kind.is_cube() {
                required |= ImageFeatures::CUBE_WRITE;
                if kind.is_array() {
                    required |= ImageFeatures::CUBE_ARRAY_WRITE;
                }
            }
            if kind == ImageKind::D3 {
                required |= ImageFeatures::WRITE_3D;
            }
            if usage.contains(ImageUsage::MIPMAPPED) {
                required |= ImageFeatures::MIPMAP_WRITE;
            }
        }
        if usage.contains(ImageUsage::MIPMAPPED) {
            required |= ImageFeatures::MIPMAP;
        }
        required
    }

    /// Mask out image features by device policy. Never adds features.
    pub fn restrict(mut self, allowed: ImageFeatures) -> Self {
        self.image_features &= allowed;
        self
    }

    /// Capability part of the default-device ranking: local memory first,
    /// then compute units times SIMD width. Compare lexicographically.
    ///
    /// Devices with unknown unit counts or SIMD widths count them as 1.
    pub fn score(&self) -> (u64, u64) {
        let units = self.compute_units.max(1) as u64;
        let simd = self.simd_width.max(1) as u64;
        (self.local_memory_size, units.saturating_mul(simd))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps_with(features: ImageFeatures) -> Capabilities {
        Capabilities {
            image_features: features,
            ..Capabilities::default()
        }
    }

    #[test]
    fn test_cube_requires_cube_features() {
        let caps = caps_with(ImageFeatures::IMAGE);
        assert!(caps.supports(ImageKind::D2));
        assert!(!caps.supports(ImageKind::Cube));

        let caps = caps_with(ImageFeatures::IMAGE | ImageFeatures::CUBE_READ);
        assert!(caps.supports(ImageKind::Cube));
        assert!(!caps.supports_usage(ImageKind::Cube, ImageUsage::WRITE));
        assert!(!caps.supports(ImageKind::CubeArray));
    }

    #[test]
    fn test_msaa_array_write_needs_both_flags() {
        let required =
            Capabilities::required_features(ImageKind::D2MsaaArray, ImageUsage::WRITE);
        assert!(required.contains(ImageFeatures::MSAA_WRITE));
        assert!(required.contains(ImageFeatures::MSAA_ARRAY_WRITE));
        assert!(!required.contains(ImageFeatures::MSAA_READ));
    }

    #[test]
    fn test_no_image_support_blocks_everything() {
        let caps = Capabilities::default();
        for kind in ImageKind::ALL {
            assert!(!caps.supports(kind), "{:?} should be unsupported", kind);
        }
    }

    #[test]
    fn test_restrict_never_adds() {
        let caps = caps_with(ImageFeatures::IMAGE | ImageFeatures::CUBE_READ);
        let restricted = caps.restrict(ImageFeatures::all());
        assert_eq!(restricted.image_features, caps.image_features);
        let restricted = caps.restrict(ImageFeatures::IMAGE);
        assert!(!restricted.supports(ImageKind::Cube));
    }

    #[test]
    fn test_compliance_threshold() {
        let mut caps = Capabilities::default();
        caps.local_memory_size = 16 * 1024 - 1;
        assert!(!caps.is_compliant());
        caps.local_memory_size = 16 * 1024;
        assert!(caps.is_compliant());
    }

    #[test]
    fn test_score_prefers_local_memory_then_throughput() {
        let small = Capabilities {
            local_memory_size: 32 * 1024,
            compute_units: 64,
            simd_width: 32,
            ..Capabilities::default()
        };
        let large = Capabilities {
            local_memory_size: 64 * 1024,
            compute_units: 1,
            simd_width: 1,
            ..Capabilities::default()
        };
        assert!(large.score() > small.score());

        let wide = Capabilities {
            simd_width: 8,
            ..small
        };
        assert!(small.score() > wide.score());
    }

    #[test]
    fn test_score_saturates() {
        let caps = Capabilities {
            compute_units: u32::MAX,
            simd_width: u32::MAX,
            ..Capabilities::default()
        };
        assert_eq!(caps.score().1, u32::MAX as u64 * u32::MAX as u64);
        let unknown = Capabilities {
            compute_units: 0,
            simd_width: 0,
            ..Capabilities::default()
        };
        assert_eq!(unknown.score().1, 1);
    }
}

//! Images: typed, multi-dimensional device memory.
//!
//! Storage order is mip level, then layer (cube faces count as layers), then
//! z, y, x. Host transfers move an [`ImageRegion`] packed tightly in the same
//! order.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc, Arc};

use bitflags::bitflags;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::backend::{Command, NativeImage};
use crate::buffer::{MapAccess, MappedView};
use crate::capabilities::Capabilities;
use crate::device::Device;
use crate::error::{Error, Result};
use crate::queue::Queue;
use crate::types::Extent3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ImageKind {
    D1,
    D1Array,
    D2,
    D2Array,
    D2Msaa,
    D2MsaaArray,
    D3,
    Cube,
    CubeArray,
    Depth2,
    Depth2Array,
    DepthCube,
    DepthCubeArray,
    Depth2Msaa,
    Depth2MsaaArray,
}

impl ImageKind {
    pub const ALL: [ImageKind; 15] = [
        ImageKind::D1,
        ImageKind::D1Array,
        ImageKind::D2,
        ImageKind::D2Array,
        ImageKind::D2Msaa,
        ImageKind::D2MsaaArray,
        ImageKind::D3,
        ImageKind::Cube,
        ImageKind::CubeArray,
        ImageKind::Depth2,
        ImageKind::Depth2Array,
        ImageKind::DepthCube,
        ImageKind::DepthCubeArray,
        ImageKind::Depth2Msaa,
        ImageKind::Depth2MsaaArray,
    ];

    pub fn is_array(self) -> bool {
        matches!(
            self,
            ImageKind::D1Array
                | ImageKind::D2Array
                | ImageKind::D2MsaaArray
                | ImageKind::CubeArray
                | ImageKind::Depth2Array
                | ImageKind::DepthCubeArray
                | ImageKind::Depth2MsaaArray
        )
    }

    pub fn is_msaa(self) -> bool {
        matches!(
            self,
            ImageKind::D2Msaa
                | ImageKind::D2MsaaArray
                | ImageKind::Depth2Msaa
                | ImageKind::Depth2MsaaArray
        )
    }

    pub fn is_cube(self) -> bool {
        matches!(
            self,
            ImageKind::Cube | ImageKind::CubeArray | ImageKind::DepthCube | ImageKind::DepthCubeArray
        )
    }

    pub fn is_depth(self) -> bool {
        matches!(
            self,
            ImageKind::Depth2
                | ImageKind::Depth2Array
                | ImageKind::DepthCube
                | ImageKind::DepthCubeArray
                | ImageKind::Depth2Msaa
                | ImageKind::Depth2MsaaArray
        )
    }

    /// Spatial dimensionality of one layer (cube faces are 2D).
    pub fn dimensions(self) -> u32 {
        match self {
            ImageKind::D1 | ImageKind::D1Array => 1,
            ImageKind::D3 => 3,
            _ => 2,
        }
    }

    /// Faces per layer: 6 for cube kinds, 1 otherwise.
    pub fn faces(self) -> u32 {
        if self.is_cube() {
            6
        } else {
            1
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PixelFormat {
    R8Unorm,
    Rg8Unorm,
    Rgba8Unorm,
    Bgra8Unorm,
    R16Float,
    Rg16Float,
    Rgba16Float,
    R32Uint,
    R32Sint,
    R32Float,
    Rg32Float,
    Rgba32Float,
    Depth16Unorm,
    Depth32Float,
}

impl PixelFormat {
    pub fn bytes_per_pixel(self) -> u32 {
        match self {
            PixelFormat::R8Unorm => 1,
            PixelFormat::Rg8Unorm | PixelFormat::R16Float | PixelFormat::Depth16Unorm => 2,
            PixelFormat::Rgba8Unorm
            | PixelFormat::Bgra8Unorm
            | PixelFormat::Rg16Float
            | PixelFormat::R32Uint
            | PixelFormat::R32Sint
            | PixelFormat::R32Float
            | PixelFormat::Depth32Float => 4,
            PixelFormat::Rgba16Float | PixelFormat::Rg32Float => 8,
            PixelFormat::Rgba32Float => 16,
        }
    }

    pub fn is_depth(self) -> bool {
        matches!(self, PixelFormat::Depth16Unorm | PixelFormat::Depth32Float)
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct ImageUsage: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const MIPMAPPED = 1 << 2;
        const RENDER_TARGET = 1 << 3;
        const HOST_VISIBLE = 1 << 4;
    }
}

/// Everything needed to create an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageDesc {
    pub kind: ImageKind,
    pub format: PixelFormat,
    pub extent: Extent3,
    /// Array layers; cube arrays count whole cubes
    pub layers: u32,
    pub mip_levels: u32,
    pub sample_count: u32,
    pub usage: ImageUsage,
}

impl ImageDesc {
    pub fn new(kind: ImageKind, format: PixelFormat, extent: impl Into<Extent3>) -> Self {
        ImageDesc {
            kind,
            format,
            extent: extent.into(),
            layers: 1,
            mip_levels: 1,
            sample_count: if kind.is_msaa() { 4 } else { 1 },
            usage: ImageUsage::READ | ImageUsage::WRITE,
        }
    }

    pub fn with_layers(mut self, layers: u32) -> Self {
        self.layers = layers;
        self
    }

    pub fn with_mip_levels(mut self, mip_levels: u32) -> Self {
        self.mip_levels = mip_levels;
        if mip_levels > 1 {
            self.usage |= ImageUsage::MIPMAPPED;
        }
        self
    }

    pub fn with_samples(mut self, sample_count: u32) -> Self {
        self.sample_count = sample_count;
        self
    }

    pub fn with_usage(mut self, usage: ImageUsage) -> Self {
        self.usage = usage;
        self
    }

    /// Layers including cube faces.
    pub fn array_layers(&self) -> u32 {
        self.layers * self.kind.faces()
    }

    /// Bytes per stored texel, including samples.
    pub fn texel_size(&self) -> u64 {
        self.format.bytes_per_pixel() as u64 * self.sample_count as u64
    }

    pub fn level_extent(&self, level: u32) -> Extent3 {
        let shrink = |v: u32| (v >> level).max(1);
        Extent3 {
            x: shrink(self.extent.x),
            y: shrink(self.extent.y),
            z: shrink(self.extent.z),
        }
    }

    fn level_size(&self, level: u32) -> u64 {
        self.level_extent(level).product() * self.array_layers() as u64 * self.texel_size()
    }

    /// Byte offset of mip `level` inside the image storage.
    pub fn level_offset(&self, level: u32) -> u64 {
        (0..level).map(|l| self.level_size(l)).sum()
    }

    pub fn byte_size(&self) -> u64 {
        self.level_offset(self.mip_levels)
    }

    /// Check the description against a device's capabilities.
    ///
    /// Capability gaps are reported as unsupported features before any shape
    /// error, so a device that lacks a kind never reports a misleading
    /// invalid argument.
    pub fn validate(&self, caps: &Capabilities) -> Result<()> {
        let access = self.usage & (ImageUsage::READ | ImageUsage::WRITE | ImageUsage::MIPMAPPED);
        if !caps.supports_usage(self.kind, access) {
            let missing = Capabilities::required_features(self.kind, access) - caps.image_features;
            return Err(Error::unsupported(format!(
                "{:?} image with {:?} usage needs {:?}",
                self.kind, self.usage, missing
            )));
        }
        if self.usage.contains(ImageUsage::RENDER_TARGET) && !caps.graphics_support {
            return Err(Error::unsupported(
                "render target images need a graphics-capable device",
            ));
        }
        if !self
            .usage
            .intersects(ImageUsage::READ | ImageUsage::WRITE | ImageUsage::RENDER_TARGET)
        {
            return Err(Error::invalid_argument(
                "image usage must include READ, WRITE or RENDER_TARGET",
            ));
        }
        if self.kind.is_depth() != self.format.is_depth() {
            return Err(Error::invalid_argument(format!(
                "format {:?} does not match image kind {:?}",
                self.format, self.kind
            )));
        }

        let e = self.extent;
        if e.has_zero() {
            return Err(Error::invalid_argument("image extent must be non-zero"));
        }
        match self.kind.dimensions() {
            1 if e.y != 1 || e.z != 1 => {
                return Err(Error::invalid_argument("1D images have y = z = 1"))
            }
            2 if e.z != 1 => return Err(Error::invalid_argument("2D images have z = 1")),
            _ => {}
        }
        if self.kind.is_cube() && e.x != e.y {
            return Err(Error::invalid_argument("cube faces must be square"));
        }

        if self.layers == 0 {
            return Err(Error::invalid_argument("image needs at least one layer"));
        }
        if !self.kind.is_array() && self.layers != 1 {
            return Err(Error::invalid_argument(format!(
                "{:?} images have exactly one layer",
                self.kind
            )));
        }
        if self.kind.is_array() && self.array_layers() > caps.max_image_layers {
            return Err(Error::invalid_argument(format!(
                "{} layers exceed the device limit of {}",
                self.array_layers(),
                caps.max_image_layers
            )));
        }

        if self.kind.is_msaa() {
            if !matches!(self.sample_count, 2 | 4 | 8) {
                return Err(Error::invalid_argument(format!(
                    "MSAA images take 2, 4 or 8 samples, not {}",
                    self.sample_count
                )));
            }
        } else if self.sample_count != 1 {
            return Err(Error::invalid_argument(
                "only MSAA images have more than one sample",
            ));
        }

        if self.mip_levels == 0 {
            return Err(Error::invalid_argument("image needs at least one mip level"));
        }
        if self.mip_levels > 1 {
            if !self.usage.contains(ImageUsage::MIPMAPPED) {
                return Err(Error::invalid_argument(
                    "mip levels require MIPMAPPED usage",
                ));
            }
            if self.kind.is_msaa() {
                return Err(Error::invalid_argument("MSAA images cannot be mipmapped"));
            }
            let largest = e.x.max(e.y).max(e.z);
            let full_chain = 32 - largest.leading_zeros();
            if self.mip_levels > full_chain {
                return Err(Error::invalid_argument(format!(
                    "{} mip levels exceed the full chain of {}",
                    self.mip_levels, full_chain
                )));
            }
        }

        let fits = match self.kind.dimensions() {
            1 => e.x <= caps.max_image_1d,
            2 => e.x <= caps.max_image_2d[0] && e.y <= caps.max_image_2d[1],
            _ => {
                e.x <= caps.max_image_3d[0]
                    && e.y <= caps.max_image_3d[1]
                    && e.z <= caps.max_image_3d[2]
            }
        };
        if !fits {
            return Err(Error::invalid_argument(format!(
                "extent {:?} exceeds the device's image limits",
                e
            )));
        }
        Ok(())
    }

    /// Check that `region` lies inside this image.
    pub fn check_region(&self, region: &ImageRegion) -> Result<()> {
        if region.mip_level >= self.mip_levels {
            return Err(Error::invalid_argument(format!(
                "mip level {} out of range ({} levels)",
                region.mip_level, self.mip_levels
            )));
        }
        if region.extent.has_zero() || region.layer_count == 0 {
            return Err(Error::invalid_argument("image region is empty"));
        }
        let level = self.level_extent(region.mip_level);
        let inside = |origin: u32, len: u32, limit: u32| {
            origin.checked_add(len).map_or(false, |end| end <= limit)
        };
        if !inside(region.origin.x, region.extent.x, level.x)
            || !inside(region.origin.y, region.extent.y, level.y)
            || !inside(region.origin.z, region.extent.z, level.z)
            || !inside(region.base_layer, region.layer_count, self.array_layers())
        {
            return Err(Error::invalid_argument(format!(
                "region {:?} lies outside mip {} of extent {:?}",
                region, region.mip_level, level
            )));
        }
        Ok(())
    }

    /// Contiguous `(offset, len)` rows of `region` in image storage, in packed
    /// host order.
    pub fn row_spans(&self, region: &ImageRegion) -> Vec<(u64, usize)> {
        let level = self.level_extent(region.mip_level);
        let base = self.level_offset(region.mip_level);
        let texel = self.texel_size();
        let row_len = (region.extent.x as u64 * texel) as usize;
        let mut spans = Vec::with_capacity(
            (region.layer_count * region.extent.z * region.extent.y) as usize,
        );
        for layer in region.base_layer..region.base_layer + region.layer_count {
            for z in region.origin.z..region.origin.z + region.extent.z {
                for y in region.origin.y..region.origin.y + region.extent.y {
                    let texel_index = ((layer as u64 * level.z as u64 + z as u64) * level.y as u64
                        + y as u64)
                        * level.x as u64
                        + region.origin.x as u64;
                    spans.push((base + texel_index * texel, row_len));
                }
            }
        }
        spans
    }
}

/// Sub-volume of one mip level, across a range of layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageRegion {
    pub origin: Extent3,
    pub extent: Extent3,
    pub base_layer: u32,
    pub layer_count: u32,
    pub mip_level: u32,
}

impl ImageRegion {
    pub fn new(origin: impl Into<Extent3>, extent: impl Into<Extent3>) -> Self {
        ImageRegion {
            origin: origin.into(),
            extent: extent.into(),
            base_layer: 0,
            layer_count: 1,
            mip_level: 0,
        }
    }

    /// Every layer of the base mip level.
    pub fn whole(desc: &ImageDesc) -> Self {
        ImageRegion {
            origin: Extent3::new(0, 0, 0),
            extent: desc.extent,
            base_layer: 0,
            layer_count: desc.array_layers(),
            mip_level: 0,
        }
    }

    pub fn with_layers(mut self, base_layer: u32, layer_count: u32) -> Self {
        self.base_layer = base_layer;
        self.layer_count = layer_count;
        self
    }

    pub fn with_mip_level(mut self, mip_level: u32) -> Self {
        self.mip_level = mip_level;
        self
    }

    /// Packed host size of the region for `desc`.
    pub fn byte_len(&self, desc: &ImageDesc) -> usize {
        let bytes = self
            .extent
            .product()
            .saturating_mul(self.layer_count as u64)
            .saturating_mul(desc.texel_size());
        usize::try_from(bytes).unwrap_or(usize::MAX)
    }
}

pub(crate) struct ImageInner {
    device: Device,
    desc: ImageDesc,
    native: Arc<dyn NativeImage>,
    generation: AtomicU64,
    label: RwLock<Option<String>>,
}

/// Reference-counted handle to an image.
#[derive(Clone)]
pub struct Image {
    inner: Arc<ImageInner>,
}

impl Image {
    pub(crate) fn new(device: Device, desc: ImageDesc, native: Arc<dyn NativeImage>) -> Self {
        Image {
            inner: Arc::new(ImageInner {
                device,
                desc,
                native,
                generation: AtomicU64::new(0),
                label: RwLock::new(None),
            }),
        }
    }

    pub fn desc(&self) -> &ImageDesc {
        &self.inner.desc
    }

    pub fn kind(&self) -> ImageKind {
        self.inner.desc.kind
    }

    pub fn format(&self) -> PixelFormat {
        self.inner.desc.format
    }

    pub fn extent(&self) -> Extent3 {
        self.inner.desc.extent
    }

    pub fn device(&self) -> &Device {
        &self.inner.device
    }

    /// Backend handle written into argument buffers.
    pub fn handle(&self) -> u64 {
        self.inner.native.handle()
    }

    pub fn set_debug_label(&self, label: &str) {
        *self.inner.label.write() = Some(label.to_string());
    }

    pub fn debug_label(&self) -> Option<String> {
        self.inner.label.read().clone()
    }

    pub(crate) fn native(&self) -> &Arc<dyn NativeImage> {
        &self.inner.native
    }

    pub(crate) fn touch(&self) {
        self.inner.generation.fetch_add(1, Ordering::AcqRel);
    }

    fn identity(&self) -> usize {
        Arc::as_ptr(&self.inner) as usize
    }

    fn generation(&self) -> u64 {
        self.inner.generation.load(Ordering::Acquire)
    }

    fn check_transfer(&self, queue: &Queue, region: &ImageRegion, len: usize) -> Result<()> {
        queue.device().ensure_same(&self.inner.device, "image")?;
        self.inner.desc.check_region(region)?;
        let expected = region.byte_len(&self.inner.desc);
        if len != expected {
            return Err(Error::invalid_argument(format!(
                "region needs {} bytes, host slice has {}",
                expected, len
            )));
        }
        Ok(())
    }

    pub fn read(&self, queue: &Queue, region: &ImageRegion, dst: &mut [u8]) -> Result<()> {
        self.check_transfer(queue, region, dst.len())?;
        let (reply, result) = mpsc::channel();
        queue.submit(Command::ReadImage {
            src: Arc::clone(&self.inner.native),
            region: *region,
            reply,
        })?;
        let data = result
            .recv()
            .map_err(|_| Error::driver("queue dropped a pending image read"))??;
        if data.len() != dst.len() {
            return Err(Error::driver(format!(
                "backend returned {} bytes for a {} byte image read",
                data.len(),
                dst.len()
            )));
        }
        dst.copy_from_slice(&data);
        Ok(())
    }

    pub fn write(&self, queue: &Queue, region: &ImageRegion, src: &[u8]) -> Result<()> {
        self.check_transfer(queue, region, src.len())?;
        self.touch();
        queue.submit(Command::WriteImage {
            dst: Arc::clone(&self.inner.native),
            region: *region,
            data: src.to_vec(),
        })
    }

    /// Copy `region` into the same region of `destination`.
    pub fn copy_to(&self, queue: &Queue, destination: &Image, region: &ImageRegion) -> Result<()> {
        queue.device().ensure_same(&self.inner.device, "image")?;
        queue.device().ensure_same(&destination.inner.device, "image")?;
        if self.format() != destination.format()
            || self.inner.desc.sample_count != destination.inner.desc.sample_count
        {
            return Err(Error::invalid_argument(
                "image copies need matching formats and sample counts",
            ));
        }
        self.inner.desc.check_region(region)?;
        destination.inner.desc.check_region(region)?;
        destination.touch();
        queue.submit(Command::CopyImage {
            src: Arc::clone(&self.inner.native),
            dst: Arc::clone(&destination.inner.native),
            region: *region,
        })
    }

    pub fn map(&self, queue: &Queue, region: &ImageRegion, access: MapAccess) -> Result<MappedView> {
        if !self.inner.desc.usage.contains(ImageUsage::HOST_VISIBLE) {
            return Err(Error::unsupported("image is not host-visible"));
        }
        queue.device().ensure_same(&self.inner.device, "image")?;
        self.inner.desc.check_region(region)?;
        let mut data = vec![0u8; region.byte_len(&self.inner.desc)];
        if access.reads() {
            self.read(queue, region, &mut data)?;
        }
        Ok(MappedView::new(
            self.identity(),
            access,
            self.generation(),
            Some(*region),
            data,
        ))
    }

    pub fn unmap(&self, queue: &Queue, view: MappedView) -> Result<()> {
        let region = match view.region() {
            Some(region) if view.owner() == self.identity() => *region,
            _ => {
                return Err(Error::invalid_argument(
                    "mapped view does not belong to this image",
                ))
            }
        };
        if !view.access().writes() {
            return Ok(());
        }
        if view.generation() != self.generation() {
            return Err(Error::contract(
                "mapped view was invalidated by a queue submission; writes discarded",
            ));
        }
        self.write(queue, &region, &view)
    }
}

impl std::fmt::Debug for Image {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Image")
            .field("desc", &self.inner.desc)
            .field("handle", &self.handle())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::ImageFeatures;
    use crate::error::ErrorKind;

    fn plain_caps() -> Capabilities {
        Capabilities {
            max_image_1d: 4096,
            max_image_2d: [4096, 4096],
            max_image_3d: [256, 256, 256],
            max_image_layers: 64,
            image_features: ImageFeatures::IMAGE
                | ImageFeatures::DEPTH
                | ImageFeatures::MIPMAP
                | ImageFeatures::WRITE_3D,
            ..Capabilities::default()
        }
    }

    #[test]
    fn test_cube_without_support_is_unsupported() {
        let desc = ImageDesc::new(ImageKind::Cube, PixelFormat::Rgba8Unorm, [64, 64]);
        let err = desc.validate(&plain_caps()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnsupportedFeature);
    }

    #[test]
    fn test_capability_gate_wins_over_shape_errors() {
        // non-square cube on a device without cube support
        let desc = ImageDesc::new(ImageKind::Cube, PixelFormat::Rgba8Unorm, [64, 32]);
        let err = desc.validate(&plain_caps()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnsupportedFeature);
    }

    #[test]
    fn test_depth_format_must_match_kind() {
        let desc = ImageDesc::new(ImageKind::D2, PixelFormat::Depth32Float, [16, 16]);
        assert_eq!(
            desc.validate(&plain_caps()).unwrap_err().kind(),
            ErrorKind::InvalidArgument
        );
        let desc = ImageDesc::new(ImageKind::Depth2, PixelFormat::Depth32Float, [16, 16]);
        assert!(desc.validate(&plain_caps()).is_ok());
    }

    #[test]
    fn test_mip_chain_limits() {
        let desc =
            ImageDesc::new(ImageKind::D2, PixelFormat::R8Unorm, [16, 16]).with_mip_levels(5);
        assert!(desc.validate(&plain_caps()).is_ok());
        let desc = desc.with_mip_levels(6);
        assert!(desc.validate(&plain_caps()).is_err());
    }

    #[test]
    fn test_level_offsets() {
        let desc =
            ImageDesc::new(ImageKind::D2, PixelFormat::Rgba8Unorm, [4, 4]).with_mip_levels(3);
        assert_eq!(desc.level_offset(0), 0);
        assert_eq!(desc.level_offset(1), 64);
        assert_eq!(desc.level_offset(2), 80);
        assert_eq!(desc.byte_size(), 84);
    }

    #[test]
    fn test_row_spans_follow_storage_order() {
        let desc = ImageDesc::new(ImageKind::D2Array, PixelFormat::R8Unorm, [4, 2]).with_layers(2);
        let region = ImageRegion::new([1, 0, 0], [2, 2, 1]).with_layers(1, 1);
        let spans = desc.row_spans(&region);
        assert_eq!(spans, vec![(9, 2), (13, 2)]);
        assert_eq!(region.byte_len(&desc), 4);
    }

    #[test]
    fn test_region_bounds() {
        let desc = ImageDesc::new(ImageKind::D2, PixelFormat::R8Unorm, [4, 4]);
        assert!(desc.check_region(&ImageRegion::whole(&desc)).is_ok());
        assert!(desc
            .check_region(&ImageRegion::new([3, 0, 0], [2, 1, 1]))
            .is_err());
        assert!(desc
            .check_region(&ImageRegion::whole(&desc).with_mip_level(1))
            .is_err());
    }
}

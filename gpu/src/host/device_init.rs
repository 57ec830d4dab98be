//! Host device initialization: thread pool, memory budget and capabilities.

use std::sync::Arc;

use parking_lot::Mutex;
use rayon::{ThreadPool, ThreadPoolBuilder};

use super::buffer_ops::{HostBuffer, HostImage, HostMemory, ImageSlot, ImageTable, MemoryBudget};
use super::compile::compile_host_module;
use super::fence::HostFence;
use super::queue::HostQueue;
use crate::backend::{BackendDevice, NativeBuffer, NativeFence, NativeFunction, NativeImage, NativeQueue};
use crate::buffer::BufferFlags;
use crate::capabilities::{Capabilities, ImageFeatures};
use crate::config::ContextOptions;
use crate::descriptor_pool::DescriptorPool;
use crate::device::{DeviceType, Vendor};
use crate::error::{Error, Result};
use crate::function::{ProgramBinary, Signature};
use crate::image::ImageDesc;
use crate::queue::QueueKind;

/// Local memory each host work-group may use.
const HOST_LOCAL_MEMORY: u64 = 64 * 1024;
const HOST_MAX_LOCAL_SIZE: u32 = 1024;
const HOST_MAX_IMAGE_2D: u32 = 16384;
const HOST_MAX_IMAGE_3D: u32 = 2048;

/// Lanes of the widest vector unit this build targets.
pub fn detect_simd_width() -> u32 {
    if cfg!(target_feature = "avx512f") {
        16
    } else if cfg!(any(target_feature = "avx", target_feature = "avx2")) {
        8
    } else if cfg!(any(target_feature = "sse2", target_feature = "neon")) {
        4
    } else {
        0
    }
}

/// The CPU exposed as a compute device.
pub struct HostDevice {
    pool: Arc<ThreadPool>,
    budget: Arc<MemoryBudget>,
    images: ImageTable,
    capabilities: Capabilities,
}

impl HostDevice {
    pub fn new(options: &ContextOptions) -> Result<Self> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(options.host.worker_threads)
            .thread_name(|i| format!("lattice-host-worker-{}", i))
            .build()
            .map_err(|e| Error::driver(format!("cannot build host thread pool: {}", e)))?;

        let memory_size = options.host.memory_size;
        let capabilities = Capabilities {
            global_memory_size: memory_size,
            max_mem_alloc: memory_size,
            local_memory_size: HOST_LOCAL_MEMORY,
            simd_width: options.host.simd_width.unwrap_or_else(detect_simd_width),
            compute_units: pool.current_num_threads() as u32,
            max_total_local_size: HOST_MAX_LOCAL_SIZE,
            max_image_1d: HOST_MAX_IMAGE_2D,
            max_image_2d: [HOST_MAX_IMAGE_2D; 2],
            max_image_3d: [HOST_MAX_IMAGE_3D; 3],
            max_image_layers: HOST_MAX_IMAGE_3D,
            // no cube or multisample images on the host
            image_features: ImageFeatures::IMAGE
                | ImageFeatures::DEPTH
                | ImageFeatures::MIPMAP
                | ImageFeatures::MIPMAP_WRITE
                | ImageFeatures::WRITE_3D
                | ImageFeatures::OFFSET_READ
                | ImageFeatures::OFFSET_WRITE,
            profiling_support: true,
            graphics_support: false,
            double_support: true,
            argument_buffer_support: true,
        };
        let growth = options.descriptors.pool_growth;

        log::debug!(
            "host device: {} threads, SIMD width {}, {} byte budget",
            capabilities.compute_units,
            capabilities.simd_width,
            memory_size
        );

        Ok(HostDevice {
            pool: Arc::new(pool),
            budget: MemoryBudget::new(memory_size),
            images: Arc::new(Mutex::new(DescriptorPool::new(growth, ImageSlot::default))),
            capabilities,
        })
    }

    /// Descriptor-table entry for an image handle, if the image is alive.
    pub fn image_slot(&self, handle: u64) -> Option<ImageSlot> {
        let index = usize::try_from(handle.checked_sub(1)?).ok()?;
        self.images.lock().get(index).cloned()
    }

    /// Bytes currently allocated from the budget.
    pub fn memory_in_use(&self) -> u64 {
        self.budget.used()
    }
}

impl BackendDevice for HostDevice {
    fn name(&self) -> String {
        format!("Host CPU ({} threads)", self.pool.current_num_threads())
    }

    fn vendor(&self) -> Vendor {
        Vendor::Host
    }

    fn device_type(&self) -> DeviceType {
        DeviceType::Cpu
    }

    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    fn create_buffer(
        &self,
        size: u64,
        _flags: BufferFlags,
        contents: Option<&[u8]>,
    ) -> Result<Arc<dyn NativeBuffer>> {
        let reservation = self.budget.reserve(size)?;
        let memory = HostMemory::new(size as usize, reservation);
        if let Some(contents) = contents {
            memory.write(0, contents);
        }
        Ok(Arc::new(HostBuffer::new(memory)))
    }

    fn create_image(&self, desc: &ImageDesc) -> Result<Arc<dyn NativeImage>> {
        let size = desc.byte_size();
        let reservation = self.budget.reserve(size)?;
        let memory = HostMemory::new(size as usize, reservation);
        Ok(Arc::new(HostImage::new(memory, *desc, Arc::clone(&self.images))))
    }

    fn create_queue(&self, _kind: QueueKind, profiling: bool) -> Result<Box<dyn NativeQueue>> {
        Ok(Box::new(HostQueue::new(Arc::clone(&self.pool), profiling)?))
    }

    fn create_fence(&self) -> Result<Arc<dyn NativeFence>> {
        Ok(Arc::new(HostFence::new()))
    }

    fn create_function(
        &self,
        binary: &ProgramBinary,
        entry: &str,
        signature: &Signature,
    ) -> Result<Arc<dyn NativeFunction>> {
        Ok(Arc::new(compile_host_module(binary, entry, signature)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::{ImageKind, PixelFormat};

    fn small_options() -> ContextOptions {
        let mut options = ContextOptions::default();
        options.host.worker_threads = 2;
        options.host.memory_size = 1 << 20;
        options
    }

    #[test]
    fn test_capabilities_follow_options() {
        let mut options = small_options();
        options.host.simd_width = Some(8);
        let device = HostDevice::new(&options).unwrap();
        let caps = device.capabilities();
        assert_eq!(caps.compute_units, 2);
        assert_eq!(caps.simd_width, 8);
        assert_eq!(caps.max_mem_alloc, 1 << 20);
        assert!(caps.is_compliant());
        assert!(!caps.supports(ImageKind::Cube));
        assert!(!caps.supports(ImageKind::D2Msaa));
        assert!(caps.supports(ImageKind::D3));
    }

    #[test]
    fn test_buffers_draw_from_budget() {
        let device = HostDevice::new(&small_options()).unwrap();
        let buffer = device
            .create_buffer(1024, BufferFlags::READ, Some(&[1, 2, 3]))
            .unwrap();
        assert_eq!(device.memory_in_use(), 1024);
        assert!(device
            .create_buffer(1 << 20, BufferFlags::READ, None)
            .is_err());
        drop(buffer);
        assert_eq!(device.memory_in_use(), 0);
    }

    #[test]
    fn test_image_handles_index_descriptor_table() {
        let device = HostDevice::new(&small_options()).unwrap();
        let desc = ImageDesc::new(ImageKind::D2, PixelFormat::Rgba8Unorm, [8, 8]);
        let first = device.create_image(&desc).unwrap();
        let second = device.create_image(&desc).unwrap();
        assert_eq!(first.handle(), 1);
        assert_eq!(second.handle(), 2);
        assert_eq!(device.image_slot(2).and_then(|slot| slot.desc), Some(desc));
        drop(first);
        assert!(device.image_slot(1).is_none());
        assert!(device.image_slot(0).is_none());
    }
}

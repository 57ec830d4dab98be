//! WebGPU device initialization via wgpu

use std::sync::Arc;

use parking_lot::Mutex;
use wgpu;

use super::buffer_ops::WgpuBuffer;
use super::compile::compile_wgsl;
use super::queue::WgpuQueue;
use crate::backend::{BackendDevice, NativeBuffer, NativeFence, NativeFunction, NativeImage, NativeQueue};
use crate::buffer::BufferFlags;
use crate::capabilities::{Capabilities, ImageFeatures};
use crate::device::{DeviceType, Vendor};
use crate::error::{Error, Result};
use crate::function::{ProgramBinary, Signature};
use crate::host::fence::HostFence;
use crate::image::ImageDesc;
use crate::queue::QueueKind;

/// State shared by a wgpu device and every queue and buffer created on it.
pub struct WgpuShared {
    pub device: wgpu::Device,
    pub queue: wgpu::Queue,
    pub limits: wgpu::Limits,
    /// Validation errors raised outside an error scope, reported by the
    /// next flush or finish
    pub errors: Arc<Mutex<Option<Error>>>,
    /// Bound to nullable buffer slots
    pub null_buffer: wgpu::Buffer,
}

impl WgpuShared {
    pub fn take_error(&self) -> Result<()> {
        match self.errors.lock().take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// One wgpu adapter with its logical device.
pub struct WgpuDevice {
    info: wgpu::AdapterInfo,
    shared: Arc<WgpuShared>,
    capabilities: Capabilities,
}

impl WgpuDevice {
    /// Open a logical device on `adapter`.
    pub fn new(adapter: &wgpu::Adapter) -> Result<Self> {
        let info = adapter.get_info();
        let limits = adapter.limits();
        let features = adapter.features() & wgpu::Features::SHADER_F64;

        let (device, queue) = pollster::block_on(adapter.request_device(
            &wgpu::DeviceDescriptor {
                label: Some("lattice_gpu"),
                required_features: features,
                required_limits: limits.clone(),
                ..Default::default()
            },
            None,
        ))
        .map_err(|e| Error::driver(format!("cannot open '{}': {}", info.name, e)))?;

        let errors: Arc<Mutex<Option<Error>>> = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&errors);
        device.on_uncaptured_error(Box::new(move |error: wgpu::Error| {
            log::error!("wgpu: {}", error);
            let mut slot = sink.lock();
            if slot.is_none() {
                *slot = Some(Error::driver(error.to_string()));
            }
        }));

        let null_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("lattice_null_buffer"),
            size: 16,
            usage: wgpu::BufferUsages::STORAGE,
            mapped_at_creation: false,
        });

        let capabilities = Capabilities {
            global_memory_size: limits.max_buffer_size,
            max_mem_alloc: limits
                .max_buffer_size
                .min(limits.max_storage_buffer_binding_size as u64),
            local_memory_size: limits.max_compute_workgroup_storage_size as u64,
            simd_width: 0,
            compute_units: 0,
            max_total_local_size: limits.max_compute_invocations_per_workgroup,
            max_image_1d: 0,
            max_image_2d: [0, 0],
            max_image_3d: [0, 0, 0],
            max_image_layers: 0,
            // storage textures are not wired up yet
            image_features: ImageFeatures::empty(),
            profiling_support: false,
            graphics_support: false,
            double_support: features.contains(wgpu::Features::SHADER_F64),
            argument_buffer_support: true,
        };

        Ok(WgpuDevice {
            info,
            shared: Arc::new(WgpuShared {
                device,
                queue,
                limits,
                errors,
                null_buffer,
            }),
            capabilities,
        })
    }
}

impl BackendDevice for WgpuDevice {
    fn name(&self) -> String {
        format!("{} ({:?})", self.info.name, self.info.backend)
    }

    fn vendor(&self) -> Vendor {
        Vendor::from_pci_id(self.info.vendor)
    }

    fn device_type(&self) -> DeviceType {
        match self.info.device_type {
            wgpu::DeviceType::DiscreteGpu
            | wgpu::DeviceType::IntegratedGpu
            | wgpu::DeviceType::VirtualGpu => DeviceType::Gpu,
            wgpu::DeviceType::Cpu => DeviceType::Cpu,
            wgpu::DeviceType::Other => DeviceType::Other,
        }
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
        Ok(Arc::new(WgpuBuffer::allocate(&self.shared, size, contents)?))
    }

    fn create_image(&self, desc: &ImageDesc) -> Result<Arc<dyn NativeImage>> {
        Err(Error::unsupported(format!(
            "{:?} images are not available on the WebGPU backend",
            desc.kind
        )))
    }

    fn create_queue(&self, _kind: QueueKind, _profiling: bool) -> Result<Box<dyn NativeQueue>> {
        Ok(Box::new(WgpuQueue::new(Arc::clone(&self.shared))?))
    }

    fn create_fence(&self) -> Result<Arc<dyn NativeFence>> {
        // signalled from on_submitted_work_done callbacks
        Ok(Arc::new(HostFence::new()))
    }

    fn create_function(
        &self,
        binary: &ProgramBinary,
        entry: &str,
        signature: &Signature,
    ) -> Result<Arc<dyn NativeFunction>> {
        Ok(Arc::new(compile_wgsl(&self.shared, binary, entry, signature)?))
    }
}

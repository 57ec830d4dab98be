//! WebGPU backend for GPU compute (cross-platform via wgpu)
//!
//! Buffers, WGSL functions, argument buffers and fences are supported;
//! images and profiling are not.

pub mod buffer_ops;
pub mod compile;
pub mod device_init;
pub mod dispatch;
pub mod queue;

use std::sync::Arc;

use wgpu;

pub use buffer_ops::WgpuBuffer;
pub use compile::WgpuFunction;
pub use device_init::WgpuDevice;

use crate::backend::{Backend, BackendDevice};
use crate::config::ContextOptions;
use crate::error::Result;

pub const BACKEND_ID: &str = "webgpu";

pub struct WgpuBackend {
    instance: wgpu::Instance,
}

impl Backend for WgpuBackend {
    fn id(&self) -> &str {
        BACKEND_ID
    }

    fn enumerate(&self, _options: &ContextOptions) -> Result<Vec<Arc<dyn BackendDevice>>> {
        let mut devices: Vec<Arc<dyn BackendDevice>> = Vec::new();
        for adapter in self.instance.enumerate_adapters(wgpu::Backends::all()) {
            match WgpuDevice::new(&adapter) {
                Ok(device) => devices.push(Arc::new(device)),
                Err(e) => log::warn!("skipping wgpu adapter: {}", e),
            }
        }
        Ok(devices)
    }
}

pub fn create_backend(_options: &ContextOptions) -> Result<Box<dyn Backend>> {
    let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
        backends: wgpu::Backends::all(),
        ..Default::default()
    });
    Ok(Box::new(WgpuBackend { instance }))
}

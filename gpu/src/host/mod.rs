//! CPU backend. Always available.
//!
//! Kernels are Rust functions registered with [`host_kernel!`](crate::host_kernel)
//! or [`register_kernel`]; each queue owns a worker thread and dispatches fan
//! out over a shared rayon pool.

pub mod buffer_ops;
pub mod compile;
pub mod device_init;
pub mod dispatch;
pub mod fence;
pub mod queue;

use std::sync::Arc;

pub use buffer_ops::{HostBuffer, HostImage, HostMemory, ImageSlot};
pub use compile::{register_kernel, HostFunction, HostKernel, HostKernelFn};
pub use device_init::HostDevice;
pub use dispatch::{HostArgs, WorkItem};

use crate::backend::{Backend, BackendDevice};
use crate::config::ContextOptions;
use crate::error::Result;

pub const BACKEND_ID: &str = "host";

pub struct HostBackend;

impl Backend for HostBackend {
    fn id(&self) -> &str {
        BACKEND_ID
    }

    fn enumerate(&self, options: &ContextOptions) -> Result<Vec<Arc<dyn BackendDevice>>> {
        Ok(vec![Arc::new(HostDevice::new(options)?)])
    }
}

pub fn create_backend(_options: &ContextOptions) -> Result<Box<dyn Backend>> {
    Ok(Box::new(HostBackend))
}

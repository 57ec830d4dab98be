//! Lattice GPU compute core
//!
//! A back-end neutral compute layer: contexts enumerate devices, devices
//! create buffers, images, queues, fences and functions, and kernels are
//! launched with their arguments packed into argument buffers.
//!
//! The host backend is always built and runs kernels on a rayon pool. The
//! WebGPU backend is opt-in through the `webgpu-backend` feature.
//!
//! # Backend registration
//!
//! Backends are looked up by id through a [`BackendRegistry`]. Additional
//! backends can be linked in with [`register_backend!`] or registered at
//! runtime with [`registry::register_backend`].
//!
//! ```no_run
//! use lattice_gpu::{BackendPreference, BufferFlags, Context, ContextOptions};
//!
//! let context = Context::create(BackendPreference::Auto, &ContextOptions::default())?;
//! let device = context.default_device();
//! let queue = context.create_queue(device, lattice_gpu::QueueKind::Compute)?;
//! let buffer = context.create_buffer(device, 256, BufferFlags::READ_WRITE, None)?;
//! buffer.zero(&queue)?;
//! queue.finish()?;
//! # Ok::<(), lattice_gpu::Error>(())
//! ```

pub mod argument_buffer;
pub mod atomic;
pub mod backend;
pub mod buffer;
pub mod capabilities;
pub mod config;
pub mod context;
pub mod descriptor_pool;
pub mod device;
pub mod error;
pub mod fence;
pub mod function;
pub mod host;
pub mod image;
pub mod logging;
pub mod queue;
pub mod registry;
pub mod sampler;
pub mod types;

#[cfg(feature = "webgpu-backend")]
pub mod wgpu_backend;

// used by register_backend! and host_kernel!
pub use inventory;

pub use argument_buffer::{Arg, ArgumentBuffer, ScalarArg, ScalarValue, MAX_NESTING_DEPTH};
pub use atomic::{atomic_max, AtomicMax};
pub use buffer::{Buffer, BufferFlags, MapAccess, MappedView};
pub use capabilities::{Capabilities, ImageFeatures};
pub use config::{BackendPreference, ContextOptions};
pub use context::{AggregateLimits, Context};
pub use descriptor_pool::DescriptorPool;
pub use device::{Device, DeviceId, DeviceInfo, DeviceType, Vendor};
pub use error::{Error, ErrorKind, Result};
pub use fence::Fence;
pub use function::{
    ArgumentLayout, BinaryFormat, Function, ProgramBinary, ScalarType, Signature, Slot, SlotKind,
    ARGUMENT_BLOCK_ALIGN,
};
pub use host::{HostArgs, WorkItem};
pub use image::{Image, ImageDesc, ImageKind, ImageRegion, ImageUsage, PixelFormat};
pub use queue::{Queue, QueueKind};
pub use registry::BackendRegistry;
pub use sampler::{AddressMode, CompareFunction, CoordMode, FilterMode, SamplerDescriptor};
pub use types::{Extent3, IndexType};

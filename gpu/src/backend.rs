//! Backend seam: the traits a native backend implements.
//!
//! The core owns validation, lifetimes and argument serialisation; a backend
//! only turns already-validated requests into native work. Every queue
//! operation reaches the backend as a [`Command`] so that one FIFO carries
//! transfers, dispatches and fence operations alike.

use std::any::Any;
use std::sync::{mpsc, Arc, Weak};
use std::time::Duration;

use smallvec::SmallVec;

use crate::buffer::BufferFlags;
use crate::capabilities::Capabilities;
use crate::config::ContextOptions;
use crate::device::{DeviceType, Vendor};
use crate::error::Result;
use crate::function::{ProgramBinary, Signature};
use crate::image::{ImageDesc, ImageRegion};
use crate::queue::QueueKind;
use crate::sampler::SamplerDescriptor;
use crate::types::Extent3;

/// A native API that can enumerate devices.
pub trait Backend: Send + Sync {
    /// Registry identifier, e.g. `"host"` or `"webgpu"`.
    fn id(&self) -> &str;

    fn enumerate(&self, options: &ContextOptions) -> Result<Vec<Arc<dyn BackendDevice>>>;
}

/// One physical or logical device exposed by a backend.
pub trait BackendDevice: Send + Sync {
    fn name(&self) -> String;
    fn vendor(&self) -> Vendor;
    fn device_type(&self) -> DeviceType;
    fn capabilities(&self) -> Capabilities;

    fn create_buffer(
        &self,
        size: u64,
        flags: BufferFlags,
        contents: Option<&[u8]>,
    ) -> Result<Arc<dyn NativeBuffer>>;

    fn create_image(&self, desc: &ImageDesc) -> Result<Arc<dyn NativeImage>>;

    fn create_queue(&self, kind: QueueKind, profiling: bool) -> Result<Box<dyn NativeQueue>>;

    fn create_fence(&self) -> Result<Arc<dyn NativeFence>>;

    /// Compile or look up `entry` in `binary`. The signature has already been
    /// validated; the backend checks it against what the program declares.
    fn create_function(
        &self,
        binary: &ProgramBinary,
        entry: &str,
        signature: &Signature,
    ) -> Result<Arc<dyn NativeFunction>>;
}

pub trait NativeBuffer: Send + Sync {
    /// Value stored in argument buffers for this buffer.
    fn handle(&self) -> u64;
    fn size(&self) -> u64;
    fn as_any(&self) -> &dyn Any;
}

pub trait NativeImage: Send + Sync {
    fn handle(&self) -> u64;
    fn desc(&self) -> &ImageDesc;
    fn as_any(&self) -> &dyn Any;
}

pub trait NativeFence: Send + Sync {
    /// Move to the signalled state. Idempotent at this level.
    fn signal(&self);
    fn is_signalled(&self) -> bool;
    /// Block until signalled. Returns `false` if `timeout` expired first.
    fn wait(&self, timeout: Option<Duration>) -> bool;
}

pub trait NativeFunction: Send + Sync {
    fn entry_point(&self) -> &str;
    fn as_any(&self) -> &dyn Any;
}

/// FIFO submission channel. Commands execute in submission order; failures
/// that happen after `submit` returns are reported by the next `flush` or
/// `finish`.
pub trait NativeQueue: Send + Sync {
    fn submit(&self, command: Command) -> Result<()>;
    fn flush(&self) -> Result<()>;
    fn finish(&self) -> Result<()>;
    fn start_profiling(&self) -> Result<()>;
    /// Device time in microseconds of work submitted since `start_profiling`.
    fn stop_profiling(&self) -> Result<u64>;
}

/// Resolved value of one argument slot, as seen by a backend at dispatch.
#[derive(Clone)]
pub enum BoundValue {
    /// Little-endian bytes of a scalar slot
    Scalar(SmallVec<[u8; 16]>),
    Buffer(Arc<dyn NativeBuffer>),
    Image(Arc<dyn NativeImage>),
    Sampler(SamplerDescriptor),
    ArgumentBuffer {
        storage: Arc<dyn NativeBuffer>,
        offset: u64,
        arguments: Arc<BoundArguments>,
    },
    Null,
}

/// Snapshot of an argument buffer's bindings, one value per slot.
#[derive(Clone, Default)]
pub struct BoundArguments {
    pub values: Vec<BoundValue>,
}

impl BoundArguments {
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// A kernel launch.
pub struct Dispatch {
    pub function: Arc<dyn NativeFunction>,
    pub arguments: Arc<BoundArguments>,
    /// Storage holding the serialised argument blob
    pub storage: Arc<dyn NativeBuffer>,
    pub storage_offset: u64,
    pub blob_size: u64,
    pub global: Extent3,
    pub local: Extent3,
}

/// Unit of queue work.
pub enum Command {
    Dispatch(Dispatch),
    WriteBuffer {
        dst: Arc<dyn NativeBuffer>,
        offset: u64,
        data: Vec<u8>,
    },
    FillBuffer {
        dst: Arc<dyn NativeBuffer>,
        pattern: Vec<u8>,
    },
    ReadBuffer {
        src: Arc<dyn NativeBuffer>,
        offset: u64,
        len: usize,
        reply: mpsc::Sender<Result<Vec<u8>>>,
    },
    CopyBuffer {
        src: Arc<dyn NativeBuffer>,
        dst: Arc<dyn NativeBuffer>,
        size: u64,
    },
    WriteImage {
        dst: Arc<dyn NativeImage>,
        region: ImageRegion,
        data: Vec<u8>,
    },
    ReadImage {
        src: Arc<dyn NativeImage>,
        region: ImageRegion,
        reply: mpsc::Sender<Result<Vec<u8>>>,
    },
    CopyImage {
        src: Arc<dyn NativeImage>,
        dst: Arc<dyn NativeImage>,
        region: ImageRegion,
    },
    /// Signal once all earlier commands completed
    SignalFence(Weak<dyn NativeFence>),
    /// Stall later commands until the fence is signalled
    WaitFence(Weak<dyn NativeFence>),
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::Dispatch(_) => "dispatch",
            Command::WriteBuffer { .. } => "write-buffer",
            Command::FillBuffer { .. } => "fill-buffer",
            Command::ReadBuffer { .. } => "read-buffer",
            Command::CopyBuffer { .. } => "copy-buffer",
            Command::WriteImage { .. } => "write-image",
            Command::ReadImage { .. } => "read-image",
            Command::CopyImage { .. } => "copy-image",
            Command::SignalFence(_) => "signal-fence",
            Command::WaitFence(_) => "wait-fence",
        }
    }
}

/// Poll interval used when waiting on a fence that may be destroyed.
pub const FENCE_POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Block until the fence behind `fence` is signalled or destroyed.
///
/// Returns `false` when the fence was destroyed without being signalled.
pub fn wait_weak_fence(fence: &Weak<dyn NativeFence>) -> bool {
    loop {
        match fence.upgrade() {
            None => return false,
            Some(strong) => {
                if strong.wait(Some(FENCE_POLL_INTERVAL)) {
                    return true;
                }
            }
        }
    }
}

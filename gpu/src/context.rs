//! Context: the entry point that owns a backend and its devices.
//!
//! Every resource created through a context is pinned to it. Handing a
//! resource from one context to an operation on another fails with a
//! contract violation at call time.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use fxhash::FxHashMap;
use parking_lot::Mutex;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::argument_buffer::ArgumentBuffer;
use crate::atomic::atomic_max;
use crate::backend::Backend;
use crate::buffer::{Buffer, BufferFlags};
use crate::config::{BackendPreference, ContextOptions};
use crate::device::{Device, DeviceId};
use crate::error::{Error, Result};
use crate::fence::Fence;
use crate::function::{ArgumentLayout, Function, ProgramBinary, Signature, ARGUMENT_BLOCK_ALIGN};
use crate::image::{Image, ImageDesc};
use crate::queue::{Queue, QueueKind};
use crate::registry;

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Largest limits across all devices of a context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateLimits {
    pub local_memory_size: u64,
    pub simd_width: u32,
    pub compute_units: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct FunctionKey {
    device: usize,
    binary: ProgramBinary,
    entry: String,
    signature: Signature,
}

pub(crate) struct ContextInner {
    id: u64,
    backend: Box<dyn Backend>,
    devices: Vec<Device>,
    options: ContextOptions,
    functions: Mutex<FxHashMap<FunctionKey, Function>>,
}

#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

impl Context {
    /// Create a context on the preferred backend.
    ///
    /// A named backend that is not registered is an unsupported feature; a
    /// backend that loads but finds no device is not found. With
    /// [`BackendPreference::Auto`] the ids in `backend-order` are tried in
    /// turn and the first one that yields a device wins.
    pub fn create(preference: BackendPreference, options: &ContextOptions) -> Result<Context> {
        match preference {
            BackendPreference::Named(id) => Self::create_on(&id, options),
            BackendPreference::Auto => {
                let mut last_error = None;
                for id in &options.context.backend_order {
                    if registry::lookup(id).is_none() {
                        log::debug!("backend '{}' is not registered, skipping", id);
                        continue;
                    }
                    match Self::create_on(id, options) {
                        Ok(context) => return Ok(context),
                        Err(e) => {
                            log::debug!("backend '{}' unusable: {}", id, e);
                            last_error = Some(e);
                        }
                    }
                }
                Err(last_error.unwrap_or_else(|| {
                    Error::not_found("no backend in backend-order is registered")
                }))
            }
        }
    }

    /// Create a context using the backend named by `options`.
    pub fn from_options(options: &ContextOptions) -> Result<Context> {
        Self::create(options.backend_preference(), options)
    }

    fn create_on(id: &str, options: &ContextOptions) -> Result<Context> {
        let factory = registry::lookup(id)
            .ok_or_else(|| Error::unsupported(format!("backend '{}' is not registered", id)))?;
        let backend = factory(options)?;
        let natives = backend.enumerate(options)?;
        if natives.is_empty() {
            return Err(Error::not_found(format!(
                "backend '{}' found no devices",
                backend.id()
            )));
        }

        let context_id = NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed);
        let devices: Vec<Device> = natives
            .into_iter()
            .enumerate()
            .map(|(index, native)| {
                Device::new(
                    DeviceId {
                        context: context_id,
                        index,
                    },
                    backend.id(),
                    native,
                )
            })
            .collect();
        for device in &devices {
            if !device.capabilities().is_compliant() {
                log::warn!(
                    "device '{}' reports {} bytes of local memory, below the 16 KiB minimum",
                    device.name(),
                    device.capabilities().local_memory_size
                );
            }
        }
        log::info!(
            "context {} created on backend '{}' with {} device(s)",
            context_id,
            backend.id(),
            devices.len()
        );

        Ok(Context {
            inner: Arc::new(ContextInner {
                id: context_id,
                backend,
                devices,
                options: options.clone(),
                functions: Mutex::new(FxHashMap::default()),
            }),
        })
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn backend_id(&self) -> &str {
        self.inner.backend.id()
    }

    pub fn options(&self) -> &ContextOptions {
        &self.inner.options
    }

    /// Devices in enumeration order.
    pub fn devices(&self) -> &[Device] {
        &self.inner.devices
    }

    pub fn device(&self, index: usize) -> Result<&Device> {
        self.inner.devices.get(index).ok_or_else(|| {
            Error::not_found(format!(
                "device {} does not exist ({} enumerated)",
                index,
                self.inner.devices.len()
            ))
        })
    }

    /// Highest-scoring device; the first one enumerated wins ties.
    pub fn default_device(&self) -> &Device {
        let mut best = &self.inner.devices[0];
        for device in &self.inner.devices[1..] {
            if device.score() > best.score() {
                best = device;
            }
        }
        best
    }

    /// Maximum local memory, SIMD width and compute units over all devices.
    pub fn aggregate_limits(&self) -> AggregateLimits {
        let local_memory_size = AtomicU64::new(0);
        let simd_width = AtomicU32::new(0);
        let compute_units = AtomicU32::new(0);
        self.inner.devices.par_iter().for_each(|device| {
            let caps = device.capabilities();
            atomic_max(&local_memory_size, caps.local_memory_size);
            atomic_max(&simd_width, caps.simd_width);
            atomic_max(&compute_units, caps.compute_units);
        });
        AggregateLimits {
            local_memory_size: local_memory_size.into_inner(),
            simd_width: simd_width.into_inner(),
            compute_units: compute_units.into_inner(),
        }
    }

    fn check_device(&self, device: &Device) -> Result<()> {
        let id = device.id();
        if id.context != self.inner.id {
            return Err(Error::contract(format!(
                "device '{}' belongs to context {}, not context {}",
                device.name(),
                id.context,
                self.inner.id
            )));
        }
        match self.inner.devices.get(id.index) {
            Some(own) if own == device => Ok(()),
            _ => Err(Error::contract(format!(
                "device '{}' is not part of context {}",
                device.name(),
                self.inner.id
            ))),
        }
    }

    /// Allocate a buffer, optionally initialised with `contents`.
    ///
    /// Contents shorter than `size` fill the start of the buffer; the rest is
    /// zeroed.
    pub fn create_buffer(
        &self,
        device: &Device,
        size: u64,
        flags: BufferFlags,
        contents: Option<&[u8]>,
    ) -> Result<Buffer> {
        self.check_device(device)?;
        flags.validate()?;
        if size == 0 {
            return Err(Error::invalid_argument("buffer size must be non-zero"));
        }
        if let Some(contents) = contents {
            if contents.len() as u64 > size {
                return Err(Error::invalid_argument(format!(
                    "{} bytes of initial contents do not fit a {} byte buffer",
                    contents.len(),
                    size
                )));
            }
        }
        let max = device.capabilities().max_mem_alloc;
        if size > max {
            return Err(Error::out_of_memory(format!(
                "{} byte buffer exceeds the {} byte allocation limit",
                size, max
            )));
        }
        let native = device.native().create_buffer(size, flags, contents)?;
        log::debug!("created {} byte buffer on '{}'", size, device.name());
        Ok(Buffer::new(device.clone(), size, flags, native))
    }

    pub fn create_image(&self, device: &Device, desc: &ImageDesc) -> Result<Image> {
        self.check_device(device)?;
        desc.validate(device.capabilities())?;
        let size = desc.byte_size();
        let max = device.capabilities().max_mem_alloc;
        if size > max {
            return Err(Error::out_of_memory(format!(
                "{} byte image exceeds the {} byte allocation limit",
                size, max
            )));
        }
        let native = device.native().create_image(desc)?;
        log::debug!(
            "created {:?} image {:?} on '{}'",
            desc.kind,
            desc.extent,
            device.name()
        );
        Ok(Image::new(device.clone(), *desc, native))
    }

    pub fn create_queue(&self, device: &Device, kind: QueueKind) -> Result<Queue> {
        self.check_device(device)?;
        let caps = device.capabilities();
        if kind.needs_graphics() && !caps.graphics_support {
            return Err(Error::unsupported(format!(
                "{:?} queues need graphics support, which '{}' lacks",
                kind,
                device.name()
            )));
        }
        let profiling = caps.profiling_support && self.inner.options.profiling.enabled;
        let native = device.native().create_queue(kind, profiling)?;
        Ok(Queue::new(device.clone(), kind, native, profiling))
    }

    /// New, unsignalled fence.
    pub fn create_fence(&self, device: &Device) -> Result<Fence> {
        self.check_device(device)?;
        let native = device.native().create_fence()?;
        Ok(Fence::new(device.clone(), native))
    }

    /// Compile `entry` from `binary`, or return the cached function compiled
    /// earlier for the same device, binary, entry and signature.
    pub fn create_function(
        &self,
        device: &Device,
        binary: &ProgramBinary,
        entry: &str,
        signature: &Signature,
    ) -> Result<Function> {
        self.check_device(device)?;
        signature.validate()?;
        if entry.is_empty() {
            return Err(Error::invalid_argument("entry point name is empty"));
        }

        let key = FunctionKey {
            device: device.id().index,
            binary: binary.clone(),
            entry: entry.to_string(),
            signature: signature.clone(),
        };
        let mut cache = self.inner.functions.lock();
        if let Some(function) = cache.get(&key) {
            log::debug!("function cache hit for '{}'", entry);
            return Ok(function.clone());
        }
        let native = device.native().create_function(binary, entry, signature)?;
        let function = Function::new(device.clone(), entry, signature.clone(), native);
        cache.insert(key, function.clone());
        log::debug!("compiled '{}' for '{}'", entry, device.name());
        Ok(function)
    }

    /// Argument buffer for `function`, in `storage` or in a new buffer.
    pub fn create_argument_buffer(
        &self,
        function: &Function,
        storage: Option<&Buffer>,
    ) -> Result<ArgumentBuffer> {
        match storage {
            Some(storage) => self.create_argument_buffer_at(function, storage, 0),
            None => {
                let device = function.device();
                self.check_argument_support(device)?;
                let size = function.layout().size().max(ARGUMENT_BLOCK_ALIGN) as u64;
                let storage = self.create_buffer(device, size, BufferFlags::READ, None)?;
                Ok(ArgumentBuffer::new(function.clone(), storage, 0))
            }
        }
    }

    /// Argument buffer placed at `offset` inside an existing buffer.
    ///
    /// `offset` must be a multiple of 16. Several argument buffers may share
    /// one storage buffer, including overlapping ranges used for nesting.
    pub fn create_argument_buffer_at(
        &self,
        function: &Function,
        storage: &Buffer,
        offset: u64,
    ) -> Result<ArgumentBuffer> {
        let device = function.device();
        self.check_device(device)?;
        self.check_argument_support(device)?;
        device.ensure_same(storage.device(), "argument buffer storage")?;
        if offset % ARGUMENT_BLOCK_ALIGN as u64 != 0 {
            return Err(Error::invalid_argument(format!(
                "argument buffer offset {} is not {}-byte aligned",
                offset, ARGUMENT_BLOCK_ALIGN
            )));
        }
        let layout: &ArgumentLayout = function.layout();
        let fits = offset
            .checked_add(layout.size() as u64)
            .filter(|end| *end <= storage.size());
        if fits.is_none() {
            return Err(Error::invalid_argument(format!(
                "argument block of {} bytes at offset {} exceeds storage of {} bytes",
                layout.size(),
                offset,
                storage.size()
            )));
        }
        Ok(ArgumentBuffer::new(function.clone(), storage.clone(), offset))
    }

    fn check_argument_support(&self, device: &Device) -> Result<()> {
        if device.capabilities().argument_buffer_support {
            Ok(())
        } else {
            Err(Error::unsupported(format!(
                "'{}' does not support argument buffers",
                device.name()
            )))
        }
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("id", &self.inner.id)
            .field("backend", &self.inner.backend.id())
            .field("devices", &self.inner.devices)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{
        BackendDevice, NativeBuffer, NativeFence, NativeFunction, NativeImage, NativeQueue,
    };
    use crate::capabilities::Capabilities;
    use crate::device::{DeviceType, Vendor};
    use crate::error::ErrorKind;
    use crate::function::SlotKind;

    fn options() -> ContextOptions {
        let mut options = ContextOptions::default();
        options.host.worker_threads = 1;
        options.host.memory_size = 1 << 20;
        options
    }

    fn no_devices(_: &ContextOptions) -> Result<Box<dyn Backend>> {
        struct Empty;
        impl Backend for Empty {
            fn id(&self) -> &str {
                "context-test-empty"
            }
            fn enumerate(
                &self,
                _: &ContextOptions,
            ) -> Result<Vec<Arc<dyn BackendDevice>>> {
                Ok(Vec::new())
            }
        }
        Ok(Box::new(Empty))
    }

    /// Host device reporting a different name, type and local memory size.
    struct Disguised {
        inner: crate::host::HostDevice,
        name: &'static str,
        device_type: DeviceType,
        local_memory_size: u64,
    }

    impl BackendDevice for Disguised {
        fn name(&self) -> String {
            self.name.to_string()
        }
        fn vendor(&self) -> Vendor {
            self.inner.vendor()
        }
        fn device_type(&self) -> DeviceType {
            self.device_type
        }
        fn capabilities(&self) -> Capabilities {
            Capabilities {
                local_memory_size: self.local_memory_size,
                ..self.inner.capabilities()
            }
        }
        fn create_buffer(
            &self,
            size: u64,
            flags: BufferFlags,
            contents: Option<&[u8]>,
        ) -> Result<Arc<dyn NativeBuffer>> {
            self.inner.create_buffer(size, flags, contents)
        }
        fn create_image(&self, desc: &ImageDesc) -> Result<Arc<dyn NativeImage>> {
            self.inner.create_image(desc)
        }
        fn create_queue(
            &self,
            kind: QueueKind,
            profiling: bool,
        ) -> Result<Box<dyn NativeQueue>> {
            self.inner.create_queue(kind, profiling)
        }
        fn create_fence(&self) -> Result<Arc<dyn NativeFence>> {
            self.inner.create_fence()
        }
        fn create_function(
            &self,
            binary: &ProgramBinary,
            entry: &str,
            signature: &Signature,
        ) -> Result<Arc<dyn NativeFunction>> {
            self.inner.create_function(binary, entry, signature)
        }
    }

    struct Lineup {
        id: &'static str,
        devices: Vec<(&'static str, DeviceType, u64)>,
    }

    impl Backend for Lineup {
        fn id(&self) -> &str {
            self.id
        }
        fn enumerate(
            &self,
            options: &ContextOptions,
        ) -> Result<Vec<Arc<dyn BackendDevice>>> {
            self.devices
                .iter()
                .map(|&(name, device_type, local_memory_size)| {
                    let device: Arc<dyn BackendDevice> = Arc::new(Disguised {
                        inner: crate::host::HostDevice::new(options)?,
                        name,
                        device_type,
                        local_memory_size,
                    });
                    Ok(device)
                })
                .collect()
        }
    }

    fn lineup_context(id: &'static str, devices: Vec<(&'static str, DeviceType, u64)>) -> Context {
        registry::register_backend(id, move |_: &ContextOptions| {
            Ok(Box::new(Lineup {
                id,
                devices: devices.clone(),
            }) as Box<dyn Backend>)
        })
        .unwrap();
        Context::create(BackendPreference::named(id), &options()).unwrap()
    }

    #[test]
    fn test_auto_skips_unregistered_backends() {
        let context = Context::create(BackendPreference::Auto, &options()).unwrap();
        assert_eq!(context.backend_id(), "host");
        assert_eq!(context.devices().len(), 1);
        assert_eq!(context.default_device().id().index, 0);
    }

    #[test]
    fn test_unknown_backend_is_unsupported() {
        let err = Context::create(BackendPreference::named("context-test-missing"), &options())
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnsupportedFeature);
    }

    #[test]
    fn test_backend_without_devices_is_not_found() {
        registry::register_backend("context-test-empty", no_devices).unwrap();
        let err = Context::create(BackendPreference::named("context-test-empty"), &options())
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_factory_errors_propagate() {
        registry::register_backend("context-test-broken", |_: &ContextOptions| {
            Err(Error::driver("driver library missing"))
        })
        .unwrap();
        let err = Context::create(BackendPreference::named("context-test-broken"), &options())
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DriverFailure);
    }

    #[test]
    fn test_device_index_out_of_range() {
        let context = Context::create(BackendPreference::named("host"), &options()).unwrap();
        assert_eq!(context.device(3).unwrap_err().kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_aggregate_limits_match_single_device() {
        let context = Context::create(BackendPreference::named("host"), &options()).unwrap();
        let caps = *context.default_device().capabilities();
        let limits = context.aggregate_limits();
        assert_eq!(limits.local_memory_size, caps.local_memory_size);
        assert_eq!(limits.simd_width, caps.simd_width);
        assert_eq!(limits.compute_units, 1);
    }

    #[test]
    fn test_argument_buffer_placement_checks() {
        crate::host::register_kernel("context_test_kernel", &[SlotKind::Buffer], |_, _| {})
            .unwrap();
        let context = Context::create(BackendPreference::named("host"), &options()).unwrap();
        let device = context.default_device();
        let function = context
            .create_function(
                device,
                &ProgramBinary::host_module(&["context_test_kernel"]),
                "context_test_kernel",
                &Signature::from_kinds(&[SlotKind::Buffer]),
            )
            .unwrap();
        let storage = context
            .create_buffer(device, 32, BufferFlags::READ, None)
            .unwrap();

        assert!(context.create_argument_buffer_at(&function, &storage, 16).is_ok());
        let err = context
            .create_argument_buffer_at(&function, &storage, 8)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        let err = context
            .create_argument_buffer_at(&function, &storage, 32)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        let err = context
            .create_argument_buffer_at(&function, &storage, u64::MAX - 15)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);

        let owned = context.create_argument_buffer(&function, None).unwrap();
        assert_eq!(owned.storage().size(), ARGUMENT_BLOCK_ALIGN as u64);
        assert!(!owned.is_set());
    }

    #[test]
    fn test_default_device_ties_go_to_first_enumerated() {
        let context = lineup_context(
            "context-test-twins",
            vec![
                ("first", DeviceType::Cpu, 32 * 1024),
                ("second", DeviceType::Cpu, 32 * 1024),
            ],
        );
        assert_eq!(context.devices().len(), 2);
        assert_eq!(context.default_device().name(), "first");
        assert_eq!(context.default_device().id().index, 0);
    }

    #[test]
    fn test_default_device_prefers_gpu_then_local_memory() {
        let context = lineup_context(
            "context-test-ranked",
            vec![
                ("big-cpu", DeviceType::Cpu, 1 << 20),
                ("small-gpu", DeviceType::Gpu, 16 * 1024),
                ("large-gpu", DeviceType::Gpu, 64 * 1024),
                ("large-gpu-again", DeviceType::Gpu, 64 * 1024),
            ],
        );
        assert_eq!(context.default_device().name(), "large-gpu");
        assert_eq!(context.default_device().id().index, 2);
    }

    #[test]
    fn test_function_cache_compares_binary_bytes() {
        crate::host::register_kernel("context_test_cached", &[SlotKind::Buffer], |_, _| {})
            .unwrap();
        let context = Context::create(BackendPreference::named("host"), &options()).unwrap();
        let device = context.default_device();
        let signature = Signature::from_kinds(&[SlotKind::Buffer]);
        let compile = |binary: &ProgramBinary| {
            context
                .create_function(device, binary, "context_test_cached", &signature)
                .unwrap()
        };

        let single = ProgramBinary::host_module(&["context_test_cached"]);
        let listed = ProgramBinary::host_module(&["context_test_cached", "context_test_kernel"]);
        let first = compile(&single);
        assert!(first.ptr_eq(&compile(&single.clone())));
        assert!(!first.ptr_eq(&compile(&listed)));

        let key = |binary: &ProgramBinary| FunctionKey {
            device: 0,
            binary: binary.clone(),
            entry: "context_test_cached".to_string(),
            signature: signature.clone(),
        };
        assert_ne!(key(&single), key(&listed));
    }
}

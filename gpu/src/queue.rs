//! Queues: FIFO submission channels bound to one device.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::argument_buffer::ArgumentBuffer;
use crate::backend::{BoundArguments, Command, Dispatch, NativeQueue};
use crate::device::Device;
use crate::error::{Error, Result};
use crate::fence::Fence;
use crate::function::Function;
use crate::types::Extent3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QueueKind {
    Compute,
    Graphics,
    All,
}

impl QueueKind {
    pub fn needs_graphics(self) -> bool {
        !matches!(self, QueueKind::Compute)
    }
}

pub(crate) struct QueueInner {
    device: Device,
    kind: QueueKind,
    native: Box<dyn NativeQueue>,
    profiling_enabled: bool,
    profiling: AtomicBool,
}

impl Drop for QueueInner {
    fn drop(&mut self) {
        if let Err(e) = self.native.finish() {
            log::error!("queue released with failed work: {}", e);
        }
    }
}

/// Handle to a queue. Clones share one FIFO; dropping the last handle waits
/// for in-flight work.
///
/// Submitting to one queue from several threads at once is the caller's
/// responsibility to serialise.
#[derive(Clone)]
pub struct Queue {
    inner: Arc<QueueInner>,
}

impl Queue {
    pub(crate) fn new(
        device: Device,
        kind: QueueKind,
        native: Box<dyn NativeQueue>,
        profiling_enabled: bool,
    ) -> Self {
        Queue {
            inner: Arc::new(QueueInner {
                device,
                kind,
                native,
                profiling_enabled,
                profiling: AtomicBool::new(false),
            }),
        }
    }

    pub fn device(&self) -> &Device {
        &self.inner.device
    }

    pub fn kind(&self) -> QueueKind {
        self.inner.kind
    }

    pub(crate) fn submit(&self, command: Command) -> Result<()> {
        log::trace!("queue submit: {}", command.name());
        self.inner.native.submit(command)
    }

    /// Launch `function` over `global` work-items in groups of `local`.
    ///
    /// The queue first waits on every fence in `wait_fences`, and signals
    /// every fence in `signal_fences` once the dispatch completes. Returns as
    /// soon as the work is submitted.
    pub fn enqueue_function(
        &self,
        function: &Function,
        arguments: &ArgumentBuffer,
        global: impl Into<Extent3>,
        local: impl Into<Extent3>,
        wait_fences: &[&Fence],
        signal_fences: &[&Fence],
    ) -> Result<()> {
        let global = global.into();
        let local = local.into();

        self.inner.device.ensure_same(function.device(), "function")?;
        self.inner
            .device
            .ensure_same(arguments.storage().device(), "argument buffer")?;
        if !arguments.function().ptr_eq(function) {
            return Err(Error::invalid_argument(format!(
                "argument buffer was built for '{}', not '{}'",
                arguments.function().entry_point(),
                function.entry_point()
            )));
        }
        if global.has_zero() {
            return Err(Error::invalid_argument(format!(
                "global extent {:?} has a zero component",
                global
            )));
        }
        if local.has_zero() {
            return Err(Error::invalid_argument(format!(
                "local extent {:?} has a zero component",
                local
            )));
        }
        let max_local = self.inner.device.capabilities().max_total_local_size as u64;
        if local.product() > max_local {
            return Err(Error::invalid_argument(format!(
                "local extent {:?} has {} work-items, device allows {}",
                local,
                local.product(),
                max_local
            )));
        }
        for fence in wait_fences.iter().chain(signal_fences) {
            self.inner.device.ensure_same(fence.device(), "fence")?;
        }
        for (i, fence) in signal_fences.iter().enumerate() {
            let repeated = signal_fences[..i]
                .iter()
                .any(|earlier| earlier.ptr_eq(fence));
            if repeated || fence.is_armed() {
                return Err(Error::contract(
                    "fence is already scheduled to signal",
                ));
            }
        }

        let bound = arguments.bind_for_dispatch()?;

        for (i, fence) in signal_fences.iter().enumerate() {
            if let Err(e) = fence.arm() {
                signal_fences[..i].iter().for_each(|armed| armed.disarm());
                return Err(e);
            }
        }
        // Fences whose signal command was not accepted are released again.
        let mut signalled = 0;
        let submitted = self
            .submit_dispatch(function, arguments, bound, global, local, wait_fences)
            .and_then(|()| {
                for fence in signal_fences {
                    self.submit(fence.signal_command())?;
                    signalled += 1;
                }
                Ok(())
            });
        if submitted.is_err() {
            signal_fences[signalled..]
                .iter()
                .for_each(|fence| fence.disarm());
        }
        submitted
    }

    fn submit_dispatch(
        &self,
        function: &Function,
        arguments: &ArgumentBuffer,
        bound: Arc<BoundArguments>,
        global: Extent3,
        local: Extent3,
        wait_fences: &[&Fence],
    ) -> Result<()> {
        for fence in wait_fences {
            self.submit(fence.wait_command())?;
        }
        self.submit(Command::Dispatch(Dispatch {
            function: Arc::clone(function.native()),
            arguments: bound,
            storage: Arc::clone(arguments.storage().native()),
            storage_offset: arguments.offset(),
            blob_size: function.layout().size() as u64,
            global,
            local,
        }))
    }

    /// Hand submitted work to the device and report deferred errors.
    pub fn flush(&self) -> Result<()> {
        self.inner.native.flush()
    }

    /// Block until all work submitted so far has completed.
    pub fn finish(&self) -> Result<()> {
        self.inner.native.finish()
    }

    /// Start measuring device time. A second start discards the first.
    pub fn start_profiling(&self) -> Result<()> {
        if !self.inner.profiling_enabled {
            log::debug!("profiling unavailable on {}", self.inner.device.name());
            return Ok(());
        }
        if self.inner.profiling.swap(true, Ordering::AcqRel) {
            log::warn!("start_profiling called twice; discarding the first measurement");
        }
        self.inner.native.start_profiling()
    }

    /// Stop measuring and return elapsed device time in microseconds.
    ///
    /// Waits for the work submitted since `start_profiling`. Returns 0 when
    /// profiling is unsupported or was never started.
    pub fn stop_profiling(&self) -> Result<u64> {
        if !self.inner.profiling_enabled {
            return Ok(0);
        }
        if !self.inner.profiling.swap(false, Ordering::AcqRel) {
            log::warn!("stop_profiling called without start_profiling");
            return Ok(0);
        }
        self.inner.native.stop_profiling()
    }
}

impl std::fmt::Debug for Queue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queue")
            .field("device", &self.inner.device.name())
            .field("kind", &self.inner.kind)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::argument_buffer::Arg;
    use crate::config::{BackendPreference, ContextOptions};
    use crate::context::Context;
    use crate::error::ErrorKind;
    use crate::function::{ProgramBinary, ScalarType, Signature, SlotKind};
    use std::time::Duration;

    /// Accepts transfers and fence commands but refuses every dispatch.
    struct RejectDispatch;

    impl NativeQueue for RejectDispatch {
        fn submit(&self, command: Command) -> Result<()> {
            match command {
                Command::Dispatch(_) => Err(Error::driver("dispatch rejected")),
                _ => Ok(()),
            }
        }
        fn flush(&self) -> Result<()> {
            Ok(())
        }
        fn finish(&self) -> Result<()> {
            Ok(())
        }
        fn start_profiling(&self) -> Result<()> {
            Ok(())
        }
        fn stop_profiling(&self) -> Result<u64> {
            Ok(0)
        }
    }

    #[test]
    fn test_failed_dispatch_releases_signal_fences() {
        let signature = Signature::from_kinds(&[SlotKind::scalar(ScalarType::U32)]);
        crate::host::register_kernel(
            "queue_test_noop",
            &[SlotKind::scalar(ScalarType::U32)],
            |_, _| {},
        )
        .unwrap();
        let mut options = ContextOptions::default();
        options.host.worker_threads = 1;
        let context = Context::create(BackendPreference::named("host"), &options).unwrap();
        let device = context.default_device();
        let queue = context.create_queue(device, QueueKind::Compute).unwrap();
        let function = context
            .create_function(
                device,
                &ProgramBinary::host_module(&["queue_test_noop"]),
                "queue_test_noop",
                &signature,
            )
            .unwrap();
        let arguments = context.create_argument_buffer(&function, None).unwrap();
        arguments.set_arguments(&queue, &[Arg::from(7u32)]).unwrap();

        let rejecting = Queue::new(
            device.clone(),
            QueueKind::Compute,
            Box::new(RejectDispatch),
            false,
        );
        let first = context.create_fence(device).unwrap();
        let second = context.create_fence(device).unwrap();
        let err = rejecting
            .enqueue_function(&function, &arguments, 4u32, 1u32, &[], &[&first, &second])
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DriverFailure);
        assert!(!first.is_armed());
        assert!(!second.is_armed());

        first.signal_on(&queue).unwrap();
        queue.finish().unwrap();
        first.wait(Some(Duration::from_secs(5))).unwrap();
    }
}

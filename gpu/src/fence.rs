//! Fences: one-shot, monotonic synchronisation points.
//!
//! A fence starts unsignalled and, once signalled, stays signalled until it
//! is destroyed. Queues only hold weak references, so dropping the last
//! [`Fence`] handle releases it even while a submission still names it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;

use crate::backend::{Command, NativeFence};
use crate::device::Device;
use crate::error::{Error, Result};
use crate::queue::Queue;

pub(crate) struct FenceInner {
    device: Device,
    native: Arc<dyn NativeFence>,
    /// Set once a signal has been enqueued
    armed: AtomicBool,
    label: RwLock<Option<String>>,
}

#[derive(Clone)]
pub struct Fence {
    inner: Arc<FenceInner>,
}

impl Fence {
    pub(crate) fn new(device: Device, native: Arc<dyn NativeFence>) -> Self {
        Fence {
            inner: Arc::new(FenceInner {
                device,
                native,
                armed: AtomicBool::new(false),
                label: RwLock::new(None),
            }),
        }
    }

    pub fn device(&self) -> &Device {
        &self.inner.device
    }

    pub fn is_signalled(&self) -> bool {
        self.inner.native.is_signalled()
    }

    pub fn ptr_eq(&self, other: &Fence) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn is_armed(&self) -> bool {
        self.inner.armed.load(Ordering::Acquire)
    }

    /// Claim the fence's single signal. Fails if a signal was already enqueued.
    pub(crate) fn arm(&self) -> Result<()> {
        if self.inner.armed.swap(true, Ordering::AcqRel) {
            return Err(Error::contract(format!(
                "fence{} is already scheduled to signal",
                self.label_suffix()
            )));
        }
        Ok(())
    }

    /// Release a claim whose signal never reached a queue.
    pub(crate) fn disarm(&self) {
        self.inner.armed.store(false, Ordering::Release);
    }

    pub(crate) fn signal_command(&self) -> Command {
        Command::SignalFence(Arc::downgrade(&self.inner.native))
    }

    pub(crate) fn wait_command(&self) -> Command {
        Command::WaitFence(Arc::downgrade(&self.inner.native))
    }

    /// Signal the fence once all work already submitted to `queue` completes.
    pub fn signal_on(&self, queue: &Queue) -> Result<()> {
        queue.device().ensure_same(&self.inner.device, "fence")?;
        self.arm()?;
        if let Err(e) = queue.submit(self.signal_command()) {
            self.disarm();
            return Err(e);
        }
        Ok(())
    }

    /// Make `queue` stall subsequent work until the fence is signalled.
    pub fn wait_on(&self, queue: &Queue) -> Result<()> {
        queue.device().ensure_same(&self.inner.device, "fence")?;
        queue.submit(self.wait_command())
    }

    /// Block the calling thread until the fence is signalled.
    ///
    /// With a timeout, returns a timeout error if the fence is still
    /// unsignalled when it expires.
    pub fn wait(&self, timeout: Option<Duration>) -> Result<()> {
        if self.inner.native.wait(timeout) {
            Ok(())
        } else {
            Err(Error::timeout(format!(
                "fence{} not signalled within {:?}",
                self.label_suffix(),
                timeout.unwrap_or_default()
            )))
        }
    }

    pub fn set_debug_label(&self, label: &str) {
        *self.inner.label.write() = Some(label.to_string());
    }

    pub fn debug_label(&self) -> Option<String> {
        self.inner.label.read().clone()
    }

    fn label_suffix(&self) -> String {
        match self.inner.label.read().as_deref() {
            Some(label) => format!(" '{}'", label),
            None => String::new(),
        }
    }
}

impl std::fmt::Debug for Fence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fence")
            .field("signalled", &self.is_signalled())
            .field("label", &self.debug_label())
            .finish()
    }
}

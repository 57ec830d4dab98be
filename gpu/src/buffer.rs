//! Buffers: contiguous device memory and host transfers.
//!
//! A [`Buffer`] is a cheap, reference-counted handle. Transfers go through a
//! [`Queue`] so they observe FIFO ordering with kernels submitted before them.
//! Reads and mappings wait for the data they return; writes, fills and copies
//! only enqueue.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc, Arc};

use bitflags::bitflags;
use parking_lot::RwLock;

use crate::backend::{Command, NativeBuffer};
use crate::device::Device;
use crate::error::{Error, Result};
use crate::image::ImageRegion;
use crate::queue::Queue;

bitflags! {
    /// Access and residency flags for a buffer.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BufferFlags: u32 {
        /// Kernels may read the buffer
        const READ = 1 << 0;
        /// Kernels may write the buffer
        const WRITE = 1 << 1;
        const READ_WRITE = Self::READ.bits() | Self::WRITE.bits();
        /// The host may map the buffer
        const HOST_VISIBLE = 1 << 2;
        /// The buffer never leaves device memory
        const DEVICE_ONLY = 1 << 3;
    }
}

impl BufferFlags {
    pub fn validate(self) -> Result<()> {
        if !self.intersects(BufferFlags::READ_WRITE) {
            return Err(Error::invalid_argument(
                "buffer flags must include READ or WRITE",
            ));
        }
        if self.contains(BufferFlags::HOST_VISIBLE | BufferFlags::DEVICE_ONLY) {
            return Err(Error::invalid_argument(
                "HOST_VISIBLE and DEVICE_ONLY are mutually exclusive",
            ));
        }
        Ok(())
    }
}

/// How a mapping will be used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MapAccess {
    Read,
    Write,
    ReadWrite,
    /// Write-only mapping whose previous contents are not fetched
    WriteInvalidate,
}

impl MapAccess {
    pub fn reads(self) -> bool {
        matches!(self, MapAccess::Read | MapAccess::ReadWrite)
    }

    pub fn writes(self) -> bool {
        !matches!(self, MapAccess::Read)
    }
}

/// Host-addressable view of a mapped buffer or image.
///
/// The view is a snapshot; writes reach the resource on unmap. Any queue
/// submission that targets the resource while mapped invalidates the view.
#[derive(Debug)]
pub struct MappedView {
    owner: usize,
    access: MapAccess,
    generation: u64,
    region: Option<ImageRegion>,
    data: Vec<u8>,
}

impl MappedView {
    pub(crate) fn new(
        owner: usize,
        access: MapAccess,
        generation: u64,
        region: Option<ImageRegion>,
        data: Vec<u8>,
    ) -> Self {
        MappedView {
            owner,
            access,
            generation,
            region,
            data,
        }
    }

    pub fn access(&self) -> MapAccess {
        self.access
    }

    pub(crate) fn owner(&self) -> usize {
        self.owner
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    pub(crate) fn region(&self) -> Option<&ImageRegion> {
        self.region.as_ref()
    }
}

impl Deref for MappedView {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl DerefMut for MappedView {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

pub(crate) struct BufferInner {
    device: Device,
    size: u64,
    flags: BufferFlags,
    native: Arc<dyn NativeBuffer>,
    generation: AtomicU64,
    label: RwLock<Option<String>>,
}

/// Reference-counted handle to device memory.
#[derive(Clone)]
pub struct Buffer {
    inner: Arc<BufferInner>,
}

impl Buffer {
    pub(crate) fn new(
        device: Device,
        size: u64,
        flags: BufferFlags,
        native: Arc<dyn NativeBuffer>,
    ) -> Self {
        Buffer {
            inner: Arc::new(BufferInner {
                device,
                size,
                flags,
                native,
                generation: AtomicU64::new(0),
                label: RwLock::new(None),
            }),
        }
    }

    pub fn size(&self) -> u64 {
        self.inner.size
    }

    pub fn flags(&self) -> BufferFlags {
        self.inner.flags
    }

    pub fn device(&self) -> &Device {
        &self.inner.device
    }

    pub fn is_host_visible(&self) -> bool {
        self.inner.flags.contains(BufferFlags::HOST_VISIBLE)
    }

    /// Backend handle written into argument buffers (a device address on
    /// backends that have one).
    pub fn handle(&self) -> u64 {
        self.inner.native.handle()
    }

    pub fn set_debug_label(&self, label: &str) {
        *self.inner.label.write() = Some(label.to_string());
    }

    pub fn debug_label(&self) -> Option<String> {
        self.inner.label.read().clone()
    }

    pub(crate) fn native(&self) -> &Arc<dyn NativeBuffer> {
        &self.inner.native
    }

    pub(crate) fn ptr_eq(&self, other: &Buffer) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn identity(&self) -> usize {
        Arc::as_ptr(&self.inner) as usize
    }

    /// Record that a queue submission targets this buffer.
    pub(crate) fn touch(&self) {
        self.inner.generation.fetch_add(1, Ordering::AcqRel);
    }

    fn generation(&self) -> u64 {
        self.inner.generation.load(Ordering::Acquire)
    }

    fn check_queue(&self, queue: &Queue) -> Result<()> {
        queue.device().ensure_same(&self.inner.device, "buffer")
    }

    fn check_range(&self, offset: u64, len: usize) -> Result<()> {
        let end = offset.checked_add(len as u64);
        match end {
            Some(end) if end <= self.inner.size => Ok(()),
            _ => Err(Error::invalid_argument(format!(
                "range {}..{}+{} exceeds buffer size {}",
                offset, offset, len, self.inner.size
            ))),
        }
    }

    /// Read the start of the buffer into `dst`.
    pub fn read(&self, queue: &Queue, dst: &mut [u8]) -> Result<()> {
        self.read_at(queue, 0, dst)
    }

    /// Read `dst.len()` bytes starting at `offset`, after all work already
    /// submitted to `queue` has completed.
    pub fn read_at(&self, queue: &Queue, offset: u64, dst: &mut [u8]) -> Result<()> {
        self.check_queue(queue)?;
        self.check_range(offset, dst.len())?;
        if dst.is_empty() {
            return Ok(());
        }
        let (reply, result) = mpsc::channel();
        queue.submit(Command::ReadBuffer {
            src: Arc::clone(&self.inner.native),
            offset,
            len: dst.len(),
            reply,
        })?;
        let data = result
            .recv()
            .map_err(|_| Error::driver("queue dropped a pending buffer read"))??;
        if data.len() != dst.len() {
            return Err(Error::driver(format!(
                "backend returned {} bytes for a {} byte read",
                data.len(),
                dst.len()
            )));
        }
        dst.copy_from_slice(&data);
        Ok(())
    }

    /// Write `src` to the start of the buffer.
    pub fn write(&self, queue: &Queue, src: &[u8]) -> Result<()> {
        self.write_at(queue, 0, src)
    }

    pub fn write_at(&self, queue: &Queue, offset: u64, src: &[u8]) -> Result<()> {
        self.check_queue(queue)?;
        self.check_range(offset, src.len())?;
        if src.is_empty() {
            return Ok(());
        }
        self.touch();
        queue.submit(Command::WriteBuffer {
            dst: Arc::clone(&self.inner.native),
            offset,
            data: src.to_vec(),
        })
    }

    /// Repeat `pattern` over the whole buffer.
    pub fn fill(&self, queue: &Queue, pattern: &[u8]) -> Result<()> {
        self.check_queue(queue)?;
        if pattern.is_empty() || self.inner.size % pattern.len() as u64 != 0 {
            return Err(Error::invalid_argument(format!(
                "fill pattern of {} bytes does not tile a {} byte buffer",
                pattern.len(),
                self.inner.size
            )));
        }
        self.touch();
        queue.submit(Command::FillBuffer {
            dst: Arc::clone(&self.inner.native),
            pattern: pattern.to_vec(),
        })
    }

    pub fn zero(&self, queue: &Queue) -> Result<()> {
        self.fill(queue, &[0])
    }

    /// Copy the whole buffer into `destination`, which must be at least as large.
    pub fn copy_to(&self, queue: &Queue, destination: &Buffer) -> Result<()> {
        self.check_queue(queue)?;
        destination.check_queue(queue)?;
        if destination.size() < self.size() {
            return Err(Error::invalid_argument(format!(
                "copy destination holds {} bytes, source has {}",
                destination.size(),
                self.size()
            )));
        }
        destination.touch();
        queue.submit(Command::CopyBuffer {
            src: Arc::clone(&self.inner.native),
            dst: Arc::clone(&destination.inner.native),
            size: self.size(),
        })
    }

    /// Map the whole buffer for host access.
    pub fn map(&self, queue: &Queue, access: MapAccess) -> Result<MappedView> {
        if !self.is_host_visible() {
            return Err(Error::unsupported("buffer is not host-visible"));
        }
        self.check_queue(queue)?;
        let mut data = vec![0u8; self.inner.size as usize];
        if access.reads() {
            self.read(queue, &mut data)?;
        }
        Ok(MappedView::new(
            self.identity(),
            access,
            self.generation(),
            None,
            data,
        ))
    }

    /// Release a mapping, publishing its contents for writable access.
    ///
    /// Fails with a contract violation if a queue submission targeted the
    /// buffer after it was mapped; the view's writes are discarded.
    pub fn unmap(&self, queue: &Queue, view: MappedView) -> Result<()> {
        if view.owner() != self.identity() {
            return Err(Error::invalid_argument(
                "mapped view does not belong to this buffer",
            ));
        }
        if !view.access().writes() {
            return Ok(());
        }
        if view.generation() != self.generation() {
            return Err(Error::contract(
                "mapped view was invalidated by a queue submission; writes discarded",
            ));
        }
        self.write(queue, &view)
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("size", &self.inner.size)
            .field("flags", &self.inner.flags)
            .field("handle", &self.handle())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_need_access() {
        assert!(BufferFlags::HOST_VISIBLE.validate().is_err());
        assert!(BufferFlags::READ.validate().is_ok());
        assert!((BufferFlags::READ_WRITE | BufferFlags::HOST_VISIBLE)
            .validate()
            .is_ok());
    }

    #[test]
    fn test_host_visible_and_device_only_conflict() {
        let flags = BufferFlags::READ | BufferFlags::HOST_VISIBLE | BufferFlags::DEVICE_ONLY;
        let err = flags.validate().unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidArgument);
    }

    #[test]
    fn test_map_access_direction() {
        assert!(MapAccess::Read.reads());
        assert!(!MapAccess::Read.writes());
        assert!(MapAccess::ReadWrite.reads() && MapAccess::ReadWrite.writes());
        assert!(!MapAccess::WriteInvalidate.reads());
    }
}

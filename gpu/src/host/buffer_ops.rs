//! Host memory: buffers and images backed by process memory.

use std::any::Any;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::backend::{NativeBuffer, NativeImage};
use crate::descriptor_pool::DescriptorPool;
use crate::error::{Error, Result};
use crate::image::{ImageDesc, ImageRegion};

/// Tracks bytes allocated against the configured host memory size.
pub(crate) struct MemoryBudget {
    limit: u64,
    used: AtomicU64,
}

impl MemoryBudget {
    pub(crate) fn new(limit: u64) -> Arc<Self> {
        Arc::new(MemoryBudget {
            limit,
            used: AtomicU64::new(0),
        })
    }

    pub(crate) fn used(&self) -> u64 {
        self.used.load(Ordering::Acquire)
    }

    pub(crate) fn reserve(self: &Arc<Self>, size: u64) -> Result<Reservation> {
        let mut current = self.used.load(Ordering::Acquire);
        loop {
            let next = current.saturating_add(size);
            if next > self.limit {
                return Err(Error::out_of_memory(format!(
                    "host memory budget exhausted: {} of {} bytes in use, {} requested",
                    current, self.limit, size
                )));
            }
            match self
                .used
                .compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => {
                    return Ok(Reservation {
                        budget: Arc::clone(self),
                        size,
                    })
                }
                Err(actual) => current = actual,
            }
        }
    }
}

/// Bytes held against a [`MemoryBudget`] until dropped.
pub(crate) struct Reservation {
    budget: Arc<MemoryBudget>,
    size: u64,
}

impl Drop for Reservation {
    fn drop(&mut self) {
        self.budget.used.fetch_sub(self.size, Ordering::AcqRel);
    }
}

/// Byte-addressable memory shared between queue workers and kernels.
///
/// Every byte is an atomic so concurrent work-items may touch the same
/// allocation; ordering between them is the kernel's business.
pub struct HostMemory {
    bytes: Box<[AtomicU8]>,
    _reservation: Reservation,
}

impl HostMemory {
    pub(crate) fn new(size: usize, reservation: Reservation) -> Self {
        HostMemory {
            bytes: (0..size).map(|_| AtomicU8::new(0)).collect(),
            _reservation: reservation,
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Address of the first byte, used as the buffer handle.
    pub fn base_address(&self) -> u64 {
        self.bytes.as_ptr() as u64
    }

    pub fn read(&self, offset: usize, dst: &mut [u8]) {
        let len = dst.len();
        for (d, s) in dst.iter_mut().zip(&self.bytes[offset..offset + len]) {
            *d = s.load(Ordering::Relaxed);
        }
    }

    pub fn write(&self, offset: usize, src: &[u8]) {
        for (d, s) in self.bytes[offset..offset + src.len()].iter().zip(src) {
            d.store(*s, Ordering::Relaxed);
        }
    }

    pub fn to_vec(&self, offset: usize, len: usize) -> Vec<u8> {
        let mut out = vec![0u8; len];
        self.read(offset, &mut out);
        out
    }

    /// Repeat `pattern` over the whole allocation.
    pub fn fill(&self, pattern: &[u8]) {
        for (d, s) in self.bytes.iter().zip(pattern.iter().cycle()) {
            d.store(*s, Ordering::Relaxed);
        }
    }

    /// Element `index` of the memory viewed as an array of `T`.
    pub fn load<T: bytemuck::Pod>(&self, index: usize) -> T {
        let mut value = T::zeroed();
        self.read(index * std::mem::size_of::<T>(), bytemuck::bytes_of_mut(&mut value));
        value
    }

    pub fn store<T: bytemuck::Pod>(&self, index: usize, value: T) {
        self.write(index * std::mem::size_of::<T>(), bytemuck::bytes_of(&value));
    }
}

pub struct HostBuffer {
    memory: Arc<HostMemory>,
}

impl HostBuffer {
    pub(crate) fn new(memory: HostMemory) -> Self {
        HostBuffer {
            memory: Arc::new(memory),
        }
    }

    pub fn memory(&self) -> &HostMemory {
        &self.memory
    }
}

impl NativeBuffer for HostBuffer {
    fn handle(&self) -> u64 {
        self.memory.base_address()
    }

    fn size(&self) -> u64 {
        self.memory.len() as u64
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Entry in the host image descriptor table.
#[derive(Debug, Clone, Default)]
pub struct ImageSlot {
    pub desc: Option<ImageDesc>,
    pub base_address: u64,
}

pub(crate) type ImageTable = Arc<Mutex<DescriptorPool<ImageSlot>>>;

/// Image stored in host memory; its handle is its descriptor index + 1.
pub struct HostImage {
    memory: HostMemory,
    desc: ImageDesc,
    index: usize,
    table: ImageTable,
}

impl HostImage {
    pub(crate) fn new(memory: HostMemory, desc: ImageDesc, table: ImageTable) -> Self {
        let index = {
            let mut pool = table.lock();
            let (slot, index) = pool.acquire();
            slot.desc = Some(desc);
            slot.base_address = memory.base_address();
            index
        };
        HostImage {
            memory,
            desc,
            index,
            table,
        }
    }

    pub fn memory(&self) -> &HostMemory {
        &self.memory
    }

    pub fn descriptor_index(&self) -> usize {
        self.index
    }

    /// Byte offset of one texel in storage.
    pub fn texel_offset(&self, coord: [u32; 3], layer: u32, mip_level: u32) -> usize {
        let level = self.desc.level_extent(mip_level);
        let index = ((layer as u64 * level.z as u64 + coord[2] as u64) * level.y as u64
            + coord[1] as u64)
            * level.x as u64
            + coord[0] as u64;
        (self.desc.level_offset(mip_level) + index * self.desc.texel_size()) as usize
    }

    pub fn load_texel(&self, coord: [u32; 3], layer: u32, mip_level: u32, dst: &mut [u8]) {
        self.memory.read(self.texel_offset(coord, layer, mip_level), dst);
    }

    pub fn store_texel(&self, coord: [u32; 3], layer: u32, mip_level: u32, src: &[u8]) {
        self.memory.write(self.texel_offset(coord, layer, mip_level), src);
    }

    /// Copy `region` out of storage, packed.
    pub(crate) fn read_region(&self, region: &ImageRegion) -> Vec<u8> {
        let mut out = Vec::with_capacity(region.byte_len(&self.desc));
        for (offset, len) in self.desc.row_spans(region) {
            out.extend_from_slice(&self.memory.to_vec(offset as usize, len));
        }
        out
    }

    /// Copy packed `data` into `region`.
    pub(crate) fn write_region(&self, region: &ImageRegion, data: &[u8]) {
        let mut cursor = 0;
        for (offset, len) in self.desc.row_spans(region) {
            self.memory.write(offset as usize, &data[cursor..cursor + len]);
            cursor += len;
        }
    }
}

impl NativeImage for HostImage {
    fn handle(&self) -> u64 {
        self.index as u64 + 1
    }

    fn desc(&self) -> &ImageDesc {
        &self.desc
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl Drop for HostImage {
    fn drop(&mut self) {
        self.table.lock().release(self.index);
    }
}

pub(crate) fn host_buffer(native: &Arc<dyn NativeBuffer>) -> Result<&HostBuffer> {
    native
        .as_any()
        .downcast_ref::<HostBuffer>()
        .ok_or_else(|| Error::contract("buffer was not created by the host backend"))
}

pub(crate) fn host_image(native: &Arc<dyn NativeImage>) -> Result<&HostImage> {
    native
        .as_any()
        .downcast_ref::<HostImage>()
        .ok_or_else(|| Error::contract("image was not created by the host backend"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::{ImageKind, PixelFormat};

    #[test]
    fn test_budget_rejects_overcommit() {
        let budget = MemoryBudget::new(100);
        let first = budget.reserve(60).unwrap();
        assert_eq!(
            budget.reserve(50).err().map(|e| e.kind()),
            Some(crate::error::ErrorKind::OutOfMemory)
        );
        drop(first);
        assert_eq!(budget.used(), 0);
        assert!(budget.reserve(100).is_ok());
    }

    #[test]
    fn test_memory_typed_access() {
        let budget = MemoryBudget::new(1024);
        let memory = HostMemory::new(16, budget.reserve(16).unwrap());
        memory.store::<u32>(2, 0xdeadbeef);
        assert_eq!(memory.load::<u32>(2), 0xdeadbeef);
        memory.fill(&[1, 2]);
        assert_eq!(memory.to_vec(0, 4), vec![1, 2, 1, 2]);
    }

    #[test]
    fn test_image_descriptor_recycled_on_drop() {
        let budget = MemoryBudget::new(1 << 20);
        let table: ImageTable = Arc::new(Mutex::new(DescriptorPool::new(4, ImageSlot::default)));
        let desc = ImageDesc::new(ImageKind::D2, PixelFormat::R8Unorm, [4, 4]);
        let image = HostImage::new(
            HostMemory::new(16, budget.reserve(16).unwrap()),
            desc,
            Arc::clone(&table),
        );
        assert_eq!(image.handle(), 1);
        assert!(table.lock().get(0).and_then(|slot| slot.desc).is_some());
        drop(image);
        assert_eq!(table.lock().len(), 0);
    }

    #[test]
    fn test_region_round_trip() {
        let budget = MemoryBudget::new(1 << 20);
        let table: ImageTable = Arc::new(Mutex::new(DescriptorPool::new(4, ImageSlot::default)));
        let desc = ImageDesc::new(ImageKind::D2, PixelFormat::R8Unorm, [4, 4]);
        let image = HostImage::new(
            HostMemory::new(16, budget.reserve(16).unwrap()),
            desc,
            table,
        );
        let region = ImageRegion::new([1, 1, 0], [2, 2, 1]);
        image.write_region(&region, &[1, 2, 3, 4]);
        assert_eq!(image.memory().to_vec(4, 4), vec![0, 1, 2, 0]);
        assert_eq!(image.read_region(&region), vec![1, 2, 3, 4]);
    }
}

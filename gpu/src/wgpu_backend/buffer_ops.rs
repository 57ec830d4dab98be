//! WebGPU buffer operations: GPU memory allocation and data transfer

use std::any::Any;
use std::sync::atomic::{AtomicU64, Ordering};

use wgpu;
use wgpu::util::DeviceExt;

use super::device_init::WgpuShared;
use crate::backend::NativeBuffer;
use crate::error::{Error, Result};

/// wgpu copies and writes work in 4-byte units.
pub const COPY_ALIGN: u64 = wgpu::COPY_BUFFER_ALIGNMENT;

static NEXT_HANDLE: AtomicU64 = AtomicU64::new(1);

pub fn align_up(value: u64) -> u64 {
    value.div_ceil(COPY_ALIGN) * COPY_ALIGN
}

fn align_down(value: u64) -> u64 {
    value / COPY_ALIGN * COPY_ALIGN
}

/// WebGPU-specific GPU buffer wrapping a wgpu::Buffer.
///
/// The allocation is rounded up to a multiple of 4 bytes; `size` is the
/// size the caller asked for.
pub struct WgpuBuffer {
    pub(crate) buffer: wgpu::Buffer,
    size: u64,
    handle: u64,
}

impl WgpuBuffer {
    /// Allocate a buffer, optionally initialised from `contents`.
    pub fn allocate(shared: &WgpuShared, size: u64, contents: Option<&[u8]>) -> Result<Self> {
        if size == 0 {
            return Err(Error::invalid_argument("buffer size must be non-zero"));
        }
        let usage = wgpu::BufferUsages::STORAGE
            | wgpu::BufferUsages::COPY_SRC
            | wgpu::BufferUsages::COPY_DST;
        let padded = align_up(size);

        let buffer = match contents {
            Some(contents) => {
                let mut data = contents.to_vec();
                data.resize(padded as usize, 0);
                shared
                    .device
                    .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                        label: Some("lattice_buffer"),
                        contents: &data,
                        usage,
                    })
            }
            None => shared.device.create_buffer(&wgpu::BufferDescriptor {
                label: Some("lattice_buffer"),
                size: padded,
                usage,
                mapped_at_creation: false,
            }),
        };

        Ok(WgpuBuffer {
            buffer,
            size,
            handle: NEXT_HANDLE.fetch_add(1, Ordering::Relaxed),
        })
    }

    /// Write `data` at `offset`, widening unaligned writes with a
    /// read-modify-write of the surrounding words.
    pub fn write(&self, shared: &WgpuShared, offset: u64, data: &[u8]) -> Result<()> {
        let end = offset + data.len() as u64;
        if offset % COPY_ALIGN == 0 && end % COPY_ALIGN == 0 {
            shared.queue.write_buffer(&self.buffer, offset, data);
            return Ok(());
        }
        let start = align_down(offset);
        let mut words = self.read(shared, start, (align_up(end) - start) as usize)?;
        let at = (offset - start) as usize;
        words[at..at + data.len()].copy_from_slice(data);
        shared.queue.write_buffer(&self.buffer, start, &words);
        Ok(())
    }

    /// Read buffer contents back to CPU via staging buffer.
    pub fn read(&self, shared: &WgpuShared, offset: u64, len: usize) -> Result<Vec<u8>> {
        let start = align_down(offset);
        let end = align_up(offset + len as u64);
        let read_size = end - start;

        // Create staging buffer for readback
        let staging = shared.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("lattice_staging"),
            size: read_size,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let mut encoder = shared
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("lattice_readback"),
            });
        encoder.copy_buffer_to_buffer(&self.buffer, start, &staging, 0, read_size);
        shared.queue.submit(std::iter::once(encoder.finish()));

        let slice = staging.slice(..);
        let (tx, rx) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        shared.device.poll(wgpu::Maintain::Wait);

        match rx.recv() {
            Ok(Ok(())) => {
                let at = (offset - start) as usize;
                let data = slice.get_mapped_range()[at..at + len].to_vec();
                staging.unmap();
                Ok(data)
            }
            Ok(Err(e)) => Err(Error::driver(format!("buffer readback failed: {}", e))),
            Err(_) => Err(Error::driver("buffer readback was never completed")),
        }
    }

    pub fn fill(&self, shared: &WgpuShared, pattern: &[u8]) -> Result<()> {
        let data: Vec<u8> = pattern
            .iter()
            .copied()
            .cycle()
            .take(self.size as usize)
            .collect();
        self.write(shared, 0, &data)
    }

    pub fn copy_to(&self, shared: &WgpuShared, dst: &WgpuBuffer, size: u64) {
        let mut encoder = shared
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("lattice_copy"),
            });
        encoder.copy_buffer_to_buffer(&self.buffer, 0, &dst.buffer, 0, align_up(size));
        shared.queue.submit(std::iter::once(encoder.finish()));
    }
}

impl NativeBuffer for WgpuBuffer {
    /// WebGPU has no device addresses; handles are opaque unique ids.
    fn handle(&self) -> u64 {
        self.handle
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alignment_helpers() {
        assert_eq!(align_up(0), 0);
        assert_eq!(align_up(5), 8);
        assert_eq!(align_up(8), 8);
        assert_eq!(align_down(7), 4);
    }
}

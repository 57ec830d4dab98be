//! WebGPU compute dispatch: bind arguments and launch a kernel.

use std::num::NonZeroU64;

use wgpu;

use super::buffer_ops::{align_up, WgpuBuffer};
use super::compile::WgpuFunction;
use super::device_init::WgpuShared;
use crate::backend::{BoundValue, Dispatch, NativeBuffer};
use crate::error::{Error, Result};

pub(crate) fn wgpu_buffer(native: &dyn NativeBuffer) -> Result<&WgpuBuffer> {
    native
        .as_any()
        .downcast_ref::<WgpuBuffer>()
        .ok_or_else(|| Error::contract("buffer does not belong to the WebGPU backend"))
}

/// Encode and submit one dispatch.
pub fn encode(shared: &WgpuShared, dispatch: &Dispatch) -> Result<()> {
    let function = dispatch
        .function
        .as_any()
        .downcast_ref::<WgpuFunction>()
        .ok_or_else(|| Error::contract("function does not belong to the WebGPU backend"))?;

    let offset_align = shared.limits.min_storage_buffer_offset_alignment as u64;
    let mut entries = Vec::with_capacity(function.resource_bindings.len() + 1);

    if function.uses_argument_block {
        if dispatch.storage_offset % offset_align != 0 {
            return Err(Error::invalid_argument(format!(
                "argument buffer offset {} is not a multiple of {}",
                dispatch.storage_offset, offset_align
            )));
        }
        let storage = wgpu_buffer(dispatch.storage.as_ref())?;
        entries.push(wgpu::BindGroupEntry {
            binding: 0,
            resource: wgpu::BindingResource::Buffer(wgpu::BufferBinding {
                buffer: &storage.buffer,
                offset: dispatch.storage_offset,
                size: NonZeroU64::new(align_up(dispatch.blob_size)),
            }),
        });
    }

    for &(binding, slot) in &function.resource_bindings {
        let resource = match dispatch.arguments.values.get(slot) {
            Some(BoundValue::Buffer(buffer)) => {
                wgpu_buffer(buffer.as_ref())?.buffer.as_entire_binding()
            }
            Some(BoundValue::ArgumentBuffer {
                storage, offset, ..
            }) => wgpu::BindingResource::Buffer(wgpu::BufferBinding {
                buffer: &wgpu_buffer(storage.as_ref())?.buffer,
                offset: *offset,
                size: None,
            }),
            Some(BoundValue::Null) => shared.null_buffer.as_entire_binding(),
            _ => {
                return Err(Error::contract(format!(
                    "slot {} is not bound to a buffer",
                    slot
                )))
            }
        };
        entries.push(wgpu::BindGroupEntry { binding, resource });
    }

    let bind_group = shared.device.create_bind_group(&wgpu::BindGroupDescriptor {
        label: Some("lattice_bind_group"),
        layout: &function.bind_group_layout,
        entries: &entries,
    });

    let groups = dispatch.global.groups_for(dispatch.local);

    let mut encoder = shared
        .device
        .create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("lattice_dispatch"),
        });

    {
        let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: Some("lattice_compute_pass"),
            timestamp_writes: None,
        });
        pass.set_pipeline(&function.pipeline);
        pass.set_bind_group(0, &bind_group, &[]);
        pass.dispatch_workgroups(groups.x, groups.y, groups.z);
    }

    shared.queue.submit(std::iter::once(encoder.finish()));
    Ok(())
}

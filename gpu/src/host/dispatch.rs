//! Host kernel dispatch: runs work-groups in parallel on the rayon pool.

use rayon::prelude::*;
use rayon::ThreadPool;

use super::buffer_ops::{HostBuffer, HostImage, HostMemory};
use super::compile::HostFunction;
use crate::backend::{BoundValue, Dispatch};
use crate::error::{Error, Result};
use crate::sampler::SamplerDescriptor;
use crate::types::Extent3;

/// Position of one work-item in the launch grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkItem {
    pub global_id: [u32; 3],
    pub local_id: [u32; 3],
    pub group_id: [u32; 3],
    pub global_size: [u32; 3],
    pub local_size: [u32; 3],
}

impl WorkItem {
    /// Row-major linear index of the global id.
    pub fn global_linear(&self) -> u64 {
        let [x, y, z] = self.global_id;
        let [sx, sy, _] = self.global_size;
        (z as u64 * sy as u64 + y as u64) * sx as u64 + x as u64
    }
}

/// Kernel-side view of the bound arguments.
///
/// Accessors return `None` when the slot holds something else, or is null.
#[derive(Clone, Copy)]
pub struct HostArgs<'a> {
    values: &'a [BoundValue],
}

impl<'a> HostArgs<'a> {
    pub(crate) fn new(values: &'a [BoundValue]) -> Self {
        HostArgs { values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn is_null(&self, index: usize) -> bool {
        matches!(self.values.get(index), Some(BoundValue::Null))
    }

    pub fn scalar<T: bytemuck::Pod>(&self, index: usize) -> Option<T> {
        self.scalar_at(index, 0)
    }

    /// Element `element` of an array scalar slot.
    pub fn scalar_at<T: bytemuck::Pod>(&self, index: usize, element: usize) -> Option<T> {
        match self.values.get(index) {
            Some(BoundValue::Scalar(bytes)) => {
                let size = std::mem::size_of::<T>();
                let start = element * size;
                let mut raw = bytes.get(start..start + size)?.to_vec();
                if cfg!(target_endian = "big") {
                    raw.reverse();
                }
                Some(bytemuck::pod_read_unaligned(&raw))
            }
            _ => None,
        }
    }

    pub fn buffer(&self, index: usize) -> Option<&'a HostMemory> {
        match self.values.get(index) {
            Some(BoundValue::Buffer(native)) => native
                .as_any()
                .downcast_ref::<HostBuffer>()
                .map(HostBuffer::memory),
            _ => None,
        }
    }

    pub fn image(&self, index: usize) -> Option<&'a HostImage> {
        match self.values.get(index) {
            Some(BoundValue::Image(native)) => native.as_any().downcast_ref::<HostImage>(),
            _ => None,
        }
    }

    pub fn sampler(&self, index: usize) -> Option<SamplerDescriptor> {
        match self.values.get(index) {
            Some(BoundValue::Sampler(sampler)) => Some(*sampler),
            _ => None,
        }
    }

    /// Arguments of a nested argument buffer.
    pub fn nested(&self, index: usize) -> Option<HostArgs<'a>> {
        match self.values.get(index) {
            Some(BoundValue::ArgumentBuffer { arguments, .. }) => Some(HostArgs {
                values: &arguments.values,
            }),
            _ => None,
        }
    }
}

/// Run every work-item of `dispatch`. Work-groups run in parallel, the items
/// of one group run in order on one thread.
pub(crate) fn run(dispatch: &Dispatch, pool: &ThreadPool) -> Result<()> {
    let function = dispatch
        .function
        .as_any()
        .downcast_ref::<HostFunction>()
        .ok_or_else(|| Error::contract("function was not compiled by the host backend"))?;
    let entry = function.entry;
    let args = HostArgs::new(&dispatch.arguments.values);
    let global = dispatch.global;
    let local = dispatch.local;
    let groups = global.groups_for(local);
    let group_count = groups.product();

    pool.install(|| {
        (0..group_count).into_par_iter().for_each(|linear| {
            let group = unflatten(linear, groups);
            run_group(group, global, local, entry, &args);
        })
    });
    Ok(())
}

fn unflatten(linear: u64, groups: Extent3) -> [u32; 3] {
    let x = linear % groups.x as u64;
    let y = (linear / groups.x as u64) % groups.y as u64;
    let z = linear / (groups.x as u64 * groups.y as u64);
    [x as u32, y as u32, z as u32]
}

/// Global id of `local_id` in `group`. Past the last full group this can
/// exceed `u32::MAX`.
fn global_index(group: u32, local: u32, local_id: u32) -> u64 {
    group as u64 * local as u64 + local_id as u64
}

fn run_group(
    group: [u32; 3],
    global: Extent3,
    local: Extent3,
    entry: super::compile::HostKernelFn,
    args: &HostArgs<'_>,
) {
    let global_size = global.as_array();
    let local_size = local.as_array();
    for lz in 0..local.z {
        for ly in 0..local.y {
            for lx in 0..local.x {
                let local_id = [lx, ly, lz];
                let wide = [
                    global_index(group[0], local.x, lx),
                    global_index(group[1], local.y, ly),
                    global_index(group[2], local.z, lz),
                ];
                // partial groups at the grid edge
                if wide.iter().zip(&global_size).any(|(id, size)| *id >= *size as u64) {
                    continue;
                }
                let item = WorkItem {
                    global_id: wide.map(|id| id as u32),
                    local_id,
                    group_id: group,
                    global_size,
                    local_size,
                };
                entry(&item, args);
            }
        }
    }
}

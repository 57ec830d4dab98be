//! WGSL shader compilation: WGSL source to wgpu::ComputePipeline
//!
//! Binding convention for group 0: binding 0 is the serialised argument
//! block (read-only storage), binding `i + 1` is resource slot `i`. Scalar
//! and sampler slots live only in the argument block.

use std::any::Any;

use wgpu;

use super::device_init::WgpuShared;
use crate::backend::NativeFunction;
use crate::error::{Error, Result};
use crate::function::{ArgumentLayout, BinaryFormat, ProgramBinary, Signature, SlotKind};

/// A compiled wgpu compute kernel ready for dispatch.
pub struct WgpuFunction {
    pub(crate) pipeline: wgpu::ComputePipeline,
    pub(crate) bind_group_layout: wgpu::BindGroupLayout,
    /// `(binding, slot index)` for every buffer-backed slot
    pub(crate) resource_bindings: Vec<(u32, usize)>,
    pub(crate) uses_argument_block: bool,
    entry_point: String,
}

impl NativeFunction for WgpuFunction {
    fn entry_point(&self) -> &str {
        &self.entry_point
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

fn storage_entry(binding: u32, read_only: bool) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Storage { read_only },
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

/// Compile WGSL source code into a compute pipeline with an explicit layout
/// derived from `signature`.
pub fn compile_wgsl(
    shared: &WgpuShared,
    binary: &ProgramBinary,
    entry: &str,
    signature: &Signature,
) -> Result<WgpuFunction> {
    if binary.format() != BinaryFormat::Wgsl {
        return Err(Error::invalid_argument(format!(
            "bad binary: the WebGPU backend cannot load {:?} programs",
            binary.format()
        )));
    }
    let source = std::str::from_utf8(binary.bytes())
        .map_err(|_| Error::invalid_argument("bad binary: WGSL source is not UTF-8"))?;
    // cheap pre-check so a typo reports NotFound instead of a validation dump
    if !source.contains(&format!("fn {}", entry)) {
        return Err(Error::not_found(format!(
            "entry point '{}' is not defined in the WGSL module",
            entry
        )));
    }

    let layout = ArgumentLayout::for_signature(signature);
    let uses_argument_block = layout.size() > 0;
    let mut entries = Vec::new();
    if uses_argument_block {
        entries.push(storage_entry(0, true));
    }
    let mut resource_bindings = Vec::new();
    for (index, slot) in signature.slots().iter().enumerate() {
        let binding = index as u32 + 1;
        match slot.kind {
            SlotKind::Buffer => entries.push(storage_entry(binding, false)),
            SlotKind::ArgumentBuffer => entries.push(storage_entry(binding, true)),
            SlotKind::Image => {
                return Err(Error::unsupported(
                    "image arguments are not available on the WebGPU backend",
                ))
            }
            SlotKind::Scalar { .. } | SlotKind::Sampler => continue,
        }
        resource_bindings.push((binding, index));
    }

    let device = &shared.device;
    device.push_error_scope(wgpu::ErrorFilter::Validation);

    let shader_module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
        label: Some("lattice_compute_shader"),
        source: wgpu::ShaderSource::Wgsl(source.into()),
    });
    let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
        label: Some("lattice_arguments"),
        entries: &entries,
    });
    let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
        label: Some("lattice_pipeline_layout"),
        bind_group_layouts: &[&bind_group_layout],
        push_constant_ranges: &[],
    });
    let pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
        label: Some("lattice_compute_pipeline"),
        layout: Some(&pipeline_layout),
        module: &shader_module,
        entry_point: Some(entry),
        compilation_options: Default::default(),
        cache: None,
    });

    if let Some(error) = pollster::block_on(device.pop_error_scope()) {
        return Err(Error::invalid_argument(format!("bad binary: {}", error)));
    }

    log::debug!(
        "compiled WGSL entry '{}' ({} resource bindings)",
        entry,
        resource_bindings.len()
    );

    Ok(WgpuFunction {
        pipeline,
        bind_group_layout,
        resource_bindings,
        uses_argument_block,
        entry_point: entry.to_string(),
    })
}

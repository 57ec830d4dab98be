//! Argument buffers: serialised binding sets for one function.
//!
//! [`ArgumentBuffer::set_arguments`] checks every argument before writing
//! anything, then serialises them with the function's [`ArgumentLayout`] and
//! writes the blob through a queue, so dispatches submitted earlier still see
//! the previous bindings.
//!
//! When a nested argument buffer lives in the same storage buffer as its
//! parent and their byte ranges overlap, the nested buffer's contents win:
//! the parent does not write the aliased bytes and only stores the nested
//! buffer's handle in its own slot.

use std::ops::Range;
use std::sync::Arc;

use parking_lot::RwLock;
use smallvec::SmallVec;

use crate::backend::{BoundArguments, BoundValue};
use crate::buffer::Buffer;
use crate::error::{Error, Result};
use crate::function::{ArgumentLayout, Function, ScalarType, SlotKind};
use crate::image::Image;
use crate::queue::Queue;
use crate::sampler::SamplerDescriptor;

/// Deepest chain of nested argument buffers a dispatch may reference.
pub const MAX_NESTING_DEPTH: usize = 8;

/// Plain values that can fill a scalar slot.
pub trait ScalarValue: bytemuck::Pod {
    const TYPE: ScalarType;
}

macro_rules! scalar_values {
    ($($ty:ty => $scalar:ident),* $(,)?) => {
        $(
            impl ScalarValue for $ty {
                const TYPE: ScalarType = ScalarType::$scalar;
            }

            impl<'a> From<$ty> for Arg<'a> {
                fn from(value: $ty) -> Self {
                    Arg::Scalar(ScalarArg::new(value))
                }
            }
        )*
    };
}

scalar_values! {
    u8 => U8,
    i8 => I8,
    u16 => U16,
    i16 => I16,
    u32 => U32,
    i32 => I32,
    u64 => U64,
    i64 => I64,
    f32 => F32,
    f64 => F64,
}

/// Typed little-endian bytes for a scalar slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScalarArg {
    ty: ScalarType,
    count: u32,
    bytes: SmallVec<[u8; 16]>,
}

impl ScalarArg {
    pub fn new<T: ScalarValue>(value: T) -> Self {
        Self::array(std::slice::from_ref(&value))
    }

    pub fn array<T: ScalarValue>(values: &[T]) -> Self {
        let mut bytes = SmallVec::new();
        for value in values {
            let mut raw = bytemuck::bytes_of(value).to_vec();
            if cfg!(target_endian = "big") {
                raw.reverse();
            }
            bytes.extend_from_slice(&raw);
        }
        ScalarArg {
            ty: T::TYPE,
            count: values.len() as u32,
            bytes,
        }
    }

    /// Half-precision value given by its IEEE 754 bit pattern.
    pub fn f16_bits(bits: u16) -> Self {
        ScalarArg {
            ty: ScalarType::F16,
            count: 1,
            bytes: SmallVec::from_slice(&bits.to_le_bytes()),
        }
    }

    pub fn scalar_type(&self) -> ScalarType {
        self.ty
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }
}

/// One argument passed to [`ArgumentBuffer::set_arguments`].
#[derive(Debug, Clone)]
pub enum Arg<'a> {
    Scalar(ScalarArg),
    Buffer(&'a Buffer),
    Image(&'a Image),
    Sampler(SamplerDescriptor),
    ArgumentBuffer(&'a ArgumentBuffer),
    /// Only legal for nullable resource slots
    Null,
}

impl<'a> From<ScalarArg> for Arg<'a> {
    fn from(value: ScalarArg) -> Self {
        Arg::Scalar(value)
    }
}

impl<'a> From<&'a Buffer> for Arg<'a> {
    fn from(buffer: &'a Buffer) -> Self {
        Arg::Buffer(buffer)
    }
}

impl<'a> From<&'a Image> for Arg<'a> {
    fn from(image: &'a Image) -> Self {
        Arg::Image(image)
    }
}

impl<'a> From<SamplerDescriptor> for Arg<'a> {
    fn from(sampler: SamplerDescriptor) -> Self {
        Arg::Sampler(sampler)
    }
}

impl<'a> From<&'a ArgumentBuffer> for Arg<'a> {
    fn from(arguments: &'a ArgumentBuffer) -> Self {
        Arg::ArgumentBuffer(arguments)
    }
}

/// Owned form of an argument, kept so dispatches can resolve resources.
#[derive(Clone)]
enum Binding {
    Scalar(SmallVec<[u8; 16]>),
    Buffer(Buffer),
    Image(Image),
    Sampler(SamplerDescriptor),
    ArgumentBuffer(ArgumentBuffer),
    Null,
}

pub(crate) struct ArgumentBufferInner {
    function: Function,
    storage: Buffer,
    offset: u64,
    bindings: RwLock<Option<Vec<Binding>>>,
    label: RwLock<Option<String>>,
}

#[derive(Clone)]
pub struct ArgumentBuffer {
    inner: Arc<ArgumentBufferInner>,
}

impl ArgumentBuffer {
    pub(crate) fn new(function: Function, storage: Buffer, offset: u64) -> Self {
        ArgumentBuffer {
            inner: Arc::new(ArgumentBufferInner {
                function,
                storage,
                offset,
                bindings: RwLock::new(None),
                label: RwLock::new(None),
            }),
        }
    }

    pub fn function(&self) -> &Function {
        &self.inner.function
    }

    pub fn storage(&self) -> &Buffer {
        &self.inner.storage
    }

    /// Byte offset of the blob inside the storage buffer.
    pub fn offset(&self) -> u64 {
        self.inner.offset
    }

    pub fn layout(&self) -> &ArgumentLayout {
        self.inner.function.layout()
    }

    /// Handle stored in a parent's argument-buffer slot.
    pub fn handle(&self) -> u64 {
        self.inner.storage.handle().wrapping_add(self.inner.offset)
    }

    /// Whether `set_arguments` has succeeded at least once.
    pub fn is_set(&self) -> bool {
        self.inner.bindings.read().is_some()
    }

    pub fn set_debug_label(&self, label: &str) {
        *self.inner.label.write() = Some(label.to_string());
    }

    pub fn debug_label(&self) -> Option<String> {
        self.inner.label.read().clone()
    }

    pub fn ptr_eq(&self, other: &ArgumentBuffer) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn byte_range(&self) -> Range<u64> {
        self.inner.offset..self.inner.offset + self.layout().size() as u64
    }

    /// Bind `args` to the function's slots and write the serialised blob.
    pub fn set_arguments(&self, queue: &Queue, args: &[Arg<'_>]) -> Result<()> {
        let function = &self.inner.function;
        queue
            .device()
            .ensure_same(self.inner.storage.device(), "argument buffer")?;

        let slots = function.signature().slots();
        if args.len() != slots.len() {
            return Err(Error::invalid_argument(format!(
                "'{}' takes {} arguments, got {}",
                function.entry_point(),
                slots.len(),
                args.len()
            )));
        }

        let device = function.device();
        let mut bindings = Vec::with_capacity(args.len());
        for (index, (slot, arg)) in slots.iter().zip(args).enumerate() {
            let mismatch = || {
                Error::invalid_argument(format!(
                    "argument {} of '{}' must be {:?}, got {}",
                    index,
                    function.entry_point(),
                    slot.kind,
                    arg_name(arg)
                ))
            };
            let binding = match (slot.kind, arg) {
                (SlotKind::Scalar { ty, count }, Arg::Scalar(value)) => {
                    if value.ty != ty || value.count != count {
                        return Err(mismatch());
                    }
                    Binding::Scalar(value.bytes.clone())
                }
                (SlotKind::Buffer, Arg::Buffer(buffer)) => {
                    device.ensure_same(buffer.device(), "buffer argument")?;
                    Binding::Buffer((*buffer).clone())
                }
                (SlotKind::Image, Arg::Image(image)) => {
                    device.ensure_same(image.device(), "image argument")?;
                    Binding::Image((*image).clone())
                }
                (SlotKind::Sampler, Arg::Sampler(sampler)) => Binding::Sampler(*sampler),
                (SlotKind::ArgumentBuffer, Arg::ArgumentBuffer(nested)) => {
                    device.ensure_same(nested.storage().device(), "argument buffer argument")?;
                    if nested.ptr_eq(self) {
                        return Err(Error::invalid_argument(format!(
                            "argument {} refers to the argument buffer being set",
                            index
                        )));
                    }
                    if !nested.is_set() {
                        return Err(Error::invalid_argument(format!(
                            "nested argument buffer for argument {} has no arguments",
                            index
                        )));
                    }
                    Binding::ArgumentBuffer((*nested).clone())
                }
                (kind, Arg::Null) if kind.is_resource() => {
                    if !slot.nullable {
                        return Err(Error::invalid_argument(format!(
                            "argument {} of '{}' is a required {:?} and cannot be null",
                            index,
                            function.entry_point(),
                            kind
                        )));
                    }
                    Binding::Null
                }
                _ => return Err(mismatch()),
            };
            bindings.push(binding);
        }

        let blob = self.serialise(&bindings);
        for segment in self.write_segments(&bindings) {
            let start = segment.start as usize;
            let end = segment.end as usize;
            self.inner
                .storage
                .write_at(queue, self.inner.offset + segment.start, &blob[start..end])?;
        }
        log::debug!(
            "bound {} arguments for '{}' ({} bytes)",
            bindings.len(),
            function.entry_point(),
            blob.len()
        );
        *self.inner.bindings.write() = Some(bindings);
        Ok(())
    }

    fn serialise(&self, bindings: &[Binding]) -> Vec<u8> {
        let layout = self.layout();
        let mut blob = vec![0u8; layout.size()];
        for (index, binding) in bindings.iter().enumerate() {
            let range = layout.slot_range(index);
            let dst = &mut blob[range];
            match binding {
                Binding::Scalar(bytes) => dst.copy_from_slice(bytes),
                Binding::Buffer(buffer) => dst.copy_from_slice(&buffer.handle().to_le_bytes()),
                Binding::Image(image) => dst.copy_from_slice(&image.handle().to_le_bytes()),
                Binding::Sampler(sampler) => dst.copy_from_slice(&sampler.encode().to_le_bytes()),
                Binding::ArgumentBuffer(nested) => {
                    dst.copy_from_slice(&nested.handle().to_le_bytes())
                }
                Binding::Null => dst.fill(0),
            }
        }
        blob
    }

    /// Blob-relative byte ranges this buffer writes, skipping bytes owned by
    /// nested argument buffers that alias the same storage.
    fn write_segments(&self, bindings: &[Binding]) -> Vec<Range<u64>> {
        let own = self.byte_range();
        let mut aliased: Vec<Range<u64>> = bindings
            .iter()
            .filter_map(|binding| match binding {
                Binding::ArgumentBuffer(nested)
                    if nested.storage().ptr_eq(&self.inner.storage) =>
                {
                    let theirs = nested.byte_range();
                    let start = theirs.start.max(own.start);
                    let end = theirs.end.min(own.end);
                    (start < end).then(|| start - own.start..end - own.start)
                }
                _ => None,
            })
            .collect();
        aliased.sort_by_key(|r| r.start);

        let mut segments = Vec::new();
        let mut cursor = 0u64;
        let total = own.end - own.start;
        for hole in aliased {
            if hole.start > cursor {
                segments.push(cursor..hole.start);
            }
            cursor = cursor.max(hole.end);
        }
        if cursor < total {
            segments.push(cursor..total);
        }
        segments
    }

    /// Resolve the current bindings for a dispatch and mark every referenced
    /// resource as targeted by a queue submission.
    pub(crate) fn bind_for_dispatch(&self) -> Result<Arc<BoundArguments>> {
        self.resolve(0)
    }

    fn resolve(&self, depth: usize) -> Result<Arc<BoundArguments>> {
        if depth > MAX_NESTING_DEPTH {
            return Err(Error::invalid_argument(format!(
                "argument buffers nest deeper than {}",
                MAX_NESTING_DEPTH
            )));
        }
        let bindings = match self.inner.bindings.read().clone() {
            Some(bindings) => bindings,
            None => {
                return Err(Error::invalid_argument(format!(
                    "arguments for '{}' were never set",
                    self.inner.function.entry_point()
                )))
            }
        };
        self.inner.storage.touch();
        let mut values = Vec::with_capacity(bindings.len());
        for binding in &bindings {
            let value = match binding {
                Binding::Scalar(bytes) => BoundValue::Scalar(bytes.clone()),
                Binding::Buffer(buffer) => {
                    buffer.touch();
                    BoundValue::Buffer(Arc::clone(buffer.native()))
                }
                Binding::Image(image) => {
                    image.touch();
                    BoundValue::Image(Arc::clone(image.native()))
                }
                Binding::Sampler(sampler) => BoundValue::Sampler(*sampler),
                Binding::ArgumentBuffer(nested) => BoundValue::ArgumentBuffer {
                    storage: Arc::clone(nested.storage().native()),
                    offset: nested.offset(),
                    arguments: nested.resolve(depth + 1)?,
                },
                Binding::Null => BoundValue::Null,
            };
            values.push(value);
        }
        Ok(Arc::new(BoundArguments { values }))
    }
}

fn arg_name(arg: &Arg<'_>) -> String {
    match arg {
        Arg::Scalar(value) => format!("{:?} x{}", value.ty, value.count),
        Arg::Buffer(_) => "a buffer".to_string(),
        Arg::Image(_) => "an image".to_string(),
        Arg::Sampler(_) => "a sampler".to_string(),
        Arg::ArgumentBuffer(_) => "an argument buffer".to_string(),
        Arg::Null => "null".to_string(),
    }
}

impl std::fmt::Debug for ArgumentBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArgumentBuffer")
            .field("function", &self.inner.function.entry_point())
            .field("offset", &self.inner.offset)
            .field("set", &self.is_set())
            .finish()
    }
}

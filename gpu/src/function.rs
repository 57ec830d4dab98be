//! Compiled functions, their argument signatures and the argument layout.
//!
//! Layout convention (fixed, part of the function-compilation contract):
//!
//! ```text
//! scalar(T, n)      size_of(T) * n bytes, aligned to size_of(T)
//! buffer / image    8-byte little-endian handle, 8-aligned
//! argument buffer   8-byte little-endian handle, 8-aligned
//! sampler           4-byte encoded sampler word, 4-aligned
//! ```
//!
//! Slots are placed in signature order at the next aligned offset and the
//! total is rounded up to 16 bytes.

use std::ops::Range;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::backend::NativeFunction;
use crate::device::Device;
use crate::error::{Error, Result};

/// Argument blobs are padded to this many bytes.
pub const ARGUMENT_BLOCK_ALIGN: usize = 16;

const HANDLE_SIZE: usize = 8;
const SAMPLER_SIZE: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScalarType {
    U8,
    I8,
    U16,
    I16,
    U32,
    I32,
    U64,
    I64,
    F16,
    F32,
    F64,
}

impl ScalarType {
    pub const fn size_of(self) -> usize {
        match self {
            ScalarType::U8 | ScalarType::I8 => 1,
            ScalarType::U16 | ScalarType::I16 | ScalarType::F16 => 2,
            ScalarType::U32 | ScalarType::I32 | ScalarType::F32 => 4,
            ScalarType::U64 | ScalarType::I64 | ScalarType::F64 => 8,
        }
    }
}

/// Type of one signature slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SlotKind {
    Scalar { ty: ScalarType, count: u32 },
    Buffer,
    Image,
    Sampler,
    ArgumentBuffer,
}

impl SlotKind {
    pub const fn scalar(ty: ScalarType) -> Self {
        SlotKind::Scalar { ty, count: 1 }
    }

    pub const fn scalars(ty: ScalarType, count: u32) -> Self {
        SlotKind::Scalar { ty, count }
    }

    pub fn size(&self) -> usize {
        match *self {
            SlotKind::Scalar { ty, count } => ty.size_of() * count as usize,
            SlotKind::Sampler => SAMPLER_SIZE,
            SlotKind::Buffer | SlotKind::Image | SlotKind::ArgumentBuffer => HANDLE_SIZE,
        }
    }

    pub fn align(&self) -> usize {
        match *self {
            SlotKind::Scalar { ty, .. } => ty.size_of(),
            SlotKind::Sampler => SAMPLER_SIZE,
            SlotKind::Buffer | SlotKind::Image | SlotKind::ArgumentBuffer => HANDLE_SIZE,
        }
    }

    /// Slots that reference another object and may be declared nullable.
    pub fn is_resource(&self) -> bool {
        matches!(
            self,
            SlotKind::Buffer | SlotKind::Image | SlotKind::ArgumentBuffer
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Slot {
    pub kind: SlotKind,
    pub nullable: bool,
}

impl Slot {
    pub const fn new(kind: SlotKind) -> Self {
        Slot {
            kind,
            nullable: false,
        }
    }

    pub const fn nullable(kind: SlotKind) -> Self {
        Slot {
            kind,
            nullable: true,
        }
    }
}

impl From<SlotKind> for Slot {
    fn from(kind: SlotKind) -> Self {
        Slot::new(kind)
    }
}

/// Ordered argument signature of a function.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Signature {
    slots: Vec<Slot>,
}

impl Signature {
    pub fn new(slots: Vec<Slot>) -> Self {
        Signature { slots }
    }

    /// Signature whose slots are all non-nullable.
    pub fn from_kinds(kinds: &[SlotKind]) -> Self {
        Signature {
            slots: kinds.iter().copied().map(Slot::new).collect(),
        }
    }

    pub fn slots(&self) -> &[Slot] {
        &self.slots
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Whether the slot kinds equal `kinds`, ignoring nullability.
    pub fn matches_kinds(&self, kinds: &[SlotKind]) -> bool {
        self.slots.len() == kinds.len()
            && self.slots.iter().zip(kinds).all(|(slot, kind)| slot.kind == *kind)
    }

    pub fn validate(&self) -> Result<()> {
        for (index, slot) in self.slots.iter().enumerate() {
            if let SlotKind::Scalar { count: 0, .. } = slot.kind {
                return Err(Error::invalid_argument(format!(
                    "slot {} declares a zero-length scalar",
                    index
                )));
            }
            if slot.nullable && !slot.kind.is_resource() {
                return Err(Error::invalid_argument(format!(
                    "slot {} is nullable but {:?} is not a resource",
                    index, slot.kind
                )));
            }
        }
        Ok(())
    }
}

/// Byte offsets of each slot in an argument blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArgumentLayout {
    offsets: Vec<usize>,
    sizes: Vec<usize>,
    size: usize,
}

impl ArgumentLayout {
    pub fn for_signature(signature: &Signature) -> Self {
        let mut offsets = Vec::with_capacity(signature.len());
        let mut sizes = Vec::with_capacity(signature.len());
        let mut cursor = 0usize;
        for slot in signature.slots() {
            let align = slot.kind.align().max(1);
            cursor = cursor.next_multiple_of(align);
            offsets.push(cursor);
            sizes.push(slot.kind.size());
            cursor += slot.kind.size();
        }
        ArgumentLayout {
            offsets,
            sizes,
            size: cursor.next_multiple_of(ARGUMENT_BLOCK_ALIGN),
        }
    }

    pub fn offset(&self, index: usize) -> usize {
        self.offsets[index]
    }

    pub fn slot_range(&self, index: usize) -> Range<usize> {
        self.offsets[index]..self.offsets[index] + self.sizes[index]
    }

    /// Total blob size, a multiple of 16.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BinaryFormat {
    /// Manifest of kernels registered with the host backend
    HostModule,
    Wgsl,
    SpirV,
    Ptx,
    MetalLib,
    OpenClSource,
}

/// First line of a host module binary.
pub const HOST_MODULE_MAGIC: &str = "lattice-host-module";

/// Backend program in one of the known formats.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProgramBinary {
    format: BinaryFormat,
    bytes: Vec<u8>,
}

impl ProgramBinary {
    pub fn new(format: BinaryFormat, bytes: impl Into<Vec<u8>>) -> Self {
        ProgramBinary {
            format,
            bytes: bytes.into(),
        }
    }

    /// Host module exporting the named kernels.
    pub fn host_module(entries: &[&str]) -> Self {
        let mut text = String::from(HOST_MODULE_MAGIC);
        for entry in entries {
            text.push('\n');
            text.push_str(entry);
        }
        Self::new(BinaryFormat::HostModule, text.into_bytes())
    }

    pub fn wgsl(source: &str) -> Self {
        Self::new(BinaryFormat::Wgsl, source.as_bytes())
    }

    pub fn format(&self) -> BinaryFormat {
        self.format
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }
}

pub(crate) struct FunctionInner {
    device: Device,
    entry: String,
    signature: Signature,
    layout: ArgumentLayout,
    native: Arc<dyn NativeFunction>,
    label: RwLock<Option<String>>,
}

/// Compiled, immutable callable on one device.
#[derive(Clone)]
pub struct Function {
    inner: Arc<FunctionInner>,
}

impl Function {
    pub(crate) fn new(
        device: Device,
        entry: &str,
        signature: Signature,
        native: Arc<dyn NativeFunction>,
    ) -> Self {
        let layout = ArgumentLayout::for_signature(&signature);
        Function {
            inner: Arc::new(FunctionInner {
                device,
                entry: entry.to_string(),
                signature,
                layout,
                native,
                label: RwLock::new(None),
            }),
        }
    }

    pub fn signature(&self) -> &Signature {
        &self.inner.signature
    }

    pub fn device(&self) -> &Device {
        &self.inner.device
    }

    pub fn entry_point(&self) -> &str {
        &self.inner.entry
    }

    pub fn layout(&self) -> &ArgumentLayout {
        &self.inner.layout
    }

    pub fn set_debug_label(&self, label: &str) {
        *self.inner.label.write() = Some(label.to_string());
    }

    pub fn debug_label(&self) -> Option<String> {
        self.inner.label.read().clone()
    }

    pub(crate) fn native(&self) -> &Arc<dyn NativeFunction> {
        &self.inner.native
    }

    pub fn ptr_eq(&self, other: &Function) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl std::fmt::Debug for Function {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Function")
            .field("entry", &self.inner.entry)
            .field("signature", &self.inner.signature)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalar_then_buffer_layout() {
        let sig = Signature::from_kinds(&[SlotKind::scalar(ScalarType::U32), SlotKind::Buffer]);
        let layout = ArgumentLayout::for_signature(&sig);
        assert_eq!(layout.offset(0), 0);
        assert_eq!(layout.offset(1), 8);
        assert_eq!(layout.size(), 16);
    }

    #[test]
    fn test_mixed_alignment() {
        let sig = Signature::from_kinds(&[
            SlotKind::scalar(ScalarType::U8),
            SlotKind::scalar(ScalarType::U16),
            SlotKind::Sampler,
            SlotKind::scalars(ScalarType::F32, 3),
            SlotKind::Image,
            SlotKind::scalar(ScalarType::F64),
        ]);
        let layout = ArgumentLayout::for_signature(&sig);
        assert_eq!(layout.offset(0), 0);
        assert_eq!(layout.offset(1), 2);
        assert_eq!(layout.offset(2), 4);
        assert_eq!(layout.offset(3), 8);
        assert_eq!(layout.slot_range(3), 8..20);
        assert_eq!(layout.offset(4), 24);
        assert_eq!(layout.offset(5), 32);
        assert_eq!(layout.size(), 48);
    }

    #[test]
    fn test_empty_signature() {
        let layout = ArgumentLayout::for_signature(&Signature::default());
        assert!(layout.is_empty());
        assert_eq!(layout.size(), 0);
    }

    #[test]
    fn test_nullable_scalar_rejected() {
        let sig = Signature::new(vec![Slot::nullable(SlotKind::scalar(ScalarType::I32))]);
        assert!(sig.validate().is_err());
        let sig = Signature::new(vec![Slot::nullable(SlotKind::Buffer)]);
        assert!(sig.validate().is_ok());
    }

    #[test]
    fn test_host_module_binary() {
        let binary = ProgramBinary::host_module(&["fill", "scale"]);
        assert_eq!(binary.format(), BinaryFormat::HostModule);
        assert_eq!(binary.bytes(), b"lattice-host-module\nfill\nscale");
        let other = ProgramBinary::host_module(&["fill"]);
        assert_ne!(binary, other);
    }
}

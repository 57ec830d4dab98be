//! Host "compilation": resolving kernels named by a host module.
//!
//! Host kernels are plain Rust functions. They are registered at link time
//! with [`host_kernel!`](crate::host_kernel) or at runtime with
//! [`register_kernel`], and a [`ProgramBinary::host_module`] lists the ones a
//! program exports.

use std::any::Any;

use fxhash::FxHashMap;
use lazy_static::lazy_static;
use parking_lot::RwLock;

use super::dispatch::{HostArgs, WorkItem};
use crate::backend::NativeFunction;
use crate::error::{Error, Result};
use crate::function::{BinaryFormat, ProgramBinary, Signature, SlotKind, HOST_MODULE_MAGIC};

/// Entry point of a host kernel, called once per work-item.
pub type HostKernelFn = fn(&WorkItem, &HostArgs<'_>);

/// Link-time kernel registration, submitted by [`host_kernel!`](crate::host_kernel).
pub struct HostKernel {
    pub name: &'static str,
    pub signature: &'static [SlotKind],
    pub entry: HostKernelFn,
}

inventory::collect!(HostKernel);

/// Register a host kernel at link time.
///
/// ```rust,ignore
/// fn double(item: &WorkItem, args: &HostArgs) { /* ... */ }
/// lattice_gpu::host_kernel!("double", [SlotKind::Buffer], double);
/// ```
#[macro_export]
macro_rules! host_kernel {
    ($name:expr, [$($slot:expr),* $(,)?], $entry:path) => {
        $crate::inventory::submit! {
            $crate::host::HostKernel {
                name: $name,
                signature: &[$($slot),*],
                entry: $entry,
            }
        }
    };
}

#[derive(Clone)]
struct KernelEntry {
    signature: Vec<SlotKind>,
    entry: HostKernelFn,
}

lazy_static! {
    static ref RUNTIME_KERNELS: RwLock<FxHashMap<String, KernelEntry>> =
        RwLock::new(FxHashMap::default());
}

/// Register a host kernel at runtime. Names must be unique across both
/// registration paths.
pub fn register_kernel(name: &str, signature: &[SlotKind], entry: HostKernelFn) -> Result<()> {
    let mut kernels = RUNTIME_KERNELS.write();
    let linked = inventory::iter::<HostKernel>
        .into_iter()
        .any(|kernel| kernel.name == name);
    if linked || kernels.contains_key(name) {
        return Err(Error::invalid_argument(format!(
            "Host kernel '{}' is already registered",
            name
        )));
    }
    kernels.insert(
        name.to_string(),
        KernelEntry {
            signature: signature.to_vec(),
            entry,
        },
    );
    Ok(())
}

fn find_kernel(name: &str) -> Option<KernelEntry> {
    if let Some(kernel) = RUNTIME_KERNELS.read().get(name) {
        return Some(kernel.clone());
    }
    inventory::iter::<HostKernel>
        .into_iter()
        .find(|kernel| kernel.name == name)
        .map(|kernel| KernelEntry {
            signature: kernel.signature.to_vec(),
            entry: kernel.entry,
        })
}

/// A resolved host kernel.
#[derive(Debug)]
pub struct HostFunction {
    entry_point: String,
    pub(crate) entry: HostKernelFn,
}

impl NativeFunction for HostFunction {
    fn entry_point(&self) -> &str {
        &self.entry_point
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Resolve `entry` from a host module binary.
pub(crate) fn compile_host_module(
    binary: &ProgramBinary,
    entry: &str,
    signature: &Signature,
) -> Result<HostFunction> {
    if binary.format() != BinaryFormat::HostModule {
        return Err(Error::invalid_argument(format!(
            "bad binary: the host backend cannot load {:?} programs",
            binary.format()
        )));
    }
    let text = std::str::from_utf8(binary.bytes())
        .map_err(|_| Error::invalid_argument("bad binary: host module is not UTF-8"))?;
    let mut lines = text.lines().map(str::trim);
    if lines.next() != Some(HOST_MODULE_MAGIC) {
        return Err(Error::invalid_argument(
            "bad binary: missing host module header",
        ));
    }
    if !lines.any(|name| name == entry) {
        return Err(Error::not_found(format!(
            "entry point '{}' is not exported by the module",
            entry
        )));
    }
    let kernel = find_kernel(entry).ok_or_else(|| {
        Error::not_found(format!("no host kernel named '{}' is registered", entry))
    })?;
    if !signature.matches_kinds(&kernel.signature) {
        return Err(Error::invalid_argument(format!(
            "signature mismatch for '{}': kernel takes {:?}",
            entry, kernel.signature
        )));
    }
    Ok(HostFunction {
        entry_point: entry.to_string(),
        entry: kernel.entry,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::function::ScalarType;

    fn noop(_: &WorkItem, _: &HostArgs<'_>) {}

    crate::host_kernel!("compile_test_noop", [SlotKind::Buffer, SlotKind::scalar(ScalarType::U32)], noop);

    #[test]
    fn test_resolves_linked_kernel() {
        let binary = ProgramBinary::host_module(&["compile_test_noop"]);
        let sig = Signature::from_kinds(&[SlotKind::Buffer, SlotKind::scalar(ScalarType::U32)]);
        let function = compile_host_module(&binary, "compile_test_noop", &sig).unwrap();
        assert_eq!(function.entry_point(), "compile_test_noop");
    }

    #[test]
    fn test_wrong_format_is_bad_binary() {
        let binary = ProgramBinary::wgsl("@compute fn main() {}");
        let err = compile_host_module(&binary, "main", &Signature::default()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn test_unlisted_entry_not_found() {
        let binary = ProgramBinary::host_module(&["other"]);
        let err =
            compile_host_module(&binary, "compile_test_noop", &Signature::default()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_signature_mismatch() {
        let binary = ProgramBinary::host_module(&["compile_test_noop"]);
        let sig = Signature::from_kinds(&[SlotKind::Buffer]);
        let err = compile_host_module(&binary, "compile_test_noop", &sig).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn test_runtime_registration_rejects_duplicates() {
        register_kernel("compile_test_runtime", &[], noop).unwrap();
        let err = register_kernel("compile_test_runtime", &[], noop).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }
}

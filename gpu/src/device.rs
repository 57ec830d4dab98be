//! Devices enumerated by a context.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::backend::BackendDevice;
use crate::capabilities::Capabilities;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Vendor {
    Nvidia,
    Amd,
    Intel,
    Apple,
    Arm,
    Qualcomm,
    Host,
    Unknown,
}

impl Vendor {
    pub fn from_pci_id(id: u32) -> Self {
        match id {
            0x10de => Vendor::Nvidia,
            0x1002 | 0x1022 => Vendor::Amd,
            0x8086 => Vendor::Intel,
            0x106b => Vendor::Apple,
            0x13b5 => Vendor::Arm,
            0x5143 => Vendor::Qualcomm,
            _ => Vendor::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceType {
    Gpu,
    Cpu,
    Other,
}

impl DeviceType {
    /// Ranking weight when choosing a default device.
    pub fn rank(self) -> u8 {
        match self {
            DeviceType::Gpu => 2,
            DeviceType::Other => 1,
            DeviceType::Cpu => 0,
        }
    }
}

/// Stable identity: owning context plus enumeration index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceId {
    pub context: u64,
    pub index: usize,
}

pub(crate) struct DeviceInner {
    id: DeviceId,
    name: String,
    vendor: Vendor,
    device_type: DeviceType,
    backend: String,
    capabilities: Capabilities,
    native: Arc<dyn BackendDevice>,
}

/// Handle to an enumerated device. Equality is identity.
#[derive(Clone)]
pub struct Device {
    inner: Arc<DeviceInner>,
}

impl Device {
    pub(crate) fn new(id: DeviceId, backend: &str, native: Arc<dyn BackendDevice>) -> Self {
        Device {
            inner: Arc::new(DeviceInner {
                id,
                name: native.name(),
                vendor: native.vendor(),
                device_type: native.device_type(),
                backend: backend.to_string(),
                capabilities: native.capabilities(),
                native,
            }),
        }
    }

    pub fn id(&self) -> DeviceId {
        self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn vendor(&self) -> Vendor {
        self.inner.vendor
    }

    pub fn device_type(&self) -> DeviceType {
        self.inner.device_type
    }

    /// Id of the backend that enumerated this device.
    pub fn backend(&self) -> &str {
        &self.inner.backend
    }

    pub fn capabilities(&self) -> &Capabilities {
        &self.inner.capabilities
    }

    /// Default-device ranking: device type, then [`Capabilities::score`].
    pub fn score(&self) -> (u8, (u64, u64)) {
        (self.inner.device_type.rank(), self.inner.capabilities.score())
    }

    pub(crate) fn native(&self) -> &Arc<dyn BackendDevice> {
        &self.inner.native
    }

    /// Fail with a contract violation unless `other` is this device.
    pub(crate) fn ensure_same(&self, other: &Device, what: &str) -> Result<()> {
        if self == other {
            return Ok(());
        }
        if self.inner.id.context != other.inner.id.context {
            return Err(Error::contract(format!(
                "{} belongs to context {}, not context {}",
                what, other.inner.id.context, self.inner.id.context
            )));
        }
        Err(Error::contract(format!(
            "{} belongs to device {}, not device {}",
            what, other.inner.id.index, self.inner.id.index
        )))
    }

    pub fn info(&self) -> DeviceInfo {
        DeviceInfo {
            index: self.inner.id.index,
            name: self.inner.name.clone(),
            vendor: self.inner.vendor,
            device_type: self.inner.device_type,
            backend: self.inner.backend.clone(),
            capabilities: self.inner.capabilities,
        }
    }
}

impl PartialEq for Device {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Device {}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("backend", &self.inner.backend)
            .finish()
    }
}

/// Serialisable snapshot of a device, as printed by the CLI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub index: usize,
    pub name: String,
    pub vendor: Vendor,
    pub device_type: DeviceType,
    pub backend: String,
    pub capabilities: Capabilities,
}

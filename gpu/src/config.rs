//! Context configuration, loaded from `lattice.toml`.
//!
//! ```toml
//! [context]
//! backend = "host"
//! backend-order = ["webgpu", "host"]
//!
//! [host]
//! worker-threads = 4
//! memory-size = 1073741824
//!
//! [profiling]
//! enabled = true
//!
//! [descriptors]
//! pool-growth = 32
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Environment variable that overrides `[context] backend`.
pub const BACKEND_ENV: &str = "LATTICE_BACKEND";

/// Which backend a context should use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendPreference {
    /// First backend in `backend-order` that yields a device
    Auto,
    Named(String),
}

impl BackendPreference {
    pub fn named(id: impl Into<String>) -> Self {
        BackendPreference::Named(id.into())
    }
}

impl From<&str> for BackendPreference {
    fn from(id: &str) -> Self {
        if id.eq_ignore_ascii_case("auto") {
            BackendPreference::Auto
        } else {
            BackendPreference::Named(id.to_ascii_lowercase())
        }
    }
}

/// All options accepted by [`Context::create`](crate::Context::create).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ContextOptions {
    pub context: ContextSection,
    pub host: HostSection,
    pub profiling: ProfilingSection,
    pub descriptors: DescriptorSection,
}

/// `[context]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ContextSection {
    /// Backend id, or "auto"
    pub backend: Option<String>,
    /// Backends tried in order by `BackendPreference::Auto`
    pub backend_order: Vec<String>,
}

impl Default for ContextSection {
    fn default() -> Self {
        ContextSection {
            backend: None,
            backend_order: ["cuda", "metal", "vulkan", "opencl", "webgpu", "host"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

/// `[host]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct HostSection {
    /// Threads in the dispatch pool, 0 = one per CPU
    pub worker_threads: usize,
    /// Memory budget for host buffers and images, in bytes
    pub memory_size: u64,
    /// Overrides the detected SIMD width
    pub simd_width: Option<u32>,
}

impl Default for HostSection {
    fn default() -> Self {
        HostSection {
            worker_threads: 0,
            memory_size: 4 << 30,
            simd_width: None,
        }
    }
}

/// `[profiling]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ProfilingSection {
    pub enabled: bool,
}

impl Default for ProfilingSection {
    fn default() -> Self {
        ProfilingSection { enabled: true }
    }
}

/// `[descriptors]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct DescriptorSection {
    /// Slots added each time a descriptor pool runs dry
    pub pool_growth: usize,
}

impl Default for DescriptorSection {
    fn default() -> Self {
        DescriptorSection { pool_growth: 16 }
    }
}

impl ContextOptions {
    /// Parse a `lattice.toml` string.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| Error::invalid_argument(format!("Failed to parse lattice.toml: {}", e)))
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::not_found(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&content)
    }

    /// Apply the `LATTICE_BACKEND` override.
    pub fn from_env(mut self) -> Self {
        if let Ok(backend) = std::env::var(BACKEND_ENV) {
            if !backend.trim().is_empty() {
                self.context.backend = Some(backend.trim().to_string());
            }
        }
        self
    }

    pub fn backend_preference(&self) -> BackendPreference {
        match self.context.backend.as_deref() {
            Some(id) => BackendPreference::from(id),
            None => BackendPreference::Auto,
        }
    }

    pub fn with_backend(mut self, id: &str) -> Self {
        self.context.backend = Some(id.to_string());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let options = ContextOptions::default();
        assert_eq!(options.backend_preference(), BackendPreference::Auto);
        assert_eq!(options.context.backend_order.last().map(String::as_str), Some("host"));
        assert!(options.profiling.enabled);
        assert_eq!(options.descriptors.pool_growth, 16);
        assert_eq!(options.host.memory_size, 4 << 30);
    }

    #[test]
    fn test_parse_sections() {
        let toml = r#"
[context]
backend = "Host"
backend-order = ["webgpu", "host"]

[host]
worker-threads = 2
simd-width = 8

[profiling]
enabled = false
"#;
        let options = ContextOptions::from_toml_str(toml).unwrap();
        assert_eq!(options.backend_preference(), BackendPreference::named("host"));
        assert_eq!(options.context.backend_order, vec!["webgpu", "host"]);
        assert_eq!(options.host.worker_threads, 2);
        assert_eq!(options.host.simd_width, Some(8));
        assert_eq!(options.host.memory_size, 4 << 30);
        assert!(!options.profiling.enabled);
    }

    #[test]
    fn test_auto_keyword() {
        let options = ContextOptions::default().with_backend("auto");
        assert_eq!(options.backend_preference(), BackendPreference::Auto);
    }

    #[test]
    fn test_bad_toml_is_invalid_argument() {
        let err = ContextOptions::from_toml_str("[host]\nworker-threads = \"many\"").unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidArgument);
    }
}

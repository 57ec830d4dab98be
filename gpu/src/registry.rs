//! Backend registry.
//!
//! Backends are found by id. The built-in ones are always present; other
//! crates add theirs either at runtime with [`register_backend`] or at link
//! time with the [`register_backend!`](crate::register_backend) macro:
//!
//! ```rust,ignore
//! fn create_cuda(options: &ContextOptions) -> lattice_gpu::Result<Box<dyn Backend>> {
//!     /* ... */
//! }
//! lattice_gpu::register_backend!("cuda", create_cuda);
//! ```

use std::sync::Arc;

use fxhash::FxHashMap;
use lazy_static::lazy_static;
use parking_lot::RwLock;

use crate::backend::Backend;
use crate::config::ContextOptions;
use crate::error::{Error, Result};

/// Constructs a backend for a context.
pub type BackendFactory = Arc<dyn Fn(&ContextOptions) -> Result<Box<dyn Backend>> + Send + Sync>;

/// Link-time registration entry, submitted by [`register_backend!`](crate::register_backend).
pub struct BackendRegistration {
    pub id: &'static str,
    pub factory: fn(&ContextOptions) -> Result<Box<dyn Backend>>,
}

inventory::collect!(BackendRegistration);

/// Register a backend factory at link time.
#[macro_export]
macro_rules! register_backend {
    ($id:expr, $factory:path) => {
        $crate::inventory::submit! {
            $crate::registry::BackendRegistration {
                id: $id,
                factory: $factory,
            }
        }
    };
}

/// Id → factory map.
pub struct BackendRegistry {
    factories: FxHashMap<String, BackendFactory>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        BackendRegistry {
            factories: FxHashMap::default(),
        }
    }

    /// Registry holding the built-in backends and every link-time entry.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        let mut add = |id: &str, factory: BackendFactory| {
            if let Err(e) = registry.register(id, factory) {
                log::warn!("skipping backend registration: {}", e);
            }
        };

        add(crate::host::BACKEND_ID, Arc::new(crate::host::create_backend));
        #[cfg(feature = "webgpu-backend")]
        add(
            crate::wgpu_backend::BACKEND_ID,
            Arc::new(crate::wgpu_backend::create_backend),
        );
        for entry in inventory::iter::<BackendRegistration> {
            add(entry.id, Arc::new(entry.factory));
        }
        registry
    }

    /// Add a factory. Ids are case-insensitive and must be unique.
    pub fn register(&mut self, id: &str, factory: BackendFactory) -> Result<()> {
        let key = id.to_ascii_lowercase();
        if key.is_empty() {
            return Err(Error::invalid_argument("backend id must not be empty"));
        }
        if self.factories.contains_key(&key) {
            return Err(Error::invalid_argument(format!(
                "Backend '{}' is already registered",
                key
            )));
        }
        log::debug!("registered backend '{}'", key);
        self.factories.insert(key, factory);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<BackendFactory> {
        self.factories.get(&id.to_ascii_lowercase()).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.factories.contains_key(&id.to_ascii_lowercase())
    }

    /// Registered ids, sorted.
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.factories.keys().cloned().collect();
        ids.sort();
        ids
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::new()
    }
}

lazy_static! {
    static ref GLOBAL: RwLock<BackendRegistry> = RwLock::new(BackendRegistry::with_builtin());
}

/// Register a backend with the process-wide registry.
pub fn register_backend<F>(id: &str, factory: F) -> Result<()>
where
    F: Fn(&ContextOptions) -> Result<Box<dyn Backend>> + Send + Sync + 'static,
{
    GLOBAL.write().register(id, Arc::new(factory))
}

pub fn lookup(id: &str) -> Option<BackendFactory> {
    GLOBAL.read().get(id)
}

pub fn registered_ids() -> Vec<String> {
    GLOBAL.read().ids()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn failing(_: &ContextOptions) -> Result<Box<dyn Backend>> {
        Err(Error::driver("no driver"))
    }

    #[test]
    fn test_builtin_host_is_present() {
        let registry = BackendRegistry::with_builtin();
        assert!(registry.contains("host"));
        assert!(registry.contains("HOST"));
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let mut registry = BackendRegistry::new();
        registry.register("cuda", Arc::new(failing)).unwrap();
        let err = registry.register("CUDA", Arc::new(failing)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        assert!(err.message().contains("already registered"));
    }

    #[test]
    fn test_ids_sorted() {
        let mut registry = BackendRegistry::new();
        registry.register("vulkan", Arc::new(failing)).unwrap();
        registry.register("cuda", Arc::new(failing)).unwrap();
        assert_eq!(registry.ids(), vec!["cuda", "vulkan"]);
    }
}

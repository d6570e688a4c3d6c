/// Backend registry - construction-time selection of the rendering backend
///
/// Backends register a factory under a name; the frame driver creates the
/// one named by the configuration store. Names are case-insensitive.

use rustc_hash::FxHashMap;

use crate::error::{Error, Result};
use super::rendering_api::{RenderingApi, RendererConfig};

/// Factory producing an uninitialized backend
pub type BackendFactory = Box<dyn Fn(&RendererConfig) -> Result<Box<dyn RenderingApi>> + Send + Sync>;

#[derive(Default)]
pub struct BackendRegistry {
    factories: FxHashMap<String, BackendFactory>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a backend factory; a second registration under the same name
    /// replaces the first
    pub fn register<F>(&mut self, name: &str, factory: F)
    where
        F: Fn(&RendererConfig) -> Result<Box<dyn RenderingApi>> + Send + Sync + 'static,
    {
        let name = name.to_ascii_lowercase();
        if self.factories.insert(name.clone(), Box::new(factory)).is_some() {
            crate::engine_warn!("fast3d::BackendRegistry", "Backend '{}' registered twice", name);
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(&name.to_ascii_lowercase())
    }

    /// Registered names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }

    /// Instantiate the named backend
    pub fn create(&self, name: &str, config: &RendererConfig) -> Result<Box<dyn RenderingApi>> {
        let factory = self.factories.get(&name.to_ascii_lowercase()).ok_or_else(|| {
            crate::engine_error!(
                "fast3d::BackendRegistry",
                "Unknown backend '{}' (available: {})",
                name,
                self.names().join(", ")
            );
            Error::InitializationFailed(format!("Backend '{}' not registered", name))
        })?;
        let backend = factory(config)?;
        crate::engine_info!("fast3d::BackendRegistry", "Created '{}' backend", backend.name());
        Ok(backend)
    }
}

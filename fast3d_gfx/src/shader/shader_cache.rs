//! Shader cache
//!
//! Maps combiner keys to compiled programs. At most one program exists per
//! distinct key; a miss compiles exactly once through the backend-supplied
//! closure. There is no eviction: programs live until `unload` or `drain`.

use std::sync::Arc;
use rustc_hash::FxHashMap;
use crate::combiner::{extract, ColorCombinerKey, FeatureDescriptor};
use crate::error::{Error, Result};
use super::shader_program::ShaderProgram;

#[derive(Debug)]
pub struct ShaderCache<P> {
    programs: FxHashMap<ColorCombinerKey, Arc<P>>,
    bound: Option<ColorCombinerKey>,
    compile_count: u64,
}

impl<P: ShaderProgram> ShaderCache<P> {
    pub fn new() -> Self {
        Self {
            programs: FxHashMap::default(),
            bound: None,
            compile_count: 0,
        }
    }

    /// Return the program for `key`, compiling it on first use, and bind it
    ///
    /// A failed compilation leaves the cache untouched (no entry, binding
    /// unchanged) and is never retried automatically.
    pub fn load_or_create<F>(&mut self, key: ColorCombinerKey, compile: F) -> Result<Arc<P>>
    where
        F: FnOnce(ColorCombinerKey, FeatureDescriptor) -> Result<P>,
    {
        if let Some(program) = self.programs.get(&key) {
            self.bound = Some(key);
            return Ok(program.clone());
        }

        let program = Arc::new(compile(key, extract(key))?);
        self.compile_count += 1;
        crate::engine_debug!(
            "fast3d::ShaderCache",
            "Compiled shader {} ({} cached)",
            key,
            self.programs.len() + 1
        );
        self.programs.insert(key, program.clone());
        self.bound = Some(key);
        Ok(program)
    }

    pub fn lookup(&self, key: ColorCombinerKey) -> Option<Arc<P>> {
        self.programs.get(&key).cloned()
    }

    /// Make a cached program the bound one
    pub fn bind(&mut self, key: ColorCombinerKey) -> Result<Arc<P>> {
        let program = self.programs.get(&key).cloned().ok_or_else(|| {
            Error::InvalidResource(format!("shader {} is not loaded", key))
        })?;
        self.bound = Some(key);
        Ok(program)
    }

    pub fn bound(&self) -> Option<Arc<P>> {
        self.bound.and_then(|key| self.programs.get(&key).cloned())
    }

    pub fn bound_key(&self) -> Option<ColorCombinerKey> {
        self.bound
    }

    /// Remove a program so its owner can release GPU objects
    pub fn unload(&mut self, key: ColorCombinerKey) -> Option<Arc<P>> {
        if self.bound == Some(key) {
            self.bound = None;
        }
        self.programs.remove(&key)
    }

    pub fn len(&self) -> usize {
        self.programs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.programs.is_empty()
    }

    /// Number of cache misses that compiled successfully
    pub fn compile_count(&self) -> u64 {
        self.compile_count
    }

    /// Empty the cache (backend teardown)
    pub fn drain(&mut self) -> Vec<Arc<P>> {
        self.bound = None;
        self.programs.drain().map(|(_, program)| program).collect()
    }
}

impl<P: ShaderProgram> Default for ShaderCache<P> {
    fn default() -> Self {
        Self::new()
    }
}

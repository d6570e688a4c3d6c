//! Compiled shader program abstraction

use crate::combiner::{ColorCombinerKey, FeatureDescriptor};
use super::vertex_layout::VertexLayout;

/// Per-program facts the interpreter needs to pack vertices
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShaderInfo {
    pub num_inputs: u8,
    pub used_textures: [bool; 2],
    /// Floats per vertex
    pub num_floats: u32,
}

impl ShaderInfo {
    pub fn from_features(features: &FeatureDescriptor) -> Self {
        Self {
            num_inputs: features.num_inputs,
            used_textures: features.used_textures,
            num_floats: VertexLayout::from_features(features).stride_floats(),
        }
    }
}

/// A compiled program for one combiner key
///
/// Backends implement this for their concrete program type. Programs are
/// immutable once created and shared through `Arc`.
pub trait ShaderProgram: Send + Sync + std::fmt::Debug {
    fn key(&self) -> ColorCombinerKey;

    fn features(&self) -> &FeatureDescriptor;

    fn info(&self) -> ShaderInfo {
        ShaderInfo::from_features(self.features())
    }
}

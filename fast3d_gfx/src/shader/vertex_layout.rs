//! Vertex layout derived from a feature descriptor
//!
//! The interleaved vertex stream produced by the display list interpreter has
//! one float group per attribute, in a fixed order. Both the GLSL generator
//! (attribute declarations) and the pipeline vertex-input state read the
//! layout from here so the two can never disagree.
//!
//! Order: position, then per used texture unit its coordinates followed by
//! its clamp axes, then fog, grayscale color and the shade inputs. Location 0
//! is the position; every later attribute takes the next location for both
//! its vertex input and its matching varying.

use crate::combiner::FeatureDescriptor;

/// What an attribute carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttributeSemantic {
    Position,
    TexCoord(u8),
    TexClampS(u8),
    TexClampT(u8),
    Fog,
    GrayscaleColor,
    Input(u8),
}

impl AttributeSemantic {
    /// Name shared by the `a`-prefixed input and the `v`-prefixed varying
    pub fn base_name(&self) -> String {
        match self {
            AttributeSemantic::Position => "VtxPos".to_string(),
            AttributeSemantic::TexCoord(unit) => format!("TexCoord{}", unit),
            AttributeSemantic::TexClampS(unit) => format!("TexClampS{}", unit),
            AttributeSemantic::TexClampT(unit) => format!("TexClampT{}", unit),
            AttributeSemantic::Fog => "Fog".to_string(),
            AttributeSemantic::GrayscaleColor => "GrayscaleColor".to_string(),
            AttributeSemantic::Input(n) => format!("Input{}", n),
        }
    }

    /// Position feeds `gl_Position`; everything else is passed through
    pub fn has_varying(&self) -> bool {
        !matches!(self, AttributeSemantic::Position)
    }
}

/// One attribute of the interleaved vertex
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VertexAttribute {
    pub semantic: AttributeSemantic,
    /// Shader location of the input (and of the varying, when present)
    pub location: u32,
    /// Float count (1..=4)
    pub components: u32,
    /// Offset in floats from the start of the vertex
    pub offset_floats: u32,
}

impl VertexAttribute {
    pub fn input_name(&self) -> String {
        format!("a{}", self.semantic.base_name())
    }

    pub fn varying_name(&self) -> String {
        format!("v{}", self.semantic.base_name())
    }

    /// GLSL type for this attribute
    pub fn glsl_type(&self) -> &'static str {
        match self.components {
            1 => "float",
            2 => "vec2",
            3 => "vec3",
            _ => "vec4",
        }
    }
}

/// Ordered attribute list plus the resulting stride
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VertexLayout {
    attributes: Vec<VertexAttribute>,
    stride_floats: u32,
}

impl VertexLayout {
    pub fn from_features(features: &FeatureDescriptor) -> Self {
        let mut layout = Self { attributes: Vec::new(), stride_floats: 0 };

        layout.push(AttributeSemantic::Position, 4);
        for unit in 0..2u8 {
            if !features.used_textures[unit as usize] {
                continue;
            }
            layout.push(AttributeSemantic::TexCoord(unit), 2);
            if features.clamp[unit as usize][0] {
                layout.push(AttributeSemantic::TexClampS(unit), 1);
            }
            if features.clamp[unit as usize][1] {
                layout.push(AttributeSemantic::TexClampT(unit), 1);
            }
        }
        if features.opt_fog {
            layout.push(AttributeSemantic::Fog, 4);
        }
        if features.opt_grayscale {
            layout.push(AttributeSemantic::GrayscaleColor, 4);
        }
        let input_components = if features.opt_alpha { 4 } else { 3 };
        for n in 0..features.num_inputs {
            layout.push(AttributeSemantic::Input(n), input_components);
        }

        layout
    }

    fn push(&mut self, semantic: AttributeSemantic, components: u32) {
        self.attributes.push(VertexAttribute {
            semantic,
            location: self.attributes.len() as u32,
            components,
            offset_floats: self.stride_floats,
        });
        self.stride_floats += components;
    }

    pub fn attributes(&self) -> &[VertexAttribute] {
        &self.attributes
    }

    /// Attributes passed on to the fragment stage
    pub fn varyings(&self) -> impl Iterator<Item = &VertexAttribute> {
        self.attributes.iter().filter(|a| a.semantic.has_varying())
    }

    pub fn find(&self, semantic: AttributeSemantic) -> Option<&VertexAttribute> {
        self.attributes.iter().find(|a| a.semantic == semantic)
    }

    /// Floats per vertex
    pub fn stride_floats(&self) -> u32 {
        self.stride_floats
    }

    pub fn stride_bytes(&self) -> u32 {
        self.stride_floats * std::mem::size_of::<f32>() as u32
    }
}

/// Shader module - program cache and vertex layout shared by all backends

pub mod shader_cache;
pub mod shader_program;
pub mod vertex_layout;

pub use shader_cache::ShaderCache;
pub use shader_program::{ShaderInfo, ShaderProgram};
pub use vertex_layout::{AttributeSemantic, VertexAttribute, VertexLayout};

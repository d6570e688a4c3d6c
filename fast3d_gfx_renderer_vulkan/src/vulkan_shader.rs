/// VulkanShaderProgram - one compiled combiner program
///
/// Compilation: generated GLSL → naga (glsl-in) → validation → SPIR-V
/// (spv-out). The vertex SPIR-V is reflected with spirq and its inputs are
/// checked against the `VertexLayout` the pipeline will feed it, so a
/// generator/layout mismatch fails here instead of at draw time.

use ash::vk;
use fast3d_gfx::fast3d::combiner::{ColorCombinerKey, FeatureDescriptor};
use fast3d_gfx::fast3d::shader::{ShaderProgram, VertexLayout};
use fast3d_gfx::fast3d::{Error, Result};
use fast3d_gfx::engine_error;

use crate::vulkan_driver::DeviceDriver;
use crate::vulkan_shader_source::{generate, ShaderSources, PUSH_CONSTANT_SIZE};

const SOURCE: &str = "fast3d::vulkan::shader";

/// Vulkan combiner program
#[derive(Debug)]
pub struct VulkanShaderProgram {
    key: ColorCombinerKey,
    features: FeatureDescriptor,
    layout: VertexLayout,
    sources: ShaderSources,
    pub(crate) vertex_module: vk::ShaderModule,
    pub(crate) fragment_module: vk::ShaderModule,
}

impl VulkanShaderProgram {
    /// Generate, compile and load both stages
    pub fn compile<D: DeviceDriver>(
        driver: &mut D,
        key: ColorCombinerKey,
        features: FeatureDescriptor,
    ) -> Result<Self> {
        let layout = VertexLayout::from_features(&features);
        let sources = generate(&features, &layout);

        let vertex_spirv = compile_glsl(&sources.vertex, naga::ShaderStage::Vertex)
            .and_then(|spirv| check_vertex_inputs(&spirv, &layout).map(|_| spirv))
            .map_err(|e| log_failure(key, "vertex", &sources.vertex, e))?;
        let fragment_spirv = compile_glsl(&sources.fragment, naga::ShaderStage::Fragment)
            .and_then(|spirv| check_push_constants(&spirv).map(|_| spirv))
            .map_err(|e| log_failure(key, "fragment", &sources.fragment, e))?;

        let vertex_module = driver.create_shader_module(&vertex_spirv)?;
        let fragment_module = match driver.create_shader_module(&fragment_spirv) {
            Ok(module) => module,
            Err(e) => {
                driver.destroy_shader_module(vertex_module);
                return Err(e);
            }
        };

        Ok(Self { key, features, layout, sources, vertex_module, fragment_module })
    }

    pub fn layout(&self) -> &VertexLayout {
        &self.layout
    }

    pub fn sources(&self) -> &ShaderSources {
        &self.sources
    }

    pub fn destroy<D: DeviceDriver>(&self, driver: &mut D) {
        driver.destroy_shader_module(self.vertex_module);
        driver.destroy_shader_module(self.fragment_module);
    }
}

impl ShaderProgram for VulkanShaderProgram {
    fn key(&self) -> ColorCombinerKey {
        self.key
    }

    fn features(&self) -> &FeatureDescriptor {
        &self.features
    }
}

fn log_failure(key: ColorCombinerKey, stage: &str, source: &str, error: Error) -> Error {
    engine_error!(SOURCE, "Shader {} ({} stage) failed: {}\n{}", key, stage, error, source);
    error
}

/// GLSL 450 → SPIR-V words
pub fn compile_glsl(source: &str, stage: naga::ShaderStage) -> Result<Vec<u32>> {
    let mut frontend = naga::front::glsl::Frontend::default();
    let module = frontend
        .parse(&naga::front::glsl::Options::from(stage), source)
        .map_err(|e| Error::ShaderCompilationFailed(format!("GLSL parse error: {:?}", e)))?;

    let info = naga::valid::Validator::new(
        naga::valid::ValidationFlags::all(),
        naga::valid::Capabilities::all(),
    )
    .validate(&module)
    .map_err(|e| Error::ShaderCompilationFailed(format!("validation error: {:?}", e)))?;

    // The generated sources already target Vulkan clip space
    let options = naga::back::spv::Options {
        flags: naga::back::spv::WriterFlags::empty(),
        ..Default::default()
    };
    naga::back::spv::write_vec(&module, &info, &options, None)
        .map_err(|e| Error::ShaderCompilationFailed(format!("SPIR-V output error: {:?}", e)))
}

/// Visit every reflected variable of every entry point
fn for_each_variable<F>(spirv: &[u32], mut visit: F) -> Result<()>
where
    F: FnMut(&spirq::var::Variable) -> Result<()>,
{
    let entry_points = spirq::ReflectConfig::new()
        .spv(spirv)
        .ref_all_rscs(true)
        .reflect()
        .map_err(|e| Error::ShaderCompilationFailed(format!("SPIR-V reflection failed: {:?}", e)))?;
    for entry_point in &entry_points {
        for var in entry_point.vars.iter() {
            visit(var)?;
        }
    }
    Ok(())
}

/// Every layout attribute must be a vertex input at its location with its
/// component count
pub fn check_vertex_inputs(spirv: &[u32], layout: &VertexLayout) -> Result<()> {
    let mut inputs: Vec<(u32, u32)> = Vec::new();
    for_each_variable(spirv, |var| {
        if let spirq::var::Variable::Input { location, ty, .. } = var {
            let components = match ty {
                spirq::ty::Type::Scalar(_) => 1,
                spirq::ty::Type::Vector(v) => v.nscalar,
                _ => 0,
            };
            inputs.push((location.loc(), components));
        }
        Ok(())
    })?;

    for attribute in layout.attributes() {
        match inputs.iter().find(|(loc, _)| *loc == attribute.location) {
            Some((_, components)) if *components == attribute.components => {}
            Some((_, components)) => {
                return Err(Error::ShaderCompilationFailed(format!(
                    "vertex input {} at location {} has {} components, layout expects {}",
                    attribute.input_name(),
                    attribute.location,
                    components,
                    attribute.components
                )));
            }
            None => {
                return Err(Error::ShaderCompilationFailed(format!(
                    "vertex input {} missing at location {}",
                    attribute.input_name(),
                    attribute.location
                )));
            }
        }
    }

    if inputs.len() != layout.attributes().len() {
        return Err(Error::ShaderCompilationFailed(format!(
            "vertex stage declares {} inputs, layout has {}",
            inputs.len(),
            layout.attributes().len()
        )));
    }
    Ok(())
}

/// The fragment push constant block must fit the shared pipeline layout range
fn check_push_constants(spirv: &[u32]) -> Result<()> {
    for_each_variable(spirv, |var| {
        if let spirq::var::Variable::PushConstant { ty, .. } = var {
            let size = ty.nbyte().unwrap_or(0) as u32;
            if size > PUSH_CONSTANT_SIZE {
                return Err(Error::ShaderCompilationFailed(format!(
                    "push constant block is {} bytes, pipeline layout has {}",
                    size, PUSH_CONSTANT_SIZE
                )));
            }
        }
        Ok(())
    })
}

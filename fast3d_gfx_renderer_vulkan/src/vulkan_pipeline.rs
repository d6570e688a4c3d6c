/// PipelineCache - graphics pipelines keyed by program and draw state
///
/// Pipelines bake the depth, blend and decal state plus the render pass
/// shape, so each distinct combination of those with a combiner program gets
/// its own pipeline. Viewport and scissor stay dynamic.

use ash::vk;
use fast3d_gfx::fast3d::combiner::ColorCombinerKey;
use fast3d_gfx::fast3d::shader::VertexLayout;
use fast3d_gfx::fast3d::Result;
use rustc_hash::FxHashMap;

use crate::vulkan_driver::{DeviceDriver, GraphicsPipelineDesc};
use crate::vulkan_render_pass::RenderPassKind;
use crate::vulkan_shader::VulkanShaderProgram;

/// Everything a pipeline is specialized on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PipelineKey {
    pub key: ColorCombinerKey,
    pub depth_test: bool,
    pub depth_mask: bool,
    pub decal: bool,
    pub use_alpha: bool,
    pub pass: RenderPassKind,
}

impl PipelineKey {
    /// The window pass has no depth attachment
    fn effective_depth(&self) -> (bool, bool) {
        if self.pass.has_depth() {
            (self.depth_test, self.depth_mask)
        } else {
            (false, false)
        }
    }
}

/// Float attribute format for a component count
pub fn attribute_format(components: u32) -> vk::Format {
    match components {
        1 => vk::Format::R32_SFLOAT,
        2 => vk::Format::R32G32_SFLOAT,
        3 => vk::Format::R32G32B32_SFLOAT,
        _ => vk::Format::R32G32B32A32_SFLOAT,
    }
}

/// Vertex input attributes of a layout, all from binding 0
pub fn vertex_attributes(layout: &VertexLayout) -> Vec<vk::VertexInputAttributeDescription> {
    layout
        .attributes()
        .iter()
        .map(|attribute| {
            vk::VertexInputAttributeDescription::default()
                .location(attribute.location)
                .binding(0)
                .format(attribute_format(attribute.components))
                .offset(attribute.offset_floats * std::mem::size_of::<f32>() as u32)
        })
        .collect()
}

#[derive(Debug, Default)]
pub struct PipelineCache {
    pipelines: FxHashMap<PipelineKey, vk::Pipeline>,
}

impl PipelineCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_create<D: DeviceDriver>(
        &mut self,
        driver: &mut D,
        key: PipelineKey,
        program: &VulkanShaderProgram,
        layout: vk::PipelineLayout,
        render_pass: vk::RenderPass,
    ) -> Result<vk::Pipeline> {
        if let Some(&pipeline) = self.pipelines.get(&key) {
            return Ok(pipeline);
        }

        let attributes = vertex_attributes(program.layout());
        let (depth_test, depth_write) = key.effective_depth();
        let desc = GraphicsPipelineDesc {
            vertex_module: program.vertex_module,
            fragment_module: program.fragment_module,
            layout,
            render_pass,
            samples: key.pass.samples(),
            vertex_stride: program.layout().stride_bytes(),
            attributes: &attributes,
            depth_test,
            depth_write,
            decal: key.decal,
            blend: key.use_alpha,
        };
        let pipeline = driver.create_graphics_pipeline(&desc)?;
        self.pipelines.insert(key, pipeline);
        Ok(pipeline)
    }

    /// Destroy every pipeline built from a combiner program
    pub fn remove_for_key<D: DeviceDriver>(&mut self, driver: &mut D, key: ColorCombinerKey) -> usize {
        let doomed: Vec<PipelineKey> = self.pipelines.keys().filter(|k| k.key == key).copied().collect();
        for pipeline_key in &doomed {
            if let Some(pipeline) = self.pipelines.remove(pipeline_key) {
                driver.destroy_pipeline(pipeline);
            }
        }
        doomed.len()
    }

    /// Destroy every pipeline built against a render pass kind
    pub fn remove_for_pass<D: DeviceDriver>(&mut self, driver: &mut D, pass: RenderPassKind) -> usize {
        let doomed: Vec<PipelineKey> = self.pipelines.keys().filter(|k| k.pass == pass).copied().collect();
        for pipeline_key in &doomed {
            if let Some(pipeline) = self.pipelines.remove(pipeline_key) {
                driver.destroy_pipeline(pipeline);
            }
        }
        doomed.len()
    }

    pub fn len(&self) -> usize {
        self.pipelines.len()
    }

    pub fn destroy_all<D: DeviceDriver>(&mut self, driver: &mut D) {
        for (_, pipeline) in self.pipelines.drain() {
            driver.destroy_pipeline(pipeline);
        }
    }
}

/// Render pass layouts
///
/// The swapchain pass is shared by every swapchain slot. Offscreen passes are
/// cached by (depth, sample count) and shared by every framebuffer with the
/// same shape.

use ash::vk;
use fast3d_gfx::fast3d::Result;
use rustc_hash::FxHashMap;

use crate::vulkan_driver::{DeviceDriver, RenderPassLayout};

/// Format of offscreen color attachments
pub const OFFSCREEN_COLOR_FORMAT: vk::Format = vk::Format::R8G8B8A8_UNORM;

/// Format of offscreen depth attachments
pub const DEPTH_FORMAT: vk::Format = vk::Format::D32_SFLOAT;

/// Which pass a pipeline is compatible with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RenderPassKind {
    Swapchain,
    Offscreen { has_depth: bool, samples: u32 },
}

impl RenderPassKind {
    pub fn has_depth(&self) -> bool {
        matches!(self, RenderPassKind::Offscreen { has_depth: true, .. })
    }

    pub fn samples(&self) -> vk::SampleCountFlags {
        match self {
            RenderPassKind::Swapchain => vk::SampleCountFlags::TYPE_1,
            RenderPassKind::Offscreen { samples, .. } => sample_count_flags(*samples),
        }
    }
}

pub fn sample_count_flags(samples: u32) -> vk::SampleCountFlags {
    match samples {
        0 | 1 => vk::SampleCountFlags::TYPE_1,
        2 => vk::SampleCountFlags::TYPE_2,
        3 | 4 => vk::SampleCountFlags::TYPE_4,
        5..=8 => vk::SampleCountFlags::TYPE_8,
        9..=16 => vk::SampleCountFlags::TYPE_16,
        _ => vk::SampleCountFlags::TYPE_32,
    }
}

/// Window pass: cleared on load, handed to presentation at the end
pub fn swapchain_pass_layout(format: vk::Format) -> RenderPassLayout {
    let color = vk::AttachmentDescription::default()
        .format(format)
        .samples(vk::SampleCountFlags::TYPE_1)
        .load_op(vk::AttachmentLoadOp::CLEAR)
        .store_op(vk::AttachmentStoreOp::STORE)
        .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
        .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
        .initial_layout(vk::ImageLayout::UNDEFINED)
        .final_layout(vk::ImageLayout::PRESENT_SRC_KHR);

    let dependency = vk::SubpassDependency::default()
        .src_subpass(vk::SUBPASS_EXTERNAL)
        .dst_subpass(0)
        .src_stage_mask(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)
        .src_access_mask(vk::AccessFlags::empty())
        .dst_stage_mask(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)
        .dst_access_mask(vk::AccessFlags::COLOR_ATTACHMENT_WRITE);

    RenderPassLayout {
        attachments: vec![color],
        depth_attachment: None,
        dependencies: vec![dependency],
    }
}

/// Offscreen pass: contents are kept between passes and the color image is
/// sampleable before and after
pub fn offscreen_pass_layout(has_depth: bool, samples: u32) -> RenderPassLayout {
    let samples = sample_count_flags(samples);
    let mut attachments = vec![vk::AttachmentDescription::default()
        .format(OFFSCREEN_COLOR_FORMAT)
        .samples(samples)
        .load_op(vk::AttachmentLoadOp::LOAD)
        .store_op(vk::AttachmentStoreOp::STORE)
        .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
        .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
        .initial_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
        .final_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)];

    let mut depth_attachment = None;
    if has_depth {
        depth_attachment = Some(attachments.len() as u32);
        attachments.push(
            vk::AttachmentDescription::default()
                .format(DEPTH_FORMAT)
                .samples(samples)
                .load_op(vk::AttachmentLoadOp::LOAD)
                .store_op(vk::AttachmentStoreOp::STORE)
                .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
                .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
                .initial_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)
                .final_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL),
        );
    }

    // Previous sampling and transfers must finish before the attachments are
    // written, and writes must land before the next fragment read.
    let dependencies = vec![
        vk::SubpassDependency::default()
            .src_subpass(vk::SUBPASS_EXTERNAL)
            .dst_subpass(0)
            .src_stage_mask(vk::PipelineStageFlags::FRAGMENT_SHADER | vk::PipelineStageFlags::TRANSFER)
            .src_access_mask(vk::AccessFlags::SHADER_READ | vk::AccessFlags::TRANSFER_READ)
            .dst_stage_mask(
                vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
                    | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS,
            )
            .dst_access_mask(
                vk::AccessFlags::COLOR_ATTACHMENT_WRITE
                    | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
            ),
        vk::SubpassDependency::default()
            .src_subpass(0)
            .dst_subpass(vk::SUBPASS_EXTERNAL)
            .src_stage_mask(
                vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
                    | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS,
            )
            .src_access_mask(
                vk::AccessFlags::COLOR_ATTACHMENT_WRITE
                    | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
            )
            .dst_stage_mask(vk::PipelineStageFlags::FRAGMENT_SHADER | vk::PipelineStageFlags::TRANSFER)
            .dst_access_mask(vk::AccessFlags::SHADER_READ | vk::AccessFlags::TRANSFER_READ),
    ];

    RenderPassLayout { attachments, depth_attachment, dependencies }
}

/// Offscreen passes keyed by (has_depth, samples)
#[derive(Debug, Default)]
pub struct OffscreenPassCache {
    passes: FxHashMap<(bool, u32), vk::RenderPass>,
}

impl OffscreenPassCache {
    pub fn get_or_create<D: DeviceDriver>(
        &mut self,
        driver: &mut D,
        has_depth: bool,
        samples: u32,
    ) -> Result<vk::RenderPass> {
        let samples = samples.max(1);
        if let Some(&pass) = self.passes.get(&(has_depth, samples)) {
            return Ok(pass);
        }
        let pass = driver.create_render_pass(&offscreen_pass_layout(has_depth, samples))?;
        self.passes.insert((has_depth, samples), pass);
        Ok(pass)
    }

    pub fn len(&self) -> usize {
        self.passes.len()
    }

    pub fn destroy_all<D: DeviceDriver>(&mut self, driver: &mut D) {
        for (_, pass) in self.passes.drain() {
            driver.destroy_render_pass(pass);
        }
    }
}

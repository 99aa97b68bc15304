//! Value-type cache keys.
//!
//! Keys are plain `Copy` structs with derived structural equality and hashing.
//! Every field that changes the created object is part of the key, and every
//! field has an explicit default so two keys built along different paths
//! compare equal when they describe the same state.

use crate::backend::{
    BlendFactor, BlendOp, ColourComponents, CompareOp, CullMode, FrontFace, GpuBuffer,
    GpuImageView, GpuPipelineLayout, GpuRenderPass, GpuSampler, GpuShaderModule, ImageLayout,
    PolygonMode, PrimitiveTopology, ShaderStage, StencilOp, VertexAttribute, VertexBinding,
};
use static_assertions::assert_impl_all;
use std::hash::Hash;

pub const MAX_SAMPLER_BIND_COUNT: usize = 10;
pub const MAX_UBO_BIND_COUNT: usize = 8;
pub const MAX_UBO_DYNAMIC_BIND_COUNT: usize = 4;
pub const MAX_SSBO_BIND_COUNT: usize = 4;
pub const MAX_VERTEX_ATTRIBUTE_COUNT: usize = 8;
pub const MAX_STORAGE_IMAGE_BIND_COUNT: usize = 6;

/// Descriptor set index per descriptor type.
pub const UBO_SET_VALUE: usize = 0;
pub const UBO_DYNAMIC_SET_VALUE: usize = 1;
pub const SSBO_SET_VALUE: usize = 2;
pub const SAMPLER_SET_VALUE: usize = 3;
pub const STORAGE_IMAGE_SET_VALUE: usize = 4;
pub const MAX_DESCRIPTOR_TYPE_COUNT: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RasterStateBlock {
    pub cull_mode: CullMode,
    pub polygon_mode: PolygonMode,
    pub front_face: FrontFace,
    pub topology: PrimitiveTopology,
    pub colour_write_mask: ColourComponents,
    pub colour_attach_count: u32,
    pub prim_restart: bool,
    pub depth_test_enable: bool,
    pub depth_write_enable: bool,
}

impl Default for RasterStateBlock {
    fn default() -> Self {
        Self {
            cull_mode: CullMode::Front,
            polygon_mode: PolygonMode::Fill,
            front_face: FrontFace::CounterClockwise,
            topology: PrimitiveTopology::TriangleList,
            colour_write_mask: ColourComponents::RGBA,
            colour_attach_count: 1,
            prim_restart: false,
            depth_test_enable: false,
            depth_write_enable: false,
        }
    }
}

/// Depth compare and stencil state. Front and back faces share one set of
/// stencil ops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DepthStencilBlock {
    pub compare_op: CompareOp,
    pub stencil_fail_op: StencilOp,
    pub depth_fail_op: StencilOp,
    pub pass_op: StencilOp,
    pub compare_mask: u32,
    pub write_mask: u32,
    pub reference: u32,
    pub stencil_test_enable: bool,
}

impl Default for DepthStencilBlock {
    fn default() -> Self {
        Self {
            compare_op: CompareOp::LessOrEqual,
            stencil_fail_op: StencilOp::Zero,
            depth_fail_op: StencilOp::Zero,
            pass_op: StencilOp::Zero,
            compare_mask: 0,
            write_mask: 0,
            reference: 0,
            stencil_test_enable: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlendFactorBlock {
    pub blend_enable: bool,
    pub src_colour: BlendFactor,
    pub dst_colour: BlendFactor,
    pub colour_op: BlendOp,
    pub src_alpha: BlendFactor,
    pub dst_alpha: BlendFactor,
    pub alpha_op: BlendOp,
}

impl Default for BlendFactorBlock {
    fn default() -> Self {
        Self {
            blend_enable: false,
            src_colour: BlendFactor::Zero,
            dst_colour: BlendFactor::Zero,
            colour_op: BlendOp::Add,
            src_alpha: BlendFactor::Zero,
            dst_alpha: BlendFactor::Zero,
            alpha_op: BlendOp::Add,
        }
    }
}

/// Complete description of a graphics pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GraphicsPipelineKey {
    pub raster_state: RasterStateBlock,
    pub ds_block: DepthStencilBlock,
    pub blend_state: BlendFactorBlock,
    pub render_pass: GpuRenderPass,
    pub pipeline_layout: GpuPipelineLayout,
    /// Indexed by [`ShaderStage::index`]; null for unused stages.
    pub shaders: [GpuShaderModule; ShaderStage::COUNT],
    pub vertex_attributes: [VertexAttribute; MAX_VERTEX_ATTRIBUTE_COUNT],
    pub vertex_bindings: [VertexBinding; MAX_VERTEX_ATTRIBUTE_COUNT],
    pub tesselation_vertex_count: u32,
    pub samples: u32,
}

impl Default for GraphicsPipelineKey {
    fn default() -> Self {
        Self {
            raster_state: RasterStateBlock::default(),
            ds_block: DepthStencilBlock::default(),
            blend_state: BlendFactorBlock::default(),
            render_pass: GpuRenderPass::NULL,
            pipeline_layout: GpuPipelineLayout::NULL,
            shaders: [GpuShaderModule::NULL; ShaderStage::COUNT],
            vertex_attributes: [VertexAttribute::default(); MAX_VERTEX_ATTRIBUTE_COUNT],
            vertex_bindings: [VertexBinding::default(); MAX_VERTEX_ATTRIBUTE_COUNT],
            tesselation_vertex_count: 0,
            samples: 1,
        }
    }
}

impl GraphicsPipelineKey {
    /// Shader modules paired with their stage, skipping unused stages.
    pub fn active_shaders(&self) -> impl Iterator<Item = (ShaderStage, GpuShaderModule)> + '_ {
        ShaderStage::ALL
            .iter()
            .map(move |stage| (*stage, self.shaders[stage.index()]))
            .filter(|(_, module)| !module.is_null())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ComputePipelineKey {
    pub shader: GpuShaderModule,
    pub pipeline_layout: GpuPipelineLayout,
}

/// An image bound through a combined image sampler or storage image slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct DescriptorImage {
    pub image_view: GpuImageView,
    pub image_layout: ImageLayout,
    pub sampler: GpuSampler,
}

/// Everything bound to the five descriptor sets of a draw or dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct DescriptorKey {
    pub pipeline_layout: GpuPipelineLayout,
    pub ubos: [GpuBuffer; MAX_UBO_BIND_COUNT],
    pub ubo_sizes: [u64; MAX_UBO_BIND_COUNT],
    pub dynamic_ubos: [GpuBuffer; MAX_UBO_DYNAMIC_BIND_COUNT],
    pub dynamic_ubo_sizes: [u64; MAX_UBO_DYNAMIC_BIND_COUNT],
    pub ssbos: [GpuBuffer; MAX_SSBO_BIND_COUNT],
    pub ssbo_sizes: [u64; MAX_SSBO_BIND_COUNT],
    pub samplers: [DescriptorImage; MAX_SAMPLER_BIND_COUNT],
    pub storage_images: [DescriptorImage; MAX_STORAGE_IMAGE_BIND_COUNT],
}

assert_impl_all!(GraphicsPipelineKey: Copy, Eq, Hash, Send, Sync);
assert_impl_all!(ComputePipelineKey: Copy, Eq, Hash, Send, Sync);
assert_impl_all!(DescriptorKey: Copy, Eq, Hash, Send, Sync);

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_default_keys_are_equal() {
        assert_eq!(GraphicsPipelineKey::default(), GraphicsPipelineKey::default());
        assert_eq!(DescriptorKey::default(), DescriptorKey::default());
    }

    #[test]
    fn test_single_shader_stage_changes_key() {
        let a = GraphicsPipelineKey::default();
        let mut b = a;
        b.shaders[ShaderStage::Fragment.index()] = GpuShaderModule::from_raw(3);

        let set: HashSet<_> = [a, b].into_iter().collect();
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_single_vertex_slot_changes_key() {
        let a = GraphicsPipelineKey::default();
        let mut b = a;
        b.vertex_attributes[7].offset = 12;
        assert_ne!(a, b);
    }

    #[test]
    fn test_active_shaders_skips_null() {
        let mut key = GraphicsPipelineKey::default();
        key.shaders[ShaderStage::Vertex.index()] = GpuShaderModule::from_raw(1);
        key.shaders[ShaderStage::Fragment.index()] = GpuShaderModule::from_raw(2);
        let stages: Vec<_> = key.active_shaders().map(|(s, _)| s).collect();
        assert_eq!(stages, vec![ShaderStage::Vertex, ShaderStage::Fragment]);
    }
}

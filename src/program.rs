//! Everything the driver needs to record one draw or dispatch.

use crate::backend::{
    CompareOp, CullMode, DescriptorType, FrontFace, GpuShaderModule, IndexType,
    PolygonMode, PrimitiveTopology, Rect2D, SamplerDesc, ShaderStage, ShaderStages, StencilOp, Viewport,
};
use crate::pipeline_cache::{
    BlendFactorBlock, PipelineLayout, MAX_SAMPLER_BIND_COUNT, MAX_STORAGE_IMAGE_BIND_COUNT, SAMPLER_SET_VALUE,
    SSBO_SET_VALUE, STORAGE_IMAGE_SET_VALUE, UBO_DYNAMIC_SET_VALUE, UBO_SET_VALUE,
};
use crate::resource_cache::{BufferHandle, TextureHandle};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RasterState {
    pub cull_mode: CullMode,
    pub polygon_mode: PolygonMode,
    pub front_face: FrontFace,
}

impl Default for RasterState {
    fn default() -> Self {
        Self {
            cull_mode: CullMode::None,
            polygon_mode: PolygonMode::Fill,
            front_face: FrontFace::CounterClockwise,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StencilState {
    pub fail_op: StencilOp,
    pub pass_op: StencilOp,
    pub depth_fail_op: StencilOp,
    pub compare_op: CompareOp,
    pub compare_mask: u32,
    pub write_mask: u32,
    pub reference: u32,
}

impl Default for StencilState {
    fn default() -> Self {
        Self {
            fail_op: StencilOp::Keep,
            pass_op: StencilOp::Keep,
            depth_fail_op: StencilOp::Keep,
            compare_op: CompareOp::LessOrEqual,
            compare_mask: 0,
            write_mask: 0,
            reference: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DepthStencilState {
    pub test_enable: bool,
    pub write_enable: bool,
    pub stencil_test_enable: bool,
    pub compare_op: CompareOp,
    /// Also used for back faces.
    pub front_stencil: StencilState,
}

impl Default for DepthStencilState {
    fn default() -> Self {
        Self {
            test_enable: true,
            write_enable: true,
            stencil_test_enable: false,
            compare_op: CompareOp::LessOrEqual,
            front_stencil: StencilState::default(),
        }
    }
}

/// Draw parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderPrimitive {
    pub index_count: u32,
    pub first_index: u32,
    pub vertex_offset: i32,
    pub vertex_count: u32,
    pub instance_count: u32,
    pub topology: PrimitiveTopology,
    pub prim_restart: bool,
    pub index_type: IndexType,
}

impl Default for RenderPrimitive {
    fn default() -> Self {
        Self {
            index_count: 0,
            first_index: 0,
            vertex_offset: 0,
            vertex_count: 0,
            instance_count: 1,
            topology: PrimitiveTopology::TriangleList,
            prim_restart: false,
            index_type: IndexType::U32,
        }
    }
}

/// A uniform, dynamic uniform or storage buffer bound to a program.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferBinding {
    pub binding: u32,
    pub buffer: BufferHandle,
    pub size: u64,
    pub ty: DescriptorType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextureBinding {
    pub texture: TextureHandle,
    pub sampler: SamplerDesc,
}

/// Shaders, fixed function state and bound resources of a draw or dispatch.
///
/// Setters that bind a resource also declare it in the program's
/// [`PipelineLayout`]; the driver builds the layout on first use.
#[derive(Debug, Default)]
pub struct ProgramBundle {
    shaders: [GpuShaderModule; ShaderStage::COUNT],
    layout: PipelineLayout,
    buffers: Vec<BufferBinding>,
    textures: [Option<TextureBinding>; MAX_SAMPLER_BIND_COUNT],
    storage_images: [Option<TextureHandle>; MAX_STORAGE_IMAGE_BIND_COUNT],
    push_blocks: [Option<Vec<u8>>; ShaderStage::COUNT],
    pub raster_state: RasterState,
    pub ds_state: DepthStencilState,
    pub blend_state: BlendFactorBlock,
    pub render_prim: RenderPrimitive,
    pub scissor: Rect2D,
    pub viewport: Viewport,
    pub tesselation_vertex_count: u32,
}

fn set_for_buffer(ty: DescriptorType) -> usize {
    match ty {
        DescriptorType::UniformBuffer => UBO_SET_VALUE,
        DescriptorType::UniformBufferDynamic => UBO_DYNAMIC_SET_VALUE,
        DescriptorType::StorageBuffer => SSBO_SET_VALUE,
        other => panic!("{:?} is not a buffer descriptor type", other),
    }
}

impl ProgramBundle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_shader(&mut self, stage: ShaderStage, module: GpuShaderModule) {
        self.shaders[stage.index()] = module;
    }

    pub fn shader(&self, stage: ShaderStage) -> GpuShaderModule {
        self.shaders[stage.index()]
    }

    pub fn shaders(&self) -> &[GpuShaderModule; ShaderStage::COUNT] {
        &self.shaders
    }

    pub fn pipeline_layout(&self) -> &PipelineLayout {
        &self.layout
    }

    pub fn pipeline_layout_mut(&mut self) -> &mut PipelineLayout {
        &mut self.layout
    }

    /// Consume the program, keeping only its layout for destruction.
    pub fn into_pipeline_layout(self) -> PipelineLayout {
        self.layout
    }

    pub fn add_descriptor_binding(
        &mut self,
        binding: u32,
        buffer: BufferHandle,
        size: u64,
        ty: DescriptorType,
        stages: ShaderStages,
    ) {
        self.layout.add_descriptor_layout(set_for_buffer(ty), binding, ty, stages);
        self.buffers.retain(|b| !(b.binding == binding && b.ty == ty));
        self.buffers.push(BufferBinding {
            binding,
            buffer,
            size,
            ty,
        });
    }

    pub fn buffer_bindings(&self) -> &[BufferBinding] {
        &self.buffers
    }

    pub fn set_texture(&mut self, binding: u32, texture: TextureHandle, sampler: SamplerDesc, stages: ShaderStages) {
        assert!(
            (binding as usize) < MAX_SAMPLER_BIND_COUNT,
            "Sampler binding {} exceeds max allowed count {}",
            binding,
            MAX_SAMPLER_BIND_COUNT
        );
        self.layout
            .add_descriptor_layout(SAMPLER_SET_VALUE, binding, DescriptorType::CombinedImageSampler, stages);
        self.textures[binding as usize] = Some(TextureBinding { texture, sampler });
    }

    pub fn textures(&self) -> &[Option<TextureBinding>; MAX_SAMPLER_BIND_COUNT] {
        &self.textures
    }

    pub fn set_storage_image(&mut self, binding: u32, texture: TextureHandle, stages: ShaderStages) {
        assert!(
            (binding as usize) < MAX_STORAGE_IMAGE_BIND_COUNT,
            "Storage image binding {} exceeds max allowed count {}",
            binding,
            MAX_STORAGE_IMAGE_BIND_COUNT
        );
        self.layout
            .add_descriptor_layout(STORAGE_IMAGE_SET_VALUE, binding, DescriptorType::StorageImage, stages);
        self.storage_images[binding as usize] = Some(texture);
    }

    pub fn storage_images(&self) -> &[Option<TextureHandle>; MAX_STORAGE_IMAGE_BIND_COUNT] {
        &self.storage_images
    }

    /// Declare a push constant block of `size` bytes for `stage`.
    pub fn create_push_block(&mut self, stage: ShaderStage, size: u32) {
        self.layout.add_push_constant(stage, size);
    }

    pub fn set_push_block_data(&mut self, stage: ShaderStage, data: &[u8]) {
        let size = self.layout.push_constant_size(stage) as usize;
        assert!(size > 0, "No push block declared for {:?}", stage);
        assert!(
            data.len() <= size,
            "Push block data for {:?} is {} bytes, block is {}",
            stage,
            data.len(),
            size
        );
        self.push_blocks[stage.index()] = Some(data.to_vec());
    }

    /// Typed variant of [`set_push_block_data`](Self::set_push_block_data).
    pub fn set_push_constants<T: bytemuck::Pod>(&mut self, stage: ShaderStage, value: &T) {
        self.set_push_block_data(stage, bytemuck::bytes_of(value));
    }

    pub fn push_block(&self, stage: ShaderStage) -> Option<&[u8]> {
        self.push_blocks[stage.index()].as_deref()
    }

    pub fn set_scissor(&mut self, width: u32, height: u32, x: i32, y: i32) {
        self.scissor = Rect2D { x, y, width, height };
    }

    pub fn set_viewport(&mut self, width: u32, height: u32, min_depth: f32, max_depth: f32) {
        self.viewport = Viewport {
            x: 0.0,
            y: 0.0,
            width: width as f32,
            height: height as f32,
            min_depth,
            max_depth,
        };
    }

    /// Indexed draw parameters.
    pub fn add_render_primitive(
        &mut self,
        topology: PrimitiveTopology,
        index_type: IndexType,
        index_count: u32,
        first_index: u32,
        prim_restart: bool,
    ) {
        self.render_prim.topology = topology;
        self.render_prim.index_type = index_type;
        self.render_prim.index_count = index_count;
        self.render_prim.first_index = first_index;
        self.render_prim.prim_restart = prim_restart;
    }

    /// Non-indexed draw parameters.
    pub fn add_vertex_primitive(&mut self, topology: PrimitiveTopology, vertex_count: u32, prim_restart: bool) {
        self.render_prim.topology = topology;
        self.render_prim.vertex_count = vertex_count;
        self.render_prim.prim_restart = prim_restart;
    }

    pub fn set_instance_count(&mut self, count: u32) {
        self.render_prim.instance_count = count;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bindings_declare_layout() {
        let mut program = ProgramBundle::new();
        program.add_descriptor_binding(
            0,
            BufferHandle::default(),
            64,
            DescriptorType::UniformBuffer,
            ShaderStages::VERTEX,
        );
        program.add_descriptor_binding(
            0,
            BufferHandle::default(),
            64,
            DescriptorType::UniformBuffer,
            ShaderStages::FRAGMENT,
        );
        program.set_texture(2, TextureHandle::default(), SamplerDesc::default(), ShaderStages::FRAGMENT);

        let ubo_bindings = program.pipeline_layout().bindings(UBO_SET_VALUE);
        assert_eq!(ubo_bindings.len(), 1);
        assert_eq!(ubo_bindings[0].stages, ShaderStages::VERTEX | ShaderStages::FRAGMENT);
        assert_eq!(program.buffer_bindings().len(), 1);
        assert_eq!(program.pipeline_layout().bindings(SAMPLER_SET_VALUE)[0].binding, 2);
        assert!(program.textures()[2].is_some());
    }

    #[test]
    fn test_blend_state_defaults_to_opaque() {
        let program = ProgramBundle::new();
        assert_eq!(program.blend_state, BlendFactorBlock::default());
        assert!(!program.blend_state.blend_enable);
    }

    #[test]
    fn test_push_block_data() {
        let mut program = ProgramBundle::new();
        program.create_push_block(ShaderStage::Fragment, 16);
        program.set_push_block_data(ShaderStage::Fragment, &[1; 12]);
        assert_eq!(program.push_block(ShaderStage::Fragment).map(<[u8]>::len), Some(12));
        assert!(program.push_block(ShaderStage::Vertex).is_none());
    }

    #[test]
    fn test_typed_push_constants() {
        #[repr(C)]
        #[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
        struct Tint {
            colour: [f32; 4],
        }

        let mut program = ProgramBundle::new();
        program.create_push_block(ShaderStage::Fragment, 16);
        program.set_push_constants(ShaderStage::Fragment, &Tint { colour: [1.0, 0.0, 0.0, 1.0] });
        let bytes = program.push_block(ShaderStage::Fragment).unwrap();
        assert_eq!(bytes.len(), 16);
        assert_eq!(&bytes[0..4], &1.0f32.to_ne_bytes());
    }

    #[test]
    #[should_panic(expected = "No push block declared")]
    fn test_push_block_without_declaration() {
        let mut program = ProgramBundle::new();
        program.set_push_block_data(ShaderStage::Vertex, &[0; 4]);
    }
}

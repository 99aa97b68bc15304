//! The device seam.
//!
//! Every cache, the command ring and the driver talk to the GPU exclusively
//! through [`Device`]. The Vulkan implementation lives in
//! [`super::vulkan`]; [`super::DummyDevice`] implements it in memory.

use crate::backend::types::*;
use crate::pipeline_cache::{ComputePipelineKey, GraphicsPipelineKey};
use thiserror::Error;

/// Backend error type
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    #[error("Failed to initialize backend: {0}")]
    InitializationFailed(String),
    #[error("Failed to create buffer: {0}")]
    BufferCreationFailed(String),
    #[error("Failed to create image: {0}")]
    ImageCreationFailed(String),
    #[error("Failed to create sampler: {0}")]
    SamplerCreationFailed(String),
    #[error("Failed to create shader module: {0}")]
    ShaderCreationFailed(String),
    #[error("Failed to create pipeline: {0}")]
    PipelineCreationFailed(String),
    #[error("Failed to create descriptor objects: {0}")]
    DescriptorCreationFailed(String),
    #[error("Failed to create render pass: {0}")]
    RenderPassCreationFailed(String),
    #[error("Failed to create framebuffer: {0}")]
    FramebufferCreationFailed(String),
    #[error("Command buffer error: {0}")]
    CommandBufferFailed(String),
    #[error("Queue submission failed: {0}")]
    SubmitFailed(String),
    #[error("Synchronization failed: {0}")]
    SyncFailed(String),
    #[error("Failed to present: {0}")]
    PresentFailed(String),
    #[error("Failed to write mapped memory: {0}")]
    MapFailed(String),
    #[error("Surface out of date")]
    SurfaceOutOfDate,
    #[error("Invalid handle: {0}")]
    InvalidHandle(String),
    #[error("Out of memory")]
    OutOfMemory,
    #[error("Device lost")]
    DeviceLost,
}

pub type BackendResult<T> = Result<T, BackendError>;

/// A logical GPU device with a single graphics queue.
///
/// All methods take `&self`; implementations synchronize internally. The
/// core itself drives a device from one thread per frame.
pub trait Device: Send + Sync {
    // Buffers and images

    /// Create a buffer. `CpuToGpu` buffers are persistently mapped.
    fn create_buffer(&self, desc: &BufferDesc) -> BackendResult<GpuBuffer>;

    /// Copy `data` into a mapped buffer at `offset`
    fn write_buffer(&self, buffer: GpuBuffer, offset: u64, data: &[u8]) -> BackendResult<()>;

    fn destroy_buffer(&self, buffer: GpuBuffer);

    /// Create an image in device local memory
    fn create_image(&self, desc: &ImageDesc) -> BackendResult<GpuImage>;

    fn destroy_image(&self, image: GpuImage);

    fn create_image_view(&self, desc: &ImageViewDesc) -> BackendResult<GpuImageView>;

    fn destroy_image_view(&self, view: GpuImageView);

    fn create_sampler(&self, desc: &SamplerDesc) -> BackendResult<GpuSampler>;

    fn destroy_sampler(&self, sampler: GpuSampler);

    /// Create a shader module from SPIR-V words
    fn create_shader_module(&self, stage: ShaderStage, spirv: &[u32]) -> BackendResult<GpuShaderModule>;

    fn destroy_shader_module(&self, module: GpuShaderModule);

    // Layouts and pipelines

    fn create_descriptor_set_layout(
        &self,
        bindings: &[DescriptorBinding],
    ) -> BackendResult<GpuDescriptorSetLayout>;

    fn destroy_descriptor_set_layout(&self, layout: GpuDescriptorSetLayout);

    fn create_pipeline_layout(
        &self,
        set_layouts: &[GpuDescriptorSetLayout],
        push_constants: &[PushConstantRange],
    ) -> BackendResult<GpuPipelineLayout>;

    fn destroy_pipeline_layout(&self, layout: GpuPipelineLayout);

    /// Create a graphics pipeline with dynamic viewport and scissor
    fn create_graphics_pipeline(&self, key: &GraphicsPipelineKey) -> BackendResult<GpuPipeline>;

    fn create_compute_pipeline(&self, key: &ComputePipelineKey) -> BackendResult<GpuPipeline>;

    fn destroy_pipeline(&self, pipeline: GpuPipeline);

    // Descriptors

    /// Create a pool whose sets can be freed individually
    fn create_descriptor_pool(
        &self,
        max_sets: u32,
        sizes: &[DescriptorPoolSize],
    ) -> BackendResult<GpuDescriptorPool>;

    /// Destroy a pool and every set allocated from it
    fn destroy_descriptor_pool(&self, pool: GpuDescriptorPool);

    /// Allocate one set per layout
    fn allocate_descriptor_sets(
        &self,
        pool: GpuDescriptorPool,
        layouts: &[GpuDescriptorSetLayout],
    ) -> BackendResult<Vec<GpuDescriptorSet>>;

    fn free_descriptor_sets(&self, pool: GpuDescriptorPool, sets: &[GpuDescriptorSet]);

    fn update_descriptor_sets(&self, writes: &[DescriptorWrite]);

    // Render passes

    fn create_render_pass(&self, desc: &RenderPassDesc) -> BackendResult<GpuRenderPass>;

    fn destroy_render_pass(&self, render_pass: GpuRenderPass);

    fn create_framebuffer(&self, desc: &FramebufferDesc) -> BackendResult<GpuFramebuffer>;

    fn destroy_framebuffer(&self, framebuffer: GpuFramebuffer);

    // Synchronization

    /// Create an unsignaled fence
    fn create_fence(&self) -> BackendResult<GpuFence>;

    fn destroy_fence(&self, fence: GpuFence);

    /// Non-blocking fence status query
    fn fence_signaled(&self, fence: GpuFence) -> BackendResult<bool>;

    /// Wait until any (or all) of `fences` signal.
    ///
    /// Returns `Ok(false)` when `timeout_ns` elapses first.
    fn wait_for_fences(&self, fences: &[GpuFence], wait_all: bool, timeout_ns: u64) -> BackendResult<bool>;

    fn create_semaphore(&self) -> BackendResult<GpuSemaphore>;

    fn destroy_semaphore(&self, semaphore: GpuSemaphore);

    // Command buffers and submission

    /// Allocate a primary command buffer
    fn allocate_command_buffer(&self) -> BackendResult<GpuCommandBuffer>;

    fn free_command_buffer(&self, cmd: GpuCommandBuffer);

    /// Begin one-time-submit recording
    fn begin_command_buffer(&self, cmd: GpuCommandBuffer) -> BackendResult<()>;

    fn end_command_buffer(&self, cmd: GpuCommandBuffer) -> BackendResult<()>;

    /// Submit to the graphics queue. Wait semaphores block all commands.
    fn submit(&self, info: &SubmitInfo) -> BackendResult<()>;

    fn wait_idle(&self) -> BackendResult<()>;

    // Presentation

    /// Acquire the next swapchain image, signalling `signal` when it is ready
    fn acquire_next_image(&self, swapchain: GpuSwapchain, signal: GpuSemaphore) -> BackendResult<AcquireResult>;

    /// Queue a present. Returns `Ok(false)` if the swapchain went stale.
    fn present(&self, swapchain: GpuSwapchain, image_index: u32, wait: &[GpuSemaphore]) -> BackendResult<bool>;

    // Recording

    fn cmd_begin_render_pass(&self, cmd: GpuCommandBuffer, begin: &RenderPassBegin);

    fn cmd_end_render_pass(&self, cmd: GpuCommandBuffer);

    fn cmd_bind_pipeline(&self, cmd: GpuCommandBuffer, bind_point: PipelineBindPoint, pipeline: GpuPipeline);

    fn cmd_bind_descriptor_sets(
        &self,
        cmd: GpuCommandBuffer,
        bind_point: PipelineBindPoint,
        layout: GpuPipelineLayout,
        sets: &[GpuDescriptorSet],
        dynamic_offsets: &[u32],
    );

    fn cmd_bind_vertex_buffers(&self, cmd: GpuCommandBuffer, first_binding: u32, buffers: &[GpuBuffer], offsets: &[u64]);

    fn cmd_bind_index_buffer(&self, cmd: GpuCommandBuffer, buffer: GpuBuffer, offset: u64, index_type: IndexType);

    fn cmd_set_viewport(&self, cmd: GpuCommandBuffer, viewport: &Viewport);

    fn cmd_set_scissor(&self, cmd: GpuCommandBuffer, scissor: &Rect2D);

    fn cmd_push_constants(
        &self,
        cmd: GpuCommandBuffer,
        layout: GpuPipelineLayout,
        stages: ShaderStages,
        offset: u32,
        data: &[u8],
    );

    fn cmd_draw(&self, cmd: GpuCommandBuffer, vertex_count: u32, instance_count: u32, first_vertex: u32, first_instance: u32);

    fn cmd_draw_indexed(
        &self,
        cmd: GpuCommandBuffer,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    );

    fn cmd_dispatch(&self, cmd: GpuCommandBuffer, x: u32, y: u32, z: u32);

    fn cmd_copy_buffer(&self, cmd: GpuCommandBuffer, src: GpuBuffer, dst: GpuBuffer, regions: &[BufferCopy]);

    fn cmd_copy_buffer_to_image(
        &self,
        cmd: GpuCommandBuffer,
        src: GpuBuffer,
        dst: GpuImage,
        format: Format,
        regions: &[BufferImageCopy],
    );

    /// Image layout transition
    fn cmd_image_barrier(&self, cmd: GpuCommandBuffer, barrier: &ImageBarrier);

    /// Transfer-write to consumer barrier on a buffer
    fn cmd_buffer_barrier(&self, cmd: GpuCommandBuffer, barrier: &BufferBarrier);
}

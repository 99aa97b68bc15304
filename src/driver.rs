//! The driver: owner of every cache and the entry point for frame, resource
//! and draw calls.

use std::sync::Arc;

use crate::backend::{
    AcquireResult, BackendError, BackendResult, BufferBarrier, BufferCopy, BufferDesc, BufferImageCopy, BufferUsage,
    ClearValue, DescriptorType, Device, Format, GpuBuffer, GpuCommandBuffer, GpuImage, GpuImageView, GpuSemaphore,
    ImageBarrier, ImageLayout, ImageUsage, MemoryLocation, PipelineBindPoint, Rect2D, RenderPassBegin,
    ShaderStage, Swapchain, VertexAttribute, VertexBinding, Viewport,
};
use crate::commands::Commands;
use crate::framebuffer_cache::{FramebufferCache, FramebufferKey, RenderPassKey};
use crate::gc::GarbageCollector;
use crate::handle::{Arena, Handle};
use crate::pipeline_cache::{
    DepthStencilBlock, DescriptorImage, PipelineCache, MAX_SAMPLER_BIND_COUNT, MAX_STORAGE_IMAGE_BIND_COUNT,
    MAX_VERTEX_ATTRIBUTE_COUNT,
};
use crate::program::ProgramBundle;
use crate::render_target::{
    AttachmentInfo, RenderPassData, RenderTarget, RenderTargetHandle, DEPTH_INDEX, MAX_ATTACHMENT_COUNT, STENCIL_INDEX,
};
use crate::resource_cache::{BufferHandle, ResourceCache, TextureHandle};
use crate::sampler_cache::SamplerCache;
use crate::staging::StagingPool;

/// Tunables of the driver and its caches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriverConfig {
    /// Size of the command buffer ring. Also the number of garbage
    /// collections a deleted texture or buffer survives.
    pub max_command_buffers: u32,
    /// Frames a staging buffer stays reserved after its last use.
    pub max_frames_in_flight: u32,
    pub pipeline_lifetime_frames: u32,
    pub framebuffer_lifetime_frames: u32,
    /// Countdown of the closure garbage collector.
    pub gc_frames: u32,
    pub initial_descriptor_pool_size: u32,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            max_command_buffers: 10,
            max_frames_in_flight: 3,
            pipeline_lifetime_frames: 10,
            framebuffer_lifetime_frames: 10,
            gc_frames: 3,
            initial_descriptor_pool_size: 1000,
        }
    }
}

/// Device local vertex data.
#[derive(Debug)]
pub struct VertexBuffer {
    buffer: GpuBuffer,
    size: u64,
}

impl VertexBuffer {
    pub fn get(&self) -> GpuBuffer {
        self.buffer
    }

    pub fn size(&self) -> u64 {
        self.size
    }
}

/// Device local index data.
#[derive(Debug)]
pub struct IndexBuffer {
    buffer: GpuBuffer,
    size: u64,
}

impl IndexBuffer {
    pub fn get(&self) -> GpuBuffer {
        self.buffer
    }

    pub fn size(&self) -> u64 {
        self.size
    }
}

pub type VertexBufferHandle = Handle<VertexBuffer>;
pub type IndexBufferHandle = Handle<IndexBuffer>;

/// Vertex layout of a draw: attribute and binding slots.
pub type VertexInput<'a> = (
    &'a [VertexAttribute; MAX_VERTEX_ATTRIBUTE_COUNT],
    &'a [VertexBinding; MAX_VERTEX_ATTRIBUTE_COUNT],
);

fn invalid_handle<T>(handle: Handle<T>) -> BackendError {
    BackendError::InvalidHandle(format!("{:?}", handle))
}

pub struct Driver {
    device: Arc<dyn Device>,
    config: DriverConfig,
    commands: Commands,
    pipeline_cache: PipelineCache,
    framebuffer_cache: FramebufferCache,
    resource_cache: ResourceCache,
    staging_pool: StagingPool,
    sampler_cache: SamplerCache,
    gc: GarbageCollector,
    vertex_buffers: Arena<VertexBuffer>,
    index_buffers: Arena<IndexBuffer>,
    render_targets: Arena<RenderTarget>,
    image_ready_signal: GpuSemaphore,
    image_index: u32,
    current_frame: u64,
    is_shutdown: bool,
}

impl Driver {
    pub fn new(device: Arc<dyn Device>, config: DriverConfig) -> BackendResult<Self> {
        let commands = Commands::new(device.clone(), config.max_command_buffers)?;
        let pipeline_cache = PipelineCache::new(
            device.clone(),
            config.initial_descriptor_pool_size,
            config.pipeline_lifetime_frames as u64,
        )?;
        let image_ready_signal = device.create_semaphore()?;

        log::info!(
            "Driver created: {} command buffers, {} frames in flight",
            config.max_command_buffers,
            config.max_frames_in_flight
        );

        Ok(Self {
            framebuffer_cache: FramebufferCache::new(device.clone(), config.framebuffer_lifetime_frames),
            resource_cache: ResourceCache::new(device.clone(), config.max_command_buffers),
            staging_pool: StagingPool::new(device.clone(), config.max_frames_in_flight),
            sampler_cache: SamplerCache::new(device.clone()),
            gc: GarbageCollector::new(config.gc_frames),
            commands,
            pipeline_cache,
            vertex_buffers: Arena::new(),
            index_buffers: Arena::new(),
            render_targets: Arena::new(),
            image_ready_signal,
            image_index: 0,
            current_frame: 0,
            is_shutdown: false,
            device,
            config,
        })
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn device(&self) -> &Arc<dyn Device> {
        &self.device
    }

    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    pub fn current_frame(&self) -> u64 {
        self.current_frame
    }

    /// Swapchain image acquired by the last successful [`begin_frame`](Self::begin_frame).
    pub fn image_index(&self) -> u32 {
        self.image_index
    }

    pub fn commands(&self) -> &Commands {
        &self.commands
    }

    pub fn commands_mut(&mut self) -> &mut Commands {
        &mut self.commands
    }

    pub fn pipeline_cache(&self) -> &PipelineCache {
        &self.pipeline_cache
    }

    pub fn pipeline_cache_mut(&mut self) -> &mut PipelineCache {
        &mut self.pipeline_cache
    }

    pub fn framebuffer_cache(&self) -> &FramebufferCache {
        &self.framebuffer_cache
    }

    pub fn resource_cache(&self) -> &ResourceCache {
        &self.resource_cache
    }

    pub fn staging_pool(&self) -> &StagingPool {
        &self.staging_pool
    }

    pub fn sampler_cache(&self) -> &SamplerCache {
        &self.sampler_cache
    }

    /// The recording command buffer, beginning one if needed. May block, see
    /// [`Commands::get_cmd_buffer`].
    pub fn get_cmd_buffer(&mut self) -> BackendResult<GpuCommandBuffer> {
        self.commands.get_cmd_buffer()
    }

    /// Submit the recording command buffer.
    pub fn flush_cmds(&mut self) -> BackendResult<()> {
        self.commands.flush(&mut self.pipeline_cache)
    }

    // ========================================================================
    // Textures and buffers
    // ========================================================================

    #[allow(clippy::too_many_arguments)]
    pub fn create_texture_2d(
        &mut self,
        format: Format,
        width: u32,
        height: u32,
        mip_levels: u32,
        face_count: u32,
        array_count: u32,
        usage: ImageUsage,
    ) -> BackendResult<TextureHandle> {
        self.resource_cache
            .create_texture_2d(format, width, height, mip_levels, face_count, array_count, usage)
    }

    /// Wrap an externally owned image.
    pub fn import_texture_2d(
        &mut self,
        format: Format,
        width: u32,
        height: u32,
        image: GpuImage,
    ) -> BackendResult<TextureHandle> {
        self.resource_cache.import_texture_2d(format, width, height, image)
    }

    /// Upload texel data through a staging buffer.
    ///
    /// `offsets` gives the byte offset of each level of each face, face major.
    /// Without it levels are assumed tightly packed.
    pub fn map_texture(&mut self, handle: TextureHandle, data: &[u8], offsets: Option<&[u64]>) -> BackendResult<()> {
        let texture = self.resource_cache.texture(handle).ok_or_else(|| invalid_handle(handle))?;
        let info = *texture.info();
        let image = texture.image();
        let final_layout = texture.image_layout();

        let layers = info.layer_count();
        let bpp = info.format.bytes_per_pixel() as u64;
        let region_count = (layers * info.mip_levels) as usize;
        if let Some(offsets) = offsets {
            if offsets.len() < region_count {
                return Err(BackendError::MapFailed(format!(
                    "texture upload needs {} level offsets, {} given",
                    region_count,
                    offsets.len()
                )));
            }
        }

        let mut regions = Vec::with_capacity(region_count);
        let mut packed_offset = 0u64;
        for face in 0..layers {
            for level in 0..info.mip_levels {
                let width = (info.width >> level).max(1);
                let height = (info.height >> level).max(1);
                let level_size = width as u64 * height as u64 * bpp;
                let buffer_offset = match offsets {
                    Some(offsets) => offsets[(face * info.mip_levels + level) as usize],
                    None => packed_offset,
                };
                packed_offset += level_size;
                let end = buffer_offset.saturating_add(level_size);
                if end > data.len() as u64 {
                    return Err(BackendError::MapFailed(format!(
                        "texture upload of level {} face {} reads bytes {}..{}, {} given",
                        level,
                        face,
                        buffer_offset,
                        end,
                        data.len()
                    )));
                }
                regions.push(BufferImageCopy {
                    buffer_offset,
                    mip_level: level,
                    base_array_layer: face,
                    layer_count: 1,
                    width,
                    height,
                });
            }
        }

        let stage = self.staging_pool.get_stage(data.len() as u64, self.current_frame)?;
        self.staging_pool.write(stage, 0, data)?;
        let stage_buffer = self
            .staging_pool
            .stage(stage)
            .map(|s| s.buffer())
            .ok_or_else(|| invalid_handle(stage))?;

        let cmd = self.commands.get_cmd_buffer()?;
        let barrier = ImageBarrier {
            image,
            format: info.format,
            old_layout: ImageLayout::Undefined,
            new_layout: ImageLayout::TransferDst,
            base_mip_level: 0,
            mip_levels: info.mip_levels,
            base_array_layer: 0,
            array_layers: layers,
        };
        self.device.cmd_image_barrier(cmd, &barrier);
        self.device
            .cmd_copy_buffer_to_image(cmd, stage_buffer, image, info.format, &regions);
        self.device.cmd_image_barrier(
            cmd,
            &ImageBarrier {
                old_layout: ImageLayout::TransferDst,
                new_layout: final_layout,
                ..barrier
            },
        );
        Ok(())
    }

    pub fn destroy_texture_2d(&mut self, handle: TextureHandle) {
        self.resource_cache.delete_texture(handle);
    }

    pub fn create_ubo(&mut self, size: u64, usage: BufferUsage) -> BackendResult<BufferHandle> {
        self.resource_cache.create_ubo(size, usage)
    }

    pub fn map_buffer(&mut self, handle: BufferHandle, offset: u64, data: &[u8]) -> BackendResult<()> {
        self.resource_cache.map_buffer(handle, offset, data)
    }

    pub fn destroy_buffer(&mut self, handle: BufferHandle) {
        self.resource_cache.delete_ubo(handle);
    }

    /// Copy `data` into a device local buffer through a staging buffer.
    fn upload(&mut self, dst: GpuBuffer, data: &[u8], dst_usage: BufferUsage) -> BackendResult<()> {
        let stage = self.staging_pool.get_stage(data.len() as u64, self.current_frame)?;
        self.staging_pool.write(stage, 0, data)?;
        let src = self
            .staging_pool
            .stage(stage)
            .map(|s| s.buffer())
            .ok_or_else(|| invalid_handle(stage))?;

        let cmd = self.commands.get_cmd_buffer()?;
        self.device.cmd_copy_buffer(
            cmd,
            src,
            dst,
            &[BufferCopy {
                src_offset: 0,
                dst_offset: 0,
                size: data.len() as u64,
            }],
        );
        self.device.cmd_buffer_barrier(
            cmd,
            &BufferBarrier {
                buffer: dst,
                dst_usage,
            },
        );
        Ok(())
    }

    fn create_device_buffer(&mut self, data: &[u8], usage: BufferUsage) -> BackendResult<GpuBuffer> {
        assert!(!data.is_empty(), "No data given for {:?} buffer", usage);
        let buffer = self.device.create_buffer(&BufferDesc {
            size: data.len() as u64,
            usage: usage | BufferUsage::TRANSFER_DST,
            memory: MemoryLocation::GpuOnly,
        })?;
        if let Err(e) = self.upload(buffer, data, usage) {
            self.device.destroy_buffer(buffer);
            return Err(e);
        }
        Ok(buffer)
    }

    pub fn add_vertex_buffer(&mut self, data: &[u8]) -> BackendResult<VertexBufferHandle> {
        let buffer = self.create_device_buffer(data, BufferUsage::VERTEX)?;
        Ok(self.vertex_buffers.insert(VertexBuffer {
            buffer,
            size: data.len() as u64,
        }))
    }

    /// Replace the contents of a vertex buffer.
    ///
    /// Data larger than the buffer reallocates it; the returned handle must
    /// then be used in place of `handle`.
    pub fn map_vertex_buffer(&mut self, handle: VertexBufferHandle, data: &[u8]) -> BackendResult<VertexBufferHandle> {
        let (buffer, size) = self
            .vertex_buffers
            .get(handle)
            .map(|vb| (vb.buffer, vb.size))
            .ok_or_else(|| invalid_handle(handle))?;
        if data.len() as u64 > size {
            self.delete_vertex_buffer(handle);
            return self.add_vertex_buffer(data);
        }
        self.upload(buffer, data, BufferUsage::VERTEX)?;
        Ok(handle)
    }

    pub fn vertex_buffer(&self, handle: VertexBufferHandle) -> Option<&VertexBuffer> {
        self.vertex_buffers.get(handle)
    }

    pub fn delete_vertex_buffer(&mut self, handle: VertexBufferHandle) {
        match self.vertex_buffers.remove(handle) {
            Some(vb) => self.gc.add(move |device| device.destroy_buffer(vb.buffer)),
            None => log::warn!("Delete of unknown vertex buffer {:?}", handle),
        }
    }

    pub fn add_index_buffer(&mut self, data: &[u8]) -> BackendResult<IndexBufferHandle> {
        let buffer = self.create_device_buffer(data, BufferUsage::INDEX)?;
        Ok(self.index_buffers.insert(IndexBuffer {
            buffer,
            size: data.len() as u64,
        }))
    }

    /// Index buffer counterpart of [`map_vertex_buffer`](Self::map_vertex_buffer).
    pub fn map_index_buffer(&mut self, handle: IndexBufferHandle, data: &[u8]) -> BackendResult<IndexBufferHandle> {
        let (buffer, size) = self
            .index_buffers
            .get(handle)
            .map(|ib| (ib.buffer, ib.size))
            .ok_or_else(|| invalid_handle(handle))?;
        if data.len() as u64 > size {
            self.delete_index_buffer(handle);
            return self.add_index_buffer(data);
        }
        self.upload(buffer, data, BufferUsage::INDEX)?;
        Ok(handle)
    }

    pub fn index_buffer(&self, handle: IndexBufferHandle) -> Option<&IndexBuffer> {
        self.index_buffers.get(handle)
    }

    pub fn delete_index_buffer(&mut self, handle: IndexBufferHandle) {
        match self.index_buffers.remove(handle) {
            Some(ib) => self.gc.add(move |device| device.destroy_buffer(ib.buffer)),
            None => log::warn!("Delete of unknown index buffer {:?}", handle),
        }
    }

    /// Release a program. Its pipeline layout is destroyed once in-flight
    /// work can no longer use it.
    pub fn delete_program(&mut self, program: ProgramBundle) {
        let mut layout = program.into_pipeline_layout();
        if layout.is_built() {
            self.gc.add(move |device| layout.destroy(device));
        }
    }

    // ========================================================================
    // Render targets
    // ========================================================================

    pub fn create_render_target(&mut self, target: RenderTarget) -> RenderTargetHandle {
        self.render_targets.insert(target)
    }

    /// One render target per swapchain image, optionally sharing a depth
    /// texture.
    pub fn create_swapchain_render_targets(
        &mut self,
        swapchain: &Swapchain,
        depth_format: Option<Format>,
        clear_colour: [f32; 4],
    ) -> BackendResult<Vec<RenderTargetHandle>> {
        let depth = match depth_format {
            Some(format) => AttachmentInfo::new(self.resource_cache.create_texture_2d(
                format,
                swapchain.width,
                swapchain.height,
                1,
                1,
                1,
                ImageUsage::DEPTH_STENCIL_ATTACHMENT,
            )?),
            None => AttachmentInfo::default(),
        };

        let mut handles = Vec::with_capacity(swapchain.images.len());
        for image in &swapchain.images {
            let colour =
                self.resource_cache
                    .import_texture_2d(swapchain.format, swapchain.width, swapchain.height, *image)?;
            let mut target = RenderTarget {
                depth,
                clear_colour,
                ..Default::default()
            };
            target.colours[0] = AttachmentInfo::new(colour);
            handles.push(self.render_targets.insert(target));
        }
        Ok(handles)
    }

    pub fn render_target(&self, handle: RenderTargetHandle) -> Option<&RenderTarget> {
        self.render_targets.get(handle)
    }

    /// Forget a render target. Its textures are not deleted.
    pub fn delete_render_target(&mut self, handle: RenderTargetHandle) {
        self.render_targets.remove(handle);
    }

    fn attachment_view(&self, attachment: &AttachmentInfo) -> BackendResult<(GpuImageView, Format)> {
        let texture = self
            .resource_cache
            .texture(attachment.handle)
            .ok_or_else(|| invalid_handle(attachment.handle))?;
        Ok((texture.image_view_for_level(attachment.level), texture.info().format))
    }

    /// Begin a render pass on `target`, creating the render pass and
    /// framebuffer on first use.
    pub fn begin_renderpass(
        &mut self,
        cmd: GpuCommandBuffer,
        data: &RenderPassData,
        target: RenderTargetHandle,
    ) -> BackendResult<()> {
        let target = *self.render_targets.get(target).ok_or_else(|| invalid_handle(target))?;

        let mut rpass_key = RenderPassKey {
            samples: target.samples,
            multi_view: target.multi_view,
            ..Default::default()
        };
        let mut fbo_key = FramebufferKey {
            width: data.width,
            height: data.height,
            samples: target.samples,
            ..Default::default()
        };
        let mut count = 0;

        for (idx, colour) in target.colours.iter().enumerate() {
            if !colour.is_used() {
                continue;
            }
            let (view, format) = self.attachment_view(colour)?;
            assert!(
                data.final_layouts[idx] != ImageLayout::Undefined,
                "Colour attachment {} has an undefined final layout",
                idx
            );
            rpass_key.colour_formats[idx] = format;
            rpass_key.initial_layouts[idx] = data.initial_layouts[idx];
            rpass_key.final_layouts[idx] = data.final_layouts[idx];
            rpass_key.load_ops[idx] = data.load_ops[idx];
            rpass_key.store_ops[idx] = data.store_ops[idx];
            fbo_key.views[count] = view;
            count += 1;
        }
        if target.depth.is_used() {
            let (view, format) = self.attachment_view(&target.depth)?;
            rpass_key.depth_format = format;
            fbo_key.views[count] = view;
            count += 1;
        }
        debug_assert!(count <= MAX_ATTACHMENT_COUNT);
        rpass_key.ds_load_ops = [data.load_ops[DEPTH_INDEX], data.load_ops[STENCIL_INDEX]];
        rpass_key.ds_store_ops = [data.store_ops[DEPTH_INDEX], data.store_ops[STENCIL_INDEX]];

        let (render_pass, colour_count, attachment_count) = {
            let rpass = self
                .framebuffer_cache
                .find_or_create_render_pass(&rpass_key, self.current_frame)?;
            (rpass.get(), rpass.colour_attach_count(), rpass.attachments().len())
        };

        fbo_key.render_pass = render_pass;
        let (framebuffer, width, height) = {
            let fbo = self
                .framebuffer_cache
                .find_or_create_framebuffer(&fbo_key, count, self.current_frame)?;
            (fbo.get(), fbo.width(), fbo.height())
        };

        let mut clear_values = vec![ClearValue::Colour(target.clear_colour); attachment_count];
        if target.depth.is_used() {
            clear_values[attachment_count - 1] = ClearValue::DepthStencil {
                depth: 1.0,
                stencil: 0,
            };
        }

        self.device.cmd_begin_render_pass(
            cmd,
            &RenderPassBegin {
                render_pass,
                framebuffer,
                width,
                height,
                clear_values,
            },
        );
        self.device.cmd_set_viewport(cmd, &Viewport::from_extent(width, height));
        self.device.cmd_set_scissor(cmd, &Rect2D::from_extent(width, height));

        self.pipeline_cache.bind_render_pass(render_pass, target.samples);
        self.pipeline_cache.bind_colour_attach_count(colour_count);
        Ok(())
    }

    pub fn end_renderpass(&mut self, cmd: GpuCommandBuffer) {
        self.device.cmd_end_render_pass(cmd);
    }

    // ========================================================================
    // Draw and dispatch
    // ========================================================================

    /// Push the program's samplers, storage images and buffers into the
    /// descriptor requirements.
    fn bind_program_resources(&mut self, program: &ProgramBundle) -> BackendResult<()> {
        let mut samplers = [DescriptorImage::default(); MAX_SAMPLER_BIND_COUNT];
        for (idx, binding) in program.textures().iter().enumerate() {
            let Some(binding) = binding else {
                continue;
            };
            let texture = self
                .resource_cache
                .texture(binding.texture)
                .ok_or_else(|| invalid_handle(binding.texture))?;
            samplers[idx] = DescriptorImage {
                image_view: texture.image_view(),
                image_layout: texture.image_layout(),
                sampler: self.sampler_cache.get_or_create(&binding.sampler)?,
            };
        }
        self.pipeline_cache.bind_sampler(&samplers);

        let mut storage_images = [DescriptorImage::default(); MAX_STORAGE_IMAGE_BIND_COUNT];
        for (idx, handle) in program.storage_images().iter().enumerate() {
            let Some(handle) = handle else {
                continue;
            };
            let texture = self.resource_cache.texture(*handle).ok_or_else(|| invalid_handle(*handle))?;
            storage_images[idx] = DescriptorImage {
                image_view: texture.image_view(),
                image_layout: ImageLayout::General,
                ..Default::default()
            };
        }
        self.pipeline_cache.bind_storage_image(&storage_images);

        for info in program.buffer_bindings() {
            let buffer = self
                .resource_cache
                .buffer(info.buffer)
                .ok_or_else(|| invalid_handle(info.buffer))?
                .get();
            let binding = info.binding as usize;
            match info.ty {
                DescriptorType::UniformBuffer => self.pipeline_cache.bind_ubo(binding, buffer, info.size),
                DescriptorType::UniformBufferDynamic => {
                    self.pipeline_cache.bind_ubo_dynamic(binding, buffer, info.size)
                }
                DescriptorType::StorageBuffer => self.pipeline_cache.bind_ssbo(binding, buffer, info.size),
                other => unreachable!("{:?} bound as a buffer", other),
            }
        }
        Ok(())
    }

    fn bind_push_blocks(&self, cmd: GpuCommandBuffer, program: &ProgramBundle) {
        for stage in ShaderStage::ALL {
            if let Some(data) = program.push_block(stage) {
                program
                    .pipeline_layout()
                    .bind_push_block(self.device.as_ref(), cmd, stage, data);
            }
        }
    }

    /// Record a draw of `program` inside the current render pass.
    pub fn draw(
        &mut self,
        cmd: GpuCommandBuffer,
        program: &mut ProgramBundle,
        vertex_buffer: Option<VertexBufferHandle>,
        index_buffer: Option<IndexBufferHandle>,
        vertex_input: Option<VertexInput<'_>>,
        dynamic_offsets: &[u32],
    ) -> BackendResult<()> {
        let frame = self.current_frame;

        self.bind_program_resources(program)?;
        program.pipeline_layout_mut().build(self.device.as_ref())?;
        self.pipeline_cache.bind_descriptors(
            cmd,
            program.pipeline_layout(),
            dynamic_offsets,
            PipelineBindPoint::Graphics,
            frame,
        )?;

        let cache = &mut self.pipeline_cache;
        cache.bind_shader_modules(program.shaders());

        let raster = program.raster_state;
        let ds = program.ds_state;
        cache.bind_cull_mode(raster.cull_mode);
        cache.bind_front_face(raster.front_face);
        cache.bind_polygon_mode(raster.polygon_mode);
        cache.bind_depth_test_enable(ds.test_enable);
        cache.bind_depth_write_enable(ds.write_enable);
        cache.bind_depth_stencil_block(&DepthStencilBlock {
            compare_op: ds.compare_op,
            stencil_fail_op: ds.front_stencil.fail_op,
            depth_fail_op: ds.front_stencil.depth_fail_op,
            pass_op: ds.front_stencil.pass_op,
            compare_mask: ds.front_stencil.compare_mask,
            write_mask: ds.front_stencil.write_mask,
            reference: ds.front_stencil.reference,
            stencil_test_enable: ds.stencil_test_enable,
        });
        cache.bind_blend_factor_block(&program.blend_state);

        let prim = program.render_prim;
        cache.bind_prim_restart(prim.prim_restart);
        cache.bind_topology(prim.topology);
        if program.tesselation_vertex_count > 0 {
            cache.bind_tesselation_vertex_count(program.tesselation_vertex_count);
        }

        // Zero sized scissor or viewport keeps the render pass extent.
        if program.scissor.is_set() {
            cache.bind_scissor(cmd, &program.scissor);
        }
        if program.viewport.is_set() {
            cache.bind_viewport(cmd, &program.viewport);
        }

        if let Some((attributes, bindings)) = vertex_input {
            cache.bind_vertex_input(attributes, bindings);
        }

        cache.bind_graphics_pipeline(cmd, program.pipeline_layout(), frame)?;

        // Push constants must follow the pipeline bind.
        self.bind_push_blocks(cmd, program);

        if let Some(handle) = vertex_buffer {
            let buffer = self.vertex_buffers.get(handle).ok_or_else(|| invalid_handle(handle))?.buffer;
            self.device.cmd_bind_vertex_buffers(cmd, 0, &[buffer], &[0]);
        }

        match index_buffer {
            Some(handle) => {
                let buffer = self.index_buffers.get(handle).ok_or_else(|| invalid_handle(handle))?.buffer;
                self.device.cmd_bind_index_buffer(cmd, buffer, 0, prim.index_type);
                self.device.cmd_draw_indexed(
                    cmd,
                    prim.index_count,
                    prim.instance_count,
                    prim.first_index,
                    prim.vertex_offset,
                    0,
                );
            }
            None => {
                assert!(
                    prim.vertex_count > 0,
                    "When no index buffer is declared, the vertex count must be specified"
                );
                self.device.cmd_draw(cmd, prim.vertex_count, prim.instance_count, 0, 0);
            }
        }
        Ok(())
    }

    /// Record a compute dispatch of `program`.
    pub fn dispatch_compute(
        &mut self,
        cmd: GpuCommandBuffer,
        program: &mut ProgramBundle,
        x_groups: u32,
        y_groups: u32,
        z_groups: u32,
    ) -> BackendResult<()> {
        let frame = self.current_frame;
        assert!(
            !program.shader(ShaderStage::Compute).is_null(),
            "Dispatch of a program without a compute shader"
        );

        self.bind_program_resources(program)?;
        program.pipeline_layout_mut().build(self.device.as_ref())?;
        self.pipeline_cache.bind_descriptors(
            cmd,
            program.pipeline_layout(),
            &[],
            PipelineBindPoint::Compute,
            frame,
        )?;

        self.pipeline_cache
            .bind_compute_shader_module(program.shader(ShaderStage::Compute));
        self.pipeline_cache
            .bind_compute_pipeline(cmd, program.pipeline_layout(), frame)?;
        self.bind_push_blocks(cmd, program);

        self.device.cmd_dispatch(cmd, x_groups, y_groups, z_groups);
        Ok(())
    }

    // ========================================================================
    // Frame lifecycle
    // ========================================================================

    /// Acquire the next swapchain image.
    ///
    /// Returns `Ok(false)` when the swapchain is out of date and must be
    /// recreated by the caller.
    pub fn begin_frame(&mut self, swapchain: &Swapchain) -> BackendResult<bool> {
        match self
            .device
            .acquire_next_image(swapchain.handle, self.image_ready_signal)?
        {
            AcquireResult::Acquired(index) => {
                self.image_index = index;
                Ok(true)
            }
            AcquireResult::Stale => {
                log::info!("Swapchain is out of date, frame {} skipped", self.current_frame);
                Ok(false)
            }
        }
    }

    /// Submit the frame, present it and collect garbage.
    ///
    /// A frame that recorded nothing still submits an empty buffer so the
    /// acquire semaphore is waited on before the image is presented.
    pub fn end_frame(&mut self, swapchain: &Swapchain) -> BackendResult<()> {
        if self.commands.current_cmd_buffer().is_none() {
            self.commands.get_cmd_buffer()?;
        }
        self.commands.set_external_wait_signal(self.image_ready_signal);
        self.commands.flush(&mut self.pipeline_cache)?;

        let render_complete: Vec<GpuSemaphore> = self.commands.get_finished_signal().into_iter().collect();
        if !self
            .device
            .present(swapchain.handle, self.image_index, &render_complete)?
        {
            log::info!("Swapchain reported suboptimal at present");
        }
        log::debug!(
            "Presented image {} (frame {}), waiting on {:?}",
            self.image_index,
            self.current_frame,
            render_complete
        );

        self.current_frame += 1;
        self.collect_garbage();
        Ok(())
    }

    /// Destroy everything whose deferral period has ended. Called once per
    /// frame by [`end_frame`](Self::end_frame).
    pub fn collect_garbage(&mut self) {
        let frame = self.current_frame;
        self.gc.collect_garbage(self.device.as_ref());
        self.framebuffer_cache.clean_cache(frame);
        self.pipeline_cache.clean_cache(frame);
        self.resource_cache.garbage_collection();
        self.staging_pool.garbage_collection(frame);
    }

    pub fn wait_idle(&mut self) -> BackendResult<()> {
        self.commands.wait_idle()
    }

    /// Wait for the device and destroy every object the driver owns. Further
    /// calls do nothing.
    pub fn shutdown(&mut self) -> BackendResult<()> {
        if self.is_shutdown {
            return Ok(());
        }
        self.is_shutdown = true;

        let idle = self.commands.wait_idle();
        self.commands.destroy();

        let device = self.device.as_ref();
        self.gc.reset(device);
        for vb in self.vertex_buffers.drain() {
            device.destroy_buffer(vb.buffer);
        }
        for ib in self.index_buffers.drain() {
            device.destroy_buffer(ib.buffer);
        }
        self.render_targets.clear();

        self.framebuffer_cache.clear();
        self.pipeline_cache.clear();
        self.resource_cache.clear();
        self.staging_pool.clear();
        self.sampler_cache.clear();
        device.destroy_semaphore(self.image_ready_signal);

        log::info!("Driver shut down after {} frames", self.current_frame);
        idle
    }
}

impl Drop for Driver {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            log::error!("Driver shutdown failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{DummyDevice, LoadOp, ObjectKind, RecordedCommand, StoreOp};
    use rstest::rstest;

    fn driver() -> (Arc<DummyDevice>, Driver) {
        let _ = env_logger::builder().is_test(true).try_init();
        let device = Arc::new(DummyDevice::new());
        let driver = Driver::new(device.clone(), DriverConfig::default()).unwrap();
        (device, driver)
    }

    #[test]
    fn test_vertex_buffer_upload_goes_through_staging() {
        let (device, mut driver) = driver();
        let handle = driver.add_vertex_buffer(&[1, 2, 3, 4]).unwrap();
        let buffer = driver.vertex_buffer(handle).unwrap().get();
        assert_eq!(device.buffer_contents(buffer), vec![1, 2, 3, 4]);
        assert_eq!(driver.staging_pool().in_use_count(), 1);

        let cmd = driver.get_cmd_buffer().unwrap();
        let commands = device.recorded_commands(cmd);
        assert!(matches!(commands[0], RecordedCommand::CopyBuffer { dst, .. } if dst == buffer));
        assert!(matches!(commands[1], RecordedCommand::BufferBarrier(_)));
    }

    #[test]
    fn test_map_vertex_buffer_grows() {
        let (device, mut driver) = driver();
        let handle = driver.add_vertex_buffer(&[0; 8]).unwrap();

        let same = driver.map_vertex_buffer(handle, &[7; 4]).unwrap();
        assert_eq!(same, handle);

        let grown = driver.map_vertex_buffer(handle, &[9; 16]).unwrap();
        assert_ne!(grown, handle);
        assert!(driver.vertex_buffer(handle).is_none());
        assert_eq!(driver.vertex_buffer(grown).unwrap().size(), 16);

        // The old buffer goes through the deferred destructor queue.
        assert_eq!(device.destroyed(ObjectKind::Buffer), 0);
        for _ in 0..driver.config().gc_frames {
            driver.collect_garbage();
        }
        assert_eq!(device.destroyed(ObjectKind::Buffer), 1);
    }

    #[test]
    fn test_delete_unknown_buffers_is_silent() {
        let (_device, mut driver) = driver();
        let vb = driver.add_vertex_buffer(&[0; 4]).unwrap();
        driver.delete_vertex_buffer(vb);
        driver.delete_vertex_buffer(vb);
        driver.delete_index_buffer(IndexBufferHandle::default());
        driver.destroy_texture_2d(TextureHandle::default());
        driver.destroy_buffer(BufferHandle::default());
    }

    #[test]
    fn test_map_texture_transitions_and_copies() {
        let (device, mut driver) = driver();
        let handle = driver
            .create_texture_2d(Format::Rgba8Unorm, 4, 4, 2, 1, 1, ImageUsage::SAMPLED)
            .unwrap();
        let data = vec![0u8; (4 * 4 + 2 * 2) * 4];
        driver.map_texture(handle, &data, None).unwrap();

        let cmd = driver.get_cmd_buffer().unwrap();
        let commands = device.recorded_commands(cmd);
        assert_eq!(commands.len(), 3);
        match (&commands[0], &commands[1], &commands[2]) {
            (
                RecordedCommand::ImageBarrier(to_dst),
                RecordedCommand::CopyBufferToImage { regions, .. },
                RecordedCommand::ImageBarrier(to_read),
            ) => {
                assert_eq!(to_dst.new_layout, ImageLayout::TransferDst);
                assert_eq!(regions.len(), 2);
                assert_eq!(regions[1].buffer_offset, 64);
                assert_eq!(regions[1].width, 2);
                assert_eq!(to_read.new_layout, ImageLayout::ShaderReadOnly);
            }
            other => panic!("unexpected commands {:?}", other),
        }
    }

    // Two levels of a 4x4 RGBA8 texture take 64 + 16 bytes.
    #[rstest]
    #[case::short_data(8, None)]
    #[case::missing_level_offset(80, Some(vec![0]))]
    #[case::offset_past_end(80, Some(vec![0, 72]))]
    #[case::offset_overflow(80, Some(vec![0, u64::MAX]))]
    fn test_map_texture_rejects_out_of_range_upload(#[case] len: usize, #[case] offsets: Option<Vec<u64>>) {
        let (device, mut driver) = driver();
        let handle = driver
            .create_texture_2d(Format::Rgba8Unorm, 4, 4, 2, 1, 1, ImageUsage::SAMPLED)
            .unwrap();
        let result = driver.map_texture(handle, &vec![0u8; len], offsets.as_deref());
        assert!(matches!(result, Err(BackendError::MapFailed(_))));
        assert!(device.all_recorded_commands().is_empty());
    }

    #[test]
    fn test_map_texture_accepts_explicit_offsets() {
        let (_device, mut driver) = driver();
        let handle = driver
            .create_texture_2d(Format::Rgba8Unorm, 4, 4, 2, 1, 1, ImageUsage::SAMPLED)
            .unwrap();
        driver.map_texture(handle, &[0; 96], Some(&[16, 80][..])).unwrap();
    }

    #[test]
    fn test_attachment_texture_accepts_upload() {
        let (device, mut driver) = driver();
        let handle = driver
            .create_texture_2d(Format::Rgba8Unorm, 4, 4, 1, 1, 1, ImageUsage::COLOUR_ATTACHMENT)
            .unwrap();
        let usage = driver.resource_cache().texture(handle).unwrap().info().usage;
        assert!(usage.contains(ImageUsage::TRANSFER_DST));
        driver.map_texture(handle, &[0; 64], None).unwrap();
        let cmd = driver.get_cmd_buffer().unwrap();
        assert!(device
            .recorded_commands(cmd)
            .iter()
            .any(|c| matches!(c, RecordedCommand::CopyBufferToImage { .. })));
    }

    #[test]
    fn test_begin_renderpass_reuses_cached_objects() {
        let (device, mut driver) = driver();
        let colour = driver
            .create_texture_2d(Format::Rgba8Unorm, 64, 64, 1, 1, 1, ImageUsage::COLOUR_ATTACHMENT)
            .unwrap();
        let depth = driver
            .create_texture_2d(Format::D32Float, 64, 64, 1, 1, 1, ImageUsage::DEPTH_STENCIL_ATTACHMENT)
            .unwrap();
        let mut target = RenderTarget {
            depth: AttachmentInfo::new(depth),
            clear_colour: [0.2, 0.3, 0.4, 1.0],
            ..Default::default()
        };
        target.colours[0] = AttachmentInfo::new(colour);
        let rt = driver.create_render_target(target);

        let mut data = RenderPassData::clear_and_store(64, 64);
        data.load_ops[DEPTH_INDEX] = LoadOp::Clear;
        data.store_ops[DEPTH_INDEX] = StoreOp::DontCare;

        let cmd = driver.get_cmd_buffer().unwrap();
        for _ in 0..2 {
            driver.begin_renderpass(cmd, &data, rt).unwrap();
            driver.end_renderpass(cmd);
        }
        assert_eq!(device.created(ObjectKind::RenderPass), 1);
        assert_eq!(device.created(ObjectKind::Framebuffer), 1);

        let begin = device
            .recorded_commands(cmd)
            .into_iter()
            .find_map(|c| match c {
                RecordedCommand::BeginRenderPass { clear_values, width, .. } => Some((clear_values, width)),
                _ => None,
            })
            .unwrap();
        assert_eq!(begin.1, 64);
        assert_eq!(
            begin.0,
            vec![
                ClearValue::Colour([0.2, 0.3, 0.4, 1.0]),
                ClearValue::DepthStencil { depth: 1.0, stencil: 0 }
            ]
        );
        assert_eq!(driver.pipeline_cache().graphics_requirements().raster_state.colour_attach_count, 1);
    }

    #[test]
    fn test_stale_swapchain_skips_frame() {
        let (device, mut driver) = driver();
        let swapchain = device.create_swapchain(Format::Bgra8Unorm, 800, 600, 3);
        device.force_stale_acquire(1);
        assert!(!driver.begin_frame(&swapchain).unwrap());
        assert!(driver.begin_frame(&swapchain).unwrap());
        assert_eq!(driver.image_index(), 0);
    }

    #[test]
    fn test_shutdown_releases_everything() {
        let (device, mut driver) = driver();
        driver.add_vertex_buffer(&[1; 16]).unwrap();
        driver.add_index_buffer(&[1; 12]).unwrap();
        let ubo = driver.create_ubo(256, BufferUsage::UNIFORM).unwrap();
        driver.destroy_buffer(ubo);
        driver
            .create_texture_2d(Format::Rgba8Unorm, 8, 8, 1, 1, 1, ImageUsage::SAMPLED)
            .unwrap();
        driver.flush_cmds().unwrap();

        driver.shutdown().unwrap();
        driver.shutdown().unwrap();
        for kind in [
            ObjectKind::Buffer,
            ObjectKind::Image,
            ObjectKind::ImageView,
            ObjectKind::CommandBuffer,
            ObjectKind::Fence,
            ObjectKind::Semaphore,
            ObjectKind::DescriptorPool,
        ] {
            assert_eq!(device.live(kind), 0, "{:?} leaked", kind);
        }
    }
}

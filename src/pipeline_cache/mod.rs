//! Pipeline and descriptor set cache.
//!
//! Binding is accumulate-then-commit: the `bind_*` setters write into a
//! requirements key, and [`PipelineCache::bind_graphics_pipeline`],
//! [`PipelineCache::bind_compute_pipeline`] and
//! [`PipelineCache::bind_descriptors`] look up or create the matching object
//! and reset the key to its defaults. A setter that is not called for a draw
//! falls back to the default, never to the previous draw's value.

mod keys;
mod layout;

pub use keys::*;
pub use layout::PipelineLayout;

use std::collections::HashMap;
use std::sync::Arc;

use crate::backend::{
    BackendResult, DescriptorPoolSize, DescriptorResource, DescriptorType, DescriptorWrite, Device,
    GpuBuffer, GpuCommandBuffer, GpuDescriptorPool, GpuDescriptorSet, GpuDescriptorSetLayout,
    GpuPipeline, GpuRenderPass, GpuShaderModule, ImageLayout, PipelineBindPoint, Rect2D, ShaderStage,
    Viewport, CullMode, FrontFace, PolygonMode, PrimitiveTopology, VertexAttribute, VertexBinding,
};

/// A cached pipeline and the frame it was last bound in.
#[derive(Debug, Clone, Copy)]
pub struct CachedPipeline {
    pub pipeline: GpuPipeline,
    pub last_used_frame: u64,
}

/// Descriptor sets allocated for one [`DescriptorKey`].
#[derive(Debug, Clone, Copy)]
pub struct DescriptorSetInfo {
    pub layouts: [GpuDescriptorSetLayout; MAX_DESCRIPTOR_TYPE_COUNT],
    pub sets: [GpuDescriptorSet; MAX_DESCRIPTOR_TYPE_COUNT],
    pub pool: GpuDescriptorPool,
    pub last_used_frame: u64,
}

pub struct PipelineCache {
    device: Arc<dyn Device>,
    lifetime_frames: u64,

    pipelines: HashMap<GraphicsPipelineKey, CachedPipeline>,
    compute_pipelines: HashMap<ComputePipelineKey, CachedPipeline>,
    descriptor_sets: HashMap<DescriptorKey, DescriptorSetInfo>,

    descriptor_pool: GpuDescriptorPool,
    current_pool_size: u32,
    /// Superseded pools and the frame they were retired in.
    retired_pools: Vec<(GpuDescriptorPool, u64)>,

    bound_descriptor: Option<DescriptorKey>,

    graphics_requires: GraphicsPipelineKey,
    compute_requires: ComputePipelineKey,
    desc_requires: DescriptorKey,
}

impl PipelineCache {
    /// Create the cache and its first descriptor pool.
    pub fn new(device: Arc<dyn Device>, initial_pool_size: u32, lifetime_frames: u64) -> BackendResult<Self> {
        let mut cache = Self {
            device,
            lifetime_frames,
            pipelines: HashMap::new(),
            compute_pipelines: HashMap::new(),
            descriptor_sets: HashMap::new(),
            descriptor_pool: GpuDescriptorPool::NULL,
            current_pool_size: initial_pool_size.max(1),
            retired_pools: Vec::new(),
            bound_descriptor: None,
            graphics_requires: GraphicsPipelineKey::default(),
            compute_requires: ComputePipelineKey::default(),
            desc_requires: DescriptorKey::default(),
        };
        cache.create_descriptor_pool()?;
        Ok(cache)
    }

    // ========================================================================
    // Graphics pipelines
    // ========================================================================

    /// Reset every requirement key and forget what is bound.
    ///
    /// Called when a command buffer finishes recording; the next buffer starts
    /// with nothing bound.
    pub fn set_pipeline_key_to_default(&mut self) {
        self.graphics_requires = GraphicsPipelineKey::default();
        self.compute_requires = ComputePipelineKey::default();
        self.desc_requires = DescriptorKey::default();
        self.bound_descriptor = None;
    }

    /// Reset the graphics requirements after a bind. The render pass state
    /// stays until the render pass ends.
    fn reset_graphics_key(&mut self) {
        let render_pass = self.graphics_requires.render_pass;
        let samples = self.graphics_requires.samples;
        let colour_attach_count = self.graphics_requires.raster_state.colour_attach_count;

        self.graphics_requires = GraphicsPipelineKey::default();
        self.graphics_requires.render_pass = render_pass;
        self.graphics_requires.samples = samples;
        self.graphics_requires.raster_state.colour_attach_count = colour_attach_count;
    }

    /// The pending graphics requirements.
    pub fn graphics_requirements(&self) -> &GraphicsPipelineKey {
        &self.graphics_requires
    }

    pub fn find_or_create_graphics_pipeline(&mut self, current_frame: u64) -> BackendResult<GpuPipeline> {
        let key = self.graphics_requires;
        assert!(
            !key.render_pass.is_null(),
            "Graphics pipeline requested with no render pass bound"
        );
        assert!(
            !key.pipeline_layout.is_null(),
            "Graphics pipeline requested with an unbuilt pipeline layout"
        );

        if let Some(entry) = self.pipelines.get_mut(&key) {
            entry.last_used_frame = current_frame;
            return Ok(entry.pipeline);
        }

        let pipeline = self.device.create_graphics_pipeline(&key)?;
        log::debug!(
            "Pipeline cache miss: created graphics pipeline {:?} ({} cached)",
            pipeline,
            self.pipelines.len() + 1
        );
        self.pipelines.insert(
            key,
            CachedPipeline {
                pipeline,
                last_used_frame: current_frame,
            },
        );
        Ok(pipeline)
    }

    /// Find or create the pipeline for the current requirements, record the
    /// bind and reset the graphics requirements.
    pub fn bind_graphics_pipeline(
        &mut self,
        cmd: GpuCommandBuffer,
        layout: &PipelineLayout,
        current_frame: u64,
    ) -> BackendResult<GpuPipeline> {
        self.graphics_requires.pipeline_layout = layout.get();
        let pipeline = self.find_or_create_graphics_pipeline(current_frame)?;
        self.device
            .cmd_bind_pipeline(cmd, PipelineBindPoint::Graphics, pipeline);

        self.reset_graphics_key();
        Ok(pipeline)
    }

    pub fn bind_shader_modules(&mut self, modules: &[GpuShaderModule; ShaderStage::COUNT]) {
        self.graphics_requires.shaders = *modules;
    }

    pub fn bind_render_pass(&mut self, render_pass: GpuRenderPass, samples: u32) {
        assert!(!render_pass.is_null());
        self.graphics_requires.render_pass = render_pass;
        self.graphics_requires.samples = samples.max(1);
    }

    pub fn bind_cull_mode(&mut self, cull_mode: CullMode) {
        self.graphics_requires.raster_state.cull_mode = cull_mode;
    }

    pub fn bind_polygon_mode(&mut self, polygon_mode: PolygonMode) {
        self.graphics_requires.raster_state.polygon_mode = polygon_mode;
    }

    pub fn bind_front_face(&mut self, front_face: FrontFace) {
        self.graphics_requires.raster_state.front_face = front_face;
    }

    pub fn bind_topology(&mut self, topology: PrimitiveTopology) {
        self.graphics_requires.raster_state.topology = topology;
    }

    pub fn bind_prim_restart(&mut self, state: bool) {
        self.graphics_requires.raster_state.prim_restart = state;
    }

    pub fn bind_depth_test_enable(&mut self, state: bool) {
        self.graphics_requires.raster_state.depth_test_enable = state;
    }

    pub fn bind_depth_write_enable(&mut self, state: bool) {
        self.graphics_requires.raster_state.depth_write_enable = state;
    }

    pub fn bind_depth_stencil_block(&mut self, block: &DepthStencilBlock) {
        self.graphics_requires.ds_block = *block;
    }

    pub fn bind_blend_factor_block(&mut self, block: &BlendFactorBlock) {
        self.graphics_requires.blend_state = *block;
    }

    pub fn bind_colour_attach_count(&mut self, count: u32) {
        self.graphics_requires.raster_state.colour_attach_count = count;
    }

    pub fn bind_tesselation_vertex_count(&mut self, count: u32) {
        self.graphics_requires.tesselation_vertex_count = count;
    }

    pub fn bind_vertex_input(
        &mut self,
        attributes: &[VertexAttribute; MAX_VERTEX_ATTRIBUTE_COUNT],
        bindings: &[VertexBinding; MAX_VERTEX_ATTRIBUTE_COUNT],
    ) {
        self.graphics_requires.vertex_attributes = *attributes;
        self.graphics_requires.vertex_bindings = *bindings;
    }

    /// Viewport is dynamic state and recorded straight away.
    pub fn bind_viewport(&self, cmd: GpuCommandBuffer, viewport: &Viewport) {
        self.device.cmd_set_viewport(cmd, viewport);
    }

    /// Scissor is dynamic state and recorded straight away.
    pub fn bind_scissor(&self, cmd: GpuCommandBuffer, scissor: &Rect2D) {
        self.device.cmd_set_scissor(cmd, scissor);
    }

    // ========================================================================
    // Compute pipelines
    // ========================================================================

    pub fn bind_compute_shader_module(&mut self, module: GpuShaderModule) {
        self.compute_requires.shader = module;
    }

    pub fn find_or_create_compute_pipeline(&mut self, current_frame: u64) -> BackendResult<GpuPipeline> {
        let key = self.compute_requires;
        assert!(!key.shader.is_null(), "Compute pipeline requested with no shader bound");
        assert!(
            !key.pipeline_layout.is_null(),
            "Compute pipeline requested with an unbuilt pipeline layout"
        );

        if let Some(entry) = self.compute_pipelines.get_mut(&key) {
            entry.last_used_frame = current_frame;
            return Ok(entry.pipeline);
        }

        let pipeline = self.device.create_compute_pipeline(&key)?;
        log::debug!("Pipeline cache miss: created compute pipeline {:?}", pipeline);
        self.compute_pipelines.insert(
            key,
            CachedPipeline {
                pipeline,
                last_used_frame: current_frame,
            },
        );
        Ok(pipeline)
    }

    pub fn bind_compute_pipeline(
        &mut self,
        cmd: GpuCommandBuffer,
        layout: &PipelineLayout,
        current_frame: u64,
    ) -> BackendResult<GpuPipeline> {
        self.compute_requires.pipeline_layout = layout.get();
        let pipeline = self.find_or_create_compute_pipeline(current_frame)?;
        self.device
            .cmd_bind_pipeline(cmd, PipelineBindPoint::Compute, pipeline);

        self.compute_requires = ComputePipelineKey::default();
        Ok(pipeline)
    }

    // ========================================================================
    // Descriptor sets
    // ========================================================================

    pub fn bind_ubo(&mut self, binding: usize, buffer: GpuBuffer, size: u64) {
        assert!(
            binding < MAX_UBO_BIND_COUNT,
            "Ubo binding value ({}) exceeds max allowed binding count ({})",
            binding,
            MAX_UBO_BIND_COUNT
        );
        self.desc_requires.ubos[binding] = buffer;
        self.desc_requires.ubo_sizes[binding] = size;
    }

    pub fn bind_ubo_dynamic(&mut self, binding: usize, buffer: GpuBuffer, size: u64) {
        assert!(
            binding < MAX_UBO_DYNAMIC_BIND_COUNT,
            "Dynamic ubo binding value ({}) exceeds max allowed binding count ({})",
            binding,
            MAX_UBO_DYNAMIC_BIND_COUNT
        );
        assert!(size > 0);
        self.desc_requires.dynamic_ubos[binding] = buffer;
        self.desc_requires.dynamic_ubo_sizes[binding] = size;
    }

    pub fn bind_ssbo(&mut self, binding: usize, buffer: GpuBuffer, size: u64) {
        assert!(
            binding < MAX_SSBO_BIND_COUNT,
            "SSBO binding value ({}) exceeds max allowed binding count ({})",
            binding,
            MAX_SSBO_BIND_COUNT
        );
        assert!(size > 0);
        self.desc_requires.ssbos[binding] = buffer;
        self.desc_requires.ssbo_sizes[binding] = size;
    }

    pub fn bind_sampler(&mut self, images: &[DescriptorImage; MAX_SAMPLER_BIND_COUNT]) {
        self.desc_requires.samplers = *images;
    }

    pub fn bind_storage_image(&mut self, images: &[DescriptorImage; MAX_STORAGE_IMAGE_BIND_COUNT]) {
        self.desc_requires.storage_images = *images;
    }

    /// Bind the descriptor sets matching the current requirements.
    ///
    /// If the requirements equal what is already bound, only the cache
    /// entry's timestamp is refreshed.
    pub fn bind_descriptors(
        &mut self,
        cmd: GpuCommandBuffer,
        layout: &PipelineLayout,
        dynamic_offsets: &[u32],
        bind_point: PipelineBindPoint,
        current_frame: u64,
    ) -> BackendResult<()> {
        assert!(layout.is_built(), "Descriptors bound with an unbuilt pipeline layout");
        self.desc_requires.pipeline_layout = layout.get();
        let key = self.desc_requires;

        if self.bound_descriptor == Some(key) {
            if let Some(info) = self.descriptor_sets.get_mut(&key) {
                info.last_used_frame = current_frame;
            }
            self.desc_requires = DescriptorKey::default();
            return Ok(());
        }

        let sets = match self.descriptor_sets.get_mut(&key) {
            Some(info) => {
                info.last_used_frame = current_frame;
                info.sets
            }
            None => {
                let mut info = self.create_descriptor_sets(layout, &key, current_frame)?;
                info.last_used_frame = current_frame;
                self.descriptor_sets.insert(key, info);
                info.sets
            }
        };

        self.device
            .cmd_bind_descriptor_sets(cmd, bind_point, layout.get(), &sets, dynamic_offsets);

        self.bound_descriptor = Some(key);
        self.desc_requires = DescriptorKey::default();
        Ok(())
    }

    fn create_descriptor_sets(
        &mut self,
        layout: &PipelineLayout,
        key: &DescriptorKey,
        current_frame: u64,
    ) -> BackendResult<DescriptorSetInfo> {
        if self.descriptor_sets.len() * MAX_DESCRIPTOR_TYPE_COUNT > self.current_pool_size as usize {
            self.increase_pool_capacity(current_frame)?;
        }

        let layouts = *layout.set_layouts();
        let allocated = self
            .device
            .allocate_descriptor_sets(self.descriptor_pool, &layouts)?;
        let mut sets = [GpuDescriptorSet::NULL; MAX_DESCRIPTOR_TYPE_COUNT];
        sets.copy_from_slice(&allocated);

        let mut writes = Vec::with_capacity(20);

        let buffer_sets = [
            (UBO_SET_VALUE, DescriptorType::UniformBuffer, &key.ubos[..], &key.ubo_sizes[..]),
            (
                UBO_DYNAMIC_SET_VALUE,
                DescriptorType::UniformBufferDynamic,
                &key.dynamic_ubos[..],
                &key.dynamic_ubo_sizes[..],
            ),
            (SSBO_SET_VALUE, DescriptorType::StorageBuffer, &key.ssbos[..], &key.ssbo_sizes[..]),
        ];
        for (set, ty, buffers, sizes) in buffer_sets {
            for (binding, (buffer, size)) in buffers.iter().zip(sizes).enumerate() {
                if buffer.is_null() {
                    continue;
                }
                writes.push(DescriptorWrite {
                    set: sets[set],
                    binding: binding as u32,
                    ty,
                    resource: DescriptorResource::Buffer {
                        buffer: *buffer,
                        offset: 0,
                        range: *size,
                    },
                });
            }
        }

        for (binding, image) in key.samplers.iter().enumerate() {
            if image.sampler.is_null() {
                continue;
            }
            assert!(
                !image.image_view.is_null(),
                "Image view not set for descriptor binding {}",
                binding
            );
            writes.push(DescriptorWrite {
                set: sets[SAMPLER_SET_VALUE],
                binding: binding as u32,
                ty: DescriptorType::CombinedImageSampler,
                resource: DescriptorResource::Image {
                    view: image.image_view,
                    layout: image.image_layout,
                    sampler: image.sampler,
                },
            });
        }

        for (binding, image) in key.storage_images.iter().enumerate() {
            if image.image_view.is_null() {
                continue;
            }
            writes.push(DescriptorWrite {
                set: sets[STORAGE_IMAGE_SET_VALUE],
                binding: binding as u32,
                ty: DescriptorType::StorageImage,
                resource: DescriptorResource::Image {
                    view: image.image_view,
                    layout: ImageLayout::General,
                    sampler: image.sampler,
                },
            });
        }

        if !writes.is_empty() {
            self.device.update_descriptor_sets(&writes);
        }
        log::debug!(
            "Descriptor cache miss: allocated {} sets with {} writes",
            MAX_DESCRIPTOR_TYPE_COUNT,
            writes.len()
        );

        Ok(DescriptorSetInfo {
            layouts,
            sets,
            pool: self.descriptor_pool,
            last_used_frame: 0,
        })
    }

    fn create_descriptor_pool(&mut self) -> BackendResult<()> {
        let size = self.current_pool_size;
        let sizes = [
            DescriptorPoolSize {
                ty: DescriptorType::UniformBuffer,
                count: size * MAX_UBO_BIND_COUNT as u32,
            },
            DescriptorPoolSize {
                ty: DescriptorType::UniformBufferDynamic,
                count: size * MAX_UBO_DYNAMIC_BIND_COUNT as u32,
            },
            DescriptorPoolSize {
                ty: DescriptorType::StorageBuffer,
                count: size * MAX_SSBO_BIND_COUNT as u32,
            },
            DescriptorPoolSize {
                ty: DescriptorType::CombinedImageSampler,
                count: size * MAX_SAMPLER_BIND_COUNT as u32,
            },
            DescriptorPoolSize {
                ty: DescriptorType::StorageImage,
                count: size * MAX_STORAGE_IMAGE_BIND_COUNT as u32,
            },
        ];
        self.descriptor_pool = self
            .device
            .create_descriptor_pool(size * MAX_DESCRIPTOR_TYPE_COUNT as u32, &sizes)?;
        Ok(())
    }

    /// Retire the current pool with every set cached from it and create one
    /// twice the size. Sets from the old pool may be bound in this frame, so
    /// it lives for a full lifetime from now.
    fn increase_pool_capacity(&mut self, current_frame: u64) -> BackendResult<()> {
        self.retired_pools.push((self.descriptor_pool, current_frame));
        self.descriptor_sets.clear();
        self.bound_descriptor = None;

        self.current_pool_size *= 2;
        log::debug!(
            "Descriptor pool exhausted: growing to {} entries",
            self.current_pool_size
        );
        self.create_descriptor_pool()
    }

    pub fn descriptor_pool_size(&self) -> u32 {
        self.current_pool_size
    }

    pub fn cached_pipeline_count(&self) -> usize {
        self.pipelines.len() + self.compute_pipelines.len()
    }

    pub fn cached_descriptor_count(&self) -> usize {
        self.descriptor_sets.len()
    }

    // ========================================================================
    // Maintenance
    // ========================================================================

    /// Destroy pipelines, descriptor sets and retired pools not used within
    /// the lifetime horizon.
    pub fn clean_cache(&mut self, current_frame: u64) {
        let lifetime = self.lifetime_frames;
        let device = &self.device;

        let mut evicted = evict_pipelines(&mut self.pipelines, device.as_ref(), lifetime, current_frame)
            + evict_pipelines(&mut self.compute_pipelines, device.as_ref(), lifetime, current_frame);

        let bound = &mut self.bound_descriptor;
        self.descriptor_sets.retain(|key, info| {
            if info.last_used_frame + lifetime < current_frame {
                device.free_descriptor_sets(info.pool, &info.sets);
                if *bound == Some(*key) {
                    *bound = None;
                }
                evicted += 1;
                false
            } else {
                true
            }
        });

        self.retired_pools.retain(|(pool, retired)| {
            if retired + lifetime < current_frame {
                device.destroy_descriptor_pool(*pool);
                false
            } else {
                true
            }
        });

        if evicted > 0 {
            log::debug!("Pipeline cache: evicted {} entries at frame {}", evicted, current_frame);
        }
    }

    /// Destroy everything. The cache is unusable afterwards.
    pub fn clear(&mut self) {
        let graphics = self.pipelines.drain().map(|(_, entry)| entry);
        for entry in graphics.chain(self.compute_pipelines.drain().map(|(_, entry)| entry)) {
            self.device.destroy_pipeline(entry.pipeline);
        }
        // Destroying a pool releases its sets.
        self.descriptor_sets.clear();
        for (pool, _) in self.retired_pools.drain(..) {
            self.device.destroy_descriptor_pool(pool);
        }
        if !self.descriptor_pool.is_null() {
            self.device.destroy_descriptor_pool(self.descriptor_pool);
            self.descriptor_pool = GpuDescriptorPool::NULL;
        }
        self.set_pipeline_key_to_default();
    }
}

fn evict_pipelines<K>(
    cache: &mut HashMap<K, CachedPipeline>,
    device: &dyn Device,
    lifetime: u64,
    current_frame: u64,
) -> usize {
    let before = cache.len();
    cache.retain(|_, entry| {
        if entry.last_used_frame + lifetime < current_frame {
            device.destroy_pipeline(entry.pipeline);
            false
        } else {
            true
        }
    });
    before - cache.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{DummyDevice, ObjectKind, RecordedCommand, ShaderStages};
    use rstest::{fixture, rstest};

    struct Ctx {
        device: Arc<DummyDevice>,
        cache: PipelineCache,
        layout: PipelineLayout,
        cmd: GpuCommandBuffer,
    }

    #[fixture]
    fn ctx() -> Ctx {
        let device = Arc::new(DummyDevice::new());
        let cache = PipelineCache::new(device.clone(), 1000, 10).unwrap();
        let mut layout = PipelineLayout::new();
        layout.add_descriptor_layout(UBO_SET_VALUE, 0, DescriptorType::UniformBuffer, ShaderStages::VERTEX);
        layout.build(device.as_ref()).unwrap();
        let cmd = device.allocate_command_buffer().unwrap();
        device.begin_command_buffer(cmd).unwrap();
        Ctx {
            device,
            cache,
            layout,
            cmd,
        }
    }

    fn prepare_draw(ctx: &mut Ctx, fragment: u64) {
        let mut shaders = [GpuShaderModule::NULL; ShaderStage::COUNT];
        shaders[ShaderStage::Vertex.index()] = GpuShaderModule::from_raw(1000);
        shaders[ShaderStage::Fragment.index()] = GpuShaderModule::from_raw(fragment);
        ctx.cache.bind_shader_modules(&shaders);
        ctx.cache.bind_render_pass(GpuRenderPass::from_raw(2000), 1);
    }

    #[rstest]
    fn test_same_key_returns_same_pipeline(mut ctx: Ctx) {
        prepare_draw(&mut ctx, 1);
        let a = ctx.cache.bind_graphics_pipeline(ctx.cmd, &ctx.layout, 0).unwrap();
        prepare_draw(&mut ctx, 1);
        let b = ctx.cache.bind_graphics_pipeline(ctx.cmd, &ctx.layout, 1).unwrap();
        assert_eq!(a, b);
        assert_eq!(ctx.device.created(ObjectKind::Pipeline), 1);
    }

    #[rstest]
    fn test_shader_stage_difference_creates_new_pipeline(mut ctx: Ctx) {
        prepare_draw(&mut ctx, 1);
        let a = ctx.cache.bind_graphics_pipeline(ctx.cmd, &ctx.layout, 0).unwrap();
        prepare_draw(&mut ctx, 2);
        let b = ctx.cache.bind_graphics_pipeline(ctx.cmd, &ctx.layout, 0).unwrap();
        assert_ne!(a, b);
        assert_eq!(ctx.cache.cached_pipeline_count(), 2);
    }

    #[rstest]
    fn test_key_resets_after_bind(mut ctx: Ctx) {
        prepare_draw(&mut ctx, 1);
        ctx.cache.bind_cull_mode(CullMode::None);
        ctx.cache.bind_graphics_pipeline(ctx.cmd, &ctx.layout, 0).unwrap();

        let requires = ctx.cache.graphics_requirements();
        assert_eq!(requires.raster_state.cull_mode, CullMode::Front);
        assert!(requires.shaders.iter().all(|m| m.is_null()));
        // Render pass survives until the pass ends.
        assert_eq!(requires.render_pass, GpuRenderPass::from_raw(2000));

        ctx.cache.set_pipeline_key_to_default();
        assert_eq!(*ctx.cache.graphics_requirements(), GraphicsPipelineKey::default());
    }

    #[rstest]
    fn test_pipeline_evicted_after_lifetime(mut ctx: Ctx) {
        prepare_draw(&mut ctx, 1);
        let first = ctx.cache.bind_graphics_pipeline(ctx.cmd, &ctx.layout, 0).unwrap();

        // Still within the horizon.
        ctx.cache.clean_cache(10);
        assert_eq!(ctx.cache.cached_pipeline_count(), 1);

        ctx.cache.clean_cache(11);
        assert_eq!(ctx.cache.cached_pipeline_count(), 0);
        assert_eq!(ctx.device.destroyed(ObjectKind::Pipeline), 1);

        prepare_draw(&mut ctx, 1);
        let second = ctx.cache.bind_graphics_pipeline(ctx.cmd, &ctx.layout, 12).unwrap();
        assert_ne!(first, second);
    }

    #[rstest]
    fn test_descriptor_rebind_short_circuits(mut ctx: Ctx) {
        let ubo = GpuBuffer::from_raw(77);
        ctx.cache.bind_ubo(0, ubo, 64);
        ctx.cache
            .bind_descriptors(ctx.cmd, &ctx.layout, &[], PipelineBindPoint::Graphics, 0)
            .unwrap();
        let sets_after_first = ctx.device.created(ObjectKind::DescriptorSet);
        assert_eq!(sets_after_first, MAX_DESCRIPTOR_TYPE_COUNT);

        ctx.cache.bind_ubo(0, ubo, 64);
        ctx.cache
            .bind_descriptors(ctx.cmd, &ctx.layout, &[], PipelineBindPoint::Graphics, 5)
            .unwrap();
        assert_eq!(ctx.device.created(ObjectKind::DescriptorSet), sets_after_first);

        let binds = ctx
            .device
            .recorded_commands(ctx.cmd)
            .into_iter()
            .filter(|c| matches!(c, RecordedCommand::BindDescriptorSets { .. }))
            .count();
        assert_eq!(binds, 1);

        // The short-circuit refreshed the stamp, so frame 15 keeps the sets.
        ctx.cache.clean_cache(15);
        assert_eq!(ctx.cache.cached_descriptor_count(), 1);
    }

    #[rstest]
    fn test_descriptor_cache_hit_after_other_binding(mut ctx: Ctx) {
        let a = GpuBuffer::from_raw(1);
        let b = GpuBuffer::from_raw(2);
        for buffer in [a, b, a] {
            ctx.cache.bind_ubo(0, buffer, 16);
            ctx.cache
                .bind_descriptors(ctx.cmd, &ctx.layout, &[], PipelineBindPoint::Graphics, 0)
                .unwrap();
        }
        assert_eq!(ctx.cache.cached_descriptor_count(), 2);
        assert_eq!(
            ctx.device.created(ObjectKind::DescriptorSet),
            2 * MAX_DESCRIPTOR_TYPE_COUNT
        );
    }

    #[rstest]
    fn test_evicted_descriptor_sets_are_freed(mut ctx: Ctx) {
        ctx.cache.bind_ubo(0, GpuBuffer::from_raw(1), 16);
        ctx.cache
            .bind_descriptors(ctx.cmd, &ctx.layout, &[], PipelineBindPoint::Graphics, 0)
            .unwrap();
        ctx.cache.clean_cache(11);
        assert_eq!(ctx.cache.cached_descriptor_count(), 0);
        assert_eq!(ctx.device.live(ObjectKind::DescriptorSet), 0);
    }

    #[test]
    fn test_descriptor_pool_growth_retires_old_pool() {
        let device = Arc::new(DummyDevice::new());
        let mut cache = PipelineCache::new(device.clone(), 2, 10).unwrap();
        let mut layout = PipelineLayout::new();
        layout.build(device.as_ref()).unwrap();
        let cmd = device.allocate_command_buffer().unwrap();
        device.begin_command_buffer(cmd).unwrap();

        for raw in 1..=2 {
            cache.bind_ubo(0, GpuBuffer::from_raw(raw), 16);
            cache
                .bind_descriptors(cmd, &layout, &[], PipelineBindPoint::Graphics, 0)
                .unwrap();
        }

        assert_eq!(cache.descriptor_pool_size(), 4);
        assert_eq!(device.created(ObjectKind::DescriptorPool), 2);
        assert_eq!(cache.cached_descriptor_count(), 1);

        cache.clean_cache(5);
        assert_eq!(device.destroyed(ObjectKind::DescriptorPool), 0);
        cache.clean_cache(11);
        assert_eq!(device.destroyed(ObjectKind::DescriptorPool), 1);
    }

    #[test]
    fn test_retired_pool_outlives_sets_bound_in_growth_frame() {
        let device = Arc::new(DummyDevice::new());
        let mut cache = PipelineCache::new(device.clone(), 2, 10).unwrap();
        let mut layout = PipelineLayout::new();
        layout.build(device.as_ref()).unwrap();
        let cmd = device.allocate_command_buffer().unwrap();
        device.begin_command_buffer(cmd).unwrap();

        // The first set is cached long ago, the pool runs out at frame 20.
        cache.bind_ubo(0, GpuBuffer::from_raw(1), 16);
        cache
            .bind_descriptors(cmd, &layout, &[], PipelineBindPoint::Graphics, 0)
            .unwrap();
        cache.bind_ubo(0, GpuBuffer::from_raw(2), 16);
        cache
            .bind_descriptors(cmd, &layout, &[], PipelineBindPoint::Graphics, 20)
            .unwrap();
        assert_eq!(cache.descriptor_pool_size(), 4);

        cache.clean_cache(25);
        assert_eq!(device.destroyed(ObjectKind::DescriptorPool), 0);
        cache.clean_cache(31);
        assert_eq!(device.destroyed(ObjectKind::DescriptorPool), 1);
    }

    #[rstest]
    fn test_clear_destroys_graphics_and_compute_pipelines(mut ctx: Ctx) {
        prepare_draw(&mut ctx, 1);
        ctx.cache.bind_graphics_pipeline(ctx.cmd, &ctx.layout, 0).unwrap();
        ctx.cache.bind_compute_shader_module(GpuShaderModule::from_raw(3000));
        ctx.cache.bind_compute_pipeline(ctx.cmd, &ctx.layout, 0).unwrap();
        assert_eq!(ctx.cache.cached_pipeline_count(), 2);

        ctx.cache.clear();
        assert_eq!(ctx.cache.cached_pipeline_count(), 0);
        assert_eq!(ctx.device.destroyed(ObjectKind::Pipeline), 2);
    }

    #[rstest]
    fn test_default_key_resets_bound_descriptor(mut ctx: Ctx) {
        let ubo = GpuBuffer::from_raw(9);
        ctx.cache.bind_ubo(0, ubo, 16);
        ctx.cache
            .bind_descriptors(ctx.cmd, &ctx.layout, &[], PipelineBindPoint::Graphics, 0)
            .unwrap();
        ctx.cache.set_pipeline_key_to_default();

        ctx.cache.bind_ubo(0, ubo, 16);
        ctx.cache
            .bind_descriptors(ctx.cmd, &ctx.layout, &[], PipelineBindPoint::Graphics, 0)
            .unwrap();

        // Rebound from the cache into the new buffer, no new allocation.
        let binds = ctx
            .device
            .recorded_commands(ctx.cmd)
            .into_iter()
            .filter(|c| matches!(c, RecordedCommand::BindDescriptorSets { .. }))
            .count();
        assert_eq!(binds, 2);
        assert_eq!(ctx.cache.cached_descriptor_count(), 1);
    }

    #[rstest]
    #[should_panic(expected = "exceeds max allowed binding count")]
    fn test_ubo_binding_out_of_range(mut ctx: Ctx) {
        ctx.cache.bind_ubo(MAX_UBO_BIND_COUNT, GpuBuffer::from_raw(1), 4);
    }

    #[rstest]
    fn test_clear_destroys_everything(mut ctx: Ctx) {
        prepare_draw(&mut ctx, 1);
        ctx.cache.bind_graphics_pipeline(ctx.cmd, &ctx.layout, 0).unwrap();
        ctx.cache.clear();
        assert_eq!(ctx.device.live(ObjectKind::Pipeline), 0);
        assert_eq!(ctx.device.live(ObjectKind::DescriptorPool), 0);
    }
}

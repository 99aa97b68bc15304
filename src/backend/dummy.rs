//! In-memory device used by tests and headless tooling.
//!
//! The dummy device hands out unique ids for every object, counts creations
//! and destructions per object kind, keeps the contents of mapped buffers and
//! records every command written into a command buffer.
//!
//! Fences signal at submission by default. A device built with
//! [`DummyDevice::with_manual_fences`] leaves them pending until the test calls
//! [`DummyDevice::signal_fence`] or [`DummyDevice::signal_all_fences`]; a
//! thread blocked in [`Device::wait_for_fences`] sleeps on a condition
//! variable until then.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::backend::traits::{BackendError, BackendResult, Device};
use crate::backend::types::*;
use crate::pipeline_cache::{ComputePipelineKey, GraphicsPipelineKey};

/// Kinds of device object tracked by the dummy device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    Buffer,
    Image,
    ImageView,
    Sampler,
    ShaderModule,
    DescriptorSetLayout,
    PipelineLayout,
    Pipeline,
    DescriptorPool,
    DescriptorSet,
    RenderPass,
    Framebuffer,
    CommandBuffer,
    Fence,
    Semaphore,
}

/// A command recorded into a dummy command buffer.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordedCommand {
    BeginRenderPass {
        render_pass: GpuRenderPass,
        framebuffer: GpuFramebuffer,
        width: u32,
        height: u32,
        clear_values: Vec<ClearValue>,
    },
    EndRenderPass,
    BindPipeline(PipelineBindPoint, GpuPipeline),
    BindDescriptorSets {
        layout: GpuPipelineLayout,
        sets: Vec<GpuDescriptorSet>,
        dynamic_offsets: Vec<u32>,
    },
    BindVertexBuffers(Vec<GpuBuffer>),
    BindIndexBuffer(GpuBuffer, IndexType),
    SetViewport(Viewport),
    SetScissor(Rect2D),
    PushConstants {
        stages: ShaderStages,
        size: usize,
    },
    Draw {
        vertex_count: u32,
        instance_count: u32,
    },
    DrawIndexed {
        index_count: u32,
        instance_count: u32,
        first_index: u32,
    },
    Dispatch(u32, u32, u32),
    CopyBuffer {
        src: GpuBuffer,
        dst: GpuBuffer,
        regions: Vec<BufferCopy>,
    },
    CopyBufferToImage {
        src: GpuBuffer,
        dst: GpuImage,
        regions: Vec<BufferImageCopy>,
    },
    ImageBarrier(ImageBarrier),
    BufferBarrier(BufferBarrier),
}

/// A queue submission as seen by the dummy device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitRecord {
    pub cmd: GpuCommandBuffer,
    pub wait_semaphores: Vec<GpuSemaphore>,
    pub signal_semaphores: Vec<GpuSemaphore>,
    pub fence: GpuFence,
}

#[derive(Debug, Default, Clone, Copy)]
struct Counter {
    created: usize,
    destroyed: usize,
}

struct DescriptorPoolState {
    max_sets: u32,
    allocated: HashSet<u64>,
}

struct DummySwapchain {
    image_count: u32,
    next_image: u32,
}

#[derive(Default)]
struct DummyState {
    next_id: u64,
    counters: HashMap<ObjectKind, Counter>,
    live: HashMap<u64, ObjectKind>,
    buffer_contents: HashMap<u64, Vec<u8>>,
    mapped_buffers: HashSet<u64>,
    fences: HashMap<u64, bool>,
    pools: HashMap<u64, DescriptorPoolState>,
    set_pool: HashMap<u64, u64>,
    recorded: HashMap<u64, Vec<RecordedCommand>>,
    recording: HashSet<u64>,
    submissions: Vec<SubmitRecord>,
    presents: Vec<(GpuSwapchain, u32, Vec<GpuSemaphore>)>,
    acquire_signals: Vec<GpuSemaphore>,
    swapchains: HashMap<u64, DummySwapchain>,
    stale_acquires: u32,
}

impl DummyState {
    fn create(&mut self, kind: ObjectKind) -> u64 {
        self.next_id += 1;
        let id = self.next_id;
        self.counters.entry(kind).or_default().created += 1;
        self.live.insert(id, kind);
        log::trace!("Dummy device: created {:?} {}", kind, id);
        id
    }

    fn destroy(&mut self, kind: ObjectKind, id: u64) {
        if id == 0 {
            return;
        }
        match self.live.remove(&id) {
            Some(live_kind) => {
                debug_assert_eq!(live_kind, kind, "Destroyed object {} with the wrong kind", id);
                self.counters.entry(kind).or_default().destroyed += 1;
                log::trace!("Dummy device: destroyed {:?} {}", kind, id);
            }
            None => log::warn!("Dummy device: destroy of unknown {:?} {}", kind, id),
        }
    }

    fn record(&mut self, cmd: GpuCommandBuffer, command: RecordedCommand) {
        debug_assert!(
            self.recording.contains(&cmd.0),
            "Command recorded into buffer {} outside begin/end",
            cmd.0
        );
        self.recorded.entry(cmd.0).or_default().push(command);
    }

    fn fences_satisfied(&self, fences: &[GpuFence], wait_all: bool) -> bool {
        let signaled = |f: &GpuFence| self.fences.get(&f.0).copied().unwrap_or(false);
        if wait_all {
            fences.iter().all(signaled)
        } else {
            fences.iter().any(signaled)
        }
    }
}

/// Device implementation that never touches a GPU.
pub struct DummyDevice {
    state: Mutex<DummyState>,
    fence_signal: Condvar,
    manual_fences: bool,
}

impl Default for DummyDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl DummyDevice {
    /// Fences signal as soon as their submission is queued.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(DummyState::default()),
            fence_signal: Condvar::new(),
            manual_fences: false,
        }
    }

    /// Fences stay pending until signalled by the test.
    pub fn with_manual_fences() -> Self {
        Self {
            manual_fences: true,
            ..Self::new()
        }
    }

    /// Number of objects of `kind` created so far.
    pub fn created(&self, kind: ObjectKind) -> usize {
        self.state.lock().counters.get(&kind).map_or(0, |c| c.created)
    }

    /// Number of objects of `kind` destroyed so far.
    pub fn destroyed(&self, kind: ObjectKind) -> usize {
        self.state.lock().counters.get(&kind).map_or(0, |c| c.destroyed)
    }

    /// Objects of `kind` created and not yet destroyed.
    pub fn live(&self, kind: ObjectKind) -> usize {
        self.state.lock().live.values().filter(|k| **k == kind).count()
    }

    pub fn is_live(&self, raw: u64) -> bool {
        self.state.lock().live.contains_key(&raw)
    }

    /// Contents last written to a buffer.
    pub fn buffer_contents(&self, buffer: GpuBuffer) -> Vec<u8> {
        self.state
            .lock()
            .buffer_contents
            .get(&buffer.0)
            .cloned()
            .unwrap_or_default()
    }

    /// Commands recorded into `cmd` since it was last begun.
    pub fn recorded_commands(&self, cmd: GpuCommandBuffer) -> Vec<RecordedCommand> {
        self.state.lock().recorded.get(&cmd.0).cloned().unwrap_or_default()
    }

    /// Every command recorded into any live or freed buffer, in submission
    /// order of the buffers.
    pub fn all_recorded_commands(&self) -> Vec<RecordedCommand> {
        let state = self.state.lock();
        let mut ids: Vec<_> = state.recorded.keys().copied().collect();
        ids.sort_unstable();
        ids.iter()
            .flat_map(|id| state.recorded[id].iter().cloned())
            .collect()
    }

    pub fn submissions(&self) -> Vec<SubmitRecord> {
        self.state.lock().submissions.clone()
    }

    pub fn presents(&self) -> Vec<(GpuSwapchain, u32, Vec<GpuSemaphore>)> {
        self.state.lock().presents.clone()
    }

    /// Semaphore handed to every successful acquire, in order.
    pub fn acquire_signals(&self) -> Vec<GpuSemaphore> {
        self.state.lock().acquire_signals.clone()
    }

    /// Fences submitted and not yet signalled.
    pub fn pending_fences(&self) -> Vec<GpuFence> {
        let state = self.state.lock();
        let mut pending: Vec<_> = state
            .submissions
            .iter()
            .map(|s| s.fence)
            .filter(|f| state.fences.get(&f.0) == Some(&false))
            .collect();
        pending.dedup();
        pending
    }

    pub fn signal_fence(&self, fence: GpuFence) {
        let mut state = self.state.lock();
        if let Some(signaled) = state.fences.get_mut(&fence.0) {
            *signaled = true;
        }
        self.fence_signal.notify_all();
    }

    pub fn signal_all_fences(&self) {
        let mut state = self.state.lock();
        for signaled in state.fences.values_mut() {
            *signaled = true;
        }
        self.fence_signal.notify_all();
    }

    /// Make the next `count` acquires report a stale swapchain.
    pub fn force_stale_acquire(&self, count: u32) {
        self.state.lock().stale_acquires = count;
    }

    /// Create a swapchain with `image_count` images and views.
    pub fn create_swapchain(&self, format: Format, width: u32, height: u32, image_count: u32) -> Swapchain {
        let mut state = self.state.lock();
        state.next_id += 1;
        let handle = GpuSwapchain(state.next_id);
        let images: Vec<_> = (0..image_count)
            .map(|_| GpuImage(state.create(ObjectKind::Image)))
            .collect();
        let image_views = (0..image_count)
            .map(|_| GpuImageView(state.create(ObjectKind::ImageView)))
            .collect();
        state.swapchains.insert(
            handle.0,
            DummySwapchain {
                image_count,
                next_image: 0,
            },
        );
        Swapchain {
            handle,
            format,
            width,
            height,
            images,
            image_views,
        }
    }
}

impl Device for DummyDevice {
    fn create_buffer(&self, desc: &BufferDesc) -> BackendResult<GpuBuffer> {
        if desc.size == 0 {
            return Err(BackendError::BufferCreationFailed("zero sized buffer".into()));
        }
        let mut state = self.state.lock();
        let id = state.create(ObjectKind::Buffer);
        state.buffer_contents.insert(id, vec![0; desc.size as usize]);
        if desc.memory == MemoryLocation::CpuToGpu {
            state.mapped_buffers.insert(id);
        }
        Ok(GpuBuffer(id))
    }

    fn write_buffer(&self, buffer: GpuBuffer, offset: u64, data: &[u8]) -> BackendResult<()> {
        let mut state = self.state.lock();
        if !state.mapped_buffers.contains(&buffer.0) {
            return Err(BackendError::MapFailed(format!("buffer {} is not host visible", buffer.0)));
        }
        let contents = state
            .buffer_contents
            .get_mut(&buffer.0)
            .ok_or_else(|| BackendError::InvalidHandle(format!("buffer {}", buffer.0)))?;
        let start = offset as usize;
        let end = start + data.len();
        if end > contents.len() {
            return Err(BackendError::MapFailed(format!(
                "write of {} bytes at {} overflows buffer of {} bytes",
                data.len(),
                offset,
                contents.len()
            )));
        }
        contents[start..end].copy_from_slice(data);
        Ok(())
    }

    fn destroy_buffer(&self, buffer: GpuBuffer) {
        let mut state = self.state.lock();
        state.buffer_contents.remove(&buffer.0);
        state.mapped_buffers.remove(&buffer.0);
        state.destroy(ObjectKind::Buffer, buffer.0);
    }

    fn create_image(&self, desc: &ImageDesc) -> BackendResult<GpuImage> {
        if desc.width == 0 || desc.height == 0 {
            return Err(BackendError::ImageCreationFailed("zero sized image".into()));
        }
        Ok(GpuImage(self.state.lock().create(ObjectKind::Image)))
    }

    fn destroy_image(&self, image: GpuImage) {
        self.state.lock().destroy(ObjectKind::Image, image.0);
    }

    fn create_image_view(&self, desc: &ImageViewDesc) -> BackendResult<GpuImageView> {
        if desc.image.is_null() {
            return Err(BackendError::ImageCreationFailed("view of null image".into()));
        }
        Ok(GpuImageView(self.state.lock().create(ObjectKind::ImageView)))
    }

    fn destroy_image_view(&self, view: GpuImageView) {
        self.state.lock().destroy(ObjectKind::ImageView, view.0);
    }

    fn create_sampler(&self, _desc: &SamplerDesc) -> BackendResult<GpuSampler> {
        Ok(GpuSampler(self.state.lock().create(ObjectKind::Sampler)))
    }

    fn destroy_sampler(&self, sampler: GpuSampler) {
        self.state.lock().destroy(ObjectKind::Sampler, sampler.0);
    }

    fn create_shader_module(&self, stage: ShaderStage, spirv: &[u32]) -> BackendResult<GpuShaderModule> {
        if spirv.is_empty() {
            return Err(BackendError::ShaderCreationFailed(format!("empty {:?} shader", stage)));
        }
        Ok(GpuShaderModule(self.state.lock().create(ObjectKind::ShaderModule)))
    }

    fn destroy_shader_module(&self, module: GpuShaderModule) {
        self.state.lock().destroy(ObjectKind::ShaderModule, module.0);
    }

    fn create_descriptor_set_layout(&self, _bindings: &[DescriptorBinding]) -> BackendResult<GpuDescriptorSetLayout> {
        Ok(GpuDescriptorSetLayout(
            self.state.lock().create(ObjectKind::DescriptorSetLayout),
        ))
    }

    fn destroy_descriptor_set_layout(&self, layout: GpuDescriptorSetLayout) {
        self.state.lock().destroy(ObjectKind::DescriptorSetLayout, layout.0);
    }

    fn create_pipeline_layout(
        &self,
        _set_layouts: &[GpuDescriptorSetLayout],
        _push_constants: &[PushConstantRange],
    ) -> BackendResult<GpuPipelineLayout> {
        Ok(GpuPipelineLayout(self.state.lock().create(ObjectKind::PipelineLayout)))
    }

    fn destroy_pipeline_layout(&self, layout: GpuPipelineLayout) {
        self.state.lock().destroy(ObjectKind::PipelineLayout, layout.0);
    }

    fn create_graphics_pipeline(&self, key: &GraphicsPipelineKey) -> BackendResult<GpuPipeline> {
        if key.render_pass.is_null() || key.pipeline_layout.is_null() {
            return Err(BackendError::PipelineCreationFailed(
                "graphics pipeline without render pass or layout".into(),
            ));
        }
        Ok(GpuPipeline(self.state.lock().create(ObjectKind::Pipeline)))
    }

    fn create_compute_pipeline(&self, key: &ComputePipelineKey) -> BackendResult<GpuPipeline> {
        if key.shader.is_null() || key.pipeline_layout.is_null() {
            return Err(BackendError::PipelineCreationFailed(
                "compute pipeline without shader or layout".into(),
            ));
        }
        Ok(GpuPipeline(self.state.lock().create(ObjectKind::Pipeline)))
    }

    fn destroy_pipeline(&self, pipeline: GpuPipeline) {
        self.state.lock().destroy(ObjectKind::Pipeline, pipeline.0);
    }

    fn create_descriptor_pool(&self, max_sets: u32, _sizes: &[DescriptorPoolSize]) -> BackendResult<GpuDescriptorPool> {
        let mut state = self.state.lock();
        let id = state.create(ObjectKind::DescriptorPool);
        state.pools.insert(
            id,
            DescriptorPoolState {
                max_sets,
                allocated: HashSet::new(),
            },
        );
        Ok(GpuDescriptorPool(id))
    }

    fn destroy_descriptor_pool(&self, pool: GpuDescriptorPool) {
        let mut state = self.state.lock();
        if let Some(pool_state) = state.pools.remove(&pool.0) {
            for set in pool_state.allocated {
                state.set_pool.remove(&set);
                state.destroy(ObjectKind::DescriptorSet, set);
            }
        }
        state.destroy(ObjectKind::DescriptorPool, pool.0);
    }

    fn allocate_descriptor_sets(
        &self,
        pool: GpuDescriptorPool,
        layouts: &[GpuDescriptorSetLayout],
    ) -> BackendResult<Vec<GpuDescriptorSet>> {
        let mut state = self.state.lock();
        let (max_sets, allocated) = state
            .pools
            .get(&pool.0)
            .map(|p| (p.max_sets, p.allocated.len()))
            .ok_or_else(|| BackendError::InvalidHandle(format!("descriptor pool {}", pool.0)))?;
        if allocated + layouts.len() > max_sets as usize {
            return Err(BackendError::DescriptorCreationFailed("descriptor pool exhausted".into()));
        }

        let mut sets = Vec::with_capacity(layouts.len());
        for _ in layouts {
            let id = state.create(ObjectKind::DescriptorSet);
            state.set_pool.insert(id, pool.0);
            if let Some(p) = state.pools.get_mut(&pool.0) {
                p.allocated.insert(id);
            }
            sets.push(GpuDescriptorSet(id));
        }
        Ok(sets)
    }

    fn free_descriptor_sets(&self, pool: GpuDescriptorPool, sets: &[GpuDescriptorSet]) {
        let mut state = self.state.lock();
        for set in sets {
            if let Some(p) = state.pools.get_mut(&pool.0) {
                p.allocated.remove(&set.0);
            }
            state.set_pool.remove(&set.0);
            state.destroy(ObjectKind::DescriptorSet, set.0);
        }
    }

    fn update_descriptor_sets(&self, writes: &[DescriptorWrite]) {
        let state = self.state.lock();
        for write in writes {
            debug_assert!(
                state.set_pool.contains_key(&write.set.0),
                "Descriptor write into unknown set {}",
                write.set.0
            );
        }
    }

    fn create_render_pass(&self, desc: &RenderPassDesc) -> BackendResult<GpuRenderPass> {
        if desc.attachments.is_empty() {
            return Err(BackendError::RenderPassCreationFailed("no attachments".into()));
        }
        Ok(GpuRenderPass(self.state.lock().create(ObjectKind::RenderPass)))
    }

    fn destroy_render_pass(&self, render_pass: GpuRenderPass) {
        self.state.lock().destroy(ObjectKind::RenderPass, render_pass.0);
    }

    fn create_framebuffer(&self, desc: &FramebufferDesc) -> BackendResult<GpuFramebuffer> {
        if desc.width == 0 || desc.height == 0 {
            return Err(BackendError::FramebufferCreationFailed("zero sized framebuffer".into()));
        }
        Ok(GpuFramebuffer(self.state.lock().create(ObjectKind::Framebuffer)))
    }

    fn destroy_framebuffer(&self, framebuffer: GpuFramebuffer) {
        self.state.lock().destroy(ObjectKind::Framebuffer, framebuffer.0);
    }

    fn create_fence(&self) -> BackendResult<GpuFence> {
        let mut state = self.state.lock();
        let id = state.create(ObjectKind::Fence);
        state.fences.insert(id, false);
        Ok(GpuFence(id))
    }

    fn destroy_fence(&self, fence: GpuFence) {
        let mut state = self.state.lock();
        state.fences.remove(&fence.0);
        state.destroy(ObjectKind::Fence, fence.0);
    }

    fn fence_signaled(&self, fence: GpuFence) -> BackendResult<bool> {
        self.state
            .lock()
            .fences
            .get(&fence.0)
            .copied()
            .ok_or_else(|| BackendError::InvalidHandle(format!("fence {}", fence.0)))
    }

    fn wait_for_fences(&self, fences: &[GpuFence], wait_all: bool, timeout_ns: u64) -> BackendResult<bool> {
        let mut state = self.state.lock();
        if state.fences_satisfied(fences, wait_all) {
            return Ok(true);
        }
        if timeout_ns == 0 {
            return Ok(false);
        }

        let deadline = Instant::now().checked_add(Duration::from_nanos(timeout_ns));
        loop {
            match deadline {
                Some(deadline) => {
                    if self.fence_signal.wait_until(&mut state, deadline).timed_out() {
                        return Ok(state.fences_satisfied(fences, wait_all));
                    }
                }
                None => self.fence_signal.wait(&mut state),
            }
            if state.fences_satisfied(fences, wait_all) {
                return Ok(true);
            }
        }
    }

    fn create_semaphore(&self) -> BackendResult<GpuSemaphore> {
        Ok(GpuSemaphore(self.state.lock().create(ObjectKind::Semaphore)))
    }

    fn destroy_semaphore(&self, semaphore: GpuSemaphore) {
        self.state.lock().destroy(ObjectKind::Semaphore, semaphore.0);
    }

    fn allocate_command_buffer(&self) -> BackendResult<GpuCommandBuffer> {
        Ok(GpuCommandBuffer(self.state.lock().create(ObjectKind::CommandBuffer)))
    }

    fn free_command_buffer(&self, cmd: GpuCommandBuffer) {
        let mut state = self.state.lock();
        state.recording.remove(&cmd.0);
        state.destroy(ObjectKind::CommandBuffer, cmd.0);
    }

    fn begin_command_buffer(&self, cmd: GpuCommandBuffer) -> BackendResult<()> {
        let mut state = self.state.lock();
        if !state.recording.insert(cmd.0) {
            return Err(BackendError::CommandBufferFailed(format!("buffer {} already recording", cmd.0)));
        }
        state.recorded.insert(cmd.0, Vec::new());
        Ok(())
    }

    fn end_command_buffer(&self, cmd: GpuCommandBuffer) -> BackendResult<()> {
        if !self.state.lock().recording.remove(&cmd.0) {
            return Err(BackendError::CommandBufferFailed(format!("buffer {} not recording", cmd.0)));
        }
        Ok(())
    }

    fn submit(&self, info: &SubmitInfo) -> BackendResult<()> {
        let mut state = self.state.lock();
        if state.recording.contains(&info.cmd.0) {
            return Err(BackendError::SubmitFailed(format!("buffer {} still recording", info.cmd.0)));
        }
        if let Some(signaled) = state.fences.get_mut(&info.fence.0) {
            *signaled = !self.manual_fences;
        }
        state.submissions.push(SubmitRecord {
            cmd: info.cmd,
            wait_semaphores: info.wait_semaphores.clone(),
            signal_semaphores: info.signal_semaphores.clone(),
            fence: info.fence,
        });
        drop(state);
        self.fence_signal.notify_all();
        Ok(())
    }

    fn wait_idle(&self) -> BackendResult<()> {
        if self.manual_fences {
            return Ok(());
        }
        let mut state = self.state.lock();
        for signaled in state.fences.values_mut() {
            *signaled = true;
        }
        Ok(())
    }

    fn acquire_next_image(&self, swapchain: GpuSwapchain, signal: GpuSemaphore) -> BackendResult<AcquireResult> {
        let mut state = self.state.lock();
        if state.stale_acquires > 0 {
            state.stale_acquires -= 1;
            return Ok(AcquireResult::Stale);
        }
        state.acquire_signals.push(signal);
        let chain = state
            .swapchains
            .get_mut(&swapchain.0)
            .ok_or_else(|| BackendError::InvalidHandle(format!("swapchain {}", swapchain.0)))?;
        let index = chain.next_image;
        chain.next_image = (chain.next_image + 1) % chain.image_count;
        Ok(AcquireResult::Acquired(index))
    }

    fn present(&self, swapchain: GpuSwapchain, image_index: u32, wait: &[GpuSemaphore]) -> BackendResult<bool> {
        self.state
            .lock()
            .presents
            .push((swapchain, image_index, wait.to_vec()));
        Ok(true)
    }

    fn cmd_begin_render_pass(&self, cmd: GpuCommandBuffer, begin: &RenderPassBegin) {
        self.state.lock().record(
            cmd,
            RecordedCommand::BeginRenderPass {
                render_pass: begin.render_pass,
                framebuffer: begin.framebuffer,
                width: begin.width,
                height: begin.height,
                clear_values: begin.clear_values.clone(),
            },
        );
    }

    fn cmd_end_render_pass(&self, cmd: GpuCommandBuffer) {
        self.state.lock().record(cmd, RecordedCommand::EndRenderPass);
    }

    fn cmd_bind_pipeline(&self, cmd: GpuCommandBuffer, bind_point: PipelineBindPoint, pipeline: GpuPipeline) {
        self.state
            .lock()
            .record(cmd, RecordedCommand::BindPipeline(bind_point, pipeline));
    }

    fn cmd_bind_descriptor_sets(
        &self,
        cmd: GpuCommandBuffer,
        _bind_point: PipelineBindPoint,
        layout: GpuPipelineLayout,
        sets: &[GpuDescriptorSet],
        dynamic_offsets: &[u32],
    ) {
        self.state.lock().record(
            cmd,
            RecordedCommand::BindDescriptorSets {
                layout,
                sets: sets.to_vec(),
                dynamic_offsets: dynamic_offsets.to_vec(),
            },
        );
    }

    fn cmd_bind_vertex_buffers(&self, cmd: GpuCommandBuffer, _first_binding: u32, buffers: &[GpuBuffer], _offsets: &[u64]) {
        self.state
            .lock()
            .record(cmd, RecordedCommand::BindVertexBuffers(buffers.to_vec()));
    }

    fn cmd_bind_index_buffer(&self, cmd: GpuCommandBuffer, buffer: GpuBuffer, _offset: u64, index_type: IndexType) {
        self.state
            .lock()
            .record(cmd, RecordedCommand::BindIndexBuffer(buffer, index_type));
    }

    fn cmd_set_viewport(&self, cmd: GpuCommandBuffer, viewport: &Viewport) {
        self.state.lock().record(cmd, RecordedCommand::SetViewport(*viewport));
    }

    fn cmd_set_scissor(&self, cmd: GpuCommandBuffer, scissor: &Rect2D) {
        self.state.lock().record(cmd, RecordedCommand::SetScissor(*scissor));
    }

    fn cmd_push_constants(
        &self,
        cmd: GpuCommandBuffer,
        _layout: GpuPipelineLayout,
        stages: ShaderStages,
        _offset: u32,
        data: &[u8],
    ) {
        self.state.lock().record(
            cmd,
            RecordedCommand::PushConstants {
                stages,
                size: data.len(),
            },
        );
    }

    fn cmd_draw(&self, cmd: GpuCommandBuffer, vertex_count: u32, instance_count: u32, _first_vertex: u32, _first_instance: u32) {
        self.state.lock().record(
            cmd,
            RecordedCommand::Draw {
                vertex_count,
                instance_count,
            },
        );
    }

    fn cmd_draw_indexed(
        &self,
        cmd: GpuCommandBuffer,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        _vertex_offset: i32,
        _first_instance: u32,
    ) {
        self.state.lock().record(
            cmd,
            RecordedCommand::DrawIndexed {
                index_count,
                instance_count,
                first_index,
            },
        );
    }

    fn cmd_dispatch(&self, cmd: GpuCommandBuffer, x: u32, y: u32, z: u32) {
        self.state.lock().record(cmd, RecordedCommand::Dispatch(x, y, z));
    }

    fn cmd_copy_buffer(&self, cmd: GpuCommandBuffer, src: GpuBuffer, dst: GpuBuffer, regions: &[BufferCopy]) {
        let mut state = self.state.lock();
        // Copies execute at record time; tests only inspect final contents.
        for region in regions {
            let bytes = state.buffer_contents.get(&src.0).map(|c| {
                let start = region.src_offset as usize;
                c[start..start + region.size as usize].to_vec()
            });
            if let (Some(bytes), Some(dst_contents)) = (bytes, state.buffer_contents.get_mut(&dst.0)) {
                let start = region.dst_offset as usize;
                dst_contents[start..start + bytes.len()].copy_from_slice(&bytes);
            }
        }
        state.record(
            cmd,
            RecordedCommand::CopyBuffer {
                src,
                dst,
                regions: regions.to_vec(),
            },
        );
    }

    fn cmd_copy_buffer_to_image(
        &self,
        cmd: GpuCommandBuffer,
        src: GpuBuffer,
        dst: GpuImage,
        _format: Format,
        regions: &[BufferImageCopy],
    ) {
        self.state.lock().record(
            cmd,
            RecordedCommand::CopyBufferToImage {
                src,
                dst,
                regions: regions.to_vec(),
            },
        );
    }

    fn cmd_image_barrier(&self, cmd: GpuCommandBuffer, barrier: &ImageBarrier) {
        self.state.lock().record(cmd, RecordedCommand::ImageBarrier(*barrier));
    }

    fn cmd_buffer_barrier(&self, cmd: GpuCommandBuffer, barrier: &BufferBarrier) {
        self.state.lock().record(cmd, RecordedCommand::BufferBarrier(*barrier));
    }
}

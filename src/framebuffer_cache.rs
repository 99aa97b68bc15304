//! Render pass and framebuffer deduplication.
//!
//! Both maps follow the pipeline cache's contract: exact key match, a frame
//! stamp refreshed on every hit, eviction once an entry has gone unused for
//! `lifetime_frames` frames.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;

use crate::backend::{
    AttachmentDesc, BackendResult, DependencyType, Device, Format, FramebufferDesc, GpuFramebuffer,
    GpuImageView, GpuRenderPass, ImageLayout, LoadOp, RenderPassDesc, StoreOp,
};
use crate::render_target::{MAX_ATTACHMENT_COUNT, MAX_COLOUR_ATTACH_COUNT};

/// Describes a render pass by its attachments.
///
/// Unused colour slots have `Format::Undefined`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RenderPassKey {
    pub initial_layouts: [ImageLayout; MAX_COLOUR_ATTACH_COUNT],
    pub final_layouts: [ImageLayout; MAX_COLOUR_ATTACH_COUNT],
    pub colour_formats: [Format; MAX_COLOUR_ATTACH_COUNT],
    pub load_ops: [LoadOp; MAX_COLOUR_ATTACH_COUNT],
    pub store_ops: [StoreOp; MAX_COLOUR_ATTACH_COUNT],
    /// Depth then stencil.
    pub ds_load_ops: [LoadOp; 2],
    pub ds_store_ops: [StoreOp; 2],
    pub depth_format: Format,
    pub samples: u32,
    pub multi_view: bool,
}

impl Default for RenderPassKey {
    fn default() -> Self {
        Self {
            initial_layouts: [ImageLayout::Undefined; MAX_COLOUR_ATTACH_COUNT],
            final_layouts: [ImageLayout::Undefined; MAX_COLOUR_ATTACH_COUNT],
            colour_formats: [Format::Undefined; MAX_COLOUR_ATTACH_COUNT],
            load_ops: [LoadOp::DontCare; MAX_COLOUR_ATTACH_COUNT],
            store_ops: [StoreOp::DontCare; MAX_COLOUR_ATTACH_COUNT],
            ds_load_ops: [LoadOp::DontCare; 2],
            ds_store_ops: [StoreOp::DontCare; 2],
            depth_format: Format::Undefined,
            samples: 1,
            multi_view: false,
        }
    }
}

/// Describes a framebuffer. Colour views are packed first, followed by the
/// depth view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FramebufferKey {
    pub render_pass: GpuRenderPass,
    pub views: [GpuImageView; MAX_ATTACHMENT_COUNT],
    pub width: u32,
    pub height: u32,
    pub samples: u32,
    pub layers: u32,
}

impl Default for FramebufferKey {
    fn default() -> Self {
        Self {
            render_pass: GpuRenderPass::NULL,
            views: [GpuImageView::NULL; MAX_ATTACHMENT_COUNT],
            width: 0,
            height: 0,
            samples: 1,
            layers: 1,
        }
    }
}

#[derive(Debug)]
pub struct RenderPass {
    render_pass: GpuRenderPass,
    attachments: Vec<AttachmentDesc>,
    colour_count: u32,
    dependency: DependencyType,
    last_used_frame: u64,
}

impl RenderPass {
    pub fn get(&self) -> GpuRenderPass {
        self.render_pass
    }

    pub fn attachments(&self) -> &[AttachmentDesc] {
        &self.attachments
    }

    pub fn colour_attach_count(&self) -> u32 {
        self.colour_count
    }

    pub fn dependency(&self) -> DependencyType {
        self.dependency
    }

    pub fn last_used_frame(&self) -> u64 {
        self.last_used_frame
    }
}

#[derive(Debug)]
pub struct Framebuffer {
    framebuffer: GpuFramebuffer,
    width: u32,
    height: u32,
    last_used_frame: u64,
}

impl Framebuffer {
    pub fn get(&self) -> GpuFramebuffer {
        self.framebuffer
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn last_used_frame(&self) -> u64 {
        self.last_used_frame
    }
}

fn dependency_type(attachments: &[AttachmentDesc], colour_count: u32, has_depth: bool) -> DependencyType {
    if colour_count == 0 && has_depth {
        DependencyType::DepthStencilPass
    } else if attachments.iter().any(|a| a.final_layout == ImageLayout::PresentSrc) {
        DependencyType::SurfaceKhr
    } else {
        DependencyType::ColourPass
    }
}

fn create_render_pass(device: &dyn Device, key: &RenderPassKey, current_frame: u64) -> BackendResult<RenderPass> {
    let mut attachments = Vec::with_capacity(MAX_ATTACHMENT_COUNT);
    for idx in 0..MAX_COLOUR_ATTACH_COUNT {
        if key.colour_formats[idx] == Format::Undefined {
            continue;
        }
        assert!(
            key.final_layouts[idx] != ImageLayout::Undefined,
            "Colour attachment {} has an undefined final layout",
            idx
        );
        attachments.push(AttachmentDesc {
            format: key.colour_formats[idx],
            samples: key.samples,
            load_op: key.load_ops[idx],
            store_op: key.store_ops[idx],
            stencil_load_op: key.ds_load_ops[1],
            stencil_store_op: key.ds_store_ops[1],
            initial_layout: key.initial_layouts[idx],
            final_layout: key.final_layouts[idx],
        });
    }
    let colour_count = attachments.len() as u32;

    let has_depth = key.depth_format != Format::Undefined;
    if has_depth {
        attachments.push(AttachmentDesc {
            format: key.depth_format,
            samples: key.samples,
            load_op: key.ds_load_ops[0],
            store_op: key.ds_store_ops[0],
            stencil_load_op: key.ds_load_ops[1],
            stencil_store_op: key.ds_store_ops[1],
            initial_layout: ImageLayout::Undefined,
            final_layout: ImageLayout::DepthStencilReadOnly,
        });
    }

    let dependency = dependency_type(&attachments, colour_count, has_depth);
    let render_pass = device.create_render_pass(&RenderPassDesc {
        attachments: attachments.clone(),
        colour_count,
        has_depth,
        dependency,
        multi_view: key.multi_view,
    })?;
    log::debug!(
        "Framebuffer cache: created render pass with {} colour attachment(s), depth: {}, {:?}",
        colour_count,
        has_depth,
        dependency
    );

    Ok(RenderPass {
        render_pass,
        attachments,
        colour_count,
        dependency,
        last_used_frame: current_frame,
    })
}

fn create_framebuffer(
    device: &dyn Device,
    key: &FramebufferKey,
    count: usize,
    current_frame: u64,
) -> BackendResult<Framebuffer> {
    assert!(count <= MAX_ATTACHMENT_COUNT, "Framebuffer view count {} out of range", count);
    assert!(!key.render_pass.is_null(), "Framebuffer requested without a render pass");
    let attachments = key.views[..count].to_vec();
    assert!(
        attachments.iter().all(|view| !view.is_null()),
        "Framebuffer attachment view is invalid"
    );

    let framebuffer = device.create_framebuffer(&FramebufferDesc {
        render_pass: key.render_pass,
        attachments,
        width: key.width,
        height: key.height,
        layers: key.layers.max(1),
    })?;
    log::debug!("Framebuffer cache: created {}x{} framebuffer", key.width, key.height);

    Ok(Framebuffer {
        framebuffer,
        width: key.width,
        height: key.height,
        last_used_frame: current_frame,
    })
}

pub struct FramebufferCache {
    device: Arc<dyn Device>,
    lifetime_frames: u64,
    render_passes: HashMap<RenderPassKey, RenderPass>,
    framebuffers: HashMap<FramebufferKey, Framebuffer>,
}

impl FramebufferCache {
    pub fn new(device: Arc<dyn Device>, lifetime_frames: u32) -> Self {
        Self {
            device,
            lifetime_frames: lifetime_frames as u64,
            render_passes: HashMap::new(),
            framebuffers: HashMap::new(),
        }
    }

    pub fn find_or_create_render_pass(&mut self, key: &RenderPassKey, current_frame: u64) -> BackendResult<&RenderPass> {
        match self.render_passes.entry(*key) {
            Entry::Occupied(entry) => {
                let rpass = entry.into_mut();
                rpass.last_used_frame = current_frame;
                Ok(rpass)
            }
            Entry::Vacant(entry) => {
                let rpass = create_render_pass(self.device.as_ref(), key, current_frame)?;
                Ok(entry.insert(rpass))
            }
        }
    }

    /// `count` is the number of packed views in `key.views`.
    pub fn find_or_create_framebuffer(
        &mut self,
        key: &FramebufferKey,
        count: usize,
        current_frame: u64,
    ) -> BackendResult<&Framebuffer> {
        match self.framebuffers.entry(*key) {
            Entry::Occupied(entry) => {
                let fbo = entry.into_mut();
                fbo.last_used_frame = current_frame;
                Ok(fbo)
            }
            Entry::Vacant(entry) => {
                let fbo = create_framebuffer(self.device.as_ref(), key, count, current_frame)?;
                Ok(entry.insert(fbo))
            }
        }
    }

    /// Remove render passes and framebuffers unused for longer than the
    /// lifetime.
    pub fn clean_cache(&mut self, current_frame: u64) {
        let lifetime = self.lifetime_frames;
        let device = self.device.as_ref();

        self.framebuffers.retain(|_, fbo| {
            let keep = fbo.last_used_frame + lifetime >= current_frame;
            if !keep {
                device.destroy_framebuffer(fbo.framebuffer);
            }
            keep
        });
        self.render_passes.retain(|_, rpass| {
            let keep = rpass.last_used_frame + lifetime >= current_frame;
            if !keep {
                device.destroy_render_pass(rpass.render_pass);
            }
            keep
        });
    }

    pub fn render_pass_count(&self) -> usize {
        self.render_passes.len()
    }

    pub fn framebuffer_count(&self) -> usize {
        self.framebuffers.len()
    }

    pub fn clear(&mut self) {
        for (_, fbo) in self.framebuffers.drain() {
            self.device.destroy_framebuffer(fbo.framebuffer);
        }
        for (_, rpass) in self.render_passes.drain() {
            self.device.destroy_render_pass(rpass.render_pass);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{DummyDevice, ObjectKind};
    use rstest::{fixture, rstest};

    const LIFETIME: u32 = 10;

    #[fixture]
    fn cache() -> (Arc<DummyDevice>, FramebufferCache) {
        let device = Arc::new(DummyDevice::new());
        let cache = FramebufferCache::new(device.clone(), LIFETIME);
        (device, cache)
    }

    fn colour_key(final_layout: ImageLayout) -> RenderPassKey {
        let mut key = RenderPassKey::default();
        key.colour_formats[0] = Format::Rgba8Unorm;
        key.final_layouts[0] = final_layout;
        key.load_ops[0] = LoadOp::Clear;
        key.store_ops[0] = StoreOp::Store;
        key
    }

    #[rstest]
    fn test_render_pass_identity_and_eviction(cache: (Arc<DummyDevice>, FramebufferCache)) {
        let (device, mut cache) = cache;
        let key = colour_key(ImageLayout::ShaderReadOnly);

        let first = cache.find_or_create_render_pass(&key, 0).unwrap().get();
        let second = cache.find_or_create_render_pass(&key, 5).unwrap().get();
        assert_eq!(first, second);
        assert_eq!(device.created(ObjectKind::RenderPass), 1);

        cache.clean_cache(5 + LIFETIME as u64);
        assert_eq!(cache.render_pass_count(), 1);
        cache.clean_cache(6 + LIFETIME as u64);
        assert_eq!(cache.render_pass_count(), 0);
        assert_eq!(device.destroyed(ObjectKind::RenderPass), 1);

        let third = cache.find_or_create_render_pass(&key, 20).unwrap().get();
        assert_ne!(first, third);
    }

    #[rstest]
    #[case::colour(colour_key(ImageLayout::ShaderReadOnly), DependencyType::ColourPass)]
    #[case::present(colour_key(ImageLayout::PresentSrc), DependencyType::SurfaceKhr)]
    #[case::depth_only(
        RenderPassKey { depth_format: Format::D32Float, ..Default::default() },
        DependencyType::DepthStencilPass
    )]
    fn test_dependency_type(
        cache: (Arc<DummyDevice>, FramebufferCache),
        #[case] key: RenderPassKey,
        #[case] expected: DependencyType,
    ) {
        let (_device, mut cache) = cache;
        let rpass = cache.find_or_create_render_pass(&key, 0).unwrap();
        assert_eq!(rpass.dependency(), expected);
    }

    #[rstest]
    fn test_depth_attachment_is_last(cache: (Arc<DummyDevice>, FramebufferCache)) {
        let (_device, mut cache) = cache;
        let mut key = colour_key(ImageLayout::ShaderReadOnly);
        key.colour_formats[1] = Format::Rgba16Float;
        key.final_layouts[1] = ImageLayout::ShaderReadOnly;
        key.depth_format = Format::D24UnormS8Uint;
        key.ds_load_ops = [LoadOp::Clear, LoadOp::DontCare];

        let rpass = cache.find_or_create_render_pass(&key, 0).unwrap();
        assert_eq!(rpass.colour_attach_count(), 2);
        let depth = rpass.attachments().last().unwrap();
        assert_eq!(depth.format, Format::D24UnormS8Uint);
        assert_eq!(depth.initial_layout, ImageLayout::Undefined);
        assert_eq!(depth.final_layout, ImageLayout::DepthStencilReadOnly);
        assert_eq!(depth.load_op, LoadOp::Clear);
    }

    #[rstest]
    fn test_framebuffer_keys(cache: (Arc<DummyDevice>, FramebufferCache)) {
        let (device, mut cache) = cache;
        let rpass = cache
            .find_or_create_render_pass(&colour_key(ImageLayout::ShaderReadOnly), 0)
            .unwrap()
            .get();

        let mut key = FramebufferKey {
            render_pass: rpass,
            width: 800,
            height: 600,
            ..Default::default()
        };
        key.views[0] = GpuImageView::from_raw(100);

        let a = cache.find_or_create_framebuffer(&key, 1, 0).unwrap().get();
        let b = cache.find_or_create_framebuffer(&key, 1, 1).unwrap().get();
        assert_eq!(a, b);

        let mut resized = key;
        resized.width = 1024;
        let c = cache.find_or_create_framebuffer(&resized, 1, 1).unwrap().get();
        assert_ne!(a, c);

        let mut other_view = key;
        other_view.views[0] = GpuImageView::from_raw(101);
        let d = cache.find_or_create_framebuffer(&other_view, 1, 1).unwrap().get();
        assert_ne!(a, d);
        assert_eq!(device.created(ObjectKind::Framebuffer), 3);

        cache.clear();
        assert_eq!(device.live(ObjectKind::Framebuffer), 0);
        assert_eq!(device.live(ObjectKind::RenderPass), 0);
    }
}

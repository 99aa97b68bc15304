//! Declared resources of a render graph.

use crate::backend::{BackendResult, Format, ImageLayout, ImageUsage, LoadOp, StoreOp};
use crate::driver::Driver;
use crate::render_target::{RenderTargetHandle, MAX_ATTACHMENT_COUNT};
use crate::resource_cache::TextureHandle;

use super::node::NodeId;

/// Refers to a declared resource. Only meaningful for the graph that issued it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RenderGraphHandle(pub(crate) u32);

impl RenderGraphHandle {
    pub const INVALID: Self = Self(u32::MAX);

    pub fn key(self) -> usize {
        self.0 as usize
    }

    pub fn is_valid(self) -> bool {
        self != Self::INVALID
    }
}

impl Default for RenderGraphHandle {
    fn default() -> Self {
        Self::INVALID
    }
}

/// What a transient texture will be created with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextureDescriptor {
    pub width: u32,
    pub height: u32,
    pub mip_levels: u32,
    pub samples: u32,
    pub format: Format,
}

impl Default for TextureDescriptor {
    fn default() -> Self {
        Self {
            width: 0,
            height: 0,
            mip_levels: 1,
            samples: 1,
            format: Format::Undefined,
        }
    }
}

impl TextureDescriptor {
    pub fn new(width: u32, height: u32, format: Format) -> Self {
        Self {
            width,
            height,
            format,
            ..Default::default()
        }
    }
}

/// How an imported render target is begun and left by the passes drawing
/// into it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ImportedRenderTargetDesc {
    pub load_ops: [LoadOp; MAX_ATTACHMENT_COUNT],
    pub store_ops: [StoreOp; MAX_ATTACHMENT_COUNT],
    /// Attachments left undefined are treated as unused.
    pub final_layouts: [ImageLayout; MAX_ATTACHMENT_COUNT],
    pub usage: ImageUsage,
    pub clear_colour: [f32; 4],
    pub width: u32,
    pub height: u32,
    pub samples: u32,
}

impl Default for ImportedRenderTargetDesc {
    fn default() -> Self {
        Self {
            load_ops: [LoadOp::DontCare; MAX_ATTACHMENT_COUNT],
            store_ops: [StoreOp::DontCare; MAX_ATTACHMENT_COUNT],
            final_layouts: [ImageLayout::Undefined; MAX_ATTACHMENT_COUNT],
            usage: ImageUsage::COLOUR_ATTACHMENT,
            clear_colour: [0.0, 0.0, 0.0, 1.0],
            width: 0,
            height: 0,
            samples: 1,
        }
    }
}

impl ImportedRenderTargetDesc {
    /// A presentable colour target: cleared, stored and left in present
    /// layout.
    pub fn presentable(width: u32, height: u32) -> Self {
        let mut desc = Self {
            width,
            height,
            ..Default::default()
        };
        desc.load_ops[0] = LoadOp::Clear;
        desc.store_ops[0] = StoreOp::Store;
        desc.final_layouts[0] = ImageLayout::PresentSrc;
        desc
    }
}

#[derive(Debug, Clone)]
pub enum ResourceKind {
    /// Created when first used and destroyed after the last use.
    Texture(TextureDescriptor),
    /// A mip level and layer of its parent's texture.
    SubTexture {
        desc: TextureDescriptor,
        level: u32,
        layer: u32,
    },
    /// A render target owned by the caller.
    ImportedRenderTarget {
        desc: ImportedRenderTargetDesc,
        handle: RenderTargetHandle,
    },
}

#[derive(Debug, Clone)]
pub struct Resource {
    name: String,
    kind: ResourceKind,
    pub(crate) parent: Option<RenderGraphHandle>,
    pub(crate) usage: ImageUsage,
    pub(crate) touch_count: usize,
    pub(crate) first_pass: Option<usize>,
    pub(crate) last_pass: Option<usize>,
    pub(crate) texture: TextureHandle,
}

impl Resource {
    pub fn new(name: impl Into<String>, kind: ResourceKind) -> Self {
        let usage = match &kind {
            ResourceKind::ImportedRenderTarget { desc, .. } => desc.usage,
            _ => ImageUsage::empty(),
        };
        Self {
            name: name.into(),
            kind,
            parent: None,
            usage,
            touch_count: 0,
            first_pass: None,
            last_pass: None,
            texture: TextureHandle::default(),
        }
    }

    pub fn texture(name: impl Into<String>, desc: TextureDescriptor) -> Self {
        Self::new(name, ResourceKind::Texture(desc))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &ResourceKind {
        &self.kind
    }

    pub fn is_imported(&self) -> bool {
        matches!(self.kind, ResourceKind::ImportedRenderTarget { .. })
    }

    pub fn is_sub_resource(&self) -> bool {
        self.parent.is_some()
    }

    pub fn imported_render_target(&self) -> Option<(&ImportedRenderTargetDesc, RenderTargetHandle)> {
        match &self.kind {
            ResourceKind::ImportedRenderTarget { desc, handle } => Some((desc, *handle)),
            _ => None,
        }
    }

    /// Width and height the resource was declared with.
    pub fn extent(&self) -> (u32, u32) {
        match &self.kind {
            ResourceKind::Texture(desc) | ResourceKind::SubTexture { desc, .. } => (desc.width, desc.height),
            ResourceKind::ImportedRenderTarget { desc, .. } => (desc.width, desc.height),
        }
    }

    /// Mip level and array layer addressed by the resource.
    pub fn subresource(&self) -> (u32, u32) {
        match self.kind {
            ResourceKind::SubTexture { level, layer, .. } => (level, layer),
            _ => (0, 0),
        }
    }

    /// Image usage accumulated from every live edge. Resolved by compile.
    pub fn usage(&self) -> ImageUsage {
        self.usage
    }

    /// Number of active passes touching the resource.
    pub fn read_count(&self) -> usize {
        self.touch_count
    }

    pub fn first_pass(&self) -> Option<usize> {
        self.first_pass
    }

    pub fn last_pass(&self) -> Option<usize> {
        self.last_pass
    }

    /// Texture backing the resource between bake and destroy. Invalid for
    /// sub-resources and imported targets.
    pub fn texture_handle(&self) -> TextureHandle {
        self.texture
    }

    pub(crate) fn register_pass(&mut self, pass: usize) {
        self.touch_count += 1;
        if self.first_pass.is_none() {
            self.first_pass = Some(pass);
        }
        self.last_pass = Some(pass);
    }

    /// Create the concrete texture.
    pub(crate) fn bake(&mut self, driver: &mut Driver) -> BackendResult<()> {
        if let ResourceKind::Texture(desc) = &self.kind {
            assert!(
                !self.usage.is_empty(),
                "Image usage not resolved for resource {}",
                self.name
            );
            self.texture = driver.create_texture_2d(
                desc.format,
                desc.width,
                desc.height,
                desc.mip_levels,
                1,
                1,
                self.usage,
            )?;
            log::trace!("Render graph: baked {} as {:?}", self.name, self.texture);
        }
        Ok(())
    }

    /// Hand the texture to the driver's deferred deletion.
    pub(crate) fn destroy(&mut self, driver: &mut Driver) {
        if let ResourceKind::Texture(_) = self.kind {
            driver.destroy_texture_2d(self.texture);
            self.texture = TextureHandle::default();
        }
    }
}

/// Maps a handle onto its resource and dependency node. Moving a resource
/// repoints the slot at another resource.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ResourceSlot {
    pub resource: usize,
    pub node: usize,
}

/// Dependency graph node of one declared resource.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ResourceNode {
    pub id: NodeId,
    pub handle: RenderGraphHandle,
    pub parent: Option<RenderGraphHandle>,
    /// Index of the single write edge, if any.
    pub writer: Option<usize>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_pass_tracks_first_and_last() {
        let mut res = Resource::texture("gbuffer", TextureDescriptor::new(4, 4, Format::Rgba8Unorm));
        res.register_pass(1);
        res.register_pass(3);
        res.register_pass(7);
        assert_eq!(res.read_count(), 3);
        assert_eq!(res.first_pass(), Some(1));
        assert_eq!(res.last_pass(), Some(7));
    }

    #[test]
    fn test_imported_target_keeps_declared_usage() {
        let res = Resource::new(
            "backbuffer",
            ResourceKind::ImportedRenderTarget {
                desc: ImportedRenderTargetDesc::presentable(800, 600),
                handle: RenderTargetHandle::default(),
            },
        );
        assert!(res.is_imported());
        assert_eq!(res.usage(), ImageUsage::COLOUR_ATTACHMENT);
        assert_eq!(res.extent(), (800, 600));
    }

    #[test]
    fn test_invalid_handle() {
        assert!(!RenderGraphHandle::default().is_valid());
        assert!(RenderGraphHandle(0).is_valid());
    }
}

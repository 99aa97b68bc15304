//! Render targets and the per-pass attachment state used to begin a pass.

use crate::backend::{ImageLayout, LoadOp, StoreOp};
use crate::handle::Handle;
use crate::resource_cache::TextureHandle;

pub const MAX_COLOUR_ATTACH_COUNT: usize = 6;
/// Colour attachments plus depth and stencil.
pub const MAX_ATTACHMENT_COUNT: usize = MAX_COLOUR_ATTACH_COUNT + 2;

/// Slot of the depth attachment in [`RenderPassData`] arrays.
pub const DEPTH_INDEX: usize = MAX_COLOUR_ATTACH_COUNT;
/// Slot of the stencil attachment in [`RenderPassData`] arrays.
pub const STENCIL_INDEX: usize = MAX_COLOUR_ATTACH_COUNT + 1;

pub type RenderTargetHandle = Handle<RenderTarget>;

/// A texture subresource used as an attachment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AttachmentInfo {
    pub layer: u32,
    pub level: u32,
    pub handle: TextureHandle,
}

impl AttachmentInfo {
    pub fn new(handle: TextureHandle) -> Self {
        Self {
            layer: 0,
            level: 0,
            handle,
        }
    }

    pub fn is_used(&self) -> bool {
        self.handle.is_valid()
    }
}

/// A set of attachments rendered to together.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RenderTarget {
    pub colours: [AttachmentInfo; MAX_COLOUR_ATTACH_COUNT],
    pub depth: AttachmentInfo,
    pub stencil: AttachmentInfo,
    pub clear_colour: [f32; 4],
    pub samples: u32,
    pub multi_view: bool,
}

impl Default for RenderTarget {
    fn default() -> Self {
        Self {
            colours: [AttachmentInfo::default(); MAX_COLOUR_ATTACH_COUNT],
            depth: AttachmentInfo::default(),
            stencil: AttachmentInfo::default(),
            clear_colour: [0.0, 0.0, 0.0, 1.0],
            samples: 1,
            multi_view: false,
        }
    }
}

impl RenderTarget {
    /// Number of colour attachments in use.
    pub fn colour_count(&self) -> usize {
        self.colours.iter().filter(|c| c.is_used()).count()
    }

    /// Every texture referenced by the target.
    pub fn textures(&self) -> impl Iterator<Item = TextureHandle> + '_ {
        self.colours
            .iter()
            .chain([&self.depth, &self.stencil])
            .filter(|a| a.is_used())
            .map(|a| a.handle)
    }
}

/// Load/store behaviour and layouts of each attachment for one pass.
///
/// Arrays are indexed by colour slot, then [`DEPTH_INDEX`] and
/// [`STENCIL_INDEX`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RenderPassData {
    pub load_ops: [LoadOp; MAX_ATTACHMENT_COUNT],
    pub store_ops: [StoreOp; MAX_ATTACHMENT_COUNT],
    /// Usually undefined. Must match the previous pass when loading.
    pub initial_layouts: [ImageLayout; MAX_ATTACHMENT_COUNT],
    pub final_layouts: [ImageLayout; MAX_ATTACHMENT_COUNT],
    pub width: u32,
    pub height: u32,
    pub clear_colour: [f32; 4],
}

impl Default for RenderPassData {
    fn default() -> Self {
        Self {
            load_ops: [LoadOp::DontCare; MAX_ATTACHMENT_COUNT],
            store_ops: [StoreOp::DontCare; MAX_ATTACHMENT_COUNT],
            initial_layouts: [ImageLayout::Undefined; MAX_ATTACHMENT_COUNT],
            final_layouts: [ImageLayout::ShaderReadOnly; MAX_ATTACHMENT_COUNT],
            width: 0,
            height: 0,
            clear_colour: [0.0; 4],
        }
    }
}

impl RenderPassData {
    /// Clear and store every attachment.
    pub fn clear_and_store(width: u32, height: u32) -> Self {
        Self {
            load_ops: [LoadOp::Clear; MAX_ATTACHMENT_COUNT],
            store_ops: [StoreOp::Store; MAX_ATTACHMENT_COUNT],
            width,
            height,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unused_target_has_no_textures() {
        let target = RenderTarget::default();
        assert_eq!(target.colour_count(), 0);
        assert_eq!(target.textures().count(), 0);
    }

    #[test]
    fn test_slot_indices() {
        assert_eq!(DEPTH_INDEX, 6);
        assert_eq!(STENCIL_INDEX, 7);
        let data = RenderPassData::clear_and_store(4, 4);
        assert_eq!(data.load_ops[STENCIL_INDEX], LoadOp::Clear);
        assert_eq!(data.final_layouts[0], ImageLayout::ShaderReadOnly);
    }
}

//! Pass nodes and the work they record.

use crate::backend::{BackendResult, ImageLayout, ImageUsage, LoadOp, StoreOp};
use crate::driver::Driver;
use crate::render_target::{
    AttachmentInfo, RenderPassData, RenderTarget, RenderTargetHandle, DEPTH_INDEX, MAX_ATTACHMENT_COUNT,
    MAX_COLOUR_ATTACH_COUNT, STENCIL_INDEX,
};

use super::graph::{GraphView, RenderGraphResource};
use super::node::NodeId;
use super::resource::RenderGraphHandle;

/// Index of a pass node while the graph is being declared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PassId(pub(crate) usize);

/// A render target declared by a pass, see
/// [`RenderGraphBuilder::create_render_target`](super::RenderGraphBuilder::create_render_target).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PassTargetId(pub(crate) usize);

/// Work recorded by a pass during [`RenderGraph::execute`](super::RenderGraph::execute).
pub trait RenderGraphPass {
    fn execute(&mut self, driver: &mut Driver, resources: &RenderGraphResource<'_>) -> BackendResult<()>;
}

/// Pass built from a setup closure's data and an execute closure.
pub(crate) struct CallbackPass<D, E> {
    pub data: D,
    pub execute: E,
}

impl<D, E> RenderGraphPass for CallbackPass<D, E>
where
    E: FnMut(&mut Driver, &D, &RenderGraphResource<'_>) -> BackendResult<()>,
{
    fn execute(&mut self, driver: &mut Driver, resources: &RenderGraphResource<'_>) -> BackendResult<()> {
        (self.execute)(driver, &self.data, resources)
    }
}

/// Attachments and clear behaviour of a render target declared by a pass.
///
/// `attachments` holds colour slots followed by depth at [`DEPTH_INDEX`] and
/// stencil at [`STENCIL_INDEX`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PassDescriptor {
    pub attachments: [RenderGraphHandle; MAX_ATTACHMENT_COUNT],
    pub clear_colour: [f32; 4],
    pub samples: u32,
    pub ds_load_ops: [LoadOp; 2],
    pub ds_store_ops: [StoreOp; 2],
}

impl Default for PassDescriptor {
    fn default() -> Self {
        Self {
            attachments: [RenderGraphHandle::INVALID; MAX_ATTACHMENT_COUNT],
            clear_colour: [0.0, 0.0, 0.0, 1.0],
            samples: 1,
            ds_load_ops: [LoadOp::DontCare; 2],
            ds_store_ops: [StoreOp::DontCare; 2],
        }
    }
}

impl PassDescriptor {
    pub fn with_colour(mut self, slot: usize, handle: RenderGraphHandle) -> Self {
        assert!(slot < MAX_COLOUR_ATTACH_COUNT, "Colour slot {} out of range", slot);
        self.attachments[slot] = handle;
        self
    }

    pub fn with_depth(mut self, handle: RenderGraphHandle) -> Self {
        self.attachments[DEPTH_INDEX] = handle;
        self
    }

    pub fn with_stencil(mut self, handle: RenderGraphHandle) -> Self {
        self.attachments[STENCIL_INDEX] = handle;
        self
    }

    pub fn with_clear_colour(mut self, colour: [f32; 4]) -> Self {
        self.clear_colour = colour;
        self
    }
}

/// Layout a colour attachment is left in by its pass, which is also where a
/// later pass loading it starts from.
fn colour_attachment_layout(usage: ImageUsage) -> ImageLayout {
    if usage.intersects(ImageUsage::SAMPLED | ImageUsage::INPUT_ATTACHMENT) {
        ImageLayout::ShaderReadOnly
    } else {
        ImageLayout::ColourAttachment
    }
}

/// A pass render target: how to begin it and, once baked, the driver target.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderPassInfo {
    pub name: String,
    pub desc: PassDescriptor,
    pub data: RenderPassData,
    pub imported: bool,
    pub render_target: RenderTargetHandle,
}

impl RenderPassInfo {
    /// Create the driver render target. Imported targets already have one.
    fn bake(&mut self, view: &GraphView<'_>, driver: &mut Driver) {
        if self.imported {
            return;
        }

        let mut target = RenderTarget {
            clear_colour: self.desc.clear_colour,
            samples: self.desc.samples,
            ..Default::default()
        };

        for (slot, handle) in self.desc.attachments.iter().enumerate().take(MAX_COLOUR_ATTACH_COUNT) {
            if !handle.is_valid() {
                continue;
            }
            let (texture, level, layer) = view.texture_of(*handle);
            assert!(
                texture.is_valid(),
                "Invalid handle for colour attachment at index {} of {}",
                slot,
                self.name
            );
            target.colours[slot] = AttachmentInfo {
                layer,
                level,
                handle: texture,
            };

            self.data.final_layouts[slot] = colour_attachment_layout(view.resource(*handle).usage());
        }

        for (slot, attachment) in [(DEPTH_INDEX, &mut target.depth), (STENCIL_INDEX, &mut target.stencil)] {
            let handle = self.desc.attachments[slot];
            if !handle.is_valid() {
                continue;
            }
            let (texture, level, layer) = view.texture_of(handle);
            assert!(texture.is_valid(), "Invalid handle for depth/stencil attachment of {}", self.name);
            *attachment = AttachmentInfo {
                layer,
                level,
                handle: texture,
            };
        }

        self.render_target = driver.create_render_target(target);
    }
}

#[derive(Debug)]
pub(crate) enum PassKind {
    Render {
        /// Index into the graph's pass implementations.
        pass: usize,
        targets: Vec<RenderPassInfo>,
    },
    Present,
}

#[derive(Debug)]
pub(crate) struct PassNode {
    pub name: String,
    pub node: NodeId,
    pub kind: PassKind,
    /// Resources the pass reads or writes, filled by compile.
    pub resources: Vec<RenderGraphHandle>,
    pub bake_list: Vec<usize>,
    pub destroy_list: Vec<usize>,
}

impl PassNode {
    pub fn new(name: impl Into<String>, node: NodeId, kind: PassKind) -> Self {
        Self {
            name: name.into(),
            node,
            kind,
            resources: Vec::new(),
            bake_list: Vec::new(),
            destroy_list: Vec::new(),
        }
    }

    pub fn create_render_target(&mut self, name: &str, desc: PassDescriptor) -> PassTargetId {
        assert!(
            desc.attachments[0].is_valid(),
            "At least one colour attachment must be declared for render target {}",
            name
        );
        let PassKind::Render { targets, .. } = &mut self.kind else {
            panic!("Render target {} declared on the present pass", name);
        };
        targets.push(RenderPassInfo {
            name: name.to_string(),
            desc,
            data: RenderPassData::default(),
            imported: false,
            render_target: RenderTargetHandle::default(),
        });
        PassTargetId(targets.len() - 1)
    }

    pub fn target(&self, id: PassTargetId) -> &RenderPassInfo {
        match &self.kind {
            PassKind::Render { targets, .. } => {
                assert!(
                    id.0 < targets.len(),
                    "Render target {} out of range for pass {} ({} declared)",
                    id.0,
                    self.name,
                    targets.len()
                );
                &targets[id.0]
            }
            PassKind::Present => panic!("The present pass has no render targets"),
        }
    }

    /// Resolve load/store ops and extents of every declared render target.
    pub fn build(&mut self, view: &GraphView<'_>) {
        let pass_node = self.node;
        let PassKind::Render { targets, .. } = &mut self.kind else {
            return;
        };

        for target in targets.iter_mut() {
            let mut data = RenderPassData::default();
            let mut width = 0;
            let mut height = 0;
            let mut imported = None;

            for (slot, handle) in target.desc.attachments.iter().enumerate() {
                data.load_ops[slot] = LoadOp::DontCare;
                data.store_ops[slot] = StoreOp::Store;
                if !handle.is_valid() {
                    continue;
                }

                if slot == DEPTH_INDEX || slot == STENCIL_INDEX {
                    let ds = slot - DEPTH_INDEX;
                    data.load_ops[slot] = target.desc.ds_load_ops[ds];
                    data.store_ops[slot] = target.desc.ds_store_ops[ds];
                } else {
                    let reads = view.pass_reads(pass_node, *handle);
                    // Nobody reads what this pass writes.
                    if !reads && !view.has_readers(*handle) {
                        data.store_ops[slot] = StoreOp::DontCare;
                    }
                    if reads && view.has_writer(*handle) {
                        // Pick up where the producing pass left the image.
                        data.load_ops[slot] = LoadOp::Load;
                        data.initial_layouts[slot] = colour_attachment_layout(view.resource(*handle).usage());
                    } else {
                        data.load_ops[slot] = LoadOp::Clear;
                    }
                }

                let resource = view.resource(*handle);
                let (w, h) = resource.extent();
                width = width.max(w);
                height = height.max(h);
                if imported.is_none() {
                    imported = resource.imported_render_target().map(|(desc, rt)| (*desc, rt));
                }
            }

            data.clear_colour = target.desc.clear_colour;
            data.width = width;
            data.height = height;

            if let Some((desc, render_target)) = imported {
                data.clear_colour = desc.clear_colour;
                data.width = desc.width;
                data.height = desc.height;
                data.final_layouts = desc.final_layouts;
                for slot in 0..MAX_ATTACHMENT_COUNT {
                    if desc.final_layouts[slot] != ImageLayout::Undefined {
                        data.load_ops[slot] = desc.load_ops[slot];
                        data.store_ops[slot] = desc.store_ops[slot];
                        data.initial_layouts[slot] = if desc.load_ops[slot] == LoadOp::Load {
                            desc.final_layouts[slot]
                        } else {
                            ImageLayout::Undefined
                        };
                    } else {
                        data.initial_layouts[slot] = ImageLayout::Undefined;
                        data.load_ops[slot] = LoadOp::DontCare;
                        data.store_ops[slot] = StoreOp::DontCare;
                    }
                }
                target.render_target = render_target;
                target.imported = true;
            }

            target.data = data;
        }
    }

    pub fn bake_targets(&mut self, view: &GraphView<'_>, driver: &mut Driver) {
        if let PassKind::Render { targets, .. } = &mut self.kind {
            for target in targets.iter_mut() {
                target.bake(view, driver);
            }
        }
    }

    /// Return targets created by [`bake_targets`](Self::bake_targets) to the
    /// driver.
    pub fn release_targets(&mut self, driver: &mut Driver) {
        if let PassKind::Render { targets, .. } = &mut self.kind {
            for target in targets.iter_mut().filter(|t| !t.imported) {
                if target.render_target.is_valid() {
                    driver.delete_render_target(target.render_target);
                    target.render_target = RenderTargetHandle::default();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_slots() {
        let desc = PassDescriptor::default()
            .with_colour(1, RenderGraphHandle(4))
            .with_depth(RenderGraphHandle(5));
        assert!(!desc.attachments[0].is_valid());
        assert_eq!(desc.attachments[1], RenderGraphHandle(4));
        assert_eq!(desc.attachments[DEPTH_INDEX], RenderGraphHandle(5));
    }

    #[test]
    #[should_panic(expected = "At least one colour attachment")]
    fn test_render_target_needs_colour() {
        let mut pass = PassNode::new(
            "shadow",
            NodeId(0),
            PassKind::Render {
                pass: 0,
                targets: Vec::new(),
            },
        );
        pass.create_render_target("shadow_rt", PassDescriptor::default().with_depth(RenderGraphHandle(0)));
    }
}

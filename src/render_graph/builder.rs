//! Declaration helpers handed to a pass's setup closure.

use crate::backend::ImageUsage;
use crate::render_target::RenderTargetHandle;

use super::blackboard::BlackBoard;
use super::graph::RenderGraph;
use super::pass::{PassDescriptor, PassId, PassTargetId};
use super::resource::{ImportedRenderTargetDesc, RenderGraphHandle, Resource, ResourceKind, TextureDescriptor};

/// Declares the resources, reads and writes of one pass.
pub struct RenderGraphBuilder<'a> {
    graph: &'a mut RenderGraph,
    pass: PassId,
}

impl<'a> RenderGraphBuilder<'a> {
    pub fn new(graph: &'a mut RenderGraph, pass: PassId) -> Self {
        Self { graph, pass }
    }

    pub fn pass_id(&self) -> PassId {
        self.pass
    }

    /// Declare a transient texture. It is created when first used.
    pub fn create_texture(&mut self, name: &str, desc: TextureDescriptor) -> RenderGraphHandle {
        self.graph.add_resource(Resource::texture(name, desc))
    }

    /// Declare a view on one mip level and layer of `parent`.
    pub fn create_sub_texture(
        &mut self,
        name: &str,
        desc: TextureDescriptor,
        parent: RenderGraphHandle,
        level: u32,
        layer: u32,
    ) -> RenderGraphHandle {
        self.graph
            .add_sub_resource(Resource::new(name, ResourceKind::SubTexture { desc, level, layer }), parent)
    }

    pub fn import_render_target(
        &mut self,
        name: &str,
        desc: ImportedRenderTargetDesc,
        handle: RenderTargetHandle,
    ) -> RenderGraphHandle {
        self.graph.import_render_target(name, desc, handle)
    }

    /// The pass samples or otherwise reads `handle`.
    pub fn add_reader(&mut self, handle: RenderGraphHandle, usage: ImageUsage) -> RenderGraphHandle {
        self.graph.add_read(handle, self.pass, usage)
    }

    /// The pass renders or otherwise writes to `handle`.
    pub fn add_writer(&mut self, handle: RenderGraphHandle, usage: ImageUsage) -> RenderGraphHandle {
        self.graph.add_write(handle, self.pass, usage)
    }

    pub fn create_render_target(&mut self, name: &str, desc: PassDescriptor) -> PassTargetId {
        self.graph.create_render_target(self.pass, name, desc)
    }

    pub fn add_present(&mut self, handle: RenderGraphHandle) {
        self.graph.add_present_pass(handle);
    }

    /// Keep the pass even if nothing consumes its output.
    pub fn add_side_effect(&mut self) {
        self.graph.declare_side_effect(self.pass);
    }

    pub fn blackboard(&mut self) -> &mut BlackBoard {
        self.graph.blackboard_mut()
    }
}

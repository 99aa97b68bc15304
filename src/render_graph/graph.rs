//! Render graph declaration, compilation and execution.

use std::collections::HashMap;

use crate::backend::{BackendResult, ImageUsage};
use crate::driver::Driver;
use crate::render_target::RenderTargetHandle;
use crate::resource_cache::TextureHandle;

use super::blackboard::BlackBoard;
use super::builder::RenderGraphBuilder;
use super::node::{DependencyGraph, EdgeKind, NodeId, NodeKind};
use super::pass::{CallbackPass, PassDescriptor, PassId, PassKind, PassNode, PassTargetId, RenderGraphPass};
use super::resource::{
    ImportedRenderTargetDesc, RenderGraphHandle, Resource, ResourceKind, ResourceNode, ResourceSlot,
};

/// Read-only view of the graph's resources, used while building and baking
/// passes.
pub(crate) struct GraphView<'a> {
    dgraph: &'a DependencyGraph,
    resources: &'a [Resource],
    resource_nodes: &'a [ResourceNode],
    slots: &'a [ResourceSlot],
}

impl<'a> GraphView<'a> {
    fn slot(&self, handle: RenderGraphHandle) -> ResourceSlot {
        assert!(
            handle.key() < self.slots.len(),
            "Resource handle {} is out of range ({} declared)",
            handle.key(),
            self.slots.len()
        );
        self.slots[handle.key()]
    }

    pub fn resource(&self, handle: RenderGraphHandle) -> &'a Resource {
        &self.resources[self.slot(handle).resource]
    }

    fn resource_node(&self, handle: RenderGraphHandle) -> &'a ResourceNode {
        &self.resource_nodes[self.slot(handle).node]
    }

    /// Texture backing `handle` with the mip level and layer it addresses.
    /// Sub-resources resolve to their root parent's texture.
    pub fn texture_of(&self, handle: RenderGraphHandle) -> (TextureHandle, u32, u32) {
        let (level, layer) = self.resource(handle).subresource();
        let mut resource = self.resource(handle);
        while let Some(parent) = resource.parent {
            resource = self.resource(parent);
        }
        (resource.texture_handle(), level, layer)
    }

    /// Some pass reads the resource.
    pub fn has_readers(&self, handle: RenderGraphHandle) -> bool {
        let node = self.resource_node(handle).id;
        self.dgraph.writer_edges(node).any(|e| e.kind == EdgeKind::Read)
    }

    pub fn has_writer(&self, handle: RenderGraphHandle) -> bool {
        self.resource_node(handle).writer.is_some()
    }

    pub fn pass_reads(&self, pass: NodeId, handle: RenderGraphHandle) -> bool {
        let node = self.resource_node(handle).id;
        self.dgraph.find_edge(node, pass, EdgeKind::Read).is_some()
    }
}

/// Target info handed to a pass callback.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PassTargetInfo {
    pub data: crate::render_target::RenderPassData,
    pub handle: RenderTargetHandle,
}

/// Resources visible to one executing pass.
pub struct RenderGraphResource<'a> {
    view: GraphView<'a>,
    pass: &'a PassNode,
}

impl<'a> RenderGraphResource<'a> {
    /// Panics if the pass did not declare `handle`.
    pub fn resource(&self, handle: RenderGraphHandle) -> &'a Resource {
        assert!(
            self.pass.resources.contains(&handle),
            "Pass {} did not declare resource {}",
            self.pass.name,
            handle.key()
        );
        self.view.resource(handle)
    }

    /// Begin info and driver target of a render target created by this pass.
    pub fn render_pass_info(&self, target: PassTargetId) -> PassTargetInfo {
        let info = self.pass.target(target);
        PassTargetInfo {
            data: info.data,
            handle: info.render_target,
        }
    }

    /// The baked texture of a declared resource.
    pub fn texture_handle(&self, handle: RenderGraphHandle) -> TextureHandle {
        let name = self.resource(handle).name();
        let (texture, _, _) = self.view.texture_of(handle);
        assert!(texture.is_valid(), "Resource {} has no baked texture", name);
        texture
    }

    pub fn pass_name(&self) -> &str {
        &self.pass.name
    }
}

/// A frame's passes and the resources flowing between them.
///
/// Passes are declared in dependency order: a pass may only read what an
/// earlier pass wrote. [`compile`](Self::compile) culls passes whose output
/// never reaches a side effect and schedules when each transient texture is
/// created and destroyed; [`execute`](Self::execute) records the surviving
/// passes in declaration order.
#[derive(Default)]
pub struct RenderGraph {
    dgraph: DependencyGraph,
    pass_impls: Vec<Box<dyn RenderGraphPass>>,
    passes: Vec<PassNode>,
    resources: Vec<Resource>,
    resource_nodes: Vec<ResourceNode>,
    slots: Vec<ResourceSlot>,
    node_handles: HashMap<NodeId, RenderGraphHandle>,
    active_end: usize,
    compiled: bool,
    blackboard: BlackBoard,
}

impl RenderGraph {
    pub fn new() -> Self {
        Self::default()
    }

    fn assert_not_compiled(&self) {
        assert!(!self.compiled, "Render graph modified after compile; reset it first");
    }

    // ========================================================================
    // Declaration
    // ========================================================================

    fn push_render_node(&mut self, name: &str, pass: usize) -> PassId {
        self.assert_not_compiled();
        let node = self.dgraph.add_node(name, NodeKind::Pass);
        self.passes.push(PassNode::new(
            name,
            node,
            PassKind::Render {
                pass,
                targets: Vec::new(),
            },
        ));
        PassId(self.passes.len() - 1)
    }

    /// Register a pass implementation. Declare its reads and writes with
    /// [`builder`](Self::builder).
    pub fn create_pass_node(&mut self, name: &str, pass: Box<dyn RenderGraphPass>) -> PassId {
        let id = self.push_render_node(name, self.pass_impls.len());
        self.pass_impls.push(pass);
        id
    }

    pub fn builder(&mut self, pass: PassId) -> RenderGraphBuilder<'_> {
        RenderGraphBuilder::new(self, pass)
    }

    /// Declare a pass from a setup and an execute closure.
    ///
    /// `setup` fills the pass data, typically with the handles it declares; a
    /// copy is returned so later passes can refer to them.
    pub fn add_pass<D, S, E>(&mut self, name: &str, setup: S, execute: E) -> D
    where
        D: Clone + Default + 'static,
        S: FnOnce(&mut RenderGraphBuilder<'_>, &mut D),
        E: FnMut(&mut Driver, &D, &RenderGraphResource<'_>) -> BackendResult<()> + 'static,
    {
        let id = self.push_render_node(name, self.pass_impls.len());
        let mut data = D::default();
        setup(&mut RenderGraphBuilder::new(self, id), &mut data);
        self.pass_impls.push(Box::new(CallbackPass {
            data: data.clone(),
            execute,
        }));
        data
    }

    /// A pass that only runs `execute` and is never culled.
    pub fn add_executor_pass<E>(&mut self, name: &str, mut execute: E)
    where
        E: FnMut(&mut Driver) -> BackendResult<()> + 'static,
    {
        self.add_pass::<(), _, _>(
            name,
            |builder, _| builder.add_side_effect(),
            move |driver, _, _| execute(driver),
        );
    }

    /// Terminal pass consuming `input`. Never culled.
    pub fn add_present_pass(&mut self, input: RenderGraphHandle) {
        self.assert_not_compiled();
        let node = self.dgraph.add_node("present", NodeKind::Pass);
        self.passes.push(PassNode::new("present", node, PassKind::Present));
        let id = PassId(self.passes.len() - 1);
        self.add_read(input, id, ImageUsage::empty());
        self.dgraph.declare_side_effect(node);
    }

    pub fn declare_side_effect(&mut self, pass: PassId) {
        let node = self.pass_node(pass).node;
        self.dgraph.declare_side_effect(node);
    }

    pub fn create_render_target(&mut self, pass: PassId, name: &str, desc: PassDescriptor) -> PassTargetId {
        self.assert_not_compiled();
        self.pass_node_mut(pass).create_render_target(name, desc)
    }

    pub fn add_resource(&mut self, resource: Resource) -> RenderGraphHandle {
        self.insert_resource(resource, None)
    }

    /// Declare a resource nested in `parent`. Using it keeps the parent alive.
    pub fn add_sub_resource(&mut self, resource: Resource, parent: RenderGraphHandle) -> RenderGraphHandle {
        assert!(parent.key() < self.slots.len(), "Parent resource {} out of range", parent.key());
        self.insert_resource(resource, Some(parent))
    }

    fn insert_resource(&mut self, mut resource: Resource, parent: Option<RenderGraphHandle>) -> RenderGraphHandle {
        self.assert_not_compiled();
        let handle = RenderGraphHandle(self.slots.len() as u32);
        let id = self.dgraph.add_node(resource.name(), NodeKind::Resource);
        resource.parent = parent;

        self.slots.push(ResourceSlot {
            resource: self.resources.len(),
            node: self.resource_nodes.len(),
        });
        self.resources.push(resource);
        self.resource_nodes.push(ResourceNode {
            id,
            handle,
            parent,
            writer: None,
        });
        self.node_handles.insert(id, handle);
        handle
    }

    /// Make `from` refer to the resource backing `to`. Returns `from`.
    pub fn move_resource(&mut self, from: RenderGraphHandle, to: RenderGraphHandle) -> RenderGraphHandle {
        self.assert_not_compiled();
        let from_slot = self.slot(from);
        let to_slot = self.slot(to);

        let from_node = self.resource_nodes[from_slot.node].id;
        let to_node = self.resource_nodes[to_slot.node].id;
        self.dgraph
            .add_edge(from_node, to_node, EdgeKind::Alias, ImageUsage::empty());
        self.slots[from.key()].resource = to_slot.resource;
        from
    }

    /// Wrap a caller-owned render target. Passes writing to it are never
    /// culled.
    pub fn import_render_target(
        &mut self,
        name: &str,
        desc: ImportedRenderTargetDesc,
        handle: RenderTargetHandle,
    ) -> RenderGraphHandle {
        self.add_resource(Resource::new(
            name,
            ResourceKind::ImportedRenderTarget { desc, handle },
        ))
    }

    pub fn add_read(&mut self, handle: RenderGraphHandle, pass: PassId, usage: ImageUsage) -> RenderGraphHandle {
        self.assert_not_compiled();
        let slot = self.slot(handle);
        let resource_node = self.resource_nodes[slot.node];
        let pass_node = self.pass_node(pass).node;

        match self.dgraph.find_edge(resource_node.id, pass_node, EdgeKind::Read) {
            Some(edge) => self.dgraph.edge_mut(edge).usage |= usage,
            None => {
                self.dgraph.add_edge(resource_node.id, pass_node, EdgeKind::Read, usage);
            }
        }

        if let Some(parent) = resource_node.parent {
            self.connect_parent(resource_node.id, parent);
        }
        handle
    }

    /// Panics if another pass already writes `handle`.
    pub fn add_write(&mut self, handle: RenderGraphHandle, pass: PassId, usage: ImageUsage) -> RenderGraphHandle {
        self.assert_not_compiled();
        let slot = self.slot(handle);
        let resource_node = self.resource_nodes[slot.node];
        let pass_node = self.pass_node(pass).node;

        match resource_node.writer {
            Some(edge) if self.dgraph.edges()[edge].from == pass_node => {
                self.dgraph.edge_mut(edge).usage |= usage;
            }
            Some(_) => panic!(
                "Only one writer per resource allowed: {} is already written",
                self.resources[slot.resource].name()
            ),
            None => {
                let edge = self
                    .dgraph
                    .add_edge(pass_node, resource_node.id, EdgeKind::Write, usage);
                self.resource_nodes[slot.node].writer = Some(edge);
            }
        }

        if self.resources[slot.resource].is_imported() {
            self.dgraph.declare_side_effect(pass_node);
        }
        if let Some(parent) = resource_node.parent {
            self.connect_parent(resource_node.id, parent);
        }
        handle
    }

    fn connect_parent(&mut self, child: NodeId, parent: RenderGraphHandle) {
        let parent_node = self.resource_nodes[self.slot(parent).node].id;
        if self.dgraph.find_edge(child, parent_node, EdgeKind::Parent).is_none() {
            self.dgraph
                .add_edge(child, parent_node, EdgeKind::Parent, ImageUsage::empty());
        }
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    fn slot(&self, handle: RenderGraphHandle) -> ResourceSlot {
        assert!(
            handle.key() < self.slots.len(),
            "Resource handle {} is out of range ({} declared)",
            handle.key(),
            self.slots.len()
        );
        self.slots[handle.key()]
    }

    fn pass_node(&self, pass: PassId) -> &PassNode {
        assert!(pass.0 < self.passes.len(), "Pass {} out of range", pass.0);
        &self.passes[pass.0]
    }

    fn pass_node_mut(&mut self, pass: PassId) -> &mut PassNode {
        assert!(pass.0 < self.passes.len(), "Pass {} out of range", pass.0);
        &mut self.passes[pass.0]
    }

    pub fn resource(&self, handle: RenderGraphHandle) -> &Resource {
        &self.resources[self.slot(handle).resource]
    }

    pub fn blackboard(&self) -> &BlackBoard {
        &self.blackboard
    }

    pub fn blackboard_mut(&mut self) -> &mut BlackBoard {
        &mut self.blackboard
    }

    pub fn dependency_graph(&self) -> &DependencyGraph {
        &self.dgraph
    }

    /// Number of declared passes, present pass included.
    pub fn pass_count(&self) -> usize {
        self.passes.len()
    }

    /// Passes that survive culling, in execution order. Empty before compile.
    pub fn active_pass_names(&self) -> Vec<&str> {
        self.passes[..self.active_end]
            .iter()
            .map(|p| p.name.as_str())
            .collect()
    }

    /// Whether the pass named `name` was culled. `None` for unknown names or
    /// before compile.
    pub fn is_pass_culled(&self, name: &str) -> Option<bool> {
        if !self.compiled {
            return None;
        }
        self.passes
            .iter()
            .position(|p| p.name == name)
            .map(|pos| pos >= self.active_end)
    }

    pub fn is_compiled(&self) -> bool {
        self.compiled
    }

    pub fn export_graphviz(&self) -> String {
        self.dgraph.export_graphviz()
    }

    // ========================================================================
    // Compile and execute
    // ========================================================================

    /// Cull, order and schedule the declared passes.
    pub fn compile(&mut self) -> &mut Self {
        self.assert_not_compiled();
        self.dgraph.cull();

        // Active passes first, declaration order kept on both sides.
        let dgraph = &self.dgraph;
        let (mut active, culled): (Vec<PassNode>, Vec<PassNode>) = self
            .passes
            .drain(..)
            .partition(|p| !dgraph.node(p.node).is_culled());
        self.active_end = active.len();
        active.extend(culled);
        self.passes = active;

        // Targets resolve their layouts from the final usage.
        for node in &self.resource_nodes {
            let mut usage = ImageUsage::empty();
            for edge in self.dgraph.writer_edges(node.id) {
                if edge.kind == EdgeKind::Read && self.dgraph.is_valid_edge(edge) {
                    usage |= edge.usage;
                }
            }
            if let Some(writer) = node.writer {
                usage |= self.dgraph.edges()[writer].usage;
            }

            let idx = self.slots[node.handle.key()].resource;
            self.resources[idx].usage |= usage;
            let usage = self.resources[idx].usage;
            let mut parent = self.resources[idx].parent;
            while let Some(p) = parent {
                let parent_idx = self.slots[p.key()].resource;
                self.resources[parent_idx].usage |= usage;
                parent = self.resources[parent_idx].parent;
            }
        }

        for pos in 0..self.active_end {
            let node = self.passes[pos].node;
            let handles: Vec<RenderGraphHandle> = self
                .dgraph
                .reader_edges(node)
                .map(|e| e.from)
                .chain(self.dgraph.writer_edges(node).map(|e| e.to))
                .filter_map(|id| self.node_handles.get(&id).copied())
                .collect();

            for handle in &handles {
                // Touching a sub-resource keeps its parents alive too.
                let mut current = Some(*handle);
                while let Some(h) = current {
                    let idx = self.slot(h).resource;
                    self.resources[idx].register_pass(pos);
                    current = self.resources[idx].parent;
                }
            }
            self.passes[pos].resources = handles;

            let view = GraphView {
                dgraph: &self.dgraph,
                resources: &self.resources,
                resource_nodes: &self.resource_nodes,
                slots: &self.slots,
            };
            self.passes[pos].build(&view);
        }

        for (idx, resource) in self.resources.iter().enumerate() {
            if resource.read_count() == 0 {
                continue;
            }
            if let (Some(first), Some(last)) = (resource.first_pass(), resource.last_pass()) {
                self.passes[first].bake_list.push(idx);
                self.passes[last].destroy_list.push(idx);
            }
        }

        self.compiled = true;
        log::debug!(
            "Render graph compiled: {} of {} passes active, {} resources",
            self.active_end,
            self.passes.len(),
            self.resources.len()
        );
        self
    }

    /// Record every active pass in order.
    ///
    /// Transient textures are created just before the first pass using them
    /// and handed to the driver's deferred deletion after the last one.
    pub fn execute(&mut self, driver: &mut Driver) -> BackendResult<()> {
        assert!(self.compiled, "Render graph executed before compile");

        for pos in 0..self.active_end {
            for &idx in &self.passes[pos].bake_list {
                self.resources[idx].bake(driver)?;
            }

            let view = GraphView {
                dgraph: &self.dgraph,
                resources: &self.resources,
                resource_nodes: &self.resource_nodes,
                slots: &self.slots,
            };
            self.passes[pos].bake_targets(&view, driver);

            let pass = &self.passes[pos];
            if let PassKind::Render { pass: impl_idx, .. } = pass.kind {
                log::trace!("Render graph: executing {}", pass.name);
                let resources = RenderGraphResource { view, pass };
                self.pass_impls[impl_idx].execute(driver, &resources)?;
            }

            self.passes[pos].release_targets(driver);
            for &idx in &self.passes[pos].destroy_list {
                self.resources[idx].destroy(driver);
            }
        }
        Ok(())
    }

    /// Forget every pass and resource so the graph can be declared again.
    pub fn reset(&mut self) {
        self.dgraph.clear();
        self.pass_impls.clear();
        self.passes.clear();
        self.resources.clear();
        self.resource_nodes.clear();
        self.slots.clear();
        self.node_handles.clear();
        self.blackboard.reset();
        self.active_end = 0;
        self.compiled = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Format, ImageLayout, LoadOp, StoreOp};
    use crate::render_graph::TextureDescriptor;
    use rstest::rstest;

    fn noop(_: &mut Driver, _: &(), _: &RenderGraphResource<'_>) -> BackendResult<()> {
        Ok(())
    }

    #[derive(Clone, Copy, Default)]
    struct Handles {
        colour: RenderGraphHandle,
        target: Option<PassTargetId>,
    }

    fn colour_desc() -> TextureDescriptor {
        TextureDescriptor::new(800, 600, Format::Rgba8Unorm)
    }

    #[test]
    fn test_unreached_passes_are_culled() {
        let mut graph = RenderGraph::new();
        let a: Handles = graph.add_pass(
            "a",
            |builder, data: &mut Handles| {
                data.colour = builder.create_texture("colour", colour_desc());
                builder.add_writer(data.colour, ImageUsage::COLOUR_ATTACHMENT);
            },
            |_, _, _| Ok(()),
        );
        graph.add_pass::<(), _, _>(
            "b",
            move |builder, _| {
                builder.add_reader(a.colour, ImageUsage::SAMPLED);
            },
            noop,
        );
        graph.compile();

        assert!(graph.active_pass_names().is_empty());
        assert_eq!(graph.is_pass_culled("a"), Some(true));
        assert_eq!(graph.is_pass_culled("b"), Some(true));
        assert_eq!(graph.resource(a.colour).read_count(), 0);
    }

    #[test]
    fn test_active_passes_keep_declaration_order() {
        let mut graph = RenderGraph::new();
        let rt = graph.import_render_target(
            "backbuffer",
            ImportedRenderTargetDesc::presentable(800, 600),
            RenderTargetHandle::default(),
        );
        graph.add_pass::<(), _, _>("unused", |_, _| {}, noop);
        graph.add_pass::<(), _, _>(
            "draw",
            move |builder, _| {
                builder.add_writer(rt, ImageUsage::COLOUR_ATTACHMENT);
            },
            noop,
        );
        graph.add_executor_pass("debug", |_| Ok(()));
        graph.compile();

        assert_eq!(graph.active_pass_names(), vec!["draw", "debug"]);
        assert_eq!(graph.is_pass_culled("unused"), Some(true));
        assert_eq!(graph.is_pass_culled("nope"), None);
        assert_eq!(graph.pass_count(), 3);
    }

    #[test]
    fn test_lifetime_lists_and_usage() {
        let mut graph = RenderGraph::new();
        let rt = graph.import_render_target(
            "backbuffer",
            ImportedRenderTargetDesc::presentable(800, 600),
            RenderTargetHandle::default(),
        );
        let a: Handles = graph.add_pass(
            "a",
            |builder, data: &mut Handles| {
                data.colour = builder.create_texture("colour", colour_desc());
                builder.add_writer(data.colour, ImageUsage::COLOUR_ATTACHMENT);
            },
            |_, _, _| Ok(()),
        );
        graph.add_pass::<(), _, _>(
            "b",
            move |builder, _| {
                builder.add_reader(a.colour, ImageUsage::SAMPLED);
                builder.add_writer(rt, ImageUsage::COLOUR_ATTACHMENT);
            },
            noop,
        );
        graph.add_present_pass(rt);
        graph.compile();

        assert_eq!(graph.active_pass_names(), vec!["a", "b", "present"]);
        let colour = graph.resource(a.colour);
        assert_eq!(colour.first_pass(), Some(0));
        assert_eq!(colour.last_pass(), Some(1));
        assert_eq!(colour.usage(), ImageUsage::COLOUR_ATTACHMENT | ImageUsage::SAMPLED);
        assert_eq!(graph.passes[0].bake_list, vec![1]);
        assert_eq!(graph.passes[1].destroy_list, vec![1]);
    }

    #[test]
    fn test_render_target_ops_follow_edges() {
        let mut graph = RenderGraph::new();
        let rt = graph.import_render_target(
            "backbuffer",
            ImportedRenderTargetDesc::presentable(1024, 768),
            RenderTargetHandle::default(),
        );
        let a: Handles = graph.add_pass(
            "a",
            |builder, data: &mut Handles| {
                data.colour = builder.create_texture("colour", colour_desc());
                builder.add_writer(data.colour, ImageUsage::COLOUR_ATTACHMENT);
                data.target = Some(builder.create_render_target(
                    "a_rt",
                    PassDescriptor::default().with_colour(0, data.colour),
                ));
            },
            |_, _, _| Ok(()),
        );
        let b: Handles = graph.add_pass(
            "b",
            move |builder, data: &mut Handles| {
                builder.add_reader(a.colour, ImageUsage::SAMPLED);
                builder.add_writer(rt, ImageUsage::COLOUR_ATTACHMENT);
                data.target = Some(builder.create_render_target("b_rt", PassDescriptor::default().with_colour(0, rt)));
            },
            |_, _, _| Ok(()),
        );
        graph.add_present_pass(rt);
        graph.compile();

        let a_info = graph.passes[0].target(a.target.unwrap());
        assert_eq!(a_info.data.load_ops[0], LoadOp::Clear);
        assert_eq!(a_info.data.store_ops[0], StoreOp::Store);
        assert_eq!((a_info.data.width, a_info.data.height), (800, 600));
        assert!(!a_info.imported);

        let b_info = graph.passes[1].target(b.target.unwrap());
        assert!(b_info.imported);
        assert_eq!((b_info.data.width, b_info.data.height), (1024, 768));
        assert_eq!(b_info.data.final_layouts[0], ImageLayout::PresentSrc);
        assert_eq!(b_info.data.load_ops[1], LoadOp::DontCare);
    }

    #[rstest]
    #[case::sampled(ImageUsage::SAMPLED, ImageLayout::ShaderReadOnly)]
    #[case::attachment(ImageUsage::COLOUR_ATTACHMENT, ImageLayout::ColourAttachment)]
    fn test_loaded_attachment_starts_in_producer_layout(#[case] read_usage: ImageUsage, #[case] layout: ImageLayout) {
        let mut graph = RenderGraph::new();
        let first: Handles = graph.add_pass(
            "first",
            |builder, data: &mut Handles| {
                data.colour = builder.create_texture("c", colour_desc());
                builder.add_writer(data.colour, ImageUsage::COLOUR_ATTACHMENT);
                data.target = Some(builder.create_render_target(
                    "first_rt",
                    PassDescriptor::default().with_colour(0, data.colour),
                ));
            },
            |_, _, _| Ok(()),
        );
        let second: Handles = graph.add_pass(
            "second",
            move |builder, data: &mut Handles| {
                builder.add_reader(first.colour, read_usage);
                builder.add_side_effect();
                data.target = Some(builder.create_render_target(
                    "second_rt",
                    PassDescriptor::default().with_colour(0, first.colour),
                ));
            },
            |_, _, _| Ok(()),
        );
        graph.compile();

        let first_info = graph.passes[0].target(first.target.unwrap());
        assert_eq!(first_info.data.load_ops[0], LoadOp::Clear);
        assert_eq!(first_info.data.initial_layouts[0], ImageLayout::Undefined);

        let second_info = graph.passes[1].target(second.target.unwrap());
        assert_eq!(second_info.data.load_ops[0], LoadOp::Load);
        assert_eq!(second_info.data.initial_layouts[0], layout);
        assert_eq!(graph.resource(first.colour).usage(), ImageUsage::COLOUR_ATTACHMENT | read_usage);
    }

    #[test]
    fn test_sub_resource_keeps_parent_alive() {
        let mut graph = RenderGraph::new();
        let rt = graph.import_render_target(
            "backbuffer",
            ImportedRenderTargetDesc::presentable(64, 64),
            RenderTargetHandle::default(),
        );
        let mut parent = RenderGraphHandle::default();
        let a: Handles = graph.add_pass(
            "mip",
            |builder, data: &mut Handles| {
                let desc = TextureDescriptor {
                    mip_levels: 4,
                    ..TextureDescriptor::new(64, 64, Format::Rgba16Float)
                };
                let base = builder.create_texture("bloom", desc);
                data.colour = builder.create_sub_texture("bloom_mip1", colour_desc(), base, 1, 0);
                builder.add_writer(data.colour, ImageUsage::COLOUR_ATTACHMENT);
                parent = base;
            },
            |_, _, _| Ok(()),
        );
        graph.add_pass::<(), _, _>(
            "composite",
            move |builder, _| {
                builder.add_reader(a.colour, ImageUsage::SAMPLED);
                builder.add_writer(rt, ImageUsage::COLOUR_ATTACHMENT);
            },
            noop,
        );
        graph.compile();

        assert_eq!(graph.active_pass_names(), vec!["mip", "composite"]);
        let base = graph.resource(parent);
        assert_eq!(base.first_pass(), Some(0));
        assert_eq!(base.last_pass(), Some(1));
        assert!(base.usage().contains(ImageUsage::SAMPLED | ImageUsage::COLOUR_ATTACHMENT));
        assert!(graph.resource(a.colour).is_sub_resource());
    }

    #[test]
    fn test_move_resource_aliases_backing() {
        let mut graph = RenderGraph::new();
        let a = graph.add_resource(Resource::texture("a", colour_desc()));
        let b = graph.add_resource(Resource::texture("b", colour_desc()));
        assert_eq!(graph.move_resource(a, b), a);
        assert_eq!(graph.resource(a).name(), "b");
        assert!(graph
            .dependency_graph()
            .edges()
            .iter()
            .any(|e| e.kind == EdgeKind::Alias));
    }

    #[test]
    #[should_panic(expected = "Only one writer per resource")]
    fn test_second_writer_panics() {
        let mut graph = RenderGraph::new();
        let res = graph.add_resource(Resource::texture("shared", colour_desc()));
        graph.add_pass::<(), _, _>(
            "first",
            move |builder, _| {
                builder.add_writer(res, ImageUsage::COLOUR_ATTACHMENT);
            },
            noop,
        );
        graph.add_pass::<(), _, _>(
            "second",
            move |builder, _| {
                builder.add_writer(res, ImageUsage::COLOUR_ATTACHMENT);
            },
            noop,
        );
    }

    #[test]
    fn test_reset_clears_everything() {
        let mut graph = RenderGraph::new();
        graph.blackboard_mut().add("x", RenderGraphHandle(0));
        graph.add_executor_pass("debug", |_| Ok(()));
        graph.compile();
        graph.reset();
        assert_eq!(graph.pass_count(), 0);
        assert!(!graph.is_compiled());
        assert!(graph.blackboard().is_empty());
        assert!(graph.dependency_graph().nodes().is_empty());
    }
}

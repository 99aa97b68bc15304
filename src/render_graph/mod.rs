//! Frame render graph.
//!
//! Passes declare the textures they create, read and write. Compiling the
//! graph culls every pass whose output never reaches a side effect (a write
//! to an imported target, a present, or an explicit declaration), then
//! schedules each transient texture to be created before its first pass and
//! released after its last one. Execution records the surviving passes in
//! declaration order.

mod blackboard;
mod builder;
mod graph;
mod node;
mod pass;
mod resource;

pub use blackboard::BlackBoard;
pub use builder::RenderGraphBuilder;
pub use graph::{PassTargetInfo, RenderGraph, RenderGraphResource};
pub use node::{DependencyGraph, Edge, EdgeKind, Node, NodeId, NodeKind};
pub use pass::{PassDescriptor, PassId, PassTargetId, RenderGraphPass, RenderPassInfo};
pub use resource::{
    ImportedRenderTargetDesc, RenderGraphHandle, Resource, ResourceKind, TextureDescriptor,
};

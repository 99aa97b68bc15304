//! RedLilium render core - render graph scheduling and Vulkan resource caching
//!
//! The crate sits between a frame's render passes and the GPU:
//! - **Render graph**: passes declare what they read and write; the graph culls
//!   unused work and creates each transient texture just before its first use
//!   and releases it after its last.
//! - **Caches**: pipelines, descriptor sets, render passes, framebuffers and
//!   samplers are created once per distinct key and evicted after a number of
//!   idle frames.
//! - **Resources**: textures and buffers live in generation-checked arenas.
//!   A delete is queued for a fixed number of frames, so the GPU objects are
//!   destroyed only once no in-flight frame can still use them.
//! - **Commands**: a fixed ring of command buffers, each guarded by a fence,
//!   chained through semaphores.
//!
//! Everything talks to the GPU through [`backend::Device`]. The Vulkan device
//! is behind the `vulkan-backend` feature; [`backend::DummyDevice`] runs the
//! whole core in memory.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use redlilium_render_core::backend::DummyDevice;
//! use redlilium_render_core::driver::{Driver, DriverConfig};
//! use redlilium_render_core::render_graph::{ImportedRenderTargetDesc, RenderGraph};
//! use redlilium_render_core::render_target::RenderTargetHandle;
//! use redlilium_render_core::backend::ImageUsage;
//!
//! let mut driver = Driver::new(Arc::new(DummyDevice::new()), DriverConfig::default()).unwrap();
//! let mut graph = RenderGraph::new();
//! let backbuffer = graph.import_render_target(
//!     "backbuffer",
//!     ImportedRenderTargetDesc::presentable(640, 480),
//!     RenderTargetHandle::default(),
//! );
//! graph.add_pass::<(), _, _>(
//!     "clear",
//!     move |builder, _| {
//!         builder.add_writer(backbuffer, ImageUsage::COLOUR_ATTACHMENT);
//!     },
//!     |_, _, _| Ok(()),
//! );
//! graph.add_present_pass(backbuffer);
//! graph.compile();
//! graph.execute(&mut driver).unwrap();
//! assert_eq!(graph.active_pass_names(), vec!["clear", "present"]);
//! ```

pub mod backend;
pub mod commands;
pub mod driver;
pub mod framebuffer_cache;
pub mod gc;
pub mod handle;
pub mod pipeline_cache;
pub mod program;
pub mod render_graph;
pub mod render_target;
pub mod resource_cache;
pub mod sampler_cache;
pub mod staging;

pub use backend::{BackendError, BackendResult, Device, DummyDevice};
pub use driver::{Driver, DriverConfig};
pub use handle::{Arena, Handle};
pub use render_graph::{RenderGraph, RenderGraphBuilder, RenderGraphHandle, RenderGraphResource};

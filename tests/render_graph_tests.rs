//! Render graph behaviour against a dummy driver: culling, transient
//! texture lifetimes and render target resolution.

mod common;

use std::sync::Arc;

use parking_lot::Mutex;
use rstest::rstest;

use common::{dummy_driver, BACKBUFFER_HEIGHT, BACKBUFFER_WIDTH};
use redlilium_render_core::backend::{Format, ImageLayout, ImageUsage, LoadOp, StoreOp};
use redlilium_render_core::render_graph::{
    ImportedRenderTargetDesc, PassDescriptor, PassTargetId, RenderGraph, RenderGraphHandle, TextureDescriptor,
};
use redlilium_render_core::render_target::RenderTargetHandle;

#[derive(Clone, Copy, Default)]
struct ColourPass {
    colour: RenderGraphHandle,
    target: Option<PassTargetId>,
}

fn import_backbuffer(graph: &mut RenderGraph) -> RenderGraphHandle {
    graph.import_render_target(
        "backbuffer",
        ImportedRenderTargetDesc::presentable(BACKBUFFER_WIDTH, BACKBUFFER_HEIGHT),
        RenderTargetHandle::default(),
    )
}

fn add_producer(graph: &mut RenderGraph, name: &'static str) -> ColourPass {
    graph.add_pass(
        name,
        move |builder, data: &mut ColourPass| {
            data.colour = builder.create_texture(name, TextureDescriptor::new(256, 256, Format::Rgba8Unorm));
            builder.add_writer(data.colour, ImageUsage::COLOUR_ATTACHMENT);
        },
        |_, _, _| Ok(()),
    )
}

// ============================================================================
// Culling
// ============================================================================

#[rstest]
#[case::consumed(true, vec!["shadow", "lighting", "present"])]
#[case::dangling(false, vec![])]
fn test_chain_survives_only_when_consumed(#[case] consumed: bool, #[case] expected: Vec<&str>) {
    let mut graph = RenderGraph::new();
    let backbuffer = import_backbuffer(&mut graph);
    let shadow = add_producer(&mut graph, "shadow");
    graph.add_pass::<(), _, _>(
        "lighting",
        move |builder, _| {
            builder.add_reader(shadow.colour, ImageUsage::SAMPLED);
            if consumed {
                builder.add_writer(backbuffer, ImageUsage::COLOUR_ATTACHMENT);
            }
        },
        |_, _, _| Ok(()),
    );
    if consumed {
        graph.add_present_pass(backbuffer);
    }
    graph.compile();

    assert_eq!(graph.active_pass_names(), expected);
}

#[test]
fn test_culled_pass_never_runs() {
    let (_device, mut driver) = dummy_driver();
    let ran = Arc::new(Mutex::new(Vec::new()));

    let mut graph = RenderGraph::new();
    let backbuffer = import_backbuffer(&mut graph);
    for name in ["orphan", "visible"] {
        let ran = ran.clone();
        graph.add_pass::<(), _, _>(
            name,
            move |builder, _| {
                let colour = builder.create_texture("scratch", TextureDescriptor::new(16, 16, Format::Rgba8Unorm));
                builder.add_writer(colour, ImageUsage::COLOUR_ATTACHMENT);
                if name == "visible" {
                    builder.add_writer(backbuffer, ImageUsage::COLOUR_ATTACHMENT);
                }
            },
            move |_, _, res| {
                ran.lock().push(res.pass_name().to_string());
                Ok(())
            },
        );
    }
    graph.add_present_pass(backbuffer);
    graph.compile();
    graph.execute(&mut driver).unwrap();

    assert_eq!(*ran.lock(), vec!["visible".to_string()]);
    assert_eq!(graph.is_pass_culled("orphan"), Some(true));
    // The culled pass's texture was never created.
    assert_eq!(driver.resource_cache().live_texture_count(), 0);
    assert_eq!(driver.resource_cache().pending_gc_count(), 1);
}

// ============================================================================
// Transient lifetimes
// ============================================================================

#[test]
fn test_transient_lives_from_first_writer_to_last_reader() {
    let (_device, mut driver) = dummy_driver();
    let live_counts = Arc::new(Mutex::new(Vec::new()));

    let mut graph = RenderGraph::new();
    let mut transient = RenderGraphHandle::default();

    // p1 writes, p3 and p7 read, the others only record.
    for idx in 0..8 {
        let counts = live_counts.clone();
        let name = format!("p{}", idx);
        match idx {
            1 => {
                let handles: ColourPass = graph.add_pass(
                    &name,
                    |builder, data: &mut ColourPass| {
                        data.colour =
                            builder.create_texture("transient", TextureDescriptor::new(64, 64, Format::Rgba8Unorm));
                        builder.add_writer(data.colour, ImageUsage::COLOUR_ATTACHMENT);
                    },
                    move |driver, _, _| {
                        counts.lock().push(driver.resource_cache().live_texture_count());
                        Ok(())
                    },
                );
                transient = handles.colour;
            }
            3 | 7 => {
                let read = transient;
                graph.add_pass::<(), _, _>(
                    &name,
                    move |builder, _| {
                        builder.add_reader(read, ImageUsage::SAMPLED);
                        builder.add_side_effect();
                    },
                    move |driver, _, res| {
                        assert!(res.texture_handle(read).is_valid());
                        counts.lock().push(driver.resource_cache().live_texture_count());
                        Ok(())
                    },
                );
            }
            _ => graph.add_executor_pass(&name, move |driver| {
                counts.lock().push(driver.resource_cache().live_texture_count());
                Ok(())
            }),
        }
    }
    graph.compile();

    let resource = graph.resource(transient);
    assert_eq!(resource.first_pass(), Some(1));
    assert_eq!(resource.last_pass(), Some(7));
    // The writer counts as a user too.
    assert_eq!(resource.read_count(), 3);

    graph.execute(&mut driver).unwrap();
    assert_eq!(*live_counts.lock(), vec![0, 1, 1, 1, 1, 1, 1, 1]);
    assert_eq!(driver.resource_cache().live_texture_count(), 0);
    assert_eq!(driver.resource_cache().pending_gc_count(), 1);
}

#[test]
fn test_render_pass_info_inside_callback() {
    let (_device, mut driver) = dummy_driver();
    let seen = Arc::new(Mutex::new(None));

    let mut graph = RenderGraph::new();
    let backbuffer = import_backbuffer(&mut graph);
    let seen_in_pass = seen.clone();
    let scene: ColourPass = graph.add_pass(
        "scene",
        |builder, data: &mut ColourPass| {
            data.colour = builder.create_texture("hdr", TextureDescriptor::new(320, 240, Format::Rgba16Float));
            builder.add_writer(data.colour, ImageUsage::COLOUR_ATTACHMENT);
            data.target = Some(builder.create_render_target(
                "scene_rt",
                PassDescriptor::default()
                    .with_colour(0, data.colour)
                    .with_clear_colour([0.1, 0.2, 0.3, 1.0]),
            ));
        },
        move |driver, data, res| {
            let info = res.render_pass_info(data.target.unwrap());
            let target = driver.render_target(info.handle).unwrap();
            assert_eq!(target.colours[0].handle, res.texture_handle(data.colour));
            *seen_in_pass.lock() = Some(info.data);
            Ok(())
        },
    );
    graph.add_pass::<(), _, _>(
        "tonemap",
        move |builder, _| {
            builder.add_reader(scene.colour, ImageUsage::SAMPLED);
            builder.add_writer(backbuffer, ImageUsage::COLOUR_ATTACHMENT);
        },
        |_, _, _| Ok(()),
    );
    graph.add_present_pass(backbuffer);
    graph.compile();
    graph.execute(&mut driver).unwrap();

    let data = seen.lock().unwrap();
    assert_eq!((data.width, data.height), (320, 240));
    assert_eq!(data.load_ops[0], LoadOp::Clear);
    assert_eq!(data.store_ops[0], StoreOp::Store);
    assert_eq!(data.final_layouts[0], ImageLayout::ShaderReadOnly);
    assert_eq!(data.clear_colour, [0.1, 0.2, 0.3, 1.0]);
}

#[test]
fn test_blackboard_shares_handles_between_passes() {
    let mut graph = RenderGraph::new();
    let backbuffer = import_backbuffer(&mut graph);
    graph.add_pass::<(), _, _>(
        "gbuffer",
        |builder, _| {
            let normals = builder.create_texture("normals", TextureDescriptor::new(64, 64, Format::Rgba16Float));
            builder.add_writer(normals, ImageUsage::COLOUR_ATTACHMENT);
            builder.blackboard().add("normals", normals);
        },
        |_, _, _| Ok(()),
    );
    graph.add_pass::<(), _, _>(
        "lighting",
        move |builder, _| {
            let normals = builder.blackboard().get("normals");
            builder.add_reader(normals, ImageUsage::SAMPLED);
            builder.add_writer(backbuffer, ImageUsage::COLOUR_ATTACHMENT);
        },
        |_, _, _| Ok(()),
    );
    graph.compile();

    assert_eq!(graph.active_pass_names(), vec!["gbuffer", "lighting"]);
    let normals = graph.blackboard().get("normals");
    assert_eq!(graph.resource(normals).usage(), ImageUsage::COLOUR_ATTACHMENT | ImageUsage::SAMPLED);
}

#[test]
#[should_panic(expected = "modified after compile")]
fn test_declaring_after_compile_panics() {
    let mut graph = RenderGraph::new();
    graph.add_executor_pass("debug", |_| Ok(()));
    graph.compile();
    graph.add_executor_pass("late", |_| Ok(()));
}

#[test]
fn test_graphviz_names_every_pass() {
    let mut graph = RenderGraph::new();
    let backbuffer = import_backbuffer(&mut graph);
    graph.add_pass::<(), _, _>(
        "draw",
        move |builder, _| {
            builder.add_writer(backbuffer, ImageUsage::COLOUR_ATTACHMENT);
        },
        |_, _, _| Ok(()),
    );
    graph.add_present_pass(backbuffer);
    graph.compile();

    let dot = graph.export_graphviz();
    assert!(dot.starts_with("digraph"));
    assert!(dot.contains("draw"));
    assert!(dot.contains("present"));
    assert!(dot.contains("backbuffer"));
}

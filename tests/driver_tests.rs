//! Frame level behaviour of the driver: a full graph driven through
//! begin/execute/end, command buffer backpressure and deferred destruction.

mod common;

use std::thread;
use std::time::{Duration, Instant};

use rstest::rstest;

use common::{driver_with, dummy_driver, Presentation, BACKBUFFER_HEIGHT, BACKBUFFER_WIDTH};
use redlilium_render_core::backend::{DummyDevice, Format, ImageUsage, ObjectKind, RecordedCommand};
use redlilium_render_core::driver::{Driver, DriverConfig};
use redlilium_render_core::render_graph::{
    ImportedRenderTargetDesc, PassDescriptor, PassTargetId, RenderGraph, RenderGraphHandle, TextureDescriptor,
};
use redlilium_render_core::{BackendResult, RenderGraphResource};

#[derive(Clone, Copy, Default)]
struct TargetPass {
    colour: RenderGraphHandle,
    target: Option<PassTargetId>,
}

fn begin_target(driver: &mut Driver, data: &TargetPass, res: &RenderGraphResource<'_>) -> BackendResult<()> {
    let info = res.render_pass_info(data.target.unwrap());
    let cmd = driver.get_cmd_buffer()?;
    driver.begin_renderpass(cmd, &info.data, info.handle)?;
    driver.end_renderpass(cmd);
    Ok(())
}

/// Scene into a transient colour texture, composite into the backbuffer,
/// present.
fn build_frame(graph: &mut RenderGraph, driver: &Driver, presentation: &Presentation) {
    let backbuffer = graph.import_render_target(
        "backbuffer",
        ImportedRenderTargetDesc::presentable(BACKBUFFER_WIDTH, BACKBUFFER_HEIGHT),
        presentation.current_target(driver),
    );
    let scene: TargetPass = graph.add_pass(
        "scene",
        |builder, data: &mut TargetPass| {
            data.colour = builder.create_texture("scene", TextureDescriptor::new(400, 300, Format::Rgba8Unorm));
            builder.add_writer(data.colour, ImageUsage::COLOUR_ATTACHMENT);
            data.target = Some(builder.create_render_target(
                "scene_rt",
                PassDescriptor::default().with_colour(0, data.colour),
            ));
        },
        begin_target,
    );
    graph.add_pass(
        "composite",
        move |builder, data: &mut TargetPass| {
            builder.add_reader(scene.colour, ImageUsage::SAMPLED);
            data.colour = builder.add_writer(backbuffer, ImageUsage::COLOUR_ATTACHMENT);
            data.target = Some(builder.create_render_target(
                "composite_rt",
                PassDescriptor::default().with_colour(0, backbuffer),
            ));
        },
        begin_target,
    );
    graph.add_present_pass(backbuffer);
    graph.compile();
}

fn run_frame(graph: &mut RenderGraph, driver: &mut Driver, presentation: &Presentation) {
    assert!(driver.begin_frame(&presentation.swapchain).unwrap());
    graph.reset();
    build_frame(graph, driver, presentation);
    graph.execute(driver).unwrap();
    driver.end_frame(&presentation.swapchain).unwrap();
}

// ============================================================================
// End to end
// ============================================================================

#[test]
fn test_frame_renders_and_presents() {
    let (device, mut driver) = dummy_driver();
    let presentation = Presentation::new(&device, &mut driver);
    let mut graph = RenderGraph::new();

    run_frame(&mut graph, &mut driver, &presentation);
    assert_eq!(graph.active_pass_names(), vec!["scene", "composite", "present"]);

    let submissions = device.submissions();
    assert_eq!(submissions.len(), 1);
    // Rendering waits for the acquired image.
    assert_eq!(submissions[0].wait_semaphores.len(), 1);

    let presents = device.presents();
    assert_eq!(presents.len(), 1);
    let (swapchain, image, wait) = &presents[0];
    assert_eq!(*swapchain, presentation.swapchain.handle);
    assert_eq!(*image, 0);
    assert_eq!(*wait, submissions[0].signal_semaphores);

    let passes: Vec<u32> = device
        .recorded_commands(submissions[0].cmd)
        .into_iter()
        .filter_map(|c| match c {
            RecordedCommand::BeginRenderPass { width, .. } => Some(width),
            _ => None,
        })
        .collect();
    assert_eq!(passes, vec![400, BACKBUFFER_WIDTH]);
    assert_eq!(driver.current_frame(), 1);
}

#[test]
fn test_render_passes_are_created_once_across_frames() {
    let (device, mut driver) = dummy_driver();
    let presentation = Presentation::new(&device, &mut driver);
    let mut graph = RenderGraph::new();

    for _ in 0..common::SWAPCHAIN_IMAGES * 2 {
        run_frame(&mut graph, &mut driver, &presentation);
    }

    // One for the scene target, one for the backbuffer.
    assert_eq!(device.created(ObjectKind::RenderPass), 2);
    assert_eq!(driver.framebuffer_cache().render_pass_count(), 2);
    let images: Vec<u32> = device.presents().iter().map(|p| p.1).collect();
    assert_eq!(images, vec![0, 1, 2, 0, 1, 2]);
}

#[test]
fn test_transient_texture_destroyed_after_ring_drains() {
    let (device, mut driver) = dummy_driver();
    let presentation = Presentation::new(&device, &mut driver);
    let mut graph = RenderGraph::new();
    let swapchain_images = device.created(ObjectKind::Image);

    run_frame(&mut graph, &mut driver, &presentation);
    assert_eq!(device.created(ObjectKind::Image), swapchain_images + 1);
    assert_eq!(device.destroyed(ObjectKind::Image), 0);

    // end_frame already ran one collection.
    for _ in 1..driver.config().max_command_buffers - 1 {
        driver.collect_garbage();
    }
    assert_eq!(device.destroyed(ObjectKind::Image), 0);
    driver.collect_garbage();
    assert_eq!(device.destroyed(ObjectKind::Image), 1);
}

#[test]
fn test_empty_frame_still_waits_for_acquired_image() {
    let (device, mut driver) = dummy_driver();
    let presentation = Presentation::new(&device, &mut driver);

    for _ in 0..2 {
        assert!(driver.begin_frame(&presentation.swapchain).unwrap());
        driver.end_frame(&presentation.swapchain).unwrap();
    }

    let acquired = device.acquire_signals();
    let submissions = device.submissions();
    let presents = device.presents();
    assert_eq!(submissions.len(), 2);
    assert_eq!(presents.len(), 2);
    for ((submission, present), image_ready) in submissions.iter().zip(&presents).zip(&acquired) {
        // Only this frame's acquire, nothing left over from the last one.
        assert_eq!(submission.wait_semaphores, vec![*image_ready]);
        assert_eq!(present.2, submission.signal_semaphores);
        assert!(device.recorded_commands(submission.cmd).is_empty());
    }
}

// ============================================================================
// Command buffers
// ============================================================================

#[test]
fn test_ring_blocks_until_a_fence_signals() {
    let config = DriverConfig {
        max_command_buffers: 10,
        ..Default::default()
    };
    let (device, mut driver) = driver_with(DummyDevice::with_manual_fences(), config);

    let worker = thread::spawn(move || {
        for _ in 0..11 {
            driver.get_cmd_buffer().unwrap();
            driver.flush_cmds().unwrap();
        }
        driver
    });

    let deadline = Instant::now() + Duration::from_secs(5);
    while device.pending_fences().len() < 10 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(5));
    }
    thread::sleep(Duration::from_millis(50));
    assert_eq!(device.submissions().len(), 10);
    assert!(!worker.is_finished());

    device.signal_all_fences();
    let driver = worker.join().unwrap();
    assert_eq!(device.submissions().len(), 11);
    assert_eq!(driver.commands().capacity(), 10);
}

#[rstest]
#[case::single(1)]
#[case::triple(3)]
fn test_submissions_chain_through_semaphores(#[case] flushes: usize) {
    let (device, mut driver) = dummy_driver();
    for _ in 0..flushes {
        driver.get_cmd_buffer().unwrap();
        driver.flush_cmds().unwrap();
    }

    let submissions = device.submissions();
    assert_eq!(submissions.len(), flushes);
    assert!(submissions[0].wait_semaphores.is_empty());
    for pair in submissions.windows(2) {
        assert_eq!(pair[1].wait_semaphores, pair[0].signal_semaphores);
    }
}

// ============================================================================
// Resources
// ============================================================================

#[test]
fn test_deleted_texture_outlives_in_flight_frames() {
    let (device, mut driver) = dummy_driver();
    let texture = driver
        .create_texture_2d(Format::Rgba8Unorm, 32, 32, 1, 1, 1, ImageUsage::SAMPLED)
        .unwrap();

    driver.destroy_texture_2d(texture);
    driver.destroy_texture_2d(texture);
    assert!(!driver.resource_cache().is_valid_texture(texture));
    assert_eq!(driver.resource_cache().pending_gc_count(), 1);

    for _ in 0..driver.config().max_command_buffers - 1 {
        driver.collect_garbage();
    }
    assert_eq!(device.destroyed(ObjectKind::Image), 0);
    driver.collect_garbage();
    assert_eq!(device.destroyed(ObjectKind::Image), 1);
    assert_eq!(device.destroyed(ObjectKind::ImageView), 1);
}

#[test]
fn test_staging_buffer_reused_after_frames_in_flight() {
    let (device, mut driver) = dummy_driver();
    let presentation = Presentation::new(&device, &mut driver);

    driver.add_vertex_buffer(&[1; 64]).unwrap();
    assert_eq!(driver.staging_pool().in_use_count(), 1);

    for _ in 0..=driver.config().max_frames_in_flight {
        assert!(driver.begin_frame(&presentation.swapchain).unwrap());
        driver.end_frame(&presentation.swapchain).unwrap();
    }
    assert_eq!(driver.staging_pool().in_use_count(), 0);
    assert_eq!(driver.staging_pool().free_count(), 1);

    let buffers = device.created(ObjectKind::Buffer);
    driver.add_index_buffer(&[2; 32]).unwrap();
    // Only the index buffer itself is new.
    assert_eq!(device.created(ObjectKind::Buffer), buffers + 1);
    assert_eq!(driver.staging_pool().in_use_count(), 1);
}

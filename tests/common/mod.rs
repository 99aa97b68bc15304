//! Shared fixtures for the integration tests.
//!
//! Everything runs on [`DummyDevice`], which records the work the core hands
//! to the GPU so tests can inspect it.

#![allow(dead_code)]

use std::sync::Arc;

use redlilium_render_core::backend::{DummyDevice, Format, Swapchain};
use redlilium_render_core::driver::{Driver, DriverConfig};
use redlilium_render_core::render_target::RenderTargetHandle;

pub const BACKBUFFER_WIDTH: u32 = 800;
pub const BACKBUFFER_HEIGHT: u32 = 600;
pub const SWAPCHAIN_IMAGES: u32 = 3;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// A driver on a device whose fences signal on submit.
pub fn dummy_driver() -> (Arc<DummyDevice>, Driver) {
    driver_with(DummyDevice::new(), DriverConfig::default())
}

pub fn driver_with(device: DummyDevice, config: DriverConfig) -> (Arc<DummyDevice>, Driver) {
    init_logging();
    let device = Arc::new(device);
    let driver = Driver::new(device.clone(), config).unwrap();
    (device, driver)
}

/// Swapchain of [`SWAPCHAIN_IMAGES`] images with one render target each.
pub struct Presentation {
    pub swapchain: Swapchain,
    pub targets: Vec<RenderTargetHandle>,
}

impl Presentation {
    pub fn new(device: &DummyDevice, driver: &mut Driver) -> Self {
        let swapchain = device.create_swapchain(
            Format::Bgra8Unorm,
            BACKBUFFER_WIDTH,
            BACKBUFFER_HEIGHT,
            SWAPCHAIN_IMAGES,
        );
        let targets = driver
            .create_swapchain_render_targets(&swapchain, None, [0.0, 0.0, 0.0, 1.0])
            .unwrap();
        Self { swapchain, targets }
    }

    /// Render target of the image acquired by the last `begin_frame`.
    pub fn current_target(&self, driver: &Driver) -> RenderTargetHandle {
        self.targets[driver.image_index() as usize]
    }
}

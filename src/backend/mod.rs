//! Backend abstraction layer
//!
//! The [`Device`] trait is the only seam between the caches and a GPU API.
//! [`DummyDevice`] implements it in memory; the Vulkan implementation is
//! behind the `vulkan-backend` feature.

pub mod dummy;
pub mod traits;
pub mod types;

#[cfg(feature = "vulkan-backend")]
pub mod vulkan;

pub use dummy::{DummyDevice, ObjectKind, RecordedCommand, SubmitRecord};
pub use traits::*;
pub use types::*;

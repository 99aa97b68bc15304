//! Frame-delayed destructors for objects that are not tracked by a cache.

use crate::backend::Device;

pub type Destructor = Box<dyn FnOnce(&dyn Device) + Send>;

/// Runs each scheduled destructor after a fixed number of
/// [`collect_garbage`](Self::collect_garbage) calls.
pub struct GarbageCollector {
    frames_until_collection: u32,
    pending: Vec<(u32, Destructor)>,
}

impl GarbageCollector {
    pub fn new(frames_until_collection: u32) -> Self {
        Self {
            frames_until_collection: frames_until_collection.max(1),
            pending: Vec::new(),
        }
    }

    pub fn add<F>(&mut self, destructor: F)
    where
        F: FnOnce(&dyn Device) + Send + 'static,
    {
        self.pending.push((self.frames_until_collection, Box::new(destructor)));
    }

    pub fn collect_garbage(&mut self, device: &dyn Device) {
        let mut kept = Vec::with_capacity(self.pending.len());
        for (frames, destructor) in self.pending.drain(..) {
            if frames <= 1 {
                destructor(device);
            } else {
                kept.push((frames - 1, destructor));
            }
        }
        self.pending = kept;
    }

    /// Run every pending destructor now.
    pub fn reset(&mut self, device: &dyn Device) {
        for (_, destructor) in self.pending.drain(..) {
            destructor(device);
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

//! Host visible upload buffers, recycled once the GPU can no longer read them.

use std::sync::Arc;

use crate::backend::{BackendError, BackendResult, BufferDesc, BufferUsage, Device, GpuBuffer, MemoryLocation};
use crate::handle::{Arena, Handle};

pub type StageId = Handle<StageInfo>;

/// A persistently mapped staging buffer.
#[derive(Debug)]
pub struct StageInfo {
    buffer: GpuBuffer,
    size: u64,
    frame_last_used: u64,
}

impl StageInfo {
    pub fn buffer(&self) -> GpuBuffer {
        self.buffer
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn frame_last_used(&self) -> u64 {
        self.frame_last_used
    }
}

/// Pool of staging buffers.
///
/// Every stage is either free or in use. A stage handed out at frame `f`
/// returns to the free list once `f + horizon < current_frame`, and a free
/// stage left unused past the same horizon is destroyed.
pub struct StagingPool {
    device: Arc<dyn Device>,
    horizon: u64,
    stages: Arena<StageInfo>,
    /// Sorted by ascending size.
    free: Vec<StageId>,
    in_use: Vec<StageId>,
}

impl StagingPool {
    pub fn new(device: Arc<dyn Device>, max_frames_in_flight: u32) -> Self {
        Self {
            device,
            horizon: max_frames_in_flight as u64,
            stages: Arena::new(),
            free: Vec::new(),
            in_use: Vec::new(),
        }
    }

    fn size_of(&self, id: StageId) -> u64 {
        self.stages.get(id).map_or(0, |stage| stage.size)
    }

    /// Index of the first free stage holding at least `size` bytes.
    fn lower_bound(&self, size: u64) -> usize {
        self.free.partition_point(|&id| self.size_of(id) < size)
    }

    /// Hand out a stage of at least `size` bytes, reusing the smallest free
    /// one that fits.
    pub fn get_stage(&mut self, size: u64, current_frame: u64) -> BackendResult<StageId> {
        let pos = self.lower_bound(size);
        if pos < self.free.len() {
            let id = self.free.remove(pos);
            if let Some(stage) = self.stages.get_mut(id) {
                stage.frame_last_used = current_frame;
            }
            self.in_use.push(id);
            return Ok(id);
        }

        let buffer = self.device.create_buffer(&BufferDesc {
            size,
            usage: BufferUsage::TRANSFER_SRC,
            memory: MemoryLocation::CpuToGpu,
        })?;
        log::debug!("Staging pool: allocated {} byte stage", size);

        let id = self.stages.insert(StageInfo {
            buffer,
            size,
            frame_last_used: current_frame,
        });
        self.in_use.push(id);
        Ok(id)
    }

    pub fn stage(&self, id: StageId) -> Option<&StageInfo> {
        self.stages.get(id)
    }

    /// Copy `data` into the stage's mapped memory.
    pub fn write(&self, id: StageId, offset: u64, data: &[u8]) -> BackendResult<()> {
        let stage = self
            .stages
            .get(id)
            .ok_or_else(|| BackendError::InvalidHandle(format!("{:?}", id)))?;
        self.device.write_buffer(stage.buffer, offset, data)
    }

    pub fn garbage_collection(&mut self, current_frame: u64) {
        let horizon = self.horizon;
        let expired = |stage: &StageInfo| stage.frame_last_used + horizon < current_frame;

        let mut kept = Vec::with_capacity(self.free.len());
        for id in std::mem::take(&mut self.free) {
            match self.stages.get(id) {
                Some(stage) if expired(stage) => {
                    if let Some(stage) = self.stages.remove(id) {
                        self.device.destroy_buffer(stage.buffer);
                    }
                }
                Some(_) => kept.push(id),
                None => {}
            }
        }
        self.free = kept;

        let mut still_used = Vec::with_capacity(self.in_use.len());
        for id in std::mem::take(&mut self.in_use) {
            match self.stages.get(id) {
                Some(stage) if expired(stage) => {
                    let size = stage.size;
                    let pos = self.lower_bound(size);
                    self.free.insert(pos, id);
                }
                Some(_) => still_used.push(id),
                None => {}
            }
        }
        self.in_use = still_used;
    }

    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    pub fn in_use_count(&self) -> usize {
        self.in_use.len()
    }

    /// Destroy every stage regardless of use. Shutdown only.
    pub fn clear(&mut self) {
        for stage in self.stages.drain() {
            self.device.destroy_buffer(stage.buffer);
        }
        self.free.clear();
        self.in_use.clear();
    }
}

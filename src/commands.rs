//! Ring of primary command buffers with per-buffer completion fences.
//!
//! At most one buffer records at a time. Submissions are chained: each flush
//! waits on the semaphore signalled by the previous one, plus an optional
//! external semaphore such as the swapchain image-ready signal.

use std::sync::Arc;

use crate::backend::{BackendResult, Device, GpuCommandBuffer, GpuFence, GpuSemaphore, SubmitInfo};
use crate::pipeline_cache::PipelineCache;

#[derive(Debug, Clone, Copy, Default)]
struct CmdSlot {
    cmd: GpuCommandBuffer,
    fence: GpuFence,
}

impl CmdSlot {
    fn is_free(&self) -> bool {
        self.cmd.is_null()
    }
}

pub struct Commands {
    device: Arc<dyn Device>,
    slots: Vec<CmdSlot>,
    signals: Vec<GpuSemaphore>,
    current: Option<usize>,
    /// Signalled by the last submission; the next one waits on it.
    submitted_signal: Option<GpuSemaphore>,
    external_signal: Option<GpuSemaphore>,
    available: usize,
}

impl Commands {
    pub fn new(device: Arc<dyn Device>, max_command_buffers: u32) -> BackendResult<Self> {
        let count = max_command_buffers.max(1) as usize;
        let mut signals = Vec::with_capacity(count);
        for _ in 0..count {
            signals.push(device.create_semaphore()?);
        }
        Ok(Self {
            device,
            slots: vec![CmdSlot::default(); count],
            signals,
            current: None,
            submitted_signal: None,
            external_signal: None,
            available: count,
        })
    }

    /// The buffer currently recording, beginning a new one if needed.
    ///
    /// Blocks while every slot is in flight.
    pub fn get_cmd_buffer(&mut self) -> BackendResult<GpuCommandBuffer> {
        if let Some(idx) = self.current {
            return Ok(self.slots[idx].cmd);
        }

        while self.available == 0 {
            let in_flight: Vec<GpuFence> = self
                .slots
                .iter()
                .filter(|slot| !slot.is_free())
                .map(|slot| slot.fence)
                .collect();
            log::debug!("Commands: all {} buffers in flight, waiting", in_flight.len());
            self.device.wait_for_fences(&in_flight, false, u64::MAX)?;
            self.free_cmd_buffers()?;
        }

        let idx = self
            .slots
            .iter()
            .position(CmdSlot::is_free)
            .unwrap_or_else(|| panic!("{} buffers reported available but no free slot", self.available));

        let cmd = self.device.allocate_command_buffer()?;
        self.device.begin_command_buffer(cmd)?;
        let fence = self.device.create_fence()?;

        self.slots[idx] = CmdSlot { cmd, fence };
        self.available -= 1;
        self.current = Some(idx);
        Ok(cmd)
    }

    pub fn current_cmd_buffer(&self) -> Option<GpuCommandBuffer> {
        self.current.map(|idx| self.slots[idx].cmd)
    }

    /// Release every submitted buffer whose fence has signalled. Never blocks.
    pub fn free_cmd_buffers(&mut self) -> BackendResult<()> {
        for (idx, slot) in self.slots.iter_mut().enumerate() {
            if slot.is_free() || self.current == Some(idx) {
                continue;
            }
            if self.device.wait_for_fences(&[slot.fence], true, 0)? {
                self.device.free_command_buffer(slot.cmd);
                self.device.destroy_fence(slot.fence);
                *slot = CmdSlot::default();
                self.available += 1;
            }
        }
        Ok(())
    }

    /// End and submit the recording buffer. Does nothing if none is open.
    ///
    /// The pipeline cache's key is reset here so the next buffer starts from
    /// default state.
    pub fn flush(&mut self, pipeline_cache: &mut PipelineCache) -> BackendResult<()> {
        let Some(idx) = self.current else {
            return Ok(());
        };

        pipeline_cache.set_pipeline_key_to_default();

        let slot = self.slots[idx];
        self.device.end_command_buffer(slot.cmd)?;

        let wait_semaphores: Vec<GpuSemaphore> = self
            .submitted_signal
            .iter()
            .chain(self.external_signal.iter())
            .copied()
            .collect();
        let signal = self.signals[idx];

        self.device.submit(&SubmitInfo {
            cmd: slot.cmd,
            wait_semaphores: wait_semaphores.clone(),
            signal_semaphores: vec![signal],
            fence: slot.fence,
        })?;
        log::debug!(
            "Commands: flushed buffer {:?}, waits on {:?}, signals {:?}",
            slot.cmd,
            wait_semaphores,
            signal
        );

        self.current = None;
        self.external_signal = None;
        self.submitted_signal = Some(signal);
        Ok(())
    }

    /// Take the semaphore signalled by the last submission. The next flush
    /// will not wait on it.
    pub fn get_finished_signal(&mut self) -> Option<GpuSemaphore> {
        self.submitted_signal.take()
    }

    /// Make the next flush also wait on `signal`.
    pub fn set_external_wait_signal(&mut self, signal: GpuSemaphore) {
        assert!(!signal.is_null(), "External wait semaphore is null");
        self.external_signal = Some(signal);
    }

    pub fn in_flight_count(&self) -> usize {
        self.slots.len() - self.available - usize::from(self.current.is_some())
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn wait_idle(&mut self) -> BackendResult<()> {
        self.device.wait_idle()?;
        self.free_cmd_buffers()
    }

    /// Release every buffer, fence and semaphore. The device must be idle.
    pub fn destroy(&mut self) {
        for slot in self.slots.iter_mut() {
            if !slot.is_free() {
                self.device.free_command_buffer(slot.cmd);
                self.device.destroy_fence(slot.fence);
                *slot = CmdSlot::default();
            }
        }
        for signal in self.signals.drain(..) {
            self.device.destroy_semaphore(signal);
        }
        self.current = None;
        self.submitted_signal = None;
        self.external_signal = None;
        self.available = self.slots.len();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{DummyDevice, ObjectKind};

    fn setup(device: Arc<DummyDevice>, ring: u32) -> (Commands, PipelineCache) {
        let commands = Commands::new(device.clone(), ring).unwrap();
        let cache = PipelineCache::new(device, 16, 10).unwrap();
        (commands, cache)
    }

    #[test]
    fn test_current_buffer_is_reused_until_flush() {
        let device = Arc::new(DummyDevice::new());
        let (mut commands, mut cache) = setup(device.clone(), 3);

        let a = commands.get_cmd_buffer().unwrap();
        let b = commands.get_cmd_buffer().unwrap();
        assert_eq!(a, b);
        commands.flush(&mut cache).unwrap();
        let c = commands.get_cmd_buffer().unwrap();
        assert_ne!(a, c);
        assert_eq!(device.created(ObjectKind::CommandBuffer), 2);
    }

    #[test]
    fn test_submissions_chain_semaphores() {
        let device = Arc::new(DummyDevice::new());
        let (mut commands, mut cache) = setup(device.clone(), 3);
        let external = device.create_semaphore().unwrap();

        commands.get_cmd_buffer().unwrap();
        commands.flush(&mut cache).unwrap();

        commands.get_cmd_buffer().unwrap();
        commands.set_external_wait_signal(external);
        commands.flush(&mut cache).unwrap();

        let finished = commands.get_finished_signal();
        commands.get_cmd_buffer().unwrap();
        commands.flush(&mut cache).unwrap();

        let submissions = device.submissions();
        assert_eq!(submissions.len(), 3);
        assert!(submissions[0].wait_semaphores.is_empty());
        assert_eq!(
            submissions[1].wait_semaphores,
            vec![submissions[0].signal_semaphores[0], external]
        );
        assert_eq!(finished, Some(submissions[1].signal_semaphores[0]));
        // The finished signal was consumed, so the chain restarts.
        assert!(submissions[2].wait_semaphores.is_empty());
    }

    #[test]
    fn test_flush_without_recording_is_noop() {
        let device = Arc::new(DummyDevice::new());
        let (mut commands, mut cache) = setup(device.clone(), 2);
        commands.flush(&mut cache).unwrap();
        assert!(device.submissions().is_empty());
    }

    #[test]
    fn test_signalled_buffers_are_released() {
        let device = Arc::new(DummyDevice::with_manual_fences());
        let (mut commands, mut cache) = setup(device.clone(), 2);

        commands.get_cmd_buffer().unwrap();
        commands.flush(&mut cache).unwrap();
        commands.free_cmd_buffers().unwrap();
        assert_eq!(commands.in_flight_count(), 1);

        device.signal_all_fences();
        commands.free_cmd_buffers().unwrap();
        assert_eq!(commands.in_flight_count(), 0);
        assert_eq!(device.destroyed(ObjectKind::CommandBuffer), 1);
        assert_eq!(device.destroyed(ObjectKind::Fence), 1);
    }

    #[test]
    fn test_destroy_releases_everything() {
        let device = Arc::new(DummyDevice::with_manual_fences());
        let (mut commands, mut cache) = setup(device.clone(), 4);
        commands.get_cmd_buffer().unwrap();
        commands.flush(&mut cache).unwrap();
        commands.get_cmd_buffer().unwrap();

        commands.destroy();
        assert_eq!(device.live(ObjectKind::CommandBuffer), 0);
        assert_eq!(device.live(ObjectKind::Fence), 0);
        assert_eq!(device.live(ObjectKind::Semaphore), 0);
    }
}

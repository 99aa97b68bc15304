use std::collections::HashMap;
use std::sync::Arc;

use crate::backend::{BackendResult, Device, GpuSampler, SamplerDesc};

/// Samplers deduplicated by description. They live until [`clear`](Self::clear).
pub struct SamplerCache {
    device: Arc<dyn Device>,
    samplers: HashMap<SamplerDesc, GpuSampler>,
}

impl SamplerCache {
    pub fn new(device: Arc<dyn Device>) -> Self {
        Self {
            device,
            samplers: HashMap::new(),
        }
    }

    pub fn get_or_create(&mut self, desc: &SamplerDesc) -> BackendResult<GpuSampler> {
        if let Some(sampler) = self.samplers.get(desc) {
            return Ok(*sampler);
        }
        let sampler = self.device.create_sampler(desc)?;
        self.samplers.insert(*desc, sampler);
        Ok(sampler)
    }

    pub fn len(&self) -> usize {
        self.samplers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samplers.is_empty()
    }

    pub fn clear(&mut self) {
        for (_, sampler) in self.samplers.drain() {
            self.device.destroy_sampler(sampler);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{DummyDevice, Filter, ObjectKind, SamplerAddressMode};

    #[test]
    fn test_same_description_shares_sampler() {
        let device = Arc::new(DummyDevice::new());
        let mut cache = SamplerCache::new(device.clone());

        let linear = SamplerDesc::default();
        let clamped = SamplerDesc::default().with_address_mode(SamplerAddressMode::ClampToEdge);
        let aniso = SamplerDesc::default().with_anisotropy(16.0);

        let a = cache.get_or_create(&linear).unwrap();
        let b = cache.get_or_create(&linear).unwrap();
        let c = cache.get_or_create(&clamped).unwrap();
        let d = cache.get_or_create(&aniso).unwrap();
        let e = cache.get_or_create(&SamplerDesc::default().with_filter(Filter::Nearest)).unwrap();

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
        assert_ne!(a, e);
        assert_eq!(device.created(ObjectKind::Sampler), 4);

        cache.clear();
        assert_eq!(device.live(ObjectKind::Sampler), 0);
        assert!(cache.is_empty());
    }
}

use super::keys::MAX_DESCRIPTOR_TYPE_COUNT;
use crate::backend::{
    BackendResult, DescriptorBinding, DescriptorType, Device, GpuCommandBuffer,
    GpuDescriptorSetLayout, GpuPipelineLayout, PushConstantRange, ShaderStage, ShaderStages,
};

/// Pipeline layout assembled from shader reflection data.
///
/// One descriptor set layout is created per descriptor type, even when a set
/// has no bindings, so every program binds exactly
/// [`MAX_DESCRIPTOR_TYPE_COUNT`] sets.
#[derive(Debug, Default)]
pub struct PipelineLayout {
    bindings: [Vec<DescriptorBinding>; MAX_DESCRIPTOR_TYPE_COUNT],
    push_constant_sizes: [u32; ShaderStage::COUNT],
    set_layouts: [GpuDescriptorSetLayout; MAX_DESCRIPTOR_TYPE_COUNT],
    layout: GpuPipelineLayout,
}

impl PipelineLayout {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare `binding` in descriptor `set`.
    ///
    /// Adding an existing binding again from another stage widens its stage
    /// mask. Changing its type is a bug.
    pub fn add_descriptor_layout(&mut self, set: usize, binding: u32, ty: DescriptorType, stages: ShaderStages) {
        assert!(
            set < MAX_DESCRIPTOR_TYPE_COUNT,
            "Set value ({}) is out of bounds - max descriptor set count of {}",
            set,
            MAX_DESCRIPTOR_TYPE_COUNT
        );
        assert!(self.layout.is_null(), "Pipeline layout modified after it was built");

        let set_bindings = &mut self.bindings[set];
        if let Some(existing) = set_bindings.iter_mut().find(|b| b.binding == binding) {
            assert_eq!(
                existing.ty, ty,
                "Set {}; binding {} - change in descriptor type since last addition",
                set, binding
            );
            existing.stages |= stages;
            return;
        }
        set_bindings.push(DescriptorBinding {
            binding,
            ty,
            count: 1,
            stages,
        });
    }

    /// Reserve `size` bytes of push constants for `stage`.
    pub fn add_push_constant(&mut self, stage: ShaderStage, size: u32) {
        assert!(size > 0, "Push constant block for {:?} has zero size", stage);
        self.push_constant_sizes[stage.index()] = size;
    }

    pub fn push_constant_size(&self, stage: ShaderStage) -> u32 {
        self.push_constant_sizes[stage.index()]
    }

    pub fn bindings(&self, set: usize) -> &[DescriptorBinding] {
        &self.bindings[set]
    }

    /// Create the set layouts and the pipeline layout. Does nothing if
    /// already built.
    pub fn build(&mut self, device: &dyn Device) -> BackendResult<GpuPipelineLayout> {
        if !self.layout.is_null() {
            return Ok(self.layout);
        }

        for (set, bindings) in self.bindings.iter().enumerate() {
            self.set_layouts[set] = device.create_descriptor_set_layout(bindings)?;
        }

        let push_constants: Vec<PushConstantRange> = ShaderStage::ALL
            .iter()
            .filter(|stage| self.push_constant_sizes[stage.index()] > 0)
            .map(|stage| PushConstantRange {
                stages: stage.flag(),
                offset: 0,
                size: self.push_constant_sizes[stage.index()],
            })
            .collect();

        self.layout = device.create_pipeline_layout(&self.set_layouts, &push_constants)?;
        Ok(self.layout)
    }

    pub fn is_built(&self) -> bool {
        !self.layout.is_null()
    }

    pub fn get(&self) -> GpuPipelineLayout {
        self.layout
    }

    pub fn set_layouts(&self) -> &[GpuDescriptorSetLayout; MAX_DESCRIPTOR_TYPE_COUNT] {
        &self.set_layouts
    }

    /// Record a push constant update for `stage`.
    pub fn bind_push_block(&self, device: &dyn Device, cmd: GpuCommandBuffer, stage: ShaderStage, data: &[u8]) {
        assert!(self.is_built(), "Push block bound before the pipeline layout was built");
        assert!(
            data.len() as u32 <= self.push_constant_sizes[stage.index()],
            "Push block for {:?} is larger than its declared range",
            stage
        );
        device.cmd_push_constants(cmd, self.layout, stage.flag(), 0, data);
    }

    /// Destroy the device objects. The declared bindings are kept, so the
    /// layout can be built again.
    pub fn destroy(&mut self, device: &dyn Device) {
        if !self.layout.is_null() {
            device.destroy_pipeline_layout(self.layout);
            self.layout = GpuPipelineLayout::NULL;
        }
        for set_layout in self.set_layouts.iter_mut() {
            if !set_layout.is_null() {
                device.destroy_descriptor_set_layout(*set_layout);
                *set_layout = GpuDescriptorSetLayout::NULL;
            }
        }
    }
}

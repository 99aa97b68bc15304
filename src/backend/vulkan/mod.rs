//! Vulkan implementation of the device seam using ash
//!
//! The device is built from an instance, physical device, logical device and
//! graphics queue that the caller already created. It owns a command pool and
//! a `gpu-allocator` allocator; everything else it creates is handed out as
//! raw Vulkan handles wrapped in the backend's object newtypes.

mod conversion;

use crate::backend::traits::*;
use crate::backend::types::*;
use crate::pipeline_cache::{ComputePipelineKey, GraphicsPipelineKey};
use ash::khr::swapchain;
use ash::vk::{self, Handle};
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::ffi::CStr;

const ENTRY_POINT: &CStr = c"main";

/// Caller-owned Vulkan objects the device is built on. They must outlive the
/// [`VulkanDevice`].
#[derive(Clone)]
pub struct VulkanContext {
    pub instance: ash::Instance,
    pub physical_device: vk::PhysicalDevice,
    pub device: ash::Device,
    pub graphics_queue: vk::Queue,
    pub graphics_queue_family: u32,
}

/// Vulkan device implementation
pub struct VulkanDevice {
    device: ash::Device,
    swapchain_fn: swapchain::Device,
    graphics_queue: Mutex<vk::Queue>,
    command_pool: Mutex<vk::CommandPool>,
    allocator: Mutex<Option<Allocator>>,
    // Keyed by raw handle
    buffer_allocations: Mutex<HashMap<u64, Allocation>>,
    image_allocations: Mutex<HashMap<u64, Allocation>>,
}

fn vk_error(make: fn(String) -> BackendError) -> impl Fn(vk::Result) -> BackendError {
    move |result| match result {
        vk::Result::ERROR_OUT_OF_HOST_MEMORY | vk::Result::ERROR_OUT_OF_DEVICE_MEMORY => BackendError::OutOfMemory,
        vk::Result::ERROR_DEVICE_LOST => BackendError::DeviceLost,
        other => make(other.to_string()),
    }
}

impl VulkanDevice {
    pub fn new(context: &VulkanContext) -> BackendResult<Self> {
        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: context.instance.clone(),
            device: context.device.clone(),
            physical_device: context.physical_device,
            debug_settings: Default::default(),
            buffer_device_address: false,
            allocation_sizes: Default::default(),
        })
        .map_err(|e| BackendError::InitializationFailed(e.to_string()))?;

        let pool_info = vk::CommandPoolCreateInfo::default()
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
            .queue_family_index(context.graphics_queue_family);
        let command_pool = unsafe { context.device.create_command_pool(&pool_info, None) }
            .map_err(vk_error(BackendError::InitializationFailed))?;

        log::info!(
            "Vulkan device created (queue family {})",
            context.graphics_queue_family
        );

        Ok(Self {
            device: context.device.clone(),
            swapchain_fn: swapchain::Device::new(&context.instance, &context.device),
            graphics_queue: Mutex::new(context.graphics_queue),
            command_pool: Mutex::new(command_pool),
            allocator: Mutex::new(Some(allocator)),
            buffer_allocations: Mutex::new(HashMap::new()),
            image_allocations: Mutex::new(HashMap::new()),
        })
    }

    /// Get the Vulkan device
    pub fn raw_device(&self) -> &ash::Device {
        &self.device
    }

    /// Wrap a swapchain created by the caller, creating one view per image.
    ///
    /// The views belong to the returned [`Swapchain`]; release them with
    /// [`release_swapchain`](Self::release_swapchain) before destroying the
    /// swapchain itself.
    pub fn import_swapchain(
        &self,
        swapchain: vk::SwapchainKHR,
        format: vk::Format,
        extent: vk::Extent2D,
    ) -> BackendResult<Swapchain> {
        let images = unsafe { self.swapchain_fn.get_swapchain_images(swapchain) }
            .map_err(vk_error(BackendError::InitializationFailed))?;
        let format = conversion::format_back(format);

        let mut result = Swapchain {
            handle: GpuSwapchain(swapchain.as_raw()),
            format,
            width: extent.width,
            height: extent.height,
            images: Vec::with_capacity(images.len()),
            image_views: Vec::with_capacity(images.len()),
        };
        for image in images {
            let image = GpuImage(image.as_raw());
            let view = self.create_image_view(&ImageViewDesc {
                image,
                format,
                view_type: ImageViewType::Type2d,
                base_mip_level: 0,
                mip_levels: 1,
                base_array_layer: 0,
                array_layers: 1,
            })?;
            result.images.push(image);
            result.image_views.push(view);
        }
        Ok(result)
    }

    /// Destroy the image views created by [`import_swapchain`](Self::import_swapchain).
    pub fn release_swapchain(&self, swapchain: &Swapchain) {
        for view in &swapchain.image_views {
            self.destroy_image_view(*view);
        }
    }

    fn allocate(
        &self,
        name: &str,
        requirements: vk::MemoryRequirements,
        location: gpu_allocator::MemoryLocation,
        linear: bool,
    ) -> Result<Allocation, String> {
        let mut allocator = self.allocator.lock();
        let allocator = allocator.as_mut().ok_or_else(|| "Allocator not available".to_string())?;
        allocator
            .allocate(&AllocationCreateDesc {
                name,
                requirements,
                location,
                linear,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            })
            .map_err(|e| e.to_string())
    }

    fn free(&self, allocation: Allocation) {
        if let Some(allocator) = self.allocator.lock().as_mut() {
            if let Err(err) = allocator.free(allocation) {
                log::warn!("Failed to free allocation: {}", err);
            }
        }
    }
}

fn subresource_range(format: Format, base_mip: u32, mips: u32, base_layer: u32, layers: u32) -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange {
        aspect_mask: conversion::aspect(format),
        base_mip_level: base_mip,
        level_count: mips,
        base_array_layer: base_layer,
        layer_count: layers,
    }
}

impl Device for VulkanDevice {
    // ========================================================================
    // Buffers and images
    // ========================================================================

    fn create_buffer(&self, desc: &BufferDesc) -> BackendResult<GpuBuffer> {
        let info = vk::BufferCreateInfo::default()
            .size(desc.size)
            .usage(conversion::buffer_usage(desc.usage))
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        unsafe {
            let buffer = self
                .device
                .create_buffer(&info, None)
                .map_err(vk_error(BackendError::BufferCreationFailed))?;
            let requirements = self.device.get_buffer_memory_requirements(buffer);

            let location = match desc.memory {
                MemoryLocation::CpuToGpu => gpu_allocator::MemoryLocation::CpuToGpu,
                MemoryLocation::GpuOnly => gpu_allocator::MemoryLocation::GpuOnly,
            };
            let allocation = match self.allocate("buffer", requirements, location, true) {
                Ok(allocation) => allocation,
                Err(err) => {
                    self.device.destroy_buffer(buffer, None);
                    return Err(BackendError::BufferCreationFailed(err));
                }
            };

            if let Err(err) = self
                .device
                .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
            {
                self.device.destroy_buffer(buffer, None);
                self.free(allocation);
                return Err(vk_error(BackendError::BufferCreationFailed)(err));
            }

            self.buffer_allocations.lock().insert(buffer.as_raw(), allocation);
            Ok(GpuBuffer(buffer.as_raw()))
        }
    }

    fn write_buffer(&self, buffer: GpuBuffer, offset: u64, data: &[u8]) -> BackendResult<()> {
        let mut allocations = self.buffer_allocations.lock();
        let allocation = allocations
            .get_mut(&buffer.0)
            .ok_or_else(|| BackendError::InvalidHandle(format!("{:?}", buffer)))?;
        let mapped = allocation
            .mapped_slice_mut()
            .ok_or_else(|| BackendError::MapFailed("buffer is not host visible".into()))?;

        let start = offset as usize;
        let end = start + data.len();
        if end > mapped.len() {
            return Err(BackendError::MapFailed(format!(
                "write of {} bytes at {} exceeds buffer size {}",
                data.len(),
                offset,
                mapped.len()
            )));
        }
        mapped[start..end].copy_from_slice(data);
        Ok(())
    }

    fn destroy_buffer(&self, buffer: GpuBuffer) {
        let allocation = self.buffer_allocations.lock().remove(&buffer.0);
        unsafe { self.device.destroy_buffer(vk::Buffer::from_raw(buffer.0), None) };
        if let Some(allocation) = allocation {
            self.free(allocation);
        }
    }

    fn create_image(&self, desc: &ImageDesc) -> BackendResult<GpuImage> {
        let usage = conversion::image_usage_for_format(desc.format, desc.usage);

        let mut info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(conversion::format(desc.format))
            .extent(vk::Extent3D {
                width: desc.width,
                height: desc.height,
                depth: 1,
            })
            .mip_levels(desc.mip_levels)
            .array_layers(desc.array_layers)
            .samples(conversion::samples(desc.samples))
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);
        if desc.cube_compatible {
            info = info.flags(vk::ImageCreateFlags::CUBE_COMPATIBLE);
        }

        unsafe {
            let image = self
                .device
                .create_image(&info, None)
                .map_err(vk_error(BackendError::ImageCreationFailed))?;
            let requirements = self.device.get_image_memory_requirements(image);

            let allocation =
                match self.allocate("image", requirements, gpu_allocator::MemoryLocation::GpuOnly, false) {
                    Ok(allocation) => allocation,
                    Err(err) => {
                        self.device.destroy_image(image, None);
                        return Err(BackendError::ImageCreationFailed(err));
                    }
                };

            if let Err(err) = self
                .device
                .bind_image_memory(image, allocation.memory(), allocation.offset())
            {
                self.device.destroy_image(image, None);
                self.free(allocation);
                return Err(vk_error(BackendError::ImageCreationFailed)(err));
            }

            self.image_allocations.lock().insert(image.as_raw(), allocation);
            Ok(GpuImage(image.as_raw()))
        }
    }

    fn destroy_image(&self, image: GpuImage) {
        // Swapchain images have no allocation and are not ours to destroy.
        let Some(allocation) = self.image_allocations.lock().remove(&image.0) else {
            return;
        };
        unsafe { self.device.destroy_image(vk::Image::from_raw(image.0), None) };
        self.free(allocation);
    }

    fn create_image_view(&self, desc: &ImageViewDesc) -> BackendResult<GpuImageView> {
        let info = vk::ImageViewCreateInfo::default()
            .image(vk::Image::from_raw(desc.image.0))
            .view_type(conversion::image_view_type(desc.view_type))
            .format(conversion::format(desc.format))
            .subresource_range(subresource_range(
                desc.format,
                desc.base_mip_level,
                desc.mip_levels,
                desc.base_array_layer,
                desc.array_layers,
            ));
        let view = unsafe { self.device.create_image_view(&info, None) }
            .map_err(vk_error(BackendError::ImageCreationFailed))?;
        Ok(GpuImageView(view.as_raw()))
    }

    fn destroy_image_view(&self, view: GpuImageView) {
        unsafe { self.device.destroy_image_view(vk::ImageView::from_raw(view.0), None) };
    }

    fn create_sampler(&self, desc: &SamplerDesc) -> BackendResult<GpuSampler> {
        let anisotropy = desc.anisotropy();
        let info = vk::SamplerCreateInfo::default()
            .mag_filter(conversion::filter(desc.mag_filter))
            .min_filter(conversion::filter(desc.min_filter))
            .mipmap_mode(conversion::mipmap_mode(desc.min_filter))
            .address_mode_u(conversion::address_mode(desc.address_u))
            .address_mode_v(conversion::address_mode(desc.address_v))
            .address_mode_w(conversion::address_mode(desc.address_w))
            .anisotropy_enable(anisotropy > 1.0)
            .max_anisotropy(anisotropy)
            .compare_enable(desc.compare.is_some())
            .compare_op(desc.compare.map(conversion::compare_op).unwrap_or(vk::CompareOp::ALWAYS))
            .min_lod(0.0)
            .max_lod(desc.mip_levels as f32)
            .border_color(vk::BorderColor::FLOAT_OPAQUE_BLACK);
        let sampler = unsafe { self.device.create_sampler(&info, None) }
            .map_err(vk_error(BackendError::SamplerCreationFailed))?;
        Ok(GpuSampler(sampler.as_raw()))
    }

    fn destroy_sampler(&self, sampler: GpuSampler) {
        unsafe { self.device.destroy_sampler(vk::Sampler::from_raw(sampler.0), None) };
    }

    fn create_shader_module(&self, stage: ShaderStage, spirv: &[u32]) -> BackendResult<GpuShaderModule> {
        let info = vk::ShaderModuleCreateInfo::default().code(spirv);
        let module = unsafe { self.device.create_shader_module(&info, None) }
            .map_err(vk_error(BackendError::ShaderCreationFailed))?;
        log::debug!("Created {:?} shader module ({} words)", stage, spirv.len());
        Ok(GpuShaderModule(module.as_raw()))
    }

    fn destroy_shader_module(&self, module: GpuShaderModule) {
        unsafe { self.device.destroy_shader_module(vk::ShaderModule::from_raw(module.0), None) };
    }

    // ========================================================================
    // Layouts and pipelines
    // ========================================================================

    fn create_descriptor_set_layout(&self, bindings: &[DescriptorBinding]) -> BackendResult<GpuDescriptorSetLayout> {
        let vk_bindings: Vec<vk::DescriptorSetLayoutBinding> = bindings
            .iter()
            .map(|b| {
                vk::DescriptorSetLayoutBinding::default()
                    .binding(b.binding)
                    .descriptor_type(conversion::descriptor_type(b.ty))
                    .descriptor_count(b.count)
                    .stage_flags(conversion::shader_stages(b.stages))
            })
            .collect();
        let info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&vk_bindings);
        let layout = unsafe { self.device.create_descriptor_set_layout(&info, None) }
            .map_err(vk_error(BackendError::DescriptorCreationFailed))?;
        Ok(GpuDescriptorSetLayout(layout.as_raw()))
    }

    fn destroy_descriptor_set_layout(&self, layout: GpuDescriptorSetLayout) {
        unsafe {
            self.device
                .destroy_descriptor_set_layout(vk::DescriptorSetLayout::from_raw(layout.0), None)
        };
    }

    fn create_pipeline_layout(
        &self,
        set_layouts: &[GpuDescriptorSetLayout],
        push_constants: &[PushConstantRange],
    ) -> BackendResult<GpuPipelineLayout> {
        let layouts: Vec<vk::DescriptorSetLayout> = set_layouts
            .iter()
            .map(|l| vk::DescriptorSetLayout::from_raw(l.0))
            .collect();
        let ranges: Vec<vk::PushConstantRange> = push_constants
            .iter()
            .map(|r| vk::PushConstantRange {
                stage_flags: conversion::shader_stages(r.stages),
                offset: r.offset,
                size: r.size,
            })
            .collect();
        let info = vk::PipelineLayoutCreateInfo::default()
            .set_layouts(&layouts)
            .push_constant_ranges(&ranges);
        let layout = unsafe { self.device.create_pipeline_layout(&info, None) }
            .map_err(vk_error(BackendError::PipelineCreationFailed))?;
        Ok(GpuPipelineLayout(layout.as_raw()))
    }

    fn destroy_pipeline_layout(&self, layout: GpuPipelineLayout) {
        unsafe {
            self.device
                .destroy_pipeline_layout(vk::PipelineLayout::from_raw(layout.0), None)
        };
    }

    fn create_graphics_pipeline(&self, key: &GraphicsPipelineKey) -> BackendResult<GpuPipeline> {
        let stages: Vec<vk::PipelineShaderStageCreateInfo> = key
            .active_shaders()
            .map(|(stage, module)| {
                vk::PipelineShaderStageCreateInfo::default()
                    .stage(conversion::shader_stage(stage))
                    .module(vk::ShaderModule::from_raw(module.0))
                    .name(ENTRY_POINT)
            })
            .collect();

        let bindings: Vec<vk::VertexInputBindingDescription> = key
            .vertex_bindings
            .iter()
            .filter(|b| b.stride > 0)
            .map(|b| vk::VertexInputBindingDescription {
                binding: b.binding,
                stride: b.stride,
                input_rate: conversion::input_rate(b.input_rate),
            })
            .collect();
        let attributes: Vec<vk::VertexInputAttributeDescription> = key
            .vertex_attributes
            .iter()
            .filter(|a| a.format != Format::Undefined)
            .map(|a| vk::VertexInputAttributeDescription {
                location: a.location,
                binding: a.binding,
                format: conversion::format(a.format),
                offset: a.offset,
            })
            .collect();
        let vertex_input = vk::PipelineVertexInputStateCreateInfo::default()
            .vertex_binding_descriptions(&bindings)
            .vertex_attribute_descriptions(&attributes);

        let raster = &key.raster_state;
        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::default()
            .topology(conversion::topology(raster.topology))
            .primitive_restart_enable(raster.prim_restart);
        let tessellation =
            vk::PipelineTessellationStateCreateInfo::default().patch_control_points(key.tesselation_vertex_count);
        let viewport = vk::PipelineViewportStateCreateInfo::default()
            .viewport_count(1)
            .scissor_count(1);
        let rasterization = vk::PipelineRasterizationStateCreateInfo::default()
            .polygon_mode(conversion::polygon_mode(raster.polygon_mode))
            .cull_mode(conversion::cull_mode(raster.cull_mode))
            .front_face(conversion::front_face(raster.front_face))
            .line_width(1.0);
        let multisample =
            vk::PipelineMultisampleStateCreateInfo::default().rasterization_samples(conversion::samples(key.samples));

        let ds = &key.ds_block;
        let stencil = vk::StencilOpState {
            fail_op: conversion::stencil_op(ds.stencil_fail_op),
            pass_op: conversion::stencil_op(ds.pass_op),
            depth_fail_op: conversion::stencil_op(ds.depth_fail_op),
            compare_op: conversion::compare_op(ds.compare_op),
            compare_mask: ds.compare_mask,
            write_mask: ds.write_mask,
            reference: ds.reference,
        };
        let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::default()
            .depth_test_enable(raster.depth_test_enable)
            .depth_write_enable(raster.depth_write_enable)
            .depth_compare_op(conversion::compare_op(ds.compare_op))
            .stencil_test_enable(ds.stencil_test_enable)
            .front(stencil)
            .back(stencil);

        let blend = &key.blend_state;
        let attachment = vk::PipelineColorBlendAttachmentState::default()
            .blend_enable(blend.blend_enable)
            .src_color_blend_factor(conversion::blend_factor(blend.src_colour))
            .dst_color_blend_factor(conversion::blend_factor(blend.dst_colour))
            .color_blend_op(conversion::blend_op(blend.colour_op))
            .src_alpha_blend_factor(conversion::blend_factor(blend.src_alpha))
            .dst_alpha_blend_factor(conversion::blend_factor(blend.dst_alpha))
            .alpha_blend_op(conversion::blend_op(blend.alpha_op))
            .color_write_mask(conversion::colour_components(raster.colour_write_mask));
        let attachments = vec![attachment; raster.colour_attach_count as usize];
        let colour_blend = vk::PipelineColorBlendStateCreateInfo::default().attachments(&attachments);

        let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        let dynamic = vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dynamic_states);

        let mut info = vk::GraphicsPipelineCreateInfo::default()
            .stages(&stages)
            .vertex_input_state(&vertex_input)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport)
            .rasterization_state(&rasterization)
            .multisample_state(&multisample)
            .depth_stencil_state(&depth_stencil)
            .color_blend_state(&colour_blend)
            .dynamic_state(&dynamic)
            .layout(vk::PipelineLayout::from_raw(key.pipeline_layout.0))
            .render_pass(vk::RenderPass::from_raw(key.render_pass.0))
            .subpass(0);
        if raster.topology == PrimitiveTopology::PatchList {
            info = info.tessellation_state(&tessellation);
        }

        let pipelines = unsafe {
            self.device
                .create_graphics_pipelines(vk::PipelineCache::null(), std::slice::from_ref(&info), None)
        }
        .map_err(|(_, err)| vk_error(BackendError::PipelineCreationFailed)(err))?;
        let pipeline = pipelines
            .first()
            .copied()
            .ok_or_else(|| BackendError::PipelineCreationFailed("no pipeline returned".into()))?;
        log::debug!("Created graphics pipeline with {} stages", stages.len());
        Ok(GpuPipeline(pipeline.as_raw()))
    }

    fn create_compute_pipeline(&self, key: &ComputePipelineKey) -> BackendResult<GpuPipeline> {
        let stage = vk::PipelineShaderStageCreateInfo::default()
            .stage(vk::ShaderStageFlags::COMPUTE)
            .module(vk::ShaderModule::from_raw(key.shader.0))
            .name(ENTRY_POINT);
        let info = vk::ComputePipelineCreateInfo::default()
            .stage(stage)
            .layout(vk::PipelineLayout::from_raw(key.pipeline_layout.0));

        let pipelines = unsafe {
            self.device
                .create_compute_pipelines(vk::PipelineCache::null(), std::slice::from_ref(&info), None)
        }
        .map_err(|(_, err)| vk_error(BackendError::PipelineCreationFailed)(err))?;
        let pipeline = pipelines
            .first()
            .copied()
            .ok_or_else(|| BackendError::PipelineCreationFailed("no pipeline returned".into()))?;
        Ok(GpuPipeline(pipeline.as_raw()))
    }

    fn destroy_pipeline(&self, pipeline: GpuPipeline) {
        unsafe { self.device.destroy_pipeline(vk::Pipeline::from_raw(pipeline.0), None) };
    }

    // ========================================================================
    // Descriptors
    // ========================================================================

    fn create_descriptor_pool(&self, max_sets: u32, sizes: &[DescriptorPoolSize]) -> BackendResult<GpuDescriptorPool> {
        let pool_sizes: Vec<vk::DescriptorPoolSize> = sizes
            .iter()
            .map(|s| vk::DescriptorPoolSize {
                ty: conversion::descriptor_type(s.ty),
                descriptor_count: s.count,
            })
            .collect();
        let info = vk::DescriptorPoolCreateInfo::default()
            .flags(vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET)
            .max_sets(max_sets)
            .pool_sizes(&pool_sizes);
        let pool = unsafe { self.device.create_descriptor_pool(&info, None) }
            .map_err(vk_error(BackendError::DescriptorCreationFailed))?;
        log::debug!("Created descriptor pool for {} sets", max_sets);
        Ok(GpuDescriptorPool(pool.as_raw()))
    }

    fn destroy_descriptor_pool(&self, pool: GpuDescriptorPool) {
        unsafe {
            self.device
                .destroy_descriptor_pool(vk::DescriptorPool::from_raw(pool.0), None)
        };
    }

    fn allocate_descriptor_sets(
        &self,
        pool: GpuDescriptorPool,
        layouts: &[GpuDescriptorSetLayout],
    ) -> BackendResult<Vec<GpuDescriptorSet>> {
        let vk_layouts: Vec<vk::DescriptorSetLayout> = layouts
            .iter()
            .map(|l| vk::DescriptorSetLayout::from_raw(l.0))
            .collect();
        let info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(vk::DescriptorPool::from_raw(pool.0))
            .set_layouts(&vk_layouts);
        let sets = unsafe { self.device.allocate_descriptor_sets(&info) }
            .map_err(vk_error(BackendError::DescriptorCreationFailed))?;
        Ok(sets.into_iter().map(|s| GpuDescriptorSet(s.as_raw())).collect())
    }

    fn free_descriptor_sets(&self, pool: GpuDescriptorPool, sets: &[GpuDescriptorSet]) {
        let vk_sets: Vec<vk::DescriptorSet> = sets.iter().map(|s| vk::DescriptorSet::from_raw(s.0)).collect();
        if let Err(err) = unsafe {
            self.device
                .free_descriptor_sets(vk::DescriptorPool::from_raw(pool.0), &vk_sets)
        } {
            log::warn!("Failed to free {} descriptor sets: {}", sets.len(), err);
        }
    }

    fn update_descriptor_sets(&self, writes: &[DescriptorWrite]) {
        let infos: Vec<(vk::DescriptorBufferInfo, vk::DescriptorImageInfo)> = writes
            .iter()
            .map(|w| match w.resource {
                DescriptorResource::Buffer { buffer, offset, range } => (
                    vk::DescriptorBufferInfo {
                        buffer: vk::Buffer::from_raw(buffer.0),
                        offset,
                        range,
                    },
                    vk::DescriptorImageInfo::default(),
                ),
                DescriptorResource::Image { view, layout, sampler } => (
                    vk::DescriptorBufferInfo::default(),
                    vk::DescriptorImageInfo {
                        sampler: vk::Sampler::from_raw(sampler.0),
                        image_view: vk::ImageView::from_raw(view.0),
                        image_layout: conversion::image_layout(layout),
                    },
                ),
            })
            .collect();

        let vk_writes: Vec<vk::WriteDescriptorSet> = writes
            .iter()
            .zip(&infos)
            .map(|(w, (buffer_info, image_info))| {
                let write = vk::WriteDescriptorSet::default()
                    .dst_set(vk::DescriptorSet::from_raw(w.set.0))
                    .dst_binding(w.binding)
                    .descriptor_type(conversion::descriptor_type(w.ty));
                match w.resource {
                    DescriptorResource::Buffer { .. } => write.buffer_info(std::slice::from_ref(buffer_info)),
                    DescriptorResource::Image { .. } => write.image_info(std::slice::from_ref(image_info)),
                }
            })
            .collect();

        unsafe { self.device.update_descriptor_sets(&vk_writes, &[]) };
    }

    // ========================================================================
    // Render passes
    // ========================================================================

    fn create_render_pass(&self, desc: &RenderPassDesc) -> BackendResult<GpuRenderPass> {
        let attachments: Vec<vk::AttachmentDescription> = desc
            .attachments
            .iter()
            .map(|a| {
                vk::AttachmentDescription::default()
                    .format(conversion::format(a.format))
                    .samples(conversion::samples(a.samples))
                    .load_op(conversion::load_op(a.load_op))
                    .store_op(conversion::store_op(a.store_op))
                    .stencil_load_op(conversion::load_op(a.stencil_load_op))
                    .stencil_store_op(conversion::store_op(a.stencil_store_op))
                    .initial_layout(conversion::image_layout(a.initial_layout))
                    .final_layout(conversion::image_layout(a.final_layout))
            })
            .collect();

        let colour_refs: Vec<vk::AttachmentReference> = (0..desc.colour_count)
            .map(|attachment| vk::AttachmentReference {
                attachment,
                layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            })
            .collect();
        let depth_ref = vk::AttachmentReference {
            attachment: desc.colour_count,
            layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
        };

        let mut subpass = vk::SubpassDescription::default()
            .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
            .color_attachments(&colour_refs);
        if desc.has_depth {
            subpass = subpass.depth_stencil_attachment(&depth_ref);
        }

        let dependencies = conversion::subpass_dependencies(desc.dependency);
        let view_masks = [0b11u32];
        let mut multiview = vk::RenderPassMultiviewCreateInfo::default()
            .view_masks(&view_masks)
            .correlation_masks(&view_masks);

        let mut info = vk::RenderPassCreateInfo::default()
            .attachments(&attachments)
            .subpasses(std::slice::from_ref(&subpass))
            .dependencies(&dependencies);
        if desc.multi_view {
            info = info.push_next(&mut multiview);
        }

        let render_pass = unsafe { self.device.create_render_pass(&info, None) }
            .map_err(vk_error(BackendError::RenderPassCreationFailed))?;
        log::debug!(
            "Created render pass: {} colour attachments, depth {}",
            desc.colour_count,
            desc.has_depth
        );
        Ok(GpuRenderPass(render_pass.as_raw()))
    }

    fn destroy_render_pass(&self, render_pass: GpuRenderPass) {
        unsafe {
            self.device
                .destroy_render_pass(vk::RenderPass::from_raw(render_pass.0), None)
        };
    }

    fn create_framebuffer(&self, desc: &FramebufferDesc) -> BackendResult<GpuFramebuffer> {
        let views: Vec<vk::ImageView> = desc
            .attachments
            .iter()
            .map(|v| vk::ImageView::from_raw(v.0))
            .collect();
        let info = vk::FramebufferCreateInfo::default()
            .render_pass(vk::RenderPass::from_raw(desc.render_pass.0))
            .attachments(&views)
            .width(desc.width)
            .height(desc.height)
            .layers(desc.layers);
        let framebuffer = unsafe { self.device.create_framebuffer(&info, None) }
            .map_err(vk_error(BackendError::FramebufferCreationFailed))?;
        Ok(GpuFramebuffer(framebuffer.as_raw()))
    }

    fn destroy_framebuffer(&self, framebuffer: GpuFramebuffer) {
        unsafe {
            self.device
                .destroy_framebuffer(vk::Framebuffer::from_raw(framebuffer.0), None)
        };
    }

    // ========================================================================
    // Synchronization
    // ========================================================================

    fn create_fence(&self) -> BackendResult<GpuFence> {
        let fence = unsafe { self.device.create_fence(&vk::FenceCreateInfo::default(), None) }
            .map_err(vk_error(BackendError::SyncFailed))?;
        Ok(GpuFence(fence.as_raw()))
    }

    fn destroy_fence(&self, fence: GpuFence) {
        unsafe { self.device.destroy_fence(vk::Fence::from_raw(fence.0), None) };
    }

    fn fence_signaled(&self, fence: GpuFence) -> BackendResult<bool> {
        unsafe { self.device.get_fence_status(vk::Fence::from_raw(fence.0)) }.map_err(vk_error(BackendError::SyncFailed))
    }

    fn wait_for_fences(&self, fences: &[GpuFence], wait_all: bool, timeout_ns: u64) -> BackendResult<bool> {
        let vk_fences: Vec<vk::Fence> = fences.iter().map(|f| vk::Fence::from_raw(f.0)).collect();
        match unsafe { self.device.wait_for_fences(&vk_fences, wait_all, timeout_ns) } {
            Ok(()) => Ok(true),
            Err(vk::Result::TIMEOUT) => Ok(false),
            Err(err) => Err(vk_error(BackendError::SyncFailed)(err)),
        }
    }

    fn create_semaphore(&self) -> BackendResult<GpuSemaphore> {
        let semaphore = unsafe { self.device.create_semaphore(&vk::SemaphoreCreateInfo::default(), None) }
            .map_err(vk_error(BackendError::SyncFailed))?;
        Ok(GpuSemaphore(semaphore.as_raw()))
    }

    fn destroy_semaphore(&self, semaphore: GpuSemaphore) {
        unsafe { self.device.destroy_semaphore(vk::Semaphore::from_raw(semaphore.0), None) };
    }

    // ========================================================================
    // Command buffers and submission
    // ========================================================================

    fn allocate_command_buffer(&self) -> BackendResult<GpuCommandBuffer> {
        let pool = self.command_pool.lock();
        let info = vk::CommandBufferAllocateInfo::default()
            .command_pool(*pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let buffers = unsafe { self.device.allocate_command_buffers(&info) }
            .map_err(vk_error(BackendError::CommandBufferFailed))?;
        let cmd = buffers
            .first()
            .copied()
            .ok_or_else(|| BackendError::CommandBufferFailed("no command buffer returned".into()))?;
        Ok(GpuCommandBuffer(cmd.as_raw()))
    }

    fn free_command_buffer(&self, cmd: GpuCommandBuffer) {
        let pool = self.command_pool.lock();
        unsafe {
            self.device
                .free_command_buffers(*pool, &[vk::CommandBuffer::from_raw(cmd.0)])
        };
    }

    fn begin_command_buffer(&self, cmd: GpuCommandBuffer) -> BackendResult<()> {
        let info = vk::CommandBufferBeginInfo::default().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe {
            self.device
                .begin_command_buffer(vk::CommandBuffer::from_raw(cmd.0), &info)
        }
        .map_err(vk_error(BackendError::CommandBufferFailed))
    }

    fn end_command_buffer(&self, cmd: GpuCommandBuffer) -> BackendResult<()> {
        unsafe { self.device.end_command_buffer(vk::CommandBuffer::from_raw(cmd.0)) }
            .map_err(vk_error(BackendError::CommandBufferFailed))
    }

    fn submit(&self, info: &SubmitInfo) -> BackendResult<()> {
        let waits: Vec<vk::Semaphore> = info
            .wait_semaphores
            .iter()
            .map(|s| vk::Semaphore::from_raw(s.0))
            .collect();
        let stages = vec![vk::PipelineStageFlags::ALL_COMMANDS; waits.len()];
        let signals: Vec<vk::Semaphore> = info
            .signal_semaphores
            .iter()
            .map(|s| vk::Semaphore::from_raw(s.0))
            .collect();
        let cmds = [vk::CommandBuffer::from_raw(info.cmd.0)];

        let submit = vk::SubmitInfo::default()
            .wait_semaphores(&waits)
            .wait_dst_stage_mask(&stages)
            .command_buffers(&cmds)
            .signal_semaphores(&signals);

        let queue = self.graphics_queue.lock();
        unsafe {
            self.device
                .queue_submit(*queue, std::slice::from_ref(&submit), vk::Fence::from_raw(info.fence.0))
        }
        .map_err(vk_error(BackendError::SubmitFailed))
    }

    fn wait_idle(&self) -> BackendResult<()> {
        unsafe { self.device.device_wait_idle() }.map_err(vk_error(BackendError::SyncFailed))
    }

    // ========================================================================
    // Presentation
    // ========================================================================

    fn acquire_next_image(&self, swapchain: GpuSwapchain, signal: GpuSemaphore) -> BackendResult<AcquireResult> {
        let result = unsafe {
            self.swapchain_fn.acquire_next_image(
                vk::SwapchainKHR::from_raw(swapchain.0),
                u64::MAX,
                vk::Semaphore::from_raw(signal.0),
                vk::Fence::null(),
            )
        };
        match result {
            Ok((index, false)) => Ok(AcquireResult::Acquired(index)),
            Ok((_, true)) | Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(AcquireResult::Stale),
            Err(err) => Err(vk_error(BackendError::PresentFailed)(err)),
        }
    }

    fn present(&self, swapchain: GpuSwapchain, image_index: u32, wait: &[GpuSemaphore]) -> BackendResult<bool> {
        let waits: Vec<vk::Semaphore> = wait.iter().map(|s| vk::Semaphore::from_raw(s.0)).collect();
        let swapchains = [vk::SwapchainKHR::from_raw(swapchain.0)];
        let indices = [image_index];
        let info = vk::PresentInfoKHR::default()
            .wait_semaphores(&waits)
            .swapchains(&swapchains)
            .image_indices(&indices);

        let queue = self.graphics_queue.lock();
        match unsafe { self.swapchain_fn.queue_present(*queue, &info) } {
            Ok(suboptimal) => Ok(!suboptimal),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(false),
            Err(err) => Err(vk_error(BackendError::PresentFailed)(err)),
        }
    }

    // ========================================================================
    // Recording
    // ========================================================================

    fn cmd_begin_render_pass(&self, cmd: GpuCommandBuffer, begin: &RenderPassBegin) {
        let clear_values: Vec<vk::ClearValue> = begin.clear_values.iter().map(conversion::clear_value).collect();
        let info = vk::RenderPassBeginInfo::default()
            .render_pass(vk::RenderPass::from_raw(begin.render_pass.0))
            .framebuffer(vk::Framebuffer::from_raw(begin.framebuffer.0))
            .render_area(vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent: vk::Extent2D {
                    width: begin.width,
                    height: begin.height,
                },
            })
            .clear_values(&clear_values);
        unsafe {
            self.device.cmd_begin_render_pass(
                vk::CommandBuffer::from_raw(cmd.0),
                &info,
                vk::SubpassContents::INLINE,
            )
        };
    }

    fn cmd_end_render_pass(&self, cmd: GpuCommandBuffer) {
        unsafe { self.device.cmd_end_render_pass(vk::CommandBuffer::from_raw(cmd.0)) };
    }

    fn cmd_bind_pipeline(&self, cmd: GpuCommandBuffer, bind_point: PipelineBindPoint, pipeline: GpuPipeline) {
        unsafe {
            self.device.cmd_bind_pipeline(
                vk::CommandBuffer::from_raw(cmd.0),
                conversion::bind_point(bind_point),
                vk::Pipeline::from_raw(pipeline.0),
            )
        };
    }

    fn cmd_bind_descriptor_sets(
        &self,
        cmd: GpuCommandBuffer,
        bind_point: PipelineBindPoint,
        layout: GpuPipelineLayout,
        sets: &[GpuDescriptorSet],
        dynamic_offsets: &[u32],
    ) {
        let vk_sets: Vec<vk::DescriptorSet> = sets.iter().map(|s| vk::DescriptorSet::from_raw(s.0)).collect();
        unsafe {
            self.device.cmd_bind_descriptor_sets(
                vk::CommandBuffer::from_raw(cmd.0),
                conversion::bind_point(bind_point),
                vk::PipelineLayout::from_raw(layout.0),
                0,
                &vk_sets,
                dynamic_offsets,
            )
        };
    }

    fn cmd_bind_vertex_buffers(&self, cmd: GpuCommandBuffer, first_binding: u32, buffers: &[GpuBuffer], offsets: &[u64]) {
        let vk_buffers: Vec<vk::Buffer> = buffers.iter().map(|b| vk::Buffer::from_raw(b.0)).collect();
        unsafe {
            self.device.cmd_bind_vertex_buffers(
                vk::CommandBuffer::from_raw(cmd.0),
                first_binding,
                &vk_buffers,
                offsets,
            )
        };
    }

    fn cmd_bind_index_buffer(&self, cmd: GpuCommandBuffer, buffer: GpuBuffer, offset: u64, index_type: IndexType) {
        unsafe {
            self.device.cmd_bind_index_buffer(
                vk::CommandBuffer::from_raw(cmd.0),
                vk::Buffer::from_raw(buffer.0),
                offset,
                conversion::index_type(index_type),
            )
        };
    }

    fn cmd_set_viewport(&self, cmd: GpuCommandBuffer, viewport: &Viewport) {
        let vk_viewport = vk::Viewport {
            x: viewport.x,
            y: viewport.y,
            width: viewport.width,
            height: viewport.height,
            min_depth: viewport.min_depth,
            max_depth: viewport.max_depth,
        };
        unsafe {
            self.device
                .cmd_set_viewport(vk::CommandBuffer::from_raw(cmd.0), 0, &[vk_viewport])
        };
    }

    fn cmd_set_scissor(&self, cmd: GpuCommandBuffer, scissor: &Rect2D) {
        let rect = vk::Rect2D {
            offset: vk::Offset2D {
                x: scissor.x,
                y: scissor.y,
            },
            extent: vk::Extent2D {
                width: scissor.width,
                height: scissor.height,
            },
        };
        unsafe { self.device.cmd_set_scissor(vk::CommandBuffer::from_raw(cmd.0), 0, &[rect]) };
    }

    fn cmd_push_constants(
        &self,
        cmd: GpuCommandBuffer,
        layout: GpuPipelineLayout,
        stages: ShaderStages,
        offset: u32,
        data: &[u8],
    ) {
        unsafe {
            self.device.cmd_push_constants(
                vk::CommandBuffer::from_raw(cmd.0),
                vk::PipelineLayout::from_raw(layout.0),
                conversion::shader_stages(stages),
                offset,
                data,
            )
        };
    }

    fn cmd_draw(&self, cmd: GpuCommandBuffer, vertex_count: u32, instance_count: u32, first_vertex: u32, first_instance: u32) {
        unsafe {
            self.device.cmd_draw(
                vk::CommandBuffer::from_raw(cmd.0),
                vertex_count,
                instance_count,
                first_vertex,
                first_instance,
            )
        };
    }

    fn cmd_draw_indexed(
        &self,
        cmd: GpuCommandBuffer,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    ) {
        unsafe {
            self.device.cmd_draw_indexed(
                vk::CommandBuffer::from_raw(cmd.0),
                index_count,
                instance_count,
                first_index,
                vertex_offset,
                first_instance,
            )
        };
    }

    fn cmd_dispatch(&self, cmd: GpuCommandBuffer, x: u32, y: u32, z: u32) {
        unsafe { self.device.cmd_dispatch(vk::CommandBuffer::from_raw(cmd.0), x, y, z) };
    }

    fn cmd_copy_buffer(&self, cmd: GpuCommandBuffer, src: GpuBuffer, dst: GpuBuffer, regions: &[BufferCopy]) {
        let vk_regions: Vec<vk::BufferCopy> = regions
            .iter()
            .map(|r| vk::BufferCopy {
                src_offset: r.src_offset,
                dst_offset: r.dst_offset,
                size: r.size,
            })
            .collect();
        unsafe {
            self.device.cmd_copy_buffer(
                vk::CommandBuffer::from_raw(cmd.0),
                vk::Buffer::from_raw(src.0),
                vk::Buffer::from_raw(dst.0),
                &vk_regions,
            )
        };
    }

    fn cmd_copy_buffer_to_image(
        &self,
        cmd: GpuCommandBuffer,
        src: GpuBuffer,
        dst: GpuImage,
        format: Format,
        regions: &[BufferImageCopy],
    ) {
        let vk_regions: Vec<vk::BufferImageCopy> = regions
            .iter()
            .map(|r| vk::BufferImageCopy {
                buffer_offset: r.buffer_offset,
                buffer_row_length: 0,
                buffer_image_height: 0,
                image_subresource: vk::ImageSubresourceLayers {
                    aspect_mask: conversion::aspect(format),
                    mip_level: r.mip_level,
                    base_array_layer: r.base_array_layer,
                    layer_count: r.layer_count,
                },
                image_offset: vk::Offset3D::default(),
                image_extent: vk::Extent3D {
                    width: r.width,
                    height: r.height,
                    depth: 1,
                },
            })
            .collect();
        unsafe {
            self.device.cmd_copy_buffer_to_image(
                vk::CommandBuffer::from_raw(cmd.0),
                vk::Buffer::from_raw(src.0),
                vk::Image::from_raw(dst.0),
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &vk_regions,
            )
        };
    }

    fn cmd_image_barrier(&self, cmd: GpuCommandBuffer, barrier: &ImageBarrier) {
        let (src_access, src_stage) = conversion::layout_access(barrier.old_layout);
        let (dst_access, dst_stage) = conversion::layout_access(barrier.new_layout);
        let vk_barrier = vk::ImageMemoryBarrier::default()
            .old_layout(conversion::image_layout(barrier.old_layout))
            .new_layout(conversion::image_layout(barrier.new_layout))
            .src_access_mask(src_access)
            .dst_access_mask(dst_access)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(vk::Image::from_raw(barrier.image.0))
            .subresource_range(subresource_range(
                barrier.format,
                barrier.base_mip_level,
                barrier.mip_levels,
                barrier.base_array_layer,
                barrier.array_layers,
            ));
        unsafe {
            self.device.cmd_pipeline_barrier(
                vk::CommandBuffer::from_raw(cmd.0),
                src_stage,
                dst_stage,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[vk_barrier],
            )
        };
    }

    fn cmd_buffer_barrier(&self, cmd: GpuCommandBuffer, barrier: &BufferBarrier) {
        let (dst_access, dst_stage) = conversion::buffer_consumer(barrier.dst_usage);
        let vk_barrier = vk::BufferMemoryBarrier::default()
            .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
            .dst_access_mask(dst_access)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .buffer(vk::Buffer::from_raw(barrier.buffer.0))
            .offset(0)
            .size(vk::WHOLE_SIZE);
        unsafe {
            self.device.cmd_pipeline_barrier(
                vk::CommandBuffer::from_raw(cmd.0),
                vk::PipelineStageFlags::TRANSFER,
                dst_stage,
                vk::DependencyFlags::empty(),
                &[],
                &[vk_barrier],
                &[],
            )
        };
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();

            // Anything still live here was leaked by the caller.
            let buffers: Vec<(u64, Allocation)> = self.buffer_allocations.lock().drain().collect();
            let images: Vec<(u64, Allocation)> = self.image_allocations.lock().drain().collect();
            if !buffers.is_empty() || !images.is_empty() {
                log::warn!(
                    "Vulkan device dropped with {} buffers and {} images alive",
                    buffers.len(),
                    images.len()
                );
            }
            for (raw, allocation) in buffers {
                self.device.destroy_buffer(vk::Buffer::from_raw(raw), None);
                self.free(allocation);
            }
            for (raw, allocation) in images {
                self.device.destroy_image(vk::Image::from_raw(raw), None);
                self.free(allocation);
            }

            // The allocator must go before the device does.
            drop(self.allocator.lock().take());

            self.device.destroy_command_pool(*self.command_pool.lock(), None);
        }
    }
}

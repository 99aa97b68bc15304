//! Owner of every live texture and uniform/storage buffer.
//!
//! Deleting a resource invalidates its handle immediately but keeps the
//! device objects alive for `gc_frames` calls to
//! [`ResourceCache::garbage_collection`], one per frame boundary, so command
//! buffers recorded before the delete have retired by the time they go.

use std::sync::Arc;

use crate::backend::{
    BackendError, BackendResult, BufferDesc, BufferUsage, Device, Format, GpuBuffer, GpuImage,
    GpuImageView, ImageDesc, ImageLayout, ImageUsage, ImageViewDesc, ImageViewType, MemoryLocation,
};
use crate::handle::{Arena, Handle};

pub const MAX_MIP_COUNT: u32 = 12;

pub type TextureHandle = Handle<Texture>;
pub type BufferHandle = Handle<Buffer>;

/// Immutable description of a texture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextureInfo {
    pub format: Format,
    pub width: u32,
    pub height: u32,
    pub mip_levels: u32,
    pub face_count: u32,
    pub array_count: u32,
    pub usage: ImageUsage,
}

impl TextureInfo {
    pub fn layer_count(&self) -> u32 {
        self.face_count.max(1) * self.array_count.max(1)
    }
}

/// An image with one view per mip level.
#[derive(Debug)]
pub struct Texture {
    info: TextureInfo,
    image: GpuImage,
    views: Vec<GpuImageView>,
    image_layout: ImageLayout,
    owns_image: bool,
}

impl Texture {
    pub fn info(&self) -> &TextureInfo {
        &self.info
    }

    pub fn image(&self) -> GpuImage {
        self.image
    }

    /// View of the whole texture starting at mip 0.
    pub fn image_view(&self) -> GpuImageView {
        self.views[0]
    }

    pub fn image_view_for_level(&self, level: u32) -> GpuImageView {
        assert!(
            (level as usize) < self.views.len(),
            "Mip level {} out of range ({} levels)",
            level,
            self.views.len()
        );
        self.views[level as usize]
    }

    /// Layout shaders see the texture in.
    pub fn image_layout(&self) -> ImageLayout {
        self.image_layout
    }

    pub fn set_image_layout(&mut self, layout: ImageLayout) {
        self.image_layout = layout;
    }

    fn destroy(self, device: &dyn Device) {
        for view in self.views {
            device.destroy_image_view(view);
        }
        if self.owns_image {
            device.destroy_image(self.image);
        }
    }
}

/// A host visible uniform or storage buffer.
#[derive(Debug)]
pub struct Buffer {
    buffer: GpuBuffer,
    size: u64,
    usage: BufferUsage,
}

impl Buffer {
    pub fn get(&self) -> GpuBuffer {
        self.buffer
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn usage(&self) -> BufferUsage {
        self.usage
    }
}

fn sampled_layout(format: Format, usage: ImageUsage) -> ImageLayout {
    if format.is_depth() || format.is_stencil() {
        ImageLayout::DepthStencilReadOnly
    } else if usage.contains(ImageUsage::STORAGE) {
        ImageLayout::General
    } else {
        ImageLayout::ShaderReadOnly
    }
}

pub struct ResourceCache {
    device: Arc<dyn Device>,
    gc_frames: u32,
    textures: Arena<Texture>,
    buffers: Arena<Buffer>,
    texture_gc: Vec<(u32, Texture)>,
    buffer_gc: Vec<(u32, Buffer)>,
}

impl ResourceCache {
    /// `gc_frames` is the number of garbage collections a deleted resource
    /// survives.
    pub fn new(device: Arc<dyn Device>, gc_frames: u32) -> Self {
        Self {
            device,
            gc_frames: gc_frames.max(1),
            textures: Arena::new(),
            buffers: Arena::new(),
            texture_gc: Vec::new(),
            buffer_gc: Vec::new(),
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn create_texture_2d(
        &mut self,
        format: Format,
        width: u32,
        height: u32,
        mip_levels: u32,
        face_count: u32,
        array_count: u32,
        usage: ImageUsage,
    ) -> BackendResult<TextureHandle> {
        assert!(
            mip_levels < MAX_MIP_COUNT,
            "Requested mip levels of {} exceed max allowed count: {}",
            mip_levels,
            MAX_MIP_COUNT
        );
        let mip_levels = mip_levels.max(1);
        // Any owned texture may be filled by `Driver::map_texture`.
        let usage = usage | ImageUsage::TRANSFER_DST;

        let info = TextureInfo {
            format,
            width,
            height,
            mip_levels,
            face_count: face_count.max(1),
            array_count: array_count.max(1),
            usage,
        };
        let image = self.device.create_image(&ImageDesc {
            format,
            width,
            height,
            mip_levels,
            array_layers: info.layer_count(),
            samples: 1,
            usage,
            cube_compatible: info.face_count == 6,
        })?;

        let view_type = if info.face_count == 6 {
            ImageViewType::Cube
        } else if info.array_count > 1 {
            ImageViewType::Type2dArray
        } else {
            ImageViewType::Type2d
        };

        let mut views = Vec::with_capacity(mip_levels as usize);
        for level in 0..mip_levels {
            let view = self.device.create_image_view(&ImageViewDesc {
                image,
                format,
                view_type,
                base_mip_level: level,
                mip_levels: if level == 0 { mip_levels } else { 1 },
                base_array_layer: 0,
                array_layers: info.layer_count(),
            });
            match view {
                Ok(view) => views.push(view),
                Err(e) => {
                    for view in views {
                        self.device.destroy_image_view(view);
                    }
                    self.device.destroy_image(image);
                    return Err(e);
                }
            }
        }

        Ok(self.textures.insert(Texture {
            info,
            image,
            views,
            image_layout: sampled_layout(format, usage),
            owns_image: true,
        }))
    }

    /// Wrap an image owned elsewhere, e.g. a swapchain image. Only the view is
    /// destroyed with the texture.
    pub fn import_texture_2d(
        &mut self,
        format: Format,
        width: u32,
        height: u32,
        image: GpuImage,
    ) -> BackendResult<TextureHandle> {
        let view = self.device.create_image_view(&ImageViewDesc {
            image,
            format,
            view_type: ImageViewType::Type2d,
            base_mip_level: 0,
            mip_levels: 1,
            base_array_layer: 0,
            array_layers: 1,
        })?;
        Ok(self.textures.insert(Texture {
            info: TextureInfo {
                format,
                width,
                height,
                mip_levels: 1,
                face_count: 1,
                array_count: 1,
                usage: ImageUsage::COLOUR_ATTACHMENT,
            },
            image,
            views: vec![view],
            image_layout: sampled_layout(format, ImageUsage::empty()),
            owns_image: false,
        }))
    }

    /// Create a persistently mapped uniform or storage buffer.
    pub fn create_ubo(&mut self, size: u64, usage: BufferUsage) -> BackendResult<BufferHandle> {
        let buffer = self.device.create_buffer(&BufferDesc {
            size,
            usage,
            memory: MemoryLocation::CpuToGpu,
        })?;
        Ok(self.buffers.insert(Buffer { buffer, size, usage }))
    }

    /// Queue a texture for destruction. A stale or invalid handle is ignored.
    pub fn delete_texture(&mut self, handle: TextureHandle) {
        if let Some(texture) = self.textures.remove(handle) {
            self.texture_gc.push((self.gc_frames, texture));
        }
    }

    /// Queue a buffer for destruction. A stale or invalid handle is ignored.
    pub fn delete_ubo(&mut self, handle: BufferHandle) {
        if let Some(buffer) = self.buffers.remove(handle) {
            self.buffer_gc.push((self.gc_frames, buffer));
        }
    }

    /// Count down every pending resource and destroy those reaching zero.
    pub fn garbage_collection(&mut self) {
        let device = self.device.as_ref();

        let mut kept = Vec::with_capacity(self.texture_gc.len());
        for (frames, texture) in self.texture_gc.drain(..) {
            let frames = frames - 1;
            if frames == 0 {
                texture.destroy(device);
            } else {
                kept.push((frames, texture));
            }
        }
        self.texture_gc = kept;

        let mut kept = Vec::with_capacity(self.buffer_gc.len());
        for (frames, buffer) in self.buffer_gc.drain(..) {
            let frames = frames - 1;
            if frames == 0 {
                device.destroy_buffer(buffer.buffer);
            } else {
                kept.push((frames, buffer));
            }
        }
        self.buffer_gc = kept;
    }

    pub fn texture(&self, handle: TextureHandle) -> Option<&Texture> {
        self.textures.get(handle)
    }

    pub fn texture_mut(&mut self, handle: TextureHandle) -> Option<&mut Texture> {
        self.textures.get_mut(handle)
    }

    pub fn buffer(&self, handle: BufferHandle) -> Option<&Buffer> {
        self.buffers.get(handle)
    }

    pub fn is_valid_texture(&self, handle: TextureHandle) -> bool {
        self.textures.contains(handle)
    }

    pub fn is_valid_buffer(&self, handle: BufferHandle) -> bool {
        self.buffers.contains(handle)
    }

    /// Write into a mapped buffer.
    pub fn map_buffer(&self, handle: BufferHandle, offset: u64, data: &[u8]) -> BackendResult<()> {
        let buffer = self
            .buffers
            .get(handle)
            .ok_or_else(|| BackendError::InvalidHandle(format!("{:?}", handle)))?;
        if offset + data.len() as u64 > buffer.size {
            return Err(BackendError::MapFailed(format!(
                "write of {} bytes at offset {} exceeds buffer size {}",
                data.len(),
                offset,
                buffer.size
            )));
        }
        self.device.write_buffer(buffer.buffer, offset, data)
    }

    pub fn live_texture_count(&self) -> usize {
        self.textures.len()
    }

    pub fn live_buffer_count(&self) -> usize {
        self.buffers.len()
    }

    /// Resources deleted and not yet destroyed.
    pub fn pending_gc_count(&self) -> usize {
        self.texture_gc.len() + self.buffer_gc.len()
    }

    /// Destroy live and pending resources. Used at shutdown.
    pub fn clear(&mut self) {
        let device = self.device.as_ref();
        for texture in self.textures.drain() {
            texture.destroy(device);
        }
        for (_, texture) in self.texture_gc.drain(..) {
            texture.destroy(device);
        }
        for buffer in self.buffers.drain() {
            device.destroy_buffer(buffer.buffer);
        }
        for (_, buffer) in self.buffer_gc.drain(..) {
            device.destroy_buffer(buffer.buffer);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{DummyDevice, ObjectKind};
    use rstest::rstest;

    fn cache(gc_frames: u32) -> (Arc<DummyDevice>, ResourceCache) {
        let device = Arc::new(DummyDevice::new());
        let cache = ResourceCache::new(device.clone(), gc_frames);
        (device, cache)
    }

    fn colour_texture(cache: &mut ResourceCache) -> TextureHandle {
        cache
            .create_texture_2d(Format::Rgba8Unorm, 64, 64, 1, 1, 1, ImageUsage::SAMPLED)
            .unwrap()
    }

    #[rstest]
    #[case::one_frame(1)]
    #[case::ring_of_ten(10)]
    fn test_texture_destroyed_after_exact_gc_count(#[case] gc_frames: u32) {
        let (device, mut cache) = cache(gc_frames);
        let handle = colour_texture(&mut cache);

        cache.delete_texture(handle);
        assert!(!cache.is_valid_texture(handle));

        for _ in 0..gc_frames - 1 {
            cache.garbage_collection();
            assert_eq!(device.destroyed(ObjectKind::Image), 0);
        }
        cache.garbage_collection();
        assert_eq!(device.destroyed(ObjectKind::Image), 1);
        assert_eq!(device.destroyed(ObjectKind::ImageView), 1);
        assert_eq!(cache.pending_gc_count(), 0);
    }

    #[test]
    fn test_double_delete_is_silent() {
        let (device, mut cache) = cache(2);
        let texture = colour_texture(&mut cache);
        let ubo = cache.create_ubo(128, BufferUsage::UNIFORM).unwrap();

        cache.delete_texture(texture);
        cache.delete_texture(texture);
        cache.delete_ubo(ubo);
        cache.delete_ubo(ubo);
        cache.delete_ubo(BufferHandle::default());
        assert_eq!(cache.pending_gc_count(), 2);

        for _ in 0..4 {
            cache.garbage_collection();
        }
        assert_eq!(device.destroyed(ObjectKind::Image), 1);
        assert_eq!(device.destroyed(ObjectKind::Buffer), 1);
    }

    #[test]
    fn test_mip_views_and_layout() {
        let (device, mut cache) = cache(1);
        let handle = cache
            .create_texture_2d(Format::Rgba8Unorm, 256, 256, 4, 1, 1, ImageUsage::SAMPLED)
            .unwrap();
        let texture = cache.texture(handle).unwrap();
        assert_eq!(device.created(ObjectKind::ImageView), 4);
        assert_ne!(texture.image_view_for_level(0), texture.image_view_for_level(3));
        assert_eq!(texture.image_layout(), ImageLayout::ShaderReadOnly);
        assert!(texture.info().usage.contains(ImageUsage::TRANSFER_DST));
    }

    #[rstest]
    #[case::depth(Format::D32Float, ImageUsage::DEPTH_STENCIL_ATTACHMENT, ImageLayout::DepthStencilReadOnly)]
    #[case::storage(Format::Rgba16Float, ImageUsage::STORAGE, ImageLayout::General)]
    fn test_initial_layout(#[case] format: Format, #[case] usage: ImageUsage, #[case] expected: ImageLayout) {
        let (_device, mut cache) = cache(1);
        let handle = cache.create_texture_2d(format, 8, 8, 1, 1, 1, usage).unwrap();
        let texture = cache.texture(handle).unwrap();
        assert_eq!(texture.image_layout(), expected);
        assert!(texture.info().usage.contains(ImageUsage::TRANSFER_DST | usage));
    }

    #[test]
    fn test_imported_image_is_not_destroyed() {
        let (device, mut cache) = cache(1);
        let image = GpuImage::from_raw(4242);
        let handle = cache.import_texture_2d(Format::Bgra8Unorm, 800, 600, image).unwrap();
        cache.delete_texture(handle);
        cache.garbage_collection();
        assert_eq!(device.destroyed(ObjectKind::Image), 0);
        assert_eq!(device.destroyed(ObjectKind::ImageView), 1);
    }

    #[test]
    fn test_map_buffer_bounds() {
        let (device, mut cache) = cache(1);
        let handle = cache.create_ubo(8, BufferUsage::UNIFORM).unwrap();
        cache.map_buffer(handle, 4, &[1, 2, 3, 4]).unwrap();
        assert!(cache.map_buffer(handle, 6, &[1, 2, 3]).is_err());
        let gpu = cache.buffer(handle).unwrap().get();
        assert_eq!(device.buffer_contents(gpu), vec![0, 0, 0, 0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_clear_destroys_pending_and_live() {
        let (device, mut cache) = cache(5);
        let a = colour_texture(&mut cache);
        let _b = colour_texture(&mut cache);
        cache.delete_texture(a);
        cache.clear();
        assert_eq!(device.live(ObjectKind::Image), 0);
        assert_eq!(device.live(ObjectKind::ImageView), 0);
    }
}

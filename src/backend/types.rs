//! Plain data types shared by every [`Device`](super::Device) implementation.
//!
//! Nothing in here talks to a GPU. The Vulkan backend converts these into
//! `ash::vk` structures; the dummy backend stores them as-is.

use bitflags::bitflags;

macro_rules! gpu_object {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
        pub struct $name(pub(crate) u64);

        impl $name {
            /// The null object.
            pub const NULL: Self = Self(0);

            /// Wraps a raw backend id. Backends outside this crate use this to
            /// mint their own objects.
            pub fn from_raw(raw: u64) -> Self {
                Self(raw)
            }

            pub fn raw(self) -> u64 {
                self.0
            }

            pub fn is_null(self) -> bool {
                self.0 == 0
            }
        }
    };
}

gpu_object!(
    /// Device buffer object.
    GpuBuffer
);
gpu_object!(
    /// Device image object.
    GpuImage
);
gpu_object!(
    /// View onto a [`GpuImage`].
    GpuImageView
);
gpu_object!(GpuSampler);
gpu_object!(GpuShaderModule);
gpu_object!(GpuDescriptorSetLayout);
gpu_object!(GpuPipelineLayout);
gpu_object!(
    /// Graphics or compute pipeline.
    GpuPipeline
);
gpu_object!(GpuDescriptorPool);
gpu_object!(GpuDescriptorSet);
gpu_object!(GpuRenderPass);
gpu_object!(GpuFramebuffer);
gpu_object!(
    /// Primary command buffer.
    GpuCommandBuffer
);
gpu_object!(GpuFence);
gpu_object!(GpuSemaphore);
gpu_object!(GpuSwapchain);

/// Texel and vertex attribute formats understood by the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Format {
    #[default]
    Undefined,
    R8Unorm,
    Rg8Unorm,
    Rgba8Unorm,
    Rgba8Srgb,
    Bgra8Unorm,
    Bgra8Srgb,
    R16Float,
    Rg16Float,
    Rgba16Float,
    R32Uint,
    R32Float,
    Rg32Float,
    Rgb32Float,
    Rgba32Float,
    Rgba32Uint,
    D16Unorm,
    D32Float,
    D24UnormS8Uint,
    D32FloatS8Uint,
}

impl Format {
    pub fn is_depth(self) -> bool {
        matches!(
            self,
            Format::D16Unorm | Format::D32Float | Format::D24UnormS8Uint | Format::D32FloatS8Uint
        )
    }

    pub fn is_stencil(self) -> bool {
        matches!(self, Format::D24UnormS8Uint | Format::D32FloatS8Uint)
    }

    /// Size of one texel (or one vertex attribute) in bytes.
    pub fn bytes_per_pixel(self) -> u32 {
        match self {
            Format::Undefined => 0,
            Format::R8Unorm => 1,
            Format::Rg8Unorm | Format::R16Float | Format::D16Unorm => 2,
            Format::Rgba8Unorm
            | Format::Rgba8Srgb
            | Format::Bgra8Unorm
            | Format::Bgra8Srgb
            | Format::Rg16Float
            | Format::R32Uint
            | Format::R32Float
            | Format::D32Float
            | Format::D24UnormS8Uint => 4,
            Format::Rgba16Float | Format::Rg32Float | Format::D32FloatS8Uint => 8,
            Format::Rgb32Float => 12,
            Format::Rgba32Float | Format::Rgba32Uint => 16,
        }
    }
}

/// Image layouts tracked by the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ImageLayout {
    #[default]
    Undefined,
    General,
    ColourAttachment,
    DepthStencilAttachment,
    DepthStencilReadOnly,
    ShaderReadOnly,
    TransferSrc,
    TransferDst,
    PresentSrc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum LoadOp {
    Load,
    Clear,
    #[default]
    DontCare,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum StoreOp {
    Store,
    #[default]
    DontCare,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CullMode {
    None,
    #[default]
    Front,
    Back,
    FrontAndBack,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PolygonMode {
    #[default]
    Fill,
    Line,
    Point,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum FrontFace {
    #[default]
    CounterClockwise,
    Clockwise,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PrimitiveTopology {
    PointList,
    LineList,
    LineStrip,
    #[default]
    TriangleList,
    TriangleStrip,
    TriangleFan,
    PatchList,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CompareOp {
    Never,
    Less,
    Equal,
    #[default]
    LessOrEqual,
    Greater,
    NotEqual,
    GreaterOrEqual,
    Always,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum StencilOp {
    Keep,
    #[default]
    Zero,
    Replace,
    IncrementAndClamp,
    DecrementAndClamp,
    Invert,
    IncrementAndWrap,
    DecrementAndWrap,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum BlendFactor {
    #[default]
    Zero,
    One,
    SrcColour,
    OneMinusSrcColour,
    DstColour,
    OneMinusDstColour,
    SrcAlpha,
    OneMinusSrcAlpha,
    DstAlpha,
    OneMinusDstAlpha,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum BlendOp {
    #[default]
    Add,
    Subtract,
    ReverseSubtract,
    Min,
    Max,
}

bitflags! {
    /// Colour channels written by a pipeline.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ColourComponents: u32 {
        const R = 1 << 0;
        const G = 1 << 1;
        const B = 1 << 2;
        const A = 1 << 3;
        const RGBA = Self::R.bits() | Self::G.bits() | Self::B.bits() | Self::A.bits();
    }
}

impl Default for ColourComponents {
    fn default() -> Self {
        Self::RGBA
    }
}

/// A single programmable pipeline stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShaderStage {
    Vertex,
    TesselationControl,
    TesselationEval,
    Geometry,
    Fragment,
    Compute,
}

impl ShaderStage {
    /// Number of stages; the size of per-stage arrays.
    pub const COUNT: usize = 6;

    pub const ALL: [ShaderStage; Self::COUNT] = [
        ShaderStage::Vertex,
        ShaderStage::TesselationControl,
        ShaderStage::TesselationEval,
        ShaderStage::Geometry,
        ShaderStage::Fragment,
        ShaderStage::Compute,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn flag(self) -> ShaderStages {
        match self {
            ShaderStage::Vertex => ShaderStages::VERTEX,
            ShaderStage::TesselationControl => ShaderStages::TESSELATION_CONTROL,
            ShaderStage::TesselationEval => ShaderStages::TESSELATION_EVAL,
            ShaderStage::Geometry => ShaderStages::GEOMETRY,
            ShaderStage::Fragment => ShaderStages::FRAGMENT,
            ShaderStage::Compute => ShaderStages::COMPUTE,
        }
    }
}

bitflags! {
    /// Set of shader stages.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ShaderStages: u32 {
        const VERTEX = 1 << 0;
        const TESSELATION_CONTROL = 1 << 1;
        const TESSELATION_EVAL = 1 << 2;
        const GEOMETRY = 1 << 3;
        const FRAGMENT = 1 << 4;
        const COMPUTE = 1 << 5;
        const ALL_GRAPHICS = Self::VERTEX.bits()
            | Self::TESSELATION_CONTROL.bits()
            | Self::TESSELATION_EVAL.bits()
            | Self::GEOMETRY.bits()
            | Self::FRAGMENT.bits();
    }
}

bitflags! {
    /// Usage flags for buffers.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct BufferUsage: u32 {
        const VERTEX = 1 << 0;
        const INDEX = 1 << 1;
        const UNIFORM = 1 << 2;
        const STORAGE = 1 << 3;
        const TRANSFER_SRC = 1 << 4;
        const TRANSFER_DST = 1 << 5;
    }
}

bitflags! {
    /// Usage flags for images. Render graph edges carry these.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ImageUsage: u32 {
        const TRANSFER_SRC = 1 << 0;
        const TRANSFER_DST = 1 << 1;
        const SAMPLED = 1 << 2;
        const STORAGE = 1 << 3;
        const COLOUR_ATTACHMENT = 1 << 4;
        const DEPTH_STENCIL_ATTACHMENT = 1 << 5;
        const INPUT_ATTACHMENT = 1 << 6;
    }
}

/// Where a buffer's memory lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryLocation {
    /// Host visible, persistently mapped.
    CpuToGpu,
    /// Device local, written through a staging copy.
    GpuOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DescriptorType {
    UniformBuffer,
    UniformBufferDynamic,
    StorageBuffer,
    CombinedImageSampler,
    StorageImage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum IndexType {
    U16,
    #[default]
    U32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum VertexInputRate {
    #[default]
    Vertex,
    Instance,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipelineBindPoint {
    Graphics,
    Compute,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Filter {
    Nearest,
    #[default]
    Linear,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SamplerAddressMode {
    #[default]
    Repeat,
    MirroredRepeat,
    ClampToEdge,
    ClampToBorder,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ImageViewType {
    #[default]
    Type2d,
    Type2dArray,
    Cube,
}

/// Buffer creation parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferDesc {
    pub size: u64,
    pub usage: BufferUsage,
    pub memory: MemoryLocation,
}

/// Image creation parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageDesc {
    pub format: Format,
    pub width: u32,
    pub height: u32,
    pub mip_levels: u32,
    /// Faces times array layers.
    pub array_layers: u32,
    pub samples: u32,
    pub usage: ImageUsage,
    pub cube_compatible: bool,
}

/// Image view creation parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageViewDesc {
    pub image: GpuImage,
    pub format: Format,
    pub view_type: ImageViewType,
    pub base_mip_level: u32,
    pub mip_levels: u32,
    pub base_array_layer: u32,
    pub array_layers: u32,
}

/// Sampler parameters. Float fields are stored as bit patterns so the
/// descriptor can be used as a hash key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SamplerDesc {
    pub mag_filter: Filter,
    pub min_filter: Filter,
    pub address_u: SamplerAddressMode,
    pub address_v: SamplerAddressMode,
    pub address_w: SamplerAddressMode,
    pub anisotropy_bits: u32,
    pub compare: Option<CompareOp>,
    pub mip_levels: u32,
}

impl SamplerDesc {
    pub fn anisotropy(&self) -> f32 {
        f32::from_bits(self.anisotropy_bits)
    }

    pub fn with_anisotropy(mut self, value: f32) -> Self {
        self.anisotropy_bits = value.to_bits();
        self
    }

    pub fn with_address_mode(mut self, mode: SamplerAddressMode) -> Self {
        self.address_u = mode;
        self.address_v = mode;
        self.address_w = mode;
        self
    }

    pub fn with_filter(mut self, filter: Filter) -> Self {
        self.mag_filter = filter;
        self.min_filter = filter;
        self
    }
}

impl Default for SamplerDesc {
    fn default() -> Self {
        Self {
            mag_filter: Filter::Linear,
            min_filter: Filter::Linear,
            address_u: SamplerAddressMode::Repeat,
            address_v: SamplerAddressMode::Repeat,
            address_w: SamplerAddressMode::Repeat,
            anisotropy_bits: 1.0f32.to_bits(),
            compare: None,
            mip_levels: 1,
        }
    }
}

/// One binding in a descriptor set layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DescriptorBinding {
    pub binding: u32,
    pub ty: DescriptorType,
    pub count: u32,
    pub stages: ShaderStages,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PushConstantRange {
    pub stages: ShaderStages,
    pub offset: u32,
    pub size: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorPoolSize {
    pub ty: DescriptorType,
    pub count: u32,
}

/// Payload of a single descriptor write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptorResource {
    Buffer {
        buffer: GpuBuffer,
        offset: u64,
        range: u64,
    },
    Image {
        view: GpuImageView,
        layout: ImageLayout,
        sampler: GpuSampler,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorWrite {
    pub set: GpuDescriptorSet,
    pub binding: u32,
    pub ty: DescriptorType,
    pub resource: DescriptorResource,
}

/// Vertex attribute slot. A `Format::Undefined` attribute is unused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct VertexAttribute {
    pub location: u32,
    pub binding: u32,
    pub format: Format,
    pub offset: u32,
}

/// Vertex buffer binding slot. A zero stride binding is unused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct VertexBinding {
    pub binding: u32,
    pub stride: u32,
    pub input_rate: VertexInputRate,
}

/// One attachment of a render pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttachmentDesc {
    pub format: Format,
    pub samples: u32,
    pub load_op: LoadOp,
    pub store_op: StoreOp,
    pub stencil_load_op: LoadOp,
    pub stencil_store_op: StoreOp,
    pub initial_layout: ImageLayout,
    pub final_layout: ImageLayout,
}

/// External subpass dependency flavour of a single-subpass render pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DependencyType {
    ColourPass,
    DepthStencilPass,
    SurfaceKhr,
}

/// Render pass creation parameters. Colour attachments come first; a depth
/// attachment, if any, is last.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderPassDesc {
    pub attachments: Vec<AttachmentDesc>,
    pub colour_count: u32,
    pub has_depth: bool,
    pub dependency: DependencyType,
    pub multi_view: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FramebufferDesc {
    pub render_pass: GpuRenderPass,
    pub attachments: Vec<GpuImageView>,
    pub width: u32,
    pub height: u32,
    pub layers: u32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ClearValue {
    Colour([f32; 4]),
    DepthStencil { depth: f32, stencil: u32 },
}

#[derive(Debug, Clone, PartialEq)]
pub struct RenderPassBegin {
    pub render_pass: GpuRenderPass,
    pub framebuffer: GpuFramebuffer,
    pub width: u32,
    pub height: u32,
    pub clear_values: Vec<ClearValue>,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Viewport {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub min_depth: f32,
    pub max_depth: f32,
}

impl Viewport {
    pub fn from_extent(width: u32, height: u32) -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            width: width as f32,
            height: height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        }
    }

    pub fn is_set(&self) -> bool {
        self.width > 0.0 && self.height > 0.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Rect2D {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl Rect2D {
    pub fn from_extent(width: u32, height: u32) -> Self {
        Self {
            x: 0,
            y: 0,
            width,
            height,
        }
    }

    pub fn is_set(&self) -> bool {
        self.width > 0 && self.height > 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferCopy {
    pub src_offset: u64,
    pub dst_offset: u64,
    pub size: u64,
}

/// Copy of tightly packed texel data into one mip level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferImageCopy {
    pub buffer_offset: u64,
    pub mip_level: u32,
    pub base_array_layer: u32,
    pub layer_count: u32,
    pub width: u32,
    pub height: u32,
}

/// Layout transition of an image subresource range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageBarrier {
    pub image: GpuImage,
    pub format: Format,
    pub old_layout: ImageLayout,
    pub new_layout: ImageLayout,
    pub base_mip_level: u32,
    pub mip_levels: u32,
    pub base_array_layer: u32,
    pub array_layers: u32,
}

/// Makes a transfer write to `buffer` visible to the stages that consume
/// buffers of `dst_usage`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferBarrier {
    pub buffer: GpuBuffer,
    pub dst_usage: BufferUsage,
}

/// A queue submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitInfo {
    pub cmd: GpuCommandBuffer,
    pub wait_semaphores: Vec<GpuSemaphore>,
    pub signal_semaphores: Vec<GpuSemaphore>,
    pub fence: GpuFence,
}

/// Outcome of acquiring the next swapchain image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireResult {
    Acquired(u32),
    /// Out of date or suboptimal; the caller must recreate the swapchain.
    Stale,
}

/// A presentable swapchain known to the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Swapchain {
    pub handle: GpuSwapchain,
    pub format: Format,
    pub width: u32,
    pub height: u32,
    pub images: Vec<GpuImage>,
    pub image_views: Vec<GpuImageView>,
}

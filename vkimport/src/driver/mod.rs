// The native entry points vkimport drives
//
// Everything that touches a VkDevice goes through the `Driver` trait.
// The descriptors here are plain Rust structs describing what to create,
// the implementation is responsible for turning them into the right
// pNext chains.
//
// Austin Shafer - 2021
use ash::prelude::VkResult;
use ash::vk;

use std::os::fd::{BorrowedFd, OwnedFd};

mod native;
pub use native::NativeDriver;

/// Explicit DRM modifier layout for a dmabuf backed image
///
/// When this is attached to an `ImageDesc` the image is created with
/// DRM_FORMAT_MODIFIER_EXT tiling, external memory info for the
/// dmabuf handle type, and the explicit modifier info listing one
/// subresource layout per plane.
#[derive(Debug, Clone)]
pub struct DrmModifierLayout {
    pub modifier: u64,
    pub planes: Vec<vk::SubresourceLayout>,
}

/// Describes a 2D single mip, single layer image
#[derive(Debug, Clone)]
pub struct ImageDesc {
    pub format: vk::Format,
    pub extent: vk::Extent2D,
    pub usage: vk::ImageUsageFlags,
    /// Foreign memory layout. None means a normal OPTIMAL tiled image.
    pub dmabuf: Option<DrmModifierLayout>,
}

/// Describes one device memory allocation
///
/// Chaining order for the implementation is import info first,
/// then dedicated info.
#[derive(Debug)]
pub struct AllocationDesc {
    pub size: vk::DeviceSize,
    pub memory_type_index: u32,
    /// Import this dmabuf as the backing memory. The driver takes
    /// ownership: on success the fd belongs to the Vulkan
    /// implementation, on failure it is closed when dropped.
    pub import_fd: Option<OwnedFd>,
    /// Make this a dedicated allocation for this image
    pub dedicated_image: Option<vk::Image>,
}

/// What VkMemoryDedicatedRequirements reported for an image
#[derive(Debug, Default, Copy, Clone, PartialEq)]
pub struct DedicatedRequirements {
    pub prefers: bool,
    pub requires: bool,
}

impl DedicatedRequirements {
    pub fn wants_dedicated(&self) -> bool {
        self.prefers || self.requires
    }
}

#[derive(Debug, Copy, Clone, PartialEq)]
pub struct SamplerDesc {
    pub filter: vk::Filter,
    pub address_mode: vk::SamplerAddressMode,
    pub border_color: vk::BorderColor,
    pub mipmap_mode: vk::SamplerMipmapMode,
}

impl Default for SamplerDesc {
    /// Linear filtering with edges clamped, the way raster surfaces
    /// have always been sampled
    fn default() -> Self {
        Self {
            filter: vk::Filter::LINEAR,
            address_mode: vk::SamplerAddressMode::CLAMP_TO_EDGE,
            border_color: vk::BorderColor::INT_OPAQUE_BLACK,
            mipmap_mode: vk::SamplerMipmapMode::LINEAR,
        }
    }
}

/// The device level Vulkan calls used by this crate
///
/// One implementation wraps an `ash::Device`. Tests use a recording
/// double so that call order and handle lifetimes can be checked
/// without a GPU.
///
/// All methods are called from the render thread.
pub trait Driver {
    fn memory_properties(&self) -> vk::PhysicalDeviceMemoryProperties;

    /// vkGetPhysicalDeviceFormatProperties2 with a
    /// VkDrmFormatModifierPropertiesListEXT chained.
    ///
    /// With `out` set to None only the count is queried. With a slice the
    /// properties are written into it. Returns the count the driver
    /// reported. Use `query_drm_format_modifiers` instead of calling this
    /// directly.
    fn drm_format_modifier_properties(
        &self,
        format: vk::Format,
        out: Option<&mut [vk::DrmFormatModifierPropertiesEXT]>,
    ) -> u32;

    /// Memory types the dmabuf behind `fd` can be imported into
    fn memory_fd_type_bits(&self, fd: BorrowedFd<'_>) -> VkResult<u32>;

    // -------------------- images --------------------
    fn create_image(&self, desc: &ImageDesc) -> VkResult<vk::Image>;
    fn destroy_image(&self, image: vk::Image);
    fn image_memory_requirements(&self, image: vk::Image) -> vk::MemoryRequirements;
    /// Uses vkGetImageMemoryRequirements2 to ask about dedicated allocations
    fn image_dedicated_requirements(&self, image: vk::Image) -> DedicatedRequirements;
    fn bind_image_memory(&self, image: vk::Image, memory: vk::DeviceMemory) -> VkResult<()>;
    fn create_image_view(&self, image: vk::Image, format: vk::Format) -> VkResult<vk::ImageView>;
    fn destroy_image_view(&self, view: vk::ImageView);
    fn create_sampler(&self, desc: &SamplerDesc) -> VkResult<vk::Sampler>;
    fn destroy_sampler(&self, sampler: vk::Sampler);

    // -------------------- buffers and memory --------------------
    fn create_buffer(
        &self,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
    ) -> VkResult<vk::Buffer>;
    fn destroy_buffer(&self, buffer: vk::Buffer);
    fn buffer_memory_requirements(&self, buffer: vk::Buffer) -> vk::MemoryRequirements;
    fn bind_buffer_memory(&self, buffer: vk::Buffer, memory: vk::DeviceMemory) -> VkResult<()>;
    fn allocate_memory(&self, desc: AllocationDesc) -> VkResult<vk::DeviceMemory>;
    fn free_memory(&self, memory: vk::DeviceMemory);
    /// Map `size` bytes from the start of `memory`
    fn map_memory(&self, memory: vk::DeviceMemory, size: vk::DeviceSize) -> VkResult<*mut u8>;
    fn unmap_memory(&self, memory: vk::DeviceMemory);
    /// Flush the whole mapped range of `memory`
    fn flush_memory(&self, memory: vk::DeviceMemory) -> VkResult<()>;

    // -------------------- commands --------------------
    fn create_command_pool(&self, queue_family: u32) -> VkResult<vk::CommandPool>;
    fn destroy_command_pool(&self, pool: vk::CommandPool);
    fn allocate_command_buffer(&self, pool: vk::CommandPool) -> VkResult<vk::CommandBuffer>;
    fn free_command_buffer(&self, pool: vk::CommandPool, cbuf: vk::CommandBuffer);
    /// Begin recording with the ONE_TIME_SUBMIT hint
    fn begin_command_buffer(&self, cbuf: vk::CommandBuffer) -> VkResult<()>;
    fn end_command_buffer(&self, cbuf: vk::CommandBuffer) -> VkResult<()>;
    /// Submit to the graphics queue. `fence` may be null.
    fn queue_submit(&self, cbuf: vk::CommandBuffer, fence: vk::Fence) -> VkResult<()>;
    fn queue_wait_idle(&self) -> VkResult<()>;
    fn device_wait_idle(&self) -> VkResult<()>;

    fn cmd_pipeline_barrier(
        &self,
        cbuf: vk::CommandBuffer,
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
        barrier: &vk::ImageMemoryBarrier,
    );
    fn cmd_copy_buffer_to_image(
        &self,
        cbuf: vk::CommandBuffer,
        buffer: vk::Buffer,
        image: vk::Image,
        layout: vk::ImageLayout,
        region: &vk::BufferImageCopy,
    );
    fn cmd_blit_image(
        &self,
        cbuf: vk::CommandBuffer,
        src: vk::Image,
        src_layout: vk::ImageLayout,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        region: &vk::ImageBlit,
        filter: vk::Filter,
    );

    // -------------------- descriptors --------------------
    fn create_descriptor_pool(
        &self,
        max_sets: u32,
        sizes: &[vk::DescriptorPoolSize],
    ) -> VkResult<vk::DescriptorPool>;
    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool);
    fn allocate_descriptor_set(
        &self,
        pool: vk::DescriptorPool,
        layout: vk::DescriptorSetLayout,
    ) -> VkResult<vk::DescriptorSet>;
    fn reset_descriptor_pool(&self, pool: vk::DescriptorPool) -> VkResult<()>;

    // -------------------- fences --------------------
    /// `exportable` chains VkExportFenceCreateInfo for SYNC_FD handles
    fn create_fence(&self, exportable: bool) -> VkResult<vk::Fence>;
    fn destroy_fence(&self, fence: vk::Fence);
    fn reset_fence(&self, fence: vk::Fence) -> VkResult<()>;
    fn wait_for_fence(&self, fence: vk::Fence) -> VkResult<()>;
    /// Export a SYNC_FD payload. None means the fence had already
    /// signaled and there is nothing to wait on.
    fn export_fence_fd(&self, fence: vk::Fence) -> VkResult<Option<OwnedFd>>;
}

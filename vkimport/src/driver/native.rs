// Driver implementation on top of ash
//
// This is the only place that builds Vulkan create infos and chains
// extension structs together.
//
// Austin Shafer - 2021
use ash::extensions::khr;
use ash::prelude::VkResult;
use ash::vk;

use super::{AllocationDesc, DedicatedRequirements, Driver, ImageDesc, SamplerDesc};
use crate::image::color_subresource_range;
use crate::instance::Instance;
use crate::platform::DeviceCapabilities;
use utils::log;

use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, IntoRawFd, OwnedFd};
use std::rc::Rc;

/// A logical Vulkan device and the queue we submit to
///
/// This owns the `ash::Device` and destroys it when dropped. The
/// instance is reference counted so that it is always destroyed after
/// the device.
pub struct NativeDriver {
    nd_inst: Rc<Instance>,
    nd_pdev: vk::PhysicalDevice,
    pub(crate) nd_dev: ash::Device,
    nd_queue: vk::Queue,
    nd_mem_props: vk::PhysicalDeviceMemoryProperties,
    /// Only loaded when dmabuf import was negotiated
    nd_ext_mem_fd: Option<khr::ExternalMemoryFd>,
    /// Only loaded when fence export was negotiated
    nd_ext_fence_fd: Option<khr::ExternalFenceFd>,
}

impl NativeDriver {
    pub(crate) fn new(
        inst: Rc<Instance>,
        pdev: vk::PhysicalDevice,
        dev: ash::Device,
        queue_family: u32,
        caps: DeviceCapabilities,
    ) -> Self {
        let queue = unsafe { dev.get_device_queue(queue_family, 0) };
        let mem_props = unsafe { inst.inst.get_physical_device_memory_properties(pdev) };

        let ext_mem_fd = match caps.contains(DeviceCapabilities::EXTERNAL_MEMORY_FD) {
            true => Some(khr::ExternalMemoryFd::new(&inst.inst, &dev)),
            false => None,
        };
        let ext_fence_fd = match caps.supports_external_fence_fd() {
            true => Some(khr::ExternalFenceFd::new(&inst.inst, &dev)),
            false => None,
        };

        Self {
            nd_inst: inst,
            nd_pdev: pdev,
            nd_dev: dev,
            nd_queue: queue,
            nd_mem_props: mem_props,
            nd_ext_mem_fd: ext_mem_fd,
            nd_ext_fence_fd: ext_fence_fd,
        }
    }
}

impl Driver for NativeDriver {
    fn memory_properties(&self) -> vk::PhysicalDeviceMemoryProperties {
        self.nd_mem_props
    }

    fn drm_format_modifier_properties(
        &self,
        format: vk::Format,
        out: Option<&mut [vk::DrmFormatModifierPropertiesEXT]>,
    ) -> u32 {
        let mut list = vk::DrmFormatModifierPropertiesListEXT::default();
        if let Some(props) = out {
            list.drm_format_modifier_count = props.len() as u32;
            list.p_drm_format_modifier_properties = props.as_mut_ptr();
        }

        {
            let mut format_props = vk::FormatProperties2::builder().push_next(&mut list);
            unsafe {
                self.nd_inst.inst.get_physical_device_format_properties2(
                    self.nd_pdev,
                    format,
                    &mut format_props,
                );
            }
        }

        list.drm_format_modifier_count
    }

    fn memory_fd_type_bits(&self, fd: BorrowedFd<'_>) -> VkResult<u32> {
        let loader = self
            .nd_ext_mem_fd
            .as_ref()
            .ok_or(vk::Result::ERROR_EXTENSION_NOT_PRESENT)?;

        let props = unsafe {
            loader.get_memory_fd_properties(
                vk::ExternalMemoryHandleTypeFlags::DMA_BUF_EXT,
                fd.as_raw_fd(),
            )?
        };
        // bitmask set for each supported memory type
        Ok(props.memory_type_bits)
    }

    fn create_image(&self, desc: &ImageDesc) -> VkResult<vk::Image> {
        let tiling = match desc.dmabuf {
            Some(_) => vk::ImageTiling::DRM_FORMAT_MODIFIER_EXT,
            None => vk::ImageTiling::OPTIMAL,
        };
        let (modifier, layouts) = match desc.dmabuf.as_ref() {
            Some(d) => (d.modifier, d.planes.as_slice()),
            None => (0, [].as_slice()),
        };

        let mut drm_create_info = vk::ImageDrmFormatModifierExplicitCreateInfoEXT::builder()
            .drm_format_modifier(modifier)
            .plane_layouts(layouts)
            .build();
        let mut ext_mem_info = vk::ExternalMemoryImageCreateInfo::builder()
            .handle_types(vk::ExternalMemoryHandleTypeFlags::DMA_BUF_EXT)
            .build();

        let extent = vk::Extent3D {
            width: desc.extent.width,
            height: desc.extent.height,
            depth: 1,
        };
        let mut image_info = vk::ImageCreateInfo::builder()
            .image_type(vk::ImageType::TYPE_2D)
            .format(desc.format)
            .extent(extent)
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(tiling)
            .usage(desc.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .flags(vk::ImageCreateFlags::empty());

        // image -> external memory -> explicit modifier
        if desc.dmabuf.is_some() {
            image_info = image_info
                .push_next(&mut drm_create_info)
                .push_next(&mut ext_mem_info);
        }

        unsafe { self.nd_dev.create_image(&image_info, None) }
    }

    fn destroy_image(&self, image: vk::Image) {
        unsafe { self.nd_dev.destroy_image(image, None) }
    }

    fn image_memory_requirements(&self, image: vk::Image) -> vk::MemoryRequirements {
        unsafe { self.nd_dev.get_image_memory_requirements(image) }
    }

    fn image_dedicated_requirements(&self, image: vk::Image) -> DedicatedRequirements {
        let mut dedicated = vk::MemoryDedicatedRequirements::default();
        {
            let info = vk::ImageMemoryRequirementsInfo2::builder().image(image);
            let mut reqs = vk::MemoryRequirements2::builder().push_next(&mut dedicated);
            unsafe {
                self.nd_dev
                    .get_image_memory_requirements2(&info, &mut reqs);
            }
        }

        DedicatedRequirements {
            prefers: dedicated.prefers_dedicated_allocation == vk::TRUE,
            requires: dedicated.requires_dedicated_allocation == vk::TRUE,
        }
    }

    fn bind_image_memory(&self, image: vk::Image, memory: vk::DeviceMemory) -> VkResult<()> {
        unsafe { self.nd_dev.bind_image_memory(image, memory, 0) }
    }

    fn create_image_view(&self, image: vk::Image, format: vk::Format) -> VkResult<vk::ImageView> {
        let view_info = vk::ImageViewCreateInfo::builder()
            .subresource_range(color_subresource_range())
            .image(image)
            .format(format)
            .view_type(vk::ImageViewType::TYPE_2D);

        unsafe { self.nd_dev.create_image_view(&view_info, None) }
    }

    fn destroy_image_view(&self, view: vk::ImageView) {
        unsafe { self.nd_dev.destroy_image_view(view, None) }
    }

    fn create_sampler(&self, desc: &SamplerDesc) -> VkResult<vk::Sampler> {
        let info = vk::SamplerCreateInfo::builder()
            .mag_filter(desc.filter)
            .min_filter(desc.filter)
            .address_mode_u(desc.address_mode)
            .address_mode_v(desc.address_mode)
            .address_mode_w(desc.address_mode)
            .anisotropy_enable(false)
            .max_anisotropy(1.0)
            .border_color(desc.border_color)
            .unnormalized_coordinates(false)
            .compare_enable(false)
            .compare_op(vk::CompareOp::ALWAYS)
            .mipmap_mode(desc.mipmap_mode)
            .mip_lod_bias(0.0)
            .min_lod(0.0)
            .max_lod(0.0);

        unsafe { self.nd_dev.create_sampler(&info, None) }
    }

    fn destroy_sampler(&self, sampler: vk::Sampler) {
        unsafe { self.nd_dev.destroy_sampler(sampler, None) }
    }

    fn create_buffer(
        &self,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
    ) -> VkResult<vk::Buffer> {
        let create_info = vk::BufferCreateInfo::builder()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        unsafe { self.nd_dev.create_buffer(&create_info, None) }
    }

    fn destroy_buffer(&self, buffer: vk::Buffer) {
        unsafe { self.nd_dev.destroy_buffer(buffer, None) }
    }

    fn buffer_memory_requirements(&self, buffer: vk::Buffer) -> vk::MemoryRequirements {
        unsafe { self.nd_dev.get_buffer_memory_requirements(buffer) }
    }

    fn bind_buffer_memory(&self, buffer: vk::Buffer, memory: vk::DeviceMemory) -> VkResult<()> {
        unsafe { self.nd_dev.bind_buffer_memory(buffer, memory, 0) }
    }

    fn allocate_memory(&self, desc: AllocationDesc) -> VkResult<vk::DeviceMemory> {
        let raw_fd = desc.import_fd.as_ref().map(|fd| fd.as_raw_fd());

        let mut import_fd_info = vk::ImportMemoryFdInfoKHR::builder()
            .handle_type(vk::ExternalMemoryHandleTypeFlags::DMA_BUF_EXT)
            .fd(raw_fd.unwrap_or(-1))
            .build();
        let mut dedicated_alloc_info = vk::MemoryDedicatedAllocateInfo::builder()
            .image(desc.dedicated_image.unwrap_or(vk::Image::null()))
            .build();

        let mut alloc_info = vk::MemoryAllocateInfo::builder()
            .allocation_size(desc.size)
            .memory_type_index(desc.memory_type_index);
        // allocate -> import fd -> dedicated
        if desc.dedicated_image.is_some() {
            alloc_info = alloc_info.push_next(&mut dedicated_alloc_info);
        }
        if raw_fd.is_some() {
            alloc_info = alloc_info.push_next(&mut import_fd_info);
        }

        // If this fails the fd is still ours and gets closed when
        // desc goes out of scope
        let memory = unsafe { self.nd_dev.allocate_memory(&alloc_info, None)? };

        // A successful import hands the fd to the implementation
        if let Some(fd) = desc.import_fd {
            let _ = fd.into_raw_fd();
        }
        Ok(memory)
    }

    fn free_memory(&self, memory: vk::DeviceMemory) {
        unsafe { self.nd_dev.free_memory(memory, None) }
    }

    fn map_memory(&self, memory: vk::DeviceMemory, size: vk::DeviceSize) -> VkResult<*mut u8> {
        let ptr = unsafe {
            self.nd_dev
                .map_memory(memory, 0, size, vk::MemoryMapFlags::empty())?
        };
        Ok(ptr as *mut u8)
    }

    fn unmap_memory(&self, memory: vk::DeviceMemory) {
        unsafe { self.nd_dev.unmap_memory(memory) }
    }

    fn flush_memory(&self, memory: vk::DeviceMemory) -> VkResult<()> {
        let range = vk::MappedMemoryRange::builder()
            .memory(memory)
            .offset(0)
            .size(vk::WHOLE_SIZE)
            .build();

        unsafe { self.nd_dev.flush_mapped_memory_ranges(&[range]) }
    }

    fn create_command_pool(&self, queue_family: u32) -> VkResult<vk::CommandPool> {
        let pool_create_info = vk::CommandPoolCreateInfo::builder()
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
            .queue_family_index(queue_family);

        unsafe { self.nd_dev.create_command_pool(&pool_create_info, None) }
    }

    fn destroy_command_pool(&self, pool: vk::CommandPool) {
        unsafe { self.nd_dev.destroy_command_pool(pool, None) }
    }

    fn allocate_command_buffer(&self, pool: vk::CommandPool) -> VkResult<vk::CommandBuffer> {
        let info = vk::CommandBufferAllocateInfo::builder()
            .command_buffer_count(1)
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY);

        let cbufs = unsafe { self.nd_dev.allocate_command_buffers(&info)? };
        cbufs
            .into_iter()
            .next()
            .ok_or(vk::Result::ERROR_UNKNOWN)
    }

    fn free_command_buffer(&self, pool: vk::CommandPool, cbuf: vk::CommandBuffer) {
        unsafe { self.nd_dev.free_command_buffers(pool, &[cbuf]) }
    }

    fn begin_command_buffer(&self, cbuf: vk::CommandBuffer) -> VkResult<()> {
        let record_info = vk::CommandBufferBeginInfo::builder()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);

        unsafe { self.nd_dev.begin_command_buffer(cbuf, &record_info) }
    }

    fn end_command_buffer(&self, cbuf: vk::CommandBuffer) -> VkResult<()> {
        unsafe { self.nd_dev.end_command_buffer(cbuf) }
    }

    fn queue_submit(&self, cbuf: vk::CommandBuffer, fence: vk::Fence) -> VkResult<()> {
        let cbufs = [cbuf];
        let submit_info = vk::SubmitInfo::builder().command_buffers(&cbufs).build();

        unsafe { self.nd_dev.queue_submit(self.nd_queue, &[submit_info], fence) }
    }

    fn queue_wait_idle(&self) -> VkResult<()> {
        unsafe { self.nd_dev.queue_wait_idle(self.nd_queue) }
    }

    fn device_wait_idle(&self) -> VkResult<()> {
        unsafe { self.nd_dev.device_wait_idle() }
    }

    fn cmd_pipeline_barrier(
        &self,
        cbuf: vk::CommandBuffer,
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
        barrier: &vk::ImageMemoryBarrier,
    ) {
        unsafe {
            self.nd_dev.cmd_pipeline_barrier(
                cbuf,
                src_stage,
                dst_stage,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                std::slice::from_ref(barrier),
            )
        }
    }

    fn cmd_copy_buffer_to_image(
        &self,
        cbuf: vk::CommandBuffer,
        buffer: vk::Buffer,
        image: vk::Image,
        layout: vk::ImageLayout,
        region: &vk::BufferImageCopy,
    ) {
        unsafe {
            self.nd_dev.cmd_copy_buffer_to_image(
                cbuf,
                buffer,
                image,
                layout,
                std::slice::from_ref(region),
            )
        }
    }

    fn cmd_blit_image(
        &self,
        cbuf: vk::CommandBuffer,
        src: vk::Image,
        src_layout: vk::ImageLayout,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        region: &vk::ImageBlit,
        filter: vk::Filter,
    ) {
        unsafe {
            self.nd_dev.cmd_blit_image(
                cbuf,
                src,
                src_layout,
                dst,
                dst_layout,
                std::slice::from_ref(region),
                filter,
            )
        }
    }

    fn create_descriptor_pool(
        &self,
        max_sets: u32,
        sizes: &[vk::DescriptorPoolSize],
    ) -> VkResult<vk::DescriptorPool> {
        let info = vk::DescriptorPoolCreateInfo::builder()
            .flags(vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET)
            .pool_sizes(sizes)
            .max_sets(max_sets);

        unsafe { self.nd_dev.create_descriptor_pool(&info, None) }
    }

    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool) {
        unsafe { self.nd_dev.destroy_descriptor_pool(pool, None) }
    }

    fn allocate_descriptor_set(
        &self,
        pool: vk::DescriptorPool,
        layout: vk::DescriptorSetLayout,
    ) -> VkResult<vk::DescriptorSet> {
        let layouts = [layout];
        let info = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(pool)
            .set_layouts(&layouts);

        let sets = unsafe { self.nd_dev.allocate_descriptor_sets(&info)? };
        sets.into_iter().next().ok_or(vk::Result::ERROR_UNKNOWN)
    }

    fn reset_descriptor_pool(&self, pool: vk::DescriptorPool) -> VkResult<()> {
        unsafe {
            self.nd_dev
                .reset_descriptor_pool(pool, vk::DescriptorPoolResetFlags::empty())
        }
    }

    fn create_fence(&self, exportable: bool) -> VkResult<vk::Fence> {
        let mut export_info = vk::ExportFenceCreateInfo::builder()
            .handle_types(vk::ExternalFenceHandleTypeFlags::SYNC_FD)
            .build();
        let mut info = vk::FenceCreateInfo::builder();
        if exportable {
            info = info.push_next(&mut export_info);
        }

        unsafe { self.nd_dev.create_fence(&info, None) }
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        unsafe { self.nd_dev.destroy_fence(fence, None) }
    }

    fn reset_fence(&self, fence: vk::Fence) -> VkResult<()> {
        unsafe { self.nd_dev.reset_fences(&[fence]) }
    }

    fn wait_for_fence(&self, fence: vk::Fence) -> VkResult<()> {
        unsafe { self.nd_dev.wait_for_fences(&[fence], true, u64::MAX) }
    }

    fn export_fence_fd(&self, fence: vk::Fence) -> VkResult<Option<OwnedFd>> {
        let loader = self
            .nd_ext_fence_fd
            .as_ref()
            .ok_or(vk::Result::ERROR_EXTENSION_NOT_PRESENT)?;

        let info = vk::FenceGetFdInfoKHR::builder()
            .fence(fence)
            .handle_type(vk::ExternalFenceHandleTypeFlags::SYNC_FD);
        let fd = unsafe { loader.get_fence_fd(&info)? };

        // -1 is how the driver tells us the fence already signaled
        if fd < 0 {
            return Ok(None);
        }
        Ok(Some(unsafe { OwnedFd::from_raw_fd(fd) }))
    }
}

impl Drop for NativeDriver {
    fn drop(&mut self) {
        unsafe {
            if let Err(e) = self.nd_dev.device_wait_idle() {
                log::error!(
                    "Could not idle the device before destroying it: {}",
                    crate::result::result_to_string(e)
                );
            }
            self.nd_dev.destroy_device(None);
        }
    }
}

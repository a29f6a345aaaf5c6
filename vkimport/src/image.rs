// Textures and their layout tracking
//
// Austin Shafer - 2020
use ash::vk;

use crate::device::Device;
use crate::driver::{AllocationDesc, Driver, ImageDesc, SamplerDesc};
use crate::result::{check, layout_to_string};
use crate::{Result, VkImportError};
use utils::log;

use std::rc::Rc;

/// The access mask that goes with an image being in `layout`
fn access_mask_for_layout(layout: vk::ImageLayout) -> vk::AccessFlags {
    match layout {
        vk::ImageLayout::TRANSFER_DST_OPTIMAL => vk::AccessFlags::TRANSFER_WRITE,
        vk::ImageLayout::TRANSFER_SRC_OPTIMAL => vk::AccessFlags::TRANSFER_READ,
        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL => vk::AccessFlags::SHADER_READ,
        vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL => {
            vk::AccessFlags::COLOR_ATTACHMENT_READ | vk::AccessFlags::COLOR_ATTACHMENT_WRITE
        }
        vk::ImageLayout::GENERAL => vk::AccessFlags::MEMORY_READ | vk::AccessFlags::MEMORY_WRITE,
        vk::ImageLayout::PRESENT_SRC_KHR => vk::AccessFlags::MEMORY_READ,
        _ => vk::AccessFlags::empty(),
    }
}

/// The pipeline stage that reads or writes an image in `layout`
fn stage_for_layout(layout: vk::ImageLayout) -> vk::PipelineStageFlags {
    match layout {
        vk::ImageLayout::UNDEFINED => vk::PipelineStageFlags::TOP_OF_PIPE,
        vk::ImageLayout::TRANSFER_DST_OPTIMAL | vk::ImageLayout::TRANSFER_SRC_OPTIMAL => {
            vk::PipelineStageFlags::TRANSFER
        }
        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL => vk::PipelineStageFlags::FRAGMENT_SHADER,
        vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL => {
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
        }
        vk::ImageLayout::PRESENT_SRC_KHR => vk::PipelineStageFlags::BOTTOM_OF_PIPE,
        _ => vk::PipelineStageFlags::ALL_COMMANDS,
    }
}

pub(crate) fn color_subresource_range() -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange::builder()
        .aspect_mask(vk::ImageAspectFlags::COLOR)
        .base_mip_level(0)
        .level_count(1)
        .base_array_layer(0)
        .layer_count(1)
        .build()
}

/// Handles created so far while building a texture
///
/// If building fails partway through, dropping this destroys whatever
/// was created in reverse order: sampler, view, memory, image. Once
/// everything is made `finish` moves the handles into a `Texture`.
pub(crate) struct TextureParts<'a> {
    tp_driver: &'a dyn Driver,
    pub image: vk::Image,
    pub memory: vk::DeviceMemory,
    pub view: vk::ImageView,
    pub sampler: vk::Sampler,
}

impl<'a> TextureParts<'a> {
    pub fn new(driver: &'a dyn Driver) -> Self {
        Self {
            tp_driver: driver,
            image: vk::Image::null(),
            memory: vk::DeviceMemory::null(),
            view: vk::ImageView::null(),
            sampler: vk::Sampler::null(),
        }
    }

    pub fn finish(
        mut self,
        dev: &Rc<Device>,
        extent: vk::Extent2D,
        format: vk::Format,
        is_dmabuf: bool,
    ) -> Texture {
        debug_assert!(self.image != vk::Image::null());
        debug_assert!(self.view != vk::ImageView::null());

        let ret = Texture {
            t_dev: dev.clone(),
            t_image: self.image,
            t_view: self.view,
            t_sampler: self.sampler,
            t_memory: self.memory,
            t_extent: extent,
            t_format: format,
            t_layout: vk::ImageLayout::UNDEFINED,
            t_is_dmabuf: is_dmabuf,
        };

        // The texture owns these now
        self.image = vk::Image::null();
        self.memory = vk::DeviceMemory::null();
        self.view = vk::ImageView::null();
        self.sampler = vk::Sampler::null();

        ret
    }
}

impl<'a> Drop for TextureParts<'a> {
    fn drop(&mut self) {
        if self.sampler != vk::Sampler::null() {
            self.tp_driver.destroy_sampler(self.sampler);
        }
        if self.view != vk::ImageView::null() {
            self.tp_driver.destroy_image_view(self.view);
        }
        if self.memory != vk::DeviceMemory::null() {
            self.tp_driver.free_memory(self.memory);
        }
        if self.image != vk::Image::null() {
            self.tp_driver.destroy_image(self.image);
        }
    }
}

/// A sampleable Vulkan image
///
/// This owns the image, its view and sampler, and the memory backing it.
/// For dmabuf textures the memory is the imported foreign allocation.
///
/// The layout we think the image is in is tracked here. The only way to
/// change it is `transition_layout`, which records the barrier and
/// updates the tracked layout together. Every later barrier is built
/// from this field, so it must never disagree with the real layout.
pub struct Texture {
    t_dev: Rc<Device>,
    t_image: vk::Image,
    t_view: vk::ImageView,
    t_sampler: vk::Sampler,
    /// May be null if the memory is not owned by this texture
    t_memory: vk::DeviceMemory,
    t_extent: vk::Extent2D,
    t_format: vk::Format,
    t_layout: vk::ImageLayout,
    t_is_dmabuf: bool,
}

impl Texture {
    /// Allocate a device local texture with OPTIMAL tiling
    ///
    /// The contents start out undefined.
    pub fn allocate(
        dev: &Rc<Device>,
        width: u32,
        height: u32,
        format: vk::Format,
        usage: vk::ImageUsageFlags,
    ) -> Result<Texture> {
        if width == 0 || height == 0 {
            return Err(VkImportError::INVALID);
        }
        let driver = dev.d_driver.as_ref();
        let extent = vk::Extent2D {
            width: width,
            height: height,
        };

        let mut parts = TextureParts::new(driver);
        parts.image = check(
            "vkCreateImage",
            driver.create_image(&ImageDesc {
                format: format,
                extent: extent,
                usage: usage,
                dmabuf: None,
            }),
        )?;

        let reqs = driver.image_memory_requirements(parts.image);
        let mem_type = Device::find_memory_type_index(
            &dev.d_mem_props,
            &reqs,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        )
        .ok_or_else(|| {
            log::error!(
                "No device local memory type for a {}x{} {:?} texture",
                width,
                height,
                format
            );
            VkImportError::NO_SUITABLE_MEMORY_TYPE
        })?;

        parts.memory = check(
            "vkAllocateMemory",
            driver.allocate_memory(AllocationDesc {
                size: reqs.size,
                memory_type_index: mem_type,
                import_fd: None,
                dedicated_image: None,
            }),
        )?;
        check(
            "vkBindImageMemory",
            driver.bind_image_memory(parts.image, parts.memory),
        )?;
        parts.view = check(
            "vkCreateImageView",
            driver.create_image_view(parts.image, format),
        )?;
        parts.sampler = check(
            "vkCreateSampler",
            driver.create_sampler(&SamplerDesc::default()),
        )?;

        log::debug!("Allocated {}x{} texture with format {:?}", width, height, format);
        Ok(parts.finish(dev, extent, format, false))
    }

    pub fn image(&self) -> vk::Image {
        self.t_image
    }

    pub fn view(&self) -> vk::ImageView {
        self.t_view
    }

    pub fn sampler(&self) -> vk::Sampler {
        self.t_sampler
    }

    pub fn memory(&self) -> vk::DeviceMemory {
        self.t_memory
    }

    pub fn width(&self) -> u32 {
        self.t_extent.width
    }

    pub fn height(&self) -> u32 {
        self.t_extent.height
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.t_extent
    }

    pub fn format(&self) -> vk::Format {
        self.t_format
    }

    pub fn current_layout(&self) -> vk::ImageLayout {
        self.t_layout
    }

    pub fn is_dmabuf(&self) -> bool {
        self.t_is_dmabuf
    }

    pub fn is_valid(&self) -> bool {
        self.t_image != vk::Image::null() && self.t_view != vk::ImageView::null()
    }

    pub fn device(&self) -> &Rc<Device> {
        &self.t_dev
    }

    /// Record a layout transition from the tracked layout to `new_layout`
    ///
    /// Access masks are derived from the two layouts. The tracked layout
    /// is updated as soon as the barrier is recorded.
    pub fn transition_layout(
        &mut self,
        cbuf: vk::CommandBuffer,
        new_layout: vk::ImageLayout,
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
    ) {
        debug_assert!(self.is_valid(), "transition on a released texture");
        debug_assert!(
            new_layout != vk::ImageLayout::UNDEFINED,
            "images can't be transitioned to UNDEFINED"
        );

        let old_layout = self.t_layout;
        let barrier = vk::ImageMemoryBarrier::builder()
            .image(self.t_image)
            .src_access_mask(access_mask_for_layout(old_layout))
            .dst_access_mask(access_mask_for_layout(new_layout))
            .old_layout(old_layout)
            .new_layout(new_layout)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .subresource_range(color_subresource_range())
            .build();

        self.t_dev
            .d_driver
            .cmd_pipeline_barrier(cbuf, src_stage, dst_stage, &barrier);

        log::trace!(
            "Texture {:?}: {} -> {}",
            self.t_image,
            layout_to_string(old_layout),
            layout_to_string(new_layout)
        );
        self.t_layout = new_layout;
    }

    /// Put the tracked layout back to `layout`
    ///
    /// For when the barriers recorded since `layout` was read never
    /// reached the GPU, i.e. their submission failed.
    pub(crate) fn restore_layout(&mut self, layout: vk::ImageLayout) {
        if self.t_layout != layout {
            log::debug!(
                "Texture {:?}: rolling back {} -> {}",
                self.t_image,
                layout_to_string(self.t_layout),
                layout_to_string(layout)
            );
        }
        self.t_layout = layout;
    }

    /// `transition_layout` with stages picked from the layouts
    pub fn transition_to(&mut self, cbuf: vk::CommandBuffer, new_layout: vk::ImageLayout) {
        let src_stage = stage_for_layout(self.t_layout);
        let dst_stage = stage_for_layout(new_layout);
        self.transition_layout(cbuf, new_layout, src_stage, dst_stage);
    }

    /// Record a barrier over the whole image that keeps its layout
    pub fn memory_barrier(
        &self,
        cbuf: vk::CommandBuffer,
        src_access: vk::AccessFlags,
        dst_access: vk::AccessFlags,
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
    ) {
        debug_assert!(self.is_valid(), "barrier on a released texture");

        let barrier = vk::ImageMemoryBarrier::builder()
            .image(self.t_image)
            .src_access_mask(src_access)
            .dst_access_mask(dst_access)
            .old_layout(self.t_layout)
            .new_layout(self.t_layout)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .subresource_range(color_subresource_range())
            .build();

        self.t_dev
            .d_driver
            .cmd_pipeline_barrier(cbuf, src_stage, dst_stage, &barrier);
    }
}

impl Drop for Texture {
    fn drop(&mut self) {
        if self.t_image == vk::Image::null() {
            return;
        }
        log::debug!("Destroying texture {:?}", self.t_image);

        let driver = self.t_dev.d_driver.as_ref();
        // dependents first, then the memory, then the image itself
        if self.t_sampler != vk::Sampler::null() {
            driver.destroy_sampler(self.t_sampler);
        }
        if self.t_view != vk::ImageView::null() {
            driver.destroy_image_view(self.t_view);
        }
        if self.t_memory != vk::DeviceMemory::null() {
            driver.free_memory(self.t_memory);
        }
        driver.destroy_image(self.t_image);

        self.t_sampler = vk::Sampler::null();
        self.t_view = vk::ImageView::null();
        self.t_memory = vk::DeviceMemory::null();
        self.t_image = vk::Image::null();
    }
}

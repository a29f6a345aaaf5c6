// The per-device context
//
// Austin Shafer - 2020
use ash::vk;

use crate::descpool::DescriptorAllocator;
use crate::driver::Driver;
use crate::framebuffer::FramebufferStack;
use crate::platform::DeviceCapabilities;
use crate::result::check;
use crate::{CreateInfo, Result, VkImportError};
use utils::log;

use std::cell::RefCell;
use std::os::fd::OwnedFd;
use std::rc::Rc;

/// Render thread state that changes after creation
struct DeviceInternal {
    /// Pool the single time command buffers come from
    cmd_pool: vk::CommandPool,
    descpool: DescriptorAllocator,
    fb_stack: FramebufferStack,
    /// Reused by `end_single_time_commands_fenced`, made on first use
    submit_fence: vk::Fence,
}

/// A Vulkan device context
///
/// This owns the command pool, the descriptor pool and the framebuffer
/// stack for one logical device. Textures hold an `Rc` to the device
/// that made them so it is never destroyed out from under them.
///
/// None of this is thread safe, it all belongs to the render thread.
pub struct Device {
    pub(crate) d_driver: Box<dyn Driver>,
    pub(crate) d_caps: DeviceCapabilities,
    pub(crate) d_mem_props: vk::PhysicalDeviceMemoryProperties,
    d_queue_family: u32,
    pub(crate) d_stride_alignment: u32,
    d_internal: RefCell<DeviceInternal>,
}

impl Device {
    /// Wrap a driver in a new device context
    ///
    /// This creates the command pool on `queue_family` and the
    /// descriptor pool sized by `info`.
    pub fn new(
        driver: Box<dyn Driver>,
        caps: DeviceCapabilities,
        queue_family: u32,
        info: &CreateInfo,
    ) -> Result<Rc<Self>> {
        let cmd_pool = check(
            "vkCreateCommandPool",
            driver.create_command_pool(queue_family),
        )?;
        let descpool = match DescriptorAllocator::new(
            driver.as_ref(),
            info.descriptor_max_sets,
            info.descriptor_reset_threshold,
        ) {
            Ok(d) => d,
            Err(e) => {
                driver.destroy_command_pool(cmd_pool);
                return Err(e);
            }
        };
        let mem_props = driver.memory_properties();

        Ok(Rc::new(Self {
            d_driver: driver,
            d_caps: caps,
            d_mem_props: mem_props,
            d_queue_family: queue_family,
            d_stride_alignment: info.stride_alignment,
            d_internal: RefCell::new(DeviceInternal {
                cmd_pool: cmd_pool,
                descpool: descpool,
                fb_stack: FramebufferStack::new(),
                submit_fence: vk::Fence::null(),
            }),
        }))
    }

    pub fn driver(&self) -> &dyn Driver {
        self.d_driver.as_ref()
    }

    pub fn capabilities(&self) -> DeviceCapabilities {
        self.d_caps
    }

    pub fn queue_family(&self) -> u32 {
        self.d_queue_family
    }

    /// Block until the device has finished all submitted work
    pub fn wait_idle(&self) -> Result<()> {
        check("vkDeviceWaitIdle", self.d_driver.device_wait_idle())
    }

    /// Find the first memory type allowed by `reqs` which has all of `flags`
    pub(crate) fn find_memory_type_index(
        props: &vk::PhysicalDeviceMemoryProperties,
        reqs: &vk::MemoryRequirements,
        flags: vk::MemoryPropertyFlags,
    ) -> Option<u32> {
        let count = props.memory_type_count as usize;
        // for each memory type
        for (i, ref mem_type) in props.memory_types.iter().take(count).enumerate() {
            // Bit i of memoryBitTypes will be set if the resource supports
            // the ith memory type in props.
            if (reqs.memory_type_bits >> i) & 1 == 1 && mem_type.property_flags.contains(flags) {
                // return the index into the memory type array
                return Some(i as u32);
            }
        }
        None
    }

    // -------------------- single time commands --------------------

    fn cmd_pool(&self) -> vk::CommandPool {
        self.d_internal.borrow().cmd_pool
    }

    /// Allocate and begin recording a one shot command buffer
    ///
    /// The buffer is primary level and recorded with ONE_TIME_SUBMIT.
    /// Hand it back with `end_single_time_commands`.
    pub fn begin_single_time_commands(&self) -> Result<vk::CommandBuffer> {
        let pool = self.cmd_pool();
        let cbuf = check(
            "vkAllocateCommandBuffers",
            self.d_driver.allocate_command_buffer(pool),
        )?;

        if let Err(e) = check("vkBeginCommandBuffer", self.d_driver.begin_command_buffer(cbuf)) {
            self.d_driver.free_command_buffer(pool, cbuf);
            return Err(e);
        }

        Ok(cbuf)
    }

    /// Finish, submit and free a buffer from `begin_single_time_commands`
    ///
    /// This blocks until the graphics queue is completely idle. It is
    /// only meant for setup and copy work where a stall is fine, never
    /// for per frame rendering.
    pub fn end_single_time_commands(&self, cbuf: vk::CommandBuffer) -> Result<()> {
        let pool = self.cmd_pool();
        let ret = self.submit_and_wait_idle(cbuf);
        self.d_driver.free_command_buffer(pool, cbuf);
        ret
    }

    fn submit_and_wait_idle(&self, cbuf: vk::CommandBuffer) -> Result<()> {
        check("vkEndCommandBuffer", self.d_driver.end_command_buffer(cbuf))?;
        check(
            "vkQueueSubmit",
            self.d_driver.queue_submit(cbuf, vk::Fence::null()),
        )?;
        check("vkQueueWaitIdle", self.d_driver.queue_wait_idle())
    }

    /// Like `end_single_time_commands` but waits on a fence
    ///
    /// Only this submission is waited for instead of everything on the
    /// queue. The fence is owned by the device and reused.
    pub fn end_single_time_commands_fenced(&self, cbuf: vk::CommandBuffer) -> Result<()> {
        let pool = self.cmd_pool();
        let ret = self.submit_and_wait_fence(cbuf);
        self.d_driver.free_command_buffer(pool, cbuf);
        ret
    }

    fn submit_and_wait_fence(&self, cbuf: vk::CommandBuffer) -> Result<()> {
        check("vkEndCommandBuffer", self.d_driver.end_command_buffer(cbuf))?;
        let fence = self.get_or_create_submit_fence()?;
        check("vkResetFences", self.d_driver.reset_fence(fence))?;
        check("vkQueueSubmit", self.d_driver.queue_submit(cbuf, fence))?;
        check("vkWaitForFences", self.d_driver.wait_for_fence(fence))
    }

    fn get_or_create_submit_fence(&self) -> Result<vk::Fence> {
        let mut internal = self.d_internal.borrow_mut();
        if internal.submit_fence == vk::Fence::null() {
            internal.submit_fence = check("vkCreateFence", self.d_driver.create_fence(false))?;
        }
        Ok(internal.submit_fence)
    }

    /// Throw away a recording without submitting it
    pub(crate) fn abort_single_time_commands(&self, cbuf: vk::CommandBuffer) {
        let pool = self.cmd_pool();
        let _ = self.d_driver.end_command_buffer(cbuf);
        self.d_driver.free_command_buffer(pool, cbuf);
    }

    /// Record `func` into a single time command buffer and run it
    ///
    /// If `func` fails the buffer is dropped without being submitted.
    pub(crate) fn with_single_time_commands<F>(&self, func: F) -> Result<()>
    where
        F: FnOnce(vk::CommandBuffer) -> Result<()>,
    {
        let cbuf = self.begin_single_time_commands()?;
        if let Err(e) = func(cbuf) {
            self.abort_single_time_commands(cbuf);
            return Err(e);
        }
        self.end_single_time_commands(cbuf)
    }

    // -------------------- descriptors --------------------

    /// Allocate one descriptor set from the device's pool
    ///
    /// See `DescriptorAllocator::allocate` for the reset policy.
    pub fn allocate_descriptor_set(
        &self,
        layout: vk::DescriptorSetLayout,
    ) -> Result<vk::DescriptorSet> {
        self.d_internal
            .borrow_mut()
            .descpool
            .allocate(self.d_driver.as_ref(), layout)
    }

    /// Reset the descriptor pool, invalidating every set from it
    pub fn reset_descriptor_pool(&self) -> Result<()> {
        self.d_internal
            .borrow_mut()
            .descpool
            .reset(self.d_driver.as_ref())
    }

    /// Number of sets handed out since the last pool reset
    pub fn descriptor_allocation_count(&self) -> u32 {
        self.d_internal.borrow().descpool.allocation_count()
    }

    // -------------------- external fences --------------------

    /// Create a fence whose payload can be exported as a sync file
    pub fn create_exportable_fence(&self) -> Result<vk::Fence> {
        if !self.d_caps.supports_external_fence_fd() {
            log::debug!("create_exportable_fence: VK_KHR_external_fence_fd not enabled");
            return Err(VkImportError::EXTERNAL_FENCE_NOT_SUPPORTED);
        }
        check("vkCreateFence", self.d_driver.create_fence(true))
    }

    /// Export a fence from `create_exportable_fence` as a sync file
    ///
    /// Returns None if the fence had already signaled, in which case
    /// there is nothing for the other side to wait on.
    pub fn export_fence_to_sync_fd(&self, fence: vk::Fence) -> Result<Option<OwnedFd>> {
        if !self.d_caps.supports_external_fence_fd() {
            return Err(VkImportError::EXTERNAL_FENCE_NOT_SUPPORTED);
        }
        check("vkGetFenceFdKHR", self.d_driver.export_fence_fd(fence))
    }

    pub fn destroy_fence(&self, fence: vk::Fence) {
        self.d_driver.destroy_fence(fence);
    }

    // -------------------- framebuffer stack --------------------

    pub(crate) fn with_fb_stack<T, F>(&self, func: F) -> T
    where
        F: FnOnce(&mut FramebufferStack) -> T,
    {
        func(&mut self.d_internal.borrow_mut().fb_stack)
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        if let Err(e) = self.d_driver.device_wait_idle() {
            log::error!(
                "Could not idle device during teardown: {}",
                crate::result::result_to_string(e)
            );
        }

        let internal = self.d_internal.get_mut();
        debug_assert_eq!(internal.fb_stack.depth(), 0);
        internal.descpool.destroy(self.d_driver.as_ref());
        if internal.submit_fence != vk::Fence::null() {
            self.d_driver.destroy_fence(internal.submit_fence);
        }
        self.d_driver.destroy_command_pool(internal.cmd_pool);
    }
}

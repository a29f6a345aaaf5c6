// Host visible staging buffers
//
// Austin Shafer - 2020
use ash::vk;

use crate::device::Device;
use crate::driver::AllocationDesc;
use crate::result::check;
use crate::{Result, VkImportError};
use utils::log;

use std::rc::Rc;

/// A buffer the CPU writes into before it is copied to an image
///
/// The memory prefers HOST_COHERENT, but may not be. Writers always
/// flush before handing the contents to the GPU.
pub struct StagingBuffer {
    sb_dev: Rc<Device>,
    sb_buffer: vk::Buffer,
    sb_memory: vk::DeviceMemory,
    sb_size: vk::DeviceSize,
    sb_mapped: bool,
}

impl StagingBuffer {
    pub fn new(dev: &Rc<Device>, size: vk::DeviceSize) -> Result<Self> {
        if size == 0 {
            return Err(VkImportError::INVALID);
        }
        let driver = dev.d_driver.as_ref();

        let buffer = check(
            "vkCreateBuffer",
            driver.create_buffer(size, vk::BufferUsageFlags::TRANSFER_SRC),
        )?;
        let reqs = driver.buffer_memory_requirements(buffer);

        let mem_type = Device::find_memory_type_index(
            &dev.d_mem_props,
            &reqs,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        )
        .or_else(|| {
            Device::find_memory_type_index(
                &dev.d_mem_props,
                &reqs,
                vk::MemoryPropertyFlags::HOST_VISIBLE,
            )
        });
        let mem_type = match mem_type {
            Some(t) => t,
            None => {
                log::error!("No host visible memory for a {} byte staging buffer", size);
                driver.destroy_buffer(buffer);
                return Err(VkImportError::NO_SUITABLE_MEMORY_TYPE);
            }
        };

        let memory = match check(
            "vkAllocateMemory",
            driver.allocate_memory(AllocationDesc {
                size: reqs.size,
                memory_type_index: mem_type,
                import_fd: None,
                dedicated_image: None,
            }),
        ) {
            Ok(m) => m,
            Err(e) => {
                driver.destroy_buffer(buffer);
                return Err(e);
            }
        };

        if let Err(e) = check("vkBindBufferMemory", driver.bind_buffer_memory(buffer, memory)) {
            driver.free_memory(memory);
            driver.destroy_buffer(buffer);
            return Err(e);
        }

        Ok(Self {
            sb_dev: dev.clone(),
            sb_buffer: buffer,
            sb_memory: memory,
            sb_size: size,
            sb_mapped: false,
        })
    }

    pub fn buffer(&self) -> vk::Buffer {
        self.sb_buffer
    }

    pub fn size(&self) -> vk::DeviceSize {
        self.sb_size
    }

    /// Map the whole buffer for writing
    ///
    /// The slice is only valid until `unmap` is called, which the
    /// borrow on self enforces.
    pub fn map(&mut self) -> Result<&mut [u8]> {
        debug_assert!(!self.sb_mapped, "staging buffer mapped twice");
        let ptr = check(
            "vkMapMemory",
            self.sb_dev
                .d_driver
                .map_memory(self.sb_memory, self.sb_size),
        )?;
        if ptr.is_null() {
            self.sb_dev.d_driver.unmap_memory(self.sb_memory);
            return Err(VkImportError::INVALID);
        }
        self.sb_mapped = true;

        // The mapping covers sb_size bytes and lives until unmap
        Ok(unsafe { std::slice::from_raw_parts_mut(ptr, self.sb_size as usize) })
    }

    /// Flush the mapped range so the device sees our writes
    pub fn flush(&self) -> Result<()> {
        debug_assert!(self.sb_mapped, "flushing an unmapped staging buffer");
        check(
            "vkFlushMappedMemoryRanges",
            self.sb_dev.d_driver.flush_memory(self.sb_memory),
        )
    }

    pub fn unmap(&mut self) {
        if self.sb_mapped {
            self.sb_dev.d_driver.unmap_memory(self.sb_memory);
            self.sb_mapped = false;
        }
    }

    /// Map, fill with `func`, flush and unmap
    pub fn write_with<F>(&mut self, func: F) -> Result<()>
    where
        F: FnOnce(&mut [u8]),
    {
        func(self.map()?);
        let ret = self.flush();
        self.unmap();
        ret
    }
}

impl Drop for StagingBuffer {
    fn drop(&mut self) {
        self.unmap();
        let driver = self.sb_dev.d_driver.as_ref();
        driver.destroy_buffer(self.sb_buffer);
        driver.free_memory(self.sb_memory);
    }
}

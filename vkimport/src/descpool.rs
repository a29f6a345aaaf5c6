/*
 * An allocator for descriptor sets
 *
 * Descriptor pools can't grow, so instead of letting one run dry in the
 * middle of a frame we reset it before it gets there.
 *
 * Austin Shafer - 2020
 */
use ash::vk;

use crate::driver::Driver;
use crate::result::{check, result_to_string};
use crate::{Result, VkImportError};
use utils::log;

/// Storage buffer descriptors reserved in the pool
static STORAGE_BUFFER_COUNT: u32 = 1000;

/// A single bounded descriptor pool
///
/// Allocations are counted. Once the count reaches the reset threshold
/// the next allocation idles the device and resets the pool first. If
/// the driver still reports the pool as exhausted or fragmented we do
/// one emergency reset and retry exactly once.
///
/// Every reset invalidates all sets from this pool, callers must
/// re-allocate per frame.
pub struct DescriptorAllocator {
    da_pool: vk::DescriptorPool,
    da_max_sets: u32,
    da_threshold: u32,
    /// number of allocations made since the last reset
    da_count: u32,
    /// number of times the pool has been reset, for diagnostics
    da_resets: u32,
}

impl DescriptorAllocator {
    pub fn new(driver: &dyn Driver, max_sets: u32, threshold: u32) -> Result<Self> {
        if max_sets == 0 {
            return Err(VkImportError::INVALID);
        }

        let sizes = [
            vk::DescriptorPoolSize::builder()
                .ty(vk::DescriptorType::UNIFORM_BUFFER)
                .descriptor_count(max_sets)
                .build(),
            vk::DescriptorPoolSize::builder()
                .ty(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
                .descriptor_count(max_sets)
                .build(),
            vk::DescriptorPoolSize::builder()
                .ty(vk::DescriptorType::STORAGE_BUFFER)
                .descriptor_count(STORAGE_BUFFER_COUNT)
                .build(),
        ];

        let pool = check(
            "vkCreateDescriptorPool",
            driver.create_descriptor_pool(max_sets, &sizes),
        )?;

        Ok(Self {
            da_pool: pool,
            da_max_sets: max_sets,
            da_threshold: threshold.min(max_sets),
            da_count: 0,
            da_resets: 0,
        })
    }

    pub fn pool(&self) -> vk::DescriptorPool {
        self.da_pool
    }

    pub fn allocation_count(&self) -> u32 {
        self.da_count
    }

    pub fn reset_count(&self) -> u32 {
        self.da_resets
    }

    pub fn capacity(&self) -> u32 {
        self.da_max_sets
    }

    /// Allocate one set with `layout`
    ///
    /// Returns `DESCRIPTOR_POOL_EXHAUSTED` if the pool could not satisfy
    /// the request even after an emergency reset. That only fails the
    /// current draw, the allocator is still usable afterwards.
    pub fn allocate(
        &mut self,
        driver: &dyn Driver,
        layout: vk::DescriptorSetLayout,
    ) -> Result<vk::DescriptorSet> {
        if self.da_count >= self.da_threshold {
            log::debug!(
                "Descriptor pool at {}/{} sets, resetting",
                self.da_count,
                self.da_max_sets
            );
            self.reset(driver)?;
        }

        match driver.allocate_descriptor_set(self.da_pool, layout) {
            Ok(set) => {
                self.da_count += 1;
                Ok(set)
            }
            Err(e)
                if e == vk::Result::ERROR_OUT_OF_POOL_MEMORY
                    || e == vk::Result::ERROR_FRAGMENTED_POOL =>
            {
                log::warn!(
                    "Descriptor allocation failed with {} after {} sets, doing emergency reset",
                    result_to_string(e),
                    self.da_count
                );
                self.reset(driver)?;

                match driver.allocate_descriptor_set(self.da_pool, layout) {
                    Ok(set) => {
                        self.da_count += 1;
                        Ok(set)
                    }
                    Err(e) => {
                        log::error!(
                            "Descriptor allocation failed again after reset: {}",
                            result_to_string(e)
                        );
                        Err(VkImportError::DESCRIPTOR_POOL_EXHAUSTED)
                    }
                }
            }
            Err(e) => {
                log::error!("vkAllocateDescriptorSets failed: {}", result_to_string(e));
                Err(VkImportError::VK_ERROR(e))
            }
        }
    }

    /// Idle the device and reset the pool
    ///
    /// Sets from this pool may still be referenced by work in flight,
    /// so the device has to be idle before they are invalidated.
    pub fn reset(&mut self, driver: &dyn Driver) -> Result<()> {
        check("vkDeviceWaitIdle", driver.device_wait_idle())?;
        check(
            "vkResetDescriptorPool",
            driver.reset_descriptor_pool(self.da_pool),
        )?;
        self.da_count = 0;
        self.da_resets += 1;
        Ok(())
    }

    pub(crate) fn destroy(&mut self, driver: &dyn Driver) {
        if self.da_pool != vk::DescriptorPool::null() {
            driver.destroy_descriptor_pool(self.da_pool);
            self.da_pool = vk::DescriptorPool::null();
        }
    }
}

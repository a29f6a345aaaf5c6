// Bringing up Vulkan in stages
//
// The compositor walks the backend through instance creation, physical
// device selection and device creation one step at a time so it can
// report which step went wrong. Any failure is final.
//
// Austin Shafer - 2021
use ash::vk;

use crate::device::Device;
use crate::driver::NativeDriver;
use crate::instance::Instance;
use crate::platform;
use crate::result::{check, result_to_string};
use crate::{CreateInfo, Result, VkImportError};
use utils::log;

use std::ffi::{CStr, CString};
use std::os::raw::c_char;
use std::rc::Rc;

pub struct Backend {
    b_info: CreateInfo,
    b_instance: Option<Rc<Instance>>,
    /// The physical device and its graphics queue family
    b_pdev: Option<(vk::PhysicalDevice, u32)>,
    b_device: Option<Rc<Device>>,
    b_device_extensions: Vec<CString>,
    /// Set once something fails. Holds a description of what.
    b_failure: Option<String>,
}

impl Backend {
    pub fn new(info: CreateInfo) -> Self {
        Self {
            b_info: info,
            b_instance: None,
            b_pdev: None,
            b_device: None,
            b_device_extensions: Vec::new(),
            b_failure: None,
        }
    }

    /// Wrap an already created device context
    ///
    /// This is for devices built on a custom `Driver`. No instance is
    /// owned in this case.
    pub fn from_device(info: CreateInfo, device: Rc<Device>) -> Self {
        let mut ret = Self::new(info);
        ret.b_device = Some(device);
        ret
    }

    pub fn is_failed(&self) -> bool {
        self.b_failure.is_some()
    }

    pub fn failure_reason(&self) -> Option<&str> {
        self.b_failure.as_deref()
    }

    /// Mark the backend as unusable
    ///
    /// Only the first reason is kept.
    pub fn set_failed(&mut self, reason: &str) {
        log::error!("Vulkan backend failed: {}", reason);
        if self.b_failure.is_none() {
            self.b_failure = Some(reason.to_string());
        }
    }

    fn ensure_usable(&self) -> Result<()> {
        match self.b_failure {
            Some(_) => Err(VkImportError::BACKEND_FAILED),
            None => Ok(()),
        }
    }

    /// Record `res` as fatal if it failed
    fn fail_on_err<T>(&mut self, step: &str, res: Result<T>) -> Result<T> {
        if let Err(e) = res.as_ref() {
            self.set_failed(&format!("{}: {}", step, e));
        }
        res
    }

    /// Create the instance, requiring every extension in `required`
    pub fn create_instance(&mut self, required: &[&CStr]) -> Result<()> {
        self.ensure_usable()?;
        let res = Instance::new(&self.b_info, required);
        let inst = self.fail_on_err("create_instance", res)?;
        self.b_instance = Some(Rc::new(inst));
        Ok(())
    }

    /// Pick the first physical device that has a graphics queue
    pub fn select_physical_device(&mut self) -> Result<()> {
        self.ensure_usable()?;
        let inst = self
            .b_instance
            .clone()
            .ok_or(VkImportError::NOT_INITIALIZED)?;
        let res = Self::find_graphics_pdev(&inst.inst);
        let (pdev, family) = self.fail_on_err("select_physical_device", res)?;

        log::debug!(
            "Selected physical device {:?} with graphics queue family {}",
            pdev,
            family
        );
        self.b_pdev = Some((pdev, family));
        Ok(())
    }

    fn find_graphics_pdev(inst: &ash::Instance) -> Result<(vk::PhysicalDevice, u32)> {
        let pdevices = check("vkEnumeratePhysicalDevices", unsafe {
            inst.enumerate_physical_devices()
        })?;
        if pdevices.is_empty() {
            log::error!("No Vulkan capable GPUs found");
            return Err(VkImportError::NO_PHYSICAL_DEVICE);
        }

        // No scoring, the first device with graphics wins
        for pdev in pdevices.iter() {
            let family = unsafe { inst.get_physical_device_queue_family_properties(*pdev) }
                .iter()
                .position(|info| info.queue_flags.contains(vk::QueueFlags::GRAPHICS));

            if let Some(family) = family {
                return Ok((*pdev, family as u32));
            }
        }

        log::error!("None of the {} GPUs have a graphics queue", pdevices.len());
        Err(VkImportError::NO_SUITABLE_DEVICE)
    }

    /// Create the logical device and its context
    ///
    /// Optional features like dmabuf import are enabled if the device
    /// has them. Every extension in `required` must be present.
    pub fn create_device(&mut self, required: &[&CStr]) -> Result<()> {
        self.ensure_usable()?;
        let inst = self
            .b_instance
            .clone()
            .ok_or(VkImportError::NOT_INITIALIZED)?;
        let (pdev, family) = self.b_pdev.ok_or(VkImportError::NOT_INITIALIZED)?;

        let res = Self::make_device(&self.b_info, inst, pdev, family, required);
        let (device, exts) = self.fail_on_err("create_device", res)?;
        self.b_device = Some(device);
        self.b_device_extensions = exts;
        Ok(())
    }

    fn make_device(
        info: &CreateInfo,
        inst: Rc<Instance>,
        pdev: vk::PhysicalDevice,
        family: u32,
        required: &[&CStr],
    ) -> Result<(Rc<Device>, Vec<CString>)> {
        let available = check("vkEnumerateDeviceExtensionProperties", unsafe {
            inst.inst.enumerate_device_extension_properties(pdev)
        })?;
        let available = platform::extension_names(&available);

        let mut required: Vec<&CStr> = required.to_vec();
        for name in info.device_extensions.iter() {
            required.push(name.as_c_str());
        }
        let (enabled, caps) =
            platform::negotiate_device_extensions(&available, &required, inst.i_fence_capabilities)?;
        let enabled_raw: Vec<*const c_char> = enabled.iter().map(|name| name.as_ptr()).collect();

        // for now we only have one graphics queue, so one priority
        let priorities = [1.0];
        let queue_infos = [vk::DeviceQueueCreateInfo::builder()
            .queue_family_index(family)
            .queue_priorities(&priorities)
            .build()];

        let dev_create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(&queue_infos)
            .enabled_extension_names(&enabled_raw);

        let dev = check("vkCreateDevice", unsafe {
            inst.inst.create_device(pdev, &dev_create_info, None)
        })?;

        log::debug!("Created Vulkan device with extensions {:?}", enabled);
        let driver = NativeDriver::new(inst, pdev, dev, family, caps);
        let device = Device::new(Box::new(driver), caps, family, info)?;
        Ok((device, enabled))
    }

    /// Get the device context
    pub fn device(&self) -> Result<Rc<Device>> {
        self.ensure_usable()?;
        self.b_device.clone().ok_or(VkImportError::NOT_INITIALIZED)
    }

    pub fn enabled_device_extensions(&self) -> &[CString] {
        &self.b_device_extensions
    }

    /// Check whether the GPU was lost
    ///
    /// Returns true if the device is gone, in which case the backend
    /// is marked failed and has to be recreated.
    pub fn check_graphics_reset(&mut self) -> bool {
        let res = match self.b_device.as_ref() {
            Some(dev) => dev.driver().device_wait_idle(),
            None => return false,
        };

        match res {
            Err(vk::Result::ERROR_DEVICE_LOST) => {
                self.set_failed("graphics reset: VK_ERROR_DEVICE_LOST");
                true
            }
            Err(e) => {
                log::warn!("check_graphics_reset: wait idle failed: {}", result_to_string(e));
                false
            }
            Ok(()) => false,
        }
    }

    /// Tear everything down
    ///
    /// Framebuffers hold references to the device, so the stack is
    /// emptied first, then the device, then the instance.
    pub fn cleanup(&mut self) {
        if let Some(dev) = self.b_device.take() {
            dev.clear_framebuffers();
            if Rc::strong_count(&dev) > 1 {
                log::debug!(
                    "cleanup: {} other references to the device remain",
                    Rc::strong_count(&dev) - 1
                );
            }
        }
        self.b_device_extensions.clear();
        self.b_pdev = None;
        self.b_instance = None;
    }
}

impl Drop for Backend {
    fn drop(&mut self) {
        self.cleanup();
    }
}

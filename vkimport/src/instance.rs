// Vulkan instance
//
// This holds all of the common instance code for the Vulkan context

use ash::extensions::ext;
use ash::{vk, Entry};

use crate::platform::{self, InstanceExtensions};
use crate::result::check;
use crate::{CreateInfo, Result, VkImportError};
use utils::log;

use std::ffi::{CStr, CString};
use std::os::raw::{c_char, c_void};

// Route validation messages into our log at a level matching their
// severity
unsafe extern "system" fn vulkan_debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_types: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _p_user_data: *mut c_void,
) -> vk::Bool32 {
    let msg = match p_callback_data.as_ref() {
        Some(data) if !data.p_message.is_null() => {
            CStr::from_ptr(data.p_message).to_string_lossy()
        }
        _ => return vk::FALSE,
    };

    if message_severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR) {
        log::error!("[VK][{:?}] {}", message_types, msg);
    } else if message_severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::WARNING) {
        log::warn!("[VK][{:?}] {}", message_types, msg);
    } else if message_severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::INFO) {
        log::info!("[VK][{:?}] {}", message_types, msg);
    } else {
        log::debug!("[VK][{:?}] {}", message_types, msg);
    }
    vk::FALSE
}

/// A Vulkan Instance
///
/// This holds our basic vulkan session data. Devices are created from it
/// and keep it alive through an `Rc`, so it is always torn down last.
pub struct Instance {
    /// debug callback sugar mentioned earlier. Only present in
    /// debug builds.
    debug: Option<(ext::DebugUtils, vk::DebugUtilsMessengerEXT)>,

    /// the entry just loads function pointers from the dynamic library
    /// I am calling it a loader, because that's what it does. It has to
    /// outlive the instance or the library gets unloaded under us.
    #[allow(dead_code)]
    loader: Entry,
    /// the big vulkan instance.
    pub(crate) inst: ash::Instance,
    /// Did we get VK_KHR_external_fence_capabilities. Fence fd export
    /// on the device depends on it.
    pub(crate) i_fence_capabilities: bool,
}

impl Instance {
    /// Creates a new debug messenger and registers our function
    /// for debug callbacks so we get nice error messages
    fn setup_debug(
        entry: &Entry,
        instance: &ash::Instance,
    ) -> Result<(ext::DebugUtils, vk::DebugUtilsMessengerEXT)> {
        let debug_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::ERROR
                    | vk::DebugUtilsMessageSeverityFlagsEXT::INFO
                    | vk::DebugUtilsMessageSeverityFlagsEXT::VERBOSE
                    | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION,
            )
            .pfn_user_callback(Some(vulkan_debug_callback));

        let dr_loader = ext::DebugUtils::new(entry, instance);
        let callback = check("vkCreateDebugUtilsMessengerEXT", unsafe {
            dr_loader.create_debug_utils_messenger(&debug_info, None)
        })?;
        Ok((dr_loader, callback))
    }

    /// Create a vkInstance
    ///
    /// The instance extensions are enumerated once and negotiated
    /// against `required`. Debug builds always ask for the
    /// Khronos validation layer and the debug messenger.
    pub fn new(info: &CreateInfo, required: &[&CStr]) -> Result<Self> {
        let entry = unsafe { Entry::load() }.map_err(|e| {
            log::error!("Could not load the Vulkan library: {}", e);
            VkImportError::LOADING_FAILED(e.to_string())
        })?;

        let available = check("vkEnumerateInstanceExtensionProperties", unsafe {
            entry.enumerate_instance_extension_properties(None)
        })?;
        let available = platform::extension_names(&available);

        let mut required: Vec<&CStr> = required.to_vec();
        for name in info.instance_extensions.iter() {
            required.push(name.as_c_str());
        }
        let InstanceExtensions {
            enabled,
            fence_capabilities,
            debug_utils,
        } = platform::negotiate_instance_extensions(
            &available,
            &required,
            cfg!(debug_assertions),
        )?;

        let app_name = CString::new(info.app_name.as_str()).map_err(|_| VkImportError::INVALID)?;

        let layer_names: Vec<&CStr> = vec![
            #[cfg(debug_assertions)]
            platform::validation_layer_name(),
        ];
        let layer_names_raw: Vec<*const c_char> =
            layer_names.iter().map(|name| name.as_ptr()).collect();
        let extension_names_raw: Vec<*const c_char> =
            enabled.iter().map(|name| name.as_ptr()).collect();

        let appinfo = vk::ApplicationInfo::builder()
            .application_name(&app_name)
            .application_version(0)
            .engine_name(&app_name)
            .engine_version(0)
            .api_version(vk::API_VERSION_1_2);

        let create_info = vk::InstanceCreateInfo::builder()
            .application_info(&appinfo)
            .enabled_layer_names(&layer_names_raw)
            .enabled_extension_names(&extension_names_raw);

        let instance: ash::Instance = check("vkCreateInstance", unsafe {
            entry.create_instance(&create_info, None)
        })?;

        let debug = if debug_utils {
            match Self::setup_debug(&entry, &instance) {
                Ok(d) => Some(d),
                Err(e) => {
                    unsafe { instance.destroy_instance(None) };
                    return Err(e);
                }
            }
        } else {
            None
        };

        log::debug!("Created Vulkan instance with extensions {:?}", enabled);

        Ok(Self {
            debug: debug,
            loader: entry,
            inst: instance,
            i_fence_capabilities: fence_capabilities,
        })
    }

    /// Was VK_KHR_external_fence_capabilities enabled
    pub fn has_fence_capabilities(&self) -> bool {
        self.i_fence_capabilities
    }
}

impl Drop for Instance {
    fn drop(&mut self) {
        unsafe {
            if let Some((loader, callback)) = self.debug.take() {
                loader.destroy_debug_utils_messenger(callback, None);
            }
            self.inst.destroy_instance(None);
        }
    }
}

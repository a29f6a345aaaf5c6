// This module handles flagging the available behaviors
// supported by the device. Things like dmabuf import and
// external fence export.
//
// Austin Shafer - 2021
use ash::extensions::{ext, khr};
use ash::vk;
use bitflags::bitflags;

use std::ffi::{CStr, CString};
use utils::log;

bitflags! {
    /// The optional capabilities negotiated at device creation.
    ///
    /// This is decided once when the device is made and never changes
    /// afterwards. Import paths consult it before touching the driver.
    pub struct DeviceCapabilities: u32 {
        const EXTERNAL_MEMORY_FD = 1 << 0;
        const DMA_BUF_IMPORT = 1 << 1;
        const DRM_FORMAT_MODIFIER = 1 << 2;
        const EXTERNAL_FENCE_CAPABILITIES = 1 << 3;
        const EXTERNAL_FENCE_FD = 1 << 4;
    }
}

impl DeviceCapabilities {
    /// Zero copy import needs all three of the dmabuf extensions
    pub fn supports_dmabuf_import(&self) -> bool {
        self.contains(
            Self::EXTERNAL_MEMORY_FD | Self::DMA_BUF_IMPORT | Self::DRM_FORMAT_MODIFIER,
        )
    }

    pub fn supports_external_fence_fd(&self) -> bool {
        self.contains(Self::EXTERNAL_FENCE_FD)
    }
}

/// The extensions that together make up dmabuf import.
pub fn dmabuf_extensions() -> [&'static CStr; 3] {
    [
        khr::ExternalMemoryFd::name(),
        vk::ExtExternalMemoryDmaBufFn::name(),
        vk::ExtImageDrmFormatModifierFn::name(),
    ]
}

pub fn validation_layer_name() -> &'static CStr {
    // Safe since the literal is nul terminated with no interior nuls
    unsafe { CStr::from_bytes_with_nul_unchecked(b"VK_LAYER_KHRONOS_validation\0") }
}

/// Turn a list of extension properties into owned names
pub(crate) fn extension_names(exts: &[vk::ExtensionProperties]) -> Vec<CString> {
    exts.iter()
        .map(|e| unsafe { CStr::from_ptr(e.extension_name.as_ptr()) }.to_owned())
        .collect()
}

fn contains_extension(exts: &[CString], req: &CStr) -> bool {
    exts.iter().any(|e| e.as_c_str() == req)
}

fn push_unique(list: &mut Vec<CString>, name: &CStr) {
    if !contains_extension(list, name) {
        list.push(name.to_owned());
    }
}

/// The instance level result of extension negotiation
#[derive(Debug, PartialEq)]
pub struct InstanceExtensions {
    pub enabled: Vec<CString>,
    pub fence_capabilities: bool,
    pub debug_utils: bool,
}

/// Decide which instance extensions to enable
///
/// Every extension in `required` must be present or this fails. The
/// external fence capability extension is picked up opportunistically
/// since the device fence export depends on it, and debug builds add the
/// debug utils messenger.
pub fn negotiate_instance_extensions(
    available: &[CString],
    required: &[&CStr],
    debug: bool,
) -> crate::Result<InstanceExtensions> {
    let mut ret = InstanceExtensions {
        enabled: Vec::new(),
        fence_capabilities: false,
        debug_utils: false,
    };

    let mut missing = false;
    for req in required.iter() {
        if contains_extension(available, req) {
            push_unique(&mut ret.enabled, req);
        } else {
            log::error!("Required instance extension {:?} is not available", req);
            missing = true;
        }
    }
    if missing {
        return Err(crate::VkImportError::VK_NOT_ALL_EXTENSIONS_AVAILABLE);
    }

    let fence_caps = vk::KhrExternalFenceCapabilitiesFn::name();
    if contains_extension(available, fence_caps) {
        push_unique(&mut ret.enabled, fence_caps);
        ret.fence_capabilities = true;
    }

    if debug {
        push_unique(&mut ret.enabled, ext::DebugUtils::name());
        ret.debug_utils = true;
    }

    Ok(ret)
}

/// Decide which device extensions to enable and what that lets us do
///
/// Dmabuf import is all or nothing: if any one of the three extensions is
/// missing none of them are enabled, and the missing ones are logged so
/// the CPU fallback can be explained. Fence export needs both the device
/// extension and the instance capability extension negotiated earlier.
pub fn negotiate_device_extensions(
    available: &[CString],
    required: &[&CStr],
    instance_fence_capabilities: bool,
) -> crate::Result<(Vec<CString>, DeviceCapabilities)> {
    let mut enabled = Vec::new();
    let mut caps = DeviceCapabilities::empty();

    let mut missing = false;
    for req in required.iter() {
        if contains_extension(available, req) {
            push_unique(&mut enabled, req);
        } else {
            log::error!("Required device extension {:?} is not available", req);
            missing = true;
        }
    }
    if missing {
        return Err(crate::VkImportError::VK_NOT_ALL_EXTENSIONS_AVAILABLE);
    }

    let dmabuf_exts = dmabuf_extensions();
    if dmabuf_exts
        .iter()
        .all(|name| contains_extension(available, name))
    {
        for name in dmabuf_exts.iter() {
            push_unique(&mut enabled, name);
        }
        caps |= DeviceCapabilities::EXTERNAL_MEMORY_FD
            | DeviceCapabilities::DMA_BUF_IMPORT
            | DeviceCapabilities::DRM_FORMAT_MODIFIER;
    } else {
        for name in dmabuf_exts.iter() {
            if !contains_extension(available, name) {
                log::warn!(
                    "Device extension {:?} is missing, dmabuf import disabled",
                    name
                );
            }
        }
    }

    if instance_fence_capabilities {
        caps |= DeviceCapabilities::EXTERNAL_FENCE_CAPABILITIES;
        let fence_fd = vk::KhrExternalFenceFdFn::name();
        if contains_extension(available, fence_fd) {
            push_unique(&mut enabled, fence_fd);
            caps |= DeviceCapabilities::EXTERNAL_FENCE_FD;
        } else {
            log::debug!("Device does not support {:?}", fence_fd);
        }
    }

    log::debug!("Negotiated device capabilities: {:?}", caps);
    Ok((enabled, caps))
}

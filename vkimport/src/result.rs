// Human readable strings for Vulkan enums
//
// Everything that ends up in a log line about a failed native call
// goes through here so the messages match the names in the Vulkan
// headers.
//
// Austin Shafer - 2021
use ash::vk;
use std::borrow::Cow;

/// Translate a VkResult into the name used in the Vulkan headers
///
/// Codes we don't know about are reported with their raw value.
pub fn result_to_string(res: vk::Result) -> Cow<'static, str> {
    let name = match res {
        vk::Result::SUCCESS => "VK_SUCCESS",
        vk::Result::NOT_READY => "VK_NOT_READY",
        vk::Result::TIMEOUT => "VK_TIMEOUT",
        vk::Result::EVENT_SET => "VK_EVENT_SET",
        vk::Result::EVENT_RESET => "VK_EVENT_RESET",
        vk::Result::INCOMPLETE => "VK_INCOMPLETE",
        vk::Result::ERROR_OUT_OF_HOST_MEMORY => "VK_ERROR_OUT_OF_HOST_MEMORY",
        vk::Result::ERROR_OUT_OF_DEVICE_MEMORY => "VK_ERROR_OUT_OF_DEVICE_MEMORY",
        vk::Result::ERROR_INITIALIZATION_FAILED => "VK_ERROR_INITIALIZATION_FAILED",
        vk::Result::ERROR_DEVICE_LOST => "VK_ERROR_DEVICE_LOST",
        vk::Result::ERROR_MEMORY_MAP_FAILED => "VK_ERROR_MEMORY_MAP_FAILED",
        vk::Result::ERROR_LAYER_NOT_PRESENT => "VK_ERROR_LAYER_NOT_PRESENT",
        vk::Result::ERROR_EXTENSION_NOT_PRESENT => "VK_ERROR_EXTENSION_NOT_PRESENT",
        vk::Result::ERROR_FEATURE_NOT_PRESENT => "VK_ERROR_FEATURE_NOT_PRESENT",
        vk::Result::ERROR_INCOMPATIBLE_DRIVER => "VK_ERROR_INCOMPATIBLE_DRIVER",
        vk::Result::ERROR_TOO_MANY_OBJECTS => "VK_ERROR_TOO_MANY_OBJECTS",
        vk::Result::ERROR_FORMAT_NOT_SUPPORTED => "VK_ERROR_FORMAT_NOT_SUPPORTED",
        vk::Result::ERROR_FRAGMENTED_POOL => "VK_ERROR_FRAGMENTED_POOL",
        vk::Result::ERROR_UNKNOWN => "VK_ERROR_UNKNOWN",
        vk::Result::ERROR_OUT_OF_POOL_MEMORY => "VK_ERROR_OUT_OF_POOL_MEMORY",
        vk::Result::ERROR_INVALID_EXTERNAL_HANDLE => "VK_ERROR_INVALID_EXTERNAL_HANDLE",
        vk::Result::ERROR_FRAGMENTATION => "VK_ERROR_FRAGMENTATION",
        vk::Result::ERROR_INVALID_OPAQUE_CAPTURE_ADDRESS => {
            "VK_ERROR_INVALID_OPAQUE_CAPTURE_ADDRESS"
        }
        vk::Result::ERROR_SURFACE_LOST_KHR => "VK_ERROR_SURFACE_LOST_KHR",
        vk::Result::ERROR_NATIVE_WINDOW_IN_USE_KHR => "VK_ERROR_NATIVE_WINDOW_IN_USE_KHR",
        vk::Result::SUBOPTIMAL_KHR => "VK_SUBOPTIMAL_KHR",
        vk::Result::ERROR_OUT_OF_DATE_KHR => "VK_ERROR_OUT_OF_DATE_KHR",
        vk::Result::ERROR_INCOMPATIBLE_DISPLAY_KHR => "VK_ERROR_INCOMPATIBLE_DISPLAY_KHR",
        vk::Result::ERROR_VALIDATION_FAILED_EXT => "VK_ERROR_VALIDATION_FAILED_EXT",
        vk::Result::ERROR_INVALID_SHADER_NV => "VK_ERROR_INVALID_SHADER_NV",
        vk::Result::ERROR_INVALID_DRM_FORMAT_MODIFIER_PLANE_LAYOUT_EXT => {
            "VK_ERROR_INVALID_DRM_FORMAT_MODIFIER_PLANE_LAYOUT_EXT"
        }
        vk::Result::ERROR_NOT_PERMITTED_EXT => "VK_ERROR_NOT_PERMITTED_EXT",
        vk::Result::ERROR_FULL_SCREEN_EXCLUSIVE_MODE_LOST_EXT => {
            "VK_ERROR_FULL_SCREEN_EXCLUSIVE_MODE_LOST_EXT"
        }
        vk::Result::THREAD_IDLE_KHR => "VK_THREAD_IDLE_KHR",
        vk::Result::THREAD_DONE_KHR => "VK_THREAD_DONE_KHR",
        vk::Result::OPERATION_DEFERRED_KHR => "VK_OPERATION_DEFERRED_KHR",
        vk::Result::OPERATION_NOT_DEFERRED_KHR => "VK_OPERATION_NOT_DEFERRED_KHR",
        vk::Result::PIPELINE_COMPILE_REQUIRED => "VK_PIPELINE_COMPILE_REQUIRED_EXT",
        other => return Cow::Owned(format!("Unknown VkResult: {}", other.as_raw())),
    };

    Cow::Borrowed(name)
}

/// Formatting hook for error messages that hold the result by reference
pub(crate) fn result_ref_to_string(res: &vk::Result) -> Cow<'static, str> {
    result_to_string(*res)
}

/// Name of an image layout, for barrier logging
pub fn layout_to_string(layout: vk::ImageLayout) -> Cow<'static, str> {
    let name = match layout {
        vk::ImageLayout::UNDEFINED => "UNDEFINED",
        vk::ImageLayout::GENERAL => "GENERAL",
        vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL => "COLOR_ATTACHMENT_OPTIMAL",
        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL => "SHADER_READ_ONLY_OPTIMAL",
        vk::ImageLayout::TRANSFER_SRC_OPTIMAL => "TRANSFER_SRC_OPTIMAL",
        vk::ImageLayout::TRANSFER_DST_OPTIMAL => "TRANSFER_DST_OPTIMAL",
        vk::ImageLayout::PREINITIALIZED => "PREINITIALIZED",
        vk::ImageLayout::PRESENT_SRC_KHR => "PRESENT_SRC_KHR",
        other => return Cow::Owned(format!("VkImageLayout({})", other.as_raw())),
    };

    Cow::Borrowed(name)
}

/// Log a failed native call and hand the error back for propagation
///
/// Every native call site funnels through this so the log line always
/// names the operation and the result.
pub(crate) fn check<T>(op: &str, res: ash::prelude::VkResult<T>) -> crate::Result<T> {
    res.map_err(|e| {
        utils::log::error!("{} failed: {}", op, result_to_string(e));
        crate::VkImportError::VK_ERROR(e)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_results_use_header_names() {
        assert_eq!(result_to_string(vk::Result::SUCCESS), "VK_SUCCESS");
        assert_eq!(
            result_to_string(vk::Result::ERROR_OUT_OF_POOL_MEMORY),
            "VK_ERROR_OUT_OF_POOL_MEMORY"
        );
        assert_eq!(
            result_to_string(vk::Result::ERROR_INVALID_EXTERNAL_HANDLE),
            "VK_ERROR_INVALID_EXTERNAL_HANDLE"
        );
    }

    #[test]
    fn unknown_result_reports_raw_value() {
        assert_eq!(
            result_to_string(vk::Result::from_raw(-12345)),
            "Unknown VkResult: -12345"
        );
    }

    #[test]
    fn layout_names() {
        assert_eq!(
            layout_to_string(vk::ImageLayout::TRANSFER_DST_OPTIMAL),
            "TRANSFER_DST_OPTIMAL"
        );
        assert_eq!(
            layout_to_string(vk::ImageLayout::from_raw(77)),
            "VkImageLayout(77)"
        );
    }
}

//! # vkimport: zero-copy surface import for Vulkan compositors
//!
//! vkimport takes buffers that live somewhere else, a client's DMA-BUF
//! or an X11 pixmap, and turns them into Vulkan textures that a
//! compositor can sample. When the buffer can be shared directly the
//! foreign memory is imported and bound to an image with no copies.
//! When it can't, the pixels are read back through the window system
//! and uploaded through a staging buffer.
//!
//! The general flow is:
//! * Create a `Backend` and walk it through `create_instance`,
//!   `select_physical_device` and `create_device`.
//! * Get the `Device` context from the backend. It owns the command
//!   pool, the descriptor allocator and the framebuffer stack.
//! * Import buffers with `Device::import_dmabuf`, or wrap a pixmap in
//!   a `SurfaceTextureX11` and let it pick the best path.
//! * Sample the resulting `Texture`.
//!
//! Everything here is meant to be driven from a single render thread.
//! None of the types are `Send`.
//!
//! ## Requirements
//!
//! vkimport requires Vulkan 1.2. The following extensions are used when
//! available, and zero-copy import is disabled unless all of the first
//! three are present:
//! * VK_KHR_external_memory_fd
//! * VK_EXT_external_memory_dma_buf
//! * VK_EXT_image_drm_format_modifier
//! * VK_KHR_external_fence_capabilities / VK_KHR_external_fence_fd

// Austin Shafer - 2020

extern crate utils;

mod backend;
mod buffer;
mod context;
mod descpool;
mod device;
mod dmabuf;
mod driver;
mod framebuffer;
mod image;
mod instance;
mod platform;
mod result;
#[cfg(feature = "x11")]
mod x11;

#[cfg(test)]
mod mock;

pub use backend::Backend;
pub use buffer::StagingBuffer;
pub use context::{current_device, CurrentGuard};
pub use descpool::DescriptorAllocator;
pub use device::Device;
pub use dmabuf::{
    drm_format_to_vk, fourcc_to_string, query_drm_format_modifiers, select_dmabuf_memory_type,
    BufferAttributes, DmabufPlane, DrmFourcc, DRM_FORMAT_MOD_INVALID, DRM_FORMAT_MOD_LINEAR,
};
pub use driver::{
    AllocationDesc, DedicatedRequirements, Driver, DrmModifierLayout, ImageDesc, NativeDriver,
    SamplerDesc,
};
pub use framebuffer::{Framebuffer, FramebufferStack};
pub use image::Texture;
pub use instance::Instance;
pub use platform::{negotiate_device_extensions, negotiate_instance_extensions, DeviceCapabilities};
pub use result::{layout_to_string, result_to_string};
#[cfg(feature = "x11")]
pub use x11::{
    depth_to_drm_format, Dri3Buffer, PixmapGeometry, PixmapImage, PixmapSource,
    SurfaceTextureX11, X11PixmapSource,
};

// Re-export some things from utils so clients
// can use them
pub use crate::utils::region::{Rect, Region};

use ash::vk;
use std::ffi::CString;
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
#[allow(non_camel_case_types)]
pub enum VkImportError {
    #[error("Vulkan call failed: {}", result::result_ref_to_string(.0))]
    VK_ERROR(#[from] vk::Result),
    #[error("Could not load the Vulkan library: {0}")]
    LOADING_FAILED(String),
    #[error("Not all required Vulkan extensions are available")]
    VK_NOT_ALL_EXTENSIONS_AVAILABLE,
    #[error("Failed to find GPUs with Vulkan support")]
    NO_PHYSICAL_DEVICE,
    #[error("Failed to find a suitable GPU")]
    NO_SUITABLE_DEVICE,
    #[error("Backend has not been initialized this far")]
    NOT_INITIALIZED,
    #[error("Backend has failed and refuses further operations")]
    BACKEND_FAILED,
    #[error("DMA-BUF import is not supported by this device")]
    DMABUF_NOT_SUPPORTED,
    #[error("DRM format {} has no Vulkan equivalent", dmabuf::fourcc_ref_to_string(.0))]
    UNSUPPORTED_FORMAT(u32),
    #[error("Modifier {modifier:#x} is not supported for format {}", dmabuf::fourcc_ref_to_string(.format))]
    UNSUPPORTED_MODIFIER { format: u32, modifier: u64 },
    #[error("Invalid dmabuf")]
    INVALID_DMABUF,
    #[error("Invalid file descriptor")]
    INVALID_FD,
    #[error("Could not find a usable memory type")]
    NO_SUITABLE_MEMORY_TYPE,
    #[error("Descriptor pool exhausted even after a reset")]
    DESCRIPTOR_POOL_EXHAUSTED,
    #[error("Popped an empty framebuffer stack")]
    FRAMEBUFFER_STACK_UNDERFLOW,
    #[error("Exportable fences are not supported by this device")]
    EXTERNAL_FENCE_NOT_SUPPORTED,
    #[error("Unsupported pixmap depth {0}")]
    UNSUPPORTED_DEPTH(u8),
    #[error("Surface is not valid")]
    INVALID_SURFACE,
    #[error("X11 request failed: {0}")]
    X11_ERROR(String),
    #[error("Invalid argument")]
    INVALID,
}

pub type Result<T> = std::result::Result<T, VkImportError>;

/// Default number of sets the descriptor pool is created with.
pub const DESCRIPTOR_POOL_MAX_SETS: u32 = 1000;
/// Proactively reset the pool once it is 80% used.
pub const DESCRIPTOR_POOL_RESET_THRESHOLD: u32 = DESCRIPTOR_POOL_MAX_SETS * 8 / 10;
/// Row pitch alignment for imported buffers
pub const DEFAULT_STRIDE_ALIGNMENT: u32 = 16;

/// Parameters for Backend creation.
pub struct CreateInfo {
    /// Application and engine name reported to the driver
    pub app_name: String,
    /// Extra instance extensions the caller needs on top of ours
    pub instance_extensions: Vec<CString>,
    /// Extra device extensions the caller needs on top of ours
    pub device_extensions: Vec<CString>,
    pub descriptor_max_sets: u32,
    pub descriptor_reset_threshold: u32,
    pub stride_alignment: u32,
}

impl Default for CreateInfo {
    fn default() -> Self {
        Self {
            app_name: "vkimport".to_string(),
            instance_extensions: Vec::new(),
            device_extensions: Vec::new(),
            descriptor_max_sets: DESCRIPTOR_POOL_MAX_SETS,
            descriptor_reset_threshold: DESCRIPTOR_POOL_RESET_THRESHOLD,
            stride_alignment: DEFAULT_STRIDE_ALIGNMENT,
        }
    }
}

impl CreateInfo {
    pub fn builder() -> CreateInfoBuilder {
        CreateInfoBuilder {
            ci: CreateInfo::default(),
        }
    }
}

/// Implements the builder pattern for easier backend creation
pub struct CreateInfoBuilder {
    ci: CreateInfo,
}

impl CreateInfoBuilder {
    pub fn app_name(mut self, name: &str) -> Self {
        self.ci.app_name = name.to_string();
        self
    }

    pub fn instance_extension(mut self, name: CString) -> Self {
        self.ci.instance_extensions.push(name);
        self
    }

    pub fn device_extension(mut self, name: CString) -> Self {
        self.ci.device_extensions.push(name);
        self
    }

    /// Size the descriptor pool. The reset threshold follows at 80%
    /// unless it is set explicitly afterwards.
    pub fn descriptor_max_sets(mut self, max_sets: u32) -> Self {
        self.ci.descriptor_max_sets = max_sets;
        self.ci.descriptor_reset_threshold = (max_sets as u64 * 8 / 10) as u32;
        self
    }

    pub fn descriptor_reset_threshold(mut self, threshold: u32) -> Self {
        self.ci.descriptor_reset_threshold = threshold;
        self
    }

    pub fn stride_alignment(mut self, align: u32) -> Self {
        self.ci.stride_alignment = align;
        self
    }

    pub fn build(self) -> CreateInfo {
        let mut ci = self.ci;
        if ci.descriptor_reset_threshold > ci.descriptor_max_sets {
            ci.descriptor_reset_threshold = ci.descriptor_max_sets;
        }
        if !ci.stride_alignment.is_power_of_two() {
            ci.stride_alignment = DEFAULT_STRIDE_ALIGNMENT;
        }
        ci
    }
}

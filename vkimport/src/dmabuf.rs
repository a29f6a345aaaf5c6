// Zero copy import of linux dmabufs
//
// Austin Shafer - 2021
use ash::vk;
use nix::fcntl::{fcntl, FcntlArg};

use crate::device::Device;
use crate::driver::{AllocationDesc, Driver, DrmModifierLayout, ImageDesc, SamplerDesc};
use crate::image::{Texture, TextureParts};
use crate::result::{check, result_to_string};
use crate::{Result, VkImportError};
use utils::log;
use utils::timing::PerfTimer;

use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd};
use std::rc::Rc;

const fn fourcc_code(a: u8, b: u8, c: u8, d: u8) -> u32 {
    (a as u32) | ((b as u32) << 8) | ((c as u32) << 16) | ((d as u32) << 24)
}

/// DRM fourcc pixel format codes, as found in drm_fourcc.h
pub struct DrmFourcc;

impl DrmFourcc {
    pub const ARGB8888: u32 = fourcc_code(b'A', b'R', b'2', b'4');
    pub const XRGB8888: u32 = fourcc_code(b'X', b'R', b'2', b'4');
    pub const ABGR8888: u32 = fourcc_code(b'A', b'B', b'2', b'4');
    pub const XBGR8888: u32 = fourcc_code(b'X', b'B', b'2', b'4');
    pub const RGB888: u32 = fourcc_code(b'R', b'G', b'2', b'4');
    pub const BGR888: u32 = fourcc_code(b'B', b'G', b'2', b'4');
    pub const RGB565: u32 = fourcc_code(b'R', b'G', b'1', b'6');
    pub const BGR565: u32 = fourcc_code(b'B', b'G', b'1', b'6');
    pub const ARGB2101010: u32 = fourcc_code(b'A', b'R', b'3', b'0');
    pub const XRGB2101010: u32 = fourcc_code(b'X', b'R', b'3', b'0');
    pub const ABGR2101010: u32 = fourcc_code(b'A', b'B', b'3', b'0');
    pub const XBGR2101010: u32 = fourcc_code(b'X', b'B', b'3', b'0');
    pub const ABGR16161616F: u32 = fourcc_code(b'A', b'B', b'4', b'H');
}

pub const DRM_FORMAT_MOD_LINEAR: u64 = 0;
pub const DRM_FORMAT_MOD_INVALID: u64 = 0x00ff_ffff_ffff_ffff;

/// Get the printable four character code for `format`
///
/// Codes with unprintable bytes are shown in hex instead.
pub fn fourcc_to_string(format: u32) -> String {
    let bytes = format.to_le_bytes();
    if bytes.iter().all(|b| b.is_ascii_graphic() || *b == b' ') {
        bytes.iter().map(|b| *b as char).collect()
    } else {
        format!("{:#010x}", format)
    }
}

pub(crate) fn fourcc_ref_to_string(format: &u32) -> String {
    fourcc_to_string(*format)
}

/// Map a DRM fourcc to the Vulkan format with the same memory layout
///
/// DRM codes name packed words from the most significant end while
/// Vulkan's UNORM names list bytes in memory order, so ARGB8888 is
/// B8G8R8A8. The X variants sample with whatever is in the padding
/// byte, callers that care force alpha themselves.
pub fn drm_format_to_vk(format: u32) -> Option<vk::Format> {
    Some(match format {
        DrmFourcc::ARGB8888 | DrmFourcc::XRGB8888 => vk::Format::B8G8R8A8_UNORM,
        DrmFourcc::ABGR8888 | DrmFourcc::XBGR8888 => vk::Format::R8G8B8A8_UNORM,
        DrmFourcc::RGB888 => vk::Format::R8G8B8_UNORM,
        DrmFourcc::BGR888 => vk::Format::B8G8R8_UNORM,
        DrmFourcc::RGB565 => vk::Format::R5G6B5_UNORM_PACK16,
        DrmFourcc::BGR565 => vk::Format::B5G6R5_UNORM_PACK16,
        DrmFourcc::ARGB2101010 | DrmFourcc::XRGB2101010 => vk::Format::A2R10G10B10_UNORM_PACK32,
        DrmFourcc::ABGR2101010 | DrmFourcc::XBGR2101010 => vk::Format::A2B10G10R10_UNORM_PACK32,
        DrmFourcc::ABGR16161616F => vk::Format::R16G16B16A16_SFLOAT,
        _ => return None,
    })
}

/// One plane of a dmabuf
#[derive(Debug)]
pub struct DmabufPlane {
    /// Still owned by the caller after import, we dup it
    pub fd: OwnedFd,
    pub offset: u32,
    pub stride: u32,
}

/// A dmabuf to import
#[derive(Debug)]
pub struct BufferAttributes {
    pub width: u32,
    pub height: u32,
    /// DRM fourcc
    pub format: u32,
    pub modifier: u64,
    pub planes: Vec<DmabufPlane>,
}

impl BufferAttributes {
    /// Describe a single plane linear dmabuf
    pub fn linear(fd: OwnedFd, width: u32, height: u32, format: u32, stride: u32) -> Self {
        Self {
            width: width,
            height: height,
            format: format,
            modifier: DRM_FORMAT_MOD_LINEAR,
            planes: vec![DmabufPlane {
                fd: fd,
                offset: 0,
                stride: stride,
            }],
        }
    }
}

/// Get every modifier the device supports for `format`
///
/// This is the count then fill pattern: the first call sizes the list
/// and the second one fills it in.
pub fn query_drm_format_modifiers(
    driver: &dyn Driver,
    format: vk::Format,
) -> Vec<vk::DrmFormatModifierPropertiesEXT> {
    let count = driver.drm_format_modifier_properties(format, None) as usize;
    if count == 0 {
        return Vec::new();
    }

    let mut mods = vec![vk::DrmFormatModifierPropertiesEXT::default(); count];
    let filled = driver.drm_format_modifier_properties(format, Some(mods.as_mut_slice())) as usize;
    mods.truncate(filled.min(count));
    mods
}

/// Choose the memory type to import a dmabuf into
///
/// `type_bits` is the set of types the import may use. In order of
/// preference we take device local and host visible, then device local,
/// then anything allowed.
pub fn select_dmabuf_memory_type(
    props: &vk::PhysicalDeviceMemoryProperties,
    type_bits: u32,
) -> Option<u32> {
    let count = props.memory_type_count as usize;
    let allowed = |i: usize| (type_bits >> i) & 1 == 1;

    let tiers = [
        vk::MemoryPropertyFlags::DEVICE_LOCAL | vk::MemoryPropertyFlags::HOST_VISIBLE,
        vk::MemoryPropertyFlags::DEVICE_LOCAL,
        vk::MemoryPropertyFlags::empty(),
    ];

    for flags in tiers.iter() {
        for (i, mem_type) in props.memory_types.iter().take(count).enumerate() {
            if allowed(i) && mem_type.property_flags.contains(*flags) {
                return Some(i as u32);
            }
        }
    }
    None
}

/// Dup a dmabuf fd so the import can consume the copy
fn dup_fd(fd: BorrowedFd<'_>) -> Result<OwnedFd> {
    let raw = fcntl(fd.as_raw_fd(), FcntlArg::F_DUPFD_CLOEXEC(0)).map_err(|e| {
        log::error!("Could not dup dmabuf fd {}: {}", fd.as_raw_fd(), e);
        VkImportError::INVALID_FD
    })?;
    // fcntl handed us a brand new descriptor nobody else owns
    Ok(unsafe { OwnedFd::from_raw_fd(raw) })
}

impl Device {
    /// Import a dmabuf as a sampleable texture
    ///
    /// The caller keeps ownership of every fd in `attrs`. On failure no
    /// Vulkan objects are left behind.
    ///
    /// The returned texture is in the UNDEFINED layout. It must be
    /// transitioned before it is sampled.
    pub fn import_dmabuf(self: &Rc<Self>, attrs: &BufferAttributes) -> Result<Texture> {
        let _timer = PerfTimer::new("import_dmabuf");

        if !self.d_caps.supports_dmabuf_import() {
            log::debug!("import_dmabuf: dmabuf import was not enabled for this device");
            return Err(VkImportError::DMABUF_NOT_SUPPORTED);
        }
        if attrs.width == 0 || attrs.height == 0 || attrs.planes.len() != 1 {
            log::error!(
                "import_dmabuf: bad dmabuf {}x{} with {} planes",
                attrs.width,
                attrs.height,
                attrs.planes.len()
            );
            return Err(VkImportError::INVALID_DMABUF);
        }

        let format = drm_format_to_vk(attrs.format).ok_or_else(|| {
            log::error!(
                "import_dmabuf: no Vulkan format for {}",
                fourcc_to_string(attrs.format)
            );
            VkImportError::UNSUPPORTED_FORMAT(attrs.format)
        })?;

        let driver = self.d_driver.as_ref();
        let modifiers = query_drm_format_modifiers(driver, format);
        let mod_props = modifiers
            .iter()
            .find(|m| m.drm_format_modifier == attrs.modifier)
            .ok_or_else(|| {
                log::error!(
                    "import_dmabuf: modifier {:#x} is not one of the {} supported for {}",
                    attrs.modifier,
                    modifiers.len(),
                    fourcc_to_string(attrs.format)
                );
                VkImportError::UNSUPPORTED_MODIFIER {
                    format: attrs.format,
                    modifier: attrs.modifier,
                }
            })?;
        if mod_props.drm_format_modifier_plane_count as usize != attrs.planes.len() {
            log::error!(
                "import_dmabuf: modifier {:#x} needs {} planes, got {}",
                attrs.modifier,
                mod_props.drm_format_modifier_plane_count,
                attrs.planes.len()
            );
            return Err(VkImportError::INVALID_DMABUF);
        }

        let plane_layouts: Vec<vk::SubresourceLayout> = attrs
            .planes
            .iter()
            .map(|p| vk::SubresourceLayout {
                offset: p.offset as vk::DeviceSize,
                // the driver works out the size
                size: 0,
                row_pitch: p.stride as vk::DeviceSize,
                array_pitch: 0,
                depth_pitch: 0,
            })
            .collect();

        let extent = vk::Extent2D {
            width: attrs.width,
            height: attrs.height,
        };

        let mut parts = TextureParts::new(driver);
        parts.image = check(
            "vkCreateImage",
            driver.create_image(&ImageDesc {
                format: format,
                extent: extent,
                usage: vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::TRANSFER_SRC,
                dmabuf: Some(DrmModifierLayout {
                    modifier: attrs.modifier,
                    planes: plane_layouts,
                }),
            }),
        )?;

        let reqs = driver.image_memory_requirements(parts.image);
        let dedicated = driver.image_dedicated_requirements(parts.image);

        // The import below consumes this copy, not the caller's fd
        let import_fd = dup_fd(attrs.planes[0].fd.as_fd())?;

        let mut type_bits = reqs.memory_type_bits;
        match driver.memory_fd_type_bits(import_fd.as_fd()) {
            Ok(fd_bits) if fd_bits & type_bits != 0 => type_bits &= fd_bits,
            Ok(fd_bits) => log::warn!(
                "import_dmabuf: fd memory types {:#x} don't overlap image types {:#x}",
                fd_bits,
                type_bits
            ),
            Err(e) => log::debug!(
                "import_dmabuf: vkGetMemoryFdPropertiesKHR failed: {}",
                result_to_string(e)
            ),
        }

        let mem_type = select_dmabuf_memory_type(&self.d_mem_props, type_bits).ok_or_else(|| {
            log::error!(
                "import_dmabuf: no memory type in {:#x} for {}",
                type_bits,
                fourcc_to_string(attrs.format)
            );
            VkImportError::NO_SUITABLE_MEMORY_TYPE
        })?;

        parts.memory = check(
            "vkAllocateMemory",
            driver.allocate_memory(AllocationDesc {
                size: reqs.size,
                memory_type_index: mem_type,
                import_fd: Some(import_fd),
                dedicated_image: match dedicated.wants_dedicated() {
                    true => Some(parts.image),
                    false => None,
                },
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

        log::debug!(
            "Imported {}x{} dmabuf {} modifier {:#x} (dedicated: {})",
            attrs.width,
            attrs.height,
            fourcc_to_string(attrs.format),
            attrs.modifier,
            dedicated.wants_dedicated()
        );
        Ok(parts.finish(self, extent, format, true))
    }
}

// Textures for X11 pixmaps
//
// A pixmap is shared with the GPU through DRI3 when the server and the
// device allow it. Otherwise its contents are read back with GetImage
// and uploaded through a staging buffer.
//
// Austin Shafer - 2021
use ash::vk;

use crate::buffer::StagingBuffer;
use crate::device::Device;
use crate::dmabuf::{fourcc_to_string, BufferAttributes, DrmFourcc};
use crate::image::Texture;
use crate::{Result, VkImportError};
use utils::log;
use utils::region::{Rect, Region};
use utils::timing::PerfTimer;

use std::os::fd::OwnedFd;
use std::rc::Rc;

mod xcb;
pub use xcb::X11PixmapSource;

/// Size and depth of a pixmap
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct PixmapGeometry {
    pub width: u32,
    pub height: u32,
    pub depth: u8,
}

/// The reply to DRI3 BufferFromPixmap
#[derive(Debug)]
pub struct Dri3Buffer {
    pub fd: OwnedFd,
    pub width: u32,
    pub height: u32,
    pub stride: u32,
    pub size: u32,
    pub depth: u8,
    pub bpp: u8,
}

/// Pixels read back from a pixmap in ZPixmap format
///
/// Rows are padded to 32 bits and pixels are in LSB first byte order.
#[derive(Debug, Clone)]
pub struct PixmapImage {
    pub width: u32,
    pub height: u32,
    pub depth: u8,
    pub data: Vec<u8>,
}

/// The window system requests a surface texture makes
pub trait PixmapSource {
    fn geometry(&self, pixmap: u32) -> Result<PixmapGeometry>;
    /// Whether DRI3 1.0 is usable. Implementations query this once.
    fn has_dri3(&self) -> bool;
    fn buffer_from_pixmap(&self, pixmap: u32) -> Result<Dri3Buffer>;
    fn get_image(&self, pixmap: u32, rect: &Rect<i32>) -> Result<PixmapImage>;
}

/// The DRM format pixmaps of `depth` are stored in
pub fn depth_to_drm_format(depth: u8) -> Result<u32> {
    match depth {
        32 => Ok(DrmFourcc::ARGB8888),
        24 => Ok(DrmFourcc::XRGB8888),
        30 => Ok(DrmFourcc::XRGB2101010),
        16 => Ok(DrmFourcc::RGB565),
        _ => {
            log::error!("Pixmaps with depth {} are not supported", depth);
            Err(VkImportError::UNSUPPORTED_DEPTH(depth))
        }
    }
}

pub(crate) fn bytes_per_pixel(depth: u8) -> usize {
    match depth {
        16 => 2,
        _ => 4,
    }
}

/// Row pitch of a ZPixmap image with 32 bit scanline padding
pub(crate) fn zpixmap_stride(width: u32, depth: u8) -> usize {
    utils::align_up(width * bytes_per_pixel(depth) as u32, 4) as usize
}

/// Expand a 5 or 6 bit channel to 8 bits
fn expand_bits(val: u32, bits: u32) -> u8 {
    let v = val << (8 - bits);
    (v | (v >> bits)) as u8
}

/// Convert rows of `depth` pixels to BGRA8 with alpha forced opaque
///
/// Depth 24 pixels have an undefined padding byte and most depth 32
/// clients never write alpha, so neither can be trusted.
pub(crate) fn copy_opaque_rows(
    src: &[u8],
    src_stride: usize,
    depth: u8,
    width: usize,
    height: usize,
    dst: &mut [u8],
    dst_stride: usize,
) {
    let bpp = bytes_per_pixel(depth);

    for row in 0..height {
        let src_row = &src[row * src_stride..row * src_stride + width * bpp];
        let dst_row = &mut dst[row * dst_stride..row * dst_stride + width * 4];

        for (s, d) in src_row.chunks_exact(bpp).zip(dst_row.chunks_exact_mut(4)) {
            match depth {
                16 => {
                    let w = u16::from_le_bytes([s[0], s[1]]) as u32;
                    d[0] = expand_bits(w & 0x1f, 5);
                    d[1] = expand_bits((w >> 5) & 0x3f, 6);
                    d[2] = expand_bits((w >> 11) & 0x1f, 5);
                }
                30 => {
                    let w = u32::from_le_bytes([s[0], s[1], s[2], s[3]]);
                    d[0] = ((w & 0x3ff) >> 2) as u8;
                    d[1] = (((w >> 10) & 0x3ff) >> 2) as u8;
                    d[2] = (((w >> 20) & 0x3ff) >> 2) as u8;
                }
                _ => d[..3].copy_from_slice(&s[..3]),
            }
            d[3] = 0xff;
        }
    }
}

/// Describe a DRI3 buffer as a dmabuf, with its stride aligned
pub(crate) fn dmabuf_attributes(buf: Dri3Buffer, drm_format: u32, align: u32) -> BufferAttributes {
    let bytes_pp = match buf.bpp {
        0 => 4,
        bpp => (bpp as u32 + 7) / 8,
    };
    if buf.stride < buf.width * bytes_pp {
        log::warn!(
            "DRI3 stride {} is less than width {} * {} bytes",
            buf.stride,
            buf.width,
            bytes_pp
        );
    }
    if (buf.size as u64) < buf.stride as u64 * buf.height as u64 {
        log::warn!(
            "DRI3 buffer size {} is less than stride {} * height {}",
            buf.size,
            buf.stride,
            buf.height
        );
    }

    let stride = utils::align_up(buf.stride, align);
    BufferAttributes::linear(buf.fd, buf.width, buf.height, drm_format, stride)
}

/// The copy from staging buffer to image for `rect`
///
/// The staging buffer always holds the whole surface at full stride,
/// so the row length is the surface width no matter how wide `rect` is.
pub(crate) fn upload_copy_region(rect: &Rect<i32>, width: u32, height: u32) -> vk::BufferImageCopy {
    let subresource = vk::ImageSubresourceLayers {
        aspect_mask: vk::ImageAspectFlags::COLOR,
        mip_level: 0,
        base_array_layer: 0,
        layer_count: 1,
    };

    let full = rect.r_pos == (0, 0) && rect.r_size == (width as i32, height as i32);
    if full {
        return vk::BufferImageCopy {
            buffer_offset: 0,
            buffer_row_length: 0,
            buffer_image_height: 0,
            image_subresource: subresource,
            image_offset: vk::Offset3D { x: 0, y: 0, z: 0 },
            image_extent: vk::Extent3D {
                width: width,
                height: height,
                depth: 1,
            },
        };
    }

    let (x, y) = (rect.r_pos.0 as u64, rect.r_pos.1 as u64);
    vk::BufferImageCopy {
        buffer_offset: (y * width as u64 + x) * 4,
        buffer_row_length: width,
        buffer_image_height: height,
        image_subresource: subresource,
        image_offset: vk::Offset3D {
            x: rect.r_pos.0,
            y: rect.r_pos.1,
            z: 0,
        },
        image_extent: vk::Extent3D {
            width: rect.r_size.0 as u32,
            height: rect.r_size.1 as u32,
            depth: 1,
        },
    }
}

enum SurfaceState {
    Uncreated,
    DmaBuf(Texture),
    CpuUpload {
        staging: StagingBuffer,
        texture: Texture,
    },
}

/// A texture that follows the contents of an X11 pixmap
///
/// `create` picks zero copy import when possible and the CPU upload
/// path otherwise. After the pixmap is resized or destroyed call
/// `reset`, and `create` again for the new pixmap.
pub struct SurfaceTextureX11 {
    st_dev: Rc<Device>,
    st_source: Rc<dyn PixmapSource>,
    st_pixmap: u32,
    st_size: (u32, u32),
    st_depth: u8,
    st_state: SurfaceState,
}

impl SurfaceTextureX11 {
    pub fn new(dev: &Rc<Device>, source: Rc<dyn PixmapSource>, pixmap: u32) -> Self {
        Self {
            st_dev: dev.clone(),
            st_source: source,
            st_pixmap: pixmap,
            st_size: (0, 0),
            st_depth: 0,
            st_state: SurfaceState::Uncreated,
        }
    }

    pub fn pixmap(&self) -> u32 {
        self.st_pixmap
    }

    pub fn size(&self) -> (u32, u32) {
        self.st_size
    }

    pub fn depth(&self) -> u8 {
        self.st_depth
    }

    pub fn is_created(&self) -> bool {
        !matches!(self.st_state, SurfaceState::Uncreated)
    }

    pub fn is_dmabuf(&self) -> bool {
        matches!(self.st_state, SurfaceState::DmaBuf(_))
    }

    pub fn texture(&self) -> Option<&Texture> {
        match &self.st_state {
            SurfaceState::Uncreated => None,
            SurfaceState::DmaBuf(t) => Some(t),
            SurfaceState::CpuUpload { texture, .. } => Some(texture),
        }
    }

    /// Release the texture and go back to the uncreated state
    pub fn reset(&mut self) {
        self.st_state = SurfaceState::Uncreated;
        self.st_size = (0, 0);
        self.st_depth = 0;
    }

    /// Make the texture for this pixmap
    ///
    /// A failed dmabuf import is not an error, the CPU path is used
    /// instead. Failing to set up the CPU path is.
    pub fn create(&mut self) -> Result<()> {
        if self.is_created() {
            return Ok(());
        }

        let geom = self.st_source.geometry(self.st_pixmap)?;
        if geom.width == 0 || geom.height == 0 {
            log::error!("Pixmap {:#x} has no area", self.st_pixmap);
            return Err(VkImportError::INVALID_SURFACE);
        }
        let drm_format = depth_to_drm_format(geom.depth)?;
        self.st_size = (geom.width, geom.height);
        self.st_depth = geom.depth;

        if self.st_source.has_dri3() && self.st_dev.capabilities().supports_dmabuf_import() {
            match self.create_with_dmabuf(drm_format) {
                Ok(texture) => {
                    self.st_state = SurfaceState::DmaBuf(texture);
                    return Ok(());
                }
                Err(e) => log::debug!(
                    "Pixmap {:#x}: dmabuf import failed ({}), using CPU upload",
                    self.st_pixmap,
                    e
                ),
            }
        }

        if let Err(e) = self.create_with_cpu_upload() {
            log::error!("Pixmap {:#x}: CPU upload setup failed: {}", self.st_pixmap, e);
            self.reset();
            return Err(e);
        }
        Ok(())
    }

    fn create_with_dmabuf(&self, drm_format: u32) -> Result<Texture> {
        let buf = self.st_source.buffer_from_pixmap(self.st_pixmap)?;
        if buf.depth != self.st_depth {
            log::warn!(
                "Pixmap {:#x}: DRI3 depth {} differs from geometry depth {}",
                self.st_pixmap,
                buf.depth,
                self.st_depth
            );
        }

        let attrs = dmabuf_attributes(buf, drm_format, self.st_dev.d_stride_alignment);
        let mut texture = self.st_dev.import_dmabuf(&attrs)?;
        if (texture.width(), texture.height()) != self.st_size {
            log::warn!(
                "Pixmap {:#x}: imported {}x{} but the pixmap is {}x{}",
                self.st_pixmap,
                texture.width(),
                texture.height(),
                self.st_size.0,
                self.st_size.1
            );
        }

        self.st_dev.with_single_time_commands(|cbuf| {
            texture.transition_to(cbuf, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
            Ok(())
        })?;

        log::debug!(
            "Pixmap {:#x}: zero copy {} texture",
            self.st_pixmap,
            fourcc_to_string(drm_format)
        );
        Ok(texture)
    }

    fn create_with_cpu_upload(&mut self) -> Result<()> {
        let (width, height) = self.st_size;
        // sRGB so sampling hands the shaders linear values
        let texture = Texture::allocate(
            &self.st_dev,
            width,
            height,
            vk::Format::B8G8R8A8_SRGB,
            vk::ImageUsageFlags::TRANSFER_DST | vk::ImageUsageFlags::SAMPLED,
        )?;
        let staging = StagingBuffer::new(&self.st_dev, width as u64 * height as u64 * 4)?;
        self.st_state = SurfaceState::CpuUpload {
            staging: staging,
            texture: texture,
        };

        log::debug!(
            "Pixmap {:#x}: CPU upload texture {}x{}",
            self.st_pixmap,
            width,
            height
        );
        // Fill the whole thing once so it is never sampled undefined
        self.update(&Region::from(Rect::new(0, 0, width as i32, height as i32)))
    }

    /// Bring the texture up to date with the damaged `region`
    ///
    /// Dmabuf textures share memory with the pixmap and need nothing.
    /// Otherwise the bounding box of the damage is read back in one
    /// request and uploaded.
    pub fn update(&mut self, region: &Region) -> Result<()> {
        let (width, height) = self.st_size;
        let (staging, texture) = match &mut self.st_state {
            SurfaceState::Uncreated => return Err(VkImportError::INVALID_SURFACE),
            SurfaceState::DmaBuf(_) => return Ok(()),
            SurfaceState::CpuUpload { staging, texture } => (staging, texture),
        };

        let bounds = Rect::new(0, 0, width as i32, height as i32);
        let rect = match region
            .bounding_rect()
            .and_then(|r| r.intersection(&bounds))
        {
            Some(r) => r,
            None => return Ok(()),
        };

        let _timer = PerfTimer::new("x11 cpu upload");
        let image = self.st_source.get_image(self.st_pixmap, &rect)?;
        let (rw, rh) = (rect.r_size.0 as usize, rect.r_size.1 as usize);
        let src_stride = zpixmap_stride(rw as u32, image.depth);
        if image.data.len() < src_stride * rh {
            log::error!(
                "GetImage returned {} bytes for a {}x{} depth {} rect",
                image.data.len(),
                rw,
                rh,
                image.depth
            );
            return Err(VkImportError::X11_ERROR("short GetImage reply".to_string()));
        }

        let dst_stride = width as usize * 4;
        let dst_offset = (rect.r_pos.1 as usize * width as usize + rect.r_pos.0 as usize) * 4;
        staging.write_with(|mem| {
            copy_opaque_rows(
                &image.data,
                src_stride,
                image.depth,
                rw,
                rh,
                &mut mem[dst_offset..],
                dst_stride,
            )
        })?;

        let copy = upload_copy_region(&rect, width, height);
        let driver = self.st_dev.driver();
        let buffer = staging.buffer();
        let orig_layout = texture.current_layout();
        let ret = self.st_dev.with_single_time_commands(|cbuf| {
            texture.transition_to(cbuf, vk::ImageLayout::TRANSFER_DST_OPTIMAL);
            driver.cmd_copy_buffer_to_image(
                cbuf,
                buffer,
                texture.image(),
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &copy,
            );
            texture.transition_to(cbuf, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
            Ok(())
        });

        if let Err(e) = &ret {
            log::error!("CPU upload of {:?} failed: {}", rect, e);
            texture.restore_layout(orig_layout);
        }
        ret
    }
}

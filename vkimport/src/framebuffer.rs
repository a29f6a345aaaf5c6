// Offscreen framebuffers and copies out of them
//
// Austin Shafer - 2021
use ash::vk;

use crate::device::Device;
use crate::image::Texture;
use crate::{Result, VkImportError};
use utils::log;
use utils::region::{Rect, Region};

use std::cell::{Ref, RefCell};
use std::rc::Rc;

struct FramebufferInternal {
    fb_color: Texture,
    /// Where copy_pixels writes to. Made the first time it is needed.
    fb_preserve: Option<Texture>,
    /// Render target handle for the caller's render pass. Not owned.
    fb_target: vk::Framebuffer,
}

/// An offscreen render target
///
/// This is a reference counted handle, clones refer to the same
/// framebuffer. Compare them with `ptr_eq`.
#[derive(Clone)]
pub struct Framebuffer {
    fb_internal: Rc<RefCell<FramebufferInternal>>,
}

impl Framebuffer {
    /// Wrap an existing colour texture
    pub fn new(color: Texture, target: vk::Framebuffer) -> Self {
        Self {
            fb_internal: Rc::new(RefCell::new(FramebufferInternal {
                fb_color: color,
                fb_preserve: None,
                fb_target: target,
            })),
        }
    }

    /// Allocate a colour texture usable as a render target and as the
    /// source of copies
    pub fn allocate(dev: &Rc<Device>, width: u32, height: u32, format: vk::Format) -> Result<Self> {
        let color = Texture::allocate(
            dev,
            width,
            height,
            format,
            vk::ImageUsageFlags::COLOR_ATTACHMENT
                | vk::ImageUsageFlags::TRANSFER_SRC
                | vk::ImageUsageFlags::SAMPLED,
        )?;
        Ok(Self::new(color, vk::Framebuffer::null()))
    }

    pub fn ptr_eq(&self, other: &Framebuffer) -> bool {
        Rc::ptr_eq(&self.fb_internal, &other.fb_internal)
    }

    pub fn color(&self) -> Ref<Texture> {
        Ref::map(self.fb_internal.borrow(), |i| &i.fb_color)
    }

    /// The copy made by the last `copy_pixels`, if there was one
    pub fn preserved(&self) -> Option<Ref<Texture>> {
        Ref::filter_map(self.fb_internal.borrow(), |i| i.fb_preserve.as_ref()).ok()
    }

    pub fn target(&self) -> vk::Framebuffer {
        self.fb_internal.borrow().fb_target
    }

    pub fn width(&self) -> u32 {
        self.fb_internal.borrow().fb_color.width()
    }

    pub fn height(&self) -> u32 {
        self.fb_internal.borrow().fb_color.height()
    }
}

/// The stack of bound offscreen targets
///
/// Rendering goes to whatever is on top. Pushes and pops must be
/// balanced by the caller.
pub struct FramebufferStack {
    fs_stack: Vec<Framebuffer>,
}

impl FramebufferStack {
    pub fn new() -> Self {
        Self {
            fs_stack: Vec::new(),
        }
    }

    pub fn push(&mut self, fb: Framebuffer) {
        self.fs_stack.push(fb);
    }

    pub fn pop(&mut self) -> Result<Framebuffer> {
        self.fs_stack.pop().ok_or_else(|| {
            log::error!("Tried to pop a framebuffer off an empty stack");
            VkImportError::FRAMEBUFFER_STACK_UNDERFLOW
        })
    }

    pub fn current(&self) -> Option<Framebuffer> {
        self.fs_stack.last().cloned()
    }

    pub fn depth(&self) -> usize {
        self.fs_stack.len()
    }

    pub fn clear(&mut self) {
        self.fs_stack.clear();
    }
}

/// Build the blit for one rect given in top-left origin coordinates
///
/// The blit works in the framebuffer's bottom-left origin space, so the
/// rect is flipped against `screen_height`. Source and destination
/// regions are the same.
pub(crate) fn flipped_blit(rect: &Rect<i32>, screen_height: i32) -> vk::ImageBlit {
    let (x, y) = rect.r_pos;
    let (w, h) = rect.r_size;
    let y0 = screen_height - y - h;
    let y1 = screen_height - y;

    let offsets = [
        vk::Offset3D { x: x, y: y0, z: 0 },
        vk::Offset3D {
            x: x + w,
            y: y1,
            z: 1,
        },
    ];
    let subresource = vk::ImageSubresourceLayers {
        aspect_mask: vk::ImageAspectFlags::COLOR,
        mip_level: 0,
        base_array_layer: 0,
        layer_count: 1,
    };

    vk::ImageBlit {
        src_subresource: subresource,
        src_offsets: offsets,
        dst_subresource: subresource,
        dst_offsets: offsets,
    }
}

impl Device {
    pub fn push_framebuffer(&self, fb: Framebuffer) {
        self.with_fb_stack(|stack| stack.push(fb))
    }

    pub fn pop_framebuffer(&self) -> Result<Framebuffer> {
        self.with_fb_stack(|stack| stack.pop())
    }

    pub fn current_framebuffer(&self) -> Option<Framebuffer> {
        self.with_fb_stack(|stack| stack.current())
    }

    pub fn framebuffer_depth(&self) -> usize {
        self.with_fb_stack(|stack| stack.depth())
    }

    /// Drop every framebuffer on the stack
    ///
    /// Framebuffers keep the device alive, so this has to happen
    /// before the device can be torn down.
    pub fn clear_framebuffers(&self) {
        let depth = self.with_fb_stack(|stack| {
            let depth = stack.depth();
            stack.clear();
            depth
        });
        if depth > 0 {
            log::debug!("Dropped {} framebuffers still on the stack", depth);
        }
    }

    /// Copy `region` of the current framebuffer into its preservation
    /// texture
    ///
    /// `region` is in top-left origin screen coordinates and is clipped
    /// to both `screen_size` and the framebuffer. Every rect is copied with a nearest filter. The
    /// copy reads from the framebuffer and writes to a separate image,
    /// so overlapping rects are fine.
    ///
    /// Afterwards the framebuffer is back in the layout it started in
    /// and the preservation texture is ready to be sampled.
    /// If the submission fails the tracked layouts are left as they were.
    pub fn copy_pixels(self: &Rc<Self>, region: &Region, screen_size: (u32, u32)) -> Result<()> {
        let fb = match self.current_framebuffer() {
            Some(fb) => fb,
            None => {
                log::debug!("copy_pixels: no framebuffer is bound");
                return Ok(());
            }
        };

        // Flip against the clipped height so the blit stays in the image
        let screen_w = screen_size.0.min(fb.width()) as i32;
        let screen_h = screen_size.1.min(fb.height()) as i32;
        let bounds = Rect::new(0, 0, screen_w, screen_h);
        let rects: Vec<Rect<i32>> = region
            .iter()
            .filter_map(|r| r.intersection(&bounds))
            .collect();
        if rects.is_empty() {
            return Ok(());
        }

        let mut internal = fb.fb_internal.borrow_mut();
        let FramebufferInternal {
            fb_color: color,
            fb_preserve: preserve,
            ..
        } = &mut *internal;

        if preserve.is_none() {
            *preserve = Some(Texture::allocate(
                self,
                color.width(),
                color.height(),
                color.format(),
                vk::ImageUsageFlags::TRANSFER_DST | vk::ImageUsageFlags::SAMPLED,
            )?);
        }
        let preserve = match preserve.as_mut() {
            Some(p) => p,
            None => return Err(VkImportError::INVALID),
        };

        let driver = self.d_driver.as_ref();
        let orig_layout = color.current_layout();
        let preserve_layout = preserve.current_layout();
        let ret = self.with_single_time_commands(|cbuf| {
            color.transition_to(cbuf, vk::ImageLayout::TRANSFER_SRC_OPTIMAL);
            preserve.transition_to(cbuf, vk::ImageLayout::TRANSFER_DST_OPTIMAL);

            for rect in rects.iter() {
                let blit = flipped_blit(rect, screen_h);
                driver.cmd_blit_image(
                    cbuf,
                    color.image(),
                    vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                    preserve.image(),
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    &blit,
                    vk::Filter::NEAREST,
                );
            }

            // One barrier for all of the blits
            preserve.memory_barrier(
                cbuf,
                vk::AccessFlags::TRANSFER_WRITE,
                vk::AccessFlags::TRANSFER_READ
                    | vk::AccessFlags::COLOR_ATTACHMENT_READ
                    | vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
                vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::TRANSFER
                    | vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            );

            if orig_layout != vk::ImageLayout::UNDEFINED {
                color.transition_to(cbuf, orig_layout);
            }
            preserve.transition_to(cbuf, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
            Ok(())
        });

        if ret.is_err() {
            color.restore_layout(orig_layout);
            preserve.restore_layout(preserve_layout);
        }
        ret
    }
}

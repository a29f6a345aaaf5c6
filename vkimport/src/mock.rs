// A recording Driver for tests
//
// Handles are made up counters. Every create/destroy pair is counted per
// object kind so tests can check nothing leaks, and every call is logged
// by name so tests can check what was (and wasn't) called.
//
// Austin Shafer - 2021
use ash::prelude::VkResult;
use ash::vk::{self, Handle};

use crate::device::Device;
use crate::driver::{AllocationDesc, DedicatedRequirements, Driver, ImageDesc, SamplerDesc};
use crate::platform::DeviceCapabilities;
use crate::{CreateInfo, Result, VkImportError};
use utils::region::Rect;

#[cfg(feature = "x11")]
use crate::x11::{Dri3Buffer, PixmapGeometry, PixmapImage, PixmapSource};

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::os::fd::{BorrowedFd, OwnedFd};
use std::rc::Rc;

pub(crate) const TILED_MODIFIER: u64 = 0x0100_0000_0000_0001;

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct AllocRecord {
    pub size: vk::DeviceSize,
    pub memory_type_index: u32,
    pub imported: bool,
    pub dedicated: bool,
}

pub(crate) struct MockState {
    next_handle: u64,
    live: HashMap<&'static str, i64>,
    pub calls: Vec<&'static str>,
    /// Calls that should fail and what they fail with
    pub fail: HashMap<&'static str, vk::Result>,
    /// Results for upcoming descriptor set allocations, front first
    pub descriptor_results: VecDeque<vk::Result>,
    pub mem_props: vk::PhysicalDeviceMemoryProperties,
    pub modifiers: Vec<vk::DrmFormatModifierPropertiesEXT>,
    pub dedicated: DedicatedRequirements,
    pub image_type_bits: u32,
    pub fd_type_bits: VkResult<u32>,
    image_extents: HashMap<u64, vk::Extent2D>,
    buffer_sizes: HashMap<u64, vk::DeviceSize>,
    memory: HashMap<u64, Vec<u8>>,
    /// fds owned by "the implementation" after a successful import
    imported_fds: HashMap<u64, OwnedFd>,
    pub image_descs: Vec<ImageDesc>,
    pub allocations: Vec<AllocRecord>,
    pub barriers: Vec<(vk::ImageLayout, vk::ImageLayout)>,
    pub blits: Vec<(vk::Image, vk::Image, vk::ImageBlit, vk::Filter)>,
    pub copies: Vec<vk::BufferImageCopy>,
    pub flushes: u32,
}

pub(crate) fn memory_properties(flags: &[vk::MemoryPropertyFlags]) -> vk::PhysicalDeviceMemoryProperties {
    let mut props = vk::PhysicalDeviceMemoryProperties::default();
    for (i, f) in flags.iter().enumerate() {
        props.memory_types[i].property_flags = *f;
        props.memory_types[i].heap_index = 0;
    }
    props.memory_type_count = flags.len() as u32;
    props.memory_heap_count = 1;
    props
}

fn modifier(modifier: u64) -> vk::DrmFormatModifierPropertiesEXT {
    vk::DrmFormatModifierPropertiesEXT {
        drm_format_modifier: modifier,
        drm_format_modifier_plane_count: 1,
        drm_format_modifier_tiling_features: vk::FormatFeatureFlags::SAMPLED_IMAGE,
    }
}

impl MockState {
    fn new() -> Self {
        Self {
            next_handle: 1,
            live: HashMap::new(),
            calls: Vec::new(),
            fail: HashMap::new(),
            descriptor_results: VecDeque::new(),
            mem_props: memory_properties(&[
                vk::MemoryPropertyFlags::DEVICE_LOCAL,
                vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
                vk::MemoryPropertyFlags::DEVICE_LOCAL | vk::MemoryPropertyFlags::HOST_VISIBLE,
            ]),
            modifiers: vec![modifier(crate::DRM_FORMAT_MOD_LINEAR), modifier(TILED_MODIFIER)],
            dedicated: DedicatedRequirements::default(),
            image_type_bits: 0b111,
            fd_type_bits: Ok(0b111),
            image_extents: HashMap::new(),
            buffer_sizes: HashMap::new(),
            memory: HashMap::new(),
            imported_fds: HashMap::new(),
            image_descs: Vec::new(),
            allocations: Vec::new(),
            barriers: Vec::new(),
            blits: Vec::new(),
            copies: Vec::new(),
            flushes: 0,
        }
    }

    pub fn live(&self, kind: &str) -> i64 {
        self.live.get(kind).cloned().unwrap_or(0)
    }

    /// Snapshot of every live object count
    pub fn live_counts(&self) -> HashMap<&'static str, i64> {
        self.live.iter().filter(|(_, c)| **c != 0).map(|(k, c)| (*k, *c)).collect()
    }

    pub fn count_calls(&self, name: &str) -> usize {
        self.calls.iter().filter(|c| **c == name).count()
    }

    pub fn imported_fd_count(&self) -> usize {
        self.imported_fds.len()
    }

    /// Contents of an allocation that is `size` bytes long
    pub fn memory_contents(&self, size: usize) -> Option<&Vec<u8>> {
        self.memory.values().find(|m| m.len() == size)
    }

    fn create(&mut self, kind: &'static str) -> u64 {
        *self.live.entry(kind).or_insert(0) += 1;
        let h = self.next_handle;
        self.next_handle += 1;
        h
    }

    fn destroy(&mut self, kind: &'static str, raw: u64) {
        assert!(raw != 0, "destroying a null {}", kind);
        let count = self.live.entry(kind).or_insert(0);
        *count -= 1;
        assert!(*count >= 0, "{} destroyed more times than created", kind);
    }
}

/// The Driver side, owned by the Device
pub(crate) struct MockDriver {
    md_state: Rc<RefCell<MockState>>,
}

impl MockDriver {
    fn call(&self, name: &'static str) -> VkResult<()> {
        let mut state = self.md_state.borrow_mut();
        state.calls.push(name);
        match state.fail.get(name) {
            Some(err) => Err(*err),
            None => Ok(()),
        }
    }

    fn log(&self, name: &'static str) {
        self.md_state.borrow_mut().calls.push(name);
    }

    fn create(&self, kind: &'static str) -> u64 {
        self.md_state.borrow_mut().create(kind)
    }

    fn destroy(&self, kind: &'static str, raw: u64) {
        self.md_state.borrow_mut().destroy(kind, raw)
    }
}

impl Driver for MockDriver {
    fn memory_properties(&self) -> vk::PhysicalDeviceMemoryProperties {
        self.md_state.borrow().mem_props
    }

    fn drm_format_modifier_properties(
        &self,
        _format: vk::Format,
        out: Option<&mut [vk::DrmFormatModifierPropertiesEXT]>,
    ) -> u32 {
        self.log("drm_format_modifier_properties");
        let state = self.md_state.borrow();
        match out {
            Some(out) => {
                let n = out.len().min(state.modifiers.len());
                out[..n].copy_from_slice(&state.modifiers[..n]);
                n as u32
            }
            None => state.modifiers.len() as u32,
        }
    }

    fn memory_fd_type_bits(&self, fd: BorrowedFd<'_>) -> VkResult<u32> {
        self.log("memory_fd_type_bits");
        assert!(nix::fcntl::fcntl(
            std::os::fd::AsRawFd::as_raw_fd(&fd),
            nix::fcntl::FcntlArg::F_GETFD
        )
        .is_ok());
        self.md_state.borrow().fd_type_bits
    }

    fn create_image(&self, desc: &ImageDesc) -> VkResult<vk::Image> {
        self.call("create_image")?;
        let mut state = self.md_state.borrow_mut();
        let raw = state.create("image");
        state.image_extents.insert(raw, desc.extent);
        state.image_descs.push(desc.clone());
        Ok(vk::Image::from_raw(raw))
    }

    fn destroy_image(&self, image: vk::Image) {
        self.log("destroy_image");
        self.destroy("image", image.as_raw())
    }

    fn image_memory_requirements(&self, image: vk::Image) -> vk::MemoryRequirements {
        let state = self.md_state.borrow();
        let extent = state
            .image_extents
            .get(&image.as_raw())
            .cloned()
            .unwrap_or_default();
        // Padded to a page so images are never the size of a buffer
        let size = extent.width as u64 * extent.height as u64 * 4;
        vk::MemoryRequirements {
            size: (size + 4095) / 4096 * 4096,
            alignment: 256,
            memory_type_bits: state.image_type_bits,
        }
    }

    fn image_dedicated_requirements(&self, _image: vk::Image) -> DedicatedRequirements {
        self.md_state.borrow().dedicated
    }

    fn bind_image_memory(&self, _image: vk::Image, _memory: vk::DeviceMemory) -> VkResult<()> {
        self.call("bind_image_memory")
    }

    fn create_image_view(&self, _image: vk::Image, _format: vk::Format) -> VkResult<vk::ImageView> {
        self.call("create_image_view")?;
        Ok(vk::ImageView::from_raw(self.create("image_view")))
    }

    fn destroy_image_view(&self, view: vk::ImageView) {
        self.log("destroy_image_view");
        self.destroy("image_view", view.as_raw())
    }

    fn create_sampler(&self, _desc: &SamplerDesc) -> VkResult<vk::Sampler> {
        self.call("create_sampler")?;
        Ok(vk::Sampler::from_raw(self.create("sampler")))
    }

    fn destroy_sampler(&self, sampler: vk::Sampler) {
        self.log("destroy_sampler");
        self.destroy("sampler", sampler.as_raw())
    }

    fn create_buffer(
        &self,
        size: vk::DeviceSize,
        _usage: vk::BufferUsageFlags,
    ) -> VkResult<vk::Buffer> {
        self.call("create_buffer")?;
        let mut state = self.md_state.borrow_mut();
        let raw = state.create("buffer");
        state.buffer_sizes.insert(raw, size);
        Ok(vk::Buffer::from_raw(raw))
    }

    fn destroy_buffer(&self, buffer: vk::Buffer) {
        self.log("destroy_buffer");
        self.destroy("buffer", buffer.as_raw())
    }

    fn buffer_memory_requirements(&self, buffer: vk::Buffer) -> vk::MemoryRequirements {
        let state = self.md_state.borrow();
        vk::MemoryRequirements {
            size: state.buffer_sizes.get(&buffer.as_raw()).cloned().unwrap_or(0),
            alignment: 256,
            memory_type_bits: !0,
        }
    }

    fn bind_buffer_memory(&self, _buffer: vk::Buffer, _memory: vk::DeviceMemory) -> VkResult<()> {
        self.call("bind_buffer_memory")
    }

    fn allocate_memory(&self, desc: AllocationDesc) -> VkResult<vk::DeviceMemory> {
        // On failure desc is dropped here, closing any import fd
        self.call("allocate_memory")?;
        let mut state = self.md_state.borrow_mut();
        let raw = state.create("memory");
        state.allocations.push(AllocRecord {
            size: desc.size,
            memory_type_index: desc.memory_type_index,
            imported: desc.import_fd.is_some(),
            dedicated: desc.dedicated_image.is_some(),
        });
        state.memory.insert(raw, vec![0; desc.size as usize]);
        if let Some(fd) = desc.import_fd {
            state.imported_fds.insert(raw, fd);
        }
        Ok(vk::DeviceMemory::from_raw(raw))
    }

    fn free_memory(&self, memory: vk::DeviceMemory) {
        self.log("free_memory");
        let mut state = self.md_state.borrow_mut();
        state.memory.remove(&memory.as_raw());
        state.imported_fds.remove(&memory.as_raw());
        state.destroy("memory", memory.as_raw());
    }

    fn map_memory(&self, memory: vk::DeviceMemory, size: vk::DeviceSize) -> VkResult<*mut u8> {
        self.call("map_memory")?;
        let mut state = self.md_state.borrow_mut();
        let mem = state
            .memory
            .get_mut(&memory.as_raw())
            .ok_or(vk::Result::ERROR_MEMORY_MAP_FAILED)?;
        assert!(size as usize <= mem.len());
        Ok(mem.as_mut_ptr())
    }

    fn unmap_memory(&self, _memory: vk::DeviceMemory) {
        self.log("unmap_memory")
    }

    fn flush_memory(&self, _memory: vk::DeviceMemory) -> VkResult<()> {
        self.call("flush_memory")?;
        self.md_state.borrow_mut().flushes += 1;
        Ok(())
    }

    fn create_command_pool(&self, _queue_family: u32) -> VkResult<vk::CommandPool> {
        self.call("create_command_pool")?;
        Ok(vk::CommandPool::from_raw(self.create("command_pool")))
    }

    fn destroy_command_pool(&self, pool: vk::CommandPool) {
        self.log("destroy_command_pool");
        self.destroy("command_pool", pool.as_raw())
    }

    fn allocate_command_buffer(&self, _pool: vk::CommandPool) -> VkResult<vk::CommandBuffer> {
        self.call("allocate_command_buffer")?;
        Ok(vk::CommandBuffer::from_raw(self.create("command_buffer")))
    }

    fn free_command_buffer(&self, _pool: vk::CommandPool, cbuf: vk::CommandBuffer) {
        self.log("free_command_buffer");
        self.destroy("command_buffer", cbuf.as_raw())
    }

    fn begin_command_buffer(&self, _cbuf: vk::CommandBuffer) -> VkResult<()> {
        self.call("begin_command_buffer")
    }

    fn end_command_buffer(&self, _cbuf: vk::CommandBuffer) -> VkResult<()> {
        self.call("end_command_buffer")
    }

    fn queue_submit(&self, _cbuf: vk::CommandBuffer, fence: vk::Fence) -> VkResult<()> {
        match fence == vk::Fence::null() {
            true => self.call("queue_submit"),
            false => self.call("queue_submit_fenced"),
        }
    }

    fn queue_wait_idle(&self) -> VkResult<()> {
        self.call("queue_wait_idle")
    }

    fn device_wait_idle(&self) -> VkResult<()> {
        self.call("device_wait_idle")
    }

    fn cmd_pipeline_barrier(
        &self,
        _cbuf: vk::CommandBuffer,
        _src_stage: vk::PipelineStageFlags,
        _dst_stage: vk::PipelineStageFlags,
        barrier: &vk::ImageMemoryBarrier,
    ) {
        let mut state = self.md_state.borrow_mut();
        state.calls.push("cmd_pipeline_barrier");
        state.barriers.push((barrier.old_layout, barrier.new_layout));
    }

    fn cmd_copy_buffer_to_image(
        &self,
        _cbuf: vk::CommandBuffer,
        _buffer: vk::Buffer,
        _image: vk::Image,
        layout: vk::ImageLayout,
        region: &vk::BufferImageCopy,
    ) {
        assert_eq!(layout, vk::ImageLayout::TRANSFER_DST_OPTIMAL);
        let mut state = self.md_state.borrow_mut();
        state.calls.push("cmd_copy_buffer_to_image");
        state.copies.push(*region);
    }

    fn cmd_blit_image(
        &self,
        _cbuf: vk::CommandBuffer,
        src: vk::Image,
        _src_layout: vk::ImageLayout,
        dst: vk::Image,
        _dst_layout: vk::ImageLayout,
        region: &vk::ImageBlit,
        filter: vk::Filter,
    ) {
        let mut state = self.md_state.borrow_mut();
        state.calls.push("cmd_blit_image");
        state.blits.push((src, dst, *region, filter));
    }

    fn create_descriptor_pool(
        &self,
        _max_sets: u32,
        _sizes: &[vk::DescriptorPoolSize],
    ) -> VkResult<vk::DescriptorPool> {
        self.call("create_descriptor_pool")?;
        Ok(vk::DescriptorPool::from_raw(self.create("descriptor_pool")))
    }

    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool) {
        self.log("destroy_descriptor_pool");
        self.destroy("descriptor_pool", pool.as_raw())
    }

    fn allocate_descriptor_set(
        &self,
        _pool: vk::DescriptorPool,
        _layout: vk::DescriptorSetLayout,
    ) -> VkResult<vk::DescriptorSet> {
        self.log("allocate_descriptor_set");
        let mut state = self.md_state.borrow_mut();
        match state.descriptor_results.pop_front() {
            Some(vk::Result::SUCCESS) | None => {}
            Some(err) => return Err(err),
        }
        let raw = state.next_handle;
        state.next_handle += 1;
        Ok(vk::DescriptorSet::from_raw(raw))
    }

    fn reset_descriptor_pool(&self, _pool: vk::DescriptorPool) -> VkResult<()> {
        self.call("reset_descriptor_pool")
    }

    fn create_fence(&self, exportable: bool) -> VkResult<vk::Fence> {
        match exportable {
            true => self.call("create_exportable_fence")?,
            false => self.call("create_fence")?,
        }
        Ok(vk::Fence::from_raw(self.create("fence")))
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        self.log("destroy_fence");
        self.destroy("fence", fence.as_raw())
    }

    fn reset_fence(&self, _fence: vk::Fence) -> VkResult<()> {
        self.call("reset_fence")
    }

    fn wait_for_fence(&self, _fence: vk::Fence) -> VkResult<()> {
        self.call("wait_for_fence")
    }

    fn export_fence_fd(&self, _fence: vk::Fence) -> VkResult<Option<OwnedFd>> {
        self.call("export_fence_fd")?;
        let (read, _write) = nix::unistd::pipe().map_err(|_| vk::Result::ERROR_TOO_MANY_OBJECTS)?;
        Ok(Some(read))
    }
}

/// A device context on top of a fresh mock
pub(crate) fn mock_device_with(
    caps: DeviceCapabilities,
    info: &CreateInfo,
    setup: impl FnOnce(&mut MockState),
) -> (Rc<Device>, Rc<RefCell<MockState>>) {
    let mut state = MockState::new();
    setup(&mut state);
    let state = Rc::new(RefCell::new(state));

    let driver = MockDriver {
        md_state: state.clone(),
    };
    let dev = Device::new(Box::new(driver), caps, 0, info).unwrap();
    (dev, state)
}

pub(crate) fn mock_device(caps: DeviceCapabilities) -> (Rc<Device>, Rc<RefCell<MockState>>) {
    mock_device_with(caps, &CreateInfo::default(), |_| {})
}

pub(crate) fn all_caps() -> DeviceCapabilities {
    DeviceCapabilities::all()
}

/// A pixmap in server memory
#[cfg(feature = "x11")]
pub(crate) struct MockPixmapSource {
    pub geometry: PixmapGeometry,
    pub dri3: bool,
    pub fail_buffer_from_pixmap: bool,
    /// Reported DRI3 stride, defaults to width * 4
    pub dri3_stride: Option<u32>,
    /// ZPixmap contents of the whole pixmap
    pub pixels: Vec<u8>,
    pub get_image_calls: Cell<u32>,
    pub buffer_calls: Cell<u32>,
}

#[cfg(feature = "x11")]
impl MockPixmapSource {
    pub fn new(width: u32, height: u32, depth: u8, dri3: bool) -> Self {
        let stride = crate::x11::zpixmap_stride(width, depth);
        Self {
            geometry: PixmapGeometry {
                width: width,
                height: height,
                depth: depth,
            },
            dri3: dri3,
            fail_buffer_from_pixmap: false,
            dri3_stride: None,
            pixels: vec![0; stride * height as usize],
            get_image_calls: Cell::new(0),
            buffer_calls: Cell::new(0),
        }
    }
}

#[cfg(feature = "x11")]
impl PixmapSource for MockPixmapSource {
    fn geometry(&self, _pixmap: u32) -> Result<PixmapGeometry> {
        Ok(self.geometry)
    }

    fn has_dri3(&self) -> bool {
        self.dri3
    }

    fn buffer_from_pixmap(&self, _pixmap: u32) -> Result<Dri3Buffer> {
        self.buffer_calls.set(self.buffer_calls.get() + 1);
        if self.fail_buffer_from_pixmap {
            return Err(VkImportError::X11_ERROR("BadPixmap".to_string()));
        }
        let (read, _write) = nix::unistd::pipe().unwrap();
        let stride = self.dri3_stride.unwrap_or(self.geometry.width * 4);
        Ok(Dri3Buffer {
            fd: read,
            width: self.geometry.width,
            height: self.geometry.height,
            stride: stride,
            size: stride * self.geometry.height,
            depth: self.geometry.depth,
            bpp: 32,
        })
    }

    fn get_image(&self, _pixmap: u32, rect: &Rect<i32>) -> Result<PixmapImage> {
        self.get_image_calls.set(self.get_image_calls.get() + 1);
        let depth = self.geometry.depth;
        let bpp = crate::x11::bytes_per_pixel(depth);
        let full_stride = crate::x11::zpixmap_stride(self.geometry.width, depth);
        let stride = crate::x11::zpixmap_stride(rect.r_size.0 as u32, depth);

        let mut data = vec![0; stride * rect.r_size.1 as usize];
        for row in 0..rect.r_size.1 as usize {
            let src = (rect.r_pos.1 as usize + row) * full_stride + rect.r_pos.0 as usize * bpp;
            let len = rect.r_size.0 as usize * bpp;
            data[row * stride..row * stride + len].copy_from_slice(&self.pixels[src..src + len]);
        }

        Ok(PixmapImage {
            width: rect.r_size.0 as u32,
            height: rect.r_size.1 as u32,
            depth: depth,
            data: data,
        })
    }
}

use ash::vk;
use vk_mem::Alloc;

use crate::{
    error::{GfxError, GfxResult},
    foundation::debug_messenger::DebugType,
    gfx::Gfx,
};

/// buffer 所在的内存位置
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum GfxMemoryLocation {
    /// 只有 GPU 可以访问
    GpuOnly,
    /// CPU 写入，GPU 读取（staging 上传）
    CpuToGpu,
    /// GPU 写入，CPU 读取（回读）
    GpuToCpu,
}

impl GfxMemoryLocation {
    #[inline]
    fn host_visible(self) -> bool {
        self != GfxMemoryLocation::GpuOnly
    }
}

/// # Destroy
/// 需要手动调用 [`GfxBuffer::destroy`]
pub struct GfxBuffer {
    handle: vk::Buffer,
    allocation: vk_mem::Allocation,

    size: vk::DeviceSize,
    location: GfxMemoryLocation,

    /// 在初始化阶段写死
    map_ptr: Option<*mut u8>,
    /// 只有在 buffer usage 包含 SHADER_DEVICE_ADDRESS 时才有值
    device_addr: Option<vk::DeviceAddress>,

    debug_name: String,

    #[cfg(debug_assertions)]
    destroyed: bool,
}
impl DebugType for GfxBuffer {
    fn debug_type_name() -> &'static str {
        "GfxBuffer"
    }

    fn vk_handle(&self) -> impl vk::Handle {
        self.handle
    }
}
impl Drop for GfxBuffer {
    fn drop(&mut self) {
        #[cfg(debug_assertions)]
        debug_assert!(self.destroyed, "GfxBuffer {} must be destroyed before being dropped.", self.debug_name);
    }
}
// init & destroy
impl GfxBuffer {
    /// - align: buffer 起始地址的对齐要求，默认对齐到 8 字节
    /// - host visible 的 buffer 会在创建时持久 map
    pub fn new(
        gfx: &Gfx,
        buffer_size: vk::DeviceSize,
        buffer_usage: vk::BufferUsageFlags,
        location: GfxMemoryLocation,
        align: Option<vk::DeviceSize>,
        name: impl AsRef<str>,
    ) -> GfxResult<Self> {
        let concurrent_families = gfx.concurrent_families();
        let mut buffer_ci = vk::BufferCreateInfo::default().size(buffer_size.max(1)).usage(buffer_usage);
        if !concurrent_families.is_empty() {
            buffer_ci = buffer_ci.sharing_mode(vk::SharingMode::CONCURRENT).queue_family_indices(&concurrent_families);
        }

        let alloc_ci = vk_mem::AllocationCreateInfo {
            usage: match location {
                GfxMemoryLocation::GpuOnly => vk_mem::MemoryUsage::AutoPreferDevice,
                GfxMemoryLocation::CpuToGpu | GfxMemoryLocation::GpuToCpu => vk_mem::MemoryUsage::AutoPreferHost,
            },
            flags: match location {
                GfxMemoryLocation::GpuOnly => vk_mem::AllocationCreateFlags::empty(),
                GfxMemoryLocation::CpuToGpu => vk_mem::AllocationCreateFlags::HOST_ACCESS_SEQUENTIAL_WRITE,
                GfxMemoryLocation::GpuToCpu => vk_mem::AllocationCreateFlags::HOST_ACCESS_RANDOM,
            },
            ..Default::default()
        };

        let allocator = gfx.allocator();
        let align = align.unwrap_or(8);
        let (buffer, mut alloc) = unsafe { allocator.create_buffer_with_alignment(&buffer_ci, &alloc_ci, align) }
            .map_err(|result| {
                GfxError::Allocation(format!("buffer {} ({} bytes): {}", name.as_ref(), buffer_size, result))
            })?;

        let mut mapped_ptr = None;
        if location.host_visible() {
            match unsafe { allocator.map_memory(&mut alloc) } {
                Ok(ptr) => mapped_ptr = Some(ptr),
                Err(result) => {
                    unsafe { allocator.destroy_buffer(buffer, &mut alloc) };
                    return Err(GfxError::VkCall {
                        call: "vmaMapMemory",
                        result,
                    });
                }
            }
        }

        let device_addr = buffer_usage.contains(vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS).then(|| unsafe {
            gfx.gfx_device().get_buffer_device_address(&vk::BufferDeviceAddressInfo::default().buffer(buffer))
        });

        gfx.gfx_device().set_object_debug_name(buffer, format!("Buffer::{}", name.as_ref()));
        Ok(Self {
            handle: buffer,
            allocation: alloc,
            size: buffer_size,
            location,
            map_ptr: mapped_ptr,
            device_addr,

            debug_name: name.as_ref().to_string(),

            #[cfg(debug_assertions)]
            destroyed: false,
        })
    }

    #[inline]
    pub fn new_stage_buffer(gfx: &Gfx, size: vk::DeviceSize, debug_name: impl AsRef<str>) -> GfxResult<Self> {
        Self::new(gfx, size, vk::BufferUsageFlags::TRANSFER_SRC, GfxMemoryLocation::CpuToGpu, None, debug_name)
    }

    #[inline]
    pub fn new_readback_buffer(gfx: &Gfx, size: vk::DeviceSize, debug_name: impl AsRef<str>) -> GfxResult<Self> {
        Self::new(gfx, size, vk::BufferUsageFlags::TRANSFER_DST, GfxMemoryLocation::GpuToCpu, None, debug_name)
    }

    pub fn destroy(mut self, gfx: &Gfx) {
        let allocator = gfx.allocator();
        unsafe {
            if self.map_ptr.take().is_some() {
                allocator.unmap_memory(&mut self.allocation);
            }
            allocator.destroy_buffer(self.handle, &mut self.allocation);
        }
        #[cfg(debug_assertions)]
        {
            self.destroyed = true;
        }
    }
}
// getter
impl GfxBuffer {
    #[inline]
    pub fn vk_buffer(&self) -> vk::Buffer {
        self.handle
    }

    /// buffer usage 不包含 SHADER_DEVICE_ADDRESS 时为 None
    #[inline]
    pub fn device_address(&self) -> Option<vk::DeviceAddress> {
        self.device_addr
    }

    #[inline]
    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }

    #[inline]
    pub fn location(&self) -> GfxMemoryLocation {
        self.location
    }

    #[inline]
    pub fn debug_name(&self) -> &str {
        &self.debug_name
    }
}
// tools
impl GfxBuffer {
    fn check_range(&self, offset: vk::DeviceSize, len: usize) -> GfxResult<*mut u8> {
        let ptr = self
            .map_ptr
            .ok_or_else(|| GfxError::Unsupported(format!("buffer {} is not host visible", self.debug_name)))?;
        if offset + len as vk::DeviceSize > self.size {
            return Err(GfxError::Unsupported(format!(
                "mapped access out of range: buffer {} size {}, offset {}, len {}",
                self.debug_name, self.size, offset, len
            )));
        }
        Ok(ptr)
    }

    /// 通过 mem map 的方式将 data 写入到 buffer 中，并 flush
    pub fn write_mapped(&self, gfx: &Gfx, offset: vk::DeviceSize, data: &[u8]) -> GfxResult<()> {
        let ptr = self.check_range(offset, data.len())?;
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), ptr.add(offset as usize), data.len());
        }
        gfx.allocator()
            .flush_allocation(&self.allocation, offset, data.len() as vk::DeviceSize)
            .map_err(|result| GfxError::VkCall {
                call: "vmaFlushAllocation",
                result,
            })
    }

    /// invalidate 之后从 mapped 内存中读出数据
    pub fn read_mapped(&self, gfx: &Gfx, offset: vk::DeviceSize, out: &mut [u8]) -> GfxResult<()> {
        let ptr = self.check_range(offset, out.len())?;
        gfx.allocator()
            .invalidate_allocation(&self.allocation, offset, out.len() as vk::DeviceSize)
            .map_err(|result| GfxError::VkCall {
                call: "vmaInvalidateAllocation",
                result,
            })?;
        unsafe {
            std::ptr::copy_nonoverlapping(ptr.add(offset as usize), out.as_mut_ptr(), out.len());
        }
        Ok(())
    }
}

//! Ray Tracing 所需的加速结构

use ash::vk;

use crate::{
    commands::command_buffer::GfxCommandBuffer,
    error::{GfxResult, VkResultExt},
    foundation::debug_messenger::DebugType,
    gfx::Gfx,
    resources::buffer::{GfxBuffer, GfxMemoryLocation},
};

/// 构建加速结构时的输入几何
///
/// 所有地址都是 device address
#[derive(Copy, Clone, Debug)]
pub enum GfxAccelInput {
    /// 一个 BLAS 只包含一个 triangle geometry
    Triangles {
        vertex_address: vk::DeviceAddress,
        vertex_stride: vk::DeviceSize,
        vertex_count: u32,
        index_address: vk::DeviceAddress,
        index_type: vk::IndexType,
        triangle_count: u32,
        /// 为 true 时会跳过 any hit shader
        opaque: bool,
    },
    /// TLAS 的 instance 数组，每个元素是 [`vk::AccelerationStructureInstanceKHR`]
    Instances {
        instance_address: vk::DeviceAddress,
        instance_count: u32,
    },
}

impl GfxAccelInput {
    #[inline]
    pub fn ty(&self) -> vk::AccelerationStructureTypeKHR {
        match self {
            GfxAccelInput::Triangles { .. } => vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL,
            GfxAccelInput::Instances { .. } => vk::AccelerationStructureTypeKHR::TOP_LEVEL,
        }
    }

    #[inline]
    pub fn primitive_count(&self) -> u32 {
        match self {
            GfxAccelInput::Triangles { triangle_count, .. } => *triangle_count,
            GfxAccelInput::Instances { instance_count, .. } => *instance_count,
        }
    }

    fn geometry(&self) -> vk::AccelerationStructureGeometryKHR<'static> {
        match *self {
            GfxAccelInput::Triangles {
                vertex_address,
                vertex_stride,
                vertex_count,
                index_address,
                index_type,
                opaque,
                ..
            } => {
                let triangles = vk::AccelerationStructureGeometryTrianglesDataKHR::default()
                    .vertex_format(vk::Format::R32G32B32_SFLOAT)
                    .vertex_data(vk::DeviceOrHostAddressConstKHR {
                        device_address: vertex_address,
                    })
                    .vertex_stride(vertex_stride)
                    .max_vertex(vertex_count.saturating_sub(1))
                    .index_type(index_type)
                    .index_data(vk::DeviceOrHostAddressConstKHR {
                        device_address: index_address,
                    });
                vk::AccelerationStructureGeometryKHR::default()
                    .geometry_type(vk::GeometryTypeKHR::TRIANGLES)
                    .geometry(vk::AccelerationStructureGeometryDataKHR { triangles })
                    .flags(if opaque { vk::GeometryFlagsKHR::OPAQUE } else { vk::GeometryFlagsKHR::empty() })
            }
            GfxAccelInput::Instances { instance_address, .. } => vk::AccelerationStructureGeometryKHR::default()
                .geometry_type(vk::GeometryTypeKHR::INSTANCES)
                .geometry(vk::AccelerationStructureGeometryDataKHR {
                    instances: vk::AccelerationStructureGeometryInstancesDataKHR::default()
                        // false: data 是 &[vk::AccelerationStructureInstanceKHR]
                        .array_of_pointers(false)
                        .data(vk::DeviceOrHostAddressConstKHR {
                            device_address: instance_address,
                        }),
                }),
        }
    }

    fn build_flags(&self) -> vk::BuildAccelerationStructureFlagsKHR {
        match self {
            // 蒙皮网格每帧都会重建，优先构建速度
            GfxAccelInput::Triangles { .. } => vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_BUILD,
            GfxAccelInput::Instances { .. } => vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE,
        }
    }
}

/// 加速结构以及承载它的 buffer
///
/// # Destroy
/// 需要手动调用 [`GfxAcceleration::destroy`]
pub struct GfxAcceleration {
    acceleration_structure: vk::AccelerationStructureKHR,
    buffer: GfxBuffer,
    ty: vk::AccelerationStructureTypeKHR,
    device_address: vk::DeviceAddress,
}
impl DebugType for GfxAcceleration {
    fn debug_type_name() -> &'static str {
        "GfxAcceleration"
    }

    fn vk_handle(&self) -> impl vk::Handle {
        self.acceleration_structure
    }
}
// new & init
impl GfxAcceleration {
    /// 查询构建所需的加速结构尺寸以及 scratch 尺寸
    pub fn build_sizes(gfx: &Gfx, input: &GfxAccelInput) -> vk::AccelerationStructureBuildSizesInfoKHR<'static> {
        let geometry = input.geometry();
        let build_geometry_info = vk::AccelerationStructureBuildGeometryInfoKHR::default()
            .ty(input.ty())
            .flags(input.build_flags())
            .geometries(std::slice::from_ref(&geometry))
            .mode(vk::BuildAccelerationStructureModeKHR::BUILD);

        let mut size_info = vk::AccelerationStructureBuildSizesInfoKHR::default();
        unsafe {
            gfx.gfx_device().acceleration_structure.get_acceleration_structure_build_sizes(
                vk::AccelerationStructureBuildTypeKHR::DEVICE,
                &build_geometry_info,
                &[input.primitive_count()],
                &mut size_info,
            );
        }
        size_info
    }

    /// 创建 AccelerationStructure 以及 buffer
    pub fn new(
        gfx: &Gfx,
        size: vk::DeviceSize,
        ty: vk::AccelerationStructureTypeKHR,
        debug_name: impl AsRef<str>,
    ) -> GfxResult<Self> {
        let buffer = GfxBuffer::new(
            gfx,
            size,
            vk::BufferUsageFlags::ACCELERATION_STRUCTURE_STORAGE_KHR | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            GfxMemoryLocation::GpuOnly,
            // acceleration structure 的 offset 需要 256 对齐
            Some(256),
            format!("{}-accel-buffer", debug_name.as_ref()),
        )?;

        let create_info = vk::AccelerationStructureCreateInfoKHR::default() //
            .ty(ty)
            .size(size)
            .buffer(buffer.vk_buffer());

        let acceleration_structure =
            match unsafe { gfx.gfx_device().acceleration_structure.create_acceleration_structure(&create_info, None) }
                .vk_context("vkCreateAccelerationStructureKHR")
            {
                Ok(accel) => accel,
                Err(e) => {
                    buffer.destroy(gfx);
                    return Err(e);
                }
            };

        let device_address = unsafe {
            gfx.gfx_device().acceleration_structure.get_acceleration_structure_device_address(
                &vk::AccelerationStructureDeviceAddressInfoKHR::default()
                    .acceleration_structure(acceleration_structure),
            )
        };

        let acc = Self {
            acceleration_structure,
            buffer,
            ty,
            device_address,
        };
        gfx.gfx_device().set_debug_name(&acc, debug_name);
        Ok(acc)
    }

    pub fn destroy(self, gfx: &Gfx) {
        unsafe {
            gfx.gfx_device().acceleration_structure.destroy_acceleration_structure(self.acceleration_structure, None);
        }
        self.buffer.destroy(gfx);
    }
}
// getters
impl GfxAcceleration {
    #[inline]
    pub fn handle(&self) -> vk::AccelerationStructureKHR {
        self.acceleration_structure
    }

    #[inline]
    pub fn device_address(&self) -> vk::DeviceAddress {
        self.device_address
    }

    #[inline]
    pub fn ty(&self) -> vk::AccelerationStructureTypeKHR {
        self.ty
    }

    #[inline]
    pub fn size(&self) -> vk::DeviceSize {
        self.buffer.size()
    }
}
// tools
impl GfxAcceleration {
    /// 将构建命令录制到 command buffer 中
    ///
    /// scratch 地址需要满足 `min_acceleration_structure_scratch_offset_alignment`
    pub fn cmd_build(&self, cmd: &GfxCommandBuffer, input: &GfxAccelInput, scratch_address: vk::DeviceAddress) {
        let geometry = input.geometry();
        let build_geometry_info = vk::AccelerationStructureBuildGeometryInfoKHR::default()
            .ty(input.ty())
            .flags(input.build_flags())
            .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
            .geometries(std::slice::from_ref(&geometry))
            .dst_acceleration_structure(self.acceleration_structure)
            .scratch_data(vk::DeviceOrHostAddressKHR {
                device_address: scratch_address,
            });
        let range_info = vk::AccelerationStructureBuildRangeInfoKHR::default().primitive_count(input.primitive_count());

        cmd.build_acceleration_structure(&build_geometry_info, std::slice::from_ref(&range_info));
    }
}

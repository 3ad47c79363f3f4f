//! 设备抽象
//!
//! 渲染管线只通过 [`RtDevice`] 与 GPU 交互。[`soft::SoftDevice`] 是 CPU 上的实现，
//! `vulkan::VulkanDevice` 通过 rths-gfx 使用硬件光追。

mod command;
pub mod soft;
#[cfg(feature = "vulkan")]
pub mod vulkan;

use slotmap::new_key_type;

use crate::translator::{NativeBuffer, NativeTexture};

pub use command::{AccelGeometry, CommandList, GpuCommand, ResourceRef, SbtRegion, TraceRaysDesc, Transition};

new_key_type! {
    pub struct BufferId;
    pub struct TextureId;
    pub struct AccelId;
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum BackendKind {
    Soft,
    Vulkan,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceCaps {
    pub ray_tracing: bool,
    /// buffer 与 texture 之间拷贝时，每行的字节数需要按此对齐
    pub texture_row_pitch_alignment: u64,
    pub shader_group_handle_size: u32,
    pub shader_group_handle_alignment: u32,
    pub shader_group_base_alignment: u32,
    pub scratch_alignment: u64,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum QueueKind {
    /// 上传与回读
    Copy,
    /// 加速结构构建与 trace rays
    Raytrace,
}

impl QueueKind {
    pub const ALL: [QueueKind; 2] = [QueueKind::Copy, QueueKind::Raytrace];

    #[inline]
    pub const fn index(self) -> usize {
        match self {
            QueueKind::Copy => 0,
            QueueKind::Raytrace => 1,
        }
    }
}

/// 某个 queue 上的一个 fence 值
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct FencePoint {
    pub queue: QueueKind,
    pub value: u64,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum MemoryLocation {
    GpuOnly,
    /// CPU 可写，持久映射
    Upload,
    /// CPU 可读，持久映射
    Readback,
}

bitflags::bitflags! {
    #[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
    pub struct BufferUsage: u32 {
        const COPY_SRC = 1 << 0;
        const COPY_DST = 1 << 1;
        const BUILD_INPUT = 1 << 2;
        const ACCEL_SCRATCH = 1 << 3;
        const SHADER_TABLE = 1 << 4;
        const CONSTANT = 1 << 5;
    }
}

#[derive(Clone, Debug)]
pub struct BufferDesc {
    pub size: u64,
    pub usage: BufferUsage,
    pub location: MemoryLocation,
    pub label: String,
}

/// 单通道的输出格式
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum TextureFormat {
    R8Unorm,
    R16Float,
    R32Float,
}

impl TextureFormat {
    #[inline]
    pub fn bytes_per_pixel(self) -> u64 {
        match self {
            TextureFormat::R8Unorm => 1,
            TextureFormat::R16Float => 2,
            TextureFormat::R32Float => 4,
        }
    }
}

#[derive(Clone, Debug)]
pub struct TextureDesc {
    pub width: u32,
    pub height: u32,
    pub format: TextureFormat,
    pub label: String,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum AccelKind {
    Bottom,
    Top,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub struct AccelSizes {
    pub structure_size: u64,
    pub scratch_size: u64,
}

/// ray tracing pipeline 中的 shader group
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ShaderGroup {
    RayGen,
    CameraMiss,
    ShadowMiss,
    /// camera ray 与 shadow ray 共用的 hit group
    Hit,
}

impl ShaderGroup {
    pub const ALL: [ShaderGroup; 4] =
        [ShaderGroup::RayGen, ShaderGroup::CameraMiss, ShaderGroup::ShadowMiss, ShaderGroup::Hit];
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DeviceStatus {
    Ok,
    /// 设备丢失后重新创建，之前的所有资源 id 都已失效
    Reset,
}

/// 设备边界上的错误
#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("device lost: {0}")]
    DeviceLost(String),

    #[error("out of device memory: {0}")]
    OutOfMemory(String),

    #[error("acceleration structure build failed: {0}")]
    BuildFailed(String),

    #[error("invalid resource: {0}")]
    InvalidResource(String),

    /// 命令与资源当前的状态不符，或者等待了尚未提交的 fence
    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("backend error: {0}")]
    Backend(String),
}

#[cfg(feature = "vulkan")]
impl From<rths_gfx::error::GfxError> for DeviceError {
    fn from(err: rths_gfx::error::GfxError) -> Self {
        if err.is_device_lost() {
            DeviceError::DeviceLost(err.to_string())
        } else if err.is_out_of_memory() {
            DeviceError::OutOfMemory(err.to_string())
        } else if let rths_gfx::error::GfxError::Unsupported(msg) = err {
            DeviceError::Unsupported(msg)
        } else {
            DeviceError::Backend(err.to_string())
        }
    }
}

pub type DeviceResult<T> = Result<T, DeviceError>;

/// 光追设备的最小接口
///
/// 所有的命令都通过 [`CommandList`] 提交到某个 queue，提交返回的 [`FencePoint`]
/// 可以被其他 queue 的提交等待，也可以在 CPU 上等待或者查询。
pub trait RtDevice {
    fn kind(&self) -> BackendKind;
    fn caps(&self) -> &DeviceCaps;

    /// 检查设备是否可用，设备丢失后会尝试重建
    fn check_device(&mut self) -> DeviceResult<DeviceStatus>;

    fn create_buffer(&mut self, desc: &BufferDesc) -> DeviceResult<BufferId>;
    fn import_buffer(&mut self, native: NativeBuffer) -> DeviceResult<BufferId>;
    fn destroy_buffer(&mut self, id: BufferId);

    fn create_texture(&mut self, desc: &TextureDesc) -> DeviceResult<TextureId>;
    fn import_texture(&mut self, native: NativeTexture, format: TextureFormat) -> DeviceResult<TextureId>;
    fn destroy_texture(&mut self, id: TextureId);
    /// 导出给宿主的纹理句柄
    fn native_texture(&self, id: TextureId) -> Option<NativeTexture>;

    fn acceleration_sizes(&self, geometry: &AccelGeometry) -> DeviceResult<AccelSizes>;
    fn create_acceleration(&mut self, kind: AccelKind, size: u64) -> DeviceResult<AccelId>;
    fn destroy_acceleration(&mut self, id: AccelId);
    /// TLAS 的 instance 通过这个地址引用 BLAS
    fn acceleration_address(&self, id: AccelId) -> DeviceResult<u64>;

    /// 写入 [`MemoryLocation::Upload`] 的 buffer
    fn write_buffer(&mut self, id: BufferId, offset: u64, data: &[u8]) -> DeviceResult<()>;
    /// 读取 [`MemoryLocation::Readback`] 的 buffer
    fn read_buffer(&mut self, id: BufferId, offset: u64, dst: &mut [u8]) -> DeviceResult<()>;

    /// shader group 的 handle，长度为 `shader_group_handle_size`
    fn shader_group_handle(&self, group: ShaderGroup) -> &[u8];

    /// 提交之前会等待 `waits` 中的所有 fence
    fn submit(&mut self, queue: QueueKind, commands: CommandList, waits: &[FencePoint]) -> DeviceResult<FencePoint>;

    /// 非阻塞地查询 queue 已经完成的 fence 值
    fn completed(&mut self, queue: QueueKind) -> DeviceResult<u64>;

    /// 阻塞直到 `point` 完成
    fn wait(&mut self, point: FencePoint) -> DeviceResult<()>;
}

/// 资源在 texture/buffer 拷贝时的行字节数
#[inline]
pub fn aligned_row_pitch(width: u32, format: TextureFormat, alignment: u64) -> u64 {
    align_up(width as u64 * format.bytes_per_pixel(), alignment)
}

#[inline]
pub fn align_up(value: u64, alignment: u64) -> u64 {
    debug_assert!(alignment.is_power_of_two());
    (value + alignment - 1) & !(alignment - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_pitch_alignment() {
        assert_eq!(aligned_row_pitch(3, TextureFormat::R8Unorm, 256), 256);
        assert_eq!(aligned_row_pitch(64, TextureFormat::R32Float, 256), 256);
        assert_eq!(aligned_row_pitch(65, TextureFormat::R32Float, 256), 512);
        assert_eq!(align_up(0, 64), 0);
    }
}

//! 基于 rths-gfx 的硬件光追后端
//!
//! 两个 [`QueueKind`] 分别对应 transfer queue 与 compute queue，每个 queue 有一个
//! timeline semaphore，[`FencePoint`] 的值就是 semaphore 的值。

mod barrier;
mod pipeline;

use std::path::PathBuf;

use ash::vk;
use ash::vk::Handle;
use itertools::Itertools;
use rths_gfx::commands::barrier::{GfxBufferBarrier, GfxImageBarrier};
use rths_gfx::commands::command_buffer::GfxCommandBuffer;
use rths_gfx::commands::command_pool::GfxCommandPool;
use rths_gfx::commands::semaphore::GfxSemaphore;
use rths_gfx::commands::submit_info::GfxSubmitInfo;
use rths_gfx::error::{GfxError, GfxResult};
use rths_gfx::gfx::{Gfx, GfxCreateInfo};
use rths_gfx::pipelines::rt_pipeline::GfxRtBindings;
use rths_gfx::raytracing::acceleration::{GfxAccelInput, GfxAcceleration};
use rths_gfx::resources::buffer::{GfxBuffer, GfxMemoryLocation};
use rths_gfx::resources::image::GfxImage2D;
use slotmap::SlotMap;

use crate::backend::{
    AccelGeometry, AccelId, AccelKind, AccelSizes, BackendKind, BufferDesc, BufferId, BufferUsage, CommandList,
    DeviceCaps, DeviceError, DeviceResult, DeviceStatus, FencePoint, GpuCommand, MemoryLocation, QueueKind,
    ResourceRef, RtDevice, SbtRegion, ShaderGroup, TextureDesc, TextureFormat, TextureId, TraceRaysDesc, Transition,
};
use crate::config::EngineConfig;
use crate::host::IndexFormat;
use crate::translator::{NativeBuffer, NativeTexture};

use self::barrier::{state_layout, transition_mask};
use self::pipeline::ShadowPipeline;

enum VkBufferSlot {
    Owned(GfxBuffer),
    /// 宿主的 buffer，需要带有 SHADER_DEVICE_ADDRESS usage
    External {
        handle: vk::Buffer,
        size: u64,
        address: vk::DeviceAddress,
    },
}

impl VkBufferSlot {
    #[inline]
    fn handle(&self) -> vk::Buffer {
        match self {
            VkBufferSlot::Owned(buffer) => buffer.vk_buffer(),
            VkBufferSlot::External { handle, .. } => *handle,
        }
    }

    #[inline]
    fn address(&self) -> Option<vk::DeviceAddress> {
        match self {
            VkBufferSlot::Owned(buffer) => buffer.device_address(),
            VkBufferSlot::External { address, .. } => Some(*address),
        }
    }
}

/// 一个 queue 的 command pool 与 timeline
struct QueueContext {
    kind: QueueKind,
    command_pool: GfxCommandPool,
    timeline: GfxSemaphore,
    submitted: u64,
    /// 等待 timeline 到达之后回收的 command buffer
    pending: Vec<(u64, GfxCommandBuffer)>,
    /// queue family 不支持 compute 时，barrier 只能包含拷贝相关的 stage
    transfer_only: bool,
}

impl QueueContext {
    fn new(gfx: &Gfx, kind: QueueKind) -> GfxResult<Self> {
        let queue = match kind {
            QueueKind::Copy => gfx.transfer_queue(),
            QueueKind::Raytrace => gfx.compute_queue(),
        };
        let family = queue.queue_family().clone();
        let transfer_only = !family.queue_flags.contains(vk::QueueFlags::COMPUTE);
        let name = format!("{:?}", kind).to_lowercase();

        let command_pool = GfxCommandPool::new(
            gfx.gfx_device().clone(),
            family,
            vk::CommandPoolCreateFlags::TRANSIENT,
            &format!("{name}-pool"),
        )?;
        let timeline = match GfxSemaphore::new_timeline(gfx.gfx_device(), 0, &format!("{name}-timeline")) {
            Ok(timeline) => timeline,
            Err(e) => {
                command_pool.destroy();
                return Err(e);
            }
        };
        Ok(Self {
            kind,
            command_pool,
            timeline,
            submitted: 0,
            pending: Vec::new(),
            transfer_only,
        })
    }

    /// 回收已经执行完的 command buffer
    fn recycle(&mut self, completed: u64) {
        let (done, pending): (Vec<_>, Vec<_>) = self.pending.drain(..).partition(|(value, _)| *value <= completed);
        self.pending = pending;
        done.into_iter().for_each(|(_, cmd)| cmd.free());
    }

    fn destroy(mut self, gfx: &Gfx) {
        self.pending.drain(..).for_each(|(_, cmd)| cmd.free());
        self.command_pool.destroy();
        self.timeline.destroy(gfx.gfx_device());
    }
}

/// 设备重建时整体替换
struct VulkanCore {
    pipeline: ShadowPipeline,
    queues: [QueueContext; 2],

    buffers: SlotMap<BufferId, VkBufferSlot>,
    textures: SlotMap<TextureId, GfxImage2D>,
    accels: SlotMap<AccelId, GfxAcceleration>,

    /// 需要在其他字段之后销毁
    gfx: Gfx,
}

impl VulkanCore {
    fn new(create_info: &GfxCreateInfo, shader_dir: Option<&std::path::Path>) -> GfxResult<Self> {
        let _span = tracy_client::span!("VulkanCore::new");
        let gfx = Gfx::new(create_info)?;

        let pipeline = ShadowPipeline::new(&gfx, shader_dir)?;
        let copy = match QueueContext::new(&gfx, QueueKind::Copy) {
            Ok(queue) => queue,
            Err(e) => {
                pipeline.destroy(&gfx);
                return Err(e);
            }
        };
        let raytrace = match QueueContext::new(&gfx, QueueKind::Raytrace) {
            Ok(queue) => queue,
            Err(e) => {
                copy.destroy(&gfx);
                pipeline.destroy(&gfx);
                return Err(e);
            }
        };

        Ok(Self {
            pipeline,
            queues: [copy, raytrace],
            buffers: SlotMap::with_key(),
            textures: SlotMap::with_key(),
            accels: SlotMap::with_key(),
            gfx,
        })
    }

    fn caps(&self) -> DeviceCaps {
        let rt_props = self.gfx.rt_pipeline_props();
        let pdevice = self.gfx.physical_device();
        DeviceCaps {
            ray_tracing: true,
            texture_row_pitch_alignment: pdevice.optimal_copy_row_pitch_align().next_power_of_two(),
            shader_group_handle_size: rt_props.shader_group_handle_size,
            shader_group_handle_alignment: rt_props.shader_group_handle_alignment,
            shader_group_base_alignment: rt_props.shader_group_base_alignment,
            scratch_alignment: pdevice.min_scratch_offset_align().max(1).next_power_of_two(),
        }
    }

    fn destroy(mut self) {
        let _span = tracy_client::span!("VulkanCore::destroy");
        if let Err(e) = self.gfx.wait_idle() {
            log::warn!("wait idle before destroying vulkan core: {}", e);
        }
        let gfx = &self.gfx;
        for (_, slot) in self.buffers.drain() {
            if let VkBufferSlot::Owned(buffer) = slot {
                buffer.destroy(gfx);
            }
        }
        for (_, texture) in self.textures.drain() {
            texture.destroy(gfx);
        }
        for (_, accel) in self.accels.drain() {
            accel.destroy(gfx);
        }
        let [copy, raytrace] = self.queues;
        copy.destroy(gfx);
        raytrace.destroy(gfx);
        self.pipeline.destroy(gfx);
    }
}

pub struct VulkanDevice {
    create_info: GfxCreateInfo,
    shader_dir: Option<PathBuf>,

    /// 设备丢失且重建失败之后为 None
    core: Option<VulkanCore>,
    caps: DeviceCaps,
    lost: bool,
}

// new & init
impl VulkanDevice {
    pub fn new(config: &EngineConfig) -> DeviceResult<Self> {
        let create_info = GfxCreateInfo {
            app_name: config.app_name.clone(),
            enable_validation: config.enable_validation,
            prefer_discrete_gpu: config.prefer_discrete_gpu,
        };
        let core = VulkanCore::new(&create_info, config.shader_build_dir.as_deref())?;
        let caps = core.caps();
        log::info!("vulkan device created: {:?}", caps);

        Ok(Self {
            create_info,
            shader_dir: config.shader_build_dir.clone(),
            core: Some(core),
            caps,
            lost: false,
        })
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        if let Some(core) = self.core.take() {
            core.destroy();
        }
    }
}

// tools
impl VulkanDevice {
    fn core(&self) -> DeviceResult<&VulkanCore> {
        match &self.core {
            Some(core) if !self.lost => Ok(core),
            _ => Err(DeviceError::DeviceLost("vulkan device is lost".to_string())),
        }
    }

    fn core_mut(&mut self) -> DeviceResult<&mut VulkanCore> {
        match &mut self.core {
            Some(core) if !self.lost => Ok(core),
            _ => Err(DeviceError::DeviceLost("vulkan device is lost".to_string())),
        }
    }

    /// 所有的 vulkan 错误都经过这里，设备丢失之后拒绝后续的调用
    fn track(&mut self, err: GfxError) -> DeviceError {
        if err.is_device_lost() && !self.lost {
            log::error!("vulkan device lost: {}", err);
            self.lost = true;
        }
        DeviceError::from(err)
    }

    fn buffer_usage(desc: &BufferDesc) -> vk::BufferUsageFlags {
        let mut usage = vk::BufferUsageFlags::empty();
        if desc.usage.contains(BufferUsage::COPY_SRC) {
            usage |= vk::BufferUsageFlags::TRANSFER_SRC;
        }
        if desc.usage.contains(BufferUsage::COPY_DST) {
            usage |= vk::BufferUsageFlags::TRANSFER_DST;
        }
        if desc.usage.contains(BufferUsage::BUILD_INPUT) {
            usage |= vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR
                | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS;
        }
        if desc.usage.contains(BufferUsage::ACCEL_SCRATCH) {
            usage |= vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS;
        }
        if desc.usage.contains(BufferUsage::SHADER_TABLE) {
            usage |= vk::BufferUsageFlags::SHADER_BINDING_TABLE_KHR | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS;
        }
        if desc.usage.contains(BufferUsage::CONSTANT) {
            usage |= vk::BufferUsageFlags::UNIFORM_BUFFER;
        }
        usage
    }

    fn vk_format(format: TextureFormat) -> vk::Format {
        match format {
            TextureFormat::R8Unorm => vk::Format::R8_UNORM,
            TextureFormat::R16Float => vk::Format::R16_SFLOAT,
            TextureFormat::R32Float => vk::Format::R32_SFLOAT,
        }
    }
}

// 命令录制
impl VulkanCore {
    fn buffer(&self, id: BufferId) -> DeviceResult<&VkBufferSlot> {
        self.buffers.get(id).ok_or_else(|| invalid(id))
    }

    fn buffer_address(&self, id: BufferId, offset: u64) -> DeviceResult<vk::DeviceAddress> {
        self.buffer(id)?
            .address()
            .map(|address| address + offset)
            .ok_or_else(|| DeviceError::InvalidResource(format!("{:?} has no device address", id)))
    }

    fn texture(&self, id: TextureId) -> DeviceResult<&GfxImage2D> {
        self.textures.get(id).ok_or_else(|| invalid(id))
    }

    fn accel(&self, id: AccelId) -> DeviceResult<&GfxAcceleration> {
        self.accels.get(id).ok_or_else(|| invalid(id))
    }

    fn accel_input(&self, geometry: &AccelGeometry) -> DeviceResult<GfxAccelInput> {
        match geometry {
            AccelGeometry::Triangles {
                vertices,
                vertex_offset,
                vertex_stride,
                vertex_count,
                indices,
                index_offset,
                index_format,
                index_count,
            } => Ok(GfxAccelInput::Triangles {
                vertex_address: self.buffer_address(*vertices, *vertex_offset)?,
                vertex_stride: *vertex_stride,
                vertex_count: *vertex_count,
                index_address: self.buffer_address(*indices, *index_offset)?,
                index_type: match index_format {
                    IndexFormat::U16 => vk::IndexType::UINT16,
                    IndexFormat::U32 => vk::IndexType::UINT32,
                },
                triangle_count: index_count / 3,
                // 自阴影的判断在 any hit 中进行
                opaque: false,
            }),
            AccelGeometry::Instances { instances, offset, count } => Ok(GfxAccelInput::Instances {
                instance_address: self.buffer_address(*instances, *offset)?,
                instance_count: *count,
            }),
        }
    }

    fn record_barrier(&self, cmd: &GfxCommandBuffer, transitions: &[Transition], transfer_only: bool) -> DeviceResult<()> {
        let mut memory_barriers = Vec::new();
        let mut buffer_barriers = Vec::new();
        let mut image_barriers = Vec::new();
        for t in transitions {
            let mask = transition_mask(t.before, t.after, transfer_only);
            match t.resource {
                ResourceRef::Buffer(id) => {
                    buffer_barriers.push(GfxBufferBarrier::new().buffer(self.buffer(id)?.handle()).mask(mask));
                }
                ResourceRef::Texture(id) => image_barriers.push(
                    GfxImageBarrier::new()
                        .image(self.texture(id)?.handle())
                        .layout_transfer(state_layout(t.before), state_layout(t.after))
                        .mask(mask),
                ),
                // 加速结构的 buffer 不对外暴露，使用全局的 memory barrier
                ResourceRef::Accel(id) => {
                    self.accel(id)?;
                    memory_barriers.push(
                        vk::MemoryBarrier2::default()
                            .src_stage_mask(mask.src_stage)
                            .src_access_mask(mask.src_access)
                            .dst_stage_mask(mask.dst_stage)
                            .dst_access_mask(mask.dst_access),
                    );
                }
            }
        }
        cmd.pipeline_barrier(&memory_barriers, &buffer_barriers, &image_barriers);
        Ok(())
    }

    fn record_trace_rays(&self, cmd: &GfxCommandBuffer, desc: &TraceRaysDesc) -> DeviceResult<()> {
        let tlas = [self.accel(desc.tlas)?.handle()];
        let output = self.texture(desc.output)?;
        let constants = self.buffer(desc.constants)?.handle();
        let sbt_address = self.buffer_address(desc.shader_table, 0)?;

        let mut tlas_info = vk::WriteDescriptorSetAccelerationStructureKHR::default().acceleration_structures(&tlas);
        let image_info = [vk::DescriptorImageInfo::default().image_view(output.view()).image_layout(vk::ImageLayout::GENERAL)];
        let buffer_info = [vk::DescriptorBufferInfo::default().buffer(constants).offset(0).range(vk::WHOLE_SIZE)];
        let writes = [
            vk::WriteDescriptorSet::default()
                .dst_binding(GfxRtBindings::TLAS)
                .descriptor_type(vk::DescriptorType::ACCELERATION_STRUCTURE_KHR)
                .descriptor_count(1)
                .push_next(&mut tlas_info),
            vk::WriteDescriptorSet::default()
                .dst_binding(GfxRtBindings::OUTPUT_IMAGE)
                .descriptor_type(vk::DescriptorType::STORAGE_IMAGE)
                .image_info(&image_info),
            vk::WriteDescriptorSet::default()
                .dst_binding(GfxRtBindings::SCENE_CONSTANTS)
                .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
                .buffer_info(&buffer_info),
        ];

        let region = |r: &SbtRegion| {
            vk::StridedDeviceAddressRegionKHR::default()
                .device_address(sbt_address + r.offset)
                .stride(r.stride)
                .size(r.size)
        };

        cmd.cmd_bind_pipeline(vk::PipelineBindPoint::RAY_TRACING_KHR, self.pipeline.handle());
        cmd.push_descriptor_set(vk::PipelineBindPoint::RAY_TRACING_KHR, self.pipeline.layout(), 0, &writes);
        cmd.trace_rays(
            &region(&desc.raygen),
            &region(&desc.miss),
            &region(&desc.hit),
            &vk::StridedDeviceAddressRegionKHR::default(),
            [desc.width, desc.height, 1],
        );
        Ok(())
    }

    fn record(&self, cmd: &GfxCommandBuffer, list: &CommandList, transfer_only: bool) -> DeviceResult<()> {
        for command in list.commands() {
            match command {
                GpuCommand::Barrier(transitions) => self.record_barrier(cmd, transitions, transfer_only)?,
                GpuCommand::CopyBuffer {
                    src,
                    src_offset,
                    dst,
                    dst_offset,
                    size,
                } => {
                    let region = vk::BufferCopy::default().src_offset(*src_offset).dst_offset(*dst_offset).size(*size);
                    cmd.cmd_copy_buffer(self.buffer(*src)?.handle(), self.buffer(*dst)?.handle(), &[region]);
                }
                GpuCommand::CopyBufferToTexture {
                    src,
                    src_offset,
                    row_pitch,
                    dst,
                } => {
                    let image = self.texture(*dst)?;
                    let region = buffer_image_copy(image, *src_offset, *row_pitch);
                    let info = vk::CopyBufferToImageInfo2::default()
                        .src_buffer(self.buffer(*src)?.handle())
                        .dst_image(image.handle())
                        .dst_image_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
                        .regions(std::slice::from_ref(&region));
                    cmd.cmd_copy_buffer_to_image(&info);
                }
                GpuCommand::CopyTextureToBuffer {
                    src,
                    dst,
                    dst_offset,
                    row_pitch,
                } => {
                    let image = self.texture(*src)?;
                    let region = buffer_image_copy(image, *dst_offset, *row_pitch);
                    let info = vk::CopyImageToBufferInfo2::default()
                        .src_image(image.handle())
                        .src_image_layout(vk::ImageLayout::TRANSFER_SRC_OPTIMAL)
                        .dst_buffer(self.buffer(*dst)?.handle())
                        .regions(std::slice::from_ref(&region));
                    cmd.cmd_copy_image_to_buffer(&info);
                }
                GpuCommand::CopyTexture { src, dst } => {
                    let (src, dst) = (self.texture(*src)?, self.texture(*dst)?);
                    let region = vk::ImageCopy2::default()
                        .src_subresource(GfxImage2D::subresource_layers())
                        .dst_subresource(GfxImage2D::subresource_layers())
                        .extent(vk::Extent3D {
                            width: src.width().min(dst.width()),
                            height: src.height().min(dst.height()),
                            depth: 1,
                        });
                    let info = vk::CopyImageInfo2::default()
                        .src_image(src.handle())
                        .src_image_layout(vk::ImageLayout::TRANSFER_SRC_OPTIMAL)
                        .dst_image(dst.handle())
                        .dst_image_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
                        .regions(std::slice::from_ref(&region));
                    cmd.cmd_copy_image(&info);
                }
                GpuCommand::BuildAcceleration {
                    dst,
                    geometry,
                    scratch,
                    scratch_offset,
                } => {
                    let input = self.accel_input(geometry)?;
                    let scratch_address = self.buffer_address(*scratch, *scratch_offset)?;
                    self.accel(*dst)?.cmd_build(cmd, &input, scratch_address);
                }
                GpuCommand::TraceRays(desc) => self.record_trace_rays(cmd, desc)?,
            }
        }
        Ok(())
    }
}

fn buffer_image_copy(image: &GfxImage2D, buffer_offset: u64, row_pitch: u64) -> vk::BufferImageCopy2<'static> {
    let texel_size = match image.format() {
        vk::Format::R8_UNORM => 1,
        vk::Format::R16_SFLOAT => 2,
        _ => 4,
    };
    vk::BufferImageCopy2::default()
        .buffer_offset(buffer_offset)
        // 以 texel 为单位
        .buffer_row_length((row_pitch / texel_size) as u32)
        .buffer_image_height(image.height())
        .image_subresource(GfxImage2D::subresource_layers())
        .image_extent(vk::Extent3D {
            width: image.width(),
            height: image.height(),
            depth: 1,
        })
}

fn invalid(id: impl Into<ResourceRef>) -> DeviceError {
    DeviceError::InvalidResource(format!("{:?} does not exist", id.into()))
}

impl RtDevice for VulkanDevice {
    fn kind(&self) -> BackendKind {
        BackendKind::Vulkan
    }

    fn caps(&self) -> &DeviceCaps {
        &self.caps
    }

    fn check_device(&mut self) -> DeviceResult<DeviceStatus> {
        if !self.lost {
            // 查询 timeline 可以发现已经丢失的设备
            for queue in QueueKind::ALL {
                if let Err(e) = self.completed(queue) {
                    if !self.lost {
                        return Err(e);
                    }
                    break;
                }
            }
            if !self.lost {
                return Ok(DeviceStatus::Ok);
            }
        }

        log::warn!("recreating vulkan device");
        if let Some(core) = self.core.take() {
            core.destroy();
        }
        let core = VulkanCore::new(&self.create_info, self.shader_dir.as_deref())?;
        self.caps = core.caps();
        self.core = Some(core);
        self.lost = false;
        Ok(DeviceStatus::Reset)
    }

    fn create_buffer(&mut self, desc: &BufferDesc) -> DeviceResult<BufferId> {
        let core = self.core()?;
        let location = match desc.location {
            MemoryLocation::GpuOnly => GfxMemoryLocation::GpuOnly,
            MemoryLocation::Upload => GfxMemoryLocation::CpuToGpu,
            MemoryLocation::Readback => GfxMemoryLocation::GpuToCpu,
        };
        let align = if desc.usage.contains(BufferUsage::SHADER_TABLE) {
            Some(self.caps.shader_group_base_alignment as u64)
        } else if desc.usage.contains(BufferUsage::ACCEL_SCRATCH) {
            Some(self.caps.scratch_alignment)
        } else {
            None
        };
        let result = GfxBuffer::new(&core.gfx, desc.size, Self::buffer_usage(desc), location, align, &desc.label);
        let buffer = result.map_err(|e| self.track(e))?;
        let core = self.core_mut()?;
        Ok(core.buffers.insert(VkBufferSlot::Owned(buffer)))
    }

    fn import_buffer(&mut self, native: NativeBuffer) -> DeviceResult<BufferId> {
        let core = self.core_mut()?;
        let handle = vk::Buffer::from_raw(native.raw);
        if handle.is_null() {
            return Err(DeviceError::InvalidResource("null native buffer".to_string()));
        }
        let address = unsafe {
            core.gfx.gfx_device().get_buffer_device_address(&vk::BufferDeviceAddressInfo::default().buffer(handle))
        };
        Ok(core.buffers.insert(VkBufferSlot::External {
            handle,
            size: native.size,
            address,
        }))
    }

    fn destroy_buffer(&mut self, id: BufferId) {
        let Some(core) = self.core.as_mut() else {
            return;
        };
        if let Some(VkBufferSlot::Owned(buffer)) = core.buffers.remove(id) {
            buffer.destroy(&core.gfx);
        }
    }

    fn create_texture(&mut self, desc: &TextureDesc) -> DeviceResult<TextureId> {
        let core = self.core()?;
        let result = GfxImage2D::new(
            &core.gfx,
            vk::Extent2D {
                width: desc.width,
                height: desc.height,
            },
            Self::vk_format(desc.format),
            vk::ImageUsageFlags::STORAGE | vk::ImageUsageFlags::TRANSFER_SRC | vk::ImageUsageFlags::TRANSFER_DST,
            &desc.label,
        );
        let image = result.map_err(|e| self.track(e))?;
        let core = self.core_mut()?;
        Ok(core.textures.insert(image))
    }

    fn import_texture(&mut self, native: NativeTexture, format: TextureFormat) -> DeviceResult<TextureId> {
        let core = self.core()?;
        let handle = vk::Image::from_raw(native.raw);
        if handle.is_null() {
            return Err(DeviceError::InvalidResource("null native texture".to_string()));
        }
        let result = GfxImage2D::import(
            &core.gfx,
            handle,
            vk::Extent2D {
                width: native.width,
                height: native.height,
            },
            Self::vk_format(format),
            "host-texture",
        );
        let image = result.map_err(|e| self.track(e))?;
        let core = self.core_mut()?;
        Ok(core.textures.insert(image))
    }

    fn destroy_texture(&mut self, id: TextureId) {
        let Some(core) = self.core.as_mut() else {
            return;
        };
        if let Some(image) = core.textures.remove(id) {
            image.destroy(&core.gfx);
        }
    }

    fn native_texture(&self, id: TextureId) -> Option<NativeTexture> {
        let image = self.core.as_ref()?.textures.get(id)?;
        Some(NativeTexture {
            raw: image.handle().as_raw(),
            width: image.width(),
            height: image.height(),
        })
    }

    fn acceleration_sizes(&self, geometry: &AccelGeometry) -> DeviceResult<AccelSizes> {
        let core = self.core()?;
        let sizes = GfxAcceleration::build_sizes(&core.gfx, &core.accel_input(geometry)?);
        Ok(AccelSizes {
            structure_size: sizes.acceleration_structure_size,
            scratch_size: sizes.build_scratch_size,
        })
    }

    fn create_acceleration(&mut self, kind: AccelKind, size: u64) -> DeviceResult<AccelId> {
        let core = self.core()?;
        let (ty, name) = match kind {
            AccelKind::Bottom => (vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL, "blas"),
            AccelKind::Top => (vk::AccelerationStructureTypeKHR::TOP_LEVEL, "tlas"),
        };
        let accel = GfxAcceleration::new(&core.gfx, size, ty, name).map_err(|e| self.track(e))?;
        let core = self.core_mut()?;
        Ok(core.accels.insert(accel))
    }

    fn destroy_acceleration(&mut self, id: AccelId) {
        let Some(core) = self.core.as_mut() else {
            return;
        };
        if let Some(accel) = core.accels.remove(id) {
            accel.destroy(&core.gfx);
        }
    }

    fn acceleration_address(&self, id: AccelId) -> DeviceResult<u64> {
        Ok(self.core()?.accel(id)?.device_address())
    }

    fn write_buffer(&mut self, id: BufferId, offset: u64, data: &[u8]) -> DeviceResult<()> {
        let core = self.core()?;
        let result = match core.buffer(id)? {
            VkBufferSlot::Owned(buffer) => buffer.write_mapped(&core.gfx, offset, data),
            VkBufferSlot::External { size, .. } => {
                return Err(DeviceError::InvalidState(format!("host buffer ({} bytes) is not mapped", size)));
            }
        };
        result.map_err(|e| self.track(e))
    }

    fn read_buffer(&mut self, id: BufferId, offset: u64, dst: &mut [u8]) -> DeviceResult<()> {
        let core = self.core()?;
        let result = match core.buffer(id)? {
            VkBufferSlot::Owned(buffer) => buffer.read_mapped(&core.gfx, offset, dst),
            VkBufferSlot::External { size, .. } => {
                return Err(DeviceError::InvalidState(format!("host buffer ({} bytes) is not mapped", size)));
            }
        };
        result.map_err(|e| self.track(e))
    }

    fn shader_group_handle(&self, group: ShaderGroup) -> &[u8] {
        match &self.core {
            Some(core) => core.pipeline.group_handle(group),
            None => &[],
        }
    }

    fn submit(&mut self, queue: QueueKind, commands: CommandList, waits: &[FencePoint]) -> DeviceResult<FencePoint> {
        let _span = tracy_client::span!("VulkanDevice::submit");
        let core = self.core()?;
        for wait in waits {
            if wait.value > core.queues[wait.queue.index()].submitted {
                return Err(DeviceError::InvalidState(format!("waiting on unsubmitted {:?}", wait)));
            }
        }
        let wait_semaphores = waits
            .iter()
            .filter(|w| w.value > 0)
            .map(|w| (core.queues[w.queue.index()].timeline.clone(), w.value))
            .collect_vec();

        let ctx = &core.queues[queue.index()];
        let cmd = GfxCommandBuffer::new(&ctx.command_pool, commands.label()).map_err(DeviceError::from)?;
        let recorded = cmd
            .begin(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT, commands.label())
            .map_err(DeviceError::from)
            .and_then(|_| core.record(&cmd, &commands, ctx.transfer_only))
            .and_then(|_| cmd.end().map_err(DeviceError::from));
        if let Err(e) = recorded {
            cmd.free();
            return Err(e);
        }

        let value = ctx.submitted + 1;
        let mut submit_info = GfxSubmitInfo::new(&[&cmd]);
        for (semaphore, wait_value) in &wait_semaphores {
            submit_info = submit_info.wait(semaphore, vk::PipelineStageFlags2::ALL_COMMANDS, *wait_value);
        }
        submit_info = submit_info.signal(&ctx.timeline, vk::PipelineStageFlags2::ALL_COMMANDS, value);

        let vk_queue = match queue {
            QueueKind::Copy => core.gfx.transfer_queue(),
            QueueKind::Raytrace => core.gfx.compute_queue(),
        };
        if let Err(e) = vk_queue.submit(&[submit_info], None) {
            cmd.free();
            return Err(self.track(e));
        }

        let ctx = &mut self.core_mut()?.queues[queue.index()];
        ctx.submitted = value;
        ctx.pending.push((value, cmd));
        log::trace!("submit {} to {:?} queue, value {}", commands.label(), ctx.kind, value);
        Ok(FencePoint { queue, value })
    }

    fn completed(&mut self, queue: QueueKind) -> DeviceResult<u64> {
        let core = self.core()?;
        let ctx = &core.queues[queue.index()];
        let result = ctx.timeline.timeline_value(core.gfx.gfx_device());
        let value = result.map_err(|e| self.track(e))?;
        self.core_mut()?.queues[queue.index()].recycle(value);
        Ok(value)
    }

    fn wait(&mut self, point: FencePoint) -> DeviceResult<()> {
        let _span = tracy_client::span!("VulkanDevice::wait");
        let core = self.core()?;
        let ctx = &core.queues[point.queue.index()];
        if point.value > ctx.submitted {
            return Err(DeviceError::InvalidState(format!("waiting on unsubmitted {:?}", point)));
        }
        let result = ctx.timeline.wait_timeline(core.gfx.gfx_device(), point.value, u64::MAX);
        result.map_err(|e| self.track(e))?;
        self.core_mut()?.queues[point.queue.index()].recycle(point.value);
        Ok(())
    }
}

//! CPU 上的设备实现
//!
//! 命令在提交时立即执行，fence 在提交时立即完成（可以通过 [`SoftDevice::hold_completion`] 推迟）。
//! 执行前会校验每个资源的状态与 barrier 是否一致，用于在没有 GPU 的环境下验证渲染管线。
//!
//! [`SoftDevice`] 可以被 clone，所有 clone 共享同一个设备，测试可以在把设备交给
//! context 之后继续注入故障或者检查统计信息。

pub mod bvh;
pub mod tracer;

use std::collections::HashMap;
use std::sync::Arc;

use glam::Vec3;
use parking_lot::{Mutex, MutexGuard};
use slotmap::{Key, KeyData, SlotMap};

use crate::backend::soft::tracer::{SoftBlas, SoftTlas, SoftTlasInstance, TraceInputs};
use crate::backend::{
    AccelGeometry, AccelId, AccelKind, AccelSizes, BackendKind, BufferDesc, BufferId, CommandList, DeviceCaps,
    DeviceError, DeviceResult, DeviceStatus, FencePoint, GpuCommand, MemoryLocation, QueueKind, ResourceRef, RtDevice,
    ShaderGroup, TextureDesc, TextureFormat, TextureId, TraceRaysDesc,
};
use crate::gpu_types::{GpuSceneConstants, HitRecordArgs, RAY_TYPE_COUNT, TlasInstance};
use crate::host::{IndexFormat, MeshData, MeshLayout};
use crate::resource_state::ResourceState;
use crate::translator::{NativeBuffer, NativeTexture};

const HANDLE_SIZE: u32 = 32;

struct SoftBuffer {
    data: Vec<u8>,
    location: MemoryLocation,
    /// 宿主注册的 buffer，导入后的 destroy 不会释放它
    native: bool,
    label: String,
}

struct SoftTexture {
    width: u32,
    height: u32,
    format: TextureFormat,
    data: Vec<u8>,
    native: bool,
}

enum SoftAccelData {
    Empty,
    Bottom(Arc<SoftBlas>),
    Top(Arc<SoftTlas>),
}

struct SoftAccel {
    kind: AccelKind,
    size: u64,
    data: SoftAccelData,
}

/// 设备统计，供测试检查
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct SoftStats {
    pub submits: u64,
    pub barriers: u64,
    pub transitions: u64,
    pub builds: u64,
    pub traces: u64,
    pub live_buffers: usize,
    pub live_textures: usize,
    pub live_accels: usize,
}

#[derive(Default)]
struct FaultKnobs {
    hold_completion: bool,
    device_lost: bool,
    fail_next_build: bool,
    fail_next_write: bool,
}

struct SoftState {
    buffers: SlotMap<BufferId, SoftBuffer>,
    textures: SlotMap<TextureId, SoftTexture>,
    accels: SlotMap<AccelId, SoftAccel>,

    states: HashMap<ResourceRef, ResourceState>,
    /// 资源最后一次被各个 queue 使用时的 fence 值
    uses: HashMap<ResourceRef, [u64; 2]>,

    submitted: [u64; 2],
    completed: [u64; 2],
    /// 每次提交等待的其他 fence，完成一个 fence 时它依赖的 fence 也随之完成
    deps: HashMap<FencePoint, Vec<FencePoint>>,

    knobs: FaultKnobs,
    violations: Vec<String>,
    stats: SoftStats,
}

#[derive(Clone)]
pub struct SoftDevice {
    caps: DeviceCaps,
    handles: Arc<[Vec<u8>; 4]>,
    inner: Arc<Mutex<SoftState>>,
}

// new & init
impl SoftDevice {
    pub fn new(row_pitch_alignment: u64) -> Self {
        let caps = DeviceCaps {
            ray_tracing: true,
            texture_row_pitch_alignment: row_pitch_alignment,
            shader_group_handle_size: HANDLE_SIZE,
            shader_group_handle_alignment: 32,
            shader_group_base_alignment: 64,
            scratch_alignment: 128,
        };
        let handles = ShaderGroup::ALL.map(|group| {
            let mut handle = vec![0u8; HANDLE_SIZE as usize];
            handle[..4].copy_from_slice(b"RTHS");
            handle[4] = group_index(group) as u8 + 1;
            handle
        });
        let state = SoftState {
            buffers: SlotMap::with_key(),
            textures: SlotMap::with_key(),
            accels: SlotMap::with_key(),
            states: HashMap::new(),
            uses: HashMap::new(),
            submitted: [0; 2],
            completed: [0; 2],
            deps: HashMap::new(),
            knobs: FaultKnobs::default(),
            violations: Vec::new(),
            stats: SoftStats::default(),
        };
        Self {
            caps,
            handles: Arc::new(handles),
            inner: Arc::new(Mutex::new(state)),
        }
    }

    /// 模拟不支持光追的设备
    pub fn without_ray_tracing(mut self) -> Self {
        self.caps.ray_tracing = false;
        self
    }

    #[inline]
    fn lock(&self) -> MutexGuard<'_, SoftState> {
        self.inner.lock()
    }
}

// 测试用的控制接口
impl SoftDevice {
    /// 打开之后提交的工作只有在 [`RtDevice::wait`] 或 [`SoftDevice::complete_all`] 时才完成
    pub fn hold_completion(&self, hold: bool) {
        self.lock().knobs.hold_completion = hold;
    }

    pub fn complete_all(&self) {
        let mut state = self.lock();
        state.completed = state.submitted;
    }

    /// 之后的调用都返回 [`DeviceError::DeviceLost`]，直到 [`RtDevice::check_device`] 重建设备
    pub fn simulate_device_loss(&self) {
        log::warn!("soft device: simulating device loss");
        self.lock().knobs.device_lost = true;
    }

    /// 下一次包含加速结构构建的提交会失败
    pub fn fail_next_build(&self) {
        self.lock().knobs.fail_next_build = true;
    }

    /// 下一次 host 写入 buffer 会失败
    pub fn fail_next_write(&self) {
        self.lock().knobs.fail_next_write = true;
    }

    /// 渲染管线违反同步约定的记录，例如销毁仍在使用的资源、多余的 barrier
    pub fn violations(&self) -> Vec<String> {
        self.lock().violations.clone()
    }

    pub fn stats(&self) -> SoftStats {
        let state = self.lock();
        SoftStats {
            live_buffers: state.buffers.iter().filter(|(_, b)| !b.native).count(),
            live_textures: state.textures.iter().filter(|(_, t)| !t.native).count(),
            live_accels: state.accels.len(),
            ..state.stats
        }
    }

    /// 注册一个宿主的 GPU buffer
    pub fn register_native_buffer(&self, data: &[u8]) -> NativeBuffer {
        let mut state = self.lock();
        let id = state.buffers.insert(SoftBuffer {
            data: data.to_vec(),
            location: MemoryLocation::GpuOnly,
            native: true,
            label: "native".to_string(),
        });
        NativeBuffer {
            raw: id.data().as_ffi(),
            size: data.len() as u64,
        }
    }

    /// 注册一个宿主的纹理
    pub fn register_native_texture(&self, width: u32, height: u32, format: TextureFormat) -> NativeTexture {
        let mut state = self.lock();
        let id = state.textures.insert(SoftTexture {
            width,
            height,
            format,
            data: vec![0u8; (width as u64 * height as u64 * format.bytes_per_pixel()) as usize],
            native: true,
        });
        NativeTexture {
            raw: id.data().as_ffi(),
            width,
            height,
        }
    }

    /// 宿主纹理当前的内容
    pub fn native_texture_data(&self, native: NativeTexture) -> Option<Vec<u8>> {
        let id = TextureId::from(KeyData::from_ffi(native.raw));
        self.lock().textures.get(id).map(|t| t.data.clone())
    }
}

fn group_index(group: ShaderGroup) -> usize {
    match group {
        ShaderGroup::RayGen => 0,
        ShaderGroup::CameraMiss => 1,
        ShaderGroup::ShadowMiss => 2,
        ShaderGroup::Hit => 3,
    }
}

impl SoftState {
    fn check_alive(&self) -> DeviceResult<()> {
        if self.knobs.device_lost {
            return Err(DeviceError::DeviceLost("soft device lost".to_string()));
        }
        Ok(())
    }

    fn exists(&self, resource: ResourceRef) -> bool {
        match resource {
            ResourceRef::Buffer(id) => self.buffers.contains_key(id),
            ResourceRef::Texture(id) => self.textures.contains_key(id),
            ResourceRef::Accel(id) => self.accels.contains_key(id),
        }
    }

    fn in_flight(&self, resource: ResourceRef) -> bool {
        self.uses
            .get(&resource)
            .is_some_and(|u| QueueKind::ALL.iter().any(|q| u[q.index()] > self.completed[q.index()]))
    }

    fn violation(&mut self, msg: String) {
        log::error!("soft device: {}", msg);
        self.violations.push(msg);
    }

    fn forget(&mut self, resource: ResourceRef) {
        if self.in_flight(resource) {
            self.violation(format!("{:?} destroyed while still in use by the gpu", resource));
        }
        self.states.remove(&resource);
        self.uses.remove(&resource);
    }

    fn complete(&mut self, point: FencePoint) {
        let q = point.queue.index();
        if point.value <= self.completed[q] {
            return;
        }
        let from = self.completed[q] + 1;
        self.completed[q] = point.value;
        let deps: Vec<FencePoint> = (from..=point.value)
            .filter_map(|value| {
                self.deps.remove(&FencePoint {
                    queue: point.queue,
                    value,
                })
            })
            .flatten()
            .collect();
        for dep in deps {
            self.complete(dep);
        }
    }

    /// 设备重建：除了宿主注册的资源，所有资源都失效
    fn reset(&mut self) {
        self.buffers.retain(|_, b| b.native);
        self.textures.retain(|_, t| t.native);
        self.accels.clear();
        self.states.clear();
        self.uses.clear();
        self.deps.clear();
        self.submitted = [0; 2];
        self.completed = [0; 2];
        self.knobs.device_lost = false;
    }
}

// 提交时的校验与执行
impl SoftState {
    /// 校验 barrier 与命令要求的状态，通过后一次性更新状态
    fn validate(&mut self, list: &CommandList, caps: &DeviceCaps) -> DeviceResult<()> {
        let mut states = self.states.clone();
        let mut redundant = Vec::new();

        let expect = |states: &HashMap<ResourceRef, ResourceState>, r: ResourceRef, s: ResourceState| {
            let current = states.get(&r).copied().unwrap_or_default();
            if current == s {
                Ok(())
            } else {
                Err(DeviceError::InvalidState(format!(
                    "`{}`: {:?} is {:?}, command requires {:?}",
                    list.label(),
                    r,
                    current,
                    s
                )))
            }
        };

        for resource in list.resources() {
            if !self.exists(resource) {
                return Err(DeviceError::InvalidResource(format!("`{}` uses destroyed {:?}", list.label(), resource)));
            }
        }

        for cmd in list.commands() {
            match cmd {
                GpuCommand::Barrier(transitions) => {
                    for t in transitions {
                        let current = states.get(&t.resource).copied().unwrap_or_default();
                        if current != t.before {
                            return Err(DeviceError::InvalidState(format!(
                                "`{}`: barrier expects {:?} in {:?} but it is {:?}",
                                list.label(),
                                t.resource,
                                t.before,
                                current
                            )));
                        }
                        if !ResourceState::needs_barrier(t.before, t.after) {
                            redundant.push(format!("redundant barrier {:?} -> {:?} on {:?}", t.before, t.after, t.resource));
                        }
                        states.insert(t.resource, t.after);
                    }
                }
                GpuCommand::CopyBuffer { src, dst, .. } => {
                    expect(&states, (*src).into(), ResourceState::CopySrc)?;
                    expect(&states, (*dst).into(), ResourceState::CopyDst)?;
                }
                GpuCommand::CopyBufferToTexture { src, dst, row_pitch, .. } => {
                    expect(&states, (*src).into(), ResourceState::CopySrc)?;
                    expect(&states, (*dst).into(), ResourceState::CopyDst)?;
                    check_row_pitch(*row_pitch, caps)?;
                }
                GpuCommand::CopyTextureToBuffer { src, dst, row_pitch, .. } => {
                    expect(&states, (*src).into(), ResourceState::CopySrc)?;
                    expect(&states, (*dst).into(), ResourceState::CopyDst)?;
                    check_row_pitch(*row_pitch, caps)?;
                }
                GpuCommand::CopyTexture { src, dst } => {
                    expect(&states, (*src).into(), ResourceState::CopySrc)?;
                    expect(&states, (*dst).into(), ResourceState::CopyDst)?;
                }
                GpuCommand::BuildAcceleration {
                    dst, geometry, scratch, ..
                } => {
                    expect(&states, (*dst).into(), ResourceState::AccelWrite)?;
                    expect(&states, (*scratch).into(), ResourceState::AccelWrite)?;
                    for b in geometry.buffers() {
                        expect(&states, b.into(), ResourceState::BuildInput)?;
                    }
                }
                GpuCommand::TraceRays(desc) => {
                    expect(&states, desc.tlas.into(), ResourceState::AccelRead)?;
                    expect(&states, desc.output.into(), ResourceState::UnorderedAccess)?;
                    expect(&states, desc.constants.into(), ResourceState::Constant)?;
                    expect(&states, desc.shader_table.into(), ResourceState::ShaderTable)?;
                }
            }
        }

        self.states = states;
        for msg in redundant {
            self.violation(msg);
        }
        Ok(())
    }

    /// 执行命令，返回 GPU 间接访问到的资源（被 TLAS 引用的 BLAS）
    fn execute(&mut self, list: &CommandList, handles: &[Vec<u8>; 4]) -> DeviceResult<Vec<ResourceRef>> {
        let mut indirect = Vec::new();
        for cmd in list.commands() {
            match cmd {
                GpuCommand::Barrier(transitions) => {
                    self.stats.barriers += 1;
                    self.stats.transitions += transitions.len() as u64;
                }
                GpuCommand::CopyBuffer {
                    src,
                    src_offset,
                    dst,
                    dst_offset,
                    size,
                } => {
                    let bytes = self.buffer_range(*src, *src_offset, *size)?.to_vec();
                    let dst = self.buffer_range_mut(*dst, *dst_offset, *size)?;
                    dst.copy_from_slice(&bytes);
                }
                GpuCommand::CopyBufferToTexture {
                    src,
                    src_offset,
                    row_pitch,
                    dst,
                } => {
                    let (width, height, format) = self.texture_extent(*dst)?;
                    let row_bytes = (width as u64 * format.bytes_per_pixel()) as usize;
                    let padded = self.buffer_range(*src, *src_offset, row_pitch * height as u64)?.to_vec();
                    let texture = self.textures.get_mut(*dst).ok_or_else(|| invalid(*dst))?;
                    for (y, row) in padded.chunks(*row_pitch as usize).take(height as usize).enumerate() {
                        texture.data[y * row_bytes..(y + 1) * row_bytes].copy_from_slice(&row[..row_bytes]);
                    }
                }
                GpuCommand::CopyTextureToBuffer {
                    src,
                    dst,
                    dst_offset,
                    row_pitch,
                } => {
                    let (width, height, format) = self.texture_extent(*src)?;
                    let row_bytes = (width as u64 * format.bytes_per_pixel()) as usize;
                    let pixels = self.textures.get(*src).ok_or_else(|| invalid(*src))?.data.clone();
                    let dst = self.buffer_range_mut(*dst, *dst_offset, row_pitch * height as u64)?;
                    for (y, row) in pixels.chunks(row_bytes).enumerate() {
                        let start = y * *row_pitch as usize;
                        dst[start..start + row_bytes].copy_from_slice(row);
                    }
                }
                GpuCommand::CopyTexture { src, dst } => {
                    let src_extent = self.texture_extent(*src)?;
                    if src_extent != self.texture_extent(*dst)? {
                        return Err(DeviceError::InvalidState(format!(
                            "texture copy between different extents: {:?} -> {:?}",
                            src, dst
                        )));
                    }
                    let pixels = self.textures.get(*src).ok_or_else(|| invalid(*src))?.data.clone();
                    self.textures.get_mut(*dst).ok_or_else(|| invalid(*dst))?.data = pixels;
                }
                GpuCommand::BuildAcceleration {
                    dst,
                    geometry,
                    scratch,
                    scratch_offset,
                } => {
                    let sizes = self.sizes(geometry);
                    let scratch_size = self.buffers.get(*scratch).ok_or_else(|| invalid(*scratch))?.data.len() as u64;
                    if scratch_offset + sizes.scratch_size > scratch_size {
                        return Err(DeviceError::InvalidState(format!(
                            "scratch buffer too small: need {} bytes",
                            sizes.scratch_size
                        )));
                    }
                    let accel = self.accels.get(*dst).ok_or_else(|| invalid(*dst))?;
                    if accel.size < sizes.structure_size {
                        return Err(DeviceError::InvalidState(format!(
                            "acceleration structure too small: {} < {}",
                            accel.size, sizes.structure_size
                        )));
                    }
                    let data = self.build(accel.kind, geometry, &mut indirect)?;
                    self.accels.get_mut(*dst).ok_or_else(|| invalid(*dst))?.data = data;
                    self.stats.builds += 1;
                }
                GpuCommand::TraceRays(desc) => {
                    self.trace(desc, handles, &mut indirect)?;
                    self.stats.traces += 1;
                }
            }
        }
        Ok(indirect)
    }

    fn buffer_range(&self, id: BufferId, offset: u64, size: u64) -> DeviceResult<&[u8]> {
        let buffer = self.buffers.get(id).ok_or_else(|| invalid(id))?;
        buffer
            .data
            .get(offset as usize..(offset + size) as usize)
            .ok_or_else(|| out_of_range(&buffer.label, offset, size, buffer.data.len()))
    }

    fn buffer_range_mut(&mut self, id: BufferId, offset: u64, size: u64) -> DeviceResult<&mut [u8]> {
        let buffer = self.buffers.get_mut(id).ok_or_else(|| invalid(id))?;
        let len = buffer.data.len();
        buffer
            .data
            .get_mut(offset as usize..(offset + size) as usize)
            .ok_or_else(|| out_of_range(&buffer.label, offset, size, len))
    }

    fn texture_extent(&self, id: TextureId) -> DeviceResult<(u32, u32, TextureFormat)> {
        self.textures.get(id).map(|t| (t.width, t.height, t.format)).ok_or_else(|| invalid(id))
    }

    fn sizes(&self, geometry: &AccelGeometry) -> AccelSizes {
        let count = geometry.primitive_count() as u64;
        match geometry {
            AccelGeometry::Triangles { .. } => AccelSizes {
                structure_size: 256 + count * 48,
                scratch_size: 128 + count * 16,
            },
            AccelGeometry::Instances { .. } => AccelSizes {
                structure_size: 256 + count * 64,
                scratch_size: 128 + count * 16,
            },
        }
    }

    fn build(
        &self,
        kind: AccelKind,
        geometry: &AccelGeometry,
        indirect: &mut Vec<ResourceRef>,
    ) -> DeviceResult<SoftAccelData> {
        match (kind, geometry) {
            (
                AccelKind::Bottom,
                AccelGeometry::Triangles {
                    vertices,
                    vertex_offset,
                    vertex_stride,
                    vertex_count,
                    indices,
                    index_offset,
                    index_format,
                    index_count,
                },
            ) => {
                let layout = MeshLayout {
                    vertex_stride: *vertex_stride as u32,
                    vertex_count: *vertex_count,
                    vertex_offset: 0,
                    index_format: *index_format,
                    index_count: *index_count,
                    index_offset: 0,
                };
                let vertex_bytes = &self.buffers.get(*vertices).ok_or_else(|| invalid(*vertices))?.data;
                let index_bytes = &self.buffers.get(*indices).ok_or_else(|| invalid(*indices))?.data;
                let positions: Vec<Vec3> =
                    MeshData::read_positions(&layout, vertex_bytes.get(*vertex_offset as usize..).unwrap_or(&[]));
                let index_values = MeshData::read_indices(&layout, index_bytes.get(*index_offset as usize..).unwrap_or(&[]));
                if *index_format == IndexFormat::U16 && *vertex_count > u16::MAX as u32 + 1 {
                    log::warn!("16-bit indices cannot address {} vertices", vertex_count);
                }
                Ok(SoftAccelData::Bottom(Arc::new(SoftBlas::build(positions, &index_values))))
            }
            (AccelKind::Top, AccelGeometry::Instances { instances, offset, count }) => {
                let size = *count as u64 * std::mem::size_of::<TlasInstance>() as u64;
                let bytes = self.buffer_range(*instances, *offset, size)?;
                let mut list = Vec::with_capacity(*count as usize);
                for chunk in bytes.chunks_exact(std::mem::size_of::<TlasInstance>()) {
                    let instance: TlasInstance = bytemuck::pod_read_unaligned(chunk);
                    let blas_id = AccelId::from(KeyData::from_ffi(instance.blas_address));
                    let blas = match self.accels.get(blas_id).map(|a| &a.data) {
                        Some(SoftAccelData::Bottom(blas)) => blas.clone(),
                        _ => {
                            return Err(DeviceError::InvalidResource(format!(
                                "instance references unbuilt or destroyed blas {:#x}",
                                instance.blas_address
                            )));
                        }
                    };
                    let state = self.states.get(&ResourceRef::Accel(blas_id)).copied().unwrap_or_default();
                    if state != ResourceState::AccelRead {
                        return Err(DeviceError::InvalidState(format!(
                            "blas {:?} referenced by tlas is {:?}",
                            blas_id, state
                        )));
                    }
                    indirect.push(ResourceRef::Accel(blas_id));
                    list.push(SoftTlasInstance {
                        inverse: instance.matrix().inverse(),
                        instance,
                        blas_id,
                        blas,
                    });
                }
                Ok(SoftAccelData::Top(Arc::new(SoftTlas::build(list))))
            }
            _ => Err(DeviceError::InvalidState(format!("{:?} acceleration structure with mismatched geometry", kind))),
        }
    }

    fn trace(&mut self, desc: &TraceRaysDesc, handles: &[Vec<u8>; 4], indirect: &mut Vec<ResourceRef>) -> DeviceResult<()> {
        let tlas = match self.accels.get(desc.tlas).map(|a| &a.data) {
            Some(SoftAccelData::Top(tlas)) => tlas.clone(),
            _ => return Err(DeviceError::InvalidState(format!("trace rays on unbuilt tlas {:?}", desc.tlas))),
        };
        // TLAS 引用的 BLAS 必须仍然存在
        for inst in tlas.instances() {
            if !self.accels.contains_key(inst.blas_id) {
                return Err(DeviceError::InvalidResource(format!("tlas references destroyed blas {:?}", inst.blas_id)));
            }
            indirect.push(ResourceRef::Accel(inst.blas_id));
        }

        let constants_bytes = self.buffer_range(desc.constants, 0, std::mem::size_of::<GpuSceneConstants>() as u64)?;
        let constants: GpuSceneConstants = bytemuck::pod_read_unaligned(constants_bytes);

        // shader table 中的 handle 必须与对应的 group 一致
        let handle_size = HANDLE_SIZE as u64;
        let table = &self.buffers.get(desc.shader_table).ok_or_else(|| invalid(desc.shader_table))?.data;
        let record = |offset: u64, size: u64| -> DeviceResult<&[u8]> {
            table
                .get(offset as usize..(offset + size) as usize)
                .ok_or_else(|| out_of_range("shader table", offset, size, table.len()))
        };
        let expect_handle = |offset: u64, group: ShaderGroup| -> DeviceResult<()> {
            if record(offset, handle_size)? != handles[group_index(group)].as_slice() {
                return Err(DeviceError::InvalidState(format!(
                    "shader record at {} does not hold the {:?} handle",
                    offset, group
                )));
            }
            Ok(())
        };
        expect_handle(desc.raygen.offset, ShaderGroup::RayGen)?;
        expect_handle(desc.miss.offset, ShaderGroup::CameraMiss)?;
        expect_handle(desc.miss.offset + desc.miss.stride, ShaderGroup::ShadowMiss)?;

        let mut hit_args = Vec::with_capacity(tlas.instances().len());
        for inst in tlas.instances() {
            let mut args = None;
            for ray_type in 0..RAY_TYPE_COUNT {
                let offset = desc.hit.offset + (inst.instance.sbt_offset() + ray_type) as u64 * desc.hit.stride;
                if offset + desc.hit.stride > desc.hit.offset + desc.hit.size {
                    return Err(DeviceError::InvalidState(format!(
                        "hit record {} is outside the hit region",
                        inst.instance.sbt_offset() + ray_type
                    )));
                }
                expect_handle(offset, ShaderGroup::Hit)?;
                let bytes = record(offset + handle_size, std::mem::size_of::<HitRecordArgs>() as u64)?;
                args.get_or_insert(bytemuck::pod_read_unaligned::<HitRecordArgs>(bytes));
            }
            hit_args.extend(args);
        }

        let (width, height, format) = self.texture_extent(desc.output)?;
        if (width, height) != (desc.width, desc.height) {
            return Err(DeviceError::InvalidState(format!(
                "dispatch {}x{} does not match the output {}x{}",
                desc.width, desc.height, width, height
            )));
        }
        let mut pixels = vec![0u8; (width as u64 * height as u64 * format.bytes_per_pixel()) as usize];
        if width > 0 && height > 0 {
            TraceInputs {
                constants: &constants,
                tlas: &tlas,
                hit_args: &hit_args,
            }
            .run(width, height, format, &mut pixels);
        }
        self.textures.get_mut(desc.output).ok_or_else(|| invalid(desc.output))?.data = pixels;
        Ok(())
    }
}

fn check_row_pitch(row_pitch: u64, caps: &DeviceCaps) -> DeviceResult<()> {
    if row_pitch % caps.texture_row_pitch_alignment != 0 {
        return Err(DeviceError::InvalidState(format!(
            "row pitch {} is not aligned to {}",
            row_pitch, caps.texture_row_pitch_alignment
        )));
    }
    Ok(())
}

fn invalid(id: impl Into<ResourceRef>) -> DeviceError {
    DeviceError::InvalidResource(format!("{:?} does not exist", id.into()))
}

fn out_of_range(label: &str, offset: u64, size: u64, len: usize) -> DeviceError {
    DeviceError::InvalidState(format!("range {}..{} out of bounds of `{}` ({} bytes)", offset, offset + size, label, len))
}

impl RtDevice for SoftDevice {
    fn kind(&self) -> BackendKind {
        BackendKind::Soft
    }

    fn caps(&self) -> &DeviceCaps {
        &self.caps
    }

    fn check_device(&mut self) -> DeviceResult<DeviceStatus> {
        let mut state = self.lock();
        if state.knobs.device_lost {
            log::warn!("soft device: recreating after device loss");
            state.reset();
            return Ok(DeviceStatus::Reset);
        }
        Ok(DeviceStatus::Ok)
    }

    fn create_buffer(&mut self, desc: &BufferDesc) -> DeviceResult<BufferId> {
        let mut state = self.lock();
        state.check_alive()?;
        Ok(state.buffers.insert(SoftBuffer {
            data: vec![0u8; desc.size as usize],
            location: desc.location,
            native: false,
            label: desc.label.clone(),
        }))
    }

    fn import_buffer(&mut self, native: NativeBuffer) -> DeviceResult<BufferId> {
        let state = self.lock();
        state.check_alive()?;
        let id = BufferId::from(KeyData::from_ffi(native.raw));
        match state.buffers.get(id) {
            Some(b) if b.native => Ok(id),
            _ => Err(DeviceError::InvalidResource(format!("unknown native buffer {:#x}", native.raw))),
        }
    }

    fn destroy_buffer(&mut self, id: BufferId) {
        let mut state = self.lock();
        state.forget(id.into());
        if state.buffers.get(id).is_some_and(|b| !b.native) {
            state.buffers.remove(id);
        }
    }

    fn create_texture(&mut self, desc: &TextureDesc) -> DeviceResult<TextureId> {
        let mut state = self.lock();
        state.check_alive()?;
        Ok(state.textures.insert(SoftTexture {
            width: desc.width,
            height: desc.height,
            format: desc.format,
            data: vec![0u8; (desc.width as u64 * desc.height as u64 * desc.format.bytes_per_pixel()) as usize],
            native: false,
        }))
    }

    fn import_texture(&mut self, native: NativeTexture, format: TextureFormat) -> DeviceResult<TextureId> {
        let state = self.lock();
        state.check_alive()?;
        let id = TextureId::from(KeyData::from_ffi(native.raw));
        match state.textures.get(id) {
            Some(t) if t.native && t.format == format => Ok(id),
            Some(t) if t.native => Err(DeviceError::InvalidResource(format!(
                "native texture {:#x} is {:?}, expected {:?}",
                native.raw, t.format, format
            ))),
            _ => Err(DeviceError::InvalidResource(format!("unknown native texture {:#x}", native.raw))),
        }
    }

    fn destroy_texture(&mut self, id: TextureId) {
        let mut state = self.lock();
        state.forget(id.into());
        if state.textures.get(id).is_some_and(|t| !t.native) {
            state.textures.remove(id);
        }
    }

    fn native_texture(&self, id: TextureId) -> Option<NativeTexture> {
        self.lock().textures.get(id).map(|t| NativeTexture {
            raw: id.data().as_ffi(),
            width: t.width,
            height: t.height,
        })
    }

    fn acceleration_sizes(&self, geometry: &AccelGeometry) -> DeviceResult<AccelSizes> {
        let state = self.lock();
        state.check_alive()?;
        Ok(state.sizes(geometry))
    }

    fn create_acceleration(&mut self, kind: AccelKind, size: u64) -> DeviceResult<AccelId> {
        let mut state = self.lock();
        state.check_alive()?;
        Ok(state.accels.insert(SoftAccel {
            kind,
            size,
            data: SoftAccelData::Empty,
        }))
    }

    fn destroy_acceleration(&mut self, id: AccelId) {
        let mut state = self.lock();
        state.forget(id.into());
        state.accels.remove(id);
    }

    fn acceleration_address(&self, id: AccelId) -> DeviceResult<u64> {
        let state = self.lock();
        state.check_alive()?;
        if !state.accels.contains_key(id) {
            return Err(invalid(id));
        }
        Ok(id.data().as_ffi())
    }

    fn write_buffer(&mut self, id: BufferId, offset: u64, data: &[u8]) -> DeviceResult<()> {
        let mut state = self.lock();
        state.check_alive()?;
        if std::mem::take(&mut state.knobs.fail_next_write) {
            return Err(DeviceError::OutOfMemory(format!("host write to {:?} failed", id)));
        }
        let location = state.buffers.get(id).ok_or_else(|| invalid(id))?.location;
        if location != MemoryLocation::Upload {
            return Err(DeviceError::InvalidState(format!("{:?} is not host writable", id)));
        }
        if state.in_flight(id.into()) {
            state.violation(format!("host write to {:?} while the gpu may still read it", id));
        }
        state.buffer_range_mut(id, offset, data.len() as u64)?.copy_from_slice(data);
        Ok(())
    }

    fn read_buffer(&mut self, id: BufferId, offset: u64, dst: &mut [u8]) -> DeviceResult<()> {
        let mut state = self.lock();
        state.check_alive()?;
        let location = state.buffers.get(id).ok_or_else(|| invalid(id))?.location;
        if location != MemoryLocation::Readback {
            return Err(DeviceError::InvalidState(format!("{:?} is not host readable", id)));
        }
        if state.in_flight(id.into()) {
            state.violation(format!("host read of {:?} before the gpu finished writing it", id));
        }
        dst.copy_from_slice(state.buffer_range(id, offset, dst.len() as u64)?);
        Ok(())
    }

    fn shader_group_handle(&self, group: ShaderGroup) -> &[u8] {
        &self.handles[group_index(group)]
    }

    fn submit(&mut self, queue: QueueKind, commands: CommandList, waits: &[FencePoint]) -> DeviceResult<FencePoint> {
        let _span = tracy_client::span!("SoftDevice::submit");
        let mut state = self.lock();
        state.check_alive()?;

        for wait in waits {
            if wait.value > state.submitted[wait.queue.index()] {
                return Err(DeviceError::InvalidState(format!(
                    "`{}` waits on unsubmitted fence {:?}",
                    commands.label(),
                    wait
                )));
            }
        }

        let has_build = commands.commands().iter().any(|c| matches!(c, GpuCommand::BuildAcceleration { .. }));
        if has_build && state.knobs.fail_next_build {
            state.knobs.fail_next_build = false;
            return Err(DeviceError::BuildFailed(format!("`{}`: injected build failure", commands.label())));
        }

        state.validate(&commands, &self.caps)?;
        let indirect = state.execute(&commands, &self.handles)?;

        let q = queue.index();
        state.submitted[q] += 1;
        let point = FencePoint {
            queue,
            value: state.submitted[q],
        };
        for resource in commands.resources().into_iter().chain(indirect) {
            state.uses.entry(resource).or_default()[q] = point.value;
        }
        state.stats.submits += 1;
        if !waits.is_empty() {
            state.deps.insert(point, waits.to_vec());
        }
        if !state.knobs.hold_completion {
            state.complete(point);
        }
        Ok(point)
    }

    fn completed(&mut self, queue: QueueKind) -> DeviceResult<u64> {
        let state = self.lock();
        state.check_alive()?;
        Ok(state.completed[queue.index()])
    }

    fn wait(&mut self, point: FencePoint) -> DeviceResult<()> {
        let mut state = self.lock();
        state.check_alive()?;
        if point.value > state.submitted[point.queue.index()] {
            return Err(DeviceError::InvalidState(format!("wait on unsubmitted fence {:?}", point)));
        }
        state.complete(point);
        Ok(())
    }
}

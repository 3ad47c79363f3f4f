//! 单个 renderer 的帧流水线
//!
//! 一帧分三次提交：copy queue 上传数据，raytrace queue 构建加速结构并 dispatch，
//! copy queue 把输出回读到 CPU。raytrace 的提交等待上传的 fence，回读等待 raytrace 的 fence。
//! 宿主数据只在开始时拍一次快照，之后的流水线不再持有 world 的锁。

use std::collections::HashMap;
use std::sync::Arc;

use glam::{Mat4, Vec3};
use itertools::Itertools;

use crate::accel_builder::{self, TopLevel};
use crate::backend::{
    AccelGeometry, AccelId, BufferDesc, BufferId, BufferUsage, CommandList, FencePoint, GpuCommand, MemoryLocation,
    QueueKind, RtDevice, TextureDesc, TextureId, TraceRaysDesc,
};
use crate::deformer::{self, Deformed};
use crate::error::{RthsError, RthsResult};
use crate::frame::{FrameOutcome, FramePhase, PurgeList, TransientPool};
use crate::gpu_types::{GpuSceneConstants, HitRecordArgs, INSTANCE_FLAG_FRONT_COUNTERCLOCKWISE, RAY_TYPE_COUNT, TlasInstance};
use crate::handles::{InstanceHandle, MeshHandle, RenderTargetHandle};
use crate::host::{
    MeshData, MeshInstanceData, MeshLayout, MeshSource, RenderFlags, RenderTargetData, RenderTargetFormat, SceneData,
    UpdateFlags, World,
};
use crate::record_cache::{self, RecordCache};
use crate::resource_state::ResourceState;
use crate::scheduler::{Scheduler, strip_rows};
use crate::shader_table::ShaderTableManager;
use crate::translator::{NativeTexture, ResourceTranslator};

/// 渲染管线使用的共享组件，由 context 在每次调用时借出
pub struct FrameContext<'a> {
    pub device: &'a mut dyn RtDevice,
    pub scheduler: &'a mut Scheduler,
    pub translator: &'a mut ResourceTranslator,
    pub records: &'a mut RecordCache,
    pub purge: &'a mut PurgeList,
    pub world: &'a World,
}

/// geometry 列表中一项在这一帧的快照
struct InstanceSnapshot {
    handle: InstanceHandle,
    mesh_handle: MeshHandle,
    mask: u8,
    /// 同一个宿主 instance 在列表中出现多次时共享同一个 id
    instance_id: u32,
    mesh: MeshData,
    data: MeshInstanceData,
}

impl InstanceSnapshot {
    fn needs_deform(&self) -> bool {
        let skinned = self.mesh.skin().valid() && !self.data.bones().is_empty();
        let blended =
            !self.mesh.blendshapes().is_empty() && self.data.blendshape_weights().iter().any(|w| *w != 0.0);
        skinned || blended
    }
}

struct FrameSnapshot {
    target: RenderTargetData,
    instances: Vec<InstanceSnapshot>,
}

/// mesh 在 GPU 上的顶点与索引
#[derive(Copy, Clone)]
struct MeshGeometry {
    vertices: BufferId,
    indices: BufferId,
    layout: MeshLayout,
}

impl MeshGeometry {
    fn accel_geometry(&self) -> AccelGeometry {
        let layout = &self.layout;
        AccelGeometry::Triangles {
            vertices: self.vertices,
            vertex_offset: layout.vertex_offset as u64,
            vertex_stride: layout.vertex_stride as u64,
            vertex_count: layout.vertex_count,
            indices: self.indices,
            index_offset: layout.index_offset as u64,
            index_format: layout.index_format,
            index_count: layout.index_count,
        }
    }
}

/// 上传提交成功之后才写入 record
struct MeshUpload {
    mesh: MeshHandle,
    version: u64,
    vertices: BufferId,
    indices: BufferId,
    owns_buffers: bool,
}

/// raytrace 提交成功之后才写入 record
enum PendingBlas {
    Mesh {
        mesh: MeshHandle,
        version: u64,
        blas: AccelId,
    },
    Instance {
        instance: InstanceHandle,
        mesh: MeshHandle,
        version: u64,
        world_space: bool,
        blas: AccelId,
    },
}

struct OutputTarget {
    texture: TextureId,
    readback: BufferId,
    width: u32,
    height: u32,
    format: RenderTargetFormat,
    row_pitch: u64,
}

#[derive(Copy, Clone, Debug)]
struct InFlight {
    raytrace: FencePoint,
    readback: FencePoint,
}

pub struct Renderer {
    render_target: Option<RenderTargetHandle>,
    scene: SceneData,
    scene_open: bool,

    phase: FramePhase,
    outcome: Option<FrameOutcome>,
    in_flight: Option<InFlight>,

    output: Option<OutputTarget>,
    constants: Option<BufferId>,
    top_level: TopLevel,
    shader_table: ShaderTableManager,
    transients: TransientPool,

    /// 最近一次完成的帧的输出，已经去掉了行对齐
    output_bytes: Vec<u8>,
    has_output: bool,
}

// new & init
impl Renderer {
    pub fn new(shader_table_capacity: u32) -> Self {
        Self {
            render_target: None,
            scene: SceneData::default(),
            scene_open: false,
            phase: FramePhase::Idle,
            outcome: None,
            in_flight: None,
            output: None,
            constants: None,
            top_level: TopLevel::new(),
            shader_table: ShaderTableManager::new(shader_table_capacity),
            transients: TransientPool::new(),
            output_bytes: Vec::new(),
            has_output: false,
        }
    }
}

// getters
impl Renderer {
    #[inline]
    pub fn render_target(&self) -> Option<RenderTargetHandle> {
        self.render_target
    }

    #[inline]
    pub fn scene(&self) -> &SceneData {
        &self.scene
    }

    #[inline]
    pub fn phase(&self) -> FramePhase {
        self.phase
    }

    /// 最近一次结束的帧的结果
    #[inline]
    pub fn outcome(&self) -> Option<FrameOutcome> {
        self.outcome
    }

    #[inline]
    pub fn shader_table_capacity(&self) -> u32 {
        self.shader_table.capacity()
    }

    #[inline]
    pub fn output_texture(&self) -> Option<TextureId> {
        self.output.as_ref().map(|o| o.texture)
    }

    /// 最近一次完成的帧的输出
    pub fn readback(&self, dst: &mut Vec<u8>) -> bool {
        dst.clear();
        if !self.has_output {
            return false;
        }
        dst.extend_from_slice(&self.output_bytes);
        true
    }

    pub fn render_texture(&self, device: &dyn RtDevice) -> Option<NativeTexture> {
        self.output_texture().and_then(|t| device.native_texture(t))
    }
}

// 场景组装
impl Renderer {
    /// 清空上一帧的灯光与几何，相机与渲染参数保持不变
    pub fn begin_scene(&mut self) {
        if self.scene_open {
            log::warn!("begin_scene called twice without end_scene");
        }
        self.scene.clear();
        self.scene_open = true;
    }

    pub fn end_scene(&mut self) {
        if !self.scene_open {
            log::warn!("end_scene called without begin_scene");
        }
        self.scene_open = false;
    }

    #[inline]
    pub fn scene_mut(&mut self) -> &mut SceneData {
        &mut self.scene
    }

    /// 切换 render target 时，旧的输出交给 purge list
    pub fn set_render_target(&mut self, target: Option<RenderTargetHandle>, scheduler: &Scheduler, purge: &mut PurgeList) {
        if self.render_target == target {
            return;
        }
        self.render_target = target;
        self.release_output(scheduler, purge);
        self.output_bytes.clear();
        self.has_output = false;
    }
}

// 帧的生命周期
impl Renderer {
    /// 释放 fence 已经完成的临时资源
    pub fn release_transients(&mut self, device: &mut dyn RtDevice, scheduler: &mut Scheduler) -> usize {
        self.transients.release_retired(device, scheduler)
    }

    /// 录制并提交一帧，结果在 [`Renderer::finish`] 之后可用
    ///
    /// 加速结构构建失败时跳过这一帧，保留上一帧的输出，返回错误
    pub fn render(&mut self, cx: &mut FrameContext) -> RthsResult<()> {
        let _span = tracy_client::span!("Renderer::render");
        if self.phase.in_flight() {
            return Err(RthsError::contract("render called while the previous frame is still in flight"));
        }
        if self.scene_open {
            return Err(RthsError::contract("render called between begin_scene and end_scene"));
        }

        self.transients.release_retired(cx.device, cx.scheduler);
        self.phase = FramePhase::Preparing;
        let result = self.snapshot(cx.world).and_then(|snapshot| self.run_frame(cx, &snapshot));
        if result.is_err() && self.phase != FramePhase::Complete {
            self.phase = FramePhase::Idle;
        }
        result
    }

    /// 等待这一帧完成，把输出回读到 CPU
    pub fn finish(&mut self, cx: &mut FrameContext) -> RthsResult<()> {
        let Some(in_flight) = self.in_flight.take() else {
            log::warn!("finish called with no frame in flight");
            return Ok(());
        };
        let _span = tracy_client::span!("Renderer::finish");
        let result = self.complete(cx, in_flight);
        if result.is_err() {
            self.phase = FramePhase::Idle;
        }
        result
    }

    fn complete(&mut self, cx: &mut FrameContext, in_flight: InFlight) -> RthsResult<()> {
        cx.scheduler.wait_for(cx.device, in_flight.raytrace)?;
        cx.scheduler.wait_for(cx.device, in_flight.readback)?;

        self.phase = FramePhase::Complete;
        self.outcome = Some(FrameOutcome::Rendered);
        let Some(output) = self.output.as_ref() else {
            log::warn!("render target changed while the frame was in flight, output dropped");
            return Ok(());
        };

        let mut padded = vec![0u8; (output.row_pitch * output.height as u64) as usize];
        cx.device.read_buffer(output.readback, 0, &mut padded)?;
        let row_bytes = output.width as usize * output.format.bytes_per_pixel();
        strip_rows(&padded, row_bytes, output.height as usize, output.row_pitch as usize, &mut self.output_bytes);
        self.has_output = true;
        Ok(())
    }

    fn run_frame(&mut self, cx: &mut FrameContext, snapshot: &FrameSnapshot) -> RthsResult<()> {
        self.phase = FramePhase::Uploading;
        let (upload_point, geometries) = self.upload(cx, snapshot)?;
        let deformed = self.deform_instances(cx, snapshot, &geometries)?;

        self.phase = FramePhase::Building;
        let waits = upload_point.into_iter().collect_vec();
        let mut list = CommandList::new("frame");
        let mut pending = Vec::new();
        let mut created = Vec::new();
        let recorded = self.record_raytrace(cx, snapshot, &geometries, &deformed, &mut list, &mut pending, &mut created);
        let submitted = match recorded {
            Ok(tlas) => cx
                .scheduler
                .submit(cx.device, QueueKind::Raytrace, list, &waits)
                .map(|point| (tlas, point))
                .map_err(RthsError::from),
            Err(e) => {
                cx.scheduler.discard(list);
                Err(e)
            }
        };
        let (tlas, raytrace) = match submitted {
            Ok(submitted) => submitted,
            Err(e) => return Err(self.skip_frame(cx, &waits, created, e)),
        };
        self.commit(cx, snapshot, pending, tlas)?;

        let Some(output) = self.output.as_ref() else {
            return Err(RthsError::contract("renderer output is missing after dispatch"));
        };
        let mut list = CommandList::new("readback");
        cx.scheduler.record_texture_readback(&mut list, output.texture, output.readback, output.row_pitch);
        let readback = cx.scheduler.submit(cx.device, QueueKind::Copy, list, &[raytrace])?;

        self.in_flight = Some(InFlight { raytrace, readback });
        self.phase = FramePhase::AwaitingFence;
        log::debug!(
            "frame submitted: {} instances, raytrace fence {}, readback fence {}",
            snapshot.instances.len(),
            raytrace.value,
            readback.value
        );
        Ok(())
    }

    /// 丢弃这一帧新建的加速结构，仍然 signal raytrace queue 的 fence
    fn skip_frame(&mut self, cx: &mut FrameContext, waits: &[FencePoint], created: Vec<AccelId>, err: RthsError) -> RthsError {
        accel_builder::abandon(cx.device, cx.scheduler, created);
        if err.is_device_lost() {
            return err;
        }

        log::warn!("frame skipped, keeping the previous output: {}", err);
        match cx.scheduler.submit(cx.device, QueueKind::Raytrace, CommandList::new("frame-skipped"), waits) {
            Ok(_) => {
                self.phase = FramePhase::Complete;
                self.outcome = Some(FrameOutcome::Skipped);
            }
            Err(e) => log::error!("failed to signal the skipped frame: {}", e),
        }
        err
    }
}

// 快照
impl Renderer {
    fn snapshot(&self, world: &World) -> RthsResult<FrameSnapshot> {
        let _span = tracy_client::span!("Renderer::snapshot");
        let handle = self.render_target.ok_or_else(|| RthsError::contract("renderer has no render target"))?;

        let world = world.lock();
        let target = world
            .render_target(handle)
            .cloned()
            .ok_or_else(|| RthsError::contract(format!("render target {:?} was released", handle)))?;
        if !target.is_valid() {
            return Err(RthsError::contract(format!("render target {:?} has zero extent", handle)));
        }

        let mut ids: HashMap<InstanceHandle, u32> = HashMap::new();
        let mut instances = Vec::with_capacity(self.scene.geometries.len());
        for entry in &self.scene.geometries {
            let Some(data) = world.instance(entry.instance) else {
                log::debug!("skip released instance {:?}", entry.instance);
                continue;
            };
            let Some(mesh) = world.mesh(data.mesh()) else {
                continue;
            };
            let layout = mesh.layout();
            if layout.triangle_count() == 0 || layout.vertex_count == 0 || matches!(mesh.source(), MeshSource::None) {
                log::debug!("skip instance {:?}: mesh has no geometry", entry.instance);
                continue;
            }
            let next = ids.len() as u32;
            let instance_id = *ids.entry(entry.instance).or_insert(next);
            instances.push(InstanceSnapshot {
                handle: entry.instance,
                mesh_handle: data.mesh(),
                mask: entry.mask,
                instance_id,
                mesh: mesh.clone(),
                data: data.clone(),
            });
        }
        Ok(FrameSnapshot { target, instances })
    }
}

// copy queue 上传
impl Renderer {
    fn upload(
        &mut self,
        cx: &mut FrameContext,
        snapshot: &FrameSnapshot,
    ) -> RthsResult<(Option<FencePoint>, HashMap<MeshHandle, MeshGeometry>)> {
        let _span = tracy_client::span!("Renderer::upload");
        let mut list = CommandList::new("upload");
        let mut uploads = Vec::new();

        let geometries = match self.record_uploads(cx, snapshot, &mut list, &mut uploads) {
            Ok(geometries) => geometries,
            Err(e) => {
                cx.scheduler.discard(list);
                discard_uploads(cx, uploads);
                return Err(e);
            }
        };
        let point = if list.is_empty() {
            None
        } else {
            match cx.scheduler.submit(cx.device, QueueKind::Copy, list, &[]) {
                Ok(point) => Some(point),
                Err(e) => {
                    discard_uploads(cx, uploads);
                    return Err(e.into());
                }
            }
        };

        for upload in uploads {
            let record = cx.records.resolve_mesh(upload.mesh)?;
            let stale = record.take_geometry();
            record.vertices = Some(upload.vertices);
            record.indices = Some(upload.indices);
            record.owns_buffers = upload.owns_buffers;
            record.geometry_version = upload.version;
            record_cache::retire(stale, cx.device, cx.scheduler, cx.purge);
        }
        Ok((point, geometries))
    }

    fn record_uploads(
        &mut self,
        cx: &mut FrameContext,
        snapshot: &FrameSnapshot,
        list: &mut CommandList,
        uploads: &mut Vec<MeshUpload>,
    ) -> RthsResult<HashMap<MeshHandle, MeshGeometry>> {
        self.ensure_output(cx, &snapshot.target, list)?;

        let mut geometries = HashMap::new();
        for snap in &snapshot.instances {
            if geometries.contains_key(&snap.mesh_handle) {
                continue;
            }
            let version = snap.mesh.geometry_version();
            let record = cx.records.resolve_mesh(snap.mesh_handle)?;
            let current = match (record.vertices, record.indices) {
                (Some(vertices), Some(indices)) if record.geometry_version == version => Some((vertices, indices)),
                _ => None,
            };

            let (vertices, indices) = match (current, snap.mesh.source()) {
                (Some(buffers), _) => buffers,
                (None, MeshSource::Cpu { vertices, indices }) => {
                    let vertex_buffer = create_mesh_buffer(cx.device, vertices.len() as u64, "mesh-vertices")?;
                    let index_buffer = match create_mesh_buffer(cx.device, indices.len() as u64, "mesh-indices") {
                        Ok(buffer) => buffer,
                        Err(e) => {
                            cx.device.destroy_buffer(vertex_buffer);
                            return Err(e.into());
                        }
                    };
                    uploads.push(MeshUpload {
                        mesh: snap.mesh_handle,
                        version,
                        vertices: vertex_buffer,
                        indices: index_buffer,
                        owns_buffers: true,
                    });
                    for (dst, data) in [(vertex_buffer, vertices), (index_buffer, indices)] {
                        let staging = cx.scheduler.upload_buffer(cx.device, list, dst, 0, data)?;
                        self.transients.defer(cx.scheduler, staging);
                    }
                    (vertex_buffer, index_buffer)
                }
                (None, MeshSource::Gpu { vertices, indices }) => {
                    let vertex_buffer = cx.translator.buffer(cx.device, *vertices)?;
                    let index_buffer = cx.translator.buffer(cx.device, *indices)?;
                    uploads.push(MeshUpload {
                        mesh: snap.mesh_handle,
                        version,
                        vertices: vertex_buffer,
                        indices: index_buffer,
                        owns_buffers: false,
                    });
                    (vertex_buffer, index_buffer)
                }
                (None, MeshSource::None) => continue,
            };
            geometries.insert(
                snap.mesh_handle,
                MeshGeometry {
                    vertices,
                    indices,
                    layout: *snap.mesh.layout(),
                },
            );
        }
        Ok(geometries)
    }

    /// render target 的尺寸或格式变化时重建输出纹理与回读 buffer，新的纹理清零
    fn ensure_output(&mut self, cx: &mut FrameContext, target: &RenderTargetData, list: &mut CommandList) -> RthsResult<()> {
        let (width, height, format) = (target.width(), target.height(), target.format());
        if self.output.as_ref().is_some_and(|o| (o.width, o.height, o.format) == (width, height, format)) {
            return Ok(());
        }
        self.release_output(cx.scheduler, cx.purge);

        let texture_format = format.texture_format();
        let texture = cx.device.create_texture(&TextureDesc {
            width,
            height,
            format: texture_format,
            label: "shadow-output".to_string(),
        })?;
        let row_pitch = cx.scheduler.row_pitch(width, texture_format);
        let readback = cx.device.create_buffer(&BufferDesc {
            size: row_pitch * height as u64,
            usage: BufferUsage::COPY_DST,
            location: MemoryLocation::Readback,
            label: "shadow-readback".to_string(),
        });
        let readback = match readback {
            Ok(readback) => readback,
            Err(e) => {
                cx.device.destroy_texture(texture);
                return Err(e.into());
            }
        };
        self.output = Some(OutputTarget {
            texture,
            readback,
            width,
            height,
            format,
            row_pitch,
        });
        log::info!("renderer output {}x{} {:?}, row pitch {}", width, height, format, row_pitch);

        let zeros = vec![0u8; target.byte_size()];
        let staging = cx.scheduler.upload_texture(cx.device, list, texture, width, height, texture_format, &zeros)?;
        self.transients.defer(cx.scheduler, staging);

        // 尺寸不变时（例如设备重建）保留上一帧的输出
        if self.output_bytes.len() != target.byte_size() {
            self.output_bytes.clear();
            self.has_output = false;
        }
        Ok(())
    }
}

// deformer
impl Renderer {
    /// 对需要重建 BLAS 的形变 instance 执行 deformer
    fn deform_instances(
        &mut self,
        cx: &mut FrameContext,
        snapshot: &FrameSnapshot,
        geometries: &HashMap<MeshHandle, MeshGeometry>,
    ) -> RthsResult<HashMap<InstanceHandle, Deformed>> {
        let _span = tracy_client::span!("Renderer::deform_instances");
        let clamp = self.scene.flags.contains(RenderFlags::CLAMP_BLENDSHAPE_WEIGHTS);

        let mut deformed = HashMap::new();
        for snap in &snapshot.instances {
            if deformed.contains_key(&snap.handle) || !snap.needs_deform() {
                continue;
            }
            let Some(geometry) = geometries.get(&snap.mesh_handle) else {
                continue;
            };
            let version = snap.mesh.geometry_version();
            let record = cx.records.resolve_instance(snap.handle, snap.mesh_handle)?;
            let stale = record.blas.is_none()
                || record.blas_geometry_version != version
                || snap.data.update_flags().intersects(UpdateFlags::DEFORM);
            if !stale {
                continue;
            }
            let base = self.base_positions(cx, snap, geometry)?;
            deformed.insert(snap.handle, deformer::deform(&snap.mesh, &snap.data, &base, clamp));
        }
        Ok(deformed)
    }

    /// deformer 的输入顶点，每个 geometry version 只解析或回读一次
    fn base_positions(
        &mut self,
        cx: &mut FrameContext,
        snap: &InstanceSnapshot,
        geometry: &MeshGeometry,
    ) -> RthsResult<Arc<Vec<Vec3>>> {
        let version = snap.mesh.geometry_version();
        let record = cx.records.resolve_mesh(snap.mesh_handle)?;
        if let Some(positions) = record.base_positions.as_ref().filter(|_| record.base_version == version) {
            return Ok(positions.clone());
        }

        let layout = snap.mesh.layout();
        let positions = match snap.mesh.source() {
            MeshSource::Cpu { vertices, .. } => MeshData::read_positions(layout, vertices),
            MeshSource::Gpu { vertices, .. } => self.read_back_positions(cx, geometry.vertices, layout, vertices.size)?,
            MeshSource::None => Vec::new(),
        };
        let positions = Arc::new(positions);
        let record = cx.records.resolve_mesh(snap.mesh_handle)?;
        record.base_positions = Some(positions.clone());
        record.base_version = version;
        Ok(positions)
    }

    /// 通过 copy queue 回读宿主 GPU buffer 中的顶点，阻塞直到完成
    fn read_back_positions(
        &mut self,
        cx: &mut FrameContext,
        vertices: BufferId,
        layout: &MeshLayout,
        available: u64,
    ) -> RthsResult<Vec<Vec3>> {
        let _span = tracy_client::span!("Renderer::read_back_positions");
        let size = (layout.vertex_count as u64 * layout.vertex_stride as u64).min(available);
        let readback = cx.device.create_buffer(&BufferDesc {
            size,
            usage: BufferUsage::COPY_DST,
            location: MemoryLocation::Readback,
            label: "mesh-readback".to_string(),
        })?;
        self.transients.defer(cx.scheduler, readback);

        let mut list = CommandList::new("mesh-readback");
        cx.scheduler.record_buffer_readback(&mut list, vertices, 0, readback, size);
        let point = cx.scheduler.submit(cx.device, QueueKind::Copy, list, &[])?;
        cx.scheduler.wait_for(cx.device, point)?;

        let mut bytes = vec![0u8; size as usize];
        cx.device.read_buffer(readback, 0, &mut bytes)?;
        log::debug!("read back {} vertices from a host gpu buffer", layout.vertex_count);
        Ok(MeshData::read_positions(layout, &bytes))
    }
}

// raytrace queue：构建与 dispatch
impl Renderer {
    #[allow(clippy::too_many_arguments)]
    fn record_raytrace(
        &mut self,
        cx: &mut FrameContext,
        snapshot: &FrameSnapshot,
        geometries: &HashMap<MeshHandle, MeshGeometry>,
        deformed: &HashMap<InstanceHandle, Deformed>,
        list: &mut CommandList,
        pending: &mut Vec<PendingBlas>,
        created: &mut Vec<AccelId>,
    ) -> RthsResult<AccelId> {
        let _span = tracy_client::span!("Renderer::record_raytrace");

        let mut chosen: HashMap<InstanceHandle, (AccelId, bool)> = HashMap::new();
        let mut mesh_blases: HashMap<MeshHandle, AccelId> = HashMap::new();
        let mut tlas_instances = Vec::with_capacity(snapshot.instances.len());
        let mut hit_args = Vec::with_capacity(snapshot.instances.len());
        let mut blases = Vec::with_capacity(snapshot.instances.len());

        for snap in &snapshot.instances {
            let Some(geometry) = geometries.get(&snap.mesh_handle) else {
                continue;
            };
            let (blas, world_space) = match chosen.get(&snap.handle) {
                Some(choice) => *choice,
                None => {
                    let choice = if snap.needs_deform() {
                        self.instance_blas(cx, list, snap, geometry, deformed.get(&snap.handle), pending, created)?
                    } else {
                        self.retire_instance_blas(cx, snap)?;
                        (self.mesh_blas(cx, list, snap, geometry, &mut mesh_blases, pending, created)?, false)
                    };
                    chosen.insert(snap.handle, choice);
                    choice
                }
            };

            // 蒙皮之后的顶点已经在世界空间
            let transform = if world_space { Mat4::IDENTITY } else { snap.data.transform() };
            let index = tlas_instances.len() as u32;
            tlas_instances.push(TlasInstance::new(
                &transform,
                snap.instance_id,
                snap.mask,
                index * RAY_TYPE_COUNT,
                INSTANCE_FLAG_FRONT_COUNTERCLOCKWISE,
                cx.device.acceleration_address(blas)?,
            ));
            hit_args.push(HitRecordArgs {
                instance_id: snap.instance_id,
                mask: snap.mask as u32,
                flags: world_space as u32,
                material: 0,
            });
            blases.push(blas);
        }

        let tlas = self.top_level.build_top_level(
            cx.device,
            cx.scheduler,
            list,
            &mut self.transients,
            cx.purge,
            &tlas_instances,
            &blases,
        )?;
        created.push(tlas);

        self.phase = FramePhase::Dispatching;
        let constants = self.write_constants(cx, &snapshot.target)?;
        let (shader_table, layout) = self.shader_table.update(cx.device, cx.scheduler, cx.purge, &hit_args)?;
        let Some(output) = self.output.as_ref() else {
            return Err(RthsError::contract("renderer output is missing"));
        };
        cx.scheduler.require(
            list,
            &[
                (constants.into(), ResourceState::Constant),
                (shader_table.into(), ResourceState::ShaderTable),
                (output.texture.into(), ResourceState::UnorderedAccess),
            ],
        );
        list.push(GpuCommand::TraceRays(TraceRaysDesc {
            tlas,
            output: output.texture,
            constants,
            shader_table,
            raygen: layout.raygen,
            miss: layout.miss,
            hit: layout.hit,
            width: output.width,
            height: output.height,
        }));

        if let Some(native) = snapshot.target.gpu_texture() {
            copy_to_host_texture(cx, list, output, native)?;
        }
        Ok(tlas)
    }

    /// 形变 instance 独占的 BLAS，没有新的形变结果时复用上一次的 BLAS
    #[allow(clippy::too_many_arguments)]
    fn instance_blas(
        &mut self,
        cx: &mut FrameContext,
        list: &mut CommandList,
        snap: &InstanceSnapshot,
        geometry: &MeshGeometry,
        deformed: Option<&Deformed>,
        pending: &mut Vec<PendingBlas>,
        created: &mut Vec<AccelId>,
    ) -> RthsResult<(AccelId, bool)> {
        let Some(deformed) = deformed else {
            let record = cx.records.resolve_instance(snap.handle, snap.mesh_handle)?;
            return record
                .blas
                .map(|blas| (blas, record.world_space))
                .ok_or_else(|| RthsError::contract(format!("instance {:?} has no deformed blas", snap.handle)));
        };

        let layout = &geometry.layout;
        let vertices = cx.device.create_buffer(&BufferDesc {
            size: (deformed.positions.len() * std::mem::size_of::<Vec3>()) as u64,
            usage: BufferUsage::BUILD_INPUT,
            location: MemoryLocation::Upload,
            label: "deformed-vertices".to_string(),
        })?;
        self.transients.defer(cx.scheduler, vertices);
        cx.device.write_buffer(vertices, 0, bytemuck::cast_slice(&deformed.positions))?;

        let input = AccelGeometry::Triangles {
            vertices,
            vertex_offset: 0,
            vertex_stride: std::mem::size_of::<Vec3>() as u64,
            vertex_count: layout.vertex_count,
            indices: geometry.indices,
            index_offset: layout.index_offset as u64,
            index_format: layout.index_format,
            index_count: layout.index_count,
        };
        let blas = accel_builder::build_bottom_level(cx.device, cx.scheduler, list, &mut self.transients, &input)?;
        created.push(blas);
        pending.push(PendingBlas::Instance {
            instance: snap.handle,
            mesh: snap.mesh_handle,
            version: snap.mesh.geometry_version(),
            world_space: deformed.world_space,
            blas,
        });
        Ok((blas, deformed.world_space))
    }

    /// 静态 instance 共享 mesh 的 BLAS，每个 geometry version 只构建一次
    #[allow(clippy::too_many_arguments)]
    fn mesh_blas(
        &mut self,
        cx: &mut FrameContext,
        list: &mut CommandList,
        snap: &InstanceSnapshot,
        geometry: &MeshGeometry,
        built: &mut HashMap<MeshHandle, AccelId>,
        pending: &mut Vec<PendingBlas>,
        created: &mut Vec<AccelId>,
    ) -> RthsResult<AccelId> {
        if let Some(blas) = built.get(&snap.mesh_handle) {
            return Ok(*blas);
        }
        let version = snap.mesh.geometry_version();
        let record = cx.records.resolve_mesh(snap.mesh_handle)?;
        let blas = match record.blas.filter(|_| record.blas_version == version) {
            Some(blas) => blas,
            None => {
                let blas = accel_builder::build_bottom_level(
                    cx.device,
                    cx.scheduler,
                    list,
                    &mut self.transients,
                    &geometry.accel_geometry(),
                )?;
                created.push(blas);
                pending.push(PendingBlas::Mesh {
                    mesh: snap.mesh_handle,
                    version,
                    blas,
                });
                blas
            }
        };
        built.insert(snap.mesh_handle, blas);
        Ok(blas)
    }

    /// instance 不再形变时，它独占的 BLAS 不再需要
    fn retire_instance_blas(&mut self, cx: &mut FrameContext, snap: &InstanceSnapshot) -> RthsResult<()> {
        let record = cx.records.resolve_instance(snap.handle, snap.mesh_handle)?;
        if let Some(blas) = record.blas.take() {
            log::debug!("instance {:?} is no longer deformed", snap.handle);
            cx.purge.defer(cx.scheduler, blas);
        }
        Ok(())
    }

    fn write_constants(&mut self, cx: &mut FrameContext, target: &RenderTargetData) -> RthsResult<BufferId> {
        let buffer = match self.constants {
            Some(buffer) => buffer,
            None => {
                let buffer = cx.device.create_buffer(&BufferDesc {
                    size: std::mem::size_of::<GpuSceneConstants>() as u64,
                    usage: BufferUsage::CONSTANT,
                    location: MemoryLocation::Upload,
                    label: "scene-constants".to_string(),
                })?;
                self.constants = Some(buffer);
                buffer
            }
        };
        cx.scheduler.wait_retired(cx.device, buffer)?;
        let constants = GpuSceneConstants::new(&self.scene, target.width(), target.height());
        cx.device.write_buffer(buffer, 0, bytemuck::bytes_of(&constants))?;
        Ok(buffer)
    }

    /// raytrace 提交成功之后，把新的 BLAS 与 TLAS 写入 record，清除已消费的变更标记
    fn commit(
        &mut self,
        cx: &mut FrameContext,
        snapshot: &FrameSnapshot,
        pending: Vec<PendingBlas>,
        tlas: AccelId,
    ) -> RthsResult<()> {
        for blas in pending {
            let stale = match blas {
                PendingBlas::Mesh { mesh, version, blas } => {
                    let record = cx.records.resolve_mesh(mesh)?;
                    record.blas_version = version;
                    record.blas.replace(blas)
                }
                PendingBlas::Instance {
                    instance,
                    mesh,
                    version,
                    world_space,
                    blas,
                } => {
                    let record = cx.records.resolve_instance(instance, mesh)?;
                    record.blas_geometry_version = version;
                    record.world_space = world_space;
                    record.blas.replace(blas)
                }
            };
            let stale = stale.into_iter().map(Into::into).collect_vec();
            record_cache::retire(stale, cx.device, cx.scheduler, cx.purge);
        }
        self.top_level.commit(tlas, cx.scheduler, cx.purge);

        let mut world = cx.world.lock();
        for snap in &snapshot.instances {
            if let Some(instance) = world.instance_mut(snap.handle) {
                instance.consume_flags(snap.data.change_serial(), UpdateFlags::all());
            }
        }
        Ok(())
    }
}

// destroy
impl Renderer {
    fn release_output(&mut self, scheduler: &Scheduler, purge: &mut PurgeList) {
        if let Some(output) = self.output.take() {
            purge.defer(scheduler, output.texture);
            purge.defer(scheduler, output.readback);
        }
    }

    /// renderer 拥有的所有资源交给 purge list
    pub fn release(mut self, scheduler: &Scheduler, purge: &mut PurgeList) {
        self.release_output(scheduler, purge);
        if let Some(constants) = self.constants.take() {
            purge.defer(scheduler, constants);
        }
        self.top_level.release(scheduler, purge);
        self.shader_table.release(scheduler, purge);
        purge.append(&mut self.transients);
    }

    /// 设备重建之后所有的 GPU 资源都已经不存在，保留场景与上一帧的输出
    pub fn forget_device(&mut self) {
        self.output = None;
        self.constants = None;
        self.top_level.forget();
        self.shader_table.forget();
        self.transients.forget_all();
        self.in_flight = None;
        if self.phase.in_flight() {
            self.phase = FramePhase::Idle;
        }
    }
}

fn create_mesh_buffer(device: &mut dyn RtDevice, size: u64, label: &str) -> crate::backend::DeviceResult<BufferId> {
    device.create_buffer(&BufferDesc {
        size,
        usage: BufferUsage::COPY_DST | BufferUsage::BUILD_INPUT,
        location: MemoryLocation::GpuOnly,
        label: label.to_string(),
    })
}

/// 上传失败时，销毁这次新建的 mesh buffer
fn discard_uploads(cx: &mut FrameContext, uploads: Vec<MeshUpload>) {
    for upload in uploads.into_iter().filter(|u| u.owns_buffers) {
        cx.scheduler.destroy(cx.device, upload.vertices.into());
        cx.scheduler.destroy(cx.device, upload.indices.into());
    }
}

fn copy_to_host_texture(
    cx: &mut FrameContext,
    list: &mut CommandList,
    output: &OutputTarget,
    native: NativeTexture,
) -> RthsResult<()> {
    if (native.width, native.height) != (output.width, output.height) {
        log::warn!(
            "host texture is {}x{}, render target is {}x{}, skip the copy",
            native.width,
            native.height,
            output.width,
            output.height
        );
        return Ok(());
    }
    let host = cx.translator.texture(cx.device, native, output.format.texture_format())?;
    cx.scheduler.require(
        list,
        &[
            (output.texture.into(), ResourceState::CopySrc),
            (host.into(), ResourceState::CopyDst),
        ],
    );
    list.push(GpuCommand::CopyTexture {
        src: output.texture,
        dst: host,
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::soft::SoftDevice;
    use crate::host::{BoneWeight, GeometryEntry, IndexFormat, Light};

    struct Harness {
        soft: SoftDevice,
        device: Box<dyn RtDevice>,
        scheduler: Scheduler,
        translator: ResourceTranslator,
        records: RecordCache,
        purge: PurgeList,
        world: World,
    }

    impl Harness {
        fn new() -> Self {
            let soft = SoftDevice::new(256);
            let device: Box<dyn RtDevice> = Box::new(soft.clone());
            let translator = ResourceTranslator::new(device.as_ref());
            let (world, _events) = World::new();
            Self {
                soft,
                device,
                scheduler: Scheduler::new(256),
                translator,
                records: RecordCache::new(),
                purge: PurgeList::new(),
                world,
            }
        }

        fn cx(&mut self) -> FrameContext<'_> {
            FrameContext {
                device: self.device.as_mut(),
                scheduler: &mut self.scheduler,
                translator: &mut self.translator,
                records: &mut self.records,
                purge: &mut self.purge,
                world: &self.world,
            }
        }
    }

    fn triangle_mesh(world: &World) -> MeshHandle {
        let mesh = world.create_mesh();
        let positions = [Vec3::new(-1.0, -1.0, 0.0), Vec3::new(1.0, -1.0, 0.0), Vec3::new(0.0, 1.0, 0.0)];
        let layout = MeshLayout {
            vertex_count: 3,
            index_format: IndexFormat::U16,
            index_count: 3,
            ..Default::default()
        };
        world
            .set_cpu_buffers(mesh, bytemuck::cast_slice(&positions), bytemuck::cast_slice(&[0u16, 1, 2]), layout)
            .unwrap();
        mesh
    }

    fn renderer_for(world: &World, geometries: &[InstanceHandle]) -> Renderer {
        let rt = world.create_render_target();
        world.setup_render_target(rt, 8, 8, RenderTargetFormat::Ru8);
        let mut renderer = Renderer::new(4);
        renderer.render_target = Some(rt);
        renderer.begin_scene();
        let scene = renderer.scene_mut();
        scene.camera.position = Vec3::new(0.0, 0.0, 3.0);
        scene.camera.view = Mat4::look_at_rh(scene.camera.position, Vec3::ZERO, Vec3::Y);
        scene.camera.proj = Mat4::perspective_rh(60f32.to_radians(), 1.0, 0.1, 100.0);
        scene.lights.push(Light::Directional { direction: -Vec3::Z });
        scene.geometries.extend(geometries.iter().map(|i| GeometryEntry { instance: *i, mask: 0xff }));
        renderer.end_scene();
        renderer
    }

    #[test]
    fn test_static_instances_share_mesh_blas() {
        let mut h = Harness::new();
        let mesh = triangle_mesh(&h.world);
        let a = h.world.create_instance(mesh).unwrap();
        let b = h.world.create_instance(mesh).unwrap();
        h.world.set_transform(b, Mat4::from_translation(Vec3::X * 4.0));
        let mut renderer = renderer_for(&h.world, &[a, b]);

        renderer.render(&mut h.cx()).unwrap();
        assert_eq!(renderer.phase(), FramePhase::AwaitingFence);
        renderer.finish(&mut h.cx()).unwrap();

        // 一个 BLAS 与一个 TLAS
        assert_eq!(h.soft.stats().builds, 2);
        assert!(h.records.mesh(mesh).unwrap().blas.is_some());
        assert!(h.records.instance(a).is_some_and(|r| r.blas.is_none()));
        assert!(h.world.lock().instance(b).unwrap().update_flags().is_empty());

        renderer.render(&mut h.cx()).unwrap();
        renderer.finish(&mut h.cx()).unwrap();
        // 第二帧只重建 TLAS
        assert_eq!(h.soft.stats().builds, 3);
        assert!(h.soft.violations().is_empty());
    }

    #[test]
    fn test_skinned_instance_rebuilds_only_on_bone_change() {
        let mut h = Harness::new();
        let mesh = triangle_mesh(&h.world);
        h.world.set_skin_bindposes(mesh, &[Mat4::IDENTITY]);
        h.world.set_skin_weights(mesh, &[1, 1, 1], &[BoneWeight { weight: 1.0, index: 0 }; 3]).unwrap();
        let inst = h.world.create_instance(mesh).unwrap();
        h.world.set_bones(inst, &[Mat4::from_translation(Vec3::Y * 0.1)]);
        let mut renderer = renderer_for(&h.world, &[inst]);

        renderer.render(&mut h.cx()).unwrap();
        renderer.finish(&mut h.cx()).unwrap();
        let first = h.records.instance(inst).unwrap().blas.unwrap();
        assert!(h.records.instance(inst).unwrap().world_space);
        assert_eq!(renderer.outcome(), Some(FrameOutcome::Rendered));

        renderer.render(&mut h.cx()).unwrap();
        renderer.finish(&mut h.cx()).unwrap();
        assert_eq!(h.records.instance(inst).unwrap().blas, Some(first));

        h.world.set_bones(inst, &[Mat4::from_translation(Vec3::Y * 0.2)]);
        renderer.render(&mut h.cx()).unwrap();
        renderer.finish(&mut h.cx()).unwrap();
        assert_ne!(h.records.instance(inst).unwrap().blas, Some(first));
        assert!(h.soft.violations().is_empty());
    }

    #[test]
    fn test_render_gate_and_idle_finish() {
        let mut h = Harness::new();
        let mesh = triangle_mesh(&h.world);
        let inst = h.world.create_instance(mesh).unwrap();
        let mut renderer = renderer_for(&h.world, &[inst]);

        assert!(renderer.finish(&mut h.cx()).is_ok());
        renderer.render(&mut h.cx()).unwrap();
        assert!(matches!(renderer.render(&mut h.cx()), Err(RthsError::ContractViolation(_))));
        renderer.finish(&mut h.cx()).unwrap();

        let mut bytes = Vec::new();
        assert!(renderer.readback(&mut bytes));
        assert_eq!(bytes.len(), 64);
        assert!(bytes.iter().any(|b| *b == 255));
    }
}

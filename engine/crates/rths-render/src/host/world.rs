use std::collections::HashSet;
use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender};
use glam::{Mat4, Vec3};
use parking_lot::{Mutex, MutexGuard};
use slotmap::SlotMap;

use crate::error::RthsResult;
use crate::handles::{InstanceHandle, MeshHandle, RenderTargetHandle};
use crate::host::{
    instance::MeshInstanceData,
    mesh::{BoneWeight, BoneWeight4, MeshData, MeshLayout, MeshSource},
    render_target::{RenderTargetData, RenderTargetFormat},
};
use crate::translator::{NativeBuffer, NativeTexture};

/// 宿主对象被真正移除时发出的通知
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ReleaseEvent {
    Mesh(MeshHandle),
    Instance(InstanceHandle),
    RenderTarget(RenderTargetHandle),
}

pub(crate) struct MeshEntry {
    pub(crate) data: MeshData,
    /// 引用该 mesh 的 instance 数量
    instance_refs: u32,
    /// 宿主已经 release，但还有 instance 引用
    released: bool,
}

/// 所有宿主对象的注册表
pub struct HostWorld {
    meshes: SlotMap<MeshHandle, MeshEntry>,
    instances: SlotMap<InstanceHandle, MeshInstanceData>,
    render_targets: SlotMap<RenderTargetHandle, RenderTargetData>,

    /// 每次 instance 变化都会递增
    change_serial: u64,
    events: Sender<ReleaseEvent>,
}

// 只读访问，供渲染管线拍快照
impl HostWorld {
    /// 已 release 但仍被 instance 引用的 mesh 依然可以解析
    #[inline]
    pub fn mesh(&self, handle: MeshHandle) -> Option<&MeshData> {
        self.meshes.get(handle).map(|e| &e.data)
    }

    #[inline]
    pub fn instance(&self, handle: InstanceHandle) -> Option<&MeshInstanceData> {
        self.instances.get(handle)
    }

    #[inline]
    pub fn render_target(&self, handle: RenderTargetHandle) -> Option<&RenderTargetData> {
        self.render_targets.get(handle)
    }

    #[inline]
    pub fn mesh_count(&self) -> usize {
        self.meshes.len()
    }

    #[inline]
    pub fn instance_count(&self) -> usize {
        self.instances.len()
    }

    /// 宿主对象当前引用的所有原生资源
    pub fn native_resources(&self) -> (HashSet<NativeBuffer>, HashSet<NativeTexture>) {
        let buffers = self
            .meshes
            .values()
            .filter_map(|e| match e.data.source() {
                MeshSource::Gpu { vertices, indices } => Some([*vertices, *indices]),
                _ => None,
            })
            .flatten()
            .collect();
        let textures = self.render_targets.values().filter_map(|rt| rt.gpu_texture).collect();
        (buffers, textures)
    }

    pub(crate) fn instance_mut(&mut self, handle: InstanceHandle) -> Option<&mut MeshInstanceData> {
        self.instances.get_mut(handle)
    }

    /// 宿主可以继续修改的 mesh，已 release 的 mesh 返回 None
    fn live_mesh_mut(&mut self, handle: MeshHandle) -> Option<&mut MeshData> {
        self.meshes.get_mut(handle).filter(|e| !e.released).map(|e| &mut e.data)
    }

    fn mark_changed(&mut self, handle: InstanceHandle) {
        self.change_serial += 1;
        let serial = self.change_serial;
        if let Some(instance) = self.instances.get_mut(handle) {
            instance.change_serial = serial;
        }
    }

    fn send(&self, event: ReleaseEvent) {
        // 接收端随 context 一起销毁，之后的通知没有意义
        let _ = self.events.send(event);
    }
}

/// 宿主数据的共享句柄
///
/// 内部是 `Arc<Mutex<HostWorld>>`，可以在多个线程中设置数据。
/// 所有 setter 对无效句柄都是 no-op。
#[derive(Clone)]
pub struct World {
    inner: Arc<Mutex<HostWorld>>,
}

impl World {
    pub(crate) fn new() -> (Self, Receiver<ReleaseEvent>) {
        let (sender, receiver) = crossbeam_channel::unbounded();
        let world = HostWorld {
            meshes: SlotMap::with_key(),
            instances: SlotMap::with_key(),
            render_targets: SlotMap::with_key(),
            change_serial: 0,
            events: sender,
        };
        (
            Self {
                inner: Arc::new(Mutex::new(world)),
            },
            receiver,
        )
    }

    #[inline]
    pub fn lock(&self) -> MutexGuard<'_, HostWorld> {
        self.inner.lock()
    }
}

// mesh
impl World {
    pub fn create_mesh(&self) -> MeshHandle {
        self.lock().meshes.insert(MeshEntry {
            data: MeshData::default(),
            instance_refs: 0,
            released: false,
        })
    }

    /// 如果还有 instance 引用该 mesh，则延迟到最后一个 instance release 时移除
    pub fn release_mesh(&self, handle: MeshHandle) {
        let mut world = self.lock();
        let Some(entry) = world.meshes.get_mut(handle) else {
            return;
        };
        if entry.released {
            return;
        }
        if entry.instance_refs > 0 {
            log::debug!("mesh {:?} released with {} live instances", handle, entry.instance_refs);
            entry.released = true;
            return;
        }
        world.meshes.remove(handle);
        world.send(ReleaseEvent::Mesh(handle));
    }

    pub fn set_cpu_buffers(&self, handle: MeshHandle, vertices: &[u8], indices: &[u8], layout: MeshLayout) -> RthsResult<()> {
        match self.lock().live_mesh_mut(handle) {
            Some(mesh) => mesh.set_cpu_buffers(vertices, indices, layout),
            None => Ok(()),
        }
    }

    pub fn set_gpu_buffers(
        &self,
        handle: MeshHandle,
        vertices: NativeBuffer,
        indices: NativeBuffer,
        layout: MeshLayout,
    ) -> RthsResult<()> {
        match self.lock().live_mesh_mut(handle) {
            Some(mesh) => mesh.set_gpu_buffers(vertices, indices, layout),
            None => Ok(()),
        }
    }

    pub fn set_skin_bindposes(&self, handle: MeshHandle, bindposes: &[Mat4]) {
        if let Some(mesh) = self.lock().live_mesh_mut(handle) {
            mesh.set_skin_bindposes(bindposes);
        }
    }

    pub fn set_skin_weights(&self, handle: MeshHandle, bone_counts: &[u8], weights: &[BoneWeight]) -> RthsResult<()> {
        match self.lock().live_mesh_mut(handle) {
            Some(mesh) => mesh.set_skin_weights(bone_counts, weights),
            None => Ok(()),
        }
    }

    pub fn set_skin_weights4(&self, handle: MeshHandle, weights: &[BoneWeight4]) {
        if let Some(mesh) = self.lock().live_mesh_mut(handle) {
            mesh.set_skin_weights4(weights);
        }
    }

    pub fn set_blendshape_count(&self, handle: MeshHandle, count: usize) {
        if let Some(mesh) = self.lock().live_mesh_mut(handle) {
            mesh.set_blendshape_count(count);
        }
    }

    pub fn add_blendshape_frame(&self, handle: MeshHandle, index: usize, delta: &[Vec3], weight: f32) -> RthsResult<()> {
        match self.lock().live_mesh_mut(handle) {
            Some(mesh) => mesh.add_blendshape_frame(index, delta, weight),
            None => Ok(()),
        }
    }
}

// instance
impl World {
    /// mesh 无效或已 release 时返回 None
    pub fn create_instance(&self, mesh: MeshHandle) -> Option<InstanceHandle> {
        let mut world = self.lock();
        let entry = world.meshes.get_mut(mesh).filter(|e| !e.released)?;
        entry.instance_refs += 1;
        Some(world.instances.insert(MeshInstanceData::new(mesh)))
    }

    pub fn release_instance(&self, handle: InstanceHandle) {
        let mut world = self.lock();
        let Some(instance) = world.instances.remove(handle) else {
            return;
        };
        world.send(ReleaseEvent::Instance(handle));

        let mesh = instance.mesh;
        let remove_mesh = match world.meshes.get_mut(mesh) {
            Some(entry) => {
                entry.instance_refs = entry.instance_refs.saturating_sub(1);
                entry.released && entry.instance_refs == 0
            }
            None => false,
        };
        if remove_mesh {
            world.meshes.remove(mesh);
            world.send(ReleaseEvent::Mesh(mesh));
        }
    }

    pub fn set_transform(&self, handle: InstanceHandle, transform: Mat4) {
        let mut world = self.lock();
        if world.instances.get_mut(handle).is_some_and(|i| i.set_transform(transform)) {
            world.mark_changed(handle);
        }
    }

    /// mesh 没有蒙皮数据时忽略
    pub fn set_bones(&self, handle: InstanceHandle, bones: &[Mat4]) {
        let mut world = self.lock();
        let Some(mesh) = world.instances.get(handle).map(|i| i.mesh) else {
            return;
        };
        if !world.mesh(mesh).is_some_and(|m| m.skin().valid()) {
            return;
        }
        if world.instances.get_mut(handle).is_some_and(|i| i.set_bones(bones)) {
            world.mark_changed(handle);
        }
    }

    /// mesh 没有 blendshape 时忽略
    pub fn set_blendshape_weights(&self, handle: InstanceHandle, weights: &[f32]) {
        let mut world = self.lock();
        let Some(mesh) = world.instances.get(handle).map(|i| i.mesh) else {
            return;
        };
        if !world.mesh(mesh).is_some_and(|m| !m.blendshapes().is_empty()) {
            return;
        }
        if world.instances.get_mut(handle).is_some_and(|i| i.set_blendshape_weights(weights)) {
            world.mark_changed(handle);
        }
    }
}

// render target
impl World {
    pub fn create_render_target(&self) -> RenderTargetHandle {
        self.lock().render_targets.insert(RenderTargetData::default())
    }

    pub fn release_render_target(&self, handle: RenderTargetHandle) {
        let mut world = self.lock();
        if world.render_targets.remove(handle).is_some() {
            world.send(ReleaseEvent::RenderTarget(handle));
        }
    }

    pub fn set_gpu_texture(&self, handle: RenderTargetHandle, texture: Option<NativeTexture>) {
        if let Some(rt) = self.lock().render_targets.get_mut(handle) {
            rt.gpu_texture = texture;
        }
    }

    pub fn setup_render_target(&self, handle: RenderTargetHandle, width: u32, height: u32, format: RenderTargetFormat) {
        if let Some(rt) = self.lock().render_targets.get_mut(handle) {
            rt.width = width;
            rt.height = height;
            rt.format = format;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mesh_outlives_instances() {
        let (world, events) = World::new();
        let mesh = world.create_mesh();
        let inst = world.create_instance(mesh).unwrap();

        world.release_mesh(mesh);
        assert!(world.lock().mesh(mesh).is_some());
        assert!(world.create_instance(mesh).is_none());
        assert!(events.try_recv().is_err());

        world.release_instance(inst);
        assert!(world.lock().mesh(mesh).is_none());
        assert_eq!(events.try_iter().collect::<Vec<_>>(), vec![ReleaseEvent::Instance(inst), ReleaseEvent::Mesh(mesh)]);
    }

    #[test]
    fn test_setters_on_stale_handles_are_noop() {
        let (world, _events) = World::new();
        let mesh = world.create_mesh();
        let inst = world.create_instance(mesh).unwrap();
        world.release_instance(inst);

        world.set_transform(inst, Mat4::from_translation(Vec3::ONE));
        world.set_bones(inst, &[Mat4::IDENTITY]);
        assert!(world.lock().instance(inst).is_none());

        world.release_mesh(mesh);
        world.set_skin_bindposes(mesh, &[Mat4::IDENTITY]);
        assert!(world.add_blendshape_frame(mesh, 5, &[], 1.0).is_ok());
    }

    #[test]
    fn test_change_serial_tracks_latest_change() {
        let (world, _events) = World::new();
        let mesh = world.create_mesh();
        let a = world.create_instance(mesh).unwrap();
        let b = world.create_instance(mesh).unwrap();

        world.set_transform(a, Mat4::from_translation(Vec3::X));
        world.set_transform(b, Mat4::from_translation(Vec3::Y));
        world.set_transform(a, Mat4::from_translation(Vec3::X));

        let w = world.lock();
        assert_eq!(w.instance(a).unwrap().change_serial(), 1);
        assert_eq!(w.instance(b).unwrap().change_serial(), 2);
    }

    #[test]
    fn test_bones_ignored_without_skin() {
        let (world, _events) = World::new();
        let mesh = world.create_mesh();
        let inst = world.create_instance(mesh).unwrap();
        world.set_bones(inst, &[Mat4::IDENTITY]);
        assert!(world.lock().instance(inst).unwrap().update_flags().is_empty());
    }
}

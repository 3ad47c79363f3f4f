//! mesh 与 instance 的 GPU 侧状态
//!
//! record 在第一次被解析时创建，宿主 release 之后被 invalidate：
//! 已经 retired 的资源立即销毁，其余的交给 purge list。
//! 被 invalidate 的句柄再次解析属于使用错误。句柄的 slot 中留下一个 released 标记，
//! 宿主的 slotmap 复用这个 slot 时，更新 generation 的句柄会覆盖它。

use std::sync::Arc;

use glam::Vec3;
use slotmap::SecondaryMap;

use crate::backend::{AccelId, BufferId, ResourceRef, RtDevice};
use crate::error::{RthsError, RthsResult};
use crate::frame::PurgeList;
use crate::handles::{InstanceHandle, MeshHandle};
use crate::scheduler::Scheduler;

/// mesh 级别的 GPU 状态，被所有引用该 mesh 的 instance 共享
#[derive(Debug, Default)]
pub struct MeshRecord {
    /// GPU 上的顶点与索引对应的 geometry version，0 表示还没有上传
    pub geometry_version: u64,
    pub vertices: Option<BufferId>,
    pub indices: Option<BufferId>,
    /// 顶点与索引 buffer 是否由引擎创建，宿主导入的 buffer 不由 record 销毁
    pub owns_buffers: bool,

    /// 静态 instance 共享的 BLAS
    pub blas: Option<AccelId>,
    pub blas_version: u64,

    /// deformer 的输入，GPU mesh 的顶点只回读一次
    pub base_positions: Option<Arc<Vec<Vec3>>>,
    pub base_version: u64,
}

impl MeshRecord {
    /// geometry 变化之后需要丢弃的资源
    pub fn take_geometry(&mut self) -> Vec<ResourceRef> {
        let mut resources = Vec::new();
        if self.owns_buffers {
            resources.extend(self.vertices.take().map(ResourceRef::Buffer));
            resources.extend(self.indices.take().map(ResourceRef::Buffer));
        } else {
            self.vertices = None;
            self.indices = None;
        }
        resources.extend(self.blas.take().map(ResourceRef::Accel));
        self.geometry_version = 0;
        self.blas_version = 0;
        resources
    }
}

/// instance 级别的 GPU 状态
#[derive(Debug)]
pub struct InstanceRecord {
    pub mesh: MeshHandle,
    /// 形变之后的 BLAS，静态 instance 为 None
    pub blas: Option<AccelId>,
    /// 构建 `blas` 时 mesh 的 geometry version
    pub blas_geometry_version: u64,
    /// `blas` 中的顶点是否已经位于世界空间
    pub world_space: bool,
}

impl InstanceRecord {
    fn new(mesh: MeshHandle) -> Self {
        Self {
            mesh,
            blas: None,
            blas_geometry_version: 0,
            world_space: false,
        }
    }
}

/// record 或者 released 标记
#[derive(Debug)]
enum Slot<R> {
    Live(R),
    Released,
}

impl<R> Slot<R> {
    fn live(&self) -> Option<&R> {
        match self {
            Slot::Live(record) => Some(record),
            Slot::Released => None,
        }
    }
}

/// 从 `map` 中解析 `handle`，没有 record 时用 `init` 创建
fn resolve_slot<'a, K: slotmap::Key, R>(
    map: &'a mut SecondaryMap<K, Slot<R>>,
    handle: K,
    what: &str,
    init: impl FnOnce() -> R,
) -> RthsResult<&'a mut R> {
    let slot = map
        .entry(handle)
        .map(|e| e.or_insert_with(|| Slot::Live(init())))
        .ok_or_else(|| RthsError::contract(format!("{} {:?} was superseded", what, handle)))?;
    match slot {
        Slot::Live(record) => Ok(record),
        Slot::Released => Err(RthsError::contract(format!("{} {:?} was released", what, handle))),
    }
}

/// 把 `handle` 的 slot 标记为 released，返回原来的 record
fn release_slot<K: slotmap::Key, R>(map: &mut SecondaryMap<K, Slot<R>>, handle: K) -> Option<R> {
    match map.insert(handle, Slot::Released) {
        Some(Slot::Live(record)) => Some(record),
        _ => None,
    }
}

#[derive(Default)]
pub struct RecordCache {
    meshes: SecondaryMap<MeshHandle, Slot<MeshRecord>>,
    instances: SecondaryMap<InstanceHandle, Slot<InstanceRecord>>,
}

// 解析
impl RecordCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// 第一次解析时创建 record
    pub fn resolve_mesh(&mut self, handle: MeshHandle) -> RthsResult<&mut MeshRecord> {
        resolve_slot(&mut self.meshes, handle, "mesh", MeshRecord::default)
    }

    pub fn resolve_instance(&mut self, handle: InstanceHandle, mesh: MeshHandle) -> RthsResult<&mut InstanceRecord> {
        resolve_slot(&mut self.instances, handle, "instance", || InstanceRecord::new(mesh))
    }

    #[inline]
    pub fn mesh(&self, handle: MeshHandle) -> Option<&MeshRecord> {
        self.meshes.get(handle).and_then(Slot::live)
    }

    #[inline]
    pub fn instance(&self, handle: InstanceHandle) -> Option<&InstanceRecord> {
        self.instances.get(handle).and_then(Slot::live)
    }

    pub fn mesh_count(&self) -> usize {
        self.meshes.values().filter(|s| s.live().is_some()).count()
    }

    pub fn instance_count(&self) -> usize {
        self.instances.values().filter(|s| s.live().is_some()).count()
    }

    /// record 与 released 标记占用的 slot 数量
    #[inline]
    pub fn slot_count(&self) -> usize {
        self.meshes.len() + self.instances.len()
    }
}

// invalidate
impl RecordCache {
    pub fn invalidate_mesh(
        &mut self,
        handle: MeshHandle,
        device: &mut dyn RtDevice,
        scheduler: &mut Scheduler,
        purge: &mut PurgeList,
    ) {
        if let Some(mut record) = release_slot(&mut self.meshes, handle) {
            log::debug!("invalidate mesh record {:?}", handle);
            retire(record.take_geometry(), device, scheduler, purge);
        }
    }

    pub fn invalidate_instance(
        &mut self,
        handle: InstanceHandle,
        device: &mut dyn RtDevice,
        scheduler: &mut Scheduler,
        purge: &mut PurgeList,
    ) {
        if let Some(record) = release_slot(&mut self.instances, handle) {
            log::debug!("invalidate instance record {:?}", handle);
            retire(record.blas.map(ResourceRef::Accel).into_iter().collect(), device, scheduler, purge);
        }
    }

    /// 所有 record 的资源交给 purge list，context 销毁时使用
    pub fn release_all(&mut self, scheduler: &Scheduler, purge: &mut PurgeList) {
        for (_, slot) in self.meshes.drain() {
            if let Slot::Live(mut record) = slot {
                for resource in record.take_geometry() {
                    purge.defer(scheduler, resource);
                }
            }
        }
        for (_, slot) in self.instances.drain() {
            if let Slot::Live(InstanceRecord { blas: Some(blas), .. }) = slot {
                purge.defer(scheduler, blas);
            }
        }
    }

    /// 设备重建之后资源已经不存在，直接丢弃所有 record
    pub fn forget_all(&mut self) {
        self.meshes.clear();
        self.instances.clear();
    }
}

/// 已经 retired 的资源立即销毁，其余的延迟到 purge
pub fn retire(resources: Vec<ResourceRef>, device: &mut dyn RtDevice, scheduler: &mut Scheduler, purge: &mut PurgeList) {
    for resource in resources {
        if scheduler.is_retired(scheduler.mark(resource)) {
            scheduler.destroy(device, resource);
        } else {
            purge.defer(scheduler, resource);
        }
    }
}

#[cfg(test)]
mod tests {
    use slotmap::SlotMap;

    use super::*;
    use crate::backend::soft::SoftDevice;
    use crate::backend::{AccelKind, CommandList, QueueKind};
    use crate::resource_state::ResourceState;

    #[test]
    fn test_resolving_released_handle_is_contract_violation() {
        let soft = SoftDevice::new(256);
        let mut device: Box<dyn RtDevice> = Box::new(soft.clone());
        let mut scheduler = Scheduler::new(256);
        let mut purge = PurgeList::new();
        let mut cache = RecordCache::new();

        let mut meshes: SlotMap<MeshHandle, ()> = SlotMap::with_key();
        let mesh = meshes.insert(());
        cache.resolve_mesh(mesh).unwrap().geometry_version = 3;
        assert_eq!(cache.resolve_mesh(mesh).unwrap().geometry_version, 3);

        cache.invalidate_mesh(mesh, device.as_mut(), &mut scheduler, &mut purge);
        assert!(matches!(cache.resolve_mesh(mesh), Err(RthsError::ContractViolation(_))));
        assert_eq!(cache.mesh_count(), 0);
    }

    #[test]
    fn test_released_markers_do_not_accumulate() {
        let soft = SoftDevice::new(256);
        let mut device: Box<dyn RtDevice> = Box::new(soft.clone());
        let mut scheduler = Scheduler::new(256);
        let mut purge = PurgeList::new();
        let mut cache = RecordCache::new();

        let mut meshes: SlotMap<MeshHandle, ()> = SlotMap::with_key();
        let mut instances: SlotMap<InstanceHandle, ()> = SlotMap::with_key();
        let mut last = None;
        for _ in 0..10_000 {
            let mesh = meshes.insert(());
            let inst = instances.insert(());
            cache.resolve_mesh(mesh).unwrap();
            cache.resolve_instance(inst, mesh).unwrap();
            cache.invalidate_instance(inst, device.as_mut(), &mut scheduler, &mut purge);
            cache.invalidate_mesh(mesh, device.as_mut(), &mut scheduler, &mut purge);
            meshes.remove(mesh);
            instances.remove(inst);
            last = Some(mesh);
        }

        // 宿主复用了同一个 slot，只留下最后一次的 released 标记
        assert_eq!(cache.slot_count(), 2);
        assert_eq!(cache.mesh_count(), 0);
        let stale = last.unwrap();
        assert!(matches!(cache.resolve_mesh(stale), Err(RthsError::ContractViolation(_))));
        assert!(purge.is_empty());
    }

    #[test]
    fn test_in_flight_resources_are_deferred() {
        let soft = SoftDevice::new(256);
        soft.hold_completion(true);
        let mut device: Box<dyn RtDevice> = Box::new(soft.clone());
        let mut scheduler = Scheduler::new(256);
        let mut purge = PurgeList::new();
        let mut cache = RecordCache::new();

        let mut handles: SlotMap<InstanceHandle, ()> = SlotMap::with_key();
        let inst = handles.insert(());
        let blas = device.create_acceleration(AccelKind::Bottom, 1024).unwrap();
        cache.resolve_instance(inst, MeshHandle::default()).unwrap().blas = Some(blas);

        let mut list = CommandList::new("use-blas");
        scheduler.require(&mut list, &[(blas.into(), ResourceState::AccelRead)]);
        let point = scheduler.submit(device.as_mut(), QueueKind::Raytrace, list, &[]).unwrap();

        cache.invalidate_instance(inst, device.as_mut(), &mut scheduler, &mut purge);
        assert_eq!(purge.len(), 1);
        assert_eq!(soft.stats().live_accels, 1);

        scheduler.wait_for(device.as_mut(), point).unwrap();
        purge.release_retired(device.as_mut(), &mut scheduler);
        assert_eq!(soft.stats().live_accels, 0);
        assert!(soft.violations().is_empty());
    }
}

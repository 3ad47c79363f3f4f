//! 加速结构的构建
//!
//! 每次构建都写入一个新的加速结构，构建失败时上一次的结果保持不变。
//! scratch buffer 每次构建单独分配，交给 transient pool，不需要在构建之间插入 barrier。

use itertools::Itertools;

use crate::backend::{
    AccelGeometry, AccelId, AccelKind, BufferDesc, BufferId, BufferUsage, CommandList, DeviceResult, GpuCommand,
    MemoryLocation, ResourceRef, RtDevice, align_up,
};
use crate::frame::{PurgeList, TransientPool};
use crate::gpu_types::TlasInstance;
use crate::resource_state::ResourceState;
use crate::scheduler::Scheduler;

/// 录制一次 BLAS 构建，返回新的 BLAS
///
/// 构建完成后 BLAS 处于 [`ResourceState::AccelWrite`]，被 TLAS 使用之前需要切换状态
pub fn build_bottom_level(
    device: &mut dyn RtDevice,
    scheduler: &mut Scheduler,
    list: &mut CommandList,
    transients: &mut TransientPool,
    geometry: &AccelGeometry,
) -> DeviceResult<AccelId> {
    let _span = tracy_client::span!("build_bottom_level");
    debug_assert!(matches!(geometry, AccelGeometry::Triangles { .. }));

    let blas = record_build(device, scheduler, list, transients, AccelKind::Bottom, geometry)?;
    log::debug!("record blas build {:?}: {} triangles", blas, geometry.primitive_count());
    Ok(blas)
}

/// 每帧重建的 TLAS，以及它的 instance buffer
pub struct TopLevel {
    /// 最近一次构建成功的 TLAS
    tlas: Option<AccelId>,
    instance_buffer: Option<BufferId>,
    instance_capacity: u32,
}

// new & init
impl TopLevel {
    pub fn new() -> Self {
        Self {
            tlas: None,
            instance_buffer: None,
            instance_capacity: 0,
        }
    }
}

impl Default for TopLevel {
    fn default() -> Self {
        Self::new()
    }
}

// getters
impl TopLevel {
    #[inline]
    pub fn current(&self) -> Option<AccelId> {
        self.tlas
    }

    #[inline]
    pub fn instance_capacity(&self) -> u32 {
        self.instance_capacity
    }
}

impl TopLevel {
    /// 按 `instances` 录制一个新的 TLAS 的构建，`blases` 为这些 instance 引用的 BLAS
    ///
    /// 返回的 TLAS 处于 [`ResourceState::AccelRead`]，提交成功后需要调用 [`TopLevel::commit`]
    pub fn build_top_level(
        &mut self,
        device: &mut dyn RtDevice,
        scheduler: &mut Scheduler,
        list: &mut CommandList,
        transients: &mut TransientPool,
        purge: &mut PurgeList,
        instances: &[TlasInstance],
        blases: &[AccelId],
    ) -> DeviceResult<AccelId> {
        let _span = tracy_client::span!("build_top_level");

        let instance_buffer = self.write_instances(device, scheduler, purge, instances)?;

        let blas_uses = blases.iter().unique().map(|b| (ResourceRef::Accel(*b), ResourceState::AccelRead)).collect_vec();
        scheduler.require(list, &blas_uses);
        for (blas, _) in &blas_uses {
            list.reference(*blas);
        }

        let geometry = AccelGeometry::Instances {
            instances: instance_buffer,
            offset: 0,
            count: instances.len() as u32,
        };
        let tlas = record_build(device, scheduler, list, transients, AccelKind::Top, &geometry)?;
        scheduler.require(list, &[(tlas.into(), ResourceState::AccelRead)]);
        log::debug!("record tlas build {:?}: {} instances", tlas, instances.len());
        Ok(tlas)
    }

    /// 新的 TLAS 已经提交，旧的交给 purge list
    pub fn commit(&mut self, tlas: AccelId, scheduler: &Scheduler, purge: &mut PurgeList) {
        if let Some(old) = self.tlas.replace(tlas) {
            purge.defer(scheduler, old);
        }
    }

    /// 写入 instance buffer，容量不足时按 2 的幂增长
    fn write_instances(
        &mut self,
        device: &mut dyn RtDevice,
        scheduler: &mut Scheduler,
        purge: &mut PurgeList,
        instances: &[TlasInstance],
    ) -> DeviceResult<BufferId> {
        let needed = (instances.len() as u32).max(1);
        let buffer = match self.instance_buffer {
            Some(buffer) if needed <= self.instance_capacity => buffer,
            old => {
                if let Some(old) = old {
                    purge.defer(scheduler, old);
                }
                let capacity = needed.next_power_of_two();
                let buffer = device.create_buffer(&BufferDesc {
                    size: capacity as u64 * std::mem::size_of::<TlasInstance>() as u64,
                    usage: BufferUsage::BUILD_INPUT,
                    location: MemoryLocation::Upload,
                    label: "tlas-instances".to_string(),
                })?;
                self.instance_buffer = Some(buffer);
                self.instance_capacity = capacity;
                buffer
            }
        };

        scheduler.wait_retired(device, buffer)?;
        device.write_buffer(buffer, 0, bytemuck::cast_slice(instances))?;
        Ok(buffer)
    }
}

// destroy
impl TopLevel {
    pub fn release(&mut self, scheduler: &Scheduler, purge: &mut PurgeList) {
        if let Some(tlas) = self.tlas.take() {
            purge.defer(scheduler, tlas);
        }
        if let Some(buffer) = self.instance_buffer.take() {
            purge.defer(scheduler, buffer);
        }
        self.instance_capacity = 0;
    }

    /// 设备重建之后资源已经不存在
    pub fn forget(&mut self) {
        self.tlas = None;
        self.instance_buffer = None;
        self.instance_capacity = 0;
    }
}

/// 提交失败之后，丢弃这次录制中创建的加速结构
///
/// 它们没有被任何成功的提交引用过，可以立即销毁
pub fn abandon(device: &mut dyn RtDevice, scheduler: &mut Scheduler, accels: impl IntoIterator<Item = AccelId>) {
    for accel in accels {
        scheduler.destroy(device, accel.into());
    }
}

fn record_build(
    device: &mut dyn RtDevice,
    scheduler: &mut Scheduler,
    list: &mut CommandList,
    transients: &mut TransientPool,
    kind: AccelKind,
    geometry: &AccelGeometry,
) -> DeviceResult<AccelId> {
    let sizes = device.acceleration_sizes(geometry)?;
    let accel = device.create_acceleration(kind, sizes.structure_size)?;

    let scratch_alignment = device.caps().scratch_alignment;
    let scratch = device.create_buffer(&BufferDesc {
        size: align_up(sizes.scratch_size.max(1), scratch_alignment),
        usage: BufferUsage::ACCEL_SCRATCH,
        location: MemoryLocation::GpuOnly,
        label: format!("{}-scratch", list.label()),
    });
    let scratch = match scratch {
        Ok(scratch) => scratch,
        Err(e) => {
            device.destroy_acceleration(accel);
            return Err(e);
        }
    };
    transients.defer(scheduler, scratch);

    let mut uses = geometry.buffers().into_iter().map(|b| (ResourceRef::Buffer(b), ResourceState::BuildInput)).collect_vec();
    uses.push((accel.into(), ResourceState::AccelWrite));
    uses.push((scratch.into(), ResourceState::AccelWrite));
    scheduler.require(list, &uses);

    list.push(GpuCommand::BuildAcceleration {
        dst: accel,
        geometry: geometry.clone(),
        scratch,
        scratch_offset: 0,
    });
    Ok(accel)
}

#[cfg(test)]
mod tests {
    use glam::{Mat4, Vec3};

    use super::*;
    use crate::backend::QueueKind;
    use crate::backend::soft::SoftDevice;
    use crate::gpu_types::{INSTANCE_FLAG_FRONT_COUNTERCLOCKWISE, RAY_MASK_CAMERA};
    use crate::host::IndexFormat;

    fn triangle_geometry(device: &mut dyn RtDevice) -> AccelGeometry {
        let positions = [Vec3::new(-1.0, -1.0, 0.0), Vec3::new(1.0, -1.0, 0.0), Vec3::new(0.0, 1.0, 0.0)];
        let vertices = device
            .create_buffer(&BufferDesc {
                size: 36,
                usage: BufferUsage::BUILD_INPUT,
                location: MemoryLocation::Upload,
                label: "vertices".to_string(),
            })
            .unwrap();
        device.write_buffer(vertices, 0, bytemuck::cast_slice(&positions)).unwrap();
        let indices = device
            .create_buffer(&BufferDesc {
                size: 12,
                usage: BufferUsage::BUILD_INPUT,
                location: MemoryLocation::Upload,
                label: "indices".to_string(),
            })
            .unwrap();
        device.write_buffer(indices, 0, bytemuck::cast_slice(&[0u32, 1, 2])).unwrap();
        AccelGeometry::Triangles {
            vertices,
            vertex_offset: 0,
            vertex_stride: 12,
            vertex_count: 3,
            indices,
            index_offset: 0,
            index_format: IndexFormat::U32,
            index_count: 3,
        }
    }

    #[test]
    fn test_build_blas_then_tlas() {
        let soft = SoftDevice::new(256);
        let mut device: Box<dyn RtDevice> = Box::new(soft.clone());
        let mut scheduler = Scheduler::new(256);
        let mut transients = TransientPool::new();
        let mut purge = PurgeList::new();
        let mut top = TopLevel::new();

        let geometry = triangle_geometry(device.as_mut());
        let mut list = CommandList::new("build");
        let blas = build_bottom_level(device.as_mut(), &mut scheduler, &mut list, &mut transients, &geometry).unwrap();
        let address = device.acceleration_address(blas).unwrap();
        let instance =
            TlasInstance::new(&Mat4::IDENTITY, 0, RAY_MASK_CAMERA, 0, INSTANCE_FLAG_FRONT_COUNTERCLOCKWISE, address);
        let tlas = top
            .build_top_level(device.as_mut(), &mut scheduler, &mut list, &mut transients, &mut purge, &[instance], &[blas])
            .unwrap();
        scheduler.submit(device.as_mut(), QueueKind::Raytrace, list, &[]).unwrap();
        top.commit(tlas, &scheduler, &mut purge);

        assert_eq!(top.current(), Some(tlas));
        assert_eq!(scheduler.state(blas), ResourceState::AccelRead);
        assert_eq!(scheduler.state(tlas), ResourceState::AccelRead);
        assert_eq!(soft.stats().builds, 2);
        assert!(soft.violations().is_empty());
    }

    #[test]
    fn test_failed_build_keeps_previous_tlas() {
        let soft = SoftDevice::new(256);
        let mut device: Box<dyn RtDevice> = Box::new(soft.clone());
        let mut scheduler = Scheduler::new(256);
        let mut transients = TransientPool::new();
        let mut purge = PurgeList::new();
        let mut top = TopLevel::new();

        let mut list = CommandList::new("first");
        let first = top
            .build_top_level(device.as_mut(), &mut scheduler, &mut list, &mut transients, &mut purge, &[], &[])
            .unwrap();
        scheduler.submit(device.as_mut(), QueueKind::Raytrace, list, &[]).unwrap();
        top.commit(first, &scheduler, &mut purge);

        soft.fail_next_build();
        let mut list = CommandList::new("second");
        let second = top
            .build_top_level(device.as_mut(), &mut scheduler, &mut list, &mut transients, &mut purge, &[], &[])
            .unwrap();
        assert!(scheduler.submit(device.as_mut(), QueueKind::Raytrace, list, &[]).is_err());
        abandon(device.as_mut(), &mut scheduler, [second]);

        assert_eq!(top.current(), Some(first));
        assert_eq!(scheduler.state(first), ResourceState::AccelRead);
        assert_eq!(soft.stats().live_accels, 1);
        assert!(soft.violations().is_empty());
    }
}

//! shader binding table
//!
//! 布局：raygen | camera miss, shadow miss | 每个 instance 的 RAY_TYPE_COUNT 个 hit record。
//! hit record 为 handle 之后紧跟 [`HitRecordArgs`]，每帧按 TLAS 中 instance 的顺序整体重写。

use crate::backend::{
    BufferDesc, BufferId, BufferUsage, DeviceCaps, DeviceResult, MemoryLocation, RtDevice, SbtRegion, ShaderGroup,
    align_up,
};
use crate::frame::PurgeList;
use crate::gpu_types::{HitRecordArgs, RAY_TYPE_COUNT};
use crate::scheduler::Scheduler;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub struct ShaderTableLayout {
    pub raygen: SbtRegion,
    pub miss: SbtRegion,
    pub hit: SbtRegion,
    pub total_size: u64,
}

impl ShaderTableLayout {
    /// 每条 record 的大小，所有区域共用
    #[inline]
    pub fn record_stride(caps: &DeviceCaps) -> u64 {
        align_up(
            caps.shader_group_handle_size as u64 + std::mem::size_of::<HitRecordArgs>() as u64,
            caps.shader_group_handle_alignment as u64,
        )
    }

    pub fn new(caps: &DeviceCaps, capacity: u32) -> Self {
        let stride = Self::record_stride(caps);
        let base = caps.shader_group_base_alignment as u64;

        // raygen 区域的 size 必须等于 stride
        let raygen = SbtRegion {
            offset: 0,
            stride,
            size: stride,
        };
        let miss = SbtRegion {
            offset: align_up(raygen.offset + raygen.size, base),
            stride,
            size: stride * 2,
        };
        let hit = SbtRegion {
            offset: align_up(miss.offset + miss.size, base),
            stride,
            size: stride * (capacity * RAY_TYPE_COUNT) as u64,
        };
        Self {
            raygen,
            miss,
            hit,
            total_size: hit.offset + hit.size,
        }
    }
}

pub struct ShaderTableManager {
    buffer: Option<BufferId>,
    /// 可以容纳的 instance 数量
    capacity: u32,
    layout: ShaderTableLayout,
}

// new & init
impl ShaderTableManager {
    pub fn new(initial_capacity: u32) -> Self {
        Self {
            buffer: None,
            capacity: initial_capacity.max(1),
            layout: ShaderTableLayout::default(),
        }
    }
}

// getters
impl ShaderTableManager {
    #[inline]
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    #[inline]
    pub fn buffer(&self) -> Option<BufferId> {
        self.buffer
    }

    #[inline]
    pub fn layout(&self) -> &ShaderTableLayout {
        &self.layout
    }
}

// destroy
impl ShaderTableManager {
    /// renderer 释放时，buffer 交给 purge list
    pub fn release(&mut self, scheduler: &Scheduler, purge: &mut PurgeList) {
        if let Some(buffer) = self.buffer.take() {
            purge.defer(scheduler, buffer);
        }
    }

    /// 设备重建之后旧的 buffer 已经不存在，容量保持不变
    #[inline]
    pub fn forget(&mut self) {
        self.buffer = None;
    }
}

impl ShaderTableManager {
    /// 按 `instances` 的顺序重写整张表，第 i 个 instance 的 SBT offset 为 `i * RAY_TYPE_COUNT`
    ///
    /// 容量不足时按 2 倍增长，旧的 buffer 交给 purge list
    pub fn update(
        &mut self,
        device: &mut dyn RtDevice,
        scheduler: &mut Scheduler,
        purge: &mut PurgeList,
        instances: &[HitRecordArgs],
    ) -> DeviceResult<(BufferId, ShaderTableLayout)> {
        let _span = tracy_client::span!("ShaderTableManager::update");

        let needed = instances.len() as u32;
        let mut capacity = self.capacity;
        while capacity < needed {
            capacity *= 2;
        }
        let buffer = match self.buffer {
            Some(buffer) if capacity == self.capacity => buffer,
            old => {
                if let Some(old) = old {
                    log::info!("shader table grows from {} to {} instances", self.capacity, capacity);
                    purge.defer(scheduler, old);
                }
                let layout = ShaderTableLayout::new(device.caps(), capacity);
                let buffer = device.create_buffer(&BufferDesc {
                    size: layout.total_size,
                    usage: BufferUsage::SHADER_TABLE,
                    location: MemoryLocation::Upload,
                    label: "shader-table".to_string(),
                })?;
                self.buffer = Some(buffer);
                self.capacity = capacity;
                self.layout = layout;
                buffer
            }
        };

        let bytes = self.encode(device, instances);
        scheduler.wait_retired(device, buffer)?;
        device.write_buffer(buffer, 0, &bytes)?;
        Ok((buffer, self.layout))
    }

    fn encode(&self, device: &dyn RtDevice, instances: &[HitRecordArgs]) -> Vec<u8> {
        let layout = &self.layout;
        let mut bytes = vec![0u8; layout.total_size as usize];
        let mut write = |offset: u64, data: &[u8]| {
            let offset = offset as usize;
            bytes[offset..offset + data.len()].copy_from_slice(data);
        };

        write(layout.raygen.offset, device.shader_group_handle(ShaderGroup::RayGen));
        write(layout.miss.offset, device.shader_group_handle(ShaderGroup::CameraMiss));
        write(layout.miss.offset + layout.miss.stride, device.shader_group_handle(ShaderGroup::ShadowMiss));

        let hit_handle = device.shader_group_handle(ShaderGroup::Hit);
        let handle_size = hit_handle.len() as u64;
        for (i, args) in instances.iter().enumerate() {
            for ray_type in 0..RAY_TYPE_COUNT as u64 {
                let record = layout.hit.offset + (i as u64 * RAY_TYPE_COUNT as u64 + ray_type) * layout.hit.stride;
                write(record, hit_handle);
                write(record + handle_size, bytemuck::bytes_of(args));
            }
        }
        bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::soft::SoftDevice;

    fn args(count: u32) -> Vec<HitRecordArgs> {
        (0..count)
            .map(|i| HitRecordArgs {
                instance_id: i,
                mask: 0xff,
                flags: 0,
                material: 0,
            })
            .collect()
    }

    #[test]
    fn test_layout_alignment() {
        let soft = SoftDevice::new(256);
        let caps = soft.caps().clone();
        let layout = ShaderTableLayout::new(&caps, 3);
        // 32 字节 handle + 16 字节参数，按 32 对齐
        assert_eq!(layout.raygen.stride, 64);
        assert_eq!(layout.raygen.size, layout.raygen.stride);
        assert_eq!(layout.miss.offset % caps.shader_group_base_alignment as u64, 0);
        assert_eq!(layout.hit.offset % caps.shader_group_base_alignment as u64, 0);
        assert_eq!(layout.hit.size, 64 * 6);
    }

    #[test]
    fn test_capacity_grows_geometrically_and_never_shrinks() {
        let soft = SoftDevice::new(256);
        let mut device: Box<dyn RtDevice> = Box::new(soft.clone());
        let mut scheduler = Scheduler::new(256);
        let mut purge = PurgeList::new();
        let mut table = ShaderTableManager::new(2);

        table.update(device.as_mut(), &mut scheduler, &mut purge, &args(1)).unwrap();
        assert_eq!(table.capacity(), 2);
        let first = table.buffer();

        table.update(device.as_mut(), &mut scheduler, &mut purge, &args(5)).unwrap();
        assert_eq!(table.capacity(), 8);
        assert_ne!(table.buffer(), first);
        assert_eq!(purge.len(), 1);

        table.update(device.as_mut(), &mut scheduler, &mut purge, &args(1)).unwrap();
        assert_eq!(table.capacity(), 8);
        assert_eq!(purge.len(), 1);
    }
}

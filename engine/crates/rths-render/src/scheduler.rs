//! 双队列的命令提交、barrier 与 fence 跟踪

use std::collections::HashMap;

use crate::backend::{
    BufferDesc, BufferId, BufferUsage, CommandList, DeviceResult, FencePoint, GpuCommand, MemoryLocation, QueueKind,
    ResourceRef, RtDevice, TextureFormat, TextureId, aligned_row_pitch,
};
use crate::resource_state::{ResourceState, StateTracker};

/// 资源最后一次被各个 queue 使用时的 fence 值
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct FenceMark {
    values: [u64; 2],
}

impl FenceMark {
    #[inline]
    pub fn record(&mut self, point: FencePoint) {
        let v = &mut self.values[point.queue.index()];
        *v = (*v).max(point.value);
    }

    #[inline]
    pub fn value(&self, queue: QueueKind) -> u64 {
        self.values[queue.index()]
    }

    /// 需要等待的 fence，已经是 0 的 queue 不需要等待
    pub fn points(&self) -> impl Iterator<Item = FencePoint> + '_ {
        QueueKind::ALL
            .into_iter()
            .filter(|q| self.value(*q) > 0)
            .map(|queue| FencePoint {
                queue,
                value: self.value(queue),
            })
    }
}

pub struct Scheduler {
    states: StateTracker,
    marks: HashMap<ResourceRef, FenceMark>,

    /// 每个 queue 已经提交的最大 fence 值
    submitted: [u64; 2],
    /// 最近一次查询到的已完成的 fence 值
    completed: [u64; 2],

    row_pitch_alignment: u64,
}

// new & init
impl Scheduler {
    pub fn new(row_pitch_alignment: u64) -> Self {
        Self {
            states: StateTracker::new(),
            marks: HashMap::new(),
            submitted: [0; 2],
            completed: [0; 2],
            row_pitch_alignment,
        }
    }

    /// 设备重建之后，所有的状态都需要重新开始
    pub fn reset(&mut self, row_pitch_alignment: u64) {
        *self = Self::new(row_pitch_alignment);
    }
}

// getters
impl Scheduler {
    #[inline]
    pub fn state(&self, resource: impl Into<ResourceRef>) -> ResourceState {
        self.states.state(resource.into())
    }

    #[inline]
    pub fn mark(&self, resource: impl Into<ResourceRef>) -> FenceMark {
        self.marks.get(&resource.into()).copied().unwrap_or_default()
    }

    #[inline]
    pub fn submitted(&self, queue: QueueKind) -> u64 {
        self.submitted[queue.index()]
    }

    /// 基于最近一次查询的结果
    #[inline]
    pub fn is_retired(&self, mark: FenceMark) -> bool {
        QueueKind::ALL.iter().all(|q| mark.value(*q) <= self.completed[q.index()])
    }

    #[inline]
    pub fn is_point_retired(&self, point: FencePoint) -> bool {
        point.value <= self.completed[point.queue.index()]
    }

    #[inline]
    pub fn row_pitch_alignment(&self) -> u64 {
        self.row_pitch_alignment
    }
}

// barrier 与提交
impl Scheduler {
    /// 把资源切换到需要的状态，只为真正发生的变化录制 barrier
    pub fn require(&mut self, list: &mut CommandList, uses: &[(ResourceRef, ResourceState)]) {
        let transitions = uses
            .iter()
            .filter_map(|(resource, state)| self.states.transition(*resource, *state))
            .collect();
        list.barrier(transitions);
    }

    /// 提交失败时撤销这个列表中的状态变化，设备上什么也没有执行
    pub fn submit(
        &mut self,
        device: &mut dyn RtDevice,
        queue: QueueKind,
        list: CommandList,
        waits: &[FencePoint],
    ) -> DeviceResult<FencePoint> {
        let _span = tracy_client::span!("Scheduler::submit");

        let resources = list.resources();
        let reverted: Vec<_> = list.transitions().rev().copied().collect();
        let label = list.label().to_string();

        match device.submit(queue, list, waits) {
            Ok(point) => {
                log::debug!("submit `{}` to {:?} queue: fence {}", label, queue, point.value);
                self.submitted[queue.index()] = self.submitted[queue.index()].max(point.value);
                for resource in resources {
                    self.marks.entry(resource).or_default().record(point);
                }
                Ok(point)
            }
            Err(e) => {
                for t in reverted {
                    self.states.restore(t.resource, t.before);
                }
                Err(e)
            }
        }
    }

    /// 放弃一个没有提交的列表，撤销其中录制的状态变化
    pub fn discard(&mut self, list: CommandList) {
        log::debug!("discard `{}`", list.label());
        for t in list.transitions().rev() {
            self.states.restore(t.resource, t.before);
        }
    }

    /// 阻塞直到 `point` 完成
    pub fn wait_for(&mut self, device: &mut dyn RtDevice, point: FencePoint) -> DeviceResult<()> {
        let _span = tracy_client::span!("Scheduler::wait_for");
        if !self.is_point_retired(point) {
            device.wait(point)?;
        }
        self.refresh(device)
    }

    /// 非阻塞地查询某个 queue 完成的进度
    pub fn poll(&mut self, device: &mut dyn RtDevice, queue: QueueKind) -> DeviceResult<u64> {
        let value = device.completed(queue)?;
        let slot = &mut self.completed[queue.index()];
        *slot = (*slot).max(value);
        Ok(*slot)
    }

    pub fn refresh(&mut self, device: &mut dyn RtDevice) -> DeviceResult<()> {
        for queue in QueueKind::ALL {
            self.poll(device, queue)?;
        }
        Ok(())
    }

    /// 在 CPU 改写资源之前，等待所有使用它的 GPU 工作完成
    pub fn wait_retired(&mut self, device: &mut dyn RtDevice, resource: impl Into<ResourceRef>) -> DeviceResult<()> {
        let mark = self.mark(resource);
        if self.is_retired(mark) {
            return Ok(());
        }
        log::debug!("waiting for {:?} before reuse", mark);
        for point in mark.points() {
            self.wait_for(device, point)?;
        }
        Ok(())
    }

    /// 立即销毁资源，调用者需要保证资源已经 retired
    pub fn destroy(&mut self, device: &mut dyn RtDevice, resource: ResourceRef) {
        debug_assert!(self.is_retired(self.mark(resource)), "{:?} destroyed while in flight", resource);
        match resource {
            ResourceRef::Buffer(id) => device.destroy_buffer(id),
            ResourceRef::Texture(id) => device.destroy_texture(id),
            ResourceRef::Accel(id) => device.destroy_acceleration(id),
        }
        self.states.forget(resource);
        self.marks.remove(&resource);
    }
}

// staging
impl Scheduler {
    /// 通过 staging buffer 把数据上传到 `dst`，返回 staging buffer
    ///
    /// staging buffer 需要在这次提交 retired 之后释放
    pub fn upload_buffer(
        &mut self,
        device: &mut dyn RtDevice,
        list: &mut CommandList,
        dst: BufferId,
        dst_offset: u64,
        data: &[u8],
    ) -> DeviceResult<BufferId> {
        let staging = device.create_buffer(&BufferDesc {
            size: data.len() as u64,
            usage: BufferUsage::COPY_SRC,
            location: MemoryLocation::Upload,
            label: format!("{}-staging", list.label()),
        })?;
        if let Err(e) = device.write_buffer(staging, 0, data) {
            device.destroy_buffer(staging);
            return Err(e);
        }

        self.require(
            list,
            &[(staging.into(), ResourceState::CopySrc), (dst.into(), ResourceState::CopyDst)],
        );
        list.push(GpuCommand::CopyBuffer {
            src: staging,
            src_offset: 0,
            dst,
            dst_offset,
            size: data.len() as u64,
        });
        Ok(staging)
    }

    /// 通过 staging buffer 上传 2D 纹理，staging 中的每一行按设备要求对齐
    pub fn upload_texture(
        &mut self,
        device: &mut dyn RtDevice,
        list: &mut CommandList,
        dst: TextureId,
        width: u32,
        height: u32,
        format: TextureFormat,
        pixels: &[u8],
    ) -> DeviceResult<BufferId> {
        let row_pitch = self.row_pitch(width, format);
        let padded = pad_rows(pixels, width as usize * format.bytes_per_pixel() as usize, height as usize, row_pitch as usize);
        let staging = device.create_buffer(&BufferDesc {
            size: padded.len() as u64,
            usage: BufferUsage::COPY_SRC,
            location: MemoryLocation::Upload,
            label: format!("{}-texture-staging", list.label()),
        })?;
        if let Err(e) = device.write_buffer(staging, 0, &padded) {
            device.destroy_buffer(staging);
            return Err(e);
        }

        self.require(
            list,
            &[(staging.into(), ResourceState::CopySrc), (dst.into(), ResourceState::CopyDst)],
        );
        list.push(GpuCommand::CopyBufferToTexture {
            src: staging,
            src_offset: 0,
            row_pitch,
            dst,
        });
        Ok(staging)
    }

    /// 把纹理拷贝进 readback buffer，完成后 buffer 处于 [`ResourceState::HostRead`]
    pub fn record_texture_readback(&mut self, list: &mut CommandList, src: TextureId, dst: BufferId, row_pitch: u64) {
        self.require(list, &[(src.into(), ResourceState::CopySrc), (dst.into(), ResourceState::CopyDst)]);
        list.push(GpuCommand::CopyTextureToBuffer {
            src,
            dst,
            dst_offset: 0,
            row_pitch,
        });
        self.require(list, &[(dst.into(), ResourceState::HostRead)]);
    }

    /// 把 buffer 拷贝进 readback buffer
    pub fn record_buffer_readback(&mut self, list: &mut CommandList, src: BufferId, src_offset: u64, dst: BufferId, size: u64) {
        self.require(list, &[(src.into(), ResourceState::CopySrc), (dst.into(), ResourceState::CopyDst)]);
        list.push(GpuCommand::CopyBuffer {
            src,
            src_offset,
            dst,
            dst_offset: 0,
            size,
        });
        self.require(list, &[(dst.into(), ResourceState::HostRead)]);
    }

    #[inline]
    pub fn row_pitch(&self, width: u32, format: TextureFormat) -> u64 {
        aligned_row_pitch(width, format, self.row_pitch_alignment)
    }
}

/// 每行补齐到 `row_pitch` 字节
pub fn pad_rows(tight: &[u8], row_bytes: usize, height: usize, row_pitch: usize) -> Vec<u8> {
    let mut padded = vec![0u8; row_pitch * height];
    for (src, dst) in tight.chunks(row_bytes).take(height).zip(padded.chunks_mut(row_pitch)) {
        dst[..src.len()].copy_from_slice(src);
    }
    padded
}

/// 去掉每行末尾的对齐填充
pub fn strip_rows(padded: &[u8], row_bytes: usize, height: usize, row_pitch: usize, dst: &mut Vec<u8>) {
    dst.clear();
    dst.reserve(row_bytes * height);
    for row in padded.chunks(row_pitch).take(height) {
        dst.extend_from_slice(&row[..row_bytes.min(row.len())]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::soft::SoftDevice;

    #[test]
    fn test_padding_roundtrip_strips_padding() {
        let tight: Vec<u8> = (0..12).collect();
        let padded = pad_rows(&tight, 3, 4, 8);
        assert_eq!(padded.len(), 32);
        assert_eq!(&padded[8..11], &[3, 4, 5]);
        assert_eq!(&padded[11..16], &[0; 5]);

        let mut out = Vec::new();
        strip_rows(&padded, 3, 4, 8, &mut out);
        assert_eq!(out, tight);
    }

    #[test]
    fn test_marks_follow_submissions() {
        let soft = SoftDevice::new(256);
        soft.hold_completion(true);
        let mut device: Box<dyn RtDevice> = Box::new(soft.clone());
        let mut scheduler = Scheduler::new(256);

        let dst = device
            .create_buffer(&BufferDesc {
                size: 16,
                usage: BufferUsage::COPY_DST,
                location: MemoryLocation::GpuOnly,
                label: "dst".to_string(),
            })
            .unwrap();
        let mut list = CommandList::new("upload");
        let staging = scheduler.upload_buffer(device.as_mut(), &mut list, dst, 0, &[1u8; 16]).unwrap();
        let point = scheduler.submit(device.as_mut(), QueueKind::Copy, list, &[]).unwrap();

        assert_eq!(scheduler.mark(dst).value(QueueKind::Copy), point.value);
        assert_eq!(scheduler.mark(staging).value(QueueKind::Raytrace), 0);
        assert_eq!(scheduler.state(dst), ResourceState::CopyDst);

        scheduler.refresh(device.as_mut()).unwrap();
        assert!(!scheduler.is_retired(scheduler.mark(staging)));
        assert_eq!(scheduler.poll(device.as_mut(), QueueKind::Copy).unwrap(), 0);

        scheduler.wait_for(device.as_mut(), point).unwrap();
        assert!(scheduler.is_retired(scheduler.mark(staging)));
        scheduler.destroy(device.as_mut(), staging.into());
        assert_eq!(scheduler.state(staging), ResourceState::Undefined);
    }

    #[test]
    fn test_failed_staging_write_frees_staging() {
        let soft = SoftDevice::new(256);
        let mut device: Box<dyn RtDevice> = Box::new(soft.clone());
        let mut scheduler = Scheduler::new(256);

        let dst = device
            .create_buffer(&BufferDesc {
                size: 16,
                usage: BufferUsage::COPY_DST,
                location: MemoryLocation::GpuOnly,
                label: "dst".to_string(),
            })
            .unwrap();
        let texture = device
            .create_texture(&crate::backend::TextureDesc {
                width: 4,
                height: 4,
                format: TextureFormat::R8Unorm,
                label: "dst-texture".to_string(),
            })
            .unwrap();
        let mut list = CommandList::new("upload");

        soft.fail_next_write();
        assert!(scheduler.upload_buffer(device.as_mut(), &mut list, dst, 0, &[1u8; 16]).is_err());
        soft.fail_next_write();
        let pixels = [0u8; 16];
        assert!(
            scheduler
                .upload_texture(device.as_mut(), &mut list, texture, 4, 4, TextureFormat::R8Unorm, &pixels)
                .is_err()
        );

        assert_eq!(soft.stats().live_buffers, 1);
        assert!(list.is_empty());
    }

    #[test]
    fn test_failed_submit_reverts_states() {
        let soft = SoftDevice::new(256);
        let mut device: Box<dyn RtDevice> = Box::new(soft.clone());
        let mut scheduler = Scheduler::new(256);

        let dst = device
            .create_buffer(&BufferDesc {
                size: 16,
                usage: BufferUsage::COPY_DST,
                location: MemoryLocation::GpuOnly,
                label: "dst".to_string(),
            })
            .unwrap();
        let mut list = CommandList::new("bad");
        scheduler.require(&mut list, &[(dst.into(), ResourceState::CopyDst)]);
        // 等待一个从未提交过的 fence
        let bogus = FencePoint {
            queue: QueueKind::Raytrace,
            value: 42,
        };
        assert!(scheduler.submit(device.as_mut(), QueueKind::Copy, list, &[bogus]).is_err());
        assert_eq!(scheduler.state(dst), ResourceState::Undefined);
    }
}

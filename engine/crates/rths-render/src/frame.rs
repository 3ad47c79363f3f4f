//! 帧的生命周期

use crate::backend::{ResourceRef, RtDevice};
use crate::scheduler::{FenceMark, Scheduler};

/// 每个 renderer 的帧状态
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Default)]
pub enum FramePhase {
    #[default]
    Idle,
    Preparing,
    Uploading,
    Building,
    Dispatching,
    /// 命令已经提交，等待 finish
    AwaitingFence,
    Complete,
}

impl FramePhase {
    /// 是否有一帧已经开始但还没有 finish
    #[inline]
    pub fn in_flight(self) -> bool {
        !matches!(self, FramePhase::Idle | FramePhase::Complete)
    }
}

/// 一帧最终的结果
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum FrameOutcome {
    Rendered,
    /// 加速结构构建失败，保留了上一帧的输出
    Skipped,
}

/// 等待 fence 完成之后才能销毁的资源
#[derive(Default)]
pub struct RetireList {
    entries: Vec<(ResourceRef, FenceMark)>,
}

/// 每帧的临时资源：staging、scratch、deformer 输出的顶点
pub type TransientPool = RetireList;

/// 被 invalidate 的 record 留下的资源
pub type PurgeList = RetireList;

impl RetireList {
    pub fn new() -> Self {
        Self::default()
    }

    /// `mark` 需要是资源最后一次被使用时的 fence mark
    #[inline]
    pub fn push(&mut self, resource: ResourceRef, mark: FenceMark) {
        self.entries.push((resource, mark));
    }

    /// 资源交给列表之后，使用 scheduler 中记录的 mark
    #[inline]
    pub fn defer(&mut self, scheduler: &Scheduler, resource: impl Into<ResourceRef>) {
        let resource = resource.into();
        self.push(resource, scheduler.mark(resource));
    }

    /// 销毁所有已经 retired 的资源，返回销毁的数量
    pub fn release_retired(&mut self, device: &mut dyn RtDevice, scheduler: &mut Scheduler) -> usize {
        let (retired, pending): (Vec<_>, Vec<_>) = std::mem::take(&mut self.entries)
            .into_iter()
            .partition(|(resource, mark)| {
                // 入队之后资源可能又被提交过
                let latest = scheduler.mark(*resource);
                scheduler.is_retired(*mark) && scheduler.is_retired(latest)
            });
        self.entries = pending;
        for (resource, _) in &retired {
            scheduler.destroy(device, *resource);
        }
        retired.len()
    }

    /// 接管 `other` 中的所有资源
    #[inline]
    pub fn append(&mut self, other: &mut RetireList) {
        self.entries.append(&mut other.entries);
    }

    /// 设备重建之后资源已经不存在，只清空列表
    #[inline]
    pub fn forget_all(&mut self) {
        self.entries.clear();
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::soft::SoftDevice;
    use crate::backend::{BufferDesc, BufferUsage, CommandList, MemoryLocation, QueueKind};
    use crate::resource_state::ResourceState;

    #[test]
    fn test_phase_in_flight() {
        assert!(!FramePhase::Idle.in_flight());
        assert!(FramePhase::AwaitingFence.in_flight());
        assert!(!FramePhase::Complete.in_flight());
    }

    #[test]
    fn test_release_waits_for_retirement() {
        let soft = SoftDevice::new(256);
        soft.hold_completion(true);
        let mut device: Box<dyn RtDevice> = Box::new(soft.clone());
        let mut scheduler = Scheduler::new(256);

        let buffer = device
            .create_buffer(&BufferDesc {
                size: 4,
                usage: BufferUsage::COPY_SRC,
                location: MemoryLocation::Upload,
                label: "tmp".to_string(),
            })
            .unwrap();
        let mut list = CommandList::new("use");
        scheduler.require(&mut list, &[(buffer.into(), ResourceState::CopySrc)]);
        let point = scheduler.submit(device.as_mut(), QueueKind::Copy, list, &[]).unwrap();

        let mut pool = TransientPool::new();
        pool.defer(&scheduler, buffer);
        scheduler.refresh(device.as_mut()).unwrap();
        assert_eq!(pool.release_retired(device.as_mut(), &mut scheduler), 0);
        assert_eq!(soft.stats().live_buffers, 1);

        scheduler.wait_for(device.as_mut(), point).unwrap();
        assert_eq!(pool.release_retired(device.as_mut(), &mut scheduler), 1);
        assert!(pool.is_empty());
        assert_eq!(soft.stats().live_buffers, 0);
        assert!(soft.violations().is_empty());
    }
}

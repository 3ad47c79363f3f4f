//! 资源状态以及 barrier 的最小化

use indexmap::IndexMap;

use crate::backend::{ResourceRef, Transition};

/// 资源在某一时刻的用途
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Default)]
pub enum ResourceState {
    /// 刚创建，内容未定义
    #[default]
    Undefined,
    CopySrc,
    CopyDst,
    /// 作为加速结构构建的顶点、索引、instance 输入
    BuildInput,
    /// 加速结构正在被构建，或作为构建的 scratch
    AccelWrite,
    /// 加速结构可以被 trace 或作为 TLAS 的子结构
    AccelRead,
    ShaderTable,
    Constant,
    /// shader 中读写，例如光追的输出纹理
    UnorderedAccess,
    /// CPU 通过 map 读取
    HostRead,
}

impl ResourceState {
    #[inline]
    pub fn is_write(self) -> bool {
        matches!(self, ResourceState::CopyDst | ResourceState::AccelWrite | ResourceState::UnorderedAccess)
    }

    /// 写之后的任何访问都需要 barrier，只读状态之间切换时也需要
    #[inline]
    pub fn needs_barrier(before: ResourceState, after: ResourceState) -> bool {
        before != after || before.is_write()
    }
}

/// 记录每个资源最后已知的状态
#[derive(Default)]
pub struct StateTracker {
    states: IndexMap<ResourceRef, ResourceState>,
}

impl StateTracker {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn state(&self, resource: ResourceRef) -> ResourceState {
        self.states.get(&resource).copied().unwrap_or_default()
    }

    /// 更新状态，需要 barrier 时返回对应的 transition
    pub fn transition(&mut self, resource: ResourceRef, after: ResourceState) -> Option<Transition> {
        let before = self.state(resource);
        if !ResourceState::needs_barrier(before, after) {
            return None;
        }
        self.states.insert(resource, after);
        Some(Transition {
            resource,
            before,
            after,
        })
    }

    /// 提交失败时恢复到 barrier 之前的状态
    pub fn restore(&mut self, resource: ResourceRef, state: ResourceState) {
        if state == ResourceState::Undefined {
            self.states.swap_remove(&resource);
        } else {
            self.states.insert(resource, state);
        }
    }

    /// 资源被销毁之后不再跟踪
    #[inline]
    pub fn forget(&mut self, resource: ResourceRef) {
        self.states.swap_remove(&resource);
    }

    #[inline]
    pub fn clear(&mut self) {
        self.states.clear();
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.states.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use slotmap::KeyData;

    use super::*;
    use crate::backend::BufferId;

    fn buffer(i: u64) -> ResourceRef {
        ResourceRef::Buffer(BufferId::from(KeyData::from_ffi(i)))
    }

    #[test]
    fn test_read_to_same_read_needs_no_barrier() {
        let mut tracker = StateTracker::new();
        let b = buffer(1);
        assert!(tracker.transition(b, ResourceState::Constant).is_some());
        assert!(tracker.transition(b, ResourceState::Constant).is_none());
        assert!(tracker.transition(b, ResourceState::ShaderTable).is_some());
    }

    #[test]
    fn test_write_after_write_needs_barrier() {
        let mut tracker = StateTracker::new();
        let b = buffer(2);
        let first = tracker.transition(b, ResourceState::CopyDst).unwrap();
        assert_eq!(first.before, ResourceState::Undefined);
        let second = tracker.transition(b, ResourceState::CopyDst).unwrap();
        assert_eq!(second.before, ResourceState::CopyDst);
        assert_eq!(tracker.state(b), ResourceState::CopyDst);

        tracker.forget(b);
        assert_eq!(tracker.state(b), ResourceState::Undefined);
        assert!(tracker.is_empty());
    }
}

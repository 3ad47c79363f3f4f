use std::sync::Arc;

use glam::Mat4;

use crate::handles::MeshHandle;

bitflags::bitflags! {
    /// instance 自上次被渲染管线消费之后发生的变化
    #[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Default)]
    pub struct UpdateFlags: u32 {
        const TRANSFORM = 1 << 0;
        const BONE = 1 << 1;
        const BLENDSHAPE = 1 << 2;

        /// 需要重新执行 deformer 的变化
        const DEFORM = Self::BONE.bits() | Self::BLENDSHAPE.bits();
    }
}

/// mesh 在场景中的一次摆放
#[derive(Clone, Debug)]
pub struct MeshInstanceData {
    pub(crate) mesh: MeshHandle,
    pub(crate) transform: Mat4,
    pub(crate) bones: Arc<Vec<Mat4>>,
    pub(crate) blendshape_weights: Arc<Vec<f32>>,

    pub(crate) update_flags: UpdateFlags,
    /// 最近一次变化时 world 的 change serial
    pub(crate) change_serial: u64,
}

impl MeshInstanceData {
    pub(crate) fn new(mesh: MeshHandle) -> Self {
        Self {
            mesh,
            transform: Mat4::IDENTITY,
            bones: Arc::default(),
            blendshape_weights: Arc::default(),
            update_flags: UpdateFlags::empty(),
            change_serial: 0,
        }
    }
}

// getters
impl MeshInstanceData {
    #[inline]
    pub fn mesh(&self) -> MeshHandle {
        self.mesh
    }

    #[inline]
    pub fn transform(&self) -> Mat4 {
        self.transform
    }

    #[inline]
    pub fn bones(&self) -> &[Mat4] {
        &self.bones
    }

    #[inline]
    pub fn blendshape_weights(&self) -> &[f32] {
        &self.blendshape_weights
    }

    #[inline]
    pub fn update_flags(&self) -> UpdateFlags {
        self.update_flags
    }

    #[inline]
    pub fn change_serial(&self) -> u64 {
        self.change_serial
    }
}

// setters
//
// 只有数值真正发生变化时才设置对应的标记，返回是否发生了变化
impl MeshInstanceData {
    pub(crate) fn set_transform(&mut self, transform: Mat4) -> bool {
        if self.transform == transform {
            return false;
        }
        self.transform = transform;
        self.update_flags |= UpdateFlags::TRANSFORM;
        true
    }

    pub(crate) fn set_bones(&mut self, bones: &[Mat4]) -> bool {
        if self.bones.as_slice() == bones {
            return false;
        }
        self.bones = Arc::new(bones.to_vec());
        self.update_flags |= UpdateFlags::BONE;
        true
    }

    pub(crate) fn set_blendshape_weights(&mut self, weights: &[f32]) -> bool {
        if self.blendshape_weights.as_slice() == weights {
            return false;
        }
        self.blendshape_weights = Arc::new(weights.to_vec());
        self.update_flags |= UpdateFlags::BLENDSHAPE;
        true
    }

    /// 渲染管线消费了 `serial` 时的快照之后调用
    ///
    /// 如果之后又有新的变化，则保留标记
    pub(crate) fn consume_flags(&mut self, serial: u64, consumed: UpdateFlags) {
        if self.change_serial == serial {
            self.update_flags.remove(consumed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_transform_sets_flag_once() {
        let mut inst = MeshInstanceData::new(MeshHandle::default());
        let m = Mat4::from_translation(glam::Vec3::X);
        assert!(inst.set_transform(m));
        inst.update_flags = UpdateFlags::empty();
        assert!(!inst.set_transform(m));
        assert!(inst.update_flags().is_empty());
    }

    #[test]
    fn test_bone_count_change_is_a_change() {
        let mut inst = MeshInstanceData::new(MeshHandle::default());
        assert!(inst.set_bones(&[Mat4::IDENTITY]));
        assert!(!inst.set_bones(&[Mat4::IDENTITY]));
        assert!(inst.set_bones(&[Mat4::IDENTITY, Mat4::IDENTITY]));
        assert!(inst.set_bones(&[]));
        assert!(inst.update_flags().contains(UpdateFlags::BONE));
    }

    #[test]
    fn test_consume_keeps_newer_changes() {
        let mut inst = MeshInstanceData::new(MeshHandle::default());
        inst.set_transform(Mat4::from_scale(glam::Vec3::splat(2.0)));
        inst.change_serial = 5;
        inst.consume_flags(4, UpdateFlags::all());
        assert_eq!(inst.update_flags(), UpdateFlags::TRANSFORM);
        inst.consume_flags(5, UpdateFlags::all());
        assert!(inst.update_flags().is_empty());
    }
}

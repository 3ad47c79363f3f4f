use glam::{Mat4, Vec3};

use crate::handles::InstanceHandle;

bitflags::bitflags! {
    #[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Default)]
    pub struct RenderFlags: u32 {
        /// camera ray 跳过背面，逆时针为正面
        const CULL_BACK_FACES = 1 << 0;
        /// shadow ray 忽略接收阴影的 instance 自身
        const IGNORE_SELF_SHADOW = 1 << 1;
        /// 与 IGNORE_SELF_SHADOW 一起使用：距离超过阈值的自身遮挡仍然产生阴影
        const KEEP_SELF_DROP_SHADOW = 1 << 2;
        /// blendshape weight 限制在 [0, 最后一帧的 weight]
        const CLAMP_BLENDSHAPE_WEIGHTS = 1 << 3;
    }
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Camera {
    pub position: Vec3,
    pub view: Mat4,
    pub proj: Mat4,
}

impl Default for Camera {
    fn default() -> Self {
        Self {
            position: Vec3::ZERO,
            view: Mat4::IDENTITY,
            proj: Mat4::IDENTITY,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub enum Light {
    Directional {
        direction: Vec3,
    },
    Spot {
        position: Vec3,
        direction: Vec3,
        range: f32,
        /// 整个圆锥的角度，单位为度
        spot_angle: f32,
    },
    Point {
        position: Vec3,
        range: f32,
    },
    ReversePoint {
        position: Vec3,
        range: f32,
    },
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct GeometryEntry {
    pub instance: InstanceHandle,
    pub mask: u8,
}

/// 每帧重新组装的场景
#[derive(Clone, Debug)]
pub struct SceneData {
    pub camera: Camera,
    pub lights: Vec<Light>,
    pub geometries: Vec<GeometryEntry>,
    pub flags: RenderFlags,
    pub shadow_ray_offset: f32,
    pub self_shadow_threshold: f32,
}

impl Default for SceneData {
    fn default() -> Self {
        Self {
            camera: Camera::default(),
            lights: Vec::new(),
            geometries: Vec::new(),
            flags: RenderFlags::empty(),
            shadow_ray_offset: 0.0001,
            self_shadow_threshold: 0.001,
        }
    }
}

impl SceneData {
    /// 清空灯光与几何列表，相机与渲染参数保持不变
    pub(crate) fn clear(&mut self) {
        self.lights.clear();
        self.geometries.clear();
    }
}

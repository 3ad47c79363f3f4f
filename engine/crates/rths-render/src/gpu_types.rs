//! 与 shader 共享的数据布局
//!
//! 需要与 `shader/src/shadow/common.glsl` 保持一致

use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec4};

use crate::host::{Light, RenderFlags, SceneData};

pub const MAX_LIGHTS: usize = 32;

/// camera ray 的 cull mask
pub const RAY_MASK_CAMERA: u8 = 0x01;
/// shadow ray 的 cull mask
pub const RAY_MASK_SHADOW: u8 = 0x02;

/// 每个 instance 在 hit region 中占据的 record 数量
pub const RAY_TYPE_COUNT: u32 = 2;

pub const LIGHT_DIRECTIONAL: u32 = 0;
pub const LIGHT_SPOT: u32 = 1;
pub const LIGHT_POINT: u32 = 2;
pub const LIGHT_REVERSE_POINT: u32 = 3;

/// `VkGeometryInstanceFlagBitsKHR::TRIANGLE_FRONT_COUNTERCLOCKWISE`
pub const INSTANCE_FLAG_FRONT_COUNTERCLOCKWISE: u8 = 0x2;

#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Pod, Zeroable)]
pub struct GpuLight {
    pub kind: u32,
    pub range: f32,
    /// 半角的余弦
    pub spot_cos_half: f32,
    pub _pad: f32,
    pub position: Vec4,
    pub direction: Vec4,
}

impl GpuLight {
    pub fn from_light(light: &Light) -> Self {
        let (kind, position, direction, range, spot_cos_half) = match *light {
            Light::Directional { direction } => (LIGHT_DIRECTIONAL, glam::Vec3::ZERO, direction, 0.0, 0.0),
            Light::Spot {
                position,
                direction,
                range,
                spot_angle,
            } => (LIGHT_SPOT, position, direction, range, (spot_angle.to_radians() * 0.5).cos()),
            Light::Point { position, range } => (LIGHT_POINT, position, glam::Vec3::ZERO, range, 0.0),
            Light::ReversePoint { position, range } => (LIGHT_REVERSE_POINT, position, glam::Vec3::ZERO, range, 0.0),
        };
        Self {
            kind,
            range,
            spot_cos_half,
            _pad: 0.0,
            position: position.extend(1.0),
            direction: direction.normalize_or_zero().extend(0.0),
        }
    }
}

/// 每帧的场景常量，std140 布局
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Pod, Zeroable)]
pub struct GpuSceneConstants {
    pub inv_view_proj: Mat4,
    pub camera_pos: Vec4,
    pub width: u32,
    pub height: u32,
    pub flags: u32,
    pub light_count: u32,
    pub shadow_ray_offset: f32,
    pub self_shadow_threshold: f32,
    pub _pad: [f32; 2],
    pub lights: [GpuLight; MAX_LIGHTS],
}

impl GpuSceneConstants {
    pub fn new(scene: &SceneData, width: u32, height: u32) -> Self {
        let mut constants = Self::zeroed();
        constants.inv_view_proj = (scene.camera.proj * scene.camera.view).inverse();
        constants.camera_pos = scene.camera.position.extend(1.0);
        constants.width = width;
        constants.height = height;
        constants.flags = scene.flags.bits();
        constants.shadow_ray_offset = scene.shadow_ray_offset;
        constants.self_shadow_threshold = scene.self_shadow_threshold;

        let count = scene.lights.len().min(MAX_LIGHTS);
        for (dst, light) in constants.lights.iter_mut().zip(&scene.lights[..count]) {
            *dst = GpuLight::from_light(light);
        }
        constants.light_count = count as u32;
        constants
    }

    #[inline]
    pub fn render_flags(&self) -> RenderFlags {
        RenderFlags::from_bits_truncate(self.flags)
    }

    #[inline]
    pub fn lights(&self) -> &[GpuLight] {
        &self.lights[..(self.light_count as usize).min(MAX_LIGHTS)]
    }
}

/// 与 `VkAccelerationStructureInstanceKHR` 布局相同
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Pod, Zeroable)]
pub struct TlasInstance {
    /// 3x4 行主序的变换矩阵
    pub transform: [f32; 12],
    /// 低 24 位为 custom index，高 8 位为 mask
    pub custom_index_and_mask: u32,
    /// 低 24 位为 shader binding table 的 record offset，高 8 位为 flags
    pub sbt_offset_and_flags: u32,
    pub blas_address: u64,
}

impl TlasInstance {
    pub fn new(transform: &Mat4, custom_index: u32, mask: u8, sbt_offset: u32, flags: u8, blas_address: u64) -> Self {
        let rows = transform.transpose().to_cols_array();
        let mut m = [0.0f32; 12];
        m.copy_from_slice(&rows[..12]);
        Self {
            transform: m,
            custom_index_and_mask: (custom_index & 0x00ff_ffff) | ((mask as u32) << 24),
            sbt_offset_and_flags: (sbt_offset & 0x00ff_ffff) | ((flags as u32) << 24),
            blas_address,
        }
    }

    #[inline]
    pub fn custom_index(&self) -> u32 {
        self.custom_index_and_mask & 0x00ff_ffff
    }

    #[inline]
    pub fn mask(&self) -> u8 {
        (self.custom_index_and_mask >> 24) as u8
    }

    #[inline]
    pub fn sbt_offset(&self) -> u32 {
        self.sbt_offset_and_flags & 0x00ff_ffff
    }

    #[inline]
    pub fn flags(&self) -> u8 {
        (self.sbt_offset_and_flags >> 24) as u8
    }

    /// 还原为列主序的 Mat4
    pub fn matrix(&self) -> Mat4 {
        let t = &self.transform;
        Mat4::from_cols_array(&[
            t[0], t[4], t[8], 0.0, //
            t[1], t[5], t[9], 0.0, //
            t[2], t[6], t[10], 0.0, //
            t[3], t[7], t[11], 1.0,
        ])
    }
}

/// 写在 hit record 中 shader handle 之后的参数
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Pod, Zeroable)]
pub struct HitRecordArgs {
    pub instance_id: u32,
    pub mask: u32,
    pub flags: u32,
    pub material: u32,
}

#[cfg(test)]
mod tests {
    use glam::Vec3;

    use super::*;

    #[test]
    fn test_layout_sizes() {
        assert_eq!(std::mem::size_of::<TlasInstance>(), 64);
        assert_eq!(std::mem::size_of::<GpuLight>(), 48);
        assert_eq!(std::mem::size_of::<HitRecordArgs>(), 16);
        assert_eq!(std::mem::size_of::<GpuSceneConstants>(), 64 + 16 + 32 + 48 * MAX_LIGHTS);
    }

    #[test]
    fn test_instance_packing() {
        let m = Mat4::from_translation(Vec3::new(1.0, 2.0, 3.0)) * Mat4::from_scale(Vec3::splat(2.0));
        let inst = TlasInstance::new(&m, 7, 0x03, 14, INSTANCE_FLAG_FRONT_COUNTERCLOCKWISE, 0xabcd);
        assert_eq!(inst.transform[3], 1.0);
        assert_eq!(inst.transform[7], 2.0);
        assert_eq!(inst.transform[11], 3.0);
        assert_eq!(inst.custom_index(), 7);
        assert_eq!(inst.mask(), 0x03);
        assert_eq!(inst.sbt_offset(), 14);
        assert_eq!(inst.flags(), INSTANCE_FLAG_FRONT_COUNTERCLOCKWISE);
        assert_eq!(inst.matrix(), m);
    }

    #[test]
    fn test_extra_lights_dropped() {
        let mut scene = SceneData::default();
        scene.lights = vec![Light::Directional { direction: -Vec3::Y }; MAX_LIGHTS + 3];
        let constants = GpuSceneConstants::new(&scene, 4, 4);
        assert_eq!(constants.light_count as usize, MAX_LIGHTS);
        assert_eq!(constants.lights()[0].direction, Vec4::new(0.0, -1.0, 0.0, 0.0));
    }
}

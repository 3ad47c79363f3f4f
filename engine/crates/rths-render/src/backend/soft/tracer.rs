//! soft 设备上的 raygen / miss / hit 逻辑
//!
//! 与 `shader/src/shadow/*` 中的 shader 行为一致

use std::sync::Arc;

use glam::{Mat4, Vec3, Vec4Swizzles};
use rayon::prelude::*;

use crate::backend::soft::bvh::{Aabb, Bvh, Ray, Visit, intersect_triangle};
use crate::backend::{AccelId, TextureFormat};
use crate::gpu_types::{
    GpuLight, GpuSceneConstants, HitRecordArgs, INSTANCE_FLAG_FRONT_COUNTERCLOCKWISE, LIGHT_DIRECTIONAL, LIGHT_POINT,
    LIGHT_REVERSE_POINT, LIGHT_SPOT, RAY_MASK_CAMERA, RAY_MASK_SHADOW, TlasInstance,
};
use crate::host::RenderFlags;

/// 三角形 BLAS
#[derive(Debug)]
pub struct SoftBlas {
    positions: Vec<Vec3>,
    triangles: Vec<[u32; 3]>,
    bvh: Bvh,
}

impl SoftBlas {
    /// 越界的索引对应的三角形被丢弃
    pub fn build(positions: Vec<Vec3>, indices: &[u32]) -> Self {
        let triangles: Vec<[u32; 3]> = indices
            .chunks_exact(3)
            .map(|t| [t[0], t[1], t[2]])
            .filter(|t| t.iter().all(|i| (*i as usize) < positions.len()))
            .collect();
        let bounds: Vec<Aabb> = triangles
            .iter()
            .map(|t| Aabb::from_points(&[positions[t[0] as usize], positions[t[1] as usize], positions[t[2] as usize]]))
            .collect();
        let bvh = Bvh::build(&bounds);
        Self {
            positions,
            triangles,
            bvh,
        }
    }

    #[inline]
    pub fn bounds(&self) -> Aabb {
        self.bvh.bounds()
    }

    #[inline]
    pub fn triangle_count(&self) -> usize {
        self.triangles.len()
    }

    /// 对象空间中的相交，`visit` 收到 t 与是否为正面
    fn traverse(&self, ray: &Ray, mut visit: impl FnMut(f32, bool, f32) -> Visit) {
        self.bvh.traverse(ray, |i, t_max| {
            let t = self.triangles[i as usize];
            let [v0, v1, v2] = t.map(|i| self.positions[i as usize]);
            match intersect_triangle(ray, v0, v1, v2, t_max) {
                Some(hit) => visit(hit.t, hit.front_face, t_max),
                None => Visit::Miss,
            }
        });
    }
}

#[derive(Debug)]
pub struct SoftTlasInstance {
    pub instance: TlasInstance,
    pub inverse: Mat4,
    pub blas_id: AccelId,
    pub blas: Arc<SoftBlas>,
}

#[derive(Debug)]
pub struct SoftTlas {
    instances: Vec<SoftTlasInstance>,
    bvh: Bvh,
}

impl SoftTlas {
    pub fn build(instances: Vec<SoftTlasInstance>) -> Self {
        let bounds: Vec<Aabb> =
            instances.iter().map(|i| i.blas.bounds().transformed(&i.instance.matrix())).collect();
        let bvh = Bvh::build(&bounds);
        Self { instances, bvh }
    }

    #[inline]
    pub fn instances(&self) -> &[SoftTlasInstance] {
        &self.instances
    }

    /// 遍历所有 mask 匹配的 instance 中的三角形
    ///
    /// `visit` 收到 instance 下标、t、是否为正面以及当前的 t_max
    fn traverse(&self, ray: &Ray, cull_mask: u8, mut visit: impl FnMut(usize, f32, bool, f32) -> Visit) {
        let mut terminated = false;
        self.bvh.traverse(ray, |i, t_max| {
            let inst = &self.instances[i as usize];
            if inst.instance.mask() & cull_mask == 0 {
                return Visit::Miss;
            }
            let local = Ray { t_max, ..ray.transformed(&inst.inverse) };
            let ccw = inst.instance.flags() & INSTANCE_FLAG_FRONT_COUNTERCLOCKWISE != 0;
            let mut best: Option<f32> = None;
            inst.blas.traverse(&local, |t, front, local_t_max| {
                // 没有 FRONT_COUNTERCLOCKWISE 标记时，顺时针为正面
                let front = if ccw { front } else { !front };
                match visit(i as usize, t, front, local_t_max) {
                    Visit::Hit(t) => {
                        best = Some(best.map_or(t, |b| b.min(t)));
                        Visit::Hit(t)
                    }
                    Visit::Terminate => {
                        terminated = true;
                        Visit::Terminate
                    }
                    Visit::Miss => Visit::Miss,
                }
            });
            if terminated {
                Visit::Terminate
            } else {
                best.map_or(Visit::Miss, Visit::Hit)
            }
        });
    }
}

/// 一次 trace rays 所需的全部输入
pub struct TraceInputs<'a> {
    pub constants: &'a GpuSceneConstants,
    pub tlas: &'a SoftTlas,
    /// 按 TLAS 中 instance 的顺序，camera ray 对应的 hit record
    pub hit_args: &'a [HitRecordArgs],
}

const SHADOW_T_MAX: f32 = 1.0e30;

impl TraceInputs<'_> {
    /// 为整张图计算阴影，结果按 `format` 编码，紧密排列
    pub fn run(&self, width: u32, height: u32, format: TextureFormat, dst: &mut [u8]) {
        let _span = tracy_client::span!("SoftDevice::trace_rays");
        let bpp = format.bytes_per_pixel() as usize;
        let row_bytes = width as usize * bpp;
        dst.par_chunks_mut(row_bytes).take(height as usize).enumerate().for_each(|(y, row)| {
            for x in 0..width as usize {
                let value = self.raygen(x as u32, y as u32, width, height);
                encode_pixel(format, value, &mut row[x * bpp..(x + 1) * bpp]);
            }
        });
    }

    fn raygen(&self, x: u32, y: u32, width: u32, height: u32) -> f32 {
        let c = self.constants;
        let ndc_x = (x as f32 + 0.5) / width as f32 * 2.0 - 1.0;
        let ndc_y = 1.0 - (y as f32 + 0.5) / height as f32 * 2.0;
        let target = c.inv_view_proj * glam::Vec4::new(ndc_x, ndc_y, 0.5, 1.0);
        let target = target.xyz() / target.w;
        let origin = c.camera_pos.xyz();
        let ray = Ray {
            origin,
            direction: (target - origin).normalize_or_zero(),
            t_min: 0.0,
            t_max: SHADOW_T_MAX,
        };

        let flags = c.render_flags();
        let cull_back = flags.contains(RenderFlags::CULL_BACK_FACES);
        let mut closest: Option<(usize, f32)> = None;
        self.tlas.traverse(&ray, RAY_MASK_CAMERA, |inst, t, front, t_max| {
            if (cull_back && !front) || t >= t_max {
                return Visit::Miss;
            }
            closest = Some((inst, t));
            Visit::Hit(t)
        });

        // camera miss
        let Some((inst, t)) = closest else {
            return 0.0;
        };

        // closest hit
        let receiver = self.hit_args.get(inst).map(|a| a.instance_id).unwrap_or(u32::MAX);
        let position = ray.at(t);
        let lit = c.lights().iter().any(|light| self.light_visible(light, position, receiver, flags));
        if lit { 1.0 } else { 0.0 }
    }

    fn light_visible(&self, light: &GpuLight, p: Vec3, receiver: u32, flags: RenderFlags) -> bool {
        let offset = self.constants.shadow_ray_offset;
        let (direction, t_max) = match light.kind {
            LIGHT_DIRECTIONAL => (-light.direction.xyz(), SHADOW_T_MAX),
            LIGHT_SPOT | LIGHT_POINT => {
                let to_light = light.position.xyz() - p;
                let distance = to_light.length();
                if distance > light.range {
                    return false;
                }
                if light.kind == LIGHT_SPOT && (-to_light / distance).dot(light.direction.xyz()) < light.spot_cos_half {
                    return false;
                }
                (to_light / distance, distance)
            }
            LIGHT_REVERSE_POINT => {
                let from_light = p - light.position.xyz();
                let distance = from_light.length();
                if distance > light.range {
                    return false;
                }
                (from_light / distance, light.range - distance)
            }
            _ => return false,
        };
        if !direction.is_finite() {
            return false;
        }
        let ray = Ray {
            origin: p,
            direction,
            t_min: offset,
            t_max,
        };
        !self.occluded(&ray, receiver, flags)
    }

    /// shadow ray，对应 shadow any-hit 与 shadow miss
    fn occluded(&self, ray: &Ray, receiver: u32, flags: RenderFlags) -> bool {
        let ignore_self = flags.contains(RenderFlags::IGNORE_SELF_SHADOW);
        let keep_drop = flags.contains(RenderFlags::KEEP_SELF_DROP_SHADOW);
        let threshold = self.constants.self_shadow_threshold;
        let mut hit = false;
        self.tlas.traverse(ray, RAY_MASK_SHADOW, |inst, t, _front, _t_max| {
            let instance_id = self.hit_args.get(inst).map(|a| a.instance_id).unwrap_or(u32::MAX);
            if ignore_self && instance_id == receiver && !(keep_drop && t > threshold) {
                return Visit::Miss;
            }
            hit = true;
            Visit::Terminate
        });
        hit
    }
}

/// 把 [0, 1] 的可见度编码成一个像素
pub fn encode_pixel(format: TextureFormat, value: f32, dst: &mut [u8]) {
    match format {
        TextureFormat::R8Unorm => dst[0] = (value.clamp(0.0, 1.0) * 255.0).round() as u8,
        TextureFormat::R16Float => dst[..2].copy_from_slice(&half::f16::from_f32(value).to_le_bytes()),
        TextureFormat::R32Float => dst[..4].copy_from_slice(&value.to_le_bytes()),
    }
}

#[cfg(test)]
mod tests {
    use glam::Vec4;

    use super::*;
    use crate::host::{Light, SceneData};

    fn quad(z: f32, half: f32) -> Arc<SoftBlas> {
        let positions = vec![
            Vec3::new(-half, -half, z),
            Vec3::new(half, -half, z),
            Vec3::new(half, half, z),
            Vec3::new(-half, half, z),
        ];
        Arc::new(SoftBlas::build(positions, &[0, 1, 2, 0, 2, 3]))
    }

    fn instance(blas: Arc<SoftBlas>, index: u32, mask: u8) -> SoftTlasInstance {
        SoftTlasInstance {
            instance: TlasInstance::new(&Mat4::IDENTITY, index, mask, index * 2, INSTANCE_FLAG_FRONT_COUNTERCLOCKWISE, 0),
            inverse: Mat4::IDENTITY,
            blas_id: AccelId::default(),
            blas,
        }
    }

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

    fn constants(lights: Vec<Light>, flags: RenderFlags) -> GpuSceneConstants {
        let mut scene = SceneData::default();
        scene.camera.position = Vec3::new(0.0, 0.0, 5.0);
        scene.camera.view = Mat4::look_at_rh(scene.camera.position, Vec3::ZERO, Vec3::Y);
        scene.camera.proj = Mat4::perspective_rh(60f32.to_radians(), 1.0, 0.1, 100.0);
        scene.lights = lights;
        scene.flags = flags;
        GpuSceneConstants::new(&scene, 8, 8)
    }

    #[test]
    fn test_occluder_shadows_receiver() {
        let receiver = quad(0.0, 10.0);
        let occluder = quad(1.0, 0.5);
        let tlas = SoftTlas::build(vec![instance(receiver, 0, 0xff), instance(occluder, 1, 0x02)]);
        let hit_args = args(2);
        let c = constants(vec![Light::Directional { direction: -Vec3::Z }], RenderFlags::empty());
        let inputs = TraceInputs {
            constants: &c,
            tlas: &tlas,
            hit_args: &hit_args,
        };

        let mut image = vec![0u8; 64];
        inputs.run(8, 8, TextureFormat::R8Unorm, &mut image);
        // 遮挡物只对 shadow ray 可见，中心被遮挡，四角被照亮
        assert_eq!(image[3 * 8 + 3], 0);
        assert_eq!(image[0], 255);
        assert_eq!(image[63], 255);
    }

    #[test]
    fn test_back_face_culling_and_range() {
        let tlas = SoftTlas::build(vec![instance(quad(0.0, 10.0), 0, 0xff)]);
        let hit_args = args(1);

        // 光源在平面后方，点光源的范围足够大
        let c = constants(
            vec![Light::Point {
                position: Vec3::new(0.0, 0.0, -1.0),
                range: 100.0,
            }],
            RenderFlags::IGNORE_SELF_SHADOW,
        );
        let inputs = TraceInputs {
            constants: &c,
            tlas: &tlas,
            hit_args: &hit_args,
        };
        let mut image = vec![0u8; 64];
        inputs.run(8, 8, TextureFormat::R8Unorm, &mut image);
        assert!(image.iter().all(|p| *p == 255));

        // 相机从背面看过去，剔除背面之后什么都看不到
        let mut c = constants(vec![Light::Directional { direction: Vec3::Z }], RenderFlags::CULL_BACK_FACES);
        c.camera_pos = Vec4::new(0.0, 0.0, -5.0, 1.0);
        c.inv_view_proj = (Mat4::perspective_rh(60f32.to_radians(), 1.0, 0.1, 100.0)
            * Mat4::look_at_rh(Vec3::new(0.0, 0.0, -5.0), Vec3::ZERO, Vec3::Y))
        .inverse();
        let inputs = TraceInputs {
            constants: &c,
            tlas: &tlas,
            hit_args: &hit_args,
        };
        inputs.run(8, 8, TextureFormat::R8Unorm, &mut image);
        assert!(image.iter().all(|p| *p == 0));
    }

    #[test]
    fn test_encode_visible_pixel() {
        let mut px = [0u8; 4];
        encode_pixel(TextureFormat::R8Unorm, 1.0, &mut px);
        assert_eq!(px[0], 255);
        encode_pixel(TextureFormat::R16Float, 1.0, &mut px);
        assert_eq!(&px[..2], &half::f16::ONE.to_le_bytes());
        encode_pixel(TextureFormat::R32Float, 1.0, &mut px);
        assert_eq!(px, 1.0f32.to_le_bytes());
    }
}

//! 集成测试共用的场景搭建
//!
//! 所有测试都跑在 [`SoftDevice`] 上，测试持有设备的 clone，用于注入故障与检查统计。

#![allow(dead_code)]

use glam::{Mat4, Vec3};
use rths_render::backend::soft::SoftDevice;
use rths_render::host::{IndexFormat, MeshLayout, RenderTargetFormat, World};
use rths_render::{EngineConfig, InstanceHandle, MeshHandle, RenderTargetHandle, RendererHandle, RthsContext};

/// 8x8 的输出中，中心像素落在三角形上
pub const CENTER: (u32, u32) = (4, 4);
/// 落在三角形上、但在遮挡板之外的像素
pub const OFF_CENTER: (u32, u32) = (2, 5);
/// 没有任何几何的角落
pub const CORNER: (u32, u32) = (0, 0);

pub struct TestScene {
    pub cx: RthsContext,
    pub soft: SoftDevice,
    pub world: World,
}

impl TestScene {
    pub fn new() -> Self {
        Self::with_config(EngineConfig::soft())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        rths_crate_tools::init_log::init_log();
        let soft = SoftDevice::new(config.soft_row_pitch_alignment);
        let cx = RthsContext::with_device(config, Box::new(soft.clone())).unwrap();
        let world = cx.world().clone();
        Self { cx, soft, world }
    }

    /// 相机在 +Z 方向看向原点，方向光沿 -Z 照射
    pub fn shadow_renderer(
        &mut self,
        width: u32,
        height: u32,
        format: RenderTargetFormat,
        geometries: &[(InstanceHandle, u8)],
    ) -> (RendererHandle, RenderTargetHandle) {
        let target = self.world.create_render_target();
        self.world.setup_render_target(target, width, height, format);

        let renderer = self.cx.create_renderer();
        self.cx.set_render_target(renderer, Some(target));
        self.fill_scene(renderer, width as f32 / height as f32, geometries);
        (renderer, target)
    }

    pub fn fill_scene(&mut self, renderer: RendererHandle, aspect: f32, geometries: &[(InstanceHandle, u8)]) {
        let position = Vec3::new(0.0, 0.0, 3.0);
        self.cx.begin_scene(renderer);
        self.cx.set_camera(
            renderer,
            position,
            Mat4::look_at_rh(position, Vec3::ZERO, Vec3::Y),
            Mat4::perspective_rh(60f32.to_radians(), aspect, 0.1, 100.0),
        );
        self.cx.add_directional_light(renderer, -Vec3::Z);
        for (instance, mask) in geometries {
            self.cx.add_geometry(renderer, *instance, *mask);
        }
        self.cx.end_scene(renderer);
    }

    /// 渲染一帧并回读
    pub fn render_frame(&mut self, renderer: RendererHandle) -> Vec<u8> {
        self.cx.render(renderer).unwrap();
        self.cx.finish(renderer).unwrap();
        let mut bytes = Vec::new();
        assert!(self.cx.readback_render_target(renderer, &mut bytes).unwrap());
        bytes
    }
}

pub fn mesh_from_positions(world: &World, positions: &[Vec3], indices: &[u16]) -> MeshHandle {
    let mesh = world.create_mesh();
    let layout = MeshLayout {
        vertex_count: positions.len() as u32,
        index_format: IndexFormat::U16,
        index_count: indices.len() as u32,
        ..Default::default()
    };
    world
        .set_cpu_buffers(mesh, bytemuck::cast_slice(positions), bytemuck::cast_slice(indices), layout)
        .unwrap();
    mesh
}

/// z = 0 平面上覆盖画面中心的三角形
pub fn triangle_mesh(world: &World) -> MeshHandle {
    mesh_from_positions(
        world,
        &[Vec3::new(-1.0, -1.0, 0.0), Vec3::new(1.0, -1.0, 0.0), Vec3::new(0.0, 1.0, 0.0)],
        &[0, 1, 2],
    )
}

/// 平行于 XY 平面的正方形
pub fn quad_mesh(world: &World, z: f32, half: f32) -> MeshHandle {
    mesh_from_positions(
        world,
        &[
            Vec3::new(-half, -half, z),
            Vec3::new(half, -half, z),
            Vec3::new(half, half, z),
            Vec3::new(-half, half, z),
        ],
        &[0, 1, 2, 0, 2, 3],
    )
}

#[inline]
pub fn pixel(bytes: &[u8], width: u32, (x, y): (u32, u32)) -> u8 {
    bytes[(y * width + x) as usize]
}

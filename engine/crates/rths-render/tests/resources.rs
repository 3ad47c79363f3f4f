//! GPU 资源的增长、延迟销毁与 barrier

mod common;

use common::{CENTER, TestScene, pixel, quad_mesh, triangle_mesh};
use glam::{Mat4, Vec3};
use itertools::Itertools;
use rths_render::backend::TextureFormat;
use rths_render::host::{IndexFormat, MeshLayout, RenderTargetFormat};
use rths_render::{EngineConfig, InstanceHandle};

fn spread_instances(s: &TestScene, count: usize) -> Vec<InstanceHandle> {
    let mesh = quad_mesh(&s.world, 0.0, 0.1);
    (0..count)
        .map(|i| {
            let inst = s.world.create_instance(mesh).unwrap();
            s.world.set_transform(inst, Mat4::from_translation(Vec3::X * (i as f32 * 0.3 - 1.0)));
            inst
        })
        .collect_vec()
}

#[test]
fn test_shader_table_grows_and_never_shrinks() {
    let mut config = EngineConfig::soft();
    config.shader_table_capacity = 1;
    let mut s = TestScene::with_config(config);
    let instances = spread_instances(&s, 5);

    let (renderer, _) = s.shadow_renderer(8, 8, RenderTargetFormat::Ru8, &[(instances[0], 0xff)]);
    s.render_frame(renderer);
    assert_eq!(s.cx.renderer(renderer).unwrap().shader_table_capacity(), 1);

    let all = instances.iter().map(|i| (*i, 0xff)).collect_vec();
    s.fill_scene(renderer, 1.0, &all);
    s.render_frame(renderer);
    assert_eq!(s.cx.renderer(renderer).unwrap().shader_table_capacity(), 8);

    s.fill_scene(renderer, 1.0, &all[..1]);
    s.render_frame(renderer);
    assert_eq!(s.cx.renderer(renderer).unwrap().shader_table_capacity(), 8);
    assert!(s.soft.violations().is_empty());
}

#[test]
fn test_steady_frames_issue_no_redundant_barriers() {
    let mut s = TestScene::new();
    let inst = s.world.create_instance(triangle_mesh(&s.world)).unwrap();
    let (renderer, _) = s.shadow_renderer(8, 8, RenderTargetFormat::Ru8, &[(inst, 0xff)]);

    s.render_frame(renderer);
    s.render_frame(renderer);
    let before = s.soft.stats();
    s.render_frame(renderer);
    let after = s.soft.stats();

    // 稳定之后每帧的工作量不变
    let per_frame = after.transitions - before.transitions;
    s.render_frame(renderer);
    assert_eq!(s.soft.stats().transitions - after.transitions, per_frame);
    assert_eq!(after.traces - before.traces, 1);
    // soft 设备会把 before == after 的 transition 记为 violation
    assert!(s.soft.violations().is_empty());
}

#[test]
fn test_purge_waits_for_fence() {
    let mut s = TestScene::new();
    let mesh = triangle_mesh(&s.world);
    let inst = s.world.create_instance(mesh).unwrap();
    let (renderer, _) = s.shadow_renderer(8, 8, RenderTargetFormat::Ru8, &[(inst, 0xff)]);
    s.render_frame(renderer);

    s.soft.hold_completion(true);
    s.cx.render(renderer).unwrap();
    s.world.release_instance(inst);
    s.world.release_mesh(mesh);
    s.cx.on_frame_begin().unwrap();
    s.cx.on_frame_end().unwrap();
    // 进行中的帧仍在使用 mesh 的 BLAS
    assert!(s.cx.pending_purge() > 0);
    let live = s.soft.stats().live_accels;

    s.cx.finish(renderer).unwrap();
    s.soft.hold_completion(false);
    s.cx.on_frame_end().unwrap();
    assert_eq!(s.cx.pending_purge(), 0);
    assert!(s.soft.stats().live_accels < live);
    assert!(s.soft.violations().is_empty());
}

#[test]
fn test_released_renderer_frees_gpu_resources() {
    let mut s = TestScene::new();
    let inst = s.world.create_instance(triangle_mesh(&s.world)).unwrap();
    let (renderer, _) = s.shadow_renderer(8, 8, RenderTargetFormat::Ru8, &[(inst, 0xff)]);
    s.render_frame(renderer);
    let live = s.soft.stats();

    s.cx.release_renderer(renderer);
    assert!(s.cx.renderer(renderer).is_none());
    s.cx.on_frame_end().unwrap();

    let after = s.soft.stats();
    assert!(after.live_textures < live.live_textures);
    assert!(after.live_accels < live.live_accels);
    // mesh 的 BLAS 属于 record cache，不随 renderer 销毁
    assert!(after.live_accels > 0);
    assert!(s.soft.violations().is_empty());
}

#[test]
fn test_dropping_context_releases_everything() {
    let mut s = TestScene::new();
    let inst = s.world.create_instance(triangle_mesh(&s.world)).unwrap();
    let (renderer, _) = s.shadow_renderer(8, 8, RenderTargetFormat::Ru8, &[(inst, 0xff)]);
    s.cx.render(renderer).unwrap();

    let soft = s.soft.clone();
    drop(s);
    let stats = soft.stats();
    assert_eq!(stats.live_buffers, 0);
    assert_eq!(stats.live_textures, 0);
    assert_eq!(stats.live_accels, 0);
    assert!(soft.violations().is_empty());
}

#[test]
fn test_imports_are_evicted_when_host_stops_using_them() {
    let mut s = TestScene::new();
    let positions = [Vec3::new(-1.0, -1.0, 0.0), Vec3::new(1.0, -1.0, 0.0), Vec3::new(0.0, 1.0, 0.0)];
    let indices = [0u32, 1, 2];
    let layout = MeshLayout {
        vertex_count: 3,
        index_format: IndexFormat::U32,
        index_count: 3,
        ..Default::default()
    };
    let vertices = s.soft.register_native_buffer(bytemuck::cast_slice(&positions));
    let index_buffer = s.soft.register_native_buffer(bytemuck::cast_slice(&indices));
    let mesh = s.world.create_mesh();
    s.world.set_gpu_buffers(mesh, vertices, index_buffer, layout).unwrap();
    let inst = s.world.create_instance(mesh).unwrap();

    let (renderer, target) = s.shadow_renderer(8, 8, RenderTargetFormat::Ru8, &[(inst, 0xff)]);
    let texture = s.soft.register_native_texture(8, 8, TextureFormat::R8Unorm);
    s.world.set_gpu_texture(target, Some(texture));
    assert_eq!(pixel(&s.render_frame(renderer), 8, CENTER), 255);
    assert_eq!(s.cx.imported_resources(), 3);

    // mesh 改用 CPU 数据，宿主纹理解除绑定
    s.world
        .set_cpu_buffers(mesh, bytemuck::cast_slice(&positions), bytemuck::cast_slice(&indices), layout)
        .unwrap();
    s.world.set_gpu_texture(target, None);
    s.cx.on_frame_begin().unwrap();
    s.cx.on_frame_end().unwrap();
    assert_eq!(s.cx.imported_resources(), 0);
    assert_eq!(s.cx.pending_purge(), 0);

    assert_eq!(pixel(&s.render_frame(renderer), 8, CENTER), 255);
    assert!(s.soft.violations().is_empty());
}

#[test]
fn test_gpu_mesh_layout_is_checked_at_the_call() {
    let s = TestScene::new();
    let small = s.soft.register_native_buffer(&[0u8; 12]);
    let layout = MeshLayout {
        vertex_count: 3,
        index_count: 3,
        ..Default::default()
    };
    let mesh = s.world.create_mesh();
    assert!(s.world.set_gpu_buffers(mesh, small, small, layout).is_err());
    assert_eq!(s.world.lock().mesh(mesh).unwrap().geometry_version(), 0);
}

//! 端到端的阴影渲染：场景组装、trace、回读

mod common;

use common::{CENTER, CORNER, OFF_CENTER, TestScene, pixel, quad_mesh, triangle_mesh};
use glam::{Mat4, Vec3};
use rstest::rstest;
use rths_render::FrameOutcome;
use rths_render::backend::TextureFormat;
use rths_render::gpu_types::{RAY_MASK_CAMERA, RAY_MASK_SHADOW};
use rths_render::host::RenderTargetFormat;

#[test]
fn test_lit_triangle_has_hard_edges() {
    let mut s = TestScene::new();
    let mesh = triangle_mesh(&s.world);
    let inst = s.world.create_instance(mesh).unwrap();
    let (renderer, _) = s.shadow_renderer(8, 8, RenderTargetFormat::Ru8, &[(inst, 0xff)]);

    let bytes = s.render_frame(renderer);
    assert_eq!(bytes.len(), 64);
    assert_eq!(pixel(&bytes, 8, CENTER), 255);
    assert_eq!(pixel(&bytes, 8, OFF_CENTER), 255);
    assert_eq!(pixel(&bytes, 8, CORNER), 0);
    // 硬阴影只有两种取值
    assert!(bytes.iter().all(|b| *b == 0 || *b == 255));
    assert_eq!(s.cx.outcome(renderer), Some(FrameOutcome::Rendered));
    assert!(s.soft.violations().is_empty());
}

#[test]
fn test_shadow_only_occluder_darkens_receiver() {
    let mut s = TestScene::new();
    let receiver = s.world.create_instance(triangle_mesh(&s.world)).unwrap();
    // 遮挡板位于三角形与光源之间，对 camera ray 不可见
    let occluder = s.world.create_instance(quad_mesh(&s.world, 1.0, 0.5)).unwrap();
    let (renderer, _) = s.shadow_renderer(
        8,
        8,
        RenderTargetFormat::Ru8,
        &[(receiver, RAY_MASK_CAMERA | RAY_MASK_SHADOW), (occluder, RAY_MASK_SHADOW)],
    );

    let bytes = s.render_frame(renderer);
    assert_eq!(pixel(&bytes, 8, CENTER), 0);
    assert_eq!(pixel(&bytes, 8, OFF_CENTER), 255);
    assert_eq!(pixel(&bytes, 8, CORNER), 0);

    // 把遮挡板移出光路之后中心重新被照亮
    s.world.set_transform(occluder, Mat4::from_translation(Vec3::X * 10.0));
    let bytes = s.render_frame(renderer);
    assert_eq!(pixel(&bytes, 8, CENTER), 255);
    assert!(s.soft.violations().is_empty());
}

#[test]
fn test_repeated_frames_are_bit_identical() {
    let mut s = TestScene::new();
    let receiver = s.world.create_instance(triangle_mesh(&s.world)).unwrap();
    let occluder = s.world.create_instance(quad_mesh(&s.world, 1.0, 0.5)).unwrap();
    let (renderer, _) = s.shadow_renderer(
        16,
        16,
        RenderTargetFormat::Ru8,
        &[(receiver, 0xff), (occluder, RAY_MASK_SHADOW)],
    );

    let first = s.render_frame(renderer);
    for _ in 0..3 {
        assert_eq!(s.render_frame(renderer), first);
    }
}

#[rstest]
#[case::ru8(RenderTargetFormat::Ru8)]
#[case::rf16(RenderTargetFormat::Rf16)]
#[case::rf32(RenderTargetFormat::Rf32)]
fn test_readback_matches_target_format(#[case] format: RenderTargetFormat) {
    let mut s = TestScene::new();
    let inst = s.world.create_instance(triangle_mesh(&s.world)).unwrap();
    let (renderer, _) = s.shadow_renderer(8, 8, format, &[(inst, 0xff)]);

    let bytes = s.render_frame(renderer);
    let bpp = format.bytes_per_pixel();
    assert_eq!(bytes.len(), 8 * 8 * bpp);

    let at = |(x, y): (u32, u32)| -> f32 {
        let start = (y * 8 + x) as usize * bpp;
        let texel = &bytes[start..start + bpp];
        match format {
            RenderTargetFormat::Ru8 => texel[0] as f32 / 255.0,
            RenderTargetFormat::Rf16 => half::f16::from_le_bytes([texel[0], texel[1]]).to_f32(),
            RenderTargetFormat::Rf32 => f32::from_le_bytes([texel[0], texel[1], texel[2], texel[3]]),
        }
    };
    assert_eq!(at(CENTER), 1.0);
    assert_eq!(at(CORNER), 0.0);
}

#[test]
fn test_readback_strips_row_padding() {
    // 宽 5 字节的行按 256 对齐拷贝，回读结果仍然是紧密排列的
    let mut s = TestScene::new();
    let inst = s.world.create_instance(triangle_mesh(&s.world)).unwrap();
    let (renderer, _) = s.shadow_renderer(5, 3, RenderTargetFormat::Ru8, &[(inst, 0xff)]);

    let bytes = s.render_frame(renderer);
    assert_eq!(bytes.len(), 15);
    assert_eq!(pixel(&bytes, 5, (2, 1)), 255);
    assert_eq!(pixel(&bytes, 5, (0, 0)), 0);
    assert!(s.soft.violations().is_empty());
}

#[test]
fn test_host_texture_receives_output() {
    let mut s = TestScene::new();
    let inst = s.world.create_instance(triangle_mesh(&s.world)).unwrap();
    let (renderer, target) = s.shadow_renderer(8, 8, RenderTargetFormat::Ru8, &[(inst, 0xff)]);
    let native = s.soft.register_native_texture(8, 8, TextureFormat::R8Unorm);
    s.world.set_gpu_texture(target, Some(native));

    let bytes = s.render_frame(renderer);
    assert_eq!(s.soft.native_texture_data(native), Some(bytes));
    assert!(s.cx.render_texture(renderer).is_some());
    assert!(s.soft.violations().is_empty());
}

#[test]
fn test_skinned_mesh_follows_bones() {
    let mut s = TestScene::new();
    let mesh = triangle_mesh(&s.world);
    s.world.set_skin_bindposes(mesh, &[Mat4::IDENTITY]);
    s.world.set_skin_weights4(
        mesh,
        &[rths_render::host::BoneWeight4 {
            weight: [1.0, 0.0, 0.0, 0.0],
            index: [0; 4],
        }; 3],
    );
    let inst = s.world.create_instance(mesh).unwrap();
    s.world.set_bones(inst, &[Mat4::from_translation(Vec3::X * 5.0)]);
    let (renderer, _) = s.shadow_renderer(8, 8, RenderTargetFormat::Ru8, &[(inst, 0xff)]);

    // 骨骼把三角形移出了画面
    let bytes = s.render_frame(renderer);
    assert_eq!(pixel(&bytes, 8, CENTER), 0);

    s.world.set_bones(inst, &[Mat4::IDENTITY]);
    let bytes = s.render_frame(renderer);
    assert_eq!(pixel(&bytes, 8, CENTER), 255);
    assert!(s.soft.violations().is_empty());
}

#[test]
fn test_blendshape_moves_geometry() {
    let mut s = TestScene::new();
    let mesh = triangle_mesh(&s.world);
    s.world.add_blendshape_frame(mesh, 0, &[Vec3::X * 5.0; 3], 100.0).unwrap();
    let inst = s.world.create_instance(mesh).unwrap();
    let (renderer, _) = s.shadow_renderer(8, 8, RenderTargetFormat::Ru8, &[(inst, 0xff)]);

    let bytes = s.render_frame(renderer);
    assert_eq!(pixel(&bytes, 8, CENTER), 255);

    s.world.set_blendshape_weights(inst, &[100.0]);
    let bytes = s.render_frame(renderer);
    assert_eq!(pixel(&bytes, 8, CENTER), 0);
}

#[test]
fn test_lights_beyond_limit_are_dropped() {
    let mut config = rths_render::EngineConfig::soft();
    config.max_lights = 2;
    let mut s = TestScene::with_config(config);
    let renderer = s.cx.create_renderer();

    s.cx.begin_scene(renderer);
    for _ in 0..4 {
        s.cx.add_point_light(renderer, Vec3::Y, 10.0);
    }
    s.cx.end_scene(renderer);
    assert_eq!(s.cx.renderer(renderer).unwrap().scene().lights.len(), 2);
}

//! 宿主数据的变更标记、生命周期与校验

mod common;

use common::{TestScene, pixel, quad_mesh, triangle_mesh};
use glam::{Mat4, Vec3};
use rths_render::RthsError;
use rths_render::host::{BoneWeight4, RenderTargetFormat, UpdateFlags};

#[test]
fn test_same_transform_marks_change_once() {
    let s = TestScene::new();
    let inst = s.world.create_instance(triangle_mesh(&s.world)).unwrap();
    let m = Mat4::from_translation(Vec3::new(0.0, 1.0, 0.0));

    s.world.set_transform(inst, m);
    let serial = {
        let world = s.world.lock();
        let data = world.instance(inst).unwrap();
        assert!(data.update_flags().contains(UpdateFlags::TRANSFORM));
        data.change_serial()
    };

    s.world.set_transform(inst, m);
    assert_eq!(s.world.lock().instance(inst).unwrap().change_serial(), serial);
}

#[test]
fn test_change_during_flight_survives_commit() {
    let mut s = TestScene::new();
    let inst = s.world.create_instance(triangle_mesh(&s.world)).unwrap();
    let (renderer, _) = s.shadow_renderer(8, 8, RenderTargetFormat::Ru8, &[(inst, 0xff)]);

    s.world.set_transform(inst, Mat4::from_translation(Vec3::X * 0.1));
    s.cx.render(renderer).unwrap();
    assert!(s.world.lock().instance(inst).unwrap().update_flags().is_empty());

    // 帧还没有 finish 时的修改属于下一帧
    s.world.set_transform(inst, Mat4::from_translation(Vec3::X * 0.2));
    s.cx.finish(renderer).unwrap();
    assert!(s.world.lock().instance(inst).unwrap().update_flags().contains(UpdateFlags::TRANSFORM));
}

#[test]
fn test_skin_weights4_are_compacted() {
    let s = TestScene::new();
    let mesh = triangle_mesh(&s.world);
    s.world.set_skin_weights4(
        mesh,
        &[
            BoneWeight4 {
                weight: [0.6, 0.4, 0.0, 0.3],
                index: [3, 1, 7, 2],
            },
            BoneWeight4 {
                weight: [1.0, 0.0, 0.0, 0.0],
                index: [5, 0, 0, 0],
            },
            BoneWeight4 {
                weight: [0.25; 4],
                index: [0, 1, 2, 3],
            },
        ],
    );

    let world = s.world.lock();
    let skin = world.mesh(mesh).unwrap().skin();
    // 第一个非正的 weight 之后的影响被丢弃
    assert_eq!(skin.bone_counts, vec![2, 1, 4]);
    assert_eq!(skin.weights.len(), 7);
    assert_eq!(skin.weights[1].index, 1);
    assert_eq!(skin.weights[2].index, 5);
}

#[test]
fn test_blendshape_index_gap_is_rejected() {
    let s = TestScene::new();
    let mesh = triangle_mesh(&s.world);
    let delta = [Vec3::Y; 3];

    let gap = s.world.add_blendshape_frame(mesh, 1, &delta, 100.0);
    assert!(matches!(gap, Err(RthsError::ContractViolation(_))));
    s.world.add_blendshape_frame(mesh, 0, &delta, 100.0).unwrap();
    s.world.add_blendshape_frame(mesh, 1, &delta, 100.0).unwrap();
    s.world.add_blendshape_frame(mesh, 1, &delta, 50.0).unwrap();

    let world = s.world.lock();
    let blendshapes = world.mesh(mesh).unwrap().blendshapes();
    assert_eq!(blendshapes.len(), 2);
    assert_eq!(blendshapes[1].frames.len(), 2);
}

#[test]
fn test_short_blendshape_delta_is_rejected() {
    let s = TestScene::new();
    let mesh = triangle_mesh(&s.world);
    let short = s.world.add_blendshape_frame(mesh, 0, &[Vec3::Y; 2], 100.0);
    assert!(matches!(short, Err(RthsError::ContractViolation(_))));
    assert!(s.world.lock().mesh(mesh).unwrap().blendshapes().is_empty());
}

#[test]
fn test_mesh_released_before_its_instance() {
    let mut s = TestScene::new();
    let mesh = triangle_mesh(&s.world);
    let inst = s.world.create_instance(mesh).unwrap();
    let (renderer, _) = s.shadow_renderer(8, 8, RenderTargetFormat::Ru8, &[(inst, 0xff)]);
    s.render_frame(renderer);

    // instance 还活着，mesh 的数据保留到最后一个 instance release
    s.world.release_mesh(mesh);
    assert!(s.world.create_instance(mesh).is_none());
    s.cx.on_frame_begin().unwrap();
    let bytes = s.render_frame(renderer);
    assert_eq!(pixel(&bytes, 8, common::CENTER), 255);
    s.cx.on_frame_end().unwrap();

    s.world.release_instance(inst);
    assert_eq!(s.world.lock().mesh_count(), 0);
    s.cx.on_frame_begin().unwrap();
    s.fill_scene(renderer, 1.0, &[]);
    let bytes = s.render_frame(renderer);
    assert!(bytes.iter().all(|b| *b == 0));
    s.cx.on_frame_end().unwrap();

    assert_eq!(s.cx.pending_purge(), 0);
    assert!(s.soft.violations().is_empty());
}

#[test]
fn test_instance_shares_blas_until_mesh_changes() {
    let mut s = TestScene::new();
    let mesh = quad_mesh(&s.world, 0.0, 0.5);
    let a = s.world.create_instance(mesh).unwrap();
    let b = s.world.create_instance(mesh).unwrap();
    s.world.set_transform(b, Mat4::from_translation(Vec3::X * 3.0));
    let (renderer, _) = s.shadow_renderer(8, 8, RenderTargetFormat::Ru8, &[(a, 0xff), (b, 0xff)]);

    s.render_frame(renderer);
    // 一个共享的 BLAS 与一个 TLAS
    assert_eq!(s.soft.stats().builds, 2);
    s.render_frame(renderer);
    assert_eq!(s.soft.stats().builds, 3);

    // 几何变化之后重建 mesh 的 BLAS
    let positions = [Vec3::new(-1.0, -1.0, 0.0), Vec3::new(1.0, -1.0, 0.0), Vec3::new(0.0, 1.0, 0.0)];
    let layout = s.world.lock().mesh(mesh).unwrap().layout().clone();
    let layout = rths_render::host::MeshLayout {
        vertex_count: 3,
        index_count: 3,
        ..layout
    };
    s.world
        .set_cpu_buffers(mesh, bytemuck::cast_slice(&positions), bytemuck::cast_slice(&[0u16, 1, 2]), layout)
        .unwrap();
    s.render_frame(renderer);
    assert_eq!(s.soft.stats().builds, 5);
    assert!(s.soft.violations().is_empty());
}

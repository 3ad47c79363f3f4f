//! 构建失败、设备丢失与契约违反之后的恢复
//!
//! 错误通道是进程级的，这里的测试通过 [`SERIAL`] 串行执行。

mod common;

use common::{CENTER, TestScene, pixel, triangle_mesh};
use parking_lot::Mutex;
use rths_render::backend::soft::SoftDevice;
use rths_render::error_log::{clear_error_log, error_log};
use rths_render::host::RenderTargetFormat;
use rths_render::{EngineConfig, FrameOutcome, FramePhase, RthsContext, RthsError};

static SERIAL: Mutex<()> = parking_lot::const_mutex(());

#[test]
fn test_build_failure_skips_frame_and_keeps_output() {
    let _guard = SERIAL.lock();
    clear_error_log();
    let mut s = TestScene::new();
    let inst = s.world.create_instance(triangle_mesh(&s.world)).unwrap();
    let (renderer, _) = s.shadow_renderer(8, 8, RenderTargetFormat::Ru8, &[(inst, 0xff)]);
    let first = s.render_frame(renderer);

    s.soft.fail_next_build();
    let err = s.cx.render(renderer).unwrap_err();
    assert!(matches!(err, RthsError::Device(_)));
    assert_eq!(s.cx.outcome(renderer), Some(FrameOutcome::Skipped));
    assert!(error_log().contains("build"));

    // 跳过的帧没有 in-flight 的工作，输出仍然是上一帧
    s.cx.finish(renderer).unwrap();
    let mut bytes = Vec::new();
    assert!(s.cx.readback_render_target(renderer, &mut bytes).unwrap());
    assert_eq!(bytes, first);

    let next = s.render_frame(renderer);
    assert_eq!(next, first);
    assert_eq!(s.cx.outcome(renderer), Some(FrameOutcome::Rendered));
    assert!(s.soft.violations().is_empty());
}

#[test]
fn test_device_loss_is_reported_then_recovered() {
    let _guard = SERIAL.lock();
    clear_error_log();
    let mut s = TestScene::new();
    let inst = s.world.create_instance(triangle_mesh(&s.world)).unwrap();
    let (renderer, _) = s.shadow_renderer(8, 8, RenderTargetFormat::Ru8, &[(inst, 0xff)]);
    s.render_frame(renderer);

    s.cx.render(renderer).unwrap();
    s.soft.simulate_device_loss();
    assert!(s.cx.finish(renderer).unwrap_err().is_device_lost());
    assert!(error_log().contains("device lost"));
    assert_eq!(s.cx.phase(renderer), Some(FramePhase::Idle));

    // 下一次 render 重建设备与所有 GPU 资源
    let bytes = s.render_frame(renderer);
    assert_eq!(pixel(&bytes, 8, CENTER), 255);
    assert_eq!(s.cx.outcome(renderer), Some(FrameOutcome::Rendered));
}

#[test]
fn test_device_without_ray_tracing_is_unsupported() {
    let _guard = SERIAL.lock();
    clear_error_log();
    let soft = SoftDevice::new(256).without_ray_tracing();
    let result = RthsContext::with_device(EngineConfig::soft(), Box::new(soft));
    assert!(matches!(result, Err(RthsError::Unsupported(_))));
    assert!(!error_log().is_empty());
}

#[test]
fn test_render_contract_violations() {
    let _guard = SERIAL.lock();
    clear_error_log();
    let mut s = TestScene::new();
    let inst = s.world.create_instance(triangle_mesh(&s.world)).unwrap();

    // 没有 render target
    let bare = s.cx.create_renderer();
    assert!(matches!(s.cx.render(bare), Err(RthsError::ContractViolation(_))));
    assert!(error_log().contains("render target"));

    let (renderer, _) = s.shadow_renderer(8, 8, RenderTargetFormat::Ru8, &[(inst, 0xff)]);
    s.cx.begin_scene(renderer);
    assert!(matches!(s.cx.render(renderer), Err(RthsError::ContractViolation(_))));
    s.cx.end_scene(renderer);

    s.cx.render(renderer).unwrap();
    assert!(matches!(s.cx.render(renderer), Err(RthsError::ContractViolation(_))));
    assert_eq!(s.cx.phase(renderer), Some(FramePhase::AwaitingFence));
    s.cx.finish(renderer).unwrap();
    assert_eq!(s.cx.phase(renderer), Some(FramePhase::Complete));

    // finish 没有进行中的帧时什么也不做
    s.cx.finish(renderer).unwrap();
}

#[test]
fn test_released_render_target_detaches_renderer() {
    let _guard = SERIAL.lock();
    let mut s = TestScene::new();
    let inst = s.world.create_instance(triangle_mesh(&s.world)).unwrap();
    let (renderer, target) = s.shadow_renderer(8, 8, RenderTargetFormat::Ru8, &[(inst, 0xff)]);
    s.render_frame(renderer);

    s.world.release_render_target(target);
    s.cx.on_frame_begin().unwrap();
    assert_eq!(s.cx.renderer(renderer).unwrap().render_target(), None);
    // render_all 跳过没有 render target 的 renderer
    s.cx.render_all().unwrap();
    s.cx.on_frame_end().unwrap();
    assert!(s.soft.violations().is_empty());
}

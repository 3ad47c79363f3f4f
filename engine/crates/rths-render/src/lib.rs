//! 光追硬阴影的执行引擎
//!
//! 宿主通过 [`host::World`] 提交网格、instance 与 render target，通过 [`RthsContext`]
//! 组装每帧的场景并渲染。每个 renderer 在 [`backend::QueueKind::Copy`] 上上传数据，
//! 在 [`backend::QueueKind::Raytrace`] 上构建加速结构并 trace，输出为单通道的阴影图。
//!
//! ```ignore
//! let mut cx = RthsContext::new(EngineConfig::default())?;
//! let world = cx.world().clone();
//! let renderer = cx.create_renderer();
//! cx.set_render_target(renderer, Some(target));
//! cx.begin_scene(renderer);
//! cx.add_directional_light(renderer, Vec3::NEG_Y);
//! cx.add_geometry(renderer, instance, 0xff);
//! cx.end_scene(renderer);
//! cx.render(renderer)?;
//! cx.finish(renderer)?;
//! ```

pub mod accel_builder;
pub mod backend;
pub mod config;
pub mod context;
pub mod deformer;
pub mod error;
pub mod error_log;
pub mod frame;
pub mod gpu_types;
pub mod handles;
pub mod host;
pub mod record_cache;
pub mod renderer;
pub mod resource_state;
pub mod scheduler;
pub mod shader_table;
pub mod translator;

pub use config::{BackendChoice, EngineConfig};
pub use context::RthsContext;
pub use error::{RthsError, RthsResult};
pub use frame::{FrameOutcome, FramePhase};
pub use handles::{InstanceHandle, MeshHandle, RenderTargetHandle, RendererHandle};
pub use translator::{NativeBuffer, NativeTexture};

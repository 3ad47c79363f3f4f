//! 宿主侧的数据模型
//!
//! 宿主通过 [`World`] 设置 mesh、instance、render target 的数据，这里只记录数值和变更标记，
//! GPU 侧的状态由渲染管线在 render 时根据快照更新。

pub mod instance;
pub mod mesh;
pub mod render_target;
pub mod scene;
pub mod world;

pub use instance::{MeshInstanceData, UpdateFlags};
pub use mesh::{BlendshapeData, BlendshapeFrame, BoneWeight, BoneWeight4, IndexFormat, MeshData, MeshLayout, MeshSource, SkinData};
pub use render_target::{RenderTargetData, RenderTargetFormat};
pub use scene::{Camera, GeometryEntry, Light, RenderFlags, SceneData};
pub use world::{ReleaseEvent, World};

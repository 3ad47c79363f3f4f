//! 宿主可见的句柄
//!
//! 全部是 slotmap 的 key，带有代际检查，释放后的句柄不会与新的对象混淆。

use slotmap::new_key_type;

new_key_type! {
    pub struct MeshHandle;
    pub struct InstanceHandle;
    pub struct RenderTargetHandle;
    pub struct RendererHandle;
}

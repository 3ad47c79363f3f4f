//! Vulkan RHI (Rendering Hardware Interface) 抽象层
//!
//! 只覆盖光追阴影需要的部分：设备与队列、vk-mem 内存分配、命令录制、
//! timeline semaphore、barrier、加速结构以及 ray tracing pipeline。
//!
//! 所有资源都通过显式传入的 [`gfx::Gfx`] 创建与销毁，没有全局单例，
//! 同一个进程中可以存在多个互不相关的 [`gfx::Gfx`]。

pub mod commands;
pub mod error;
pub mod foundation;
pub mod gfx;
pub mod pipelines;
pub mod raytracing;
pub mod resources;

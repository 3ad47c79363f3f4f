//! [`ResourceState`] 到 Vulkan 同步参数的映射

use ash::vk;
use rths_gfx::commands::barrier::GfxBarrierMask;

use crate::resource_state::ResourceState;

/// 资源处于某个状态时的 (stage, access)
pub fn state_mask(state: ResourceState) -> (vk::PipelineStageFlags2, vk::AccessFlags2) {
    use vk::AccessFlags2 as A;
    use vk::PipelineStageFlags2 as S;
    match state {
        ResourceState::Undefined => (S::NONE, A::NONE),
        ResourceState::CopySrc => (S::COPY, A::TRANSFER_READ),
        ResourceState::CopyDst => (S::COPY, A::TRANSFER_WRITE),
        ResourceState::BuildInput => (S::ACCELERATION_STRUCTURE_BUILD_KHR, A::SHADER_READ),
        ResourceState::AccelWrite => (
            S::ACCELERATION_STRUCTURE_BUILD_KHR,
            A::ACCELERATION_STRUCTURE_READ_KHR | A::ACCELERATION_STRUCTURE_WRITE_KHR,
        ),
        ResourceState::AccelRead => (
            S::ACCELERATION_STRUCTURE_BUILD_KHR | S::RAY_TRACING_SHADER_KHR,
            A::ACCELERATION_STRUCTURE_READ_KHR,
        ),
        ResourceState::ShaderTable => (S::RAY_TRACING_SHADER_KHR, A::SHADER_BINDING_TABLE_READ_KHR),
        ResourceState::Constant => (S::RAY_TRACING_SHADER_KHR, A::UNIFORM_READ),
        ResourceState::UnorderedAccess => {
            (S::RAY_TRACING_SHADER_KHR, A::SHADER_STORAGE_READ | A::SHADER_STORAGE_WRITE)
        }
        ResourceState::HostRead => (S::HOST, A::HOST_READ),
    }
}

/// 纹理处于某个状态时的 layout
pub fn state_layout(state: ResourceState) -> vk::ImageLayout {
    match state {
        ResourceState::Undefined => vk::ImageLayout::UNDEFINED,
        ResourceState::CopySrc => vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
        ResourceState::CopyDst => vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        _ => vk::ImageLayout::GENERAL,
    }
}

/// transfer-only 的 queue 上只能出现拷贝与 host 相关的 stage
///
/// 其余 stage 的依赖由 timeline semaphore 的 wait/signal 保证
pub fn restrict_to_transfer(
    (stage, access): (vk::PipelineStageFlags2, vk::AccessFlags2),
) -> (vk::PipelineStageFlags2, vk::AccessFlags2) {
    let stage = stage & (vk::PipelineStageFlags2::COPY | vk::PipelineStageFlags2::HOST);
    let access = access
        & (vk::AccessFlags2::TRANSFER_READ
            | vk::AccessFlags2::TRANSFER_WRITE
            | vk::AccessFlags2::HOST_READ
            | vk::AccessFlags2::HOST_WRITE);
    (stage, access)
}

pub fn transition_mask(before: ResourceState, after: ResourceState, transfer_only: bool) -> GfxBarrierMask {
    let (mut src, mut dst) = (state_mask(before), state_mask(after));
    if transfer_only {
        src = restrict_to_transfer(src);
        dst = restrict_to_transfer(dst);
    }
    GfxBarrierMask::between(src, dst)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_texture_is_general_during_trace() {
        assert_eq!(state_layout(ResourceState::UnorderedAccess), vk::ImageLayout::GENERAL);
        assert_eq!(state_layout(ResourceState::CopySrc), vk::ImageLayout::TRANSFER_SRC_OPTIMAL);
    }

    #[test]
    fn test_transfer_queue_drops_rt_stages() {
        let mask = transition_mask(ResourceState::AccelRead, ResourceState::CopyDst, true);
        assert_eq!(mask.src_stage, vk::PipelineStageFlags2::NONE);
        assert_eq!(mask.src_access, vk::AccessFlags2::NONE);
        assert_eq!(mask.dst_stage, vk::PipelineStageFlags2::COPY);

        let mask = transition_mask(ResourceState::CopyDst, ResourceState::BuildInput, false);
        assert_eq!(mask.dst_stage, vk::PipelineStageFlags2::ACCELERATION_STRUCTURE_BUILD_KHR);
    }
}

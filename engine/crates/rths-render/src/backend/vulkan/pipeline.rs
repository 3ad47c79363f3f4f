use std::path::{Path, PathBuf};

use ash::vk;
use rths_crate_tools::enumed_map;
use rths_crate_tools::resource::RthsPath;
use rths_gfx::error::{GfxError, GfxResult};
use rths_gfx::gfx::Gfx;
use rths_gfx::pipelines::rt_pipeline::GfxRtPipeline;
use rths_gfx::pipelines::shader::{GfxShaderGroupInfo, GfxShaderStageInfo};

use crate::backend::ShaderGroup;

enumed_map!(ShaderStage<GfxShaderStageInfo>: {
    RayGen: GfxShaderStageInfo {
        stage: vk::ShaderStageFlags::RAYGEN_KHR,
        entry_point: c"main",
        path: RthsPath::shader_build_path_str("shadow/raygen.rgen"),
    },
    CameraMiss: GfxShaderStageInfo {
        stage: vk::ShaderStageFlags::MISS_KHR,
        entry_point: c"main",
        path: RthsPath::shader_build_path_str("shadow/camera.rmiss"),
    },
    ShadowMiss: GfxShaderStageInfo {
        stage: vk::ShaderStageFlags::MISS_KHR,
        entry_point: c"main",
        path: RthsPath::shader_build_path_str("shadow/shadow.rmiss"),
    },
    ClosestHit: GfxShaderStageInfo {
        stage: vk::ShaderStageFlags::CLOSEST_HIT_KHR,
        entry_point: c"main",
        path: RthsPath::shader_build_path_str("shadow/hit.rchit"),
    },
    AnyHit: GfxShaderStageInfo {
        stage: vk::ShaderStageFlags::ANY_HIT_KHR,
        entry_point: c"main",
        path: RthsPath::shader_build_path_str("shadow/hit.rahit"),
    },
});

// 顺序与 ShaderGroup 保持一致
enumed_map!(ShaderGroups<GfxShaderGroupInfo>: {
    RayGen: GfxShaderGroupInfo {
        ty: vk::RayTracingShaderGroupTypeKHR::GENERAL,
        general: ShaderStage::RayGen.index() as u32,
        ..GfxShaderGroupInfo::unused()
    },
    CameraMiss: GfxShaderGroupInfo {
        ty: vk::RayTracingShaderGroupTypeKHR::GENERAL,
        general: ShaderStage::CameraMiss.index() as u32,
        ..GfxShaderGroupInfo::unused()
    },
    ShadowMiss: GfxShaderGroupInfo {
        ty: vk::RayTracingShaderGroupTypeKHR::GENERAL,
        general: ShaderStage::ShadowMiss.index() as u32,
        ..GfxShaderGroupInfo::unused()
    },
    Hit: GfxShaderGroupInfo {
        ty: vk::RayTracingShaderGroupTypeKHR::TRIANGLES_HIT_GROUP,
        closest_hit: ShaderStage::ClosestHit.index() as u32,
        any_hit: ShaderStage::AnyHit.index() as u32,
        ..GfxShaderGroupInfo::unused()
    },
});

impl ShaderGroups {
    #[inline]
    fn from_group(group: ShaderGroup) -> Self {
        match group {
            ShaderGroup::RayGen => ShaderGroups::RayGen,
            ShaderGroup::CameraMiss => ShaderGroups::CameraMiss,
            ShaderGroup::ShadowMiss => ShaderGroups::ShadowMiss,
            ShaderGroup::Hit => ShaderGroups::Hit,
        }
    }
}

/// 阴影光追的 pipeline 以及各个 shader group 的 handle
///
/// # Destroy
/// 需要手动调用 [`ShadowPipeline::destroy`]
pub struct ShadowPipeline {
    pipeline: GfxRtPipeline,
    group_handles: [Vec<u8>; ShaderGroups::COUNT],
}

// new & init
impl ShadowPipeline {
    /// `shader_dir` 会替换默认的 `shader/.build` 目录
    pub fn new(gfx: &Gfx, shader_dir: Option<&Path>) -> GfxResult<Self> {
        let _span = tracy_client::span!("ShadowPipeline::new");

        let stages = ShaderStage::iter().map(|stage| relocate(stage.value(), shader_dir)).collect::<Vec<_>>();
        // raygen 中同时发射 camera ray 与 shadow ray，hit shader 中不会再发射光线
        let pipeline = GfxRtPipeline::new(gfx, &stages, ShaderGroups::array(), 1, "shadow-rt-pipeline")?;

        let handle_size = gfx.rt_pipeline_props().shader_group_handle_size as usize;
        let handles = match pipeline.group_handles(gfx) {
            Ok(handles) if handles.len() == handle_size * ShaderGroups::COUNT => handles,
            Ok(handles) => {
                pipeline.destroy(gfx);
                return Err(GfxError::Unsupported(format!(
                    "unexpected shader group handle data: {} bytes for {} groups",
                    handles.len(),
                    ShaderGroups::COUNT
                )));
            }
            Err(e) => {
                pipeline.destroy(gfx);
                return Err(e);
            }
        };
        let group_handles = std::array::from_fn(|i| handles[i * handle_size..(i + 1) * handle_size].to_vec());

        Ok(Self { pipeline, group_handles })
    }

    pub fn destroy(self, gfx: &Gfx) {
        self.pipeline.destroy(gfx);
    }
}

// getters
impl ShadowPipeline {
    #[inline]
    pub fn handle(&self) -> vk::Pipeline {
        self.pipeline.handle()
    }

    #[inline]
    pub fn layout(&self) -> vk::PipelineLayout {
        self.pipeline.layout()
    }

    #[inline]
    pub fn group_handle(&self, group: ShaderGroup) -> &[u8] {
        &self.group_handles[ShaderGroups::from_group(group).index()]
    }
}

fn relocate(stage: &GfxShaderStageInfo, shader_dir: Option<&Path>) -> GfxShaderStageInfo {
    let Some(shader_dir) = shader_dir else {
        return stage.clone();
    };
    let default_dir = RthsPath::shader_root_path().join(".build");
    let relative = stage.path().strip_prefix(&default_dir).map(Path::to_path_buf).unwrap_or_else(|_| {
        stage.path().file_name().map(PathBuf::from).unwrap_or_default()
    });
    GfxShaderStageInfo {
        path: shader_dir.join(relative).to_string_lossy().into_owned(),
        ..stage.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_groups_follow_shader_group_order() {
        for (i, group) in ShaderGroup::ALL.into_iter().enumerate() {
            assert_eq!(ShaderGroups::from_group(group).index(), i);
        }
        assert_eq!(ShaderGroups::Hit.value().any_hit, ShaderStage::AnyHit.index() as u32);
    }

    #[test]
    fn test_relocate_keeps_relative_path() {
        let stage = ShaderStage::ClosestHit.value();
        let moved = relocate(stage, Some(Path::new("/tmp/spv")));
        assert_eq!(moved.path(), Path::new("/tmp/spv/shadow/hit.rchit.spv"));
        assert_eq!(relocate(stage, None).path, stage.path);
    }
}

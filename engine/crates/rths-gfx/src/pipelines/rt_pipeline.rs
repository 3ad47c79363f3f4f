use ash::vk;
use itertools::Itertools;

use crate::{
    error::{GfxResult, VkResultExt},
    gfx::Gfx,
    pipelines::shader::{GfxShaderGroupInfo, GfxShaderModuleCache, GfxShaderStageInfo},
};

/// 阴影光追 pipeline 使用的 push descriptor 绑定
pub struct GfxRtBindings;
impl GfxRtBindings {
    pub const TLAS: u32 = 0;
    pub const OUTPUT_IMAGE: u32 = 1;
    pub const SCENE_CONSTANTS: u32 = 2;

    fn layout_bindings() -> [vk::DescriptorSetLayoutBinding<'static>; 3] {
        let all_stages = vk::ShaderStageFlags::RAYGEN_KHR
            | vk::ShaderStageFlags::MISS_KHR
            | vk::ShaderStageFlags::CLOSEST_HIT_KHR
            | vk::ShaderStageFlags::ANY_HIT_KHR;
        [
            vk::DescriptorSetLayoutBinding::default()
                .binding(Self::TLAS)
                .descriptor_type(vk::DescriptorType::ACCELERATION_STRUCTURE_KHR)
                .descriptor_count(1)
                .stage_flags(all_stages),
            vk::DescriptorSetLayoutBinding::default()
                .binding(Self::OUTPUT_IMAGE)
                .descriptor_type(vk::DescriptorType::STORAGE_IMAGE)
                .descriptor_count(1)
                .stage_flags(vk::ShaderStageFlags::RAYGEN_KHR),
            vk::DescriptorSetLayoutBinding::default()
                .binding(Self::SCENE_CONSTANTS)
                .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
                .descriptor_count(1)
                .stage_flags(all_stages),
        ]
    }
}

/// # Destroy
/// 需要手动调用 [`GfxRtPipeline::destroy`]
pub struct GfxRtPipeline {
    pipeline: vk::Pipeline,
    pipeline_layout: vk::PipelineLayout,
    set_layout: vk::DescriptorSetLayout,
    group_count: u32,
}

// new & init
impl GfxRtPipeline {
    pub fn new(
        gfx: &Gfx,
        stages: &[GfxShaderStageInfo],
        groups: &[GfxShaderGroupInfo],
        max_recursion_depth: u32,
        debug_name: &str,
    ) -> GfxResult<Self> {
        let _span = tracy_client::span!("GfxRtPipeline::new");
        let gfx_device = gfx.gfx_device();

        let mut shader_module_cache = GfxShaderModuleCache::new();
        let stage_infos = stages
            .iter()
            .map(|stage| {
                let module = shader_module_cache.get_or_load(gfx, stage.path())?.handle();
                Ok(vk::PipelineShaderStageCreateInfo::default().module(module).stage(stage.stage).name(stage.entry_point))
            })
            .collect::<GfxResult<Vec<_>>>();
        let stage_infos = match stage_infos {
            Ok(infos) => infos,
            Err(e) => {
                shader_module_cache.destroy(gfx);
                return Err(e);
            }
        };

        let shader_groups = groups
            .iter()
            .map(|group| vk::RayTracingShaderGroupCreateInfoKHR {
                ty: group.ty,
                general_shader: group.general,
                any_hit_shader: group.any_hit,
                closest_hit_shader: group.closest_hit,
                intersection_shader: group.intersection,
                ..Default::default()
            })
            .collect_vec();

        let bindings = GfxRtBindings::layout_bindings();
        let set_layout_ci = vk::DescriptorSetLayoutCreateInfo::default()
            .flags(vk::DescriptorSetLayoutCreateFlags::PUSH_DESCRIPTOR_KHR)
            .bindings(&bindings);

        let result = (|| {
            let set_layout = unsafe { gfx_device.create_descriptor_set_layout(&set_layout_ci, None) }
                .vk_context("vkCreateDescriptorSetLayout")?;
            gfx_device.set_object_debug_name(set_layout, format!("{debug_name}-set-layout"));

            let pipeline_layout_ci =
                vk::PipelineLayoutCreateInfo::default().set_layouts(std::slice::from_ref(&set_layout));
            let pipeline_layout = match unsafe { gfx_device.create_pipeline_layout(&pipeline_layout_ci, None) }
                .vk_context("vkCreatePipelineLayout")
            {
                Ok(layout) => layout,
                Err(e) => {
                    unsafe { gfx_device.destroy_descriptor_set_layout(set_layout, None) };
                    return Err(e);
                }
            };
            gfx_device.set_object_debug_name(pipeline_layout, format!("{debug_name}-pipeline-layout"));

            let pipeline_ci = vk::RayTracingPipelineCreateInfoKHR::default()
                .stages(&stage_infos)
                .groups(&shader_groups)
                .layout(pipeline_layout)
                // 这个仅仅是用来分配栈内存的，并不会在超过递归深度后让调用被丢弃
                // 需要手动跟踪递归深度
                .max_pipeline_ray_recursion_depth(max_recursion_depth);

            let pipeline = unsafe {
                gfx_device.ray_tracing_pipeline.create_ray_tracing_pipelines(
                    vk::DeferredOperationKHR::null(),
                    vk::PipelineCache::null(),
                    std::slice::from_ref(&pipeline_ci),
                    None,
                )
            };
            let pipeline = match pipeline {
                Ok(pipelines) => pipelines[0],
                Err((_, result)) => {
                    unsafe {
                        gfx_device.destroy_pipeline_layout(pipeline_layout, None);
                        gfx_device.destroy_descriptor_set_layout(set_layout, None);
                    }
                    return Err(crate::error::GfxError::VkCall {
                        call: "vkCreateRayTracingPipelinesKHR",
                        result,
                    });
                }
            };
            gfx_device.set_object_debug_name(pipeline, debug_name);

            Ok(Self {
                pipeline,
                pipeline_layout,
                set_layout,
                group_count: shader_groups.len() as u32,
            })
        })();

        shader_module_cache.destroy(gfx);
        result
    }

    pub fn destroy(self, gfx: &Gfx) {
        let gfx_device = gfx.gfx_device();
        unsafe {
            gfx_device.destroy_pipeline(self.pipeline, None);
            gfx_device.destroy_pipeline_layout(self.pipeline_layout, None);
            gfx_device.destroy_descriptor_set_layout(self.set_layout, None);
        }
    }
}
// getters
impl GfxRtPipeline {
    #[inline]
    pub fn handle(&self) -> vk::Pipeline {
        self.pipeline
    }

    #[inline]
    pub fn layout(&self) -> vk::PipelineLayout {
        self.pipeline_layout
    }

    #[inline]
    pub fn group_count(&self) -> u32 {
        self.group_count
    }
}
// tools
impl GfxRtPipeline {
    /// 所有 shader group 的 handle，按 group 的顺序紧密排列，每个 handle 占 `shader_group_handle_size` 字节
    pub fn group_handles(&self, gfx: &Gfx) -> GfxResult<Vec<u8>> {
        let handle_size = gfx.rt_pipeline_props().shader_group_handle_size;
        unsafe {
            gfx.gfx_device().ray_tracing_pipeline.get_ray_tracing_shader_group_handles(
                self.pipeline,
                0,
                self.group_count,
                (self.group_count * handle_size) as usize,
            )
        }
        .vk_context("vkGetRayTracingShaderGroupHandlesKHR")
    }
}

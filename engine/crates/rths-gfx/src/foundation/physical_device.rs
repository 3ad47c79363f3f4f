use std::ffi::CStr;

use ash::vk;
use itertools::Itertools;

use crate::commands::command_queue::GfxQueueFamily;
use crate::error::{GfxError, GfxResult, VkResultExt};
use crate::foundation::debug_messenger::DebugType;
use crate::foundation::device::GfxDevice;

/// 表示一张支持硬件光追的物理显卡
pub struct GfxPhysicalDevice {
    pub(crate) vk_handle: vk::PhysicalDevice,

    /// 当前 gpu 的基础属性
    pub(crate) basic_props: vk::PhysicalDeviceProperties,

    /// 当前 gpu 的 ray tracing 属性
    pub(crate) rt_pipeline_props: vk::PhysicalDeviceRayTracingPipelinePropertiesKHR<'static>,

    /// 当前 gpu 的加速结构属性
    pub(crate) acc_struct_props: vk::PhysicalDeviceAccelerationStructurePropertiesKHR<'static>,

    /// 光追 dispatch 以及加速结构构建所在的 queue family
    pub(crate) compute_queue_family: GfxQueueFamily,
    /// 上传与回读所在的 queue family，如果没有专用的 transfer queue 则和 compute 相同
    pub(crate) transfer_queue_family: GfxQueueFamily,
}

impl GfxPhysicalDevice {
    /// 选出一张支持光追的显卡
    ///
    /// `prefer_discrete` 为 true 时优先选择独立显卡
    pub fn pick(instance: &ash::Instance, prefer_discrete: bool) -> GfxResult<Self> {
        let pdevices = unsafe { instance.enumerate_physical_devices() }.vk_context("enumerate_physical_devices")?;

        let candidates = pdevices
            .iter()
            .filter_map(|pdevice| match Self::new(*pdevice, instance) {
                Ok(pdevice) => Some(pdevice),
                Err(e) => {
                    log::info!("skip physical device: {}", e);
                    None
                }
            })
            .collect_vec();

        let mut candidates = candidates.into_iter();
        let picked = if prefer_discrete {
            candidates.find_or_first(GfxPhysicalDevice::is_descrete_gpu)
        } else {
            candidates.next()
        };

        picked.ok_or_else(|| GfxError::Unsupported("no physical device supports hardware ray tracing".to_string()))
    }

    fn new(pdevice: vk::PhysicalDevice, instance: &ash::Instance) -> GfxResult<Self> {
        unsafe {
            let mut pdevice_raytracing_props = vk::PhysicalDeviceRayTracingPipelinePropertiesKHR::default();
            let mut pdevice_acc_props = vk::PhysicalDeviceAccelerationStructurePropertiesKHR::default();
            let mut pdevice_props2 = vk::PhysicalDeviceProperties2::default()
                .push_next(&mut pdevice_raytracing_props)
                .push_next(&mut pdevice_acc_props);
            instance.get_physical_device_properties2(pdevice, &mut pdevice_props2);

            let basic_props = pdevice_props2.properties;
            let physical_device_name = CStr::from_ptr(basic_props.device_name.as_ptr());
            log::info!("found gpu: {:?}", physical_device_name);

            if basic_props.api_version < vk::API_VERSION_1_3 {
                return Err(GfxError::Unsupported(format!("{:?} does not support vulkan 1.3", physical_device_name)));
            }

            // 检查光追所需的 extension
            let device_extensions =
                instance.enumerate_device_extension_properties(pdevice).vk_context("enumerate_device_exts")?;
            for required in GfxDevice::required_device_exts() {
                let supported = device_extensions
                    .iter()
                    .any(|ext| required == CStr::from_ptr(ext.extension_name.as_ptr()));
                if !supported {
                    return Err(GfxError::Unsupported(format!(
                        "{:?} is missing device extension {:?}",
                        physical_device_name, required
                    )));
                }
            }

            pdevice_raytracing_props.p_next = std::ptr::null_mut();
            let rt_props = pdevice_raytracing_props;
            log::info!("physical device ray tracing props:\n{:#?}", rt_props);

            pdevice_acc_props.p_next = std::ptr::null_mut();
            let acc_props = pdevice_acc_props;
            log::debug!("physical device acceleration structure props:\n{:#?}", acc_props);

            let queue_familiy_props = instance.get_physical_device_queue_family_properties(pdevice);
            log::debug!("physical device: queue family props:\n{:#?}", queue_familiy_props);

            // 找到符合条的 queue family
            let find_queue_family = |name: &str, include_flags: vk::QueueFlags, exclude_flags: vk::QueueFlags| {
                queue_familiy_props
                    .iter()
                    .enumerate()
                    .find(|(_, props)| {
                        props.queue_flags.contains(include_flags) && (props.queue_flags & exclude_flags).is_empty()
                    })
                    .map(|(family_idx, props)| GfxQueueFamily {
                        name: name.to_string(),
                        queue_family_index: family_idx as u32,
                        queue_flags: props.queue_flags,
                        queue_count: props.queue_count,
                    })
            };

            // 光追需要 compute 能力
            let compute_queue_family =
                find_queue_family("compute", vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER, vk::QueueFlags::empty())
                    .ok_or_else(|| GfxError::Unsupported("no compute queue family".to_string()))?;

            // Transfer Only，没有的话退化为和 compute 相同的 family
            let transfer_queue_family = find_queue_family(
                "transfer-only",
                vk::QueueFlags::TRANSFER,
                vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE,
            )
            .unwrap_or_else(|| GfxQueueFamily {
                name: "transfer-shared".to_string(),
                ..compute_queue_family.clone()
            });

            Ok(Self {
                vk_handle: pdevice,
                basic_props,
                rt_pipeline_props: rt_props,
                acc_struct_props: acc_props,
                compute_queue_family,
                transfer_queue_family,
            })
        }
    }

    pub fn destroy(self) {
        // 无需销毁
    }

    /// 当前 gpu 是否是独立显卡
    #[inline]
    pub fn is_descrete_gpu(&self) -> bool {
        self.basic_props.device_type == vk::PhysicalDeviceType::DISCRETE_GPU
    }

    #[inline]
    pub fn vk_handle(&self) -> vk::PhysicalDevice {
        self.vk_handle
    }

    #[inline]
    pub fn rt_pipeline_props(&self) -> &vk::PhysicalDeviceRayTracingPipelinePropertiesKHR<'static> {
        &self.rt_pipeline_props
    }

    /// 加速结构 scratch buffer 地址的对齐要求
    #[inline]
    pub fn min_scratch_offset_align(&self) -> vk::DeviceSize {
        self.acc_struct_props.min_acceleration_structure_scratch_offset_alignment as vk::DeviceSize
    }

    /// buffer 和 image 之间拷贝时，buffer offset 的对齐要求
    #[inline]
    pub fn optimal_copy_row_pitch_align(&self) -> vk::DeviceSize {
        self.basic_props.limits.optimal_buffer_copy_row_pitch_alignment.max(1)
    }

    #[inline]
    pub fn non_coherent_atom_size(&self) -> vk::DeviceSize {
        self.basic_props.limits.non_coherent_atom_size
    }

    #[inline]
    pub fn compute_queue_family(&self) -> &GfxQueueFamily {
        &self.compute_queue_family
    }

    #[inline]
    pub fn transfer_queue_family(&self) -> &GfxQueueFamily {
        &self.transfer_queue_family
    }
}

impl DebugType for GfxPhysicalDevice {
    fn debug_type_name() -> &'static str {
        "GfxPhysicalDevice"
    }

    fn vk_handle(&self) -> impl vk::Handle {
        self.vk_handle
    }
}

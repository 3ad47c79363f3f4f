use std::ffi::{CStr, CString, c_char};

use ash::vk;
use itertools::Itertools;

use crate::error::{GfxError, GfxResult, VkResultExt};
use crate::foundation::debug_messenger::GfxDebugMsger;

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

pub struct GfxInstance {
    /// 仅仅是函数指针，以及一个裸的 handle
    ///
    /// 生命周期由 [`crate::gfx::Gfx`] 手动控制
    pub(crate) ash_instance: ash::Instance,

    /// 是否开启了 debug utils，决定了 device 能否设置 debug name
    pub(crate) debug_utils_enabled: bool,
}

impl GfxInstance {
    /// 设置所需的 layers 和 extensions，创建 vk instance
    pub fn new(vk_entry: &ash::Entry, app_name: &str, engine_name: &str, enable_validation: bool) -> GfxResult<Self> {
        let app_name = CString::new(app_name).unwrap_or_default();
        let engine_name = CString::new(engine_name).unwrap_or_default();
        let app_info = vk::ApplicationInfo::default()
            .api_version(vk::API_VERSION_1_3) // 版本过低时，有些函数无法正确加载
            .application_name(app_name.as_c_str())
            .application_version(vk::make_api_version(0, 1, 0, 0))
            .engine_name(engine_name.as_c_str())
            .engine_version(vk::make_api_version(0, 1, 0, 0));

        let all_ext_props =
            unsafe { vk_entry.enumerate_instance_extension_properties(None) }.vk_context("enumerate_instance_exts")?;
        let ext_supported = |ext: &CStr| {
            all_ext_props
                .iter()
                .any(|supported| ext == unsafe { CStr::from_ptr(supported.extension_name.as_ptr()) })
        };

        // debug utils 是可选的，没有时只是无法设置 debug name
        let debug_utils_enabled = ext_supported(ash::ext::debug_utils::NAME);
        let enabled_extensions: Vec<*const c_char> =
            if debug_utils_enabled { vec![ash::ext::debug_utils::NAME.as_ptr()] } else { vec![] };
        log::info!(
            "instance extensions: {}",
            enabled_extensions.iter().map(|ext| format!("\n\t{:?}", unsafe { CStr::from_ptr(*ext) })).join("")
        );

        let enabled_layers = Self::get_layers(vk_entry, enable_validation)?;
        log::info!(
            "instance layers: {}",
            enabled_layers.iter().map(|layer| format!("\n\t{:?}", unsafe { CStr::from_ptr(*layer) })).join("")
        );

        let mut instance_ci = vk::InstanceCreateInfo::default()
            .application_info(&app_info)
            .enabled_extension_names(&enabled_extensions)
            .enabled_layer_names(&enabled_layers);

        // 为 instance info 添加 debug messenger，覆盖 instance 创建与销毁过程
        let mut debug_utils_messenger_ci = GfxDebugMsger::debug_utils_messenger_ci();
        if debug_utils_enabled {
            instance_ci = instance_ci.push_next(&mut debug_utils_messenger_ci);
        }

        let handle = unsafe { vk_entry.create_instance(&instance_ci, None) }.map_err(|result| match result {
            vk::Result::ERROR_INCOMPATIBLE_DRIVER => GfxError::Unsupported("no vulkan 1.3 capable driver".to_string()),
            result => GfxError::VkCall {
                call: "vkCreateInstance",
                result,
            },
        })?;

        Ok(Self {
            ash_instance: handle,
            debug_utils_enabled,
        })
    }

    pub fn destroy(self) {
        log::info!("Destroying GfxInstance");
        unsafe {
            self.ash_instance.destroy_instance(None);
        }
    }

    /// instance 所需的所有 layers
    ///
    /// validation layer 不存在时只打印警告
    fn get_layers(vk_entry: &ash::Entry, enable_validation: bool) -> GfxResult<Vec<*const c_char>> {
        if !enable_validation {
            return Ok(Vec::new());
        }

        let all_layer_props =
            unsafe { vk_entry.enumerate_instance_layer_properties() }.vk_context("enumerate_instance_layers")?;
        let supported = all_layer_props
            .iter()
            .any(|layer| VALIDATION_LAYER == unsafe { CStr::from_ptr(layer.layer_name.as_ptr()) });
        if supported {
            Ok(vec![VALIDATION_LAYER.as_ptr()])
        } else {
            log::warn!("validation layer requested but {:?} is not installed", VALIDATION_LAYER);
            Ok(Vec::new())
        }
    }
}

/// getter
impl GfxInstance {
    #[inline]
    pub fn ash_instance(&self) -> &ash::Instance {
        &self.ash_instance
    }

    #[inline]
    pub fn vk_instance(&self) -> vk::Instance {
        self.ash_instance.handle()
    }
}

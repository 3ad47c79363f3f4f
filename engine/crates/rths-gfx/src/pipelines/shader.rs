use std::collections::HashMap;
use std::ffi::CStr;

use ash::vk;

use crate::{
    error::{GfxError, GfxResult, VkResultExt},
    foundation::debug_messenger::DebugType,
    gfx::Gfx,
};

/// # Destroy
///
/// 需要手动调用 `destroy` 方法来释放资源。
pub struct GfxShaderModule {
    handle: vk::ShaderModule,

    #[cfg(debug_assertions)]
    destroyed: bool,
}
impl GfxShaderModule {
    /// # param
    /// * path - spv shader 文件路径
    ///
    /// spv 文件不存在时返回 [`GfxError::Unsupported`]，通常意味着 shader 还没有编译
    pub fn new(gfx: &Gfx, path: &std::path::Path) -> GfxResult<Self> {
        let mut file = std::fs::File::open(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => {
                GfxError::Unsupported(format!("shader binary {} not found, run shader-build first", path.display()))
            }
            _ => GfxError::Io {
                path: path.display().to_string(),
                source: e,
            },
        })?;
        let shader_code = ash::util::read_spv(&mut file).map_err(|e| GfxError::Io {
            path: path.display().to_string(),
            source: e,
        })?;

        let shader_module_info = vk::ShaderModuleCreateInfo::default().code(&shader_code);

        let gfx_device = gfx.gfx_device();
        let shader_module =
            unsafe { gfx_device.create_shader_module(&shader_module_info, None) }.vk_context("vkCreateShaderModule")?;
        let shader_module = Self {
            handle: shader_module,

            #[cfg(debug_assertions)]
            destroyed: false,
        };
        gfx_device.set_debug_name(&shader_module, path.display().to_string());
        Ok(shader_module)
    }

    #[inline]
    pub fn handle(&self) -> vk::ShaderModule {
        self.handle
    }

    #[inline]
    pub fn destroy(mut self, gfx: &Gfx) {
        unsafe {
            gfx.gfx_device().destroy_shader_module(self.handle, None);
        }
        #[cfg(debug_assertions)]
        {
            self.destroyed = true;
        }
    }
}
impl Drop for GfxShaderModule {
    fn drop(&mut self) {
        #[cfg(debug_assertions)]
        debug_assert!(self.destroyed, "ShaderModule must be destroyed manually before drop.");
    }
}
impl DebugType for GfxShaderModule {
    fn debug_type_name() -> &'static str {
        "GfxShaderModule"
    }

    fn vk_handle(&self) -> impl vk::Handle {
        self.handle
    }
}

/// 可以存放多个 ShaderModule，使用路径进行索引
pub struct GfxShaderModuleCache {
    shader_modules: HashMap<std::path::PathBuf, GfxShaderModule>,
    #[cfg(debug_assertions)]
    destroyed: bool,
}
impl Default for GfxShaderModuleCache {
    fn default() -> Self {
        Self::new()
    }
}

impl GfxShaderModuleCache {
    pub fn new() -> Self {
        Self {
            shader_modules: HashMap::new(),
            #[cfg(debug_assertions)]
            destroyed: false,
        }
    }

    pub fn get_or_load(&mut self, gfx: &Gfx, path: &std::path::Path) -> GfxResult<&GfxShaderModule> {
        if !self.shader_modules.contains_key(path) {
            let module = GfxShaderModule::new(gfx, path)?;
            self.shader_modules.insert(path.to_path_buf(), module);
        }
        self.shader_modules
            .get(path)
            .ok_or_else(|| GfxError::Unsupported(format!("shader module {} missing from cache", path.display())))
    }

    pub fn destroy(mut self, gfx: &Gfx) {
        #[cfg(debug_assertions)]
        {
            self.destroyed = true;
        }

        // 使用 std::mem::take 来 move 出 HashMap，留下一个空的 HashMap
        let shader_modules = std::mem::take(&mut self.shader_modules);
        shader_modules.into_values().for_each(|module| module.destroy(gfx));
    }
}
impl Drop for GfxShaderModuleCache {
    fn drop(&mut self) {
        #[cfg(debug_assertions)]
        debug_assert!(self.destroyed, "ShaderModuleCache must be destroyed manually before drop.");
    }
}

#[derive(Clone)]
pub struct GfxShaderStageInfo {
    pub stage: vk::ShaderStageFlags,
    pub entry_point: &'static CStr,
    pub path: String,
}
impl GfxShaderStageInfo {
    #[inline]
    pub fn path(&self) -> &std::path::Path {
        std::path::Path::new(self.path.as_str())
    }
}

/// 用于 RayTracing Pipeline 的创建
///
/// 在 pipeline create info 的 groups 中，每个 shader group 的 index
///
/// 每个 shader group 可以由多个 shader 组成，每个 shader group 都是独一无二的
#[derive(Clone)]
pub struct GfxShaderGroupInfo {
    pub ty: vk::RayTracingShaderGroupTypeKHR,
    pub general: u32,
    pub closest_hit: u32,
    pub any_hit: u32,
    pub intersection: u32,
}
impl GfxShaderGroupInfo {
    pub const fn unused() -> Self {
        Self {
            ty: vk::RayTracingShaderGroupTypeKHR::GENERAL,
            general: vk::SHADER_UNUSED_KHR,
            closest_hit: vk::SHADER_UNUSED_KHR,
            any_hit: vk::SHADER_UNUSED_KHR,
            intersection: vk::SHADER_UNUSED_KHR,
        }
    }
}

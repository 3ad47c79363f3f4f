use ash::vk;

use crate::error::{GfxResult, VkResultExt};
use crate::foundation::{debug_messenger::DebugType, device::GfxDevice};

/// timeline semaphore，作为队列的 fence 使用
///
/// # Destroy
/// 可以 Clone，需要手动 destroy
#[derive(Clone)]
pub struct GfxSemaphore {
    semaphore: vk::Semaphore,
}

// 创建与销毁
impl GfxSemaphore {
    pub fn new_timeline(gfx_device: &GfxDevice, initial_value: u64, debug_name: &str) -> GfxResult<Self> {
        let mut timeline_type_ci = vk::SemaphoreTypeCreateInfo::default()
            .semaphore_type(vk::SemaphoreType::TIMELINE)
            .initial_value(initial_value);
        let timeline_semaphore_ci = vk::SemaphoreCreateInfo::default().push_next(&mut timeline_type_ci);
        let semaphore =
            unsafe { gfx_device.create_semaphore(&timeline_semaphore_ci, None) }.vk_context("vkCreateSemaphore")?;

        let semaphore = Self { semaphore };
        gfx_device.set_debug_name(&semaphore, debug_name);
        Ok(semaphore)
    }

    #[inline]
    pub fn destroy(self, gfx_device: &GfxDevice) {
        unsafe {
            gfx_device.destroy_semaphore(self.semaphore, None);
        }
    }
}

// getters
impl GfxSemaphore {
    #[inline]
    pub fn handle(&self) -> vk::Semaphore {
        self.semaphore
    }
}

// tools
impl GfxSemaphore {
    /// 阻塞等待，直到 timeline 到达 `timeline_value`
    #[inline]
    pub fn wait_timeline(&self, gfx_device: &GfxDevice, timeline_value: u64, timeout_ns: u64) -> GfxResult<()> {
        let wait_semaphore = [self.semaphore];
        let wait_info = vk::SemaphoreWaitInfo::default()
            .semaphores(&wait_semaphore)
            .values(std::slice::from_ref(&timeline_value));
        unsafe { gfx_device.wait_semaphores(&wait_info, timeout_ns) }.vk_context("vkWaitSemaphores")
    }

    /// 非阻塞地查询 timeline 的当前值
    #[inline]
    pub fn timeline_value(&self, gfx_device: &GfxDevice) -> GfxResult<u64> {
        unsafe { gfx_device.get_semaphore_counter_value(self.semaphore) }.vk_context("vkGetSemaphoreCounterValue")
    }
}

impl DebugType for GfxSemaphore {
    fn debug_type_name() -> &'static str {
        "GfxSemaphore"
    }

    fn vk_handle(&self) -> impl vk::Handle {
        self.semaphore
    }
}

use ash::vk;

/// GFX 层的错误
#[derive(Debug, thiserror::Error)]
pub enum GfxError {
    #[error("failed to load vulkan library: {0}")]
    Loading(#[from] ash::LoadingError),

    #[error("vulkan call failed: {0}")]
    Vk(#[from] vk::Result),

    #[error("vulkan call `{call}` failed: {result}")]
    VkCall { call: &'static str, result: vk::Result },

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("memory allocation failed: {0}")]
    Allocation(String),

    #[error("io error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl GfxError {
    /// 设备丢失之后，后续所有的调用都没有意义了
    #[inline]
    pub fn is_device_lost(&self) -> bool {
        matches!(
            self,
            GfxError::Vk(vk::Result::ERROR_DEVICE_LOST) | GfxError::VkCall { result: vk::Result::ERROR_DEVICE_LOST, .. }
        )
    }

    #[inline]
    pub fn is_out_of_memory(&self) -> bool {
        let result = match self {
            GfxError::Vk(r) | GfxError::VkCall { result: r, .. } => *r,
            GfxError::Allocation(_) => return true,
            _ => return false,
        };
        result == vk::Result::ERROR_OUT_OF_DEVICE_MEMORY || result == vk::Result::ERROR_OUT_OF_HOST_MEMORY
    }
}

pub type GfxResult<T> = Result<T, GfxError>;

/// 为 `VkResult` 附加调用名称
pub trait VkResultExt<T> {
    fn vk_context(self, call: &'static str) -> GfxResult<T>;
}

impl<T> VkResultExt<T> for ash::prelude::VkResult<T> {
    #[inline]
    fn vk_context(self, call: &'static str) -> GfxResult<T> {
        self.map_err(|result| GfxError::VkCall { call, result })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_lost_detection() {
        assert!(GfxError::Vk(vk::Result::ERROR_DEVICE_LOST).is_device_lost());
        let err: GfxResult<()> = Err(vk::Result::ERROR_DEVICE_LOST).vk_context("vkQueueSubmit2");
        assert!(err.unwrap_err().is_device_lost());
        assert!(!GfxError::Unsupported("rt".to_string()).is_device_lost());
    }

    #[test]
    fn test_out_of_memory_detection() {
        assert!(GfxError::Vk(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY).is_out_of_memory());
        assert!(GfxError::Allocation("vma".to_string()).is_out_of_memory());
        assert!(!GfxError::Vk(vk::Result::ERROR_DEVICE_LOST).is_out_of_memory());
    }

    #[test]
    fn test_error_display() {
        let err = GfxError::VkCall {
            call: "vkCreateBuffer",
            result: vk::Result::ERROR_OUT_OF_DEVICE_MEMORY,
        };
        assert!(err.to_string().starts_with("vulkan call `vkCreateBuffer` failed"));
    }
}

use crate::backend::DeviceError;

/// 引擎对外 API 的错误
#[derive(Debug, thiserror::Error)]
pub enum RthsError {
    /// 设备丢失、构建失败、显存不足等
    #[error(transparent)]
    Device(#[from] DeviceError),

    /// 调用方违反了使用约定，例如解析已释放的句柄、帧未完成时再次 render
    #[error("contract violation: {0}")]
    ContractViolation(String),

    /// 当前环境不支持硬件光追
    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("invalid config: {0}")]
    Config(String),
}

impl RthsError {
    #[inline]
    pub fn contract(msg: impl Into<String>) -> Self {
        Self::ContractViolation(msg.into())
    }

    #[inline]
    pub fn is_device_lost(&self) -> bool {
        matches!(self, RthsError::Device(DeviceError::DeviceLost(_)))
    }
}

pub type RthsResult<T> = Result<T, RthsError>;

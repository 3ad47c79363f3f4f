use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{RthsError, RthsResult};

/// 使用哪一个设备后端
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackendChoice {
    /// 优先 Vulkan，创建失败时报错
    #[default]
    Vulkan,
    /// CPU 实现
    Soft,
}

/// 引擎配置
///
/// ```toml
/// app_name = "my-host"
/// backend = "soft"
/// prefer_discrete_gpu = true
/// enable_validation = false
/// shader_table_capacity = 64
/// max_lights = 32
/// soft_row_pitch_alignment = 256
/// ```
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub app_name: String,
    pub backend: BackendChoice,
    pub prefer_discrete_gpu: bool,
    pub enable_validation: bool,
    /// 覆盖 SPIR-V 的目录，默认为 `shader/.build`
    pub shader_build_dir: Option<PathBuf>,
    /// shader table 初始可容纳的 instance 数量
    pub shader_table_capacity: u32,
    pub max_lights: u32,
    /// soft 设备上 texture 拷贝的 row pitch 对齐
    pub soft_row_pitch_alignment: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            app_name: "rths".to_string(),
            backend: BackendChoice::default(),
            prefer_discrete_gpu: true,
            enable_validation: cfg!(debug_assertions),
            shader_build_dir: None,
            shader_table_capacity: 64,
            max_lights: crate::gpu_types::MAX_LIGHTS as u32,
            soft_row_pitch_alignment: 256,
        }
    }
}

impl EngineConfig {
    pub fn soft() -> Self {
        Self {
            backend: BackendChoice::Soft,
            ..Default::default()
        }
    }

    pub fn from_toml_str(s: &str) -> RthsResult<Self> {
        let config: Self = toml::from_str(s).map_err(|e| RthsError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> RthsResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| RthsError::Config(format!("failed to read {}: {}", path.display(), e)))?;
        Self::from_toml_str(&text)
    }

    fn validate(&self) -> RthsResult<()> {
        if self.shader_table_capacity == 0 {
            return Err(RthsError::Config("shader_table_capacity must be positive".to_string()));
        }
        if self.max_lights == 0 || self.max_lights as usize > crate::gpu_types::MAX_LIGHTS {
            return Err(RthsError::Config(format!(
                "max_lights must be within 1..={}",
                crate::gpu_types::MAX_LIGHTS
            )));
        }
        if !self.soft_row_pitch_alignment.is_power_of_two() {
            return Err(RthsError::Config("soft_row_pitch_alignment must be a power of two".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config = EngineConfig::from_toml_str(
            r#"
            backend = "soft"
            shader_table_capacity = 4
            "#,
        )
        .unwrap();
        assert_eq!(config.backend, BackendChoice::Soft);
        assert_eq!(config.shader_table_capacity, 4);
        assert_eq!(config.max_lights, 32);
        assert_eq!(config.soft_row_pitch_alignment, 256);
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(EngineConfig::from_toml_str("max_lights = 64").is_err());
        assert!(EngineConfig::from_toml_str("soft_row_pitch_alignment = 100").is_err());
        assert!(EngineConfig::from_toml_str("backend = \"dx12\"").is_err());
    }
}

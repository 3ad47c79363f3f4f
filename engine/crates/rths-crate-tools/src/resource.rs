use std::path::{Path, PathBuf};

/// 统一资源路径管理
///
/// 所有路径基于工作区根目录（通过 `CARGO_MANIFEST_DIR` 推导）。
///
/// # 使用示例
/// ```ignore
/// let spv = RthsPath::shader_build_path_str("shadow/raygen.rgen"); // shader/.build/shadow/raygen.rgen.spv
/// ```
pub struct RthsPath {}
impl RthsPath {
    /// 获取 `shader/.build/` 目录下的着色器路径（编译后的 SPIR-V）
    pub fn shader_build_path(filename: &str) -> PathBuf {
        let mut path = Self::shader_root_path().join(".build").join(filename).into_os_string();
        path.push(".spv");
        PathBuf::from(path)
    }

    pub fn shader_build_path_str(filename: &str) -> String {
        Self::shader_build_path(filename).to_string_lossy().into_owned()
    }

    /// 获取工作区根目录
    pub fn workspace_path() -> PathBuf {
        // engine/crates/rths-crate-tools -> workspace root
        Path::new(env!("CARGO_MANIFEST_DIR")).ancestors().nth(3).unwrap_or(Path::new(".")).to_path_buf()
    }

    pub fn shader_root_path() -> PathBuf {
        Self::workspace_path().join("shader")
    }

    pub fn shader_src_path() -> PathBuf {
        Self::shader_root_path().join("src")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shader_build_path_appends_spv() {
        let path = RthsPath::shader_build_path_str("shadow/raygen.rgen");
        assert!(path.ends_with("raygen.rgen.spv"));
        assert!(RthsPath::shader_build_path("a.rmiss").starts_with(RthsPath::shader_root_path()));
    }

    #[test]
    fn test_workspace_path_contains_engine() {
        assert!(RthsPath::workspace_path().join("engine").is_dir());
    }
}

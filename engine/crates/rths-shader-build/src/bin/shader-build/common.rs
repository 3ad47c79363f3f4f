//! 编译任务与路径

use std::path::{Path, PathBuf};

use rths_crate_tools::resource::RthsPath;

/// 光追管线用到的 shader 阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShaderStage {
    RayGen,
    Miss,
    ClosestHit,
    AnyHit,
    Intersection,
    Callable,
    Compute,
}

impl ShaderStage {
    /// 根据文件扩展名判断阶段，不认识的文件返回 None
    pub fn from_file_name(name: &str) -> Option<Self> {
        let ext = Path::new(name).extension()?.to_str()?;
        let stage = match ext {
            "rgen" => ShaderStage::RayGen,
            "rmiss" => ShaderStage::Miss,
            "rchit" => ShaderStage::ClosestHit,
            "rahit" => ShaderStage::AnyHit,
            "rint" => ShaderStage::Intersection,
            "rcall" => ShaderStage::Callable,
            "comp" => ShaderStage::Compute,
            _ => return None,
        };
        Some(stage)
    }

    /// glslc 的 `-fshader-stage` 参数
    pub fn glslc_name(self) -> &'static str {
        match self {
            ShaderStage::RayGen => "rgen",
            ShaderStage::Miss => "rmiss",
            ShaderStage::ClosestHit => "rchit",
            ShaderStage::AnyHit => "rahit",
            ShaderStage::Intersection => "rint",
            ShaderStage::Callable => "rcall",
            ShaderStage::Compute => "comp",
        }
    }
}

/// 编译的输入输出目录
pub struct EnvPath;

impl EnvPath {
    pub fn shader_src_path() -> PathBuf {
        RthsPath::shader_src_path()
    }

    /// 运行时从这里加载 SPIR-V
    pub fn shader_build_path() -> PathBuf {
        RthsPath::shader_root_path().join(".build")
    }
}

/// 一个 shader 文件的编译任务
#[derive(Debug)]
pub struct ShaderCompileTask {
    pub shader_path: PathBuf,
    pub output_path: PathBuf,
    pub stage: ShaderStage,
}

impl ShaderCompileTask {
    /// `shader/src/a/b.rgen` 输出到 `shader/.build/a/b.rgen.spv`
    pub fn new(entry: &walkdir::DirEntry) -> Option<Self> {
        Self::with_roots(entry.path(), &EnvPath::shader_src_path(), &EnvPath::shader_build_path())
    }

    fn with_roots(shader_path: &Path, src_root: &Path, build_root: &Path) -> Option<Self> {
        let stage = ShaderStage::from_file_name(shader_path.file_name()?.to_str()?)?;
        let relative = shader_path.strip_prefix(src_root).ok()?;

        let mut output = build_root.join(relative).into_os_string();
        output.push(".spv");

        Some(Self {
            shader_path: shader_path.to_path_buf(),
            output_path: PathBuf::from(output),
            stage,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_mirrors_source_tree() {
        let task = ShaderCompileTask::with_roots(
            Path::new("/ws/shader/src/shadow/hit.rahit"),
            Path::new("/ws/shader/src"),
            Path::new("/ws/shader/.build"),
        )
        .unwrap();
        assert_eq!(task.stage, ShaderStage::AnyHit);
        assert_eq!(task.output_path, Path::new("/ws/shader/.build/shadow/hit.rahit.spv"));
    }

    #[test]
    fn test_headers_are_not_compiled() {
        assert_eq!(ShaderStage::from_file_name("common.glsl"), None);
        assert_eq!(ShaderStage::from_file_name("camera.rmiss"), Some(ShaderStage::Miss));
    }
}

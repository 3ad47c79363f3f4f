//! 调用 glslc (来自 Vulkan SDK) 把 GLSL 编译为 SPIR-V

use anyhow::{Context, bail};

use crate::common::{EnvPath, ShaderCompileTask};

pub fn compile(task: &ShaderCompileTask) -> anyhow::Result<()> {
    let output = std::process::Command::new("glslc")
        .arg(format!("-I{}", EnvPath::shader_src_path().display()))
        .arg(format!("-fshader-stage={}", task.stage.glslc_name()))
        .args([
            "-g",
            "--target-env=vulkan1.3",
            // ray tracing 要求 spv1.4 以上
            "--target-spv=spv1.4",
        ])
        .arg("-o")
        .arg(&task.output_path)
        .arg(&task.shader_path)
        .output()
        .context("failed to execute glslc, is the Vulkan SDK installed?")?;

    if !output.stdout.is_empty() {
        log::info!("stdout: {}", String::from_utf8_lossy(&output.stdout));
    }
    if !output.status.success() {
        bail!("{}", String::from_utf8_lossy(&output.stderr));
    }
    if !output.stderr.is_empty() {
        log::warn!("stderr: {}", String::from_utf8_lossy(&output.stderr));
    }
    Ok(())
}

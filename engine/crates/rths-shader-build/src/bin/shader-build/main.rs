//! Shader 编译工具
//!
//! 把 `shader/src` 下的所有光追 shader 编译为 SPIR-V，输出到 `shader/.build`

mod common;
mod glsl;

use anyhow::Context;
use common::{EnvPath, ShaderCompileTask};
use rayon::prelude::*;
use rths_crate_tools::init_log::init_log;

fn main() -> anyhow::Result<()> {
    init_log();

    log::info!("shader source path: {:?}", EnvPath::shader_src_path());
    log::info!("shader output path: {:?}", EnvPath::shader_build_path());

    let failed = walkdir::WalkDir::new(EnvPath::shader_src_path())
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.path().is_file())
        .filter_map(|entry| ShaderCompileTask::new(&entry))
        .par_bridge()
        .map(|task| {
            log::info!("compiling shader: {:?}", task.shader_path);
            let result = task
                .output_path
                .parent()
                .map_or(Ok(()), std::fs::create_dir_all)
                .context("failed to create the output directory")
                .and_then(|_| glsl::compile(&task));
            if let Err(e) = &result {
                log::error!("{:?}: {:#}", task.shader_path, e);
            }
            result.is_err()
        })
        .filter(|failed| *failed)
        .count();

    if failed > 0 {
        anyhow::bail!("{} shaders failed to compile", failed);
    }
    log::info!("shader compilation completed.");
    Ok(())
}

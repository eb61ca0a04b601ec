// Build script to compile GLSL shaders to SPIR-V
//
// Output goes to OUT_DIR so `include_bytes!` can pick it up. Without glslc
// (Vulkan SDK) the blobs are written empty; the host backend does not need
// them and the Vulkan backend refuses to build pipelines from them.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

fn main() {
    println!("cargo:rerun-if-changed=shaders/");

    let out_dir = PathBuf::from(env::var("OUT_DIR").expect("OUT_DIR is set by cargo"));
    compile_shader("shaders/ff.vert", &out_dir.join("ff.vert.spv"));
    compile_shader("shaders/ff.frag", &out_dir.join("ff.frag.spv"));
}

fn compile_shader(input: &str, output: &Path) {
    let input_path = Path::new(input);

    // Check if glslc is available
    let result = Command::new("glslc")
        .arg("--target-env=vulkan1.3")
        .arg(input_path)
        .arg("-o")
        .arg(output)
        .status();

    match result {
        Ok(status) if status.success() => {
            println!("Compiled {} -> {}", input, output.display());
            return;
        }
        Ok(status) => {
            println!("cargo:warning=Failed to compile {}: exit code {:?}", input, status.code());
        }
        Err(e) => {
            println!("cargo:warning=glslc not found ({}); {} left uncompiled", e, input);
        }
    }

    fs::write(output, []).expect("OUT_DIR is writable");
}

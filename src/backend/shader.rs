// Shader module loading
//
// Shaders arrive as precompiled SPIR-V. build.rs compiles the GLSL sources
// under shaders/ next to themselves; at runtime we read the .spv files.

use anyhow::{Context, Result};
use ash::vk;
use std::io::Cursor;
use std::path::Path;

use crate::error::HarnessError;

const SPIRV_MAGIC: u32 = 0x0723_0203;

pub const VERTEX_SHADER_FILE: &str = "quad.vert.spv";
pub const FRAGMENT_SHADER_FILE: &str = "quad.frag.spv";

/// The two SPIR-V programs the quad pipeline needs.
#[derive(Debug, Clone)]
pub struct ShaderBlobs {
    pub vertex: Vec<u32>,
    pub fragment: Vec<u32>,
}

impl ShaderBlobs {
    /// Read `quad.vert.spv` and `quad.frag.spv` from `dir`.
    pub fn load(dir: &Path) -> Result<Self> {
        Ok(Self {
            vertex: read_spirv_file(&dir.join(VERTEX_SHADER_FILE))?,
            fragment: read_spirv_file(&dir.join(FRAGMENT_SHADER_FILE))?,
        })
    }
}

fn read_spirv_file(path: &Path) -> Result<Vec<u32>> {
    let bytes =
        std::fs::read(path).with_context(|| format!("Failed to read shader {}", path.display()))?;
    parse_spirv(&path.display().to_string(), &bytes)
}

/// Decode a SPIR-V byte stream into words, checking the header magic.
pub fn parse_spirv(name: &str, bytes: &[u8]) -> Result<Vec<u32>> {
    if bytes.len() % 4 != 0 {
        return Err(HarnessError::InvalidSpirv {
            name: name.to_owned(),
            reason: "length is not a multiple of 4",
        }
        .into());
    }

    let words = ash::util::read_spv(&mut Cursor::new(bytes))
        .with_context(|| format!("Failed to decode SPIR-V '{}'", name))?;

    // read_spv byte-swaps big-endian modules, so the first word is native
    if words.first() != Some(&SPIRV_MAGIC) {
        return Err(HarnessError::InvalidSpirv {
            name: name.to_owned(),
            reason: "missing SPIR-V magic number",
        }
        .into());
    }

    Ok(words)
}

pub fn create_shader_module(device: &ash::Device, code: &[u32]) -> Result<vk::ShaderModule> {
    let create_info = vk::ShaderModuleCreateInfo::builder().code(code);

    unsafe { device.create_shader_module(&create_info, None) }
        .context("Failed to create shader module")
}

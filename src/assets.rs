// Fixed scene data: the quad, its uniform block and the texture pixels
//
// The vertex layout here must match shaders/quad.vert.

use anyhow::{Context, Result};
use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec3};
use std::path::Path;

use crate::backend::image::rgba8_byte_len;
use crate::error::HarnessError;

/// Interleaved vertex: position, color, texcoord.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct Vertex {
    pub position: [f32; 2],
    pub color: [f32; 3],
    pub tex_coord: [f32; 2],
}

pub const QUAD_VERTICES: [Vertex; 4] = [
    Vertex {
        position: [-0.5, -0.5],
        color: [1.0, 0.0, 0.0],
        tex_coord: [1.0, 0.0],
    },
    Vertex {
        position: [0.5, -0.5],
        color: [0.0, 1.0, 0.0],
        tex_coord: [0.0, 0.0],
    },
    Vertex {
        position: [0.5, 0.5],
        color: [0.0, 0.0, 1.0],
        tex_coord: [0.0, 1.0],
    },
    Vertex {
        position: [-0.5, 0.5],
        color: [1.0, 1.0, 1.0],
        tex_coord: [1.0, 1.0],
    },
];

/// Two triangles, clockwise in screen space.
pub const QUAD_INDICES: [u16; 6] = [0, 1, 2, 2, 3, 0];

/// std140 uniform block read by the vertex shader.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct UniformBufferObject {
    pub model: Mat4,
    pub view: Mat4,
    pub proj: Mat4,
}

impl UniformBufferObject {
    /// The harness's fixed transform: quad scaled by 2, identity camera.
    pub fn fixed() -> Self {
        Self {
            model: Mat4::from_scale(Vec3::new(2.0, 2.0, 2.0)),
            view: Mat4::IDENTITY,
            proj: Mat4::IDENTITY,
        }
    }
}

/// Decoded RGBA8 pixels for the one texture.
#[derive(Debug, Clone)]
pub struct TextureData {
    pub pixels: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

impl TextureData {
    pub fn from_rgba8(pixels: Vec<u8>, width: u32, height: u32) -> Result<Self> {
        let expected = rgba8_byte_len(width, height);
        if width == 0 || height == 0 || pixels.len() != expected {
            return Err(HarnessError::TextureSizeMismatch {
                width,
                height,
                expected,
                actual: pixels.len(),
            }
            .into());
        }

        Ok(Self {
            pixels,
            width,
            height,
        })
    }

    /// Decode a PNG file into RGBA8.
    pub fn load_png(path: &Path) -> Result<Self> {
        let decoded = image::open(path)
            .with_context(|| format!("Failed to load texture {}", path.display()))?
            .to_rgba8();
        let (width, height) = decoded.dimensions();

        log::info!("Loaded texture {} ({}x{})", path.display(), width, height);
        Self::from_rgba8(decoded.into_raw(), width, height)
    }

    /// Two-color checkerboard with `cell`-pixel squares.
    pub fn checkerboard(size: u32, cell: u32) -> Self {
        let cell = cell.max(1);
        let mut pixels = Vec::with_capacity(rgba8_byte_len(size, size));
        for y in 0..size {
            for x in 0..size {
                let light = ((x / cell) + (y / cell)) % 2 == 0;
                let texel = if light {
                    [230, 230, 230, 255]
                } else {
                    [40, 40, 40, 255]
                };
                pixels.extend_from_slice(&texel);
            }
        }

        Self {
            pixels,
            width: size,
            height: size,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vertex_is_tightly_packed() {
        assert_eq!(std::mem::size_of::<Vertex>(), 7 * 4);
        assert_eq!(std::mem::offset_of!(Vertex, color), 8);
        assert_eq!(std::mem::offset_of!(Vertex, tex_coord), 20);
    }

    #[test]
    fn indices_cover_every_vertex() {
        for i in 0..QUAD_VERTICES.len() as u16 {
            assert!(QUAD_INDICES.contains(&i));
        }
        assert!(QUAD_INDICES
            .iter()
            .all(|&i| (i as usize) < QUAD_VERTICES.len()));
    }

    #[test]
    fn uniform_block_is_three_matrices() {
        assert_eq!(std::mem::size_of::<UniformBufferObject>(), 3 * 64);

        let ubo = UniformBufferObject::fixed();
        let corner = ubo.model.transform_point3(Vec3::new(0.5, 0.5, 0.0));
        assert_eq!(corner, Vec3::new(1.0, 1.0, 0.0));
        assert_eq!(ubo.view, Mat4::IDENTITY);
        assert_eq!(ubo.proj, Mat4::IDENTITY);
    }

    #[test]
    fn rgba8_length_is_checked() {
        assert!(TextureData::from_rgba8(vec![0; 16], 2, 2).is_ok());

        let err = TextureData::from_rgba8(vec![0; 15], 2, 2).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<HarnessError>(),
            Some(HarnessError::TextureSizeMismatch { expected: 16, actual: 15, .. })
        ));

        assert!(TextureData::from_rgba8(vec![], 0, 0).is_err());
    }

    #[test]
    fn checkerboard_alternates() {
        let board = TextureData::checkerboard(4, 2);
        assert_eq!(board.pixels.len(), 4 * 4 * 4);

        let texel = |x: usize, y: usize| board.pixels[(y * 4 + x) * 4];
        assert_eq!(texel(0, 0), texel(1, 1));
        assert_ne!(texel(0, 0), texel(2, 0));
        assert_eq!(texel(0, 0), texel(2, 2));
    }

    #[test]
    fn missing_png_is_an_error() {
        assert!(TextureData::load_png(Path::new("/nonexistent/texture.png")).is_err());
    }
}

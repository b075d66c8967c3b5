//! Vertex format and mesh import
//!
//! Geometry is a flat, non-indexed triangle list of [`Vertex`] records. The
//! frame core only needs the vertex count and the raw bytes to upload.

use std::path::{Path, PathBuf};

use ash::vk;
use bytemuck::{Pod, Zeroable};
use thiserror::Error;

/// Mesh import errors
#[derive(Error, Debug)]
pub enum MeshError {
    /// OBJ parser rejected the file
    #[error("Failed to load OBJ {path:?}: {source}")]
    Load {
        /// File being loaded
        path: PathBuf,
        /// Parser error
        #[source]
        source: tobj::LoadError,
    },

    /// File parsed but contained no triangles
    #[error("OBJ {0:?} contains no geometry")]
    Empty(PathBuf),
}

/// One vertex as laid out in the vertex buffer
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct Vertex {
    /// Object-space position
    pub position: [f32; 3],
    /// Object-space normal
    pub normal: [f32; 3],
    /// Vertex color
    pub color: [f32; 3],
}

impl Vertex {
    const NORMAL_OFFSET: u32 = 12;
    const COLOR_OFFSET: u32 = 24;

    /// Per-vertex input binding 0
    pub fn binding_description() -> vk::VertexInputBindingDescription {
        vk::VertexInputBindingDescription {
            binding: 0,
            stride: std::mem::size_of::<Self>() as u32,
            input_rate: vk::VertexInputRate::VERTEX,
        }
    }

    /// Position, normal and color at locations 0, 1 and 2
    pub fn attribute_descriptions() -> [vk::VertexInputAttributeDescription; 3] {
        [
            vk::VertexInputAttributeDescription {
                location: 0,
                binding: 0,
                format: vk::Format::R32G32B32_SFLOAT,
                offset: 0,
            },
            vk::VertexInputAttributeDescription {
                location: 1,
                binding: 0,
                format: vk::Format::R32G32B32_SFLOAT,
                offset: Self::NORMAL_OFFSET,
            },
            vk::VertexInputAttributeDescription {
                location: 2,
                binding: 0,
                format: vk::Format::R32G32B32_SFLOAT,
                offset: Self::COLOR_OFFSET,
            },
        ]
    }
}

/// CPU-side geometry ready for upload
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Mesh {
    /// Triangle-list vertices
    pub vertices: Vec<Vertex>,
}

impl Mesh {
    /// Single green triangle in the XY plane
    pub fn triangle() -> Self {
        let color = [0.0, 1.0, 0.0];
        let normal = [0.0, 0.0, 1.0];
        Self {
            vertices: vec![
                Vertex { position: [1.0, 1.0, 0.0], normal, color },
                Vertex { position: [-1.0, 1.0, 0.0], normal, color },
                Vertex { position: [0.0, -1.0, 0.0], normal, color },
            ],
        }
    }

    /// Load every shape of an OBJ file into one triangle list
    ///
    /// Faces are triangulated and indices expanded. Normals double as vertex
    /// colors so unlit pipelines still show surface shape.
    pub fn load_from_obj(path: impl AsRef<Path>) -> Result<Self, MeshError> {
        let path = path.as_ref();
        let (models, _materials) = tobj::load_obj(path, &tobj::GPU_LOAD_OPTIONS)
            .map_err(|source| MeshError::Load { path: path.to_path_buf(), source })?;

        let mut vertices = Vec::new();
        for model in &models {
            let mesh = &model.mesh;
            for &index in &mesh.indices {
                let i = index as usize;
                let position = [
                    mesh.positions[3 * i],
                    mesh.positions[3 * i + 1],
                    mesh.positions[3 * i + 2],
                ];
                let normal = if mesh.normals.len() >= 3 * i + 3 {
                    [mesh.normals[3 * i], mesh.normals[3 * i + 1], mesh.normals[3 * i + 2]]
                } else {
                    [0.0, 0.0, 1.0]
                };
                vertices.push(Vertex { position, normal, color: normal });
            }
        }

        if vertices.is_empty() {
            return Err(MeshError::Empty(path.to_path_buf()));
        }
        log::info!("Loaded {} vertices from {}", vertices.len(), path.display());
        Ok(Self { vertices })
    }

    /// Number of vertices
    pub fn vertex_count(&self) -> u32 {
        u32::try_from(self.vertices.len()).unwrap_or(u32::MAX)
    }

    /// Raw bytes for upload
    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.vertices)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_vertex_layout() {
        assert_eq!(std::mem::size_of::<Vertex>(), 36);
        assert_eq!(Vertex::binding_description().stride, 36);
        let attributes = Vertex::attribute_descriptions();
        assert_eq!(attributes[1].offset, 12);
        assert_eq!(attributes[2].offset, 24);
    }

    #[test]
    fn test_triangle_bytes() {
        let mesh = Mesh::triangle();
        assert_eq!(mesh.vertex_count(), 3);
        assert_eq!(mesh.as_bytes().len(), 3 * 36);
    }

    #[test]
    fn test_load_quad_from_obj() {
        let path = std::env::temp_dir().join(format!("frame_core_quad_{}.obj", std::process::id()));
        {
            let mut file = std::fs::File::create(&path).unwrap();
            writeln!(file, "v 0 0 0\nv 1 0 0\nv 1 1 0\nv 0 1 0").unwrap();
            writeln!(file, "vn 0 0 1").unwrap();
            writeln!(file, "f 1//1 2//1 3//1 4//1").unwrap();
        }

        let mesh = Mesh::load_from_obj(&path).unwrap();
        std::fs::remove_file(&path).ok();

        // One quad triangulates into two triangles
        assert_eq!(mesh.vertex_count(), 6);
        assert!(mesh.vertices.iter().all(|v| v.normal == [0.0, 0.0, 1.0]));
        assert!(mesh.vertices.iter().all(|v| v.color == v.normal));
    }

    #[test]
    fn test_missing_obj_is_error() {
        let result = Mesh::load_from_obj("definitely/not/here.obj");
        assert!(matches!(result, Err(MeshError::Load { .. })));
    }
}

//! Per-frame scene data and the GPU-side block layouts it is written as

use bytemuck::{Pod, Zeroable};
use nalgebra::{Matrix4, Perspective3, Vector3};

use crate::config::Extent;
use crate::registry::{GeometryHandle, MaterialHandle};

/// One object to draw this frame
#[derive(Debug, Clone, PartialEq)]
pub struct RenderableEntry {
    /// Vertex data
    pub geometry: GeometryHandle,
    /// Pipeline + layout
    pub material: MaterialHandle,
    /// Object-to-world transform
    pub transform: Matrix4<f32>,
}

impl RenderableEntry {
    /// Create an entry
    pub fn new(geometry: GeometryHandle, material: MaterialHandle, transform: Matrix4<f32>) -> Self {
        Self { geometry, material, transform }
    }
}

/// Camera block, one per frame slot
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct GpuCameraData {
    /// World to view
    pub view: [[f32; 4]; 4],
    /// View to clip
    pub proj: [[f32; 4]; 4],
    /// World to clip
    pub viewproj: [[f32; 4]; 4],
}

/// Scene-wide shading parameters, replicated once per frame slot
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct GpuSceneData {
    /// Fog color (w is the exponent)
    pub fog_color: [f32; 4],
    /// Fog start / end in x / y
    pub fog_distances: [f32; 4],
    /// Ambient light color
    pub ambient_color: [f32; 4],
    /// Sun direction (w is the power)
    pub sunlight_direction: [f32; 4],
    /// Sun color
    pub sunlight_color: [f32; 4],
}

/// Per-object entry of the storage buffer, indexed by draw instance
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct GpuObjectData {
    /// Object-to-world transform
    pub model: [[f32; 4]; 4],
}

/// Constants pushed inline before every draw
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct MeshPushConstants {
    /// Free-form per-draw data
    pub data: [f32; 4],
    /// Object transform
    pub render_matrix: [[f32; 4]; 4],
}

impl MeshPushConstants {
    /// Constants for an object with `transform`
    pub fn from_transform(transform: &Matrix4<f32>) -> Self {
        Self {
            data: [0.0; 4],
            render_matrix: (*transform).into(),
        }
    }
}

/// Fixed camera placement used to build the per-frame camera block
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CameraPolicy {
    /// Camera translation applied to the world
    pub position: Vector3<f32>,
    /// Vertical field of view in degrees
    pub fov_y_degrees: f32,
    /// Near clip plane
    pub near: f32,
    /// Far clip plane
    pub far: f32,
}

impl Default for CameraPolicy {
    fn default() -> Self {
        Self {
            position: Vector3::new(0.0, -6.0, -10.0),
            fov_y_degrees: 70.0,
            near: 0.1,
            far: 200.0,
        }
    }
}

impl CameraPolicy {
    /// World-to-view matrix
    pub fn view(&self) -> Matrix4<f32> {
        Matrix4::new_translation(&self.position)
    }

    /// View-to-clip matrix with Y flipped for Vulkan clip space
    pub fn projection(&self, extent: Extent) -> Matrix4<f32> {
        let mut projection = Perspective3::new(
            extent.aspect_ratio(),
            self.fov_y_degrees.to_radians(),
            self.near,
            self.far,
        )
        .to_homogeneous();
        projection[(1, 1)] *= -1.0;
        projection
    }

    /// Camera block for a frame rendered at `extent`
    pub fn camera_data(&self, extent: Extent) -> GpuCameraData {
        let view = self.view();
        let proj = self.projection(extent);
        GpuCameraData {
            view: view.into(),
            proj: proj.into(),
            viewproj: (proj * view).into(),
        }
    }
}

/// Scene parameters written into the slot's scene replica
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SceneParameters {
    data: GpuSceneData,
}

impl SceneParameters {
    /// Ambient color slowly cycling with the frame number
    pub fn animated(frame_number: u64) -> Self {
        let framed = frame_number as f32 / 120.0;
        Self {
            data: GpuSceneData {
                fog_color: [0.0; 4],
                fog_distances: [0.0; 4],
                ambient_color: [framed.sin(), 0.0, framed.cos(), 1.0],
                sunlight_direction: [0.0, -1.0, 0.0, 1.0],
                sunlight_color: [1.0, 1.0, 1.0, 1.0],
            },
        }
    }

    /// GPU representation
    pub fn gpu_data(&self) -> GpuSceneData {
        self.data
    }
}

/// Clear color flashing blue with a period of `period` frames
pub fn flash_clear_color(frame_number: u64, period: u32) -> [f32; 4] {
    let flash = (frame_number as f32 / period.max(1) as f32).sin().abs();
    [0.0, 0.0, flash, 1.0]
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::Vector4;

    #[test]
    fn test_block_sizes_match_shader_layout() {
        assert_eq!(std::mem::size_of::<GpuSceneData>(), 80);
        assert_eq!(std::mem::size_of::<GpuCameraData>(), 192);
        assert_eq!(std::mem::size_of::<GpuObjectData>(), 64);
        assert_eq!(std::mem::size_of::<MeshPushConstants>(), 80);
    }

    #[test]
    fn test_viewproj_is_product() {
        let camera = CameraPolicy::default();
        let extent = Extent::new(1700, 900);
        let data = camera.camera_data(extent);
        let expected: [[f32; 4]; 4] = (camera.projection(extent) * camera.view()).into();
        assert_eq!(data.viewproj, expected);
    }

    #[test]
    fn test_projection_flips_y() {
        let camera = CameraPolicy::default();
        let projection = camera.projection(Extent::new(800, 800));
        assert!(projection[(1, 1)] < 0.0);
        assert_relative_eq!(projection[(0, 0)], -projection[(1, 1)], epsilon = 1e-6);
    }

    #[test]
    fn test_view_translates_world() {
        let camera = CameraPolicy::default();
        let origin = camera.view() * Vector4::new(0.0, 0.0, 0.0, 1.0);
        assert_relative_eq!(origin, Vector4::new(0.0, -6.0, -10.0, 1.0));
    }

    #[test]
    fn test_animated_ambient() {
        let start = SceneParameters::animated(0).gpu_data();
        assert_eq!(start.ambient_color, [0.0, 0.0, 1.0, 1.0]);

        let later = SceneParameters::animated(120).gpu_data();
        assert_relative_eq!(later.ambient_color[0], 1.0_f32.sin());
        assert_relative_eq!(later.ambient_color[2], 1.0_f32.cos());
    }

    #[test]
    fn test_clear_color_flash() {
        assert_eq!(flash_clear_color(0, 120), [0.0, 0.0, 0.0, 1.0]);
        let color = flash_clear_color(60, 120);
        assert_relative_eq!(color[2], 0.5_f32.sin());
    }
}

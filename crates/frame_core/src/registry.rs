//! Name-keyed lookup of materials and geometry
//!
//! Entries are created during scene setup and only read while drawing. The
//! registry is an owned value handed by reference to whoever needs lookups;
//! it has no side effects beyond its own tables.
//!
//! Registering the same name twice is rejected with
//! [`RegistryError::DuplicateName`] rather than silently replacing the earlier
//! entry. Handles already handed out therefore never change meaning.

use std::collections::HashMap;

use crate::error::{EntryKind, RegistryError};
use crate::gpu::{BufferId, PipelineId, PipelineLayoutId};

/// Handle to a registered material
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MaterialHandle(pub u32);

/// Handle to a registered geometry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GeometryHandle(pub u32);

/// Pipeline + layout pair a draw is shaded with
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MaterialEntry {
    /// Registered name
    pub name: String,
    /// Graphics pipeline
    pub pipeline: PipelineId,
    /// Layout used for descriptor binds and push constants
    pub layout: PipelineLayoutId,
}

/// Vertex data a draw reads
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeometryEntry {
    /// Registered name
    pub name: String,
    /// GPU-visible vertex buffer
    pub vertex_buffer: BufferId,
    /// Number of vertices to draw
    pub vertex_count: u32,
}

/// Owned table of named materials and geometry
#[derive(Debug, Default)]
pub struct ResourceRegistry {
    materials: Vec<MaterialEntry>,
    material_names: HashMap<String, MaterialHandle>,
    geometry: Vec<GeometryEntry>,
    geometry_names: HashMap<String, GeometryHandle>,
}

impl ResourceRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a material under a unique name
    pub fn add_material(
        &mut self,
        name: impl Into<String>,
        pipeline: PipelineId,
        layout: PipelineLayoutId,
    ) -> Result<MaterialHandle, RegistryError> {
        let name = name.into();
        if self.material_names.contains_key(&name) {
            return Err(RegistryError::DuplicateName { kind: EntryKind::Material, name });
        }

        let handle = MaterialHandle(next_index(self.materials.len()));
        self.material_names.insert(name.clone(), handle);
        self.materials.push(MaterialEntry { name, pipeline, layout });
        log::debug!("Registered material {handle:?}");
        Ok(handle)
    }

    /// Register a geometry under a unique name
    pub fn add_geometry(
        &mut self,
        name: impl Into<String>,
        vertex_buffer: BufferId,
        vertex_count: u32,
    ) -> Result<GeometryHandle, RegistryError> {
        let name = name.into();
        if self.geometry_names.contains_key(&name) {
            return Err(RegistryError::DuplicateName { kind: EntryKind::Geometry, name });
        }

        let handle = GeometryHandle(next_index(self.geometry.len()));
        self.geometry_names.insert(name.clone(), handle);
        self.geometry.push(GeometryEntry { name, vertex_buffer, vertex_count });
        log::debug!("Registered geometry {handle:?} ({vertex_count} vertices)");
        Ok(handle)
    }

    /// Look up a material handle by name
    pub fn get_material(&self, name: &str) -> Option<MaterialHandle> {
        self.material_names.get(name).copied()
    }

    /// Look up a geometry handle by name
    pub fn get_geometry(&self, name: &str) -> Option<GeometryHandle> {
        self.geometry_names.get(name).copied()
    }

    /// Resolve a material handle
    pub fn material(&self, handle: MaterialHandle) -> Option<&MaterialEntry> {
        self.materials.get(handle.0 as usize)
    }

    /// Resolve a geometry handle
    pub fn geometry(&self, handle: GeometryHandle) -> Option<&GeometryEntry> {
        self.geometry.get(handle.0 as usize)
    }

    /// Number of registered materials
    pub fn material_count(&self) -> usize {
        self.materials.len()
    }

    /// Number of registered geometries
    pub fn geometry_count(&self) -> usize {
        self.geometry.len()
    }
}

fn next_index(len: usize) -> u32 {
    u32::try_from(len).unwrap_or(u32::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::ResourceArena;

    fn handles() -> (PipelineId, PipelineLayoutId, BufferId) {
        let mut arena = ResourceArena::new();
        (
            PipelineId(arena.insert(())),
            PipelineLayoutId(arena.insert(())),
            BufferId(arena.insert(())),
        )
    }

    #[test]
    fn test_missing_lookup_is_not_found() {
        let registry = ResourceRegistry::new();
        assert_eq!(registry.get_material("missing"), None);
        assert_eq!(registry.get_geometry("missing"), None);
        assert!(registry.material(MaterialHandle(3)).is_none());
    }

    #[test]
    fn test_add_then_get_returns_same_handle() {
        let (pipeline, layout, buffer) = handles();
        let mut registry = ResourceRegistry::new();

        let material = registry.add_material("m", pipeline, layout).unwrap();
        assert_eq!(registry.get_material("m"), Some(material));
        let entry = registry.material(material).unwrap();
        assert_eq!(entry.pipeline, pipeline);
        assert_eq!(entry.layout, layout);

        let geometry = registry.add_geometry("g", buffer, 3).unwrap();
        assert_eq!(registry.get_geometry("g"), Some(geometry));
        assert_eq!(registry.geometry(geometry).unwrap().vertex_count, 3);
    }

    #[test]
    fn test_duplicate_name_is_rejected_and_original_kept() {
        let (pipeline, layout, buffer) = handles();
        let mut registry = ResourceRegistry::new();
        let first = registry.add_material("m", pipeline, layout).unwrap();

        let err = registry.add_material("m", pipeline, layout).unwrap_err();
        assert_eq!(
            err,
            RegistryError::DuplicateName { kind: EntryKind::Material, name: "m".to_string() }
        );
        assert_eq!(registry.get_material("m"), Some(first));
        assert_eq!(registry.material_count(), 1);

        registry.add_geometry("g", buffer, 3).unwrap();
        assert!(registry.add_geometry("g", buffer, 6).is_err());
        assert_eq!(registry.geometry_count(), 1);
    }

    #[test]
    fn test_materials_and_geometry_have_separate_namespaces() {
        let (pipeline, layout, buffer) = handles();
        let mut registry = ResourceRegistry::new();
        registry.add_material("triangle", pipeline, layout).unwrap();
        assert!(registry.add_geometry("triangle", buffer, 3).is_ok());
    }
}

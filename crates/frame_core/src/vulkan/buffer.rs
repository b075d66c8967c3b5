//! Host-visible buffers and device memory helpers

use std::ffi::c_void;

use ash::{vk, Device};

use crate::error::{GpuError, GpuResult};
use crate::gpu::BufferUsage;

/// Index of a memory type allowed by `type_filter` with all of `properties`
pub fn find_memory_type(
    memory_properties: &vk::PhysicalDeviceMemoryProperties,
    type_filter: u32,
    properties: vk::MemoryPropertyFlags,
) -> GpuResult<u32> {
    (0..memory_properties.memory_type_count)
        .find(|&index| {
            type_filter & (1 << index) != 0
                && memory_properties.memory_types[index as usize]
                    .property_flags
                    .contains(properties)
        })
        .ok_or_else(|| GpuError::InvalidOperation(format!("no memory type with {properties:?}")))
}

/// Vulkan usage flags for a buffer role
pub fn usage_flags(usage: BufferUsage) -> vk::BufferUsageFlags {
    match usage {
        BufferUsage::Uniform => vk::BufferUsageFlags::UNIFORM_BUFFER,
        BufferUsage::Storage => vk::BufferUsageFlags::STORAGE_BUFFER,
        BufferUsage::Vertex => vk::BufferUsageFlags::VERTEX_BUFFER,
    }
}

/// Buffer plus the memory bound to it
///
/// Not RAII: the owning device destroys it through [`AllocatedBuffer::destroy`]
/// when its deletion-queue action runs.
#[derive(Debug, Clone, Copy)]
pub struct AllocatedBuffer {
    /// Buffer handle
    pub buffer: vk::Buffer,
    /// Backing memory
    pub memory: vk::DeviceMemory,
    /// Requested size in bytes
    pub size: vk::DeviceSize,
    /// Role it was created for
    pub usage: BufferUsage,
}

impl AllocatedBuffer {
    /// Create a host-visible, host-coherent buffer
    pub fn new(
        device: &Device,
        memory_properties: &vk::PhysicalDeviceMemoryProperties,
        size: vk::DeviceSize,
        usage: BufferUsage,
    ) -> GpuResult<Self> {
        let buffer_info = vk::BufferCreateInfo::builder()
            .size(size)
            .usage(usage_flags(usage))
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let buffer = unsafe { device.create_buffer(&buffer_info, None)? };

        let requirements = unsafe { device.get_buffer_memory_requirements(buffer) };
        let memory_type_index = match find_memory_type(
            memory_properties,
            requirements.memory_type_bits,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        ) {
            Ok(index) => index,
            Err(err) => {
                unsafe { device.destroy_buffer(buffer, None) };
                return Err(err);
            }
        };

        let alloc_info = vk::MemoryAllocateInfo::builder()
            .allocation_size(requirements.size)
            .memory_type_index(memory_type_index);
        let memory = match unsafe { device.allocate_memory(&alloc_info, None) } {
            Ok(memory) => memory,
            Err(result) => {
                unsafe { device.destroy_buffer(buffer, None) };
                return Err(result.into());
            }
        };

        if let Err(result) = unsafe { device.bind_buffer_memory(buffer, memory, 0) } {
            unsafe {
                device.destroy_buffer(buffer, None);
                device.free_memory(memory, None);
            }
            return Err(result.into());
        }

        Ok(Self {
            buffer,
            memory,
            size,
            usage,
        })
    }

    /// Copy `data` to `offset`, mapping only for the duration of the copy
    pub fn write(&self, device: &Device, offset: vk::DeviceSize, data: &[u8]) -> GpuResult<()> {
        let len = data.len() as vk::DeviceSize;
        if offset.checked_add(len).map_or(true, |end| end > self.size) {
            return Err(GpuError::InvalidOperation(format!(
                "write of {len} bytes at offset {offset} overflows {}-byte buffer",
                self.size
            )));
        }
        if data.is_empty() {
            return Ok(());
        }

        let mapped = MappedMemory::map(device, self.memory, offset, len)?;
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), mapped.ptr.cast::<u8>(), data.len());
        }
        Ok(())
    }

    /// Free the buffer and its memory
    ///
    /// # Safety
    /// No pending GPU work may reference the buffer.
    pub unsafe fn destroy(self, device: &Device) {
        device.destroy_buffer(self.buffer, None);
        device.free_memory(self.memory, None);
    }
}

/// Mapped memory range, unmapped on drop
struct MappedMemory<'a> {
    device: &'a Device,
    memory: vk::DeviceMemory,
    ptr: *mut c_void,
}

impl<'a> MappedMemory<'a> {
    fn map(device: &'a Device, memory: vk::DeviceMemory, offset: vk::DeviceSize, size: vk::DeviceSize) -> GpuResult<Self> {
        let ptr = unsafe { device.map_memory(memory, offset, size, vk::MemoryMapFlags::empty())? };
        Ok(Self { device, memory, ptr })
    }
}

impl Drop for MappedMemory<'_> {
    fn drop(&mut self) {
        unsafe { self.device.unmap_memory(self.memory) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_properties(types: &[vk::MemoryPropertyFlags]) -> vk::PhysicalDeviceMemoryProperties {
        let mut properties = vk::PhysicalDeviceMemoryProperties::default();
        properties.memory_type_count = types.len() as u32;
        for (slot, &flags) in properties.memory_types.iter_mut().zip(types) {
            slot.property_flags = flags;
        }
        properties
    }

    #[test]
    fn test_find_memory_type_respects_filter_and_flags() {
        let host = vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT;
        let properties = memory_properties(&[vk::MemoryPropertyFlags::DEVICE_LOCAL, host, host]);

        assert_eq!(find_memory_type(&properties, 0b111, host), Ok(1));
        // Type 1 filtered out by the resource
        assert_eq!(find_memory_type(&properties, 0b101, host), Ok(2));
        assert!(find_memory_type(&properties, 0b001, host).is_err());
    }

    #[test]
    fn test_usage_flags() {
        assert_eq!(usage_flags(BufferUsage::Uniform), vk::BufferUsageFlags::UNIFORM_BUFFER);
        assert_eq!(usage_flags(BufferUsage::Storage), vk::BufferUsageFlags::STORAGE_BUFFER);
        assert_eq!(usage_flags(BufferUsage::Vertex), vk::BufferUsageFlags::VERTEX_BUFFER);
    }
}

//! Swapchain images and the depth attachment that accompanies them

use ash::extensions::khr::{Surface, Swapchain as SwapchainLoader};
use ash::{vk, Device};

use super::buffer::find_memory_type;
use super::context::PhysicalDeviceInfo;
use crate::error::FrameError;

/// Depth format used by the frame render pass
pub const DEPTH_FORMAT: vk::Format = vk::Format::D32_SFLOAT;

/// Vsync; the only mode every implementation must support
const PRESENT_MODE: vk::PresentModeKHR = vk::PresentModeKHR::FIFO;

fn setup_error(what: &'static str) -> impl FnOnce(vk::Result) -> FrameError {
    move |result| FrameError::Setup(format!("{what}: {result:?}"))
}

fn choose_surface_format(formats: &[vk::SurfaceFormatKHR]) -> Option<vk::SurfaceFormatKHR> {
    formats
        .iter()
        .find(|sf| sf.format == vk::Format::B8G8R8A8_SRGB && sf.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR)
        .or_else(|| formats.first())
        .copied()
}

fn choose_extent(caps: &vk::SurfaceCapabilitiesKHR, window_extent: vk::Extent2D) -> vk::Extent2D {
    if caps.current_extent.width != u32::MAX {
        return caps.current_extent;
    }
    vk::Extent2D {
        width: window_extent
            .width
            .clamp(caps.min_image_extent.width, caps.max_image_extent.width),
        height: window_extent
            .height
            .clamp(caps.min_image_extent.height, caps.max_image_extent.height),
    }
}

fn choose_image_count(caps: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let desired = caps.min_image_count + 1;
    if caps.max_image_count > 0 {
        desired.min(caps.max_image_count)
    } else {
        desired
    }
}

fn create_image_view(
    device: &Device,
    image: vk::Image,
    format: vk::Format,
    aspect: vk::ImageAspectFlags,
) -> Result<vk::ImageView, vk::Result> {
    let create_info = vk::ImageViewCreateInfo::builder()
        .image(image)
        .view_type(vk::ImageViewType::TYPE_2D)
        .format(format)
        .subresource_range(vk::ImageSubresourceRange {
            aspect_mask: aspect,
            base_mip_level: 0,
            level_count: 1,
            base_array_layer: 0,
            layer_count: 1,
        });
    unsafe { device.create_image_view(&create_info, None) }
}

/// Presentable images and their views
pub struct Swapchain {
    device: Device,
    loader: SwapchainLoader,
    swapchain: vk::SwapchainKHR,
    images: Vec<vk::Image>,
    image_views: Vec<vk::ImageView>,
    format: vk::SurfaceFormatKHR,
    extent: vk::Extent2D,
}

impl Swapchain {
    /// Build a swapchain for `surface` sized to `window_extent` when the surface allows it
    pub fn new(
        device: &Device,
        loader: &SwapchainLoader,
        surface: vk::SurfaceKHR,
        surface_loader: &Surface,
        physical: &PhysicalDeviceInfo,
        window_extent: vk::Extent2D,
    ) -> Result<Self, FrameError> {
        let caps = unsafe { surface_loader.get_physical_device_surface_capabilities(physical.device, surface) }
            .map_err(setup_error("Failed to query surface capabilities"))?;
        let formats = unsafe { surface_loader.get_physical_device_surface_formats(physical.device, surface) }
            .map_err(setup_error("Failed to query surface formats"))?;

        let format = choose_surface_format(&formats)
            .ok_or_else(|| FrameError::Setup("Surface reports no formats".to_string()))?;
        let extent = choose_extent(&caps, window_extent);
        let image_count = choose_image_count(&caps);

        let families = [physical.graphics_family, physical.present_family];
        let mut create_info = vk::SwapchainCreateInfoKHR::builder()
            .surface(surface)
            .min_image_count(image_count)
            .image_format(format.format)
            .image_color_space(format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .pre_transform(caps.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(PRESENT_MODE)
            .clipped(true);
        create_info = if physical.graphics_family == physical.present_family {
            create_info.image_sharing_mode(vk::SharingMode::EXCLUSIVE)
        } else {
            create_info
                .image_sharing_mode(vk::SharingMode::CONCURRENT)
                .queue_family_indices(&families)
        };

        let swapchain = unsafe { loader.create_swapchain(&create_info, None) }
            .map_err(setup_error("Failed to create swapchain"))?;

        // From here on Drop owns cleanup of whatever was created
        let mut this = Self {
            device: device.clone(),
            loader: loader.clone(),
            swapchain,
            images: Vec::new(),
            image_views: Vec::new(),
            format,
            extent,
        };

        this.images = unsafe { loader.get_swapchain_images(swapchain) }
            .map_err(setup_error("Failed to get swapchain images"))?;
        for &image in &this.images {
            let view = create_image_view(device, image, format.format, vk::ImageAspectFlags::COLOR)
                .map_err(setup_error("Failed to create swapchain image view"))?;
            this.image_views.push(view);
        }

        log::info!(
            "Swapchain: {} images, {}x{}, {:?}, {:?}",
            this.images.len(),
            extent.width,
            extent.height,
            format.format,
            PRESENT_MODE
        );
        Ok(this)
    }

    /// Swapchain handle
    pub fn handle(&self) -> vk::SwapchainKHR {
        self.swapchain
    }

    /// Extension loader used for acquire and present
    pub fn loader(&self) -> &SwapchainLoader {
        &self.loader
    }

    /// Image views, one per presentable image
    pub fn image_views(&self) -> &[vk::ImageView] {
        &self.image_views
    }

    /// Color format of the images
    pub fn format(&self) -> vk::Format {
        self.format.format
    }

    /// Image extent
    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }
}

impl Drop for Swapchain {
    fn drop(&mut self) {
        unsafe {
            for &view in &self.image_views {
                self.device.destroy_image_view(view, None);
            }
            self.loader.destroy_swapchain(self.swapchain, None);
        }
    }
}

/// Depth image sized to the swapchain
pub struct DepthImage {
    device: Device,
    image: vk::Image,
    memory: vk::DeviceMemory,
    view: vk::ImageView,
}

impl DepthImage {
    /// Allocate a device-local `D32_SFLOAT` attachment
    pub fn new(device: &Device, physical: &PhysicalDeviceInfo, extent: vk::Extent2D) -> Result<Self, FrameError> {
        let image_info = vk::ImageCreateInfo::builder()
            .image_type(vk::ImageType::TYPE_2D)
            .format(DEPTH_FORMAT)
            .extent(vk::Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);

        let image = unsafe { device.create_image(&image_info, None) }.map_err(setup_error("Failed to create depth image"))?;
        let mut this = Self {
            device: device.clone(),
            image,
            memory: vk::DeviceMemory::null(),
            view: vk::ImageView::null(),
        };

        let requirements = unsafe { device.get_image_memory_requirements(image) };
        let memory_type_index = find_memory_type(
            &physical.memory_properties,
            requirements.memory_type_bits,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        )
        .map_err(|err| FrameError::Setup(format!("Depth image memory: {err}")))?;
        let alloc_info = vk::MemoryAllocateInfo::builder()
            .allocation_size(requirements.size)
            .memory_type_index(memory_type_index);
        this.memory = unsafe { device.allocate_memory(&alloc_info, None) }
            .map_err(setup_error("Failed to allocate depth memory"))?;
        unsafe { device.bind_image_memory(image, this.memory, 0) }.map_err(setup_error("Failed to bind depth memory"))?;

        this.view = create_image_view(device, image, DEPTH_FORMAT, vk::ImageAspectFlags::DEPTH)
            .map_err(setup_error("Failed to create depth image view"))?;
        Ok(this)
    }

    /// Depth attachment view
    pub fn view(&self) -> vk::ImageView {
        self.view
    }
}

impl Drop for DepthImage {
    fn drop(&mut self) {
        unsafe {
            if self.view != vk::ImageView::null() {
                self.device.destroy_image_view(self.view, None);
            }
            self.device.destroy_image(self.image, None);
            if self.memory != vk::DeviceMemory::null() {
                self.device.free_memory(self.memory, None);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps(current: (u32, u32), min_count: u32, max_count: u32) -> vk::SurfaceCapabilitiesKHR {
        vk::SurfaceCapabilitiesKHR {
            current_extent: vk::Extent2D {
                width: current.0,
                height: current.1,
            },
            min_image_extent: vk::Extent2D { width: 1, height: 1 },
            max_image_extent: vk::Extent2D {
                width: 1920,
                height: 1080,
            },
            min_image_count: min_count,
            max_image_count: max_count,
            ..Default::default()
        }
    }

    #[test]
    fn test_extent_follows_surface_unless_undefined() {
        let window = vk::Extent2D {
            width: 4000,
            height: 600,
        };
        assert_eq!(choose_extent(&caps((1700, 900), 2, 3), window).width, 1700);
        let clamped = choose_extent(&caps((u32::MAX, u32::MAX), 2, 3), window);
        assert_eq!((clamped.width, clamped.height), (1920, 600));
    }

    #[test]
    fn test_image_count_respects_maximum() {
        assert_eq!(choose_image_count(&caps((1, 1), 2, 0)), 3);
        assert_eq!(choose_image_count(&caps((1, 1), 2, 2)), 2);
    }

    #[test]
    fn test_format_preference() {
        let unorm = vk::SurfaceFormatKHR {
            format: vk::Format::B8G8R8A8_UNORM,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        };
        let srgb = vk::SurfaceFormatKHR {
            format: vk::Format::B8G8R8A8_SRGB,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        };
        let chosen = |formats: &[vk::SurfaceFormatKHR]| choose_surface_format(formats).map(|sf| sf.format);
        assert_eq!(chosen(&[unorm, srgb]), Some(srgb.format));
        assert_eq!(chosen(&[unorm]), Some(unorm.format));
        assert_eq!(chosen(&[]), None);
    }
}

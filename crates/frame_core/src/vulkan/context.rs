//! Instance, surface and logical device
//!
//! Each layer is an RAII wrapper; `VulkanContext` declares its fields so they
//! drop device first, then instance. The surface is destroyed explicitly in
//! `VulkanContext::drop`, after every swapchain built on it is gone.

use std::ffi::{c_void, CStr, CString};
use std::os::raw::c_char;

use ash::extensions::ext::DebugUtils;
use ash::extensions::khr::{Surface, Swapchain as SwapchainLoader};
use ash::{vk, Device, Entry, Instance};

use super::window::Window;
use crate::error::FrameError;

const VALIDATION_LAYER: &CStr = unsafe { CStr::from_bytes_with_nul_unchecked(b"VK_LAYER_KHRONOS_validation\0") };
const ENGINE_NAME: &CStr = unsafe { CStr::from_bytes_with_nul_unchecked(b"frame_core\0") };

fn setup_error(what: &'static str) -> impl FnOnce(vk::Result) -> FrameError {
    move |result| FrameError::Setup(format!("{what}: {result:?}"))
}

/// Forward validation messages into `log`
unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _user_data: *mut c_void,
) -> vk::Bool32 {
    if callback_data.is_null() || (*callback_data).p_message.is_null() {
        return vk::FALSE;
    }
    let message = CStr::from_ptr((*callback_data).p_message).to_string_lossy();

    if message_severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR) {
        log::error!("[Vulkan] {message_type:?} - {message}");
    } else if message_severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::WARNING) {
        log::warn!("[Vulkan] {message_type:?} - {message}");
    } else if message_severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::INFO) {
        log::info!("[Vulkan] {message_type:?} - {message}");
    } else {
        log::debug!("[Vulkan] {message_type:?} - {message}");
    }

    vk::FALSE
}

/// Vulkan instance with its optional validation messenger
pub struct VulkanInstance {
    /// Loader entry points
    pub entry: Entry,
    /// Instance handle and function table
    pub instance: Instance,
    debug: Option<(DebugUtils, vk::DebugUtilsMessengerEXT)>,
}

impl VulkanInstance {
    /// Create an instance with the extensions GLFW needs
    ///
    /// Validation is skipped with a warning when the layer is not installed.
    pub fn new(window: &Window, app_name: &str, enable_validation: bool) -> Result<Self, FrameError> {
        let entry = unsafe { Entry::load() }
            .map_err(|err| FrameError::Setup(format!("Failed to load Vulkan: {err}")))?;

        let app_name = CString::new(app_name)
            .map_err(|_| FrameError::Setup("application name contains a NUL byte".to_string()))?;
        let app_info = vk::ApplicationInfo::builder()
            .application_name(&app_name)
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .engine_name(ENGINE_NAME)
            .engine_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(vk::API_VERSION_1_1);

        let required = window
            .required_instance_extensions()
            .map_err(|err| FrameError::Setup(err.to_string()))?;
        let required: Vec<CString> = required
            .into_iter()
            .map(CString::new)
            .collect::<Result<_, _>>()
            .map_err(|_| FrameError::Setup("invalid instance extension name".to_string()))?;
        let mut extensions: Vec<*const c_char> = required.iter().map(|ext| ext.as_ptr()).collect();

        let validation = enable_validation && Self::validation_layer_available(&entry);
        if enable_validation && !validation {
            log::warn!("Validation requested but VK_LAYER_KHRONOS_validation is not installed");
        }
        let mut layers: Vec<*const c_char> = Vec::new();
        if validation {
            extensions.push(DebugUtils::name().as_ptr());
            layers.push(VALIDATION_LAYER.as_ptr());
        }

        let create_info = vk::InstanceCreateInfo::builder()
            .application_info(&app_info)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layers);
        let instance = unsafe { entry.create_instance(&create_info, None) }
            .map_err(setup_error("Failed to create instance"))?;

        let debug = if validation {
            let debug_utils = DebugUtils::new(&entry, &instance);
            let messenger_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
                .message_severity(
                    vk::DebugUtilsMessageSeverityFlagsEXT::WARNING | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
                )
                .message_type(
                    vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                        | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                        | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
                )
                .pfn_user_callback(Some(debug_callback));
            match unsafe { debug_utils.create_debug_utils_messenger(&messenger_info, None) } {
                Ok(messenger) => Some((debug_utils, messenger)),
                Err(result) => {
                    unsafe { instance.destroy_instance(None) };
                    return Err(setup_error("Failed to create debug messenger")(result));
                }
            }
        } else {
            None
        };

        log::info!("Vulkan instance created (validation {})", if validation { "on" } else { "off" });
        Ok(Self { entry, instance, debug })
    }

    fn validation_layer_available(entry: &Entry) -> bool {
        entry
            .enumerate_instance_layer_properties()
            .map(|layers| {
                layers
                    .iter()
                    .any(|layer| unsafe { CStr::from_ptr(layer.layer_name.as_ptr()) } == VALIDATION_LAYER)
            })
            .unwrap_or(false)
    }
}

impl Drop for VulkanInstance {
    fn drop(&mut self) {
        unsafe {
            if let Some((debug_utils, messenger)) = self.debug.take() {
                debug_utils.destroy_debug_utils_messenger(messenger, None);
            }
            self.instance.destroy_instance(None);
        }
    }
}

/// Selected GPU and the queue families used on it
pub struct PhysicalDeviceInfo {
    /// Physical device handle
    pub device: vk::PhysicalDevice,
    /// Properties and limits
    pub properties: vk::PhysicalDeviceProperties,
    /// Memory heaps and types
    pub memory_properties: vk::PhysicalDeviceMemoryProperties,
    /// Queue family with graphics support
    pub graphics_family: u32,
    /// Queue family that can present to the surface
    pub present_family: u32,
}

impl PhysicalDeviceInfo {
    /// Pick the first GPU with graphics, presentation and swapchain support
    pub fn select(instance: &Instance, surface: vk::SurfaceKHR, surface_loader: &Surface) -> Result<Self, FrameError> {
        let devices = unsafe { instance.enumerate_physical_devices() }
            .map_err(setup_error("Failed to enumerate GPUs"))?;

        for device in devices {
            if let Some(info) = Self::evaluate(instance, device, surface, surface_loader) {
                let name = unsafe { CStr::from_ptr(info.properties.device_name.as_ptr()) };
                log::info!("Selected GPU: {}", name.to_string_lossy());
                log::info!(
                    "minUniformBufferOffsetAlignment = {}",
                    info.properties.limits.min_uniform_buffer_offset_alignment
                );
                return Ok(info);
            }
        }

        Err(FrameError::Setup("No suitable GPU found".to_string()))
    }

    fn evaluate(
        instance: &Instance,
        device: vk::PhysicalDevice,
        surface: vk::SurfaceKHR,
        surface_loader: &Surface,
    ) -> Option<Self> {
        let properties = unsafe { instance.get_physical_device_properties(device) };
        if properties.api_version < vk::API_VERSION_1_1 {
            return None;
        }

        let families = unsafe { instance.get_physical_device_queue_family_properties(device) };
        let graphics_family = families
            .iter()
            .position(|family| family.queue_flags.contains(vk::QueueFlags::GRAPHICS))?;
        let present_family = (0..families.len()).find(|&index| unsafe {
            surface_loader
                .get_physical_device_surface_support(device, index as u32, surface)
                .unwrap_or(false)
        })?;

        let extensions = unsafe { instance.enumerate_device_extension_properties(device) }.ok()?;
        let has_swapchain = extensions.iter().any(|extension| {
            (unsafe { CStr::from_ptr(extension.extension_name.as_ptr()) }) == SwapchainLoader::name()
        });
        if !has_swapchain {
            return None;
        }

        let mut draw_parameters = vk::PhysicalDeviceShaderDrawParametersFeatures::default();
        let mut features = vk::PhysicalDeviceFeatures2::builder().push_next(&mut draw_parameters);
        unsafe { instance.get_physical_device_features2(device, &mut features) };
        if draw_parameters.shader_draw_parameters == vk::FALSE {
            return None;
        }

        Some(Self {
            device,
            properties,
            memory_properties: unsafe { instance.get_physical_device_memory_properties(device) },
            graphics_family: graphics_family as u32,
            present_family: present_family as u32,
        })
    }
}

/// Logical device with its queues
pub struct LogicalDevice {
    /// Device handle and function table
    pub device: Device,
    /// Queue used for submission
    pub graphics_queue: vk::Queue,
    /// Queue used for presentation
    pub present_queue: vk::Queue,
    /// Swapchain extension functions
    pub swapchain_loader: SwapchainLoader,
}

impl LogicalDevice {
    /// Create the device with the swapchain extension and `shaderDrawParameters`
    pub fn new(instance: &Instance, physical: &PhysicalDeviceInfo) -> Result<Self, FrameError> {
        let mut families = vec![physical.graphics_family];
        if physical.present_family != physical.graphics_family {
            families.push(physical.present_family);
        }
        let priorities = [1.0];
        let queue_infos: Vec<vk::DeviceQueueCreateInfo> = families
            .iter()
            .map(|&family| {
                vk::DeviceQueueCreateInfo::builder()
                    .queue_family_index(family)
                    .queue_priorities(&priorities)
                    .build()
            })
            .collect();

        let extensions = [SwapchainLoader::name().as_ptr()];
        // gl_BaseInstance is how shaders index the object array
        let mut draw_parameters = vk::PhysicalDeviceShaderDrawParametersFeatures::builder().shader_draw_parameters(true);
        let create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(&queue_infos)
            .enabled_extension_names(&extensions)
            .push_next(&mut draw_parameters);

        let device = unsafe { instance.create_device(physical.device, &create_info, None) }
            .map_err(setup_error("Failed to create logical device"))?;
        let graphics_queue = unsafe { device.get_device_queue(physical.graphics_family, 0) };
        let present_queue = unsafe { device.get_device_queue(physical.present_family, 0) };
        let swapchain_loader = SwapchainLoader::new(instance, &device);

        Ok(Self {
            device,
            graphics_queue,
            present_queue,
            swapchain_loader,
        })
    }
}

impl Drop for LogicalDevice {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();
            self.device.destroy_device(None);
        }
    }
}

/// Everything below the swapchain
pub struct VulkanContext {
    /// Presentation surface
    pub surface: vk::SurfaceKHR,
    /// Surface extension functions
    pub surface_loader: Surface,
    /// Selected GPU
    pub physical: PhysicalDeviceInfo,
    /// Logical device; dropped before `instance`
    pub device: LogicalDevice,
    /// Instance; dropped last
    pub instance: VulkanInstance,
}

impl VulkanContext {
    /// Create instance, surface and device for `window`
    pub fn new(window: &mut Window, app_name: &str, enable_validation: bool) -> Result<Self, FrameError> {
        let instance = VulkanInstance::new(window, app_name, enable_validation)?;
        let surface_loader = Surface::new(&instance.entry, &instance.instance);
        let surface = window
            .create_surface(instance.instance.handle())
            .map_err(|err| FrameError::Setup(err.to_string()))?;

        let physical = match PhysicalDeviceInfo::select(&instance.instance, surface, &surface_loader) {
            Ok(physical) => physical,
            Err(err) => {
                unsafe { surface_loader.destroy_surface(surface, None) };
                return Err(err);
            }
        };
        let device = match LogicalDevice::new(&instance.instance, &physical) {
            Ok(device) => device,
            Err(err) => {
                unsafe { surface_loader.destroy_surface(surface, None) };
                return Err(err);
            }
        };

        Ok(Self {
            surface,
            surface_loader,
            physical,
            device,
            instance,
        })
    }

    /// Raw device function table
    pub fn device(&self) -> &Device {
        &self.device.device
    }

    /// Raw instance function table
    pub fn instance(&self) -> &Instance {
        &self.instance.instance
    }
}

impl Drop for VulkanContext {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device.device_wait_idle();
            self.surface_loader.destroy_surface(self.surface, None);
        }
    }
}

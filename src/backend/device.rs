// Vulkan Device - Core GPU interface
//
// Responsibilities:
// - Instance creation (validation layers when available)
// - Presentation surface: the host's window, or headless for offscreen tests
// - Physical device selection (graphics + present queue, prefer discrete GPU)
// - Logical device + single queue
// - Memory allocator setup
//
// Created once at startup, immutable afterwards, destroyed last.

use anyhow::{Context, Result};
use ash::extensions::{ext::DebugUtils, khr};
use ash::{vk, Entry};
use std::ffi::{c_char, CStr, CString};
use std::mem::ManuallyDrop;
use std::sync::Arc;

use super::allocator::MemoryAllocator;
use super::rollback::Rollback;
use super::surface::{self, PresentSurface, SurfaceHandle};
use crate::error::HarnessError;

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

/// Loader environment variables worth knowing about when diagnosing
/// "no GPU found" reports.
const LOADER_ENV_VARS: [&str; 3] = ["VK_LOADER_DEBUG", "VK_LAYER_PATH", "VK_ICD_FILENAMES"];

/// Log the Vulkan loader's environment. Diagnostic only.
pub fn log_loader_environment() {
    for name in LOADER_ENV_VARS {
        if let Ok(value) = std::env::var(name) {
            log::info!("{}={}", name, value);
        }
    }
}

/// Vulkan device wrapper with automatic cleanup
pub struct VulkanDevice {
    // Dropped by hand before the device is destroyed
    pub allocator: ManuallyDrop<MemoryAllocator>,
    pub device: ash::Device,
    pub physical_device: vk::PhysicalDevice,
    pub instance: ash::Instance,
    // Keeps the Vulkan library loaded
    _entry: Entry,

    // Single graphics + present queue
    pub queue: vk::Queue,
    pub queue_family: u32,

    surface: Option<PresentSurface>,
    debug_utils: Option<(DebugUtils, vk::DebugUtilsMessengerEXT)>,

    pub properties: vk::PhysicalDeviceProperties,
}

/// Where the presentation surface comes from, if there is one.
enum SurfaceSource<'a> {
    Window(&'a SurfaceHandle),
    Headless,
    None,
}

impl VulkanDevice {
    /// Create a device that can present to the window behind `surface`.
    ///
    /// # Safety
    /// The native handles in `surface` must outlive the returned device.
    pub unsafe fn new(
        app_name: &str,
        enable_validation: bool,
        surface: &SurfaceHandle,
    ) -> Result<Arc<Self>> {
        let extensions = surface::required_instance_extensions(surface.display)?;
        Self::create(
            app_name,
            enable_validation,
            &extensions,
            SurfaceSource::Window(surface),
        )
    }

    /// Create a device with no presentation surface (uploads, readback, tests).
    pub fn headless(app_name: &str) -> Result<Arc<Self>> {
        // Safety: no native handles involved
        unsafe { Self::create(app_name, false, &[], SurfaceSource::None) }
    }

    /// Create a device presenting to a VK_EXT_headless_surface. Fails with
    /// `MissingExtension` where the implementation has no headless WSI.
    pub fn with_headless_surface(app_name: &str) -> Result<Arc<Self>> {
        let extensions = surface::headless_instance_extensions();
        // Safety: no native handles involved
        unsafe { Self::create(app_name, false, &extensions, SurfaceSource::Headless) }
    }

    unsafe fn create(
        app_name: &str,
        enable_validation: bool,
        surface_extensions: &[&'static CStr],
        surface_source: SurfaceSource,
    ) -> Result<Arc<Self>> {
        log::info!("Creating Vulkan device: {}", app_name);
        log_loader_environment();

        // Step 1: Load Vulkan library
        let entry = Entry::load().map_err(HarnessError::Loader)?;

        // Step 2: Create instance
        // Everything from here on is released again if a later step fails
        let mut rollback = Rollback::new();
        let enable_validation = enable_validation && Self::validation_available(&entry)?;
        let instance =
            Self::create_instance(&entry, app_name, enable_validation, surface_extensions)?;
        rollback.push({
            let instance = instance.clone();
            move || instance.destroy_instance(None)
        });

        // Step 3: Setup debug messenger if validation enabled
        let debug_utils = if enable_validation {
            let (debug_utils, messenger) = Self::setup_debug_messenger(&entry, &instance)?;
            rollback.push({
                let debug_utils = debug_utils.clone();
                move || debug_utils.destroy_debug_utils_messenger(messenger, None)
            });
            Some((debug_utils, messenger))
        } else {
            None
        };

        // Step 4: Surface (window connection)
        let surface = match surface_source {
            SurfaceSource::Window(handle) => {
                Some(surface::create_surface(&entry, &instance, handle)?)
            }
            SurfaceSource::Headless => Some(surface::create_headless_surface(&entry, &instance)?),
            SurfaceSource::None => None,
        };
        if let Some(surface) = &surface {
            let surface = surface.clone();
            rollback.push(move || surface.destroy());
        }

        // Step 5: Pick physical device (GPU)
        let (physical_device, queue_family) =
            Self::pick_physical_device(&instance, surface.as_ref())?;

        // Step 6: Create logical device
        let (device, queue) = Self::create_logical_device(
            &instance,
            physical_device,
            queue_family,
            surface.is_some(),
        )?;
        rollback.push({
            let device = device.clone();
            move || device.destroy_device(None)
        });

        let properties = instance.get_physical_device_properties(physical_device);

        log::info!(
            "Selected GPU: {}",
            CStr::from_ptr(properties.device_name.as_ptr()).to_string_lossy()
        );
        log::info!(
            "API Version: {}.{}.{}",
            vk::api_version_major(properties.api_version),
            vk::api_version_minor(properties.api_version),
            vk::api_version_patch(properties.api_version)
        );

        // Step 7: Create memory allocator
        let allocator = MemoryAllocator::new(&instance, physical_device, &device)?;

        // Drop now owns everything
        rollback.commit();

        Ok(Arc::new(Self {
            allocator: ManuallyDrop::new(allocator),
            device,
            physical_device,
            instance,
            _entry: entry,
            queue,
            queue_family,
            surface,
            debug_utils,
            properties,
        }))
    }

    unsafe fn validation_available(entry: &Entry) -> Result<bool> {
        let layers = entry
            .enumerate_instance_layer_properties()
            .context("vkEnumerateInstanceLayerProperties failed")?;

        log::debug!("{} instance layers found", layers.len());
        for layer in &layers {
            log::debug!(
                "  {}",
                CStr::from_ptr(layer.layer_name.as_ptr()).to_string_lossy()
            );
        }

        let found = layers
            .iter()
            .any(|layer| CStr::from_ptr(layer.layer_name.as_ptr()) == VALIDATION_LAYER);
        if !found {
            log::warn!("Validation requested but VK_LAYER_KHRONOS_validation is not installed");
        }
        Ok(found)
    }

    unsafe fn create_instance(
        entry: &Entry,
        app_name: &str,
        enable_validation: bool,
        surface_extensions: &[&'static CStr],
    ) -> Result<ash::Instance> {
        let app_name_cstr = CString::new(app_name)?;
        let engine_name = c"No Engine";

        let app_info = vk::ApplicationInfo::builder()
            .application_name(&app_name_cstr)
            .application_version(vk::make_api_version(0, 1, 0, 0))
            .engine_name(engine_name)
            .engine_version(vk::make_api_version(0, 1, 0, 0))
            .api_version(vk::API_VERSION_1_1);

        let available = entry
            .enumerate_instance_extension_properties(None)
            .context("vkEnumerateInstanceExtensionProperties failed")?;
        for &required in surface_extensions {
            let present = available
                .iter()
                .any(|ext| CStr::from_ptr(ext.extension_name.as_ptr()) == required);
            if !present {
                return Err(
                    HarnessError::MissingExtension(required.to_string_lossy().into_owned()).into(),
                );
            }
        }

        let mut extensions: Vec<*const c_char> =
            surface_extensions.iter().map(|name| name.as_ptr()).collect();
        if enable_validation {
            extensions.push(DebugUtils::name().as_ptr());
        }

        let flags = if surface_extensions.contains(&vk::KhrPortabilityEnumerationFn::name()) {
            vk::InstanceCreateFlags::ENUMERATE_PORTABILITY_KHR
        } else {
            vk::InstanceCreateFlags::empty()
        };

        let layer_names = if enable_validation {
            vec![VALIDATION_LAYER.as_ptr()]
        } else {
            vec![]
        };

        let create_info = vk::InstanceCreateInfo::builder()
            .flags(flags)
            .application_info(&app_info)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layer_names);

        let instance = entry
            .create_instance(&create_info, None)
            .context("Failed to create Vulkan instance")?;

        Ok(instance)
    }

    unsafe fn setup_debug_messenger(
        entry: &Entry,
        instance: &ash::Instance,
    ) -> Result<(DebugUtils, vk::DebugUtilsMessengerEXT)> {
        let debug_utils = DebugUtils::new(entry, instance);

        let create_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::INFO
                    | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                    | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(debug_callback));

        let messenger = debug_utils
            .create_debug_utils_messenger(&create_info, None)
            .context("vkCreateDebugUtilsMessengerEXT failed")?;

        Ok((debug_utils, messenger))
    }

    unsafe fn pick_physical_device(
        instance: &ash::Instance,
        surface: Option<&PresentSurface>,
    ) -> Result<(vk::PhysicalDevice, u32)> {
        let devices = instance
            .enumerate_physical_devices()
            .context("vkEnumeratePhysicalDevices failed")?;

        if devices.is_empty() {
            return Err(HarnessError::NoSuitableGpu("no Vulkan-capable GPU").into());
        }

        // Score each device
        let mut best_device = None;
        let mut best_score = 0;

        for device in devices {
            let props = instance.get_physical_device_properties(device);
            let features = instance.get_physical_device_features(device);

            if features.sampler_anisotropy != vk::TRUE {
                continue;
            }

            if surface.is_some() && !Self::supports_swapchain(instance, device)? {
                continue;
            }

            let Some(queue_family) = Self::find_queue_family(instance, device, surface)? else {
                continue;
            };

            // Prefer discrete GPU
            let score = match props.device_type {
                vk::PhysicalDeviceType::DISCRETE_GPU => 1000,
                vk::PhysicalDeviceType::INTEGRATED_GPU => 100,
                _ => 1,
            };

            if score > best_score {
                best_score = score;
                best_device = Some((device, queue_family));
            }
        }

        best_device.ok_or_else(|| {
            HarnessError::NoSuitableGpu("no GPU with anisotropy and a graphics+present queue")
                .into()
        })
    }

    unsafe fn supports_swapchain(
        instance: &ash::Instance,
        device: vk::PhysicalDevice,
    ) -> Result<bool> {
        let extensions = instance
            .enumerate_device_extension_properties(device)
            .context("vkEnumerateDeviceExtensionProperties failed")?;

        Ok(extensions
            .iter()
            .any(|ext| CStr::from_ptr(ext.extension_name.as_ptr()) == khr::Swapchain::name()))
    }

    unsafe fn find_queue_family(
        instance: &ash::Instance,
        device: vk::PhysicalDevice,
        surface: Option<&PresentSurface>,
    ) -> Result<Option<u32>> {
        let families = instance.get_physical_device_queue_family_properties(device);

        for (index, family) in families.iter().enumerate() {
            let index = index as u32;
            if family.queue_count == 0 || !family.queue_flags.contains(vk::QueueFlags::GRAPHICS) {
                continue;
            }

            let presents = match surface {
                Some(surface) => surface
                    .loader
                    .get_physical_device_surface_support(device, index, surface.handle)
                    .context("vkGetPhysicalDeviceSurfaceSupportKHR failed")?,
                None => true,
            };

            if presents {
                return Ok(Some(index));
            }
        }

        Ok(None)
    }

    unsafe fn create_logical_device(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        queue_family: u32,
        present: bool,
    ) -> Result<(ash::Device, vk::Queue)> {
        let queue_priorities = [1.0];
        let queue_create_info = vk::DeviceQueueCreateInfo::builder()
            .queue_family_index(queue_family)
            .queue_priorities(&queue_priorities)
            .build();

        let available = instance
            .enumerate_device_extension_properties(physical_device)
            .context("vkEnumerateDeviceExtensionProperties failed")?;
        let has = |name: &CStr| {
            available
                .iter()
                .any(|ext| CStr::from_ptr(ext.extension_name.as_ptr()) == name)
        };

        let mut extensions = Vec::new();
        if present {
            if !has(khr::Swapchain::name()) {
                return Err(HarnessError::MissingExtension("VK_KHR_swapchain".into()).into());
            }
            extensions.push(khr::Swapchain::name().as_ptr());
        }
        // Portability implementations require the subset extension when exposed
        if has(vk::KhrPortabilitySubsetFn::name()) {
            extensions.push(vk::KhrPortabilitySubsetFn::name().as_ptr());
        }

        let features = vk::PhysicalDeviceFeatures::builder().sampler_anisotropy(true);

        let create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(std::slice::from_ref(&queue_create_info))
            .enabled_extension_names(&extensions)
            .enabled_features(&features);

        let device = instance
            .create_device(physical_device, &create_info, None)
            .context("vkCreateDevice failed")?;

        let queue = device.get_device_queue(queue_family, 0);

        Ok((device, queue))
    }

    /// The presentation surface, if this device was created for a window.
    pub fn surface(&self) -> Result<&PresentSurface> {
        self.surface
            .as_ref()
            .ok_or_else(|| HarnessError::NoSurface.into())
    }

    /// Largest sampler anisotropy we will ask for.
    pub fn max_sampler_anisotropy(&self) -> f32 {
        self.properties.limits.max_sampler_anisotropy.min(16.0)
    }

    /// Wait for device to be idle (e.g., before cleanup)
    pub fn wait_idle(&self) -> Result<()> {
        unsafe { self.device.device_wait_idle() }.context("vkDeviceWaitIdle failed")?;
        Ok(())
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        log::info!("Destroying Vulkan device...");

        if let Err(e) = self.wait_idle() {
            log::error!("{:?}", e);
        }

        // Cleanup in reverse order
        unsafe {
            ManuallyDrop::drop(&mut self.allocator);

            self.device.destroy_device(None);

            if let Some(surface) = self.surface.take() {
                surface.destroy();
            }

            if let Some((debug_utils, messenger)) = self.debug_utils.take() {
                debug_utils.destroy_debug_utils_messenger(messenger, None);
            }

            self.instance.destroy_instance(None);
        }
    }
}

// Debug callback for validation layers
unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _p_user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    let message = CStr::from_ptr((*p_callback_data).p_message);

    match message_severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => {
            log::error!("[Vulkan] {}", message.to_string_lossy());
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => {
            log::warn!("[Vulkan] {}", message.to_string_lossy());
        }
        _ => {
            log::debug!("[Vulkan] {}", message.to_string_lossy());
        }
    }

    vk::FALSE
}

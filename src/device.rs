//! Instance, physical device and logical device setup.

use std::collections::HashSet;
use std::ffi::{c_void, CStr};

use raw_window_handle::HasWindowHandle;
use vulkanalia::prelude::v1_3::*;
use vulkanalia::vk::{ExtDebugUtilsExtension, KhrSurfaceExtension};
use vulkanalia::window as vk_window;

use crate::error::{Error, Result};

pub const VALIDATION_LAYER: vk::ExtensionName =
    vk::ExtensionName::from_bytes(b"VK_LAYER_KHRONOS_validation");

pub const DEVICE_EXTENSIONS: &[vk::ExtensionName] = &[vk::KHR_SWAPCHAIN_EXTENSION.name];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QueueFamilyIndices {
    pub graphics: u32,
    pub present: u32,
    pub transfer: u32,
    /// Queue of the transfer family used for uploads.
    pub transfer_queue_index: u32,
}

impl QueueFamilyIndices {
    pub unsafe fn get(
        instance: &Instance,
        surface: vk::SurfaceKHR,
        physical_device: vk::PhysicalDevice,
    ) -> Result<Self> {
        let properties = instance.get_physical_device_queue_family_properties(physical_device);

        let graphics = properties
            .iter()
            .position(|p| p.queue_flags.contains(vk::QueueFlags::GRAPHICS))
            .map(|i| i as u32)
            .ok_or(Error::MissingQueueFamily("graphics"))?;

        let mut present = None;
        for (index, _) in properties.iter().enumerate() {
            if instance.get_physical_device_surface_support_khr(
                physical_device,
                index as u32,
                surface,
            )? {
                present = Some(index as u32);
                break;
            }
        }
        let present = present.ok_or(Error::MissingQueueFamily("present"))?;

        // A second graphics queue keeps uploads off the render queue.
        let transfer_queue_index = u32::from(properties[graphics as usize].queue_count > 1);

        Ok(Self {
            graphics,
            present,
            transfer: graphics,
            transfer_queue_index,
        })
    }

    /// Families the swapchain images are shared between.
    pub fn sharing(&self) -> (vk::SharingMode, Vec<u32>) {
        if self.graphics != self.present {
            (vk::SharingMode::CONCURRENT, vec![self.graphics, self.present])
        } else {
            (vk::SharingMode::EXCLUSIVE, Vec::new())
        }
    }
}

#[derive(Clone, Debug)]
pub struct SwapchainSupport {
    pub capabilities: vk::SurfaceCapabilitiesKHR,
    pub formats: Vec<vk::SurfaceFormatKHR>,
    pub present_modes: Vec<vk::PresentModeKHR>,
}

impl SwapchainSupport {
    pub unsafe fn get(
        instance: &Instance,
        surface: vk::SurfaceKHR,
        physical_device: vk::PhysicalDevice,
    ) -> Result<Self> {
        Ok(Self {
            capabilities: instance
                .get_physical_device_surface_capabilities_khr(physical_device, surface)?,
            formats: instance.get_physical_device_surface_formats_khr(physical_device, surface)?,
            present_modes: instance
                .get_physical_device_surface_present_modes_khr(physical_device, surface)?,
        })
    }
}

pub unsafe fn create_instance(
    display: &dyn HasWindowHandle,
    entry: &Entry,
    application_name: &str,
    validation: bool,
) -> Result<(Instance, Option<vk::DebugUtilsMessengerEXT>)> {
    let loader_version = entry
        .enumerate_instance_version()
        .unwrap_or(vk::make_version(1, 0, 0));
    log::info!(
        "Vulkan loader version: {}.{}.{}",
        vk::version_major(loader_version),
        vk::version_minor(loader_version),
        vk::version_patch(loader_version)
    );

    let mut name = application_name.as_bytes().to_vec();
    name.push(0);
    let application_info = vk::ApplicationInfo::builder()
        .application_name(&name)
        .application_version(vk::make_version(1, 0, 0))
        .engine_name(b"Ferris Scene VK\0")
        .engine_version(vk::make_version(1, 0, 0))
        .api_version(vk::make_version(1, 3, 0));

    let mut extensions = vk_window::get_required_instance_extensions(display)
        .iter()
        .map(|e| e.as_ptr())
        .collect::<Vec<_>>();

    let validation = validation && validation_layer_available(entry)?;
    let mut layers = Vec::new();
    if validation {
        layers.push(VALIDATION_LAYER.as_ptr());
        extensions.push(vk::EXT_DEBUG_UTILS_EXTENSION.name.as_ptr());
    }

    let info = vk::InstanceCreateInfo::builder()
        .application_info(&application_info)
        .enabled_layer_names(&layers)
        .enabled_extension_names(&extensions);

    let instance = entry.create_instance(&info, None)?;

    let messenger = if validation {
        let info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
            .message_severity(vk::DebugUtilsMessageSeverityFlagsEXT::all())
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .user_callback(Some(debug_callback));
        match instance.create_debug_utils_messenger_ext(&info, None) {
            Ok(messenger) => Some(messenger),
            Err(e) => {
                instance.destroy_instance(None);
                return Err(e.into());
            }
        }
    } else {
        None
    };

    Ok((instance, messenger))
}

unsafe fn validation_layer_available(entry: &Entry) -> Result<bool> {
    let available_layers = entry
        .enumerate_instance_layer_properties()?
        .iter()
        .map(|l| l.layer_name)
        .collect::<HashSet<_>>();

    let available = available_layers.contains(&VALIDATION_LAYER);
    if !available {
        log::warn!("Validation layer requested but not supported");
    }
    Ok(available)
}

extern "system" fn debug_callback(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    type_: vk::DebugUtilsMessageTypeFlagsEXT,
    data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _: *mut c_void,
) -> vk::Bool32 {
    let message = if data.is_null() {
        Default::default()
    } else {
        unsafe { CStr::from_ptr((*data).message) }.to_string_lossy()
    };

    if severity >= vk::DebugUtilsMessageSeverityFlagsEXT::ERROR {
        log::error!("({type_:?}) {message}");
    } else if severity >= vk::DebugUtilsMessageSeverityFlagsEXT::WARNING {
        log::warn!("({type_:?}) {message}");
    } else if severity >= vk::DebugUtilsMessageSeverityFlagsEXT::INFO {
        log::debug!("({type_:?}) {message}");
    } else {
        log::trace!("({type_:?}) {message}");
    }

    vk::FALSE
}

pub unsafe fn pick_physical_device(
    instance: &Instance,
    surface: vk::SurfaceKHR,
) -> Result<(vk::PhysicalDevice, QueueFamilyIndices)> {
    for physical_device in instance.enumerate_physical_devices()? {
        let properties = instance.get_physical_device_properties(physical_device);

        match check_physical_device(instance, surface, physical_device) {
            Ok(indices) => {
                log::info!("Selected physical device (`{}`).", properties.device_name);
                return Ok((physical_device, indices));
            }
            Err(error) => {
                log::warn!(
                    "Skipping physical device (`{}`): {}",
                    properties.device_name,
                    error
                );
            }
        }
    }

    Err(Error::NoSuitableDevice)
}

unsafe fn check_physical_device(
    instance: &Instance,
    surface: vk::SurfaceKHR,
    physical_device: vk::PhysicalDevice,
) -> Result<QueueFamilyIndices> {
    let indices = QueueFamilyIndices::get(instance, surface, physical_device)?;

    let extensions = instance
        .enumerate_device_extension_properties(physical_device, None)?
        .iter()
        .map(|e| e.extension_name)
        .collect::<HashSet<_>>();
    if !DEVICE_EXTENSIONS.iter().all(|e| extensions.contains(e)) {
        return Err(Error::Unimplemented("devices without VK_KHR_swapchain"));
    }

    let support = SwapchainSupport::get(instance, surface, physical_device)?;
    if support.formats.is_empty() || support.present_modes.is_empty() {
        return Err(Error::NoSuitableDevice);
    }

    Ok(indices)
}

/// Logical device with `synchronization2` enabled, plus its graphics,
/// present and transfer queues.
pub unsafe fn create_logical_device(
    instance: &Instance,
    physical_device: vk::PhysicalDevice,
    indices: &QueueFamilyIndices,
    validation: bool,
) -> Result<(Device, [vk::Queue; 3])> {
    let graphics_priorities: &[f32] = if indices.transfer_queue_index > 0 {
        &[1.0, 0.5]
    } else {
        &[1.0]
    };
    let present_priorities = &[1.0];

    let mut queue_infos = vec![
        vk::DeviceQueueCreateInfo::builder()
            .queue_family_index(indices.graphics)
            .queue_priorities(graphics_priorities),
    ];
    if indices.present != indices.graphics {
        queue_infos.push(
            vk::DeviceQueueCreateInfo::builder()
                .queue_family_index(indices.present)
                .queue_priorities(present_priorities),
        );
    }

    let layers = if validation {
        vec![VALIDATION_LAYER.as_ptr()]
    } else {
        vec![]
    };

    let extensions = DEVICE_EXTENSIONS
        .iter()
        .map(|n| n.as_ptr())
        .collect::<Vec<_>>();

    let mut sync2_features =
        vk::PhysicalDeviceSynchronization2Features::builder().synchronization2(true);

    let features = vk::PhysicalDeviceFeatures::builder();

    let info = vk::DeviceCreateInfo::builder()
        .queue_create_infos(&queue_infos)
        .enabled_layer_names(&layers)
        .enabled_extension_names(&extensions)
        .enabled_features(&features)
        .push_next(&mut sync2_features);

    let device = instance.create_device(physical_device, &info, None)?;

    let graphics = device.get_device_queue(indices.graphics, 0);
    let present = device.get_device_queue(indices.present, 0);
    let transfer = device.get_device_queue(indices.transfer, indices.transfer_queue_index);

    Ok((device, [graphics, present, transfer]))
}

pub unsafe fn min_ubo_alignment(instance: &Instance, physical_device: vk::PhysicalDevice) -> u64 {
    instance
        .get_physical_device_properties(physical_device)
        .limits
        .min_uniform_buffer_offset_alignment
}

//! Vulkan context with opaque-fd external memory
//!
//! Every allocation is a transfer buffer bound to its own `VkDeviceMemory`,
//! created with `VkExternalMemoryBufferCreateInfo` so the memory can be
//! exported to, or imported from, an opaque file descriptor.

use crate::debug::{messenger_create_info, VALIDATION_LAYER};
use crate::error::{allocation_failed, import_failed, VulkanError};
use ash::vk;
use memory_portal_core::{GraphicsContext, MemoryError, MemoryPropertyFlags, MemoryRequirements, MemoryType};
use std::ffi::CStr;
use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd};
use std::ptr::NonNull;
use tracing::{debug, info, warn};

const HANDLE_TYPE: vk::ExternalMemoryHandleTypeFlags = vk::ExternalMemoryHandleTypeFlags::OPAQUE_FD;

/// Vulkan context options
#[derive(Debug, Clone, Default)]
pub struct VulkanConfig {
    /// Enable `VK_LAYER_KHRONOS_validation` and route its messages into the log
    pub validation_layers: bool,
}

/// Buffer and memory backing one allocation
#[derive(Debug)]
pub struct VulkanMemory {
    buffer: vk::Buffer,
    memory: vk::DeviceMemory,
    size: u64,
}

/// Vulkan implementation of [`GraphicsContext`]
pub struct VulkanContext {
    _entry: ash::Entry,
    instance: ash::Instance,
    debug_utils: Option<(ash::ext::debug_utils::Instance, vk::DebugUtilsMessengerEXT)>,
    device: ash::Device,
    external_memory_fd: ash::khr::external_memory_fd::Device,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
    device_properties: vk::PhysicalDeviceProperties,
}

impl VulkanContext {
    /// Load Vulkan, create an instance and a device able to export memory.
    ///
    /// Returns an error if Vulkan is not installed or no GPU supports
    /// `VK_KHR_external_memory_fd`.
    pub fn new(config: &VulkanConfig) -> Result<Self, VulkanError> {
        let entry = unsafe { ash::Entry::load()? };

        let instance_version = unsafe {
            entry
                .try_enumerate_instance_version()
                .map_err(VulkanError::call("vkEnumerateInstanceVersion"))?
                .unwrap_or(vk::API_VERSION_1_0)
        };
        if instance_version < vk::API_VERSION_1_1 {
            return Err(VulkanError::UnsupportedVersion {
                major: vk::api_version_major(instance_version),
                minor: vk::api_version_minor(instance_version),
            });
        }

        let mut layers: Vec<*const std::ffi::c_char> = Vec::new();
        let mut instance_extensions = vec![ash::khr::external_memory_capabilities::NAME.as_ptr()];
        if config.validation_layers {
            let available = unsafe {
                entry
                    .enumerate_instance_layer_properties()
                    .map_err(VulkanError::call("vkEnumerateInstanceLayerProperties"))?
            };
            let found = available
                .iter()
                .any(|layer| unsafe { CStr::from_ptr(layer.layer_name.as_ptr()) } == VALIDATION_LAYER);
            if !found {
                return Err(VulkanError::MissingLayer(VALIDATION_LAYER.to_string_lossy().into_owned()));
            }
            layers.push(VALIDATION_LAYER.as_ptr());
            instance_extensions.push(ash::ext::debug_utils::NAME.as_ptr());
        }

        let app_info = vk::ApplicationInfo::default()
            .application_name(c"memory-portal")
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .engine_name(c"memory-portal")
            .engine_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(vk::API_VERSION_1_1);

        // Also covers messages from vkCreateInstance itself
        let mut instance_debug_info = messenger_create_info();
        let mut create_info = vk::InstanceCreateInfo::default()
            .application_info(&app_info)
            .enabled_layer_names(&layers)
            .enabled_extension_names(&instance_extensions);
        if config.validation_layers {
            create_info = create_info.push_next(&mut instance_debug_info);
        }

        let instance = unsafe {
            entry
                .create_instance(&create_info, None)
                .map_err(VulkanError::call("vkCreateInstance"))?
        };

        // From here on the instance has to be destroyed on every error path
        Self::with_instance(entry, instance, config)
    }

    fn with_instance(entry: ash::Entry, instance: ash::Instance, config: &VulkanConfig) -> Result<Self, VulkanError> {
        let debug_utils = if config.validation_layers {
            let loader = ash::ext::debug_utils::Instance::new(&entry, &instance);
            match unsafe { loader.create_debug_utils_messenger(&messenger_create_info(), None) } {
                Ok(messenger) => Some((loader, messenger)),
                Err(result) => {
                    unsafe { instance.destroy_instance(None) };
                    return Err(VulkanError::call("vkCreateDebugUtilsMessengerEXT")(result));
                }
            }
        } else {
            None
        };

        let teardown = |error: VulkanError| {
            unsafe {
                if let Some((loader, messenger)) = &debug_utils {
                    loader.destroy_debug_utils_messenger(*messenger, None);
                }
                instance.destroy_instance(None);
            }
            error
        };

        let physical_device = Self::select_physical_device(&instance).map_err(teardown)?;

        let device_properties = unsafe { instance.get_physical_device_properties(physical_device) };
        let memory_properties = unsafe { instance.get_physical_device_memory_properties(physical_device) };
        info!(
            "Selected device: {}",
            unsafe { CStr::from_ptr(device_properties.device_name.as_ptr()) }.to_string_lossy()
        );

        let queue_priority = [1.0f32];
        let queue_create_infos = [vk::DeviceQueueCreateInfo::default()
            .queue_family_index(0)
            .queue_priorities(&queue_priority)];
        let device_extensions = [
            ash::khr::external_memory::NAME.as_ptr(),
            ash::khr::external_memory_fd::NAME.as_ptr(),
        ];
        let device_create_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_create_infos)
            .enabled_extension_names(&device_extensions);

        let device = unsafe { instance.create_device(physical_device, &device_create_info, None) }
            .map_err(|result| teardown(VulkanError::call("vkCreateDevice")(result)))?;
        let external_memory_fd = ash::khr::external_memory_fd::Device::new(&instance, &device);

        debug!(
            "Device has {} memory types, non-coherent atom size {}",
            memory_properties.memory_type_count, device_properties.limits.non_coherent_atom_size
        );

        Ok(Self {
            _entry: entry,
            instance,
            debug_utils,
            device,
            external_memory_fd,
            memory_properties,
            device_properties,
        })
    }

    /// First device with `VK_KHR_external_memory_fd`, discrete GPUs preferred
    fn select_physical_device(instance: &ash::Instance) -> Result<vk::PhysicalDevice, VulkanError> {
        let devices = unsafe {
            instance
                .enumerate_physical_devices()
                .map_err(VulkanError::call("vkEnumeratePhysicalDevices"))?
        };

        let mut candidates: Vec<(vk::PhysicalDevice, vk::PhysicalDeviceType)> = devices
            .into_iter()
            .filter(|&device| {
                let extensions = unsafe { instance.enumerate_device_extension_properties(device) }.unwrap_or_default();
                extensions.iter().any(|ext| {
                    let name = unsafe { CStr::from_ptr(ext.extension_name.as_ptr()) };
                    name == ash::khr::external_memory_fd::NAME
                })
            })
            .map(|device| {
                let properties = unsafe { instance.get_physical_device_properties(device) };
                (device, properties.device_type)
            })
            .collect();

        candidates.sort_by_key(|(_, device_type)| match *device_type {
            vk::PhysicalDeviceType::DISCRETE_GPU => 0,
            vk::PhysicalDeviceType::INTEGRATED_GPU => 1,
            vk::PhysicalDeviceType::VIRTUAL_GPU => 2,
            _ => 3,
        });

        candidates
            .first()
            .map(|(device, _)| *device)
            .ok_or(VulkanError::NoCompatibleDevice)
    }

    /// Selected device name
    pub fn device_name(&self) -> String {
        let name = unsafe { CStr::from_ptr(self.device_properties.device_name.as_ptr()) };
        name.to_string_lossy().into_owned()
    }

    fn create_buffer(&self, size: u64) -> Result<vk::Buffer, vk::Result> {
        let mut external_info = vk::ExternalMemoryBufferCreateInfo::default().handle_types(HANDLE_TYPE);
        let buffer_info = vk::BufferCreateInfo::default()
            .size(size)
            .usage(vk::BufferUsageFlags::TRANSFER_SRC | vk::BufferUsageFlags::TRANSFER_DST)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .push_next(&mut external_info);

        unsafe { self.device.create_buffer(&buffer_info, None) }
    }

    fn bind(&self, buffer: vk::Buffer, memory: vk::DeviceMemory, size: u64) -> Result<VulkanMemory, vk::Result> {
        if let Err(result) = unsafe { self.device.bind_buffer_memory(buffer, memory, 0) } {
            unsafe {
                self.device.free_memory(memory, None);
                self.device.destroy_buffer(buffer, None);
            }
            return Err(result);
        }
        Ok(VulkanMemory { buffer, memory, size })
    }

    fn mapped_range(memory: &VulkanMemory, offset: u64, size: u64) -> vk::MappedMemoryRange<'static> {
        let size = if offset + size >= memory.size { vk::WHOLE_SIZE } else { size };
        vk::MappedMemoryRange::default().memory(memory.memory).offset(offset).size(size)
    }
}

impl GraphicsContext for VulkanContext {
    type Memory = VulkanMemory;

    fn memory_types(&self) -> Vec<MemoryType> {
        let count = self.memory_properties.memory_type_count as usize;
        self.memory_properties.memory_types[..count]
            .iter()
            .enumerate()
            .map(|(index, memory_type)| MemoryType {
                index: index as u32,
                property_flags: MemoryPropertyFlags::from_bits_truncate(memory_type.property_flags.as_raw()),
            })
            .collect()
    }

    fn memory_requirements(&self, size: u64, _external: bool) -> Result<MemoryRequirements, MemoryError> {
        let buffer = self
            .create_buffer(size)
            .map_err(|result| allocation_failed("vkCreateBuffer", result))?;
        let requirements = unsafe { self.device.get_buffer_memory_requirements(buffer) };
        unsafe { self.device.destroy_buffer(buffer, None) };

        Ok(MemoryRequirements {
            size: requirements.size,
            alignment: requirements.alignment,
            memory_type_bits: requirements.memory_type_bits,
        })
    }

    fn non_coherent_atom_size(&self) -> u64 {
        self.device_properties.limits.non_coherent_atom_size
    }

    fn allocate(&self, size: u64, memory_type_index: u32, exportable: bool) -> Result<VulkanMemory, MemoryError> {
        let buffer = self
            .create_buffer(size)
            .map_err(|result| allocation_failed("vkCreateBuffer", result))?;

        let mut export_info = vk::ExportMemoryAllocateInfo::default().handle_types(HANDLE_TYPE);
        let mut alloc_info = vk::MemoryAllocateInfo::default()
            .allocation_size(size)
            .memory_type_index(memory_type_index);
        if exportable {
            alloc_info = alloc_info.push_next(&mut export_info);
        }

        let memory = match unsafe { self.device.allocate_memory(&alloc_info, None) } {
            Ok(memory) => memory,
            Err(result) => {
                unsafe { self.device.destroy_buffer(buffer, None) };
                return Err(allocation_failed("vkAllocateMemory", result));
            }
        };

        self.bind(buffer, memory, size)
            .map_err(|result| allocation_failed("vkBindBufferMemory", result))
    }

    fn export(&self, memory: &VulkanMemory) -> Result<OwnedFd, MemoryError> {
        let get_fd_info = vk::MemoryGetFdInfoKHR::default()
            .memory(memory.memory)
            .handle_type(HANDLE_TYPE);

        let fd = unsafe { self.external_memory_fd.get_memory_fd(&get_fd_info) }
            .map_err(|result| MemoryError::ExportFailed(format!("vkGetMemoryFdKHR failed: {:?}", result)))?;

        Ok(unsafe { OwnedFd::from_raw_fd(fd) })
    }

    fn import(&self, fd: OwnedFd, size: u64, memory_type_index: u32) -> Result<VulkanMemory, MemoryError> {
        let buffer = self
            .create_buffer(size)
            .map_err(|result| import_failed("vkCreateBuffer", result))?;

        let mut import_info = vk::ImportMemoryFdInfoKHR::default()
            .handle_type(HANDLE_TYPE)
            .fd(fd.as_raw_fd());
        let alloc_info = vk::MemoryAllocateInfo::default()
            .allocation_size(size)
            .memory_type_index(memory_type_index)
            .push_next(&mut import_info);

        // The driver only takes ownership of the descriptor on success;
        // on failure `fd` is dropped here and closed
        let memory = match unsafe { self.device.allocate_memory(&alloc_info, None) } {
            Ok(memory) => memory,
            Err(result) => {
                unsafe { self.device.destroy_buffer(buffer, None) };
                return Err(import_failed("vkAllocateMemory", result));
            }
        };
        let _ = fd.into_raw_fd();

        self.bind(buffer, memory, size)
            .map_err(|result| import_failed("vkBindBufferMemory", result))
    }

    fn map(&self, memory: &VulkanMemory, _size: u64) -> Result<NonNull<u8>, MemoryError> {
        let ptr = unsafe {
            self.device
                .map_memory(memory.memory, 0, vk::WHOLE_SIZE, vk::MemoryMapFlags::empty())
        }
        .map_err(|result| MemoryError::MapFailed(format!("vkMapMemory failed: {:?}", result)))?;

        NonNull::new(ptr as *mut u8).ok_or_else(|| MemoryError::MapFailed("vkMapMemory returned null".to_string()))
    }

    fn unmap(&self, memory: &VulkanMemory) {
        unsafe { self.device.unmap_memory(memory.memory) };
    }

    fn flush(&self, memory: &VulkanMemory, offset: u64, size: u64) -> Result<(), MemoryError> {
        let range = Self::mapped_range(memory, offset, size);
        unsafe { self.device.flush_mapped_memory_ranges(&[range]) }
            .map_err(|result| MemoryError::MapFailed(format!("vkFlushMappedMemoryRanges failed: {:?}", result)))
    }

    fn invalidate(&self, memory: &VulkanMemory, offset: u64, size: u64) -> Result<(), MemoryError> {
        let range = Self::mapped_range(memory, offset, size);
        unsafe { self.device.invalidate_mapped_memory_ranges(&[range]) }
            .map_err(|result| MemoryError::MapFailed(format!("vkInvalidateMappedMemoryRanges failed: {:?}", result)))
    }

    fn free(&self, memory: VulkanMemory) {
        unsafe {
            self.device.destroy_buffer(memory.buffer, None);
            self.device.free_memory(memory.memory, None);
        }
    }
}

impl Drop for VulkanContext {
    fn drop(&mut self) {
        unsafe {
            if let Err(result) = self.device.device_wait_idle() {
                warn!("vkDeviceWaitIdle failed: {:?}", result);
            }
            self.device.destroy_device(None);
            if let Some((loader, messenger)) = self.debug_utils.take() {
                loader.destroy_debug_utils_messenger(messenger, None);
            }
            self.instance.destroy_instance(None);
        }
    }
}

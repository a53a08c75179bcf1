//! Physical device enumeration and capability queries.

use std::ffi::CStr;

use ash::vk;

use crate::common::FatalKind;
use crate::gpu::instance::VulkanInstance;

/// Everything the resolver, classifier and provisioner need to know about a
/// physical device, queried once up front.
#[derive(Clone, Debug)]
pub struct PhysicalDeviceInfo {
    pub handle: vk::PhysicalDevice,
    /// Position in the instance's enumeration order.
    pub index: usize,
    pub name: String,
    pub device_type: vk::PhysicalDeviceType,
    pub api_version: u32,
    pub queue_families: Vec<vk::QueueFamilyProperties>,
    /// Property flags of each memory type, in reported order.
    pub memory_types: Vec<vk::MemoryPropertyFlags>,
    /// Heap index of each memory type, parallel to `memory_types`.
    pub memory_type_heaps: Vec<u32>,
    pub memory_heap_sizes: Vec<vk::DeviceSize>,
    /// API version is at least 1.2 and `timelineSemaphore` is reported.
    pub timeline_semaphore: bool,
    /// `maxMemoryAllocationSize`, when the device is new enough to say.
    pub max_memory_allocation_size: Option<vk::DeviceSize>,
}

#[derive(thiserror::Error, Debug)]
pub enum PhysicalDeviceError {
    #[error("Could not enumerate physical devices: {0}")]
    Enumerate(vk::Result),
    #[error("No Vulkan physical devices are available")]
    NoDevices,
    #[error("Invalid physical device index {index}, only {count} device(s) available")]
    InvalidIndex { index: usize, count: usize },
}

impl PhysicalDeviceError {
    pub fn kind(&self) -> FatalKind {
        match self {
            PhysicalDeviceError::Enumerate(result) => FatalKind::from_vk(*result),
            PhysicalDeviceError::NoDevices | PhysicalDeviceError::InvalidIndex { .. } => {
                FatalKind::Configuration
            }
        }
    }
}

impl PhysicalDeviceInfo {
    pub fn query(instance: &VulkanInstance, handle: vk::PhysicalDevice, index: usize) -> Self {
        let instance = instance.ash_instance();
        let properties = unsafe { instance.get_physical_device_properties(handle) };
        let name = unsafe { CStr::from_ptr(properties.device_name.as_ptr()) }
            .to_string_lossy()
            .into_owned();

        let queue_families =
            unsafe { instance.get_physical_device_queue_family_properties(handle) };

        let memory_properties = unsafe { instance.get_physical_device_memory_properties(handle) };
        let type_count = memory_properties.memory_type_count as usize;
        let heap_count = memory_properties.memory_heap_count as usize;
        let memory_types = &memory_properties.memory_types[..type_count];
        let memory_heaps = &memory_properties.memory_heaps[..heap_count];

        let api_version = properties.api_version;

        let timeline_semaphore = if api_version >= vk::API_VERSION_1_2 {
            let mut timeline = vk::PhysicalDeviceTimelineSemaphoreFeatures::default();
            {
                let mut features = vk::PhysicalDeviceFeatures2::default().push_next(&mut timeline);
                unsafe { instance.get_physical_device_features2(handle, &mut features) };
            }
            timeline.timeline_semaphore == vk::TRUE
        } else {
            false
        };

        let max_memory_allocation_size = if api_version >= vk::API_VERSION_1_1 {
            let mut maintenance3 = vk::PhysicalDeviceMaintenance3Properties::default();
            {
                let mut properties2 =
                    vk::PhysicalDeviceProperties2::default().push_next(&mut maintenance3);
                unsafe { instance.get_physical_device_properties2(handle, &mut properties2) };
            }
            Some(maintenance3.max_memory_allocation_size)
        } else {
            None
        };

        PhysicalDeviceInfo {
            handle,
            index,
            name,
            device_type: properties.device_type,
            api_version,
            queue_families,
            memory_types: memory_types.iter().map(|ty| ty.property_flags).collect(),
            memory_type_heaps: memory_types.iter().map(|ty| ty.heap_index).collect(),
            memory_heap_sizes: memory_heaps.iter().map(|heap| heap.size).collect(),
            timeline_semaphore,
            max_memory_allocation_size,
        }
    }

    /// Capability bitset of each queue family, in reported order.
    pub fn queue_capabilities(&self) -> Vec<vk::QueueFlags> {
        self.queue_families.iter().map(|family| family.queue_flags).collect()
    }

    pub fn api_version_string(&self) -> String {
        format!(
            "{}.{}.{}",
            vk::api_version_major(self.api_version),
            vk::api_version_minor(self.api_version),
            vk::api_version_patch(self.api_version)
        )
    }
}

pub fn enumerate_physical_devices(
    instance: &VulkanInstance,
) -> Result<Vec<PhysicalDeviceInfo>, PhysicalDeviceError> {
    let handles = unsafe { instance.ash_instance().enumerate_physical_devices() }
        .map_err(PhysicalDeviceError::Enumerate)?;
    Ok(handles
        .into_iter()
        .enumerate()
        .map(|(index, handle)| PhysicalDeviceInfo::query(instance, handle, index))
        .collect())
}

/// Picks a physical device by its position in the enumeration order.
pub fn select_physical_device(
    instance: &VulkanInstance,
    index: usize,
) -> Result<PhysicalDeviceInfo, PhysicalDeviceError> {
    let handles = unsafe { instance.ash_instance().enumerate_physical_devices() }
        .map_err(PhysicalDeviceError::Enumerate)?;
    if handles.is_empty() {
        return Err(PhysicalDeviceError::NoDevices);
    }
    match handles.get(index) {
        Some(handle) => Ok(PhysicalDeviceInfo::query(instance, *handle, index)),
        None => Err(PhysicalDeviceError::InvalidIndex {
            index,
            count: handles.len(),
        }),
    }
}

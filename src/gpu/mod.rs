//! Vulkan plumbing: instance, physical device queries, queue and memory
//! selection, and the logical device the benchmark runs on.

pub mod device;
pub mod instance;
pub mod memory;
pub mod physical_device;
pub mod queue;

pub use self::device::{provision, DeviceBuilder, DeviceContext, ProvisionError, ResolvedQueue};
pub use self::instance::{DiagnosticSink, InstanceOptions, LogSink, VulkanInstance};
pub use self::memory::{classify_memory_types, MemoryClassification};
pub use self::physical_device::{
    enumerate_physical_devices, select_physical_device, PhysicalDeviceInfo,
};
pub use self::queue::{resolve_queue_families, QueueCapability, QueueRequest};

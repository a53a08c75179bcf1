//! Logical device provisioning.
//!
//! [`DeviceBuilder`] collects queue requests in registration order, resolves
//! them against a [`PhysicalDeviceInfo`], and creates the logical device with
//! one queue and one command pool per request. The resulting
//! [`DeviceContext`] owns every device-level handle and releases them pools
//! first, device last.

use std::sync::Arc;

use ash::prelude::VkResult;
use ash::vk;
use log::{debug, info, warn};

use crate::bench::TransferDevice;
use crate::common::FatalKind;
use crate::gpu::instance::VulkanInstance;
use crate::gpu::memory::{classify_memory_types, ClassifyMemoryError, MemoryClassification};
use crate::gpu::physical_device::PhysicalDeviceInfo;
use crate::gpu::queue::{
    capability_names, resolve_queue_families, QueueRequest, ResolveQueueError,
};

/// Priority given to every queue we create. Only one queue is ever busy.
const QUEUE_PRIORITY: f32 = 0.0;

#[derive(thiserror::Error, Debug)]
pub enum ProvisionError {
    #[error("At least one queue must be requested")]
    NoQueues,
    #[error(transparent)]
    Queue(#[from] ResolveQueueError),
    #[error(transparent)]
    Memory(#[from] ClassifyMemoryError),
    #[error(
        "{0} does not support timeline semaphores \
         (needs Vulkan 1.2 and the timelineSemaphore feature)"
    )]
    NoTimelineSemaphore(String),
    #[error("Could not create device: {0}")]
    CreateDevice(vk::Result),
    #[error("Could not create command pool for queue family {family_index}: {result}")]
    CreateCommandPool { family_index: u32, result: vk::Result },
}

impl ProvisionError {
    pub fn kind(&self) -> FatalKind {
        match self {
            ProvisionError::NoQueues | ProvisionError::NoTimelineSemaphore(_) => {
                FatalKind::Configuration
            }
            ProvisionError::Queue(e) => e.kind(),
            ProvisionError::Memory(e) => e.kind(),
            ProvisionError::CreateDevice(result)
            | ProvisionError::CreateCommandPool { result, .. } => FatalKind::from_vk(*result),
        }
    }
}

/// Where one request's queue lives: family, and index within that family.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct QueueSlot {
    pub family_index: u32,
    pub queue_index: u32,
}

/// How many queues to create from one family.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FamilyQueues {
    pub family_index: u32,
    pub queue_count: u32,
}

/// Everything decided before any handle is created.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProvisionPlan {
    /// One per request, in request order.
    pub slots: Vec<QueueSlot>,
    /// One per distinct family, in order of first use.
    pub families: Vec<FamilyQueues>,
    pub memory: MemoryClassification,
}

/// Hands out queue indices within each family.
///
/// Requests that land on the same family get indices 0, 1, 2... Once a
/// family's reported queue count is used up, further requests share index 0.
pub fn plan_queue_slots(
    family_queue_counts: &[u32],
    resolved_families: &[u32],
) -> (Vec<QueueSlot>, Vec<FamilyQueues>) {
    let mut families: Vec<FamilyQueues> = Vec::new();
    let mut slots = Vec::with_capacity(resolved_families.len());

    for &family_index in resolved_families {
        let available = family_queue_counts
            .get(family_index as usize)
            .copied()
            .unwrap_or(1)
            .max(1);
        let position = match families.iter().position(|f| f.family_index == family_index) {
            Some(position) => position,
            None => {
                families.push(FamilyQueues {
                    family_index,
                    queue_count: 0,
                });
                families.len() - 1
            }
        };
        let entry = &mut families[position];
        let queue_index = if entry.queue_count < available {
            entry.queue_count += 1;
            entry.queue_count - 1
        } else {
            0
        };
        slots.push(QueueSlot {
            family_index,
            queue_index,
        });
    }

    (slots, families)
}

/// Creates one command pool per slot, in slot order. On failure the pools
/// created so far are destroyed, newest first, before the error is returned.
fn create_command_pools<P>(
    slots: &[QueueSlot],
    mut create: impl FnMut(u32) -> VkResult<P>,
    mut destroy: impl FnMut(P),
) -> Result<Vec<P>, ProvisionError> {
    let mut pools = Vec::with_capacity(slots.len());
    for slot in slots {
        match create(slot.family_index) {
            Ok(pool) => pools.push(pool),
            Err(result) => {
                while let Some(pool) = pools.pop() {
                    destroy(pool);
                }
                return Err(ProvisionError::CreateCommandPool {
                    family_index: slot.family_index,
                    result,
                });
            }
        }
    }
    Ok(pools)
}

/// A queue created for one request, with its own command pool.
#[derive(Copy, Clone, Debug)]
pub struct ResolvedQueue {
    pub family_index: u32,
    pub queue_index: u32,
    /// Capabilities of the whole family, not just the requested ones.
    pub capabilities: vk::QueueFlags,
    pub queue: vk::Queue,
    pub command_pool: vk::CommandPool,
}

/// Collects queue requests for a physical device, then builds the device.
pub struct DeviceBuilder<'p> {
    physical: &'p PhysicalDeviceInfo,
    requests: Vec<QueueRequest>,
}

impl<'p> DeviceBuilder<'p> {
    pub fn new(physical: &'p PhysicalDeviceInfo) -> Self {
        DeviceBuilder {
            physical,
            requests: Vec::new(),
        }
    }

    /// Registers a queue. Its position among registered queues becomes its
    /// queue index on the built [`DeviceContext`].
    pub fn add_queue(mut self, request: QueueRequest) -> Self {
        self.requests.push(request);
        self
    }

    pub fn requests(&self) -> &[QueueRequest] {
        &self.requests
    }

    /// Resolves families, classifies memory and checks features without
    /// touching the driver.
    pub fn plan(&self) -> Result<ProvisionPlan, ProvisionError> {
        if self.requests.is_empty() {
            return Err(ProvisionError::NoQueues);
        }
        let resolved =
            resolve_queue_families(&self.physical.queue_capabilities(), &self.requests)?;
        let memory = classify_memory_types(&self.physical.memory_types)?;
        if !self.physical.timeline_semaphore {
            return Err(ProvisionError::NoTimelineSemaphore(self.physical.name.clone()));
        }

        let queue_counts: Vec<u32> =
            self.physical.queue_families.iter().map(|f| f.queue_count).collect();
        let (slots, families) = plan_queue_slots(&queue_counts, &resolved);
        Ok(ProvisionPlan { slots, families, memory })
    }

    pub fn build(&self, instance: &Arc<VulkanInstance>) -> Result<DeviceContext, ProvisionError> {
        let plan = self.plan()?;
        let capabilities = self.physical.queue_capabilities();

        for (i, (request, slot)) in self.requests.iter().zip(plan.slots.iter()).enumerate() {
            info!(
                "Queue #{} {} -> family {} ({}), queue {}",
                i,
                request,
                slot.family_index,
                capability_names(capabilities[slot.family_index as usize]).join(", "),
                slot.queue_index
            );
        }
        debug!(
            "Memory types: device-local {}, host-visible {}",
            plan.memory.device_local_index, plan.memory.host_visible_index
        );

        let priorities: Vec<Vec<f32>> = plan
            .families
            .iter()
            .map(|family| vec![QUEUE_PRIORITY; family.queue_count as usize])
            .collect();
        let queue_create_infos: Vec<vk::DeviceQueueCreateInfo<'_>> = plan
            .families
            .iter()
            .zip(priorities.iter())
            .map(|(family, priorities)| {
                vk::DeviceQueueCreateInfo::default()
                    .queue_family_index(family.family_index)
                    .queue_priorities(priorities)
            })
            .collect();

        let mut timeline_features =
            vk::PhysicalDeviceTimelineSemaphoreFeatures::default().timeline_semaphore(true);
        let create_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_create_infos)
            .push_next(&mut timeline_features);

        // SAFETY: the physical device was enumerated from this instance.
        let device = unsafe {
            instance
                .ash_instance()
                .create_device(self.physical.handle, &create_info, None)
        }
        .map_err(ProvisionError::CreateDevice)?;

        let pools = create_command_pools(
            &plan.slots,
            |family_index| {
                let pool_info = vk::CommandPoolCreateInfo::default()
                    .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
                    .queue_family_index(family_index);
                unsafe { device.create_command_pool(&pool_info, None) }
            },
            |pool| unsafe { device.destroy_command_pool(pool, None) },
        );
        let pools = match pools {
            Ok(pools) => pools,
            Err(e) => {
                //SAFETY: Nothing else was created from this device.
                unsafe { device.destroy_device(None) };
                return Err(e);
            }
        };

        let queues = plan
            .slots
            .iter()
            .zip(pools)
            .map(|(slot, command_pool)| ResolvedQueue {
                family_index: slot.family_index,
                queue_index: slot.queue_index,
                capabilities: capabilities[slot.family_index as usize],
                queue: unsafe { device.get_device_queue(slot.family_index, slot.queue_index) },
                command_pool,
            })
            .collect();

        info!("Created logical device on {}", self.physical.name);
        Ok(DeviceContext {
            queues,
            memory: plan.memory,
            max_allocation_size: self.physical.max_memory_allocation_size,
            device_name: self.physical.name.clone(),
            device,
            _instance: instance.clone(),
        })
    }
}

/// Resolves `requests` on `physical` and creates the device in one go.
pub fn provision(
    instance: &Arc<VulkanInstance>,
    physical: &PhysicalDeviceInfo,
    requests: &[QueueRequest],
) -> Result<DeviceContext, ProvisionError> {
    requests
        .iter()
        .fold(DeviceBuilder::new(physical), |builder, request| builder.add_queue(*request))
        .build(instance)
}

/// A logical device, its queues and their command pools.
pub struct DeviceContext {
    queues: Vec<ResolvedQueue>,
    memory: MemoryClassification,
    max_allocation_size: Option<vk::DeviceSize>,
    device_name: String,
    device: ash::Device,
    // Keeps the instance alive until after the device is destroyed.
    _instance: Arc<VulkanInstance>,
}

impl std::fmt::Debug for DeviceContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceContext")
            .field("handle", &self.device.handle())
            .field("device_name", &self.device_name)
            .field("queues", &self.queues)
            .finish_non_exhaustive()
    }
}

impl DeviceContext {
    /// Releases command pools, then the device.
    pub fn teardown(self) {
        drop(self)
    }
}

impl Drop for DeviceContext {
    fn drop(&mut self) {
        debug!("Dropping device {:?} ({})", self.device.handle(), self.device_name);
        //SAFETY: Everything allocated from these pools was freed by its
        //owner, and nothing else holds the device.
        unsafe {
            if let Err(e) = self.device.device_wait_idle() {
                warn!("Device did not go idle before teardown: {}", e);
            }
            for queue in self.queues.drain(..) {
                self.device.destroy_command_pool(queue.command_pool, None);
            }
            self.device.destroy_device(None);
        }
    }
}

impl TransferDevice for DeviceContext {
    type Buffer = vk::Buffer;
    type Memory = vk::DeviceMemory;
    type CommandBuffer = vk::CommandBuffer;
    type Semaphore = vk::Semaphore;

    fn queue_count(&self) -> usize {
        self.queues.len()
    }

    fn queue_family_index(&self, queue_index: usize) -> u32 {
        self.queues[queue_index].family_index
    }

    fn queue_capabilities(&self, queue_index: usize) -> vk::QueueFlags {
        self.queues[queue_index].capabilities
    }

    fn memory_classification(&self) -> MemoryClassification {
        self.memory
    }

    fn max_allocation_size(&self) -> Option<u64> {
        self.max_allocation_size
    }

    fn allocate_command_buffer(&self, queue_index: usize) -> VkResult<vk::CommandBuffer> {
        let info = vk::CommandBufferAllocateInfo::default()
            .command_pool(self.queues[queue_index].command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let buffers = unsafe { self.device.allocate_command_buffers(&info) }?;
        buffers.into_iter().next().ok_or(vk::Result::ERROR_UNKNOWN)
    }

    fn free_command_buffer(&self, queue_index: usize, command_buffer: vk::CommandBuffer) {
        unsafe {
            self.device
                .free_command_buffers(self.queues[queue_index].command_pool, &[command_buffer])
        }
    }

    fn create_timeline_semaphore(&self, initial_value: u64) -> VkResult<vk::Semaphore> {
        let mut type_info = vk::SemaphoreTypeCreateInfo::default()
            .semaphore_type(vk::SemaphoreType::TIMELINE)
            .initial_value(initial_value);
        let info = vk::SemaphoreCreateInfo::default().push_next(&mut type_info);
        unsafe { self.device.create_semaphore(&info, None) }
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        unsafe { self.device.destroy_semaphore(semaphore, None) }
    }

    fn create_buffer(
        &self,
        size: u64,
        usage: vk::BufferUsageFlags,
        queue_family_index: u32,
    ) -> VkResult<vk::Buffer> {
        let families = [queue_family_index];
        let info = vk::BufferCreateInfo::default()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .queue_family_indices(&families);
        unsafe { self.device.create_buffer(&info, None) }
    }

    fn buffer_memory_requirements(&self, buffer: vk::Buffer) -> vk::MemoryRequirements {
        unsafe { self.device.get_buffer_memory_requirements(buffer) }
    }

    fn destroy_buffer(&self, buffer: vk::Buffer) {
        unsafe { self.device.destroy_buffer(buffer, None) }
    }

    fn allocate_memory(&self, size: u64, memory_type_index: u32) -> VkResult<vk::DeviceMemory> {
        let info = vk::MemoryAllocateInfo::default()
            .allocation_size(size)
            .memory_type_index(memory_type_index);
        unsafe { self.device.allocate_memory(&info, None) }
    }

    fn free_memory(&self, memory: vk::DeviceMemory) {
        unsafe { self.device.free_memory(memory, None) }
    }

    fn bind_buffer_memory(&self, buffer: vk::Buffer, memory: vk::DeviceMemory) -> VkResult<()> {
        unsafe { self.device.bind_buffer_memory(buffer, memory, 0) }
    }

    fn record_copy(
        &self,
        command_buffer: vk::CommandBuffer,
        source: vk::Buffer,
        destination: vk::Buffer,
        size: u64,
    ) -> VkResult<()> {
        let begin_info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        let regions = [vk::BufferCopy::default().src_offset(0).dst_offset(0).size(size)];
        unsafe {
            self.device
                .reset_command_buffer(command_buffer, vk::CommandBufferResetFlags::empty())?;
            self.device.begin_command_buffer(command_buffer, &begin_info)?;
            self.device.cmd_copy_buffer(command_buffer, source, destination, &regions);
            self.device.end_command_buffer(command_buffer)
        }
    }

    fn submit_gated(
        &self,
        queue_index: usize,
        command_buffer: vk::CommandBuffer,
        semaphore: vk::Semaphore,
        wait_value: u64,
        signal_value: u64,
    ) -> VkResult<()> {
        let semaphores = [semaphore];
        let wait_values = [wait_value];
        let signal_values = [signal_value];
        let wait_stages = [vk::PipelineStageFlags::TRANSFER];
        let command_buffers = [command_buffer];

        let mut timeline_info = vk::TimelineSemaphoreSubmitInfo::default()
            .wait_semaphore_values(&wait_values)
            .signal_semaphore_values(&signal_values);
        let submit = vk::SubmitInfo::default()
            .wait_semaphores(&semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&semaphores)
            .push_next(&mut timeline_info);

        unsafe {
            self.device
                .queue_submit(self.queues[queue_index].queue, &[submit], vk::Fence::null())
        }
    }

    fn wait_idle(&self) -> VkResult<()> {
        unsafe { self.device.device_wait_idle() }
    }

    fn signal_timeline(&self, semaphore: vk::Semaphore, value: u64) -> VkResult<()> {
        let info = vk::SemaphoreSignalInfo::default().semaphore(semaphore).value(value);
        unsafe { self.device.signal_semaphore(&info) }
    }

    fn wait_timeline(&self, semaphore: vk::Semaphore, value: u64) -> VkResult<()> {
        let semaphores = [semaphore];
        let values = [value];
        let info = vk::SemaphoreWaitInfo::default().semaphores(&semaphores).values(&values);
        unsafe { self.device.wait_semaphores(&info, u64::MAX) }
    }
}

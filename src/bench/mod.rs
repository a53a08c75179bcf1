//! Transfer benchmark.
//!
//! The engine in [`engine`] only talks to the GPU through [`TransferDevice`],
//! which [`DeviceContext`](crate::gpu::DeviceContext) implements over raw
//! Vulkan calls. Every method maps onto one API call, so the engine decides
//! the order of everything that happens on the device.

use ash::prelude::VkResult;
use ash::vk;

use crate::common::FatalKind;
use crate::gpu::memory::MemoryClassification;

pub mod engine;
pub mod sweep;
pub mod timeline;

#[cfg(test)]
pub(crate) mod mock;

pub use self::engine::{run_benchmark, BenchmarkOptions, TransferBenchmark};
pub use self::sweep::{SizeSweep, DEFAULT_MAX_TRANSFER_BYTES, SWEEP_START_BYTES};
pub use self::timeline::{TimelineCounter, TimelinePair};

/// The device operations a transfer benchmark needs.
///
/// Handles passed back in must have come from the same device. Destroy and
/// free methods must only be called once the device no longer uses the
/// handle.
pub trait TransferDevice {
    type Buffer: Copy + std::fmt::Debug;
    type Memory: Copy + std::fmt::Debug;
    type CommandBuffer: Copy + std::fmt::Debug;
    type Semaphore: Copy + std::fmt::Debug;

    fn queue_count(&self) -> usize;
    fn queue_family_index(&self, queue_index: usize) -> u32;
    fn queue_capabilities(&self, queue_index: usize) -> vk::QueueFlags;
    fn memory_classification(&self) -> MemoryClassification;
    /// Largest single allocation the device accepts, if known.
    fn max_allocation_size(&self) -> Option<u64>;

    fn allocate_command_buffer(&self, queue_index: usize) -> VkResult<Self::CommandBuffer>;
    fn free_command_buffer(&self, queue_index: usize, command_buffer: Self::CommandBuffer);
    fn create_timeline_semaphore(&self, initial_value: u64) -> VkResult<Self::Semaphore>;
    fn destroy_semaphore(&self, semaphore: Self::Semaphore);

    fn create_buffer(
        &self,
        size: u64,
        usage: vk::BufferUsageFlags,
        queue_family_index: u32,
    ) -> VkResult<Self::Buffer>;
    fn buffer_memory_requirements(&self, buffer: Self::Buffer) -> vk::MemoryRequirements;
    fn destroy_buffer(&self, buffer: Self::Buffer);
    fn allocate_memory(&self, size: u64, memory_type_index: u32) -> VkResult<Self::Memory>;
    fn free_memory(&self, memory: Self::Memory);
    fn bind_buffer_memory(&self, buffer: Self::Buffer, memory: Self::Memory) -> VkResult<()>;

    /// Re-records `command_buffer` with a single full-size copy.
    fn record_copy(
        &self,
        command_buffer: Self::CommandBuffer,
        source: Self::Buffer,
        destination: Self::Buffer,
        size: u64,
    ) -> VkResult<()>;
    /// Submits `command_buffer` so that it waits for `wait_value` on
    /// `semaphore` at the transfer stage and signals `signal_value` when done.
    fn submit_gated(
        &self,
        queue_index: usize,
        command_buffer: Self::CommandBuffer,
        semaphore: Self::Semaphore,
        wait_value: u64,
        signal_value: u64,
    ) -> VkResult<()>;
    /// Blocks until every queue on the device is idle.
    fn wait_idle(&self) -> VkResult<()>;
    /// Sets the semaphore's counter from the host.
    fn signal_timeline(&self, semaphore: Self::Semaphore, value: u64) -> VkResult<()>;
    /// Blocks, without timeout, until the counter reaches `value`.
    fn wait_timeline(&self, semaphore: Self::Semaphore, value: u64) -> VkResult<()>;
}

/// One measurement: how long a copy of `size` bytes took.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Sample {
    pub size: u64,
    pub elapsed_ms: f64,
}

impl Sample {
    /// MiB per second for this sample alone. `None` if the timer read zero.
    pub fn throughput_mib_per_s(&self) -> Option<f64> {
        if self.elapsed_ms > 0.0 {
            Some((self.size as f64 / (1024.0 * 1024.0)) / (self.elapsed_ms / 1000.0))
        } else {
            None
        }
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum BenchmarkError {
    #[error("Queue index {queue_index} is out of range, the device has {queue_count} queue(s)")]
    NoSuchQueue { queue_index: usize, queue_count: usize },
    #[error("Memory type {memory_type_index} can't back a {size}-byte buffer ({allowed_types:#b})")]
    IncompatibleMemoryType {
        size: u64,
        memory_type_index: u32,
        allowed_types: u32,
    },
    #[error("Could not allocate command buffer: {0}")]
    AllocateCommandBuffer(vk::Result),
    #[error("Could not create timeline semaphore: {0}")]
    CreateSemaphore(vk::Result),
    #[error("Could not create {size}-byte buffer: {result}")]
    CreateBuffer { size: u64, result: vk::Result },
    #[error("Could not allocate {size} bytes from memory type {memory_type_index}: {result}")]
    AllocateMemory {
        size: u64,
        memory_type_index: u32,
        result: vk::Result,
    },
    #[error("Could not bind {size}-byte buffer to its memory: {result}")]
    BindMemory { size: u64, result: vk::Result },
    #[error("Could not record copy command: {0}")]
    RecordCommands(vk::Result),
    #[error("Could not submit copy: {0}")]
    Submit(vk::Result),
    #[error("Device did not go idle: {0}")]
    WaitIdle(vk::Result),
    #[error("Could not signal timeline value {value}: {result}")]
    Signal { value: u64, result: vk::Result },
    #[error("Could not wait for timeline value {value}: {result}")]
    Wait { value: u64, result: vk::Result },
}

impl BenchmarkError {
    pub fn kind(&self) -> FatalKind {
        match self {
            BenchmarkError::NoSuchQueue { .. } | BenchmarkError::IncompatibleMemoryType { .. } => {
                FatalKind::Configuration
            }
            BenchmarkError::AllocateCommandBuffer(_)
            | BenchmarkError::CreateSemaphore(_)
            | BenchmarkError::CreateBuffer { .. }
            | BenchmarkError::AllocateMemory { .. }
            | BenchmarkError::BindMemory { .. } => FatalKind::Resource,
            BenchmarkError::RecordCommands(result)
            | BenchmarkError::Submit(result)
            | BenchmarkError::WaitIdle(result)
            | BenchmarkError::Signal { result, .. }
            | BenchmarkError::Wait { result, .. } => FatalKind::from_vk(*result),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn throughput_is_per_sample() {
        let sample = Sample {
            size: 1024 * 1024,
            elapsed_ms: 1.0,
        };
        assert_eq!(sample.throughput_mib_per_s(), Some(1000.0));
        let instant = Sample {
            size: 4,
            elapsed_ms: 0.0,
        };
        assert_eq!(instant.throughput_mib_per_s(), None);
    }
}

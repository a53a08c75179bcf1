//! In-memory [`TransferDevice`] for engine tests.
//!
//! Submissions complete synchronously when the host signals their wait value,
//! or, with [`MockDevice::defer_completion`], only once the host waits on the
//! semaphore or drains the device. Calls that would block forever on a real
//! device fail instead: waiting for a value nothing will signal returns
//! `TIMEOUT`, and waiting for idle while a gated submission is pending returns
//! `ERROR_DEVICE_LOST`.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};

use ash::prelude::VkResult;
use ash::vk;

use crate::bench::TransferDevice;
use crate::gpu::memory::MemoryClassification;

#[derive(Debug)]
struct PendingCopy {
    semaphore: u64,
    wait_value: u64,
    signal_value: u64,
    size: u64,
    released: bool,
}

#[derive(Debug, Default)]
struct MockState {
    next_handle: u64,
    buffers: HashMap<u64, u64>,
    allocations: HashMap<u64, u64>,
    command_buffers: HashSet<u64>,
    recorded: HashMap<u64, u64>,
    semaphores: HashMap<u64, u64>,
    pending: Option<PendingCopy>,

    completed_copies: Vec<u64>,
    submitted_values: Vec<(u64, u64)>,
    host_signals: Vec<u64>,
    allocation_sizes: Vec<u64>,
    frees_while_busy: usize,

    alignment: u64,
    allowed_memory_types: u32,
    max_allocation_size: Option<u64>,
    fail_allocations_from: Option<u64>,
    fail_next_signal: bool,
    fail_waits: bool,
    defer_completion: bool,
}

impl MockState {
    fn handle(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }

    /// Finishes the pending copy if the host has released it.
    fn complete_released(&mut self) {
        if !self.pending.as_ref().is_some_and(|pending| pending.released) {
            return;
        }
        if let Some(copy) = self.pending.take() {
            self.semaphores.insert(copy.semaphore, copy.signal_value);
            self.completed_copies.push(copy.size);
        }
    }

    fn note_release(&mut self) {
        if self.pending.is_some() {
            self.frees_while_busy += 1;
        }
    }
}

pub struct MockDevice {
    state: RefCell<MockState>,
}

impl MockDevice {
    pub fn new() -> Self {
        MockDevice {
            state: RefCell::new(MockState {
                alignment: 1,
                allowed_memory_types: 0b11,
                ..MockState::default()
            }),
        }
    }

    pub fn set_alignment(&self, alignment: u64) {
        self.state.borrow_mut().alignment = alignment;
    }

    pub fn set_allowed_memory_types(&self, bits: u32) {
        self.state.borrow_mut().allowed_memory_types = bits;
    }

    pub fn set_max_allocation_size(&self, limit: Option<u64>) {
        self.state.borrow_mut().max_allocation_size = limit;
    }

    /// Allocations of at least `size` bytes fail with out-of-device-memory.
    pub fn fail_allocations_from(&self, size: u64) {
        self.state.borrow_mut().fail_allocations_from = Some(size);
    }

    pub fn fail_next_signal(&self) {
        self.state.borrow_mut().fail_next_signal = true;
    }

    pub fn fail_waits(&self) {
        self.state.borrow_mut().fail_waits = true;
    }

    /// Released copies keep running until the host waits or drains.
    pub fn defer_completion(&self) {
        self.state.borrow_mut().defer_completion = true;
    }

    /// Buffers destroyed or memory freed while a submitted copy was not
    /// known to be finished.
    pub fn frees_while_busy(&self) -> usize {
        self.state.borrow().frees_while_busy
    }

    pub fn live_buffers(&self) -> usize {
        self.state.borrow().buffers.len()
    }

    pub fn live_allocations(&self) -> usize {
        self.state.borrow().allocations.len()
    }

    pub fn live_command_buffers(&self) -> usize {
        self.state.borrow().command_buffers.len()
    }

    pub fn live_semaphores(&self) -> usize {
        self.state.borrow().semaphores.len()
    }

    pub fn has_pending_copy(&self) -> bool {
        self.state.borrow().pending.is_some()
    }

    pub fn completed_copies(&self) -> Vec<u64> {
        self.state.borrow().completed_copies.clone()
    }

    /// (wait, signal) of every gated submission, in order.
    pub fn submitted_values(&self) -> Vec<(u64, u64)> {
        self.state.borrow().submitted_values.clone()
    }

    pub fn host_signals(&self) -> Vec<u64> {
        self.state.borrow().host_signals.clone()
    }

    pub fn allocation_sizes(&self) -> Vec<u64> {
        self.state.borrow().allocation_sizes.clone()
    }
}

impl TransferDevice for MockDevice {
    type Buffer = u64;
    type Memory = u64;
    type CommandBuffer = u64;
    type Semaphore = u64;

    fn queue_count(&self) -> usize {
        1
    }

    fn queue_family_index(&self, queue_index: usize) -> u32 {
        assert_eq!(queue_index, 0);
        1
    }

    fn queue_capabilities(&self, _queue_index: usize) -> vk::QueueFlags {
        vk::QueueFlags::TRANSFER
    }

    fn memory_classification(&self) -> MemoryClassification {
        MemoryClassification {
            device_local_index: 0,
            host_visible_index: 1,
        }
    }

    fn max_allocation_size(&self) -> Option<u64> {
        self.state.borrow().max_allocation_size
    }

    fn allocate_command_buffer(&self, queue_index: usize) -> VkResult<u64> {
        assert_eq!(queue_index, 0);
        let mut state = self.state.borrow_mut();
        let handle = state.handle();
        state.command_buffers.insert(handle);
        Ok(handle)
    }

    fn free_command_buffer(&self, _queue_index: usize, command_buffer: u64) {
        let mut state = self.state.borrow_mut();
        assert!(
            state.command_buffers.remove(&command_buffer),
            "command buffer freed twice"
        );
        state.recorded.remove(&command_buffer);
    }

    fn create_timeline_semaphore(&self, initial_value: u64) -> VkResult<u64> {
        let mut state = self.state.borrow_mut();
        let handle = state.handle();
        state.semaphores.insert(handle, initial_value);
        Ok(handle)
    }

    fn destroy_semaphore(&self, semaphore: u64) {
        let mut state = self.state.borrow_mut();
        assert!(
            state.pending.is_none(),
            "semaphore destroyed with a pending submission"
        );
        assert!(state.semaphores.remove(&semaphore).is_some(), "semaphore destroyed twice");
    }

    fn create_buffer(
        &self,
        size: u64,
        _usage: vk::BufferUsageFlags,
        queue_family_index: u32,
    ) -> VkResult<u64> {
        assert_eq!(queue_family_index, 1);
        if size == 0 {
            return Err(vk::Result::ERROR_UNKNOWN);
        }
        let mut state = self.state.borrow_mut();
        let handle = state.handle();
        state.buffers.insert(handle, size);
        Ok(handle)
    }

    fn buffer_memory_requirements(&self, buffer: u64) -> vk::MemoryRequirements {
        let state = self.state.borrow();
        let size = state.buffers[&buffer];
        vk::MemoryRequirements {
            size: size.div_ceil(state.alignment) * state.alignment,
            alignment: state.alignment,
            memory_type_bits: state.allowed_memory_types,
        }
    }

    fn destroy_buffer(&self, buffer: u64) {
        let mut state = self.state.borrow_mut();
        state.note_release();
        assert!(state.buffers.remove(&buffer).is_some(), "buffer destroyed twice");
    }

    fn allocate_memory(&self, size: u64, memory_type_index: u32) -> VkResult<u64> {
        let mut state = self.state.borrow_mut();
        assert!(state.allowed_memory_types & (1 << memory_type_index) != 0);
        if state.fail_allocations_from.is_some_and(|limit| size >= limit) {
            return Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
        }
        let handle = state.handle();
        state.allocations.insert(handle, size);
        state.allocation_sizes.push(size);
        Ok(handle)
    }

    fn free_memory(&self, memory: u64) {
        let mut state = self.state.borrow_mut();
        state.note_release();
        assert!(state.allocations.remove(&memory).is_some(), "memory freed twice");
    }

    fn bind_buffer_memory(&self, buffer: u64, memory: u64) -> VkResult<()> {
        let required = self.buffer_memory_requirements(buffer).size;
        let state = self.state.borrow();
        if state.allocations[&memory] < required {
            return Err(vk::Result::ERROR_UNKNOWN);
        }
        Ok(())
    }

    fn record_copy(
        &self,
        command_buffer: u64,
        source: u64,
        destination: u64,
        size: u64,
    ) -> VkResult<()> {
        let mut state = self.state.borrow_mut();
        assert!(state.pending.is_none(), "re-recorded a command buffer still in use");
        assert!(state.buffers[&source] >= size);
        assert!(state.buffers[&destination] >= size);
        state.recorded.insert(command_buffer, size);
        Ok(())
    }

    fn submit_gated(
        &self,
        _queue_index: usize,
        command_buffer: u64,
        semaphore: u64,
        wait_value: u64,
        signal_value: u64,
    ) -> VkResult<()> {
        let mut state = self.state.borrow_mut();
        if state.pending.is_some() {
            return Err(vk::Result::ERROR_DEVICE_LOST);
        }
        let current = state.semaphores[&semaphore];
        if wait_value <= current || signal_value <= wait_value {
            return Err(vk::Result::ERROR_UNKNOWN);
        }
        let size = match state.recorded.get(&command_buffer) {
            Some(size) => *size,
            None => return Err(vk::Result::ERROR_UNKNOWN),
        };
        state.submitted_values.push((wait_value, signal_value));
        state.pending = Some(PendingCopy {
            semaphore,
            wait_value,
            signal_value,
            size,
            released: false,
        });
        Ok(())
    }

    fn wait_idle(&self) -> VkResult<()> {
        let mut state = self.state.borrow_mut();
        state.complete_released();
        if state.pending.is_some() {
            Err(vk::Result::ERROR_DEVICE_LOST)
        } else {
            Ok(())
        }
    }

    fn signal_timeline(&self, semaphore: u64, value: u64) -> VkResult<()> {
        let mut state = self.state.borrow_mut();
        if state.fail_next_signal {
            state.fail_next_signal = false;
            return Err(vk::Result::ERROR_DEVICE_LOST);
        }
        if value <= state.semaphores[&semaphore] {
            return Err(vk::Result::ERROR_UNKNOWN);
        }
        state.host_signals.push(value);
        state.semaphores.insert(semaphore, value);

        if let Some(pending) = state.pending.as_mut() {
            if pending.semaphore == semaphore && pending.wait_value <= value {
                pending.released = true;
            }
        }
        if !state.defer_completion {
            state.complete_released();
        }
        Ok(())
    }

    fn wait_timeline(&self, semaphore: u64, value: u64) -> VkResult<()> {
        let mut state = self.state.borrow_mut();
        if state.fail_waits {
            return Err(vk::Result::ERROR_DEVICE_LOST);
        }
        state.complete_released();
        if state.semaphores[&semaphore] >= value {
            Ok(())
        } else {
            Err(vk::Result::TIMEOUT)
        }
    }
}

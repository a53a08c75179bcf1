//! The timed copy sweep.
//!
//! Each iteration copies `size` bytes from host-visible memory into
//! device-local memory on one queue. The copy is submitted gated on a
//! timeline semaphore value that only the host signals, so the host decides
//! exactly when the device starts:
//!
//! 1. drain the device,
//! 2. submit the copy (waits for `wait_value`, signals `signal_value`),
//! 3. start the timer and signal `wait_value` from the host,
//! 4. block until `signal_value`, stop the timer,
//! 5. drain the device again.
//!
//! Buffers and their memory live for one iteration. The command buffer and
//! the semaphore live as long as the [`TransferBenchmark`].

use ash::vk;
use log::{debug, trace, warn};

use crate::bench::sweep::{SizeSweep, DEFAULT_MAX_TRANSFER_BYTES};
use crate::bench::timeline::{TimelineCounter, TimelinePair};
use crate::bench::{BenchmarkError, Sample, TransferDevice};
use crate::gpu::memory::MemoryClassification;
use crate::stopwatch::{InstantStopwatch, Stopwatch};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct BenchmarkOptions {
    /// Largest transfer, inclusive.
    pub max_transfer_size: u64,
    /// Also stop at the device's maximum allocation size.
    pub clamp_to_device_limit: bool,
}

impl Default for BenchmarkOptions {
    fn default() -> Self {
        BenchmarkOptions {
            max_transfer_size: DEFAULT_MAX_TRANSFER_BYTES,
            clamp_to_device_limit: false,
        }
    }
}

/// A buffer with its own memory allocation bound at offset 0. Frees the
/// memory, then destroys the buffer, when dropped.
struct BoundBuffer<'d, D: TransferDevice> {
    device: &'d D,
    buffer: D::Buffer,
    memory: Option<D::Memory>,
}

impl<'d, D: TransferDevice> BoundBuffer<'d, D> {
    fn new(
        device: &'d D,
        size: u64,
        usage: vk::BufferUsageFlags,
        queue_family_index: u32,
        memory_type_index: u32,
    ) -> Result<Self, BenchmarkError> {
        let buffer = device
            .create_buffer(size, usage, queue_family_index)
            .map_err(|result| BenchmarkError::CreateBuffer { size, result })?;
        let mut bound = BoundBuffer {
            device,
            buffer,
            memory: None,
        };

        let requirements = device.buffer_memory_requirements(buffer);
        let type_bit = 1u32.checked_shl(memory_type_index).unwrap_or(0);
        if requirements.memory_type_bits & type_bit == 0 {
            return Err(BenchmarkError::IncompatibleMemoryType {
                size,
                memory_type_index,
                allowed_types: requirements.memory_type_bits,
            });
        }

        // Never smaller than the buffer, or binding at offset 0 is invalid.
        let allocation_size = requirements.size.max(size);
        let memory = device
            .allocate_memory(allocation_size, memory_type_index)
            .map_err(|result| BenchmarkError::AllocateMemory {
                size: allocation_size,
                memory_type_index,
                result,
            })?;
        bound.memory = Some(memory);

        device
            .bind_buffer_memory(buffer, memory)
            .map_err(|result| BenchmarkError::BindMemory { size, result })?;
        Ok(bound)
    }
}

impl<'d, D: TransferDevice> Drop for BoundBuffer<'d, D> {
    fn drop(&mut self) {
        if let Some(memory) = self.memory.take() {
            self.device.free_memory(memory);
        }
        self.device.destroy_buffer(self.buffer);
    }
}

/// A submitted copy whose completion the host has not observed yet.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum InFlight {
    /// Still gated on the host signal.
    Gated(TimelinePair),
    /// Released, possibly still running.
    Released,
}

/// Lazily runs the sweep, one [`Sample`] per size.
///
/// The first error ends the sequence: it is yielded once and every later
/// call to `next` returns `None`. A finished benchmark cannot be restarted;
/// build a new one.
pub struct TransferBenchmark<'d, D: TransferDevice, S: Stopwatch = InstantStopwatch> {
    device: &'d D,
    queue_index: usize,
    queue_family_index: u32,
    memory: MemoryClassification,
    command_buffer: D::CommandBuffer,
    semaphore: D::Semaphore,
    timeline: TimelineCounter,
    in_flight: Option<InFlight>,
    sweep: SizeSweep,
    stopwatch: S,
    finished: bool,
}

impl<'d, D: TransferDevice> TransferBenchmark<'d, D, InstantStopwatch> {
    /// Sweeps 4 bytes to 2 GiB on queue `queue_index` of `device`.
    pub fn new(device: &'d D, queue_index: usize) -> Result<Self, BenchmarkError> {
        Self::with_options(
            device,
            queue_index,
            BenchmarkOptions::default(),
            InstantStopwatch::new(),
        )
    }
}

impl<'d, D: TransferDevice, S: Stopwatch> TransferBenchmark<'d, D, S> {
    pub fn with_options(
        device: &'d D,
        queue_index: usize,
        options: BenchmarkOptions,
        stopwatch: S,
    ) -> Result<Self, BenchmarkError> {
        let queue_count = device.queue_count();
        if queue_index >= queue_count {
            return Err(BenchmarkError::NoSuchQueue {
                queue_index,
                queue_count,
            });
        }

        let command_buffer = device
            .allocate_command_buffer(queue_index)
            .map_err(BenchmarkError::AllocateCommandBuffer)?;

        let timeline = TimelineCounter::new(0);
        let semaphore = match device.create_timeline_semaphore(timeline.current()) {
            Ok(semaphore) => semaphore,
            Err(result) => {
                device.free_command_buffer(queue_index, command_buffer);
                return Err(BenchmarkError::CreateSemaphore(result));
            }
        };

        let limit = if options.clamp_to_device_limit {
            device.max_allocation_size()
        } else {
            None
        };
        let sweep = SizeSweep::clamped(options.max_transfer_size, limit);
        debug!(
            "Benchmarking queue {} (family {}): {} sizes up to {} bytes",
            queue_index,
            device.queue_family_index(queue_index),
            sweep.len(),
            sweep.max_bytes()
        );

        Ok(TransferBenchmark {
            device,
            queue_index,
            queue_family_index: device.queue_family_index(queue_index),
            memory: device.memory_classification(),
            command_buffer,
            semaphore,
            timeline,
            in_flight: None,
            sweep,
            stopwatch,
            finished: false,
        })
    }

    pub fn queue_index(&self) -> usize {
        self.queue_index
    }

    pub fn queue_family_index(&self) -> u32 {
        self.queue_family_index
    }

    /// Sizes not yet measured.
    pub fn sizes_remaining(&self) -> usize {
        if self.finished {
            0
        } else {
            self.sweep.len()
        }
    }

    fn run_iteration(&mut self, size: u64) -> Result<Sample, BenchmarkError> {
        let device = self.device;

        let source = BoundBuffer::new(
            device,
            size,
            vk::BufferUsageFlags::TRANSFER_SRC,
            self.queue_family_index,
            self.memory.host_visible_index,
        )?;
        let destination = BoundBuffer::new(
            device,
            size,
            vk::BufferUsageFlags::TRANSFER_DST,
            self.queue_family_index,
            self.memory.device_local_index,
        )?;

        device
            .record_copy(self.command_buffer, source.buffer, destination.buffer, size)
            .map_err(BenchmarkError::RecordCommands)?;

        let pair = self.timeline.advance();

        // Must happen before the gated submit: the queue would never go idle
        // while it waits on a value only we can signal.
        device.wait_idle().map_err(BenchmarkError::WaitIdle)?;
        device
            .submit_gated(
                self.queue_index,
                self.command_buffer,
                self.semaphore,
                pair.wait_value,
                pair.signal_value,
            )
            .map_err(BenchmarkError::Submit)?;
        self.in_flight = Some(InFlight::Gated(pair));

        let elapsed_ms = match self.measure(pair) {
            Ok(elapsed_ms) => elapsed_ms,
            Err(e) => {
                // The buffers drop on return, so the copy must be over first.
                self.settle_in_flight();
                return Err(e);
            }
        };
        device.wait_idle().map_err(BenchmarkError::WaitIdle)?;

        trace!("{} bytes in {:.4}ms", size, elapsed_ms);
        Ok(Sample { size, elapsed_ms })
    }

    /// The timed window: release the queue, wait for it to finish.
    fn measure(&mut self, pair: TimelinePair) -> Result<f64, BenchmarkError> {
        self.stopwatch.start();
        self.device
            .signal_timeline(self.semaphore, pair.wait_value)
            .map_err(|result| BenchmarkError::Signal {
                value: pair.wait_value,
                result,
            })?;
        self.in_flight = Some(InFlight::Released);
        self.device
            .wait_timeline(self.semaphore, pair.signal_value)
            .map_err(|result| BenchmarkError::Wait {
                value: pair.signal_value,
                result,
            })?;
        let elapsed_ms = self.stopwatch.stop();
        self.in_flight = None;
        Ok(elapsed_ms)
    }

    /// Brings an unfinished submission to an end so its buffers can be
    /// destroyed: releases it if it is still gated, then drains the device.
    /// Best effort; we're already failing.
    fn settle_in_flight(&mut self) {
        let in_flight = match self.in_flight.take() {
            Some(in_flight) => in_flight,
            None => return,
        };
        if let InFlight::Gated(pair) = in_flight {
            if let Err(e) = self.device.signal_timeline(self.semaphore, pair.wait_value) {
                warn!(
                    "Could not release pending copy at timeline value {}: {}",
                    pair.wait_value, e
                );
                return;
            }
        }
        if let Err(e) = self.device.wait_idle() {
            warn!("Device did not go idle after a failed copy: {}", e);
        }
    }
}

/// Default sweep on `queue_index` of `device`. Nothing runs until the
/// returned iterator is pulled.
pub fn run_benchmark<D: TransferDevice>(
    device: &D,
    queue_index: usize,
) -> Result<TransferBenchmark<'_, D>, BenchmarkError> {
    TransferBenchmark::new(device, queue_index)
}

impl<'d, D: TransferDevice, S: Stopwatch> Iterator for TransferBenchmark<'d, D, S> {
    type Item = Result<Sample, BenchmarkError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        let size = match self.sweep.next() {
            Some(size) => size,
            None => {
                self.finished = true;
                return None;
            }
        };
        let result = self.run_iteration(size);
        if result.is_err() {
            self.finished = true;
        }
        Some(result)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, Some(self.sizes_remaining()))
    }
}

impl<'d, D: TransferDevice, S: Stopwatch> std::iter::FusedIterator
    for TransferBenchmark<'d, D, S>
{
}

impl<'d, D: TransferDevice, S: Stopwatch> Drop for TransferBenchmark<'d, D, S> {
    fn drop(&mut self) {
        self.settle_in_flight();
        if let Err(e) = self.device.wait_idle() {
            warn!("Device did not go idle before benchmark teardown: {}", e);
        }
        self.device.free_command_buffer(self.queue_index, self.command_buffer);
        self.device.destroy_semaphore(self.semaphore);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::bench::mock::MockDevice;
    use crate::common::FatalKind;

    /// Advances by a fixed step per measurement.
    struct StepStopwatch {
        step: f64,
    }

    impl Stopwatch for StepStopwatch {
        fn start(&mut self) {}
        fn stop(&mut self) -> f64 {
            self.step
        }
    }

    #[test]
    fn one_sample_per_doubling_step() {
        let device = MockDevice::new();
        let samples: Vec<Sample> = TransferBenchmark::new(&device, 0)
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();

        assert_eq!(samples.len(), 30);
        let expected: Vec<u64> = (2..=31).map(|shift| 1u64 << shift).collect();
        assert_eq!(samples.iter().map(|s| s.size).collect::<Vec<_>>(), expected);
        assert!(samples.iter().all(|s| s.elapsed_ms >= 0.0));
        assert_eq!(device.completed_copies(), expected);
    }

    #[test]
    fn everything_is_released() {
        let device = MockDevice::new();
        {
            let mut bench = TransferBenchmark::new(&device, 0).unwrap();
            let first = bench.next().unwrap().unwrap();
            assert_eq!(first.size, 4);
            // Per-iteration resources are gone as soon as the sample is out.
            assert_eq!(device.live_buffers(), 0);
            assert_eq!(device.live_allocations(), 0);
            assert_eq!(device.live_command_buffers(), 1);
            assert_eq!(device.live_semaphores(), 1);
        }
        assert_eq!(device.live_command_buffers(), 0);
        assert_eq!(device.live_semaphores(), 0);
    }

    #[test]
    fn timeline_values_never_repeat() {
        let device = MockDevice::new();
        let count = TransferBenchmark::new(&device, 0).unwrap().count();
        assert_eq!(count, 30);

        let submitted = device.submitted_values();
        assert_eq!(submitted.len(), 30);
        let flat: Vec<u64> = submitted
            .iter()
            .flat_map(|(wait, signal)| [*wait, *signal])
            .collect();
        assert!(flat.windows(2).all(|w| w[1] > w[0]));
        // The host releases each copy with exactly the value it waits on.
        let waits: Vec<u64> = submitted.iter().map(|(wait, _)| *wait).collect();
        assert_eq!(device.host_signals(), waits);
    }

    #[test]
    fn allocation_failure_ends_the_run() {
        let device = MockDevice::new();
        device.fail_allocations_from(1024);

        let results: Vec<Result<Sample, BenchmarkError>> =
            TransferBenchmark::new(&device, 0).unwrap().collect();

        assert_eq!(results.len(), 9);
        assert!(results[..8].iter().all(|r| r.is_ok()));
        let err = results[8].clone().unwrap_err();
        assert!(matches!(err, BenchmarkError::AllocateMemory { size: 1024, .. }));
        assert_eq!(err.kind(), FatalKind::Resource);

        assert_eq!(device.live_buffers(), 0);
        assert_eq!(device.live_allocations(), 0);
        assert_eq!(device.live_semaphores(), 0);
    }

    #[test]
    fn failed_benchmark_stays_finished() {
        let device = MockDevice::new();
        device.fail_allocations_from(4);
        let mut bench = TransferBenchmark::new(&device, 0).unwrap();
        assert!(matches!(bench.next(), Some(Err(_))));
        assert!(bench.next().is_none());
        assert!(bench.next().is_none());
        assert_eq!(bench.sizes_remaining(), 0);
    }

    #[test]
    fn wait_failure_drains_before_freeing() {
        let device = MockDevice::new();
        // The released copy is still running when the host wait fails.
        device.defer_completion();
        device.fail_waits();
        let mut bench = TransferBenchmark::new(&device, 0).unwrap();
        let err = bench.next().unwrap().unwrap_err();
        assert!(matches!(err, BenchmarkError::Wait { value: 3, .. }));

        assert_eq!(device.frees_while_busy(), 0);
        assert_eq!(device.completed_copies(), vec![4]);
        assert_eq!(device.live_buffers(), 0);
        assert_eq!(device.live_allocations(), 0);
        drop(bench);
        assert_eq!(device.live_semaphores(), 0);
    }

    #[test]
    fn copies_finish_before_their_buffers_go() {
        let device = MockDevice::new();
        device.defer_completion();
        let options = BenchmarkOptions {
            max_transfer_size: 1 << 16,
            clamp_to_device_limit: false,
        };
        let samples: Vec<Sample> =
            TransferBenchmark::with_options(&device, 0, options, InstantStopwatch::new())
                .unwrap()
                .collect::<Result<_, _>>()
                .unwrap();
        assert_eq!(samples.len(), 15);
        assert_eq!(device.frees_while_busy(), 0);
    }

    #[test]
    fn run_benchmark_sweeps_default_range() {
        let device = MockDevice::new();
        let sizes: Vec<u64> = run_benchmark(&device, 0)
            .unwrap()
            .map(|sample| sample.unwrap().size)
            .collect();
        assert_eq!(sizes.len(), 30);
        assert_eq!(sizes.first(), Some(&4));
        assert_eq!(sizes.last(), Some(&(2 * 1024 * 1024 * 1024)));
        assert!(sizes.windows(2).all(|w| w[1] == w[0] * 2));
        assert_eq!(device.live_buffers(), 0);
        assert_eq!(device.live_command_buffers(), 0);
    }

    #[test]
    fn signal_failure_releases_pending_copy() {
        let device = MockDevice::new();
        device.fail_next_signal();
        let mut bench = TransferBenchmark::new(&device, 0).unwrap();
        let err = bench.next().unwrap().unwrap_err();
        assert!(matches!(err, BenchmarkError::Signal { value: 2, .. }));
        assert_eq!(err.kind(), FatalKind::Protocol);
        // The retry in the error path let the gated copy finish.
        assert!(!device.has_pending_copy());
        assert_eq!(device.completed_copies(), vec![4]);
        drop(bench);
        assert_eq!(device.live_buffers(), 0);
        assert_eq!(device.live_semaphores(), 0);
    }

    #[test]
    fn queue_index_out_of_range() {
        let device = MockDevice::new();
        let err = TransferBenchmark::new(&device, 3).err().unwrap();
        assert_eq!(
            err,
            BenchmarkError::NoSuchQueue {
                queue_index: 3,
                queue_count: 1
            }
        );
        assert_eq!(err.kind(), FatalKind::Configuration);
        assert_eq!(device.live_command_buffers(), 0);
    }

    #[test]
    fn memory_type_must_be_allowed_by_buffer() {
        let device = MockDevice::new();
        // Only the device-local type (0) may back buffers.
        device.set_allowed_memory_types(0b01);
        let err = TransferBenchmark::new(&device, 0).unwrap().next().unwrap().unwrap_err();
        assert!(matches!(
            err,
            BenchmarkError::IncompatibleMemoryType {
                memory_type_index: 1,
                ..
            }
        ));
        assert_eq!(err.kind(), FatalKind::Configuration);
        assert_eq!(device.live_buffers(), 0);
    }

    #[test]
    fn allocations_cover_alignment() {
        let device = MockDevice::new();
        device.set_alignment(256);
        let samples: Vec<Sample> = TransferBenchmark::with_options(
            &device,
            0,
            BenchmarkOptions {
                max_transfer_size: 1024,
                clamp_to_device_limit: false,
            },
            InstantStopwatch::new(),
        )
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();
        assert_eq!(samples.len(), 9);
        assert!(device.allocation_sizes().iter().all(|size| *size >= 256));
    }

    #[test]
    fn device_limit_clamps_sweep() {
        let device = MockDevice::new();
        device.set_max_allocation_size(Some(1 << 20));
        let options = BenchmarkOptions {
            clamp_to_device_limit: true,
            ..BenchmarkOptions::default()
        };
        let bench =
            TransferBenchmark::with_options(&device, 0, options, InstantStopwatch::new()).unwrap();
        assert_eq!(bench.sizes_remaining(), 19);
        let sizes: Vec<u64> = bench.map(|r| r.unwrap().size).collect();
        assert_eq!(sizes.last(), Some(&(1 << 20)));
    }

    #[test]
    fn elapsed_comes_from_stopwatch() {
        let device = MockDevice::new();
        let options = BenchmarkOptions {
            max_transfer_size: 64,
            clamp_to_device_limit: false,
        };
        let samples: Vec<Sample> =
            TransferBenchmark::with_options(&device, 0, options, StepStopwatch { step: 1.25 })
                .unwrap()
                .collect::<Result<_, _>>()
                .unwrap();
        assert_eq!(samples.len(), 5);
        assert!(samples.iter().all(|s| s.elapsed_ms == 1.25));
    }
}

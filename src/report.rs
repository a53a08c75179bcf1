//! Everything the binary prints to stdout.

use std::io::Write;

use ash::vk;
use serde::{Deserialize, Serialize};

use crate::bench::Sample;
use crate::gpu::physical_device::PhysicalDeviceInfo;
use crate::gpu::queue::capability_names;

pub const CSV_HEADER: &str = "size_bytes,elapsed_ms,throughput_mib_s";

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutputFormat {
    /// `Uploading N bytes: X.XXms`, one line per sample.
    #[default]
    Text,
    Csv,
}

/// Formats one sample without a trailing newline.
pub fn format_sample(sample: &Sample, format: OutputFormat) -> String {
    match format {
        OutputFormat::Text => {
            format!("Uploading {} bytes: {:.2}ms", sample.size, sample.elapsed_ms)
        }
        OutputFormat::Csv => match sample.throughput_mib_per_s() {
            Some(throughput) => {
                format!("{},{:.4},{:.2}", sample.size, sample.elapsed_ms, throughput)
            }
            None => format!("{},{:.4},", sample.size, sample.elapsed_ms),
        },
    }
}

/// Writes samples as they arrive, flushing after each so redirected output
/// is never behind the benchmark.
pub struct SampleWriter<W: Write> {
    out: W,
    format: OutputFormat,
    header_written: bool,
}

impl<W: Write> SampleWriter<W> {
    pub fn new(out: W, format: OutputFormat) -> Self {
        SampleWriter {
            out,
            format,
            header_written: false,
        }
    }

    pub fn write_sample(&mut self, sample: &Sample) -> std::io::Result<()> {
        if self.format == OutputFormat::Csv && !self.header_written {
            writeln!(self.out, "{}", CSV_HEADER)?;
            self.header_written = true;
        }
        writeln!(self.out, "{}", format_sample(sample, self.format))?;
        self.out.flush()
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

/// "Graphics, Transfer" style list, or "(none)".
pub fn format_capabilities(flags: vk::QueueFlags) -> String {
    let names = capability_names(flags);
    if names.is_empty() {
        String::from("(none)")
    } else {
        names.join(", ")
    }
}

const MEMORY_PROPERTY_NAMES: [(vk::MemoryPropertyFlags, &str); 6] = [
    (vk::MemoryPropertyFlags::DEVICE_LOCAL, "Device local"),
    (vk::MemoryPropertyFlags::HOST_VISIBLE, "Host visible"),
    (vk::MemoryPropertyFlags::HOST_COHERENT, "Host coherent"),
    (vk::MemoryPropertyFlags::HOST_CACHED, "Host cached"),
    (vk::MemoryPropertyFlags::LAZILY_ALLOCATED, "Lazily allocated"),
    (vk::MemoryPropertyFlags::PROTECTED, "Protected"),
];

pub fn format_memory_properties(flags: vk::MemoryPropertyFlags) -> String {
    let names: Vec<&str> = MEMORY_PROPERTY_NAMES
        .iter()
        .filter(|(flag, _)| flags.contains(*flag))
        .map(|(_, name)| *name)
        .collect();
    if names.is_empty() {
        String::from("(none)")
    } else {
        names.join(", ")
    }
}

fn device_type_name(device_type: vk::PhysicalDeviceType) -> &'static str {
    match device_type {
        vk::PhysicalDeviceType::DISCRETE_GPU => "discrete GPU",
        vk::PhysicalDeviceType::INTEGRATED_GPU => "integrated GPU",
        vk::PhysicalDeviceType::VIRTUAL_GPU => "virtual GPU",
        vk::PhysicalDeviceType::CPU => "CPU",
        _ => "other",
    }
}

/// Multi-line summary used by `--list-devices`.
pub fn describe_device(info: &PhysicalDeviceInfo) -> String {
    let mut text = format!(
        "[{}] {} ({}, Vulkan {})\n",
        info.index,
        info.name,
        device_type_name(info.device_type),
        info.api_version_string()
    );
    text.push_str(&format!(
        "    Timeline semaphores: {}\n",
        if info.timeline_semaphore { "yes" } else { "no" }
    ));
    if let Some(limit) = info.max_memory_allocation_size {
        text.push_str(&format!("    Max allocation size: {} bytes\n", limit));
    }
    for (family_index, family) in info.queue_families.iter().enumerate() {
        text.push_str(&format!(
            "    Queue family {}: {} queue(s), {}\n",
            family_index,
            family.queue_count,
            format_capabilities(family.queue_flags)
        ));
    }
    for (type_index, flags) in info.memory_types.iter().enumerate() {
        let heap = info.memory_type_heaps.get(type_index).copied().unwrap_or_default();
        let heap_size = info.memory_heap_sizes.get(heap as usize).copied().unwrap_or_default();
        text.push_str(&format!(
            "    Memory type {}: heap {} ({} bytes), {}\n",
            type_index,
            heap,
            heap_size,
            format_memory_properties(*flags)
        ));
    }
    text
}

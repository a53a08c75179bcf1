//! Host-to-device transfer latency benchmark for Vulkan devices.
//!
//! [`gpu`] finds a physical device, resolves queue families and memory types,
//! and provisions a logical device. [`bench`] runs the timed copy sweep over
//! anything implementing [`bench::TransferDevice`].

pub mod bench;
pub mod common;
pub mod config;
pub mod gpu;
pub mod logger;
pub mod report;
pub mod stopwatch;

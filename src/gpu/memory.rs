//! Memory type classification.

use ash::vk;

use crate::common::FatalKind;

/// The two memory types a transfer benchmark needs.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct MemoryClassification {
    /// Device-local and not host-visible: the copy destination.
    pub device_local_index: u32,
    /// Host-visible, host-coherent, not host-cached, not device-local: the
    /// copy source.
    pub host_visible_index: u32,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ClassifyMemoryError {
    #[error("Device reports no memory type that is device-local without being host-visible")]
    NoDeviceLocal,
    #[error(
        "Device reports no host-visible, host-coherent, uncached memory type \
         outside device-local memory"
    )]
    NoHostVisibleUncached,
}

impl ClassifyMemoryError {
    pub fn kind(&self) -> FatalKind {
        FatalKind::Configuration
    }
}

pub fn is_device_local_only(flags: vk::MemoryPropertyFlags) -> bool {
    flags.contains(vk::MemoryPropertyFlags::DEVICE_LOCAL)
        && !flags.contains(vk::MemoryPropertyFlags::HOST_VISIBLE)
}

pub fn is_host_visible_uncached(flags: vk::MemoryPropertyFlags) -> bool {
    !flags.contains(vk::MemoryPropertyFlags::DEVICE_LOCAL)
        && flags.contains(
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        )
        && !flags.contains(vk::MemoryPropertyFlags::HOST_CACHED)
}

/// Classifies a device's memory type table, given as each type's property
/// flags in the order the device reports them.
///
/// When several types qualify for the same class, the last one wins.
pub fn classify_memory_types(
    memory_types: &[vk::MemoryPropertyFlags],
) -> Result<MemoryClassification, ClassifyMemoryError> {
    let mut device_local_index = None;
    let mut host_visible_index = None;

    for (index, flags) in memory_types.iter().enumerate() {
        if is_device_local_only(*flags) {
            device_local_index = Some(index as u32);
        }
        if is_host_visible_uncached(*flags) {
            host_visible_index = Some(index as u32);
        }
    }

    Ok(MemoryClassification {
        device_local_index: device_local_index.ok_or(ClassifyMemoryError::NoDeviceLocal)?,
        host_visible_index: host_visible_index.ok_or(ClassifyMemoryError::NoHostVisibleUncached)?,
    })
}

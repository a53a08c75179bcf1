//! Bits shared by every subsystem: the fatal error taxonomy.

use ash::vk;

/// How a fatal condition should be read by whoever ends up reporting it.
///
/// All three abort the run the same way. The distinction only exists so the
/// caller can tell "this hardware can't do what you asked" apart from
/// "something ran out" apart from "we handed the API something it rejected".
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum FatalKind {
    /// The device lacks a required queue capability, memory class or feature,
    /// or the request itself is unsatisfiable as configured.
    Configuration,
    /// Handle creation, allocation or binding failed for lack of resources.
    Resource,
    /// The API returned a non-success status where success was required.
    Protocol,
}

impl FatalKind {
    /// Buckets a raw Vulkan result code.
    pub fn from_vk(result: vk::Result) -> Self {
        match result {
            vk::Result::ERROR_OUT_OF_HOST_MEMORY
            | vk::Result::ERROR_OUT_OF_DEVICE_MEMORY
            | vk::Result::ERROR_TOO_MANY_OBJECTS
            | vk::Result::ERROR_FRAGMENTED_POOL
            | vk::Result::ERROR_FRAGMENTATION
            | vk::Result::ERROR_OUT_OF_POOL_MEMORY => FatalKind::Resource,
            vk::Result::ERROR_LAYER_NOT_PRESENT
            | vk::Result::ERROR_EXTENSION_NOT_PRESENT
            | vk::Result::ERROR_FEATURE_NOT_PRESENT
            | vk::Result::ERROR_INCOMPATIBLE_DRIVER => FatalKind::Configuration,
            _ => FatalKind::Protocol,
        }
    }

    /// Process exit code used by the binary for this kind of failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            FatalKind::Configuration => 1,
            FatalKind::Resource => 2,
            FatalKind::Protocol => 3,
        }
    }
}

impl std::fmt::Display for FatalKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FatalKind::Configuration => write!(f, "configuration"),
            FatalKind::Resource => write!(f, "resource"),
            FatalKind::Protocol => write!(f, "protocol"),
        }
    }
}

//! Queue family resolution.
//!
//! A [`QueueRequest`] names the capabilities a queue must have. Resolution
//! picks, per request, the queue family that has all of them and the fewest
//! capabilities nobody asked for, so that a transfer request lands on a
//! dedicated transfer family when the hardware has one instead of sharing a
//! queue with graphics work.

use ash::vk;
use serde::{Deserialize, Serialize};

use crate::common::FatalKind;

/// One capability bit a queue family can report, named for config files.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QueueCapability {
    Graphics,
    Compute,
    Transfer,
    SparseBinding,
    Protected,
    VideoDecode,
    VideoEncode,
    OpticalFlow,
}

impl QueueCapability {
    pub const ALL: [QueueCapability; 8] = [
        QueueCapability::Graphics,
        QueueCapability::Compute,
        QueueCapability::Transfer,
        QueueCapability::SparseBinding,
        QueueCapability::Protected,
        QueueCapability::VideoDecode,
        QueueCapability::VideoEncode,
        QueueCapability::OpticalFlow,
    ];

    pub fn flag(&self) -> vk::QueueFlags {
        match self {
            QueueCapability::Graphics => vk::QueueFlags::GRAPHICS,
            QueueCapability::Compute => vk::QueueFlags::COMPUTE,
            QueueCapability::Transfer => vk::QueueFlags::TRANSFER,
            QueueCapability::SparseBinding => vk::QueueFlags::SPARSE_BINDING,
            QueueCapability::Protected => vk::QueueFlags::PROTECTED,
            QueueCapability::VideoDecode => vk::QueueFlags::VIDEO_DECODE_KHR,
            QueueCapability::VideoEncode => vk::QueueFlags::VIDEO_ENCODE_KHR,
            QueueCapability::OpticalFlow => vk::QueueFlags::OPTICAL_FLOW_NV,
        }
    }

    /// Human-readable name, as printed in queue listings.
    pub fn name(&self) -> &'static str {
        match self {
            QueueCapability::Graphics => "Graphics",
            QueueCapability::Compute => "Compute",
            QueueCapability::Transfer => "Transfer",
            QueueCapability::SparseBinding => "Sparse binding",
            QueueCapability::Protected => "Protected",
            QueueCapability::VideoDecode => "Video decode",
            QueueCapability::VideoEncode => "Video encode",
            QueueCapability::OpticalFlow => "Optical flow",
        }
    }
}

/// Every named capability present in `flags`, in a stable order.
pub fn capability_names(flags: vk::QueueFlags) -> Vec<&'static str> {
    QueueCapability::ALL
        .iter()
        .filter(|cap| flags.contains(cap.flag()))
        .map(|cap| cap.name())
        .collect()
}

/// The set of capabilities one requested queue must have.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct QueueRequest(pub vk::QueueFlags);

impl QueueRequest {
    pub fn new(flags: vk::QueueFlags) -> Self {
        QueueRequest(flags)
    }

    pub fn from_capabilities(capabilities: &[QueueCapability]) -> Self {
        QueueRequest(
            capabilities
                .iter()
                .fold(vk::QueueFlags::empty(), |acc, cap| acc | cap.flag()),
        )
    }

    pub fn flags(&self) -> vk::QueueFlags {
        self.0
    }
}

impl std::fmt::Display for QueueRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names = capability_names(self.0);
        if names.is_empty() {
            write!(f, "{{{:?}}}", self.0)
        } else {
            write!(f, "{{{}}}", names.join(", "))
        }
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolveQueueError {
    #[error(
        "No queue family offers every capability in {requested} (queue request #{request_index})"
    )]
    Unsatisfiable {
        request_index: usize,
        requested: QueueRequest,
    },
}

impl ResolveQueueError {
    pub fn kind(&self) -> FatalKind {
        FatalKind::Configuration
    }
}

/// Picks the best-fitting family in `families` for a single request.
///
/// A family qualifies if its capabilities are a superset of the request. The
/// winner is the qualifying family with the fewest extra capabilities; ties
/// go to the lowest index.
pub fn best_queue_family(families: &[vk::QueueFlags], requested: vk::QueueFlags) -> Option<u32> {
    let mut best: Option<(u32, u32)> = None;
    for (index, family) in families.iter().enumerate() {
        if (*family & requested) != requested {
            continue;
        }
        let extra = (*family ^ requested).as_raw().count_ones();
        match best {
            // Strictly smaller only, so the earliest family keeps a tie.
            Some((_, best_extra)) if extra >= best_extra => {}
            _ => best = Some((index as u32, extra)),
        }
    }
    best.map(|(index, _)| index)
}

/// Resolves every request to a queue family index, in request order.
pub fn resolve_queue_families(
    families: &[vk::QueueFlags],
    requests: &[QueueRequest],
) -> Result<Vec<u32>, ResolveQueueError> {
    requests
        .iter()
        .enumerate()
        .map(|(request_index, request)| {
            best_queue_family(families, request.flags()).ok_or(ResolveQueueError::Unsatisfiable {
                request_index,
                requested: *request,
            })
        })
        .collect()
}

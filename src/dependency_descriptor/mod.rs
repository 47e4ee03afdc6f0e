mod bit_stream;
#[cfg(test)]
mod dependency_descriptor_test;
mod reader;
mod writer;

use std::fmt;

pub use bit_stream::{size_non_symmetric_bits, BitStreamReader, BitStreamWriter};
pub use reader::DependencyDescriptorReader;
pub use writer::DependencyDescriptorWriter;

/// DependencyDescriptor is the RTP header extension payload format in
/// <https://aomediacodec.github.io/av1-rtp-spec/#dependency-descriptor-rtp-header-extension>
pub const MAX_SPATIAL_IDS: usize = 4;
pub const MAX_TEMPORAL_IDS: usize = 8;
pub const MAX_DECODE_TARGETS: usize = 32;
pub const MAX_TEMPLATES: usize = 64;

pub const EXTENSION_URI: &str =
    "https://aomediacodec.github.io/av1-rtp-spec/#dependency-descriptor-rtp-header-extension";

/// DecodeTargetIndication describes the relationship of a frame to a decode
/// target.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeTargetIndication {
    /// DecodeTargetInfo symbol '-'
    #[default]
    NotPresent,
    /// DecodeTargetInfo symbol 'D'
    Discardable,
    /// DecodeTargetInfo symbol 'S'
    Switch,
    /// DecodeTargetInfo symbol 'R'
    Required,
}

impl DecodeTargetIndication {
    pub(crate) fn from_bits(b: u32) -> Self {
        match b {
            1 => DecodeTargetIndication::Discardable,
            2 => DecodeTargetIndication::Switch,
            3 => DecodeTargetIndication::Required,
            _ => DecodeTargetIndication::NotPresent,
        }
    }

    pub(crate) fn to_bits(self) -> u32 {
        match self {
            DecodeTargetIndication::NotPresent => 0,
            DecodeTargetIndication::Discardable => 1,
            DecodeTargetIndication::Switch => 2,
            DecodeTargetIndication::Required => 3,
        }
    }
}

impl fmt::Display for DecodeTargetIndication {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DecodeTargetIndication::NotPresent => "-",
            DecodeTargetIndication::Discardable => "D",
            DecodeTargetIndication::Switch => "S",
            DecodeTargetIndication::Required => "R",
        };
        write!(f, "{s}")
    }
}

/// RenderResolution of one spatial layer.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderResolution {
    pub width: u32,
    pub height: u32,
}

/// FrameDependencyTemplate describes one row of the template matrix: the
/// layer a frame belongs to and its dependencies and chain distances.
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct FrameDependencyTemplate {
    pub spatial_id: u8,
    pub temporal_id: u8,
    pub decode_target_indications: Vec<DecodeTargetIndication>,
    pub frame_diffs: Vec<u32>,
    pub chain_diffs: Vec<u32>,
}

impl FrameDependencyTemplate {
    /// A frame with no dependencies on earlier frames is intra coded.
    pub fn is_intra(&self) -> bool {
        self.frame_diffs.is_empty()
    }
}

/// FrameDependencyStructure is the template matrix attached to a keyframe
/// and referenced by every subsequent descriptor until replaced.
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct FrameDependencyStructure {
    pub structure_id: u8,
    pub num_decode_targets: usize,
    pub num_chains: usize,
    /// Maps a decode target index to the index of the chain protecting it,
    /// present when chains are in use (num_chains > 0).
    pub decode_target_protected_by_chain: Vec<usize>,
    pub resolutions: Vec<RenderResolution>,
    pub templates: Vec<FrameDependencyTemplate>,
}

impl FrameDependencyStructure {
    /// Decode target spatial/temporal layers, derived from the templates:
    /// the layer of a decode target is the highest layer of any template
    /// that carries it.
    pub fn decode_target_layer(&self, dt: usize) -> (u8, u8) {
        let mut spatial = 0;
        let mut temporal = 0;
        for template in &self.templates {
            if template
                .decode_target_indications
                .get(dt)
                .map(|dti| *dti != DecodeTargetIndication::NotPresent)
                .unwrap_or(false)
            {
                spatial = spatial.max(template.spatial_id);
                temporal = temporal.max(template.temporal_id);
            }
        }
        (spatial, temporal)
    }
}

/// DependencyDescriptor is one parsed descriptor, with the frame
/// dependencies already resolved against the active structure.
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct DependencyDescriptor {
    pub first_packet_in_frame: bool,
    pub last_packet_in_frame: bool,
    pub frame_number: u16,
    pub frame_dependencies: Option<FrameDependencyTemplate>,
    pub resolution: Option<RenderResolution>,
    pub active_decode_targets_bitmask: Option<u32>,
    pub attached_structure: Option<FrameDependencyStructure>,
}

impl DependencyDescriptor {
    pub fn spatial_id(&self) -> u8 {
        self.frame_dependencies
            .as_ref()
            .map(|deps| deps.spatial_id)
            .unwrap_or(0)
    }

    pub fn temporal_id(&self) -> u8 {
        self.frame_dependencies
            .as_ref()
            .map(|deps| deps.temporal_id)
            .unwrap_or(0)
    }
}

/// ExtDependencyDescriptor decorates a parsed descriptor with the extended
/// frame number and parse context flags the buffer attaches before fanout.
#[derive(Default, Debug, Clone)]
pub struct ExtDependencyDescriptor {
    pub descriptor: DependencyDescriptor,
    /// 64-bit unwrapped counterpart of the 16-bit frame number.
    pub ext_frame_number: u64,
    /// A new template structure arrived with this packet.
    pub structure_updated: bool,
    /// The active decode targets changed with this packet.
    pub active_decode_targets_updated: bool,
}

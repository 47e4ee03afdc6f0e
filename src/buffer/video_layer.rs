use std::fmt;

pub const INVALID_LAYER_SPATIAL: i32 = -1;
pub const INVALID_LAYER_TEMPORAL: i32 = -1;

pub const DEFAULT_MAX_LAYER_SPATIAL: i32 = 2;
pub const DEFAULT_MAX_LAYER_TEMPORAL: i32 = 3;

pub const INVALID_LAYER: VideoLayer = VideoLayer {
    spatial: INVALID_LAYER_SPATIAL,
    temporal: INVALID_LAYER_TEMPORAL,
};

pub const DEFAULT_MAX_LAYER: VideoLayer = VideoLayer {
    spatial: DEFAULT_MAX_LAYER_SPATIAL,
    temporal: DEFAULT_MAX_LAYER_TEMPORAL,
};

/// VideoLayer addresses one spatial/temporal position of a simulcast or SVC
/// publication; -1 marks an invalid coordinate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoLayer {
    pub spatial: i32,
    pub temporal: i32,
}

impl Default for VideoLayer {
    fn default() -> Self {
        INVALID_LAYER
    }
}

impl VideoLayer {
    pub fn new(spatial: i32, temporal: i32) -> Self {
        VideoLayer { spatial, temporal }
    }

    pub fn greater_than(&self, other: VideoLayer) -> bool {
        self.spatial > other.spatial
            || (self.spatial == other.spatial && self.temporal > other.temporal)
    }

    pub fn spatial_greater_than_or_equal(&self, other: VideoLayer) -> bool {
        self.spatial >= other.spatial
    }

    pub fn is_valid(&self) -> bool {
        self.spatial != INVALID_LAYER_SPATIAL && self.temporal != INVALID_LAYER_TEMPORAL
    }
}

impl fmt::Display for VideoLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VideoLayer{{s: {}, t: {}}}", self.spatial, self.temporal)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_ordering() {
        let q = VideoLayer::new(0, 3);
        let h = VideoLayer::new(1, 0);
        assert!(h.greater_than(q));
        assert!(!q.greater_than(h));
        assert!(VideoLayer::new(1, 1).greater_than(VideoLayer::new(1, 0)));
        assert!(!VideoLayer::new(1, 1).greater_than(VideoLayer::new(1, 1)));
        assert!(h.spatial_greater_than_or_equal(VideoLayer::new(1, 3)));
    }

    #[test]
    fn test_validity() {
        assert!(!INVALID_LAYER.is_valid());
        assert!(!VideoLayer::new(0, -1).is_valid());
        assert!(DEFAULT_MAX_LAYER.is_valid());
    }
}

use crate::buffer::video_layer::INVALID_LAYER_SPATIAL;
use crate::stream_info::{TrackInfo, VideoQuality};

pub const QUARTER_RESOLUTION: &str = "q";
pub const HALF_RESOLUTION: &str = "h";
pub const FULL_RESOLUTION: &str = "f";

/// Which qualities the publisher actually advertises, indexed Low/Medium/
/// High. `None` when the track info carries no layer information.
pub fn layer_presence_from_track_info(track_info: Option<&TrackInfo>) -> Option<[bool; 3]> {
    let track_info = track_info?;
    if track_info.layers.is_empty() {
        return None;
    }

    let mut presence = [false; 3];
    for layer in &track_info.layers {
        if layer.quality != VideoQuality::Off {
            presence[layer.quality as usize] = true;
        }
    }
    Some(presence)
}

pub fn rid_to_spatial_layer(rid: &str, track_info: Option<&TrackInfo>) -> i32 {
    let Some(lp) = layer_presence_from_track_info(track_info) else {
        return match rid {
            QUARTER_RESOLUTION => 0,
            HALF_RESOLUTION => 1,
            FULL_RESOLUTION => 2,
            _ => 0,
        };
    };

    match (rid, lp) {
        (QUARTER_RESOLUTION, _) => 0,

        (HALF_RESOLUTION, [true, true, true]) => 1,
        (HALF_RESOLUTION, [true, true, false])
        | (HALF_RESOLUTION, [true, false, true])
        | (HALF_RESOLUTION, [false, true, true]) => 1,
        // only one quality published, could be any
        (HALF_RESOLUTION, _) => 0,

        (FULL_RESOLUTION, [true, true, true]) => 2,
        (FULL_RESOLUTION, [true, true, false])
        | (FULL_RESOLUTION, [true, false, true])
        | (FULL_RESOLUTION, [false, true, true]) => {
            log::warn!("unexpected rid f with only two qualities");
            1
        }
        (FULL_RESOLUTION, _) => 0,

        // no rid, should be single layer
        _ => 0,
    }
}

pub fn spatial_layer_to_rid(layer: i32, track_info: Option<&TrackInfo>) -> &'static str {
    let Some(lp) = layer_presence_from_track_info(track_info) else {
        return match layer {
            0 => QUARTER_RESOLUTION,
            1 => HALF_RESOLUTION,
            2 => FULL_RESOLUTION,
            _ => QUARTER_RESOLUTION,
        };
    };

    match (layer, lp) {
        (0, _) => QUARTER_RESOLUTION,

        (1, [true, true, true]) => HALF_RESOLUTION,
        (1, [true, true, false]) | (1, [true, false, true]) | (1, [false, true, true]) => {
            HALF_RESOLUTION
        }
        (1, _) => QUARTER_RESOLUTION,

        (2, [true, true, true]) => FULL_RESOLUTION,
        (2, [true, true, false]) | (2, [true, false, true]) | (2, [false, true, true]) => {
            log::warn!("unexpected layer 2 with only two qualities");
            HALF_RESOLUTION
        }
        (2, _) => QUARTER_RESOLUTION,

        _ => QUARTER_RESOLUTION,
    }
}

pub fn video_quality_to_rid(quality: VideoQuality, track_info: Option<&TrackInfo>) -> &'static str {
    spatial_layer_to_rid(video_quality_to_spatial_layer(quality, track_info), track_info)
}

pub fn spatial_layer_to_video_quality(layer: i32, track_info: Option<&TrackInfo>) -> VideoQuality {
    let Some(lp) = layer_presence_from_track_info(track_info) else {
        return match layer {
            0 => VideoQuality::Low,
            1 => VideoQuality::Medium,
            2 => VideoQuality::High,
            _ => VideoQuality::Off,
        };
    };

    match (layer, lp) {
        (0, [true, _, _]) => VideoQuality::Low,
        (0, [false, true, _]) => VideoQuality::Medium,
        (0, _) => VideoQuality::High,

        (1, [true, true, true]) | (1, [true, true, false]) => VideoQuality::Medium,
        (1, [true, false, true]) | (1, [false, true, true]) => VideoQuality::High,
        (1, _) => {
            log::error!("invalid layer {layer}");
            VideoQuality::High
        }

        (2, [true, true, true]) => VideoQuality::High,
        (2, _) => {
            log::error!("invalid layer {layer}");
            VideoQuality::High
        }

        _ => VideoQuality::Off,
    }
}

pub fn video_quality_to_spatial_layer(
    quality: VideoQuality,
    track_info: Option<&TrackInfo>,
) -> i32 {
    let Some(lp) = layer_presence_from_track_info(track_info) else {
        return match quality {
            VideoQuality::Low => 0,
            VideoQuality::Medium => 1,
            VideoQuality::High => 2,
            VideoQuality::Off => INVALID_LAYER_SPATIAL,
        };
    };

    match (quality, lp) {
        (VideoQuality::Low, _) => 0,

        (VideoQuality::Medium, [true, true, true])
        | (VideoQuality::Medium, [true, true, false])
        | (VideoQuality::Medium, [true, false, true]) => 1,
        (VideoQuality::Medium, [false, true, true]) => 0,
        // only one quality published, could be any
        (VideoQuality::Medium, _) => 0,

        (VideoQuality::High, [true, true, true]) => 2,
        (VideoQuality::High, [true, true, false])
        | (VideoQuality::High, [true, false, true])
        | (VideoQuality::High, [false, true, true]) => 1,
        (VideoQuality::High, _) => 0,

        (VideoQuality::Off, _) => INVALID_LAYER_SPATIAL,
    }
}

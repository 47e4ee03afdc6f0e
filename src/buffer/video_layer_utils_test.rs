use super::video_layer_utils::*;
use crate::stream_info::{TrackInfo, VideoLayerInfo, VideoQuality};

fn track_info(qualities: &[VideoQuality]) -> TrackInfo {
    TrackInfo {
        layers: qualities
            .iter()
            .map(|q| VideoLayerInfo {
                quality: *q,
                ..Default::default()
            })
            .collect(),
        ..Default::default()
    }
}

struct RidAndLayer {
    rid: &'static str,
    layer: i32,
}

#[test]
fn test_rid_conversion() {
    let tests: Vec<(&str, Option<TrackInfo>, Vec<(&str, RidAndLayer)>)> = vec![
        (
            "no track info",
            None,
            vec![
                ("", RidAndLayer { rid: QUARTER_RESOLUTION, layer: 0 }),
                (QUARTER_RESOLUTION, RidAndLayer { rid: QUARTER_RESOLUTION, layer: 0 }),
                (HALF_RESOLUTION, RidAndLayer { rid: HALF_RESOLUTION, layer: 1 }),
                (FULL_RESOLUTION, RidAndLayer { rid: FULL_RESOLUTION, layer: 2 }),
            ],
        ),
        (
            "no layers",
            Some(TrackInfo::default()),
            vec![
                ("", RidAndLayer { rid: QUARTER_RESOLUTION, layer: 0 }),
                (QUARTER_RESOLUTION, RidAndLayer { rid: QUARTER_RESOLUTION, layer: 0 }),
                (HALF_RESOLUTION, RidAndLayer { rid: HALF_RESOLUTION, layer: 1 }),
                (FULL_RESOLUTION, RidAndLayer { rid: FULL_RESOLUTION, layer: 2 }),
            ],
        ),
        (
            "single layer, low",
            Some(track_info(&[VideoQuality::Low])),
            vec![
                ("", RidAndLayer { rid: QUARTER_RESOLUTION, layer: 0 }),
                (QUARTER_RESOLUTION, RidAndLayer { rid: QUARTER_RESOLUTION, layer: 0 }),
                (HALF_RESOLUTION, RidAndLayer { rid: QUARTER_RESOLUTION, layer: 0 }),
                (FULL_RESOLUTION, RidAndLayer { rid: QUARTER_RESOLUTION, layer: 0 }),
            ],
        ),
        (
            "single layer, medium",
            Some(track_info(&[VideoQuality::Medium])),
            vec![
                ("", RidAndLayer { rid: QUARTER_RESOLUTION, layer: 0 }),
                (QUARTER_RESOLUTION, RidAndLayer { rid: QUARTER_RESOLUTION, layer: 0 }),
                (HALF_RESOLUTION, RidAndLayer { rid: QUARTER_RESOLUTION, layer: 0 }),
                (FULL_RESOLUTION, RidAndLayer { rid: QUARTER_RESOLUTION, layer: 0 }),
            ],
        ),
        (
            "single layer, high",
            Some(track_info(&[VideoQuality::High])),
            vec![
                ("", RidAndLayer { rid: QUARTER_RESOLUTION, layer: 0 }),
                (QUARTER_RESOLUTION, RidAndLayer { rid: QUARTER_RESOLUTION, layer: 0 }),
                (HALF_RESOLUTION, RidAndLayer { rid: QUARTER_RESOLUTION, layer: 0 }),
                (FULL_RESOLUTION, RidAndLayer { rid: QUARTER_RESOLUTION, layer: 0 }),
            ],
        ),
        (
            "two layers, low and medium",
            Some(track_info(&[VideoQuality::Low, VideoQuality::Medium])),
            vec![
                ("", RidAndLayer { rid: QUARTER_RESOLUTION, layer: 0 }),
                (QUARTER_RESOLUTION, RidAndLayer { rid: QUARTER_RESOLUTION, layer: 0 }),
                (HALF_RESOLUTION, RidAndLayer { rid: HALF_RESOLUTION, layer: 1 }),
                (FULL_RESOLUTION, RidAndLayer { rid: HALF_RESOLUTION, layer: 1 }),
            ],
        ),
        (
            "two layers, low and high",
            Some(track_info(&[VideoQuality::Low, VideoQuality::High])),
            vec![
                ("", RidAndLayer { rid: QUARTER_RESOLUTION, layer: 0 }),
                (QUARTER_RESOLUTION, RidAndLayer { rid: QUARTER_RESOLUTION, layer: 0 }),
                (HALF_RESOLUTION, RidAndLayer { rid: HALF_RESOLUTION, layer: 1 }),
                (FULL_RESOLUTION, RidAndLayer { rid: HALF_RESOLUTION, layer: 1 }),
            ],
        ),
        (
            "two layers, medium and high",
            Some(track_info(&[VideoQuality::Medium, VideoQuality::High])),
            vec![
                ("", RidAndLayer { rid: QUARTER_RESOLUTION, layer: 0 }),
                (QUARTER_RESOLUTION, RidAndLayer { rid: QUARTER_RESOLUTION, layer: 0 }),
                (HALF_RESOLUTION, RidAndLayer { rid: HALF_RESOLUTION, layer: 1 }),
                (FULL_RESOLUTION, RidAndLayer { rid: HALF_RESOLUTION, layer: 1 }),
            ],
        ),
        (
            "three layers",
            Some(track_info(&[
                VideoQuality::Low,
                VideoQuality::Medium,
                VideoQuality::High,
            ])),
            vec![
                ("", RidAndLayer { rid: QUARTER_RESOLUTION, layer: 0 }),
                (QUARTER_RESOLUTION, RidAndLayer { rid: QUARTER_RESOLUTION, layer: 0 }),
                (HALF_RESOLUTION, RidAndLayer { rid: HALF_RESOLUTION, layer: 1 }),
                (FULL_RESOLUTION, RidAndLayer { rid: FULL_RESOLUTION, layer: 2 }),
            ],
        ),
    ];

    for (name, track_info, rid_to_layer) in tests {
        for (rid, expected) in rid_to_layer {
            let layer = rid_to_spatial_layer(rid, track_info.as_ref());
            assert_eq!(layer, expected.layer, "{name}: rid {rid:?}");
            let round = spatial_layer_to_rid(layer, track_info.as_ref());
            assert_eq!(round, expected.rid, "{name}: rid {rid:?}");
        }
    }
}

#[test]
fn test_quality_conversion_matches_rid_conversion() {
    let published: Vec<Option<TrackInfo>> = vec![
        None,
        Some(track_info(&[VideoQuality::Low])),
        Some(track_info(&[VideoQuality::Medium])),
        Some(track_info(&[VideoQuality::High])),
        Some(track_info(&[VideoQuality::Low, VideoQuality::Medium])),
        Some(track_info(&[VideoQuality::Low, VideoQuality::High])),
        Some(track_info(&[VideoQuality::Medium, VideoQuality::High])),
        Some(track_info(&[
            VideoQuality::Low,
            VideoQuality::Medium,
            VideoQuality::High,
        ])),
    ];

    for track_info in &published {
        for quality in [VideoQuality::Low, VideoQuality::Medium, VideoQuality::High] {
            let via_rid = rid_to_spatial_layer(
                video_quality_to_rid(quality, track_info.as_ref()),
                track_info.as_ref(),
            );
            let direct = video_quality_to_spatial_layer(quality, track_info.as_ref());
            assert_eq!(via_rid, direct, "{track_info:?} {quality:?}");
        }
    }
}

#[test]
fn test_three_layer_round_trip() {
    let ti = track_info(&[VideoQuality::Low, VideoQuality::Medium, VideoQuality::High]);
    for (quality, layer) in [
        (VideoQuality::Low, 0),
        (VideoQuality::Medium, 1),
        (VideoQuality::High, 2),
    ] {
        assert_eq!(video_quality_to_spatial_layer(quality, Some(&ti)), layer);
        assert_eq!(spatial_layer_to_video_quality(layer, Some(&ti)), quality);
    }
}

#[test]
fn test_off_quality_is_invalid_layer() {
    assert_eq!(video_quality_to_spatial_layer(VideoQuality::Off, None), -1);
    assert_eq!(spatial_layer_to_video_quality(3, None), VideoQuality::Off);
}

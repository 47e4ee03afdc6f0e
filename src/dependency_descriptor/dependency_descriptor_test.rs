use super::*;
use crate::error::Error;

fn svc_structure() -> FrameDependencyStructure {
    // two spatial layers, two temporal layers, one decode target per layer
    // pair, protected by one chain per spatial layer
    FrameDependencyStructure {
        structure_id: 2,
        num_decode_targets: 2,
        num_chains: 2,
        decode_target_protected_by_chain: vec![0, 1],
        resolutions: vec![
            RenderResolution {
                width: 320,
                height: 180,
            },
            RenderResolution {
                width: 640,
                height: 360,
            },
        ],
        templates: vec![
            FrameDependencyTemplate {
                spatial_id: 0,
                temporal_id: 0,
                decode_target_indications: vec![
                    DecodeTargetIndication::Switch,
                    DecodeTargetIndication::Switch,
                ],
                frame_diffs: vec![],
                chain_diffs: vec![0, 0],
            },
            FrameDependencyTemplate {
                spatial_id: 0,
                temporal_id: 1,
                decode_target_indications: vec![
                    DecodeTargetIndication::Discardable,
                    DecodeTargetIndication::NotPresent,
                ],
                frame_diffs: vec![1],
                chain_diffs: vec![1, 1],
            },
            FrameDependencyTemplate {
                spatial_id: 1,
                temporal_id: 0,
                decode_target_indications: vec![
                    DecodeTargetIndication::NotPresent,
                    DecodeTargetIndication::Required,
                ],
                frame_diffs: vec![2],
                chain_diffs: vec![1, 1],
            },
        ],
    }
}

#[test]
fn test_round_trip_with_attached_structure() {
    let structure = svc_structure();
    let descriptor = DependencyDescriptor {
        first_packet_in_frame: true,
        last_packet_in_frame: false,
        frame_number: 0x1234,
        frame_dependencies: Some(structure.templates[0].clone()),
        resolution: Some(structure.resolutions[0]),
        active_decode_targets_bitmask: Some(0b11),
        attached_structure: Some(structure.clone()),
    };

    let writer = DependencyDescriptorWriter::new(&descriptor, &structure).unwrap();
    let buf = writer.marshal().unwrap();

    let parsed = DependencyDescriptorReader::new(&buf, None).parse().unwrap();
    assert_eq!(parsed, descriptor);
}

#[test]
fn test_round_trip_against_prior_structure() {
    let structure = svc_structure();
    let descriptor = DependencyDescriptor {
        first_packet_in_frame: true,
        last_packet_in_frame: true,
        frame_number: 7,
        frame_dependencies: Some(structure.templates[2].clone()),
        resolution: Some(structure.resolutions[1]),
        active_decode_targets_bitmask: None,
        attached_structure: None,
    };

    let writer = DependencyDescriptorWriter::new(&descriptor, &structure).unwrap();
    let buf = writer.marshal().unwrap();
    // mandatory fields only, the template covers everything
    assert_eq!(buf.len(), 3);

    let parsed = DependencyDescriptorReader::new(&buf, Some(&structure))
        .parse()
        .unwrap();
    assert_eq!(parsed, descriptor);
}

#[test]
fn test_custom_fields_round_trip() {
    let structure = svc_structure();
    let mut dependencies = structure.templates[1].clone();
    dependencies.frame_diffs = vec![3, 17];
    dependencies.decode_target_indications = vec![
        DecodeTargetIndication::Required,
        DecodeTargetIndication::NotPresent,
    ];
    dependencies.chain_diffs = vec![5, 200];

    let descriptor = DependencyDescriptor {
        first_packet_in_frame: false,
        last_packet_in_frame: true,
        frame_number: 65535,
        frame_dependencies: Some(dependencies),
        resolution: Some(structure.resolutions[0]),
        active_decode_targets_bitmask: None,
        attached_structure: None,
    };

    let writer = DependencyDescriptorWriter::new(&descriptor, &structure).unwrap();
    let buf = writer.marshal().unwrap();
    assert!(buf.len() > 3);

    let parsed = DependencyDescriptorReader::new(&buf, Some(&structure))
        .parse()
        .unwrap();
    assert_eq!(parsed, descriptor);
}

#[test]
fn test_active_decode_targets_bitmask() {
    let structure = svc_structure();
    let descriptor = DependencyDescriptor {
        first_packet_in_frame: true,
        last_packet_in_frame: true,
        frame_number: 100,
        frame_dependencies: Some(structure.templates[0].clone()),
        resolution: Some(structure.resolutions[0]),
        active_decode_targets_bitmask: Some(0b01),
        attached_structure: None,
    };

    let writer = DependencyDescriptorWriter::new(&descriptor, &structure).unwrap();
    let buf = writer.marshal().unwrap();

    let parsed = DependencyDescriptorReader::new(&buf, Some(&structure))
        .parse()
        .unwrap();
    assert_eq!(parsed.active_decode_targets_bitmask, Some(0b01));
}

#[test]
fn test_parse_without_structure_fails() {
    let structure = svc_structure();
    let descriptor = DependencyDescriptor {
        first_packet_in_frame: true,
        last_packet_in_frame: true,
        frame_number: 1,
        frame_dependencies: Some(structure.templates[0].clone()),
        resolution: None,
        active_decode_targets_bitmask: None,
        attached_structure: None,
    };

    let writer = DependencyDescriptorWriter::new(&descriptor, &structure).unwrap();
    let buf = writer.marshal().unwrap();

    let result = DependencyDescriptorReader::new(&buf, None).parse();
    assert_eq!(result, Err(Error::ErrMissingStructure));
}

#[test]
fn test_decode_target_layers_derived_from_templates() {
    let structure = svc_structure();
    assert_eq!(structure.decode_target_layer(0), (0, 1));
    assert_eq!(structure.decode_target_layer(1), (1, 0));
}

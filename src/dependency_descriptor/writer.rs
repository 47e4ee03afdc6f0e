use super::bit_stream::{size_non_symmetric_bits, BitStreamWriter};
use super::{
    DependencyDescriptor, FrameDependencyStructure, FrameDependencyTemplate, MAX_TEMPLATES,
};
use crate::error::{Error, Result};

/// DependencyDescriptorWriter serializes a descriptor against a structure,
/// used when the forwarder rewrites the active decode targets or re-attaches
/// the structure on a layer switch.
pub struct DependencyDescriptorWriter<'a> {
    descriptor: &'a DependencyDescriptor,
    structure: &'a FrameDependencyStructure,
    template_index: usize,
    custom_dtis: bool,
    custom_fdiffs: bool,
    custom_chains: bool,
    active_decode_targets_present: bool,
}

impl<'a> DependencyDescriptorWriter<'a> {
    /// `structure` must be the structure the receiving side knows, either
    /// the one attached to this descriptor or a previously signalled one.
    pub fn new(
        descriptor: &'a DependencyDescriptor,
        structure: &'a FrameDependencyStructure,
    ) -> Result<Self> {
        let dependencies = descriptor
            .frame_dependencies
            .as_ref()
            .ok_or(Error::ErrMalformedDescriptor)?;

        let template_index = find_best_template(structure, dependencies)?;
        let template = &structure.templates[template_index];

        let all_active = ((1u64 << structure.num_decode_targets) - 1) as u32;
        let active_decode_targets_present = match descriptor.active_decode_targets_bitmask {
            Some(mask) => !(descriptor.attached_structure.is_some() && mask == all_active),
            None => false,
        };

        Ok(DependencyDescriptorWriter {
            descriptor,
            structure,
            template_index,
            custom_dtis: template.decode_target_indications
                != dependencies.decode_target_indications,
            custom_fdiffs: template.frame_diffs != dependencies.frame_diffs,
            custom_chains: template.chain_diffs != dependencies.chain_diffs,
            active_decode_targets_present,
        })
    }

    /// Serializes into a freshly sized byte vector.
    pub fn marshal(&self) -> Result<Vec<u8>> {
        let size_bits = self.value_size_bits();
        let mut buf = vec![0u8; size_bits.div_ceil(8)];
        let mut writer = BitStreamWriter::new(&mut buf);
        self.write_to(&mut writer)?;
        Ok(buf)
    }

    fn has_extended_fields(&self) -> bool {
        self.descriptor.attached_structure.is_some()
            || self.active_decode_targets_present
            || self.custom_dtis
            || self.custom_fdiffs
            || self.custom_chains
    }

    fn value_size_bits(&self) -> usize {
        let mut bits = 24; // mandatory fields
        if !self.has_extended_fields() {
            return bits;
        }
        bits += 5;
        if self.descriptor.attached_structure.is_some() {
            bits += self.structure_size_bits();
        }
        if self.active_decode_targets_present {
            bits += self.structure.num_decode_targets;
        }
        bits += self.frame_dependency_definition_size_bits();
        bits
    }

    fn structure_size_bits(&self) -> usize {
        let structure = self.structure;
        // structure id + decode target count
        let mut bits = 6 + 5;
        // template layers: a 2-bit idc per template, terminator included
        bits += 2 * structure.templates.len();
        // dtis
        bits += 2 * structure.num_decode_targets * structure.templates.len();
        // fdiffs: 5 bits each plus a stop bit per template
        for template in &structure.templates {
            bits += 5 * template.frame_diffs.len() + 1;
        }
        // chains
        bits += size_non_symmetric_bits(
            structure.num_chains as u32,
            structure.num_decode_targets as u32 + 1,
        );
        if structure.num_chains > 0 {
            for protected_by in &structure.decode_target_protected_by_chain {
                bits += size_non_symmetric_bits(*protected_by as u32, structure.num_chains as u32);
            }
            bits += 4 * structure.num_chains * structure.templates.len();
        }
        // resolutions flag + resolutions
        bits += 1 + 32 * structure.resolutions.len();
        bits
    }

    fn frame_dependency_definition_size_bits(&self) -> usize {
        let Some(dependencies) = self.descriptor.frame_dependencies.as_ref() else {
            return 0;
        };
        let mut bits = 0;
        if self.custom_dtis {
            bits += 2 * self.structure.num_decode_targets;
        }
        if self.custom_fdiffs {
            for fdiff in &dependencies.frame_diffs {
                bits += 2 + 4 * fdiff_size_blocks(*fdiff);
            }
            bits += 2; // terminator
        }
        if self.custom_chains {
            bits += 8 * self.structure.num_chains;
        }
        bits
    }

    fn write_to(&self, writer: &mut BitStreamWriter<'_>) -> Result<()> {
        let descriptor = self.descriptor;
        writer.write_bool(descriptor.first_packet_in_frame)?;
        writer.write_bool(descriptor.last_packet_in_frame)?;
        let template_id =
            (self.template_index + self.structure.structure_id as usize) % MAX_TEMPLATES;
        writer.write_bits(template_id as u64, 6)?;
        writer.write_bits(descriptor.frame_number as u64, 16)?;

        if !self.has_extended_fields() {
            return Ok(());
        }

        writer.write_bool(descriptor.attached_structure.is_some())?;
        writer.write_bool(self.active_decode_targets_present)?;
        writer.write_bool(self.custom_dtis)?;
        writer.write_bool(self.custom_fdiffs)?;
        writer.write_bool(self.custom_chains)?;

        if descriptor.attached_structure.is_some() {
            self.write_template_dependency_structure(writer)?;
        }
        if self.active_decode_targets_present {
            writer.write_bits(
                descriptor.active_decode_targets_bitmask.unwrap_or(0) as u64,
                self.structure.num_decode_targets,
            )?;
        }
        self.write_frame_dependency_definition(writer)
    }

    fn write_template_dependency_structure(&self, writer: &mut BitStreamWriter<'_>) -> Result<()> {
        let structure = self.structure;
        writer.write_bits(structure.structure_id as u64, 6)?;
        writer.write_bits(structure.num_decode_targets as u64 - 1, 5)?;

        // template layers
        for (i, template) in structure.templates.iter().enumerate() {
            let idc = match structure.templates.get(i + 1) {
                None => 3u64,
                Some(next) => {
                    if next.spatial_id == template.spatial_id
                        && next.temporal_id == template.temporal_id
                    {
                        0
                    } else if next.spatial_id == template.spatial_id
                        && next.temporal_id == template.temporal_id + 1
                    {
                        1
                    } else if next.spatial_id == template.spatial_id + 1 && next.temporal_id == 0 {
                        2
                    } else {
                        return Err(Error::ErrMalformedDescriptor);
                    }
                }
            };
            writer.write_bits(idc, 2)?;
        }

        // dtis
        for template in &structure.templates {
            if template.decode_target_indications.len() != structure.num_decode_targets {
                return Err(Error::ErrMalformedDescriptor);
            }
            for dti in &template.decode_target_indications {
                writer.write_bits(dti.to_bits() as u64, 2)?;
            }
        }

        // fdiffs
        for template in &structure.templates {
            for fdiff in &template.frame_diffs {
                if !(1..=16).contains(fdiff) {
                    return Err(Error::ErrValueOutOfRange);
                }
                writer.write_bool(true)?;
                writer.write_bits(*fdiff as u64 - 1, 4)?;
            }
            writer.write_bool(false)?;
        }

        // chains
        writer.write_non_symmetric(
            structure.num_chains as u32,
            structure.num_decode_targets as u32 + 1,
        )?;
        if structure.num_chains > 0 {
            for protected_by in &structure.decode_target_protected_by_chain {
                writer.write_non_symmetric(*protected_by as u32, structure.num_chains as u32)?;
            }
            for template in &structure.templates {
                for chain_diff in &template.chain_diffs {
                    writer.write_bits(*chain_diff as u64, 4)?;
                }
            }
        }

        writer.write_bool(!structure.resolutions.is_empty())?;
        for resolution in &structure.resolutions {
            writer.write_bits(resolution.width as u64 - 1, 16)?;
            writer.write_bits(resolution.height as u64 - 1, 16)?;
        }
        Ok(())
    }

    fn write_frame_dependency_definition(&self, writer: &mut BitStreamWriter<'_>) -> Result<()> {
        let Some(dependencies) = self.descriptor.frame_dependencies.as_ref() else {
            return Ok(());
        };
        if self.custom_dtis {
            for dti in &dependencies.decode_target_indications {
                writer.write_bits(dti.to_bits() as u64, 2)?;
            }
        }
        if self.custom_fdiffs {
            for fdiff in &dependencies.frame_diffs {
                let blocks = fdiff_size_blocks(*fdiff);
                writer.write_bits(blocks as u64, 2)?;
                writer.write_bits(*fdiff as u64 - 1, 4 * blocks)?;
            }
            writer.write_bits(0, 2)?;
        }
        if self.custom_chains {
            for chain_diff in &dependencies.chain_diffs {
                writer.write_bits(*chain_diff as u64, 8)?;
            }
        }
        Ok(())
    }
}

/// The number of 4-bit blocks a custom fdiff occupies on the wire.
fn fdiff_size_blocks(fdiff: u32) -> usize {
    if fdiff <= 1 << 4 {
        1
    } else if fdiff <= 1 << 8 {
        2
    } else {
        3
    }
}

/// Picks the template the frame dependencies deviate least from: an exact
/// match when one exists, otherwise the first template on the same layer.
fn find_best_template(
    structure: &FrameDependencyStructure,
    dependencies: &FrameDependencyTemplate,
) -> Result<usize> {
    let mut same_layer = None;
    for (i, template) in structure.templates.iter().enumerate() {
        if template.spatial_id != dependencies.spatial_id
            || template.temporal_id != dependencies.temporal_id
        {
            continue;
        }
        if template == dependencies {
            return Ok(i);
        }
        if same_layer.is_none() {
            same_layer = Some(i);
        }
    }
    same_layer.ok_or(Error::ErrMalformedDescriptor)
}

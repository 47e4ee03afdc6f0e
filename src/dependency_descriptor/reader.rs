use super::bit_stream::BitStreamReader;
use super::{
    DecodeTargetIndication, DependencyDescriptor, FrameDependencyStructure,
    FrameDependencyTemplate, RenderResolution, MAX_SPATIAL_IDS, MAX_TEMPLATES, MAX_TEMPORAL_IDS,
};
use crate::error::{Error, Result};

/// DependencyDescriptorReader parses one descriptor payload against the most
/// recently attached template structure.
pub struct DependencyDescriptorReader<'a> {
    reader: BitStreamReader<'a>,
    structure: Option<&'a FrameDependencyStructure>,
    template_id: u8,
}

impl<'a> DependencyDescriptorReader<'a> {
    /// `structure` is the active structure from an earlier keyframe, if any.
    /// A structure attached to this very descriptor takes precedence.
    pub fn new(buf: &'a [u8], structure: Option<&'a FrameDependencyStructure>) -> Self {
        DependencyDescriptorReader {
            reader: BitStreamReader::new(buf),
            structure,
            template_id: 0,
        }
    }

    pub fn parse(mut self) -> Result<DependencyDescriptor> {
        let mut descriptor = DependencyDescriptor::default();

        self.read_mandatory_fields(&mut descriptor)?;

        let mut template_dependency_structure_present = false;
        let mut active_decode_targets_present = false;
        let mut custom_dtis = false;
        let mut custom_fdiffs = false;
        let mut custom_chains = false;

        if self.reader.remaining_bits() > 0 {
            template_dependency_structure_present = self.reader.read_bool()?;
            active_decode_targets_present = self.reader.read_bool()?;
            custom_dtis = self.reader.read_bool()?;
            custom_fdiffs = self.reader.read_bool()?;
            custom_chains = self.reader.read_bool()?;

            if template_dependency_structure_present {
                let structure = self.read_template_dependency_structure()?;
                descriptor.active_decode_targets_bitmask =
                    Some(((1u64 << structure.num_decode_targets) - 1) as u32);
                descriptor.attached_structure = Some(structure);
            }
            if active_decode_targets_present {
                let num_decode_targets = match descriptor.attached_structure.as_ref() {
                    Some(structure) => structure.num_decode_targets,
                    None => self
                        .structure
                        .ok_or(Error::ErrMissingStructure)?
                        .num_decode_targets,
                };
                descriptor.active_decode_targets_bitmask =
                    Some(self.reader.read_bits(num_decode_targets)? as u32);
            }
        }

        self.read_frame_dependency_definition(
            &mut descriptor,
            custom_dtis,
            custom_fdiffs,
            custom_chains,
        )?;

        Ok(descriptor)
    }

    fn read_mandatory_fields(&mut self, descriptor: &mut DependencyDescriptor) -> Result<()> {
        descriptor.first_packet_in_frame = self.reader.read_bool()?;
        descriptor.last_packet_in_frame = self.reader.read_bool()?;
        self.template_id = self.reader.read_bits(6)? as u8;
        descriptor.frame_number = self.reader.read_bits(16)? as u16;
        Ok(())
    }

    fn read_template_dependency_structure(&mut self) -> Result<FrameDependencyStructure> {
        let mut structure = FrameDependencyStructure {
            structure_id: self.reader.read_bits(6)? as u8,
            num_decode_targets: self.reader.read_bits(5)? as usize + 1,
            ..Default::default()
        };

        self.read_template_layers(&mut structure)?;
        self.read_template_dtis(&mut structure)?;
        self.read_template_fdiffs(&mut structure)?;
        self.read_template_chains(&mut structure)?;

        let resolutions_present = self.reader.read_bool()?;
        if resolutions_present {
            self.read_render_resolutions(&mut structure)?;
        }
        Ok(structure)
    }

    fn read_template_layers(&mut self, structure: &mut FrameDependencyStructure) -> Result<()> {
        const SAME_LAYER: u64 = 0;
        const NEXT_TEMPORAL: u64 = 1;
        const NEXT_SPATIAL: u64 = 2;
        const NO_MORE_TEMPLATES: u64 = 3;

        let mut spatial_id = 0u8;
        let mut temporal_id = 0u8;
        loop {
            if structure.templates.len() == MAX_TEMPLATES {
                return Err(Error::ErrMalformedDescriptor);
            }
            structure.templates.push(FrameDependencyTemplate {
                spatial_id,
                temporal_id,
                ..Default::default()
            });

            match self.reader.read_bits(2)? {
                SAME_LAYER => {}
                NEXT_TEMPORAL => {
                    temporal_id += 1;
                    if temporal_id as usize >= MAX_TEMPORAL_IDS {
                        return Err(Error::ErrMalformedDescriptor);
                    }
                }
                NEXT_SPATIAL => {
                    spatial_id += 1;
                    temporal_id = 0;
                    if spatial_id as usize >= MAX_SPATIAL_IDS {
                        return Err(Error::ErrMalformedDescriptor);
                    }
                }
                NO_MORE_TEMPLATES => break,
                _ => unreachable!(),
            }
        }
        Ok(())
    }

    fn read_template_dtis(&mut self, structure: &mut FrameDependencyStructure) -> Result<()> {
        let num_decode_targets = structure.num_decode_targets;
        for template in &mut structure.templates {
            template.decode_target_indications.clear();
            for _ in 0..num_decode_targets {
                let bits = self.reader.read_bits(2)? as u32;
                template
                    .decode_target_indications
                    .push(DecodeTargetIndication::from_bits(bits));
            }
        }
        Ok(())
    }

    fn read_template_fdiffs(&mut self, structure: &mut FrameDependencyStructure) -> Result<()> {
        for template in &mut structure.templates {
            while self.reader.read_bool()? {
                let fdiff_minus_one = self.reader.read_bits(4)?;
                template.frame_diffs.push(fdiff_minus_one as u32 + 1);
            }
        }
        Ok(())
    }

    fn read_template_chains(&mut self, structure: &mut FrameDependencyStructure) -> Result<()> {
        structure.num_chains = self
            .reader
            .read_non_symmetric(structure.num_decode_targets as u32 + 1)?
            as usize;
        if structure.num_chains == 0 {
            return Ok(());
        }
        for _ in 0..structure.num_decode_targets {
            let protected_by = self.reader.read_non_symmetric(structure.num_chains as u32)?;
            structure
                .decode_target_protected_by_chain
                .push(protected_by as usize);
        }
        let num_chains = structure.num_chains;
        for template in &mut structure.templates {
            for _ in 0..num_chains {
                template.chain_diffs.push(self.reader.read_bits(4)? as u32);
            }
        }
        Ok(())
    }

    fn read_render_resolutions(&mut self, structure: &mut FrameDependencyStructure) -> Result<()> {
        let highest_spatial_id = structure
            .templates
            .iter()
            .map(|t| t.spatial_id)
            .max()
            .unwrap_or(0);
        for _ in 0..=highest_spatial_id {
            let width = self.reader.read_bits(16)? as u32 + 1;
            let height = self.reader.read_bits(16)? as u32 + 1;
            structure
                .resolutions
                .push(RenderResolution { width, height });
        }
        Ok(())
    }

    fn read_frame_dependency_definition(
        &mut self,
        descriptor: &mut DependencyDescriptor,
        custom_dtis: bool,
        custom_fdiffs: bool,
        custom_chains: bool,
    ) -> Result<()> {
        let attached = descriptor.attached_structure.take();
        let structure = match attached.as_ref() {
            Some(structure) => structure,
            None => self.structure.ok_or(Error::ErrMissingStructure)?,
        };

        let template_index = (self.template_id as usize + MAX_TEMPLATES
            - structure.structure_id as usize)
            % MAX_TEMPLATES;
        if template_index >= structure.templates.len() {
            return Err(Error::ErrMalformedDescriptor);
        }
        let mut dependencies = structure.templates[template_index].clone();

        if custom_dtis {
            for dti in dependencies.decode_target_indications.iter_mut() {
                *dti = DecodeTargetIndication::from_bits(self.reader.read_bits(2)? as u32);
            }
        }

        if custom_fdiffs {
            dependencies.frame_diffs.clear();
            loop {
                let next_fdiff_size = self.reader.read_bits(2)? as usize;
                if next_fdiff_size == 0 {
                    break;
                }
                let fdiff_minus_one = self.reader.read_bits(4 * next_fdiff_size)?;
                dependencies.frame_diffs.push(fdiff_minus_one as u32 + 1);
            }
        }

        if custom_chains {
            dependencies.chain_diffs.clear();
            for _ in 0..structure.num_chains {
                dependencies.chain_diffs.push(self.reader.read_bits(8)? as u32);
            }
        }

        if (dependencies.spatial_id as usize) < structure.resolutions.len() {
            descriptor.resolution = Some(structure.resolutions[dependencies.spatial_id as usize]);
        }
        descriptor.attached_structure = attached;
        descriptor.frame_dependencies = Some(dependencies);
        Ok(())
    }
}

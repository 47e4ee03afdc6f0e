
use std::collections::VecDeque;

use crate::buffer::video_layer::{VideoLayer, DEFAULT_MAX_LAYER, INVALID_LAYER};
use crate::buffer::vp8::Vp8Descriptor;
use crate::buffer::ExtPacket;
use crate::error::{Error, Result};
use crate::stream_info::MediaKind;
use crate::utils::median_f32;

/// Offset history entries kept for out-of-order source packets.
const OFFSET_HISTORY: usize = 32;
/// Frame interval samples per layer for the timestamp step estimate.
const FRAME_INTERVAL_SAMPLES: usize = 8;
/// Assumed frame rate when the destination layer has never produced a frame.
const FALLBACK_FPS: u64 = 30;

/// MigrateState gates egress while a participant is moved between nodes:
/// nothing is forwarded until the migration handshake completes.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrateState {
    Init,
    Sync,
    #[default]
    Complete,
}

/// The rewritten wire values of one outgoing packet, with their 64-bit
/// extended counterparts for send-side statistics.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnTs {
    pub sequence_number: u16,
    pub timestamp: u32,
    pub ext_sequence_number: u64,
    pub ext_timestamp: u64,
}

/// TranslationParams is the forwarder's verdict on one packet.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub struct TranslationParams {
    pub should_drop: bool,
    pub rtp: Option<SnTs>,
    pub marker: bool,
    /// Rewritten VP8 picture id / tl0picidx when the codec requires munging.
    pub vp8: Option<(u16, u8)>,
    /// The packet performed a layer switch.
    pub switched_layer: bool,
}

#[derive(Default, Debug, Clone, Copy)]
pub struct RtpMungerState {
    pub started: bool,
    pub ext_last_in_seq: u64,
    pub ext_last_out_seq: u64,
    pub ext_last_out_ts: u64,
    pub seq_offset: i64,
    pub ts_offset: i64,
    pub last_marker: bool,
}

/// RtpMunger translates per-layer source sequence numbers and timestamps
/// into one monotonic subscriber-facing stream. Offsets change on layer
/// switches and when packets are dropped; a short offset history answers
/// out-of-order sources.
#[derive(Default, Debug)]
struct RtpMunger {
    started: bool,
    ext_last_in_seq: u64,
    ext_last_out_seq: u64,
    ext_last_out_ts: u64,
    seq_offset: i64,
    ts_offset: i64,
    last_marker: bool,
    offsets: VecDeque<(u64, i64)>,
}

impl RtpMunger {
    fn out_seq(&self, ext_seq: u64, offset: i64) -> u64 {
        (ext_seq as i64 + offset) as u64
    }

    /// Rewrites an in-order packet; out-of-order sources are answered from
    /// the offset history without advancing state.
    fn update_and_get_snts(
        &mut self,
        ext_seq: u64,
        ext_ts: u64,
        marker: bool,
        payload_size: usize,
    ) -> Result<SnTs> {
        if !self.started {
            self.started = true;
            self.ext_last_in_seq = ext_seq - 1;
            self.ext_last_out_seq = self.out_seq(ext_seq, self.seq_offset) - 1;
            self.offsets.push_back((ext_seq, self.seq_offset));
        }

        if ext_seq == self.ext_last_in_seq {
            return Err(Error::ErrDuplicatePacket);
        }

        if ext_seq < self.ext_last_in_seq {
            // retransmission of an already-processed source packet
            let offset = self
                .offsets
                .iter()
                .rev()
                .find(|(from, _)| *from <= ext_seq)
                .map(|(_, offset)| *offset)
                .ok_or(Error::ErrOutOfOrderSequenceNumberCacheMiss)?;
            let ext_out_seq = self.out_seq(ext_seq, offset);
            let ext_out_ts = (ext_ts as i64 + self.ts_offset) as u64;
            return Ok(SnTs {
                sequence_number: ext_out_seq as u16,
                timestamp: ext_out_ts as u32,
                ext_sequence_number: ext_out_seq,
                ext_timestamp: ext_out_ts,
            });
        }

        if payload_size == 0 {
            // padding only, compact the outgoing sequence space
            self.ext_last_in_seq = ext_seq;
            self.seq_offset -= 1;
            self.offsets.push_back((ext_seq + 1, self.seq_offset));
            self.trim_offsets();
            return Err(Error::ErrPaddingOnlyPacket);
        }

        self.ext_last_in_seq = ext_seq;
        self.ext_last_out_seq = self.out_seq(ext_seq, self.seq_offset);
        self.ext_last_out_ts = (ext_ts as i64 + self.ts_offset) as u64;
        self.last_marker = marker;
        Ok(SnTs {
            sequence_number: self.ext_last_out_seq as u16,
            timestamp: self.ext_last_out_ts as u32,
            ext_sequence_number: self.ext_last_out_seq,
            ext_timestamp: self.ext_last_out_ts,
        })
    }

    /// A filtered in-order packet: later packets shift down to keep the
    /// outgoing stream gap-free.
    fn packet_dropped(&mut self, ext_seq: u64) {
        if !self.started || ext_seq <= self.ext_last_in_seq {
            return;
        }
        self.ext_last_in_seq = ext_seq;
        self.seq_offset -= 1;
        self.offsets.push_back((ext_seq + 1, self.seq_offset));
        self.trim_offsets();
    }

    /// Re-anchors at a layer switch so `out_seq` continues at
    /// `last_out + 1` and `out_ts` advances by one frame interval.
    fn update_offsets(&mut self, ext_seq: u64, ext_ts: u64, ts_step: u64) {
        self.seq_offset = (self.ext_last_out_seq + 1) as i64 - ext_seq as i64;
        self.ts_offset = (self.ext_last_out_ts + ts_step) as i64 - ext_ts as i64;
        self.ext_last_in_seq = ext_seq - 1;
        self.offsets.push_back((ext_seq, self.seq_offset));
        self.trim_offsets();
    }

    /// Sequence numbers for padding; padding consumes outgoing numbers
    /// without source counterparts, so the offset moves up.
    fn padding_snts(&mut self, num: usize, kind: MediaKind) -> Result<Vec<SnTs>> {
        if kind == MediaKind::Video && self.started && !self.last_marker {
            return Err(Error::ErrPaddingNotOnFrameBoundary);
        }

        let mut out = Vec::with_capacity(num);
        for _ in 0..num {
            self.ext_last_out_seq += 1;
            self.seq_offset += 1;
            out.push(SnTs {
                sequence_number: self.ext_last_out_seq as u16,
                timestamp: self.ext_last_out_ts as u32,
                ext_sequence_number: self.ext_last_out_seq,
                ext_timestamp: self.ext_last_out_ts,
            });
        }
        if num > 0 {
            self.offsets
                .push_back((self.ext_last_in_seq + 1, self.seq_offset));
            self.trim_offsets();
        }
        Ok(out)
    }

    /// Sequence numbers and timestamps for generated blank frames.
    fn blank_frame_snts(&mut self, num: usize, ts_step: u64) -> Vec<SnTs> {
        let mut out = Vec::with_capacity(num);
        for _ in 0..num {
            self.ext_last_out_seq += 1;
            self.ext_last_out_ts += ts_step;
            self.seq_offset += 1;
            self.ts_offset += ts_step as i64;
            out.push(SnTs {
                sequence_number: self.ext_last_out_seq as u16,
                timestamp: self.ext_last_out_ts as u32,
                ext_sequence_number: self.ext_last_out_seq,
                ext_timestamp: self.ext_last_out_ts,
            });
        }
        if num > 0 {
            self.offsets
                .push_back((self.ext_last_in_seq + 1, self.seq_offset));
            self.trim_offsets();
            self.last_marker = true;
        }
        out
    }

    fn trim_offsets(&mut self) {
        while self.offsets.len() > OFFSET_HISTORY {
            self.offsets.pop_front();
        }
    }

    fn state(&self) -> RtpMungerState {
        RtpMungerState {
            started: self.started,
            ext_last_in_seq: self.ext_last_in_seq,
            ext_last_out_seq: self.ext_last_out_seq,
            ext_last_out_ts: self.ext_last_out_ts,
            seq_offset: self.seq_offset,
            ts_offset: self.ts_offset,
            last_marker: self.last_marker,
        }
    }

    fn seed(&mut self, state: RtpMungerState) {
        self.started = state.started;
        self.ext_last_in_seq = state.ext_last_in_seq;
        self.ext_last_out_seq = state.ext_last_out_seq;
        self.ext_last_out_ts = state.ext_last_out_ts;
        self.seq_offset = state.seq_offset;
        self.ts_offset = state.ts_offset;
        self.last_marker = state.last_marker;
        self.offsets.clear();
        self.offsets
            .push_back((state.ext_last_in_seq + 1, state.seq_offset));
    }
}

#[derive(Default, Debug, Clone, Copy)]
pub struct Vp8MungerState {
    pub started: bool,
    pub ext_last_pic_id_in: i64,
    pub pic_id_offset: i64,
    pub last_tl0_in: u8,
    pub tl0_offset: i32,
}

/// Vp8Munger keeps picture id and tl0picidx continuous across layer
/// switches and temporal drops.
#[derive(Default, Debug)]
struct Vp8Munger {
    started: bool,
    ext_last_pic_id_in: i64,
    last_pic_id_raw: u16,
    pic_id_offset: i64,
    last_tl0_in: u8,
    tl0_offset: i32,
    dropping_picture: Option<i64>,
}

impl Vp8Munger {
    /// Unwraps the 15-bit picture id against the last seen value.
    fn unwrap_pic_id(&mut self, pic_id: u16) -> i64 {
        if !self.started {
            return pic_id as i64;
        }
        let last_raw = self.last_pic_id_raw;
        let forward = (pic_id.wrapping_sub(last_raw)) & 0x7fff;
        if forward < 1 << 14 {
            self.ext_last_pic_id_in + forward as i64
        } else {
            self.ext_last_pic_id_in - ((last_raw.wrapping_sub(pic_id)) & 0x7fff) as i64
        }
    }

    fn update_and_get(&mut self, vp8: &Vp8Descriptor) -> (u16, u8) {
        let ext_pic_id = self.unwrap_pic_id(vp8.picture_id);
        if !self.started {
            self.started = true;
        }
        if ext_pic_id >= self.ext_last_pic_id_in {
            self.ext_last_pic_id_in = ext_pic_id;
            self.last_pic_id_raw = vp8.picture_id;
            self.last_tl0_in = vp8.tl0_pic_idx;
        }

        let out_pic_id = ((ext_pic_id + self.pic_id_offset) & 0x7fff) as u16;
        let out_tl0 = (vp8.tl0_pic_idx as i32 + self.tl0_offset) as u8;
        (out_pic_id, out_tl0)
    }

    /// A whole picture is being filtered: later pictures shift down.
    fn packet_dropped(&mut self, vp8: &Vp8Descriptor) {
        let ext_pic_id = self.unwrap_pic_id(vp8.picture_id);
        if !self.started {
            return;
        }
        if self.dropping_picture != Some(ext_pic_id) {
            self.dropping_picture = Some(ext_pic_id);
            self.pic_id_offset -= 1;
        }
        if ext_pic_id >= self.ext_last_pic_id_in {
            self.ext_last_pic_id_in = ext_pic_id;
            self.last_pic_id_raw = vp8.picture_id;
        }
    }

    /// Re-anchors at a layer switch so the picture id continues at
    /// `last_out + 1`.
    fn update_offsets(&mut self, vp8: &Vp8Descriptor) {
        let last_out_pic = self.ext_last_pic_id_in + self.pic_id_offset;
        let last_out_tl0 = self.last_tl0_in as i32 + self.tl0_offset;

        let ext_pic_id = {
            // new source layer, reset the unwrap anchor
            self.last_pic_id_raw = vp8.picture_id;
            vp8.picture_id as i64
        };
        self.pic_id_offset = last_out_pic + 1 - ext_pic_id;
        self.tl0_offset = last_out_tl0 + 1 - vp8.tl0_pic_idx as i32;
        self.ext_last_pic_id_in = ext_pic_id;
        self.last_tl0_in = vp8.tl0_pic_idx;
        self.dropping_picture = None;
        self.started = true;
    }

    fn state(&self) -> Vp8MungerState {
        Vp8MungerState {
            started: self.started,
            ext_last_pic_id_in: self.ext_last_pic_id_in,
            pic_id_offset: self.pic_id_offset,
            last_tl0_in: self.last_tl0_in,
            tl0_offset: self.tl0_offset,
        }
    }

    fn seed(&mut self, state: Vp8MungerState) {
        self.started = state.started;
        self.ext_last_pic_id_in = state.ext_last_pic_id_in;
        self.last_pic_id_raw = (state.ext_last_pic_id_in & 0x7fff) as u16;
        self.pic_id_offset = state.pic_id_offset;
        self.last_tl0_in = state.last_tl0_in;
        self.tl0_offset = state.tl0_offset;
    }
}

/// ForwarderState is the serializable part of a forwarder, carried across
/// a migration so the subscriber-facing stream stays continuous.
#[derive(Default, Debug, Clone, Copy)]
pub struct ForwarderState {
    pub started: bool,
    pub current: VideoLayer,
    pub rtp: RtpMungerState,
    pub vp8: Option<Vp8MungerState>,
}

/// Forwarder owns all layer-switch policy and all sequence/timestamp
/// rewriting for one DownTrack.
pub struct Forwarder {
    kind: MediaKind,
    clock_rate: u32,

    muted: bool,
    migrate_state: MigrateState,

    target: VideoLayer,
    current: VideoLayer,
    max_published: VideoLayer,
    max_subscribed: VideoLayer,

    /// last forwarded packet closed a frame of the current layer
    current_frame_complete: bool,
    /// first packet after a migration seed re-anchors the offsets
    reanchor: bool,

    rtp_munger: RtpMunger,
    vp8_munger: Option<Vp8Munger>,

    last_frame_ts: [Option<u64>; 3],
    frame_intervals: [VecDeque<f32>; 3],
}

impl Forwarder {
    pub fn new(kind: MediaKind, clock_rate: u32, mime_type: &str) -> Self {
        let vp8_munger = if mime_type.eq_ignore_ascii_case("video/vp8") {
            Some(Vp8Munger::default())
        } else {
            None
        };
        Forwarder {
            kind,
            clock_rate,
            muted: false,
            migrate_state: MigrateState::Complete,
            target: if kind == MediaKind::Audio {
                VideoLayer::new(0, 0)
            } else {
                INVALID_LAYER
            },
            current: INVALID_LAYER,
            max_published: DEFAULT_MAX_LAYER,
            max_subscribed: DEFAULT_MAX_LAYER,
            current_frame_complete: true,
            reanchor: false,
            rtp_munger: RtpMunger::default(),
            vp8_munger,
            last_frame_ts: [None; 3],
            frame_intervals: Default::default(),
        }
    }

    pub fn mute(&mut self, muted: bool) -> bool {
        if self.muted == muted {
            return false;
        }
        self.muted = muted;
        true
    }

    pub fn is_muted(&self) -> bool {
        self.muted
    }

    pub fn set_migrate_state(&mut self, state: MigrateState) {
        self.migrate_state = state;
    }

    pub fn migrate_state(&self) -> MigrateState {
        self.migrate_state
    }

    pub fn set_target_layer(&mut self, target: VideoLayer) {
        self.target = target;
    }

    pub fn target_layer(&self) -> VideoLayer {
        self.target
    }

    pub fn current_layer(&self) -> VideoLayer {
        self.current
    }

    pub fn set_max_published_layer(&mut self, layer: VideoLayer) {
        self.max_published = layer;
    }

    pub fn max_published_layer(&self) -> VideoLayer {
        self.max_published
    }

    pub fn set_max_subscribed_layer(&mut self, layer: VideoLayer) {
        self.max_subscribed = layer;
    }

    pub fn max_subscribed_layer(&self) -> VideoLayer {
        self.max_subscribed
    }

    pub fn get_state(&self) -> ForwarderState {
        ForwarderState {
            started: self.rtp_munger.started,
            current: self.current,
            rtp: self.rtp_munger.state(),
            vp8: self.vp8_munger.as_ref().map(|m| m.state()),
        }
    }

    pub fn seed_state(&mut self, state: ForwarderState) {
        if !state.started {
            return;
        }
        self.current = state.current;
        self.rtp_munger.seed(state.rtp);
        if let (Some(munger), Some(vp8)) = (self.vp8_munger.as_mut(), state.vp8) {
            munger.seed(vp8);
        }
        // the next source packet belongs to a fresh sequence space
        self.reanchor = true;
    }

    /// The layer-selection and rewrite decision for one packet of source
    /// spatial layer `spatial`.
    pub fn get_translation_params(
        &mut self,
        ext_packet: &ExtPacket,
        spatial: i32,
    ) -> Result<TranslationParams> {
        if self.muted || self.migrate_state != MigrateState::Complete {
            // keep the outgoing sequence space gap-free for the layer being
            // forwarded; other layers have their own sequence spaces
            if self.kind == MediaKind::Audio || spatial == self.current.spatial {
                self.rtp_munger.packet_dropped(ext_packet.ext_sequence_number);
                if let (Some(munger), Some(vp8)) =
                    (self.vp8_munger.as_mut(), ext_packet.vp8.as_ref())
                {
                    munger.packet_dropped(vp8);
                }
            }
            return Ok(TranslationParams {
                should_drop: true,
                ..Default::default()
            });
        }

        match self.kind {
            MediaKind::Audio => self.translate_audio(ext_packet),
            MediaKind::Video => self.translate_video(ext_packet, spatial),
            MediaKind::Unspecified => Err(Error::ErrUnknownKind),
        }
    }

    fn translate_audio(&mut self, ext_packet: &ExtPacket) -> Result<TranslationParams> {
        if self.reanchor {
            self.reanchor = false;
            if self.rtp_munger.started {
                self.rtp_munger.update_offsets(
                    ext_packet.ext_sequence_number,
                    ext_packet.ext_timestamp,
                    1,
                );
            }
        }
        let snts = self.rtp_munger.update_and_get_snts(
            ext_packet.ext_sequence_number,
            ext_packet.ext_timestamp,
            ext_packet.packet.header.marker,
            ext_packet.packet.payload.len(),
        )?;
        Ok(TranslationParams {
            should_drop: false,
            rtp: Some(snts),
            marker: ext_packet.packet.header.marker,
            ..Default::default()
        })
    }

    fn translate_video(
        &mut self,
        ext_packet: &ExtPacket,
        spatial: i32,
    ) -> Result<TranslationParams> {
        self.observe_frame_interval(ext_packet, spatial);

        if self.reanchor && self.current.is_valid() && spatial == self.current.spatial {
            self.reanchor = false;
            self.anchor_initial(ext_packet);
        }

        if !self.target.is_valid() {
            // not subscribed to anything right now
            return Ok(TranslationParams {
                should_drop: true,
                ..Default::default()
            });
        }

        let previous = self.current;
        let mut switched = false;
        if self.current.spatial == INVALID_LAYER.spatial {
            // locking onto the first layer needs a decodable entry point
            if spatial <= self.target.spatial && ext_packet.key_frame {
                self.current = VideoLayer::new(spatial, self.target.temporal.max(0));
                self.anchor_initial(ext_packet);
                switched = true;
            } else {
                return Ok(TranslationParams {
                    should_drop: true,
                    ..Default::default()
                });
            }
        } else if spatial > self.current.spatial {
            // switch up only on a decodable entry point within the target
            if spatial <= self.target.spatial && (ext_packet.key_frame || self.has_switch_indication(ext_packet)) {
                self.switch_layer(ext_packet, spatial);
                switched = true;
            } else {
                return Ok(TranslationParams {
                    should_drop: true,
                    ..Default::default()
                });
            }
        } else if spatial < self.current.spatial {
            // switch down at a frame boundary when commanded below current
            if self.target.spatial < self.current.spatial && self.current_frame_complete {
                self.switch_layer(ext_packet, spatial);
                switched = true;
            } else {
                return Ok(TranslationParams {
                    should_drop: true,
                    ..Default::default()
                });
            }
        }

        // temporal filtering within the locked spatial layer
        if !switched && self.should_drop_temporal(ext_packet) {
            self.rtp_munger.packet_dropped(ext_packet.ext_sequence_number);
            if let (Some(munger), Some(vp8)) = (self.vp8_munger.as_mut(), ext_packet.vp8.as_ref()) {
                munger.packet_dropped(vp8);
            }
            return Ok(TranslationParams {
                should_drop: true,
                ..Default::default()
            });
        }

        self.current.temporal = self.target.temporal;

        let marker = self.is_frame_end(ext_packet);
        let result = self.rtp_munger.update_and_get_snts(
            ext_packet.ext_sequence_number,
            ext_packet.ext_timestamp,
            ext_packet.packet.header.marker,
            ext_packet.packet.payload.len(),
        );
        let snts = match result {
            Ok(snts) => snts,
            Err(err) => {
                // a failed switch leaves state on the previous layer
                if switched {
                    self.current = previous;
                }
                return Err(err);
            }
        };
        self.current_frame_complete = marker;

        let vp8 = match (self.vp8_munger.as_mut(), ext_packet.vp8.as_ref()) {
            (Some(munger), Some(vp8)) => Some(munger.update_and_get(vp8)),
            _ => None,
        };

        Ok(TranslationParams {
            should_drop: false,
            rtp: Some(snts),
            marker: ext_packet.packet.header.marker,
            vp8,
            switched_layer: switched,
        })
    }

    /// Padding sequence numbers at the current position; video padding is
    /// only admitted between frames, and only once media has flowed.
    pub fn get_padding_snts(&mut self, num: usize) -> Result<Vec<SnTs>> {
        if !self.rtp_munger.started {
            return Ok(vec![]);
        }
        self.rtp_munger.padding_snts(num, self.kind)
    }

    /// Blank frames step the timestamp one frame interval each.
    pub fn get_blank_frame_snts(&mut self, num: usize) -> Vec<SnTs> {
        if !self.rtp_munger.started {
            return vec![];
        }
        let ts_step = self.estimate_ts_step(self.current.spatial.max(0));
        self.rtp_munger.blank_frame_snts(num, ts_step)
    }

    fn anchor_initial(&mut self, ext_packet: &ExtPacket) {
        if let (Some(munger), Some(vp8)) = (self.vp8_munger.as_mut(), ext_packet.vp8.as_ref()) {
            if munger.started {
                munger.update_offsets(vp8);
            }
        }
        if self.rtp_munger.started {
            let ts_step = self.estimate_ts_step(self.current.spatial);
            self.rtp_munger.update_offsets(
                ext_packet.ext_sequence_number,
                ext_packet.ext_timestamp,
                ts_step,
            );
        }
    }

    fn switch_layer(&mut self, ext_packet: &ExtPacket, spatial: i32) {
        let ts_step = self.estimate_ts_step(spatial);
        self.rtp_munger.update_offsets(
            ext_packet.ext_sequence_number,
            ext_packet.ext_timestamp,
            ts_step,
        );
        if let (Some(munger), Some(vp8)) = (self.vp8_munger.as_mut(), ext_packet.vp8.as_ref()) {
            munger.update_offsets(vp8);
        }
        self.current = VideoLayer::new(spatial, self.target.temporal.max(0));
        self.current_frame_complete = false;
    }

    /// An SVC stream signals a safe up-switch point with a 'S' (switch)
    /// decode target indication on an active target.
    fn has_switch_indication(&self, ext_packet: &ExtPacket) -> bool {
        let Some(dd) = ext_packet.dependency_descriptor.as_ref() else {
            return false;
        };
        let Some(deps) = dd.descriptor.frame_dependencies.as_ref() else {
            return false;
        };
        deps.decode_target_indications
            .iter()
            .any(|dti| *dti == crate::dependency_descriptor::DecodeTargetIndication::Switch)
    }

    fn should_drop_temporal(&self, ext_packet: &ExtPacket) -> bool {
        let max_temporal = self.target.temporal;
        if max_temporal < 0 {
            return false;
        }
        if let Some(dd) = ext_packet.dependency_descriptor.as_ref() {
            return dd.descriptor.temporal_id() as i32 > max_temporal;
        }
        if let Some(vp8) = ext_packet.vp8.as_ref() {
            return vp8.t && vp8.tid as i32 > max_temporal;
        }
        false
    }

    fn is_frame_end(&self, ext_packet: &ExtPacket) -> bool {
        if let Some(dd) = ext_packet.dependency_descriptor.as_ref() {
            return dd.descriptor.last_packet_in_frame;
        }
        ext_packet.packet.header.marker
    }

    fn observe_frame_interval(&mut self, ext_packet: &ExtPacket, spatial: i32) {
        if !(0..3).contains(&spatial) || !self.is_frame_end(ext_packet) {
            return;
        }
        let idx = spatial as usize;
        if let Some(last) = self.last_frame_ts[idx] {
            let delta = ext_packet.ext_timestamp.saturating_sub(last);
            if delta > 0 {
                let intervals = &mut self.frame_intervals[idx];
                intervals.push_back(delta as f32);
                while intervals.len() > FRAME_INTERVAL_SAMPLES {
                    intervals.pop_front();
                }
            }
        }
        self.last_frame_ts[idx] = Some(ext_packet.ext_timestamp);
    }

    /// One frame interval of the destination layer in RTP ticks: the median
    /// of recent inter-frame deltas, a nominal frame when unseen, clamped
    /// to [1, clock_rate / 5].
    fn estimate_ts_step(&self, spatial: i32) -> u64 {
        let measured = if (0..3).contains(&spatial) {
            let mut samples: Vec<f32> = self.frame_intervals[spatial as usize]
                .iter()
                .copied()
                .collect();
            median_f32(&mut samples) as u64
        } else {
            0
        };

        let step = if measured > 0 {
            measured
        } else {
            (self.clock_rate as u64 / FALLBACK_FPS).max(1)
        };
        step.clamp(1, (self.clock_rate as u64 / 5).max(1))
    }
}

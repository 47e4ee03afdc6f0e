pub mod bucket;
pub mod frame_integrity;
pub mod nack_queue;
pub mod pool;
pub mod rtcp_reader;
pub mod rtp_stats;
pub mod video_layer;
pub mod video_layer_utils;
#[cfg(test)]
mod video_layer_utils_test;
pub mod vp8;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use bytes::Bytes;
use rtcp::payload_feedbacks::full_intra_request::{FirEntry, FullIntraRequest};
use rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;
use rtcp::receiver_report::ReceiverReport;
use rtcp::sender_report::SenderReport;
use rtcp::transport_feedbacks::transport_layer_nack::{
    nack_pairs_from_sequence_numbers, TransportLayerNack,
};
use rtp::extension::abs_send_time_extension::AbsSendTimeExtension;
use rtp::extension::audio_level_extension::AudioLevelExtension;
use rtp::extension::transport_cc_extension::TransportCcExtension;
use tokio::sync::mpsc;
use util::marshal::{MarshalSize, Unmarshal};
use util::sync::Mutex;

use crate::audio::{AudioLevel, AudioLevelParams};
use crate::buffer::bucket::Bucket;
use crate::buffer::frame_integrity::FrameIntegrityChecker;
use crate::buffer::nack_queue::NackQueue;
use crate::buffer::pool::SlabPool;
use crate::buffer::rtp_stats::{RtpStats, RtpStatsParams};
use crate::buffer::video_layer::{VideoLayer, INVALID_LAYER_SPATIAL};
use crate::buffer::vp8::Vp8Descriptor;
use crate::dependency_descriptor::{
    DependencyDescriptorReader, ExtDependencyDescriptor, FrameDependencyStructure,
};
use crate::error::{Error, Result};
use crate::stream_info::{
    MediaKind, StreamInfo, ABS_SEND_TIME_URI, AUDIO_LEVEL_URI, DEPENDENCY_DESCRIPTOR_URI,
    TRANSPORT_CC_URI,
};
use crate::utils::{spawn_isolated, SeqUnwrapper, TsUnwrapper};

pub use rtcp_reader::RtcpReader;

/// Receiver report cadence.
pub const REPORT_DELTA: Duration = Duration::from_secs(1);

const DEFAULT_NACK_INTERVAL: Duration = Duration::from_millis(20);
const DEFAULT_PLI_THROTTLE: Duration = Duration::from_millis(500);
const DEFAULT_REORDER_WINDOW: u64 = 128;
/// A head-of-line gap older than this is given up on and skipped over.
const PENDING_STALE_AFTER: Duration = Duration::from_millis(500);

const FRAME_INTEGRITY_FRAMES: usize = 128;
const FRAME_INTEGRITY_PACKETS: usize = 1024;

const MAX_PENDING_BIND_PACKETS: usize = 200;

const NUM_TEMPORAL_LAYERS: usize = 4;
const BITRATE_SLOTS: usize = 10;
const BITRATE_SLOT_DURATION: Duration = Duration::from_millis(100);

pub type OnRtcpFeedbackFn =
    Box<dyn Fn(Vec<Box<dyn rtcp::packet::Packet + Send + Sync>>) + Send + Sync>;
pub type OnCloseFn = Box<dyn Fn() + Send + Sync>;

/// ExtPacket is one inbound RTP packet decorated with everything the fanout
/// side needs: unwrapped counters, key-frame flag, codec side info. The raw
/// bytes and payload are shared, each DownTrack owns its own rewrite.
#[derive(Debug, Clone)]
pub struct ExtPacket {
    pub arrival: SystemTime,
    pub packet: rtp::packet::Packet,
    pub raw: Bytes,
    pub ext_sequence_number: u64,
    pub ext_timestamp: u64,
    pub key_frame: bool,
    pub layer: VideoLayer,
    pub vp8: Option<Vp8Descriptor>,
    pub dependency_descriptor: Option<ExtDependencyDescriptor>,
    pub transport_cc_sequence: Option<u16>,
    pub abs_send_time: Option<u64>,
}

impl Default for ExtPacket {
    fn default() -> Self {
        ExtPacket {
            arrival: SystemTime::UNIX_EPOCH,
            packet: rtp::packet::Packet::default(),
            raw: Bytes::new(),
            ext_sequence_number: 0,
            ext_timestamp: 0,
            key_frame: false,
            layer: VideoLayer::default(),
            vp8: None,
            dependency_descriptor: None,
            transport_cc_sequence: None,
            abs_send_time: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BufferOptions {
    pub nack_interval: Duration,
    pub pli_throttle: Duration,
    /// Packets held back waiting for a head-of-line gap to fill.
    pub reorder_window: u64,
    pub audio_level: AudioLevelParams,
}

impl Default for BufferOptions {
    fn default() -> Self {
        BufferOptions {
            nack_interval: DEFAULT_NACK_INTERVAL,
            pli_throttle: DEFAULT_PLI_THROTTLE,
            reorder_window: DEFAULT_REORDER_WINDOW,
            audio_level: AudioLevelParams::default(),
        }
    }
}

#[derive(Default)]
struct ExtensionIds {
    transport_cc: u8,
    audio_level: u8,
    abs_send_time: u8,
    dependency_descriptor: u8,
}

struct BitrateTracker {
    slots: [[u64; NUM_TEMPORAL_LAYERS]; BITRATE_SLOTS],
    cursor: usize,
    slot_start: Instant,
}

impl BitrateTracker {
    fn new() -> Self {
        BitrateTracker {
            slots: [[0; NUM_TEMPORAL_LAYERS]; BITRATE_SLOTS],
            cursor: 0,
            slot_start: Instant::now(),
        }
    }

    fn rotate(&mut self, now: Instant) {
        while now.duration_since(self.slot_start) >= BITRATE_SLOT_DURATION {
            self.cursor = (self.cursor + 1) % BITRATE_SLOTS;
            self.slots[self.cursor] = [0; NUM_TEMPORAL_LAYERS];
            self.slot_start += BITRATE_SLOT_DURATION;
        }
    }

    fn add(&mut self, temporal: usize, bytes: usize, now: Instant) {
        self.rotate(now);
        self.slots[self.cursor][temporal.min(NUM_TEMPORAL_LAYERS - 1)] += bytes as u64;
    }

    /// Bits per second per temporal layer over the tracked window.
    fn rates(&mut self, now: Instant) -> [u64; NUM_TEMPORAL_LAYERS] {
        self.rotate(now);
        let mut rates = [0u64; NUM_TEMPORAL_LAYERS];
        for slot in &self.slots {
            for (rate, bytes) in rates.iter_mut().zip(slot.iter()) {
                *rate += *bytes;
            }
        }
        let window = BITRATE_SLOT_DURATION.as_millis() as u64 * BITRATE_SLOTS as u64;
        for rate in rates.iter_mut() {
            *rate = *rate * 8 * 1000 / window;
        }
        rates
    }
}

struct BufferInner {
    bound: bool,
    info: StreamInfo,
    options: BufferOptions,
    kind: MediaKind,
    mime_type: String,
    clock_rate: u32,
    ext_ids: ExtensionIds,

    seq: SeqUnwrapper,
    ts: TsUnwrapper,
    frame_num: SeqUnwrapper,
    inited: bool,
    ext_highest_emitted: u64,
    pending: BTreeMap<u64, ExtPacket>,
    pending_bind: Vec<(Bytes, SystemTime)>,

    nack_enabled: bool,
    nack_queue: NackQueue,
    paused: bool,

    bucket: Option<Bucket>,
    stats: Option<Arc<RtpStats>>,
    frame_integrity: Option<FrameIntegrityChecker>,
    dd_structure: Option<FrameDependencyStructure>,
    dd_parse_failures: u64,
    audio_level: Option<Arc<AudioLevel>>,
    last_audio_ts: Option<u64>,
    bitrate: BitrateTracker,

    last_pli: Option<Instant>,
    packets_malformed: u64,
    packets_unknown_pt: u64,
    packets_too_old: u64,

    sender: Option<mpsc::UnboundedSender<ExtPacket>>,
}

/// Buffer turns the raw, possibly reordered and lossy datagram stream of
/// one inbound SSRC into an ordered stream of [`ExtPacket`]s plus periodic
/// RTCP feedback (NACK batches, receiver reports, throttled PLI).
pub struct Buffer {
    ssrc: u32,
    receiver_ssrc: u32,
    video_pool: Arc<SlabPool>,
    audio_pool: Arc<SlabPool>,

    inner: Mutex<BufferInner>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<ExtPacket>>,

    closed: AtomicBool,
    close_tx: Mutex<Option<mpsc::Sender<()>>>,

    on_rtcp_feedback: Mutex<Option<Arc<OnRtcpFeedbackFn>>>,
    on_close: Mutex<Option<OnCloseFn>>,
}

impl Buffer {
    pub fn new(ssrc: u32, video_pool: Arc<SlabPool>, audio_pool: Arc<SlabPool>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Buffer {
            ssrc,
            receiver_ssrc: rand::random::<u32>(),
            video_pool,
            audio_pool,
            inner: Mutex::new(BufferInner {
                bound: false,
                info: StreamInfo::default(),
                options: BufferOptions::default(),
                kind: MediaKind::Unspecified,
                mime_type: String::new(),
                clock_rate: 0,
                ext_ids: ExtensionIds::default(),
                seq: SeqUnwrapper::default(),
                ts: TsUnwrapper::default(),
                frame_num: SeqUnwrapper::default(),
                inited: false,
                ext_highest_emitted: 0,
                pending: BTreeMap::new(),
                pending_bind: Vec::new(),
                nack_enabled: false,
                nack_queue: NackQueue::new(),
                paused: false,
                bucket: None,
                stats: None,
                frame_integrity: None,
                dd_structure: None,
                dd_parse_failures: 0,
                audio_level: None,
                last_audio_ts: None,
                bitrate: BitrateTracker::new(),
                last_pli: None,
                packets_malformed: 0,
                packets_unknown_pt: 0,
                packets_too_old: 0,
                sender: Some(tx),
            }),
            rx: tokio::sync::Mutex::new(rx),
            closed: AtomicBool::new(false),
            close_tx: Mutex::new(None),
            on_rtcp_feedback: Mutex::new(None),
            on_close: Mutex::new(None),
        }
    }

    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    pub fn on_rtcp_feedback(&self, f: OnRtcpFeedbackFn) {
        *self.on_rtcp_feedback.lock() = Some(Arc::new(f));
    }

    pub fn on_close(&self, f: OnCloseFn) {
        *self.on_close.lock() = Some(f);
    }

    /// Binds the buffer to its negotiated stream parameters and starts the
    /// feedback loop. Packets written before the bind are replayed. Must be
    /// called within a tokio runtime; a second bind is ignored.
    pub fn bind(self: &Arc<Self>, info: StreamInfo, options: BufferOptions) {
        let nack_interval = options.nack_interval;
        let mut info = info;
        info.ssrc = self.ssrc;
        {
            let mut inner = self.inner.lock();
            if inner.bound {
                return;
            }

            inner.kind = info.codec.kind();
            inner.mime_type = info.codec.mime_type.to_ascii_lowercase();
            inner.clock_rate = info.codec.clock_rate;
            inner.ext_ids = ExtensionIds {
                transport_cc: info.extension_id(TRANSPORT_CC_URI),
                audio_level: info.extension_id(AUDIO_LEVEL_URI),
                abs_send_time: info.extension_id(ABS_SEND_TIME_URI),
                dependency_descriptor: info.extension_id(DEPENDENCY_DESCRIPTOR_URI),
            };
            inner.stats = Some(Arc::new(RtpStats::new(RtpStatsParams {
                clock_rate: info.codec.clock_rate,
            })));

            match inner.kind {
                MediaKind::Audio => {
                    inner.audio_level = Some(Arc::new(AudioLevel::new(options.audio_level)));
                    inner.bucket = Some(Bucket::new(self.audio_pool.acquire()));
                }
                MediaKind::Video => {
                    inner.nack_enabled = info.supports_nack();
                    inner.frame_integrity = Some(FrameIntegrityChecker::new(
                        FRAME_INTEGRITY_FRAMES,
                        FRAME_INTEGRITY_PACKETS,
                    ));
                    inner.bucket = Some(Bucket::new(self.video_pool.acquire()));
                }
                MediaKind::Unspecified => {}
            }

            inner.options = options;
            inner.info = info;
            inner.bound = true;

            let stashed = std::mem::take(&mut inner.pending_bind);
            for (raw, arrival) in stashed {
                let emits = Self::process(&mut inner, raw, arrival);
                Self::emit(&inner, emits);
            }
        }

        let (close_tx, close_rx) = mpsc::channel(1);
        *self.close_tx.lock() = Some(close_tx);
        let buffer = Arc::clone(self);
        spawn_isolated("buffer-feedback", async move {
            Buffer::feedback_loop(buffer, close_rx, nack_interval).await;
        });
    }

    /// Ingests one raw RTP datagram. Writes after close are ignored.
    pub fn write(&self, raw: &[u8], arrival: SystemTime) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Ok(());
        }

        let raw = Bytes::copy_from_slice(raw);
        let mut inner = self.inner.lock();
        if !inner.bound {
            if inner.pending_bind.len() < MAX_PENDING_BIND_PACKETS {
                inner.pending_bind.push((raw, arrival));
            }
            return Ok(());
        }

        let emits = Self::process(&mut inner, raw, arrival);
        Self::emit(&inner, emits);
        Ok(())
    }

    /// Next in-order packet; resolves once the head of line advances.
    pub async fn read_extended(&self) -> Result<ExtPacket> {
        let mut rx = self.rx.lock().await;
        rx.recv().await.ok_or(Error::ErrBufferClosed)
    }

    /// Serves a stored datagram for retransmission, by sequence number.
    pub fn read_rtp(&self, buf: &mut [u8], sn: u16) -> Result<usize> {
        let inner = self.inner.lock();
        let bucket = inner.bucket.as_ref().ok_or(Error::ErrPacketNotFound)?;
        bucket.get_packet(buf, sn)
    }

    /// Asks the publisher for a key frame, at most once per throttle window
    /// unless forced.
    pub fn send_pli(&self, force: bool) {
        {
            let mut inner = self.inner.lock();
            let throttle = inner.options.pli_throttle;
            if !force {
                if let Some(last) = inner.last_pli {
                    if last.elapsed() < throttle {
                        return;
                    }
                }
            }
            inner.last_pli = Some(Instant::now());
            if let Some(stats) = inner.stats.as_ref() {
                stats.update_pli();
            }
        }

        self.send_feedback(vec![Box::new(PictureLossIndication {
            sender_ssrc: self.receiver_ssrc,
            media_ssrc: self.ssrc,
        })]);
    }

    /// Full intra request, the harder sibling of [`Buffer::send_pli`].
    pub fn send_fir(&self) {
        {
            let inner = self.inner.lock();
            if let Some(stats) = inner.stats.as_ref() {
                stats.update_fir();
            }
        }
        self.send_feedback(vec![Box::new(FullIntraRequest {
            sender_ssrc: self.receiver_ssrc,
            media_ssrc: self.ssrc,
            fir: vec![FirEntry {
                ssrc: self.ssrc,
                sequence_number: 0,
            }],
        })]);
    }

    /// Feeds the last-SR echo used by receiver reports.
    pub fn process_sender_report(&self, sr: &SenderReport, arrival: SystemTime) {
        let inner = self.inner.lock();
        if let Some(stats) = inner.stats.as_ref() {
            stats.set_sender_report(sr.rtp_time, sr.ntp_time, arrival);
        }
    }

    pub fn get_audio_level(&self) -> Option<(f64, bool)> {
        let audio_level = {
            let inner = self.inner.lock();
            inner.audio_level.clone()
        };
        audio_level.map(|l| l.get_level())
    }

    /// Rolling bits-per-second per temporal layer.
    pub fn get_temporal_layer_bitrates(&self) -> [u64; NUM_TEMPORAL_LAYERS] {
        let mut inner = self.inner.lock();
        inner.bitrate.rates(Instant::now())
    }

    pub fn frame_integrity(&self, ext_frame_num: u64) -> bool {
        let inner = self.inner.lock();
        inner
            .frame_integrity
            .as_ref()
            .map(|fi| fi.frame_integrity(ext_frame_num))
            .unwrap_or(false)
    }

    pub fn stats(&self) -> Option<Arc<RtpStats>> {
        self.inner.lock().stats.clone()
    }

    /// Pausing clears and disables loss recovery while the upstream track
    /// is not expected to deliver.
    pub fn set_paused(&self, paused: bool) {
        let mut inner = self.inner.lock();
        inner.paused = paused;
        if paused {
            inner.nack_queue = NackQueue::new();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Idempotent; returns the packet ring slab to its pool and wakes the
    /// pending reader with an error.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        {
            let mut inner = self.inner.lock();
            inner.sender = None;
            if let Some(bucket) = inner.bucket.take() {
                match inner.kind {
                    MediaKind::Audio => self.audio_pool.release(bucket.into_slab()),
                    _ => self.video_pool.release(bucket.into_slab()),
                }
            }
        }
        self.close_tx.lock().take();

        let on_close = self.on_close.lock().take();
        if let Some(f) = on_close {
            f();
        }
    }

    fn emit(inner: &BufferInner, packets: Vec<ExtPacket>) {
        if let Some(sender) = inner.sender.as_ref() {
            for pkt in packets {
                let _ = sender.send(pkt);
            }
        }
    }

    fn send_feedback(&self, packets: Vec<Box<dyn rtcp::packet::Packet + Send + Sync>>) {
        let on_feedback = self.on_rtcp_feedback.lock().clone();
        if let Some(f) = on_feedback {
            f(packets);
        }
    }

    fn process(inner: &mut BufferInner, raw: Bytes, arrival: SystemTime) -> Vec<ExtPacket> {
        let mut buf = raw.clone();
        let packet = match rtp::packet::Packet::unmarshal(&mut buf) {
            Ok(packet) => packet,
            Err(_) => {
                inner.packets_malformed += 1;
                return vec![];
            }
        };
        if packet.header.ssrc != inner.info.ssrc {
            inner.packets_malformed += 1;
            return vec![];
        }
        if packet.header.payload_type != inner.info.codec.payload_type {
            inner.packets_unknown_pt += 1;
            return vec![];
        }

        let hdr_size = packet.header.marshal_size();
        let payload_size = packet.payload.len();
        let padding_size = raw.len().saturating_sub(hdr_size + payload_size);

        let prev_highest = inner.seq.ext_highest();
        let first = !inner.inited;
        let ext_seq = inner.seq.unwrap(packet.header.sequence_number);
        let ext_ts = inner.ts.unwrap(packet.header.timestamp);

        if first {
            inner.inited = true;
            inner.ext_highest_emitted = ext_seq - 1;
        }

        let stats = inner.stats.clone();

        // too old: beyond the reorder window, or already delivered
        if ext_seq <= inner.ext_highest_emitted {
            inner.packets_too_old += 1;
            if let Some(stats) = stats.as_ref() {
                stats.update_duplicate(hdr_size, payload_size, padding_size);
            }
            return vec![];
        }
        if inner.pending.contains_key(&ext_seq) {
            if let Some(stats) = stats.as_ref() {
                stats.update_duplicate(hdr_size, payload_size, padding_size);
            }
            return vec![];
        }

        if let Some(bucket) = inner.bucket.as_mut() {
            let _ = bucket.add_packet(&raw);
        }

        if let Some(stats) = stats.as_ref() {
            stats.update(arrival, ext_seq, ext_ts, hdr_size, payload_size, padding_size);
        }

        // loss bookkeeping against the highest received, not the emitted head
        if inner.nack_enabled && !inner.paused && !first {
            if ext_seq > prev_highest + 1 {
                let now = Instant::now();
                for missing in prev_highest + 1..ext_seq {
                    inner.nack_queue.push(missing, now);
                }
            } else if ext_seq < prev_highest {
                inner.nack_queue.remove(ext_seq);
                if let Some(stats) = stats.as_ref() {
                    stats.update_retransmit(raw.len());
                }
            }
        }

        let ext_packet = Self::decorate(inner, packet, raw, arrival, ext_seq, ext_ts);

        if payload_size > 0 && inner.kind == MediaKind::Video {
            let temporal = ext_packet.layer.temporal.max(0) as usize;
            inner.bitrate.add(temporal, ext_packet.raw.len(), Instant::now());
        }

        // in-order delivery with bounded reordering
        let mut emits = Vec::with_capacity(1);
        if ext_seq == inner.ext_highest_emitted + 1 {
            inner.ext_highest_emitted = ext_seq;
            emits.push(ext_packet);
            while let Some(pkt) = inner.pending.remove(&(inner.ext_highest_emitted + 1)) {
                inner.ext_highest_emitted += 1;
                emits.push(pkt);
            }
        } else {
            inner.pending.insert(ext_seq, ext_packet);
            Self::flush_pending(inner, arrival, &mut emits);
        }
        emits
    }

    /// Gives up on head-of-line gaps that outgrew the reorder window or went
    /// stale, emitting what is buffered in order.
    fn flush_pending(inner: &mut BufferInner, now: SystemTime, emits: &mut Vec<ExtPacket>) {
        loop {
            let Some((&front, head)) = inner.pending.iter().next() else {
                return;
            };

            let span = inner.seq.ext_highest() - inner.ext_highest_emitted;
            let stale = now
                .duration_since(head.arrival)
                .map(|age| age >= PENDING_STALE_AFTER)
                .unwrap_or(false);
            if span <= inner.options.reorder_window && !stale {
                return;
            }

            for missing in inner.ext_highest_emitted + 1..front {
                inner.nack_queue.remove(missing);
            }
            let Some(pkt) = inner.pending.remove(&front) else {
                return;
            };
            inner.ext_highest_emitted = front;
            emits.push(pkt);
            while let Some(pkt) = inner.pending.remove(&(inner.ext_highest_emitted + 1)) {
                inner.ext_highest_emitted += 1;
                emits.push(pkt);
            }
        }
    }

    fn decorate(
        inner: &mut BufferInner,
        packet: rtp::packet::Packet,
        raw: Bytes,
        arrival: SystemTime,
        ext_seq: u64,
        ext_ts: u64,
    ) -> ExtPacket {
        let mut ext_packet = ExtPacket {
            arrival,
            ext_sequence_number: ext_seq,
            ext_timestamp: ext_ts,
            layer: VideoLayer::new(INVALID_LAYER_SPATIAL, 0),
            ..Default::default()
        };

        let ids = &inner.ext_ids;
        if ids.transport_cc != 0 {
            if let Some(mut ext) = packet.header.get_extension(ids.transport_cc) {
                if let Ok(tcc) = TransportCcExtension::unmarshal(&mut ext) {
                    ext_packet.transport_cc_sequence = Some(tcc.transport_sequence);
                }
            }
        }
        if ids.abs_send_time != 0 {
            if let Some(mut ext) = packet.header.get_extension(ids.abs_send_time) {
                if let Ok(ast) = AbsSendTimeExtension::unmarshal(&mut ext) {
                    ext_packet.abs_send_time = Some(ast.timestamp);
                }
            }
        }

        if inner.kind == MediaKind::Audio && ids.audio_level != 0 {
            if let Some(mut ext) = packet.header.get_extension(ids.audio_level) {
                if let Ok(audio) = AudioLevelExtension::unmarshal(&mut ext) {
                    let duration_ms = match inner.last_audio_ts {
                        Some(last) if ext_ts > last && inner.clock_rate > 0 => {
                            ((ext_ts - last) * 1000 / inner.clock_rate as u64) as u32
                        }
                        _ => 20,
                    };
                    inner.last_audio_ts = Some(ext_ts);
                    if let Some(level) = inner.audio_level.as_ref() {
                        level.observe(audio.level, duration_ms);
                    }
                }
            }
        }

        if inner.kind == MediaKind::Video {
            if ids.dependency_descriptor != 0 {
                if let Some(ext) = packet.header.get_extension(ids.dependency_descriptor) {
                    Self::parse_dependency_descriptor(inner, &ext, ext_seq, &mut ext_packet);
                }
            }
            if ext_packet.dependency_descriptor.is_none() && inner.mime_type == "video/vp8" {
                if let Ok(vp8) = Vp8Descriptor::parse(&packet.payload) {
                    ext_packet.layer.temporal = vp8.tid as i32;
                    ext_packet.key_frame = vp8.is_key_frame;
                    ext_packet.vp8 = Some(vp8);
                }
            } else if ext_packet.dependency_descriptor.is_none()
                && inner.mime_type == "video/h264"
            {
                ext_packet.key_frame = is_h264_key_frame(&packet.payload);
            }
        }

        ext_packet.packet = packet;
        ext_packet.raw = raw;
        ext_packet
    }

    fn parse_dependency_descriptor(
        inner: &mut BufferInner,
        ext: &Bytes,
        ext_seq: u64,
        ext_packet: &mut ExtPacket,
    ) {
        let result = DependencyDescriptorReader::new(ext, inner.dd_structure.as_ref()).parse();
        let descriptor = match result {
            Ok(descriptor) => descriptor,
            Err(_) => {
                // the packet survives, descriptor-driven decisions do not
                inner.dd_parse_failures += 1;
                return;
            }
        };

        let structure_updated = descriptor.attached_structure.is_some();
        if let Some(structure) = descriptor.attached_structure.as_ref() {
            // adopt the new structure before any later packet of this frame
            inner.dd_structure = Some(structure.clone());
        }

        let ext_frame_number = inner.frame_num.unwrap(descriptor.frame_number);
        if let Some(fi) = inner.frame_integrity.as_mut() {
            fi.add_packet(ext_seq, ext_frame_number, &descriptor);
        }

        ext_packet.layer = VideoLayer::new(
            descriptor.spatial_id() as i32,
            descriptor.temporal_id() as i32,
        );
        ext_packet.key_frame = descriptor.first_packet_in_frame
            && descriptor
                .frame_dependencies
                .as_ref()
                .map(|deps| deps.is_intra())
                .unwrap_or(false);
        ext_packet.dependency_descriptor = Some(ExtDependencyDescriptor {
            descriptor,
            ext_frame_number,
            structure_updated,
            active_decode_targets_updated: false,
        });
    }

    async fn feedback_loop(
        buffer: Arc<Buffer>,
        mut close_rx: mpsc::Receiver<()>,
        nack_interval: Duration,
    ) {
        let mut nack_ticker = tokio::time::interval(nack_interval);
        let mut report_ticker = tokio::time::interval(REPORT_DELTA);
        loop {
            tokio::select! {
                _ = nack_ticker.tick() => {
                    buffer.emit_nacks();
                }
                _ = report_ticker.tick() => {
                    buffer.emit_receiver_report();
                }
                _ = close_rx.recv() => {
                    return;
                }
            }
        }
    }

    fn emit_nacks(&self) {
        let nack = {
            let mut inner = self.inner.lock();
            if !inner.nack_enabled || inner.paused {
                return;
            }
            let (due, _evicted) = inner.nack_queue.pending(Instant::now());
            if due.is_empty() {
                return;
            }
            if let Some(stats) = inner.stats.as_ref() {
                stats.update_nacks(due.len() as u32);
            }
            TransportLayerNack {
                sender_ssrc: self.receiver_ssrc,
                media_ssrc: self.ssrc,
                nacks: nack_pairs_from_sequence_numbers(&due),
            }
        };
        self.send_feedback(vec![Box::new(nack)]);
    }

    fn emit_receiver_report(&self) {
        let report = {
            let inner = self.inner.lock();
            let Some(stats) = inner.stats.as_ref() else {
                return;
            };
            let Some(report) = stats.reception_report(self.ssrc, SystemTime::now()) else {
                return;
            };
            ReceiverReport {
                ssrc: self.receiver_ssrc,
                reports: vec![report],
                ..Default::default()
            }
        };
        self.send_feedback(vec![Box::new(report)]);
    }
}

/// IDR or parameter sets mark a decodable sync point.
fn is_h264_key_frame(payload: &[u8]) -> bool {
    if payload.is_empty() {
        return false;
    }
    match payload[0] & 0x1f {
        5 | 7 | 8 => true,
        // STAP-A: check the first aggregated NAL
        24 => payload.len() > 3 && matches!(payload[3] & 0x1f, 5 | 7 | 8),
        _ => false,
    }
}

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use bytes::Bytes;
use rtcp::payload_feedbacks::full_intra_request::FullIntraRequest;
use rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;
use rtcp::payload_feedbacks::receiver_estimated_maximum_bitrate::ReceiverEstimatedMaximumBitrate;
use rtcp::receiver_report::ReceiverReport;
use rtcp::transport_feedbacks::transport_layer_cc::TransportLayerCc;
use rtcp::transport_feedbacks::transport_layer_nack::TransportLayerNack;
use util::marshal::{MarshalSize, Unmarshal};
use util::sync::Mutex;

use crate::buffer::rtp_stats::{DeltaInfo, RtpStats, RtpStatsParams, SnapshotId};
use crate::buffer::video_layer::VideoLayer;
use crate::buffer::vp8::Vp8Descriptor;
use crate::buffer::ExtPacket;
use crate::error::{Error, Result};
use crate::forwarder::{Forwarder, ForwarderState, MigrateState};
use crate::pacer::{Pacer, Packet as PacerPacket};
use crate::receiver::TrackReceiver;
use crate::sequencer::Sequencer;
use crate::stream_info::{MediaKind, ParticipantId, RtpCodecParameters, TrackId};
use crate::utils::spawn_isolated;

pub const RTP_PADDING_MAX_PAYLOAD_SIZE: usize = 255;
pub const RTP_PADDING_ESTIMATED_HEADER_SIZE: usize = 20;
pub const RTP_BLANK_FRAMES_MUTE_SECONDS: f32 = 1.0;
pub const RTP_BLANK_FRAMES_CLOSE_SECONDS: f32 = 0.2;

const BLANK_FRAME_FPS: f32 = 30.0;
const WAIT_BEFORE_SEND_PADDING_ON_MUTE: Duration = Duration::from_millis(100);
const MAX_PADDING_ON_MUTE_DURATION: Duration = Duration::from_secs(5);
const PADDING_ON_MUTE_INTERVAL: Duration = Duration::from_millis(100);

/// Seconds between 1900 (NTP epoch) and 1970 (unix epoch).
const NTP_EPOCH_OFFSET: u64 = 2_208_988_800;

pub const VP8_KEY_FRAME_8X8: &[u8] = &[
    0x10, 0x02, 0x00, 0x9d, 0x01, 0x2a, 0x08, 0x00, 0x08, 0x00, 0x00, 0x47, 0x08, 0x85, 0x85,
    0x88, 0x85, 0x84, 0x88, 0x02, 0x02, 0x00, 0x0c, 0x0d, 0x60, 0x00, 0xfe, 0xff, 0xab, 0x50,
    0x80,
];

pub const H264_KEY_FRAME_2X2_SPS: &[u8] = &[
    0x67, 0x42, 0xc0, 0x1f, 0x0f, 0xd9, 0x1f, 0x88, 0x88, 0x84, 0x00, 0x00, 0x03, 0x00, 0x04,
    0x00, 0x00, 0x03, 0x00, 0xc8, 0x3c, 0x60, 0xc9, 0x20,
];
pub const H264_KEY_FRAME_2X2_PPS: &[u8] = &[0x68, 0x87, 0xcb, 0x83, 0xcb, 0x20];
pub const H264_KEY_FRAME_2X2_IDR: &[u8] = &[
    0x65, 0x88, 0x84, 0x0a, 0xf2, 0x62, 0x80, 0x00, 0xa7, 0xbe,
];

pub const OPUS_SILENCE_FRAME: &[u8] = &[
    0xf8, 0xff, 0xfe, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00,
];

/// TrackLocalWriter is the opaque per-subscriber sink packets are written
/// to after SRTP protection further down the stack.
#[async_trait]
pub trait TrackLocalWriter: fmt::Debug + Send + Sync {
    /// write_rtp writes a RTP packet to the connection
    async fn write_rtp(&self, p: &rtp::packet::Packet) -> Result<usize>;
}

/// One NACKed packet, surfaced to the stream allocator.
#[derive(Debug, Clone, Copy)]
pub struct NackInfo {
    pub sequence_number: u16,
    pub timestamp: u32,
    pub attempts: u8,
}

/// DownTrackStreamAllocatorListener receives the congestion and
/// subscription signals the stream allocator drives layer decisions with.
pub trait DownTrackStreamAllocatorListener: Send + Sync {
    fn on_remb(&self, dt: &DownTrack, remb: &ReceiverEstimatedMaximumBitrate);
    fn on_transport_cc_feedback(&self, dt: &DownTrack, cc: &TransportLayerCc);

    fn on_available_layers_changed(&self, dt: &DownTrack);
    fn on_bitrate_availability_changed(&self, dt: &DownTrack);
    fn on_max_published_spatial_changed(&self, dt: &DownTrack);
    fn on_max_published_temporal_changed(&self, dt: &DownTrack);
    fn on_subscription_changed(&self, dt: &DownTrack);
    fn on_subscribed_layer_changed(&self, dt: &DownTrack, layers: VideoLayer);
    fn on_resume(&self, dt: &DownTrack);

    fn on_packet_sent(&self, dt: &DownTrack, size: usize);
    fn on_nack(&self, dt: &DownTrack, nack_infos: Vec<NackInfo>);
    fn on_rtcp_receiver_report(&self, dt: &DownTrack, rr: &ReceiverReport);
}

pub type ReceiverReportListenerFn = Box<dyn Fn(&DownTrack, &ReceiverReport) + Send + Sync>;
pub type OnCloseFn = Box<dyn Fn(bool) + Send + Sync>;
pub type OnBindingFn = Box<dyn Fn() + Send + Sync>;
pub type OnRttUpdateFn = Box<dyn Fn(&DownTrack, u32) + Send + Sync>;
pub type OnMaxSubscribedLayerChangedFn = Box<dyn Fn(&DownTrack, i32) + Send + Sync>;
pub type OnStatsUpdateFn = Box<dyn Fn(&DownTrack, &DeltaInfo) + Send + Sync>;

/// DownTrackState is the serializable state carried across a migration.
#[derive(Default, Debug, Clone, Copy)]
pub struct DownTrackState {
    pub forwarder: ForwarderState,
}

pub struct DownTrackParams {
    pub codec: RtpCodecParameters,
    pub receiver: Weak<dyn TrackReceiver>,
    pub subscriber_id: ParticipantId,
    pub stream_id: String,
    /// Sequencer depth for NACK answers.
    pub max_track: usize,
    pub pacer: Arc<dyn Pacer>,
}

struct BindState {
    ssrc: u32,
    payload_type: u8,
    abs_send_time_ext_id: u8,
    transport_wide_ext_id: u8,
    write_stream: Option<Arc<dyn TrackLocalWriter>>,
}

/// DownTrack is the per-(publisher-track × subscriber) egress leg: it holds
/// the forwarder, the sequencer for NACK answers, send-side stats and the
/// RTCP listener chain, and feeds the subscriber's pacer.
///
/// Lifecycle: new, bound, any number of pause/resume cycles, closed. A
/// closed DownTrack rejects further writes and is not reusable.
pub struct DownTrack {
    id: TrackId,
    subscriber_id: ParticipantId,
    stream_id: String,
    kind: MediaKind,
    codec: RtpCodecParameters,

    weak_self: Weak<DownTrack>,
    receiver: Weak<dyn TrackReceiver>,
    pacer: Arc<dyn Pacer>,
    sequencer: Sequencer,
    forwarder: Mutex<Forwarder>,

    bind_state: Mutex<BindState>,
    bound: AtomicBool,
    connected: AtomicBool,
    closed: AtomicBool,

    rtp_stats: Arc<RtpStats>,
    delta_stats_snapshot_id: SnapshotId,
    delta_stats_overridden_snapshot_id: SnapshotId,
    total_repeated_nacks: AtomicU32,
    rtt: AtomicU32,

    key_frame_request_generation: AtomicU32,
    blank_frames_generation: AtomicU32,
    padding_on_mute_generation: AtomicU32,

    receiver_report_listeners: Mutex<Vec<Arc<ReceiverReportListenerFn>>>,
    allocator_listener: Mutex<Option<Arc<dyn DownTrackStreamAllocatorListener>>>,

    on_close: Mutex<Option<OnCloseFn>>,
    on_binding: Mutex<Option<OnBindingFn>>,
    on_rtt_update: Mutex<Option<Arc<OnRttUpdateFn>>>,
    on_max_subscribed_layer_changed: Mutex<Option<Arc<OnMaxSubscribedLayerChangedFn>>>,
    on_stats_update: Mutex<Option<Arc<OnStatsUpdateFn>>>,
}

impl DownTrack {
    pub fn new(params: DownTrackParams) -> Result<Arc<Self>> {
        let kind = params.codec.kind();
        if kind == MediaKind::Unspecified {
            return Err(Error::ErrUnknownKind);
        }

        let receiver = params.receiver.clone();
        let id = receiver
            .upgrade()
            .map(|r| r.track_id())
            .unwrap_or_default();

        let rtp_stats = Arc::new(RtpStats::new(RtpStatsParams {
            clock_rate: params.codec.clock_rate,
        }));
        let delta_stats_snapshot_id = rtp_stats.new_snapshot_id();
        let delta_stats_overridden_snapshot_id = rtp_stats.new_snapshot_id();

        Ok(Arc::new_cyclic(|weak_self| DownTrack {
            id,
            subscriber_id: params.subscriber_id,
            stream_id: params.stream_id,
            kind,
            forwarder: Mutex::new(Forwarder::new(
                kind,
                params.codec.clock_rate,
                &params.codec.mime_type,
            )),
            codec: params.codec,
            weak_self: weak_self.clone(),
            receiver,
            pacer: params.pacer,
            sequencer: Sequencer::new(params.max_track),
            bind_state: Mutex::new(BindState {
                ssrc: 0,
                payload_type: 0,
                abs_send_time_ext_id: 0,
                transport_wide_ext_id: 0,
                write_stream: None,
            }),
            bound: AtomicBool::new(false),
            connected: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            rtp_stats,
            delta_stats_snapshot_id,
            delta_stats_overridden_snapshot_id,
            total_repeated_nacks: AtomicU32::new(0),
            rtt: AtomicU32::new(0),
            key_frame_request_generation: AtomicU32::new(0),
            blank_frames_generation: AtomicU32::new(0),
            padding_on_mute_generation: AtomicU32::new(0),
            receiver_report_listeners: Mutex::new(Vec::new()),
            allocator_listener: Mutex::new(None),
            on_close: Mutex::new(None),
            on_binding: Mutex::new(None),
            on_rtt_update: Mutex::new(None),
            on_max_subscribed_layer_changed: Mutex::new(None),
            on_stats_update: Mutex::new(None),
        }))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn subscriber_id(&self) -> &str {
        &self.subscriber_id
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    pub fn codec(&self) -> &RtpCodecParameters {
        &self.codec
    }

    pub fn ssrc(&self) -> u32 {
        self.bind_state.lock().ssrc
    }

    pub fn rtp_stats(&self) -> Arc<RtpStats> {
        Arc::clone(&self.rtp_stats)
    }

    pub fn rtt(&self) -> u32 {
        self.rtt.load(Ordering::Acquire)
    }

    /// Binds the subscriber-facing identity once the remote transceiver
    /// accepted the codec. A second bind is an error.
    pub fn bind(
        &self,
        ssrc: u32,
        payload_type: u8,
        abs_send_time_ext_id: u8,
        transport_wide_ext_id: u8,
        write_stream: Arc<dyn TrackLocalWriter>,
    ) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::ErrDownTrackClosed);
        }
        if self.bound.swap(true, Ordering::AcqRel) {
            return Err(Error::ErrDownTrackAlreadyBound);
        }

        {
            let mut bind_state = self.bind_state.lock();
            bind_state.ssrc = ssrc;
            bind_state.payload_type = payload_type;
            bind_state.abs_send_time_ext_id = abs_send_time_ext_id;
            bind_state.transport_wide_ext_id = transport_wide_ext_id;
            bind_state.write_stream = Some(write_stream);
        }

        let on_binding = self.on_binding.lock().take();
        if let Some(f) = on_binding {
            f();
        }
        Ok(())
    }

    pub fn is_bound(&self) -> bool {
        self.bound.load(Ordering::Acquire)
    }

    pub fn set_connected(&self, connected: bool) {
        let was = self.connected.swap(connected, Ordering::AcqRel);
        if connected && !was {
            if let Some(listener) = self.allocator_listener.lock().clone() {
                listener.on_resume(self);
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn on_close(&self, f: OnCloseFn) {
        *self.on_close.lock() = Some(f);
    }

    pub fn on_binding(&self, f: OnBindingFn) {
        *self.on_binding.lock() = Some(f);
    }

    pub fn on_rtt_update(&self, f: OnRttUpdateFn) {
        *self.on_rtt_update.lock() = Some(Arc::new(f));
    }

    pub fn on_max_subscribed_layer_changed(&self, f: OnMaxSubscribedLayerChangedFn) {
        *self.on_max_subscribed_layer_changed.lock() = Some(Arc::new(f));
    }

    pub fn on_stats_update(&self, f: OnStatsUpdateFn) {
        *self.on_stats_update.lock() = Some(Arc::new(f));
    }

    pub fn add_receiver_report_listener(&self, f: ReceiverReportListenerFn) {
        self.receiver_report_listeners.lock().push(Arc::new(f));
    }

    pub fn set_stream_allocator_listener(
        &self,
        listener: Arc<dyn DownTrackStreamAllocatorListener>,
    ) {
        *self.allocator_listener.lock() = Some(listener);
    }

    fn allocator_listener(&self) -> Option<Arc<dyn DownTrackStreamAllocatorListener>> {
        self.allocator_listener.lock().clone()
    }

    /// Forwards one packet of source layer `spatial` through the forwarder
    /// and onto the pacer.
    pub fn write_rtp(&self, ext_packet: &ExtPacket, spatial: i32) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::ErrDownTrackClosed);
        }
        if !self.bound.load(Ordering::Acquire) || !self.connected.load(Ordering::Acquire) {
            return Ok(());
        }

        let tp = {
            let mut forwarder = self.forwarder.lock();
            match forwarder.get_translation_params(ext_packet, spatial) {
                Ok(tp) => tp,
                // transient, counted in the forwarder path
                Err(Error::ErrPaddingOnlyPacket) | Err(Error::ErrDuplicatePacket) => return Ok(()),
                Err(err) => return Err(err),
            }
        };
        if tp.should_drop {
            return Ok(());
        }
        let snts = match tp.rtp {
            Some(snts) => snts,
            None => return Ok(()),
        };

        let (ssrc, payload_type, abs_id, twcc_id, write_stream) = {
            let bind_state = self.bind_state.lock();
            match bind_state.write_stream.as_ref() {
                Some(ws) => (
                    bind_state.ssrc,
                    bind_state.payload_type,
                    bind_state.abs_send_time_ext_id,
                    bind_state.transport_wide_ext_id,
                    Arc::clone(ws),
                ),
                None => return Ok(()),
            }
        };

        let payload = match (tp.vp8, ext_packet.vp8.as_ref()) {
            (Some((picture_id, tl0)), Some(vp8)) => {
                vp8.rewrite(&ext_packet.packet.payload, picture_id, tl0)
            }
            _ => ext_packet.packet.payload.clone(),
        };

        self.sequencer.push(
            ext_packet.packet.header.sequence_number,
            snts.sequence_number,
            snts.timestamp,
            spatial,
            tp.vp8,
        );

        let header = rtp::header::Header {
            version: 2,
            payload_type,
            sequence_number: snts.sequence_number,
            timestamp: snts.timestamp,
            ssrc,
            marker: tp.marker,
            ..Default::default()
        };

        let stats = Arc::clone(&self.rtp_stats);
        let listener = self.allocator_listener();
        let weak_self = self.weak_self.clone();
        let ext_seq = snts.ext_sequence_number;
        let ext_ts = snts.ext_timestamp;
        self.pacer.enqueue(PacerPacket {
            header,
            extensions: vec![],
            payload,
            abs_send_time_ext_id: abs_id,
            transport_wide_ext_id: twcc_id,
            write_stream,
            is_retransmission: false,
            is_padding: false,
            on_sent: Some(Box::new(move |header, payload_size, sent_at, err| {
                if err.is_some() {
                    return;
                }
                stats.update(
                    sent_at,
                    ext_seq,
                    ext_ts,
                    header.marshal_size(),
                    payload_size,
                    0,
                );
                if let (Some(listener), Some(dt)) = (listener, weak_self.upgrade()) {
                    listener.on_packet_sent(&dt, header.marshal_size() + payload_size);
                }
            })),
        });
        Ok(())
    }

    /// RTCP arriving from this subscriber.
    pub fn handle_rtcp(&self, packets: &[Box<dyn rtcp::packet::Packet + Send + Sync>]) {
        for packet in packets {
            let any = packet.as_any();
            if any.downcast_ref::<PictureLossIndication>().is_some() {
                self.rtp_stats.update_pli();
                self.request_key_frame(false);
            } else if any.downcast_ref::<FullIntraRequest>().is_some() {
                self.rtp_stats.update_fir();
                self.request_key_frame(false);
            } else if let Some(rr) = any.downcast_ref::<ReceiverReport>() {
                self.handle_receiver_report(rr);
            } else if let Some(nack) = any.downcast_ref::<TransportLayerNack>() {
                self.handle_nack(nack);
            } else if let Some(remb) = any.downcast_ref::<ReceiverEstimatedMaximumBitrate>() {
                if let Some(listener) = self.allocator_listener() {
                    listener.on_remb(self, remb);
                }
            } else if let Some(cc) = any.downcast_ref::<TransportLayerCc>() {
                if let Some(listener) = self.allocator_listener() {
                    listener.on_transport_cc_feedback(self, cc);
                }
            }
        }
    }

    fn handle_receiver_report(&self, rr: &ReceiverReport) {
        let ssrc = self.ssrc();
        for report in &rr.reports {
            if report.ssrc != ssrc {
                continue;
            }
            if report.last_sender_report != 0 {
                let now_middle = ntp_middle_32(SystemTime::now());
                let rtt_units = now_middle
                    .wrapping_sub(report.delay)
                    .wrapping_sub(report.last_sender_report);
                if rtt_units < 1 << 30 {
                    let rtt_ms = (rtt_units as u64 * 1000 >> 16) as u32;
                    self.rtt.store(rtt_ms, Ordering::Release);
                    self.rtp_stats.update_rtt(rtt_ms);
                    let on_rtt_update = self.on_rtt_update.lock().clone();
                    if let Some(f) = on_rtt_update {
                        f(self, rtt_ms);
                    }
                }
            }
        }

        let listeners: Vec<Arc<ReceiverReportListenerFn>> = {
            let listeners = self.receiver_report_listeners.lock();
            listeners.iter().cloned().collect()
        };
        for listener in listeners {
            listener(self, rr);
        }

        if let Some(listener) = self.allocator_listener() {
            listener.on_rtcp_receiver_report(self, rr);
        }
    }

    fn handle_nack(&self, nack: &TransportLayerNack) {
        let mut seqs = Vec::new();
        for pair in &nack.nacks {
            seqs.extend(pair.packet_list());
        }
        if seqs.is_empty() {
            return;
        }
        self.rtp_stats.update_nacks(seqs.len() as u32);

        let metas = self.sequencer.get_packets_meta(&seqs);
        let nack_infos: Vec<NackInfo> = metas
            .iter()
            .map(|meta| NackInfo {
                sequence_number: meta.target_seq,
                timestamp: meta.timestamp,
                attempts: meta.nacked,
            })
            .collect();
        let repeated = metas.iter().filter(|m| m.nacked > 1).count() as u32;
        self.total_repeated_nacks
            .fetch_add(repeated, Ordering::AcqRel);

        if !nack_infos.is_empty() {
            if let Some(listener) = self.allocator_listener() {
                listener.on_nack(self, nack_infos);
            }
        }

        for meta in metas {
            if let Err(err) = self.retransmit(&meta) {
                log::debug!("retransmission failed for {}: {err}", meta.source_seq);
            }
        }
    }

    fn retransmit(&self, meta: &crate::sequencer::PacketMeta) -> Result<()> {
        let receiver = self.receiver.upgrade().ok_or(Error::ErrReceiverClosed)?;
        let mut buf = vec![0u8; crate::buffer::bucket::MAX_PKT_SIZE];
        let n = receiver.read_rtp(&mut buf, meta.layer.max(0) as u8, meta.source_seq)?;

        let mut raw = &buf[..n];
        let mut packet = rtp::packet::Packet::unmarshal(&mut raw)?;

        let (ssrc, payload_type, abs_id, twcc_id, write_stream) = {
            let bind_state = self.bind_state.lock();
            match bind_state.write_stream.as_ref() {
                Some(ws) => (
                    bind_state.ssrc,
                    bind_state.payload_type,
                    bind_state.abs_send_time_ext_id,
                    bind_state.transport_wide_ext_id,
                    Arc::clone(ws),
                ),
                None => return Err(Error::ErrDownTrackClosed),
            }
        };

        packet.header.ssrc = ssrc;
        packet.header.payload_type = payload_type;
        packet.header.sequence_number = meta.target_seq;
        packet.header.timestamp = meta.timestamp;
        packet.header.extension = false;
        packet.header.extensions.clear();
        packet.header.extensions_padding = 0;

        let payload = match (meta.vp8_picture_id, meta.vp8_tl0_pic_idx) {
            (Some(picture_id), Some(tl0)) => match Vp8Descriptor::parse(&packet.payload) {
                Ok(desc) => desc.rewrite(&packet.payload, picture_id, tl0),
                Err(_) => packet.payload.clone(),
            },
            _ => packet.payload.clone(),
        };

        let stats = Arc::clone(&self.rtp_stats);
        self.pacer.enqueue(PacerPacket {
            header: packet.header,
            extensions: vec![],
            payload,
            abs_send_time_ext_id: abs_id,
            transport_wide_ext_id: twcc_id,
            write_stream,
            is_retransmission: true,
            is_padding: false,
            on_sent: Some(Box::new(move |header, payload_size, _sent_at, err| {
                if err.is_none() {
                    stats.update_retransmit(header.marshal_size() + payload_size);
                }
            })),
        });
        Ok(())
    }

    /// Asks the publisher for a key frame; the generation counter collapses
    /// bursts of equivalent requests.
    pub fn request_key_frame(&self, force: bool) {
        self.key_frame_request_generation
            .fetch_add(1, Ordering::AcqRel);
        let layer = self.forwarder.lock().current_layer().spatial;
        if let Some(receiver) = self.receiver.upgrade() {
            receiver.send_pli(layer.max(0), force);
        }
    }

    /// Mutes or unmutes this subscription. Muting a video track keeps the
    /// bandwidth estimate alive with padding for a bounded period.
    pub fn set_mute(&self, muted: bool) {
        let changed = self.forwarder.lock().mute(muted);
        if !changed {
            return;
        }

        if let Some(listener) = self.allocator_listener() {
            listener.on_subscription_changed(self);
        }

        let generation = self
            .padding_on_mute_generation
            .fetch_add(1, Ordering::AcqRel)
            + 1;
        if muted && self.kind == MediaKind::Video {
            if let Some(dt) = self.weak_self.upgrade() {
                spawn_isolated("downtrack-padding-on-mute", async move {
                    dt.padding_on_mute(generation).await;
                });
            }
        }
    }

    pub fn is_muted(&self) -> bool {
        self.forwarder.lock().is_muted()
    }

    async fn padding_on_mute(self: Arc<Self>, generation: u32) {
        tokio::time::sleep(WAIT_BEFORE_SEND_PADDING_ON_MUTE).await;
        let started = tokio::time::Instant::now();
        while started.elapsed() < MAX_PADDING_ON_MUTE_DURATION {
            if self.closed.load(Ordering::Acquire)
                || self.padding_on_mute_generation.load(Ordering::Acquire) != generation
            {
                return;
            }
            self.write_padding_packets(1);
            tokio::time::sleep(PADDING_ON_MUTE_INTERVAL).await;
        }
    }

    /// Emits `num` padding-only packets at the current stream position.
    pub fn write_padding_packets(&self, num: usize) -> usize {
        let snts = {
            let mut forwarder = self.forwarder.lock();
            match forwarder.get_padding_snts(num) {
                Ok(snts) => snts,
                Err(_) => return 0,
            }
        };
        if snts.is_empty() {
            return 0;
        }

        let (ssrc, payload_type, abs_id, twcc_id, write_stream) = {
            let bind_state = self.bind_state.lock();
            match bind_state.write_stream.as_ref() {
                Some(ws) => (
                    bind_state.ssrc,
                    bind_state.payload_type,
                    bind_state.abs_send_time_ext_id,
                    bind_state.transport_wide_ext_id,
                    Arc::clone(ws),
                ),
                None => return 0,
            }
        };

        let mut sent = 0;
        for snts in snts {
            self.sequencer.push_padding(snts.sequence_number);

            // padding-only: the padding run is generated at marshal time
            // from the padding bit, the payload stays empty
            let header = rtp::header::Header {
                version: 2,
                padding: true,
                payload_type,
                sequence_number: snts.sequence_number,
                timestamp: snts.timestamp,
                ssrc,
                ..Default::default()
            };
            self.pacer.enqueue(PacerPacket {
                header,
                extensions: vec![],
                payload: Bytes::new(),
                abs_send_time_ext_id: abs_id,
                transport_wide_ext_id: twcc_id,
                write_stream: Arc::clone(&write_stream),
                is_retransmission: false,
                is_padding: true,
                on_sent: None,
            });
            sent += 1;
        }
        sent
    }

    /// Flushes the subscriber's decoder with codec blank key frames, used
    /// on close and on mute.
    fn write_blank_frames(&self, seconds: f32) {
        let num = (seconds * BLANK_FRAME_FPS) as usize;
        if num == 0 {
            return;
        }
        self.blank_frames_generation.fetch_add(1, Ordering::AcqRel);

        let snts = self.forwarder.lock().get_blank_frame_snts(num);
        if snts.is_empty() {
            return;
        }

        let (ssrc, payload_type, abs_id, twcc_id, write_stream) = {
            let bind_state = self.bind_state.lock();
            match bind_state.write_stream.as_ref() {
                Some(ws) => (
                    bind_state.ssrc,
                    bind_state.payload_type,
                    bind_state.abs_send_time_ext_id,
                    bind_state.transport_wide_ext_id,
                    Arc::clone(ws),
                ),
                None => return,
            }
        };

        let payload = blank_frame_payload(&self.codec.mime_type);
        if payload.is_empty() {
            return;
        }

        for snts in snts {
            self.sequencer.push_padding(snts.sequence_number);
            let header = rtp::header::Header {
                version: 2,
                payload_type,
                sequence_number: snts.sequence_number,
                timestamp: snts.timestamp,
                ssrc,
                marker: true,
                ..Default::default()
            };
            self.pacer.enqueue(PacerPacket {
                header,
                extensions: vec![],
                payload: payload.clone(),
                abs_send_time_ext_id: abs_id,
                transport_wide_ext_id: twcc_id,
                write_stream: Arc::clone(&write_stream),
                is_retransmission: false,
                is_padding: false,
                on_sent: None,
            });
        }
    }

    /// Closes this DownTrack; `will_be_resumed` carries through to the close
    /// callback so a migration does not tear down subscriber state.
    pub fn close(&self, will_be_resumed: bool) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        if !will_be_resumed && self.bound.load(Ordering::Acquire) {
            self.write_blank_frames(RTP_BLANK_FRAMES_CLOSE_SECONDS);
        }

        self.bind_state.lock().write_stream = None;

        let on_close = self.on_close.lock().take();
        if let Some(f) = on_close {
            f(will_be_resumed);
        }
    }

    pub fn set_max_subscribed_layer(&self, layer: VideoLayer) {
        self.forwarder.lock().set_max_subscribed_layer(layer);
        let on_changed = self.on_max_subscribed_layer_changed.lock().clone();
        if let Some(f) = on_changed {
            f(self, layer.spatial);
        }
        if let Some(listener) = self.allocator_listener() {
            listener.on_subscribed_layer_changed(self, layer);
        }
    }

    /// Commands the layer the forwarder should converge on.
    pub fn set_target_layer(&self, layer: VideoLayer) {
        self.forwarder.lock().set_target_layer(layer);
    }

    pub fn current_layer(&self) -> VideoLayer {
        self.forwarder.lock().current_layer()
    }

    pub fn target_layer(&self) -> VideoLayer {
        self.forwarder.lock().target_layer()
    }

    pub fn set_migrate_state(&self, state: MigrateState) {
        self.forwarder.lock().set_migrate_state(state);
    }

    pub fn get_state(&self) -> DownTrackState {
        DownTrackState {
            forwarder: self.forwarder.lock().get_state(),
        }
    }

    pub fn set_state(&self, state: DownTrackState) {
        self.forwarder.lock().seed_state(state.forwarder);
    }

    /// Delta since the connection-quality consumer last read.
    pub fn delta_stats(&self, now: SystemTime) -> Option<DeltaInfo> {
        self.rtp_stats.delta_info(self.delta_stats_snapshot_id, now)
    }

    /// Delta since the analytics consumer last read; independent baseline.
    pub fn delta_stats_overridden(&self, now: SystemTime) -> Option<DeltaInfo> {
        self.rtp_stats
            .delta_info(self.delta_stats_overridden_snapshot_id, now)
    }

    /// Publishes the analytics delta to the registered consumer.
    pub fn report_stats(&self, now: SystemTime) {
        let on_stats_update = self.on_stats_update.lock().clone();
        if let Some(f) = on_stats_update {
            if let Some(delta) = self.delta_stats_overridden(now) {
                f(self, &delta);
            }
        }
    }

    pub fn total_repeated_nacks(&self) -> u32 {
        self.total_repeated_nacks.load(Ordering::Acquire)
    }

    // upstream track signals, called by the owning receiver

    pub fn up_track_layer_change(&self) {
        if let Some(listener) = self.allocator_listener() {
            listener.on_available_layers_changed(self);
        }
    }

    pub fn up_track_max_published_layer_change(&self, max_published: i32) {
        {
            let mut forwarder = self.forwarder.lock();
            let mut layer = forwarder.max_published_layer();
            layer.spatial = max_published;
            forwarder.set_max_published_layer(layer);
        }
        if let Some(listener) = self.allocator_listener() {
            listener.on_max_published_spatial_changed(self);
        }
    }

    pub fn up_track_max_temporal_layer_seen_change(&self, max_temporal: i32) {
        {
            let mut forwarder = self.forwarder.lock();
            let mut layer = forwarder.max_published_layer();
            layer.temporal = max_temporal;
            forwarder.set_max_published_layer(layer);
        }
        if let Some(listener) = self.allocator_listener() {
            listener.on_max_published_temporal_changed(self);
        }
    }

    pub fn up_track_bitrate_report(&self) {
        if let Some(listener) = self.allocator_listener() {
            listener.on_bitrate_availability_changed(self);
        }
    }
}

impl fmt::Debug for DownTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DownTrack")
            .field("id", &self.id)
            .field("subscriber_id", &self.subscriber_id)
            .field("kind", &self.kind)
            .field("bound", &self.bound.load(Ordering::Relaxed))
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

fn blank_frame_payload(mime_type: &str) -> Bytes {
    let lower = mime_type.to_ascii_lowercase();
    match lower.as_str() {
        "video/vp8" => {
            // minimal payload descriptor, then the 8x8 key frame
            let mut payload = Vec::with_capacity(1 + VP8_KEY_FRAME_8X8.len());
            payload.push(0x10);
            payload.extend_from_slice(VP8_KEY_FRAME_8X8);
            Bytes::from(payload)
        }
        "video/h264" => {
            // STAP-A aggregating SPS, PPS and a 2x2 IDR
            let nals = [
                H264_KEY_FRAME_2X2_SPS,
                H264_KEY_FRAME_2X2_PPS,
                H264_KEY_FRAME_2X2_IDR,
            ];
            let mut payload = Vec::new();
            payload.push(0x78);
            for nal in nals {
                payload.extend_from_slice(&(nal.len() as u16).to_be_bytes());
                payload.extend_from_slice(nal);
            }
            Bytes::from(payload)
        }
        "audio/opus" => Bytes::from_static(OPUS_SILENCE_FRAME),
        _ => Bytes::new(),
    }
}

/// Middle 32 bits of the NTP timestamp for `t`, the units receiver reports
/// echo in LSR/DLSR.
fn ntp_middle_32(t: SystemTime) -> u32 {
    let since_unix = t.duration_since(UNIX_EPOCH).unwrap_or(Duration::ZERO);
    let seconds = since_unix.as_secs() + NTP_EPOCH_OFFSET;
    let fraction = ((since_unix.subsec_nanos() as u64) << 32) / 1_000_000_000;
    (((seconds << 16) & 0xFFFF_0000) as u32) | ((fraction >> 16) as u32)
}

#[cfg(test)]
mod test {
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex as StdMutex;

    use super::*;
    use crate::buffer::ExtPacket;
    use crate::pacer::PassThrough;
    use crate::receiver::{Bitrates, TrackReceiver};
    use crate::stream_info::TrackInfo;

    #[derive(Debug, Default)]
    struct MockWriteStream {
        sent: StdMutex<Vec<rtp::packet::Packet>>,
    }

    #[async_trait]
    impl TrackLocalWriter for MockWriteStream {
        async fn write_rtp(&self, p: &rtp::packet::Packet) -> Result<usize> {
            self.sent.lock().unwrap().push(p.clone());
            Ok(p.payload.len())
        }
    }

    #[derive(Default)]
    struct MockReceiver {
        plis: AtomicUsize,
    }

    impl TrackReceiver for MockReceiver {
        fn track_id(&self) -> TrackId {
            "TR_mock".to_owned()
        }

        fn stream_id(&self) -> String {
            "stream".to_owned()
        }

        fn codec(&self) -> RtpCodecParameters {
            vp8_codec()
        }

        fn kind(&self) -> MediaKind {
            MediaKind::Video
        }

        fn is_closed(&self) -> bool {
            false
        }

        fn read_rtp(&self, _buf: &mut [u8], _layer: u8, _sn: u16) -> Result<usize> {
            Err(Error::ErrPacketNotFound)
        }

        fn get_layered_bitrate(&self) -> (Vec<i32>, Bitrates) {
            (vec![], Default::default())
        }

        fn get_audio_level(&self) -> Option<(f64, bool)> {
            None
        }

        fn send_pli(&self, _layer: i32, _force: bool) {
            self.plis.fetch_add(1, Ordering::SeqCst);
        }

        fn track_info(&self) -> TrackInfo {
            TrackInfo::default()
        }
    }

    fn vp8_codec() -> RtpCodecParameters {
        RtpCodecParameters {
            mime_type: "video/VP8".to_owned(),
            payload_type: 96,
            clock_rate: 90000,
            ..Default::default()
        }
    }

    fn new_down_track(receiver: &Arc<MockReceiver>) -> Arc<DownTrack> {
        let as_receiver: Arc<dyn TrackReceiver> = Arc::clone(receiver) as _;
        DownTrack::new(DownTrackParams {
            codec: vp8_codec(),
            receiver: Arc::downgrade(&as_receiver),
            subscriber_id: "subscriber-1".to_owned(),
            stream_id: "stream".to_owned(),
            max_track: 256,
            pacer: Arc::new(PassThrough::new()),
        })
        .unwrap()
    }

    fn ext_packet(seq: u64, ts: u64, key_frame: bool) -> ExtPacket {
        ExtPacket {
            arrival: SystemTime::now(),
            packet: rtp::packet::Packet {
                header: rtp::header::Header {
                    version: 2,
                    payload_type: 96,
                    sequence_number: seq as u16,
                    timestamp: ts as u32,
                    marker: true,
                    ssrc: 0x1111,
                    ..Default::default()
                },
                payload: Bytes::from_static(&[0x10, 0x00, 0xaa]),
            },
            ext_sequence_number: (1 << 16) + seq,
            ext_timestamp: (1u64 << 32) + ts,
            key_frame,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_double_bind_rejected() {
        let receiver = Arc::new(MockReceiver::default());
        let dt = new_down_track(&receiver);
        let writer = Arc::new(MockWriteStream::default());

        dt.bind(1, 96, 0, 0, Arc::clone(&writer) as Arc<dyn TrackLocalWriter>)
            .unwrap();
        assert_eq!(
            dt.bind(1, 96, 0, 0, writer as Arc<dyn TrackLocalWriter>)
                .unwrap_err(),
            Error::ErrDownTrackAlreadyBound
        );
    }

    #[tokio::test]
    async fn test_unbound_writes_are_ignored() {
        let receiver = Arc::new(MockReceiver::default());
        let dt = new_down_track(&receiver);
        dt.set_target_layer(VideoLayer::new(0, 3));

        // neither bound nor connected, nothing flows and nothing errors
        dt.write_rtp(&ext_packet(1, 0, true), 0).unwrap();
        assert_eq!(dt.rtp_stats().packets(), 0);
    }

    #[tokio::test]
    async fn test_write_after_close_is_error() {
        let receiver = Arc::new(MockReceiver::default());
        let dt = new_down_track(&receiver);
        dt.close(false);
        assert_eq!(
            dt.write_rtp(&ext_packet(1, 0, true), 0).unwrap_err(),
            Error::ErrDownTrackClosed
        );
    }

    #[tokio::test]
    async fn test_close_fires_once() {
        let receiver = Arc::new(MockReceiver::default());
        let dt = new_down_track(&receiver);

        let calls = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&calls);
        dt.on_close(Box::new(move |will_be_resumed| {
            sink.lock().unwrap().push(will_be_resumed);
        }));

        dt.close(true);
        dt.close(false);
        assert_eq!(*calls.lock().unwrap(), vec![true]);
    }

    #[tokio::test]
    async fn test_key_frame_request_reaches_receiver() {
        let receiver = Arc::new(MockReceiver::default());
        let dt = new_down_track(&receiver);
        dt.request_key_frame(false);
        dt.request_key_frame(true);
        assert_eq!(receiver.plis.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_blank_frames_flushed_on_close() {
        let receiver = Arc::new(MockReceiver::default());
        let dt = new_down_track(&receiver);
        let writer = Arc::new(MockWriteStream::default());
        dt.bind(
            0x2222,
            96,
            0,
            0,
            Arc::clone(&writer) as Arc<dyn TrackLocalWriter>,
        )
        .unwrap();
        dt.set_connected(true);
        dt.set_target_layer(VideoLayer::new(0, 3));

        for i in 0u64..5 {
            dt.write_rtp(&ext_packet(100 + i, 3000 * i, i == 0), 0).unwrap();
        }
        dt.close(false);

        // blank key frames continue the sequence space after the media
        for _ in 0..100 {
            if writer.sent.lock().unwrap().len() >= 5 + 6 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let sent = writer.sent.lock().unwrap().clone();
        assert!(sent.len() >= 5 + 6, "got {}", sent.len());
        for pair in sent.windows(2) {
            assert_eq!(
                pair[1].header.sequence_number,
                pair[0].header.sequence_number.wrapping_add(1)
            );
        }
        let last = &sent[sent.len() - 1];
        assert!(last.header.marker);
        assert_eq!(last.payload[0], 0x10);
    }

    #[tokio::test]
    async fn test_delta_stats_snapshots_are_independent() {
        let receiver = Arc::new(MockReceiver::default());
        let dt = new_down_track(&receiver);
        let writer = Arc::new(MockWriteStream::default());
        dt.bind(
            0x3333,
            96,
            0,
            0,
            Arc::clone(&writer) as Arc<dyn TrackLocalWriter>,
        )
        .unwrap();
        dt.set_connected(true);
        dt.set_target_layer(VideoLayer::new(0, 3));

        for i in 0u64..10 {
            dt.write_rtp(&ext_packet(i, 3000 * i, i == 0), 0).unwrap();
        }
        for _ in 0..100 {
            if dt.rtp_stats().packets() >= 10 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let now = SystemTime::now();
        let quality = dt.delta_stats(now).unwrap();
        assert_eq!(quality.packets, 10);
        let analytics = dt.delta_stats_overridden(now).unwrap();
        assert_eq!(analytics.packets, 10);

        // next read of the same id sees nothing new
        let quality = dt.delta_stats(now).unwrap();
        assert_eq!(quality.packets, 0);
    }

    #[tokio::test]
    async fn test_migration_state_restore() {
        let receiver = Arc::new(MockReceiver::default());
        let dt = new_down_track(&receiver);
        let writer = Arc::new(MockWriteStream::default());
        dt.bind(
            0x4444,
            96,
            0,
            0,
            Arc::clone(&writer) as Arc<dyn TrackLocalWriter>,
        )
        .unwrap();
        dt.set_connected(true);
        dt.set_target_layer(VideoLayer::new(0, 3));

        for i in 0u64..5 {
            dt.write_rtp(&ext_packet(i, 3000 * i, i == 0), 0).unwrap();
        }
        let state = dt.get_state();
        assert!(state.forwarder.started);

        let dt2 = new_down_track(&receiver);
        dt2.set_state(state);
        dt2.set_migrate_state(MigrateState::Complete);
        assert_eq!(dt2.current_layer().spatial, 0);
    }
}

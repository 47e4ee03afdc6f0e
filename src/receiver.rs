use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use rtcp::sender_report::SenderReport;
use util::sync::Mutex;

use crate::buffer::video_layer::DEFAULT_MAX_LAYER_SPATIAL;
use crate::buffer::{Buffer, ExtPacket};
use crate::change_notifier::ChangeNotifier;
use crate::error::{Error, Result};
use crate::stream_info::{MediaKind, RtpCodecParameters, TrackId, TrackInfo};
use crate::utils::spawn_isolated;

pub const NUM_SPATIAL_LAYERS: usize = 3;
pub const NUM_TEMPORAL_LAYERS: usize = 4;

/// Rolling bitrate of every (spatial, temporal) pair, bits per second.
pub type Bitrates = [[u64; NUM_TEMPORAL_LAYERS]; NUM_SPATIAL_LAYERS];

/// TrackReceiver is the capability surface a DownTrack needs from the
/// receive side of a published track.
pub trait TrackReceiver: Send + Sync {
    fn track_id(&self) -> TrackId;
    fn stream_id(&self) -> String;
    fn codec(&self) -> RtpCodecParameters;
    fn kind(&self) -> MediaKind;
    fn is_closed(&self) -> bool;

    /// Reads the stored datagram `sn` of `layer` for retransmission.
    fn read_rtp(&self, buf: &mut [u8], layer: u8, sn: u16) -> Result<usize>;
    fn get_layered_bitrate(&self) -> (Vec<i32>, Bitrates);
    fn get_audio_level(&self) -> Option<(f64, bool)>;
    fn send_pli(&self, layer: i32, force: bool);
    fn track_info(&self) -> TrackInfo;
}

/// TrackSender is the capability surface the receive side needs from each
/// subscriber leg it fans out to.
pub trait TrackSender: Send + Sync {
    fn id(&self) -> &str;
    fn subscriber_id(&self) -> &str;
    fn write_rtp(&self, ext_packet: &ExtPacket, spatial: i32) -> Result<()>;
    fn is_closed(&self) -> bool;
    fn close(&self, will_be_resumed: bool);

    fn up_track_layer_change(&self);
    fn up_track_max_published_layer_change(&self, max_published: i32);
    fn up_track_bitrate_report(&self);
}

impl TrackSender for crate::down_track::DownTrack {
    fn id(&self) -> &str {
        crate::down_track::DownTrack::id(self)
    }

    fn subscriber_id(&self) -> &str {
        crate::down_track::DownTrack::subscriber_id(self)
    }

    fn write_rtp(&self, ext_packet: &ExtPacket, spatial: i32) -> Result<()> {
        crate::down_track::DownTrack::write_rtp(self, ext_packet, spatial)
    }

    fn is_closed(&self) -> bool {
        crate::down_track::DownTrack::is_closed(self)
    }

    fn close(&self, will_be_resumed: bool) {
        crate::down_track::DownTrack::close(self, will_be_resumed)
    }

    fn up_track_layer_change(&self) {
        crate::down_track::DownTrack::up_track_layer_change(self)
    }

    fn up_track_max_published_layer_change(&self, max_published: i32) {
        crate::down_track::DownTrack::up_track_max_published_layer_change(self, max_published)
    }

    fn up_track_bitrate_report(&self) {
        crate::down_track::DownTrack::up_track_bitrate_report(self)
    }
}

pub struct ReceiverParams {
    pub track_id: TrackId,
    pub stream_id: String,
    pub codec: RtpCodecParameters,
    pub track_info: TrackInfo,
}

pub type OnCloseFn = Box<dyn Fn() + Send + Sync>;

/// Receiver owns the per-layer buffers of one published track and fans the
/// ordered packet stream out to every attached DownTrack. Fanout snapshots
/// the subscriber set under the lock and writes off-lock.
pub struct Receiver {
    track_id: TrackId,
    stream_id: String,
    codec: RtpCodecParameters,
    kind: MediaKind,
    track_info: Mutex<TrackInfo>,

    buffers: Mutex<[Option<Arc<Buffer>>; NUM_SPATIAL_LAYERS]>,
    down_tracks: Mutex<Vec<Arc<dyn TrackSender>>>,
    max_expected_spatial: AtomicI32,
    layers_change_notifier: ChangeNotifier,
    closed: AtomicBool,
    on_close: Mutex<Option<OnCloseFn>>,
}

impl Receiver {
    pub fn new(params: ReceiverParams) -> Arc<Self> {
        let kind = params.codec.kind();
        Arc::new(Receiver {
            track_id: params.track_id,
            stream_id: params.stream_id,
            codec: params.codec,
            kind,
            track_info: Mutex::new(params.track_info),
            buffers: Mutex::new([None, None, None]),
            down_tracks: Mutex::new(Vec::new()),
            max_expected_spatial: AtomicI32::new(DEFAULT_MAX_LAYER_SPATIAL),
            layers_change_notifier: ChangeNotifier::new(),
            closed: AtomicBool::new(false),
            on_close: Mutex::new(None),
        })
    }

    pub fn on_close(&self, f: OnCloseFn) {
        *self.on_close.lock() = Some(f);
    }

    /// Attaches the buffer of one simulcast layer and starts its fanout
    /// task; the task ends when the buffer closes.
    pub fn set_up_track(self: &Arc<Self>, layer: usize, buffer: Arc<Buffer>) {
        if layer >= NUM_SPATIAL_LAYERS || self.closed.load(Ordering::Acquire) {
            return;
        }
        {
            let mut buffers = self.buffers.lock();
            buffers[layer] = Some(Arc::clone(&buffer));
        }

        let receiver = Arc::clone(self);
        spawn_isolated("receiver-forward", async move {
            receiver.forward_loop(layer, buffer).await;
        });
    }

    async fn forward_loop(self: Arc<Self>, layer: usize, buffer: Arc<Buffer>) {
        loop {
            let ext_packet = match buffer.read_extended().await {
                Ok(pkt) => pkt,
                Err(_) => return,
            };

            let down_tracks: Vec<Arc<dyn TrackSender>> = {
                let down_tracks = self.down_tracks.lock();
                down_tracks.iter().cloned().collect()
            };
            for dt in down_tracks {
                if let Err(err) = dt.write_rtp(&ext_packet, layer as i32) {
                    log::debug!(
                        "fanout write failed, subscriber {}: {err}",
                        dt.subscriber_id()
                    );
                }
            }
        }
    }

    /// Registers a subscriber leg; one leg per subscriber.
    pub fn add_down_track(&self, down_track: Arc<dyn TrackSender>) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::ErrReceiverClosed);
        }

        let mut down_tracks = self.down_tracks.lock();
        if down_tracks
            .iter()
            .any(|dt| dt.subscriber_id() == down_track.subscriber_id())
        {
            return Err(Error::ErrDownTrackAlreadyExist);
        }

        down_track
            .up_track_max_published_layer_change(self.max_expected_spatial.load(Ordering::Acquire));
        down_tracks.push(down_track);
        Ok(())
    }

    pub fn delete_down_track(&self, subscriber_id: &str) {
        let removed = {
            let mut down_tracks = self.down_tracks.lock();
            let position = down_tracks
                .iter()
                .position(|dt| dt.subscriber_id() == subscriber_id);
            position.map(|i| down_tracks.remove(i))
        };
        if let Some(dt) = removed {
            dt.close(false);
        }
    }

    pub fn down_track_count(&self) -> usize {
        self.down_tracks.lock().len()
    }

    /// Pauses loss recovery on all layers while the publisher is muted.
    pub fn set_up_track_paused(&self, paused: bool) {
        let buffers = self.buffers.lock();
        for buffer in buffers.iter().flatten() {
            buffer.set_paused(paused);
        }
    }

    /// The highest spatial layer the publisher is expected to deliver.
    pub fn set_max_expected_spatial_layer(&self, layer: i32) {
        self.max_expected_spatial.store(layer, Ordering::Release);
        let down_tracks: Vec<Arc<dyn TrackSender>> = {
            let down_tracks = self.down_tracks.lock();
            down_tracks.iter().cloned().collect()
        };
        for dt in down_tracks {
            dt.up_track_max_published_layer_change(layer);
            dt.up_track_layer_change();
        }
        self.layers_change_notifier.notify_changed();
    }

    /// Observers outside the fanout path (speaker detection, quality
    /// scoring) register here for layer availability changes.
    pub fn layers_change_notifier(&self) -> &ChangeNotifier {
        &self.layers_change_notifier
    }

    /// Routes a publisher sender report to the matching layer buffer.
    pub fn process_sender_report(&self, layer: usize, sr: &SenderReport, arrival: SystemTime) {
        let buffer = {
            let buffers = self.buffers.lock();
            buffers.get(layer).and_then(|b| b.clone())
        };
        if let Some(buffer) = buffer {
            buffer.process_sender_report(sr, arrival);
        }
    }

    pub fn get_buffer(&self, layer: usize) -> Option<Arc<Buffer>> {
        let buffers = self.buffers.lock();
        buffers.get(layer).and_then(|b| b.clone())
    }

    /// Closes all attached DownTracks and layer buffers.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        let down_tracks: Vec<Arc<dyn TrackSender>> = {
            let mut down_tracks = self.down_tracks.lock();
            std::mem::take(&mut *down_tracks)
        };
        for dt in down_tracks {
            dt.close(false);
        }

        let buffers = {
            let mut buffers = self.buffers.lock();
            std::mem::take(&mut *buffers)
        };
        for buffer in buffers.into_iter().flatten() {
            buffer.close();
        }

        let on_close = self.on_close.lock().take();
        if let Some(f) = on_close {
            f();
        }
    }
}

impl TrackReceiver for Receiver {
    fn track_id(&self) -> TrackId {
        self.track_id.clone()
    }

    fn stream_id(&self) -> String {
        self.stream_id.clone()
    }

    fn codec(&self) -> RtpCodecParameters {
        self.codec.clone()
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn read_rtp(&self, buf: &mut [u8], layer: u8, sn: u16) -> Result<usize> {
        let buffer = {
            let buffers = self.buffers.lock();
            buffers
                .get(layer as usize)
                .and_then(|b| b.clone())
                .ok_or(Error::ErrBufferNotFound)?
        };
        buffer.read_rtp(buf, sn)
    }

    fn get_layered_bitrate(&self) -> (Vec<i32>, Bitrates) {
        let buffers = {
            let buffers = self.buffers.lock();
            buffers.clone()
        };

        let mut available = Vec::new();
        let mut bitrates: Bitrates = Default::default();
        for (layer, buffer) in buffers.iter().enumerate() {
            if let Some(buffer) = buffer {
                let rates = buffer.get_temporal_layer_bitrates();
                bitrates[layer] = rates;
                if rates.iter().any(|r| *r > 0) {
                    available.push(layer as i32);
                }
            }
        }
        (available, bitrates)
    }

    fn get_audio_level(&self) -> Option<(f64, bool)> {
        let buffer = {
            let buffers = self.buffers.lock();
            buffers[0].clone()
        };
        buffer.and_then(|b| b.get_audio_level())
    }

    fn send_pli(&self, layer: i32, force: bool) {
        if !(0..NUM_SPATIAL_LAYERS as i32).contains(&layer) {
            return;
        }
        let buffer = {
            let buffers = self.buffers.lock();
            buffers[layer as usize].clone()
        };
        if let Some(buffer) = buffer {
            buffer.send_pli(force);
        }
    }

    fn track_info(&self) -> TrackInfo {
        self.track_info.lock().clone()
    }
}

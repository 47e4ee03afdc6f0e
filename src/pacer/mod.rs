#[cfg(test)]
mod pacer_test;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use rtp::extension::abs_send_time_extension::AbsSendTimeExtension;
use rtp::extension::transport_cc_extension::TransportCcExtension;
use tokio::sync::{mpsc, Notify};
use util::marshal::{Marshal, MarshalSize};
use util::sync::Mutex;

use crate::down_track::TrackLocalWriter;
use crate::error::Error;
use crate::utils::spawn_isolated;

const DEFAULT_INTERVAL: Duration = Duration::from_millis(5);
const MAX_QUEUE: usize = 1024;

pub type OnSentFn =
    Box<dyn FnOnce(&rtp::header::Header, usize, SystemTime, Option<&Error>) + Send>;

/// Extra header extension to stamp on a packet at send time.
pub struct ExtensionData {
    pub id: u8,
    pub payload: Bytes,
}

/// Packet is one queued egress datagram. The pacer owns it until write
/// completion, then reports through `on_sent`.
pub struct Packet {
    pub header: rtp::header::Header,
    pub extensions: Vec<ExtensionData>,
    pub payload: Bytes,
    pub abs_send_time_ext_id: u8,
    pub transport_wide_ext_id: u8,
    pub write_stream: Arc<dyn TrackLocalWriter>,
    pub is_retransmission: bool,
    pub is_padding: bool,
    pub on_sent: Option<OnSentFn>,
}

/// Pacer smooths egress of one subscriber to a target bitrate. Strict FIFO;
/// retransmissions share the queue.
pub trait Pacer: Send + Sync {
    fn enqueue(&self, p: Packet);
    fn stop(&self);
    fn set_interval(&self, interval: Duration);
    fn set_bitrate(&self, bitrate: usize);
}

struct PacerQueue {
    queue: Mutex<VecDeque<Packet>>,
    notify: Notify,
}

impl PacerQueue {
    fn new() -> Self {
        PacerQueue {
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
        }
    }

    /// Bounded push: overflow drops the oldest padding packet first, else
    /// the oldest packet, reporting the drop through its callback.
    fn push(&self, packet: Packet) {
        let dropped = {
            let mut queue = self.queue.lock();
            let mut dropped = None;
            if queue.len() >= MAX_QUEUE {
                let victim = queue
                    .iter()
                    .position(|p| p.is_padding)
                    .unwrap_or(0);
                dropped = queue.remove(victim);
            }
            queue.push_back(packet);
            dropped
        };

        if let Some(mut victim) = dropped {
            log::debug!("pacer queue full, dropping tail");
            if let Some(on_sent) = victim.on_sent.take() {
                on_sent(
                    &victim.header,
                    victim.payload.len(),
                    SystemTime::now(),
                    Some(&Error::ErrBufferTooSmall),
                );
            }
        }
        self.notify.notify_one();
    }

    fn pop(&self) -> Option<Packet> {
        self.queue.lock().pop_front()
    }
}

async fn send_packet(twcc_seq: &AtomicU32, mut packet: Packet) {
    let now = SystemTime::now();
    for ext in packet.extensions.drain(..) {
        let _ = packet.header.set_extension(ext.id, ext.payload);
    }
    if packet.abs_send_time_ext_id != 0 {
        if let Ok(payload) = AbsSendTimeExtension::new(now).marshal() {
            let _ = packet
                .header
                .set_extension(packet.abs_send_time_ext_id, payload);
        }
    }
    if packet.transport_wide_ext_id != 0 {
        let seq = twcc_seq.fetch_add(1, Ordering::AcqRel) as u16;
        if let Ok(payload) = (TransportCcExtension {
            transport_sequence: seq,
        })
        .marshal()
        {
            let _ = packet
                .header
                .set_extension(packet.transport_wide_ext_id, payload);
        }
    }

    let out = rtp::packet::Packet {
        header: packet.header,
        payload: packet.payload,
    };
    let result = packet.write_stream.write_rtp(&out).await;

    if let Some(on_sent) = packet.on_sent.take() {
        let err = result.as_ref().err();
        on_sent(&out.header, out.payload.len(), now, err);
    }
}

/// LeakyBucket drains the queue on a fixed cadence against a byte budget
/// derived from the configured bitrate.
pub struct LeakyBucket {
    queue: Arc<PacerQueue>,
    twcc_seq: Arc<AtomicU32>,
    interval_micros: Arc<AtomicU64>,
    bitrate: Arc<AtomicU64>,
    close_tx: Mutex<Option<mpsc::Sender<()>>>,
}

impl LeakyBucket {
    /// Must be created within a tokio runtime.
    pub fn new(interval: Duration, bitrate: usize) -> Self {
        let queue = Arc::new(PacerQueue::new());
        let twcc_seq = Arc::new(AtomicU32::new(rand::random::<u16>() as u32));
        let interval_micros = Arc::new(AtomicU64::new(interval.as_micros() as u64));
        let bitrate_atomic = Arc::new(AtomicU64::new(bitrate as u64));
        let (close_tx, close_rx) = mpsc::channel(1);

        {
            let queue = Arc::clone(&queue);
            let twcc_seq = Arc::clone(&twcc_seq);
            let interval_micros = Arc::clone(&interval_micros);
            let bitrate = Arc::clone(&bitrate_atomic);
            spawn_isolated("pacer-leaky-bucket", async move {
                LeakyBucket::run(queue, twcc_seq, interval_micros, bitrate, close_rx).await;
            });
        }

        LeakyBucket {
            queue,
            twcc_seq,
            interval_micros,
            bitrate: bitrate_atomic,
            close_tx: Mutex::new(Some(close_tx)),
        }
    }

    async fn run(
        queue: Arc<PacerQueue>,
        twcc_seq: Arc<AtomicU32>,
        interval_micros: Arc<AtomicU64>,
        bitrate: Arc<AtomicU64>,
        mut close_rx: mpsc::Receiver<()>,
    ) {
        let mut tokens: f64 = 0.0;
        let mut last_refill = tokio::time::Instant::now();
        loop {
            let interval = Duration::from_micros(interval_micros.load(Ordering::Acquire));
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = queue.notify.notified() => {}
                _ = close_rx.recv() => {
                    // drain what is queued, unpaced, then exit
                    while let Some(packet) = queue.pop() {
                        send_packet(&twcc_seq, packet).await;
                    }
                    return;
                }
            }

            // token bucket over the dequeue cadence; zero bitrate is unshaped
            let now = tokio::time::Instant::now();
            let rate = bitrate.load(Ordering::Acquire);
            if rate > 0 {
                let burst = ((rate / 8) as f64 * interval.as_secs_f64()).max(1500.0);
                tokens = (tokens + (now - last_refill).as_secs_f64() * rate as f64 / 8.0)
                    .min(burst);
            }
            last_refill = now;

            loop {
                if rate > 0 && tokens <= 0.0 {
                    break;
                }
                let Some(packet) = queue.pop() else {
                    break;
                };
                let size = packet.header.marshal_size() + packet.payload.len();
                send_packet(&twcc_seq, packet).await;
                if rate > 0 {
                    tokens -= size as f64;
                }
            }
        }
    }
}

impl Pacer for LeakyBucket {
    fn enqueue(&self, p: Packet) {
        self.queue.push(p);
    }

    fn stop(&self) {
        self.close_tx.lock().take();
    }

    fn set_interval(&self, interval: Duration) {
        self.interval_micros
            .store(interval.as_micros() as u64, Ordering::Release);
    }

    fn set_bitrate(&self, bitrate: usize) {
        self.bitrate.store(bitrate as u64, Ordering::Release);
    }
}

impl Default for LeakyBucket {
    fn default() -> Self {
        LeakyBucket::new(DEFAULT_INTERVAL, 0)
    }
}

/// PassThrough preserves FIFO order but applies no shaping.
pub struct PassThrough {
    inner: LeakyBucket,
}

impl PassThrough {
    pub fn new() -> Self {
        PassThrough {
            inner: LeakyBucket::new(Duration::from_millis(1), 0),
        }
    }
}

impl Default for PassThrough {
    fn default() -> Self {
        PassThrough::new()
    }
}

impl Pacer for PassThrough {
    fn enqueue(&self, p: Packet) {
        self.inner.enqueue(p);
    }

    fn stop(&self) {
        self.inner.stop();
    }

    fn set_interval(&self, _interval: Duration) {}

    fn set_bitrate(&self, _bitrate: usize) {}
}

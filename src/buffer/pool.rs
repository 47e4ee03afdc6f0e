use std::collections::HashMap;
use std::sync::{Arc, Weak};

use util::sync::Mutex;

use crate::buffer::bucket::MAX_PKT_SIZE;
use crate::buffer::{Buffer, RtcpReader};

/// Slabs kept around per pool; beyond this, released slabs are freed.
const MAX_FREE_SLABS: usize = 64;

/// Packets of ring history an audio buffer keeps; audio has no NACK-driven
/// retransmission pressure, so the ring is small.
const AUDIO_TRACKING_PACKETS: usize = 200;

/// SlabPool hands out fixed-size byte regions that back the per-SSRC packet
/// rings, bounding allocation under load. Multi-producer/multi-consumer.
pub struct SlabPool {
    slab_size: usize,
    free: Mutex<Vec<Vec<u8>>>,
}

impl SlabPool {
    pub fn new(slab_size: usize) -> Self {
        SlabPool {
            slab_size,
            free: Mutex::new(Vec::new()),
        }
    }

    pub fn acquire(&self) -> Vec<u8> {
        if let Some(slab) = self.free.lock().pop() {
            return slab;
        }
        vec![0u8; self.slab_size]
    }

    pub fn release(&self, slab: Vec<u8>) {
        if slab.len() != self.slab_size {
            return;
        }
        let mut free = self.free.lock();
        if free.len() < MAX_FREE_SLABS {
            free.push(slab);
        }
    }
}

/// The class of inbound packets a factory buffer serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferPacketType {
    Rtp,
    Rtcp,
}

/// BufferFactory owns the audio/video slab pools and the per-SSRC Buffer and
/// RtcpReader registries. Closing a buffer unregisters it and returns its
/// slab to the pool.
pub struct BufferFactory {
    video_pool: Arc<SlabPool>,
    audio_pool: Arc<SlabPool>,
    rtp_buffers: Mutex<HashMap<u32, Arc<Buffer>>>,
    rtcp_readers: Mutex<HashMap<u32, Arc<RtcpReader>>>,
}

impl BufferFactory {
    /// `tracking_packets` sizes the video packet ring of each buffer.
    pub fn new(tracking_packets: usize) -> Arc<Self> {
        Arc::new(BufferFactory {
            video_pool: Arc::new(SlabPool::new(tracking_packets * MAX_PKT_SIZE)),
            audio_pool: Arc::new(SlabPool::new(AUDIO_TRACKING_PACKETS * MAX_PKT_SIZE)),
            rtp_buffers: Mutex::new(HashMap::new()),
            rtcp_readers: Mutex::new(HashMap::new()),
        })
    }

    pub fn get_or_new_buffer(self: &Arc<Self>, ssrc: u32) -> Arc<Buffer> {
        let mut buffers = self.rtp_buffers.lock();
        if let Some(buffer) = buffers.get(&ssrc) {
            return Arc::clone(buffer);
        }

        let buffer = Arc::new(Buffer::new(
            ssrc,
            Arc::clone(&self.video_pool),
            Arc::clone(&self.audio_pool),
        ));
        let factory = Arc::downgrade(self);
        buffer.on_close(Box::new(move || {
            if let Some(factory) = Weak::upgrade(&factory) {
                factory.rtp_buffers.lock().remove(&ssrc);
            }
        }));
        buffers.insert(ssrc, Arc::clone(&buffer));
        buffer
    }

    pub fn get_or_new_rtcp_reader(self: &Arc<Self>, ssrc: u32) -> Arc<RtcpReader> {
        let mut readers = self.rtcp_readers.lock();
        if let Some(reader) = readers.get(&ssrc) {
            return Arc::clone(reader);
        }

        let reader = Arc::new(RtcpReader::new(ssrc));
        let factory = Arc::downgrade(self);
        reader.on_close(Box::new(move || {
            if let Some(factory) = Weak::upgrade(&factory) {
                factory.rtcp_readers.lock().remove(&ssrc);
            }
        }));
        readers.insert(ssrc, Arc::clone(&reader));
        reader
    }

    pub fn get_buffer(&self, ssrc: u32) -> Option<Arc<Buffer>> {
        self.rtp_buffers.lock().get(&ssrc).cloned()
    }

    pub fn get_rtcp_reader(&self, ssrc: u32) -> Option<Arc<RtcpReader>> {
        self.rtcp_readers.lock().get(&ssrc).cloned()
    }

    pub fn get_buffer_pair(&self, ssrc: u32) -> (Option<Arc<Buffer>>, Option<Arc<RtcpReader>>) {
        (self.get_buffer(ssrc), self.get_rtcp_reader(ssrc))
    }
}

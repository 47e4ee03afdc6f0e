use std::time::{Duration, Instant};

use util::sync::Mutex;

/// A repeated NACK for the same packet inside this window is ignored; the
/// first retransmission is likely still in flight.
const IGNORE_RETRANSMISSION: Duration = Duration::from_millis(100);

const DEFAULT_TRACKED_PACKETS: usize = 2048;

/// PacketMeta maps one egress sequence number back to its origin, so a NACK
/// from the subscriber can be answered from the receive-side packet ring.
#[derive(Debug, Clone, Copy)]
pub struct PacketMeta {
    pub source_seq: u16,
    pub target_seq: u16,
    pub timestamp: u32,
    pub layer: i32,
    /// Rewritten VP8 picture id / tl0picidx to re-apply on retransmission.
    pub vp8_picture_id: Option<u16>,
    pub vp8_tl0_pic_idx: Option<u8>,
    pub nacked: u8,
    last_nack: Option<Instant>,
    padding: bool,
}

#[derive(Default)]
struct SequencerInner {
    meta: Vec<Option<PacketMeta>>,
}

/// Sequencer is the per-DownTrack ring of recently sent packets keyed by
/// egress sequence number.
pub struct Sequencer {
    inner: Mutex<SequencerInner>,
    size: usize,
}

impl Default for Sequencer {
    fn default() -> Self {
        Sequencer::new(DEFAULT_TRACKED_PACKETS)
    }
}

impl Sequencer {
    pub fn new(max_tracked: usize) -> Self {
        let size = max_tracked.max(64);
        Sequencer {
            inner: Mutex::new(SequencerInner {
                meta: vec![None; size],
            }),
            size,
        }
    }

    pub fn push(
        &self,
        source_seq: u16,
        target_seq: u16,
        timestamp: u32,
        layer: i32,
        vp8: Option<(u16, u8)>,
    ) {
        let mut inner = self.inner.lock();
        let slot = target_seq as usize % self.size;
        inner.meta[slot] = Some(PacketMeta {
            source_seq,
            target_seq,
            timestamp,
            layer,
            vp8_picture_id: vp8.map(|(picture_id, _)| picture_id),
            vp8_tl0_pic_idx: vp8.map(|(_, tl0)| tl0),
            nacked: 0,
            last_nack: None,
            padding: false,
        });
    }

    /// Padding packets are recorded so NACKs for them are answered with
    /// silence instead of a cache miss.
    pub fn push_padding(&self, target_seq: u16) {
        let mut inner = self.inner.lock();
        let slot = target_seq as usize % self.size;
        inner.meta[slot] = Some(PacketMeta {
            source_seq: 0,
            target_seq,
            timestamp: 0,
            layer: -1,
            vp8_picture_id: None,
            vp8_tl0_pic_idx: None,
            nacked: 0,
            last_nack: None,
            padding: true,
        });
    }

    /// Resolves NACKed egress sequence numbers to retransmittable packets,
    /// with per-entry retransmission throttling.
    pub fn get_packets_meta(&self, seqs: &[u16]) -> Vec<PacketMeta> {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let mut found = Vec::with_capacity(seqs.len());

        for &seq in seqs {
            let slot = seq as usize % self.size;
            let Some(meta) = inner.meta[slot].as_mut() else {
                continue;
            };
            if meta.target_seq != seq || meta.padding {
                continue;
            }
            if let Some(last) = meta.last_nack {
                if now.duration_since(last) < IGNORE_RETRANSMISSION {
                    continue;
                }
            }
            meta.nacked = meta.nacked.saturating_add(1);
            meta.last_nack = Some(now);
            found.push(*meta);
        }
        found
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_lookup_by_target_seq() {
        let sequencer = Sequencer::new(256);
        sequencer.push(4000, 100, 90000, 1, None);
        sequencer.push(4001, 101, 90000, 1, Some((77, 9)));

        let metas = sequencer.get_packets_meta(&[100, 101, 102]);
        assert_eq!(metas.len(), 2);
        assert_eq!(metas[0].source_seq, 4000);
        assert_eq!(metas[0].layer, 1);
        assert_eq!(metas[1].source_seq, 4001);
        assert_eq!(metas[1].vp8_picture_id, Some(77));
        assert_eq!(metas[1].vp8_tl0_pic_idx, Some(9));
    }

    #[test]
    fn test_repeated_nack_throttled() {
        let sequencer = Sequencer::new(256);
        sequencer.push(1, 10, 0, 0, None);

        assert_eq!(sequencer.get_packets_meta(&[10]).len(), 1);
        // immediately re-NACKed: first retransmission still in flight
        assert_eq!(sequencer.get_packets_meta(&[10]).len(), 0);
    }

    #[test]
    fn test_padding_not_retransmitted() {
        let sequencer = Sequencer::new(256);
        sequencer.push_padding(55);
        assert!(sequencer.get_packets_meta(&[55]).is_empty());
    }

    #[test]
    fn test_stale_slot_not_matched() {
        let sequencer = Sequencer::new(64);
        sequencer.push(1, 10, 0, 0, None);
        // 74 aliases slot 10 in a 64-slot ring
        sequencer.push(2, 74, 0, 0, None);
        assert!(sequencer.get_packets_meta(&[10]).is_empty());
        assert_eq!(sequencer.get_packets_meta(&[74]).len(), 1);
    }
}

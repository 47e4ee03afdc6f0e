use crate::dependency_descriptor::DependencyDescriptor;

/// PacketHistory keeps a rolling received/lost bitmap over the latest
/// `packet_count` extended sequence numbers.
pub struct PacketHistory {
    base: u64,
    last: u64,
    bits: Vec<u64>,
    packet_count: usize,
    inited: bool,
}

impl PacketHistory {
    pub fn new(packet_count: usize) -> Self {
        let packet_count = packet_count.div_ceil(64) * 64;
        PacketHistory {
            base: 0,
            last: 0,
            bits: vec![0u64; packet_count / 64],
            packet_count,
            inited: false,
        }
    }

    pub fn add_packet(&mut self, ext_seq: u64) {
        if !self.inited {
            self.inited = true;
            // leave room below the first packet so reordered packets of the
            // first frame are not dropped
            self.base = ext_seq.saturating_sub(100);
            self.last = ext_seq;
            self.set(ext_seq, true);
            return;
        }

        if ext_seq <= self.base {
            return;
        }

        if ext_seq <= self.last {
            if self.last - ext_seq < self.packet_count as u64 {
                self.set(ext_seq, true);
            }
            return;
        }

        for seq in self.last + 1..ext_seq {
            self.set(seq, false);
        }
        self.set(ext_seq, true);
        self.last = ext_seq;
    }

    fn pos(&self, seq: u64) -> (usize, usize) {
        let idx = (seq - self.base) % self.packet_count as u64;
        ((idx >> 6) as usize, (idx % 64) as usize)
    }

    fn set(&mut self, seq: u64, received: bool) {
        let (idx, offset) = self.pos(seq);
        if received {
            self.bits[idx] |= 1 << offset;
        } else {
            self.bits[idx] &= !(1 << offset);
        }
    }

    /// True iff every sequence number in `[start, end]` was received.
    pub fn packets_consecutive(&self, start: u64, end: u64) -> bool {
        if start > end {
            return false;
        }
        if end - start > self.packet_count as u64 {
            return false;
        }

        let (start_index, start_offset) = self.pos(start);
        let (end_index, end_offset) = self.pos(end);

        if start_index == end_index && end - start <= 64 {
            let test_bits = if end_offset - start_offset + 1 == 64 {
                u64::MAX
            } else {
                ((1u64 << (end_offset - start_offset + 1)) - 1) << start_offset
            };
            return self.bits[start_index] & test_bits == test_bits;
        }

        if start_offset > 0 && (self.bits[start_index] >> start_offset) + 1 != 1 << (64 - start_offset)
        {
            return false;
        }
        if start_offset == 0 && start_index != end_index && self.bits[start_index] != u64::MAX {
            return false;
        }

        let mut i = (start_index + 1) % self.bits.len();
        while i != end_index {
            if self.bits[i] != u64::MAX {
                return false;
            }
            i = (i + 1) % self.bits.len();
        }

        let test_bits = if end_offset == 63 {
            u64::MAX
        } else {
            (1u64 << (end_offset + 1)) - 1
        };
        self.bits[end_index] & test_bits == test_bits
    }
}

struct FrameEntity {
    start_seq: Option<u64>,
    end_seq: Option<u64>,
    integrity: bool,
}

impl FrameEntity {
    const fn new() -> Self {
        FrameEntity {
            start_seq: None,
            end_seq: None,
            integrity: false,
        }
    }

    fn reset(&mut self) {
        self.start_seq = None;
        self.end_seq = None;
        self.integrity = false;
    }

    fn add_packet(&mut self, ext_seq: u64, dd: &DependencyDescriptor, history: &PacketHistory) {
        if self.integrity {
            return;
        }

        if self.start_seq.is_none() && dd.first_packet_in_frame {
            self.start_seq = Some(ext_seq);
        }
        if self.end_seq.is_none() && dd.last_packet_in_frame {
            self.end_seq = Some(ext_seq);
        }

        if let (Some(start), Some(end)) = (self.start_seq, self.end_seq) {
            if history.packets_consecutive(start, end) {
                self.integrity = true;
            }
        }
    }
}

/// FrameIntegrityChecker tracks which of the latest `frame_count` frames
/// have been fully received, combining the dependency-descriptor frame
/// boundaries with the packet history bitmap.
pub struct FrameIntegrityChecker {
    frame_count: usize,
    frames: Vec<FrameEntity>,
    base: u64,
    last: u64,
    packet_history: PacketHistory,
    inited: bool,
}

impl FrameIntegrityChecker {
    pub fn new(frame_count: usize, packet_count: usize) -> Self {
        let mut frames = Vec::with_capacity(frame_count);
        frames.resize_with(frame_count, FrameEntity::new);
        FrameIntegrityChecker {
            frame_count,
            frames,
            base: 0,
            last: 0,
            packet_history: PacketHistory::new(packet_count),
            inited: false,
        }
    }

    pub fn add_packet(&mut self, ext_seq: u64, ext_frame_num: u64, dd: &DependencyDescriptor) {
        self.packet_history.add_packet(ext_seq);

        if !self.inited {
            self.inited = true;
            self.base = ext_frame_num;
            self.last = ext_frame_num;
        }

        if ext_frame_num < self.base {
            // frame too old
            return;
        }

        if ext_frame_num <= self.last {
            if self.last - ext_frame_num >= self.frame_count as u64 {
                return;
            }
            let slot = self.slot(ext_frame_num);
            self.frames[slot].add_packet(ext_seq, dd, &self.packet_history);
            return;
        }

        for frame in self.last + 1..=ext_frame_num {
            let slot = self.slot(frame);
            self.frames[slot].reset();
        }
        let slot = self.slot(ext_frame_num);
        self.frames[slot].add_packet(ext_seq, dd, &self.packet_history);
        self.last = ext_frame_num;
    }

    pub fn frame_integrity(&self, ext_frame_num: u64) -> bool {
        if ext_frame_num < self.base
            || ext_frame_num > self.last
            || self.last - ext_frame_num >= self.frame_count as u64
        {
            return false;
        }
        self.frames[self.slot(ext_frame_num)].integrity
    }

    fn slot(&self, ext_frame_num: u64) -> usize {
        ((ext_frame_num - self.base) % self.frame_count as u64) as usize
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn dd(first: bool, last: bool, frame_number: u16) -> DependencyDescriptor {
        DependencyDescriptor {
            first_packet_in_frame: first,
            last_packet_in_frame: last,
            frame_number,
            ..Default::default()
        }
    }

    #[test]
    fn test_packets_consecutive() {
        let mut history = PacketHistory::new(128);
        for seq in 1000u64..1010 {
            history.add_packet(seq);
        }
        assert!(history.packets_consecutive(1000, 1009));
        assert!(history.packets_consecutive(1003, 1007));
        assert!(!history.packets_consecutive(1000, 1010));
        assert!(history.packets_consecutive(1005, 1005));

        history.add_packet(1012);
        assert!(!history.packets_consecutive(1009, 1012));
        history.add_packet(1010);
        history.add_packet(1011);
        assert!(history.packets_consecutive(1000, 1012));
    }

    #[test]
    fn test_packets_consecutive_across_words() {
        let mut history = PacketHistory::new(256);
        for seq in 500u64..700 {
            history.add_packet(seq);
        }
        assert!(history.packets_consecutive(520, 680));

        let mut gappy = PacketHistory::new(256);
        for seq in 500u64..700 {
            if seq != 600 {
                gappy.add_packet(seq);
            }
        }
        assert!(!gappy.packets_consecutive(520, 680));
        assert!(gappy.packets_consecutive(601, 680));
    }

    #[test]
    fn test_frame_integrity_with_gap() {
        let mut checker = FrameIntegrityChecker::new(32, 256);

        // frame 7 spans 700..=705 with 703 missing at first
        for seq in [700u64, 701, 702, 704] {
            checker.add_packet(seq, 7, &dd(seq == 700, false, 7));
        }
        checker.add_packet(705, 7, &dd(false, true, 7));
        assert!(!checker.frame_integrity(7));

        checker.add_packet(703, 7, &dd(false, false, 7));
        assert!(checker.frame_integrity(7));
    }

    #[test]
    fn test_integrity_sticky_until_evicted() {
        let mut checker = FrameIntegrityChecker::new(4, 256);
        checker.add_packet(100, 10, &dd(true, true, 10));
        assert!(checker.frame_integrity(10));

        checker.add_packet(101, 11, &dd(true, true, 11));
        assert!(checker.frame_integrity(10));
        assert!(checker.frame_integrity(11));

        // advancing the ring past the retained window evicts frame 10
        checker.add_packet(110, 14, &dd(true, true, 14));
        assert!(!checker.frame_integrity(10));
        assert!(checker.frame_integrity(14));
    }

    #[test]
    fn test_out_of_window_is_false() {
        let mut checker = FrameIntegrityChecker::new(8, 256);
        checker.add_packet(100, 50, &dd(true, true, 50));
        assert!(!checker.frame_integrity(49));
        assert!(!checker.frame_integrity(51));
    }

    #[test]
    fn test_single_packet_frames_interleaved() {
        let mut checker = FrameIntegrityChecker::new(16, 256);
        checker.add_packet(200, 1, &dd(true, true, 1));
        // frame 3 arrives before frame 2
        checker.add_packet(204, 3, &dd(true, true, 3));
        assert!(checker.frame_integrity(3));
        assert!(!checker.frame_integrity(2));

        checker.add_packet(202, 2, &dd(true, false, 2));
        assert!(!checker.frame_integrity(2));
        checker.add_packet(203, 2, &dd(false, true, 2));
        assert!(checker.frame_integrity(2));
    }
}

use std::collections::HashMap;
use std::time::{Duration, SystemTime};

use rtcp::reception_report::ReceptionReport;
use util::sync::Mutex;

/// Extended sequence numbers begin one cycle in; strip that headroom when
/// reporting the 16-bit cycle count on the wire.
const EXT_SEQ_HEADROOM: u64 = 1 << 16;

#[derive(Default, Debug, Clone)]
pub struct RtpStatsParams {
    pub clock_rate: u32,
}

/// SnapshotId identifies a baseline for a future delta, so two consumers
/// (connection quality, analytics) can read non-overlapping intervals.
pub type SnapshotId = u32;

#[derive(Default, Debug, Clone, Copy)]
struct Snapshot {
    ts: Option<SystemTime>,
    ext_seq: u64,
    packets: u64,
    bytes: u64,
    packets_padding: u64,
    packets_lost: u64,
    packets_out_of_order: u64,
    packets_duplicate: u64,
    nacks: u32,
    plis: u32,
    firs: u32,
}

/// DeltaInfo is the change of the counters since a snapshot was taken.
#[derive(Default, Debug, Clone, Copy)]
pub struct DeltaInfo {
    pub start_time: Option<SystemTime>,
    pub end_time: Option<SystemTime>,
    pub packets: u64,
    pub bytes: u64,
    pub packets_padding: u64,
    pub packets_lost: u64,
    pub packets_out_of_order: u64,
    pub packets_duplicate: u64,
    pub fraction_lost: f64,
    pub nacks: u32,
    pub plis: u32,
    pub firs: u32,
    pub jitter: f64,
    pub rtt: u32,
}

#[derive(Default)]
struct RtpStatsInner {
    start_time: Option<SystemTime>,

    ext_start_seq: u64,
    ext_highest_seq: u64,
    ext_highest_ts: u64,

    packets: u64,
    bytes: u64,
    header_bytes: u64,
    packets_duplicate: u64,
    bytes_duplicate: u64,
    packets_padding: u64,
    bytes_padding: u64,
    packets_out_of_order: u64,
    packets_lost: u64,
    packets_retransmitted: u64,
    bytes_retransmitted: u64,

    jitter: f64,
    max_jitter: f64,
    last_packet_ext_ts: u64,
    last_packet_arrival: Option<SystemTime>,

    nacks: u32,
    plis: u32,
    firs: u32,
    rtt: u32,
    max_rtt: u32,

    last_sr_ntp: u64,
    last_sr_rtp_ts: u32,
    last_sr_arrival: Option<SystemTime>,

    last_rr_ext_seq: u64,
    last_rr_packets_lost: u64,
    total_lost_reported: u32,

    next_snapshot_id: SnapshotId,
    snapshots: HashMap<SnapshotId, Snapshot>,
}

/// RtpStats keeps the running counters of one RTP stream, either received
/// (per Buffer) or sent (per DownTrack). Snapshots are point-in-time: a
/// reader sees pre- or post-update counters, never torn values.
pub struct RtpStats {
    params: RtpStatsParams,
    inner: Mutex<RtpStatsInner>,
}

impl RtpStats {
    pub fn new(params: RtpStatsParams) -> Self {
        RtpStats {
            params,
            inner: Mutex::new(RtpStatsInner::default()),
        }
    }

    /// Records one primary packet. `ext_seq`/`ext_ts` are the unwrapped
    /// counters; a value at or below the running highest is counted as
    /// out-of-order and fills a previously registered gap.
    pub fn update(
        &self,
        arrival: SystemTime,
        ext_seq: u64,
        ext_ts: u64,
        hdr_size: usize,
        payload_size: usize,
        padding_size: usize,
    ) {
        let mut inner = self.inner.lock();

        if inner.start_time.is_none() {
            inner.start_time = Some(arrival);
            inner.ext_start_seq = ext_seq;
            inner.ext_highest_seq = ext_seq.saturating_sub(1);
            inner.last_rr_ext_seq = ext_seq.saturating_sub(1);
        }

        if ext_seq > inner.ext_highest_seq {
            let gap = ext_seq - inner.ext_highest_seq;
            if gap > 1 {
                inner.packets_lost += gap - 1;
            }
            inner.ext_highest_seq = ext_seq;

            // jitter is computed over in-order arrivals, RFC 3550 page 39
            if let Some(last_arrival) = inner.last_packet_arrival {
                let elapsed = arrival
                    .duration_since(last_arrival)
                    .unwrap_or(Duration::ZERO)
                    .as_secs_f64();
                let d = elapsed * self.params.clock_rate as f64
                    - (ext_ts as f64 - inner.last_packet_ext_ts as f64);
                inner.jitter += (d.abs() - inner.jitter) / 16.0;
                if inner.jitter > inner.max_jitter {
                    inner.max_jitter = inner.jitter;
                }
            }
            inner.last_packet_ext_ts = ext_ts;
            inner.last_packet_arrival = Some(arrival);
        } else {
            inner.packets_out_of_order += 1;
            inner.packets_lost = inner.packets_lost.saturating_sub(1);
        }

        if payload_size == 0 {
            inner.packets_padding += 1;
            inner.bytes_padding += padding_size as u64;
        } else {
            inner.packets += 1;
            inner.bytes += (payload_size + padding_size) as u64;
        }
        inner.header_bytes += hdr_size as u64;
    }

    pub fn update_duplicate(&self, hdr_size: usize, payload_size: usize, padding_size: usize) {
        let mut inner = self.inner.lock();
        inner.packets_duplicate += 1;
        inner.bytes_duplicate += (payload_size + padding_size) as u64;
        inner.header_bytes += hdr_size as u64;
    }

    pub fn update_retransmit(&self, bytes: usize) {
        let mut inner = self.inner.lock();
        inner.packets_retransmitted += 1;
        inner.bytes_retransmitted += bytes as u64;
    }

    pub fn update_nacks(&self, count: u32) {
        self.inner.lock().nacks += count;
    }

    pub fn update_pli(&self) {
        self.inner.lock().plis += 1;
    }

    pub fn update_fir(&self) {
        self.inner.lock().firs += 1;
    }

    pub fn update_rtt(&self, rtt: u32) {
        let mut inner = self.inner.lock();
        inner.rtt = rtt;
        if rtt > inner.max_rtt {
            inner.max_rtt = rtt;
        }
    }

    pub fn set_sender_report(&self, rtp_ts: u32, ntp_ts: u64, arrival: SystemTime) {
        let mut inner = self.inner.lock();
        inner.last_sr_rtp_ts = rtp_ts;
        inner.last_sr_ntp = ntp_ts;
        inner.last_sr_arrival = Some(arrival);
    }

    pub fn new_snapshot_id(&self) -> SnapshotId {
        let mut inner = self.inner.lock();
        let id = inner.next_snapshot_id;
        inner.next_snapshot_id += 1;
        let baseline = inner.snapshot();
        inner.snapshots.insert(id, baseline);
        id
    }

    /// The delta since `id` was last read; the baseline advances to now.
    pub fn delta_info(&self, id: SnapshotId, now: SystemTime) -> Option<DeltaInfo> {
        let mut inner = self.inner.lock();
        let then = *inner.snapshots.get(&id)?;
        let current = inner.snapshot();

        let expected = current.ext_seq.saturating_sub(then.ext_seq);
        let lost = current.packets_lost.saturating_sub(then.packets_lost);
        let delta = DeltaInfo {
            start_time: then.ts,
            end_time: Some(now),
            packets: current.packets - then.packets,
            bytes: current.bytes - then.bytes,
            packets_padding: current.packets_padding - then.packets_padding,
            packets_lost: lost,
            packets_out_of_order: current.packets_out_of_order - then.packets_out_of_order,
            packets_duplicate: current.packets_duplicate - then.packets_duplicate,
            fraction_lost: if expected > 0 {
                lost as f64 / expected as f64
            } else {
                0.0
            },
            nacks: current.nacks - then.nacks,
            plis: current.plis - then.plis,
            firs: current.firs - then.firs,
            jitter: inner.jitter,
            rtt: inner.rtt,
        };

        let mut advanced = current;
        advanced.ts = Some(now);
        inner.snapshots.insert(id, advanced);
        Some(delta)
    }

    /// Builds the reception report block for the periodic receiver report.
    pub fn reception_report(&self, ssrc: u32, now: SystemTime) -> Option<ReceptionReport> {
        let mut inner = self.inner.lock();
        inner.start_time?;

        let expected_since = inner.ext_highest_seq.saturating_sub(inner.last_rr_ext_seq);
        let lost_since = inner
            .packets_lost
            .saturating_sub(inner.last_rr_packets_lost);

        let fraction_lost = if expected_since > 0 {
            ((lost_since * 256) / expected_since).min(255) as u8
        } else {
            0
        };

        inner.total_lost_reported = inner
            .total_lost_reported
            .saturating_add(lost_since.min(0xFFFFFF) as u32)
            .min(0xFFFFFF);

        let delay = match inner.last_sr_arrival {
            None => 0,
            Some(at) => {
                (now.duration_since(at).unwrap_or(Duration::ZERO).as_secs_f64() * 65536.0) as u32
            }
        };

        let report = ReceptionReport {
            ssrc,
            fraction_lost,
            total_lost: inner.total_lost_reported,
            last_sequence_number: (inner.ext_highest_seq - EXT_SEQ_HEADROOM) as u32,
            jitter: inner.jitter as u32,
            last_sender_report: (inner.last_sr_ntp >> 16) as u32,
            delay,
        };

        inner.last_rr_ext_seq = inner.ext_highest_seq;
        inner.last_rr_packets_lost = inner.packets_lost;
        Some(report)
    }

    pub fn ext_highest_sequence_number(&self) -> u64 {
        self.inner.lock().ext_highest_seq
    }

    pub fn packets(&self) -> u64 {
        self.inner.lock().packets
    }

    pub fn bytes(&self) -> u64 {
        self.inner.lock().bytes
    }

    pub fn packets_lost(&self) -> u64 {
        self.inner.lock().packets_lost
    }

    pub fn packets_out_of_order(&self) -> u64 {
        self.inner.lock().packets_out_of_order
    }

    pub fn packets_duplicate(&self) -> u64 {
        self.inner.lock().packets_duplicate
    }

    pub fn packets_padding(&self) -> u64 {
        self.inner.lock().packets_padding
    }

    pub fn bytes_retransmitted(&self) -> u64 {
        self.inner.lock().bytes_retransmitted
    }

    pub fn jitter(&self) -> f64 {
        self.inner.lock().jitter
    }

    pub fn rtt(&self) -> u32 {
        self.inner.lock().rtt
    }

    pub fn nacks(&self) -> u32 {
        self.inner.lock().nacks
    }

    pub fn plis(&self) -> u32 {
        self.inner.lock().plis
    }

    pub fn firs(&self) -> u32 {
        self.inner.lock().firs
    }
}

impl RtpStatsInner {
    fn snapshot(&self) -> Snapshot {
        Snapshot {
            ts: self.start_time,
            ext_seq: self.ext_highest_seq,
            packets: self.packets,
            bytes: self.bytes,
            packets_padding: self.packets_padding,
            packets_lost: self.packets_lost,
            packets_out_of_order: self.packets_out_of_order,
            packets_duplicate: self.packets_duplicate,
            nacks: self.nacks,
            plis: self.plis,
            firs: self.firs,
        }
    }
}

#[cfg(test)]
mod rtp_stats_test {
    use super::*;

    fn stats() -> RtpStats {
        RtpStats::new(RtpStatsParams { clock_rate: 90000 })
    }

    fn ext(seq: u64) -> u64 {
        EXT_SEQ_HEADROOM + seq
    }

    #[test]
    fn test_loss_then_late_arrival() {
        let s = stats();
        let now = SystemTime::now();
        s.update(now, ext(100), 3000, 12, 1000, 0);
        s.update(now, ext(101), 6000, 12, 1000, 0);
        s.update(now, ext(105), 9000, 12, 1000, 0);
        assert_eq!(s.packets_lost(), 3);

        s.update(now, ext(103), 9000, 12, 1000, 0);
        assert_eq!(s.packets_lost(), 2);
        assert_eq!(s.packets_out_of_order(), 1);
        assert_eq!(s.packets(), 4);
    }

    #[test]
    fn test_padding_counted_separately() {
        let s = stats();
        let now = SystemTime::now();
        s.update(now, ext(1), 3000, 12, 1000, 0);
        s.update(now, ext(2), 3000, 12, 0, 255);
        assert_eq!(s.packets(), 1);
        assert_eq!(s.packets_padding(), 1);
    }

    #[test]
    fn test_snapshots_are_independent() {
        let s = stats();
        let now = SystemTime::now();
        let quality = s.new_snapshot_id();

        s.update(now, ext(10), 3000, 12, 500, 0);
        s.update(now, ext(11), 6000, 12, 500, 0);

        let analytics = s.new_snapshot_id();
        s.update(now, ext(12), 9000, 12, 500, 0);

        let d1 = s.delta_info(quality, now).unwrap();
        assert_eq!(d1.packets, 3);
        let d2 = s.delta_info(analytics, now).unwrap();
        assert_eq!(d2.packets, 1);

        // a second read of the same id only covers what came after
        s.update(now, ext(13), 12000, 12, 500, 0);
        let d3 = s.delta_info(quality, now).unwrap();
        assert_eq!(d3.packets, 1);
    }

    #[test]
    fn test_reception_report_counts_interval_loss() {
        let s = stats();
        let now = SystemTime::now();
        s.update(now, ext(1000), 3000, 12, 100, 0);
        for seq in 1002u64..1010 {
            s.update(now, ext(seq), 3000 + seq * 30, 12, 100, 0);
        }

        let rr = s.reception_report(0x1234, now).unwrap();
        assert_eq!(rr.ssrc, 0x1234);
        assert_eq!(rr.total_lost, 1);
        assert_eq!(rr.last_sequence_number, 1009);
        assert!(rr.fraction_lost > 0);

        // nothing new: fraction drops to zero, totals stick
        let rr2 = s.reception_report(0x1234, now).unwrap();
        assert_eq!(rr2.fraction_lost, 0);
        assert_eq!(rr2.total_lost, 1);
    }

    #[test]
    fn test_sender_report_echo() {
        let s = stats();
        let now = SystemTime::now();
        s.update(now, ext(1), 3000, 12, 100, 0);
        s.set_sender_report(123, 0xA1B2_C3D4_E5F6_0708, now);

        let later = now + Duration::from_millis(500);
        let rr = s.reception_report(1, later).unwrap();
        assert_eq!(rr.last_sender_report, 0xC3D4_E5F6u64 as u32);
        // ~0.5 s in 1/65536 units
        assert!((30000..36000).contains(&rr.delay));
    }

    #[test]
    fn test_feedback_counters() {
        let s = stats();
        s.update_nacks(3);
        s.update_pli();
        s.update_fir();
        s.update_rtt(42);
        assert_eq!(s.nacks(), 3);
        assert_eq!(s.plis(), 1);
        assert_eq!(s.firs(), 1);
        assert_eq!(s.rtt(), 42);
    }
}

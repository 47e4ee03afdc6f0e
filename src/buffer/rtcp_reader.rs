use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use util::sync::Mutex;

use crate::error::{Error, Result};

pub type OnRtcpPacketsFn =
    Box<dyn Fn(&[Box<dyn rtcp::packet::Packet + Send + Sync>], SystemTime) + Send + Sync>;
pub type OnCloseFn = Box<dyn Fn() + Send + Sync>;

/// RtcpReader hands demuxed inbound RTCP of one SSRC to a consumer callback.
pub struct RtcpReader {
    ssrc: u32,
    closed: AtomicBool,
    on_packets: Mutex<Option<Arc<OnRtcpPacketsFn>>>,
    on_close: Mutex<Option<OnCloseFn>>,
}

impl RtcpReader {
    pub fn new(ssrc: u32) -> Self {
        RtcpReader {
            ssrc,
            closed: AtomicBool::new(false),
            on_packets: Mutex::new(None),
            on_close: Mutex::new(None),
        }
    }

    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    pub fn on_packets(&self, f: OnRtcpPacketsFn) {
        *self.on_packets.lock() = Some(Arc::new(f));
    }

    pub fn on_close(&self, f: OnCloseFn) {
        *self.on_close.lock() = Some(f);
    }

    /// Parses one compound RTCP datagram and delivers it.
    pub fn write(&self, raw: &[u8], arrival: SystemTime) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::ErrBufferClosed);
        }

        let mut buf = raw;
        let packets = rtcp::packet::unmarshal(&mut buf)?;

        let on_packets = self.on_packets.lock().clone();
        if let Some(f) = on_packets {
            f(&packets, arrival);
        }
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let on_close = self.on_close.lock().take();
        if let Some(f) = on_close {
            f();
        }
    }
}

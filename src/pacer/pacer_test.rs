use std::sync::Mutex as StdMutex;
use std::time::Instant;

use async_trait::async_trait;

use super::*;
use crate::error::Result;

#[derive(Debug, Default)]
struct MockWriteStream {
    sent: StdMutex<Vec<rtp::packet::Packet>>,
}

#[async_trait]
impl crate::down_track::TrackLocalWriter for MockWriteStream {
    async fn write_rtp(&self, p: &rtp::packet::Packet) -> Result<usize> {
        self.sent.lock().unwrap().push(p.clone());
        Ok(p.payload.len())
    }
}

impl MockWriteStream {
    async fn wait_for(&self, count: usize) -> Vec<rtp::packet::Packet> {
        for _ in 0..300 {
            {
                let sent = self.sent.lock().unwrap();
                if sent.len() >= count {
                    return sent.clone();
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        self.sent.lock().unwrap().clone()
    }
}

fn packet(
    sn: u16,
    writer: &Arc<MockWriteStream>,
    abs_id: u8,
    twcc_id: u8,
    on_sent: Option<OnSentFn>,
) -> Packet {
    Packet {
        header: rtp::header::Header {
            version: 2,
            payload_type: 96,
            sequence_number: sn,
            timestamp: 1000,
            ssrc: 0x42,
            ..Default::default()
        },
        extensions: vec![],
        payload: Bytes::from_static(&[0u8; 100]),
        abs_send_time_ext_id: abs_id,
        transport_wide_ext_id: twcc_id,
        write_stream: Arc::clone(writer) as Arc<dyn crate::down_track::TrackLocalWriter>,
        is_retransmission: false,
        is_padding: false,
        on_sent,
    }
}

#[tokio::test]
async fn test_fifo_order() {
    let pacer = PassThrough::new();
    let writer = Arc::new(MockWriteStream::default());

    for sn in 0u16..50 {
        pacer.enqueue(packet(sn, &writer, 0, 0, None));
    }

    let sent = writer.wait_for(50).await;
    assert_eq!(sent.len(), 50);
    for (i, p) in sent.iter().enumerate() {
        assert_eq!(p.header.sequence_number, i as u16);
    }
    pacer.stop();
}

#[tokio::test]
async fn test_on_sent_invoked() {
    let pacer = PassThrough::new();
    let writer = Arc::new(MockWriteStream::default());

    let reported = Arc::new(StdMutex::new(Vec::new()));
    let sink = Arc::clone(&reported);
    pacer.enqueue(packet(
        7,
        &writer,
        0,
        0,
        Some(Box::new(move |header, payload_size, _sent_at, err| {
            sink.lock()
                .unwrap()
                .push((header.sequence_number, payload_size, err.is_none()));
        })),
    ));

    writer.wait_for(1).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(*reported.lock().unwrap(), vec![(7u16, 100usize, true)]);
    pacer.stop();
}

#[tokio::test]
async fn test_extensions_stamped_at_send_time() {
    let pacer = PassThrough::new();
    let writer = Arc::new(MockWriteStream::default());

    pacer.enqueue(packet(1, &writer, 2, 3, None));
    pacer.enqueue(packet(2, &writer, 2, 3, None));

    let sent = writer.wait_for(2).await;
    assert_eq!(sent.len(), 2);
    for p in &sent {
        assert!(p.header.get_extension(2).is_some(), "abs-send-time");
        assert!(p.header.get_extension(3).is_some(), "transport-cc");
    }

    // transport-wide sequence increments per sent packet
    let twcc = |p: &rtp::packet::Packet| -> u16 {
        let payload = p.header.get_extension(3).unwrap();
        u16::from_be_bytes([payload[0], payload[1]])
    };
    assert_eq!(twcc(&sent[1]), twcc(&sent[0]).wrapping_add(1));
    pacer.stop();
}

#[tokio::test]
async fn test_stop_drains_queue() {
    let pacer = LeakyBucket::new(Duration::from_millis(50), 1);
    let writer = Arc::new(MockWriteStream::default());

    for sn in 0u16..10 {
        pacer.enqueue(packet(sn, &writer, 0, 0, None));
    }
    pacer.stop();

    let sent = writer.wait_for(10).await;
    assert_eq!(sent.len(), 10);
}

#[tokio::test]
async fn test_bitrate_shapes_egress() {
    // 100 byte payloads + headers at ~80 kbit/s is ~10 ms per packet
    let pacer = LeakyBucket::new(Duration::from_millis(5), 80_000);
    let writer = Arc::new(MockWriteStream::default());

    let started = Instant::now();
    for sn in 0u16..20 {
        pacer.enqueue(packet(sn, &writer, 0, 0, None));
    }

    let sent = writer.wait_for(20).await;
    assert_eq!(sent.len(), 20);
    let elapsed = started.elapsed();
    assert!(
        elapsed >= Duration::from_millis(80),
        "sent too fast: {elapsed:?}"
    );
    pacer.stop();
}

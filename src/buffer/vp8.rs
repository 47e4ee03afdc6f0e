use bytes::{Bytes, BytesMut};

use crate::error::{Error, Result};

/// Vp8Descriptor is the parsed RFC 7741 payload descriptor of one VP8
/// packet, retained alongside the packet so per-subscriber munging does not
/// re-parse.
///
/// ```text
///       0 1 2 3 4 5 6 7
///      +-+-+-+-+-+-+-+-+
///      |X|R|N|S|R| PID | (REQUIRED)
///      +-+-+-+-+-+-+-+-+
/// X:   |I|L|T|K| RSV   | (OPTIONAL)
///      +-+-+-+-+-+-+-+-+
/// I:   |M| PictureID   | (OPTIONAL)
///      +-+-+-+-+-+-+-+-+
/// L:   |   tl0picidx   | (OPTIONAL)
///      +-+-+-+-+-+-+-+-+
/// T/K: |tid|Y| KEYIDX  | (OPTIONAL)
///      +-+-+-+-+-+-+-+-+
/// ```
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub struct Vp8Descriptor {
    pub start_of_partition: bool,
    pub partition_index: u8,

    pub i: bool,
    /// 15-bit picture id (M set); 7-bit otherwise.
    pub m: bool,
    pub picture_id: u16,
    pub picture_id_offset: usize,

    pub l: bool,
    pub tl0_pic_idx: u8,
    pub tl0_offset: usize,

    pub t: bool,
    pub tid: u8,
    pub y: bool,
    pub k: bool,
    pub key_idx: u8,
    pub tk_offset: usize,

    pub header_size: usize,
    pub is_key_frame: bool,
}

impl Vp8Descriptor {
    pub fn parse(payload: &[u8]) -> Result<Self> {
        if payload.is_empty() {
            return Err(Error::ErrPaddingOnlyPacket);
        }

        let mut desc = Vp8Descriptor::default();
        let b0 = payload[0];
        let x = b0 & 0x80 != 0;
        desc.start_of_partition = b0 & 0x10 != 0;
        desc.partition_index = b0 & 0x07;

        let mut idx = 1usize;
        if x {
            if payload.len() <= idx {
                return Err(Error::ErrBufferTooSmall);
            }
            let b1 = payload[idx];
            desc.i = b1 & 0x80 != 0;
            desc.l = b1 & 0x40 != 0;
            desc.t = b1 & 0x20 != 0;
            desc.k = b1 & 0x10 != 0;
            idx += 1;

            if desc.i {
                if payload.len() <= idx {
                    return Err(Error::ErrBufferTooSmall);
                }
                desc.picture_id_offset = idx;
                desc.m = payload[idx] & 0x80 != 0;
                if desc.m {
                    if payload.len() <= idx + 1 {
                        return Err(Error::ErrBufferTooSmall);
                    }
                    desc.picture_id =
                        (((payload[idx] & 0x7f) as u16) << 8) | payload[idx + 1] as u16;
                    idx += 2;
                } else {
                    desc.picture_id = (payload[idx] & 0x7f) as u16;
                    idx += 1;
                }
            }

            if desc.l {
                if payload.len() <= idx {
                    return Err(Error::ErrBufferTooSmall);
                }
                desc.tl0_offset = idx;
                desc.tl0_pic_idx = payload[idx];
                idx += 1;
            }

            if desc.t || desc.k {
                if payload.len() <= idx {
                    return Err(Error::ErrBufferTooSmall);
                }
                desc.tk_offset = idx;
                desc.tid = (payload[idx] >> 6) & 0x03;
                desc.y = payload[idx] & 0x20 != 0;
                desc.key_idx = payload[idx] & 0x1f;
                idx += 1;
            }
        }

        if payload.len() <= idx {
            return Err(Error::ErrBufferTooSmall);
        }
        desc.header_size = idx;
        // P bit of the VP8 frame header, 0 on a key frame, only meaningful
        // on the first packet of the first partition
        desc.is_key_frame = desc.start_of_partition
            && desc.partition_index == 0
            && payload[idx] & 0x01 == 0;
        Ok(desc)
    }

    /// Copies `payload` and patches picture id and tl0picidx in place. The
    /// field widths are preserved: a 7-bit picture id stays 7-bit.
    pub fn rewrite(&self, payload: &[u8], picture_id: u16, tl0_pic_idx: u8) -> Bytes {
        let mut out = BytesMut::from(payload);
        if self.i {
            if self.m {
                out[self.picture_id_offset] = 0x80 | ((picture_id >> 8) & 0x7f) as u8;
                out[self.picture_id_offset + 1] = (picture_id & 0xff) as u8;
            } else {
                out[self.picture_id_offset] = (picture_id & 0x7f) as u8;
            }
        }
        if self.l {
            out[self.tl0_offset] = tl0_pic_idx;
        }
        out.freeze()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    // X, I(M 15-bit), L, T set; picture id 0x1234, tl0 9, tid 1
    fn packet(key_frame: bool) -> Vec<u8> {
        let frame_b0 = if key_frame { 0x00 } else { 0x01 };
        vec![0x90, 0xe0, 0x92, 0x34, 0x09, 0x40, frame_b0, 0xaa, 0xbb]
    }

    #[test]
    fn test_parse_full_descriptor() {
        let desc = Vp8Descriptor::parse(&packet(true)).unwrap();
        assert!(desc.start_of_partition);
        assert!(desc.i && desc.m && desc.l && desc.t);
        assert_eq!(desc.picture_id, 0x1234);
        assert_eq!(desc.tl0_pic_idx, 9);
        assert_eq!(desc.tid, 1);
        assert_eq!(desc.header_size, 6);
        assert!(desc.is_key_frame);

        let delta = Vp8Descriptor::parse(&packet(false)).unwrap();
        assert!(!delta.is_key_frame);
    }

    #[test]
    fn test_parse_minimal_descriptor() {
        let payload = [0x10u8, 0x00, 0xaa];
        let desc = Vp8Descriptor::parse(&payload).unwrap();
        assert!(desc.start_of_partition);
        assert!(!desc.i && !desc.l && !desc.t && !desc.k);
        assert_eq!(desc.header_size, 1);
        assert!(desc.is_key_frame);
    }

    #[test]
    fn test_parse_short_payload() {
        assert!(Vp8Descriptor::parse(&[]).is_err());
        assert!(Vp8Descriptor::parse(&[0x90]).is_err());
        assert!(Vp8Descriptor::parse(&[0x90, 0x80]).is_err());
    }

    #[test]
    fn test_rewrite_patches_in_place() {
        let raw = packet(true);
        let desc = Vp8Descriptor::parse(&raw).unwrap();

        let rewritten = desc.rewrite(&raw, 0x7fff, 42);
        let reparsed = Vp8Descriptor::parse(&rewritten).unwrap();
        assert_eq!(reparsed.picture_id, 0x7fff);
        assert_eq!(reparsed.tl0_pic_idx, 42);
        // everything else untouched
        assert_eq!(reparsed.tid, desc.tid);
        assert_eq!(rewritten[6..], raw[6..]);
    }

    #[test]
    fn test_rewrite_seven_bit_picture_id() {
        // I set, M clear: 7-bit picture id
        let raw = [0x90u8, 0x80, 0x12, 0x00, 0xcc];
        let desc = Vp8Descriptor::parse(&raw).unwrap();
        assert!(!desc.m);
        assert_eq!(desc.picture_id, 0x12);

        let rewritten = desc.rewrite(&raw, 0x45, 0);
        let reparsed = Vp8Descriptor::parse(&rewritten).unwrap();
        assert_eq!(reparsed.picture_id, 0x45);
    }
}

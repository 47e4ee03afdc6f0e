use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug, PartialEq)]
#[non_exhaustive]
pub enum Error {
    #[error("buffer is closed")]
    ErrBufferClosed,
    #[error("receiver closed")]
    ErrReceiverClosed,
    #[error("DownTrack already exist")]
    ErrDownTrackAlreadyExist,
    #[error("buffer not found")]
    ErrBufferNotFound,
    #[error("already bound")]
    ErrDownTrackAlreadyBound,
    #[error("DownTrack is closed")]
    ErrDownTrackClosed,
    #[error("unknown kind of codec")]
    ErrUnknownKind,

    #[error("out-of-order sequence number not found in cache")]
    ErrOutOfOrderSequenceNumberCacheMiss,
    #[error("padding only packet that need not be forwarded")]
    ErrPaddingOnlyPacket,
    #[error("duplicate packet")]
    ErrDuplicatePacket,
    #[error("padding cannot send on non-frame boundary")]
    ErrPaddingNotOnFrameBoundary,

    #[error("packet not found in cache")]
    ErrPacketNotFound,
    #[error("packet too old to be in cache")]
    ErrPacketTooOld,
    #[error("sequence number does not match cached packet")]
    ErrPacketMismatch,
    #[error("packet already in cache, retransmission")]
    ErrRtxPacket,
    #[error("packet size exceeds cache slot")]
    ErrPacketTooLarge,
    #[error("buffer too small for packet")]
    ErrBufferTooSmall,

    #[error("SSRC does not match buffer")]
    ErrSsrcMismatch,
    #[error("frame dependency structure not available")]
    ErrMissingStructure,
    #[error("malformed dependency descriptor")]
    ErrMalformedDescriptor,
    #[error("insufficient space in bitstream")]
    ErrInsufficientSpace,
    #[error("value exceeds encodable range")]
    ErrValueOutOfRange,

    #[error("{0}")]
    Rtcp(#[from] rtcp::Error),
    #[error("{0}")]
    Rtp(#[from] rtp::Error),
    #[error("{0}")]
    Util(#[from] util::Error),

    #[error("{0}")]
    Other(String),
}

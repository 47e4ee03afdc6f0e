/// Header extension URIs the media core understands. The ids are negotiated
/// elsewhere; a [`StreamInfo`] carries the uri to id mapping agreed for one
/// stream.
pub const TRANSPORT_CC_URI: &str =
    "http://www.ietf.org/id/draft-holmer-rmcat-transport-wide-cc-extensions-01";
pub const AUDIO_LEVEL_URI: &str = "urn:ietf:params:rtp-hdrext:ssrc-audio-level";
pub const ABS_SEND_TIME_URI: &str = "http://www.webrtc.org/experiments/rtp-hdrext/abs-send-time";
pub const DEPENDENCY_DESCRIPTOR_URI: &str =
    "https://aomediacodec.github.io/av1-rtp-spec/#dependency-descriptor-rtp-header-extension";

pub type TrackId = String;
pub type ParticipantId = String;

/// MediaKind is the class of media a stream carries.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    #[default]
    Unspecified,
    Audio,
    Video,
}

impl MediaKind {
    pub fn from_mime(mime_type: &str) -> Self {
        let lower = mime_type.to_ascii_lowercase();
        if lower.starts_with("audio/") {
            MediaKind::Audio
        } else if lower.starts_with("video/") {
            MediaKind::Video
        } else {
            MediaKind::Unspecified
        }
    }
}

/// RtpHeaderExtension represents a negotiated RFC 8285 RTP header extension.
#[derive(Default, Debug, Clone)]
pub struct RtpHeaderExtension {
    pub uri: String,
    pub id: isize,
}

/// RtcpFeedback signals the connection to use additional RTCP packet types.
#[derive(Default, Debug, Clone)]
pub struct RtcpFeedback {
    /// valid: ack, ccm, nack, goog-remb, transport-cc
    pub typ: String,
    /// For example, type="nack" parameter="pli" will send Picture Loss
    /// Indicator packets.
    pub parameter: String,
}

/// RtpCodecParameters is the negotiated codec of one stream.
#[derive(Default, Debug, Clone)]
pub struct RtpCodecParameters {
    pub mime_type: String,
    pub payload_type: u8,
    pub clock_rate: u32,
    pub channels: u16,
    pub sdp_fmtp_line: String,
    pub rtcp_feedback: Vec<RtcpFeedback>,
}

impl RtpCodecParameters {
    pub fn kind(&self) -> MediaKind {
        MediaKind::from_mime(&self.mime_type)
    }
}

/// StreamInfo is passed when a Buffer is bound to a demuxed inbound stream.
#[derive(Default, Debug, Clone)]
pub struct StreamInfo {
    pub id: String,
    pub ssrc: u32,
    pub codec: RtpCodecParameters,
    pub rtp_header_extensions: Vec<RtpHeaderExtension>,
}

impl StreamInfo {
    /// Returns the negotiated id of the extension with `uri`, 0 if absent.
    pub fn extension_id(&self, uri: &str) -> u8 {
        self.rtp_header_extensions
            .iter()
            .find(|ext| ext.uri == uri)
            .map(|ext| ext.id as u8)
            .unwrap_or(0)
    }

    pub fn supports_nack(&self) -> bool {
        self.codec
            .rtcp_feedback
            .iter()
            .any(|fb| fb.typ == "nack" && fb.parameter.is_empty())
    }
}

/// VideoQuality is the publisher-facing name of a simulcast encoding.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum VideoQuality {
    Low,
    Medium,
    High,
    #[default]
    Off,
}

/// One published simulcast encoding as advertised by the publisher.
#[derive(Default, Debug, Clone)]
pub struct VideoLayerInfo {
    pub quality: VideoQuality,
    pub width: u32,
    pub height: u32,
    pub bitrate: u32,
}

/// TrackInfo is the publication metadata of one published track.
#[derive(Default, Debug, Clone)]
pub struct TrackInfo {
    pub track_id: TrackId,
    pub name: String,
    pub kind: MediaKind,
    pub muted: bool,
    pub layers: Vec<VideoLayerInfo>,
}

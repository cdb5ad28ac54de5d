//! SDP (Session Description Protocol) parsing (RFC 4566 / RFC 8866).
//!
//! Turns the DESCRIBE body into one [`TrackDescriptor`] per media section:
//!
//! ```text
//! v=0
//! o=- 1234567890 1 IN IP4 10.0.0.5
//! s=Camera
//! t=0 0
//! m=video 0 RTP/AVP 96                          ← media description
//! a=rtpmap:96 H264/90000                        ← codec/clock rate
//! a=fmtp:96 packetization-mode=1;sprop-...      ← codec parameters
//! a=control:trackID=1                           ← track control URL
//! ```
//!
//! Only the first payload format of each `m=` line is used.

use base64::prelude::{BASE64_STANDARD, Engine as _};
use bytes::Bytes;

use crate::media::MediaKind;

/// One media section of a session description.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackDescriptor {
    /// `a=control` value, resolved against the content base at SETUP.
    pub control: String,
    pub kind: MediaKind,
    pub payload_type: u8,
    /// RTP clock rate in Hz; `None` when neither `rtpmap` nor the static
    /// payload table (RFC 3551 §6) provides one.
    pub clock_rate: Option<u32>,
    pub codec: Codec,
}

/// Codec-specific attributes, used to pick the payload parser at SETUP.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Codec {
    H264(H264Params),
    H265(H265Params),
    G711 { law: G711Law, channels: u8 },
    Other { encoding: String },
}

impl Codec {
    pub fn name(&self) -> &str {
        match self {
            Self::H264(_) => "H264",
            Self::H265(_) => "H265",
            Self::G711 { law: G711Law::Mu, .. } => "PCMU",
            Self::G711 { law: G711Law::A, .. } => "PCMA",
            Self::Other { encoding } => encoding,
        }
    }
}

/// RFC 6184 §8.1 fmtp parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct H264Params {
    pub packetization_mode: u8,
    pub profile_level_id: Option<String>,
    /// Decoded `sprop-parameter-sets` NAL units (SPS, PPS), without start codes.
    pub parameter_sets: Vec<Bytes>,
}

/// RFC 7798 §7.1 fmtp parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct H265Params {
    /// `sprop-max-don-diff > 0`: every NAL unit carries a DONL field.
    pub has_donl: bool,
    /// Decoded `sprop-vps`, `sprop-sps`, `sprop-pps`, in that order.
    pub parameter_sets: Vec<Bytes>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum G711Law {
    Mu,
    A,
}

#[derive(Default)]
struct MediaSection {
    kind: Option<MediaKind>,
    payload_type: Option<u8>,
    control: String,
    encoding: Option<String>,
    clock_rate: Option<u32>,
    channels: Option<u8>,
    fmtp: Vec<(String, String)>,
}

/// Parse a session description into its media tracks.
///
/// Sections of unknown media type (`message`, ...) are skipped. A
/// description without any `m=` line yields no tracks.
pub fn parse_sdp(text: &str) -> Vec<TrackDescriptor> {
    let mut sections: Vec<MediaSection> = Vec::new();

    for line in text.lines() {
        let line = line.trim();

        if let Some(media) = line.strip_prefix("m=") {
            let mut fields = media.split_whitespace();
            let kind = fields.next().and_then(media_kind);
            let payload_type = fields.nth(2).and_then(|pt| pt.parse().ok());
            sections.push(MediaSection {
                kind,
                payload_type,
                ..Default::default()
            });
            continue;
        }

        // Session-level attributes are not needed.
        let Some(section) = sections.last_mut() else {
            continue;
        };
        let Some(attr) = line.strip_prefix("a=") else {
            continue;
        };

        if let Some(control) = attr.strip_prefix("control:") {
            section.control = control.trim().to_string();
        } else if let Some(rtpmap) = attr.strip_prefix("rtpmap:") {
            let Some((pt, mapping)) = rtpmap.split_once(' ') else {
                continue;
            };
            if pt.trim().parse::<u8>().ok() != section.payload_type {
                continue;
            }
            let mut parts = mapping.trim().split('/');
            section.encoding = parts.next().map(str::to_string);
            section.clock_rate = parts.next().and_then(|r| r.trim().parse().ok());
            section.channels = parts.next().and_then(|c| c.trim().parse().ok());
        } else if let Some(fmtp) = attr.strip_prefix("fmtp:") {
            let Some((pt, params)) = fmtp.split_once(' ') else {
                continue;
            };
            if pt.trim().parse::<u8>().ok() != section.payload_type {
                continue;
            }
            section.fmtp = params
                .split(';')
                .filter_map(|p| p.split_once('='))
                .map(|(k, v)| (k.trim().to_ascii_lowercase(), v.trim().to_string()))
                .collect();
        }
    }

    sections
        .into_iter()
        .filter_map(|section| {
            let track = into_descriptor(section);
            if track.is_none() {
                tracing::debug!("skipping SDP media section of unknown type");
            }
            track
        })
        .collect()
}

fn media_kind(name: &str) -> Option<MediaKind> {
    match name {
        "video" => Some(MediaKind::Video),
        "audio" => Some(MediaKind::Audio),
        "application" | "text" | "data" => Some(MediaKind::Data),
        _ => None,
    }
}

fn into_descriptor(section: MediaSection) -> Option<TrackDescriptor> {
    let kind = section.kind?;
    let payload_type = section.payload_type?;

    // RFC 3551 §6 static assignments.
    let (encoding, clock_rate, channels) = match (section.encoding, payload_type) {
        (Some(enc), _) => (enc, section.clock_rate, section.channels),
        (None, 0) => ("PCMU".to_string(), Some(8000), Some(1)),
        (None, 8) => ("PCMA".to_string(), Some(8000), Some(1)),
        (None, 14) => ("MPA".to_string(), Some(90000), None),
        (None, 26) => ("JPEG".to_string(), Some(90000), None),
        (None, pt) => (format!("PT{pt}"), None, None),
    };

    let fmtp = |name: &str| {
        section
            .fmtp
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    };

    let codec = match encoding.to_ascii_uppercase().as_str() {
        "H264" => Codec::H264(H264Params {
            packetization_mode: fmtp("packetization-mode")
                .and_then(|m| m.parse().ok())
                .unwrap_or(0),
            profile_level_id: fmtp("profile-level-id").map(str::to_string),
            parameter_sets: fmtp("sprop-parameter-sets")
                .map(decode_parameter_sets)
                .unwrap_or_default(),
        }),
        "H265" | "HEVC" => Codec::H265(H265Params {
            has_donl: fmtp("sprop-max-don-diff")
                .and_then(|d| d.parse::<u32>().ok())
                .is_some_and(|d| d > 0),
            parameter_sets: ["sprop-vps", "sprop-sps", "sprop-pps"]
                .into_iter()
                .filter_map(fmtp)
                .flat_map(decode_parameter_sets)
                .collect(),
        }),
        "PCMU" => Codec::G711 {
            law: G711Law::Mu,
            channels: channels.unwrap_or(1),
        },
        "PCMA" => Codec::G711 {
            law: G711Law::A,
            channels: channels.unwrap_or(1),
        },
        _ => Codec::Other { encoding },
    };

    Some(TrackDescriptor {
        control: section.control,
        kind,
        payload_type,
        clock_rate: clock_rate.filter(|&r| r > 0),
        codec,
    })
}

fn decode_parameter_sets(value: &str) -> Vec<Bytes> {
    value
        .split(',')
        .filter_map(|set| match BASE64_STANDARD.decode(set.trim()) {
            Ok(nal) if !nal.is_empty() => Some(Bytes::from(nal)),
            Ok(_) => None,
            Err(e) => {
                tracing::warn!(error = %e, "ignoring undecodable parameter set");
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const CAMERA_SDP: &str = "v=0\r\n\
        o=- 1 1 IN IP4 10.0.0.5\r\n\
        s=Camera\r\n\
        t=0 0\r\n\
        a=control:*\r\n\
        m=video 0 RTP/AVP 96\r\n\
        a=rtpmap:96 H264/90000\r\n\
        a=fmtp:96 packetization-mode=1;profile-level-id=42001f;sprop-parameter-sets=Z0IAH5WoFAFuQA==,aM48gA==\r\n\
        a=control:trackID=1\r\n\
        m=audio 0 RTP/AVP 0\r\n\
        a=control:trackID=2\r\n\
        m=application 0 RTP/AVP 107\r\n\
        a=rtpmap:107 vnd.onvif.metadata/90000\r\n\
        a=control:trackID=3\r\n";

    #[test]
    fn parses_camera_description() {
        let tracks = parse_sdp(CAMERA_SDP);
        assert_eq!(tracks.len(), 3);

        let video = &tracks[0];
        assert_eq!(video.kind, MediaKind::Video);
        assert_eq!(video.control, "trackID=1");
        assert_eq!(video.clock_rate, Some(90000));
        let Codec::H264(params) = &video.codec else {
            panic!("expected H264, got {:?}", video.codec);
        };
        assert_eq!(params.packetization_mode, 1);
        assert_eq!(params.profile_level_id.as_deref(), Some("42001f"));
        assert_eq!(params.parameter_sets.len(), 2);
        assert_eq!(params.parameter_sets[0][0] & 0x1f, 7);
        assert_eq!(params.parameter_sets[1][0] & 0x1f, 8);

        let audio = &tracks[1];
        assert_eq!(audio.kind, MediaKind::Audio);
        assert_eq!(audio.clock_rate, Some(8000));
        assert_eq!(
            audio.codec,
            Codec::G711 {
                law: G711Law::Mu,
                channels: 1
            }
        );

        let data = &tracks[2];
        assert_eq!(data.kind, MediaKind::Data);
        assert_eq!(data.codec.name(), "vnd.onvif.metadata");
    }

    #[test]
    fn parses_h265_with_donl() {
        let sdp = "v=0\r\nm=video 0 RTP/AVP 97\r\n\
                   a=rtpmap:97 H265/90000\r\n\
                   a=fmtp:97 sprop-max-don-diff=2;sprop-vps=QAEM;sprop-sps=QgEB;sprop-pps=RAHA\r\n\
                   a=control:track1\r\n";
        let tracks = parse_sdp(sdp);
        let Codec::H265(params) = &tracks[0].codec else {
            panic!("expected H265");
        };
        assert!(params.has_donl);
        assert_eq!(params.parameter_sets.len(), 3);
        assert_eq!((params.parameter_sets[0][0] >> 1) & 0x3f, 32);
    }

    #[test]
    fn unknown_media_types_skipped() {
        let sdp = "v=0\r\nm=message 0 RTP/AVP 100\r\nm=video 0 RTP/AVP 26\r\n";
        let tracks = parse_sdp(sdp);
        assert_eq!(tracks.len(), 1);
        assert_eq!(tracks[0].codec.name(), "JPEG");
        assert_eq!(tracks[0].control, "");
    }

    #[test]
    fn no_media_yields_no_tracks() {
        assert!(parse_sdp("v=0\r\ns=empty\r\nt=0 0\r\n").is_empty());
    }

    #[test]
    fn missing_clock_rate() {
        let sdp = "v=0\r\nm=audio 0 RTP/AVP 98\r\na=rtpmap:98 opus\r\n";
        let tracks = parse_sdp(sdp);
        assert_eq!(tracks[0].clock_rate, None);
    }
}

use std::fmt;
use std::time::{Duration, SystemTime};

use bytes::Bytes;

/// Kind of a media track, from the SDP `m=` line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaKind {
    Video,
    Audio,
    /// `application`/`text` sections, e.g. ONVIF metadata.
    Data,
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Video => "video",
            Self::Audio => "audio",
            Self::Data => "data",
        })
    }
}

/// One reconstructed access unit, handed to the caller.
///
/// Video payloads are Annex B (start-code delimited) NAL units; audio and
/// data payloads are the RTP payload bytes as received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Index of the negotiated track, in SETUP order.
    pub track: usize,
    pub kind: MediaKind,
    pub timestamp: SystemTime,
    /// IDR (H.264) or IRAP (H.265) access unit.
    pub key_frame: bool,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(kind: MediaKind, timestamp: SystemTime, payload: Bytes) -> Self {
        Self {
            track: 0,
            kind,
            timestamp,
            key_frame: false,
            payload,
        }
    }

    pub fn with_key_frame(mut self, key_frame: bool) -> Self {
        self.key_frame = key_frame;
        self
    }

    pub fn with_track(mut self, track: usize) -> Self {
        self.track = track;
        self
    }
}

/// `base + offset`, or the wall clock when the offset is unknown (no clock
/// rate for the track).
pub fn frame_timestamp(base: SystemTime, offset: Option<Duration>) -> SystemTime {
    match offset {
        Some(offset) => base + offset,
        None => SystemTime::now(),
    }
}

#[cfg(test)]
mod tests {
    use std::time::UNIX_EPOCH;

    use super::*;

    #[test]
    fn timestamp_from_offset() {
        let base = UNIX_EPOCH + Duration::from_secs(1000);
        assert_eq!(
            frame_timestamp(base, Some(Duration::from_millis(40))),
            UNIX_EPOCH + Duration::from_millis(1_000_040)
        );
    }

    #[test]
    fn timestamp_without_clock_rate_uses_wall_clock() {
        let before = SystemTime::now();
        let ts = frame_timestamp(UNIX_EPOCH, None);
        assert!(ts >= before);
    }
}

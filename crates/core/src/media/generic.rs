use std::time::{Duration, SystemTime};

use bytes::{BufMut, Bytes, BytesMut};

use super::frame::{Frame, MediaKind, frame_timestamp};
use super::PayloadParser;

/// Codec-agnostic parser for G.711 and any encoding without a dedicated
/// depacketizer.
///
/// Audio and data tracks emit one frame per RTP payload (RFC 3551 §4.1:
/// audio packets carry whole frames). Video tracks concatenate payloads
/// until the marker bit.
#[derive(Debug)]
pub struct GenericParser {
    kind: MediaKind,
    base_time: SystemTime,
    pending: BytesMut,
}

impl GenericParser {
    pub fn new(kind: MediaKind, base_time: SystemTime) -> Self {
        Self {
            kind,
            base_time,
            pending: BytesMut::new(),
        }
    }
}

impl PayloadParser for GenericParser {
    fn parse(
        &mut self,
        time_offset: Option<Duration>,
        payload: &Bytes,
        marker: bool,
    ) -> Option<Frame> {
        let timestamp = frame_timestamp(self.base_time, time_offset);

        if self.kind != MediaKind::Video {
            return Some(Frame::new(self.kind, timestamp, payload.clone()));
        }

        self.pending.put_slice(payload);
        if !marker {
            return None;
        }
        let unit = self.pending.split().freeze();
        Some(Frame::new(self.kind, timestamp, unit))
    }

    fn reset_state(&mut self) {
        self.pending.clear();
    }

    fn base_time(&self) -> SystemTime {
        self.base_time
    }

    fn set_base_time(&mut self, base: SystemTime) {
        self.base_time = base;
    }
}

#[cfg(test)]
mod tests {
    use std::time::UNIX_EPOCH;

    use super::*;

    #[test]
    fn audio_passes_payload_through() {
        let mut p = GenericParser::new(MediaKind::Audio, UNIX_EPOCH);
        let payload = Bytes::from_static(&[0xd5; 160]);
        let frame = p
            .parse(Some(Duration::from_millis(20)), &payload, false)
            .unwrap();
        assert_eq!(frame.payload, payload);
        assert_eq!(frame.timestamp, UNIX_EPOCH + Duration::from_millis(20));
    }

    #[test]
    fn video_waits_for_marker() {
        let mut p = GenericParser::new(MediaKind::Video, UNIX_EPOCH);
        assert!(p.parse(None, &Bytes::from_static(&[1, 2]), false).is_none());
        let frame = p.parse(None, &Bytes::from_static(&[3]), true).unwrap();
        assert_eq!(&frame.payload[..], &[1, 2, 3]);
    }

    #[test]
    fn reset_drops_pending_video() {
        let mut p = GenericParser::new(MediaKind::Video, UNIX_EPOCH);
        p.parse(None, &Bytes::from_static(&[1, 2]), false);
        p.reset_state();
        let frame = p.parse(None, &Bytes::from_static(&[3]), true).unwrap();
        assert_eq!(&frame.payload[..], &[3]);
    }
}

use std::time::{Duration, SystemTime};

use bytes::{BufMut, Bytes, BytesMut};

use super::frame::{Frame, MediaKind, frame_timestamp};
use super::PayloadParser;
use crate::protocol::sdp::H264Params;

const START_CODE: [u8; 4] = [0x00, 0x00, 0x00, 0x01];

const NAL_IDR: u8 = 5;
const NAL_SPS: u8 = 7;
const NAL_PPS: u8 = 8;
const STAP_A: u8 = 24;
const FU_A: u8 = 28;

/// H.264 RTP depacketizer (RFC 6184).
///
/// Rebuilds Annex B access units from three payload structures:
///
/// - **Single NAL Unit** (§5.6): NAL types 1–23, copied as-is.
///
/// - **STAP-A** (§5.7.1): several NAL units in one packet, each preceded
///   by a 16-bit size.
///
/// - **FU-A** (§5.8): one NAL unit split over several packets:
///
///   ```text
///   FU indicator:  [F|NRI|Type=28]     (1 byte)
///   FU header:     [S|E|R|NAL_Type]    (1 byte)
///   Fragment data: [...]
///   ```
///
///   The original NAL header is `(indicator & 0xE0) | NAL_Type`.
///
/// An access unit ends with the RTP marker bit (§5.1). When an IDR unit
/// arrives without in-band SPS/PPS, the `sprop-parameter-sets` from SDP are
/// prepended so the frame is independently decodable.
#[derive(Debug)]
pub struct H264Parser {
    base_time: SystemTime,
    parameter_sets: Vec<Bytes>,
    access_unit: BytesMut,
    in_fragment: bool,
    has_sps: bool,
    has_pps: bool,
    key_frame: bool,
}

impl H264Parser {
    pub fn new(params: &H264Params, base_time: SystemTime) -> Self {
        Self {
            base_time,
            parameter_sets: params.parameter_sets.clone(),
            access_unit: BytesMut::new(),
            in_fragment: false,
            has_sps: false,
            has_pps: false,
            key_frame: false,
        }
    }

    fn push_nal(&mut self, nal: &[u8]) {
        let Some(&header) = nal.first() else {
            return;
        };
        self.note_nal_type(header & 0x1f);
        self.access_unit.put_slice(&START_CODE);
        self.access_unit.put_slice(nal);
    }

    fn note_nal_type(&mut self, nal_type: u8) {
        match nal_type {
            NAL_IDR => self.key_frame = true,
            NAL_SPS => self.has_sps = true,
            NAL_PPS => self.has_pps = true,
            _ => {}
        }
    }

    fn push_stap_a(&mut self, payload: &[u8]) {
        let mut rest = &payload[1..];
        while rest.len() >= 2 {
            let size = u16::from_be_bytes([rest[0], rest[1]]) as usize;
            let Some(nal) = rest.get(2..2 + size) else {
                tracing::trace!(size, "truncated STAP-A unit");
                break;
            };
            self.push_nal(nal);
            rest = &rest[2 + size..];
        }
    }

    fn push_fu_a(&mut self, payload: &[u8]) {
        if payload.len() < 2 {
            return;
        }
        let indicator = payload[0];
        let fu_header = payload[1];
        let start = fu_header & 0x80 != 0;
        let nal_type = fu_header & 0x1f;

        if start {
            self.note_nal_type(nal_type);
            self.access_unit.put_slice(&START_CODE);
            self.access_unit.put_u8((indicator & 0xe0) | nal_type);
            self.in_fragment = true;
        } else if !self.in_fragment {
            // Continuation without a start fragment; the start was lost.
            return;
        }

        self.access_unit.put_slice(&payload[2..]);

        if fu_header & 0x40 != 0 {
            self.in_fragment = false;
        }
    }

    fn take_access_unit(&mut self, time_offset: Option<Duration>) -> Option<Frame> {
        if self.access_unit.is_empty() {
            self.reset_state();
            return None;
        }

        let key_frame = self.key_frame;
        let payload = if key_frame && !(self.has_sps && self.has_pps) && !self.parameter_sets.is_empty()
        {
            let mut with_params = BytesMut::new();
            for set in &self.parameter_sets {
                with_params.put_slice(&START_CODE);
                with_params.put_slice(set);
            }
            with_params.put_slice(&self.access_unit);
            with_params.freeze()
        } else {
            self.access_unit.split().freeze()
        };
        self.reset_state();

        let timestamp = frame_timestamp(self.base_time, time_offset);
        Some(Frame::new(MediaKind::Video, timestamp, payload).with_key_frame(key_frame))
    }
}

impl PayloadParser for H264Parser {
    fn parse(
        &mut self,
        time_offset: Option<Duration>,
        payload: &Bytes,
        marker: bool,
    ) -> Option<Frame> {
        let nal_type = payload.first()? & 0x1f;

        match nal_type {
            1..=23 => self.push_nal(payload),
            STAP_A => self.push_stap_a(payload),
            FU_A => self.push_fu_a(payload),
            other => tracing::trace!(nal_type = other, "unsupported H.264 packetization"),
        }

        if marker {
            self.take_access_unit(time_offset)
        } else {
            None
        }
    }

    fn reset_state(&mut self) {
        self.access_unit.clear();
        self.in_fragment = false;
        self.has_sps = false;
        self.has_pps = false;
        self.key_frame = false;
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

    const SPS: &[u8] = &[0x67, 0x42, 0x00, 0x1f];
    const PPS: &[u8] = &[0x68, 0xce, 0x3c, 0x80];

    fn parser() -> H264Parser {
        H264Parser::new(&H264Params::default(), UNIX_EPOCH)
    }

    fn feed(p: &mut H264Parser, payload: &[u8], marker: bool) -> Option<Frame> {
        p.parse(Some(Duration::ZERO), &Bytes::copy_from_slice(payload), marker)
    }

    #[test]
    fn single_nal_units_concatenate_until_marker() {
        let mut p = parser();
        assert!(feed(&mut p, &[0x41, 0x01], false).is_none());
        let frame = feed(&mut p, &[0x41, 0x02], true).unwrap();
        assert_eq!(
            &frame.payload[..],
            &[0, 0, 0, 1, 0x41, 0x01, 0, 0, 0, 1, 0x41, 0x02]
        );
        assert!(!frame.key_frame);
        assert_eq!(frame.kind, MediaKind::Video);
    }

    #[test]
    fn stap_a_unpacks_all_units() {
        let mut p = parser();
        let mut stap = vec![STAP_A];
        for nal in [SPS, PPS, &[0x65, 0xAA][..]] {
            stap.extend_from_slice(&(nal.len() as u16).to_be_bytes());
            stap.extend_from_slice(nal);
        }
        let frame = feed(&mut p, &stap, true).unwrap();
        assert!(frame.key_frame);
        let mut expected = Vec::new();
        for nal in [SPS, PPS, &[0x65, 0xAA][..]] {
            expected.extend_from_slice(&START_CODE);
            expected.extend_from_slice(nal);
        }
        assert_eq!(&frame.payload[..], &expected[..]);
    }

    #[test]
    fn fu_a_reassembles_nal_header() {
        let mut p = parser();
        // NRI=3, type=5 (IDR) split in three fragments.
        assert!(feed(&mut p, &[0x7c, 0x85, 1, 2], false).is_none());
        assert!(feed(&mut p, &[0x7c, 0x05, 3], false).is_none());
        let frame = feed(&mut p, &[0x7c, 0x45, 4], true).unwrap();
        assert_eq!(&frame.payload[..], &[0, 0, 0, 1, 0x65, 1, 2, 3, 4]);
        assert!(frame.key_frame);
    }

    #[test]
    fn fu_a_without_start_is_dropped() {
        let mut p = parser();
        assert!(feed(&mut p, &[0x7c, 0x05, 3], false).is_none());
        assert!(feed(&mut p, &[0x7c, 0x45, 4], true).is_none());
    }

    #[test]
    fn out_of_band_parameter_sets_prepended_to_idr() {
        let params = H264Params {
            packetization_mode: 1,
            profile_level_id: None,
            parameter_sets: vec![Bytes::from_static(SPS), Bytes::from_static(PPS)],
        };
        let mut p = H264Parser::new(&params, UNIX_EPOCH);
        let frame = feed(&mut p, &[0x65, 0xAA], true).unwrap();
        assert!(frame.payload.starts_with(&[0, 0, 0, 1, 0x67]));
        assert!(frame.payload.ends_with(&[0, 0, 0, 1, 0x65, 0xAA]));

        // Non-IDR frames are left alone.
        let frame = feed(&mut p, &[0x41, 0xBB], true).unwrap();
        assert_eq!(&frame.payload[..], &[0, 0, 0, 1, 0x41, 0xBB]);
    }

    #[test]
    fn reset_discards_partial_unit_and_is_idempotent() {
        let mut p = parser();
        feed(&mut p, &[0x41, 0x01], false);
        p.reset_state();
        p.reset_state();
        assert!(p.access_unit.is_empty());
        let frame = feed(&mut p, &[0x41, 0x02], true).unwrap();
        assert_eq!(&frame.payload[..], &[0, 0, 0, 1, 0x41, 0x02]);
    }

    #[test]
    fn frame_timestamp_uses_base_and_offset() {
        let mut p = parser();
        p.set_base_time(UNIX_EPOCH + Duration::from_secs(10));
        let frame = p
            .parse(
                Some(Duration::from_millis(500)),
                &Bytes::from_static(&[0x41, 0]),
                true,
            )
            .unwrap();
        assert_eq!(frame.timestamp, UNIX_EPOCH + Duration::from_millis(10_500));
    }
}

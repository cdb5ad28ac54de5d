//! H.265 (HEVC) RTP depacketizer (RFC 7798).
//!
//! Key differences from H.264 (RFC 6184):
//!
//! - **2-byte NAL unit header** (vs 1-byte in H.264).
//!   The NAL type is in bits 1..6 of the first byte.
//!
//! - **Aggregation packets** (type 48, §4.4.2) and **fragmentation units**
//!   (type 49, §4.4.3) replace STAP-A and FU-A. The FU header has a 6-bit
//!   NAL type field.
//!
//! - **DONL**: when `sprop-max-don-diff > 0`, a 16-bit decoding order
//!   number follows the payload header of single NAL units, the first unit
//!   of an AP and the first fragment of an FU; later AP units carry an
//!   8-bit DOND instead.

use std::time::{Duration, SystemTime};

use bytes::{BufMut, Bytes, BytesMut};

use super::frame::{Frame, MediaKind, frame_timestamp};
use super::PayloadParser;
use crate::protocol::sdp::H265Params;

const START_CODE: [u8; 4] = [0x00, 0x00, 0x00, 0x01];

const NAL_VPS: u8 = 32;
const NAL_SPS: u8 = 33;
const NAL_PPS: u8 = 34;
const AGGREGATION: u8 = 48;
const FRAGMENTATION: u8 = 49;

fn nal_type(first_byte: u8) -> u8 {
    (first_byte >> 1) & 0x3f
}

/// Reassembles H.265 access units into Annex B, emitting on the marker bit.
#[derive(Debug)]
pub struct H265Parser {
    base_time: SystemTime,
    has_donl: bool,
    parameter_sets: Vec<Bytes>,
    access_unit: BytesMut,
    in_fragment: bool,
    has_parameter_sets: bool,
    key_frame: bool,
}

impl H265Parser {
    pub fn new(params: &H265Params, base_time: SystemTime) -> Self {
        Self {
            base_time,
            has_donl: params.has_donl,
            parameter_sets: params.parameter_sets.clone(),
            access_unit: BytesMut::new(),
            in_fragment: false,
            has_parameter_sets: false,
            key_frame: false,
        }
    }

    fn note_nal_type(&mut self, nal_type: u8) {
        match nal_type {
            // IRAP pictures: BLA, IDR, CRA (H.265 Table 7-1).
            16..=21 => self.key_frame = true,
            NAL_VPS | NAL_SPS | NAL_PPS => self.has_parameter_sets = true,
            _ => {}
        }
    }

    fn push_nal(&mut self, nal: &[u8]) {
        if nal.len() < 2 {
            return;
        }
        self.note_nal_type(nal_type(nal[0]));
        self.access_unit.put_slice(&START_CODE);
        self.access_unit.put_slice(nal);
    }

    fn push_single(&mut self, payload: &[u8]) {
        if self.has_donl {
            if payload.len() < 4 {
                return;
            }
            self.note_nal_type(nal_type(payload[0]));
            self.access_unit.put_slice(&START_CODE);
            self.access_unit.put_slice(&payload[..2]);
            self.access_unit.put_slice(&payload[4..]);
        } else {
            self.push_nal(payload);
        }
    }

    fn push_aggregation(&mut self, payload: &[u8]) {
        let mut rest = &payload[2..];
        let mut first = true;

        loop {
            if self.has_donl {
                let skip = if first { 2 } else { 1 };
                let Some(after) = rest.get(skip..) else {
                    break;
                };
                rest = after;
            }
            first = false;

            if rest.len() < 2 {
                break;
            }
            let size = u16::from_be_bytes([rest[0], rest[1]]) as usize;
            let Some(nal) = rest.get(2..2 + size) else {
                tracing::trace!(size, "truncated H.265 aggregation unit");
                break;
            };
            self.push_nal(nal);
            rest = &rest[2 + size..];
        }
    }

    fn push_fragment(&mut self, payload: &[u8]) {
        if payload.len() < 3 {
            return;
        }
        let fu_header = payload[2];
        let start = fu_header & 0x80 != 0;
        let fu_type = fu_header & 0x3f;
        let mut data = &payload[3..];

        if start {
            if self.has_donl {
                let Some(after) = data.get(2..) else {
                    return;
                };
                data = after;
            }
            self.note_nal_type(fu_type);
            self.access_unit.put_slice(&START_CODE);
            self.access_unit.put_u8((payload[0] & 0x81) | (fu_type << 1));
            self.access_unit.put_u8(payload[1]);
            self.in_fragment = true;
        } else if !self.in_fragment {
            return;
        }

        self.access_unit.put_slice(data);

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
        let payload = if key_frame && !self.has_parameter_sets && !self.parameter_sets.is_empty() {
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

impl PayloadParser for H265Parser {
    fn parse(
        &mut self,
        time_offset: Option<Duration>,
        payload: &Bytes,
        marker: bool,
    ) -> Option<Frame> {
        if payload.len() < 2 {
            tracing::trace!(len = payload.len(), "H.265 payload shorter than a NAL header");
        } else {
            match nal_type(payload[0]) {
                AGGREGATION => self.push_aggregation(payload),
                FRAGMENTATION => self.push_fragment(payload),
                t if t < AGGREGATION => self.push_single(payload),
                other => tracing::trace!(nal_type = other, "unsupported H.265 payload structure"),
            }
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
        self.has_parameter_sets = false;
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

    // NAL headers: type << 1 in the first byte, TID=1 in the second.
    const TRAIL: [u8; 2] = [0x02, 0x01]; // type 1
    const IDR: [u8; 2] = [0x26, 0x01]; // type 19
    const VPS: [u8; 3] = [0x40, 0x01, 0x0c];

    fn feed(p: &mut H265Parser, payload: &[u8], marker: bool) -> Option<Frame> {
        p.parse(None, &Bytes::copy_from_slice(payload), marker)
    }

    #[test]
    fn single_nal_unit() {
        let mut p = H265Parser::new(&H265Params::default(), UNIX_EPOCH);
        let frame = feed(&mut p, &[TRAIL[0], TRAIL[1], 0xAA], true).unwrap();
        assert_eq!(&frame.payload[..], &[0, 0, 0, 1, 0x02, 0x01, 0xAA]);
        assert!(!frame.key_frame);
    }

    #[test]
    fn marker_on_short_payload_completes_unit() {
        let mut p = H265Parser::new(&H265Params::default(), UNIX_EPOCH);
        assert!(feed(&mut p, &[TRAIL[0], TRAIL[1], 0xAA], false).is_none());
        let frame = feed(&mut p, &[0x00], true).unwrap();
        assert_eq!(&frame.payload[..], &[0, 0, 0, 1, 0x02, 0x01, 0xAA]);
    }

    #[test]
    fn fragmentation_unit_rebuilds_header() {
        let mut p = H265Parser::new(&H265Params::default(), UNIX_EPOCH);
        let fu = [FRAGMENTATION << 1, 0x01];
        assert!(feed(&mut p, &[fu[0], fu[1], 0x80 | 19, 1, 2], false).is_none());
        let frame = feed(&mut p, &[fu[0], fu[1], 0x40 | 19, 3], true).unwrap();
        assert_eq!(&frame.payload[..], &[0, 0, 0, 1, IDR[0], IDR[1], 1, 2, 3]);
        assert!(frame.key_frame);
    }

    #[test]
    fn aggregation_with_donl() {
        let params = H265Params {
            has_donl: true,
            parameter_sets: Vec::new(),
        };
        let mut p = H265Parser::new(&params, UNIX_EPOCH);

        let mut ap = vec![AGGREGATION << 1, 0x01];
        ap.extend_from_slice(&[0x00, 0x07]); // DONL
        ap.extend_from_slice(&(VPS.len() as u16).to_be_bytes());
        ap.extend_from_slice(&VPS);
        ap.push(0x01); // DOND
        ap.extend_from_slice(&3u16.to_be_bytes());
        ap.extend_from_slice(&[IDR[0], IDR[1], 0xEE]);

        let frame = feed(&mut p, &ap, true).unwrap();
        let mut expected = vec![0, 0, 0, 1];
        expected.extend_from_slice(&VPS);
        expected.extend_from_slice(&[0, 0, 0, 1, IDR[0], IDR[1], 0xEE]);
        assert_eq!(&frame.payload[..], &expected[..]);
        assert!(frame.key_frame);
    }

    #[test]
    fn single_nal_with_donl_strips_it() {
        let params = H265Params {
            has_donl: true,
            parameter_sets: Vec::new(),
        };
        let mut p = H265Parser::new(&params, UNIX_EPOCH);
        let frame = feed(&mut p, &[TRAIL[0], TRAIL[1], 0x00, 0x05, 0xAB], true).unwrap();
        assert_eq!(&frame.payload[..], &[0, 0, 0, 1, 0x02, 0x01, 0xAB]);
    }

    #[test]
    fn parameter_sets_prepended_to_irap() {
        let params = H265Params {
            has_donl: false,
            parameter_sets: vec![Bytes::from_static(&VPS)],
        };
        let mut p = H265Parser::new(&params, UNIX_EPOCH);
        let frame = feed(&mut p, &[IDR[0], IDR[1], 0x10], true).unwrap();
        assert!(frame.payload.starts_with(&[0, 0, 0, 1, 0x40, 0x01, 0x0c]));
    }

    #[test]
    fn reset_is_idempotent() {
        let mut p = H265Parser::new(&H265Params::default(), UNIX_EPOCH);
        feed(&mut p, &[TRAIL[0], TRAIL[1], 0xAA], false);
        p.reset_state();
        p.reset_state();
        assert!(p.access_unit.is_empty());
        assert!(!p.in_fragment);
    }
}

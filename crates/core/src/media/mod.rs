//! RTP packet parsing and codec depacketization.
//!
//! This module provides the [`PayloadParser`] trait and codec-specific
//! implementations that turn ordered RTP payloads back into access units.
//!
//! ## RTP overview (RFC 3550)
//!
//! Every RTP packet carries a 12-byte fixed header ([`rtp::RtpPacket`])
//! containing:
//!
//! - **Sequence number** (16-bit, wrapping): for reordering and loss detection.
//! - **Timestamp** (32-bit): media clock, typically 90 kHz for video.
//! - **SSRC** (32-bit): identifies the sender.
//! - **Marker bit**: set on the last packet of an access unit (frame).
//!
//! ## Supported codecs
//!
//! | Codec | Module | RFC |
//! |-------|--------|-----|
//! | H.264 | [`h264`] | [RFC 6184](https://tools.ietf.org/html/rfc6184) |
//! | H.265 | [`h265`] | [RFC 7798](https://tools.ietf.org/html/rfc7798) |
//! | G.711 and anything else | [`generic`] | [RFC 3551](https://tools.ietf.org/html/rfc3551) |

pub mod frame;
pub mod generic;
pub mod h264;
pub mod h265;
pub mod rtp;

use std::time::{Duration, SystemTime};

use bytes::Bytes;

pub use frame::{Frame, MediaKind};

use crate::protocol::sdp::{Codec, TrackDescriptor};

/// Codec-specific RTP depacketizer.
///
/// The stream engine calls [`parse`](Self::parse) with payloads in
/// sequence order. A parser accumulates fragments of one access unit and
/// returns a [`Frame`] once the unit is complete (usually on the marker
/// bit), timestamped `base_time + time_offset`.
///
/// [`reset_state`](Self::reset_state) drops any partial access unit. It is
/// called after detected packet loss and after an RTCP time-base rebase,
/// and must be idempotent.
pub trait PayloadParser: Send {
    /// Feed one non-empty RTP payload.
    ///
    /// `time_offset` is the media time elapsed since the base time, or
    /// `None` when the track has no known clock rate.
    fn parse(&mut self, time_offset: Option<Duration>, payload: &Bytes, marker: bool)
    -> Option<Frame>;

    fn reset_state(&mut self);

    fn base_time(&self) -> SystemTime;

    fn set_base_time(&mut self, base: SystemTime);
}

/// Pick the parser matching a negotiated track's codec.
pub fn parser_for(track: &TrackDescriptor, base_time: SystemTime) -> Box<dyn PayloadParser> {
    match &track.codec {
        Codec::H264(params) => Box::new(h264::H264Parser::new(params, base_time)),
        Codec::H265(params) => Box::new(h265::H265Parser::new(params, base_time)),
        Codec::G711 { .. } | Codec::Other { .. } => {
            Box::new(generic::GenericParser::new(track.kind, base_time))
        }
    }
}

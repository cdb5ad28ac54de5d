//! Receive-side processing of one media track.
//!
//! ```text
//!  datagram / interleaved block
//!          │
//!          ▼
//!   RtpPacket::parse ──(malformed: drop)
//!          │
//!          ▼
//!   ReorderBuffer (UDP only)
//!          │ in sequence order
//!          ▼
//!   SequenceTracker ──(gap: parser.reset_state)
//!          │
//!          ▼
//!   PayloadParser ──► Frame
//! ```

pub mod reorder;
pub mod sequence;

use std::time::{Instant, SystemTime};

use bytes::Bytes;

use crate::media::rtp::RtpPacket;
use crate::media::{Frame, PayloadParser};

pub use reorder::ReorderBuffer;
pub use sequence::SequenceTracker;

/// Composes sequence tracking, optional reordering and payload parsing for
/// one negotiated track. Exactly one task owns each instance.
pub struct RtpStream {
    track: usize,
    tracker: SequenceTracker,
    parser: Box<dyn PayloadParser>,
    reorder: Option<ReorderBuffer>,
    remote_ssrc: Option<u32>,
}

impl RtpStream {
    pub fn new(track: usize, clock_rate: Option<u32>, parser: Box<dyn PayloadParser>) -> Self {
        Self {
            track,
            tracker: SequenceTracker::new(clock_rate),
            parser,
            reorder: None,
            remote_ssrc: None,
        }
    }

    /// Enable out-of-order reassembly (UDP delivery).
    pub fn with_reorder_buffer(mut self, buffer: ReorderBuffer) -> Self {
        self.reorder = Some(buffer);
        self
    }

    /// Handle one raw RTP packet. Malformed packets are dropped.
    pub fn process(&mut self, data: Bytes, now: Instant) -> Vec<Frame> {
        let Some(packet) = RtpPacket::parse(data) else {
            tracing::trace!(track = self.track, "dropping malformed RTP packet");
            return Vec::new();
        };

        match self.reorder.as_mut() {
            Some(buffer) => {
                let released = buffer.push(packet, now);
                released
                    .into_iter()
                    .filter_map(|p| self.process_immediately(p))
                    .collect()
            }
            None => self.process_immediately(packet).into_iter().collect(),
        }
    }

    /// Sequence processing for a packet already in delivery order.
    pub fn process_immediately(&mut self, packet: RtpPacket) -> Option<Frame> {
        self.remote_ssrc = Some(packet.ssrc);

        let lost = self.tracker.update(packet.sequence, packet.timestamp);
        if lost > 0 {
            tracing::debug!(track = self.track, lost, seq = packet.sequence, "RTP packet loss");
            self.parser.reset_state();
        }

        if packet.payload.is_empty() {
            return None;
        }

        let offset = self.tracker.time_offset();
        self.parser
            .parse(offset, &packet.payload, packet.marker)
            .map(|frame| frame.with_track(self.track))
    }

    /// Release packets whose reordering wait has expired.
    pub fn flush_expired(&mut self, now: Instant) -> Vec<Frame> {
        let Some(buffer) = self.reorder.as_mut() else {
            return Vec::new();
        };
        let released = buffer.flush_expired(now);
        released
            .into_iter()
            .filter_map(|p| self.process_immediately(p))
            .collect()
    }

    /// Next instant at which [`flush_expired`](Self::flush_expired) has work.
    pub fn deadline(&self) -> Option<Instant> {
        self.reorder.as_ref().and_then(ReorderBuffer::deadline)
    }

    /// Re-anchor frame timestamps on an RTCP sender report's NTP time.
    pub fn rebase(&mut self, base: SystemTime) {
        self.parser.set_base_time(base);
        self.parser.reset_state();
        self.tracker.reset_timestamp();
    }

    pub fn track(&self) -> usize {
        self.track
    }

    pub fn tracker(&self) -> &SequenceTracker {
        &self.tracker
    }

    pub fn tracker_mut(&mut self) -> &mut SequenceTracker {
        &mut self.tracker
    }

    /// SSRC of the sender, once a packet has been seen.
    pub fn remote_ssrc(&self) -> Option<u32> {
        self.remote_ssrc
    }
}

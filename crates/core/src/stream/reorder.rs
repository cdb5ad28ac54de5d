use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::media::rtp::RtpPacket;

/// Sequence numbers the buffer may hold ahead of the release point.
pub const DEFAULT_CAPACITY: usize = 256;

/// How long a gap may hold back later packets.
pub const DEFAULT_MAX_WAIT: Duration = Duration::from_millis(50);

/// Bounded out-of-order reassembly for UDP delivery.
///
/// Slot `i` holds the packet with sequence `next_seq + i`. Packets are
/// released as soon as they are contiguous with the release point; a gap is
/// skipped once the oldest buffered packet has waited
/// [`DEFAULT_MAX_WAIT`] or the window overflows. Packets behind the release
/// point are dropped as late or duplicate.
#[derive(Debug)]
pub struct ReorderBuffer {
    capacity: usize,
    max_wait: Duration,
    next_seq: Option<u16>,
    slots: VecDeque<Option<(RtpPacket, Instant)>>,
}

impl Default for ReorderBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY, DEFAULT_MAX_WAIT)
    }
}

impl ReorderBuffer {
    pub fn new(capacity: usize, max_wait: Duration) -> Self {
        Self {
            capacity: capacity.max(1),
            max_wait,
            next_seq: None,
            slots: VecDeque::new(),
        }
    }

    /// Insert a packet and return everything now releasable, in order.
    pub fn push(&mut self, packet: RtpPacket, now: Instant) -> Vec<RtpPacket> {
        let next = *self.next_seq.get_or_insert(packet.sequence);
        let offset = packet.sequence.wrapping_sub(next);
        let mut released = Vec::new();

        if offset >= 0x8000 {
            let behind = 0x1_0000 - usize::from(offset);
            if behind <= self.capacity {
                tracing::trace!(seq = packet.sequence, "dropping late RTP packet");
                return released;
            }
            // Far behind: the sender restarted its sequence space.
            self.drain_into(&mut released);
            self.next_seq = Some(packet.sequence);
            self.slots.push_back(Some((packet, now)));
            self.release_contiguous(&mut released);
            return released;
        }

        let mut offset = usize::from(offset);
        while offset >= self.capacity {
            match self.slots.pop_front() {
                Some(slot) => {
                    if let Some((p, _)) = slot {
                        released.push(p);
                    }
                    self.advance(1);
                    offset -= 1;
                }
                None => {
                    self.next_seq = Some(packet.sequence);
                    offset = 0;
                }
            }
        }

        if self.slots.len() <= offset {
            self.slots.resize_with(offset + 1, || None);
        }
        if self.slots[offset].is_some() {
            tracing::trace!(seq = packet.sequence, "dropping duplicate RTP packet");
        } else {
            self.slots[offset] = Some((packet, now));
        }

        self.release_contiguous(&mut released);
        released
    }

    /// Skip gaps whose oldest waiting packet has exceeded the wait bound.
    pub fn flush_expired(&mut self, now: Instant) -> Vec<RtpPacket> {
        let mut released = Vec::new();

        while let Some(deadline) = self.deadline() {
            if deadline > now {
                break;
            }
            while let Some(None) = self.slots.front() {
                self.slots.pop_front();
                self.advance(1);
            }
            self.release_contiguous(&mut released);
        }
        released
    }

    /// When the oldest buffered packet stops waiting for its gap.
    pub fn deadline(&self) -> Option<Instant> {
        self.slots
            .iter()
            .flatten()
            .map(|(_, arrived)| *arrived + self.max_wait)
            .min()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(Option::is_none)
    }

    fn release_contiguous(&mut self, released: &mut Vec<RtpPacket>) {
        while let Some(Some(_)) = self.slots.front() {
            if let Some(Some((p, _))) = self.slots.pop_front() {
                released.push(p);
            }
            self.advance(1);
        }
    }

    fn drain_into(&mut self, released: &mut Vec<RtpPacket>) {
        released.extend(self.slots.drain(..).flatten().map(|(p, _)| p));
    }

    fn advance(&mut self, n: u16) {
        if let Some(next) = self.next_seq.as_mut() {
            *next = next.wrapping_add(n);
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;

    fn packet(seq: u16) -> RtpPacket {
        RtpPacket {
            payload_type: 96,
            sequence: seq,
            timestamp: 0,
            ssrc: 1,
            marker: false,
            payload: Bytes::from_static(&[1]),
        }
    }

    fn seqs(packets: Vec<RtpPacket>) -> Vec<u16> {
        packets.into_iter().map(|p| p.sequence).collect()
    }

    #[test]
    fn in_order_passes_straight_through() {
        let mut b = ReorderBuffer::default();
        let now = Instant::now();
        for seq in 10..20 {
            assert_eq!(seqs(b.push(packet(seq), now)), vec![seq]);
        }
        assert!(b.is_empty());
    }

    #[test]
    fn swapped_packets_are_reordered() {
        let mut b = ReorderBuffer::default();
        let now = Instant::now();
        assert_eq!(seqs(b.push(packet(1), now)), vec![1]);
        assert!(b.push(packet(3), now).is_empty());
        assert_eq!(seqs(b.push(packet(2), now)), vec![2, 3]);
    }

    #[test]
    fn gap_released_after_max_wait() {
        let mut b = ReorderBuffer::default();
        let start = Instant::now();
        b.push(packet(1), start);
        b.push(packet(3), start);
        b.push(packet(4), start + Duration::from_millis(10));

        assert_eq!(b.deadline(), Some(start + DEFAULT_MAX_WAIT));
        assert!(b.flush_expired(start + Duration::from_millis(49)).is_empty());
        assert_eq!(
            seqs(b.flush_expired(start + Duration::from_millis(50))),
            vec![3, 4]
        );

        // 2 arrives after its slot was skipped.
        assert!(b.push(packet(2), start + Duration::from_millis(60)).is_empty());
        assert_eq!(seqs(b.push(packet(5), start)), vec![5]);
    }

    #[test]
    fn window_overflow_skips_gap() {
        let mut b = ReorderBuffer::new(4, DEFAULT_MAX_WAIT);
        let now = Instant::now();
        b.push(packet(0), now);
        assert!(b.push(packet(2), now).is_empty());
        assert!(b.push(packet(4), now).is_empty());
        // Offset 4 from next=1 overflows capacity 4: slot 1 is skipped.
        assert_eq!(seqs(b.push(packet(5), now)), vec![2]);
        assert_eq!(seqs(b.push(packet(3), now)), vec![3, 4, 5]);
    }

    #[test]
    fn duplicates_are_dropped() {
        let mut b = ReorderBuffer::default();
        let now = Instant::now();
        b.push(packet(1), now);
        assert!(b.push(packet(1), now).is_empty());
        b.push(packet(3), now);
        assert!(b.push(packet(3), now).is_empty());
        assert_eq!(seqs(b.push(packet(2), now)), vec![2, 3]);
    }

    #[test]
    fn works_across_wraparound() {
        let mut b = ReorderBuffer::default();
        let now = Instant::now();
        b.push(packet(65534), now);
        assert!(b.push(packet(0), now).is_empty());
        assert_eq!(seqs(b.push(packet(65535), now)), vec![65535, 0]);
    }

    #[test]
    fn sequence_restart_resyncs() {
        let mut b = ReorderBuffer::default();
        let now = Instant::now();
        b.push(packet(40000), now);
        assert_eq!(seqs(b.push(packet(100), now)), vec![100]);
        assert_eq!(seqs(b.push(packet(101), now)), vec![101]);
    }
}

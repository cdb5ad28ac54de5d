use std::time::Duration;

/// Cumulative loss is a signed 24-bit field in receiver reports
/// (RFC 3550 §6.4.1); we saturate at its positive maximum.
pub const MAX_CUMULATIVE_LOST: u32 = 0x7F_FFFF;

/// Per-track sequence, loss and media-clock bookkeeping.
///
/// Owned by exactly one [`RtpStream`](super::RtpStream); never shared.
#[derive(Debug, Clone)]
pub struct SequenceTracker {
    clock_rate: Option<u32>,
    first_packet: bool,
    highest_seq: u16,
    prev_seq: u16,
    prev_timestamp: u32,
    cycles: u16,
    cumulative_lost: u32,
    lost_since_reset: u32,
    received_since_reset: u32,
    samples_sum: u64,
}

impl SequenceTracker {
    pub fn new(clock_rate: Option<u32>) -> Self {
        Self {
            clock_rate: clock_rate.filter(|&r| r > 0),
            first_packet: true,
            highest_seq: 0,
            prev_seq: 0,
            prev_timestamp: 0,
            cycles: 0,
            cumulative_lost: 0,
            lost_since_reset: 0,
            received_since_reset: 0,
            samples_sum: 0,
        }
    }

    /// Account for one packet and return how many packets were lost right
    /// before it.
    ///
    /// `delta = seq - prev_seq` in wrapping 16-bit arithmetic; any
    /// `delta != 1` is a gap of `delta - 1`. A repeated sequence number
    /// (`delta == 0`) therefore counts as 65535 lost.
    pub fn update(&mut self, seq: u16, timestamp: u32) -> u32 {
        let mut lost = 0;

        if !self.first_packet {
            let delta = seq.wrapping_sub(self.prev_seq);
            if delta != 1 {
                lost = if delta == 0 {
                    u32::from(u16::MAX)
                } else {
                    u32::from(delta) - 1
                };
                self.cumulative_lost = (self.cumulative_lost + lost).min(MAX_CUMULATIVE_LOST);
                self.lost_since_reset = self.lost_since_reset.saturating_add(lost);
            }

            if seq < self.highest_seq {
                self.cycles = self.cycles.wrapping_add(1);
            }

            let elapsed = timestamp.wrapping_sub(self.prev_timestamp) as i32;
            self.samples_sum += u64::from(elapsed.unsigned_abs());
        }

        self.first_packet = false;
        self.highest_seq = seq;
        self.prev_seq = seq;
        self.prev_timestamp = timestamp;
        self.received_since_reset = self.received_since_reset.saturating_add(1);

        lost
    }

    /// Media time elapsed since the last rebase, or `None` without a clock
    /// rate.
    pub fn time_offset(&self) -> Option<Duration> {
        let rate = u64::from(self.clock_rate?);
        Some(Duration::from_millis(self.samples_sum * 1000 / rate))
    }

    /// Start a new report interval.
    pub fn reset_counters(&mut self) {
        self.lost_since_reset = 0;
        self.received_since_reset = 0;
    }

    /// Restart the elapsed-samples accumulator after an RTCP rebase.
    pub fn reset_timestamp(&mut self) {
        self.samples_sum = 0;
    }

    pub fn highest_seq(&self) -> u16 {
        self.highest_seq
    }

    pub fn cycles(&self) -> u16 {
        self.cycles
    }

    /// `cycles << 16 | highest_seq` (RFC 3550 §6.4.1).
    pub fn extended_highest_seq(&self) -> u32 {
        (u32::from(self.cycles) << 16) | u32::from(self.highest_seq)
    }

    pub fn cumulative_lost(&self) -> u32 {
        self.cumulative_lost
    }

    pub fn lost_since_reset(&self) -> u32 {
        self.lost_since_reset
    }

    pub fn received_since_reset(&self) -> u32 {
        self.received_since_reset
    }

    pub fn has_received(&self) -> bool {
        !self.first_packet
    }
}

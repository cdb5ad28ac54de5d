use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use rand::Rng;

use super::{ReceiverReport, ReportBlock, write_bye, write_sdes_cname};
use crate::stream::SequenceTracker;

/// Fixed part of the report interval.
pub const REPORT_INTERVAL_BASE: Duration = Duration::from_millis(5000);

/// Upper bound (exclusive) of the random part, in milliseconds.
const REPORT_INTERVAL_JITTER_MS: u64 = 1000;

fn random_interval() -> Duration {
    REPORT_INTERVAL_BASE
        + Duration::from_millis(rand::rng().random_range(0..REPORT_INTERVAL_JITTER_MS))
}

/// Receiver-side RTCP for one track (RFC 3550 §6.4.2).
///
/// Builds `RR + SDES` compounds on a randomized schedule so that tracks do
/// not report in lockstep, remembers the last Sender Report for LSR/DLSR,
/// and produces the final `RR + BYE` exactly once.
#[derive(Debug)]
pub struct RtcpReporter {
    ssrc: u32,
    cname: String,
    next_report: Instant,
    last_sender_report: Option<(u32, Instant)>,
    goodbye_sent: bool,
}

impl RtcpReporter {
    /// Create with a random local SSRC (RFC 3550 §8.1).
    pub fn new(cname: &str, now: Instant) -> Self {
        let ssrc = rand::rng().random::<u32>();
        tracing::debug!(
            ssrc = format_args!("{:#010X}", ssrc),
            "RTCP reporter created"
        );
        Self {
            ssrc,
            cname: cname.to_string(),
            next_report: now + random_interval(),
            last_sender_report: None,
            goodbye_sent: false,
        }
    }

    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    pub fn next_report(&self) -> Instant {
        self.next_report
    }

    pub fn is_due(&self, now: Instant) -> bool {
        now >= self.next_report
    }

    /// Keep the middle 32 bits of an SR's NTP timestamp as LSR.
    pub fn record_sender_report(&mut self, ntp_timestamp: u64, received_at: Instant) {
        let middle = (ntp_timestamp >> 16) as u32;
        self.last_sender_report = Some((middle, received_at));
    }

    /// Build an `RR + SDES` compound, start a new report interval on the
    /// tracker and schedule the next report.
    pub fn report(
        &mut self,
        tracker: &mut SequenceTracker,
        remote_ssrc: Option<u32>,
        now: Instant,
    ) -> Bytes {
        let mut buf = BytesMut::with_capacity(64);
        self.receiver_report(tracker, remote_ssrc, now).write(&mut buf);
        write_sdes_cname(&mut buf, self.ssrc, &self.cname);

        tracker.reset_counters();
        self.next_report = now + random_interval();
        buf.freeze()
    }

    /// `RR + BYE`, once. Later calls return `None`.
    pub fn goodbye(
        &mut self,
        tracker: &SequenceTracker,
        remote_ssrc: Option<u32>,
        now: Instant,
    ) -> Option<Bytes> {
        if self.goodbye_sent {
            return None;
        }
        self.goodbye_sent = true;

        let mut buf = BytesMut::with_capacity(48);
        self.receiver_report(tracker, remote_ssrc, now).write(&mut buf);
        write_bye(&mut buf, self.ssrc);
        Some(buf.freeze())
    }

    fn receiver_report(
        &self,
        tracker: &SequenceTracker,
        remote_ssrc: Option<u32>,
        now: Instant,
    ) -> ReceiverReport {
        let blocks = match remote_ssrc {
            Some(ssrc) => vec![self.report_block(tracker, ssrc, now)],
            None => Vec::new(),
        };
        ReceiverReport {
            ssrc: self.ssrc,
            blocks,
        }
    }

    fn report_block(&self, tracker: &SequenceTracker, ssrc: u32, now: Instant) -> ReportBlock {
        let lost = u64::from(tracker.lost_since_reset());
        let expected = lost + u64::from(tracker.received_since_reset());
        let fraction_lost = if expected == 0 || lost == 0 {
            0
        } else {
            ((lost << 8) / expected).min(255) as u8
        };

        let (last_sr, delay_since_last_sr) = match self.last_sender_report {
            Some((lsr, at)) => {
                let delay = now.saturating_duration_since(at);
                let units = delay.as_micros() * 65536 / 1_000_000;
                (lsr, u32::try_from(units).unwrap_or(u32::MAX))
            }
            None => (0, 0),
        };

        ReportBlock {
            ssrc,
            fraction_lost,
            cumulative_lost: tracker.cumulative_lost(),
            extended_highest_seq: tracker.extended_highest_seq(),
            jitter: 0,
            last_sr,
            delay_since_last_sr,
        }
    }
}

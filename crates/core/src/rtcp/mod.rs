//! RTCP packets (RFC 3550 §6) and the per-track report scheduler.
//!
//! Only the subset a receiver needs is modelled: we send Receiver Reports,
//! SDES CNAME and BYE, and we read Sender Reports (for the NTP time base)
//! and BYE (session end). Everything else in a compound packet is skipped.
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |V=2|P|    RC   |      PT       |             length            |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! `length` counts 32-bit words minus one, header included.

pub mod reporter;

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::{BufMut, BytesMut};

pub use reporter::RtcpReporter;

pub const PT_SENDER_REPORT: u8 = 200;
pub const PT_RECEIVER_REPORT: u8 = 201;
pub const PT_SDES: u8 = 202;
pub const PT_BYE: u8 = 203;

const SDES_CNAME: u8 = 1;

/// Seconds between the NTP epoch (1900) and the Unix epoch (1970).
const NTP_UNIX_OFFSET: u64 = 2_208_988_800;

/// One reception report block (RFC 3550 §6.4.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportBlock {
    pub ssrc: u32,
    pub fraction_lost: u8,
    /// 24-bit on the wire.
    pub cumulative_lost: u32,
    pub extended_highest_seq: u32,
    pub jitter: u32,
    pub last_sr: u32,
    /// Units of 1/65536 s.
    pub delay_since_last_sr: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SenderReport {
    pub ssrc: u32,
    pub ntp_timestamp: u64,
    pub rtp_timestamp: u32,
    pub packet_count: u32,
    pub octet_count: u32,
    pub blocks: Vec<ReportBlock>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiverReport {
    pub ssrc: u32,
    pub blocks: Vec<ReportBlock>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RtcpPacket {
    SenderReport(SenderReport),
    ReceiverReport(ReceiverReport),
    Goodbye(Vec<u32>),
    /// Any other packet type, skipped by length.
    Other(u8),
}

fn write_header(buf: &mut BytesMut, count: u8, packet_type: u8, body_len: usize) {
    buf.put_u8(0x80 | (count & 0x1f));
    buf.put_u8(packet_type);
    buf.put_u16((body_len / 4) as u16);
}

impl ReportBlock {
    fn write(&self, buf: &mut BytesMut) {
        buf.put_u32(self.ssrc);
        buf.put_u8(self.fraction_lost);
        let lost = self.cumulative_lost.min(0x7F_FFFF);
        buf.put_slice(&lost.to_be_bytes()[1..]);
        buf.put_u32(self.extended_highest_seq);
        buf.put_u32(self.jitter);
        buf.put_u32(self.last_sr);
        buf.put_u32(self.delay_since_last_sr);
    }

    fn parse(b: &[u8]) -> Option<Self> {
        let b = b.get(..24)?;
        Some(Self {
            ssrc: be32(&b[0..4]),
            fraction_lost: b[4],
            cumulative_lost: u32::from_be_bytes([0, b[5], b[6], b[7]]),
            extended_highest_seq: be32(&b[8..12]),
            jitter: be32(&b[12..16]),
            last_sr: be32(&b[16..20]),
            delay_since_last_sr: be32(&b[20..24]),
        })
    }
}

impl ReceiverReport {
    pub fn write(&self, buf: &mut BytesMut) {
        write_header(buf, self.blocks.len() as u8, PT_RECEIVER_REPORT, 4 + 24 * self.blocks.len());
        buf.put_u32(self.ssrc);
        for block in &self.blocks {
            block.write(buf);
        }
    }
}

/// SDES packet with a single CNAME item (RFC 3550 §6.5.1).
pub fn write_sdes_cname(buf: &mut BytesMut, ssrc: u32, cname: &str) {
    let cname = &cname.as_bytes()[..cname.len().min(255)];
    // ssrc + type + length + text + at least one END byte, padded to 32 bits.
    let chunk_len = (4 + 2 + cname.len() + 1).div_ceil(4) * 4;
    write_header(buf, 1, PT_SDES, chunk_len);
    buf.put_u32(ssrc);
    buf.put_u8(SDES_CNAME);
    buf.put_u8(cname.len() as u8);
    buf.put_slice(cname);
    buf.put_bytes(0, chunk_len - 6 - cname.len());
}

pub fn write_bye(buf: &mut BytesMut, ssrc: u32) {
    write_header(buf, 1, PT_BYE, 4);
    buf.put_u32(ssrc);
}

/// Split a compound packet. Parsing stops at the first malformed packet;
/// what was parsed before it is kept.
pub fn parse_compound(data: &[u8]) -> Vec<RtcpPacket> {
    let mut packets = Vec::new();
    let mut rest = data;

    while rest.len() >= 4 {
        if rest[0] >> 6 != 2 {
            tracing::trace!("RTCP packet with bad version");
            break;
        }
        let count = (rest[0] & 0x1f) as usize;
        let packet_type = rest[1];
        let len = (u16::from_be_bytes([rest[2], rest[3]]) as usize + 1) * 4;
        let Some(packet) = rest.get(..len) else {
            tracing::trace!(len, "truncated RTCP packet");
            break;
        };
        let body = &packet[4..];

        let parsed = match packet_type {
            PT_SENDER_REPORT => parse_sender_report(body, count).map(RtcpPacket::SenderReport),
            PT_RECEIVER_REPORT => {
                parse_receiver_report(body, count).map(RtcpPacket::ReceiverReport)
            }
            PT_BYE => Some(RtcpPacket::Goodbye(
                body.chunks_exact(4).take(count).map(be32).collect(),
            )),
            other => Some(RtcpPacket::Other(other)),
        };
        match parsed {
            Some(p) => packets.push(p),
            None => break,
        }
        rest = &rest[len..];
    }
    packets
}

fn parse_sender_report(body: &[u8], count: usize) -> Option<SenderReport> {
    let head = body.get(..24)?;
    Some(SenderReport {
        ssrc: be32(&head[0..4]),
        ntp_timestamp: u64::from_be_bytes(head[4..12].try_into().ok()?),
        rtp_timestamp: be32(&head[12..16]),
        packet_count: be32(&head[16..20]),
        octet_count: be32(&head[20..24]),
        blocks: parse_blocks(&body[24..], count)?,
    })
}

fn parse_receiver_report(body: &[u8], count: usize) -> Option<ReceiverReport> {
    Some(ReceiverReport {
        ssrc: be32(body.get(..4)?),
        blocks: parse_blocks(&body[4..], count)?,
    })
}

fn parse_blocks(data: &[u8], count: usize) -> Option<Vec<ReportBlock>> {
    (0..count)
        .map(|i| ReportBlock::parse(data.get(i * 24..)?))
        .collect()
}

fn be32(b: &[u8]) -> u32 {
    u32::from_be_bytes([b[0], b[1], b[2], b[3]])
}

/// Convert a 64-bit NTP timestamp to wall-clock time, with millisecond
/// resolution (`fraction * 1000 / 2^32`). Times before 1970 yield `None`.
pub fn ntp_to_system_time(ntp: u64) -> Option<SystemTime> {
    let seconds = (ntp >> 32).checked_sub(NTP_UNIX_OFFSET)?;
    let millis = ((ntp & 0xFFFF_FFFF) * 1000) >> 32;
    Some(UNIX_EPOCH + Duration::from_secs(seconds) + Duration::from_millis(millis))
}

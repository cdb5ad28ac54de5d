use std::time::{Instant, SystemTime};

use crate::protocol::TrackDescriptor;
use crate::transport::UdpChannelPair;

/// How a track's RTP/RTCP reach us, as confirmed by SETUP.
#[derive(Debug, Clone)]
pub enum TrackBinding {
    /// Channels inside the control connection.
    Interleaved { rtp_channel: u8, rtcp_channel: u8 },
    /// A connected socket pair.
    Udp {
        pair: UdpChannelPair,
        server_rtp_port: u16,
        server_rtcp_port: u16,
    },
}

/// A track that survived filtering and SETUP.
#[derive(Debug, Clone)]
pub struct NegotiatedTrack {
    /// Position in SETUP order; copied onto every emitted frame.
    pub index: usize,
    pub descriptor: TrackDescriptor,
    pub binding: TrackBinding,
}

impl NegotiatedTrack {
    /// Whether this track already uses either of the given RTP/RTCP
    /// channels (interleaved) or server ports (UDP).
    pub(crate) fn claims(&self, rtp: u16, rtcp: u16) -> bool {
        let (own_rtp, own_rtcp) = match &self.binding {
            TrackBinding::Interleaved {
                rtp_channel,
                rtcp_channel,
            } => (u16::from(*rtp_channel), u16::from(*rtcp_channel)),
            TrackBinding::Udp {
                server_rtp_port,
                server_rtcp_port,
                ..
            } => (*server_rtp_port, *server_rtcp_port),
        };
        [rtp, rtcp].iter().any(|&n| n == own_rtp || n == own_rtcp)
    }
}

/// Messages into a track's receive task. The task is the only writer of
/// its stream, so other tracks reach it through these.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackCommand {
    /// Re-anchor frame timestamps on a new wall-clock base.
    Rebase(SystemTime),
    /// Remember a Sender Report of this track for LSR/DLSR.
    SenderReport { ntp: u64, received_at: Instant },
}

/// What DESCRIBE and SETUP produced, readable once connected.
#[derive(Debug, Clone)]
pub struct SessionDescription {
    /// DESCRIBE body as received.
    pub sdp: String,
    pub tracks: Vec<TrackDescriptor>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::MediaKind;
    use crate::protocol::Codec;

    fn track(binding: TrackBinding) -> NegotiatedTrack {
        NegotiatedTrack {
            index: 0,
            descriptor: TrackDescriptor {
                control: "trackID=1".into(),
                kind: MediaKind::Video,
                payload_type: 96,
                clock_rate: Some(90000),
                codec: Codec::Other {
                    encoding: "JPEG".into(),
                },
            },
            binding,
        }
    }

    #[test]
    fn interleaved_claims_both_channels() {
        let t = track(TrackBinding::Interleaved {
            rtp_channel: 0,
            rtcp_channel: 1,
        });
        assert!(t.claims(0, 1));
        // A later track whose RTP lands on our RTCP channel.
        assert!(t.claims(1, 2));
        assert!(!t.claims(2, 3));
    }

    #[tokio::test]
    async fn udp_claims_both_server_ports() {
        let pair = UdpChannelPair::bind("127.0.0.1".parse().unwrap())
            .await
            .unwrap();
        let t = track(TrackBinding::Udp {
            pair,
            server_rtp_port: 5000,
            server_rtcp_port: 5001,
        });
        assert!(t.claims(5000, 5001));
        assert!(t.claims(4999, 5000));
        assert!(t.claims(5001, 5002));
        assert!(!t.claims(5002, 5003));
    }
}

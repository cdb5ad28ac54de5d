//! Typed views of the response headers the session state machine consumes.

use std::net::IpAddr;
use std::time::Duration;

/// Session timeout assumed when the server does not send one (RFC 2326 §12.37).
pub const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(60);

/// The port or channel pair a server confirmed in its SETUP reply
/// (RFC 2326 §12.39).
///
/// ## Wire format example
///
/// ```text
/// Client → Server:
///   Transport: RTP/AVP;unicast;client_port=50000-50001
///
/// Server → Client:
///   Transport: RTP/AVP;unicast;client_port=50000-50001;server_port=6970-6971;source=10.0.0.5
/// ```
///
/// Interleaved replies carry `interleaved=0-1` instead of `server_port`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportHeader {
    /// RTP port (UDP) or channel (interleaved).
    pub rtp: u16,
    /// RTCP port (UDP) or channel (interleaved).
    pub rtcp: u16,
    /// `source=` address, when the media comes from a different host.
    pub source: Option<IpAddr>,
}

impl TransportHeader {
    /// Extract `server_port=RTP-RTCP` from a UDP SETUP reply.
    ///
    /// ```
    /// use rtsp_client::protocol::headers::TransportHeader;
    ///
    /// let th = TransportHeader::parse_server_ports("RTP/AVP;unicast;server_port=10000-10001").unwrap();
    /// assert_eq!(th.rtp, 10000);
    /// assert_eq!(th.rtcp, 10001);
    ///
    /// assert!(TransportHeader::parse_server_ports("RTP/AVP;unicast;server_port10000-10001").is_none());
    /// ```
    pub fn parse_server_ports(header: &str) -> Option<Self> {
        Self::parse(header, "server_port")
    }

    /// Extract `interleaved=RTP-RTCP` from an interleaved SETUP reply.
    pub fn parse_interleaved(header: &str) -> Option<Self> {
        Self::parse(header, "interleaved")
    }

    fn parse(header: &str, attribute: &str) -> Option<Self> {
        let mut pair = None;
        let mut source = None;

        for part in header.split(';') {
            let part = part.trim();

            if let Some(rest) = part.strip_prefix(attribute) {
                let (rtp, rtcp) = rest.trim_start().strip_prefix('=')?.split_once('-')?;
                pair = Some((rtp.trim().parse().ok()?, rtcp.trim().parse().ok()?));
            } else if let Some(addr) = part.strip_prefix("source=") {
                source = addr.trim().parse().ok();
            }
        }

        pair.map(|(rtp, rtcp)| TransportHeader { rtp, rtcp, source })
    }
}

/// `Session: <id>[;timeout=<seconds>]` (RFC 2326 §12.37).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionHeader {
    pub id: String,
    pub timeout: Duration,
}

impl SessionHeader {
    /// A missing, unparsable or zero timeout falls back to
    /// [`DEFAULT_SESSION_TIMEOUT`].
    pub fn parse(header: &str) -> Option<Self> {
        let mut parts = header.split(';');
        let id = parts.next()?.trim();
        if id.is_empty() {
            return None;
        }

        let timeout = parts
            .filter_map(|p| p.trim().strip_prefix("timeout="))
            .find_map(|t| t.trim().parse::<u64>().ok())
            .filter(|&secs| secs > 0)
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_SESSION_TIMEOUT);

        Some(SessionHeader {
            id: id.to_string(),
            timeout,
        })
    }
}

/// Whether an OPTIONS `Public` header lists GET_PARAMETER.
pub fn supports_get_parameter(public: Option<&str>) -> bool {
    public.is_some_and(|methods| {
        methods
            .split(',')
            .any(|m| m.trim().eq_ignore_ascii_case("GET_PARAMETER"))
    })
}
